// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use bon::Builder;
use snafu::ResultExt;
use tracing::{info, info_span};

use super::{ObserverFactory, TransferStatistic};
use crate::{
    config::UploaderConfig,
    error::{LocalIoSnafu, Result},
    task::{TaskExecutor, TaskInfo, TaskUnit, TaskUnitRunResult},
    uploader::{MultiUpload, MultiUploader},
};

/// Opens the service-side multi-part session for one local file.
#[async_trait]
pub trait UploadTarget: Send + Sync {
    /// Implementations should hand back the same session id for a file whose
    /// earlier upload did not commit, so finished parts are not sent again.
    async fn open_session(
        &self,
        local_path: &Path,
        remote_path: &str,
        size: u64,
    ) -> Result<Arc<dyn MultiUpload>>;
}

/// Immutable settings shared by every unit of one upload batch.
#[derive(Builder)]
pub struct UploadContext {
    pub target:      Arc<dyn UploadTarget>,
    pub executor:    TaskExecutor,
    #[builder(default)]
    pub config:      UploaderConfig,
    #[builder(default)]
    pub statistic:   Arc<TransferStatistic>,
    /// Remote directory local files are uploaded into.
    #[builder(into)]
    pub remote_root: String,
    pub observers:   Option<Arc<dyn ObserverFactory>>,
}

/// Uploads one local path. A directory expands into one unit per entry.
pub struct UploadTaskUnit {
    ctx:         Arc<UploadContext>,
    local_path:  PathBuf,
    remote_path: String,
}

impl UploadTaskUnit {
    pub fn new(ctx: Arc<UploadContext>, local_path: impl Into<PathBuf>) -> Self {
        let local_path = local_path.into();
        let remote_path = remote_join(&ctx.remote_root, &local_path);
        Self {
            ctx,
            local_path,
            remote_path,
        }
    }

    fn child(&self, local_path: PathBuf) -> Self {
        Self {
            ctx: Arc::clone(&self.ctx),
            remote_path: remote_join(&self.remote_path, &local_path),
            local_path,
        }
    }

    #[must_use]
    pub fn remote_path(&self) -> &str { &self.remote_path }

    async fn expand_directory(&self, info: &TaskInfo) -> Result<()> {
        let path = &self.local_path;
        let mut entries = tokio::fs::read_dir(path)
            .await
            .context(LocalIoSnafu { path })?;
        let mut children = Vec::new();
        while let Some(entry) = entries.next_entry().await.context(LocalIoSnafu { path })? {
            children.push(entry.path());
        }
        children.sort();

        for child in children {
            let unit = self.child(child);
            let remote = unit.remote_path.clone();
            let queued = self.ctx.executor.append(unit, info.max_retry());
            info!(task = queued.id(), parent = info.id(), remote = %remote, "queued for upload");
        }
        Ok(())
    }

    async fn upload(&self, info: &TaskInfo, size: u64) -> Result<u64> {
        let upload = self
            .ctx
            .target
            .open_session(&self.local_path, &self.remote_path, size)
            .await?;

        let mut config = self.ctx.config.clone();
        config.span = info_span!("upload", task = info.id(), remote = %self.remote_path);
        let mut uploader = MultiUploader::new(config, &self.local_path, upload);
        if let Some(factory) = &self.ctx.observers {
            uploader = uploader.with_observer(factory.observe(info, &self.local_path, size));
        }
        let summary = uploader.execute().await?;
        Ok(summary.file_size)
    }
}

#[async_trait]
impl TaskUnit for UploadTaskUnit {
    async fn run(&mut self, info: &TaskInfo) -> TaskUnitRunResult {
        self.ctx.statistic.start();

        let path = &self.local_path;
        let meta = match tokio::fs::metadata(path).await.context(LocalIoSnafu { path }) {
            Ok(meta) => meta,
            Err(e) => return TaskUnitRunResult::failure("reading local file failed", e),
        };

        if meta.is_dir() {
            return match self.expand_directory(info).await {
                Ok(()) => TaskUnitRunResult::success_with("directory expanded"),
                Err(e) => TaskUnitRunResult::failure("listing directory failed", e),
            };
        }

        match self.upload(info, meta.len()).await {
            Ok(bytes) => {
                self.ctx.statistic.add(bytes);
                info!(task = info.id(), remote = %self.remote_path, "upload finished");
                TaskUnitRunResult::success()
            }
            Err(e) => TaskUnitRunResult::failure("upload failed", e),
        }
    }

    fn label(&self) -> String { self.local_path.display().to_string() }
}

fn remote_join(parent: &str, local_path: &Path) -> String {
    let name = local_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("{}/{name}", parent.trim_end_matches('/'))
}
