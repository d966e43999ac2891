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
    ops::ControlFlow,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use bon::Builder;
use sha2::{Digest, Sha256};
use snafu::ResultExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn};

use super::{ObserverFactory, TransferStatistic};
use crate::{
    config::DownloaderConfig,
    downloader::{DownloadRequest, Downloader},
    error::{LocalIoSnafu, Result, ServiceSnafu, TransferError},
    monitor::UrlSource,
    range::average_parallel,
    service::{FileEntry, PanService},
    state::StateStore,
    task::{TaskExecutor, TaskInfo, TaskUnit, TaskUnitRunResult},
};

#[derive(Debug, Clone, Copy, Default)]
pub struct DownloadFlags {
    /// Mark downloaded files executable (unix only).
    pub executable: bool,
    /// Skip the checksum after a download.
    pub no_check:   bool,
    /// Download files that already exist locally.
    pub overwrite:  bool,
}

/// Immutable settings shared by every unit of one download batch.
#[derive(Builder)]
pub struct DownloadContext {
    pub service:   Arc<dyn PanService>,
    pub executor:  TaskExecutor,
    #[builder(default)]
    pub config:    DownloaderConfig,
    #[builder(default)]
    pub statistic: Arc<TransferStatistic>,
    #[builder(default)]
    pub flags:     DownloadFlags,
    /// Local directory remote paths are mirrored under.
    #[builder(into)]
    pub save_root: PathBuf,
    /// Files downloaded at the same time; splits `config.max_parallel`.
    #[builder(default = 1)]
    pub load:      usize,
    pub observers: Option<Arc<dyn ObserverFactory>>,
    /// Stops the whole batch. Running downloads save their progress first,
    /// units not started yet fail as cancelled.
    #[builder(default)]
    pub cancel:    CancellationToken,
}

#[derive(Debug, Clone)]
pub struct DownloadTarget {
    pub remote_path: String,
    pub save_path:   PathBuf,
    /// Metadata fetched by a parent listing; refreshed on retry.
    pub entry:       Option<FileEntry>,
}

/// Downloads one remote path. A directory expands into one unit per file.
pub struct DownloadTaskUnit {
    ctx:       Arc<DownloadContext>,
    target:    DownloadTarget,
    overwrite: bool,
}

impl DownloadTaskUnit {
    pub fn new(ctx: Arc<DownloadContext>, remote_path: impl Into<String>) -> Self {
        let remote_path = remote_path.into();
        let save_path = local_path(&ctx.save_root, &remote_path);
        let overwrite = ctx.flags.overwrite;
        Self {
            ctx,
            target: DownloadTarget {
                remote_path,
                save_path,
                entry: None,
            },
            overwrite,
        }
    }

    /// Save to `save_path` instead of the path mirrored under the save root.
    #[must_use]
    pub fn with_save_path(mut self, save_path: impl Into<PathBuf>) -> Self {
        self.target.save_path = save_path.into();
        self
    }

    /// A unit for a file found while listing this unit's directory.
    #[must_use]
    pub fn child(&self, entry: FileEntry) -> Self {
        Self {
            ctx:       Arc::clone(&self.ctx),
            target:    DownloadTarget {
                remote_path: entry.path.clone(),
                save_path:   local_path(&self.ctx.save_root, &entry.path),
                entry:       Some(entry),
            },
            overwrite: self.ctx.flags.overwrite,
        }
    }

    #[must_use]
    pub const fn target(&self) -> &DownloadTarget { &self.target }

    async fn expand_directory(&self, info: &TaskInfo) -> TaskUnitRunResult {
        // an empty remote directory still shows up locally
        if let Err(e) = tokio::fs::create_dir_all(&self.target.save_path).await {
            warn!(path = %self.target.save_path.display(), error = %e, "failed to create directory");
        }

        let mut files = Vec::new();
        let listed = self
            .ctx
            .service
            .list_recursive(&self.target.remote_path, &mut |entry: FileEntry| {
                if !entry.is_dir {
                    files.push(entry);
                }
                ControlFlow::Continue(())
            })
            .await;
        if let Err(source) = listed {
            return TaskUnitRunResult::failure(
                "listing directory failed",
                TransferError::Service { source },
            );
        }

        for entry in files {
            let path = entry.path.clone();
            let child = self.ctx.executor.append(self.child(entry), info.max_retry());
            info!(task = child.id(), parent = info.id(), path = %path, "queued for download");
        }
        TaskUnitRunResult::success_with("directory expanded")
    }

    async fn download(&self, info: &TaskInfo, entry: &FileEntry) -> Result<u64> {
        let save_path = &self.target.save_path;
        prepare_parent(save_path).await?;

        let mut config = self.ctx.config.clone();
        config.max_parallel = average_parallel(config.max_parallel, self.ctx.load);
        config.span = info_span!("download", task = info.id(), path = %entry.path);

        let request = DownloadRequest::builder()
            .destination(save_path.clone())
            .total_size(entry.size)
            .build();
        let source = Arc::new(ServiceUrl {
            service: Arc::clone(&self.ctx.service),
            file_id: entry.id.clone(),
        });
        let mut downloader = Downloader::new(config, request, source)?;
        if let Some(factory) = &self.ctx.observers {
            downloader = downloader.with_observer(factory.observe(info, save_path, entry.size));
        }

        let handle = downloader.handle();
        let running = downloader.execute();
        tokio::pin!(running);
        let outcome = tokio::select! {
            outcome = &mut running => outcome,
            () = self.ctx.cancel.cancelled() => {
                handle.cancel();
                running.await
            }
        };
        match outcome {
            Ok(summary) => Ok(summary.transferred),
            Err(e) => {
                remove_if_empty(save_path).await;
                Err(e)
            }
        }
    }

    async fn verify(&mut self, entry: &FileEntry) -> Option<TaskUnitRunResult> {
        if self.ctx.flags.no_check {
            return None;
        }
        if entry.banned {
            return Some(TaskUnitRunResult::failure(
                "checksum failed",
                TransferError::FileBanned {
                    path: entry.path.clone(),
                },
            ));
        }
        let expected = entry.sha256.as_deref()?.to_ascii_lowercase();

        let path = self.target.save_path.clone();
        let actual = match tokio::task::spawn_blocking(move || sha256_file(&path)).await {
            Ok(Ok(actual)) => actual,
            Ok(Err(e)) => return Some(TaskUnitRunResult::failure("checksum failed", e)),
            Err(e) => {
                return Some(TaskUnitRunResult::failure(
                    "checksum failed",
                    TransferError::ThreadPanic {
                        message: e.to_string(),
                    },
                ));
            }
        };
        if actual == expected {
            debug!(path = %self.target.save_path.display(), "checksum ok");
            return None;
        }
        // the retry must replace the corrupt file instead of skipping it
        self.overwrite = true;
        Some(TaskUnitRunResult::failure(
            "checksum failed",
            TransferError::ChecksumMismatch { expected, actual },
        ))
    }
}

#[async_trait]
impl TaskUnit for DownloadTaskUnit {
    async fn run(&mut self, info: &TaskInfo) -> TaskUnitRunResult {
        if self.ctx.cancel.is_cancelled() {
            return TaskUnitRunResult::failure("cancelled", TransferError::Cancelled);
        }
        self.ctx.statistic.start();

        if self.target.entry.is_none() || info.is_retry() {
            match self.ctx.service.file_info(&self.target.remote_path).await {
                Ok(entry) => self.target.entry = Some(entry),
                Err(source) => {
                    return TaskUnitRunResult::failure(
                        "fetching file info failed",
                        TransferError::Service { source },
                    );
                }
            }
        }
        let Some(entry) = self.target.entry.clone() else {
            return TaskUnitRunResult::failure(
                "fetching file info failed",
                TransferError::Service {
                    source: crate::service::ServiceError::not_found(&self.target.remote_path),
                },
            );
        };

        if entry.is_dir {
            return self.expand_directory(info).await;
        }

        if !self.overwrite && file_exists(&self.target.save_path).await {
            info!(task = info.id(), path = %self.target.save_path.display(), "file exists, skipping");
            return TaskUnitRunResult::success_with("file exists");
        }

        let transferred = match self.download(info, &entry).await {
            Ok(transferred) => transferred,
            Err(e) => return TaskUnitRunResult::failure("download failed", e),
        };

        if self.ctx.flags.executable {
            set_executable(&self.target.save_path).await;
        }

        if let Some(failed) = self.verify(&entry).await {
            return failed;
        }

        self.ctx.statistic.add(transferred);
        info!(task = info.id(), path = %self.target.save_path.display(), "download finished");
        TaskUnitRunResult::success()
    }

    fn on_retry(&mut self, info: &TaskInfo, last: &TaskUnitRunResult) {
        debug!(task = info.id(), retry = info.retry(), message = %last.message, "download retry scheduled");
    }

    fn label(&self) -> String { self.target.remote_path.clone() }
}

/// Resolves a fresh download URL for every worker spawn.
struct ServiceUrl {
    service: Arc<dyn PanService>,
    file_id: String,
}

#[async_trait]
impl UrlSource for ServiceUrl {
    async fn resolve(&self) -> Result<String> {
        self.service
            .download_url(&self.file_id)
            .await
            .context(ServiceSnafu)
    }
}

fn local_path(root: &Path, remote_path: &str) -> PathBuf {
    remote_path
        .split('/')
        .filter(|part| !part.is_empty() && *part != "." && *part != "..")
        .fold(root.to_path_buf(), |path, part| path.join(part))
}

/// A local file counts as present only when it has content and no resume
/// snapshot next to it.
async fn file_exists(path: &Path) -> bool {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.len() > 0 => !StateStore::for_destination(path).exists().await,
        _ => false,
    }
}

async fn prepare_parent(path: &Path) -> Result<()> {
    let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) else {
        return Ok(());
    };
    match tokio::fs::metadata(parent).await {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(TransferError::NotADirectory {
            path: parent.to_path_buf(),
        }),
        Err(_) => tokio::fs::create_dir_all(parent)
            .await
            .context(LocalIoSnafu { path: parent }),
    }
}

async fn remove_if_empty(path: &Path) {
    if let Ok(meta) = tokio::fs::metadata(path).await
        && meta.len() == 0
    {
        debug!(path = %path.display(), "removing empty file");
        if let Err(e) = tokio::fs::remove_file(path).await {
            warn!(path = %path.display(), error = %e, "failed to remove empty file");
        }
    }
}

#[cfg(unix)]
async fn set_executable(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    if let Err(e) = tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o766)).await {
        warn!(path = %path.display(), error = %e, "failed to set executable permission");
    }
}

#[cfg(not(unix))]
async fn set_executable(_path: &Path) {}

fn sha256_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path).context(LocalIoSnafu { path })?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher).context(LocalIoSnafu { path })?;
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_path_strips_traversal() {
        let root = Path::new("/data");
        assert_eq!(local_path(root, "/a/b.txt"), PathBuf::from("/data/a/b.txt"));
        assert_eq!(local_path(root, "/../etc/passwd"), PathBuf::from("/data/etc/passwd"));
        assert_eq!(local_path(root, "//x//y"), PathBuf::from("/data/x/y"));
    }

    #[tokio::test]
    async fn test_file_exists_rules() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin");
        assert!(!file_exists(&path).await);

        std::fs::write(&path, b"").unwrap();
        assert!(!file_exists(&path).await);

        std::fs::write(&path, b"data").unwrap();
        assert!(file_exists(&path).await);

        std::fs::write(StateStore::for_destination(&path).path(), b"{}").unwrap();
        assert!(!file_exists(&path).await);
    }

    #[tokio::test]
    async fn test_prepare_parent_rejects_file() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"x").unwrap();

        let err = prepare_parent(&blocker.join("child.bin")).await.unwrap_err();
        assert!(matches!(err, TransferError::NotADirectory { .. }));

        let nested = dir.path().join("a/b/c.bin");
        prepare_parent(&nested).await.unwrap();
        assert!(dir.path().join("a/b").is_dir());
    }

    #[test]
    fn test_sha256_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("abc");
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
