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

mod common;

use std::{collections::BTreeMap, ops::ControlFlow, sync::Arc, time::Duration};

use async_trait::async_trait;
use common::{AppState, create_temp_dir, create_test_server, payload, sha256_hex, url_for};
use panflow_base::readable_size::ReadableSize;
use panflow_transfer::{
    DownloadContext, DownloadFlags, DownloadTaskUnit, DownloaderConfig, ExecutorConfig, FileEntry,
    PanService, ServiceCode, ServiceError, StateStore, TaskExecutor, TransferError,
};

/// A remote tree whose every file serves the same bytes from `url`.
struct FakePan {
    url:     String,
    entries: BTreeMap<String, FileEntry>,
}

impl FakePan {
    fn new(url: String, size: u64, sha256: &str) -> Self {
        let mut entries = BTreeMap::new();
        let mut add = |path: &str, is_dir: bool| {
            let name = path.rsplit('/').next().unwrap_or_default().to_string();
            let mut entry = FileEntry::builder()
                .id(format!("id{}", entries.len()))
                .path(path)
                .name(name)
                .is_dir(is_dir)
                .build();
            if !is_dir {
                entry.size = size;
                entry.sha256 = Some(sha256.to_string());
            }
            entries.insert(path.to_string(), entry);
        };
        add("/docs", true);
        add("/docs/a.bin", false);
        add("/docs/sub", true);
        add("/docs/sub/b.bin", false);
        add("/single.bin", false);
        Self { url, entries }
    }

    fn with_entry(mut self, entry: FileEntry) -> Self {
        self.entries.insert(entry.path.clone(), entry);
        self
    }
}

#[async_trait]
impl PanService for FakePan {
    async fn file_info(&self, path: &str) -> Result<FileEntry, ServiceError> {
        self.entries
            .get(path)
            .cloned()
            .ok_or_else(|| ServiceError::not_found(path))
    }

    async fn download_url(&self, _file_id: &str) -> Result<String, ServiceError> { Ok(self.url.clone()) }

    async fn list_recursive(
        &self,
        path: &str,
        visit: &mut (dyn FnMut(FileEntry) -> ControlFlow<()> + Send),
    ) -> Result<(), ServiceError> {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        for entry in self.entries.values().filter(|e| e.path.starts_with(&prefix)) {
            if visit(entry.clone()).is_break() {
                break;
            }
        }
        Ok(())
    }
}

fn config() -> DownloaderConfig {
    DownloaderConfig {
        max_parallel: 2,
        reload_delay: Duration::from_millis(10),
        status_interval: Duration::from_millis(20),
        ..DownloaderConfig::default()
    }
}

#[tokio::test]
async fn executor_downloads_directory_and_reports_missing() {
    panflow_common_telemetry::init_default_ut_logging();
    let content = payload(200 * 1024);
    let server = create_test_server(AppState::new(&content));
    let pan = FakePan::new(url_for(&server, "/file"), content.len() as u64, &sha256_hex(&content));
    let out = create_temp_dir("batch");

    let executor = TaskExecutor::new(ExecutorConfig {
        parallel: 2,
        ..ExecutorConfig::default()
    });
    let ctx = Arc::new(
        DownloadContext::builder()
            .service(Arc::new(pan))
            .executor(executor.clone())
            .config(config())
            .save_root(out.path())
            .load(2)
            .build(),
    );
    executor.append(DownloadTaskUnit::new(Arc::clone(&ctx), "/docs"), 2);
    let missing = executor.append(DownloadTaskUnit::new(Arc::clone(&ctx), "/nope.bin"), 2);

    let summary = executor.execute().await;
    assert_eq!(summary.succeeded, 3);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.retried, 0);

    for file in ["docs/a.bin", "docs/sub/b.bin"] {
        let downloaded = tokio::fs::read(out.path().join(file)).await.unwrap();
        assert_eq!(downloaded, content, "{file}");
    }
    assert!(out.path().join("docs/sub").is_dir());
    assert_eq!(ctx.statistic.total_bytes(), 2 * content.len() as u64);
    assert_eq!(ctx.statistic.total_files(), 2);

    let failed = executor.failed();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].info.id(), missing.id());
    assert_eq!(failed[0].label, "/nope.bin");
    match &failed[0].result.error {
        Some(TransferError::Service { source }) => assert_eq!(source.code, ServiceCode::NotFound),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn executor_skips_existing_file_unless_overwrite() {
    let content = payload(64 * 1024);
    let server = create_test_server(AppState::new(&content));
    let url = url_for(&server, "/file");
    let digest = sha256_hex(&content);
    let out = create_temp_dir("skip");
    let local = out.path().join("single.bin");
    tokio::fs::write(&local, b"stale").await.unwrap();

    let executor = TaskExecutor::default();
    let ctx = Arc::new(
        DownloadContext::builder()
            .service(Arc::new(FakePan::new(url.clone(), content.len() as u64, &digest)))
            .executor(executor.clone())
            .config(config())
            .save_root(out.path())
            .build(),
    );
    executor.append(DownloadTaskUnit::new(ctx, "/single.bin"), 0);
    executor.execute().await;
    assert_eq!(tokio::fs::read(&local).await.unwrap(), b"stale");

    let ctx = Arc::new(
        DownloadContext::builder()
            .service(Arc::new(FakePan::new(url, content.len() as u64, &digest)))
            .executor(executor.clone())
            .config(config())
            .flags(DownloadFlags {
                overwrite: true,
                ..DownloadFlags::default()
            })
            .save_root(out.path())
            .build(),
    );
    executor.append(DownloadTaskUnit::new(ctx, "/single.bin"), 0);
    let summary = executor.execute().await;
    assert_eq!(summary.succeeded, 1);
    assert_eq!(tokio::fs::read(&local).await.unwrap(), content);
}

#[tokio::test]
async fn executor_rejects_banned_and_corrupt_files() {
    let content = payload(32 * 1024);
    let server = create_test_server(AppState::new(&content));
    let out = create_temp_dir("checksum");
    let size = content.len() as u64;
    let pan = FakePan::new(url_for(&server, "/file"), size, &sha256_hex(&content))
        .with_entry(
            FileEntry::builder()
                .id("banned")
                .path("/banned.bin")
                .name("banned.bin")
                .size(size)
                .banned(true)
                .build(),
        )
        .with_entry(
            FileEntry::builder()
                .id("corrupt")
                .path("/corrupt.bin")
                .name("corrupt.bin")
                .size(size)
                .sha256("00".repeat(32))
                .build(),
        );

    let executor = TaskExecutor::default();
    let ctx = Arc::new(
        DownloadContext::builder()
            .service(Arc::new(pan))
            .executor(executor.clone())
            .config(config())
            .save_root(out.path())
            .build(),
    );
    executor.append(DownloadTaskUnit::new(Arc::clone(&ctx), "/banned.bin"), 0);
    executor.append(DownloadTaskUnit::new(Arc::clone(&ctx), "/corrupt.bin"), 0);
    let summary = executor.execute().await;
    assert_eq!(summary.failed, 2);

    let failed = executor.failed();
    assert!(matches!(
        failed[0].result.error,
        Some(TransferError::FileBanned { .. })
    ));
    assert!(!failed[0].result.need_retry);
    assert!(matches!(
        failed[1].result.error,
        Some(TransferError::ChecksumMismatch { .. })
    ));
    assert!(failed[1].result.need_retry);
}

#[tokio::test]
async fn executor_cancel_keeps_progress_and_skips_queued_units() {
    let content = payload(768 * 1024);
    let state = AppState::new(&content);
    *state.faults.hang_from.lock().unwrap() = Some(512 * 1024);
    let hang_started = Arc::clone(&state.faults.hang_started);
    let server = create_test_server(state);
    let pan = FakePan::new(url_for(&server, "/file"), content.len() as u64, &sha256_hex(&content));
    let out = create_temp_dir("batch-cancel");
    let total = content.len() as u64;

    let executor = TaskExecutor::new(ExecutorConfig {
        parallel: 1,
        ..ExecutorConfig::default()
    });
    let ctx = Arc::new(
        DownloadContext::builder()
            .service(Arc::new(pan))
            .executor(executor.clone())
            .config(DownloaderConfig {
                max_parallel: 3,
                block_size: ReadableSize::kb(256),
                ..config()
            })
            .save_root(out.path())
            .build(),
    );
    executor.append(DownloadTaskUnit::new(Arc::clone(&ctx), "/single.bin"), 2);
    executor.append(DownloadTaskUnit::new(Arc::clone(&ctx), "/docs/a.bin"), 2);

    let running = tokio::spawn({
        let executor = executor.clone();
        async move { executor.execute().await }
    });
    hang_started.notified().await;
    ctx.cancel.cancel();

    let summary = tokio::time::timeout(Duration::from_secs(10), running)
        .await
        .expect("batch stops after cancel")
        .unwrap();
    assert_eq!(summary.succeeded, 0);
    assert_eq!(summary.failed, 2);
    assert_eq!(summary.retried, 0);

    let failed = executor.failed();
    assert_eq!(failed.len(), 2);
    assert!(
        failed
            .iter()
            .all(|task| matches!(task.result.error, Some(TransferError::Cancelled)))
    );

    let saved = StateStore::for_destination(&out.path().join("single.bin"))
        .load_instance(total)
        .await
        .unwrap()
        .expect("state kept after cancel");
    assert!(!saved.ranges.is_empty());
    assert!(saved.status.transferred() < total);
    assert!(!out.path().join("docs").join("a.bin").exists());
}
