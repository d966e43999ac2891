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

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use common::{create_temp_dir, payload};
use panflow_base::readable_size::ReadableSize;
use panflow_transfer::{
    MultiUpload, MultiUploader, Result, SplitUnit, StateStore, TransferError, UploadSession,
    UploadState, UploaderConfig,
};
use tokio_util::sync::CancellationToken;

/// Stores parts in memory and misbehaves on request.
struct MemoryUpload {
    session:   String,
    parts:     Mutex<BTreeMap<usize, Vec<u8>>>,
    calls:     AtomicUsize,
    transient: Mutex<HashMap<usize, usize>>,
    terminate: Option<usize>,
    slow:      HashMap<usize, Duration>,
    finished:  AtomicUsize,
    committed: AtomicBool,
}

impl MemoryUpload {
    fn new(session: &str) -> Self {
        Self {
            session:   session.to_string(),
            parts:     Mutex::new(BTreeMap::new()),
            calls:     AtomicUsize::new(0),
            transient: Mutex::new(HashMap::new()),
            terminate: None,
            slow:      HashMap::new(),
            finished:  AtomicUsize::new(0),
            committed: AtomicBool::new(false),
        }
    }

    fn failing(self, part: usize, times: usize) -> Self {
        self.transient.lock().unwrap().insert(part, times);
        self
    }

    fn terminating(mut self, part: usize) -> Self {
        self.terminate = Some(part);
        self
    }

    fn stalling(mut self, part: usize, delay: Duration) -> Self {
        self.slow.insert(part, delay);
        self
    }

    fn assembled(&self) -> Vec<u8> { self.parts.lock().unwrap().values().flatten().copied().collect() }
}

#[async_trait]
impl MultiUpload for MemoryUpload {
    async fn precreate(&self) -> Result<UploadSession> {
        Ok(UploadSession {
            id: self.session.clone(),
        })
    }

    async fn upload_part(
        &self,
        _cancel: &CancellationToken,
        part_id: usize,
        part_offset: u64,
        part_end: u64,
        source: &mut SplitUnit,
    ) -> Result<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert_eq!(source.len(), part_end - part_offset);

        if self.terminate == Some(part_id) {
            return Err(TransferError::Terminated {
                message: "quota exceeded".to_string(),
            });
        }
        let fail = {
            let mut transient = self.transient.lock().unwrap();
            match transient.get_mut(&part_id) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    true
                }
                _ => false,
            }
        };
        if let Some(delay) = self.slow.get(&part_id) {
            tokio::time::sleep(*delay).await;
        }
        if fail {
            // consume some bytes so the retry has to rewind
            source.read_chunk(1024).await?;
            return Err(TransferError::Http {
                status: 503,
                url:    "memory://upload".to_string(),
            });
        }

        let data = source.read_all().await?;
        assert_eq!(source.readed(), source.len());
        self.parts.lock().unwrap().insert(part_id, data.to_vec());
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn commit(&self) -> Result<()> {
        self.committed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn config(state_dir: &std::path::Path) -> UploaderConfig {
    UploaderConfig {
        parallel: 2,
        block_size: Some(ReadableSize::kb(64)),
        state_dir: state_dir.to_path_buf(),
        ..UploaderConfig::default()
    }
}

#[tokio::test]
async fn upload_retries_part_then_commits() {
    let dir = create_temp_dir("upload-retry");
    let content = payload(150 * 1024);
    let path = dir.path().join("source.bin");
    tokio::fs::write(&path, &content).await.unwrap();

    let upload = Arc::new(MemoryUpload::new("s-retry").failing(1, 2));
    let uploader = MultiUploader::new(config(&dir.path().join("state")), &path, upload.clone());
    let state_path = uploader.state_path(&UploadSession {
        id: "s-retry".to_string(),
    });

    let summary = uploader.execute().await.unwrap();
    assert_eq!(summary.parts, 3);
    assert_eq!(summary.file_size, content.len() as u64);
    assert_eq!(upload.calls.load(Ordering::SeqCst), 5);
    assert!(upload.committed.load(Ordering::SeqCst));
    assert_eq!(upload.assembled(), content);
    assert!(!state_path.exists());
}

#[tokio::test]
async fn upload_terminal_error_skips_commit_and_resumes() {
    let dir = create_temp_dir("upload-terminal");
    let content = payload(150 * 1024);
    let path = dir.path().join("source.bin");
    tokio::fs::write(&path, &content).await.unwrap();
    let state_dir = dir.path().join("state");
    let single = UploaderConfig {
        parallel: 1,
        ..config(&state_dir)
    };

    let upload = Arc::new(MemoryUpload::new("s-term").terminating(1));
    let uploader = MultiUploader::new(single.clone(), &path, upload.clone());
    let err = uploader.execute().await.unwrap_err();
    assert!(matches!(err, TransferError::Terminated { .. }));
    assert!(!err.is_retryable());
    assert!(!upload.committed.load(Ordering::SeqCst));

    let store = StateStore::new(uploader.state_path(&UploadSession {
        id: "s-term".to_string(),
    }));
    let saved: UploadState = store.load().await.unwrap().expect("state kept");
    let done: Vec<bool> = saved.parts.iter().map(|p| p.done).collect();
    assert_eq!(done, vec![true, false, false]);

    // same session: only the unfinished parts are sent again
    let retry = Arc::new(MemoryUpload::new("s-term"));
    MultiUploader::new(single, &path, retry.clone())
        .execute()
        .await
        .unwrap();
    assert_eq!(retry.calls.load(Ordering::SeqCst), 2);
    assert!(retry.committed.load(Ordering::SeqCst));
    assert_eq!(retry.parts.lock().unwrap().keys().copied().collect::<Vec<_>>(), vec![1, 2]);
    assert!(!store.exists().await);
}

#[tokio::test]
async fn upload_terminal_error_cancels_parts_in_flight() {
    let dir = create_temp_dir("upload-terminal-parallel");
    let content = payload(150 * 1024);
    let path = dir.path().join("source.bin");
    tokio::fs::write(&path, &content).await.unwrap();
    let cfg = UploaderConfig {
        parallel: 3,
        ..config(&dir.path().join("state"))
    };

    let upload = Arc::new(
        MemoryUpload::new("s-siblings")
            .stalling(0, Duration::from_secs(5))
            .stalling(2, Duration::from_secs(5))
            .terminating(1),
    );
    let uploader = MultiUploader::new(cfg, &path, upload.clone());
    let started = Instant::now();
    let err = uploader.execute().await.unwrap_err();

    assert!(matches!(err, TransferError::Terminated { .. }));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(upload.calls.load(Ordering::SeqCst), 3);
    assert_eq!(upload.finished.load(Ordering::SeqCst), 0);
    assert!(!upload.committed.load(Ordering::SeqCst));

    let store = StateStore::new(uploader.state_path(&UploadSession {
        id: "s-siblings".to_string(),
    }));
    let saved: UploadState = store.load().await.unwrap().expect("state kept");
    assert!(saved.parts.iter().all(|p| !p.done));
}

#[tokio::test]
async fn upload_gives_up_after_part_retries() {
    let dir = create_temp_dir("upload-exhaust");
    let content = payload(100 * 1024);
    let path = dir.path().join("source.bin");
    tokio::fs::write(&path, &content).await.unwrap();

    let upload = Arc::new(MemoryUpload::new("s-exhaust").failing(0, 10));
    let cfg = UploaderConfig {
        max_part_retries: 1,
        ..config(&dir.path().join("state"))
    };
    let err = MultiUploader::new(cfg, &path, upload.clone())
        .execute()
        .await
        .unwrap_err();

    match err {
        TransferError::PartsIncomplete { parts } => assert_eq!(parts, vec![0]),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(upload.calls.load(Ordering::SeqCst), 3);
    assert!(!upload.committed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn upload_empty_file_commits_without_parts() {
    let dir = create_temp_dir("upload-empty");
    let path = dir.path().join("empty.bin");
    tokio::fs::write(&path, b"").await.unwrap();

    let upload = Arc::new(MemoryUpload::new("s-empty"));
    let summary = MultiUploader::new(config(&dir.path().join("state")), &path, upload.clone())
        .execute()
        .await
        .unwrap();
    assert_eq!(summary.parts, 0);
    assert_eq!(upload.calls.load(Ordering::SeqCst), 0);
    assert!(upload.committed.load(Ordering::SeqCst));
}
