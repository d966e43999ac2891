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

//! Executor units that drive one download or upload each.

mod download;
mod upload;

use std::{
    path::Path,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

pub use download::{DownloadContext, DownloadFlags, DownloadTarget, DownloadTaskUnit};
pub use upload::{UploadContext, UploadTarget, UploadTaskUnit};

use crate::{control::TransferObserver, task::TaskInfo};

/// Builds the observer attached to each file transfer a unit starts.
pub trait ObserverFactory: Send + Sync {
    fn observe(&self, info: &TaskInfo, path: &Path, total_size: u64) -> Arc<dyn TransferObserver>;
}

/// Batch-wide counters shared by every unit of one executor run.
#[derive(Debug)]
pub struct TransferStatistic {
    bytes:   AtomicU64,
    files:   AtomicU64,
    started: Mutex<Option<Instant>>,
}

impl Default for TransferStatistic {
    fn default() -> Self {
        Self {
            bytes:   AtomicU64::new(0),
            files:   AtomicU64::new(0),
            started: Mutex::new(None),
        }
    }
}

impl TransferStatistic {
    /// Start the batch clock. Later calls keep the first start.
    pub fn start(&self) {
        self.started
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_insert_with(Instant::now);
    }

    pub fn add(&self, bytes: u64) {
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
        self.files.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn total_bytes(&self) -> u64 { self.bytes.load(Ordering::Relaxed) }

    #[must_use]
    pub fn total_files(&self) -> u64 { self.files.load(Ordering::Relaxed) }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .map_or(Duration::ZERO, |started| started.elapsed())
    }
}
