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

use std::{path::PathBuf, time::Duration};

use panflow_base::readable_size::ReadableSize;
use smart_default::SmartDefault;

use crate::range::RangeGenMode;

/// Appended to the destination path to name the resume snapshot.
pub const DOWNLOAD_SUFFIX: &str = ".panflow-downloading";

pub const DEFAULT_MAX_PARALLEL: usize = 5;
pub const DEFAULT_CACHE_SIZE: ReadableSize = ReadableSize::kb(64);
pub const DEFAULT_BLOCK_SIZE: ReadableSize = ReadableSize::mb(55);
pub const DEFAULT_MAX_RETRY: usize = 3;

/// A fresh transfer starts at most one worker per this many bytes.
pub const MIN_PARALLEL_SIZE: ReadableSize = ReadableSize::kb(128);

pub const MIN_UPLOAD_BLOCK_SIZE: ReadableSize = ReadableSize::mb(4);
pub const MAX_UPLOAD_PARTS: u64 = 999;

/// Configuration for a single-file [`Downloader`](crate::Downloader).
#[derive(Debug, Clone, SmartDefault)]
pub struct DownloaderConfig {
    /// Upper bound on concurrent range workers (default: 5)
    #[default(DEFAULT_MAX_PARALLEL)]
    pub max_parallel: usize,

    /// Bytes buffered per worker between positional writes (default: 64KB,
    /// clamped to the block size)
    #[default(DEFAULT_CACHE_SIZE)]
    pub cache_size: ReadableSize,

    /// Range size in block-size mode (default: 55MB)
    #[default(DEFAULT_BLOCK_SIZE)]
    pub block_size: ReadableSize,

    pub mode: RangeGenMode,

    /// Aggregate throughput cap per second. `None` is unlimited.
    pub max_rate: Option<ReadableSize>,

    /// Mirror URLs probed before the transfer starts.
    pub mirrors: Vec<String>,

    #[default(Duration::from_secs(1))]
    pub status_interval: Duration,

    /// Respawns allowed per range before its failure becomes fatal.
    #[default = 3]
    pub max_worker_reloads: usize,

    /// First respawn delay; later respawns back off exponentially.
    #[default(Duration::from_millis(500))]
    pub reload_delay: Duration,

    /// Timeout for one ranged request (default: 10 minutes)
    #[default(Duration::from_secs(600))]
    pub timeout: Duration,

    #[default(Duration::from_secs(5))]
    pub probe_timeout: Duration,

    /// Persist progress next to the destination so a later run can resume.
    #[default = true]
    pub resumable: bool,

    pub user_agent: Option<String>,

    /// Parent span for every event the transfer emits.
    #[default(tracing::Span::none())]
    pub span: tracing::Span,
}

/// Configuration for a [`MultiUploader`](crate::MultiUploader).
#[derive(Debug, Clone, SmartDefault)]
pub struct UploaderConfig {
    /// Parts uploaded concurrently (default: 4)
    #[default = 4]
    pub parallel: usize,

    /// Part size. `None` derives it from the file size with
    /// [`upload_block_size`](crate::upload_block_size).
    pub block_size: Option<ReadableSize>,

    /// Transient failures tolerated per part before it is given up on.
    #[default = 3]
    pub max_part_retries: usize,

    pub max_rate: Option<ReadableSize>,

    /// Where `<session>.upload.json` snapshots are kept.
    #[default(default_state_dir())]
    pub state_dir: PathBuf,

    #[default(tracing::Span::none())]
    pub span: tracing::Span,
}

/// Configuration for a [`TaskExecutor`](crate::TaskExecutor).
#[derive(Debug, Clone, SmartDefault)]
pub struct ExecutorConfig {
    /// Units running at once (default: 1)
    #[default = 1]
    pub parallel: usize,

    #[default(tracing::Span::none())]
    pub span: tracing::Span,
}

fn default_state_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("panflow")
        .join("uploads")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downloader_defaults() {
        let config = DownloaderConfig::default();
        assert_eq!(config.max_parallel, 5);
        assert_eq!(config.cache_size.as_bytes(), 64 * 1024);
        assert_eq!(config.block_size, ReadableSize::mb(55));
        assert_eq!(config.mode, RangeGenMode::BlockSize);
        assert_eq!(config.status_interval, Duration::from_secs(1));
        assert_eq!(config.max_worker_reloads, 3);
        assert_eq!(config.timeout, Duration::from_secs(600));
        assert!(config.max_rate.is_none());
        assert!(config.resumable);
    }

    #[test]
    fn test_executor_defaults_to_one_unit() {
        assert_eq!(ExecutorConfig::default().parallel, 1);
    }

    #[test]
    fn test_state_dir_is_namespaced() {
        assert!(UploaderConfig::default().state_dir.ends_with("panflow/uploads"));
    }
}
