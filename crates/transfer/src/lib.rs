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

//! Resumable, parallel, chunked transfers.
//!
//! A [`Downloader`] splits one remote file into byte ranges served by a pool
//! of workers and keeps a resume snapshot next to the destination. A
//! [`MultiUploader`] drives a multi-part upload through a [`MultiUpload`]
//! session. [`TaskExecutor`] runs batches of [`DownloadTaskUnit`]s and
//! [`UploadTaskUnit`]s with retries.

mod config;
mod control;
mod downloader;
mod error;
mod load_balancer;
mod monitor;
mod range;
mod rate_limit;
mod service;
mod sink;
mod state;
mod status;
mod task;
mod unit;
mod uploader;
mod worker;

pub use config::{
    DEFAULT_BLOCK_SIZE, DEFAULT_CACHE_SIZE, DEFAULT_MAX_PARALLEL, DEFAULT_MAX_RETRY,
    DOWNLOAD_SUFFIX, DownloaderConfig, ExecutorConfig, MAX_UPLOAD_PARTS, MIN_PARALLEL_SIZE,
    MIN_UPLOAD_BLOCK_SIZE, UploaderConfig,
};
pub use control::{NoopObserver, TransferHandle, TransferObserver};
pub use downloader::{DownloadRequest, Downloader, TransferSummary};
pub use error::{Result, TransferError};
pub use load_balancer::{Candidate, CandidateList, DefaultClassifier, ProbeClassifier, Prober};
pub use monitor::{StaticUrl, UrlSource};
pub use range::{
    Range, RangeGenMode, RangeList, RangeListGen, average_parallel, generate, select_cache_size,
    select_parallel,
};
pub use rate_limit::RateLimit;
pub use service::{FileEntry, PanService, ServiceCode, ServiceError};
pub use sink::WriterAt;
pub use state::{InstanceState, StateStore};
pub use status::{SpeedMeter, StatusSnapshot, TransferStatus};
pub use task::{
    ExecutionSummary, FailedTask, TaskExecutor, TaskInfo, TaskUnit, TaskUnitRunResult, retry_wait,
};
pub use unit::{
    DownloadContext, DownloadFlags, DownloadTarget, DownloadTaskUnit, ObserverFactory,
    TransferStatistic, UploadContext, UploadTarget, UploadTaskUnit,
};
pub use uploader::{
    MultiUpload, MultiUploader, PartRecord, SplitUnit, UploadSession, UploadState, UploadSummary,
    upload_block_size,
};
pub use worker::{WorkerInfo, WorkerStatus};
