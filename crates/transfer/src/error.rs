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

use std::path::PathBuf;

use snafu::Snafu;

use crate::service::{ServiceCode, ServiceError};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum TransferError {
    #[snafu(display("Remote service error: {source}"))]
    Service { source: ServiceError },

    #[snafu(display("Local I/O error at {}: {source}", path.display()))]
    LocalIo {
        path:   PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Network error: {source}"))]
    Network { source: reqwest::Error },

    #[snafu(display("HTTP error {status} for URL: {url}"))]
    Http { status: u16, url: String },

    #[snafu(display("Server ignored the Range request for URL: {url}"))]
    RangeNotSupported { url: String },

    #[snafu(display("Remote size changed: expected {expected} bytes, server reports {actual}"))]
    SizeChanged { expected: u64, actual: u64 },

    #[snafu(display("Response ended early: expected {expected} more bytes, got {received}"))]
    IncompleteBody { expected: u64, received: u64 },

    #[snafu(display("Transfer terminated: {message}"))]
    Terminated { message: String },

    #[snafu(display("No workers could be started for the remaining ranges"))]
    NoWorkers,

    #[snafu(display("Transfer cancelled"))]
    Cancelled,

    #[snafu(display("Worker task panicked: {message}"))]
    ThreadPanic { message: String },

    #[snafu(display("State file error at {}: {message}", path.display()))]
    StateFile { path: PathBuf, message: String },

    #[snafu(display("State file at {} is corrupted: {source}", path.display()))]
    StateCorrupted {
        path:   PathBuf,
        source: serde_json::Error,
    },

    #[snafu(display("SHA256 mismatch: expected {expected}, got {actual}"))]
    ChecksumMismatch { expected: String, actual: String },

    #[snafu(display("Remote file {path} is banned"))]
    FileBanned { path: String },

    #[snafu(display("Upload parts {parts:?} did not complete"))]
    PartsIncomplete { parts: Vec<usize> },

    #[snafu(display("Unknown range generation mode: {mode}"))]
    UnknownRangeGenMode { mode: String },

    #[snafu(display("{} is not a directory", path.display()))]
    NotADirectory { path: PathBuf },

    #[snafu(display("Download already in progress for {}", path.display()))]
    InProgress { path: PathBuf },
}

pub type Result<T, E = TransferError> = std::result::Result<T, E>;

impl TransferError {
    /// Whether running the same unit again has a chance of succeeding.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Service { source } => source.code != ServiceCode::NotFound,
            Self::Http { status, .. } => *status != 404,
            Self::Network { .. }
            | Self::IncompleteBody { .. }
            | Self::NoWorkers
            | Self::ChecksumMismatch { .. }
            | Self::PartsIncomplete { .. } => true,
            Self::LocalIo { .. }
            | Self::RangeNotSupported { .. }
            | Self::SizeChanged { .. }
            | Self::Terminated { .. }
            | Self::Cancelled
            | Self::ThreadPanic { .. }
            | Self::StateFile { .. }
            | Self::StateCorrupted { .. }
            | Self::FileBanned { .. }
            | Self::UnknownRangeGenMode { .. }
            | Self::NotADirectory { .. }
            | Self::InProgress { .. } => false,
        }
    }

    #[must_use]
    pub const fn is_cancelled(&self) -> bool { matches!(self, Self::Cancelled) }
}
