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
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use bytes::BytesMut;
use futures::StreamExt;
use reqwest::{StatusCode, header};
use serde::Serialize;
use snafu::{ResultExt, ensure};
use strum_macros::Display;
use tokio::sync::{Mutex as AsyncMutex, watch};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::{
    error::{
        HttpSnafu, IncompleteBodySnafu, LocalIoSnafu, NetworkSnafu, RangeNotSupportedSnafu, Result,
        SizeChangedSnafu, TransferError,
    },
    monitor::Ledger,
    range::Range,
    rate_limit::RateLimit,
    sink::WriterAt,
    status::SpeedMeter,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Waiting,
    Running,
    Success,
    Failed,
    Cancelled,
}

/// Snapshot of one worker for progress reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInfo {
    pub id:               usize,
    pub status:           WorkerStatus,
    /// Bytes of the assigned range still to fetch.
    pub range:            Range,
    pub transferred:      u64,
    pub speed_per_second: u64,
    pub attempts:         usize,
    pub error:            Option<String>,
}

#[derive(Debug)]
struct CellState {
    range:       Range,
    status:      WorkerStatus,
    transferred: u64,
    attempts:    usize,
    error:       Option<String>,
    speed:       SpeedMeter,
}

/// The slot a range occupies for the whole transfer. A respawn after a
/// failure reuses the slot, so attempts and progress carry over.
#[derive(Debug)]
pub(crate) struct WorkerCell {
    id:    usize,
    state: Mutex<CellState>,
}

impl WorkerCell {
    pub(crate) fn new(id: usize, range: Range) -> Self {
        Self {
            id,
            state: Mutex::new(CellState {
                range,
                status: WorkerStatus::Waiting,
                transferred: 0,
                attempts: 0,
                error: None,
                speed: SpeedMeter::default(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, CellState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) const fn id(&self) -> usize { self.id }

    pub(crate) fn range(&self) -> Range { self.state().range }

    pub(crate) fn status(&self) -> WorkerStatus { self.state().status }

    pub(crate) fn info(&self) -> WorkerInfo {
        let mut state = self.state();
        WorkerInfo {
            id:               self.id,
            status:           state.status,
            range:            state.range,
            transferred:      state.transferred,
            speed_per_second: state.speed.per_second(),
            attempts:         state.attempts,
            error:            state.error.clone(),
        }
    }

    fn begin_attempt(&self) {
        let mut state = self.state();
        state.attempts += 1;
        state.status = WorkerStatus::Running;
    }

    fn advance(&self, bytes: u64) {
        let mut state = self.state();
        state.range.begin += bytes;
        state.transferred += bytes;
        state.speed.record(bytes);
    }

    /// Queue a fresh attempt after a failure.
    pub(crate) fn requeue(&self, error: &TransferError) {
        let mut state = self.state();
        state.status = WorkerStatus::Waiting;
        state.error = Some(error.to_string());
    }

    pub(crate) fn finish(&self, status: WorkerStatus, error: Option<&TransferError>) {
        let mut state = self.state();
        state.status = status;
        if let Some(error) = error {
            state.error = Some(error.to_string());
        }
    }
}

/// One attempt at fetching a cell's remaining range.
pub(crate) struct Worker {
    pub(crate) cell:        Arc<WorkerCell>,
    pub(crate) client:      reqwest::Client,
    pub(crate) url:         String,
    pub(crate) total_size:  u64,
    pub(crate) cache_size:  usize,
    pub(crate) destination: PathBuf,
    pub(crate) writer:      Arc<dyn WriterAt>,
    pub(crate) ledger:      Arc<AsyncMutex<Ledger>>,
    pub(crate) limiter:     Option<RateLimit>,
    pub(crate) cancel:      CancellationToken,
    pub(crate) pause:       watch::Receiver<bool>,
}

enum Step {
    Cancelled,
    Next(Option<reqwest::Result<bytes::Bytes>>),
}

impl Worker {
    pub(crate) async fn run(mut self) -> Result<()> {
        self.wait_resumed().await?;
        self.cell.begin_attempt();

        let range = self.cell.range();
        if range.is_empty() {
            return Ok(());
        }
        trace!(worker = self.cell.id(), %range, url = %self.url, "requesting range");

        let request = self
            .client
            .get(&self.url)
            .header(header::RANGE, range.header_value())
            .send();
        let response = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Err(TransferError::Cancelled),
            response = request => response.context(NetworkSnafu)?,
        };

        let status = response.status();
        ensure!(
            status.is_success(),
            HttpSnafu {
                status: status.as_u16(),
                url:    &self.url,
            }
        );
        // a plain 200 is only usable when it starts at byte zero
        ensure!(
            status == StatusCode::PARTIAL_CONTENT || range.begin == 0,
            RangeNotSupportedSnafu { url: &self.url }
        );
        if let Some(actual) = content_range_total(response.headers()) {
            ensure!(
                actual == self.total_size,
                SizeChangedSnafu {
                    expected: self.total_size,
                    actual,
                }
            );
        }

        let mut stream = response.bytes_stream();
        let mut buffer = BytesMut::with_capacity(self.cache_size);
        let mut remaining = range.len();

        while remaining > 0 {
            let step = tokio::select! {
                biased;
                () = self.cancel.cancelled() => Step::Cancelled,
                next = stream.next() => Step::Next(next),
            };

            match step {
                Step::Cancelled => {
                    self.flush(&mut buffer).await?;
                    return Err(TransferError::Cancelled);
                }
                Step::Next(Some(Ok(chunk))) => {
                    let take = chunk.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
                    if let Some(limiter) = &self.limiter {
                        tokio::select! {
                            biased;
                            () = self.cancel.cancelled() => {}
                            () = limiter.acquire(take) => {}
                        }
                    }
                    buffer.extend_from_slice(&chunk[..take]);
                    remaining -= take as u64;

                    if buffer.len() >= self.cache_size || remaining == 0 {
                        self.flush(&mut buffer).await?;
                        self.wait_resumed().await?;
                    }
                }
                Step::Next(Some(Err(e))) => {
                    self.flush(&mut buffer).await?;
                    return Err(e).context(NetworkSnafu);
                }
                Step::Next(None) => {
                    self.flush(&mut buffer).await?;
                    return IncompleteBodySnafu {
                        expected: range.len(),
                        received: range.len() - remaining,
                    }
                    .fail();
                }
            }
        }

        Ok(())
    }

    /// Write the buffered bytes at the cell's current offset and advance it.
    async fn flush(&self, buffer: &mut BytesMut) -> Result<()> {
        if buffer.is_empty() {
            return Ok(());
        }
        let data = buffer.split().freeze();
        let len = data.len() as u64;
        let offset = self.cell.range().begin;
        let writer = Arc::clone(&self.writer);

        tokio::task::spawn_blocking(move || writer.write_at(&data, offset))
            .await
            .map_err(|e| TransferError::ThreadPanic {
                message: e.to_string(),
            })?
            .context(LocalIoSnafu {
                path: &self.destination,
            })?;

        let mut ledger = self.ledger.lock().await;
        self.cell.advance(len);
        ledger.status.add_transferred(len);
        Ok(())
    }

    async fn wait_resumed(&mut self) -> Result<()> {
        if !*self.pause.borrow() {
            return Ok(());
        }
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(TransferError::Cancelled),
            () = resumed(&mut self.pause) => Ok(()),
        }
    }
}

/// Total length from a `Content-Range: bytes a-b/total` header.
fn content_range_total(headers: &header::HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_RANGE)?
        .to_str()
        .ok()?
        .rsplit_once('/')?
        .1
        .parse()
        .ok()
}

/// Resolves once the pause gate opens, or its sender is gone.
pub(crate) async fn resumed(pause: &mut watch::Receiver<bool>) {
    let _ = pause.wait_for(|paused| !*paused).await;
}
