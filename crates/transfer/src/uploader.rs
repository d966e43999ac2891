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

//! Multi-part upload of one local file.

use std::{
    collections::VecDeque,
    io::SeekFrom,
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};

use async_trait::async_trait;
use bytes::Bytes;
use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, ensure};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

use crate::{
    config::{MAX_UPLOAD_PARTS, MIN_UPLOAD_BLOCK_SIZE, UploaderConfig},
    control::{NoopObserver, TransferHandle, TransferObserver},
    error::{LocalIoSnafu, PartsIncompleteSnafu, Result, TransferError},
    range::{Range, RangeGenMode, generate},
    rate_limit::RateLimit,
    state::StateStore,
};

/// Part size for a file: 4 MiB, grown so the file never needs more than
/// 999 parts.
#[must_use]
pub const fn upload_block_size(file_size: u64) -> u64 {
    let min = MIN_UPLOAD_BLOCK_SIZE.as_bytes();
    if file_size / min > MAX_UPLOAD_PARTS {
        file_size / MAX_UPLOAD_PARTS + 1
    } else {
        min
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSession {
    pub id: String,
}

/// The service side of a multi-part upload.
///
/// `upload_part` returns `Ok(true)` once the part is stored. Returning
/// [`TransferError::Terminated`] aborts the whole upload; any other error
/// re-queues the part.
#[async_trait]
pub trait MultiUpload: Send + Sync {
    async fn precreate(&self) -> Result<UploadSession>;

    async fn upload_part(
        &self,
        cancel: &CancellationToken,
        part_id: usize,
        part_offset: u64,
        part_end: u64,
        source: &mut SplitUnit,
    ) -> Result<bool>;

    async fn commit(&self) -> Result<()>;
}

/// A bounded, position-tracking reader over one part of a local file.
pub struct SplitUnit {
    path:    PathBuf,
    file:    File,
    range:   Range,
    readed:  u64,
    limiter: Option<RateLimit>,
}

impl std::fmt::Debug for SplitUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SplitUnit")
            .field("path", &self.path)
            .field("range", &self.range)
            .field("readed", &self.readed)
            .finish_non_exhaustive()
    }
}

impl SplitUnit {
    pub async fn open(path: &Path, range: Range, limiter: Option<RateLimit>) -> Result<Self> {
        let mut file = File::open(path).await.context(LocalIoSnafu { path })?;
        file.seek(SeekFrom::Start(range.begin))
            .await
            .context(LocalIoSnafu { path })?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            range,
            readed: 0,
            limiter,
        })
    }

    #[must_use]
    pub const fn range(&self) -> Range { self.range }

    #[must_use]
    pub const fn len(&self) -> u64 { self.range.len() }

    #[must_use]
    pub const fn is_empty(&self) -> bool { self.range.is_empty() }

    /// Bytes handed out since the last rewind.
    #[must_use]
    pub const fn readed(&self) -> u64 { self.readed }

    pub async fn rewind(&mut self) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(self.range.begin))
            .await
            .context(LocalIoSnafu { path: &self.path })?;
        self.readed = 0;
        Ok(())
    }

    /// Up to `max` bytes of the part, `None` once it is exhausted.
    pub async fn read_chunk(&mut self, max: usize) -> Result<Option<Bytes>> {
        let left = self.len() - self.readed;
        if left == 0 {
            return Ok(None);
        }
        let want = usize::try_from(left).unwrap_or(usize::MAX).min(max.max(1));
        let mut buf = vec![0; want];
        let n = self
            .file
            .read(&mut buf)
            .await
            .context(LocalIoSnafu { path: &self.path })?;
        if n == 0 {
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof))
                .context(LocalIoSnafu { path: &self.path });
        }
        buf.truncate(n);
        if let Some(limiter) = &self.limiter {
            limiter.acquire(n).await;
        }
        self.readed += n as u64;
        Ok(Some(Bytes::from(buf)))
    }

    /// The rest of the part in one buffer.
    pub async fn read_all(&mut self) -> Result<Bytes> {
        let mut out = Vec::with_capacity(usize::try_from(self.len() - self.readed).unwrap_or(0));
        while let Some(chunk) = self.read_chunk(256 * 1024).await? {
            out.extend_from_slice(&chunk);
        }
        Ok(Bytes::from(out))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartRecord {
    pub id:    usize,
    pub range: Range,
    pub done:  bool,
}

/// `<state_dir>/<session>.upload.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadState {
    pub session:    UploadSession,
    pub file_size:  u64,
    pub block_size: u64,
    pub parts:      Vec<PartRecord>,
    #[serde(default)]
    pub updated_at: i64,
}

#[derive(Debug, Clone)]
pub struct UploadSummary {
    pub session:   UploadSession,
    pub file_size: u64,
    pub parts:     usize,
    pub elapsed:   std::time::Duration,
}

struct PartJob {
    record:  PartRecord,
    unit:    SplitUnit,
    retries: usize,
}

type PartJoined = (PartJob, Result<bool>);

pub struct MultiUploader {
    config:   UploaderConfig,
    path:     PathBuf,
    upload:   Arc<dyn MultiUpload>,
    observer: Arc<dyn TransferObserver>,
    handle:   TransferHandle,
}

impl MultiUploader {
    pub fn new(config: UploaderConfig, path: impl Into<PathBuf>, upload: Arc<dyn MultiUpload>) -> Self {
        let observer: Arc<dyn TransferObserver> = Arc::new(NoopObserver);
        Self {
            config,
            path: path.into(),
            upload,
            handle: TransferHandle::new(Arc::clone(&observer)),
            observer,
        }
    }

    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn TransferObserver>) -> Self {
        self.handle.set_observer(Arc::clone(&observer));
        self.observer = observer;
        self
    }

    #[must_use]
    pub fn handle(&self) -> TransferHandle { self.handle.clone() }

    #[must_use]
    pub fn state_path(&self, session: &UploadSession) -> PathBuf {
        self.config.state_dir.join(format!("{}.upload.json", session.id))
    }

    pub async fn execute(&self) -> Result<UploadSummary> {
        let span = self.config.span.clone();
        async {
            let result = self.execute_inner().await;
            if let Err(e) = &result {
                warn!(path = %self.path.display(), error = %e, "upload stopped");
            }
            self.observer.on_finish();
            result
        }
        .instrument(span)
        .await
    }

    async fn execute_inner(&self) -> Result<UploadSummary> {
        let started = Instant::now();
        let file_size = tokio::fs::metadata(&self.path)
            .await
            .context(LocalIoSnafu { path: &self.path })?
            .len();
        let block_size = self
            .config
            .block_size
            .map_or_else(|| upload_block_size(file_size), |b| b.as_bytes().max(1));

        let session = self.upload.precreate().await?;
        let store = StateStore::new(self.state_path(&session));
        let mut records = self.load_records(&store, &session, file_size, block_size).await;
        info!(
            path = %self.path.display(),
            session = %session.id,
            file_size,
            block_size,
            parts = records.len(),
            done = records.iter().filter(|r| r.done).count(),
            "upload task created"
        );

        self.observer.on_execute();
        let limiter = self.config.max_rate.and_then(|r| RateLimit::new(r.as_bytes()));
        let mut queue = VecDeque::new();
        for record in records.iter().filter(|r| !r.done) {
            let unit = SplitUnit::open(&self.path, record.range, limiter.clone()).await?;
            queue.push_back(PartJob {
                record: record.clone(),
                unit,
                retries: 0,
            });
        }

        let outcome = self
            .drain(queue, &mut records, &store, &session, file_size, block_size)
            .await;
        if let Err(e) = outcome {
            self.save(&store, &session, file_size, block_size, &records).await;
            return Err(e);
        }

        let pending: Vec<usize> = records.iter().filter(|r| !r.done).map(|r| r.id).collect();
        ensure!(pending.is_empty(), PartsIncompleteSnafu { parts: pending });

        self.upload.commit().await?;
        if let Err(e) = store.remove().await {
            warn!(error = %e, "failed to remove upload state");
        }
        info!(session = %session.id, parts = records.len(), "upload committed");
        self.observer.on_success();

        Ok(UploadSummary {
            session,
            file_size,
            parts: records.len(),
            elapsed: started.elapsed(),
        })
    }

    async fn drain(
        &self,
        mut queue: VecDeque<PartJob>,
        records: &mut [PartRecord],
        store: &StateStore,
        session: &UploadSession,
        file_size: u64,
        block_size: u64,
    ) -> Result<()> {
        let cancel = self.handle.token().child_token();
        let mut join: JoinSet<PartJoined> = JoinSet::new();
        let mut terminal: Option<TransferError> = None;
        let parallel = self.config.parallel.max(1);

        loop {
            while join.len() < parallel && !cancel.is_cancelled() {
                let Some(job) = queue.pop_front() else {
                    break;
                };
                debug!(part = job.record.id, range = %job.record.range, "uploading part");
                self.spawn(&mut join, job, &cancel);
            }

            let Some(joined) = join.join_next().await else {
                break;
            };
            match joined {
                Ok((job, Ok(done))) => {
                    if let Some(record) = records.iter_mut().find(|r| r.id == job.record.id) {
                        record.done = done;
                    }
                    if !done {
                        warn!(part = job.record.id, "service did not accept part");
                    }
                    self.save(store, session, file_size, block_size, records).await;
                }
                Ok((_, Err(TransferError::Cancelled))) => {}
                Ok((job, Err(e @ TransferError::Terminated { .. }))) => {
                    error!(part = job.record.id, error = %e, "upload terminated");
                    cancel.cancel();
                    terminal.get_or_insert(e);
                }
                Ok((mut job, Err(e))) => {
                    if job.retries < self.config.max_part_retries && !cancel.is_cancelled() {
                        job.retries += 1;
                        warn!(part = job.record.id, retry = job.retries, error = %e, "part failed, re-queued");
                        job.unit.rewind().await?;
                        queue.push_back(job);
                    } else {
                        warn!(part = job.record.id, error = %e, "part given up");
                    }
                }
                Err(e) => {
                    cancel.cancel();
                    terminal.get_or_insert(TransferError::ThreadPanic {
                        message: e.to_string(),
                    });
                }
            }
        }

        if let Some(e) = terminal {
            return Err(e);
        }
        if self.handle.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        Ok(())
    }

    fn spawn(&self, join: &mut JoinSet<PartJoined>, mut job: PartJob, cancel: &CancellationToken) {
        let upload = Arc::clone(&self.upload);
        let cancel = cancel.clone();
        join.spawn(
            async move {
                let id = job.record.id;
                let Range { begin, end } = job.record.range;
                let result = tokio::select! {
                    biased;
                    () = cancel.cancelled() => Err(TransferError::Cancelled),
                    result = upload.upload_part(&cancel, id, begin, end, &mut job.unit) => result,
                };
                (job, result)
            }
            .in_current_span(),
        );
    }

    async fn load_records(
        &self,
        store: &StateStore,
        session: &UploadSession,
        file_size: u64,
        block_size: u64,
    ) -> Vec<PartRecord> {
        match store.load::<UploadState>().await {
            Ok(Some(state))
                if state.file_size == file_size
                    && state.block_size == block_size
                    && state.session == *session =>
            {
                info!(session = %session.id, "resuming upload");
                return state.parts;
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "ignoring unreadable upload state"),
        }

        generate(file_size, 1, RangeGenMode::BlockSize, block_size)
            .into_iter()
            .enumerate()
            .map(|(id, range)| PartRecord {
                id,
                range,
                done: false,
            })
            .collect()
    }

    async fn save(
        &self,
        store: &StateStore,
        session: &UploadSession,
        file_size: u64,
        block_size: u64,
        records: &[PartRecord],
    ) {
        let state = UploadState {
            session: session.clone(),
            file_size,
            block_size,
            parts: records.to_vec(),
            updated_at: Timestamp::now().as_second(),
        };
        if let Err(e) = store.save(&state).await {
            warn!(path = %store.path().display(), error = %e, "failed to save upload state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn test_upload_block_size() {
        assert_eq!(upload_block_size(0), 4 * MIB);
        assert_eq!(upload_block_size(100 * MIB), 4 * MIB);
        // 999 full 4 MiB blocks still fit
        assert_eq!(upload_block_size(999 * 4 * MIB), 4 * MIB);
        let big = 8000 * MIB;
        assert_eq!(upload_block_size(big), big / 999 + 1);
        assert!(big.div_ceil(upload_block_size(big)) <= 999);
    }

    #[tokio::test]
    async fn test_split_unit_reads_and_rewinds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("src.bin");
        tokio::fs::write(&path, b"0123456789").await.unwrap();

        let mut unit = SplitUnit::open(&path, Range::new(3, 8), None).await.unwrap();
        assert_eq!(&unit.read_chunk(2).await.unwrap().unwrap()[..], b"34");
        assert_eq!(unit.readed(), 2);
        assert_eq!(&unit.read_all().await.unwrap()[..], b"567");
        assert!(unit.read_chunk(4).await.unwrap().is_none());

        unit.rewind().await.unwrap();
        assert_eq!(unit.readed(), 0);
        assert_eq!(&unit.read_all().await.unwrap()[..], b"34567");
    }
}
