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
    fs::File,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use bon::Builder;
use snafu::ResultExt;
use tokio::sync::Mutex;
use tracing::{Instrument, info, warn};

use crate::{
    config::DownloaderConfig,
    control::{NoopObserver, TransferHandle, TransferObserver},
    error::{InProgressSnafu, LocalIoSnafu, NetworkSnafu, Result, TransferError},
    load_balancer::{DefaultClassifier, ProbeClassifier, Prober},
    monitor::{Ledger, Monitor, MonitorSettings, UrlSource},
    range::{RangeListGen, select_cache_size, select_parallel},
    rate_limit::RateLimit,
    sink::WriterAt,
    state::StateStore,
    status::TransferStatus,
    worker::WorkerInfo,
};

#[derive(Debug, Clone, Builder)]
pub struct DownloadRequest {
    /// Local file the content is written to.
    #[builder(into)]
    pub destination: PathBuf,
    /// Size of the remote file in bytes.
    pub total_size:  u64,
}

#[derive(Debug, Clone)]
pub struct TransferSummary {
    pub total_size:  u64,
    /// Bytes written, including those written by earlier runs.
    pub transferred: u64,
    pub elapsed:     Duration,
    /// Whether a resume snapshot was picked up.
    pub resumed:     bool,
    pub workers:     Vec<WorkerInfo>,
}

/// Downloads one remote file into `request.destination` with ranged
/// requests, resuming from `<destination>.panflow-downloading` if present.
pub struct Downloader {
    config:     DownloaderConfig,
    request:    DownloadRequest,
    source:     Arc<dyn UrlSource>,
    client:     reqwest::Client,
    classifier: Arc<dyn ProbeClassifier>,
    observer:   Arc<dyn TransferObserver>,
    handle:     TransferHandle,
}

impl Downloader {
    pub fn new(
        config: DownloaderConfig,
        request: DownloadRequest,
        source: Arc<dyn UrlSource>,
    ) -> Result<Self> {
        let client = Self::build_client(&config)?;
        let observer: Arc<dyn TransferObserver> = Arc::new(NoopObserver);
        Ok(Self {
            config,
            request,
            source,
            client,
            classifier: Arc::new(DefaultClassifier),
            handle: TransferHandle::new(Arc::clone(&observer)),
            observer,
        })
    }

    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn TransferObserver>) -> Self {
        self.handle.set_observer(Arc::clone(&observer));
        self.observer = observer;
        self
    }

    #[must_use]
    pub fn with_classifier(mut self, classifier: Arc<dyn ProbeClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Control handle; clone it to cancel or pause from elsewhere.
    #[must_use]
    pub fn handle(&self) -> TransferHandle { self.handle.clone() }

    #[must_use]
    pub fn state_path(&self) -> PathBuf {
        StateStore::for_destination(&self.request.destination)
            .path()
            .to_path_buf()
    }

    pub async fn execute(&self) -> Result<TransferSummary> {
        let span = self.config.span.clone();
        async {
            let result = self.execute_inner().await;
            if let Err(e) = &result {
                warn!(destination = %self.request.destination.display(), error = %e, "download stopped");
            }
            self.observer.on_finish();
            result
        }
        .instrument(span)
        .await
    }

    async fn execute_inner(&self) -> Result<TransferSummary> {
        let started = Instant::now();
        let destination = &self.request.destination;
        let total = self.request.total_size;
        let store = self
            .config
            .resumable
            .then(|| Arc::new(StateStore::for_destination(destination)));

        // held until the transfer ends so a second process cannot write the
        // same destination
        let mut lock = fd_lock::RwLock::new(open_destination(destination).await?);
        let guard = match lock.try_write() {
            Ok(guard) => guard,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                return InProgressSnafu { path: destination }.fail();
            }
            Err(e) => return Err(e).context(LocalIoSnafu { path: destination }),
        };
        let file = guard
            .try_clone()
            .context(LocalIoSnafu { path: destination })?;
        let writer: Arc<dyn WriterAt> = Arc::new(file);

        if total == 0 {
            writer
                .preallocate(0)
                .context(LocalIoSnafu { path: destination })?;
            self.observer.on_execute();
            return self.succeed(store.as_deref(), started, 0, false, vec![]).await;
        }

        let saved = match &store {
            Some(store) => store.load_instance(total).await.unwrap_or_else(|e| {
                warn!(error = %e, "ignoring unreadable resume state");
                None
            }),
            None => None,
        };
        let resumed = saved.is_some();

        if let Some(state) = &saved
            && state.is_complete()
        {
            // an earlier run wrote everything but stopped before cleaning up
            if state.status.transferred() >= total {
                info!(destination = %destination.display(), "resume state already complete");
                self.observer.on_execute();
                return self.succeed(store.as_deref(), started, total, true, vec![]).await;
            }
            return Err(TransferError::NoWorkers);
        }

        let (ranges, mut status) = match saved {
            Some(state) => (state.ranges, state.status),
            None => (Vec::new(), TransferStatus::new(total)),
        };
        status.restart_clock();

        let parallel = select_parallel(ranges.len(), self.config.max_parallel, total);
        if status.generator().is_none() {
            status.set_generator(RangeListGen::new(
                total,
                parallel,
                self.config.mode,
                self.config.block_size.as_bytes(),
            ));
        }
        let block_size = status.generator().map_or(total, RangeListGen::block_size);
        let cache_size = select_cache_size(self.config.cache_size.as_bytes(), block_size);

        let prealloc = Arc::clone(&writer);
        match tokio::task::spawn_blocking(move || prealloc.preallocate(total)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "preallocation failed"),
            Err(e) => warn!(error = %e, "preallocation task failed"),
        }

        info!(
            destination = %destination.display(),
            total,
            parallel,
            block_size,
            cache_size,
            resumed,
            transferred = status.transferred(),
            "download task created"
        );

        let prober = Prober::new(self.config.probe_timeout, Arc::clone(&self.classifier))?;
        let candidates = Arc::new(prober.probe(&self.config.mirrors, total).await);

        let ledger = Arc::new(Mutex::new(Ledger::new(status, ranges)));
        if let Some(store) = &store {
            let state = ledger.lock().await.instance_state();
            store.save(&state).await?;
        }

        let monitor = Monitor {
            settings: MonitorSettings {
                parallel,
                cache_size,
                total_size: total,
                max_worker_reloads: self.config.max_worker_reloads,
                reload_delay: self.config.reload_delay,
                status_interval: self.config.status_interval,
                destination: destination.clone(),
            },
            client: self.client.clone(),
            source: Arc::clone(&self.source),
            candidates,
            writer,
            limiter: self.config.max_rate.and_then(|rate| RateLimit::new(rate.as_bytes())),
            ledger: Arc::clone(&ledger),
            store: store.clone(),
            observer: Arc::clone(&self.observer),
            cancel: self.handle.token(),
            pause: self.handle.pause_gate(),
        };

        self.observer.on_execute();
        monitor.execute().await?;
        drop(guard);

        let (transferred, workers) = {
            let ledger = ledger.lock().await;
            (ledger.status.transferred(), ledger.worker_infos())
        };
        self.succeed(store.as_deref(), started, transferred, resumed, workers)
            .await
    }

    async fn succeed(
        &self,
        store: Option<&StateStore>,
        started: Instant,
        transferred: u64,
        resumed: bool,
        workers: Vec<WorkerInfo>,
    ) -> Result<TransferSummary> {
        if let Some(store) = store
            && let Err(e) = store.remove().await
        {
            warn!(error = %e, "failed to remove resume state");
        }
        info!(
            destination = %self.request.destination.display(),
            bytes = transferred,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "download complete"
        );
        self.observer.on_success();
        Ok(TransferSummary {
            total_size: self.request.total_size,
            transferred,
            elapsed: started.elapsed(),
            resumed,
            workers,
        })
    }

    fn build_client(config: &DownloaderConfig) -> Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder().timeout(config.timeout);
        if let Some(ref ua) = config.user_agent {
            builder = builder.user_agent(ua);
        }
        builder.build().context(NetworkSnafu)
    }
}

async fn open_destination(path: &Path) -> Result<File> {
    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path)
        .await
        .context(LocalIoSnafu { path })?;
    Ok(file.into_std().await)
}
