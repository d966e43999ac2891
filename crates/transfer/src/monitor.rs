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

//! The worker pool behind one download.

use std::{
    collections::{HashMap, VecDeque},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBuilder};
use tokio::{
    sync::{Mutex, watch},
    task::JoinSet,
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, warn};

use crate::{
    control::TransferObserver,
    error::{Result, TransferError},
    load_balancer::{Candidate, CandidateList},
    range::Range,
    rate_limit::RateLimit,
    sink::WriterAt,
    state::{InstanceState, StateStore},
    status::TransferStatus,
    worker::{Worker, WorkerCell, WorkerInfo, WorkerStatus, resumed},
};

/// Produces the URL of the primary source. Called once per worker spawn.
#[async_trait]
pub trait UrlSource: Send + Sync {
    async fn resolve(&self) -> Result<String>;
}

/// A URL that never expires.
#[derive(Debug, Clone)]
pub struct StaticUrl(pub String);

#[async_trait]
impl UrlSource for StaticUrl {
    async fn resolve(&self) -> Result<String> { Ok(self.0.clone()) }
}

/// Everything the resume snapshot is built from, behind one lock so a
/// range is always either pending, owned by a cell, or still inside the
/// generator.
#[derive(Debug)]
pub(crate) struct Ledger {
    pub(crate) status:  TransferStatus,
    pub(crate) pending: VecDeque<Range>,
    pub(crate) cells:   Vec<Arc<WorkerCell>>,
}

impl Ledger {
    pub(crate) fn new(status: TransferStatus, pending: impl IntoIterator<Item = Range>) -> Self {
        Self {
            status,
            pending: pending.into_iter().filter(|r| !r.is_empty()).collect(),
            cells: Vec::new(),
        }
    }

    /// Move the next range into a fresh cell.
    fn assign(&mut self) -> Option<Arc<WorkerCell>> {
        let range = match self.pending.pop_front() {
            Some(range) => range,
            None => self.status.generator_mut()?.next_range()?,
        };
        let cell = Arc::new(WorkerCell::new(self.cells.len(), range));
        self.cells.push(Arc::clone(&cell));
        Some(cell)
    }

    pub(crate) fn instance_state(&self) -> InstanceState {
        let mut ranges: Vec<Range> = self.pending.iter().copied().collect();
        ranges.extend(
            self.cells
                .iter()
                .filter(|c| c.status() != WorkerStatus::Success)
                .map(|c| c.range())
                .filter(|r| !r.is_empty()),
        );
        ranges.sort();
        InstanceState::new(ranges, self.status.clone())
    }

    pub(crate) fn worker_infos(&self) -> Vec<WorkerInfo> {
        self.cells.iter().map(|c| c.info()).collect()
    }
}

pub(crate) struct MonitorSettings {
    pub(crate) parallel:           usize,
    pub(crate) cache_size:         usize,
    pub(crate) total_size:         u64,
    pub(crate) max_worker_reloads: usize,
    pub(crate) reload_delay:       Duration,
    pub(crate) status_interval:    Duration,
    pub(crate) destination:        PathBuf,
}

pub(crate) struct Monitor {
    pub(crate) settings:   MonitorSettings,
    pub(crate) client:     reqwest::Client,
    pub(crate) source:     Arc<dyn UrlSource>,
    pub(crate) candidates: Arc<CandidateList>,
    pub(crate) writer:     Arc<dyn WriterAt>,
    pub(crate) limiter:    Option<RateLimit>,
    pub(crate) ledger:     Arc<Mutex<Ledger>>,
    pub(crate) store:      Option<Arc<StateStore>>,
    pub(crate) observer:   Arc<dyn TransferObserver>,
    pub(crate) cancel:     CancellationToken,
    pub(crate) pause:      watch::Receiver<bool>,
}

type Joined = (Arc<WorkerCell>, Result<()>);

impl Monitor {
    /// Run workers until every range is written, a failure turns fatal, or
    /// the transfer is cancelled. Progress is persisted on every exit path
    /// except full success.
    pub(crate) async fn execute(&self) -> Result<()> {
        let done = CancellationToken::new();
        let status_task = tokio::spawn(
            status_loop(
                Arc::clone(&self.ledger),
                Arc::clone(&self.observer),
                self.store.clone(),
                self.settings.status_interval,
                done.clone(),
            )
            .in_current_span(),
        );

        let result = self.schedule().await;

        done.cancel();
        if let Err(e) = status_task.await {
            warn!(error = %e, "status loop ended abnormally");
        }
        if result.is_err() {
            self.persist().await;
        }
        result
    }

    async fn schedule(&self) -> Result<()> {
        let workers_cancel = self.cancel.child_token();
        let mut join: JoinSet<Joined> = JoinSet::new();
        let mut reloads: HashMap<usize, usize> = HashMap::new();
        let mut fatal: Option<TransferError> = None;
        let mut pause = self.pause.clone();

        loop {
            while fatal.is_none()
                && join.len() < self.settings.parallel
                && !workers_cancel.is_cancelled()
            {
                if *pause.borrow() {
                    tokio::select! {
                        biased;
                        () = workers_cancel.cancelled() => break,
                        () = resumed(&mut pause) => {}
                    }
                }
                let Some(cell) = self.ledger.lock().await.assign() else {
                    break;
                };
                debug!(worker = cell.id(), range = %cell.range(), "assigned range");
                self.spawn(&mut join, cell, Duration::ZERO, &workers_cancel);
            }

            let Some(joined) = join.join_next().await else {
                break;
            };

            match joined {
                Ok((cell, Ok(()))) => {
                    cell.finish(WorkerStatus::Success, None);
                    debug!(worker = cell.id(), "range complete");
                    self.persist().await;
                }
                Ok((cell, Err(TransferError::Cancelled))) => {
                    cell.finish(WorkerStatus::Cancelled, None);
                }
                Ok((cell, Err(e))) => {
                    let used = reloads.entry(cell.id()).or_default();
                    let reloadable = self.settings.parallel > 1
                        && e.is_retryable()
                        && *used < self.settings.max_worker_reloads
                        && fatal.is_none()
                        && !workers_cancel.is_cancelled();

                    if reloadable {
                        *used += 1;
                        let delay = self.reload_delay(*used);
                        warn!(
                            worker = cell.id(),
                            reload = *used,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "worker failed, respawning"
                        );
                        cell.requeue(&e);
                        self.spawn(&mut join, cell, delay, &workers_cancel);
                    } else {
                        error!(worker = cell.id(), range = %cell.range(), error = %e, "worker failed");
                        cell.finish(WorkerStatus::Failed, Some(&e));
                        fatal.get_or_insert(e);
                        workers_cancel.cancel();
                    }
                }
                Err(e) => {
                    error!(error = %e, "worker task aborted");
                    fatal.get_or_insert(TransferError::ThreadPanic {
                        message: e.to_string(),
                    });
                    workers_cancel.cancel();
                }
            }
        }

        if let Some(e) = fatal {
            return Err(e);
        }
        if self.cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        if !self.ledger.lock().await.instance_state().is_complete() {
            return Err(TransferError::NoWorkers);
        }
        Ok(())
    }

    fn spawn(
        &self,
        join: &mut JoinSet<Joined>,
        cell: Arc<WorkerCell>,
        delay: Duration,
        cancel: &CancellationToken,
    ) {
        let candidate = self.candidates.next();
        let source = Arc::clone(&self.source);
        let worker = Worker {
            cell:        Arc::clone(&cell),
            client:      self.client.clone(),
            url:         String::new(),
            total_size:  self.settings.total_size,
            cache_size:  self.settings.cache_size,
            destination: self.settings.destination.clone(),
            writer:      Arc::clone(&self.writer),
            ledger:      Arc::clone(&self.ledger),
            limiter:     self.limiter.clone(),
            cancel:      cancel.clone(),
            pause:       self.pause.clone(),
        };
        let cancel = cancel.clone();

        join.spawn(
            async move {
                if !delay.is_zero() {
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => return (cell, Err(TransferError::Cancelled)),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                let url = match candidate {
                    Candidate::Primary => source.resolve().await,
                    Candidate::Mirror(url) => Ok(url),
                };
                let result = match url {
                    Ok(url) => Worker { url, ..worker }.run().await,
                    Err(e) => Err(e),
                };
                (cell, result)
            }
            .in_current_span(),
        );
    }

    fn reload_delay(&self, reload: usize) -> Duration {
        ExponentialBuilder::default()
            .with_min_delay(self.settings.reload_delay)
            .with_max_delay(self.settings.reload_delay * 16)
            .with_max_times(self.settings.max_worker_reloads.max(1))
            .build()
            .nth(reload.saturating_sub(1))
            .unwrap_or(self.settings.reload_delay)
    }

    async fn persist(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let state = self.ledger.lock().await.instance_state();
        if state.is_complete() {
            return;
        }
        if let Err(e) = store.save(&state).await {
            warn!(path = %store.path().display(), error = %e, "failed to save resume state");
        }
    }
}

async fn status_loop(
    ledger: Arc<Mutex<Ledger>>,
    observer: Arc<dyn TransferObserver>,
    store: Option<Arc<StateStore>>,
    interval: Duration,
    done: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    let mut last_saved = None;

    loop {
        tokio::select! {
            biased;
            () = done.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let (snapshot, workers, state) = {
            let mut ledger = ledger.lock().await;
            (
                ledger.status.snapshot(),
                ledger.worker_infos(),
                ledger.instance_state(),
            )
        };
        observer.on_status(&snapshot, &workers);

        if let Some(store) = &store
            && last_saved != Some(snapshot.transferred)
            && !state.is_complete()
        {
            match store.save(&state).await {
                Ok(()) => last_saved = Some(snapshot.transferred),
                Err(e) => warn!(error = %e, "failed to save resume state"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::range::{RangeGenMode, RangeListGen};

    #[test]
    fn test_ledger_prefers_pending_then_generator() {
        let mut status = TransferStatus::new(100);
        let mut generator = RangeListGen::new(100, 2, RangeGenMode::BlockSize, 30);
        // first two blocks were handed out in an earlier run
        generator.next_range();
        generator.next_range();
        status.set_generator(generator);

        let mut ledger = Ledger::new(status, [Range::new(45, 60), Range::new(0, 0)]);
        assert_eq!(ledger.assign().unwrap().range(), Range::new(45, 60));
        assert_eq!(ledger.assign().unwrap().range(), Range::new(60, 90));
        assert_eq!(ledger.assign().unwrap().range(), Range::new(90, 100));
        assert!(ledger.assign().is_none());

        let state = ledger.instance_state();
        assert_eq!(state.ranges.len(), 3);
        ledger.cells.iter().for_each(|c| c.finish(WorkerStatus::Success, None));
        assert!(ledger.instance_state().is_complete());
    }
}
