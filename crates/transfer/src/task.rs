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

//! Generic runner for retriable units of work.

use std::{
    any::Any,
    collections::VecDeque,
    panic::AssertUnwindSafe,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::FutureExt;
use tokio::{sync::mpsc, task::JoinSet};
use tracing::{Instrument, debug, info, warn};

use crate::{config::ExecutorConfig, error::TransferError};

/// Identity and retry bookkeeping of one appended unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    id:        u64,
    retry:     usize,
    max_retry: usize,
}

impl TaskInfo {
    #[must_use]
    pub const fn id(&self) -> u64 { self.id }

    /// Retries used so far; `0` on the first run.
    #[must_use]
    pub const fn retry(&self) -> usize { self.retry }

    #[must_use]
    pub const fn max_retry(&self) -> usize { self.max_retry }

    #[must_use]
    pub const fn is_retry(&self) -> bool { self.retry > 0 }
}

#[derive(Debug, Default)]
pub struct TaskUnitRunResult {
    pub succeeded:  bool,
    pub message:    String,
    pub error:      Option<TransferError>,
    pub need_retry: bool,
}

impl TaskUnitRunResult {
    #[must_use]
    pub fn success() -> Self {
        Self {
            succeeded: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn success_with(message: impl Into<String>) -> Self {
        Self {
            succeeded: true,
            message: message.into(),
            ..Self::default()
        }
    }

    /// A failure whose retry decision follows the error's classification.
    #[must_use]
    pub fn failure(message: impl Into<String>, error: TransferError) -> Self {
        Self {
            succeeded:  false,
            message:    message.into(),
            need_retry: error.is_retryable(),
            error:      Some(error),
        }
    }

    #[must_use]
    pub const fn with_retry(mut self, need_retry: bool) -> Self {
        self.need_retry = need_retry;
        self
    }
}

/// Default escalation: 2 s, 4 s, then 6 s for every later retry.
#[must_use]
pub fn retry_wait(retry: usize) -> Duration {
    if retry < 3 {
        Duration::from_secs(2 * retry as u64)
    } else {
        Duration::from_secs(6)
    }
}

/// One retriable unit of work. Hooks default to no-ops.
#[async_trait]
pub trait TaskUnit: Send + 'static {
    async fn run(&mut self, info: &TaskInfo) -> TaskUnitRunResult;

    fn on_retry(&mut self, _info: &TaskInfo, _last: &TaskUnitRunResult) {}

    fn on_success(&mut self, _info: &TaskInfo, _last: &TaskUnitRunResult) {}

    fn on_failed(&mut self, _info: &TaskInfo, _last: &TaskUnitRunResult) {}

    /// Called once per unit after its final run, whatever the outcome.
    fn on_complete(&mut self, _info: &TaskInfo, _last: &TaskUnitRunResult) {}

    fn retry_wait(&self, info: &TaskInfo) -> Duration { retry_wait(info.retry()) }

    /// Short description used in logs and the failed list.
    fn label(&self) -> String;
}

/// A unit that exhausted its retries or failed permanently.
#[derive(Debug)]
pub struct FailedTask {
    pub info:   TaskInfo,
    pub label:  String,
    pub result: TaskUnitRunResult,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionSummary {
    pub succeeded: usize,
    pub failed:    usize,
    pub retried:   usize,
}

struct QueuedTask {
    info:  TaskInfo,
    unit:  Box<dyn TaskUnit>,
    delay: Duration,
}

struct ExecutorInner {
    config:  ExecutorConfig,
    next_id: AtomicU64,
    sender:  mpsc::UnboundedSender<QueuedTask>,
    queue:   tokio::sync::Mutex<mpsc::UnboundedReceiver<QueuedTask>>,
    failed:  Mutex<Vec<FailedTask>>,
}

/// Runs appended units with bounded parallelism, retrying failures at the
/// back of the queue.
///
/// Cloning yields another handle to the same executor, so a running unit
/// may append more units (a directory expanding into its files).
#[derive(Clone)]
pub struct TaskExecutor {
    inner: Arc<ExecutorInner>,
}

impl std::fmt::Debug for TaskExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskExecutor")
            .field("parallel", &self.inner.config.parallel)
            .field("next_id", &self.inner.next_id.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Default for TaskExecutor {
    fn default() -> Self { Self::new(ExecutorConfig::default()) }
}

type Finished = (QueuedTask, TaskUnitRunResult);

impl TaskExecutor {
    #[must_use]
    pub fn new(config: ExecutorConfig) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(ExecutorInner {
                config,
                next_id: AtomicU64::new(1),
                sender,
                queue: tokio::sync::Mutex::new(receiver),
                failed: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Enqueue `unit`; returns immediately, also while [`execute`] runs.
    ///
    /// [`execute`]: Self::execute
    pub fn append(&self, unit: impl TaskUnit, max_retry: usize) -> TaskInfo {
        let info = TaskInfo {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            retry: 0,
            max_retry,
        };
        debug!(task = info.id, label = %unit.label(), "task appended");
        // the receiver lives as long as `inner`, so sending cannot fail
        let _ = self.inner.sender.send(QueuedTask {
            info: info.clone(),
            unit: Box::new(unit),
            delay: Duration::ZERO,
        });
        info
    }

    /// Run until the queue is empty and no unit is in flight.
    pub async fn execute(&self) -> ExecutionSummary {
        let span = self.inner.config.span.clone();
        self.execute_inner().instrument(span).await
    }

    async fn execute_inner(&self) -> ExecutionSummary {
        let mut receiver = self.inner.queue.lock().await;
        let mut pending: VecDeque<QueuedTask> = VecDeque::new();
        let mut running: JoinSet<Finished> = JoinSet::new();
        let mut summary = ExecutionSummary::default();
        let parallel = self.inner.config.parallel.max(1);

        loop {
            while let Ok(task) = receiver.try_recv() {
                pending.push_back(task);
            }
            while running.len() < parallel {
                let Some(task) = pending.pop_front() else {
                    break;
                };
                running.spawn(Self::run_task(task).in_current_span());
            }

            let Some(joined) = running.join_next().await else {
                // appends made by the last finished unit are already queued
                if receiver.is_empty() {
                    break;
                }
                continue;
            };
            let (mut task, result) = match joined {
                Ok(finished) => finished,
                // panics are caught in `run_task`; this is a runtime abort
                Err(e) => {
                    warn!(error = %e, "task unit aborted");
                    summary.failed += 1;
                    continue;
                }
            };

            if result.succeeded {
                task.unit.on_success(&task.info, &result);
                task.unit.on_complete(&task.info, &result);
                summary.succeeded += 1;
                continue;
            }

            if result.need_retry && task.info.retry < task.info.max_retry {
                task.info.retry += 1;
                task.delay = task.unit.retry_wait(&task.info);
                task.unit.on_retry(&task.info, &result);
                info!(
                    task = task.info.id,
                    label = %task.unit.label(),
                    retry = task.info.retry,
                    max_retry = task.info.max_retry,
                    message = %result.message,
                    error = ?result.error.as_ref().map(ToString::to_string),
                    "task failed, retrying"
                );
                summary.retried += 1;
                pending.push_back(task);
                continue;
            }

            task.unit.on_failed(&task.info, &result);
            task.unit.on_complete(&task.info, &result);
            warn!(
                task = task.info.id,
                label = %task.unit.label(),
                message = %result.message,
                error = ?result.error.as_ref().map(ToString::to_string),
                "task failed"
            );
            summary.failed += 1;
            self.inner
                .failed
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(FailedTask {
                    info: task.info.clone(),
                    label: task.unit.label(),
                    result,
                });
        }

        summary
    }

    async fn run_task(mut task: QueuedTask) -> Finished {
        if !task.delay.is_zero() {
            tokio::time::sleep(task.delay).await;
        }
        // a panicking unit is kept so it still reaches the failed list
        let result = match AssertUnwindSafe(task.unit.run(&task.info))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(payload) => TaskUnitRunResult::failure(
                "task panicked",
                TransferError::ThreadPanic {
                    message: panic_message(payload.as_ref()),
                },
            ),
        };
        (task, result)
    }

    /// Take the units that failed permanently since the last call.
    #[must_use]
    pub fn failed(&self) -> Vec<FailedTask> {
        std::mem::take(
            &mut *self
                .inner
                .failed
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
