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

//! Lifecycle callbacks and the caller-side control handle.

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{status::StatusSnapshot, worker::WorkerInfo};

/// Push-based lifecycle callbacks. Every method defaults to a no-op.
///
/// Callbacks run on the transfer's own tasks and must not block.
pub trait TransferObserver: Send + Sync {
    fn on_execute(&self) {}

    fn on_status(&self, _status: &StatusSnapshot, _workers: &[WorkerInfo]) {}

    fn on_success(&self) {}

    /// Always the last callback, on success and failure alike.
    fn on_finish(&self) {}

    fn on_pause(&self) {}

    fn on_resume(&self) {}

    fn on_cancel(&self) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl TransferObserver for NoopObserver {}

/// Cancel, pause and resume a running transfer from another task.
///
/// All operations are idempotent and may be called before the transfer
/// starts.
#[derive(Clone)]
pub struct TransferHandle {
    cancel:   CancellationToken,
    pause:    Arc<watch::Sender<bool>>,
    observer: Arc<dyn TransferObserver>,
}

impl std::fmt::Debug for TransferHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferHandle")
            .field("cancelled", &self.cancel.is_cancelled())
            .field("paused", &self.is_paused())
            .finish_non_exhaustive()
    }
}

impl TransferHandle {
    pub(crate) fn new(observer: Arc<dyn TransferObserver>) -> Self {
        let (pause, _) = watch::channel(false);
        Self {
            cancel: CancellationToken::new(),
            pause: Arc::new(pause),
            observer,
        }
    }

    pub(crate) fn set_observer(&mut self, observer: Arc<dyn TransferObserver>) {
        self.observer = observer;
    }

    pub fn cancel(&self) {
        if !self.cancel.is_cancelled() {
            info!("transfer cancellation requested");
            self.cancel.cancel();
            self.observer.on_cancel();
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool { self.cancel.is_cancelled() }

    pub fn pause(&self) {
        if self.pause.send_replace(true) {
            return;
        }
        info!("transfer paused");
        self.observer.on_pause();
    }

    pub fn resume(&self) {
        if !self.pause.send_replace(false) {
            return;
        }
        info!("transfer resumed");
        self.observer.on_resume();
    }

    #[must_use]
    pub fn is_paused(&self) -> bool { *self.pause.borrow() }

    pub(crate) fn token(&self) -> CancellationToken { self.cancel.clone() }

    pub(crate) fn pause_gate(&self) -> watch::Receiver<bool> { self.pause.subscribe() }
}
