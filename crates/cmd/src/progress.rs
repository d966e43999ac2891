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

//! One-line progress per transfer on stdout.

use std::{
    io::Write,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use panflow_base::readable_size::ReadableSize;
use panflow_transfer::{
    ObserverFactory, StatusSnapshot, TaskInfo, TransferObserver, WorkerInfo,
};

#[derive(Debug, Clone, Copy)]
pub struct ProgressFactory {
    pub show_workers: bool,
}

impl ObserverFactory for ProgressFactory {
    fn observe(&self, info: &TaskInfo, path: &Path, _total_size: u64) -> Arc<dyn TransferObserver> {
        Arc::new(ProgressLine {
            task:         info.id(),
            path:         path.to_path_buf(),
            show_workers: self.show_workers,
            complete:     AtomicBool::new(false),
        })
    }
}

struct ProgressLine {
    task:         u64,
    path:         PathBuf,
    show_workers: bool,
    complete:     AtomicBool,
}

fn round_secs(d: Duration) -> Duration { Duration::from_secs(d.as_secs()) }

impl TransferObserver for ProgressLine {
    fn on_execute(&self) {
        println!("[{}] started: {}", self.task, self.path.display());
    }

    fn on_status(&self, status: &StatusSnapshot, workers: &[WorkerInfo]) {
        if self.complete.load(Ordering::Relaxed) {
            return;
        }
        let left = status
            .time_left
            .map_or_else(|| "-".to_string(), |d| format!("{:?}", round_secs(d)));
        let mut out = std::io::stdout().lock();
        if self.show_workers {
            for w in workers {
                let _ = writeln!(
                    out,
                    "  #{:<3} {:<9} {:<24} left {:<10} {}/s {}",
                    w.id,
                    w.status,
                    w.range.to_string(),
                    ReadableSize(w.range.len()),
                    ReadableSize(w.speed_per_second),
                    w.error.as_deref().unwrap_or_default(),
                );
            }
        }
        let _ = write!(
            out,
            "\r[{}] ↓ {}/{} {}/s in {:?}, left {} ",
            self.task,
            ReadableSize(status.transferred),
            ReadableSize(status.total_size),
            ReadableSize(status.speed_per_second),
            round_secs(status.elapsed),
            left,
        );
        let _ = out.flush();
    }

    fn on_success(&self) {
        println!("\n[{}] saved to {}", self.task, self.path.display());
    }

    fn on_finish(&self) {
        if !self.complete.swap(true, Ordering::Relaxed) {
            println!();
        }
    }
}
