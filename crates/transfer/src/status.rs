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
    collections::VecDeque,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};

use crate::range::RangeListGen;

const SPEED_WINDOW: Duration = Duration::from_secs(5);

/// Bytes per second over a sliding window.
#[derive(Debug, Clone)]
pub struct SpeedMeter {
    window:  Duration,
    created: Instant,
    samples: VecDeque<(Instant, u64)>,
}

impl Default for SpeedMeter {
    fn default() -> Self { Self::new(SPEED_WINDOW) }
}

impl SpeedMeter {
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            created: Instant::now(),
            samples: VecDeque::new(),
        }
    }

    pub fn record(&mut self, bytes: u64) {
        let now = Instant::now();
        self.samples.push_back((now, bytes));
        self.evict(now);
    }

    #[must_use]
    pub fn per_second(&mut self) -> u64 {
        let now = Instant::now();
        self.evict(now);
        let span = now.duration_since(self.created).min(self.window);
        let millis = span.as_millis().max(1);
        let bytes: u64 = self.samples.iter().map(|(_, n)| n).sum();
        (u128::from(bytes) * 1000 / millis) as u64
    }

    fn evict(&mut self, now: Instant) {
        while let Some((at, _)) = self.samples.front() {
            if now.duration_since(*at) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Aggregate progress of one transfer, persisted inside the resume snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferStatus {
    total_size:  u64,
    transferred: u64,
    generator:   Option<RangeListGen>,
    #[serde(skip)]
    speed:       SpeedMeter,
    #[serde(skip, default = "Instant::now")]
    started:     Instant,
}

impl TransferStatus {
    #[must_use]
    pub fn new(total_size: u64) -> Self {
        Self {
            total_size,
            transferred: 0,
            generator: None,
            speed: SpeedMeter::default(),
            started: Instant::now(),
        }
    }

    #[must_use]
    pub const fn total_size(&self) -> u64 { self.total_size }

    #[must_use]
    pub const fn transferred(&self) -> u64 { self.transferred }

    pub fn add_transferred(&mut self, bytes: u64) {
        self.transferred += bytes;
        self.speed.record(bytes);
    }

    #[must_use]
    pub const fn generator(&self) -> Option<&RangeListGen> { self.generator.as_ref() }

    pub const fn generator_mut(&mut self) -> Option<&mut RangeListGen> { self.generator.as_mut() }

    pub fn set_generator(&mut self, generator: RangeListGen) { self.generator = Some(generator); }

    /// Restart the clock, e.g. when a loaded snapshot starts running again.
    pub fn restart_clock(&mut self) {
        self.started = Instant::now();
        self.speed = SpeedMeter::default();
    }

    pub fn snapshot(&mut self) -> StatusSnapshot {
        let speed_per_second = self.speed.per_second();
        let left = self.total_size.saturating_sub(self.transferred);
        let time_left = (speed_per_second > 0).then(|| Duration::from_secs(left / speed_per_second));
        StatusSnapshot {
            total_size: self.total_size,
            transferred: self.transferred,
            speed_per_second,
            elapsed: self.started.elapsed(),
            time_left,
        }
    }
}

/// Point-in-time view handed to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub total_size:       u64,
    pub transferred:      u64,
    pub speed_per_second: u64,
    pub elapsed:          Duration,
    /// `None` while nothing is moving.
    pub time_left:        Option<Duration>,
}
