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

use std::{num::NonZeroU32, sync::Arc};

use governor::{
    Quota, RateLimiter,
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
};
use tracing::warn;

/// Token bucket shared by every worker of one transfer; one token per byte.
#[derive(Clone)]
pub struct RateLimit {
    limiter: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
    burst:   NonZeroU32,
}

impl std::fmt::Debug for RateLimit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimit")
            .field("bytes_per_second", &self.burst)
            .finish()
    }
}

impl RateLimit {
    /// `None` for a zero rate, which means unlimited.
    #[must_use]
    pub fn new(bytes_per_second: u64) -> Option<Self> {
        let rate = u32::try_from(bytes_per_second).unwrap_or(u32::MAX);
        let burst = NonZeroU32::new(rate)?;
        Some(Self {
            limiter: Arc::new(RateLimiter::direct(Quota::per_second(burst))),
            burst,
        })
    }

    #[must_use]
    pub const fn bytes_per_second(&self) -> u32 { self.burst.get() }

    /// Wait until `bytes` may pass. Requests above one second's worth are
    /// taken in burst-sized steps.
    pub async fn acquire(&self, bytes: usize) {
        let mut remaining = u64::try_from(bytes).unwrap_or(u64::MAX);
        while remaining > 0 {
            let step = remaining.min(u64::from(self.burst.get())) as u32;
            let Some(step) = NonZeroU32::new(step) else {
                return;
            };
            if let Err(e) = self.limiter.until_n_ready(step).await {
                warn!(error = %e, "rate limiter rejected request");
                return;
            }
            remaining -= u64::from(step.get());
        }
    }
}
