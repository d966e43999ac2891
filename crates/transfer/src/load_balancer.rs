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

//! Mirror validation and round-robin URL candidates.

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use futures::{StreamExt, stream};
use reqwest::{StatusCode, header::HeaderMap};
use snafu::ResultExt;
use tracing::{debug, info};

use crate::error::{NetworkSnafu, Result};

const PROBE_CONCURRENCY: usize = 10;

/// Where a worker fetches its range from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Candidate {
    /// The URL freshly resolved through the service.
    Primary,
    Mirror(String),
}

/// Ordered candidates, primary first, handed out round-robin.
#[derive(Debug)]
pub struct CandidateList {
    items:  Vec<Candidate>,
    cursor: AtomicUsize,
}

impl Default for CandidateList {
    fn default() -> Self { Self::new(Vec::new()) }
}

impl CandidateList {
    #[must_use]
    pub fn new(mirrors: Vec<String>) -> Self {
        let items = std::iter::once(Candidate::Primary)
            .chain(mirrors.into_iter().map(Candidate::Mirror))
            .collect();
        Self {
            items,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn next(&self) -> Candidate {
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.items.len();
        self.items[idx].clone()
    }

    #[must_use]
    pub fn len(&self) -> usize { self.items.len() }

    #[must_use]
    pub fn is_empty(&self) -> bool { self.items.is_empty() }

    #[must_use]
    pub fn mirrors(&self) -> Vec<&str> {
        self.items
            .iter()
            .filter_map(|c| match c {
                Candidate::Mirror(url) => Some(url.as_str()),
                Candidate::Primary => None,
            })
            .collect()
    }
}

/// Service-specific judgement of probe responses.
pub trait ProbeClassifier: Send + Sync {
    /// Human-readable reason for a 4xx/5xx rejection.
    fn describe_error(&self, status: StatusCode, _headers: &HeaderMap) -> String {
        status.to_string()
    }

    /// Reject a 2xx response the service knows to be an error page.
    fn inspect(&self, _status: StatusCode, _headers: &HeaderMap) -> std::result::Result<(), String> {
        Ok(())
    }

    /// Whether the mirror serves the same content as the primary.
    fn matches_primary(&self, _headers: &HeaderMap) -> bool { true }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultClassifier;

impl ProbeClassifier for DefaultClassifier {}

pub struct Prober {
    client:     reqwest::Client,
    classifier: Arc<dyn ProbeClassifier>,
}

impl Prober {
    pub fn new(timeout: Duration, classifier: Arc<dyn ProbeClassifier>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context(NetworkSnafu)?;
        Ok(Self { client, classifier })
    }

    /// Keep the mirrors that answer 2xx with exactly `expected_size` bytes,
    /// in input order.
    pub async fn probe(&self, mirrors: &[String], expected_size: u64) -> CandidateList {
        let accepted: Vec<String> = stream::iter(mirrors.iter().cloned())
            .map(|url| async move {
                match self.check(&url, expected_size).await {
                    Ok(()) => Some(url),
                    Err(reason) => {
                        debug!(mirror = %url, %reason, "mirror rejected");
                        None
                    }
                }
            })
            .buffered(PROBE_CONCURRENCY)
            .filter_map(std::future::ready)
            .collect()
            .await;

        if !mirrors.is_empty() {
            info!(
                offered = mirrors.len(),
                accepted = accepted.len(),
                "mirror probe finished"
            );
        }
        CandidateList::new(accepted)
    }

    async fn check(&self, url: &str, expected_size: u64) -> std::result::Result<(), String> {
        // body is never read; dropping the response closes the connection
        let response = self.client.get(url).send().await.map_err(|e| e.to_string())?;
        let status = response.status();
        let headers = response.headers();

        if status.is_client_error() || status.is_server_error() {
            return Err(self.classifier.describe_error(status, headers));
        }
        if !status.is_success() {
            return Err(format!("unexpected status {status}"));
        }
        self.classifier.inspect(status, headers)?;

        match response.content_length() {
            Some(len) if len == expected_size => {}
            other => return Err(format!("content length {other:?} != {expected_size}")),
        }

        if self.classifier.matches_primary(headers) {
            Ok(())
        } else {
            Err("content differs from primary".to_string())
        }
    }
}
