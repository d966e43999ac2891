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

//! Range-serving HTTP fixture shared by the integration tests.

#![allow(dead_code)]

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};

use axum::{
    Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use axum_test::TestServer;
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tokio::sync::Notify;

/// Misbehaviour injected into the `/file` route.
#[derive(Clone, Default)]
pub struct Faults {
    /// Requests for a range starting at byte 0 answered with 503 first.
    pub unavailable_at_zero: Arc<AtomicUsize>,
    /// Requests for a range starting at this offset are never answered.
    pub hang_from:           Arc<Mutex<Option<usize>>>,
    pub hang_started:        Arc<Notify>,
    pub requests:            Arc<AtomicUsize>,
}

#[derive(Clone)]
pub struct AppState {
    pub content: Arc<Vec<u8>>,
    pub faults:  Faults,
}

impl AppState {
    pub fn new(content: &[u8]) -> Self {
        Self {
            content: Arc::new(content.to_vec()),
            faults:  Faults::default(),
        }
    }
}

async fn handle_get(headers: HeaderMap, State(state): State<AppState>) -> Response {
    state.faults.requests.fetch_add(1, Ordering::SeqCst);
    let total_len = state.content.len();
    let range = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| parse_range(value, total_len));
    let start = range.map_or(0, |(start, _)| start);

    if start == 0
        && state
            .faults
            .unavailable_at_zero
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let hang = *state.faults.hang_from.lock().unwrap() == Some(start);
    if hang {
        state.faults.hang_started.notify_one();
        std::future::pending::<()>().await;
    }

    if let Some((start, end)) = range {
        let slice = &state.content[start..=end];
        let mut response_headers = HeaderMap::new();
        response_headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        response_headers.insert(
            header::CONTENT_RANGE,
            HeaderValue::from_str(&format!("bytes {start}-{end}/{total_len}")).unwrap(),
        );
        response_headers.insert(
            header::CONTENT_LENGTH,
            HeaderValue::from_str(&slice.len().to_string()).unwrap(),
        );
        return (
            StatusCode::PARTIAL_CONTENT,
            response_headers,
            Bytes::copy_from_slice(slice),
        )
            .into_response();
    }

    let mut response_headers = HeaderMap::new();
    response_headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&total_len.to_string()).unwrap(),
    );
    (
        StatusCode::OK,
        response_headers,
        Bytes::copy_from_slice(&state.content),
    )
        .into_response()
}

async fn handle_missing() -> StatusCode { StatusCode::NOT_FOUND }

fn parse_range(value: &str, total: usize) -> Option<(usize, usize)> {
    let value = value.strip_prefix("bytes=")?;
    let (start_str, end_str) = value.split_once('-')?;
    let start: usize = start_str.parse().ok()?;
    let end: usize = end_str.parse().ok()?;
    if start <= end && end < total {
        Some((start, end))
    } else {
        None
    }
}

pub fn create_test_server(state: AppState) -> TestServer {
    let app = Router::new()
        .route("/file", get(handle_get))
        .route("/missing", get(handle_missing))
        .with_state(state);

    TestServer::builder()
        .http_transport()
        .build(app)
}

pub fn url_for(server: &TestServer, path: &str) -> String {
    let base = server
        .server_address()
        .expect("server should have HTTP address")
        .to_string();
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

pub fn create_temp_dir(prefix: &str) -> TempDir {
    tempfile::Builder::new()
        .prefix(&format!("panflow-{prefix}-"))
        .tempdir()
        .expect("failed to create temp dir")
}

/// Deterministic, non-repeating-looking payload.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| (i.wrapping_mul(31) ^ (i >> 9)) as u8)
        .collect()
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
