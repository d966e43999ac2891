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

//! The remote storage API as seen by the transfer engine.
//!
//! Account handling, path normalization and the wire protocol live behind
//! [`PanService`]; the engine only needs metadata, fresh download URLs and a
//! recursive listing.

use std::ops::ControlFlow;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ServiceCode {
    NotFound,
    PermissionDenied,
    Unauthorized,
    RateLimited,
    Unavailable,
    Other,
}

/// A typed error returned by the remote service.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display, derive_more::Error)]
#[display("{code}: {message}")]
pub struct ServiceError {
    pub code:    ServiceCode,
    pub message: String,
}

impl ServiceError {
    pub fn new(code: ServiceCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn not_found(path: &str) -> Self { Self::new(ServiceCode::NotFound, format!("{path} not found")) }
}

/// Metadata of a remote file or directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bon::Builder)]
pub struct FileEntry {
    #[builder(into)]
    pub id:     String,
    /// Absolute remote path, e.g. `/photos/2024/a.jpg`.
    #[builder(into)]
    pub path:   String,
    #[builder(into)]
    pub name:   String,
    #[builder(default)]
    pub size:   u64,
    #[builder(default)]
    pub is_dir: bool,
    /// Lowercase hex SHA-256 of the content, when the service knows it.
    pub sha256: Option<String>,
    #[builder(default)]
    pub banned: bool,
}

#[async_trait]
pub trait PanService: Send + Sync {
    async fn file_info(&self, path: &str) -> Result<FileEntry, ServiceError>;

    /// Resolve a short-lived download URL. Called again for every worker
    /// spawn, so implementations should not cache the result.
    async fn download_url(&self, file_id: &str) -> Result<String, ServiceError>;

    /// Walk `path` recursively, handing every entry to `visit` until it
    /// returns [`ControlFlow::Break`].
    async fn list_recursive(
        &self,
        path: &str,
        visit: &mut (dyn FnMut(FileEntry) -> ControlFlow<()> + Send),
    ) -> Result<(), ServiceError>;
}
