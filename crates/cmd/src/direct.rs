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

//! A [`PanService`] over plain HTTP URLs: every remote path is a URL and
//! nothing is a directory.

use std::ops::ControlFlow;

use async_trait::async_trait;
use panflow_transfer::{FileEntry, PanService, ServiceCode, ServiceError};
use reqwest::StatusCode;

#[derive(Debug, Clone)]
pub struct DirectHttpService {
    client: reqwest::Client,
}

impl DirectHttpService {
    pub fn new(user_agent: &str) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .build()
            .map_err(|e| ServiceError::new(ServiceCode::Other, e.to_string()))?;
        Ok(Self { client })
    }
}

fn classify(status: StatusCode) -> ServiceCode {
    match status {
        StatusCode::NOT_FOUND | StatusCode::GONE => ServiceCode::NotFound,
        StatusCode::UNAUTHORIZED => ServiceCode::Unauthorized,
        StatusCode::FORBIDDEN => ServiceCode::PermissionDenied,
        StatusCode::TOO_MANY_REQUESTS => ServiceCode::RateLimited,
        s if s.is_server_error() => ServiceCode::Unavailable,
        _ => ServiceCode::Other,
    }
}

/// Last path segment of `url`, used as the local file name.
pub fn file_name(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty() && !name.contains(':'))
        .unwrap_or("download.bin")
        .to_string()
}

#[async_trait]
impl PanService for DirectHttpService {
    async fn file_info(&self, path: &str) -> Result<FileEntry, ServiceError> {
        let response = self
            .client
            .head(path)
            .send()
            .await
            .map_err(|e| ServiceError::new(ServiceCode::Unavailable, e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ServiceError::new(classify(status), format!("HEAD {path}: {status}")));
        }
        let size = response.content_length().ok_or_else(|| {
            ServiceError::new(ServiceCode::Other, format!("{path} did not report a size"))
        })?;
        let name = file_name(path);
        Ok(FileEntry::builder()
            .id(path)
            .path(format!("/{name}"))
            .name(name)
            .size(size)
            .build())
    }

    async fn download_url(&self, file_id: &str) -> Result<String, ServiceError> { Ok(file_id.to_string()) }

    async fn list_recursive(
        &self,
        _path: &str,
        _visit: &mut (dyn FnMut(FileEntry) -> ControlFlow<()> + Send),
    ) -> Result<(), ServiceError> {
        Ok(())
    }
}
