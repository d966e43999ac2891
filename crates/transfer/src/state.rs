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

//! On-disk resume snapshots.

use std::path::{Path, PathBuf};

use jiff::Timestamp;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use snafu::ResultExt;
use tokio::{fs, sync::Mutex};
use tracing::debug;

use crate::{
    config::DOWNLOAD_SUFFIX,
    error::{LocalIoSnafu, Result, StateCorruptedSnafu, StateFileSnafu},
    range::RangeList,
    status::TransferStatus,
};

/// What a download needs to pick up where it stopped: the ranges that were
/// assigned but not finished, and the aggregate status carrying the
/// generator cursor for everything not yet assigned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceState {
    pub ranges:     RangeList,
    pub status:     TransferStatus,
    #[serde(default)]
    pub updated_at: i64,
}

impl InstanceState {
    #[must_use]
    pub fn new(ranges: RangeList, status: TransferStatus) -> Self {
        Self {
            ranges,
            status,
            updated_at: Timestamp::now().as_second(),
        }
    }

    /// Nothing assigned is left and nothing remains to assign.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.ranges.iter().all(|r| r.is_empty())
            && self.status.generator().is_none_or(|g| g.is_exhausted())
    }
}

/// A JSON file written atomically through a sibling temp file.
///
/// Writers are serialized so the periodic status save and a worker's
/// completion save never interleave.
#[derive(Debug)]
pub struct StateStore {
    path:  PathBuf,
    write: Mutex<()>,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path:  path.into(),
            write: Mutex::new(()),
        }
    }

    /// `<destination>.panflow-downloading`
    #[must_use]
    pub fn for_destination(destination: &Path) -> Self {
        let mut path = destination.as_os_str().to_owned();
        path.push(DOWNLOAD_SUFFIX);
        Self::new(PathBuf::from(path))
    }

    #[must_use]
    pub fn path(&self) -> &Path { &self.path }

    pub async fn exists(&self) -> bool { fs::try_exists(&self.path).await.unwrap_or(false) }

    pub async fn load<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        let raw = match fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return StateFileSnafu {
                    path:    &self.path,
                    message: e.to_string(),
                }
                .fail();
            }
        };
        let value = serde_json::from_slice(&raw).context(StateCorruptedSnafu { path: &self.path })?;
        Ok(Some(value))
    }

    pub async fn save<T: Serialize + Sync>(&self, value: &T) -> Result<()> {
        let raw = serde_json::to_vec_pretty(value).context(StateCorruptedSnafu { path: &self.path })?;
        let _guard = self.write.lock().await;

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .await
                .context(LocalIoSnafu { path: parent })?;
        }

        let mut tmp = self.path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, raw).await.context(LocalIoSnafu { path: &tmp })?;
        fs::rename(&tmp, &self.path)
            .await
            .context(LocalIoSnafu { path: &self.path })?;
        Ok(())
    }

    pub async fn remove(&self) -> Result<()> {
        let _guard = self.write.lock().await;
        match fs::remove_file(&self.path).await {
            Ok(()) => {
                debug!(path = %self.path.display(), "removed state file");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context(LocalIoSnafu { path: &self.path }),
        }
    }

    /// Load a download snapshot, keeping it only if it describes a file of
    /// `total_size` bytes.
    pub async fn load_instance(&self, total_size: u64) -> Result<Option<InstanceState>> {
        let Some(state) = self.load::<InstanceState>().await? else {
            return Ok(None);
        };
        if state.status.total_size() == total_size {
            Ok(Some(state))
        } else {
            debug!(
                path = %self.path.display(),
                saved = state.status.total_size(),
                actual = total_size,
                "discarding state for a different file size"
            );
            Ok(None)
        }
    }
}
