// Copyright 2024 The Keysafe Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The server side of the backup engine, abstracted behind a trait so the
//! engine itself stays free of any particular HTTP stack.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::types::{BackupAlgorithm, EncryptedSessionData, RestoreScope};

/// Encrypted session keys grouped by room id, then by session id.
///
/// This is the shape records travel in, both for uploads and for downloads.
pub type BackupContents = BTreeMap<String, BTreeMap<String, EncryptedSessionData>>;

/// Errors the server communication can produce.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The server could not be reached, the operation can be retried later.
    #[error("the server could not be reached: {0}")]
    Network(String),
    /// The server understood the request and refused it.
    #[error("the server rejected the request: {0}")]
    Rejected(String),
    /// The requested backup version does not exist on the server.
    #[error("the requested backup version does not exist")]
    NotFound,
    /// The request targeted a backup version that is no longer the current
    /// one.
    #[error("the targeted backup version was superseded by version {current_version}")]
    WrongVersion {
        /// The version that is now current on the server.
        current_version: String,
    },
}

/// The server operations the backup engine needs.
///
/// Implementations are expected to be thin request/response mappings, all
/// retry and state logic lives in the engine.
#[async_trait]
pub trait BackupTransport: Send + Sync + std::fmt::Debug {
    /// Fetch a backup version from the server.
    ///
    /// If `version` is `None` the current version is fetched. Returns
    /// `Ok(None)` if no backup exists at all.
    async fn get_version(
        &self,
        version: Option<&str>,
    ) -> Result<Option<crate::types::BackupVersion>, TransportError>;

    /// Create a new backup version on the server and return its id.
    ///
    /// The new version becomes the current one, all older versions stop
    /// accepting uploads.
    async fn create_version(&self, algorithm: &BackupAlgorithm) -> Result<String, TransportError>;

    /// Delete a backup version and every record stored under it.
    ///
    /// Deleting a version that no longer exists is not an error.
    async fn delete_version(&self, version: &str) -> Result<(), TransportError>;

    /// Upload a batch of encrypted session keys to the given version.
    async fn put_sessions(
        &self,
        version: &str,
        sessions: BackupContents,
    ) -> Result<(), TransportError>;

    /// Download the encrypted session keys the given scope selects.
    async fn get_sessions(
        &self,
        version: &str,
        scope: &RestoreScope,
    ) -> Result<BackupContents, TransportError>;
}
