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

//! Error types for the backup engine.

use thiserror::Error;

use crate::{keys::DecodeError, store::StoreError, transport::TransportError};

/// Result type for the fallible operations of the backup engine.
pub type BackupResult<T> = Result<T, BackupError>;

/// Error describing a failed backup engine operation.
#[derive(Debug, Error)]
pub enum BackupError {
    /// The backup server could not be reached, the operation can be retried
    /// later.
    #[error("the backup server could not be reached: {0}")]
    Network(String),

    /// The server rejected the request, retrying without user action won't
    /// help.
    #[error("the server rejected the backup request: {0}")]
    ServerRejected(String),

    /// The given recovery key string could not be decoded into a recovery
    /// secret.
    #[error(transparent)]
    InvalidRecoveryKey(#[from] DecodeError),

    /// A backed up session record could not be decrypted or parsed.
    #[error(transparent)]
    Decryption(#[from] DecryptionError),

    /// The server reported that its current backup version differs from the
    /// one this request was made against.
    #[error("the server's current backup version is {current}")]
    VersionConflict {
        /// The version id the server reported as current.
        current: String,
    },

    /// The local session store returned an error.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<TransportError> for BackupError {
    fn from(value: TransportError) -> Self {
        match value {
            TransportError::Network(message) => Self::Network(message),
            TransportError::Rejected(message) => Self::ServerRejected(message),
            TransportError::NotFound => {
                Self::ServerRejected("the backup version is unknown to the server".to_owned())
            }
            TransportError::WrongVersion { current_version } => {
                Self::VersionConflict { current: current_version }
            }
        }
    }
}

/// Error describing a failure to decrypt a single backed up session record.
#[derive(Debug, Error)]
pub enum DecryptionError {
    /// The MAC check failed or the recovery key doesn't match the key the
    /// record was encrypted under.
    #[error("the session record could not be decrypted: {0}")]
    Decryption(#[from] vodozemac::pk_encryption::Error),

    /// Decryption succeeded but the plaintext did not contain a valid session
    /// key record.
    #[error("the decrypted record does not contain a valid session key: {0}")]
    MalformedRecord(#[from] serde_json::Error),
}
