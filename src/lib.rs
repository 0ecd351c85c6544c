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

#![doc = include_str!("../README.md")]
#![warn(missing_docs, missing_debug_implementations)]

mod error;
mod keys;
mod machine;
mod observable;
mod restore;
pub mod store;
pub mod transport;
mod trust;
pub mod types;
mod upload;
mod utilities;

pub use error::{BackupError, BackupResult, DecryptionError};
pub use keys::{BackupKey, DecodeError, RecoveryKey};
pub use machine::{BackupConfig, BackupState, BackupStateChange, KeyBackup};
pub use store::{MemorySessionStore, SessionCounts, SessionStore, StoreError};
pub use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
pub use transport::{BackupContents, BackupTransport, TransportError};
pub use trust::{BackupVersionTrust, DeviceKey, DeviceKeyProvider, SignatureState};
pub use types::{
    BackupAlgorithm, BackupAuthData, BackupCreationInfo, BackupProgress, BackupSession,
    BackupVersion, EncryptedSessionData, RestoreOutcome, RestoreScope, SessionKeys,
    MEGOLM_BACKUP_V1,
};
