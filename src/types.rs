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

//! The data model of the backup engine: versions, auth data and the wire
//! representation of backed up session keys.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use vodozemac::Curve25519PublicKey;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{
    keys::RecoveryKey,
    utilities::{base64_bytes, deserialize_curve_key, serialize_curve_key},
};

/// The full name of the only backup algorithm this engine implements.
pub const MEGOLM_BACKUP_V1: &str = "m.megolm_backup.v1.curve25519-aes-sha2";

/// A backup version that exists on the server.
///
/// Immutable once fetched, a new version id supersedes it.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BackupVersion {
    /// The opaque id the server assigned to this version.
    pub version: String,
    /// The algorithm the version uses, including its auth data.
    #[serde(flatten)]
    pub algorithm: BackupAlgorithm,
    /// The number of session keys stored under this version.
    pub count: u64,
    /// An opaque string that changes every time a key is uploaded to this
    /// version.
    ///
    /// The engine itself never compares etags: a changed etag means another
    /// device added records to the *same* version, which never invalidates
    /// local uploads. Supersession always comes with a fresh version id, so
    /// the id comparison at batch completion and the server's version
    /// mismatch error cover it. The etag is carried for callers that want to
    /// poll for remote additions.
    pub etag: String,
}

impl BackupVersion {
    /// Get the auth data of this version if it uses the algorithm we support.
    pub fn auth_data(&self) -> Option<&BackupAuthData> {
        match &self.algorithm {
            BackupAlgorithm::MegolmBackupV1Curve25519AesSha2 { auth_data } => Some(auth_data),
            BackupAlgorithm::Other { .. } => None,
        }
    }
}

/// The algorithm and auth data of a backup version.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(try_from = "AlgorithmHelper")]
pub enum BackupAlgorithm {
    /// The Curve25519 ephemeral-key scheme this engine implements.
    MegolmBackupV1Curve25519AesSha2 {
        /// The signed auth data of the version.
        auth_data: BackupAuthData,
    },
    /// An algorithm this engine doesn't know about, kept around so we don't
    /// destroy data we can't interpret.
    Other {
        /// The name of the unknown algorithm.
        algorithm: String,
        /// The raw auth data of the unknown algorithm.
        auth_data: BTreeMap<String, Value>,
    },
}

impl BackupAlgorithm {
    /// Create the algorithm description for a new `MEGOLM_BACKUP_V1` version.
    pub fn megolm_v1(auth_data: BackupAuthData) -> Self {
        Self::MegolmBackupV1Curve25519AesSha2 { auth_data }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct AlgorithmHelper {
    algorithm: String,
    auth_data: Value,
}

impl TryFrom<AlgorithmHelper> for BackupAlgorithm {
    type Error = serde_json::Error;

    fn try_from(value: AlgorithmHelper) -> Result<Self, Self::Error> {
        Ok(match value.algorithm.as_str() {
            MEGOLM_BACKUP_V1 => BackupAlgorithm::MegolmBackupV1Curve25519AesSha2 {
                auth_data: serde_json::from_value(value.auth_data)?,
            },
            _ => BackupAlgorithm::Other {
                algorithm: value.algorithm,
                auth_data: serde_json::from_value(value.auth_data)?,
            },
        })
    }
}

impl Serialize for BackupAlgorithm {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let helper = match self {
            BackupAlgorithm::MegolmBackupV1Curve25519AesSha2 { auth_data } => AlgorithmHelper {
                algorithm: MEGOLM_BACKUP_V1.to_owned(),
                auth_data: serde_json::to_value(auth_data).map_err(serde::ser::Error::custom)?,
            },
            BackupAlgorithm::Other { algorithm, auth_data } => AlgorithmHelper {
                algorithm: algorithm.to_owned(),
                auth_data: serde_json::to_value(auth_data).map_err(serde::ser::Error::custom)?,
            },
        };

        helper.serialize(serializer)
    }
}

/// The authenticated data of a backup version.
///
/// Contains the public key session keys get encrypted under, the optional
/// passphrase derivation info and the device signatures the trust evaluation
/// is based on.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BackupAuthData {
    /// The Curve25519 public key used to encrypt the backed up session keys.
    #[serde(deserialize_with = "deserialize_curve_key", serialize_with = "serialize_curve_key")]
    pub public_key: Curve25519PublicKey,
    /// The salt that was used if the recovery key was derived from a
    /// passphrase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_salt: Option<String>,
    /// The PBKDF2 iteration count if the recovery key was derived from a
    /// passphrase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_iterations: Option<u32>,
    /// Signatures over the canonical form of this auth data, keyed by the id
    /// of the device that created them.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub signatures: BTreeMap<String, String>,
}

impl BackupAuthData {
    /// Serialize the auth data into the canonical form signatures are created
    /// over: the signatures themselves removed and all keys ordered.
    pub fn to_signable_json(&self) -> String {
        let mut value = serde_json::to_value(self)
            .expect("We should always be able to serialize our own auth data");

        if let Some(object) = value.as_object_mut() {
            object.remove("signatures");
        }

        // `serde_json::Value` objects are backed by a `BTreeMap`, so the
        // string form already has its keys in canonical order.
        value.to_string()
    }
}

/// The encrypted form of a single session key as it is stored on the server.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EncryptedSessionData {
    /// The public part of the ephemeral Curve25519 key that was used to
    /// encrypt this record.
    #[serde(deserialize_with = "deserialize_curve_key", serialize_with = "serialize_curve_key")]
    pub ephemeral: Curve25519PublicKey,
    /// The ciphertext of the session key record.
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
    /// The message authentication code of the ciphertext.
    #[serde(with = "base64_bytes")]
    pub mac: Vec<u8>,
}

/// The exportable part of a session key, this is what ends up encrypted
/// inside an [`EncryptedSessionData`].
#[derive(Clone, Serialize, Deserialize, PartialEq, Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    /// The Curve25519 key of the device which initiated the session.
    pub sender_key: String,
    /// The chain of Curve25519 keys through which this session was forwarded.
    #[serde(default)]
    pub forwarding_key_chain: Vec<String>,
    /// The session key material itself.
    pub session_key: String,
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKeys")
            .field("sender_key", &self.sender_key)
            .field("forwarding_key_chain", &self.forwarding_key_chain)
            .finish_non_exhaustive()
    }
}

/// A session key together with the room and session ids that address it.
#[derive(Clone, Debug, PartialEq)]
pub struct BackupSession {
    /// The id of the room the session belongs to.
    pub room_id: String,
    /// The unique id of the session.
    pub session_id: String,
    /// The exportable key material of the session.
    pub keys: SessionKeys,
}

/// A snapshot of how far the backup has progressed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BackupProgress {
    /// The total number of session keys the store knows about.
    pub total: u64,
    /// How many of those have been backed up under the current version.
    pub completed: u64,
}

/// Everything that is needed to create a new backup version.
///
/// Produced by [`KeyBackup::prepare_key_backup_version`] and consumed exactly
/// once by [`KeyBackup::create_key_backup_version`]. The recovery key is
/// wiped when this struct is dropped.
///
/// [`KeyBackup::prepare_key_backup_version`]: crate::KeyBackup::prepare_key_backup_version
/// [`KeyBackup::create_key_backup_version`]: crate::KeyBackup::create_key_backup_version
#[derive(Debug)]
pub struct BackupCreationInfo {
    /// The freshly generated or passphrase-derived recovery key.
    pub recovery_key: RecoveryKey,
    /// The user-facing string form of the recovery key, to be shown to the
    /// user exactly once.
    pub encoded_recovery_key: String,
    /// The signed auth data that will be submitted to the server.
    pub auth_data: BackupAuthData,
}

/// Which part of a backup a restore operation should fetch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RestoreScope {
    /// Restore every session key stored in the backup.
    All,
    /// Restore all session keys of a single room.
    Room {
        /// The id of the room to restore.
        room_id: String,
    },
    /// Restore a single session key.
    Session {
        /// The id of the room the session belongs to.
        room_id: String,
        /// The id of the session to restore.
        session_id: String,
    },
}

/// The result of a restore operation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RestoreOutcome {
    /// How many records the server returned for the requested scope.
    pub found: u64,
    /// How many of those were successfully decrypted and imported into the
    /// session store.
    pub imported: u64,
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;
    use vodozemac::Curve25519PublicKey;

    use super::{BackupAlgorithm, BackupVersion};

    #[test]
    fn version_deserialization() {
        let json = json!({
            "version": "1",
            "algorithm": "m.megolm_backup.v1.curve25519-aes-sha2",
            "auth_data": {
                "public_key": "XjhWTCjW7l59pbfx9tlCBQolfnIQWARoKOzjTOPSlWM",
                "signatures": {
                    "DEVICEID": "signature"
                }
            },
            "count": 42,
            "etag": "anopaquestring",
        });

        let version: BackupVersion = serde_json::from_value(json.clone())
            .expect("We should be able to deserialize a backup version");

        assert_matches!(
            &version.algorithm,
            BackupAlgorithm::MegolmBackupV1Curve25519AesSha2 { .. }
        );
        assert_eq!(version.count, 42);
        assert_eq!(
            version.auth_data().expect("The auth data should be accessible").public_key,
            Curve25519PublicKey::from_base64("XjhWTCjW7l59pbfx9tlCBQolfnIQWARoKOzjTOPSlWM")
                .unwrap()
        );

        let serialized = serde_json::to_value(&version)
            .expect("We should be able to serialize a backup version");
        assert_eq!(json, serialized, "The version should roundtrip through serde");
    }

    #[test]
    fn unknown_algorithm_roundtrips() {
        let json = json!({
            "version": "5",
            "algorithm": "caesar.cipher",
            "auth_data": { "shift": 13 },
            "count": 0,
            "etag": "0",
        });

        let version: BackupVersion = serde_json::from_value(json.clone())
            .expect("An unknown algorithm should still deserialize");

        assert_matches!(&version.algorithm, BackupAlgorithm::Other { .. });
        assert!(version.auth_data().is_none());

        let serialized = serde_json::to_value(&version).unwrap();
        assert_eq!(json, serialized);
    }

    #[test]
    fn signable_json_omits_signatures() {
        let json = json!({
            "public_key": "XjhWTCjW7l59pbfx9tlCBQolfnIQWARoKOzjTOPSlWM",
            "signatures": {
                "DEVICEID": "signature"
            }
        });

        let auth_data: super::BackupAuthData = serde_json::from_value(json).unwrap();
        let signable = auth_data.to_signable_json();

        assert!(!signable.contains("signatures"));
        assert!(signable.contains("public_key"));
    }
}
