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

use std::sync::{Arc, Mutex};

use vodozemac::{pk_encryption::PkEncryption, Curve25519PublicKey, KeyError};
use zeroize::Zeroizing;

use crate::types::{EncryptedSessionData, SessionKeys};

#[derive(Debug)]
struct InnerBackupKey {
    key: Curve25519PublicKey,
    version: Mutex<Option<String>>,
}

/// The public part of a backup key pair.
///
/// This is all that's needed to encrypt session keys for upload: it is
/// published in the backup version's auth data, so any device that trusts the
/// version can contribute to the backup without holding the recovery key.
#[derive(Clone)]
pub struct BackupKey {
    inner: Arc<InnerBackupKey>,
}

impl std::fmt::Debug for BackupKey {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("BackupKey")
            .field("key", &self.to_base64())
            .field("version", &self.backup_version())
            .finish()
    }
}

impl BackupKey {
    pub(crate) fn new(key: Curve25519PublicKey) -> Self {
        Self { inner: InnerBackupKey { key, version: Mutex::new(None) }.into() }
    }

    /// Try to create a `BackupKey` from a base64 encoded Curve25519 public
    /// key.
    pub fn from_base64(public_key: &str) -> Result<Self, KeyError> {
        Ok(Self::new(Curve25519PublicKey::from_base64(public_key)?))
    }

    /// Convert the backup key to a base64 encoded string.
    pub fn to_base64(&self) -> String {
        self.inner.key.to_base64()
    }

    /// Get the raw Curve25519 public key.
    pub fn public_key(&self) -> Curve25519PublicKey {
        self.inner.key
    }

    /// Get the id of the backup version this key belongs to, if any.
    pub fn backup_version(&self) -> Option<String> {
        self.inner.version.lock().unwrap().clone()
    }

    /// Set the id of the backup version this key belongs to.
    ///
    /// Session keys won't be uploaded unless the key is tied to a version.
    pub fn set_version(&self, version: String) {
        *self.inner.version.lock().unwrap() = Some(version);
    }

    /// Encrypt the exportable part of a session key under this backup key.
    ///
    /// A fresh ephemeral Curve25519 key is generated per call, so two
    /// encryptions of the same record never produce the same ciphertext.
    /// That's fine, each record is self-contained.
    pub fn encrypt(&self, session_keys: &SessionKeys) -> EncryptedSessionData {
        let pk = PkEncryption::from_key(self.inner.key);

        // The plaintext copy of the key material shouldn't outlive the call.
        let plaintext = Zeroizing::new(
            serde_json::to_vec(session_keys)
                .expect("We should always be able to serialize session keys"),
        );

        let message = pk.encrypt(&plaintext);

        EncryptedSessionData {
            ephemeral: message.ephemeral_key,
            ciphertext: message.ciphertext,
            mac: message.mac,
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use crate::{
        error::DecryptionError,
        keys::RecoveryKey,
        types::SessionKeys,
        utilities::json_convert,
    };

    fn session_keys() -> SessionKeys {
        SessionKeys {
            sender_key: "DeHIg4gwhClxzFYcmNntPNF9YtsdZbmMy8+3kzCMXHA".to_owned(),
            forwarding_key_chain: vec![],
            session_key: "AQAAAABvWMNZjKFtebYIePKieQguozuoLgzeY6wKcyJjLJcJtQgy1dPqTBD12U+XrYLrRHn\
                          lKmxoozlhFqJl456+9hlHCL+yq+6ScFuBHtJepnY1l2bdLb4T0JMDkNsNErkiLiLnD6yp3J\
                          DSjIhkdHxmup/huygrmroq6/L5TaThEoqvW4DPIuO14btKudsS34FF82pwjKS4p6Mlch+0e\
                          fHAblQV"
                .to_owned(),
        }
    }

    #[test]
    fn encryption_roundtrip() {
        let recovery_key = RecoveryKey::new();
        let backup_key = recovery_key.public_key();

        let encrypted = backup_key.encrypt(&session_keys());
        let decrypted = recovery_key
            .decrypt_session_data(&encrypted)
            .expect("We should be able to decrypt a record we encrypted ourselves");

        assert_eq!(decrypted, session_keys());
    }

    #[test]
    fn fresh_ephemeral_key_per_record() {
        let backup_key = RecoveryKey::new().public_key();

        let first = backup_key.encrypt(&session_keys());
        let second = backup_key.encrypt(&session_keys());

        assert_ne!(first.ephemeral, second.ephemeral);
        assert_ne!(first.ciphertext, second.ciphertext);
    }

    #[test]
    fn wrong_recovery_key_fails_to_decrypt() {
        let backup_key = RecoveryKey::new().public_key();
        let wrong_key = RecoveryKey::new();

        let encrypted = backup_key.encrypt(&session_keys());

        assert_matches!(
            wrong_key.decrypt_session_data(&encrypted),
            Err(DecryptionError::Decryption(_))
        );
    }

    #[test]
    fn wire_record_roundtrips_through_serde() {
        let backup_key = RecoveryKey::new().public_key();
        let encrypted = backup_key.encrypt(&session_keys());

        let deserialized: crate::types::EncryptedSessionData = json_convert(&encrypted)
            .expect("The wire record should roundtrip through its JSON form");

        assert_eq!(encrypted, deserialized);
    }

    #[test]
    fn backup_key_version_bookkeeping() {
        let backup_key = RecoveryKey::new().public_key();

        assert!(backup_key.backup_version().is_none());

        backup_key.set_version("1".to_owned());
        assert_eq!(backup_key.backup_version().as_deref(), Some("1"));
    }
}
