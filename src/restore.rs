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

//! The restore engine: downloads backed up session keys, decrypts them with
//! the recovery key and imports them into the local store.

use tracing::{debug, info, instrument, warn};

use crate::{
    error::{BackupError, BackupResult},
    keys::RecoveryKey,
    machine::KeyBackup,
    types::{BackupSession, BackupVersion, RestoreOutcome, RestoreScope},
};

impl KeyBackup {
    /// Restore backed up session keys using an encoded recovery key.
    ///
    /// `version` selects the backup version to restore from, `None` means
    /// the server's current one. Records that fail to decrypt, or that the
    /// store refuses to import, are counted but never abort the restore; the
    /// operation as a whole fails only if the recovery key doesn't decode or
    /// the download itself fails.
    #[instrument(skip(self, recovery_key))]
    pub async fn restore_with_recovery_key(
        &self,
        version: Option<&str>,
        recovery_key: &str,
        scope: &RestoreScope,
    ) -> BackupResult<RestoreOutcome> {
        let recovery_key = RecoveryKey::from_base58(recovery_key)?;
        let version = self.fetch_version(version).await?;

        self.restore(&version, recovery_key, scope).await
    }

    /// Restore backed up session keys using the passphrase the recovery key
    /// was derived from.
    ///
    /// The derivation salt and iteration count are read from the version's
    /// auth data; versions that weren't created with a passphrase can't be
    /// restored this way.
    #[instrument(skip(self, passphrase))]
    pub async fn restore_with_passphrase(
        &self,
        version: Option<&str>,
        passphrase: &str,
        scope: &RestoreScope,
    ) -> BackupResult<RestoreOutcome> {
        let version = self.fetch_version(version).await?;

        let auth_data = version.auth_data().ok_or_else(|| {
            BackupError::ServerRejected(
                "the backup version uses an unsupported algorithm".to_owned(),
            )
        })?;

        let (Some(salt), Some(rounds)) =
            (&auth_data.private_key_salt, auth_data.private_key_iterations)
        else {
            return Err(crate::keys::DecodeError::MissingDerivationInfo.into());
        };

        let recovery_key = RecoveryKey::from_passphrase(passphrase, salt, rounds);

        self.restore(&version, recovery_key, scope).await
    }

    async fn fetch_version(&self, version: Option<&str>) -> BackupResult<BackupVersion> {
        self.inner.transport.get_version(version).await?.ok_or_else(|| {
            BackupError::ServerRejected("no backup exists on the server".to_owned())
        })
    }

    async fn restore(
        &self,
        version: &BackupVersion,
        recovery_key: RecoveryKey,
        scope: &RestoreScope,
    ) -> BackupResult<RestoreOutcome> {
        if let Some(auth_data) = version.auth_data() {
            if recovery_key.public_key().public_key() != auth_data.public_key {
                warn!(
                    "The recovery key does not match the version's public key, \
                     no records will decrypt"
                );
            }
        }

        let contents = self.inner.transport.get_sessions(&version.version, scope).await?;
        let mut outcome = RestoreOutcome::default();

        for (room_id, sessions) in contents {
            for (session_id, record) in sessions {
                outcome.found += 1;

                let keys = match recovery_key.decrypt_session_data(&record) {
                    Ok(keys) => keys,
                    Err(error) => {
                        warn!(
                            room_id = room_id.as_str(),
                            session_id = session_id.as_str(),
                            ?error,
                            "Failed to decrypt a backed up session key"
                        );
                        continue;
                    }
                };

                let session = BackupSession { room_id: room_id.clone(), session_id, keys };

                match self.inner.store.import_session(session).await {
                    Ok(true) => outcome.imported += 1,
                    Ok(false) => {
                        debug!(
                            room_id = room_id.as_str(),
                            "The store refused a restored session key, skipping it"
                        );
                    }
                    Err(error) => {
                        warn!(
                            room_id = room_id.as_str(),
                            ?error,
                            "Failed to import a restored session key"
                        );
                    }
                }
            }
        }

        info!(
            found = outcome.found,
            imported = outcome.imported,
            "Restored session keys from the backup"
        );

        Ok(outcome)
    }
}
