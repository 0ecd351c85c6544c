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

//! The upload scheduler: turns pending local sessions into batched,
//! encrypted uploads.

use std::collections::BTreeMap;

use tracing::{debug, info, instrument, trace, warn};

use crate::{
    error::{BackupError, BackupResult},
    keys::BackupKey,
    machine::{BackupState, KeyBackup},
    transport::{BackupContents, TransportError},
    types::BackupProgress,
};

/// The number of session keys a single upload request carries at most.
const BACKUP_BATCH_SIZE: usize = 100;

impl KeyBackup {
    /// Upload every session key that isn't yet backed up under the active
    /// version.
    ///
    /// At most one upload run is active at a time; calling this while a run
    /// is already in flight is a no-op. Sessions are uploaded in batches,
    /// each successful batch is marked as backed up in the store, so an
    /// interrupted run resumes where it left off the next time.
    ///
    /// A no-op as well when backups aren't enabled or the machine isn't in a
    /// state that permits uploads.
    #[instrument(skip_all)]
    pub async fn backup(&self) -> BackupResult<()> {
        let Ok(_guard) = self.inner.upload_lock.try_lock() else {
            debug!("An upload run is already active");
            return Ok(());
        };

        // The entry checks and the transition into BackingUp must not
        // interleave with a lifecycle operation: a deletion landing between
        // them would strand the machine in BackingUp with backups disabled.
        let (key, version) = {
            let _modify = self.inner.modify_lock.lock().await;

            let Some((key, version)) = self.inner.enabled_key() else {
                debug!("Backups are not enabled, not uploading any session keys");
                return Ok(());
            };

            match self.state() {
                BackupState::ReadyToBackUp | BackupState::WillBackUp => {}
                state => {
                    debug!(?state, "Not uploading any session keys in this state");
                    return Ok(());
                }
            }

            self.inner.set_state(BackupState::BackingUp);

            (key, version)
        };

        let result = self.upload_pending(&key, &version).await;

        // Errors the transport already mapped to a state land there, anything
        // else is transient and the run can be retried.
        if result.is_err() && self.state() == BackupState::BackingUp {
            self.inner.set_state(BackupState::ReadyToBackUp);
        }

        result
    }

    async fn upload_pending(&self, key: &BackupKey, version: &str) -> BackupResult<()> {
        // Session keys can land in the store while a run is in flight, and
        // their notification is dropped because the machine already left
        // ReadyToBackUp. Re-query until the store drains so none of them are
        // stranded waiting for an unrelated trigger.
        loop {
            let pending = self.inner.store.sessions_for_backup(version).await?;

            let counts = self.inner.store.session_counts(version).await?;
            let total = counts.total;
            let mut completed = counts.backed_up;

            self.inner.progress.set(BackupProgress { total, completed });

            if pending.is_empty() {
                break;
            }

            debug!(pending = pending.len(), "Uploading pending session keys");

            for batch in pending.chunks(BACKUP_BATCH_SIZE) {
                let mut contents: BackupContents = BTreeMap::new();
                let mut uploaded = Vec::with_capacity(batch.len());

                for session in batch {
                    let encrypted = key.encrypt(&session.keys);

                    contents
                        .entry(session.room_id.clone())
                        .or_default()
                        .insert(session.session_id.clone(), encrypted);
                    uploaded.push((session.room_id.clone(), session.session_id.clone()));
                }

                if let Err(error) = self.inner.transport.put_sessions(version, contents).await {
                    return Err(self.handle_upload_error(error));
                }

                // The version may have changed while the request was in
                // flight, in which case the batch went to a superseded
                // version and the markers must not be advanced. Whoever
                // changed the version also owns the state, unless the machine
                // is somehow still ours.
                if self.inner.enabled_version().as_deref() != Some(version) {
                    debug!("The backup version changed mid-run, discarding the rest of the run");

                    if self.state() == BackupState::BackingUp {
                        self.inner.set_state(BackupState::ReadyToBackUp);
                    }

                    return Ok(());
                }

                self.inner.store.mark_sessions_as_backed_up(version, &uploaded).await?;

                completed += uploaded.len() as u64;
                self.inner.progress.set(BackupProgress { total, completed });
                trace!(completed, total, "Uploaded a batch of session keys");
            }
        }

        self.inner.set_state(BackupState::ReadyToBackUp);
        info!("All session keys are backed up");

        Ok(())
    }

    fn handle_upload_error(&self, error: TransportError) -> BackupError {
        match &error {
            TransportError::Network(_) => {
                warn!("The server could not be reached, the upload run will be retried later");
            }
            TransportError::WrongVersion { current_version } => {
                warn!(
                    current_version = current_version.as_str(),
                    "The backup version was superseded on the server, suspending uploads"
                );
                self.inner.disable(BackupState::WrongVersion);
            }
            TransportError::NotFound => {
                warn!("The backup version was deleted on the server, disabling backups");
                self.inner.disable(BackupState::Unknown);
            }
            TransportError::Rejected(reason) => {
                warn!(reason = reason.as_str(), "The server rejected the upload");
                self.inner.disable(BackupState::Disabled);
            }
        }

        error.into()
    }
}
