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

//! The backup engine itself: the state machine and the backup version
//! lifecycle.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock},
    time::Duration,
};

use futures_core::Stream;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::{debug, info, instrument, trace, warn};

use crate::{
    error::BackupResult,
    keys::{BackupKey, RecoveryKey},
    observable::ChannelObservable,
    store::SessionStore,
    transport::{BackupTransport, TransportError},
    trust::{BackupVersionTrust, DeviceKeyProvider, TrustEvaluator},
    types::{BackupAlgorithm, BackupAuthData, BackupCreationInfo, BackupProgress, BackupVersion},
};

/// The state the backup engine is in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackupState {
    /// Nothing is known about the server-side backup yet, or the current
    /// version was deleted. The initial state.
    Unknown,
    /// The engine is fetching the current backup version from the server.
    CheckingVersion,
    /// The server's current version differs from the one the engine was
    /// using. Uploads are suspended until the engine checks again.
    WrongVersion,
    /// No backup exists on the server, or creating one failed. A new version
    /// can be created from here.
    Disabled,
    /// A backup version exists but none of its signatures come from a trusted
    /// device, so the engine refuses to upload to it.
    NotTrusted,
    /// A new backup version is being created on the server.
    Enabling,
    /// A trusted backup version is active, uploads run whenever new session
    /// keys appear.
    ReadyToBackUp,
    /// New session keys were detected, an upload will start once a short
    /// randomized delay elapses.
    WillBackUp,
    /// An upload run is in flight.
    BackingUp,
}

/// A single transition of the backup state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackupStateChange {
    /// The state the machine was in before the transition.
    pub old: BackupState,
    /// The state the machine transitioned into.
    pub new: BackupState,
}

/// Tunables of the backup engine.
#[derive(Clone, Debug)]
pub struct BackupConfig {
    /// The upper bound of the randomized delay between new session keys
    /// appearing and the upload starting.
    ///
    /// The delay spreads out uploads from multiple devices that received the
    /// same keys at the same time. Defaults to 10 seconds.
    pub max_upload_delay: Duration,
    /// Treat a valid signature from this very device as sufficient to trust
    /// a backup version. Defaults to `true`.
    pub trust_own_device: bool,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self { max_upload_delay: Duration::from_secs(10), trust_own_device: true }
    }
}

pub(crate) struct KeyBackupInner {
    pub(crate) transport: Arc<dyn BackupTransport>,
    pub(crate) store: Arc<dyn SessionStore>,
    device_keys: Arc<dyn DeviceKeyProvider>,
    trust: TrustEvaluator,
    config: BackupConfig,
    state: ChannelObservable<BackupStateChange>,
    pub(crate) progress: ChannelObservable<BackupProgress>,
    backup_key: StdRwLock<Option<BackupKey>>,
    // Serializes every state-machine mutation, the single logical actor.
    pub(crate) modify_lock: tokio::sync::Mutex<()>,
    // Single-flight guard for upload runs.
    pub(crate) upload_lock: tokio::sync::Mutex<()>,
    timer: StdMutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for KeyBackupInner {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("KeyBackupInner")
            .field("state", &self.state.get())
            .field("version", &self.enabled_version())
            .finish_non_exhaustive()
    }
}

impl KeyBackupInner {
    pub(crate) fn current_state(&self) -> BackupState {
        self.state.get().new
    }

    pub(crate) fn set_state(&self, new: BackupState) {
        let old = self.state.get().new;

        if old != new {
            trace!(?old, ?new, "Backup state changed");
            self.state.set(BackupStateChange { old, new });
        }
    }

    pub(crate) fn enabled_key(&self) -> Option<(BackupKey, String)> {
        let key = self.backup_key.read().unwrap().clone()?;
        let version = key.backup_version()?;

        Some((key, version))
    }

    pub(crate) fn enabled_version(&self) -> Option<String> {
        self.enabled_key().map(|(_, version)| version)
    }

    fn cancel_timer(&self) {
        if let Some(handle) = self.timer.lock().unwrap().take() {
            handle.abort();
        }
    }

    /// Stop the scheduler, drop the active backup key and land in the given
    /// state.
    pub(crate) fn disable(&self, state: BackupState) {
        self.cancel_timer();
        *self.backup_key.write().unwrap() = None;
        self.set_state(state);
    }
}

/// The key backup engine.
///
/// Session keys get encrypted under a per-backup public key and uploaded to
/// the server in batches; the matching private key, the recovery key, stays
/// with the user. The engine is cheaply cloneable, clones share all state.
///
/// # Examples
///
/// ```no_run
/// # use std::sync::Arc;
/// # use keysafe::{KeyBackup, MemorySessionStore};
/// # async fn example(
/// #     transport: Arc<dyn keysafe::BackupTransport>,
/// #     device_keys: Arc<dyn keysafe::DeviceKeyProvider>,
/// # ) -> keysafe::BackupResult<()> {
/// let store = Arc::new(MemorySessionStore::new());
/// let backup = KeyBackup::new(transport, store, device_keys);
///
/// if backup.check_and_start().await? == keysafe::BackupState::Disabled {
///     let info = backup.prepare_key_backup_version(None);
///     println!("Your recovery key: {}", info.encoded_recovery_key);
///     backup.create_key_backup_version(info).await?;
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct KeyBackup {
    pub(crate) inner: Arc<KeyBackupInner>,
}

impl KeyBackup {
    /// Create a new backup engine with the default configuration.
    pub fn new(
        transport: Arc<dyn BackupTransport>,
        store: Arc<dyn SessionStore>,
        device_keys: Arc<dyn DeviceKeyProvider>,
    ) -> Self {
        Self::with_config(transport, store, device_keys, BackupConfig::default())
    }

    /// Create a new backup engine with the given configuration.
    pub fn with_config(
        transport: Arc<dyn BackupTransport>,
        store: Arc<dyn SessionStore>,
        device_keys: Arc<dyn DeviceKeyProvider>,
        config: BackupConfig,
    ) -> Self {
        let trust = TrustEvaluator::new(device_keys.clone(), config.trust_own_device);
        let initial = BackupStateChange { old: BackupState::Unknown, new: BackupState::Unknown };

        Self {
            inner: Arc::new(KeyBackupInner {
                transport,
                store,
                device_keys,
                trust,
                config,
                state: ChannelObservable::new(initial),
                progress: ChannelObservable::new(BackupProgress::default()),
                backup_key: StdRwLock::new(None),
                modify_lock: tokio::sync::Mutex::new(()),
                upload_lock: tokio::sync::Mutex::new(()),
                timer: StdMutex::new(None),
            }),
        }
    }

    /// The state the engine is currently in.
    pub fn state(&self) -> BackupState {
        self.inner.current_state()
    }

    /// Are backups enabled, i.e. is there an active version uploads go to?
    pub fn enabled(&self) -> bool {
        self.inner.enabled_key().is_some()
    }

    /// The id of the backup version uploads currently go to, if any.
    pub fn version(&self) -> Option<String> {
        self.inner.enabled_version()
    }

    /// Subscribe to state transitions.
    ///
    /// The stream yields the current state first, as a change onto itself,
    /// followed by every subsequent transition as an `(old, new)` pair.
    pub fn state_stream(
        &self,
    ) -> impl Stream<Item = Result<BackupStateChange, BroadcastStreamRecvError>> {
        self.inner.state.subscribe()
    }

    /// Subscribe to progress snapshots of upload runs.
    pub fn progress_stream(
        &self,
    ) -> impl Stream<Item = Result<BackupProgress, BroadcastStreamRecvError>> {
        self.inner.progress.subscribe()
    }

    /// How far along the backup is right now.
    ///
    /// Valid at any time, also while no upload run is active; in that case
    /// `completed` is simply the number of sessions already backed up under
    /// the active version. All zeros when backups are disabled.
    pub async fn backup_progress(&self) -> BackupResult<BackupProgress> {
        match self.version() {
            Some(version) => {
                let counts = self.inner.store.session_counts(&version).await?;

                Ok(BackupProgress { total: counts.total, completed: counts.backed_up })
            }
            None => Ok(BackupProgress::default()),
        }
    }

    /// Re-evaluate the trust of a backup version against the current device
    /// trust state.
    pub fn trust_for_version(&self, version: &BackupVersion) -> BackupVersionTrust {
        self.inner.trust.verify(version)
    }

    /// Fetch a backup version from the server, the current one if no id is
    /// given.
    ///
    /// Returns `Ok(None)` when no backup exists. Useful to inspect the
    /// signatures of a version the engine refuses to upload to, via
    /// [`KeyBackup::trust_for_version`].
    pub async fn get_version(&self, version: Option<&str>) -> BackupResult<Option<BackupVersion>> {
        match self.inner.transport.get_version(version).await {
            Ok(version) => Ok(version),
            Err(TransportError::NotFound) => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    /// Fetch the current version from the server and decide whether backups
    /// can run.
    ///
    /// Lands in [`BackupState::Disabled`] when no backup exists, in
    /// [`BackupState::NotTrusted`] when one exists but carries no signature
    /// from a trusted device, and in [`BackupState::ReadyToBackUp`] when a
    /// trusted version was found. A transport failure returns the machine to
    /// [`BackupState::Unknown`] so the check can be retried later.
    #[instrument(skip_all)]
    pub async fn check_and_start(&self) -> BackupResult<BackupState> {
        let _guard = self.inner.modify_lock.lock().await;

        self.inner.cancel_timer();
        self.inner.set_state(BackupState::CheckingVersion);

        let version = match self.inner.transport.get_version(None).await {
            Ok(version) => version,
            Err(error) => {
                warn!(?error, "Failed to fetch the current backup version");
                self.inner.set_state(BackupState::Unknown);

                return Err(error.into());
            }
        };

        let new_state = match version {
            None => {
                debug!("No backup exists on the server");
                *self.inner.backup_key.write().unwrap() = None;

                BackupState::Disabled
            }
            Some(version) => {
                let trust = self.inner.trust.verify(&version);

                match (trust.usable(), version.auth_data()) {
                    (true, Some(auth_data)) => {
                        let key = BackupKey::new(auth_data.public_key);
                        key.set_version(version.version.clone());
                        *self.inner.backup_key.write().unwrap() = Some(key);

                        info!(
                            version = %version.version,
                            "Found a trusted backup version, resuming backups"
                        );

                        BackupState::ReadyToBackUp
                    }
                    _ => {
                        debug!(
                            version = %version.version,
                            "The backup version on the server is not trusted"
                        );
                        *self.inner.backup_key.write().unwrap() = None;

                        BackupState::NotTrusted
                    }
                }
            }
        };

        self.inner.set_state(new_state);

        Ok(new_state)
    }

    /// Generate everything that is needed to create a new backup version.
    ///
    /// If a passphrase is given the recovery key is derived from it, and the
    /// derivation salt and iteration count are embedded in the auth data so
    /// the key can be re-derived from the passphrase alone on another device.
    /// The auth data is signed with this device's key.
    ///
    /// The returned [`BackupCreationInfo`] contains the only copy of the
    /// recovery key; show `encoded_recovery_key` to the user before passing
    /// the info to [`KeyBackup::create_key_backup_version`].
    pub fn prepare_key_backup_version(&self, passphrase: Option<&str>) -> BackupCreationInfo {
        let (recovery_key, salt, rounds) = match passphrase {
            Some(passphrase) => {
                let (key, salt, rounds) = RecoveryKey::generate_with_passphrase(passphrase);
                (key, Some(salt), Some(rounds))
            }
            None => (RecoveryKey::new(), None, None),
        };

        let mut auth_data = BackupAuthData {
            public_key: recovery_key.public_key().public_key(),
            private_key_salt: salt,
            private_key_iterations: rounds,
            signatures: BTreeMap::new(),
        };

        let signature = self.inner.device_keys.sign(auth_data.to_signable_json().as_bytes());
        auth_data
            .signatures
            .insert(self.inner.device_keys.own_device_id().to_owned(), signature.to_base64());

        BackupCreationInfo {
            encoded_recovery_key: recovery_key.to_base58(),
            recovery_key,
            auth_data,
        }
    }

    /// Create a new backup version on the server and start using it.
    ///
    /// The new version supersedes any previous one, the server stops
    /// accepting uploads to older versions. On success the machine lands in
    /// [`BackupState::ReadyToBackUp`], on failure in
    /// [`BackupState::Disabled`].
    #[instrument(skip_all)]
    pub async fn create_key_backup_version(
        &self,
        info: BackupCreationInfo,
    ) -> BackupResult<String> {
        let _guard = self.inner.modify_lock.lock().await;

        self.inner.cancel_timer();
        self.inner.set_state(BackupState::Enabling);

        let BackupCreationInfo { recovery_key, auth_data, .. } = info;
        let algorithm = BackupAlgorithm::megolm_v1(auth_data);

        match self.inner.transport.create_version(&algorithm).await {
            Ok(version) => {
                let key = recovery_key.public_key();
                key.set_version(version.clone());
                *self.inner.backup_key.write().unwrap() = Some(key);

                self.inner.progress.set(BackupProgress::default());
                self.inner.set_state(BackupState::ReadyToBackUp);

                info!(%version, "Created a new backup version");

                Ok(version)
            }
            Err(error) => {
                warn!(?error, "Failed to create a new backup version");
                // Any previously active key must go too, otherwise the engine
                // would report itself as enabled while Disabled.
                self.inner.disable(BackupState::Disabled);

                Err(error.into())
            }
        }
    }

    /// Delete a backup version and every session key stored under it.
    ///
    /// If the version is the one uploads currently go to, the scheduler is
    /// stopped and the machine returns to [`BackupState::Unknown`] before the
    /// deletion is requested; the local backed-up markers are reset so a
    /// future backup starts from scratch. Deleting a version the server no
    /// longer knows about is not an error.
    #[instrument(skip(self))]
    pub async fn delete_key_backup_version(&self, version: &str) -> BackupResult<()> {
        let _guard = self.inner.modify_lock.lock().await;

        if self.inner.enabled_version().as_deref() == Some(version) {
            info!(version, "Deleting the active backup version, disabling backups");

            self.inner.disable(BackupState::Unknown);
            self.inner.store.reset_backup_state().await?;
            self.inner.progress.set(BackupProgress::default());
        }

        match self.inner.transport.delete_version(version).await {
            Ok(()) | Err(TransportError::NotFound) => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    /// Tell the engine that new session keys appeared in the store.
    ///
    /// If the engine is ready, an upload run is scheduled after a randomized
    /// delay of at most [`BackupConfig::max_upload_delay`]. Devices that
    /// received the same keys at the same time thus don't all hit the server
    /// at once. A no-op in every other state.
    pub fn session_keys_changed(&self) {
        if self.state() != BackupState::ReadyToBackUp {
            return;
        }

        self.inner.set_state(BackupState::WillBackUp);

        let delay = rand::thread_rng()
            .gen_range(Duration::ZERO..=self.inner.config.max_upload_delay);
        debug!(?delay, "Scheduling an upload run");

        let inner = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            if let Some(inner) = inner.upgrade() {
                if let Err(error) = (KeyBackup { inner }).backup().await {
                    warn!(?error, "The scheduled upload run failed");
                }
            }
        });

        if let Some(old) = self.inner.timer.lock().unwrap().replace(handle) {
            old.abort();
        }
    }

    /// Cancel a scheduled upload run before its delay elapses.
    pub fn cancel_scheduled_upload(&self) {
        self.inner.cancel_timer();

        if self.state() == BackupState::WillBackUp {
            self.inner.set_state(BackupState::ReadyToBackUp);
        }
    }
}
