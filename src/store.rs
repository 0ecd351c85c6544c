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

//! Local persistence of session keys and of their backed-up markers.

use std::{
    collections::BTreeMap,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;

use crate::types::BackupSession;

/// Errors the session store can produce.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The underlying storage backend failed.
    #[error("the storage backend failed: {0}")]
    Backend(String),
    /// A stored value could not be serialized or deserialized.
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

/// How many of the store's sessions are covered by a given backup version.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SessionCounts {
    /// The total number of sessions in the store.
    pub total: u64,
    /// How many of them are marked as backed up under the version.
    pub backed_up: u64,
}

/// Local storage for session keys, as needed by the backup engine.
///
/// The backed-up marker is scoped to a backup version: a session backed up
/// under version "1" counts as not backed up once version "2" is current.
#[async_trait]
pub trait SessionStore: Send + Sync + std::fmt::Debug {
    /// Get the sessions that still need to be uploaded to the given backup
    /// version.
    async fn sessions_for_backup(&self, version: &str) -> Result<Vec<BackupSession>, StoreError>;

    /// Mark the given sessions as backed up under the given version.
    async fn mark_sessions_as_backed_up(
        &self,
        version: &str,
        sessions: &[(String, String)],
    ) -> Result<(), StoreError>;

    /// Count the store's sessions and how many are backed up under the given
    /// version.
    async fn session_counts(&self, version: &str) -> Result<SessionCounts, StoreError>;

    /// Forget every backed-up marker, regardless of version.
    ///
    /// Called when the backup gets disabled so a future backup starts over
    /// from scratch.
    async fn reset_backup_state(&self) -> Result<(), StoreError>;

    /// Import a restored session into the store.
    ///
    /// Returns `true` if the session was added and `false` if an equivalent
    /// or conflicting session was already present.
    async fn import_session(&self, session: BackupSession) -> Result<bool, StoreError>;
}

#[derive(Debug, Default)]
struct MemoryStoreInner {
    // Keyed by (room_id, session_id).
    sessions: BTreeMap<(String, String), BackupSession>,
    backed_up: BTreeMap<(String, String), String>,
}

/// A [`SessionStore`] that lives entirely in memory.
///
/// Useful for tests and for callers that keep their own persistent session
/// storage elsewhere.
#[derive(Clone, Debug, Default)]
pub struct MemorySessionStore {
    inner: Arc<RwLock<MemoryStoreInner>>,
}

impl MemorySessionStore {
    /// Create a new, empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session to the store, overwriting any previous session with the
    /// same room and session id.
    pub fn add_session(&self, session: BackupSession) {
        let mut inner = self.inner.write().unwrap();
        let key = (session.room_id.clone(), session.session_id.clone());

        inner.backed_up.remove(&key);
        inner.sessions.insert(key, session);
    }

    /// The number of sessions currently in the store.
    pub fn session_count(&self) -> usize {
        self.inner.read().unwrap().sessions.len()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn sessions_for_backup(&self, version: &str) -> Result<Vec<BackupSession>, StoreError> {
        let inner = self.inner.read().unwrap();

        Ok(inner
            .sessions
            .iter()
            .filter(|(key, _)| inner.backed_up.get(*key).map(String::as_str) != Some(version))
            .map(|(_, session)| session.clone())
            .collect())
    }

    async fn mark_sessions_as_backed_up(
        &self,
        version: &str,
        sessions: &[(String, String)],
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().unwrap();

        for (room_id, session_id) in sessions {
            let key = (room_id.clone(), session_id.clone());

            if inner.sessions.contains_key(&key) {
                inner.backed_up.insert(key, version.to_owned());
            }
        }

        Ok(())
    }

    async fn session_counts(&self, version: &str) -> Result<SessionCounts, StoreError> {
        let inner = self.inner.read().unwrap();

        let backed_up = inner
            .backed_up
            .iter()
            .filter(|(key, marker)| {
                marker.as_str() == version && inner.sessions.contains_key(*key)
            })
            .count() as u64;

        Ok(SessionCounts { total: inner.sessions.len() as u64, backed_up })
    }

    async fn reset_backup_state(&self) -> Result<(), StoreError> {
        self.inner.write().unwrap().backed_up.clear();

        Ok(())
    }

    async fn import_session(&self, session: BackupSession) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().unwrap();
        let key = (session.room_id.clone(), session.session_id.clone());

        if inner.sessions.contains_key(&key) {
            Ok(false)
        } else {
            inner.sessions.insert(key, session);
            Ok(true)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{MemorySessionStore, SessionCounts, SessionStore};
    use crate::types::{BackupSession, SessionKeys};

    fn session(room_id: &str, session_id: &str) -> BackupSession {
        BackupSession {
            room_id: room_id.to_owned(),
            session_id: session_id.to_owned(),
            keys: SessionKeys {
                sender_key: "sender".to_owned(),
                forwarding_key_chain: vec![],
                session_key: "secret".to_owned(),
            },
        }
    }

    #[tokio::test]
    async fn markers_are_scoped_to_a_version() {
        let store = MemorySessionStore::new();
        store.add_session(session("!room:example.org", "session_a"));
        store.add_session(session("!room:example.org", "session_b"));

        let pending = store.sessions_for_backup("1").await.unwrap();
        assert_eq!(pending.len(), 2);

        store
            .mark_sessions_as_backed_up(
                "1",
                &[("!room:example.org".to_owned(), "session_a".to_owned())],
            )
            .await
            .unwrap();

        assert_eq!(store.sessions_for_backup("1").await.unwrap().len(), 1);
        assert_eq!(
            store.session_counts("1").await.unwrap(),
            SessionCounts { total: 2, backed_up: 1 }
        );

        // A new version starts from zero.
        assert_eq!(store.sessions_for_backup("2").await.unwrap().len(), 2);
        assert_eq!(
            store.session_counts("2").await.unwrap(),
            SessionCounts { total: 2, backed_up: 0 }
        );
    }

    #[tokio::test]
    async fn resetting_forgets_all_markers() {
        let store = MemorySessionStore::new();
        store.add_session(session("!room:example.org", "session_a"));

        store
            .mark_sessions_as_backed_up(
                "1",
                &[("!room:example.org".to_owned(), "session_a".to_owned())],
            )
            .await
            .unwrap();
        store.reset_backup_state().await.unwrap();

        assert_eq!(
            store.session_counts("1").await.unwrap(),
            SessionCounts { total: 1, backed_up: 0 }
        );
    }

    #[tokio::test]
    async fn importing_never_overwrites() {
        let store = MemorySessionStore::new();
        store.add_session(session("!room:example.org", "session_a"));

        let imported = store.import_session(session("!room:example.org", "session_a")).await;
        assert!(matches!(imported, Ok(false)), "An existing session should not be replaced");

        let imported = store.import_session(session("!room:example.org", "session_b")).await;
        assert!(matches!(imported, Ok(true)));
        assert_eq!(store.session_count(), 2);
    }

    #[tokio::test]
    async fn adding_a_session_again_clears_its_marker() {
        let store = MemorySessionStore::new();
        store.add_session(session("!room:example.org", "session_a"));

        store
            .mark_sessions_as_backed_up(
                "1",
                &[("!room:example.org".to_owned(), "session_a".to_owned())],
            )
            .await
            .unwrap();

        store.add_session(session("!room:example.org", "session_a"));

        assert_eq!(
            store.session_counts("1").await.unwrap(),
            SessionCounts { total: 1, backed_up: 0 }
        );
    }
}
