//! Write-through session cache.
//!
//! Device configuration pulls look sessions up on every call, so sessions are
//! served from memory. Writes go to the database first, then the cache. A
//! cache miss in [`SessionStore::get`] is the only read that reaches the
//! database.

use std::collections::HashMap;

use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::storage::{Database, DatabaseError, Device, Session};
use ztna_core::db::unix_timestamp;

pub struct SessionStore {
    db: Database,
    cache: RwLock<HashMap<String, Session>>,
}

impl SessionStore {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Load every unexpired persisted session into the cache.
    pub async fn warmup(&self) -> Result<usize, DatabaseError> {
        let now = unix_timestamp();
        let sessions = self.db.read_session_infos().await?;

        let mut cache = self.cache.write().await;
        for session in sessions.into_iter().filter(|s| !s.expired_at(now)) {
            cache.insert(session.key.clone(), session);
        }
        info!(sessions = cache.len(), "Session cache warmed up");
        Ok(cache.len())
    }

    /// Look up a session, falling through to the database on a miss.
    ///
    /// Expired sessions are returned as-is; callers must check
    /// [`Session::expired`] before authorizing anything.
    pub async fn get(&self, key: &str) -> Result<Session, DatabaseError> {
        if let Some(session) = self.cache.read().await.get(key) {
            return Ok(session.clone());
        }

        debug!(session = %key_prefix(key), "Session cache miss");
        let session = self.db.read_session_info(key).await?;
        self.cache
            .write()
            .await
            .insert(session.key.clone(), session.clone());
        Ok(session)
    }

    /// Persist and cache a session, returning what was stored.
    ///
    /// The embedded device is re-read under the cache write lock. Device
    /// writes hit the database before [`SessionStore::update_device`] patches
    /// the cache, so a copy taken earlier by the caller can never overwrite
    /// a newer health state.
    pub async fn set(&self, mut session: Session) -> Result<Session, DatabaseError> {
        let mut cache = self.cache.write().await;
        let current = self.db.read_device_by_id(session.device_id()).await?;
        if current != session.device {
            debug!(session = %key_prefix(&session.key), device_id = current.id, "Session device refreshed");
            session.device = current;
        }
        self.db.add_session_info(&session).await?;
        cache.insert(session.key.clone(), session.clone());
        Ok(session)
    }

    /// The unexpired cached session with the latest expiry for a device.
    pub async fn cached_session_from_device_id(&self, device_id: i64) -> Option<Session> {
        let now = unix_timestamp();
        self.cache
            .read()
            .await
            .values()
            .filter(|s| s.device_id() == device_id && !s.expired_at(now))
            .max_by_key(|s| s.expiry)
            .cloned()
    }

    /// Every unexpired cached session, ordered by expiry.
    pub async fn all(&self) -> Vec<Session> {
        let now = unix_timestamp();
        let mut sessions: Vec<Session> = self
            .cache
            .read()
            .await
            .values()
            .filter(|s| !s.expired_at(now))
            .cloned()
            .collect();
        sessions.sort_by(|a, b| a.expiry.cmp(&b.expiry).then_with(|| a.key.cmp(&b.key)));
        sessions
    }

    /// Replace the embedded device of every cached session that references it.
    /// Returns how many sessions were patched.
    pub async fn update_device(&self, device: &Device) -> usize {
        let mut cache = self.cache.write().await;
        let mut patched = 0;
        for session in cache.values_mut().filter(|s| s.device_id() == device.id) {
            session.device = device.clone();
            patched += 1;
        }
        patched
    }

    /// Drop sessions that expired before `now` from both the database and the cache.
    pub async fn remove_expired(&self, now: i64) -> Result<u64, DatabaseError> {
        let removed = self.db.remove_expired_sessions(now).await?;
        self.cache.write().await.retain(|_, s| !s.expired_at(now));
        Ok(removed)
    }

    pub async fn len(&self) -> usize {
        self.cache.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.cache.read().await.is_empty()
    }
}

/// Enough of a session key to correlate log lines without leaking the credential.
pub fn key_prefix(key: &str) -> &str {
    key.get(..8).unwrap_or(key)
}
