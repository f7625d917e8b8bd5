//! Refresh-token session store.
//!
//! Every login creates a session: a server-side record binding a session id
//! to the SHA-256 hash of the refresh token currently valid for it. Access
//! and refresh tokens both carry the session id, so revoking a session
//! invalidates every token issued for it.
//!
//! # Rotation
//!
//! [`SessionStore::rotate`] is a compare-and-swap under the write lock: the
//! stored hash is replaced only if it equals the hash of the presented
//! token. Of two concurrent refreshes with the same token, exactly one
//! succeeds. A mismatch means the token was already rotated out, so the
//! session is revoked on the spot.
//!
//! # Capacity
//!
//! Each user holds at most `max_sessions_per_user` sessions. Creating one
//! more evicts the user's oldest session.
//!
//! # Example
//!
//! ```rust
//! use chrono::{Duration, Utc};
//! use rollcall_server::session::{SessionStore, SessionStoreConfig};
//! use uuid::Uuid;
//!
//! let store = SessionStore::new(SessionStoreConfig::default());
//! let session_id = Uuid::new_v4();
//! let user_id = Uuid::new_v4();
//!
//! store.create_session(session_id, user_id, "hash-a".to_string(), Utc::now() + Duration::days(1));
//! assert!(store.is_active(session_id));
//!
//! let rotated = store.rotate(session_id, "hash-a", "hash-b".to_string(), Utc::now() + Duration::days(1));
//! assert!(rotated.is_ok());
//! ```

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Default per-user session cap.
const DEFAULT_MAX_SESSIONS_PER_USER: usize = 10;

/// Errors that can occur during session operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The session does not exist or has expired.
    #[error("session not found or expired")]
    NotFound,

    /// The presented refresh token is not the one stored for the session.
    #[error("refresh token does not match the session")]
    TokenMismatch,
}

/// Configuration for the session store.
#[derive(Debug, Clone)]
pub struct SessionStoreConfig {
    /// Maximum number of live sessions per user.
    pub max_sessions_per_user: usize,
}

impl Default for SessionStoreConfig {
    fn default() -> Self {
        Self {
            max_sessions_per_user: DEFAULT_MAX_SESSIONS_PER_USER,
        }
    }
}

impl SessionStoreConfig {
    pub fn new(max_sessions_per_user: usize) -> Self {
        Self {
            max_sessions_per_user,
        }
    }
}

/// A login session.
#[derive(Clone)]
pub struct Session {
    /// Session id, carried in the `sid` claim of every token.
    pub id: Uuid,

    /// The user the session belongs to.
    pub user_id: Uuid,

    /// SHA-256 hex digest of the current refresh token.
    token_hash: String,

    /// When the session was created.
    pub created_at: DateTime<Utc>,

    /// When the refresh token was last rotated.
    pub rotated_at: DateTime<Utc>,

    /// When the current refresh token expires.
    pub expires_at: DateTime<Utc>,
}

impl Session {
    fn new(id: Uuid, user_id: Uuid, token_hash: String, expires_at: DateTime<Utc>) -> Self {
        let now = Utc::now();
        Self {
            id,
            user_id,
            token_hash,
            created_at: now,
            rotated_at: now,
            expires_at,
        }
    }

    fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Returns true if `hash` equals the stored refresh-token hash.
    fn matches(&self, hash: &str) -> bool {
        self.token_hash.len() == hash.len()
            && bool::from(self.token_hash.as_bytes().ct_eq(hash.as_bytes()))
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("token_hash", &"[REDACTED]")
            .field("created_at", &self.created_at)
            .field("rotated_at", &self.rotated_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Thread-safe in-memory session store keyed by session id.
pub struct SessionStore {
    sessions: RwLock<HashMap<Uuid, Session>>,
    config: SessionStoreConfig,
}

impl SessionStore {
    /// Creates a new session store with the given configuration.
    pub fn new(config: SessionStoreConfig) -> Self {
        debug!(
            max_sessions_per_user = config.max_sessions_per_user,
            "Creating new session store"
        );
        Self {
            sessions: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Records a new session.
    ///
    /// Expired sessions of the same user are dropped first. If the user is
    /// still at the cap, their oldest sessions are evicted until there is
    /// room.
    pub fn create_session(
        &self,
        id: Uuid,
        user_id: Uuid,
        token_hash: String,
        expires_at: DateTime<Utc>,
    ) -> Session {
        let session = Session::new(id, user_id, token_hash, expires_at);
        let now = session.created_at;

        let mut sessions = self.sessions.write().unwrap();
        sessions.retain(|_, s| s.user_id != user_id || !s.is_expired_at(now));

        let mut owned: Vec<(DateTime<Utc>, Uuid)> = sessions
            .values()
            .filter(|s| s.user_id == user_id)
            .map(|s| (s.created_at, s.id))
            .collect();
        owned.sort();

        let max = self.config.max_sessions_per_user.max(1);
        let excess = (owned.len() + 1).saturating_sub(max);
        for (_, evicted) in owned.into_iter().take(excess) {
            sessions.remove(&evicted);
            debug!(
                user_id = %user_id,
                session_id = %evicted,
                "Evicted oldest session, per-user cap reached"
            );
        }

        trace!(user_id = %user_id, session_id = %id, "Creating new session");
        sessions.insert(id, session.clone());
        session
    }

    /// Returns the session if it exists and has not expired.
    ///
    /// An expired session is removed on access.
    pub fn get(&self, id: Uuid) -> Option<Session> {
        {
            let sessions = self.sessions.read().unwrap();
            match sessions.get(&id) {
                Some(session) if !session.is_expired_at(Utc::now()) => {
                    return Some(session.clone())
                }
                Some(_) => {}
                None => {
                    trace!(session_id = %id, "Session not found");
                    return None;
                }
            }
        }

        self.sessions.write().unwrap().remove(&id);
        trace!(session_id = %id, "Removed expired session during lookup");
        None
    }

    /// Returns true if the session exists and has not expired.
    pub fn is_active(&self, id: Uuid) -> bool {
        self.get(id).is_some()
    }

    /// Atomically swaps the stored refresh-token hash.
    ///
    /// # Errors
    ///
    /// - [`SessionError::NotFound`] if the session is gone or expired.
    /// - [`SessionError::TokenMismatch`] if `presented_hash` is not the
    ///   current hash. The session is revoked.
    pub fn rotate(
        &self,
        id: Uuid,
        presented_hash: &str,
        new_hash: String,
        new_expires_at: DateTime<Utc>,
    ) -> Result<Session, SessionError> {
        let mut sessions = self.sessions.write().unwrap();

        let session = sessions.get_mut(&id).ok_or(SessionError::NotFound)?;

        if session.is_expired_at(Utc::now()) {
            sessions.remove(&id);
            return Err(SessionError::NotFound);
        }

        if !session.matches(presented_hash) {
            let user_id = session.user_id;
            sessions.remove(&id);
            warn!(
                user_id = %user_id,
                session_id = %id,
                "Stale refresh token presented, session revoked"
            );
            return Err(SessionError::TokenMismatch);
        }

        session.token_hash = new_hash;
        session.rotated_at = Utc::now();
        session.expires_at = new_expires_at;

        trace!(session_id = %id, "Rotated refresh token");
        Ok(session.clone())
    }

    /// Removes a session from the store.
    pub fn remove_session(&self, id: Uuid) -> Option<Session> {
        let removed = self.sessions.write().unwrap().remove(&id);

        if let Some(ref session) = removed {
            trace!(user_id = %session.user_id, session_id = %id, "Session removed");
        }

        removed
    }

    /// Removes every session belonging to `user_id`.
    ///
    /// Returns the number of sessions removed.
    pub fn remove_user_sessions(&self, user_id: Uuid) -> usize {
        let mut sessions = self.sessions.write().unwrap();
        let initial_len = sessions.len();
        sessions.retain(|_, s| s.user_id != user_id);
        let removed = initial_len - sessions.len();

        debug!(user_id = %user_id, removed_count = removed, "Removed all user sessions");
        removed
    }

    /// Returns the current number of sessions in the store.
    ///
    /// Note: This count may include expired sessions that haven't been
    /// cleaned up yet.
    pub fn len(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    /// Returns true if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.sessions.read().unwrap().is_empty()
    }

    /// Removes all expired sessions from the store.
    ///
    /// Called from the background maintenance task, complementing the lazy
    /// cleanup on access.
    ///
    /// # Returns
    ///
    /// The number of sessions that were removed.
    pub fn cleanup_expired(&self) -> usize {
        let now = Utc::now();
        let mut sessions = self.sessions.write().unwrap();
        let initial_len = sessions.len();

        sessions.retain(|_, session| !session.is_expired_at(now));

        let removed = initial_len - sessions.len();

        if removed > 0 {
            debug!(
                removed_count = removed,
                remaining_count = sessions.len(),
                "Cleaned up expired sessions"
            );
        }

        removed
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(SessionStoreConfig::default())
    }
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let len = self.sessions.read().map(|s| s.len()).unwrap_or(0);
        f.debug_struct("SessionStore")
            .field("session_count", &len)
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::Arc;
    use std::thread;

    fn in_a_day() -> DateTime<Utc> {
        Utc::now() + Duration::days(1)
    }

    fn an_hour_ago() -> DateTime<Utc> {
        Utc::now() - Duration::hours(1)
    }

    #[test]
    fn test_create_and_get() {
        let store = SessionStore::default();
        let id = Uuid::new_v4();
        let user_id = Uuid::new_v4();

        store.create_session(id, user_id, "hash".to_string(), in_a_day());

        let session = store.get(id).expect("session should exist");
        assert_eq!(session.id, id);
        assert_eq!(session.user_id, user_id);
        assert!(store.is_active(id));
    }

    #[test]
    fn test_get_unknown_session() {
        let store = SessionStore::default();
        assert!(store.get(Uuid::new_v4()).is_none());
        assert!(!store.is_active(Uuid::new_v4()));
    }

    #[test]
    fn test_expired_session_removed_on_access() {
        let store = SessionStore::default();
        let id = Uuid::new_v4();
        store.create_session(id, Uuid::new_v4(), "hash".to_string(), an_hour_ago());

        assert_eq!(store.len(), 1);
        assert!(store.get(id).is_none());
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn test_rotate_with_current_hash() {
        let store = SessionStore::default();
        let id = Uuid::new_v4();
        store.create_session(id, Uuid::new_v4(), "hash-a".to_string(), in_a_day());

        let rotated = store
            .rotate(id, "hash-a", "hash-b".to_string(), in_a_day())
            .expect("rotation should succeed");
        assert!(rotated.rotated_at >= rotated.created_at);

        // The old hash no longer matches; the new one does until it is used.
        assert!(store.get(id).unwrap().matches("hash-b"));
        assert!(!store.get(id).unwrap().matches("hash-a"));
    }

    #[test]
    fn test_rotate_with_stale_hash_revokes_session() {
        let store = SessionStore::default();
        let id = Uuid::new_v4();
        store.create_session(id, Uuid::new_v4(), "hash-a".to_string(), in_a_day());
        store
            .rotate(id, "hash-a", "hash-b".to_string(), in_a_day())
            .unwrap();

        let err = store
            .rotate(id, "hash-a", "hash-c".to_string(), in_a_day())
            .unwrap_err();
        assert_eq!(err, SessionError::TokenMismatch);

        // Replay detection revokes the session, so the legitimate holder of
        // hash-b is logged out too.
        assert!(!store.is_active(id));
        assert!(matches!(
            store.rotate(id, "hash-b", "hash-d".to_string(), in_a_day()),
            Err(SessionError::NotFound)
        ));
    }

    #[test]
    fn test_rotate_missing_session() {
        let store = SessionStore::default();
        let err = store
            .rotate(Uuid::new_v4(), "hash", "next".to_string(), in_a_day())
            .unwrap_err();
        assert_eq!(err, SessionError::NotFound);
    }

    #[test]
    fn test_rotate_expired_session() {
        let store = SessionStore::default();
        let id = Uuid::new_v4();
        store.create_session(id, Uuid::new_v4(), "hash".to_string(), an_hour_ago());

        let err = store
            .rotate(id, "hash", "next".to_string(), in_a_day())
            .unwrap_err();
        assert_eq!(err, SessionError::NotFound);
        assert!(store.is_empty());
    }

    #[test]
    fn test_concurrent_rotation_single_winner() {
        let store = Arc::new(SessionStore::default());
        let id = Uuid::new_v4();
        store.create_session(id, Uuid::new_v4(), "hash-a".to_string(), in_a_day());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    store
                        .rotate(id, "hash-a", format!("hash-{i}"), in_a_day())
                        .is_ok()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_per_user_cap_evicts_oldest() {
        let store = SessionStore::new(SessionStoreConfig::new(2));
        let user_id = Uuid::new_v4();
        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();

        for id in &ids {
            store.create_session(*id, user_id, "hash".to_string(), in_a_day());
            thread::sleep(std::time::Duration::from_millis(2));
        }

        assert!(!store.is_active(ids[0]));
        assert!(store.is_active(ids[1]));
        assert!(store.is_active(ids[2]));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_cap_is_per_user() {
        let store = SessionStore::new(SessionStoreConfig::new(1));
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let alice_session = Uuid::new_v4();
        let bob_session = Uuid::new_v4();

        store.create_session(alice_session, alice, "a".to_string(), in_a_day());
        store.create_session(bob_session, bob, "b".to_string(), in_a_day());

        assert!(store.is_active(alice_session));
        assert!(store.is_active(bob_session));
    }

    #[test]
    fn test_remove_session() {
        let store = SessionStore::default();
        let id = Uuid::new_v4();
        store.create_session(id, Uuid::new_v4(), "hash".to_string(), in_a_day());

        assert!(store.remove_session(id).is_some());
        assert!(store.remove_session(id).is_none());
        assert!(!store.is_active(id));
    }

    #[test]
    fn test_remove_user_sessions() {
        let store = SessionStore::default();
        let user_id = Uuid::new_v4();
        let other = Uuid::new_v4();
        let other_session = Uuid::new_v4();

        for _ in 0..3 {
            store.create_session(Uuid::new_v4(), user_id, "h".to_string(), in_a_day());
        }
        store.create_session(other_session, other, "h".to_string(), in_a_day());

        assert_eq!(store.remove_user_sessions(user_id), 3);
        assert_eq!(store.len(), 1);
        assert!(store.is_active(other_session));
    }

    #[test]
    fn test_cleanup_expired() {
        let store = SessionStore::default();
        store.create_session(Uuid::new_v4(), Uuid::new_v4(), "h".to_string(), an_hour_ago());
        store.create_session(Uuid::new_v4(), Uuid::new_v4(), "h".to_string(), an_hour_ago());
        let live = Uuid::new_v4();
        store.create_session(live, Uuid::new_v4(), "h".to_string(), in_a_day());

        assert_eq!(store.cleanup_expired(), 2);
        assert_eq!(store.len(), 1);
        assert!(store.is_active(live));
    }

    #[test]
    fn test_debug_hides_token_hash() {
        let store = SessionStore::default();
        let session = store.create_session(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "super-secret-hash".to_string(),
            in_a_day(),
        );

        let debug = format!("{session:?}");
        assert!(!debug.contains("super-secret-hash"));
        assert!(debug.contains("REDACTED"));

        let store_debug = format!("{store:?}");
        assert!(store_debug.contains("session_count"));
    }

    #[test]
    fn test_session_error_display() {
        assert_eq!(SessionError::NotFound.to_string(), "session not found or expired");
        assert_eq!(
            SessionError::TokenMismatch.to_string(),
            "refresh token does not match the session"
        );
    }
}
