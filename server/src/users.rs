//! User accounts.
//!
//! Usernames and emails are stored lowercased and are unique across all
//! users. The uniqueness check and the insert happen under one write lock,
//! so two concurrent registrations for the same name cannot both succeed.
//!
//! [`User`] holds the password hash and is never serialized. Anything sent
//! to a client goes through [`UserProfile`] or [`OwnerSummary`].

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

/// Errors returned by the user store.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UserError {
    #[error("user with this username or email already exists")]
    Conflict,

    #[error("user not found")]
    NotFound,
}

/// A stored user account.
#[derive(Clone)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    password_hash: String,
    pub avatar: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl User {
    /// The argon2 PHC string for this user's password.
    pub fn password_hash(&self) -> &str {
        &self.password_hash
    }

    pub fn profile(&self) -> UserProfile {
        UserProfile {
            id: self.id,
            username: self.username.clone(),
            email: self.email.clone(),
            avatar: self.avatar.clone(),
            created_at: self.created_at,
        }
    }

    pub fn owner_summary(&self) -> OwnerSummary {
        OwnerSummary {
            id: self.id,
            username: self.username.clone(),
            email: self.email.clone(),
        }
    }
}

impl std::fmt::Debug for User {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("User")
            .field("id", &self.id)
            .field("username", &self.username)
            .field("email", &self.email)
            .field("password_hash", &"[REDACTED]")
            .field("avatar", &self.avatar)
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// Public view of a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Owner details embedded in event listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerSummary {
    pub id: Uuid,
    pub username: String,
    pub email: String,
}

/// Input for [`UserStore::create`]. The password must already be hashed.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub avatar: Option<String>,
}

#[derive(Default)]
struct UserIndex {
    by_id: HashMap<Uuid, User>,
    by_username: HashMap<String, Uuid>,
    by_email: HashMap<String, Uuid>,
}

/// Thread-safe in-memory user store.
#[derive(Default)]
pub struct UserStore {
    inner: RwLock<UserIndex>,
}

/// Lowercases and trims a username or email for storage and lookup.
pub fn normalize(value: &str) -> String {
    value.trim().to_lowercase()
}

impl UserStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a new user.
    ///
    /// # Errors
    ///
    /// Returns [`UserError::Conflict`] if the username or email is taken.
    pub fn create(&self, new_user: NewUser) -> Result<User, UserError> {
        let username = normalize(&new_user.username);
        let email = normalize(&new_user.email);

        let mut index = self.inner.write().unwrap();
        if index.by_username.contains_key(&username) || index.by_email.contains_key(&email) {
            debug!(username = %username, "Rejected registration for taken username or email");
            return Err(UserError::Conflict);
        }

        let user = User {
            id: Uuid::new_v4(),
            username: username.clone(),
            email: email.clone(),
            password_hash: new_user.password_hash,
            avatar: new_user.avatar,
            created_at: Utc::now(),
        };

        index.by_username.insert(username, user.id);
        index.by_email.insert(email, user.id);
        index.by_id.insert(user.id, user.clone());

        info!(user_id = %user.id, username = %user.username, "Registered user");
        Ok(user)
    }

    /// Returns true if either the username or the email is already taken.
    pub fn exists(&self, username: &str, email: &str) -> bool {
        let index = self.inner.read().unwrap();
        index.by_username.contains_key(&normalize(username))
            || index.by_email.contains_key(&normalize(email))
    }

    pub fn get(&self, id: Uuid) -> Option<User> {
        self.inner.read().unwrap().by_id.get(&id).cloned()
    }

    pub fn profile(&self, id: Uuid) -> Option<UserProfile> {
        self.get(id).map(|u| u.profile())
    }

    pub fn owner_summary(&self, id: Uuid) -> Option<OwnerSummary> {
        self.get(id).map(|u| u.owner_summary())
    }

    pub fn find_by_username(&self, username: &str) -> Option<User> {
        let index = self.inner.read().unwrap();
        index
            .by_username
            .get(&normalize(username))
            .and_then(|id| index.by_id.get(id))
            .cloned()
    }

    pub fn find_by_email(&self, email: &str) -> Option<User> {
        let index = self.inner.read().unwrap();
        index
            .by_email
            .get(&normalize(email))
            .and_then(|id| index.by_id.get(id))
            .cloned()
    }

    /// Looks a user up for login by username, falling back to email.
    pub fn find_for_login(&self, username: Option<&str>, email: Option<&str>) -> Option<User> {
        username
            .and_then(|name| self.find_by_username(name))
            .or_else(|| email.and_then(|addr| self.find_by_email(addr)))
    }

    /// Removes a user. Sessions and events are not touched.
    pub fn remove(&self, id: Uuid) -> Result<User, UserError> {
        let mut index = self.inner.write().unwrap();
        let user = index.by_id.remove(&id).ok_or(UserError::NotFound)?;
        index.by_username.remove(&user.username);
        index.by_email.remove(&user.email);
        Ok(user)
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for UserStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let len = self.inner.read().map(|i| i.by_id.len()).unwrap_or(0);
        f.debug_struct("UserStore").field("user_count", &len).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn new_user(username: &str, email: &str) -> NewUser {
        NewUser {
            username: username.to_string(),
            email: email.to_string(),
            password_hash: "$argon2id$fake".to_string(),
            avatar: None,
        }
    }

    #[test]
    fn test_create_normalizes_username_and_email() {
        let store = UserStore::new();
        let user = store
            .create(new_user("  Alice ", "Alice@Example.COM"))
            .unwrap();

        assert_eq!(user.username, "alice");
        assert_eq!(user.email, "alice@example.com");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_duplicate_username_conflicts() {
        let store = UserStore::new();
        store.create(new_user("alice", "a@example.com")).unwrap();

        let err = store.create(new_user("ALICE", "other@example.com")).unwrap_err();
        assert_eq!(err, UserError::Conflict);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_duplicate_email_conflicts() {
        let store = UserStore::new();
        store.create(new_user("alice", "a@example.com")).unwrap();

        let err = store.create(new_user("bob", "A@example.com")).unwrap_err();
        assert_eq!(err, UserError::Conflict);
    }

    #[test]
    fn test_concurrent_registration_single_winner() {
        let store = Arc::new(UserStore::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    store
                        .create(new_user("carol", &format!("carol{i}@example.com")))
                        .is_ok()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_find_for_login() {
        let store = UserStore::new();
        let user = store.create(new_user("alice", "alice@example.com")).unwrap();

        assert_eq!(store.find_for_login(Some("Alice"), None).unwrap().id, user.id);
        assert_eq!(
            store.find_for_login(None, Some("ALICE@example.com")).unwrap().id,
            user.id
        );
        assert_eq!(
            store
                .find_for_login(Some("nobody"), Some("alice@example.com"))
                .unwrap()
                .id,
            user.id
        );
        assert!(store.find_for_login(None, None).is_none());
        assert!(store.find_for_login(Some("nobody"), None).is_none());
    }

    #[test]
    fn test_exists() {
        let store = UserStore::new();
        store.create(new_user("alice", "alice@example.com")).unwrap();

        assert!(store.exists("ALICE", "new@example.com"));
        assert!(store.exists("new", "alice@example.com"));
        assert!(!store.exists("new", "new@example.com"));
    }

    #[test]
    fn test_profile_has_no_password() {
        let store = UserStore::new();
        let user = store.create(new_user("alice", "alice@example.com")).unwrap();

        let json = serde_json::to_value(store.profile(user.id).unwrap()).unwrap();
        assert_eq!(json["username"], "alice");
        assert!(json.get("password").is_none());
        assert!(json.get("passwordHash").is_none());
        assert!(!json.to_string().contains("argon2"));
    }

    #[test]
    fn test_debug_hides_password_hash() {
        let store = UserStore::new();
        let user = store.create(new_user("alice", "alice@example.com")).unwrap();

        let debug = format!("{user:?}");
        assert!(!debug.contains("argon2"));
    }

    #[test]
    fn test_remove_frees_username() {
        let store = UserStore::new();
        let user = store.create(new_user("alice", "alice@example.com")).unwrap();

        store.remove(user.id).unwrap();
        assert!(store.get(user.id).is_none());
        assert_eq!(store.remove(user.id).unwrap_err(), UserError::NotFound);
        assert!(store.create(new_user("alice", "alice@example.com")).is_ok());
    }
}
