//! Access and refresh token issuance.
//!
//! Both tokens are HS256 JWTs signed with separate secrets. Each carries the
//! user id (`sub`), the session id (`sid`), a unique id (`jti`) and its kind.
//! Only the SHA-256 hash of the current refresh token is stored, in the
//! session it belongs to.
//!
//! # Flow
//!
//! 1. Login calls [`TokenService::issue_token_pair`], opening a session.
//! 2. Requests present the access token; [`TokenService::verify_access`]
//!    checks the signature, the expiry, and that the session is still live.
//! 3. [`TokenService::refresh`] verifies a refresh token and rotates the
//!    session to a new pair. The old refresh token is dead afterwards.
//! 4. Logout calls [`TokenService::revoke`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{
    errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::session::{SessionError, SessionStore};

/// Errors that can occur while issuing or verifying tokens.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenError {
    /// No token was presented.
    #[error("no token presented")]
    Missing,

    /// The token failed verification.
    #[error("{0}")]
    Invalid(String),

    /// The refresh token is not the one stored for its session.
    #[error("refresh token is expired or used")]
    Mismatch,

    /// Signing failed.
    #[error("failed to sign token: {0}")]
    Signing(String),
}

/// Which secret a token is signed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    Access,
    Refresh,
}

/// JWT claims shared by both token kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: Uuid,
    /// Session id.
    pub sid: Uuid,
    /// Unique token id, so two tokens minted in the same second differ.
    pub jti: Uuid,
    pub kind: TokenKind,
    pub iat: i64,
    pub exp: i64,
}

/// An access/refresh token pair as returned to clients.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

impl std::fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenPair")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .finish()
    }
}

/// Result of a successful login or refresh.
#[derive(Debug, Clone)]
pub struct IssuedTokens {
    pub user_id: Uuid,
    pub session_id: Uuid,
    pub pair: TokenPair,
}

/// Hash a refresh token using SHA-256, hex encoded.
pub fn hash_refresh_token(raw_token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw_token.as_bytes());
    format!("{:x}", hasher.finalize())
}

struct SigningKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl SigningKeys {
    fn from_secret(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
        }
    }
}

/// Issues, verifies, rotates and revokes tokens.
pub struct TokenService {
    access_keys: SigningKeys,
    refresh_keys: SigningKeys,
    access_ttl: Duration,
    refresh_ttl: Duration,
    sessions: Arc<SessionStore>,
}

impl TokenService {
    pub fn new(config: &Config, sessions: Arc<SessionStore>) -> Self {
        Self {
            access_keys: SigningKeys::from_secret(&config.access_token_secret),
            refresh_keys: SigningKeys::from_secret(&config.refresh_token_secret),
            access_ttl: config.access_token_ttl,
            refresh_ttl: config.refresh_token_ttl,
            sessions,
        }
    }

    /// The session store backing this service.
    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Opens a new session for `user_id` and returns its token pair.
    ///
    /// Other sessions of the same user are left alone, apart from eviction
    /// of the oldest when the per-user cap is reached.
    pub fn issue_token_pair(&self, user_id: Uuid) -> Result<IssuedTokens, TokenError> {
        let session_id = Uuid::new_v4();
        let (refresh_token, refresh_expires_at) =
            self.sign(TokenKind::Refresh, user_id, session_id)?;
        let (access_token, _) = self.sign(TokenKind::Access, user_id, session_id)?;

        self.sessions.create_session(
            session_id,
            user_id,
            hash_refresh_token(&refresh_token),
            refresh_expires_at,
        );

        info!(user_id = %user_id, session_id = %session_id, "Issued token pair");

        Ok(IssuedTokens {
            user_id,
            session_id,
            pair: TokenPair {
                access_token,
                refresh_token,
            },
        })
    }

    /// Exchanges a refresh token for a fresh pair.
    ///
    /// # Errors
    ///
    /// - [`TokenError::Missing`] if no token was presented.
    /// - [`TokenError::Invalid`] if the signature or expiry check fails.
    /// - [`TokenError::Mismatch`] if the session is gone or the token has
    ///   already been rotated out. In the latter case the session is revoked.
    pub fn refresh(&self, presented: Option<&str>) -> Result<IssuedTokens, TokenError> {
        let token = presented
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(TokenError::Missing)?;

        let claims = self.decode(token, TokenKind::Refresh)?;

        let (refresh_token, refresh_expires_at) =
            self.sign(TokenKind::Refresh, claims.sub, claims.sid)?;

        self.sessions
            .rotate(
                claims.sid,
                &hash_refresh_token(token),
                hash_refresh_token(&refresh_token),
                refresh_expires_at,
            )
            .map_err(|err| {
                match err {
                    SessionError::TokenMismatch => {
                        warn!(user_id = %claims.sub, session_id = %claims.sid, "Refresh token reuse detected")
                    }
                    SessionError::NotFound => {
                        debug!(session_id = %claims.sid, "Refresh for unknown session")
                    }
                }
                TokenError::Mismatch
            })?;

        let (access_token, _) = self.sign(TokenKind::Access, claims.sub, claims.sid)?;

        debug!(user_id = %claims.sub, session_id = %claims.sid, "Rotated token pair");

        Ok(IssuedTokens {
            user_id: claims.sub,
            session_id: claims.sid,
            pair: TokenPair {
                access_token,
                refresh_token,
            },
        })
    }

    /// Verifies an access token and returns its claims.
    ///
    /// A token whose session has been revoked fails even if its signature and
    /// expiry are fine.
    pub fn verify_access(&self, token: &str) -> Result<Claims, TokenError> {
        let claims = self.decode(token, TokenKind::Access)?;

        if !self.sessions.is_active(claims.sid) {
            return Err(TokenError::Invalid("session has been revoked".to_string()));
        }

        Ok(claims)
    }

    /// Ends one session. Returns true if it existed.
    pub fn revoke(&self, session_id: Uuid) -> bool {
        let removed = self.sessions.remove_session(session_id).is_some();
        if removed {
            info!(session_id = %session_id, "Session revoked");
        }
        removed
    }

    /// Ends every session of a user. Returns how many were removed.
    pub fn revoke_user(&self, user_id: Uuid) -> usize {
        let removed = self.sessions.remove_user_sessions(user_id);
        info!(user_id = %user_id, removed_count = removed, "All user sessions revoked");
        removed
    }

    fn keys(&self, kind: TokenKind) -> &SigningKeys {
        match kind {
            TokenKind::Access => &self.access_keys,
            TokenKind::Refresh => &self.refresh_keys,
        }
    }

    fn ttl(&self, kind: TokenKind) -> Duration {
        match kind {
            TokenKind::Access => self.access_ttl,
            TokenKind::Refresh => self.refresh_ttl,
        }
    }

    fn sign(
        &self,
        kind: TokenKind,
        user_id: Uuid,
        session_id: Uuid,
    ) -> Result<(String, DateTime<Utc>), TokenError> {
        let now = Utc::now().timestamp();
        let ttl = i64::try_from(self.ttl(kind).as_secs())
            .map_err(|_| TokenError::Signing("expiry out of range".to_string()))?;
        let exp = now.saturating_add(ttl);
        let claims = Claims {
            sub: user_id,
            sid: session_id,
            jti: Uuid::new_v4(),
            kind,
            iat: now,
            exp,
        };

        let token = jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &self.keys(kind).encoding,
        )
        .map_err(|e| TokenError::Signing(e.to_string()))?;

        let expires_at = Utc
            .timestamp_opt(exp, 0)
            .single()
            .ok_or_else(|| TokenError::Signing("expiry out of range".to_string()))?;

        Ok((token, expires_at))
    }

    fn decode(&self, token: &str, kind: TokenKind) -> Result<Claims, TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        let data = jsonwebtoken::decode::<Claims>(token, &self.keys(kind).decoding, &validation)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => TokenError::Invalid("token has expired".to_string()),
                _ => TokenError::Invalid("token is malformed or has an invalid signature".to_string()),
            })?;

        if data.claims.kind != kind {
            return Err(TokenError::Invalid("wrong token type".to_string()));
        }

        Ok(data.claims)
    }
}

impl std::fmt::Debug for TokenService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenService")
            .field("access_ttl", &self.access_ttl)
            .field("refresh_ttl", &self.refresh_ttl)
            .field("sessions", &self.sessions)
            .finish_non_exhaustive()
    }
}
