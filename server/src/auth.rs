//! Password hashing and the request authentication gate.
//!
//! Protected handlers take an [`AuthUser`] argument. The extractor reads the
//! access token from the `accessToken` cookie, falling back to an
//! `Authorization: Bearer` header, verifies it, and loads the user. A
//! missing token is `401 Unauthorized`; a bad, expired or revoked token, or
//! one whose user no longer exists, is `401 InvalidToken`.
//!
//! # Example
//!
//! ```rust,ignore
//! async fn me(auth: AuthUser) -> ApiResponse<UserProfile> {
//!     ApiResponse::ok(auth.user, "Current user fetched")
//! }
//! ```

use anyhow::Result;
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use axum::{
    extract::FromRequestParts,
    http::{header, request::Parts, HeaderMap},
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use tracing::trace;
use uuid::Uuid;

use crate::error::ApiError;
use crate::routes::AppState;
use crate::tokens::TokenPair;
use crate::users::UserProfile;

/// Cookie holding the access token.
pub const ACCESS_COOKIE: &str = "accessToken";

/// Cookie holding the refresh token.
pub const REFRESH_COOKIE: &str = "refreshToken";

/// Hash a password using argon2id.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("Failed to hash password: {}", e))?;
    Ok(hash.to_string())
}

/// Verify a password against a stored argon2 hash.
pub fn verify_password(password: &str, hash: &str) -> Result<bool> {
    let parsed_hash =
        PasswordHash::new(hash).map_err(|e| anyhow::anyhow!("Invalid password hash: {}", e))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok())
}

/// The authenticated caller of a request.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user: UserProfile,
    /// Session the access token belongs to. Logout revokes this one.
    pub session_id: Uuid,
}

impl AuthUser {
    pub fn id(&self) -> Uuid {
        self.user.id
    }
}

/// Reads the access token from the cookie, then the bearer header.
pub fn extract_access_token(headers: &HeaderMap) -> Option<String> {
    let from_cookie = CookieJar::from_headers(headers)
        .get(ACCESS_COOKIE)
        .map(|c| c.value().trim().to_string())
        .filter(|v| !v.is_empty());

    from_cookie.or_else(|| {
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
    })
}

/// Resolves a raw access token to the calling user.
pub fn authenticate(state: &AppState, token: Option<&str>) -> Result<AuthUser, ApiError> {
    let token = token
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ApiError::unauthorized("unauthorized request"))?;

    let claims = state.tokens.verify_access(token)?;

    let user = state
        .users
        .profile(claims.sub)
        .ok_or_else(|| ApiError::invalid_token("invalid access token"))?;

    trace!(user_id = %user.id, session_id = %claims.sid, "Request authenticated");

    Ok(AuthUser {
        user,
        session_id: claims.sid,
    })
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = extract_access_token(&parts.headers);
        authenticate(state, token.as_deref())
    }
}

fn auth_cookie(name: &'static str, value: String, secure: bool) -> Cookie<'static> {
    Cookie::build((name, value))
        .path("/")
        .http_only(true)
        .secure(secure)
        .same_site(SameSite::Lax)
        .build()
}

/// Adds both token cookies to the jar.
pub fn set_auth_cookies(jar: CookieJar, pair: &TokenPair, secure: bool) -> CookieJar {
    jar.add(auth_cookie(ACCESS_COOKIE, pair.access_token.clone(), secure))
        .add(auth_cookie(REFRESH_COOKIE, pair.refresh_token.clone(), secure))
}

fn expired_cookie(name: &'static str) -> Cookie<'static> {
    let mut cookie = Cookie::build((name, "")).path("/").http_only(true).build();
    cookie.make_removal();
    cookie
}

/// Expires both token cookies, whether or not the request carried them.
pub fn clear_auth_cookies(jar: CookieJar) -> CookieJar {
    jar.add(expired_cookie(ACCESS_COOKIE))
        .add(expired_cookie(REFRESH_COOKIE))
}
