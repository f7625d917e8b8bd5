//! Account and session endpoints.

use axum::{
    body::Bytes,
    extract::{FromRequest, Multipart, Request, State},
    http::header::CONTENT_TYPE,
};
use axum_extra::extract::CookieJar;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, trace};

use crate::auth::{
    clear_auth_cookies, hash_password, set_auth_cookies, verify_password, AuthUser,
    REFRESH_COOKIE,
};
use crate::error::{ApiError, ApiResult};
use crate::response::ApiResponse;
use crate::routes::extract::{from_multipart_error, JsonBody};
use crate::routes::AppState;
use crate::tokens::TokenPair;
use crate::upload::{avatar_extension, AvatarUpload};
use crate::users::{NewUser, UserError, UserProfile};

/// Registration fields, from JSON or multipart form fields.
#[derive(Default, Deserialize)]
pub struct RegisterRequest {
    pub username: Option<String>,
    pub email: Option<String>,
    pub password: Option<String>,
}

/// A registration request: fields plus an optional avatar file.
///
/// `application/json` bodies carry fields only. `multipart/form-data` bodies
/// may add an `avatar` file part.
pub struct Registration {
    pub fields: RegisterRequest,
    pub avatar: Option<AvatarUpload>,
}

impl<S> FromRequest<S> for Registration
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let is_multipart = req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("multipart/form-data"));

        if !is_multipart {
            let JsonBody(fields) = JsonBody::<RegisterRequest>::from_request(req, state).await?;
            return Ok(Self {
                fields,
                avatar: None,
            });
        }

        let mut multipart = Multipart::from_request(req, state)
            .await
            .map_err(|rejection| ApiError::bad_request(rejection.body_text()))?;

        let mut fields = RegisterRequest::default();
        let mut avatar = None;

        while let Some(field) = multipart.next_field().await.map_err(from_multipart_error)? {
            let name = field.name().unwrap_or_default().to_string();
            match name.as_str() {
                "avatar" => {
                    let content_type = field.content_type().unwrap_or_default().to_string();
                    let bytes = field.bytes().await.map_err(from_multipart_error)?;
                    if bytes.is_empty() {
                        continue;
                    }
                    if avatar_extension(&content_type).is_none() {
                        return Err(ApiError::validation(
                            "avatar",
                            "avatar must be a PNG, JPEG, GIF or WebP image",
                        ));
                    }
                    avatar = Some(AvatarUpload {
                        content_type,
                        bytes,
                    });
                }
                "username" | "email" | "password" => {
                    let value = field.text().await.map_err(from_multipart_error)?;
                    match name.as_str() {
                        "username" => fields.username = Some(value),
                        "email" => fields.email = Some(value),
                        _ => fields.password = Some(value),
                    }
                }
                other => trace!(field = other, "Ignoring unknown multipart field"),
            }
        }

        Ok(Self { fields, avatar })
    }
}

struct ValidRegistration {
    username: String,
    email: String,
    password: String,
}

impl std::fmt::Debug for ValidRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidRegistration")
            .field("username", &self.username)
            .field("email", &self.email)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

fn required(value: Option<String>, field: &'static str) -> ApiResult<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::validation(field, format!("{field} is required")))
}

fn looks_like_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.contains('@')
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
        }
        None => false,
    }
}

fn validate_registration(fields: RegisterRequest) -> ApiResult<ValidRegistration> {
    let username = required(fields.username, "username")?;
    if username.chars().any(char::is_whitespace) {
        return Err(ApiError::validation(
            "username",
            "username must not contain whitespace",
        ));
    }

    let email = required(fields.email, "email")?;
    if !looks_like_email(&email) {
        return Err(ApiError::validation("email", "email is invalid"));
    }

    let password = fields
        .password
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| ApiError::validation("password", "password is required"))?;

    Ok(ValidRegistration {
        username,
        email,
        password,
    })
}

async fn hash_password_blocking(password: String) -> ApiResult<String> {
    tokio::task::spawn_blocking(move || hash_password(&password))
        .await
        .map_err(|e| ApiError::internal(format!("password hashing task failed: {e}")))?
        .map_err(|e| ApiError::internal(format!("{e:#}")))
}

async fn verify_password_blocking(password: String, hash: String) -> ApiResult<bool> {
    tokio::task::spawn_blocking(move || verify_password(&password, &hash))
        .await
        .map_err(|e| ApiError::internal(format!("password verification task failed: {e}")))?
        .map_err(|e| ApiError::internal(format!("{e:#}")))
}

/// POST /users/register
pub async fn register(
    State(state): State<AppState>,
    registration: Registration,
) -> ApiResult<ApiResponse<UserProfile>> {
    let Registration { fields, avatar } = registration;
    let valid = validate_registration(fields)?;

    if state.users.exists(&valid.username, &valid.email) {
        return Err(UserError::Conflict.into());
    }

    let avatar_url = match &avatar {
        Some(upload) => Some(
            state
                .avatars
                .save(upload)
                .await
                .map_err(|e| ApiError::internal(format!("{e:#}")))?,
        ),
        None => None,
    };

    let password_hash = hash_password_blocking(valid.password).await?;

    let created = state.users.create(NewUser {
        username: valid.username,
        email: valid.email,
        password_hash,
        avatar: avatar_url.clone(),
    });

    let user = match created {
        Ok(user) => user,
        Err(err) => {
            if let Some(url) = &avatar_url {
                state.avatars.remove(url).await;
            }
            return Err(err.into());
        }
    };

    Ok(ApiResponse::created(
        user.profile(),
        "User registration successful",
    ))
}

/// Login by username or email.
#[derive(Default, Deserialize)]
pub struct LoginRequest {
    pub username: Option<String>,
    pub email: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub user: UserProfile,
    #[serde(flatten)]
    pub tokens: TokenPair,
}

fn invalid_credentials() -> ApiError {
    ApiError::unauthorized("invalid user credentials")
}

/// POST /users/login
pub async fn login(
    State(state): State<AppState>,
    jar: CookieJar,
    JsonBody(req): JsonBody<LoginRequest>,
) -> ApiResult<(CookieJar, ApiResponse<LoginResponse>)> {
    let username = req.username.as_deref().map(str::trim).filter(|u| !u.is_empty());
    let email = req.email.as_deref().map(str::trim).filter(|e| !e.is_empty());
    if username.is_none() && email.is_none() {
        return Err(ApiError::validation("username", "username or email is required"));
    }

    let password = req
        .password
        .filter(|p| !p.is_empty())
        .ok_or_else(|| ApiError::validation("password", "password is required"))?;

    let Some(user) = state.users.find_for_login(username, email) else {
        debug!("Login attempt for unknown user");
        return Err(invalid_credentials());
    };

    if !verify_password_blocking(password, user.password_hash().to_string()).await? {
        debug!(user_id = %user.id, "Login attempt with wrong password");
        return Err(invalid_credentials());
    }

    let issued = state.tokens.issue_token_pair(user.id)?;
    let jar = set_auth_cookies(jar, &issued.pair, state.config.cookie_secure);

    info!(user_id = %user.id, session_id = %issued.session_id, "User logged in");

    Ok((
        jar,
        ApiResponse::ok(
            LoginResponse {
                user: user.profile(),
                tokens: issued.pair,
            },
            "User logged in successfully",
        ),
    ))
}

/// POST /users/logout - ends the caller's current session only.
pub async fn logout(
    State(state): State<AppState>,
    auth: AuthUser,
    jar: CookieJar,
) -> (CookieJar, ApiResponse<Value>) {
    state.tokens.revoke(auth.session_id);
    info!(user_id = %auth.id(), session_id = %auth.session_id, "User logged out");

    (
        clear_auth_cookies(jar),
        ApiResponse::ok(json!({}), "User logged out successfully"),
    )
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest {
    refresh_token: Option<String>,
}

/// An empty or unparseable body carries no token.
fn refresh_token_from_body(body: &Bytes) -> Option<String> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return None;
    }

    match serde_json::from_slice::<RefreshRequest>(body) {
        Ok(req) => req.refresh_token,
        Err(_) => {
            debug!(len = body.len(), "Ignoring unparseable refresh body");
            None
        }
    }
}

/// POST /users/refresh - the refresh token comes from the cookie, else from
/// a JSON body `{"refreshToken": "..."}`.
pub async fn refresh(
    State(state): State<AppState>,
    jar: CookieJar,
    body: Bytes,
) -> ApiResult<(CookieJar, ApiResponse<TokenPair>)> {
    let from_cookie = jar
        .get(REFRESH_COOKIE)
        .map(|c| c.value().to_string())
        .filter(|v| !v.trim().is_empty());

    let presented = match from_cookie {
        Some(token) => Some(token),
        None => refresh_token_from_body(&body),
    };

    let issued = state.tokens.refresh(presented.as_deref())?;

    if state.users.get(issued.user_id).is_none() {
        state.tokens.revoke(issued.session_id);
        return Err(ApiError::invalid_token("invalid refresh token"));
    }

    let jar = set_auth_cookies(jar, &issued.pair, state.config.cookie_secure);

    Ok((jar, ApiResponse::ok(issued.pair, "Access token refreshed")))
}

/// GET /users/me
pub async fn me(auth: AuthUser) -> ApiResponse<UserProfile> {
    ApiResponse::ok(auth.user, "Current user fetched successfully")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(username: &str, email: &str, password: &str) -> RegisterRequest {
        RegisterRequest {
            username: Some(username.to_string()),
            email: Some(email.to_string()),
            password: Some(password.to_string()),
        }
    }

    fn field_of(err: ApiError) -> Option<String> {
        match err {
            ApiError::Validation { field, .. } => field,
            _ => None,
        }
    }

    #[test]
    fn validate_registration_accepts_complete_input() {
        let valid = validate_registration(request(" alice ", "alice@example.com", "pw")).unwrap();
        assert_eq!(valid.username, "alice");
        assert_eq!(valid.email, "alice@example.com");
        assert_eq!(valid.password, "pw");
    }

    #[test]
    fn validate_registration_requires_every_field() {
        let err = validate_registration(RegisterRequest::default()).unwrap_err();
        assert_eq!(field_of(err).as_deref(), Some("username"));

        let err = validate_registration(request("alice", "  ", "pw")).unwrap_err();
        assert_eq!(field_of(err).as_deref(), Some("email"));

        let err = validate_registration(request("alice", "alice@example.com", " ")).unwrap_err();
        assert_eq!(field_of(err).as_deref(), Some("password"));
    }

    #[test]
    fn validate_registration_rejects_bad_username_and_email() {
        let err = validate_registration(request("al ice", "alice@example.com", "pw")).unwrap_err();
        assert_eq!(field_of(err).as_deref(), Some("username"));

        for email in ["alice", "@example.com", "alice@", "alice@example", "a@b@c.com", "a@.com"] {
            let err = validate_registration(request("alice", email, "pw")).unwrap_err();
            assert_eq!(field_of(err).as_deref(), Some("email"), "email {email:?}");
        }
    }

    #[test]
    fn valid_registration_debug_hides_password() {
        let valid = validate_registration(request("alice", "alice@example.com", "hunter2")).unwrap();
        let debug = format!("{valid:?}");
        assert!(debug.contains("alice@example.com"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn refresh_body_parsing() {
        assert_eq!(refresh_token_from_body(&Bytes::new()), None);
        assert_eq!(refresh_token_from_body(&Bytes::from_static(b"  \n")), None);
        assert_eq!(
            refresh_token_from_body(&Bytes::from_static(br#"{"refreshToken":"abc"}"#)),
            Some("abc".to_string())
        );
        assert_eq!(refresh_token_from_body(&Bytes::from_static(b"{}")), None);
        assert_eq!(refresh_token_from_body(&Bytes::from_static(b"{oops")), None);
        assert_eq!(refresh_token_from_body(&Bytes::from_static(b"token=abc")), None);
    }

    #[test]
    fn login_response_flattens_tokens() {
        let response = LoginResponse {
            user: UserProfile {
                id: uuid::Uuid::nil(),
                username: "alice".into(),
                email: "alice@example.com".into(),
                avatar: None,
                created_at: chrono::Utc::now(),
            },
            tokens: TokenPair {
                access_token: "a".into(),
                refresh_token: "r".into(),
            },
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["accessToken"], "a");
        assert_eq!(json["refreshToken"], "r");
        assert_eq!(json["user"]["username"], "alice");
    }
}
