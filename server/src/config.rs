//! Server configuration module.
//!
//! Parses configuration from environment variables for the Rollcall server.
//!
//! # Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `ROLLCALL_ACCESS_TOKEN_SECRET` | Yes | - | HMAC secret for access tokens |
//! | `ROLLCALL_REFRESH_TOKEN_SECRET` | Yes | - | HMAC secret for refresh tokens (must differ) |
//! | `ROLLCALL_ACCESS_TOKEN_TTL_SECS` | No | 900 | Access token lifetime |
//! | `ROLLCALL_REFRESH_TOKEN_TTL_SECS` | No | 864000 | Refresh token and session lifetime |
//! | `ROLLCALL_MAX_SESSIONS_PER_USER` | No | 10 | Concurrent sessions kept per user |
//! | `ROLLCALL_COOKIE_SECURE` | No | true | Mark auth cookies `Secure` |
//! | `ROLLCALL_PUBLIC_ROOMS` | No | false | Allow unauthenticated WebSocket clients |
//! | `ROLLCALL_CORS_ORIGIN` | No | - | Allowed browser origin |
//! | `ROLLCALL_UPLOAD_DIR` | No | `./uploads` | Avatar upload directory |
//! | `PORT` | No | 8000 | HTTP server port |

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

/// Default HTTP server port.
const DEFAULT_PORT: u16 = 8000;

/// Default access token lifetime (15 minutes).
const DEFAULT_ACCESS_TOKEN_TTL_SECS: u64 = 900;

/// Default refresh token lifetime (10 days).
const DEFAULT_REFRESH_TOKEN_TTL_SECS: u64 = 864_000;

/// Default number of concurrent sessions per user.
const DEFAULT_MAX_SESSIONS_PER_USER: usize = 10;

/// Longest accepted token lifetime (10 years).
const MAX_TOKEN_TTL_SECS: u64 = 315_360_000;

/// Default avatar upload directory.
const DEFAULT_UPLOAD_DIR: &str = "./uploads";

/// Errors that can occur when parsing configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    /// Environment variable has invalid format.
    #[error("invalid format for {var}: {message}")]
    InvalidFormat { var: String, message: String },

    /// Port number is invalid.
    #[error("invalid port number: {0}")]
    InvalidPort(#[from] std::num::ParseIntError),

    /// Configuration validation failed.
    #[error("configuration validation failed: {0}")]
    ValidationError(String),
}

/// Server configuration parsed from environment variables.
#[derive(Clone)]
pub struct Config {
    /// HMAC secret used to sign access tokens.
    pub access_token_secret: String,

    /// HMAC secret used to sign refresh tokens.
    pub refresh_token_secret: String,

    /// Lifetime of an access token.
    pub access_token_ttl: Duration,

    /// Lifetime of a refresh token and of the session holding it.
    pub refresh_token_ttl: Duration,

    /// Maximum number of live sessions per user; the oldest is evicted beyond this.
    pub max_sessions_per_user: usize,

    /// Whether auth cookies carry the `Secure` attribute.
    pub cookie_secure: bool,

    /// When true, WebSocket clients may join rooms without credentials.
    pub public_rooms: bool,

    /// Browser origin allowed by the CORS layer, if any.
    pub cors_origin: Option<String>,

    /// Directory where uploaded avatars are written.
    pub upload_dir: PathBuf,

    /// HTTP server port.
    pub port: u16,
}

impl Config {
    /// Parse configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - Either token secret is missing or empty
    /// - The two token secrets are identical
    /// - A numeric variable does not parse or is zero
    /// - A token TTL is longer than ten years
    ///
    /// # Example
    ///
    /// ```no_run
    /// use rollcall_server::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Server will listen on port {}", config.port);
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        let access_token_secret = required_env("ROLLCALL_ACCESS_TOKEN_SECRET")?;
        let refresh_token_secret = required_env("ROLLCALL_REFRESH_TOKEN_SECRET")?;
        let access_token_ttl = Duration::from_secs(parse_positive_env(
            "ROLLCALL_ACCESS_TOKEN_TTL_SECS",
            DEFAULT_ACCESS_TOKEN_TTL_SECS,
        )?);
        let refresh_token_ttl = Duration::from_secs(parse_positive_env(
            "ROLLCALL_REFRESH_TOKEN_TTL_SECS",
            DEFAULT_REFRESH_TOKEN_TTL_SECS,
        )?);
        let max_sessions_per_user = parse_positive_env(
            "ROLLCALL_MAX_SESSIONS_PER_USER",
            DEFAULT_MAX_SESSIONS_PER_USER as u64,
        )? as usize;
        let cookie_secure = parse_bool_env("ROLLCALL_COOKIE_SECURE", true);
        let public_rooms = parse_bool_env("ROLLCALL_PUBLIC_ROOMS", false);
        let cors_origin = env::var("ROLLCALL_CORS_ORIGIN")
            .ok()
            .filter(|origin| !origin.trim().is_empty());
        let upload_dir = env::var("ROLLCALL_UPLOAD_DIR")
            .ok()
            .filter(|dir| !dir.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_UPLOAD_DIR));
        let port = parse_port()?;

        let config = Self {
            access_token_secret,
            refresh_token_secret,
            access_token_ttl,
            refresh_token_ttl,
            max_sessions_per_user,
            cookie_secure,
            public_rooms,
            cors_origin,
            upload_dir,
            port,
        };

        config.validate()?;

        if !config.cookie_secure {
            warn!("ROLLCALL_COOKIE_SECURE is disabled - auth cookies will be sent over plain HTTP");
        }

        if config.public_rooms {
            warn!("ROLLCALL_PUBLIC_ROOMS is enabled - anyone can observe attendee counts");
        }

        Ok(config)
    }

    /// Build a configuration from two secrets, taking defaults for everything
    /// else. Used when embedding the server and in tests.
    pub fn with_secrets(
        access_token_secret: impl Into<String>,
        refresh_token_secret: impl Into<String>,
    ) -> Self {
        Self {
            access_token_secret: access_token_secret.into(),
            refresh_token_secret: refresh_token_secret.into(),
            access_token_ttl: Duration::from_secs(DEFAULT_ACCESS_TOKEN_TTL_SECS),
            refresh_token_ttl: Duration::from_secs(DEFAULT_REFRESH_TOKEN_TTL_SECS),
            max_sessions_per_user: DEFAULT_MAX_SESSIONS_PER_USER,
            cookie_secure: true,
            public_rooms: false,
            cors_origin: None,
            upload_dir: PathBuf::from(DEFAULT_UPLOAD_DIR),
            port: DEFAULT_PORT,
        }
    }

    /// Validate the configuration.
    ///
    /// Access and refresh tokens must be signed with different secrets so that
    /// one kind of token can never be accepted in place of the other.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.access_token_secret == self.refresh_token_secret {
            return Err(ConfigError::ValidationError(
                "access and refresh token secrets must differ".to_string(),
            ));
        }

        if self.refresh_token_ttl <= self.access_token_ttl {
            return Err(ConfigError::ValidationError(
                "refresh token TTL must be longer than access token TTL".to_string(),
            ));
        }

        let max_ttl = Duration::from_secs(MAX_TOKEN_TTL_SECS);
        if self.access_token_ttl > max_ttl || self.refresh_token_ttl > max_ttl {
            return Err(ConfigError::ValidationError(format!(
                "token TTLs must not exceed {MAX_TOKEN_TTL_SECS} seconds"
            )));
        }

        Ok(())
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("access_token_secret", &"<redacted>")
            .field("refresh_token_secret", &"<redacted>")
            .field("access_token_ttl", &self.access_token_ttl)
            .field("refresh_token_ttl", &self.refresh_token_ttl)
            .field("max_sessions_per_user", &self.max_sessions_per_user)
            .field("cookie_secure", &self.cookie_secure)
            .field("public_rooms", &self.public_rooms)
            .field("cors_origin", &self.cors_origin)
            .field("upload_dir", &self.upload_dir)
            .field("port", &self.port)
            .finish()
    }
}

/// Read a required, non-empty environment variable.
fn required_env(name: &str) -> Result<String, ConfigError> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::MissingEnvVar(name.to_string())),
    }
}

/// Parse a boolean environment variable.
///
/// Accepts `true`/`false` (case-insensitive); anything else, or an unset
/// variable, yields `default`.
fn parse_bool_env(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(v) if v.eq_ignore_ascii_case("true") => true,
        Ok(v) if v.eq_ignore_ascii_case("false") => false,
        _ => default,
    }
}

/// Parse a positive integer environment variable, falling back to `default`.
fn parse_positive_env(name: &str, default: u64) -> Result<u64, ConfigError> {
    let raw = match env::var(name) {
        Ok(raw) => raw,
        Err(env::VarError::NotPresent) => return Ok(default),
        Err(env::VarError::NotUnicode(_)) => {
            return Err(ConfigError::InvalidFormat {
                var: name.to_string(),
                message: "contains invalid unicode".to_string(),
            })
        }
    };

    let value: u64 = raw.trim().parse().map_err(|_| ConfigError::InvalidFormat {
        var: name.to_string(),
        message: format!("expected a positive integer, got '{raw}'"),
    })?;

    if value == 0 {
        return Err(ConfigError::InvalidFormat {
            var: name.to_string(),
            message: "must be greater than zero".to_string(),
        });
    }

    Ok(value)
}

/// Parse the PORT environment variable.
///
/// Returns the default port if not set.
fn parse_port() -> Result<u16, ConfigError> {
    match env::var("PORT") {
        Ok(port_str) => Ok(port_str.parse()?),
        Err(env::VarError::NotPresent) => Ok(DEFAULT_PORT),
        Err(env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidFormat {
            var: "PORT".to_string(),
            message: "contains invalid unicode".to_string(),
        }),
    }
}
