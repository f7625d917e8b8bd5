//! HTTP surface of the Rollcall server.
//!
//! - `POST /users/register`, `/users/login`, `/users/logout`, `/users/refresh`
//! - `GET /users/me`
//! - `POST /events`, `GET /events`
//! - `GET|PUT|DELETE /events/{id}`, `POST /events/{id}/attend`
//! - `GET /ws` - live attendee counts
//! - `GET /health`
//! - `GET /uploads/*` - stored avatars
//!
//! # Architecture
//!
//! All routes share [`AppState`]. Handlers return `Result<_, ApiError>`;
//! authentication happens in the [`crate::auth::AuthUser`] extractor.
//!
//! # Example
//!
//! ```rust,no_run
//! use rollcall_server::config::Config;
//! use rollcall_server::routes::{create_router, AppState};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_env().expect("failed to load config");
//!     let state = AppState::new(config);
//!     let app = create_router(state);
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8000").await.unwrap();
//!     axum::serve(listener, app).await.unwrap();
//! }
//! ```

pub mod events;
pub mod extract;
pub mod users;
pub mod ws;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, State},
    http::{header, HeaderValue, Method, Request},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tower_http::{cors::CorsLayer, services::ServeDir, trace::TraceLayer};
use tracing::{debug, debug_span, warn, Span};

use crate::config::Config;
use crate::events::EventStore;
use crate::rooms::RoomBroadcaster;
use crate::session::{SessionStore, SessionStoreConfig};
use crate::tokens::TokenService;
use crate::upload::{AvatarStore, MAX_UPLOAD_BYTES, UPLOADS_PREFIX};
use crate::users::UserStore;

/// Shared application state for all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub users: Arc<UserStore>,
    pub events: Arc<EventStore>,
    pub tokens: Arc<TokenService>,
    pub rooms: RoomBroadcaster,
    pub avatars: AvatarStore,
    /// Server start time for uptime calculation.
    pub start_time: Instant,
}

impl AppState {
    /// Creates empty stores wired to the given configuration.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let sessions = Arc::new(SessionStore::new(SessionStoreConfig::new(
            config.max_sessions_per_user,
        )));
        let tokens = TokenService::new(&config, sessions);
        let avatars = AvatarStore::new(config.upload_dir.clone());

        Self {
            config: Arc::new(config),
            users: Arc::new(UserStore::new()),
            events: Arc::new(EventStore::new()),
            tokens: Arc::new(tokens),
            rooms: RoomBroadcaster::new(),
            avatars,
            start_time: Instant::now(),
        }
    }

    /// Spawns the periodic sweep that drops expired sessions and empty rooms.
    pub fn spawn_maintenance_task(&self, sweep_interval: Duration) -> JoinHandle<()> {
        let tokens = Arc::clone(&self.tokens);
        let rooms = self.rooms.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);

            loop {
                interval.tick().await;
                let sessions_removed = tokens.sessions().cleanup_expired();
                let rooms_removed = rooms.prune_empty_rooms();
                if sessions_removed > 0 || rooms_removed > 0 {
                    debug!(sessions_removed, rooms_removed, "Maintenance sweep complete");
                }
            }
        })
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .field("users", &self.users)
            .field("events", &self.events)
            .field("tokens", &self.tokens)
            .field("rooms", &self.rooms)
            .field("avatars", &self.avatars)
            .field("start_time", &self.start_time)
            .finish()
    }
}

/// Creates the application router with all routes configured.
pub fn create_router(state: AppState) -> Router {
    let cors = cors_layer(state.config.cors_origin.as_deref());
    let uploads = ServeDir::new(&state.config.upload_dir);

    let router = Router::new()
        .route(
            "/users/register",
            post(users::register).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/users/login", post(users::login))
        .route("/users/logout", post(users::logout))
        .route("/users/refresh", post(users::refresh))
        .route("/users/me", get(users::me))
        .route("/events", post(events::create_event).get(events::list_events))
        .route(
            "/events/{id}",
            get(events::get_event)
                .put(events::update_event)
                .delete(events::delete_event),
        )
        .route("/events/{id}/attend", post(events::attend_event))
        .route("/ws", get(ws::get_ws))
        .route("/health", get(get_health))
        .nest_service(UPLOADS_PREFIX, uploads)
        .layer(TraceLayer::new_for_http().make_span_with(request_span))
        .with_state(state);

    match cors {
        Some(cors) => router.layer(cors),
        None => router,
    }
}

/// Request span without the query string, which may hold an access token.
fn request_span(request: &Request<Body>) -> Span {
    debug_span!(
        "request",
        method = %request.method(),
        path = %request.uri().path(),
        version = ?request.version(),
    )
}

fn cors_layer(origin: Option<&str>) -> Option<CorsLayer> {
    let origin = origin?;
    match HeaderValue::from_str(origin) {
        Ok(origin) => Some(
            CorsLayer::new()
                .allow_origin(origin)
                .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
                .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
                .allow_credentials(true),
        ),
        Err(err) => {
            warn!(origin, error = %err, "Ignoring invalid CORS origin");
            None
        }
    }
}

/// Response body for the health check endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Server status (always "ok" if responding).
    pub status: String,

    /// Number of open WebSocket connections.
    pub connections: usize,

    /// Number of allocated event rooms.
    pub rooms: usize,

    /// Number of stored sessions.
    pub sessions: usize,

    /// Server uptime in seconds.
    pub uptime_seconds: u64,
}

/// GET /health - no authentication required.
async fn get_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        connections: state.rooms.connection_count(),
        rooms: state.rooms.room_count(),
        sessions: state.tokens.sessions().len(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}
