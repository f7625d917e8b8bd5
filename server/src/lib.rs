//! Rollcall Server - event management API with live attendee counts.
//!
//! This crate provides:
//! - User registration and login with argon2-hashed passwords
//! - JWT access/refresh token pairs with per-session rotation and revocation
//! - Owner-checked event CRUD and idempotent attendance
//! - Per-event WebSocket rooms receiving `attendeeUpdated` pushes
//!
//! # Architecture
//!
//! State lives in memory: [`users::UserStore`], [`events::EventStore`] and
//! [`session::SessionStore`] behind [`routes::AppState`]. Requests pass the
//! [`auth::AuthUser`] extractor, mutate a store, and the attend handler
//! publishes the new count through [`rooms::RoomBroadcaster`].

pub mod auth;
pub mod config;
pub mod error;
pub mod events;
pub mod response;
pub mod rooms;
pub mod routes;
pub mod session;
pub mod tokens;
pub mod upload;
pub mod users;
