//! # parley-server
//!
//! Real-time direct-messaging hub.
//!
//! - **Hub**: single owner of the online-user registry and the only path for
//!   fanning events out to sessions
//! - **Session**: one authenticated WebSocket, split into a reader running
//!   frame handlers and a writer that owns the socket
//! - **Handlers**: validate frames, persist through `parley-store`, post
//!   events to the hub
//! - **REST API** (axum) for health, presence and the `/ws` upgrade

pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod hub;
pub mod session;
