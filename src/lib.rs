//! # Scanhub
//!
//! Backend for unattended scanning stations. Ingests (platform, product)
//! scan events over REST, persists them to an append-only SQLite log, and
//! fans them out in real time to observer clients over WebSocket while
//! tracking which scanning stations are currently alive via heartbeats.

pub mod auth;
pub mod errors;
pub mod handlers;
pub mod infra;
pub mod routes;
pub mod store;

pub use errors::{AppError, AppResult};
pub use infra::app_state::AppState;
