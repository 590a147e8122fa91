//! AiFace terminal relay
//!
//! Bridges biometric access-control terminals to a backend: terminals hold a
//! WebSocket session with the server, operators push commands through a
//! blocking admin endpoint, and the two meet on a per-device relay queue.

pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod security;
pub mod services;

// Re-export commonly used types for convenience
pub use config::AppSettings;
pub use error::AppError;
