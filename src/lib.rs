pub mod analytics;
pub mod auth;
pub mod config;
pub mod error;
pub mod identity;
pub mod models;
pub mod openapi;
pub mod rate_limit; // in-memory vote throttling
pub mod repo;
pub mod routes;
pub mod voting;

// Re-export commonly used items for tests / external users
pub use identity::{Identity, SessionCookies};
pub use routes::{config, AppState};
