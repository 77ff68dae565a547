//! AVA OLO Gateway Library
//!
//! The HTTP surface of the platform: the per-request usage gate plus the
//! operational routes around it (billing webhook, checkout, usage queries,
//! admin configuration, health).

pub mod config;
pub mod error;
pub mod gate;
pub mod principal;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use state::AppState;
