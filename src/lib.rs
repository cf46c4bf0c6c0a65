//! # Routeplane
//!
//! Control plane for API gateways. Routeplane keeps a relational model of
//! packages, routes, domains and registered upstream apis, and reconciles it
//! onto gateway backends: a Kong admin API, a mesh gateway, or Kubernetes
//! ingresses.
//!
//! ## Architecture
//!
//! ```text
//! request → service (session) → domain registry / zones → rule compiler → gateway adapter
//!                  ↓                                                            ↓
//!          commit / rollback  ←──────────── compensation on failure ───────────┘
//! ```
//!
//! Every operation runs on one [`storage::Session`]. Backend calls happen
//! while the session is open; on failure the session rolls back and
//! multi-step reconciliations undo the backend changes they already made.

pub mod cli;
pub mod config;
pub mod domain;
pub mod errors;
pub mod gateway;
pub mod observability;
pub mod services;
pub mod storage;

pub use config::AppConfig;
pub use errors::{Result, RouteplaneError};
pub use services::Managers;

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name from Cargo.toml
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_available() {
        assert!(!VERSION.is_empty());
        assert_eq!(APP_NAME, "routeplane");
    }
}
