//! Domain layer
//!
//! Identifiers, enums, persisted records and validated requests of the
//! control plane. Nothing here performs I/O.

pub mod id;
pub mod models;
pub mod requests;
pub mod types;

pub use id::*;
pub use models::*;
pub use requests::*;
pub use types::*;
