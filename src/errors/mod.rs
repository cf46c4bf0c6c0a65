//! # Error Handling
//!
//! Every public operation returns [`Result`]; failures carry one of the
//! [`RouteplaneError`] variants so callers can tell argument problems from
//! conflicts, missing resources and gateway backend failures.

pub mod types;

pub use types::{Result, RouteplaneError};
