//! Upstream registration
//!
//! Services register their api list in bulk under a generation id. The
//! [`register`] module records generations, [`reconciler`] diffs them
//! against what the backend holds and [`binder`] owns the backend routes.

pub mod binder;
pub mod reconciler;
pub mod register;

pub use binder::{BindTarget, UpstreamBinder};
pub use reconciler::{plan_generation, GenerationPlan, ReconcileSummary, UpstreamReconciler};
pub use register::{default_consumer_name, RegisterOutcome, UpstreamService};
