//! Business logic services
//!
//! Each service owns one part of the reconciliation engine and works on a
//! caller-provided [`Session`](crate::storage::Session); the store-level
//! variants open and commit their own.

pub mod domain_registry;
pub mod managers;
pub mod package_api_service;
pub mod package_service;
pub mod rule_compiler;
pub mod runtime_endpoint;
pub mod task_runner;
pub mod upstream;
pub mod zone_service;

pub use domain_registry::{DomainDiff, DomainEntry, DomainRegistry};
pub use managers::Managers;
pub use package_api_service::PackageApiService;
pub use package_service::{PackageInfo, PackageService, ZoneTarget};
pub use rule_compiler::{RuleCompiler, RuleSpec};
pub use runtime_endpoint::{EndpointReport, EndpointSkip, RuntimeEndpointService};
pub use task_runner::{LogNotifier, TaskNotifier, TaskRunner};
pub use upstream::{ReconcileSummary, RegisterOutcome, UpstreamReconciler, UpstreamService};
pub use zone_service::{ZoneConfig, ZoneRoute, ZoneService};
