//! Service container
//!
//! [`Managers`] wires every service once from the loaded configuration.
//! Services are cheap to clone and share the same store and resolver.

use std::sync::Arc;

use crate::config::AppConfig;
use crate::gateway::resolver::ConfiguredResolver;
use crate::gateway::GatewayResolver;
use crate::services::domain_registry::DomainRegistry;
use crate::services::package_api_service::PackageApiService;
use crate::services::package_service::PackageService;
use crate::services::rule_compiler::RuleCompiler;
use crate::services::runtime_endpoint::RuntimeEndpointService;
use crate::services::task_runner::{LogNotifier, TaskNotifier, TaskRunner};
use crate::services::upstream::{UpstreamReconciler, UpstreamService};
use crate::services::zone_service::ZoneService;
use crate::storage::Store;

#[derive(Debug, Clone)]
pub struct Managers {
    pub store: Store,
    pub resolver: Arc<dyn GatewayResolver>,
    pub domains: DomainRegistry,
    pub zones: ZoneService,
    pub rules: RuleCompiler,
    pub package_apis: PackageApiService,
    pub packages: PackageService,
    pub runtime: RuntimeEndpointService,
    pub upstreams: UpstreamService,
    pub tasks: TaskRunner,
}

impl Managers {
    /// Build with the resolver over the configured clusters and a logging
    /// task notifier
    pub fn new(config: &AppConfig, store: Store) -> Self {
        let resolver = Arc::new(ConfiguredResolver::new(config.clusters.clone(), config.gateway.clone()));
        Self::with_resolver(config, store, resolver, Arc::new(LogNotifier))
    }

    pub fn with_resolver(
        config: &AppConfig,
        store: Store,
        resolver: Arc<dyn GatewayResolver>,
        notifier: Arc<dyn TaskNotifier>,
    ) -> Self {
        let domains = DomainRegistry::new(resolver.clone(), config.gateway.clone());
        let zones = ZoneService::new(resolver.clone(), config.gateway.clone(), config.policy.clone());
        let rules = RuleCompiler::new(resolver.clone(), domains.clone(), zones.clone(), config.policy.clone());
        let package_apis = PackageApiService::new(
            store.clone(),
            resolver.clone(),
            domains.clone(),
            zones.clone(),
            rules.clone(),
        );
        let packages = PackageService::new(
            store.clone(),
            resolver.clone(),
            domains.clone(),
            zones.clone(),
            rules.clone(),
            package_apis.clone(),
        );
        let runtime = RuntimeEndpointService::new(
            store.clone(),
            resolver.clone(),
            domains.clone(),
            zones.clone(),
            rules.clone(),
            package_apis.clone(),
            packages.clone(),
        );
        let reconciler = UpstreamReconciler::new(store.clone(), resolver.clone(), config.reconciler.clone());
        let upstreams = UpstreamService::new(store.clone(), resolver.clone(), reconciler);
        let tasks = TaskRunner::new(store.clone(), notifier);

        Self { store, resolver, domains, zones, rules, package_apis, packages, runtime, upstreams, tasks }
    }
}
