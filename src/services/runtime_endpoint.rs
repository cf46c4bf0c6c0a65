//! Runtime endpoint publishing
//!
//! A deployed runtime service gets one package of its own, named
//! `{app}/{service}/{runtime}`, mirroring the service's domains with a root
//! route. Endpoints the service declares (domain + path) are published into
//! whichever package holds that domain, creating a web-api package for
//! domains nobody holds yet.

use chrono::Utc;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::domain::{
    AclType, ApiOrigin, AuthType, CreatePackageRequest, DomainRecord, DomainType, EndpointSpec, Package,
    PackageApi, PackageApiId, PackageApiRequest, PackageId, RedirectType, RuntimeService, RuntimeServiceId,
    RuntimeServiceSpec, Scene, Scope, ZoneId, ZonePolicy, ZoneType,
};
use crate::errors::{Result, RouteplaneError};
use crate::gateway::dto::PluginRequest;
use crate::gateway::{GatewayAdapter, GatewayResolver};
use crate::services::domain_registry::{DomainDiff, DomainEntry, DomainRegistry};
use crate::services::package_api_service::PackageApiService;
use crate::services::package_service::{PackageService, ZoneTarget};
use crate::services::rule_compiler::{RuleCompiler, RATE_LIMIT_PLUGIN};
use crate::services::task_runner::TaskRunner;
use crate::services::zone_service::{ZoneConfig, ZoneService};
use crate::storage::{
    DomainFilter, PackageApiFilter, PackageFilter, RuntimeServiceFilter, Session, Store, ZonePolicyFilter,
};

pub const CORS_PLUGIN: &str = "cors";

/// An endpoint that was not published, and why
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointSkip {
    pub domain: String,
    pub path: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointReport {
    pub applied: Vec<PackageApiId>,
    pub skipped: Vec<EndpointSkip>,
}

/// Fill in endpoint defaults: a `.*` domain suffix takes the cluster's
/// wildcard domain, the path defaults to `/` and the backend path to the path.
pub fn pad_endpoint(endpoint: &EndpointSpec, wildcard_domain: &str) -> EndpointSpec {
    let mut padded = endpoint.clone();
    let domain = endpoint.domain.trim();
    padded.domain = match domain.strip_suffix(".*") {
        Some(prefix) => {
            let suffix = wildcard_domain.trim_start_matches('*').trim_start_matches('.');
            format!("{}.{}", prefix, suffix)
        }
        None => domain.to_string(),
    };
    if padded.path.trim().is_empty() {
        padded.path = "/".to_string();
    }
    if padded.backend_path.trim().is_empty() {
        padded.backend_path = padded.path.clone();
    }
    padded
}

pub fn runtime_package_name(service: &RuntimeService) -> String {
    format!("{}/{}/{}", service.app_name, service.service_name, service.runtime_name)
}

fn runtime_zone_name(service: &RuntimeService) -> String {
    runtime_package_name(service)
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

enum EndpointPackage {
    Found(Package),
    Refused(String),
}

#[derive(Debug, Clone)]
pub struct RuntimeEndpointService {
    store: Store,
    resolver: Arc<dyn GatewayResolver>,
    domains: DomainRegistry,
    zones: ZoneService,
    rules: RuleCompiler,
    apis: PackageApiService,
    packages: PackageService,
}

impl RuntimeEndpointService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        resolver: Arc<dyn GatewayResolver>,
        domains: DomainRegistry,
        zones: ZoneService,
        rules: RuleCompiler,
        apis: PackageApiService,
        packages: PackageService,
    ) -> Self {
        Self { store, resolver, domains, zones, rules, apis, packages }
    }

    /// Record a deployed service, updating its address when already known
    #[instrument(skip(self, spec), fields(app = %spec.app_name, service = %spec.service_name), name = "runtime_register")]
    pub async fn register_runtime_service(&self, spec: RuntimeServiceSpec) -> Result<RuntimeService> {
        spec.validate()?;
        let mut session = self.store.begin().await?;
        let existing = session
            .get_by::<RuntimeService>(&RuntimeServiceFilter {
                project_id: Some(spec.scope.project_id.clone()),
                env: Some(spec.scope.env.clone()),
                cluster_name: Some(spec.scope.cluster_name.clone()),
                app_name: Some(spec.app_name.clone()),
                service_name: Some(spec.service_name.clone()),
                runtime_name: Some(spec.runtime_name.clone()),
                ..Default::default()
            })
            .await?;
        let service = match existing {
            Some(mut service) => {
                service.app_id = spec.app_id;
                service.inner_address = spec.inner_address;
                service.service_port = spec.service_port;
                service.group_namespace = spec.group_namespace;
                service.group_name = spec.group_name;
                session.update(&service).await?;
                service
            }
            None => {
                let service = RuntimeService {
                    id: RuntimeServiceId::new(),
                    project_id: spec.scope.project_id,
                    env: spec.scope.env,
                    cluster_name: spec.scope.cluster_name,
                    app_id: spec.app_id,
                    app_name: spec.app_name,
                    service_name: spec.service_name,
                    runtime_name: spec.runtime_name,
                    inner_address: spec.inner_address,
                    service_port: spec.service_port,
                    group_namespace: spec.group_namespace,
                    group_name: spec.group_name,
                    created_at: Utc::now(),
                };
                session.insert(&service).await?;
                service
            }
        };
        session.commit().await?;
        info!(runtime_service_id = %service.id, "Runtime service registered");
        Ok(service)
    }

    /// Set a runtime service's domains and refresh the package mirroring it
    pub async fn touch_runtime_domains(
        &self,
        runtime_service_id: &RuntimeServiceId,
        org_id: &str,
        entries: Vec<DomainEntry>,
    ) -> Result<DomainDiff> {
        let mut session = self.store.begin().await?;
        let service = session.must_get::<RuntimeService>(runtime_service_id).await?;
        let change = self.domains.touch_runtime_domain(&mut session, &service, org_id, entries).await?;
        self.refresh_runtime_package(&mut session, &service, org_id).await?;
        session.commit().await?;
        Ok(change.diff)
    }

    /// The package of a runtime service, created on first use. The flag
    /// tells whether it was created now.
    pub async fn touch_runtime_package_meta(
        &self,
        session: &mut Session,
        service: &RuntimeService,
        org_id: &str,
    ) -> Result<(Package, bool)> {
        let existing = session
            .get_by::<Package>(&PackageFilter {
                runtime_service_id: Some(service.id.to_string()),
                ..Default::default()
            })
            .await?;
        if let Some(package) = existing {
            return Ok((package, false));
        }

        let zone = self
            .zones
            .create_zone(
                session,
                &ZoneConfig {
                    name: runtime_zone_name(service),
                    zone_type: ZoneType::PackageNew,
                    cluster_name: service.cluster_name.clone(),
                    org_id: org_id.to_string(),
                    project_id: service.project_id.clone(),
                    env: service.env.clone(),
                    runtime_service_id: service.id.to_string(),
                    ..Default::default()
                },
            )
            .await?;
        let package = Package {
            id: PackageId::new(),
            name: runtime_package_name(service),
            description: String::new(),
            scene: Scene::WebApi,
            auth_type: AuthType::None,
            acl_type: AclType::Inherit,
            zone_id: zone.id,
            cluster_name: service.cluster_name.clone(),
            org_id: org_id.to_string(),
            project_id: service.project_id.clone(),
            env: service.env.clone(),
            runtime_service_id: service.id.to_string(),
            created_at: Utc::now(),
        };
        session.insert(&package).await?;
        info!(package_id = %package.id, name = %package.name, "Runtime service endpoint created");
        Ok((package, true))
    }

    /// Align a runtime service's package with the service's domains
    #[instrument(skip(self, session, service), fields(runtime_service_id = %service.id), name = "runtime_refresh_package")]
    pub async fn refresh_runtime_package(
        &self,
        session: &mut Session,
        service: &RuntimeService,
        org_id: &str,
    ) -> Result<()> {
        let (package, _) = self.touch_runtime_package_meta(session, service, org_id).await?;
        let domains: Vec<String> = self
            .domains
            .get_runtime_domains(session, service.id.as_str())
            .await?
            .into_iter()
            .map(|r| r.domain)
            .collect();
        let domains = self.domains.touch_package_domain(session, &package, &domains).await?;

        if domains.is_empty() {
            for api in self.apis.list_package_apis_in(session, &package.id).await? {
                self.apis.delete_package_api_in(session, &package.id, &api.id).await?;
            }
            return Ok(());
        }

        self.apis.update_package_api_hosts(session, &package, &domains).await?;
        let root = session
            .get_by::<PackageApi>(&PackageApiFilter {
                package_id: Some(package.id.clone()),
                api_path: Some("/".to_string()),
                ..Default::default()
            })
            .await?;
        if root.is_none() {
            self.apis
                .create_package_api_in(
                    session,
                    &package.id,
                    PackageApiRequest {
                        api_path: "/".to_string(),
                        redirect_type: RedirectType::Service,
                        redirect_path: "/".to_string(),
                        runtime_service_id: service.id.to_string(),
                        origin: ApiOrigin::Dice,
                        ..Default::default()
                    },
                )
                .await?;
        }
        self.rules.set_package_policies(session, &package).await
    }

    /// Publish the endpoints a runtime service declares, replacing what it
    /// published before. Endpoints on domains or paths held by someone else
    /// are skipped and reported.
    #[instrument(skip(self, session, endpoints), fields(runtime_service_id = %runtime_service_id, count = endpoints.len()), name = "runtime_set_endpoints")]
    pub async fn set_runtime_endpoints(
        &self,
        session: &mut Session,
        runtime_service_id: &RuntimeServiceId,
        org_id: &str,
        endpoints: &[EndpointSpec],
    ) -> Result<EndpointReport> {
        for endpoint in endpoints {
            endpoint.validate()?;
        }
        let service = session.must_get::<RuntimeService>(runtime_service_id).await?;
        let cluster = self.resolver.cluster(&service.cluster_name)?;
        let adapter = self.resolver.adapter(&service.cluster_name).await?;

        let mut report = EndpointReport::default();
        for endpoint in endpoints.iter().map(|e| pad_endpoint(e, &cluster.wildcard_domain)) {
            let package = match self.endpoint_package(session, &service, org_id, &endpoint.domain).await? {
                EndpointPackage::Found(package) => package,
                EndpointPackage::Refused(reason) => {
                    report.skip(&endpoint, reason);
                    continue;
                }
            };
            let Some(api) = self.touch_endpoint_route(session, &service, &package, &endpoint).await? else {
                report.skip(&endpoint, "path already used by another route".to_string());
                continue;
            };
            let zone_id = ZoneId::from(api.zone_id.as_str());
            self.apply_endpoint_policy(session, adapter.as_ref(), &zone_id, CORS_PLUGIN, endpoint.policies.cors.as_ref())
                .await?;
            self.apply_endpoint_policy(
                session,
                adapter.as_ref(),
                &zone_id,
                RATE_LIMIT_PLUGIN,
                endpoint.policies.rate_limit.as_ref(),
            )
            .await?;
            self.rules.set_package_api_policies(session, &package, &api).await?;
            report.applied.push(api.id);
        }

        let stale: Vec<PackageApi> = session
            .select::<PackageApi>(&PackageApiFilter {
                runtime_service_id: Some(service.id.to_string()),
                origin: Some(ApiOrigin::DiceYaml),
                ..Default::default()
            })
            .await?
            .into_iter()
            .filter(|api| !report.applied.contains(&api.id))
            .collect();
        let emptied = self.delete_routes(session, stale).await?;
        self.delete_empty_packages(session, emptied, false).await?;

        for skip in &report.skipped {
            warn!(domain = %skip.domain, path = %skip.path, reason = %skip.reason, "Endpoint skipped");
        }
        info!(applied = report.applied.len(), skipped = report.skipped.len(), "Runtime endpoints applied");
        Ok(report)
    }

    /// Run [`Self::set_runtime_endpoints`] as a detached task
    pub async fn set_runtime_endpoints_async(
        &self,
        runner: &TaskRunner,
        runtime_service_id: RuntimeServiceId,
        org_id: String,
        endpoints: Vec<EndpointSpec>,
    ) -> Result<JoinHandle<()>> {
        let this = self.clone();
        let subject = runtime_service_id.to_string();
        runner
            .submit("runtime_endpoints", subject, move |mut session| async move {
                this.set_runtime_endpoints(&mut session, &runtime_service_id, &org_id, &endpoints).await?;
                session.commit().await
            })
            .await
    }

    /// Remove every route published for a runtime service, with the
    /// packages this leaves empty
    #[instrument(skip(self, session), fields(runtime_service_id = %runtime_service_id), name = "runtime_clear_route")]
    pub async fn clear_runtime_route(&self, session: &mut Session, runtime_service_id: &RuntimeServiceId) -> Result<()> {
        let apis = session
            .select::<PackageApi>(&PackageApiFilter {
                runtime_service_id: Some(runtime_service_id.to_string()),
                ..Default::default()
            })
            .await?;
        let mut emptied = self.delete_routes(session, apis).await?;
        if let Some(own) = session
            .get_by::<Package>(&PackageFilter {
                runtime_service_id: Some(runtime_service_id.to_string()),
                ..Default::default()
            })
            .await?
        {
            emptied.insert(own.id);
        }
        self.delete_empty_packages(session, emptied, true).await?;
        info!(runtime_service_id = %runtime_service_id, "Runtime routes cleared");
        Ok(())
    }

    async fn endpoint_package(
        &self,
        session: &mut Session,
        service: &RuntimeService,
        org_id: &str,
        domain: &str,
    ) -> Result<EndpointPackage> {
        let bound = session
            .get_by::<DomainRecord>(&DomainFilter {
                domain: Some(domain.to_string()),
                cluster_name: Some(service.cluster_name.clone()),
                domain_type: Some(DomainType::Package),
                project_id: Some(service.project_id.clone()),
                env: Some(service.env.clone()),
                ..Default::default()
            })
            .await?;
        if let Some(record) = bound {
            let package = session.must_get::<Package>(&PackageId::from(record.package_id.as_str())).await?;
            return Ok(EndpointPackage::Found(package));
        }

        if let Some(owner) = self.domains.find_owner(session, &service.cluster_name, domain).await? {
            if owner.runtime_service_id == service.id.as_str() {
                let (package, _) = self.touch_runtime_package_meta(session, service, org_id).await?;
                return Ok(EndpointPackage::Found(package));
            }
            return Ok(EndpointPackage::Refused(format!(
                "domain already used by other: {}",
                owner.owner_description()
            )));
        }

        let req = CreatePackageRequest {
            name: domain.to_string(),
            description: format!("Published by {}", runtime_package_name(service)),
            scene: Scene::WebApi,
            bind_domain: vec![domain.to_string()],
            scope: Scope {
                org_id: org_id.to_string(),
                project_id: service.project_id.clone(),
                env: service.env.clone(),
                cluster_name: service.cluster_name.clone(),
            },
            ..Default::default()
        };
        match self.packages.create_package_in(session, req, &ZoneTarget::default()).await {
            Ok(info) => Ok(EndpointPackage::Found(info.package)),
            Err(e @ RouteplaneError::Conflict { .. }) => Ok(EndpointPackage::Refused(e.to_string())),
            Err(e) => Err(e),
        }
    }

    /// Create or re-point the route of an endpoint. `None` when the path is
    /// held by a route this service does not own.
    async fn touch_endpoint_route(
        &self,
        session: &mut Session,
        service: &RuntimeService,
        package: &Package,
        endpoint: &EndpointSpec,
    ) -> Result<Option<PackageApi>> {
        let existing = session
            .get_by::<PackageApi>(&PackageApiFilter {
                package_id: Some(package.id.clone()),
                api_path: Some(endpoint.path.clone()),
                method: Some(String::new()),
                ..Default::default()
            })
            .await?;
        match existing {
            Some(api) if api.runtime_service_id != service.id.as_str() => Ok(None),
            Some(mut api) => {
                if api.redirect_path != endpoint.backend_path || api.redirect_type != RedirectType::Service {
                    api.redirect_type = RedirectType::Service;
                    api.redirect_path = endpoint.backend_path.clone();
                    let domains = self.domains.get_package_domains(session, &package.id).await?;
                    let zone_id = self.apis.touch_package_api_zone(session, package, &api, &domains).await?;
                    api.zone_id = zone_id.to_string();
                    session.update(&api).await?;
                }
                Ok(Some(api))
            }
            None => {
                let api = self
                    .apis
                    .create_package_api_in(
                        session,
                        &package.id,
                        PackageApiRequest {
                            api_path: endpoint.path.clone(),
                            redirect_type: RedirectType::Service,
                            redirect_path: endpoint.backend_path.clone(),
                            runtime_service_id: service.id.to_string(),
                            origin: ApiOrigin::DiceYaml,
                            ..Default::default()
                        },
                    )
                    .await?;
                Ok(Some(api))
            }
        }
    }

    /// Attach, update or detach one zone-wide endpoint plugin
    async fn apply_endpoint_policy(
        &self,
        session: &mut Session,
        adapter: &dyn GatewayAdapter,
        zone_id: &ZoneId,
        plugin_name: &str,
        config: Option<&Value>,
    ) -> Result<()> {
        let Some(config) = config else {
            if let Some(removed) = self.zones.clear_zone_policy(session, zone_id, plugin_name).await? {
                adapter.remove_plugin(&removed.plugin_id).await?;
            }
            return Ok(());
        };
        let existing = session
            .get_by::<ZonePolicy>(&ZonePolicyFilter {
                zone_id: Some(zone_id.clone()),
                plugin_name: Some(plugin_name.to_string()),
                ..Default::default()
            })
            .await?;
        let plugin_id = existing.map(|p| p.plugin_id).unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut plugin = PluginRequest::new(plugin_name, config.clone());
        plugin.id = Some(plugin_id.clone());
        plugin.enabled = false;
        adapter.create_or_update_plugin_by_id(&plugin).await?;
        self.zones.set_zone_policy(session, zone_id, plugin_name, &plugin_id, true).await?;
        Ok(())
    }

    /// Delete routes, returning the packages they belonged to
    async fn delete_routes(&self, session: &mut Session, apis: Vec<PackageApi>) -> Result<BTreeSet<PackageId>> {
        let mut packages = BTreeSet::new();
        for api in apis {
            self.apis.delete_package_api_in(session, &api.package_id, &api.id).await?;
            packages.insert(api.package_id);
        }
        Ok(packages)
    }

    /// Delete the given packages that have no routes left. A runtime
    /// service's own package is only removed when `include_runtime` is set.
    async fn delete_empty_packages(
        &self,
        session: &mut Session,
        package_ids: BTreeSet<PackageId>,
        include_runtime: bool,
    ) -> Result<()> {
        for package_id in package_ids {
            let Some(package) = session.get::<Package>(&package_id).await? else {
                continue;
            };
            if !include_runtime && !package.runtime_service_id.is_empty() {
                continue;
            }
            if package.scene.is_shared_entry() {
                continue;
            }
            if self.apis.list_package_apis_in(session, &package.id).await?.is_empty() {
                self.packages.delete_package_in(session, &package.id).await?;
            }
        }
        Ok(())
    }
}

impl EndpointReport {
    fn skip(&mut self, endpoint: &EndpointSpec, reason: String) {
        self.skipped.push(EndpointSkip {
            domain: endpoint.domain.clone(),
            path: endpoint.path.clone(),
            reason,
        });
    }
}
