//! Package route manager
//!
//! Routes either forward to a url, in which case a backend service and
//! route pair is provisioned for them, or to a runtime service, in which
//! case only the route zone's ingress is rendered. Every route owns one
//! zone named `api-{id}`.

use chrono::Utc;
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use validator::Validate;

use crate::domain::{
    AclType, ApiOrigin, AuthType, GatewayProvider, Package, PackageApi, PackageApiId, PackageApiRequest,
    PackageId, RedirectType, RuleCategory, RuntimeService, RuntimeServiceId, ZoneId, ZoneType,
};
use crate::errors::{Result, RouteplaneError};
use crate::gateway::dto::{ObjectRef, PluginRequest, RouteRequest, ServiceRequest};
use crate::gateway::k8s::{REWRITE_HOST_KEY, REWRITE_PATH_KEY};
use crate::gateway::{BackendProtocol, GatewayAdapter, GatewayResolver, RouteOptions};
use crate::services::domain_registry::DomainRegistry;
use crate::services::rule_compiler::{acl_rule, auth_rule, RuleCompiler, RuleSpec};
use crate::services::zone_service::{ZoneConfig, ZoneRoute, ZoneService};
use crate::storage::{PackageApiFilter, Session, Store};

pub const PATH_VARIABLE_PLUGIN: &str = "path-variable";
pub const ROUTE_TAG_PREFIX: &str = "package_api_id:";

const CONNECT_TIMEOUT_MS: u64 = 5000;
const READ_WRITE_TIMEOUT_MS: u64 = 60000;

const RUNTIME_PROJECT_ANNOTATION: &str = "routeplane.io/runtime-project-id";
const RUNTIME_CLUSTER_ANNOTATION: &str = "routeplane.io/runtime-cluster";
const RUNTIME_APP_ANNOTATION: &str = "routeplane.io/runtime-app";
const RUNTIME_SERVICE_ANNOTATION: &str = "routeplane.io/runtime-service";
const RUNTIME_NAME_ANNOTATION: &str = "routeplane.io/runtime-name";

lazy_static! {
    static ref PATH_VARIABLE_REGEX: Regex =
        Regex::new(r"\{([A-Za-z0-9_]+)\}").expect("PATH_VARIABLE_REGEX should be a valid regex pattern");
}

/// How a url route is laid out on a Kong-style backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendRoute {
    /// Path matched by the backend route
    pub path: String,
    pub is_regex: bool,
    /// Upstream url of the backend service
    pub service_url: String,
    /// Rewrite applied by the path-variable plugin
    pub rewrite_path: Option<String>,
}

impl BackendRoute {
    /// Regex paths are ordered by depth
    pub fn regex_priority(&self) -> Option<i32> {
        if !self.is_regex {
            return None;
        }
        let ignored = self.path.matches("^/").count() + self.path.matches(r"\/").count();
        Some(self.path.matches('/').count() as i32 - ignored as i32)
    }
}

/// Lay out a url route. Path variables (`/users/{id}`) become named regex
/// captures and the backend path is rewritten from them.
pub fn backend_route(api_path: &str, redirect_addr: &str, redirect_path: &str) -> BackendRoute {
    let addr = redirect_addr.trim_end_matches('/');
    if !PATH_VARIABLE_REGEX.is_match(api_path) {
        return BackendRoute {
            path: api_path.to_string(),
            is_regex: false,
            service_url: format!("{}{}", addr, redirect_path),
            rewrite_path: None,
        };
    }
    let path = format!("^{}$", PATH_VARIABLE_REGEX.replace_all(api_path, "(?<$1>[^/]+)"));
    let rewrite = if redirect_path.is_empty() {
        api_path.to_string()
    } else {
        redirect_path.to_string()
    };
    BackendRoute {
        path,
        is_regex: true,
        service_url: addr.to_string(),
        rewrite_path: Some(PATH_VARIABLE_REGEX.replace_all(&rewrite, "$$(uri_captures.$1)").into_owned()),
    }
}

/// Host part of a url, without scheme, port or path
fn url_host(addr: &str) -> String {
    let rest = addr.split_once("://").map(|(_, rest)| rest).unwrap_or(addr);
    let host = rest.split('/').next().unwrap_or_default();
    host.split(':').next().unwrap_or_default().to_string()
}

/// Zone route of a route forwarding to a runtime service
pub fn service_zone_route(
    api: &PackageApi,
    runtime: &RuntimeService,
    provider: GatewayProvider,
    hosts: &[String],
) -> ZoneRoute {
    let mut rewrite = match provider {
        GatewayProvider::Kong => format!("/{}", runtime.id),
        _ => String::new(),
    };
    let redirect_path = if api.redirect_path.is_empty() { "/" } else { api.redirect_path.as_str() };
    let mut path = api.api_path.clone();
    if redirect_path.ends_with('/') && path != "/" {
        path = format!("{}(/|$)(.*)", path.trim_end_matches('/'));
        rewrite = format!("{}{}$2", rewrite, redirect_path);
    } else {
        path.push_str("(.*)");
        rewrite = format!("{}{}$1", rewrite, redirect_path);
    }

    let annotations: BTreeMap<String, Option<String>> = [
        (RUNTIME_PROJECT_ANNOTATION, &runtime.project_id),
        (RUNTIME_CLUSTER_ANNOTATION, &runtime.cluster_name),
        (RUNTIME_APP_ANNOTATION, &runtime.app_name),
        (RUNTIME_SERVICE_ANNOTATION, &runtime.service_name),
        (RUNTIME_NAME_ANNOTATION, &runtime.runtime_name),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), Some(v.clone())))
    .collect();

    ZoneRoute {
        hosts: hosts.to_vec(),
        path,
        options: RouteOptions {
            rewrite_host: Some(runtime.inner_address.clone()),
            rewrite_path: Some(rewrite),
            use_regex: true,
            annotations,
            ..Default::default()
        },
    }
}

/// Zone route of a route forwarding to a url
pub fn url_zone_route(api: &PackageApi, provider: GatewayProvider, hosts: &[String]) -> ZoneRoute {
    let mut route = ZoneRoute { hosts: hosts.to_vec(), path: api.api_path.clone(), options: RouteOptions::default() };
    match provider {
        GatewayProvider::Mse => {
            route.options.annotations.insert(REWRITE_HOST_KEY.to_string(), Some(url_host(&api.redirect_addr)));
            route.options.annotations.insert(REWRITE_PATH_KEY.to_string(), Some(api.redirect_path.clone()));
        }
        _ => {
            // Kong rewrites itself; the ingress only forwards to it
            route.path.push_str(".*");
            route.options.use_regex = true;
            route.options.backend_protocol = Some(BackendProtocol::Https);
            route.options.annotations.insert(REWRITE_HOST_KEY.to_string(), None);
            route.options.annotations.insert(REWRITE_PATH_KEY.to_string(), None);
        }
    }
    route
}

fn route_tag(api_id: &PackageApiId) -> String {
    format!("{}{}", ROUTE_TAG_PREFIX, api_id)
}

/// Backend objects created while applying a route, undone on failure
#[derive(Debug, Default)]
struct Applied {
    service_id: Option<String>,
    route_id: Option<String>,
    zone_id: Option<ZoneId>,
}

/// CRUD of package routes and their backend objects
#[derive(Debug, Clone)]
pub struct PackageApiService {
    store: Store,
    resolver: Arc<dyn GatewayResolver>,
    domains: DomainRegistry,
    zones: ZoneService,
    rules: RuleCompiler,
}

impl PackageApiService {
    pub fn new(
        store: Store,
        resolver: Arc<dyn GatewayResolver>,
        domains: DomainRegistry,
        zones: ZoneService,
        rules: RuleCompiler,
    ) -> Self {
        Self { store, resolver, domains, zones, rules }
    }

    fn provider(&self, cluster_name: &str) -> GatewayProvider {
        self.resolver.cluster(cluster_name).map(|c| c.provider).unwrap_or_default()
    }

    pub async fn list_package_apis(&self, package_id: &PackageId) -> Result<Vec<PackageApi>> {
        let mut session = self.store.begin().await?;
        self.list_package_apis_in(&mut session, package_id).await
    }

    pub async fn list_package_apis_in(&self, session: &mut Session, package_id: &PackageId) -> Result<Vec<PackageApi>> {
        session
            .select::<PackageApi>(&PackageApiFilter { package_id: Some(package_id.clone()), ..Default::default() })
            .await
    }

    pub async fn create_package_api(&self, package_id: &PackageId, req: PackageApiRequest) -> Result<PackageApi> {
        let mut session = self.store.begin().await?;
        let api = self.create_package_api_in(&mut session, package_id, req).await?;
        session.commit().await?;
        Ok(api)
    }

    pub async fn update_package_api(
        &self,
        package_id: &PackageId,
        api_id: &PackageApiId,
        req: PackageApiRequest,
    ) -> Result<PackageApi> {
        let mut session = self.store.begin().await?;
        let api = self.update_package_api_in(&mut session, package_id, api_id, req).await?;
        session.commit().await?;
        Ok(api)
    }

    pub async fn delete_package_api(&self, package_id: &PackageId, api_id: &PackageApiId) -> Result<()> {
        let mut session = self.store.begin().await?;
        self.delete_package_api_in(&mut session, package_id, api_id).await?;
        session.commit().await
    }

    fn check_request(req: &PackageApiRequest) -> Result<()> {
        req.validate()?;
        req.check_redirect().map_err(|msg| RouteplaneError::validation_field(msg, "redirect_addr"))
    }

    async fn check_unique(
        &self,
        session: &mut Session,
        package_id: &PackageId,
        api_path: &str,
        method: &str,
        except: Option<&PackageApiId>,
    ) -> Result<()> {
        let existing = session
            .get_by::<PackageApi>(&PackageApiFilter {
                package_id: Some(package_id.clone()),
                api_path: Some(api_path.to_string()),
                method: Some(method.to_string()),
                ..Default::default()
            })
            .await?;
        match existing {
            Some(api) if Some(&api.id) != except => Err(RouteplaneError::conflict(
                format!("route {} {} already exists", if method.is_empty() { "ALL" } else { method }, api_path),
                "package_api",
            )),
            _ => Ok(()),
        }
    }

    async fn bound_domains(&self, session: &mut Session, package: &Package) -> Result<Vec<String>> {
        let domains = self.domains.get_package_domains(session, &package.id).await?;
        if domains.is_empty() {
            return Err(RouteplaneError::validation(format!(
                "set the domain of endpoint {} before adding routes",
                package.name
            )));
        }
        Ok(domains)
    }

    async fn runtime_of(&self, session: &mut Session, api: &PackageApi) -> Result<Option<RuntimeService>> {
        if api.redirect_type != RedirectType::Service {
            return Ok(None);
        }
        session
            .must_get::<RuntimeService>(&RuntimeServiceId::from(api.runtime_service_id.as_str()))
            .await
            .map(Some)
    }

    /// Create a route. Backend objects created before a failure are
    /// removed again before the error is returned.
    #[instrument(skip(self, session, req), fields(package_id = %package_id, path = %req.api_path), name = "package_api_create")]
    pub async fn create_package_api_in(
        &self,
        session: &mut Session,
        package_id: &PackageId,
        req: PackageApiRequest,
    ) -> Result<PackageApi> {
        Self::check_request(&req)?;
        let package = session.must_get::<Package>(package_id).await?;
        let domains = self.bound_domains(session, &package).await?;
        let method = req.normalized_method();
        self.check_unique(session, &package.id, &req.api_path, &method, None).await?;

        let mut api = PackageApi {
            id: PackageApiId::new(),
            package_id: package.id.clone(),
            api_path: req.api_path.clone(),
            method,
            redirect_type: req.redirect_type,
            redirect_addr: String::new(),
            redirect_path: req.redirect_path.clone(),
            runtime_service_id: String::new(),
            origin: req.origin,
            zone_id: String::new(),
            acl_type: req.acl_type,
            description: req.description.clone(),
            service_id: String::new(),
            route_id: String::new(),
            created_at: Utc::now(),
        };
        match req.redirect_type {
            RedirectType::Url => api.redirect_addr = req.redirect_addr.clone(),
            RedirectType::Service => {
                let runtime = session
                    .must_get::<RuntimeService>(&RuntimeServiceId::from(req.runtime_service_id.as_str()))
                    .await?;
                api.runtime_service_id = runtime.id.to_string();
            }
        }
        session.insert(&api).await?;

        let mut applied = Applied::default();
        match self.apply_new_route(session, &package, &mut api, &domains, &mut applied).await {
            Ok(()) => {
                info!(api_id = %api.id, path = %api.api_path, redirect = %api.redirect_type, "Package route created");
                Ok(api)
            }
            Err(e) => {
                tracing::error!(error = %e, api_id = %api.id, "Failed to create package route, undoing backend changes");
                self.undo(session, &package, applied).await;
                Err(e)
            }
        }
    }

    async fn apply_new_route(
        &self,
        session: &mut Session,
        package: &Package,
        api: &mut PackageApi,
        domains: &[String],
        applied: &mut Applied,
    ) -> Result<()> {
        if api.redirect_type == RedirectType::Url {
            let adapter = self.resolver.adapter(&package.cluster_name).await?;
            self.touch_backend_route(adapter.as_ref(), api, domains, applied).await?;
        }
        let had_zone = !api.zone_id.is_empty();
        let zone_id = self.touch_package_api_zone(session, package, api, domains).await?;
        if !had_zone {
            applied.zone_id = Some(zone_id.clone());
        }
        api.zone_id = zone_id.to_string();
        session.update(api).await?;

        if api.acl_type == AclType::Off {
            self.create_pass_auth_rules(session, package, api).await?;
        }
        self.rules.set_package_api_policies(session, package, api).await
    }

    async fn undo(&self, session: &mut Session, package: &Package, applied: Applied) {
        if applied.route_id.is_some() || applied.service_id.is_some() {
            match self.resolver.adapter(&package.cluster_name).await {
                Ok(adapter) => {
                    if let Some(route_id) = &applied.route_id {
                        if let Err(e) = adapter.delete_route(route_id).await {
                            warn!(error = %e, route_id = %route_id, "Failed to remove backend route");
                        }
                    }
                    if let Some(service_id) = &applied.service_id {
                        if let Err(e) = adapter.delete_service(service_id).await {
                            warn!(error = %e, service_id = %service_id, "Failed to remove backend service");
                        }
                    }
                }
                Err(e) => warn!(error = %e, "Failed to resolve adapter for compensation"),
            }
        }
        if let Some(zone_id) = applied.zone_id {
            match self.zones.get_zone(session, &zone_id).await {
                Ok(Some(zone)) => {
                    if let Err(e) = self.zones.delete_zone_route(&zone).await {
                        warn!(error = %e, zone = %zone.name, "Failed to remove zone route");
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, zone_id = %zone_id, "Failed to load zone for compensation"),
            }
        }
    }

    /// Upsert the backend service and route of a url route
    async fn touch_backend_route(
        &self,
        adapter: &dyn GatewayAdapter,
        api: &mut PackageApi,
        domains: &[String],
        applied: &mut Applied,
    ) -> Result<()> {
        let layout = backend_route(&api.api_path, &api.redirect_addr, &api.redirect_path);
        let service = adapter
            .create_or_update_service(&ServiceRequest {
                id: (!api.service_id.is_empty()).then(|| api.service_id.clone()),
                url: Some(layout.service_url.clone()),
                connect_timeout: Some(CONNECT_TIMEOUT_MS),
                read_timeout: Some(READ_WRITE_TIMEOUT_MS),
                write_timeout: Some(READ_WRITE_TIMEOUT_MS),
                ..Default::default()
            })
            .await?;
        if api.service_id.is_empty() {
            applied.service_id = Some(service.id.clone());
        }
        api.service_id = service.id.clone();

        let route = adapter
            .create_or_update_route(&RouteRequest {
                id: (!api.route_id.is_empty()).then(|| api.route_id.clone()),
                protocols: vec!["http".to_string(), "https".to_string()],
                methods: if api.method.is_empty() { Vec::new() } else { vec![api.method.clone()] },
                hosts: domains.to_vec(),
                paths: vec![layout.path.clone()],
                strip_path: Some(true),
                regex_priority: layout.regex_priority(),
                service: Some(ObjectRef::new(service.id)),
                tags: vec![route_tag(&api.id)],
                ..Default::default()
            })
            .await?;
        if api.route_id.is_empty() {
            applied.route_id = Some(route.id.clone());
        }
        api.route_id = route.id.clone();

        if let Some(rewrite) = layout.rewrite_path {
            if adapter.provider() != GatewayProvider::Mse {
                let plugin = PluginRequest::new(
                    PATH_VARIABLE_PLUGIN,
                    serde_json::json!({ "request_regex": layout.path, "rewrite_path": rewrite }),
                )
                .on_route(route.id);
                adapter.create_or_update_plugin(&plugin).await?;
            }
        }
        Ok(())
    }

    async fn delete_backend_route(&self, adapter: &dyn GatewayAdapter, api: &mut PackageApi) -> Result<()> {
        if !api.route_id.is_empty() {
            adapter.delete_route(&api.route_id).await?;
            api.route_id.clear();
        }
        if !api.service_id.is_empty() {
            adapter.delete_service(&api.service_id).await?;
            api.service_id.clear();
        }
        Ok(())
    }

    /// Point a route's zone at the route, creating the zone when missing
    pub async fn touch_package_api_zone(
        &self,
        session: &mut Session,
        package: &Package,
        api: &PackageApi,
        domains: &[String],
    ) -> Result<ZoneId> {
        let provider = self.provider(&package.cluster_name);
        let runtime = self.runtime_of(session, api).await?;
        let route = match &runtime {
            Some(runtime) => service_zone_route(api, runtime, provider, domains),
            None => url_zone_route(api, provider, domains),
        };

        let zone_id = if api.zone_id.is_empty() {
            let zone = self
                .zones
                .create_zone_without_ingress(
                    session,
                    &ZoneConfig {
                        name: format!("api-{}", api.id),
                        zone_type: ZoneType::PackageApi,
                        cluster_name: package.cluster_name.clone(),
                        org_id: package.org_id.clone(),
                        project_id: package.project_id.clone(),
                        env: package.env.clone(),
                        package_api_id: api.id.to_string(),
                        runtime_service_id: api.runtime_service_id.clone(),
                        ..Default::default()
                    },
                )
                .await?;
            zone.id
        } else {
            ZoneId::from(api.zone_id.as_str())
        };

        if self.zones.ingress_enabled(&package.cluster_name) {
            self.zones
                .update_zone_route(session, &zone_id, &route, runtime.as_ref(), api.redirect_type)
                .await?;
        }
        Ok(zone_id)
    }

    /// Re-point every route of a package at a new domain set
    #[instrument(skip(self, session, package, domains), fields(package_id = %package.id), name = "package_api_update_hosts")]
    pub async fn update_package_api_hosts(
        &self,
        session: &mut Session,
        package: &Package,
        domains: &[String],
    ) -> Result<()> {
        let adapter = self.resolver.adapter(&package.cluster_name).await?;
        for mut api in self.list_package_apis_in(session, &package.id).await? {
            let zone_id = self.touch_package_api_zone(session, package, &api, domains).await?;
            if api.zone_id.is_empty() {
                api.zone_id = zone_id.to_string();
                session.update(&api).await?;
            }
            let owns_route = matches!(api.origin, ApiOrigin::Custom | ApiOrigin::DiceYaml)
                && api.redirect_type == RedirectType::Url
                && !api.route_id.is_empty();
            if owns_route && adapter.provider() == GatewayProvider::Kong {
                adapter
                    .update_route(&RouteRequest {
                        id: Some(api.route_id.clone()),
                        hosts: domains.to_vec(),
                        tags: vec![route_tag(&api.id)],
                        ..Default::default()
                    })
                    .await?;
            }
        }
        Ok(())
    }

    /// Replace a route. Routes published by the platform keep their path,
    /// method and address.
    #[instrument(skip(self, session, req), fields(api_id = %api_id), name = "package_api_update")]
    pub async fn update_package_api_in(
        &self,
        session: &mut Session,
        package_id: &PackageId,
        api_id: &PackageApiId,
        req: PackageApiRequest,
    ) -> Result<PackageApi> {
        req.validate()?;
        let package = session.must_get::<Package>(package_id).await?;
        let mut api = session.must_get::<PackageApi>(api_id).await?;
        if api.package_id != package.id {
            return Err(RouteplaneError::not_found("package_api", api_id.as_str()));
        }
        let old = api.clone();
        let method = req.normalized_method();

        if api.origin.is_immutable()
            && (req.api_path != api.api_path || method != api.method || req.redirect_addr != api.redirect_addr)
        {
            return Err(RouteplaneError::validation(format!(
                "route {} is managed by the platform: path, method and address cannot change",
                api.id
            )));
        }

        let mut applied = Applied::default();
        if let Err(e) = self.apply_route_update(session, &package, &old, &mut api, req, &mut applied).await {
            tracing::error!(error = %e, api_id = %api.id, "Failed to update package route, undoing backend changes");
            self.undo(session, &package, applied).await;
            return Err(e);
        }
        info!(api_id = %api.id, path = %api.api_path, "Package route updated");
        Ok(api)
    }

    async fn apply_route_update(
        &self,
        session: &mut Session,
        package: &Package,
        old: &PackageApi,
        api: &mut PackageApi,
        req: PackageApiRequest,
        applied: &mut Applied,
    ) -> Result<()> {
        let method = req.normalized_method();
        if api.origin.is_immutable() {
            api.acl_type = req.acl_type;
            api.description = req.description;
            session.update(api).await?;
        } else {
            req.check_redirect().map_err(|msg| RouteplaneError::validation_field(msg, "redirect_addr"))?;
            if req.api_path != api.api_path || method != api.method {
                self.check_unique(session, &package.id, &req.api_path, &method, Some(&api.id)).await?;
            }
            let domains = self.bound_domains(session, package).await?;
            api.api_path = req.api_path.clone();
            api.method = method;
            api.redirect_type = req.redirect_type;
            api.redirect_path = req.redirect_path.clone();
            api.acl_type = req.acl_type;
            api.description = req.description.clone();

            let adapter = self.resolver.adapter(&package.cluster_name).await?;
            match req.redirect_type {
                RedirectType::Url => {
                    api.redirect_addr = req.redirect_addr.clone();
                    api.runtime_service_id.clear();
                    let unchanged = old.redirect_type == RedirectType::Url
                        && old.redirect_addr == api.redirect_addr
                        && old.redirect_path == api.redirect_path
                        && old.api_path == api.api_path
                        && old.method == api.method
                        && !old.route_id.is_empty();
                    if !unchanged {
                        self.touch_backend_route(adapter.as_ref(), api, &domains, applied).await?;
                    }
                }
                RedirectType::Service => {
                    if old.redirect_type == RedirectType::Url {
                        self.delete_backend_route(adapter.as_ref(), api).await?;
                    }
                    api.redirect_addr.clear();
                    let runtime = session
                        .must_get::<RuntimeService>(&RuntimeServiceId::from(req.runtime_service_id.as_str()))
                        .await?;
                    api.runtime_service_id = runtime.id.to_string();
                }
            }
            let zone_id = self.touch_package_api_zone(session, package, api, &domains).await?;
            api.zone_id = zone_id.to_string();
            session.update(api).await?;
        }

        if old.acl_type != api.acl_type {
            self.delete_pass_auth_rules(session, api).await?;
            if api.acl_type == AclType::Off {
                self.create_pass_auth_rules(session, package, api).await?;
            }
        } else if old.redirect_type != api.redirect_type && api.acl_type == AclType::Off {
            self.delete_pass_auth_rules(session, api).await?;
            self.create_pass_auth_rules(session, package, api).await?;
        }
        self.rules.set_package_api_policies(session, package, api).await
    }

    /// Delete a route with its rules, backend objects and zone
    #[instrument(skip(self, session), fields(api_id = %api_id), name = "package_api_delete")]
    pub async fn delete_package_api_in(
        &self,
        session: &mut Session,
        package_id: &PackageId,
        api_id: &PackageApiId,
    ) -> Result<()> {
        let Some(mut api) = session.get::<PackageApi>(api_id).await? else {
            return Ok(());
        };
        let package = session.must_get::<Package>(package_id).await?;
        self.rules.delete_by_package_api(session, &package, &api).await?;

        if !api.route_id.is_empty() || !api.service_id.is_empty() {
            let adapter = self.resolver.adapter(&package.cluster_name).await?;
            self.delete_backend_route(adapter.as_ref(), &mut api).await?;
        }
        if !api.zone_id.is_empty() {
            self.zones.delete_zone(session, &ZoneId::from(api.zone_id.as_str())).await?;
        }
        session.delete_by_id::<PackageApi>(&api.id).await?;
        info!(api_id = %api.id, path = %api.api_path, "Package route deleted");
        Ok(())
    }

    /// Rules letting a route bypass its package's consumer checks
    async fn create_pass_auth_rules(&self, session: &mut Session, package: &Package, api: &PackageApi) -> Result<()> {
        let adapter = self.resolver.adapter(&package.cluster_name).await?;
        let scoped = |spec: RuleSpec| RuleSpec { package_api_id: api.id.to_string(), package_zone_need: false, ..spec };
        if adapter.provider() != GatewayProvider::Mse {
            let acl = acl_rule(adapter.provider(), AclType::Off, &[])?;
            self.rules.create_rule(session, package, scoped(acl)).await?;
        }
        if package.auth_type != AuthType::None {
            let mut auth = auth_rule(adapter.as_ref(), package.auth_type, &[]).await?;
            auth.enabled = false;
            self.rules.create_rule(session, package, scoped(auth)).await?;
        }
        Ok(())
    }

    async fn delete_pass_auth_rules(&self, session: &mut Session, api: &PackageApi) -> Result<()> {
        for category in [RuleCategory::Auth, RuleCategory::Acl] {
            for rule in self.rules.get_api_rules(session, api, Some(category)).await? {
                self.rules.delete_rule(session, &rule.id).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api(path: &str, redirect_path: &str) -> PackageApi {
        PackageApi {
            id: PackageApiId::from("a1"),
            package_id: PackageId::from("p1"),
            api_path: path.to_string(),
            method: String::new(),
            redirect_type: RedirectType::Service,
            redirect_addr: "http://backend.local:8080/base".to_string(),
            redirect_path: redirect_path.to_string(),
            runtime_service_id: "rs1".to_string(),
            origin: ApiOrigin::Custom,
            zone_id: String::new(),
            acl_type: AclType::Inherit,
            description: String::new(),
            service_id: String::new(),
            route_id: String::new(),
            created_at: Utc::now(),
        }
    }

    fn runtime() -> RuntimeService {
        RuntimeService {
            id: RuntimeServiceId::from("rs1"),
            project_id: "7".to_string(),
            env: "dev".to_string(),
            cluster_name: "c1".to_string(),
            app_id: "1".to_string(),
            app_name: "shop".to_string(),
            service_name: "web".to_string(),
            runtime_name: "master".to_string(),
            inner_address: "web.project-7-dev.svc.cluster.local".to_string(),
            service_port: 8080,
            group_namespace: "project-7-dev".to_string(),
            group_name: "g1".to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn plain_paths_forward_to_address_plus_path() {
        let layout = backend_route("/orders", "http://shop:8080/", "/v1/orders");
        assert!(!layout.is_regex);
        assert_eq!(layout.service_url, "http://shop:8080/v1/orders");
        assert_eq!(layout.rewrite_path, None);
        assert_eq!(layout.regex_priority(), None);
    }

    #[test]
    fn path_variables_become_captures() {
        let layout = backend_route("/users/{id}/orders", "http://shop:8080", "/api/users/{id}");
        assert!(layout.is_regex);
        assert_eq!(layout.path, "^/users/(?<id>[^/]+)/orders$");
        assert_eq!(layout.service_url, "http://shop:8080");
        assert_eq!(layout.rewrite_path.as_deref(), Some("/api/users/$(uri_captures.id)"));
        assert_eq!(layout.regex_priority(), Some(3));
    }

    #[test]
    fn service_route_with_trailing_slash_redirect() {
        let route = service_zone_route(&api("/shop/", "/api/"), &runtime(), GatewayProvider::Kong, &["a.com".into()]);
        assert_eq!(route.path, "/shop(/|$)(.*)");
        assert_eq!(route.options.rewrite_path.as_deref(), Some("/rs1/api/$2"));
        assert!(route.options.use_regex);
        assert_eq!(route.options.rewrite_host.as_deref(), Some("web.project-7-dev.svc.cluster.local"));
    }

    #[test]
    fn service_route_at_root() {
        let route = service_zone_route(&api("/", "/"), &runtime(), GatewayProvider::Mse, &["a.com".into()]);
        assert_eq!(route.path, "/(.*)");
        assert_eq!(route.options.rewrite_path.as_deref(), Some("/$1"));
        assert_eq!(
            route.options.annotations.get(RUNTIME_SERVICE_ANNOTATION),
            Some(&Some("web".to_string()))
        );
    }

    #[test]
    fn service_route_without_trailing_slash() {
        let route = service_zone_route(&api("/shop", "/api"), &runtime(), GatewayProvider::Kong, &[]);
        assert_eq!(route.path, "/shop(.*)");
        assert_eq!(route.options.rewrite_path.as_deref(), Some("/rs1/api$1"));
    }

    #[test]
    fn url_routes_per_provider() {
        let mut url_api = api("/orders", "/v1");
        url_api.redirect_type = RedirectType::Url;

        let kong = url_zone_route(&url_api, GatewayProvider::Kong, &["a.com".into()]);
        assert_eq!(kong.path, "/orders.*");
        assert_eq!(kong.options.backend_protocol, Some(BackendProtocol::Https));
        assert_eq!(kong.options.annotations.get(REWRITE_HOST_KEY), Some(&None));

        let mesh = url_zone_route(&url_api, GatewayProvider::Mse, &["a.com".into()]);
        assert_eq!(mesh.path, "/orders");
        assert_eq!(mesh.options.annotations.get(REWRITE_HOST_KEY), Some(&Some("backend.local".to_string())));
        assert_eq!(mesh.options.annotations.get(REWRITE_PATH_KEY), Some(&Some("/v1".to_string())));
    }
}
