//! Package (endpoint) manager
//!
//! Open-api and web-api packages get a zone of their own, their domains and
//! synthesized auth/acl rules. Hub and unity packages are shared entries
//! keyed by their domain set: creating one twice returns the first.

use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use validator::Validate;

use crate::domain::{
    AclType, AuthType, CreatePackageRequest, GatewayProvider, HubInfo, HubInfoId, HubPackageRequest, Package,
    PackageApi, PackageApiRequest, PackageId, PackageRule, RedirectType, RuleCategory, Scene, Scope, UnityPackageRequest,
    UpdatePackageRequest, Zone, ZoneType,
};
use crate::errors::{Result, RouteplaneError};
use crate::gateway::{BackendProtocol, GatewayResolver, RouteOptions};
use crate::services::domain_registry::{normalize_domains, DomainRegistry};
use crate::services::package_api_service::PackageApiService;
use crate::services::rule_compiler::{acl_rule, auth_rule, RuleCompiler};
use crate::services::zone_service::{ZoneConfig, ZoneRoute, ZoneService};
use crate::storage::{HubInfoFilter, PackageApiFilter, PackageFilter, Session, Store};

/// A package with its bound domains
#[derive(Debug, Clone, PartialEq)]
pub struct PackageInfo {
    pub package: Package,
    pub domains: Vec<String>,
}

/// Ingress target of a package zone on mesh clusters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ZoneTarget {
    pub namespace: String,
    pub service_name: String,
}

fn shared_entry_error(package: &Package) -> RouteplaneError {
    RouteplaneError::validation(format!(
        "endpoint {} is a {} entry and cannot be changed",
        package.name, package.scene
    ))
}

fn default_path(path: &str) -> String {
    path.trim().trim_end_matches('/').to_string()
}

/// CRUD of packages and their scene-specific entries
#[derive(Debug, Clone)]
pub struct PackageService {
    store: Store,
    resolver: Arc<dyn GatewayResolver>,
    domains: DomainRegistry,
    zones: ZoneService,
    rules: RuleCompiler,
    apis: PackageApiService,
}

impl PackageService {
    pub fn new(
        store: Store,
        resolver: Arc<dyn GatewayResolver>,
        domains: DomainRegistry,
        zones: ZoneService,
        rules: RuleCompiler,
        apis: PackageApiService,
    ) -> Self {
        Self { store, resolver, domains, zones, rules, apis }
    }

    pub async fn get_package(&self, package_id: &PackageId) -> Result<PackageInfo> {
        let mut session = self.store.begin().await?;
        let package = session.must_get::<Package>(package_id).await?;
        let domains = self.domains.get_package_domains(&mut session, &package.id).await?;
        Ok(PackageInfo { package, domains })
    }

    /// Packages of a project environment, ordered by name
    pub async fn list_packages(&self, project_id: &str, env: &str) -> Result<Vec<PackageInfo>> {
        let mut session = self.store.begin().await?;
        let mut packages = session
            .select::<Package>(&PackageFilter {
                project_id: Some(project_id.to_string()),
                env: Some(env.to_string()),
                ..Default::default()
            })
            .await?;
        packages.sort_by(|a, b| a.name.cmp(&b.name));
        let mut infos = Vec::with_capacity(packages.len());
        for package in packages {
            let domains = self.domains.get_package_domains(&mut session, &package.id).await?;
            infos.push(PackageInfo { package, domains });
        }
        Ok(infos)
    }

    pub async fn create_package(&self, req: CreatePackageRequest) -> Result<PackageInfo> {
        let mut session = self.store.begin().await?;
        let info = self.create_package_in(&mut session, req, &ZoneTarget::default()).await?;
        session.commit().await?;
        Ok(info)
    }

    pub async fn update_package(&self, package_id: &PackageId, req: UpdatePackageRequest) -> Result<PackageInfo> {
        let mut session = self.store.begin().await?;
        let info = self.update_package_in(&mut session, package_id, req).await?;
        session.commit().await?;
        Ok(info)
    }

    pub async fn delete_package(&self, package_id: &PackageId) -> Result<()> {
        let mut session = self.store.begin().await?;
        self.delete_package_in(&mut session, package_id).await?;
        session.commit().await
    }

    pub async fn create_or_get_hub_package(&self, req: HubPackageRequest) -> Result<PackageInfo> {
        let mut session = self.store.begin().await?;
        let info = self.create_or_get_hub_package_in(&mut session, req).await?;
        session.commit().await?;
        Ok(info)
    }

    pub async fn create_unity_package(&self, req: UnityPackageRequest) -> Result<PackageInfo> {
        let mut session = self.store.begin().await?;
        let info = self.create_unity_package_in(&mut session, req).await?;
        session.commit().await?;
        Ok(info)
    }

    /// Recompile the policies of every package in a cluster scope and push
    /// them. Returns the number of packages compiled.
    #[instrument(skip(self), name = "package_flush_policies")]
    pub async fn flush_policies(&self, cluster_name: &str, project_id: &str, env: &str) -> Result<usize> {
        let mut session = self.store.begin().await?;
        let packages = session
            .select::<Package>(&PackageFilter {
                cluster_name: Some(cluster_name.to_string()),
                project_id: Some(project_id.to_string()),
                env: Some(env.to_string()),
                ..Default::default()
            })
            .await?;
        for package in &packages {
            self.rules.set_package_policies(&mut session, package).await?;
        }
        session.commit().await?;
        info!(packages = packages.len(), "Package policies flushed");
        Ok(packages.len())
    }

    async fn check_name_unique(&self, session: &mut Session, scope: &Scope, name: &str) -> Result<()> {
        let existing = session
            .get_by::<Package>(&PackageFilter {
                name: Some(name.to_string()),
                project_id: Some(scope.project_id.clone()),
                env: Some(scope.env.clone()),
                ..Default::default()
            })
            .await?;
        if existing.is_some() {
            return Err(RouteplaneError::conflict(format!("endpoint {} already exists", name), "package"));
        }
        Ok(())
    }

    /// Create an open-api or web-api package
    #[instrument(skip(self, session, req, target), fields(name = %req.name, scene = %req.scene), name = "package_create")]
    pub async fn create_package_in(
        &self,
        session: &mut Session,
        req: CreatePackageRequest,
        target: &ZoneTarget,
    ) -> Result<PackageInfo> {
        req.validate()?;
        match req.scene {
            Scene::Hub => {
                return self
                    .create_or_get_hub_package_in(
                        session,
                        HubPackageRequest { scope: req.scope, domains: req.bind_domain, default_path: String::new() },
                    )
                    .await
            }
            Scene::Unity => {
                return Err(RouteplaneError::validation_field(
                    "unity entries are created from their outer and inner hosts",
                    "scene",
                ))
            }
            Scene::OpenApi | Scene::WebApi => {}
        }
        req.check_scene().map_err(RouteplaneError::validation)?;

        let name = req.name.trim().to_string();
        let domains = normalize_domains(&req.bind_domain);
        self.check_name_unique(session, &req.scope, &name).await?;

        let zone = self
            .zones
            .create_zone(
                session,
                &ZoneConfig {
                    name: format!("package-{}", name),
                    zone_type: ZoneType::PackageNew,
                    cluster_name: req.scope.cluster_name.clone(),
                    org_id: req.scope.org_id.clone(),
                    project_id: req.scope.project_id.clone(),
                    env: req.scope.env.clone(),
                    runtime_service_id: req.runtime_service_id.clone(),
                    namespace: target.namespace.clone(),
                    service_name: target.service_name.clone(),
                    ..Default::default()
                },
            )
            .await?;

        let package = Package {
            id: PackageId::new(),
            name,
            description: req.description.clone(),
            scene: req.scene,
            auth_type: req.auth_type,
            acl_type: req.acl_type,
            zone_id: zone.id.clone(),
            cluster_name: req.scope.cluster_name.clone(),
            org_id: req.scope.org_id.clone(),
            project_id: req.scope.project_id.clone(),
            env: req.scope.env.clone(),
            runtime_service_id: req.runtime_service_id.clone(),
            created_at: Utc::now(),
        };
        session.insert(&package).await?;
        let domains = self.domains.touch_package_domain(session, &package, &domains).await?;

        if package.scene.synthesizes_rules() {
            let auth = self.synthesize_auth_rule(session, &package).await?;
            if let Err(e) = self.synthesize_acl_rule(session, &package).await {
                if let Some(rule) = auth.filter(|r| !r.plugin_id.is_empty()) {
                    self.drop_plugin(&package, &rule.plugin_id).await;
                }
                return Err(e);
            }
            self.rules.set_package_policies(session, &package).await?;
        }
        info!(package_id = %package.id, name = %package.name, domains = ?domains, "Endpoint created");
        Ok(PackageInfo { package, domains })
    }

    async fn synthesize_auth_rule(&self, session: &mut Session, package: &Package) -> Result<Option<PackageRule>> {
        if package.auth_type == AuthType::None {
            return Ok(None);
        }
        let adapter = self.resolver.adapter(&package.cluster_name).await?;
        let spec = auth_rule(adapter.as_ref(), package.auth_type, &[]).await?;
        Ok(Some(self.rules.create_rule(session, package, spec).await?))
    }

    /// Best-effort removal of a plugin whose rule row will not be kept
    async fn drop_plugin(&self, package: &Package, plugin_id: &str) {
        let removed = match self.resolver.adapter(&package.cluster_name).await {
            Ok(adapter) => adapter.remove_plugin(plugin_id).await,
            Err(e) => Err(e),
        };
        if let Err(e) = removed {
            warn!(error = %e, plugin_id, "Failed to remove auth plugin after package creation failure");
        }
    }

    /// The mesh gateway enforces consumers through the auth plugin alone
    async fn synthesize_acl_rule(&self, session: &mut Session, package: &Package) -> Result<()> {
        if package.acl_type == AclType::Inherit {
            return Ok(());
        }
        let adapter = self.resolver.adapter(&package.cluster_name).await?;
        if adapter.provider() == GatewayProvider::Mse {
            return Ok(());
        }
        let spec = acl_rule(adapter.provider(), package.acl_type, &[])?;
        self.rules.create_rule(session, package, spec).await?;
        Ok(())
    }

    async fn delete_package_rules(&self, session: &mut Session, package: &Package, category: RuleCategory) -> Result<()> {
        for rule in self.rules.get_package_rules(session, package, Some(category)).await? {
            self.rules.delete_rule(session, &rule.id).await?;
        }
        Ok(())
    }

    /// Change a package's domains, auth or acl and recompile its policies
    #[instrument(skip(self, session, req), fields(package_id = %package_id), name = "package_update")]
    pub async fn update_package_in(
        &self,
        session: &mut Session,
        package_id: &PackageId,
        req: UpdatePackageRequest,
    ) -> Result<PackageInfo> {
        req.validate()?;
        let mut package = session.must_get::<Package>(package_id).await?;
        if package.scene.is_shared_entry() {
            return Err(shared_entry_error(&package));
        }
        if req.auth_type == Some(AuthType::AliyunApp) && !req.aliyun_bind {
            return Err(RouteplaneError::validation_field(
                "aliyun-app auth requires the cloud api binding flag",
                "auth_type",
            ));
        }
        let new_domains = req.bind_domain.as_deref().map(normalize_domains);
        if new_domains.as_ref().is_some_and(|d| d.is_empty()) {
            return Err(RouteplaneError::validation_field("bind domain is required", "bind_domain"));
        }

        let mut changed = false;
        if let Some(domains) = new_domains {
            if self.domains.is_package_domains_diff(session, &package.id, &domains).await? {
                let domains = self.domains.touch_package_domain(session, &package, &domains).await?;
                self.apis.update_package_api_hosts(session, &package, &domains).await?;
                changed = true;
            }
        }
        if let Some(auth_type) = req.auth_type.filter(|a| *a != package.auth_type) {
            self.delete_package_rules(session, &package, RuleCategory::Auth).await?;
            package.auth_type = auth_type;
            if package.scene.synthesizes_rules() {
                self.synthesize_auth_rule(session, &package).await?;
            }
            changed = true;
        }
        if let Some(acl_type) = req.acl_type.filter(|a| *a != package.acl_type) {
            self.delete_package_rules(session, &package, RuleCategory::Acl).await?;
            package.acl_type = acl_type;
            if package.scene.synthesizes_rules() {
                self.synthesize_acl_rule(session, &package).await?;
            }
            changed = true;
        }
        if let Some(description) = req.description {
            package.description = description;
        }
        session.update(&package).await?;
        if changed {
            self.rules.set_package_policies(session, &package).await?;
        }
        let domains = self.domains.get_package_domains(session, &package.id).await?;
        info!(package_id = %package.id, changed, "Endpoint updated");
        Ok(PackageInfo { package, domains })
    }

    /// Delete a package with its routes, rules, zone and domains
    #[instrument(skip(self, session), fields(package_id = %package_id), name = "package_delete")]
    pub async fn delete_package_in(&self, session: &mut Session, package_id: &PackageId) -> Result<()> {
        let Some(package) = session.get::<Package>(package_id).await? else {
            return Ok(());
        };
        if package.scene.is_shared_entry() {
            return Err(shared_entry_error(&package));
        }
        for api in self.apis.list_package_apis_in(session, &package.id).await? {
            self.apis.delete_package_api_in(session, &package.id, &api.id).await?;
        }
        self.rules.delete_by_package(session, &package).await?;
        self.zones.delete_zone(session, &package.zone_id).await?;
        self.domains.touch_package_domain(session, &package, &[]).await?;
        session.delete_by_id::<Package>(&package.id).await?;
        info!(package_id = %package.id, name = %package.name, "Endpoint deleted");
        Ok(())
    }

    /// Hub entry of a domain set, created on first request.
    ///
    /// The same set always maps to the same package; a set overlapping
    /// another hub's set is refused.
    #[instrument(skip(self, session, req), fields(cluster = %req.scope.cluster_name), name = "package_hub")]
    pub async fn create_or_get_hub_package_in(
        &self,
        session: &mut Session,
        req: HubPackageRequest,
    ) -> Result<PackageInfo> {
        req.validate()?;
        let domains = normalize_domains(&req.domains);
        if domains.is_empty() {
            return Err(RouteplaneError::validation_field("at least one domain is required", "domains"));
        }
        let wanted: BTreeSet<&String> = domains.iter().collect();

        let hubs = session
            .select::<HubInfo>(&HubInfoFilter {
                org_id: Some(req.scope.org_id.clone()),
                env: Some(req.scope.env.clone()),
                az: Some(req.scope.cluster_name.clone()),
                ..Default::default()
            })
            .await?;
        for hub in &hubs {
            let existing = hub.domain_list();
            let existing: BTreeSet<&String> = existing.iter().collect();
            if existing == wanted {
                let package = session.must_get::<Package>(&hub.package_id).await?;
                info!(package_id = %package.id, "Hub entry already exists for domain set");
                return Ok(PackageInfo { package, domains });
            }
            if let Some(shared) = existing.intersection(&wanted).next() {
                return Err(RouteplaneError::conflict(
                    format!("domain {} already belongs to hub entry {}", shared, hub.domains),
                    "hub",
                ));
            }
        }

        let hub_count = session
            .select::<Package>(&PackageFilter {
                project_id: Some(req.scope.project_id.clone()),
                env: Some(req.scope.env.clone()),
                scene: Some(Scene::Hub),
                ..Default::default()
            })
            .await?
            .len();
        let route = ZoneRoute {
            hosts: domains.clone(),
            path: format!("{}/*", default_path(&req.default_path)),
            options: RouteOptions {
                rewrite_host: domains.first().cloned(),
                use_regex: true,
                backend_protocol: Some(BackendProtocol::Https),
                ..Default::default()
            },
        };
        let package = self
            .create_shared_entry(session, &req.scope, Scene::Hub, format!("hub-{}", hub_count), "hub", route, &domains)
            .await?;

        let hub = HubInfo {
            id: HubInfoId::new(),
            org_id: req.scope.org_id.clone(),
            env: req.scope.env.clone(),
            az: req.scope.cluster_name.clone(),
            domains: domains.join(","),
            package_id: package.id.clone(),
            created_at: Utc::now(),
        };
        session.insert(&hub).await?;
        info!(package_id = %package.id, domains = %hub.domains, "Hub entry created");
        Ok(PackageInfo { package, domains })
    }

    /// Unity entry of a project environment
    #[instrument(skip(self, session, req), fields(project = %req.scope.project_id), name = "package_unity")]
    pub async fn create_unity_package_in(
        &self,
        session: &mut Session,
        req: UnityPackageRequest,
    ) -> Result<PackageInfo> {
        req.validate()?;
        let domains = normalize_domains([&req.outer_host, &req.inner_host]);
        let existing = session
            .get_by::<Package>(&PackageFilter {
                project_id: Some(req.scope.project_id.clone()),
                env: Some(req.scope.env.clone()),
                cluster_name: Some(req.scope.cluster_name.clone()),
                scene: Some(Scene::Unity),
                ..Default::default()
            })
            .await?;
        if let Some(package) = existing {
            let bound = self.domains.get_package_domains(session, &package.id).await?;
            if normalize_domains(&bound) == domains {
                return Ok(PackageInfo { package, domains });
            }
            return Err(RouteplaneError::conflict(
                format!("unity entry of project {} is bound to {}", req.scope.project_id, bound.join(",")),
                "package",
            ));
        }

        let route = ZoneRoute {
            hosts: vec![req.outer_host.trim().to_string(), req.inner_host.trim().to_string()],
            path: format!("{}/.*", default_path(&req.default_path)),
            options: RouteOptions {
                rewrite_host: Some(req.inner_host.trim().to_string()),
                use_regex: true,
                backend_protocol: Some(BackendProtocol::Https),
                ..Default::default()
            },
        };
        let package = self
            .create_shared_entry(session, &req.scope, Scene::Unity, "unity".to_string(), "unity", route, &domains)
            .await?;
        info!(package_id = %package.id, "Unity entry created");
        Ok(PackageInfo { package, domains })
    }

    /// Zone, row and domains of a shared entry. A failure after the zone's
    /// ingress was applied removes the ingress again.
    #[allow(clippy::too_many_arguments)]
    async fn create_shared_entry(
        &self,
        session: &mut Session,
        scope: &Scope,
        scene: Scene,
        name: String,
        zone_name: &str,
        route: ZoneRoute,
        domains: &[String],
    ) -> Result<Package> {
        self.check_name_unique(session, scope, &name).await?;
        let zone = self
            .zones
            .create_zone(
                session,
                &ZoneConfig {
                    name: zone_name.to_string(),
                    zone_type: ZoneType::Unity,
                    cluster_name: scope.cluster_name.clone(),
                    org_id: scope.org_id.clone(),
                    project_id: scope.project_id.clone(),
                    env: scope.env.clone(),
                    route: Some(route),
                    ..Default::default()
                },
            )
            .await?;

        let package = Package {
            id: PackageId::new(),
            name,
            description: String::new(),
            scene,
            auth_type: AuthType::None,
            acl_type: AclType::Inherit,
            zone_id: zone.id.clone(),
            cluster_name: scope.cluster_name.clone(),
            org_id: scope.org_id.clone(),
            project_id: scope.project_id.clone(),
            env: scope.env.clone(),
            runtime_service_id: String::new(),
            created_at: Utc::now(),
        };
        let stored = async {
            session.insert(&package).await?;
            self.domains.touch_package_domain(session, &package, domains).await
        }
        .await;
        if let Err(e) = stored {
            tracing::error!(error = %e, package = %package.name, "Failed to store shared entry, clearing its route");
            self.clear_zone_route(&zone).await;
            return Err(e);
        }
        Ok(package)
    }

    async fn clear_zone_route(&self, zone: &Zone) {
        if let Err(e) = self.zones.delete_zone_route(zone).await {
            warn!(error = %e, zone = %zone.name, "Failed to clear zone route");
        }
    }

    /// Point a package's `/` route at an address
    #[instrument(skip(self), name = "package_root_api")]
    pub async fn touch_package_root_api(
        &self,
        package_id: &PackageId,
        redirect_addr: &str,
        redirect_path: &str,
    ) -> Result<PackageApi> {
        let redirect_addr = if redirect_addr.starts_with("http://") || redirect_addr.starts_with("https://") {
            redirect_addr.to_string()
        } else {
            format!("http://{}", redirect_addr)
        };
        let req = PackageApiRequest {
            api_path: "/".to_string(),
            redirect_type: RedirectType::Url,
            redirect_addr,
            redirect_path: redirect_path.to_string(),
            ..Default::default()
        };

        let mut session = self.store.begin().await?;
        let root = session
            .get_by::<PackageApi>(&PackageApiFilter {
                package_id: Some(package_id.clone()),
                api_path: Some("/".to_string()),
                ..Default::default()
            })
            .await?;
        let api = match root {
            Some(root) => self.apis.update_package_api_in(&mut session, package_id, &root.id, req).await?,
            None => self.apis.create_package_api_in(&mut session, package_id, req).await?,
        };
        session.commit().await?;
        Ok(api)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_path_is_trimmed() {
        assert_eq!(default_path(" /shop/ "), "/shop");
        assert_eq!(default_path(""), "");
        assert_eq!(format!("{}/*", default_path("/")), "/*");
    }
}
