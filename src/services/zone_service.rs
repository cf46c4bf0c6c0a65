//! Zone lifecycle
//!
//! A zone is the single routing unit owned by a package, a package route or
//! a unity entry. On kubernetes-scheduled clusters a zone is rendered as an
//! ingress pointing at the gateway; everywhere else it only carries the
//! compiled plugin policy pushed through the cluster's domain policy plugin.

use chrono::Utc;
use serde_json::json;
use sqlx::types::Json;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::{ClusterConfig, GatewaySettings, PolicySettings};
use crate::domain::{
    GatewayProvider, Package, PackageApi, RedirectType, RuntimeService, Zone, ZoneId, ZonePolicy,
    ZonePolicyId, ZonePolicySet, ZoneType,
};
use crate::errors::{Result, RouteplaneError};
use crate::gateway::dto::PluginRequest;
use crate::gateway::{
    BackendProtocol, GatewayResolver, IngressApplier, IngressBackend, IngressRoute, IngressSpec,
    RouteOptions,
};
use crate::storage::{PackageApiFilter, PackageFilter, Session, ZoneFilter, ZonePolicyFilter};

/// Route rendered onto a zone's ingress
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ZoneRoute {
    pub hosts: Vec<String>,
    pub path: String,
    pub options: RouteOptions,
}

/// Everything needed to create a zone
#[derive(Debug, Clone, Default)]
pub struct ZoneConfig {
    pub name: String,
    pub zone_type: ZoneType,
    pub cluster_name: String,
    pub org_id: String,
    pub project_id: String,
    pub env: String,
    pub package_api_id: String,
    pub runtime_service_id: String,
    pub route: Option<ZoneRoute>,
    /// Ingress target on mesh clusters
    pub namespace: String,
    pub service_name: String,
}

/// Name of a zone; also used as its ingress name
pub fn zone_name(env: &str, project_id: &str, name: &str, id: &str) -> String {
    let suffix = if id.len() >= 6 {
        format!("{}{}", &id[..3], &id[id.len() - 3..])
    } else {
        id.to_string()
    };
    format!("zone-{}-{}-{}-{}", env, project_id, name, suffix)
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect()
}

/// Namespace mesh url routes fall back to
fn project_namespace(project_id: &str, env: &str) -> String {
    format!("project-{}-{}", project_id, env.to_lowercase())
}

/// Creates, re-routes and deletes zones and pushes their policies
#[derive(Debug, Clone)]
pub struct ZoneService {
    resolver: Arc<dyn GatewayResolver>,
    gateway: GatewaySettings,
    policy: PolicySettings,
}

impl ZoneService {
    pub fn new(resolver: Arc<dyn GatewayResolver>, gateway: GatewaySettings, policy: PolicySettings) -> Self {
        Self { resolver, gateway, policy }
    }

    fn cluster_routes_through_ingress(&self, cluster: &ClusterConfig) -> bool {
        cluster.cluster_type.supports_ingress()
            && !self.gateway.use_admin_endpoint
            && cluster.provider != GatewayProvider::None
    }

    /// Whether zones of the cluster are rendered as ingresses
    pub fn ingress_enabled(&self, cluster_name: &str) -> bool {
        self.resolver
            .cluster(cluster_name)
            .map(|c| self.cluster_routes_through_ingress(&c))
            .unwrap_or(false)
    }

    pub async fn get_zone(&self, session: &mut Session, zone_id: &ZoneId) -> Result<Option<Zone>> {
        session.get::<Zone>(zone_id).await
    }

    /// Store a zone row without touching any backend
    #[instrument(skip(self, session, config), fields(name = %config.name, cluster = %config.cluster_name), name = "zone_create_row")]
    pub async fn create_zone_without_ingress(&self, session: &mut Session, config: &ZoneConfig) -> Result<Zone> {
        let id = Uuid::new_v4().simple().to_string();
        let zone = Zone {
            name: zone_name(&config.env, &config.project_id, &config.name, &id),
            id: ZoneId::from_string(id),
            zone_type: config.zone_type,
            cluster_name: config.cluster_name.clone(),
            org_id: config.org_id.clone(),
            project_id: config.project_id.clone(),
            env: config.env.clone(),
            package_api_id: config.package_api_id.clone(),
            runtime_service_id: config.runtime_service_id.clone(),
            has_ingress: false,
            ingress_namespace: String::new(),
            policies: Json(None),
            created_at: Utc::now(),
        };
        session.insert(&zone).await?;
        info!(zone_id = %zone.id, zone_name = %zone.name, zone_type = %zone.zone_type, "Zone created");
        Ok(zone)
    }

    /// Store a zone and render its ingress when the cluster routes through one.
    ///
    /// A failed ingress apply is cleaned up and fails the call.
    #[instrument(skip(self, session, config), fields(name = %config.name, cluster = %config.cluster_name), name = "zone_create")]
    pub async fn create_zone(&self, session: &mut Session, config: &ZoneConfig) -> Result<Zone> {
        let mut zone = self.create_zone_without_ingress(session, config).await?;
        let Some(route) = &config.route else {
            return Ok(zone);
        };
        let cluster = self.resolver.cluster(&config.cluster_name)?;
        if !self.cluster_routes_through_ingress(&cluster) {
            return Ok(zone);
        }
        let (namespace, service) = match cluster.provider {
            GatewayProvider::Mse => {
                if matches!(config.zone_type, ZoneType::PackageNew | ZoneType::Unity) {
                    return Ok(zone);
                }
                (config.namespace.clone(), config.service_name.clone())
            }
            _ => (cluster.gateway_namespace.clone(), cluster.gateway_service.clone()),
        };
        if namespace.is_empty() || service.is_empty() {
            return Err(RouteplaneError::validation(format!(
                "cannot resolve ingress target of zone {}: namespace '{}', service '{}'",
                zone.name, namespace, service
            )));
        }
        let Some(applier) = self.resolver.ingress(&cluster.name).await? else {
            return Ok(zone);
        };

        if let Err(e) = self.apply_ingress(applier.as_ref(), &cluster, &namespace, &service, &zone.name, route).await {
            tracing::error!(error = %e, zone = %zone.name, "Failed to apply zone ingress");
            if let Err(clear_err) = applier.delete_ingress(&namespace, &zone.name.to_lowercase()).await {
                warn!(error = %clear_err, zone = %zone.name, "Failed to clear partially applied ingress");
            }
            return Err(e);
        }

        zone.has_ingress = true;
        zone.ingress_namespace = namespace;
        session.update(&zone).await?;
        Ok(zone)
    }

    async fn apply_ingress(
        &self,
        applier: &dyn IngressApplier,
        cluster: &ClusterConfig,
        namespace: &str,
        service: &str,
        zone_name: &str,
        route: &ZoneRoute,
    ) -> Result<bool> {
        let mut options = route.options.clone();
        options.enable_tls = true;

        let service_port = match cluster.provider {
            GatewayProvider::Mse => applier
                .service_port(namespace, service)
                .await?
                .unwrap_or(self.gateway.mesh_default_service_port),
            _ => {
                if options.backend_protocol == Some(BackendProtocol::Https) {
                    if applier.is_gateway_support_https(namespace, service).await? {
                        self.gateway.kong_https_service_port
                    } else {
                        options.backend_protocol = None;
                        self.gateway.kong_service_port
                    }
                } else {
                    self.gateway.kong_service_port
                }
            }
        };

        let spec = IngressSpec {
            namespace: namespace.to_string(),
            name: zone_name.to_string(),
            routes: route
                .hosts
                .iter()
                .map(|host| IngressRoute { domain: host.clone(), path: route.path.clone() })
                .collect(),
            backend: IngressBackend { service_name: service.to_string(), service_port },
            options,
        };
        applier.create_or_update_ingress(&spec).await
    }

    /// Re-render a zone's ingress, returning whether it already existed
    #[instrument(skip(self, session, route, runtime), fields(zone_id = %zone_id), name = "zone_update_route")]
    pub async fn update_zone_route(
        &self,
        session: &mut Session,
        zone_id: &ZoneId,
        route: &ZoneRoute,
        runtime: Option<&RuntimeService>,
        redirect_type: RedirectType,
    ) -> Result<bool> {
        let mut zone = session.must_get::<Zone>(zone_id).await?;
        let cluster = self.resolver.cluster(&zone.cluster_name)?;
        if !self.cluster_routes_through_ingress(&cluster) {
            return Err(RouteplaneError::validation(format!(
                "cluster {} of type {} does not support route config",
                cluster.name, cluster.cluster_type
            )));
        }

        let (namespace, service) = match cluster.provider {
            GatewayProvider::Mse => {
                let (mut namespace, mut service) = runtime
                    .map(|rs| (rs.group_namespace.clone(), format!("{}-{}", rs.service_name, rs.group_name)))
                    .unwrap_or_default();
                if (namespace.is_empty() || service.is_empty()) && redirect_type == RedirectType::Url {
                    namespace = project_namespace(&zone.project_id, &zone.env);
                    service = zone.name.to_lowercase();
                }
                (namespace, service)
            }
            _ => (cluster.gateway_namespace.clone(), cluster.gateway_service.clone()),
        };
        if namespace.is_empty() || service.is_empty() {
            return Err(RouteplaneError::validation(format!(
                "cannot resolve ingress target of zone {}",
                zone.name
            )));
        }

        let applier = self
            .resolver
            .ingress(&cluster.name)
            .await?
            .ok_or_else(|| RouteplaneError::internal(format!("no ingress applier for cluster {}", cluster.name)))?;
        let existed = self.apply_ingress(applier.as_ref(), &cluster, &namespace, &service, &zone.name, route).await?;

        if !zone.has_ingress || zone.ingress_namespace != namespace {
            zone.has_ingress = true;
            zone.ingress_namespace = namespace;
            session.update(&zone).await?;
        }
        debug!(zone = %zone.name, existed, "Zone route applied");
        Ok(existed)
    }

    /// Remove a zone's ingress, if it has one
    pub async fn delete_zone_route(&self, zone: &Zone) -> Result<()> {
        if !zone.has_ingress {
            return Ok(());
        }
        let cluster = self.resolver.cluster(&zone.cluster_name)?;
        let namespace = match cluster.provider {
            GatewayProvider::Mse if zone.ingress_namespace.is_empty() => {
                project_namespace(&zone.project_id, &zone.env)
            }
            GatewayProvider::Mse => zone.ingress_namespace.clone(),
            _ => cluster.gateway_namespace.clone(),
        };
        let Some(applier) = self.resolver.ingress(&cluster.name).await? else {
            return Ok(());
        };
        applier.delete_ingress(&namespace, &zone.name.to_lowercase()).await
    }

    /// Store a zone's compiled policy; the backend is not touched.
    pub async fn set_zone_kong_policies_without_domain_policy(
        &self,
        session: &mut Session,
        zone_id: &ZoneId,
        policies: Option<ZonePolicySet>,
    ) -> Result<()> {
        let mut zone = session.must_get::<Zone>(zone_id).await?;
        zone.policies = Json(policies);
        session.update(&zone).await
    }

    /// Push the policy table of every zone in the cluster as one plugin.
    ///
    /// Entries are ordered by priority, highest first. Mesh clusters keep
    /// plugin state per instance and need no table.
    #[instrument(skip(self, session), name = "zone_update_domain_policy")]
    pub async fn update_domain_policy(
        &self,
        session: &mut Session,
        cluster_name: &str,
        project_id: &str,
        env: &str,
    ) -> Result<()> {
        let adapter = self.resolver.adapter(cluster_name).await?;
        if adapter.provider() != GatewayProvider::Kong {
            debug!(cluster = cluster_name, provider = %adapter.provider(), "Domain policy not used by provider");
            return Ok(());
        }

        let zones = session
            .select::<Zone>(&ZoneFilter { cluster_name: Some(cluster_name.to_string()), ..Default::default() })
            .await?;
        let mut entries = Vec::new();
        for zone in zones {
            let Some(mut policies) = zone.policies.0.clone() else {
                continue;
            };
            if policies.package_name.is_empty() {
                if let Some(package) = self.owning_package(session, &zone).await? {
                    policies.package_name = package.name;
                }
            }
            entries.push((zone.id.to_string(), policies, zone.project_id, zone.env.to_lowercase()));
        }
        entries.sort_by(|a, b| b.1.priority.cmp(&a.1.priority));

        let mut config = json!({
            "regexs": [], "ids": [], "enables": [], "disables": [],
            "allows": [], "packs": [], "dpids": [], "denvs": [],
        });
        for (id, policies, dpid, denv) in &entries {
            for (key, value) in [
                ("regexs", policies.regex.as_str()),
                ("ids", id.as_str()),
                ("enables", policies.enables.as_str()),
                ("disables", policies.disables.as_str()),
                ("allows", "1"),
                ("packs", policies.package_name.as_str()),
                ("dpids", dpid.as_str()),
                ("denvs", denv.as_str()),
            ] {
                if let Some(list) = config[key].as_array_mut() {
                    list.push(json!(value));
                }
            }
        }

        adapter
            .create_or_update_plugin(&PluginRequest::new(self.policy.domain_policy_plugin.clone(), config))
            .await?;
        info!(cluster = cluster_name, zones = entries.len(), "Domain policy pushed");
        Ok(())
    }

    async fn owning_package(&self, session: &mut Session, zone: &Zone) -> Result<Option<Package>> {
        match zone.zone_type {
            ZoneType::PackageApi => {
                let api = session
                    .get_by::<PackageApi>(&PackageApiFilter {
                        zone_id: Some(zone.id.to_string()),
                        ..Default::default()
                    })
                    .await?;
                match api {
                    Some(api) => session.get::<Package>(&api.package_id).await,
                    None => Ok(None),
                }
            }
            _ => {
                session
                    .get_by::<Package>(&PackageFilter { zone_id: Some(zone.id.clone()), ..Default::default() })
                    .await
            }
        }
    }

    /// Attach a zone-wide plugin instance, replacing one with the same name
    pub async fn set_zone_policy(
        &self,
        session: &mut Session,
        zone_id: &ZoneId,
        plugin_name: &str,
        plugin_id: &str,
        enabled: bool,
    ) -> Result<ZonePolicy> {
        let filter = ZonePolicyFilter {
            zone_id: Some(zone_id.clone()),
            plugin_name: Some(plugin_name.to_string()),
            ..Default::default()
        };
        let policy = match session.get_by::<ZonePolicy>(&filter).await? {
            Some(mut existing) => {
                existing.plugin_id = plugin_id.to_string();
                existing.enabled = enabled;
                session.update(&existing).await?;
                existing
            }
            None => {
                let policy = ZonePolicy {
                    id: ZonePolicyId::new(),
                    zone_id: zone_id.clone(),
                    plugin_name: plugin_name.to_string(),
                    plugin_id: plugin_id.to_string(),
                    enabled,
                    created_at: Utc::now(),
                };
                session.insert(&policy).await?;
                policy
            }
        };
        Ok(policy)
    }

    /// Detach a zone-wide plugin, returning the removed row
    pub async fn clear_zone_policy(
        &self,
        session: &mut Session,
        zone_id: &ZoneId,
        plugin_name: &str,
    ) -> Result<Option<ZonePolicy>> {
        let filter = ZonePolicyFilter {
            zone_id: Some(zone_id.clone()),
            plugin_name: Some(plugin_name.to_string()),
            ..Default::default()
        };
        let existing = session.get_by::<ZonePolicy>(&filter).await?;
        if let Some(policy) = &existing {
            session.delete_by_id::<ZonePolicy>(&policy.id).await?;
        }
        Ok(existing)
    }

    /// Delete a zone. The backend object goes first; if that fails the row
    /// stays so the live object is never orphaned.
    #[instrument(skip(self, session), fields(zone_id = %zone_id), name = "zone_delete")]
    pub async fn delete_zone(&self, session: &mut Session, zone_id: &ZoneId) -> Result<()> {
        let Some(zone) = session.get::<Zone>(zone_id).await? else {
            return Ok(());
        };
        self.delete_zone_route(&zone).await?;
        session
            .delete::<ZonePolicy>(&ZonePolicyFilter { zone_id: Some(zone.id.clone()), ..Default::default() })
            .await?;
        session.delete_by_id::<Zone>(&zone.id).await?;
        info!(zone_id = %zone.id, zone_name = %zone.name, "Zone deleted");

        if zone.policies.0.is_some() {
            self.update_domain_policy(session, &zone.cluster_name, &zone.project_id, &zone.env).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zone_name_is_lowercase_and_dns_safe() {
        let name = zone_name("DEV", "12", "shop_api/v1", "0123456789abcdef");
        assert_eq!(name, "zone-dev-12-shop-api-v1-012def");
    }

    #[test]
    fn short_ids_are_kept_whole() {
        assert_eq!(zone_name("dev", "1", "a", "abc"), "zone-dev-1-a-abc");
    }

    #[test]
    fn mesh_fallback_namespace() {
        assert_eq!(project_namespace("7", "TEST"), "project-7-test");
    }
}
