//! Per-cluster backend selection.

use crate::config::{ClusterConfig, GatewaySettings};
use crate::domain::GatewayProvider;
use crate::errors::{Result, RouteplaneError};
use crate::gateway::adapter::GatewayAdapter;
use crate::gateway::k8s::{IngressApplier, KubeIngressApplier};
use crate::gateway::kong::KongAdapter;
use crate::gateway::mesh::MeshAdapter;
use crate::gateway::unattached::UnattachedAdapter;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Resolves cluster metadata and the backends serving a cluster
#[async_trait]
pub trait GatewayResolver: Send + Sync + std::fmt::Debug {
    fn cluster(&self, name: &str) -> Result<ClusterConfig>;

    /// Adapter of the cluster's gateway provider; unattached when it has none
    async fn adapter(&self, cluster: &str) -> Result<Arc<dyn GatewayAdapter>>;

    /// Ingress applier, `None` for clusters that are not kubernetes-scheduled
    async fn ingress(&self, cluster: &str) -> Result<Option<Arc<dyn IngressApplier>>>;

    /// Availability zone (cluster) serving an (org, project, env) scope
    fn resolve_az(&self, org_id: &str, project_id: &str, env: &str) -> Result<String>;
}

/// Resolver backed by the `clusters` configuration section
#[derive(Debug)]
pub struct ConfiguredResolver {
    clusters: Vec<ClusterConfig>,
    gateway: GatewaySettings,
    adapters: DashMap<String, Arc<dyn GatewayAdapter>>,
    ingresses: DashMap<String, Arc<dyn IngressApplier>>,
}

impl ConfiguredResolver {
    pub fn new(clusters: Vec<ClusterConfig>, gateway: GatewaySettings) -> Self {
        Self { clusters, gateway, adapters: DashMap::new(), ingresses: DashMap::new() }
    }

    fn build_adapter(&self, name: &str) -> Result<Arc<dyn GatewayAdapter>> {
        let Some(cluster) = self.clusters.iter().find(|c| c.name == name) else {
            debug!(cluster = name, "Unknown cluster, using unattached adapter");
            return Ok(Arc::new(UnattachedAdapter::new(name)));
        };
        let adapter: Arc<dyn GatewayAdapter> = match (cluster.provider, &cluster.kong_admin_addr, &cluster.mesh_api_addr) {
            (GatewayProvider::Kong, Some(addr), _) => {
                Arc::new(KongAdapter::new(name, addr, self.gateway.http_timeout())?)
            }
            (GatewayProvider::Mse, _, Some(addr)) => Arc::new(MeshAdapter::new(
                name,
                addr,
                cluster.mesh_plugin_ids.clone(),
                self.gateway.http_timeout(),
            )?),
            _ => Arc::new(UnattachedAdapter::new(name)),
        };
        info!(cluster = name, provider = %adapter.provider(), "Gateway adapter created");
        Ok(adapter)
    }
}

#[async_trait]
impl GatewayResolver for ConfiguredResolver {
    fn cluster(&self, name: &str) -> Result<ClusterConfig> {
        self.clusters
            .iter()
            .find(|c| c.name == name)
            .cloned()
            .ok_or_else(|| RouteplaneError::not_found("cluster", name))
    }

    async fn adapter(&self, cluster: &str) -> Result<Arc<dyn GatewayAdapter>> {
        if let Some(adapter) = self.adapters.get(cluster) {
            return Ok(adapter.clone());
        }
        let adapter = self.build_adapter(cluster)?;
        Ok(self.adapters.entry(cluster.to_string()).or_insert(adapter).clone())
    }

    async fn ingress(&self, cluster: &str) -> Result<Option<Arc<dyn IngressApplier>>> {
        let config = self.cluster(cluster)?;
        if !config.cluster_type.supports_ingress() {
            return Ok(None);
        }
        if let Some(applier) = self.ingresses.get(cluster) {
            return Ok(Some(applier.clone()));
        }
        let applier: Arc<dyn IngressApplier> = Arc::new(
            KubeIngressApplier::connect(
                config.kubeconfig.as_deref(),
                self.gateway.ingress_field_manager.clone(),
            )
            .await?,
        );
        Ok(Some(self.ingresses.entry(cluster.to_string()).or_insert(applier).clone()))
    }

    fn resolve_az(&self, org_id: &str, project_id: &str, env: &str) -> Result<String> {
        self.clusters
            .iter()
            .flat_map(|cluster| cluster.az_bindings.iter())
            .find(|b| b.org_id == org_id && b.project_id == project_id && b.env.eq_ignore_ascii_case(env))
            .map(|b| b.az.clone())
            .ok_or_else(|| {
                RouteplaneError::not_found("az binding", format!("{}/{}/{}", org_id, project_id, env))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AzBinding;
    use crate::domain::ClusterType;
    use std::collections::BTreeMap;

    fn cluster(name: &str, provider: GatewayProvider, cluster_type: ClusterType) -> ClusterConfig {
        ClusterConfig {
            name: name.to_string(),
            cluster_type,
            provider,
            wildcard_domain: String::new(),
            kong_admin_addr: Some("http://kong-admin:8001".to_string()),
            gateway_namespace: "addons".to_string(),
            gateway_service: "kong".to_string(),
            mesh_api_addr: Some("http://mesh-api".to_string()),
            mesh_plugin_ids: BTreeMap::new(),
            kubeconfig: None,
            az_bindings: vec![AzBinding {
                org_id: "1".to_string(),
                project_id: "7".to_string(),
                env: "DEV".to_string(),
                az: name.to_string(),
            }],
        }
    }

    fn resolver() -> ConfiguredResolver {
        ConfiguredResolver::new(
            vec![
                cluster("kong-dev", GatewayProvider::Kong, ClusterType::K8s),
                cluster("mesh-dev", GatewayProvider::Mse, ClusterType::Dcos),
            ],
            GatewaySettings::default(),
        )
    }

    #[tokio::test]
    async fn adapters_follow_provider_and_are_cached() {
        let resolver = resolver();
        let kong = resolver.adapter("kong-dev").await.unwrap();
        assert_eq!(kong.provider(), GatewayProvider::Kong);
        assert!(Arc::ptr_eq(&kong, &resolver.adapter("kong-dev").await.unwrap()));

        assert_eq!(resolver.adapter("mesh-dev").await.unwrap().provider(), GatewayProvider::Mse);
        assert_eq!(resolver.adapter("nowhere").await.unwrap().provider(), GatewayProvider::None);
    }

    #[tokio::test]
    async fn non_kubernetes_clusters_have_no_ingress() {
        assert!(resolver().ingress("mesh-dev").await.unwrap().is_none());
        assert!(resolver().ingress("nowhere").await.is_err());
    }

    #[test]
    fn az_binding_lookup() {
        let resolver = resolver();
        assert_eq!(resolver.resolve_az("1", "7", "dev").unwrap(), "kong-dev");
        assert!(matches!(
            resolver.resolve_az("1", "8", "dev"),
            Err(RouteplaneError::NotFound { .. })
        ));
    }
}
