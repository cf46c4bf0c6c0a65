//! # Mesh Gateway Adapter
//!
//! The mesh gateway routes through Kubernetes ingresses, so services,
//! routes, consumers and upstream objects only exist locally: they get
//! synthesized ids and deletes are no-ops. Plugins are switched on through
//! the mesh plugin API.

use crate::domain::GatewayProvider;
use crate::errors::{Result, RouteplaneError};
use crate::gateway::adapter::GatewayAdapter;
use crate::gateway::dto::*;
use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Reported in place of a backend version
pub const MESH_GATEWAY_VERSION: &str = "mse-gateway";

const DEFAULT_SERVICE_PORT: u16 = 80;

#[derive(Debug, Clone)]
pub struct MeshAdapter {
    cluster: String,
    api_addr: String,
    plugin_ids: BTreeMap<String, String>,
    client: Client,
    /// plugin name -> consumer credential entries pushed with its config
    credentials: std::sync::Arc<DashMap<String, Vec<(String, Credential)>>>,
}

fn local_id() -> String {
    Uuid::new_v4().to_string()
}

impl MeshAdapter {
    pub fn new(
        cluster: impl Into<String>,
        api_addr: impl Into<String>,
        plugin_ids: BTreeMap<String, String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build().map_err(|e| {
            RouteplaneError::internal(format!("Failed to create HTTP client: {}", e))
        })?;
        let api_addr: String = api_addr.into();
        Ok(Self {
            cluster: cluster.into(),
            api_addr: api_addr.trim_end_matches('/').to_string(),
            plugin_ids,
            client,
            credentials: Default::default(),
        })
    }

    /// Backend id of a named plugin; empty ids mark a switched-off plugin
    fn plugin_id(&self, name: &str) -> Option<&str> {
        self.plugin_ids.get(name).map(String::as_str).filter(|id| !id.is_empty())
    }

    async fn push_plugin_config(&self, plugin_id: &str, config: &Value) -> Result<()> {
        let url = format!("{}/plugins/{}", self.api_addr, plugin_id);
        let body = json!({ "config": config, "enabled": true, "global": true });
        let response = self.client.put(&url).json(&body).send().await.map_err(|e| {
            error!(error = %e, cluster = %self.cluster, plugin_id, "Mesh plugin update failed");
            RouteplaneError::from(e)
        })?;
        let status = response.status().as_u16();
        if status >= 300 {
            let text = response.text().await.unwrap_or_default();
            warn!(cluster = %self.cluster, plugin_id, status, "Mesh plugin update rejected");
            return Err(RouteplaneError::backend_rejected(
                status,
                format!("mesh plugin {} update failed: {}", plugin_id, text),
            ));
        }
        debug!(cluster = %self.cluster, plugin_id, "Mesh plugin config pushed");
        Ok(())
    }

    fn synthesize_plugin(req: &PluginRequest, id: String) -> PluginResponse {
        PluginResponse {
            id,
            name: req.name.clone(),
            service_id: req.service_id.clone(),
            route_id: req.route_id.clone(),
            consumer_id: req.consumer_id.clone(),
            config: req.config.clone(),
            enabled: true,
            created_at: Some(chrono::Utc::now().timestamp_millis()),
        }
    }

    async fn apply_plugin(&self, req: &PluginRequest) -> Result<PluginResponse> {
        match self.plugin_id(&req.name) {
            Some(plugin_id) => {
                self.push_plugin_config(plugin_id, &req.config).await?;
                Ok(Self::synthesize_plugin(req, plugin_id.to_string()))
            }
            None => Ok(Self::synthesize_plugin(req, req.id.clone().unwrap_or_else(local_id))),
        }
    }

    /// Re-push an auth plugin with the current consumer credential list
    async fn sync_credentials(&self, plugin_name: &str) -> Result<()> {
        let Some(plugin_id) = self.plugin_id(plugin_name) else {
            return Ok(());
        };
        let consumers: Vec<Value> = self
            .credentials
            .get(plugin_name)
            .map(|entries| {
                entries
                    .iter()
                    .map(|(consumer, credential)| json!({ "name": consumer, "credential": credential }))
                    .collect()
            })
            .unwrap_or_default();
        self.push_plugin_config(plugin_id, &json!({ "consumers": consumers })).await
    }
}

#[async_trait]
impl GatewayAdapter for MeshAdapter {
    fn provider(&self) -> GatewayProvider {
        GatewayProvider::Mse
    }

    fn cluster(&self) -> &str {
        &self.cluster
    }

    async fn get_version(&self) -> Result<String> {
        Ok(MESH_GATEWAY_VERSION.to_string())
    }

    async fn check_plugin_enabled(&self, plugin_name: &str) -> Result<bool> {
        Ok(match self.plugin_ids.get(plugin_name) {
            Some(id) => !id.is_empty(),
            None => true,
        })
    }

    async fn create_or_update_service(&self, req: &ServiceRequest) -> Result<ServiceResponse> {
        Ok(ServiceResponse {
            id: req.id.clone().unwrap_or_else(local_id),
            name: req.name.clone(),
            protocol: req.protocol.clone(),
            host: req.host.clone(),
            port: Some(req.port.unwrap_or(DEFAULT_SERVICE_PORT)),
            path: req.path.clone(),
        })
    }

    async fn delete_service(&self, _service_id: &str) -> Result<()> {
        Ok(())
    }

    async fn create_or_update_route(&self, req: &RouteRequest) -> Result<RouteResponse> {
        Ok(RouteResponse {
            id: req.id.clone().unwrap_or_else(local_id),
            protocols: req.protocols.clone(),
            methods: Some(req.methods.clone()),
            hosts: Some(req.hosts.clone()),
            paths: Some(req.paths.clone()),
            service: req.service.clone(),
            tags: Some(req.tags.clone()),
        })
    }

    async fn update_route(&self, req: &RouteRequest) -> Result<RouteResponse> {
        self.create_or_update_route(req).await
    }

    async fn delete_route(&self, _route_id: &str) -> Result<()> {
        Ok(())
    }

    async fn create_or_update_plugin(&self, req: &PluginRequest) -> Result<Option<PluginResponse>> {
        if !self.check_plugin_enabled(&req.name).await? {
            warn!(cluster = %self.cluster, plugin = %req.name, "Plugin not enabled on mesh gateway, skipped");
            return Ok(None);
        }
        let plugin = self.apply_plugin(req).await?;
        info!(cluster = %self.cluster, plugin = %req.name, "Mesh plugin applied");
        Ok(Some(plugin))
    }

    async fn create_or_update_plugin_by_id(&self, req: &PluginRequest) -> Result<PluginResponse> {
        self.apply_plugin(req).await
    }

    async fn get_plugin(&self, _req: &PluginRequest) -> Result<Option<PluginResponse>> {
        Ok(None)
    }

    async fn update_plugin(&self, req: &PluginRequest) -> Result<PluginResponse> {
        self.apply_plugin(req).await
    }

    async fn remove_plugin(&self, _plugin_id: &str) -> Result<()> {
        Ok(())
    }

    async fn create_consumer(&self, req: &ConsumerRequest) -> Result<ConsumerResponse> {
        Ok(ConsumerResponse {
            id: local_id(),
            custom_id: Some(req.custom_id.clone()),
            username: req.username.clone(),
            created_at: Some(chrono::Utc::now().timestamp_millis()),
        })
    }

    async fn delete_consumer(&self, consumer_id: &str) -> Result<()> {
        let touched: Vec<String> = self
            .credentials
            .iter_mut()
            .filter_map(|mut entry| {
                let before = entry.value().len();
                entry.value_mut().retain(|(consumer, _)| consumer != consumer_id);
                (entry.value().len() != before).then(|| entry.key().clone())
            })
            .collect();
        for plugin_name in touched {
            self.sync_credentials(&plugin_name).await?;
        }
        Ok(())
    }

    async fn create_credential(&self, req: &CredentialRequest) -> Result<Credential> {
        let mut credential = req.config.clone();
        if credential.id.is_empty() {
            credential.id = local_id();
        }
        self.credentials
            .entry(req.plugin_name.clone())
            .or_default()
            .push((req.consumer_id.clone(), credential.clone()));
        self.sync_credentials(&req.plugin_name).await?;
        Ok(credential)
    }

    async fn delete_credential(
        &self,
        consumer_id: &str,
        plugin_name: &str,
        credential_id: &str,
    ) -> Result<()> {
        if let Some(mut entries) = self.credentials.get_mut(plugin_name) {
            entries.retain(|(consumer, credential)| {
                !(consumer == consumer_id && credential.id == credential_id)
            });
        }
        self.sync_credentials(plugin_name).await
    }

    async fn get_credential_list(
        &self,
        consumer_id: &str,
        plugin_name: &str,
    ) -> Result<Vec<Credential>> {
        Ok(self
            .credentials
            .get(plugin_name)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|(consumer, _)| consumer == consumer_id)
                    .map(|(_, credential)| credential.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn create_acl_group(&self, _consumer_id: &str, _group: &str) -> Result<()> {
        Ok(())
    }

    async fn create_upstream(&self, req: &UpstreamRequest) -> Result<UpstreamResponse> {
        Ok(UpstreamResponse { id: local_id(), name: req.name.clone() })
    }

    async fn get_upstream_status(&self, _upstream_id: &str) -> Result<Vec<TargetHealth>> {
        Ok(Vec::new())
    }

    async fn add_upstream_target(
        &self,
        _upstream_id: &str,
        req: &TargetRequest,
    ) -> Result<TargetResponse> {
        Ok(TargetResponse { id: local_id(), target: req.target.clone(), weight: req.weight })
    }

    async fn delete_upstream_target(&self, _upstream_id: &str, _target_id: &str) -> Result<()> {
        Ok(())
    }

    async fn get_routes(&self) -> Result<Vec<RouteResponse>> {
        Ok(Vec::new())
    }

    async fn get_routes_with_tag(&self, _tag: &str) -> Result<Vec<RouteResponse>> {
        Ok(Vec::new())
    }
}
