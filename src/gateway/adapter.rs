//! The capability set every gateway backend implements.

use crate::domain::GatewayProvider;
use crate::errors::Result;
use crate::gateway::dto::*;
use async_trait::async_trait;

/// Uniform interface over one gateway backend of one cluster
#[async_trait]
pub trait GatewayAdapter: Send + Sync + std::fmt::Debug {
    fn provider(&self) -> GatewayProvider;

    /// Cluster the adapter talks to
    fn cluster(&self) -> &str;

    async fn get_version(&self) -> Result<String>;

    async fn check_plugin_enabled(&self, plugin_name: &str) -> Result<bool>;

    async fn create_or_update_service(&self, req: &ServiceRequest) -> Result<ServiceResponse>;

    async fn delete_service(&self, service_id: &str) -> Result<()>;

    async fn create_or_update_route(&self, req: &RouteRequest) -> Result<RouteResponse>;

    /// Partial update of an existing route
    async fn update_route(&self, req: &RouteRequest) -> Result<RouteResponse>;

    async fn delete_route(&self, route_id: &str) -> Result<()>;

    /// Returns `None` when the plugin is not enabled on the backend
    async fn create_or_update_plugin(&self, req: &PluginRequest) -> Result<Option<PluginResponse>>;

    /// Overwrite the plugin instance named by `req.id`
    async fn create_or_update_plugin_by_id(&self, req: &PluginRequest) -> Result<PluginResponse>;

    async fn get_plugin(&self, req: &PluginRequest) -> Result<Option<PluginResponse>>;

    async fn update_plugin(&self, req: &PluginRequest) -> Result<PluginResponse>;

    async fn remove_plugin(&self, plugin_id: &str) -> Result<()>;

    async fn create_consumer(&self, req: &ConsumerRequest) -> Result<ConsumerResponse>;

    async fn delete_consumer(&self, consumer_id: &str) -> Result<()>;

    async fn create_credential(&self, req: &CredentialRequest) -> Result<Credential>;

    async fn delete_credential(
        &self,
        consumer_id: &str,
        plugin_name: &str,
        credential_id: &str,
    ) -> Result<()>;

    async fn get_credential_list(&self, consumer_id: &str, plugin_name: &str)
        -> Result<Vec<Credential>>;

    async fn create_acl_group(&self, consumer_id: &str, group: &str) -> Result<()>;

    async fn create_upstream(&self, req: &UpstreamRequest) -> Result<UpstreamResponse>;

    async fn get_upstream_status(&self, upstream_id: &str) -> Result<Vec<TargetHealth>>;

    async fn add_upstream_target(&self, upstream_id: &str, req: &TargetRequest)
        -> Result<TargetResponse>;

    async fn delete_upstream_target(&self, upstream_id: &str, target_id: &str) -> Result<()>;

    async fn get_routes(&self) -> Result<Vec<RouteResponse>>;

    async fn get_routes_with_tag(&self, tag: &str) -> Result<Vec<RouteResponse>>;

    /// Remove the plugin matching the lookup, if any
    async fn delete_plugin_if_exists(&self, req: &PluginRequest) -> Result<()> {
        if let Some(plugin) = self.get_plugin(req).await? {
            self.remove_plugin(&plugin.id).await?;
        }
        Ok(())
    }
}
