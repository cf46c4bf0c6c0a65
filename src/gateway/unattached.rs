//! Adapter for clusters without a gateway provider.

use crate::domain::GatewayProvider;
use crate::errors::{Result, RouteplaneError};
use crate::gateway::adapter::GatewayAdapter;
use crate::gateway::dto::*;
use async_trait::async_trait;

/// Every call fails with `BackendUnavailable`
#[derive(Debug, Clone)]
pub struct UnattachedAdapter {
    cluster: String,
}

impl UnattachedAdapter {
    pub fn new(cluster: impl Into<String>) -> Self {
        Self { cluster: cluster.into() }
    }

    fn fail<T>(&self) -> Result<T> {
        Err(RouteplaneError::not_attached(&self.cluster))
    }
}

#[async_trait]
impl GatewayAdapter for UnattachedAdapter {
    fn provider(&self) -> GatewayProvider {
        GatewayProvider::None
    }

    fn cluster(&self) -> &str {
        &self.cluster
    }

    async fn get_version(&self) -> Result<String> {
        self.fail()
    }

    async fn check_plugin_enabled(&self, _plugin_name: &str) -> Result<bool> {
        self.fail()
    }

    async fn create_or_update_service(&self, _req: &ServiceRequest) -> Result<ServiceResponse> {
        self.fail()
    }

    async fn delete_service(&self, _service_id: &str) -> Result<()> {
        self.fail()
    }

    async fn create_or_update_route(&self, _req: &RouteRequest) -> Result<RouteResponse> {
        self.fail()
    }

    async fn update_route(&self, _req: &RouteRequest) -> Result<RouteResponse> {
        self.fail()
    }

    async fn delete_route(&self, _route_id: &str) -> Result<()> {
        self.fail()
    }

    async fn create_or_update_plugin(&self, _req: &PluginRequest) -> Result<Option<PluginResponse>> {
        self.fail()
    }

    async fn create_or_update_plugin_by_id(&self, _req: &PluginRequest) -> Result<PluginResponse> {
        self.fail()
    }

    async fn get_plugin(&self, _req: &PluginRequest) -> Result<Option<PluginResponse>> {
        self.fail()
    }

    async fn update_plugin(&self, _req: &PluginRequest) -> Result<PluginResponse> {
        self.fail()
    }

    async fn remove_plugin(&self, _plugin_id: &str) -> Result<()> {
        self.fail()
    }

    async fn create_consumer(&self, _req: &ConsumerRequest) -> Result<ConsumerResponse> {
        self.fail()
    }

    async fn delete_consumer(&self, _consumer_id: &str) -> Result<()> {
        self.fail()
    }

    async fn create_credential(&self, _req: &CredentialRequest) -> Result<Credential> {
        self.fail()
    }

    async fn delete_credential(&self, _consumer_id: &str, _plugin: &str, _id: &str) -> Result<()> {
        self.fail()
    }

    async fn get_credential_list(&self, _consumer_id: &str, _plugin: &str) -> Result<Vec<Credential>> {
        self.fail()
    }

    async fn create_acl_group(&self, _consumer_id: &str, _group: &str) -> Result<()> {
        self.fail()
    }

    async fn create_upstream(&self, _req: &UpstreamRequest) -> Result<UpstreamResponse> {
        self.fail()
    }

    async fn get_upstream_status(&self, _upstream_id: &str) -> Result<Vec<TargetHealth>> {
        self.fail()
    }

    async fn add_upstream_target(&self, _upstream_id: &str, _req: &TargetRequest) -> Result<TargetResponse> {
        self.fail()
    }

    async fn delete_upstream_target(&self, _upstream_id: &str, _target_id: &str) -> Result<()> {
        self.fail()
    }

    async fn get_routes(&self) -> Result<Vec<RouteResponse>> {
        self.fail()
    }

    async fn get_routes_with_tag(&self, _tag: &str) -> Result<Vec<RouteResponse>> {
        self.fail()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_call_reports_not_attached() {
        let adapter = UnattachedAdapter::new("edge-1");
        let err = adapter.get_version().await.unwrap_err();
        assert_eq!(err.to_string(), "Gateway backend unavailable: gateway not attached to cluster edge-1");
        assert!(adapter.delete_route("r").await.is_err());
        assert!(adapter.create_or_update_plugin(&PluginRequest::default()).await.is_err());
        assert!(adapter
            .delete_plugin_if_exists(&PluginRequest::new("acl", serde_json::Value::Null))
            .await
            .is_err());
    }
}
