//! # Kong Admin API Adapter
//!
//! Talks to a Kong-compatible admin API over HTTP. Creates are `POST` to the
//! collection root, overwrites are `PUT` to the object path with the id
//! removed from the body. Deletes tolerate `404` as "already absent".

use crate::domain::GatewayProvider;
use crate::errors::{Result, RouteplaneError};
use crate::gateway::adapter::GatewayAdapter;
use crate::gateway::dto::*;
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use std::time::{Duration, Instant};
use tracing::{debug, error, instrument, warn};

const SERVICE_ROOT: &str = "/services/";
const ROUTE_ROOT: &str = "/routes/";
const PLUGIN_ROOT: &str = "/plugins/";
const CONSUMER_ROOT: &str = "/consumers/";
const UPSTREAM_ROOT: &str = "/upstreams/";
const ACL_PATH: &str = "/acls/";
const HEALTH_PATH: &str = "/health/";
const TARGET_PATH: &str = "/targets/";

/// Adapter for one Kong admin endpoint
#[derive(Debug, Clone)]
pub struct KongAdapter {
    cluster: String,
    admin_addr: String,
    client: Client,
}

impl KongAdapter {
    pub fn new(
        cluster: impl Into<String>,
        admin_addr: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build().map_err(|e| {
            RouteplaneError::internal(format!("Failed to create HTTP client: {}", e))
        })?;
        let admin_addr: String = admin_addr.into();
        Ok(Self {
            cluster: cluster.into(),
            admin_addr: admin_addr.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client.request(method, format!("{}{}", self.admin_addr, path))
    }

    /// Send a request and return status and raw body
    async fn call(&self, op: &'static str, builder: RequestBuilder) -> Result<(u16, String)> {
        let started = Instant::now();
        let response = builder.send().await.map_err(|e| {
            error!(error = %e, cluster = %self.cluster, op, "Gateway admin request failed");
            RouteplaneError::from(e)
        })?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        debug!(
            cluster = %self.cluster,
            op,
            status,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Gateway admin call finished"
        );
        Ok((status, body))
    }

    fn decode<T: DeserializeOwned>(op: &str, body: &str) -> Result<T> {
        serde_json::from_str(body).map_err(|e| RouteplaneError::Serialization {
            source: e,
            context: format!("{} returned an unexpected body: {}", op, body),
        })
    }

    fn rejected(op: &str, status: u16, body: &str) -> RouteplaneError {
        warn!(op, status, body, "Gateway admin call rejected");
        RouteplaneError::backend_rejected(status, format!("{} failed: {}", op, body))
    }

    fn require(value: &str, what: &str) -> Result<()> {
        if value.is_empty() {
            return Err(RouteplaneError::validation_field(format!("{} is required", what), what));
        }
        Ok(())
    }

    /// Create-or-overwrite against a collection root
    fn upsert_target(&self, root: &str, id: Option<&str>) -> RequestBuilder {
        match id.filter(|id| !id.is_empty()) {
            Some(id) => self.request(Method::PUT, &format!("{}{}", root, id)),
            None => self.request(Method::POST, root),
        }
    }

    async fn add_plugin(&self, req: &PluginRequest) -> Result<PluginResponse> {
        let (status, body) =
            self.call("add_plugin", self.request(Method::POST, PLUGIN_ROOT).json(req)).await?;
        match status {
            201 => Self::decode("add_plugin", &body),
            _ => Err(Self::rejected("add_plugin", status, &body)),
        }
    }

    async fn put_plugin(&self, req: &PluginRequest) -> Result<PluginResponse> {
        let mut req = req.clone();
        req.created_at = Some(chrono::Utc::now().timestamp() * 1000);
        let (status, body) =
            self.call("put_plugin", self.request(Method::PUT, PLUGIN_ROOT).json(&req)).await?;
        match status {
            200 | 201 => Self::decode("put_plugin", &body),
            _ => Err(Self::rejected("put_plugin", status, &body)),
        }
    }

    async fn delete_accepting(
        &self,
        op: &'static str,
        path: &str,
        accept: impl Fn(u16) -> bool,
    ) -> Result<()> {
        let (status, body) = self.call(op, self.request(Method::DELETE, path)).await?;
        if accept(status) {
            return Ok(());
        }
        Err(Self::rejected(op, status, &body))
    }

    async fn list_routes(&self, op: &'static str, builder: RequestBuilder) -> Result<Vec<RouteResponse>> {
        let (status, body) = self.call(op, builder).await?;
        match status {
            200 => Ok(Self::decode::<RoutePage>(op, &body)?.data),
            _ => Err(Self::rejected(op, status, &body)),
        }
    }
}

fn deleted_or_absent(status: u16) -> bool {
    status == 204 || status == 404
}

fn success_or_absent(status: u16) -> bool {
    status < 300 || status == 404
}

#[async_trait]
impl GatewayAdapter for KongAdapter {
    fn provider(&self) -> GatewayProvider {
        GatewayProvider::Kong
    }

    fn cluster(&self) -> &str {
        &self.cluster
    }

    async fn get_version(&self) -> Result<String> {
        let (status, body) = self.call("get_version", self.request(Method::GET, "/")).await?;
        match status {
            200 => Ok(Self::decode::<NodeInfo>("get_version", &body)?.version),
            _ => Err(Self::rejected("get_version", status, &body)),
        }
    }

    async fn check_plugin_enabled(&self, plugin_name: &str) -> Result<bool> {
        let (status, body) =
            self.call("check_plugin_enabled", self.request(Method::GET, "/")).await?;
        match status {
            200 => {
                let info: NodeInfo = Self::decode("check_plugin_enabled", &body)?;
                Ok(info.configuration.plugins.iter().any(|name| name == plugin_name))
            }
            _ => Err(Self::rejected("check_plugin_enabled", status, &body)),
        }
    }

    #[instrument(skip(self, req), fields(cluster = %self.cluster, service_id = ?req.id), name = "kong_upsert_service")]
    async fn create_or_update_service(&self, req: &ServiceRequest) -> Result<ServiceResponse> {
        let builder = self.upsert_target(SERVICE_ROOT, req.id.as_deref()).json(req);
        let (status, body) = self.call("create_or_update_service", builder).await?;
        match status {
            200 | 201 => Self::decode("create_or_update_service", &body),
            _ => Err(Self::rejected("create_or_update_service", status, &body)),
        }
    }

    async fn delete_service(&self, service_id: &str) -> Result<()> {
        Self::require(service_id, "service_id")?;
        self.delete_accepting("delete_service", &format!("{}{}", SERVICE_ROOT, service_id), success_or_absent)
            .await
    }

    #[instrument(skip(self, req), fields(cluster = %self.cluster, route_id = ?req.id), name = "kong_upsert_route")]
    async fn create_or_update_route(&self, req: &RouteRequest) -> Result<RouteResponse> {
        let builder = self.upsert_target(ROUTE_ROOT, req.id.as_deref()).json(req);
        let (status, body) = self.call("create_or_update_route", builder).await?;
        match status {
            200 | 201 => Self::decode("create_or_update_route", &body),
            400 => Err(RouteplaneError::invalid_request(format!(
                "route rejected by gateway: {}",
                body
            ))),
            _ => Err(Self::rejected("create_or_update_route", status, &body)),
        }
    }

    async fn update_route(&self, req: &RouteRequest) -> Result<RouteResponse> {
        let route_id = req.id.as_deref().unwrap_or_default();
        Self::require(route_id, "route_id")?;
        let builder = self.request(Method::PATCH, &format!("{}{}", ROUTE_ROOT, route_id)).json(req);
        let (status, body) = self.call("update_route", builder).await?;
        match status {
            200 | 201 => Self::decode("update_route", &body),
            400 => Err(RouteplaneError::invalid_request(format!(
                "route rejected by gateway: {}",
                body
            ))),
            _ => Err(Self::rejected("update_route", status, &body)),
        }
    }

    async fn delete_route(&self, route_id: &str) -> Result<()> {
        Self::require(route_id, "route_id")?;
        self.delete_accepting("delete_route", &format!("{}{}", ROUTE_ROOT, route_id), success_or_absent)
            .await
    }

    #[instrument(skip(self, req), fields(cluster = %self.cluster, plugin = %req.name), name = "kong_upsert_plugin")]
    async fn create_or_update_plugin(&self, req: &PluginRequest) -> Result<Option<PluginResponse>> {
        if !self.check_plugin_enabled(&req.name).await? {
            warn!(cluster = %self.cluster, plugin = %req.name, "Plugin not enabled on gateway, skipped");
            return Ok(None);
        }
        match self.get_plugin(req).await? {
            Some(existing) => {
                let mut req = req.clone();
                req.id = Some(existing.id);
                Ok(Some(self.put_plugin(&req).await?))
            }
            None => Ok(Some(self.add_plugin(req).await?)),
        }
    }

    async fn create_or_update_plugin_by_id(&self, req: &PluginRequest) -> Result<PluginResponse> {
        Self::require(req.id.as_deref().unwrap_or_default(), "plugin_id")?;
        self.put_plugin(req).await
    }

    async fn get_plugin(&self, req: &PluginRequest) -> Result<Option<PluginResponse>> {
        Self::require(&req.name, "plugin_name")?;
        let builder = self.request(Method::GET, PLUGIN_ROOT).query(&req.lookup_query());
        let (status, body) = self.call("get_plugin", builder).await?;
        match status {
            200 => {
                let page: PluginPage = Self::decode("get_plugin", &body)?;
                if page.total == Some(0) {
                    return Ok(None);
                }
                Ok(page.data.into_iter().next())
            }
            _ => Err(Self::rejected("get_plugin", status, &body)),
        }
    }

    async fn update_plugin(&self, req: &PluginRequest) -> Result<PluginResponse> {
        let plugin_id = req.id.as_deref().unwrap_or_default();
        Self::require(plugin_id, "plugin_id")?;
        let mut body_req = req.clone();
        body_req.id = None;
        let builder =
            self.request(Method::PATCH, &format!("{}{}", PLUGIN_ROOT, plugin_id)).json(&body_req);
        let (status, body) = self.call("update_plugin", builder).await?;
        match status {
            200 => Self::decode("update_plugin", &body),
            _ => Err(Self::rejected("update_plugin", status, &body)),
        }
    }

    async fn remove_plugin(&self, plugin_id: &str) -> Result<()> {
        Self::require(plugin_id, "plugin_id")?;
        self.delete_accepting("remove_plugin", &format!("{}{}", PLUGIN_ROOT, plugin_id), deleted_or_absent)
            .await
    }

    async fn create_consumer(&self, req: &ConsumerRequest) -> Result<ConsumerResponse> {
        let builder = self.request(Method::POST, CONSUMER_ROOT).json(req);
        let (status, body) = self.call("create_consumer", builder).await?;
        match status {
            201 => Self::decode("create_consumer", &body),
            _ => Err(Self::rejected("create_consumer", status, &body)),
        }
    }

    async fn delete_consumer(&self, consumer_id: &str) -> Result<()> {
        Self::require(consumer_id, "consumer_id")?;
        self.delete_accepting(
            "delete_consumer",
            &format!("{}{}", CONSUMER_ROOT, consumer_id),
            deleted_or_absent,
        )
        .await
    }

    async fn create_credential(&self, req: &CredentialRequest) -> Result<Credential> {
        Self::require(&req.consumer_id, "consumer_id")?;
        Self::require(&req.plugin_name, "plugin_name")?;
        let path = format!("{}{}/{}/", CONSUMER_ROOT, req.consumer_id, req.plugin_name);
        let (status, body) =
            self.call("create_credential", self.request(Method::POST, &path).json(&req.config)).await?;
        match status {
            201 => Self::decode("create_credential", &body),
            _ => Err(Self::rejected("create_credential", status, &body)),
        }
    }

    async fn delete_credential(
        &self,
        consumer_id: &str,
        plugin_name: &str,
        credential_id: &str,
    ) -> Result<()> {
        let path = format!("{}{}/{}/{}", CONSUMER_ROOT, consumer_id, plugin_name, credential_id);
        self.delete_accepting("delete_credential", &path, deleted_or_absent).await
    }

    async fn get_credential_list(
        &self,
        consumer_id: &str,
        plugin_name: &str,
    ) -> Result<Vec<Credential>> {
        let path = format!("{}{}/{}", CONSUMER_ROOT, consumer_id, plugin_name);
        let (status, body) = self.call("get_credential_list", self.request(Method::GET, &path)).await?;
        match status {
            200 => Ok(Self::decode::<CredentialPage>("get_credential_list", &body)?.data),
            _ => Err(Self::rejected("get_credential_list", status, &body)),
        }
    }

    async fn create_acl_group(&self, consumer_id: &str, group: &str) -> Result<()> {
        Self::require(consumer_id, "consumer_id")?;
        Self::require(group, "group")?;
        let path = format!("{}{}{}", CONSUMER_ROOT, consumer_id, ACL_PATH);
        let builder = self.request(Method::POST, &path).json(&serde_json::json!({ "group": group }));
        let (status, body) = self.call("create_acl_group", builder).await?;
        if status < 300 {
            return Ok(());
        }
        Err(Self::rejected("create_acl_group", status, &body))
    }

    async fn create_upstream(&self, req: &UpstreamRequest) -> Result<UpstreamResponse> {
        let (status, body) =
            self.call("create_upstream", self.request(Method::POST, UPSTREAM_ROOT).json(req)).await?;
        match status {
            200 | 201 => Self::decode("create_upstream", &body),
            _ => Err(Self::rejected("create_upstream", status, &body)),
        }
    }

    async fn get_upstream_status(&self, upstream_id: &str) -> Result<Vec<TargetHealth>> {
        Self::require(upstream_id, "upstream_id")?;
        let path = format!("{}{}{}", UPSTREAM_ROOT, upstream_id, HEALTH_PATH);
        let (status, body) = self.call("get_upstream_status", self.request(Method::GET, &path)).await?;
        match status {
            200 => Ok(Self::decode::<UpstreamHealthPage>("get_upstream_status", &body)?.data),
            _ => Err(Self::rejected("get_upstream_status", status, &body)),
        }
    }

    async fn add_upstream_target(
        &self,
        upstream_id: &str,
        req: &TargetRequest,
    ) -> Result<TargetResponse> {
        Self::require(upstream_id, "upstream_id")?;
        let path = format!("{}{}{}", UPSTREAM_ROOT, upstream_id, TARGET_PATH);
        let (status, body) =
            self.call("add_upstream_target", self.request(Method::POST, &path).json(req)).await?;
        match status {
            200 | 201 => Self::decode("add_upstream_target", &body),
            _ => Err(Self::rejected("add_upstream_target", status, &body)),
        }
    }

    async fn delete_upstream_target(&self, upstream_id: &str, target_id: &str) -> Result<()> {
        Self::require(upstream_id, "upstream_id")?;
        Self::require(target_id, "target_id")?;
        let path = format!("{}{}{}{}", UPSTREAM_ROOT, upstream_id, TARGET_PATH, target_id);
        self.delete_accepting("delete_upstream_target", &path, deleted_or_absent).await
    }

    async fn get_routes(&self) -> Result<Vec<RouteResponse>> {
        self.list_routes("get_routes", self.request(Method::GET, ROUTE_ROOT)).await
    }

    async fn get_routes_with_tag(&self, tag: &str) -> Result<Vec<RouteResponse>> {
        let builder = self.request(Method::GET, ROUTE_ROOT).query(&[("tags", tag)]);
        self.list_routes("get_routes_with_tag", builder).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_addr_drops_trailing_slash() {
        let adapter = KongAdapter::new("dev", "http://kong:8001/", Duration::from_secs(1)).unwrap();
        assert_eq!(adapter.admin_addr, "http://kong:8001");
        assert_eq!(adapter.cluster(), "dev");
    }

    #[test]
    fn delete_status_tolerance() {
        assert!(deleted_or_absent(204));
        assert!(deleted_or_absent(404));
        assert!(!deleted_or_absent(200));
        assert!(success_or_absent(200));
        assert!(success_or_absent(404));
        assert!(!success_or_absent(500));
    }
}
