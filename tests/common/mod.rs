//! Common test utilities for all integration tests.
//!
//! Provides a recording gateway backend with failure injection, a resolver
//! serving it for a fixed cluster set, and a fully wired in-memory
//! environment.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

use routeplane::config::{AppConfig, AzBinding, ClusterConfig, ReconcilerSettings};
use routeplane::domain::{ClusterType, GatewayProvider, Scope};
use routeplane::errors::{Result, RouteplaneError};
use routeplane::gateway::dto::*;
use routeplane::gateway::{GatewayAdapter, GatewayResolver, IngressApplier};
use routeplane::services::{LogNotifier, Managers};
use routeplane::storage::Store;

pub const CLUSTER: &str = "test-cluster";
pub const ORG: &str = "1";
pub const PROJECT: &str = "42";
pub const ENV: &str = "prod";

#[derive(Debug, Default)]
pub struct MockState {
    pub calls: Vec<String>,
    pub services: HashMap<String, ServiceRequest>,
    pub routes: HashMap<String, RouteRequest>,
    pub plugins: HashMap<String, PluginRequest>,
    pub consumers: HashMap<String, ConsumerRequest>,
    route_writes: usize,
    fail_route_write_at: Option<usize>,
    reject_paths: HashSet<String>,
    reject_plugins: HashSet<String>,
}

/// Gateway backend keeping its objects in memory and recording every call
#[derive(Debug)]
pub struct MockAdapter {
    cluster: String,
    provider: GatewayProvider,
    state: Mutex<MockState>,
}

impl MockAdapter {
    pub fn new(cluster: &str, provider: GatewayProvider) -> Self {
        Self { cluster: cluster.to_string(), provider, state: Mutex::new(MockState::default()) }
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    pub fn route_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.state().routes.values().flat_map(|r| r.paths.clone()).collect();
        paths.sort();
        paths
    }

    pub fn service_count(&self) -> usize {
        self.state().services.len()
    }

    /// Fail the n-th route write from now (1-based) with a backend error
    pub fn fail_route_write_at(&self, n: usize) {
        let mut state = self.state();
        state.route_writes = 0;
        state.fail_route_write_at = Some(n);
    }

    /// Refuse routes on this path as an invalid request
    pub fn reject_path(&self, path: &str) {
        self.state().reject_paths.insert(path.to_string());
    }

    /// Refuse writes of plugins with this name
    pub fn reject_plugin(&self, name: &str) {
        self.state().reject_plugins.insert(name.to_string());
    }

    fn record(&self, call: String) -> MutexGuard<'_, MockState> {
        let mut state = self.state();
        state.calls.push(call);
        state
    }
}

fn matches_target(plugin: &PluginRequest, req: &PluginRequest) -> bool {
    plugin.name == req.name
        && plugin.route_id == req.route_id
        && plugin.service_id == req.service_id
        && plugin.consumer_id == req.consumer_id
}

#[async_trait]
impl GatewayAdapter for MockAdapter {
    fn provider(&self) -> GatewayProvider {
        self.provider
    }

    fn cluster(&self) -> &str {
        &self.cluster
    }

    async fn get_version(&self) -> Result<String> {
        Ok("3.4.0".to_string())
    }

    async fn check_plugin_enabled(&self, _plugin_name: &str) -> Result<bool> {
        Ok(true)
    }

    async fn create_or_update_service(&self, req: &ServiceRequest) -> Result<ServiceResponse> {
        let id = req.id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut state = self.record(format!("put_service {}", id));
        state.services.insert(id.clone(), req.clone());
        Ok(ServiceResponse { id, ..Default::default() })
    }

    async fn delete_service(&self, service_id: &str) -> Result<()> {
        let mut state = self.record(format!("delete_service {}", service_id));
        state.services.remove(service_id);
        Ok(())
    }

    async fn create_or_update_route(&self, req: &RouteRequest) -> Result<RouteResponse> {
        let id = req.id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut state = self.record(format!("put_route {}", req.paths.join(",")));
        state.route_writes += 1;
        if state.fail_route_write_at == Some(state.route_writes) {
            return Err(RouteplaneError::backend_rejected(500, "injected route failure"));
        }
        if req.paths.iter().any(|p| state.reject_paths.contains(p)) {
            return Err(RouteplaneError::invalid_request(format!("route path conflict: {:?}", req.paths)));
        }
        state.routes.insert(id.clone(), req.clone());
        Ok(RouteResponse { id, paths: Some(req.paths.clone()), ..Default::default() })
    }

    async fn update_route(&self, req: &RouteRequest) -> Result<RouteResponse> {
        let id = req.id.clone().unwrap_or_default();
        let mut state = self.record(format!("patch_route {}", id));
        let route = state
            .routes
            .get_mut(&id)
            .ok_or_else(|| RouteplaneError::backend_rejected(404, format!("route {} not found", id)))?;
        if !req.hosts.is_empty() {
            route.hosts = req.hosts.clone();
        }
        Ok(RouteResponse { id, ..Default::default() })
    }

    async fn delete_route(&self, route_id: &str) -> Result<()> {
        let mut state = self.record(format!("delete_route {}", route_id));
        state.routes.remove(route_id);
        Ok(())
    }

    async fn create_or_update_plugin(&self, req: &PluginRequest) -> Result<Option<PluginResponse>> {
        let mut state = self.record(format!("put_plugin {}", req.name));
        let existing = state.plugins.iter().find(|(_, p)| matches_target(p, req)).map(|(id, _)| id.clone());
        let id = existing.or_else(|| req.id.clone()).unwrap_or_else(|| Uuid::new_v4().to_string());
        state.plugins.insert(id.clone(), req.clone());
        Ok(Some(PluginResponse { id, name: req.name.clone(), config: req.config.clone(), ..Default::default() }))
    }

    async fn create_or_update_plugin_by_id(&self, req: &PluginRequest) -> Result<PluginResponse> {
        let id = req.id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut state = self.record(format!("put_plugin_by_id {}", req.name));
        if state.reject_plugins.contains(&req.name) {
            return Err(RouteplaneError::backend_rejected(400, "injected plugin failure"));
        }
        state.plugins.insert(id.clone(), req.clone());
        Ok(PluginResponse { id, name: req.name.clone(), config: req.config.clone(), enabled: req.enabled, ..Default::default() })
    }

    async fn get_plugin(&self, req: &PluginRequest) -> Result<Option<PluginResponse>> {
        let state = self.state();
        Ok(state.plugins.iter().find(|(_, p)| matches_target(p, req)).map(|(id, p)| PluginResponse {
            id: id.clone(),
            name: p.name.clone(),
            config: p.config.clone(),
            ..Default::default()
        }))
    }

    async fn update_plugin(&self, req: &PluginRequest) -> Result<PluginResponse> {
        self.create_or_update_plugin_by_id(req).await
    }

    async fn remove_plugin(&self, plugin_id: &str) -> Result<()> {
        let mut state = self.record(format!("delete_plugin {}", plugin_id));
        state.plugins.remove(plugin_id);
        Ok(())
    }

    async fn create_consumer(&self, req: &ConsumerRequest) -> Result<ConsumerResponse> {
        let id = Uuid::new_v4().to_string();
        let mut state = self.record(format!("create_consumer {}", req.custom_id));
        state.consumers.insert(id.clone(), req.clone());
        Ok(ConsumerResponse { id, custom_id: Some(req.custom_id.clone()), ..Default::default() })
    }

    async fn delete_consumer(&self, consumer_id: &str) -> Result<()> {
        let mut state = self.record(format!("delete_consumer {}", consumer_id));
        state.consumers.remove(consumer_id);
        Ok(())
    }

    async fn create_credential(&self, req: &CredentialRequest) -> Result<Credential> {
        self.record(format!("create_credential {}", req.plugin_name));
        Ok(Credential { id: Uuid::new_v4().to_string(), ..req.config.clone() })
    }

    async fn delete_credential(&self, _consumer_id: &str, plugin_name: &str, credential_id: &str) -> Result<()> {
        self.record(format!("delete_credential {} {}", plugin_name, credential_id));
        Ok(())
    }

    async fn get_credential_list(&self, _consumer_id: &str, _plugin_name: &str) -> Result<Vec<Credential>> {
        Ok(Vec::new())
    }

    async fn create_acl_group(&self, consumer_id: &str, group: &str) -> Result<()> {
        self.record(format!("create_acl_group {} {}", consumer_id, group));
        Ok(())
    }

    async fn create_upstream(&self, req: &UpstreamRequest) -> Result<UpstreamResponse> {
        self.record(format!("create_upstream {}", req.name));
        Ok(UpstreamResponse { id: Uuid::new_v4().to_string(), name: req.name.clone() })
    }

    async fn get_upstream_status(&self, _upstream_id: &str) -> Result<Vec<TargetHealth>> {
        Ok(Vec::new())
    }

    async fn add_upstream_target(&self, _upstream_id: &str, req: &TargetRequest) -> Result<TargetResponse> {
        self.record(format!("add_target {}", req.target));
        Ok(TargetResponse { id: Uuid::new_v4().to_string(), target: req.target.clone(), weight: req.weight })
    }

    async fn delete_upstream_target(&self, _upstream_id: &str, target_id: &str) -> Result<()> {
        self.record(format!("delete_target {}", target_id));
        Ok(())
    }

    async fn get_routes(&self) -> Result<Vec<RouteResponse>> {
        let state = self.state();
        Ok(state
            .routes
            .iter()
            .map(|(id, r)| RouteResponse { id: id.clone(), paths: Some(r.paths.clone()), tags: Some(r.tags.clone()), ..Default::default() })
            .collect())
    }

    async fn get_routes_with_tag(&self, tag: &str) -> Result<Vec<RouteResponse>> {
        Ok(self
            .get_routes()
            .await?
            .into_iter()
            .filter(|r| r.tags.as_ref().is_some_and(|tags| tags.iter().any(|t| t == tag)))
            .collect())
    }
}

/// Resolver serving one mock backend for a fixed cluster set; no cluster
/// routes through ingress.
#[derive(Debug)]
pub struct StaticResolver {
    pub clusters: Vec<ClusterConfig>,
    pub adapter: Arc<MockAdapter>,
}

#[async_trait]
impl GatewayResolver for StaticResolver {
    fn cluster(&self, name: &str) -> Result<ClusterConfig> {
        self.clusters
            .iter()
            .find(|c| c.name == name)
            .cloned()
            .ok_or_else(|| RouteplaneError::not_found("cluster", name))
    }

    async fn adapter(&self, cluster: &str) -> Result<Arc<dyn GatewayAdapter>> {
        self.cluster(cluster)?;
        Ok(self.adapter.clone())
    }

    async fn ingress(&self, _cluster: &str) -> Result<Option<Arc<dyn IngressApplier>>> {
        Ok(None)
    }

    fn resolve_az(&self, org_id: &str, project_id: &str, env: &str) -> Result<String> {
        self.clusters
            .iter()
            .flat_map(|c| c.az_bindings.iter())
            .find(|b| b.org_id == org_id && b.project_id == project_id && b.env == env)
            .map(|b| b.az.clone())
            .ok_or_else(|| RouteplaneError::not_found("az binding", project_id))
    }
}

pub fn cluster_config(name: &str, provider: GatewayProvider) -> ClusterConfig {
    ClusterConfig {
        name: name.to_string(),
        cluster_type: ClusterType::Dcos,
        provider,
        wildcard_domain: "*.apps.example.com".to_string(),
        kong_admin_addr: Some("http://kong-admin:8001".to_string()),
        gateway_namespace: "addons".to_string(),
        gateway_service: "kong".to_string(),
        mesh_api_addr: None,
        mesh_plugin_ids: Default::default(),
        kubeconfig: None,
        az_bindings: vec![AzBinding {
            org_id: ORG.to_string(),
            project_id: PROJECT.to_string(),
            env: ENV.to_string(),
            az: name.to_string(),
        }],
    }
}

pub fn scope() -> Scope {
    Scope {
        org_id: ORG.to_string(),
        project_id: PROJECT.to_string(),
        env: ENV.to_string(),
        cluster_name: CLUSTER.to_string(),
    }
}

/// Wired services over an in-memory store and a Kong-flavoured mock
pub struct TestEnv {
    pub managers: Managers,
    pub adapter: Arc<MockAdapter>,
    pub store: Store,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_provider(GatewayProvider::Kong)
    }

    pub fn with_provider(provider: GatewayProvider) -> Self {
        let adapter = Arc::new(MockAdapter::new(CLUSTER, provider));
        let resolver = Arc::new(StaticResolver {
            clusters: vec![cluster_config(CLUSTER, provider)],
            adapter: adapter.clone(),
        });
        let config = AppConfig {
            reconciler: ReconcilerSettings { register_slice_size: 2, register_interval_seconds: 0 },
            ..Default::default()
        };
        let store = Store::memory();
        let managers = Managers::with_resolver(&config, store.clone(), resolver, Arc::new(LogNotifier));
        Self { managers, adapter, store }
    }
}
