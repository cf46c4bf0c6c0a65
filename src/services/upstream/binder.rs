//! Gateway routes bound to registered upstream apis
//!
//! Every bound api is a backend service + route pair recorded as a
//! [`GatewayApi`] row. Re-binding keeps the backend ids so that a rolled
//! back session and the backend agree again after compensation.

use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

use crate::domain::{Consumer, GatewayApi, GatewayApiId, Upstream, UpstreamApi};
use crate::errors::{Result, RouteplaneError};
use crate::gateway::dto::{ObjectRef, RouteRequest, ServiceRequest};
use crate::gateway::{GatewayAdapter, GatewayResolver};
use crate::storage::Session;

const CONNECT_TIMEOUT_MS: u64 = 5000;
const READ_WRITE_TIMEOUT_MS: u64 = 60000;

/// Tag put on every backend route bound for an upstream
pub fn upstream_tag(upstream: &Upstream) -> String {
    format!("upstream:{}", upstream.id)
}

/// Gateway path of a bound api: alias prefix + gateway path, falling back
/// to the api's own path
pub fn bound_path(path_prefix: &str, api: &UpstreamApi) -> String {
    let path = if api.gateway_path.is_empty() { &api.path } else { &api.gateway_path };
    let prefix = path_prefix.trim_end_matches('/');
    if prefix.is_empty() {
        path.clone()
    } else {
        format!("{}{}", prefix, path)
    }
}

pub fn backend_addr(api: &UpstreamApi) -> String {
    format!("{}{}", api.address.trim_end_matches('/'), api.path)
}

fn hosts(domains: &str) -> Vec<String> {
    domains.split(',').map(str::trim).filter(|d| !d.is_empty()).map(String::from).collect()
}

/// Who a bind is for
#[derive(Debug, Clone, Copy)]
pub struct BindTarget<'a> {
    pub consumer: &'a Consumer,
    pub upstream: &'a Upstream,
    pub path_prefix: &'a str,
}

#[derive(Debug, Clone)]
pub struct UpstreamBinder {
    resolver: Arc<dyn GatewayResolver>,
}

impl UpstreamBinder {
    pub fn new(resolver: Arc<dyn GatewayResolver>) -> Self {
        Self { resolver }
    }

    async fn adapter(&self, upstream: &Upstream) -> Result<Arc<dyn GatewayAdapter>> {
        self.resolver.adapter(&upstream.az).await
    }

    /// Upsert the backend pair of a bound api under the given ids
    async fn push(
        &self,
        adapter: &dyn GatewayAdapter,
        upstream: &Upstream,
        row: &mut GatewayApi,
    ) -> Result<()> {
        let service = adapter
            .create_or_update_service(&ServiceRequest {
                id: (!row.service_id.is_empty()).then(|| row.service_id.clone()),
                url: Some(row.redirect_addr.clone()),
                connect_timeout: Some(CONNECT_TIMEOUT_MS),
                read_timeout: Some(READ_WRITE_TIMEOUT_MS),
                write_timeout: Some(READ_WRITE_TIMEOUT_MS),
                ..Default::default()
            })
            .await?;
        let created_service = row.service_id.is_empty();
        row.service_id = service.id.clone();

        let route = adapter
            .create_or_update_route(&RouteRequest {
                id: (!row.route_id.is_empty()).then(|| row.route_id.clone()),
                protocols: vec!["http".to_string(), "https".to_string()],
                methods: if row.method.is_empty() { Vec::new() } else { vec![row.method.clone()] },
                hosts: hosts(&row.hosts),
                paths: vec![row.api_path.clone()],
                strip_path: Some(true),
                service: Some(ObjectRef::new(service.id.clone())),
                tags: vec![upstream_tag(upstream)],
                ..Default::default()
            })
            .await;
        match route {
            Ok(route) => {
                row.route_id = route.id;
                Ok(())
            }
            Err(e) => {
                if created_service {
                    if let Err(cleanup) = adapter.delete_service(&service.id).await {
                        warn!(error = %cleanup, service_id = %service.id, "Failed to remove orphaned backend service");
                    }
                    row.service_id.clear();
                }
                Err(e)
            }
        }
    }

    /// Bind an api, re-binding in place when it is already bound
    pub async fn bind(&self, session: &mut Session, target: BindTarget<'_>, api: &UpstreamApi) -> Result<GatewayApiId> {
        if !api.api_id.is_empty() {
            let id = GatewayApiId::from(api.api_id.as_str());
            if session.get::<GatewayApi>(&id).await?.is_some() {
                self.rebind(session, target, api).await?;
                return Ok(id);
            }
        }

        let adapter = self.adapter(target.upstream).await?;
        let mut row = GatewayApi {
            id: GatewayApiId::new(),
            consumer_id: target.consumer.id.to_string(),
            api_path: bound_path(target.path_prefix, api),
            method: api.method.to_uppercase(),
            redirect_addr: backend_addr(api),
            hosts: api.domains.clone(),
            service_id: String::new(),
            route_id: String::new(),
            upstream_api_id: api.id.to_string(),
            runtime_service_id: target.upstream.runtime_service_id.clone(),
            cluster_name: target.upstream.az.clone(),
            project_id: target.upstream.project_id.clone(),
            env: target.upstream.env.clone(),
            created_at: Utc::now(),
        };
        self.push(adapter.as_ref(), target.upstream, &mut row).await?;
        if let Err(e) = session.insert(&row).await {
            self.pull(adapter.as_ref(), &row).await;
            return Err(e);
        }
        info!(api_id = %row.id, path = %row.api_path, "Upstream api bound");
        Ok(row.id)
    }

    /// Whether the binding an api names still exists
    pub async fn is_bound(&self, session: &mut Session, api: &UpstreamApi) -> Result<bool> {
        if api.api_id.is_empty() {
            return Ok(false);
        }
        Ok(session.get::<GatewayApi>(&GatewayApiId::from(api.api_id.as_str())).await?.is_some())
    }

    /// Hand an unchanged binding over to the entry of a newer generation
    pub async fn adopt(&self, session: &mut Session, api: &UpstreamApi) -> Result<()> {
        if api.api_id.is_empty() {
            return Ok(());
        }
        let Some(mut row) = session.get::<GatewayApi>(&GatewayApiId::from(api.api_id.as_str())).await? else {
            return Ok(());
        };
        if row.upstream_api_id != api.id.as_str() {
            row.upstream_api_id = api.id.to_string();
            session.update(&row).await?;
        }
        Ok(())
    }

    /// Point an existing binding at the api's current address and path.
    /// The method of a binding never changes.
    pub async fn rebind(&self, session: &mut Session, target: BindTarget<'_>, api: &UpstreamApi) -> Result<()> {
        let mut row = session.must_get::<GatewayApi>(&GatewayApiId::from(api.api_id.as_str())).await?;
        let method = api.method.to_uppercase();
        if row.method != method {
            return Err(RouteplaneError::validation(format!(
                "can't change api method: from {} to {}",
                row.method, method
            )));
        }
        row.api_path = bound_path(target.path_prefix, api);
        row.redirect_addr = backend_addr(api);
        row.hosts = api.domains.clone();
        row.upstream_api_id = api.id.to_string();

        let adapter = self.adapter(target.upstream).await?;
        self.push(adapter.as_ref(), target.upstream, &mut row).await?;
        session.update(&row).await?;
        Ok(())
    }

    /// Remove an api's binding, returning the removed row
    pub async fn unbind(&self, session: &mut Session, upstream: &Upstream, api: &UpstreamApi) -> Result<Option<GatewayApi>> {
        if api.api_id.is_empty() {
            return Ok(None);
        }
        let Some(row) = session.get::<GatewayApi>(&GatewayApiId::from(api.api_id.as_str())).await? else {
            return Ok(None);
        };
        self.unbind_row(session, upstream, &row).await?;
        Ok(Some(row))
    }

    pub async fn unbind_row(&self, session: &mut Session, upstream: &Upstream, row: &GatewayApi) -> Result<()> {
        let adapter = self.adapter(upstream).await?;
        if !row.route_id.is_empty() {
            adapter.delete_route(&row.route_id).await?;
        }
        if !row.service_id.is_empty() {
            adapter.delete_service(&row.service_id).await?;
        }
        session.delete_by_id::<GatewayApi>(&row.id).await?;
        info!(api_id = %row.id, path = %row.api_path, "Upstream api unbound");
        Ok(())
    }

    /// Re-create a removed binding with its original backend ids
    pub async fn restore(&self, session: &mut Session, upstream: &Upstream, row: &GatewayApi) -> Result<()> {
        let adapter = self.adapter(upstream).await?;
        let mut restored = row.clone();
        self.push(adapter.as_ref(), upstream, &mut restored).await?;
        session.insert(&restored).await
    }

    async fn pull(&self, adapter: &dyn GatewayAdapter, row: &GatewayApi) {
        if let Err(e) = adapter.delete_route(&row.route_id).await {
            warn!(error = %e, route_id = %row.route_id, "Failed to remove backend route");
        }
        if let Err(e) = adapter.delete_service(&row.service_id).await {
            warn!(error = %e, service_id = %row.service_id, "Failed to remove backend service");
        }
    }
}
