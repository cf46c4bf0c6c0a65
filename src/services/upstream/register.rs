//! Bulk upstream registration
//!
//! A registration call records a new generation of an upstream's apis and,
//! when the upstream auto-binds, hands it to the [`UpstreamReconciler`].
//! Upstream rows are created optimistically: the natural key is looked up
//! without a lock and only a miss takes the table lock.

use chrono::Utc;
use sqlx::types::Json;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};
use validator::Validate;

use crate::domain::{
    Consumer, ConsumerId, GatewayApi, GatewayApiId, GatewayProvider, RegisterRecord, RegisterRecordId,
    RuntimeService, RuntimeServiceId, Upstream, UpstreamApi, UpstreamApiId, UpstreamId, UpstreamRegisterRequest,
};
use crate::errors::{Result, RouteplaneError};
use crate::gateway::dto::ConsumerRequest;
use crate::gateway::GatewayResolver;
use crate::services::task_runner::TaskRunner;
use crate::services::upstream::reconciler::{ReconcileSummary, UpstreamReconciler};
use crate::storage::{
    ConsumerFilter, RegisterRecordFilter, RuntimeServiceFilter, Session, Store, UpstreamFilter,
};

/// Name of the consumer routes of an (org, project, env, az) scope bind to
pub fn default_consumer_name(project_id: &str, env: &str, az: &str) -> String {
    format!("{}-{}-{}-default", project_id, env, az)
}

fn join_domains(domain: &str) -> String {
    domain.split(',').map(str::trim).filter(|d| !d.is_empty()).collect::<Vec<_>>().join(",")
}

/// Result of one registration call
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterOutcome {
    pub upstream: Upstream,
    /// Whether the call recorded a new generation
    pub generation_changed: bool,
    /// Present when the differ ran in the call
    pub summary: Option<ReconcileSummary>,
}

/// State shared by sync and async registration once the generation is saved
#[derive(Debug)]
struct Saved {
    consumer: Consumer,
    upstream: Upstream,
    changed: bool,
}

#[derive(Debug, Clone)]
pub struct UpstreamService {
    store: Store,
    resolver: Arc<dyn GatewayResolver>,
    reconciler: UpstreamReconciler,
}

impl UpstreamService {
    pub fn new(store: Store, resolver: Arc<dyn GatewayResolver>, reconciler: UpstreamReconciler) -> Self {
        Self { store, resolver, reconciler }
    }

    pub fn reconciler(&self) -> &UpstreamReconciler {
        &self.reconciler
    }

    /// Register a generation and, for auto-binding upstreams, reconcile it
    /// before returning.
    #[instrument(skip(self, req), fields(upstream = %req.upstream_name, register_id = %req.register_id), name = "upstream_register")]
    pub async fn register(&self, req: UpstreamRegisterRequest) -> Result<RegisterOutcome> {
        let path_prefix = req.path_prefix.clone().unwrap_or_default();
        let mode = req.mode;
        let register_id = req.register_id.clone();
        let saved = self.prepare(req).await?;

        let summary = if saved.upstream.auto_bind {
            Some(
                self.reconciler
                    .validate(&saved.consumer, &saved.upstream.id, &register_id, &path_prefix, mode)
                    .await?,
            )
        } else {
            None
        };
        Ok(RegisterOutcome { upstream: saved.upstream, generation_changed: saved.changed, summary })
    }

    /// Register a generation and reconcile it on a detached task. The
    /// handle is `None` when the upstream does not auto-bind.
    #[instrument(skip(self, runner, req), fields(upstream = %req.upstream_name, register_id = %req.register_id), name = "upstream_register_async")]
    pub async fn register_async(
        &self,
        runner: &TaskRunner,
        req: UpstreamRegisterRequest,
    ) -> Result<(RegisterOutcome, Option<JoinHandle<()>>)> {
        let path_prefix = req.path_prefix.clone().unwrap_or_default();
        let mode = req.mode;
        let register_id = req.register_id.clone();
        let saved = self.prepare(req).await?;

        let handle = if saved.upstream.auto_bind {
            let reconciler = self.reconciler.clone();
            let consumer = saved.consumer.clone();
            let upstream_id = saved.upstream.id.clone();
            let handle = runner
                .submit("upstream_validate", saved.upstream.id.to_string(), move |session| async move {
                    reconciler
                        .validate_in(session, &consumer, &upstream_id, &register_id, &path_prefix, mode)
                        .await
                        .map(|_| ())
                })
                .await?;
            Some(handle)
        } else {
            None
        };
        let outcome = RegisterOutcome { upstream: saved.upstream, generation_changed: saved.changed, summary: None };
        Ok((outcome, handle))
    }

    async fn prepare(&self, req: UpstreamRegisterRequest) -> Result<Saved> {
        req.validate()?;
        let az = if req.az.is_empty() {
            self.resolver.resolve_az(&req.org_id, &req.project_id, &req.env)?
        } else {
            req.az.clone()
        };

        let mut session = self.store.begin().await?;
        let consumer = self.default_consumer(&mut session, &req, &az).await?;
        let runtime_service_id = self.touch_runtime_service(&mut session, &req, &az).await?;
        session.commit().await?;

        let (upstream, changed) = self.save_upstream(&req, &az, &runtime_service_id).await?;
        Ok(Saved { consumer, upstream, changed })
    }

    /// The default consumer of the scope, created on the backend and in the
    /// store on first use
    async fn default_consumer(&self, session: &mut Session, req: &UpstreamRegisterRequest, az: &str) -> Result<Consumer> {
        let filter = ConsumerFilter {
            org_id: Some(req.org_id.clone()),
            project_id: Some(req.project_id.clone()),
            env: Some(req.env.clone()),
            az: Some(az.to_string()),
            is_default: Some(true),
            ..Default::default()
        };
        if let Some(consumer) = session.get_by::<Consumer>(&filter).await? {
            return Ok(consumer);
        }

        let name = default_consumer_name(&req.project_id, &req.env, az);
        let adapter = self.resolver.adapter(az).await?;
        let backend_id = if adapter.provider() == GatewayProvider::None {
            String::new()
        } else {
            adapter
                .create_consumer(&ConsumerRequest { custom_id: name.clone(), username: None })
                .await?
                .id
        };

        let consumer = Consumer {
            id: ConsumerId::new(),
            name,
            backend_id,
            org_id: req.org_id.clone(),
            project_id: req.project_id.clone(),
            env: req.env.clone(),
            az: az.to_string(),
            is_default: true,
            created_at: Utc::now(),
        };
        if let Err(e) = session.insert(&consumer).await {
            if !consumer.backend_id.is_empty() {
                if let Err(cleanup) = adapter.delete_consumer(&consumer.backend_id).await {
                    warn!(error = %cleanup, consumer = %consumer.name, "Failed to remove backend consumer");
                }
            }
            return Err(e);
        }
        info!(consumer = %consumer.name, "Default consumer created");
        Ok(consumer)
    }

    /// Id of the runtime service the upstream belongs to; empty when the
    /// request names no runtime
    async fn touch_runtime_service(
        &self,
        session: &mut Session,
        req: &UpstreamRegisterRequest,
        az: &str,
    ) -> Result<String> {
        if req.runtime_name.is_empty() {
            return Ok(String::new());
        }
        let filter = RuntimeServiceFilter {
            project_id: Some(req.project_id.clone()),
            env: Some(req.env.clone()),
            cluster_name: Some(az.to_string()),
            app_name: Some(req.app_name.clone()),
            service_name: Some(req.service_name.clone()),
            runtime_name: Some(req.runtime_name.clone()),
            ..Default::default()
        };
        if let Some(service) = session.get_by::<RuntimeService>(&filter).await? {
            return Ok(service.id.into_string());
        }
        let service = RuntimeService {
            id: RuntimeServiceId::new(),
            project_id: req.project_id.clone(),
            env: req.env.clone(),
            cluster_name: az.to_string(),
            app_id: req.app_id.clone(),
            app_name: req.app_name.clone(),
            service_name: req.service_name.clone(),
            runtime_name: req.runtime_name.clone(),
            inner_address: String::new(),
            service_port: 0,
            group_namespace: String::new(),
            group_name: String::new(),
            created_at: Utc::now(),
        };
        session.insert(&service).await?;
        Ok(service.id.into_string())
    }

    async fn lock_upstream(session: &mut Session, id: &UpstreamId) -> Result<Upstream> {
        session
            .select_for_update::<Upstream>(&UpstreamFilter { id: Some(id.clone()), ..Default::default() })
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RouteplaneError::not_found("Upstream", id.as_str()))
    }

    /// Record the request's generation on the upstream. Returns the
    /// upstream and whether a new generation was recorded.
    async fn save_upstream(
        &self,
        req: &UpstreamRegisterRequest,
        az: &str,
        runtime_service_id: &str,
    ) -> Result<(Upstream, bool)> {
        let key = UpstreamFilter {
            org_id: Some(req.org_id.clone()),
            project_id: Some(req.project_id.clone()),
            env: Some(req.env.clone()),
            az: Some(az.to_string()),
            upstream_name: Some(req.upstream_name.clone()),
            runtime_service_id: Some(runtime_service_id.to_string()),
            ..Default::default()
        };

        let mut session = self.store.begin().await?;
        let existing = session.get_by::<Upstream>(&key).await?;
        let (mut session, mut upstream) = match existing {
            Some(found) => {
                let upstream = Self::lock_upstream(&mut session, &found.id).await?;
                (session, upstream)
            }
            None => {
                session.lock_table::<Upstream>().await?;
                if session.get_by::<Upstream>(&key).await?.is_some() {
                    return Err(RouteplaneError::conflict(
                        format!("upstream {} created by other session", req.upstream_name),
                        "Upstream",
                    ));
                }
                let upstream = Upstream {
                    id: UpstreamId::new(),
                    org_id: req.org_id.clone(),
                    project_id: req.project_id.clone(),
                    env: req.env.clone(),
                    az: az.to_string(),
                    app_name: req.app_name.clone(),
                    service_name: req.service_name.clone(),
                    upstream_name: req.upstream_name.clone(),
                    runtime_service_id: runtime_service_id.to_string(),
                    last_register_id: String::new(),
                    valid_register_id: String::new(),
                    auto_bind: req.auto_bind,
                    created_at: Utc::now(),
                };
                session.insert(&upstream).await?;
                session.commit().await?;
                info!(upstream_id = %upstream.id, name = %upstream.upstream_name, "Upstream created");

                let mut session = self.store.begin().await?;
                let upstream = Self::lock_upstream(&mut session, &upstream.id).await?;
                (session, upstream)
            }
        };

        if upstream.last_register_id == req.register_id {
            session.rollback().await?;
            info!(upstream_id = %upstream.id, "Generation already recorded");
            return Ok((upstream, false));
        }

        upstream.last_register_id = req.register_id.clone();
        upstream.auto_bind = req.auto_bind;
        session.update(&upstream).await?;
        self.record_generation(&mut session, &upstream, req).await?;
        session.commit().await?;
        info!(upstream_id = %upstream.id, apis = req.api_list.len(), "Upstream generation recorded");
        Ok((upstream, true))
    }

    async fn record_generation(&self, session: &mut Session, upstream: &Upstream, req: &UpstreamRegisterRequest) -> Result<()> {
        let existing = session
            .get_by::<RegisterRecord>(&RegisterRecordFilter {
                upstream_id: Some(upstream.id.clone()),
                register_id: Some(req.register_id.clone()),
                ..Default::default()
            })
            .await?;
        if existing.is_some() {
            return Ok(());
        }

        let now = Utc::now();
        let mut ids = Vec::with_capacity(req.api_list.len());
        for spec in &req.api_list {
            let api = UpstreamApi {
                id: UpstreamApiId::new(),
                upstream_id: upstream.id.clone(),
                register_id: req.register_id.clone(),
                api_name: spec.name.clone(),
                path: spec.path.clone(),
                gateway_path: spec.gateway_path.clone(),
                method: spec.method.to_uppercase(),
                address: spec.address.clone(),
                domains: join_domains(&spec.domain),
                doc: Json(spec.doc.clone()),
                is_inner: spec.is_inner,
                api_id: String::new(),
                deleted: false,
                created_at: now,
            };
            session.insert(&api).await?;
            ids.push(api.id);
        }
        session
            .insert(&RegisterRecord {
                id: RegisterRecordId::new(),
                upstream_id: upstream.id.clone(),
                register_id: req.register_id.clone(),
                upstream_apis: Json(ids),
                created_at: now,
            })
            .await
    }

    /// Remove a bound route on operator request. The upstream api stays in
    /// its generation marked missing, so the next run of the same
    /// generation binds it again.
    #[instrument(skip(self), fields(api_id = %api_id), name = "upstream_unbind_api")]
    pub async fn unbind_api(&self, api_id: &GatewayApiId) -> Result<()> {
        let mut session = self.store.begin().await?;
        let row = session.must_get::<GatewayApi>(api_id).await?;
        let mut api = session.must_get::<UpstreamApi>(&UpstreamApiId::from(row.upstream_api_id.as_str())).await?;
        let upstream = session.must_get::<Upstream>(&api.upstream_id).await?;

        self.reconciler.binder().unbind_row(&mut session, &upstream, &row).await?;
        api.deleted = true;
        api.api_id.clear();
        session.update(&api).await?;
        session.commit().await?;
        info!(upstream_api_id = %api.id, "Upstream api marked missing");
        Ok(())
    }
}
