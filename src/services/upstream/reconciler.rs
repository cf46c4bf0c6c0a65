//! Registration generation differ
//!
//! Brings the backend in line with an upstream's newest registration
//! generation. The plan is computed purely from the two generations; it is
//! then applied in three paced batches (adds, updates, deletes). When a
//! batch aborts, every backend change already made is undone in reverse
//! before the session is rolled back.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn, Instrument};

use crate::config::ReconcilerSettings;
use crate::domain::{
    Consumer, GatewayApi, RegisterMode, RegisterRecord, Upstream, UpstreamApi, UpstreamApiId, UpstreamId,
};
use crate::errors::{Result, RouteplaneError};
use crate::gateway::GatewayResolver;
use crate::reconcile_span;
use crate::services::upstream::binder::{BindTarget, UpstreamBinder};
use crate::storage::{RegisterRecordFilter, Session, Store, UpstreamApiFilter, UpstreamFilter};

/// Match key of an api entry: the name with any trailing slash dropped;
/// `root` and the empty name both mean `/`.
pub fn api_key(name: &str) -> String {
    let trimmed = name.trim().trim_end_matches('/');
    if trimmed.is_empty() || trimmed == "root" {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Work needed to move the backend from one generation to the next
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationPlan {
    /// New entries without a bound route
    pub adds: Vec<UpstreamApi>,
    /// `(new, old)`; the new entry already carries the old api id
    pub updates: Vec<(UpstreamApi, UpstreamApi)>,
    /// Old entries whose route goes away
    pub dels: Vec<UpstreamApi>,
    /// `(new, old)` pairs where the new entry takes over an identical route
    pub unchanged: Vec<(UpstreamApi, UpstreamApi)>,
    /// Old entries carried into the new generation (append mode)
    pub carried: Vec<UpstreamApiId>,
}

impl GenerationPlan {
    pub fn is_noop(&self) -> bool {
        self.adds.is_empty() && self.updates.is_empty() && self.dels.is_empty()
    }
}

/// Diff two generations. Entries are matched by [`api_key`]; a matched
/// entry whose method changed is replaced (delete + add) since a bound
/// route never changes method.
pub fn plan_generation(old: &[UpstreamApi], new: &[UpstreamApi], mode: RegisterMode) -> GenerationPlan {
    let mut by_key: HashMap<String, &UpstreamApi> = HashMap::new();
    for api in old {
        by_key.insert(api_key(&api.api_name), api);
    }

    let mut plan = GenerationPlan::default();
    for api in new {
        let Some(prev) = by_key.remove(&api_key(&api.api_name)) else {
            plan.adds.push(api.clone());
            continue;
        };
        if prev.api_id.is_empty() {
            plan.adds.push(api.clone());
            continue;
        }
        if !prev.method.eq_ignore_ascii_case(&api.method) {
            plan.dels.push(prev.clone());
            plan.adds.push(api.clone());
            continue;
        }
        let mut next = api.clone();
        next.api_id = prev.api_id.clone();
        if api.differs_from(prev) {
            plan.updates.push((next, prev.clone()));
        } else {
            plan.unchanged.push((next, prev.clone()));
        }
    }

    let mut rest: Vec<&UpstreamApi> = by_key.into_values().collect();
    rest.sort_by(|a, b| a.api_name.cmp(&b.api_name));
    for prev in rest {
        match mode {
            RegisterMode::Append => plan.carried.push(prev.id.clone()),
            RegisterMode::Replace if !prev.api_id.is_empty() => plan.dels.push(prev.clone()),
            RegisterMode::Replace => {}
        }
    }
    plan
}

/// Counts of one reconciliation run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub added: usize,
    pub updated: usize,
    pub deleted: usize,
    pub skipped: usize,
    pub recovered: usize,
}

/// Backend change made during a run, kept to undo it
#[derive(Debug)]
enum Applied {
    Added(UpstreamApi),
    Updated { backup: UpstreamApi },
    Deleted(GatewayApi),
}

/// Paces backend calls: a pause after each full slice while work remains
#[derive(Debug)]
struct Pacer<'a> {
    settings: &'a ReconcilerSettings,
}

impl Pacer<'_> {
    async fn after(&self, done: usize, total: usize) {
        let slice = self.settings.register_slice_size.max(1);
        if done % slice == 0 && done < total && self.settings.register_interval_seconds > 0 {
            tokio::time::sleep(self.settings.register_interval()).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamReconciler {
    store: Store,
    binder: UpstreamBinder,
    settings: ReconcilerSettings,
}

impl UpstreamReconciler {
    pub fn new(store: Store, resolver: Arc<dyn GatewayResolver>, settings: ReconcilerSettings) -> Self {
        Self { store, binder: UpstreamBinder::new(resolver), settings }
    }

    pub fn binder(&self) -> &UpstreamBinder {
        &self.binder
    }

    /// Reconcile on a fresh session
    pub async fn validate(
        &self,
        consumer: &Consumer,
        upstream_id: &UpstreamId,
        register_id: &str,
        path_prefix: &str,
        mode: RegisterMode,
    ) -> Result<ReconcileSummary> {
        let session = self.store.begin().await?;
        self.validate_in(session, consumer, upstream_id, register_id, path_prefix, mode).await
    }

    /// Make `register_id` the valid generation of the upstream. The session
    /// is committed on success and rolled back otherwise.
    pub async fn validate_in(
        &self,
        mut session: Session,
        consumer: &Consumer,
        upstream_id: &UpstreamId,
        register_id: &str,
        path_prefix: &str,
        mode: RegisterMode,
    ) -> Result<ReconcileSummary> {
        let span = reconcile_span!("validate", upstream_id, register_id = %register_id, mode = %mode);
        async move {
            let mut upstream = session
                .select_for_update::<Upstream>(&UpstreamFilter { id: Some(upstream_id.clone()), ..Default::default() })
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| RouteplaneError::not_found("Upstream", upstream_id.as_str()))?;

            let target = BindTarget { consumer, upstream: &upstream, path_prefix };
            let outcome = if upstream.valid_register_id == register_id {
                self.recover(&mut session, target, register_id).await
            } else {
                self.advance(&mut session, target, register_id, mode).await
            };

            let summary = match outcome {
                Ok(Some(summary)) => summary,
                Ok(None) => {
                    session.rollback().await?;
                    info!("Nothing to reconcile");
                    return Ok(ReconcileSummary::default());
                }
                Err(e) => {
                    session.rollback().await?;
                    return Err(e);
                }
            };

            upstream.valid_register_id = register_id.to_string();
            session.update(&upstream).await?;
            session.commit().await?;
            info!(
                added = summary.added,
                updated = summary.updated,
                deleted = summary.deleted,
                skipped = summary.skipped,
                recovered = summary.recovered,
                "Upstream generation reconciled"
            );
            Ok(summary)
        }
        .instrument(span)
        .await
    }

    async fn generation(
        &self,
        session: &mut Session,
        upstream_id: &UpstreamId,
        register_id: &str,
    ) -> Result<Option<(RegisterRecord, Vec<UpstreamApi>)>> {
        if register_id.is_empty() {
            return Ok(None);
        }
        let Some(record) = session
            .get_by::<RegisterRecord>(&RegisterRecordFilter {
                upstream_id: Some(upstream_id.clone()),
                register_id: Some(register_id.to_string()),
                ..Default::default()
            })
            .await?
        else {
            return Ok(None);
        };
        let apis = if record.upstream_apis.is_empty() {
            Vec::new()
        } else {
            session
                .select::<UpstreamApi>(&UpstreamApiFilter {
                    ids: Some(record.upstream_apis.0.clone()),
                    ..Default::default()
                })
                .await?
        };
        Ok(Some((record, apis)))
    }

    /// Re-drive the missing entries of the current generation
    async fn recover(
        &self,
        session: &mut Session,
        target: BindTarget<'_>,
        register_id: &str,
    ) -> Result<Option<ReconcileSummary>> {
        let Some((_, apis)) = self.generation(session, &target.upstream.id, register_id).await? else {
            return Ok(None);
        };
        let missing: Vec<UpstreamApi> = apis.into_iter().filter(|api| api.deleted).collect();
        if missing.is_empty() {
            return Ok(None);
        }

        let plan = GenerationPlan { adds: missing, ..Default::default() };
        let mut summary = self.apply(session, target, plan).await?;
        summary.recovered = summary.added;
        Ok(Some(summary))
    }

    /// Move to a new generation
    async fn advance(
        &self,
        session: &mut Session,
        target: BindTarget<'_>,
        register_id: &str,
        mode: RegisterMode,
    ) -> Result<Option<ReconcileSummary>> {
        let upstream = target.upstream;
        let (mut record, new) = self
            .generation(session, &upstream.id, register_id)
            .await?
            .ok_or_else(|| RouteplaneError::not_found("RegisterRecord", register_id))?;
        let old = match self.generation(session, &upstream.id, &upstream.valid_register_id).await? {
            Some((_, apis)) => apis,
            None => Vec::new(),
        };

        let mut plan = plan_generation(&old, &new, mode);
        if !plan.carried.is_empty() {
            record.upstream_apis.0.extend(plan.carried.drain(..));
            session.update(&record).await?;
        }
        for (mut api, prev) in std::mem::take(&mut plan.unchanged) {
            if self.binder.is_bound(session, &api).await? {
                session.update(&api).await?;
                self.binder.adopt(session, &api).await?;
            } else {
                api.api_id.clear();
                plan.adds.push(api);
            }
            self.supersede(session, prev).await?;
        }
        self.apply(session, target, plan).await.map(Some)
    }

    /// Drop the route id from an entry another generation took over, so
    /// the binding has exactly one owning entry
    async fn supersede(&self, session: &mut Session, mut prev: UpstreamApi) -> Result<()> {
        prev.api_id.clear();
        session.update(&prev).await
    }

    async fn apply(&self, session: &mut Session, target: BindTarget<'_>, plan: GenerationPlan) -> Result<ReconcileSummary> {
        let mut summary = ReconcileSummary::default();
        let mut journal: Vec<Applied> = Vec::new();

        match self.run_batches(session, target, plan, &mut summary, &mut journal).await {
            Ok(()) => Ok(summary),
            Err(e) => {
                error!(error = %e, applied = journal.len(), "Reconciliation aborted, undoing applied changes");
                self.compensate(session, target, journal).await;
                Err(e)
            }
        }
    }

    async fn run_batches(
        &self,
        session: &mut Session,
        target: BindTarget<'_>,
        plan: GenerationPlan,
        summary: &mut ReconcileSummary,
        journal: &mut Vec<Applied>,
    ) -> Result<()> {
        let pacer = Pacer { settings: &self.settings };

        let mut adds = plan.adds;
        let mut updates = Vec::with_capacity(plan.updates.len());
        for (mut api, backup) in plan.updates {
            if self.binder.is_bound(session, &api).await? {
                updates.push((api, backup));
            } else {
                warn!(api = %api.api_name, api_id = %api.api_id, "Bound route is gone, binding again");
                api.api_id.clear();
                self.supersede(session, backup).await?;
                adds.push(api);
            }
        }

        let total = adds.len();
        for (i, mut api) in adds.into_iter().enumerate() {
            match self.binder.bind(session, target, &api).await {
                Ok(id) => {
                    api.api_id = id.into_string();
                    api.deleted = false;
                    journal.push(Applied::Added(api.clone()));
                    session.update(&api).await?;
                    summary.added += 1;
                }
                Err(e) if e.is_skippable() => {
                    warn!(error = %e, api = %api.api_name, "Skipping api the backend refused");
                    summary.skipped += 1;
                }
                Err(e) => return Err(e),
            }
            pacer.after(i + 1, total).await;
        }

        let total = updates.len();
        for (i, (api, backup)) in updates.into_iter().enumerate() {
            match self.binder.rebind(session, target, &api).await {
                Ok(()) => {
                    session.update(&api).await?;
                    self.supersede(session, backup.clone()).await?;
                    journal.push(Applied::Updated { backup });
                    summary.updated += 1;
                }
                Err(e) if e.is_skippable() => {
                    warn!(error = %e, api = %api.api_name, "Skipping api the backend refused");
                    summary.skipped += 1;
                }
                Err(e) => return Err(e),
            }
            pacer.after(i + 1, total).await;
        }

        let total = plan.dels.len();
        for (i, api) in plan.dels.into_iter().enumerate() {
            match self.binder.unbind(session, target.upstream, &api).await {
                Ok(Some(row)) => {
                    journal.push(Applied::Deleted(row));
                    summary.deleted += 1;
                }
                Ok(None) => {}
                Err(e) if e.is_skippable() => {
                    warn!(error = %e, api = %api.api_name, "Skipping api the backend refused");
                    summary.skipped += 1;
                }
                Err(e) => return Err(e),
            }
            pacer.after(i + 1, total).await;
        }
        Ok(())
    }

    /// Undo applied changes, newest first. Failures are logged and the
    /// remaining undos still run.
    async fn compensate(&self, session: &mut Session, target: BindTarget<'_>, journal: Vec<Applied>) {
        for applied in journal.into_iter().rev() {
            let result = match &applied {
                Applied::Deleted(row) => self.binder.restore(session, target.upstream, row).await,
                Applied::Updated { backup } => self.binder.rebind(session, target, backup).await,
                Applied::Added(api) => self.binder.unbind(session, target.upstream, api).await.map(|_| ()),
            };
            if let Err(e) = result {
                warn!(error = %e, change = ?applied, "Failed to undo backend change");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sqlx::types::Json;

    fn api(name: &str, method: &str, address: &str, api_id: &str) -> UpstreamApi {
        UpstreamApi {
            id: UpstreamApiId::new(),
            upstream_id: UpstreamId::from("u1"),
            register_id: "r".to_string(),
            api_name: name.to_string(),
            path: name.to_string(),
            gateway_path: String::new(),
            method: method.to_string(),
            address: address.to_string(),
            domains: String::new(),
            doc: Json(serde_json::Value::Null),
            is_inner: false,
            api_id: api_id.to_string(),
            deleted: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn key_tolerates_trailing_slash() {
        assert_eq!(api_key("/orders/"), "/orders");
        assert_eq!(api_key("root"), "/");
        assert_eq!(api_key(""), "/");
        assert_eq!(api_key("/"), "/");
    }

    #[test]
    fn identical_entries_take_over_route() {
        let old = vec![api("/a", "GET", "http://s", "g1")];
        let new = vec![api("/a/", "GET", "http://s", "")];
        let plan = plan_generation(&old, &new, RegisterMode::Replace);
        assert!(plan.is_noop());
        assert_eq!(plan.unchanged.len(), 1);
        let (next, prev) = &plan.unchanged[0];
        assert_eq!(next.api_id, "g1");
        assert_eq!(prev.id, old[0].id);
    }

    #[test]
    fn changed_address_is_update_with_backup() {
        let old = vec![api("/a", "GET", "http://s", "g1")];
        let new = vec![api("/a", "GET", "http://t", "")];
        let plan = plan_generation(&old, &new, RegisterMode::Replace);
        assert_eq!(plan.updates.len(), 1);
        let (next, backup) = &plan.updates[0];
        assert_eq!(next.api_id, "g1");
        assert_eq!(backup.address, "http://s");
    }

    #[test]
    fn replace_deletes_what_append_carries() {
        let old = vec![api("/a", "GET", "http://s", "g1"), api("/b", "GET", "http://s", "g2")];
        let new = vec![api("/a", "GET", "http://s", "")];

        let replace = plan_generation(&old, &new, RegisterMode::Replace);
        assert_eq!(replace.dels.len(), 1);
        assert_eq!(replace.dels[0].api_id, "g2");
        assert!(replace.carried.is_empty());

        let append = plan_generation(&old, &new, RegisterMode::Append);
        assert!(append.dels.is_empty());
        assert_eq!(append.carried, vec![old[1].id.clone()]);
    }

    #[test]
    fn method_change_replaces_route() {
        let old = vec![api("/a", "GET", "http://s", "g1")];
        let new = vec![api("/a", "POST", "http://s", "")];
        let plan = plan_generation(&old, &new, RegisterMode::Replace);
        assert_eq!(plan.dels.len(), 1);
        assert_eq!(plan.adds.len(), 1);
        assert!(plan.updates.is_empty());
    }

    #[test]
    fn unbound_match_is_added() {
        let old = vec![api("/a", "GET", "http://s", "")];
        let new = vec![api("/a", "GET", "http://s", "")];
        let plan = plan_generation(&old, &new, RegisterMode::Replace);
        assert_eq!(plan.adds.len(), 1);
        assert!(plan.dels.is_empty());
    }

    #[test]
    fn duplicate_new_entries_bind_once_each() {
        let old = vec![api("/a", "GET", "http://s", "g1")];
        let new = vec![api("/a", "GET", "http://s", ""), api("/a/", "GET", "http://s", "")];
        let plan = plan_generation(&old, &new, RegisterMode::Replace);
        assert_eq!(plan.unchanged.len(), 1);
        assert_eq!(plan.adds.len(), 1);
    }
}
