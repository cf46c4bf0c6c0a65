//! Domain ownership registry
//!
//! Allocates hostnames to runtime services, packages and platform
//! components. Every allocation diffs the owner's desired set against its
//! current rows and refuses domains another owner already holds within the
//! cluster. Callers run the whole call inside their session so that a
//! rejected allocation leaves no partial writes behind once rolled back.

use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::config::GatewaySettings;
use crate::domain::{DomainId, DomainRecord, DomainType, Package, PackageId, RuntimeService, Scene};
use crate::errors::{Result, RouteplaneError};
use crate::gateway::GatewayResolver;
use crate::storage::{DomainFilter, PackageFilter, Session};

/// One desired binding of an owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainEntry {
    pub domain: String,
    pub domain_type: DomainType,
}

impl DomainEntry {
    pub fn new(domain: impl Into<String>, domain_type: DomainType) -> Self {
        Self { domain: domain.into(), domain_type }
    }
}

/// Who a domain row belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainOwner {
    RuntimeService { id: String },
    Package { id: PackageId, name: String, runtime_service_id: String, scene: Scene },
    Component { name: String },
}

impl DomainOwner {
    pub fn of_package(package: &Package) -> Self {
        Self::Package {
            id: package.id.clone(),
            name: package.name.clone(),
            runtime_service_id: package.runtime_service_id.clone(),
            scene: package.scene,
        }
    }

    fn filter(&self) -> DomainFilter {
        match self {
            DomainOwner::RuntimeService { id } => DomainFilter {
                runtime_service_id: Some(id.clone()),
                package_id: Some(String::new()),
                ..Default::default()
            },
            DomainOwner::Package { id, .. } => DomainFilter {
                package_id: Some(id.to_string()),
                ..Default::default()
            },
            DomainOwner::Component { name } => DomainFilter {
                component_name: Some(name.clone()),
                domain_type: Some(DomainType::Component),
                ..Default::default()
            },
        }
    }

    fn owns(&self, row: &DomainRecord) -> bool {
        match self {
            DomainOwner::RuntimeService { id } => {
                row.package_id.is_empty() && row.runtime_service_id == *id
            }
            DomainOwner::Package { id, .. } => row.package_id == id.as_str(),
            DomainOwner::Component { name } => {
                row.domain_type == DomainType::Component && row.component_name == *name
            }
        }
    }

    fn record(&self, scope: &DomainScope, entry: &DomainEntry) -> DomainRecord {
        let mut record = DomainRecord {
            id: DomainId::new(),
            domain: entry.domain.clone(),
            cluster_name: scope.cluster_name.clone(),
            domain_type: entry.domain_type,
            runtime_service_id: String::new(),
            package_id: String::new(),
            package_name: String::new(),
            component_name: String::new(),
            org_id: scope.org_id.clone(),
            project_id: scope.project_id.clone(),
            env: scope.env.clone(),
            created_at: Utc::now(),
        };
        match self {
            DomainOwner::RuntimeService { id } => record.runtime_service_id = id.clone(),
            DomainOwner::Package { id, name, .. } => {
                record.package_id = id.to_string();
                record.package_name = name.clone();
            }
            DomainOwner::Component { name } => record.component_name = name.clone(),
        }
        record
    }
}

/// Tenant and cluster a set of domain rows is written under
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainScope {
    pub cluster_name: String,
    pub org_id: String,
    pub project_id: String,
    pub env: String,
}

impl DomainScope {
    pub fn of_package(package: &Package) -> Self {
        Self {
            cluster_name: package.cluster_name.clone(),
            org_id: package.org_id.clone(),
            project_id: package.project_id.clone(),
            env: package.env.clone(),
        }
    }

    pub fn of_runtime(service: &RuntimeService, org_id: &str) -> Self {
        Self {
            cluster_name: service.cluster_name.clone(),
            org_id: org_id.to_string(),
            project_id: service.project_id.clone(),
            env: service.env.clone(),
        }
    }
}

/// Outcome of diffing an owner's desired domains against its rows
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DomainDiff {
    pub adds: Vec<DomainEntry>,
    pub dels: Vec<DomainRecord>,
    /// Existing rows carrying their new type
    pub updates: Vec<DomainRecord>,
}

impl DomainDiff {
    pub fn is_empty(&self) -> bool {
        self.adds.is_empty() && self.dels.is_empty() && self.updates.is_empty()
    }

    pub fn added_domains(&self) -> Vec<String> {
        self.adds.iter().map(|a| a.domain.clone()).collect()
    }

    pub fn deleted_domains(&self) -> Vec<String> {
        self.dels.iter().map(|d| d.domain.clone()).collect()
    }
}

/// Result of touching a runtime service's domains
#[derive(Debug, Clone, Default)]
pub struct RuntimeDomainChange {
    pub diff: DomainDiff,
    /// Package mirroring the service whose domains changed as a consequence
    pub changed_package: Option<Package>,
}

/// Compare desired entries with existing rows by exact domain string.
pub fn diff_domains(desired: &[DomainEntry], existing: Vec<DomainRecord>) -> DomainDiff {
    let mut remaining = existing;
    let mut diff = DomainDiff::default();
    for entry in desired {
        match remaining.iter().position(|row| row.domain == entry.domain) {
            Some(index) => {
                let mut row = remaining.remove(index);
                if row.domain_type != entry.domain_type {
                    row.domain_type = entry.domain_type;
                    diff.updates.push(row);
                }
            }
            None => diff.adds.push(entry.clone()),
        }
    }
    diff.dels = remaining;
    diff
}

/// Drop repeated domains, first occurrence wins
pub fn uniq_domains(entries: Vec<DomainEntry>) -> Vec<DomainEntry> {
    let mut seen = BTreeSet::new();
    entries.into_iter().filter(|entry| seen.insert(entry.domain.clone())).collect()
}

/// Order by reversed string so subdomains of one parent sit together
pub fn sort_domains(domains: &mut [String]) {
    domains.sort_by(|a, b| a.chars().rev().cmp(b.chars().rev()));
}

/// Trim, drop blanks and duplicates, then sort by suffix
pub fn normalize_domains<I, S>(domains: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = BTreeSet::new();
    let mut result: Vec<String> = domains
        .into_iter()
        .map(|d| d.as_ref().trim().to_string())
        .filter(|d| !d.is_empty() && seen.insert(d.clone()))
        .collect();
    sort_domains(&mut result);
    result
}

/// Domain ownership allocation and lookup
#[derive(Debug, Clone)]
pub struct DomainRegistry {
    resolver: Arc<dyn GatewayResolver>,
    gateway: GatewaySettings,
}

impl DomainRegistry {
    pub fn new(resolver: Arc<dyn GatewayResolver>, gateway: GatewaySettings) -> Self {
        Self { resolver, gateway }
    }

    /// Bring an owner's rows in line with `desired`.
    ///
    /// Each add is checked against every row holding the same domain in the
    /// cluster before it is written. The first conflict aborts the call.
    #[instrument(skip(self, session, desired), fields(cluster = %scope.cluster_name), name = "domain_allocate")]
    pub async fn allocate_or_diff(
        &self,
        session: &mut Session,
        scope: &DomainScope,
        owner: &DomainOwner,
        desired: Vec<DomainEntry>,
    ) -> Result<DomainDiff> {
        let desired = uniq_domains(desired);
        let current = session.select::<DomainRecord>(&owner.filter()).await?;
        let diff = diff_domains(&desired, current);

        for add in &diff.adds {
            self.check_available(session, scope, owner, &add.domain).await?;
            session.insert(&owner.record(scope, add)).await?;
        }
        for row in &diff.updates {
            session.update(row).await?;
        }
        for row in &diff.dels {
            session.delete_by_id::<DomainRecord>(&row.id).await?;
        }

        if !diff.is_empty() {
            info!(
                cluster = %scope.cluster_name,
                added = diff.adds.len(),
                removed = diff.dels.len(),
                updated = diff.updates.len(),
                "Domain bindings changed"
            );
        }
        Ok(diff)
    }

    async fn check_available(
        &self,
        session: &mut Session,
        scope: &DomainScope,
        owner: &DomainOwner,
        domain: &str,
    ) -> Result<()> {
        // shared entries are keyed by their whole domain set instead
        if let DomainOwner::Package { scene, .. } = owner {
            if scene.is_shared_entry() {
                return Ok(());
            }
        }
        let holders = session
            .select::<DomainRecord>(&DomainFilter {
                domain: Some(domain.to_string()),
                cluster_name: Some(scope.cluster_name.clone()),
                ..Default::default()
            })
            .await?;

        for row in holders {
            if owner.owns(&row) || self.compatible(session, owner, &row).await? {
                continue;
            }
            debug!(domain, holder = %row.owner_description(), "Domain allocation refused");
            return Err(RouteplaneError::conflict(
                format!("domain {} already used by {}", domain, row.owner_description()),
                "domain",
            ));
        }
        Ok(())
    }

    /// A package may share domains with the runtime service it mirrors
    async fn compatible(&self, session: &mut Session, owner: &DomainOwner, row: &DomainRecord) -> Result<bool> {
        match (owner, row.domain_type) {
            (
                DomainOwner::Package { runtime_service_id, .. },
                DomainType::ServiceDefault | DomainType::ServiceCustom,
            ) => Ok(!runtime_service_id.is_empty() && row.runtime_service_id == *runtime_service_id),
            (DomainOwner::RuntimeService { id }, DomainType::Package) => {
                let package = session.get::<Package>(&PackageId::from(row.package_id.as_str())).await?;
                Ok(package.is_some_and(|p| p.runtime_service_id == *id))
            }
            _ => Ok(false),
        }
    }

    /// Current holder of a domain in a cluster
    pub async fn find_owner(
        &self,
        session: &mut Session,
        cluster_name: &str,
        domain: &str,
    ) -> Result<Option<DomainRecord>> {
        session
            .get_by::<DomainRecord>(&DomainFilter {
                domain: Some(domain.to_string()),
                cluster_name: Some(cluster_name.to_string()),
                ..Default::default()
            })
            .await
    }

    /// Set a package's domains, returning the normalized list applied
    pub async fn touch_package_domain(
        &self,
        session: &mut Session,
        package: &Package,
        domains: &[String],
    ) -> Result<Vec<String>> {
        let normalized = normalize_domains(domains);
        let entries = normalized
            .iter()
            .map(|d| DomainEntry::new(d.clone(), DomainType::Package))
            .collect();
        self.allocate_or_diff(
            session,
            &DomainScope::of_package(package),
            &DomainOwner::of_package(package),
            entries,
        )
        .await?;
        Ok(normalized)
    }

    /// Set a runtime service's domains and mirror the change onto the
    /// package publishing that service, when it routes through ingress.
    #[instrument(skip(self, session, service, entries), fields(runtime_service_id = %service.id), name = "domain_touch_runtime")]
    pub async fn touch_runtime_domain(
        &self,
        session: &mut Session,
        service: &RuntimeService,
        org_id: &str,
        entries: Vec<DomainEntry>,
    ) -> Result<RuntimeDomainChange> {
        let scope = DomainScope::of_runtime(service, org_id);
        let owner = DomainOwner::RuntimeService { id: service.id.to_string() };
        let diff = self.allocate_or_diff(session, &scope, &owner, entries).await?;

        let mut change = RuntimeDomainChange { diff, changed_package: None };
        if change.diff.adds.is_empty() && change.diff.dels.is_empty() {
            return Ok(change);
        }
        if !self.mirrors_to_package(&service.cluster_name) {
            return Ok(change);
        }
        let Some(package) = session
            .get_by::<Package>(&PackageFilter {
                runtime_service_id: Some(service.id.to_string()),
                ..Default::default()
            })
            .await?
        else {
            return Ok(change);
        };

        let removed = change.diff.deleted_domains();
        let mut mirrored: Vec<String> = self
            .get_package_domains(session, &package.id)
            .await?
            .into_iter()
            .filter(|d| !removed.contains(d))
            .collect();
        mirrored.extend(change.diff.added_domains());

        if self.is_package_domains_diff(session, &package.id, &mirrored).await? {
            self.touch_package_domain(session, &package, &mirrored).await?;
            change.changed_package = Some(package);
        }
        Ok(change)
    }

    fn mirrors_to_package(&self, cluster_name: &str) -> bool {
        if self.gateway.use_admin_endpoint {
            return false;
        }
        matches!(self.resolver.cluster(cluster_name), Ok(c) if c.cluster_type.supports_ingress())
    }

    /// Set the domains of a platform component
    pub async fn touch_component_domain(
        &self,
        session: &mut Session,
        scope: &DomainScope,
        component: &str,
        domains: &[String],
    ) -> Result<DomainDiff> {
        let entries = normalize_domains(domains)
            .into_iter()
            .map(|d| DomainEntry::new(d, DomainType::Component))
            .collect();
        self.allocate_or_diff(
            session,
            scope,
            &DomainOwner::Component { name: component.to_string() },
            entries,
        )
        .await
    }

    pub async fn get_package_domains(&self, session: &mut Session, package_id: &PackageId) -> Result<Vec<String>> {
        let rows = session
            .select::<DomainRecord>(&DomainFilter {
                package_id: Some(package_id.to_string()),
                ..Default::default()
            })
            .await?;
        let mut domains: Vec<String> = rows.into_iter().map(|r| r.domain).collect();
        sort_domains(&mut domains);
        Ok(domains)
    }

    pub async fn get_runtime_domains(
        &self,
        session: &mut Session,
        runtime_service_id: &str,
    ) -> Result<Vec<DomainRecord>> {
        session
            .select::<DomainRecord>(&DomainOwner::RuntimeService { id: runtime_service_id.to_string() }.filter())
            .await
    }

    /// Whether `domains` differs from the package's bound set
    pub async fn is_package_domains_diff(
        &self,
        session: &mut Session,
        package_id: &PackageId,
        domains: &[String],
    ) -> Result<bool> {
        let current: BTreeSet<String> = self.get_package_domains(session, package_id).await?.into_iter().collect();
        let desired: BTreeSet<String> = normalize_domains(domains).into_iter().collect();
        Ok(current != desired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::*;
    use crate::gateway::ConfiguredResolver;
    use crate::storage::Store;

    fn row(domain: &str, domain_type: DomainType) -> DomainRecord {
        DomainRecord {
            id: DomainId::new(),
            domain: domain.to_string(),
            cluster_name: "dev".to_string(),
            domain_type,
            runtime_service_id: String::new(),
            package_id: "p1".to_string(),
            package_name: "pkg".to_string(),
            component_name: String::new(),
            org_id: "1".to_string(),
            project_id: "2".to_string(),
            env: "DEV".to_string(),
            created_at: Utc::now(),
        }
    }

    fn entries(domains: &[&str]) -> Vec<DomainEntry> {
        domains.iter().map(|d| DomainEntry::new(*d, DomainType::Package)).collect()
    }

    fn package(name: &str, runtime_service_id: &str) -> Package {
        Package {
            id: PackageId::new(),
            name: name.to_string(),
            description: String::new(),
            scene: Scene::OpenApi,
            auth_type: AuthType::None,
            acl_type: AclType::Off,
            zone_id: ZoneId::new(),
            cluster_name: "dev".to_string(),
            org_id: "1".to_string(),
            project_id: "2".to_string(),
            env: "DEV".to_string(),
            runtime_service_id: runtime_service_id.to_string(),
            created_at: Utc::now(),
        }
    }

    fn registry() -> DomainRegistry {
        DomainRegistry::new(
            Arc::new(ConfiguredResolver::new(Vec::new(), GatewaySettings::default())),
            GatewaySettings::default(),
        )
    }

    #[test]
    fn diff_reports_adds_and_dels() {
        let diff = diff_domains(
            &entries(&["1.com", "2.com"]),
            vec![row("1.com", DomainType::Package), row("3.com", DomainType::Package)],
        );
        assert_eq!(diff.added_domains(), vec!["2.com"]);
        assert_eq!(diff.deleted_domains(), vec!["3.com"]);
        assert!(diff.updates.is_empty());
    }

    #[test]
    fn diff_against_empty_desired_deletes_everything() {
        let diff = diff_domains(
            &[],
            vec![row("1.com", DomainType::Package), row("3.com", DomainType::Package)],
        );
        assert!(diff.adds.is_empty());
        assert_eq!(diff.deleted_domains(), vec!["1.com", "3.com"]);
    }

    #[test]
    fn diff_detects_type_change() {
        let desired = vec![DomainEntry::new("a.com", DomainType::ServiceCustom)];
        let diff = diff_domains(&desired, vec![row("a.com", DomainType::ServiceDefault)]);
        assert!(diff.adds.is_empty() && diff.dels.is_empty());
        assert_eq!(diff.updates.len(), 1);
        assert_eq!(diff.updates[0].domain_type, DomainType::ServiceCustom);
    }

    #[test]
    fn uniq_keeps_first_occurrence() {
        let input = vec![
            DomainEntry::new("a.com", DomainType::ServiceCustom),
            DomainEntry::new("a.com", DomainType::ServiceDefault),
            DomainEntry::new("b.com", DomainType::ServiceDefault),
        ];
        let uniq = uniq_domains(input);
        assert_eq!(uniq.len(), 2);
        assert_eq!(uniq[0].domain_type, DomainType::ServiceCustom);
    }

    #[test]
    fn normalize_trims_dedups_and_sorts_by_suffix() {
        let normalized = normalize_domains([" b.example.com", "a.other.io", "", "a.example.com", "b.example.com"]);
        assert_eq!(normalized, vec!["a.example.com", "b.example.com", "a.other.io"]);
    }

    #[tokio::test]
    async fn second_package_cannot_take_a_bound_domain() {
        let store = Store::memory();
        let registry = registry();
        let first = package("first", "");
        let second = package("second", "");

        let mut session = store.begin().await.unwrap();
        registry
            .touch_package_domain(&mut session, &first, &["api.example.com".to_string()])
            .await
            .unwrap();
        let err = registry
            .touch_package_domain(&mut session, &second, &["api.example.com".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, RouteplaneError::Conflict { .. }));
        assert!(err.to_string().contains("endpoint first"));

        let owner = registry.find_owner(&mut session, "dev", "api.example.com").await.unwrap().unwrap();
        assert_eq!(owner.package_id, first.id.as_str());
    }

    #[tokio::test]
    async fn package_shares_domains_with_its_runtime_service() {
        let store = Store::memory();
        let registry = registry();
        let mut session = store.begin().await.unwrap();

        let scope = DomainScope { cluster_name: "dev".to_string(), ..Default::default() };
        registry
            .allocate_or_diff(
                &mut session,
                &scope,
                &DomainOwner::RuntimeService { id: "rs-1".to_string() },
                vec![DomainEntry::new("web.example.com", DomainType::ServiceDefault)],
            )
            .await
            .unwrap();

        let mirror = package("mirror", "rs-1");
        registry
            .touch_package_domain(&mut session, &mirror, &["web.example.com".to_string()])
            .await
            .unwrap();

        let stranger = package("stranger", "rs-2");
        assert!(registry
            .touch_package_domain(&mut session, &stranger, &["web.example.com".to_string()])
            .await
            .is_err());
    }

    #[tokio::test]
    async fn package_domain_diff_is_set_based() {
        let store = Store::memory();
        let registry = registry();
        let pkg = package("pkg", "");
        let mut session = store.begin().await.unwrap();
        registry
            .touch_package_domain(&mut session, &pkg, &["a.com".to_string(), "b.com".to_string()])
            .await
            .unwrap();

        let same = vec!["b.com".to_string(), " a.com".to_string()];
        assert!(!registry.is_package_domains_diff(&mut session, &pkg.id, &same).await.unwrap());
        let other = vec!["a.com".to_string()];
        assert!(registry.is_package_domains_diff(&mut session, &pkg.id, &other).await.unwrap());
    }

    #[tokio::test]
    async fn component_domains_are_exclusive_until_released() {
        let store = Store::memory();
        let registry = registry();
        let scope = DomainScope { cluster_name: "dev".to_string(), ..Default::default() };
        let mut session = store.begin().await.unwrap();

        let diff = registry
            .touch_component_domain(&mut session, &scope, "console", &["console.example.com".to_string()])
            .await
            .unwrap();
        assert_eq!(diff.added_domains(), vec!["console.example.com"]);

        let pkg = package("grabber", "");
        let err = registry
            .touch_package_domain(&mut session, &pkg, &["console.example.com".to_string()])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("component console"));
        assert!(registry
            .touch_component_domain(&mut session, &scope, "monitor", &["console.example.com".to_string()])
            .await
            .is_err());

        let again = registry
            .touch_component_domain(&mut session, &scope, "console", &["console.example.com".to_string()])
            .await
            .unwrap();
        assert!(again.is_empty());

        let moved = registry
            .touch_component_domain(&mut session, &scope, "console", &["admin.example.com".to_string()])
            .await
            .unwrap();
        assert_eq!(moved.deleted_domains(), vec!["console.example.com"]);
        registry
            .touch_component_domain(&mut session, &scope, "monitor", &["console.example.com".to_string()])
            .await
            .unwrap();
        let owner = registry.find_owner(&mut session, "dev", "console.example.com").await.unwrap().unwrap();
        assert_eq!(owner.component_name, "monitor");
    }
}
