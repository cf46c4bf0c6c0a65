//! Rule/policy compiler
//!
//! Package rules are backend plugin instances created disabled; what turns
//! them on for a request is the zone policy compiled here: enabled and
//! disabled plugin ids, a host/path regex and a priority per zone, flushed
//! to the backend through the cluster's domain policy.

use chrono::Utc;
use serde_json::{json, Value};
use sqlx::types::Json;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::PolicySettings;
use crate::domain::{
    AclType, AuthType, Consumer, ConsumerId, GatewayProvider, LimitSpec, Package, PackageApi,
    PackageApiId, PackageRule, RedirectType, RuleCategory, RuleId, Zone, ZoneId, ZonePolicy,
    ZonePolicySet,
};
use crate::errors::{Result, RouteplaneError};
use crate::gateway::dto::PluginRequest;
use crate::gateway::{GatewayAdapter, GatewayResolver};
use crate::services::domain_registry::DomainRegistry;
use crate::services::zone_service::ZoneService;
use crate::storage::{PackageApiFilter, PackageRuleFilter, Session, ZonePolicyFilter};

pub const ACL_PLUGIN: &str = "acl";
pub const RATE_LIMIT_PLUGIN: &str = "rate-limiting";
/// Consumer name the mesh gateway needs in an otherwise empty whitelist
pub const MESH_DEFAULT_CONSUMER: &str = "default";
const MESH_DEFAULT_CONSUMER_KEY: &str = "default-key";
const MESH_DEFAULT_CONSUMER_SECRET: &str = "default-secret";

/// Desired state of one package rule
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleSpec {
    pub name: String,
    /// Empty for package-wide rules
    pub package_api_id: String,
    pub package_zone_need: bool,
    pub category: RuleCategory,
    pub plugin_name: String,
    pub config: Value,
    pub consumer_id: String,
    pub consumer_name: String,
    pub enabled: bool,
    /// `false` for rules enforced outside the gateway backend
    pub kong_plugin: bool,
}

impl RuleSpec {
    fn package_wide(category: RuleCategory, plugin_name: &str, config: Value, enabled: bool) -> Self {
        Self {
            name: plugin_name.to_string(),
            package_zone_need: true,
            category,
            plugin_name: plugin_name.to_string(),
            config,
            enabled,
            kong_plugin: true,
            ..Default::default()
        }
    }
}

/// Escape a domain into a regex fragment; `*` matches any label prefix.
pub fn domain_regex(domain: &str) -> String {
    domain.replace('.', r"\.").replace('*', ".+")
}

/// Zone priority of a package: wildcard domains sort below exact ones
pub fn package_priority(policy: &PolicySettings, domains: &[String]) -> i32 {
    if domains.iter().any(|d| d.contains('*')) {
        policy.wildcard_base_priority
    } else {
        policy.base_priority
    }
}

/// Drop ACL rules when the package is guarded by cloud app auth
pub fn drop_acl_on_aliyun_app(rules: Vec<PackageRule>) -> Vec<PackageRule> {
    let has_aliyun_app = rules.iter().any(|r| r.plugin_name == AuthType::AliyunApp.as_str());
    if !has_aliyun_app {
        return rules;
    }
    rules.into_iter().filter(|r| r.plugin_name != ACL_PLUGIN).collect()
}

/// Path matched by a route's zone regex
pub fn route_match_path(api: &PackageApi) -> String {
    match api.redirect_type {
        RedirectType::Service if !api.runtime_service_id.is_empty() => {
            format!("/{}{}", api.runtime_service_id, api.redirect_path)
        }
        RedirectType::Service => api.redirect_path.clone(),
        RedirectType::Url => api.api_path.clone(),
    }
}

/// Package-level inputs shared by the package zone and every route zone
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PackagePolicyBase {
    pub priority: i32,
    pub regex_domains: Vec<String>,
    pub enables: Vec<String>,
    pub disables: Vec<String>,
    /// Which of `enables` is the package ACL plugin, if any
    pub acl_plugin_id: Option<String>,
}

impl PackagePolicyBase {
    /// Compile package rules and domains, rules in category order then age
    pub fn compile(policy: &PolicySettings, rules: Vec<PackageRule>, domains: &[String]) -> Self {
        let mut rules = drop_acl_on_aliyun_app(rules);
        rules.sort_by(|a, b| {
            a.category
                .order()
                .cmp(&b.category.order())
                .then(a.created_at.cmp(&b.created_at))
        });
        let mut base = Self {
            priority: package_priority(policy, domains),
            regex_domains: domains.iter().map(|d| domain_regex(d)).collect(),
            ..Default::default()
        };
        for rule in rules.iter().filter(|r| r.kong_plugin) {
            if rule.enabled {
                if rule.category == RuleCategory::Acl {
                    base.acl_plugin_id = Some(rule.plugin_id.clone());
                }
                base.enables.push(rule.plugin_id.clone());
            } else {
                base.disables.push(rule.plugin_id.clone());
            }
        }
        base
    }

    /// Policy of the package zone, `None` when nothing is attached
    pub fn package_zone(&self, zone_policies: &[ZonePolicy], package_name: &str) -> Option<ZonePolicySet> {
        let mut enables = self.enables.clone();
        let mut disables = self.disables.clone();
        split_zone_policies(zone_policies, &mut enables, &mut disables);
        if enables.is_empty() && disables.is_empty() {
            return None;
        }
        Some(ZonePolicySet {
            enables: enables.join(","),
            disables: disables.join(","),
            regex: format!(r"^({})(\/[^.]*)?$", self.regex_domains.join("|")),
            priority: self.priority,
            package_name: package_name.to_string(),
        })
    }

    /// Policy of a route zone. `None` means the route adds nothing of its own
    /// and its zone carries no policy.
    pub fn route_zone(
        &self,
        api: &PackageApi,
        zone_policies: &[ZonePolicy],
        api_rules: &[PackageRule],
        package_name: &str,
    ) -> Option<ZonePolicySet> {
        let mut enables = Vec::new();
        let mut disables = Vec::new();
        split_zone_policies(zone_policies, &mut enables, &mut disables);

        let mut route_acl = None;
        for rule in api_rules.iter().filter(|r| !r.package_zone_need) {
            if rule.enabled {
                if rule.category == RuleCategory::Acl {
                    route_acl = Some(rule.plugin_id.clone());
                    continue;
                }
                enables.push(rule.plugin_id.clone());
            } else {
                disables.push(rule.plugin_id.clone());
            }
        }
        if enables.is_empty() && disables.is_empty() && route_acl.is_none() {
            return None;
        }

        let mut full_enables = self.enables.clone();
        if let (Some(route_acl), Some(package_acl)) = (&route_acl, &self.acl_plugin_id) {
            if let Some(slot) = full_enables.iter_mut().find(|id| *id == package_acl) {
                *slot = route_acl.clone();
            }
        }
        full_enables.extend(enables);
        let mut full_disables = self.disables.clone();
        full_disables.extend(disables);

        let path = route_match_path(api);
        let alternatives: Vec<String> = self.regex_domains.iter().map(|d| format!("{}{}", d, path)).collect();
        Some(ZonePolicySet {
            enables: full_enables.join(","),
            disables: full_disables.join(","),
            regex: format!("^({})", alternatives.join("|")),
            priority: self.priority + path.len() as i32,
            package_name: package_name.to_string(),
        })
    }
}

fn split_zone_policies(policies: &[ZonePolicy], enables: &mut Vec<String>, disables: &mut Vec<String>) {
    for policy in policies {
        if policy.enabled {
            enables.push(policy.plugin_id.clone());
        } else {
            disables.push(policy.plugin_id.clone());
        }
    }
}

/// ACL whitelist config in the provider's shape
pub fn acl_whitelist(provider: GatewayProvider, consumer_names: &[String]) -> Value {
    match provider {
        GatewayProvider::Mse => {
            let mut consumers: Vec<Value> = consumer_names.iter().map(|n| json!({ "name": n })).collect();
            if consumers.is_empty() {
                consumers.push(json!({ "name": MESH_DEFAULT_CONSUMER }));
            }
            json!({ "whitelist": consumers })
        }
        _ => {
            let whitelist = if consumer_names.is_empty() { ",".to_string() } else { consumer_names.join(",") };
            json!({ "whitelist": whitelist })
        }
    }
}

/// Package ACL rule: enabled for `on`, attached but disabled for `off`
pub fn acl_rule(provider: GatewayProvider, acl_type: AclType, consumer_names: &[String]) -> Result<RuleSpec> {
    let enabled = match acl_type {
        AclType::On => true,
        AclType::Off => false,
        AclType::Inherit => {
            return Err(RouteplaneError::validation_field("acl type must be on or off", "acl_type"))
        }
    };
    Ok(RuleSpec::package_wide(RuleCategory::Acl, ACL_PLUGIN, acl_whitelist(provider, consumer_names), enabled))
}

/// Package auth rule for the given auth type
pub async fn auth_rule(
    adapter: &dyn GatewayAdapter,
    auth_type: AuthType,
    consumer_names: &[String],
) -> Result<RuleSpec> {
    let config = match (adapter.provider(), auth_type) {
        (_, AuthType::None) => {
            return Err(RouteplaneError::validation_field("auth type is required", "auth_type"))
        }
        (_, AuthType::AliyunApp) => {
            let mut rule = RuleSpec::package_wide(RuleCategory::Auth, auth_type.as_str(), Value::Null, true);
            rule.kong_plugin = false;
            return Ok(rule);
        }
        (_, AuthType::OAuth2) => json!({ "enable_client_credentials": true, "global_credentials": true }),
        (GatewayProvider::Mse, AuthType::KeyAuth) => acl_whitelist(GatewayProvider::Mse, consumer_names),
        (GatewayProvider::Mse, _) => {
            let mut consumers: Vec<Value> = consumer_names.iter().map(|n| json!({ "name": n })).collect();
            if consumers.is_empty() {
                consumers.push(json!({
                    "name": MESH_DEFAULT_CONSUMER,
                    "key": MESH_DEFAULT_CONSUMER_KEY,
                    "secret": MESH_DEFAULT_CONSUMER_SECRET,
                }));
            }
            json!({ "whitelist": consumers })
        }
        (_, AuthType::KeyAuth) => json!({ "key_names": ["appKey", "x-app-key"], "hide_credentials": true }),
        (_, AuthType::SignAuth) => json!({ "key_name": "appKey" }),
        (_, AuthType::HmacAuth) => json!({ "validate_request_body": true }),
    };

    let needs_check = adapter.provider() == GatewayProvider::Mse || auth_type == AuthType::HmacAuth;
    if needs_check && !adapter.check_plugin_enabled(auth_type.as_str()).await? {
        return Err(RouteplaneError::validation(format!(
            "plugin {} is not supported by the gateway of cluster {}",
            auth_type,
            adapter.cluster()
        )));
    }
    Ok(RuleSpec::package_wide(RuleCategory::Auth, auth_type.as_str(), config, true))
}

/// Rate-limit config; the coarsest set unit wins
pub fn limit_config(limit: &LimitSpec) -> Value {
    if let Some(day) = limit.day {
        json!({ "day": day })
    } else if let Some(hour) = limit.hour {
        json!({ "hour": hour })
    } else if let Some(minute) = limit.minute {
        json!({ "minute": minute })
    } else if let Some(second) = limit.second {
        json!({ "second": second })
    } else {
        json!({})
    }
}

/// Stores package rules, mirrors them as backend plugins and compiles the
/// resulting zone policies
#[derive(Debug, Clone)]
pub struct RuleCompiler {
    resolver: Arc<dyn GatewayResolver>,
    domains: DomainRegistry,
    zones: ZoneService,
    policy: PolicySettings,
}

impl RuleCompiler {
    pub fn new(
        resolver: Arc<dyn GatewayResolver>,
        domains: DomainRegistry,
        zones: ZoneService,
        policy: PolicySettings,
    ) -> Self {
        Self { resolver, domains, zones, policy }
    }

    async fn plugin_request(
        &self,
        session: &mut Session,
        spec: &RuleSpec,
        plugin_id: Option<String>,
    ) -> Result<PluginRequest> {
        let mut req = PluginRequest {
            id: plugin_id,
            name: spec.plugin_name.clone(),
            config: spec.config.clone(),
            enabled: false,
            ..Default::default()
        };
        if !spec.consumer_id.is_empty() {
            let consumer = session.must_get::<Consumer>(&ConsumerId::from(spec.consumer_id.as_str())).await?;
            req.consumer_id = Some(consumer.backend_id);
        }
        if !spec.package_api_id.is_empty() {
            let api = session.must_get::<PackageApi>(&PackageApiId::from(spec.package_api_id.as_str())).await?;
            if !api.route_id.is_empty() {
                req.route_id = Some(api.route_id);
            }
        }
        Ok(req)
    }

    /// Create a rule and its backend plugin. A failed insert removes the
    /// plugin again; on mesh the previous config is restored instead.
    #[instrument(skip(self, session, package, spec), fields(package_id = %package.id, plugin = %spec.plugin_name), name = "rule_create")]
    pub async fn create_rule(&self, session: &mut Session, package: &Package, spec: RuleSpec) -> Result<PackageRule> {
        let mut rule = PackageRule {
            id: RuleId::new(),
            name: if spec.name.is_empty() { spec.plugin_name.clone() } else { spec.name.clone() },
            package_id: package.id.clone(),
            package_name: package.name.clone(),
            package_api_id: spec.package_api_id.clone(),
            package_zone_need: spec.package_zone_need,
            category: spec.category,
            plugin_name: spec.plugin_name.clone(),
            plugin_id: String::new(),
            config: Json(spec.config.clone()),
            consumer_id: spec.consumer_id.clone(),
            consumer_name: spec.consumer_name.clone(),
            enabled: spec.enabled,
            kong_plugin: spec.kong_plugin,
            created_at: Utc::now(),
        };
        if !spec.kong_plugin {
            session.insert(&rule).await?;
            return Ok(rule);
        }

        let adapter = self.resolver.adapter(&package.cluster_name).await?;
        let req = self.plugin_request(session, &spec, Some(Uuid::new_v4().to_string())).await?;
        let previous = match adapter.provider() {
            GatewayProvider::Mse => adapter.get_plugin(&req).await?,
            _ => None,
        };
        let plugin = adapter.create_or_update_plugin_by_id(&req).await?;
        rule.plugin_id = plugin.id.clone();

        if let Err(e) = session.insert(&rule).await {
            tracing::error!(error = %e, plugin_id = %plugin.id, "Failed to store rule, undoing plugin");
            let undo = match (adapter.provider(), previous) {
                (GatewayProvider::Mse, Some(previous)) => {
                    let restore = PluginRequest { config: previous.config, ..req };
                    adapter.update_plugin(&restore).await.map(|_| ())
                }
                (GatewayProvider::Mse, None) => Ok(()),
                _ => adapter.remove_plugin(&plugin.id).await,
            };
            if let Err(undo_err) = undo {
                warn!(error = %undo_err, plugin_id = %plugin.id, "Failed to undo plugin after rule insert failure");
            }
            return Err(e);
        }
        info!(rule_id = %rule.id, plugin_id = %rule.plugin_id, "Rule created");
        Ok(rule)
    }

    /// Replace a rule's config and enablement. Package, consumer and plugin
    /// of a rule never change.
    #[instrument(skip(self, session, spec), fields(rule_id = %rule_id), name = "rule_update")]
    pub async fn update_rule(&self, session: &mut Session, rule_id: &RuleId, spec: RuleSpec) -> Result<PackageRule> {
        let mut rule = session.must_get::<PackageRule>(rule_id).await?;
        if spec.consumer_id != rule.consumer_id || spec.plugin_name != rule.plugin_name {
            return Err(RouteplaneError::validation(format!(
                "consumer and plugin of rule {} cannot change",
                rule.id
            )));
        }
        if rule.kong_plugin {
            let package = session.must_get::<Package>(&rule.package_id).await?;
            let adapter = self.resolver.adapter(&package.cluster_name).await?;
            let plugin_id = (!rule.plugin_id.is_empty()).then(|| rule.plugin_id.clone());
            let req = self
                .plugin_request(session, &spec, plugin_id.or_else(|| Some(Uuid::new_v4().to_string())))
                .await?;
            let plugin = adapter.create_or_update_plugin_by_id(&req).await?;
            rule.plugin_id = plugin.id;
        }
        rule.config = Json(spec.config);
        rule.enabled = spec.enabled;
        if !spec.name.is_empty() {
            rule.name = spec.name;
        }
        session.update(&rule).await?;
        info!(rule_id = %rule.id, enabled = rule.enabled, "Rule updated");
        Ok(rule)
    }

    /// Remove a rule's plugin, then the rule
    #[instrument(skip(self, session), fields(rule_id = %rule_id), name = "rule_delete")]
    pub async fn delete_rule(&self, session: &mut Session, rule_id: &RuleId) -> Result<()> {
        let Some(rule) = session.get::<PackageRule>(rule_id).await? else {
            return Ok(());
        };
        if !rule.plugin_id.is_empty() {
            let package = session.must_get::<Package>(&rule.package_id).await?;
            let adapter = self.resolver.adapter(&package.cluster_name).await?;
            adapter.remove_plugin(&rule.plugin_id).await?;
        }
        session.delete_by_id::<PackageRule>(&rule.id).await?;
        info!(rule_id = %rule.id, plugin = %rule.plugin_name, "Rule deleted");
        Ok(())
    }

    pub async fn get_package_rules(
        &self,
        session: &mut Session,
        package: &Package,
        category: Option<RuleCategory>,
    ) -> Result<Vec<PackageRule>> {
        session
            .select::<PackageRule>(&PackageRuleFilter {
                package_id: Some(package.id.clone()),
                package_zone_need: Some(true),
                category,
                ..Default::default()
            })
            .await
    }

    pub async fn get_api_rules(
        &self,
        session: &mut Session,
        api: &PackageApi,
        category: Option<RuleCategory>,
    ) -> Result<Vec<PackageRule>> {
        session
            .select::<PackageRule>(&PackageRuleFilter {
                package_api_id: Some(api.id.to_string()),
                category,
                ..Default::default()
            })
            .await
    }

    /// Remove the package-wide rules of a package
    pub async fn delete_by_package(&self, session: &mut Session, package: &Package) -> Result<()> {
        for rule in self.get_package_rules(session, package, None).await? {
            self.delete_rule(session, &rule.id).await?;
        }
        Ok(())
    }

    /// Remove a route's own rules and recompile the route's zone
    pub async fn delete_by_package_api(&self, session: &mut Session, package: &Package, api: &PackageApi) -> Result<()> {
        for rule in self.get_api_rules(session, api, None).await? {
            self.delete_rule(session, &rule.id).await?;
        }
        self.set_package_api_policies(session, package, api).await
    }

    /// Replace a consumer's rate limits on a package
    #[instrument(skip(self, session, consumer, package, limits), fields(consumer = %consumer.name, package_id = %package.id), name = "rule_limits")]
    pub async fn create_or_update_limit_rule(
        &self,
        session: &mut Session,
        consumer: &Consumer,
        package: &Package,
        limits: &[LimitSpec],
    ) -> Result<()> {
        let existing = session
            .select::<PackageRule>(&PackageRuleFilter {
                package_id: Some(package.id.clone()),
                consumer_id: Some(consumer.id.to_string()),
                category: Some(RuleCategory::Limit),
                ..Default::default()
            })
            .await?;
        for rule in existing {
            self.delete_rule(session, &rule.id).await?;
        }
        for limit in limits.iter().filter(|l| !l.is_empty()) {
            let spec = RuleSpec {
                consumer_id: consumer.id.to_string(),
                consumer_name: consumer.name.clone(),
                ..RuleSpec::package_wide(RuleCategory::Limit, RATE_LIMIT_PLUGIN, limit_config(limit), true)
            };
            self.create_rule(session, package, spec).await?;
        }
        self.set_package_policies(session, package).await
    }

    /// Rewrite the whitelist of every ACL rule on the package and its routes
    pub async fn update_acl_whitelist(
        &self,
        session: &mut Session,
        package: &Package,
        consumer_names: &[String],
    ) -> Result<()> {
        let adapter = self.resolver.adapter(&package.cluster_name).await?;
        let config = acl_whitelist(adapter.provider(), consumer_names);
        let rules = session
            .select::<PackageRule>(&PackageRuleFilter {
                package_id: Some(package.id.clone()),
                category: Some(RuleCategory::Acl),
                ..Default::default()
            })
            .await?;
        for rule in rules {
            let spec = RuleSpec {
                package_api_id: rule.package_api_id.clone(),
                package_zone_need: rule.package_zone_need,
                category: rule.category,
                plugin_name: rule.plugin_name.clone(),
                config: config.clone(),
                consumer_id: rule.consumer_id.clone(),
                consumer_name: rule.consumer_name.clone(),
                enabled: rule.enabled,
                kong_plugin: rule.kong_plugin,
                ..Default::default()
            };
            self.update_rule(session, &rule.id, spec).await?;
        }
        Ok(())
    }

    async fn policy_base(&self, session: &mut Session, package: &Package) -> Result<PackagePolicyBase> {
        let rules = self.get_package_rules(session, package, None).await?;
        let domains = self.domains.get_package_domains(session, &package.id).await?;
        Ok(PackagePolicyBase::compile(&self.policy, rules, &domains))
    }

    async fn zone_policies(&self, session: &mut Session, zone_id: &ZoneId) -> Result<Vec<ZonePolicy>> {
        session
            .select::<ZonePolicy>(&ZonePolicyFilter { zone_id: Some(zone_id.clone()), ..Default::default() })
            .await
    }

    /// Store a route zone's policy; returns whether anything changed
    async fn store_route_policy(
        &self,
        session: &mut Session,
        base: &PackagePolicyBase,
        package: &Package,
        api: &PackageApi,
    ) -> Result<bool> {
        if api.zone_id.is_empty() {
            return Ok(false);
        }
        let zone_id = ZoneId::from(api.zone_id.as_str());
        let zone_policies = self.zone_policies(session, &zone_id).await?;
        let api_rules = self.get_api_rules(session, api, None).await?;
        match base.route_zone(api, &zone_policies, &api_rules, &package.name) {
            Some(set) => {
                self.zones.set_zone_kong_policies_without_domain_policy(session, &zone_id, Some(set)).await?;
                Ok(true)
            }
            None => {
                let zone = session.must_get::<Zone>(&zone_id).await?;
                if zone.policies.0.is_none() {
                    return Ok(false);
                }
                self.zones.set_zone_kong_policies_without_domain_policy(session, &zone_id, None).await?;
                Ok(true)
            }
        }
    }

    /// Compile the package zone and every route zone, then flush once
    #[instrument(skip(self, session, package), fields(package_id = %package.id), name = "rule_set_package_policies")]
    pub async fn set_package_policies(&self, session: &mut Session, package: &Package) -> Result<()> {
        let base = self.policy_base(session, package).await?;
        let zone_policies = self.zone_policies(session, &package.zone_id).await?;
        match base.package_zone(&zone_policies, &package.name) {
            Some(set) => {
                self.zones
                    .set_zone_kong_policies_without_domain_policy(session, &package.zone_id, Some(set))
                    .await?;
            }
            None => {
                let zone = session.must_get::<Zone>(&package.zone_id).await?;
                if zone.policies.0.is_some() {
                    self.zones
                        .set_zone_kong_policies_without_domain_policy(session, &package.zone_id, None)
                        .await?;
                }
            }
        }
        let apis = session
            .select::<PackageApi>(&PackageApiFilter { package_id: Some(package.id.clone()), ..Default::default() })
            .await?;
        for api in &apis {
            self.store_route_policy(session, &base, package, api).await?;
        }
        self.zones
            .update_domain_policy(session, &package.cluster_name, &package.project_id, &package.env)
            .await
    }

    /// Compile one route zone and flush if it changed
    pub async fn set_package_api_policies(&self, session: &mut Session, package: &Package, api: &PackageApi) -> Result<()> {
        let base = self.policy_base(session, package).await?;
        if self.store_route_policy(session, &base, package, api).await? {
            self.zones
                .update_domain_policy(session, &package.cluster_name, &package.project_id, &package.env)
                .await?;
        }
        Ok(())
    }
}
