//! Persisted records of the system of record.
//!
//! Optional references are stored as empty strings so that filters can ask
//! for "must be empty" explicitly.

use super::id::*;
use super::types::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;

/// A published API surface (endpoint)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Package {
    pub id: PackageId,
    pub name: String,
    pub description: String,
    pub scene: Scene,
    pub auth_type: AuthType,
    pub acl_type: AclType,
    pub zone_id: ZoneId,
    pub cluster_name: String,
    pub org_id: String,
    pub project_id: String,
    pub env: String,
    pub runtime_service_id: String,
    pub created_at: DateTime<Utc>,
}

/// One path+method route inside a package
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct PackageApi {
    pub id: PackageApiId,
    pub package_id: PackageId,
    pub api_path: String,
    pub method: String,
    pub redirect_type: RedirectType,
    pub redirect_addr: String,
    pub redirect_path: String,
    pub runtime_service_id: String,
    pub origin: ApiOrigin,
    pub zone_id: String,
    pub acl_type: AclType,
    pub description: String,
    /// Backend service handle (empty when the route needs none)
    pub service_id: String,
    /// Backend route handle
    pub route_id: String,
    pub created_at: DateTime<Utc>,
}

/// Resolved plugin set and match record of a zone
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZonePolicySet {
    /// Comma-joined plugin ids switched on for the zone
    pub enables: String,
    /// Comma-joined plugin ids switched off for the zone
    pub disables: String,
    pub regex: String,
    pub priority: i32,
    pub package_name: String,
}

impl ZonePolicySet {
    pub fn enabled_ids(&self) -> Vec<&str> {
        split_ids(&self.enables)
    }

    pub fn disabled_ids(&self) -> Vec<&str> {
        split_ids(&self.disables)
    }
}

fn split_ids(joined: &str) -> Vec<&str> {
    joined.split(',').filter(|s| !s.is_empty()).collect()
}

/// The single ingress/route configuration unit of an owner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Zone {
    pub id: ZoneId,
    pub name: String,
    pub zone_type: ZoneType,
    pub cluster_name: String,
    pub org_id: String,
    pub project_id: String,
    pub env: String,
    pub package_api_id: String,
    pub runtime_service_id: String,
    pub has_ingress: bool,
    pub ingress_namespace: String,
    pub policies: Json<Option<ZonePolicySet>>,
    pub created_at: DateTime<Utc>,
}

/// Plugin attached to every route of a zone regardless of package rules
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ZonePolicy {
    pub id: ZonePolicyId,
    pub zone_id: ZoneId,
    pub plugin_name: String,
    pub plugin_id: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

/// A hostname bound to exactly one owner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct DomainRecord {
    pub id: DomainId,
    pub domain: String,
    pub cluster_name: String,
    pub domain_type: DomainType,
    pub runtime_service_id: String,
    pub package_id: String,
    pub package_name: String,
    pub component_name: String,
    pub org_id: String,
    pub project_id: String,
    pub env: String,
    pub created_at: DateTime<Utc>,
}

impl DomainRecord {
    /// Human readable owner used in conflict messages
    pub fn owner_description(&self) -> String {
        match self.domain_type {
            DomainType::Package => format!("endpoint {}", self.package_name),
            DomainType::Component => format!("component {}", self.component_name),
            DomainType::ServiceDefault | DomainType::ServiceCustom => {
                format!("runtime service {}", self.runtime_service_id)
            }
        }
    }
}

/// Declarative policy attached to a package or one of its routes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct PackageRule {
    pub id: RuleId,
    pub name: String,
    pub package_id: PackageId,
    pub package_name: String,
    pub package_api_id: String,
    /// Package-level rule applied to the package zone
    pub package_zone_need: bool,
    pub category: RuleCategory,
    pub plugin_name: String,
    pub plugin_id: String,
    pub config: Json<serde_json::Value>,
    pub consumer_id: String,
    pub consumer_name: String,
    pub enabled: bool,
    /// False for rules enforced outside the gateway backend
    pub kong_plugin: bool,
    pub created_at: DateTime<Utc>,
}

/// Legacy bulk-registration scope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Upstream {
    pub id: UpstreamId,
    pub org_id: String,
    pub project_id: String,
    pub env: String,
    pub az: String,
    pub app_name: String,
    pub service_name: String,
    pub upstream_name: String,
    pub runtime_service_id: String,
    pub last_register_id: String,
    pub valid_register_id: String,
    pub auto_bind: bool,
    pub created_at: DateTime<Utc>,
}

/// One path+method entry of a registration generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct UpstreamApi {
    pub id: UpstreamApiId,
    pub upstream_id: UpstreamId,
    pub register_id: String,
    pub api_name: String,
    pub path: String,
    pub gateway_path: String,
    pub method: String,
    pub address: String,
    pub domains: String,
    pub doc: Json<serde_json::Value>,
    pub is_inner: bool,
    /// Bound gateway api id, empty until bound
    pub api_id: String,
    /// Soft-deleted and waiting to be re-driven
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
}

impl UpstreamApi {
    /// Whether binding this entry again would change the backend route
    pub fn differs_from(&self, other: &UpstreamApi) -> bool {
        self.path != other.path
            || self.method != other.method
            || self.address != other.address
            || self.gateway_path != other.gateway_path
            || self.domains != other.domains
    }
}

/// Immutable snapshot of the api ids of one registration generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct RegisterRecord {
    pub id: RegisterRecordId,
    pub upstream_id: UpstreamId,
    pub register_id: String,
    pub upstream_apis: Json<Vec<UpstreamApiId>>,
    pub created_at: DateTime<Utc>,
}

/// Gateway consumer owned by the control plane
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Consumer {
    pub id: ConsumerId,
    pub name: String,
    /// Consumer handle on the backend
    pub backend_id: String,
    pub org_id: String,
    pub project_id: String,
    pub env: String,
    pub az: String,
    pub is_default: bool,
    pub created_at: DateTime<Utc>,
}

/// Route bound on the backend on behalf of an upstream api
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct GatewayApi {
    pub id: GatewayApiId,
    pub consumer_id: String,
    pub api_path: String,
    pub method: String,
    pub redirect_addr: String,
    pub hosts: String,
    pub service_id: String,
    pub route_id: String,
    pub upstream_api_id: String,
    pub runtime_service_id: String,
    pub cluster_name: String,
    pub project_id: String,
    pub env: String,
    pub created_at: DateTime<Utc>,
}

/// Shared tenant ingress keyed by its sorted domain set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct HubInfo {
    pub id: HubInfoId,
    pub org_id: String,
    pub env: String,
    pub az: String,
    /// Comma-joined, normalized domain set
    pub domains: String,
    pub package_id: PackageId,
    pub created_at: DateTime<Utc>,
}

impl HubInfo {
    pub fn domain_list(&self) -> Vec<String> {
        self.domains.split(',').filter(|d| !d.is_empty()).map(str::to_string).collect()
    }
}

/// Deployed service of a runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct RuntimeService {
    pub id: RuntimeServiceId,
    pub project_id: String,
    pub env: String,
    pub cluster_name: String,
    pub app_id: String,
    pub app_name: String,
    pub service_name: String,
    pub runtime_name: String,
    pub inner_address: String,
    pub service_port: i32,
    pub group_namespace: String,
    pub group_name: String,
    pub created_at: DateTime<Utc>,
}

impl RuntimeService {
    /// Upstream URL of the service inside the cluster
    pub fn backend_url(&self, path: &str) -> String {
        let path = if path.is_empty() { "/" } else { path };
        format!("http://{}:{}{}", self.inner_address, self.service_port, path)
    }
}
