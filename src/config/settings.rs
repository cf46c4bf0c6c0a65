//! # Configuration Settings
//!
//! Defines the configuration structure for the routeplane control plane.

use crate::domain::{ClusterType, GatewayProvider};
use crate::errors::{Result, RouteplaneError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;
use validator::Validate;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Database configuration
    #[validate(nested)]
    pub database: DatabaseConfig,

    /// Observability configuration
    #[validate(nested)]
    pub observability: ObservabilityConfig,

    /// Gateway adapter behaviour shared by all clusters
    #[validate(nested)]
    pub gateway: GatewaySettings,

    /// Upstream registration reconciler tuning
    #[validate(nested)]
    pub reconciler: ReconcilerSettings,

    /// Route policy compilation
    #[validate(nested)]
    pub policy: PolicySettings,

    /// Clusters the control plane manages
    #[validate(nested)]
    pub clusters: Vec<ClusterConfig>,
}

impl AppConfig {
    /// Validate the entire configuration
    pub fn validate(&self) -> Result<()> {
        Validate::validate(self).map_err(RouteplaneError::from)?;
        self.validate_custom()?;
        Ok(())
    }

    /// Checks that span sections or depend on enum values
    fn validate_custom(&self) -> Result<()> {
        if !self.database.is_postgresql() && !self.database.is_memory() {
            return Err(RouteplaneError::validation_field(
                "Database URL must start with 'postgresql://' or 'memory://'",
                "database.url",
            ));
        }

        let mut names = HashSet::new();
        for cluster in &self.clusters {
            if !names.insert(cluster.name.as_str()) {
                return Err(RouteplaneError::validation_field(
                    format!("Duplicate cluster name '{}'", cluster.name),
                    "clusters",
                ));
            }
            match cluster.provider {
                GatewayProvider::Kong if cluster.kong_admin_addr.is_none() => {
                    return Err(RouteplaneError::validation_field(
                        format!("Cluster '{}' uses kong but has no kong_admin_addr", cluster.name),
                        "clusters.kong_admin_addr",
                    ));
                }
                GatewayProvider::Mse if cluster.mesh_api_addr.is_none() => {
                    return Err(RouteplaneError::validation_field(
                        format!("Cluster '{}' uses mse but has no mesh_api_addr", cluster.name),
                        "clusters.mesh_api_addr",
                    ));
                }
                _ => {}
            }
        }

        Ok(())
    }

    /// Look up a configured cluster by name
    pub fn cluster(&self, name: &str) -> Option<&ClusterConfig> {
        self.clusters.iter().find(|c| c.name == name)
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database connection URL (`postgresql://...` or `memory://`)
    #[validate(length(min = 1, message = "Database URL cannot be empty"))]
    pub url: String,

    /// Maximum number of connections in the pool
    #[validate(range(min = 1, max = 100, message = "Max connections must be between 1 and 100"))]
    pub max_connections: u32,

    /// Minimum number of connections in the pool
    #[validate(range(min = 0, max = 50, message = "Min connections must be between 0 and 50"))]
    pub min_connections: u32,

    /// Connection timeout in seconds
    #[validate(range(
        min = 1,
        max = 60,
        message = "Connect timeout must be between 1 and 60 seconds"
    ))]
    pub connect_timeout_seconds: u64,

    /// Idle timeout in seconds (0 = no timeout)
    pub idle_timeout_seconds: u64,

    /// Enable automatic migrations
    pub auto_migrate: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost:5432/routeplane".to_string(),
            max_connections: 10,
            min_connections: 0,
            connect_timeout_seconds: 10,
            idle_timeout_seconds: 600,
            auto_migrate: true,
        }
    }
}

impl DatabaseConfig {
    /// Get connection timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    /// Get idle timeout as Duration (None if 0)
    pub fn idle_timeout(&self) -> Option<Duration> {
        if self.idle_timeout_seconds == 0 {
            None
        } else {
            Some(Duration::from_secs(self.idle_timeout_seconds))
        }
    }

    /// Check if this is a PostgreSQL configuration
    pub fn is_postgresql(&self) -> bool {
        self.url.starts_with("postgresql://")
    }

    /// Check if this selects the in-process store
    pub fn is_memory(&self) -> bool {
        self.url.starts_with("memory://")
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Service name attached to startup logs
    #[validate(length(min = 1, message = "Service name cannot be empty"))]
    pub service_name: String,

    /// Log level (trace, debug, info, warn, error), overridden by RUST_LOG
    #[validate(length(min = 1, message = "Log level cannot be empty"))]
    pub log_level: String,

    /// Enable JSON structured logging
    pub json_logging: bool,

    /// Write logs to a daily rolling file in this directory instead of stdout
    pub log_dir: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            service_name: "routeplane".to_string(),
            log_level: "info".to_string(),
            json_logging: false,
            log_dir: None,
        }
    }
}

/// Settings shared by every gateway adapter and ingress applier
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct GatewaySettings {
    /// Timeout for a single admin API call
    #[validate(range(min = 1, max = 300, message = "HTTP timeout must be between 1 and 300 seconds"))]
    pub http_timeout_seconds: u64,

    /// Route through the gateway admin endpoint only; never create ingresses
    pub use_admin_endpoint: bool,

    /// Plain HTTP port of the Kong proxy service
    pub kong_service_port: i32,

    /// HTTPS port of the Kong proxy service
    pub kong_https_service_port: i32,

    /// Backend port used for mesh gateway ingresses when the service has none
    pub mesh_default_service_port: i32,

    /// Field manager name used for Kubernetes server-side patches
    #[validate(length(min = 1, message = "Field manager cannot be empty"))]
    pub ingress_field_manager: String,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            http_timeout_seconds: 30,
            use_admin_endpoint: false,
            kong_service_port: 8000,
            kong_https_service_port: 8443,
            mesh_default_service_port: 8080,
            ingress_field_manager: "routeplane".to_string(),
        }
    }
}

impl GatewaySettings {
    /// Get the admin API timeout as Duration
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_seconds)
    }
}

/// Batching applied by the upstream registration differ
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ReconcilerSettings {
    /// Number of backend changes applied before pausing
    #[validate(range(min = 1, max = 10000, message = "Slice size must be between 1 and 10000"))]
    pub register_slice_size: usize,

    /// Pause between two full slices
    #[validate(range(max = 3600, message = "Register interval must be at most 3600 seconds"))]
    pub register_interval_seconds: u64,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            register_slice_size: 100,
            register_interval_seconds: 1,
        }
    }
}

impl ReconcilerSettings {
    /// Get the inter-slice pause as Duration
    pub fn register_interval(&self) -> Duration {
        Duration::from_secs(self.register_interval_seconds)
    }
}

/// Priorities and plugin names used when compiling zone policies
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct PolicySettings {
    /// Base priority of packages bound only to exact domains
    pub base_priority: i32,

    /// Base priority of packages bound to at least one wildcard domain
    pub wildcard_base_priority: i32,

    /// Name of the cluster-wide plugin carrying the zone policy table
    #[validate(length(min = 1, message = "Domain policy plugin name cannot be empty"))]
    pub domain_policy_plugin: String,
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self {
            base_priority: 1000,
            wildcard_base_priority: 100,
            domain_policy_plugin: "domain-policy".to_string(),
        }
    }
}

/// Static metadata for one managed cluster
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ClusterConfig {
    /// Cluster name as referenced by packages and zones
    #[validate(length(min = 1, message = "Cluster name cannot be empty"))]
    pub name: String,

    /// Scheduler flavour of the cluster
    #[serde(default)]
    pub cluster_type: ClusterType,

    /// Gateway provider deployed in the cluster
    #[serde(default)]
    pub provider: GatewayProvider,

    /// Wildcard domain suffix, e.g. `*.apps.example.com`
    #[serde(default)]
    pub wildcard_domain: String,

    /// Kong admin API base URL
    pub kong_admin_addr: Option<String>,

    /// Namespace of the gateway proxy service
    #[serde(default)]
    pub gateway_namespace: String,

    /// Name of the gateway proxy service
    #[serde(default)]
    pub gateway_service: String,

    /// Mesh gateway plugin API base URL
    pub mesh_api_addr: Option<String>,

    /// Mesh gateway plugin name to plugin id
    #[serde(default)]
    pub mesh_plugin_ids: BTreeMap<String, String>,

    /// Kubeconfig file; in-cluster or default configuration when unset
    pub kubeconfig: Option<String>,

    /// Availability zones bound to (org, project, env) scopes
    #[serde(default)]
    pub az_bindings: Vec<AzBinding>,
}

/// Binds an (org, project, env) scope to the availability zone that serves it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AzBinding {
    pub org_id: String,
    pub project_id: String,
    pub env: String,
    pub az: String,
}
