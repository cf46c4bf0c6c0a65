//! # Configuration Management
//!
//! Layered configuration: built-in defaults, then an optional TOML/YAML file,
//! then `ROUTEPLANE__SECTION__KEY` environment variables.

pub mod settings;

pub use settings::{
    AppConfig, AzBinding, ClusterConfig, DatabaseConfig, GatewaySettings, ObservabilityConfig,
    PolicySettings, ReconcilerSettings,
};

use crate::errors::Result;
use config::{Config as Cfg, Environment, File};
use std::path::Path;

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "ROUTEPLANE";

/// Load and validate the application configuration.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    let mut builder = Cfg::builder();
    if let Some(path) = path {
        builder = builder.add_source(File::from(path).required(true));
    }

    let config: AppConfig = builder
        .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
        .build()?
        .try_deserialize()?;

    config.validate()?;

    tracing::debug!(
        clusters = config.clusters.len(),
        database_memory = config.database.is_memory(),
        "Configuration loaded"
    );

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::GatewayProvider;
    use std::io::Write;

    #[test]
    fn test_load_config_from_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[database]
url = "memory://"

[reconciler]
register_slice_size = 5
register_interval_seconds = 0

[[clusters]]
name = "dev"
provider = "kong"
cluster_type = "k8s"
kong_admin_addr = "http://kong-admin:8001"
gateway_namespace = "addons"
gateway_service = "kong"
"#
        )
        .unwrap();

        let config = load_config(Some(file.path())).unwrap();
        assert!(config.database.is_memory());
        assert_eq!(config.reconciler.register_slice_size, 5);
        assert_eq!(config.clusters.len(), 1);
        assert_eq!(config.clusters[0].provider, GatewayProvider::Kong);
        // untouched sections keep their defaults
        assert_eq!(config.policy.wildcard_base_priority, 100);
    }

    #[test]
    fn test_load_config_rejects_invalid_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[[clusters]]
name = "dev"
provider = "kong"
"#
        )
        .unwrap();

        assert!(load_config(Some(file.path())).is_err());
    }
}
