//! # Structured Logging
//!
//! Subscriber setup plus span macros used across the managers.

use crate::config::{AppConfig, ObservabilityConfig};
use crate::errors::{Result, RouteplaneError};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Create a tracing span for database operations.
///
/// ```rust,ignore
/// let span = db_span!("insert_package", package = %name);
/// ```
#[macro_export]
macro_rules! db_span {
    ($operation:expr) => {
        tracing::debug_span!(
            "db_operation",
            operation = %$operation,
            operation_id = %uuid::Uuid::new_v4()
        )
    };
    ($operation:expr, $($field:tt)*) => {
        tracing::debug_span!(
            "db_operation",
            operation = %$operation,
            operation_id = %uuid::Uuid::new_v4(),
            $($field)*
        )
    };
}

/// Create a span for one registration reconcile run of an upstream
#[macro_export]
macro_rules! reconcile_span {
    ($operation:expr, $upstream:expr) => {
        tracing::info_span!(
            "reconcile",
            operation = %$operation,
            upstream = %$upstream,
            run_id = %uuid::Uuid::new_v4()
        )
    };
    ($operation:expr, $upstream:expr, $($field:tt)*) => {
        tracing::info_span!(
            "reconcile",
            operation = %$operation,
            upstream = %$upstream,
            run_id = %uuid::Uuid::new_v4(),
            $($field)*
        )
    };
}

/// Install the global fmt subscriber.
///
/// `RUST_LOG` wins over the configured level. With `log_dir` set, output
/// goes to a daily rolling file and the returned guard must be kept alive
/// to flush it. A subscriber that is already installed is left in place.
pub fn init_logging(config: &ObservabilityConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| {
            RouteplaneError::config_with_source(
                format!("Invalid log level '{}'", config.log_level),
                Box::new(e),
            )
        })?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let (result, guard) = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).map_err(|e| {
                RouteplaneError::config_with_source(
                    format!("Failed to create log directory '{}'", dir),
                    Box::new(e),
                )
            })?;
            let appender =
                tracing_appender::rolling::daily(dir, format!("{}.log", config.service_name));
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let builder = builder.with_writer(writer).with_ansi(false);
            let result = if config.json_logging {
                builder.json().try_init()
            } else {
                builder.try_init()
            };
            (result, Some(guard))
        }
        None => {
            let result =
                if config.json_logging { builder.json().try_init() } else { builder.try_init() };
            (result, None)
        }
    };

    if let Err(e) = result {
        tracing::debug!(error = %e, "Global subscriber already installed");
    }

    Ok(guard)
}

/// Log configuration at startup
pub fn log_config_info(config: &AppConfig) {
    tracing::info!(
        service_name = %config.observability.service_name,
        database_memory = config.database.is_memory(),
        clusters = config.clusters.len(),
        register_slice_size = config.reconciler.register_slice_size,
        register_interval_seconds = config.reconciler.register_interval_seconds,
        use_admin_endpoint = config.gateway.use_admin_endpoint,
        "Routeplane control plane configuration"
    );
    for cluster in &config.clusters {
        tracing::info!(
            cluster = %cluster.name,
            provider = %cluster.provider,
            cluster_type = %cluster.cluster_type,
            "Managed cluster"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_macros_compile() {
        let _span = db_span!("insert_package");
        let _span = db_span!("insert_package", table = "packages");
        let _span = reconcile_span!("upstream_valid", "shop-web");
        let _span = reconcile_span!("upstream_valid", "shop-web", register_id = "r2");
    }

    #[test]
    fn test_init_logging_is_repeatable() {
        let config = ObservabilityConfig::default();
        assert!(init_logging(&config).is_ok());
        assert!(init_logging(&config).is_ok());
    }

    #[test]
    fn test_init_logging_with_log_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = ObservabilityConfig {
            log_dir: Some(dir.path().join("logs").display().to_string()),
            ..Default::default()
        };
        let guard = init_logging(&config).unwrap();
        assert!(guard.is_some());
        assert!(dir.path().join("logs").exists());
    }

    #[test]
    fn test_log_config_info() {
        log_config_info(&AppConfig::default());
    }
}
