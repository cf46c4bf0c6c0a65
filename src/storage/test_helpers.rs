//! PostgreSQL test database backed by Testcontainers.
//!
//! Only compiled for tests with the `postgres_tests` feature.

use crate::config::DatabaseConfig;
use crate::storage::pool::{create_pool, DbPool};
use crate::storage::Store;
use testcontainers::runners::AsyncRunner;
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres;

/// Remove containers left behind by previous test runs.
///
/// `ContainerAsync` cleans up from an async drop that is cancelled when the
/// runtime shuts down, so orphans accumulate. Runs once per test binary.
fn cleanup_stale_testcontainers() {
    use std::process::Command;

    static CLEANUP_ONCE: std::sync::Once = std::sync::Once::new();
    CLEANUP_ONCE.call_once(|| {
        let Ok(output) = Command::new("docker")
            .args([
                "ps",
                "-q",
                "--filter",
                "label=org.testcontainers.managed-by=testcontainers",
                "--filter",
                "ancestor=postgres",
            ])
            .output()
        else {
            return;
        };
        if !output.status.success() {
            return;
        }

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let ids: Vec<&str> = stdout.lines().filter(|l| !l.trim().is_empty()).collect();
        if ids.is_empty() {
            return;
        }

        eprintln!("[test_helpers] removing {} stale testcontainer(s)", ids.len());
        let mut rm_args = vec!["rm", "-f"];
        rm_args.extend(&ids);
        let _ = Command::new("docker").args(&rm_args).output();
    });
}

/// Fresh PostgreSQL instance with the schema applied.
///
/// The container is removed when this value is dropped.
pub struct TestDatabase {
    pub pool: DbPool,
    _container: ContainerAsync<Postgres>,
}

impl TestDatabase {
    pub async fn new(prefix: &str) -> Self {
        cleanup_stale_testcontainers();

        let container = Postgres::default()
            .start()
            .await
            .unwrap_or_else(|e| panic!("Failed to start PostgreSQL container for {}: {}", prefix, e));
        let host = container
            .get_host()
            .await
            .unwrap_or_else(|e| panic!("Failed to get container host for {}: {}", prefix, e));
        let port = container
            .get_host_port_ipv4(5432)
            .await
            .unwrap_or_else(|e| panic!("Failed to get container port for {}: {}", prefix, e));

        let config = DatabaseConfig {
            url: format!("postgresql://postgres:postgres@{}:{}/postgres", host, port),
            auto_migrate: true,
            max_connections: 5,
            min_connections: 1,
            ..Default::default()
        };

        let pool = create_pool(&config)
            .await
            .unwrap_or_else(|e| panic!("Failed to create test pool for {}: {}", prefix, e));

        Self { pool, _container: container }
    }

    pub fn store(&self) -> Store {
        Store::Postgres(self.pool.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::*;
    use crate::storage::migrations::{get_migration_version, validate_migrations};
    use crate::storage::tables::{UpstreamApiFilter, UpstreamFilter};
    use chrono::Utc;
    use sqlx::types::Json;

    fn upstream() -> Upstream {
        Upstream {
            id: UpstreamId::new(),
            org_id: "1".to_string(),
            project_id: "2".to_string(),
            env: "DEV".to_string(),
            az: "dev".to_string(),
            app_name: "shop".to_string(),
            service_name: "web".to_string(),
            upstream_name: "shop-web".to_string(),
            runtime_service_id: String::new(),
            last_register_id: "r1".to_string(),
            valid_register_id: String::new(),
            auto_bind: true,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn migrations_apply_cleanly() {
        let db = TestDatabase::new("migrations").await;
        assert!(validate_migrations(&db.pool).await.unwrap());
        assert_eq!(get_migration_version(&db.pool).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn session_crud_against_postgres() {
        let db = TestDatabase::new("session_crud").await;
        let store = db.store();

        let mut up = upstream();
        let mut session = store.begin().await.unwrap();
        session.insert(&up).await.unwrap();
        let api = UpstreamApi {
            id: UpstreamApiId::new(),
            upstream_id: up.id.clone(),
            register_id: "r1".to_string(),
            api_name: "/orders".to_string(),
            path: "/orders".to_string(),
            gateway_path: String::new(),
            method: "GET".to_string(),
            address: "http://shop:8080".to_string(),
            domains: String::new(),
            doc: Json(serde_json::json!({"summary": "orders"})),
            is_inner: false,
            api_id: String::new(),
            deleted: false,
            created_at: Utc::now(),
        };
        session.insert(&api).await.unwrap();
        session.commit().await.unwrap();

        let mut session = store.begin().await.unwrap();
        let locked = session
            .select_for_update::<Upstream>(&UpstreamFilter {
                upstream_name: Some("shop-web".to_string()),
                runtime_service_id: Some(String::new()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(locked.len(), 1);
        up.valid_register_id = "r1".to_string();
        session.update(&up).await.unwrap();

        let apis = session
            .select::<UpstreamApi>(&UpstreamApiFilter {
                ids: Some(vec![api.id.clone()]),
                deleted: Some(false),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(apis.len(), 1);
        assert_eq!(apis[0].doc.0["summary"], "orders");
        session.commit().await.unwrap();

        let mut session = store.begin().await.unwrap();
        let stored = session.must_get::<Upstream>(&up.id).await.unwrap();
        assert_eq!(stored.valid_register_id, "r1");
    }

    #[tokio::test]
    async fn unique_natural_key_maps_to_conflict() {
        let db = TestDatabase::new("unique_key").await;
        let store = db.store();

        let mut session = store.begin().await.unwrap();
        session.insert(&upstream()).await.unwrap();
        session.commit().await.unwrap();

        let mut session = store.begin().await.unwrap();
        session.lock_table::<Upstream>().await.unwrap();
        let err = session.insert(&upstream()).await.unwrap_err();
        assert!(matches!(err, crate::errors::RouteplaneError::Conflict { .. }));
    }
}
