//! Upstream registration and generation reconciliation over the in-memory store

mod common;

use common::{TestEnv, CLUSTER, ENV, ORG, PROJECT};
use routeplane::domain::{GatewayApi, RegisterMode, Upstream, UpstreamApi, UpstreamApiSpec, UpstreamRegisterRequest};
use routeplane::errors::RouteplaneError;
use routeplane::storage::{GatewayApiFilter, UpstreamApiFilter, UpstreamFilter};

fn request(register_id: &str, mode: RegisterMode, paths: &[&str]) -> UpstreamRegisterRequest {
    UpstreamRegisterRequest {
        org_id: ORG.to_string(),
        project_id: PROJECT.to_string(),
        env: ENV.to_string(),
        az: String::new(),
        app_name: "shop".to_string(),
        app_id: "7".to_string(),
        service_name: "orders".to_string(),
        runtime_name: String::new(),
        upstream_name: "orders".to_string(),
        register_id: register_id.to_string(),
        path_prefix: None,
        mode,
        auto_bind: true,
        api_list: paths
            .iter()
            .map(|p| UpstreamApiSpec {
                name: p.to_string(),
                path: p.to_string(),
                method: "get".to_string(),
                address: "http://orders.svc:8080".to_string(),
                domain: "orders.example.com".to_string(),
                ..Default::default()
            })
            .collect(),
    }
}

async fn upstream(env: &TestEnv) -> Upstream {
    let mut session = env.store.begin().await.unwrap();
    session
        .get_by::<Upstream>(&UpstreamFilter { upstream_name: Some("orders".to_string()), ..Default::default() })
        .await
        .unwrap()
        .unwrap()
}

async fn bound_rows(env: &TestEnv) -> Vec<GatewayApi> {
    let mut session = env.store.begin().await.unwrap();
    session.select::<GatewayApi>(&GatewayApiFilter::default()).await.unwrap()
}

#[tokio::test]
async fn first_registration_binds_every_api() {
    let env = TestEnv::new();
    let outcome = env.managers.upstreams.register(request("r1", RegisterMode::Replace, &["/a", "/b", "/c"])).await.unwrap();

    assert!(outcome.generation_changed);
    let summary = outcome.summary.unwrap();
    assert_eq!(summary.added, 3);
    assert_eq!(env.adapter.route_paths(), vec!["/a", "/b", "/c"]);
    assert_eq!(env.adapter.service_count(), 3);

    let rows = bound_rows(&env).await;
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().all(|r| r.method == "GET" && r.cluster_name == CLUSTER));
    assert!(rows.iter().any(|r| r.redirect_addr == "http://orders.svc:8080/a"));

    let upstream = upstream(&env).await;
    assert_eq!(upstream.valid_register_id, "r1");
    assert_eq!(upstream.last_register_id, "r1");
}

#[tokio::test]
async fn default_consumer_is_created_once() {
    let env = TestEnv::new();
    env.managers.upstreams.register(request("r1", RegisterMode::Replace, &["/a"])).await.unwrap();
    env.managers.upstreams.register(request("r2", RegisterMode::Replace, &["/a"])).await.unwrap();

    let creates = env.adapter.calls().iter().filter(|c| c.starts_with("create_consumer")).count();
    assert_eq!(creates, 1);
    assert!(env.adapter.calls().contains(&format!("create_consumer {}-{}-{}-default", PROJECT, ENV, CLUSTER)));
}

#[tokio::test]
async fn same_generation_twice_touches_nothing() {
    let env = TestEnv::new();
    env.managers.upstreams.register(request("r1", RegisterMode::Replace, &["/a", "/b"])).await.unwrap();
    env.adapter.clear_calls();

    let outcome = env.managers.upstreams.register(request("r1", RegisterMode::Replace, &["/a", "/b"])).await.unwrap();
    assert!(!outcome.generation_changed);
    assert_eq!(outcome.summary.unwrap(), Default::default());
    assert!(env.adapter.calls().is_empty(), "unexpected calls: {:?}", env.adapter.calls());
    assert_eq!(bound_rows(&env).await.len(), 2);
}

#[tokio::test]
async fn replace_removes_apis_left_out() {
    let env = TestEnv::new();
    env.managers.upstreams.register(request("r1", RegisterMode::Replace, &["/a", "/b"])).await.unwrap();

    let summary = env
        .managers
        .upstreams
        .register(request("r2", RegisterMode::Replace, &["/a"]))
        .await
        .unwrap()
        .summary
        .unwrap();
    assert_eq!(summary.deleted, 1);
    assert_eq!(summary.added, 0);
    assert_eq!(env.adapter.route_paths(), vec!["/a"]);
    assert_eq!(bound_rows(&env).await.len(), 1);
}

#[tokio::test]
async fn append_keeps_apis_left_out() {
    let env = TestEnv::new();
    env.managers.upstreams.register(request("r1", RegisterMode::Replace, &["/a", "/b"])).await.unwrap();

    let summary = env
        .managers
        .upstreams
        .register(request("r2", RegisterMode::Append, &["/a", "/c"]))
        .await
        .unwrap()
        .summary
        .unwrap();
    assert_eq!(summary.added, 1);
    assert_eq!(summary.deleted, 0);
    assert_eq!(env.adapter.route_paths(), vec!["/a", "/b", "/c"]);
}

#[tokio::test]
async fn carried_apis_are_removed_by_a_later_replace() {
    let env = TestEnv::new();
    env.managers.upstreams.register(request("r1", RegisterMode::Replace, &["/a", "/b"])).await.unwrap();
    env.managers.upstreams.register(request("r2", RegisterMode::Append, &["/a"])).await.unwrap();
    env.managers.upstreams.register(request("r3", RegisterMode::Replace, &["/a"])).await.unwrap();

    assert_eq!(env.adapter.route_paths(), vec!["/a"]);
    assert_eq!(bound_rows(&env).await.len(), 1);
}

#[tokio::test]
async fn changed_address_rebinds_in_place() {
    let env = TestEnv::new();
    env.managers.upstreams.register(request("r1", RegisterMode::Replace, &["/a"])).await.unwrap();
    let before = bound_rows(&env).await;

    let mut next = request("r2", RegisterMode::Replace, &["/a"]);
    next.api_list[0].address = "http://orders-v2.svc:8080".to_string();
    let summary = env.managers.upstreams.register(next).await.unwrap().summary.unwrap();
    assert_eq!(summary.updated, 1);

    let after = bound_rows(&env).await;
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].id, before[0].id);
    assert_eq!(after[0].route_id, before[0].route_id);
    assert_eq!(after[0].redirect_addr, "http://orders-v2.svc:8080/a");
}

#[tokio::test]
async fn failure_mid_run_undoes_applied_bindings() {
    let env = TestEnv::new();
    env.adapter.fail_route_write_at(3);

    let err = env
        .managers
        .upstreams
        .register(request("r1", RegisterMode::Replace, &["/a", "/b", "/c", "/d", "/e"]))
        .await
        .unwrap_err();
    assert!(matches!(err, RouteplaneError::BackendRejected { .. }));

    assert!(env.adapter.route_paths().is_empty());
    assert_eq!(env.adapter.service_count(), 0);
    assert!(bound_rows(&env).await.is_empty());

    let upstream = upstream(&env).await;
    assert_eq!(upstream.valid_register_id, "");
    assert_eq!(upstream.last_register_id, "r1");
}

#[tokio::test]
async fn failed_generation_is_retried_on_next_registration() {
    let env = TestEnv::new();
    env.adapter.fail_route_write_at(2);
    assert!(env.managers.upstreams.register(request("r1", RegisterMode::Replace, &["/a", "/b"])).await.is_err());

    let summary = env
        .managers
        .upstreams
        .register(request("r1", RegisterMode::Replace, &["/a", "/b"]))
        .await
        .unwrap()
        .summary
        .unwrap();
    assert_eq!(summary.added, 2);
    assert_eq!(env.adapter.route_paths(), vec!["/a", "/b"]);
    assert_eq!(upstream(&env).await.valid_register_id, "r1");
}

#[tokio::test]
async fn refused_api_is_skipped() {
    let env = TestEnv::new();
    env.adapter.reject_path("/bad");

    let outcome = env
        .managers
        .upstreams
        .register(request("r1", RegisterMode::Replace, &["/a", "/bad", "/c"]))
        .await
        .unwrap();
    let summary = outcome.summary.unwrap();
    assert_eq!(summary.added, 2);
    assert_eq!(summary.skipped, 1);
    assert_eq!(env.adapter.route_paths(), vec!["/a", "/c"]);
    // the orphaned service of the refused route is cleaned up
    assert_eq!(env.adapter.service_count(), 2);
    assert_eq!(upstream(&env).await.valid_register_id, "r1");
}

#[tokio::test]
async fn unbound_api_is_recovered_by_same_generation() {
    let env = TestEnv::new();
    env.managers.upstreams.register(request("r1", RegisterMode::Replace, &["/a", "/b"])).await.unwrap();

    let row = bound_rows(&env).await.into_iter().find(|r| r.api_path == "/b").unwrap();
    env.managers.upstreams.unbind_api(&row.id).await.unwrap();
    assert_eq!(env.adapter.route_paths(), vec!["/a"]);

    let mut session = env.store.begin().await.unwrap();
    let missing = session
        .select::<UpstreamApi>(&UpstreamApiFilter { deleted: Some(true), ..Default::default() })
        .await
        .unwrap();
    assert_eq!(missing.len(), 1);
    assert_eq!(missing[0].api_name, "/b");
    session.rollback().await.unwrap();

    let summary = env
        .managers
        .upstreams
        .register(request("r1", RegisterMode::Replace, &["/a", "/b"]))
        .await
        .unwrap()
        .summary
        .unwrap();
    assert_eq!(summary.recovered, 1);
    assert_eq!(env.adapter.route_paths(), vec!["/a", "/b"]);
}

#[tokio::test]
async fn path_prefix_is_prepended() {
    let env = TestEnv::new();
    let mut req = request("r1", RegisterMode::Replace, &["/a"]);
    req.path_prefix = Some("/orders/".to_string());
    env.managers.upstreams.register(req).await.unwrap();

    assert_eq!(env.adapter.route_paths(), vec!["/orders/a"]);
}

#[tokio::test]
async fn manual_bind_upstream_is_only_recorded() {
    let env = TestEnv::new();
    let mut req = request("r1", RegisterMode::Replace, &["/a"]);
    req.auto_bind = false;
    let outcome = env.managers.upstreams.register(req).await.unwrap();

    assert!(outcome.generation_changed);
    assert!(outcome.summary.is_none());
    assert!(env.adapter.route_paths().is_empty());
    assert_eq!(upstream(&env).await.valid_register_id, "");
}

#[tokio::test]
async fn async_registration_reconciles_on_task() {
    let env = TestEnv::new();
    let (outcome, handle) = env
        .managers
        .upstreams
        .register_async(&env.managers.tasks, request("r1", RegisterMode::Replace, &["/a", "/b"]))
        .await
        .unwrap();
    assert!(outcome.summary.is_none());
    handle.unwrap().await.unwrap();

    assert_eq!(env.adapter.route_paths(), vec!["/a", "/b"]);
    assert_eq!(upstream(&env).await.valid_register_id, "r1");
}

#[tokio::test]
async fn invalid_request_is_refused_before_io() {
    let env = TestEnv::new();
    let mut req = request("", RegisterMode::Replace, &["/a"]);
    req.register_id.clear();
    let err = env.managers.upstreams.register(req).await.unwrap_err();
    assert!(matches!(err, RouteplaneError::Validation { .. }));
    assert!(env.adapter.calls().is_empty());
}

async fn unbind_path(env: &TestEnv, path: &str) {
    let row = bound_rows(env).await.into_iter().find(|r| r.api_path == path).unwrap();
    env.managers.upstreams.unbind_api(&row.id).await.unwrap();
}

#[tokio::test]
async fn newer_generation_owns_taken_over_bindings() {
    let env = TestEnv::new();
    env.managers.upstreams.register(request("r1", RegisterMode::Replace, &["/a", "/b"])).await.unwrap();
    env.managers.upstreams.register(request("r2", RegisterMode::Replace, &["/a", "/b"])).await.unwrap();

    let mut session = env.store.begin().await.unwrap();
    let apis = session.select::<UpstreamApi>(&UpstreamApiFilter::default()).await.unwrap();
    session.rollback().await.unwrap();
    for row in bound_rows(&env).await {
        let owner = apis.iter().find(|a| a.id.as_str() == row.upstream_api_id).unwrap();
        assert_eq!(owner.register_id, "r2");
    }
    assert!(apis.iter().filter(|a| a.register_id == "r1").all(|a| a.api_id.is_empty()));
}

#[tokio::test]
async fn unbound_api_of_taken_over_generation_is_recovered() {
    let env = TestEnv::new();
    env.managers.upstreams.register(request("r1", RegisterMode::Replace, &["/a", "/b"])).await.unwrap();
    env.managers.upstreams.register(request("r2", RegisterMode::Replace, &["/a", "/b"])).await.unwrap();
    unbind_path(&env, "/b").await;

    let summary = env
        .managers
        .upstreams
        .register(request("r2", RegisterMode::Replace, &["/a", "/b"]))
        .await
        .unwrap()
        .summary
        .unwrap();
    assert_eq!(summary.recovered, 1);
    assert_eq!(env.adapter.route_paths(), vec!["/a", "/b"]);
}

#[tokio::test]
async fn changed_generation_after_unbind_binds_again() {
    let env = TestEnv::new();
    env.managers.upstreams.register(request("r1", RegisterMode::Replace, &["/a", "/b"])).await.unwrap();
    env.managers.upstreams.register(request("r2", RegisterMode::Replace, &["/a", "/b"])).await.unwrap();
    unbind_path(&env, "/b").await;

    let mut next = request("r3", RegisterMode::Replace, &["/a", "/b"]);
    next.api_list[1].address = "http://orders-v2.svc:8080".to_string();
    env.managers.upstreams.register(next).await.unwrap();

    assert_eq!(env.adapter.route_paths(), vec!["/a", "/b"]);
    let rows = bound_rows(&env).await;
    let b = rows.iter().find(|r| r.api_path == "/b").unwrap();
    assert_eq!(b.redirect_addr, "http://orders-v2.svc:8080/b");
    assert_eq!(upstream(&env).await.valid_register_id, "r3");
}

#[tokio::test]
async fn updated_binding_is_recoverable_after_unbind() {
    let env = TestEnv::new();
    env.managers.upstreams.register(request("r1", RegisterMode::Replace, &["/a", "/b"])).await.unwrap();
    let mut next = request("r2", RegisterMode::Replace, &["/a", "/b"]);
    next.api_list[1].address = "http://orders-v2.svc:8080".to_string();
    env.managers.upstreams.register(next.clone()).await.unwrap();
    unbind_path(&env, "/b").await;

    let summary = env.managers.upstreams.register(next).await.unwrap().summary.unwrap();
    assert_eq!(summary.recovered, 1);
    assert_eq!(env.adapter.route_paths(), vec!["/a", "/b"]);
}
