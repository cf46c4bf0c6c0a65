//! Kong admin adapter against a mocked admin API

use std::time::Duration;

use routeplane::errors::RouteplaneError;
use routeplane::gateway::dto::{ConsumerRequest, PluginRequest, RouteRequest, ServiceRequest};
use routeplane::gateway::{GatewayAdapter, KongAdapter};
use serde_json::json;
use wiremock::matchers::{body_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn adapter(server: &MockServer) -> KongAdapter {
    KongAdapter::new("dev", server.uri(), Duration::from_secs(5)).unwrap()
}

#[tokio::test]
async fn new_service_is_posted_to_collection() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/services/"))
        .and(body_json(json!({"url": "http://shop:8080/api", "connect_timeout": 5000})))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "svc-1", "host": "shop"})))
        .expect(1)
        .mount(&server)
        .await;

    let service = adapter(&server)
        .create_or_update_service(&ServiceRequest {
            url: Some("http://shop:8080/api".to_string()),
            connect_timeout: Some(5000),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(service.id, "svc-1");
    assert_eq!(service.host.as_deref(), Some("shop"));
}

#[tokio::test]
async fn existing_service_is_overwritten_by_id() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/services/svc-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "svc-1"})))
        .expect(1)
        .mount(&server)
        .await;

    let service = adapter(&server)
        .create_or_update_service(&ServiceRequest {
            id: Some("svc-1".to_string()),
            url: Some("http://shop:8080".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(service.id, "svc-1");
}

#[tokio::test]
async fn route_bad_request_is_skippable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/routes/"))
        .respond_with(ResponseTemplate::new(400).set_body_string(r#"{"message":"bad path"}"#))
        .mount(&server)
        .await;

    let err = adapter(&server)
        .create_or_update_route(&RouteRequest { paths: vec!["/a".to_string()], ..Default::default() })
        .await
        .unwrap_err();
    assert!(matches!(err, RouteplaneError::InvalidRequest { .. }));
    assert!(err.is_skippable());
}

#[tokio::test]
async fn server_error_is_rejection() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/consumers/"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let err = adapter(&server)
        .create_consumer(&ConsumerRequest { custom_id: "c1".to_string(), username: None })
        .await
        .unwrap_err();
    assert!(matches!(err, RouteplaneError::BackendRejected { status: 500, .. }));
    assert!(!err.is_skippable());
}

#[tokio::test]
async fn deletes_tolerate_missing_objects() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/routes/r-gone"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/plugins/p-gone"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let adapter = adapter(&server);
    adapter.delete_route("r-gone").await.unwrap();
    adapter.remove_plugin("p-gone").await.unwrap();
}

#[tokio::test]
async fn delete_requires_id() {
    let server = MockServer::start().await;
    let err = adapter(&server).delete_service("").await.unwrap_err();
    assert!(matches!(err, RouteplaneError::Validation { .. }));
}

#[tokio::test]
async fn plugin_upsert_skips_disabled_plugin() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"version": "2.8.1", "configuration": {"plugins": ["acl"]}})),
        )
        .mount(&server)
        .await;

    let result = adapter(&server)
        .create_or_update_plugin(&PluginRequest::new("domain-policy", json!({})))
        .await
        .unwrap();
    assert!(result.is_none());
}

#[tokio::test]
async fn plugin_upsert_overwrites_existing_instance() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"version": "2.8.1", "configuration": {"plugins": ["acl"]}})),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/plugins/"))
        .and(query_param("name", "acl"))
        .and(query_param("route_id", "r1"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"data": [{"id": "p1", "name": "acl"}], "total": 1})),
        )
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/plugins/"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"id": "p1", "name": "acl", "config": {"whitelist": ["c"]}})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let plugin = adapter(&server)
        .create_or_update_plugin(&PluginRequest::new("acl", json!({"whitelist": ["c"]})).on_route("r1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(plugin.id, "p1");
    assert!(plugin.enabled);
}

#[tokio::test]
async fn routes_are_listed_by_tag() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/routes/"))
        .and(query_param("tags", "upstream:u1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{"id": "r1", "paths": ["/a"], "tags": ["upstream:u1"]}],
            "next": null
        })))
        .mount(&server)
        .await;

    let routes = adapter(&server).get_routes_with_tag("upstream:u1").await.unwrap();
    assert_eq!(routes.len(), 1);
    assert_eq!(routes[0].paths.as_deref(), Some(&["/a".to_string()][..]));
}

#[tokio::test]
async fn version_is_read_from_node_info() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"version": "3.4.0"})))
        .mount(&server)
        .await;

    assert_eq!(adapter(&server).get_version().await.unwrap(), "3.4.0");
}
