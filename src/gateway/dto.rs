//! Wire types exchanged with gateway backends.
//!
//! Field names follow the Kong admin API; the mesh adapter reuses the same
//! shapes for the objects it synthesizes locally.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reference to another backend object by id
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRef {
    pub id: String,
}

impl ObjectRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceRequest {
    /// Existing service to overwrite; never sent in the body
    #[serde(skip)]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_timeout: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_timeout: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub write_timeout: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceResponse {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteRequest {
    #[serde(skip)]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub protocols: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub methods: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hosts: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub paths: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strip_path: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preserve_host: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub regex_priority: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<ObjectRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteResponse {
    pub id: String,
    #[serde(default)]
    pub protocols: Vec<String>,
    #[serde(default)]
    pub methods: Option<Vec<String>>,
    #[serde(default)]
    pub hosts: Option<Vec<String>>,
    #[serde(default)]
    pub paths: Option<Vec<String>>,
    #[serde(default)]
    pub service: Option<ObjectRef>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
}

/// Plugin instance to create, overwrite or look up
///
/// Scope fields left `None` are not part of a lookup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consumer_id: Option<String>,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub config: Value,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
}

impl PluginRequest {
    pub fn new(name: impl Into<String>, config: Value) -> Self {
        Self { name: name.into(), config, enabled: true, ..Default::default() }
    }

    pub fn on_route(mut self, route_id: impl Into<String>) -> Self {
        self.route_id = Some(route_id.into());
        self
    }

    pub fn on_service(mut self, service_id: impl Into<String>) -> Self {
        self.service_id = Some(service_id.into());
        self
    }

    pub fn on_consumer(mut self, consumer_id: impl Into<String>) -> Self {
        self.consumer_id = Some(consumer_id.into());
        self
    }

    /// Query string identifying the plugin's scope
    pub fn lookup_query(&self) -> Vec<(&'static str, String)> {
        let mut query = vec![("name", self.name.clone())];
        let scopes = [
            ("route_id", &self.route_id),
            ("service_id", &self.service_id),
            ("consumer_id", &self.consumer_id),
        ];
        for (key, value) in scopes {
            if let Some(value) = value.as_ref().filter(|v| !v.is_empty()) {
                query.push((key, value.clone()));
            }
        }
        query
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginResponse {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub service_id: Option<String>,
    #[serde(default)]
    pub route_id: Option<String>,
    #[serde(default)]
    pub consumer_id: Option<String>,
    #[serde(default)]
    pub config: Value,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub created_at: Option<i64>,
}

fn enabled_by_default() -> bool {
    true
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PluginPage {
    #[serde(default)]
    pub data: Vec<PluginResponse>,
    #[serde(default)]
    pub total: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsumerRequest {
    pub custom_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsumerResponse {
    pub id: String,
    #[serde(default)]
    pub custom_id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub created_at: Option<i64>,
}

/// Credential body; only the fields meaningful to the auth plugin are set
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_uris: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CredentialRequest {
    pub consumer_id: String,
    pub plugin_name: String,
    pub config: Credential,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CredentialPage {
    #[serde(default)]
    pub data: Vec<Credential>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpstreamRequest {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub healthchecks: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpstreamResponse {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetRequest {
    pub target: String,
    pub weight: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetResponse {
    pub id: String,
    pub target: String,
    #[serde(default)]
    pub weight: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetHealth {
    #[serde(default)]
    pub id: String,
    pub target: String,
    #[serde(default)]
    pub weight: i32,
    #[serde(default)]
    pub health: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpstreamHealthPage {
    #[serde(default)]
    pub data: Vec<TargetHealth>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoutePage {
    #[serde(default)]
    pub data: Vec<RouteResponse>,
    #[serde(default)]
    pub next: Option<String>,
}

/// Node information returned by `GET /`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeInfo {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub configuration: NodeConfiguration,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeConfiguration {
    #[serde(default)]
    pub plugins: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn service_request_never_serializes_id() {
        let req = ServiceRequest {
            id: Some("svc-1".to_string()),
            url: Some("http://backend:8080/api".to_string()),
            ..Default::default()
        };
        assert_eq!(serde_json::to_value(&req).unwrap(), json!({"url": "http://backend:8080/api"}));
    }

    #[test]
    fn plugin_lookup_query_skips_blank_scopes() {
        let req = PluginRequest::new("acl", json!({})).on_route("r1");
        assert_eq!(
            req.lookup_query(),
            vec![("name", "acl".to_string()), ("route_id", "r1".to_string())]
        );
    }

    #[test]
    fn node_info_reads_enabled_plugins() {
        let info: NodeInfo = serde_json::from_value(json!({
            "version": "2.8.1",
            "configuration": {"plugins": ["acl", "key-auth"], "other": 1}
        }))
        .unwrap();
        assert_eq!(info.version, "2.8.1");
        assert_eq!(info.configuration.plugins, vec!["acl", "key-auth"]);
    }
}
