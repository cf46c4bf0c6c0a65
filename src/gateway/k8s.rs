//! # Kubernetes Ingress Applier
//!
//! Builds `networking.k8s.io/v1` ingresses for zones and upserts them with
//! kube. Updates are JSON merge patches so annotations set by operators on
//! an existing ingress survive; options with a `None` value clear theirs.

use crate::errors::{Result, RouteplaneError};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use tracing::{debug, error, info};

pub const REWRITE_HOST_KEY: &str = "nginx.ingress.kubernetes.io/upstream-vhost";
pub const REWRITE_PATH_KEY: &str = "nginx.ingress.kubernetes.io/rewrite-target";
pub const USE_REGEX_KEY: &str = "nginx.ingress.kubernetes.io/use-regex";
pub const SERVICE_PROTOCOL_KEY: &str = "nginx.ingress.kubernetes.io/backend-protocol";
pub const LOCATION_SNIPPET_KEY: &str = "nginx.ingress.kubernetes.io/configuration-snippet";

/// Protocol spoken between the gateway and the backend service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendProtocol {
    Http,
    Https,
    Grpc,
    Grpcs,
}

impl BackendProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendProtocol::Http => "HTTP",
            BackendProtocol::Https => "HTTPS",
            BackendProtocol::Grpc => "GRPC",
            BackendProtocol::Grpcs => "GRPCS",
        }
    }
}

/// One host+path rule of an ingress
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressRoute {
    pub domain: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressBackend {
    pub service_name: String,
    pub service_port: i32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RouteOptions {
    pub rewrite_host: Option<String>,
    pub rewrite_path: Option<String>,
    pub use_regex: bool,
    pub enable_tls: bool,
    pub backend_protocol: Option<BackendProtocol>,
    /// Extra annotations; `None` removes the key from an existing ingress
    pub annotations: BTreeMap<String, Option<String>>,
    pub location_snippet: Option<String>,
}

/// Everything needed to render one ingress
#[derive(Debug, Clone, PartialEq)]
pub struct IngressSpec {
    pub namespace: String,
    pub name: String,
    pub routes: Vec<IngressRoute>,
    pub backend: IngressBackend,
    pub options: RouteOptions,
}

impl IngressSpec {
    pub fn ingress_name(&self) -> String {
        self.name.to_lowercase()
    }
}

/// Annotations derived from route options, `Null` meaning "remove"
pub fn option_annotations(options: &RouteOptions) -> Map<String, Value> {
    let mut annotations = Map::new();
    if let Some(host) = &options.rewrite_host {
        annotations.insert(REWRITE_HOST_KEY.to_string(), json!(host));
    }
    if let Some(path) = &options.rewrite_path {
        annotations.insert(REWRITE_PATH_KEY.to_string(), json!(path));
    }
    if options.use_regex {
        annotations.insert(USE_REGEX_KEY.to_string(), json!("true"));
    }
    let protocol = options.backend_protocol.map(|p| json!(p.as_str())).unwrap_or(Value::Null);
    annotations.insert(SERVICE_PROTOCOL_KEY.to_string(), protocol);
    for (key, value) in &options.annotations {
        annotations.insert(key.clone(), value.as_ref().map(|v| json!(v)).unwrap_or(Value::Null));
    }
    if let Some(snippet) = &options.location_snippet {
        annotations.insert(LOCATION_SNIPPET_KEY.to_string(), json!(snippet));
    }
    annotations
}

/// Render the ingress manifest; cleared annotations stay as `null`
pub fn ingress_manifest(spec: &IngressSpec) -> Value {
    let mut hosts: Vec<&str> = Vec::new();
    let mut paths_by_host: BTreeMap<&str, Vec<Value>> = BTreeMap::new();
    for route in &spec.routes {
        if !hosts.contains(&route.domain.as_str()) {
            hosts.push(&route.domain);
        }
        paths_by_host.entry(&route.domain).or_default().push(json!({
            "path": route.path,
            "pathType": "ImplementationSpecific",
            "backend": {
                "service": {
                    "name": spec.backend.service_name,
                    "port": { "number": spec.backend.service_port }
                }
            }
        }));
    }

    let rules: Vec<Value> = hosts
        .iter()
        .map(|host| {
            json!({
                "host": host,
                "http": { "paths": paths_by_host.get(host).cloned().unwrap_or_default() }
            })
        })
        .collect();

    let mut ingress_spec = json!({ "rules": rules });
    if spec.options.enable_tls {
        ingress_spec["tls"] = json!([{ "hosts": hosts }]);
    }

    json!({
        "apiVersion": "networking.k8s.io/v1",
        "kind": "Ingress",
        "metadata": {
            "name": spec.ingress_name(),
            "namespace": spec.namespace,
            "annotations": Value::Object(option_annotations(&spec.options)),
        },
        "spec": ingress_spec,
    })
}

fn strip_cleared_annotations(manifest: &mut Value) {
    if let Some(annotations) =
        manifest.pointer_mut("/metadata/annotations").and_then(Value::as_object_mut)
    {
        annotations.retain(|_, value| !value.is_null());
    }
}

/// Ingress and gateway-service operations on one cluster
#[async_trait]
pub trait IngressApplier: Send + Sync + std::fmt::Debug {
    /// Whether the gateway service exposes an https port
    async fn is_gateway_support_https(&self, namespace: &str, service: &str) -> Result<bool>;

    /// Create or merge-update an ingress, returning whether it already existed
    async fn create_or_update_ingress(&self, spec: &IngressSpec) -> Result<bool>;

    /// Delete an ingress; a missing ingress is not an error
    async fn delete_ingress(&self, namespace: &str, name: &str) -> Result<()>;

    /// First port of a service, `None` when the service does not exist
    async fn service_port(&self, namespace: &str, service: &str) -> Result<Option<i32>>;
}

#[derive(Clone)]
pub struct KubeIngressApplier {
    client: Client,
    field_manager: String,
}

impl std::fmt::Debug for KubeIngressApplier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeIngressApplier").field("field_manager", &self.field_manager).finish()
    }
}

impl KubeIngressApplier {
    /// Connect with a kubeconfig file, or in-cluster/default configuration
    pub async fn connect(kubeconfig: Option<&str>, field_manager: impl Into<String>) -> Result<Self> {
        let client = match kubeconfig {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                    RouteplaneError::config(format!("Failed to read kubeconfig {}: {}", path, e))
                })?;
                let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .map_err(|e| {
                        RouteplaneError::config(format!("Invalid kubeconfig {}: {}", path, e))
                    })?;
                Client::try_from(config)
                    .map_err(|e| RouteplaneError::kubernetes(e, "Failed to build kube client"))?
            }
            None => Client::try_default()
                .await
                .map_err(|e| RouteplaneError::kubernetes(e, "Failed to build kube client"))?,
        };
        Ok(Self::new(client, field_manager))
    }

    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self { client, field_manager: field_manager.into() }
    }
}

fn is_not_found(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(response) if response.code == 404)
}

#[async_trait]
impl IngressApplier for KubeIngressApplier {
    async fn is_gateway_support_https(&self, namespace: &str, service: &str) -> Result<bool> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let svc = api.get(service).await.map_err(|e| {
            error!(error = %e, namespace, service, "Failed to read gateway service");
            RouteplaneError::kubernetes(e, format!("Failed to read service {}/{}", namespace, service))
        })?;
        let ports = svc.spec.and_then(|spec| spec.ports).unwrap_or_default();
        Ok(ports.iter().any(|port| port.port == 443 || port.port == 8443))
    }

    async fn create_or_update_ingress(&self, spec: &IngressSpec) -> Result<bool> {
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), &spec.namespace);
        let name = spec.ingress_name();
        let existing = api.get_opt(&name).await.map_err(|e| {
            RouteplaneError::kubernetes(e, format!("Failed to read ingress {}/{}", spec.namespace, name))
        })?;

        let mut manifest = ingress_manifest(spec);
        match existing {
            None => {
                strip_cleared_annotations(&mut manifest);
                let ingress: Ingress = serde_json::from_value(manifest)?;
                debug!(namespace = %spec.namespace, name = %name, "Creating ingress");
                api.create(&PostParams::default(), &ingress).await.map_err(|e| {
                    error!(error = %e, namespace = %spec.namespace, name = %name, "Failed to create ingress");
                    RouteplaneError::kubernetes(e, format!("Failed to create ingress {}", name))
                })?;
                info!(namespace = %spec.namespace, name = %name, "Ingress created");
                Ok(false)
            }
            Some(_) => {
                let params = PatchParams {
                    field_manager: Some(self.field_manager.clone()),
                    ..Default::default()
                };
                api.patch(&name, &params, &Patch::Merge(&manifest)).await.map_err(|e| {
                    error!(error = %e, namespace = %spec.namespace, name = %name, "Failed to update ingress");
                    RouteplaneError::kubernetes(e, format!("Failed to update ingress {}", name))
                })?;
                info!(namespace = %spec.namespace, name = %name, "Ingress updated");
                Ok(true)
            }
        }
    }

    async fn delete_ingress(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), namespace);
        let name = name.to_lowercase();
        match api.delete(&name, &DeleteParams::default()).await {
            Ok(_) => {
                info!(namespace, name = %name, "Ingress deleted");
                Ok(())
            }
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => {
                error!(error = %e, namespace, name = %name, "Failed to delete ingress");
                Err(RouteplaneError::kubernetes(e, format!("Failed to delete ingress {}", name)))
            }
        }
    }

    async fn service_port(&self, namespace: &str, service: &str) -> Result<Option<i32>> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let svc = api.get_opt(service).await.map_err(|e| {
            RouteplaneError::kubernetes(e, format!("Failed to read service {}/{}", namespace, service))
        })?;
        Ok(svc
            .and_then(|svc| svc.spec)
            .and_then(|spec| spec.ports)
            .and_then(|ports| ports.first().map(|port| port.port)))
    }
}
