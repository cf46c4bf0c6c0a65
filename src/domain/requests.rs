//! Validated request types accepted by the managers.

use super::types::*;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

lazy_static! {
    static ref PACKAGE_NAME_REGEX: Regex = Regex::new(r"^[a-zA-Z0-9_\-./]{1,255}$")
        .expect("PACKAGE_NAME_REGEX should be a valid regex pattern");
    static ref DOMAIN_REGEX: Regex =
        Regex::new(r"^(\*\.)?([a-zA-Z0-9]([a-zA-Z0-9-]*[a-zA-Z0-9])?\.)*[a-zA-Z0-9]([a-zA-Z0-9-]*[a-zA-Z0-9])?$")
            .expect("DOMAIN_REGEX should be a valid regex pattern");
}

/// Methods a route may be restricted to; empty means any method
pub const ALLOWED_METHODS: &[&str] = &["GET", "POST", "PUT", "DELETE", "PATCH", "HEAD", "OPTIONS"];

pub fn validate_package_name(name: &str) -> Result<(), ValidationError> {
    if PACKAGE_NAME_REGEX.is_match(name) {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_package_name"))
    }
}

pub fn validate_domain(domain: &str) -> Result<(), ValidationError> {
    if DOMAIN_REGEX.is_match(domain) {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_domain"))
    }
}

fn validate_domain_list(domains: &Vec<String>) -> Result<(), ValidationError> {
    for domain in domains {
        validate_domain(domain.trim())?;
    }
    Ok(())
}

pub fn validate_api_path(path: &str) -> Result<(), ValidationError> {
    if path.starts_with('/') && !path.contains(char::is_whitespace) {
        Ok(())
    } else {
        Err(ValidationError::new("api_path_must_start_with_slash"))
    }
}

pub fn validate_method(method: &str) -> Result<(), ValidationError> {
    if method.is_empty() || ALLOWED_METHODS.contains(&method.to_uppercase().as_str()) {
        Ok(())
    } else {
        Err(ValidationError::new("unsupported_method"))
    }
}

/// Scope shared by every package-level request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct Scope {
    #[validate(length(min = 1, message = "org id is required"))]
    pub org_id: String,
    #[validate(length(min = 1, message = "project id is required"))]
    pub project_id: String,
    #[validate(length(min = 1, message = "env is required"))]
    pub env: String,
    #[validate(length(min = 1, message = "cluster name is required"))]
    pub cluster_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreatePackageRequest {
    #[validate(custom(function = "validate_package_name"))]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub scene: Scene,
    #[serde(default)]
    pub auth_type: AuthType,
    #[serde(default)]
    pub acl_type: AclType,
    #[serde(default)]
    #[validate(custom(function = "validate_domain_list"))]
    pub bind_domain: Vec<String>,
    /// Explicit opt-in required by `aliyun-app` auth
    #[serde(default)]
    pub aliyun_bind: bool,
    #[validate(nested)]
    pub scope: Scope,
    #[serde(default)]
    pub runtime_service_id: String,
}

impl CreatePackageRequest {
    /// Scene-specific checks that derive validation cannot express
    pub fn check_scene(&self) -> std::result::Result<(), String> {
        if self.bind_domain.iter().all(|d| d.trim().is_empty()) {
            return Err("bind domain is required".to_string());
        }
        if self.auth_type == AuthType::AliyunApp && !self.aliyun_bind {
            return Err("aliyun-app auth requires the cloud api binding flag".to_string());
        }
        if self.scene == Scene::OpenApi
            && (self.auth_type == AuthType::None || self.acl_type == AclType::Inherit)
        {
            return Err("open api endpoints need an auth type and an acl switch".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePackageRequest {
    pub description: Option<String>,
    pub auth_type: Option<AuthType>,
    pub acl_type: Option<AclType>,
    #[validate(custom(function = "validate_domain_list"))]
    pub bind_domain: Option<Vec<String>>,
    #[serde(default)]
    pub aliyun_bind: bool,
}

/// Create or full-replace payload of a package route
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct PackageApiRequest {
    #[validate(custom(function = "validate_api_path"))]
    pub api_path: String,
    #[serde(default)]
    #[validate(custom(function = "validate_method"))]
    pub method: String,
    #[serde(default)]
    pub redirect_type: RedirectType,
    #[serde(default)]
    pub redirect_addr: String,
    #[serde(default)]
    pub redirect_path: String,
    #[serde(default)]
    pub runtime_service_id: String,
    #[serde(default)]
    pub origin: ApiOrigin,
    #[serde(default)]
    pub acl_type: AclType,
    #[serde(default)]
    pub description: String,
}

impl PackageApiRequest {
    pub fn normalized_method(&self) -> String {
        self.method.to_uppercase()
    }

    pub fn check_redirect(&self) -> std::result::Result<(), String> {
        match self.redirect_type {
            RedirectType::Url => {
                if !(self.redirect_addr.starts_with("http://")
                    || self.redirect_addr.starts_with("https://"))
                {
                    return Err(format!("invalid redirect address '{}'", self.redirect_addr));
                }
                url::Url::parse(&self.redirect_addr)
                    .map_err(|e| format!("invalid redirect address '{}': {}", self.redirect_addr, e))?;
            }
            RedirectType::Service => {
                if self.runtime_service_id.is_empty() {
                    return Err("service redirect requires a runtime service id".to_string());
                }
            }
        }
        Ok(())
    }
}

/// Shared tenant ingress request
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct HubPackageRequest {
    #[validate(nested)]
    pub scope: Scope,
    #[validate(length(min = 1, message = "at least one domain is required"))]
    #[validate(custom(function = "validate_domain_list"))]
    pub domains: Vec<String>,
    /// Path prefix routed through the hub, `/` when empty
    #[serde(default)]
    pub default_path: String,
}

/// Unified entry spanning an outer and an inner host
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct UnityPackageRequest {
    #[validate(nested)]
    pub scope: Scope,
    #[validate(custom(function = "validate_domain"))]
    pub outer_host: String,
    #[validate(custom(function = "validate_domain"))]
    pub inner_host: String,
    #[serde(default)]
    pub default_path: String,
}

/// Rate limits of a consumer on a package; unset units are unlimited
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitSpec {
    pub day: Option<u64>,
    pub hour: Option<u64>,
    pub minute: Option<u64>,
    pub second: Option<u64>,
}

impl LimitSpec {
    pub fn is_empty(&self) -> bool {
        self.day.is_none() && self.hour.is_none() && self.minute.is_none() && self.second.is_none()
    }
}

/// One api entry of an upstream registration
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamApiSpec {
    #[validate(length(min = 1, message = "api name is required"))]
    pub name: String,
    #[validate(custom(function = "validate_api_path"))]
    pub path: String,
    #[serde(default)]
    pub gateway_path: String,
    #[serde(default)]
    #[validate(custom(function = "validate_method"))]
    pub method: String,
    #[validate(length(min = 1, message = "api address is required"))]
    pub address: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub doc: serde_json::Value,
    #[serde(default)]
    pub is_inner: bool,
}

/// Bulk registration of the apis a service exposes
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamRegisterRequest {
    #[validate(length(min = 1, message = "org id is required"))]
    pub org_id: String,
    #[validate(length(min = 1, message = "project id is required"))]
    pub project_id: String,
    #[validate(length(min = 1, message = "env is required"))]
    pub env: String,
    #[serde(default)]
    pub az: String,
    #[serde(default)]
    pub app_name: String,
    #[serde(default)]
    pub app_id: String,
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub runtime_name: String,
    #[validate(length(min = 1, message = "upstream name is required"))]
    pub upstream_name: String,
    #[validate(length(min = 1, message = "register id is required"))]
    pub register_id: String,
    pub path_prefix: Option<String>,
    #[serde(default)]
    pub mode: RegisterMode,
    #[serde(default = "default_auto_bind")]
    pub auto_bind: bool,
    #[validate(nested)]
    pub api_list: Vec<UpstreamApiSpec>,
}

fn default_auto_bind() -> bool {
    true
}

/// Traffic policies attached to a runtime endpoint route
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndpointPolicies {
    pub cors: Option<serde_json::Value>,
    pub rate_limit: Option<serde_json::Value>,
}

/// A domain+path a runtime service asks to be exposed on
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct EndpointSpec {
    #[validate(length(min = 1, message = "endpoint domain is required"))]
    pub domain: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub backend_path: String,
    #[serde(default)]
    pub policies: EndpointPolicies,
}

/// Deployed service description used to publish runtime endpoints
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeServiceSpec {
    #[validate(nested)]
    pub scope: Scope,
    #[serde(default)]
    pub app_id: String,
    #[validate(length(min = 1, message = "app name is required"))]
    pub app_name: String,
    #[validate(length(min = 1, message = "service name is required"))]
    pub service_name: String,
    #[validate(length(min = 1, message = "runtime name is required"))]
    pub runtime_name: String,
    #[validate(length(min = 1, message = "inner address is required"))]
    pub inner_address: String,
    pub service_port: i32,
    #[serde(default)]
    pub group_namespace: String,
    #[serde(default)]
    pub group_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> Scope {
        Scope {
            org_id: "1".to_string(),
            project_id: "2".to_string(),
            env: "DEV".to_string(),
            cluster_name: "dev".to_string(),
        }
    }

    #[test]
    fn package_name_validation() {
        assert!(validate_package_name("shop-api_v1").is_ok());
        assert!(validate_package_name("bad name").is_err());
        assert!(validate_package_name("").is_err());
    }

    #[test]
    fn domain_validation() {
        assert!(validate_domain("api.example.com").is_ok());
        assert!(validate_domain("*.apps.example.com").is_ok());
        assert!(validate_domain("bad_domain!.com").is_err());
    }

    #[test]
    fn method_validation() {
        assert!(validate_method("").is_ok());
        assert!(validate_method("get").is_ok());
        assert!(validate_method("FETCH").is_err());
    }

    #[test]
    fn aliyun_auth_requires_binding_flag() {
        let request = CreatePackageRequest {
            name: "pkg".to_string(),
            scene: Scene::OpenApi,
            auth_type: AuthType::AliyunApp,
            acl_type: AclType::On,
            bind_domain: vec!["api.example.com".to_string()],
            scope: scope(),
            ..Default::default()
        };
        assert!(request.validate().is_ok());
        assert!(request.check_scene().is_err());

        let request = CreatePackageRequest { aliyun_bind: true, ..request };
        assert!(request.check_scene().is_ok());
    }

    #[test]
    fn bind_domain_required() {
        let request = CreatePackageRequest {
            name: "pkg".to_string(),
            acl_type: AclType::Off,
            scope: scope(),
            ..Default::default()
        };
        assert!(request.check_scene().is_err());
    }

    #[test]
    fn url_redirect_requires_http_address() {
        let request = PackageApiRequest {
            api_path: "/v1".to_string(),
            redirect_type: RedirectType::Url,
            redirect_addr: "ftp://x".to_string(),
            ..Default::default()
        };
        assert!(request.check_redirect().is_err());

        let request = PackageApiRequest {
            redirect_addr: "http://backend:8080".to_string(),
            ..request
        };
        assert!(request.check_redirect().is_ok());
    }

    #[test]
    fn upstream_request_defaults() {
        let request: UpstreamRegisterRequest = serde_json::from_value(serde_json::json!({
            "orgId": "1",
            "projectId": "2",
            "env": "dev",
            "upstreamName": "shop",
            "registerId": "r1",
            "apiList": [{"name": "/a", "path": "/a", "address": "http://shop:8080"}]
        }))
        .unwrap();
        assert!(request.auto_bind);
        assert_eq!(request.mode, RegisterMode::Replace);
        assert!(request.validate().is_ok());
    }
}
