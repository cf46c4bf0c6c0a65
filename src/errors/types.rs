//! # Error Types
//!
//! Error taxonomy for the routeplane reconciliation engine using `thiserror`.

/// Custom result type for routeplane operations
pub type Result<T> = std::result::Result<T, RouteplaneError>;

/// Main error type for the routeplane control plane
#[derive(thiserror::Error, Debug)]
pub enum RouteplaneError {
    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Database and storage errors
    #[error("Database error: {context}")]
    Database {
        #[source]
        source: sqlx::Error,
        context: String,
    },

    /// Serialization/deserialization errors
    #[error("Serialization error: {context}")]
    Serialization {
        #[source]
        source: serde_json::Error,
        context: String,
    },

    /// Missing or malformed input, raised before any I/O
    #[error("Validation error: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    /// Resource conflict errors (domain already owned, duplicate name, lost create race)
    #[error("Resource conflict: {message}")]
    Conflict {
        message: String,
        resource_type: String,
    },

    /// Resource not found errors
    #[error("Resource not found: {resource_type} with ID '{id}'")]
    NotFound {
        resource_type: String,
        id: String,
    },

    /// Gateway backend not attached or unreachable
    #[error("Gateway backend unavailable: {message}")]
    BackendUnavailable {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Gateway backend answered with a non-success status
    #[error("Gateway backend rejected request: {message} (status: {status})")]
    BackendRejected {
        status: u16,
        message: String,
    },

    /// Gateway backend refused a route as invalid (HTTP 400)
    #[error("Gateway backend invalid request: {message}")]
    InvalidRequest {
        message: String,
    },

    /// Kubernetes API errors
    #[error("Kubernetes error: {context}")]
    Kubernetes {
        #[source]
        source: kube::Error,
        context: String,
    },

    /// Internal server errors
    #[error("Internal server error: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl RouteplaneError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a configuration error with source
    pub fn config_with_source<S: Into<String>>(
        message: S,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(source),
        }
    }

    /// Create a database error with context
    pub fn database<S: Into<String>>(source: sqlx::Error, context: S) -> Self {
        Self::Database {
            source,
            context: context.into(),
        }
    }

    /// Create a validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
            field: None,
        }
    }

    /// Create a validation error with field information
    pub fn validation_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Validation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a not found error
    pub fn not_found<R: Into<String>, I: Into<String>>(resource_type: R, id: I) -> Self {
        Self::NotFound {
            resource_type: resource_type.into(),
            id: id.into(),
        }
    }

    /// Create a conflict error
    pub fn conflict<M: Into<String>, R: Into<String>>(message: M, resource_type: R) -> Self {
        Self::Conflict {
            message: message.into(),
            resource_type: resource_type.into(),
        }
    }

    /// Error returned by every call on a cluster without a gateway provider
    pub fn not_attached<S: AsRef<str>>(cluster: S) -> Self {
        Self::BackendUnavailable {
            message: format!("gateway not attached to cluster {}", cluster.as_ref()),
            source: None,
        }
    }

    /// Create a backend unavailable error
    pub fn backend_unavailable<S: Into<String>>(message: S) -> Self {
        Self::BackendUnavailable {
            message: message.into(),
            source: None,
        }
    }

    /// Create a backend rejected error
    pub fn backend_rejected<S: Into<String>>(status: u16, message: S) -> Self {
        Self::BackendRejected {
            status,
            message: message.into(),
        }
    }

    /// Create an invalid request error
    pub fn invalid_request<S: Into<String>>(message: S) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Create a kubernetes error with context
    pub fn kubernetes<S: Into<String>>(source: kube::Error, context: S) -> Self {
        Self::Kubernetes {
            source,
            context: context.into(),
        }
    }

    /// Create an internal server error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
            source: None,
        }
    }

    /// Get the HTTP status code that should be returned for this error
    pub fn status_code(&self) -> u16 {
        match self {
            RouteplaneError::Config { .. } => 500,
            RouteplaneError::Database { .. } => 500,
            RouteplaneError::Serialization { .. } => 500,
            RouteplaneError::Validation { .. } => 400,
            RouteplaneError::Conflict { .. } => 409,
            RouteplaneError::NotFound { .. } => 404,
            RouteplaneError::BackendUnavailable { .. } => 503,
            RouteplaneError::BackendRejected { .. } => 502,
            RouteplaneError::InvalidRequest { .. } => 400,
            RouteplaneError::Kubernetes { .. } => 502,
            RouteplaneError::Internal { .. } => 500,
        }
    }

    /// Check if this error should be retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RouteplaneError::Database { .. } | RouteplaneError::BackendUnavailable { .. }
        )
    }

    /// Whether a reconciliation batch may log and skip this error instead of aborting
    pub fn is_skippable(&self) -> bool {
        matches!(self, RouteplaneError::InvalidRequest { .. })
    }
}

// Error conversions for common external error types
impl From<sqlx::Error> for RouteplaneError {
    fn from(error: sqlx::Error) -> Self {
        Self::Database {
            source: error,
            context: "Database operation failed".to_string(),
        }
    }
}

impl From<serde_json::Error> for RouteplaneError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization {
            source: error,
            context: "JSON serialization failed".to_string(),
        }
    }
}

impl From<config::ConfigError> for RouteplaneError {
    fn from(error: config::ConfigError) -> Self {
        Self::config_with_source("Configuration loading failed", Box::new(error))
    }
}

impl From<reqwest::Error> for RouteplaneError {
    fn from(error: reqwest::Error) -> Self {
        let message = match error.url() {
            Some(url) => format!("request to {} failed", url),
            None => "gateway request failed".to_string(),
        };
        Self::BackendUnavailable {
            message,
            source: Some(Box::new(error)),
        }
    }
}

impl From<kube::Error> for RouteplaneError {
    fn from(error: kube::Error) -> Self {
        Self::Kubernetes {
            source: error,
            context: "Kubernetes API call failed".to_string(),
        }
    }
}

impl From<validator::ValidationErrors> for RouteplaneError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let message = errors
            .field_errors()
            .iter()
            .map(|(field, field_errors)| {
                let error_messages: Vec<String> = field_errors
                    .iter()
                    .map(|e| e.message.as_ref().map_or("Invalid value".to_string(), |m| m.to_string()))
                    .collect();
                format!("{}: {}", field, error_messages.join(", "))
            })
            .collect::<Vec<_>>()
            .join("; ");

        Self::validation(format!("Validation failed: {}", message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let error = RouteplaneError::config("Test configuration error");
        assert!(matches!(error, RouteplaneError::Config { .. }));
        assert_eq!(error.to_string(), "Configuration error: Test configuration error");
    }

    #[test]
    fn test_validation_error() {
        let error = RouteplaneError::validation_field("path must start with /", "api_path");
        if let RouteplaneError::Validation { field, .. } = error {
            assert_eq!(field, Some("api_path".to_string()));
        } else {
            panic!("expected validation error");
        }
    }

    #[test]
    fn test_not_attached_message() {
        let error = RouteplaneError::not_attached("terminus-dev");
        assert!(matches!(error, RouteplaneError::BackendUnavailable { .. }));
        assert_eq!(
            error.to_string(),
            "Gateway backend unavailable: gateway not attached to cluster terminus-dev"
        );
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(RouteplaneError::validation("test").status_code(), 400);
        assert_eq!(RouteplaneError::not_found("package", "test").status_code(), 404);
        assert_eq!(RouteplaneError::conflict("test", "domain").status_code(), 409);
        assert_eq!(RouteplaneError::backend_rejected(403, "denied").status_code(), 502);
        assert_eq!(RouteplaneError::not_attached("c").status_code(), 503);
        assert_eq!(RouteplaneError::internal("test").status_code(), 500);
    }

    #[test]
    fn test_skippable_and_retryable() {
        assert!(RouteplaneError::invalid_request("bad path").is_skippable());
        assert!(!RouteplaneError::backend_rejected(500, "boom").is_skippable());
        assert!(RouteplaneError::backend_unavailable("timeout").is_retryable());
        assert!(!RouteplaneError::validation("test").is_retryable());
        assert!(!RouteplaneError::conflict("taken", "domain").is_retryable());
    }

    #[test]
    fn test_error_conversions() {
        let json_error = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let error: RouteplaneError = json_error.into();
        assert!(matches!(error, RouteplaneError::Serialization { .. }));
    }
}
