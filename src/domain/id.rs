//! Domain ID Types with NewType Pattern
//!
//! Type-safe wrappers for record identifiers so a package id can never be
//! passed where a zone id is expected. Each ID type implements Display,
//! FromStr, Serialize, Deserialize and the sqlx Postgres codec traits.

use serde::{Deserialize, Serialize};
use sqlx::encode::IsNull;
use sqlx::error::BoxDynError;
use sqlx::postgres::{PgArgumentBuffer, PgHasArrayType, PgTypeInfo, PgValueRef};
use sqlx::{Decode, Encode, Postgres, Type};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Macro to generate NewType ID wrappers with all required traits
macro_rules! domain_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new random ID
            pub fn new() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            /// Create an ID from an existing string (for database retrieval)
            pub fn from_string(s: String) -> Self {
                Self(s)
            }

            /// Get the inner string value
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Convert to inner string value
            pub fn into_string(self) -> String {
                self.0
            }

            /// Parse and validate a UUID string
            pub fn parse(s: &str) -> Result<Self, uuid::Error> {
                Uuid::parse_str(s)?;
                Ok(Self(s.to_string()))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl PartialEq<str> for $name {
            fn eq(&self, other: &str) -> bool {
                self.0 == other
            }
        }

        impl PartialEq<String> for $name {
            fn eq(&self, other: &String) -> bool {
                &self.0 == other
            }
        }

        // SQLx trait implementations for database compatibility
        impl Type<Postgres> for $name {
            fn type_info() -> PgTypeInfo {
                <String as Type<Postgres>>::type_info()
            }

            fn compatible(ty: &PgTypeInfo) -> bool {
                <String as Type<Postgres>>::compatible(ty)
            }
        }

        impl PgHasArrayType for $name {
            fn array_type_info() -> PgTypeInfo {
                <String as PgHasArrayType>::array_type_info()
            }
        }

        impl<'q> Encode<'q, Postgres> for $name {
            fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> Result<IsNull, BoxDynError> {
                <String as Encode<'q, Postgres>>::encode_by_ref(&self.0, buf)
            }
        }

        impl<'r> Decode<'r, Postgres> for $name {
            fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
                let s = <String as Decode<'r, Postgres>>::decode(value)?;
                Ok(Self(s))
            }
        }
    };
}

domain_id!(
    /// Unique identifier for a package (published endpoint)
    PackageId
);

domain_id!(
    /// Unique identifier for a route inside a package
    PackageApiId
);

domain_id!(
    /// Unique identifier for a zone
    ZoneId
);

domain_id!(
    /// Unique identifier for a built-in zone policy
    ZonePolicyId
);

domain_id!(
    /// Unique identifier for a domain binding
    DomainId
);

domain_id!(
    /// Unique identifier for a package rule
    RuleId
);

domain_id!(
    /// Unique identifier for an upstream registration scope
    UpstreamId
);

domain_id!(
    /// Unique identifier for one registered upstream api entry
    UpstreamApiId
);

domain_id!(
    /// Unique identifier for a registration generation snapshot
    RegisterRecordId
);

domain_id!(
    /// Unique identifier for a gateway consumer record
    ConsumerId
);

domain_id!(
    /// Unique identifier for an api bound on behalf of an upstream
    GatewayApiId
);

domain_id!(
    /// Unique identifier for a shared hub entry
    HubInfoId
);

domain_id!(
    /// Unique identifier for a runtime service
    RuntimeServiceId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn package_id_creation() {
        let id = PackageId::new();
        assert!(!id.as_str().is_empty());
        assert!(Uuid::parse_str(id.as_str()).is_ok());
    }

    #[test]
    fn zone_id_from_string() {
        let uuid_str = Uuid::new_v4().to_string();
        let id = ZoneId::from_string(uuid_str.clone());
        assert_eq!(id.as_str(), uuid_str);
        assert_eq!(id, uuid_str);
    }

    #[test]
    fn rule_id_invalid_uuid_fails() {
        assert!(RuleId::parse("not-a-uuid").is_err());
        assert!("also-not".parse::<RuleId>().is_err());
    }

    #[test]
    fn upstream_id_serializes_transparently() {
        let id = UpstreamId::from_string("abc".to_string());
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"abc\"");
        let back: UpstreamId = serde_json::from_str("\"abc\"").unwrap();
        assert_eq!(back, id);
    }
}
