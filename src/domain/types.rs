//! String-backed enums shared by records, requests and configuration.
//!
//! Every enum stores as TEXT in Postgres and serializes to the same string.

use serde::{Deserialize, Serialize};
use sqlx::encode::IsNull;
use sqlx::error::BoxDynError;
use sqlx::postgres::{PgArgumentBuffer, PgTypeInfo, PgValueRef};
use sqlx::{Decode, Encode, Postgres, Type};
use std::fmt;
use std::str::FromStr;

macro_rules! string_enum {
    (
        $(#[$meta:meta])*
        $name:ident default $default:ident {
            $($(#[$vmeta:meta])* $variant:ident => $value:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $($(#[$vmeta])* #[serde(rename = $value)] $variant),+
        }

        impl $name {
            pub const fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $value),+
                }
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::$default
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($value => Ok(Self::$variant),)+
                    other => Err(format!("invalid {} '{}'", stringify!($name), other)),
                }
            }
        }

        impl Type<Postgres> for $name {
            fn type_info() -> PgTypeInfo {
                <String as Type<Postgres>>::type_info()
            }

            fn compatible(ty: &PgTypeInfo) -> bool {
                <String as Type<Postgres>>::compatible(ty)
            }
        }

        impl<'q> Encode<'q, Postgres> for $name {
            fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> Result<IsNull, BoxDynError> {
                <&str as Encode<'q, Postgres>>::encode_by_ref(&self.as_str(), buf)
            }
        }

        impl<'r> Decode<'r, Postgres> for $name {
            fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
                let s = <&str as Decode<'r, Postgres>>::decode(value)?;
                Ok(s.parse::<$name>()?)
            }
        }
    };
}

string_enum!(
    /// Publishing mode of a package
    Scene default OpenApi {
        /// Unified entry spanning inner and outer hosts
        Unity => "unity",
        /// Shared tenant ingress
        Hub => "hub",
        /// Web api entry for a runtime service
        WebApi => "webapi",
        /// Open api entry with consumer auth
        OpenApi => "openapi",
    }
);

impl Scene {
    /// Scenes shared across tenants and keyed by their domain set
    pub fn is_shared_entry(&self) -> bool {
        matches!(self, Scene::Unity | Scene::Hub)
    }

    /// Scenes that synthesize auth/acl rules on creation
    pub fn synthesizes_rules(&self) -> bool {
        matches!(self, Scene::OpenApi | Scene::WebApi)
    }
}

string_enum!(
    /// Consumer authentication applied to a package
    AuthType default None {
        None => "",
        KeyAuth => "key-auth",
        OAuth2 => "oauth2",
        SignAuth => "sign-auth",
        HmacAuth => "hmac-auth",
        /// Enforced by the cloud api gateway, never by a backend plugin
        AliyunApp => "aliyun-app",
    }
);

impl AuthType {
    /// Whether the auth is enforced by a gateway backend plugin
    pub fn is_gateway_plugin(&self) -> bool {
        !matches!(self, AuthType::None | AuthType::AliyunApp)
    }
}

string_enum!(
    /// ACL switch of a package; routes may inherit it
    AclType default Inherit {
        Inherit => "",
        On => "on",
        Off => "off",
    }
);

string_enum!(
    /// Kind of owner a domain is bound to
    DomainType default ServiceDefault {
        ServiceDefault => "service-default",
        ServiceCustom => "service-custom",
        Package => "package",
        Component => "component",
    }
);

string_enum!(
    /// Which lifecycle owns a zone
    ZoneType default Package {
        Package => "package",
        PackageNew => "packageNew",
        PackageApi => "packageApi",
        Unity => "unity",
    }
);

string_enum!(
    /// Where a package route forwards to
    RedirectType default Url {
        Url => "url",
        Service => "service",
    }
);

string_enum!(
    /// Who created a package route
    ApiOrigin default Custom {
        Custom => "custom",
        DiceYaml => "dice-yaml",
        Dice => "dice",
        Shadow => "shadow",
    }
);

impl ApiOrigin {
    /// Path and method of these routes are managed by the platform
    pub fn is_immutable(&self) -> bool {
        matches!(self, ApiOrigin::Dice | ApiOrigin::Shadow)
    }
}

string_enum!(
    /// Policy category of a package rule
    RuleCategory default Auth {
        Auth => "auth",
        Acl => "acl",
        Limit => "limit",
    }
);

impl RuleCategory {
    /// Compile order: auth and acl before rate limits
    pub fn order(&self) -> u8 {
        match self {
            RuleCategory::Auth => 0,
            RuleCategory::Acl => 1,
            RuleCategory::Limit => 2,
        }
    }
}

string_enum!(
    /// Gateway technology deployed in a cluster
    GatewayProvider default None {
        Kong => "kong",
        Mse => "mse",
        None => "none",
    }
);

string_enum!(
    /// Scheduler flavour of a cluster
    ClusterType default K8s {
        K8s => "k8s",
        Edas => "edas",
        Dcos => "dcos",
    }
);

impl ClusterType {
    /// Only kubernetes-scheduled clusters get ingress objects
    pub fn supports_ingress(&self) -> bool {
        matches!(self, ClusterType::K8s | ClusterType::Edas)
    }
}

string_enum!(
    /// How a new registration generation treats entries of the previous one
    RegisterMode default Replace {
        Replace => "replace",
        Append => "append",
    }
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enum_round_trips_through_str() {
        assert_eq!("hub".parse::<Scene>().unwrap(), Scene::Hub);
        assert_eq!(AuthType::AliyunApp.as_str(), "aliyun-app");
        assert_eq!("".parse::<AclType>().unwrap(), AclType::Inherit);
        assert!("bogus".parse::<ZoneType>().is_err());
    }

    #[test]
    fn enum_serde_uses_wire_names() {
        assert_eq!(serde_json::to_string(&ZoneType::PackageNew).unwrap(), "\"packageNew\"");
        let origin: ApiOrigin = serde_json::from_str("\"dice-yaml\"").unwrap();
        assert_eq!(origin, ApiOrigin::DiceYaml);
    }

    #[test]
    fn rule_category_order() {
        let mut categories = vec![RuleCategory::Limit, RuleCategory::Acl, RuleCategory::Auth];
        categories.sort_by_key(|c| c.order());
        assert_eq!(categories, vec![RuleCategory::Auth, RuleCategory::Acl, RuleCategory::Limit]);
    }

    #[test]
    fn immutable_origins() {
        assert!(ApiOrigin::Dice.is_immutable());
        assert!(ApiOrigin::Shadow.is_immutable());
        assert!(!ApiOrigin::DiceYaml.is_immutable());
    }
}
