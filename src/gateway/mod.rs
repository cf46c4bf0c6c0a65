//! # Gateway Backends
//!
//! [`GatewayAdapter`] is the capability set over one gateway backend. Each
//! cluster resolves to exactly one implementation: the Kong admin API, the
//! mesh gateway, or [`UnattachedAdapter`] when no provider is configured.
//! Kubernetes-scheduled clusters additionally get an [`IngressApplier`].

pub mod adapter;
pub mod dto;
pub mod k8s;
pub mod kong;
pub mod mesh;
pub mod resolver;
pub mod unattached;

pub use adapter::GatewayAdapter;
pub use k8s::{
    BackendProtocol, IngressApplier, IngressBackend, IngressRoute, IngressSpec, KubeIngressApplier,
    RouteOptions,
};
pub use kong::KongAdapter;
pub use mesh::MeshAdapter;
pub use resolver::{ConfiguredResolver, GatewayResolver};
pub use unattached::UnattachedAdapter;
