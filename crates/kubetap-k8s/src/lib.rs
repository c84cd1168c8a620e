//! Kubernetes integration for kubetap
//!
//! This crate loads kubeconfig credentials, resolves selection patterns to
//! pods and services, and runs port-forward tunnel sessions.

mod client;
mod resolver;
mod selection;
mod tunnel;

pub use client::KubeClient;
pub use resolver::{ClusterSource, KubeSource, Resolver};
pub use selection::SelectionPattern;
pub use tunnel::{
    ForwardConnection, ForwardStream, ForwardTransport, KubeForwarder, TunnelSession, Upstream,
};

// Re-export types that are used in our public API
pub use kubetap_types::{
    ContainerInfo, EndpointIdentity, EndpointKind, Error, PodInfo, PodStatus, PortPair,
    Readiness, StopHandle,
};
