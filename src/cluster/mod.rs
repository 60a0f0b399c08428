//! Cluster access: raw API seam, retrying client, discovery and patching.

pub mod api;
pub mod client;
pub mod discovery;
pub mod object;
pub mod proxy;

pub use api::{ClusterApi, KubeClusterApi, FIELD_MANAGER};
pub use client::{ClusterClient, RetryPolicy};
pub use discovery::{Discovered, ResourceDiscovery};
pub use proxy::{ProxyPatch, ProxyPatcher};
