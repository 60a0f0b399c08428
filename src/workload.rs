//! Workload and service-binding models.
//!
//! A [`Workload`] is always built fresh from live cluster state and never
//! cached beyond a single operation; the cluster is the source of truth.

use std::collections::BTreeMap;
use std::fmt;

use kube::core::{ApiResource, DynamicObject, GroupVersionKind};

use crate::cluster::object;
use crate::error::Error;

/// Resource kinds the controller can toggle between modes.
pub const SCALABLE_KINDS: [ResourceKind; 3] = [
    ResourceKind::Deployment,
    ResourceKind::StatefulSet,
    ResourceKind::ReplicaSet,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Deployment,
    StatefulSet,
    ReplicaSet,
    Service,
}

impl ResourceKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deployment => "Deployment",
            Self::StatefulSet => "StatefulSet",
            Self::ReplicaSet => "ReplicaSet",
            Self::Service => "Service",
        }
    }

    /// `kind/name` reference form accepted by kubectl.
    #[must_use]
    pub fn kubectl_name(&self) -> String {
        self.as_str().to_ascii_lowercase()
    }

    #[must_use]
    pub fn api_resource(&self) -> ApiResource {
        let gvk = match self {
            Self::Service => GroupVersionKind::gvk("", "v1", "Service"),
            other => GroupVersionKind::gvk("apps", "v1", other.as_str()),
        };
        ApiResource::from_gvk(&gvk)
    }

    #[must_use]
    pub fn is_scalable(&self) -> bool {
        !matches!(self, Self::Service)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ResourceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "deployment" => Ok(Self::Deployment),
            "statefulset" => Ok(Self::StatefulSet),
            "replicaset" => Ok(Self::ReplicaSet),
            "service" => Ok(Self::Service),
            other => Err(Error::Config(format!("unknown resource kind: {other}"))),
        }
    }
}

/// Identifies one namespaced resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub namespace: String,
    pub name: String,
}

impl ResourceRef {
    #[must_use]
    pub fn new(kind: ResourceKind, namespace: &str, name: &str) -> Self {
        Self {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// Stable display key, `namespace/kind/name` lowercased.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}/{}/{}", self.namespace, self.kind, self.name).to_ascii_lowercase()
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Traffic-routing mode of a workload. `Remote` is the default for any
/// workload not currently carrying the proxy stub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Remote,
    Local,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Remote => f.write_str("remote"),
            Self::Local => f.write_str("local"),
        }
    }
}

impl std::str::FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "remote" => Ok(Self::Remote),
            "local" => Ok(Self::Local),
            other => Err(Error::Config(format!(
                "unknown mode: {other} (expected local or remote)"
            ))),
        }
    }
}

/// A scalable resource eligible for mode toggling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workload {
    pub kind: ResourceKind,
    pub namespace: String,
    pub name: String,
    pub replicas: i64,
    pub local_port: u16,
}

impl Workload {
    /// Builds a workload from a live object.
    ///
    /// Returns `None` when the local-port annotation is absent (the resource
    /// is simply outside scope, not an error) and a
    /// [`Error::ReplicaCountViolation`] when the resource runs anything other
    /// than one replica.
    pub fn from_object(
        kind: ResourceKind,
        obj: &DynamicObject,
        annotation_key: &str,
    ) -> Option<Result<Self, Error>> {
        let port = object::annotation(obj, annotation_key)?;
        let namespace = obj.metadata.namespace.clone().unwrap_or_default();
        let name = obj.metadata.name.clone().unwrap_or_default();
        let rref = ResourceRef::new(kind, &namespace, &name);

        let local_port = match port.trim().parse::<u16>() {
            Ok(p) => p,
            Err(_) => {
                return Some(Err(Error::Config(format!(
                    "workload {rref} has a non-numeric local port annotation: {port:?}"
                ))))
            }
        };

        let replicas = object::replicas(obj).unwrap_or(0);
        if replicas != 1 {
            return Some(Err(Error::ReplicaCountViolation {
                workload: rref.key(),
                replicas,
            }));
        }

        Some(Ok(Self {
            kind,
            namespace,
            name,
            replicas,
            local_port,
        }))
    }

    #[must_use]
    pub fn resource_ref(&self) -> ResourceRef {
        ResourceRef::new(self.kind, &self.namespace, &self.name)
    }

    #[must_use]
    pub fn key(&self) -> String {
        self.resource_ref().key()
    }
}

impl fmt::Display for Workload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// The Service fronting a workload. Name and app label must match the
/// workload for local mode to be addressable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceBinding {
    pub namespace: String,
    pub name: String,
    pub selector: BTreeMap<String, String>,
    pub target_port: u16,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::deployment_object;

    const ANNOTATION: &str = "devexy/local-port";

    #[test]
    fn resource_ref_key_is_lowercased() {
        let rref = ResourceRef::new(ResourceKind::Deployment, "Dev", "API");
        assert_eq!(rref.key(), "dev/deployment/api");
    }

    #[test]
    fn kind_round_trips_through_strings() {
        for kind in SCALABLE_KINDS {
            assert_eq!(kind.as_str().parse::<ResourceKind>().unwrap(), kind);
        }
        assert!("cronjob".parse::<ResourceKind>().is_err());
    }

    #[test]
    fn annotated_single_replica_workload_is_eligible() {
        let obj = deployment_object("dev", "api", 1, Some(("devexy/local-port", "8080")));
        let workload = Workload::from_object(ResourceKind::Deployment, &obj, ANNOTATION)
            .unwrap()
            .unwrap();
        assert_eq!(workload.local_port, 8080);
        assert_eq!(workload.key(), "dev/deployment/api");
    }

    #[test]
    fn missing_annotation_is_skipped_not_an_error() {
        let obj = deployment_object("dev", "api", 1, None);
        assert!(Workload::from_object(ResourceKind::Deployment, &obj, ANNOTATION).is_none());
    }

    #[test]
    fn replica_count_violation_is_reported() {
        let obj = deployment_object("dev", "api", 2, Some(("devexy/local-port", "8080")));
        let err = Workload::from_object(ResourceKind::Deployment, &obj, ANNOTATION)
            .unwrap()
            .unwrap_err();
        match err {
            Error::ReplicaCountViolation { workload, replicas } => {
                assert_eq!(workload, "dev/deployment/api");
                assert_eq!(replicas, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn garbage_port_annotation_is_an_error() {
        let obj = deployment_object("dev", "api", 1, Some(("devexy/local-port", "eighty")));
        assert!(Workload::from_object(ResourceKind::Deployment, &obj, ANNOTATION)
            .unwrap()
            .is_err());
    }
}
