//! Workload discovery and service binding resolution.
//!
//! Discovery re-queries the cluster on every call; nothing is cached. One
//! ineligible workload never blocks listing the rest.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::cluster::client::ClusterClient;
use crate::cluster::object;
use crate::error::{Error, Result};
use crate::settings::Settings;
use crate::workload::{ResourceKind, ResourceRef, ServiceBinding, Workload, SCALABLE_KINDS};

/// Outcome of one discovery pass: eligible workloads plus the per-workload
/// violations that excluded others.
#[derive(Debug, Default)]
pub struct Discovered {
    pub eligible: Vec<Workload>,
    pub violations: Vec<Error>,
}

impl Discovered {
    fn merge(&mut self, other: Discovered) {
        self.eligible.extend(other.eligible);
        self.violations.extend(other.violations);
    }
}

pub struct ResourceDiscovery {
    client: Arc<ClusterClient>,
    local_port_annotation: String,
}

impl ResourceDiscovery {
    #[must_use]
    pub fn new(client: Arc<ClusterClient>, settings: &Settings) -> Self {
        Self {
            client,
            local_port_annotation: settings.local_port_annotation.clone(),
        }
    }

    /// Lists eligible workloads in one namespace across all scalable kinds.
    ///
    /// A cluster-level list failure is fatal ([`Error::Discovery`]); replica
    /// count violations are collected and reported without aborting.
    pub async fn list_eligible(&self, namespace: &str) -> Result<Discovered> {
        let mut discovered = Discovered::default();
        for kind in SCALABLE_KINDS {
            let objects = self
                .client
                .list(kind, namespace)
                .await
                .map_err(|err| {
                    Error::Discovery(format!("listing {kind} in {namespace}: {err}"))
                })?;
            for obj in objects {
                match Workload::from_object(kind, &obj, &self.local_port_annotation) {
                    None => {
                        debug!(
                            kind = %kind,
                            namespace,
                            name = obj.metadata.name.as_deref().unwrap_or(""),
                            "no local-port annotation, outside scope"
                        );
                    }
                    Some(Ok(workload)) => discovered.eligible.push(workload),
                    Some(Err(violation)) => {
                        warn!(error = %violation, "workload excluded from discovery");
                        discovered.violations.push(violation);
                    }
                }
            }
        }
        Ok(discovered)
    }

    /// Lists eligible workloads across every namespace in the cluster.
    pub async fn list_all(&self) -> Result<Discovered> {
        let namespaces = self
            .client
            .list_namespaces()
            .await
            .map_err(|err| Error::Discovery(format!("listing namespaces: {err}")))?;

        let mut discovered = Discovered::default();
        for namespace in namespaces {
            discovered.merge(self.list_eligible(&namespace).await?);
        }
        Ok(discovered)
    }

    /// Resolves the Service fronting a workload.
    ///
    /// The Service must share the workload's name and `app` label; its target
    /// port is taken from the first port, falling back to the workload's
    /// first declared container port when the target port is named rather
    /// than numeric.
    pub async fn resolve_service_binding(&self, workload: &Workload) -> Result<ServiceBinding> {
        let service_ref =
            ResourceRef::new(ResourceKind::Service, &workload.namespace, &workload.name);
        let service = match self.client.get(&service_ref).await {
            Ok(service) => service,
            Err(Error::Kube(kube::Error::Api(err))) if err.code == 404 => {
                return Err(Error::Binding {
                    workload: workload.key(),
                    reason: format!("no service named {} in {}", workload.name, workload.namespace),
                })
            }
            Err(err) => return Err(err),
        };

        let selector = service_selector(&service);
        let workload_obj = self.client.get(&workload.resource_ref()).await?;
        let app_label = object::template_labels(&workload_obj)
            .get("app")
            .cloned()
            .unwrap_or_default();

        if selector.get("app").map(String::as_str) != Some(app_label.as_str())
            || app_label.is_empty()
        {
            return Err(Error::Binding {
                workload: workload.key(),
                reason: format!(
                    "service selector {selector:?} does not match app label {app_label:?}"
                ),
            });
        }

        let target_port = match service_target_port(&service) {
            Some(port) => port,
            None => object::first_container_port(&workload_obj).ok_or_else(|| Error::Binding {
                workload: workload.key(),
                reason: "no usable target port on service or pod template".to_string(),
            })?,
        };

        Ok(ServiceBinding {
            namespace: workload.namespace.clone(),
            name: workload.name.clone(),
            selector,
            target_port,
        })
    }
}

fn service_selector(service: &kube::core::DynamicObject) -> BTreeMap<String, String> {
    let mut selector = BTreeMap::new();
    if let Some(map) = service
        .data
        .pointer("/spec/selector")
        .and_then(Value::as_object)
    {
        for (key, value) in map {
            if let Some(value) = value.as_str() {
                selector.insert(key.clone(), value.to_string());
            }
        }
    }
    selector
}

/// Numeric `targetPort` of the first service port, falling back to `port`.
fn service_target_port(service: &kube::core::DynamicObject) -> Option<u16> {
    let port = service
        .data
        .pointer("/spec/ports")?
        .as_array()?
        .first()?;
    let numeric = match port.get("targetPort") {
        // A named target port cannot be resolved here; the caller infers it
        // from the pod template instead.
        Some(target) => target.as_u64(),
        None => port.get("port").and_then(Value::as_u64),
    }?;
    u16::try_from(numeric).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{deployment_object, service_object, fast_retry, InMemoryCluster};
    use serde_json::json;

    fn discovery(cluster: Arc<InMemoryCluster>) -> ResourceDiscovery {
        let client = Arc::new(ClusterClient::new(cluster).with_retry(fast_retry()));
        ResourceDiscovery::new(client, &Settings::default())
    }

    #[tokio::test]
    async fn lists_annotated_single_replica_workloads() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.insert(deployment_object("dev", "api", 1, Some(("devexy/local-port", "8080"))));
        cluster.insert(deployment_object("dev", "helper", 1, None));

        let discovered = discovery(cluster).list_eligible("dev").await.unwrap();
        assert_eq!(discovered.eligible.len(), 1);
        assert_eq!(discovered.eligible[0].key(), "dev/deployment/api");
        assert!(discovered.violations.is_empty());
    }

    #[tokio::test]
    async fn replica_violation_excludes_workload_but_not_siblings() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.insert(deployment_object("dev", "api", 1, Some(("devexy/local-port", "8080"))));
        cluster.insert(deployment_object("dev", "worker", 2, Some(("devexy/local-port", "9090"))));

        let discovered = discovery(cluster).list_eligible("dev").await.unwrap();
        assert_eq!(discovered.eligible.len(), 1);
        assert_eq!(discovered.eligible[0].name, "api");
        assert_eq!(discovered.violations.len(), 1);
        assert!(matches!(
            discovered.violations[0],
            Error::ReplicaCountViolation { replicas: 2, .. }
        ));
    }

    #[tokio::test]
    async fn discovery_spans_all_namespaces() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.insert(deployment_object("dev", "api", 1, Some(("devexy/local-port", "8080"))));
        cluster.insert(deployment_object("qa", "api", 1, Some(("devexy/local-port", "8081"))));

        let discovered = discovery(cluster).list_all().await.unwrap();
        assert_eq!(discovered.eligible.len(), 2);
    }

    #[tokio::test]
    async fn binding_resolves_matching_service() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.insert(deployment_object("dev", "api", 1, Some(("devexy/local-port", "8080"))));
        cluster.insert(service_object("dev", "api", "api", json!(8000)));

        let discovery = discovery(cluster);
        let discovered = discovery.list_eligible("dev").await.unwrap();
        let binding = discovery
            .resolve_service_binding(&discovered.eligible[0])
            .await
            .unwrap();
        assert_eq!(binding.target_port, 8000);
        assert_eq!(binding.selector.get("app").map(String::as_str), Some("api"));
    }

    #[tokio::test]
    async fn named_target_port_falls_back_to_container_port() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.insert(deployment_object("dev", "api", 1, Some(("devexy/local-port", "8080"))));
        cluster.insert(service_object("dev", "api", "api", json!("http")));

        let discovery = discovery(cluster);
        let discovered = discovery.list_eligible("dev").await.unwrap();
        let binding = discovery
            .resolve_service_binding(&discovered.eligible[0])
            .await
            .unwrap();
        // From the pod template's first containerPort.
        assert_eq!(binding.target_port, 80);
    }

    #[tokio::test]
    async fn missing_service_is_a_binding_error() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.insert(deployment_object("dev", "api", 1, Some(("devexy/local-port", "8080"))));

        let discovery = discovery(cluster);
        let discovered = discovery.list_eligible("dev").await.unwrap();
        let err = discovery
            .resolve_service_binding(&discovered.eligible[0])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Binding { .. }));
    }

    #[tokio::test]
    async fn mismatched_selector_is_a_binding_error() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.insert(deployment_object("dev", "api", 1, Some(("devexy/local-port", "8080"))));
        cluster.insert(service_object("dev", "api", "something-else", json!(8000)));

        let discovery = discovery(cluster);
        let discovered = discovery.list_eligible("dev").await.unwrap();
        assert!(matches!(
            discovery
                .resolve_service_binding(&discovered.eligible[0])
                .await,
            Err(Error::Binding { .. })
        ));
    }
}
