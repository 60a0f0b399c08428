//! Shared test fixtures: canned objects and an in-memory cluster.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use kube::core::{DynamicObject, ErrorResponse, TypeMeta};
use serde_json::json;

use crate::cluster::api::ClusterApi;
use crate::cluster::client::RetryPolicy;
use crate::workload::{ResourceKind, ResourceRef};

pub(crate) fn api_error(code: u16) -> kube::Error {
    let reason = match code {
        404 => "NotFound",
        409 => "Conflict",
        403 => "Forbidden",
        _ => "InternalError",
    };
    kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{reason} ({code})"),
        reason: reason.to_string(),
        code,
    })
}

/// Retry policy with negligible delays so tests stay fast.
pub(crate) fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        call_timeout: Duration::from_secs(2),
    }
}

pub(crate) fn deployment_object(
    namespace: &str,
    name: &str,
    replicas: i64,
    annotation: Option<(&str, &str)>,
) -> DynamicObject {
    let mut obj = DynamicObject::new(name, &ResourceKind::Deployment.api_resource())
        .within(namespace);
    obj.metadata.labels = Some(BTreeMap::from([("app".to_string(), name.to_string())]));
    if let Some((key, value)) = annotation {
        obj.metadata.annotations = Some(BTreeMap::from([(
            key.to_string(),
            value.to_string(),
        )]));
    }
    obj.data = json!({
        "spec": {
            "replicas": replicas,
            "selector": {"matchLabels": {"app": name}},
            "template": {
                "metadata": {"labels": {"app": name}},
                "spec": {
                    "containers": [{
                        "name": name,
                        "image": format!("registry.example.com/{name}:dev"),
                        "ports": [{"containerPort": 80}],
                    }],
                },
            },
        },
    });
    obj
}

pub(crate) fn service_object(
    namespace: &str,
    name: &str,
    selector_app: &str,
    target_port: serde_json::Value,
) -> DynamicObject {
    let mut obj =
        DynamicObject::new(name, &ResourceKind::Service.api_resource()).within(namespace);
    obj.data = json!({
        "spec": {
            "selector": {"app": selector_app},
            "ports": [{"port": 80, "targetPort": target_port}],
        },
    });
    obj
}

fn object_key(obj: &DynamicObject) -> String {
    let kind = obj
        .types
        .as_ref()
        .map_or_else(String::new, |t| t.kind.clone());
    format!(
        "{}/{}/{}",
        obj.metadata.namespace.as_deref().unwrap_or("default"),
        kind,
        obj.metadata.name.as_deref().unwrap_or_default(),
    )
    .to_ascii_lowercase()
}

/// In-memory [`ClusterApi`] used where tests need real read-back semantics
/// (round-trips, idempotence) rather than scripted expectations.
#[derive(Default)]
pub(crate) struct InMemoryCluster {
    objects: Mutex<BTreeMap<String, DynamicObject>>,
    namespaces: Mutex<Vec<String>>,
    apply_calls: AtomicUsize,
    apply_failures: Mutex<VecDeque<kube::Error>>,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, obj: DynamicObject) {
        let mut objects = self.objects.lock().unwrap();
        objects.insert(object_key(&obj), obj);
    }

    pub fn stored(&self, key: &str) -> Option<DynamicObject> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    pub fn apply_calls(&self) -> usize {
        self.apply_calls.load(Ordering::SeqCst)
    }

    /// Queues an error returned by the next apply call(s), in order.
    pub fn fail_next_apply(&self, err: kube::Error) {
        self.apply_failures.lock().unwrap().push_back(err);
    }
}

#[async_trait]
impl ClusterApi for InMemoryCluster {
    async fn get(&self, resource: &ResourceRef) -> kube::Result<DynamicObject> {
        self.objects
            .lock()
            .unwrap()
            .get(&resource.key())
            .cloned()
            .ok_or_else(|| api_error(404))
    }

    async fn list(
        &self,
        kind: ResourceKind,
        namespace: &str,
    ) -> kube::Result<Vec<DynamicObject>> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .values()
            .filter(|obj| {
                obj.types.as_ref().is_some_and(|t| t.kind == kind.as_str())
                    && obj.metadata.namespace.as_deref() == Some(namespace)
            })
            .cloned()
            .collect())
    }

    async fn list_namespaces(&self) -> kube::Result<Vec<String>> {
        let mut namespaces: Vec<String> = self
            .objects
            .lock()
            .unwrap()
            .values()
            .filter_map(|obj| obj.metadata.namespace.clone())
            .collect();
        namespaces.extend(self.namespaces.lock().unwrap().iter().cloned());
        namespaces.sort();
        namespaces.dedup();
        Ok(namespaces)
    }

    async fn apply(&self, manifest: &DynamicObject) -> kube::Result<DynamicObject> {
        if let Some(err) = self.apply_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        self.apply_calls.fetch_add(1, Ordering::SeqCst);
        let mut stored = manifest.clone();
        if stored.types.is_none() {
            stored.types = Some(TypeMeta {
                api_version: "apps/v1".to_string(),
                kind: "Deployment".to_string(),
            });
        }
        self.objects
            .lock()
            .unwrap()
            .insert(object_key(&stored), stored.clone());
        Ok(stored)
    }

    async fn delete(&self, resource: &ResourceRef) -> kube::Result<()> {
        self.objects
            .lock()
            .unwrap()
            .remove(&resource.key())
            .map(|_| ())
            .ok_or_else(|| api_error(404))
    }

    async fn ensure_namespace(&self, namespace: &str) -> kube::Result<()> {
        let mut namespaces = self.namespaces.lock().unwrap();
        if !namespaces.contains(&namespace.to_string()) {
            namespaces.push(namespace.to_string());
        }
        Ok(())
    }
}
