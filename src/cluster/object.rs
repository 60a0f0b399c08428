//! Field accessors for dynamic cluster objects.
//!
//! The controller is kind-generic over the scalable workload kinds, so spec
//! fields are read out of the untyped object data rather than through
//! per-kind structs.

use std::collections::BTreeMap;

use kube::core::DynamicObject;
use serde_json::Value;

use crate::cluster::proxy::PROXY_CONTAINER_NAME;

/// Reads a single metadata annotation.
#[must_use]
pub fn annotation<'a>(obj: &'a DynamicObject, key: &str) -> Option<&'a str> {
    obj.metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(key))
        .map(String::as_str)
}

/// `spec.replicas`, if present.
#[must_use]
pub fn replicas(obj: &DynamicObject) -> Option<i64> {
    obj.data.get("spec")?.get("replicas")?.as_i64()
}

pub fn set_replicas(obj: &mut DynamicObject, replicas: i64) {
    if let Some(spec) = obj.data.get_mut("spec").and_then(Value::as_object_mut) {
        spec.insert("replicas".to_string(), Value::from(replicas));
    }
}

/// Labels on the pod template (`spec.template.metadata.labels`).
#[must_use]
pub fn template_labels(obj: &DynamicObject) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    if let Some(map) = obj
        .data
        .pointer("/spec/template/metadata/labels")
        .and_then(Value::as_object)
    {
        for (key, value) in map {
            if let Some(value) = value.as_str() {
                labels.insert(key.clone(), value.to_string());
            }
        }
    }
    labels
}

/// Containers of the pod template.
#[must_use]
pub fn containers(obj: &DynamicObject) -> Option<&Vec<Value>> {
    obj.data
        .pointer("/spec/template/spec/containers")
        .and_then(Value::as_array)
}

#[must_use]
pub fn first_container(obj: &DynamicObject) -> Option<&Value> {
    containers(obj).and_then(|c| c.first())
}

/// First declared `containerPort` of the first container, the original
/// fallback when a Service does not name a usable target port.
#[must_use]
pub fn first_container_port(obj: &DynamicObject) -> Option<u16> {
    first_container(obj)?
        .get("ports")?
        .as_array()?
        .first()?
        .get("containerPort")?
        .as_u64()
        .and_then(|p| u16::try_from(p).ok())
}

/// True when the live object is running the reverse-proxy stub.
#[must_use]
pub fn is_proxy_installed(obj: &DynamicObject) -> bool {
    first_container(obj)
        .and_then(|c| c.get("name"))
        .and_then(Value::as_str)
        .is_some_and(|name| name == PROXY_CONTAINER_NAME)
}

/// Human-readable status line derived from live replica counters.
#[must_use]
pub fn status_text(obj: &DynamicObject) -> &'static str {
    let field = |name: &str| -> i64 {
        obj.data
            .get("status")
            .and_then(|status| status.get(name))
            .and_then(Value::as_i64)
            .unwrap_or(0)
    };

    let ready = field("readyReplicas");
    let available = field("availableReplicas");
    let unavailable = field("unavailableReplicas");
    let current = field("replicas");

    if current > ready {
        return "starting";
    }
    if available > 0 {
        return if is_proxy_installed(obj) { "local" } else { "running" };
    }
    if unavailable > 0 {
        return "unavailable";
    }
    if current == 0 {
        return "stopped";
    }
    "unknown"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::deployment_object;
    use serde_json::json;

    #[test]
    fn reads_replicas_and_labels() {
        let obj = deployment_object("dev", "api", 1, Some(("devexy/local-port", "8080")));
        assert_eq!(replicas(&obj), Some(1));
        assert_eq!(
            template_labels(&obj).get("app").map(String::as_str),
            Some("api")
        );
        assert_eq!(first_container_port(&obj), Some(80));
    }

    #[test]
    fn set_replicas_overwrites_spec_value() {
        let mut obj = deployment_object("dev", "api", 1, None);
        set_replicas(&mut obj, 0);
        assert_eq!(replicas(&obj), Some(0));
    }

    #[test]
    fn status_text_tracks_replica_counters() {
        let mut obj = deployment_object("dev", "api", 1, None);

        obj.data["status"] = json!({"replicas": 1, "readyReplicas": 0});
        assert_eq!(status_text(&obj), "starting");

        obj.data["status"] =
            json!({"replicas": 1, "readyReplicas": 1, "availableReplicas": 1});
        assert_eq!(status_text(&obj), "running");

        obj.data["status"] = json!({"unavailableReplicas": 1});
        assert_eq!(status_text(&obj), "unavailable");

        obj.data["status"] = json!({});
        assert_eq!(status_text(&obj), "stopped");
    }
}
