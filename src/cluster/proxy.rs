//! Proxy stub patching: flips a workload into Local mode and back.
//!
//! Entering local mode replaces the workload's containers with an nginx
//! reverse proxy that sends cluster-internal traffic to the developer's
//! machine, while the original spec is snapshotted both in memory and in an
//! annotation on the live patched object. The annotation makes Local mode
//! recoverable from the cluster alone after a controller crash.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use kube::core::DynamicObject;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::cluster::client::ClusterClient;
use crate::cluster::object;
use crate::error::{Error, Result};
use crate::workload::{ServiceBinding, Workload};

/// Name of the injected reverse-proxy container, also the marker that a
/// workload is currently patched.
pub const PROXY_CONTAINER_NAME: &str = "devexy-reverse-proxy";
/// Annotation on the patched object holding the JSON-serialized original.
pub const ORIGINAL_SPEC_ANNOTATION: &str = "devexy/original-spec";
/// Hostname under which the proxy reaches the developer's machine from
/// inside the cluster network.
pub const PROXY_LOCAL_HOST: &str = "host.minikube.internal";

const LAST_APPLIED_ANNOTATION: &str = "kubectl.kubernetes.io/last-applied-configuration";

/// Record of an applied proxy mutation; the only mechanism that can restore
/// a workload to its pre-local-mode state.
#[derive(Debug, Clone)]
pub struct ProxyPatch {
    pub original: DynamicObject,
    pub patched: DynamicObject,
    pub applied_at: DateTime<Utc>,
}

pub struct ProxyPatcher {
    client: Arc<ClusterClient>,
}

impl ProxyPatcher {
    #[must_use]
    pub fn new(client: Arc<ClusterClient>) -> Self {
        Self { client }
    }

    /// Replaces the workload's containers with the reverse-proxy stub.
    ///
    /// Idempotent: when the live object already runs the stub (for example a
    /// previous controller instance crashed mid-session), the patch record is
    /// reconstructed from the stored annotation and no mutation is issued.
    pub async fn enter_local(
        &self,
        workload: &Workload,
        binding: &ServiceBinding,
        local_port: u16,
    ) -> Result<ProxyPatch> {
        let rref = workload.resource_ref();
        let live = self.client.get(&rref).await?;

        if object::is_proxy_installed(&live) {
            debug!(workload = %rref, "proxy already installed, recovering patch record");
            return self.recover_patch(workload, &live);
        }

        let original = clean_snapshot(&live);
        let stub = build_stub(&original, binding.target_port, local_port).map_err(|err| {
            Error::PatchApply {
                workload: rref.key(),
                reason: err.to_string(),
            }
        })?;

        let patched = match self.client.apply(&stub).await {
            Ok(applied) => applied,
            Err(err) => {
                return Err(Error::PatchApply {
                    workload: rref.key(),
                    reason: err.to_string(),
                })
            }
        };

        info!(
            workload = %rref,
            local_port,
            target_port = binding.target_port,
            "entered local mode"
        );
        Ok(ProxyPatch {
            original,
            patched,
            applied_at: Utc::now(),
        })
    }

    /// Rebuilds a patch record from the annotation on a live patched object.
    pub fn recover_patch(&self, workload: &Workload, live: &DynamicObject) -> Result<ProxyPatch> {
        let raw = object::annotation(live, ORIGINAL_SPEC_ANNOTATION).ok_or_else(|| {
            Error::PatchApply {
                workload: workload.key(),
                reason: "proxy installed but the original-spec annotation is missing".to_string(),
            }
        })?;
        let original: DynamicObject =
            serde_json::from_str(raw).map_err(|err| Error::PatchApply {
                workload: workload.key(),
                reason: format!("stored original-spec annotation is unreadable: {err}"),
            })?;
        Ok(ProxyPatch {
            original,
            patched: live.clone(),
            applied_at: Utc::now(),
        })
    }

    /// Restores the pre-local-mode spec. The single most safety-critical
    /// operation in the crate: failure leaves the cluster running the stub,
    /// so the error carries the snapshot and must be surfaced loudly, never
    /// retried into the background.
    pub async fn exit_local(
        &self,
        workload: &Workload,
        patch: &ProxyPatch,
    ) -> Result<DynamicObject> {
        let rref = workload.resource_ref();
        let mut restored = patch.original.clone();

        // Keep whatever replica count the stub is running at, so a workload
        // the user scaled down stays down.
        if let Ok(live) = self.client.get(&rref).await {
            if let Some(current) = object::replicas(&live) {
                object::set_replicas(&mut restored, current);
            }
        }

        match self.client.apply(&restored).await {
            Ok(applied) => {
                info!(workload = %rref, "restored original spec, back in remote mode");
                Ok(applied)
            }
            Err(err) => Err(Error::RestoreFailure {
                workload: rref.key(),
                reason: err.to_string(),
                snapshot: serde_json::to_string_pretty(&patch.original)
                    .unwrap_or_else(|_| "<unserializable snapshot>".to_string()),
            }),
        }
    }
}

/// Strips server-managed fields so the snapshot re-applies cleanly and
/// round-trips deep-equal.
#[must_use]
pub fn clean_snapshot(live: &DynamicObject) -> DynamicObject {
    let mut snapshot = live.clone();
    snapshot.metadata.resource_version = None;
    snapshot.metadata.uid = None;
    snapshot.metadata.generation = None;
    snapshot.metadata.creation_timestamp = None;
    snapshot.metadata.managed_fields = None;
    if let Some(annotations) = snapshot.metadata.annotations.as_mut() {
        annotations.remove(LAST_APPLIED_ANNOTATION);
        annotations.remove(ORIGINAL_SPEC_ANNOTATION);
        if annotations.is_empty() {
            snapshot.metadata.annotations = None;
        }
    }
    if let Some(data) = snapshot.data.as_object_mut() {
        data.remove("status");
    }
    snapshot
}

/// Builds the proxy stub manifest: the original object with its containers
/// replaced and the original snapshot tucked into an annotation. Labels are
/// untouched so the fronting Service keeps routing to the stub.
fn build_stub(
    original: &DynamicObject,
    target_port: u16,
    local_port: u16,
) -> Result<DynamicObject> {
    let mut stub = original.clone();

    let serialized = serde_json::to_string(original)?;
    stub.metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(ORIGINAL_SPEC_ANNOTATION.to_string(), serialized);

    let pod_spec = stub
        .data
        .pointer_mut("/spec/template/spec")
        .and_then(Value::as_object_mut)
        .ok_or_else(|| Error::Config("workload has no pod template spec".to_string()))?;
    pod_spec.insert(
        "containers".to_string(),
        json!([reverse_proxy_container(target_port, local_port)]),
    );

    object::set_replicas(&mut stub, 1);
    Ok(stub)
}

/// The nginx container that forwards all traffic on the Service target port
/// to the developer's machine over the cluster's host gateway.
#[must_use]
pub fn reverse_proxy_container(container_port: u16, local_port: u16) -> Value {
    let nginx_config = format!(
        concat!(
            "events {{}}\n",
            "http {{\n",
            "  server {{\n",
            "    listen {container_port};\n",
            "    location / {{\n",
            "      proxy_pass http://{host}:{local_port};\n",
            "      proxy_set_header Host $host;\n",
            "      proxy_set_header X-Real-IP $remote_addr;\n",
            "      proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;\n",
            "      proxy_set_header X-Forwarded-Proto $scheme;\n",
            "    }}\n",
            "  }}\n",
            "}}\n",
        ),
        container_port = container_port,
        host = PROXY_LOCAL_HOST,
        local_port = local_port,
    );

    json!({
        "name": PROXY_CONTAINER_NAME,
        "image": "nginx:latest",
        "ports": [{"containerPort": container_port}],
        "command": ["sh", "-c"],
        "args": [format!(
            "echo '{nginx_config}' > /etc/nginx/nginx.conf && nginx -g 'daemon off;'"
        )],
    })
}
