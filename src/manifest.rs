//! Kustomize rendering and bulk apply behind `workon --apply`.
//!
//! The overlay is rendered by the external `kustomize` binary; documents are
//! applied best-effort, one failure never aborting the rest. Scalable
//! resources keep their live replica count across a redeploy and start
//! scaled to zero on first deploy, so a fresh `workon` run never stampedes
//! a development cluster.

use std::path::PathBuf;
use std::sync::Arc;

use kube::core::DynamicObject;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info, warn};
use which::which;

use crate::cluster::client::ClusterClient;
use crate::cluster::{object, proxy};
use crate::error::{Error, Result};
use crate::settings::Settings;
use crate::workload::{ResourceKind, ResourceRef};

/// Outcome of one bulk apply. `failed` pairs each document with the reason
/// it was rejected.
#[derive(Debug, Default)]
pub struct ApplySummary {
    pub applied: Vec<String>,
    pub unchanged: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl ApplySummary {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct ManifestPipeline {
    client: Arc<ClusterClient>,
    overlay_dir: PathBuf,
}

impl ManifestPipeline {
    #[must_use]
    pub fn new(client: Arc<ClusterClient>, settings: &Settings) -> Self {
        Self {
            client,
            overlay_dir: settings.overlay_dir(),
        }
    }

    /// Renders the configured overlay to a multi-document YAML stream.
    pub async fn render(&self) -> Result<String> {
        if !self.overlay_dir.is_dir() {
            return Err(Error::Config(format!(
                "kustomize overlay directory not found: {}",
                self.overlay_dir.display()
            )));
        }
        which("kustomize").map_err(|_| Error::Tool {
            tool: "kustomize".to_string(),
            message: "not found on PATH".to_string(),
        })?;

        debug!(overlay = %self.overlay_dir.display(), "rendering kustomize overlay");
        let output = Command::new("kustomize")
            .arg("build")
            .arg(&self.overlay_dir)
            .output()
            .await?;
        if !output.status.success() {
            return Err(Error::Tool {
                tool: "kustomize".to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Renders the overlay and applies every document in it.
    pub async fn apply(&self) -> Result<ApplySummary> {
        let rendered = self.render().await?;
        self.apply_documents(parse_documents(&rendered)?).await
    }

    /// Applies parsed documents in order, namespaces first.
    pub async fn apply_documents(&self, documents: Vec<DynamicObject>) -> Result<ApplySummary> {
        let mut summary = ApplySummary::default();

        let mut namespaces: Vec<String> = documents
            .iter()
            .filter_map(|doc| doc.metadata.namespace.clone())
            .collect();
        namespaces.sort();
        namespaces.dedup();
        for namespace in namespaces {
            if let Err(err) = self.client.ensure_namespace(&namespace).await {
                summary
                    .failed
                    .push((format!("namespace/{namespace}"), err.to_string()));
            }
        }

        for mut doc in documents {
            let name = document_name(&doc);

            if let Some(live) = self.initial_replicas(&mut doc).await {
                if same_as_live(&doc, &live) {
                    debug!(resource = %name, "document matches the live object, skipping");
                    summary.unchanged.push(name);
                    continue;
                }
            }

            match self.client.apply(&doc).await {
                Ok(_) => {
                    info!(resource = %name, "applied");
                    summary.applied.push(name);
                }
                Err(err) => {
                    warn!(resource = %name, error = %err, "apply failed");
                    summary.failed.push((name, err.to_string()));
                }
            }
        }
        Ok(summary)
    }

    /// Pins a scalable document's replica count: the live value on redeploy,
    /// zero on first deploy. Returns the live object when one exists.
    async fn initial_replicas(&self, doc: &mut DynamicObject) -> Option<DynamicObject> {
        let kind: ResourceKind = doc.types.as_ref()?.kind.parse().ok()?;
        if !kind.is_scalable() {
            return None;
        }
        let rref = ResourceRef::new(
            kind,
            doc.metadata.namespace.as_deref().unwrap_or("default"),
            doc.metadata.name.as_deref().unwrap_or_default(),
        );
        match self.client.get(&rref).await {
            Ok(live) => {
                object::set_replicas(doc, object::replicas(&live).unwrap_or(0));
                Some(live)
            }
            Err(_) => {
                object::set_replicas(doc, 0);
                None
            }
        }
    }
}

/// Parses a multi-document YAML stream, skipping non-mapping documents.
pub fn parse_documents(rendered: &str) -> Result<Vec<DynamicObject>> {
    let mut documents = Vec::new();
    for deserializer in serde_yaml::Deserializer::from_str(rendered) {
        let value = serde_yaml::Value::deserialize(deserializer)?;
        if !value.is_mapping() {
            if !value.is_null() {
                warn!("skipping non-mapping document in rendered manifests");
            }
            continue;
        }
        documents.push(serde_yaml::from_value(value)?);
    }
    Ok(documents)
}

fn document_name(doc: &DynamicObject) -> String {
    let kind = doc
        .types
        .as_ref()
        .map_or_else(String::new, |t| t.kind.to_ascii_lowercase());
    let name = doc.metadata.name.as_deref().unwrap_or_default();
    match doc.metadata.namespace.as_deref() {
        Some(namespace) => format!("{namespace}/{kind}/{name}"),
        None => format!("{kind}/{name}"),
    }
}

fn same_as_live(doc: &DynamicObject, live: &DynamicObject) -> bool {
    let live = proxy::clean_snapshot(live);
    doc.data == live.data
        && doc.metadata.labels == live.metadata.labels
        && doc.metadata.annotations == live.metadata.annotations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{api_error, deployment_object, fast_retry, InMemoryCluster};

    fn pipeline(cluster: Arc<InMemoryCluster>) -> ManifestPipeline {
        let client =
            Arc::new(ClusterClient::new(cluster as _).with_retry(fast_retry()));
        ManifestPipeline::new(client, &Settings::default())
    }

    fn rendered_deployment(name: &str, replicas: i64) -> DynamicObject {
        deployment_object("dev", name, replicas, Some(("devexy/local-port", "8080")))
    }

    #[test]
    fn parse_skips_non_mapping_documents() {
        let rendered = concat!(
            "apiVersion: v1\n",
            "kind: Service\n",
            "metadata:\n",
            "  name: api\n",
            "---\n",
            "# a comment-only document\n",
            "---\n",
            "apiVersion: apps/v1\n",
            "kind: Deployment\n",
            "metadata:\n",
            "  name: api\n",
            "  namespace: dev\n",
        );
        let documents = parse_documents(rendered).unwrap();
        assert_eq!(documents.len(), 2);
        assert_eq!(documents[1].metadata.namespace.as_deref(), Some("dev"));
    }

    #[tokio::test]
    async fn first_deploy_starts_scaled_to_zero() {
        let cluster = Arc::new(InMemoryCluster::new());
        let summary = pipeline(Arc::clone(&cluster))
            .apply_documents(vec![rendered_deployment("api", 3)])
            .await
            .unwrap();

        assert_eq!(summary.applied, vec!["dev/deployment/api"]);
        let stored = cluster.stored("dev/deployment/api").unwrap();
        assert_eq!(object::replicas(&stored), Some(0));
    }

    #[tokio::test]
    async fn redeploy_keeps_the_live_replica_count() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.insert(deployment_object("dev", "api", 1, Some(("devexy/local-port", "8080"))));

        let mut doc = rendered_deployment("api", 3);
        // A changed image makes this a real redeploy, not a no-op.
        doc.data["spec"]["template"]["spec"]["containers"][0]["image"] =
            serde_json::json!("registry.example.com/api:next");
        let summary = pipeline(Arc::clone(&cluster))
            .apply_documents(vec![doc])
            .await
            .unwrap();

        assert_eq!(summary.applied.len(), 1);
        let stored = cluster.stored("dev/deployment/api").unwrap();
        assert_eq!(object::replicas(&stored), Some(1));
    }

    #[tokio::test]
    async fn unchanged_documents_are_not_reapplied() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.insert(deployment_object("dev", "api", 1, Some(("devexy/local-port", "8080"))));

        let summary = pipeline(Arc::clone(&cluster))
            .apply_documents(vec![rendered_deployment("api", 1)])
            .await
            .unwrap();

        assert_eq!(summary.unchanged, vec!["dev/deployment/api"]);
        assert!(summary.applied.is_empty());
        assert_eq!(cluster.apply_calls(), 0);
    }

    #[tokio::test]
    async fn one_rejected_document_does_not_abort_the_rest() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.fail_next_apply(api_error(422));

        let summary = pipeline(Arc::clone(&cluster))
            .apply_documents(vec![
                rendered_deployment("api", 1),
                rendered_deployment("worker", 1),
            ])
            .await
            .unwrap();

        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].0, "dev/deployment/api");
        assert_eq!(summary.applied, vec!["dev/deployment/worker"]);
    }

    #[tokio::test]
    async fn missing_overlay_directory_is_a_config_error() {
        let root = tempfile::tempdir().unwrap();
        let settings = Settings {
            kustomize_root: root.path().join("k8s"),
            ..Settings::default()
        };
        let cluster = Arc::new(InMemoryCluster::new());
        let client = Arc::new(ClusterClient::new(cluster as _).with_retry(fast_retry()));
        let err = ManifestPipeline::new(client, &settings)
            .render()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
