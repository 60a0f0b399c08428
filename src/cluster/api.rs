//! Raw cluster I/O seam.
//!
//! [`ClusterApi`] is the narrow surface the rest of the crate talks to; the
//! kube-backed implementation lives here and tests substitute their own.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind, ObjectMeta, TypeMeta};
use kube::Client;

use crate::workload::{ResourceKind, ResourceRef};

/// Field manager used for server-side apply.
pub const FIELD_MANAGER: &str = "devexy";

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn get(&self, resource: &ResourceRef) -> kube::Result<DynamicObject>;

    async fn list(
        &self,
        kind: ResourceKind,
        namespace: &str,
    ) -> kube::Result<Vec<DynamicObject>>;

    async fn list_namespaces(&self) -> kube::Result<Vec<String>>;

    /// Server-side apply. The manifest carries its own type and target
    /// metadata; the whole object is applied atomically.
    async fn apply(&self, manifest: &DynamicObject) -> kube::Result<DynamicObject>;

    async fn delete(&self, resource: &ResourceRef) -> kube::Result<()>;

    async fn ensure_namespace(&self, namespace: &str) -> kube::Result<()>;
}

/// [`ClusterApi`] backed by a live kube client.
#[derive(Clone)]
pub struct KubeClusterApi {
    client: Client,
}

impl KubeClusterApi {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn namespaced(&self, kind: ResourceKind, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &kind.api_resource())
    }
}

/// Resolves the API resource for an arbitrary manifest. Known workload kinds
/// use their fixed mapping; everything else falls back to kube's
/// pluralization of the group/version/kind triple.
fn api_resource_for(types: &TypeMeta) -> ApiResource {
    if let Ok(kind) = types.kind.parse::<ResourceKind>() {
        return kind.api_resource();
    }
    let (group, version) = match types.api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", types.api_version.as_str()),
    };
    ApiResource::from_gvk(&GroupVersionKind::gvk(group, version, &types.kind))
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn get(&self, resource: &ResourceRef) -> kube::Result<DynamicObject> {
        self.namespaced(resource.kind, &resource.namespace)
            .get(&resource.name)
            .await
    }

    async fn list(
        &self,
        kind: ResourceKind,
        namespace: &str,
    ) -> kube::Result<Vec<DynamicObject>> {
        let list = self
            .namespaced(kind, namespace)
            .list(&ListParams::default())
            .await?;
        Ok(list.items)
    }

    async fn list_namespaces(&self) -> kube::Result<Vec<String>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let list = api.list(&ListParams::default()).await?;
        Ok(list
            .items
            .into_iter()
            .filter_map(|ns| ns.metadata.name)
            .collect())
    }

    async fn apply(&self, manifest: &DynamicObject) -> kube::Result<DynamicObject> {
        let types = manifest.types.clone().unwrap_or_else(|| TypeMeta {
            api_version: "apps/v1".to_string(),
            kind: "Deployment".to_string(),
        });
        let name = manifest.metadata.name.clone().unwrap_or_default();
        let namespace = manifest
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string());

        if types.kind == "Namespace" {
            self.ensure_namespace(&name).await?;
            return Ok(manifest.clone());
        }

        let api: Api<DynamicObject> = Api::namespaced_with(
            self.client.clone(),
            &namespace,
            &api_resource_for(&types),
        );
        let params = PatchParams::apply(FIELD_MANAGER).force();
        api.patch(&name, &params, &Patch::Apply(manifest)).await
    }

    async fn delete(&self, resource: &ResourceRef) -> kube::Result<()> {
        self.namespaced(resource.kind, &resource.namespace)
            .delete(&resource.name, &DeleteParams::default())
            .await
            .map(|_| ())
    }

    async fn ensure_namespace(&self, namespace: &str) -> kube::Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(namespace.to_string()),
                ..ObjectMeta::default()
            },
            ..Namespace::default()
        };
        match api.create(&PostParams::default(), &ns).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(err)) if err.code == 409 => Ok(()),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_kinds_use_the_fixed_mapping() {
        let types = TypeMeta {
            api_version: "apps/v1".to_string(),
            kind: "StatefulSet".to_string(),
        };
        let resource = api_resource_for(&types);
        assert_eq!(resource.plural, "statefulsets");
        assert_eq!(resource.group, "apps");
    }

    #[test]
    fn core_kinds_parse_without_a_group() {
        let types = TypeMeta {
            api_version: "v1".to_string(),
            kind: "ConfigMap".to_string(),
        };
        let resource = api_resource_for(&types);
        assert_eq!(resource.group, "");
        assert_eq!(resource.version, "v1");
    }
}
