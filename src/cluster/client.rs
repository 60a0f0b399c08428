//! Retrying wrapper over raw cluster I/O.
//!
//! All write paths are retried with bounded exponential backoff on transient
//! failures and serialized per resource (never globally), so concurrent
//! transitions on unrelated workloads do not contend or clobber each other.
//! A resource-version conflict re-reads the object and re-applies the
//! intended mutation rather than resubmitting stale data.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use kube::core::DynamicObject;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::cluster::api::ClusterApi;
use crate::error::{Error, Result};
use crate::workload::{ResourceKind, ResourceRef};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts per call, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound on any single cluster call.
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            call_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before the given (1-based) retry attempt, doubling up to the cap.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let millis = u64::try_from(self.base_delay.as_millis())
            .unwrap_or(u64::MAX)
            .saturating_mul(1_u64 << exponent);
        Duration::from_millis(millis).min(self.max_delay)
    }
}

/// True for failures worth retrying: conflicts, throttling, server errors
/// and transport-level trouble. Validation and permission errors are not.
fn is_transient(err: &kube::Error) -> bool {
    match err {
        kube::Error::Api(response) => {
            response.code == 409 || response.code == 429 || response.code >= 500
        }
        kube::Error::Service(_) => true,
        _ => false,
    }
}

fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 409)
}

fn manifest_key(manifest: &DynamicObject) -> String {
    let kind = manifest
        .types
        .as_ref()
        .map_or_else(String::new, |t| t.kind.clone());
    format!(
        "{}/{}/{}",
        manifest.metadata.namespace.as_deref().unwrap_or("default"),
        kind,
        manifest.metadata.name.as_deref().unwrap_or_default(),
    )
    .to_ascii_lowercase()
}

/// Thin, retrying cluster client shared by every component above it.
pub struct ClusterClient {
    api: Arc<dyn ClusterApi>,
    retry: RetryPolicy,
    write_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ClusterClient {
    #[must_use]
    pub fn new(api: Arc<dyn ClusterApi>) -> Self {
        Self {
            api,
            retry: RetryPolicy::default(),
            write_locks: DashMap::new(),
        }
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn write_lock(&self, key: &str) -> Arc<Mutex<()>> {
        self.write_locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn with_retries<T, Fut>(
        &self,
        operation: &str,
        mut call: impl FnMut() -> Fut,
    ) -> Result<T>
    where
        Fut: Future<Output = kube::Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match timeout(self.retry.call_timeout, call()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(err)) if is_transient(&err) && attempt < self.retry.max_attempts => {
                    debug!(
                        operation,
                        attempt,
                        error = %err,
                        "transient cluster error, backing off"
                    );
                }
                Ok(Err(err)) => return Err(err.into()),
                Err(_) if attempt < self.retry.max_attempts => {
                    warn!(operation, attempt, "cluster call timed out, backing off");
                }
                Err(_) => {
                    return Err(Error::Timeout {
                        operation: operation.to_string(),
                    })
                }
            }
            sleep(self.retry.delay_for(attempt)).await;
            attempt += 1;
        }
    }

    pub async fn get(&self, resource: &ResourceRef) -> Result<DynamicObject> {
        let api = Arc::clone(&self.api);
        let resource = resource.clone();
        self.with_retries("get", move || {
            let api = Arc::clone(&api);
            let resource = resource.clone();
            async move { api.get(&resource).await }
        })
        .await
    }

    pub async fn list(
        &self,
        kind: ResourceKind,
        namespace: &str,
    ) -> Result<Vec<DynamicObject>> {
        let api = Arc::clone(&self.api);
        let namespace = namespace.to_string();
        self.with_retries("list", move || {
            let api = Arc::clone(&api);
            let namespace = namespace.clone();
            async move { api.list(kind, &namespace).await }
        })
        .await
    }

    pub async fn list_namespaces(&self) -> Result<Vec<String>> {
        let api = Arc::clone(&self.api);
        self.with_retries("list_namespaces", move || {
            let api = Arc::clone(&api);
            async move { api.list_namespaces().await }
        })
        .await
    }

    /// Applies a full manifest, serialized against other writes to the same
    /// resource.
    pub async fn apply(&self, manifest: &DynamicObject) -> Result<DynamicObject> {
        let lock = self.write_lock(&manifest_key(manifest));
        let _guard = lock.lock().await;

        let api = Arc::clone(&self.api);
        let manifest = manifest.clone();
        self.with_retries("apply", move || {
            let api = Arc::clone(&api);
            let manifest = manifest.clone();
            async move { api.apply(&manifest).await }
        })
        .await
    }

    /// Reads the resource, applies `mutation` and writes the result back.
    ///
    /// A version conflict re-reads the live object and re-applies the
    /// mutation on top of it, so concurrent external changes are preserved.
    pub async fn mutate(
        &self,
        resource: &ResourceRef,
        mutation: impl Fn(&mut DynamicObject) + Send + Sync,
    ) -> Result<DynamicObject> {
        let lock = self.write_lock(&resource.key());
        let _guard = lock.lock().await;

        let mut attempt = 1;
        loop {
            let mut obj = timeout(self.retry.call_timeout, self.api.get(resource))
                .await
                .map_err(|_| Error::Timeout {
                    operation: format!("get {resource}"),
                })??;
            mutation(&mut obj);

            match timeout(self.retry.call_timeout, self.api.apply(&obj)).await {
                Ok(Ok(applied)) => return Ok(applied),
                Ok(Err(err)) if is_conflict(&err) && attempt < self.retry.max_attempts => {
                    debug!(resource = %resource, attempt, "write conflict, re-reading");
                }
                Ok(Err(err)) if is_transient(&err) && attempt < self.retry.max_attempts => {
                    debug!(
                        resource = %resource,
                        attempt,
                        error = %err,
                        "transient error while mutating, backing off"
                    );
                }
                Ok(Err(err)) => return Err(err.into()),
                Err(_) => {
                    return Err(Error::Timeout {
                        operation: format!("apply {resource}"),
                    })
                }
            }
            sleep(self.retry.delay_for(attempt)).await;
            attempt += 1;
        }
    }

    pub async fn delete(&self, resource: &ResourceRef) -> Result<()> {
        let lock = self.write_lock(&resource.key());
        let _guard = lock.lock().await;

        let api = Arc::clone(&self.api);
        let resource = resource.clone();
        self.with_retries("delete", move || {
            let api = Arc::clone(&api);
            let resource = resource.clone();
            async move { api.delete(&resource).await }
        })
        .await
    }

    pub async fn ensure_namespace(&self, namespace: &str) -> Result<()> {
        let api = Arc::clone(&self.api);
        let namespace = namespace.to_string();
        self.with_retries("ensure_namespace", move || {
            let api = Arc::clone(&api);
            let namespace = namespace.clone();
            async move { api.ensure_namespace(&namespace).await }
        })
        .await
    }
}
