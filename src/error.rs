//! Error taxonomy for the mode controller.
//!
//! Per-workload errors never abort processing of sibling workloads; they are
//! collected into the reconciliation summary. Only [`Error::Discovery`] and
//! [`Error::RestoreFailure`] are fatal for the whole run.

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    /// The cluster could not be queried at all. Aborts the run.
    #[error("cluster discovery failed: {0}")]
    Discovery(String),

    /// A scalable resource carries the local-port annotation but runs more
    /// than one replica. The workload is excluded; discovery continues.
    #[error("workload {workload} runs {replicas} replicas; exactly 1 is required")]
    ReplicaCountViolation { workload: String, replicas: i64 },

    /// No Service shares both name and app label with the workload.
    #[error("no service binding for {workload}: {reason}")]
    Binding { workload: String, reason: String },

    /// A forwarding session already occupies this workload's slot.
    #[error("port-forward conflict for {workload}: {reason}")]
    PortConflict { workload: String, reason: String },

    /// The cluster rejected the proxy stub. The workload stays in its prior
    /// mode; the original spec was not touched.
    #[error("failed to apply proxy patch to {workload}: {reason}")]
    PatchApply { workload: String, reason: String },

    /// A port-forward process could not be sustained after exhausting
    /// reconnect attempts.
    #[error("port-forward failed for {workload}: {reason}")]
    ForwardProcess { workload: String, reason: String },

    /// The original spec could not be restored. The cluster is left running
    /// the proxy stub; the snapshot is carried here for manual recovery.
    #[error(
        "could not restore {workload}: {reason}; the cluster is still running the \
         proxy stub, apply this snapshot manually:\n{snapshot}"
    )]
    RestoreFailure {
        workload: String,
        reason: String,
        snapshot: String,
    },

    /// A toggle was requested from a state that does not allow it.
    #[error("invalid transition for {workload}: {reason}")]
    InvalidTransition { workload: String, reason: String },

    #[error("configuration error: {0}")]
    Config(String),

    /// An external tool (kustomize, kubectl) failed or is missing.
    #[error("{tool}: {message}")]
    Tool { tool: String, message: String },

    #[error("cluster call timed out: {operation}")]
    Timeout { operation: String },

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Fatal errors always propagate to the top-level caller and force a
    /// non-zero exit, regardless of how the rest of the pass went.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Discovery(_) | Error::RestoreFailure { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(Error::Discovery("unreachable".into()).is_fatal());
        assert!(Error::RestoreFailure {
            workload: "dev/deployment/api".into(),
            reason: "apply rejected".into(),
            snapshot: "{}".into(),
        }
        .is_fatal());

        assert!(!Error::ReplicaCountViolation {
            workload: "dev/deployment/api".into(),
            replicas: 2,
        }
        .is_fatal());
        assert!(!Error::PortConflict {
            workload: "dev/deployment/api".into(),
            reason: "active session".into(),
        }
        .is_fatal());
    }

    #[test]
    fn restore_failure_message_carries_snapshot() {
        let err = Error::RestoreFailure {
            workload: "dev/deployment/api".into(),
            reason: "apply rejected".into(),
            snapshot: "{\"kind\":\"Deployment\"}".into(),
        };
        let text = err.to_string();
        assert!(text.contains("dev/deployment/api"));
        assert!(text.contains("{\"kind\":\"Deployment\"}"));
    }
}
