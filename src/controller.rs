//! Per-workload mode state machine.
//!
//! Transitions for a single workload are serialized behind a per-key async
//! mutex; transitions on distinct workloads proceed in parallel. `Failed` is
//! terminal for automatic transitions: only an explicit resync, which
//! re-derives the true state from the live cluster, moves a workload out of
//! it.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::cluster::{object, ClusterClient, ProxyPatch, ProxyPatcher, ResourceDiscovery};
use crate::error::{Error, Result};
use crate::forward::{PortForwardManager, SessionStatus};
use crate::workload::{Mode, Workload};

#[derive(Debug, Clone)]
pub enum ModeState {
    Remote,
    EnteringLocal,
    Local(ProxyPatch),
    ExitingLocal,
    Failed(String),
}

impl ModeState {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Remote => "remote",
            Self::EnteringLocal => "entering-local",
            Self::Local(_) => "local",
            Self::ExitingLocal => "exiting-local",
            Self::Failed(_) => "failed",
        }
    }

    #[must_use]
    pub fn mode(&self) -> Mode {
        match self {
            Self::Local(_) | Self::EnteringLocal => Mode::Local,
            _ => Mode::Remote,
        }
    }
}

struct Entry {
    workload: Workload,
    state: ModeState,
}

/// One workload's line in the reconciliation summary.
#[derive(Debug, Clone)]
pub struct WorkloadReport {
    pub workload: String,
    pub mode: Mode,
    pub local_port: u16,
    pub session: Option<SessionStatus>,
    pub status: &'static str,
}

/// Outcome of one reconciliation pass. Per-workload errors are collected
/// here instead of aborting sibling workloads.
#[derive(Debug, Default)]
pub struct ReconcileSummary {
    pub reports: Vec<WorkloadReport>,
    pub warnings: Vec<String>,
    pub failures: Vec<String>,
}

impl ReconcileSummary {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct ModeController {
    cluster: Arc<ClusterClient>,
    discovery: ResourceDiscovery,
    patcher: ProxyPatcher,
    forwards: Arc<PortForwardManager>,
    entries: DashMap<String, Arc<Mutex<Entry>>>,
}

impl ModeController {
    #[must_use]
    pub fn new(
        cluster: Arc<ClusterClient>,
        discovery: ResourceDiscovery,
        patcher: ProxyPatcher,
        forwards: Arc<PortForwardManager>,
    ) -> Self {
        Self {
            cluster,
            discovery,
            patcher,
            forwards,
            entries: DashMap::new(),
        }
    }

    fn entry(&self, workload: &Workload) -> Arc<Mutex<Entry>> {
        self.entries
            .entry(workload.key())
            .or_insert_with(|| {
                Arc::new(Mutex::new(Entry {
                    workload: workload.clone(),
                    state: ModeState::Remote,
                }))
            })
            .clone()
    }

    /// Snapshot of a workload's current state, if it is tracked.
    pub async fn state_of(&self, workload_key: &str) -> Option<ModeState> {
        let cell = self.entries.get(workload_key)?.clone();
        let entry = cell.lock().await;
        Some(entry.state.clone())
    }

    /// Moves a workload into Local mode.
    ///
    /// Idempotent when already local: no further cluster mutation, the
    /// forward session is merely (re)ensured.
    pub async fn toggle_local(&self, workload: &Workload) -> Result<()> {
        let cell = self.entry(workload);
        let mut entry = cell.lock().await;

        match &entry.state {
            ModeState::Failed(reason) => Err(Error::InvalidTransition {
                workload: workload.key(),
                reason: format!("workload is failed ({reason}); run a resync first"),
            }),
            ModeState::EnteringLocal | ModeState::ExitingLocal => {
                Err(Error::InvalidTransition {
                    workload: workload.key(),
                    reason: "a transition is already in flight".to_string(),
                })
            }
            ModeState::Local(_) => {
                debug!(workload = %workload, "already local, ensuring forward session");
                self.ensure_forward(workload).await
            }
            ModeState::Remote => {
                entry.state = ModeState::EnteringLocal;
                match self.enter_local(workload).await {
                    Ok(patch) => {
                        entry.state = ModeState::Local(patch);
                        info!(workload = %workload, "workload is now local");
                        Ok(())
                    }
                    Err(err) => {
                        entry.state = ModeState::Failed(err.to_string());
                        Err(err)
                    }
                }
            }
        }
    }

    async fn enter_local(&self, workload: &Workload) -> Result<ProxyPatch> {
        let binding = self.discovery.resolve_service_binding(workload).await?;

        // Any remote-direction session must go before the role flips.
        self.forwards.stop(&workload.key()).await;

        let patch = self
            .patcher
            .enter_local(workload, &binding, workload.local_port)
            .await?;

        // Same supervised primitive, reversed role: the tunnel now carries
        // cluster traffic out to the developer's machine.
        match self
            .forwards
            .start(workload, workload.local_port, binding.target_port)
        {
            Ok(()) => Ok(patch),
            // Only this workload's own session satisfies the conflict; a
            // clash with another workload's port means no forward exists.
            Err(Error::PortConflict { .. }) if self.owns_forward_slot(workload) => {
                debug!(workload = %workload, "existing session already satisfies the forward");
                Ok(patch)
            }
            Err(err) => {
                warn!(workload = %workload, error = %err, "rolling back proxy patch");
                self.patcher.exit_local(workload, &patch).await?;
                Err(err)
            }
        }
    }

    /// Moves a workload back to Remote mode.
    ///
    /// A restore failure is fatal: the workload is parked in `Failed`, the
    /// stub keeps running and the user is told to intervene manually.
    pub async fn toggle_remote(&self, workload: &Workload) -> Result<()> {
        let cell = self.entry(workload);
        let mut entry = cell.lock().await;

        match &entry.state {
            ModeState::Failed(reason) => Err(Error::InvalidTransition {
                workload: workload.key(),
                reason: format!("workload is failed ({reason}); run a resync first"),
            }),
            ModeState::EnteringLocal | ModeState::ExitingLocal => {
                Err(Error::InvalidTransition {
                    workload: workload.key(),
                    reason: "a transition is already in flight".to_string(),
                })
            }
            ModeState::Remote => {
                debug!(workload = %workload, "already remote, ensuring forward session");
                self.ensure_forward(workload).await
            }
            ModeState::Local(patch) => {
                let patch = patch.clone();
                entry.state = ModeState::ExitingLocal;
                self.forwards.stop(&workload.key()).await;
                match self.patcher.exit_local(workload, &patch).await {
                    Ok(_) => {
                        entry.state = ModeState::Remote;
                        info!(workload = %workload, "workload is back to remote");
                        Ok(())
                    }
                    Err(err) => {
                        error!(
                            workload = %workload,
                            error = %err,
                            "restore failed; the workload needs manual intervention"
                        );
                        entry.state = ModeState::Failed(err.to_string());
                        Err(err)
                    }
                }
            }
        }
    }

    fn owns_forward_slot(&self, workload: &Workload) -> bool {
        self.forwards
            .status(&workload.key())
            .is_some_and(SessionStatus::occupies_slot)
    }

    /// Keeps a forward session alive for the workload, starting one when the
    /// slot is free. A conflicting session for the same workload counts as
    /// already satisfied; a clash with another workload's port does not.
    pub async fn ensure_forward(&self, workload: &Workload) -> Result<()> {
        if self.owns_forward_slot(workload) {
            return Ok(());
        }
        let remote_port = self.remote_port_for(workload).await?;
        match self
            .forwards
            .start(workload, workload.local_port, remote_port)
        {
            Ok(()) => Ok(()),
            Err(Error::PortConflict { .. }) if self.owns_forward_slot(workload) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn remote_port_for(&self, workload: &Workload) -> Result<u16> {
        match self.discovery.resolve_service_binding(workload).await {
            Ok(binding) => Ok(binding.target_port),
            Err(Error::Binding { .. }) => {
                // No fronting service: forward straight at the container port.
                let live = self.cluster.get(&workload.resource_ref()).await?;
                object::first_container_port(&live).ok_or_else(|| Error::ForwardProcess {
                    workload: workload.key(),
                    reason: "no service binding and no declared container port".to_string(),
                })
            }
            Err(err) => Err(err),
        }
    }

    /// Records a forward session that exhausted its reconnect attempts.
    ///
    /// The workload is parked in `Failed` so nothing restarts the session
    /// behind the user's back and the run exits non-zero; a resync
    /// re-derives the true mode once the port trouble is dealt with.
    pub async fn note_forward_failure(&self, workload_key: &str) {
        let Some(cell) = self.entries.get(workload_key).map(|e| e.value().clone()) else {
            return;
        };
        let mut entry = cell.lock().await;
        if !matches!(entry.state, ModeState::Failed(_)) {
            warn!(workload = workload_key, "forward session failed permanently");
            entry.state =
                ModeState::Failed("port-forward failed after exhausting reconnects".to_string());
        }
    }

    /// Re-derives a workload's true state from the live cluster. The only
    /// way out of `Failed`, and explicitly user-driven.
    pub async fn resync(&self, workload: &Workload) -> Result<ModeState> {
        let cell = self.entry(workload);
        let mut entry = cell.lock().await;

        let live = match self.cluster.get(&workload.resource_ref()).await {
            Ok(live) => live,
            Err(Error::Kube(kube::Error::Api(err))) if err.code == 404 => {
                entry.state = ModeState::Remote;
                return Ok(entry.state.clone());
            }
            Err(err) => return Err(err),
        };

        entry.state = if object::is_proxy_installed(&live) {
            let patch = self.patcher.recover_patch(workload, &live)?;
            ModeState::Local(patch)
        } else {
            ModeState::Remote
        };
        info!(
            workload = %workload,
            state = entry.state.name(),
            "resynced from live cluster state"
        );
        Ok(entry.state.clone())
    }

    /// One best-effort pass over the eligible workloads: derive true modes,
    /// keep forward sessions alive and collect everything worth reporting.
    pub async fn reconcile(&self, namespace: Option<&str>) -> Result<ReconcileSummary> {
        let discovered = match namespace {
            Some(namespace) => self.discovery.list_eligible(namespace).await?,
            None => self.discovery.list_all().await?,
        };

        let mut summary = ReconcileSummary {
            warnings: discovered
                .violations
                .iter()
                .map(ToString::to_string)
                .collect(),
            ..ReconcileSummary::default()
        };

        for workload in &discovered.eligible {
            let key = workload.key();

            // A failed workload stays failed until the user resyncs it.
            if let Some(ModeState::Failed(reason)) = self.state_of(&key).await {
                summary.failures.push(format!("{key}: {reason}"));
                continue;
            }

            let state = match self.resync(workload).await {
                Ok(state) => state,
                Err(err) => {
                    summary.failures.push(format!("{key}: {err}"));
                    continue;
                }
            };

            if let Err(err) = self.ensure_forward(workload).await {
                summary.failures.push(format!("{key}: {err}"));
            }

            let status = match self.cluster.get(&workload.resource_ref()).await {
                Ok(live) => object::status_text(&live),
                Err(_) => "unknown",
            };

            summary.reports.push(WorkloadReport {
                workload: key.clone(),
                mode: state.mode(),
                local_port: workload.local_port,
                session: self.forwards.status(&key),
                status,
            });
        }
        Ok(summary)
    }

    /// Orderly shutdown: stop every session, then restore every workload
    /// still in Local mode, each within the given bound. Unrestored
    /// workloads come back as fatal errors; the caller must surface them.
    pub async fn shutdown(&self, grace: Duration) -> Vec<Error> {
        info!("shutting down: stopping sessions and restoring local workloads");
        self.forwards.stop_all().await;

        let mut failures = Vec::new();
        let cells: Vec<(String, Arc<Mutex<Entry>>)> = self
            .entries
            .iter()
            .map(|item| (item.key().clone(), item.value().clone()))
            .collect();

        for (key, cell) in cells {
            let Ok(mut entry) = timeout(grace, cell.lock()).await else {
                failures.push(Error::RestoreFailure {
                    workload: key,
                    reason: "a transition was still in flight at shutdown".to_string(),
                    snapshot: String::new(),
                });
                continue;
            };

            let patch = match &entry.state {
                ModeState::Local(patch) => Some(patch.clone()),
                // A failed workload may still be running the stub; try to
                // bring it home on the way out.
                ModeState::Failed(_) => match self.cluster.get(&entry.workload.resource_ref()).await
                {
                    Ok(live) if object::is_proxy_installed(&live) => {
                        self.patcher.recover_patch(&entry.workload, &live).ok()
                    }
                    _ => None,
                },
                _ => None,
            };

            let Some(patch) = patch else { continue };
            match timeout(grace, self.patcher.exit_local(&entry.workload, &patch)).await {
                Ok(Ok(_)) => {
                    entry.state = ModeState::Remote;
                    info!(workload = %entry.workload, "restored during shutdown");
                }
                Ok(Err(err)) => failures.push(err),
                Err(_) => failures.push(Error::RestoreFailure {
                    workload: key,
                    reason: "restore timed out during shutdown".to_string(),
                    snapshot: serde_json::to_string_pretty(&patch.original)
                        .unwrap_or_else(|_| "<unserializable snapshot>".to_string()),
                }),
            }
        }
        failures
    }
}
