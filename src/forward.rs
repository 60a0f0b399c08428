//! Supervised port-forward sessions.
//!
//! Each session runs one `kubectl port-forward` child under a dedicated
//! tokio task. The supervisor restarts dropped connections with bounded
//! backoff and reports every status transition over an event channel; at
//! most one live session exists per workload at any time.

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::workload::Workload;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Starting,
    Active,
    Reconnecting,
    Stopped,
    Failed,
}

impl SessionStatus {
    /// True while the session owns its workload's forwarding slot.
    #[must_use]
    pub fn occupies_slot(self) -> bool {
        matches!(self, Self::Starting | Self::Active | Self::Reconnecting)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Starting => "starting",
            Self::Active => "active",
            Self::Reconnecting => "reconnecting",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        f.write_str(text)
    }
}

/// Status transition surfaced to the controller and the CLI.
#[derive(Debug, Clone)]
pub struct ForwardEvent {
    pub workload: String,
    pub status: SessionStatus,
}

#[derive(Debug, Clone)]
pub struct ForwardOptions {
    /// Command providing the port-forward primitive; forward arguments are
    /// appended. Replaced in tests with a stand-in process.
    pub kubectl: Vec<String>,
    /// Reconnect attempts before a session is declared failed.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// How long a child must survive before the session counts as active.
    pub startup_grace: Duration,
    /// A session active at least this long resets the reconnect counter.
    pub stable_after: Duration,
    pub stop_timeout: Duration,
}

impl Default for ForwardOptions {
    fn default() -> Self {
        Self {
            kubectl: vec!["kubectl".to_string()],
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            startup_grace: Duration::from_millis(300),
            stable_after: Duration::from_secs(30),
            stop_timeout: Duration::from_secs(5),
        }
    }
}

impl ForwardOptions {
    fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let millis = u64::try_from(self.base_delay.as_millis())
            .unwrap_or(u64::MAX)
            .saturating_mul(1_u64 << exponent);
        Duration::from_millis(millis).min(self.max_delay)
    }
}

struct Session {
    local_port: u16,
    remote_port: u16,
    status: watch::Receiver<SessionStatus>,
    cancel: CancellationToken,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

/// Snapshot of one session for reporting.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub workload: String,
    pub local_port: u16,
    pub remote_port: u16,
    pub status: SessionStatus,
}

pub struct PortForwardManager {
    options: ForwardOptions,
    sessions: DashMap<String, Arc<Session>>,
    events: mpsc::UnboundedSender<ForwardEvent>,
}

/// Arguments handed to the port-forward command.
fn forward_args(workload: &Workload, local_port: u16, remote_port: u16) -> Vec<String> {
    vec![
        "port-forward".to_string(),
        format!("{}/{}", workload.kind.kubectl_name(), workload.name),
        format!("{local_port}:{remote_port}"),
        "--namespace".to_string(),
        workload.namespace.clone(),
    ]
}

impl PortForwardManager {
    #[must_use]
    pub fn new(options: ForwardOptions) -> (Self, mpsc::UnboundedReceiver<ForwardEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        (
            Self {
                options,
                sessions: DashMap::new(),
                events,
            },
            receiver,
        )
    }

    /// Starts a supervised forward for the workload.
    ///
    /// Fails with [`Error::PortConflict`] while another session for the same
    /// workload is starting, active or reconnecting, or while any live
    /// session already holds the requested local port.
    pub fn start(&self, workload: &Workload, local_port: u16, remote_port: u16) -> Result<()> {
        let key = workload.key();

        if let Some(existing) = self.sessions.get(&key) {
            let status = *existing.status.borrow();
            if status.occupies_slot() {
                return Err(Error::PortConflict {
                    workload: key,
                    reason: format!(
                        "a session is already {status} on local port {}",
                        existing.local_port
                    ),
                });
            }
        }

        // The local port is a machine-wide resource; a session for another
        // workload holding it would leave this child unable to bind.
        if let Some(holder) = self.sessions.iter().find(|entry| {
            entry.key() != &key
                && entry.local_port == local_port
                && entry.status.borrow().occupies_slot()
        }) {
            return Err(Error::PortConflict {
                workload: key,
                reason: format!(
                    "local port {local_port} is already forwarded for {}",
                    holder.key()
                ),
            });
        }

        let (status_tx, status_rx) = watch::channel(SessionStatus::Starting);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(supervise(
            self.options.clone(),
            key.clone(),
            forward_args(workload, local_port, remote_port),
            cancel.clone(),
            status_tx,
            self.events.clone(),
        ));

        info!(workload = %key, local_port, remote_port, "starting port-forward session");
        self.sessions.insert(
            key,
            Arc::new(Session {
                local_port,
                remote_port,
                status: status_rx,
                cancel,
                task: std::sync::Mutex::new(Some(task)),
            }),
        );
        Ok(())
    }

    /// Cancels the workload's session and waits (bounded) for it to wind down.
    pub async fn stop(&self, workload_key: &str) {
        let Some((_, session)) = self.sessions.remove(workload_key) else {
            debug!(workload = workload_key, "no session to stop");
            return;
        };
        session.cancel.cancel();
        let handle = session.task.lock().map(|mut slot| slot.take()).unwrap_or(None);
        if let Some(handle) = handle {
            let abort = handle.abort_handle();
            if timeout(self.options.stop_timeout, handle).await.is_err() {
                warn!(
                    workload = workload_key,
                    "session did not stop within the timeout, aborting"
                );
                abort.abort();
            }
        }
    }

    pub async fn stop_all(&self) {
        let keys: Vec<String> = self.sessions.iter().map(|entry| entry.key().clone()).collect();
        for key in keys {
            self.stop(&key).await;
        }
    }

    #[must_use]
    pub fn status(&self, workload_key: &str) -> Option<SessionStatus> {
        self.sessions
            .get(workload_key)
            .map(|session| *session.status.borrow())
    }

    #[must_use]
    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.sessions
            .iter()
            .map(|entry| SessionInfo {
                workload: entry.key().clone(),
                local_port: entry.local_port,
                remote_port: entry.remote_port,
                status: *entry.status.borrow(),
            })
            .collect()
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|entry| entry.status.borrow().occupies_slot())
            .count()
    }
}

async fn supervise(
    options: ForwardOptions,
    workload: String,
    args: Vec<String>,
    cancel: CancellationToken,
    status_tx: watch::Sender<SessionStatus>,
    events: mpsc::UnboundedSender<ForwardEvent>,
) {
    let set = |status: SessionStatus| {
        let _ = status_tx.send(status);
        let _ = events.send(ForwardEvent {
            workload: workload.clone(),
            status,
        });
    };

    let Some((program, leading)) = options.kubectl.split_first() else {
        error!(workload = %workload, "no port-forward command configured");
        set(SessionStatus::Failed);
        return;
    };

    let mut attempt: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            set(SessionStatus::Stopped);
            return;
        }

        let spawned = Command::new(program)
            .args(leading)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn();

        match spawned {
            Ok(mut child) => match timeout(options.startup_grace, child.wait()).await {
                Ok(exit) => {
                    warn!(workload = %workload, ?exit, "port-forward exited during startup");
                }
                Err(_) => {
                    set(SessionStatus::Active);
                    debug!(workload = %workload, "port-forward active");
                    let active_since = Instant::now();
                    tokio::select! {
                        () = cancel.cancelled() => {
                            let _ = child.kill().await;
                            set(SessionStatus::Stopped);
                            return;
                        }
                        exit = child.wait() => {
                            warn!(workload = %workload, ?exit, "port-forward disconnected");
                            if active_since.elapsed() >= options.stable_after {
                                attempt = 0;
                            }
                        }
                    }
                }
            },
            Err(err) => {
                warn!(workload = %workload, error = %err, "failed to spawn port-forward");
            }
        }

        attempt += 1;
        if attempt >= options.max_attempts {
            error!(
                workload = %workload,
                attempts = attempt,
                "port-forward failed permanently, giving up"
            );
            set(SessionStatus::Failed);
            return;
        }

        set(SessionStatus::Reconnecting);
        tokio::select! {
            () = cancel.cancelled() => {
                set(SessionStatus::Stopped);
                return;
            }
            () = sleep(options.delay_for(attempt)) => {}
        }
    }
}
