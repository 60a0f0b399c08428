/*
 * Devexy - Kubernetes development-mode controller
 * Copyright (C) 2026 Devexy contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Devexy CLI entry point.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing_subscriber::EnvFilter;
use which::which;

use devexy::cluster::{ClusterClient, KubeClusterApi, ProxyPatcher, ResourceDiscovery};
use devexy::controller::ModeController;
use devexy::forward::{ForwardOptions, PortForwardManager, SessionStatus};
use devexy::manifest::ManifestPipeline;
use devexy::{ui, Error, Mode, Settings, Workload};

/// How long shutdown may spend restoring each local-mode workload.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(20);

/// Devexy - toggle Kubernetes workloads between remote and local mode.
#[derive(Parser)]
#[command(
    name = "devexy",
    version,
    about = "Development-mode controller for Kubernetes workloads",
    long_about = "Toggle annotated single-replica workloads between Remote mode\n\
                  (port-forward into the cluster) and Local mode (the cluster\n\
                  workload is replaced by a reverse proxy routing traffic to a\n\
                  process on this machine).\n\n\
                  All operations are idempotent - re-running the same command\n\
                  converges on the requested state."
)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconcile eligible workloads and keep forward sessions alive.
    ///
    /// Optionally applies the kustomize overlay first and performs a single
    /// mode toggle, then supervises sessions until Ctrl-C. On shutdown every
    /// local-mode workload is restored to its original spec.
    Workon {
        /// Render and apply the kustomize overlay before reconciling.
        #[arg(long)]
        apply: bool,

        /// Limit discovery to one namespace instead of the whole cluster.
        #[arg(short, long)]
        namespace: Option<String>,

        /// Workload to toggle, by name or namespace/kind/name key.
        #[arg(short, long, requires = "mode")]
        workload: Option<String>,

        /// Mode to toggle the selected workload into.
        #[arg(short, long, requires = "workload")]
        mode: Option<Mode>,
    },

    /// Print the devexy version.
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("info,devexy=debug")
    } else {
        EnvFilter::new("warn,devexy=info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Version => {
            println!("devexy {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::Workon {
            apply,
            namespace,
            workload,
            mode,
        } => workon(apply, namespace, workload, mode).await,
    }
}

async fn workon(
    apply: bool,
    namespace: Option<String>,
    workload: Option<String>,
    mode: Option<Mode>,
) -> Result<()> {
    which("kubectl").map_err(|_| Error::Tool {
        tool: "kubectl".to_string(),
        message: "not found on PATH".to_string(),
    })?;

    let settings = Settings::from_env();
    let kube = kube::Client::try_default().await?;
    let client = Arc::new(ClusterClient::new(Arc::new(KubeClusterApi::new(kube))));
    let (forwards, mut events) = PortForwardManager::new(ForwardOptions::default());
    let controller = ModeController::new(
        Arc::clone(&client),
        ResourceDiscovery::new(Arc::clone(&client), &settings),
        ProxyPatcher::new(Arc::clone(&client)),
        Arc::new(forwards),
    );

    let mut failed = false;

    if apply {
        ui::print_step("Applying kustomize overlay");
        ui::print_kv("overlay", &settings.overlay_dir().display().to_string());
        let summary = ManifestPipeline::new(Arc::clone(&client), &settings)
            .apply()
            .await?;
        ui::print_apply_summary(&summary);
        failed |= !summary.is_clean();
    }

    ui::print_step("Reconciling workloads");
    let summary = controller.reconcile(namespace.as_deref()).await?;
    ui::print_reconcile_summary(&summary);
    failed |= !summary.is_clean();

    if let (Some(selector), Some(mode)) = (workload, mode) {
        let discovery = ResourceDiscovery::new(Arc::clone(&client), &settings);
        let discovered = match namespace.as_deref() {
            Some(namespace) => discovery.list_eligible(namespace).await?,
            None => discovery.list_all().await?,
        };
        let target = select_workload(&discovered.eligible, &selector)?;

        ui::print_step(&format!("Toggling {target} to {mode}"));
        let toggled = match mode {
            Mode::Local => controller.toggle_local(&target).await,
            Mode::Remote => controller.toggle_remote(&target).await,
        };
        match toggled {
            Ok(()) => ui::print_success(&format!("{target} is now {mode}")),
            Err(err) => {
                ui::print_error(&err.to_string());
                failed = true;
            }
        }
    }

    ui::print_info("Press Ctrl-C to stop and restore");
    loop {
        tokio::select! {
            result = signal::ctrl_c() => {
                result?;
                break;
            }
            Some(event) = events.recv() => {
                // An exhausted forward parks its workload and fails the run.
                if event.status == SessionStatus::Failed {
                    controller.note_forward_failure(&event.workload).await;
                    failed = true;
                }
                ui::print_forward_event(&event);
            }
        }
    }

    ui::print_step("Shutting down");
    let restore_failures = controller.shutdown(SHUTDOWN_GRACE).await;
    for failure in &restore_failures {
        ui::print_error(&failure.to_string());
    }
    failed |= !restore_failures.is_empty();

    if failed {
        std::process::exit(1);
    }
    ui::print_success("All workloads restored");
    Ok(())
}

/// Resolves a workload selector against the discovered set: either the full
/// `namespace/kind/name` key or a bare name that must match exactly one.
fn select_workload(eligible: &[Workload], selector: &str) -> Result<Workload, Error> {
    let wanted = selector.to_ascii_lowercase();
    let matches: Vec<&Workload> = eligible
        .iter()
        .filter(|w| w.key() == wanted || w.name.to_ascii_lowercase() == wanted)
        .collect();
    match matches.as_slice() {
        [one] => Ok((*one).clone()),
        [] => Err(Error::Config(format!(
            "no eligible workload matches {selector:?}"
        ))),
        many => Err(Error::Config(format!(
            "{selector:?} is ambiguous, matches {} workloads; use namespace/kind/name",
            many.len()
        ))),
    }
}
