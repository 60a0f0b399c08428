//! Console output helpers for the `devexy` CLI.
//!
//! Provides consistent formatting for the workon summary and status lines.

use colored::Colorize;

use crate::controller::ReconcileSummary;
use crate::forward::{ForwardEvent, SessionStatus};
use crate::manifest::ApplySummary;

/// Print a step indicator with message.
pub fn print_step(message: &str) {
    println!("{} {}", "▶".cyan(), message.bold());
}

/// Print a success message.
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message.green());
}

/// Print a warning message.
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message.yellow());
}

/// Print an error message.
pub fn print_error(message: &str) {
    println!("{} {}", "✗".red().bold(), message.red());
}

/// Print an info message.
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Print a key-value pair.
pub fn print_kv(key: &str, value: &str) {
    println!("  {} {}", format!("{key}:").bright_black(), value.green());
}

/// One line per workload: key, mode, local port, session and live status.
pub fn print_reconcile_summary(summary: &ReconcileSummary) {
    for report in &summary.reports {
        let session = report
            .session
            .map_or_else(|| "no session".to_string(), |status| status.to_string());
        println!(
            "  {} {} {} {}",
            report.workload.bold(),
            format!("[{}]", report.mode).cyan(),
            format!(":{}", report.local_port).bright_black(),
            format!("({session}, {})", report.status).bright_black(),
        );
    }
    for warning in &summary.warnings {
        print_warning(warning);
    }
    for failure in &summary.failures {
        print_error(failure);
    }
}

/// Outcome of a manifest apply pass.
pub fn print_apply_summary(summary: &ApplySummary) {
    for name in &summary.applied {
        print_success(&format!("applied {name}"));
    }
    for name in &summary.unchanged {
        println!("  {} {}", "=".bright_black(), format!("{name} unchanged").bright_black());
    }
    for (name, reason) in &summary.failed {
        print_error(&format!("{name}: {reason}"));
    }
}

/// Live session transition, colored by severity.
pub fn print_forward_event(event: &ForwardEvent) {
    match event.status {
        SessionStatus::Active => print_success(&format!("{} forwarding", event.workload)),
        SessionStatus::Reconnecting => {
            print_warning(&format!("{} reconnecting", event.workload));
        }
        SessionStatus::Failed => print_error(&format!("{} forward failed", event.workload)),
        SessionStatus::Starting | SessionStatus::Stopped => {
            print_info(&format!("{} {}", event.workload, event.status));
        }
    }
}
