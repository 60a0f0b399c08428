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

#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc, clippy::doc_markdown)]

//! Development-mode controller for Kubernetes workloads.
//!
//! Toggles annotated single-replica workloads between Remote mode (traffic
//! stays in the cluster, a port-forward exposes it locally) and Local mode
//! (the cluster workload is replaced by a reverse-proxy stub that routes
//! in-cluster traffic to a process on the developer's machine).

pub mod cluster;
pub mod controller;
pub mod error;
pub mod forward;
pub mod manifest;
pub mod settings;
pub mod ui;
pub mod workload;

#[cfg(test)]
pub(crate) mod testutil;

pub use controller::{ModeController, ModeState, ReconcileSummary};
pub use error::{Error, Result};
pub use settings::Settings;
pub use workload::{Mode, ResourceKind, Workload};
