// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! # Fleet upgrade control loops
//!
//! The orchestrator runs as a handful of background tasks, each activated
//! periodically (or on demand) by the [`driver::Driver`]:
//!
//! - `version_status_updater` recomputes confidence in every known version;
//! - `tenant_upgrader` moves tenant application instances to new platform
//!   versions, cancelling changes to broken or aborted ones;
//! - `system_upgrader` rolls system applications to the target system
//!   version, or back from it once it has been aborted;
//! - `os_upgrade_scheduler` picks OS version targets from the release
//!   catalog;
//! - `os_upgrader` rolls hosts to their cloud's OS version target;
//! - `metrics_reporter` publishes convergence metrics.
//!
//! Each task reads a snapshot of the state it needs through the traits in
//! [`interfaces`], hands it to a planner from `fleet-upgrade-planning`, and
//! writes out the resulting plan.  Tasks never fail: errors are logged and
//! recorded in the task's status, and the next activation tries again.
//!
//! Every activation first takes a lease on the task's lock in the
//! coordination store, so only one controller in a cluster runs each task at
//! a time.

mod common;
pub mod config;
pub mod driver;
#[cfg(any(test, feature = "testing"))]
pub mod fakes;
pub mod init;
pub mod interfaces;
pub mod operator;
pub mod tasks;

pub use common::Activator;
pub use common::BackgroundTask;
pub use common::TaskName;
