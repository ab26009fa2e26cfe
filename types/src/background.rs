// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Status of background tasks and their activations

use crate::system::Direction;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use std::time::Instant;

/// Describes why a background task was activated
///
/// This is only used for debugging.  It is deliberately not made available
/// to the background task itself.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationReason {
    Signaled,
    Timeout,
    Dependency,
}

/// Describes the runtime status of the background task
#[derive(Clone, Debug, Serialize)]
pub struct TaskStatus {
    /// Describes the current task status
    pub current: CurrentStatus,
    /// Describes the last completed activation
    pub last: LastResult,
}

/// Describes the current status of a background task
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "snake_case", tag = "current_status", content = "details")]
pub enum CurrentStatus {
    /// The background task is not running
    Idle,
    /// The background task has been activated and has not yet finished
    Running(CurrentStatusRunning),
}

impl CurrentStatus {
    pub fn is_idle(&self) -> bool {
        matches!(self, CurrentStatus::Idle)
    }

    pub fn unwrap_running(&self) -> &CurrentStatusRunning {
        match self {
            CurrentStatus::Running(r) => r,
            CurrentStatus::Idle => {
                panic!("attempted to get running state of idle task")
            }
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct CurrentStatusRunning {
    /// wall-clock time when the current activation started
    pub start_time: DateTime<Utc>,
    /// (local) monotonic timestamp when the activation started
    #[allow(dead_code)]
    #[serde(skip)]
    pub start_instant: Instant,
    /// what kind of event triggered this activation
    pub reason: ActivationReason,
    /// which iteration this was (counter)
    pub iteration: u64,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "snake_case", tag = "last_result", content = "details")]
pub enum LastResult {
    /// The task has never completed an activation
    NeverCompleted,
    /// The task has completed at least one activation
    Completed(LastResultCompleted),
}

impl LastResult {
    pub fn has_completed(&self) -> bool {
        matches!(self, LastResult::Completed(_))
    }

    pub fn unwrap_completion(self) -> LastResultCompleted {
        match self {
            LastResult::Completed(r) => r,
            LastResult::NeverCompleted => {
                panic!(
                    "attempted to get completion state of a task that \
                    has never completed"
                );
            }
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct LastResultCompleted {
    /// which iteration this was (counter)
    pub iteration: u64,
    /// wall-clock time when the activation started
    pub start_time: DateTime<Utc>,
    /// what kind of event triggered this activation
    pub reason: ActivationReason,
    /// total time elapsed during the activation
    pub elapsed: Duration,
    /// arbitrary datum emitted by the background task
    pub details: serde_json::Value,
}

/// The status of a `version_status_updater` background task activation
#[derive(Serialize, Deserialize, Default, Debug, PartialEq, Eq)]
pub struct VersionStatusUpdaterStatus {
    pub system_version: Option<String>,
    pub versions: usize,
    pub broken: Vec<String>,
    pub overridden: Vec<String>,
    /// overrides dropped because nothing refers to their version anymore
    pub overrides_cleared: Vec<String>,
    pub errors: Vec<String>,
}

/// The status of a `tenant_upgrader` background task activation
#[derive(Serialize, Deserialize, Default, Debug, PartialEq, Eq)]
pub struct TenantUpgraderStatus {
    /// instances given a new change, as "instance: change"
    pub changes_set: Vec<String>,
    /// instances whose changes were cancelled
    pub cancelled: Vec<String>,
    /// instances whose stuck revision was set aside
    pub set_aside: Vec<String>,
    pub aborts_requested: usize,
    /// instances whose change moved on while we planned
    pub conflicts: Vec<String>,
    /// instances inside a block window
    pub blocked: Vec<String>,
    /// how many new upgrades this cycle allowed
    pub throttle_cap: usize,
    /// candidates left for a later cycle by the throttle
    pub throttled: usize,
    pub errors: Vec<String>,
}

/// The status of a `system_upgrader` background task activation
#[derive(Serialize, Deserialize, Default, Debug, PartialEq, Eq)]
pub struct SystemUpgraderStatus {
    pub target: Option<String>,
    pub direction: Option<Direction>,
    /// "application in zone" pairs whose wanted version was moved
    pub wanted_version_set: Vec<String>,
    pub redeployed: Vec<String>,
    /// first unfinished "application in zone", if rollout is not done
    pub waiting_on: Option<String>,
    pub errors: Vec<String>,
}

/// The status of an `os_upgrader` background task activation
#[derive(Serialize, Deserialize, Default, Debug, PartialEq, Eq)]
pub struct OsUpgraderStatus {
    /// OS target, by cloud
    pub targets: BTreeMap<String, String>,
    /// zones whose hosts were given a new wanted OS version
    pub wanted_os_version_set: Vec<String>,
    /// hosts suspended past their budget, as "host: overdue by Ns"
    pub budget_exceeded: Vec<String>,
    /// hosts running a newer OS than they were asked to
    pub overshoot: usize,
    pub errors: Vec<String>,
}

/// The status of an `os_upgrade_scheduler` background task activation
#[derive(Serialize, Deserialize, Default, Debug, PartialEq, Eq)]
pub struct OsUpgradeSchedulerStatus {
    /// new targets, as "cloud: version"
    pub scheduled: Vec<String>,
    pub unchanged: Vec<String>,
    pub errors: Vec<String>,
}

/// The status of a `metrics_reporter` background task activation
#[derive(Serialize, Deserialize, Default, Debug, PartialEq, Eq)]
pub struct MetricsReporterStatus {
    pub nodes: usize,
    pub broken_system_version: bool,
    pub errors: Vec<String>,
}
