// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tenant application instances, their deployments, and their jobs

use crate::change::Change;
use crate::policy::UpgradePolicy;
use crate::window::BlockChange;
use chrono::DateTime;
use chrono::Utc;
use fleet_common::ApplicationId;
use fleet_common::Generation;
use fleet_common::RevisionId;
use fleet_common::Version;
use fleet_common::ZoneId;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;

/// A job in an instance's deployment pipeline
#[derive(
    Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize,
)]
#[serde(tag = "type", content = "zone", rename_all = "snake_case")]
pub enum JobType {
    SystemTest,
    StagingTest,
    Production(ZoneId),
}

impl JobType {
    pub fn is_production(&self) -> bool {
        matches!(self, JobType::Production(_))
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobType::SystemTest => f.write_str("system-test"),
            JobType::StagingTest => f.write_str("staging-test"),
            JobType::Production(zone) => write!(f, "production-{zone}"),
        }
    }
}

/// What a run changed compared to what was deployed before it
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    /// Only the platform version changed.
    Upgrade,
    /// Only the application revision changed.
    Revision,
    /// Both changed.
    Both,
}

impl RunKind {
    /// Returns whether a failure of this run may be blamed on the platform
    pub fn changes_platform(&self) -> bool {
        matches!(self, RunKind::Upgrade | RunKind::Both)
    }

    pub fn changes_revision(&self) -> bool {
        matches!(self, RunKind::Revision | RunKind::Both)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Running,
    Success,
    Failure,
}

/// One execution of a job, as reported by the deployment pipeline
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Run {
    pub platform: Version,
    pub revision: RevisionId,
    pub kind: RunKind,
    pub outcome: RunOutcome,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
}

impl Run {
    pub fn is_failure(&self) -> bool {
        self.outcome == RunOutcome::Failure
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct JobStatus {
    pub job: JobType,
    pub last_run: Option<Run>,
    /// First run of the current streak of failures, if the job is failing
    pub first_failing: Option<Run>,
}

impl JobStatus {
    pub fn is_failing(&self) -> bool {
        self.last_run.as_ref().map_or(false, Run::is_failure)
    }
}

/// What is currently deployed in one production zone
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Deployment {
    pub platform: Version,
    pub revision: RevisionId,
    pub at: DateTime<Utc>,
}

/// A tenant application instance as seen by the tenant upgrader
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Instance {
    pub id: ApplicationId,
    pub upgrade_policy: UpgradePolicy,
    /// Highest platform major the instance has declared it can run
    pub major_version: Option<u32>,
    pub block_changes: Vec<BlockChange>,
    pub change: Change,
    /// Generation of `change` in the change store
    pub change_generation: Generation,
    pub deployments: BTreeMap<ZoneId, Deployment>,
    pub jobs: Vec<JobStatus>,
}

impl Instance {
    pub fn has_production_deployment(&self) -> bool {
        !self.deployments.is_empty()
    }

    /// Oldest platform version across this instance's production deployments
    pub fn oldest_production_platform(&self) -> Option<&Version> {
        self.deployments.values().map(|d| &d.platform).min()
    }

    pub fn production_platforms(&self) -> BTreeSet<&Version> {
        self.deployments.values().map(|d| &d.platform).collect()
    }

    /// Platform versions for which this instance currently has a failing
    /// job whose last run changed the platform
    ///
    /// Failures of runs that only changed the application revision are not
    /// included: they say nothing about the platform.
    pub fn failing_platform_upgrades(&self) -> BTreeSet<&Version> {
        self.jobs
            .iter()
            .filter_map(|job| job.last_run.as_ref())
            .filter(|run| run.is_failure() && run.kind.changes_platform())
            .map(|run| &run.platform)
            .collect()
    }

    /// Returns when this instance's revision change started failing, if some
    /// job is currently failing a run that changes the revision
    pub fn revision_failing_since(&self) -> Option<DateTime<Utc>> {
        let revision = self.change.revision?;
        self.jobs
            .iter()
            .filter(|job| job.is_failing())
            .filter_map(|job| {
                let last = job.last_run.as_ref()?;
                if last.revision != revision || !last.kind.changes_revision() {
                    return None;
                }
                Some(job.first_failing.as_ref().unwrap_or(last).start)
            })
            .min()
    }

    /// Returns whether the change's platform target has already reached a
    /// production zone (deployed there, or a production job has run on it)
    pub fn is_rolling_out_platform_in_production(&self) -> bool {
        let Some(target) = &self.change.platform else {
            return false;
        };
        self.deployments.values().any(|d| d.platform == *target)
            || self.jobs.iter().any(|job| {
                job.job.is_production()
                    && job
                        .last_run
                        .as_ref()
                        .map_or(false, |run| run.platform == *target)
            })
    }

    /// Returns whether a declared block window forbids starting a platform
    /// change at `now`
    pub fn blocks_version_change_at(&self, now: DateTime<Utc>) -> bool {
        self.block_changes
            .iter()
            .any(|block| block.version && block.window.includes(now))
    }
}
