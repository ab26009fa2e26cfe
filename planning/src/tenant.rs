// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Chooses platform upgrade targets for tenant application instances
//!
//! Each cycle, in order:
//!
//! 1. Revision changes that have been failing for too long are set aside
//!    (cancelled), so they cannot hold up platform upgrades forever.
//! 2. Platform changes to versions that are aborted (or broken, except for
//!    canaries) are cancelled.
//! 3. Every instance is offered the newest version its upgrade policy
//!    allows, if that is newer than what it runs and is moving to.
//! 4. Instances inside a declared block window are left alone, unless their
//!    current upgrade has already reached production.
//! 5. New upgrades are rate limited by the [`crate::throttle`]; canaries are
//!    served first, and within a policy the order is a shuffle seeded by the
//!    current minute.
//!
//! Pinned changes are never replaced or cancelled.  Every cancelled change is
//! paired with an abort request for jobs already running it.

use crate::throttle;
use crate::throttle::ThrottleState;
use chrono::DateTime;
use chrono::Utc;
use fleet_common::ApplicationId;
use fleet_common::Generation;
use fleet_common::Version;
use fleet_types::application::Instance;
use fleet_types::change::CancelScope;
use fleet_types::change::Change;
use fleet_types::change::Pin;
use fleet_types::confidence::Confidence;
use fleet_types::policy::UpgradePolicy;
use fleet_types::version_status::VersionStatus;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Deserialize;
use serde::Serialize;
use serde_with::serde_as;
use serde_with::DurationSeconds;
use slog::debug;
use slog::info;
use slog::Logger;
use std::collections::BTreeMap;
use std::time::Duration;

#[serde_as]
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TenantUpgraderConfig {
    /// long-run rate at which instances start new platform upgrades
    pub upgrades_per_minute: f64,
    /// longest stretch of time the throttle accumulates budget over
    #[serde_as(as = "DurationSeconds<u64>")]
    pub max_throttle_window_secs: Duration,
    /// how long a revision change may fail before it is set aside
    #[serde_as(as = "DurationSeconds<u64>")]
    pub revision_set_aside_after_secs: Duration,
    /// highest platform major instances are upgraded to, unless they declare
    /// their own
    pub target_major_version: Option<u32>,
}

impl Default for TenantUpgraderConfig {
    fn default() -> Self {
        TenantUpgraderConfig {
            upgrades_per_minute: 0.5,
            max_throttle_window_secs: Duration::from_secs(3600),
            revision_set_aside_after_secs: Duration::from_secs(4 * 3600),
            target_major_version: None,
        }
    }
}

pub struct TenantUpgradeInput<'a> {
    pub instances: &'a [Instance],
    pub status: &'a VersionStatus,
    pub throttle: &'a ThrottleState,
    pub now: DateTime<Utc>,
}

/// Why a planned change differs from the instance's current one
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum ChangeReason {
    /// the revision change was failing for too long
    SetAside,
    /// the platform target may no longer be rolled out
    Cancelled { version: Version, confidence: Confidence },
    /// a newer platform version is allowed
    Upgrade { version: Version },
}

/// A conditional write of one instance's change
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PlannedChange {
    pub instance: ApplicationId,
    pub change: Change,
    /// generation the write is conditional on
    pub expected: Generation,
    pub reasons: Vec<ChangeReason>,
}

/// A request to abort whatever jobs are running an instance's cancelled
/// change
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AbortRequest {
    pub instance: ApplicationId,
    pub reason: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TenantUpgradeReport {
    pub set_aside: Vec<ApplicationId>,
    pub cancelled: Vec<ApplicationId>,
    pub upgrades: BTreeMap<ApplicationId, Version>,
    pub blocked: Vec<ApplicationId>,
    pub throttle_cap: usize,
    pub throttled: Vec<ApplicationId>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TenantUpgradePlan {
    pub changes: Vec<PlannedChange>,
    pub aborts: Vec<AbortRequest>,
    /// throttle state to persist once the changes are written
    pub throttle: ThrottleState,
    pub report: TenantUpgradeReport,
}

/// An instance and the change we have planned for it so far
struct Working<'a> {
    instance: &'a Instance,
    change: Change,
    reasons: Vec<ChangeReason>,
}

impl Working<'_> {
    fn id(&self) -> &ApplicationId {
        &self.instance.id
    }

    fn policy(&self) -> UpgradePolicy {
        self.instance.upgrade_policy
    }
}

pub struct TenantUpgradePlanner<'a> {
    log: Logger,
    input: &'a TenantUpgradeInput<'a>,
    config: &'a TenantUpgraderConfig,
}

impl<'a> TenantUpgradePlanner<'a> {
    pub fn new(
        log: &Logger,
        input: &'a TenantUpgradeInput<'a>,
        config: &'a TenantUpgraderConfig,
    ) -> TenantUpgradePlanner<'a> {
        TenantUpgradePlanner {
            log: log.new(slog::o!("planner" => "tenant_upgrade")),
            input,
            config,
        }
    }

    pub fn plan(self) -> TenantUpgradePlan {
        // Canaries first; within a policy, a stable order for the shuffle.
        let mut working: Vec<_> = self
            .input
            .instances
            .iter()
            .map(|instance| Working {
                instance,
                change: instance.change.clone(),
                reasons: Vec::new(),
            })
            .collect();
        working.sort_by(|a, b| {
            (a.policy(), a.id()).cmp(&(b.policy(), b.id()))
        });

        let mut report = TenantUpgradeReport::default();
        let mut aborts = Vec::new();

        self.do_plan_set_aside(&mut working, &mut aborts, &mut report);
        self.do_plan_cancel(&mut working, &mut aborts, &mut report);
        let candidates = self.do_plan_targets(&working, &mut report);
        let throttle =
            self.do_plan_throttle(&mut working, candidates, &mut report);

        let changes = working
            .into_iter()
            .filter(|w| w.change != w.instance.change)
            .map(|w| PlannedChange {
                instance: w.instance.id.clone(),
                change: w.change,
                expected: w.instance.change_generation,
                reasons: w.reasons,
            })
            .collect();

        TenantUpgradePlan { changes, aborts, throttle, report }
    }

    fn do_plan_set_aside(
        &self,
        working: &mut [Working<'_>],
        aborts: &mut Vec<AbortRequest>,
        report: &mut TenantUpgradeReport,
    ) {
        let Ok(after) = chrono::Duration::from_std(
            self.config.revision_set_aside_after_secs,
        ) else {
            return;
        };
        let deadline = self.input.now - after;
        for w in working.iter_mut() {
            if w.change.revision.is_none()
                || w.change.is_protected_from_cancellation()
            {
                continue;
            }
            let Some(since) = w.instance.revision_failing_since() else {
                continue;
            };
            if since > deadline {
                continue;
            }

            info!(
                self.log,
                "setting aside failing revision";
                "instance" => %w.id(),
                "change" => %w.change,
                "failing_since" => %since,
            );
            w.change = w.change.cancel(CancelScope::Revision);
            w.reasons.push(ChangeReason::SetAside);
            aborts.push(AbortRequest {
                instance: w.id().clone(),
                reason: format!("revision failing since {since}"),
            });
            report.set_aside.push(w.id().clone());
        }
    }

    fn do_plan_cancel(
        &self,
        working: &mut [Working<'_>],
        aborts: &mut Vec<AbortRequest>,
        report: &mut TenantUpgradeReport,
    ) {
        for w in working.iter_mut() {
            let Some(version) = w.change.platform.clone() else {
                continue;
            };
            let Some(confidence) = self.input.status.confidence(&version)
            else {
                continue;
            };
            let cancel = match confidence {
                Confidence::Aborted => true,
                Confidence::Broken => w.policy() != UpgradePolicy::Canary,
                _ => false,
            };
            if !cancel {
                continue;
            }
            if w.change.is_protected_from_cancellation() {
                debug!(
                    self.log,
                    "not cancelling pinned change";
                    "instance" => %w.id(),
                    "version" => %version,
                    "confidence" => %confidence,
                );
                continue;
            }

            info!(
                self.log,
                "cancelling upgrade";
                "instance" => %w.id(),
                "version" => %version,
                "confidence" => %confidence,
            );
            w.change = w.change.cancel(CancelScope::Platform);
            w.reasons.push(ChangeReason::Cancelled {
                version: version.clone(),
                confidence,
            });
            aborts.push(AbortRequest {
                instance: w.id().clone(),
                reason: format!("platform {version} is {confidence}"),
            });
            report.cancelled.push(w.id().clone());
        }
    }

    /// Returns the instances (by index into `working`) that should move to a
    /// new platform, with the version to move to
    fn do_plan_targets(
        &self,
        working: &[Working<'_>],
        report: &mut TenantUpgradeReport,
    ) -> Vec<(usize, Version)> {
        let mut candidates = Vec::new();
        for (i, w) in working.iter().enumerate() {
            let Some(target) = self.target_for(w) else {
                continue;
            };
            if w.instance.blocks_version_change_at(self.input.now)
                && !w.instance.is_rolling_out_platform_in_production()
            {
                debug!(
                    self.log,
                    "instance is in a block window";
                    "instance" => %w.id(),
                    "version" => %target,
                );
                report.blocked.push(w.id().clone());
                continue;
            }
            candidates.push((i, target));
        }
        candidates
    }

    /// Picks the newest version `w` may move to, if it is newer than both
    /// what the instance runs and what it is already moving to
    fn target_for(&self, w: &Working<'_>) -> Option<Version> {
        let instance = w.instance;
        if w.change.is_pinned() {
            return None;
        }
        let oldest = instance.oldest_production_platform()?;
        let status = self.input.status;
        let major_limit =
            instance.major_version.or(self.config.target_major_version);
        let pinned_major = match w.change.pin {
            Pin::PinnedToMajor(major) => Some(major),
            Pin::Unpinned | Pin::Pinned => None,
        };

        status
            .versions
            .iter()
            .rev()
            .filter(|entry| entry.confidence.allows_upgrade_for(w.policy()))
            .map(|entry| &entry.version)
            .filter(|v| **v <= status.system_version)
            .filter(|v| major_limit.map_or(true, |m| v.major() <= m))
            .filter(|v| pinned_major.map_or(true, |m| v.major() == m))
            .filter(|v| *v > oldest)
            .find(|v| w.change.platform.as_ref().map_or(true, |t| *v > t))
            .cloned()
    }

    fn do_plan_throttle(
        &self,
        working: &mut [Working<'_>],
        candidates: Vec<(usize, Version)>,
        report: &mut TenantUpgradeReport,
    ) -> ThrottleState {
        let allowance = throttle::allowance(
            self.input.throttle,
            self.input.now,
            self.config.upgrades_per_minute,
            self.config.max_throttle_window_secs,
        );
        report.throttle_cap = allowance.cap;

        // The same minute always gives the same order.
        let seed = self.input.now.timestamp().div_euclid(60) as u64;
        let mut rng = StdRng::seed_from_u64(seed);
        let mut ordered = Vec::with_capacity(candidates.len());
        for policy in [
            UpgradePolicy::Canary,
            UpgradePolicy::Default,
            UpgradePolicy::Conservative,
        ] {
            let mut group: Vec<_> = candidates
                .iter()
                .filter(|(i, _)| working[*i].policy() == policy)
                .cloned()
                .collect();
            group.shuffle(&mut rng);
            ordered.extend(group);
        }

        let mut started = 0;
        for (i, version) in ordered {
            let w = &mut working[i];
            // Replacing the target of an upgrade already under way does
            // not start anything new.
            let is_new = w.change.platform.is_none();
            if is_new {
                if started >= allowance.cap {
                    report.throttled.push(w.id().clone());
                    continue;
                }
                started += 1;
            }

            info!(
                self.log,
                "upgrading instance";
                "instance" => %w.id(),
                "policy" => %w.policy(),
                "version" => %version,
                "replacing" => ?w.change.platform,
            );
            w.change = w.change.with_platform(version.clone());
            w.reasons.push(ChangeReason::Upgrade { version: version.clone() });
            report.upgrades.insert(w.id().clone(), version);
        }

        if !report.throttled.is_empty() {
            info!(
                self.log,
                "throttled upgrades";
                "cap" => allowance.cap,
                "throttled" => report.throttled.len(),
            );
        }
        allowance.next
    }
}
