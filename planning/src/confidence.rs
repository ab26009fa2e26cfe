// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Computes confidence in platform versions from deployment outcomes

use chrono::DateTime;
use chrono::Utc;
use fleet_common::ApplicationId;
use fleet_common::Version;
use fleet_types::application::Instance;
use fleet_types::confidence::Confidence;
use fleet_types::policy::UpgradePolicy;
use fleet_types::version_status::ConfidenceOverrides;
use fleet_types::version_status::DeploymentStatistics;
use fleet_types::version_status::VersionEntry;
use fleet_types::version_status::VersionStatus;
use serde::Deserialize;
use serde::Serialize;
use slog::debug;
use slog::info;
use slog::warn;
use slog::Logger;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use thiserror::Error;

/// Tuning constants for [`Confidence`] calculation
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ConfidenceThresholds {
    /// fraction of non-canary instances that attempted a version which must
    /// be failing on it for the version to be broken
    pub broken_fraction: f64,
    /// fewest failing non-canary instances that can make a version broken
    pub min_broken_applications: usize,
    /// fraction of default-policy instances in production that must run a
    /// version without failures for it to reach high confidence
    pub high_fraction: f64,
}

impl Default for ConfidenceThresholds {
    fn default() -> Self {
        ConfidenceThresholds {
            broken_fraction: 0.6,
            min_broken_applications: 6,
            high_fraction: 0.9,
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConfidenceError {
    #[error("system version {0} is marked aborted")]
    SystemVersionAborted(Version),
}

/// Everything confidence is computed from
pub struct ConfidenceInput<'a> {
    pub instances: &'a [Instance],
    pub system_version: &'a Version,
    /// version the system is moving to, which may be the system version
    pub system_target: &'a Version,
    /// last computed status, if any
    pub previous: Option<&'a VersionStatus>,
    pub overrides: &'a ConfidenceOverrides,
    pub thresholds: &'a ConfidenceThresholds,
    pub now: DateTime<Utc>,
}

/// How many instances of each policy exist at all, in production
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Population {
    canaries: usize,
    defaults: usize,
}

impl Population {
    fn of(instances: &[Instance]) -> Population {
        let in_production = |policy| {
            instances
                .iter()
                .filter(|i| {
                    i.upgrade_policy == policy && i.has_production_deployment()
                })
                .count()
        };
        Population {
            canaries: in_production(UpgradePolicy::Canary),
            defaults: in_production(UpgradePolicy::Default),
        }
    }
}

/// Groups instances by the versions they fail on, run in production, and
/// are moving to
pub fn statistics(
    instances: &[Instance],
) -> BTreeMap<Version, DeploymentStatistics> {
    let mut by_version: BTreeMap<Version, DeploymentStatistics> =
        BTreeMap::new();
    for instance in instances {
        let id = &instance.id;
        let policy = instance.upgrade_policy;
        for version in instance.failing_platform_upgrades() {
            by_version
                .entry(version.clone())
                .or_default()
                .failing
                .insert(id.clone(), policy);
        }
        for version in instance.production_platforms() {
            by_version
                .entry(version.clone())
                .or_default()
                .production
                .insert(id.clone(), policy);
        }
        if let Some(version) = &instance.change.platform {
            by_version
                .entry(version.clone())
                .or_default()
                .deploying
                .insert(id.clone(), policy);
        }
    }
    by_version
}

/// Computes the confidence the statistics alone justify
///
/// Only failures of runs that changed the platform are counted (see
/// [`Instance::failing_platform_upgrades()`]).
pub fn calculate(
    statistics: &DeploymentStatistics,
    canaries_in_production: usize,
    defaults_in_production: usize,
    thresholds: &ConfidenceThresholds,
) -> Confidence {
    if statistics.failing_with(UpgradePolicy::Canary) > 0 {
        return Confidence::Broken;
    }

    let non_canary = |ids: &BTreeMap<ApplicationId, UpgradePolicy>| {
        ids.iter()
            .filter(|(_, p)| **p != UpgradePolicy::Canary)
            .map(|(id, _)| id.clone())
            .collect::<BTreeSet<_>>()
    };
    let failing = non_canary(&statistics.failing);
    let attempted: BTreeSet<_> =
        failing.union(&non_canary(&statistics.production)).cloned().collect();
    if failing.len() >= thresholds.min_broken_applications
        && failing.len() as f64
            >= thresholds.broken_fraction * attempted.len() as f64
    {
        return Confidence::Broken;
    }

    let succeeded_with = |policy| {
        statistics
            .production
            .iter()
            .filter(|(id, p)| {
                **p == policy && !statistics.failing.contains_key(*id)
            })
            .count()
    };

    if succeeded_with(UpgradePolicy::Canary) < canaries_in_production {
        return Confidence::Low;
    }

    let defaults_on_version = succeeded_with(UpgradePolicy::Default);
    if defaults_in_production > 0
        && defaults_on_version as f64
            >= thresholds.high_fraction * defaults_in_production as f64
    {
        return Confidence::High;
    }

    Confidence::Normal
}

/// Computes a fresh [`VersionStatus`]
///
/// The known versions are the system version, the system target, and every
/// version some instance runs in production, is moving to, or fails on.
/// Versions older than the system version keep their previously computed
/// confidence, since nothing new rolls out to them.  Overrides replace the
/// computed confidence of known versions but the computed value is still
/// recorded; overrides of any other version are ignored.
///
/// Fails if the result would mark the system version aborted.
pub fn compute_version_status(
    log: &Logger,
    input: &ConfidenceInput<'_>,
) -> Result<VersionStatus, ConfidenceError> {
    let population = Population::of(input.instances);
    let mut by_version = statistics(input.instances);
    by_version.entry(input.system_version.clone()).or_default();
    by_version.entry(input.system_target.clone()).or_default();
    by_version.retain(|version, _| !version.is_empty());

    let mut versions = Vec::with_capacity(by_version.len());
    for (version, stats) in by_version {
        let previous = input
            .previous
            .and_then(|previous| previous.entry(&version))
            .map(|entry| entry.computed_confidence);
        let computed = match previous {
            Some(previous) if version < *input.system_version => previous,
            _ => calculate(
                &stats,
                population.canaries,
                population.defaults,
                input.thresholds,
            ),
        };
        let overridden = input.overrides.get(&version).copied();
        let confidence = overridden.unwrap_or(computed);
        let is_system_version = version == *input.system_version;

        if is_system_version && confidence == Confidence::Aborted {
            warn!(
                log,
                "refusing to compute status with aborted system version";
                "version" => %version,
            );
            return Err(ConfidenceError::SystemVersionAborted(version));
        }

        if let Some(previous) = previous {
            if previous != computed {
                info!(
                    log,
                    "confidence changed";
                    "version" => %version,
                    "from" => %previous,
                    "to" => %computed,
                    "failing" => stats.failing.len(),
                    "production" => stats.production.len(),
                );
            }
        } else {
            debug!(
                log,
                "new version";
                "version" => %version,
                "confidence" => %computed,
            );
        }

        versions.push(VersionEntry {
            version,
            confidence,
            computed_confidence: computed,
            overridden: overridden.is_some(),
            is_system_version,
            statistics: stats,
        });
    }

    Ok(VersionStatus {
        system_version: input.system_version.clone(),
        computed_at: input.now,
        versions,
    })
}
