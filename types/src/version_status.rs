// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Snapshot of the confidence in every known platform version

use crate::confidence::Confidence;
use crate::policy::UpgradePolicy;
use chrono::DateTime;
use chrono::Utc;
use fleet_common::ApplicationId;
use fleet_common::Version;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;

/// Operator-forced confidence, by version
pub type ConfidenceOverrides = BTreeMap<Version, Confidence>;

/// Instances grouped by how they relate to one version
///
/// Each map records the upgrade policy of the instance, since that is what
/// confidence is computed from.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct DeploymentStatistics {
    /// instances with a failing platform upgrade to this version
    pub failing: BTreeMap<ApplicationId, UpgradePolicy>,
    /// instances with at least one production deployment on this version
    pub production: BTreeMap<ApplicationId, UpgradePolicy>,
    /// instances whose change targets this version
    pub deploying: BTreeMap<ApplicationId, UpgradePolicy>,
}

impl DeploymentStatistics {
    pub fn failing_with(&self, policy: UpgradePolicy) -> usize {
        self.failing.values().filter(|p| **p == policy).count()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct VersionEntry {
    pub version: Version,
    /// effective confidence: the override if there is one, else computed
    pub confidence: Confidence,
    /// what the statistics alone say
    pub computed_confidence: Confidence,
    pub overridden: bool,
    pub is_system_version: bool,
    pub statistics: DeploymentStatistics,
}

/// Confidence in every known version, as of one computation
///
/// A status is never modified after it is computed.  Each cycle computes a
/// new one and replaces the stored status as a whole.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct VersionStatus {
    pub system_version: Version,
    pub computed_at: DateTime<Utc>,
    /// sorted by version, oldest first
    pub versions: Vec<VersionEntry>,
}

impl VersionStatus {
    pub fn empty(
        system_version: Version,
        computed_at: DateTime<Utc>,
    ) -> VersionStatus {
        VersionStatus { system_version, computed_at, versions: Vec::new() }
    }

    pub fn entry(&self, version: &Version) -> Option<&VersionEntry> {
        self.versions
            .binary_search_by(|entry| entry.version.cmp(version))
            .ok()
            .map(|i| &self.versions[i])
    }

    pub fn confidence(&self, version: &Version) -> Option<Confidence> {
        self.entry(version).map(|entry| entry.confidence)
    }

    /// Versions rollout may still move to, oldest first
    pub fn deployable(&self) -> impl Iterator<Item = &VersionEntry> + '_ {
        self.versions.iter().filter(|entry| entry.confidence.can_change_to())
    }

    pub fn system_version_broken(&self) -> bool {
        self.confidence(&self.system_version) == Some(Confidence::Broken)
    }
}
