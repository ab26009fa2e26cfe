// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::policy::UpgradePolicy;
use serde::Deserialize;
use serde::Serialize;

/// How safe a platform version is believed to be
///
/// Variants are ordered by declaration and all comparisons go through that
/// ordering.  `Legacy` sorts last: it is not "more confident" than `High`,
/// it marks a version that an operator has declared superseded.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Deserialize,
    Serialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Confidence {
    /// Enough deployments fail on this version that rollout must stop.
    Broken,
    /// An operator stopped this version; deployments on it roll back.
    Aborted,
    /// Not all canaries have this version yet.
    Low,
    /// All canaries succeeded on this version.
    Normal,
    /// Most default-policy instances succeeded on this version.
    High,
    /// Superseded by policy; instances on it should move on.
    Legacy,
}

impl Confidence {
    /// Returns whether rollout to this version may continue at all
    pub fn can_change_to(&self) -> bool {
        !matches!(self, Confidence::Broken | Confidence::Aborted)
    }

    /// Returns whether instances with the given policy may be given this
    /// version as a new upgrade target
    pub fn allows_upgrade_for(&self, policy: UpgradePolicy) -> bool {
        if *self == Confidence::Legacy {
            return false;
        }
        *self >= Confidence::minimum_for(policy)
    }

    /// Lowest confidence at which instances with `policy` start upgrading
    pub fn minimum_for(policy: UpgradePolicy) -> Confidence {
        match policy {
            UpgradePolicy::Canary => Confidence::Low,
            UpgradePolicy::Default => Confidence::Normal,
            UpgradePolicy::Conservative => Confidence::High,
        }
    }
}
