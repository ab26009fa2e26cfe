// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host OS targets and published OS releases

use chrono::DateTime;
use chrono::Utc;
use fleet_common::CloudName;
use fleet_common::Version;
use serde::Deserialize;
use serde::Serialize;
use serde_with::serde_as;
use serde_with::DurationSeconds;
use std::time::Duration;

/// Who set an OS target
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Deserialize,
    Serialize,
    strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TargetSource {
    /// an operator
    Manual,
    /// the OS upgrade scheduler
    Scheduled,
}

/// The OS version hosts in one cloud are being moved to
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct OsVersionTarget {
    pub cloud: CloudName,
    pub version: Version,
    /// total time hosts may spend upgrading, shared out between the rollout
    /// steps
    #[serde_as(as = "DurationSeconds<u64>")]
    pub upgrade_budget: Duration,
    pub source: TargetSource,
    pub scheduled_at: DateTime<Utc>,
    /// when the target must be replaced (calendar releases only)
    pub expires_at: Option<DateTime<Utc>>,
}

impl OsVersionTarget {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |expires_at| expires_at <= now)
    }
}

/// Release channel of an OS image
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Deserialize,
    Serialize,
    strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ReleaseTag {
    /// dated releases that are valid for a fixed period
    Calendar,
    /// releases adopted as soon as they are published
    Stable,
    /// newest builds, for non-production systems only
    Latest,
}

/// An OS image published for some cloud
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct OsRelease {
    pub version: Version,
    pub tag: ReleaseTag,
    pub published_at: DateTime<Utc>,
}
