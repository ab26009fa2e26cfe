// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Builders for planner test inputs

use chrono::DateTime;
use chrono::TimeZone;
use chrono::Utc;
use fleet_common::ApplicationId;
use fleet_common::Environment;
use fleet_common::Generation;
use fleet_common::NodeId;
use fleet_common::RevisionId;
use fleet_common::Version;
use fleet_common::ZoneId;
use fleet_types::application::Deployment;
use fleet_types::application::Instance;
use fleet_types::application::JobStatus;
use fleet_types::application::JobType;
use fleet_types::application::Run;
use fleet_types::application::RunKind;
use fleet_types::application::RunOutcome;
use fleet_types::change::Change;
use fleet_types::confidence::Confidence;
use fleet_types::node::Node;
use fleet_types::node::NodeState;
use fleet_types::node::NodeType;
use fleet_types::policy::UpgradePolicy;
use fleet_types::version_status::DeploymentStatistics;
use fleet_types::version_status::VersionEntry;
use fleet_types::version_status::VersionStatus;
use std::collections::BTreeMap;

/// Monday 2025-03-03, 12:00 UTC
pub fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 3, 12, 0, 0).unwrap()
}

pub fn v(minor: u32) -> Version {
    Version::new(8, minor, 0)
}

pub fn zone(region: &str) -> ZoneId {
    ZoneId::new(Environment::Prod, region)
}

/// An instance with one production deployment on `8.<minor>.0`
pub fn instance(name: &str, policy: UpgradePolicy, minor: u32) -> Instance {
    Instance {
        id: ApplicationId::new(name, "app", "default"),
        upgrade_policy: policy,
        major_version: None,
        block_changes: Vec::new(),
        change: Change::empty(),
        change_generation: Generation::new(),
        deployments: BTreeMap::from([(
            zone("us-east-1"),
            Deployment {
                platform: v(minor),
                revision: RevisionId::new(1),
                at: now() - chrono::Duration::days(7),
            },
        )]),
        jobs: Vec::new(),
    }
}

/// Records a job whose last run was a platform upgrade to `8.<minor>.0`
pub fn with_upgrade_run(
    mut instance: Instance,
    job: JobType,
    minor: u32,
    outcome: RunOutcome,
) -> Instance {
    instance.jobs.push(JobStatus {
        job,
        last_run: Some(Run {
            platform: v(minor),
            revision: RevisionId::new(1),
            kind: RunKind::Upgrade,
            outcome,
            start: now() - chrono::Duration::hours(1),
            end: None,
        }),
        first_failing: None,
    });
    instance
}

pub fn node(
    name: &str,
    zone: &ZoneId,
    node_type: NodeType,
    version: &Version,
) -> Node {
    Node {
        id: NodeId::new(name),
        zone: zone.clone(),
        node_type,
        state: NodeState::Active,
        suspended_since: None,
        excluded: false,
        current_version: version.clone(),
        wanted_version: version.clone(),
        current_os_version: Version::EMPTY,
        wanted_os_version: Version::EMPTY,
        wanted_version_changed_at: None,
        wanted_os_version_changed_at: None,
    }
}

/// A status with system version `8.<system>.0` and the given confidences,
/// without statistics
pub fn version_status(
    system: u32,
    entries: &[(u32, Confidence)],
) -> VersionStatus {
    let mut versions: Vec<_> = entries
        .iter()
        .map(|(minor, confidence)| VersionEntry {
            version: v(*minor),
            confidence: *confidence,
            computed_confidence: *confidence,
            overridden: false,
            is_system_version: *minor == system,
            statistics: DeploymentStatistics::default(),
        })
        .collect();
    versions.sort_by(|a, b| a.version.cmp(&b.version));
    VersionStatus { system_version: v(system), computed_at: now(), versions }
}
