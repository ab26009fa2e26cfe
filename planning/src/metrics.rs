// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Summarizes node state into [`FleetMetrics`]

use chrono::DateTime;
use chrono::Utc;
use fleet_types::metrics::FleetMetrics;
use fleet_types::metrics::NodeChangeMetrics;
use fleet_types::node::Node;
use fleet_types::version_status::VersionStatus;
use std::collections::BTreeMap;

pub fn compute_metrics(
    nodes: &[Node],
    status: Option<&VersionStatus>,
    now: DateTime<Utc>,
) -> FleetMetrics {
    let mut platform_versions = BTreeMap::new();
    let mut os_versions = BTreeMap::new();
    let mut node_metrics = Vec::with_capacity(nodes.len());

    for node in nodes {
        if !node.current_version.is_empty() {
            *platform_versions
                .entry(node.current_version.clone())
                .or_insert(0) += 1;
        }
        if node.node_type.is_host() && !node.current_os_version.is_empty() {
            *os_versions.entry(node.current_os_version.clone()).or_insert(0) +=
                1;
        }

        let platform_change_duration_secs = if node.platform_converged() {
            0
        } else {
            seconds_since(node.wanted_version_changed_at, now)
        };
        let os_change_duration_secs = if node.os_converged() {
            0
        } else {
            seconds_since(node.wanted_os_version_changed_at, now)
        };
        node_metrics.push(NodeChangeMetrics {
            node: node.id.clone(),
            zone: node.zone.clone(),
            node_type: node.node_type,
            platform_change_duration_secs,
            os_change_duration_secs,
        });
    }

    FleetMetrics {
        sampled_at: now,
        nodes: node_metrics,
        platform_versions,
        os_versions,
        broken_system_version: status
            .map_or(false, VersionStatus::system_version_broken),
    }
}

fn seconds_since(then: Option<DateTime<Utc>>, now: DateTime<Utc>) -> u64 {
    then.and_then(|then| u64::try_from((now - then).num_seconds()).ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_fixtures::node;
    use crate::test_fixtures::now;
    use crate::test_fixtures::v;
    use crate::test_fixtures::version_status;
    use crate::test_fixtures::zone;
    use fleet_common::Version;
    use fleet_types::confidence::Confidence;
    use fleet_types::node::NodeType;

    #[test]
    fn test_change_durations() {
        let mut upgrading =
            node("host1", &zone("us-east-1"), NodeType::Host, &v(1));
        upgrading.wanted_version = v(2);
        upgrading.wanted_version_changed_at =
            Some(now() - chrono::Duration::minutes(10));
        upgrading.current_os_version = Version::new(9, 3, 0);
        upgrading.wanted_os_version = Version::new(9, 2, 0);
        upgrading.wanted_os_version_changed_at =
            Some(now() - chrono::Duration::hours(1));

        let mut proxy =
            node("proxy1", &zone("us-east-1"), NodeType::Proxy, &v(2));
        proxy.wanted_version_changed_at =
            Some(now() - chrono::Duration::days(1));

        let metrics = compute_metrics(&[upgrading, proxy], None, now());
        assert_eq!(metrics.nodes[0].platform_change_duration_secs, 600);
        // Past the wanted OS version counts as converged.
        assert_eq!(metrics.nodes[0].os_change_duration_secs, 0);
        assert_eq!(metrics.nodes[1].platform_change_duration_secs, 0);
        assert_eq!(
            metrics.platform_versions,
            BTreeMap::from([(v(1), 1), (v(2), 1)])
        );
        // Only hosts have an OS version.
        assert_eq!(
            metrics.os_versions,
            BTreeMap::from([(Version::new(9, 3, 0), 1)])
        );
        assert!(!metrics.broken_system_version);
    }

    #[test]
    fn test_broken_system_version() {
        let status = version_status(2, &[(2, Confidence::Broken)]);
        let metrics = compute_metrics(&[], Some(&status), now());
        assert!(metrics.broken_system_version);
        assert!(metrics.nodes.is_empty());
    }
}
