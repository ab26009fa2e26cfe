// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Metrics the orchestrator reports about the fleet

use crate::node::NodeType;
use chrono::DateTime;
use chrono::Utc;
use fleet_common::NodeId;
use fleet_common::Version;
use fleet_common::ZoneId;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;

/// Change durations for one node
///
/// A duration is the number of seconds since the node's wanted version last
/// changed, or zero once the node has converged.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct NodeChangeMetrics {
    pub node: NodeId,
    pub zone: ZoneId,
    pub node_type: NodeType,
    pub platform_change_duration_secs: u64,
    pub os_change_duration_secs: u64,
}

/// One sample of everything the metrics reporter publishes
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct FleetMetrics {
    pub sampled_at: DateTime<Utc>,
    pub nodes: Vec<NodeChangeMetrics>,
    /// number of nodes currently on each platform version
    pub platform_versions: BTreeMap<Version, usize>,
    /// number of hosts currently on each OS version
    pub os_versions: BTreeMap<Version, usize>,
    /// whether the controller's own version is broken
    pub broken_system_version: bool,
}
