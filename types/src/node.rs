// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Nodes as reported by the node registry
//!
//! Nodes are not owned by the orchestrator.  It reads them, and writes only
//! their wanted platform and OS versions.

use chrono::DateTime;
use chrono::Utc;
use fleet_common::Generation;
use fleet_common::NodeId;
use fleet_common::Version;
use fleet_common::ZoneId;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::collections::BTreeSet;

/// What a node runs
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
    strum::EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NodeType {
    /// host running the controller itself
    ControllerHost,
    /// host running a config server container
    ConfigServerHost,
    /// host running a proxy container
    ProxyHost,
    /// host running tenant containers
    Host,
    /// config server container
    ConfigServer,
    /// proxy container
    Proxy,
    /// tenant container
    Tenant,
}

impl NodeType {
    /// Returns whether nodes of this type run a host operating system
    pub fn is_host(&self) -> bool {
        matches!(
            self,
            NodeType::ControllerHost
                | NodeType::ConfigServerHost
                | NodeType::ProxyHost
                | NodeType::Host
        )
    }
}

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
    strum::EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NodeState {
    Provisioned,
    Ready,
    Reserved,
    Active,
    Inactive,
    Dirty,
    Failed,
    Parked,
    Deprovisioned,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Node {
    pub id: NodeId,
    pub zone: ZoneId,
    pub node_type: NodeType,
    pub state: NodeState,
    /// set while the node's services are suspended (e.g. for an upgrade)
    pub suspended_since: Option<DateTime<Utc>>,
    /// excluded from rollout by an operator
    pub excluded: bool,
    pub current_version: Version,
    pub wanted_version: Version,
    pub current_os_version: Version,
    pub wanted_os_version: Version,
    pub wanted_version_changed_at: Option<DateTime<Utc>>,
    pub wanted_os_version_changed_at: Option<DateTime<Utc>>,
}

impl Node {
    /// Returns whether this node takes part in convergence checks
    ///
    /// Failed, parked and otherwise non-active nodes, and nodes an operator
    /// has excluded, never hold up a rollout.
    pub fn is_eligible(&self) -> bool {
        self.state == NodeState::Active && !self.excluded
    }

    pub fn platform_converged(&self) -> bool {
        self.current_version == self.wanted_version
    }

    /// Returns whether the node runs at least the OS version it was asked
    /// to run
    ///
    /// Nodes may upgrade themselves past what they were told to run, so this
    /// is not an equality check.
    pub fn os_converged(&self) -> bool {
        self.current_os_version >= self.wanted_os_version
    }

    /// Returns whether the node has been told to run at least `target` and
    /// does so
    pub fn os_converged_to(&self, target: &Version) -> bool {
        self.os_converged() && self.wanted_os_version >= *target
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended_since.is_some()
    }
}

/// Selects nodes in [`crate::node::Node`] listings
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct NodeFilter {
    /// if non-empty, only nodes of these types
    pub node_types: BTreeSet<NodeType>,
    /// if non-empty, only nodes in these states
    pub states: BTreeSet<NodeState>,
}

impl NodeFilter {
    pub fn all() -> NodeFilter {
        NodeFilter::default()
    }

    pub fn node_type(node_type: NodeType) -> NodeFilter {
        NodeFilter {
            node_types: BTreeSet::from([node_type]),
            states: BTreeSet::new(),
        }
    }

    pub fn node_types<I>(node_types: I) -> NodeFilter
    where
        I: IntoIterator<Item = NodeType>,
    {
        NodeFilter {
            node_types: node_types.into_iter().collect(),
            states: BTreeSet::new(),
        }
    }

    pub fn in_state(mut self, state: NodeState) -> NodeFilter {
        self.states.insert(state);
        self
    }

    pub fn matches(&self, node: &Node) -> bool {
        let type_matches = self.node_types.is_empty()
            || self.node_types.contains(&node.node_type);
        let state_matches =
            self.states.is_empty() || self.states.contains(&node.state);
        type_matches && state_matches
    }
}

/// Config generations of an application in one zone
///
/// The application's config converges once every service has applied the
/// wanted generation.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct ConvergenceStatus {
    /// platform version the application package was last deployed with
    pub deployed_version: Version,
    pub current_generation: Generation,
    pub wanted_generation: Generation,
    /// generation each service has applied, by service name
    pub services: BTreeMap<String, Generation>,
}

impl ConvergenceStatus {
    pub fn converged(&self) -> bool {
        self.current_generation >= self.wanted_generation
            && self.services.values().all(|g| *g >= self.wanted_generation)
    }
}
