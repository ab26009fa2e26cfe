// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! System applications, ordered by their dependencies

use crate::node::NodeType;
use fleet_common::Version;
use serde::Deserialize;
use serde::Serialize;
use strum::EnumIter;
use strum::IntoEnumIterator as _;

/// Applications the controller itself runs and upgrades
///
/// Variants are declared in dependency order: every application comes after
/// the applications it depends on, so iterating in declaration order is an
/// upgrade order.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    EnumIter,
    Deserialize,
    Serialize,
    strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SystemApplication {
    ControllerHost,
    ConfigServerHost,
    ProxyHost,
    TenantHost,
    ConfigServer,
    Proxy,
}

/// Which way a rollout moves versions
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Deserialize,
    Serialize,
    strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Direction {
    Upgrade,
    Downgrade,
}

impl Direction {
    /// Returns whether moving from `from` to `to` goes this way
    pub fn moves_toward(&self, from: &Version, to: &Version) -> bool {
        match self {
            Direction::Upgrade => from < to,
            Direction::Downgrade => from > to,
        }
    }
}

impl SystemApplication {
    pub fn node_type(&self) -> NodeType {
        match self {
            SystemApplication::ControllerHost => NodeType::ControllerHost,
            SystemApplication::ConfigServerHost => NodeType::ConfigServerHost,
            SystemApplication::ProxyHost => NodeType::ProxyHost,
            SystemApplication::TenantHost => NodeType::Host,
            SystemApplication::ConfigServer => NodeType::ConfigServer,
            SystemApplication::Proxy => NodeType::Proxy,
        }
    }

    /// Applications that must be done in a zone before this one starts
    /// there (on upgrade)
    pub fn dependencies(&self) -> &'static [SystemApplication] {
        match self {
            SystemApplication::ConfigServer => {
                &[SystemApplication::ConfigServerHost]
            }
            SystemApplication::Proxy => &[
                SystemApplication::ProxyHost,
                SystemApplication::ConfigServer,
            ],
            SystemApplication::ControllerHost
            | SystemApplication::ConfigServerHost
            | SystemApplication::ProxyHost
            | SystemApplication::TenantHost => &[],
        }
    }

    /// Applications that depend on this one
    pub fn dependents(&self) -> Vec<SystemApplication> {
        SystemApplication::iter()
            .filter(|app| app.dependencies().contains(self))
            .collect()
    }

    /// Applications that must be done in a zone before this one starts there
    /// when moving in `direction`
    ///
    /// Downgrades invert the dependency graph: dependents go first.
    pub fn prerequisites(
        &self,
        direction: Direction,
    ) -> Vec<SystemApplication> {
        match direction {
            Direction::Upgrade => self.dependencies().to_vec(),
            Direction::Downgrade => self.dependents(),
        }
    }

    /// Returns whether the application ships an application package whose
    /// config must converge, in addition to its nodes' versions
    pub fn has_package(&self) -> bool {
        matches!(
            self,
            SystemApplication::ConfigServer | SystemApplication::Proxy
        )
    }

    /// All applications, dependencies first
    pub fn ordered() -> Vec<SystemApplication> {
        SystemApplication::iter().collect()
    }

    /// All applications in the order they move in `direction`
    pub fn ordered_for(direction: Direction) -> Vec<SystemApplication> {
        let mut apps = SystemApplication::ordered();
        if direction == Direction::Downgrade {
            apps.reverse();
        }
        apps
    }
}

/// The controller's own system version, as a single coordination store row
///
/// `live` is what the controller runs; `target` is what the system upgrader
/// rolls system applications to.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct SystemVersionRecord {
    pub live: Version,
    pub target: Version,
}

impl SystemVersionRecord {
    pub fn new(version: Version) -> SystemVersionRecord {
        SystemVersionRecord { live: version.clone(), target: version }
    }
}
