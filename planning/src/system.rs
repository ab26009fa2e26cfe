// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Rolls system applications through the zones
//!
//! The target is the system version record's `target`.  Zones are visited in
//! the order of the [`ZoneUpgradePolicy`], one step at a time, and within a
//! zone an application only moves once the applications it depends on are
//! done there.
//!
//! If the target has been aborted, the same machinery runs backwards: the
//! direction becomes [`Direction::Downgrade`], the target becomes the newest
//! earlier version that may still be deployed, zones are visited last step
//! first, and dependents move before their dependencies.  Once a downgrade
//! completes, the plan includes a record update that makes the downgrade
//! version the new target.

use crate::rollout;
use crate::rollout::RolloutProgress;
use fleet_common::NodeId;
use fleet_common::Version;
use fleet_common::ZoneId;
use fleet_types::confidence::Confidence;
use fleet_types::node::ConvergenceStatus;
use fleet_types::node::Node;
use fleet_types::system::Direction;
use fleet_types::system::SystemApplication;
use fleet_types::system::SystemVersionRecord;
use fleet_types::version_status::VersionStatus;
use fleet_types::zone_policy::ZoneUpgradePolicy;
use serde::Serialize;
use slog::debug;
use slog::info;
use slog::Logger;
use std::collections::BTreeMap;
use thiserror::Error;

/// Config convergence of package applications, by application and zone
pub type ConvergenceMap =
    BTreeMap<(SystemApplication, ZoneId), ConvergenceStatus>;

pub struct SystemUpgradeInput<'a> {
    pub record: &'a SystemVersionRecord,
    pub status: &'a VersionStatus,
    pub policy: &'a ZoneUpgradePolicy,
    /// nodes of system applications, by zone
    pub nodes: &'a BTreeMap<ZoneId, Vec<Node>>,
    pub convergence: &'a ConvergenceMap,
}

/// How far an application has come in one zone
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AppState {
    /// waiting for the applications it depends on
    Pending,
    /// wanted versions were moved this cycle
    WantedVersionRaised,
    /// nodes have not reached their wanted version
    Converging,
    /// nodes are done and the package's config has not converged
    ConfigConverging,
    Done,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SystemAction {
    SetWantedVersion {
        application: SystemApplication,
        zone: ZoneId,
        nodes: Vec<NodeId>,
        version: Version,
    },
    Redeploy {
        application: SystemApplication,
        zone: ZoneId,
        version: Version,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AppProgress {
    pub application: SystemApplication,
    pub zone: ZoneId,
    pub state: AppState,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SystemUpgradePlan {
    pub target: Version,
    pub direction: Direction,
    pub actions: Vec<SystemAction>,
    /// state of each application in each zone visited, in visiting order
    pub states: Vec<AppProgress>,
    pub progress: RolloutProgress,
    /// record to write once a downgrade has completed
    pub record_update: Option<SystemVersionRecord>,
}

impl SystemUpgradePlan {
    /// The first application in the current step that is not done, if any
    pub fn waiting_on(&self) -> Option<&AppProgress> {
        self.states.iter().find(|p| p.state != AppState::Done)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SystemUpgradeError {
    #[error("target {0} is aborted and has no earlier version to go back to")]
    NoDowngradeTarget(Version),
}

pub struct SystemUpgradePlanner<'a> {
    log: Logger,
    input: &'a SystemUpgradeInput<'a>,
}

impl<'a> SystemUpgradePlanner<'a> {
    pub fn new(
        log: &Logger,
        input: &'a SystemUpgradeInput<'a>,
    ) -> SystemUpgradePlanner<'a> {
        SystemUpgradePlanner {
            log: log.new(slog::o!("planner" => "system_upgrade")),
            input,
        }
    }

    pub fn plan(self) -> Result<SystemUpgradePlan, SystemUpgradeError> {
        let (target, direction) = self.do_plan_target()?;
        let policy = match direction {
            Direction::Upgrade => self.input.policy.clone(),
            Direction::Downgrade => self.input.policy.reversed(),
        };

        let mut actions = Vec::new();
        let mut states = Vec::new();
        let progress = rollout::walk(&policy, |zone| {
            self.do_plan_zone(
                zone,
                &target,
                direction,
                &mut actions,
                &mut states,
            )
        });

        let record_update = (direction == Direction::Downgrade
            && progress.is_done())
        .then(|| {
            info!(
                self.log,
                "downgrade complete";
                "from" => %self.input.record.target,
                "to" => %target,
            );
            SystemVersionRecord {
                live: self.input.record.live.clone(),
                target: target.clone(),
            }
        });

        Ok(SystemUpgradePlan {
            target,
            direction,
            actions,
            states,
            progress,
            record_update,
        })
    }

    fn do_plan_target(
        &self,
    ) -> Result<(Version, Direction), SystemUpgradeError> {
        let target = &self.input.record.target;
        if self.input.status.confidence(target) != Some(Confidence::Aborted) {
            return Ok((target.clone(), Direction::Upgrade));
        }

        let previous = self
            .input
            .status
            .deployable()
            .map(|entry| &entry.version)
            .filter(|version| *version < target)
            .last()
            .ok_or_else(|| {
                SystemUpgradeError::NoDowngradeTarget(target.clone())
            })?;
        info!(
            self.log,
            "target is aborted, downgrading";
            "aborted" => %target,
            "downgrade_to" => %previous,
        );
        Ok((previous.clone(), Direction::Downgrade))
    }

    /// Moves every application in `zone` as far as it can go, and returns
    /// whether all of them are done
    fn do_plan_zone(
        &self,
        zone: &ZoneId,
        target: &Version,
        direction: Direction,
        actions: &mut Vec<SystemAction>,
        states: &mut Vec<AppProgress>,
    ) -> bool {
        let mut zone_states = BTreeMap::new();
        for application in SystemApplication::ordered_for(direction) {
            let ready = application
                .prerequisites(direction)
                .iter()
                .all(|prereq| zone_states.get(prereq) == Some(&AppState::Done));
            let state = if ready {
                self.do_plan_application(
                    application,
                    zone,
                    target,
                    direction,
                    actions,
                )
            } else {
                AppState::Pending
            };
            debug!(
                self.log,
                "application state";
                "application" => %application,
                "zone" => %zone,
                "state" => %state,
            );
            zone_states.insert(application, state);
            states.push(AppProgress {
                application,
                zone: zone.clone(),
                state,
            });
        }
        zone_states.values().all(|state| *state == AppState::Done)
    }

    fn do_plan_application(
        &self,
        application: SystemApplication,
        zone: &ZoneId,
        target: &Version,
        direction: Direction,
        actions: &mut Vec<SystemAction>,
    ) -> AppState {
        let nodes: Vec<&Node> = self
            .input
            .nodes
            .get(zone)
            .into_iter()
            .flatten()
            .filter(|node| node.node_type == application.node_type())
            .filter(|node| node.is_eligible())
            .collect();

        let to_move: Vec<NodeId> = nodes
            .iter()
            .filter(|node| direction.moves_toward(&node.wanted_version, target))
            .map(|node| node.id.clone())
            .collect();
        if !to_move.is_empty() {
            info!(
                self.log,
                "setting wanted version";
                "application" => %application,
                "zone" => %zone,
                "version" => %target,
                "nodes" => to_move.len(),
            );
            actions.push(SystemAction::SetWantedVersion {
                application,
                zone: zone.clone(),
                nodes: to_move,
                version: target.clone(),
            });
            return AppState::WantedVersionRaised;
        }

        if !nodes.iter().all(|node| node.platform_converged()) {
            return AppState::Converging;
        }
        if !application.has_package() {
            return AppState::Done;
        }

        match self.input.convergence.get(&(application, zone.clone())) {
            None => {
                debug!(
                    self.log,
                    "no convergence status";
                    "application" => %application,
                    "zone" => %zone,
                );
                AppState::ConfigConverging
            }
            Some(status) if status.deployed_version != *target => {
                info!(
                    self.log,
                    "redeploying";
                    "application" => %application,
                    "zone" => %zone,
                    "from" => %status.deployed_version,
                    "to" => %target,
                );
                actions.push(SystemAction::Redeploy {
                    application,
                    zone: zone.clone(),
                    version: target.clone(),
                });
                AppState::ConfigConverging
            }
            Some(status) if !status.converged() => AppState::ConfigConverging,
            Some(_) => AppState::Done,
        }
    }
}
