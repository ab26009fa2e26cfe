// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Background task for rolling system applications to the system version

use crate::interfaces::CoordinationStore;
use crate::interfaces::NodeRegistry;
use crate::BackgroundTask;
use fleet_common::api::Error;
use fleet_common::ZoneId;
use fleet_types::background::SystemUpgraderStatus;
use fleet_types::node::Node;
use fleet_types::node::NodeFilter;
use fleet_types::system::SystemApplication;
use fleet_types::zone_policy::ZoneUpgradePolicy;
use fleet_upgrade_planning::system::ConvergenceMap;
use fleet_upgrade_planning::system::SystemAction;
use fleet_upgrade_planning::system::SystemUpgradeInput;
use fleet_upgrade_planning::system::SystemUpgradePlanner;
use futures::future::join_all;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::json;
use slog::error;
use slog::info;
use slog::warn;
use slog::Logger;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Background task that moves system applications zone by zone toward the
/// system version target, or back from it if it was aborted
pub struct SystemUpgrader {
    nodes: Arc<dyn NodeRegistry>,
    coordination: Arc<dyn CoordinationStore>,
    policy: ZoneUpgradePolicy,
}

impl SystemUpgrader {
    pub fn new(
        nodes: Arc<dyn NodeRegistry>,
        coordination: Arc<dyn CoordinationStore>,
        policy: ZoneUpgradePolicy,
    ) -> SystemUpgrader {
        SystemUpgrader { nodes, coordination, policy }
    }

    /// Reads every node and package convergence status in the topology
    ///
    /// Any failure fails the whole read: a zone we could not see would look
    /// finished to the planner.
    async fn read_zones(
        &self,
    ) -> Result<(BTreeMap<ZoneId, Vec<Node>>, ConvergenceMap), Error> {
        let filter = NodeFilter::all();
        let zones: Vec<&ZoneId> = self.policy.zones().collect();

        let listings = zones.iter().map(|zone| {
            let filter = &filter;
            async move {
                let nodes = self.nodes.list_nodes(zone, filter).await?;
                Ok::<_, Error>(((*zone).clone(), nodes))
            }
        });
        let nodes = join_all(listings)
            .await
            .into_iter()
            .collect::<Result<BTreeMap<_, _>, _>>()?;

        let packages: Vec<(SystemApplication, &ZoneId)> = zones
            .iter()
            .flat_map(|zone| {
                SystemApplication::ordered()
                    .into_iter()
                    .filter(SystemApplication::has_package)
                    .map(move |app| (app, *zone))
            })
            .collect();
        let statuses = packages.iter().map(|(app, zone)| async move {
            let status = self.nodes.convergence_status(*app, zone).await?;
            Ok::<_, Error>(status.map(|s| ((*app, (*zone).clone()), s)))
        });
        let mut convergence = ConvergenceMap::new();
        for result in join_all(statuses).await {
            if let Some((key, status)) = result? {
                convergence.insert(key, status);
            }
        }
        Ok((nodes, convergence))
    }

    pub(crate) async fn upgrade(
        &mut self,
        log: &Logger,
    ) -> SystemUpgraderStatus {
        let mut status = SystemUpgraderStatus::default();
        let coordination = &self.coordination;

        let (record, generation) = match coordination.system_version().await {
            Ok(record) => record,
            Err(error) => {
                error!(log, "failed to read system version"; "error" => %error);
                status.errors.push(format!("reading system version: {error}"));
                return status;
            }
        };
        let version_status = match coordination.version_status().await {
            Ok(Some(version_status)) => version_status,
            Ok(None) => {
                info!(log, "no version status yet; nothing to do");
                return status;
            }
            Err(error) => {
                error!(log, "failed to read version status"; "error" => %error);
                status.errors.push(format!("reading version status: {error}"));
                return status;
            }
        };
        let (nodes, convergence) = match self.read_zones().await {
            Ok(read) => read,
            Err(error) => {
                error!(log, "failed to read zones"; "error" => %error);
                status.errors.push(format!("reading zones: {error}"));
                return status;
            }
        };

        let input = SystemUpgradeInput {
            record: &record,
            status: &version_status,
            policy: &self.policy,
            nodes: &nodes,
            convergence: &convergence,
        };
        let plan = match SystemUpgradePlanner::new(log, &input).plan() {
            Ok(plan) => plan,
            Err(error) => {
                error!(log, "failed to plan system upgrade"; "error" => %error);
                status.errors.push(error.to_string());
                return status;
            }
        };
        status.target = Some(plan.target.to_string());
        status.direction = Some(plan.direction);
        status.waiting_on = plan
            .waiting_on()
            .map(|p| format!("{} in {} ({})", p.application, p.zone, p.state));

        let registry = &self.nodes;
        let executions = plan.actions.iter().map(|action| async move {
            let result = match action {
                SystemAction::SetWantedVersion {
                    zone, nodes, version, ..
                } => registry.set_wanted_version(zone, nodes, version).await,
                SystemAction::Redeploy { application, zone, version } => {
                    registry.redeploy(*application, zone, version).await
                }
            };
            (action, result)
        });
        for (action, result) in join_all(executions).await {
            let (application, zone, done) = match action {
                SystemAction::SetWantedVersion { application, zone, .. } => {
                    (application, zone, &mut status.wanted_version_set)
                }
                SystemAction::Redeploy { application, zone, .. } => {
                    (application, zone, &mut status.redeployed)
                }
            };
            match result {
                Ok(()) => done.push(format!("{application} in {zone}")),
                Err(error) => {
                    warn!(
                        log,
                        "failed to execute system upgrade action";
                        "application" => %application,
                        "zone" => %zone,
                        "error" => %error,
                    );
                    status
                        .errors
                        .push(format!("{application} in {zone}: {error}"));
                }
            }
        }

        if let Some(update) = plan.record_update {
            match coordination.set_system_version(update, generation).await {
                Ok(_) => {
                    info!(
                        log,
                        "system version target moved";
                        "target" => %plan.target,
                    );
                }
                Err(error) => {
                    error!(
                        log,
                        "failed to update system version";
                        "error" => %error,
                    );
                    status
                        .errors
                        .push(format!("updating system version: {error}"));
                }
            }
        }
        status
    }
}

impl BackgroundTask for SystemUpgrader {
    fn activate<'a>(
        &'a mut self,
        log: &'a Logger,
    ) -> BoxFuture<'a, serde_json::Value> {
        async move {
            let status = self.upgrade(log).await;
            match serde_json::to_value(status) {
                Ok(val) => val,
                Err(err) => json!({
                    "error": format!("could not serialize task status: {err}"),
                }),
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fakes::FakeCoordinationStore;
    use crate::fakes::FakeNodeRegistry;
    use fleet_common::CloudName;
    use fleet_common::Generation;
    use fleet_common::Version;
    use fleet_test_utils::dev::test_setup_log;
    use fleet_types::confidence::Confidence;
    use fleet_types::node::ConvergenceStatus;
    use fleet_types::system::Direction;
    use fleet_types::system::SystemVersionRecord;
    use fleet_upgrade_planning::test_fixtures::node;
    use fleet_upgrade_planning::test_fixtures::v;
    use fleet_upgrade_planning::test_fixtures::version_status;
    use fleet_upgrade_planning::test_fixtures::zone;

    fn zones() -> [ZoneId; 2] {
        [zone("zone1"), zone("zone2")]
    }

    fn policy() -> ZoneUpgradePolicy {
        let [zone1, zone2] = zones();
        ZoneUpgradePolicy::builder()
            .in_cloud(CloudName::new("aws"))
            .upgrade(zone1)
            .upgrade(zone2)
            .build()
            .unwrap()
    }

    /// One node per system application in each zone, with converged
    /// packages, all on `version`
    fn registry(version: &Version) -> Arc<FakeNodeRegistry> {
        let registry = Arc::new(FakeNodeRegistry::new());
        for zone in zones() {
            for app in SystemApplication::ordered() {
                let name = format!("{app}.{}", zone.region());
                registry.add_node(node(&name, &zone, app.node_type(), version));
                if app.has_package() {
                    registry.set_convergence(
                        app,
                        &zone,
                        ConvergenceStatus {
                            deployed_version: version.clone(),
                            current_generation: Generation::new(),
                            wanted_generation: Generation::new(),
                            services: BTreeMap::new(),
                        },
                    );
                }
            }
        }
        registry
    }

    #[tokio::test]
    async fn test_upgrade_runs_to_completion() {
        const TEST_NAME: &str = "test_upgrade_runs_to_completion";
        let logctx = test_setup_log(TEST_NAME);

        let registry = registry(&v(1));
        let coordination = Arc::new(FakeCoordinationStore::with_system_version(
            SystemVersionRecord { live: v(1), target: v(2) },
        ));
        coordination
            .put_version_status(version_status(
                1,
                &[(1, Confidence::High), (2, Confidence::Low)],
            ))
            .await
            .unwrap();
        let mut task = SystemUpgrader::new(
            registry.clone(),
            coordination.clone(),
            policy(),
        );

        // Hosts of the first zone go first.
        let status = task.upgrade(&logctx.log).await;
        assert!(status.errors.is_empty(), "{:?}", status.errors);
        assert_eq!(status.target, Some(v(2).to_string()));
        assert_eq!(status.direction, Some(Direction::Upgrade));
        let [zone1, zone2] = zones();
        assert_eq!(
            status.wanted_version_set,
            [
                SystemApplication::ControllerHost,
                SystemApplication::ConfigServerHost,
                SystemApplication::ProxyHost,
                SystemApplication::TenantHost,
            ]
            .map(|app| format!("{app} in {zone1}"))
        );
        assert!(registry
            .nodes(&zone2)
            .iter()
            .all(|n| n.wanted_version == v(1)));

        // Nothing moves until the nodes have converged.
        let status = task.upgrade(&logctx.log).await;
        assert!(status.wanted_version_set.is_empty());
        assert!(status.waiting_on.is_some());

        let mut cycles = 0;
        loop {
            registry.converge_all();
            let status = task.upgrade(&logctx.log).await;
            assert!(status.errors.is_empty(), "{:?}", status.errors);
            if status.waiting_on.is_none() {
                break;
            }
            cycles += 1;
            assert!(cycles < 20, "rollout did not finish");
        }
        for zone in zones() {
            assert!(registry
                .nodes(&zone)
                .iter()
                .all(|n| n.current_version == v(2)));
        }
        let redeployed = registry.redeployed();
        assert_eq!(redeployed.len(), 4);
        assert!(redeployed.iter().all(|(_, _, version)| *version == v(2)));
        // Upgrades leave the record alone.
        assert_eq!(
            coordination.stored_system_version(),
            SystemVersionRecord { live: v(1), target: v(2) }
        );

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_unreachable_zone_stops_the_cycle() {
        const TEST_NAME: &str = "test_unreachable_zone_stops_the_cycle";
        let logctx = test_setup_log(TEST_NAME);

        let registry = registry(&v(1));
        let [zone1, zone2] = zones();
        registry.set_unavailable(&zone2, true);
        let coordination = Arc::new(FakeCoordinationStore::with_system_version(
            SystemVersionRecord { live: v(1), target: v(2) },
        ));
        coordination
            .put_version_status(version_status(
                1,
                &[(1, Confidence::High), (2, Confidence::Low)],
            ))
            .await
            .unwrap();
        let mut task =
            SystemUpgrader::new(registry.clone(), coordination, policy());

        let status = task.upgrade(&logctx.log).await;
        assert_eq!(status.errors.len(), 1);
        assert!(status.wanted_version_set.is_empty());
        assert!(registry
            .nodes(&zone1)
            .iter()
            .all(|n| n.wanted_version == v(1)));

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_completed_downgrade_moves_target() {
        const TEST_NAME: &str = "test_completed_downgrade_moves_target";
        let logctx = test_setup_log(TEST_NAME);

        // Nothing ever reached the aborted version, so the downgrade is
        // done as soon as it starts.
        let registry = registry(&v(2));
        let coordination = Arc::new(FakeCoordinationStore::with_system_version(
            SystemVersionRecord { live: v(2), target: v(3) },
        ));
        coordination
            .put_version_status(version_status(
                2,
                &[(2, Confidence::High), (3, Confidence::Aborted)],
            ))
            .await
            .unwrap();
        let mut task = SystemUpgrader::new(
            registry.clone(),
            coordination.clone(),
            policy(),
        );

        let status = task.upgrade(&logctx.log).await;
        assert!(status.errors.is_empty(), "{:?}", status.errors);
        assert_eq!(status.direction, Some(Direction::Downgrade));
        assert_eq!(status.target, Some(v(2).to_string()));
        assert_eq!(status.waiting_on, None);
        assert_eq!(
            coordination.stored_system_version(),
            SystemVersionRecord::new(v(2))
        );

        logctx.cleanup_successful();
    }
}
