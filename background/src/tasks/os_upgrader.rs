// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Background task for rolling hosts to their cloud's OS version target

use crate::interfaces::CoordinationStore;
use crate::interfaces::NodeRegistry;
use crate::BackgroundTask;
use chrono::DateTime;
use chrono::Utc;
use fleet_common::api::Error;
use fleet_common::ZoneId;
use fleet_types::background::OsUpgraderStatus;
use fleet_types::node::Node;
use fleet_types::node::NodeFilter;
use fleet_types::node::NodeType;
use fleet_types::os::OsVersionTarget;
use fleet_types::zone_policy::ZoneUpgradePolicy;
use fleet_upgrade_planning::os::OsUpgradeInput;
use fleet_upgrade_planning::os::OsUpgradePlanner;
use futures::future::join_all;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::json;
use slog::debug;
use slog::error;
use slog::o;
use slog::warn;
use slog::Logger;
use std::collections::BTreeMap;
use std::sync::Arc;
use strum::IntoEnumIterator;

pub struct OsUpgrader {
    nodes: Arc<dyn NodeRegistry>,
    coordination: Arc<dyn CoordinationStore>,
    policy: ZoneUpgradePolicy,
    controller_zone: Option<ZoneId>,
}

impl OsUpgrader {
    pub fn new(
        nodes: Arc<dyn NodeRegistry>,
        coordination: Arc<dyn CoordinationStore>,
        policy: ZoneUpgradePolicy,
        controller_zone: Option<ZoneId>,
    ) -> OsUpgrader {
        OsUpgrader { nodes, coordination, policy, controller_zone }
    }

    /// Lists the hosts of every zone in `policy`
    async fn list_hosts(
        &self,
        policy: &ZoneUpgradePolicy,
    ) -> Result<BTreeMap<ZoneId, Vec<Node>>, Error> {
        let filter = NodeFilter::node_types(
            NodeType::iter().filter(NodeType::is_host),
        );
        let listings = policy.zones().map(|zone| {
            let filter = &filter;
            async move {
                let hosts = self.nodes.list_nodes(zone, filter).await?;
                Ok::<_, Error>((zone.clone(), hosts))
            }
        });
        join_all(listings).await.into_iter().collect()
    }

    async fn upgrade_cloud(
        &self,
        log: &Logger,
        target: &OsVersionTarget,
        now: DateTime<Utc>,
        status: &mut OsUpgraderStatus,
    ) {
        let cloud = &target.cloud;
        let policy = self.policy.for_cloud(cloud);
        let hosts = match self.list_hosts(&policy).await {
            Ok(hosts) => hosts,
            Err(error) => {
                error!(log, "failed to list hosts"; "error" => %error);
                status.errors.push(format!("{cloud}: listing hosts: {error}"));
                return;
            }
        };

        let input = OsUpgradeInput {
            target,
            policy: &self.policy,
            nodes: &hosts,
            controller_zone: self.controller_zone.as_ref(),
            now,
        };
        let plan = OsUpgradePlanner::new(log, &input).plan();
        status.overshoot += plan.overshoot;
        status.budget_exceeded.extend(plan.budget_exceeded.iter().map(|b| {
            format!("{}: overdue by {}s", b.node, b.overdue_by.as_secs())
        }));
        if plan.overshoot > 0 {
            debug!(log, "hosts ahead of target"; "count" => plan.overshoot);
        }

        let registry = &self.nodes;
        let writes = plan.actions.iter().map(|action| async move {
            let result = registry
                .set_wanted_os_version(
                    &action.zone,
                    &action.nodes,
                    &action.version,
                )
                .await;
            (action, result)
        });
        for (action, result) in join_all(writes).await {
            match result {
                Ok(()) => {
                    status.wanted_os_version_set.push(action.zone.to_string())
                }
                Err(error) => {
                    warn!(
                        log,
                        "failed to set wanted OS version";
                        "zone" => %action.zone,
                        "error" => %error,
                    );
                    status.errors.push(format!("{}: {error}", action.zone));
                }
            }
        }
    }

    pub(crate) async fn upgrade(
        &mut self,
        log: &Logger,
        now: DateTime<Utc>,
    ) -> OsUpgraderStatus {
        let mut status = OsUpgraderStatus::default();

        let targets = match self.coordination.os_targets().await {
            Ok(targets) => targets,
            Err(error) => {
                error!(log, "failed to read OS targets"; "error" => %error);
                status.errors.push(format!("reading OS targets: {error}"));
                return status;
            }
        };

        let clouds = self.policy.clouds();
        for (target, _) in &targets {
            if !clouds.contains(&target.cloud) {
                debug!(
                    log,
                    "ignoring OS target of cloud outside topology";
                    "cloud" => %target.cloud,
                );
                continue;
            }
            status
                .targets
                .insert(target.cloud.to_string(), target.version.to_string());
            let log = log.new(o!("cloud" => target.cloud.to_string()));
            self.upgrade_cloud(&log, target, now, &mut status).await;
        }
        status
    }
}

impl BackgroundTask for OsUpgrader {
    fn activate<'a>(
        &'a mut self,
        log: &'a Logger,
    ) -> BoxFuture<'a, serde_json::Value> {
        async move {
            let status = self.upgrade(log, Utc::now()).await;
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
    use fleet_common::NodeId;
    use fleet_common::Version;
    use fleet_test_utils::dev::test_setup_log;
    use fleet_types::os::TargetSource;
    use fleet_upgrade_planning::test_fixtures::node;
    use fleet_upgrade_planning::test_fixtures::now;
    use fleet_upgrade_planning::test_fixtures::v;
    use fleet_upgrade_planning::test_fixtures::zone;
    use std::time::Duration;

    fn os(minor: u32) -> Version {
        Version::new(9, minor, 0)
    }

    struct Harness {
        registry: Arc<FakeNodeRegistry>,
        task: OsUpgrader,
    }

    /// Two hosts in each of two zones of `aws`, and a target of `os(5)` with
    /// two hours of budget
    async fn harness() -> Harness {
        let aws = CloudName::new("aws");
        let policy = ZoneUpgradePolicy::builder()
            .in_cloud(aws.clone())
            .upgrade(zone("zone1"))
            .upgrade(zone("zone2"))
            .build()
            .unwrap();
        let registry = Arc::new(FakeNodeRegistry::new());
        for region in ["zone1", "zone2"] {
            for i in 0..2 {
                let name = format!("host{i}.{region}");
                let mut host =
                    node(&name, &zone(region), NodeType::Host, &v(1));
                host.current_os_version = os(1);
                host.wanted_os_version = os(1);
                registry.add_node(host);
            }
            // Not a host: never touched.
            let name = format!("proxy.{region}");
            let proxy = node(&name, &zone(region), NodeType::Proxy, &v(1));
            registry.add_node(proxy);
        }
        let coordination = Arc::new(FakeCoordinationStore::new());
        coordination
            .set_os_target(
                OsVersionTarget {
                    cloud: aws,
                    version: os(5),
                    upgrade_budget: Duration::from_secs(2 * 3600),
                    source: TargetSource::Scheduled,
                    scheduled_at: now(),
                    expires_at: None,
                },
                None,
            )
            .await
            .unwrap();
        let task =
            OsUpgrader::new(registry.clone(), coordination, policy, None);
        Harness { registry, task }
    }

    #[tokio::test]
    async fn test_zones_upgrade_in_order() {
        const TEST_NAME: &str = "test_zones_upgrade_in_order";
        let logctx = test_setup_log(TEST_NAME);
        let mut h = harness().await;

        let status = h.task.upgrade(&logctx.log, now()).await;
        assert!(status.errors.is_empty(), "{:?}", status.errors);
        assert_eq!(
            status.targets,
            BTreeMap::from([("aws".to_string(), os(5).to_string())])
        );
        assert_eq!(status.wanted_os_version_set, [zone("zone1").to_string()]);
        for node in h.registry.nodes(&zone("zone2")) {
            assert_eq!(node.wanted_os_version, os(1));
        }
        let proxy = h.registry.node(&NodeId::new("proxy.zone1")).unwrap();
        assert_eq!(proxy.wanted_os_version, Version::EMPTY);

        // One host goes further than asked; that counts as done.
        h.registry.converge_all();
        h.registry.update_node(&NodeId::new("host0.zone1"), |node| {
            node.current_os_version = os(6);
        });
        let status = h.task.upgrade(&logctx.log, now()).await;
        assert_eq!(status.wanted_os_version_set, [zone("zone2").to_string()]);
        assert_eq!(status.overshoot, 1);

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_budget_exceeded_is_reported() {
        const TEST_NAME: &str = "test_budget_exceeded_is_reported";
        let logctx = test_setup_log(TEST_NAME);
        let mut h = harness().await;

        h.task.upgrade(&logctx.log, now()).await;
        // Each step gets an hour; this host has been suspended for 90
        // minutes without finishing.
        h.registry.update_node(&NodeId::new("host1.zone1"), |node| {
            node.suspended_since = Some(now() - chrono::Duration::minutes(90));
        });

        let status = h.task.upgrade(&logctx.log, now()).await;
        assert!(status.errors.is_empty(), "{:?}", status.errors);
        assert_eq!(status.budget_exceeded, ["host1.zone1: overdue by 1800s"]);
        assert!(status.wanted_os_version_set.is_empty());

        logctx.cleanup_successful();
    }
}
