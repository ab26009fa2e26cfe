// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Rolls a cloud's hosts to its OS version target
//!
//! Zones of the cloud are visited in policy order, one step at a time.  In
//! each zone, hosts whose wanted OS version is below the target have it
//! raised; it is never lowered.  A zone is done once every eligible host has
//! been told to run at least the target and does so.  Hosts that upgrade
//! past the target are counted but do not hold anything up.
//!
//! The target's upgrade budget is shared out between the steps, and within a
//! step between its zones (see [`zone_budgets()`]).  A host that stays
//! suspended for longer than its zone's budget is reported, but nothing is
//! done about it here.

use crate::rollout;
use crate::rollout::RolloutProgress;
use chrono::DateTime;
use chrono::Utc;
use fleet_common::CloudName;
use fleet_common::NodeId;
use fleet_common::Version;
use fleet_common::ZoneId;
use fleet_types::node::Node;
use fleet_types::os::OsVersionTarget;
use fleet_types::zone_policy::ZoneUpgradePolicy;
use serde::Serialize;
use serde_with::serde_as;
use serde_with::DurationSeconds;
use slog::info;
use slog::warn;
use slog::Logger;
use std::collections::BTreeMap;
use std::time::Duration;

pub struct OsUpgradeInput<'a> {
    pub target: &'a OsVersionTarget,
    /// the whole system's policy; only the target cloud's zones are used
    pub policy: &'a ZoneUpgradePolicy,
    /// hosts, by zone
    pub nodes: &'a BTreeMap<ZoneId, Vec<Node>>,
    /// zone the controller itself runs in, which takes no share of the
    /// budget
    pub controller_zone: Option<&'a ZoneId>,
    pub now: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SetWantedOsVersion {
    pub zone: ZoneId,
    pub nodes: Vec<NodeId>,
    pub version: Version,
}

/// A host that has been suspended for longer than its zone's budget
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BudgetExceeded {
    pub node: NodeId,
    pub zone: ZoneId,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub budget: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub overdue_by: Duration,
}

#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct OsUpgradePlan {
    pub cloud: CloudName,
    pub target: Version,
    pub actions: Vec<SetWantedOsVersion>,
    #[serde_as(as = "BTreeMap<_, DurationSeconds<u64>>")]
    pub budgets: BTreeMap<ZoneId, Duration>,
    pub budget_exceeded: Vec<BudgetExceeded>,
    /// eligible hosts in the cloud running a newer OS than the target
    pub overshoot: usize,
    pub progress: RolloutProgress,
}

/// Shares `total` out between the zones of `policy`
///
/// Each step that has a zone other than the controller's gets an equal
/// share, split equally between those zones.  The controller zone gets
/// nothing and does not count toward the division.
pub fn zone_budgets(
    policy: &ZoneUpgradePolicy,
    total: Duration,
    controller_zone: Option<&ZoneId>,
) -> BTreeMap<ZoneId, Duration> {
    let is_budgeted = |zone: &ZoneId| Some(zone) != controller_zone;
    let budgeted_steps = policy
        .steps()
        .iter()
        .filter(|step| step.zones().iter().any(is_budgeted))
        .count();

    let mut budgets = BTreeMap::new();
    for step in policy.steps() {
        let zones_in_step =
            step.zones().iter().filter(|z| is_budgeted(z)).count();
        for zone in step.zones() {
            let budget = if is_budgeted(zone) {
                divide(divide(total, budgeted_steps), zones_in_step)
            } else {
                Duration::ZERO
            };
            budgets.insert(zone.clone(), budget);
        }
    }
    budgets
}

fn divide(duration: Duration, n: usize) -> Duration {
    match u32::try_from(n) {
        Ok(0) => Duration::ZERO,
        Ok(n) => duration / n,
        Err(_) => Duration::ZERO,
    }
}

pub struct OsUpgradePlanner<'a> {
    log: Logger,
    input: &'a OsUpgradeInput<'a>,
}

impl<'a> OsUpgradePlanner<'a> {
    pub fn new(
        log: &Logger,
        input: &'a OsUpgradeInput<'a>,
    ) -> OsUpgradePlanner<'a> {
        OsUpgradePlanner {
            log: log.new(slog::o!(
                "planner" => "os_upgrade",
                "cloud" => input.target.cloud.to_string(),
            )),
            input,
        }
    }

    pub fn plan(self) -> OsUpgradePlan {
        let target = &self.input.target.version;
        let policy = self.input.policy.for_cloud(&self.input.target.cloud);
        let budgets = zone_budgets(
            &policy,
            self.input.target.upgrade_budget,
            self.input.controller_zone,
        );

        let mut actions = Vec::new();
        let mut budget_exceeded = Vec::new();
        let progress = rollout::walk(&policy, |zone| {
            let budget =
                budgets.get(zone).copied().unwrap_or(Duration::ZERO);
            self.do_plan_zone(
                zone,
                budget,
                &mut actions,
                &mut budget_exceeded,
            )
        });

        let overshoot = policy
            .zones()
            .flat_map(|zone| self.hosts(zone))
            .filter(|node| node.current_os_version > *target)
            .count();

        OsUpgradePlan {
            cloud: self.input.target.cloud.clone(),
            target: target.clone(),
            actions,
            budgets,
            budget_exceeded,
            overshoot,
            progress,
        }
    }

    fn hosts(&self, zone: &ZoneId) -> impl Iterator<Item = &'a Node> + '_ {
        self.input
            .nodes
            .get(zone)
            .into_iter()
            .flatten()
            .filter(|node| node.node_type.is_host() && node.is_eligible())
    }

    fn do_plan_zone(
        &self,
        zone: &ZoneId,
        budget: Duration,
        actions: &mut Vec<SetWantedOsVersion>,
        budget_exceeded: &mut Vec<BudgetExceeded>,
    ) -> bool {
        let target = &self.input.target.version;
        let hosts: Vec<&Node> = self.hosts(zone).collect();

        let to_raise: Vec<NodeId> = hosts
            .iter()
            .filter(|node| node.wanted_os_version < *target)
            .map(|node| node.id.clone())
            .collect();
        if !to_raise.is_empty() {
            info!(
                self.log,
                "raising wanted OS version";
                "zone" => %zone,
                "version" => %target,
                "nodes" => to_raise.len(),
            );
            actions.push(SetWantedOsVersion {
                zone: zone.clone(),
                nodes: to_raise,
                version: target.clone(),
            });
            return false;
        }

        // A zero budget means the zone is not monitored.
        if !budget.is_zero() {
            for node in &hosts {
                if let Some(overdue_by) = self.overdue_by(node, budget) {
                    warn!(
                        self.log,
                        "host exceeded its upgrade budget";
                        "node" => %node.id,
                        "zone" => %zone,
                        "budget_secs" => budget.as_secs(),
                        "overdue_by_secs" => overdue_by.as_secs(),
                    );
                    budget_exceeded.push(BudgetExceeded {
                        node: node.id.clone(),
                        zone: zone.clone(),
                        budget,
                        overdue_by,
                    });
                }
            }
        }

        hosts.iter().all(|node| node.os_converged_to(target))
    }

    /// How far past `budget` a suspended, unconverged host is
    fn overdue_by(&self, node: &Node, budget: Duration) -> Option<Duration> {
        if node.os_converged_to(&self.input.target.version) {
            return None;
        }
        let since = node.suspended_since?;
        let suspended = (self.input.now - since).to_std().ok()?;
        suspended.checked_sub(budget).filter(|d| !d.is_zero())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_fixtures::node;
    use crate::test_fixtures::now;
    use crate::test_fixtures::zone;
    use fleet_test_utils::dev::test_setup_log;
    use fleet_types::node::NodeType;
    use fleet_types::os::TargetSource;
    use test_strategy::proptest;

    const MINUTE: Duration = Duration::from_secs(60);

    fn os(minor: u32) -> Version {
        Version::new(9, minor, 0)
    }

    fn target(total: Duration) -> OsVersionTarget {
        OsVersionTarget {
            cloud: CloudName::new("aws"),
            version: os(2),
            upgrade_budget: total,
            source: TargetSource::Scheduled,
            scheduled_at: now(),
            expires_at: None,
        }
    }

    fn host(name: &str, zone: &ZoneId, os_version: Version) -> Node {
        let mut node = node(name, zone, NodeType::Host, &Version::new(8, 1, 0));
        node.current_os_version = os_version.clone();
        node.wanted_os_version = os_version;
        node
    }

    fn policy() -> ZoneUpgradePolicy {
        ZoneUpgradePolicy::builder()
            .in_cloud(CloudName::new("aws"))
            .upgrade(zone("controller"))
            .upgrade_in_parallel([zone("a"), zone("b")])
            .upgrade(zone("c"))
            .in_cloud(CloudName::new("gcp"))
            .upgrade(zone("g"))
            .build()
            .unwrap()
    }

    #[test]
    fn test_zone_budgets() {
        let aws = policy().for_cloud(&CloudName::new("aws"));
        let budgets =
            zone_budgets(&aws, 48 * MINUTE, Some(&zone("controller")));
        assert_eq!(
            budgets,
            BTreeMap::from([
                (zone("controller"), Duration::ZERO),
                (zone("a"), 12 * MINUTE),
                (zone("b"), 12 * MINUTE),
                (zone("c"), 24 * MINUTE),
            ])
        );

        // Without a controller zone, every step counts.
        let budgets = zone_budgets(&aws, 48 * MINUTE, None);
        assert_eq!(budgets[&zone("controller")], 16 * MINUTE);
        assert_eq!(budgets[&zone("a")], 8 * MINUTE);
    }

    #[test]
    fn test_raises_and_waits() {
        const TEST_NAME: &str = "test_raises_and_waits";
        let logctx = test_setup_log(TEST_NAME);

        let mut nodes = BTreeMap::new();
        for z in ["controller", "a", "b", "c", "g"] {
            let zone = zone(z);
            nodes.insert(
                zone.clone(),
                vec![
                    host(&format!("host1.{z}"), &zone, os(1)),
                    // Already past the target: not lowered.
                    host(&format!("host2.{z}"), &zone, os(3)),
                ],
            );
        }
        let target = target(48 * MINUTE);
        let policy = policy();
        let controller_zone = zone("controller");
        let input = OsUpgradeInput {
            target: &target,
            policy: &policy,
            nodes: &nodes,
            controller_zone: Some(&controller_zone),
            now: now(),
        };

        let plan = OsUpgradePlanner::new(&logctx.log, &input).plan();
        assert_eq!(
            plan.actions,
            [SetWantedOsVersion {
                zone: zone("controller"),
                nodes: vec![NodeId::new("host1.controller")],
                version: os(2),
            }]
        );
        assert_eq!(plan.overshoot, 4);
        assert_eq!(plan.progress.current_step(), Some(0));

        // The controller zone converges; both zones of the next step move.
        for node in nodes.get_mut(&zone("controller")).unwrap() {
            node.wanted_os_version = node.wanted_os_version.clone().max(os(2));
            node.current_os_version =
                node.current_os_version.clone().max(os(2));
        }
        let input = OsUpgradeInput {
            target: &target,
            policy: &policy,
            nodes: &nodes,
            controller_zone: Some(&controller_zone),
            now: now(),
        };
        let plan = OsUpgradePlanner::new(&logctx.log, &input).plan();
        let zones: Vec<_> =
            plan.actions.iter().map(|a| a.zone.clone()).collect();
        assert_eq!(zones, [zone("a"), zone("b")]);
        // gcp hosts are never touched
        assert!(plan.budgets.get(&zone("g")).is_none());

        logctx.cleanup_successful();
    }

    // Two zones upgrading in parallel share a step's budget; a host that
    // stays suspended past its zone's share is reported with how late it is.
    #[test]
    fn test_budget_exceeded() {
        const TEST_NAME: &str = "test_budget_exceeded";
        let logctx = test_setup_log(TEST_NAME);

        let policy = ZoneUpgradePolicy::builder()
            .in_cloud(CloudName::new("aws"))
            .upgrade_in_parallel([zone("a"), zone("b")])
            .build()
            .unwrap();
        let mut slow = host("slow.a", &zone("a"), os(1));
        slow.wanted_os_version = os(2);
        slow.suspended_since = Some(now() - chrono::Duration::minutes(35));
        let mut fine = host("fine.b", &zone("b"), os(1));
        fine.wanted_os_version = os(2);
        fine.suspended_since = Some(now() - chrono::Duration::minutes(5));
        let nodes = BTreeMap::from([
            (zone("a"), vec![slow]),
            (zone("b"), vec![fine]),
        ]);
        let target = target(24 * MINUTE);
        let input = OsUpgradeInput {
            target: &target,
            policy: &policy,
            nodes: &nodes,
            controller_zone: None,
            now: now(),
        };

        let plan = OsUpgradePlanner::new(&logctx.log, &input).plan();
        assert!(plan.actions.is_empty());
        assert_eq!(plan.budgets[&zone("a")], 12 * MINUTE);
        assert_eq!(
            plan.budget_exceeded,
            [BudgetExceeded {
                node: NodeId::new("slow.a"),
                zone: zone("a"),
                budget: 12 * MINUTE,
                overdue_by: 23 * MINUTE,
            }]
        );
        assert!(!plan.progress.is_done());

        logctx.cleanup_successful();
    }

    /// Budgets never add up to more than the total, the controller zone
    /// gets nothing, and zones of a step get equal shares.
    #[proptest]
    fn proptest_budget_division(
        #[strategy(proptest::collection::vec(1usize..4, 1..6))]
        step_sizes: Vec<usize>,
        #[strategy(0u64..1_000_000)] total_secs: u64,
        with_controller: bool,
    ) {
        let mut builder = ZoneUpgradePolicy::builder();
        let mut n = 0;
        for size in &step_sizes {
            let zones: Vec<_> = (0..*size)
                .map(|_| {
                    n += 1;
                    zone(&format!("zone{n}"))
                })
                .collect();
            builder = builder.upgrade_in_parallel(zones);
        }
        let policy = builder.build().unwrap();
        let controller = zone("zone1");
        let controller_zone = with_controller.then_some(&controller);
        let total = Duration::from_secs(total_secs);

        let budgets = zone_budgets(&policy, total, controller_zone);
        let sum: Duration = budgets.values().sum();
        assert!(sum <= total, "{sum:?} > {total:?}");
        if with_controller {
            assert_eq!(budgets[&controller], Duration::ZERO);
        }
        for step in policy.steps() {
            let shares: Vec<_> = step
                .zones()
                .iter()
                .filter(|z| Some(*z) != controller_zone)
                .map(|z| budgets[z])
                .collect();
            assert!(shares.windows(2).all(|w| w[0] == w[1]));
        }
    }
}
