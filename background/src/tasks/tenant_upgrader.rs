// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Background task for moving tenant instances to new platform versions

use crate::interfaces::ChangeStore;
use crate::interfaces::CoordinationStore;
use crate::interfaces::JobControl;
use crate::BackgroundTask;
use chrono::DateTime;
use chrono::Utc;
use fleet_common::api::Error;
use fleet_common::ApplicationId;
use fleet_types::background::TenantUpgraderStatus;
use fleet_upgrade_planning::tenant::PlannedChange;
use fleet_upgrade_planning::tenant::TenantUpgradeInput;
use fleet_upgrade_planning::tenant::TenantUpgradePlanner;
use fleet_upgrade_planning::tenant::TenantUpgraderConfig;
use futures::future::join_all;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::json;
use slog::debug;
use slog::error;
use slog::info;
use slog::warn;
use slog::Logger;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Background task that plans and writes tenant instance changes
///
/// Each change is written conditionally on the generation it was planned
/// from.  An instance whose change moved on in the meantime is skipped and
/// reconsidered next cycle.
pub struct TenantUpgrader {
    changes: Arc<dyn ChangeStore>,
    jobs: Arc<dyn JobControl>,
    coordination: Arc<dyn CoordinationStore>,
    config: TenantUpgraderConfig,
}

impl TenantUpgrader {
    pub fn new(
        changes: Arc<dyn ChangeStore>,
        jobs: Arc<dyn JobControl>,
        coordination: Arc<dyn CoordinationStore>,
        config: TenantUpgraderConfig,
    ) -> TenantUpgrader {
        TenantUpgrader { changes, jobs, coordination, config }
    }

    pub(crate) async fn upgrade(
        &mut self,
        log: &Logger,
        now: DateTime<Utc>,
    ) -> TenantUpgraderStatus {
        let mut status = TenantUpgraderStatus::default();

        let version_status = match self.coordination.version_status().await {
            Ok(Some(version_status)) => version_status,
            Ok(None) => {
                debug!(log, "no version status yet; nothing to do");
                return status;
            }
            Err(error) => {
                error!(log, "failed to read version status"; "error" => %error);
                status.errors.push(format!("reading version status: {error}"));
                return status;
            }
        };
        let instances = match self.changes.list_instances().await {
            Ok(instances) => instances,
            Err(error) => {
                error!(log, "failed to list instances"; "error" => %error);
                status.errors.push(format!("listing instances: {error}"));
                return status;
            }
        };
        let throttle = match self.coordination.throttle_state().await {
            Ok(throttle) => throttle,
            Err(error) => {
                error!(log, "failed to read throttle state"; "error" => %error);
                status.errors.push(format!("reading throttle state: {error}"));
                return status;
            }
        };

        let input = TenantUpgradeInput {
            instances: &instances,
            status: &version_status,
            throttle: &throttle,
            now,
        };
        let plan = TenantUpgradePlanner::new(log, &input, &self.config).plan();

        let report = &plan.report;
        status.set_aside =
            report.set_aside.iter().map(|id| id.to_string()).collect();
        status.cancelled =
            report.cancelled.iter().map(|id| id.to_string()).collect();
        status.blocked =
            report.blocked.iter().map(|id| id.to_string()).collect();
        status.throttle_cap = report.throttle_cap;
        status.throttled = report.throttled.len();

        let written =
            self.write_changes(log, &plan.changes, &mut status).await;

        // Only abort jobs of changes we actually cancelled.
        let jobs = &self.jobs;
        let aborts = plan
            .aborts
            .iter()
            .filter(|abort| written.contains(&abort.instance))
            .map(|abort| async move {
                let result = jobs.abort(&abort.instance, &abort.reason).await;
                (abort, result)
            });
        for (abort, result) in join_all(aborts).await {
            match result {
                Ok(()) => status.aborts_requested += 1,
                Err(error) => {
                    warn!(
                        log,
                        "failed to abort jobs";
                        "instance" => %abort.instance,
                        "error" => %error,
                    );
                    status.errors.push(format!(
                        "aborting jobs of {}: {error}",
                        abort.instance
                    ));
                }
            }
        }

        // The throttle only advances if the cycle got this far.
        if let Err(error) =
            self.coordination.set_throttle_state(plan.throttle).await
        {
            error!(log, "failed to store throttle state"; "error" => %error);
            status.errors.push(format!("storing throttle state: {error}"));
        }

        info!(
            log,
            "tenant upgrade cycle complete";
            "changes_set" => status.changes_set.len(),
            "conflicts" => status.conflicts.len(),
            "aborts_requested" => status.aborts_requested,
            "throttled" => status.throttled,
        );
        status
    }

    /// Writes the planned changes, returning the instances whose change was
    /// written
    async fn write_changes(
        &self,
        log: &Logger,
        changes: &[PlannedChange],
        status: &mut TenantUpgraderStatus,
    ) -> BTreeSet<ApplicationId> {
        let writes = changes.iter().map(|planned| async move {
            let result = self
                .changes
                .set_change(
                    &planned.instance,
                    planned.change.clone(),
                    planned.expected,
                )
                .await;
            (planned, result)
        });

        let mut written = BTreeSet::new();
        for (planned, result) in join_all(writes).await {
            match result {
                Ok(generation) => {
                    debug!(
                        log,
                        "change written";
                        "instance" => %planned.instance,
                        "change" => %planned.change,
                        "generation" => %generation,
                    );
                    status.changes_set.push(format!(
                        "{}: {}",
                        planned.instance, planned.change
                    ));
                    written.insert(planned.instance.clone());
                }
                Err(Error::Conflict { message }) => {
                    info!(
                        log,
                        "change moved on while planning; retrying next cycle";
                        "instance" => %planned.instance,
                        "message" => message,
                    );
                    status.conflicts.push(planned.instance.to_string());
                }
                Err(error) => {
                    error!(
                        log,
                        "failed to write change";
                        "instance" => %planned.instance,
                        "error" => %error,
                    );
                    status.errors.push(format!(
                        "writing change of {}: {error}",
                        planned.instance
                    ));
                }
            }
        }
        written
    }
}

impl BackgroundTask for TenantUpgrader {
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
    use crate::fakes::FakeChangeStore;
    use crate::fakes::FakeCoordinationStore;
    use crate::fakes::FakeJobControl;
    use fleet_common::Generation;
    use fleet_test_utils::dev::test_setup_log;
    use fleet_types::change::Change;
    use fleet_types::confidence::Confidence;
    use fleet_types::policy::UpgradePolicy;
    use fleet_upgrade_planning::test_fixtures::instance;
    use fleet_upgrade_planning::test_fixtures::now;
    use fleet_upgrade_planning::test_fixtures::v;
    use fleet_upgrade_planning::test_fixtures::version_status;
    use fleet_upgrade_planning::throttle::ThrottleState;

    struct Harness {
        changes: Arc<FakeChangeStore>,
        jobs: Arc<FakeJobControl>,
        coordination: Arc<FakeCoordinationStore>,
        task: TenantUpgrader,
    }

    fn harness() -> Harness {
        let changes = Arc::new(FakeChangeStore::new());
        let jobs = Arc::new(FakeJobControl::new());
        let coordination = Arc::new(FakeCoordinationStore::new());
        let task = TenantUpgrader::new(
            changes.clone(),
            jobs.clone(),
            coordination.clone(),
            TenantUpgraderConfig::default(),
        );
        Harness { changes, jobs, coordination, task }
    }

    #[tokio::test]
    async fn test_upgrades_and_cancels() {
        const TEST_NAME: &str = "test_upgrades_and_cancels";
        let logctx = test_setup_log(TEST_NAME);
        let mut h = harness();

        let upgrading = instance("d1", UpgradePolicy::Default, 1);
        let mut cancelled = instance("d2", UpgradePolicy::Default, 1);
        cancelled.change = Change::of_platform(v(3));
        h.changes.add_instance(upgrading.clone());
        h.changes.add_instance(cancelled.clone());
        h.coordination
            .put_version_status(version_status(
                3,
                &[
                    (1, Confidence::Normal),
                    (2, Confidence::Normal),
                    (3, Confidence::Broken),
                ],
            ))
            .await
            .unwrap();
        let earlier = now() - chrono::Duration::minutes(10);
        h.coordination
            .set_throttle_state(ThrottleState {
                last_run: Some(earlier),
                carry: 0.0,
            })
            .await
            .unwrap();

        let status = h.task.upgrade(&logctx.log, now()).await;
        assert!(status.errors.is_empty(), "{:?}", status.errors);
        assert_eq!(status.cancelled, vec![cancelled.id.to_string()]);
        assert_eq!(status.aborts_requested, 1);
        assert_eq!(status.changes_set.len(), 2);

        // Both are now headed for the newest version with normal
        // confidence.
        for id in [&upgrading.id, &cancelled.id] {
            let stored = h.changes.instance(id).unwrap();
            assert_eq!(stored.change.platform, Some(v(2)));
            assert_eq!(stored.change_generation, Generation::new().next());
        }
        let aborted = h.jobs.aborted();
        assert_eq!(aborted.len(), 1);
        assert_eq!(aborted[0].0, cancelled.id);

        // The throttle moved forward.
        assert_eq!(h.coordination.stored_throttle().last_run, Some(now()));

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_conflicting_write_is_skipped() {
        const TEST_NAME: &str = "test_conflicting_write_is_skipped";
        let logctx = test_setup_log(TEST_NAME);
        let h = harness();

        let mut raced = instance("d1", UpgradePolicy::Default, 1);
        raced.change = Change::of_platform(v(3));
        let plain = instance("d2", UpgradePolicy::Default, 1);
        h.changes.add_instance(raced.clone());
        h.changes.add_instance(plain.clone());

        // The operator changes `raced` between planning and writing.
        h.changes.update_instance(&raced.id, |i| {
            i.change = Change::of_platform(v(4));
            i.change_generation = i.change_generation.next();
        });

        let planned = [&raced, &plain].map(|i| PlannedChange {
            instance: i.id.clone(),
            change: Change::of_platform(v(2)),
            expected: i.change_generation,
            reasons: Vec::new(),
        });
        let mut status = TenantUpgraderStatus::default();
        let written =
            h.task.write_changes(&logctx.log, &planned, &mut status).await;

        assert_eq!(written, BTreeSet::from([plain.id.clone()]));
        assert_eq!(status.conflicts, vec![raced.id.to_string()]);
        assert!(status.errors.is_empty());
        // The operator's change stands.
        assert_eq!(
            h.changes.instance(&raced.id).unwrap().change,
            Change::of_platform(v(4))
        );

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_waits_for_version_status() {
        const TEST_NAME: &str = "test_waits_for_version_status";
        let logctx = test_setup_log(TEST_NAME);
        let mut h = harness();
        h.changes.add_instance(instance("d1", UpgradePolicy::Default, 1));

        let status = h.task.upgrade(&logctx.log, now()).await;
        assert_eq!(status, TenantUpgraderStatus::default());
        assert_eq!(h.coordination.stored_throttle().last_run, None);

        logctx.cleanup_successful();
    }
}
