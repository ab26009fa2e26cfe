// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Background task initialization
//!
//! The orchestrator's background tasks are started in two phases.  First,
//! [`BackgroundTasks::new()`] creates an [`Activator`] for each task, which
//! the operator API uses to wake tasks up after it changes something.  Then
//! [`start()`] builds each task, wires it up to its activator, and hands it
//! to a [`Driver`].

use crate::config::Config;
use crate::driver::Driver;
use crate::driver::TaskDefinition;
use crate::driver::TaskLease;
use crate::interfaces::ChangeStore;
use crate::interfaces::CoordinationStore;
use crate::interfaces::JobControl;
use crate::interfaces::MetricsSink;
use crate::interfaces::NodeRegistry;
use crate::interfaces::OsReleaseCatalog;
use crate::tasks::metrics_reporter::MetricsReporter;
use crate::tasks::os_upgrade_scheduler::OsUpgradeScheduler;
use crate::tasks::os_upgrader::OsUpgrader;
use crate::tasks::system_upgrader::SystemUpgrader;
use crate::tasks::tenant_upgrader::TenantUpgrader;
use crate::tasks::version_status::VersionStatusUpdater;
use crate::Activator;
use fleet_types::zone_policy::ZonePolicyError;
use slog::info;
use slog::Logger;
use std::sync::Arc;
use uuid::Uuid;

/// Activators for each of the orchestrator's background tasks
pub struct BackgroundTasks {
    pub task_version_status: Activator,
    pub task_tenant_upgrader: Activator,
    pub task_system_upgrader: Activator,
    pub task_os_upgrade_scheduler: Activator,
    pub task_os_upgrader: Activator,
    pub task_metrics_reporter: Activator,
}

impl BackgroundTasks {
    /// Creates activators for every task, none of them wired up yet
    pub fn new() -> BackgroundTasks {
        BackgroundTasks {
            task_version_status: Activator::new(),
            task_tenant_upgrader: Activator::new(),
            task_system_upgrader: Activator::new(),
            task_os_upgrade_scheduler: Activator::new(),
            task_os_upgrader: Activator::new(),
            task_metrics_reporter: Activator::new(),
        }
    }
}

impl Default for BackgroundTasks {
    fn default() -> Self {
        BackgroundTasks::new()
    }
}

/// Everything the background tasks need from the rest of the controller
pub struct BackgroundTasksData {
    pub changes: Arc<dyn ChangeStore>,
    pub jobs: Arc<dyn JobControl>,
    pub coordination: Arc<dyn CoordinationStore>,
    pub nodes: Arc<dyn NodeRegistry>,
    pub os_releases: Arc<dyn OsReleaseCatalog>,
    pub metrics: Arc<dyn MetricsSink>,
    pub config: Config,
    /// identifies this controller as the owner of task locks
    pub owner: Uuid,
}

/// Starts all background tasks
///
/// Returns a [`Driver`] that can be used to inspect the tasks and their
/// state.  Panics if any activator in `tasks` was already used by another
/// driver.
pub fn start(
    log: &Logger,
    tasks: &BackgroundTasks,
    data: BackgroundTasksData,
) -> Result<Driver, ZonePolicyError> {
    let config = &data.config;
    let policy = config.topology.zone_policy()?;
    let periods = &config.tasks;

    let mut driver = Driver::with_lease(
        log,
        TaskLease {
            store: Arc::clone(&data.coordination),
            owner: data.owner,
            ttl: periods.lock_ttl_secs,
        },
    );

    let version_status = VersionStatusUpdater::new(
        Arc::clone(&data.changes),
        Arc::clone(&data.coordination),
        config.confidence.clone(),
    );
    let version_status_watcher = version_status.watcher();
    driver.register(TaskDefinition {
        name: "version_status_updater",
        description: "recomputes confidence in every known platform version",
        period: periods.period_secs_version_status,
        task_impl: Box::new(version_status),
        watchers: vec![],
        activator: &tasks.task_version_status,
    });

    driver.register(TaskDefinition {
        name: "tenant_upgrader",
        description: "moves tenant instances to new platform versions, and \
            cancels changes to broken or aborted ones",
        period: periods.period_secs_tenant_upgrader,
        task_impl: Box::new(TenantUpgrader::new(
            Arc::clone(&data.changes),
            Arc::clone(&data.jobs),
            Arc::clone(&data.coordination),
            config.tenant_upgrader.clone(),
        )),
        watchers: vec![Box::new(version_status_watcher.clone())],
        activator: &tasks.task_tenant_upgrader,
    });

    driver.register(TaskDefinition {
        name: "system_upgrader",
        description: "rolls system applications zone by zone to the system \
            version target",
        period: periods.period_secs_system_upgrader,
        task_impl: Box::new(SystemUpgrader::new(
            Arc::clone(&data.nodes),
            Arc::clone(&data.coordination),
            policy.clone(),
        )),
        watchers: vec![Box::new(version_status_watcher)],
        activator: &tasks.task_system_upgrader,
    });

    driver.register(TaskDefinition {
        name: "os_upgrade_scheduler",
        description: "picks each cloud's OS version target from its releases",
        period: periods.period_secs_os_upgrade_scheduler,
        task_impl: Box::new(OsUpgradeScheduler::new(
            Arc::clone(&data.coordination),
            Arc::clone(&data.os_releases),
            policy.clouds(),
            config.os_scheduler.clone(),
            config.system.production,
        )),
        watchers: vec![],
        activator: &tasks.task_os_upgrade_scheduler,
    });

    driver.register(TaskDefinition {
        name: "os_upgrader",
        description: "rolls hosts zone by zone to their cloud's OS version \
            target",
        period: periods.period_secs_os_upgrader,
        task_impl: Box::new(OsUpgrader::new(
            Arc::clone(&data.nodes),
            Arc::clone(&data.coordination),
            policy.clone(),
            config.system.controller_zone.clone(),
        )),
        watchers: vec![],
        activator: &tasks.task_os_upgrader,
    });

    driver.register(TaskDefinition {
        name: "metrics_reporter",
        description: "publishes node change durations and version counts",
        period: periods.period_secs_metrics_reporter,
        task_impl: Box::new(MetricsReporter::new(
            data.nodes,
            data.coordination,
            data.metrics,
            policy,
        )),
        watchers: vec![],
        activator: &tasks.task_metrics_reporter,
    });

    info!(log, "started background tasks"; "owner" => %data.owner);
    Ok(driver)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fakes::FakeChangeStore;
    use crate::fakes::FakeCoordinationStore;
    use crate::fakes::FakeJobControl;
    use crate::fakes::FakeMetricsSink;
    use crate::fakes::FakeNodeRegistry;
    use crate::fakes::FakeOsReleaseCatalog;
    use crate::TaskName;
    use fleet_common::CloudName;
    use fleet_test_utils::dev::discard_log;
    use fleet_test_utils::dev::test_setup_log;
    use fleet_types::background::LastResult;
    use fleet_types::policy::UpgradePolicy;
    use fleet_types::system::SystemVersionRecord;
    use fleet_upgrade_planning::test_fixtures::instance;
    use fleet_upgrade_planning::test_fixtures::v;
    use fleet_upgrade_planning::test_fixtures::zone;
    use std::time::Duration;

    fn config() -> Config {
        let mut config: Config = toml::from_str("").unwrap();
        config.topology.steps.push(crate::config::StepConfig {
            cloud: CloudName::new("aws"),
            zones: vec![zone("us-east-1")],
        });
        config
    }

    async fn wait_for_completion(driver: &Driver, name: &TaskName) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
        while !matches!(driver.task_status(name).last, LastResult::Completed(_))
        {
            assert!(
                tokio::time::Instant::now() < deadline,
                "task {name} never completed"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_start() {
        const TEST_NAME: &str = "test_start";
        let logctx = test_setup_log(TEST_NAME);

        let changes = Arc::new(FakeChangeStore::new());
        changes.add_instance(instance("d1", UpgradePolicy::Default, 1));
        let coordination = Arc::new(FakeCoordinationStore::with_system_version(
            SystemVersionRecord::new(v(1)),
        ));
        let tasks = BackgroundTasks::new();
        let driver = start(
            &logctx.log,
            &tasks,
            BackgroundTasksData {
                changes,
                jobs: Arc::new(FakeJobControl::new()),
                coordination: coordination.clone(),
                nodes: Arc::new(FakeNodeRegistry::new()),
                os_releases: Arc::new(FakeOsReleaseCatalog::new()),
                metrics: Arc::new(FakeMetricsSink::new()),
                config: config(),
                owner: Uuid::new_v4(),
            },
        )
        .unwrap();

        let names: Vec<_> = driver.tasks().map(|t| t.as_str()).collect();
        assert_eq!(
            names,
            [
                "metrics_reporter",
                "os_upgrade_scheduler",
                "os_upgrader",
                "system_upgrader",
                "tenant_upgrader",
                "version_status_updater",
            ]
        );

        // Every task runs once at startup.
        let version_status = TaskName::new("version_status_updater");
        wait_for_completion(&driver, &version_status).await;
        let status = coordination.stored_version_status().unwrap();
        assert_eq!(status.system_version, v(1));

        // Activating through the activator runs the task again.
        let LastResult::Completed(first) =
            driver.task_status(&version_status).last
        else {
            unreachable!();
        };
        tasks.task_version_status.activate();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
        loop {
            if let LastResult::Completed(last) =
                driver.task_status(&version_status).last
            {
                if last.iteration > first.iteration {
                    break;
                }
            }
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        logctx.cleanup_successful();
    }

    #[tokio::test]
    #[should_panic(expected = "attempted to wire up the same background task")]
    async fn test_activators_are_wired_up_once() {
        let log = discard_log();
        let tasks = BackgroundTasks::new();
        let data = || BackgroundTasksData {
            changes: Arc::new(FakeChangeStore::new()),
            jobs: Arc::new(FakeJobControl::new()),
            coordination: Arc::new(FakeCoordinationStore::new()),
            nodes: Arc::new(FakeNodeRegistry::new()),
            os_releases: Arc::new(FakeOsReleaseCatalog::new()),
            metrics: Arc::new(FakeMetricsSink::new()),
            config: config(),
            owner: Uuid::new_v4(),
        };
        let _first = start(&log, &tasks, data()).unwrap();
        let _second = start(&log, &tasks, data());
    }
}
