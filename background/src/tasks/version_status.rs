// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Background task for recomputing confidence in every known version

use crate::interfaces::ChangeStore;
use crate::interfaces::CoordinationStore;
use crate::BackgroundTask;
use chrono::DateTime;
use chrono::Utc;
use fleet_types::background::VersionStatusUpdaterStatus;
use fleet_types::confidence::Confidence;
use fleet_types::version_status::VersionStatus;
use fleet_upgrade_planning::confidence::compute_version_status;
use fleet_upgrade_planning::confidence::ConfidenceInput;
use fleet_upgrade_planning::confidence::ConfidenceThresholds;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::json;
use slog::error;
use slog::info;
use slog::warn;
use slog::Logger;
use std::sync::Arc;
use tokio::sync::watch;

/// Background task that computes a new [`VersionStatus`] and stores it in
/// place of the previous one
///
/// The latest status is also published on a watch channel, which changes
/// whenever some version's confidence does.  The upgraders use it to run as
/// soon as confidence moves.
pub struct VersionStatusUpdater {
    changes: Arc<dyn ChangeStore>,
    coordination: Arc<dyn CoordinationStore>,
    thresholds: ConfidenceThresholds,
    tx: watch::Sender<Option<Arc<VersionStatus>>>,
    rx: watch::Receiver<Option<Arc<VersionStatus>>>,
}

impl VersionStatusUpdater {
    pub fn new(
        changes: Arc<dyn ChangeStore>,
        coordination: Arc<dyn CoordinationStore>,
        thresholds: ConfidenceThresholds,
    ) -> VersionStatusUpdater {
        let (tx, rx) = watch::channel(None);
        VersionStatusUpdater { changes, coordination, thresholds, tx, rx }
    }

    pub fn watcher(&self) -> watch::Receiver<Option<Arc<VersionStatus>>> {
        self.rx.clone()
    }

    pub(crate) async fn update(
        &mut self,
        log: &Logger,
        now: DateTime<Utc>,
    ) -> VersionStatusUpdaterStatus {
        let mut status = VersionStatusUpdaterStatus::default();

        let instances = match self.changes.list_instances().await {
            Ok(instances) => instances,
            Err(error) => {
                error!(log, "failed to list instances"; "error" => %error);
                status.errors.push(format!("listing instances: {error}"));
                return status;
            }
        };
        let (record, _) = match self.coordination.system_version().await {
            Ok(record) => record,
            Err(error) => {
                error!(log, "failed to read system version"; "error" => %error);
                status.errors.push(format!("reading system version: {error}"));
                return status;
            }
        };
        let previous = match self.coordination.version_status().await {
            Ok(previous) => previous,
            Err(error) => {
                error!(
                    log,
                    "failed to read previous version status";
                    "error" => %error,
                );
                status.errors.push(format!("reading version status: {error}"));
                return status;
            }
        };
        let overrides = match self.coordination.confidence_overrides().await {
            Ok(overrides) => overrides,
            Err(error) => {
                error!(log, "failed to read overrides"; "error" => %error);
                status.errors.push(format!("reading overrides: {error}"));
                return status;
            }
        };

        let input = ConfidenceInput {
            instances: &instances,
            system_version: &record.live,
            system_target: &record.target,
            previous: previous.as_ref(),
            overrides: &overrides,
            thresholds: &self.thresholds,
            now,
        };
        let computed = match compute_version_status(log, &input) {
            Ok(computed) => computed,
            Err(error) => {
                error!(
                    log,
                    "failed to compute version status";
                    "error" => %error,
                );
                status.errors.push(error.to_string());
                return status;
            }
        };

        status.system_version = Some(computed.system_version.to_string());
        status.versions = computed.versions.len();
        for entry in &computed.versions {
            if entry.confidence == Confidence::Broken {
                status.broken.push(entry.version.to_string());
            }
            if entry.overridden {
                status.overridden.push(entry.version.to_string());
            }
        }

        if let Err(error) =
            self.coordination.put_version_status(computed.clone()).await
        {
            error!(log, "failed to store version status"; "error" => %error);
            status.errors.push(format!("storing version status: {error}"));
            return status;
        }

        // Overrides only apply to listed versions, so the others are stale.
        let stale = overrides
            .keys()
            .filter(|version| computed.entry(version).is_none());
        for version in stale {
            match self.coordination.set_confidence_override(version, None).await
            {
                Ok(()) => {
                    info!(
                        log,
                        "cleared override of unreferenced version";
                        "version" => %version,
                    );
                    status.overrides_cleared.push(version.to_string());
                }
                Err(error) => {
                    warn!(
                        log,
                        "failed to clear stale override";
                        "version" => %version,
                        "error" => %error,
                    );
                    status.errors.push(format!(
                        "clearing override of {version}: {error}"
                    ));
                }
            }
        }

        // Only wake up dependent tasks if some confidence moved.
        let computed = Arc::new(computed);
        self.tx.send_if_modified(|current| {
            let changed = current.as_ref().map_or(true, |current| {
                current.system_version != computed.system_version
                    || current.versions != computed.versions
            });
            if changed {
                info!(
                    log,
                    "version status changed";
                    "versions" => computed.versions.len(),
                );
                *current = Some(Arc::clone(&computed));
            }
            changed
        });
        status
    }
}

impl BackgroundTask for VersionStatusUpdater {
    fn activate<'a>(
        &'a mut self,
        log: &'a Logger,
    ) -> BoxFuture<'a, serde_json::Value> {
        async move {
            let status = self.update(log, Utc::now()).await;
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
    use fleet_test_utils::dev::test_setup_log;
    use fleet_types::application::JobType;
    use fleet_types::application::RunOutcome;
    use fleet_types::policy::UpgradePolicy;
    use fleet_types::system::SystemVersionRecord;
    use fleet_upgrade_planning::test_fixtures::instance;
    use fleet_upgrade_planning::test_fixtures::now;
    use fleet_upgrade_planning::test_fixtures::v;
    use fleet_upgrade_planning::test_fixtures::with_upgrade_run;

    #[tokio::test]
    async fn test_status_is_stored_and_published() {
        const TEST_NAME: &str = "test_status_is_stored_and_published";
        let logctx = test_setup_log(TEST_NAME);

        let changes = Arc::new(FakeChangeStore::new());
        changes.add_instance(instance("d1", UpgradePolicy::Default, 2));
        changes.add_instance(with_upgrade_run(
            instance("c1", UpgradePolicy::Canary, 2),
            JobType::SystemTest,
            3,
            RunOutcome::Failure,
        ));
        let coordination = Arc::new(FakeCoordinationStore::with_system_version(
            SystemVersionRecord::new(v(3)),
        ));
        let mut task = VersionStatusUpdater::new(
            changes.clone(),
            coordination.clone(),
            ConfidenceThresholds::default(),
        );
        let mut watcher = task.watcher();
        assert!(watcher.borrow_and_update().is_none());

        let status = task.update(&logctx.log, now()).await;
        assert!(status.errors.is_empty(), "{:?}", status.errors);
        assert_eq!(status.system_version, Some(v(3).to_string()));
        assert_eq!(status.versions, 2);
        assert_eq!(status.broken, vec![v(3).to_string()]);

        let stored = coordination.stored_version_status().unwrap();
        assert_eq!(stored.confidence(&v(3)), Some(Confidence::Broken));
        assert!(watcher.has_changed().unwrap());
        assert_eq!(
            watcher.borrow_and_update().as_ref().unwrap().versions,
            stored.versions
        );

        // Nothing moved, so dependent tasks are not woken up.
        task.update(&logctx.log, now()).await;
        assert!(!watcher.has_changed().unwrap());

        // An operator override shows up on the next cycle.
        coordination
            .set_confidence_override(&v(2), Some(Confidence::Legacy))
            .await
            .unwrap();
        let status = task.update(&logctx.log, now()).await;
        assert_eq!(status.overridden, vec![v(2).to_string()]);
        assert!(watcher.has_changed().unwrap());

        // Once nothing runs or targets a version its override is dropped.
        coordination
            .set_confidence_override(&v(7), Some(Confidence::Aborted))
            .await
            .unwrap();
        let status = task.update(&logctx.log, now()).await;
        assert!(status.errors.is_empty(), "{:?}", status.errors);
        assert_eq!(status.overrides_cleared, vec![v(7).to_string()]);
        let overrides = coordination.confidence_overrides().await.unwrap();
        assert_eq!(overrides.get(&v(7)), None);
        assert_eq!(overrides.get(&v(2)), Some(&Confidence::Legacy));
        let stored = coordination.stored_version_status().unwrap();
        assert_eq!(stored.confidence(&v(7)), None);

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_aborted_system_version_is_refused() {
        const TEST_NAME: &str = "test_aborted_system_version_is_refused";
        let logctx = test_setup_log(TEST_NAME);

        let changes = Arc::new(FakeChangeStore::new());
        let coordination = Arc::new(FakeCoordinationStore::with_system_version(
            SystemVersionRecord::new(v(3)),
        ));
        coordination
            .set_confidence_override(&v(3), Some(Confidence::Aborted))
            .await
            .unwrap();
        let mut task = VersionStatusUpdater::new(
            changes,
            coordination.clone(),
            ConfidenceThresholds::default(),
        );

        let status = task.update(&logctx.log, now()).await;
        assert_eq!(status.errors.len(), 1);
        assert!(coordination.stored_version_status().is_none());

        logctx.cleanup_successful();
    }
}
