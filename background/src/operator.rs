// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Operator requests that change what the control loops do
//!
//! Each request is checked against policy first; a request that fails the
//! checks returns [`Error::InvalidRequest`] without writing anything.  Once a
//! request has been applied, the background task it affects is activated so
//! that it takes effect without waiting for the task's next period.

use crate::init::BackgroundTasks;
use crate::interfaces::ChangeStore;
use crate::interfaces::CoordinationStore;
use crate::interfaces::JobControl;
use chrono::Utc;
use fleet_common::api::Error;
use fleet_common::ApplicationId;
use fleet_common::CloudName;
use fleet_common::Generation;
use fleet_common::Version;
use fleet_types::change::CancelScope;
use fleet_types::confidence::Confidence;
use fleet_types::os::OsVersionTarget;
use fleet_types::os::TargetSource;
use fleet_upgrade_planning::operator::validate_confidence_override;
use fleet_upgrade_planning::operator::validate_os_target;
use slog::info;
use slog::warn;
use slog::Logger;
use std::sync::Arc;
use std::time::Duration;

pub struct OperatorApi {
    log: Logger,
    changes: Arc<dyn ChangeStore>,
    jobs: Arc<dyn JobControl>,
    coordination: Arc<dyn CoordinationStore>,
    /// clouds OS targets may be set for
    clouds: Vec<CloudName>,
    tasks: Arc<BackgroundTasks>,
}

impl OperatorApi {
    pub fn new(
        log: &Logger,
        changes: Arc<dyn ChangeStore>,
        jobs: Arc<dyn JobControl>,
        coordination: Arc<dyn CoordinationStore>,
        clouds: Vec<CloudName>,
        tasks: Arc<BackgroundTasks>,
    ) -> OperatorApi {
        OperatorApi {
            log: log.new(slog::o!("component" => "OperatorApi")),
            changes,
            jobs,
            coordination,
            clouds,
            tasks,
        }
    }

    /// Forces the confidence of `version`
    pub async fn override_confidence(
        &self,
        version: &Version,
        confidence: Confidence,
    ) -> Result<(), Error> {
        let (record, _) = self.coordination.system_version().await?;
        let status =
            self.coordination.version_status().await?.ok_or_else(|| {
                Error::unavail("version status has not been computed yet")
            })?;
        validate_confidence_override(
            &record.live,
            &status,
            version,
            confidence,
        )?;

        self.coordination
            .set_confidence_override(version, Some(confidence))
            .await?;
        info!(
            self.log,
            "confidence overridden";
            "version" => %version,
            "confidence" => %confidence,
        );
        self.tasks.task_version_status.activate();
        Ok(())
    }

    /// Lets the computed confidence of `version` apply again
    pub async fn clear_confidence_override(
        &self,
        version: &Version,
    ) -> Result<(), Error> {
        self.coordination.set_confidence_override(version, None).await?;
        info!(self.log, "confidence override cleared"; "version" => %version);
        self.tasks.task_version_status.activate();
        Ok(())
    }

    /// Cancels the parts of an instance's change named by `scope`, and
    /// aborts jobs running them
    ///
    /// Unlike automatic cancellation, this applies to pinned changes too.
    pub async fn cancel_change(
        &self,
        id: &ApplicationId,
        scope: CancelScope,
    ) -> Result<Generation, Error> {
        let generation = self.changes.cancel_change(id, scope).await?;
        info!(
            self.log,
            "change cancelled";
            "instance" => %id,
            "scope" => %scope,
            "generation" => %generation,
        );

        // Dropping a pin does not stop anything that is running.
        if scope != CancelScope::Pin {
            let reason = format!("{scope} change cancelled by operator");
            if let Err(error) = self.jobs.abort(id, &reason).await {
                // The change itself is gone; the jobs will fail to find it.
                warn!(
                    self.log,
                    "failed to abort jobs of cancelled change";
                    "instance" => %id,
                    "error" => %error,
                );
            }
        }
        self.tasks.task_tenant_upgrader.activate();
        Ok(generation)
    }

    /// Sets the OS version target of `cloud` by hand
    ///
    /// Manual targets never expire, and the OS upgrade scheduler only
    /// replaces them with a newer release.
    pub async fn set_os_target(
        &self,
        cloud: &CloudName,
        version: Version,
        upgrade_budget: Duration,
    ) -> Result<OsVersionTarget, Error> {
        let target = OsVersionTarget {
            cloud: cloud.clone(),
            version,
            upgrade_budget,
            source: TargetSource::Manual,
            scheduled_at: Utc::now(),
            expires_at: None,
        };
        validate_os_target(&target, &self.clouds)?;

        let expected = self
            .coordination
            .os_targets()
            .await?
            .into_iter()
            .find(|(current, _)| current.cloud == *cloud)
            .map(|(_, generation)| generation);
        self.coordination.set_os_target(target.clone(), expected).await?;
        info!(
            self.log,
            "OS target set";
            "cloud" => %cloud,
            "version" => %target.version,
            "upgrade_budget_secs" => upgrade_budget.as_secs(),
        );
        self.tasks.task_os_upgrader.activate();
        Ok(target)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fakes::FakeChangeStore;
    use crate::fakes::FakeCoordinationStore;
    use crate::fakes::FakeJobControl;
    use assert_matches::assert_matches;
    use fleet_test_utils::dev::test_setup_log;
    use fleet_types::change::Change;
    use fleet_types::change::Pin;
    use fleet_types::policy::UpgradePolicy;
    use fleet_types::system::SystemVersionRecord;
    use fleet_upgrade_planning::test_fixtures::instance;
    use fleet_upgrade_planning::test_fixtures::v;
    use fleet_upgrade_planning::test_fixtures::version_status;

    struct Harness {
        changes: Arc<FakeChangeStore>,
        jobs: Arc<FakeJobControl>,
        coordination: Arc<FakeCoordinationStore>,
        api: OperatorApi,
    }

    fn harness(log: &Logger) -> Harness {
        let changes = Arc::new(FakeChangeStore::new());
        let jobs = Arc::new(FakeJobControl::new());
        let coordination = Arc::new(FakeCoordinationStore::with_system_version(
            SystemVersionRecord::new(v(2)),
        ));
        let api = OperatorApi::new(
            log,
            changes.clone(),
            jobs.clone(),
            coordination.clone(),
            vec![CloudName::new("aws")],
            Arc::new(BackgroundTasks::new()),
        );
        Harness { changes, jobs, coordination, api }
    }

    #[tokio::test]
    async fn test_confidence_overrides() {
        const TEST_NAME: &str = "test_confidence_overrides";
        let logctx = test_setup_log(TEST_NAME);
        let h = harness(&logctx.log);

        // Nothing to check a legacy override against yet.
        let error = h
            .api
            .override_confidence(&v(1), Confidence::Legacy)
            .await
            .unwrap_err();
        assert_matches!(error, Error::ServiceUnavailable { .. });

        h.coordination
            .put_version_status(version_status(
                2,
                &[(1, Confidence::Normal), (2, Confidence::High)],
            ))
            .await
            .unwrap();

        // The live system version cannot be aborted.
        let error = h
            .api
            .override_confidence(&v(2), Confidence::Aborted)
            .await
            .unwrap_err();
        assert_matches!(error, Error::InvalidRequest { .. });
        let overrides = h.coordination.confidence_overrides().await.unwrap();
        assert!(overrides.is_empty());

        h.api.override_confidence(&v(1), Confidence::Legacy).await.unwrap();
        h.api.override_confidence(&v(3), Confidence::Aborted).await.unwrap();
        let overrides = h.coordination.confidence_overrides().await.unwrap();
        assert_eq!(overrides.get(&v(1)), Some(&Confidence::Legacy));
        assert_eq!(overrides.get(&v(3)), Some(&Confidence::Aborted));

        h.api.clear_confidence_override(&v(1)).await.unwrap();
        let overrides = h.coordination.confidence_overrides().await.unwrap();
        assert_eq!(overrides.get(&v(1)), None);

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_cancel_change() {
        const TEST_NAME: &str = "test_cancel_change";
        let logctx = test_setup_log(TEST_NAME);
        let h = harness(&logctx.log);

        let mut pinned = instance("p1", UpgradePolicy::Default, 1);
        pinned.change = Change::of_platform(v(2)).with_pin(Pin::Pinned);
        h.changes.add_instance(pinned.clone());

        // Dropping the pin leaves the platform target and running jobs.
        h.api.cancel_change(&pinned.id, CancelScope::Pin).await.unwrap();
        let stored = h.changes.instance(&pinned.id).unwrap();
        assert_eq!(stored.change, Change::of_platform(v(2)));
        assert!(h.jobs.aborted().is_empty());

        let generation = h
            .api
            .cancel_change(&pinned.id, CancelScope::All)
            .await
            .unwrap();
        let stored = h.changes.instance(&pinned.id).unwrap();
        assert_eq!(stored.change, Change::empty());
        assert_eq!(stored.change_generation, generation);
        assert_eq!(h.jobs.aborted().len(), 1);

        let unknown = ApplicationId::new("nobody", "app", "default");
        let error =
            h.api.cancel_change(&unknown, CancelScope::All).await.unwrap_err();
        assert_matches!(error, Error::ObjectNotFound { .. });

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_set_os_target() {
        const TEST_NAME: &str = "test_set_os_target";
        let logctx = test_setup_log(TEST_NAME);
        let h = harness(&logctx.log);
        let aws = CloudName::new("aws");
        let budget = Duration::from_secs(3600);

        let error = h
            .api
            .set_os_target(&CloudName::new("azure"), v(1), budget)
            .await
            .unwrap_err();
        assert_matches!(error, Error::InvalidRequest { .. });
        let error = h
            .api
            .set_os_target(&aws, Version::EMPTY, budget)
            .await
            .unwrap_err();
        assert_matches!(error, Error::InvalidRequest { .. });
        assert!(h.coordination.os_targets().await.unwrap().is_empty());

        // Setting a target twice replaces the first one.
        h.api.set_os_target(&aws, v(1), budget).await.unwrap();
        h.api.set_os_target(&aws, v(2), budget).await.unwrap();
        let target = h.coordination.stored_os_target(&aws).unwrap();
        assert_eq!(target.version, v(2));
        assert_eq!(target.source, TargetSource::Manual);
        assert_eq!(target.expires_at, None);

        logctx.cleanup_successful();
    }
}
