// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Background task for choosing each cloud's OS version target

use crate::interfaces::CoordinationStore;
use crate::interfaces::OsReleaseCatalog;
use crate::BackgroundTask;
use chrono::DateTime;
use chrono::Utc;
use fleet_common::CloudName;
use fleet_types::background::OsUpgradeSchedulerStatus;
use fleet_upgrade_planning::os_schedule;
use fleet_upgrade_planning::os_schedule::OsSchedulerConfig;
use fleet_upgrade_planning::os_schedule::ScheduleDecision;
use fleet_upgrade_planning::os_schedule::ScheduleInput;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::json;
use slog::error;
use slog::info;
use slog::o;
use slog::Logger;
use std::collections::BTreeMap;
use std::sync::Arc;

pub struct OsUpgradeScheduler {
    coordination: Arc<dyn CoordinationStore>,
    catalog: Arc<dyn OsReleaseCatalog>,
    clouds: Vec<CloudName>,
    config: OsSchedulerConfig,
    production: bool,
}

impl OsUpgradeScheduler {
    pub fn new(
        coordination: Arc<dyn CoordinationStore>,
        catalog: Arc<dyn OsReleaseCatalog>,
        clouds: Vec<CloudName>,
        config: OsSchedulerConfig,
        production: bool,
    ) -> OsUpgradeScheduler {
        OsUpgradeScheduler { coordination, catalog, clouds, config, production }
    }

    pub(crate) async fn schedule(
        &mut self,
        log: &Logger,
        now: DateTime<Utc>,
    ) -> OsUpgradeSchedulerStatus {
        let mut status = OsUpgradeSchedulerStatus::default();

        let targets = match self.coordination.os_targets().await {
            Ok(targets) => targets
                .into_iter()
                .map(|(target, generation)| {
                    (target.cloud.clone(), (target, generation))
                })
                .collect::<BTreeMap<_, _>>(),
            Err(error) => {
                error!(log, "failed to read OS targets"; "error" => %error);
                status.errors.push(format!("reading OS targets: {error}"));
                return status;
            }
        };

        for cloud in &self.clouds {
            let log = log.new(o!("cloud" => cloud.to_string()));
            let releases = match self.catalog.releases(cloud).await {
                Ok(releases) => releases,
                Err(error) => {
                    error!(
                        log,
                        "failed to list OS releases";
                        "error" => %error,
                    );
                    status.errors.push(format!("{cloud}: {error}"));
                    continue;
                }
            };
            let current = targets.get(cloud);
            let input = ScheduleInput {
                cloud,
                current: current.map(|(target, _)| target),
                releases: &releases,
                now,
                production: self.production,
            };
            let decision = os_schedule::schedule(&log, &input, &self.config);
            let target = match decision {
                ScheduleDecision::Keep => {
                    status.unchanged.push(cloud.to_string());
                    continue;
                }
                ScheduleDecision::Replace(target) => target,
            };

            // Conditional on the target we read, so a concurrent operator
            // change wins.
            let version = target.version.clone();
            let expected = current.map(|(_, generation)| *generation);
            match self.coordination.set_os_target(target, expected).await {
                Ok(_) => {
                    info!(log, "scheduled OS upgrade"; "version" => %version);
                    status.scheduled.push(format!("{cloud}: {version}"));
                }
                Err(error) => {
                    error!(log, "failed to store OS target"; "error" => %error);
                    status.errors.push(format!("{cloud}: {error}"));
                }
            }
        }
        status
    }
}

impl BackgroundTask for OsUpgradeScheduler {
    fn activate<'a>(
        &'a mut self,
        log: &'a Logger,
    ) -> BoxFuture<'a, serde_json::Value> {
        async move {
            let status = self.schedule(log, Utc::now()).await;
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
