// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Background task for publishing node change durations and version counts

use crate::interfaces::CoordinationStore;
use crate::interfaces::MetricsSink;
use crate::interfaces::NodeRegistry;
use crate::BackgroundTask;
use chrono::DateTime;
use chrono::Utc;
use fleet_types::background::MetricsReporterStatus;
use fleet_types::node::NodeFilter;
use fleet_types::zone_policy::ZoneUpgradePolicy;
use fleet_upgrade_planning::metrics::compute_metrics;
use futures::future::join_all;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::json;
use slog::error;
use slog::warn;
use slog::Logger;
use std::sync::Arc;

pub struct MetricsReporter {
    nodes: Arc<dyn NodeRegistry>,
    coordination: Arc<dyn CoordinationStore>,
    sink: Arc<dyn MetricsSink>,
    policy: ZoneUpgradePolicy,
}

impl MetricsReporter {
    pub fn new(
        nodes: Arc<dyn NodeRegistry>,
        coordination: Arc<dyn CoordinationStore>,
        sink: Arc<dyn MetricsSink>,
        policy: ZoneUpgradePolicy,
    ) -> MetricsReporter {
        MetricsReporter { nodes, coordination, sink, policy }
    }

    pub(crate) async fn report(
        &mut self,
        log: &Logger,
        now: DateTime<Utc>,
    ) -> MetricsReporterStatus {
        let mut status = MetricsReporterStatus::default();

        // A missing status only loses the broken-version gauge.
        let version_status = match self.coordination.version_status().await {
            Ok(version_status) => version_status,
            Err(error) => {
                warn!(log, "failed to read version status"; "error" => %error);
                status.errors.push(format!("reading version status: {error}"));
                None
            }
        };

        // Unreachable zones are left out of this sample.
        let filter = NodeFilter::all();
        let registry = &self.nodes;
        let listings = self.policy.zones().map(|zone| {
            let filter = &filter;
            async move { (zone, registry.list_nodes(zone, filter).await) }
        });
        let mut nodes = Vec::new();
        for (zone, result) in join_all(listings).await {
            match result {
                Ok(zone_nodes) => nodes.extend(zone_nodes),
                Err(error) => {
                    warn!(
                        log,
                        "failed to list nodes";
                        "zone" => %zone,
                        "error" => %error,
                    );
                    status.errors.push(format!("{zone}: {error}"));
                }
            }
        }

        let metrics = compute_metrics(&nodes, version_status.as_ref(), now);
        status.nodes = metrics.nodes.len();
        status.broken_system_version = metrics.broken_system_version;
        if let Err(error) = self.sink.record(&metrics).await {
            error!(log, "failed to record metrics"; "error" => %error);
            status.errors.push(format!("recording metrics: {error}"));
        }
        status
    }
}

impl BackgroundTask for MetricsReporter {
    fn activate<'a>(
        &'a mut self,
        log: &'a Logger,
    ) -> BoxFuture<'a, serde_json::Value> {
        async move {
            let status = self.report(log, Utc::now()).await;
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
