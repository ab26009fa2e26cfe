// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces for parsing configuration files and working with an upgrade
//! orchestrator configuration

use camino::Utf8Path;
use camino::Utf8PathBuf;
use dropshot::ConfigLogging;
use dropshot::ConfigLoggingLevel;
use fleet_common::CloudName;
use fleet_common::ZoneId;
use fleet_types::zone_policy::ZonePolicyError;
use fleet_types::zone_policy::ZoneUpgradePolicy;
use fleet_upgrade_planning::confidence::ConfidenceThresholds;
use fleet_upgrade_planning::os_schedule::OsSchedulerConfig;
use fleet_upgrade_planning::tenant::TenantUpgraderConfig;
use serde::Deserialize;
use serde::Serialize;
use serde_with::serde_as;
use serde_with::DurationSeconds;
use slog::Logger;
use std::time::Duration;
use thiserror::Error;

/// Configuration for the upgrade orchestrator
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Config {
    /// Server-wide logging configuration.
    #[serde(default = "Config::default_log")]
    pub log: ConfigLogging,
    #[serde(default)]
    pub system: SystemConfig,
    #[serde(default)]
    pub confidence: ConfidenceThresholds,
    #[serde(default)]
    pub tenant_upgrader: TenantUpgraderConfig,
    #[serde(default)]
    pub os_scheduler: OsSchedulerConfig,
    #[serde(default)]
    pub topology: TopologyConfig,
    #[serde(default)]
    pub tasks: TasksConfig,
}

impl Config {
    /// Load a `Config` from the given TOML file
    ///
    /// The zone topology is checked as part of loading.
    pub fn from_file(path: &Utf8Path) -> Result<Config, LoadError> {
        let file_contents = std::fs::read_to_string(path)
            .map_err(|err| LoadError::Io { path: path.into(), err })?;
        let config_parsed: Config = toml::from_str(&file_contents)
            .map_err(|err| LoadError::Parse { path: path.into(), err })?;
        config_parsed
            .topology
            .zone_policy()
            .map_err(|err| LoadError::Topology { path: path.into(), err })?;
        Ok(config_parsed)
    }

    /// Builds the root logger described by the `[log]` section
    pub fn root_logger(&self, name: &str) -> Result<Logger, std::io::Error> {
        self.log.to_logger(name)
    }

    fn default_log() -> ConfigLogging {
        ConfigLogging::StderrTerminal { level: ConfigLoggingLevel::Info }
    }
}

/// Facts about the system the orchestrator runs in
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(default)]
pub struct SystemConfig {
    /// whether this system serves production traffic (non-production
    /// systems also take `latest` OS releases)
    pub production: bool,
    /// zone the controller runs in, which gets no OS upgrade budget
    pub controller_zone: Option<ZoneId>,
}

impl Default for SystemConfig {
    fn default() -> Self {
        SystemConfig { production: true, controller_zone: None }
    }
}

/// Order in which zones are upgraded
///
/// ```toml
/// [[topology.steps]]
/// cloud = "aws"
/// zones = [ "prod.us-east-1" ]
///
/// [[topology.steps]]
/// cloud = "aws"
/// zones = [ "prod.eu-west-1", "prod.ap-northeast-1" ]
/// ```
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(default)]
pub struct TopologyConfig {
    pub steps: Vec<StepConfig>,
}

/// One rollout step: zones of one cloud upgraded in parallel
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct StepConfig {
    pub cloud: CloudName,
    pub zones: Vec<ZoneId>,
}

impl TopologyConfig {
    pub fn zone_policy(&self) -> Result<ZoneUpgradePolicy, ZonePolicyError> {
        self.steps
            .iter()
            .fold(ZoneUpgradePolicy::builder(), |builder, step| {
                builder
                    .in_cloud(step.cloud.clone())
                    .upgrade_in_parallel(step.zones.iter().cloned())
            })
            .build()
    }
}

/// How often each background task runs
#[serde_as]
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(default)]
pub struct TasksConfig {
    #[serde_as(as = "DurationSeconds<u64>")]
    pub period_secs_version_status: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub period_secs_tenant_upgrader: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub period_secs_system_upgrader: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub period_secs_os_upgrader: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub period_secs_os_upgrade_scheduler: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub period_secs_metrics_reporter: Duration,
    /// how long a task's lock lasts if the controller holding it goes away
    #[serde_as(as = "DurationSeconds<u64>")]
    pub lock_ttl_secs: Duration,
}

impl Default for TasksConfig {
    fn default() -> Self {
        TasksConfig {
            period_secs_version_status: Duration::from_secs(60),
            period_secs_tenant_upgrader: Duration::from_secs(60),
            period_secs_system_upgrader: Duration::from_secs(60),
            period_secs_os_upgrader: Duration::from_secs(60),
            period_secs_os_upgrade_scheduler: Duration::from_secs(30 * 60),
            period_secs_metrics_reporter: Duration::from_secs(60),
            lock_ttl_secs: Duration::from_secs(10 * 60),
        }
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("error reading \"{path}\": {err}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("error parsing \"{path}\": {err}")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        err: toml::de::Error,
    },
    #[error("invalid topology in \"{path}\": {err}")]
    Topology {
        path: Utf8PathBuf,
        #[source]
        err: ZonePolicyError,
    },
}
