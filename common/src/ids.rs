// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Identifiers for the things the orchestrator reasons about

use serde::Deserialize;
use serde::Serialize;
use serde_with::DeserializeFromStr;
use serde_with::SerializeDisplay;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Deployment environment of a zone
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Deserialize,
    Serialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Environment {
    Dev,
    Test,
    Staging,
    Perf,
    Prod,
}

impl Environment {
    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Prod)
    }
}

/// A zone: one environment in one region, written `environment.region`
#[derive(
    Clone,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    SerializeDisplay,
    DeserializeFromStr,
)]
pub struct ZoneId {
    environment: Environment,
    region: String,
}

impl ZoneId {
    pub fn new(environment: Environment, region: impl Into<String>) -> ZoneId {
        ZoneId { environment, region: region.into() }
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    pub fn region(&self) -> &str {
        &self.region
    }
}

impl fmt::Display for ZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.environment, self.region)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("invalid zone id {input:?}: expected \"environment.region\"")]
pub struct ZoneIdParseError {
    input: String,
}

impl FromStr for ZoneId {
    type Err = ZoneIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ZoneIdParseError { input: s.to_owned() };
        let (environment, region) = s.split_once('.').ok_or_else(err)?;
        if region.is_empty() {
            return Err(err());
        }
        let environment = environment.parse().map_err(|_| err())?;
        Ok(ZoneId::new(environment, region))
    }
}

/// Name of a cloud (a provider account hosting some set of zones)
#[derive(
    Clone,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Deserialize,
    Serialize,
)]
#[serde(transparent)]
pub struct CloudName(String);

impl CloudName {
    pub fn new(name: impl Into<String>) -> CloudName {
        CloudName(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CloudName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hostname of a node
#[derive(
    Clone,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Deserialize,
    Serialize,
)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(hostname: impl Into<String>) -> NodeId {
        NodeId(hostname.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Build number of an application package
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Deserialize,
    Serialize,
)]
#[serde(transparent)]
pub struct RevisionId(u64);

impl RevisionId {
    pub fn new(build: u64) -> RevisionId {
        RevisionId(build)
    }

    pub fn build(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "build {}", self.0)
    }
}

/// A tenant application instance, written `tenant:application:instance`
#[derive(
    Clone,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    SerializeDisplay,
    DeserializeFromStr,
)]
pub struct ApplicationId {
    tenant: String,
    application: String,
    instance: String,
}

impl ApplicationId {
    pub fn new(
        tenant: impl Into<String>,
        application: impl Into<String>,
        instance: impl Into<String>,
    ) -> ApplicationId {
        ApplicationId {
            tenant: tenant.into(),
            application: application.into(),
            instance: instance.into(),
        }
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    pub fn application(&self) -> &str {
        &self.application
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }
}

impl fmt::Display for ApplicationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.tenant, self.application, self.instance)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error(
    "invalid application id {input:?}: \
     expected \"tenant:application:instance\""
)]
pub struct ApplicationIdParseError {
    input: String,
}

impl FromStr for ApplicationId {
    type Err = ApplicationIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        match parts.as_slice() {
            [tenant, application, instance]
                if !tenant.is_empty()
                    && !application.is_empty()
                    && !instance.is_empty() =>
            {
                Ok(ApplicationId::new(*tenant, *application, *instance))
            }
            _ => Err(ApplicationIdParseError { input: s.to_owned() }),
        }
    }
}
