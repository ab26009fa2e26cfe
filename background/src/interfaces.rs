// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces to the systems the control loops read from and write to
//!
//! None of these are owned by the orchestrator.  Implementations talk to the
//! node registry, the application repository, the job pipeline, and the
//! coordination store; [`crate::fakes`] has in-memory versions for tests.

use async_trait::async_trait;
use fleet_common::api::Error;
use fleet_common::ApplicationId;
use fleet_common::CloudName;
use fleet_common::Generation;
use fleet_common::NodeId;
use fleet_common::Version;
use fleet_common::ZoneId;
use fleet_types::application::Instance;
use fleet_types::change::CancelScope;
use fleet_types::change::Change;
use fleet_types::confidence::Confidence;
use fleet_types::metrics::FleetMetrics;
use fleet_types::node::ConvergenceStatus;
use fleet_types::node::Node;
use fleet_types::node::NodeFilter;
use fleet_types::os::OsRelease;
use fleet_types::os::OsVersionTarget;
use fleet_types::system::SystemApplication;
use fleet_types::system::SystemVersionRecord;
use fleet_types::version_status::ConfidenceOverrides;
use fleet_types::version_status::VersionStatus;
use fleet_upgrade_planning::throttle::ThrottleState;
use std::time::Duration;
use uuid::Uuid;

/// Nodes and the system applications running on them
#[async_trait]
pub trait NodeRegistry: Send + Sync {
    async fn list_nodes(
        &self,
        zone: &ZoneId,
        filter: &NodeFilter,
    ) -> Result<Vec<Node>, Error>;

    async fn set_wanted_version(
        &self,
        zone: &ZoneId,
        nodes: &[NodeId],
        version: &Version,
    ) -> Result<(), Error>;

    async fn set_wanted_os_version(
        &self,
        zone: &ZoneId,
        nodes: &[NodeId],
        version: &Version,
    ) -> Result<(), Error>;

    /// Returns `None` if the application has never been deployed in `zone`
    async fn convergence_status(
        &self,
        application: SystemApplication,
        zone: &ZoneId,
    ) -> Result<Option<ConvergenceStatus>, Error>;

    /// Deploys the application package of `application` for `version`
    async fn redeploy(
        &self,
        application: SystemApplication,
        zone: &ZoneId,
        version: &Version,
    ) -> Result<(), Error>;
}

/// Tenant application instances and their changes
#[async_trait]
pub trait ChangeStore: Send + Sync {
    async fn list_instances(&self) -> Result<Vec<Instance>, Error>;

    async fn get_change(
        &self,
        id: &ApplicationId,
    ) -> Result<(Change, Generation), Error>;

    /// Replaces the change of `id`, provided its generation is still
    /// `expected`
    ///
    /// Fails with [`Error::Conflict`] if it is not.  Returns the new
    /// generation.
    async fn set_change(
        &self,
        id: &ApplicationId,
        change: Change,
        expected: Generation,
    ) -> Result<Generation, Error>;

    /// Cancels part of a change, whatever its generation
    ///
    /// This is for operators; the control loops always use
    /// [`ChangeStore::set_change()`].
    async fn cancel_change(
        &self,
        id: &ApplicationId,
        scope: CancelScope,
    ) -> Result<Generation, Error>;
}

/// The deployment job pipeline
#[async_trait]
pub trait JobControl: Send + Sync {
    /// Aborts any running jobs of `id`
    async fn abort(&self, id: &ApplicationId, reason: &str)
        -> Result<(), Error>;
}

/// Transactional state shared by all controllers in a cluster
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn version_status(&self) -> Result<Option<VersionStatus>, Error>;

    /// Replaces the stored version status as a whole
    async fn put_version_status(
        &self,
        status: VersionStatus,
    ) -> Result<(), Error>;

    async fn confidence_overrides(&self) -> Result<ConfidenceOverrides, Error>;

    /// Sets or (with `None`) clears the override for `version`
    async fn set_confidence_override(
        &self,
        version: &Version,
        confidence: Option<Confidence>,
    ) -> Result<(), Error>;

    async fn system_version(
        &self,
    ) -> Result<(SystemVersionRecord, Generation), Error>;

    async fn set_system_version(
        &self,
        record: SystemVersionRecord,
        expected: Generation,
    ) -> Result<Generation, Error>;

    async fn throttle_state(&self) -> Result<ThrottleState, Error>;

    async fn set_throttle_state(
        &self,
        state: ThrottleState,
    ) -> Result<(), Error>;

    async fn os_targets(
        &self,
    ) -> Result<Vec<(OsVersionTarget, Generation)>, Error>;

    /// Writes the OS target of `target.cloud`
    ///
    /// `expected` is the generation of the target being replaced, or `None`
    /// if the cloud has no target yet.  Fails with [`Error::Conflict`] if
    /// that does not match what is stored.
    async fn set_os_target(
        &self,
        target: OsVersionTarget,
        expected: Option<Generation>,
    ) -> Result<Generation, Error>;

    /// Takes (or renews) the lease on lock `name` for `owner`
    ///
    /// Returns false if another owner holds an unexpired lease.
    async fn try_lock(
        &self,
        name: &str,
        owner: Uuid,
        ttl: Duration,
    ) -> Result<bool, Error>;

    /// Gives up `owner`'s lease on lock `name`, if it holds one
    async fn unlock(&self, name: &str, owner: Uuid) -> Result<(), Error>;
}

/// Published OS images
#[async_trait]
pub trait OsReleaseCatalog: Send + Sync {
    async fn releases(
        &self,
        cloud: &CloudName,
    ) -> Result<Vec<OsRelease>, Error>;
}

/// Where fleet metrics go
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn record(&self, metrics: &FleetMetrics) -> Result<(), Error>;
}
