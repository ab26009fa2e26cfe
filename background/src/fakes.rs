// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Test-only implementations of interfaces used by background tasks.

use crate::interfaces::ChangeStore;
use crate::interfaces::CoordinationStore;
use crate::interfaces::JobControl;
use crate::interfaces::MetricsSink;
use crate::interfaces::NodeRegistry;
use crate::interfaces::OsReleaseCatalog;
use async_trait::async_trait;
use fleet_common::api::Error;
use fleet_common::api::ResourceType;
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
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;
use uuid::Uuid;

/// A fake node registry
///
/// Nodes only converge when a test says so, with
/// [`FakeNodeRegistry::converge_all()`].
#[derive(Default)]
pub struct FakeNodeRegistry {
    inner: Mutex<FakeNodeRegistryInner>,
}

#[derive(Default)]
struct FakeNodeRegistryInner {
    nodes: BTreeMap<ZoneId, Vec<Node>>,
    convergence: BTreeMap<(SystemApplication, ZoneId), ConvergenceStatus>,
    redeployed: Vec<(SystemApplication, ZoneId, Version)>,
    unavailable: BTreeSet<ZoneId>,
}

impl FakeNodeRegistry {
    pub fn new() -> FakeNodeRegistry {
        FakeNodeRegistry::default()
    }

    pub fn add_node(&self, node: Node) {
        let mut inner = self.inner.lock().unwrap();
        inner.nodes.entry(node.zone.clone()).or_default().push(node);
    }

    pub fn nodes(&self, zone: &ZoneId) -> Vec<Node> {
        self.inner.lock().unwrap().nodes.get(zone).cloned().unwrap_or_default()
    }

    pub fn node(&self, id: &NodeId) -> Option<Node> {
        let inner = self.inner.lock().unwrap();
        inner.nodes.values().flatten().find(|n| n.id == *id).cloned()
    }

    /// Modifies a node in place
    pub fn update_node<F>(&self, id: &NodeId, f: F)
    where
        F: FnOnce(&mut Node),
    {
        let mut inner = self.inner.lock().unwrap();
        let node = inner
            .nodes
            .values_mut()
            .flatten()
            .find(|n| n.id == *id)
            .unwrap_or_else(|| panic!("no node {id}"));
        f(node);
    }

    /// Has every node run the platform and OS version it was asked to
    pub fn converge_all(&self) {
        let mut inner = self.inner.lock().unwrap();
        for node in inner.nodes.values_mut().flatten() {
            node.current_version = node.wanted_version.clone();
            if node.current_os_version < node.wanted_os_version {
                node.current_os_version = node.wanted_os_version.clone();
            }
        }
    }

    pub fn set_convergence(
        &self,
        application: SystemApplication,
        zone: &ZoneId,
        status: ConvergenceStatus,
    ) {
        self.inner
            .lock()
            .unwrap()
            .convergence
            .insert((application, zone.clone()), status);
    }

    pub fn redeployed(&self) -> Vec<(SystemApplication, ZoneId, Version)> {
        self.inner.lock().unwrap().redeployed.clone()
    }

    /// Makes every request about `zone` fail
    pub fn set_unavailable(&self, zone: &ZoneId, unavailable: bool) {
        let mut inner = self.inner.lock().unwrap();
        if unavailable {
            inner.unavailable.insert(zone.clone());
        } else {
            inner.unavailable.remove(zone);
        }
    }

    fn check_available(
        inner: &FakeNodeRegistryInner,
        zone: &ZoneId,
    ) -> Result<(), Error> {
        if inner.unavailable.contains(zone) {
            Err(Error::unavail(&format!("zone {zone} is unreachable")))
        } else {
            Ok(())
        }
    }

    fn set_wanted<F>(
        &self,
        zone: &ZoneId,
        ids: &[NodeId],
        mut f: F,
    ) -> Result<(), Error>
    where
        F: FnMut(&mut Node),
    {
        let mut inner = self.inner.lock().unwrap();
        Self::check_available(&inner, zone)?;
        let nodes = inner
            .nodes
            .get_mut(zone)
            .ok_or_else(|| Error::not_found(ResourceType::Zone, zone))?;
        for id in ids {
            let node = nodes
                .iter_mut()
                .find(|n| n.id == *id)
                .ok_or_else(|| Error::not_found(ResourceType::Node, id))?;
            f(node);
        }
        Ok(())
    }
}

#[async_trait]
impl NodeRegistry for FakeNodeRegistry {
    async fn list_nodes(
        &self,
        zone: &ZoneId,
        filter: &NodeFilter,
    ) -> Result<Vec<Node>, Error> {
        let inner = self.inner.lock().unwrap();
        Self::check_available(&inner, zone)?;
        Ok(inner
            .nodes
            .get(zone)
            .into_iter()
            .flatten()
            .filter(|n| filter.matches(n))
            .cloned()
            .collect())
    }

    async fn set_wanted_version(
        &self,
        zone: &ZoneId,
        nodes: &[NodeId],
        version: &Version,
    ) -> Result<(), Error> {
        self.set_wanted(zone, nodes, |node| {
            node.wanted_version = version.clone();
        })
    }

    async fn set_wanted_os_version(
        &self,
        zone: &ZoneId,
        nodes: &[NodeId],
        version: &Version,
    ) -> Result<(), Error> {
        self.set_wanted(zone, nodes, |node| {
            node.wanted_os_version = version.clone();
        })
    }

    async fn convergence_status(
        &self,
        application: SystemApplication,
        zone: &ZoneId,
    ) -> Result<Option<ConvergenceStatus>, Error> {
        let inner = self.inner.lock().unwrap();
        Self::check_available(&inner, zone)?;
        Ok(inner.convergence.get(&(application, zone.clone())).cloned())
    }

    /// Redeploying converges the application's config immediately
    async fn redeploy(
        &self,
        application: SystemApplication,
        zone: &ZoneId,
        version: &Version,
    ) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_available(&inner, zone)?;
        inner.redeployed.push((application, zone.clone(), version.clone()));
        let generation = Generation::new();
        inner.convergence.insert(
            (application, zone.clone()),
            ConvergenceStatus {
                deployed_version: version.clone(),
                current_generation: generation,
                wanted_generation: generation,
                services: BTreeMap::new(),
            },
        );
        Ok(())
    }
}

/// A fake change store holding instances in memory
#[derive(Default)]
pub struct FakeChangeStore {
    instances: Mutex<BTreeMap<ApplicationId, Instance>>,
}

impl FakeChangeStore {
    pub fn new() -> FakeChangeStore {
        FakeChangeStore::default()
    }

    pub fn add_instance(&self, instance: Instance) {
        self.instances
            .lock()
            .unwrap()
            .insert(instance.id.clone(), instance);
    }

    pub fn instance(&self, id: &ApplicationId) -> Option<Instance> {
        self.instances.lock().unwrap().get(id).cloned()
    }

    /// Modifies an instance in place, without touching its generation
    pub fn update_instance<F>(&self, id: &ApplicationId, f: F)
    where
        F: FnOnce(&mut Instance),
    {
        let mut instances = self.instances.lock().unwrap();
        let instance =
            instances.get_mut(id).unwrap_or_else(|| panic!("no {id}"));
        f(instance);
    }
}

#[async_trait]
impl ChangeStore for FakeChangeStore {
    async fn list_instances(&self) -> Result<Vec<Instance>, Error> {
        Ok(self.instances.lock().unwrap().values().cloned().collect())
    }

    async fn get_change(
        &self,
        id: &ApplicationId,
    ) -> Result<(Change, Generation), Error> {
        let instances = self.instances.lock().unwrap();
        let instance = instances
            .get(id)
            .ok_or_else(|| Error::not_found(ResourceType::Instance, id))?;
        Ok((instance.change.clone(), instance.change_generation))
    }

    async fn set_change(
        &self,
        id: &ApplicationId,
        change: Change,
        expected: Generation,
    ) -> Result<Generation, Error> {
        let mut instances = self.instances.lock().unwrap();
        let instance = instances
            .get_mut(id)
            .ok_or_else(|| Error::not_found(ResourceType::Instance, id))?;
        if instance.change_generation != expected {
            return Err(Error::conflict(format!(
                "change of {id} is at generation {}, not {expected}",
                instance.change_generation
            )));
        }
        instance.change = change;
        instance.change_generation = instance.change_generation.next();
        Ok(instance.change_generation)
    }

    async fn cancel_change(
        &self,
        id: &ApplicationId,
        scope: CancelScope,
    ) -> Result<Generation, Error> {
        let mut instances = self.instances.lock().unwrap();
        let instance = instances
            .get_mut(id)
            .ok_or_else(|| Error::not_found(ResourceType::Instance, id))?;
        instance.change = instance.change.cancel(scope);
        instance.change_generation = instance.change_generation.next();
        Ok(instance.change_generation)
    }
}

/// A fake job pipeline that records abort requests
#[derive(Default)]
pub struct FakeJobControl {
    aborted: Mutex<Vec<(ApplicationId, String)>>,
}

impl FakeJobControl {
    pub fn new() -> FakeJobControl {
        FakeJobControl::default()
    }

    pub fn aborted(&self) -> Vec<(ApplicationId, String)> {
        self.aborted.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobControl for FakeJobControl {
    async fn abort(
        &self,
        id: &ApplicationId,
        reason: &str,
    ) -> Result<(), Error> {
        self.aborted.lock().unwrap().push((id.clone(), reason.to_owned()));
        Ok(())
    }
}

/// A fake coordination store
///
/// The system version starts out as `SystemVersionRecord::new(EMPTY)` at
/// generation 1 unless set with [`FakeCoordinationStore::with_system_version`].
pub struct FakeCoordinationStore {
    inner: Mutex<FakeCoordinationStoreInner>,
}

struct FakeCoordinationStoreInner {
    version_status: Option<VersionStatus>,
    overrides: ConfidenceOverrides,
    system_version: (SystemVersionRecord, Generation),
    throttle: ThrottleState,
    os_targets: BTreeMap<CloudName, (OsVersionTarget, Generation)>,
    locks: BTreeMap<String, (Uuid, Instant)>,
}

impl FakeCoordinationStore {
    pub fn new() -> FakeCoordinationStore {
        FakeCoordinationStore::with_system_version(SystemVersionRecord::new(
            Version::EMPTY,
        ))
    }

    pub fn with_system_version(
        record: SystemVersionRecord,
    ) -> FakeCoordinationStore {
        FakeCoordinationStore {
            inner: Mutex::new(FakeCoordinationStoreInner {
                version_status: None,
                overrides: ConfidenceOverrides::new(),
                system_version: (record, Generation::new()),
                throttle: ThrottleState::default(),
                os_targets: BTreeMap::new(),
                locks: BTreeMap::new(),
            }),
        }
    }

    pub fn stored_version_status(&self) -> Option<VersionStatus> {
        self.inner.lock().unwrap().version_status.clone()
    }

    pub fn stored_system_version(&self) -> SystemVersionRecord {
        self.inner.lock().unwrap().system_version.0.clone()
    }

    pub fn stored_throttle(&self) -> ThrottleState {
        self.inner.lock().unwrap().throttle.clone()
    }

    pub fn stored_os_target(
        &self,
        cloud: &CloudName,
    ) -> Option<OsVersionTarget> {
        let inner = self.inner.lock().unwrap();
        inner.os_targets.get(cloud).map(|(target, _)| target.clone())
    }
}

impl Default for FakeCoordinationStore {
    fn default() -> Self {
        FakeCoordinationStore::new()
    }
}

#[async_trait]
impl CoordinationStore for FakeCoordinationStore {
    async fn version_status(&self) -> Result<Option<VersionStatus>, Error> {
        Ok(self.inner.lock().unwrap().version_status.clone())
    }

    async fn put_version_status(
        &self,
        status: VersionStatus,
    ) -> Result<(), Error> {
        self.inner.lock().unwrap().version_status = Some(status);
        Ok(())
    }

    async fn confidence_overrides(&self) -> Result<ConfidenceOverrides, Error> {
        Ok(self.inner.lock().unwrap().overrides.clone())
    }

    async fn set_confidence_override(
        &self,
        version: &Version,
        confidence: Option<Confidence>,
    ) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        match confidence {
            Some(confidence) => {
                inner.overrides.insert(version.clone(), confidence);
            }
            None => {
                inner.overrides.remove(version);
            }
        }
        Ok(())
    }

    async fn system_version(
        &self,
    ) -> Result<(SystemVersionRecord, Generation), Error> {
        Ok(self.inner.lock().unwrap().system_version.clone())
    }

    async fn set_system_version(
        &self,
        record: SystemVersionRecord,
        expected: Generation,
    ) -> Result<Generation, Error> {
        let mut inner = self.inner.lock().unwrap();
        let (_, generation) = &inner.system_version;
        if *generation != expected {
            return Err(Error::conflict(format!(
                "system version is at generation {generation}, \
                 not {expected}"
            )));
        }
        let next = generation.next();
        inner.system_version = (record, next);
        Ok(next)
    }

    async fn throttle_state(&self) -> Result<ThrottleState, Error> {
        Ok(self.inner.lock().unwrap().throttle.clone())
    }

    async fn set_throttle_state(
        &self,
        state: ThrottleState,
    ) -> Result<(), Error> {
        self.inner.lock().unwrap().throttle = state;
        Ok(())
    }

    async fn os_targets(
        &self,
    ) -> Result<Vec<(OsVersionTarget, Generation)>, Error> {
        Ok(self.inner.lock().unwrap().os_targets.values().cloned().collect())
    }

    async fn set_os_target(
        &self,
        target: OsVersionTarget,
        expected: Option<Generation>,
    ) -> Result<Generation, Error> {
        let mut inner = self.inner.lock().unwrap();
        let current = inner.os_targets.get(&target.cloud).map(|(_, g)| *g);
        if current != expected {
            return Err(Error::conflict(format!(
                "OS target of {} is at generation {current:?}, not \
                 {expected:?}",
                target.cloud
            )));
        }
        let next = current.map_or_else(Generation::new, |g| g.next());
        inner.os_targets.insert(target.cloud.clone(), (target, next));
        Ok(next)
    }

    async fn try_lock(
        &self,
        name: &str,
        owner: Uuid,
        ttl: Duration,
    ) -> Result<bool, Error> {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        if let Some((holder, expires)) = inner.locks.get(name) {
            if *holder != owner && *expires > now {
                return Ok(false);
            }
        }
        inner.locks.insert(name.to_owned(), (owner, now + ttl));
        Ok(true)
    }

    async fn unlock(&self, name: &str, owner: Uuid) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        if inner.locks.get(name).map(|(holder, _)| *holder) == Some(owner) {
            inner.locks.remove(name);
        }
        Ok(())
    }
}

/// A fake release catalog
#[derive(Default)]
pub struct FakeOsReleaseCatalog {
    releases: Mutex<BTreeMap<CloudName, Vec<OsRelease>>>,
}

impl FakeOsReleaseCatalog {
    pub fn new() -> FakeOsReleaseCatalog {
        FakeOsReleaseCatalog::default()
    }

    pub fn add_release(&self, cloud: &CloudName, release: OsRelease) {
        self.releases
            .lock()
            .unwrap()
            .entry(cloud.clone())
            .or_default()
            .push(release);
    }
}

#[async_trait]
impl OsReleaseCatalog for FakeOsReleaseCatalog {
    async fn releases(
        &self,
        cloud: &CloudName,
    ) -> Result<Vec<OsRelease>, Error> {
        Ok(self
            .releases
            .lock()
            .unwrap()
            .get(cloud)
            .cloned()
            .unwrap_or_default())
    }
}

/// A fake metrics sink that keeps everything it is given
#[derive(Default)]
pub struct FakeMetricsSink {
    recorded: Mutex<Vec<FleetMetrics>>,
}

impl FakeMetricsSink {
    pub fn new() -> FakeMetricsSink {
        FakeMetricsSink::default()
    }

    pub fn recorded(&self) -> Vec<FleetMetrics> {
        self.recorded.lock().unwrap().clone()
    }
}

#[async_trait]
impl MetricsSink for FakeMetricsSink {
    async fn record(&self, metrics: &FleetMetrics) -> Result<(), Error> {
        self.recorded.lock().unwrap().push(metrics.clone());
        Ok(())
    }
}
