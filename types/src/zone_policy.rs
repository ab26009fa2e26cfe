// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Order in which zones take system and OS upgrades

use fleet_common::CloudName;
use fleet_common::ZoneId;
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

/// An ordered list of rollout steps
///
/// Each step is a non-empty set of zones that are upgraded in parallel.
/// Steps run strictly in order: no zone in a step is touched until every
/// zone in the previous steps has finished.  Every zone belongs to exactly
/// one cloud, which is how the OS upgrader picks the zones of the cloud it
/// is upgrading.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ZoneUpgradePolicy {
    steps: Vec<UpgradeStep>,
}

/// One step of a [`ZoneUpgradePolicy`]
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct UpgradeStep {
    zones: Vec<ZoneId>,
    clouds: BTreeMap<ZoneId, CloudName>,
}

impl UpgradeStep {
    pub fn zones(&self) -> &[ZoneId] {
        &self.zones
    }

    pub fn is_parallel(&self) -> bool {
        self.zones.len() > 1
    }

    pub fn cloud_of(&self, zone: &ZoneId) -> Option<&CloudName> {
        self.clouds.get(zone)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ZonePolicyError {
    #[error("zone {0} appears in more than one step")]
    DuplicateZone(ZoneId),
    #[error("step {0} has no zones")]
    EmptyStep(usize),
}

impl ZoneUpgradePolicy {
    pub fn builder() -> ZoneUpgradePolicyBuilder {
        ZoneUpgradePolicyBuilder {
            cloud: CloudName::new("default"),
            steps: Vec::new(),
        }
    }

    pub fn steps(&self) -> &[UpgradeStep] {
        &self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// All zones, in rollout order
    pub fn zones(&self) -> impl Iterator<Item = &ZoneId> + '_ {
        self.steps.iter().flat_map(|step| step.zones.iter())
    }

    pub fn cloud_of(&self, zone: &ZoneId) -> Option<&CloudName> {
        self.steps.iter().find_map(|step| step.cloud_of(zone))
    }

    /// Returns the policy restricted to the zones of `cloud`
    ///
    /// Steps left without zones are dropped, so the remaining steps keep
    /// their relative order.
    pub fn for_cloud(&self, cloud: &CloudName) -> ZoneUpgradePolicy {
        let steps = self
            .steps
            .iter()
            .filter_map(|step| {
                let zones: Vec<_> = step
                    .zones
                    .iter()
                    .filter(|z| step.clouds.get(*z) == Some(cloud))
                    .cloned()
                    .collect();
                if zones.is_empty() {
                    return None;
                }
                let clouds = zones
                    .iter()
                    .map(|z| (z.clone(), cloud.clone()))
                    .collect();
                Some(UpgradeStep { zones, clouds })
            })
            .collect();
        ZoneUpgradePolicy { steps }
    }

    /// Returns the same policy walked backwards, last step first
    pub fn reversed(&self) -> ZoneUpgradePolicy {
        ZoneUpgradePolicy { steps: self.steps.iter().rev().cloned().collect() }
    }

    /// Clouds with at least one zone in this policy
    pub fn clouds(&self) -> Vec<CloudName> {
        let mut clouds: Vec<_> = self
            .steps
            .iter()
            .flat_map(|step| step.clouds.values().cloned())
            .collect();
        clouds.sort();
        clouds.dedup();
        clouds
    }
}

/// Builds a [`ZoneUpgradePolicy`] step by step
///
/// Zones are attributed to the cloud most recently set with
/// [`ZoneUpgradePolicyBuilder::in_cloud()`] (initially `default`).
#[derive(Debug)]
pub struct ZoneUpgradePolicyBuilder {
    cloud: CloudName,
    steps: Vec<(Vec<ZoneId>, CloudName)>,
}

impl ZoneUpgradePolicyBuilder {
    pub fn in_cloud(mut self, cloud: CloudName) -> Self {
        self.cloud = cloud;
        self
    }

    /// Adds a step that upgrades a single zone
    pub fn upgrade(self, zone: ZoneId) -> Self {
        self.upgrade_in_parallel([zone])
    }

    /// Adds a step that upgrades all of `zones` at once
    pub fn upgrade_in_parallel<I>(mut self, zones: I) -> Self
    where
        I: IntoIterator<Item = ZoneId>,
    {
        let zones = zones.into_iter().collect();
        self.steps.push((zones, self.cloud.clone()));
        self
    }

    pub fn build(self) -> Result<ZoneUpgradePolicy, ZonePolicyError> {
        let mut seen = BTreeMap::new();
        let mut steps = Vec::with_capacity(self.steps.len());
        for (i, (zones, cloud)) in self.steps.into_iter().enumerate() {
            if zones.is_empty() {
                return Err(ZonePolicyError::EmptyStep(i));
            }
            let mut clouds = BTreeMap::new();
            for zone in &zones {
                if seen.insert(zone.clone(), i).is_some() {
                    return Err(ZonePolicyError::DuplicateZone(zone.clone()));
                }
                clouds.insert(zone.clone(), cloud.clone());
            }
            steps.push(UpgradeStep { zones, clouds });
        }
        Ok(ZoneUpgradePolicy { steps })
    }
}
