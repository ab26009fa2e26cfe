// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Walks a [`ZoneUpgradePolicy`] one step at a time

use fleet_common::ZoneId;
use fleet_types::zone_policy::ZoneUpgradePolicy;
use serde::Serialize;

/// Where a rollout stands after a walk
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RolloutProgress {
    pub steps_total: usize,
    /// steps in which every zone has finished
    pub steps_done: usize,
    /// zones of the current step that have not finished
    pub unfinished: Vec<ZoneId>,
}

impl RolloutProgress {
    pub fn is_done(&self) -> bool {
        self.steps_done == self.steps_total
    }

    /// Index of the step the rollout is waiting on, if any
    pub fn current_step(&self) -> Option<usize> {
        (!self.is_done()).then_some(self.steps_done)
    }
}

/// Visits zones step by step until a step has a zone that is not finished
///
/// `visit` is called for every zone of a step (so that all of them make
/// progress in parallel) and returns whether the zone is finished.  Zones of
/// later steps are never visited while an earlier step is unfinished.
pub fn walk<F>(policy: &ZoneUpgradePolicy, mut visit: F) -> RolloutProgress
where
    F: FnMut(&ZoneId) -> bool,
{
    let steps = policy.steps();
    let mut steps_done = 0;
    for step in steps {
        let unfinished: Vec<_> =
            step.zones().iter().filter(|zone| !visit(zone)).cloned().collect();
        if !unfinished.is_empty() {
            return RolloutProgress {
                steps_total: steps.len(),
                steps_done,
                unfinished,
            };
        }
        steps_done += 1;
    }
    RolloutProgress {
        steps_total: steps.len(),
        steps_done,
        unfinished: Vec::new(),
    }
}
