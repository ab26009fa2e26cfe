// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Upgrade planning
//!
//! Each planner here is a pure function of a snapshot of fleet state, its
//! configuration and the current time.  It produces a *plan*: the changes to
//! write, the wanted versions to set and the abort requests to issue, plus a
//! report describing what it decided and why.  Planners never talk to the
//! outside world.  The control loops in `fleet-upgrade-background` read the
//! inputs, run a planner and carry out its plan.
//!
//! - [`confidence`] computes a [`fleet_types::version_status::VersionStatus`]
//!   from deployment outcomes.
//! - [`tenant`] picks platform upgrade targets for tenant instances, rate
//!   limited by [`throttle`].
//! - [`system`] rolls system applications through the zones, and [`os`] does
//!   the same for host OS versions, both using the step walker in
//!   [`rollout`].
//! - [`os_schedule`] decides when each cloud moves to a new OS release.
//! - [`metrics`] summarizes node state for reporting.
//! - [`operator`] validates operator requests before they are applied.

pub mod confidence;
pub mod metrics;
pub mod operator;
pub mod os;
pub mod os_schedule;
pub mod rollout;
pub mod system;
pub mod tenant;
pub mod throttle;

#[cfg(any(test, feature = "testing"))]
pub mod test_fixtures;
