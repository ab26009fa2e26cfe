// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Data model for fleet upgrade orchestration
//!
//! These types describe the state the upgrade control loops read (nodes,
//! application instances and their jobs, release catalogs) and the state they
//! produce (version status snapshots, changes, wanted versions, OS targets).
//! The decision logic itself lives in `fleet-upgrade-planning`.

pub mod application;
pub mod background;
pub mod change;
pub mod confidence;
pub mod metrics;
pub mod node;
pub mod os;
pub mod policy;
pub mod system;
pub mod version_status;
pub mod window;
pub mod zone_policy;
