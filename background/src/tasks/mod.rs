// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Implementations of specific background tasks

pub mod metrics_reporter;
pub mod os_upgrade_scheduler;
pub mod os_upgrader;
pub mod system_upgrader;
pub mod tenant_upgrader;
pub mod version_status;
