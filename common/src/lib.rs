// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! # Fleet upgrade orchestration: common facilities
//!
//! This crate holds the small vocabulary types shared by every other crate in
//! the workspace: version numbers, the generation numbers used for
//! conditional writes, identifiers for applications, zones, clouds and nodes,
//! and the [`api::Error`] type returned across external interfaces.
//!
//! Nothing here knows about upgrade policy.  See `fleet-types` for the data
//! model and `fleet-upgrade-planning` for the decision logic.

pub mod api;
mod generation;
mod ids;
mod version;

pub use generation::Generation;
pub use ids::ApplicationId;
pub use ids::ApplicationIdParseError;
pub use ids::CloudName;
pub use ids::Environment;
pub use ids::NodeId;
pub use ids::RevisionId;
pub use ids::ZoneId;
pub use ids::ZoneIdParseError;
pub use version::Version;
pub use version::VersionParseError;
