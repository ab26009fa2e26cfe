// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Requested target state of an application instance

use fleet_common::RevisionId;
use fleet_common::Version;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;

/// Whether (and how) a change is protected from automation
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize,
)]
#[serde(tag = "pin", content = "major", rename_all = "snake_case")]
pub enum Pin {
    #[default]
    Unpinned,
    /// Automation never replaces or cancels the change.
    Pinned,
    /// Automation never cancels the change, and only replaces its platform
    /// with versions of the given major.
    PinnedToMajor(u32),
}

/// The target an application instance is being moved to
///
/// A change may name a platform version, an application revision, or both
/// (a combined upgrade).  An empty change means the instance is not moving.
#[derive(
    Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize,
)]
pub struct Change {
    pub platform: Option<Version>,
    pub revision: Option<RevisionId>,
    pub pin: Pin,
}

/// Which parts of a change to cancel
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Deserialize,
    Serialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CancelScope {
    /// The whole change.
    All,
    /// The platform target, and the pin that protects it.
    Platform,
    /// The revision target only.
    Revision,
    /// The pin only.
    Pin,
}

impl Change {
    pub fn empty() -> Change {
        Change::default()
    }

    pub fn of_platform(version: Version) -> Change {
        Change { platform: Some(version), ..Change::default() }
    }

    pub fn of_revision(revision: RevisionId) -> Change {
        Change { revision: Some(revision), ..Change::default() }
    }

    pub fn is_empty(&self) -> bool {
        self.platform.is_none() && self.revision.is_none()
    }

    pub fn is_pinned(&self) -> bool {
        matches!(self.pin, Pin::Pinned)
    }

    /// Returns whether automation may cancel any part of this change
    pub fn is_protected_from_cancellation(&self) -> bool {
        !matches!(self.pin, Pin::Unpinned)
    }

    pub fn with_platform(&self, version: Version) -> Change {
        Change { platform: Some(version), ..self.clone() }
    }

    pub fn with_revision(&self, revision: RevisionId) -> Change {
        Change { revision: Some(revision), ..self.clone() }
    }

    pub fn with_pin(&self, pin: Pin) -> Change {
        Change { pin, ..self.clone() }
    }

    /// Returns this change with the parts named by `scope` removed
    pub fn cancel(&self, scope: CancelScope) -> Change {
        match scope {
            CancelScope::All => Change::empty(),
            CancelScope::Platform => Change {
                platform: None,
                revision: self.revision,
                pin: Pin::Unpinned,
            },
            CancelScope::Revision => {
                Change { revision: None, ..self.clone() }
            }
            CancelScope::Pin => Change { pin: Pin::Unpinned, ..self.clone() },
        }
    }
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        match self.pin {
            Pin::Unpinned => (),
            Pin::Pinned => parts.push(String::from("pin")),
            Pin::PinnedToMajor(major) => {
                parts.push(format!("pin to major {major}"))
            }
        }
        if let Some(platform) = &self.platform {
            parts.push(format!("upgrade to {platform}"));
        }
        if let Some(revision) = &self.revision {
            parts.push(format!("revision {}", revision.build()));
        }
        if parts.is_empty() {
            f.write_str("no change")
        } else {
            f.write_str(&parts.join(" and "))
        }
    }
}
