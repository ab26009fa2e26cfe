// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Checks operator requests against policy before they are applied
//!
//! A request that fails these checks is rejected with
//! [`Error::InvalidRequest`] and nothing is written.

use fleet_common::api::Error;
use fleet_common::CloudName;
use fleet_common::Version;
use fleet_types::confidence::Confidence;
use fleet_types::os::OsVersionTarget;
use fleet_types::version_status::VersionStatus;

/// Validates forcing `version` to `confidence`
///
/// The live system version can never be aborted: the controller would be
/// asked to roll back from underneath itself.  `Legacy` is only accepted
/// once some newer version has reached high confidence, so that instances
/// on the legacy version have somewhere to go.
pub fn validate_confidence_override(
    system_version: &Version,
    status: &VersionStatus,
    version: &Version,
    confidence: Confidence,
) -> Result<(), Error> {
    if version.is_empty() {
        return Err(Error::invalid_request("version must not be empty"));
    }

    match confidence {
        Confidence::Aborted if version == system_version => {
            Err(Error::invalid_request(format!(
                "cannot abort {version}: it is the live system version"
            )))
        }
        Confidence::Legacy => {
            let superseded = status.versions.iter().any(|entry| {
                entry.version > *version && entry.confidence == Confidence::High
            });
            if superseded {
                Ok(())
            } else {
                Err(Error::invalid_request(format!(
                    "cannot mark {version} legacy: no newer version has high \
                     confidence"
                )))
            }
        }
        _ => Ok(()),
    }
}

/// Validates a manually set OS version target
pub fn validate_os_target(
    target: &OsVersionTarget,
    known_clouds: &[CloudName],
) -> Result<(), Error> {
    if target.version.is_empty() {
        return Err(Error::invalid_request("OS version must not be empty"));
    }
    if !known_clouds.contains(&target.cloud) {
        return Err(Error::invalid_request(format!(
            "unknown cloud {:?}",
            target.cloud.as_str()
        )));
    }
    Ok(())
}
