// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use chrono::NaiveDate;
use serde_with::DeserializeFromStr;
use serde_with::SerializeDisplay;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A platform or OS version: `major.minor.micro[.qualifier]`
///
/// Versions are totally ordered by their numeric components, then by
/// qualifier (compared as a string, with the empty qualifier first).
/// [`Version::EMPTY`] is the minimum of that order and stands for "unknown"
/// or "unset".
///
/// The derived ordering relies on the field order below.
#[derive(
    Clone,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    SerializeDisplay,
    DeserializeFromStr,
)]
pub struct Version {
    major: u32,
    minor: u32,
    micro: u32,
    qualifier: String,
}

impl Version {
    /// The empty version, `0.0.0`
    pub const EMPTY: Version =
        Version { major: 0, minor: 0, micro: 0, qualifier: String::new() };

    pub fn new(major: u32, minor: u32, micro: u32) -> Version {
        Version { major, minor, micro, qualifier: String::new() }
    }

    pub fn with_qualifier(
        major: u32,
        minor: u32,
        micro: u32,
        qualifier: impl Into<String>,
    ) -> Version {
        Version { major, minor, micro, qualifier: qualifier.into() }
    }

    pub fn major(&self) -> u32 {
        self.major
    }

    pub fn minor(&self) -> u32 {
        self.minor
    }

    pub fn micro(&self) -> u32 {
        self.micro
    }

    pub fn qualifier(&self) -> &str {
        &self.qualifier
    }

    pub fn is_empty(&self) -> bool {
        *self == Version::EMPTY
    }

    /// Returns the release date of a calendar-versioned release
    ///
    /// Calendar-versioned releases carry their release date as `YYYYMMDD` in
    /// the minor component, as in `8.20250301.1`.  Returns `None` for any
    /// other version.
    pub fn calendar_date(&self) -> Option<NaiveDate> {
        if self.minor < 1970_01_01 {
            return None;
        }
        let year = i32::try_from(self.minor / 1_00_00).ok()?;
        let month = (self.minor / 1_00) % 1_00;
        let day = self.minor % 1_00;
        NaiveDate::from_ymd_opt(year, month, day)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.micro)?;
        if !self.qualifier.is_empty() {
            write!(f, ".{}", self.qualifier)?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum VersionParseError {
    #[error("version {input:?} has more than four components")]
    TooManyComponents { input: String },
    #[error("version {input:?}: component {component:?} is not a number")]
    BadNumber { input: String, component: String },
    #[error("version {input:?} has an empty qualifier")]
    EmptyQualifier { input: String },
}

impl FromStr for Version {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Ok(Version::EMPTY);
        }

        let parts: Vec<&str> = s.splitn(4, '.').collect();
        let mut numbers = [0u32; 3];
        for (i, part) in parts.iter().take(3).enumerate() {
            numbers[i] = part.parse().map_err(|_| {
                VersionParseError::BadNumber {
                    input: s.to_owned(),
                    component: (*part).to_owned(),
                }
            })?;
        }

        let qualifier = match parts.get(3) {
            None => String::new(),
            Some(q) if q.is_empty() => {
                return Err(VersionParseError::EmptyQualifier {
                    input: s.to_owned(),
                });
            }
            Some(q) if q.contains('.') => {
                return Err(VersionParseError::TooManyComponents {
                    input: s.to_owned(),
                });
            }
            Some(q) => (*q).to_owned(),
        };

        Ok(Version {
            major: numbers[0],
            minor: numbers[1],
            micro: numbers[2],
            qualifier,
        })
    }
}

#[cfg(test)]
mod test {
    use super::Version;
    use super::VersionParseError;
    use chrono::NaiveDate;

    #[test]
    fn test_parse_and_display() {
        let v: Version = "8.123.4".parse().unwrap();
        assert_eq!(v, Version::new(8, 123, 4));
        assert_eq!(v.to_string(), "8.123.4");

        let v: Version = "7.1".parse().unwrap();
        assert_eq!(v, Version::new(7, 1, 0));

        let v: Version = "8.2.3.rc1".parse().unwrap();
        assert_eq!(v.qualifier(), "rc1");
        assert_eq!(v.to_string(), "8.2.3.rc1");

        assert_eq!("".parse::<Version>().unwrap(), Version::EMPTY);
        assert!(Version::EMPTY.is_empty());
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            "8.x.1".parse::<Version>(),
            Err(VersionParseError::BadNumber { .. })
        ));
        assert!(matches!(
            "8.1.1.".parse::<Version>(),
            Err(VersionParseError::EmptyQualifier { .. })
        ));
        assert!(matches!(
            "8.1.1.a.b".parse::<Version>(),
            Err(VersionParseError::TooManyComponents { .. })
        ));
    }

    #[test]
    fn test_ordering() {
        let mut versions: Vec<Version> =
            ["8.10.0", "8.2.0", "7.999.9", "8.2.0.rc1", "", "8.2.1"]
                .into_iter()
                .map(|s| s.parse().unwrap())
                .collect();
        versions.sort();
        let sorted: Vec<String> =
            versions.iter().map(|v| v.to_string()).collect();
        assert_eq!(
            sorted,
            ["0.0.0", "7.999.9", "8.2.0", "8.2.0.rc1", "8.2.1", "8.10.0"]
        );
        assert!(Version::EMPTY < Version::new(0, 0, 1));
    }

    #[test]
    fn test_calendar_date() {
        let v: Version = "8.20250301.1".parse().unwrap();
        assert_eq!(
            v.calendar_date(),
            Some(NaiveDate::from_ymd_opt(2025, 3, 1).unwrap())
        );
        assert_eq!(Version::new(8, 123, 0).calendar_date(), None);
        // Not a real date.
        assert_eq!(Version::new(8, 20251399, 0).calendar_date(), None);
    }

    #[test]
    fn test_serde_as_string() {
        let v = Version::new(8, 1, 2);
        let json = serde_json::to_string(&v).unwrap();
        assert_eq!(json, "\"8.1.2\"");
        let back: Version = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v);
    }
}
