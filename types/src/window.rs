// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Weekly time windows, evaluated in a fixed timezone

use chrono::DateTime;
use chrono::Datelike;
use chrono::Timelike;
use chrono::Utc;
use chrono::Weekday;
use chrono_tz::Tz;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

/// A recurring weekly window: a set of days crossed with a set of hours, in
/// some timezone
///
/// Whether a window includes an instant is purely a function of the
/// instant.  Days and hours are written as comma-separated items, each a
/// single value or an inclusive range that may wrap around (`fri-mon`,
/// `22-2`).
#[derive(Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(try_from = "TimeWindowSpec", into = "TimeWindowSpec")]
pub struct TimeWindow {
    spec: TimeWindowSpec,
    /// days, as `Weekday::num_days_from_monday()`
    days: BTreeSet<u32>,
    hours: BTreeSet<u32>,
    tz: Tz,
}

/// Textual form of a [`TimeWindow`], as declared by tenants and operators
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct TimeWindowSpec {
    pub days: String,
    pub hours: String,
    #[serde(default = "TimeWindowSpec::default_tz")]
    pub tz: String,
}

impl TimeWindowSpec {
    fn default_tz() -> String {
        String::from("UTC")
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum WindowParseError {
    #[error("invalid day {0:?}")]
    Day(String),
    #[error("invalid hour {0:?} (expected 0-23)")]
    Hour(String),
    #[error("unknown timezone {0:?}")]
    Timezone(String),
    #[error("window has no {0}")]
    Empty(&'static str),
}

impl TimeWindow {
    pub fn parse(
        days: &str,
        hours: &str,
        tz: &str,
    ) -> Result<TimeWindow, WindowParseError> {
        TimeWindow::try_from(TimeWindowSpec {
            days: days.to_owned(),
            hours: hours.to_owned(),
            tz: tz.to_owned(),
        })
    }

    /// Returns whether `instant` falls inside this window
    pub fn includes(&self, instant: DateTime<Utc>) -> bool {
        let local = instant.with_timezone(&self.tz);
        self.days.contains(&local.weekday().num_days_from_monday())
            && self.hours.contains(&local.hour())
    }

    pub fn spec(&self) -> &TimeWindowSpec {
        &self.spec
    }
}

impl fmt::Debug for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeWindow")
            .field("days", &self.spec.days)
            .field("hours", &self.spec.hours)
            .field("tz", &self.spec.tz)
            .finish()
    }
}

impl TryFrom<TimeWindowSpec> for TimeWindow {
    type Error = WindowParseError;

    fn try_from(spec: TimeWindowSpec) -> Result<Self, Self::Error> {
        let days = parse_items(&spec.days, 7, |s| {
            s.parse::<Weekday>()
                .map(|d| d.num_days_from_monday())
                .map_err(|_| WindowParseError::Day(s.to_owned()))
        })?;
        if days.is_empty() {
            return Err(WindowParseError::Empty("days"));
        }
        let hours = parse_items(&spec.hours, 24, |s| {
            s.parse::<u32>()
                .ok()
                .filter(|h| *h < 24)
                .ok_or_else(|| WindowParseError::Hour(s.to_owned()))
        })?;
        if hours.is_empty() {
            return Err(WindowParseError::Empty("hours"));
        }
        let tz = spec
            .tz
            .parse::<Tz>()
            .map_err(|_| WindowParseError::Timezone(spec.tz.clone()))?;
        Ok(TimeWindow { spec, days, hours, tz })
    }
}

impl From<TimeWindow> for TimeWindowSpec {
    fn from(window: TimeWindow) -> Self {
        window.spec
    }
}

/// Parses `a,b-c,...` into the set of values it names, in a cyclic domain of
/// `modulus` values (so `c < b` wraps around).
fn parse_items<F>(
    input: &str,
    modulus: u32,
    parse_one: F,
) -> Result<BTreeSet<u32>, WindowParseError>
where
    F: Fn(&str) -> Result<u32, WindowParseError>,
{
    let mut values = BTreeSet::new();
    for item in input.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        match item.split_once('-') {
            None => {
                values.insert(parse_one(item)?);
            }
            Some((start, end)) => {
                let start = parse_one(start.trim())?;
                let end = parse_one(end.trim())?;
                let mut value = start;
                loop {
                    values.insert(value);
                    if value == end {
                        break;
                    }
                    value = (value + 1) % modulus;
                }
            }
        }
    }
    Ok(values)
}

/// A declared window during which an instance must not start changes
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct BlockChange {
    /// whether application revision changes are blocked
    pub revision: bool,
    /// whether platform version changes are blocked
    pub version: bool,
    pub window: TimeWindow,
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_ranges() {
        let w = TimeWindow::parse("mon-wed,fri", "0-2,23", "UTC").unwrap();
        assert_eq!(w.days, BTreeSet::from([0, 1, 2, 4]));
        assert_eq!(w.hours, BTreeSet::from([0, 1, 2, 23]));

        let w = TimeWindow::parse("sat-mon", "22-1", "UTC").unwrap();
        assert_eq!(w.days, BTreeSet::from([5, 6, 0]));
        assert_eq!(w.hours, BTreeSet::from([22, 23, 0, 1]));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            TimeWindow::parse("funday", "1", "UTC").unwrap_err(),
            WindowParseError::Day(String::from("funday"))
        );
        assert_eq!(
            TimeWindow::parse("mon", "24", "UTC").unwrap_err(),
            WindowParseError::Hour(String::from("24"))
        );
        assert_eq!(
            TimeWindow::parse("mon", "1", "Mars/Olympus").unwrap_err(),
            WindowParseError::Timezone(String::from("Mars/Olympus"))
        );
        assert_eq!(
            TimeWindow::parse("", "1", "UTC").unwrap_err(),
            WindowParseError::Empty("days")
        );
    }

    #[test]
    fn test_includes_uses_window_timezone() {
        // Monday 2025-03-03 07:30 UTC is 08:30 in Oslo (CET, UTC+1).
        let instant = Utc.with_ymd_and_hms(2025, 3, 3, 7, 30, 0).unwrap();

        let oslo = TimeWindow::parse("mon", "8", "Europe/Oslo").unwrap();
        assert!(oslo.includes(instant));

        let utc = TimeWindow::parse("mon", "8", "UTC").unwrap();
        assert!(!utc.includes(instant));

        // Sunday 23:30 UTC is already Monday in Tokyo.
        let instant = Utc.with_ymd_and_hms(2025, 3, 2, 23, 30, 0).unwrap();
        let tokyo = TimeWindow::parse("mon", "8", "Asia/Tokyo").unwrap();
        assert!(tokyo.includes(instant));
    }

    #[test]
    fn test_serde_roundtrip_keeps_text() {
        let json = r#"{"days":"mon-fri","hours":"0-8","tz":"Europe/Oslo"}"#;
        let window: TimeWindow = serde_json::from_str(json).unwrap();
        assert_eq!(window.spec().days, "mon-fri");
        assert_eq!(serde_json::to_string(&window).unwrap(), json);

        let bad = r#"{"days":"mon","hours":"99"}"#;
        assert!(serde_json::from_str::<TimeWindow>(bad).is_err());
    }
}
