// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Decides when a cloud's hosts move to a new OS release
//!
//! Each release channel has its own rule:
//!
//! - `stable` releases are adopted as soon as they are published;
//! - `calendar` releases are adopted only inside the trigger window, and
//!   only once the current target has expired; a target without an expiry
//!   (manual, stable or latest) does not hold them back.  The new target
//!   expires a fixed period after the release date;
//! - `latest` releases are only adopted by non-production systems, once they
//!   have been out for the cooldown period.
//!
//! Whatever the channel, a target is only ever replaced by a newer version.

use chrono::DateTime;
use chrono::NaiveTime;
use chrono::Utc;
use fleet_common::CloudName;
use fleet_types::os::OsRelease;
use fleet_types::os::OsVersionTarget;
use fleet_types::os::ReleaseTag;
use fleet_types::os::TargetSource;
use fleet_types::window::TimeWindow;
use serde::Deserialize;
use serde::Serialize;
use serde_with::serde_as;
use serde_with::DurationSeconds;
use slog::debug;
use slog::info;
use slog::Logger;
use std::time::Duration;

#[serde_as]
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct OsSchedulerConfig {
    /// how long after its release date a calendar release stays the target
    #[serde_as(as = "DurationSeconds<u64>")]
    pub calendar_validity_secs: Duration,
    /// how long a `latest` release must have been out before it is adopted
    #[serde_as(as = "DurationSeconds<u64>")]
    pub latest_cooldown_secs: Duration,
    /// when calendar releases may be scheduled (any time, if unset)
    pub trigger_window: Option<TimeWindow>,
    /// total upgrade budget given to new targets
    #[serde_as(as = "DurationSeconds<u64>")]
    pub upgrade_budget_secs: Duration,
}

impl Default for OsSchedulerConfig {
    fn default() -> Self {
        OsSchedulerConfig {
            calendar_validity_secs: Duration::from_secs(45 * 24 * 3600),
            latest_cooldown_secs: Duration::from_secs(24 * 3600),
            trigger_window: None,
            upgrade_budget_secs: Duration::from_secs(12 * 3600),
        }
    }
}

pub struct ScheduleInput<'a> {
    pub cloud: &'a CloudName,
    pub current: Option<&'a OsVersionTarget>,
    pub releases: &'a [OsRelease],
    pub now: DateTime<Utc>,
    /// whether this system serves production traffic
    pub production: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", content = "target", rename_all = "snake_case")]
pub enum ScheduleDecision {
    Keep,
    Replace(OsVersionTarget),
}

/// A release we could move to, and when the resulting target would expire
struct Candidate<'a> {
    release: &'a OsRelease,
    expires_at: Option<DateTime<Utc>>,
}

pub fn schedule(
    log: &Logger,
    input: &ScheduleInput<'_>,
    config: &OsSchedulerConfig,
) -> ScheduleDecision {
    let now = input.now;
    let calendar_due = input
        .current
        .map_or(true, |t| t.expires_at.is_none() || t.is_expired(now))
        && config.trigger_window.as_ref().map_or(true, |w| w.includes(now));
    let cooled_down = |release: &OsRelease| {
        chrono::Duration::from_std(config.latest_cooldown_secs)
            .map_or(false, |cooldown| {
                now.signed_duration_since(release.published_at) >= cooldown
            })
    };

    let candidates = input
        .releases
        .iter()
        .filter(|release| release.published_at <= now)
        .filter_map(|release| match release.tag {
            ReleaseTag::Stable => Some(Candidate { release, expires_at: None }),
            ReleaseTag::Calendar if calendar_due => {
                let expires_at = calendar_expiry(release, config);
                // Already past its validity: not worth scheduling.
                if expires_at.map_or(false, |e| e <= now) {
                    return None;
                }
                Some(Candidate { release, expires_at })
            }
            ReleaseTag::Latest if !input.production && cooled_down(release) => {
                Some(Candidate { release, expires_at: None })
            }
            ReleaseTag::Calendar | ReleaseTag::Latest => None,
        });

    let Some(best) = candidates.max_by(|a, b| {
        a.release.version.cmp(&b.release.version)
    }) else {
        debug!(log, "no eligible release"; "cloud" => %input.cloud);
        return ScheduleDecision::Keep;
    };

    if let Some(current) = input.current {
        if best.release.version <= current.version {
            debug!(
                log,
                "keeping target";
                "cloud" => %input.cloud,
                "target" => %current.version,
                "best_release" => %best.release.version,
            );
            return ScheduleDecision::Keep;
        }
    }

    info!(
        log,
        "scheduling OS upgrade";
        "cloud" => %input.cloud,
        "version" => %best.release.version,
        "tag" => %best.release.tag,
        "previous" => ?input.current.map(|t| t.version.to_string()),
    );
    ScheduleDecision::Replace(OsVersionTarget {
        cloud: input.cloud.clone(),
        version: best.release.version.clone(),
        upgrade_budget: config.upgrade_budget_secs,
        source: TargetSource::Scheduled,
        scheduled_at: now,
        expires_at: best.expires_at,
    })
}

/// Calendar releases expire a fixed period after the date in their version,
/// or after publication if the version carries no date
fn calendar_expiry(
    release: &OsRelease,
    config: &OsSchedulerConfig,
) -> Option<DateTime<Utc>> {
    let released = release
        .version
        .calendar_date()
        .map(|date| date.and_time(NaiveTime::MIN).and_utc())
        .unwrap_or(release.published_at);
    let validity = chrono::Duration::from_std(config.calendar_validity_secs)
        .ok()?;
    released.checked_add_signed(validity)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_fixtures::now;
    use fleet_common::Version;
    use fleet_test_utils::dev::test_setup_log;

    fn release(
        version: Version,
        tag: ReleaseTag,
        days_ago: i64,
    ) -> OsRelease {
        OsRelease {
            version,
            tag,
            published_at: now() - chrono::Duration::days(days_ago),
        }
    }

    /// `9.<YYYYMMDD>.0`
    fn calendar(date: u32) -> Version {
        Version::new(9, date, 0)
    }

    fn target(version: Version, source: TargetSource) -> OsVersionTarget {
        OsVersionTarget {
            cloud: CloudName::new("aws"),
            version,
            upgrade_budget: Duration::from_secs(3600),
            source,
            scheduled_at: now() - chrono::Duration::days(30),
            expires_at: None,
        }
    }

    fn decide(
        log: &Logger,
        current: Option<&OsVersionTarget>,
        releases: &[OsRelease],
        production: bool,
        config: &OsSchedulerConfig,
    ) -> ScheduleDecision {
        let cloud = CloudName::new("aws");
        let input = ScheduleInput {
            cloud: &cloud,
            current,
            releases,
            now: now(),
            production,
        };
        schedule(log, &input, config)
    }

    #[test]
    fn test_stable_adopted_immediately() {
        const TEST_NAME: &str = "test_stable_adopted_immediately";
        let logctx = test_setup_log(TEST_NAME);
        let config = OsSchedulerConfig::default();

        let releases = [
            release(Version::new(9, 1, 0), ReleaseTag::Stable, 20),
            release(Version::new(9, 2, 0), ReleaseTag::Stable, 1),
            // not published yet
            release(Version::new(9, 3, 0), ReleaseTag::Stable, -1),
        ];
        let decision = decide(&logctx.log, None, &releases, true, &config);
        let ScheduleDecision::Replace(new) = decision else {
            panic!("expected a new target, found {decision:?}");
        };
        assert_eq!(new.version, Version::new(9, 2, 0));
        assert_eq!(new.source, TargetSource::Scheduled);
        assert_eq!(new.upgrade_budget, config.upgrade_budget_secs);
        assert_eq!(new.scheduled_at, now());
        assert_eq!(new.expires_at, None);

        logctx.cleanup_successful();
    }

    #[test]
    fn test_never_replaced_by_older() {
        const TEST_NAME: &str = "test_never_replaced_by_older";
        let logctx = test_setup_log(TEST_NAME);
        let config = OsSchedulerConfig::default();

        let releases =
            [release(Version::new(9, 4, 0), ReleaseTag::Stable, 1)];
        for version in [Version::new(9, 4, 0), Version::new(9, 5, 0)] {
            for source in [TargetSource::Manual, TargetSource::Scheduled] {
                let current = target(version.clone(), source);
                let decision = decide(
                    &logctx.log,
                    Some(&current),
                    &releases,
                    true,
                    &config,
                );
                assert_eq!(decision, ScheduleDecision::Keep);
            }
        }

        logctx.cleanup_successful();
    }

    #[test]
    fn test_calendar_waits_for_expiry_and_window() {
        const TEST_NAME: &str = "test_calendar_waits_for_expiry_and_window";
        let logctx = test_setup_log(TEST_NAME);

        // now() is Monday 12:00 UTC
        let config = OsSchedulerConfig {
            trigger_window: Some(
                TimeWindow::parse("mon", "8-14", "UTC").unwrap(),
            ),
            ..OsSchedulerConfig::default()
        };
        let releases = [
            release(calendar(20250101), ReleaseTag::Calendar, 61),
            release(calendar(20250301), ReleaseTag::Calendar, 2),
        ];
        let mut current = target(calendar(20250101), TargetSource::Scheduled);

        // Not expired: kept, even though a newer release is out.
        current.expires_at = Some(now() + chrono::Duration::days(1));
        assert_eq!(
            decide(&logctx.log, Some(&current), &releases, true, &config),
            ScheduleDecision::Keep
        );

        // Expired and inside the window.
        current.expires_at = Some(now() - chrono::Duration::days(1));
        let decision =
            decide(&logctx.log, Some(&current), &releases, true, &config);
        let ScheduleDecision::Replace(new) = decision else {
            panic!("expected a new target, found {decision:?}");
        };
        assert_eq!(new.version, calendar(20250301));
        // 2025-03-01 plus 45 days
        assert_eq!(
            new.expires_at.map(|t| t.date_naive().to_string()),
            Some(String::from("2025-04-15"))
        );

        // Expired, but outside the window.
        let config = OsSchedulerConfig {
            trigger_window: Some(
                TimeWindow::parse("tue-fri", "0-23", "UTC").unwrap(),
            ),
            ..OsSchedulerConfig::default()
        };
        assert_eq!(
            decide(&logctx.log, Some(&current), &releases, true, &config),
            ScheduleDecision::Keep
        );

        logctx.cleanup_successful();
    }

    #[test]
    fn test_calendar_replaces_older_manual_target() {
        const TEST_NAME: &str = "test_calendar_replaces_older_manual_target";
        let logctx = test_setup_log(TEST_NAME);
        let releases = [
            release(calendar(20250101), ReleaseTag::Calendar, 61),
            release(calendar(20250301), ReleaseTag::Calendar, 2),
        ];
        let current = target(calendar(20250101), TargetSource::Manual);
        assert_eq!(current.expires_at, None);

        let config = OsSchedulerConfig::default();
        let decision =
            decide(&logctx.log, Some(&current), &releases, true, &config);
        let ScheduleDecision::Replace(new) = decision else {
            panic!("expected a new target, found {decision:?}");
        };
        assert_eq!(new.version, calendar(20250301));
        assert_eq!(new.source, TargetSource::Scheduled);
        assert!(new.expires_at.is_some());

        // Still only inside the trigger window.
        let config = OsSchedulerConfig {
            trigger_window: Some(
                TimeWindow::parse("tue-fri", "0-23", "UTC").unwrap(),
            ),
            ..OsSchedulerConfig::default()
        };
        assert_eq!(
            decide(&logctx.log, Some(&current), &releases, true, &config),
            ScheduleDecision::Keep
        );

        // A newer manual target is kept.
        let current = target(calendar(20250401), TargetSource::Manual);
        assert_eq!(
            decide(
                &logctx.log,
                Some(&current),
                &releases,
                true,
                &OsSchedulerConfig::default()
            ),
            ScheduleDecision::Keep
        );

        logctx.cleanup_successful();
    }

    #[test]
    fn test_calendar_past_validity_is_skipped() {
        const TEST_NAME: &str = "test_calendar_past_validity_is_skipped";
        let logctx = test_setup_log(TEST_NAME);
        let config = OsSchedulerConfig::default();

        let releases =
            [release(calendar(20241201), ReleaseTag::Calendar, 92)];
        assert_eq!(
            decide(&logctx.log, None, &releases, true, &config),
            ScheduleDecision::Keep
        );

        logctx.cleanup_successful();
    }

    #[test]
    fn test_latest_only_outside_production() {
        const TEST_NAME: &str = "test_latest_only_outside_production";
        let logctx = test_setup_log(TEST_NAME);
        let config = OsSchedulerConfig::default();

        let fresh = [release(Version::new(9, 7, 0), ReleaseTag::Latest, 0)];
        let cooled = [release(Version::new(9, 7, 0), ReleaseTag::Latest, 2)];

        assert_eq!(
            decide(&logctx.log, None, &cooled, true, &config),
            ScheduleDecision::Keep
        );
        assert_eq!(
            decide(&logctx.log, None, &fresh, false, &config),
            ScheduleDecision::Keep
        );
        let decision = decide(&logctx.log, None, &cooled, false, &config);
        let ScheduleDecision::Replace(new) = decision else {
            panic!("expected a new target, found {decision:?}");
        };
        assert_eq!(new.version, Version::new(9, 7, 0));

        logctx.cleanup_successful();
    }
}
