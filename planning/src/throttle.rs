// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Rate limit on how many instances start a new platform upgrade

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use std::time::Duration;

/// Throttle bookkeeping carried from one cycle to the next
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct ThrottleState {
    /// when the last batch of upgrades was triggered
    pub last_run: Option<DateTime<Utc>>,
    /// fractional upgrade left over from previous cycles, in `[0, 1)`
    pub carry: f64,
}

/// How many upgrades one cycle may start, and the state to persist if the
/// cycle completes
#[derive(Clone, Debug, PartialEq)]
pub struct Allowance {
    pub cap: usize,
    pub next: ThrottleState,
}

/// Computes the number of new upgrades this cycle may trigger
///
/// The budget grows by `upgrades_per_minute` for each minute since the last
/// run, plus whatever fraction was left over.  The whole part is this
/// cycle's cap and the fraction carries over, so that the long-run rate
/// matches the configured rate however irregular the cycles are.  Elapsed
/// time is clamped to `[0, max_window]` so that a long pause cannot release
/// an unbounded burst.  A first run has nothing to measure from and starts
/// the clock without allowing anything.
pub fn allowance(
    state: &ThrottleState,
    now: DateTime<Utc>,
    upgrades_per_minute: f64,
    max_window: Duration,
) -> Allowance {
    let max_minutes = max_window.as_secs_f64() / 60.0;
    let elapsed_minutes = match state.last_run {
        None => 0.0,
        Some(last_run) => {
            let elapsed_ms = (now - last_run).num_milliseconds() as f64;
            (elapsed_ms / 60_000.0).clamp(0.0, max_minutes)
        }
    };
    let rate = if upgrades_per_minute.is_finite() {
        upgrades_per_minute.max(0.0)
    } else {
        0.0
    };
    let carry = if state.carry.is_finite() {
        state.carry.clamp(0.0, 1.0)
    } else {
        0.0
    };

    let budget = carry + rate * elapsed_minutes;
    let whole = budget.floor();
    Allowance {
        cap: whole as usize,
        next: ThrottleState { last_run: Some(now), carry: budget - whole },
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_fixtures::now;
    use test_strategy::proptest;

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn test_first_run_starts_the_clock() {
        let a = allowance(&ThrottleState::default(), now(), 0.5, HOUR);
        assert_eq!(a.cap, 0);
        assert_eq!(a.next.carry, 0.0);
        assert_eq!(a.next.last_run, Some(now()));

        // The budget accrues from the first run, not from before it.
        let later = now() + chrono::Duration::minutes(10);
        let a = allowance(&a.next, later, 0.5, HOUR);
        assert_eq!(a.cap, 5);
    }

    #[test]
    fn test_fraction_carries_over() {
        let mut state = ThrottleState { last_run: Some(now()), carry: 0.0 };
        let mut t = now();
        let mut total = 0;
        // One minute at 0.5/min, eight times: 4 upgrades in total.
        for _ in 0..8 {
            t += chrono::Duration::minutes(1);
            let a = allowance(&state, t, 0.5, HOUR);
            total += a.cap;
            state = a.next;
        }
        assert_eq!(total, 4);
    }

    #[test]
    fn test_clock_going_backwards() {
        let state = ThrottleState { last_run: Some(now()), carry: 0.5 };
        let a =
            allowance(&state, now() - chrono::Duration::minutes(5), 10.0, HOUR);
        assert_eq!(a.cap, 0);
        assert_eq!(a.next.carry, 0.5);
    }

    /// Across any sequence of cycles spanning `D` minutes after the first,
    /// no more than `rate * D` upgrades are allowed in total, and the carry
    /// stays a fraction.
    #[proptest]
    fn proptest_throttle_bound(
        #[strategy(0.0f64..20.0)] rate: f64,
        #[strategy(1u64..240)] max_window_minutes: u64,
        #[strategy(proptest::collection::vec(0i64..7200, 1..50))]
        gaps_secs: Vec<i64>,
    ) {
        let max_window = Duration::from_secs(max_window_minutes * 60);
        let mut state = ThrottleState::default();
        let mut t = now();
        let mut total = 0usize;
        let mut span_minutes = 0.0;
        for (i, gap) in gaps_secs.iter().enumerate() {
            if i > 0 {
                t += chrono::Duration::seconds(*gap);
                span_minutes += *gap as f64 / 60.0;
            }
            let a = allowance(&state, t, rate, max_window);
            assert!((0.0..1.0).contains(&a.next.carry));
            total += a.cap;
            state = a.next;
        }
        let bound = rate * span_minutes;
        assert!(
            total as f64 <= bound + 1e-6,
            "{total} upgrades exceed bound {bound}"
        );
    }
}
