use std::str::FromStr;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use cron::Schedule;

use flywheel_core::config::TriggerSpec;

use crate::error::{Result, SchedulerError};
use crate::types::{CycleGranularity, Trigger};

/// Parse the canonical timezone name (IANA, e.g. "Europe/Kyiv").
pub fn parse_timezone(name: &str) -> Result<Tz> {
    name.parse::<Tz>()
        .map_err(|_| SchedulerError::InvalidTimezone(name.to_string()))
}

/// Build a runtime trigger from its declarative spec.
///
/// Classic 5-field cron expressions (`min hour dom month dow`) are accepted
/// by prefixing a zero seconds field; 6- and 7-field forms pass through
/// unchanged.
pub fn parse_trigger(id: &str, spec: &TriggerSpec) -> Result<Trigger> {
    match spec {
        TriggerSpec::Cron { expression } => {
            let normalized = normalize_cron(expression);
            let schedule =
                Schedule::from_str(&normalized).map_err(|e| SchedulerError::InvalidTrigger {
                    id: id.to_string(),
                    reason: e.to_string(),
                })?;
            Ok(Trigger::Cron {
                schedule,
                source: expression.clone(),
            })
        }
        TriggerSpec::Interval { every_secs } => {
            if *every_secs == 0 {
                return Err(SchedulerError::InvalidTrigger {
                    id: id.to_string(),
                    reason: "interval must be at least one second".to_string(),
                });
            }
            Ok(Trigger::Interval {
                every: StdDuration::from_secs(*every_secs),
            })
        }
    }
}

fn normalize_cron(expression: &str) -> String {
    let trimmed = expression.trim();
    if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    }
}

/// First fire time for a newly registered trigger.
///
/// Interval triggers are due immediately: the reference instant becomes the
/// anchor of the period grid. Cron triggers fire at the next matching
/// wall-clock time after `reference`; with catch-up the caller passes a
/// reference earlier than now, so a fire inside the window becomes due at
/// the first tick.
pub fn initial_fire(trigger: &Trigger, tz: Tz, reference: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match trigger {
        Trigger::Interval { .. } => Some(reference),
        Trigger::Cron { schedule, .. } => next_cron_fire(schedule, tz, reference),
    }
}

/// Advance a due trigger past `now`.
///
/// Returns `(fired, upcoming)`: the most recent slot at or before `now`
/// (several missed slots coalesce into the latest one) and the first slot
/// strictly after `now`. `next` must be the stored next-fire time and is
/// expected to be `<= now`; a future `next` fires nothing.
pub fn advance(
    trigger: &Trigger,
    tz: Tz,
    next: DateTime<Utc>,
    now: DateTime<Utc>,
) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
    if next > now {
        return (None, Some(next));
    }
    match trigger {
        Trigger::Interval { every } => {
            let period_ms = every.as_millis() as i64;
            if period_ms <= 0 {
                return (Some(next), None);
            }
            let elapsed_ms = now.signed_duration_since(next).num_milliseconds();
            // Latest k with next + k * period <= now; k = 0 in the steady case.
            let k = elapsed_ms / period_ms;
            let fired = next + Duration::milliseconds(k * period_ms);
            let upcoming = fired + Duration::milliseconds(period_ms);
            (Some(fired), Some(upcoming))
        }
        Trigger::Cron { schedule, .. } => {
            let mut fired = next;
            let mut upcoming = next_cron_fire(schedule, tz, fired);
            while let Some(candidate) = upcoming {
                if candidate > now {
                    break;
                }
                fired = candidate;
                upcoming = next_cron_fire(schedule, tz, candidate);
            }
            (Some(fired), upcoming)
        }
    }
}

fn next_cron_fire(schedule: &Schedule, tz: Tz, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let local = after.with_timezone(&tz);
    schedule
        .after(&local)
        .next()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Cycle key scoping a fire for dependency correlation.
///
/// Day/hour/minute keys are formatted in the canonical timezone (a daily
/// job's cycle is the bot's local date); exact keys use the UTC instant.
pub fn cycle_key(granularity: CycleGranularity, fire: DateTime<Utc>, tz: Tz) -> String {
    let local = fire.with_timezone(&tz);
    match granularity {
        CycleGranularity::Exact => fire.to_rfc3339(),
        CycleGranularity::Minute => local.format("%Y-%m-%dT%H:%M").to_string(),
        CycleGranularity::Hour => local.format("%Y-%m-%dT%H").to_string(),
        CycleGranularity::Day => local.format("%Y-%m-%d").to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono_tz::UTC;
    use flywheel_core::config::TriggerSpec;
    use proptest::prelude::*;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn five_field_cron_is_normalized_and_parses() {
        let trigger = parse_trigger(
            "daily_report",
            &TriggerSpec::Cron {
                expression: "0 9 * * *".to_string(),
            },
        )
        .unwrap();
        match trigger {
            Trigger::Cron { source, .. } => assert_eq!(source, "0 9 * * *"),
            other => panic!("expected cron trigger, got {other:?}"),
        }
    }

    #[test]
    fn six_field_cron_parses_verbatim() {
        assert!(parse_trigger(
            "tick",
            &TriggerSpec::Cron {
                expression: "*/30 * * * * *".to_string(),
            },
        )
        .is_ok());
    }

    #[test]
    fn malformed_cron_names_the_job() {
        let err = parse_trigger(
            "bad",
            &TriggerSpec::Cron {
                expression: "not a cron".to_string(),
            },
        )
        .unwrap_err();
        match err {
            SchedulerError::InvalidTrigger { id, .. } => assert_eq!(id, "bad"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn zero_interval_is_rejected() {
        assert!(parse_trigger("z", &TriggerSpec::Interval { every_secs: 0 }).is_err());
    }

    #[test]
    fn unknown_timezone_is_rejected() {
        assert!(parse_timezone("Mars/Olympus_Mons").is_err());
        assert!(parse_timezone("Europe/Kyiv").is_ok());
    }

    #[test]
    fn cron_next_fire_respects_timezone() {
        let trigger = parse_trigger(
            "daily_report",
            &TriggerSpec::Cron {
                expression: "0 9 * * *".to_string(),
            },
        )
        .unwrap();
        let kyiv = parse_timezone("Europe/Kyiv").unwrap();
        // 2024-01-15 00:00 UTC is 02:00 in Kyiv (winter, UTC+2); the next
        // 09:00 Kyiv fire is 07:00 UTC the same day.
        let next = initial_fire(&trigger, kyiv, utc(2024, 1, 15, 0, 0, 0)).unwrap();
        assert_eq!(next, utc(2024, 1, 15, 7, 0, 0));
    }

    #[test]
    fn interval_fires_are_exactly_one_period_apart() {
        let trigger = Trigger::Interval {
            every: StdDuration::from_secs(5),
        };
        let anchor = utc(2024, 3, 1, 12, 0, 0);

        // Simulate ticks arriving with uneven lag; fired slots must stay on
        // the anchor grid, exactly 5 s apart.
        let mut next = anchor;
        let mut fires = Vec::new();
        for lag_ms in [0i64, 130, 260, 90] {
            let now = next + Duration::milliseconds(lag_ms);
            let (fired, upcoming) = advance(&trigger, UTC, next, now);
            fires.push(fired.unwrap());
            next = upcoming.unwrap();
        }
        for pair in fires.windows(2) {
            assert_eq!(pair[1] - pair[0], Duration::seconds(5));
        }
    }

    #[test]
    fn stalled_interval_coalesces_to_latest_slot() {
        let trigger = Trigger::Interval {
            every: StdDuration::from_secs(5),
        };
        let anchor = utc(2024, 3, 1, 12, 0, 0);
        // 17 s late: slots at +5, +10, +15 were missed; only +15 fires.
        let now = anchor + Duration::seconds(17);
        let (fired, upcoming) = advance(&trigger, UTC, anchor + Duration::seconds(5), now);
        assert_eq!(fired.unwrap(), anchor + Duration::seconds(15));
        assert_eq!(upcoming.unwrap(), anchor + Duration::seconds(20));
    }

    #[test]
    fn stalled_cron_coalesces_to_latest_slot() {
        let trigger = parse_trigger(
            "hourly",
            &TriggerSpec::Cron {
                expression: "0 * * * *".to_string(),
            },
        )
        .unwrap();
        // Stored next fire was 10:00 but the process slept until 13:30:
        // only the 13:00 slot fires, and 14:00 is upcoming.
        let (fired, upcoming) = advance(
            &trigger,
            UTC,
            utc(2024, 3, 1, 10, 0, 0),
            utc(2024, 3, 1, 13, 30, 0),
        );
        assert_eq!(fired.unwrap(), utc(2024, 3, 1, 13, 0, 0));
        assert_eq!(upcoming.unwrap(), utc(2024, 3, 1, 14, 0, 0));
    }

    #[test]
    fn cycle_keys_truncate_in_the_canonical_timezone() {
        let kyiv = parse_timezone("Europe/Kyiv").unwrap();
        // 22:30 UTC on June 1st is already June 2nd in Kyiv (UTC+3 summer).
        let fire = utc(2024, 6, 1, 22, 30, 0);
        assert_eq!(cycle_key(CycleGranularity::Day, fire, kyiv), "2024-06-02");
        assert_eq!(
            cycle_key(CycleGranularity::Hour, fire, kyiv),
            "2024-06-02T01"
        );
        assert_eq!(
            cycle_key(CycleGranularity::Minute, fire, kyiv),
            "2024-06-02T01:30"
        );
        // Exact keys stay in UTC regardless of the canonical zone.
        assert_eq!(
            cycle_key(CycleGranularity::Exact, fire, kyiv),
            "2024-06-01T22:30:00+00:00"
        );
    }

    proptest! {
        // The fired slot is never in the future, stays on the period grid,
        // and the upcoming slot is the first one past `now`.
        #[test]
        fn interval_advance_stays_on_grid(
            period_secs in 1u64..3600,
            lag_ms in 0i64..7_200_000,
        ) {
            let trigger = Trigger::Interval {
                every: StdDuration::from_secs(period_secs),
            };
            let anchor = utc(2024, 3, 1, 0, 0, 0);
            let now = anchor + Duration::milliseconds(lag_ms);
            let (fired, upcoming) = advance(&trigger, UTC, anchor, now);
            let fired = fired.unwrap();
            let upcoming = upcoming.unwrap();

            prop_assert!(fired <= now);
            prop_assert!(upcoming > now);
            prop_assert_eq!(upcoming - fired, Duration::seconds(period_secs as i64));
            let offset_ms = (fired - anchor).num_milliseconds();
            prop_assert_eq!(offset_ms % (period_secs as i64 * 1000), 0);
        }
    }
}
