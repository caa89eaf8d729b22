//! Cron evaluator: decides when each enabled spec is due.
//!
//! The evaluator is a passive time wheel. The owning service calls `tick`
//! at least once per second; every spec whose next-fire time has passed is
//! fired exactly once and rescheduled from the current instant, so missed
//! windows coalesce into a single firing rather than catching up. Callbacks
//! are invoked serially on the caller's task and must stay cheap.

use crate::jobs::{AtTime, CronSpec, Frequency};

use chrono::{DateTime, Duration, LocalResult, NaiveDateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

/// One installed spec with its computed next-fire instant.
#[derive(Debug, Clone)]
struct Entry {
    spec: CronSpec,
    next_fire: DateTime<Utc>,
}

/// Passive schedule evaluator over a set of enabled cron specs.
#[derive(Debug, Default)]
pub struct Evaluator {
    entries: Vec<Entry>,
}

impl Evaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically replace the active schedule. Pending fire times of specs
    /// absent from the new set are forgotten; in-flight jobs are unaffected.
    ///
    /// Admission invariants are re-checked here: the store is written by an
    /// external front-end, so a spec that fails validation (zero interval,
    /// interval and `at` both set, bad timezone) is logged and dropped
    /// rather than installed. The same applies to specs whose next fire
    /// cannot be computed.
    pub fn reload(&mut self, specs: Vec<CronSpec>, now: DateTime<Utc>) {
        let mut entries = Vec::with_capacity(specs.len());
        for spec in specs {
            if let Err(error) = spec.validate() {
                tracing::error!(
                    cron_id = %spec.id,
                    name = %spec.name,
                    %error,
                    "rejecting invalid cron spec"
                );
                continue;
            }
            match next_fire(&spec, now) {
                Some(next_fire) => entries.push(Entry { spec, next_fire }),
                None => {
                    tracing::error!(
                        cron_id = %spec.id,
                        name = %spec.name,
                        "cannot compute fire time for cron spec, skipping"
                    );
                }
            }
        }
        tracing::info!(installed = entries.len(), "cron schedule reloaded");
        self.entries = entries;
    }

    /// Fire every spec whose next-fire time is due, then reschedule it from
    /// `now`. Late ticks produce one firing per spec, never a backlog.
    pub fn tick(&mut self, now: DateTime<Utc>, mut fire: impl FnMut(&CronSpec)) {
        for entry in &mut self.entries {
            if entry.next_fire > now {
                continue;
            }
            fire(&entry.spec);
            match next_fire(&entry.spec, now) {
                Some(next) => entry.next_fire = next,
                None => {
                    // Unreachable for specs that passed reload; push the
                    // entry far out rather than hot-looping on it.
                    tracing::error!(cron_id = %entry.spec.id, "lost fire time for cron spec");
                    entry.next_fire = now + Duration::days(3650);
                }
            }
        }
    }

    /// Number of installed specs.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(test)]
    fn next_fire_of(&self, cron_id: &str) -> Option<DateTime<Utc>> {
        self.entries
            .iter()
            .find(|entry| entry.spec.id == cron_id)
            .map(|entry| entry.next_fire)
    }
}

/// Compute the first fire time strictly after `after`.
fn next_fire(spec: &CronSpec, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if let Some(interval) = spec.interval {
        let interval = i64::from(interval);
        let step = match spec.frequency {
            Frequency::Second => Duration::seconds(interval),
            Frequency::Minute => Duration::minutes(interval),
            Frequency::Hour => Duration::hours(interval),
            Frequency::Day => Duration::days(interval),
        };
        return Some(after + step);
    }

    let at = spec.at_time()?;
    let tz = spec.tz().ok()?;
    let local = after.with_timezone(&tz).naive_local();

    // Admission is shape-only, so fields may be out of range; normalize.
    match at {
        AtTime::SecondOfMinute(second) => {
            let base = local.with_second(0)?.with_nanosecond(0)?;
            step_until_after(&tz, after, base + Duration::seconds(i64::from(second % 60)), |t| {
                t + Duration::minutes(1)
            })
        }
        AtTime::MinuteOfHour(minute) => hour_candidate(&tz, after, local, minute % 60, 0),
        AtTime::MinuteSecondOfHour(minute, second) => {
            hour_candidate(&tz, after, local, minute % 60, second % 60)
        }
        AtTime::HourMinuteOfDay(hour, minute) => {
            day_candidate(&tz, after, local, hour % 24, minute % 60, 0)
        }
        AtTime::HourMinuteSecondOfDay(hour, minute, second) => {
            day_candidate(&tz, after, local, hour % 24, minute % 60, second % 60)
        }
    }
}

fn hour_candidate(
    tz: &Tz,
    after: DateTime<Utc>,
    local: NaiveDateTime,
    minute: u32,
    second: u32,
) -> Option<DateTime<Utc>> {
    let base = local.with_minute(0)?.with_second(0)?.with_nanosecond(0)?;
    let candidate =
        base + Duration::minutes(i64::from(minute)) + Duration::seconds(i64::from(second));
    step_until_after(tz, after, candidate, |t| t + Duration::hours(1))
}

fn day_candidate(
    tz: &Tz,
    after: DateTime<Utc>,
    local: NaiveDateTime,
    hour: u32,
    minute: u32,
    second: u32,
) -> Option<DateTime<Utc>> {
    let candidate = local.date().and_hms_opt(hour, minute, second)?;
    step_until_after(tz, after, candidate, |t| t + Duration::days(1))
}

/// Resolve a local candidate to UTC and advance it by `step` until it lands
/// strictly after `after`. A candidate that falls into a DST gap is skipped
/// to the next step.
fn step_until_after(
    tz: &Tz,
    after: DateTime<Utc>,
    mut candidate: NaiveDateTime,
    step: impl Fn(NaiveDateTime) -> NaiveDateTime,
) -> Option<DateTime<Utc>> {
    // Two steps cover "already passed"; a couple more cover DST gaps.
    for _ in 0..4 {
        match tz.from_local_datetime(&candidate) {
            LocalResult::Single(instant) => {
                let instant = instant.with_timezone(&Utc);
                if instant > after {
                    return Some(instant);
                }
            }
            LocalResult::Ambiguous(earliest, _) => {
                let instant = earliest.with_timezone(&Utc);
                if instant > after {
                    return Some(instant);
                }
            }
            LocalResult::None => {}
        }
        candidate = step(candidate);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{InventoryBinding, JobKind};

    fn utc(value: &str) -> DateTime<Utc> {
        value.parse().expect("test timestamp should parse")
    }

    fn spec(
        id: &str,
        frequency: Frequency,
        interval: Option<u32>,
        at: Option<&str>,
        timezone: &str,
    ) -> CronSpec {
        CronSpec {
            id: id.into(),
            name: id.into(),
            kind: JobKind::Shell,
            run_target: "test.sh".into(),
            args: vec![],
            frequency,
            interval,
            at: at.map(Into::into),
            timezone: timezone.into(),
            host_inventory: InventoryBinding::default(),
            extra_vars: serde_json::Map::new(),
            disabled: false,
        }
    }

    fn fired_ids(evaluator: &mut Evaluator, now: DateTime<Utc>) -> Vec<String> {
        let mut fired = Vec::new();
        evaluator.tick(now, |spec| fired.push(spec.id.clone()));
        fired
    }

    #[test]
    fn interval_spec_fires_one_interval_after_install() {
        let now = utc("2025-03-10T12:00:00Z");
        let mut evaluator = Evaluator::new();
        evaluator.reload(vec![spec("c1", Frequency::Second, Some(5), None, "UTC")], now);

        assert!(fired_ids(&mut evaluator, now + Duration::seconds(4)).is_empty());
        assert_eq!(
            fired_ids(&mut evaluator, now + Duration::seconds(5)),
            vec!["c1"]
        );
    }

    #[test]
    fn missed_windows_coalesce_into_one_firing() {
        let now = utc("2025-03-10T12:00:00Z");
        let mut evaluator = Evaluator::new();
        evaluator.reload(vec![spec("c1", Frequency::Second, Some(5), None, "UTC")], now);

        // An hour of downtime produces exactly one firing, rescheduled
        // from the late tick instead of replaying every missed window.
        let late = now + Duration::hours(1);
        assert_eq!(fired_ids(&mut evaluator, late), vec!["c1"]);
        assert!(fired_ids(&mut evaluator, late + Duration::seconds(1)).is_empty());
        assert_eq!(
            fired_ids(&mut evaluator, late + Duration::seconds(5)),
            vec!["c1"]
        );
    }

    #[test]
    fn reload_is_idempotent() {
        let now = utc("2025-03-10T12:00:00Z");
        let specs = vec![
            spec("c1", Frequency::Minute, Some(2), None, "UTC"),
            spec("c2", Frequency::Day, None, Some("06:30"), "UTC"),
        ];
        let mut once = Evaluator::new();
        once.reload(specs.clone(), now);
        let mut twice = Evaluator::new();
        twice.reload(specs.clone(), now);
        twice.reload(specs, now);

        assert_eq!(once.len(), twice.len());
        assert_eq!(once.next_fire_of("c1"), twice.next_fire_of("c1"));
        assert_eq!(once.next_fire_of("c2"), twice.next_fire_of("c2"));
    }

    #[test]
    fn reload_rejects_specs_that_fail_admission() {
        let now = utc("2025-03-10T12:00:00Z");
        let mut evaluator = Evaluator::new();

        // A zero interval would refire on every tick; it must never install.
        let zero_interval = spec("zero", Frequency::Second, Some(0), None, "UTC");
        // Interval and at together is ambiguous and likewise rejected.
        let conflicted = spec("both", Frequency::Minute, Some(5), Some(":30"), "UTC");
        let mut bad_tz = spec("tz", Frequency::Second, Some(5), None, "UTC");
        bad_tz.timezone = "Mars/Olympus".into();
        let valid = spec("ok", Frequency::Second, Some(5), None, "UTC");

        evaluator.reload(vec![zero_interval, conflicted, bad_tz, valid], now);

        assert_eq!(evaluator.len(), 1);
        assert!(evaluator.next_fire_of("zero").is_none());
        assert!(evaluator.next_fire_of("both").is_none());
        assert!(evaluator.next_fire_of("tz").is_none());
        assert_eq!(
            fired_ids(&mut evaluator, now + Duration::seconds(5)),
            vec!["ok"]
        );
    }

    #[test]
    fn reload_forgets_removed_specs() {
        let now = utc("2025-03-10T12:00:00Z");
        let mut evaluator = Evaluator::new();
        evaluator.reload(vec![spec("c1", Frequency::Second, Some(1), None, "UTC")], now);
        evaluator.reload(Vec::new(), now);

        assert!(evaluator.is_empty());
        assert!(fired_ids(&mut evaluator, now + Duration::hours(1)).is_empty());
    }

    #[test]
    fn minute_at_fires_on_the_requested_second() {
        let now = utc("2025-03-10T12:00:10Z");
        let mut evaluator = Evaluator::new();
        evaluator.reload(
            vec![spec("c1", Frequency::Minute, None, Some(":30"), "UTC")],
            now,
        );
        assert_eq!(
            evaluator.next_fire_of("c1"),
            Some(utc("2025-03-10T12:00:30Z"))
        );

        // Already past this minute's mark: roll to the next minute.
        evaluator.reload(
            vec![spec("c1", Frequency::Minute, None, Some(":30"), "UTC")],
            utc("2025-03-10T12:00:45Z"),
        );
        assert_eq!(
            evaluator.next_fire_of("c1"),
            Some(utc("2025-03-10T12:01:30Z"))
        );
    }

    #[test]
    fn hour_at_supports_both_shapes() {
        let now = utc("2025-03-10T12:20:00Z");
        let mut evaluator = Evaluator::new();
        evaluator.reload(
            vec![
                spec("mm", Frequency::Hour, None, Some(":45"), "UTC"),
                spec("mmss", Frequency::Hour, None, Some("10:30"), "UTC"),
            ],
            now,
        );
        assert_eq!(
            evaluator.next_fire_of("mm"),
            Some(utc("2025-03-10T12:45:00Z"))
        );
        assert_eq!(
            evaluator.next_fire_of("mmss"),
            Some(utc("2025-03-10T13:10:30Z"))
        );
    }

    #[test]
    fn day_at_respects_the_spec_timezone() {
        // 2025-01-15 is EST (UTC-5): 00:30 local is 05:30 UTC.
        let now = utc("2025-01-15T06:00:00Z");
        let mut evaluator = Evaluator::new();
        evaluator.reload(
            vec![spec(
                "c1",
                Frequency::Day,
                None,
                Some("00:30"),
                "America/New_York",
            )],
            now,
        );
        assert_eq!(
            evaluator.next_fire_of("c1"),
            Some(utc("2025-01-16T05:30:00Z"))
        );
    }

    #[test]
    fn out_of_range_at_fields_are_normalized() {
        // ":99" passes shape-only admission; the evaluator wraps it to :39.
        let now = utc("2025-03-10T12:00:00Z");
        let mut evaluator = Evaluator::new();
        evaluator.reload(
            vec![spec("c1", Frequency::Minute, None, Some(":99"), "UTC")],
            now,
        );
        assert_eq!(
            evaluator.next_fire_of("c1"),
            Some(utc("2025-03-10T12:00:39Z"))
        );
    }

    #[test]
    fn dst_gap_candidates_skip_to_the_next_day() {
        // US spring forward 2025-03-09: 02:30 EST does not exist.
        let now = utc("2025-03-09T01:00:00Z");
        let mut evaluator = Evaluator::new();
        evaluator.reload(
            vec![spec(
                "c1",
                Frequency::Day,
                None,
                Some("02:30"),
                "America/New_York",
            )],
            now,
        );
        // Next existing 02:30 local is on 2025-03-10 (EDT, UTC-4).
        assert_eq!(
            evaluator.next_fire_of("c1"),
            Some(utc("2025-03-10T06:30:00Z"))
        );
    }
}
