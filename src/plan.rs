//! Schedule plans: ordered flood cycles for one local day, plus the next-due
//! math the worker runs against the wall clock.

use chrono::{DateTime, Duration, LocalResult, NaiveDate, TimeZone, Timelike};
use chrono_tz::Tz;
use serde::Serialize;
use tracing::warn;

use crate::error::{Error, Result};
use crate::timefmt::TimeOfDay;

// ---------------------------------------------------------------------------
// Periods
// ---------------------------------------------------------------------------

/// Named partition of the day used by adaptation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    Morning,
    Day,
    Evening,
    Night,
}

impl Period {
    pub const ALL: [Period; 4] = [Period::Morning, Period::Day, Period::Evening, Period::Night];
}

// ---------------------------------------------------------------------------
// Cycles
// ---------------------------------------------------------------------------

/// Informational context attached to synthesized cycles. Never read by the
/// execution loop.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleAnnotation {
    pub period: Period,
    pub temperature_c: Option<f64>,
    pub humidity_pct: Option<f64>,
    pub temp_factor: f64,
    pub humidity_factor: f64,
}

/// One atomic flood event: ON at `on_time` for `flood_minutes`, then OFF for
/// `off_minutes` before the next event is considered.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Cycle {
    pub on_time: TimeOfDay,
    pub flood_minutes: f64,
    pub off_minutes: f64,
    /// Set when construction clamped a duration into bounds.
    pub deviation: bool,
    pub annotation: Option<CycleAnnotation>,
}

impl Cycle {
    pub fn new(on_time: TimeOfDay, flood_minutes: f64, off_minutes: f64) -> Self {
        Self {
            on_time,
            flood_minutes,
            off_minutes,
            deviation: false,
            annotation: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Bounds
// ---------------------------------------------------------------------------

/// System constraints applied to every installed plan.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Bounds {
    pub min_flood: f64,
    pub max_flood: f64,
    pub min_off: f64,
    pub max_off: f64,
}

impl Default for Bounds {
    fn default() -> Self {
        Self {
            min_flood: 2.0,
            max_flood: 15.0,
            min_off: 5.0,
            max_off: 180.0,
        }
    }
}

impl Bounds {
    pub fn clamp_flood(&self, v: f64) -> f64 {
        v.clamp(self.min_flood, self.max_flood)
    }

    pub fn clamp_off(&self, v: f64) -> f64 {
        v.clamp(self.min_off, self.max_off)
    }
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// An immutable, ordered sequence of cycles for a single local day.
/// Replanning installs a whole new plan; nothing mutates one in place.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchedulePlan {
    cycles: Vec<Cycle>,
}

impl SchedulePlan {
    /// Sort, de-duplicate-check, and clamp cycles into `bounds`. Cycles whose
    /// durations fall outside the bounds are clamped (with a warning and a
    /// deviation flag), never dropped. Two cycles sharing an on-time are a
    /// construction error.
    pub fn new(mut cycles: Vec<Cycle>, bounds: &Bounds) -> Result<Self> {
        cycles.sort_by_key(|c| c.on_time);

        for pair in cycles.windows(2) {
            if pair[0].on_time == pair[1].on_time {
                return Err(Error::configuration(vec![format!(
                    "duplicate cycle on_time {}",
                    pair[0].on_time
                )]));
            }
        }

        for cycle in &mut cycles {
            let flood = bounds.clamp_flood(cycle.flood_minutes);
            let off = bounds.clamp_off(cycle.off_minutes);
            if flood != cycle.flood_minutes || off != cycle.off_minutes {
                warn!(
                    on_time = %cycle.on_time,
                    flood = cycle.flood_minutes,
                    off = cycle.off_minutes,
                    "cycle durations out of bounds — clamped"
                );
                cycle.flood_minutes = flood;
                cycle.off_minutes = off;
                cycle.deviation = true;
            }
        }

        Ok(Self { cycles })
    }

    pub fn empty() -> Self {
        Self { cycles: Vec::new() }
    }

    pub fn cycles(&self) -> &[Cycle] {
        &self.cycles
    }

    pub fn len(&self) -> usize {
        self.cycles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cycles.is_empty()
    }

    pub fn has_deviations(&self) -> bool {
        self.cycles.iter().any(|c| c.deviation)
    }

    /// Shift every cycle so the earliest on-time lands on `sunrise`,
    /// preserving relative spacing (wrapping past midnight where needed).
    pub fn shifted_to_sunrise(&self, sunrise: TimeOfDay) -> SchedulePlan {
        let Some(earliest) = self.cycles.first().map(|c| c.on_time) else {
            return self.clone();
        };
        let shift = earliest.minutes_until(sunrise);
        let mut cycles: Vec<Cycle> = self
            .cycles
            .iter()
            .map(|c| {
                let mut shifted = c.clone();
                shifted.on_time =
                    TimeOfDay::from_minutes(c.on_time.total_minutes() as u32 + shift as u32);
                shifted
            })
            .collect();
        cycles.sort_by_key(|c| c.on_time);
        SchedulePlan { cycles }
    }

    /// Next due cycle at or after `now` (a cycle whose on-time equals the
    /// current minute is due immediately at the top of the second). Instants
    /// at or before `after` are skipped so that a backward wall-clock jump
    /// never re-executes a cycle.
    pub fn next_due(
        &self,
        now: DateTime<Tz>,
        after: Option<DateTime<Tz>>,
    ) -> Option<(DateTime<Tz>, &Cycle)> {
        if self.cycles.is_empty() {
            return None;
        }

        let tz = now.timezone();
        let now_floor = now.with_nanosecond(0).unwrap_or(now);
        let today = now.date_naive();

        for day_offset in 0..=1i64 {
            let date = today + Duration::days(day_offset);
            for cycle in &self.cycles {
                let instant = local_instant(date, cycle.on_time, tz);
                if instant < now_floor {
                    continue;
                }
                if let Some(fired) = after {
                    if instant <= fired {
                        continue;
                    }
                }
                return Some((instant, cycle));
            }
        }

        None
    }
}

/// Resolve a local date + time-of-day to an instant in `tz`. DST ambiguity
/// takes the earlier mapping; a spring-forward gap shifts into the next hour.
pub fn local_instant(date: NaiveDate, tod: TimeOfDay, tz: Tz) -> DateTime<Tz> {
    let ndt = date.and_time(tod.to_naive());
    match tz.from_local_datetime(&ndt) {
        LocalResult::Single(t) => t,
        LocalResult::Ambiguous(earliest, _) => earliest,
        LocalResult::None => match tz.from_local_datetime(&(ndt + Duration::hours(1))) {
            LocalResult::Single(t) => t,
            LocalResult::Ambiguous(earliest, _) => earliest,
            LocalResult::None => tz.from_utc_datetime(&ndt),
        },
    }
}

// ===========================================================================
// Tests
// ===========================================================================
