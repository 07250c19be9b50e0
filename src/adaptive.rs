//! Adaptive schedule synthesis.
//!
//! The synthesizer is a pure function of (adaptation settings, today's
//! daylight, the latest environmental sample). It never reads an existing
//! plan; a previously configured cycle list is admitted only as an analytic
//! reference for the validation report.
//!
//! Factor semantics: factors multiply the base off-duration, so values < 1
//! mean "more frequent" (shorter waits). Period factors divide because they
//! express frequency rather than duration.

use serde::Serialize;

use crate::daylight::DaylightInfo;
use crate::error::Result;
use crate::plan::{Bounds, Cycle, CycleAnnotation, Period, SchedulePlan};
use crate::timefmt::TimeOfDay;
use crate::weather::EnvironmentalSample;

/// Deviation threshold for the validation report (50%).
const DEVIATION_THRESHOLD: f64 = 0.5;

/// Event-count difference that earns a report warning (30%).
const COUNT_WARNING_THRESHOLD: f64 = 0.3;

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// One value per period.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PeriodValues {
    pub morning: f64,
    pub day: f64,
    pub evening: f64,
    pub night: f64,
}

impl PeriodValues {
    pub fn get(&self, period: Period) -> f64 {
        match period {
            Period::Morning => self.morning,
            Period::Day => self.day,
            Period::Evening => self.evening,
            Period::Night => self.night,
        }
    }
}

/// Default base off-durations (minutes) per period.
pub fn default_tod_frequencies() -> PeriodValues {
    PeriodValues {
        morning: 18.0,
        day: 28.0,
        evening: 18.0,
        night: 118.0,
    }
}

/// A half-open band `[min, max)` over the real line; open ends are `None`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Band {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub factor: f64,
}

pub fn default_temperature_bands() -> Vec<Band> {
    vec![
        Band { min: None, max: Some(15.0), factor: 1.15 },
        Band { min: Some(15.0), max: Some(25.0), factor: 1.0 },
        Band { min: Some(25.0), max: Some(30.0), factor: 0.85 },
        Band { min: Some(30.0), max: None, factor: 0.70 },
    ]
}

pub fn default_humidity_bands() -> Vec<Band> {
    vec![
        Band { min: None, max: Some(40.0), factor: 0.9 },
        Band { min: Some(40.0), max: Some(70.0), factor: 1.0 },
        Band { min: Some(70.0), max: None, factor: 1.1 },
    ]
}

/// Index of the band containing `value`, if any.
pub fn band_index(bands: &[Band], value: Option<f64>) -> Option<usize> {
    let v = value?;
    bands.iter().position(|band| {
        let above_min = band.min.map_or(true, |min| v >= min);
        let below_max = band.max.map_or(true, |max| v < max);
        above_min && below_max
    })
}

/// The factor for `value`; 1.0 when the value is unknown or unbanded.
pub fn band_factor(bands: &[Band], value: Option<f64>) -> f64 {
    band_index(bands, value)
        .map(|i| bands[i].factor)
        .unwrap_or(1.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Constraints {
    pub min_wait: f64,
    pub max_wait: f64,
    pub min_flood: f64,
    pub max_flood: f64,
    /// Flood duration each synthesized cycle runs for.
    pub flood_minutes: f64,
}

impl Default for Constraints {
    fn default() -> Self {
        Self {
            min_wait: 5.0,
            max_wait: 180.0,
            min_flood: 2.0,
            max_flood: 15.0,
            flood_minutes: 2.0,
        }
    }
}

impl Constraints {
    pub fn bounds(&self) -> Bounds {
        Bounds {
            min_flood: self.min_flood,
            max_flood: self.max_flood,
            min_off: self.min_wait,
            max_off: self.max_wait,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdaptiveSettings {
    pub tod_frequencies: PeriodValues,
    pub temperature_bands: Vec<Band>,
    pub humidity_bands: Vec<Band>,
    /// Per-period frequency multipliers from the daylight adaptor.
    pub period_factors: Option<PeriodValues>,
    pub constraints: Constraints,
}

impl Default for AdaptiveSettings {
    fn default() -> Self {
        Self {
            tod_frequencies: default_tod_frequencies(),
            temperature_bands: default_temperature_bands(),
            humidity_bands: default_humidity_bands(),
            period_factors: None,
            constraints: Constraints::default(),
        }
    }
}

/// Fingerprint of band memberships; re-synthesis triggers when a fresh sample
/// changes this.
pub fn factor_fingerprint(
    settings: &AdaptiveSettings,
    sample: &EnvironmentalSample,
) -> (Option<usize>, Option<usize>) {
    (
        band_index(&settings.temperature_bands, sample.temperature_c),
        band_index(&settings.humidity_bands, sample.humidity_pct),
    )
}

// ---------------------------------------------------------------------------
// Period windows
// ---------------------------------------------------------------------------

/// Day partition boundaries, minutes from local midnight. Sunrise shifts the
/// morning start only within [05:00, 07:00]; sunset shifts the day/evening
/// boundary only within [17:00, 19:00]. This keeps the four windows a
/// partition of 24 hours for any sunrise/sunset input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeriodWindows {
    pub morning_start: u32,
    pub day_start: u32,
    pub evening_start: u32,
    pub night_start: u32,
}

const DAY_START_MIN: u32 = 9 * 60;
const NIGHT_START_MIN: u32 = 20 * 60;
const SUNRISE_WINDOW: (u32, u32) = (5 * 60, 7 * 60);
const SUNSET_WINDOW: (u32, u32) = (17 * 60, 19 * 60);

impl PeriodWindows {
    pub fn from_daylight(daylight: Option<&DaylightInfo>) -> Self {
        let sunrise = daylight.map(|d| d.sunrise.total_minutes() as u32);
        let sunset = daylight.map(|d| d.sunset.total_minutes() as u32);

        let morning_start = match sunrise {
            Some(m) if (SUNRISE_WINDOW.0..=SUNRISE_WINDOW.1).contains(&m) => m,
            _ => 6 * 60,
        };
        let evening_start = match sunset {
            Some(m) if (SUNSET_WINDOW.0..=SUNSET_WINDOW.1).contains(&m) => m,
            _ => 18 * 60,
        };

        Self {
            morning_start,
            day_start: DAY_START_MIN,
            evening_start,
            night_start: NIGHT_START_MIN,
        }
    }

    /// Window of a period as (start, end) minutes from midnight; the night
    /// window wraps, so its end exceeds 24 h.
    pub fn window(&self, period: Period) -> (u32, u32) {
        match period {
            Period::Morning => (self.morning_start, self.day_start),
            Period::Day => (self.day_start, self.evening_start),
            Period::Evening => (self.evening_start, self.night_start),
            Period::Night => (self.night_start, self.morning_start + 24 * 60),
        }
    }

    pub fn period_of(&self, t: TimeOfDay) -> Period {
        let m = t.total_minutes() as u32;
        if m >= self.night_start || m < self.morning_start {
            Period::Night
        } else if m < self.day_start {
            Period::Morning
        } else if m < self.evening_start {
            Period::Day
        } else {
            Period::Evening
        }
    }
}

// ---------------------------------------------------------------------------
// Synthesis
// ---------------------------------------------------------------------------

/// Build a full-day plan from factors alone.
pub fn synthesize(
    settings: &AdaptiveSettings,
    daylight: Option<&DaylightInfo>,
    sample: &EnvironmentalSample,
) -> Result<SchedulePlan> {
    let windows = PeriodWindows::from_daylight(daylight);
    let c = &settings.constraints;

    let temp_factor = band_factor(&settings.temperature_bands, sample.temperature_c);
    let humidity_factor = band_factor(&settings.humidity_bands, sample.humidity_pct);
    let flood = c.flood_minutes.clamp(c.min_flood, c.max_flood);

    let mut cycles: Vec<Cycle> = Vec::new();

    for period in Period::ALL {
        let base = settings.tod_frequencies.get(period);
        let period_factor = settings
            .period_factors
            .map(|f| f.get(period))
            .unwrap_or(1.0);
        let target_off =
            (base * temp_factor * humidity_factor / period_factor).clamp(c.min_wait, c.max_wait);

        let (start, end) = windows.window(period);
        let mut cursor = start as f64;
        while cursor + flood + target_off <= end as f64 {
            cycles.push(Cycle {
                on_time: TimeOfDay::from_minutes(cursor.floor() as u32),
                flood_minutes: flood,
                off_minutes: target_off,
                deviation: false,
                annotation: Some(CycleAnnotation {
                    period,
                    temperature_c: sample.temperature_c,
                    humidity_pct: sample.humidity_pct,
                    temp_factor,
                    humidity_factor,
                }),
            });
            cursor += flood + target_off;
        }
    }

    // Concatenated per-period events, re-sorted by on-time, then bounded.
    SchedulePlan::new(cycles, &c.bounds())
}

// ---------------------------------------------------------------------------
// Validation report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleComparison {
    pub active_time: TimeOfDay,
    pub active_off: f64,
    pub reference_time: TimeOfDay,
    pub reference_off: f64,
    pub deviation_pct: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct ValidationReport {
    pub active_count: usize,
    pub reference_count: usize,
    pub matches: Vec<CycleComparison>,
    pub deviations: Vec<CycleComparison>,
    pub warnings: Vec<String>,
}

/// Compare a synthesized plan against an analytic reference. Purely
/// informational; never feeds back into synthesis.
pub fn validate_against(active: &SchedulePlan, reference: &SchedulePlan) -> ValidationReport {
    let mut report = ValidationReport {
        active_count: active.len(),
        reference_count: reference.len(),
        ..Default::default()
    };

    if reference.is_empty() {
        return report;
    }

    let count_diff =
        (active.len() as f64 - reference.len() as f64).abs() / reference.len() as f64;
    if count_diff > COUNT_WARNING_THRESHOLD {
        report.warnings.push(format!(
            "event count differs by {:.0}% ({} vs {})",
            count_diff * 100.0,
            active.len(),
            reference.len()
        ));
    }

    for cycle in active.cycles() {
        let nearest = reference
            .cycles()
            .iter()
            .min_by_key(|r| cycle.on_time.distance(r.on_time))
            .expect("reference is non-empty");

        let deviation_pct = if nearest.off_minutes > 0.0 {
            (cycle.off_minutes - nearest.off_minutes).abs() / nearest.off_minutes * 100.0
        } else {
            0.0
        };

        let comparison = CycleComparison {
            active_time: cycle.on_time,
            active_off: cycle.off_minutes,
            reference_time: nearest.on_time,
            reference_off: nearest.off_minutes,
            deviation_pct,
        };

        if deviation_pct > DEVIATION_THRESHOLD * 100.0 {
            report.warnings.push(format!(
                "{}: {:.1} min wait is {:.0}% off the reference {:.1} min",
                comparison.active_time,
                comparison.active_off,
                comparison.deviation_pct,
                comparison.reference_off
            ));
            report.deviations.push(comparison);
        } else {
            report.matches.push(comparison);
        }
    }

    report
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone, Utc};

    fn tod(s: &str) -> TimeOfDay {
        s.parse().unwrap()
    }

    fn daylight(sunrise: &str, sunset: &str) -> DaylightInfo {
        let rise = tod(sunrise);
        let set = tod(sunset);
        DaylightInfo {
            date: NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
            sunrise: rise,
            sunset: set,
            day_length_minutes: rise.minutes_until(set) as f64,
        }
    }

    fn sample(temp: Option<f64>, hum: Option<f64>) -> EnvironmentalSample {
        EnvironmentalSample {
            temperature_c: temp,
            humidity_pct: hum,
            sample_time: Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap(),
            station_id: Some("94768".into()),
            station_name: None,
        }
    }

    // -- Band lookup --------------------------------------------------------

    #[test]
    fn default_bands_partition_every_finite_input() {
        let temps = default_temperature_bands();
        let mut t = -40.0;
        while t <= 60.0 {
            let hits = temps
                .iter()
                .filter(|b| {
                    b.min.map_or(true, |min| t >= min) && b.max.map_or(true, |max| t < max)
                })
                .count();
            assert_eq!(hits, 1, "temperature {t} matched {hits} bands");
            t += 0.25;
        }
    }

    #[test]
    fn band_factor_matches_defaults() {
        let bands = default_temperature_bands();
        assert_eq!(band_factor(&bands, Some(10.0)), 1.15);
        assert_eq!(band_factor(&bands, Some(22.0)), 1.0);
        assert_eq!(band_factor(&bands, Some(27.0)), 0.85);
        assert_eq!(band_factor(&bands, Some(32.0)), 0.70);
    }

    #[test]
    fn band_boundaries_belong_to_the_upper_band() {
        let bands = default_temperature_bands();
        assert_eq!(band_factor(&bands, Some(15.0)), 1.0);
        assert_eq!(band_factor(&bands, Some(25.0)), 0.85);
        assert_eq!(band_factor(&bands, Some(30.0)), 0.70);
    }

    #[test]
    fn unknown_value_has_unit_factor() {
        assert_eq!(band_factor(&default_temperature_bands(), None), 1.0);
        assert_eq!(band_factor(&default_humidity_bands(), None), 1.0);
    }

    // -- Period windows -----------------------------------------------------

    #[test]
    fn windows_follow_sunrise_and_sunset_inside_their_ranges() {
        let w = PeriodWindows::from_daylight(Some(&daylight("06:30", "17:45")));
        assert_eq!(w.morning_start, 6 * 60 + 30);
        assert_eq!(w.evening_start, 17 * 60 + 45);
    }

    #[test]
    fn windows_fall_back_outside_their_ranges() {
        // Extreme sunset (after midnight local quirk) and early sunrise both
        // fall back; the partition survives.
        let w = PeriodWindows::from_daylight(Some(&daylight("04:10", "21:30")));
        assert_eq!(w.morning_start, 6 * 60);
        assert_eq!(w.evening_start, 18 * 60);
    }

    #[test]
    fn windows_without_daylight_use_civil_defaults() {
        let w = PeriodWindows::from_daylight(None);
        assert_eq!(w.morning_start, 360);
        assert_eq!(w.evening_start, 1080);
    }

    #[test]
    fn windows_partition_the_whole_day() {
        for info in [daylight("05:00", "19:00"), daylight("07:00", "17:00"), daylight("02:00", "23:50")] {
            let w = PeriodWindows::from_daylight(Some(&info));
            let mut total = 0;
            for p in Period::ALL {
                let (start, end) = w.window(p);
                assert!(end >= start, "{p:?} window inverted");
                total += end - start;
            }
            assert_eq!(total, 24 * 60);
        }
    }

    #[test]
    fn period_of_respects_boundaries() {
        let w = PeriodWindows::from_daylight(Some(&daylight("06:00", "18:00")));
        assert_eq!(w.period_of(tod("06:00")), Period::Morning);
        assert_eq!(w.period_of(tod("08:59")), Period::Morning);
        assert_eq!(w.period_of(tod("09:00")), Period::Day);
        assert_eq!(w.period_of(tod("18:00")), Period::Evening);
        assert_eq!(w.period_of(tod("20:00")), Period::Night);
        assert_eq!(w.period_of(tod("03:00")), Period::Night);
    }

    // -- Synthesis ----------------------------------------------------------

    #[test]
    fn moderate_conditions_fill_the_day_period_on_the_half_hour() {
        // S4: T=22, H=55 → both factors 1.0; day interval = 2 + 28 = 30 min.
        let settings = AdaptiveSettings::default();
        let plan =
            synthesize(&settings, Some(&daylight("06:00", "18:00")), &sample(Some(22.0), Some(55.0)))
                .unwrap();

        let day: Vec<&Cycle> = plan
            .cycles()
            .iter()
            .filter(|c| c.annotation.as_ref().unwrap().period == Period::Day)
            .collect();

        assert_eq!(day.len(), 18);
        assert_eq!(day.first().unwrap().on_time, tod("09:00"));
        assert_eq!(day.last().unwrap().on_time, tod("17:30"));
        for (i, cycle) in day.iter().enumerate() {
            assert_eq!(cycle.on_time.total_minutes() as usize, 9 * 60 + i * 30);
            assert_eq!(cycle.off_minutes, 28.0);
        }
    }

    #[test]
    fn hot_and_dry_shortens_waits() {
        // S5: T=32 → 0.70, H=30 → 0.9; day target_off = 28·0.70·0.9 = 17.64.
        let settings = AdaptiveSettings::default();
        let plan =
            synthesize(&settings, Some(&daylight("06:00", "18:00")), &sample(Some(32.0), Some(30.0)))
                .unwrap();

        let day: Vec<&Cycle> = plan
            .cycles()
            .iter()
            .filter(|c| c.annotation.as_ref().unwrap().period == Period::Day)
            .collect();

        let expected_off = 28.0 * 0.70 * 0.9;
        assert!((day[0].off_minutes - expected_off).abs() < 1e-9);
        assert_eq!(day[0].on_time, tod("09:00"));
        // Second event lands at 09:00 + 2 + 17.64, truncated to the minute.
        assert_eq!(day[1].on_time, tod("09:19"));
        // Shorter waits emit more cycles than the moderate case.
        assert!(day.len() > 18);
    }

    #[test]
    fn synthesis_is_deterministic() {
        let settings = AdaptiveSettings::default();
        let d = daylight("06:12", "17:48");
        let s = sample(Some(19.5), Some(62.0));
        let a = synthesize(&settings, Some(&d), &s).unwrap();
        let b = synthesize(&settings, Some(&d), &s).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn unknown_sample_equals_unit_factors() {
        // Invariant: an all-unknown sample produces the same plan as factors
        // forced to 1.0 (here: a sample sitting in the 1.0 bands).
        let settings = AdaptiveSettings::default();
        let d = daylight("06:00", "18:00");
        let unknown = synthesize(&settings, Some(&d), &sample(None, None)).unwrap();
        let neutral = synthesize(&settings, Some(&d), &sample(Some(20.0), Some(55.0))).unwrap();

        assert_eq!(unknown.len(), neutral.len());
        for (u, n) in unknown.cycles().iter().zip(neutral.cycles()) {
            assert_eq!(u.on_time, n.on_time);
            assert_eq!(u.off_minutes, n.off_minutes);
        }
    }

    #[test]
    fn period_factor_divides_the_wait() {
        let mut settings = AdaptiveSettings::default();
        settings.period_factors = Some(PeriodValues {
            morning: 1.0,
            day: 2.0, // twice as frequent during the day
            evening: 1.0,
            night: 1.0,
        });
        let plan =
            synthesize(&settings, Some(&daylight("06:00", "18:00")), &sample(Some(20.0), Some(55.0)))
                .unwrap();
        let day_cycle = plan
            .cycles()
            .iter()
            .find(|c| c.annotation.as_ref().unwrap().period == Period::Day)
            .unwrap();
        assert_eq!(day_cycle.off_minutes, 14.0);
    }

    #[test]
    fn waits_clamp_to_constraints_without_dropping_cycles() {
        let mut settings = AdaptiveSettings::default();
        settings.tod_frequencies = PeriodValues {
            morning: 500.0,
            day: 500.0,
            evening: 500.0,
            night: 500.0,
        };
        let plan =
            synthesize(&settings, Some(&daylight("06:00", "18:00")), &sample(None, None)).unwrap();

        // Waits clamp to max_wait (180); periods long enough still emit.
        for cycle in plan.cycles() {
            assert_eq!(cycle.off_minutes, 180.0);
        }
        // Night window (20:00 → 06:00, 600 min) fits 600 / 182 = 3 cycles.
        let night = plan
            .cycles()
            .iter()
            .filter(|c| c.annotation.as_ref().unwrap().period == Period::Night)
            .count();
        assert_eq!(night, 3);
    }

    #[test]
    fn night_cycles_wrap_midnight_and_sort_first() {
        let settings = AdaptiveSettings::default();
        let plan =
            synthesize(&settings, Some(&daylight("06:00", "18:00")), &sample(Some(22.0), Some(55.0)))
                .unwrap();

        // Night base 118 + flood 2 → events at 20:00, 22:00, 00:00, 02:00, 04:00.
        let night_times: Vec<String> = plan
            .cycles()
            .iter()
            .filter(|c| c.annotation.as_ref().unwrap().period == Period::Night)
            .map(|c| c.on_time.to_string())
            .collect();
        assert_eq!(night_times, vec!["00:00", "02:00", "04:00", "20:00", "22:00"]);

        // The installed plan is globally sorted.
        let mut sorted = plan.cycles().to_vec();
        sorted.sort_by_key(|c| c.on_time);
        assert_eq!(sorted, plan.cycles().to_vec());
    }

    #[test]
    fn annotations_carry_the_inputs() {
        let settings = AdaptiveSettings::default();
        let plan =
            synthesize(&settings, Some(&daylight("06:00", "18:00")), &sample(Some(32.0), Some(30.0)))
                .unwrap();
        let ann = plan.cycles()[0].annotation.as_ref().unwrap();
        assert_eq!(ann.temperature_c, Some(32.0));
        assert_eq!(ann.humidity_pct, Some(30.0));
        assert_eq!(ann.temp_factor, 0.70);
        assert_eq!(ann.humidity_factor, 0.9);
    }

    #[test]
    fn fingerprint_changes_with_band_membership() {
        let settings = AdaptiveSettings::default();
        let warm = factor_fingerprint(&settings, &sample(Some(26.0), Some(50.0)));
        let warmer = factor_fingerprint(&settings, &sample(Some(29.0), Some(50.0)));
        let hot = factor_fingerprint(&settings, &sample(Some(31.0), Some(50.0)));
        assert_eq!(warm, warmer); // same band → no re-synthesis
        assert_ne!(warm, hot);
    }

    // -- Validation report --------------------------------------------------

    fn reference_plan(entries: &[(&str, f64)]) -> SchedulePlan {
        let cycles = entries
            .iter()
            .map(|(t, off)| Cycle::new(tod(t), 2.0, *off))
            .collect();
        SchedulePlan::new(cycles, &Bounds::default()).unwrap()
    }

    #[test]
    fn validation_flags_large_wait_deviations() {
        let active = reference_plan(&[("09:00", 60.0)]);
        let reference = reference_plan(&[("09:05", 20.0)]);
        let report = validate_against(&active, &reference);

        assert_eq!(report.deviations.len(), 1);
        assert!(report.matches.is_empty());
        assert!((report.deviations[0].deviation_pct - 200.0).abs() < 1e-9);
    }

    #[test]
    fn validation_accepts_close_waits() {
        let active = reference_plan(&[("09:00", 24.0)]);
        let reference = reference_plan(&[("09:05", 20.0)]);
        let report = validate_against(&active, &reference);

        assert_eq!(report.matches.len(), 1);
        assert!(report.deviations.is_empty());
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn validation_warns_on_event_count_gap() {
        let active = reference_plan(&[("09:00", 20.0), ("10:00", 20.0), ("11:00", 20.0)]);
        let reference = reference_plan(&[("09:00", 20.0)]);
        let report = validate_against(&active, &reference);
        assert!(report.warnings.iter().any(|w| w.contains("event count")));
    }

    #[test]
    fn validation_against_empty_reference_is_empty() {
        let active = reference_plan(&[("09:00", 20.0)]);
        let report = validate_against(&active, &SchedulePlan::empty());
        assert!(report.matches.is_empty());
        assert!(report.deviations.is_empty());
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn validation_picks_wrap_aware_nearest() {
        let active = reference_plan(&[("23:58", 20.0)]);
        let reference = reference_plan(&[("00:03", 21.0), ("12:00", 60.0)]);
        let report = validate_against(&active, &reference);
        assert_eq!(report.matches[0].reference_time, tod("00:03"));
    }
}
