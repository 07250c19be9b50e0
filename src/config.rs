//! TOML configuration: raw file schema plus an explicit validator.
//!
//! The raw structs mirror the file; [`validate`] turns them into a normalized
//! [`AppConfig`] or an error enumerating every violation found. Nothing else
//! in the system reads raw configuration.

use anyhow::Context;
use chrono_tz::Tz;
use serde::Deserialize;

use crate::adaptive::{
    default_humidity_bands, default_temperature_bands, default_tod_frequencies, AdaptiveSettings,
    Band, Constraints, PeriodValues,
};
use crate::error::Error;
use crate::scheduler::IntervalSpec;
use crate::timefmt::TimeOfDay;

const DEFAULT_TIMEZONE: &str = "Australia/Sydney";

// ---------------------------------------------------------------------------
// Raw file schema
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
pub struct RawConfig {
    #[serde(default)]
    pub devices: RawDevices,
    pub growing_system: Option<RawGrowingSystem>,
    pub schedule: Option<RawSchedule>,
    #[serde(default)]
    pub web: RawWeb,
}

#[derive(Debug, Deserialize, Default)]
pub struct RawDevices {
    #[serde(default)]
    pub devices: Vec<RawDevice>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RawDevice {
    pub device_id: String,
    pub name: String,
    #[serde(default = "default_brand")]
    pub brand: String,
    #[serde(rename = "type", default = "default_device_type")]
    pub device_type: String,
    pub address: String,
    pub credentials: Option<RawCredentials>,
    #[serde(default = "default_true")]
    pub auto_discovery: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RawCredentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct RawGrowingSystem {
    #[serde(rename = "type", default = "default_growing_type")]
    pub system_type: String,
    pub primary_device_id: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RawSchedule {
    #[serde(rename = "type")]
    pub schedule_type: String,
    pub flood_minutes: Option<f64>,
    pub drain_minutes: Option<f64>,
    pub interval_minutes: Option<f64>,
    pub active_hours: Option<RawActiveHours>,
    #[serde(default)]
    pub cycles: Vec<RawCycle>,
    pub adaptation: Option<RawAdaptation>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RawActiveHours {
    pub start: String,
    pub end: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RawCycle {
    pub on_time: String,
    pub off_minutes: f64,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RawAdaptation {
    #[serde(default)]
    pub enabled: bool,
    pub location: Option<RawLocation>,
    pub temperature: Option<RawTemperature>,
    pub daylight: Option<RawDaylight>,
    pub adaptive: Option<RawAdaptive>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RawLocation {
    pub postcode: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RawTemperature {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_source")]
    pub source: String,
    #[serde(default = "default_station")]
    pub station_id: String,
    #[serde(default = "default_update_interval")]
    pub update_interval_minutes: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RawDaylight {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub shift_schedule: bool,
    pub period_factors: Option<RawPeriodValues>,
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct RawPeriodValues {
    pub morning: f64,
    pub day: f64,
    pub evening: f64,
    pub night: f64,
}

impl RawPeriodValues {
    fn into_values(self) -> PeriodValues {
        PeriodValues {
            morning: self.morning,
            day: self.day,
            evening: self.evening,
            night: self.night,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RawAdaptive {
    #[serde(default)]
    pub enabled: bool,
    pub tod_frequencies: Option<RawPeriodValues>,
    pub temperature_bands: Option<Vec<RawBand>>,
    pub humidity_bands: Option<Vec<RawBand>>,
    pub constraints: Option<RawConstraints>,
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct RawBand {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub factor: f64,
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct RawConstraints {
    #[serde(default = "default_min_wait")]
    pub min_wait: f64,
    #[serde(default = "default_max_wait")]
    pub max_wait: f64,
    #[serde(default = "default_min_flood")]
    pub min_flood: f64,
    #[serde(default = "default_max_flood")]
    pub max_flood: f64,
}

#[derive(Debug, Deserialize)]
pub struct RawWeb {
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for RawWeb {
    fn default() -> Self {
        Self { port: default_port() }
    }
}

fn default_brand() -> String {
    "generic".into()
}
fn default_device_type() -> String {
    "power_controller".into()
}
fn default_growing_type() -> String {
    "flood_drain".into()
}
fn default_timezone() -> String {
    DEFAULT_TIMEZONE.into()
}
fn default_source() -> String {
    "bom".into()
}
fn default_station() -> String {
    "auto".into()
}
fn default_update_interval() -> u64 {
    60
}
fn default_true() -> bool {
    true
}
fn default_port() -> u16 {
    8080
}
fn default_min_wait() -> f64 {
    5.0
}
fn default_max_wait() -> f64 {
    180.0
}
fn default_min_flood() -> f64 {
    2.0
}
fn default_max_flood() -> f64 {
    15.0
}

/// Read and parse a TOML config file.
pub fn load(path: &str) -> anyhow::Result<RawConfig> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: RawConfig =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    Ok(config)
}

// ---------------------------------------------------------------------------
// Normalized configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub device: DeviceSpec,
    pub schedule: ScheduleSpec,
    pub adaptation: Option<AdaptationSpec>,
    pub timezone: Tz,
    pub web_port: u16,
}

#[derive(Debug, Clone)]
pub struct DeviceSpec {
    pub device_id: String,
    pub name: String,
    pub brand: String,
    pub address: String,
    pub credentials: Option<(String, String)>,
    pub auto_discovery: bool,
}

#[derive(Debug, Clone)]
pub enum ScheduleSpec {
    Interval(IntervalSpec),
    TimeOfDay {
        flood_minutes: f64,
        cycles: Vec<(TimeOfDay, f64)>,
    },
    Nft,
}

#[derive(Debug, Clone)]
pub struct AdaptationSpec {
    pub location: Option<LocationSpec>,
    pub temperature: Option<TemperatureSpec>,
    pub daylight_enabled: bool,
    /// Shift a literal time-of-day schedule to track sunrise.
    pub shift_schedule: bool,
    /// Some when `adaptive.enabled = true`.
    pub adaptive: Option<AdaptiveSettings>,
}

#[derive(Debug, Clone)]
pub struct LocationSpec {
    pub postcode: String,
    pub timezone: Tz,
}

#[derive(Debug, Clone)]
pub struct TemperatureSpec {
    pub station_id: String,
    pub update_interval_minutes: u64,
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a raw config into a normalized one, or report every violation.
pub fn validate(raw: RawConfig) -> crate::error::Result<AppConfig> {
    let mut issues: Vec<String> = Vec::new();

    // -- Primary device -----------------------------------------------------
    let device = match &raw.growing_system {
        None => {
            issues.push("growing_system section is required".into());
            None
        }
        Some(gs) => {
            if !matches!(gs.system_type.as_str(), "flood_drain" | "nft") {
                issues.push(format!("growing_system.type '{}' is unknown", gs.system_type));
            }
            match raw
                .devices
                .devices
                .iter()
                .find(|d| d.device_id == gs.primary_device_id)
            {
                Some(d) => {
                    if d.device_type != "power_controller" {
                        issues.push(format!(
                            "primary device '{}' must be a power_controller, got '{}'",
                            d.device_id, d.device_type
                        ));
                    }
                    Some(DeviceSpec {
                        device_id: d.device_id.clone(),
                        name: d.name.clone(),
                        brand: d.brand.clone(),
                        address: d.address.clone(),
                        credentials: d
                            .credentials
                            .as_ref()
                            .map(|c| (c.username.clone(), c.password.clone())),
                        auto_discovery: d.auto_discovery,
                    })
                }
                None => {
                    issues.push(format!(
                        "primary_device_id '{}' does not match any configured device",
                        gs.primary_device_id
                    ));
                    None
                }
            }
        }
    };

    // -- Schedule -----------------------------------------------------------
    let nft_system = raw
        .growing_system
        .as_ref()
        .is_some_and(|gs| gs.system_type == "nft");

    let (schedule, adaptation, timezone) = match &raw.schedule {
        None => {
            issues.push("schedule section is required".into());
            (None, None, None)
        }
        Some(sched) => validate_schedule(sched, nft_system, &mut issues),
    };

    if !issues.is_empty() {
        return Err(Error::configuration(issues));
    }

    Ok(AppConfig {
        device: device.expect("issues were empty"),
        schedule: schedule.expect("issues were empty"),
        adaptation,
        timezone: timezone.unwrap_or(chrono_tz::Australia::Sydney),
        web_port: raw.web.port,
    })
}

fn validate_schedule(
    sched: &RawSchedule,
    nft_system: bool,
    issues: &mut Vec<String>,
) -> (Option<ScheduleSpec>, Option<AdaptationSpec>, Option<Tz>) {
    let adaptation_raw = sched.adaptation.as_ref();
    let adaptation_enabled = adaptation_raw.is_some_and(|a| a.enabled);
    let adaptive_enabled = adaptation_enabled
        && adaptation_raw.is_some_and(|a| a.adaptive.as_ref().is_some_and(|ad| ad.enabled));

    let mut timezone: Option<Tz> = None;
    let mut adaptation: Option<AdaptationSpec> = None;

    if let Some(adapt) = adaptation_raw {
        if adapt.enabled {
            let (spec, tz) = validate_adaptation(adapt, sched, issues);
            adaptation = Some(spec);
            timezone = tz;
        } else if adapt.adaptive.as_ref().is_some_and(|a| a.enabled) {
            issues.push("adaptation.adaptive.enabled requires adaptation.enabled".into());
        }
    }

    let schedule = if nft_system || sched.schedule_type == "nft" {
        Some(ScheduleSpec::Nft)
    } else {
        match sched.schedule_type.as_str() {
            "interval" => {
                let spec = IntervalSpec {
                    flood_minutes: sched.flood_minutes.unwrap_or(15.0),
                    drain_minutes: sched.drain_minutes.unwrap_or(30.0),
                    interval_minutes: sched.interval_minutes.unwrap_or(120.0),
                    active_hours: validate_active_hours(sched.active_hours.as_ref(), issues),
                };
                if let Err(Error::Configuration { issues: nested }) = spec.validate() {
                    issues.extend(nested);
                }
                Some(ScheduleSpec::Interval(spec))
            }
            "time_based" => {
                let flood_minutes = sched.flood_minutes.unwrap_or(2.0);
                if flood_minutes <= 0.0 {
                    issues.push("schedule.flood_minutes must be positive".into());
                }
                let mut cycles: Vec<(TimeOfDay, f64)> = Vec::new();
                for cycle in &sched.cycles {
                    match cycle.on_time.parse::<TimeOfDay>() {
                        Ok(t) => cycles.push((t, cycle.off_minutes)),
                        Err(e) => issues.push(format!("schedule.cycles: {e}")),
                    }
                }
                // With adaptive enabled the literal list is only an analytic
                // reference; without it the list drives execution.
                if cycles.is_empty() && !adaptive_enabled {
                    issues.push("time_based schedule needs at least one cycle".into());
                }
                Some(ScheduleSpec::TimeOfDay {
                    flood_minutes,
                    cycles,
                })
            }
            other => {
                issues.push(format!("schedule.type '{other}' is unknown"));
                None
            }
        }
    };

    (schedule, adaptation, timezone)
}

fn validate_active_hours(
    raw: Option<&RawActiveHours>,
    issues: &mut Vec<String>,
) -> Option<(TimeOfDay, TimeOfDay)> {
    let raw = raw?;
    let start = raw.start.parse::<TimeOfDay>();
    let end = raw.end.parse::<TimeOfDay>();
    match (start, end) {
        (Ok(s), Ok(e)) => Some((s, e)),
        (s, e) => {
            if let Err(err) = s {
                issues.push(format!("schedule.active_hours.start: {err}"));
            }
            if let Err(err) = e {
                issues.push(format!("schedule.active_hours.end: {err}"));
            }
            None
        }
    }
}

pub(crate) fn validate_adaptation(
    adapt: &RawAdaptation,
    sched: &RawSchedule,
    issues: &mut Vec<String>,
) -> (AdaptationSpec, Option<Tz>) {
    let mut timezone = None;

    let location = adapt.location.as_ref().and_then(|loc| {
        match loc.timezone.parse::<Tz>() {
            Ok(tz) => {
                timezone = Some(tz);
                Some(LocationSpec {
                    postcode: loc.postcode.clone(),
                    timezone: tz,
                })
            }
            Err(_) => {
                issues.push(format!(
                    "adaptation.location.timezone '{}' is not a known timezone",
                    loc.timezone
                ));
                None
            }
        }
    });

    let temperature = adapt.temperature.as_ref().and_then(|t| {
        if !t.enabled {
            return None;
        }
        if t.source != "bom" {
            issues.push(format!(
                "adaptation.temperature.source '{}' is unsupported",
                t.source
            ));
        }
        if t.update_interval_minutes == 0 {
            issues.push("adaptation.temperature.update_interval_minutes must be positive".into());
        }
        Some(TemperatureSpec {
            station_id: t.station_id.clone(),
            update_interval_minutes: t.update_interval_minutes,
        })
    });

    let daylight_enabled = adapt.daylight.as_ref().is_some_and(|d| d.enabled);
    let shift_schedule = adapt
        .daylight
        .as_ref()
        .is_some_and(|d| d.enabled && d.shift_schedule);
    let period_factors = adapt
        .daylight
        .as_ref()
        .filter(|d| d.enabled)
        .and_then(|d| d.period_factors)
        .map(RawPeriodValues::into_values);

    if let Some(factors) = &period_factors {
        for (name, v) in [
            ("morning", factors.morning),
            ("day", factors.day),
            ("evening", factors.evening),
            ("night", factors.night),
        ] {
            if v <= 0.0 {
                issues.push(format!("adaptation.daylight.period_factors.{name} must be positive"));
            }
        }
    }

    let adaptive = adapt
        .adaptive
        .as_ref()
        .filter(|a| a.enabled)
        .map(|a| validate_adaptive(a, sched, period_factors, issues));

    (
        AdaptationSpec {
            location,
            temperature,
            daylight_enabled,
            shift_schedule,
            adaptive,
        },
        timezone,
    )
}

fn validate_adaptive(
    raw: &RawAdaptive,
    sched: &RawSchedule,
    period_factors: Option<PeriodValues>,
    issues: &mut Vec<String>,
) -> AdaptiveSettings {
    let tod_frequencies = raw
        .tod_frequencies
        .map(RawPeriodValues::into_values)
        .unwrap_or_else(default_tod_frequencies);
    for (name, v) in [
        ("morning", tod_frequencies.morning),
        ("day", tod_frequencies.day),
        ("evening", tod_frequencies.evening),
        ("night", tod_frequencies.night),
    ] {
        if v <= 0.0 {
            issues.push(format!("adaptive.tod_frequencies.{name} must be positive"));
        }
    }

    let temperature_bands = validate_bands(
        "adaptive.temperature_bands",
        raw.temperature_bands.as_deref(),
        default_temperature_bands,
        issues,
    );
    let humidity_bands = validate_bands(
        "adaptive.humidity_bands",
        raw.humidity_bands.as_deref(),
        default_humidity_bands,
        issues,
    );

    let c = raw.constraints.unwrap_or(RawConstraints {
        min_wait: default_min_wait(),
        max_wait: default_max_wait(),
        min_flood: default_min_flood(),
        max_flood: default_max_flood(),
    });
    if c.min_wait <= 0.0 || c.min_flood <= 0.0 {
        issues.push("adaptive.constraints values must be positive".into());
    }
    if c.min_wait > c.max_wait {
        issues.push("adaptive.constraints: min_wait exceeds max_wait".into());
    }
    if c.min_flood > c.max_flood {
        issues.push("adaptive.constraints: min_flood exceeds max_flood".into());
    }

    AdaptiveSettings {
        tod_frequencies,
        temperature_bands,
        humidity_bands,
        period_factors,
        constraints: Constraints {
            min_wait: c.min_wait,
            max_wait: c.max_wait,
            min_flood: c.min_flood,
            max_flood: c.max_flood,
            flood_minutes: sched.flood_minutes.unwrap_or(2.0),
        },
    }
}

/// Bands must have positive factors, be ordered, and cover the real line
/// with no gaps: the first band open below, the last open above, and each
/// boundary shared exactly.
fn validate_bands(
    name: &str,
    raw: Option<&[RawBand]>,
    defaults: fn() -> Vec<Band>,
    issues: &mut Vec<String>,
) -> Vec<Band> {
    let Some(raw) = raw else {
        return defaults();
    };

    let bands: Vec<Band> = raw
        .iter()
        .map(|b| Band {
            min: b.min,
            max: b.max,
            factor: b.factor,
        })
        .collect();

    if bands.is_empty() {
        issues.push(format!("{name} must not be empty"));
        return defaults();
    }

    for band in &bands {
        if band.factor <= 0.0 {
            issues.push(format!("{name}: factor must be positive"));
        }
    }
    if bands[0].min.is_some() {
        issues.push(format!("{name}: first band must be open below (no min)"));
    }
    if bands[bands.len() - 1].max.is_some() {
        issues.push(format!("{name}: last band must be open above (no max)"));
    }
    for pair in bands.windows(2) {
        match (pair[0].max, pair[1].min) {
            (Some(prev_max), Some(next_min)) if prev_max == next_min => {}
            _ => {
                issues.push(format!(
                    "{name}: bands must share boundaries with no gaps"
                ));
                break;
            }
        }
    }

    bands
}

// ===========================================================================
// Tests
// ===========================================================================
