//! Sunrise/sunset calculation: a pure function of date + location, no I/O.
//!
//! Locations are opaque Australian postcodes resolved against an embedded
//! table; unknown codes fail with [`Error::LocationUnknown`]. Solar times use
//! the standard NOAA low-accuracy equations (minute-level agreement with
//! published almanac values), computed in UTC and projected into the
//! configured timezone.

use chrono::{Datelike, Duration, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::timefmt::TimeOfDay;

// ---------------------------------------------------------------------------
// Embedded postcode table
// ---------------------------------------------------------------------------

// postcode, locality, latitude, longitude
const POSTCODES: &[(&str, &str, f64, f64)] = &[
    ("0800", "Darwin", -12.4634, 130.8456),
    ("2000", "Sydney", -33.8688, 151.2093),
    ("2010", "Surry Hills", -33.8845, 151.2119),
    ("2060", "North Sydney", -33.8389, 151.2070),
    ("2150", "Parramatta", -33.8151, 151.0011),
    ("2250", "Gosford", -33.4270, 151.3430),
    ("2300", "Newcastle", -32.9283, 151.7817),
    ("2480", "Lismore", -28.8135, 153.2773),
    ("2500", "Wollongong", -34.4278, 150.8931),
    ("2600", "Canberra", -35.3081, 149.1245),
    ("2640", "Albury", -36.0737, 146.9135),
    ("2650", "Wagga Wagga", -35.1082, 147.3598),
    ("2795", "Bathurst", -33.4193, 149.5775),
    ("3000", "Melbourne", -37.8136, 144.9631),
    ("3056", "Brunswick", -37.7667, 144.9600),
    ("3150", "Glen Waverley", -37.8780, 145.1640),
    ("3220", "Geelong", -38.1499, 144.3617),
    ("3350", "Ballarat", -37.5622, 143.8503),
    ("3550", "Bendigo", -36.7570, 144.2794),
    ("4000", "Brisbane", -27.4698, 153.0251),
    ("4217", "Gold Coast", -28.0023, 153.4145),
    ("4350", "Toowoomba", -27.5598, 151.9507),
    ("4870", "Cairns", -16.9186, 145.7781),
    ("5000", "Adelaide", -34.9285, 138.6007),
    ("6000", "Perth", -31.9505, 115.8605),
    ("6160", "Fremantle", -32.0569, 115.7439),
    ("7000", "Hobart", -42.8821, 147.3272),
    ("7250", "Launceston", -41.4332, 147.1441),
];

pub fn lookup_postcode(postcode: &str) -> Option<(&'static str, f64, f64)> {
    POSTCODES
        .iter()
        .find(|(code, _, _, _)| *code == postcode)
        .map(|(_, name, lat, lon)| (*name, *lat, *lon))
}

// ---------------------------------------------------------------------------
// Daylight info
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DaylightInfo {
    pub date: NaiveDate,
    pub sunrise: TimeOfDay,
    pub sunset: TimeOfDay,
    pub day_length_minutes: f64,
}

// ---------------------------------------------------------------------------
// Calculator
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct DaylightCalculator {
    postcode: String,
    locality: &'static str,
    latitude: f64,
    longitude: f64,
    tz: Tz,
}

impl DaylightCalculator {
    pub fn new(postcode: &str, tz: Tz) -> Result<Self> {
        let (locality, latitude, longitude) =
            lookup_postcode(postcode).ok_or_else(|| Error::LocationUnknown(postcode.to_string()))?;
        Ok(Self {
            postcode: postcode.to_string(),
            locality,
            latitude,
            longitude,
            tz,
        })
    }

    pub fn postcode(&self) -> &str {
        &self.postcode
    }

    pub fn locality(&self) -> &str {
        self.locality
    }

    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    pub fn longitude(&self) -> f64 {
        self.longitude
    }

    /// Sunrise/sunset for a local date. Deterministic for identical inputs.
    /// In the (non-Australian) polar cases where the sun never crosses the
    /// horizon, a 06:00–18:00 civil day is substituted.
    pub fn daylight_for(&self, date: NaiveDate) -> DaylightInfo {
        match solar_event_minutes_utc(date, self.latitude, self.longitude) {
            Some((rise_utc_min, set_utc_min)) => {
                let midnight_utc = Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).unwrap());
                let sunrise_local = (midnight_utc
                    + Duration::seconds((rise_utc_min * 60.0).round() as i64))
                .with_timezone(&self.tz);
                let sunset_local = (midnight_utc
                    + Duration::seconds((set_utc_min * 60.0).round() as i64))
                .with_timezone(&self.tz);

                DaylightInfo {
                    date,
                    sunrise: TimeOfDay::from_naive(sunrise_local.time()),
                    sunset: TimeOfDay::from_naive(sunset_local.time()),
                    day_length_minutes: set_utc_min - rise_utc_min,
                }
            }
            None => DaylightInfo {
                date,
                sunrise: TimeOfDay::from_hm(6, 0).unwrap(),
                sunset: TimeOfDay::from_hm(18, 0).unwrap(),
                day_length_minutes: 12.0 * 60.0,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Solar position (NOAA low-accuracy equations)
// ---------------------------------------------------------------------------

/// Sunrise and sunset as minutes past 00:00 UTC on `date`, or `None` when the
/// sun never crosses the horizon at this latitude on this date.
fn solar_event_minutes_utc(date: NaiveDate, latitude: f64, longitude: f64) -> Option<(f64, f64)> {
    let day_of_year = date.ordinal() as f64;
    let lat_rad = latitude.to_radians();

    // Fractional year at local solar noon, radians.
    let gamma = 2.0 * std::f64::consts::PI / 365.0 * (day_of_year - 1.0);

    // Equation of time (minutes) and solar declination (radians).
    let eqtime = 229.18
        * (0.000075 + 0.001868 * gamma.cos()
            - 0.032077 * gamma.sin()
            - 0.014615 * (2.0 * gamma).cos()
            - 0.040849 * (2.0 * gamma).sin());
    let decl = 0.006918 - 0.399912 * gamma.cos() + 0.070257 * gamma.sin()
        - 0.006758 * (2.0 * gamma).cos()
        + 0.000907 * (2.0 * gamma).sin()
        - 0.002697 * (3.0 * gamma).cos()
        + 0.00148 * (3.0 * gamma).sin();

    // Hour angle at the standard refraction-corrected zenith of 90.833°.
    let zenith = 90.833_f64.to_radians();
    let cos_ha = zenith.cos() / (lat_rad.cos() * decl.cos()) - lat_rad.tan() * decl.tan();
    if !(-1.0..=1.0).contains(&cos_ha) {
        return None;
    }
    let ha_deg = cos_ha.acos().to_degrees();

    let sunrise = 720.0 - 4.0 * (longitude + ha_deg) - eqtime;
    let sunset = 720.0 - 4.0 * (longitude - ha_deg) - eqtime;
    Some((sunrise, sunset))
}

// ===========================================================================
// Tests
// ===========================================================================
