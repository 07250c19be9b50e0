//! Minute-resolution time-of-day values and HH:MM parsing/formatting.
//!
//! All schedule times are wall-clock HH:MM in the configured timezone.
//! Parsing accepts 24-hour input ("06:05", "6:05") and 12-hour input with an
//! am/pm suffix ("6:05 pm"); formatting always emits zero-padded 24-hour form.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveTime;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub const MINUTES_PER_DAY: u16 = 24 * 60;

/// A time of day with minute resolution, stored as minutes from midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeOfDay {
    minutes: u16,
}

impl TimeOfDay {
    pub fn from_hm(hour: u8, minute: u8) -> Option<Self> {
        if hour >= 24 || minute >= 60 {
            return None;
        }
        Some(Self {
            minutes: hour as u16 * 60 + minute as u16,
        })
    }

    /// Build from minutes past midnight, wrapping values ≥ 24 h.
    pub fn from_minutes(minutes: u32) -> Self {
        Self {
            minutes: (minutes % MINUTES_PER_DAY as u32) as u16,
        }
    }

    pub fn hour(&self) -> u8 {
        (self.minutes / 60) as u8
    }

    pub fn minute(&self) -> u8 {
        (self.minutes % 60) as u8
    }

    pub fn total_minutes(&self) -> u16 {
        self.minutes
    }

    pub fn to_naive(&self) -> NaiveTime {
        NaiveTime::from_hms_opt(self.hour() as u32, self.minute() as u32, 0)
            .expect("minutes are range-checked at construction")
    }

    pub fn from_naive(t: NaiveTime) -> Self {
        use chrono::Timelike;
        Self {
            minutes: (t.hour() * 60 + t.minute()) as u16,
        }
    }

    /// Minutes from `self` forward to `other`, wrapping past midnight.
    pub fn minutes_until(&self, other: TimeOfDay) -> u16 {
        if other.minutes >= self.minutes {
            other.minutes - self.minutes
        } else {
            MINUTES_PER_DAY - self.minutes + other.minutes
        }
    }

    /// Wrap-aware distance in minutes between two times (≤ 12 h).
    pub fn distance(&self, other: TimeOfDay) -> u16 {
        let d = self.minutes_until(other);
        d.min(MINUTES_PER_DAY - d)
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour(), self.minute())
    }
}

impl FromStr for TimeOfDay {
    type Err = ParseTimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_time(s).ok_or_else(|| ParseTimeError(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseTimeError(pub String);

impl fmt::Display for ParseTimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid time of day '{}' (expected HH:MM)", self.0)
    }
}

impl std::error::Error for ParseTimeError {}

/// Parse "HH:MM", "H:MM", or "H:MM am|pm". Returns `None` on any malformed
/// input rather than guessing.
fn parse_time(input: &str) -> Option<TimeOfDay> {
    let trimmed = input.trim();
    let lower = trimmed.to_ascii_lowercase();

    let (clock_part, meridiem) = if let Some(rest) = lower.strip_suffix("pm") {
        (rest.trim_end(), Some(true))
    } else if let Some(rest) = lower.strip_suffix("am") {
        (rest.trim_end(), Some(false))
    } else {
        (lower.as_str(), None)
    };

    let (h_str, m_str) = clock_part.split_once(':')?;
    let mut hour: u8 = h_str.trim().parse().ok()?;
    let minute: u8 = m_str.trim().parse().ok()?;

    match meridiem {
        Some(true) => {
            if hour == 0 || hour > 12 {
                return None;
            }
            if hour != 12 {
                hour += 12;
            }
        }
        Some(false) => {
            if hour == 0 || hour > 12 {
                return None;
            }
            if hour == 12 {
                hour = 0;
            }
        }
        None => {}
    }

    TimeOfDay::from_hm(hour, minute)
}

impl Serialize for TimeOfDay {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TimeOfDay {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_24_hour() {
        assert_eq!("06:30".parse::<TimeOfDay>().unwrap(), TimeOfDay::from_hm(6, 30).unwrap());
        assert_eq!("23:59".parse::<TimeOfDay>().unwrap(), TimeOfDay::from_hm(23, 59).unwrap());
        assert_eq!("00:00".parse::<TimeOfDay>().unwrap(), TimeOfDay::from_hm(0, 0).unwrap());
    }

    #[test]
    fn parses_unpadded_hour() {
        assert_eq!("6:05".parse::<TimeOfDay>().unwrap(), TimeOfDay::from_hm(6, 5).unwrap());
    }

    #[test]
    fn parses_am_pm() {
        assert_eq!("6:30 pm".parse::<TimeOfDay>().unwrap(), TimeOfDay::from_hm(18, 30).unwrap());
        assert_eq!("6:30am".parse::<TimeOfDay>().unwrap(), TimeOfDay::from_hm(6, 30).unwrap());
        assert_eq!("12:00 am".parse::<TimeOfDay>().unwrap(), TimeOfDay::from_hm(0, 0).unwrap());
        assert_eq!("12:00 PM".parse::<TimeOfDay>().unwrap(), TimeOfDay::from_hm(12, 0).unwrap());
    }

    #[test]
    fn rejects_malformed() {
        for bad in ["24:00", "12:60", "noon", "12", "13:00 pm", "0:30 am", ""] {
            assert!(bad.parse::<TimeOfDay>().is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn format_parse_round_trip_normalizes() {
        // format(parse(s)) == normalize(s) for valid 24-hour input
        for (input, normalized) in [("6:05", "06:05"), ("06:05", "06:05"), ("18:00", "18:00")] {
            let parsed: TimeOfDay = input.parse().unwrap();
            assert_eq!(parsed.to_string(), normalized);
        }
    }

    #[test]
    fn round_trip_every_valid_minute() {
        for h in 0..24u8 {
            for m in 0..60u8 {
                let s = format!("{h:02}:{m:02}");
                let parsed: TimeOfDay = s.parse().unwrap();
                assert_eq!(parsed.to_string(), s);
            }
        }
    }

    #[test]
    fn minutes_until_wraps_midnight() {
        let late = TimeOfDay::from_hm(23, 58).unwrap();
        let early = TimeOfDay::from_hm(0, 3).unwrap();
        assert_eq!(late.minutes_until(early), 5);
        assert_eq!(early.minutes_until(late), MINUTES_PER_DAY - 5);
    }

    #[test]
    fn distance_is_symmetric_and_short_way_round() {
        let a = TimeOfDay::from_hm(23, 0).unwrap();
        let b = TimeOfDay::from_hm(1, 0).unwrap();
        assert_eq!(a.distance(b), 120);
        assert_eq!(b.distance(a), 120);
    }

    #[test]
    fn from_minutes_wraps() {
        assert_eq!(TimeOfDay::from_minutes(1445), TimeOfDay::from_hm(0, 5).unwrap());
    }

    #[test]
    fn serde_as_string() {
        let t = TimeOfDay::from_hm(7, 45).unwrap();
        assert_eq!(serde_json::to_string(&t).unwrap(), "\"07:45\"");
        let back: TimeOfDay = serde_json::from_str("\"07:45\"").unwrap();
        assert_eq!(back, t);
    }
}
