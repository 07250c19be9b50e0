//! Status snapshot records published to the control surface.
//!
//! The worker publishes [`StatusSnapshot`] through a watch channel; readers
//! clone the latest record without taking any scheduler lock. The web layer
//! combines it with device and environment blocks into [`FullStatus`].

use chrono::DateTime;
use chrono_tz::Tz;
use serde::Serialize;

use crate::device::DeviceSnapshot;
use crate::plan::{Cycle, Period};
use crate::timefmt::TimeOfDay;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerState {
    Waiting,
    Flood,
    Drain,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub running: bool,
    pub state: SchedulerState,
    pub strategy: &'static str,
    pub next_event_time: Option<DateTime<Tz>>,
    pub time_until_next_secs: Option<i64>,
    pub current_period: Option<Period>,
    pub last_cycle: Option<Cycle>,
}

impl StatusSnapshot {
    pub fn stopped(strategy: &'static str) -> Self {
        Self {
            running: false,
            state: SchedulerState::Stopped,
            strategy,
            next_event_time: None,
            time_until_next_secs: None,
            current_period: None,
            last_cycle: None,
        }
    }
}

/// Environment block of the status surface.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnvironmentStatus {
    pub temperature_c: Option<f64>,
    pub humidity_pct: Option<f64>,
    pub station_id: Option<String>,
    pub station_name: Option<String>,
    pub sunrise: Option<TimeOfDay>,
    pub sunset: Option<TimeOfDay>,
    pub adaptation_enabled: bool,
    pub adaptive_enabled: bool,
}

/// The complete status response: scheduler, device and environment.
#[derive(Debug, Clone, Serialize)]
pub struct FullStatus {
    #[serde(flatten)]
    pub scheduler: StatusSnapshot,
    pub device: DeviceSnapshot,
    pub environment: EnvironmentStatus,
}

// ===========================================================================
// Tests
// ===========================================================================
