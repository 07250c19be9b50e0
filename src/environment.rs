//! Aggregation of the environmental data sources.
//!
//! One poller task refreshes the cache; everyone else reads copies. The
//! weather provider applies its own fetch gating, so the poller can tick
//! frequently without hammering the feed.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::clock::SharedClock;
use crate::daylight::{DaylightCalculator, DaylightInfo};
use crate::weather::{EnvironmentalSample, WeatherProvider};

/// Poller cadence. Cheap: daylight is pure math and weather fetches are
/// gated internally by the provider.
const POLL_TICK_SECS: u64 = 60;

/// Copy-on-read view of current environmental conditions.
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct EnvironmentSnapshot {
    pub temperature_c: Option<f64>,
    pub humidity_pct: Option<f64>,
    pub daylight: Option<DaylightInfo>,
    pub station_id: Option<String>,
    pub station_name: Option<String>,
    pub adaptation_enabled: bool,
    pub sample_time: Option<DateTime<Utc>>,
}

pub struct EnvironmentalService {
    daylight: Option<DaylightCalculator>,
    weather: Option<WeatherProvider>,
    clock: SharedClock,
    cache: RwLock<EnvironmentSnapshot>,
}

impl EnvironmentalService {
    pub fn new(
        daylight: Option<DaylightCalculator>,
        weather: Option<WeatherProvider>,
        clock: SharedClock,
    ) -> Self {
        let adaptation_enabled = daylight.is_some() || weather.is_some();
        Self {
            daylight,
            weather,
            clock,
            cache: RwLock::new(EnvironmentSnapshot {
                adaptation_enabled,
                ..Default::default()
            }),
        }
    }

    /// Service for a system running without adaptation (e.g. after a
    /// `LocationUnknown` at startup).
    pub fn disabled(clock: SharedClock) -> Self {
        Self::new(None, None, clock)
    }

    pub fn adaptation_enabled(&self) -> bool {
        self.daylight.is_some() || self.weather.is_some()
    }

    /// Today's daylight, straight from the pure calculator.
    pub fn daylight_today(&self) -> Option<DaylightInfo> {
        self.daylight
            .as_ref()
            .map(|d| d.daylight_for(self.clock.today()))
    }

    /// Recompute the cached snapshot. Single writer: only the poller task and
    /// startup call this.
    pub async fn refresh(&self) -> EnvironmentSnapshot {
        let daylight = self.daylight_today();

        let sample = match &self.weather {
            Some(provider) => Some(provider.sample(Utc::now()).await),
            None => None,
        };

        let snapshot = EnvironmentSnapshot {
            temperature_c: sample.as_ref().and_then(|s| s.temperature_c),
            humidity_pct: sample.as_ref().and_then(|s| s.humidity_pct),
            daylight,
            station_id: sample.as_ref().and_then(|s| s.station_id.clone()),
            station_name: sample.as_ref().and_then(|s| s.station_name.clone()),
            adaptation_enabled: self.adaptation_enabled(),
            sample_time: sample.as_ref().map(|s| s.sample_time),
        };

        *self.cache.write().await = snapshot.clone();
        debug!(
            temperature_c = ?snapshot.temperature_c,
            humidity_pct = ?snapshot.humidity_pct,
            "environment refreshed"
        );
        snapshot
    }

    /// Coherent copy of the latest snapshot; never a torn mix of old and new
    /// fields.
    pub async fn snapshot(&self) -> EnvironmentSnapshot {
        self.cache.read().await.clone()
    }

    /// The latest weather observation as a sample, for the synthesizer.
    pub async fn latest_sample(&self) -> EnvironmentalSample {
        let cached = self.cache.read().await.clone();
        EnvironmentalSample {
            temperature_c: cached.temperature_c,
            humidity_pct: cached.humidity_pct,
            sample_time: cached.sample_time.unwrap_or_else(Utc::now),
            station_id: cached.station_id,
            station_name: cached.station_name,
        }
    }

    /// Run the refresh loop until the shutdown signal flips.
    pub fn spawn_poller(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let service = self;
        tokio::spawn(async move {
            info!("environment poller started");
            loop {
                service.refresh().await;
                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_secs(POLL_TICK_SECS)) => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("environment poller stopped");
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use chrono::TimeZone;

    fn clock() -> SharedClock {
        Arc::new(TestClock::starting_at(
            Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap(),
            chrono_tz::Australia::Sydney,
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_service_reports_nothing() {
        let service = EnvironmentalService::disabled(clock());
        let snap = service.refresh().await;
        assert!(!snap.adaptation_enabled);
        assert_eq!(snap.temperature_c, None);
        assert_eq!(snap.humidity_pct, None);
        assert!(snap.daylight.is_none());
        assert!(snap.station_id.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn daylight_only_service_provides_sun_times() {
        let calc = DaylightCalculator::new("2000", chrono_tz::Australia::Sydney).unwrap();
        let service = EnvironmentalService::new(Some(calc), None, clock());

        let snap = service.refresh().await;
        assert!(snap.adaptation_enabled);
        let daylight = snap.daylight.expect("daylight computed");
        assert!(daylight.day_length_minutes > 0.0);
        // No weather source: temperature stays unknown.
        assert_eq!(snap.temperature_c, None);
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_is_copy_on_read() {
        let service = EnvironmentalService::disabled(clock());
        service.refresh().await;
        let a = service.snapshot().await;
        let b = service.snapshot().await;
        assert_eq!(a, b);
    }

    #[tokio::test(start_paused = true)]
    async fn latest_sample_mirrors_cache() {
        let service = EnvironmentalService::disabled(clock());
        service.refresh().await;
        let sample = service.latest_sample().await;
        assert_eq!(sample.temperature_c, None);
        assert_eq!(sample.humidity_pct, None);
    }

    #[tokio::test(start_paused = true)]
    async fn poller_stops_on_shutdown() {
        let service = Arc::new(EnvironmentalService::disabled(clock()));
        let (tx, rx) = watch::channel(false);
        let handle = service.clone().spawn_poller(rx);

        tokio::time::sleep(std::time::Duration::from_secs(2)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
