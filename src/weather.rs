//! Outdoor temperature/humidity from a BOM-style observation feed.
//!
//! The provider polls `<base>.<station>.json` and reads
//! `observations.data[0].air_temp` / `rel_hum`. Fetch cadence is bounded both
//! by the configured update interval and by the origin's 30-minute minimum
//! refresh window; between polls the last good sample is served. A sample
//! survives fetch failures for 4× the configured interval, after which the
//! fields report unknown.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Origin-specified minimum refresh interval (minutes).
const ORIGIN_MIN_REFRESH_MINUTES: i64 = 30;

/// Hard per-request timeout.
const REQUEST_TIMEOUT_SECS: u64 = 10;

/// How many configured intervals a cached sample stays valid after the last
/// successful fetch.
const STALENESS_MULTIPLIER: i64 = 4;

/// The feed rejects anonymous clients.
const USER_AGENT: &str = "floodhub/0.3 weather poller";

pub const DEFAULT_FEED_BASE: &str = "http://www.bom.gov.au/fwo/IDN60801/IDN60801";

/// Station used when neither a station id nor a location is configured.
const DEFAULT_STATION_ID: &str = "94768";

// ---------------------------------------------------------------------------
// Sample
// ---------------------------------------------------------------------------

/// One observation of outdoor conditions. `None` fields mean unknown.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnvironmentalSample {
    pub temperature_c: Option<f64>,
    pub humidity_pct: Option<f64>,
    pub sample_time: DateTime<Utc>,
    pub station_id: Option<String>,
    pub station_name: Option<String>,
}

// ---------------------------------------------------------------------------
// Station table
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct Station {
    pub id: &'static str,
    pub name: &'static str,
    pub latitude: f64,
    pub longitude: f64,
}

const STATIONS: &[Station] = &[
    Station { id: "94768", name: "Sydney Observatory Hill", latitude: -33.8597, longitude: 151.2053 },
    Station { id: "94767", name: "Sydney Airport", latitude: -33.9399, longitude: 151.1753 },
    Station { id: "94765", name: "Canterbury Racecourse", latitude: -33.9047, longitude: 151.1100 },
    Station { id: "94755", name: "Parramatta North", latitude: -33.8000, longitude: 151.0000 },
    Station { id: "94752", name: "Bankstown Airport", latitude: -33.9244, longitude: 150.9883 },
    Station { id: "94750", name: "Camden Airport", latitude: -34.0400, longitude: 150.6869 },
    Station { id: "94746", name: "Richmond RAAF", latitude: -33.6006, longitude: 150.7808 },
    Station { id: "94744", name: "Penrith Lakes", latitude: -33.7167, longitude: 150.6833 },
    Station { id: "94726", name: "Newcastle Nobbys", latitude: -32.9200, longitude: 151.7900 },
    Station { id: "94719", name: "Williamtown RAAF", latitude: -32.7944, longitude: 151.8344 },
    Station { id: "94910", name: "Canberra Airport", latitude: -35.3049, longitude: 149.2014 },
    Station { id: "95936", name: "Melbourne Olympic Park", latitude: -37.8255, longitude: 144.9816 },
    Station { id: "95904", name: "Melbourne Airport", latitude: -37.6733, longitude: 144.8433 },
    Station { id: "95866", name: "Geelong Racecourse", latitude: -38.1500, longitude: 144.3500 },
    Station { id: "95832", name: "Ballarat Aerodrome", latitude: -37.5000, longitude: 143.8167 },
    Station { id: "94578", name: "Brisbane", latitude: -27.4698, longitude: 153.0251 },
    Station { id: "94576", name: "Brisbane Airport", latitude: -27.3842, longitude: 153.1175 },
    Station { id: "94552", name: "Gold Coast Seaway", latitude: -27.9390, longitude: 153.4260 },
    Station { id: "94527", name: "Toowoomba Airport", latitude: -27.5500, longitude: 151.9167 },
    Station { id: "94675", name: "Adelaide Kent Town", latitude: -34.9211, longitude: 138.6216 },
    Station { id: "94608", name: "Perth Metro", latitude: -31.9192, longitude: 115.8728 },
    Station { id: "94970", name: "Hobart Ellerslie Road", latitude: -42.8897, longitude: 147.3278 },
    Station { id: "94120", name: "Darwin Airport", latitude: -12.4239, longitude: 130.8925 },
];

pub fn station_by_id(id: &str) -> Option<&'static Station> {
    STATIONS.iter().find(|s| s.id == id)
}

/// Nearest station by great-circle distance, with the distance in km.
pub fn nearest_station(latitude: f64, longitude: f64) -> Option<(&'static Station, f64)> {
    STATIONS
        .iter()
        .map(|s| (s, haversine_km(latitude, longitude, s.latitude, s.longitude)))
        .min_by(|a, b| a.1.total_cmp(&b.1))
}

fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    const EARTH_RADIUS_KM: f64 = 6371.0;
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();
    let a = (dlat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().atan2((1.0 - a).sqrt())
}

// ---------------------------------------------------------------------------
// Feed parsing
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct Feed {
    observations: Observations,
}

#[derive(Deserialize)]
struct Observations {
    data: Vec<Observation>,
}

#[derive(Deserialize)]
struct Observation {
    air_temp: Option<f64>,
    rel_hum: Option<f64>,
}

pub(crate) fn parse_feed(body: &str) -> Result<(Option<f64>, Option<f64>)> {
    let feed: Feed = serde_json::from_str(body)
        .map_err(|e| Error::WeatherUnavailable(format!("unexpected feed structure: {e}")))?;
    let latest = feed
        .observations
        .data
        .first()
        .ok_or_else(|| Error::WeatherUnavailable("feed has no observations".into()))?;
    Ok((latest.air_temp, latest.rel_hum))
}

// ---------------------------------------------------------------------------
// Cache policy
// ---------------------------------------------------------------------------

/// Pure fetch/staleness bookkeeping, separated from the network call so the
/// policy is testable against a supplied clock.
#[derive(Debug)]
pub(crate) struct FeedCache {
    update_interval: Duration,
    last_attempt: Option<DateTime<Utc>>,
    last_success: Option<DateTime<Utc>>,
    temperature_c: Option<f64>,
    humidity_pct: Option<f64>,
}

impl FeedCache {
    pub(crate) fn new(update_interval_minutes: u64) -> Self {
        Self {
            update_interval: Duration::minutes(update_interval_minutes as i64),
            last_attempt: None,
            last_success: None,
            temperature_c: None,
            humidity_pct: None,
        }
    }

    /// The poll gate: never faster than the configured interval, and never
    /// inside the origin's minimum refresh window.
    fn gate(&self) -> Duration {
        self.update_interval
            .max(Duration::minutes(ORIGIN_MIN_REFRESH_MINUTES))
    }

    pub(crate) fn should_fetch(&self, now: DateTime<Utc>) -> bool {
        match self.last_attempt {
            None => true,
            Some(t) => now - t >= self.gate(),
        }
    }

    pub(crate) fn record_attempt(&mut self, now: DateTime<Utc>) {
        self.last_attempt = Some(now);
    }

    pub(crate) fn record_success(
        &mut self,
        now: DateTime<Utc>,
        temperature_c: Option<f64>,
        humidity_pct: Option<f64>,
    ) {
        self.last_success = Some(now);
        self.temperature_c = temperature_c;
        self.humidity_pct = humidity_pct;
    }

    /// Current values with the staleness budget applied: a sample older than
    /// 4× the configured interval reports unknown.
    pub(crate) fn current(&self, now: DateTime<Utc>) -> (Option<f64>, Option<f64>) {
        match self.last_success {
            Some(t) if now - t <= self.update_interval * (STALENESS_MULTIPLIER as i32) => {
                (self.temperature_c, self.humidity_pct)
            }
            _ => (None, None),
        }
    }

    pub(crate) fn last_success(&self) -> Option<DateTime<Utc>> {
        self.last_success
    }
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

pub struct WeatherProvider {
    station_id: String,
    station_name: Option<String>,
    url: String,
    client: reqwest::Client,
    cache: Mutex<FeedCache>,
}

impl WeatherProvider {
    /// `station_id` of `"auto"` resolves to the nearest known station from
    /// `location` (lat/long); the resolution happens once, here. A literal id
    /// is used as given even when it is not in the embedded table.
    pub fn new(
        station_id: &str,
        location: Option<(f64, f64)>,
        update_interval_minutes: u64,
        base_url: &str,
    ) -> Result<Self> {
        let (id, name) = if station_id == "auto" {
            match location.and_then(|(lat, lon)| nearest_station(lat, lon)) {
                Some((station, distance_km)) => {
                    info!(
                        station = station.id,
                        name = station.name,
                        distance_km = format!("{distance_km:.1}"),
                        "resolved nearest weather station"
                    );
                    (station.id.to_string(), Some(station.name.to_string()))
                }
                None => {
                    info!(
                        station = DEFAULT_STATION_ID,
                        "no location configured — using default weather station"
                    );
                    let s = station_by_id(DEFAULT_STATION_ID).expect("default station in table");
                    (s.id.to_string(), Some(s.name.to_string()))
                }
            }
        } else {
            let name = station_by_id(station_id).map(|s| s.name.to_string());
            (station_id.to_string(), name)
        };

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| Error::WeatherUnavailable(format!("http client: {e}")))?;

        Ok(Self {
            url: format!("{base_url}.{id}.json"),
            station_id: id,
            station_name: name,
            client,
            cache: Mutex::new(FeedCache::new(update_interval_minutes)),
        })
    }

    pub fn station_id(&self) -> &str {
        &self.station_id
    }

    pub fn station_name(&self) -> Option<&str> {
        self.station_name.as_deref()
    }

    /// The latest sample, refreshing over the network only when the poll gate
    /// allows it. Failures keep the previous sample within the staleness
    /// budget.
    pub async fn sample(&self, now: DateTime<Utc>) -> EnvironmentalSample {
        let mut cache = self.cache.lock().await;

        if cache.should_fetch(now) {
            cache.record_attempt(now);
            match self.fetch().await {
                Ok((temp, hum)) => {
                    info!(
                        station = %self.station_id,
                        temperature_c = ?temp,
                        humidity_pct = ?hum,
                        "weather sample fetched"
                    );
                    cache.record_success(now, temp, hum);
                }
                Err(e) => {
                    warn!(station = %self.station_id, "weather fetch failed: {e}");
                }
            }
        } else {
            debug!(station = %self.station_id, "inside refresh window — serving cached sample");
        }

        let (temperature_c, humidity_pct) = cache.current(now);
        EnvironmentalSample {
            temperature_c,
            humidity_pct,
            sample_time: cache.last_success().unwrap_or(now),
            station_id: Some(self.station_id.clone()),
            station_name: self.station_name.clone(),
        }
    }

    async fn fetch(&self) -> Result<(Option<f64>, Option<f64>)> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| Error::WeatherUnavailable(e.to_string()))?;
        let response = response
            .error_for_status()
            .map_err(|e| Error::WeatherUnavailable(e.to_string()))?;
        let body = response
            .text()
            .await
            .map_err(|e| Error::WeatherUnavailable(e.to_string()))?;
        parse_feed(&body)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
