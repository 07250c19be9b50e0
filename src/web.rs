//! JSON control surface: thin axum routes over the programmatic contracts.
//!
//! Everything here reads snapshots or forwards control calls; no scheduling
//! decisions are made in handlers.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::info;

use crate::config::{self, RawSchedule};
use crate::device::DeviceController;
use crate::environment::EnvironmentalService;
use crate::error::Error;
use crate::factory::build_plan;
use crate::plan::Bounds;
use crate::scheduler::Scheduler;
use crate::state::{EnvironmentStatus, FullStatus};
use crate::timefmt::TimeOfDay;

// ---------------------------------------------------------------------------
// Composite app state shared across all handlers
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
    pub device: Arc<DeviceController>,
    pub environment: Arc<EnvironmentalService>,
}

type ApiError = (StatusCode, Json<Value>);
type ApiResult = Result<Json<Value>, ApiError>;

fn reject(e: Error) -> ApiError {
    let status = match e {
        Error::ShuttingDown => StatusCode::CONFLICT,
        Error::Configuration { .. } | Error::NotImplemented(_) => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::BAD_GATEWAY,
    };
    (status, Json(json!({ "error": e.to_string() })))
}

fn bad_request(message: &str) -> ApiError {
    (
        StatusCode::UNPROCESSABLE_ENTITY,
        Json(json!({ "error": message })),
    )
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/environment", get(api_environment))
        .route("/api/scheduler/start", post(api_scheduler_start))
        .route("/api/scheduler/stop", post(api_scheduler_stop))
        .route("/api/device/on", post(api_device_on))
        .route("/api/device/off", post(api_device_off))
        .route("/api/emergency_stop", post(api_emergency_stop))
        .route("/api/schedule", get(api_get_schedule).put(api_update_schedule))
        .route("/api/validation", get(api_validation))
        .with_state(state)
}

async fn api_status(State(state): State<AppState>) -> Json<Value> {
    let environment = state.environment.snapshot().await;
    let full = FullStatus {
        scheduler: state.scheduler.status(),
        device: state.device.snapshot(),
        environment: EnvironmentStatus {
            temperature_c: environment.temperature_c,
            humidity_pct: environment.humidity_pct,
            station_id: environment.station_id,
            station_name: environment.station_name,
            sunrise: environment.daylight.map(|d| d.sunrise),
            sunset: environment.daylight.map(|d| d.sunset),
            adaptation_enabled: environment.adaptation_enabled,
            adaptive_enabled: state.scheduler.strategy_name() == "adaptive",
        },
    };
    Json(serde_json::to_value(&full).expect("status snapshot serializes"))
}

async fn api_environment(State(state): State<AppState>) -> Json<Value> {
    let snapshot = state.environment.snapshot().await;
    Json(serde_json::to_value(&snapshot).expect("environment snapshot serializes"))
}

async fn api_scheduler_start(State(state): State<AppState>) -> ApiResult {
    state.scheduler.start().await.map_err(reject)?;
    Ok(Json(json!({ "ok": true, "running": state.scheduler.is_running() })))
}

async fn api_scheduler_stop(State(state): State<AppState>) -> ApiResult {
    state.scheduler.stop().await.map_err(reject)?;
    Ok(Json(json!({ "ok": true, "running": state.scheduler.is_running() })))
}

async fn api_device_on(State(state): State<AppState>) -> ApiResult {
    if state.scheduler.is_shutting_down() {
        return Err(reject(Error::ShuttingDown));
    }
    state.device.turn_on().await.map_err(reject)?;
    Ok(Json(json!({ "ok": true, "device": state.device.snapshot() })))
}

async fn api_device_off(State(state): State<AppState>) -> ApiResult {
    if state.scheduler.is_shutting_down() {
        return Err(reject(Error::ShuttingDown));
    }
    state.device.turn_off().await.map_err(reject)?;
    Ok(Json(json!({ "ok": true, "device": state.device.snapshot() })))
}

/// OFF then stop. Succeeds even when the device is unreachable; a failed OFF
/// becomes a warning, never an error.
async fn api_emergency_stop(State(state): State<AppState>) -> Json<Value> {
    let mut warnings: Vec<String> = Vec::new();
    if let Err(e) = state.device.turn_off().await {
        warnings.push(format!("device OFF failed: {e}"));
    }
    if let Err(e) = state.scheduler.stop().await {
        warnings.push(format!("scheduler stop: {e}"));
    }
    Json(json!({ "ok": true, "warnings": warnings }))
}

async fn api_get_schedule(State(state): State<AppState>) -> Json<Value> {
    let strategy = state.scheduler.strategy_name();
    match state.scheduler.interval_spec() {
        Some(spec) => Json(json!({
            "strategy": strategy,
            "flood_minutes": spec.flood_minutes,
            "drain_minutes": spec.drain_minutes,
            "interval_minutes": spec.interval_minutes,
            "active_hours": spec.active_hours.map(|(s, e)| json!({
                "start": s.to_string(),
                "end": e.to_string(),
            })),
        })),
        None => Json(json!({
            "strategy": strategy,
            "cycles": state.scheduler.current_plan().cycles(),
        })),
    }
}

async fn api_validation(State(state): State<AppState>) -> Json<Value> {
    Json(
        serde_json::to_value(state.scheduler.validation_report())
            .expect("validation report serializes"),
    )
}

/// Replace the schedule/adaptation configuration subset. While adaptive mode
/// owns the cycle list, a literal list in the update is rejected outright.
async fn api_update_schedule(
    State(state): State<AppState>,
    Json(body): Json<RawSchedule>,
) -> ApiResult {
    if state.scheduler.is_shutting_down() {
        return Err(reject(Error::ShuttingDown));
    }

    match state.scheduler.strategy_name() {
        "adaptive" => {
            if !body.cycles.is_empty() {
                return Err(bad_request(
                    "cycle list is synthesized while adaptive mode is enabled",
                ));
            }
            let Some(adaptation) = body.adaptation.as_ref().filter(|a| a.enabled) else {
                return Err(bad_request("adaptation section with enabled = true required"));
            };

            let mut issues = Vec::new();
            let (spec, _tz) = config::validate_adaptation(adaptation, &body, &mut issues);
            if !issues.is_empty() {
                return Err(reject(Error::configuration(issues)));
            }
            let Some(settings) = spec.adaptive else {
                return Err(bad_request("adaptive section with enabled = true required"));
            };

            state
                .scheduler
                .replan_settings(settings)
                .await
                .map_err(reject)?;
            Ok(Json(json!({ "ok": true })))
        }

        "time_based" => {
            let flood_minutes = body.flood_minutes.unwrap_or(2.0);
            let mut issues = Vec::new();
            let mut cycles: Vec<(TimeOfDay, f64)> = Vec::new();
            for cycle in &body.cycles {
                match cycle.on_time.parse::<TimeOfDay>() {
                    Ok(t) => cycles.push((t, cycle.off_minutes)),
                    Err(e) => issues.push(format!("cycles: {e}")),
                }
            }
            if !issues.is_empty() {
                return Err(reject(Error::configuration(issues)));
            }

            let plan = build_plan(flood_minutes, &cycles, &Bounds::default()).map_err(reject)?;
            state.scheduler.replan(plan).map_err(reject)?;
            Ok(Json(json!({ "ok": true })))
        }

        _ => Err(bad_request(
            "interval schedule changes need a configuration reload",
        )),
    }
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState, port: u16) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .expect("failed to bind web port");

    info!("control api listening on http://{addr}");

    axum::serve(listener, router(state))
        .await
        .expect("web server error");
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adaptive::AdaptiveSettings;
    use crate::clock::{SharedClock, TestClock};
    use crate::device::mock::MockSwitch;
    use crate::device::NoDiscovery;
    use crate::plan::{Cycle, SchedulePlan};
    use axum::body::Body;
    use axum::http::Request;
    use chrono::{TimeZone, Utc};
    use http_body_util::BodyExt;
    use tower::ServiceExt; // for `oneshot`

    fn plan() -> SchedulePlan {
        SchedulePlan::new(
            vec![Cycle::new("12:00".parse().unwrap(), 2.0, 10.0)],
            &Bounds::default(),
        )
        .unwrap()
    }

    fn test_state(adaptive: bool) -> (AppState, Arc<MockSwitch>) {
        let clock: SharedClock = Arc::new(TestClock::starting_at(
            Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap(),
            chrono_tz::UTC,
        ));
        let switch = MockSwitch::new();
        let device = Arc::new(DeviceController::new(
            switch.clone(),
            Arc::new(NoDiscovery),
            clock.clone(),
        ));
        let environment = Arc::new(EnvironmentalService::disabled(clock.clone()));
        let scheduler = if adaptive {
            Scheduler::adaptive(
                AdaptiveSettings::default(),
                None,
                environment.clone(),
                device.clone(),
                clock,
            )
            .unwrap()
        } else {
            Scheduler::time_of_day(plan(), device.clone(), clock).unwrap()
        };
        (
            AppState {
                scheduler: Arc::new(scheduler),
                device,
                environment,
            },
            switch,
        )
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    async fn post_json(app: Router, uri: &str) -> (StatusCode, Value) {
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    async fn put_json(app: Router, uri: &str, body: Value) -> (StatusCode, Value) {
        let resp = app
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn status_exposes_scheduler_device_and_environment() {
        let (state, _switch) = test_state(false);
        let (status, json) = get_json(router(state), "/api/status").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["state"], "stopped");
        assert_eq!(json["strategy"], "time_based");
        assert_eq!(json["device"]["address"], "10.0.0.7");
        assert_eq!(json["environment"]["adaptation_enabled"], false);
        assert_eq!(json["environment"]["adaptive_enabled"], false);
    }

    #[tokio::test(start_paused = true)]
    async fn start_and_stop_through_the_api() {
        let (state, switch) = test_state(false);
        let app = router(state.clone());

        let (status, json) = post_json(app.clone(), "/api/scheduler/start").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["running"], true);
        assert!(state.scheduler.is_running());

        let (status, json) = post_json(app, "/api/scheduler/stop").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["running"], false);
        // Stop released the device.
        assert!(!switch.is_on());
    }

    #[tokio::test(start_paused = true)]
    async fn device_control_round_trip() {
        let (state, switch) = test_state(false);
        let app = router(state);

        let (status, json) = post_json(app.clone(), "/api/device/on").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["device"]["on"], true);
        assert!(switch.is_on());

        let (status, _) = post_json(app, "/api/device/off").await;
        assert_eq!(status, StatusCode::OK);
        assert!(!switch.is_on());
    }

    #[tokio::test(start_paused = true)]
    async fn emergency_stop_succeeds_with_unreachable_device() {
        let (state, switch) = test_state(false);
        switch.set_fail_commands(true);
        let app = router(state);

        let (status, json) = post_json(app, "/api/emergency_stop").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["ok"], true);
        assert!(!json["warnings"].as_array().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn schedule_update_replans_time_based() {
        let (state, _switch) = test_state(false);
        let app = router(state);

        let body = json!({
            "type": "time_based",
            "flood_minutes": 2.0,
            "cycles": [{ "on_time": "07:30", "off_minutes": 15.0 }]
        });
        let (status, json) = put_json(app, "/api/schedule", body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["ok"], true);
    }

    #[tokio::test(start_paused = true)]
    async fn schedule_update_rejects_literal_cycles_when_adaptive() {
        let (state, _switch) = test_state(true);
        let app = router(state);

        let body = json!({
            "type": "time_based",
            "flood_minutes": 2.0,
            "cycles": [{ "on_time": "07:30", "off_minutes": 15.0 }],
            "adaptation": { "enabled": true, "adaptive": { "enabled": true } }
        });
        let (status, json) = put_json(app, "/api/schedule", body).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(json["error"].as_str().unwrap().contains("synthesized"));
    }

    #[tokio::test(start_paused = true)]
    async fn schedule_update_replaces_adaptive_settings() {
        let (state, _switch) = test_state(true);
        state.environment.refresh().await;
        let app = router(state);

        let body = json!({
            "type": "time_based",
            "flood_minutes": 3.0,
            "adaptation": {
                "enabled": true,
                "adaptive": {
                    "enabled": true,
                    "tod_frequencies": { "morning": 20.0, "day": 30.0, "evening": 20.0, "night": 120.0 }
                }
            }
        });
        let (status, json) = put_json(app, "/api/schedule", body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["ok"], true);
    }

    #[tokio::test(start_paused = true)]
    async fn get_schedule_returns_cycle_list() {
        let (state, _switch) = test_state(false);
        let (status, json) = get_json(router(state), "/api/schedule").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["strategy"], "time_based");
        assert_eq!(json["cycles"][0]["on_time"], "12:00");
    }

    #[tokio::test(start_paused = true)]
    async fn validation_is_null_before_any_synthesis() {
        let (state, _switch) = test_state(true);
        let (status, json) = get_json(router(state), "/api/validation").await;
        assert_eq!(status, StatusCode::OK);
        assert!(json.is_null());
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_route_returns_404() {
        let (state, _switch) = test_state(false);
        let resp = router(state)
            .oneshot(Request::builder().uri("/nonexistent").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
