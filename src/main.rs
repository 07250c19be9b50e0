//! Controller entry point: reads the config file, wires up the device
//! controller, environmental service, scheduler and control API, then waits
//! for a signal.
//!
//! Safety behaviour:
//! - SIGTERM/SIGINT → scheduler stopped, device commanded OFF before exit
//! - device unreachable at startup is non-fatal; cycles are skipped and the
//!   status surface reports the condition
//! - unknown location disables adaptation only; scheduling continues

mod adaptive;
mod clock;
mod config;
mod daylight;
mod device;
mod environment;
mod error;
mod factory;
mod plan;
mod scheduler;
mod state;
mod timefmt;
mod weather;
mod web;

use std::env;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{error, info, warn};

use clock::{SharedClock, SystemClock};
use config::AppConfig;
use daylight::DaylightCalculator;
use device::{DeviceController, HttpSwitch, NoDiscovery};
use environment::EnvironmentalService;
use factory::SchedulerFactory;
use weather::WeatherProvider;

#[tokio::main]
async fn main() -> Result<()> {
    // ── Structured logging ──────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    // ── Configuration ───────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let raw = config::load(&config_path)?;
    let cfg = config::validate(raw)?;

    let clock: SharedClock = Arc::new(SystemClock::new(cfg.timezone));
    info!(
        device = %cfg.device.device_id,
        address = %cfg.device.address,
        timezone = %cfg.timezone,
        "configuration loaded"
    );

    // ── Device controller ───────────────────────────────────────────
    let transport = Arc::new(HttpSwitch::new(
        &cfg.device.address,
        cfg.device.credentials.clone(),
    )?);
    let device = Arc::new(DeviceController::new(
        transport,
        Arc::new(NoDiscovery),
        clock.clone(),
    ));

    // ── Environmental service ───────────────────────────────────────
    let environment = Arc::new(build_environment(&cfg, clock.clone()));
    environment.refresh().await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let poller = environment.clone().spawn_poller(shutdown_rx);

    // ── Scheduler ───────────────────────────────────────────────────
    let factory = SchedulerFactory::new(device.clone(), environment.clone(), clock.clone());
    let scheduler = Arc::new(factory.build(&cfg)?);
    scheduler.start().await?;

    // ── Control API ─────────────────────────────────────────────────
    let app_state = web::AppState {
        scheduler: scheduler.clone(),
        device: device.clone(),
        environment: environment.clone(),
    };
    let web_port = cfg.web_port;
    tokio::spawn(async move {
        web::serve(app_state, web_port).await;
    });

    // ── Signal handling ─────────────────────────────────────────────
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    let exit_reason = tokio::select! {
        _ = &mut ctrl_c => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
    };

    // ── Graceful shutdown ───────────────────────────────────────────
    warn!(signal = exit_reason, "shutting down — releasing the device");
    if let Err(e) = scheduler.stop().await {
        error!("scheduler stop failed: {e}");
    }
    let _ = shutdown_tx.send(true);
    if let Err(e) = poller.await {
        warn!("environment poller join failed: {e}");
    }

    info!("shutdown complete");
    Ok(())
}

/// Build the environmental service from the adaptation config. An unknown
/// postcode or broken weather setup disables the affected source and the
/// system runs without it.
fn build_environment(cfg: &AppConfig, clock: SharedClock) -> EnvironmentalService {
    let Some(adaptation) = &cfg.adaptation else {
        return EnvironmentalService::disabled(clock);
    };

    let daylight = adaptation.location.as_ref().and_then(|loc| {
        match DaylightCalculator::new(&loc.postcode, loc.timezone) {
            Ok(calc) => {
                info!(
                    postcode = %calc.postcode(),
                    locality = %calc.locality(),
                    "daylight calculator ready"
                );
                Some(calc)
            }
            Err(e) => {
                warn!("daylight disabled: {e}");
                None
            }
        }
    });

    let weather = adaptation.temperature.as_ref().and_then(|temp| {
        let location = daylight.as_ref().map(|d| (d.latitude(), d.longitude()));
        match WeatherProvider::new(
            &temp.station_id,
            location,
            temp.update_interval_minutes,
            weather::DEFAULT_FEED_BASE,
        ) {
            Ok(provider) => {
                info!(
                    station = provider.station_id(),
                    name = provider.station_name().unwrap_or("unknown"),
                    "weather provider ready"
                );
                Some(provider)
            }
            Err(e) => {
                warn!("weather disabled: {e}");
                None
            }
        }
    });

    EnvironmentalService::new(daylight, weather, clock)
}
