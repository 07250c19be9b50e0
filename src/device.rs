//! Control of the switched pump device.
//!
//! The scheduler drives a [`DeviceController`], which owns reliability:
//! commands are serialized, every state change is verified by a follow-up
//! read, and disagreeing reads are retried with exponential backoff. The
//! wire protocol lives behind [`SwitchTransport`]; production uses a plain
//! HTTP relay client, tests use a scriptable mock. Vendor pairing and LAN
//! discovery stay outside the core behind [`SwitchDiscovery`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::clock::SharedClock;
use crate::error::{Error, Result};

/// Verification attempts per state-changing command.
const N_VERIFY: u32 = 3;

/// Retry backoff: initial delay, doubling, capped.
const BACKOFF_INITIAL: Duration = Duration::from_millis(250);
const BACKOFF_CAP: Duration = Duration::from_secs(2);

/// Per-request timeout for the HTTP transport.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Point-in-time device view for the status surface. `on: None` means the
/// state could not be verified.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSnapshot {
    pub reachable: bool,
    pub on: Option<bool>,
    pub last_verified: Option<DateTime<Tz>>,
    pub address: String,
}

// ---------------------------------------------------------------------------
// Transport + discovery seams
// ---------------------------------------------------------------------------

#[async_trait]
pub trait SwitchTransport: Send + Sync {
    fn address(&self) -> String;
    async fn connect(&self) -> Result<()>;
    async fn set_power(&self, on: bool) -> Result<()>;
    /// `Ok(None)` means the transport answered but could not report a state.
    async fn power_state(&self) -> Result<Option<bool>>;
    /// Point the transport at a replacement address after discovery.
    async fn rebind(&self, _address: &str) {}
}

#[async_trait]
pub trait SwitchDiscovery: Send + Sync {
    /// A single probe for a replacement address.
    async fn probe(&self) -> Option<String>;
}

/// Default collaborator: no LAN scanning in the core.
pub struct NoDiscovery;

#[async_trait]
impl SwitchDiscovery for NoDiscovery {
    async fn probe(&self) -> Option<String> {
        None
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

pub struct DeviceController {
    transport: std::sync::Arc<dyn SwitchTransport>,
    discovery: std::sync::Arc<dyn SwitchDiscovery>,
    clock: SharedClock,
    /// Serializes state-changing commands; concurrent callers see strict order.
    commands: Mutex<()>,
    connected: AtomicBool,
    snapshot: StdMutex<DeviceSnapshot>,
}

impl DeviceController {
    pub fn new(
        transport: std::sync::Arc<dyn SwitchTransport>,
        discovery: std::sync::Arc<dyn SwitchDiscovery>,
        clock: SharedClock,
    ) -> Self {
        let address = transport.address();
        Self {
            transport,
            discovery,
            clock,
            commands: Mutex::new(()),
            connected: AtomicBool::new(false),
            snapshot: StdMutex::new(DeviceSnapshot {
                reachable: false,
                on: None,
                last_verified: None,
                address,
            }),
        }
    }

    pub fn address(&self) -> String {
        self.snapshot.lock().unwrap().address.clone()
    }

    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        self.snapshot.lock().unwrap().clone()
    }

    /// Establish or refresh the control channel. When the configured address
    /// does not answer, the discovery collaborator is asked once for a
    /// replacement; failure of both is fatal for this startup.
    pub async fn connect(&self) -> Result<()> {
        match self.transport.connect().await {
            Ok(()) => {
                self.mark_connected().await;
                return Ok(());
            }
            Err(e) => {
                warn!(address = %self.transport.address(), "connect failed: {e}");
            }
        }

        if let Some(new_address) = self.discovery.probe().await {
            info!(address = %new_address, "discovery returned a replacement address");
            self.transport.rebind(&new_address).await;
            self.snapshot.lock().unwrap().address = new_address;
            if self.transport.connect().await.is_ok() {
                self.mark_connected().await;
                return Ok(());
            }
        }

        self.connected.store(false, Ordering::SeqCst);
        {
            let mut snap = self.snapshot.lock().unwrap();
            snap.reachable = false;
            snap.on = None;
        }
        Err(Error::DeviceUnreachable {
            address: self.transport.address(),
            reason: "connect failed after retry and discovery".into(),
        })
    }

    async fn mark_connected(&self) {
        self.connected.store(true, Ordering::SeqCst);
        let state = self.transport.power_state().await.ok().flatten();
        let mut snap = self.snapshot.lock().unwrap();
        snap.reachable = true;
        snap.on = state;
        if state.is_some() {
            snap.last_verified = Some(self.clock.now());
        }
    }

    pub async fn turn_on(&self) -> Result<()> {
        self.command(true).await
    }

    pub async fn turn_off(&self) -> Result<()> {
        self.command(false).await
    }

    /// Verification read outside the command path. Refreshes the snapshot.
    pub async fn is_on(&self) -> Option<bool> {
        match self.transport.power_state().await {
            Ok(state) => {
                let mut snap = self.snapshot.lock().unwrap();
                snap.reachable = true;
                snap.on = state;
                if state.is_some() {
                    snap.last_verified = Some(self.clock.now());
                }
                state
            }
            Err(e) => {
                warn!(address = %self.transport.address(), "state read failed: {e}");
                let mut snap = self.snapshot.lock().unwrap();
                snap.reachable = false;
                snap.on = None;
                None
            }
        }
    }

    /// Issue a state change and verify it, re-issuing up to [`N_VERIFY`]
    /// times with exponential backoff. On exhaustion the snapshot reports
    /// `on: None` and the caller gets a mismatch or unreachable error.
    async fn command(&self, on: bool) -> Result<()> {
        let _serialized = self.commands.lock().await;

        let requested = if on { "ON" } else { "OFF" };
        let mut backoff = BACKOFF_INITIAL;
        let mut observed_any_state = false;

        for attempt in 1..=N_VERIFY {
            let sent = match self.transport.set_power(on).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(attempt, requested, "command send failed: {e}");
                    false
                }
            };

            if sent {
                match self.transport.power_state().await {
                    Ok(Some(actual)) if actual == on => {
                        self.connected.store(true, Ordering::SeqCst);
                        let mut snap = self.snapshot.lock().unwrap();
                        snap.reachable = true;
                        snap.on = Some(actual);
                        snap.last_verified = Some(self.clock.now());
                        info!(requested, attempt, "device command verified");
                        return Ok(());
                    }
                    Ok(actual) => {
                        observed_any_state = actual.is_some();
                        warn!(
                            attempt,
                            requested,
                            observed = ?actual,
                            "verification disagreed with requested state"
                        );
                    }
                    Err(e) => {
                        warn!(attempt, requested, "verification read failed: {e}");
                    }
                }
            }

            if attempt < N_VERIFY {
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(BACKOFF_CAP);
            }
        }

        // Retry budget exhausted: state is unknown until the next successful
        // verification.
        {
            let mut snap = self.snapshot.lock().unwrap();
            snap.on = None;
            snap.reachable = observed_any_state;
        }

        if observed_any_state {
            Err(Error::DeviceStateMismatch {
                address: self.transport.address(),
                requested,
                actual: if on { "OFF" } else { "ON" },
            })
        } else {
            self.connected.store(false, Ordering::SeqCst);
            Err(Error::DeviceUnreachable {
                address: self.transport.address(),
                reason: format!("no verified response to {requested} after {N_VERIFY} attempts"),
            })
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP relay transport
// ---------------------------------------------------------------------------

/// Plain HTTP relay client (Shelly-style `/relay/0` endpoints) with optional
/// basic auth. Anything needing vendor pairing belongs in its own transport.
pub struct HttpSwitch {
    address: StdMutex<String>,
    credentials: Option<(String, String)>,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct RelayStatus {
    ison: bool,
}

impl HttpSwitch {
    pub fn new(address: &str, credentials: Option<(String, String)>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(COMMAND_TIMEOUT)
            .build()
            .map_err(|e| Error::DeviceUnreachable {
                address: address.to_string(),
                reason: format!("http client: {e}"),
            })?;
        Ok(Self {
            address: StdMutex::new(address.to_string()),
            credentials,
            client,
        })
    }

    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        let request = self.client.get(url);
        match &self.credentials {
            Some((user, password)) => request.basic_auth(user, Some(password)),
            None => request,
        }
    }

    fn base_url(&self) -> String {
        let address = self.address.lock().unwrap().clone();
        if address.starts_with("http://") || address.starts_with("https://") {
            address.trim_end_matches('/').to_string()
        } else {
            format!("http://{address}")
        }
    }

    fn unreachable(&self, e: impl std::fmt::Display) -> Error {
        Error::DeviceUnreachable {
            address: self.address(),
            reason: e.to_string(),
        }
    }
}

#[async_trait]
impl SwitchTransport for HttpSwitch {
    fn address(&self) -> String {
        self.address.lock().unwrap().clone()
    }

    async fn connect(&self) -> Result<()> {
        let url = format!("{}/relay/0", self.base_url());
        self.get(&url)
            .send()
            .await
            .map_err(|e| self.unreachable(e))?
            .error_for_status()
            .map_err(|e| self.unreachable(e))?;
        Ok(())
    }

    async fn set_power(&self, on: bool) -> Result<()> {
        let turn = if on { "on" } else { "off" };
        let url = format!("{}/relay/0?turn={turn}", self.base_url());
        self.get(&url)
            .send()
            .await
            .map_err(|e| self.unreachable(e))?
            .error_for_status()
            .map_err(|e| self.unreachable(e))?;
        Ok(())
    }

    async fn power_state(&self) -> Result<Option<bool>> {
        let url = format!("{}/relay/0", self.base_url());
        let response = self
            .get(&url)
            .send()
            .await
            .map_err(|e| self.unreachable(e))?
            .error_for_status()
            .map_err(|e| self.unreachable(e))?;
        match response.json::<RelayStatus>().await {
            Ok(status) => Ok(Some(status.ison)),
            Err(_) => Ok(None),
        }
    }

    async fn rebind(&self, address: &str) {
        *self.address.lock().unwrap() = address.to_string();
    }
}

// ---------------------------------------------------------------------------
// Scriptable mock transport (tests)
// ---------------------------------------------------------------------------


// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::mock::{MockSwitch, ScriptedDiscovery};
    use super::*;
    use crate::clock::TestClock;
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;

    fn test_clock() -> SharedClock {
        Arc::new(TestClock::starting_at(
            Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap(),
            chrono_tz::UTC,
        ))
    }

    fn controller(switch: Arc<MockSwitch>, clock: SharedClock) -> DeviceController {
        DeviceController::new(switch, Arc::new(NoDiscovery), clock)
    }

    // -- Verify + retry -----------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn turn_on_verifies_first_try() {
        let switch = MockSwitch::new();
        let dev = controller(switch.clone(), test_clock());

        dev.turn_on().await.unwrap();

        assert!(switch.is_on());
        let snap = dev.snapshot();
        assert_eq!(snap.on, Some(true));
        assert!(snap.reachable);
        assert!(snap.last_verified.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn flapping_verify_succeeds_on_third_attempt_with_backoff() {
        // S6: verify returns the wrong state twice, then agrees. Backoff is
        // 250 ms then 500 ms, so success lands at 750 ms of virtual time.
        let clock = test_clock();
        let switch = MockSwitch::with_clock(clock.clone());
        switch.script_misreports(2);
        let dev = controller(switch.clone(), clock.clone());

        let started = tokio::time::Instant::now();
        dev.turn_on().await.unwrap();
        let elapsed = started.elapsed();

        assert!(
            elapsed >= Duration::from_millis(750) && elapsed < Duration::from_millis(800),
            "elapsed {elapsed:?}"
        );
        assert_eq!(switch.commands().len(), 3); // re-issued each attempt
        assert_eq!(dev.snapshot().on, Some(true));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_verifies_report_mismatch_and_unknown_state() {
        let switch = MockSwitch::new();
        switch.script_misreports(3);
        let dev = controller(switch.clone(), test_clock());

        let err = dev.turn_on().await.unwrap_err();
        assert!(matches!(err, Error::DeviceStateMismatch { requested: "ON", .. }));

        // device_state stays unknown until the next successful verification
        assert_eq!(dev.snapshot().on, None);
        let state = dev.is_on().await;
        assert_eq!(state, Some(true));
        assert_eq!(dev.snapshot().on, Some(true));
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_transport_reports_unreachable() {
        let switch = MockSwitch::new();
        switch.set_fail_commands(true);
        let dev = controller(switch.clone(), test_clock());

        let err = dev.turn_on().await.unwrap_err();
        assert!(matches!(err, Error::DeviceUnreachable { .. }));
        let snap = dev.snapshot();
        assert!(!snap.reachable);
        assert_eq!(snap.on, None);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_caps_at_two_seconds() {
        // With the cap, delays are 250, 500 — the cap only matters for larger
        // budgets, but the doubling path must never exceed it.
        let mut backoff = BACKOFF_INITIAL;
        for _ in 0..10 {
            backoff = (backoff * 2).min(BACKOFF_CAP);
        }
        assert_eq!(backoff, BACKOFF_CAP);
    }

    // -- Serialization ------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn concurrent_commands_are_strictly_ordered() {
        let switch = MockSwitch::new();
        let dev = Arc::new(controller(switch.clone(), test_clock()));

        let d1 = dev.clone();
        let d2 = dev.clone();
        let (a, b) = tokio::join!(
            tokio::spawn(async move { d1.turn_on().await }),
            tokio::spawn(async move { d2.turn_off().await }),
        );
        a.unwrap().unwrap();
        b.unwrap().unwrap();

        // Each command sent exactly once, never interleaved mid-verify.
        let log = switch.commands();
        assert_eq!(log.len(), 2);
        assert_ne!(log[0].on, log[1].on);
    }

    // -- Connect + discovery ------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn connect_failure_probes_discovery_once() {
        let clock = test_clock();
        let switch = MockSwitch::new();
        switch.fail_connects(1); // configured address fails, rebound one works
        let discovery = Arc::new(ScriptedDiscovery {
            address: "10.0.0.42".into(),
            probes: StdMutex::new(0),
        });
        let dev = DeviceController::new(switch.clone(), discovery.clone(), clock);

        dev.connect().await.unwrap();

        assert_eq!(*discovery.probes.lock().unwrap(), 1);
        assert_eq!(dev.address(), "10.0.0.42");
        assert!(dev.connected());
    }

    #[tokio::test(start_paused = true)]
    async fn connect_failure_without_discovery_is_fatal() {
        let switch = MockSwitch::new();
        switch.fail_connects(2);
        let dev = controller(switch.clone(), test_clock());

        let err = dev.connect().await.unwrap_err();
        assert!(matches!(err, Error::DeviceUnreachable { .. }));
        assert!(!dev.connected());
    }

    // -- HTTP transport url shaping -----------------------------------------

    #[test]
    fn http_switch_normalizes_bare_host() {
        let s = HttpSwitch::new("192.168.1.50", None).unwrap();
        assert_eq!(s.base_url(), "http://192.168.1.50");
    }

    #[test]
    fn http_switch_keeps_explicit_scheme() {
        let s = HttpSwitch::new("https://plug.local/", Some(("admin".into(), "pw".into()))).unwrap();
        assert_eq!(s.base_url(), "https://plug.local");
    }
}
