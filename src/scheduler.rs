//! The unified flood/drain scheduler.
//!
//! One worker task owns the device and the plan cursor. All strategies share
//! the same state machine:
//!
//! ```text
//! stopped ──start──▶ waiting
//! waiting ──on_time reached──▶ flood
//! flood   ──flood_minutes elapsed──▶ drain
//! drain   ──off_minutes elapsed──▶ waiting
//! (any)   ──stop──▶ stopped (device commanded OFF)
//! ```
//!
//! The worker polls the wall clock; wall-clock jumps are absorbed by the
//! next-due recomputation (forward jumps skip missed cycles, backward jumps
//! never re-execute a fired cycle). Plans are handed over by atomic
//! replacement and observed at the next waiting tick; an in-progress phase
//! always completes under the plan it started with.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration};
use chrono_tz::Tz;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::adaptive::{self, AdaptiveSettings, PeriodWindows, ValidationReport};
use crate::clock::SharedClock;
use crate::device::DeviceController;
use crate::environment::EnvironmentalService;
use crate::error::{Error, Result};
use crate::plan::{local_instant, Cycle, SchedulePlan};
use crate::state::{SchedulerState, StatusSnapshot};
use crate::timefmt::TimeOfDay;

/// Wall-clock poll cadence for every wait.
const POLL_TICK: StdDuration = StdDuration::from_secs(1);

/// How long `stop()` waits for the worker to release the device.
const GRACEFUL_SHUTDOWN: StdDuration = StdDuration::from_secs(10);

/// Cadence of the adaptive re-synthesis checks.
const ADAPTIVE_REFRESH_TICK: StdDuration = StdDuration::from_secs(60);

fn minutes_f(m: f64) -> Duration {
    Duration::milliseconds((m * 60_000.0).round() as i64)
}

// ---------------------------------------------------------------------------
// Interval strategy spec
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct IntervalSpec {
    pub flood_minutes: f64,
    pub drain_minutes: f64,
    pub interval_minutes: f64,
    /// Optional window; may wrap past midnight. Inclusive at both ends.
    pub active_hours: Option<(TimeOfDay, TimeOfDay)>,
}

impl IntervalSpec {
    pub fn validate(&self) -> Result<()> {
        let mut issues = Vec::new();
        if self.flood_minutes <= 0.0 {
            issues.push("flood_minutes must be positive".to_string());
        }
        if self.drain_minutes < 0.0 {
            issues.push("drain_minutes must not be negative".to_string());
        }
        if self.interval_minutes <= 0.0 {
            issues.push("interval_minutes must be positive".to_string());
        }
        if self.interval_minutes < self.flood_minutes + self.drain_minutes {
            issues.push(format!(
                "interval_minutes ({}) shorter than flood + drain ({})",
                self.interval_minutes,
                self.flood_minutes + self.drain_minutes
            ));
        }
        if issues.is_empty() {
            Ok(())
        } else {
            Err(Error::configuration(issues))
        }
    }

    fn within_active_hours(&self, t: TimeOfDay) -> bool {
        match self.active_hours {
            None => true,
            Some((start, end)) => {
                if start <= end {
                    start <= t && t <= end
                } else {
                    // window wraps past midnight
                    t >= start || t <= end
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

enum Strategy {
    Interval(IntervalSpec),
    TimeOfDay,
    Adaptive,
}

struct AdaptiveShared {
    settings: StdMutex<AdaptiveSettings>,
    environment: Arc<EnvironmentalService>,
    /// Analytic reference for the validation report; never executed.
    reference: Option<SchedulePlan>,
    report: StdMutex<Option<ValidationReport>>,
}

struct RunHandles {
    shutdown_tx: watch::Sender<bool>,
    worker: JoinHandle<()>,
    refresher: Option<JoinHandle<()>>,
}

struct Inner {
    strategy: Strategy,
    device: Arc<DeviceController>,
    clock: SharedClock,
    plan_tx: watch::Sender<Arc<SchedulePlan>>,
    status_tx: watch::Sender<StatusSnapshot>,
    running: AtomicBool,
    shutting_down: AtomicBool,
    run: Mutex<Option<RunHandles>>,
    adaptive: Option<AdaptiveShared>,
}

pub struct Scheduler {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler").finish_non_exhaustive()
    }
}

impl Scheduler {
    pub fn interval(
        spec: IntervalSpec,
        device: Arc<DeviceController>,
        clock: SharedClock,
    ) -> Result<Self> {
        spec.validate()?;
        Ok(Self::build(Strategy::Interval(spec), device, clock, None))
    }

    pub fn time_of_day(
        plan: SchedulePlan,
        device: Arc<DeviceController>,
        clock: SharedClock,
    ) -> Result<Self> {
        if plan.is_empty() {
            return Err(Error::configuration(vec![
                "time_based schedule needs at least one cycle".to_string(),
            ]));
        }
        let scheduler = Self::build(Strategy::TimeOfDay, device, clock, None);
        scheduler.inner.plan_tx.send_replace(Arc::new(plan));
        Ok(scheduler)
    }

    pub fn adaptive(
        settings: AdaptiveSettings,
        reference: Option<SchedulePlan>,
        environment: Arc<EnvironmentalService>,
        device: Arc<DeviceController>,
        clock: SharedClock,
    ) -> Result<Self> {
        let shared = AdaptiveShared {
            settings: StdMutex::new(settings),
            environment,
            reference,
            report: StdMutex::new(None),
        };
        Ok(Self::build(Strategy::Adaptive, device, clock, Some(shared)))
    }

    fn build(
        strategy: Strategy,
        device: Arc<DeviceController>,
        clock: SharedClock,
        adaptive: Option<AdaptiveShared>,
    ) -> Self {
        let strategy_name = match strategy {
            Strategy::Interval(_) => "interval",
            Strategy::TimeOfDay => "time_based",
            Strategy::Adaptive => "adaptive",
        };
        let (plan_tx, _) = watch::channel(Arc::new(SchedulePlan::empty()));
        let (status_tx, _) = watch::channel(StatusSnapshot::stopped(strategy_name));
        Self {
            inner: Arc::new(Inner {
                strategy,
                device,
                clock,
                plan_tx,
                status_tx,
                running: AtomicBool::new(false),
                shutting_down: AtomicBool::new(false),
                run: Mutex::new(None),
                adaptive,
            }),
        }
    }

    pub fn strategy_name(&self) -> &'static str {
        self.inner.strategy_name()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> SchedulerState {
        self.inner.status_tx.borrow().state
    }

    /// Point-in-time snapshot, safe to call concurrently with execution.
    pub fn status(&self) -> StatusSnapshot {
        self.inner.status_tx.borrow().clone()
    }

    pub fn validation_report(&self) -> Option<ValidationReport> {
        self.inner
            .adaptive
            .as_ref()
            .and_then(|ad| ad.report.lock().unwrap().clone())
    }

    /// The currently installed plan (empty for the interval strategy).
    pub fn current_plan(&self) -> Arc<SchedulePlan> {
        self.inner.plan_tx.borrow().clone()
    }

    pub fn interval_spec(&self) -> Option<IntervalSpec> {
        match &self.inner.strategy {
            Strategy::Interval(spec) => Some(spec.clone()),
            _ => None,
        }
    }

    /// Begin execution. Idempotent: a second call while running succeeds
    /// without spawning another worker. Construction-time invariants are
    /// re-checked and only their failure is reported.
    pub async fn start(&self) -> Result<()> {
        if self.is_shutting_down() {
            return Err(Error::ShuttingDown);
        }

        let mut run = self.inner.run.lock().await;
        if run.is_some() {
            info!("scheduler already running");
            return Ok(());
        }

        match &self.inner.strategy {
            Strategy::Interval(spec) => spec.validate()?,
            Strategy::TimeOfDay => {
                if self.inner.plan_tx.borrow().is_empty() {
                    return Err(Error::configuration(vec![
                        "time_based schedule needs at least one cycle".to_string(),
                    ]));
                }
            }
            Strategy::Adaptive => {
                self.inner.resynthesize().await?;
            }
        }

        // A dead device is not fatal: the worker keeps the timeline and
        // reconciles when the device answers again. Cycles may be skipped.
        if let Err(e) = self.inner.device.connect().await {
            warn!("device connect failed at start: {e} — continuing");
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.inner.running.store(true, Ordering::SeqCst);

        let worker = {
            let inner = Arc::clone(&self.inner);
            let shutdown = shutdown_rx.clone();
            tokio::spawn(async move { worker_loop(inner, shutdown).await })
        };

        let refresher = self.inner.adaptive.as_ref().map(|_| {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move { refresh_loop(inner, shutdown_rx).await })
        });

        *run = Some(RunHandles {
            shutdown_tx,
            worker,
            refresher,
        });
        info!(strategy = self.strategy_name(), "scheduler started");
        Ok(())
    }

    /// Request termination. Returns once the worker has released the device
    /// (OFF command issued) or the graceful budget expires, in which case the
    /// OFF is issued here and a warning logged. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        let mut run = self.inner.run.lock().await;
        let Some(handles) = run.take() else {
            return Ok(());
        };

        self.inner.shutting_down.store(true, Ordering::SeqCst);
        let _ = handles.shutdown_tx.send(true);

        match tokio::time::timeout(GRACEFUL_SHUTDOWN, handles.worker).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("scheduler worker failed: {e}"),
            Err(_) => {
                warn!("worker did not stop within the shutdown budget — forcing device OFF");
                if let Err(e) = self.inner.device.turn_off().await {
                    warn!("device OFF during forced shutdown failed: {e}");
                }
            }
        }

        if let Some(refresher) = handles.refresher {
            if tokio::time::timeout(StdDuration::from_secs(2), refresher)
                .await
                .is_err()
            {
                warn!("adaptive refresher did not stop in time");
            }
        }

        self.inner
            .status_tx
            .send_replace(StatusSnapshot::stopped(self.inner.strategy_name()));
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.shutting_down.store(false, Ordering::SeqCst);
        info!("scheduler stopped");
        Ok(())
    }

    /// Install a new literal plan. Installing an identical plan is a no-op
    /// that never perturbs the worker. Rejected while adaptive synthesis owns
    /// the cycle list.
    pub fn replan(&self, plan: SchedulePlan) -> Result<()> {
        if self.is_shutting_down() {
            return Err(Error::ShuttingDown);
        }
        match &self.inner.strategy {
            Strategy::Interval(_) => Err(Error::configuration(vec![
                "interval strategy has no cycle list to replace".to_string(),
            ])),
            Strategy::Adaptive => Err(Error::configuration(vec![
                "cycle list is synthesized while adaptive mode is enabled".to_string(),
            ])),
            Strategy::TimeOfDay => {
                if plan.is_empty() {
                    return Err(Error::configuration(vec![
                        "time_based schedule needs at least one cycle".to_string(),
                    ]));
                }
                self.inner.install_if_changed(plan);
                Ok(())
            }
        }
    }

    /// Replace the adaptation settings and re-synthesize immediately. The
    /// running phase is never interrupted; the worker sees the new plan at
    /// its next waiting tick.
    pub async fn replan_settings(&self, settings: AdaptiveSettings) -> Result<()> {
        if self.is_shutting_down() {
            return Err(Error::ShuttingDown);
        }
        let Some(ad) = &self.inner.adaptive else {
            return Err(Error::configuration(vec![
                "adaptive settings supplied but adaptive mode is not enabled".to_string(),
            ]));
        };
        *ad.settings.lock().unwrap() = settings;
        self.inner.resynthesize().await?;
        Ok(())
    }
}

impl Inner {
    fn strategy_name(&self) -> &'static str {
        match self.strategy {
            Strategy::Interval(_) => "interval",
            Strategy::TimeOfDay => "time_based",
            Strategy::Adaptive => "adaptive",
        }
    }

    fn publish(
        &self,
        state: SchedulerState,
        next_event: Option<DateTime<Tz>>,
        last_cycle: Option<Cycle>,
    ) {
        let now = self.clock.now();
        let current_period = self.adaptive.as_ref().map(|ad| {
            let daylight = ad.environment.daylight_today();
            PeriodWindows::from_daylight(daylight.as_ref())
                .period_of(TimeOfDay::from_naive(now.time()))
        });
        self.status_tx.send_replace(StatusSnapshot {
            running: !matches!(state, SchedulerState::Stopped),
            state,
            strategy: self.strategy_name(),
            next_event_time: next_event,
            time_until_next_secs: next_event.map(|t| (t - now).num_seconds().max(0)),
            current_period,
            last_cycle,
        });
    }

    fn install_if_changed(&self, plan: SchedulePlan) -> bool {
        let changed = **self.plan_tx.borrow() != plan;
        if changed {
            info!(cycles = plan.len(), "installing new schedule plan");
            self.plan_tx.send_replace(Arc::new(plan));
        }
        changed
    }

    /// Re-synthesize from current factors and install if the result differs.
    /// Purely a function of settings + daylight + latest sample.
    async fn resynthesize(&self) -> Result<bool> {
        let ad = self
            .adaptive
            .as_ref()
            .expect("resynthesize is only reachable for the adaptive strategy");
        let sample = ad.environment.latest_sample().await;
        let daylight = ad.environment.daylight_today();
        let settings = ad.settings.lock().unwrap().clone();

        let plan = adaptive::synthesize(&settings, daylight.as_ref(), &sample)?;
        if let Some(reference) = &ad.reference {
            *ad.report.lock().unwrap() = Some(adaptive::validate_against(&plan, reference));
        }
        Ok(self.install_if_changed(plan))
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

async fn worker_loop(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    info!(strategy = inner.strategy_name(), "worker started");
    match &inner.strategy {
        Strategy::Interval(spec) => {
            let spec = spec.clone();
            interval_loop(&inner, &spec, &mut shutdown).await;
        }
        _ => plan_loop(&inner, &mut shutdown).await,
    }

    // Release the device on every exit path; the last command a stopping
    // scheduler sends is OFF.
    if let Err(e) = inner.device.turn_off().await {
        warn!("could not verify device OFF during shutdown: {e}");
    }
    inner.publish(SchedulerState::Stopped, None, None);
    info!("worker stopped");
}

fn cancelled(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow()
}

/// Poll the wall clock until `deadline` or cancellation, publishing `state`
/// each tick. Returns true when cancelled.
async fn wait_phase(
    inner: &Inner,
    shutdown: &mut watch::Receiver<bool>,
    deadline: DateTime<Tz>,
    state: SchedulerState,
    next_event: Option<DateTime<Tz>>,
    last_cycle: &Option<Cycle>,
) -> bool {
    loop {
        if inner.clock.now() >= deadline {
            return false;
        }
        inner.publish(state, next_event, last_cycle.clone());
        tokio::select! {
            _ = tokio::time::sleep(POLL_TICK) => {}
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    return true;
                }
            }
        }
    }
}

enum IdleEnd {
    Reached,
    PlanChanged,
    Cancelled,
}

/// Between-cycle wait: publishes `drain` until the drain deadline passes and
/// `waiting` after, watches for plan replacement, and polls the clock.
async fn wait_idle(
    inner: &Inner,
    shutdown: &mut watch::Receiver<bool>,
    plan_rx: &mut watch::Receiver<Arc<SchedulePlan>>,
    deadline: DateTime<Tz>,
    drain_until: Option<DateTime<Tz>>,
    last_cycle: &Option<Cycle>,
) -> IdleEnd {
    loop {
        let now = inner.clock.now();
        if now >= deadline {
            return IdleEnd::Reached;
        }
        let state = if drain_until.is_some_and(|d| now < d) {
            SchedulerState::Drain
        } else {
            SchedulerState::Waiting
        };
        inner.publish(state, Some(deadline), last_cycle.clone());
        tokio::select! {
            _ = tokio::time::sleep(POLL_TICK) => {}
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    return IdleEnd::Cancelled;
                }
            }
            res = plan_rx.changed() => {
                if res.is_ok() {
                    return IdleEnd::PlanChanged;
                }
            }
        }
    }
}

/// Time-of-day and adaptive execution: follow the installed plan.
async fn plan_loop(inner: &Arc<Inner>, shutdown: &mut watch::Receiver<bool>) {
    let mut plan_rx = inner.plan_tx.subscribe();
    let mut last_fired: Option<DateTime<Tz>> = None;
    let mut last_cycle: Option<Cycle> = None;
    let mut drain_until: Option<DateTime<Tz>> = None;

    loop {
        if cancelled(shutdown) {
            break;
        }

        let plan = plan_rx.borrow_and_update().clone();
        let now = inner.clock.now();

        let Some((due_at, cycle)) = plan.next_due(now, last_fired) else {
            inner.publish(SchedulerState::Waiting, None, last_cycle.clone());
            tokio::select! {
                _ = tokio::time::sleep(POLL_TICK) => {}
                _ = shutdown.changed() => {}
                _ = plan_rx.changed() => {}
            }
            continue;
        };
        let cycle = cycle.clone();

        match wait_idle(inner, shutdown, &mut plan_rx, due_at, drain_until, &last_cycle).await {
            IdleEnd::Cancelled => break,
            // Re-resolve the next due cycle against the replacement plan.
            IdleEnd::PlanChanged => continue,
            IdleEnd::Reached => {}
        }
        drain_until = None;

        // Flood. A failed command is logged and the phase advances anyway;
        // the state reconciles at the next transition.
        info!(on_time = %cycle.on_time, flood_minutes = cycle.flood_minutes, "flood: device ON");
        inner.publish(SchedulerState::Flood, Some(due_at), last_cycle.clone());
        if let Err(e) = inner.device.turn_on().await {
            error!("flood ON failed: {e}");
        }
        last_fired = Some(due_at);

        let flood_end = due_at + minutes_f(cycle.flood_minutes);
        if wait_phase(inner, shutdown, flood_end, SchedulerState::Flood, Some(flood_end), &last_cycle).await {
            break;
        }

        // Drain.
        info!(off_minutes = cycle.off_minutes, "drain: device OFF");
        inner.publish(SchedulerState::Drain, None, last_cycle.clone());
        if let Err(e) = inner.device.turn_off().await {
            error!("drain OFF failed: {e}");
        }
        drain_until = Some(flood_end + minutes_f(cycle.off_minutes));
        last_cycle = Some(cycle);
        // The drain timer runs inside the next wait_idle; an earlier due
        // cycle (midnight wrap) may preempt it.
    }
}

/// Fixed-interval execution: ON(flood) → OFF(drain) → wait, anchored at each
/// cycle's start so wall-clock jumps never cause catch-up bursts.
async fn interval_loop(
    inner: &Arc<Inner>,
    spec: &IntervalSpec,
    shutdown: &mut watch::Receiver<bool>,
) {
    let mut last_cycle: Option<Cycle> = None;

    loop {
        if cancelled(shutdown) {
            break;
        }

        let now = inner.clock.now();
        let time_now = TimeOfDay::from_naive(now.time());

        if !spec.within_active_hours(time_now) {
            // Suppressed: jump to the window open and re-anchor there.
            let (start, _) = spec.active_hours.expect("outside hours implies a window");
            let open_at = next_window_open(now, start);
            info!(open_at = %open_at, "outside active hours — waiting for window");
            if wait_phase(inner, shutdown, open_at, SchedulerState::Waiting, Some(open_at), &last_cycle).await {
                break;
            }
            continue;
        }

        // One full cycle anchored at its own start.
        let cycle_start = now;
        info!(flood_minutes = spec.flood_minutes, "flood: device ON");
        inner.publish(SchedulerState::Flood, None, last_cycle.clone());
        if let Err(e) = inner.device.turn_on().await {
            error!("flood ON failed: {e}");
        }

        let flood_end = cycle_start + minutes_f(spec.flood_minutes);
        let next_target = cycle_start + minutes_f(spec.interval_minutes);
        if wait_phase(inner, shutdown, flood_end, SchedulerState::Flood, Some(next_target), &last_cycle).await {
            break;
        }

        info!(drain_minutes = spec.drain_minutes, "drain: device OFF");
        inner.publish(SchedulerState::Drain, Some(next_target), last_cycle.clone());
        if let Err(e) = inner.device.turn_off().await {
            error!("drain OFF failed: {e}");
        }
        last_cycle = Some(Cycle::new(
            TimeOfDay::from_naive(cycle_start.time()),
            spec.flood_minutes,
            spec.drain_minutes,
        ));

        // interval >= flood + drain, so the drain always ends by next_target.
        let drain_end = flood_end + minutes_f(spec.drain_minutes);
        if wait_phase(inner, shutdown, drain_end, SchedulerState::Drain, Some(next_target), &last_cycle).await {
            break;
        }
        if wait_phase(inner, shutdown, next_target, SchedulerState::Waiting, Some(next_target), &last_cycle).await {
            break;
        }
    }
}

fn next_window_open(now: DateTime<Tz>, start: TimeOfDay) -> DateTime<Tz> {
    let today_open = local_instant(now.date_naive(), start, now.timezone());
    if today_open > now {
        today_open
    } else {
        local_instant(now.date_naive() + Duration::days(1), start, now.timezone())
    }
}

// ---------------------------------------------------------------------------
// Adaptive refresh task
// ---------------------------------------------------------------------------

/// Re-synthesis triggers: local midnight crossing, a fresh sample changing
/// any band membership. Settings replacement re-synthesizes inline in
/// `replan_settings`. Installing an identical plan is suppressed, so the
/// worker is never perturbed by a no-op refresh.
async fn refresh_loop(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    let ad = inner
        .adaptive
        .as_ref()
        .expect("refresh loop only runs for the adaptive strategy");

    let mut last_date = inner.clock.today();
    let mut last_fingerprint = {
        let sample = ad.environment.latest_sample().await;
        adaptive::factor_fingerprint(&ad.settings.lock().unwrap().clone(), &sample)
    };

    loop {
        tokio::select! {
            _ = tokio::time::sleep(ADAPTIVE_REFRESH_TICK) => {}
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }

        let today = inner.clock.today();
        let sample = ad.environment.latest_sample().await;
        let settings = ad.settings.lock().unwrap().clone();
        let fingerprint = adaptive::factor_fingerprint(&settings, &sample);

        if today == last_date && fingerprint == last_fingerprint {
            continue;
        }

        info!(
            midnight_crossed = today != last_date,
            band_changed = fingerprint != last_fingerprint,
            "re-synthesizing adaptive plan"
        );
        match inner.resynthesize().await {
            Ok(changed) => {
                if changed {
                    info!("adaptive plan replaced");
                }
            }
            Err(e) => error!("re-synthesis failed: {e}"),
        }
        last_date = today;
        last_fingerprint = fingerprint;
    }
}

// ===========================================================================
// Tests
// ===========================================================================
