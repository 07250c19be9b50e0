//! Strategy selection: validated configuration in, wired scheduler out.
//!
//! The factory never partially constructs anything; every failure surfaces
//! before a worker exists.

use std::sync::Arc;

use crate::clock::SharedClock;
use crate::config::{AppConfig, ScheduleSpec};
use crate::device::DeviceController;
use crate::environment::EnvironmentalService;
use crate::error::{Error, Result};
use crate::plan::{Bounds, Cycle, SchedulePlan};
use crate::scheduler::Scheduler;
use crate::timefmt::TimeOfDay;

pub struct SchedulerFactory {
    device: Arc<DeviceController>,
    environment: Arc<EnvironmentalService>,
    clock: SharedClock,
}

impl SchedulerFactory {
    pub fn new(
        device: Arc<DeviceController>,
        environment: Arc<EnvironmentalService>,
        clock: SharedClock,
    ) -> Self {
        Self {
            device,
            environment,
            clock,
        }
    }

    pub fn build(&self, config: &AppConfig) -> Result<Scheduler> {
        match &config.schedule {
            ScheduleSpec::Nft => Err(Error::NotImplemented("nft")),

            ScheduleSpec::Interval(spec) => Scheduler::interval(
                spec.clone(),
                Arc::clone(&self.device),
                Arc::clone(&self.clock),
            ),

            ScheduleSpec::TimeOfDay {
                flood_minutes,
                cycles,
            } => {
                let adaptive = config
                    .adaptation
                    .as_ref()
                    .and_then(|a| a.adaptive.clone());

                match adaptive {
                    Some(settings) => {
                        // Literal cycles, when present, become the analytic
                        // reference for the validation report only.
                        let reference = if cycles.is_empty() {
                            None
                        } else {
                            Some(build_plan(
                                *flood_minutes,
                                cycles,
                                &settings.constraints.bounds(),
                            )?)
                        };
                        Scheduler::adaptive(
                            settings,
                            reference,
                            Arc::clone(&self.environment),
                            Arc::clone(&self.device),
                            Arc::clone(&self.clock),
                        )
                    }
                    None => {
                        let mut plan = build_plan(*flood_minutes, cycles, &Bounds::default())?;
                        // Daylight tracking for literal schedules: align the
                        // earliest cycle with today's sunrise.
                        let shift = config
                            .adaptation
                            .as_ref()
                            .is_some_and(|a| a.shift_schedule);
                        if shift {
                            if let Some(daylight) = self.environment.daylight_today() {
                                plan = plan.shifted_to_sunrise(daylight.sunrise);
                            }
                        }
                        Scheduler::time_of_day(
                            plan,
                            Arc::clone(&self.device),
                            Arc::clone(&self.clock),
                        )
                    }
                }
            }
        }
    }
}

pub fn build_plan(
    flood_minutes: f64,
    cycles: &[(TimeOfDay, f64)],
    bounds: &Bounds,
) -> Result<SchedulePlan> {
    let cycles = cycles
        .iter()
        .map(|(on_time, off)| Cycle::new(*on_time, flood_minutes, *off))
        .collect();
    let plan = SchedulePlan::new(cycles, bounds)?;
    if plan.has_deviations() {
        tracing::warn!("schedule contained out-of-bounds durations — clamped");
    }
    Ok(plan)
}

// ===========================================================================
// Tests
// ===========================================================================
