//! Repeated charge/discharge cycling with rest periods between phases.

use crate::charge::ChargeController;
use crate::control_loop::{CycleError, LoopContext, RunSummary, TerminationReason};
use crate::discharge::DischargeController;
use crate::instrument::{PowerSupply, SupplyIo};
use crate::policy::CyclePolicy;
use crate::profile::BatteryProfile;
use crate::sync::{Activity, StatusExchange};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::AtomicBool;
use std::time::Duration;
use tracing::{info, info_span};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Charge,
    Discharge,
    Cycle,
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "charge" => Ok(Mode::Charge),
            "discharge" => Ok(Mode::Discharge),
            "cycle" => Ok(Mode::Cycle),
            other => Err(format!(
                "unknown mode {other:?} (expected charge, discharge or cycle)"
            )),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Charge => f.write_str("charge"),
            Mode::Discharge => f.write_str("discharge"),
            Mode::Cycle => f.write_str("cycle"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CyclePlan {
    pub cycles: u32,
    pub discharge_rate: f64,
    pub amount_mah: Option<f64>,
    /// Rest at high impedance after charging, before the discharge starts.
    pub rest_after_charge: Duration,
    /// Rest at high impedance after discharging, before the next charge.
    pub rest_after_discharge: Duration,
}

impl Default for CyclePlan {
    fn default() -> Self {
        Self {
            cycles: 1,
            discharge_rate: 8.0,
            amount_mah: None,
            rest_after_charge: Duration::ZERO,
            rest_after_discharge: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CycleReport {
    pub index: u32,
    pub charge: RunSummary,
    pub discharge: Option<RunSummary>,
}

pub struct CycleRunner<'a, IO: SupplyIo> {
    supply: &'a PowerSupply<IO>,
    profile: &'a BatteryProfile,
    policy: &'a CyclePolicy,
    plan: &'a CyclePlan,
    abort: Option<&'a AtomicBool>,
    exchange: Option<&'a StatusExchange>,
}

impl<'a, IO: SupplyIo> CycleRunner<'a, IO> {
    pub fn new(
        supply: &'a PowerSupply<IO>,
        profile: &'a BatteryProfile,
        policy: &'a CyclePolicy,
        plan: &'a CyclePlan,
    ) -> Self {
        Self {
            supply,
            profile,
            policy,
            plan,
            abort: None,
            exchange: None,
        }
    }

    pub fn with_abort(mut self, abort: &'a AtomicBool) -> Self {
        self.abort = Some(abort);
        self
    }

    pub fn with_exchange(mut self, exchange: &'a StatusExchange) -> Self {
        self.exchange = Some(exchange);
        self
    }

    /// Run every planned cycle. `on_phase` sees each summary as soon as its phase
    /// ends. Stops early, with the partial report, when a phase is interrupted.
    pub fn run(
        &self,
        mut on_phase: impl FnMut(u32, &RunSummary),
    ) -> Result<Vec<CycleReport>, CycleError> {
        let span = info_span!(target: "cycle", "cycle", profile = %self.profile.name);
        let _enter = span.enter();
        let mut reports = Vec::new();

        for index in 1..=self.plan.cycles {
            info!(target: "cycle", index, total = self.plan.cycles, "starting cycle");

            let charge = self.charge().run()?;
            on_phase(index, &charge);
            if charge.reason == TerminationReason::Interrupted {
                reports.push(CycleReport {
                    index,
                    charge,
                    discharge: None,
                });
                break;
            }

            if !self.rest(self.plan.rest_after_charge) {
                reports.push(CycleReport {
                    index,
                    charge,
                    discharge: None,
                });
                break;
            }

            let discharge = self.discharge().run()?;
            on_phase(index, &discharge);
            let interrupted = discharge.reason == TerminationReason::Interrupted;
            reports.push(CycleReport {
                index,
                charge,
                discharge: Some(discharge),
            });
            if interrupted {
                break;
            }

            if index < self.plan.cycles && !self.rest(self.plan.rest_after_discharge) {
                break;
            }
        }

        info!(target: "cycle", completed = reports.len(), "cycling finished");
        Ok(reports)
    }

    fn charge(&self) -> ChargeController<'a, IO> {
        let mut controller = ChargeController::new(self.supply, self.profile, self.policy)
            .with_amount_limit(self.plan.amount_mah);
        if let Some(abort) = self.abort {
            controller = controller.with_abort(abort);
        }
        if let Some(exchange) = self.exchange {
            controller = controller.with_exchange(exchange);
        }
        controller
    }

    fn discharge(&self) -> DischargeController<'a, IO> {
        let mut controller = DischargeController::new(
            self.supply,
            self.profile,
            self.policy,
            self.plan.discharge_rate,
        )
        .with_amount_limit(self.plan.amount_mah);
        if let Some(abort) = self.abort {
            controller = controller.with_abort(abort);
        }
        if let Some(exchange) = self.exchange {
            controller = controller.with_exchange(exchange);
        }
        controller
    }

    /// Wait at high impedance. Returns false when interrupted.
    fn rest(&self, duration: Duration) -> bool {
        if duration.is_zero() {
            return true;
        }
        let ctx = LoopContext::new(self.supply, self.policy, self.abort, self.exchange);
        let clock = self.supply.clock();
        ctx.set_activity(Activity::Resting);
        info!(target: "cycle", minutes = duration.as_secs() / 60, "resting");

        let until = clock.elapsed() + duration;
        loop {
            if ctx.aborted() {
                info!(target: "cycle", "rest interrupted");
                return false;
            }
            let now = clock.elapsed();
            if now >= until {
                return true;
            }
            clock.sleep((until - now).min(self.policy.loop_interval));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::safety::SupplyLimits;
    use crate::testing::ScriptedSupply;
    use std::sync::Arc;

    #[test]
    fn parses_modes() {
        assert_eq!("Cycle".parse::<Mode>(), Ok(Mode::Cycle));
        assert!("trickle".parse::<Mode>().is_err());
    }

    #[test]
    fn full_cycle_runs_charge_then_discharge_with_rest() {
        let script = ScriptedSupply::new();
        let clock = Arc::new(ManualClock::new());
        let supply = PowerSupply::new(script.clone(), clock.clone(), SupplyLimits::hp6632b());

        // Charge: park, two OCV samples, entry, taper.
        script.push_readings(&[
            (3.6, 0.0),
            (3.6, 0.0),
            (3.6, 0.0),
            (3.7, 0.2),
            (4.19, 0.01),
        ]);
        // Terminal park after charge, then discharge down through EODV, then park.
        script.push_readings(&[(4.15, 0.0), (3.9, -0.5), (2.95, -0.5), (3.2, 0.0)]);

        let profile = BatteryProfile::new("cell", 4.2, 3.0, 2000.0).unwrap();
        let policy = CyclePolicy::default();
        let plan = CyclePlan {
            cycles: 1,
            discharge_rate: 4.0,
            rest_after_charge: Duration::from_secs(1800),
            ..CyclePlan::default()
        };
        let mut phases = Vec::new();

        let reports = CycleRunner::new(&supply, &profile, &policy, &plan)
            .run(|index, summary| phases.push((index, summary.phase, summary.reason)))
            .unwrap();

        assert_eq!(reports.len(), 1);
        let discharge = reports[0].discharge.as_ref().unwrap();
        assert_eq!(discharge.reason, TerminationReason::BelowEodv);
        assert_eq!(
            reports[0].charge.reason,
            TerminationReason::CurrentTaperComplete
        );
        assert_eq!(phases.len(), 2);
        assert!(script.setpoints().contains(&(1.0, 500.0)));
        // Rest after charge is included, the trailing rest is skipped on the last cycle.
        assert!(clock.elapsed() >= Duration::from_secs(1800));
        assert!(clock.elapsed() < Duration::from_secs(3600));
    }

    #[test]
    fn interrupted_charge_skips_discharge() {
        let script = ScriptedSupply::new();
        script.push_reading(3.6, 0.0);
        let supply = PowerSupply::new(
            script,
            Arc::new(ManualClock::new()),
            SupplyLimits::hp6632b(),
        );
        let profile = BatteryProfile::new("cell", 4.2, 3.0, 2000.0).unwrap();
        let policy = CyclePolicy::default();
        let plan = CyclePlan {
            cycles: 3,
            ..CyclePlan::default()
        };
        let abort = AtomicBool::new(true);

        let reports = CycleRunner::new(&supply, &profile, &policy, &plan)
            .with_abort(&abort)
            .run(|_, _| {})
            .unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].charge.reason, TerminationReason::Interrupted);
        assert!(reports[0].discharge.is_none());
    }
}
