//! Constant-current discharge down to the end-of-discharge voltage.

use crate::control_loop::{
    Cadence, ChargeIntegrator, CycleError, LoopContext, ParkGuard, Phase, RunSummary,
    TerminationReason,
};
use crate::instrument::{Measurement, ParkOutcome, PowerSupply, SupplyIo};
use crate::policy::CyclePolicy;
use crate::profile::BatteryProfile;
use crate::sync::{Activity, CycleSnapshot, StatusExchange};
use std::sync::atomic::AtomicBool;
use tracing::{info, info_span, warn, Span};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DischargeState {
    Discharging,
    Terminated(TerminationReason),
}

/// Constant-current discharge at `capacity / rate` down to EODV.
pub struct DischargeController<'a, IO: SupplyIo> {
    supply: &'a PowerSupply<IO>,
    profile: &'a BatteryProfile,
    policy: &'a CyclePolicy,
    rate: f64,
    amount_mah: Option<f64>,
    abort: Option<&'a AtomicBool>,
    exchange: Option<&'a StatusExchange>,
    state: DischargeState,
    span: Span,
}

impl<'a, IO: SupplyIo> DischargeController<'a, IO> {
    pub fn new(
        supply: &'a PowerSupply<IO>,
        profile: &'a BatteryProfile,
        policy: &'a CyclePolicy,
        rate: f64,
    ) -> Self {
        Self {
            supply,
            profile,
            policy,
            rate,
            amount_mah: None,
            abort: None,
            exchange: None,
            state: DischargeState::Discharging,
            span: info_span!(target: "discharge", "discharge", profile = %profile.name, rate),
        }
    }

    pub fn with_amount_limit(mut self, amount_mah: Option<f64>) -> Self {
        self.amount_mah = amount_mah;
        self
    }

    pub fn with_abort(mut self, abort: &'a AtomicBool) -> Self {
        self.abort = Some(abort);
        self
    }

    pub fn with_exchange(mut self, exchange: &'a StatusExchange) -> Self {
        self.exchange = Some(exchange);
        self
    }

    pub fn state(&self) -> DischargeState {
        self.state
    }

    pub fn run(&mut self) -> Result<RunSummary, CycleError> {
        if !(self.rate.is_finite() && self.rate > 0.0) {
            return Err(CycleError::InvalidRate(self.rate));
        }

        let span = self.span.clone();
        let _enter = span.enter();

        let mut ctx = LoopContext::new(self.supply, self.policy, self.abort, self.exchange);
        let clock = self.supply.clock().clone();
        let profile = self.profile;
        let policy = self.policy;
        let milliamps = profile.c_rate(self.rate);

        info!(target: "discharge", eodv = profile.eodv, "starting");
        info!(
            target: "discharge",
            "setting discharge current to {:.0} mA (C/{})",
            milliamps,
            self.rate
        );

        let guard = ParkGuard::new(self.supply);
        ctx.program(policy.discharge_floor_volts, milliamps)?;
        ctx.set_output(true)?;
        self.state = DischargeState::Discharging;
        ctx.set_activity(Activity::Discharging);

        let t_start = clock.elapsed();
        let mut cadence = Cadence::new(policy.loop_interval, t_start);
        let mut integrator = ChargeIntegrator::new(policy.loop_interval);
        let mut last: Option<Measurement> = None;
        let mut logged_mah = 0.0;
        let mut iterations = 0u64;

        let reason = loop {
            if ctx.aborted() {
                break TerminationReason::Interrupted;
            }

            if let Some(m) = ctx.measure()? {
                last = Some(m);
                iterations += 1;
                integrator.discharge(m.amps);
                let mah = integrator.mah();
                let now = clock.elapsed();

                if (mah - logged_mah).abs() > policy.discharge_progress_mah {
                    info!(
                        target: "discharge",
                        volts = m.volts,
                        amps = m.amps,
                        mah,
                        "{:.3} V, {:.3} A, {:.0} mAh",
                        m.volts,
                        m.amps,
                        mah
                    );
                    logged_mah = mah;
                }

                if m.volts < profile.eodv {
                    break TerminationReason::BelowEodv;
                }
                if self.amount_mah.is_some_and(|amount| mah.abs() > amount) {
                    info!(target: "discharge", mah, "requested amount discharged");
                    break TerminationReason::AmountReached;
                }
                if let Some(limit) = policy.discharge_timeout {
                    if now - t_start > limit {
                        warn!(
                            target: "discharge",
                            "timeout error (over {:.1} hours discharging)",
                            limit.as_secs_f64() / 3600.0
                        );
                        break TerminationReason::TimeoutTotal;
                    }
                }

                ctx.publish(CycleSnapshot {
                    activity: Activity::Discharging,
                    volts: m.volts,
                    amps: m.amps,
                    accumulated_mah: mah,
                    elapsed_s: (now - t_start).as_secs_f64(),
                    iteration: iterations,
                });
            }

            cadence.wait(clock.as_ref());
        };

        self.state = DischargeState::Terminated(reason);
        let elapsed_minutes = (clock.elapsed() - t_start).as_secs_f64() / 60.0;
        info!(
            target: "discharge",
            %reason,
            mah = integrator.mah(),
            "ended in {:.0} minutes: {}",
            elapsed_minutes,
            reason
        );

        let parked = guard.finish(&ctx)?;

        Ok(RunSummary {
            phase: Phase::Discharge,
            elapsed_minutes,
            final_volts: last.map_or(f64::NAN, |m| m.volts),
            final_amps: last.map_or(f64::NAN, |m| m.amps),
            accumulated_mah: integrator.mah(),
            reason,
            iterations,
            parked: matches!(parked, ParkOutcome::Parked { .. }),
        })
    }
}
