//! Constant-current / constant-voltage charge with open-circuit-voltage check,
//! precharge of deeply discharged cells and current-taper termination.
//!
//! Reference profile: Panasonic lithium-ion charging guideline (precharge below
//! EODV at a low C-rate, then CC/CV at EOCV until the current tapers).

use crate::control_loop::{
    Cadence, ChargeIntegrator, CycleError, LoopContext, ParkGuard, Phase, RunSummary,
    TerminationReason,
};
use crate::instrument::{Measurement, ParkOutcome, PowerSupply, SupplyIo};
use crate::policy::CyclePolicy;
use crate::profile::BatteryProfile;
use crate::sync::{Activity, CycleSnapshot, StatusExchange};
use std::sync::atomic::AtomicBool;
use std::time::Duration;
use tracing::{info, info_span, warn, Span};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeState {
    AwaitingOcvStability,
    Precharging,
    Charging,
    Terminated(TerminationReason),
}

/// Where the charge stood when it ended.
struct Progress {
    /// Start of the elapsed-time measurement
    since: Duration,
    last: Option<Measurement>,
    accumulated_mah: f64,
    iterations: u64,
}

impl Progress {
    fn empty(since: Duration, last: Option<Measurement>) -> Self {
        Self {
            since,
            last,
            accumulated_mah: 0.0,
            iterations: 0,
        }
    }
}

pub struct ChargeController<'a, IO: SupplyIo> {
    supply: &'a PowerSupply<IO>,
    profile: &'a BatteryProfile,
    policy: &'a CyclePolicy,
    amount_mah: Option<f64>,
    abort: Option<&'a AtomicBool>,
    exchange: Option<&'a StatusExchange>,
    state: ChargeState,
    span: Span,
}

impl<'a, IO: SupplyIo> ChargeController<'a, IO> {
    pub fn new(
        supply: &'a PowerSupply<IO>,
        profile: &'a BatteryProfile,
        policy: &'a CyclePolicy,
    ) -> Self {
        Self {
            supply,
            profile,
            policy,
            amount_mah: None,
            abort: None,
            exchange: None,
            state: ChargeState::AwaitingOcvStability,
            span: info_span!(target: "charge", "charge", profile = %profile.name),
        }
    }

    /// Stop once this many mAh have gone into the cell.
    pub fn with_amount_limit(mut self, amount_mah: Option<f64>) -> Self {
        self.amount_mah = amount_mah;
        self
    }

    /// Flag checked at every iteration; when set the run ends as `Interrupted`.
    pub fn with_abort(mut self, abort: &'a AtomicBool) -> Self {
        self.abort = Some(abort);
        self
    }

    pub fn with_exchange(mut self, exchange: &'a StatusExchange) -> Self {
        self.exchange = Some(exchange);
        self
    }

    pub fn state(&self) -> ChargeState {
        self.state
    }

    pub fn run(&mut self) -> Result<RunSummary, CycleError> {
        let span = self.span.clone();
        let _enter = span.enter();

        let mut ctx = LoopContext::new(self.supply, self.policy, self.abort, self.exchange);
        let clock = self.supply.clock().clone();
        let profile = self.profile;
        let policy = self.policy;
        let run_start = clock.elapsed();

        info!(
            target: "charge",
            eocv = profile.eocv,
            eodv = profile.eodv,
            capacity_mah = profile.capacity_mah,
            "starting"
        );

        let guard = ParkGuard::new(self.supply);

        // Park first, then hold EOCV at 0 mA so the terminal voltage reads as OCV
        // without the supply pulling current out of the cell.
        ctx.park()?;
        ctx.program(profile.eocv, 0.0)?;
        ctx.set_output(true)?;

        self.state = ChargeState::AwaitingOcvStability;
        ctx.set_activity(Activity::AwaitingOcv);

        let ocv = match self.await_ocv(&mut ctx)? {
            Some(ocv) => ocv,
            None => {
                return self.finish(
                    guard,
                    &ctx,
                    TerminationReason::Interrupted,
                    Progress::empty(run_start, None),
                )
            }
        };

        if ocv.volts > profile.eocv - policy.full_margin_volts {
            info!(
                target: "charge",
                ocv = ocv.volts,
                eocv = profile.eocv,
                "open-circuit voltage already at end-of-charge voltage"
            );
            return self.finish(
                guard,
                &ctx,
                TerminationReason::AlreadyFull,
                Progress::empty(run_start, Some(ocv)),
            );
        }

        let t_start = clock.elapsed();
        let mut cadence = Cadence::new(policy.loop_interval, t_start);
        let mut integrator = ChargeIntegrator::new(policy.loop_interval);
        let mut precharge_started: Option<Duration> = None;
        let mut charge_started: Option<Duration> = None;
        let mut last = ocv;
        let mut logged_mah = 0.0;
        let mut iterations = 0u64;

        let reason = loop {
            if ctx.aborted() {
                break TerminationReason::Interrupted;
            }

            if let Some(m) = ctx.measure()? {
                last = m;
                iterations += 1;
                integrator.charge(m.amps);
                let mah = integrator.mah();
                let now = clock.elapsed();

                if mah - logged_mah > policy.charge_progress_mah {
                    info!(target: "charge", volts = m.volts, mah, "{:.3} V, {:.0} mAh", m.volts, mah);
                    logged_mah = mah;
                }

                if now - t_start > policy.total_timeout {
                    warn!(
                        target: "charge",
                        "timeout error (over {:.1} hours total)",
                        policy.total_timeout.as_secs_f64() / 3600.0
                    );
                    break TerminationReason::TimeoutTotal;
                }
                if m.volts > profile.eocv + policy.overvoltage_margin_volts {
                    warn!(target: "charge", volts = m.volts, eocv = profile.eocv, "overcharged");
                    break TerminationReason::Overcharged;
                }
                if self.amount_mah.is_some_and(|amount| mah >= amount) {
                    info!(target: "charge", mah, "requested amount charged");
                    break TerminationReason::AmountReached;
                }

                if m.volts < profile.eodv {
                    match precharge_started {
                        None => {
                            let milliamps = profile.c_rate(policy.precharge_divisor);
                            ctx.program(profile.eocv, milliamps)?;
                            info!(
                                target: "charge",
                                volts = m.volts,
                                eodv = profile.eodv,
                                "precharging at {:.0} mA (C/{}), voltage under EODV",
                                milliamps,
                                policy.precharge_divisor
                            );
                            precharge_started = Some(now);
                            self.state = ChargeState::Precharging;
                        }
                        Some(started) if now - started > policy.precharge_timeout => {
                            warn!(
                                target: "charge",
                                "timeout error (over {:.1} hours below EODV)",
                                policy.precharge_timeout.as_secs_f64() / 3600.0
                            );
                            break TerminationReason::PrechargeTimeout;
                        }
                        Some(_) => {}
                    }
                } else {
                    match charge_started {
                        None => {
                            let milliamps = profile.c_rate(policy.charge_divisor);
                            ctx.program(profile.eocv, milliamps)?;
                            info!(
                                target: "charge",
                                "charging at {:.0} mA (C/{})",
                                milliamps,
                                policy.charge_divisor
                            );
                            charge_started = Some(now);
                            self.state = ChargeState::Charging;
                        }
                        Some(started) => {
                            let end_milliamps = profile.c_rate(policy.end_divisor);
                            if m.milliamps() < end_milliamps
                                && now - started >= policy.min_charge_time
                            {
                                info!(
                                    target: "charge",
                                    "end charge, charging current ({:.0} mA) less than C/{}",
                                    m.milliamps(),
                                    policy.end_divisor
                                );
                                break TerminationReason::CurrentTaperComplete;
                            }
                            if now - started > policy.charge_timeout {
                                warn!(
                                    target: "charge",
                                    "timeout error (over {:.1} hours charging)",
                                    policy.charge_timeout.as_secs_f64() / 3600.0
                                );
                                break TerminationReason::ChargeTimeout;
                            }
                        }
                    }
                }

                ctx.publish(CycleSnapshot {
                    activity: match self.state {
                        ChargeState::Precharging => Activity::Precharging,
                        _ => Activity::Charging,
                    },
                    volts: m.volts,
                    amps: m.amps,
                    accumulated_mah: mah,
                    elapsed_s: (now - t_start).as_secs_f64(),
                    iteration: iterations,
                });
            }

            cadence.wait(clock.as_ref());
        };

        if cadence.missed() > 0 {
            info!(target: "charge", missed = cadence.missed(), "loop boundaries missed");
        }

        let progress = Progress {
            since: t_start,
            last: Some(last),
            accumulated_mah: integrator.mah(),
            iterations,
        };
        self.finish(guard, &ctx, reason, progress)
    }

    /// Poll until the open-circuit voltage stops drifting. `None` when
    /// interrupted.
    fn await_ocv(
        &mut self,
        ctx: &mut LoopContext<'_, IO>,
    ) -> Result<Option<Measurement>, CycleError> {
        let clock = self.supply.clock().clone();
        let policy = self.policy;

        let mut previous = loop {
            if ctx.aborted() {
                return Ok(None);
            }
            if let Some(m) = ctx.measure()? {
                break m;
            }
            clock.sleep(policy.loop_interval);
        };
        let mut previous_at = clock.elapsed();
        let started = previous_at;

        loop {
            if ctx.aborted() {
                return Ok(None);
            }
            clock.sleep(policy.loop_interval);
            let Some(m) = ctx.measure()? else {
                continue;
            };
            let now = clock.elapsed();
            let dt_s = (now - previous_at).as_secs_f64();
            let rate = if dt_s > 0.0 {
                (m.volts - previous.volts).abs() * 1000.0 * (60.0 / dt_s)
            } else {
                f64::INFINITY
            };
            info!(
                target: "charge",
                ocv = m.volts,
                mv_per_min = rate,
                "OCV = {:.3} V, change {:.4} mV/min",
                m.volts,
                rate
            );
            previous = m;
            previous_at = now;

            ctx.publish(CycleSnapshot {
                activity: Activity::AwaitingOcv,
                volts: m.volts,
                amps: m.amps,
                accumulated_mah: 0.0,
                elapsed_s: (now - started).as_secs_f64(),
                iteration: 0,
            });

            if rate < policy.ocv_stability_mv_per_min {
                return Ok(Some(m));
            }
            if let Some(limit) = policy.ocv_settle_timeout {
                if now - started > limit {
                    warn!(
                        target: "charge",
                        ocv = m.volts,
                        "OCV did not settle within {} minutes, continuing",
                        limit.as_secs() / 60
                    );
                    return Ok(Some(m));
                }
            }
        }
    }

    fn finish(
        &mut self,
        guard: ParkGuard<'_, IO>,
        ctx: &LoopContext<'_, IO>,
        reason: TerminationReason,
        progress: Progress,
    ) -> Result<RunSummary, CycleError> {
        let Progress {
            since,
            last,
            accumulated_mah,
            iterations,
        } = progress;
        self.state = ChargeState::Terminated(reason);
        let elapsed_minutes = (ctx.clock().elapsed().saturating_sub(since)).as_secs_f64() / 60.0;
        info!(
            target: "charge",
            %reason,
            mah = accumulated_mah,
            "ended in {:.0} minutes: {}",
            elapsed_minutes,
            reason
        );

        let parked = guard.finish(ctx)?;

        Ok(RunSummary {
            phase: Phase::Charge,
            elapsed_minutes,
            final_volts: last.map_or(f64::NAN, |m| m.volts),
            final_amps: last.map_or(f64::NAN, |m| m.amps),
            accumulated_mah,
            reason,
            iterations,
            parked: matches!(parked, ParkOutcome::Parked { .. }),
        })
    }
}
