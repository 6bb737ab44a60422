//! Machinery shared by the charge and discharge state machines: termination
//! reasons, run summary, the mAh integrator, loop cadence, bounded transport
//! retries and the park-on-exit guard.

use crate::clock::Clock;
use crate::instrument::{Measurement, ParkOutcome, PowerSupply, Reading, SupplyIo, TransportError};
use crate::policy::CyclePolicy;
use crate::safety::{SafetyViolation, Setpoint};
use crate::sync::{Activity, CycleSnapshot, StatusExchange};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Charge,
    Discharge,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Charge => f.write_str("charge"),
            Phase::Discharge => f.write_str("discharge"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    AlreadyFull,
    TimeoutTotal,
    Overcharged,
    AmountReached,
    PrechargeTimeout,
    CurrentTaperComplete,
    ChargeTimeout,
    BelowEodv,
    Interrupted,
}

impl TerminationReason {
    /// Whether the run ended on its own terms rather than a limit or an operator.
    pub fn is_completion(self) -> bool {
        matches!(
            self,
            TerminationReason::AlreadyFull
                | TerminationReason::AmountReached
                | TerminationReason::CurrentTaperComplete
                | TerminationReason::BelowEodv
        )
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TerminationReason::AlreadyFull => "battery already full",
            TerminationReason::TimeoutTotal => "total time limit exceeded",
            TerminationReason::Overcharged => "battery overcharged",
            TerminationReason::AmountReached => "requested amount transferred",
            TerminationReason::PrechargeTimeout => "precharge time limit exceeded below EODV",
            TerminationReason::CurrentTaperComplete => "charge current tapered off",
            TerminationReason::ChargeTimeout => "charge time limit exceeded",
            TerminationReason::BelowEodv => "end-of-discharge voltage reached",
            TerminationReason::Interrupted => "interrupted by operator",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub phase: Phase,
    pub elapsed_minutes: f64,
    pub final_volts: f64,
    pub final_amps: f64,
    pub accumulated_mah: f64,
    pub reason: TerminationReason,
    /// Control-loop iterations after the phase proper began.
    pub iterations: u64,
    pub parked: bool,
}

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("instrument transport failed after {attempts} attempts: {source}")]
    Transport {
        attempts: u32,
        #[source]
        source: TransportError,
    },
    #[error("{count} consecutive unreadable measurements")]
    Degraded { count: u32 },
    #[error("setpoint rejected: {0:?}")]
    Setpoint(SafetyViolation),
    #[error("discharge rate divisor must be positive, got {0}")]
    InvalidRate(f64),
}

/// Running mAh total. Each sample is weighted by the nominal loop interval,
/// not by the measured gap between samples.
#[derive(Debug, Clone, Copy)]
pub struct ChargeIntegrator {
    interval_s: f64,
    mah: f64,
}

impl ChargeIntegrator {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval_s: interval.as_secs_f64(),
            mah: 0.0,
        }
    }

    fn increment(&self, amps: f64) -> f64 {
        amps * 1000.0 * self.interval_s / 3600.0
    }

    pub fn charge(&mut self, amps: f64) {
        self.mah += self.increment(amps);
    }

    pub fn discharge(&mut self, amps: f64) {
        self.mah -= self.increment(amps);
    }

    pub fn mah(&self) -> f64 {
        self.mah
    }
}

/// Fixed-rate scheduling: each wait ends on the next interval boundary, so time
/// spent talking to the instrument does not stretch the period.
pub(crate) struct Cadence {
    interval: Duration,
    next: Duration,
    missed: u64,
}

impl Cadence {
    pub(crate) fn new(interval: Duration, start: Duration) -> Self {
        Self {
            interval,
            next: start,
            missed: 0,
        }
    }

    pub(crate) fn wait(&mut self, clock: &dyn Clock) {
        self.next += self.interval;
        let now = clock.elapsed();
        if now < self.next {
            clock.sleep(self.next - now);
        } else {
            self.missed += 1;
            debug!(overrun_ms = (now - self.next).as_millis() as u64, "loop boundary missed");
            self.next = now;
        }
    }

    pub(crate) fn missed(&self) -> u64 {
        self.missed
    }
}

/// Per-run access to the instrument with the controller's error policy applied.
pub(crate) struct LoopContext<'a, IO: SupplyIo> {
    pub(crate) supply: &'a PowerSupply<IO>,
    pub(crate) policy: &'a CyclePolicy,
    pub(crate) abort: Option<&'a AtomicBool>,
    pub(crate) exchange: Option<&'a StatusExchange>,
    consecutive_degraded: u32,
}

impl<'a, IO: SupplyIo> LoopContext<'a, IO> {
    pub(crate) fn new(
        supply: &'a PowerSupply<IO>,
        policy: &'a CyclePolicy,
        abort: Option<&'a AtomicBool>,
        exchange: Option<&'a StatusExchange>,
    ) -> Self {
        Self {
            supply,
            policy,
            abort,
            exchange,
            consecutive_degraded: 0,
        }
    }

    pub(crate) fn clock(&self) -> &dyn Clock {
        self.supply.clock().as_ref()
    }

    pub(crate) fn aborted(&self) -> bool {
        self.abort.is_some_and(|flag| flag.load(Ordering::Relaxed))
    }

    /// Run `op`, retrying transport failures up to the policy limit.
    pub(crate) fn retry<T>(
        &self,
        what: &str,
        mut op: impl FnMut() -> Result<T, TransportError>,
    ) -> Result<T, CycleError> {
        let attempts = self.policy.max_transport_retries + 1;
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if attempt < attempts => {
                    warn!(operation = what, attempt, error = %e, "transport failure, retrying");
                    self.clock().sleep(self.policy.transport_retry_delay);
                    attempt += 1;
                }
                Err(e) => {
                    error!(operation = what, attempts, error = %e, "transport failure, giving up");
                    return Err(CycleError::Transport {
                        attempts,
                        source: e,
                    });
                }
            }
        }
    }

    /// A valid measurement, or `None` when the reply was degraded and the sample
    /// must be skipped.
    pub(crate) fn measure(&mut self) -> Result<Option<Measurement>, CycleError> {
        let supply = self.supply;
        match self.retry("measure", || supply.measure())? {
            Reading::Valid(m) => {
                self.consecutive_degraded = 0;
                Ok(Some(m))
            }
            Reading::Degraded { reply, .. } => {
                self.consecutive_degraded += 1;
                warn!(
                    reply = %reply,
                    consecutive = self.consecutive_degraded,
                    "skipping unreadable sample"
                );
                if self.consecutive_degraded > self.policy.max_consecutive_degraded {
                    return Err(CycleError::Degraded {
                        count: self.consecutive_degraded,
                    });
                }
                Ok(None)
            }
        }
    }

    pub(crate) fn program(&self, volts: f64, milliamps: f64) -> Result<(), CycleError> {
        let setpoint = Setpoint::new(volts, milliamps)
            .validate(self.supply.limits())
            .map_err(CycleError::Setpoint)?;
        let supply = self.supply;
        self.retry("set_setpoint", || supply.set_setpoint(&setpoint))
    }

    pub(crate) fn set_output(&self, enabled: bool) -> Result<(), CycleError> {
        let supply = self.supply;
        self.retry("set_output", || supply.set_output(enabled))
    }

    pub(crate) fn park(&self) -> Result<ParkOutcome, CycleError> {
        let supply = self.supply;
        self.retry("park", || supply.high_impedance_park())
    }

    pub(crate) fn publish(&self, snapshot: CycleSnapshot) {
        if let Some(exchange) = self.exchange {
            exchange.publish(snapshot);
        }
    }

    pub(crate) fn set_activity(&self, activity: Activity) {
        if let Some(exchange) = self.exchange {
            exchange.set_activity(activity);
        }
    }
}

/// Parks the output when dropped, so an early return, an error or a panic in
/// the control loop still leaves the battery at high impedance.
pub(crate) struct ParkGuard<'a, IO: SupplyIo> {
    supply: &'a PowerSupply<IO>,
    armed: bool,
}

impl<'a, IO: SupplyIo> ParkGuard<'a, IO> {
    pub(crate) fn new(supply: &'a PowerSupply<IO>) -> Self {
        Self {
            supply,
            armed: true,
        }
    }

    /// Terminal park on the normal exit path, with the controller's retry policy.
    pub(crate) fn finish(mut self, ctx: &LoopContext<'_, IO>) -> Result<ParkOutcome, CycleError> {
        self.armed = false;
        let outcome = ctx.park();
        if outcome.is_err() {
            let _ = self.supply.set_output(false);
        }
        ctx.set_activity(Activity::Parked);
        outcome
    }
}

impl<IO: SupplyIo> Drop for ParkGuard<'_, IO> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        warn!("abnormal exit from control loop, parking output");
        match self.supply.high_impedance_park() {
            Ok(outcome) => info!(?outcome, "output parked after abnormal exit"),
            Err(e) => {
                error!(error = %e, "park failed after abnormal exit, disabling output");
                if let Err(e) = self.supply.set_output(false) {
                    error!(error = %e, "could not disable output");
                }
            }
        }
    }
}
