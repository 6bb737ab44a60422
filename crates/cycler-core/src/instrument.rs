//! Instrument contract and the thread-safe facade shared by the sampler and the
//! cycle controllers.
//!
//! A backend implements [`SupplyIo`] (one command vocabulary, one link). The
//! [`PowerSupply`] facade owns that backend behind a single mutex, so a query is
//! always send-then-read with nobody else on the half-duplex line in between.

use crate::clock::Clock;
use crate::safety::{SupplyLimits, Setpoint, Validated};
use chrono::{DateTime, Local};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Time the output stage needs to settle after being switched off.
pub const DEFAULT_PARK_SETTLE: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("instrument link is not open")]
    NotConnected,
    #[error("I/O error on instrument link: {0}")]
    Io(#[from] std::io::Error),
    #[error("timed out waiting for instrument reply")]
    Timeout,
    #[error("instrument link failure: {0}")]
    Link(String),
}

#[derive(Debug, Error)]
pub enum MeasureError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("malformed measurement reply: {reply:?}")]
    Malformed { reply: String },
}

/// One instrument backend. Calls are blocking; the facade serializes them.
pub trait SupplyIo: Send {
    fn reset(&mut self) -> Result<(), TransportError>;
    fn set_output(&mut self, enabled: bool) -> Result<(), TransportError>;
    fn set_setpoint(&mut self, volts: f64, milliamps: f64) -> Result<(), TransportError>;
    /// Simultaneous voltage (V) and current (A) readback.
    fn measure(&mut self) -> Result<(f64, f64), MeasureError>;
    fn is_connected(&self) -> bool;
}

impl<T: SupplyIo + ?Sized> SupplyIo for Box<T> {
    fn reset(&mut self) -> Result<(), TransportError> {
        (**self).reset()
    }

    fn set_output(&mut self, enabled: bool) -> Result<(), TransportError> {
        (**self).set_output(enabled)
    }

    fn set_setpoint(&mut self, volts: f64, milliamps: f64) -> Result<(), TransportError> {
        (**self).set_setpoint(volts, milliamps)
    }

    fn measure(&mut self) -> Result<(f64, f64), MeasureError> {
        (**self).measure()
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    pub timestamp: DateTime<Local>,
    pub volts: f64,
    pub amps: f64,
}

impl Measurement {
    pub fn milliamps(&self) -> f64 {
        self.amps * 1000.0
    }
}

/// Result of a `measure` call that reached the instrument.
#[derive(Debug, Clone, PartialEq)]
pub enum Reading {
    Valid(Measurement),
    /// The reply could not be parsed, even after one retry. Carries no numbers on
    /// purpose: control logic must skip it.
    Degraded {
        timestamp: DateTime<Local>,
        reply: String,
    },
}

impl Reading {
    pub fn valid(&self) -> Option<&Measurement> {
        match self {
            Reading::Valid(m) => Some(m),
            Reading::Degraded { .. } => None,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Reading::Degraded { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParkOutcome {
    /// Output re-enabled at the battery's own voltage with a zero current limit.
    Parked { volts: f64 },
    /// Output stays off because the terminal voltage could not be trusted.
    LeftDisabled,
}

#[derive(Clone, Default, Debug)]
pub struct FacadeStats {
    pub measurements: u64,
    pub malformed_retries: u64,
    pub degraded: u64,
    pub transport_errors: u64,
}

#[derive(Default)]
struct Counters {
    measurements: AtomicU64,
    malformed_retries: AtomicU64,
    degraded: AtomicU64,
    transport_errors: AtomicU64,
}

pub struct PowerSupply<IO: SupplyIo> {
    io: Mutex<IO>,
    clock: Arc<dyn Clock>,
    limits: SupplyLimits,
    settle_time: Duration,
    counters: Counters,
}

impl<IO: SupplyIo> PowerSupply<IO> {
    pub fn new(io: IO, clock: Arc<dyn Clock>, limits: SupplyLimits) -> Self {
        Self {
            io: Mutex::new(io),
            clock,
            limits,
            settle_time: DEFAULT_PARK_SETTLE,
            counters: Counters::default(),
        }
    }

    pub fn with_settle_time(mut self, settle_time: Duration) -> Self {
        self.settle_time = settle_time;
        self
    }

    pub fn limits(&self) -> &SupplyLimits {
        &self.limits
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn io(&self) -> MutexGuard<'_, IO> {
        self.io.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_connected(&self) -> bool {
        self.io().is_connected()
    }

    fn track<T>(&self, result: Result<T, TransportError>) -> Result<T, TransportError> {
        if result.is_err() {
            self.counters.transport_errors.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    pub fn reset(&self) -> Result<(), TransportError> {
        info!(target: "facade", "resetting instrument");
        let result = self.io().reset();
        self.track(result)
    }

    /// Switch the output. A no-op with a warning when the link was never
    /// established.
    pub fn set_output(&self, enabled: bool) -> Result<(), TransportError> {
        let mut io = self.io();
        if !io.is_connected() {
            warn!(target: "facade", enabled, "instrument not connected, output unchanged");
            return Ok(());
        }
        debug!(target: "facade", enabled, "output state");
        let result = io.set_output(enabled);
        drop(io);
        self.track(result)
    }

    pub fn set_setpoint(&self, setpoint: &Setpoint<Validated>) -> Result<(), TransportError> {
        info!(
            target: "facade",
            volts = setpoint.volts(),
            milliamps = setpoint.milliamps(),
            "setting voltage {:.3} V and current {:.0} mA",
            setpoint.volts(),
            setpoint.milliamps()
        );
        let result = self
            .io()
            .set_setpoint(setpoint.volts(), setpoint.milliamps());
        self.track(result)
    }

    /// Query voltage and current. A malformed reply is retried once while the
    /// lock is still held; a second malformed reply yields [`Reading::Degraded`].
    pub fn measure(&self) -> Result<Reading, TransportError> {
        let mut io = self.io();
        let mut retried = false;
        loop {
            match io.measure() {
                Ok((volts, amps)) => {
                    self.counters.measurements.fetch_add(1, Ordering::Relaxed);
                    return Ok(Reading::Valid(Measurement {
                        timestamp: self.clock.now(),
                        volts,
                        amps,
                    }));
                }
                Err(MeasureError::Malformed { reply }) if !retried => {
                    debug!(target: "facade", reply = %reply, "malformed reply, retrying once");
                    self.counters
                        .malformed_retries
                        .fetch_add(1, Ordering::Relaxed);
                    retried = true;
                }
                Err(MeasureError::Malformed { reply }) => {
                    warn!(target: "facade", reply = %reply, "malformed reply after retry");
                    self.counters.degraded.fetch_add(1, Ordering::Relaxed);
                    return Ok(Reading::Degraded {
                        timestamp: self.clock.now(),
                        reply,
                    });
                }
                Err(MeasureError::Transport(e)) => {
                    self.counters
                        .transport_errors
                        .fetch_add(1, Ordering::Relaxed);
                    return Err(e);
                }
            }
        }
    }

    /// Leave the battery connected with minimal leakage.
    ///
    /// The supply sinks roughly 15 mA from the cell even with its output off, so
    /// the output is instead re-enabled at the cell's own voltage with a 0 mA
    /// limit.
    pub fn high_impedance_park(&self) -> Result<ParkOutcome, TransportError> {
        self.set_output(false)?;
        self.clock.sleep(self.settle_time);

        let measurement = match self.measure()? {
            Reading::Valid(m) => m,
            Reading::Degraded { reply, .. } => {
                warn!(target: "facade", reply = %reply, "park: terminal voltage unreadable, output left off");
                return Ok(ParkOutcome::LeftDisabled);
            }
        };

        let setpoint = match Setpoint::new(measurement.volts, 0.0).validate(&self.limits) {
            Ok(setpoint) => setpoint,
            Err(violation) => {
                warn!(target: "facade", ?violation, "park: terminal voltage out of range, output left off");
                return Ok(ParkOutcome::LeftDisabled);
            }
        };

        self.set_setpoint(&setpoint)?;
        self.set_output(true)?;
        info!(target: "facade", volts = measurement.volts, "output parked at high impedance");
        Ok(ParkOutcome::Parked {
            volts: measurement.volts,
        })
    }

    pub fn stats(&self) -> FacadeStats {
        FacadeStats {
            measurements: self.counters.measurements.load(Ordering::Relaxed),
            malformed_retries: self.counters.malformed_retries.load(Ordering::Relaxed),
            degraded: self.counters.degraded.load(Ordering::Relaxed),
            transport_errors: self.counters.transport_errors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::testing::{Command, ScriptedSupply};

    fn supply(script: ScriptedSupply) -> PowerSupply<ScriptedSupply> {
        PowerSupply::new(script, Arc::new(ManualClock::new()), SupplyLimits::hp6632b())
    }

    #[test]
    fn malformed_reply_is_retried_once() {
        let script = ScriptedSupply::new();
        script.push_malformed("garbage");
        script.push_reading(3.7, 0.1);
        let psu = supply(script.clone());

        let reading = psu.measure().unwrap();
        assert_eq!(reading.valid().map(|m| m.volts), Some(3.7));
        assert_eq!(psu.stats().malformed_retries, 1);
        assert_eq!(psu.stats().degraded, 0);
    }

    #[test]
    fn two_malformed_replies_degrade() {
        let script = ScriptedSupply::new();
        script.push_malformed("19.9");
        script.push_malformed("");
        script.push_reading(3.7, 0.1);
        let psu = supply(script.clone());

        let reading = psu.measure().unwrap();
        assert!(reading.is_degraded());
        assert!(reading.valid().is_none());
        // The next call gets the queued good reading.
        assert!(psu.measure().unwrap().valid().is_some());
        assert_eq!(psu.stats().degraded, 1);
    }

    #[test]
    fn transport_error_propagates() {
        let script = ScriptedSupply::new();
        script.push_transport_error();
        let psu = supply(script);
        assert!(matches!(psu.measure(), Err(TransportError::Link(_))));
        assert_eq!(psu.stats().transport_errors, 1);
    }

    #[test]
    fn set_output_without_link_is_a_no_op() {
        let script = ScriptedSupply::new();
        script.disconnect();
        let psu = supply(script.clone());

        assert!(psu.set_output(false).is_ok());
        assert!(psu.set_output(true).is_ok());
        assert!(script.commands().is_empty());
        assert_eq!(psu.stats().transport_errors, 0);
        assert!(!psu.is_connected());
    }

    #[test]
    fn park_issues_commands_in_order() {
        let script = ScriptedSupply::new();
        script.push_reading(3.812, -0.015);
        let psu = supply(script.clone());

        let outcome = psu.high_impedance_park().unwrap();
        assert_eq!(outcome, ParkOutcome::Parked { volts: 3.812 });
        assert_eq!(
            script.commands(),
            vec![
                Command::Output(false),
                Command::Measure,
                Command::Setpoint {
                    volts: 3.812,
                    milliamps: 0.0
                },
                Command::Output(true),
            ]
        );
    }

    #[test]
    fn park_waits_for_settling_before_measuring() {
        let script = ScriptedSupply::new();
        script.push_reading(3.9, 0.0);
        let clock = Arc::new(ManualClock::new());
        let psu = PowerSupply::new(script, clock.clone(), SupplyLimits::hp6632b())
            .with_settle_time(Duration::from_millis(250));

        let _ = psu.high_impedance_park().unwrap();
        assert_eq!(clock.elapsed(), Duration::from_millis(250));
    }

    #[test]
    fn park_with_unreadable_voltage_leaves_output_off() {
        let script = ScriptedSupply::new();
        script.push_malformed("x");
        script.push_malformed("y");
        let psu = supply(script.clone());

        assert_eq!(psu.high_impedance_park().unwrap(), ParkOutcome::LeftDisabled);
        assert_eq!(script.last_output(), Some(false));
        assert!(!script
            .commands()
            .iter()
            .any(|c| matches!(c, Command::Setpoint { .. })));
    }
}
