//! Setpoint validation against the instrument's output ratings.
//!
//! A [`Setpoint`] starts out `Unvalidated`; only a `Validated` one can be sent
//! to the supply.

use std::marker::PhantomData;

#[derive(Debug, Clone, Copy)]
pub struct Unvalidated;

#[derive(Debug, Clone, Copy)]
pub struct Validated;

/// Voltage and current limit pair for the supply. Only a `Setpoint<Validated>`
/// can be handed to the instrument facade.
#[derive(Debug, Clone, Copy)]
pub struct Setpoint<State = Unvalidated> {
    volts: f64,
    milliamps: f64,
    _state: PhantomData<State>,
}

/// Output ratings of the instrument.
#[derive(Debug, Clone, Copy)]
pub struct SupplyLimits {
    pub max_volts: f64,
    pub max_milliamps: f64,
}

impl SupplyLimits {
    /// HP/Agilent 6632B: 0-20 V, 0-5 A.
    pub const fn hp6632b() -> Self {
        Self {
            max_volts: 20.0,
            max_milliamps: 5000.0,
        }
    }
}

impl Default for SupplyLimits {
    fn default() -> Self {
        Self::hp6632b()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SafetyViolation {
    NonFiniteSetpoint { volts: f64, milliamps: f64 },
    NegativeVoltage { requested: f64 },
    NegativeCurrent { requested: f64 },
    ExceedsVoltageRating { requested: f64, limit: f64 },
    ExceedsCurrentRating { requested: f64, limit: f64 },
}

impl Setpoint<Unvalidated> {
    pub fn new(volts: f64, milliamps: f64) -> Self {
        Self {
            volts,
            milliamps,
            _state: PhantomData,
        }
    }

    pub fn validate(self, limits: &SupplyLimits) -> Result<Setpoint<Validated>, SafetyViolation> {
        if !self.volts.is_finite() || !self.milliamps.is_finite() {
            return Err(SafetyViolation::NonFiniteSetpoint {
                volts: self.volts,
                milliamps: self.milliamps,
            });
        }
        if self.volts < 0.0 {
            return Err(SafetyViolation::NegativeVoltage {
                requested: self.volts,
            });
        }
        if self.milliamps < 0.0 {
            return Err(SafetyViolation::NegativeCurrent {
                requested: self.milliamps,
            });
        }
        if self.volts > limits.max_volts {
            return Err(SafetyViolation::ExceedsVoltageRating {
                requested: self.volts,
                limit: limits.max_volts,
            });
        }
        if self.milliamps > limits.max_milliamps {
            return Err(SafetyViolation::ExceedsCurrentRating {
                requested: self.milliamps,
                limit: limits.max_milliamps,
            });
        }

        Ok(Setpoint {
            volts: self.volts,
            milliamps: self.milliamps,
            _state: PhantomData,
        })
    }
}

impl Setpoint<Validated> {
    pub fn volts(&self) -> f64 {
        self.volts
    }

    pub fn milliamps(&self) -> f64 {
        self.milliamps
    }
}
