//! Latest controller status, shared with the telemetry updater.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

/// What the controller is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Activity {
    #[default]
    Idle,
    AwaitingOcv,
    Precharging,
    Charging,
    Discharging,
    Resting,
    Parked,
}

impl Activity {
    /// Numeric code for gauges.
    pub fn code(self) -> f64 {
        match self {
            Activity::Idle => 0.0,
            Activity::AwaitingOcv => 1.0,
            Activity::Precharging => 2.0,
            Activity::Charging => 3.0,
            Activity::Discharging => 4.0,
            Activity::Resting => 5.0,
            Activity::Parked => 6.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Activity::Idle => "idle",
            Activity::AwaitingOcv => "awaiting_ocv",
            Activity::Precharging => "precharging",
            Activity::Charging => "charging",
            Activity::Discharging => "discharging",
            Activity::Resting => "resting",
            Activity::Parked => "parked",
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CycleSnapshot {
    pub activity: Activity,
    pub volts: f64,
    pub amps: f64,
    pub accumulated_mah: f64,
    pub elapsed_s: f64,
    pub iteration: u64,
}

/// Latest controller snapshot, written by the control loop and read by the
/// telemetry side.
#[derive(Default)]
pub struct StatusExchange {
    snapshot: Mutex<CycleSnapshot>,
    updates: AtomicU64,
}

impl StatusExchange {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called by the controller once per loop iteration.
    pub fn publish(&self, snapshot: CycleSnapshot) {
        *self.snapshot.lock().unwrap_or_else(PoisonError::into_inner) = snapshot;
        self.updates.fetch_add(1, Ordering::Release);
    }

    /// Change only the activity, keeping the last electrical values.
    pub fn set_activity(&self, activity: Activity) {
        let mut snapshot = self.snapshot.lock().unwrap_or_else(PoisonError::into_inner);
        snapshot.activity = activity;
        self.updates.fetch_add(1, Ordering::Release);
    }

    pub fn read(&self) -> CycleSnapshot {
        *self.snapshot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn updates(&self) -> u64 {
        self.updates.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activity_change_keeps_values() {
        let exchange = StatusExchange::new();
        exchange.publish(CycleSnapshot {
            activity: Activity::Charging,
            volts: 4.1,
            amps: 0.2,
            accumulated_mah: 120.0,
            elapsed_s: 600.0,
            iteration: 60,
        });
        exchange.set_activity(Activity::Parked);

        let snapshot = exchange.read();
        assert_eq!(snapshot.activity, Activity::Parked);
        assert_eq!(snapshot.volts, 4.1);
        assert_eq!(exchange.updates(), 2);
    }
}
