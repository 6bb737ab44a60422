//! Tunable thresholds, C-rate divisors and time limits for the controllers.

use std::time::Duration;

const HOUR: Duration = Duration::from_secs(3600);

/// Timing and threshold knobs shared by the charge and discharge state
/// machines. Currents are C-rate divisors of the profile capacity.
#[derive(Clone, Debug)]
pub struct CyclePolicy {
    pub loop_interval: Duration,

    /// OCV counts as settled once it drifts less than this (mV/min).
    pub ocv_stability_mv_per_min: f64,
    /// Charge anyway if OCV has not settled after this long.
    pub ocv_settle_timeout: Option<Duration>,
    /// Skip charging when the settled OCV is within this of EOCV (V).
    pub full_margin_volts: f64,
    /// Abort charging above EOCV plus this (V).
    pub overvoltage_margin_volts: f64,

    pub precharge_divisor: f64,
    pub charge_divisor: f64,
    pub end_divisor: f64,

    pub total_timeout: Duration,
    pub precharge_timeout: Duration,
    pub charge_timeout: Duration,
    /// Taper completion is ignored until the constant-current phase has run
    /// this long.
    pub min_charge_time: Duration,

    /// Voltage programmed while sinking current; below any catalog EODV.
    pub discharge_floor_volts: f64,
    pub discharge_timeout: Option<Duration>,

    pub charge_progress_mah: f64,
    pub discharge_progress_mah: f64,

    pub max_transport_retries: u32,
    pub transport_retry_delay: Duration,
    pub max_consecutive_degraded: u32,
}

impl Default for CyclePolicy {
    fn default() -> Self {
        Self {
            loop_interval: Duration::from_secs(10),
            ocv_stability_mv_per_min: 0.1,
            ocv_settle_timeout: None,
            full_margin_volts: 0.002,
            overvoltage_margin_volts: 0.005,
            precharge_divisor: 20.0,
            charge_divisor: 10.0,
            end_divisor: 30.0,
            total_timeout: 15 * HOUR,
            precharge_timeout: 2 * HOUR,
            charge_timeout: 12 * HOUR,
            min_charge_time: Duration::ZERO,
            discharge_floor_volts: 1.0,
            discharge_timeout: None,
            charge_progress_mah: 25.0,
            discharge_progress_mah: 100.0,
            max_transport_retries: 3,
            transport_retry_delay: Duration::from_secs(1),
            max_consecutive_degraded: 30,
        }
    }
}

impl CyclePolicy {
    pub fn with_loop_interval(mut self, interval: Duration) -> Self {
        self.loop_interval = interval;
        self
    }
}
