//! Simulated bench: a CC/CV supply attached to a lithium-ion cell model.

use crate::clock::Clock;
use crate::instrument::{MeasureError, SupplyIo, TransportError};
use std::sync::Arc;
use std::time::Duration;

/// Normalized open-circuit voltage against state of charge. Steep at both ends
/// like a lithium-ion cell, flat plateau in between.
const OCV_CURVE: [(f64, f64); 7] = [
    (0.00, 0.00),
    (0.05, 0.35),
    (0.10, 0.45),
    (0.50, 0.65),
    (0.90, 0.85),
    (0.97, 0.94),
    (1.00, 1.00),
];

/// Bench supply with a cell attached.
///
/// The supply is a CC/CV source that can also sink: with the output on it drives
/// the terminal toward the programmed voltage, limited to the programmed current
/// in either direction. Sinking current reads back negative. The cell is an OCV
/// curve plus a series resistance and one polarization RC pair, so the open
/// circuit voltage relaxes for a while after the current stops.
pub struct SimulatedCell {
    clock: Arc<dyn Clock>,
    last_update: Duration,

    capacity_mah: f64,
    soc: f64,
    empty_volts: f64,
    full_volts: f64,
    series_ohm: f64,
    polarization_ohm: f64,
    polarization_tau_s: f64,
    polarization_volts: f64,

    output_enabled: bool,
    set_volts: f64,
    set_milliamps: f64,
    amps: f64,
    connected: bool,
}

impl SimulatedCell {
    /// A cell whose OCV spans from well below `eodv` up to `eocv` when full.
    pub fn new(clock: Arc<dyn Clock>, eocv: f64, eodv: f64, capacity_mah: f64) -> Self {
        let last_update = clock.elapsed();
        Self {
            clock,
            last_update,
            capacity_mah,
            soc: 0.5,
            empty_volts: eodv - 0.5,
            full_volts: eocv,
            series_ohm: 0.08,
            polarization_ohm: 0.03,
            polarization_tau_s: 120.0,
            polarization_volts: 0.0,
            output_enabled: false,
            set_volts: 0.0,
            set_milliamps: 0.0,
            amps: 0.0,
            connected: true,
        }
    }

    pub fn with_state_of_charge(mut self, soc: f64) -> Self {
        self.soc = soc.clamp(0.0, 1.0);
        self
    }

    pub fn state_of_charge(&self) -> f64 {
        self.soc
    }

    /// Simulate a pulled cable; every call fails until reconnected.
    pub fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
    }

    pub fn open_circuit_volts(&self) -> f64 {
        let soc = self.soc.clamp(0.0, 1.0);
        let fraction = OCV_CURVE
            .windows(2)
            .find(|w| soc <= w[1].0)
            .map_or(1.0, |w| {
                let (s0, f0) = w[0];
                let (s1, f1) = w[1];
                f0 + (f1 - f0) * (soc - s0) / (s1 - s0)
            });
        self.empty_volts + (self.full_volts - self.empty_volts) * fraction
    }

    fn terminal_volts(&self) -> f64 {
        self.open_circuit_volts() + self.polarization_volts + self.amps * self.series_ohm
    }

    fn solve_current(&self) -> f64 {
        if !self.output_enabled {
            return 0.0;
        }
        let limit = self.set_milliamps / 1000.0;
        let headroom = self.set_volts - self.open_circuit_volts() - self.polarization_volts;
        (headroom / self.series_ohm).clamp(-limit, limit)
    }

    /// Integrate from the last update to the clock's current time.
    fn advance(&mut self) {
        let now = self.clock.elapsed();
        let mut remaining = now.saturating_sub(self.last_update).as_secs_f64();
        self.last_update = now;

        // Fixed sub-steps keep the CV taper stable at coarse loop intervals.
        while remaining > 0.0 {
            let dt = remaining.min(1.0);
            remaining -= dt;

            self.amps = self.solve_current();
            self.soc += self.amps * 1000.0 * dt / 3600.0 / self.capacity_mah;
            self.soc = self.soc.clamp(0.0, 1.0);

            let target = self.amps * self.polarization_ohm;
            let decay = (-dt / self.polarization_tau_s).exp();
            self.polarization_volts = target + (self.polarization_volts - target) * decay;
        }
        self.amps = self.solve_current();
    }

    fn check_link(&self) -> Result<(), TransportError> {
        if self.connected {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }
}

impl SupplyIo for SimulatedCell {
    fn reset(&mut self) -> Result<(), TransportError> {
        self.check_link()?;
        self.advance();
        self.output_enabled = false;
        self.set_volts = 0.0;
        self.set_milliamps = 0.0;
        self.amps = 0.0;
        Ok(())
    }

    fn set_output(&mut self, enabled: bool) -> Result<(), TransportError> {
        self.check_link()?;
        self.advance();
        self.output_enabled = enabled;
        self.amps = self.solve_current();
        Ok(())
    }

    fn set_setpoint(&mut self, volts: f64, milliamps: f64) -> Result<(), TransportError> {
        self.check_link()?;
        self.advance();
        self.set_volts = volts;
        self.set_milliamps = milliamps;
        self.amps = self.solve_current();
        Ok(())
    }

    fn measure(&mut self) -> Result<(f64, f64), MeasureError> {
        self.check_link()?;
        self.advance();
        Ok((self.terminal_volts(), self.amps))
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn cell(soc: f64) -> (Arc<ManualClock>, SimulatedCell) {
        let clock = Arc::new(ManualClock::new());
        let cell = SimulatedCell::new(clock.clone(), 4.2, 3.0, 2000.0).with_state_of_charge(soc);
        (clock, cell)
    }

    #[test]
    fn output_off_reads_open_circuit_voltage() {
        let (_clock, mut cell) = cell(1.0);
        let (volts, amps) = cell.measure().unwrap();
        assert!((volts - 4.2).abs() < 1e-9);
        assert_eq!(amps, 0.0);
    }

    #[test]
    fn constant_current_charge_raises_state_of_charge() {
        let (clock, mut cell) = cell(0.5);
        cell.set_setpoint(4.2, 200.0).unwrap();
        cell.set_output(true).unwrap();
        clock.advance(Duration::from_secs(3600));
        let (volts, amps) = cell.measure().unwrap();

        assert!((amps - 0.2).abs() < 1e-9);
        assert!(volts < 4.2);
        assert!((cell.state_of_charge() - 0.6).abs() < 1e-6);
    }

    #[test]
    fn sinking_reads_back_negative() {
        let (clock, mut cell) = cell(0.5);
        cell.set_setpoint(1.0, 500.0).unwrap();
        cell.set_output(true).unwrap();
        clock.advance(Duration::from_secs(60));
        let (_, amps) = cell.measure().unwrap();
        assert!((amps + 0.5).abs() < 1e-9);
        assert!(cell.state_of_charge() < 0.5);
    }

    #[test]
    fn current_tapers_at_constant_voltage() {
        let (clock, mut cell) = cell(0.95);
        cell.set_setpoint(4.2, 1000.0).unwrap();
        cell.set_output(true).unwrap();
        clock.advance(Duration::from_secs(10));
        let (_, early) = cell.measure().unwrap();
        clock.advance(Duration::from_secs(4 * 3600));
        let (volts, late) = cell.measure().unwrap();

        assert!(late < early);
        assert!(late < 0.05);
        assert!((volts - 4.2).abs() < 1e-6);
    }

    #[test]
    fn disconnected_cell_fails_every_call() {
        let (_clock, mut cell) = cell(0.5);
        cell.set_connected(false);
        assert!(matches!(
            cell.set_output(true),
            Err(TransportError::NotConnected)
        ));
        assert!(matches!(
            cell.measure(),
            Err(MeasureError::Transport(TransportError::NotConnected))
        ));
    }
}
