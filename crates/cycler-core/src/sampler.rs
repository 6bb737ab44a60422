//! Background telemetry sampling, independent of the cycle controllers.

use crate::instrument::{Measurement, PowerSupply, Reading, SupplyIo};
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use serde::Serialize;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn, Span};

/// Round-trip cost of one `MEAS:VOLT?;CURR?` query on the serial link.
pub const QUERY_COST: Duration = Duration::from_millis(109);
/// Wait used for very short configured intervals, so the sampler cannot
/// starve the controller of the link.
pub const MIN_INTERVAL: Duration = Duration::from_millis(100);
/// Shortest configured interval that is compensated for the query cost.
pub const DIRECT_INTERVAL_THRESHOLD: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct SamplerConfig {
    pub interval: Duration,
    pub sink_enabled: bool,
}

impl SamplerConfig {
    /// Configured interval minus the query cost. Intervals shorter than
    /// [`DIRECT_INTERVAL_THRESHOLD`] run at [`MIN_INTERVAL`].
    pub fn effective_interval(&self) -> Duration {
        if self.interval >= DIRECT_INTERVAL_THRESHOLD {
            self.interval - QUERY_COST
        } else {
            MIN_INTERVAL
        }
    }
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            sink_enabled: true,
        }
    }
}

/// One telemetry log row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryRow {
    #[serde(rename = "Date")]
    pub date: String,
    #[serde(rename = "Time")]
    pub time: String,
    pub delta_ms: u64,
    #[serde(rename = "Voltage")]
    pub volts: f64,
    #[serde(rename = "Current")]
    pub amps: f64,
}

impl TelemetryRow {
    pub fn new(measurement: &Measurement, delta_ms: u64) -> Self {
        Self {
            date: measurement.timestamp.format("%Y-%m-%d").to_string(),
            time: measurement.timestamp.format("%H:%M:%S").to_string(),
            delta_ms,
            volts: measurement.volts,
            amps: measurement.amps,
        }
    }
}

pub trait SampleSink: Send {
    fn append(&mut self, row: &TelemetryRow) -> std::io::Result<()>;
}

pub type SampleCallback = Box<dyn FnMut(&Measurement) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

#[derive(Clone, Default, Debug)]
pub struct SamplerStats {
    pub samples: u64,
    pub degraded: u64,
    pub transport_errors: u64,
    pub sink_errors: u64,
}

#[derive(Debug, Error)]
pub enum SamplerError {
    #[error("sampler cannot start from state {0:?}")]
    InvalidState(SamplerState),
    #[error("failed to spawn sampler thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("sampler thread panicked")]
    Panicked,
}

struct Worker {
    stop_tx: Sender<()>,
    handle: JoinHandle<SamplerStats>,
}

pub struct Sampler<IO: SupplyIo + 'static> {
    supply: Arc<PowerSupply<IO>>,
    config: SamplerConfig,
    state: SamplerState,
    callback: Option<SampleCallback>,
    sink: Option<Box<dyn SampleSink>>,
    worker: Option<Worker>,
    span: Span,
}

impl<IO: SupplyIo + 'static> Sampler<IO> {
    pub fn new(supply: Arc<PowerSupply<IO>>, config: SamplerConfig) -> Self {
        Self {
            supply,
            config,
            state: SamplerState::Idle,
            callback: None,
            sink: None,
            worker: None,
            span: info_span!(target: "sampler", "sampler"),
        }
    }

    pub fn with_callback(mut self, callback: impl FnMut(&Measurement) + Send + 'static) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }

    pub fn with_sink(mut self, sink: Box<dyn SampleSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn state(&self) -> SamplerState {
        self.state
    }

    pub fn start(&mut self) -> Result<(), SamplerError> {
        if self.state != SamplerState::Idle {
            return Err(SamplerError::InvalidState(self.state));
        }

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let supply = Arc::clone(&self.supply);
        let interval = self.config.effective_interval();
        let mut callback = self.callback.take();
        let mut sink = if self.config.sink_enabled {
            self.sink.take()
        } else {
            None
        };
        let span = self.span.clone();

        let handle = thread::Builder::new()
            .name("sampler".into())
            .spawn(move || {
                let _enter = span.enter();
                let clock = Arc::clone(supply.clock());
                let mut stats = SamplerStats::default();
                info!(
                    target: "sampler",
                    "starting logging thread, interval is {:.3} s",
                    interval.as_secs_f64()
                );

                let mut last = clock.elapsed();
                loop {
                    match stop_rx.recv_timeout(clock.real_duration(interval)) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }

                    let now = clock.elapsed();
                    let delta_ms = now.saturating_sub(last).as_millis() as u64;
                    last = now;

                    match supply.measure() {
                        Ok(Reading::Valid(m)) => {
                            stats.samples += 1;
                            if let Some(callback) = callback.as_mut() {
                                callback(&m);
                            }
                            if let Some(sink) = sink.as_mut() {
                                if let Err(e) = sink.append(&TelemetryRow::new(&m, delta_ms)) {
                                    stats.sink_errors += 1;
                                    warn!(target: "sampler", error = %e, "telemetry row not written");
                                }
                            }
                        }
                        Ok(Reading::Degraded { reply, .. }) => {
                            stats.degraded += 1;
                            warn!(target: "sampler", reply = %reply, "unreadable sample skipped");
                        }
                        Err(e) => {
                            stats.transport_errors += 1;
                            warn!(target: "sampler", error = %e, "measurement failed");
                        }
                    }
                }

                info!(target: "sampler", samples = stats.samples, "stopped logging thread");
                stats
            })?;

        self.worker = Some(Worker { stop_tx, handle });
        self.state = SamplerState::Running;
        Ok(())
    }

    /// Stop sampling, disable the supply output and wait for the thread to exit.
    pub fn stop(&mut self) -> Result<SamplerStats, SamplerError> {
        let _enter = self.span.enter();
        info!(target: "sampler", "stopping logging thread");
        self.state = SamplerState::Stopping;

        let worker = self.worker.take();
        if let Some(worker) = &worker {
            let _ = worker.stop_tx.try_send(());
        }

        if let Err(e) = self.supply.set_output(false) {
            error!(target: "sampler", error = %e, "could not disable output while stopping");
        }

        let stats = match worker {
            Some(worker) => {
                let joined = worker.handle.join();
                self.state = SamplerState::Stopped;
                joined.map_err(|_| SamplerError::Panicked)?
            }
            None => {
                self.state = SamplerState::Stopped;
                SamplerStats::default()
            }
        };
        debug!(target: "sampler", ?stats, "sampler joined");
        Ok(stats)
    }
}

impl<IO: SupplyIo + 'static> Drop for Sampler<IO> {
    fn drop(&mut self) {
        if self.state == SamplerState::Running {
            if let Err(e) = self.stop() {
                error!(target: "sampler", error = %e, "sampler did not stop cleanly");
            }
        }
    }
}
