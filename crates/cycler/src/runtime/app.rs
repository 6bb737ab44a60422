use crate::infra::run_log::{RunEventType, RunLogger};
use crate::runtime::config::{ConfigError, RuntimeConfig};
use crate::runtime::logging::init_tracing;
use crate::runtime::telemetry;
use cycler_core::charge::ChargeController;
use cycler_core::clock::{Clock, ScaledClock, SystemClock};
use cycler_core::control_loop::{CycleError, RunSummary, TerminationReason};
use cycler_core::cycle::{CyclePlan, CycleRunner, Mode};
use cycler_core::discharge::DischargeController;
use cycler_core::instrument::{MeasureError, PowerSupply, SupplyIo, TransportError};
use cycler_core::policy::CyclePolicy;
use cycler_core::profile::{self, BatteryProfile, ProfileError};
use cycler_core::safety::SupplyLimits;
use cycler_core::sampler::{Sampler, SamplerConfig, SamplerError};
use cycler_core::sim::SimulatedCell;
use cycler_core::sync::StatusExchange;
use cycler_io::hp6632b::{Hp6632b, ScpiError};
use cycler_io::metrics::record_measurement;
use cycler_io::CsvTelemetrySink;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Profile(#[from] ProfileError),
    #[error(transparent)]
    Instrument(#[from] ScpiError),
    #[error(transparent)]
    Cycle(#[from] CycleError),
    #[error(transparent)]
    Sampler(#[from] SamplerError),
    #[error("cannot create telemetry file in {dir}: {source}")]
    Telemetry {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot open run log {path}: {source}")]
    RunLog {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot install Ctrl-C handler: {0}")]
    Signal(#[source] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Interrupted,
}

/// The instrument behind the facade: the real supply or the simulated bench.
enum BenchSupply {
    Serial(Hp6632b),
    Simulated(SimulatedCell),
}

impl SupplyIo for BenchSupply {
    fn reset(&mut self) -> Result<(), TransportError> {
        match self {
            Self::Serial(s) => s.reset(),
            Self::Simulated(s) => s.reset(),
        }
    }

    fn set_output(&mut self, enabled: bool) -> Result<(), TransportError> {
        match self {
            Self::Serial(s) => s.set_output(enabled),
            Self::Simulated(s) => s.set_output(enabled),
        }
    }

    fn set_setpoint(&mut self, volts: f64, milliamps: f64) -> Result<(), TransportError> {
        match self {
            Self::Serial(s) => s.set_setpoint(volts, milliamps),
            Self::Simulated(s) => s.set_setpoint(volts, milliamps),
        }
    }

    fn measure(&mut self) -> Result<(f64, f64), MeasureError> {
        match self {
            Self::Serial(s) => s.measure(),
            Self::Simulated(s) => s.measure(),
        }
    }

    fn is_connected(&self) -> bool {
        match self {
            Self::Serial(s) => s.is_connected(),
            Self::Simulated(s) => s.is_connected(),
        }
    }
}

pub fn run_from_args() -> ExitCode {
    let config = match RuntimeConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            eprintln!("run with --help for usage");
            return ExitCode::from(2);
        }
    };
    if config.show_help {
        RuntimeConfig::print_help();
        return ExitCode::SUCCESS;
    }
    if config.list_profiles {
        print_profiles();
        return ExitCode::SUCCESS;
    }

    let _log_guard = init_tracing(config.json_logs, config.log_file.as_deref());

    match run(config) {
        Ok(RunOutcome::Completed) => ExitCode::SUCCESS,
        Ok(RunOutcome::Interrupted) => {
            info!(target: "runtime", "stopped by user");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(target: "runtime", error = %e, "run failed");
            ExitCode::FAILURE
        }
    }
}

fn print_profiles() {
    for entry in profile::CATALOG {
        println!(
            "{:<18} EOCV {:.2} V  EODV {:.2} V  {:>6.0} mAh  {}",
            entry.name, entry.eocv, entry.eodv, entry.capacity_mah, entry.description
        );
    }
}

pub fn run(config: RuntimeConfig) -> Result<RunOutcome, RunError> {
    let profile = profile::lookup(&config.profile)?;
    let clock: Arc<dyn Clock> = if config.simulate && config.time_scale != 1.0 {
        Arc::new(ScaledClock::new(config.time_scale))
    } else {
        Arc::new(SystemClock::new())
    };

    let io = connect(&config, &profile, &clock)?;
    let supply = Arc::new(PowerSupply::new(
        io,
        Arc::clone(&clock),
        SupplyLimits::hp6632b(),
    ));
    let run_log = init_run_log(config.run_log.as_deref())?;
    let started = clock.now();
    let t0 = clock.elapsed();
    let record = |event_type, details| {
        if let Some(logger) = &run_log {
            let elapsed_s = clock.elapsed().saturating_sub(t0).as_secs_f64();
            let timestamp = clock.now().to_rfc3339();
            if let Err(e) = logger.log_event(timestamp, elapsed_s, event_type, details) {
                warn!(target: "runtime", error = %e, "run log entry not written");
            }
        }
    };

    telemetry::init();
    let _metrics_handle = telemetry::start_metrics_server(&config.metrics_addr);
    let exchange = Arc::new(StatusExchange::new());
    let stop_updater = Arc::new(AtomicBool::new(false));
    let updater = telemetry::start_metrics_updater(
        Arc::clone(&exchange),
        Arc::clone(&supply),
        Arc::clone(&stop_updater),
    );

    let abort = Arc::new(AtomicBool::new(false));
    install_interrupt_handler(Arc::clone(&abort))?;

    let mut sampler = Sampler::new(
        Arc::clone(&supply),
        SamplerConfig {
            interval: config.log_interval,
            sink_enabled: config.csv_enabled,
        },
    )
    .with_callback(record_measurement);
    if config.csv_enabled {
        let sink = CsvTelemetrySink::create(&config.csv_dir, started).map_err(|source| {
            RunError::Telemetry {
                dir: config.csv_dir.clone(),
                source,
            }
        })?;
        sampler = sampler.with_sink(Box::new(sink));
    }
    sampler.start()?;

    info!(
        target: "runtime",
        profile = %profile.name,
        mode = %config.mode,
        simulate = config.simulate,
        connected = supply.is_connected(),
        "run started"
    );
    record(
        RunEventType::RunStart,
        serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "profile": profile,
            "mode": config.mode.to_string(),
            "cycles": config.cycles,
            "discharge_rate": config.discharge_rate,
            "amount_mah": config.amount_mah,
            "loop_interval_s": config.loop_interval.as_secs_f64(),
            "simulate": config.simulate,
        }),
    );

    let result = run_mode(&config, &supply, &profile, &abort, &exchange, |cycle, summary| {
        log_summary(cycle, summary);
        record(
            RunEventType::PhaseComplete,
            serde_json::json!({ "cycle": cycle, "summary": summary }),
        );
    });

    match sampler.stop() {
        Ok(stats) => info!(
            target: "runtime",
            samples = stats.samples,
            degraded = stats.degraded,
            transport_errors = stats.transport_errors,
            "sampler stopped"
        ),
        Err(e) => warn!(target: "runtime", error = %e, "sampler did not stop cleanly"),
    }
    stop_updater.store(true, Ordering::Relaxed);
    let _ = updater.join();

    match result {
        Ok(RunOutcome::Completed) => {
            record(RunEventType::RunEnd, serde_json::Value::Null);
            Ok(RunOutcome::Completed)
        }
        Ok(RunOutcome::Interrupted) => {
            record(
                RunEventType::RunAborted,
                serde_json::json!({ "reason": "interrupted" }),
            );
            Ok(RunOutcome::Interrupted)
        }
        Err(e) => {
            record(
                RunEventType::RunAborted,
                serde_json::json!({ "error": e.to_string() }),
            );
            Err(e.into())
        }
    }
}

fn connect(
    config: &RuntimeConfig,
    profile: &BatteryProfile,
    clock: &Arc<dyn Clock>,
) -> Result<BenchSupply, RunError> {
    if config.simulate {
        info!(
            target: "runtime",
            time_scale = config.time_scale,
            soc = config.sim_soc,
            "using simulated supply"
        );
        let cell = SimulatedCell::new(
            Arc::clone(clock),
            profile.eocv,
            profile.eodv,
            profile.capacity_mah,
        )
        .with_state_of_charge(config.sim_soc);
        return Ok(BenchSupply::Simulated(cell));
    }

    let port = config.port.as_deref().ok_or(ConfigError::NoInstrument)?;
    Ok(BenchSupply::Serial(Hp6632b::open(port, config.baud)?))
}

fn run_mode<IO: SupplyIo>(
    config: &RuntimeConfig,
    supply: &PowerSupply<IO>,
    profile: &BatteryProfile,
    abort: &AtomicBool,
    exchange: &StatusExchange,
    mut on_phase: impl FnMut(u32, &RunSummary),
) -> Result<RunOutcome, CycleError> {
    let policy = CyclePolicy::default().with_loop_interval(config.loop_interval);

    let summaries = match config.mode {
        Mode::Charge => {
            let summary = ChargeController::new(supply, profile, &policy)
                .with_amount_limit(config.amount_mah)
                .with_abort(abort)
                .with_exchange(exchange)
                .run()?;
            on_phase(1, &summary);
            vec![summary]
        }
        Mode::Discharge => {
            let summary = DischargeController::new(supply, profile, &policy, config.discharge_rate)
                .with_amount_limit(config.amount_mah)
                .with_abort(abort)
                .with_exchange(exchange)
                .run()?;
            on_phase(1, &summary);
            vec![summary]
        }
        Mode::Cycle => {
            let plan = CyclePlan {
                cycles: config.cycles,
                discharge_rate: config.discharge_rate,
                amount_mah: config.amount_mah,
                rest_after_charge: Duration::ZERO,
                rest_after_discharge: config.rest,
            };
            CycleRunner::new(supply, profile, &policy, &plan)
                .with_abort(abort)
                .with_exchange(exchange)
                .run(&mut on_phase)?
                .into_iter()
                .flat_map(|report| std::iter::once(report.charge).chain(report.discharge))
                .collect()
        }
    };

    let interrupted = abort.load(Ordering::Relaxed)
        || summaries
            .iter()
            .any(|s| s.reason == TerminationReason::Interrupted);
    Ok(if interrupted {
        RunOutcome::Interrupted
    } else {
        RunOutcome::Completed
    })
}

fn log_summary(cycle: u32, summary: &RunSummary) {
    if !summary.reason.is_completion() {
        warn!(target: "runtime", cycle, reason = %summary.reason, "phase did not complete");
    }
    info!(
        target: "runtime",
        cycle,
        phase = %summary.phase,
        reason = %summary.reason,
        elapsed_minutes = summary.elapsed_minutes,
        final_volts = summary.final_volts,
        final_amps = summary.final_amps,
        accumulated_mah = summary.accumulated_mah,
        "{} finished after {:.0} minutes: {} ({:.0} mAh)",
        summary.phase,
        summary.elapsed_minutes,
        summary.reason,
        summary.accumulated_mah
    );
}

fn init_run_log(path: Option<&Path>) -> Result<Option<RunLogger>, RunError> {
    path.map(|path| {
        RunLogger::new(path)
            .map(|logger| {
                info!(target: "runtime", path = %path.display(), "Run logging enabled");
                logger
            })
            .map_err(|source| RunError::RunLog {
                path: path.to_path_buf(),
                source,
            })
    })
    .transpose()
}

/// Ctrl-C sets `abort`; the controllers notice it at their next check, park the
/// cell and return `Interrupted`.
fn install_interrupt_handler(abort: Arc<AtomicBool>) -> Result<(), RunError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(RunError::Signal)?;

    thread::Builder::new()
        .name("signal".into())
        .spawn(move || {
            runtime.block_on(async move {
                while tokio::signal::ctrl_c().await.is_ok() {
                    if abort.swap(true, Ordering::SeqCst) {
                        warn!(target: "runtime", "already stopping, waiting for the cell to park");
                    } else {
                        warn!(target: "runtime", "interrupt received, stopping");
                    }
                }
            })
        })
        .map_err(RunError::Signal)?;
    Ok(())
}
