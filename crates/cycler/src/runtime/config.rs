use cycler_core::cycle::Mode;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

const TIME_SCALE_RANGE: std::ops::RangeInclusive<f64> = 0.001..=1_000_000.0;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{0} needs a value")]
    MissingValue(String),
    #[error("invalid value {value:?} for {flag}: {reason}")]
    InvalidValue {
        flag: String,
        value: String,
        reason: String,
    },
    #[error("unknown argument {0:?}")]
    UnknownArgument(String),
    #[error("either --port or --simulate is required")]
    NoInstrument,
    #[error("--time-scale only applies to --simulate")]
    TimeScaleWithoutSimulation,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub show_help: bool,
    pub list_profiles: bool,
    pub port: Option<String>,
    pub baud: u32,
    pub simulate: bool,
    pub time_scale: f64,
    /// Starting state of charge for the simulated cell.
    pub sim_soc: f64,
    pub profile: String,
    pub mode: Mode,
    pub cycles: u32,
    pub discharge_rate: f64,
    pub amount_mah: Option<f64>,
    pub loop_interval: Duration,
    pub log_interval: Duration,
    pub csv_enabled: bool,
    pub csv_dir: PathBuf,
    /// Rest after each discharge in cycle mode
    pub rest: Duration,
    pub json_logs: bool,
    pub log_file: Option<PathBuf>,
    pub metrics_addr: Option<String>,
    pub run_log: Option<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            show_help: false,
            list_profiles: false,
            port: None,
            baud: cycler_io::DEFAULT_BAUD,
            simulate: false,
            time_scale: 1.0,
            sim_soc: 0.5,
            profile: "panasonic-18650".to_string(),
            mode: Mode::Charge,
            cycles: 1,
            discharge_rate: 8.0,
            amount_mah: None,
            loop_interval: Duration::from_secs(10),
            log_interval: Duration::from_secs(1),
            csv_enabled: true,
            csv_dir: PathBuf::from("."),
            rest: Duration::from_secs(3600),
            json_logs: false,
            log_file: None,
            metrics_addr: None,
            run_log: None,
        }
    }
}

fn value<'a>(args: &'a [String], i: &mut usize) -> Result<&'a str, ConfigError> {
    let flag = &args[*i];
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| ConfigError::MissingValue(flag.clone()))
}

fn parsed<T>(args: &[String], i: &mut usize) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let flag = args[*i].clone();
    let raw = value(args, i)?;
    raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        flag,
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

fn positive(flag: &str, v: f64) -> Result<f64, ConfigError> {
    if v.is_finite() && v > 0.0 {
        Ok(v)
    } else {
        Err(ConfigError::InvalidValue {
            flag: flag.to_string(),
            value: v.to_string(),
            reason: "must be a positive number".to_string(),
        })
    }
}

fn seconds(flag: &str, v: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(positive(flag, v)?).map_err(|e| ConfigError::InvalidValue {
        flag: flag.to_string(),
        value: v.to_string(),
        reason: e.to_string(),
    })
}

fn minutes(flag: &str, v: u64) -> Result<Duration, ConfigError> {
    v.checked_mul(60)
        .map(Duration::from_secs)
        .ok_or_else(|| ConfigError::InvalidValue {
            flag: flag.to_string(),
            value: v.to_string(),
            reason: "too large".to_string(),
        })
}

impl RuntimeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let args: Vec<String> = std::env::args().collect();
        Self::from_args(&args)
    }

    pub fn from_args(args: &[String]) -> Result<Self, ConfigError> {
        let mut cfg = RuntimeConfig::default();
        let mut time_scale_given = false;
        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "-h" | "--help" => cfg.show_help = true,
                "--list-profiles" => cfg.list_profiles = true,
                "--port" => cfg.port = Some(value(args, &mut i)?.to_string()),
                "--baud" => cfg.baud = parsed(args, &mut i)?,
                "--simulate" => cfg.simulate = true,
                "--time-scale" => {
                    let scale = positive("--time-scale", parsed(args, &mut i)?)?;
                    if !TIME_SCALE_RANGE.contains(&scale) {
                        return Err(ConfigError::InvalidValue {
                            flag: "--time-scale".to_string(),
                            value: scale.to_string(),
                            reason: "must be between 0.001 and 1000000".to_string(),
                        });
                    }
                    cfg.time_scale = scale;
                    time_scale_given = true;
                }
                "--sim-soc" => {
                    let soc: f64 = parsed(args, &mut i)?;
                    if !(0.0..=1.0).contains(&soc) {
                        return Err(ConfigError::InvalidValue {
                            flag: "--sim-soc".to_string(),
                            value: soc.to_string(),
                            reason: "must be between 0 and 1".to_string(),
                        });
                    }
                    cfg.sim_soc = soc;
                }
                "--profile" => cfg.profile = value(args, &mut i)?.to_string(),
                "--mode" => cfg.mode = parsed(args, &mut i)?,
                "--cycles" => cfg.cycles = parsed(args, &mut i)?,
                "--discharge-rate" => {
                    cfg.discharge_rate = positive("--discharge-rate", parsed(args, &mut i)?)?;
                }
                "--amount-mah" => {
                    cfg.amount_mah = Some(positive("--amount-mah", parsed(args, &mut i)?)?);
                }
                "--loop-interval" => {
                    cfg.loop_interval = seconds("--loop-interval", parsed(args, &mut i)?)?;
                }
                "--log-interval" => {
                    cfg.log_interval = seconds("--log-interval", parsed(args, &mut i)?)?;
                }
                "--no-csv" => cfg.csv_enabled = false,
                "--csv-dir" => cfg.csv_dir = PathBuf::from(value(args, &mut i)?),
                "--rest-minutes" => {
                    cfg.rest = minutes("--rest-minutes", parsed(args, &mut i)?)?;
                }
                "--json-logs" => cfg.json_logs = true,
                "--log-file" => cfg.log_file = Some(PathBuf::from(value(args, &mut i)?)),
                "--metrics-addr" => cfg.metrics_addr = Some(value(args, &mut i)?.to_string()),
                "--run-log" => cfg.run_log = Some(PathBuf::from(value(args, &mut i)?)),
                other => return Err(ConfigError::UnknownArgument(other.to_string())),
            }
            i += 1;
        }

        if cfg.show_help || cfg.list_profiles {
            return Ok(cfg);
        }
        if cfg.port.is_none() && !cfg.simulate {
            return Err(ConfigError::NoInstrument);
        }
        if time_scale_given && !cfg.simulate {
            return Err(ConfigError::TimeScaleWithoutSimulation);
        }
        if cfg.cycles == 0 {
            return Err(ConfigError::InvalidValue {
                flag: "--cycles".to_string(),
                value: "0".to_string(),
                reason: "at least one cycle".to_string(),
            });
        }
        Ok(cfg)
    }

    pub fn print_help() {
        println!("cycler - battery charge/discharge cycling on an HP 6632B supply");
        println!();
        println!("Usage: cycler (--port <PATH> | --simulate) [OPTIONS]");
        println!();
        println!("Instrument:");
        println!("  --port <PATH>           Serial port of the supply");
        println!("  --baud <RATE>           Serial baud rate (default: 9600)");
        println!("  --simulate              Use a simulated supply and cell");
        println!("  --time-scale <X>        Run simulated time X times faster (default: 1)");
        println!("  --sim-soc <0..1>        Initial state of charge of the simulated cell (default: 0.5)");
        println!();
        println!("Test:");
        println!("  --profile <NAME>        Battery profile (default: panasonic-18650)");
        println!("  --list-profiles         Print the profile catalog and exit");
        println!("  --mode <MODE>           charge | discharge | cycle (default: charge)");
        println!("  --cycles <N>            Cycles to run in cycle mode (default: 1)");
        println!("  --discharge-rate <D>    Discharge at capacity/D (default: 8)");
        println!("  --amount-mah <MAH>      Stop after moving this much charge");
        println!("  --loop-interval <SECS>  Controller polling interval (default: 10)");
        println!("  --rest-minutes <MIN>    Rest after each discharge in cycle mode (default: 60)");
        println!();
        println!("Telemetry:");
        println!("  --log-interval <SECS>   Sampler interval (default: 1)");
        println!("  --no-csv                Do not write the telemetry CSV file");
        println!("  --csv-dir <DIR>         Directory for telemetry files (default: .)");
        println!("  --json-logs             Emit JSON formatted logs");
        println!("  --log-file <PATH>       Also write logs to this file");
        println!("  --metrics-addr <ADDR>   Serve Prometheus metrics (e.g. 127.0.0.1:9100)");
        println!("  --run-log <PATH>        Append run events to a JSONL file");
        println!("  -h, --help              Print this help");
    }
}
