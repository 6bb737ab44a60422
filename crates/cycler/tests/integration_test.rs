use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{Duration, Instant};

fn cycler_bin() -> PathBuf {
    // Prefer the test-built binary when available to avoid extra cargo builds.
    std::env::var("CARGO_BIN_EXE_cycler")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let candidates = [
                "../../target/debug/cycler",
                "target/debug/cycler",
                "../../target/release/cycler",
                "target/release/cycler",
            ];
            candidates
                .iter()
                .map(PathBuf::from)
                .find(|p| p.exists())
                .expect("Failed to locate cycler binary")
        })
}

fn run_cycler(args: &[&str]) -> Output {
    Command::new(cycler_bin())
        .args(args)
        .env("RUST_LOG", "info")
        .output()
        .expect("Failed to start cycler")
}

fn read_run_log(path: &Path) -> Vec<serde_json::Value> {
    std::fs::read_to_string(path)
        .expect("run log missing")
        .lines()
        .map(|line| serde_json::from_str(line).expect("run log line is JSON"))
        .collect()
}

#[test]
fn simulated_discharge_runs_to_eodv() {
    let dir = tempfile::tempdir().unwrap();
    let csv_dir = dir.path().join("telemetry");
    let run_log = dir.path().join("run.jsonl");

    let started = Instant::now();
    let output = run_cycler(&[
        "--simulate",
        "--time-scale",
        "3600",
        "--sim-soc",
        "0.1",
        "--profile",
        "galaxy-s3-mini",
        "--mode",
        "discharge",
        "--discharge-rate",
        "2",
        "--log-interval",
        "30",
        "--csv-dir",
        csv_dir.to_str().unwrap(),
        "--run-log",
        run_log.to_str().unwrap(),
    ]);

    assert!(
        output.status.success(),
        "cycler failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(started.elapsed() < Duration::from_secs(30));

    let events = read_run_log(&run_log);
    let kinds: Vec<&str> = events
        .iter()
        .map(|e| e["event_type"].as_str().unwrap())
        .collect();
    assert_eq!(kinds, ["run_start", "phase_complete", "run_end"]);
    assert_eq!(events[0]["details"]["profile"]["name"], "galaxy-s3-mini");

    let summary = &events[1]["details"]["summary"];
    assert_eq!(summary["phase"], "discharge");
    assert_eq!(summary["reason"], "below_eodv");
    assert!(summary["final_volts"].as_f64().unwrap() < 3.1);
    assert!(summary["accumulated_mah"].as_f64().unwrap() > 0.0);

    let csv_files: Vec<PathBuf> = std::fs::read_dir(&csv_dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    assert_eq!(csv_files.len(), 1);
    let name = csv_files[0].file_name().unwrap().to_string_lossy();
    assert!(name.ends_with("_lab_power.csv"), "unexpected file {name}");
    let csv = std::fs::read_to_string(&csv_files[0]).unwrap();
    assert!(csv.starts_with("Date,Time,delta_ms,Voltage,Current"));
}

#[test]
fn simulated_full_cell_is_not_charged() {
    let dir = tempfile::tempdir().unwrap();
    let run_log = dir.path().join("run.jsonl");

    let output = run_cycler(&[
        "--simulate",
        "--time-scale",
        "3600",
        "--sim-soc",
        "1.0",
        "--mode",
        "charge",
        "--no-csv",
        "--run-log",
        run_log.to_str().unwrap(),
    ]);
    assert!(output.status.success());

    let events = read_run_log(&run_log);
    assert_eq!(events[1]["details"]["summary"]["reason"], "already_full");
}

#[test]
fn missing_serial_port_is_a_failure() {
    let output = run_cycler(&["--port", "/dev/does-not-exist-cycler", "--no-csv"]);
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn bad_arguments_exit_with_usage_error() {
    let output = run_cycler(&["--simulate", "--mode", "trickle"]);
    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("unknown mode"));

    let help = run_cycler(&["--help"]);
    assert!(help.status.success());
    assert!(String::from_utf8_lossy(&help.stdout).contains("--simulate"));
}
