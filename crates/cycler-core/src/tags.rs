//! Published quantities and their metric names.

/// Names one published quantity consistently across the metrics endpoint and
/// the structured logs.
#[derive(Debug, Clone, Copy)]
pub struct Tag {
    pub key: &'static str,
    pub metric: &'static str,
    pub help: &'static str,
}

pub const TERMINAL_VOLTS: Tag = Tag {
    key: "volts",
    metric: "cycler_terminal_volts",
    help: "Last measured terminal voltage",
};

pub const CURRENT_AMPS: Tag = Tag {
    key: "amps",
    metric: "cycler_current_amps",
    help: "Last measured current, negative while sinking",
};

pub const ACCUMULATED_MAH: Tag = Tag {
    key: "accumulated_mah",
    metric: "cycler_accumulated_mah",
    help: "Charge moved in the running phase",
};

pub const ACTIVITY: Tag = Tag {
    key: "activity",
    metric: "cycler_activity",
    help: "Controller activity code (0 idle, 1 awaiting OCV, 2 precharging, 3 charging, 4 discharging, 5 resting, 6 parked)",
};

pub const PHASE_ELAPSED_S: Tag = Tag {
    key: "elapsed_s",
    metric: "cycler_phase_elapsed_seconds",
    help: "Time since the running phase started",
};

pub const SAMPLES_TOTAL: Tag = Tag {
    key: "samples",
    metric: "cycler_samples_total",
    help: "Valid measurements taken",
};

pub const DEGRADED_TOTAL: Tag = Tag {
    key: "degraded",
    metric: "cycler_degraded_readings_total",
    help: "Measurements discarded as unreadable",
};

pub const TRANSPORT_ERRORS_TOTAL: Tag = Tag {
    key: "transport_errors",
    metric: "cycler_transport_errors_total",
    help: "Failed exchanges on the instrument link",
};
