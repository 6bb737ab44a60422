use cycler_core::instrument::{FacadeStats, PowerSupply, SupplyIo};
use cycler_core::sync::StatusExchange;
use cycler_io::metrics::{
    init_metrics, record_facade_stats, record_snapshot, serve_metrics,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::info;

const UPDATE_PERIOD: Duration = Duration::from_millis(200);

pub fn init() {
    init_metrics();
}

pub fn start_metrics_server(addr: &Option<String>) -> Option<thread::JoinHandle<()>> {
    addr.as_ref().map(|addr| {
        info!(target: "runtime", addr = %addr, "Starting metrics server");
        serve_metrics(addr.clone())
    })
}

/// Mirror the controller snapshot and the facade counters into the metrics
/// registry until `stop` is set.
pub fn start_metrics_updater<IO: SupplyIo + 'static>(
    exchange: Arc<StatusExchange>,
    supply: Arc<PowerSupply<IO>>,
    stop: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut last_update = 0u64;
        let mut last_stats = FacadeStats::default();
        loop {
            let updates = exchange.updates();
            if updates != last_update {
                record_snapshot(&exchange.read());
                last_update = updates;
            }

            let stats = supply.stats();
            record_facade_stats(&last_stats, &stats);
            last_stats = stats;

            if stop.load(Ordering::Relaxed) {
                break;
            }
            thread::sleep(UPDATE_PERIOD);
        }
    })
}
