//! Prometheus metrics for the cycler.
//!
//! Gauges mirror the latest measurement and controller snapshot; counters
//! track instrument link health.

use cycler_core::instrument::{FacadeStats, Measurement};
use cycler_core::sync::CycleSnapshot;
use cycler_core::tags::{self, Tag};
use prometheus::{Encoder, Gauge, IntCounter, Registry, TextEncoder};
use std::sync::LazyLock;
use std::thread;
use tiny_http::{Header, Response, Server};

/// Global metrics registry
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

fn gauge(tag: Tag) -> Gauge {
    let gauge = Gauge::new(tag.metric, tag.help).unwrap();
    REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
}

fn counter(tag: Tag) -> IntCounter {
    let counter = IntCounter::new(tag.metric, tag.help).unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
}

// ============================================================================
// Measurement Metrics
// ============================================================================

pub static TERMINAL_VOLTS: LazyLock<Gauge> = LazyLock::new(|| gauge(tags::TERMINAL_VOLTS));

pub static CURRENT_AMPS: LazyLock<Gauge> = LazyLock::new(|| gauge(tags::CURRENT_AMPS));

// ============================================================================
// Controller Metrics
// ============================================================================

pub static ACCUMULATED_MAH: LazyLock<Gauge> = LazyLock::new(|| gauge(tags::ACCUMULATED_MAH));

pub static ACTIVITY: LazyLock<Gauge> = LazyLock::new(|| gauge(tags::ACTIVITY));

pub static PHASE_ELAPSED_S: LazyLock<Gauge> = LazyLock::new(|| gauge(tags::PHASE_ELAPSED_S));

// ============================================================================
// Link Health Metrics
// ============================================================================

pub static SAMPLES_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| counter(tags::SAMPLES_TOTAL));

pub static DEGRADED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| counter(tags::DEGRADED_TOTAL));

pub static TRANSPORT_ERRORS_TOTAL: LazyLock<IntCounter> =
    LazyLock::new(|| counter(tags::TRANSPORT_ERRORS_TOTAL));

pub fn record_measurement(m: &Measurement) {
    TERMINAL_VOLTS.set(m.volts);
    CURRENT_AMPS.set(m.amps);
}

pub fn record_snapshot(snapshot: &CycleSnapshot) {
    ACCUMULATED_MAH.set(snapshot.accumulated_mah);
    ACTIVITY.set(snapshot.activity.code());
    PHASE_ELAPSED_S.set(snapshot.elapsed_s);
}

/// Advance the link counters by the difference between two facade snapshots.
pub fn record_facade_stats(previous: &FacadeStats, current: &FacadeStats) {
    SAMPLES_TOTAL.inc_by(current.measurements.saturating_sub(previous.measurements));
    DEGRADED_TOTAL.inc_by(current.degraded.saturating_sub(previous.degraded));
    TRANSPORT_ERRORS_TOTAL.inc_by(
        current
            .transport_errors
            .saturating_sub(previous.transport_errors),
    );
}

// ============================================================================
// Metrics HTTP Server
// ============================================================================

/// Start the metrics HTTP server on the given address.
/// Returns a join handle for the server thread.
pub fn serve_metrics(bind_addr: String) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let server = match Server::http(&bind_addr) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(target: "runtime", "Failed to start metrics server on {}: {}", bind_addr, e);
                return;
            }
        };

        tracing::info!(target: "runtime", "Metrics server listening on http://{}/metrics", bind_addr);

        for request in server.incoming_requests() {
            match request.url() {
                "/metrics" => {
                    let encoder = TextEncoder::new();
                    let mut buffer = Vec::new();

                    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
                        tracing::warn!(target: "runtime", "Failed to encode metrics: {}", e);
                        let _ = request.respond(
                            Response::from_string("Internal Server Error").with_status_code(500),
                        );
                        continue;
                    }

                    let mut response = Response::from_data(buffer);
                    if let Ok(header) =
                        Header::from_bytes(&b"Content-Type"[..], encoder.format_type().as_bytes())
                    {
                        response = response.with_header(header);
                    }
                    let _ = request.respond(response);
                }
                "/health" => {
                    let _ = request.respond(Response::from_string("OK"));
                }
                "/ready" => {
                    // Ready once the instrument has answered at least once
                    if SAMPLES_TOTAL.get() > 0 {
                        let _ = request.respond(Response::from_string("Ready"));
                    } else {
                        let _ = request
                            .respond(Response::from_string("Not Ready").with_status_code(503));
                    }
                }
                _ => {
                    let _ =
                        request.respond(Response::from_string("Not Found").with_status_code(404));
                }
            }
        }
    })
}

/// Initialize all metrics (forces lazy initialization)
pub fn init_metrics() {
    let _ = TERMINAL_VOLTS.get();
    let _ = CURRENT_AMPS.get();
    let _ = ACCUMULATED_MAH.get();
    let _ = ACTIVITY.get();
    let _ = PHASE_ELAPSED_S.get();
    let _ = SAMPLES_TOTAL.get();
    let _ = DEGRADED_TOTAL.get();
    let _ = TRANSPORT_ERRORS_TOTAL.get();
}

#[cfg(test)]
mod tests {
    use super::*;
    use cycler_core::sync::Activity;

    #[test]
    fn snapshot_and_counters_reach_the_registry() {
        init_metrics();
        record_snapshot(&CycleSnapshot {
            activity: Activity::Discharging,
            volts: 3.7,
            amps: -0.5,
            accumulated_mah: 42.0,
            elapsed_s: 120.0,
            iteration: 12,
        });
        let before = DEGRADED_TOTAL.get();
        record_facade_stats(
            &FacadeStats::default(),
            &FacadeStats {
                measurements: 5,
                degraded: 2,
                ..FacadeStats::default()
            },
        );

        assert_eq!(ACTIVITY.get(), Activity::Discharging.code());
        assert_eq!(DEGRADED_TOTAL.get(), before + 2);

        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&REGISTRY.gather(), &mut buffer)
            .unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert!(text.contains("cycler_accumulated_mah 42"));
    }
}
