pub mod csv_sink;
pub mod hp6632b;
pub mod metrics;

pub use csv_sink::CsvTelemetrySink;
pub use hp6632b::{Hp6632b, ScpiError, DEFAULT_BAUD};
pub use metrics::{init_metrics, serve_metrics};
