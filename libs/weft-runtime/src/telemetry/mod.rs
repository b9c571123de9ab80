//! Telemetry helpers: log throttling and worker metric samples.

mod metrics;
mod throttled_log;

pub use metrics::{DEFAULT_SAMPLES_PER_SERVICE, MetricRecord, MetricsStore};
pub use throttled_log::ThrottledLog;
