//! Logging, metrics and the alert sink

pub mod events;
pub mod logging;
pub mod metrics;

pub use events::{AlertLevel, EventSink, FanoutSink, RecordingSink, RunEvent, TracingSink};
pub use logging::{init_logging, init_logging_simple};
pub use metrics::Metrics;
