//! Observability fabric: health, logging, metrics, tracing

pub mod health;
pub mod logger;
pub mod metrics;
pub mod tracer;

pub use health::{EndpointState, EndpointStatus, HealthChecker, SystemHealth, Trend};
pub use logger::{LogRecord, RecordLevel, RecordParams, StructuredLogger, init_subscriber};
pub use metrics::{MetricsRegistry, SeriesKey, ThresholdWatch};
pub use tracer::{FinishedSpan, TraceContext, Tracer};
