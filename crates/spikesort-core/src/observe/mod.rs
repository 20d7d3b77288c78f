//! # Observability
//!
//! - **Logging**: structured events through `tracing`, installed with
//!   [`init_logging`]
//! - **Metrics**: lock-free counters and gauges in [`SorterMetrics`], exported
//!   as a [`MetricsSnapshot`] or Prometheus text
//!
//! ```text
//!   hoard / train / classify
//!      │            │
//!      ▼            ▼
//!   tracing::*!   metrics.*.inc()
//!      │            │
//!      ▼            ▼
//!   fmt layer    snapshot() / to_prometheus()
//! ```

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LogConfig, LogFormat, LogLevel};
pub use metrics::{Counter, Gauge, Histogram, MetricsSnapshot, SorterMetrics};
