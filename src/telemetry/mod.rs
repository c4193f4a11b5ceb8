//! Observability for training runs.
//!
//! Structured logs go through `tracing` to stderr. Scalar series (learning rate,
//! losses, CER) go through a [`ScalarSink`]: the production sink appends a JSON
//! lines log and mirrors every value into Prometheus gauges rendered to a
//! textfile.

mod logging;
mod scalars;

pub use logging::{init_tracing, LogFormat, TracingConfig};
pub use scalars::{MemorySink, MetricsWriter, ScalarRecord, ScalarSink};
