//! Scalar series export.

use crate::constants::files::{METRICS_TEXTFILE, SCALARS_FILE};
use crate::error::{AppError, Result};
use metrics::{describe_counter, describe_gauge, describe_histogram, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use tracing::{debug, info};

/// Destination for tagged scalar values such as `loss/step`.
pub trait ScalarSink {
    fn add_scalar(&mut self, tag: &str, value: f64, step: u64) -> Result<()>;

    /// Push buffered values to their destination.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// One line of the scalar log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarRecord {
    pub tag: String,
    pub value: f64,
    pub step: u64,
}

static PROMETHEUS: OnceLock<PrometheusHandle> = OnceLock::new();
static PROMETHEUS_INSTALL: Mutex<()> = Mutex::new(());

/// The process-wide Prometheus recorder, installed on first use.
fn prometheus_handle() -> Result<PrometheusHandle> {
    if let Some(handle) = PROMETHEUS.get() {
        return Ok(handle.clone());
    }
    // Installation is serialized; the winner publishes the handle for the rest.
    let _install = PROMETHEUS_INSTALL
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(handle) = PROMETHEUS.get() {
        return Ok(handle.clone());
    }
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| AppError::Metrics(format!("Failed to install Prometheus recorder: {}", e)))?;
    register_metrics();
    info!("Metrics collection initialized");
    Ok(PROMETHEUS.get_or_init(|| handle).clone())
}

fn register_metrics() {
    describe_gauge!(
        "training_scalar",
        "Latest value of each training scalar series, labelled by tag"
    );
    describe_gauge!(
        "training_scalar_step",
        "Step or epoch index of the latest value of each series"
    );
    describe_counter!("training_steps_total", "Optimizer steps taken");
    describe_histogram!(
        "training_step_duration_seconds",
        "Wall time of one forward/backward/update step in seconds"
    );
    describe_histogram!(
        "training_grad_norm",
        "Global gradient norm before clipping"
    );
}

/// Writes `scalars.jsonl` and renders Prometheus gauges to `metrics.prom`,
/// both in the run's output directory.
pub struct MetricsWriter {
    prometheus_handle: PrometheusHandle,
    scalars: BufWriter<File>,
    textfile: PathBuf,
}

impl MetricsWriter {
    pub fn new(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let scalars_path = dir.join(SCALARS_FILE);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&scalars_path)?;
        debug!("Appending scalars to {}", scalars_path.display());
        Ok(Self {
            prometheus_handle: prometheus_handle()?,
            scalars: BufWriter::new(file),
            textfile: dir.join(METRICS_TEXTFILE),
        })
    }
}

impl ScalarSink for MetricsWriter {
    fn add_scalar(&mut self, tag: &str, value: f64, step: u64) -> Result<()> {
        let record = ScalarRecord {
            tag: tag.to_string(),
            value,
            step,
        };
        serde_json::to_writer(&mut self.scalars, &record)?;
        self.scalars.write_all(b"\n")?;

        gauge!("training_scalar", "tag" => record.tag.clone()).set(value);
        gauge!("training_scalar_step", "tag" => record.tag).set(step as f64);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.scalars.flush()?;
        fs::write(&self.textfile, self.prometheus_handle.render())?;
        Ok(())
    }
}

/// Keeps every record in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    pub records: Vec<ScalarRecord>,
    pub flushes: usize,
}

impl MemorySink {
    /// `(step, value)` pairs recorded under `tag`, in order.
    pub fn series(&self, tag: &str) -> Vec<(u64, f64)> {
        self.records
            .iter()
            .filter(|r| r.tag == tag)
            .map(|r| (r.step, r.value))
            .collect()
    }
}

impl ScalarSink for MemorySink {
    fn add_scalar(&mut self, tag: &str, value: f64, step: u64) -> Result<()> {
        self.records.push(ScalarRecord {
            tag: tag.to_string(),
            value,
            step,
        });
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.flushes += 1;
        Ok(())
    }
}
