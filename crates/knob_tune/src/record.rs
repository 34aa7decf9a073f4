//! Append-only evaluation log.
//!
//! One JSON object per line. Knob values sit at the top level next to the
//! measured fields so the file can be fed straight to the surrogate trainer.

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::knobs::Configuration;
use crate::metrics::MetricsSnapshot;

/// One evaluated configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRecord {
    #[serde(flatten)]
    pub configuration: Configuration,
    /// `[-throughput, 1 / throughput]`; the reciprocal is 0 for a non-positive throughput.
    pub y: [f64; 2],
    pub inner_metrics: MetricsSnapshot,
    pub workload: String,
    /// Unix time in seconds.
    pub timestamp: f64,
}

impl EvaluationRecord {
    pub fn new(
        configuration: Configuration,
        inner_metrics: MetricsSnapshot,
        throughput: f64,
        workload: impl Into<String>,
    ) -> Self {
        let negated = if throughput == 0.0 { 0.0 } else { -throughput };
        let reciprocal = if throughput > 0.0 { 1.0 / throughput } else { 0.0 };
        Self {
            configuration,
            y: [negated, reciprocal],
            inner_metrics,
            workload: workload.into(),
            timestamp: unix_seconds(),
        }
    }

    pub fn throughput(&self) -> f64 {
        -self.y[0]
    }
}

fn unix_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Line-delimited JSON file that records are appended to.
#[derive(Debug, Clone)]
pub struct EvaluationLog {
    path: PathBuf,
}

impl EvaluationLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one record as a single line.
    pub fn append(&self, record: &EvaluationRecord) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create dir {}", parent.display()))?;
        }
        let mut line = serde_json::to_vec(record).context("serialize evaluation record")?;
        line.push(b'\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open {}", self.path.display()))?;
        file.write_all(&line)
            .with_context(|| format!("append to {}", self.path.display()))?;
        file.flush()?;
        Ok(())
    }

    /// Reads back every record; an absent log is empty.
    pub fn read_all(&self) -> anyhow::Result<Vec<EvaluationRecord>> {
        let file = match std::fs::File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err).with_context(|| format!("open {}", self.path.display())),
        };
        let mut records = Vec::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line.with_context(|| format!("read {}", self.path.display()))?;
            if line.trim().is_empty() {
                continue;
            }
            let record = serde_json::from_str(&line)
                .with_context(|| format!("parse line {} of {}", idx + 1, self.path.display()))?;
            records.push(record);
        }
        Ok(records)
    }
}
