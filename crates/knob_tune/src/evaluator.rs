//! Objective function handed to the optimizer.
//!
//! One call turns a proposed configuration into a scalar cost to minimize.
//! The real path applies the configuration, restarts the server, runs the
//! workload and appends an evaluation record. The surrogate path only
//! predicts, and never touches the server.

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;

use crate::applier::ConfigApplier;
use crate::connection::{ConnectionManager, Connector};
use crate::error::TuneError;
use crate::knobs::{Configuration, KnobCatalog};
use crate::metrics::{self, MetricsCollector, MetricsSnapshot};
use crate::record::{EvaluationLog, EvaluationRecord};
use crate::surrogate::{self, SurrogatePredictor};
use crate::workload::{RunResult, ShardPlan, Workload, WorkloadRunner};

/// Cost returned for an iteration that produced no usable measurement.
pub const PENALTY_COST: f64 = f64::MAX;

/// Maps throughput to cost: positive throughput is negated, anything else is
/// passed through unchanged.
pub fn cost_from_throughput(throughput: f64) -> f64 {
    if throughput > 0.0 {
        -throughput
    } else {
        throughput
    }
}

/// Knobs of one evaluator instance that do not come from the catalog.
#[derive(Debug, Clone)]
pub struct EvaluatorOptions {
    pub threads: usize,
    pub statement_cap: usize,
    pub restart_grace: Duration,
    pub worker_timeout: Duration,
    /// Directory holding `<workload>_internal_metrics.json` baselines.
    pub metrics_dir: PathBuf,
}

pub struct ObjectiveEvaluator<C: Connector> {
    catalog: KnobCatalog,
    workload: Workload,
    connections: ConnectionManager<C>,
    applier: ConfigApplier<C>,
    runner: WorkloadRunner<C>,
    collector: MetricsCollector<C>,
    log: EvaluationLog,
    options: EvaluatorOptions,
    baseline: Option<MetricsSnapshot>,
    surrogate: Option<SurrogatePredictor>,
}

impl<C: Connector> ObjectiveEvaluator<C> {
    pub fn new(
        connections: ConnectionManager<C>,
        catalog: KnobCatalog,
        workload: Workload,
        log: EvaluationLog,
        options: EvaluatorOptions,
    ) -> Self {
        Self {
            applier: ConfigApplier::new(connections.clone(), options.restart_grace),
            runner: WorkloadRunner::new(connections.clone(), options.worker_timeout),
            collector: MetricsCollector::new(connections.clone()),
            connections,
            catalog,
            workload,
            log,
            options,
            baseline: None,
            surrogate: None,
        }
    }

    pub fn with_surrogate(mut self, predictor: SurrogatePredictor) -> Self {
        self.surrogate = Some(predictor);
        self
    }

    pub fn catalog(&self) -> &KnobCatalog {
        &self.catalog
    }

    pub fn workload(&self) -> &Workload {
        &self.workload
    }

    pub fn baseline(&self) -> Option<&MetricsSnapshot> {
        self.baseline.as_ref()
    }

    /// Runs the workload on the server's default configuration and caches
    /// (and persists) the resulting metrics snapshot.
    pub fn run_baseline(&mut self) -> anyhow::Result<MetricsSnapshot> {
        tracing::info!(workload = %self.workload.id, "running baseline with default configuration");
        match self.connections.server().remove_override_file() {
            Ok(removed) => tracing::debug!(removed, "override file cleared"),
            Err(err) => tracing::warn!(error = %format!("{err:#}"), "override-file removal failed"),
        }
        self.applier.restart()?;
        self.collector.reset()?;
        let run = self.run_workload()?;
        let snapshot = self.collector.collect();

        let path = metrics::save_baseline(&self.options.metrics_dir, &self.workload.id, &snapshot)?;
        tracing::info!(
            workload = %self.workload.id,
            throughput = run.throughput,
            path = %path.display(),
            "baseline recorded"
        );
        self.baseline = Some(snapshot);
        Ok(snapshot)
    }

    /// Loads a previously persisted baseline into the cache.
    ///
    /// Returns false when none has been saved for this workload.
    pub fn load_baseline(&mut self) -> anyhow::Result<bool> {
        match metrics::load_baseline(&self.options.metrics_dir, &self.workload.id)? {
            Some(snapshot) => {
                tracing::info!(workload = %self.workload.id, "baseline loaded from disk");
                self.baseline = Some(snapshot);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Evaluates `config` against the live server and returns its cost.
    ///
    /// A configuration the server cannot restart with costs
    /// [`PENALTY_COST`] and leaves no record. Other failures, such as
    /// connection exhaustion, are returned to the caller.
    pub fn evaluate(&mut self, config: &Configuration) -> anyhow::Result<f64> {
        let baseline = match self.baseline {
            Some(snapshot) => snapshot,
            None => self.run_baseline()?,
        };

        let outcome = match self.applier.apply(&self.catalog, config) {
            Ok(outcome) => outcome,
            Err(err) => {
                if let Some(TuneError::RestartFailed(reason)) = TuneError::from_anyhow(&err) {
                    tracing::error!(%reason, "iteration aborted; returning penalty cost");
                    return Ok(PENALTY_COST);
                }
                return Err(err);
            }
        };

        let run = self.run_workload()?;
        let record = EvaluationRecord::new(config.clone(), baseline, run.throughput, self.workload.id.clone());
        self.log.append(&record)?;

        let cost = cost_from_throughput(run.throughput);
        tracing::info!(
            workload = %self.workload.id,
            throughput = run.throughput,
            cost,
            degraded_apply = outcome.is_degraded(),
            degraded_run = run.is_degraded(),
            "configuration evaluated"
        );
        Ok(cost)
    }

    /// Predicts the cost of `config` with the loaded surrogate.
    ///
    /// Uses the cached baseline, falling back to the persisted one.
    pub fn evaluate_surrogate(&mut self, config: &Configuration) -> anyhow::Result<f64> {
        if self.surrogate.is_none() {
            return Err(TuneError::SurrogateUnavailable("no surrogate artifact loaded".to_string()).into());
        }
        if self.baseline.is_none() && !self.load_baseline()? {
            return Err(TuneError::SurrogateUnavailable(format!(
                "no baseline metrics for workload {}",
                self.workload.id
            ))
            .into());
        }
        let (Some(predictor), Some(baseline)) = (&self.surrogate, &self.baseline) else {
            return Err(TuneError::SurrogateUnavailable("surrogate state missing".to_string()).into());
        };

        // Unknown knobs are rejected the same way the real path rejects them.
        self.catalog.resolve(config)?;
        let features = surrogate::build_features(&self.catalog, config, baseline);
        let predicted = predictor.predict(&features)?;
        if !predicted.is_finite() {
            tracing::warn!(predicted, "non-finite surrogate prediction; returning penalty cost");
            return Ok(PENALTY_COST);
        }
        let cost = cost_from_throughput(predicted);
        tracing::debug!(predicted, cost, "surrogate evaluation");
        Ok(cost)
    }

    /// Answers optimizer proposals read as JSON lines from `input`, writing
    /// one cost per line to `output`.
    ///
    /// A line that does not parse, or whose evaluation fails, is logged and
    /// answered with [`PENALTY_COST`], so every input line gets exactly one
    /// output line. Only I/O on the two streams ends the loop early. Returns
    /// the number of proposals answered.
    pub fn serve_jsonl<R: BufRead, W: Write>(
        &mut self,
        input: R,
        mut output: W,
        use_surrogate: bool,
    ) -> anyhow::Result<usize> {
        let mut answered = 0usize;
        for (idx, line) in input.lines().enumerate() {
            let line = line.context("read configuration")?;
            if line.trim().is_empty() {
                continue;
            }
            let result = serde_json::from_str::<Configuration>(&line)
                .context("malformed configuration")
                .and_then(|proposal| {
                    if use_surrogate {
                        self.evaluate_surrogate(&proposal)
                    } else {
                        self.evaluate(&proposal)
                    }
                });
            let cost = match result {
                Ok(cost) => cost,
                Err(err) => {
                    tracing::error!(
                        line = idx + 1,
                        error = %format!("{err:#}"),
                        "iteration aborted; returning penalty cost"
                    );
                    PENALTY_COST
                }
            };
            writeln!(output, "{cost}").context("write cost")?;
            output.flush().context("flush cost")?;
            answered += 1;
        }
        Ok(answered)
    }

    fn run_workload(&self) -> anyhow::Result<RunResult> {
        let plan = ShardPlan::partition(
            &self.workload.statements,
            self.options.threads,
            self.options.statement_cap,
        )?;
        let run = self.runner.run(plan)?;
        if run.is_degraded() {
            tracing::warn!(workload = %self.workload.id, "workload run degraded");
        }
        Ok(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cost_negates_positive_throughput() {
        assert_eq!(cost_from_throughput(120.5), -120.5);
        assert_eq!(cost_from_throughput(0.0), 0.0);
        assert_eq!(cost_from_throughput(-3.0), -3.0);
    }
}
