//! Exercises the read-only parts of the harness against a real server.
//!
//! Connection settings come from the usual `KNOB_TUNE_PG_*` variables. The
//! test never restarts the server or changes its configuration.

mod common;

use anyhow::{Context, Result};
use knob_tune::plans::{extract_query_plans, fetch_current_knobs};
use knob_tune::workload::{parse_statements, ShardOutcome};
use knob_tune::{MetricsCollector, ShardPlan, TunerConfig, WorkloadRunner};
use std::time::Duration;

const PROBE_WORKLOAD: &str = "SELECT 1;\nSELECT count(*) FROM pg_class;\nSELECT now();\n\
     SELECT current_setting('shared_buffers');\nSELECT 2 + 2";

#[test]
#[ignore = "needs a running PostgreSQL reachable through KNOB_TUNE_PG_*"]
fn live_server_read_path() -> Result<()> {
    let config = TunerConfig::from_env()?;
    let connections = config.connection_manager();
    let catalog = common::catalog();

    let mut session = connections.connect().context("connect to live server")?;
    let current = fetch_current_knobs(&mut session, &catalog)?;
    assert!(current.get("shared_buffers").is_some(), "current: {current:?}");

    let statements = parse_statements(PROBE_WORKLOAD);
    let plans = extract_query_plans(&mut session, &statements);
    assert_eq!(plans.len(), statements.len());
    drop(session);

    let runner = WorkloadRunner::new(connections.clone(), Duration::from_secs(60));
    let run = runner.run(ShardPlan::partition(&statements, 2, 3000)?)?;
    assert!(run
        .shards
        .iter()
        .all(|report| report.outcome == ShardOutcome::Completed));
    assert!(run.throughput > 0.0);

    let snapshot = MetricsCollector::new(connections).collect();
    assert!(!snapshot.is_zeroed());
    Ok(())
}
