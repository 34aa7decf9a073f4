//! Shared helpers for integration tests: an in-memory PostgreSQL stand-in.
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use knob_tune::{
    ConnectionManager, Connector, DbSession, EvaluatorOptions, KnobCatalog, RetryPolicy,
    ServerControl,
};

/// Everything the fake server observed, plus the faults it should inject.
#[derive(Debug, Default)]
pub struct FakeState {
    /// Statements run outside a transaction (`ALTER SYSTEM`, stat resets).
    pub utility: Vec<String>,
    /// Committed workload statements.
    pub committed: Vec<String>,
    /// `stop`, `start`, `remove_override` in call order.
    pub server_events: Vec<String>,
    pub connects: usize,
    /// Number of upcoming `start` calls that fail.
    pub start_failures: u32,
    /// Workload statements containing this text fail.
    pub failing_statement: Option<String>,
    pub refuse_connections: bool,
}

/// Handle to one fake server instance; clones share state.
#[derive(Clone, Default)]
pub struct FakeCluster {
    state: Arc<Mutex<FakeState>>,
}

impl FakeCluster {
    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    /// Connection manager with instant retries.
    pub fn manager(&self) -> ConnectionManager<FakeConnector> {
        ConnectionManager::new(
            FakeConnector(self.clone()),
            Arc::new(FakeServer(self.clone())),
            RetryPolicy {
                max_attempts: 3,
                backoff: Duration::ZERO,
                recovery_wait: Duration::ZERO,
            },
        )
    }

    pub fn clear_observations(&self) {
        let mut state = self.state();
        state.utility.clear();
        state.committed.clear();
        state.server_events.clear();
    }
}

pub struct FakeConnector(FakeCluster);

impl Connector for FakeConnector {
    type Session = FakeSession;

    fn connect(&self) -> anyhow::Result<FakeSession> {
        let mut state = self.0.state();
        state.connects += 1;
        if state.refuse_connections {
            anyhow::bail!("connection refused");
        }
        Ok(FakeSession {
            cluster: self.0.clone(),
            pending: Vec::new(),
        })
    }
}

pub struct FakeSession {
    cluster: FakeCluster,
    pending: Vec<String>,
}

impl DbSession for FakeSession {
    fn execute(&mut self, sql: &str) -> anyhow::Result<()> {
        let state = self.cluster.state();
        if let Some(needle) = &state.failing_statement {
            if sql.contains(needle.as_str()) {
                anyhow::bail!("deadlock detected");
            }
        }
        self.pending.push(sql.to_string());
        Ok(())
    }

    fn commit(&mut self) -> anyhow::Result<()> {
        let mut state = self.cluster.state();
        state.committed.append(&mut self.pending);
        Ok(())
    }

    fn execute_utility(&mut self, sql: &str) -> anyhow::Result<()> {
        self.commit()?;
        self.cluster.state().utility.push(sql.to_string());
        Ok(())
    }

    fn query_text(&mut self, sql: &str) -> anyhow::Result<Vec<Vec<Option<String>>>> {
        let row: Vec<&str> = if sql.contains("pg_stat_database") {
            vec!["120", "2", "40", "960", "5000", "2500", "30", "0", "25", "4"]
        } else if sql.contains("pg_statio_user_tables") {
            vec!["40"]
        } else if sql.contains("pg_stat_bgwriter") {
            vec!["12"]
        } else {
            anyhow::bail!("unexpected query: {sql}");
        };
        Ok(vec![row.into_iter().map(|v| Some(v.to_string())).collect()])
    }
}

pub struct FakeServer(FakeCluster);

impl ServerControl for FakeServer {
    fn stop(&self) -> anyhow::Result<()> {
        self.0.state().server_events.push("stop".to_string());
        Ok(())
    }

    fn start(&self) -> anyhow::Result<()> {
        let mut state = self.0.state();
        state.server_events.push("start".to_string());
        if state.start_failures > 0 {
            state.start_failures -= 1;
            anyhow::bail!("FATAL: invalid value for parameter");
        }
        Ok(())
    }

    fn remove_override_file(&self) -> anyhow::Result<bool> {
        self.0.state().server_events.push("remove_override".to_string());
        Ok(true)
    }
}

pub fn testdata(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("testdata").join(name)
}

pub fn catalog() -> KnobCatalog {
    KnobCatalog::load(&testdata("knobs.json")).unwrap()
}

pub fn options(metrics_dir: &Path) -> EvaluatorOptions {
    EvaluatorOptions {
        threads: 4,
        statement_cap: 3000,
        restart_grace: Duration::ZERO,
        worker_timeout: Duration::from_secs(30),
        metrics_dir: metrics_dir.to_path_buf(),
    }
}
