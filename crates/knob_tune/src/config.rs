//! Process configuration read from `KNOB_TUNE_*` environment variables.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::connection::{ConnectionManager, PgConnectParams, PgConnector, RetryPolicy};
use crate::evaluator::EvaluatorOptions;
use crate::server::PgCtlServer;
use crate::workload::DEFAULT_STATEMENT_CAP;

/// Settings for one tuner process.
#[derive(Debug, Clone)]
pub struct TunerConfig {
    pub pg_host: String,
    pub pg_port: u16,
    pub pg_database: String,
    pub pg_user: String,
    pub pg_password: String,
    pub connect_timeout: Duration,
    pub data_dir: PathBuf,
    pub pg_ctl: PathBuf,
    pub threads: usize,
    pub statement_cap: usize,
    pub connect_attempts: u32,
    pub connect_backoff: Duration,
    pub recovery_wait: Duration,
    pub restart_grace: Duration,
    pub worker_timeout: Duration,
}

impl TunerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary variable source.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let pg_host = var("KNOB_TUNE_PG_HOST").unwrap_or_else(|| "127.0.0.1".to_string());
        let pg_port = parse_port(var("KNOB_TUNE_PG_PORT"), 5432)?;
        let pg_database = var("KNOB_TUNE_PG_DATABASE").unwrap_or_else(|| "benchbase".to_string());
        let pg_user = var("KNOB_TUNE_PG_USER").unwrap_or_else(|| "postgres".to_string());
        let pg_password = var("KNOB_TUNE_PG_PASSWORD").unwrap_or_default();
        let connect_timeout = parse_millis(var("KNOB_TUNE_CONNECT_TIMEOUT_MS"), 10_000)?;
        let data_dir = var("KNOB_TUNE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/var/lib/postgresql/data"));
        let pg_ctl = var("KNOB_TUNE_PG_CTL")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("pg_ctl"));
        let threads = parse_usize(var("KNOB_TUNE_THREADS"), 4)?;
        anyhow::ensure!(threads > 0, "KNOB_TUNE_THREADS must be > 0");
        let statement_cap = parse_usize(var("KNOB_TUNE_STATEMENT_CAP"), DEFAULT_STATEMENT_CAP)?;
        let connect_attempts = parse_u64(var("KNOB_TUNE_CONNECT_ATTEMPTS"), 3)?;
        let connect_attempts = u32::try_from(connect_attempts)
            .with_context(|| format!("connect attempts out of range: {connect_attempts}"))?
            .max(1);
        let connect_backoff = parse_millis(var("KNOB_TUNE_CONNECT_BACKOFF_MS"), 5_000)?;
        let recovery_wait = parse_millis(var("KNOB_TUNE_RECOVERY_WAIT_MS"), 10_000)?;
        let restart_grace = parse_millis(var("KNOB_TUNE_RESTART_GRACE_MS"), 5_000)?;
        let worker_timeout = parse_millis(var("KNOB_TUNE_WORKER_TIMEOUT_MS"), 600_000)?;

        Ok(Self {
            pg_host,
            pg_port,
            pg_database,
            pg_user,
            pg_password,
            connect_timeout,
            data_dir,
            pg_ctl,
            threads,
            statement_cap,
            connect_attempts,
            connect_backoff,
            recovery_wait,
            restart_grace,
            worker_timeout,
        })
    }

    pub fn connect_params(&self) -> PgConnectParams {
        PgConnectParams {
            host: self.pg_host.clone(),
            port: self.pg_port,
            database: self.pg_database.clone(),
            user: self.pg_user.clone(),
            password: self.pg_password.clone(),
            connect_timeout: self.connect_timeout,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.connect_attempts,
            backoff: self.connect_backoff,
            recovery_wait: self.recovery_wait,
        }
    }

    pub fn server(&self) -> PgCtlServer {
        PgCtlServer::new(&self.pg_ctl, &self.data_dir)
    }

    /// Connection manager for the configured PostgreSQL instance.
    pub fn connection_manager(&self) -> ConnectionManager<PgConnector> {
        ConnectionManager::new(
            PgConnector::new(self.connect_params()),
            Arc::new(self.server()),
            self.retry_policy(),
        )
    }

    pub fn evaluator_options(&self, metrics_dir: &Path) -> EvaluatorOptions {
        EvaluatorOptions {
            threads: self.threads,
            statement_cap: self.statement_cap,
            restart_grace: self.restart_grace,
            worker_timeout: self.worker_timeout,
            metrics_dir: metrics_dir.to_path_buf(),
        }
    }
}

/// Parses an optional port value with fallback default.
fn parse_port(value: Option<String>, default_port: u16) -> Result<u16> {
    match value {
        Some(raw) => raw
            .parse::<u16>()
            .with_context(|| format!("invalid port value: {raw}")),
        None => Ok(default_port),
    }
}

fn parse_usize(value: Option<String>, default_value: usize) -> Result<usize> {
    match value {
        Some(raw) => raw
            .parse::<usize>()
            .with_context(|| format!("invalid usize value: {raw}")),
        None => Ok(default_value),
    }
}

fn parse_u64(value: Option<String>, default_value: u64) -> Result<u64> {
    match value {
        Some(raw) => raw
            .parse::<u64>()
            .with_context(|| format!("invalid u64 value: {raw}")),
        None => Ok(default_value),
    }
}

fn parse_millis(value: Option<String>, default_ms: u64) -> Result<Duration> {
    parse_u64(value, default_ms).map(Duration::from_millis)
}
