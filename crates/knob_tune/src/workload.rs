//! Workload partitioning and the concurrent runner.
//!
//! A workload is a flat list of SQL statements. It is capped, split
//! round-robin into one shard per worker, and each shard runs on its own OS
//! thread over its own connection. Workers report back over a channel, so a
//! failed shard or one that blows through the per-worker timeout cannot hold
//! the run hostage.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;

use crate::connection::{ConnectionManager, Connector, DbSession, QueryCanceller};

/// Default maximum number of statements executed per run.
pub const DEFAULT_STATEMENT_CAP: usize = 3000;

/// Progress is logged every this many statements per shard.
const PROGRESS_EVERY: usize = 200;

/// Statements of one workload source.
#[derive(Debug, Clone, PartialEq)]
pub struct Workload {
    /// Identifier used in evaluation records and baseline files.
    pub id: String,
    pub path: PathBuf,
    pub statements: Vec<String>,
}

impl Workload {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read workload {}", path.display()))?;
        Ok(Self {
            id: workload_id(path),
            path: path.to_path_buf(),
            statements: parse_statements(&text),
        })
    }
}

/// Derives the workload identifier from its file stem (`tpch_1.wg` → `tpch_1`).
pub fn workload_id(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Splits workload text on runs of `;` and newlines.
///
/// Blank fragments are dropped and every statement is re-terminated with `;`.
pub fn parse_statements(text: &str) -> Vec<String> {
    text.split(|c| c == ';' || c == '\n' || c == '\r')
        .map(str::trim)
        .filter(|fragment| !fragment.is_empty())
        .map(|fragment| format!("{fragment};"))
        .collect()
}

/// Statements split into per-worker shards.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardPlan {
    shards: Vec<Vec<String>>,
}

impl ShardPlan {
    /// Caps `statements` at `cap` and deals them round-robin over `threads` shards.
    ///
    /// Statement `i` lands in shard `i % threads`, in its original relative order.
    pub fn partition(statements: &[String], threads: usize, cap: usize) -> anyhow::Result<Self> {
        anyhow::ensure!(threads > 0, "thread count must be > 0");
        let mut shards = vec![Vec::new(); threads];
        for (idx, statement) in statements.iter().take(cap).enumerate() {
            shards[idx % threads].push(statement.clone());
        }
        Ok(Self { shards })
    }

    pub fn threads(&self) -> usize {
        self.shards.len()
    }

    pub fn shards(&self) -> &[Vec<String>] {
        &self.shards
    }

    pub fn total_statements(&self) -> usize {
        self.shards.iter().map(Vec::len).sum()
    }

    fn into_shards(self) -> Vec<Vec<String>> {
        self.shards
    }
}

/// How a shard's worker ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ShardOutcome {
    Completed,
    /// A statement failed; the rest of the shard was skipped.
    Failed { statement_index: usize, error: String },
    /// The worker did not report before the per-worker timeout.
    TimedOut,
}

/// Per-shard result of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardReport {
    pub shard: usize,
    pub statements: usize,
    pub executed: usize,
    pub elapsed: Duration,
    pub outcome: ShardOutcome,
}

/// Aggregate result of one workload run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunResult {
    pub elapsed: Duration,
    /// Statements per second, see [`throughput`].
    pub throughput: f64,
    pub shards: Vec<ShardReport>,
}

impl RunResult {
    /// True when any shard failed or timed out.
    pub fn is_degraded(&self) -> bool {
        self.shards
            .iter()
            .any(|report| report.outcome != ShardOutcome::Completed)
    }
}

/// Throughput of a run: the first shard's statement count times the thread
/// count, over the total elapsed time.
///
/// With uneven shards this is not the true executed total; the formula is
/// kept as is so results stay comparable with earlier tuning logs.
pub fn throughput(first_shard_len: usize, threads: usize, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    (first_shard_len * threads) as f64 / secs
}

/// Runs shard plans against the target server.
pub struct WorkloadRunner<C: Connector> {
    connections: ConnectionManager<C>,
    worker_timeout: Duration,
}

impl<C: Connector> WorkloadRunner<C> {
    pub fn new(connections: ConnectionManager<C>, worker_timeout: Duration) -> Self {
        Self {
            connections,
            worker_timeout,
        }
    }

    /// Executes every shard in parallel and waits for all of them to report
    /// or for the worker timeout to pass.
    ///
    /// Connections are opened before the clock starts; failing to open one is
    /// fatal for the run. On timeout the remaining workers are told to stop,
    /// their in-flight statements are cancelled, and every worker is joined
    /// before this returns, so nothing of this run leaks into the next phase.
    pub fn run(&self, plan: ShardPlan) -> anyhow::Result<RunResult> {
        let threads = plan.threads();
        let first_shard_len = plan.shards().first().map(Vec::len).unwrap_or(0);

        let mut sessions = Vec::with_capacity(threads);
        for shard in 0..threads {
            let session = self
                .connections
                .connect()
                .with_context(|| format!("open connection for shard {shard}"))?;
            sessions.push(session);
        }
        let cancellers: Vec<_> = sessions.iter().map(|session| session.canceller()).collect();

        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel::<ShardReport>();
        let start = Instant::now();
        let mut handles = Vec::with_capacity(threads);
        let mut sizes = Vec::with_capacity(threads);
        for (shard, (statements, session)) in plan.into_shards().into_iter().zip(sessions).enumerate() {
            sizes.push(statements.len());
            let tx = tx.clone();
            let worker_stop = Arc::clone(&stop);
            let spawned = thread::Builder::new()
                .name(format!("workload-shard-{shard}"))
                .spawn(move || {
                    let report = run_shard(shard, statements, session, &worker_stop);
                    // The runner may have stopped listening after a timeout.
                    let _ = tx.send(report);
                });
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    stop_workers(&stop, &cancellers, handles);
                    return Err(err).with_context(|| format!("spawn worker for shard {shard}"));
                }
            }
        }
        drop(tx);

        let mut reports: Vec<Option<ShardReport>> = vec![None; threads];
        let mut received = 0usize;
        let deadline = start.checked_add(self.worker_timeout);
        let mut timed_out = false;
        while received < threads {
            let remaining = match deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                None => self.worker_timeout,
            };
            match rx.recv_timeout(remaining) {
                Ok(report) => {
                    let shard = report.shard;
                    reports[shard] = Some(report);
                    received += 1;
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    timed_out = true;
                    break;
                }
                // Every remaining worker exited without reporting.
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }
        let elapsed = start.elapsed();

        if timed_out {
            tracing::error!(
                timeout = ?self.worker_timeout,
                pending = threads - received,
                "worker timeout reached; stopping remaining shards"
            );
            let pending: Vec<_> = reports
                .iter()
                .zip(&cancellers)
                .map(|(report, canceller)| canceller.as_ref().filter(|_| report.is_none()))
                .collect();
            stop.store(true, Ordering::SeqCst);
            cancel_all(pending.into_iter().flatten());
        }
        for handle in handles {
            if handle.join().is_err() {
                tracing::error!("shard worker panicked");
            }
        }
        // Reports sent by workers after the deadline; they only carry progress.
        let mut late: Vec<Option<ShardReport>> = vec![None; threads];
        while let Ok(report) = rx.try_recv() {
            let shard = report.shard;
            late[shard] = Some(report);
        }

        let mut shards = Vec::with_capacity(threads);
        for (shard, (report, late)) in reports.into_iter().zip(late).enumerate() {
            if let Some(report) = report {
                shards.push(report);
                continue;
            }
            let outcome = if timed_out {
                ShardOutcome::TimedOut
            } else {
                tracing::error!(shard, "shard worker exited without reporting");
                ShardOutcome::Failed {
                    statement_index: 0,
                    error: "worker exited without reporting".to_string(),
                }
            };
            shards.push(ShardReport {
                shard,
                statements: sizes[shard],
                executed: late.map(|report| report.executed).unwrap_or(0),
                elapsed,
                outcome,
            });
        }

        let result = RunResult {
            elapsed,
            throughput: throughput(first_shard_len, threads, elapsed),
            shards,
        };
        tracing::info!(
            threads,
            statements = sizes.iter().sum::<usize>(),
            elapsed_ms = elapsed.as_millis() as u64,
            throughput = result.throughput,
            degraded = result.is_degraded(),
            "workload run finished"
        );
        Ok(result)
    }
}

fn cancel_all<'a>(cancellers: impl Iterator<Item = &'a Box<dyn QueryCanceller>>) {
    for canceller in cancellers {
        if let Err(err) = canceller.cancel() {
            tracing::warn!(error = %format!("{err:#}"), "statement cancel failed");
        }
    }
}

/// Stops and joins already spawned workers after a failed spawn.
fn stop_workers(
    stop: &AtomicBool,
    cancellers: &[Option<Box<dyn QueryCanceller>>],
    handles: Vec<thread::JoinHandle<()>>,
) {
    stop.store(true, Ordering::SeqCst);
    cancel_all(cancellers[..handles.len()].iter().flatten());
    for handle in handles {
        let _ = handle.join();
    }
}

/// Executes one shard sequentially, committing after each statement.
///
/// Checks `stop` before every statement and returns early once it is set.
fn run_shard<S: DbSession>(
    shard: usize,
    statements: Vec<String>,
    mut session: S,
    stop: &AtomicBool,
) -> ShardReport {
    let total = statements.len();
    tracing::info!(shard, statements = total, "shard started");
    let start = Instant::now();
    for (idx, statement) in statements.iter().enumerate() {
        if stop.load(Ordering::SeqCst) {
            tracing::warn!(shard, executed = idx, total, "shard stopped before completion");
            return ShardReport {
                shard,
                statements: total,
                executed: idx,
                elapsed: start.elapsed(),
                outcome: ShardOutcome::TimedOut,
            };
        }
        let result = session
            .execute(statement)
            .and_then(|()| session.commit());
        if let Err(err) = result {
            let error = format!("{err:#}");
            tracing::error!(shard, statement_index = idx, %error, "statement failed; abandoning shard");
            return ShardReport {
                shard,
                statements: total,
                executed: idx,
                elapsed: start.elapsed(),
                outcome: ShardOutcome::Failed {
                    statement_index: idx,
                    error,
                },
            };
        }
        if (idx + 1) % PROGRESS_EVERY == 0 {
            tracing::debug!(shard, done = idx + 1, total, elapsed = ?start.elapsed(), "shard progress");
        }
    }
    let elapsed = start.elapsed();
    tracing::info!(shard, statements = total, elapsed_ms = elapsed.as_millis() as u64, "shard finished");
    ShardReport {
        shard,
        statements: total,
        executed: total,
        elapsed,
        outcome: ShardOutcome::Completed,
    }
}
