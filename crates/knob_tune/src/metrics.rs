//! Fixed-schema snapshot of the server's internal counters.
//!
//! The snapshot feeds the surrogate feature vector, so its width and order
//! never change: a failed collection yields all zeros rather than a shorter
//! or partially filled vector.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::connection::{ConnectionManager, Connector, DbSession};

/// Server page size used to turn block counts into bytes.
pub const PAGE_SIZE_BYTES: f64 = 8192.0;

/// Number of entries in a [`MetricsSnapshot`].
pub const METRIC_COUNT: usize = 14;

/// Metric names in snapshot order.
pub const METRIC_NAMES: [&str; METRIC_COUNT] = [
    "xact_commit",
    "xact_rollback",
    "blks_read",
    "blks_hit",
    "tup_returned",
    "tup_fetched",
    "tup_inserted",
    "conflicts",
    "tup_updated",
    "tup_deleted",
    "disk_read_count",
    "disk_write_count",
    "disk_read_bytes",
    "disk_write_bytes",
];

const DATABASE_STATS_SQL: &str = "SELECT xact_commit, xact_rollback, blks_read, blks_hit, \
     tup_returned, tup_fetched, tup_inserted, conflicts, tup_updated, tup_deleted \
     FROM pg_stat_database WHERE datname = current_database()";

const DISK_READ_SQL: &str = "SELECT COALESCE(SUM(COALESCE(heap_blks_read, 0) \
     + COALESCE(idx_blks_read, 0) + COALESCE(toast_blks_read, 0) \
     + COALESCE(tidx_blks_read, 0)), 0) FROM pg_statio_user_tables";

const DISK_WRITE_SQL: &str =
    "SELECT buffers_checkpoint + buffers_clean + buffers_backend FROM pg_stat_bgwriter";

const RESET_SQL: [&str; 2] = [
    "SELECT pg_stat_reset()",
    "SELECT pg_stat_reset_shared('bgwriter')",
];

/// Fourteen counters in [`METRIC_NAMES`] order.
///
/// Serialized as a plain array, which is the form the evaluation log uses.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetricsSnapshot {
    values: [f64; METRIC_COUNT],
}

impl Default for MetricsSnapshot {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl MetricsSnapshot {
    pub fn zeroed() -> Self {
        Self {
            values: [0.0; METRIC_COUNT],
        }
    }

    pub fn from_values(values: [f64; METRIC_COUNT]) -> Self {
        Self { values }
    }

    /// Builds a snapshot from the raw counters; byte counts are derived.
    fn from_counters(database: [f64; 10], disk_read_count: f64, disk_write_count: f64) -> Self {
        let mut values = [0.0; METRIC_COUNT];
        values[..10].copy_from_slice(&database);
        values[10] = disk_read_count;
        values[11] = disk_write_count;
        values[12] = disk_read_count * PAGE_SIZE_BYTES;
        values[13] = disk_write_count * PAGE_SIZE_BYTES;
        Self { values }
    }

    pub fn values(&self) -> &[f64; METRIC_COUNT] {
        &self.values
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        METRIC_NAMES
            .iter()
            .position(|metric| *metric == name)
            .map(|idx| self.values[idx])
    }

    pub fn is_zeroed(&self) -> bool {
        self.values.iter().all(|v| *v == 0.0)
    }

    /// Name → value view used for the baseline metrics file.
    pub fn to_map(&self) -> BTreeMap<String, f64> {
        METRIC_NAMES
            .iter()
            .zip(self.values)
            .map(|(name, value)| (name.to_string(), value))
            .collect()
    }

    /// Rebuilds a snapshot from a name → value map; every metric must be present.
    pub fn from_map(map: &BTreeMap<String, f64>) -> anyhow::Result<Self> {
        let mut values = [0.0; METRIC_COUNT];
        for (slot, name) in values.iter_mut().zip(METRIC_NAMES) {
            *slot = *map
                .get(name)
                .with_context(|| format!("metric {name} missing"))?;
        }
        Ok(Self { values })
    }
}

/// Reads and resets the server's statistics counters.
pub struct MetricsCollector<C: Connector> {
    connections: ConnectionManager<C>,
}

impl<C: Connector> MetricsCollector<C> {
    pub fn new(connections: ConnectionManager<C>) -> Self {
        Self { connections }
    }

    /// Collects a full snapshot, or all zeros if anything fails.
    pub fn collect(&self) -> MetricsSnapshot {
        let result = self
            .connections
            .connect()
            .and_then(|mut session| query_snapshot(&mut session));
        match result {
            Ok(snapshot) => snapshot,
            Err(err) => {
                tracing::warn!(error = %format!("{err:#}"), "metrics collection failed; using zero snapshot");
                MetricsSnapshot::zeroed()
            }
        }
    }

    /// Zeroes the database and background-writer counters.
    pub fn reset(&self) -> anyhow::Result<()> {
        let mut session = self.connections.connect()?;
        for sql in RESET_SQL {
            session
                .execute_utility(sql)
                .with_context(|| format!("reset statistics: {sql}"))?;
        }
        tracing::debug!("statistics counters reset");
        Ok(())
    }
}

/// Runs the fixed query battery on one session.
pub fn query_snapshot<S: DbSession>(session: &mut S) -> anyhow::Result<MetricsSnapshot> {
    let database = query_numbers(session, DATABASE_STATS_SQL)?;
    let database: [f64; 10] = database
        .try_into()
        .map_err(|row: Vec<f64>| anyhow::anyhow!("expected 10 database counters, got {}", row.len()))?;
    let disk_read = single_number(session, DISK_READ_SQL)?;
    let disk_write = single_number(session, DISK_WRITE_SQL)?;
    Ok(MetricsSnapshot::from_counters(database, disk_read, disk_write))
}

fn single_number<S: DbSession>(session: &mut S, sql: &str) -> anyhow::Result<f64> {
    let row = query_numbers(session, sql)?;
    row.first()
        .copied()
        .with_context(|| format!("empty result for: {sql}"))
}

/// First row of `sql`, every column parsed as a number.
fn query_numbers<S: DbSession>(session: &mut S, sql: &str) -> anyhow::Result<Vec<f64>> {
    let rows = session.query_text(sql)?;
    let row = rows
        .into_iter()
        .next()
        .with_context(|| format!("no rows for: {sql}"))?;
    row.into_iter()
        .enumerate()
        .map(|(idx, column)| {
            let text = column.with_context(|| format!("NULL in column {idx} of: {sql}"))?;
            text.trim()
                .parse::<f64>()
                .with_context(|| format!("non-numeric value {text:?} in column {idx}"))
        })
        .collect()
}

/// Where the baseline snapshot of a workload is stored.
pub fn baseline_path(dir: &Path, workload_id: &str) -> PathBuf {
    dir.join(format!("{workload_id}_internal_metrics.json"))
}

pub fn save_baseline(dir: &Path, workload_id: &str, snapshot: &MetricsSnapshot) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(dir).with_context(|| format!("create dir {}", dir.display()))?;
    let path = baseline_path(dir, workload_id);
    let data = serde_json::to_vec_pretty(&snapshot.to_map()).context("serialize baseline metrics")?;
    std::fs::write(&path, data).with_context(|| format!("write {}", path.display()))?;
    Ok(path)
}

/// Loads a stored baseline; `Ok(None)` when none was saved yet.
pub fn load_baseline(dir: &Path, workload_id: &str) -> anyhow::Result<Option<MetricsSnapshot>> {
    let path = baseline_path(dir, workload_id);
    let raw = match std::fs::read(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    let map: BTreeMap<String, f64> =
        serde_json::from_slice(&raw).with_context(|| format!("parse {}", path.display()))?;
    MetricsSnapshot::from_map(&map).map(Some)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::connection::RetryPolicy;
    use crate::server::ServerControl;

    /// Session serving fixed statistics rows; `broken` fails the disk-write query.
    #[derive(Clone, Copy)]
    struct StatsServer {
        broken: bool,
    }

    struct StatsSession(StatsServer);

    impl DbSession for StatsSession {
        fn execute(&mut self, _sql: &str) -> anyhow::Result<()> {
            Ok(())
        }
        fn commit(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
        fn execute_utility(&mut self, _sql: &str) -> anyhow::Result<()> {
            Ok(())
        }
        fn query_text(&mut self, sql: &str) -> anyhow::Result<Vec<Vec<Option<String>>>> {
            let row: Vec<&str> = if sql.contains("pg_stat_database") {
                vec!["10", "1", "4", "96", "500", "250", "7", "0", "3", "2"]
            } else if sql.contains("pg_statio_user_tables") {
                vec!["4"]
            } else if self.0.broken {
                anyhow::bail!("relation \"pg_stat_bgwriter\" does not exist");
            } else {
                vec!["2"]
            };
            Ok(vec![row.into_iter().map(|v| Some(v.to_string())).collect()])
        }
    }

    impl Connector for StatsServer {
        type Session = StatsSession;
        fn connect(&self) -> anyhow::Result<StatsSession> {
            Ok(StatsSession(*self))
        }
    }

    struct NoopServer;

    impl ServerControl for NoopServer {
        fn stop(&self) -> anyhow::Result<()> {
            Ok(())
        }
        fn start(&self) -> anyhow::Result<()> {
            Ok(())
        }
        fn remove_override_file(&self) -> anyhow::Result<bool> {
            Ok(false)
        }
    }

    fn collector(broken: bool) -> MetricsCollector<StatsServer> {
        MetricsCollector::new(ConnectionManager::new(
            StatsServer { broken },
            Arc::new(NoopServer),
            RetryPolicy {
                max_attempts: 1,
                backoff: Duration::ZERO,
                recovery_wait: Duration::ZERO,
            },
        ))
    }

    #[test]
    fn snapshot_follows_fixed_schema() {
        let snapshot = collector(false).collect();
        assert_eq!(snapshot.get("xact_commit"), Some(10.0));
        assert_eq!(snapshot.get("tup_deleted"), Some(2.0));
        assert_eq!(snapshot.get("disk_read_count"), Some(4.0));
        assert_eq!(snapshot.get("disk_write_count"), Some(2.0));
        assert_eq!(snapshot.get("disk_read_bytes"), Some(4.0 * 8192.0));
        assert_eq!(snapshot.get("disk_write_bytes"), Some(2.0 * 8192.0));
        assert_eq!(snapshot.values().len(), METRIC_COUNT);
    }

    #[test]
    fn any_query_failure_yields_zero_snapshot() {
        let snapshot = collector(true).collect();
        assert!(snapshot.is_zeroed());
        assert_eq!(snapshot.values().len(), METRIC_COUNT);
    }

    #[test]
    fn reset_then_collect_is_stable() {
        let collector = collector(false);
        collector.reset().unwrap();
        let first = collector.collect();
        collector.reset().unwrap();
        let second = collector.collect();
        assert_eq!(first, second);
    }

    #[test]
    fn baseline_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_baseline(dir.path(), "tpch_1").unwrap().is_none());

        let snapshot = collector(false).collect();
        let path = save_baseline(dir.path(), "tpch_1", &snapshot).unwrap();
        assert!(path.ends_with("tpch_1_internal_metrics.json"));
        assert_eq!(load_baseline(dir.path(), "tpch_1").unwrap(), Some(snapshot));
    }

    #[test]
    fn map_with_missing_metric_is_rejected() {
        let mut map = MetricsSnapshot::zeroed().to_map();
        map.remove("conflicts");
        assert!(MetricsSnapshot::from_map(&map).is_err());
    }
}
