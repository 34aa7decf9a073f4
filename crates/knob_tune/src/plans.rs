//! Read-only inspection of the server: current knob values and query plans.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::connection::DbSession;
use crate::knobs::{Configuration, KnobCatalog, KnobKind, KnobValue};

/// Plan of one workload statement, as returned by `EXPLAIN (FORMAT JSON)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryPlan {
    pub statement: String,
    pub plan: serde_json::Value,
}

/// Reads the live value of every catalog knob from `pg_settings`.
///
/// Knobs the server does not know, or whose setting is not numeric, are left
/// out of the result.
pub fn fetch_current_knobs<S: DbSession>(
    session: &mut S,
    catalog: &KnobCatalog,
) -> anyhow::Result<Configuration> {
    if catalog.is_empty() {
        return Ok(Configuration::new());
    }
    // Names were validated as identifiers when the catalog was built.
    let names = catalog
        .iter()
        .map(|spec| format!("'{}'", spec.name))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!("SELECT name, setting FROM pg_settings WHERE name IN ({names})");
    let rows = session.query_text(&sql).context("read pg_settings")?;

    let mut current = Configuration::new();
    for row in rows {
        let (Some(Some(name)), Some(Some(setting))) = (row.first(), row.get(1)) else {
            continue;
        };
        let Some(spec) = catalog.get(name) else {
            continue;
        };
        let Ok(raw) = setting.trim().parse::<f64>() else {
            tracing::debug!(knob = %name, %setting, "non-numeric setting skipped");
            continue;
        };
        let value = match spec.kind {
            KnobKind::Integer => KnobValue::Integer(raw as i64),
            KnobKind::Real => KnobValue::Real(raw),
        };
        current.insert(name.clone(), value);
    }
    Ok(current)
}

/// Explains every statement; statements the server refuses are skipped.
pub fn extract_query_plans<S: DbSession>(session: &mut S, statements: &[String]) -> Vec<QueryPlan> {
    let mut plans = Vec::with_capacity(statements.len());
    for (idx, statement) in statements.iter().enumerate() {
        match explain(session, statement) {
            Ok(plan) => plans.push(QueryPlan {
                statement: statement.clone(),
                plan,
            }),
            Err(err) => {
                tracing::warn!(statement = idx, error = %format!("{err:#}"), "explain failed; skipping");
            }
        }
    }
    tracing::info!(explained = plans.len(), total = statements.len(), "query plans extracted");
    plans
}

fn explain<S: DbSession>(session: &mut S, statement: &str) -> anyhow::Result<serde_json::Value> {
    let body = statement.trim().trim_end_matches(';');
    let rows = session.query_text(&format!("EXPLAIN (FORMAT JSON) {body}"))?;
    let text = rows
        .into_iter()
        .next()
        .and_then(|row| row.into_iter().next().flatten())
        .context("EXPLAIN returned no plan")?;
    serde_json::from_str(&text).context("parse EXPLAIN output")
}

pub fn plans_path(dir: &Path, workload_id: &str) -> PathBuf {
    dir.join(format!("{workload_id}.json"))
}

/// Writes `plans` to `<dir>/<workload_id>.json`.
pub fn save_query_plans(dir: &Path, workload_id: &str, plans: &[QueryPlan]) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(dir).with_context(|| format!("create dir {}", dir.display()))?;
    let path = plans_path(dir, workload_id);
    let data = serde_json::to_vec_pretty(plans).context("serialize query plans")?;
    std::fs::write(&path, data).with_context(|| format!("write {}", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knobs::KnobSpec;

    #[derive(Default)]
    struct ScriptedSession {
        queries: Vec<String>,
    }

    impl DbSession for ScriptedSession {
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
            self.queries.push(sql.to_string());
            if sql.contains("pg_settings") {
                return Ok(vec![
                    vec![Some("shared_buffers".into()), Some("16384".into())],
                    vec![Some("random_page_cost".into()), Some("1.1".into())],
                    vec![Some("jit".into()), Some("on".into())],
                ]);
            }
            if sql.contains("missing_table") {
                anyhow::bail!("relation \"missing_table\" does not exist");
            }
            Ok(vec![vec![Some(r#"[{"Plan": {"Node Type": "Seq Scan"}}]"#.into())]])
        }
    }

    #[test]
    fn current_knobs_are_typed_by_catalog() {
        let catalog = KnobCatalog::from_specs([
            KnobSpec::new("shared_buffers", KnobKind::Integer, 16.0, 1_000_000.0, 16384.0).unwrap(),
            KnobSpec::new("random_page_cost", KnobKind::Real, 0.0, 10.0, 4.0).unwrap(),
            KnobSpec::new("jit", KnobKind::Integer, 0.0, 1.0, 1.0).unwrap(),
        ]);
        let mut session = ScriptedSession::default();

        let current = fetch_current_knobs(&mut session, &catalog).unwrap();

        assert_eq!(current.get("shared_buffers"), Some(KnobValue::Integer(16384)));
        assert_eq!(current.get("random_page_cost"), Some(KnobValue::Real(1.1)));
        assert_eq!(current.get("jit"), None);
        assert!(session.queries[0].contains("'random_page_cost'"));
    }

    #[test]
    fn failing_statements_are_skipped() {
        let statements = vec![
            "SELECT * FROM orders;".to_string(),
            "SELECT * FROM missing_table;".to_string(),
        ];
        let mut session = ScriptedSession::default();

        let plans = extract_query_plans(&mut session, &statements);

        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].statement, "SELECT * FROM orders;");
        assert_eq!(plans[0].plan[0]["Plan"]["Node Type"], "Seq Scan");
        assert_eq!(session.queries[0], "EXPLAIN (FORMAT JSON) SELECT * FROM orders");
    }

    #[test]
    fn plans_are_written_per_workload() {
        let dir = tempfile::tempdir().unwrap();
        let plans = vec![QueryPlan {
            statement: "SELECT 1;".to_string(),
            plan: serde_json::json!([{"Plan": {}}]),
        }];
        let path = save_query_plans(&dir.path().join("plans"), "tpch_1", &plans).unwrap();
        assert!(path.ends_with("plans/tpch_1.json"));
        let back: Vec<QueryPlan> = serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
        assert_eq!(back, plans);
    }
}
