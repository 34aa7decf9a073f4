//! Configuration-knob tuning harness for PostgreSQL.
//!
//! The harness evaluates candidate knob configurations for an external
//! optimizer: it applies a configuration with `ALTER SYSTEM`, restarts the
//! server, replays a SQL workload on several threads, and reports a cost
//! derived from throughput. Each evaluation is appended to a JSONL log that a
//! surrogate model can later be trained on; a loaded surrogate answers
//! evaluations without touching the server.
//!
//! Everything talks to the server through the [`Connector`]/[`DbSession`] and
//! [`ServerControl`] traits, so the whole loop runs against in-memory fakes
//! in tests.

pub mod applier;
pub mod config;
pub mod connection;
pub mod error;
pub mod evaluator;
pub mod knobs;
pub mod metrics;
pub mod plans;
pub mod record;
pub mod server;
pub mod surrogate;
pub mod workload;

pub use applier::{ApplyOutcome, ConfigApplier};
pub use config::TunerConfig;
pub use connection::{
    ConnectionManager, Connector, DbSession, PgConnectParams, PgConnector, PgSession, RetryPolicy,
};
pub use error::TuneError;
pub use evaluator::{cost_from_throughput, EvaluatorOptions, ObjectiveEvaluator, PENALTY_COST};
pub use knobs::{Configuration, KnobCatalog, KnobKind, KnobSpec, KnobValue};
pub use metrics::{MetricsCollector, MetricsSnapshot, METRIC_COUNT, METRIC_NAMES};
pub use record::{EvaluationLog, EvaluationRecord};
pub use server::{PgCtlServer, ServerControl};
pub use surrogate::{SurrogateArtifact, SurrogatePredictor};
pub use workload::{RunResult, ShardPlan, Workload, WorkloadRunner};
