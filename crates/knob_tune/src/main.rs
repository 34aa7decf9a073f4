//! `knob-tune` command line entry point.
//!
//! Server connection settings come from `KNOB_TUNE_*` environment variables;
//! flags select the knob catalog, the workload and the mode. Logs go to
//! stderr so that `evaluate` can keep stdout for costs.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use knob_tune::{
    plans, EvaluationLog, KnobCatalog, ObjectiveEvaluator, PgConnector,
    SurrogatePredictor, TunerConfig, Workload,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "knob-tune", about = "Evaluate PostgreSQL knob configurations against a workload")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the workload on the default configuration and store its metrics.
    Baseline(TargetArgs),
    /// Read configurations as JSON lines on stdin and print one cost per line.
    Evaluate(EvaluateArgs),
    /// Store `EXPLAIN (FORMAT JSON)` output for every workload statement.
    Plans(PlansArgs),
    /// Print the server's current values for the catalog knobs.
    Current(CurrentArgs),
}

#[derive(Args, Debug, Clone)]
struct TargetArgs {
    /// Knob catalog JSON (`{name: {type, min, max, default}}`).
    #[arg(long)]
    knobs: PathBuf,

    /// Workload file with `;`/newline separated statements.
    #[arg(long)]
    workload: PathBuf,

    /// Directory for `<workload>_internal_metrics.json` baselines.
    #[arg(long, default_value = "internal_metrics")]
    metrics_dir: PathBuf,
}

#[derive(Args, Debug)]
struct EvaluateArgs {
    #[command(flatten)]
    target: TargetArgs,

    /// Evaluation log the records are appended to.
    #[arg(long, default_value = "training_records.jsonl")]
    log: PathBuf,

    /// Surrogate artifact; when set, costs are predicted instead of measured.
    #[arg(long)]
    surrogate: Option<PathBuf>,

    /// Reuse a stored baseline instead of running it first.
    #[arg(long, default_value_t = false)]
    reuse_baseline: bool,
}

#[derive(Args, Debug)]
struct PlansArgs {
    /// Workload file with `;`/newline separated statements.
    #[arg(long)]
    workload: PathBuf,

    /// Output directory; plans land in `<out>/<workload>.json`.
    #[arg(long, default_value = "query_plans")]
    out: PathBuf,
}

#[derive(Args, Debug)]
struct CurrentArgs {
    #[arg(long)]
    knobs: PathBuf,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("knob_tune=info,warn")),
        )
        .init();

    let cli = Cli::parse();
    let config = TunerConfig::from_env()?;
    match cli.cmd {
        Command::Baseline(args) => run_baseline(&config, args),
        Command::Evaluate(args) => run_evaluate(&config, args),
        Command::Plans(args) => run_plans(&config, args),
        Command::Current(args) => run_current(&config, args),
    }
}

fn build_evaluator(
    config: &TunerConfig,
    target: &TargetArgs,
    log: EvaluationLog,
) -> anyhow::Result<ObjectiveEvaluator<PgConnector>> {
    let catalog = KnobCatalog::load(&target.knobs)?;
    let workload = Workload::load(&target.workload)?;
    tracing::info!(
        knobs = catalog.len(),
        workload = %workload.id,
        statements = workload.statements.len(),
        threads = config.threads,
        "evaluator ready"
    );
    Ok(ObjectiveEvaluator::new(
        config.connection_manager(),
        catalog,
        workload,
        log,
        config.evaluator_options(&target.metrics_dir),
    ))
}

fn run_baseline(config: &TunerConfig, args: TargetArgs) -> anyhow::Result<()> {
    // The baseline never appends records; the log path is unused.
    let mut evaluator = build_evaluator(config, &args, EvaluationLog::new("training_records.jsonl"))?;
    let snapshot = evaluator.run_baseline()?;
    serde_json::to_writer_pretty(std::io::stdout().lock(), &snapshot.to_map())?;
    println!();
    Ok(())
}

fn run_evaluate(config: &TunerConfig, args: EvaluateArgs) -> anyhow::Result<()> {
    let mut evaluator = build_evaluator(config, &args.target, EvaluationLog::new(&args.log))?;
    let use_surrogate = match &args.surrogate {
        Some(path) => {
            evaluator = evaluator.with_surrogate(SurrogatePredictor::load(path)?);
            true
        }
        None => false,
    };
    if args.reuse_baseline && !evaluator.load_baseline()? {
        tracing::warn!("no stored baseline; it will be measured before the first evaluation");
    }

    let answered = evaluator.serve_jsonl(std::io::stdin().lock(), std::io::stdout().lock(), use_surrogate)?;
    tracing::info!(answered, "input exhausted");
    Ok(())
}

fn run_plans(config: &TunerConfig, args: PlansArgs) -> anyhow::Result<()> {
    let workload = Workload::load(&args.workload)?;
    let mut session = config.connection_manager().connect()?;
    let extracted = plans::extract_query_plans(&mut session, &workload.statements);
    let path = plans::save_query_plans(&args.out, &workload.id, &extracted)?;
    tracing::info!(path = %path.display(), plans = extracted.len(), "query plans saved");
    Ok(())
}

fn run_current(config: &TunerConfig, args: CurrentArgs) -> anyhow::Result<()> {
    let catalog = KnobCatalog::load(&args.knobs)?;
    let mut session = config.connection_manager().connect()?;
    let current = plans::fetch_current_knobs(&mut session, &catalog)?;
    serde_json::to_writer_pretty(std::io::stdout().lock(), &current)?;
    println!();
    Ok(())
}
