//! camaflow - climate-flood pipeline driver
//!
//! The `camaflow` command runs the CaMa-Flood processing pipeline over a
//! single root directory whose file layout doubles as the run ledger.
//!
//! ## Commands
//!
//! - `plan`: pin the run manifest (scenarios, model-variants, dates, measures)
//! - `run`: execute pending batches and fold completed outputs into results
//! - `status`: report pipeline state from a scan, executing nothing
//! - `finalize`: aggregate and finalize only, strictly

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Result;
use camaflow_core::{
    check_plan_conflict, Catalog, DateRange, MeasureSpec, ModelVariant, PipelineError,
    RunManifest,
};
use camaflow_pipeline::{
    CamaFloodModel, Coordinator, FlatGridBackend, GridSpec, RunSummary, StageContext,
    StatusReport, TupleState,
};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use tracing::Level;

#[derive(Parser)]
#[command(name = "camaflow")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Climate-flood modeling pipeline over CaMa-Flood", long_about = None)]
struct Cli {
    /// Pipeline root directory
    #[arg(long, global = true, env = "CAMAFLOW_ROOT", default_value = ".")]
    root: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON output (logs and reports)
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Pin the run manifest at the root, rejecting incompatible re-plans
    Plan(PlanArgs),

    /// Execute pending batches, then aggregate and finalize what is complete
    Run(RunArgs),

    /// Report per-batch and result state from a scan
    Status(GridArgs),

    /// Aggregate and finalize only; missing outputs are an error
    Finalize(FinalizeArgs),
}

#[derive(Args)]
struct FinalizeArgs {
    /// Override the manifest's statistic for every measure
    #[arg(long)]
    statistic: Option<String>,

    #[command(flatten)]
    grid: GridArgs,
}

#[derive(Args)]
struct PlanArgs {
    /// Climate-data source label under extracted_data/
    #[arg(long)]
    source: String,

    /// Climate model name (repeatable)
    #[arg(long = "model", required = true)]
    models: Vec<String>,

    /// Emission scenario (repeatable)
    #[arg(long = "scenario", required = true)]
    scenarios: Vec<String>,

    /// Ensemble variant (repeatable; registered for every model)
    #[arg(long = "variant", required = true)]
    variants: Vec<String>,

    /// First simulation date (YYYY-MM-DD)
    #[arg(long)]
    start: NaiveDate,

    /// Last simulation date, inclusive (YYYY-MM-DD)
    #[arg(long)]
    end: NaiveDate,

    /// Days per batch
    #[arg(long, default_value = "365")]
    batch_size_days: u32,

    /// Output measure to collect (repeatable)
    #[arg(long = "measure", default_value = "fldfrc")]
    measures: Vec<String>,

    /// Summary statistic applied at finalization
    #[arg(long, default_value = "mean")]
    statistic: String,
}

#[derive(Args)]
struct RunArgs {
    /// Plan and report only; dispatch nothing
    #[arg(long)]
    dry_run: bool,

    /// Timeout per model invocation in seconds (0 disables)
    #[arg(long, default_value = "86400")]
    timeout_secs: u64,

    #[command(flatten)]
    grid: GridArgs,
}

#[derive(Args)]
struct GridArgs {
    /// Grid cells along x of the staged daily records
    #[arg(long, default_value = "1440")]
    nx: usize,

    /// Grid cells along y of the staged daily records
    #[arg(long, default_value = "720")]
    ny: usize,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    camaflow_core::init_tracing(cli.json, level);

    let code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            exit_code_for(&err)
        }
    };
    std::process::exit(code);
}

async fn dispatch(cli: Cli) -> Result<i32> {
    match cli.command {
        Commands::Plan(args) => cmd_plan(&cli.root, &args, cli.json),
        Commands::Run(args) => cmd_run(&cli.root, &args, cli.json).await,
        Commands::Status(grid) => cmd_status(&cli.root, &grid, cli.json),
        Commands::Finalize(args) => cmd_finalize(&cli.root, &args),
    }
}

/// Map failures to the documented exit codes: 2 for configuration and
/// naming-contract problems, 1 for everything else.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<PipelineError>() {
        Some(
            PipelineError::Configuration(_)
            | PipelineError::PlanConflict { .. }
            | PipelineError::Decode(_)
            | PipelineError::Conflict(_),
        ) => 2,
        _ => 1,
    }
}

fn build_manifest(args: &PlanArgs) -> Result<RunManifest> {
    let mut mvs = Vec::new();
    for model in &args.models {
        for variant in &args.variants {
            mvs.push(ModelVariant::new(model, variant)?);
        }
    }
    let mut scenarios = BTreeMap::new();
    for scenario in &args.scenarios {
        scenarios.insert(scenario.clone(), mvs.clone());
    }
    let range = DateRange::new(args.start, args.end)?;
    let measures = args
        .measures
        .iter()
        .map(|m| MeasureSpec::new(m, &args.statistic))
        .collect::<camaflow_core::Result<Vec<_>>>()?;
    Ok(RunManifest::new(
        &args.source,
        scenarios,
        range,
        args.batch_size_days,
        measures,
    )?)
}

/// Pin the run manifest, rejecting chunking changes against both the
/// previously saved manifest and artifacts already on disk.
fn cmd_plan(root: &PathBuf, args: &PlanArgs, json: bool) -> Result<i32> {
    let requested = build_manifest(args)?;

    if let Some(pinned) = RunManifest::load(root)? {
        pinned.check_compatible(&requested)?;
    }
    let catalog = Catalog::scan(root)?;
    for (scenario, mv) in requested.tuples() {
        let batches = requested.batches_for(&scenario, &mv)?;
        check_plan_conflict(&batches, &catalog)?;
    }
    requested.save(root)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&requested)?);
        return Ok(0);
    }

    println!("Pinned manifest at {:?}", root.join(RunManifest::FILE_NAME));
    println!(
        "Range: {}..={} ({} days, {} per batch)",
        requested.range.start,
        requested.range.end,
        requested.range.num_days(),
        requested.batch_size_days
    );
    for (scenario, mv) in requested.tuples() {
        let batches = requested.batches_for(&scenario, &mv)?;
        println!("  {scenario}/{mv}: {} batches", batches.len());
    }
    Ok(0)
}

fn load_context(root: &PathBuf, grid: &GridArgs, timeout_secs: u64) -> Result<StageContext> {
    let manifest = RunManifest::load(root)?.ok_or_else(|| {
        PipelineError::Configuration(
            "no manifest.json at the root; run `camaflow plan` first".to_string(),
        )
    })?;
    Ok(StageContext {
        root: root.clone(),
        manifest,
        grid: GridSpec {
            nx: grid.nx,
            ny: grid.ny,
        },
        timeout_secs,
    })
}

async fn cmd_run(root: &PathBuf, args: &RunArgs, json: bool) -> Result<i32> {
    let ctx = load_context(root, &args.grid, args.timeout_secs)?;
    let cells = ctx.grid.cells();
    let coordinator = Coordinator::new(ctx, CamaFloodModel, FlatGridBackend { grid_cells: cells });

    let summary = coordinator.run(args.dry_run).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }
    Ok(if summary.failed() > 0 { 1 } else { 0 })
}

fn cmd_status(root: &PathBuf, grid: &GridArgs, json: bool) -> Result<i32> {
    let ctx = load_context(root, grid, 0)?;
    let cells = ctx.grid.cells();
    let coordinator = Coordinator::new(ctx, CamaFloodModel, FlatGridBackend { grid_cells: cells });

    let report = coordinator.status()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_status(&report);
    }
    Ok(0)
}

fn cmd_finalize(root: &PathBuf, args: &FinalizeArgs) -> Result<i32> {
    let mut ctx = load_context(root, &args.grid, 0)?;
    if let Some(statistic) = &args.statistic {
        ctx.manifest.measures = ctx
            .manifest
            .measures
            .iter()
            .map(|spec| MeasureSpec::new(&spec.measure, statistic))
            .collect::<camaflow_core::Result<Vec<_>>>()?;
    }
    let cells = ctx.grid.cells();
    let coordinator = Coordinator::new(ctx, CamaFloodModel, FlatGridBackend { grid_cells: cells });

    let (aggregated, finalized) = coordinator.finalize()?;
    for path in &aggregated {
        println!("aggregated {path}");
    }
    for path in &finalized {
        println!("finalized  {path}");
    }
    println!(
        "Wrote {} raw and {} final results",
        aggregated.len(),
        finalized.len()
    );
    Ok(0)
}

fn state_label(state: &TupleState) -> String {
    match state {
        TupleState::Pending => "pending".to_string(),
        TupleState::Ready => "ready".to_string(),
        TupleState::Running => "running".to_string(),
        TupleState::Complete => "complete".to_string(),
        TupleState::Failed { reason } => format!("FAILED ({reason})"),
    }
}

fn print_summary(summary: &RunSummary) {
    if summary.dry_run {
        println!("Dry run; nothing was dispatched.");
    }
    for batch in &summary.batches {
        println!("  {}  {}", batch.tuple, state_label(&batch.state));
    }
    for path in &summary.aggregated {
        println!("aggregated {path}");
    }
    for path in &summary.finalized {
        println!("finalized  {path}");
    }
    let complete = summary
        .batches
        .iter()
        .filter(|b| b.state == TupleState::Complete)
        .count();
    println!(
        "Summary: {}/{} batches complete, {} failed",
        complete,
        summary.batches.len(),
        summary.failed()
    );
}

fn print_status(report: &StatusReport) {
    for batch in &report.batches {
        println!("  {}  {}", batch.tuple, state_label(&batch.state));
    }
    println!("Raw results:   {}", report.raw_results.len());
    for path in &report.raw_results {
        println!("  {path}");
    }
    println!("Final results: {}", report.final_results.len());
    for path in &report.final_results {
        println!("  {path}");
    }
    if report.unrecognized > 0 {
        println!("Unrecognized files under root: {}", report.unrecognized);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan_args() -> PlanArgs {
        PlanArgs {
            source: "esgf".to_string(),
            models: vec!["ACCESS-CM2".to_string(), "MIROC6".to_string()],
            scenarios: vec!["ssp245".to_string()],
            variants: vec!["r1i1p1f1".to_string()],
            start: NaiveDate::from_ymd_opt(2015, 1, 1).unwrap(),
            end: NaiveDate::from_ymd_opt(2015, 12, 31).unwrap(),
            batch_size_days: 100,
            measures: vec!["fldfrc".to_string()],
            statistic: "mean".to_string(),
        }
    }

    #[test]
    fn test_build_manifest_registers_cross_product() {
        let manifest = build_manifest(&plan_args()).unwrap();
        assert_eq!(manifest.model_variants("ssp245").len(), 2);
        assert_eq!(manifest.tuples().len(), 2);
    }

    #[test]
    fn test_plan_pins_and_rejects_rechunk() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();

        assert_eq!(cmd_plan(&root, &plan_args(), false).unwrap(), 0);
        assert!(root.join(RunManifest::FILE_NAME).exists());

        // Identical re-plan is fine.
        assert_eq!(cmd_plan(&root, &plan_args(), false).unwrap(), 0);

        // Changing the chunking is a plan conflict, exit code 2.
        let mut rechunked = plan_args();
        rechunked.batch_size_days = 50;
        let err = cmd_plan(&root, &rechunked, false).unwrap_err();
        assert_eq!(exit_code_for(&err), 2);
    }

    #[test]
    fn test_underscore_in_model_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut args = plan_args();
        args.models = vec!["ACCESS_CM2".to_string()];
        let err = cmd_plan(&dir.path().to_path_buf(), &args, false).unwrap_err();
        assert_eq!(exit_code_for(&err), 2);
    }

    #[test]
    fn test_run_without_manifest_fails() {
        let dir = tempfile::tempdir().unwrap();
        let grid = GridArgs { nx: 2, ny: 2 };
        let err = load_context(&dir.path().to_path_buf(), &grid, 0).unwrap_err();
        assert!(err.to_string().contains("camaflow plan"));
        assert_eq!(exit_code_for(&err), 2);
    }

    #[test]
    fn test_cli_parses_run_flags() {
        let cli = Cli::parse_from([
            "camaflow",
            "--root",
            "/data/pipeline",
            "run",
            "--dry-run",
            "--timeout-secs",
            "600",
            "--nx",
            "360",
            "--ny",
            "180",
        ]);
        assert_eq!(cli.root, PathBuf::from("/data/pipeline"));
        match cli.command {
            Commands::Run(args) => {
                assert!(args.dry_run);
                assert_eq!(args.timeout_secs, 600);
                assert_eq!(args.grid.nx, 360);
                assert_eq!(args.grid.ny, 180);
            }
            _ => panic!("expected run subcommand"),
        }
    }
}
