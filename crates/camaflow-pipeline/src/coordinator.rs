//! The run coordinator: turns a manifest plus a catalog snapshot into
//! dispatched work.
//!
//! The coordinator owns no state beyond the snapshot it scans; every
//! decision is recomputed from (manifest, catalog). Batches whose outputs
//! already exist are skipped, failed batches are reported and never retried
//! within the same run, and aggregation only happens once every registered
//! model-variant has delivered.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use camaflow_core::{
    check_plan_conflict, encode, Batch, Catalog, DependencyGraph, PipelineError, Result,
    RunManifest, Stage, TupleKey,
};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::aggregate::{AdjustmentBackend, Aggregator};
use crate::executor::{ExecutionOutcome, RoutingModel, StageContext};

/// Lifecycle of one batch work unit within a run.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TupleState {
    /// Not dispatched; inputs may be missing or the run was cut short.
    Pending,

    /// Inputs present, work not yet done (status view only).
    Ready,

    /// Dispatched and awaiting completion.
    Running,

    /// Full expected output set exists on disk.
    Complete,

    /// Dispatched and failed; requires an explicit rerun.
    Failed { reason: String },
}

/// One batch tuple and where it stands.
#[derive(Debug, Clone, Serialize)]
pub struct TupleStatus {
    pub tuple: TupleKey,
    pub state: TupleState,
}

/// Outcome of one `run` invocation.
#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub dry_run: bool,
    pub batches: Vec<TupleStatus>,
    /// Raw results written this run, as relative paths.
    pub aggregated: Vec<String>,
    /// Final results written this run, as relative paths.
    pub finalized: Vec<String>,
}

impl RunSummary {
    pub fn failed(&self) -> usize {
        self.batches
            .iter()
            .filter(|b| matches!(b.state, TupleState::Failed { .. }))
            .count()
    }
}

/// Point-in-time view of the whole pipeline, derived from a scan alone.
#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub batches: Vec<TupleStatus>,
    /// Raw results present on disk, as relative paths.
    pub raw_results: Vec<String>,
    /// Final results present on disk, as relative paths.
    pub final_results: Vec<String>,
    /// Files under the root that match no artifact template.
    pub unrecognized: usize,
}

/// Drives batches through prepare/execute/verify and folds completed
/// outputs into results.
pub struct Coordinator<M: RoutingModel + 'static, B: AdjustmentBackend> {
    ctx: StageContext,
    model: Arc<M>,
    backend: B,
    graph: DependencyGraph,
}

impl<M: RoutingModel + 'static, B: AdjustmentBackend + Clone> Coordinator<M, B> {
    pub fn new(ctx: StageContext, model: M, backend: B) -> Self {
        Self {
            ctx,
            model: Arc::new(model),
            backend,
            graph: DependencyGraph::standard(),
        }
    }

    fn manifest(&self) -> &RunManifest {
        &self.ctx.manifest
    }

    /// Pin the manifest at the root, or reject the run if a previously
    /// pinned manifest disagrees on chunking.
    fn pin_manifest(&self, dry_run: bool) -> Result<()> {
        match RunManifest::load(&self.ctx.root)? {
            Some(pinned) => pinned.check_compatible(self.manifest()),
            None => {
                if !dry_run {
                    self.manifest().save(&self.ctx.root)?;
                }
                Ok(())
            }
        }
    }

    /// All planned batches, keyed by their work-unit tuple.
    fn planned_batches(&self) -> Result<BTreeMap<TupleKey, Batch>> {
        let mut batches = BTreeMap::new();
        for (scenario, mv) in self.manifest().tuples() {
            for batch in self.manifest().batches_for(&scenario, &mv)? {
                batches.insert(batch.tuple(), batch);
            }
        }
        Ok(batches)
    }

    fn reject_plan_conflicts(&self, catalog: &Catalog) -> Result<()> {
        for (scenario, mv) in self.manifest().tuples() {
            let batches = self.manifest().batches_for(&scenario, &mv)?;
            check_plan_conflict(&batches, catalog)?;
        }
        Ok(())
    }

    /// Tuples whose inputs for `stage` are all present in the snapshot.
    fn ready_set(&self, stage: Stage, catalog: &Catalog) -> Result<HashSet<TupleKey>> {
        Ok(self
            .graph
            .ready_tuples(stage, catalog, self.manifest())?
            .into_iter()
            .collect())
    }

    /// Execute the full pipeline pass.
    ///
    /// With `dry_run` the catalog is scanned and the per-batch states are
    /// reported, but nothing is dispatched or written (not even the
    /// manifest pin).
    pub async fn run(&self, dry_run: bool) -> Result<RunSummary> {
        self.pin_manifest(dry_run)?;
        let catalog = Catalog::scan(&self.ctx.root)?;
        self.reject_plan_conflicts(&catalog)?;

        let planned = self.planned_batches()?;
        let mut states: BTreeMap<TupleKey, TupleState> = BTreeMap::new();

        // Per-stage readiness from the snapshot: staged sources admit
        // PrepareInput, an already-staged input set admits RunModel
        // directly, and a complete output set skips the batch entirely.
        let stageable = self.ready_set(Stage::PrepareInput, &catalog)?;
        let runnable = self.ready_set(Stage::RunModel, &catalog)?;
        let completed = self.ready_set(Stage::CollectOutput, &catalog)?;

        let mut handles: Vec<(TupleKey, JoinHandle<Result<ExecutionOutcome>>)> = Vec::new();
        for (tuple, batch) in &planned {
            if completed.contains(tuple) {
                info!(tuple = %tuple, "batch already complete, skipping");
                states.insert(tuple.clone(), TupleState::Complete);
                continue;
            }
            if !stageable.contains(tuple) && !runnable.contains(tuple) {
                warn!(tuple = %tuple, "source data not staged, leaving pending");
                states.insert(tuple.clone(), TupleState::Pending);
                continue;
            }
            if dry_run {
                states.insert(tuple.clone(), TupleState::Ready);
                continue;
            }

            states.insert(tuple.clone(), TupleState::Running);
            let model = Arc::clone(&self.model);
            let ctx = self.ctx.clone();
            let batch = batch.clone();
            let skip_prepare = runnable.contains(tuple);
            handles.push((
                tuple.clone(),
                tokio::spawn(async move {
                    let workdir = if skip_prepare {
                        info!(tuple = %batch.tuple(), "inputs already staged, skipping prepare");
                        ctx.workdir(&batch)
                    } else {
                        model.prepare(&ctx, &batch).await?
                    };
                    // The model never starts against a partial input set.
                    for id in batch.expected_inputs()? {
                        if !ctx.abs(&id).is_file() {
                            return Err(PipelineError::Execution {
                                tuple: batch.tuple().to_string(),
                                reason: format!(
                                    "staged input missing: {}",
                                    encode(&id).display()
                                ),
                            });
                        }
                    }
                    model.execute(&ctx, &batch, &workdir).await
                }),
            ));
        }

        for (tuple, handle) in handles {
            match handle.await {
                Ok(Ok(outcome)) if outcome.passed() => {
                    // Stays Running; admission happens against the re-scan.
                    info!(tuple = %tuple, duration_ms = outcome.duration_ms, "model run passed");
                }
                Ok(Ok(outcome)) => {
                    warn!(tuple = %tuple, exit_code = outcome.exit_code, "model run failed");
                    states.insert(
                        tuple,
                        TupleState::Failed {
                            reason: format!(
                                "exit code {}: {}",
                                outcome.exit_code,
                                outcome.stderr.lines().last().unwrap_or("")
                            ),
                        },
                    );
                }
                Ok(Err(err)) => {
                    warn!(tuple = %tuple, error = %err, "model run errored");
                    states.insert(
                        tuple,
                        TupleState::Failed {
                            reason: err.to_string(),
                        },
                    );
                }
                Err(join_err) => {
                    // Cancelled or panicked task: the batch was never
                    // admitted, so it reverts to pending for the next run.
                    warn!(tuple = %tuple, error = %join_err, "batch task aborted, reverting to pending");
                    states.insert(tuple, TupleState::Pending);
                }
            }
        }

        // Admission: a zero exit code means nothing until the expected
        // output set shows up in a fresh snapshot.
        let catalog = Catalog::scan(&self.ctx.root)?;
        for (tuple, state) in states.iter_mut() {
            if *state != TupleState::Running {
                continue;
            }
            let batch = &planned[tuple];
            *state = if self.model.verify(&self.ctx, batch, &catalog)? {
                TupleState::Complete
            } else {
                warn!(tuple = %tuple, "run passed but output set is incomplete");
                TupleState::Failed {
                    reason: "model exited cleanly but the expected output set is incomplete"
                        .to_string(),
                }
            };
        }

        let mut aggregated = Vec::new();
        let mut finalized = Vec::new();
        if !dry_run {
            let (agg, fin) = self.fold_results(&catalog, false)?;
            aggregated = agg;
            finalized = fin;
        }

        Ok(RunSummary {
            dry_run,
            batches: states
                .into_iter()
                .map(|(tuple, state)| TupleStatus { tuple, state })
                .collect(),
            aggregated,
            finalized,
        })
    }

    /// Aggregate and finalize whatever is complete.
    ///
    /// With `strict`, a scenario/measure still missing outputs is an error;
    /// otherwise it is logged and skipped (normal mid-run state).
    fn fold_results(&self, catalog: &Catalog, strict: bool) -> Result<(Vec<String>, Vec<String>)> {
        let aggregator = Aggregator::new(self.ctx.clone(), self.backend.clone());

        // In a lenient fold, scenarios whose model-variants have not all
        // delivered are skipped; strict mode calls through so the error
        // names exactly what is missing.
        let agg_ready = self.ready_set(Stage::Aggregate, catalog)?;
        let mut aggregated = Vec::new();
        for (scenario, mvs) in &self.manifest().scenarios {
            let ready = mvs.iter().all(|mv| {
                agg_ready.contains(&TupleKey::new(&mv.model, scenario.as_str(), &mv.variant, None))
            });
            if !ready && !strict {
                info!(scenario = %scenario, "aggregation not yet ready, skipping");
                continue;
            }
            for spec in &self.manifest().measures {
                let ids = aggregator.aggregate(scenario, &spec.measure, catalog)?;
                aggregated.extend(ids.iter().map(rel));
            }
        }

        // Finalization reads raw results, so it needs a snapshot taken
        // after aggregation wrote them.
        let catalog = Catalog::scan(&self.ctx.root)?;
        let fin_ready = self.ready_set(Stage::Finalize, &catalog)?;
        let mut finalized = Vec::new();
        for (scenario, mvs) in &self.manifest().scenarios {
            let ready = mvs.iter().all(|mv| {
                fin_ready.contains(&TupleKey::new(&mv.model, scenario.as_str(), &mv.variant, None))
            });
            if !ready && !strict {
                info!(scenario = %scenario, "finalization not yet ready, skipping");
                continue;
            }
            for spec in &self.manifest().measures {
                let ids = aggregator.finalize(scenario, spec, &catalog)?;
                finalized.extend(ids.iter().map(rel));
            }
        }
        Ok((aggregated, finalized))
    }

    /// Run only the aggregation and finalization stages, strictly: any
    /// scenario/measure with missing inputs fails with `IncompleteInput`.
    pub fn finalize(&self) -> Result<(Vec<String>, Vec<String>)> {
        let catalog = Catalog::scan(&self.ctx.root)?;
        self.fold_results(&catalog, true)
    }

    /// Report pipeline state from a scan, dispatching nothing.
    pub fn status(&self) -> Result<StatusReport> {
        let catalog = Catalog::scan(&self.ctx.root)?;
        let stageable = self.ready_set(Stage::PrepareInput, &catalog)?;
        let runnable = self.ready_set(Stage::RunModel, &catalog)?;
        let completed = self.ready_set(Stage::CollectOutput, &catalog)?;

        let mut batches = Vec::new();
        for (tuple, _) in self.planned_batches()? {
            let state = if completed.contains(&tuple) {
                TupleState::Complete
            } else if stageable.contains(&tuple) || runnable.contains(&tuple) {
                TupleState::Ready
            } else {
                TupleState::Pending
            };
            batches.push(TupleStatus { tuple, state });
        }

        let mut raw_results = Vec::new();
        let mut final_results = Vec::new();
        for (scenario, mv) in self.manifest().tuples() {
            for id in self.manifest().expected_raw(&scenario, &mv)? {
                if catalog.contains(&id) {
                    raw_results.push(rel(&id));
                }
            }
            for id in self.manifest().expected_final(&scenario, &mv)? {
                if catalog.contains(&id) {
                    final_results.push(rel(&id));
                }
            }
        }

        Ok(StatusReport {
            batches,
            raw_results,
            final_results,
            unrecognized: catalog.unrecognized().len(),
        })
    }
}

fn rel(id: &camaflow_core::ArtifactId) -> String {
    encode(id).to_string_lossy().into_owned()
}
