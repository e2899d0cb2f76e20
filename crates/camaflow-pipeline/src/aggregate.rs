//! Aggregation of routing-model outputs into raw and final result archives.
//!
//! Completeness is gated against the run manifest: a scenario/measure is
//! only aggregated once *every* registered model-variant has its full
//! output set, and finalization requires every raw result. Both operations
//! are idempotent and overwrite their targets atomically.

use std::fs;
use std::path::{Path, PathBuf};

use camaflow_core::{
    ArtifactId, Catalog, MeasureSpec, ModelVariant, PipelineError, Result, RunManifest,
};
use tracing::info;

use crate::executor::StageContext;
use crate::stage_inputs::write_atomic;

/// Seam for the external bias-adjustment/statistic algorithms.
///
/// `fold` stacks one model-variant's per-year output grids into its raw
/// result brick; `adjust` applies a named statistic across the brick's
/// years to produce the final grid.
pub trait AdjustmentBackend: Send + Sync {
    fn fold(&self, inputs: &[PathBuf], dest: &Path) -> Result<()>;
    fn adjust(&self, input: &Path, dest: &Path, statistic: &str) -> Result<()>;
}

/// Backend over the engine's day-major flat little-endian f32 format.
#[derive(Debug, Clone, Copy)]
pub struct FlatGridBackend {
    pub grid_cells: usize,
}

impl FlatGridBackend {
    fn read_grids(&self, path: &Path) -> Result<Vec<Vec<f32>>> {
        let bytes = fs::read(path)?;
        if bytes.len() % (self.grid_cells * 4) != 0 {
            return Err(PipelineError::Conflict(format!(
                "{} is not a whole number of {}-cell grids ({} bytes)",
                path.display(),
                self.grid_cells,
                bytes.len()
            )));
        }
        let mut grids = Vec::new();
        for grid_bytes in bytes.chunks_exact(self.grid_cells * 4) {
            grids.push(
                grid_bytes
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            );
        }
        Ok(grids)
    }
}

impl AdjustmentBackend for FlatGridBackend {
    /// Concatenate the input grids, chronologically, into one brick.
    fn fold(&self, inputs: &[PathBuf], dest: &Path) -> Result<()> {
        let mut out = Vec::new();
        for input in inputs {
            for grid in self.read_grids(input)? {
                for v in grid {
                    out.extend_from_slice(&v.to_le_bytes());
                }
            }
        }
        let dir = dest
            .parent()
            .ok_or_else(|| PipelineError::Configuration("result path has no parent".into()))?;
        fs::create_dir_all(dir)?;
        write_atomic(dir, dest, &out)
    }

    /// Per-cell statistic across the brick's grids.
    fn adjust(&self, input: &Path, dest: &Path, statistic: &str) -> Result<()> {
        let grids = self.read_grids(input)?;
        if grids.is_empty() {
            return Err(PipelineError::Conflict(format!(
                "{} holds no grids to adjust",
                input.display()
            )));
        }
        let n = grids.len() as f32;
        let mut out = Vec::with_capacity(self.grid_cells * 4);
        for cell in 0..self.grid_cells {
            let series = grids.iter().map(|g| g[cell]);
            let value = match statistic {
                "mean" => series.sum::<f32>() / n,
                "max" => series.fold(f32::MIN, f32::max),
                "min" => series.fold(f32::MAX, f32::min),
                other => {
                    return Err(PipelineError::Configuration(format!(
                        "unknown statistic: {other}"
                    )))
                }
            };
            out.extend_from_slice(&value.to_le_bytes());
        }
        let dir = dest
            .parent()
            .ok_or_else(|| PipelineError::Configuration("result path has no parent".into()))?;
        fs::create_dir_all(dir)?;
        write_atomic(dir, dest, &out)
    }
}

/// Folds completed per-model-variant outputs into result archives.
pub struct Aggregator<B: AdjustmentBackend> {
    ctx: StageContext,
    backend: B,
}

impl<B: AdjustmentBackend> Aggregator<B> {
    pub fn new(ctx: StageContext, backend: B) -> Self {
        Self { ctx, backend }
    }

    fn manifest(&self) -> &RunManifest {
        &self.ctx.manifest
    }

    /// Model-variants missing any expected output of `measure` for `scenario`.
    fn missing_outputs(
        &self,
        scenario: &str,
        measure: &str,
        catalog: &Catalog,
    ) -> Result<Vec<ModelVariant>> {
        let mut missing = Vec::new();
        for mv in self.manifest().model_variants(scenario) {
            for batch in self.manifest().batches_for(scenario, mv)? {
                if !catalog.exists_all(&batch.expected_outputs(measure)?) {
                    missing.push(mv.clone());
                    break;
                }
            }
        }
        Ok(missing)
    }

    /// Fold every registered model-variant's outputs for (scenario, measure)
    /// into raw results.
    ///
    /// Fails with `IncompleteInput` (and writes nothing) unless *all*
    /// registered model-variants have their complete output sets.
    pub fn aggregate(
        &self,
        scenario: &str,
        measure: &str,
        catalog: &Catalog,
    ) -> Result<Vec<ArtifactId>> {
        let missing = self.missing_outputs(scenario, measure, catalog)?;
        if !missing.is_empty() {
            return Err(PipelineError::IncompleteInput {
                scenario: scenario.to_string(),
                measure: measure.to_string(),
                missing: missing.iter().map(|mv| mv.stem()).collect(),
            });
        }

        let mut produced = Vec::new();
        for mv in self.manifest().model_variants(scenario) {
            // Chronological: batches are ordered, and each batch's years
            // ascend within it.
            let mut inputs = Vec::new();
            for batch in self.manifest().batches_for(scenario, mv)? {
                for id in batch.expected_outputs(measure)? {
                    inputs.push(self.ctx.abs(&id));
                }
            }
            let raw = ArtifactId::raw_result(scenario, measure, &mv.model, &mv.variant)?;
            self.backend.fold(&inputs, &self.ctx.abs(&raw))?;
            info!(scenario, measure, model_variant = %mv, "aggregated raw result");
            produced.push(raw);
        }
        Ok(produced)
    }

    /// Apply the measure's statistic to every raw result of `scenario`.
    ///
    /// Fails with `IncompleteInput` (and writes nothing) unless every
    /// registered model-variant's raw result exists.
    pub fn finalize(
        &self,
        scenario: &str,
        spec: &MeasureSpec,
        catalog: &Catalog,
    ) -> Result<Vec<ArtifactId>> {
        let mut missing = Vec::new();
        for mv in self.manifest().model_variants(scenario) {
            let raw = ArtifactId::raw_result(scenario, &spec.measure, &mv.model, &mv.variant)?;
            if !catalog.contains(&raw) {
                missing.push(mv.stem());
            }
        }
        if !missing.is_empty() {
            return Err(PipelineError::IncompleteInput {
                scenario: scenario.to_string(),
                measure: spec.measure.clone(),
                missing,
            });
        }

        let final_measure = spec.final_measure();
        let mut produced = Vec::new();
        for mv in self.manifest().model_variants(scenario) {
            let raw = ArtifactId::raw_result(scenario, &spec.measure, &mv.model, &mv.variant)?;
            let fin = ArtifactId::final_result(scenario, &final_measure, &mv.model, &mv.variant)?;
            self.backend
                .adjust(&self.ctx.abs(&raw), &self.ctx.abs(&fin), &spec.statistic)?;
            info!(scenario, final_measure = %final_measure, model_variant = %mv, "finalized result");
            produced.push(fin);
        }
        Ok(produced)
    }
}
