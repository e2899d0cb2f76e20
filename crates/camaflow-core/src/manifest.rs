//! The run manifest: which scenarios, model-variants, dates, and measures
//! the current run covers.
//!
//! Persisted as `manifest.json` at the pipeline root so a rerun resolves
//! the same work units. Aggregation completeness ("all registered
//! model-variants") is defined against this manifest, never against
//! whatever happens to be on disk.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::ident::{validate_segment, validate_token, ArtifactId, ModelVariant};
use crate::plan::{plan_batches, Batch, DateRange};

/// One result measure plus the statistic applied at finalization.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MeasureSpec {
    /// Routing-model output measure, e.g. `fldfrc` (flood fraction).
    pub measure: String,

    /// Summary statistic applied by finalization, e.g. `mean`.
    pub statistic: String,
}

impl MeasureSpec {
    pub fn new(measure: impl Into<String>, statistic: impl Into<String>) -> Result<Self> {
        let measure = measure.into();
        let statistic = statistic.into();
        validate_segment("measure", &measure)?;
        validate_segment("statistic", &statistic)?;
        Ok(Self { measure, statistic })
    }

    /// Name of the finalized measure: `{measure}_{statistic}`.
    pub fn final_measure(&self) -> String {
        format!("{}_{}", self.measure, self.statistic)
    }
}

/// Declares the scope of a pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunManifest {
    /// Climate-data source label under `extracted_data/`.
    pub source: String,

    /// Model-variants registered per scenario.
    pub scenarios: BTreeMap<String, Vec<ModelVariant>>,

    /// Simulation date range, inclusive.
    pub range: DateRange,

    /// Batch size in days; pinned so a rerun cannot silently re-chunk.
    pub batch_size_days: u32,

    /// Measures to collect and finalize.
    pub measures: Vec<MeasureSpec>,
}

impl RunManifest {
    pub const FILE_NAME: &'static str = "manifest.json";

    pub fn new(
        source: impl Into<String>,
        scenarios: BTreeMap<String, Vec<ModelVariant>>,
        range: DateRange,
        batch_size_days: u32,
        measures: Vec<MeasureSpec>,
    ) -> Result<Self> {
        let source = source.into();
        validate_segment("source", &source)?;
        if batch_size_days == 0 {
            return Err(PipelineError::Configuration(
                "batch_size_days must be at least 1".to_string(),
            ));
        }
        if scenarios.is_empty() {
            return Err(PipelineError::Configuration(
                "manifest registers no scenarios".to_string(),
            ));
        }
        if measures.is_empty() {
            return Err(PipelineError::Configuration(
                "manifest registers no measures".to_string(),
            ));
        }
        for (scenario, mvs) in &scenarios {
            validate_token("scenario", scenario)?;
            if mvs.is_empty() {
                return Err(PipelineError::Configuration(format!(
                    "scenario {scenario} registers no model-variants"
                )));
            }
        }
        Ok(Self {
            source,
            scenarios,
            range,
            batch_size_days,
            measures,
        })
    }

    /// Load the manifest from `root`, if one was saved there.
    pub fn load(root: &Path) -> Result<Option<Self>> {
        let path = root.join(Self::FILE_NAME);
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read_to_string(&path)?;
        let manifest: RunManifest = serde_json::from_str(&data)?;
        Ok(Some(manifest))
    }

    /// Persist to `root/manifest.json` atomically (temp file + rename).
    pub fn save(&self, root: &Path) -> Result<()> {
        fs::create_dir_all(root)?;
        let data = serde_json::to_string_pretty(self)?;
        let mut tmp = tempfile::NamedTempFile::new_in(root)?;
        tmp.write_all(data.as_bytes())?;
        tmp.persist(root.join(Self::FILE_NAME))
            .map_err(|e| PipelineError::Io(e.error))?;
        Ok(())
    }

    /// Reject a re-plan whose chunking disagrees with what this manifest
    /// already pinned.
    pub fn check_compatible(&self, requested: &RunManifest) -> Result<()> {
        if self.batch_size_days != requested.batch_size_days {
            return Err(PipelineError::PlanConflict {
                tuple: "manifest".to_string(),
                detail: format!(
                    "batch_size_days changed from {} to {}",
                    self.batch_size_days, requested.batch_size_days
                ),
            });
        }
        if self.range != requested.range {
            return Err(PipelineError::PlanConflict {
                tuple: "manifest".to_string(),
                detail: format!(
                    "date range changed from {}..={} to {}..={}",
                    self.range.start, self.range.end, requested.range.start, requested.range.end
                ),
            });
        }
        Ok(())
    }

    /// Every registered (scenario, model-variant) pair.
    pub fn tuples(&self) -> Vec<(String, ModelVariant)> {
        self.scenarios
            .iter()
            .flat_map(|(scenario, mvs)| {
                mvs.iter().map(move |mv| (scenario.clone(), mv.clone()))
            })
            .collect()
    }

    /// Model-variants registered for one scenario.
    pub fn model_variants(&self, scenario: &str) -> &[ModelVariant] {
        self.scenarios
            .get(scenario)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Plan the batches for one (scenario, model-variant) pair.
    pub fn batches_for(&self, scenario: &str, mv: &ModelVariant) -> Result<Vec<Batch>> {
        plan_batches(mv, scenario, self.range, self.batch_size_days)
    }

    /// Expected ExtractedSource set for one (scenario, model-variant).
    pub fn expected_sources(&self, scenario: &str, mv: &ModelVariant) -> Result<Vec<ArtifactId>> {
        self.range
            .years()
            .into_iter()
            .map(|year| {
                ArtifactId::extracted_source(&self.source, &mv.model, scenario, &mv.variant, year)
            })
            .collect()
    }

    /// Expected CamaOutput set for one batch, across all measures.
    pub fn expected_outputs(&self, batch: &Batch) -> Result<Vec<ArtifactId>> {
        let mut ids = Vec::new();
        for spec in &self.measures {
            ids.extend(batch.expected_outputs(&spec.measure)?);
        }
        Ok(ids)
    }

    /// Expected RawResult set for one (scenario, model-variant).
    pub fn expected_raw(&self, scenario: &str, mv: &ModelVariant) -> Result<Vec<ArtifactId>> {
        self.measures
            .iter()
            .map(|spec| ArtifactId::raw_result(scenario, &spec.measure, &mv.model, &mv.variant))
            .collect()
    }

    /// Expected FinalResult set for one (scenario, model-variant).
    pub fn expected_final(&self, scenario: &str, mv: &ModelVariant) -> Result<Vec<ArtifactId>> {
        self.measures
            .iter()
            .map(|spec| {
                ArtifactId::final_result(scenario, spec.final_measure(), &mv.model, &mv.variant)
            })
            .collect()
    }
}
