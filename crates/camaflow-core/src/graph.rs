//! The fixed stage ordering and its input/output declarations.
//!
//! Readiness is a pure function of (graph, catalog snapshot, manifest):
//! no hidden mutable state, so the coordinator can recompute the runnable
//! set from a fresh scan at any time.

use serde::{Deserialize, Serialize};

use crate::catalog::Catalog;
use crate::error::{PipelineError, Result};
use crate::ident::{ArtifactKind, TupleKey};
use crate::manifest::RunManifest;

/// Pipeline stages in dependency order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Extract,
    PrepareInput,
    RunModel,
    CollectOutput,
    Aggregate,
    Finalize,
}

impl Stage {
    /// All stages, in execution order.
    pub const ORDER: [Stage; 6] = [
        Stage::Extract,
        Stage::PrepareInput,
        Stage::RunModel,
        Stage::CollectOutput,
        Stage::Aggregate,
        Stage::Finalize,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Extract => "extract",
            Stage::PrepareInput => "prepare_input",
            Stage::RunModel => "run_model",
            Stage::CollectOutput => "collect_output",
            Stage::Aggregate => "aggregate",
            Stage::Finalize => "finalize",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Declared inputs/outputs of one stage.
#[derive(Debug, Clone)]
pub struct StageSpec {
    pub stage: Stage,
    pub inputs: Vec<ArtifactKind>,
    pub outputs: Vec<ArtifactKind>,
    /// Inputs of this stage may be supplied externally rather than produced
    /// by an earlier stage.
    pub external_supply: bool,
}

/// The validated stage graph.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    stages: Vec<StageSpec>,
}

fn standard_specs() -> Vec<StageSpec> {
    vec![
        StageSpec {
            stage: Stage::Extract,
            inputs: vec![],
            outputs: vec![ArtifactKind::ExtractedSource],
            external_supply: true,
        },
        StageSpec {
            stage: Stage::PrepareInput,
            inputs: vec![ArtifactKind::ExtractedSource],
            outputs: vec![ArtifactKind::CamaInput],
            external_supply: false,
        },
        StageSpec {
            stage: Stage::RunModel,
            inputs: vec![ArtifactKind::CamaInput],
            outputs: vec![ArtifactKind::CamaOutput],
            external_supply: false,
        },
        // Verification/admission only: re-scans and checks the expected
        // output set; produces no artifacts of its own.
        StageSpec {
            stage: Stage::CollectOutput,
            inputs: vec![ArtifactKind::CamaOutput],
            outputs: vec![],
            external_supply: false,
        },
        StageSpec {
            stage: Stage::Aggregate,
            inputs: vec![ArtifactKind::CamaOutput],
            outputs: vec![ArtifactKind::RawResult],
            external_supply: false,
        },
        StageSpec {
            stage: Stage::Finalize,
            inputs: vec![ArtifactKind::RawResult],
            outputs: vec![ArtifactKind::FinalResult],
            external_supply: false,
        },
    ]
}

impl DependencyGraph {
    /// Validate and build a graph from stage specs.
    ///
    /// Every declared input kind must be produced by an earlier stage or be
    /// flagged as externally supplied, and no kind may have two producers.
    pub fn new(stages: Vec<StageSpec>) -> Result<Self> {
        let mut produced: Vec<ArtifactKind> = Vec::new();
        for spec in &stages {
            if !spec.external_supply {
                for input in &spec.inputs {
                    if !produced.contains(input) {
                        return Err(PipelineError::Configuration(format!(
                            "stage {} declares input {} with no earlier producer \
                             and no external-supply flag",
                            spec.stage,
                            input.name()
                        )));
                    }
                }
            }
            for output in &spec.outputs {
                if produced.contains(output) {
                    return Err(PipelineError::Configuration(format!(
                        "artifact kind {} has two producing stages",
                        output.name()
                    )));
                }
                produced.push(*output);
            }
        }
        Ok(Self { stages })
    }

    /// The standard Extract -> ... -> Finalize pipeline.
    pub fn standard() -> Self {
        // standard_specs() is validated by test; construction cannot fail.
        Self {
            stages: standard_specs(),
        }
    }

    pub fn stages(&self) -> &[StageSpec] {
        &self.stages
    }

    pub fn spec(&self, stage: Stage) -> Option<&StageSpec> {
        self.stages.iter().find(|s| s.stage == stage)
    }

    /// Parameter tuples whose required inputs for `stage` are all present
    /// in the snapshot. Pure: same snapshot, same answer.
    pub fn ready_tuples(
        &self,
        stage: Stage,
        catalog: &Catalog,
        manifest: &RunManifest,
    ) -> Result<Vec<TupleKey>> {
        let mut ready = Vec::new();
        for (scenario, mv) in manifest.tuples() {
            match stage {
                // Externally supplied; the tuple is always dispatchable.
                Stage::Extract => {
                    ready.push(TupleKey::new(&mv.model, &scenario, &mv.variant, None));
                }
                Stage::PrepareInput => {
                    let sources = manifest.expected_sources(&scenario, &mv)?;
                    if catalog.exists_all(&sources) {
                        for batch in manifest.batches_for(&scenario, &mv)? {
                            ready.push(batch.tuple());
                        }
                    }
                }
                Stage::RunModel => {
                    for batch in manifest.batches_for(&scenario, &mv)? {
                        if catalog.exists_all(&batch.expected_inputs()?) {
                            ready.push(batch.tuple());
                        }
                    }
                }
                Stage::CollectOutput => {
                    for batch in manifest.batches_for(&scenario, &mv)? {
                        if catalog.exists_all(&manifest.expected_outputs(&batch)?) {
                            ready.push(batch.tuple());
                        }
                    }
                }
                Stage::Aggregate => {
                    let mut complete = true;
                    for batch in manifest.batches_for(&scenario, &mv)? {
                        if !catalog.exists_all(&manifest.expected_outputs(&batch)?) {
                            complete = false;
                            break;
                        }
                    }
                    if complete {
                        ready.push(TupleKey::new(&mv.model, &scenario, &mv.variant, None));
                    }
                }
                Stage::Finalize => {
                    if catalog.exists_all(&manifest.expected_raw(&scenario, &mv)?) {
                        ready.push(TupleKey::new(&mv.model, &scenario, &mv.variant, None));
                    }
                }
            }
        }
        Ok(ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode;
    use crate::ident::{ArtifactId, ModelVariant};
    use crate::manifest::MeasureSpec;
    use crate::plan::DateRange;
    use chrono::NaiveDate;
    use std::collections::BTreeMap;
    use std::fs;
    use std::path::Path;

    #[test]
    fn test_standard_graph_validates() {
        let graph = DependencyGraph::new(standard_specs()).expect("standard graph is valid");
        assert_eq!(graph.stages().len(), 6);
        assert_eq!(graph.stages()[0].stage, Stage::Extract);
    }

    #[test]
    fn test_missing_producer_rejected() {
        let specs = vec![StageSpec {
            stage: Stage::RunModel,
            inputs: vec![ArtifactKind::CamaInput],
            outputs: vec![ArtifactKind::CamaOutput],
            external_supply: false,
        }];
        let err = DependencyGraph::new(specs).unwrap_err();
        assert!(err.to_string().contains("no earlier producer"));
    }

    #[test]
    fn test_double_producer_rejected() {
        let mut specs = standard_specs();
        specs.push(StageSpec {
            stage: Stage::Finalize,
            inputs: vec![],
            outputs: vec![ArtifactKind::CamaOutput],
            external_supply: true,
        });
        let err = DependencyGraph::new(specs).unwrap_err();
        assert!(err.to_string().contains("two producing stages"));
    }

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn sample_manifest() -> RunManifest {
        let mut scenarios = BTreeMap::new();
        scenarios.insert("ssp245".to_string(), vec![ModelVariant::new("M1", "r1").unwrap()]);
        RunManifest::new(
            "src",
            scenarios,
            DateRange::new(ymd(2015, 1, 1), ymd(2015, 1, 10)).unwrap(),
            5,
            vec![MeasureSpec::new("fldfrc", "mean").unwrap()],
        )
        .unwrap()
    }

    fn touch_id(root: &Path, id: &ArtifactId) {
        let path = root.join(encode(id));
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"x").unwrap();
    }

    #[test]
    fn test_ready_tuples_follow_catalog_state() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = sample_manifest();
        let graph = DependencyGraph::standard();

        // Nothing staged: PrepareInput has no ready tuples, while Extract
        // is externally supplied and always dispatchable.
        let catalog = Catalog::scan(dir.path()).unwrap();
        assert!(graph
            .ready_tuples(Stage::PrepareInput, &catalog, &manifest)
            .unwrap()
            .is_empty());
        assert_eq!(
            graph
                .ready_tuples(Stage::Extract, &catalog, &manifest)
                .unwrap()
                .len(),
            1
        );

        // Stage the extracted source; both batch tuples become ready.
        let mv = ModelVariant::new("M1", "r1").unwrap();
        for id in manifest.expected_sources("ssp245", &mv).unwrap() {
            touch_id(dir.path(), &id);
        }
        let catalog = Catalog::scan(dir.path()).unwrap();
        let ready = graph
            .ready_tuples(Stage::PrepareInput, &catalog, &manifest)
            .unwrap();
        assert_eq!(ready.len(), 2);
        assert_eq!(ready[0].batch, Some(0));
        assert_eq!(ready[1].batch, Some(1));

        // RunModel is not ready until the inputs for a batch exist.
        assert!(graph
            .ready_tuples(Stage::RunModel, &catalog, &manifest)
            .unwrap()
            .is_empty());
        let batches = manifest.batches_for("ssp245", &mv).unwrap();
        for id in batches[0].expected_inputs().unwrap() {
            touch_id(dir.path(), &id);
        }
        let catalog = Catalog::scan(dir.path()).unwrap();
        let ready = graph
            .ready_tuples(Stage::RunModel, &catalog, &manifest)
            .unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].batch, Some(0));
    }

    #[test]
    fn test_aggregate_ready_only_when_all_batches_complete() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = sample_manifest();
        let graph = DependencyGraph::standard();
        let mv = ModelVariant::new("M1", "r1").unwrap();
        let batches = manifest.batches_for("ssp245", &mv).unwrap();

        // Only the first batch's outputs exist.
        for id in manifest.expected_outputs(&batches[0]).unwrap() {
            touch_id(dir.path(), &id);
        }
        let catalog = Catalog::scan(dir.path()).unwrap();
        assert!(graph
            .ready_tuples(Stage::Aggregate, &catalog, &manifest)
            .unwrap()
            .is_empty());

        for id in manifest.expected_outputs(&batches[1]).unwrap() {
            touch_id(dir.path(), &id);
        }
        let catalog = Catalog::scan(dir.path()).unwrap();
        assert_eq!(
            graph
                .ready_tuples(Stage::Aggregate, &catalog, &manifest)
                .unwrap()
                .len(),
            1
        );
    }
}
