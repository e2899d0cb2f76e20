//! Artifact identifiers: the typed side of the naming contract.
//!
//! Every pipeline artifact is identified by an [`ArtifactId`], a closed
//! tagged variant whose fields are validated at construction time. Which
//! fields exist depends on the kind; the codec renders each kind through a
//! fixed path template. Construction is the only place string fields are
//! checked, so an `ArtifactId` value is always encodable.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// The closed set of artifact kinds the pipeline knows about.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Yearly runoff field staged from a climate model.
    ExtractedSource,

    /// Routing-model input: run script, control file, or daily runoff record.
    CamaInput,

    /// Routing-model binary output, one file per measure and year.
    CamaOutput,

    /// Per-scenario, per-measure, per-model-variant aggregated result.
    RawResult,

    /// Bias-adjusted result ready for downstream consumption.
    FinalResult,
}

impl ArtifactKind {
    /// All kinds, in scan/decode order.
    pub const ALL: [ArtifactKind; 5] = [
        ArtifactKind::ExtractedSource,
        ArtifactKind::CamaInput,
        ArtifactKind::CamaOutput,
        ArtifactKind::RawResult,
        ArtifactKind::FinalResult,
    ];

    /// Kind name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            ArtifactKind::ExtractedSource => "extracted_source",
            ArtifactKind::CamaInput => "cama_input",
            ArtifactKind::CamaOutput => "cama_output",
            ArtifactKind::RawResult => "raw_result",
            ArtifactKind::FinalResult => "final_result",
        }
    }
}

/// Which file inside a batch input directory a `CamaInput` names.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "file", rename_all = "snake_case")]
pub enum InputFile {
    /// `run.sh`, the rendered per-batch run script.
    RunScript,

    /// `runoff.ctl`, the control file describing the daily records.
    ControlFile,

    /// `runoff/Roff____YYYYMMDD.one`, one daily runoff record.
    DailyRunoff { date: NaiveDate },
}

/// A (climate model, ensemble variant) pair identifying one simulation member.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelVariant {
    pub model: String,
    pub variant: String,
}

impl ModelVariant {
    /// Create a model-variant, validating both tokens.
    pub fn new(model: impl Into<String>, variant: impl Into<String>) -> Result<Self> {
        let model = model.into();
        let variant = variant.into();
        validate_token("model", &model)?;
        validate_token("variant", &variant)?;
        Ok(Self { model, variant })
    }

    /// Render as the `{model}_{variant}` filename stem used under `results/`.
    pub fn stem(&self) -> String {
        format!("{}_{}", self.model, self.variant)
    }
}

impl std::fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", self.model, self.variant)
    }
}

/// Key of one unit of pipeline work: (model, scenario, variant[, batch]).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TupleKey {
    pub model: String,
    pub scenario: String,
    pub variant: String,
    pub batch: Option<u32>,
}

impl TupleKey {
    pub fn new(
        model: impl Into<String>,
        scenario: impl Into<String>,
        variant: impl Into<String>,
        batch: Option<u32>,
    ) -> Self {
        Self {
            model: model.into(),
            scenario: scenario.into(),
            variant: variant.into(),
            batch,
        }
    }

    /// The model-variant component of this tuple.
    pub fn model_variant(&self) -> ModelVariant {
        ModelVariant {
            model: self.model.clone(),
            variant: self.variant.clone(),
        }
    }
}

impl std::fmt::Display for TupleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.batch {
            Some(b) => write!(
                f,
                "{}_{}_{}_batch{}",
                self.model, self.scenario, self.variant, b
            ),
            None => write!(f, "{}_{}_{}", self.model, self.scenario, self.variant),
        }
    }
}

/// Structured identity of one pipeline artifact.
///
/// Immutable once constructed; equality and hashing are structural.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ArtifactId {
    ExtractedSource {
        source: String,
        model: String,
        scenario: String,
        variant: String,
        year: i32,
    },
    CamaInput {
        model: String,
        scenario: String,
        variant: String,
        batch: u32,
        #[serde(flatten)]
        file: InputFile,
    },
    CamaOutput {
        model: String,
        scenario: String,
        variant: String,
        batch: u32,
        output_measure: String,
        year: i32,
    },
    RawResult {
        scenario: String,
        measure: String,
        model: String,
        variant: String,
    },
    FinalResult {
        scenario: String,
        final_measure: String,
        model: String,
        variant: String,
    },
}

impl ArtifactId {
    pub fn extracted_source(
        source: impl Into<String>,
        model: impl Into<String>,
        scenario: impl Into<String>,
        variant: impl Into<String>,
        year: i32,
    ) -> Result<Self> {
        let source = source.into();
        let model = model.into();
        let scenario = scenario.into();
        let variant = variant.into();
        validate_segment("source", &source)?;
        validate_token("model", &model)?;
        validate_token("scenario", &scenario)?;
        validate_token("variant", &variant)?;
        validate_year(year)?;
        Ok(ArtifactId::ExtractedSource {
            source,
            model,
            scenario,
            variant,
            year,
        })
    }

    pub fn cama_input(
        model: impl Into<String>,
        scenario: impl Into<String>,
        variant: impl Into<String>,
        batch: u32,
        file: InputFile,
    ) -> Result<Self> {
        let model = model.into();
        let scenario = scenario.into();
        let variant = variant.into();
        validate_token("model", &model)?;
        validate_token("scenario", &scenario)?;
        validate_token("variant", &variant)?;
        Ok(ArtifactId::CamaInput {
            model,
            scenario,
            variant,
            batch,
            file,
        })
    }

    pub fn cama_output(
        model: impl Into<String>,
        scenario: impl Into<String>,
        variant: impl Into<String>,
        batch: u32,
        output_measure: impl Into<String>,
        year: i32,
    ) -> Result<Self> {
        let model = model.into();
        let scenario = scenario.into();
        let variant = variant.into();
        let output_measure = output_measure.into();
        validate_token("model", &model)?;
        validate_token("scenario", &scenario)?;
        validate_token("variant", &variant)?;
        validate_segment("output_measure", &output_measure)?;
        validate_year(year)?;
        Ok(ArtifactId::CamaOutput {
            model,
            scenario,
            variant,
            batch,
            output_measure,
            year,
        })
    }

    pub fn raw_result(
        scenario: impl Into<String>,
        measure: impl Into<String>,
        model: impl Into<String>,
        variant: impl Into<String>,
    ) -> Result<Self> {
        let scenario = scenario.into();
        let measure = measure.into();
        let model = model.into();
        let variant = variant.into();
        validate_token("scenario", &scenario)?;
        validate_segment("measure", &measure)?;
        validate_token("model", &model)?;
        validate_token("variant", &variant)?;
        Ok(ArtifactId::RawResult {
            scenario,
            measure,
            model,
            variant,
        })
    }

    pub fn final_result(
        scenario: impl Into<String>,
        final_measure: impl Into<String>,
        model: impl Into<String>,
        variant: impl Into<String>,
    ) -> Result<Self> {
        let scenario = scenario.into();
        let final_measure = final_measure.into();
        let model = model.into();
        let variant = variant.into();
        validate_token("scenario", &scenario)?;
        validate_segment("final_measure", &final_measure)?;
        validate_token("model", &model)?;
        validate_token("variant", &variant)?;
        Ok(ArtifactId::FinalResult {
            scenario,
            final_measure,
            model,
            variant,
        })
    }

    /// The kind of this identifier.
    pub fn kind(&self) -> ArtifactKind {
        match self {
            ArtifactId::ExtractedSource { .. } => ArtifactKind::ExtractedSource,
            ArtifactId::CamaInput { .. } => ArtifactKind::CamaInput,
            ArtifactId::CamaOutput { .. } => ArtifactKind::CamaOutput,
            ArtifactId::RawResult { .. } => ArtifactKind::RawResult,
            ArtifactId::FinalResult { .. } => ArtifactKind::FinalResult,
        }
    }

    /// The work-unit key this artifact belongs to.
    pub fn tuple(&self) -> TupleKey {
        match self {
            ArtifactId::ExtractedSource {
                model,
                scenario,
                variant,
                ..
            } => TupleKey::new(model.clone(), scenario.clone(), variant.clone(), None),
            ArtifactId::CamaInput {
                model,
                scenario,
                variant,
                batch,
                ..
            }
            | ArtifactId::CamaOutput {
                model,
                scenario,
                variant,
                batch,
                ..
            } => TupleKey::new(model.clone(), scenario.clone(), variant.clone(), Some(*batch)),
            ArtifactId::RawResult {
                scenario,
                model,
                variant,
                ..
            }
            | ArtifactId::FinalResult {
                scenario,
                model,
                variant,
                ..
            } => TupleKey::new(model.clone(), scenario.clone(), variant.clone(), None),
        }
    }
}

/// Validate a value used as its own path segment (source, measure names).
///
/// Underscores are allowed here; the value never has to be split back apart.
pub(crate) fn validate_segment(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(PipelineError::Configuration(format!(
            "{field} must not be empty"
        )));
    }
    if value == "." || value == ".." {
        return Err(PipelineError::Configuration(format!(
            "{field} must not be a dot segment: {value:?}"
        )));
    }
    for c in value.chars() {
        if c == '/' || c == '\\' || c == '\0' || c.is_whitespace() || c.is_control() {
            return Err(PipelineError::Configuration(format!(
                "{field} contains reserved character {c:?}: {value:?}"
            )));
        }
    }
    Ok(())
}

/// Validate a value joined with `_` into a shared segment (model, scenario,
/// variant). Forbidding `_` inside these fields is what keeps the encoding
/// injective.
pub(crate) fn validate_token(field: &str, value: &str) -> Result<()> {
    validate_segment(field, value)?;
    if value.contains('_') {
        return Err(PipelineError::Configuration(format!(
            "{field} must not contain `_` (it is the tuple separator): {value:?}"
        )));
    }
    Ok(())
}

/// Years render as a fixed-width 4-digit suffix; anything else would make
/// `{output_measure}{year}.bin` ambiguous.
pub(crate) fn validate_year(year: i32) -> Result<()> {
    if !(1000..=9999).contains(&year) {
        return Err(PipelineError::Configuration(format!(
            "year must have exactly four digits: {year}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructor_accepts_real_names() {
        let id = ArtifactId::extracted_source("esgf-metagrid", "ACCESS-CM2", "ssp245", "r1i1p1f1", 2015)
            .expect("valid id");
        assert_eq!(id.kind(), ArtifactKind::ExtractedSource);
    }

    #[test]
    fn test_underscore_in_model_rejected() {
        let err = ModelVariant::new("ACCESS_CM2", "r1").unwrap_err();
        assert!(err.to_string().contains("separator"));
    }

    #[test]
    fn test_separator_characters_rejected() {
        for bad in ["a/b", "a\\b", "a b", "..", ".", ""] {
            assert!(
                ArtifactId::raw_result("ssp245", bad, "M1", "r1").is_err(),
                "measure {bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_measure_may_contain_underscore() {
        // Measures like `fldfrc_shifted95` occupy their own path segment.
        assert!(ArtifactId::raw_result("ssp245", "fldfrc_shifted95", "M1", "r1").is_ok());
    }

    #[test]
    fn test_year_bounds() {
        assert!(ArtifactId::cama_output("M1", "ssp245", "r1", 0, "fldfrc", 999).is_err());
        assert!(ArtifactId::cama_output("M1", "ssp245", "r1", 0, "fldfrc", 10000).is_err());
        assert!(ArtifactId::cama_output("M1", "ssp245", "r1", 0, "fldfrc", 2015).is_ok());
    }

    #[test]
    fn test_structural_equality_and_hash() {
        use std::collections::HashSet;
        let a = ArtifactId::raw_result("ssp245", "fldfrc", "M1", "r1").unwrap();
        let b = ArtifactId::raw_result("ssp245", "fldfrc", "M1", "r1").unwrap();
        assert_eq!(a, b);
        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn test_tuple_key_display() {
        let t = TupleKey::new("M1", "ssp245", "r1", Some(3));
        assert_eq!(t.to_string(), "M1_ssp245_r1_batch3");
        let t = TupleKey::new("M1", "ssp245", "r1", None);
        assert_eq!(t.to_string(), "M1_ssp245_r1");
    }

    #[test]
    fn test_serde_roundtrip() {
        let id = ArtifactId::cama_input(
            "M1",
            "ssp245",
            "r1",
            2,
            InputFile::DailyRunoff {
                date: NaiveDate::from_ymd_opt(2020, 2, 29).unwrap(),
            },
        )
        .unwrap();
        let json = serde_json::to_string(&id).expect("serialize");
        let back: ArtifactId = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(id, back);
    }
}
