//! Bidirectional mapping between artifact identifiers and root-relative paths.
//!
//! The templates here are the persisted interface other tools depend on:
//!
//! ```text
//! extracted_data/{source}/{model}_{scenario}_{variant}_{year}.nc
//! cama_inputs/{model}_{scenario}_{variant}_batch{n}/run.sh
//! cama_inputs/{model}_{scenario}_{variant}_batch{n}/runoff.ctl
//! cama_inputs/{model}_{scenario}_{variant}_batch{n}/runoff/Roff____{YYYYMMDD}.one
//! cama_outputs/{model}_{scenario}_{variant}_batch{n}/{output_measure}{year}.bin
//! results/raw/{scenario}/{measure}/{model}_{variant}.nc
//! results/final/{scenario}/{final_measure}/{model}_{variant}.nc
//! ```
//!
//! `decode(encode(x)) == x` for every valid identifier, and no two distinct
//! identifiers of one kind render to the same path. Paths are always
//! relative to the pipeline root; decoding rejects absolute paths and `..`
//! segments so field values sourced from external data cannot escape the
//! tree.

use std::path::{Component, Path, PathBuf};

use chrono::NaiveDate;

use crate::error::DecodeError;
use crate::ident::{ArtifactId, ArtifactKind, InputFile};

/// Top-level area holding the routing-model installation. Part of the
/// directory contract but never scanned for artifacts.
pub const CAMA_FLOOD_DIR: &str = "CaMa-Flood";

pub const EXTRACTED_DIR: &str = "extracted_data";
pub const INPUTS_DIR: &str = "cama_inputs";
pub const OUTPUTS_DIR: &str = "cama_outputs";
pub const RESULTS_DIR: &str = "results";

const RUN_SCRIPT: &str = "run.sh";
const CONTROL_FILE: &str = "runoff.ctl";
const RUNOFF_DIR: &str = "runoff";
const DAILY_PREFIX: &str = "Roff____";
const DAILY_SUFFIX: &str = ".one";

/// Render the shared `{model}_{scenario}_{variant}_batch{n}` directory name.
pub fn batch_dir_name(model: &str, scenario: &str, variant: &str, batch: u32) -> String {
    format!("{model}_{scenario}_{variant}_batch{batch}")
}

/// Render an identifier to its root-relative path.
///
/// Infallible: field validation already happened when the identifier was
/// constructed.
pub fn encode(id: &ArtifactId) -> PathBuf {
    match id {
        ArtifactId::ExtractedSource {
            source,
            model,
            scenario,
            variant,
            year,
        } => PathBuf::from(EXTRACTED_DIR)
            .join(source)
            .join(format!("{model}_{scenario}_{variant}_{year}.nc")),
        ArtifactId::CamaInput {
            model,
            scenario,
            variant,
            batch,
            file,
        } => {
            let dir = PathBuf::from(INPUTS_DIR).join(batch_dir_name(model, scenario, variant, *batch));
            match file {
                InputFile::RunScript => dir.join(RUN_SCRIPT),
                InputFile::ControlFile => dir.join(CONTROL_FILE),
                InputFile::DailyRunoff { date } => dir
                    .join(RUNOFF_DIR)
                    .join(format!("{DAILY_PREFIX}{}{DAILY_SUFFIX}", date.format("%Y%m%d"))),
            }
        }
        ArtifactId::CamaOutput {
            model,
            scenario,
            variant,
            batch,
            output_measure,
            year,
        } => PathBuf::from(OUTPUTS_DIR)
            .join(batch_dir_name(model, scenario, variant, *batch))
            .join(format!("{output_measure}{year}.bin")),
        ArtifactId::RawResult {
            scenario,
            measure,
            model,
            variant,
        } => PathBuf::from(RESULTS_DIR)
            .join("raw")
            .join(scenario)
            .join(measure)
            .join(format!("{model}_{variant}.nc")),
        ArtifactId::FinalResult {
            scenario,
            final_measure,
            model,
            variant,
        } => PathBuf::from(RESULTS_DIR)
            .join("final")
            .join(scenario)
            .join(final_measure)
            .join(format!("{model}_{variant}.nc")),
    }
}

/// Decode a root-relative path against one kind's template.
pub fn decode(path: &Path, kind: ArtifactKind) -> Result<ArtifactId, DecodeError> {
    let parts = split_components(path)?;
    let mismatch = || DecodeError::UnknownTemplate {
        kind: kind.name(),
        path: path.display().to_string(),
    };

    match kind {
        ArtifactKind::ExtractedSource => {
            let [area, source, file] = parts.as_slice() else {
                return Err(mismatch());
            };
            if *area != EXTRACTED_DIR {
                return Err(mismatch());
            }
            let stem = file.strip_suffix(".nc").ok_or_else(mismatch)?;
            let fields = split_fields(stem, 4)?;
            let year = parse_year(fields[3])?;
            ArtifactId::extracted_source(source.to_string(), fields[0], fields[1], fields[2], year)
                .map_err(|e| DecodeError::InvalidField(e.to_string()))
        }
        ArtifactKind::CamaInput => match parts.as_slice() {
            [area, dir, file] if *area == INPUTS_DIR => {
                let (model, scenario, variant, batch) = parse_batch_dir(dir)?;
                let input = match *file {
                    RUN_SCRIPT => InputFile::RunScript,
                    CONTROL_FILE => InputFile::ControlFile,
                    _ => return Err(mismatch()),
                };
                ArtifactId::cama_input(model, scenario, variant, batch, input)
                    .map_err(|e| DecodeError::InvalidField(e.to_string()))
            }
            [area, dir, runoff, file] if *area == INPUTS_DIR && *runoff == RUNOFF_DIR => {
                let (model, scenario, variant, batch) = parse_batch_dir(dir)?;
                let date = parse_daily_name(file)?;
                ArtifactId::cama_input(model, scenario, variant, batch, InputFile::DailyRunoff { date })
                    .map_err(|e| DecodeError::InvalidField(e.to_string()))
            }
            _ => Err(mismatch()),
        },
        ArtifactKind::CamaOutput => {
            let [area, dir, file] = parts.as_slice() else {
                return Err(mismatch());
            };
            if *area != OUTPUTS_DIR {
                return Err(mismatch());
            }
            let (model, scenario, variant, batch) = parse_batch_dir(dir)?;
            let stem = file.strip_suffix(".bin").ok_or_else(mismatch)?;
            if stem.len() <= 4 {
                return Err(DecodeError::BadYear {
                    token: stem.to_string(),
                });
            }
            let (measure, year_str) = stem.split_at(stem.len() - 4);
            let year = parse_year(year_str)?;
            ArtifactId::cama_output(model, scenario, variant, batch, measure, year)
                .map_err(|e| DecodeError::InvalidField(e.to_string()))
        }
        ArtifactKind::RawResult | ArtifactKind::FinalResult => {
            let [area, tier, scenario, measure, file] = parts.as_slice() else {
                return Err(mismatch());
            };
            let expected_tier = if kind == ArtifactKind::RawResult {
                "raw"
            } else {
                "final"
            };
            if *area != RESULTS_DIR || *tier != expected_tier {
                return Err(mismatch());
            }
            let stem = file.strip_suffix(".nc").ok_or_else(mismatch)?;
            let fields = split_fields(stem, 2)?;
            let result = if kind == ArtifactKind::RawResult {
                ArtifactId::raw_result(scenario.to_string(), measure.to_string(), fields[0], fields[1])
            } else {
                ArtifactId::final_result(scenario.to_string(), measure.to_string(), fields[0], fields[1])
            };
            result.map_err(|e| DecodeError::InvalidField(e.to_string()))
        }
    }
}

/// Try every kind's template; `None` if the path matches no template.
pub fn decode_any(path: &Path) -> Option<ArtifactId> {
    ArtifactKind::ALL
        .iter()
        .find_map(|kind| decode(path, *kind).ok())
}

/// Split into UTF-8 normal components, rejecting absolute paths and `..`.
fn split_components(path: &Path) -> Result<Vec<&str>, DecodeError> {
    let mut parts = Vec::new();
    for comp in path.components() {
        match comp {
            Component::Normal(os) => {
                let s = os.to_str().ok_or(DecodeError::InvalidComponent)?;
                if s == ".." {
                    return Err(DecodeError::Traversal {
                        path: path.display().to_string(),
                    });
                }
                parts.push(s);
            }
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(DecodeError::Traversal {
                    path: path.display().to_string(),
                })
            }
        }
    }
    Ok(parts)
}

/// Split a `_`-joined token into exactly `expected` fields.
fn split_fields(token: &str, expected: usize) -> Result<Vec<&str>, DecodeError> {
    let fields: Vec<&str> = token.split('_').collect();
    if fields.len() != expected {
        return Err(DecodeError::FieldCount {
            expected,
            found: fields.len(),
            token: token.to_string(),
        });
    }
    Ok(fields)
}

/// Parse `{model}_{scenario}_{variant}_batch{n}`.
fn parse_batch_dir(dir: &str) -> Result<(&str, &str, &str, u32), DecodeError> {
    let fields = split_fields(dir, 4)?;
    let digits = fields[3]
        .strip_prefix("batch")
        .ok_or_else(|| DecodeError::BadBatch {
            token: fields[3].to_string(),
        })?;
    let batch: u32 = digits.parse().map_err(|_| DecodeError::BadBatch {
        token: fields[3].to_string(),
    })?;
    // Reject non-canonical tokens like `batch01`, which would break
    // round-tripping.
    if digits != batch.to_string() {
        return Err(DecodeError::BadBatch {
            token: fields[3].to_string(),
        });
    }
    Ok((fields[0], fields[1], fields[2], batch))
}

fn parse_year(token: &str) -> Result<i32, DecodeError> {
    if token.len() != 4 || !token.bytes().all(|b| b.is_ascii_digit()) {
        return Err(DecodeError::BadYear {
            token: token.to_string(),
        });
    }
    token.parse().map_err(|_| DecodeError::BadYear {
        token: token.to_string(),
    })
}

/// Parse `Roff____YYYYMMDD.one`.
fn parse_daily_name(file: &str) -> Result<NaiveDate, DecodeError> {
    let bad = || DecodeError::BadDate {
        token: file.to_string(),
    };
    let digits = file
        .strip_prefix(DAILY_PREFIX)
        .and_then(|s| s.strip_suffix(DAILY_SUFFIX))
        .ok_or_else(bad)?;
    if digits.len() != 8 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(bad());
    }
    NaiveDate::parse_from_str(digits, "%Y%m%d").map_err(|_| bad())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_ids() -> Vec<ArtifactId> {
        vec![
            ArtifactId::extracted_source("esgf-metagrid", "ACCESS-CM2", "ssp245", "r1i1p1f1", 2015)
                .unwrap(),
            ArtifactId::cama_input("MIROC6", "historical", "r1i1p1f1", 0, InputFile::RunScript)
                .unwrap(),
            ArtifactId::cama_input("MIROC6", "historical", "r1i1p1f1", 0, InputFile::ControlFile)
                .unwrap(),
            ArtifactId::cama_input(
                "MIROC6",
                "historical",
                "r1i1p1f1",
                17,
                InputFile::DailyRunoff {
                    date: NaiveDate::from_ymd_opt(2020, 2, 29).unwrap(),
                },
            )
            .unwrap(),
            ArtifactId::cama_output("GFDL-CM4", "ssp585", "r1i1p1f1", 3, "fldfrc", 2031).unwrap(),
            ArtifactId::raw_result("ssp245", "fldfrc", "M1", "r1").unwrap(),
            ArtifactId::final_result("ssp245", "fldfrc_mean", "M1", "r1").unwrap(),
        ]
    }

    #[test]
    fn test_round_trip_every_kind() {
        for id in sample_ids() {
            let path = encode(&id);
            let back = decode(&path, id.kind()).expect("decode back");
            assert_eq!(id, back, "round trip failed for {path:?}");
        }
    }

    #[test]
    fn test_decode_any_matches_exactly_one_kind() {
        for id in sample_ids() {
            let path = encode(&id);
            let mut hits = 0;
            for kind in ArtifactKind::ALL {
                if decode(&path, kind).is_ok() {
                    hits += 1;
                }
            }
            assert_eq!(hits, 1, "{path:?} should decode under exactly one kind");
            assert_eq!(decode_any(&path), Some(id));
        }
    }

    #[test]
    fn test_known_template_shapes() {
        let id = ArtifactId::cama_output("GFDL-CM4", "ssp585", "r1i1p1f1", 3, "fldfrc", 2031).unwrap();
        assert_eq!(
            encode(&id),
            PathBuf::from("cama_outputs/GFDL-CM4_ssp585_r1i1p1f1_batch3/fldfrc2031.bin")
        );

        let id = ArtifactId::raw_result("ssp245", "fldfrc", "M1", "r1").unwrap();
        assert_eq!(encode(&id), PathBuf::from("results/raw/ssp245/fldfrc/M1_r1.nc"));

        let id = ArtifactId::cama_input(
            "M1",
            "ssp245",
            "r1",
            0,
            InputFile::DailyRunoff {
                date: NaiveDate::from_ymd_opt(2015, 1, 2).unwrap(),
            },
        )
        .unwrap();
        assert_eq!(
            encode(&id),
            PathBuf::from("cama_inputs/M1_ssp245_r1_batch0/runoff/Roff____20150102.one")
        );
    }

    #[test]
    fn test_injectivity_on_distinct_ids() {
        let a = ArtifactId::cama_output("M1", "ssp245", "r1", 0, "fldfrc", 2015).unwrap();
        let b = ArtifactId::cama_output("M1", "ssp245", "r1", 0, "fldfrc", 2016).unwrap();
        let c = ArtifactId::cama_output("M1", "ssp245", "r1", 1, "fldfrc", 2015).unwrap();
        // A measure ending in a digit must not collide with a different
        // measure/year split: year is always exactly four digits.
        let d = ArtifactId::cama_output("M1", "ssp245", "r1", 0, "fldfrc2", 2015).unwrap();
        let paths = [encode(&a), encode(&b), encode(&c), encode(&d)];
        for i in 0..paths.len() {
            for j in (i + 1)..paths.len() {
                assert_ne!(paths[i], paths[j]);
            }
        }
        assert_eq!(decode(&paths[3], ArtifactKind::CamaOutput).unwrap(), d);
    }

    #[test]
    fn test_traversal_rejected() {
        for bad in [
            "../cama_outputs/M1_s_v_batch0/fldfrc2015.bin",
            "/etc/passwd",
            "cama_outputs/../results/raw/s/m/M1_r1.nc",
        ] {
            let err = decode(Path::new(bad), ArtifactKind::CamaOutput).unwrap_err();
            assert!(
                matches!(err, DecodeError::Traversal { .. }),
                "{bad} should be a traversal error, got {err:?}"
            );
        }
    }

    #[test]
    fn test_malformed_tokens_rejected() {
        // Wrong field count.
        assert!(decode(
            Path::new("cama_outputs/M1_ssp245_batch0/fldfrc2015.bin"),
            ArtifactKind::CamaOutput
        )
        .is_err());
        // Non-numeric year.
        assert!(decode(
            Path::new("cama_outputs/M1_ssp245_r1_batch0/fldfrcXXXX.bin"),
            ArtifactKind::CamaOutput
        )
        .is_err());
        // Malformed batch token.
        for dir in ["M1_ssp245_r1_batchX", "M1_ssp245_r1_4", "M1_ssp245_r1_batch01"] {
            assert!(
                decode(
                    Path::new(&format!("cama_outputs/{dir}/fldfrc2015.bin")),
                    ArtifactKind::CamaOutput
                )
                .is_err(),
                "{dir} should be rejected"
            );
        }
        // Malformed daily record name.
        assert!(decode(
            Path::new("cama_inputs/M1_ssp245_r1_batch0/runoff/Roff____2015010.one"),
            ArtifactKind::CamaInput
        )
        .is_err());
        assert!(decode(
            Path::new("cama_inputs/M1_ssp245_r1_batch0/runoff/Roff____20150230.one"),
            ArtifactKind::CamaInput
        )
        .is_err());
    }

    #[test]
    fn test_unrelated_file_decodes_under_no_kind() {
        assert_eq!(decode_any(Path::new("CaMa-Flood/gosh/template.sh")), None);
        assert_eq!(decode_any(Path::new("notes.txt")), None);
    }
}
