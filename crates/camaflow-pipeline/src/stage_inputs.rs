//! Staging of per-batch routing-model inputs.
//!
//! One batch working directory holds a rendered `run.sh`, a GrADS-style
//! `runoff.ctl` describing the daily records, and one
//! `runoff/Roff____YYYYMMDD.one` record per batch date. Daily records are
//! sliced out of the staged yearly source files, which the extractor
//! delivers as day-major flat little-endian f32 grids (one grid per
//! calendar day).

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use camaflow_core::{ArtifactId, Batch, InputFile, PipelineError, Result};
use chrono::{Datelike, NaiveDate};
use tracing::debug;

use crate::executor::StageContext;

/// Write the full input set for one batch; returns the workdir.
///
/// Idempotent: existing files are overwritten atomically with identical
/// content when the plan is unchanged.
pub fn stage_batch_inputs(ctx: &StageContext, batch: &Batch) -> Result<PathBuf> {
    let workdir = ctx.workdir(batch);
    fs::create_dir_all(workdir.join("runoff"))?;

    write_atomic(&workdir, &workdir.join("run.sh"), render_run_script(batch).as_bytes())?;
    write_atomic(
        &workdir,
        &workdir.join("runoff.ctl"),
        render_control_file(ctx, batch).as_bytes(),
    )?;

    for date in batch.dates() {
        let record = slice_daily_record(ctx, batch, *date)?;
        let id = ArtifactId::cama_input(
            &batch.model,
            &batch.scenario,
            &batch.variant,
            batch.index,
            InputFile::DailyRunoff { date: *date },
        )?;
        let dest = ctx.abs(&id);
        write_atomic(&workdir.join("runoff"), &dest, &record)?;
    }

    debug!(tuple = %batch.tuple(), days = batch.dates().len(), "staged batch inputs");
    Ok(workdir)
}

/// Render the per-batch run script (counterpart of the generated gosh
/// scripts driving CaMa-Flood).
fn render_run_script(batch: &Batch) -> String {
    let dir = camaflow_core::batch_dir_name(
        &batch.model,
        &batch.scenario,
        &batch.variant,
        batch.index,
    );
    format!(
        "#!/bin/bash\n\
         # CaMa-Flood run: {model} {scenario} {variant} batch {index} \
         ({start}..{end})\n\
         set -euo pipefail\n\
         \n\
         CAMA_ROOT=\"${{CAMA_ROOT:-../../CaMa-Flood}}\"\n\
         OUTDIR=\"../../cama_outputs/{dir}\"\n\
         mkdir -p \"$OUTDIR\"\n\
         \n\
         \"$CAMA_ROOT/gosh/main_cmf.sh\" \\\n\
         \x20\x20--ctl runoff.ctl \\\n\
         \x20\x20--start {start_compact} \\\n\
         \x20\x20--end {end_compact} \\\n\
         \x20\x20--outdir \"$OUTDIR\"\n",
        model = batch.model,
        scenario = batch.scenario,
        variant = batch.variant,
        index = batch.index,
        start = batch.start(),
        end = batch.end(),
        start_compact = batch.start().format("%Y%m%d"),
        end_compact = batch.end().format("%Y%m%d"),
    )
}

/// Render the GrADS control file for the batch's daily records.
fn render_control_file(ctx: &StageContext, batch: &Batch) -> String {
    format!(
        "dset ^runoff/Roff____%y4%m2%d2.one\n\
         undef -9999\n\
         title runoff {model} {scenario} {variant} batch{index}\n\
         options template little_endian\n\
         xdef {nx} linear 0.0 1.0\n\
         ydef {ny} linear -90.0 1.0\n\
         zdef 1 levels 1\n\
         tdef {ndays} linear {t0} 1dy\n\
         vars 1\n\
         Roff 1 99 runoff [mm/day]\n\
         endvars\n",
        model = batch.model,
        scenario = batch.scenario,
        variant = batch.variant,
        index = batch.index,
        nx = ctx.grid.nx,
        ny = ctx.grid.ny,
        ndays = batch.dates().len(),
        t0 = grads_date(batch.start()),
    )
}

/// GrADS time token, e.g. `01jan2015`.
fn grads_date(date: NaiveDate) -> String {
    const MONTHS: [&str; 12] = [
        "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
    ];
    format!(
        "{:02}{}{}",
        date.day(),
        MONTHS[date.month0() as usize],
        date.year()
    )
}

/// Read one day's grid out of the staged yearly source file.
fn slice_daily_record(ctx: &StageContext, batch: &Batch, date: NaiveDate) -> Result<Vec<u8>> {
    let source_id = ArtifactId::extracted_source(
        &ctx.manifest.source,
        &batch.model,
        &batch.scenario,
        &batch.variant,
        date.year(),
    )?;
    let source_path = ctx.abs(&source_id);

    let record_bytes = ctx.grid.cells() * 4;
    let offset = date.ordinal0() as u64 * record_bytes as u64;

    let mut file = File::open(&source_path).map_err(|e| PipelineError::Execution {
        tuple: batch.tuple().to_string(),
        reason: format!("cannot open source {}: {e}", source_path.display()),
    })?;
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; record_bytes];
    file.read_exact(&mut buf).map_err(|_| PipelineError::Execution {
        tuple: batch.tuple().to_string(),
        reason: format!(
            "source {} truncated: day {} of {} needs {} bytes at offset {offset}",
            source_path.display(),
            date.ordinal(),
            date.year(),
            record_bytes
        ),
    })?;
    Ok(buf)
}

/// Atomic overwrite: temp file in the destination's directory, then rename.
pub(crate) fn write_atomic(dir: &Path, dest: &Path, data: &[u8]) -> Result<()> {
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.persist(dest).map_err(|e| PipelineError::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::GridSpec;
    use camaflow_core::{encode, DateRange, MeasureSpec, ModelVariant, RunManifest};
    use std::collections::BTreeMap;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn ctx(root: &Path) -> StageContext {
        let mut scenarios = BTreeMap::new();
        scenarios.insert("ssp245".to_string(), vec![ModelVariant::new("M1", "r1").unwrap()]);
        StageContext {
            root: root.to_path_buf(),
            manifest: RunManifest::new(
                "src",
                scenarios,
                DateRange::new(ymd(2015, 1, 1), ymd(2015, 1, 4)).unwrap(),
                4,
                vec![MeasureSpec::new("fldfrc", "mean").unwrap()],
            )
            .unwrap(),
            grid: GridSpec { nx: 2, ny: 2 },
            timeout_secs: 0,
        }
    }

    /// Source file where day `d` (0-based) holds grid values all equal to `d`.
    fn write_source(ctx: &StageContext, year: i32, days: usize) {
        let id = ArtifactId::extracted_source("src", "M1", "ssp245", "r1", year).unwrap();
        let path = ctx.abs(&id);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut data = Vec::new();
        for day in 0..days {
            for _ in 0..ctx.grid.cells() {
                data.extend_from_slice(&(day as f32).to_le_bytes());
            }
        }
        fs::write(path, data).unwrap();
    }

    #[test]
    fn test_staging_writes_full_input_set() {
        let dir = tempfile::tempdir().unwrap();
        let c = ctx(dir.path());
        write_source(&c, 2015, 4);
        let mv = ModelVariant::new("M1", "r1").unwrap();
        let batch = c.manifest.batches_for("ssp245", &mv).unwrap().remove(0);

        let workdir = stage_batch_inputs(&c, &batch).unwrap();
        assert!(workdir.join("run.sh").exists());
        assert!(workdir.join("runoff.ctl").exists());
        for id in batch.expected_inputs().unwrap() {
            assert!(c.abs(&id).exists(), "missing {:?}", encode(&id));
        }
    }

    #[test]
    fn test_daily_record_slices_correct_day() {
        let dir = tempfile::tempdir().unwrap();
        let c = ctx(dir.path());
        write_source(&c, 2015, 4);
        let mv = ModelVariant::new("M1", "r1").unwrap();
        let batch = c.manifest.batches_for("ssp245", &mv).unwrap().remove(0);

        stage_batch_inputs(&c, &batch).unwrap();

        // Jan 3rd is day index 2; every cell should read 2.0.
        let id = ArtifactId::cama_input(
            "M1",
            "ssp245",
            "r1",
            0,
            InputFile::DailyRunoff {
                date: ymd(2015, 1, 3),
            },
        )
        .unwrap();
        let bytes = fs::read(c.abs(&id)).unwrap();
        assert_eq!(bytes.len(), c.grid.cells() * 4);
        for chunk in bytes.chunks_exact(4) {
            assert_eq!(f32::from_le_bytes(chunk.try_into().unwrap()), 2.0);
        }
    }

    #[test]
    fn test_truncated_source_is_execution_error() {
        let dir = tempfile::tempdir().unwrap();
        let c = ctx(dir.path());
        // Only two days of data for a four-day batch.
        write_source(&c, 2015, 2);
        let mv = ModelVariant::new("M1", "r1").unwrap();
        let batch = c.manifest.batches_for("ssp245", &mv).unwrap().remove(0);

        let err = stage_batch_inputs(&c, &batch).unwrap_err();
        assert!(matches!(err, PipelineError::Execution { .. }));
        assert!(err.to_string().contains("truncated"));
    }

    #[test]
    fn test_staging_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let c = ctx(dir.path());
        write_source(&c, 2015, 4);
        let mv = ModelVariant::new("M1", "r1").unwrap();
        let batch = c.manifest.batches_for("ssp245", &mv).unwrap().remove(0);

        let workdir = stage_batch_inputs(&c, &batch).unwrap();
        let first = fs::read(workdir.join("run.sh")).unwrap();
        stage_batch_inputs(&c, &batch).unwrap();
        let second = fs::read(workdir.join("run.sh")).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_grads_date_format() {
        assert_eq!(grads_date(ymd(2015, 1, 1)), "01jan2015");
        assert_eq!(grads_date(ymd(2099, 12, 31)), "31dec2099");
    }
}
