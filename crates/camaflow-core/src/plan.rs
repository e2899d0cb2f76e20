//! Batch planning: splitting a date range into schedulable chunks.
//!
//! Planning is deterministic and idempotent: the same (range, batch size)
//! always yields the same batch indices and date sets, so re-planning never
//! renames a batch that already executed. A rerun with a different batch
//! size is a plan conflict, not a silent re-layout.

use chrono::{Datelike, Days, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::catalog::Catalog;
use crate::error::{PipelineError, Result};
use crate::ident::{ArtifactId, ArtifactKind, InputFile, ModelVariant, TupleKey};

/// Inclusive range of simulation dates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        if end < start {
            return Err(PipelineError::Configuration(format!(
                "date range end {end} precedes start {start}"
            )));
        }
        Ok(Self { start, end })
    }

    /// Number of days covered, inclusive of both endpoints.
    pub fn num_days(&self) -> u64 {
        (self.end - self.start).num_days() as u64 + 1
    }

    /// Distinct calendar years touched by the range, ascending.
    pub fn years(&self) -> Vec<i32> {
        (self.start.year()..=self.end.year()).collect()
    }
}

/// A contiguous chunk of simulation dates processed as one routing-model
/// invocation. Owns the CamaInput/CamaOutput artifacts under its batch
/// directory.
///
/// Only [`plan_batches`] constructs these, which guarantees every batch
/// covers at least one date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub model: String,
    pub scenario: String,
    pub variant: String,
    /// 0-based chronological index, stable across re-planning.
    pub index: u32,
    /// Ordered dates this batch covers; never empty.
    dates: Vec<NaiveDate>,
}

impl Batch {
    /// The work-unit key for this batch.
    pub fn tuple(&self) -> TupleKey {
        TupleKey::new(
            self.model.clone(),
            self.scenario.clone(),
            self.variant.clone(),
            Some(self.index),
        )
    }

    /// Ordered dates this batch covers.
    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn start(&self) -> NaiveDate {
        self.dates[0]
    }

    pub fn end(&self) -> NaiveDate {
        self.dates[self.dates.len() - 1]
    }

    /// Distinct calendar years this batch touches, ascending.
    pub fn years(&self) -> Vec<i32> {
        let mut years: Vec<i32> = self.dates.iter().map(|d| d.year()).collect();
        years.dedup();
        years
    }

    /// The full CamaInput set this batch expects: run script, control file,
    /// and one daily record per date.
    pub fn expected_inputs(&self) -> Result<Vec<ArtifactId>> {
        let mut ids = vec![
            ArtifactId::cama_input(
                &self.model,
                &self.scenario,
                &self.variant,
                self.index,
                InputFile::RunScript,
            )?,
            ArtifactId::cama_input(
                &self.model,
                &self.scenario,
                &self.variant,
                self.index,
                InputFile::ControlFile,
            )?,
        ];
        for date in &self.dates {
            ids.push(ArtifactId::cama_input(
                &self.model,
                &self.scenario,
                &self.variant,
                self.index,
                InputFile::DailyRunoff { date: *date },
            )?);
        }
        Ok(ids)
    }

    /// The full CamaOutput set this batch expects for one output measure:
    /// one `.bin` per year it touches.
    pub fn expected_outputs(&self, output_measure: &str) -> Result<Vec<ArtifactId>> {
        self.years()
            .into_iter()
            .map(|year| {
                ArtifactId::cama_output(
                    &self.model,
                    &self.scenario,
                    &self.variant,
                    self.index,
                    output_measure,
                    year,
                )
            })
            .collect()
    }
}

/// Split `range` into contiguous, non-overlapping chunks of
/// `batch_size_days` (the last chunk may be shorter), indexed 0-based in
/// chronological order.
pub fn plan_batches(
    mv: &ModelVariant,
    scenario: &str,
    range: DateRange,
    batch_size_days: u32,
) -> Result<Vec<Batch>> {
    if batch_size_days == 0 {
        return Err(PipelineError::Configuration(
            "batch_size_days must be at least 1".to_string(),
        ));
    }
    crate::ident::validate_token("scenario", scenario)?;

    let mut batches = Vec::new();
    let mut cursor = range.start;
    let mut index = 0u32;
    while cursor <= range.end {
        let mut dates = Vec::with_capacity(batch_size_days as usize);
        let mut day = cursor;
        while day <= range.end && dates.len() < batch_size_days as usize {
            dates.push(day);
            day = day
                .checked_add_days(Days::new(1))
                .ok_or_else(|| PipelineError::Configuration("date overflow".to_string()))?;
        }
        batches.push(Batch {
            model: mv.model.clone(),
            scenario: scenario.to_string(),
            variant: mv.variant.clone(),
            index,
            dates,
        });
        cursor = day;
        index += 1;
    }
    Ok(batches)
}

/// Check a fresh plan against batches already laid out on disk.
///
/// Artifacts from an earlier run with a different batch size show up as
/// batch indices outside the plan or daily records on dates the planned
/// batch does not cover. Either is a `PlanConflict`; silently creating
/// overlapping batch directories would corrupt the ledger.
pub fn check_plan_conflict(batches: &[Batch], catalog: &Catalog) -> Result<()> {
    if batches.is_empty() {
        return Ok(());
    }
    let model = &batches[0].model;
    let scenario = &batches[0].scenario;
    let variant = &batches[0].variant;
    let tuple = TupleKey::new(model.clone(), scenario.clone(), variant.clone(), None);

    let index_of = |b: u32| batches.iter().find(|batch| batch.index == b);

    let matches_tuple = |m: &str, s: &str, v: &str| m == model && s == scenario && v == variant;

    for kind in [ArtifactKind::CamaInput, ArtifactKind::CamaOutput] {
        for id in catalog.ids_of_kind(kind) {
            let (batch, date) = match id {
                ArtifactId::CamaInput {
                    model: m,
                    scenario: s,
                    variant: v,
                    batch,
                    file,
                } if matches_tuple(m, s, v) => {
                    let date = match file {
                        InputFile::DailyRunoff { date } => Some(*date),
                        _ => None,
                    };
                    (*batch, date)
                }
                ArtifactId::CamaOutput {
                    model: m,
                    scenario: s,
                    variant: v,
                    batch,
                    ..
                } if matches_tuple(m, s, v) => (*batch, None),
                _ => continue,
            };

            let Some(planned) = index_of(batch) else {
                return Err(PipelineError::PlanConflict {
                    tuple: tuple.to_string(),
                    detail: format!(
                        "batch index {batch} exists on disk but the plan has {} batches; \
                         was batch_size_days changed?",
                        batches.len()
                    ),
                });
            };
            if let Some(date) = date {
                if !planned.dates.contains(&date) {
                    return Err(PipelineError::PlanConflict {
                        tuple: tuple.to_string(),
                        detail: format!(
                            "batch {batch} on disk covers {date} but the planned batch \
                             covers {}..={}; was batch_size_days changed?",
                            planned.start(),
                            planned.end()
                        ),
                    });
                }
            }
        }
    }
    Ok(())
}
