//! camaflow-core: the naming contract and pipeline state engine.
//!
//! The climate-flood pipeline has no database; the file system under one
//! root directory is the ledger. This crate defines the pieces that make
//! that workable:
//!
//! - [`ident`]: typed artifact identifiers, validated at construction
//! - [`codec`]: lossless, injective identifier <-> path templates
//! - [`catalog`]: immutable snapshots of what exists on disk
//! - [`plan`]: deterministic, idempotent batch chunking of date ranges
//! - [`graph`]: the fixed stage ordering and pure readiness computation
//! - [`manifest`]: the declared scope of a run, persisted at the root
//! - [`error`]: the failure taxonomy shared by all of the above

pub mod catalog;
pub mod codec;
pub mod error;
pub mod graph;
pub mod ident;
pub mod manifest;
pub mod plan;
pub mod telemetry;

pub use catalog::{Catalog, CatalogEntry};
pub use codec::{batch_dir_name, decode, decode_any, encode};
pub use error::{DecodeError, PipelineError, Result};
pub use graph::{DependencyGraph, Stage, StageSpec};
pub use ident::{ArtifactId, ArtifactKind, InputFile, ModelVariant, TupleKey};
pub use manifest::{MeasureSpec, RunManifest};
pub use plan::{check_plan_conflict, plan_batches, Batch, DateRange};
pub use telemetry::init_tracing;
