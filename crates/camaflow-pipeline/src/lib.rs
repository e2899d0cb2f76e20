//! camaflow-pipeline: run coordination on top of the camaflow-core ledger.
//!
//! - [`executor`]: the [`RoutingModel`] seam and the CaMa-Flood process runner
//! - [`stage_inputs`]: rendering per-batch run scripts, control files, and
//!   daily runoff records
//! - [`aggregate`]: completeness-gated folding of outputs into results
//! - [`coordinator`]: the pass that scans, dispatches, verifies, and folds

pub mod aggregate;
pub mod coordinator;
pub mod executor;
pub mod stage_inputs;

pub use aggregate::{AdjustmentBackend, Aggregator, FlatGridBackend};
pub use coordinator::{Coordinator, RunSummary, StatusReport, TupleState, TupleStatus};
pub use executor::{CamaFloodModel, ExecutionOutcome, GridSpec, RoutingModel, StageContext};
pub use stage_inputs::stage_batch_inputs;
