//! The routing-model capability interface and its CaMa-Flood implementation.
//!
//! The coordinator never inspects the routing model's internals; it only
//! needs to stage a batch working directory, launch an opaque external
//! process, and verify the expected outputs afterwards. Swapping the model
//! (or mocking it in tests) means implementing [`RoutingModel`].

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use camaflow_core::{encode, Batch, Catalog, PipelineError, Result, RunManifest};
use tokio::process::Command;
use tracing::debug;

/// Grid dimensions of the staged runoff records.
#[derive(Debug, Clone, Copy)]
pub struct GridSpec {
    pub nx: usize,
    pub ny: usize,
}

impl GridSpec {
    pub fn cells(&self) -> usize {
        self.nx * self.ny
    }
}

/// Everything a stage needs to resolve paths and expectations.
#[derive(Debug, Clone)]
pub struct StageContext {
    /// Pipeline root; all artifact paths are relative to it.
    pub root: PathBuf,

    /// Scope of the current run.
    pub manifest: RunManifest,

    /// Grid of the staged daily records.
    pub grid: GridSpec,

    /// Timeout for one external model invocation; 0 disables the timeout.
    pub timeout_secs: u64,
}

impl StageContext {
    /// Absolute path of an artifact.
    pub fn abs(&self, id: &camaflow_core::ArtifactId) -> PathBuf {
        self.root.join(encode(id))
    }

    /// The batch working directory under `cama_inputs/`.
    pub fn workdir(&self, batch: &Batch) -> PathBuf {
        self.root
            .join(camaflow_core::codec::INPUTS_DIR)
            .join(camaflow_core::batch_dir_name(
                &batch.model,
                &batch.scenario,
                &batch.variant,
                batch.index,
            ))
    }
}

/// Result of one external model invocation.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    /// Exit code (0 = success, -1 = no code / spawn-level failure).
    pub exit_code: i32,

    /// Captured stdout.
    pub stdout: String,

    /// Captured stderr.
    pub stderr: String,

    /// Duration in milliseconds.
    pub duration_ms: u64,

    /// Whether the process itself reported success.
    pub success: bool,
}

impl ExecutionOutcome {
    /// Whether the invocation passed (exit code 0).
    ///
    /// Note this says nothing about outputs; completeness is verified
    /// separately against the catalog.
    pub fn passed(&self) -> bool {
        self.success && self.exit_code == 0
    }
}

/// Capability interface to the external hydrological routing model.
#[async_trait]
pub trait RoutingModel: Send + Sync {
    /// Stage the batch working directory; returns the workdir.
    async fn prepare(&self, ctx: &StageContext, batch: &Batch) -> Result<PathBuf>;

    /// Launch the external run in `workdir` and await it.
    async fn execute(
        &self,
        ctx: &StageContext,
        batch: &Batch,
        workdir: &Path,
    ) -> Result<ExecutionOutcome>;

    /// Whether the batch's full expected output set exists in the snapshot.
    fn verify(&self, ctx: &StageContext, batch: &Batch, catalog: &Catalog) -> Result<bool>;
}

/// Production implementation: CaMa-Flood driven by a per-batch `run.sh`.
#[derive(Debug, Default)]
pub struct CamaFloodModel;

#[async_trait]
impl RoutingModel for CamaFloodModel {
    async fn prepare(&self, ctx: &StageContext, batch: &Batch) -> Result<PathBuf> {
        crate::stage_inputs::stage_batch_inputs(ctx, batch)
    }

    async fn execute(
        &self,
        ctx: &StageContext,
        batch: &Batch,
        workdir: &Path,
    ) -> Result<ExecutionOutcome> {
        let start = Instant::now();
        let tuple = batch.tuple();

        debug!(tuple = %tuple, workdir = %workdir.display(), "launching routing model");

        let child = Command::new("bash")
            .arg("run.sh")
            .current_dir(workdir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| PipelineError::Execution {
                tuple: tuple.to_string(),
                reason: format!("failed to spawn run.sh: {e}"),
            })?;

        let output = if ctx.timeout_secs > 0 {
            tokio::time::timeout(
                std::time::Duration::from_secs(ctx.timeout_secs),
                child.wait_with_output(),
            )
            .await
            .map_err(|_| PipelineError::Execution {
                tuple: tuple.to_string(),
                reason: format!("timed out after {} seconds", ctx.timeout_secs),
            })?
            .map_err(PipelineError::Io)?
        } else {
            child.wait_with_output().await.map_err(PipelineError::Io)?
        };

        Ok(ExecutionOutcome {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration_ms: start.elapsed().as_millis() as u64,
            success: output.status.success(),
        })
    }

    fn verify(&self, ctx: &StageContext, batch: &Batch, catalog: &Catalog) -> Result<bool> {
        let expected = ctx.manifest.expected_outputs(batch)?;
        Ok(catalog.exists_all(&expected))
    }
}
