//! External task contract and the per-sample scoped work area it runs in.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::warn;
use tempfile::TempDir;

use crate::utils::streams::{Artifacts, SampleKey};


/// One stage's external work for one sample.
///
/// Implementations either produce every declared output artifact and return
/// them, or return an error. They must not rely on the engine to clean up
/// anything outside `ctx.work`.
#[async_trait]
pub trait StageTask: Send + Sync {
    async fn run(&self, ctx: &TaskContext) -> Result<Artifacts>;
}


/// What a task sees for one invocation.
pub struct TaskContext {
    pub stage: String,
    pub key: SampleKey,
    pub inputs: Artifacts,
    pub outputs: Vec<String>,
    pub work: WorkArea,
}

impl TaskContext {
    /// Path for a declared output, named `<key><suffix>` inside the output dir.
    pub fn output_path(&self, suffix: &str) -> PathBuf {
        self.work.output_dir().join(format!("{}{}", self.key, suffix))
    }

    pub fn scratch_path(&self, file_name: &str) -> PathBuf {
        self.work.scratch_dir().join(file_name)
    }
}


/// Output directory `<root>/<stage>/<key>/` plus a scratch dir inside it.
/// Scratch goes away on drop; the output dir is removed by `discard`.
pub struct WorkArea {
    output_dir: PathBuf,
    scratch: TempDir,
}

impl WorkArea {
    /// Creates a fresh area, wiping anything left from an earlier run.
    ///
    /// # Arguments
    ///
    /// * `root` - Base work directory for the run.
    /// * `stage` - Stage name.
    /// * `key` - Sample key.
    ///
    /// # Returns
    /// WorkArea with both directories present.
    pub async fn create(root: &Path, stage: &str, key: &SampleKey) -> Result<WorkArea> {
        if !key.is_path_safe() {
            return Err(anyhow!("Sample key '{}' cannot name a work directory", key));
        }
        let output_dir = root.join(stage).join(key.as_str());
        if tokio::fs::try_exists(&output_dir).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&output_dir)
                .await
                .with_context(|| format!("Failed to clear {}", output_dir.display()))?;
        }
        tokio::fs::create_dir_all(&output_dir)
            .await
            .with_context(|| format!("Failed to create {}", output_dir.display()))?;
        let scratch = tempfile::Builder::new()
            .prefix(".scratch_")
            .tempdir_in(&output_dir)
            .with_context(|| format!("Failed to create scratch in {}", output_dir.display()))?;
        Ok(WorkArea { output_dir, scratch })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn scratch_dir(&self) -> &Path {
        self.scratch.path()
    }

    /// Drops scratch, keeping the outputs.
    pub fn finish(self) {
        let WorkArea { output_dir, scratch } = self;
        if let Err(e) = scratch.close() {
            warn!("Failed to remove scratch under {}: {}", output_dir.display(), e);
        }
    }

    /// Removes scratch and every partial output.
    pub async fn discard(self) {
        let WorkArea { output_dir, scratch } = self;
        drop(scratch);
        if let Err(e) = tokio::fs::remove_dir_all(&output_dir).await {
            warn!("Failed to remove partial outputs in {}: {}", output_dir.display(), e);
        }
    }
}
