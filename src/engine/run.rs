//! Run Orchestrator: seeds a built graph with discovered samples, drives it
//! to completion and summarises the outcome.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use log::{info, warn};

use crate::config::defs::{PipelineError, FAILURE_MANIFEST};
use crate::engine::aggregate::AggregateReport;
use crate::engine::graph::{Graph, RunContext};
use crate::engine::stage::SampleFailure;
use crate::utils::streams::{SampleKey, Tuple};


#[derive(Debug)]
pub struct RunSummary {
    /// False only when the run was aborted; per-sample failures do not count.
    pub success: bool,
    pub aborted: bool,
    pub duration: Duration,
    pub out_dir: PathBuf,
    pub samples: usize,
    pub failures: Vec<SampleFailure>,
    /// Per aggregate, seeded keys with no row in the file.
    pub absent: BTreeMap<String, Vec<SampleKey>>,
    pub aggregates: Vec<AggregateReport>,
    pub manifest: Option<PathBuf>,
}

impl RunSummary {
    pub fn log(&self) {
        info!(
            "Run {} in {:.1}s: {} sample(s), {} failure(s); outputs in {}",
            if self.success { "succeeded" } else { "was aborted" },
            self.duration.as_secs_f64(),
            self.samples,
            self.failures.len(),
            self.out_dir.display()
        );
        for aggregate in &self.aggregates {
            match &aggregate.path {
                Some(path) => info!("{}: {} row(s) -> {}", aggregate.name, aggregate.keys.len(), path.display()),
                None => warn!("{}: no rows, file not written", aggregate.name),
            }
        }
        for (name, keys) in &self.absent {
            if !keys.is_empty() {
                let keys: Vec<&str> = keys.iter().map(SampleKey::as_str).collect();
                warn!("{} is missing sample(s): {}", name, keys.join(", "));
            }
        }
        if let Some(manifest) = &self.manifest {
            warn!("Per-sample failures listed in {}", manifest.display());
        }
    }
}


/// Runs `graph` over `samples`.
///
/// # Arguments
///
/// * `graph` - Validated pipeline graph.
/// * `samples` - Seed tuples from discovery.
/// * `origin` - Where the samples came from, for the NoSamplesFound message.
/// * `out_dir` - Run output directory; the failure manifest is written here.
/// * `ctx` - Work root, channel capacity and abort flag.
///
/// # Returns
/// RunSummary, or a run-level PipelineError (no samples, aggregate write).
pub async fn execute(
    graph: &Graph,
    samples: Vec<Tuple>,
    origin: &str,
    out_dir: &Path,
    ctx: RunContext,
) -> Result<RunSummary, PipelineError> {
    if samples.is_empty() {
        return Err(PipelineError::NoSamplesFound(origin.to_string()));
    }
    let start = Instant::now();
    let seeded: BTreeSet<SampleKey> = samples.iter().map(|t| t.key.clone()).collect();
    info!("Running {} over {} sample(s)", graph.node_names().join(" -> "), seeded.len());

    let report = graph.run(samples, ctx).await?;
    let aborted = report.aborted();

    let mut failures: Vec<SampleFailure> = report
        .stages
        .iter()
        .flat_map(|s| s.failures.iter().cloned())
        .collect();
    failures.sort_by(|a, b| a.key.cmp(&b.key).then_with(|| a.stage.cmp(&b.stage)));

    let absent = report
        .aggregates
        .iter()
        .map(|a| {
            let present: BTreeSet<&SampleKey> = a.keys.iter().collect();
            let missing = seeded.iter().filter(|k| !present.contains(k)).cloned().collect();
            (a.name.clone(), missing)
        })
        .collect();

    let manifest = if failures.is_empty() {
        None
    } else {
        let path = out_dir.join(FAILURE_MANIFEST);
        match write_failure_manifest(&path, &failures) {
            Ok(()) => Some(path),
            Err(e) => {
                warn!("Could not write {}: {}", path.display(), e);
                None
            }
        }
    };

    Ok(RunSummary {
        success: !aborted,
        aborted,
        duration: start.elapsed(),
        out_dir: out_dir.to_path_buf(),
        samples: seeded.len(),
        failures,
        absent,
        aggregates: report.aggregates,
        manifest,
    })
}

fn write_failure_manifest(path: &Path, failures: &[SampleFailure]) -> std::io::Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    writeln!(writer, "sample\tstage\terror")?;
    for failure in failures {
        let error = failure.error.replace(['\n', '\t'], " ");
        writeln!(writer, "{}\t{}\t{}", failure.key, failure.stage, error)?;
    }
    writer.flush()
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use tempfile::tempdir;
    use crate::engine::aggregate::AggregateSpec;
    use crate::engine::graph::GraphBuilder;
    use crate::engine::stage::StageSpec;
    use crate::engine::task::{StageTask, TaskContext};
    use crate::utils::streams::Artifacts;

    struct FailFor(&'static str);

    #[async_trait]
    impl StageTask for FailFor {
        async fn run(&self, ctx: &TaskContext) -> Result<Artifacts> {
            if ctx.key.as_str() == self.0 {
                return Err(anyhow!("exit status 2\nsee log"));
            }
            let path = ctx.output_path(".row");
            tokio::fs::write(&path, format!("{}\tok\n", ctx.key)).await?;
            Ok([("row", path)].into_iter().collect())
        }
    }

    fn graph(dir: &Path) -> Graph {
        GraphBuilder::new()
            .source("src", &["r"])
            .stage(StageSpec::new("s").inputs(&["r"]).outputs(&["row"]), Arc::new(FailFor("B")), "src", "rows")
            .aggregate(
                AggregateSpec {
                    name: "rows".to_string(),
                    artifact: "row".to_string(),
                    path: dir.join("rows.tsv"),
                    has_header: false,
                },
                "rows",
            )
            .build()
            .unwrap()
    }

    fn seeds(keys: &[&str]) -> Vec<Tuple> {
        keys.iter()
            .map(|k| Tuple::new(SampleKey::from(*k), [("r", format!("{}.fq", k))].into_iter().collect()))
            .collect()
    }

    #[tokio::test]
    async fn test_execute_reports_failures_without_failing_run() {
        let dir = tempdir().unwrap();
        let g = graph(dir.path());
        let summary = execute(&g, seeds(&["A", "B", "C"]), "test", dir.path(), RunContext::new(dir.path().join("work")))
            .await
            .unwrap();

        assert!(summary.success);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.absent["rows"], vec![SampleKey::from("B")]);
        let manifest = std::fs::read_to_string(summary.manifest.unwrap()).unwrap();
        assert_eq!(manifest, "sample\tstage\terror\nB\ts\texit status 2 see log\n");
    }

    #[tokio::test]
    async fn test_execute_without_samples_is_fatal() {
        let dir = tempdir().unwrap();
        let g = graph(dir.path());
        let result = execute(&g, Vec::new(), "reads/*.fq", dir.path(), RunContext::new(dir.path().to_path_buf())).await;
        assert!(matches!(result, Err(PipelineError::NoSamplesFound(p)) if p == "reads/*.fq"));
    }
}
