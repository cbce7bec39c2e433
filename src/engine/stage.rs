//! Stage Runner: a bounded worker pool executing one stage's task per tuple.
//!
//! Every per-sample failure (error, missing declared output, or panic) is
//! caught here, logged, recorded in the `StageReport`, and the sample is
//! simply not forwarded. Nothing escapes to other samples or stages.

use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use futures::FutureExt;
use log::{debug, info, warn};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

use crate::engine::task::{StageTask, TaskContext, WorkArea};
use crate::utils::streams::{Artifacts, Channel, SampleKey, Tuple, TupleReceiver};


#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Drop the failed sample from the stage output and carry on.
    #[default]
    IsolateAndSkip,
}

/// Static stage descriptor. Wiring lives in the graph, not here.
#[derive(Debug, Clone, PartialEq)]
pub struct StageSpec {
    pub name: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub max_concurrency: usize,
    pub failure_policy: FailurePolicy,
}

impl StageSpec {
    pub fn new(name: impl Into<String>) -> Self {
        StageSpec {
            name: name.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            max_concurrency: 1,
            failure_policy: FailurePolicy::IsolateAndSkip,
        }
    }

    pub fn inputs(mut self, names: &[&str]) -> Self {
        self.inputs = names.iter().map(|n| n.to_string()).collect();
        self
    }

    pub fn outputs(mut self, names: &[&str]) -> Self {
        self.outputs = names.iter().map(|n| n.to_string()).collect();
        self
    }

    pub fn max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }
}


#[derive(Debug, Clone, PartialEq)]
pub struct SampleFailure {
    pub stage: String,
    pub key: SampleKey,
    pub error: String,
}

#[derive(Debug, Clone, Default)]
pub struct StageReport {
    pub stage: String,
    pub succeeded: Vec<SampleKey>,
    pub failures: Vec<SampleFailure>,
    pub aborted: bool,
}


/// Resolves once the abort flag is raised. A dropped sender means no abort can come.
pub(crate) async fn abort_requested(abort: &mut watch::Receiver<bool>) {
    if abort.wait_for(|raised| *raised).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Runs a stage until its input closes (or abort), then closes `output`.
///
/// # Arguments
///
/// * `spec` - Stage descriptor; `max_concurrency` caps in-flight tasks.
/// * `task` - External task invoked per sample.
/// * `input` - Stage input stream.
/// * `output` - Channel receiving one tuple per successful sample.
/// * `work_root` - Root of the per-stage, per-sample work areas.
/// * `abort` - Shared abort flag, checked before each dequeue.
///
/// # Returns
/// StageReport of successes and isolated failures.
pub async fn run_stage(
    spec: Arc<StageSpec>,
    task: Arc<dyn StageTask>,
    mut input: TupleReceiver,
    output: Channel,
    work_root: PathBuf,
    mut abort: watch::Receiver<bool>,
) -> StageReport {
    let mut report = StageReport {
        stage: spec.name.clone(),
        ..Default::default()
    };
    let semaphore = Arc::new(Semaphore::new(spec.max_concurrency.max(1)));
    let mut workers: JoinSet<(SampleKey, Result<()>)> = JoinSet::new();

    loop {
        // Holding a permit before dequeuing keeps tuples queued upstream
        // while all slots are busy.
        let permit = tokio::select! {
            biased;
            _ = abort_requested(&mut abort) => {
                report.aborted = true;
                break;
            }
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let tuple = tokio::select! {
            biased;
            _ = abort_requested(&mut abort) => {
                report.aborted = true;
                break;
            }
            tuple = input.recv() => match tuple {
                Some(tuple) => tuple,
                None => break,
            },
        };

        let stage_spec = spec.clone();
        let task = task.clone();
        let output = output.clone();
        let work_root = work_root.clone();
        workers.spawn(async move {
            let _permit = permit;
            let key = tuple.key.clone();
            let result = match execute_one(&stage_spec, task.as_ref(), tuple, &work_root).await {
                Ok(out) => {
                    output.send(out).await;
                    Ok(())
                }
                Err(e) => Err(e),
            };
            (key, result)
        });

        while let Some(joined) = workers.try_join_next() {
            record(&spec, &mut report, joined);
        }
    }

    if report.aborted {
        warn!("Stage {} aborted; draining {} in-flight task(s)", spec.name, workers.len());
    }
    while let Some(joined) = workers.join_next().await {
        record(&spec, &mut report, joined);
    }
    output.close();

    info!(
        "Stage {} finished: {} succeeded, {} failed",
        spec.name,
        report.succeeded.len(),
        report.failures.len()
    );
    report
}

fn record(
    spec: &StageSpec,
    report: &mut StageReport,
    joined: Result<(SampleKey, Result<()>), tokio::task::JoinError>,
) {
    match joined {
        Ok((key, Ok(()))) => {
            debug!("{} finished {}", spec.name, key);
            report.succeeded.push(key);
        }
        Ok((key, Err(e))) => match spec.failure_policy {
            FailurePolicy::IsolateAndSkip => {
                warn!("{} failed for sample {}; skipping it downstream: {:#}", spec.name, key, e);
                report.failures.push(SampleFailure {
                    stage: spec.name.clone(),
                    key,
                    error: format!("{:#}", e),
                });
            }
        },
        // execute_one catches task panics, so this is a bug in the runner itself.
        Err(e) => warn!("{} worker did not complete: {}", spec.name, e),
    }
}

/// One sample through one stage. The output key is always the input key.
async fn execute_one(
    spec: &StageSpec,
    task: &dyn StageTask,
    tuple: Tuple,
    work_root: &Path,
) -> Result<Tuple> {
    let Tuple { key, artifacts } = tuple;
    let inputs = artifacts.select(&spec.inputs)?;
    let work = WorkArea::create(work_root, &spec.name, &key).await?;
    let ctx = TaskContext {
        stage: spec.name.clone(),
        key: key.clone(),
        inputs,
        outputs: spec.outputs.clone(),
        work,
    };

    let outcome = match AssertUnwindSafe(task.run(&ctx)).catch_unwind().await {
        Ok(result) => result.and_then(|produced| declared_outputs(spec, produced)),
        Err(panic) => Err(anyhow!("task panicked: {}", panic_message(panic.as_ref()))),
    };

    match outcome {
        Ok(outputs) => {
            ctx.work.finish();
            Ok(Tuple::new(key, outputs))
        }
        Err(e) => {
            ctx.work.discard().await;
            Err(e)
        }
    }
}

/// Keeps exactly the declared outputs; any one missing fails the sample.
fn declared_outputs(spec: &StageSpec, produced: Artifacts) -> Result<Artifacts> {
    let missing: Vec<&str> = spec
        .outputs
        .iter()
        .map(String::as_str)
        .filter(|name| !produced.contains(name))
        .collect();
    if !missing.is_empty() {
        return Err(anyhow!("task did not produce declared output(s) {:?}", missing));
    }
    produced.select(&spec.outputs)
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
