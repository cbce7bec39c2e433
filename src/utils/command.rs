/// Functions and structs for running external tools as stage tasks

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::debug;
use tokio::process::Command;

use crate::config::defs::{PipelineError, STDERR_TAIL_LINES};
use crate::engine::task::{StageTask, TaskContext};
use crate::utils::streams::Artifacts;


/// One piece of a command line, resolved per sample.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgPart {
    Lit(String),
    /// Path of a required input artifact.
    Input(&'static str),
    /// Path of a declared output artifact.
    Output(&'static str),
    /// File in the task's scratch directory.
    Scratch(&'static str),
    /// The sample key itself.
    Key,
    /// Parts resolved and glued into one argument, e.g. `in1=<path>`.
    Concat(Vec<ArgPart>),
}

pub fn lit(value: impl ToString) -> ArgPart {
    ArgPart::Lit(value.to_string())
}

pub fn concat(parts: Vec<ArgPart>) -> ArgPart {
    ArgPart::Concat(parts)
}

#[derive(Debug, Clone, PartialEq)]
pub enum StdoutTarget {
    Output(&'static str),
    Scratch(&'static str),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandStep {
    pub tool: &'static str,
    pub args: Vec<ArgPart>,
    pub stdout: Option<StdoutTarget>,
}

impl CommandStep {
    pub fn new(tool: &'static str, args: Vec<ArgPart>) -> Self {
        CommandStep { tool, args, stdout: None }
    }

    pub fn stdout_to(mut self, target: StdoutTarget) -> Self {
        self.stdout = Some(target);
        self
    }
}


/// Stage task made of external command steps run in order.
/// Each declared output lands at `<output dir>/<key><suffix>`.
#[derive(Debug, Clone)]
pub struct CommandTask {
    pub steps: Vec<CommandStep>,
    pub outputs: Vec<(&'static str, &'static str)>,
}

impl CommandTask {
    pub fn new(outputs: Vec<(&'static str, &'static str)>, steps: Vec<CommandStep>) -> Self {
        CommandTask { steps, outputs }
    }

    fn output_paths(&self, ctx: &TaskContext) -> Artifacts {
        self.outputs
            .iter()
            .map(|(name, suffix)| (*name, ctx.output_path(suffix)))
            .collect()
    }

    fn resolve(part: &ArgPart, ctx: &TaskContext, outputs: &Artifacts) -> Result<String> {
        let resolved = match part {
            ArgPart::Lit(value) => value.clone(),
            ArgPart::Input(name) => ctx.inputs.require(name)?.display().to_string(),
            ArgPart::Output(name) => outputs
                .get(name)
                .ok_or_else(|| anyhow!("Output '{}' has no file mapping", name))?
                .display()
                .to_string(),
            ArgPart::Scratch(file) => ctx.scratch_path(file).display().to_string(),
            ArgPart::Key => ctx.key.to_string(),
            ArgPart::Concat(parts) => parts
                .iter()
                .map(|p| Self::resolve(p, ctx, outputs))
                .collect::<Result<Vec<_>>>()?
                .concat(),
        };
        Ok(resolved)
    }

    /// Builds the argument vector for one step.
    ///
    /// # Arguments
    ///
    /// * `step` - Step to resolve.
    /// * `ctx` - Per-sample task context.
    /// * `outputs` - Declared output paths for this sample.
    ///
    /// # Returns
    /// Vec<String> argument list.
    pub fn arg_generator(step: &CommandStep, ctx: &TaskContext, outputs: &Artifacts) -> Result<Vec<String>> {
        step.args.iter().map(|part| Self::resolve(part, ctx, outputs)).collect()
    }

    async fn run_step(step: &CommandStep, ctx: &TaskContext, outputs: &Artifacts) -> Result<()> {
        let args = Self::arg_generator(step, ctx, outputs)?;
        debug!("[{} {}] {} {}", ctx.stage, ctx.key, step.tool, args.join(" "));

        let stdout = match &step.stdout {
            Some(target) => {
                let path = match target {
                    StdoutTarget::Output(name) => outputs.require(name)?.to_path_buf(),
                    StdoutTarget::Scratch(file) => ctx.scratch_path(file),
                };
                let file = std::fs::File::create(&path)
                    .with_context(|| format!("Failed to create {}", path.display()))?;
                Stdio::from(file)
            }
            None => Stdio::null(),
        };

        let child = Command::new(step.tool)
            .args(&args)
            .current_dir(ctx.work.scratch_dir())
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| anyhow!("Failed to spawn {}: {}. Is it installed?", step.tool, e))?;

        let output = child
            .wait_with_output()
            .await
            .with_context(|| format!("Failed waiting on {}", step.tool))?;
        if !output.status.success() {
            return Err(PipelineError::ToolExecution {
                tool: step.tool.to_string(),
                error: format!("exited with {}: {}", output.status, stderr_tail(&output.stderr)),
            }
            .into());
        }
        Ok(())
    }
}

#[async_trait]
impl StageTask for CommandTask {
    async fn run(&self, ctx: &TaskContext) -> Result<Artifacts> {
        let outputs = self.output_paths(ctx);
        for step in &self.steps {
            Self::run_step(step, ctx, &outputs).await?;
        }
        for (name, _) in &self.outputs {
            let path = outputs.require(name)?;
            if !tokio::fs::try_exists(path).await.unwrap_or(false) {
                return Err(anyhow!("Declared output '{}' missing at {}", name, path.display()));
            }
        }
        Ok(outputs)
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join(" | ")
}


/// Finds `tool` on PATH.
pub fn find_on_path(tool: &str) -> Option<PathBuf> {
    let candidate = Path::new(tool);
    if candidate.components().count() > 1 {
        return is_executable(candidate).then(|| candidate.to_path_buf());
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(tool))
        .find(|path| is_executable(path))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Checks every tool is installed before any sample is processed.
///
/// # Arguments
///
/// * `tools` - Tool tags the graph will invoke.
///
/// # Returns
/// Ok, or ToolMissing naming every absent tool.
pub fn check_tools<'a>(tools: impl IntoIterator<Item = &'a str>) -> Result<(), PipelineError> {
    let missing: Vec<&str> = tools
        .into_iter()
        .filter(|tool| find_on_path(tool).is_none())
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(PipelineError::ToolMissing(missing.join(", ")))
    }
}
