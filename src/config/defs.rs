use std::collections::HashMap;
use std::path::PathBuf;

use lazy_static::lazy_static;
use log::LevelFilter;
use thiserror::Error;

use crate::cli::Arguments;

// External software
pub const CLUMPIFY_TAG: &str = "clumpify.sh";
pub const FASTP_TAG: &str = "fastp";
pub const BWA_TAG: &str = "bwa";
pub const SAMTOOLS_TAG: &str = "samtools";
pub const BCFTOOLS_TAG: &str = "bcftools";
pub const SEQKIT_TAG: &str = "seqkit";
pub const CLUSTER_ASSIGN_TAG: &str = "cluster-assign";
pub const SPOTYPING_TAG: &str = "SpoTyping.py";

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SamtoolsSubcommand {
    Sort,
    Index,
    Coverage,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BcftoolsSubcommand {
    Mpileup,
    Call,
    Index,
    Consensus,
    Filter,
    Csq,
}

impl SamtoolsSubcommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            SamtoolsSubcommand::Sort => "sort",
            SamtoolsSubcommand::Index => "index",
            SamtoolsSubcommand::Coverage => "coverage",
        }
    }
}

impl BcftoolsSubcommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            BcftoolsSubcommand::Mpileup => "mpileup",
            BcftoolsSubcommand::Call => "call",
            BcftoolsSubcommand::Index => "index",
            BcftoolsSubcommand::Consensus => "consensus",
            BcftoolsSubcommand::Filter => "filter",
            BcftoolsSubcommand::Csq => "csq",
        }
    }
}

// Stage names
pub const DEDUP_STAGE: &str = "dedup";
pub const TRIM_STAGE: &str = "trim";
pub const MAP_STAGE: &str = "map";
pub const VARCALL_STAGE: &str = "varcall";
pub const STATS_STAGE: &str = "consensus_stats";
pub const FILTER_STAGE: &str = "filter_annotate";
pub const CLUSTER_STAGE: &str = "cluster_assign";
pub const SPOLIGO_STAGE: &str = "spoligotype";

// Channel names
pub const READS_CHANNEL: &str = "reads";
pub const DEDUPED_CHANNEL: &str = "deduped";
pub const TRIMMED_CHANNEL: &str = "trimmed";
pub const MAPPED_CHANNEL: &str = "mapped";
pub const CALLED_CHANNEL: &str = "called";
pub const BAM_VCF_JOIN: &str = "bam_vcf";
pub const SUMMARISED_CHANNEL: &str = "summarised";
pub const VCF_STATS_JOIN: &str = "vcf_stats";
pub const FILTERED_CHANNEL: &str = "filtered";
pub const CLUSTERED_CHANNEL: &str = "clustered";
pub const SPOLIGOTYPED_CHANNEL: &str = "spoligotyped";

// Artifact names
pub const READ_1: &str = "read_1";
pub const READ_2: &str = "read_2";
pub const DEDUP_1: &str = "dedup_1";
pub const DEDUP_2: &str = "dedup_2";
pub const TRIMMED_1: &str = "trimmed_1";
pub const TRIMMED_2: &str = "trimmed_2";
pub const BAM: &str = "bam";
pub const VCF: &str = "vcf";
pub const COVERAGE_STATS: &str = "coverage_stats";
pub const CONSENSUS_FASTA: &str = "consensus_fasta";
pub const ANNOTATED_VCF: &str = "annotated_vcf";
pub const CLUSTER_ROW: &str = "cluster_row";
pub const SPOLIGOTYPE_ROW: &str = "spoligotype_row";

// Aggregate outputs
pub const CLUSTER_TABLE: &str = "cluster_assignments.tsv";
pub const COMBINED_ALIGNMENT: &str = "combined_alignment.fasta";
pub const SPOLIGOTYPE_TABLE: &str = "spoligotypes.tsv";
pub const FAILURE_MANIFEST: &str = "failed_samples.tsv";
pub const WORK_DIR: &str = "work";

// Static Parameters
pub const DEFAULT_CHANNEL_BUFFER: usize = 64;
pub const TRIM_MIN_LENGTH: usize = 50;
pub const TRIM_QUAL_PHRED: u8 = 20;
pub const STDERR_TAIL_LINES: usize = 20;

lazy_static! {
    pub static ref STAGE_CONCURRENCY: HashMap<&'static str, usize> = {
        let mut m = HashMap::new();
        m.insert(DEDUP_STAGE, 2);
        m.insert(TRIM_STAGE, 4);
        m.insert(MAP_STAGE, 1);
        m.insert(VARCALL_STAGE, 2);
        m.insert(STATS_STAGE, 4);
        m.insert(FILTER_STAGE, 4);
        m.insert(CLUSTER_STAGE, 4);
        m.insert(SPOLIGO_STAGE, 2);
        m
    };
}


pub struct RunConfig {
    pub cwd: PathBuf,
    pub out_dir: PathBuf,
    pub args: Arguments,
    pub max_cores: usize,
    pub log_level: LevelFilter,
}

impl RunConfig {
    /// Resolves the concurrency bound for a stage: CLI override first, then the default table.
    ///
    /// # Arguments
    ///
    /// * `stage` - Stage name.
    ///
    /// # Returns
    /// Result<usize, PipelineError>, error on a malformed override.
    pub fn stage_concurrency(&self, stage: &str) -> Result<usize, PipelineError> {
        for entry in &self.args.stage_concurrency {
            let (name, value) = entry.split_once('=').ok_or_else(|| {
                PipelineError::InvalidConfig(format!("Expected STAGE=N, got '{}'", entry))
            })?;
            if name.trim() == stage {
                return value.trim().parse::<usize>().map_err(|e| {
                    PipelineError::InvalidConfig(format!("Bad concurrency for {}: {}", stage, e))
                });
            }
        }
        Ok(STAGE_CONCURRENCY.get(stage).copied().unwrap_or(1))
    }
}


#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid pipeline graph: {0}")]
    GraphBuild(#[from] GraphBuildError),

    #[error("No samples found matching '{0}'")]
    NoSamplesFound(String),

    #[error("Failed to write aggregate {name} to {path}: {error}")]
    AggregateWrite {
        name: String,
        path: PathBuf,
        error: String,
    },

    #[error("Required tool not found on PATH: {0}")]
    ToolMissing(String),

    #[error("Tool {tool} failed: {error}")]
    ToolExecution { tool: String, error: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    IOError(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Error, PartialEq)]
pub enum GraphBuildError {
    #[error("duplicate node name '{0}'")]
    DuplicateName(String),

    #[error("channel '{0}' has more than one producer")]
    DuplicateProducer(String),

    #[error("node '{node}' reads channel '{channel}' which nothing produces")]
    UnknownChannel { node: String, channel: String },

    #[error("stage '{stage}' requires artifact '{artifact}' not carried by channel '{channel}'")]
    UnsatisfiedInput {
        stage: String,
        artifact: String,
        channel: String,
    },

    #[error("cycle detected through nodes {0:?}")]
    CycleDetected(Vec<String>),

    #[error("graph has no source channel")]
    NoSource,

    #[error("graph declares more than one source channel")]
    MultipleSources,

    #[error("stage '{0}' must allow at least one concurrent task")]
    InvalidConcurrency(String),

    #[error("join '{0}' needs at least two distinct upstream channels")]
    InvalidJoin(String),
}
