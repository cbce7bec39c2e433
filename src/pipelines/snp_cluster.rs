//! Batch SNP clustering: paired reads per sample through dedup, trimming,
//! mapping, variant calling, consensus/coverage, filtering/annotation and
//! cluster assignment, with batch-level cluster and alignment files.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::watch;

use crate::cli::Arguments;
use crate::config::defs::*;
use crate::engine::aggregate::AggregateSpec;
use crate::engine::join::JoinSpec;
use crate::engine::stage::StageSpec;
use crate::engine::{execute, Graph, GraphBuilder, RunContext, RunSummary, StageTask, TaskContext};
use crate::utils::command::{check_tools, concat, lit, ArgPart, CommandStep, CommandTask, StdoutTarget};
use crate::utils::file::{discover_samples, resolve_path};
use crate::utils::streams::Artifacts;
use crate::utils::system::compute_task_threads;


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Dedup,
    Trim,
    Map,
    VarCall,
    ConsensusStats,
    FilterAnnotate,
    ClusterAssign,
    Spoligotype,
}

impl Step {
    pub const ALL: [Step; 8] = [
        Step::Dedup,
        Step::Trim,
        Step::Map,
        Step::VarCall,
        Step::ConsensusStats,
        Step::FilterAnnotate,
        Step::ClusterAssign,
        Step::Spoligotype,
    ];

    pub fn stage_name(self) -> &'static str {
        match self {
            Step::Dedup => DEDUP_STAGE,
            Step::Trim => TRIM_STAGE,
            Step::Map => MAP_STAGE,
            Step::VarCall => VARCALL_STAGE,
            Step::ConsensusStats => STATS_STAGE,
            Step::FilterAnnotate => FILTER_STAGE,
            Step::ClusterAssign => CLUSTER_STAGE,
            Step::Spoligotype => SPOLIGO_STAGE,
        }
    }

    pub fn from_stage_name(name: &str) -> Option<Step> {
        Step::ALL.into_iter().find(|step| step.stage_name() == name)
    }

    /// External tools the step's task invokes.
    pub fn tools(self) -> &'static [&'static str] {
        match self {
            Step::Dedup => &[CLUMPIFY_TAG],
            Step::Trim => &[FASTP_TAG],
            Step::Map => &[BWA_TAG, SAMTOOLS_TAG],
            Step::VarCall => &[BCFTOOLS_TAG],
            Step::ConsensusStats => &[SAMTOOLS_TAG, BCFTOOLS_TAG, SEQKIT_TAG],
            Step::FilterAnnotate => &[BCFTOOLS_TAG],
            Step::ClusterAssign => &[CLUSTER_ASSIGN_TAG],
            Step::Spoligotype => &[SPOTYPING_TAG],
        }
    }
}

/// Supplies the task run by each stage of the graph.
pub type TaskFactory<'a> = dyn Fn(Step, &StageSpec) -> Arc<dyn StageTask> + 'a;


fn stage_spec(config: &RunConfig, step: Step, inputs: &[&str], outputs: &[&str]) -> Result<StageSpec, PipelineError> {
    Ok(StageSpec::new(step.stage_name())
        .inputs(inputs)
        .outputs(outputs)
        .max_concurrency(config.stage_concurrency(step.stage_name())?))
}

/// Declares and validates the pipeline.
///
/// # Arguments
///
/// * `config` - Run configuration; concurrency, output dir and optional branches come from here.
/// * `tasks` - Task for each stage.
///
/// # Returns
/// Validated Graph, or a GraphBuild/InvalidConfig error.
pub fn build_graph(config: &RunConfig, tasks: &TaskFactory) -> Result<Graph, PipelineError> {
    let dedup = stage_spec(config, Step::Dedup, &[READ_1, READ_2], &[DEDUP_1, DEDUP_2])?;
    let trim = stage_spec(config, Step::Trim, &[DEDUP_1, DEDUP_2], &[TRIMMED_1, TRIMMED_2])?;
    let map = stage_spec(config, Step::Map, &[TRIMMED_1, TRIMMED_2], &[BAM])?;
    let varcall = stage_spec(config, Step::VarCall, &[BAM], &[VCF])?;
    let stats = stage_spec(config, Step::ConsensusStats, &[BAM, VCF], &[COVERAGE_STATS, CONSENSUS_FASTA])?;
    let filter = stage_spec(config, Step::FilterAnnotate, &[VCF, COVERAGE_STATS], &[ANNOTATED_VCF])?;
    let cluster = stage_spec(config, Step::ClusterAssign, &[ANNOTATED_VCF], &[CLUSTER_ROW])?;
    let spoligo = stage_spec(config, Step::Spoligotype, &[TRIMMED_1, TRIMMED_2], &[SPOLIGOTYPE_ROW])?;
    let with_spoligotype = config.args.spoligotype;

    let cluster_table = AggregateSpec {
        name: "cluster_assignments".to_string(),
        artifact: CLUSTER_ROW.to_string(),
        path: config.out_dir.join(CLUSTER_TABLE),
        has_header: true,
    };
    let alignment = AggregateSpec {
        name: "combined_alignment".to_string(),
        artifact: CONSENSUS_FASTA.to_string(),
        path: config.out_dir.join(COMBINED_ALIGNMENT),
        has_header: false,
    };
    let spoligotypes = AggregateSpec {
        name: "spoligotypes".to_string(),
        artifact: SPOLIGOTYPE_ROW.to_string(),
        path: config.out_dir.join(SPOLIGOTYPE_TABLE),
        has_header: false,
    };

    let graph = GraphBuilder::new()
        .source(READS_CHANNEL, &[READ_1, READ_2])
        .stage(dedup.clone(), tasks(Step::Dedup, &dedup), READS_CHANNEL, DEDUPED_CHANNEL)
        .stage(trim.clone(), tasks(Step::Trim, &trim), DEDUPED_CHANNEL, TRIMMED_CHANNEL)
        .stage(map.clone(), tasks(Step::Map, &map), TRIMMED_CHANNEL, MAPPED_CHANNEL)
        .stage(varcall.clone(), tasks(Step::VarCall, &varcall), MAPPED_CHANNEL, CALLED_CHANNEL)
        .join(JoinSpec::new(BAM_VCF_JOIN, &[MAPPED_CHANNEL, CALLED_CHANNEL]), BAM_VCF_JOIN)
        .stage(stats.clone(), tasks(Step::ConsensusStats, &stats), BAM_VCF_JOIN, SUMMARISED_CHANNEL)
        .join(JoinSpec::new(VCF_STATS_JOIN, &[CALLED_CHANNEL, SUMMARISED_CHANNEL]), VCF_STATS_JOIN)
        .stage(filter.clone(), tasks(Step::FilterAnnotate, &filter), VCF_STATS_JOIN, FILTERED_CHANNEL)
        .stage(cluster.clone(), tasks(Step::ClusterAssign, &cluster), FILTERED_CHANNEL, CLUSTERED_CHANNEL)
        .optional_stage(
            with_spoligotype,
            spoligo.clone(),
            || tasks(Step::Spoligotype, &spoligo),
            TRIMMED_CHANNEL,
            SPOLIGOTYPED_CHANNEL,
        )
        .aggregate(cluster_table, CLUSTERED_CHANNEL)
        .aggregate(alignment, SUMMARISED_CHANNEL)
        .optional_aggregate(with_spoligotype, spoligotypes, SPOLIGOTYPED_CHANNEL)
        .build()?;
    Ok(graph)
}

/// Every external tool the graph's stages will call.
pub fn required_tools(graph: &Graph) -> BTreeSet<&'static str> {
    graph
        .stage_specs()
        .iter()
        .filter_map(|spec| Step::from_stage_name(&spec.name))
        .flat_map(|step| step.tools().iter().copied())
        .collect()
}


/// Runs the module with the real tool-backed tasks.
///
/// # Arguments
///
/// * `config` - Shared run configuration.
/// * `abort` - Raised to stop dequeuing new samples.
///
/// # Returns
/// RunSummary, or a run-level PipelineError.
pub async fn run(config: Arc<RunConfig>, abort: watch::Receiver<bool>) -> Result<RunSummary, PipelineError> {
    info!("\n-------------\n SNP Cluster\n-------------\n");

    let tasks = ToolTasks::new(config.clone())?;
    let graph = build_graph(&config, &|step, spec| tasks.task(step, spec))?;

    if config.args.skip_tool_check {
        warn!("Skipping tool presence check");
    } else {
        check_tools(required_tools(&graph))?;
    }

    run_with_graph(&config, &graph, abort).await
}

/// Discovers samples from `--reads` and drives `graph` over them.
pub async fn run_with_graph(
    config: &RunConfig,
    graph: &Graph,
    abort: watch::Receiver<bool>,
) -> Result<RunSummary, PipelineError> {
    let pattern = resolve_path(&config.args.reads, &config.cwd).display().to_string();
    let samples = discover_samples(&pattern)?;
    let ctx = RunContext {
        work_root: config.out_dir.join(WORK_DIR),
        channel_capacity: config.args.channel_buffer.max(1),
        abort,
    };
    execute(graph, samples, &pattern, &config.out_dir, ctx).await
}


/// Tool-backed tasks with the run's reference data resolved once.
pub struct ToolTasks {
    config: Arc<RunConfig>,
    reference: PathBuf,
    annotation: PathBuf,
    patterns_primary: PathBuf,
    patterns_secondary: PathBuf,
}

impl ToolTasks {
    pub fn new(config: Arc<RunConfig>) -> Result<Self, PipelineError> {
        let existing = |value: &str, flag: &str| -> Result<PathBuf, PipelineError> {
            let path = resolve_path(value, &config.cwd);
            if path.exists() {
                Ok(path)
            } else {
                Err(PipelineError::InvalidConfig(format!("--{} {} does not exist", flag, path.display())))
            }
        };
        let reference = existing(&config.args.reference, "reference")?;
        let annotation = existing(&config.args.annotated_reference, "annotated-reference")?;
        let patterns_primary = existing(&config.args.patterns_primary, "patterns-primary")?;
        let patterns_secondary = existing(&config.args.patterns_secondary, "patterns-secondary")?;
        Ok(ToolTasks {
            config,
            reference,
            annotation,
            patterns_primary,
            patterns_secondary,
        })
    }

    pub fn task(&self, step: Step, spec: &StageSpec) -> Arc<dyn StageTask> {
        let threads = compute_task_threads(self.config.max_cores, spec.max_concurrency);
        debug!("{} gets {} thread(s) per task", spec.name, threads);
        match step {
            Step::Dedup => Arc::new(dedup_task(threads)),
            Step::Trim => Arc::new(trim_task(threads)),
            Step::Map => Arc::new(map_task(&self.reference, threads)),
            Step::VarCall => Arc::new(varcall_task(&self.reference, threads)),
            Step::ConsensusStats => Arc::new(consensus_stats_task(&self.reference)),
            Step::FilterAnnotate => Arc::new(FilterTask {
                min_mean_coverage: self.config.args.min_mean_coverage,
                annotate: filter_annotate_task(
                    &self.reference,
                    &self.annotation,
                    &filter_expression(&self.config.args),
                    threads,
                ),
            }),
            Step::ClusterAssign => Arc::new(cluster_assign_task(&self.patterns_primary, &self.patterns_secondary)),
            Step::Spoligotype => Arc::new(spoligotype_task()),
        }
    }
}


pub fn dedup_task(threads: usize) -> CommandTask {
    CommandTask::new(
        vec![(DEDUP_1, ".dedup_R1.fastq.gz"), (DEDUP_2, ".dedup_R2.fastq.gz")],
        vec![CommandStep::new(
            CLUMPIFY_TAG,
            vec![
                concat(vec![lit("in1="), ArgPart::Input(READ_1)]),
                concat(vec![lit("in2="), ArgPart::Input(READ_2)]),
                concat(vec![lit("out1="), ArgPart::Output(DEDUP_1)]),
                concat(vec![lit("out2="), ArgPart::Output(DEDUP_2)]),
                lit("dedupe=t"),
                lit("subs=0"),
                lit(format!("threads={}", threads)),
            ],
        )],
    )
}

pub fn trim_task(threads: usize) -> CommandTask {
    CommandTask::new(
        vec![(TRIMMED_1, ".trimmed_R1.fastq.gz"), (TRIMMED_2, ".trimmed_R2.fastq.gz")],
        vec![CommandStep::new(
            FASTP_TAG,
            vec![
                lit("-i"),
                ArgPart::Input(DEDUP_1),
                lit("-I"),
                ArgPart::Input(DEDUP_2),
                lit("-o"),
                ArgPart::Output(TRIMMED_1),
                lit("-O"),
                ArgPart::Output(TRIMMED_2),
                lit("--length_required"),
                lit(TRIM_MIN_LENGTH),
                lit("--qualified_quality_phred"),
                lit(TRIM_QUAL_PHRED),
                lit("--thread"),
                lit(threads.min(16)), // fastp caps worker threads at 16
                lit("-j"),
                ArgPart::Scratch("fastp.json"),
                lit("-h"),
                ArgPart::Scratch("fastp.html"),
            ],
        )],
    )
}

pub fn map_task(reference: &Path, threads: usize) -> CommandTask {
    CommandTask::new(
        vec![(BAM, ".sorted.bam")],
        vec![
            CommandStep::new(
                BWA_TAG,
                vec![
                    lit("mem"),
                    lit("-t"),
                    lit(threads),
                    lit("-R"),
                    concat(vec![lit("@RG\\tID:"), ArgPart::Key, lit("\\tSM:"), ArgPart::Key]),
                    lit(reference.display()),
                    ArgPart::Input(TRIMMED_1),
                    ArgPart::Input(TRIMMED_2),
                ],
            )
            .stdout_to(StdoutTarget::Scratch("aligned.sam")),
            CommandStep::new(
                SAMTOOLS_TAG,
                vec![
                    lit(SamtoolsSubcommand::Sort.as_str()),
                    lit("-@"),
                    lit(threads),
                    lit("-o"),
                    ArgPart::Output(BAM),
                    ArgPart::Scratch("aligned.sam"),
                ],
            ),
            CommandStep::new(
                SAMTOOLS_TAG,
                vec![lit(SamtoolsSubcommand::Index.as_str()), ArgPart::Output(BAM)],
            ),
        ],
    )
}

pub fn varcall_task(reference: &Path, threads: usize) -> CommandTask {
    CommandTask::new(
        vec![(VCF, ".vcf.gz")],
        vec![
            CommandStep::new(
                BCFTOOLS_TAG,
                vec![
                    lit(BcftoolsSubcommand::Mpileup.as_str()),
                    lit("--threads"),
                    lit(threads),
                    lit("-f"),
                    lit(reference.display()),
                    lit("-a"),
                    lit("FORMAT/AD,FORMAT/DP"),
                    lit("-Ou"),
                    lit("-o"),
                    ArgPart::Scratch("pileup.bcf"),
                    ArgPart::Input(BAM),
                ],
            ),
            CommandStep::new(
                BCFTOOLS_TAG,
                vec![
                    lit(BcftoolsSubcommand::Call.as_str()),
                    lit("--threads"),
                    lit(threads),
                    lit("-mv"),
                    lit("-Oz"),
                    lit("-o"),
                    ArgPart::Output(VCF),
                    ArgPart::Scratch("pileup.bcf"),
                ],
            ),
            CommandStep::new(
                BCFTOOLS_TAG,
                vec![lit(BcftoolsSubcommand::Index.as_str()), ArgPart::Output(VCF)],
            ),
        ],
    )
}

/// Coverage table plus a consensus sequence renamed to the sample key.
pub fn consensus_stats_task(reference: &Path) -> CommandTask {
    CommandTask::new(
        vec![(COVERAGE_STATS, ".coverage.tsv"), (CONSENSUS_FASTA, ".consensus.fasta")],
        vec![
            CommandStep::new(
                SAMTOOLS_TAG,
                vec![
                    lit(SamtoolsSubcommand::Coverage.as_str()),
                    lit("-o"),
                    ArgPart::Output(COVERAGE_STATS),
                    ArgPart::Input(BAM),
                ],
            ),
            CommandStep::new(
                BCFTOOLS_TAG,
                vec![
                    lit(BcftoolsSubcommand::Consensus.as_str()),
                    lit("-f"),
                    lit(reference.display()),
                    lit("-o"),
                    ArgPart::Scratch("consensus.fasta"),
                    ArgPart::Input(VCF),
                ],
            ),
            CommandStep::new(
                SEQKIT_TAG,
                vec![
                    lit("replace"),
                    lit("-p"),
                    lit(".+"),
                    lit("-r"),
                    ArgPart::Key,
                    lit("-o"),
                    ArgPart::Output(CONSENSUS_FASTA),
                    ArgPart::Scratch("consensus.fasta"),
                ],
            ),
        ],
    )
}

pub fn filter_annotate_task(reference: &Path, annotation: &Path, expression: &str, threads: usize) -> CommandTask {
    CommandTask::new(
        vec![(ANNOTATED_VCF, ".annotated.vcf.gz")],
        vec![
            CommandStep::new(
                BCFTOOLS_TAG,
                vec![
                    lit(BcftoolsSubcommand::Filter.as_str()),
                    lit("--threads"),
                    lit(threads),
                    lit("-i"),
                    lit(expression),
                    lit("-Oz"),
                    lit("-o"),
                    ArgPart::Scratch("filtered.vcf.gz"),
                    ArgPart::Input(VCF),
                ],
            ),
            CommandStep::new(
                BCFTOOLS_TAG,
                vec![
                    lit(BcftoolsSubcommand::Csq.as_str()),
                    lit("--phase"),
                    lit("a"),
                    lit("-f"),
                    lit(reference.display()),
                    lit("-g"),
                    lit(annotation.display()),
                    lit("-Oz"),
                    lit("-o"),
                    ArgPart::Output(ANNOTATED_VCF),
                    ArgPart::Scratch("filtered.vcf.gz"),
                ],
            ),
        ],
    )
}

/// Writes one header line plus one row for the sample.
pub fn cluster_assign_task(patterns_primary: &Path, patterns_secondary: &Path) -> CommandTask {
    CommandTask::new(
        vec![(CLUSTER_ROW, ".cluster.tsv")],
        vec![CommandStep::new(
            CLUSTER_ASSIGN_TAG,
            vec![
                lit("--vcf"),
                ArgPart::Input(ANNOTATED_VCF),
                lit("--sample"),
                ArgPart::Key,
                lit("--patterns-primary"),
                lit(patterns_primary.display()),
                lit("--patterns-secondary"),
                lit(patterns_secondary.display()),
                lit("--output"),
                ArgPart::Output(CLUSTER_ROW),
            ],
        )],
    )
}

pub fn spoligotype_task() -> CommandTask {
    CommandTask::new(
        vec![(SPOLIGOTYPE_ROW, ".spoligotype.tsv")],
        vec![CommandStep::new(
            SPOTYPING_TAG,
            vec![
                ArgPart::Input(TRIMMED_1),
                ArgPart::Input(TRIMMED_2),
                lit("-o"),
                ArgPart::Output(SPOLIGOTYPE_ROW),
            ],
        )],
    )
}


/// bcftools include expression for the site thresholds.
pub fn filter_expression(args: &Arguments) -> String {
    format!(
        "(TYPE=\"snp\" && QUAL>={snp} && INFO/DP>={dp} && FORMAT/AD[0:1]/INFO/DP>={alt}) || (TYPE!=\"snp\" && QUAL>={non_snp} && INFO/DP>={dp})",
        snp = args.min_snp_qual,
        dp = args.min_site_coverage,
        alt = args.min_alt_proportion,
        non_snp = args.min_non_snp_qual,
    )
}

/// Length-weighted mean depth over every contig of a `samtools coverage` table.
pub fn mean_depth(coverage_table: &str) -> Result<f64> {
    let mut lines = coverage_table.lines().filter(|l| !l.trim().is_empty());
    let header = lines.next().ok_or_else(|| anyhow!("empty coverage table"))?;
    let columns: Vec<&str> = header.trim_start_matches('#').split('\t').collect();
    let column = |name: &str| -> Result<usize> {
        columns
            .iter()
            .position(|c| *c == name)
            .ok_or_else(|| anyhow!("coverage table has no '{}' column", name))
    };
    let (start_col, end_col, depth_col) = (column("startpos")?, column("endpos")?, column("meandepth")?);

    let mut bases = 0.0;
    let mut weighted = 0.0;
    for line in lines {
        let fields: Vec<&str> = line.split('\t').collect();
        let field = |i: usize| -> Result<f64> {
            let raw = fields.get(i).ok_or_else(|| anyhow!("short coverage row: {}", line))?;
            raw.trim().parse::<f64>().with_context(|| format!("bad number '{}' in coverage row", raw))
        };
        let length = field(end_col)? - field(start_col)? + 1.0;
        weighted += field(depth_col)? * length;
        bases += length;
    }
    if bases <= 0.0 {
        return Err(anyhow!("coverage table lists no contigs"));
    }
    Ok(weighted / bases)
}


/// Fails samples under the mean coverage gate, then filters and annotates the VCF.
pub struct FilterTask {
    pub min_mean_coverage: f64,
    pub annotate: CommandTask,
}

#[async_trait]
impl StageTask for FilterTask {
    async fn run(&self, ctx: &TaskContext) -> Result<Artifacts> {
        let stats = ctx.inputs.require(COVERAGE_STATS)?;
        let table = tokio::fs::read_to_string(stats)
            .await
            .with_context(|| format!("Failed to read {}", stats.display()))?;
        let depth = mean_depth(&table)?;
        if depth < self.min_mean_coverage {
            return Err(anyhow!(
                "mean coverage {:.1} below minimum {:.1}",
                depth,
                self.min_mean_coverage
            ));
        }
        debug!("{} mean coverage {:.1}", ctx.key, depth);
        self.annotate.run(ctx).await
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use log::LevelFilter;
    use tempfile::tempdir;
    use crate::engine::task::WorkArea;
    use crate::utils::streams::SampleKey;

    struct Noop;

    #[async_trait]
    impl StageTask for Noop {
        async fn run(&self, _ctx: &TaskContext) -> Result<Artifacts> {
            Ok(Artifacts::new())
        }
    }

    fn config(out_dir: PathBuf, extra: &[&str]) -> RunConfig {
        let mut argv = vec![
            "seqtoid-batch",
            "--reads", "reads/*.fastq.gz",
            "--reference", "ref.fasta",
            "--annotated-reference", "ref.gff",
            "--patterns-primary", "primary",
            "--patterns-secondary", "secondary",
        ];
        argv.extend_from_slice(extra);
        RunConfig {
            cwd: out_dir.clone(),
            out_dir,
            args: Arguments::parse_from(argv),
            max_cores: 8,
            log_level: LevelFilter::Info,
        }
    }

    fn noop(_step: Step, _spec: &StageSpec) -> Arc<dyn StageTask> {
        Arc::new(Noop)
    }

    #[test]
    fn test_graph_builds_without_optional_branch() {
        let dir = tempdir().unwrap();
        let graph = build_graph(&config(dir.path().to_path_buf(), &[]), &noop).unwrap();
        let names = graph.node_names();
        assert!(!names.contains(&SPOLIGO_STAGE));
        assert!(!names.contains(&"spoligotypes"));
        let position = |n: &str| names.iter().position(|x| *x == n).unwrap();
        assert!(position(MAP_STAGE) < position(BAM_VCF_JOIN));
        assert!(position(STATS_STAGE) < position(VCF_STATS_JOIN));
        assert!(position(CLUSTER_STAGE) < position("cluster_assignments"));
        assert!(!required_tools(&graph).contains(SPOTYPING_TAG));
    }

    #[test]
    fn test_graph_registers_spoligotype_branch() {
        let dir = tempdir().unwrap();
        let graph = build_graph(&config(dir.path().to_path_buf(), &["--spoligotype"]), &noop).unwrap();
        let names = graph.node_names();
        assert!(names.contains(&SPOLIGO_STAGE));
        assert!(names.contains(&"spoligotypes"));
        assert!(required_tools(&graph).contains(SPOTYPING_TAG));
        assert_eq!(graph.aggregate_specs().len(), 3);
    }

    #[test]
    fn test_concurrency_override_and_bad_override() {
        let dir = tempdir().unwrap();
        let graph = build_graph(
            &config(dir.path().to_path_buf(), &["--stage-concurrency", "map=3"]),
            &noop,
        )
        .unwrap();
        let map = graph.stage_specs().into_iter().find(|s| s.name == MAP_STAGE).unwrap();
        assert_eq!(map.max_concurrency, 3);
        let trim = graph.stage_specs().into_iter().find(|s| s.name == TRIM_STAGE).unwrap();
        assert_eq!(trim.max_concurrency, 4);

        let bad = build_graph(&config(dir.path().to_path_buf(), &["--stage-concurrency", "map=0"]), &noop);
        assert!(matches!(
            bad,
            Err(PipelineError::GraphBuild(GraphBuildError::InvalidConcurrency(name))) if name == MAP_STAGE
        ));
        let malformed = build_graph(&config(dir.path().to_path_buf(), &["--stage-concurrency", "map"]), &noop);
        assert!(matches!(malformed, Err(PipelineError::InvalidConfig(_))));
    }

    #[test]
    fn test_step_names_round_trip() {
        for step in Step::ALL {
            assert_eq!(Step::from_stage_name(step.stage_name()), Some(step));
        }
        assert_eq!(Step::from_stage_name("tree"), None);
    }

    #[test]
    fn test_filter_expression_uses_thresholds() {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path().to_path_buf(), &["--min-snp-qual", "25", "--min-site-coverage", "8"]);
        let expression = filter_expression(&cfg.args);
        assert!(expression.contains("QUAL>=25"));
        assert!(expression.contains("INFO/DP>=8"));
        assert!(expression.contains("FORMAT/AD[0:1]/INFO/DP>=0.9"));
        assert!(expression.contains("TYPE!=\"snp\" && QUAL>=60"));
    }

    #[test]
    fn test_mean_depth_is_length_weighted() {
        let table = "#rname\tstartpos\tendpos\tnumreads\tcovbases\tcoverage\tmeandepth\tmeanbaseq\tmeanmapq\n\
                     chr\t1\t300\t900\t300\t100\t30\t36\t60\n\
                     plasmid\t1\t100\t10\t50\t50\t10\t35\t60\n";
        assert!((mean_depth(table).unwrap() - 25.0).abs() < 1e-9);
        assert!(mean_depth("#rname\tstartpos\n").is_err());
        assert!(mean_depth("").is_err());
    }

    #[tokio::test]
    async fn test_filter_task_gates_on_mean_coverage() {
        let dir = tempdir().unwrap();
        let stats = dir.path().join("S1.coverage.tsv");
        std::fs::write(
            &stats,
            "#rname\tstartpos\tendpos\tnumreads\tcovbases\tcoverage\tmeandepth\tmeanbaseq\tmeanmapq\nchr\t1\t100\t5\t20\t20\t2.5\t30\t60\n",
        )
        .unwrap();
        let key = SampleKey::from("S1");
        let ctx = TaskContext {
            stage: FILTER_STAGE.to_string(),
            key: key.clone(),
            inputs: [(COVERAGE_STATS, stats.clone()), (VCF, dir.path().join("S1.vcf.gz"))]
                .into_iter()
                .collect(),
            outputs: vec![ANNOTATED_VCF.to_string()],
            work: WorkArea::create(&dir.path().join("work"), FILTER_STAGE, &key).await.unwrap(),
        };
        let task = FilterTask {
            min_mean_coverage: 10.0,
            annotate: CommandTask::new(vec![(ANNOTATED_VCF, ".annotated.vcf.gz")], vec![]),
        };
        let err = task.run(&ctx).await.unwrap_err().to_string();
        assert!(err.contains("below minimum"), "{}", err);
    }

    #[test]
    fn test_tool_tasks_reject_missing_reference() {
        let dir = tempdir().unwrap();
        let result = ToolTasks::new(Arc::new(config(dir.path().to_path_buf(), &[])));
        assert!(matches!(result, Err(PipelineError::InvalidConfig(msg)) if msg.contains("--reference")));
    }

    #[test]
    fn test_map_task_chains_bwa_and_samtools() {
        let task = map_task(&PathBuf::from("/ref/h37rv.fasta"), 4);
        let tools: Vec<&str> = task.steps.iter().map(|s| s.tool).collect();
        assert_eq!(tools, vec![BWA_TAG, SAMTOOLS_TAG, SAMTOOLS_TAG]);
        assert_eq!(task.steps[0].stdout, Some(StdoutTarget::Scratch("aligned.sam")));
        assert!(task.steps[1].args.contains(&ArgPart::Output(BAM)));
    }
}
