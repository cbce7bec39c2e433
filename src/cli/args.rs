use clap::Parser;

use crate::config::defs::DEFAULT_CHANNEL_BUFFER;

#[derive(Parser, Debug, Clone, Default)]
#[command(name = "seqtoid-batch", version, about = "Per-sample SNP clustering over a batch of paired read sets")]
pub struct Arguments {

    #[arg(short, long, default_value = "snp_cluster")]
    pub module: String,

    #[arg(short = 'v', long = "verbose", action)]
    pub verbose: bool,

    #[arg(short = 'r', long = "reads", help = "Glob matching the paired FASTQ files, e.g. 'data/*.fastq.gz'. Mates are paired by R1/R2 tag.")]
    pub reads: String,

    #[arg(short = 'o', long = "out", help = "Output directory for all generated files. If not specified, a directory named '<batch>_YYYYMMDD' will be created in the current working directory.")]
    pub out_dir: Option<String>,

    #[arg(long, default_value = "batch")]
    pub batch_name: String,

    #[arg(long = "reference")]
    pub reference: String,

    #[arg(long = "annotated-reference", help = "Annotation (GFF3) for the reference, used by bcftools csq")]
    pub annotated_reference: String,

    #[arg(long = "patterns-primary")]
    pub patterns_primary: String,

    #[arg(long = "patterns-secondary")]
    pub patterns_secondary: String,

    #[arg(long, default_value_t = 10.0)]
    pub min_mean_coverage: f64,

    #[arg(long, default_value_t = 5)]
    pub min_site_coverage: u32,

    #[arg(long, default_value_t = 0.9)]
    pub min_alt_proportion: f64,

    #[arg(long, default_value_t = 30.0)]
    pub min_snp_qual: f64,

    #[arg(long, default_value_t = 60.0)]
    pub min_non_snp_qual: f64,

    #[arg(long, default_value_t = 64)]
    pub threads: usize,

    #[arg(long = "stage-concurrency", value_name = "STAGE=N", help = "Override a stage's concurrent task limit; repeatable")]
    pub stage_concurrency: Vec<String>,

    #[arg(long, default_value_t = DEFAULT_CHANNEL_BUFFER)]
    pub channel_buffer: usize,

    #[arg(long, default_value_t = false, help = "Add the spoligotyping branch and its aggregate table")]
    pub spoligotype: bool,

    #[arg(long, default_value_t = false)]
    pub skip_tool_check: bool,
}
