use std::env;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use env_logger::Builder;
use log::{debug, error, info, warn, LevelFilter};
use tokio::sync::watch;

use seqtoid_batch::cli::{self, Arguments};
use seqtoid_batch::config::defs::{PipelineError, RunConfig};
use seqtoid_batch::engine::RunSummary;
use seqtoid_batch::pipelines::snp_cluster;
use seqtoid_batch::utils::file::resolve_path;
use seqtoid_batch::utils::system::{detect_cores_and_load, detect_ram};


#[tokio::main]
async fn main() -> Result<()> {
    let run_start = Instant::now();

    let args = cli::parse();

    let log_level = if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    Builder::new()
        .filter_level(log_level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] {}: {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .init();

    println!("\n-------------\n SeqToID Batch\n-------------\n");

    let dir = env::current_dir()?;
    info!("The current directory is {:?}", dir);

    let (max_cores, cpu_load) = detect_cores_and_load(args.threads).await?;
    debug!("Using {} cores; CPU load {:.1}%", max_cores, cpu_load);
    match detect_ram() {
        Ok((total_ram, available_ram)) => debug!(
            "RAM: {} GiB available of {} GiB",
            available_ram / 1_073_741_824,
            total_ram / 1_073_741_824
        ),
        Err(e) => warn!("{}", e),
    }

    let out_dir = setup_output_dir(&args, &dir)?;
    info!("Output directory: {}", out_dir.display());

    let module = args.module.clone();
    let run_config = Arc::new(RunConfig {
        cwd: dir,
        out_dir,
        args,
        max_cores,
        log_level,
    });

    let (abort_tx, abort_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; finishing in-flight samples and stopping");
            abort_tx.send_replace(true);
        }
    });

    let result = match module.as_str() {
        "snp_cluster" => snp_cluster_run(run_config, abort_rx).await,
        _ => Err(PipelineError::InvalidConfig(format!("Invalid module: {}", module))),
    };

    match result {
        Ok(summary) => {
            summary.log();
            if !summary.success {
                error!("Run aborted at {} milliseconds.", run_start.elapsed().as_millis());
                std::process::exit(1);
            }
        }
        Err(e) => {
            error!("Pipeline failed: {} at {} milliseconds.", e, run_start.elapsed().as_millis());
            std::process::exit(1);
        }
    }

    println!("Run complete: {} milliseconds.", run_start.elapsed().as_millis());
    Ok(())
}


async fn snp_cluster_run(run_config: Arc<RunConfig>, abort: watch::Receiver<bool>) -> Result<RunSummary, PipelineError> {
    snp_cluster::run(run_config, abort).await
}

/// Sets up output directory
/// If `out_dir` is specified from args, uses it;
/// otherwise, creates a directory named `<batch_name>_YYYYMMDD`.
/// Ensures the directory exists.
///
/// # Arguments
/// * `args` - The parsed command-line arguments.
/// * `cwd` - The current working directory.
/// # Returns
/// path to the output directory.
fn setup_output_dir(args: &Arguments, cwd: &Path) -> Result<PathBuf> {
    let out_dir = match &args.out_dir {
        Some(out) => resolve_path(out, cwd),
        None => {
            let timestamp = chrono::Local::now().format("%Y%m%d").to_string();
            cwd.join(format!("{}_{}", args.batch_name, timestamp))
        }
    };
    fs::create_dir_all(&out_dir)?;
    Ok(out_dir)
}
