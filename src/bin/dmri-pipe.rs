use clap::Parser;
use dmri_pipe::{run_batch, PipelineParams, Stage, SubjectPaths, SystemRunner};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
struct Args {
    /// pipeline parameter file (toml)
    #[arg(short, long)]
    params: PathBuf,
    /// stages to run, defaults to all of them
    #[arg(short, long, value_enum, value_delimiter = ',')]
    stages: Vec<Stage>,
    /// keep processing remaining subjects after a failure
    #[arg(short, long)]
    keep_going: bool,
    /// subject directories, the directory name is the subject name
    #[arg(required = true)]
    subjects: Vec<PathBuf>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut params = match PipelineParams::from_file(&args.params) {
        Ok(p) => p,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    params.continue_on_error |= args.keep_going;

    if let Err(e) = rayon::ThreadPoolBuilder::new().num_threads(params.num_threads).build_global() {
        error!("failed to configure thread pool: {}", e);
        return ExitCode::FAILURE;
    }

    let mut subjects = vec![];
    for dir in &args.subjects {
        match SubjectPaths::from_dir(dir, &params.layout) {
            Some(paths) => subjects.push(paths),
            None => {
                error!("cannot derive a subject name from {}", dir.display());
                return ExitCode::FAILURE;
            }
        }
    }

    let stages = if args.stages.is_empty() { Stage::ALL.to_vec() } else { args.stages };
    let failures = run_batch(&subjects, &params, &SystemRunner, &stages);
    if failures.is_empty() {
        info!("processed {} subject(s)", subjects.len());
        ExitCode::SUCCESS
    } else {
        error!("{} subject(s) failed", failures.len());
        ExitCode::FAILURE
    }
}
