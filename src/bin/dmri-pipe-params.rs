use clap::Parser;
use dmri_pipe::PipelineParams;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
struct Args {
    /// path to the parameter file to write
    parameter_file: PathBuf,
}

fn main() -> ExitCode {
    let args = Args::parse();
    let params = PipelineParams::default();
    match params.to_file(&args.parameter_file) {
        Ok(()) => {
            println!("wrote default parameter file to {}", args.parameter_file.with_extension("toml").display());
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
    }
}
