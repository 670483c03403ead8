//! Command-line driver for the monobc analysis stages.

use std::process::ExitCode;

use clap::Parser;
use monobc::{
    pipeline::{run, Stage},
    AnalysisConfig,
};

#[derive(Parser, Debug)]
#[command(name = "monobc")]
#[command(about = "Flatten events, build shape and Asimov histograms, and run fits")]
#[command(version)]
struct Cli {
    /// YAML analysis configuration
    config: String,

    /// Stages to run (flatten, shapes, asimov, fit). Defaults to all, in order.
    stages: Vec<Stage>,

    /// Worker threads, overriding the configuration
    #[arg(long)]
    threads: Option<usize>,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let mut config = match AnalysisConfig::from_path(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            log::error!("Could not load '{}': {err}", cli.config);
            return ExitCode::FAILURE;
        }
    };
    if cli.threads.is_some() {
        config.threads = cli.threads;
    }
    let stages = if cli.stages.is_empty() {
        Stage::ALL.to_vec()
    } else {
        cli.stages
    };

    match run(&config, &stages) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err}");
            ExitCode::FAILURE
        }
    }
}
