//! 分级流程的命令行入口.

use std::process::ExitCode;

use cart_berry::{GradingConfig, GradingError, GradingResult};
use clap::Parser;
use log::{error, info};
use simple_logger::SimpleLogger;

mod args;
mod runner;

use args::{Args, Command};

fn run(args: Args) -> GradingResult<()> {
    let mut config = match &args.config {
        Some(path) => GradingConfig::from_json_file(path)?,
        None => GradingConfig::default(),
    };
    config.loader.workers = args.workers.unwrap_or_else(runner::cpus);
    info!("using {} workers", config.loader.workers);

    match args.command {
        Command::Preprocess {
            input,
            output,
            masks,
        } => {
            let input = input
                .or_else(runner::samples_dir_from_env_or_home)
                .ok_or_else(|| GradingError::load_failure("~/dataset/samples", "no home directory"))?;
            let report = runner::preprocess(&config, &input, &output, masks.as_deref())?;
            println!(
                "{} samples processed, {} failed",
                report.succeeded.len(),
                report.failed.len()
            );
            Ok(())
        }
        Command::Regress {
            archives,
            grades,
            keys,
            grade_mode,
            group_column,
            weights,
            report,
        } => {
            if let Some(mode) = grade_mode {
                config.regression.aggregate = mode.parse()?;
            }
            runner::regress(
                &config,
                &runner::RegressArgs {
                    archives: &archives,
                    grades: &grades,
                    keys: keys.iter().map(String::as_str).collect(),
                    group_column: group_column.as_deref(),
                    weights: weights.as_deref(),
                    report: report.as_deref(),
                },
            )
        }
        Command::DumpConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    if let Err(e) = SimpleLogger::new().with_level(args.log_level).init() {
        eprintln!("logger: {e}");
    }
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
