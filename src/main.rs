use std::io::stdin;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use jobsh::config::{ShellConfig, MAX_JOBS_LIMIT};
use jobsh::shell::Shell;

#[derive(Parser, Debug)]
#[command(name = "jobsh")]
#[command(version)]
#[command(about = "An interactive shell with job control")]
struct Args {
    /// Number of job slots
    #[arg(long, default_value = "5", value_parser = clap::value_parser!(u16).range(1..=MAX_JOBS_LIMIT as i64))]
    max_jobs: u16,

    /// Prompt printed before each command
    #[arg(long, default_value = "prompt> ")]
    prompt: String,

    /// Longest accepted command line, in bytes
    #[arg(long, default_value = "80")]
    max_line: usize,

    /// Most words accepted on one command line
    #[arg(long, default_value = "80")]
    max_args: usize,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "warn")]
    log_level: String,
}

fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .init();

    let config = ShellConfig {
        max_line: args.max_line,
        max_args: args.max_args,
        ..ShellConfig::from_env()
    }
    .with_max_jobs(args.max_jobs.into())
    .with_prompt(args.prompt);

    let mut shell = match Shell::new(config) {
        Ok(shell) => shell,
        Err(err) => {
            eprintln!("jobsh: {}", err);
            return ExitCode::FAILURE;
        }
    };

    // An external command's status is never the shell's own.
    match shell.run(stdin().lock()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("jobsh: {}", err);
            ExitCode::FAILURE
        }
    }
}
