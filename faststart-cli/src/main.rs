use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use mp4_fix::{Mp4Optimizer, OptimizerConfig, OptimizerEvent, is_optimized};
use tracing::{Level, error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "faststart",
    about = "Rewrite MP4/MOV files so moov precedes mdat, enabling progressive playback",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Increase log verbosity
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Only log errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Optimize a file for streaming without re-encoding
    Optimize {
        /// Input MP4/MOV file
        input: PathBuf,

        /// Output path for the optimized file
        output: PathBuf,

        /// Cap on the in-memory moov payload, in MiB
        #[arg(long, default_value_t = 512)]
        moov_cap_mib: u64,
    },

    /// Report whether a file already has the fast-start layout
    Check {
        /// Input MP4/MOV file
        input: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    match args.command {
        Commands::Optimize {
            input,
            output,
            moov_cap_mib,
        } => run_optimize(input, output, moov_cap_mib).await,
        Commands::Check { input } => run_check(&input),
    }
}

async fn run_optimize(input: PathBuf, output: PathBuf, moov_cap_mib: u64) -> ExitCode {
    let config = OptimizerConfig::builder()
        .moov_size_cap(moov_cap_mib * 1024 * 1024)
        .build();
    let optimizer = Mp4Optimizer::with_config(config);

    let token = optimizer.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling");
            token.cancel();
        }
    });

    let mut events = optimizer.optimize(&input, &output);

    let mut next_percent = 10u32;
    while let Some(event) = events.recv().await {
        match event {
            OptimizerEvent::Progress(fraction) => {
                let percent = (fraction * 100.0) as u32;
                if percent >= next_percent {
                    info!(percent, "Optimizing");
                    next_percent = (percent / 10 + 1) * 10;
                }
            }
            OptimizerEvent::Completed(path) => {
                info!(output = %path.display(), "Optimization complete");
                return ExitCode::SUCCESS;
            }
            OptimizerEvent::Failed(e) => {
                error!(input = %input.display(), "Optimization failed: {e}");
                return ExitCode::FAILURE;
            }
        }
    }

    // The worker always delivers a terminal event; a closed channel without
    // one means it panicked.
    error!("Optimizer worker exited without reporting a result");
    ExitCode::FAILURE
}

fn run_check(input: &Path) -> ExitCode {
    match is_optimized(input) {
        Ok(true) => {
            println!("{}: fast-start", input.display());
            ExitCode::SUCCESS
        }
        Ok(false) => {
            println!("{}: not fast-start", input.display());
            ExitCode::FAILURE
        }
        Err(e) => {
            error!(input = %input.display(), "Check failed: {e}");
            ExitCode::from(2)
        }
    }
}

fn init_logging(verbose: bool, quiet: bool) {
    let default_level = if quiet {
        Level::ERROR
    } else if verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
