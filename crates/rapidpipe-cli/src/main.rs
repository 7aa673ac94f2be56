mod commands;
mod logging;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "rapidpipe",
    version,
    about = "Pipe partitions of records through an external program"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Pipe an input file through the configured command
    Run {
        /// Path to pipe YAML file
        pipe: PathBuf,
        /// Input records (JSON lines or an Arrow IPC stream, per `format`)
        #[arg(short, long)]
        input: PathBuf,
        /// Number of partitions (default: resolved parallelism)
        #[arg(short, long)]
        partitions: Option<usize>,
        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Validate pipe configuration, command, and quarantine store
    Check {
        /// Path to pipe YAML file
        pipe: PathBuf,
    },
    /// Print quarantined records of a pipe as JSON lines
    Quarantine {
        /// Path to pipe YAML file
        pipe: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    logging::init(&cli.log_level);

    match cli.command {
        Commands::Run {
            pipe,
            input,
            partitions,
            output,
        } => commands::run::execute(&pipe, &input, partitions, output.as_deref()).await,
        Commands::Check { pipe } => commands::check::execute(&pipe),
        Commands::Quarantine { pipe } => commands::quarantine::execute(&pipe),
    }
}
