//! FaceGuard scanner entry point.

use anyhow::Context;
use clap::{Parser, Subcommand};
use faceguard::config::Config;
use faceguard_scanner::{app::ScannerContext, detect, scheduler};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "faceguard-scanner",
    version,
    about = "Continuously running likeness-discovery pipeline"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the pipeline scheduler (the default).
    Run,
    /// Drain pending face detection in subprocess-isolated chunks.
    ProcessFaces {
        /// Images per detection child process.
        #[arg(long, default_value_t = 1000)]
        chunk_size: i64,
        /// Child processes to spawn; 0 runs until drained.
        #[arg(long, default_value_t = 0)]
        max_chunks: u32,
    },
    /// Internal: process exactly one detection chunk in this process.
    #[command(hide = true)]
    DetectChunk {
        #[arg(long, default_value_t = 1000)]
        chunk_size: i64,
    },
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    // Logs go to stderr; stdout is reserved for chunk stats the parent
    // process parses.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env().context("configuration")?;
    init_tracing(&config);

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            let ctx = ScannerContext::initialize(config)
                .await
                .context("scanner initialization")?;
            scheduler::run_scheduler(ctx).await.context("scheduler")?;
        }
        Command::ProcessFaces {
            chunk_size,
            max_chunks,
        } => {
            let stats = detect::run_process_faces(&config, chunk_size, max_chunks)
                .await
                .context("process-faces")?;
            println!("{}", stats.to_output());
        }
        Command::DetectChunk { chunk_size } => {
            let stats = detect::run_detection_chunk(&config, chunk_size)
                .await
                .context("detect-chunk")?;
            println!("{}", stats.to_output());
        }
    }
    Ok(())
}
