use std::path::PathBuf;

use attack_map::app::{self, Mode};
use attack_map::logging;
use attack_map::tls::install_rustls_provider;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Also write daily-rotated logs to this directory
    #[arg(long, env = "LOG_DIR", global = true)]
    log_dir: Option<PathBuf>,

    /// Log filter directive, e.g. "attack_map=debug"
    #[arg(long, global = true)]
    log_filter: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    /// Stream edge logs, enrich them and publish to the broker
    Ingest,
    /// Serve map viewers from the broker channel
    Relay,
    /// Run both halves in one process over an in-memory broker
    Standalone,
}

impl From<Command> for Mode {
    fn from(command: Command) -> Self {
        match command {
            Command::Ingest => Mode::Ingest,
            Command::Relay => Mode::Relay,
            Command::Standalone => Mode::Standalone,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env before clap so `env = ...` arguments see it.
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let (logging_config, _guard) =
        logging::init_logging(args.log_dir.as_deref(), args.log_filter.as_deref())?;
    install_rustls_provider();

    let mode = Mode::from(args.command);
    info!(?mode, version = env!("CARGO_PKG_VERSION"), "attack-map starting");

    let token = CancellationToken::new();
    logging_config.start_retention_cleanup(token.child_token());
    tokio::spawn(app::shutdown_signal(token.clone()));

    if let Err(e) = app::run(mode, token).await {
        error!(error = %e, "attack-map exited with an error");
        return Err(e.into());
    }

    info!("attack-map stopped");
    Ok(())
}
