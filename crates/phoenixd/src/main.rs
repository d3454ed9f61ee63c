//! phoenixd - self-updating service supervisor
//!
//! `phoenixd run` detaches a supervisor which keeps the worker alive and
//! polls for new builds of itself through the updater.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use phoenix_common::{Config, ProgramImage};
use phoenixd::{daemonize, logging, supervisor, updater, worker, Role};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "phoenixd")]
#[command(about = "Self-updating service supervisor", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (default: /etc/phoenix/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the supervisor (default)
    Run {
        /// Stay attached to the terminal
        #[arg(long)]
        foreground: bool,
    },

    /// Run the supervisor loop in this process
    #[command(hide = true)]
    Supervise,

    /// Run the service worker
    #[command(hide = true)]
    Worker,

    /// Poll for and install one update
    #[command(hide = true)]
    Updater,
}

fn main() -> ExitCode {
    logging::init();
    let cli = Cli::parse();

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    let image = ProgramImage::current().context("Failed to resolve program image")?;

    // Children run from the base directory, so pass them an absolute path
    let config_path = cli.config.map(|p| p.canonicalize().unwrap_or(p));

    match cli.command.unwrap_or(Commands::Run { foreground: false }) {
        Commands::Run { foreground: false } => {
            let log_file = daemonize::log_file_path(config.supervisor.log_file.as_deref(), &image);
            let pid = daemonize::detach(&image, config_path.as_deref(), &log_file)?;
            println!(
                "phoenixd v{} supervisor started (pid {}), logging to {}",
                env!("CARGO_PKG_VERSION"),
                pid,
                log_file.display()
            );
            Ok(ExitCode::SUCCESS)
        }
        Commands::Run { foreground: true } | Commands::Supervise => {
            let _span = logging::role_span("supervisor").entered();
            info!("phoenixd v{} starting", env!("CARGO_PKG_VERSION"));
            supervisor::run_supervisor(&config, image, config_path)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Worker => {
            let _span = logging::child_span(Role::Worker).entered();
            worker::start(&config.worker.bind_address, config.worker.port)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Updater => {
            let _span = logging::child_span(Role::Updater).entered();
            let code = updater::run_updater(&config, image, config_path);
            Ok(ExitCode::from(u8::try_from(code).unwrap_or(1)))
        }
    }
}
