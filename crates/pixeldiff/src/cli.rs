//! Exposes the command line application.
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use pixeldiff_service::config::Config;
use pixeldiff_service::metrics;

use crate::healthcheck;
use crate::logging;
use crate::server;

/// Pixeldiff commands.
#[derive(Subcommand)]
enum Command {
    /// Run the web server.
    Run,

    /// Check the health of a running server.
    Healthcheck {
        /// The address of the server to check, defaults to the configured bind address.
        #[arg(long)]
        addr: Option<SocketAddr>,

        /// Timeout for the healthcheck request, in seconds.
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },
}

/// Command line interface parser.
#[derive(Parser)]
#[command(bin_name = "pixeldiff", version)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long = "config", short = 'c', global(true), value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    // SAFETY: We are in a single-threaded context here, no other thread can
    // be reading the environment concurrently.
    unsafe { logging::init_logging(&config) };

    if let Some(ref statsd) = config.metrics.statsd {
        let mut tags = config.metrics.custom_tags.clone();
        if let Some(tag) = config.metrics.hostname_tag.clone()
            && let Some(name) = hostname::get().ok().and_then(|s| s.into_string().ok())
        {
            tags.insert(tag, name);
        }
        if let Some(tag) = config.metrics.environment_tag.clone()
            && let Ok(environment) = std::env::var("PIXELDIFF_ENVIRONMENT")
        {
            tags.insert(tag, environment);
        }
        metrics::configure_statsd(&config.metrics.prefix, statsd, tags);
    }

    match cli.command {
        Command::Run => server::run(config).context("failed to start the server")?,
        Command::Healthcheck { addr, timeout } => {
            healthcheck::healthcheck(config, addr, timeout)?
        }
    }

    Ok(())
}
