//! Exposes the command line application.
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;

use besgate_service::config::Config;

use crate::healthcheck;
use crate::logging;
use crate::metrics;
use crate::server;

/// Besgate commands.
#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Run the web server.
    Run,

    /// Check the health of a running server.
    Healthcheck {
        /// Address of the server to check, defaults to the configured bind
        /// address.
        #[arg(long, value_name = "ADDR")]
        addr: Option<SocketAddr>,

        /// Timeout for the healthcheck request, in seconds.
        #[arg(long, default_value = "30")]
        timeout: u64,
    },
}

/// Command line interface parser.
#[derive(Debug, Parser)]
#[command(bin_name = "besgate", version)]
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

    // SAFETY: no other threads are running yet; see `init_logging`.
    unsafe { logging::init_logging(&config) };

    if let Some(ref statsd) = config.metrics.statsd {
        let hostname = config.metrics.hostname_tag.clone().and_then(|tag| {
            hostname::get()
                .ok()
                .and_then(|s| s.into_string().ok())
                .map(|name| (tag, name))
        });
        metrics::configure_statsd(
            &config.metrics.prefix,
            statsd,
            hostname,
            config.metrics.custom_tags.clone(),
        );
    }

    match cli.command {
        Command::Run => server::run(config).context("failed to start the server")?,
        Command::Healthcheck { addr, timeout } => healthcheck::healthcheck(config, addr, timeout)
            .context("healthcheck failed")?,
    }

    Ok(())
}
