//! Exposes the command line application.
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use mirrorgate_service::config::Config;
use mirrorgate_service::metrics;
use mirrorgate_service::redirect::RedirectTable;

use crate::logging;
use crate::server;

/// Mirrorgate commands.
#[derive(Clone, Copy, Debug, Subcommand)]
enum Command {
    /// Run the web server.
    Run,

    /// Load the configuration and compile the redirect table without starting the server.
    CheckConfig,
}

/// Command line interface parser.
#[derive(Debug, Parser)]
#[command(
    version,
    long_version = concat!(
        env!("CARGO_PKG_VERSION"),
        "\ngit commit: ",
        env!("MIRRORGATE_GIT_VERSION"),
    ),
)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
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

    if let Command::CheckConfig = cli.command {
        let table = RedirectTable::from_config(&config)?;
        println!(
            "Configuration OK: {} redirect rule(s), serving {}",
            table.rules().len(),
            config.root_dir.display()
        );
        return Ok(());
    }

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: Some(env!("MIRRORGATE_RELEASE").into()),
        ..Default::default()
    });

    // SAFETY: The runtimes have not been started yet, so this is still single-threaded.
    unsafe { logging::init_logging(&config) };

    if let Some(ref statsd) = config.metrics.statsd {
        let mut tags = config.metrics.custom_tags.clone();

        if let Some(hostname_tag) = config.metrics.hostname_tag.clone() {
            if tags.contains_key(&hostname_tag) {
                tracing::warn!(
                    "tag {} defined both as hostname tag and as a custom tag",
                    hostname_tag
                );
            }
            if let Some(hostname) = hostname::get().ok().and_then(|s| s.into_string().ok()) {
                tags.insert(hostname_tag, hostname);
            } else {
                tracing::error!("could not read host name");
            }
        }

        metrics::configure_statsd(&config.metrics.prefix, statsd, tags)?;
    }

    server::run(cli.config, config).context("failed to start the server")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run() {
        let cli = Cli::try_parse_from(["mirrorgate", "-c", "config.yml", "run"]).unwrap();
        assert_eq!(cli.config(), Some(Path::new("config.yml")));
        assert!(matches!(cli.command, Command::Run));
    }

    #[test]
    fn test_parse_global_config() {
        let cli =
            Cli::try_parse_from(["mirrorgate", "check-config", "--config", "other.yml"]).unwrap();
        assert_eq!(cli.config(), Some(Path::new("other.yml")));
        assert!(matches!(cli.command, Command::CheckConfig));
    }

    #[test]
    fn test_missing_command() {
        assert!(Cli::try_parse_from(["mirrorgate"]).is_err());
    }
}
