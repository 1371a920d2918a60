//! CLI entry point for the livesynth job server
//!
//! Parses command line arguments, installs logging and runs the daemon.

use clap::Parser;
use livesynth::config::{Config, LogConfig, LogFormat};
use livesynth::Daemon;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// livesynth - HTTP job server for synthetic live streams
#[derive(Parser, Debug)]
#[command(name = "livesynth")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml); built-in defaults when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on, overriding the configuration
    #[arg(short, long)]
    port: Option<u16>,

    /// Directory holding job output, overriding the configuration
    #[arg(long)]
    media_root: Option<PathBuf>,

    /// Skip startup checks (media root, encoder). For testing only.
    #[arg(long, default_value = "false")]
    skip_checks: bool,
}

fn init_logging(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match log.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

fn load_config(args: &Args) -> Result<Config, livesynth::config::ConfigError> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::from_env(),
    };
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(root) = &args.media_root {
        config.media.root = root.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };
    init_logging(&config.log);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = ?args.config,
        "livesynth starting"
    );

    let daemon = if args.skip_checks {
        warn!("Skipping startup checks (--skip-checks enabled)");
        Ok(Daemon::new_without_checks(config))
    } else {
        Daemon::new(config)
    };

    let daemon = match daemon {
        Ok(daemon) => daemon,
        Err(e) => {
            error!(error = %e, "Failed to initialize daemon");
            return ExitCode::FAILURE;
        }
    };

    info!(
        encoder = %daemon.config.encoder.program,
        max_running_jobs = daemon.config.limits.max_running_jobs,
        "Daemon initialized"
    );

    match daemon.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Daemon error");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["livesynth"]);
        assert!(args.config.is_none());
        assert!(args.port.is_none());
        assert!(!args.skip_checks);
    }

    #[test]
    fn test_args_overrides_apply() {
        let args = Args::parse_from([
            "livesynth",
            "--port",
            "8081",
            "--media-root",
            "/srv/live",
            "--skip-checks",
        ]);
        let config = load_config(&args).unwrap();

        assert_eq!(config.server.port, 8081);
        assert_eq!(config.media.root, PathBuf::from("/srv/live"));
        assert!(args.skip_checks);
    }

    #[test]
    fn test_missing_config_file_is_error() {
        let args = Args::parse_from(["livesynth", "--config", "/nonexistent/livesynth.toml"]);
        assert!(load_config(&args).is_err());
    }
}
