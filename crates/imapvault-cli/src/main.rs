use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

mod cli;

use crate::cli::{Cli, load_app_config, output_error, run_cli};

const CLI_SCHEMA_VERSION: &str = "imapvault.cli.v1";
const LOG_ENV: &str = "IMAPVAULT_LOG";
const DB_ENV: &str = "IMAPVAULT_DB";

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing();

    let config = match load_app_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            error!(error = %format!("{:#}", err), "configuration error");
            let _ = output_error(&format!("{:#}", err));
            return ExitCode::from(1);
        }
    };
    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(err) => {
            let _ = output_error(&err.to_string());
            return ExitCode::from(1);
        }
    };
    match run_cli(&rt, cli.command.unwrap_or_default(), &config) {
        Ok(status) => ExitCode::from(status.code()),
        Err(err) => {
            error!(error = %format!("{:#}", err), "command failed");
            let _ = output_error(&format!("{:#}", err));
            ExitCode::from(1)
        }
    }
}

/// Logs go to stderr; stdout carries only the JSON result.
fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn xdg_config_dir() -> PathBuf {
    std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
        .unwrap_or_else(|| PathBuf::from("/tmp"))
}

fn config_path_candidates() -> Vec<PathBuf> {
    vec![
        PathBuf::from("imapvault.toml"),
        xdg_config_dir().join("imapvault").join("imapvault.toml"),
    ]
}
