use clap::{Args, Parser, Subcommand};

use super::{CLI_SCHEMA_VERSION, DB_ENV, config_path_candidates};

#[path = "cli_command_handlers.rs"]
mod cli_command_handlers;
#[path = "cli_config.rs"]
mod cli_config;
#[path = "cli_credentials.rs"]
mod cli_credentials;
#[path = "cli_runtime_helpers.rs"]
mod cli_runtime_helpers;

pub(crate) use cli_command_handlers::run_cli;
pub(crate) use cli_config::{AppConfig, load_app_config};
pub(crate) use cli_credentials::{CredentialStore, KeyringCredentials, resolve_password};
pub(crate) use cli_runtime_helpers::{RunStatus, output_error, output_ok};

#[derive(Parser, Debug)]
#[command(name = "imapvault", version, about = "Incremental IMAP mailbox backup")]
pub(crate) struct Cli {
    /// Config file to use instead of the default search path.
    #[arg(long, global = true)]
    pub(crate) config: Option<std::path::PathBuf>,
    #[command(subcommand)]
    pub(crate) command: Option<CliCommand>,
}

#[derive(Subcommand, Debug)]
pub(crate) enum CliCommand {
    /// Back up every folder (the default).
    Sync,
    /// Rebuild the participant graph from stored messages.
    Normalize(NormalizeCmd),
    /// List server UIDs of a folder that are not archived yet.
    Missing(FolderArg),
    /// Download the UIDs of a folder that are not archived yet.
    Recover(FolderArg),
    /// Fill empty Message-IDs from the server.
    BackfillMessageIds,
    /// Archive counts, per year and per folder.
    Stats,
    /// Store the IMAP password in the OS keyring, read from stdin.
    SetPassword,
}

impl Default for CliCommand {
    fn default() -> Self {
        CliCommand::Sync
    }
}

#[derive(Args, Debug, Default)]
pub(crate) struct NormalizeCmd {
    #[arg(long)]
    pub(crate) page_size: Option<usize>,
}

#[derive(Args, Debug)]
pub(crate) struct FolderArg {
    #[arg(long)]
    pub(crate) folder: String,
}
