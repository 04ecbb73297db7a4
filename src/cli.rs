use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};

use crate::exophase::{API_BASE, DEFAULT_PLATFORM, WEB_BASE};
use crate::pipeline::DEFAULT_MAX_IN_FLIGHT;

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormatArg {
    Human,
    Json,
}

#[derive(Debug, Parser)]
#[command(
    name = "trophy-cli",
    version,
    about = "Fetch a player's games and earned achievements from Exophase"
)]
pub struct Cli {
    #[arg(long, global = true, value_enum, default_value_t = OutputFormatArg::Human)]
    pub format: OutputFormatArg,
    #[arg(long, global = true, action = ArgAction::SetTrue)]
    pub json: bool,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    Fetch(FetchArgs),
    Settings(SettingsCommand),
}

#[derive(Debug, Args)]
pub struct CredentialArgs {
    /// Exophase display handle used to resolve the profile
    #[arg(long)]
    pub handle: Option<String>,
    /// Platform account name used for the game listing
    #[arg(long)]
    pub username: Option<String>,
}

impl CredentialArgs {
    pub fn is_empty(&self) -> bool {
        self.handle.is_none() && self.username.is_none()
    }
}

#[derive(Debug, Args)]
pub struct FetchArgs {
    #[command(flatten)]
    pub credentials: CredentialArgs,
    /// Maximum simultaneous outbound requests
    #[arg(long, default_value_t = DEFAULT_MAX_IN_FLIGHT)]
    pub concurrency: usize,
    #[arg(long, default_value = DEFAULT_PLATFORM)]
    pub platform: String,
    #[arg(long, default_value = WEB_BASE, hide = true)]
    pub web_base: String,
    #[arg(long, default_value = API_BASE, hide = true)]
    pub api_base: String,
}

#[derive(Debug, Subcommand)]
pub enum SettingsSubcommands {
    Show,
    Set(CredentialArgs),
}

#[derive(Debug, Args)]
pub struct SettingsCommand {
    #[command(subcommand)]
    pub action: SettingsSubcommands,
}

#[derive(Debug, Clone, Copy)]
pub enum OutputFormat {
    Human,
    Json,
}

impl Cli {
    pub fn resolved_format(&self) -> OutputFormat {
        if self.json {
            OutputFormat::Json
        } else {
            match self.format {
                OutputFormatArg::Human => OutputFormat::Human,
                OutputFormatArg::Json => OutputFormat::Json,
            }
        }
    }
}
