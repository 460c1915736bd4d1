use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "uat-registrar")]
#[command(version, about = "Register APIs in UAT through the GitHub Actions pipeline")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    pub json_logs: bool,

    /// Also write a daily-rolling log file under .uat/logs
    #[arg(long, global = true)]
    pub log_file: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Path to registrar.toml. Defaults to .uat/registrar.toml in the project dir.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Poll interval in seconds. Overrides the config file and UAT_POLL_INTERVAL_SECS.
    #[arg(long, global = true)]
    pub poll_interval: Option<u64>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Dispatch a registration and follow it to the end
    Register {
        #[arg(long)]
        entity_id: String,
        #[arg(long)]
        name: String,
        #[arg(long = "api-version")]
        version: String,
        /// API context path, e.g. /pizza
        #[arg(long)]
        context: Option<String>,
        #[arg(long)]
        user_id: Option<String>,
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        api_type: Option<String>,
        /// Return after dispatch; run `resume` later to follow it
        #[arg(long)]
        detach: bool,
    },
    /// Show the persisted status of one entity, or of all entities
    Status {
        #[arg(long)]
        entity_id: Option<String>,
    },
    /// Cancel an in-progress registration
    Cancel {
        #[arg(long)]
        entity_id: String,
        /// Skip confirmation prompt
        #[arg(long)]
        yes: bool,
    },
    /// Reset a finished registration so it can be dispatched again
    Retry {
        #[arg(long)]
        entity_id: String,
    },
    /// Follow every in-progress registration to the end
    Resume,
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default registrar.toml
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    dotenvy::from_path(project_dir.join(".env")).ok();

    let log_dir = cli
        .log_file
        .then(|| uat_registrar::RegistrarConfig::log_dir(&project_dir));
    let _guard = uat_registrar::logging::init(cli.verbose, cli.json_logs, log_dir.as_deref())?;

    match &cli.command {
        Commands::Register {
            entity_id,
            name,
            version,
            context,
            user_id,
            provider,
            api_type,
            detach,
        } => {
            let request = uat_registrar::RegistrationRequest {
                context: context.clone(),
                user_id: user_id.clone(),
                provider: provider.clone(),
                api_type: api_type.clone(),
                ..uat_registrar::RegistrationRequest::new(entity_id, name, version)
            };
            cmd::cmd_register(&project_dir, &cli, request, *detach).await?;
        }
        Commands::Status { entity_id } => {
            cmd::cmd_status(&project_dir, &cli, entity_id.as_deref()).await?
        }
        Commands::Cancel { entity_id, yes } => {
            cmd::cmd_cancel(&project_dir, &cli, entity_id, *yes).await?
        }
        Commands::Retry { entity_id } => cmd::cmd_retry(&project_dir, &cli, entity_id).await?,
        Commands::Resume => cmd::cmd_resume(&project_dir, &cli).await?,
        Commands::Config { command } => cmd::cmd_config(&project_dir, &cli, command.clone())?,
    }

    Ok(())
}
