//! Configuration view and validation commands (`uat-registrar config`).

use std::path::Path;

use anyhow::{Context, Result};
use console::style;

use uat_registrar::RegistrarConfig;
use uat_registrar::config::{CredentialProvider, EnvCredentialProvider};

use super::super::{Cli, ConfigCommands};
use super::load_config;

pub fn cmd_config(project_dir: &Path, cli: &Cli, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| RegistrarConfig::project_path(project_dir));

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Registrar Configuration");
            println!("=======================");
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No registrar.toml found at {}", config_path.display());
                println!("Using defaults.");
            }
            println!();

            let config = load_config(project_dir, cli)?;
            print!("{}", config.to_toml()?);
            println!();

            let credentials = EnvCredentialProvider::from_config(&config).resolve();
            let token_state = if credentials.is_some() {
                style("set").green()
            } else {
                style("not configured").red()
            };
            println!("Token (${}): {}", config.github.token_env, token_state);
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            let config = load_config(project_dir, cli)?;
            let mut warnings = config.validate();
            if EnvCredentialProvider::from_config(&config).resolve().is_none() {
                warnings.push(format!(
                    "${} is not set; registrations will fail with a configuration error",
                    config.github.token_env
                ));
            }

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("registrar.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }
            if let Some(parent) = config_path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            let content = RegistrarConfig::default().to_toml()?;
            std::fs::write(&config_path, content)
                .with_context(|| format!("Failed to write {}", config_path.display()))?;

            println!("Created registrar.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [origin] and [approval] owner, repo, workflow");
            println!("  - [polling] interval and attempt budgets");
            println!("  - [github] token_env, api_base, git_ref");
            println!();
        }
    }

    Ok(())
}
