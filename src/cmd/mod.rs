//! CLI command implementations.
//!
//! | Module     | Commands handled                         |
//! |------------|------------------------------------------|
//! | `register` | `Register`, `Resume`                     |
//! | `status`   | `Status`, `Cancel`, `Retry`              |
//! | `config`   | `Config`                                 |

pub mod config;
pub mod register;
pub mod status;

pub use config::cmd_config;
pub use register::{cmd_register, cmd_resume};
pub use status::{cmd_cancel, cmd_retry, cmd_status};

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;

use uat_registrar::config::EnvCredentialProvider;
use uat_registrar::github::GitHubActionsClient;
use uat_registrar::registration::TokioClock;
use uat_registrar::store::JsonFileStore;
use uat_registrar::{Registrar, RegistrarConfig};

use super::Cli;

/// File, then environment, then CLI flags.
pub fn load_config(project_dir: &Path, cli: &Cli) -> Result<RegistrarConfig> {
    let mut config = RegistrarConfig::load(project_dir, cli.config.as_deref())?;
    if let Some(secs) = cli.poll_interval {
        config.polling.interval_secs = secs;
    }
    Ok(config)
}

pub fn build_registrar(project_dir: &Path, cli: &Cli) -> Result<Registrar> {
    let config = load_config(project_dir, cli)?;
    let credentials = EnvCredentialProvider::from_config(&config);
    let store = JsonFileStore::new(RegistrarConfig::status_dir(project_dir));
    Ok(Registrar::new(
        Arc::new(config),
        Arc::new(store),
        Arc::new(GitHubActionsClient::new()),
        Arc::new(credentials),
        Arc::new(TokioClock),
    ))
}
