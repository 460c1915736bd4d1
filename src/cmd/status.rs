//! Status display and the two user actions (`uat-registrar status|cancel|retry`).

use std::path::Path;

use anyhow::{Context, Result};
use console::style;
use dialoguer::Confirm;

use uat_registrar::registration::RegistrationState;
use uat_registrar::RegistrationStatus;

use super::super::Cli;
use super::build_registrar;

const STEPS: [&str; 6] = [
    "Initiating",
    "Exporting",
    "Validating",
    "Requesting approval",
    "Approval pending",
    "Finalizing",
];

fn styled_state(state: RegistrationState) -> String {
    let label = state.as_str();
    match state {
        RegistrationState::Completed => style(label).green().bold().to_string(),
        RegistrationState::Failed
        | RegistrationState::ValidationFailed
        | RegistrationState::ApprovalRejected => style(label).red().bold().to_string(),
        RegistrationState::Cancelled => style(label).yellow().to_string(),
        RegistrationState::Idle => style(label).dim().to_string(),
        _ => style(label).cyan().to_string(),
    }
}

pub fn print_status(entity_id: &str, status: &RegistrationStatus) {
    let state = status.state();
    println!("{} {}", style(entity_id).bold(), styled_state(state));

    if let Some(step) = state.progress_step() {
        let shown = step.min(STEPS.len());
        let label = STEPS.get(step).copied().unwrap_or("Done");
        println!("  Progress: [{}/{}] {}", shown, STEPS.len(), label);
    }
    if let Some(attempt) = status.attempt() {
        println!("  Token:    {}", attempt.correlation_token);
        println!("  Started:  {}", attempt.started_at.to_rfc3339());
    }
    if let Some(tracking) = status.tracking() {
        if let Some(run) = &tracking.origin_run {
            println!("  Processor run: {}", run.url);
        }
        if let Some(run) = &tracking.approval_run {
            println!("  Approval run:  {}", run.url);
        }
        if state.is_in_progress()
            && let Some(step) = &tracking.current_step_label
        {
            println!("  Step:     {}", style(step).dim());
        }
    }
    if let Some(error) = status.error() {
        println!("  {} {}", style("Error:").red().bold(), error.title);
        println!("    {}", error.message);
        if let Some(url) = &error.run_url {
            println!("    {}", style(url).dim());
        }
    }
    if let Some(result) = status.result() {
        println!("  Revision: {}", style(&result.revision).green());
        println!("  Run:      {}", result.artifact_url);
    }
    if let Some(at) = status.cancelled_at() {
        println!("  Cancelled at {}", at.to_rfc3339());
    }
}

pub async fn cmd_status(project_dir: &Path, cli: &Cli, entity_id: Option<&str>) -> Result<()> {
    let registrar = build_registrar(project_dir, cli)?;
    match entity_id {
        Some(id) => {
            let status = registrar
                .status(id)
                .await
                .with_context(|| format!("Failed to read status for {}", id))?;
            print_status(id, &status);
        }
        None => {
            let records = registrar.list().await.context("Failed to list status records")?;
            if records.is_empty() {
                println!("No registrations recorded.");
            }
            for (id, status) in records {
                print_status(&id, &status);
                println!();
            }
        }
    }
    Ok(())
}

pub async fn cmd_cancel(project_dir: &Path, cli: &Cli, entity_id: &str, yes: bool) -> Result<()> {
    let registrar = build_registrar(project_dir, cli)?;
    let current = registrar.status(entity_id).await?;
    let state = current.state();

    if !state.is_cancellable() {
        if state == RegistrationState::Finalizing {
            println!("Approval is already finalizing; it can no longer be cancelled.");
        } else {
            println!("Nothing to cancel: {} is {}.", entity_id, state);
        }
        return Ok(());
    }

    if !yes {
        let confirmed = Confirm::new()
            .with_prompt(format!("Cancel the registration of {}?", entity_id))
            .default(false)
            .interact()
            .context("Failed to read confirmation")?;
        if !confirmed {
            println!("Aborted.");
            return Ok(());
        }
    }

    let status = registrar.cancel(entity_id).await?;
    print_status(entity_id, &status);
    Ok(())
}

pub async fn cmd_retry(project_dir: &Path, cli: &Cli, entity_id: &str) -> Result<()> {
    let registrar = build_registrar(project_dir, cli)?;
    let status = registrar
        .retry(entity_id)
        .await
        .with_context(|| format!("Failed to reset {}", entity_id))?;
    print_status(entity_id, &status);
    println!("Run 'uat-registrar register' to dispatch a new attempt.");
    Ok(())
}
