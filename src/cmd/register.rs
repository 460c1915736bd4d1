//! Dispatch and follow (`uat-registrar register|resume`).

use std::path::Path;

use anyhow::{Context, Result};
use console::style;

use uat_registrar::RegistrationRequest;

use super::super::Cli;
use super::build_registrar;
use super::status::print_status;

pub async fn cmd_register(
    project_dir: &Path,
    cli: &Cli,
    request: RegistrationRequest,
    detach: bool,
) -> Result<()> {
    let registrar = build_registrar(project_dir, cli)?;
    let entity_id = request.entity_id.clone();

    let poller = registrar
        .start(&request)
        .await
        .with_context(|| format!("Failed to start registration for {}", entity_id))?;

    println!(
        "{} {} ({})",
        style("Dispatched").green().bold(),
        entity_id,
        style(poller.token()).dim()
    );

    if detach {
        println!("Run 'uat-registrar resume' to follow it.");
        return Ok(());
    }

    let status = registrar.drive(poller).await;
    println!();
    print_status(&entity_id, &status);

    if status.error().is_some() {
        anyhow::bail!("Registration of {} ended in {}", entity_id, status.state());
    }
    Ok(())
}

pub async fn cmd_resume(project_dir: &Path, cli: &Cli) -> Result<()> {
    let registrar = build_registrar(project_dir, cli)?;
    let finished = registrar
        .resume_all()
        .await
        .context("Failed to resume registrations")?;

    if finished.is_empty() {
        println!("No registrations in progress.");
        return Ok(());
    }

    let mut failed = 0;
    for (entity_id, status) in &finished {
        print_status(entity_id, status);
        println!();
        if status.error().is_some() {
            failed += 1;
        }
    }
    if failed > 0 {
        anyhow::bail!("{} of {} registrations failed", failed, finished.len());
    }
    Ok(())
}
