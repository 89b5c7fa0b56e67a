use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::path::Path;
use tokio::process::Command;
use tracing::{error, info};

use crate::config::CourseConfig;
use crate::docker::DockerRunner;
use crate::hub::HubClient;
use crate::models::Assignment;
use crate::zfs::ZfsClient;

/// Ensure every past-due assignment has its grader slots fully provisioned:
/// a dataset, a clone of the instructor repo, the generated assignment, the
/// solution HTML, and a hub account mapped to the human grader. Every step
/// checks existence first, so a provisioned course is a no-op.
///
/// A missing or short `graders` config entry is fatal; other failures skip
/// the assignment for this run and are retried on the next.
pub async fn provision_graders(
    config: &CourseConfig,
    zfs: &ZfsClient,
    hub: &HubClient,
    docker: &DockerRunner,
    assignments: &[Assignment],
    now: DateTime<Utc>,
    dry_run: bool,
) -> Result<()> {
    for a in assignments {
        if !a.is_past_due(now) {
            continue;
        }
        // Validate the grader mapping up front so a config hole aborts
        // before this assignment mutates anything.
        for slot in 0..config.num_graders {
            config.grader_account(&a.name, slot)?;
        }
        for slot in 0..config.num_graders {
            let grader = config.grader_name(&a.name, slot);
            info!("Checking assignment {} grader {grader}", a.name);
            if let Err(e) = provision_slot(config, zfs, hub, docker, a, slot, &grader, dry_run).await
            {
                error!("Error provisioning {grader}: {e:#}; skipping assignment {} this run", a.name);
                break;
            }
        }
    }
    Ok(())
}

async fn provision_slot(
    config: &CourseConfig,
    zfs: &ZfsClient,
    hub: &HubClient,
    docker: &DockerRunner,
    assignment: &Assignment,
    slot: usize,
    grader: &str,
    dry_run: bool,
) -> Result<()> {
    if !zfs.user_folder_exists(grader).await? {
        info!("No dataset for {grader} yet; creating");
        zfs.create_user_folder(grader).await?;
    }

    let repo_path = config.grader_repo_path(grader);
    if !repo_path.exists() {
        clone_instructor_repo(config, &repo_path, dry_run).await?;
    }

    // nbgrader records generated assignments in its database; generate on
    // first sight only.
    let generated = docker.run("nbgrader db assignment list", &repo_path).await?;
    if !generated.contains(&assignment.name) {
        info!("Assignment {} not yet generated in {grader}; generating", assignment.name);
        docker
            .run(
                &format!("nbgrader generate_assignment --force {}", assignment.name),
                &repo_path,
            )
            .await?;
    }

    let solution = repo_path.join(format!("{}_solution.html", assignment.name));
    if !solution.exists() && !dry_run {
        info!("Solution for {} not rendered in {grader}; rendering", assignment.name);
        docker
            .run(
                &format!(
                    "jupyter nbconvert source/{a}/{a}.ipynb --output={a}_solution.html --output-dir=.",
                    a = assignment.name
                ),
                &repo_path,
            )
            .await?;
    }

    if !hub.grader_exists(grader).await? {
        let human = config.grader_account(&assignment.name, slot)?;
        info!("Grader {grader} not on the hub yet; assigning {human}");
        hub.assign_grader(grader, human).await?;
    }

    Ok(())
}

async fn clone_instructor_repo(
    config: &CourseConfig,
    repo_path: &Path,
    dry_run: bool,
) -> Result<()> {
    info!(
        "Cloning instructor repository {} into {}",
        config.instructor_repo_url,
        repo_path.display()
    );
    if dry_run {
        info!("[dry run] would run: git clone");
        return Ok(());
    }

    let output = Command::new("git")
        .arg("clone")
        .arg(&config.instructor_repo_url)
        .arg(repo_path)
        .output()
        .await
        .context("Failed to run git")?;

    if !output.status.success() {
        // A half-cloned directory would shadow the existence check forever.
        if repo_path.exists() {
            std::fs::remove_dir_all(repo_path)
                .with_context(|| format!("Failed to purge partial clone {}", repo_path.display()))?;
        }
        anyhow::bail!(
            "git clone exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr)
        );
    }
    Ok(())
}
