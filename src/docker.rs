use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tokio::task::JoinSet;
use tracing::info;

// ─── Error types ────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum DockerError {
    #[error("Container command `{command}` exited with status {status}: {output}")]
    CommandFailed {
        command: String,
        status: i32,
        output: String,
    },
    #[error("Failed to run container: {0}")]
    Spawn(#[from] std::io::Error),
}

// ─── Jobs ───────────────────────────────────────────────────────────────────

/// Outcome of one batched container job, joined back to its submission by
/// the opaque job id.
#[derive(Debug, Clone)]
pub struct JobResult {
    pub log: String,
    pub exit_status: Option<i32>,
}

#[derive(Debug, Clone)]
struct PendingJob {
    id: String,
    command: String,
    workdir: PathBuf,
}

// ─── Runner ─────────────────────────────────────────────────────────────────

/// Container runner: jobs are submitted during a pass, then executed
/// concurrently in one wave by `run_all`. `run` executes a single command
/// synchronously for the provisioner.
#[derive(Debug)]
pub struct DockerRunner {
    image: String,
    dry_run: bool,
    next_job: u64,
    pending: Vec<PendingJob>,
}

fn container_args(image: &str, command: &str, workdir: &Path) -> Vec<String> {
    vec![
        "run".into(),
        "--rm".into(),
        "-v".into(),
        format!("{}:/workdir", workdir.display()),
        "-w".into(),
        "/workdir".into(),
        image.into(),
        "sh".into(),
        "-c".into(),
        command.into(),
    ]
}

async fn run_container(image: &str, command: &str, workdir: &Path) -> JobResult {
    let args = container_args(image, command, workdir);
    let output = match Command::new("docker").args(&args).output().await {
        Ok(o) => o,
        Err(e) => {
            // Surface spawn failures through the log contract so the
            // validation pass records them like any other grading error.
            return JobResult {
                log: format!("ERROR: failed to run container: {e}"),
                exit_status: None,
            };
        }
    };
    let mut log = String::from_utf8_lossy(&output.stdout).into_owned();
    log.push_str(&String::from_utf8_lossy(&output.stderr));
    JobResult {
        log,
        exit_status: output.status.code(),
    }
}

impl DockerRunner {
    pub fn new(image: &str, dry_run: bool) -> Self {
        Self {
            image: image.to_string(),
            dry_run,
            next_job: 0,
            pending: Vec::new(),
        }
    }

    /// Queue a command for the next `run_all` wave and hand back its job id.
    /// The id is an opaque token; callers only use it to join results.
    pub fn submit(&mut self, command: &str, workdir: &Path) -> String {
        let id = format!("job-{}", self.next_job);
        self.next_job += 1;
        self.pending.push(PendingJob {
            id: id.clone(),
            command: command.to_string(),
            workdir: workdir.to_path_buf(),
        });
        id
    }

    /// Run every pending job concurrently and join the results by job id.
    pub async fn run_all(&mut self) -> HashMap<String, JobResult> {
        let jobs = std::mem::take(&mut self.pending);
        let mut results = HashMap::with_capacity(jobs.len());

        if self.dry_run {
            for job in jobs {
                info!("[dry run] would run in {}: {}", job.workdir.display(), job.command);
                results.insert(
                    job.id,
                    JobResult {
                        log: String::new(),
                        exit_status: Some(0),
                    },
                );
            }
            return results;
        }

        let mut set = JoinSet::new();
        for job in jobs {
            let image = self.image.clone();
            set.spawn(async move {
                let result = run_container(&image, &job.command, &job.workdir).await;
                (job.id, result)
            });
        }
        while let Some(joined) = set.join_next().await {
            if let Ok((id, result)) = joined {
                results.insert(id, result);
            }
        }
        results
    }

    /// Run one command to completion and return its combined output. Used by
    /// the provisioner, whose steps are sequential and idempotent.
    pub async fn run(&self, command: &str, workdir: &Path) -> Result<String, DockerError> {
        if self.dry_run {
            info!("[dry run] would run in {}: {command}", workdir.display());
            return Ok(String::new());
        }
        let result = run_container(&self.image, command, workdir).await;
        match result.exit_status {
            Some(0) => Ok(result.log),
            status => Err(DockerError::CommandFailed {
                command: command.to_string(),
                status: status.unwrap_or(-1),
                output: result.log,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_ids_are_unique_and_opaque() {
        let mut runner = DockerRunner::new("img", true);
        let a = runner.submit("true", Path::new("/tmp"));
        let b = runner.submit("true", Path::new("/tmp"));
        assert_ne!(a, b);
        assert_eq!(runner.pending.len(), 2);
    }

    #[tokio::test]
    async fn dry_run_wave_reports_success_for_all_jobs() {
        let mut runner = DockerRunner::new("img", true);
        let a = runner.submit("nbgrader autograde", Path::new("/tmp"));
        let b = runner.submit("nbgrader generate_feedback", Path::new("/tmp"));
        let results = runner.run_all().await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[&a].exit_status, Some(0));
        assert!(results[&b].log.is_empty());
        assert!(runner.pending.is_empty());
    }
}
