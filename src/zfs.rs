use std::path::Path;
use std::process::Output;
use tokio::process::Command;
use tracing::info;

// ─── Error types ────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ZfsError {
    #[error("`{command}` exited with status {status}: {output}")]
    CommandFailed {
        command: String,
        status: i32,
        output: String,
    },
    #[error("Failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
}

impl ZfsError {
    /// A student who never created their dataset reports this on
    /// per-user snapshots; the scheduler records it as a missing
    /// submission instead of retrying every run.
    pub fn is_missing_dataset(&self) -> bool {
        matches!(self, ZfsError::CommandFailed { output, .. }
            if output.contains("dataset does not exist"))
    }
}

// ─── Client ─────────────────────────────────────────────────────────────────

/// Interface to the snapshotting filesystem. Student datasets live under the
/// student folder root and are what snapshots address; grader datasets live
/// under the user folder root.
#[derive(Debug, Clone)]
pub struct ZfsClient {
    user_folder_root: String,
    student_folder_root: String,
    dry_run: bool,
}

async fn run_command(program: &str, args: &[&str]) -> Result<String, ZfsError> {
    let display = format!("{program} {}", args.join(" "));
    let output: Output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|source| ZfsError::Spawn {
            command: display.clone(),
            source,
        })?;

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));

    if output.status.success() {
        Ok(combined)
    } else {
        Err(ZfsError::CommandFailed {
            command: display,
            status: output.status.code().unwrap_or(-1),
            output: combined,
        })
    }
}

impl ZfsClient {
    pub fn new(user_folder_root: &str, student_folder_root: &str, dry_run: bool) -> Self {
        Self {
            user_folder_root: user_folder_root.trim_end_matches('/').to_string(),
            student_folder_root: student_folder_root.trim_end_matches('/').to_string(),
            dry_run,
        }
    }

    fn student_dataset(&self, name: &str) -> String {
        format!(
            "{}/{name}",
            self.student_folder_root.trim_start_matches('/')
        )
    }

    fn user_dataset(&self, name: &str) -> String {
        format!("{}/{name}", self.user_folder_root.trim_start_matches('/'))
    }

    /// Recursive snapshot of every student dataset under the root.
    pub async fn snapshot_all(&self, label: &str) -> Result<(), ZfsError> {
        let target = format!("{}@{label}", self.student_folder_root.trim_start_matches('/'));
        if self.dry_run {
            info!("[dry run] would run: zfs snapshot -r {target}");
            return Ok(());
        }
        run_command("zfs", &["snapshot", "-r", &target]).await?;
        Ok(())
    }

    /// Snapshot a single student's dataset.
    pub async fn snapshot_user(&self, user: &str, label: &str) -> Result<(), ZfsError> {
        let target = format!("{}@{label}", self.student_dataset(user));
        if self.dry_run {
            info!("[dry run] would run: zfs snapshot {target}");
            return Ok(());
        }
        run_command("zfs", &["snapshot", &target]).await?;
        Ok(())
    }

    pub async fn user_folder_exists(&self, name: &str) -> Result<bool, ZfsError> {
        let dataset = self.user_dataset(name);
        match run_command("zfs", &["list", "-H", "-o", "name", &dataset]).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_missing_dataset() => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn create_user_folder(&self, name: &str) -> Result<(), ZfsError> {
        let dataset = self.user_dataset(name);
        if self.dry_run {
            info!("[dry run] would run: zfs create {dataset}");
            return Ok(());
        }
        run_command("zfs", &["create", &dataset]).await?;
        Ok(())
    }

    /// Hand ownership of a collected or returned file to the hub's
    /// execution user so it is readable on the hub.
    pub async fn chown(&self, user: &str, path: &Path) -> Result<(), ZfsError> {
        let spec = format!("{user}:{user}");
        let path = path.display().to_string();
        if self.dry_run {
            info!("[dry run] would run: chown {spec} {path}");
            return Ok(());
        }
        run_command("chown", &[&spec, &path]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_dataset_recognized_from_command_output() {
        let missing = ZfsError::CommandFailed {
            command: "zfs snapshot tank/student/7@hw1-override-12".into(),
            status: 1,
            output: "cannot open 'tank/student/7': dataset does not exist\n".into(),
        };
        assert!(missing.is_missing_dataset());

        let busy = ZfsError::CommandFailed {
            command: "zfs snapshot tank/student@hw1".into(),
            status: 1,
            output: "cannot create snapshot: pool is busy\n".into(),
        };
        assert!(!busy.is_missing_dataset());
    }
}
