use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::submission::Submission;

// ─── Persisted shapes ───────────────────────────────────────────────────────

/// Durable submission state: the map keyed `"<assignment>-<student-id>"`
/// plus the grader rotation cursor. The cursor persists so grader
/// assignment stays stable across runs; rebalancing requires an operator
/// reset of this file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmissionState {
    #[serde(default)]
    pub grader_index: usize,
    #[serde(default)]
    pub submissions: BTreeMap<String, Submission>,
}

// ─── Atomic write ───────────────────────────────────────────────────────────

/// Best-effort atomic write: temp file in the same directory, then rename.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, contents)
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to move {} into place", tmp.display()))?;
    Ok(())
}

// ─── Store ──────────────────────────────────────────────────────────────────

/// Owns the two durable files per course: the taken-snapshot label set and
/// the submission map. Loads tolerate missing files (fresh course); saves
/// are skipped entirely under dry-run.
#[derive(Debug, Clone)]
pub struct StateStore {
    snapshots_path: PathBuf,
    submissions_path: PathBuf,
    dry_run: bool,
}

impl StateStore {
    pub fn new(course_dir: &Path, course_name: &str, dry_run: bool) -> Self {
        Self {
            snapshots_path: course_dir.join(format!("{course_name}_snapshots.json")),
            submissions_path: course_dir.join(format!("{course_name}_submissions.json")),
            dry_run,
        }
    }

    pub fn load_snapshots(&self) -> Result<BTreeSet<String>> {
        if !self.snapshots_path.exists() {
            info!("No snapshots file found; starting with an empty list");
            return Ok(BTreeSet::new());
        }
        let contents = std::fs::read_to_string(&self.snapshots_path)
            .with_context(|| format!("Failed to read {}", self.snapshots_path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", self.snapshots_path.display()))
    }

    pub fn save_snapshots(&self, snapshots: &BTreeSet<String>) -> Result<()> {
        if self.dry_run {
            info!("[dry run] snapshot list not saved");
            return Ok(());
        }
        let json = serde_json::to_string_pretty(snapshots)?;
        write_atomic(&self.snapshots_path, &json)
    }

    pub fn load_submissions(&self) -> Result<SubmissionState> {
        if !self.submissions_path.exists() {
            info!("No submissions file found; starting with an empty map");
            return Ok(SubmissionState::default());
        }
        let contents = std::fs::read_to_string(&self.submissions_path)
            .with_context(|| format!("Failed to read {}", self.submissions_path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", self.submissions_path.display()))
    }

    pub fn save_submissions(&self, state: &SubmissionState) -> Result<()> {
        if self.dry_run {
            info!("[dry run] submissions not saved");
            return Ok(());
        }
        let json = serde_json::to_string_pretty(state)?;
        write_atomic(&self.submissions_path, &json)
    }
}
