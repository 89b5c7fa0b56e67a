use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::config::CourseConfig;
use crate::models::{Assignment, Person};

pub fn submission_key(assignment_name: &str, student_id: u64) -> String {
    format!("{assignment_name}-{student_id}")
}

// ─── Display status ─────────────────────────────────────────────────────────

/// Operator-facing pipeline position, derived from the phase flags. Ordered:
/// a submission's status never decreases across runs unless an operator
/// resets it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SubmissionStatus {
    Assigned,
    Collected,
    Cleaned,
    Autograded,
    NeedsManualGrading,
    Graded,
    FeedbackGenerated,
    GradeUploaded,
    GradePosted,
    FeedbackReturned,
    Missing,
}

impl fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SubmissionStatus::Assigned => "assigned",
            SubmissionStatus::Collected => "collected",
            SubmissionStatus::Cleaned => "cleaned",
            SubmissionStatus::Autograded => "autograded",
            SubmissionStatus::NeedsManualGrading => "needs manual grading",
            SubmissionStatus::Graded => "graded",
            SubmissionStatus::FeedbackGenerated => "feedback generated",
            SubmissionStatus::GradeUploaded => "grade uploaded",
            SubmissionStatus::GradePosted => "grade posted",
            SubmissionStatus::FeedbackReturned => "feedback returned",
            SubmissionStatus::Missing => "missing",
        };
        f.write_str(label)
    }
}

// ─── Submission ─────────────────────────────────────────────────────────────

/// One (assignment, student) unit of pipeline work. Each pipeline phase owns
/// one boolean flag; flags only ever go from false to true, and the derived
/// `status()` reports the furthest phase reached. `missing` is terminal: the
/// snapshot held no notebook, the score is zero, and only grade upload still
/// applies.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Submission {
    pub assignment_id: u64,
    pub assignment_name: String,
    pub student_id: u64,
    pub student_name: String,
    /// Grader slot this submission is pinned to, e.g. `hw1-grader-2`.
    pub grader: String,

    pub due_date: Option<DateTime<Utc>>,
    /// Snapshot label the notebook is collected from. Stable once the
    /// snapshot has been taken under it.
    pub snap_name: String,

    #[serde(default)]
    pub collected: bool,
    #[serde(default)]
    pub cleaned: bool,
    #[serde(default)]
    pub autograded: bool,
    #[serde(default)]
    pub needs_manual_grading: bool,
    #[serde(default)]
    pub graded: bool,
    #[serde(default)]
    pub feedback_generated: bool,
    #[serde(default)]
    pub grade_uploaded: bool,
    #[serde(default)]
    pub grade_posted: bool,
    #[serde(default)]
    pub solution_returned: bool,
    #[serde(default)]
    pub feedback_returned: bool,
    #[serde(default)]
    pub missing: bool,

    pub score: Option<f64>,
    pub max_score: Option<f64>,
    /// Most recent per-submission failure; cleared by the next success.
    pub error: Option<String>,
    pub solution_return_error: Option<String>,

    /// Container job token from the current run's wave, if one is in flight.
    #[serde(default)]
    pub job_id: Option<String>,
}

impl Submission {
    pub fn new(assignment: &Assignment, student: &Person, grader: String) -> Self {
        let mut subm = Submission {
            assignment_id: assignment.id,
            assignment_name: assignment.name.clone(),
            student_id: student.id,
            student_name: student.name.clone(),
            grader,
            ..Submission::default()
        };
        subm.update_due(assignment, student);
        subm
    }

    /// Re-resolve the due date and snapshot label from the current LMS view.
    /// Only meaningful before collection; afterwards the label is frozen by
    /// the snapshot that was actually taken.
    pub fn update_due(&mut self, assignment: &Assignment, student: &Person) {
        let (due, _) = assignment.resolved_due(student.id);
        self.due_date = due;
        self.snap_name = assignment.snapshot_label(student.id);
    }

    pub fn key(&self) -> String {
        submission_key(&self.assignment_name, self.student_id)
    }

    pub fn status(&self) -> SubmissionStatus {
        if self.missing {
            SubmissionStatus::Missing
        } else if self.feedback_returned {
            SubmissionStatus::FeedbackReturned
        } else if self.grade_posted {
            SubmissionStatus::GradePosted
        } else if self.grade_uploaded {
            SubmissionStatus::GradeUploaded
        } else if self.feedback_generated {
            SubmissionStatus::FeedbackGenerated
        } else if self.graded {
            SubmissionStatus::Graded
        } else if self.needs_manual_grading {
            SubmissionStatus::NeedsManualGrading
        } else if self.autograded {
            SubmissionStatus::Autograded
        } else if self.cleaned {
            SubmissionStatus::Cleaned
        } else if self.collected {
            SubmissionStatus::Collected
        } else {
            SubmissionStatus::Assigned
        }
    }

    // ── Phase preconditions ─────────────────────────────────────────────
    //
    // Each pipeline phase checks one of these before acting, which is what
    // enforces the pipeline ordering: a later flag can only be set once
    // every earlier phase has completed.

    pub fn ready_to_collect(&self, now: DateTime<Utc>) -> bool {
        !self.collected
            && !self.missing
            && self.due_date.is_some_and(|due| due < now)
    }

    pub fn ready_to_clean(&self) -> bool {
        self.collected && !self.cleaned && !self.missing
    }

    pub fn ready_for_autograde(&self) -> bool {
        self.cleaned && !self.autograded && !self.missing
    }

    /// Consult the gradebook after autograding, and keep consulting it on
    /// later runs while the submission waits on a human grader.
    pub fn ready_for_grade_resolution(&self) -> bool {
        self.autograded && !self.graded && !self.missing
    }

    pub fn ready_for_feedback(&self) -> bool {
        self.graded && !self.feedback_generated && !self.missing
    }

    /// Missing submissions skip straight here with a zero score.
    pub fn ready_for_grade_upload(&self) -> bool {
        (self.feedback_generated || self.missing) && !self.grade_uploaded
    }

    pub fn ready_for_feedback_return(&self) -> bool {
        self.grade_uploaded && !self.feedback_returned && !self.missing
    }

    pub fn record_error(&mut self, err: impl fmt::Display) {
        self.error = Some(format!("{err}"));
    }

    pub fn clear_error(&mut self) {
        self.error = None;
    }

    /// nbgrader's identifier for this student inside the grader repo.
    pub fn nbgrader_student(&self, config: &CourseConfig) -> String {
        format!("{}{}", config.student_prefix, self.student_id)
    }

    // ── Derived paths ───────────────────────────────────────────────────

    pub fn grader_repo_path(&self, config: &CourseConfig) -> PathBuf {
        config.grader_repo_path(&self.grader)
    }

    /// The snapshotted source notebook inside the student's dataset.
    pub fn snapshot_source_path(&self, config: &CourseConfig) -> PathBuf {
        config
            .student_folder(self.student_id)
            .join(".zfs/snapshot")
            .join(&self.snap_name)
            .join(&config.student_course_path)
            .join(&self.assignment_name)
            .join(format!("{}.ipynb", self.assignment_name))
    }

    /// Where the collected notebook lands inside the grader repo.
    pub fn submitted_notebook_path(&self, config: &CourseConfig) -> PathBuf {
        self.grader_repo_path(config)
            .join("submitted")
            .join(self.nbgrader_student(config))
            .join(&self.assignment_name)
            .join(format!("{}.ipynb", self.assignment_name))
    }

    pub fn release_notebook_path(&self, config: &CourseConfig) -> PathBuf {
        self.grader_repo_path(config)
            .join("release")
            .join(&self.assignment_name)
            .join(format!("{}.ipynb", self.assignment_name))
    }

    pub fn gradebook_path(&self, config: &CourseConfig) -> PathBuf {
        self.grader_repo_path(config).join("gradebook.db")
    }

    pub fn feedback_grader_path(&self, config: &CourseConfig) -> PathBuf {
        self.grader_repo_path(config)
            .join("feedback")
            .join(self.nbgrader_student(config))
            .join(&self.assignment_name)
            .join(format!("{}.html", self.assignment_name))
    }

    fn student_materials_dir(&self, config: &CourseConfig) -> PathBuf {
        config
            .student_folder(self.student_id)
            .join(&config.student_course_path)
            .join(&self.assignment_name)
    }

    pub fn feedback_student_path(&self, config: &CourseConfig) -> PathBuf {
        self.student_materials_dir(config)
            .join(format!("{}_feedback.html", self.assignment_name))
    }

    pub fn solution_grader_path(&self, config: &CourseConfig) -> PathBuf {
        self.grader_repo_path(config)
            .join(format!("{}_solution.html", self.assignment_name))
    }

    pub fn solution_student_path(&self, config: &CourseConfig) -> PathBuf {
        self.student_materials_dir(config)
            .join(format!("{}_solution.html", self.assignment_name))
    }

    #[cfg(test)]
    pub fn stub(assignment_name: &str, student_id: u64, grader: &str) -> Self {
        Submission {
            assignment_name: assignment_name.to_string(),
            student_id,
            grader: grader.to_string(),
            snap_name: assignment_name.to_string(),
            ..Submission::default()
        }
    }
}

// ─── Notebook handling ──────────────────────────────────────────────────────

/// Strip nbgrader metadata from cells whose grading id repeats an earlier
/// cell. Duplicate ids break autograding, so the duplicate cell is demoted
/// to a plain cell and the sanitized notebook is written back in place.
/// Returns how many cells were stripped.
pub fn clean_notebook(path: &Path) -> Result<usize> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read notebook {}", path.display()))?;
    let mut nb: serde_json::Value = serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse notebook {}", path.display()))?;

    let mut seen = HashSet::new();
    let mut stripped = 0;
    if let Some(cells) = nb.get_mut("cells").and_then(|c| c.as_array_mut()) {
        for cell in cells {
            let Some(grade_id) = cell
                .get("metadata")
                .and_then(|m| m.get("nbgrader"))
                .and_then(|g| g.get("grade_id"))
            else {
                continue;
            };
            let grade_id = grade_id.to_string();
            if seen.contains(&grade_id) {
                tracing::warn!(
                    "Duplicate grading cell {grade_id} in {}; removing its nbgrader metadata",
                    path.display()
                );
                if let Some(meta) = cell.get_mut("metadata").and_then(|m| m.as_object_mut()) {
                    meta.remove("nbgrader");
                    stripped += 1;
                }
            } else {
                seen.insert(grade_id);
            }
        }
    }

    let sanitized = serde_json::to_string(&nb)?;
    std::fs::write(path, sanitized)
        .with_context(|| format!("Failed to write sanitized notebook {}", path.display()))?;
    Ok(stripped)
}

/// Sum the point values over the grading cells of the release notebook.
/// nbgrader never exposes a max score itself, so percentages are computed
/// against this.
pub fn compute_max_score(release_nb_path: &Path) -> Result<f64> {
    let contents = std::fs::read_to_string(release_nb_path)
        .with_context(|| format!("Failed to read notebook {}", release_nb_path.display()))?;
    let nb: serde_json::Value = serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse notebook {}", release_nb_path.display()))?;

    let mut points = 0.0;
    if let Some(cells) = nb.get("cells").and_then(|c| c.as_array()) {
        for cell in cells {
            // Cells without nbgrader metadata or points are common; skip them.
            if let Some(p) = cell
                .get("metadata")
                .and_then(|m| m.get("nbgrader"))
                .and_then(|g| g.get("points"))
                .and_then(|p| p.as_f64())
            {
                points += p;
            }
        }
    }
    Ok(points)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;

    fn notebook_json(cells: serde_json::Value) -> String {
        serde_json::json!({
            "cells": cells,
            "metadata": {},
            "nbformat": 4,
            "nbformat_minor": 5,
        })
        .to_string()
    }

    fn grading_cell(grade_id: &str, points: f64) -> serde_json::Value {
        serde_json::json!({
            "cell_type": "code",
            "source": ["assert True"],
            "metadata": {
                "nbgrader": { "grade": true, "grade_id": grade_id, "points": points }
            }
        })
    }

    #[test]
    fn clean_strips_duplicate_grading_cells_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hw1.ipynb");
        let cells = serde_json::json!([
            grading_cell("q1", 1.0),
            serde_json::json!({ "cell_type": "markdown", "source": ["notes"], "metadata": {} }),
            grading_cell("q1", 1.0),
            grading_cell("q2", 2.0),
        ]);
        std::fs::write(&path, notebook_json(cells)).unwrap();

        assert_eq!(clean_notebook(&path).unwrap(), 1);

        let nb: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let cells = nb["cells"].as_array().unwrap();
        assert!(cells[0]["metadata"].get("nbgrader").is_some());
        assert!(cells[2]["metadata"].get("nbgrader").is_none());
        assert!(cells[3]["metadata"].get("nbgrader").is_some());

        // Re-cleaning is a no-op.
        assert_eq!(clean_notebook(&path).unwrap(), 0);
    }

    #[test]
    fn max_score_sums_grading_cells() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hw1.ipynb");
        let cells = serde_json::json!([
            grading_cell("q1", 1.5),
            grading_cell("q2", 2.0),
            serde_json::json!({ "cell_type": "markdown", "source": [], "metadata": {} }),
        ]);
        std::fs::write(&path, notebook_json(cells)).unwrap();
        assert_eq!(compute_max_score(&path).unwrap(), 3.5);
    }

    #[test]
    fn status_derives_from_furthest_flag() {
        let mut s = Submission::stub("hw1", 7, "hw1-grader-0");
        assert_eq!(s.status(), SubmissionStatus::Assigned);
        s.collected = true;
        assert_eq!(s.status(), SubmissionStatus::Collected);
        s.cleaned = true;
        assert_eq!(s.status(), SubmissionStatus::Cleaned);
        s.autograded = true;
        assert_eq!(s.status(), SubmissionStatus::Autograded);
        s.needs_manual_grading = true;
        assert_eq!(s.status(), SubmissionStatus::NeedsManualGrading);
        s.graded = true;
        assert_eq!(s.status(), SubmissionStatus::Graded);
        s.feedback_generated = true;
        assert_eq!(s.status(), SubmissionStatus::FeedbackGenerated);
        s.grade_uploaded = true;
        assert_eq!(s.status(), SubmissionStatus::GradeUploaded);
        s.grade_posted = true;
        assert_eq!(s.status(), SubmissionStatus::GradePosted);
        s.feedback_returned = true;
        assert_eq!(s.status(), SubmissionStatus::FeedbackReturned);
    }

    #[test]
    fn status_ordering_matches_pipeline_order() {
        assert!(SubmissionStatus::Assigned < SubmissionStatus::Collected);
        assert!(SubmissionStatus::NeedsManualGrading < SubmissionStatus::Graded);
        assert!(SubmissionStatus::GradeUploaded < SubmissionStatus::GradePosted);
        assert!(SubmissionStatus::GradePosted < SubmissionStatus::FeedbackReturned);
    }

    #[test]
    fn missing_is_terminal_for_display() {
        let mut s = Submission::stub("hw1", 7, "hw1-grader-0");
        s.missing = true;
        s.grade_uploaded = true;
        assert_eq!(s.status(), SubmissionStatus::Missing);
    }

    #[test]
    fn derived_paths_follow_grader_repo_layout() {
        let cfg = test_config();
        let mut s = Submission::stub("hw1", 7, "hw1-grader-0");
        s.snap_name = "hw1-override-12".into();
        assert_eq!(
            s.snapshot_source_path(&cfg),
            PathBuf::from(
                "/tank/student/7/.zfs/snapshot/hw1-override-12/dsci-100/materials/hw1/hw1.ipynb"
            )
        );
        assert_eq!(
            s.submitted_notebook_path(&cfg),
            PathBuf::from("/tank/home/hw1-grader-0/instructor/submitted/student_7/hw1/hw1.ipynb")
        );
        assert_eq!(
            s.feedback_student_path(&cfg),
            PathBuf::from("/tank/student/7/dsci-100/materials/hw1/hw1_feedback.html")
        );
        assert_eq!(
            s.solution_grader_path(&cfg),
            PathBuf::from("/tank/home/hw1-grader-0/instructor/hw1_solution.html")
        );
    }

    #[test]
    fn collection_requires_past_due() {
        use chrono::TimeZone;
        let due = chrono::Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap();
        let mut s = Submission::stub("hw1", 7, "hw1-grader-0");
        s.due_date = Some(due);
        // Exactly at the due instant the submission is not yet collectable.
        assert!(!s.ready_to_collect(due));
        assert!(s.ready_to_collect(due + chrono::Duration::seconds(1)));
        s.collected = true;
        assert!(!s.ready_to_collect(due + chrono::Duration::seconds(1)));
    }

    #[test]
    fn phases_gate_on_their_predecessors() {
        let mut s = Submission::stub("hw1", 7, "hw1-grader-0");
        // Nothing downstream of collection may fire on a fresh submission.
        assert!(!s.ready_to_clean());
        assert!(!s.ready_for_autograde());
        assert!(!s.ready_for_feedback());
        assert!(!s.ready_for_grade_upload());
        assert!(!s.ready_for_feedback_return());

        s.collected = true;
        assert!(s.ready_to_clean());
        assert!(!s.ready_for_autograde());
        s.cleaned = true;
        assert!(s.ready_for_autograde());
        s.autograded = true;
        assert!(s.ready_for_grade_resolution());
        s.graded = true;
        assert!(s.ready_for_feedback());
        s.feedback_generated = true;
        assert!(s.ready_for_grade_upload());
        s.grade_uploaded = true;
        assert!(s.ready_for_feedback_return());
        s.feedback_returned = true;
        assert!(!s.ready_for_feedback_return());
    }

    #[test]
    fn manual_grading_holds_feedback_until_resolved() {
        let mut s = Submission::stub("hw1", 7, "hw1-grader-0");
        s.collected = true;
        s.cleaned = true;
        s.autograded = true;
        s.needs_manual_grading = true;
        // Still waiting on a human: the gradebook keeps being consulted and
        // nothing downstream fires.
        assert!(s.ready_for_grade_resolution());
        assert!(!s.ready_for_feedback());
        s.graded = true;
        assert!(!s.ready_for_grade_resolution());
        assert!(s.ready_for_feedback());
        assert_eq!(s.status(), SubmissionStatus::Graded);
    }

    #[test]
    fn missing_submissions_only_upload_a_zero() {
        let mut s = Submission::stub("hw1", 7, "hw1-grader-0");
        s.missing = true;
        s.score = Some(0.0);
        assert!(!s.ready_to_collect(chrono::Utc::now()));
        assert!(!s.ready_to_clean());
        assert!(!s.ready_for_autograde());
        assert!(!s.ready_for_feedback());
        assert!(s.ready_for_grade_upload());
        s.grade_uploaded = true;
        assert!(!s.ready_for_feedback_return());
    }

    #[test]
    fn submission_key_format() {
        assert_eq!(submission_key("hw1", 42), "hw1-42");
        let s = Submission::stub("hw1", 42, "hw1-grader-1");
        assert_eq!(s.key(), "hw1-42");
    }
}
