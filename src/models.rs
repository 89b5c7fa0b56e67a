use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── Course ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CourseInfo {
    pub id: u64,
    pub name: Option<String>,
    pub course_code: Option<String>,
    pub time_zone: Option<String>,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
}

// ─── Assignments ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub id: u64,
    pub name: String,
    pub due_at: Option<DateTime<Utc>>,
    pub unlock_at: Option<DateTime<Utc>>,
    pub lock_at: Option<DateTime<Utc>>,
    pub points_possible: Option<f64>,
    pub published: Option<bool>,
    #[serde(default)]
    pub overrides: Vec<Override>,
}

/// A per-student modification of an assignment's dates, stored in the LMS.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Override {
    pub id: u64,
    #[serde(default)]
    pub student_ids: Vec<u64>,
    pub title: Option<String>,
    pub due_at: Option<DateTime<Utc>>,
    pub unlock_at: Option<DateTime<Utc>>,
    pub lock_at: Option<DateTime<Utc>>,
}

impl Override {
    pub fn applies_to(&self, student_id: u64) -> bool {
        self.student_ids.contains(&student_id)
    }

    /// True when this override targets a single student and no one else.
    pub fn applies_only_to(&self, student_id: u64) -> bool {
        self.student_ids == [student_id]
    }
}

impl Assignment {
    /// Past-due test used throughout the workflow. Strict: an assignment
    /// whose due date equals the current instant is not yet due.
    pub fn is_past_due(&self, now: DateTime<Utc>) -> bool {
        self.due_at.is_some_and(|due| due < now)
    }

    /// Resolve a student's effective due date: the base `due_at` unless an
    /// override applies, in which case the most recently created applicable
    /// override supersedes it. Canvas returns overrides in creation order,
    /// so the last applicable entry wins.
    pub fn resolved_due(&self, student_id: u64) -> (Option<DateTime<Utc>>, Option<&Override>) {
        match self.overrides.iter().rev().find(|o| o.applies_to(student_id)) {
            Some(over) => (over.due_at.or(self.due_at), Some(over)),
            None => (self.due_at, None),
        }
    }

    /// Snapshot label for a student's submission: the assignment name, or
    /// a per-override label when an override governs their due date.
    pub fn snapshot_label(&self, student_id: u64) -> String {
        match self.resolved_due(student_id).1 {
            Some(over) => override_snapshot_label(&self.name, over.id),
            None => self.name.clone(),
        }
    }

    /// Times invariant from the LMS: unlock must not come after due.
    pub fn times_consistent(&self) -> bool {
        match (self.unlock_at, self.due_at) {
            (Some(unlock), Some(due)) => unlock <= due,
            _ => true,
        }
    }
}

pub fn override_snapshot_label(assignment_name: &str, override_id: u64) -> String {
    format!("{assignment_name}-override-{override_id}")
}

// ─── People ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersonStatus {
    Active,
    Inactive,
}

/// An enrolled person: student, TA, instructor, or test student. The
/// registration timestamps come from the Canvas enrollment record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Person {
    pub id: u64,
    pub sis_id: Option<String>,
    pub name: String,
    pub sortable_name: String,
    pub reg_created: DateTime<Utc>,
    pub reg_updated: Option<DateTime<Utc>>,
    pub status: PersonStatus,
}

impl Person {
    pub fn is_active(&self) -> bool {
        self.status == PersonStatus::Active
    }

    /// Effective registration date: the last enrollment update if Canvas
    /// recorded one, otherwise the enrollment creation date.
    pub fn registration_date(&self) -> DateTime<Utc> {
        self.reg_updated.unwrap_or(self.reg_created)
    }
}
