use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use tracing::{error, info};

use crate::models::{override_snapshot_label, Assignment};
use crate::zfs::ZfsClient;

// ─── Planning ───────────────────────────────────────────────────────────────

/// One snapshot the scheduler has decided to take this run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotAction {
    /// Recursive snapshot of every student dataset at an assignment's due date.
    All { label: String },
    /// Per-student snapshot at an override's due date.
    User { student_id: u64, label: String },
}

impl SnapshotAction {
    pub fn label(&self) -> &str {
        match self {
            SnapshotAction::All { label } | SnapshotAction::User { label, .. } => label,
        }
    }
}

/// Decide which snapshots are outstanding: past-due assignments and overrides
/// whose labels are not yet in the taken set. Pure; the taken set only ever
/// grows, so recorded labels never become candidates again.
pub fn plan_snapshots(
    assignments: &[Assignment],
    taken: &BTreeSet<String>,
    now: DateTime<Utc>,
) -> Vec<SnapshotAction> {
    let mut actions = Vec::new();
    for a in assignments {
        if a.is_past_due(now) && !taken.contains(&a.name) {
            actions.push(SnapshotAction::All {
                label: a.name.clone(),
            });
        }
        for over in &a.overrides {
            let Some(due) = over.due_at else { continue };
            let Some(&student_id) = over.student_ids.first() else {
                continue;
            };
            let label = override_snapshot_label(&a.name, over.id);
            if due < now && !taken.contains(&label) {
                actions.push(SnapshotAction::User { student_id, label });
            }
        }
    }
    actions
}

// ─── Execution ──────────────────────────────────────────────────────────────

/// Take every planned snapshot, recording successful labels. A per-user
/// snapshot that fails with "dataset does not exist" is recorded anyway:
/// the student never created their folder, which counts as a missing
/// submission and must not be re-attempted every run. Any other failure
/// leaves the label absent so the next run retries.
pub async fn take_snapshots(
    zfs: &ZfsClient,
    assignments: &[Assignment],
    taken: &mut BTreeSet<String>,
    now: DateTime<Utc>,
) {
    for action in plan_snapshots(assignments, taken, now) {
        match &action {
            SnapshotAction::All { label } => {
                info!("Assignment {label} is past due with no snapshot yet; snapshotting");
                match zfs.snapshot_all(label).await {
                    Ok(()) => {
                        taken.insert(label.clone());
                    }
                    Err(e) => {
                        error!("Error creating snapshot {label}: {e}; not recording it");
                    }
                }
            }
            SnapshotAction::User { student_id, label } => {
                info!("Override snapshot {label} outstanding for student {student_id}; snapshotting");
                match zfs.snapshot_user(&student_id.to_string(), label).await {
                    Ok(()) => {
                        taken.insert(label.clone());
                    }
                    Err(e) if e.is_missing_dataset() => {
                        info!(
                            "Student {student_id} has no dataset; recording {label} as a missing submission"
                        );
                        taken.insert(label.clone());
                    }
                    Err(e) => {
                        error!("Error creating snapshot {label}: {e}; not recording it");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Override;
    use chrono::TimeZone;

    fn t(day: u32, sec: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, day, 0, 0, sec).unwrap()
    }

    fn assignment(name: &str, due_day: Option<u32>, overrides: Vec<Override>) -> Assignment {
        Assignment {
            id: 1,
            name: name.into(),
            due_at: due_day.map(|d| t(d, 0)),
            unlock_at: None,
            lock_at: None,
            points_possible: None,
            published: Some(true),
            overrides,
        }
    }

    fn over(id: u64, student: u64, due: Option<DateTime<Utc>>) -> Override {
        Override {
            id,
            student_ids: vec![student],
            title: None,
            due_at: due,
            unlock_at: None,
            lock_at: None,
        }
    }

    #[test]
    fn plans_nothing_before_due() {
        let assignments = vec![assignment("hw1", Some(10), vec![])];
        let taken = BTreeSet::new();
        // Strictly before, and exactly at, the due instant: not yet due.
        assert!(plan_snapshots(&assignments, &taken, t(9, 59)).is_empty());
        assert!(plan_snapshots(&assignments, &taken, t(10, 0)).is_empty());
        // One second past.
        let actions = plan_snapshots(&assignments, &taken, t(10, 1));
        assert_eq!(actions, vec![SnapshotAction::All { label: "hw1".into() }]);
    }

    #[test]
    fn taken_labels_never_become_candidates_again() {
        let assignments = vec![assignment("hw1", Some(10), vec![])];
        let mut taken = BTreeSet::new();
        taken.insert("hw1".to_string());
        assert!(plan_snapshots(&assignments, &taken, t(20, 0)).is_empty());
    }

    #[test]
    fn override_snapshots_use_override_label() {
        let assignments = vec![assignment(
            "hw1",
            Some(10),
            vec![over(12, 7, Some(t(15, 0))), over(13, 8, None)],
        )];
        let mut taken = BTreeSet::new();
        taken.insert("hw1".to_string());

        // Override 12 past due; override 13 has no due date and is skipped.
        let actions = plan_snapshots(&assignments, &taken, t(16, 0));
        assert_eq!(
            actions,
            vec![SnapshotAction::User {
                student_id: 7,
                label: "hw1-override-12".into()
            }]
        );
    }

    #[test]
    fn assignment_without_due_date_is_skipped() {
        let assignments = vec![assignment("project", None, vec![])];
        assert!(plan_snapshots(&assignments, &BTreeSet::new(), t(20, 0)).is_empty());
    }
}
