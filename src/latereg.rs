use chrono::Duration;
use tracing::{error, info};

use crate::canvas::{CanvasClient, OverrideSpec};
use crate::models::{Assignment, Person};

// ─── Planning ───────────────────────────────────────────────────────────────

/// One extension the policy has decided to grant: optionally delete a
/// superseded single-student override, then create the replacement.
#[derive(Debug, Clone)]
pub struct PlannedExtension {
    pub assignment_id: u64,
    pub assignment_name: String,
    pub student_id: u64,
    pub student_name: String,
    pub remove_override_id: Option<u64>,
    pub spec: OverrideSpec,
}

/// Decide which late-registration extensions are owed. A student who
/// registered after an assignment unlocked gets `extension_days` from their
/// registration date; an extension is created only when that lands strictly
/// after their current effective due date. Pure.
pub fn plan_extensions(
    assignments: &[Assignment],
    students: &[Person],
    extension_days: i64,
) -> Vec<PlannedExtension> {
    let mut planned = Vec::new();
    for a in assignments {
        let (Some(unlock_at), Some(_)) = (a.unlock_at, a.due_at) else {
            info!(
                "Assignment {} missing a due or unlock date; not checking late registrations",
                a.name
            );
            continue;
        };
        for s in students {
            if !s.is_active() {
                continue;
            }
            let regdate = s.registration_date();
            if regdate <= unlock_at {
                continue;
            }
            let (due, over) = a.resolved_due(s.id);
            let Some(effective_due) = due else { continue };
            let latereg = regdate + Duration::days(extension_days);
            if latereg > effective_due {
                info!(
                    "Student {} registered {regdate} after {} unlocked; extending due date to {latereg}",
                    s.name, a.name
                );
                planned.push(PlannedExtension {
                    assignment_id: a.id,
                    assignment_name: a.name.clone(),
                    student_id: s.id,
                    student_name: s.name.clone(),
                    // Only a single-student override is ours to replace;
                    // group overrides are left alone.
                    remove_override_id: over
                        .filter(|o| o.applies_only_to(s.id))
                        .map(|o| o.id),
                    spec: OverrideSpec {
                        student_ids: vec![s.id],
                        title: format!("{}-{}-latereg", s.name, a.name),
                        due_at: Some(latereg),
                        unlock_at: a.unlock_at,
                        lock_at: a.lock_at,
                    },
                });
            }
        }
    }
    planned
}

// ─── Application ────────────────────────────────────────────────────────────

/// Apply planned extensions against the LMS. Returns true when anything was
/// written, in which case the caller must invalidate the cached view and
/// re-synchronize before any further reads. Individual failures are logged
/// and retried on the next run.
pub async fn apply_extensions(canvas: &CanvasClient, planned: &[PlannedExtension]) -> bool {
    let mut wrote = false;
    for ext in planned {
        if let Some(override_id) = ext.remove_override_id {
            match canvas.remove_override(ext.assignment_id, override_id).await {
                Ok(()) => wrote = true,
                Err(e) => {
                    error!(
                        "Failed to remove override {override_id} on {}: {e}",
                        ext.assignment_name
                    );
                    continue;
                }
            }
        }
        match canvas.create_override(ext.assignment_id, &ext.spec).await {
            Ok(()) => {
                wrote = true;
                info!(
                    "Created late registration override {:?} due {:?}",
                    ext.spec.title, ext.spec.due_at
                );
            }
            Err(e) => {
                error!(
                    "Failed to create override {:?} on {}: {e}",
                    ext.spec.title, ext.assignment_name
                );
            }
        }
    }
    wrote
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Override, PersonStatus};
    use chrono::{DateTime, TimeZone, Utc};

    fn t(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, day, 9, 0, 0).unwrap()
    }

    fn hw1(overrides: Vec<Override>) -> Assignment {
        Assignment {
            id: 11,
            name: "hw1".into(),
            due_at: Some(t(6)),     // T+5d relative to unlock on day 1
            unlock_at: Some(t(1)),  // T
            lock_at: Some(t(8)),    // T+7d
            points_possible: Some(10.0),
            published: Some(true),
            overrides,
        }
    }

    fn student(id: u64, name: &str, reg_day: u32) -> Person {
        Person {
            id,
            sis_id: None,
            name: name.into(),
            sortable_name: name.into(),
            reg_created: t(reg_day),
            reg_updated: None,
            status: PersonStatus::Active,
        }
    }

    #[test]
    fn extension_equal_to_due_date_is_a_noop() {
        // Registered T+2d with a 3-day extension: lands exactly on the due
        // date, which is not strictly greater, so nothing is planned.
        let planned = plan_extensions(&[hw1(vec![])], &[student(7, "alice", 3)], 3);
        assert!(planned.is_empty());
    }

    #[test]
    fn extension_past_due_date_creates_override() {
        // Registered T+3d: extension reaches T+6d, one day past due.
        let planned = plan_extensions(&[hw1(vec![])], &[student(7, "alice", 4)], 3);
        assert_eq!(planned.len(), 1);
        let ext = &planned[0];
        assert_eq!(ext.spec.title, "alice-hw1-latereg");
        assert_eq!(ext.spec.due_at, Some(t(7)));
        assert_eq!(ext.spec.unlock_at, Some(t(1)));
        assert_eq!(ext.spec.lock_at, Some(t(8)));
        assert_eq!(ext.spec.student_ids, vec![7]);
        assert_eq!(ext.remove_override_id, None);
    }

    #[test]
    fn existing_single_student_override_is_replaced() {
        let over = Override {
            id: 99,
            student_ids: vec![7],
            title: Some("alice-hw1-latereg".into()),
            due_at: Some(t(7)),
            unlock_at: Some(t(1)),
            lock_at: Some(t(8)),
        };
        // Registration moved later still: extension now reaches day 9.
        let planned = plan_extensions(&[hw1(vec![over])], &[student(7, "alice", 6)], 3);
        assert_eq!(planned.len(), 1);
        assert_eq!(planned[0].remove_override_id, Some(99));
        assert_eq!(planned[0].spec.due_at, Some(t(9)));
    }

    #[test]
    fn group_override_is_not_deleted() {
        let over = Override {
            id: 99,
            student_ids: vec![7, 8],
            title: Some("section-2".into()),
            due_at: Some(t(7)),
            unlock_at: None,
            lock_at: None,
        };
        let planned = plan_extensions(&[hw1(vec![over])], &[student(7, "alice", 6)], 3);
        assert_eq!(planned.len(), 1);
        assert_eq!(planned[0].remove_override_id, None);
    }

    #[test]
    fn inactive_students_and_early_registrants_are_skipped() {
        let mut inactive = student(7, "alice", 4);
        inactive.status = PersonStatus::Inactive;
        let early = student(8, "bob", 1);
        let planned = plan_extensions(&[hw1(vec![])], &[inactive, early], 3);
        assert!(planned.is_empty());
    }

    #[test]
    fn assignment_without_unlock_is_skipped() {
        let mut a = hw1(vec![]);
        a.unlock_at = None;
        let planned = plan_extensions(&[a], &[student(7, "alice", 4)], 3);
        assert!(planned.is_empty());
    }

    #[test]
    fn reg_updated_supersedes_reg_created() {
        let mut s = student(7, "alice", 2);
        s.reg_updated = Some(t(5));
        // Effective registration day 5: extension reaches day 8.
        let planned = plan_extensions(&[hw1(vec![])], &[s], 3);
        assert_eq!(planned.len(), 1);
        assert_eq!(planned[0].spec.due_at, Some(t(8)));
    }
}
