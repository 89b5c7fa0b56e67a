use rusqlite::{Connection, OpenFlags, OptionalExtension};
use std::path::Path;

// ─── Error types ────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum GradebookError {
    #[error("Gradebook query failed: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("No gradebook record for assignment {assignment:?} student {student:?}")]
    NotFound { assignment: String, student: String },
}

/// What the autograder recorded for one (assignment, student) pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GradebookEntry {
    pub score: f64,
    pub needs_manual_grade: bool,
}

// ─── Reads ──────────────────────────────────────────────────────────────────

/// Read the nbgrader gradebook (sqlite) inside a grader repo. The workflow
/// only ever reads it; nbgrader owns all writes.
pub fn read_submission(
    db_path: &Path,
    assignment: &str,
    student: &str,
) -> Result<GradebookEntry, GradebookError> {
    let conn = Connection::open_with_flags(db_path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;

    let submission_id: Option<i64> = conn
        .query_row(
            "SELECT sa.id
             FROM submitted_assignment sa
             JOIN assignment a ON sa.assignment_id = a.id
             WHERE a.name = ?1 AND sa.student_id = ?2",
            rusqlite::params![assignment, student],
            |row| row.get(0),
        )
        .optional()?;

    let Some(submission_id) = submission_id else {
        return Err(GradebookError::NotFound {
            assignment: assignment.to_string(),
            student: student.to_string(),
        });
    };

    // A grade's effective score is the manual score when a human has
    // entered one, otherwise the autograded score.
    let (score, manual_count): (f64, i64) = conn.query_row(
        "SELECT COALESCE(SUM(COALESCE(g.manual_score, g.auto_score) + COALESCE(g.extra_credit, 0)), 0),
                COALESCE(SUM(g.needs_manual_grade), 0)
         FROM grade g
         JOIN submitted_notebook n ON g.notebook_id = n.id
         WHERE n.assignment_id = ?1",
        rusqlite::params![submission_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    Ok(GradebookEntry {
        score,
        needs_manual_grade: manual_count > 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed_gradebook(path: &Path) -> Connection {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch(
            "CREATE TABLE assignment (id INTEGER PRIMARY KEY, name TEXT);
             CREATE TABLE submitted_assignment (
                 id INTEGER PRIMARY KEY, assignment_id INTEGER, student_id TEXT);
             CREATE TABLE submitted_notebook (
                 id INTEGER PRIMARY KEY, assignment_id INTEGER);
             CREATE TABLE grade (
                 id INTEGER PRIMARY KEY, notebook_id INTEGER,
                 auto_score REAL, manual_score REAL, extra_credit REAL,
                 needs_manual_grade BOOLEAN);
             INSERT INTO assignment VALUES (1, 'hw1');
             INSERT INTO submitted_assignment VALUES (10, 1, 'student_7');
             INSERT INTO submitted_notebook VALUES (100, 10);",
        )
        .unwrap();
        conn
    }

    #[test]
    fn autograded_scores_sum() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gradebook.db");
        let conn = seed_gradebook(&path);
        conn.execute_batch(
            "INSERT INTO grade VALUES (1, 100, 1.5, NULL, NULL, 0);
             INSERT INTO grade VALUES (2, 100, 2.0, NULL, NULL, 0);",
        )
        .unwrap();
        drop(conn);

        let entry = read_submission(&path, "hw1", "student_7").unwrap();
        assert_eq!(entry.score, 3.5);
        assert!(!entry.needs_manual_grade);
    }

    #[test]
    fn manual_score_supersedes_and_flags_propagate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gradebook.db");
        let conn = seed_gradebook(&path);
        conn.execute_batch(
            "INSERT INTO grade VALUES (1, 100, 1.0, 3.0, NULL, 0);
             INSERT INTO grade VALUES (2, 100, NULL, NULL, NULL, 1);",
        )
        .unwrap();
        drop(conn);

        let entry = read_submission(&path, "hw1", "student_7").unwrap();
        assert_eq!(entry.score, 3.0);
        assert!(entry.needs_manual_grade);
    }

    #[test]
    fn unknown_student_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gradebook.db");
        drop(seed_gradebook(&path));
        let err = read_submission(&path, "hw1", "student_99").unwrap_err();
        assert!(matches!(err, GradebookError::NotFound { .. }));
    }
}
