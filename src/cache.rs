use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::models::{Assignment, CourseInfo, Person};

// ─── Cached Canvas view ─────────────────────────────────────────────────────

/// The complete synchronized LMS view. Written atomically after every
/// successful synchronization; loaded as a fallback when synchronization
/// fails and the course allows it. Never partially populated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanvasCache {
    pub cached_at: DateTime<Utc>,
    pub course_info: CourseInfo,
    pub students: Vec<Person>,
    pub fake_students: Vec<Person>,
    pub tas: Vec<Person>,
    pub instructors: Vec<Person>,
    pub assignments: Vec<Assignment>,
}

pub fn cache_path(course_dir: &Path, course_name: &str) -> PathBuf {
    course_dir.join(format!("{course_name}_canvas_cache.json"))
}

// ─── I/O ────────────────────────────────────────────────────────────────────

pub fn load_cache(path: &Path) -> Option<CanvasCache> {
    let contents = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&contents).ok()
}

pub fn save_cache(path: &Path, data: &CanvasCache) -> Result<()> {
    let json = serde_json::to_string_pretty(data)?;
    crate::state::write_atomic(path, &json)
        .with_context(|| format!("Failed to write canvas cache at {}", path.display()))
}

/// Delete the cache file. Must run after any write to the LMS so no
/// later read within the run sees the stale view.
pub fn invalidate_cache(path: &Path) -> Result<()> {
    if path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("Failed to remove canvas cache at {}", path.display()))?;
    }
    Ok(())
}
