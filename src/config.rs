use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "gradeflow.toml";

/// Course configuration, loaded once per run from `<course_dir>/gradeflow.toml`.
/// API tokens may be left out of the file and supplied via
/// `GRADEFLOW_CANVAS_TOKEN` / `GRADEFLOW_HUB_TOKEN` instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CourseConfig {
    /// Course short name; prefixes the state files in the course directory.
    pub name: String,

    pub canvas_url: String,
    #[serde(default)]
    pub canvas_token: Option<String>,
    pub course_id: u64,

    pub hub_url: String,
    #[serde(default)]
    pub hub_token: Option<String>,

    /// ZFS root holding grader home datasets.
    pub user_folder_root: String,
    /// ZFS root holding student home datasets.
    pub student_folder_root: String,
    /// Path from a student's folder to the course materials checkout.
    pub student_course_path: String,

    pub instructor_repo_url: String,
    pub instructor_repo_name: String,

    /// Container image the nbgrader commands run in.
    pub grading_image: String,

    pub num_graders: usize,
    /// Assignment name -> ordered human grader accounts (length >= num_graders).
    #[serde(default)]
    pub graders: HashMap<String, Vec<String>>,

    pub latereg_extension_days: i64,
    /// Fraction of the class that must be collected before solutions and
    /// feedback are released. Must lie in (0, 1].
    pub return_solution_threshold: f64,

    #[serde(default = "default_student_prefix")]
    pub student_prefix: String,
    /// Account that owns collected notebooks so the hub can read them.
    #[serde(default = "default_hub_user")]
    pub hub_user: String,

    /// Fall back to the cached Canvas view when synchronization fails.
    #[serde(default)]
    pub allow_canvas_cache: bool,

    /// Reserved. Only "none" is recognized.
    #[serde(default = "default_notification_method")]
    pub notification_method: String,
}

fn default_student_prefix() -> String {
    "student_".into()
}

fn default_hub_user() -> String {
    "jupyter".into()
}

fn default_notification_method() -> String {
    "none".into()
}

impl CourseConfig {
    pub fn load(course_dir: &Path) -> Result<Self> {
        let path = course_dir.join(CONFIG_FILE);
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config at {}", path.display()))?;
        let mut config: CourseConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse {CONFIG_FILE}"))?;

        if config.canvas_token.is_none() {
            config.canvas_token = std::env::var("GRADEFLOW_CANVAS_TOKEN").ok();
        }
        if config.hub_token.is_none() {
            config.hub_token = std::env::var("GRADEFLOW_HUB_TOKEN").ok();
        }

        // Careful zfs snapshot syntax requires roots without trailing slashes.
        config.user_folder_root = config.user_folder_root.trim_end_matches('/').to_string();
        config.student_folder_root = config.student_folder_root.trim_end_matches('/').to_string();

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            bail!("config: `name` must not be empty");
        }
        if self.canvas_token.is_none() {
            bail!("config: no `canvas_token` and GRADEFLOW_CANVAS_TOKEN is not set");
        }
        if self.hub_token.is_none() {
            bail!("config: no `hub_token` and GRADEFLOW_HUB_TOKEN is not set");
        }
        if self.user_folder_root.is_empty() || self.student_folder_root.is_empty() {
            bail!("config: folder roots must not be empty");
        }
        if self.num_graders == 0 {
            bail!("config: `num_graders` must be at least 1");
        }
        if !(self.return_solution_threshold > 0.0 && self.return_solution_threshold <= 1.0) {
            bail!(
                "config: `return_solution_threshold` must lie in (0, 1], got {}",
                self.return_solution_threshold
            );
        }
        if self.latereg_extension_days < 0 {
            bail!("config: `latereg_extension_days` must not be negative");
        }
        if self.notification_method != "none" {
            bail!(
                "config: unknown `notification_method` {:?}",
                self.notification_method
            );
        }
        Ok(())
    }

    /// Humans grading slot `k` of `assignment`. Missing or short entries are
    /// a configuration error and abort the run before any mutation.
    pub fn grader_account(&self, assignment: &str, slot: usize) -> Result<&str> {
        let entries = self
            .graders
            .get(assignment)
            .with_context(|| format!("config: no `graders` entry for assignment {assignment:?}"))?;
        if entries.len() < self.num_graders {
            bail!(
                "config: `graders` entry for {assignment:?} lists {} accounts but num_graders is {}",
                entries.len(),
                self.num_graders
            );
        }
        Ok(&entries[slot])
    }

    pub fn grader_name(&self, assignment: &str, slot: usize) -> String {
        format!("{assignment}-grader-{slot}")
    }

    /// Working directory for a grader slot: the instructor repo cloned into
    /// the grader's home dataset.
    pub fn grader_repo_path(&self, grader: &str) -> PathBuf {
        PathBuf::from(&self.user_folder_root)
            .join(grader)
            .join(&self.instructor_repo_name)
    }

    pub fn student_folder(&self, student_id: u64) -> PathBuf {
        PathBuf::from(&self.student_folder_root).join(student_id.to_string())
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> CourseConfig {
    CourseConfig {
        name: "dsci100".into(),
        canvas_url: "https://canvas.example.edu".into(),
        canvas_token: Some("token".into()),
        course_id: 42,
        hub_url: "https://hub.example.edu".into(),
        hub_token: Some("hubtoken".into()),
        user_folder_root: "/tank/home".into(),
        student_folder_root: "/tank/student".into(),
        student_course_path: "dsci-100/materials".into(),
        instructor_repo_url: "git@github.example.edu:dsci/instructor.git".into(),
        instructor_repo_name: "instructor".into(),
        grading_image: "nbgrader-image:latest".into(),
        num_graders: 2,
        graders: HashMap::from([("hw1".into(), vec!["ta_ada".into(), "ta_grace".into()])]),
        latereg_extension_days: 3,
        return_solution_threshold: 0.8,
        student_prefix: "student_".into(),
        hub_user: "jupyter".into(),
        allow_canvas_cache: false,
        notification_method: "none".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_bad_threshold() {
        let mut cfg = test_config();
        cfg.return_solution_threshold = 0.0;
        assert!(cfg.validate().is_err());
        cfg.return_solution_threshold = 1.0;
        assert!(cfg.validate().is_ok());
        cfg.return_solution_threshold = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_graders() {
        let mut cfg = test_config();
        cfg.num_graders = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn grader_account_requires_enough_entries() {
        let cfg = test_config();
        assert_eq!(cfg.grader_account("hw1", 1).unwrap(), "ta_grace");
        assert!(cfg.grader_account("hw2", 0).is_err());

        let mut short = test_config();
        short.graders.insert("hw1".into(), vec!["ta_ada".into()]);
        assert!(short.grader_account("hw1", 0).is_err());
    }

    #[test]
    fn grader_paths() {
        let cfg = test_config();
        assert_eq!(cfg.grader_name("hw1", 0), "hw1-grader-0");
        assert_eq!(
            cfg.grader_repo_path("hw1-grader-0"),
            PathBuf::from("/tank/home/hw1-grader-0/instructor")
        );
        assert_eq!(cfg.student_folder(7), PathBuf::from("/tank/student/7"));
    }
}
