use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use crate::cache::{self, CanvasCache};
use crate::canvas::CanvasClient;
use crate::config::CourseConfig;
use crate::docker::{DockerRunner, JobResult};
use crate::gradebook;
use crate::hub::HubClient;
use crate::latereg;
use crate::models::{Assignment, CourseInfo, Person};
use crate::notify::{build_notifier, Notifier};
use crate::provision;
use crate::scheduler;
use crate::search;
use crate::state::{StateStore, SubmissionState};
use crate::submission::{self, submission_key, Submission};
use crate::zfs::ZfsClient;

enum CollectOutcome {
    Collected,
    MissingSource,
}

// ─── Course ─────────────────────────────────────────────────────────────────

/// The per-course aggregate: configuration, the four external clients, the
/// synchronized LMS view, and the durable pipeline state. One instance
/// drives one cron invocation.
pub struct Course {
    pub config: CourseConfig,
    dry_run: bool,

    canvas: CanvasClient,
    hub: HubClient,
    zfs: ZfsClient,
    docker: DockerRunner,
    store: StateStore,
    notifier: Box<dyn Notifier>,
    cache_path: PathBuf,

    pub course_info: CourseInfo,
    pub students: Vec<Person>,
    pub fake_students: Vec<Person>,
    pub tas: Vec<Person>,
    pub instructors: Vec<Person>,
    pub assignments: Vec<Assignment>,

    snapshots: BTreeSet<String>,
    state: SubmissionState,
}

/// Fetch the complete LMS view. All-or-nothing: any failure surfaces before
/// a single field is exposed, so callers never observe a partial view.
async fn fetch_view(canvas: &CanvasClient) -> Result<CanvasCache> {
    info!("Synchronizing with Canvas...");
    let course_info = canvas.get_course_info().await?;
    let students = canvas.get_students().await?;
    let tas = canvas.get_tas().await?;
    let instructors = canvas.get_instructors().await?;
    let fake_students = canvas.get_fake_students().await?;
    let assignments = canvas.get_assignments().await?;
    for a in &assignments {
        if !a.times_consistent() {
            warn!("Assignment {} unlocks after it is due; check the LMS dates", a.name);
        }
    }
    Ok(CanvasCache {
        cached_at: Utc::now(),
        course_info,
        students,
        fake_students,
        tas,
        instructors,
        assignments,
    })
}

/// Synchronize, falling back to the cached view only when allowed. The
/// returned view is freshly fetched or loaded whole from cache; otherwise
/// the error is fatal for this run.
async fn synchronize_view(
    canvas: &CanvasClient,
    cache_path: &Path,
    allow_cache: bool,
) -> Result<CanvasCache> {
    match fetch_view(canvas).await {
        Ok(view) => {
            if let Err(e) = cache::save_cache(cache_path, &view) {
                warn!("Failed to save canvas cache: {e:#}");
            }
            Ok(view)
        }
        Err(e) => {
            if allow_cache {
                warn!("Canvas synchronization failed ({e:#}); attempting cache fallback");
                if let Some(cached) = cache::load_cache(cache_path) {
                    warn!(
                        "Running against the canvas view cached at {}; data may be stale",
                        cached.cached_at
                    );
                    return Ok(cached);
                }
                warn!("No usable canvas cache found");
            }
            Err(e).context("Canvas synchronization failed and no cache fallback was available")
        }
    }
}

impl Course {
    pub async fn init(course_dir: &Path, dry_run: bool) -> Result<Self> {
        info!("Loading course configuration");
        let config = CourseConfig::load(course_dir)?;

        let canvas_token = config
            .canvas_token
            .clone()
            .context("config: canvas token missing")?;
        let hub_token = config.hub_token.clone().context("config: hub token missing")?;

        let canvas = CanvasClient::new(&config.canvas_url, &canvas_token, config.course_id, dry_run)?;
        let hub = HubClient::new(&config.hub_url, &hub_token, dry_run)?;
        let zfs = ZfsClient::new(&config.user_folder_root, &config.student_folder_root, dry_run);
        let docker = DockerRunner::new(&config.grading_image, dry_run);
        let store = StateStore::new(course_dir, &config.name, dry_run);
        let notifier = build_notifier(&config.notification_method)?;
        let cache_path = cache::cache_path(course_dir, &config.name);

        let view = synchronize_view(&canvas, &cache_path, config.allow_canvas_cache).await?;

        info!("Loading persisted snapshots and submissions");
        let snapshots = store.load_snapshots()?;
        let state = store.load_submissions()?;

        Ok(Course {
            config,
            dry_run,
            canvas,
            hub,
            zfs,
            docker,
            store,
            notifier,
            cache_path,
            course_info: view.course_info,
            students: view.students,
            fake_students: view.fake_students,
            tas: view.tas,
            instructors: view.instructors,
            assignments: view.assignments,
            snapshots,
            state,
        })
    }

    async fn resynchronize(&mut self, allow_cache: bool) -> Result<()> {
        let view = synchronize_view(&self.canvas, &self.cache_path, allow_cache).await?;
        self.course_info = view.course_info;
        self.students = view.students;
        self.fake_students = view.fake_students;
        self.tas = view.tas;
        self.instructors = view.instructors;
        self.assignments = view.assignments;
        Ok(())
    }

    // ── Late registration ───────────────────────────────────────────────

    pub async fn apply_latereg_extensions(&mut self) -> Result<()> {
        info!("Applying late registration extensions");
        let planned = latereg::plan_extensions(
            &self.assignments,
            &self.students,
            self.config.latereg_extension_days,
        );
        if planned.is_empty() {
            info!("No late registration extensions required");
            return Ok(());
        }
        let wrote = latereg::apply_extensions(&self.canvas, &planned).await;
        if wrote && !self.dry_run {
            // Write, then invalidate, then resync: nothing after this point
            // may read the pre-write view.
            info!("Overrides changed; invalidating cache and re-synchronizing");
            cache::invalidate_cache(&self.cache_path)?;
            self.resynchronize(false).await?;
        }
        Ok(())
    }

    // ── Snapshots ───────────────────────────────────────────────────────

    pub async fn take_snapshots(&mut self) -> Result<()> {
        info!("Taking snapshots");
        scheduler::take_snapshots(&self.zfs, &self.assignments, &mut self.snapshots, Utc::now())
            .await;
        self.store.save_snapshots(&self.snapshots)
    }

    // ── The pipeline ────────────────────────────────────────────────────

    pub async fn run_workflow(&mut self) -> Result<()> {
        // A hole in the graders table is fatal, and must surface before the
        // run mutates anything.
        let now = Utc::now();
        for a in self.assignments.iter().filter(|a| a.is_past_due(now)) {
            for slot in 0..self.config.num_graders {
                self.config.grader_account(&a.name, slot)?;
            }
        }

        self.apply_latereg_extensions().await?;
        self.take_snapshots().await?;

        info!("Provisioning grader folders and accounts");
        provision::provision_graders(
            &self.config,
            &self.zfs,
            &self.hub,
            &self.docker,
            &self.assignments,
            Utc::now(),
            self.dry_run,
        )
        .await?;

        info!("Creating, collecting, and cleaning submissions");
        let return_solutions = self.collect_and_clean().await;

        self.return_solutions(&return_solutions).await;

        info!("Autograding");
        self.autograde_pass().await;

        info!("Generating feedback");
        self.feedback_pass().await;

        info!("Uploading grades");
        self.upload_grades().await?;

        self.return_feedback(&return_solutions).await;

        self.store.save_submissions(&self.state)?;

        let summary = format!(
            "Workflow for {} complete: {} submissions tracked across {} assignments",
            self.config.name,
            self.state.submissions.len(),
            self.assignments.len()
        );
        info!("{summary}");
        self.notifier.notify(&summary)?;
        Ok(())
    }

    /// Create-if-absent, refresh due dates, collect past-due submissions
    /// into grader repos, and sanitize them. Returns the assignments whose
    /// collected fraction met the threshold this run.
    async fn collect_and_clean(&mut self) -> Vec<String> {
        let now = Utc::now();
        let mut return_solutions = Vec::new();

        for a in &self.assignments {
            if !a.is_past_due(now) {
                continue;
            }
            let mut n_resolved = 0usize;
            let n_total = self.students.len();

            for s in &self.students {
                let key = submission_key(&a.name, s.id);
                if !self.state.submissions.contains_key(&key) {
                    let slot = self.state.grader_index % self.config.num_graders;
                    let grader = self.config.grader_name(&a.name, slot);
                    self.state.grader_index = (self.state.grader_index + 1) % self.config.num_graders;
                    info!("Submission {key} does not exist; creating, assigned to {grader}");
                    self.state
                        .submissions
                        .insert(key.clone(), Submission::new(a, s, grader));
                }
                let Some(subm) = self.state.submissions.get_mut(&key) else {
                    continue;
                };

                // Overrides can still move the due date until collection
                // freezes the snapshot label.
                if !subm.collected && !subm.missing {
                    subm.update_due(a, s);
                }
                let Some(due) = subm.due_date else { continue };
                if due >= now {
                    continue;
                }

                if subm.ready_to_collect(now) {
                    info!("Submission {key} is past due; collecting");
                    match collect_submission(&self.config, &self.zfs, subm, self.dry_run).await {
                        Ok(CollectOutcome::Collected) => {
                            subm.collected = true;
                            subm.clear_error();
                        }
                        Ok(CollectOutcome::MissingSource) => {
                            info!("Submission {key} has no snapshotted notebook; recording as missing");
                            subm.missing = true;
                            subm.score = Some(0.0);
                        }
                        Err(e) => {
                            error!("Error collecting {key}: {e:#}");
                            subm.record_error(format!("{e:#}"));
                            continue;
                        }
                    }
                }
                if subm.collected || subm.missing {
                    n_resolved += 1;
                }

                if subm.ready_to_clean() {
                    info!("Submission {key} is collected; cleaning");
                    match submission::clean_notebook(&subm.submitted_notebook_path(&self.config)) {
                        Ok(_) => {
                            subm.cleaned = true;
                            subm.clear_error();
                        }
                        Err(e) => {
                            error!("Error cleaning {key}: {e:#}");
                            subm.record_error(format!("{e:#}"));
                        }
                    }
                }
            }

            info!(
                "Assignment {} collected {n_resolved}/{n_total}, threshold: {}",
                a.name, self.config.return_solution_threshold
            );
            if meets_return_threshold(n_resolved, n_total, self.config.return_solution_threshold) {
                info!("Threshold reached; will return solutions for {}", a.name);
                return_solutions.push(a.name.clone());
            }
        }

        return_solutions
    }

    /// Copy the rendered solution into the folder of every student of a
    /// threshold-passing assignment, once per student. Missing submissions
    /// have no student folder to copy into and are skipped.
    async fn return_solutions(&mut self, return_solutions: &[String]) {
        for a_name in return_solutions {
            info!("Assignment {a_name} flagged to enable return of solutions");
            for s in &self.students {
                let key = submission_key(a_name, s.id);
                let Some(subm) = self.state.submissions.get_mut(&key) else {
                    continue;
                };
                if subm.solution_returned || subm.missing {
                    continue;
                }
                info!("Student {} not yet returned solution for {a_name}; returning", s.id);
                match copy_to_student(
                    &self.zfs,
                    &self.config.hub_user,
                    &subm.solution_grader_path(&self.config),
                    &subm.solution_student_path(&self.config),
                    self.dry_run,
                )
                .await
                {
                    Ok(()) => {
                        subm.solution_returned = true;
                        subm.solution_return_error = None;
                    }
                    Err(e) => {
                        error!("Error returning solution for {key}: {e:#}");
                        subm.solution_return_error = Some(format!("{e:#}"));
                    }
                }
            }
        }
    }

    /// Submit one wave of autograde jobs, join the results, then resolve
    /// each graded submission against the gradebook's manual-grading flag.
    /// The gradebook is re-consulted on every run until the flag clears, so
    /// a manually graded submission resumes the pipeline by itself.
    async fn autograde_pass(&mut self) {
        let now = Utc::now();
        for a in &self.assignments {
            if !a.is_past_due(now) {
                continue;
            }
            for s in &self.students {
                let key = submission_key(&a.name, s.id);
                let Some(subm) = self.state.submissions.get_mut(&key) else {
                    continue;
                };
                if subm.ready_for_autograde() {
                    let command = format!(
                        "nbgrader autograde --assignment={} --student={}",
                        a.name,
                        subm.nbgrader_student(&self.config)
                    );
                    let workdir = subm.grader_repo_path(&self.config);
                    subm.job_id = Some(self.docker.submit(&command, &workdir));
                }
            }
        }

        let results = self.docker.run_all().await;

        for a in &self.assignments {
            if !a.is_past_due(now) {
                continue;
            }
            for s in &self.students {
                let key = submission_key(&a.name, s.id);
                let Some(subm) = self.state.submissions.get_mut(&key) else {
                    continue;
                };
                if !subm.autograded {
                    if let Some(job_id) = subm.job_id.take() {
                        match validate_job(&results, &job_id) {
                            Ok(()) => {
                                subm.autograded = true;
                                subm.clear_error();
                            }
                            Err(e) => {
                                error!("Error autograding {key}: {e}");
                                subm.record_error(e);
                                continue;
                            }
                        }
                    }
                }

                if subm.ready_for_grade_resolution() {
                    let gradebook_path = subm.gradebook_path(&self.config);
                    let student = subm.nbgrader_student(&self.config);
                    match gradebook::read_submission(&gradebook_path, &a.name, &student) {
                        Ok(entry) if entry.needs_manual_grade => {
                            if !subm.needs_manual_grading {
                                info!("Submission {key} needs manual grading");
                                subm.needs_manual_grading = true;
                            }
                        }
                        Ok(_) => {
                            subm.graded = true;
                            subm.clear_error();
                        }
                        Err(e) => {
                            error!("Error reading gradebook for {key}: {e}");
                            subm.record_error(e);
                        }
                    }
                }
            }
        }
    }

    /// Submit one wave of feedback-generation jobs and join the results.
    async fn feedback_pass(&mut self) {
        let now = Utc::now();
        for a in &self.assignments {
            if !a.is_past_due(now) {
                continue;
            }
            for s in &self.students {
                let key = submission_key(&a.name, s.id);
                let Some(subm) = self.state.submissions.get_mut(&key) else {
                    continue;
                };
                if subm.ready_for_feedback() {
                    let command = format!(
                        "nbgrader generate_feedback --force --assignment={} --student={}",
                        a.name,
                        subm.nbgrader_student(&self.config)
                    );
                    let workdir = subm.grader_repo_path(&self.config);
                    subm.job_id = Some(self.docker.submit(&command, &workdir));
                }
            }
        }

        let results = self.docker.run_all().await;

        for a in &self.assignments {
            if !a.is_past_due(now) {
                continue;
            }
            for s in &self.students {
                let key = submission_key(&a.name, s.id);
                let Some(subm) = self.state.submissions.get_mut(&key) else {
                    continue;
                };
                if subm.feedback_generated {
                    continue;
                }
                if let Some(job_id) = subm.job_id.take() {
                    match validate_job(&results, &job_id) {
                        Ok(()) => {
                            subm.feedback_generated = true;
                            subm.clear_error();
                        }
                        Err(e) => {
                            error!("Error generating feedback for {key}: {e}");
                            subm.record_error(e);
                        }
                    }
                }
            }
        }
    }

    /// Post percentage grades for submissions whose feedback is generated,
    /// plus zero scores for missing submissions.
    async fn upload_grades(&mut self) -> Result<()> {
        let now = Utc::now();
        let mut wrote_lms = false;

        for a in &self.assignments {
            if !a.is_past_due(now) {
                continue;
            }
            for s in &self.students {
                let key = submission_key(&a.name, s.id);
                let Some(subm) = self.state.submissions.get_mut(&key) else {
                    continue;
                };
                if !subm.ready_for_grade_upload() {
                    continue;
                }

                let score = if subm.missing {
                    0.0
                } else {
                    let gradebook_path = subm.gradebook_path(&self.config);
                    let student = subm.nbgrader_student(&self.config);
                    match gradebook::read_submission(&gradebook_path, &a.name, &student) {
                        Ok(entry) => entry.score,
                        Err(e) => {
                            error!("Error reading score for {key}: {e}");
                            subm.record_error(e);
                            continue;
                        }
                    }
                };

                let max_score =
                    match submission::compute_max_score(&subm.release_notebook_path(&self.config)) {
                        Ok(max) if max > 0.0 => max,
                        Ok(_) => {
                            error!("Release notebook for {} carries no points", a.name);
                            subm.record_error("release notebook carries no points");
                            continue;
                        }
                        Err(e) => {
                            error!("Error computing max score for {key}: {e:#}");
                            subm.record_error(format!("{e:#}"));
                            continue;
                        }
                    };

                let pct = format!("{:.2}", 100.0 * score / max_score);
                info!(
                    "Submission {key} score {score}/{max_score} ({pct}%){}",
                    if subm.missing { " [missing]" } else { "" }
                );
                match self.canvas.put_grade(a.id, subm.student_id, &pct).await {
                    Ok(()) => {
                        subm.score = Some(score);
                        subm.max_score = Some(max_score);
                        subm.grade_uploaded = true;
                        subm.clear_error();
                        wrote_lms = true;
                    }
                    Err(e) => {
                        error!("Error uploading grade for {key}: {e}");
                        subm.record_error(e);
                    }
                }
            }
        }

        if wrote_lms && !self.dry_run {
            // Grades changed on the LMS; drop the cached view so the next
            // synchronization starts fresh.
            cache::invalidate_cache(&self.cache_path)?;
        }
        Ok(())
    }

    /// Return feedback for threshold-passing assignments once the LMS
    /// reports the grade posted. Missing submissions produced no feedback
    /// and are skipped.
    async fn return_feedback(&mut self, return_solutions: &[String]) {
        let now = Utc::now();
        for a in &self.assignments {
            if !a.is_past_due(now) || !return_solutions.contains(&a.name) {
                continue;
            }
            for s in &self.students {
                let key = submission_key(&a.name, s.id);
                let Some(subm) = self.state.submissions.get_mut(&key) else {
                    continue;
                };
                if !subm.ready_for_feedback_return() {
                    continue;
                }

                if !subm.grade_posted {
                    match self.canvas.is_grade_posted(a.id, subm.student_id).await {
                        Ok(true) => subm.grade_posted = true,
                        Ok(false) => {
                            info!("Grade for {key} not posted yet; holding feedback");
                            continue;
                        }
                        Err(e) => {
                            error!("Error checking posted grade for {key}: {e}");
                            subm.record_error(e);
                            continue;
                        }
                    }
                }

                info!("Returning feedback for {key}");
                match copy_to_student(
                    &self.zfs,
                    &self.config.hub_user,
                    &subm.feedback_grader_path(&self.config),
                    &subm.feedback_student_path(&self.config),
                    self.dry_run,
                )
                .await
                {
                    Ok(()) => {
                        subm.feedback_returned = true;
                        subm.clear_error();
                    }
                    Err(e) => {
                        error!("Error returning feedback for {key}: {e:#}");
                        subm.record_error(format!("{e:#}"));
                    }
                }
            }
        }
    }

    // ── Diagnostics ─────────────────────────────────────────────────────

    pub fn search_students(
        &self,
        name: Option<&str>,
        canvas_id: Option<u64>,
        sis_id: Option<&str>,
        max_return: usize,
    ) -> Vec<&Person> {
        search::search_students(&self.students, name, canvas_id, sis_id, max_return)
    }
}

// ─── Helpers ────────────────────────────────────────────────────────────────

/// Copy the snapshotted notebook into the grader repo and hand the created
/// tree to the hub user. An absent source is the missing-submission case,
/// not an error.
async fn collect_submission(
    config: &CourseConfig,
    zfs: &ZfsClient,
    subm: &Submission,
    dry_run: bool,
) -> Result<CollectOutcome> {
    let source = subm.snapshot_source_path(config);
    if !source.exists() {
        return Ok(CollectOutcome::MissingSource);
    }

    let dest = subm.submitted_notebook_path(config);
    if dry_run {
        info!(
            "[dry run] would collect {} into {}",
            source.display(),
            dest.display()
        );
        return Ok(CollectOutcome::Collected);
    }

    let assignment_dir = dest
        .parent()
        .context("submitted notebook path has no parent")?
        .to_path_buf();
    std::fs::create_dir_all(&assignment_dir)
        .with_context(|| format!("Failed to create {}", assignment_dir.display()))?;
    std::fs::copy(&source, &dest).with_context(|| {
        format!("Failed to copy {} to {}", source.display(), dest.display())
    })?;

    // The hub user must own the whole submitted/<student>/<assignment> tree.
    let submitted_root = subm.grader_repo_path(config).join("submitted");
    let student_dir = submitted_root.join(subm.nbgrader_student(config));
    for path in [&submitted_root, &student_dir, &assignment_dir, &dest] {
        zfs.chown(&config.hub_user, path).await?;
    }

    Ok(CollectOutcome::Collected)
}

/// Copy a grader-side artifact (solution or feedback HTML) into the
/// student's materials folder and chown it to the hub user.
async fn copy_to_student(
    zfs: &ZfsClient,
    hub_user: &str,
    from: &Path,
    to: &Path,
    dry_run: bool,
) -> Result<()> {
    if dry_run {
        info!("[dry run] would copy {} to {}", from.display(), to.display());
        return Ok(());
    }
    std::fs::copy(from, to)
        .with_context(|| format!("Failed to copy {} to {}", from.display(), to.display()))?;
    zfs.chown(hub_user, to).await?;
    Ok(())
}

/// Solution/feedback release gate: the fraction of the class whose
/// submissions are resolved (collected, or recorded missing) must reach the
/// configured threshold.
fn meets_return_threshold(n_resolved: usize, n_total: usize, threshold: f64) -> bool {
    n_total > 0 && (n_resolved as f64 / n_total as f64) >= threshold
}

/// The error contract for batched container jobs: a missing result or a log
/// containing `ERROR` fails the submission for this run.
fn validate_job(results: &HashMap<String, JobResult>, job_id: &str) -> Result<(), String> {
    let Some(result) = results.get(job_id) else {
        return Err(format!("no result for container job {job_id}"));
    };
    if result.log.contains("ERROR") {
        return Err(format!(
            "container job {job_id} reported errors (exit status {:?}): {}",
            result.exit_status, result.log
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn return_threshold_gating() {
        // 79 of 100 collected at a 0.8 threshold: hold the solutions.
        assert!(!meets_return_threshold(79, 100, 0.8));
        // One more collection tips it.
        assert!(meets_return_threshold(80, 100, 0.8));
        // A threshold of 1.0 releases only when the whole class is in.
        assert!(!meets_return_threshold(99, 100, 1.0));
        assert!(meets_return_threshold(100, 100, 1.0));
        // An assignment with no students never releases.
        assert!(!meets_return_threshold(0, 0, 0.5));
    }

    #[test]
    fn validate_job_honors_the_log_contract() {
        let mut results = HashMap::new();
        results.insert(
            "job-0".to_string(),
            JobResult {
                log: "[AutogradeApp] converting notebook\n".into(),
                exit_status: Some(0),
            },
        );
        results.insert(
            "job-1".to_string(),
            JobResult {
                log: "[AutogradeApp] ERROR: kernel died\n".into(),
                exit_status: Some(1),
            },
        );
        assert!(validate_job(&results, "job-0").is_ok());
        assert!(validate_job(&results, "job-1").is_err());
        assert!(validate_job(&results, "job-2").is_err());
    }
}
