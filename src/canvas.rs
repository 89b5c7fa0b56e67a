use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::info;
use url::Url;

use crate::models::{Assignment, CourseInfo, Override, Person, PersonStatus};

// ─── Error types ────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum CanvasError {
    #[error("HTTP {status}: {message}")]
    Api { status: u16, message: String },
    #[error("Rate limited – retry after {retry_after:.1}s")]
    RateLimited { retry_after: f64 },
    #[error("Unauthorized – check your API token")]
    Unauthorized,
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

// ─── Wire payloads ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RawCourse {
    id: u64,
    name: Option<String>,
    course_code: Option<String>,
    time_zone: Option<String>,
    start_at: Option<DateTime<Utc>>,
    end_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct RawEnrollmentUser {
    id: u64,
    name: Option<String>,
    sortable_name: Option<String>,
    sis_user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawEnrollment {
    user: RawEnrollmentUser,
    enrollment_state: Option<String>,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct RawAssignment {
    id: u64,
    name: String,
    due_at: Option<DateTime<Utc>>,
    unlock_at: Option<DateTime<Utc>>,
    lock_at: Option<DateTime<Utc>>,
    points_possible: Option<f64>,
    published: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RawOverride {
    id: u64,
    #[serde(default)]
    student_ids: Vec<u64>,
    title: Option<String>,
    due_at: Option<DateTime<Utc>>,
    unlock_at: Option<DateTime<Utc>>,
    lock_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct RawSubmission {
    posted_at: Option<DateTime<Utc>>,
}

/// Body for creating a due-date override.
#[derive(Debug, Clone, Serialize)]
pub struct OverrideSpec {
    pub student_ids: Vec<u64>,
    pub title: String,
    pub due_at: Option<DateTime<Utc>>,
    pub unlock_at: Option<DateTime<Utc>>,
    pub lock_at: Option<DateTime<Utc>>,
}

// ─── Pagination ─────────────────────────────────────────────────────────────

/// Pull the `rel="next"` URL out of a Canvas `Link` response header.
fn next_link(headers: &HeaderMap) -> Option<String> {
    let header = headers.get("link")?.to_str().ok()?;
    header.split(',').find_map(|part| {
        let (url, rel) = part.split_once(';')?;
        if rel.trim() == "rel=\"next\"" {
            let url = url.trim().trim_start_matches('<').trim_end_matches('>');
            Some(url.to_string())
        } else {
            None
        }
    })
}

// ─── Client ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CanvasClient {
    client: Client,
    base_url: Url,
    token: String,
    course_id: u64,
    dry_run: bool,
}

impl CanvasClient {
    pub fn new(base_url: &str, token: &str, course_id: u64, dry_run: bool) -> Result<Self> {
        let base_url =
            Url::parse(base_url).with_context(|| format!("Invalid Canvas URL: {base_url}"))?;

        let client = Client::builder().user_agent("gradeflow/0.1.0").build()?;

        Ok(Self {
            client,
            base_url,
            token: token.to_string(),
            course_id,
            dry_run,
        })
    }

    fn api_url(&self, path: &str) -> Result<Url> {
        let full = format!("/api/v1/courses/{}{}", self.course_id, path);
        self.base_url
            .join(&full)
            .with_context(|| format!("Bad API path: {path}"))
    }

    async fn check_status(&self, resp: Response) -> Result<Response, CanvasError> {
        match resp.status() {
            StatusCode::UNAUTHORIZED => Err(CanvasError::Unauthorized),
            StatusCode::FORBIDDEN => Err(CanvasError::Api {
                status: 403,
                message: "Forbidden – insufficient permissions".into(),
            }),
            StatusCode::TOO_MANY_REQUESTS => {
                let retry = resp
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<f64>().ok())
                    .unwrap_or(1.0);
                Err(CanvasError::RateLimited { retry_after: retry })
            }
            s if s.is_client_error() || s.is_server_error() => {
                let status = s.as_u16();
                let message = resp.text().await.unwrap_or_default();
                Err(CanvasError::Api { status, message })
            }
            _ => Ok(resp),
        }
    }

    async fn get_url(&self, url: Url) -> Result<Response, CanvasError> {
        let resp = self.client.get(url).bearer_auth(&self.token).send().await?;
        self.check_status(resp).await
    }

    async fn get_all_pages<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, &str)],
    ) -> Result<Vec<T>, CanvasError> {
        let mut url = self.api_url(path).map_err(CanvasError::Other)?;
        for (k, v) in params {
            url.query_pairs_mut().append_pair(k, v);
        }

        let mut all = Vec::new();
        let mut next = Some(url);
        while let Some(url) = next.take() {
            let resp = self.get_url(url).await?;
            next = match next_link(resp.headers()) {
                Some(raw) => Some(Url::parse(&raw).map_err(|e| {
                    CanvasError::Other(anyhow::anyhow!("Bad pagination URL: {e}"))
                })?),
                None => None,
            };
            let items: Vec<T> = resp.json().await?;
            all.extend(items);
        }

        Ok(all)
    }

    // ── Course / enrollments ────────────────────────────────────────────

    pub async fn get_course_info(&self) -> Result<CourseInfo, CanvasError> {
        let url = self.api_url("").map_err(CanvasError::Other)?;
        let raw: RawCourse = self.get_url(url).await?.json().await?;
        Ok(CourseInfo {
            id: raw.id,
            name: raw.name,
            course_code: raw.course_code,
            time_zone: raw.time_zone,
            start_at: raw.start_at,
            end_at: raw.end_at,
        })
    }

    async fn get_enrollments(&self, enrollment_type: &str) -> Result<Vec<Person>, CanvasError> {
        let raw: Vec<RawEnrollment> = self
            .get_all_pages(
                "/enrollments",
                &[
                    ("type[]", enrollment_type),
                    ("state[]", "active"),
                    ("state[]", "inactive"),
                    ("per_page", "50"),
                ],
            )
            .await?;

        Ok(raw
            .into_iter()
            .map(|e| Person {
                id: e.user.id,
                sis_id: e.user.sis_user_id,
                name: e.user.name.unwrap_or_default(),
                sortable_name: e.user.sortable_name.unwrap_or_default(),
                reg_created: e.created_at.unwrap_or_else(Utc::now),
                reg_updated: e.updated_at,
                status: match e.enrollment_state.as_deref() {
                    Some("active") => PersonStatus::Active,
                    _ => PersonStatus::Inactive,
                },
            })
            .collect())
    }

    pub async fn get_students(&self) -> Result<Vec<Person>, CanvasError> {
        self.get_enrollments("StudentEnrollment").await
    }

    pub async fn get_tas(&self) -> Result<Vec<Person>, CanvasError> {
        self.get_enrollments("TaEnrollment").await
    }

    pub async fn get_instructors(&self) -> Result<Vec<Person>, CanvasError> {
        self.get_enrollments("TeacherEnrollment").await
    }

    pub async fn get_fake_students(&self) -> Result<Vec<Person>, CanvasError> {
        self.get_enrollments("StudentViewEnrollment").await
    }

    // ── Assignments & overrides ─────────────────────────────────────────

    pub async fn get_assignments(&self) -> Result<Vec<Assignment>, CanvasError> {
        let raw: Vec<RawAssignment> = self
            .get_all_pages("/assignments", &[("per_page", "50"), ("order_by", "due_at")])
            .await?;

        let mut assignments = Vec::with_capacity(raw.len());
        for a in raw {
            let overrides: Vec<RawOverride> = self
                .get_all_pages(
                    &format!("/assignments/{}/overrides", a.id),
                    &[("per_page", "50")],
                )
                .await?;
            assignments.push(Assignment {
                id: a.id,
                name: a.name,
                due_at: a.due_at,
                unlock_at: a.unlock_at,
                lock_at: a.lock_at,
                points_possible: a.points_possible,
                published: a.published,
                overrides: overrides
                    .into_iter()
                    .map(|o| Override {
                        id: o.id,
                        student_ids: o.student_ids,
                        title: o.title,
                        due_at: o.due_at,
                        unlock_at: o.unlock_at,
                        lock_at: o.lock_at,
                    })
                    .collect(),
            });
        }
        Ok(assignments)
    }

    pub async fn create_override(
        &self,
        assignment_id: u64,
        spec: &OverrideSpec,
    ) -> Result<(), CanvasError> {
        if self.dry_run {
            info!("[dry run] would create override {:?} on assignment {assignment_id}", spec.title);
            return Ok(());
        }
        let url = self
            .api_url(&format!("/assignments/{assignment_id}/overrides"))
            .map_err(CanvasError::Other)?;
        let resp = self
            .client
            .post(url)
            .bearer_auth(&self.token)
            .json(&serde_json::json!({ "assignment_override": spec }))
            .send()
            .await?;
        self.check_status(resp).await?;
        Ok(())
    }

    pub async fn remove_override(
        &self,
        assignment_id: u64,
        override_id: u64,
    ) -> Result<(), CanvasError> {
        if self.dry_run {
            info!("[dry run] would remove override {override_id} on assignment {assignment_id}");
            return Ok(());
        }
        let url = self
            .api_url(&format!("/assignments/{assignment_id}/overrides/{override_id}"))
            .map_err(CanvasError::Other)?;
        let resp = self
            .client
            .delete(url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        self.check_status(resp).await?;
        Ok(())
    }

    // ── Grades ──────────────────────────────────────────────────────────

    /// Post a percentage grade (formatted string, e.g. "87.50") for one
    /// student's submission.
    pub async fn put_grade(
        &self,
        assignment_id: u64,
        student_id: u64,
        percentage: &str,
    ) -> Result<(), CanvasError> {
        if self.dry_run {
            info!(
                "[dry run] would post grade {percentage}% for student {student_id} on assignment {assignment_id}"
            );
            return Ok(());
        }
        let url = self
            .api_url(&format!("/assignments/{assignment_id}/submissions/{student_id}"))
            .map_err(CanvasError::Other)?;
        let resp = self
            .client
            .put(url)
            .bearer_auth(&self.token)
            .json(&serde_json::json!({
                "submission": { "posted_grade": format!("{percentage}%") }
            }))
            .send()
            .await?;
        self.check_status(resp).await?;
        Ok(())
    }

    pub async fn is_grade_posted(
        &self,
        assignment_id: u64,
        student_id: u64,
    ) -> Result<bool, CanvasError> {
        let url = self
            .api_url(&format!("/assignments/{assignment_id}/submissions/{student_id}"))
            .map_err(CanvasError::Other)?;
        let raw: RawSubmission = self.get_url(url).await?.json().await?;
        Ok(raw.posted_at.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn next_link_parses_canvas_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "link",
            HeaderValue::from_static(
                "<https://canvas.example.edu/api/v1/courses/42/enrollments?page=1&per_page=50>; rel=\"current\",\
                 <https://canvas.example.edu/api/v1/courses/42/enrollments?page=2&per_page=50>; rel=\"next\",\
                 <https://canvas.example.edu/api/v1/courses/42/enrollments?page=1&per_page=50>; rel=\"first\"",
            ),
        );
        assert_eq!(
            next_link(&headers).as_deref(),
            Some("https://canvas.example.edu/api/v1/courses/42/enrollments?page=2&per_page=50")
        );
    }

    #[test]
    fn next_link_absent_on_last_page() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "link",
            HeaderValue::from_static(
                "<https://canvas.example.edu/api/v1/courses/42/enrollments?page=1>; rel=\"current\"",
            ),
        );
        assert_eq!(next_link(&headers), None);
        assert_eq!(next_link(&HeaderMap::new()), None);
    }
}
