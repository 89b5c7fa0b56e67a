use anyhow::{Context, Result};
use reqwest::{Client, Response, StatusCode};
use tracing::info;
use url::Url;

// ─── Error types ────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("Hub API HTTP {status}: {message}")]
    Api { status: u16, message: String },
    #[error("Unauthorized – check your hub API token")]
    Unauthorized,
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

// ─── Client ─────────────────────────────────────────────────────────────────

/// JupyterHub REST client. Grader accounts are shared with humans and other
/// processes; every mutation here is guarded by an existence check upstream
/// and the workflow never deletes them.
#[derive(Debug, Clone)]
pub struct HubClient {
    client: Client,
    base_url: Url,
    token: String,
    dry_run: bool,
}

impl HubClient {
    pub fn new(base_url: &str, token: &str, dry_run: bool) -> Result<Self> {
        let base_url =
            Url::parse(base_url).with_context(|| format!("Invalid hub URL: {base_url}"))?;
        let client = Client::builder().user_agent("gradeflow/0.1.0").build()?;
        Ok(Self {
            client,
            base_url,
            token: token.to_string(),
            dry_run,
        })
    }

    fn api_url(&self, path: &str) -> Result<Url, HubError> {
        self.base_url
            .join(&format!("/hub/api{path}"))
            .with_context(|| format!("Bad hub API path: {path}"))
            .map_err(HubError::Other)
    }

    async fn check_status(&self, resp: Response) -> Result<Response, HubError> {
        match resp.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(HubError::Unauthorized),
            s if s.is_client_error() || s.is_server_error() => {
                let status = s.as_u16();
                let message = resp.text().await.unwrap_or_default();
                Err(HubError::Api { status, message })
            }
            _ => Ok(resp),
        }
    }

    pub async fn grader_exists(&self, name: &str) -> Result<bool, HubError> {
        let url = self.api_url(&format!("/users/{name}"))?;
        let resp = self
            .client
            .get(url)
            .header("Authorization", format!("token {}", self.token))
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        self.check_status(resp).await?;
        Ok(true)
    }

    /// Create the grader account and give the human grader access to it via
    /// a hub group named after the grader.
    pub async fn assign_grader(&self, name: &str, human: &str) -> Result<(), HubError> {
        if self.dry_run {
            info!("[dry run] would create hub account {name} and grant access to {human}");
            return Ok(());
        }

        let url = self.api_url(&format!("/users/{name}"))?;
        let resp = self
            .client
            .post(url)
            .header("Authorization", format!("token {}", self.token))
            .send()
            .await?;
        self.check_status(resp).await?;

        let url = self.api_url(&format!("/groups/{name}/users"))?;
        let resp = self
            .client
            .post(url)
            .header("Authorization", format!("token {}", self.token))
            .json(&serde_json::json!({ "users": [human] }))
            .send()
            .await?;
        self.check_status(resp).await?;
        Ok(())
    }
}
