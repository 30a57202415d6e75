//! GitLab REST (v4) backend.
//!
//! Projects are addressed by URL-encoded full path (`group%2Fsub%2Frepo`),
//! namespaces likewise.  Authentication is the `PRIVATE-TOKEN` header.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::{Response, StatusCode};
use secrecy::ExposeSecret;
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use super::rate_limit::RateLimitState;
use super::{ForgeBackend, ForgeError, MirrorRepo};
use crate::config::GitLabConfig;
use crate::storage::RepoPath;

/// Requests left in the window below which the client pauses.
const RATE_LIMIT_BUFFER: u64 = 5;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ProjectResponse {
    id: u64,
    path_with_namespace: String,
    http_url_to_repo: String,
    default_branch: Option<String>,
}

impl From<ProjectResponse> for MirrorRepo {
    fn from(p: ProjectResponse) -> Self {
        Self {
            id: p.id,
            path_with_namespace: p.path_with_namespace,
            http_url: p.http_url_to_repo,
            default_branch: p.default_branch,
        }
    }
}

#[derive(Debug, Deserialize)]
struct NamespaceResponse {
    id: u64,
}

// ---------------------------------------------------------------------------
// Backend struct
// ---------------------------------------------------------------------------

pub struct GitLabBackend {
    http: reqwest::Client,
    api_url: String,
    rate_limit: RateLimitState,
}

impl GitLabBackend {
    pub fn new(config: &GitLabConfig, request_timeout: Duration) -> Result<Self> {
        let mut token = HeaderValue::from_str(config.token.expose_secret())
            .context("GITLAB_TOKEN is not a valid header value")?;
        token.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert("PRIVATE-TOKEN", token);
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(request_timeout)
            .user_agent(concat!("partition-sync/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build GitLab HTTP client")?;

        Ok(Self {
            http,
            api_url: format!("{}/api/v4", config.base_url.as_str().trim_end_matches('/')),
            rate_limit: RateLimitState::default(),
        })
    }

    fn resource_url(&self, kind: &str, id: &str) -> String {
        format!("{}/{kind}/{}", self.api_url, encode_path(id))
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<Response, ForgeError> {
        self.rate_limit.throttle(RATE_LIMIT_BUFFER).await;
        let resp = req
            .send()
            .await
            .map_err(|e| ForgeError::Transient(e.without_url().to_string()))?;
        self.rate_limit.observe(resp.status(), resp.headers());
        Ok(resp)
    }

    async fn lookup_namespace(&self, namespace: &str) -> Result<u64, ForgeError> {
        let resp = self
            .send(self.http.get(self.resource_url("namespaces", namespace)))
            .await?;
        let resp = ensure_success(resp, || format!("namespace {namespace}")).await?;
        let ns: NamespaceResponse = decode(resp).await?;
        Ok(ns.id)
    }
}

// ---------------------------------------------------------------------------
// Trait implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl ForgeBackend for GitLabBackend {
    #[instrument(skip(self), fields(%path))]
    async fn find_project(&self, path: &RepoPath) -> Result<Option<MirrorRepo>, ForgeError> {
        let resp = self
            .send(self.http.get(self.resource_url("projects", path.as_str())))
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            debug!("project does not exist");
            return Ok(None);
        }
        let resp = ensure_success(resp, || format!("project {path}")).await?;
        let project: ProjectResponse = decode(resp).await?;
        Ok(Some(project.into()))
    }

    #[instrument(skip(self), fields(%path))]
    async fn create_project(&self, path: &RepoPath) -> Result<MirrorRepo, ForgeError> {
        let namespace_id = self.lookup_namespace(path.namespace()).await?;

        let body = serde_json::json!({
            "name": path.name(),
            "path": path.name(),
            "namespace_id": namespace_id,
            "visibility": "private",
            "initialize_with_readme": false,
        });
        let resp = self
            .send(self.http.post(format!("{}/projects", self.api_url)).json(&body))
            .await?;

        if resp.status() == StatusCode::BAD_REQUEST {
            let message = error_message(resp).await;
            if message.contains("has already been taken") {
                return Err(ForgeError::AlreadyExists {
                    what: format!("project {path}"),
                });
            }
            return Err(ForgeError::Rejected {
                status: StatusCode::BAD_REQUEST.as_u16(),
                message,
            });
        }
        let resp = ensure_success(resp, || format!("namespace {}", path.namespace())).await?;
        let project: ProjectResponse = decode(resp).await?;
        info!(project_id = project.id, "project created");
        Ok(project.into())
    }

    #[instrument(skip(self, repo), fields(project = %repo.path_with_namespace))]
    async fn set_default_branch(&self, repo: &MirrorRepo, branch: &str) -> Result<(), ForgeError> {
        let url = format!("{}/projects/{}", self.api_url, repo.id);
        let resp = self
            .send(
                self.http
                    .put(url)
                    .json(&serde_json::json!({ "default_branch": branch })),
            )
            .await?;
        ensure_success(resp, || format!("project {}", repo.path_with_namespace)).await?;
        info!(branch, "default branch updated");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Percent-encode a full path for use as a single URL segment.
fn encode_path(path: &str) -> String {
    url::form_urlencoded::byte_serialize(path.as_bytes()).collect()
}

/// Map a non-2xx response onto [`ForgeError`].
async fn ensure_success(
    resp: Response,
    what: impl FnOnce() -> String,
) -> Result<Response, ForgeError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let message = error_message(resp).await;
    warn!(%status, %message, "GitLab API returned non-success status");
    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ForgeError::Unauthorized {
            status: status.as_u16(),
            message,
        },
        StatusCode::NOT_FOUND => ForgeError::NotFound { what: what() },
        StatusCode::TOO_MANY_REQUESTS => ForgeError::Transient(format!("rate limited: {message}")),
        s if s.is_server_error() => ForgeError::Transient(format!("HTTP {s}: {message}")),
        s => ForgeError::Rejected {
            status: s.as_u16(),
            message,
        },
    })
}

async fn decode<T: serde::de::DeserializeOwned>(resp: Response) -> Result<T, ForgeError> {
    resp.json()
        .await
        .map_err(|e| ForgeError::Transient(format!("malformed GitLab response: {}", e.without_url())))
}

/// Flatten GitLab's `message` field, which may be a string, a list or a map
/// of field errors.
async fn error_message(resp: Response) -> String {
    let text = resp.text().await.unwrap_or_default();
    match serde_json::from_str::<serde_json::Value>(&text) {
        Ok(value) => match value.get("message").or_else(|| value.get("error")) {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => text,
        },
        Err(_) => text,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
