//! Typed Rust client for the Compute Engine instances API.
//!
//! Covers the subset needed for managing test-network VMs:
//! instances (insert, get, delete, aggregated list) and zone operations.

mod types;

pub use types::*;

const BASE_URL: &str = "https://compute.googleapis.com/compute/v1";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("compute api request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("compute api {endpoint} returned {status}: {body}")]
    Api {
        endpoint: &'static str,
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("compute operation {operation} failed: {message}")]
    Operation { operation: String, message: String },
}

impl Error {
    /// HTTP status of an API error, if this is one.
    pub fn status(&self) -> Option<reqwest::StatusCode> {
        match self {
            Self::Api { status, .. } => Some(*status),
            Self::Request(e) => e.status(),
            Self::Operation { .. } => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Client for the Compute Engine REST API, scoped to one project.
#[derive(Clone)]
pub struct GceClient {
    token: String,
    project: String,
    http: reqwest::Client,
}

impl GceClient {
    pub fn new(token: impl Into<String>, project: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            project: project.into(),
            http: reqwest::Client::new(),
        }
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    fn url(&self, path: &str) -> String {
        format!("{BASE_URL}/projects/{}{path}", self.project)
    }

    fn auth(&self) -> String {
        format!("Bearer {}", self.token)
    }

    async fn check(resp: reqwest::Response, endpoint: &'static str) -> Result<reqwest::Response> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Api { endpoint, status, body });
        }
        Ok(resp)
    }

    // ── Instances ────────────────────────────────────────────────────

    /// Start an instance insert. The returned operation is usually still running.
    pub async fn insert_instance(&self, zone: &str, req: &InsertInstanceRequest) -> Result<Operation> {
        let resp = self
            .http
            .post(self.url(&format!("/zones/{zone}/instances")))
            .header("Authorization", self.auth())
            .json(req)
            .send()
            .await?;

        Self::check(resp, "insert instance")
            .await?
            .json()
            .await
            .map_err(Error::from)
    }

    pub async fn get_instance(&self, zone: &str, name: &str) -> Result<Instance> {
        let resp = self
            .http
            .get(self.url(&format!("/zones/{zone}/instances/{name}")))
            .header("Authorization", self.auth())
            .send()
            .await?;

        Self::check(resp, "get instance")
            .await?
            .json()
            .await
            .map_err(Error::from)
    }

    /// Delete an instance. Returns `None` when the instance does not exist.
    pub async fn delete_instance(&self, zone: &str, name: &str) -> Result<Option<Operation>> {
        let resp = self
            .http
            .delete(self.url(&format!("/zones/{zone}/instances/{name}")))
            .header("Authorization", self.auth())
            .send()
            .await?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let op = Self::check(resp, "delete instance").await?.json().await?;
        Ok(Some(op))
    }

    /// List instances across all zones matching `filter`, following pagination.
    pub async fn aggregated_instances(&self, filter: &str) -> Result<Vec<Instance>> {
        let mut instances = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut query: Vec<(&str, String)> = vec![
                ("filter", filter.to_string()),
                ("returnPartialSuccess", "true".into()),
            ];
            if let Some(t) = &page_token {
                query.push(("pageToken", t.clone()));
            }

            let resp = self
                .http
                .get(self.url("/aggregated/instances"))
                .header("Authorization", self.auth())
                .query(&query)
                .send()
                .await?;

            let page: AggregatedInstanceList =
                Self::check(resp, "list instances").await?.json().await?;

            instances.extend(page.items.into_values().flat_map(|scoped| scoped.instances));

            match page.next_page_token {
                Some(t) if !t.is_empty() => page_token = Some(t),
                _ => break,
            }
        }

        Ok(instances)
    }

    // ── Operations ───────────────────────────────────────────────────

    /// Block (server side, up to ~2 minutes) until the operation is done or the
    /// wait deadline passes. Callers loop until [`Operation::is_done`].
    pub async fn wait_zone_operation(&self, zone: &str, operation: &str) -> Result<Operation> {
        let resp = self
            .http
            .post(self.url(&format!("/zones/{zone}/operations/{operation}/wait")))
            .header("Authorization", self.auth())
            .send()
            .await?;

        Self::check(resp, "wait operation")
            .await?
            .json()
            .await
            .map_err(Error::from)
    }

    /// Wait for an operation to finish and surface its error, if any.
    pub async fn wait_until_done(&self, zone: &str, mut op: Operation) -> Result<Operation> {
        while !op.is_done() {
            op = self.wait_zone_operation(zone, &op.name).await?;
        }

        if let Some(message) = op.error_message() {
            return Err(Error::Operation {
                operation: op.name,
                message,
            });
        }

        Ok(op)
    }
}
