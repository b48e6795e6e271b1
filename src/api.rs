use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use vigil_backend::autonomy::AutonomyStatus;
use vigil_backend::database::{JournalKind, SchemaVersion};
use vigil_backend::server::HealthResponse;

pub const DEFAULT_BACKEND_URL: &str = "http://127.0.0.1:8088";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalPage {
    pub kind: JournalKind,
    pub limit: usize,
    pub entries: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaSummary {
    pub versions: Vec<SchemaVersion>,
    pub row_counts: BTreeMap<String, usize>,
}

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: String, token: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: normalize_base_url(&base_url),
            token: token
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty()),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn health(&self) -> Result<HealthResponse> {
        self.get_json("/v1/health", &[]).await
    }

    pub async fn autonomy_status(&self) -> Result<AutonomyStatus> {
        self.get_json("/v1/autonomy/status", &[]).await
    }

    pub async fn journal(&self, kind: JournalKind, limit: usize) -> Result<JournalPage> {
        let path = format!("/v1/journal/{}", kind.as_slug());
        self.get_json(&path, &[("limit", limit)]).await
    }

    pub async fn schema(&self) -> Result<SchemaSummary> {
        self.get_json("/v1/schema", &[]).await
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, usize)],
    ) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let mut builder = self.http.get(&url).query(query);
        if let Some(token) = self.token.as_deref() {
            builder = builder.bearer_auth(token);
        }

        let response = builder
            .send()
            .await
            .with_context(|| format!("GET {} failed", path))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .with_context(|| format!("Failed to read {} payload", path))?;
        if !status.is_success() {
            return Err(anyhow!("GET {} returned {}: {}", path, status, body.trim()));
        }

        serde_json::from_str::<T>(&body).context(format!(
            "Failed to decode {} response. Payload preview: {}",
            path,
            body.chars().take(500).collect::<String>()
        ))
    }
}

/// Accepts a journal slug (`self_journal`, `self-journal`) or its table name (`sovereign`).
pub fn parse_journal_kind(raw: &str) -> Result<JournalKind> {
    JournalKind::from_slug(raw).ok_or_else(|| {
        let known = JournalKind::ALL
            .iter()
            .map(|kind| kind.as_slug())
            .collect::<Vec<_>>()
            .join(", ");
        anyhow!("Unknown journal '{}'. Expected one of: {}", raw, known)
    })
}

fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        DEFAULT_BACKEND_URL.to_string()
    } else {
        trimmed.to_string()
    }
}
