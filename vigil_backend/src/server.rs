use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::autonomy::AutonomyStatus;
use crate::database::{JournalKind, JournalStore, SchemaVersion, StoreError};

const DEFAULT_PAGE: usize = 50;
const MAX_PAGE: usize = 1000;

pub struct ServerState {
    pub store: Arc<JournalStore>,
    pub status: watch::Receiver<AutonomyStatus>,
    pub auth: BackendAuthConfig,
}

#[derive(Debug, Clone)]
pub struct BackendAuthConfig {
    mode: AuthMode,
    token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthMode {
    Required,
    Disabled,
}

impl BackendAuthConfig {
    pub fn from_env() -> Result<Self> {
        let mode = parse_auth_mode(std::env::var("VIGIL_BACKEND_AUTH_MODE").ok())?;
        let token = std::env::var("VIGIL_BACKEND_TOKEN")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        if mode == AuthMode::Required && token.is_none() {
            return Err(anyhow!(
                "VIGIL_BACKEND_TOKEN is required when auth mode is 'required'"
            ));
        }
        if mode == AuthMode::Disabled {
            tracing::warn!("Backend auth mode is disabled; all API routes are unauthenticated");
        }

        Ok(Self { mode, token })
    }

    pub fn disabled() -> Self {
        Self {
            mode: AuthMode::Disabled,
            token: None,
        }
    }

    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            mode: AuthMode::Required,
            token: Some(token.into()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub store_ok: bool,
}

#[derive(Debug, Deserialize)]
pub struct JournalQuery {
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct JournalPage {
    pub kind: JournalKind,
    pub limit: usize,
    pub entries: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct SchemaResponse {
    pub versions: Vec<SchemaVersion>,
    pub row_counts: BTreeMap<&'static str, usize>,
}

pub fn router(state: Arc<ServerState>) -> Router {
    let protected = Router::new()
        .route("/health", get(health))
        .route("/autonomy/status", get(autonomy_status))
        .route("/journal/:kind", get(journal))
        .route("/schema", get(schema))
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(state, auth_middleware));

    Router::new().nest("/v1", protected)
}

pub async fn serve_backend(
    state: Arc<ServerState>,
    bind_addr: &str,
    cancel: CancellationToken,
) -> Result<()> {
    let bind_addr = bind_addr
        .parse::<SocketAddr>()
        .with_context(|| format!("Invalid bind address '{}' (expected host:port)", bind_addr))?;

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind backend server to {}", bind_addr))?;
    tracing::info!("Vigil backend listening on http://{}", bind_addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("Backend server failed")?;
    tracing::info!("Backend server shut down");
    Ok(())
}

fn parse_auth_mode(raw: Option<String>) -> Result<AuthMode> {
    let normalized = raw
        .unwrap_or_else(|| "required".to_string())
        .trim()
        .to_ascii_lowercase();
    match normalized.as_str() {
        "" | "required" | "on" | "enabled" | "true" => Ok(AuthMode::Required),
        "disabled" | "off" | "false" => Ok(AuthMode::Disabled),
        other => Err(anyhow!(
            "Invalid VIGIL_BACKEND_AUTH_MODE '{}'. Expected 'required' or 'disabled'",
            other
        )),
    }
}

async fn auth_middleware(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Result<Response, StatusCode> {
    authorize(&headers, &state.auth)?;
    Ok(next.run(request).await)
}

fn authorize(headers: &HeaderMap, auth: &BackendAuthConfig) -> Result<(), StatusCode> {
    if auth.mode == AuthMode::Disabled {
        return Ok(());
    }
    let Some(token) = auth.token.as_deref() else {
        return Err(StatusCode::UNAUTHORIZED);
    };

    let Some(raw_header) = headers.get(header::AUTHORIZATION) else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let Ok(auth_value) = raw_header.to_str() else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let expected = format!("Bearer {}", token);
    if auth_value.trim() != expected {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(())
}

async fn health(State(state): State<Arc<ServerState>>) -> Json<HealthResponse> {
    let store_ok = state.store.blocking(|store| store.ping()).await.is_ok();
    Json(HealthResponse {
        status: if store_ok { "ok" } else { "degraded" }.to_string(),
        store_ok,
    })
}

async fn autonomy_status(State(state): State<Arc<ServerState>>) -> Json<AutonomyStatus> {
    Json(state.status.borrow().clone())
}

async fn journal(
    State(state): State<Arc<ServerState>>,
    Path(kind): Path<String>,
    Query(query): Query<JournalQuery>,
) -> Result<Json<JournalPage>, (StatusCode, String)> {
    let kind = JournalKind::from_slug(&kind)
        .ok_or_else(|| not_found(format!("unknown journal '{}'", kind)))?;
    let limit = clamp_limit(query.limit, DEFAULT_PAGE, 1, MAX_PAGE);
    let entries = state
        .store
        .blocking(move |store| Ok(read_journal(store, kind, limit)))
        .await
        .map_err(store_error)??;
    Ok(Json(JournalPage {
        kind,
        limit,
        entries,
    }))
}

fn read_journal(
    store: &JournalStore,
    kind: JournalKind,
    limit: usize,
) -> Result<serde_json::Value, (StatusCode, String)> {
    match kind {
        JournalKind::Chat => to_json(store.get_chat_entries(limit)),
        JournalKind::Versions => to_json(store.get_version_entries(limit)),
        JournalKind::UserContext => to_json(store.get_user_context_entries(limit)),
        JournalKind::SelfJournal => to_json(store.get_journal_entries(limit)),
        JournalKind::Evolution => to_json(store.get_evolution_entries(limit)),
        JournalKind::Philosophy => to_json(store.get_philosophy_entries(limit)),
        JournalKind::Technology => to_json(store.get_technology_entries(limit)),
        JournalKind::Misc => to_json(store.get_misc_entries(limit)),
        JournalKind::Directives => to_json(store.get_directives(limit)),
    }
}

fn to_json<T: Serialize>(
    rows: Result<Vec<T>, StoreError>,
) -> Result<serde_json::Value, (StatusCode, String)> {
    let rows = rows.map_err(store_error)?;
    serde_json::to_value(rows).map_err(|e| internal_error(anyhow!(e)))
}

async fn schema(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<SchemaResponse>, (StatusCode, String)> {
    let response = state
        .store
        .blocking(|store| {
            let versions = store.applied_schema_versions()?;
            let mut row_counts = BTreeMap::new();
            for kind in JournalKind::ALL {
                row_counts.insert(kind.as_slug(), store.count(kind)?);
            }
            Ok(SchemaResponse {
                versions,
                row_counts,
            })
        })
        .await
        .map_err(store_error)?;
    Ok(Json(response))
}

fn clamp_limit(value: Option<usize>, default: usize, min: usize, max: usize) -> usize {
    value.unwrap_or(default).clamp(min, max)
}

fn not_found(message: String) -> (StatusCode, String) {
    (StatusCode::NOT_FOUND, message)
}

fn store_error(error: StoreError) -> (StatusCode, String) {
    tracing::warn!("Store request failed: {}", error);
    internal_error(error.into())
}

fn internal_error(error: anyhow::Error) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn state() -> Arc<ServerState> {
        let (_tx, status) = watch::channel(AutonomyStatus::default());
        Arc::new(ServerState {
            store: Arc::new(JournalStore::open_in_memory().unwrap()),
            status,
            auth: BackendAuthConfig::disabled(),
        })
    }

    #[test]
    fn authorize_accepts_matching_bearer_token() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer token-123"),
        );
        assert!(authorize(&headers, &BackendAuthConfig::bearer("token-123")).is_ok());
    }

    #[test]
    fn authorize_rejects_missing_or_invalid_token() {
        let auth = BackendAuthConfig::bearer("token-123");
        assert_eq!(
            authorize(&HeaderMap::new(), &auth),
            Err(StatusCode::UNAUTHORIZED)
        );

        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer wrong"),
        );
        assert_eq!(authorize(&headers, &auth), Err(StatusCode::UNAUTHORIZED));
    }

    #[test]
    fn authorize_allows_when_auth_mode_disabled() {
        assert!(authorize(&HeaderMap::new(), &BackendAuthConfig::disabled()).is_ok());
    }

    #[test]
    fn parse_auth_mode_defaults_to_required() {
        assert_eq!(parse_auth_mode(None).unwrap(), AuthMode::Required);
        assert_eq!(
            parse_auth_mode(Some(String::new())).unwrap(),
            AuthMode::Required
        );
        assert_eq!(
            parse_auth_mode(Some(" Required ".to_string())).unwrap(),
            AuthMode::Required
        );
        assert_eq!(
            parse_auth_mode(Some("off".to_string())).unwrap(),
            AuthMode::Disabled
        );
        assert!(parse_auth_mode(Some("nope".to_string())).is_err());
    }

    #[test]
    fn clamp_limit_bounds_page_size() {
        assert_eq!(clamp_limit(None, DEFAULT_PAGE, 1, MAX_PAGE), 50);
        assert_eq!(clamp_limit(Some(0), DEFAULT_PAGE, 1, MAX_PAGE), 1);
        assert_eq!(clamp_limit(Some(5000), DEFAULT_PAGE, 1, MAX_PAGE), 1000);
    }

    #[tokio::test]
    async fn journal_route_reads_newest_first() {
        let state = state();
        state
            .store
            .insert_philosophy_entry("patience", "wait for the operator")
            .unwrap();
        state
            .store
            .insert_philosophy_entry("care", "never lose a row")
            .unwrap();

        let Json(page) = journal(
            State(state.clone()),
            Path("philosophy".to_string()),
            Query(JournalQuery { limit: Some(1) }),
        )
        .await
        .unwrap();

        assert_eq!(page.kind, JournalKind::Philosophy);
        assert_eq!(page.limit, 1);
        let entries = page.entries.as_array().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["topic"], "care");
    }

    #[tokio::test]
    async fn unknown_journal_is_not_found() {
        let err = journal(
            State(state()),
            Path("secrets".to_string()),
            Query(JournalQuery { limit: None }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn schema_and_health_report_store_state() {
        let state = state();
        let Json(schema) = schema(State(state.clone())).await.unwrap();
        assert_eq!(
            schema
                .versions
                .iter()
                .map(|v| v.version)
                .collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(schema.row_counts["chat"], 1);
        assert_eq!(schema.row_counts.len(), JournalKind::ALL.len());

        let Json(health) = health(State(state)).await;
        assert_eq!(health.status, "ok");
        assert!(health.store_ok);
    }

    #[tokio::test]
    async fn serves_over_tcp_until_cancelled() {
        let cancel = CancellationToken::new();
        let server = tokio::spawn(serve_backend(state(), "127.0.0.1:0", cancel.clone()));
        cancel.cancel();
        server.await.unwrap().unwrap();
    }
}
