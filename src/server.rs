//! HTTP API for the question-answering agent.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/api/query` | Run the agent to completion, return the answer |
//! | `POST` | `/api/query/stream` | Run the agent with SSE progress events |
//! | `GET`  | `/api/formulas` | List the formula catalog |
//! | `GET`  | `/api/recommended-queries` | Example questions to ask |
//! | `GET`  | `/api/artifacts?session_id=` | List a session's artifacts |
//! | `GET`  | `/api/stats` | Store record counts |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Streaming
//!
//! `/api/query/stream` emits one SSE `data:` frame per [`AgentEvent`]:
//! `session` first, then `token`/`tool_start`/`tool_end` interleaved, and
//! a final `error` and/or `done`. Closing the connection cancels the run
//! at its next checkpoint.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "query must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted to support browser
//! clients.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use std::convert::Infallible;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};

use crate::agent::AgentRuntime;
use crate::artifacts;
use crate::models::{AgentEvent, Formula};

#[derive(Clone)]
struct AppState {
    runtime: AgentRuntime,
}

/// Starts the HTTP server on the configured bind address. Runs until the
/// process is terminated.
pub async fn run_server(runtime: AgentRuntime) -> anyhow::Result<()> {
    let bind_addr = runtime.config.server.bind.clone();
    let state = AppState { runtime };

    let cors = tower_http::cors::CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any);

    let app = Router::new()
        .route("/api/query", post(handle_query))
        .route("/api/query/stream", post(handle_query_stream))
        .route("/api/formulas", get(handle_formulas))
        .route("/api/recommended-queries", get(handle_recommended_queries))
        .route("/api/artifacts", get(handle_artifacts))
        .route("/api/stats", get(handle_stats))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state);

    println!("askdb server listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

fn internal(err: anyhow::Error) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: err.to_string(),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /api/query ============

#[derive(Deserialize)]
struct QueryRequest {
    query: String,
    /// Continue an existing session; a fresh one is created when absent.
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Serialize)]
struct QueryResponse {
    query: String,
    response: String,
    success: bool,
    session_id: String,
}

fn resolve_session(session_id: Option<String>) -> String {
    session_id
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

async fn handle_query(
    State(state): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, AppError> {
    if request.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }
    let session_id = resolve_session(request.session_id);

    let outcome = state
        .runtime
        .run(&request.query, &session_id)
        .await
        .map_err(internal)?;

    Ok(Json(QueryResponse {
        query: request.query,
        response: outcome.content,
        success: !outcome.exhausted,
        session_id,
    }))
}

// ============ POST /api/query/stream ============

async fn handle_query_stream(
    State(state): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    if request.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }
    let session_id = resolve_session(request.session_id);

    let (event_tx, event_rx) = mpsc::channel::<AgentEvent>(64);
    let (cancel_tx, cancel_rx) = watch::channel(false);

    let runtime = state.runtime.clone();
    let query = request.query.clone();
    tokio::spawn(async move {
        // Errors are already surfaced as `error` frames on the channel.
        let _ = runtime
            .run_streaming(&query, &session_id, event_tx, cancel_rx)
            .await;
    });

    // The guard keeps the cancel sender alive for the life of the SSE
    // stream; when the client disconnects, the stream (and with it the
    // event receiver) is dropped and the run stops at its next emit.
    let stream = ReceiverStream::new(event_rx).map(move |event| {
        let _guard = &cancel_tx;
        Ok(Event::default()
            .json_data(&event)
            .unwrap_or_else(|_| Event::default().data("{\"type\":\"error\"}")))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

// ============ GET /api/formulas ============

async fn handle_formulas(State(state): State<AppState>) -> Result<Json<Vec<Formula>>, AppError> {
    let formulas = load_formulas(&state.runtime.pool).await.map_err(internal)?;
    Ok(Json(formulas))
}

async fn load_formulas(pool: &sqlx::SqlitePool) -> anyhow::Result<Vec<Formula>> {
    let rows = sqlx::query(
        "SELECT id, name, latex, expression, description, source_page, recommended_queries
         FROM formulas ORDER BY source_page, id",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| {
            let queries_json: Option<String> = row.get("recommended_queries");
            let recommended_queries = queries_json
                .and_then(|json| serde_json::from_str::<Vec<String>>(&json).ok())
                .unwrap_or_default();

            Formula {
                id: row.get("id"),
                name: row.get("name"),
                latex: row.get("latex"),
                expression: row.get("expression"),
                description: row.get("description"),
                source_page: row.get("source_page"),
                recommended_queries,
            }
        })
        .collect())
}

// ============ GET /api/recommended-queries ============

#[derive(Serialize)]
struct RecommendedQuery {
    query: String,
    category: String,
    formula_id: Option<String>,
}

/// Starter questions shown when the formula catalog is empty.
const DEFAULT_QUERIES: &[(&str, &str)] = &[
    ("순보험료를 계산하는 공식을 알려줘", "순보험료"),
    ("I=100, N=1000, L=500000, B=10일 때 순보험료는?", "계산"),
    ("사고발생률이 뭐야?", "개념"),
    ("영업보험료의 구성요소는?", "개념"),
    ("최대우도 추정량 공식을 찾아줘", "MLE"),
    ("손해율 계산 방법은?", "손해율"),
];

async fn handle_recommended_queries(
    State(state): State<AppState>,
) -> Result<Json<Vec<RecommendedQuery>>, AppError> {
    let formulas = load_formulas(&state.runtime.pool).await.map_err(internal)?;

    let mut recommended: Vec<RecommendedQuery> = formulas
        .iter()
        .flat_map(|f| {
            f.recommended_queries.iter().map(|q| RecommendedQuery {
                query: q.clone(),
                category: f.name.clone(),
                formula_id: Some(f.id.clone()),
            })
        })
        .collect();

    if recommended.is_empty() {
        recommended = DEFAULT_QUERIES
            .iter()
            .map(|(query, category)| RecommendedQuery {
                query: query.to_string(),
                category: category.to_string(),
                formula_id: None,
            })
            .collect();
    }

    Ok(Json(recommended))
}

// ============ GET /api/stats ============

/// Record counts across the store, one field per internal table.
#[derive(Debug, Serialize)]
pub struct StoreStats {
    pub sessions: i64,
    pub artifacts: i64,
    pub indexed_tables: i64,
    pub indexed_columns: i64,
    pub formulas: i64,
}

/// Count the records in every askdb-owned table.
pub async fn collect_stats(pool: &sqlx::SqlitePool) -> anyhow::Result<StoreStats> {
    async fn count(pool: &sqlx::SqlitePool, query: &str) -> anyhow::Result<i64> {
        Ok(sqlx::query_scalar(query).fetch_one(pool).await?)
    }

    Ok(StoreStats {
        sessions: count(pool, "SELECT COUNT(*) FROM sessions").await?,
        artifacts: count(pool, "SELECT COUNT(*) FROM artifacts").await?,
        indexed_tables: count(pool, "SELECT COUNT(*) FROM schema_tables").await?,
        indexed_columns: count(pool, "SELECT COUNT(*) FROM schema_columns").await?,
        formulas: count(pool, "SELECT COUNT(*) FROM formulas").await?,
    })
}

async fn handle_stats(State(state): State<AppState>) -> Result<Json<StoreStats>, AppError> {
    let stats = collect_stats(&state.runtime.pool).await.map_err(internal)?;
    Ok(Json(stats))
}

// ============ GET /api/artifacts ============

#[derive(Deserialize)]
struct ArtifactsParams {
    session_id: String,
}

#[derive(Serialize)]
struct ArtifactListItem {
    id: String,
    name: String,
    description: String,
    artifact_type: String,
    source: Option<String>,
    preview: String,
    created_at: String,
}

async fn handle_artifacts(
    State(state): State<AppState>,
    Query(params): Query<ArtifactsParams>,
) -> Result<Json<Vec<ArtifactListItem>>, AppError> {
    if params.session_id.trim().is_empty() {
        return Err(bad_request("session_id must not be empty"));
    }

    let session = artifacts::get_session(&state.runtime.pool, &params.session_id)
        .await
        .map_err(internal)?;
    if session.is_none() {
        return Err(not_found(format!("no session: {}", params.session_id)));
    }

    let items = artifacts::list_by_session(&state.runtime.pool, &params.session_id)
        .await
        .map_err(internal)?;

    Ok(Json(
        items
            .into_iter()
            .map(|a| ArtifactListItem {
                id: a.id,
                name: a.name,
                description: a.description,
                artifact_type: a.artifact_type.as_str().to_string(),
                source: a.source,
                preview: artifacts::truncate_chars(&a.content, artifacts::PREVIEW_CHARS)
                    .to_string(),
                created_at: a.created_at.to_rfc3339(),
            })
            .collect(),
    ))
}
