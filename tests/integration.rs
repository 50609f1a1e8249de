//! End-to-end tests over a temporary SQLite database.
//!
//! The chat and embedding providers are replaced with deterministic
//! in-memory implementations so the full agent loop, artifact store, and
//! planner can be exercised without network access.

use anyhow::Result;
use askdb::agent::AgentRuntime;
use askdb::artifacts::{self, NewArtifact, MAX_CONTENT_CHARS, PREVIEW_CHARS};
use askdb::chat::{ChatProvider, ToolSchema};
use askdb::config::Config;
use askdb::embedding::EmbeddingProvider;
use askdb::migrate;
use askdb::models::{AgentEvent, ArtifactType, Message, Role, ToolCall};
use askdb::planner::{self, QueryResult};
use askdb::schema_index;
use async_trait::async_trait;
use serde_json::json;
use sqlx::SqlitePool;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::sync::{mpsc, watch};

// ─── Mock providers ─────────────────────────────────────────────────

/// Deterministic embedder: the first matching keyword rule decides the
/// vector, unmatched texts share a default direction.
struct RuleEmbeddings {
    rules: Vec<(&'static str, Vec<f32>)>,
}

impl RuleEmbeddings {
    fn new(rules: Vec<(&'static str, Vec<f32>)>) -> Self {
        Self { rules }
    }

    fn plain() -> Self {
        Self::new(Vec::new())
    }
}

#[async_trait]
impl EmbeddingProvider for RuleEmbeddings {
    fn model_name(&self) -> &str {
        "mock"
    }

    fn dims(&self) -> usize {
        3
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|text| {
                self.rules
                    .iter()
                    .find(|(keyword, _)| text.contains(keyword))
                    .map(|(_, v)| v.clone())
                    .unwrap_or_else(|| vec![0.0, 0.0, 1.0])
            })
            .collect())
    }
}

/// Chat provider that replays a fixed sequence of assistant messages and
/// records every conversation it was shown.
struct ScriptedChat {
    responses: Mutex<Vec<Message>>,
    seen: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedChat {
    fn new(mut responses: Vec<Message>) -> Self {
        responses.reverse();
        Self {
            responses: Mutex::new(responses),
            seen: Mutex::new(Vec::new()),
        }
    }

    fn conversations(&self) -> Vec<Vec<Message>> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatProvider for ScriptedChat {
    async fn complete(&self, messages: &[Message], _tools: &[ToolSchema]) -> Result<Message> {
        self.seen.lock().unwrap().push(messages.to_vec());
        Ok(self
            .responses
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| Message::assistant("done", Vec::new())))
    }
}

/// Chat provider that requests the same tool on every turn and never
/// produces a final answer.
struct LoopingChat;

#[async_trait]
impl ChatProvider for LoopingChat {
    async fn complete(&self, _messages: &[Message], _tools: &[ToolSchema]) -> Result<Message> {
        Ok(Message::assistant(
            "",
            vec![ToolCall {
                id: "call_loop".to_string(),
                name: "search_artifacts".to_string(),
                arguments: json!({ "query": "anything" }),
            }],
        ))
    }
}

// ─── Helpers ────────────────────────────────────────────────────────

async fn setup_pool() -> (TempDir, SqlitePool) {
    let tmp = TempDir::new().unwrap();
    let pool = askdb::db::connect(&tmp.path().join("test.sqlite"))
        .await
        .unwrap();
    migrate::run_migrations(&pool).await.unwrap();
    (tmp, pool)
}

fn runtime_with(
    tmp: &TempDir,
    pool: SqlitePool,
    embedder: Arc<dyn EmbeddingProvider>,
    chat: Arc<dyn ChatProvider>,
    max_steps: usize,
) -> AgentRuntime {
    let mut config = Config::minimal(tmp.path().join("test.sqlite"));
    config.agent.max_steps = max_steps;
    AgentRuntime::new(pool, embedder, chat, Arc::new(config))
}

fn tool_call(name: &str, arguments: serde_json::Value) -> Message {
    Message::assistant(
        "",
        vec![ToolCall {
            id: format!("call_{name}"),
            name: name.to_string(),
            arguments,
        }],
    )
}

// ─── Artifact store ─────────────────────────────────────────────────

#[tokio::test]
async fn test_artifact_content_truncated_at_save_not_retrieval() {
    let (_tmp, pool) = setup_pool().await;
    let embedder = RuleEmbeddings::plain();

    let oversized = "x".repeat(MAX_CONTENT_CHARS + 5_000);
    let id = artifacts::save_artifact(
        &pool,
        &embedder,
        NewArtifact {
            name: "big".to_string(),
            description: "oversized content".to_string(),
            content: oversized,
            artifact_type: ArtifactType::DownloadedFile,
            source: None,
            session_id: "s1".to_string(),
        },
    )
    .await
    .unwrap();

    let stored = artifacts::get_artifact(&pool, &id).await.unwrap().unwrap();
    assert_eq!(stored.content.chars().count(), MAX_CONTENT_CHARS);

    // Search previews are capped separately and much tighter.
    let hits = artifacts::search_artifacts(&pool, &embedder, "big", "s1", 5, false, 1.2)
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].preview.chars().count(), PREVIEW_CHARS);
}

#[tokio::test]
async fn test_search_scoped_to_session_by_default() {
    let (_tmp, pool) = setup_pool().await;
    let embedder = RuleEmbeddings::plain();

    for session in ["s1", "s2"] {
        artifacts::save_artifact(
            &pool,
            &embedder,
            NewArtifact {
                name: format!("note for {session}"),
                description: "a note".to_string(),
                content: "content".to_string(),
                artifact_type: ArtifactType::AnalysisResult,
                source: None,
                session_id: session.to_string(),
            },
        )
        .await
        .unwrap();
    }

    let scoped = artifacts::search_artifacts(&pool, &embedder, "note", "s1", 10, false, 1.2)
        .await
        .unwrap();
    assert_eq!(scoped.len(), 1);
    assert_eq!(scoped[0].session_id, "s1");

    let global = artifacts::search_artifacts(&pool, &embedder, "note", "s1", 10, true, 1.2)
        .await
        .unwrap();
    assert_eq!(global.len(), 2);

    // Idempotent: re-running the same search returns the same ordering.
    let again = artifacts::search_artifacts(&pool, &embedder, "note", "s1", 10, true, 1.2)
        .await
        .unwrap();
    let ids: Vec<&str> = global.iter().map(|h| h.id.as_str()).collect();
    let ids_again: Vec<&str> = again.iter().map(|h| h.id.as_str()).collect();
    assert_eq!(ids, ids_again);
}

#[tokio::test]
async fn test_session_boost_orders_identical_artifacts() {
    let (_tmp, pool) = setup_pool().await;
    // Both artifacts and the query embed to the same direction, so only
    // the boost separates them.
    let embedder = RuleEmbeddings::new(vec![("강수량", vec![1.0, 0.0, 0.0])]);

    // Insert the other session's copy first so ordering cannot come from
    // insertion order.
    for session in ["s2", "s1"] {
        artifacts::save_artifact(
            &pool,
            &embedder,
            NewArtifact {
                name: "웹검색: 강수량 데이터".to_string(),
                description: "강수량 검색 결과".to_string(),
                content: "서울 5월 강수량 102mm".to_string(),
                artifact_type: ArtifactType::SearchResult,
                source: None,
                session_id: session.to_string(),
            },
        )
        .await
        .unwrap();
    }

    let hits = artifacts::search_artifacts(&pool, &embedder, "강수량", "s1", 10, true, 1.2)
        .await
        .unwrap();
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].session_id, "s1");
    assert!(hits[0].score > hits[1].score);
    let ratio = hits[0].score / hits[1].score;
    assert!((ratio - 1.2).abs() < 1e-6);
}

#[tokio::test]
async fn test_evict_expired_sessions_cascade() {
    let (_tmp, pool) = setup_pool().await;
    let embedder = RuleEmbeddings::plain();

    artifacts::save_artifact(
        &pool,
        &embedder,
        NewArtifact {
            name: "old".to_string(),
            description: String::new(),
            content: "stale".to_string(),
            artifact_type: ArtifactType::AnalysisResult,
            source: None,
            session_id: "old-session".to_string(),
        },
    )
    .await
    .unwrap();

    // Age the session past any cutoff.
    sqlx::query("UPDATE sessions SET created_at = created_at - 1000000")
        .execute(&pool)
        .await
        .unwrap();

    let evicted = artifacts::evict_expired_sessions(&pool, 500_000, true)
        .await
        .unwrap();
    assert_eq!(evicted, 1);
    assert!(artifacts::get_session(&pool, "old-session")
        .await
        .unwrap()
        .is_none());
    assert!(artifacts::list_by_session(&pool, "old-session")
        .await
        .unwrap()
        .is_empty());
}

// ─── Schema index ───────────────────────────────────────────────────

#[tokio::test]
async fn test_schema_sync_and_lexical_ranking() {
    let (_tmp, pool) = setup_pool().await;
    let embedder = RuleEmbeddings::new(vec![("rainfall", vec![1.0, 0.0, 0.0])]);

    sqlx::query("CREATE TABLE rainfall (month TEXT, mm REAL)")
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query("CREATE TABLE premiums (policy_id INTEGER, amount REAL)")
        .execute(&pool)
        .await
        .unwrap();

    let indexed = schema_index::sync_from_database(&pool, &embedder)
        .await
        .unwrap();
    // Internal bookkeeping tables (sessions, artifacts, schema index,
    // formula catalog) are never indexed.
    assert_eq!(indexed, 2);
    let entries = schema_index::load_entries(&pool).await.unwrap();
    assert!(!entries.iter().any(|e| e.table == "formulas"));
    assert!(!entries.iter().any(|e| e.table == "artifacts"));

    let ranked = schema_index::find_relevant_schema(&pool, &embedder, "show rainfall by month", 5)
        .await
        .unwrap();
    assert!(!ranked.is_empty());
    assert_eq!(ranked[0].entry.table, "rainfall");
    assert!(ranked[0].score >= 0.8, "lexical match should floor the score");

    let context = schema_index::render_schema_context(&ranked);
    assert!(context.contains("### rainfall"));
    assert!(context.contains("mm REAL"));
}

#[tokio::test]
async fn test_schema_descriptions_survive_resync_and_shift_ranking() {
    let (_tmp, pool) = setup_pool().await;
    let embedder = RuleEmbeddings::new(vec![("insurance", vec![1.0, 0.0, 0.0])]);

    sqlx::query("CREATE TABLE claims (id INTEGER)")
        .execute(&pool)
        .await
        .unwrap();

    schema_index::sync_from_database(&pool, &embedder).await.unwrap();

    // Without a description the table is unrelated to the question.
    let before = schema_index::find_relevant_schema(&pool, &embedder, "insurance coverage", 5)
        .await
        .unwrap();
    assert!(before[0].score < 0.5);

    assert!(schema_index::set_table_description(&pool, "claims", "insurance claims")
        .await
        .unwrap());
    schema_index::sync_from_database(&pool, &embedder).await.unwrap();

    let entries = schema_index::load_entries(&pool).await.unwrap();
    let claims = entries.iter().find(|e| e.table == "claims").unwrap();
    assert_eq!(claims.description, "insurance claims");

    // The description is part of the column embed text, so the re-sync
    // pulls the table toward the matching question.
    let after = schema_index::find_relevant_schema(&pool, &embedder, "insurance coverage", 5)
        .await
        .unwrap();
    assert_eq!(after[0].entry.table, "claims");
    assert!(after[0].score > 0.9);
}

// ─── Planner ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_execute_query_caps_display_rows() {
    let (_tmp, pool) = setup_pool().await;

    sqlx::query("CREATE TABLE numbers (n INTEGER)")
        .execute(&pool)
        .await
        .unwrap();
    for n in 0..30 {
        sqlx::query("INSERT INTO numbers (n) VALUES (?)")
            .bind(n)
            .execute(&pool)
            .await
            .unwrap();
    }

    let result = planner::execute_query(&pool, "SELECT n FROM numbers ORDER BY n")
        .await
        .unwrap();
    match result {
        QueryResult::Rows { rows, total, .. } => {
            assert_eq!(total, 30);
            assert_eq!(rows.len(), 25);
        }
        other => panic!("expected rows, got {other:?}"),
    }
}

#[tokio::test]
async fn test_execute_query_write_and_reject() {
    let (_tmp, pool) = setup_pool().await;

    sqlx::query("CREATE TABLE numbers (n INTEGER)")
        .execute(&pool)
        .await
        .unwrap();

    let result = planner::execute_query(&pool, "INSERT INTO numbers (n) VALUES (1), (2)")
        .await
        .unwrap();
    match result {
        QueryResult::Affected(count) => assert_eq!(count, 2),
        other => panic!("expected affected count, got {other:?}"),
    }

    // Unclassifiable statements are refused before execution.
    assert!(planner::execute_query(&pool, "VACUUM").await.is_err());

    // A failing statement comes back as part of the audit pair, not Err.
    let failed = planner::execute_query(&pool, "SELECT * FROM missing")
        .await
        .unwrap();
    assert!(matches!(failed, QueryResult::Failed { .. }));
}

// ─── Agent loop ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_agent_direct_answer_single_step() {
    let (tmp, pool) = setup_pool().await;
    let chat = Arc::new(ScriptedChat::new(vec![Message::assistant(
        "the answer is 42",
        Vec::new(),
    )]));
    let runtime = runtime_with(
        &tmp,
        pool,
        Arc::new(RuleEmbeddings::plain()),
        chat.clone(),
        25,
    );

    let outcome = runtime.run("what is the answer?", "s1").await.unwrap();
    assert_eq!(outcome.content, "the answer is 42");
    assert_eq!(outcome.steps, 1);
    assert!(!outcome.exhausted);

    // The conversation starts with the system prompt and the question.
    let first = &chat.conversations()[0];
    assert_eq!(first[0].role, Role::System);
    assert_eq!(first[1].content, "what is the answer?");
}

#[tokio::test]
async fn test_agent_recovers_from_tool_error() {
    let (tmp, pool) = setup_pool().await;
    // First turn: a calculate call with a broken expression. Second turn:
    // the final answer.
    let chat = Arc::new(ScriptedChat::new(vec![
        tool_call("calculate", json!({ "expression": "1 +" })),
        Message::assistant("recovered", Vec::new()),
    ]));
    let runtime = runtime_with(
        &tmp,
        pool,
        Arc::new(RuleEmbeddings::plain()),
        chat.clone(),
        25,
    );

    let outcome = runtime.run("compute", "s1").await.unwrap();
    assert_eq!(outcome.content, "recovered");
    assert!(!outcome.exhausted);

    // The second model turn saw the error as a tool message.
    let second = &chat.conversations()[1];
    let tool_msg = second
        .iter()
        .find(|m| m.role == Role::Tool)
        .expect("tool message in conversation");
    assert!(tool_msg.content.starts_with("error:"));
    assert_eq!(tool_msg.tool_call_id.as_deref(), Some("call_calculate"));
}

#[tokio::test]
async fn test_agent_calculate_through_loop() {
    let (tmp, pool) = setup_pool().await;
    let chat = Arc::new(ScriptedChat::new(vec![
        tool_call(
            "calculate",
            json!({ "expression": "(I/N) * (L/B)",
                    "variables": { "I": 100, "N": 1000, "L": 500000, "B": 10 } }),
        ),
        Message::assistant("순보험료는 5000원입니다", Vec::new()),
    ]));
    let runtime = runtime_with(
        &tmp,
        pool,
        Arc::new(RuleEmbeddings::plain()),
        chat.clone(),
        25,
    );

    let outcome = runtime.run("순보험료는?", "s1").await.unwrap();
    assert_eq!(outcome.content, "순보험료는 5000원입니다");

    let second = &chat.conversations()[1];
    let tool_msg = second.iter().find(|m| m.role == Role::Tool).unwrap();
    assert!(tool_msg.content.contains("= 5000"));
}

#[tokio::test]
async fn test_agent_step_budget_exhaustion() {
    let (tmp, pool) = setup_pool().await;
    let runtime = runtime_with(
        &tmp,
        pool,
        Arc::new(RuleEmbeddings::plain()),
        Arc::new(LoopingChat),
        3,
    );

    let outcome = runtime.run("never finishes", "s1").await.unwrap();
    assert!(outcome.exhausted);
    assert_eq!(outcome.steps, 3);
    assert!(!outcome.content.is_empty());
}

// ─── Streaming ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_streaming_event_order() {
    let (tmp, pool) = setup_pool().await;
    let chat = Arc::new(ScriptedChat::new(vec![
        tool_call("calculate", json!({ "expression": "1 + 1" })),
        Message::assistant("2", Vec::new()),
    ]));
    let runtime = runtime_with(&tmp, pool, Arc::new(RuleEmbeddings::plain()), chat, 25);

    let (tx, mut rx) = mpsc::channel(64);
    let (_cancel_tx, cancel_rx) = watch::channel(false);

    let outcome = runtime
        .run_streaming("what is 1 + 1?", "s-stream", tx, cancel_rx)
        .await
        .unwrap();
    assert_eq!(outcome.content, "2");

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }

    assert!(matches!(
        events.first(),
        Some(AgentEvent::Session { session_id }) if session_id == "s-stream"
    ));
    assert!(matches!(events.last(), Some(AgentEvent::Done)));

    let start_pos = events
        .iter()
        .position(|e| matches!(e, AgentEvent::ToolStart { tool, .. } if tool == "calculate"))
        .expect("tool_start emitted");
    let end_pos = events
        .iter()
        .position(|e| matches!(e, AgentEvent::ToolEnd { .. }))
        .expect("tool_end emitted");
    assert!(start_pos < end_pos);

    let tokens: String = events
        .iter()
        .filter_map(|e| match e {
            AgentEvent::Token { content } => Some(content.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(tokens, "2");
    assert!(!events.iter().any(|e| matches!(e, AgentEvent::Error { .. })));
}

#[tokio::test]
async fn test_streaming_cancellation_stops_run() {
    let (tmp, pool) = setup_pool().await;
    let runtime = runtime_with(
        &tmp,
        pool,
        Arc::new(RuleEmbeddings::plain()),
        Arc::new(LoopingChat),
        25,
    );

    let (tx, mut rx) = mpsc::channel(64);
    let (cancel_tx, cancel_rx) = watch::channel(false);
    cancel_tx.send(true).unwrap();

    let result = runtime
        .run_streaming("endless", "s-cancel", tx, cancel_rx)
        .await;
    assert!(result.is_err());

    // The stream still terminates with error + done frames.
    let mut saw_error = false;
    let mut saw_done = false;
    while let Ok(event) = rx.try_recv() {
        match event {
            AgentEvent::Error { content } => {
                saw_error = true;
                assert!(content.contains("cancelled"));
            }
            AgentEvent::Done => saw_done = true,
            _ => {}
        }
    }
    assert!(saw_error);
    assert!(saw_done);
}

#[tokio::test]
async fn test_store_stats_count_internal_tables() {
    let (_tmp, pool) = setup_pool().await;
    let embedder = RuleEmbeddings::plain();

    sqlx::query("CREATE TABLE orders (id INTEGER, amount REAL)")
        .execute(&pool)
        .await
        .unwrap();
    schema_index::sync_from_database(&pool, &embedder)
        .await
        .unwrap();

    artifacts::save_artifact(
        &pool,
        &embedder,
        NewArtifact {
            name: "one".to_string(),
            description: String::new(),
            content: "x".to_string(),
            artifact_type: ArtifactType::AnalysisResult,
            source: None,
            session_id: "s1".to_string(),
        },
    )
    .await
    .unwrap();

    let stats = askdb::server::collect_stats(&pool).await.unwrap();
    assert_eq!(stats.sessions, 1);
    assert_eq!(stats.artifacts, 1);
    assert_eq!(stats.indexed_tables, 1);
    assert_eq!(stats.indexed_columns, 2);
    assert_eq!(stats.formulas, 0);
}

// ─── Tool + artifact integration ────────────────────────────────────

#[tokio::test]
async fn test_run_sql_tool_saves_audit_artifact() {
    let (tmp, pool) = setup_pool().await;

    sqlx::query("CREATE TABLE orders (id INTEGER, amount REAL)")
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query("INSERT INTO orders VALUES (1, 10.0), (2, 20.0)")
        .execute(&pool)
        .await
        .unwrap();

    let embedder: Arc<dyn EmbeddingProvider> = Arc::new(RuleEmbeddings::plain());
    schema_index::sync_from_database(&pool, embedder.as_ref())
        .await
        .unwrap();

    // The planner turn replies with SQL; the follow-up turn answers.
    let chat = Arc::new(ScriptedChat::new(vec![
        tool_call("run_sql", json!({ "question": "how many orders?" })),
        Message::assistant("SELECT COUNT(*) AS cnt FROM orders", Vec::new()),
        Message::assistant("There are 2 orders.", Vec::new()),
    ]));
    let runtime = runtime_with(&tmp, pool.clone(), embedder, chat, 25);

    let outcome = runtime.run("how many orders?", "s-sql").await.unwrap();
    assert_eq!(outcome.content, "There are 2 orders.");

    // The audit pair was persisted as an analysis artifact.
    let stored = artifacts::list_by_session(&pool, "s-sql").await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].artifact_type, ArtifactType::AnalysisResult);
    assert!(stored[0].content.contains("query: SELECT COUNT(*) AS cnt FROM orders"));
    assert!(stored[0].content.contains("2"));
}
