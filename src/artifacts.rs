//! Session-scoped artifact store.
//!
//! Artifacts are persisted work products (search results, downloaded
//! files, analyses) that let the agent avoid redundant work: before
//! reaching for external tools it can rank prior results by similarity to
//! the new query, biased toward the current session.
//!
//! Truncation happens in two distinct places:
//! - [`MAX_CONTENT_CHARS`] caps content at **storage** time; retrieval
//!   always returns exactly what was stored.
//! - [`PREVIEW_CHARS`] caps the content preview returned by search.
//!
//! An artifact's embedding is computed exactly once at creation, over
//! `name + ": " + description + "\n" + content[..EMBED_PREFIX_CHARS]`.
//! When embedding fails the artifact is stored without a vector: it is
//! invisible to similarity search but still retrievable by id.

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::embedding::{blob_to_vec, vec_to_blob, EmbeddingProvider};
use crate::models::{Artifact, ArtifactType, Session};
use crate::ranker::{self, Candidate};

/// Maximum stored content length, in characters.
pub const MAX_CONTENT_CHARS: usize = 50_000;

/// Content prefix length included in the embedded text.
pub const EMBED_PREFIX_CHARS: usize = 3_000;

/// Content preview length returned by search.
pub const PREVIEW_CHARS: usize = 2_000;

/// Input to [`save_artifact`].
pub struct NewArtifact {
    pub name: String,
    pub description: String,
    pub content: String,
    pub artifact_type: ArtifactType,
    pub source: Option<String>,
    pub session_id: String,
}

/// A search hit: artifact metadata, score, and a bounded content preview.
#[derive(Debug, Clone, Serialize)]
pub struct ArtifactHit {
    pub id: String,
    pub name: String,
    pub description: String,
    pub artifact_type: ArtifactType,
    pub session_id: String,
    pub score: f64,
    pub preview: String,
}

/// Truncate to at most `max` characters, respecting UTF-8 boundaries.
pub fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Create the session row if it does not exist yet.
pub async fn ensure_session(pool: &SqlitePool, session_id: &str) -> Result<()> {
    sqlx::query("INSERT OR IGNORE INTO sessions (id, created_at) VALUES (?, ?)")
        .bind(session_id)
        .bind(Utc::now().timestamp())
        .execute(pool)
        .await?;
    Ok(())
}

/// Time-ordered unique artifact id.
fn new_artifact_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{:013x}-{}", Utc::now().timestamp_millis(), &suffix[..8])
}

/// Persist a new artifact and return its id.
///
/// Lazily creates the owning session. Embedding failure degrades to a
/// vectorless record rather than failing the save.
pub async fn save_artifact(
    pool: &SqlitePool,
    embedder: &dyn EmbeddingProvider,
    artifact: NewArtifact,
) -> Result<String> {
    ensure_session(pool, &artifact.session_id).await?;

    let content = truncate_chars(&artifact.content, MAX_CONTENT_CHARS);

    let embed_text = format!(
        "{}: {}\n{}",
        artifact.name,
        artifact.description,
        truncate_chars(content, EMBED_PREFIX_CHARS)
    );

    let embedding = match embedder.embed_one(&embed_text).await {
        Ok(vector) => Some(vector),
        Err(e) => {
            eprintln!(
                "warning: embedding failed for artifact '{}': {e} (stored without vector)",
                artifact.name
            );
            None
        }
    };

    let id = new_artifact_id();

    sqlx::query(
        r#"
        INSERT INTO artifacts
            (id, name, description, content, artifact_type, source, session_id, embedding, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(&artifact.name)
    .bind(&artifact.description)
    .bind(content)
    .bind(artifact.artifact_type.as_str())
    .bind(&artifact.source)
    .bind(&artifact.session_id)
    .bind(embedding.as_deref().map(vec_to_blob))
    .bind(Utc::now().timestamp_millis())
    .execute(pool)
    .await?;

    Ok(id)
}

/// Search artifacts by similarity to `query`.
///
/// Candidates are scoped to `session_id` unless `cross_session` is set,
/// in which case all artifacts compete and same-session ones get the
/// boost. Artifacts without vectors never appear in results.
pub async fn search_artifacts(
    pool: &SqlitePool,
    embedder: &dyn EmbeddingProvider,
    query: &str,
    session_id: &str,
    k: usize,
    cross_session: bool,
    session_boost: f64,
) -> Result<Vec<ArtifactHit>> {
    let query_vector = embedder.embed_one(query).await?;

    let rows = if cross_session {
        sqlx::query(
            "SELECT id, name, description, content, artifact_type, session_id, embedding
             FROM artifacts ORDER BY created_at ASC",
        )
        .fetch_all(pool)
        .await?
    } else {
        sqlx::query(
            "SELECT id, name, description, content, artifact_type, session_id, embedding
             FROM artifacts WHERE session_id = ? ORDER BY created_at ASC",
        )
        .bind(session_id)
        .fetch_all(pool)
        .await?
    };

    struct Meta {
        name: String,
        description: String,
        artifact_type: ArtifactType,
        session_id: String,
        preview: String,
    }

    let candidates: Vec<Candidate<Meta>> = rows
        .iter()
        .map(|row| {
            let blob: Option<Vec<u8>> = row.get("embedding");
            let owner: String = row.get("session_id");
            let content: String = row.get("content");
            let type_str: String = row.get("artifact_type");

            let mut candidate = Candidate::new(
                row.get::<String, _>("id"),
                blob.map(|b| blob_to_vec(&b)),
                Meta {
                    name: row.get("name"),
                    description: row.get("description"),
                    artifact_type: ArtifactType::parse(&type_str)
                        .unwrap_or(ArtifactType::AnalysisResult),
                    session_id: owner.clone(),
                    preview: truncate_chars(&content, PREVIEW_CHARS).to_string(),
                },
            );
            if owner == session_id {
                candidate.weight = session_boost;
            }
            candidate
        })
        .collect();

    let ranked = ranker::rank(&query_vector, candidates, k);

    Ok(ranked
        .into_iter()
        .map(|r| ArtifactHit {
            id: r.id,
            name: r.meta.name,
            description: r.meta.description,
            artifact_type: r.meta.artifact_type,
            session_id: r.meta.session_id,
            score: r.score,
            preview: r.meta.preview,
        })
        .collect())
}

/// Fetch the full record by id, or `None`.
pub async fn get_artifact(pool: &SqlitePool, id: &str) -> Result<Option<Artifact>> {
    let row = sqlx::query(
        "SELECT id, name, description, content, artifact_type, source, session_id, embedding, created_at
         FROM artifacts WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|row| row_to_artifact(&row)))
}

/// All artifacts of a session, most recent first.
pub async fn list_by_session(pool: &SqlitePool, session_id: &str) -> Result<Vec<Artifact>> {
    let rows = sqlx::query(
        "SELECT id, name, description, content, artifact_type, source, session_id, embedding, created_at
         FROM artifacts WHERE session_id = ? ORDER BY created_at DESC",
    )
    .bind(session_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.iter().map(row_to_artifact).collect())
}

/// Delete sessions older than `max_age_secs`.
///
/// Owned artifacts are deleted only when `cascade` is set; otherwise they
/// stay retrievable by id after their session row is gone.
pub async fn evict_expired_sessions(
    pool: &SqlitePool,
    max_age_secs: i64,
    cascade: bool,
) -> Result<u64> {
    let cutoff = Utc::now().timestamp() - max_age_secs;

    if cascade {
        sqlx::query(
            "DELETE FROM artifacts WHERE session_id IN
             (SELECT id FROM sessions WHERE created_at < ?)",
        )
        .bind(cutoff)
        .execute(pool)
        .await?;
    }

    let result = sqlx::query("DELETE FROM sessions WHERE created_at < ?")
        .bind(cutoff)
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}

/// Look up a session record.
pub async fn get_session(pool: &SqlitePool, session_id: &str) -> Result<Option<Session>> {
    let row = sqlx::query("SELECT id, created_at FROM sessions WHERE id = ?")
        .bind(session_id)
        .fetch_optional(pool)
        .await?;

    Ok(row.map(|row| Session {
        id: row.get("id"),
        created_at: timestamp_to_datetime(row.get::<i64, _>("created_at") * 1000),
    }))
}

fn row_to_artifact(row: &sqlx::sqlite::SqliteRow) -> Artifact {
    let type_str: String = row.get("artifact_type");
    let blob: Option<Vec<u8>> = row.get("embedding");

    Artifact {
        id: row.get("id"),
        name: row.get("name"),
        description: row.get("description"),
        content: row.get("content"),
        artifact_type: ArtifactType::parse(&type_str).unwrap_or(ArtifactType::AnalysisResult),
        source: row.get("source"),
        session_id: row.get("session_id"),
        embedding: blob.map(|b| blob_to_vec(&b)),
        created_at: timestamp_to_datetime(row.get("created_at")),
    }
}

fn timestamp_to_datetime(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis).single().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_chars_ascii() {
        assert_eq!(truncate_chars("hello world", 5), "hello");
        assert_eq!(truncate_chars("short", 100), "short");
    }

    #[test]
    fn test_truncate_chars_multibyte() {
        // Korean text: truncation counts characters, not bytes, and never
        // splits a codepoint.
        let text = "웹검색: 강수량 데이터";
        let cut = truncate_chars(text, 3);
        assert_eq!(cut, "웹검색");
    }

    #[test]
    fn test_artifact_ids_are_time_ordered() {
        let a = new_artifact_id();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = new_artifact_id();
        assert!(b > a, "expected {b} to sort after {a}");
    }
}
