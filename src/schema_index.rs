//! Embedded table/column metadata for the query planner.
//!
//! The index stores one row per table and one embedded row per column.
//! Relevance for a question is the **max column similarity** per table,
//! with the lexical override from [`crate::ranker`] applied to the table
//! name so exact name matches dominate.
//!
//! [`sync_from_database`] introspects the SQLite catalog so the index
//! tracks the real schema; curated descriptions survive re-syncs and can
//! be attached with [`set_table_description`].

use anyhow::Result;
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob, EmbeddingProvider};
use crate::models::{Column, SchemaEntry};
use crate::ranker::lexical_floor;

/// Tables owned by askdb itself; never offered to the planner.
const INTERNAL_TABLES: &[&str] = &[
    "sessions",
    "artifacts",
    "schema_tables",
    "schema_columns",
    "formulas",
];

/// A schema entry paired with its relevance score.
pub struct RankedEntry {
    pub entry: SchemaEntry,
    pub score: f64,
}

/// Upsert entries into the index, embedding each column independently.
/// The owning table's description is appended to every column's embed
/// text.
///
/// A column that fails to embed is stored without a vector and simply
/// does not contribute to similarity scores.
pub async fn index_schema(
    pool: &SqlitePool,
    embedder: &dyn EmbeddingProvider,
    entries: &[SchemaEntry],
) -> Result<usize> {
    let mut indexed = 0;

    for entry in entries {
        sqlx::query(
            r#"
            INSERT INTO schema_tables (name, description, defining_query)
            VALUES (?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                description = CASE WHEN excluded.description != '' THEN excluded.description
                                   ELSE schema_tables.description END,
                defining_query = excluded.defining_query
            "#,
        )
        .bind(&entry.table)
        .bind(&entry.description)
        .bind(&entry.defining_query)
        .execute(pool)
        .await?;

        sqlx::query("DELETE FROM schema_columns WHERE table_name = ?")
            .bind(&entry.table)
            .execute(pool)
            .await?;

        for (ordinal, column) in entry.columns.iter().enumerate() {
            // The table description is part of every column's embed text,
            // so curating it (via `describe`) shifts the whole table's
            // relevance.
            let mut embed_text = format!(
                "{}.{} ({}): {}",
                entry.table, column.name, column.sql_type, column.description
            );
            if !entry.description.is_empty() {
                embed_text.push_str(" | ");
                embed_text.push_str(&entry.description);
            }
            let embedding = match embedder.embed_one(&embed_text).await {
                Ok(vector) => Some(vector),
                Err(e) => {
                    eprintln!(
                        "warning: embedding failed for column {}.{}: {e}",
                        entry.table, column.name
                    );
                    None
                }
            };

            sqlx::query(
                r#"
                INSERT INTO schema_columns
                    (table_name, name, sql_type, description, nullable, ordinal, embedding)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&entry.table)
            .bind(&column.name)
            .bind(&column.sql_type)
            .bind(&column.description)
            .bind(column.nullable as i64)
            .bind(ordinal as i64)
            .bind(embedding.as_deref().map(vec_to_blob))
            .execute(pool)
            .await?;
        }

        indexed += 1;
    }

    Ok(indexed)
}

/// Introspect the SQLite catalog and (re)index every user table and view.
///
/// Existing descriptions in the index are preserved.
pub async fn sync_from_database(
    pool: &SqlitePool,
    embedder: &dyn EmbeddingProvider,
) -> Result<usize> {
    let existing_descriptions: BTreeMap<String, String> =
        sqlx::query("SELECT name, description FROM schema_tables")
            .fetch_all(pool)
            .await?
            .iter()
            .map(|row| (row.get("name"), row.get("description")))
            .collect();

    let tables = sqlx::query(
        "SELECT name, type, sql FROM sqlite_master
         WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%'
         ORDER BY name",
    )
    .fetch_all(pool)
    .await?;

    let mut entries = Vec::new();

    for table_row in &tables {
        let name: String = table_row.get("name");
        if INTERNAL_TABLES.contains(&name.as_str()) {
            continue;
        }
        let kind: String = table_row.get("type");
        let defining_query = if kind == "view" {
            table_row.get::<Option<String>, _>("sql")
        } else {
            None
        };

        let column_rows = sqlx::query(&format!("PRAGMA table_info('{}')", name.replace('\'', "''")))
            .fetch_all(pool)
            .await?;

        let columns = column_rows
            .iter()
            .map(|row| Column {
                name: row.get("name"),
                sql_type: row.get("type"),
                description: String::new(),
                nullable: row.get::<i64, _>("notnull") == 0,
                embedding: None,
            })
            .collect();

        entries.push(SchemaEntry {
            description: existing_descriptions.get(&name).cloned().unwrap_or_default(),
            table: name,
            defining_query,
            columns,
        });
    }

    index_schema(pool, embedder, &entries).await
}

/// Attach a human-readable description to an indexed table.
pub async fn set_table_description(
    pool: &SqlitePool,
    table: &str,
    description: &str,
) -> Result<bool> {
    let result = sqlx::query("UPDATE schema_tables SET description = ? WHERE name = ?")
        .bind(description)
        .bind(table)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Load all indexed entries, columns in declared order.
pub async fn load_entries(pool: &SqlitePool) -> Result<Vec<SchemaEntry>> {
    let table_rows = sqlx::query(
        "SELECT name, description, defining_query FROM schema_tables ORDER BY name",
    )
    .fetch_all(pool)
    .await?;

    let mut entries = Vec::with_capacity(table_rows.len());

    for table_row in &table_rows {
        let table: String = table_row.get("name");

        let column_rows = sqlx::query(
            "SELECT name, sql_type, description, nullable, embedding
             FROM schema_columns WHERE table_name = ? ORDER BY ordinal",
        )
        .bind(&table)
        .fetch_all(pool)
        .await?;

        let columns = column_rows
            .iter()
            .map(|row| {
                let blob: Option<Vec<u8>> = row.get("embedding");
                Column {
                    name: row.get("name"),
                    sql_type: row.get("sql_type"),
                    description: row.get("description"),
                    nullable: row.get::<i64, _>("nullable") != 0,
                    embedding: blob.map(|b| blob_to_vec(&b)),
                }
            })
            .collect();

        entries.push(SchemaEntry {
            table,
            description: table_row.get("description"),
            defining_query: table_row.get("defining_query"),
            columns,
        });
    }

    Ok(entries)
}

/// Rank indexed entries by relevance to `question`, best first, at most `k`.
///
/// Score per table = max cosine over its embedded columns, then lifted to
/// the lexical floor when the table name matches the question. Tables
/// with no embedded columns and no lexical match are excluded. Ties keep
/// load order (alphabetical), so results are deterministic.
pub async fn find_relevant_schema(
    pool: &SqlitePool,
    embedder: &dyn EmbeddingProvider,
    question: &str,
    k: usize,
) -> Result<Vec<RankedEntry>> {
    let query_vector = embedder.embed_one(question).await?;
    let entries = load_entries(pool).await?;

    let mut ranked: Vec<RankedEntry> = entries
        .into_iter()
        .filter_map(|entry| {
            let best_column = entry
                .columns
                .iter()
                .filter_map(|c| c.embedding.as_deref())
                .map(|v| cosine_similarity(&query_vector, v) as f64)
                .fold(None::<f64>, |acc, s| Some(acc.map_or(s, |a| a.max(s))));

            let floor = lexical_floor(&entry.table, question);

            let score = match (best_column, floor) {
                (Some(s), Some(f)) => s.max(f),
                (Some(s), None) => s,
                (None, Some(f)) => f,
                (None, None) => return None,
            };

            Some(RankedEntry { entry, score })
        })
        .collect();

    ranked.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    ranked.truncate(k);
    Ok(ranked)
}

/// Render ranked entries as the schema context block for the planner
/// prompt.
pub fn render_schema_context(ranked: &[RankedEntry]) -> String {
    let mut out = String::new();

    for item in ranked {
        let entry = &item.entry;
        out.push_str(&format!("### {}\n", entry.table));
        if !entry.description.is_empty() {
            out.push_str(&format!("{}\n", entry.description));
        }
        if let Some(ref query) = entry.defining_query {
            out.push_str(&format!("view definition: {}\n", query));
        }
        for column in &entry.columns {
            let nullable = if column.nullable { "" } else { " NOT NULL" };
            if column.description.is_empty() {
                out.push_str(&format!("- {} {}{}\n", column.name, column.sql_type, nullable));
            } else {
                out.push_str(&format!(
                    "- {} {}{} — {}\n",
                    column.name, column.sql_type, nullable, column.description
                ));
            }
        }
        out.push('\n');
    }

    out
}
