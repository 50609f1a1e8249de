//! Natural-language to SQL planning and audited execution.
//!
//! The planner builds a prompt from the ranked schema fragments, asks the
//! chat provider for exactly one statement, and strips any fencing. It
//! never executes a statement it cannot first classify as read or write
//! (classified lexically by leading keyword): the classification gates
//! whether a fetch or a commit follows, and unclassifiable statements are
//! rejected before touching the store.
//!
//! Output is always paired — the generated SQL and the resulting rows or
//! error — so callers can audit what actually ran. Row display is capped
//! at [`DISPLAY_ROW_LIMIT`] with an explicit "N of M shown" marker.

use anyhow::{bail, Result};
use sqlx::{Column as _, Row, SqlitePool};

use crate::chat::ChatProvider;
use crate::models::Message;

/// Maximum rows included in rendered query output.
pub const DISPLAY_ROW_LIMIT: usize = 25;

/// Lexical classification of a statement by its leading keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Read,
    Write,
}

/// Result half of the audit pair.
#[derive(Debug, Clone)]
pub enum QueryResult {
    Rows {
        columns: Vec<String>,
        /// At most [`DISPLAY_ROW_LIMIT`] rows, stringified.
        rows: Vec<Vec<String>>,
        /// Total row count before capping.
        total: usize,
    },
    Affected(u64),
    /// Execution failed; the transaction was rolled back. Carries the
    /// failing statement so the model can revise its approach.
    Failed { statement: String, message: String },
}

/// The audit pair: what ran, and what came back.
#[derive(Debug, Clone)]
pub struct QueryOutcome {
    pub sql: String,
    pub result: QueryResult,
}

/// Classify by leading keyword; `None` means "do not execute".
pub fn classify_statement(sql: &str) -> Option<StatementKind> {
    let keyword = sql
        .trim_start()
        .split(|c: char| c.is_whitespace() || c == '(')
        .next()?
        .to_uppercase();

    match keyword.as_str() {
        "SELECT" | "WITH" | "PRAGMA" | "EXPLAIN" => Some(StatementKind::Read),
        "INSERT" | "UPDATE" | "DELETE" | "REPLACE" | "CREATE" | "DROP" | "ALTER" => {
            Some(StatementKind::Write)
        }
        _ => None,
    }
}

/// Strip surrounding markdown fencing and a trailing semicolon from model
/// output.
pub fn strip_fences(text: &str) -> String {
    let mut out = text.trim();

    if out.starts_with("```") {
        // Drop the opening fence line (possibly tagged, e.g. ```sql).
        out = out.splitn(2, '\n').nth(1).unwrap_or("").trim();
        if let Some(idx) = out.rfind("```") {
            out = out[..idx].trim();
        }
    }

    out.trim_end_matches(';').trim().to_string()
}

const PLANNER_SYSTEM_PROMPT: &str = "You translate questions into SQL for a SQLite database. \
Reply with exactly one SQL statement and nothing else: no prose, no markdown fences, no comments. \
Only reference the tables and columns listed in the schema context.";

/// Ask the model for one executable statement over the given schema
/// context.
pub async fn plan_query(
    chat: &dyn ChatProvider,
    question: &str,
    schema_context: &str,
) -> Result<String> {
    let prompt = format!(
        "## Schema\n{}\n## Question\n{}\n\nSQL statement:",
        schema_context, question
    );

    let messages = vec![Message::system(PLANNER_SYSTEM_PROMPT), Message::user(prompt)];
    let reply = chat.complete(&messages, &[]).await?;
    let sql = strip_fences(&reply.content);

    if sql.is_empty() {
        bail!("planner produced an empty statement");
    }

    Ok(sql)
}

/// Execute one classified statement against the store.
///
/// Reads fetch all rows and cap the display set; writes run inside a
/// transaction that commits on success. Any execution failure rolls back
/// and is returned as [`QueryResult::Failed`], not as an `Err` — failed
/// queries are part of the audit pair.
pub async fn execute_query(pool: &SqlitePool, sql: &str) -> Result<QueryResult> {
    let kind = match classify_statement(sql) {
        Some(kind) => kind,
        None => bail!(
            "refusing to execute unclassifiable statement: {}",
            truncated(sql, 120)
        ),
    };

    match kind {
        StatementKind::Read => match sqlx::query(sql).fetch_all(pool).await {
            Ok(rows) => {
                let total = rows.len();
                let columns: Vec<String> = rows
                    .first()
                    .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
                    .unwrap_or_default();

                let display_rows = rows
                    .iter()
                    .take(DISPLAY_ROW_LIMIT)
                    .map(render_row)
                    .collect();

                Ok(QueryResult::Rows {
                    columns,
                    rows: display_rows,
                    total,
                })
            }
            Err(e) => Ok(QueryResult::Failed {
                statement: sql.to_string(),
                message: e.to_string(),
            }),
        },
        StatementKind::Write => {
            let mut tx = pool.begin().await?;
            match sqlx::query(sql).execute(&mut *tx).await {
                Ok(result) => {
                    tx.commit().await?;
                    Ok(QueryResult::Affected(result.rows_affected()))
                }
                Err(e) => {
                    tx.rollback().await.ok();
                    Ok(QueryResult::Failed {
                        statement: sql.to_string(),
                        message: e.to_string(),
                    })
                }
            }
        }
    }
}

/// Plan and execute in one step, returning the audit pair.
pub async fn plan_and_execute(
    pool: &SqlitePool,
    chat: &dyn ChatProvider,
    question: &str,
    schema_context: &str,
) -> Result<QueryOutcome> {
    let sql = plan_query(chat, question, schema_context).await?;
    let result = execute_query(pool, &sql).await?;
    Ok(QueryOutcome { sql, result })
}

/// Render the audit pair as text for the conversation.
pub fn render_outcome(outcome: &QueryOutcome) -> String {
    let mut out = format!("query: {}\n", outcome.sql);

    match &outcome.result {
        QueryResult::Rows {
            columns,
            rows,
            total,
        } => {
            if *total == 0 {
                out.push_str("no rows\n");
                return out;
            }
            out.push_str(&format!("{}\n", columns.join(" | ")));
            for row in rows {
                out.push_str(&format!("{}\n", row.join(" | ")));
            }
            if *total > rows.len() {
                out.push_str(&format!("({} of {} shown)\n", rows.len(), total));
            } else {
                out.push_str(&format!("({} rows)\n", total));
            }
        }
        QueryResult::Affected(count) => {
            out.push_str(&format!("{} rows affected\n", count));
        }
        QueryResult::Failed { statement, message } => {
            out.push_str(&format!("error: {}\nfailing statement: {}\n", message, statement));
        }
    }

    out
}

/// Stringify a row column by column, trying the SQLite storage classes in
/// affinity order.
fn render_row(row: &sqlx::sqlite::SqliteRow) -> Vec<String> {
    (0..row.columns().len())
        .map(|i| {
            if let Ok(Some(v)) = row.try_get::<Option<i64>, _>(i) {
                return v.to_string();
            }
            if let Ok(Some(v)) = row.try_get::<Option<f64>, _>(i) {
                return v.to_string();
            }
            if let Ok(Some(v)) = row.try_get::<Option<String>, _>(i) {
                return v;
            }
            if let Ok(Some(v)) = row.try_get::<Option<Vec<u8>>, _>(i) {
                return format!("<blob {} bytes>", v.len());
            }
            "NULL".to_string()
        })
        .collect()
}

fn truncated(text: &str, max: usize) -> &str {
    crate::artifacts::truncate_chars(text, max)
}
