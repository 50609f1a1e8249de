use anyhow::Result;
use sqlx::SqlitePool;

/// Create all askdb-internal tables. Idempotent; safe to run repeatedly.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS artifacts (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT NOT NULL,
            content TEXT NOT NULL,
            artifact_type TEXT NOT NULL,
            source TEXT,
            session_id TEXT NOT NULL,
            embedding BLOB,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (session_id) REFERENCES sessions(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_tables (
            name TEXT PRIMARY KEY,
            description TEXT NOT NULL DEFAULT '',
            defining_query TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_columns (
            table_name TEXT NOT NULL,
            name TEXT NOT NULL,
            sql_type TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            nullable INTEGER NOT NULL DEFAULT 1,
            ordinal INTEGER NOT NULL,
            embedding BLOB,
            PRIMARY KEY (table_name, name),
            FOREIGN KEY (table_name) REFERENCES schema_tables(name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS formulas (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            latex TEXT,
            expression TEXT,
            description TEXT,
            source_page INTEGER,
            recommended_queries TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_artifacts_session ON artifacts(session_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_artifacts_created_at ON artifacts(created_at DESC)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_schema_columns_table ON schema_columns(table_name)")
        .execute(pool)
        .await?;

    Ok(())
}
