//! # askdb CLI
//!
//! The `askdb` binary wraps the agent, the schema index, and the HTTP
//! server in a single command-line interface.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `askdb init` | Create the database and index the target schema |
//! | `askdb ask "<question>"` | Run the agent to completion and print the answer |
//! | `askdb schema "<question>"` | Show the schema fragments ranked for a question |
//! | `askdb describe <table> <text>` | Attach a description to an indexed table |
//! | `askdb artifacts <session>` | List a session's stored artifacts |
//! | `askdb sessions evict` | Delete sessions past a maximum age |
//! | `askdb serve` | Start the HTTP API server |
//!
//! ## Examples
//!
//! ```bash
//! askdb init --config ./config/askdb.toml
//! askdb ask "총 주문 건수는?" --config ./config/askdb.toml
//! askdb ask "and broken down by month?" --session 4f1c… --config ./config/askdb.toml
//! askdb serve --config ./config/askdb.toml
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use askdb::agent::AgentRuntime;
use askdb::config::{self, Config};
use askdb::{artifacts, chat, db, embedding, migrate, schema_index, server};

/// askdb — natural-language question answering over a SQLite database.
#[derive(Parser)]
#[command(
    name = "askdb",
    about = "Natural-language question answering over a schema-indexed SQLite store",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/askdb.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database and index the target schema.
    ///
    /// Creates the SQLite file, runs migrations, then introspects every
    /// user table and view into the schema index. Idempotent; existing
    /// table descriptions survive re-runs.
    Init,

    /// Ask a question and print the final answer.
    Ask {
        /// The question, in any language.
        question: String,

        /// Continue an existing session instead of starting a new one.
        #[arg(long)]
        session: Option<String>,
    },

    /// Show the schema fragments ranked for a question.
    Schema {
        /// The question to rank against.
        question: String,

        /// Maximum number of tables to show.
        #[arg(long, default_value_t = 5)]
        limit: usize,
    },

    /// Attach a human-readable description to an indexed table.
    ///
    /// Descriptions are embedded into relevance ranking and shown to the
    /// SQL planner, so a good description measurably improves answers.
    Describe {
        /// Indexed table name.
        table: String,
        /// Description text.
        description: String,
    },

    /// List a session's stored artifacts, most recent first.
    Artifacts {
        /// Session id.
        session_id: String,
    },

    /// Manage sessions.
    Sessions {
        #[command(subcommand)]
        action: SessionAction,
    },

    /// Start the HTTP API server.
    ///
    /// Binds to the address configured in `[server].bind` and serves the
    /// query, streaming, catalog, and artifact endpoints.
    Serve,
}

/// Session management subcommands.
#[derive(Subcommand)]
enum SessionAction {
    /// Delete sessions older than the given age.
    Evict {
        /// Maximum session age in days.
        #[arg(long, default_value_t = 30)]
        max_age_days: i64,

        /// Also delete the artifacts owned by evicted sessions.
        #[arg(long)]
        cascade: bool,
    },
}

/// Build the full runtime (pool, providers, tool registry) from config.
async fn build_runtime(cfg: &Config) -> anyhow::Result<AgentRuntime> {
    let pool = db::connect(&cfg.db.path).await?;
    let embedder: Arc<dyn embedding::EmbeddingProvider> =
        Arc::from(embedding::create_provider(&cfg.embedding)?);
    let chat_provider: Arc<dyn chat::ChatProvider> = Arc::from(chat::create_provider(&cfg.chat)?);
    Ok(AgentRuntime::new(
        pool,
        embedder,
        chat_provider,
        Arc::new(cfg.clone()),
    ))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg.db.path).await?;
            migrate::run_migrations(&pool).await?;
            let embedder = embedding::create_provider(&cfg.embedding)?;
            if cfg.embedding.is_enabled() {
                println!(
                    "Embedding with {} ({} dims).",
                    embedder.model_name(),
                    embedder.dims()
                );
            } else {
                println!("Embeddings disabled; schema ranking will rely on lexical matches.");
            }
            let indexed = schema_index::sync_from_database(&pool, embedder.as_ref()).await?;
            println!("Database initialized; {} tables indexed.", indexed);
        }
        Commands::Ask { question, session } => {
            let runtime = build_runtime(&cfg).await?;
            let session_id = session.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

            let outcome = runtime.run(&question, &session_id).await?;

            println!("{}", outcome.content);
            if outcome.exhausted {
                eprintln!("(stopped after {} steps)", outcome.steps);
            }
            eprintln!("session: {}", session_id);
        }
        Commands::Schema { question, limit } => {
            let pool = db::connect(&cfg.db.path).await?;
            let embedder = embedding::create_provider(&cfg.embedding)?;
            let ranked =
                schema_index::find_relevant_schema(&pool, embedder.as_ref(), &question, limit)
                    .await?;

            if ranked.is_empty() {
                println!("No schema entries matched. Run `askdb init` to index the schema.");
            } else {
                for item in &ranked {
                    println!("[{:.3}] {}", item.score, item.entry.table);
                }
                println!();
                print!("{}", schema_index::render_schema_context(&ranked));
            }
        }
        Commands::Describe { table, description } => {
            let pool = db::connect(&cfg.db.path).await?;
            if schema_index::set_table_description(&pool, &table, &description).await? {
                // Re-sync so the new description is embedded.
                let embedder = embedding::create_provider(&cfg.embedding)?;
                schema_index::sync_from_database(&pool, embedder.as_ref()).await?;
                println!("Updated description for '{}'.", table);
            } else {
                anyhow::bail!("no indexed table named '{}'", table);
            }
        }
        Commands::Artifacts { session_id } => {
            let pool = db::connect(&cfg.db.path).await?;
            let items = artifacts::list_by_session(&pool, &session_id).await?;

            if items.is_empty() {
                println!("No artifacts for session {}.", session_id);
            }
            for artifact in &items {
                println!(
                    "{}  {}  [{}]  {} chars",
                    artifact.id,
                    artifact.name,
                    artifact.artifact_type.as_str(),
                    artifact.content.chars().count()
                );
            }
        }
        Commands::Sessions { action } => match action {
            SessionAction::Evict {
                max_age_days,
                cascade,
            } => {
                let pool = db::connect(&cfg.db.path).await?;
                let evicted =
                    artifacts::evict_expired_sessions(&pool, max_age_days * 86_400, cascade)
                        .await?;
                println!("Evicted {} sessions.", evicted);
            }
        },
        Commands::Serve => {
            let runtime = build_runtime(&cfg).await?;
            server::run_server(runtime).await?;
        }
    }

    Ok(())
}
