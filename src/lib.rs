//! # askdb
//!
//! A natural-language question-answering agent over a SQLite database.
//!
//! askdb runs a bounded tool-calling loop around a chat model: the model
//! inspects an embedded schema index, plans SQL, executes it under a
//! read/write classification gate, and stores every work product as a
//! session-scoped artifact it can find again by similarity. Results are
//! served over a CLI and an HTTP API with SSE streaming.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌─────────────┐   ┌───────────┐
//! │ Question  │──▶│ Agent loop  │──▶│  Tools     │
//! │ CLI/HTTP  │   │ (max steps) │   │ sql/calc/…│
//! └──────────┘   └──────┬──────┘   └─────┬─────┘
//!                       │                 │
//!                  ┌────▼────┐      ┌────▼─────┐
//!                  │  Chat    │      │  SQLite   │
//!                  │ provider │      │ artifacts │
//!                  └─────────┘      │ + schema  │
//!                                   └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! askdb init                          # create database and index the schema
//! askdb ask "How many orders in May?" # one-shot question
//! askdb serve                         # start the HTTP API
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`embedding`] | Embedding provider abstraction and vector math |
//! | [`chat`] | Chat-completion provider abstraction |
//! | [`ranker`] | Similarity ranking with session boost |
//! | [`artifacts`] | Session-scoped artifact store |
//! | [`schema_index`] | Embedded table/column metadata |
//! | [`planner`] | NL-to-SQL planning and audited execution |
//! | [`calc`] | Arithmetic expression evaluator |
//! | [`tools`] | Tool contracts and built-in tools |
//! | [`agent`] | The agent control loop |
//! | [`server`] | HTTP API with SSE streaming |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod agent;
pub mod artifacts;
pub mod calc;
pub mod chat;
pub mod config;
pub mod db;
pub mod embedding;
pub mod migrate;
pub mod models;
pub mod planner;
pub mod ranker;
pub mod schema_index;
pub mod server;
pub mod tools;
