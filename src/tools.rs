//! Tool contracts and the built-in tool set.
//!
//! Every tool the agent may invoke implements [`Tool`]: a name, a
//! one-line description the model uses to decide invocation, an OpenAI
//! function-calling parameter schema, and an `execute` that always
//! returns text (structured data is serialized for model consumption).
//!
//! The [`ToolRegistry`] is built once at startup and passed by reference
//! into the control loop; registration is dispatch data, not framework
//! magic. Arguments are checked against the schema with
//! [`validate_params`] before any handler runs.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::artifacts::{self, NewArtifact};
use crate::calc;
use crate::chat::{ChatProvider, ToolSchema};
use crate::config::Config;
use crate::embedding::EmbeddingProvider;
use crate::models::ArtifactType;
use crate::planner;
use crate::schema_index;

// ═══════════════════════════════════════════════════════════════════════
// Tool trait and registry
// ═══════════════════════════════════════════════════════════════════════

/// A named, schema-typed operation the agent may invoke.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Lowercase identifier with underscores (e.g. `"run_sql"`).
    fn name(&self) -> &str;

    /// One-line description for model-side tool selection.
    fn description(&self) -> &str;

    /// JSON Schema (`type: "object"`) for the tool's parameters.
    fn parameters_schema(&self) -> Value;

    /// Execute with validated parameters. Returns the textual result that
    /// goes back into the conversation.
    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<String>;
}

/// Mapping from tool name to contract, built once at process start and
/// read-only thereafter.
pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    /// Registry pre-loaded with the built-in tool set.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(SearchArtifactsTool));
        registry.register(Box::new(GetArtifactTool));
        registry.register(Box::new(FindSchemaTool));
        registry.register(Box::new(RunSqlTool));
        registry.register(Box::new(CalculateTool));
        registry.register(Box::new(WebSearchTool));
        registry.register(Box::new(FetchUrlTool));
        registry
    }

    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn find(&self, name: &str) -> Option<&dyn Tool> {
        self.tools
            .iter()
            .find(|t| t.name() == name)
            .map(|t| t.as_ref())
    }

    pub fn tools(&self) -> &[Box<dyn Tool>] {
        &self.tools
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Wire-level schemas for every registered tool.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.tools
            .iter()
            .map(|t| ToolSchema {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Bridge handed to every tool execution.
///
/// Carries the explicit session id — tools never consult process-global
/// state, which keeps concurrent conversations isolated.
pub struct ToolContext {
    pub pool: sqlx::SqlitePool,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub chat: Arc<dyn ChatProvider>,
    pub config: Arc<Config>,
    pub session_id: String,
    pub http: reqwest::Client,
}

// ═══════════════════════════════════════════════════════════════════════
// Parameter validation
// ═══════════════════════════════════════════════════════════════════════

/// Validate `params` against an OpenAI function-calling JSON Schema.
///
/// Checks required fields, primitive types, and enums; injects declared
/// defaults for absent optional parameters. Returns the validated
/// (possibly augmented) parameter object.
pub fn validate_params(schema: &Value, params: &Value) -> Result<Value> {
    let params_obj = params
        .as_object()
        .cloned()
        .unwrap_or_default();

    let properties = schema
        .get("properties")
        .and_then(|p| p.as_object())
        .cloned()
        .unwrap_or_default();

    let required: Vec<String> = schema
        .get("required")
        .and_then(|r| r.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default();

    let mut result = params_obj.clone();

    for req_field in &required {
        if !params_obj.contains_key(req_field) {
            bail!("missing required parameter: {}", req_field);
        }
    }

    for (prop_name, prop_schema) in &properties {
        if let Some(value) = params_obj.get(prop_name) {
            if let Some(expected_type) = prop_schema.get("type").and_then(|t| t.as_str()) {
                let type_ok = match expected_type {
                    "string" => value.is_string(),
                    "integer" => value.is_i64() || value.is_u64(),
                    "number" => value.is_number(),
                    "boolean" => value.is_boolean(),
                    "array" => value.is_array(),
                    "object" => value.is_object(),
                    _ => true,
                };
                if !type_ok {
                    bail!(
                        "parameter '{}' must be of type '{}', got {}",
                        prop_name,
                        expected_type,
                        json_type_name(value)
                    );
                }
            }

            if let Some(enum_values) = prop_schema.get("enum").and_then(|e| e.as_array()) {
                if !enum_values.contains(value) {
                    let allowed: Vec<String> = enum_values.iter().map(|v| v.to_string()).collect();
                    bail!(
                        "parameter '{}' must be one of [{}], got {}",
                        prop_name,
                        allowed.join(", "),
                        value
                    );
                }
            }
        } else if let Some(default) = prop_schema.get("default") {
            result.insert(prop_name.clone(), default.clone());
        }
    }

    Ok(Value::Object(result))
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Built-in tools
// ═══════════════════════════════════════════════════════════════════════

/// Search prior work products by semantic similarity.
pub struct SearchArtifactsTool;

#[async_trait]
impl Tool for SearchArtifactsTool {
    fn name(&self) -> &str {
        "search_artifacts"
    }

    fn description(&self) -> &str {
        "Search results produced earlier in this conversation (and optionally others) by similarity. Use this before external tools to avoid redundant work."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "What to look for" },
                "cross_session": { "type": "boolean", "description": "Also search other conversations", "default": false },
                "limit": { "type": "integer", "description": "Max results", "default": 5 }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<String> {
        let query = params["query"].as_str().unwrap_or("");
        if query.trim().is_empty() {
            bail!("query must not be empty");
        }
        let cross_session = params["cross_session"].as_bool().unwrap_or(false);
        let limit = params["limit"].as_i64().unwrap_or(5).max(1) as usize;

        let hits = artifacts::search_artifacts(
            &ctx.pool,
            ctx.embedder.as_ref(),
            query,
            &ctx.session_id,
            limit,
            cross_session,
            ctx.config.agent.session_boost,
        )
        .await?;

        if hits.is_empty() {
            return Ok("no stored artifacts matched".to_string());
        }

        let mut out = String::new();
        for hit in &hits {
            out.push_str(&format!(
                "[{:.3}] {} ({}) id={}\n{}\n\n",
                hit.score,
                hit.name,
                hit.artifact_type.as_str(),
                hit.id,
                hit.preview
            ));
        }
        Ok(out)
    }
}

/// Retrieve a full artifact by id.
pub struct GetArtifactTool;

#[async_trait]
impl Tool for GetArtifactTool {
    fn name(&self) -> &str {
        "get_artifact"
    }

    fn description(&self) -> &str {
        "Retrieve the full content of a stored artifact by id"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "id": { "type": "string", "description": "Artifact id" }
            },
            "required": ["id"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<String> {
        let id = params["id"].as_str().unwrap_or("");
        if id.trim().is_empty() {
            bail!("id must not be empty");
        }

        match artifacts::get_artifact(&ctx.pool, id).await? {
            Some(artifact) => Ok(format!(
                "{} ({})\n{}\n\n{}",
                artifact.name,
                artifact.artifact_type.as_str(),
                artifact.description,
                artifact.content
            )),
            None => bail!("artifact not found: {}", id),
        }
    }
}

/// Rank schema fragments relevant to a question.
pub struct FindSchemaTool;

#[async_trait]
impl Tool for FindSchemaTool {
    fn name(&self) -> &str {
        "find_schema"
    }

    fn description(&self) -> &str {
        "Find the database tables and columns most relevant to a question"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "question": { "type": "string", "description": "The question to find schema for" },
                "limit": { "type": "integer", "description": "Max tables", "default": 5 }
            },
            "required": ["question"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<String> {
        let question = params["question"].as_str().unwrap_or("");
        if question.trim().is_empty() {
            bail!("question must not be empty");
        }
        let limit = params["limit"].as_i64().unwrap_or(5).max(1) as usize;

        let ranked =
            schema_index::find_relevant_schema(&ctx.pool, ctx.embedder.as_ref(), question, limit)
                .await?;

        if ranked.is_empty() {
            return Ok("no schema entries matched".to_string());
        }
        Ok(schema_index::render_schema_context(&ranked))
    }
}

/// Plan and run one SQL statement, returning the audit pair.
pub struct RunSqlTool;

#[async_trait]
impl Tool for RunSqlTool {
    fn name(&self) -> &str {
        "run_sql"
    }

    fn description(&self) -> &str {
        "Answer a question against the database: plans one SQL statement from the relevant schema, executes it, and returns both the query and its result"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "question": { "type": "string", "description": "The question to answer with SQL" }
            },
            "required": ["question"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<String> {
        let question = params["question"].as_str().unwrap_or("");
        if question.trim().is_empty() {
            bail!("question must not be empty");
        }

        let ranked =
            schema_index::find_relevant_schema(&ctx.pool, ctx.embedder.as_ref(), question, 5)
                .await?;
        if ranked.is_empty() {
            bail!("no indexed schema available; run `askdb init` first");
        }

        let schema_context = schema_index::render_schema_context(&ranked);
        let outcome =
            planner::plan_and_execute(&ctx.pool, ctx.chat.as_ref(), question, &schema_context)
                .await?;
        let rendered = planner::render_outcome(&outcome);

        // Persist the audit pair so later turns can reuse it instead of
        // re-running the query.
        let saved = artifacts::save_artifact(
            &ctx.pool,
            ctx.embedder.as_ref(),
            NewArtifact {
                name: format!("SQL: {}", artifacts::truncate_chars(question, 80)),
                description: format!("query result for: {}", question),
                content: rendered.clone(),
                artifact_type: ArtifactType::AnalysisResult,
                source: None,
                session_id: ctx.session_id.clone(),
            },
        )
        .await;
        if let Err(e) = saved {
            eprintln!("warning: failed to save query artifact: {e}");
        }

        Ok(rendered)
    }
}

/// Evaluate an arithmetic formula over named variables.
pub struct CalculateTool;

#[async_trait]
impl Tool for CalculateTool {
    fn name(&self) -> &str {
        "calculate"
    }

    fn description(&self) -> &str {
        "Evaluate an arithmetic formula, e.g. expression \"(I/N) * (L/B)\" with variables {\"I\": 100, \"N\": 1000, \"L\": 500000, \"B\": 10}"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "expression": { "type": "string", "description": "Formula using + - * / ^ and parentheses" },
                "variables": { "type": "object", "description": "Variable name to numeric value" }
            },
            "required": ["expression"]
        })
    }

    async fn execute(&self, params: Value, _ctx: &ToolContext) -> Result<String> {
        let expression = params["expression"].as_str().unwrap_or("");
        if expression.trim().is_empty() {
            bail!("expression must not be empty");
        }

        let mut vars = HashMap::new();
        if let Some(obj) = params["variables"].as_object() {
            for (name, value) in obj {
                let number = value
                    .as_f64()
                    .ok_or_else(|| anyhow::anyhow!("variable '{}' is not a number", name))?;
                vars.insert(name.clone(), number);
            }
        }

        let result = calc::evaluate(expression, &vars)?;
        Ok(format!("{} = {}", expression, result))
    }
}

/// External web search via the configured search API.
pub struct WebSearchTool;

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web. Only use this after search_artifacts and the database have come up empty."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "Search query" }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<String> {
        let query = params["query"].as_str().unwrap_or("");
        if query.trim().is_empty() {
            bail!("query must not be empty");
        }

        let Some(ref endpoint) = ctx.config.web_search.endpoint else {
            bail!("web search is not configured (set web_search.endpoint)");
        };

        let count = ctx.config.web_search.max_results.to_string();
        let mut request = ctx
            .http
            .get(endpoint)
            .query(&[("q", query), ("count", count.as_str())]);
        if let Ok(key) = std::env::var(&ctx.config.web_search.api_key_env) {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            bail!("search API error {}", status);
        }
        let json: Value = response.json().await?;
        let rendered = render_search_results(&json);

        let saved = artifacts::save_artifact(
            &ctx.pool,
            ctx.embedder.as_ref(),
            NewArtifact {
                name: format!("웹검색: {}", artifacts::truncate_chars(query, 80)),
                description: format!("web search results for: {}", query),
                content: rendered.clone(),
                artifact_type: ArtifactType::SearchResult,
                source: Some(endpoint.clone()),
                session_id: ctx.session_id.clone(),
            },
        )
        .await;
        if let Err(e) = saved {
            eprintln!("warning: failed to save search artifact: {e}");
        }

        Ok(rendered)
    }
}

/// Flatten a search API response into readable lines. Falls back to the
/// raw JSON when the shape is unrecognized.
fn render_search_results(json: &Value) -> String {
    let results = json
        .get("results")
        .or_else(|| json.pointer("/web/results"))
        .and_then(|r| r.as_array());

    match results {
        Some(items) if !items.is_empty() => items
            .iter()
            .map(|item| {
                let title = item["title"].as_str().unwrap_or("(untitled)");
                let url = item["url"].as_str().unwrap_or("");
                let snippet = item["snippet"]
                    .as_str()
                    .or_else(|| item["description"].as_str())
                    .unwrap_or("");
                format!("{}\n{}\n{}", title, url, snippet)
            })
            .collect::<Vec<_>>()
            .join("\n\n"),
        _ => artifacts::truncate_chars(&json.to_string(), 4000).to_string(),
    }
}

/// Download a page or document as text.
pub struct FetchUrlTool;

#[async_trait]
impl Tool for FetchUrlTool {
    fn name(&self) -> &str {
        "fetch_url"
    }

    fn description(&self) -> &str {
        "Download a URL and store its text content as an artifact"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "url": { "type": "string", "description": "HTTP(S) URL to fetch" }
            },
            "required": ["url"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<String> {
        let url = params["url"].as_str().unwrap_or("");
        if !url.starts_with("http://") && !url.starts_with("https://") {
            bail!("url must be http(s)");
        }

        let response = ctx.http.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            bail!("fetch failed with status {}", status);
        }
        let body = response.text().await?;
        let content = artifacts::truncate_chars(&body, artifacts::MAX_CONTENT_CHARS).to_string();

        let id = artifacts::save_artifact(
            &ctx.pool,
            ctx.embedder.as_ref(),
            NewArtifact {
                name: format!("다운로드: {}", artifacts::truncate_chars(url, 120)),
                description: format!("downloaded from {}", url),
                content: content.clone(),
                artifact_type: ArtifactType::DownloadedFile,
                source: Some(url.to_string()),
                session_id: ctx.session_id.clone(),
            },
        )
        .await?;

        Ok(format!(
            "saved as artifact {} ({} chars)\n\n{}",
            id,
            content.chars().count(),
            artifacts::truncate_chars(&content, artifacts::PREVIEW_CHARS)
        ))
    }
}
