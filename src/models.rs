//! Core data types shared across the agent loop, artifact store, and
//! schema index.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Conversation participant role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider-assigned call id, echoed back on the answering tool message.
    pub id: String,
    pub name: String,
    /// Parsed JSON arguments.
    pub arguments: serde_json::Value,
}

/// One entry in the conversation. Immutable once appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Set on tool messages: the call id this message answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls,
            tool_call_id: None,
        }
    }

    pub fn tool(content: impl Into<String>, tool_call_id: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

/// Outcome of executing one tool invocation. Failures are carried as
/// `success = false` with error text in `content`; they never propagate
/// past the tool boundary.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub invocation_id: String,
    pub content: String,
    pub success: bool,
    pub latency_ms: u64,
}

/// Kind of work product stored in the artifact store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    SearchResult,
    DownloadedFile,
    AnalysisResult,
    CsvData,
}

impl ArtifactType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactType::SearchResult => "search_result",
            ArtifactType::DownloadedFile => "downloaded_file",
            ArtifactType::AnalysisResult => "analysis_result",
            ArtifactType::CsvData => "csv_data",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "search_result" => Some(ArtifactType::SearchResult),
            "downloaded_file" => Some(ArtifactType::DownloadedFile),
            "analysis_result" => Some(ArtifactType::AnalysisResult),
            "csv_data" => Some(ArtifactType::CsvData),
            _ => None,
        }
    }
}

/// A persisted, embedded record of prior tool output, reusable across
/// subsequent turns of the same session.
#[derive(Debug, Clone, Serialize)]
pub struct Artifact {
    /// Time-ordered unique token (millisecond timestamp + random suffix).
    pub id: String,
    pub name: String,
    pub description: String,
    /// Truncated to the storage cap at save time, never at retrieval.
    pub content: String,
    pub artifact_type: ArtifactType,
    pub source: Option<String>,
    pub session_id: String,
    /// Computed exactly once at creation. `None` when embedding failed;
    /// such artifacts are excluded from similarity search.
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
}

/// A conversation-scoped grouping of artifacts.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: String,
    pub created_at: DateTime<Utc>,
}

/// One column of an indexed table.
#[derive(Debug, Clone)]
pub struct Column {
    pub name: String,
    pub sql_type: String,
    pub description: String,
    pub nullable: bool,
    /// Per-column embedding, independent of the table's other columns.
    pub embedding: Option<Vec<f32>>,
}

/// Embedded metadata for one table (or view) in the target store.
#[derive(Debug, Clone)]
pub struct SchemaEntry {
    pub table: String,
    pub description: String,
    /// Defining SELECT when the entry is a view.
    pub defining_query: Option<String>,
    pub columns: Vec<Column>,
}

/// A formula record from the catalog (carried over from the source system's
/// knowledge graph; stored relationally here).
#[derive(Debug, Clone, Serialize)]
pub struct Formula {
    pub id: String,
    pub name: String,
    pub latex: Option<String>,
    pub expression: Option<String>,
    pub description: Option<String>,
    pub source_page: Option<i64>,
    pub recommended_queries: Vec<String>,
}

/// Streaming event emitted by the agent loop. Serialized one frame per
/// event as a typed envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// First frame of every stream: the session the run is scoped to.
    Session { session_id: String },
    /// Incremental model output.
    Token { content: String },
    /// A tool is about to execute. `input` is truncated for display.
    ToolStart { tool: String, input: String },
    /// A tool finished. `output` is truncated for display; `latency_ms`
    /// is the tool's wall-clock execution time.
    ToolEnd { output: String, latency_ms: u64 },
    Error { content: String },
    Done,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_envelope_tags() {
        let ev = AgentEvent::ToolStart {
            tool: "run_sql".to_string(),
            input: "{\"question\":\"...\"}".to_string(),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "tool_start");
        assert_eq!(json["tool"], "run_sql");

        let end = serde_json::to_value(&AgentEvent::ToolEnd {
            output: "3 rows".to_string(),
            latency_ms: 42,
        })
        .unwrap();
        assert_eq!(end["type"], "tool_end");
        assert_eq!(end["latency_ms"], 42);

        let done = serde_json::to_value(&AgentEvent::Done).unwrap();
        assert_eq!(done["type"], "done");
    }

    #[test]
    fn test_artifact_type_roundtrip() {
        for t in [
            ArtifactType::SearchResult,
            ArtifactType::DownloadedFile,
            ArtifactType::AnalysisResult,
            ArtifactType::CsvData,
        ] {
            assert_eq!(ArtifactType::parse(t.as_str()), Some(t));
        }
        assert_eq!(ArtifactType::parse("unknown"), None);
    }

    #[test]
    fn test_message_serialization_skips_empty_tool_fields() {
        let msg = Message::user("hello");
        let json = serde_json::to_value(&msg).unwrap();
        assert!(json.get("tool_calls").is_none());
        assert!(json.get("tool_call_id").is_none());
        assert_eq!(json["role"], "user");
    }
}
