//! The agent control loop: model turn, tool turns, repeat.
//!
//! Each iteration asks the chat provider for one assistant message. A
//! message without tool calls is the final answer. A message with tool
//! calls executes every requested tool in invocation order and appends
//! one tool message per call, then loops. Tool failures (including
//! timeouts) are reported back into the conversation as error text so the
//! model can revise its approach; they never abort the run.
//!
//! The loop is bounded by `agent.max_steps`. When the budget is exhausted
//! the last assistant content is returned as a partial result and the
//! outcome is marked `exhausted`.
//!
//! Streaming runs forward typed [`AgentEvent`] frames over an mpsc
//! channel. Cancellation arrives on a watch channel and is checked
//! between steps and between tool executions; a dropped event receiver
//! counts as cancellation too.

use anyhow::Result;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};

use crate::artifacts;
use crate::chat::ChatProvider;
use crate::config::Config;
use crate::embedding::EmbeddingProvider;
use crate::models::{AgentEvent, Message, ToolResult};
use crate::tools::{validate_params, ToolContext, ToolRegistry};

/// Display cap for tool inputs/outputs carried in stream events.
const EVENT_PAYLOAD_CHARS: usize = 500;

const SYSTEM_PROMPT: &str = "You are a data analyst agent answering questions over a SQLite database. \
Work in steps using the available tools. Policy: first check search_artifacts for prior results, \
then query the database (find_schema, run_sql), and only reach for web_search or fetch_url when \
internal sources cannot answer. Use calculate for any arithmetic instead of computing yourself. \
When you have the answer, reply with it directly and cite the queries or sources you used. \
Answer in the language of the question.";

/// Final result of one agent run.
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub content: String,
    /// Model turns consumed.
    pub steps: usize,
    /// True when the step budget ran out before a final answer.
    pub exhausted: bool,
}

/// Everything one run needs; cheap to clone per request.
#[derive(Clone)]
pub struct AgentRuntime {
    pub pool: sqlx::SqlitePool,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub chat: Arc<dyn ChatProvider>,
    pub tools: Arc<ToolRegistry>,
    pub config: Arc<Config>,
    pub http: reqwest::Client,
}

/// Sink for run progress. The blocking entry point uses [`EventSink::Silent`].
enum EventSink {
    Silent,
    Channel(mpsc::Sender<AgentEvent>),
}

impl EventSink {
    /// Send an event. Returns false when the consumer is gone.
    async fn emit(&self, event: AgentEvent) -> bool {
        match self {
            EventSink::Silent => true,
            EventSink::Channel(tx) => tx.send(event).await.is_ok(),
        }
    }
}

impl AgentRuntime {
    pub fn new(
        pool: sqlx::SqlitePool,
        embedder: Arc<dyn EmbeddingProvider>,
        chat: Arc<dyn ChatProvider>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            pool,
            embedder,
            chat,
            tools: Arc::new(ToolRegistry::with_builtins()),
            config,
            http: reqwest::Client::new(),
        }
    }

    fn tool_context(&self, session_id: &str) -> ToolContext {
        ToolContext {
            pool: self.pool.clone(),
            embedder: self.embedder.clone(),
            chat: self.chat.clone(),
            config: self.config.clone(),
            session_id: session_id.to_string(),
            http: self.http.clone(),
        }
    }

    /// Run to completion without streaming.
    pub async fn run(&self, question: &str, session_id: &str) -> Result<AgentOutcome> {
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        self.run_inner(question, session_id, EventSink::Silent, cancel_rx)
            .await
    }

    /// Run with streamed progress events.
    ///
    /// Emits `session` first, then interleaved `token`/`tool_start`/
    /// `tool_end` frames, and always terminates the stream with either
    /// `error` or `done`. Flipping `cancel` to true (or dropping the
    /// receiving end of `events`) stops the run at the next checkpoint.
    pub async fn run_streaming(
        &self,
        question: &str,
        session_id: &str,
        events: mpsc::Sender<AgentEvent>,
        cancel: watch::Receiver<bool>,
    ) -> Result<AgentOutcome> {
        let sink = EventSink::Channel(events.clone());

        sink.emit(AgentEvent::Session {
            session_id: session_id.to_string(),
        })
        .await;

        let outcome = self.run_inner(question, session_id, sink, cancel).await;

        match &outcome {
            Ok(_) => {
                let _ = events.send(AgentEvent::Done).await;
            }
            Err(e) => {
                let _ = events
                    .send(AgentEvent::Error {
                        content: e.to_string(),
                    })
                    .await;
                let _ = events.send(AgentEvent::Done).await;
            }
        }

        outcome
    }

    async fn run_inner(
        &self,
        question: &str,
        session_id: &str,
        sink: EventSink,
        cancel: watch::Receiver<bool>,
    ) -> Result<AgentOutcome> {
        artifacts::ensure_session(&self.pool, session_id).await?;

        let schemas = self.tools.schemas();
        let mut messages = vec![Message::system(SYSTEM_PROMPT), Message::user(question)];
        let mut last_content = String::new();

        for step in 1..=self.config.agent.max_steps {
            if *cancel.borrow() {
                anyhow::bail!("run cancelled");
            }

            let assistant = match &sink {
                EventSink::Silent => self.chat.complete(&messages, &schemas).await?,
                EventSink::Channel(events) => {
                    let (token_tx, mut token_rx) = mpsc::channel::<String>(64);
                    let forward_events = events.clone();
                    let forwarder = tokio::spawn(async move {
                        while let Some(content) = token_rx.recv().await {
                            if forward_events
                                .send(AgentEvent::Token { content })
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                    });
                    let result = self
                        .chat
                        .complete_streamed(&messages, &schemas, token_tx)
                        .await;
                    let _ = forwarder.await;
                    result?
                }
            };

            if !assistant.content.is_empty() {
                last_content = assistant.content.clone();
            }

            if assistant.tool_calls.is_empty() {
                return Ok(AgentOutcome {
                    content: assistant.content,
                    steps: step,
                    exhausted: false,
                });
            }

            let calls = assistant.tool_calls.clone();
            messages.push(assistant);

            let ctx = self.tool_context(session_id);
            for call in &calls {
                if *cancel.borrow() {
                    anyhow::bail!("run cancelled");
                }

                if !sink
                    .emit(AgentEvent::ToolStart {
                        tool: call.name.clone(),
                        input: clipped(&call.arguments.to_string()),
                    })
                    .await
                {
                    anyhow::bail!("run cancelled");
                }

                let result = self.execute_call(&call.name, &call.arguments, &ctx, &call.id).await;

                if !sink
                    .emit(AgentEvent::ToolEnd {
                        output: clipped(&result.content),
                        latency_ms: result.latency_ms,
                    })
                    .await
                {
                    anyhow::bail!("run cancelled");
                }

                messages.push(Message::tool(result.content, result.invocation_id));
            }
        }

        // Step budget exhausted: surface whatever the model last said.
        let content = if last_content.is_empty() {
            "I could not complete the answer within the step limit.".to_string()
        } else {
            format!("{}\n\n(step limit reached; this answer may be partial)", last_content)
        };

        Ok(AgentOutcome {
            content,
            steps: self.config.agent.max_steps,
            exhausted: true,
        })
    }

    /// Execute one tool call with validation and timeout. Never returns
    /// `Err`: every failure mode becomes a `success = false` result.
    async fn execute_call(
        &self,
        name: &str,
        arguments: &Value,
        ctx: &ToolContext,
        invocation_id: &str,
    ) -> ToolResult {
        let started = Instant::now();
        let failure = |content: String| ToolResult {
            invocation_id: invocation_id.to_string(),
            content,
            success: false,
            latency_ms: started.elapsed().as_millis() as u64,
        };

        let Some(tool) = self.tools.find(name) else {
            return failure(format!("error: unknown tool '{name}'"));
        };

        let params = match validate_params(&tool.parameters_schema(), arguments) {
            Ok(params) => params,
            Err(e) => return failure(format!("error: {e}")),
        };

        let timeout = Duration::from_secs(self.config.agent.tool_timeout_secs);
        let executed = tokio::time::timeout(timeout, tool.execute(params, ctx)).await;

        match executed {
            Ok(Ok(content)) => ToolResult {
                invocation_id: invocation_id.to_string(),
                content,
                success: true,
                latency_ms: started.elapsed().as_millis() as u64,
            },
            Ok(Err(e)) => failure(format!("error: {e}")),
            Err(_) => failure(format!(
                "error: tool '{name}' timed out after {}s",
                self.config.agent.tool_timeout_secs
            )),
        }
    }
}

fn clipped(text: &str) -> String {
    let cut = artifacts::truncate_chars(text, EVENT_PAYLOAD_CHARS);
    if cut.len() < text.len() {
        format!("{cut}…")
    } else {
        cut.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clipped_short_text_unchanged() {
        assert_eq!(clipped("hello"), "hello");
    }

    #[test]
    fn test_clipped_long_text_marked() {
        let long = "x".repeat(EVENT_PAYLOAD_CHARS + 10);
        let out = clipped(&long);
        assert!(out.ends_with('…'));
        assert_eq!(out.chars().count(), EVENT_PAYLOAD_CHARS + 1);
    }
}
