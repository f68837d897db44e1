//! Agent runner protocol
//!
//! The boundary between the orchestration engine and the external
//! coding-agent process bound to each session. A runner exposes three
//! independent streams (response chunks, permission requests, question
//! requests) in listener style: each `next_*` call is one listen request,
//! which is what the routing layer's re-arm discipline is built on.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{SessionRecord, TranscriptMessage};
use crate::error::Result;

/// One chunk of an agent response stream
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseChunk {
    /// Plain response text
    Text { content: String },
    /// The agent started invoking a tool
    ToolUseStart { name: String },
    /// A previously started tool invocation finished
    ToolUseResult { name: String },
    /// The response is complete
    Done,
    /// The response ended with an error
    Error { message: String },
}

impl ResponseChunk {
    /// True for chunks that end the current agent response. Terminal chunks
    /// end the message, not the session: the next user message starts a
    /// fresh response stream listen.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ResponseChunk::Done | ResponseChunk::Error { .. })
    }

    pub fn text(content: impl Into<String>) -> Self {
        Self::Text {
            content: content.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

/// A tool-use authorization the agent is blocked on
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
    pub description: Option<String>,
}

/// One option of a multiple-choice question
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionOption {
    pub label: String,
    pub description: Option<String>,
}

/// A clarification question the agent is blocked on
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionRequest {
    pub id: String,
    pub question: String,
    pub options: Vec<QuestionOption>,
    pub multi_select: bool,
}

/// The live connection to a session's external agent process.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// Send user content to the agent. Results arrive on the response
    /// stream; the caller arms a listen for them.
    async fn send(&self, content: String) -> Result<()>;

    /// Wait for the next response chunk. `None` means the stream closed.
    async fn next_response(&self) -> Option<ResponseChunk>;

    /// Wait for the next permission request. `None` means the stream closed.
    async fn next_permission(&self) -> Option<PermissionRequest>;

    /// Wait for the next question request. `None` means the stream closed.
    async fn next_question(&self) -> Option<QuestionRequest>;

    /// Answer a permission request by id.
    async fn respond_permission(&self, id: &str, allowed: bool, always_allow: bool) -> Result<()>;

    /// Answer a question request by id.
    async fn respond_question(&self, id: &str, answers: HashMap<String, String>) -> Result<()>;

    /// Replace the set of tools the agent may use without asking.
    fn set_allowed_tools(&self, tools: Vec<String>);

    /// Whether a response is currently streaming.
    fn is_streaming(&self) -> bool;

    /// Interrupt the in-flight request, leaving the runner usable.
    fn cancel_current(&self);

    /// Stop the runner, terminating its process if one is running.
    async fn stop(&self);
}

/// Shared handle to a session's runner.
///
/// The lifecycle manager's cache is the canonical owner; the control loop
/// holds a convenience reference to the active session's handle only.
pub type RunnerHandle = Arc<dyn AgentRunner>;

/// Creates runner handles for sessions that don't have one yet.
#[async_trait]
pub trait RunnerFactory: Send + Sync {
    /// Spawn a runner for `record`, primed with the persisted transcript
    /// and tagged with whether the session has previously been started.
    async fn spawn(
        &self,
        record: &SessionRecord,
        transcript: Vec<TranscriptMessage>,
        previously_started: bool,
    ) -> Result<RunnerHandle>;
}
