//! Process-backed agent runner
//!
//! Spawns the configured coding-agent command per session with the session
//! worktree as its working directory and speaks a JSON-lines protocol over
//! stdio: one JSON object per line in each direction. Inbound events are
//! demultiplexed into the three streams the engine listens on.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, warn};

use crew_core::{
    AgentRunner, Error, PermissionRequest, QuestionOption, QuestionRequest, ResponseChunk, Result,
    RunnerFactory, RunnerHandle, SessionRecord, TranscriptMessage,
};

/// One event on the agent's stdout
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireEvent {
    Text {
        content: String,
    },
    ToolUseStart {
        name: String,
    },
    ToolUseResult {
        name: String,
    },
    Done,
    Error {
        message: String,
    },
    Permission {
        id: String,
        tool_name: String,
        #[serde(default)]
        arguments: serde_json::Value,
        #[serde(default)]
        description: Option<String>,
    },
    Question {
        id: String,
        question: String,
        #[serde(default)]
        options: Vec<WireOption>,
        #[serde(default)]
        multi_select: bool,
    },
}

#[derive(Debug, Deserialize)]
struct WireOption {
    label: String,
    #[serde(default)]
    description: Option<String>,
}

/// One command on the agent's stdin
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireCommand<'a> {
    /// Replay of the persisted conversation, sent once after spawn
    History {
        messages: &'a [TranscriptMessage],
        started: bool,
    },
    UserMessage {
        content: &'a str,
    },
    PermissionResponse {
        id: &'a str,
        allowed: bool,
        always_allow: bool,
    },
    QuestionResponse {
        id: &'a str,
        answers: &'a HashMap<String, String>,
    },
    AllowedTools {
        tools: &'a [String],
    },
    Cancel,
}

pub struct ProcessRunner {
    child: Mutex<Option<Child>>,
    stdin: Arc<Mutex<ChildStdin>>,
    responses: Mutex<mpsc::Receiver<ResponseChunk>>,
    permissions: Mutex<mpsc::Receiver<PermissionRequest>>,
    questions: Mutex<mpsc::Receiver<QuestionRequest>>,
    streaming: Arc<AtomicBool>,
}

impl ProcessRunner {
    /// Spawn `command` in `worktree` and start demultiplexing its output.
    pub async fn spawn(command: &str, args: &[String], worktree: &Path) -> Result<Self> {
        let mut child = Command::new(command)
            .args(args)
            .current_dir(worktree)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Runner(format!("failed to start {}: {}", command, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Runner("failed to capture agent stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Runner("failed to capture agent stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Runner("failed to capture agent stderr".to_string()))?;

        let (response_tx, response_rx) = mpsc::channel(256);
        let (permission_tx, permission_rx) = mpsc::channel(64);
        let (question_tx, question_rx) = mpsc::channel(64);
        let streaming = Arc::new(AtomicBool::new(false));

        // Demultiplexer: one task owns stdout and routes each line into
        // the stream it belongs to
        let streaming_reader = streaming.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        error!("agent stdout read failed: {}", e);
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                let event: WireEvent = match serde_json::from_str(&line) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!("unparseable agent event: {} ({})", line, e);
                        continue;
                    }
                };
                match event {
                    WireEvent::Text { content } => {
                        let _ = response_tx.send(ResponseChunk::Text { content }).await;
                    }
                    WireEvent::ToolUseStart { name } => {
                        let _ = response_tx.send(ResponseChunk::ToolUseStart { name }).await;
                    }
                    WireEvent::ToolUseResult { name } => {
                        let _ = response_tx.send(ResponseChunk::ToolUseResult { name }).await;
                    }
                    WireEvent::Done => {
                        streaming_reader.store(false, Ordering::SeqCst);
                        let _ = response_tx.send(ResponseChunk::Done).await;
                    }
                    WireEvent::Error { message } => {
                        streaming_reader.store(false, Ordering::SeqCst);
                        let _ = response_tx.send(ResponseChunk::Error { message }).await;
                    }
                    WireEvent::Permission {
                        id,
                        tool_name,
                        arguments,
                        description,
                    } => {
                        let _ = permission_tx
                            .send(PermissionRequest {
                                id,
                                tool_name,
                                arguments,
                                description,
                            })
                            .await;
                    }
                    WireEvent::Question {
                        id,
                        question,
                        options,
                        multi_select,
                    } => {
                        let options = options
                            .into_iter()
                            .map(|o| QuestionOption {
                                label: o.label,
                                description: o.description,
                            })
                            .collect();
                        let _ = question_tx
                            .send(QuestionRequest {
                                id,
                                question,
                                options,
                                multi_select,
                            })
                            .await;
                    }
                }
            }
            debug!("agent stdout closed");
        });

        // Agent diagnostics go to the log, never to the terminal the TUI
        // owns
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "agent", "{}", line);
            }
        });

        Ok(Self {
            child: Mutex::new(Some(child)),
            stdin: Arc::new(Mutex::new(stdin)),
            responses: Mutex::new(response_rx),
            permissions: Mutex::new(permission_rx),
            questions: Mutex::new(question_rx),
            streaming,
        })
    }

    /// Replay the persisted conversation so the agent resumes with
    /// context.
    pub async fn prime(&self, transcript: &[TranscriptMessage], started: bool) -> Result<()> {
        self.write_command(&WireCommand::History {
            messages: transcript,
            started,
        })
        .await
    }

    async fn write_command(&self, command: &WireCommand<'_>) -> Result<()> {
        let json = serde_json::to_string(command)?;
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(json.as_bytes())
            .await
            .map_err(|e| Error::Runner(format!("agent stdin write failed: {}", e)))?;
        stdin
            .write_all(b"\n")
            .await
            .map_err(|e| Error::Runner(format!("agent stdin write failed: {}", e)))?;
        stdin
            .flush()
            .await
            .map_err(|e| Error::Runner(format!("agent stdin flush failed: {}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl AgentRunner for ProcessRunner {
    async fn send(&self, content: String) -> Result<()> {
        self.streaming.store(true, Ordering::SeqCst);
        let result = self
            .write_command(&WireCommand::UserMessage { content: &content })
            .await;
        if result.is_err() {
            self.streaming.store(false, Ordering::SeqCst);
        }
        result
    }

    async fn next_response(&self) -> Option<ResponseChunk> {
        self.responses.lock().await.recv().await
    }

    async fn next_permission(&self) -> Option<PermissionRequest> {
        self.permissions.lock().await.recv().await
    }

    async fn next_question(&self) -> Option<QuestionRequest> {
        self.questions.lock().await.recv().await
    }

    async fn respond_permission(&self, id: &str, allowed: bool, always_allow: bool) -> Result<()> {
        self.write_command(&WireCommand::PermissionResponse {
            id,
            allowed,
            always_allow,
        })
        .await
    }

    async fn respond_question(&self, id: &str, answers: HashMap<String, String>) -> Result<()> {
        self.write_command(&WireCommand::QuestionResponse {
            id,
            answers: &answers,
        })
        .await
    }

    fn set_allowed_tools(&self, tools: Vec<String>) {
        let stdin = self.stdin.clone();
        tokio::spawn(async move {
            let json = match serde_json::to_string(&WireCommand::AllowedTools { tools: &tools }) {
                Ok(json) => json,
                Err(e) => {
                    warn!("failed to serialize allowed tools: {}", e);
                    return;
                }
            };
            let mut stdin = stdin.lock().await;
            if stdin.write_all(json.as_bytes()).await.is_ok() {
                let _ = stdin.write_all(b"\n").await;
                let _ = stdin.flush().await;
            }
        });
    }

    fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::SeqCst)
    }

    fn cancel_current(&self) {
        let stdin = self.stdin.clone();
        let streaming = self.streaming.clone();
        tokio::spawn(async move {
            let json = match serde_json::to_string(&WireCommand::Cancel) {
                Ok(json) => json,
                Err(_) => return,
            };
            let mut stdin = stdin.lock().await;
            if stdin.write_all(json.as_bytes()).await.is_ok() {
                let _ = stdin.write_all(b"\n").await;
                let _ = stdin.flush().await;
            }
            streaming.store(false, Ordering::SeqCst);
        });
    }

    async fn stop(&self) {
        self.streaming.store(false, Ordering::SeqCst);
        let mut slot = self.child.lock().await;
        if let Some(mut child) = slot.take() {
            if let Err(e) = child.kill().await {
                warn!("failed to kill agent process: {}", e);
            }
        }
    }
}

/// Spawns the configured agent command for each session.
pub struct ProcessRunnerFactory {
    command: String,
    args: Vec<String>,
}

impl ProcessRunnerFactory {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }
}

#[async_trait]
impl RunnerFactory for ProcessRunnerFactory {
    async fn spawn(
        &self,
        record: &SessionRecord,
        transcript: Vec<TranscriptMessage>,
        previously_started: bool,
    ) -> Result<RunnerHandle> {
        let runner =
            ProcessRunner::spawn(&self.command, &self.args, &record.worktree_path).await?;
        runner.prime(&transcript, previously_started).await?;
        Ok(Arc::new(runner))
    }
}
