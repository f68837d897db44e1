//! Orchestration integration tests
//!
//! Exercises the engine end to end with scripted collaborators:
//! - listen → react → re-arm completeness over a full response
//! - focus-switch round trips
//! - merge workflow entry, guards, conflicts, and resolution
//! - queued messages, cancellation, deletion, bulk operations

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::time::timeout;

use crew_core::{
    AgentRunner, AppPhase, Cancellation, ConfigStore, Controller, FileConfigStore, GitBackend,
    LineStream, ListenerPool, MergeContext, MergeEntry, MergeFailure, MergeKind, MergeLine,
    MergeOutcome, MergeStream, MergeWorkflow, Notice, PermissionRequest, ProcessSupervisor,
    QuestionOption, QuestionRequest, ResponseChunk, Result, Role, RoutedEvent, RunnerFactory,
    RunnerHandle, SessionLifecycle, SessionRecord, SessionStatus, SessionStore, WorktreeStatus,
};

// --- scripted runner ---

struct ScriptedRunner {
    responses: AsyncMutex<mpsc::Receiver<ResponseChunk>>,
    permissions: AsyncMutex<mpsc::Receiver<PermissionRequest>>,
    questions: AsyncMutex<mpsc::Receiver<QuestionRequest>>,
    response_listens: AtomicUsize,
    permission_listens: AtomicUsize,
    sent: std::sync::Mutex<Vec<String>>,
    permission_responses: std::sync::Mutex<Vec<(String, bool, bool)>>,
    question_responses: std::sync::Mutex<Vec<String>>,
    allowed_tools: std::sync::Mutex<Vec<String>>,
    streaming: AtomicBool,
    cancelled: AtomicBool,
    stopped: AtomicBool,
}

struct Probe {
    runner: Arc<ScriptedRunner>,
    response_tx: mpsc::Sender<ResponseChunk>,
    permission_tx: mpsc::Sender<PermissionRequest>,
    question_tx: mpsc::Sender<QuestionRequest>,
}

fn scripted_runner() -> Probe {
    let (response_tx, response_rx) = mpsc::channel(64);
    let (permission_tx, permission_rx) = mpsc::channel(64);
    let (question_tx, question_rx) = mpsc::channel(64);
    let runner = Arc::new(ScriptedRunner {
        responses: AsyncMutex::new(response_rx),
        permissions: AsyncMutex::new(permission_rx),
        questions: AsyncMutex::new(question_rx),
        response_listens: AtomicUsize::new(0),
        permission_listens: AtomicUsize::new(0),
        sent: std::sync::Mutex::new(Vec::new()),
        permission_responses: std::sync::Mutex::new(Vec::new()),
        question_responses: std::sync::Mutex::new(Vec::new()),
        allowed_tools: std::sync::Mutex::new(Vec::new()),
        streaming: AtomicBool::new(false),
        cancelled: AtomicBool::new(false),
        stopped: AtomicBool::new(false),
    });
    Probe {
        runner,
        response_tx,
        permission_tx,
        question_tx,
    }
}

#[async_trait]
impl AgentRunner for ScriptedRunner {
    async fn send(&self, content: String) -> Result<()> {
        self.sent.lock().unwrap().push(content);
        self.streaming.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn next_response(&self) -> Option<ResponseChunk> {
        self.response_listens.fetch_add(1, Ordering::SeqCst);
        let chunk = self.responses.lock().await.recv().await;
        if let Some(chunk) = &chunk
            && chunk.is_terminal()
        {
            self.streaming.store(false, Ordering::SeqCst);
        }
        chunk
    }

    async fn next_permission(&self) -> Option<PermissionRequest> {
        self.permission_listens.fetch_add(1, Ordering::SeqCst);
        self.permissions.lock().await.recv().await
    }

    async fn next_question(&self) -> Option<QuestionRequest> {
        self.questions.lock().await.recv().await
    }

    async fn respond_permission(&self, id: &str, allowed: bool, always_allow: bool) -> Result<()> {
        self.permission_responses
            .lock()
            .unwrap()
            .push((id.to_string(), allowed, always_allow));
        Ok(())
    }

    async fn respond_question(&self, id: &str, _answers: HashMap<String, String>) -> Result<()> {
        self.question_responses.lock().unwrap().push(id.to_string());
        Ok(())
    }

    fn set_allowed_tools(&self, tools: Vec<String>) {
        *self.allowed_tools.lock().unwrap() = tools;
    }

    fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::SeqCst)
    }

    fn cancel_current(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.streaming.store(false, Ordering::SeqCst);
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.streaming.store(false, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct FakeFactory {
    probes: std::sync::Mutex<HashMap<String, Arc<Probe>>>,
}

impl FakeFactory {
    fn probe(&self, id: &str) -> Arc<Probe> {
        self.probes
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .expect("runner not created yet")
    }
}

#[async_trait]
impl RunnerFactory for FakeFactory {
    async fn spawn(
        &self,
        record: &SessionRecord,
        _transcript: Vec<crew_core::TranscriptMessage>,
        _previously_started: bool,
    ) -> Result<RunnerHandle> {
        let probe = Arc::new(scripted_runner());
        let runner = probe.runner.clone();
        self.probes
            .lock()
            .unwrap()
            .insert(record.id.clone(), probe);
        Ok(runner)
    }
}

// --- scripted git backend ---

#[derive(Default)]
struct FakeGit {
    has_changes: AtomicBool,
    calls: std::sync::Mutex<Vec<String>>,
    /// Lines each run emits, cloned per run
    script: std::sync::Mutex<Vec<MergeLine>>,
}

impl FakeGit {
    fn set_changes(&self, value: bool) {
        self.has_changes.store(value, Ordering::SeqCst);
    }

    fn set_script(&self, lines: Vec<MergeLine>) {
        *self.script.lock().unwrap() = lines;
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    async fn stream(&self) -> (MergeStream, Cancellation) {
        let lines = self.script.lock().unwrap().clone();
        let (tx, rx) = mpsc::channel(lines.len().max(1));
        for line in lines {
            tx.send(line).await.expect("scripted line fits");
        }
        (Arc::new(LineStream::new(rx)), Cancellation::noop())
    }
}

#[async_trait]
impl GitBackend for FakeGit {
    async fn worktree_status(&self, _path: &Path) -> Result<WorktreeStatus> {
        self.record("status");
        if self.has_changes.load(Ordering::SeqCst) {
            Ok(WorktreeStatus {
                has_changes: true,
                summary: " M src/lib.rs\n M src/main.rs\n".to_string(),
                files: vec!["src/lib.rs".to_string(), "src/main.rs".to_string()],
            })
        } else {
            Ok(WorktreeStatus::default())
        }
    }

    async fn merge_to_main(&self, _ctx: MergeContext) -> Result<(MergeStream, Cancellation)> {
        self.record("merge_to_main");
        Ok(self.stream().await)
    }

    async fn merge_to_parent(&self, _ctx: MergeContext) -> Result<(MergeStream, Cancellation)> {
        self.record("merge_to_parent");
        Ok(self.stream().await)
    }

    async fn create_pr(&self, _ctx: MergeContext) -> Result<(MergeStream, Cancellation)> {
        self.record("create_pr");
        Ok(self.stream().await)
    }

    async fn push_updates(&self, _ctx: MergeContext) -> Result<(MergeStream, Cancellation)> {
        self.record("push_updates");
        Ok(self.stream().await)
    }

    async fn abort_merge(&self, _path: &Path) -> Result<()> {
        self.record("abort_merge");
        Ok(())
    }

    async fn commit_conflict_resolution(&self, _path: &Path, message: &str) -> Result<()> {
        self.record(format!("resolve_commit: {}", message));
        Ok(())
    }
}

#[derive(Default)]
struct FakeSupervisor {
    kill_count: AtomicUsize,
}

#[async_trait]
impl ProcessSupervisor for FakeSupervisor {
    async fn kill_orphans(&self, _worktree_path: &Path) -> Result<usize> {
        Ok(self.kill_count.load(Ordering::SeqCst))
    }
}

// --- harness ---

struct Harness {
    _dir: tempfile::TempDir,
    config: Arc<FileConfigStore>,
    store: Arc<SessionStore>,
    events: mpsc::UnboundedReceiver<RoutedEvent>,
    controller: Controller,
    factory: Arc<FakeFactory>,
    git: Arc<FakeGit>,
    supervisor: Arc<FakeSupervisor>,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(FileConfigStore::with_root(dir.path().to_path_buf()).unwrap());
    let store = Arc::new(SessionStore::new());
    let (pool, events) = ListenerPool::new();
    let factory = Arc::new(FakeFactory::default());
    let git = Arc::new(FakeGit::default());
    let supervisor = Arc::new(FakeSupervisor::default());

    let lifecycle = Arc::new(SessionLifecycle::new(
        store.clone(),
        config.clone(),
        supervisor.clone(),
        factory.clone(),
        pool.clone(),
    ));
    let merge = Arc::new(MergeWorkflow::new(
        store.clone(),
        config.clone(),
        git.clone(),
        None,
        pool.clone(),
    ));
    let controller = Controller::new(store.clone(), lifecycle, merge, config.clone(), pool);

    Harness {
        _dir: dir,
        config,
        store,
        events,
        controller,
        factory,
        git,
        supervisor,
    }
}

impl Harness {
    fn add_session(&self, name: &str) -> SessionRecord {
        let record = SessionRecord::new(name, format!("/tmp/worktrees/{}", name), name);
        self.config.create_session(record.clone()).unwrap();
        record
    }

    /// Pump routed events through the controller until `pred` matches a
    /// notice; panics after one second of silence.
    async fn pump_until(&mut self, pred: impl Fn(&Notice) -> bool) -> Vec<Notice> {
        let mut collected = Vec::new();
        loop {
            let event = timeout(Duration::from_secs(1), self.events.recv())
                .await
                .expect("timed out waiting for routed event")
                .expect("event channel closed");
            let notices = self.controller.dispatch(event).await;
            let matched = notices.iter().any(&pred);
            collected.extend(notices);
            if matched {
                return collected;
            }
        }
    }
}

// --- tests ---

#[tokio::test]
async fn test_rearm_completeness_over_full_response() {
    let mut h = harness();
    let record = h.add_session("alpha");

    assert!(h.controller.send_message(&record, "go".to_string()).await.unwrap());
    let probe = h.factory.probe(&record.id);

    let chunks = 3usize;
    for i in 0..chunks {
        probe
            .response_tx
            .send(ResponseChunk::text(format!("part{} ", i)))
            .await
            .unwrap();
    }
    probe.response_tx.send(ResponseChunk::Done).await.unwrap();

    h.pump_until(|n| matches!(n, Notice::ResponseFinished(_))).await;

    // N chunks + terminal = N+1 deliveries via N+1 listens (the terminal
    // chunk does not re-arm)
    assert_eq!(
        probe.runner.response_listens.load(Ordering::SeqCst),
        chunks + 1
    );
    assert!(!h.store.is_waiting(&record.id));

    // The flushed transcript holds the user message and the full response
    let transcript = h.config.load_transcript(&record.id).unwrap();
    assert_eq!(transcript.len(), 2);
    assert_eq!(transcript[0].role, Role::User);
    assert_eq!(transcript[1].role, Role::Assistant);
    assert_eq!(transcript[1].content, "part0 part1 part2 ");

    // First successful exchange marked the session started
    assert!(h.config.get_session(&record.id).unwrap().unwrap().started);
}

#[tokio::test]
async fn test_tool_markers_rewritten_in_place() {
    let mut h = harness();
    let record = h.add_session("alpha");
    h.controller.send_message(&record, "go".to_string()).await.unwrap();
    let probe = h.factory.probe(&record.id);

    probe.response_tx.send(ResponseChunk::text("looking\n")).await.unwrap();
    probe
        .response_tx
        .send(ResponseChunk::ToolUseStart { name: "Bash".to_string() })
        .await
        .unwrap();
    h.pump_until(|n| matches!(n, Notice::StreamingUpdated(_))).await;
    h.pump_until(|n| matches!(n, Notice::StreamingUpdated(_))).await;
    let partial = h.store.snapshot(&record.id).unwrap().streaming_content;
    assert!(partial.contains(&crew_core::tool_running_line("Bash")));

    probe
        .response_tx
        .send(ResponseChunk::ToolUseResult { name: "Bash".to_string() })
        .await
        .unwrap();
    h.pump_until(|n| matches!(n, Notice::StreamingUpdated(_))).await;
    let rewritten = h.store.snapshot(&record.id).unwrap().streaming_content;
    assert!(rewritten.contains(&crew_core::tool_done_line("Bash")));
    assert!(!rewritten.contains(&crew_core::tool_running_line("Bash")));
    // The preceding text did not reflow
    assert!(rewritten.starts_with("looking\n"));
}

#[tokio::test]
async fn test_switch_round_trip_preserves_session_state() {
    let mut h = harness();
    let a = h.add_session("alpha");
    let b = h.add_session("beta");

    h.controller.select(&a, None).await.unwrap();
    h.store.append_streaming(&a.id, "partial answer");
    h.store.set_pending_permission(
        &a.id,
        PermissionRequest {
            id: "perm-1".to_string(),
            tool_name: "Bash".to_string(),
            arguments: serde_json::json!({"command": "ls"}),
            description: None,
        },
    );

    // Switch away, carrying the draft input the user was typing
    h.controller
        .select(
            &b,
            Some(crew_core::PreviousFocus {
                id: a.id.clone(),
                input_text: "half-typed reply".to_string(),
                streaming: None,
            }),
        )
        .await
        .unwrap();

    // Switch back: the exact partial transcript, input, and pending
    // permission must be reproduced
    let result = h
        .controller
        .select(
            &a,
            Some(crew_core::PreviousFocus {
                id: b.id.clone(),
                input_text: String::new(),
                streaming: None,
            }),
        )
        .await
        .unwrap();
    assert_eq!(result.snapshot.streaming_content, "partial answer");
    assert_eq!(result.snapshot.input_text, "half-typed reply");
    assert_eq!(
        result.snapshot.pending_permission.as_ref().map(|p| p.id.as_str()),
        Some("perm-1")
    );
    assert_eq!(result.header, "alpha [alpha]");
}

#[tokio::test]
async fn test_merge_with_changes_waits_for_commit_confirmation() {
    let mut h = harness();
    let record = h.add_session("alpha");
    h.git.set_changes(true);
    h.git.set_script(vec![MergeLine::Done { detail: None }]);

    let entry = h.controller.begin_merge(&record, MergeKind::Merge).await.unwrap();
    let draft = match entry {
        MergeEntry::CommitMessagePending { draft, status } => {
            assert!(status.has_changes);
            draft
        }
        other => panic!("expected CommitMessagePending, got {:?}", other),
    };
    // Deterministic fallback (no generator configured)
    assert_eq!(draft, "Update 2 files on alpha");
    // No merge/PR/push was issued before confirmation
    assert_eq!(h.git.calls(), vec!["status"]);
    assert!(!h.store.is_merging(&record.id));

    h.controller
        .confirm_commit(&record, MergeKind::Merge, "Add auth flow".to_string())
        .await
        .unwrap();
    assert!(h.store.is_merging(&record.id));
    assert!(h.git.calls().contains(&"merge_to_main".to_string()));

    let notices = h
        .pump_until(|n| matches!(n, Notice::MergeFinished { .. }))
        .await;
    assert!(notices.iter().any(|n| matches!(
        n,
        Notice::MergeFinished {
            outcome: MergeOutcome::Succeeded { .. },
            ..
        }
    )));
    assert!(!h.store.is_merging(&record.id));
    assert_eq!(
        h.config.get_session(&record.id).unwrap().unwrap().status,
        SessionStatus::Merged
    );
}

#[tokio::test]
async fn test_merge_clean_tree_skips_to_running() {
    let mut h = harness();
    let record = h.add_session("alpha");
    h.git.set_script(vec![
        MergeLine::Output("merging".to_string()),
        MergeLine::Done { detail: None },
    ]);

    let entry = h.controller.begin_merge(&record, MergeKind::Merge).await.unwrap();
    assert!(matches!(entry, MergeEntry::Started));
    assert!(h.store.is_merging(&record.id));

    h.pump_until(|n| matches!(n, Notice::MergeFinished { .. })).await;
    assert!(!h.store.is_merging(&record.id));
}

#[tokio::test]
async fn test_second_merge_rejected_while_one_runs() {
    let mut h = harness();
    let record = h.add_session("alpha");
    // Non-terminal script keeps the run in flight
    h.git.set_script(vec![MergeLine::Output("working".to_string())]);

    let entry = h.controller.begin_merge(&record, MergeKind::Merge).await.unwrap();
    assert!(matches!(entry, MergeEntry::Started));

    let second = h.controller.begin_merge(&record, MergeKind::PullRequest).await;
    assert!(matches!(second, Err(crew_core::Error::MergeInProgress(_))));
    // State unchanged, no second background run started
    assert_eq!(h.store.merge_kind(&record.id), Some(MergeKind::Merge));
    assert_eq!(
        h.git
            .calls()
            .iter()
            .filter(|c| c.as_str() == "merge_to_main")
            .count(),
        1
    );
    assert!(!h.git.calls().contains(&"create_pr".to_string()));
}

#[tokio::test]
async fn test_merge_to_parent_requires_living_parent() {
    let mut h = harness();
    let mut record = h.add_session("child");
    record.parent = Some("gone".to_string());

    let result = h.controller.begin_merge(&record, MergeKind::MergeToParent).await;
    assert!(matches!(result, Err(crew_core::Error::ParentMissing(_))));
    // Rejected before any git call
    assert!(h.git.calls().is_empty());
}

#[tokio::test]
async fn test_conflict_delegation_and_resolution_commit() {
    let mut h = harness();
    let record = h.add_session("alpha");
    h.git.set_script(vec![MergeLine::Error(MergeFailure {
        message: "merge failed".to_string(),
        conflicts: vec!["src/auth.rs".to_string()],
    })]);

    h.controller.begin_merge(&record, MergeKind::Merge).await.unwrap();
    let notices = h
        .pump_until(|n| matches!(n, Notice::MergeFinished { .. }))
        .await;
    let files = notices
        .iter()
        .find_map(|n| match n {
            Notice::MergeFinished {
                outcome: MergeOutcome::Conflicted { files },
                ..
            } => Some(files.clone()),
            _ => None,
        })
        .expect("conflicted outcome");
    assert_eq!(files, vec!["src/auth.rs"]);
    assert!(h.store.pending_conflict(&record.id).is_some());
    assert!(!h.store.is_merging(&record.id));

    // Delegate to the agent: the directive prompt names the files
    h.controller.delegate_conflicts(&record, &files).await.unwrap();
    let probe = h.factory.probe(&record.id);
    let sent = probe.runner.sent.lock().unwrap().clone();
    assert!(sent[0].contains("src/auth.rs"));
    assert!(h.store.is_waiting(&record.id));

    // The next successful turn is recognized as conflict resolution
    probe.response_tx.send(ResponseChunk::text("resolved\n")).await.unwrap();
    probe.response_tx.send(ResponseChunk::Done).await.unwrap();
    h.pump_until(|n| {
        matches!(
            n,
            Notice::MergeFinished {
                outcome: MergeOutcome::Succeeded { .. },
                ..
            }
        )
    })
    .await;
    assert!(h.store.pending_conflict(&record.id).is_none());
    assert!(
        h.git
            .calls()
            .iter()
            .any(|c| c.starts_with("resolve_commit:"))
    );
}

#[tokio::test]
async fn test_pending_message_queued_while_waiting() {
    let mut h = harness();
    let record = h.add_session("alpha");

    assert!(h.controller.send_message(&record, "first".to_string()).await.unwrap());
    // Second message queues instead of sending
    assert!(!h.controller.send_message(&record, "second".to_string()).await.unwrap());

    let probe = h.factory.probe(&record.id);
    assert_eq!(probe.runner.sent.lock().unwrap().len(), 1);

    // Peeking does not consume
    assert_eq!(h.store.peek_pending_message(&record.id).as_deref(), Some("second"));
    assert_eq!(h.store.peek_pending_message(&record.id).as_deref(), Some("second"));

    // Once the response finishes, the queued message goes out
    probe.response_tx.send(ResponseChunk::Done).await.unwrap();
    h.pump_until(|n| matches!(n, Notice::ResponseFinished(_))).await;
    assert_eq!(
        probe.runner.sent.lock().unwrap().clone(),
        vec!["first".to_string(), "second".to_string()]
    );
    assert!(h.store.peek_pending_message(&record.id).is_none());
}

#[tokio::test]
async fn test_session_in_use_error_classified_and_repaired() {
    let mut h = harness();
    let record = h.add_session("alpha");
    h.controller.send_message(&record, "go".to_string()).await.unwrap();
    let probe = h.factory.probe(&record.id);

    probe
        .response_tx
        .send(ResponseChunk::error("worktree is locked by pid 999"))
        .await
        .unwrap();
    let notices = h.pump_until(|n| matches!(n, Notice::SessionInUse(_))).await;
    assert!(notices.iter().any(|n| matches!(n, Notice::SessionInUse(_))));
    assert!(h.store.session_in_use_error(&record.id));
    assert!(!h.store.is_waiting(&record.id));

    // Force-resume with zero orphans is success and clears the flag
    let killed = h.controller.force_resume(&record).await.unwrap();
    assert_eq!(killed, 0);
    assert!(!h.store.session_in_use_error(&record.id));

    h.supervisor.kill_count.store(2, Ordering::SeqCst);
    assert_eq!(h.controller.force_resume(&record).await.unwrap(), 2);
}

#[tokio::test]
async fn test_generic_error_appended_verbatim() {
    let mut h = harness();
    let record = h.add_session("alpha");
    h.controller.send_message(&record, "go".to_string()).await.unwrap();
    let probe = h.factory.probe(&record.id);

    probe
        .response_tx
        .send(ResponseChunk::error("model overloaded"))
        .await
        .unwrap();
    h.pump_until(|n| matches!(n, Notice::AgentError { .. })).await;
    assert!(!h.store.is_waiting(&record.id));
    assert!(
        h.store
            .snapshot(&record.id)
            .unwrap()
            .streaming_content
            .contains("model overloaded")
    );
}

#[tokio::test]
async fn test_permission_flow_with_always_allow() {
    let mut h = harness();
    let record = h.add_session("alpha");
    h.controller.send_message(&record, "go".to_string()).await.unwrap();
    let probe = h.factory.probe(&record.id);

    probe
        .permission_tx
        .send(PermissionRequest {
            id: "perm-1".to_string(),
            tool_name: "Bash".to_string(),
            arguments: serde_json::json!({"command": "cargo test"}),
            description: Some("Run tests".to_string()),
        })
        .await
        .unwrap();
    h.pump_until(|n| matches!(n, Notice::PermissionRequested(_))).await;
    assert!(h.store.has_pending_permission(&record.id));

    h.controller
        .respond_permission(&record, "perm-1", true, true)
        .await
        .unwrap();
    assert!(!h.store.has_pending_permission(&record.id));
    assert_eq!(
        probe.runner.permission_responses.lock().unwrap().clone(),
        vec![("perm-1".to_string(), true, true)]
    );
    // Always-allow persisted the tool and pushed the new allow-list
    assert_eq!(h.config.allowed_tools(&record.id).unwrap(), vec!["Bash"]);
    assert_eq!(probe.runner.allowed_tools.lock().unwrap().clone(), vec!["Bash"]);

    // The permission stream re-armed: a second request still arrives
    probe
        .permission_tx
        .send(PermissionRequest {
            id: "perm-2".to_string(),
            tool_name: "Edit".to_string(),
            arguments: serde_json::Value::Null,
            description: None,
        })
        .await
        .unwrap();
    h.pump_until(|n| matches!(n, Notice::PermissionRequested(_))).await;
    assert_eq!(
        h.store
            .snapshot(&record.id)
            .unwrap()
            .pending_permission
            .unwrap()
            .id,
        "perm-2"
    );
}

#[tokio::test]
async fn test_question_flow() {
    let mut h = harness();
    let record = h.add_session("alpha");
    h.controller.send_message(&record, "go".to_string()).await.unwrap();
    let probe = h.factory.probe(&record.id);

    probe
        .question_tx
        .send(QuestionRequest {
            id: "q1".to_string(),
            question: "Which database?".to_string(),
            options: vec![QuestionOption {
                label: "Postgres".to_string(),
                description: Some("already used elsewhere in the repo".to_string()),
            }],
            multi_select: false,
        })
        .await
        .unwrap();
    h.pump_until(|n| matches!(n, Notice::QuestionRequested(_))).await;
    assert!(h.store.has_pending_question(&record.id));

    let mut answers = HashMap::new();
    answers.insert("Which database?".to_string(), "Postgres".to_string());
    h.controller
        .respond_question(&record, "q1", answers)
        .await
        .unwrap();
    assert!(!h.store.has_pending_question(&record.id));
    assert_eq!(
        probe.runner.question_responses.lock().unwrap().clone(),
        vec!["q1".to_string()]
    );
}

#[tokio::test]
async fn test_delete_cancels_and_stops() {
    let mut h = harness();
    let record = h.add_session("alpha");
    h.controller.send_message(&record, "go".to_string()).await.unwrap();
    let probe = h.factory.probe(&record.id);
    assert!(h.store.is_waiting(&record.id));

    let stopped = h.controller.delete_session(&record.id).await;
    assert!(stopped.is_some());
    assert!(probe.runner.stopped.load(Ordering::SeqCst));
    // Deleting state triggered the waiting cancellation, which interrupts
    // the runner
    assert!(probe.runner.cancelled.load(Ordering::SeqCst));
    assert!(h.store.get_if_exists(&record.id).is_none());
    assert!(h.config.get_session(&record.id).unwrap().is_none());
}

#[tokio::test]
async fn test_aggregate_phase_follows_outstanding_requests() {
    let mut h = harness();
    let a = h.add_session("alpha");
    let b = h.add_session("beta");
    assert_eq!(h.controller.phase(), AppPhase::Idle);

    h.controller.send_message(&a, "go".to_string()).await.unwrap();
    assert_eq!(h.controller.phase(), AppPhase::StreamingClaude);
    h.controller.send_message(&b, "go".to_string()).await.unwrap();

    h.factory.probe(&a.id).response_tx.send(ResponseChunk::Done).await.unwrap();
    h.pump_until(|n| matches!(n, Notice::ResponseFinished(_))).await;
    // One session still waits
    assert_eq!(h.controller.phase(), AppPhase::StreamingClaude);

    h.factory.probe(&b.id).response_tx.send(ResponseChunk::Done).await.unwrap();
    h.pump_until(|n| matches!(n, Notice::ResponseFinished(_))).await;
    assert_eq!(h.controller.phase(), AppPhase::Idle);
}

#[tokio::test]
async fn test_cancel_agent_interrupts_and_clears() {
    let mut h = harness();
    let record = h.add_session("alpha");
    h.controller.send_message(&record, "go".to_string()).await.unwrap();
    let probe = h.factory.probe(&record.id);

    assert!(h.controller.cancel_agent(&record.id));
    assert!(probe.runner.cancelled.load(Ordering::SeqCst));
    assert!(!h.store.is_waiting(&record.id));
    assert_eq!(h.controller.phase(), AppPhase::Idle);
    // Nothing left to cancel
    assert!(!h.controller.cancel_agent(&record.id));
}

#[tokio::test]
async fn test_bulk_delete_removes_everything() {
    let mut h = harness();
    let records: Vec<SessionRecord> = (0..3).map(|i| h.add_session(&format!("s{}", i))).collect();
    for record in &records {
        h.controller.send_message(record, "go".to_string()).await.unwrap();
    }

    let ids: Vec<String> = records.iter().map(|r| r.id.clone()).collect();
    let deleted = h.controller.bulk_delete(ids).await;
    assert_eq!(deleted, 3);
    for record in &records {
        assert!(h.store.get_if_exists(&record.id).is_none());
        assert!(h.config.get_session(&record.id).unwrap().is_none());
        assert!(h.factory.probe(&record.id).runner.stopped.load(Ordering::SeqCst));
    }
}

#[tokio::test]
async fn test_bulk_pr_creation_skips_dirty_trees() {
    let mut h = harness();
    let a = h.add_session("clean");
    let b = h.add_session("also-clean");
    h.git.set_script(vec![MergeLine::Output("pushing".to_string())]);

    let results = h
        .controller
        .bulk_create_prs(vec![a.clone(), b.clone()])
        .await;
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|(_, r)| matches!(r, Ok(true))));
    assert!(h.store.is_merging(&a.id));
    assert!(h.store.is_merging(&b.id));
    assert_eq!(
        h.git
            .calls()
            .iter()
            .filter(|c| c.as_str() == "create_pr")
            .count(),
        2
    );

    // Dirty trees are skipped rather than committed on the user's behalf
    let c = h.add_session("dirty");
    h.git.set_changes(true);
    let results = h.controller.bulk_create_prs(vec![c.clone()]).await;
    assert!(matches!(results[0], (_, Ok(false))));
    assert!(!h.store.is_merging(&c.id));
}

#[tokio::test]
async fn test_initial_message_sent_on_first_focus() {
    let mut h = harness();
    let record = h.add_session("alpha");
    h.store.set_initial_message(&record.id, "start on the login bug");

    let result = h.controller.select(&record, None).await.unwrap();
    let probe = h.factory.probe(&record.id);
    assert_eq!(
        probe.runner.sent.lock().unwrap().clone(),
        vec!["start on the login bug".to_string()]
    );
    // The returned snapshot reflects the send that just happened
    assert!(result.snapshot.waiting_since.is_some());
    assert!(h.store.is_waiting(&record.id));
    // Read-and-clear: the message is consumed
    assert!(h.store.take_initial_message(&record.id).is_none());
}

#[tokio::test]
async fn test_has_active_streaming_reflects_runners() {
    let mut h = harness();
    let record = h.add_session("alpha");
    assert!(!h.controller.lifecycle().has_active_streaming());

    h.controller.send_message(&record, "go".to_string()).await.unwrap();
    assert!(h.controller.lifecycle().has_active_streaming());

    let probe = h.factory.probe(&record.id);
    probe.response_tx.send(ResponseChunk::Done).await.unwrap();
    h.pump_until(|n| matches!(n, Notice::ResponseFinished(_))).await;
    assert!(!h.controller.lifecycle().has_active_streaming());
}
