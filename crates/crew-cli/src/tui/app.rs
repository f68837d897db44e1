//! Application view state for the TUI
//!
//! Holds what the terminal currently shows: the sidebar, the focused
//! session's transcript and input, and whichever overlay is open. The
//! orchestration state itself lives in the engine's session store; this
//! struct only mirrors the focused slice of it.

use tui_input::Input;

use crew_core::{
    MergeKind, MergeOutcome, Notice, PermissionRequest, QuestionRequest, SelectionResult,
    SessionRecord, SessionStore, TranscriptMessage,
};

/// Which input surface currently owns the keyboard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Sidebar navigation
    Sessions,
    /// Typing into the focused session
    Input,
    /// Permission overlay
    Permission,
    /// Question overlay
    Question,
    /// Commit-message confirmation overlay
    Commit,
    /// Conflict resolution overlay
    Conflict,
    /// Delete confirmation overlay
    ConfirmDelete,
}

/// Commit-message confirmation state
pub struct CommitPrompt {
    pub kind: MergeKind,
    pub input: Input,
}

/// Conflict resolution dialog state
pub struct ConflictPrompt {
    pub files: Vec<String>,
}

/// Main TUI application state
pub struct App {
    pub mode: Mode,
    /// Sidebar order mirrors the persisted registry
    pub sessions: Vec<SessionRecord>,
    /// Sidebar cursor
    pub selected: usize,
    /// Currently focused session
    pub focused: Option<SessionRecord>,
    pub header: String,
    /// Draft input for the focused session
    pub input: Input,
    /// Flushed transcript of the focused session
    pub transcript: Vec<TranscriptMessage>,
    /// Live streaming buffer of the focused session
    pub streaming: String,
    pub pending_permission: Option<PermissionRequest>,
    pub pending_question: Option<QuestionRequest>,
    pub question_choice: usize,
    pub commit_prompt: Option<CommitPrompt>,
    pub conflict_prompt: Option<ConflictPrompt>,
    pub confirm_delete: Option<SessionRecord>,
    /// Footer status line
    pub status: String,
    pub scroll_offset: usize,
    pub should_quit: bool,
}

impl App {
    pub fn new(sessions: Vec<SessionRecord>) -> Self {
        Self {
            mode: Mode::Sessions,
            sessions,
            selected: 0,
            focused: None,
            header: String::new(),
            input: Input::default(),
            transcript: Vec::new(),
            streaming: String::new(),
            pending_permission: None,
            pending_question: None,
            question_choice: 0,
            commit_prompt: None,
            conflict_prompt: None,
            confirm_delete: None,
            status: String::from("Enter focuses a session; q quits"),
            scroll_offset: usize::MAX,
            should_quit: false,
        }
    }

    /// Record under the sidebar cursor
    pub fn selected_record(&self) -> Option<&SessionRecord> {
        self.sessions.get(self.selected)
    }

    pub fn select_prev(&mut self) {
        if self.selected > 0 {
            self.selected -= 1;
        }
    }

    pub fn select_next(&mut self) {
        if self.selected + 1 < self.sessions.len() {
            self.selected += 1;
        }
    }

    /// Replace the sidebar contents, keeping the cursor in range.
    pub fn refresh_sessions(&mut self, sessions: Vec<SessionRecord>) {
        self.sessions = sessions;
        if self.selected >= self.sessions.len() {
            self.selected = self.sessions.len().saturating_sub(1);
        }
        if let Some(focused) = &self.focused
            && !self.sessions.iter().any(|s| s.id == focused.id)
        {
            self.focused = None;
            self.transcript.clear();
            self.streaming.clear();
            self.header.clear();
        }
    }

    /// Apply a completed selection: show the incoming session's restored
    /// transcript, input, and pending prompts.
    pub fn apply_selection(&mut self, record: SessionRecord, result: SelectionResult) {
        self.transcript = result.transcript;
        self.streaming = result.snapshot.streaming_content.clone();
        self.input = Input::new(result.snapshot.input_text.clone());
        self.pending_permission = result.snapshot.pending_permission.clone();
        self.pending_question = result.snapshot.pending_question.clone();
        self.question_choice = 0;
        self.header = result.header;
        self.focused = Some(record);
        self.scroll_offset = usize::MAX;
        self.mode = if self.pending_permission.is_some() {
            Mode::Permission
        } else if self.pending_question.is_some() {
            Mode::Question
        } else {
            Mode::Input
        };
        if result.snapshot.session_in_use_error {
            self.status = "worktree locked by another process - press r to force-resume".to_string();
        } else {
            self.status.clear();
        }
    }

    fn is_focused(&self, id: &str) -> bool {
        self.focused.as_ref().is_some_and(|r| r.id == id)
    }

    fn name_of(&self, id: &str) -> String {
        self.sessions
            .iter()
            .find(|s| s.id == id)
            .map(|s| s.name.clone())
            .unwrap_or_else(|| id.to_string())
    }

    /// Fold one engine notice into the view.
    pub fn apply_notice(&mut self, notice: &Notice, store: &SessionStore) {
        match notice {
            Notice::StreamingUpdated(id) => {
                if self.is_focused(id)
                    && let Some(snapshot) = store.snapshot(id)
                {
                    self.streaming = snapshot.streaming_content;
                    self.scroll_offset = usize::MAX;
                }
            }
            Notice::ResponseFinished(id) => {
                if self.is_focused(id) {
                    // The engine flushed the buffer to the transcript;
                    // mirror that locally without a reload
                    if !self.streaming.is_empty() {
                        self.transcript
                            .push(TranscriptMessage::assistant(std::mem::take(
                                &mut self.streaming,
                            )));
                    }
                    self.scroll_offset = usize::MAX;
                } else {
                    self.status = format!("{} finished a response", self.name_of(id));
                }
            }
            Notice::PermissionRequested(id) => {
                if self.is_focused(id) {
                    if let Some(snapshot) = store.snapshot(id) {
                        self.pending_permission = snapshot.pending_permission;
                    }
                    if self.mode == Mode::Input || self.mode == Mode::Sessions {
                        self.mode = Mode::Permission;
                    }
                } else {
                    self.status = format!("{} needs a permission decision", self.name_of(id));
                }
            }
            Notice::QuestionRequested(id) => {
                if self.is_focused(id) {
                    if let Some(snapshot) = store.snapshot(id) {
                        self.pending_question = snapshot.pending_question;
                        self.question_choice = 0;
                    }
                    if self.mode == Mode::Input || self.mode == Mode::Sessions {
                        self.mode = Mode::Question;
                    }
                } else {
                    self.status = format!("{} asked a question", self.name_of(id));
                }
            }
            Notice::MergeOutput { session, line } => {
                if self.is_focused(session) {
                    self.status = line.clone();
                }
            }
            Notice::MergeFinished { session, outcome } => match outcome {
                MergeOutcome::Succeeded { detail } => {
                    self.status = match detail {
                        Some(detail) => format!("{}: {}", self.name_of(session), detail),
                        None => format!("{}: done", self.name_of(session)),
                    };
                }
                MergeOutcome::Conflicted { files } => {
                    if self.is_focused(session) {
                        self.conflict_prompt = Some(ConflictPrompt {
                            files: files.clone(),
                        });
                        self.mode = Mode::Conflict;
                    } else {
                        self.status = format!(
                            "{}: merge conflicts in {} files",
                            self.name_of(session),
                            files.len()
                        );
                    }
                }
                MergeOutcome::Failed { message } => {
                    self.status = format!("{}: {}", self.name_of(session), message);
                }
            },
            Notice::SessionInUse(id) => {
                self.status = format!(
                    "{}: worktree locked by another process - press r to force-resume",
                    self.name_of(id)
                );
            }
            Notice::AgentError { session, message } => {
                self.status = format!("{}: {}", self.name_of(session), message);
                if self.is_focused(session)
                    && let Some(snapshot) = store.snapshot(session)
                {
                    self.streaming = snapshot.streaming_content;
                }
            }
            Notice::PersistenceWarning(message) => {
                self.status = format!("save failed: {}", message);
            }
        }
    }

    pub fn scroll_up(&mut self) {
        if self.scroll_offset == usize::MAX {
            self.scroll_offset = usize::MAX - 1;
        }
        self.scroll_offset = self.scroll_offset.saturating_sub(5);
    }

    pub fn scroll_down(&mut self) {
        self.scroll_offset = self.scroll_offset.saturating_add(5);
    }

    pub fn question_prev(&mut self) {
        if self.question_choice > 0 {
            self.question_choice -= 1;
        }
    }

    pub fn question_next(&mut self) {
        if let Some(question) = &self.pending_question
            && self.question_choice + 1 < question.options.len()
        {
            self.question_choice += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str) -> SessionRecord {
        SessionRecord::new(name, format!("/tmp/{}", name), name)
    }

    #[test]
    fn test_cursor_stays_in_range() {
        let mut app = App::new(vec![record("a"), record("b")]);
        app.select_prev();
        assert_eq!(app.selected, 0);
        app.select_next();
        app.select_next();
        assert_eq!(app.selected, 1);
        app.refresh_sessions(vec![record("only")]);
        assert_eq!(app.selected, 0);
    }

    #[test]
    fn test_refresh_drops_vanished_focus() {
        let a = record("a");
        let mut app = App::new(vec![a.clone()]);
        app.focused = Some(a);
        app.transcript.push(TranscriptMessage::user("hi"));
        app.refresh_sessions(vec![record("b")]);
        assert!(app.focused.is_none());
        assert!(app.transcript.is_empty());
    }

    #[test]
    fn test_background_notices_only_touch_status() {
        let a = record("a");
        let b = record("b");
        let store = SessionStore::new();
        let mut app = App::new(vec![a.clone(), b.clone()]);
        app.focused = Some(a);
        store.append_streaming(&b.id, "other session output");

        app.apply_notice(&Notice::StreamingUpdated(b.id.clone()), &store);
        // A non-focused session's stream never leaks into the view
        assert!(app.streaming.is_empty());

        app.apply_notice(&Notice::ResponseFinished(b.id.clone()), &store);
        assert!(app.status.contains("b"));
        assert!(app.transcript.is_empty());
    }
}
