//! Event handling for the TUI
//!
//! Merges three sources into one channel the event loop consumes: terminal
//! input, routed events from the orchestration engine, and a refresh tick.

use crossterm::event::{self, Event as CrosstermEvent, KeyCode, KeyEvent, KeyModifiers};
use std::time::Duration;
use tokio::sync::mpsc;

use crew_core::{MergeKind, RoutedEvent};

/// Events that can occur in the TUI
#[derive(Debug)]
pub enum Event {
    /// Terminal event (key press, resize, etc.)
    Terminal(CrosstermEvent),
    /// Routed event from the orchestration engine
    Routed(RoutedEvent),
    /// Tick for UI refresh (elapsed-time display)
    Tick,
}

/// Event handler that polls for terminal events and routed events
pub struct EventHandler {
    rx: mpsc::UnboundedReceiver<Event>,
    /// Kept so forwarding tasks can clone it
    _tx: mpsc::UnboundedSender<Event>,
}

impl EventHandler {
    pub fn new(mut routed_rx: mpsc::UnboundedReceiver<RoutedEvent>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();

        // Terminal polling runs on a plain thread; crossterm's poll blocks
        let tx_terminal = tx.clone();
        std::thread::spawn(move || {
            loop {
                if event::poll(Duration::from_millis(100)).unwrap_or(false)
                    && let Ok(evt) = event::read()
                    && tx_terminal.send(Event::Terminal(evt)).is_err()
                {
                    break;
                }
                if tx_terminal.send(Event::Tick).is_err() {
                    break;
                }
            }
        });

        // Routed events forwarded from the listener pool's channel
        let tx_routed = tx.clone();
        tokio::spawn(async move {
            while let Some(event) = routed_rx.recv().await {
                if tx_routed.send(Event::Routed(event)).is_err() {
                    break;
                }
            }
        });

        Self { rx, _tx: tx }
    }

    /// Get the next event
    pub async fn next(&mut self) -> Option<Event> {
        self.rx.recv().await
    }
}

/// Result of handling a key event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyAction {
    /// No action needed
    None,
    /// Quit the application
    Quit,
    /// Move the sidebar cursor up
    SelectPrev,
    /// Move the sidebar cursor down
    SelectNext,
    /// Focus the session under the cursor
    FocusSelected,
    /// Move focus into the input bar
    FocusInput,
    /// Leave the input bar back to the sidebar
    LeaveInput,
    /// Submit the current input
    Submit(String),
    /// Cancel the focused session's outstanding agent request
    CancelAgent,
    /// Cancel the focused session's running merge/PR/push
    CancelMerge,
    /// Enter the merge workflow for the focused session
    BeginMerge(MergeKind),
    /// Kill orphaned processes holding the focused worktree
    ForceResume,
    /// Ask to delete the session under the cursor
    DeleteSelected,
    /// Confirm the pending confirmation dialog
    ConfirmYes,
    /// Dismiss the pending confirmation dialog
    ConfirmNo,
    /// Answer the pending permission request
    Permission { allowed: bool, always: bool },
    /// Move the question cursor
    QuestionPrev,
    QuestionNext,
    /// Answer the pending question with the highlighted option
    QuestionAnswer,
    /// Confirm the commit message and launch the run
    CommitConfirm(String),
    /// Abandon the merge at the commit-message step
    CommitCancel,
    /// Pick a conflict resolution path (delegate / abort / manual)
    ConflictChoice(usize),
    /// Dismiss the conflict dialog
    ConflictDismiss,
    /// Scroll the transcript
    ScrollUp,
    ScrollDown,
}

/// Keys in sidebar (sessions) mode
pub fn handle_key_sessions(key: KeyEvent) -> KeyAction {
    match key.code {
        KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => KeyAction::Quit,
        KeyCode::Char('q') => KeyAction::Quit,
        KeyCode::Up | KeyCode::Char('k') => KeyAction::SelectPrev,
        KeyCode::Down | KeyCode::Char('j') => KeyAction::SelectNext,
        KeyCode::Enter => KeyAction::FocusSelected,
        KeyCode::Tab | KeyCode::Char('i') => KeyAction::FocusInput,
        KeyCode::Char('m') => KeyAction::BeginMerge(MergeKind::Merge),
        KeyCode::Char('p') => KeyAction::BeginMerge(MergeKind::PullRequest),
        KeyCode::Char('u') => KeyAction::BeginMerge(MergeKind::Push),
        KeyCode::Char('M') => KeyAction::BeginMerge(MergeKind::MergeToParent),
        KeyCode::Char('c') => KeyAction::CancelAgent,
        KeyCode::Char('x') => KeyAction::CancelMerge,
        KeyCode::Char('r') => KeyAction::ForceResume,
        KeyCode::Char('d') => KeyAction::DeleteSelected,
        KeyCode::PageUp => KeyAction::ScrollUp,
        KeyCode::PageDown => KeyAction::ScrollDown,
        _ => KeyAction::None,
    }
}

/// Keys in input mode
pub fn handle_key_input(key: KeyEvent, input: &mut tui_input::Input) -> KeyAction {
    match key.code {
        KeyCode::Enter => {
            let value = input.value().to_string();
            if !value.trim().is_empty() {
                input.reset();
                KeyAction::Submit(value)
            } else {
                KeyAction::None
            }
        }
        KeyCode::Esc => KeyAction::LeaveInput,
        KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => KeyAction::Quit,
        KeyCode::PageUp => KeyAction::ScrollUp,
        KeyCode::PageDown => KeyAction::ScrollDown,
        KeyCode::Char(c) => {
            input.handle(tui_input::InputRequest::InsertChar(c));
            KeyAction::None
        }
        KeyCode::Backspace => {
            input.handle(tui_input::InputRequest::DeletePrevChar);
            KeyAction::None
        }
        KeyCode::Delete => {
            input.handle(tui_input::InputRequest::DeleteNextChar);
            KeyAction::None
        }
        KeyCode::Left => {
            input.handle(tui_input::InputRequest::GoToPrevChar);
            KeyAction::None
        }
        KeyCode::Right => {
            input.handle(tui_input::InputRequest::GoToNextChar);
            KeyAction::None
        }
        KeyCode::Home => {
            input.handle(tui_input::InputRequest::GoToStart);
            KeyAction::None
        }
        KeyCode::End => {
            input.handle(tui_input::InputRequest::GoToEnd);
            KeyAction::None
        }
        _ => KeyAction::None,
    }
}

/// Keys while a permission request is shown
pub fn handle_key_permission(key: KeyEvent) -> KeyAction {
    match key.code {
        KeyCode::Char('y') | KeyCode::Char('Y') => KeyAction::Permission {
            allowed: true,
            always: false,
        },
        KeyCode::Char('a') | KeyCode::Char('A') => KeyAction::Permission {
            allowed: true,
            always: true,
        },
        KeyCode::Char('n') | KeyCode::Char('N') | KeyCode::Esc => KeyAction::Permission {
            allowed: false,
            always: false,
        },
        KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => KeyAction::Quit,
        _ => KeyAction::None,
    }
}

/// Keys while a question is shown
pub fn handle_key_question(key: KeyEvent) -> KeyAction {
    match key.code {
        KeyCode::Up | KeyCode::Char('k') => KeyAction::QuestionPrev,
        KeyCode::Down | KeyCode::Char('j') => KeyAction::QuestionNext,
        KeyCode::Enter | KeyCode::Char(' ') => KeyAction::QuestionAnswer,
        KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => KeyAction::Quit,
        _ => KeyAction::None,
    }
}

/// Keys while the commit-message editor is shown
pub fn handle_key_commit(key: KeyEvent, input: &mut tui_input::Input) -> KeyAction {
    match key.code {
        KeyCode::Enter => {
            let value = input.value().to_string();
            if value.trim().is_empty() {
                KeyAction::None
            } else {
                KeyAction::CommitConfirm(value)
            }
        }
        KeyCode::Esc => KeyAction::CommitCancel,
        KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => KeyAction::Quit,
        KeyCode::Char(c) => {
            input.handle(tui_input::InputRequest::InsertChar(c));
            KeyAction::None
        }
        KeyCode::Backspace => {
            input.handle(tui_input::InputRequest::DeletePrevChar);
            KeyAction::None
        }
        KeyCode::Left => {
            input.handle(tui_input::InputRequest::GoToPrevChar);
            KeyAction::None
        }
        KeyCode::Right => {
            input.handle(tui_input::InputRequest::GoToNextChar);
            KeyAction::None
        }
        _ => KeyAction::None,
    }
}

/// Keys while the conflict dialog is shown
pub fn handle_key_conflict(key: KeyEvent) -> KeyAction {
    match key.code {
        KeyCode::Char('1') | KeyCode::Char('a') => KeyAction::ConflictChoice(0),
        KeyCode::Char('2') | KeyCode::Char('b') => KeyAction::ConflictChoice(1),
        KeyCode::Char('3') | KeyCode::Char('m') => KeyAction::ConflictChoice(2),
        KeyCode::Esc => KeyAction::ConflictDismiss,
        KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => KeyAction::Quit,
        _ => KeyAction::None,
    }
}

/// Keys while a yes/no confirmation is shown
pub fn handle_key_confirm(key: KeyEvent) -> KeyAction {
    match key.code {
        KeyCode::Char('y') | KeyCode::Char('Y') | KeyCode::Enter => KeyAction::ConfirmYes,
        KeyCode::Char('n') | KeyCode::Char('N') | KeyCode::Esc => KeyAction::ConfirmNo,
        _ => KeyAction::None,
    }
}
