//! Terminal UI for the Crew console

mod app;
mod events;
mod ui;

pub use app::{App, CommitPrompt, ConflictPrompt, Mode};
pub use events::{
    Event, EventHandler, KeyAction, handle_key_commit, handle_key_confirm, handle_key_conflict,
    handle_key_input, handle_key_permission, handle_key_question, handle_key_sessions,
};
pub use ui::draw;
