//! Error types for Crew Core

use thiserror::Error;

/// Result type alias using Crew Error
pub type Result<T> = std::result::Result<T, Error>;

/// Crew error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("Runner error: {0}")]
    Runner(String),

    #[error("Git error: {0}")]
    Git(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("A merge, pull request, or push is already running for session {0}")]
    MergeInProgress(String),

    #[error("An agent request is already outstanding for session {0}")]
    AlreadyWaiting(String),

    #[error("Parent session {0} no longer exists")]
    ParentMissing(String),

    #[error("Process supervision error: {0}")]
    Process(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Operation cancelled")]
    Cancelled,
}
