//! Session module - concurrency and orchestration primitives
//!
//! One session is one agent conversation bound to one isolated git working
//! tree. The pieces here keep N sessions independently streaming onto a
//! single-threaded control loop:
//!
//! - `SessionStore`: per-session mutable state behind named transitions
//! - `SessionLifecycle`: runner cache plus the select/delete transitions
//! - `ListenerPool` + re-arm rules: the listen → react → re-arm protocol
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                    control loop                      │
//! │                                                      │
//! │   RoutedEvent ◀──────────── ListenerPool             │
//! │       │                      ▲  ▲  ▲                 │
//! │       ▼                      │  │  │  (one one-shot  │
//! │   Controller ── re-arm ──────┘  │  │   listen task   │
//! │       │                         │  │   per stream    │
//! │       ▼                         │  │   per session)  │
//! │   SessionStore      runner A ───┘  │                 │
//! │                     runner B ──────┘                 │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! Messages for one session arrive in stream order; messages for different
//! sessions interleave arbitrarily.

pub mod lifecycle;
pub mod routing;
pub mod state;

pub use lifecycle::{PreviousFocus, SelectionResult, SessionLifecycle};
pub use routing::{
    Listened, LineStream, ListenerPool, RoutedEvent, merge_rearms, request_rearms,
    response_rearms,
};
pub use state::{
    ConflictContext, MergeKind, MergeOp, SessionId, SessionSnapshot, SessionState, SessionStore,
    Waiting,
};
