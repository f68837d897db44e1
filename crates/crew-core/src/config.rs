//! Session registry and persistence
//!
//! The config collaborator owns everything the engine must not mutate
//! directly: session records, per-session allowed-tool lists, and message
//! transcripts. The engine requests mutations through the `ConfigStore`
//! trait; `FileConfigStore` keeps a `sessions.toml` registry plus one JSON
//! transcript file per session under the data directory.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};

/// Lifecycle status persisted for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Active,
    Merged,
    PrCreated,
}

/// One session known to the console: an agent conversation bound to an
/// isolated git working tree. Read-only input to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub name: String,
    pub worktree_path: PathBuf,
    pub branch: String,
    /// Parent session for child worktrees (merge-to-parent target)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// Whether the agent has completed at least one exchange
    #[serde(default)]
    pub started: bool,
    #[serde(default)]
    pub status: SessionStatus,
    /// Issue or ticket reference this session works on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue: Option<String>,
}

impl SessionRecord {
    pub fn new(
        name: impl Into<String>,
        worktree_path: impl Into<PathBuf>,
        branch: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            worktree_path: worktree_path.into(),
            branch: branch.into(),
            parent: None,
            started: false,
            status: SessionStatus::Active,
            issue: None,
        }
    }
}

/// Role of a transcript message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
    Error,
}

/// One persisted transcript message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptMessage {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl TranscriptMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self::new(Role::Error, content)
    }
}

/// Session CRUD, status flags, allow-lists, and transcript persistence.
///
/// Write failures are reported to the user as transient notices; callers
/// keep their in-memory state authoritative and do not roll back.
pub trait ConfigStore: Send + Sync {
    fn list_sessions(&self) -> Result<Vec<SessionRecord>>;
    fn get_session(&self, id: &str) -> Result<Option<SessionRecord>>;
    fn create_session(&self, record: SessionRecord) -> Result<()>;
    fn delete_session(&self, id: &str) -> Result<()>;

    fn mark_started(&self, id: &str) -> Result<()>;
    fn mark_merged(&self, id: &str) -> Result<()>;
    fn mark_pr_created(&self, id: &str) -> Result<()>;

    fn allowed_tools(&self, id: &str) -> Result<Vec<String>>;
    fn add_allowed_tool(&self, id: &str, tool: &str) -> Result<()>;

    fn load_transcript(&self, id: &str) -> Result<Vec<TranscriptMessage>>;
    fn save_transcript(&self, id: &str, messages: &[TranscriptMessage]) -> Result<()>;
}

/// On-disk registry layout: the `sessions.toml` document
#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    sessions: Vec<SessionRecord>,
    /// Allowed tools per session id
    #[serde(default)]
    allowed_tools: HashMap<String, Vec<String>>,
}

/// Default data directory for the registry and transcripts
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|p| p.join("crew"))
        .unwrap_or_else(|| PathBuf::from(".crew"))
}

/// File-backed `ConfigStore`: `sessions.toml` + `transcripts/<id>.json`.
pub struct FileConfigStore {
    root: PathBuf,
    registry: Mutex<RegistryFile>,
}

impl FileConfigStore {
    pub fn new() -> Result<Self> {
        Self::with_root(default_data_dir())
    }

    pub fn with_root(root: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(root.join("transcripts"))?;
        let path = root.join("sessions.toml");
        let registry = if path.exists() {
            let text = std::fs::read_to_string(&path)?;
            toml::from_str(&text).map_err(|e| {
                Error::Config(format!("failed to parse {}: {}", path.display(), e))
            })?
        } else {
            RegistryFile::default()
        };
        Ok(Self {
            root,
            registry: Mutex::new(registry),
        })
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    fn flush(&self, registry: &RegistryFile) -> Result<()> {
        let text = toml::to_string_pretty(registry)
            .map_err(|e| Error::Config(format!("failed to serialize registry: {}", e)))?;
        std::fs::write(self.root.join("sessions.toml"), text)?;
        Ok(())
    }

    fn update_record(&self, id: &str, f: impl FnOnce(&mut SessionRecord)) -> Result<()> {
        let mut registry = self.registry.lock();
        let record = registry
            .sessions
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))?;
        f(record);
        self.flush(&registry)
    }

    fn transcript_path(&self, id: &str) -> PathBuf {
        self.root.join("transcripts").join(format!("{}.json", id))
    }
}

impl ConfigStore for FileConfigStore {
    fn list_sessions(&self) -> Result<Vec<SessionRecord>> {
        Ok(self.registry.lock().sessions.clone())
    }

    fn get_session(&self, id: &str) -> Result<Option<SessionRecord>> {
        Ok(self
            .registry
            .lock()
            .sessions
            .iter()
            .find(|s| s.id == id)
            .cloned())
    }

    fn create_session(&self, record: SessionRecord) -> Result<()> {
        let mut registry = self.registry.lock();
        if registry.sessions.iter().any(|s| s.id == record.id) {
            return Err(Error::Config(format!(
                "session {} already exists",
                record.id
            )));
        }
        registry.sessions.push(record);
        self.flush(&registry)
    }

    fn delete_session(&self, id: &str) -> Result<()> {
        let mut registry = self.registry.lock();
        registry.sessions.retain(|s| s.id != id);
        registry.allowed_tools.remove(id);
        self.flush(&registry)?;
        let path = self.transcript_path(id);
        if path.exists()
            && let Err(e) = std::fs::remove_file(&path)
        {
            warn!("failed to remove transcript {}: {}", path.display(), e);
        }
        Ok(())
    }

    fn mark_started(&self, id: &str) -> Result<()> {
        self.update_record(id, |r| r.started = true)
    }

    fn mark_merged(&self, id: &str) -> Result<()> {
        self.update_record(id, |r| r.status = SessionStatus::Merged)
    }

    fn mark_pr_created(&self, id: &str) -> Result<()> {
        self.update_record(id, |r| r.status = SessionStatus::PrCreated)
    }

    fn allowed_tools(&self, id: &str) -> Result<Vec<String>> {
        Ok(self
            .registry
            .lock()
            .allowed_tools
            .get(id)
            .cloned()
            .unwrap_or_default())
    }

    fn add_allowed_tool(&self, id: &str, tool: &str) -> Result<()> {
        let mut registry = self.registry.lock();
        let tools = registry.allowed_tools.entry(id.to_string()).or_default();
        if !tools.iter().any(|t| t == tool) {
            tools.push(tool.to_string());
        }
        self.flush(&registry)
    }

    fn load_transcript(&self, id: &str) -> Result<Vec<TranscriptMessage>> {
        let path = self.transcript_path(id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let json = std::fs::read_to_string(&path)?;
        match serde_json::from_str(&json) {
            Ok(messages) => Ok(messages),
            Err(e) => {
                warn!("failed to parse transcript {}: {}", path.display(), e);
                Ok(Vec::new())
            }
        }
    }

    fn save_transcript(&self, id: &str, messages: &[TranscriptMessage]) -> Result<()> {
        let json = serde_json::to_string_pretty(messages)?;
        std::fs::write(self.transcript_path(id), json)?;
        Ok(())
    }
}
