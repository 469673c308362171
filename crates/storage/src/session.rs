use chrono::{DateTime, Utc};
use courier_core::types::ChatMessage;
use courier_core::{Message, Paths, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::atomic::{read_json, write_json};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Waiting,
}

/// Identifies a session on disk and in the cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub agent: String,
    pub task: String,
    pub session_id: String,
}

impl SessionKey {
    pub fn new(agent: &str, task: &str, session_id: &str) -> Self {
        Self {
            agent: agent.to_string(),
            task: task.to_string(),
            session_id: session_id.to_string(),
        }
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.agent, self.task, self.session_id)
    }
}

/// Conversation state of one logical task inside one agent.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub session_id: String,
    pub agent: String,
    pub logical_task_id: String,
    pub original_sender: String,
    pub status: SessionStatus,
    pub history: Vec<ChatMessage>,
    pub context: Map<String, Value>,
    pub last_sender: Option<String>,
    pub last_inbound_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

impl Session {
    /// A fresh session created by `origin`; its id is the message id.
    pub fn new(agent: &str, origin: &Message) -> Self {
        let now = Utc::now();
        Self {
            session_id: origin.id.clone(),
            agent: agent.to_string(),
            logical_task_id: origin.task_key().to_string(),
            original_sender: origin.sender.clone(),
            status: SessionStatus::Running,
            history: Vec::new(),
            context: Map::new(),
            last_sender: None,
            last_inbound_id: None,
            created_at: now,
            last_modified: now,
        }
    }

    pub fn key(&self) -> SessionKey {
        SessionKey::new(&self.agent, &self.logical_task_id, &self.session_id)
    }

    /// Append an inbound message to history and remember who spoke last.
    pub fn record_inbound(&mut self, msg: &Message) {
        self.history.push(ChatMessage::user(&msg.as_prompt_text()));
        self.last_sender = Some(msg.sender.clone());
        self.last_inbound_id = Some(msg.id.clone());
        self.touch();
    }

    pub fn push(&mut self, turn: ChatMessage) {
        self.history.push(turn);
        self.touch();
    }

    pub fn touch(&mut self) {
        self.last_modified = Utc::now();
    }

    fn meta(&self) -> SessionMeta {
        SessionMeta {
            session_id: self.session_id.clone(),
            agent: self.agent.clone(),
            logical_task_id: self.logical_task_id.clone(),
            original_sender: self.original_sender.clone(),
            status: self.status,
            last_sender: self.last_sender.clone(),
            last_inbound_id: self.last_inbound_id.clone(),
            created_at: self.created_at,
            last_modified: self.last_modified,
        }
    }

    fn from_parts(meta: SessionMeta, history: Vec<ChatMessage>, context: Map<String, Value>) -> Self {
        Self {
            session_id: meta.session_id,
            agent: meta.agent,
            logical_task_id: meta.logical_task_id,
            original_sender: meta.original_sender,
            status: meta.status,
            history,
            context,
            last_sender: meta.last_sender,
            last_inbound_id: meta.last_inbound_id,
            created_at: meta.created_at,
            last_modified: meta.last_modified,
        }
    }
}

/// Everything except history and context; small, rewritten on every save.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionMeta {
    session_id: String,
    agent: String,
    logical_task_id: String,
    original_sender: String,
    status: SessionStatus,
    #[serde(default)]
    last_sender: Option<String>,
    #[serde(default)]
    last_inbound_id: Option<String>,
    created_at: DateTime<Utc>,
    last_modified: DateTime<Utc>,
}

struct CachedSession {
    session: Session,
    last_access: Instant,
}

/// Durable, lazily loaded session storage with an in-memory cache.
///
/// Meta, history and context live in separate files so a context update does
/// not rewrite a long transcript. All writes go through [`write_json`].
pub struct SessionStore {
    paths: Paths,
    cache: Mutex<HashMap<SessionKey, CachedSession>>,
}

impl SessionStore {
    pub fn new(paths: Paths) -> Self {
        Self {
            paths,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    async fn load_from_disk(&self, key: &SessionKey) -> Result<Option<Session>> {
        let meta_path = self
            .paths
            .session_meta_file(&key.agent, &key.task, &key.session_id);
        let meta: SessionMeta = match read_json(&meta_path).await? {
            Some(m) => m,
            None => return Ok(None),
        };
        let history: Vec<ChatMessage> = read_json(
            &self
                .paths
                .session_history_file(&key.agent, &key.task, &key.session_id),
        )
        .await?
        .unwrap_or_default();
        let context: Map<String, Value> = read_json(
            &self
                .paths
                .session_context_file(&key.agent, &key.task, &key.session_id),
        )
        .await?
        .unwrap_or_default();
        debug!(session = %key, turns = history.len(), "Session loaded from disk");
        Ok(Some(Session::from_parts(meta, history, context)))
    }

    /// Cache, then disk. `None` if the session is unknown or archived.
    pub async fn get(&self, key: &SessionKey) -> Option<Session> {
        let mut cache = self.cache.lock().await;
        if let Some(entry) = cache.get_mut(key) {
            entry.last_access = Instant::now();
            return Some(entry.session.clone());
        }
        match self.load_from_disk(key).await {
            Ok(Some(session)) => {
                cache.insert(
                    key.clone(),
                    CachedSession {
                        session: session.clone(),
                        last_access: Instant::now(),
                    },
                );
                Some(session)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(session = %key, error = %e, "Failed to load session, treating as missing");
                None
            }
        }
    }

    /// Look up `key`, synthesizing a new session from `origin` when it is missing.
    ///
    /// The cache lock is held across the lookup and the insert, so two callers
    /// resolving the same key always end up with the same session.
    pub async fn get_or_create(&self, key: &SessionKey, origin: &Message) -> Session {
        let mut cache = self.cache.lock().await;
        if let Some(entry) = cache.get_mut(key) {
            entry.last_access = Instant::now();
            return entry.session.clone();
        }
        let session = match self.load_from_disk(key).await {
            Ok(Some(session)) => session,
            Ok(None) => {
                let mut fresh = Session::new(&key.agent, origin);
                fresh.session_id = key.session_id.clone();
                fresh.logical_task_id = key.task.clone();
                info!(session = %key, "Created session");
                fresh
            }
            Err(e) => {
                warn!(session = %key, error = %e, "Unreadable session on disk, starting fresh");
                let mut fresh = Session::new(&key.agent, origin);
                fresh.session_id = key.session_id.clone();
                fresh.logical_task_id = key.task.clone();
                fresh
            }
        };
        cache.insert(
            key.clone(),
            CachedSession {
                session: session.clone(),
                last_access: Instant::now(),
            },
        );
        session
    }

    async fn cache_put(&self, session: &Session) {
        let mut cache = self.cache.lock().await;
        cache.insert(
            session.key(),
            CachedSession {
                session: session.clone(),
                last_access: Instant::now(),
            },
        );
    }

    async fn write_meta(&self, session: &Session) -> Result<()> {
        let path = self.paths.session_meta_file(
            &session.agent,
            &session.logical_task_id,
            &session.session_id,
        );
        write_json(&path, &session.meta()).await
    }

    /// Persist meta and history; context is left untouched on disk.
    pub async fn save_history(&self, session: &Session) -> Result<()> {
        self.cache_put(session).await;
        let path = self.paths.session_history_file(
            &session.agent,
            &session.logical_task_id,
            &session.session_id,
        );
        write_json(&path, &session.history).await?;
        self.write_meta(session).await
    }

    /// Persist meta and context; history is left untouched on disk.
    pub async fn save_context(&self, session: &Session) -> Result<()> {
        self.cache_put(session).await;
        let path = self.paths.session_context_file(
            &session.agent,
            &session.logical_task_id,
            &session.session_id,
        );
        write_json(&path, &session.context).await?;
        self.write_meta(session).await
    }

    pub async fn save(&self, session: &Session) -> Result<()> {
        self.save_history(session).await?;
        self.save_context(session).await
    }

    /// Remove a finished session from the active set.
    ///
    /// The cache entry is dropped and its files are moved to the task's archive
    /// directory, so later lookups by the same id miss and synthesize a new one.
    pub async fn archive(&self, key: &SessionKey) -> Result<()> {
        self.cache.lock().await.remove(key);

        let archive_dir = self.paths.archive_dir(&key.agent, &key.task);
        tokio::fs::create_dir_all(&archive_dir).await?;
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%3f").to_string();
        let files = [
            self.paths.session_meta_file(&key.agent, &key.task, &key.session_id),
            self.paths.session_history_file(&key.agent, &key.task, &key.session_id),
            self.paths.session_context_file(&key.agent, &key.task, &key.session_id),
        ];
        for file in files {
            let Some(name) = file.file_name().map(|n| n.to_string_lossy().to_string()) else {
                continue;
            };
            let target = archive_dir.join(format!("{}.{}", stamp, name));
            match tokio::fs::rename(&file, &target).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        info!(session = %key, "Session archived");
        Ok(())
    }

    /// Drop cached `Waiting` sessions not touched for `ttl`. They stay on disk.
    pub async fn evict_idle(&self, ttl: Duration) -> usize {
        let mut cache = self.cache.lock().await;
        let before = cache.len();
        cache.retain(|_, entry| {
            entry.session.status != SessionStatus::Waiting || entry.last_access.elapsed() < ttl
        });
        let evicted = before - cache.len();
        if evicted > 0 {
            debug!(evicted, "Evicted idle sessions from cache");
        }
        evicted
    }

    pub async fn cached_len(&self) -> usize {
        self.cache.lock().await.len()
    }

    /// Drop every cache entry. Used by tests to force disk loads.
    pub async fn clear_cache(&self) {
        self.cache.lock().await.clear();
    }
}
