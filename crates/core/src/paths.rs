use std::path::PathBuf;

/// Layout of everything the runtime persists under its storage root.
#[derive(Debug, Clone)]
pub struct Paths {
    pub base: PathBuf,
}

/// Make a name safe to use as a single path component.
pub fn sanitize_component(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            ':' | '/' | '\\' | '\0' => '_',
            c => c,
        })
        .collect();
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        format!("_{}", cleaned)
    } else {
        cleaned
    }
}

impl Paths {
    pub fn new() -> Self {
        let base = dirs::home_dir()
            .map(|h| h.join(".courier"))
            .unwrap_or_else(|| PathBuf::from(".courier"));
        Self { base }
    }

    pub fn with_base(base: PathBuf) -> Self {
        Self { base }
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.base.join("sessions")
    }

    /// Directory holding the active sessions of one agent for one logical task.
    pub fn task_sessions_dir(&self, agent: &str, task: &str) -> PathBuf {
        self.sessions_dir()
            .join(sanitize_component(agent))
            .join(sanitize_component(task))
    }

    pub fn archive_dir(&self, agent: &str, task: &str) -> PathBuf {
        self.task_sessions_dir(agent, task).join("archive")
    }

    pub fn session_meta_file(&self, agent: &str, task: &str, session_id: &str) -> PathBuf {
        self.task_sessions_dir(agent, task)
            .join(format!("{}.meta.json", sanitize_component(session_id)))
    }

    pub fn session_history_file(&self, agent: &str, task: &str, session_id: &str) -> PathBuf {
        self.task_sessions_dir(agent, task)
            .join(format!("{}.history.json", sanitize_component(session_id)))
    }

    pub fn session_context_file(&self, agent: &str, task: &str, session_id: &str) -> PathBuf {
        self.task_sessions_dir(agent, task)
            .join(format!("{}.context.json", sanitize_component(session_id)))
    }

    pub fn correlations_dir(&self) -> PathBuf {
        self.base.join("correlations")
    }

    /// Reply-correlation table of one agent for one logical task.
    pub fn correlation_file(&self, agent: &str, task: &str) -> PathBuf {
        self.correlations_dir()
            .join(sanitize_component(agent))
            .join(format!("{}.json", sanitize_component(task)))
    }

    pub fn audit_dir(&self) -> PathBuf {
        self.base.join("audit")
    }

    pub fn snapshot_file(&self) -> PathBuf {
        self.base.join("snapshot.json")
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.base)?;
        std::fs::create_dir_all(self.sessions_dir())?;
        std::fs::create_dir_all(self.correlations_dir())?;
        std::fs::create_dir_all(self.audit_dir())?;
        Ok(())
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}
