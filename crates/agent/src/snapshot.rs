use chrono::{DateTime, Utc};
use courier_core::{Error, Message, Result};
use courier_storage::atomic::write_json;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentSnapshot {
    /// Pending mail, the message that was in flight first.
    pub mailbox: Vec<Message>,
    #[serde(default)]
    pub extra_state: Value,
}

/// Undelivered and unprocessed mail of the whole system at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub timestamp: DateTime<Utc>,
    pub agents: BTreeMap<String, AgentSnapshot>,
    #[serde(default)]
    pub broker_undelivered: Vec<Message>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self {
            timestamp: Utc::now(),
            agents: BTreeMap::new(),
            broker_undelivered: Vec::new(),
        }
    }

    pub fn message_count(&self) -> usize {
        self.broker_undelivered.len()
            + self.agents.values().map(|a| a.mailbox.len()).sum::<usize>()
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        write_json(path, self).await?;
        info!(path = %path.display(), messages = self.message_count(), "Snapshot saved");
        Ok(())
    }

    /// Read a snapshot. A file that exists but does not parse is
    /// [`Error::SnapshotCorruption`].
    pub async fn load(path: &Path) -> Result<Self> {
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(format!("snapshot {}", path.display())));
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&raw)
            .map_err(|e| Error::SnapshotCorruption(format!("{}: {}", path.display(), e)))
    }
}

impl Default for Snapshot {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_save_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("snapshot.json");
        let mut snapshot = Snapshot::new();
        snapshot.agents.insert(
            "Coder".to_string(),
            AgentSnapshot {
                mailbox: vec![
                    Message::new("User", "Coder", "s", "in flight").with_id("M1"),
                    Message::new("User", "Coder", "s", "queued").with_id("M2"),
                ],
                extra_state: json!({"in_flight": "M1"}),
            },
        );
        snapshot.broker_undelivered = vec![Message::new("Coder", "User", "", "hi").with_correlation("M1")];
        snapshot.save(&path).await.unwrap();

        let loaded = Snapshot::load(&path).await.unwrap();
        assert_eq!(loaded, snapshot);
        assert_eq!(loaded.message_count(), 3);
    }

    #[tokio::test]
    async fn test_corrupt_and_missing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("snapshot.json");
        assert!(matches!(Snapshot::load(&path).await, Err(Error::NotFound(_))));

        std::fs::write(&path, "{\"timestamp\": 12, \"agents\": [").unwrap();
        assert!(matches!(
            Snapshot::load(&path).await,
            Err(Error::SnapshotCorruption(_))
        ));
    }
}
