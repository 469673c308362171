use courier_core::{Paths, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::atomic::{read_json, write_json};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Entry {
    session_id: String,
    /// Id of the inbound reply that resumed the session, once one has.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    claimed_by: Option<String>,
}

type Table = HashMap<String, Entry>;

/// Reply-correlation tables, one per agent and logical task.
///
/// Each table maps an outgoing message id to the session that sent it. The
/// first reply carrying that id as correlation id claims the entry; only the
/// same reply (redelivered after a restart) resolves through it again, so a
/// session is resumed at most once per outgoing message. The entry is removed
/// when processing of the claiming reply settles, or when the session is
/// archived. Tables are loaded on first reference and rewritten on every
/// change.
pub struct CorrelationStore {
    paths: Paths,
    tables: Mutex<HashMap<(String, String), Table>>,
}

impl CorrelationStore {
    pub fn new(paths: Paths) -> Self {
        Self {
            paths,
            tables: Mutex::new(HashMap::new()),
        }
    }

    async fn load_table(&self, agent: &str, task: &str) -> Table {
        match read_json(&self.paths.correlation_file(agent, task)).await {
            Ok(Some(table)) => table,
            Ok(None) => HashMap::new(),
            Err(e) => {
                warn!(agent = %agent, task = %task, error = %e, "Unreadable correlation table, starting empty");
                HashMap::new()
            }
        }
    }

    /// The table for `(agent, task)`, loaded on first reference.
    async fn table<'a>(
        &self,
        tables: &'a mut HashMap<(String, String), Table>,
        agent: &str,
        task: &str,
    ) -> &'a mut Table {
        let scope = (agent.to_string(), task.to_string());
        if !tables.contains_key(&scope) {
            let loaded = self.load_table(agent, task).await;
            tables.insert(scope.clone(), loaded);
        }
        tables.entry(scope).or_default()
    }

    async fn persist(&self, agent: &str, task: &str, table: &Table) {
        if let Err(e) = write_json(&self.paths.correlation_file(agent, task), table).await {
            warn!(agent = %agent, task = %task, error = %e, "Failed to persist correlation table");
        }
    }

    /// Remember that `outgoing_id` was sent from `session_id`.
    pub async fn record(
        &self,
        agent: &str,
        task: &str,
        outgoing_id: &str,
        session_id: &str,
    ) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let table = self.table(&mut tables, agent, task).await;
        table.insert(
            outgoing_id.to_string(),
            Entry {
                session_id: session_id.to_string(),
                claimed_by: None,
            },
        );
        debug!(agent = %agent, task = %task, outgoing = %outgoing_id, session = %session_id, "Correlation recorded");
        write_json(&self.paths.correlation_file(agent, task), &*table).await
    }

    /// The session waiting on `correlation_id`, claimed for `inbound_id`.
    ///
    /// Returns the session for the first reply and for redeliveries of that
    /// same reply; any other reply gets `None`.
    pub async fn claim(
        &self,
        agent: &str,
        task: &str,
        correlation_id: &str,
        inbound_id: &str,
    ) -> Option<String> {
        let mut tables = self.tables.lock().await;
        let table = self.table(&mut tables, agent, task).await;
        let entry = table.get_mut(correlation_id)?;
        match entry.claimed_by.as_deref() {
            Some(claimer) if claimer == inbound_id => Some(entry.session_id.clone()),
            Some(claimer) => {
                debug!(agent = %agent, correlation = %correlation_id, claimer = %claimer, reply = %inbound_id, "Correlation already claimed");
                None
            }
            None => {
                entry.claimed_by = Some(inbound_id.to_string());
                let session_id = entry.session_id.clone();
                self.persist(agent, task, table).await;
                Some(session_id)
            }
        }
    }

    /// Drop the entry claimed by `inbound_id` once that reply is processed.
    pub async fn settle(&self, agent: &str, task: &str, correlation_id: &str, inbound_id: &str) {
        let mut tables = self.tables.lock().await;
        let table = self.table(&mut tables, agent, task).await;
        let claimed = table
            .get(correlation_id)
            .is_some_and(|e| e.claimed_by.as_deref() == Some(inbound_id));
        if claimed {
            table.remove(correlation_id);
            self.persist(agent, task, table).await;
        }
    }

    /// Drop every entry pointing at `session_id`. Returns how many went.
    pub async fn forget_session(&self, agent: &str, task: &str, session_id: &str) -> usize {
        let mut tables = self.tables.lock().await;
        let table = self.table(&mut tables, agent, task).await;
        let before = table.len();
        table.retain(|_, e| e.session_id != session_id);
        let removed = before - table.len();
        if removed > 0 {
            debug!(agent = %agent, task = %task, session = %session_id, removed, "Correlations pruned");
            self.persist(agent, task, table).await;
        }
        removed
    }

    pub async fn pending(&self, agent: &str, task: &str) -> usize {
        let mut tables = self.tables.lock().await;
        self.table(&mut tables, agent, task).await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_claim_resumes_once() {
        let dir = TempDir::new().unwrap();
        let store = CorrelationStore::new(Paths::with_base(dir.path().to_path_buf()));
        store.record("Planner", "default", "M2", "M1").await.unwrap();

        assert_eq!(store.claim("Coder", "default", "M2", "M3").await, None);
        assert_eq!(store.claim("Planner", "default", "M2", "M3").await.as_deref(), Some("M1"));
        assert_eq!(store.claim("Planner", "default", "M2", "M3b").await, None);

        store.settle("Planner", "default", "M2", "M3").await;
        assert_eq!(store.pending("Planner", "default").await, 0);
        assert_eq!(store.claim("Planner", "default", "M2", "M3").await, None);
    }

    #[tokio::test]
    async fn test_claimed_reply_survives_restart() {
        let dir = TempDir::new().unwrap();
        let paths = Paths::with_base(dir.path().to_path_buf());
        {
            let store = CorrelationStore::new(paths.clone());
            store.record("Planner", "default", "M2", "M1").await.unwrap();
            assert_eq!(store.claim("Planner", "default", "M2", "M3").await.as_deref(), Some("M1"));
        }

        let reopened = CorrelationStore::new(paths);
        assert_eq!(reopened.claim("Planner", "default", "M2", "M3").await.as_deref(), Some("M1"));
        assert_eq!(reopened.claim("Planner", "default", "M2", "M9").await, None);
    }

    #[tokio::test]
    async fn test_tables_survive_restart_and_are_per_task() {
        let dir = TempDir::new().unwrap();
        let paths = Paths::with_base(dir.path().to_path_buf());
        {
            let store = CorrelationStore::new(paths.clone());
            store.record("Planner", "t1", "M2", "M1").await.unwrap();
            store.record("Planner", "t2", "M9", "M8").await.unwrap();
        }
        let store = CorrelationStore::new(paths);
        assert_eq!(store.pending("Planner", "t1").await, 1);
        assert_eq!(store.claim("Planner", "t2", "M2", "M3").await, None);
        assert_eq!(store.claim("Planner", "t1", "M2", "M3").await.as_deref(), Some("M1"));
        store.settle("Planner", "t1", "M2", "M3").await;

        // The settlement itself is persisted.
        let reopened = CorrelationStore::new(Paths::with_base(dir.path().to_path_buf()));
        assert_eq!(reopened.pending("Planner", "t1").await, 0);
        assert_eq!(reopened.pending("Planner", "t2").await, 1);
    }

    #[tokio::test]
    async fn test_forget_session_prunes_its_entries() {
        let dir = TempDir::new().unwrap();
        let store = CorrelationStore::new(Paths::with_base(dir.path().to_path_buf()));
        store.record("Planner", "default", "M2", "M1").await.unwrap();
        store.record("Planner", "default", "M5", "M1").await.unwrap();
        store.record("Planner", "default", "M7", "M6").await.unwrap();

        assert_eq!(store.forget_session("Planner", "default", "M1").await, 2);
        assert_eq!(store.pending("Planner", "default").await, 1);
        assert_eq!(store.forget_session("Planner", "default", "M1").await, 0);
    }
}
