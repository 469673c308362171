use chrono::Utc;
use courier_core::{Message, Paths, Result};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use tracing::error;

/// Append-only record of mail passing through the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEvent {
    Dispatched {
        message: Message,
        timestamp_ms: i64,
    },
    Delivered {
        message_id: String,
        recipient: String,
        timestamp_ms: i64,
    },
    Dropped {
        message: Message,
        reason: String,
        timestamp_ms: i64,
    },
}

pub struct AuditLogger {
    paths: Paths,
}

impl AuditLogger {
    pub fn new(paths: Paths) -> Self {
        Self { paths }
    }

    pub fn log_dispatched(&self, message: &Message) -> Result<()> {
        self.write_event(&AuditEvent::Dispatched {
            message: message.clone(),
            timestamp_ms: Utc::now().timestamp_millis(),
        })
    }

    pub fn log_delivered(&self, message: &Message) -> Result<()> {
        self.write_event(&AuditEvent::Delivered {
            message_id: message.id.clone(),
            recipient: message.recipient.clone(),
            timestamp_ms: Utc::now().timestamp_millis(),
        })
    }

    pub fn log_dropped(&self, message: &Message, reason: &str) -> Result<()> {
        self.write_event(&AuditEvent::Dropped {
            message: message.clone(),
            reason: reason.to_string(),
            timestamp_ms: Utc::now().timestamp_millis(),
        })
    }

    fn write_event(&self, event: &AuditEvent) -> Result<()> {
        let log_file = self.current_log_file_path();

        if let Some(parent) = log_file.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)?;

        let json = serde_json::to_string(event)?;
        writeln!(file, "{}", json)?;

        Ok(())
    }

    fn current_log_file_path(&self) -> PathBuf {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        self.paths.audit_dir().join(format!("{}.jsonl", today))
    }

    /// Read audit events from a specific date (`YYYY-MM-DD`).
    pub fn read_events(&self, date: &str) -> Result<Vec<AuditEvent>> {
        let log_file = self.paths.audit_dir().join(format!("{}.jsonl", date));

        if !log_file.exists() {
            return Ok(Vec::new());
        }

        let content = std::fs::read_to_string(&log_file)?;
        let mut events = Vec::new();

        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<AuditEvent>(line) {
                Ok(event) => events.push(event),
                Err(e) => {
                    error!(error = %e, line = %line, "Failed to parse audit event");
                }
            }
        }

        Ok(events)
    }

    pub fn read_today(&self) -> Result<Vec<AuditEvent>> {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        self.read_events(&today)
    }

    /// Messages dispatched on `date`, in dispatch order, for replay.
    pub fn dispatched_on(&self, date: &str) -> Result<Vec<Message>> {
        Ok(self
            .read_events(date)?
            .into_iter()
            .filter_map(|e| match e {
                AuditEvent::Dispatched { message, .. } => Some(message),
                _ => None,
            })
            .collect())
    }
}
