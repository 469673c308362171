use chrono::{TimeZone, Utc};
use courier_core::Config;
use courier_storage::{AuditEvent, AuditLogger};
use std::path::Path;

fn clock(timestamp_ms: i64) -> String {
    Utc.timestamp_millis_opt(timestamp_ms)
        .single()
        .map(|t| t.format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "--:--:--".to_string())
}

pub async fn show(config_path: &Path, date: Option<String>) -> anyhow::Result<()> {
    let config = Config::load(config_path)?;
    let logger = AuditLogger::new(config.paths());
    let date = date.unwrap_or_else(|| Utc::now().format("%Y-%m-%d").to_string());
    let events = logger.read_events(&date)?;

    if events.is_empty() {
        println!("No mail recorded on {}", date);
        return Ok(());
    }

    println!("Mail on {} ({} events)", date, events.len());
    for event in events {
        match event {
            AuditEvent::Dispatched { message, timestamp_ms } => println!(
                "{}  sent       {}  {} → {}  {}",
                clock(timestamp_ms),
                message.id,
                message.sender,
                message.recipient,
                message.subject
            ),
            AuditEvent::Delivered {
                message_id,
                recipient,
                timestamp_ms,
            } => println!(
                "{}  delivered  {}  → {}",
                clock(timestamp_ms),
                message_id,
                recipient
            ),
            AuditEvent::Dropped {
                message,
                reason,
                timestamp_ms,
            } => println!(
                "{}  dropped    {}  {} → {}  ({})",
                clock(timestamp_ms),
                message.id,
                message.sender,
                message.recipient,
                reason
            ),
        }
    }
    Ok(())
}
