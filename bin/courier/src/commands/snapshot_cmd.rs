use courier_agent::Snapshot;
use std::path::Path;

pub async fn show(path: &Path) -> anyhow::Result<()> {
    let snapshot = Snapshot::load(path).await?;

    println!("Snapshot taken {}", snapshot.timestamp.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("{} pending message(s)", snapshot.message_count());
    println!();

    for (agent, state) in &snapshot.agents {
        let in_flight = state.extra_state.get("in_flight").and_then(|v| v.as_str());
        println!("{} ({} queued)", agent, state.mailbox.len());
        for msg in &state.mailbox {
            let marker = if Some(msg.id.as_str()) == in_flight { "▶" } else { " " };
            println!("  {} {}  from {}  {}", marker, msg.id, msg.sender, msg.subject);
        }
    }

    if !snapshot.broker_undelivered.is_empty() {
        println!();
        println!("Undelivered ({})", snapshot.broker_undelivered.len());
        for msg in &snapshot.broker_undelivered {
            println!("    {}  {} → {}  {}", msg.id, msg.sender, msg.recipient, msg.subject);
        }
    }
    Ok(())
}
