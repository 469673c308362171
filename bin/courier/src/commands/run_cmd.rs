use courier_agent::Supervisor;
use courier_core::{Config, Error, Message};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Name the terminal operator is registered under.
const USER: &str = "User";

pub struct InitialMail {
    pub to: String,
    pub body: String,
    pub task: Option<String>,
}

fn print_mail(msg: &Message) {
    println!();
    println!("── mail from {} ──", msg.sender);
    if !msg.subject.is_empty() {
        println!("Subject: {}", msg.subject);
    }
    if let Some(task) = &msg.logical_task_id {
        println!("Task:    {}", task);
    }
    println!("{}", msg.body);
}

pub async fn run(
    config_path: &Path,
    restore: bool,
    snapshot: Option<PathBuf>,
    initial: Option<InitialMail>,
) -> anyhow::Result<()> {
    let config = Config::load(config_path)?;
    let mut supervisor = Supervisor::boot(config).await?;
    let user = supervisor
        .register_external(USER, "The human operator at the terminal")
        .await;

    if let Some(mail) = &initial {
        if !supervisor.agent_names().contains(&mail.to) {
            anyhow::bail!(
                "unknown agent '{}', configured agents: {}",
                mail.to,
                supervisor.agent_names().join(", ")
            );
        }
    }

    if restore || snapshot.is_some() {
        let path = snapshot.unwrap_or_else(|| supervisor.paths().snapshot_file());
        match supervisor.restore_from_file(&path).await {
            Ok(count) => println!("Restored {} message(s) from {}", count, path.display()),
            Err(Error::NotFound(_)) => println!("No snapshot at {}, starting empty", path.display()),
            Err(e) => return Err(e.into()),
        }
    }

    supervisor.start();
    println!(
        "courier running with agents: {} (Ctrl+C to stop)",
        supervisor.agent_names().join(", ")
    );

    if let Some(mail) = initial {
        let msg = Message::new(USER, &mail.to, "", &mail.body).in_task(mail.task.as_deref());
        supervisor.send(msg).await;
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            msg = user.recv_timeout(Duration::from_secs(1)) => {
                if let Some(msg) = msg {
                    print_mail(&msg);
                    user.complete().await;
                }
            }
        }
    }

    info!("Shutdown signal received, draining agents...");
    let path = supervisor.paths().snapshot_file();
    let snapshot = supervisor.shutdown().await?;
    println!(
        "Saved {} pending message(s) to {}",
        snapshot.message_count(),
        path.display()
    );
    Ok(())
}
