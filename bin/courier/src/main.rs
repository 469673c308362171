mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "courier")]
#[command(about = "Mailbox-driven multi-agent runtime", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start every configured agent and relay their mail to the terminal
    Run {
        /// Configuration file (JSON5 or YAML)
        #[arg(short, long, default_value = "courier.json")]
        config: PathBuf,

        /// Refill mailboxes from a snapshot before starting
        #[arg(long)]
        restore: bool,

        /// Snapshot file to restore from (defaults to the storage root's)
        #[arg(long)]
        snapshot: Option<PathBuf>,

        /// Agent to send the initial message to
        #[arg(long, requires = "message")]
        to: Option<String>,

        /// Initial message body, sent as `User`
        #[arg(short, long, requires = "to")]
        message: Option<String>,

        /// Logical task id for the initial message
        #[arg(long)]
        task: Option<String>,
    },

    /// Show configured backends and agents
    Status {
        #[arg(short, long, default_value = "courier.json")]
        config: PathBuf,
    },

    /// Probe every model backend once
    Probe {
        #[arg(short, long, default_value = "courier.json")]
        config: PathBuf,
    },

    /// Inspect a snapshot file
    Snapshot {
        /// Snapshot file
        file: PathBuf,
    },

    /// Show the mail audit log of one day
    Audit {
        #[arg(short, long, default_value = "courier.json")]
        config: PathBuf,

        /// Day to show (YYYY-MM-DD, default today)
        #[arg(long)]
        date: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    if cli.json_logs {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }

    match cli.command {
        Commands::Run {
            config,
            restore,
            snapshot,
            to,
            message,
            task,
        } => {
            let initial = match (to, message) {
                (Some(to), Some(body)) => Some(commands::run_cmd::InitialMail { to, body, task }),
                _ => None,
            };
            commands::run_cmd::run(&config, restore, snapshot, initial).await?;
        }
        Commands::Status { config } => {
            commands::status::run(&config).await?;
        }
        Commands::Probe { config } => {
            commands::probe::run(&config).await?;
        }
        Commands::Snapshot { file } => {
            commands::snapshot_cmd::show(&file).await?;
        }
        Commands::Audit { config, date } => {
            commands::audit_cmd::show(&config, date).await?;
        }
    }

    Ok(())
}
