use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use relay_core::sweep_expired;
use session_auth::{mint_token, TokenConfig};
use shared::domain::{MessageId, UserId};
use storage::{MessageStore, Storage};

/// Operator utilities for the relay database and session tokens.
#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/relay.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a session token for connecting as `user_id`.
    MintToken {
        #[arg(long)]
        user_id: i64,
        #[arg(long)]
        secret: String,
        #[arg(long, default_value_t = 72 * 60 * 60)]
        ttl_seconds: i64,
    },
    /// Delete every message whose expiry has passed.
    Sweep,
    /// Show the stored metadata of one message. Content is not printed.
    ShowMessage {
        #[arg(long)]
        id: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::MintToken {
            user_id,
            secret,
            ttl_seconds,
        } => {
            let token = mint_token(
                &TokenConfig {
                    secret,
                    ttl_seconds,
                },
                UserId(user_id),
            )?;
            println!("{token}");
        }
        Command::Sweep => {
            let storage = open(&cli.database_url).await?;
            let deleted = sweep_expired(&storage, Utc::now()).await?;
            println!("deleted {deleted} expired message(s)");
        }
        Command::ShowMessage { id } => {
            let storage = open(&cli.database_url).await?;
            let message = storage
                .get_by_id(MessageId(id))
                .await?
                .with_context(|| format!("message {id} not found"))?;
            println!(
                "message_id={} sender_id={} receiver_id={} status={} keys={} attachments={} \
                 expires_at={} created_at={}",
                message.message_id,
                message.sender_id,
                message.receiver_id,
                message.status,
                message.keys.len(),
                message.attachments.is_some(),
                message.expires_at.to_rfc3339(),
                message.created_at.to_rfc3339(),
            );
        }
    }

    Ok(())
}

async fn open(database_url: &str) -> Result<Storage> {
    Storage::new(database_url)
        .await
        .with_context(|| format!("failed to open database '{database_url}'"))
}
