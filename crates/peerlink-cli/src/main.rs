//! peerlink command-line interface
//!
//! A terminal chat client for one conversation at a time over an
//! onion-routed transport.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

use commands::CliOptions;

/// peerlink - serverless chat over Tor
#[derive(Parser)]
#[command(name = "peerlink")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Data directory path
    #[arg(short, long, default_value = "~/.peerlink")]
    data_dir: String,

    /// Configuration file (defaults to <data-dir>/config.json when present)
    #[arg(short, long)]
    config: Option<String>,

    /// Tor executable to launch
    #[arg(long)]
    tor_binary: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the data directory, database and a default config file
    Init {
        /// Overwrite an existing config file
        #[arg(short, long)]
        force: bool,
    },

    /// Show stored node state
    Status,

    /// Add a contact
    Add {
        /// Contact's rendezvous address
        address: String,

        /// Display name for contact
        #[arg(short, long)]
        name: Option<String>,
    },

    /// List contacts
    Contacts,

    /// Remove a contact
    Remove {
        /// Contact ID
        id: i64,
    },

    /// Queue a message for delivery the next time the peer is reachable
    Send {
        /// Contact ID, name or rendezvous address
        peer: String,

        /// Message text
        message: String,
    },

    /// Show chat history with a contact
    History {
        /// Contact ID, name or rendezvous address
        peer: String,

        /// Number of messages to show
        #[arg(short, long, default_value = "50")]
        limit: u32,
    },

    /// Show the outbound queue
    Outbox,

    /// Start Tor and chat with a peer
    Chat {
        /// Contact ID, name or rendezvous address
        peer: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    // Expand paths
    let data_dir = shellexpand::tilde(&cli.data_dir).to_string();
    let config = cli
        .config
        .as_deref()
        .map(|path| shellexpand::tilde(path).to_string());

    let ctx = CliOptions::new(data_dir, config, cli.tor_binary);

    // If no command specified, show status
    let command = cli.command.unwrap_or(Commands::Status);

    match command {
        Commands::Init { force } => {
            commands::init(&ctx, force)?;
        }
        Commands::Status => {
            commands::show_status(&ctx)?;
        }
        Commands::Add { address, name } => {
            commands::add_contact(&ctx, &address, name.as_deref())?;
        }
        Commands::Contacts => {
            commands::list_contacts(&ctx)?;
        }
        Commands::Remove { id } => {
            commands::remove_contact(&ctx, id)?;
        }
        Commands::Send { peer, message } => {
            commands::send_message(&ctx, &peer, &message)?;
        }
        Commands::History { peer, limit } => {
            commands::show_history(&ctx, &peer, limit)?;
        }
        Commands::Outbox => {
            commands::show_outbox(&ctx)?;
        }
        Commands::Chat { peer } => {
            commands::chat(&ctx, &peer).await?;
        }
    }

    Ok(())
}
