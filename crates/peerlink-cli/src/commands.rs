//! CLI command implementations.

use anyhow::{bail, Context, Result};
use peerlink_core::{
    config::NodeConfig,
    link::{parse_target, ConnectionStatus},
    messaging::{NodeEvent, PeerNode, LOCAL_ADDRESS_KEY},
    storage::{Contact, Database, Outbox},
    tor::TransportStatus,
};
use chrono::TimeZone;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Name of the config file inside the data directory.
const CONFIG_FILE: &str = "config.json";

/// Options shared by every command.
pub struct CliOptions {
    data_dir: PathBuf,
    config: Option<PathBuf>,
    tor_binary: Option<String>,
}

impl CliOptions {
    /// Build from parsed arguments.
    pub fn new(data_dir: String, config: Option<String>, tor_binary: Option<String>) -> Self {
        Self {
            data_dir: PathBuf::from(data_dir),
            config: config.map(PathBuf::from),
            tor_binary,
        }
    }

    fn db_path(&self) -> PathBuf {
        NodeConfig::database_path(&self.data_dir)
    }

    fn config_path(&self) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(|| self.data_dir.join(CONFIG_FILE))
    }

    /// Load the node configuration, applying command-line overrides.
    fn node_config(&self) -> Result<NodeConfig> {
        let path = self.config_path();
        let mut config = if path.exists() {
            NodeConfig::load(&path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?
        } else if self.config.is_some() {
            bail!("Config file {} not found", path.display());
        } else {
            NodeConfig::default()
        };

        if let Some(binary) = &self.tor_binary {
            config.transport.binary = PathBuf::from(shellexpand::tilde(binary).as_ref());
        }
        Ok(config)
    }

    /// Open the database, which must already exist.
    fn open_db(&self) -> Result<Database> {
        let path = self.db_path();
        if !path.exists() {
            bail!("No database found. Run 'peerlink init' first.");
        }
        Database::open_path(&path).context("Failed to open database")
    }
}

/// Look a peer up by contact ID, display name or address.
fn resolve_peer(db: &Database, peer: &str) -> Result<String> {
    if let Ok(id) = peer.parse::<i64>() {
        if let Some(contact) = db.get_contact(id)? {
            return Ok(contact.address);
        }
    }

    let contacts = db.list_contacts()?;
    if let Some(contact) = contacts
        .iter()
        .find(|c| c.display_name.as_deref() == Some(peer))
    {
        return Ok(contact.address.clone());
    }

    validate_address(peer)?;
    Ok(peer.to_string())
}

/// Check that an address names a host we could dial.
fn validate_address(address: &str) -> Result<()> {
    parse_target(address).with_context(|| format!("Invalid rendezvous address '{}'", address))?;
    Ok(())
}

fn local_address(db: &Database) -> Result<Option<String>> {
    Ok(db
        .get_setting(LOCAL_ADDRESS_KEY)?
        .and_then(|bytes| String::from_utf8(bytes).ok()))
}

fn label(contact: &Contact) -> String {
    match &contact.display_name {
        Some(name) => format!("{} ({})", name, contact.address),
        None => contact.address.clone(),
    }
}

/// Create the data directory, database and a default config file.
pub fn init(ctx: &CliOptions, force: bool) -> Result<()> {
    std::fs::create_dir_all(&ctx.data_dir).context("Failed to create data directory")?;

    let config_path = ctx.config_path();
    if config_path.exists() && !force {
        println!("Config already exists at {} (use --force to overwrite)", config_path.display());
    } else {
        let config = NodeConfig::default().with_data_dir(&ctx.data_dir);
        let json = serde_json::to_string_pretty(&config).context("Failed to encode config")?;
        std::fs::write(&config_path, json).context("Failed to write config file")?;
        println!("Wrote config to {}", config_path.display());
    }

    Database::open_path(ctx.db_path()).context("Failed to create database")?;
    println!("Database ready at {}", ctx.db_path().display());
    println!("\nRun 'peerlink chat <address>' to start Tor and publish your address.");

    Ok(())
}

/// Show stored node state.
pub fn show_status(ctx: &CliOptions) -> Result<()> {
    let config = ctx.node_config()?;
    println!("Data directory: {}", ctx.data_dir.display());
    println!("Tor binary:     {}", config.transport.binary.display());
    println!(
        "Ports:          socks {}, control {}, listener {}",
        config.transport.socks_port, config.transport.control_port, config.transport.listen_port
    );

    if !ctx.db_path().exists() {
        println!("\nNo database yet. Run 'peerlink init'.");
        return Ok(());
    }

    let db = ctx.open_db()?;
    match local_address(&db)? {
        Some(address) => println!("Address:        {}", address),
        None => println!("Address:        (not published yet)"),
    }

    let contacts = db.list_contacts()?;
    let stats = Outbox::from_connection(db.connection())?.stats()?;
    println!("Contacts:       {}", contacts.len());
    println!(
        "Outbox:         {} pending for {} peer(s), {} sent",
        stats.pending, stats.pending_recipients, stats.sent
    );

    Ok(())
}

/// Add a contact.
pub fn add_contact(ctx: &CliOptions, address: &str, name: Option<&str>) -> Result<()> {
    validate_address(address)?;
    let db = ctx.open_db()?;

    if db.get_contact_by_address(address)?.is_some() {
        bail!("Contact {} already exists", address);
    }

    let id = db
        .add_contact(address, name)
        .context("Failed to add contact")?;
    println!("Added contact #{}: {}", id, name.unwrap_or(address));

    Ok(())
}

/// List contacts.
pub fn list_contacts(ctx: &CliOptions) -> Result<()> {
    let db = ctx.open_db()?;
    let contacts = db.list_contacts()?;

    if contacts.is_empty() {
        println!("No contacts. Add one with 'peerlink add <address>'.");
        return Ok(());
    }

    for contact in contacts {
        println!("  #{:<4} {}", contact.id, label(&contact));
    }

    Ok(())
}

/// Remove a contact.
pub fn remove_contact(ctx: &CliOptions, id: i64) -> Result<()> {
    let db = ctx.open_db()?;
    if !db.remove_contact(id)? {
        bail!("No contact with ID {}", id);
    }
    println!("Removed contact #{}", id);
    Ok(())
}

/// Queue a message. It goes out the next time `chat` connects to the peer.
pub fn send_message(ctx: &CliOptions, peer: &str, message: &str) -> Result<()> {
    let db = ctx.open_db()?;
    let recipient = resolve_peer(&db, peer)?;
    let Some(sender) = local_address(&db)? else {
        bail!("No published address yet. Run 'peerlink chat' once so Tor can create it.");
    };

    let outbox = Outbox::from_connection(db.connection())?;
    let id = outbox
        .enqueue(&sender, &recipient, message.as_bytes())
        .context("Failed to queue message")?;
    db.store_message(&recipient, message, true, chrono::Utc::now().timestamp_millis())?;

    println!("Queued message #{} for {}", id, recipient);
    Ok(())
}

/// Show chat history with a peer.
pub fn show_history(ctx: &CliOptions, peer: &str, limit: u32) -> Result<()> {
    let db = ctx.open_db()?;
    let address = resolve_peer(&db, peer)?;
    let messages = db.messages_for(&address, limit)?;

    println!("Chat history with {} (last {} messages):", address, limit);
    if messages.is_empty() {
        println!("  (no messages)");
    }
    for message in messages {
        println!(
            "  [{}] {} {}",
            format_timestamp(message.timestamp),
            if message.outgoing { ">" } else { "<" },
            message.body
        );
    }

    Ok(())
}

/// Show the outbound queue.
pub fn show_outbox(ctx: &CliOptions) -> Result<()> {
    let db = ctx.open_db()?;
    let outbox = Outbox::from_connection(db.connection())?;
    let stats = outbox.stats()?;

    println!(
        "{} total, {} pending, {} sent",
        stats.total, stats.pending, stats.sent
    );
    for entry in outbox.drain_pending()? {
        println!(
            "  #{:<4} [{}] to {}: {}",
            entry.id,
            format_timestamp(entry.enqueued_at),
            entry.recipient,
            entry.body()
        );
    }

    Ok(())
}

/// Start Tor, open a conversation and relay stdin to the peer.
pub async fn chat(ctx: &CliOptions, peer: &str) -> Result<()> {
    let recipient = {
        let db = ctx.open_db()?;
        resolve_peer(&db, peer)?
    };
    let config = ctx.node_config()?;

    let node = PeerNode::open(config, &ctx.data_dir).context("Failed to open node")?;
    let mut events = node.subscribe();
    node.start().await.context("Failed to start node")?;
    node.open_conversation(&recipient);

    println!("Starting Tor... (type /help for commands, Ctrl+C to quit)");

    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            print_event(&event);
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match line {
                    "/quit" => break,
                    "/help" => {
                        println!("  /status     transport and link status");
                        println!("  /reconnect  redial the peer now");
                        println!("  /rekey      forget the peer's key and accept a new one");
                        println!("  /quit       leave");
                    }
                    "/status" => print_status(&node, &recipient),
                    "/reconnect" => match node.force_reconnect() {
                        Ok(()) => println!("[reconnecting]"),
                        Err(e) => println!("[cannot reconnect: {}]", e),
                    },
                    "/rekey" => match node.reset_handshake(&recipient) {
                        Ok(()) => println!("[handshake reset]"),
                        Err(e) => println!("[cannot reset: {}]", e),
                    },
                    text => match node.send_message(&recipient, text) {
                        Ok(_) => {}
                        Err(e) => println!("[not queued: {}]", e),
                    },
                }
            }
        }
    }

    println!("\nShutting down...");
    printer.abort();
    node.shutdown().await;

    Ok(())
}

fn print_status(node: &PeerNode, peer: &str) {
    let snapshot = node.transport_snapshot();
    println!("  Tor:       {} ({}%)", snapshot.status.describe(), snapshot.bootstrap_percent);
    println!(
        "  Address:   {}",
        node.local_address().unwrap_or_else(|| "(not published)".into())
    );
    println!("  Link:      {:?}", node.connection_status());
    if let Ok(phase) = node.handshake_phase(peer) {
        println!("  Handshake: {:?}", phase);
    }
    if let Ok(stats) = node.outbox_stats() {
        println!("  Outbox:    {} pending", stats.pending);
    }
}

fn print_event(event: &NodeEvent) {
    match event {
        NodeEvent::TransportChanged { status, .. } => match status {
            TransportStatus::Ready => println!("[tor ready]"),
            TransportStatus::Error(_) => println!("[{}]", status.describe()),
            _ => {}
        },
        NodeEvent::LinkChanged(status) => match status {
            ConnectionStatus::Connected => println!("[connected]"),
            ConnectionStatus::Disconnected => println!("[disconnected, retrying]"),
            ConnectionStatus::Failed => println!("[link failed]"),
            _ => {}
        },
        NodeEvent::HandshakeComplete { .. } => println!("[key agreement complete]"),
        NodeEvent::MessageReceived {
            body, timestamp, ..
        } => println!("[{}] < {}", format_timestamp(*timestamp), body),
        NodeEvent::MessageDelivered { id, .. } => println!("[sent #{}]", id),
        NodeEvent::FrameDiscarded { reason } => tracing::debug!(%reason, "Frame discarded"),
    }
}

fn format_timestamp(millis: i64) -> String {
    chrono::Utc
        .timestamp_millis_opt(millis)
        .single()
        .map(|t| t.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "?".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn options(dir: &Path) -> CliOptions {
        CliOptions::new(dir.to_string_lossy().into_owned(), None, None)
    }

    #[test]
    fn test_init_then_queue() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = options(dir.path());

        init(&ctx, false).unwrap();
        assert!(ctx.config_path().exists());
        let config = ctx.node_config().unwrap();
        assert_eq!(config.transport.data_dir, dir.path().join("tor_data"));

        // No address published yet.
        assert!(send_message(&ctx, "ws://b.onion:80/chat", "hi").is_err());

        let db = ctx.open_db().unwrap();
        db.set_setting(LOCAL_ADDRESS_KEY, b"ws://a.onion:80/chat").unwrap();
        db.add_contact("ws://b.onion:80/chat", Some("bob")).unwrap();
        drop(db);

        send_message(&ctx, "bob", "hi").unwrap();
        let db = ctx.open_db().unwrap();
        let pending = Outbox::from_connection(db.connection())
            .unwrap()
            .pending_for("ws://b.onion:80/chat")
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].sender, "ws://a.onion:80/chat");
    }

    #[test]
    fn test_tor_binary_override() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = CliOptions::new(
            dir.path().to_string_lossy().into_owned(),
            None,
            Some("/opt/tor/bin/tor".into()),
        );
        let config = ctx.node_config().unwrap();
        assert_eq!(config.transport.binary, PathBuf::from("/opt/tor/bin/tor"));
    }

    #[test]
    fn test_missing_explicit_config_fails() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = CliOptions::new(
            dir.path().to_string_lossy().into_owned(),
            Some(dir.path().join("nope.json").to_string_lossy().into_owned()),
            None,
        );
        assert!(ctx.node_config().is_err());
    }
}
