//! chatlink
//!
//! Command-line front end for a chat session: type messages, watch the
//! agent's reply stream in as it is generated.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::oneshot;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use chatlink_client::config::{self, ClientConfig};
use chatlink_client::{ClientEvent, ConnectionManager, ErrorEvent, EventBus, EventKind};

#[derive(Parser)]
#[command(name = "chatlink")]
#[command(about = "chatlink - Real-time chat session client")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Base address of the chat service, e.g. https://chat.example.com
    #[arg(short, long, global = true)]
    server: Option<String>,

    #[arg(long, global = true)]
    session: Option<String>,

    #[arg(long, global = true)]
    token: Option<String>,

    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive session (default)
    Chat,

    /// Send one message and print the streamed reply
    Send {
        message: String,

        /// Seconds to wait for the reply
        #[arg(long, default_value_t = 120)]
        timeout: u64,
    },

    GenerateConfig {
        #[arg(short, long, default_value = "chatlink.toml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if rustls::crypto::ring::default_provider().install_default().is_err() {
        warn!("TLS crypto provider was already installed");
    }

    if let Some(Commands::GenerateConfig { output }) = &cli.command {
        return generate_config(output);
    }

    let config_path = cli.config.clone().unwrap_or_else(ClientConfig::default_path);
    let mut config = if config_path.exists() {
        ClientConfig::load(&config_path)?
    } else {
        ClientConfig::default()
    };

    if let Some(server) = cli.server {
        config.connection.base_address = server;
    }
    if let Some(session) = cli.session {
        config.connection.session_id = session;
    }
    if let Some(token) = cli.token {
        config.connection.token = token;
    }

    match cli.command {
        Some(Commands::Chat) | None => run_chat(config).await,
        Some(Commands::Send { message, timeout }) => {
            run_send(config, &message, Duration::from_secs(timeout)).await
        }
        Some(Commands::GenerateConfig { .. }) => Ok(()),
    }
}

fn print_flush(text: &str) {
    let mut stdout = std::io::stdout().lock();
    let _ = stdout.write_all(text.as_bytes());
    let _ = stdout.flush();
}

async fn run_chat(mut config: ClientConfig) -> Result<()> {
    info!("Starting chatlink v{}", env!("CARGO_PKG_VERSION"));
    config.connection.auto_connect = true;

    let events = Arc::new(EventBus::new());
    events.on(EventKind::StreamToken, |event| {
        if let ClientEvent::StreamToken { token, .. } = event {
            print_flush(token);
        }
    });
    events.on(EventKind::StreamEnd, |_| println!());
    events.on(EventKind::StreamError, |event| {
        if let ClientEvent::StreamError { error, .. } = event {
            eprintln!("\n[reply failed: {}]", error);
        }
    });
    events.on(EventKind::Error, |event| {
        if let ClientEvent::Error(ErrorEvent::Server(payload)) = event {
            eprintln!("[server error: {}]", payload);
        }
    });
    events.on(EventKind::StateChange, |event| {
        if let ClientEvent::StateChange(info) = event {
            eprintln!("[{}]", info.status);
        }
    });

    let manager = ConnectionManager::with_events(config, events)
        .context("Failed to start connection")?;

    println!("Type a message and press enter. Commands: /status, /quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let input = line.trim();
        if input.is_empty() {
            continue;
        }

        match input {
            "/quit" | "/exit" => break,
            "/status" => {
                let info = manager.info();
                println!(
                    "Status: {}  reconnect attempts: {}  last connected: {}",
                    info.status,
                    info.reconnect_attempts,
                    info.last_connected_at
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "never".to_string())
                );
            }
            _ if input.starts_with('/') => {
                println!("Unknown command: {}", input);
            }
            _ => {
                manager.send_message(input, None)?;
            }
        }
    }

    manager.disconnect()?;
    // Give the connection task a moment to write the close frame.
    tokio::time::sleep(Duration::from_millis(200)).await;
    Ok(())
}

/// Follows the first reply stream seen after the message goes out and
/// ignores any other stream on the session.
#[derive(Debug, Default)]
struct ReplyTracker {
    message_id: Option<String>,
}

#[derive(Debug, PartialEq)]
enum ReplyProgress {
    Ignored,
    Token(String),
    Done(std::result::Result<(), String>),
}

impl ReplyTracker {
    fn observe(&mut self, event: &ClientEvent) -> ReplyProgress {
        match event {
            ClientEvent::StreamStart { message_id } => {
                self.claim(message_id);
                ReplyProgress::Ignored
            }
            // A token without a start still begins the reply.
            ClientEvent::StreamToken { message_id, token, .. } if self.claim(message_id) => {
                ReplyProgress::Token(token.clone())
            }
            ClientEvent::StreamEnd { message_id, .. } if self.is_reply(message_id) => {
                ReplyProgress::Done(Ok(()))
            }
            ClientEvent::StreamError { message_id, error } if self.is_reply(message_id) => {
                ReplyProgress::Done(Err(error.to_string()))
            }
            _ => ReplyProgress::Ignored,
        }
    }

    /// Adopt `message_id` if no reply is tracked yet; true if it is the reply.
    fn claim(&mut self, message_id: &str) -> bool {
        self.message_id.get_or_insert_with(|| message_id.to_string()).as_str() == message_id
    }

    fn is_reply(&self, message_id: &str) -> bool {
        self.message_id.as_deref() == Some(message_id)
    }
}

async fn run_send(mut config: ClientConfig, message: &str, timeout: Duration) -> Result<()> {
    config.connection.auto_connect = true;

    let (done_tx, done_rx) = oneshot::channel::<std::result::Result<(), String>>();
    let done_tx = Arc::new(Mutex::new(Some(done_tx)));
    let tracker = Arc::new(Mutex::new(ReplyTracker::default()));

    let handler = move |event: &ClientEvent| {
        let progress = tracker.lock().observe(event);
        match progress {
            ReplyProgress::Token(token) => print_flush(&token),
            ReplyProgress::Done(outcome) => {
                println!();
                if let Some(tx) = done_tx.lock().take() {
                    let _ = tx.send(outcome);
                }
            }
            ReplyProgress::Ignored => {}
        }
    };

    let events = Arc::new(EventBus::new());
    for kind in [
        EventKind::StreamStart,
        EventKind::StreamToken,
        EventKind::StreamEnd,
        EventKind::StreamError,
    ] {
        events.on(kind, handler.clone());
    }

    let manager = ConnectionManager::with_events(config, events)
        .context("Failed to start connection")?;
    let message_id = manager.send_message(message, None)?;
    info!(%message_id, "Message sent");

    let outcome = tokio::time::timeout(timeout, done_rx).await;
    manager.disconnect()?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    match outcome {
        Ok(Ok(Ok(()))) => Ok(()),
        Ok(Ok(Err(error))) => anyhow::bail!("Reply failed: {}", error),
        Ok(Err(_)) => anyhow::bail!("Connection closed before the reply finished"),
        Err(_) => anyhow::bail!("No reply within {}s", timeout.as_secs()),
    }
}

fn generate_config(output: &PathBuf) -> Result<()> {
    let config_content = config::generate_example_config();
    std::fs::write(output, config_content)
        .with_context(|| format!("Failed to write config file: {:?}", output))?;
    println!("Generated example config: {:?}", output);
    Ok(())
}
