//! Parley CLI - Headless Chat Client
//!
//! Drives the parley core from a terminal: sends one message and streams the
//! reply to stdout, or prints a conversation's history.
//!
//! # Usage
//!
//! ```bash
//! # Start a new conversation
//! parley "What is a borrow checker?"
//!
//! # Continue an existing conversation
//! parley --conversation 65a1f0c2e4b0a1b2c3d4e5f6 "And lifetimes?"
//!
//! # Print a conversation's history
//! parley --conversation 65a1f0c2e4b0a1b2c3d4e5f6
//!
//! # Verbose logging (logs go to stderr)
//! RUST_LOG=debug parley "Hello"
//! ```
//!
//! # Signals
//!
//! - `SIGINT`: Cancel the streaming reply and exit

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use parley_core::{
    load_config_from_path, ConfigOverrides, ConversationId, ConversationStore,
    FileKeyValueStore, HttpChatApi, PersistedState, PromptType, SessionState, StoreEvent,
};

/// Parley - headless chat client
#[derive(Parser, Debug)]
#[command(name = "parley")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Message to send; without one, the conversation history is printed
    message: Option<String>,

    /// Conversation to continue (a new one is created otherwise)
    #[arg(short = 'C', long, value_name = "ID")]
    conversation: Option<String>,

    /// Configuration file path
    #[arg(short = 'c', long, env = "PARLEY_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Chat API base URL
    #[arg(long, value_name = "URL")]
    base_url: Option<String>,

    /// Bearer token (stored for later runs)
    #[arg(long, env = "PARLEY_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Prompt type sent with the message
    #[arg(short = 'p', long, default_value = "default")]
    prompt_type: String,

    /// Seconds to wait for the first byte of a reply
    #[arg(long, value_name = "SECS")]
    first_byte_timeout: Option<u64>,

    /// Keep state in memory only
    #[arg(long)]
    ephemeral: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "PARLEY_LOG_LEVEL", default_value = "warn")]
    log_level: String,
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("parley={level},parley_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

fn persisted_state(ephemeral: bool) -> PersistedState {
    if ephemeral {
        return PersistedState::in_memory();
    }
    match FileKeyValueStore::default_path() {
        Some(path) => {
            info!(path = %path.display(), "Using state file");
            PersistedState::new(Arc::new(FileKeyValueStore::new(path)))
        }
        None => {
            warn!("No data directory available, state will not persist");
            PersistedState::in_memory()
        }
    }
}

/// Print the part of the streaming reply not printed yet
struct ReplyPrinter {
    conversation_id: ConversationId,
    printed: String,
}

impl ReplyPrinter {
    fn new(conversation_id: ConversationId) -> Self {
        Self {
            conversation_id,
            printed: String::new(),
        }
    }

    fn refresh(&mut self, store: &ConversationStore) -> Result<()> {
        let Some(reply) = store
            .messages(&self.conversation_id)
            .into_iter()
            .rev()
            .find(|m| !m.is_user)
        else {
            return Ok(());
        };

        let mut stdout = std::io::stdout().lock();
        match reply.text.strip_prefix(self.printed.as_str()) {
            Some(rest) if !rest.is_empty() => write!(stdout, "{rest}")?,
            Some(_) => return Ok(()),
            // The server rewrote the text; start over on a fresh line
            None => write!(stdout, "\n{}", reply.text)?,
        }
        stdout.flush()?;
        self.printed = reply.text;
        Ok(())
    }
}

async fn print_history(store: &ConversationStore, id: &ConversationId) -> Result<()> {
    let messages = store
        .select_conversation(id)
        .await
        .with_context(|| format!("Failed to load conversation {id}"))?;

    for message in messages {
        let author = if message.is_user { "you" } else { "assistant" };
        println!("[{}] {author}: {}", message.timestamp.format("%Y-%m-%d %H:%M"), message.text);
    }
    Ok(())
}

async fn send(store: &ConversationStore, args: &Args, text: &str) -> Result<()> {
    let mut events = store.subscribe();
    let prompt_type: PromptType = args.prompt_type.parse().unwrap_or_default();
    let conversation_id = args.conversation.as_deref().map(ConversationId::new);

    let ticket = store
        .send_message(conversation_id, text, Vec::new(), prompt_type)
        .await
        .context("Message rejected")?;
    info!(conversation_id = %ticket.conversation_id, "Message sent");

    let mut printer = ReplyPrinter::new(ticket.conversation_id.clone());
    let finished = ticket.handle.finished();
    tokio::pin!(finished);

    let state = loop {
        tokio::select! {
            state = &mut finished => break state,
            _ = tokio::signal::ctrl_c() => {
                store.cancel_stream();
                eprintln!("\n(cancelled)");
                break SessionState::Cancelled;
            }
            event = events.recv() => match event {
                Ok(StoreEvent::Changed { conversation_id }) if conversation_id == ticket.conversation_id => {
                    printer.refresh(store)?;
                }
                Ok(StoreEvent::Alert(message)) => eprintln!("\n{message}"),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Renderer fell behind");
                    printer.refresh(store)?;
                }
                Err(RecvError::Closed) => break ticket.handle.state(),
            },
        }
    };

    // Alerts published by the final callback are already queued
    while let Ok(event) = events.try_recv() {
        if let StoreEvent::Alert(message) = event {
            eprintln!("\n{message}");
        }
    }

    printer.refresh(store)?;
    println!();
    eprintln!("conversation: {}", ticket.conversation_id);

    match state {
        SessionState::Failed => anyhow::bail!("The reply could not be delivered; please try again"),
        _ => Ok(()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let config_path = args.config.clone().or_else(parley_core::default_config_path);
    let mut config = load_config_from_path(config_path).context("Failed to load configuration")?;

    let mut overrides = ConfigOverrides::new();
    if let Some(ref url) = args.base_url {
        overrides = overrides.with_base_url(url.clone());
    }
    if let Some(secs) = args.first_byte_timeout {
        overrides = overrides.with_first_byte_timeout_secs(secs);
    }
    overrides.apply(&mut config);
    info!(base_url = %config.api.base_url, source = %config.source(), "Configuration loaded");

    let persisted = persisted_state(args.ephemeral);
    if let Some(ref token) = args.token {
        persisted
            .set_auth_token(Some(token))
            .await
            .context("Failed to store token")?;
    }
    let token = persisted.auth_token().await.context("Failed to read token")?;

    let api = HttpChatApi::from_config(&config.api).context("Failed to create HTTP client")?;
    api.set_token(token);

    let store = ConversationStore::new(Arc::new(api), &config, persisted);
    store.restore().await.context("Failed to restore state")?;
    let sweeper = store.spawn_cache_sweeper();

    let result = match (args.message.as_deref(), args.conversation.as_deref()) {
        (Some(text), _) => send(&store, &args, text).await,
        (None, Some(id)) => print_history(&store, &ConversationId::new(id)).await,
        (None, None) => Err(anyhow::anyhow!("Nothing to do: pass a message or --conversation")),
    };

    sweeper.abort();
    if let Err(ref e) = result {
        error!(error = %e, "Command failed");
    }
    result
}
