use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast;
use tracing::{info, warn};

use parley_client::config::default_data_dir;
use parley_client::{
    ClientConfig, ConnectionManager, ConnectionTarget, ControllerDeps, ConversationController,
    ConversationEvent, RestApi, StaticToken, WsConnector,
};
use parley_crypto::{KeyState, KeyStore};
use parley_protocol::{Message, UserId};
use parley_store::{FileStore, KvStore, MessageCache};

/// Used when RUST_LOG is unset. Covers every workspace crate that logs.
const DEFAULT_LOG_FILTER: &str =
    "parley=info,parley_client=info,parley_crypto=info,parley_store=info,parley_protocol=warn";

/// How long one-shot commands wait for the relay.
const RELAY_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Parser)]
#[command(name = "parley", about = "End-to-end encrypted messaging client")]
struct Args {
    /// Path to configuration file (TOML). Defaults to parley.toml in the data dir
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Identity to act as
    #[arg(short, long, env = "PARLEY_USER_ID")]
    user_id: UserId,

    /// Access token for the relay and REST API
    #[arg(short, long, env = "PARLEY_TOKEN", hide_env_values = true)]
    token: String,

    /// Relay origin, overrides config
    #[arg(long)]
    endpoint: Option<String>,

    /// REST API base URL, overrides config
    #[arg(long)]
    api: Option<String>,

    /// Data directory for keys and cached messages, overrides config
    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Make sure this identity has a keypair and its public key is published
    Keys,
    /// Print incoming messages until interrupted
    Listen,
    /// Send one message
    Send {
        #[arg(long)]
        to: UserId,
        text: String,
    },
    /// List cached threads
    Threads,
    /// Open a thread and print its history
    History {
        #[arg(long)]
        with: UserId,
        #[arg(long, default_value_t = 1)]
        page: u32,
    },
    /// Remove this identity's keys and cached messages from this device
    Logout,
}

struct App {
    config: ClientConfig,
    user_id: UserId,
    token: String,
    store: Arc<dyn KvStore>,
    api: Arc<RestApi>,
    keys: Arc<KeyStore>,
}

impl App {
    async fn ensure_keys(&self) -> Result<KeyState> {
        let state = self
            .keys
            .ensure_for_user(self.user_id, &self.token)
            .await
            .context("failed to prepare identity keys")?;
        if state != KeyState::Uploaded {
            warn!(user_id = self.user_id, ?state, "public key not published yet, will retry next run");
        }
        Ok(state)
    }

    fn start_controller(&self, manager: &ConnectionManager) -> ConversationController {
        let target = ConnectionTarget {
            endpoint: self.config.endpoint.clone(),
            path: self.config.socket_path.clone(),
            user_id: self.user_id,
            tokens: Arc::new(StaticToken::new(self.token.clone())),
        };
        ConversationController::start(
            manager,
            target,
            ControllerDeps {
                keys: self.keys.clone(),
                store: self.store.clone(),
                history: self.api.clone(),
                retention: self.config.retention,
                page_size: self.config.history_page_size,
            },
        )
    }

    fn cache(&self) -> MessageCache {
        MessageCache::new(self.store.clone(), self.user_id, self.config.retention)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .init();

    let args = Args::parse();

    // Load config
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| default_data_dir().join("parley.toml"));
    let mut config = ClientConfig::load_or_default(&config_path)
        .with_context(|| format!("failed to load config: {}", config_path.display()))?;

    // CLI overrides
    if let Some(endpoint) = args.endpoint {
        config.endpoint = endpoint;
    }
    if let Some(api) = args.api {
        config.api_base_url = api;
    }
    if let Some(dir) = args.data_dir {
        config.data_dir = Some(dir);
    }
    config.validate().context("invalid configuration")?;

    let data_dir = config.resolved_data_dir();
    info!(
        user_id = args.user_id,
        endpoint = %config.endpoint,
        data_dir = %data_dir.display(),
        "parley starting"
    );

    let store: Arc<dyn KvStore> = Arc::new(FileStore::new(data_dir));
    let api = Arc::new(RestApi::new(&config.api_base_url).context("invalid API base URL")?);
    let keys = Arc::new(
        KeyStore::new(store.clone(), api.clone())
            .with_key_bits(config.key_bits)
            .with_progress(|user_id, step| info!(user_id, ?step, "key generation")),
    );

    let app = App {
        config,
        user_id: args.user_id,
        token: args.token,
        store,
        api,
        keys,
    };
    let manager = ConnectionManager::new(Arc::new(WsConnector), app.config.transport.clone());

    let result = match args.command {
        Command::Keys => {
            let state = app.ensure_keys().await?;
            println!("identity {}: {:?}", app.user_id, state);
            Ok(())
        }
        Command::Listen => listen(&app, &manager).await,
        Command::Send { to, text } => send(&app, &manager, to, &text).await,
        Command::Threads => {
            let threads = app.cache().load_thread_index().await;
            if threads.is_empty() {
                println!("no cached threads");
            }
            let mut by_recency: Vec<_> = threads.values().collect();
            by_recency.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
            for thread in by_recency {
                println!(
                    "{:>8}  {:<20} unread={:<3} {}  {}",
                    thread.other_user_id,
                    thread.display_name,
                    thread.unread_count,
                    thread.updated_at.format("%Y-%m-%d %H:%M"),
                    thread.last_preview_text
                );
            }
            Ok(())
        }
        Command::History { with, page } => history(&app, &manager, with, page).await,
        Command::Logout => {
            app.keys.forget(app.user_id).await.context("failed to remove keys")?;
            app.cache().clear().await.context("failed to clear message cache")?;
            println!("removed local data for identity {}", app.user_id);
            Ok(())
        }
    };

    manager.shutdown();
    result
}

fn print_message(message: &Message) {
    let who = if message.mine {
        "me".to_string()
    } else {
        message.author_id.to_string()
    };
    println!(
        "[{}] {:>8}: {}",
        message.created_at.format("%Y-%m-%d %H:%M:%S"),
        who,
        message.text
    );
}

async fn listen(app: &App, manager: &ConnectionManager) -> Result<()> {
    app.ensure_keys().await?;
    let controller = app.start_controller(manager);
    let mut events = controller.subscribe();
    info!(user_id = app.user_id, "listening, press Ctrl-C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                return Ok(());
            }
            event = events.recv() => match event {
                Ok(ConversationEvent::MessageReceived { other, message }) => {
                    print!("({other}) ");
                    print_message(&message);
                }
                Ok(ConversationEvent::Connection(state)) => info!(?state, "relay connection"),
                Ok(ConversationEvent::SendFailed { code, message }) => {
                    warn!(code = %code, "relay error: {}", message);
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            }
        }
    }
}

async fn send(app: &App, manager: &ConnectionManager, to: UserId, text: &str) -> Result<()> {
    app.ensure_keys().await?;
    let controller = app.start_controller(manager);
    let mut events = controller.subscribe();

    tokio::time::timeout(RELAY_TIMEOUT, controller.connection().ready())
        .await
        .context("timed out connecting to relay")?
        .context("relay connection closed")?;
    controller
        .send_text(to, text)
        .await
        .with_context(|| format!("failed to send to {to}"))?;

    let outcome = tokio::time::timeout(RELAY_TIMEOUT, async {
        loop {
            match events.recv().await {
                Ok(ConversationEvent::Accepted { message_id }) => return Ok(message_id),
                Ok(ConversationEvent::SendFailed { code, message }) => {
                    bail!("relay rejected message ({code}): {message}")
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => bail!("controller stopped"),
            }
        }
    })
    .await
    .context("timed out waiting for the relay to accept the message")??;

    match outcome {
        Some(id) => println!("sent, message id {id}"),
        None => println!("sent"),
    }
    Ok(())
}

async fn history(app: &App, manager: &ConnectionManager, with: UserId, page: u32) -> Result<()> {
    if page == 0 {
        bail!("pages start at 1");
    }
    app.ensure_keys().await?;
    let controller = app.start_controller(manager);
    let mut events = controller.subscribe();
    controller.open_thread(with, None).await?;
    if page > 1 {
        controller.load_older(page)?;
    }

    let (messages, next_page) = tokio::time::timeout(RELAY_TIMEOUT, async {
        loop {
            match events.recv().await {
                Ok(ConversationEvent::HistoryLoaded {
                    other,
                    messages,
                    next_page,
                }) if other == with => return Ok((messages, next_page)),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => bail!("controller stopped"),
            }
        }
    })
    .await
    .context("timed out loading history")??;

    for message in &messages {
        print_message(message);
    }
    if let Some(next) = next_page {
        println!("-- older messages: --page {next}");
    }
    Ok(())
}
