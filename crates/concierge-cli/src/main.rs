use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use concierge_channels::{DispatchQueue, Dispatcher, LogDelivery, WebhookDelivery};
use concierge_core::completion::{CompletionService, FailoverCompletion, OpenAiCompletionClient};
use concierge_core::gateway::{DeliveryGateway, MemoryService, MessageStore, NoopMemory};
use concierge_core::types::{MessageStatus, NewMessage, ProcessResult};
use concierge_core::{AgentFactory, Orchestrator};
use concierge_store::{KeywordMemory, SqliteStore};
use config::{ConciergeConfig, DeliveryKind};

#[derive(Parser)]
#[command(name = "concierge")]
#[command(version)]
#[command(about = "Concierge: agent orchestration for customer messaging")]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize config directory and default config
    Init,

    /// Show current configuration (secrets masked)
    Config,

    /// Manage agent definitions
    Agents {
        #[command(subcommand)]
        command: AgentsCommand,
    },

    /// Manage contacts
    Contact {
        #[command(subcommand)]
        command: ContactCommand,
    },

    /// Store an inbound message and process it immediately
    Ingest {
        /// Contact id the message is from
        #[arg(long)]
        contact: String,
        /// Message text
        text: String,
    },

    /// Process a stored message by id
    Process { id: String },

    /// Reset a message to pending and process it again
    Reprocess { id: String },

    /// List recent messages
    Messages {
        /// Only messages with this status (pending, processing, sent, delivered, failed, read)
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Run the dispatcher, processing pending messages until Ctrl+C
    Start,
}

#[derive(Subcommand)]
enum AgentsCommand {
    /// List stored agents
    List,
    /// Upsert the [[agents]] tables of a TOML file into the store
    Import { file: PathBuf },
}

#[derive(Subcommand)]
enum ContactCommand {
    /// Add a contact
    Add {
        name: String,
        /// Channel address (phone number, chat id, email)
        address: String,
    },
    /// List contacts
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --debug
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if cli.debug { "debug" } else { "info" }));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Init => cmd_init().await,
        Commands::Config => cmd_config(&cli.config).await,
        Commands::Agents { command } => cmd_agents(&cli.config, command).await,
        Commands::Contact { command } => cmd_contact(&cli.config, command).await,
        Commands::Ingest { contact, text } => cmd_ingest(&cli.config, &contact, &text).await,
        Commands::Process { id } => cmd_process(&cli.config, &id, false).await,
        Commands::Reprocess { id } => cmd_process(&cli.config, &id, true).await,
        Commands::Messages { status, limit } => cmd_messages(&cli.config, status.as_deref(), limit).await,
        Commands::Start => cmd_start(&cli.config).await,
    }
}

async fn cmd_init() -> Result<()> {
    let config_dir = config::config_dir();
    tokio::fs::create_dir_all(&config_dir)
        .await
        .with_context(|| format!("Failed to create config dir: {}", config_dir.display()))?;

    let config_path = config_dir.join("config.toml");
    if config_path.exists() {
        warn!("Config already exists at {}", config_path.display());
    } else {
        let default_config = include_str!("../../../config/default.toml");
        tokio::fs::write(&config_path, default_config).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&config_path, std::fs::Permissions::from_mode(0o600)).await?;
        }
        info!("Created default config at {}", config_path.display());
    }

    let agents_path = config_dir.join("agents.toml");
    if !agents_path.exists() {
        tokio::fs::write(&agents_path, include_str!("../../../config/agents.example.toml")).await?;
        info!("Created example agents at {}", agents_path.display());
    }

    println!("Concierge initialized at {}", config_dir.display());
    println!("Edit {} to configure your API keys and delivery.", config_path.display());
    println!("Then run: concierge agents import {}", agents_path.display());
    Ok(())
}

async fn cmd_config(config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = ConciergeConfig::load(config_path)?;
    println!("{}", toml::to_string_pretty(&cfg.redacted())?);
    Ok(())
}

fn open_store(cfg: &ConciergeConfig) -> Result<SqliteStore> {
    let db_path = config::expand_home(&cfg.store.path);
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create data dir: {}", parent.display()))?;
    }
    SqliteStore::open(&db_path)
}

async fn cmd_agents(config_path: &Option<PathBuf>, command: AgentsCommand) -> Result<()> {
    let cfg = ConciergeConfig::load(config_path)?;
    let store = open_store(&cfg)?;

    match command {
        AgentsCommand::List => {
            let agents = store.list_agents().await?;
            if agents.is_empty() {
                println!("No agents. Import some with `concierge agents import <file>`.");
            }
            for agent in agents {
                println!(
                    "{:<20} {:<11} {:<7} {:<8} {}",
                    agent.id,
                    agent.agent_type,
                    agent.priority,
                    if agent.enabled { "enabled" } else { "disabled" },
                    agent.name
                );
            }
        }
        AgentsCommand::Import { file } => {
            let agents = config::load_agents_file(&file)?;
            for agent in &agents {
                store.upsert_agent(agent).await?;
            }
            println!("Imported {} agent(s) from {}", agents.len(), file.display());
        }
    }
    Ok(())
}

async fn cmd_contact(config_path: &Option<PathBuf>, command: ContactCommand) -> Result<()> {
    let cfg = ConciergeConfig::load(config_path)?;
    let store = open_store(&cfg)?;

    match command {
        ContactCommand::Add { name, address } => {
            let contact = store.add_contact(&name, &address).await?;
            println!("{}", contact.id);
        }
        ContactCommand::List => {
            for contact in store.list_contacts().await? {
                let last = contact
                    .last_contact
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "never".to_string());
                println!("{:<36} {:<20} {:<20} {}", contact.id, contact.name, contact.contact_info, last);
            }
        }
    }
    Ok(())
}

/// Everything a running engine needs
struct Runtime {
    store: SqliteStore,
    orchestrator: Arc<Orchestrator>,
}

fn build_completion(cfg: &ConciergeConfig) -> Result<Arc<dyn CompletionService>> {
    let timeout = Duration::from_secs(cfg.completion.timeout_secs);
    let mut providers: Vec<Box<dyn CompletionService>> = vec![Box::new(OpenAiCompletionClient::new(
        cfg.completion.name.clone(),
        cfg.completion.api_key.clone(),
        cfg.completion.base_url.clone(),
        timeout,
    )?)];
    for backup in &cfg.completion.failover {
        providers.push(Box::new(OpenAiCompletionClient::new(
            backup.name.clone(),
            backup.api_key.clone(),
            backup.base_url.clone(),
            timeout,
        )?));
    }
    let failover = FailoverCompletion::new(providers)?
        .with_max_retries(cfg.completion.max_retries)
        .with_attempt_timeout(timeout);
    info!(
        "Completion: {} provider(s) starting with {}, default model {}",
        failover.provider_count(),
        failover.provider_name(),
        cfg.completion.default_model
    );
    Ok(Arc::new(failover))
}

fn build_delivery(cfg: &ConciergeConfig) -> Result<Arc<dyn DeliveryGateway>> {
    let delivery: Arc<dyn DeliveryGateway> = match cfg.delivery.kind {
        DeliveryKind::Log => Arc::new(LogDelivery),
        DeliveryKind::Webhook => {
            let token = Some(cfg.delivery.token.clone()).filter(|t| !t.is_empty());
            Arc::new(WebhookDelivery::new(
                cfg.delivery.url.clone(),
                token,
                Duration::from_secs(cfg.delivery.timeout_secs),
            )?)
        }
    };
    info!("Delivery via {}", delivery.name());
    Ok(delivery)
}

async fn build_runtime(cfg: &ConciergeConfig) -> Result<Runtime> {
    let store = open_store(cfg)?;

    let memory: Arc<dyn MemoryService> = if cfg.memory.enabled {
        Arc::new(KeywordMemory::new(store.clone()).with_max_results(cfg.memory.max_results))
    } else {
        Arc::new(NoopMemory)
    };

    let factory =
        AgentFactory::new(build_completion(cfg)?).with_default_model(cfg.completion.default_model.clone());
    let orchestrator = Orchestrator::new(
        factory,
        Arc::new(store.clone()),
        memory,
        build_delivery(cfg)?,
        cfg.orchestrator.clone(),
    );

    let report = orchestrator
        .initialize()
        .await
        .context("Failed to load agents")?;
    info!("Loaded {} agent(s)", report.registered.len());
    for (id, reason) in &report.failed {
        warn!("Agent '{}' not loaded: {}", id, reason);
    }
    if report.registered.is_empty() {
        warn!("No agents are registered; messages will be marked failed");
    }

    Ok(Runtime {
        store,
        orchestrator: Arc::new(orchestrator),
    })
}

fn print_result(result: &ProcessResult) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(result)?);
    Ok(())
}

async fn cmd_ingest(config_path: &Option<PathBuf>, contact_id: &str, text: &str) -> Result<()> {
    let cfg = ConciergeConfig::load(config_path)?;
    let runtime = build_runtime(&cfg).await?;

    if runtime.store.get_contact_by_id(contact_id).await?.is_none() {
        return Err(anyhow!("Unknown contact {}. Add one with `concierge contact add`.", contact_id));
    }
    let message = runtime
        .store
        .save_message(NewMessage::incoming(contact_id, text))
        .await?;
    info!("Stored message {}", message.id);

    let result = runtime.orchestrator.process_message(&message).await;
    print_result(&result)
}

async fn cmd_process(config_path: &Option<PathBuf>, id: &str, reprocess: bool) -> Result<()> {
    let cfg = ConciergeConfig::load(config_path)?;
    let runtime = build_runtime(&cfg).await?;

    let result = if reprocess {
        runtime.orchestrator.reprocess_message(id).await
    } else {
        runtime.orchestrator.process_message_id(id).await
    };
    print_result(&result)
}

async fn cmd_messages(config_path: &Option<PathBuf>, status: Option<&str>, limit: usize) -> Result<()> {
    let cfg = ConciergeConfig::load(config_path)?;
    let store = open_store(&cfg)?;

    let status = status
        .map(|s| MessageStatus::parse(s).ok_or_else(|| anyhow!("Unknown status '{}'", s)))
        .transpose()?;

    for message in store.list_messages(status, limit).await? {
        let preview: String = message.content.chars().take(60).collect();
        println!(
            "{} {:<36} {:<8} {:<10} {:<16} {}",
            message.timestamp.format("%Y-%m-%d %H:%M:%S"),
            message.id,
            message.direction.as_str(),
            message.status,
            message.agent_id.as_deref().unwrap_or("-"),
            preview
        );
    }
    Ok(())
}

async fn cmd_start(config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = ConciergeConfig::load(config_path)?;
    info!("Starting Concierge dispatcher...");
    let runtime = build_runtime(&cfg).await?;

    let cancel = CancellationToken::new();
    let (dispatcher, queue) = Dispatcher::new(
        runtime.orchestrator.clone(),
        cfg.dispatch.queue_size,
        cfg.dispatch.max_concurrent,
    );
    let dispatch_task = tokio::spawn(dispatcher.run(cancel.clone()));

    let poll_task = tokio::spawn(poll_pending(
        runtime.store.clone(),
        queue,
        Duration::from_secs(cfg.dispatch.poll_interval_secs.max(1)),
        cfg.dispatch.batch_size,
        cancel.clone(),
    ));

    println!("Concierge is running. Press Ctrl+C to stop.");

    // Wait for shutdown signal
    signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down...");
    cancel.cancel();

    let _ = poll_task.await;
    let stats = dispatch_task.await.context("Dispatcher task failed")?;
    println!(
        "Concierge stopped. {} message(s) handled, {} with a successful result.",
        stats.handled, stats.succeeded
    );
    Ok(())
}

/// Feed pending inbound messages to the dispatcher until cancelled.
/// Ids already queued may be submitted again; the store's claim drops the duplicates.
async fn poll_pending(
    store: SqliteStore,
    queue: DispatchQueue,
    interval: Duration,
    batch_size: usize,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Poller shutting down");
                break;
            }
            _ = ticker.tick() => {
                let ids = match store.pending_message_ids(batch_size).await {
                    Ok(ids) => ids,
                    Err(e) => {
                        error!("Failed to list pending messages: {}", e);
                        continue;
                    }
                };
                if !ids.is_empty() {
                    debug!("Found {} pending message(s)", ids.len());
                }
                for id in ids {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        submitted = queue.submit(id) => {
                            if let Err(e) = submitted {
                                error!("{}", e);
                                return;
                            }
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_config(dir: &std::path::Path) -> ConciergeConfig {
        let mut cfg = ConciergeConfig::parse("[completion]\napi_key = \"test\"\n").unwrap();
        cfg.store.path = dir.join("concierge.db").display().to_string();
        cfg
    }

    #[tokio::test]
    async fn test_runtime_processes_rules_message_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());

        let store = open_store(&cfg).unwrap();
        let agents = config::load_agents_file(&{
            let path = dir.path().join("agents.toml");
            std::fs::write(&path, include_str!("../../../config/agents.example.toml")).unwrap();
            path
        })
        .unwrap();
        // keep only the rules agent so nothing reaches the network
        for agent in agents.iter().filter(|a| a.id == "rules") {
            store.upsert_agent(agent).await.unwrap();
        }
        let contact = store.add_contact("Dana", "+15550100").await.unwrap();
        let message = store
            .save_message(NewMessage::incoming(&contact.id, "call Manish and Aadidev and say we have job vacancy"))
            .await
            .unwrap();

        let runtime = build_runtime(&cfg).await.unwrap();
        let result = runtime.orchestrator.process_message_id(&message.id).await;
        assert!(result.success);
        assert_eq!(result.agent_id.as_deref(), Some("rules"));
        assert_eq!(result.data["metadata"]["contacts"], json!(["Manish", "Aadidev"]));

        let stored = runtime.store.get_message_by_id(&message.id).await.unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Read);
        let sent = runtime.store.list_messages(Some(MessageStatus::Sent), 10).await.unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].original_message_id.as_deref(), Some(message.id.as_str()));
    }

    #[tokio::test]
    async fn test_poller_submits_pending_ids() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let store = open_store(&cfg).unwrap();
        let contact = store.add_contact("Dana", "+15550100").await.unwrap();
        let message = store
            .save_message(NewMessage::incoming(&contact.id, "hello"))
            .await
            .unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::channel::<String>(4);
        struct Forward(tokio::sync::mpsc::Sender<String>);
        #[async_trait::async_trait]
        impl concierge_channels::MessageProcessor for Forward {
            async fn process(&self, message_id: &str) -> ProcessResult {
                let _ = self.0.send(message_id.to_string()).await;
                ProcessResult::unhandled()
            }
        }

        let cancel = CancellationToken::new();
        let (dispatcher, queue) = Dispatcher::new(Arc::new(Forward(tx)), 4, 1);
        let dispatch_task = tokio::spawn(dispatcher.run(cancel.clone()));
        let poll_task = tokio::spawn(poll_pending(
            store,
            queue,
            Duration::from_secs(60),
            10,
            cancel.clone(),
        ));

        // the first tick fires immediately
        assert_eq!(rx.recv().await.unwrap(), message.id);
        cancel.cancel();
        poll_task.await.unwrap();
        dispatch_task.await.unwrap();
    }
}
