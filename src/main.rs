mod config;
mod llm;
mod models;
mod relay;
mod store;
mod telegram;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use crate::llm::ProviderRouter;
use crate::models::{format_cost, ModelRegistry};
use crate::relay::Relay;
use crate::store::SqliteUserStore;
use crate::telegram::TelegramBot;

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

#[derive(Parser)]
#[command(
    name = "modelrelay",
    about = "Telegram relay bot for OpenAI and Anthropic models",
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bot (default)
    Run,
    /// Model catalogue
    Models {
        #[command(subcommand)]
        action: ModelsAction,
    },
}

#[derive(Subcommand)]
enum ModelsAction {
    /// List configured models and prices
    List,
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = config::load_config()?;
    config.validate()?;

    let registry = ModelRegistry::from_entries(&config.models, &config.default_model)
        .context("building model registry from config")?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_bot(config, registry).await,
        Commands::Models { action } => match action {
            ModelsAction::List => cmd_models_list(&registry),
        },
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("modelrelay=info".parse().unwrap()),
        )
        .with_target(false)
        .init();
}

// ---------------------------------------------------------------------------
// Subcommands
// ---------------------------------------------------------------------------

async fn run_bot(config: config::Config, registry: ModelRegistry) -> Result<()> {
    if config.bot_token.is_empty() || config.bot_token.contains("${") {
        anyhow::bail!(
            "No bot token configured. Set the TELEGRAM_BOT_TOKEN environment variable \
             or add bot_token to ~/.modelrelay/config.yaml"
        );
    }

    let db_path = resolve_database_path(&config)?;
    info!(path = %db_path.display(), "opening user database");
    let store = SqliteUserStore::connect(&db_path)
        .await
        .context("opening user database")?;

    let router = ProviderRouter::new(&config).context("building provider clients")?;
    let bot = Arc::new(TelegramBot::new(&config.bot_token)?);

    let relay = Relay::new(
        registry,
        Arc::new(router),
        Arc::new(store),
        bot.clone(),
    );

    // Ctrl+C: finish the current poll, then exit. A second Ctrl+C forces
    // immediate exit for stuck processes.
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown2 = shutdown.clone();
    ctrlc::set_handler(move || {
        if shutdown2.swap(true, Ordering::SeqCst) {
            std::process::exit(130);
        }
        eprintln!("\nShutting down. Press Ctrl+C again to force quit.");
    })
    .ok();

    info!("bot started, polling for updates");
    let mut offset: i64 = 0;

    while !shutdown.load(Ordering::SeqCst) {
        let updates = match bot.get_updates(offset, config.poll_timeout_secs).await {
            Ok(updates) => updates,
            Err(e) => {
                warn!(error = %e, "getUpdates failed, backing off");
                tokio::time::sleep(Duration::from_secs(5)).await;
                continue;
            }
        };

        for update in updates {
            offset = offset.max(update.update_id + 1);
            // Each update is handled on its own task so one slow provider
            // call never blocks the poll loop.
            let relay = relay.clone();
            tokio::spawn(async move {
                relay.handle_update(update).await;
            });
        }
    }

    info!("bot stopped");
    Ok(())
}

fn cmd_models_list(registry: &ModelRegistry) -> Result<()> {
    for model in registry.list() {
        let marker = if model.key == registry.default_key() {
            " (default)"
        } else {
            ""
        };
        println!(
            "{:<16} {:<20} {} in / {} out per 1M tokens{}",
            model.key,
            model.button_text,
            format_cost(model.prices.input),
            format_cost(model.prices.output),
            marker,
        );
    }
    Ok(())
}

/// Database location: config value, or `~/.modelrelay/users.db`.
fn resolve_database_path(config: &config::Config) -> Result<PathBuf> {
    if let Some(ref path) = config.database_path {
        return Ok(path.clone());
    }
    dirs::home_dir()
        .map(|h| h.join(".modelrelay").join("users.db"))
        .context("could not determine home directory for the database path")
}
