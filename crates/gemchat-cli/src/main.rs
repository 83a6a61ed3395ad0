mod chat;
mod key;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dialoguer::Confirm;
use gemchat_agents::{ChatController, ControllerSettings, GeminiProvider};
use gemchat_common::{GemId, GemIcon, NewGem};
use gemchat_config::{AppConfig, ConfigLoader};
use gemchat_db::{SessionPersistence, SessionStore, SessionWriter};
use gemchat_security::RedactingWriter;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::key::KeyStore;

#[derive(Parser)]
#[command(name = "gemchat", version, about = "Chat with configurable Gemini personas")]
struct Cli {
    /// Path to config.yml (defaults to ~/.gemchat/config.yml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG is set
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open an interactive chat with a gem
    Chat {
        /// Gem id, as listed by `gemchat gems`
        gem: String,

        /// Start with voice mode on
        #[arg(long)]
        voice: bool,
    },
    /// List available gems
    Gems,
    /// Create a custom gem
    CreateGem {
        #[arg(long)]
        name: String,
        #[arg(long)]
        description: String,
        /// System instruction the gem follows
        #[arg(long)]
        instruction: String,
        /// brain, briefcase, code, sparkles, book, heart or music
        #[arg(long)]
        icon: Option<String>,
        #[arg(long)]
        color: Option<String>,
    },
    /// Show chats with history, most recent first
    Recent,
    /// Delete custom gems and all chat history
    Reset {
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },
    /// Manage the Gemini API key
    Key {
        #[command(subcommand)]
        action: KeyCommands,
    },
}

#[derive(Subcommand)]
enum KeyCommands {
    /// Store an API key in the encrypted vault
    Set,
    /// Report whether an API key can be found
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_json);

    let loader = ConfigLoader::new();
    let config = match &cli.config {
        Some(path) => ConfigLoader::load_from(path)?,
        None => loader.load()?,
    };
    let keys = KeyStore::new(&loader, &config);

    if let Commands::Key { action } = &cli.command {
        return match action {
            KeyCommands::Set => keys.set_interactive(),
            KeyCommands::Status => {
                if keys.has_key() {
                    println!("API key found.");
                } else {
                    println!("No API key found. Run `gemchat key set` or export GEMINI_API_KEY.");
                }
                Ok(())
            }
        };
    }

    let store: Arc<dyn SessionPersistence> = Arc::new(SessionStore::open_or_in_memory(
        &loader.database_path(&config),
    )?);
    let writer = SessionWriter::spawn(Arc::clone(&store));
    let mut controller = build_controller(&config, store.as_ref(), &keys, writer.clone());

    match cli.command {
        Commands::Chat { gem, voice } => {
            let session = controller.open(&GemId::new(gem))?;
            session.set_voice_mode(voice);
            chat::run(&session, &keys).await?;
            controller.close_active();
        }
        Commands::Gems => {
            for gem in controller.gems() {
                println!("{:<24} {} - {}", gem.id, gem.name, gem.description);
            }
        }
        Commands::CreateGem {
            name,
            description,
            instruction,
            icon,
            color,
        } => {
            let icon = icon.map(|i| i.parse::<GemIcon>()).transpose()?;
            let gem = controller.create_gem(NewGem {
                name,
                description,
                system_instruction: instruction,
                icon,
                color,
            })?;
            println!("Created {} ({}).", gem.name, gem.id);
        }
        Commands::Recent => {
            let recent = controller.recent();
            if recent.is_empty() {
                println!("No chats yet.");
            }
            for chat in recent {
                let when = chat.last_activity().with_timezone(&chrono::Local);
                println!(
                    "{:<24} {}  {}",
                    chat.gem.name,
                    when.format("%Y-%m-%d %H:%M"),
                    preview(&chat.last_message.content, 60)
                );
            }
        }
        Commands::Reset { yes } => {
            let confirmed = yes
                || Confirm::new()
                    .with_prompt("Delete all custom gems and chat history?")
                    .default(false)
                    .interact()
                    .context("failed to read confirmation")?;
            if confirmed {
                controller.reset();
                println!("All gems and chats reset.");
            }
        }
        Commands::Key { .. } => {}
    }

    writer.flush().await;
    info!("gemchat exiting");
    Ok(())
}

fn build_controller(
    config: &AppConfig,
    store: &dyn SessionPersistence,
    keys: &KeyStore,
    writer: SessionWriter,
) -> ChatController {
    let provider = GeminiProvider::from_config(&config.provider, keys.lookup());
    info!("using model {}", provider.model());
    ChatController::new(
        store.load(),
        Arc::new(provider),
        writer,
        ControllerSettings::from_config(&config.chat),
    )
}

fn init_tracing(verbose: bool, json: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(RedactingWriter::stderr()))
            .init();
    } else {
        registry
            .with(fmt::layer().with_writer(RedactingWriter::stderr()))
            .init();
    }
}

/// First line of `text`, cut to `max` characters.
fn preview(text: &str, max: usize) -> String {
    let line = text.lines().next().unwrap_or_default();
    if line.chars().count() > max || text.lines().nth(1).is_some() {
        let cut: String = line.chars().take(max).collect();
        format!("{cut}...")
    } else {
        line.to_string()
    }
}
