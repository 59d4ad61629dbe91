//! # Stylist CLI (`stylist`)
//!
//! ## Usage
//!
//! ```bash
//! stylist --config ./config/stylist.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `stylist init` | Create the SQLite database and run schema migrations |
//! | `stylist serve` | Start the HTTP API |
//! | `stylist chat --user <id> [message]` | Run turns from the terminal |
//! | `stylist thread show <id>` | Print a thread's stored state |
//! | `stylist thread delete <id>` | Delete a thread |
//! | `stylist thread list --user <id>` | List a user's threads |
//! | `stylist user enroll --user <id> <photo>` | Store a photo and derive preferences |
//! | `stylist user show <id>` | Print a user profile |
//! | `stylist embed <image>` | Print the visual and color embeddings of an image |

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use tryon_stylist::config::{self, Config};
use tryon_stylist::embedding::EmbeddingGenerator;
use tryon_stylist::pipeline::{Orchestrator, TurnRequest, TurnResponse};
use tryon_stylist::providers::{create_storage, mime_from_key};
use tryon_stylist::store::sqlite::SqliteConversationStore;
use tryon_stylist::store::ConversationStore;
use tryon_stylist::users::{enroll_photo, SqliteUserDirectory, UserDirectory};
use tryon_stylist::{db, migrate, server};

/// Conversational shopping assistant with virtual try-on.
#[derive(Parser)]
#[command(name = "stylist", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/stylist.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Start the HTTP API on `[server].bind`.
    Serve,

    /// Send messages to the assistant.
    ///
    /// With a message argument, runs a single turn. Without one, reads one
    /// message per line from stdin and keeps the same thread.
    Chat {
        #[arg(long)]
        user: String,
        /// Continue an existing thread.
        #[arg(long)]
        thread: Option<String>,
        message: Option<String>,
    },

    /// Inspect or delete conversation threads.
    Thread {
        #[command(subcommand)]
        action: ThreadAction,
    },

    /// Manage users and their preference profiles.
    User {
        #[command(subcommand)]
        action: UserAction,
    },

    /// Compute embeddings for a local image.
    Embed {
        image: PathBuf,
        /// Print the full vectors instead of a summary.
        #[arg(long)]
        full: bool,
    },
}

#[derive(Subcommand)]
enum ThreadAction {
    Show { thread_id: String },
    Delete { thread_id: String },
    List {
        #[arg(long)]
        user: String,
    },
}

#[derive(Subcommand)]
enum UserAction {
    /// Upload a photo and recompute the user's preference embeddings.
    Enroll {
        #[arg(long)]
        user: String,
        #[arg(long)]
        username: Option<String>,
        photo: PathBuf,
    },
    Show { user_id: String },
}

fn init_tracing(cfg: Option<&Config>) {
    let level = cfg.map(|c| c.server.log_level.as_str()).unwrap_or("info");
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // `embed` works without a config file.
    if let Commands::Embed { image, full } = &cli.command {
        let cfg = config::load_config(&cli.config).ok();
        init_tracing(cfg.as_ref());
        let embedding = cfg.map(|c| c.embedding).unwrap_or_default();
        return embed_image(&EmbeddingGenerator::from_config(&embedding)?, image, *full).await;
    }

    let cfg = config::load_config(&cli.config)?;
    init_tracing(Some(&cfg));

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Chat {
            user,
            thread,
            message,
        } => {
            let pool = db::connect(&cfg).await?;
            let orchestrator = Orchestrator::from_config(&cfg, pool)?;
            run_chat(&orchestrator, user, thread, message).await?;
        }
        Commands::Thread { action } => {
            let store = SqliteConversationStore::new(db::connect(&cfg).await?);
            match action {
                ThreadAction::Show { thread_id } => match store.get(&thread_id).await? {
                    Some(state) => println!("{}", serde_json::to_string_pretty(&state)?),
                    None => bail!("Thread not found: {}", thread_id),
                },
                ThreadAction::Delete { thread_id } => {
                    if !store.delete(&thread_id).await? {
                        bail!("Thread not found: {}", thread_id);
                    }
                    println!("Deleted {}", thread_id);
                }
                ThreadAction::List { user } => {
                    let threads = store.list_for_user(&user).await?;
                    if threads.is_empty() {
                        println!("No threads for {}.", user);
                    }
                    for t in threads {
                        println!(
                            "{}  {:>3} msgs  {:<13}  {}  {}",
                            t.thread_id,
                            t.message_count,
                            t.current_stage.map(|s| s.as_str()).unwrap_or("-"),
                            t.updated_at.format("%Y-%m-%d %H:%M"),
                            t.last_message.unwrap_or_default()
                        );
                    }
                }
            }
        }
        Commands::User { action } => {
            let directory = SqliteUserDirectory::new(db::connect(&cfg).await?);
            match action {
                UserAction::Enroll {
                    user,
                    username,
                    photo,
                } => enroll(&cfg, &directory, &user, username, &photo).await?,
                UserAction::Show { user_id } => match directory.get_profile(&user_id).await? {
                    Some(profile) => {
                        println!("user:      {}", profile.user_id);
                        println!("username:  {}", profile.username.as_deref().unwrap_or("-"));
                        println!("photos:    {}", profile.photo_refs.len());
                        for r in &profile.photo_refs {
                            println!("  {}", r);
                        }
                        println!(
                            "profile:   {}",
                            if profile.preference_embeddings.is_some() {
                                "enrolled"
                            } else {
                                "missing"
                            }
                        );
                    }
                    None => bail!("User not found: {}", user_id),
                },
            }
        }
        Commands::Embed { .. } => {}
    }

    Ok(())
}

async fn run_chat(
    orchestrator: &Orchestrator,
    user_id: String,
    thread_id: Option<String>,
    message: Option<String>,
) -> Result<()> {
    if let Some(message) = message {
        let resp = orchestrator
            .run_turn(TurnRequest {
                thread_id,
                user_id,
                message,
            })
            .await?;
        print_turn(&resp);
        return Ok(());
    }

    let mut thread_id = thread_id;
    let stdin = std::io::stdin();
    print!("> ");
    std::io::stdout().flush()?;
    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            print!("> ");
            std::io::stdout().flush()?;
            continue;
        }
        let resp = orchestrator
            .run_turn(TurnRequest {
                thread_id: thread_id.clone(),
                user_id: user_id.clone(),
                message: line,
            })
            .await?;
        print_turn(&resp);
        thread_id = Some(resp.thread_id);
        print!("> ");
        std::io::stdout().flush()?;
    }
    Ok(())
}

fn print_turn(resp: &TurnResponse) {
    println!("[{}] {}", resp.thread_id, resp.response_text);
    for (i, c) in resp.candidates.iter().flatten().enumerate() {
        let rating = c
            .rating
            .map(|r| format!("{:.1}★", r))
            .unwrap_or_else(|| "-".to_string());
        println!("  {}. {} | {} | {} | {}", i + 1, c.title, c.price, rating, c.link);
        if let Some(url) = &c.composite_image_ref {
            println!("     try-on: {}", url);
        }
    }
}

async fn enroll(
    cfg: &Config,
    directory: &dyn UserDirectory,
    user_id: &str,
    username: Option<String>,
    photo: &Path,
) -> Result<()> {
    let bytes = std::fs::read(photo)
        .with_context(|| format!("Failed to read photo: {}", photo.display()))?;
    let ext = photo
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("png")
        .to_ascii_lowercase();
    let key = format!("photos/{}/{}.{}", user_id, uuid::Uuid::new_v4(), ext);

    let storage = create_storage(cfg)?;
    let photo_ref = storage.upload(&bytes, &key, mime_from_key(&key)).await?;

    let generator = EmbeddingGenerator::from_config(&cfg.embedding)?;
    let mut profile = enroll_photo(directory, &generator, user_id, &photo_ref, &bytes).await?;
    if username.is_some() {
        profile.username = username;
        directory.put_profile(&profile).await?;
    }

    println!(
        "Enrolled {} ({} photo(s), model: {})",
        profile.user_id,
        profile.photo_refs.len(),
        generator.model_name()
    );
    Ok(())
}

async fn embed_image(generator: &EmbeddingGenerator, image: &Path, full: bool) -> Result<()> {
    let bytes = std::fs::read(image)
        .with_context(|| format!("Failed to read image: {}", image.display()))?;
    let visual = generator.visual(&bytes).await;
    let color = generator.color(&bytes);

    if full {
        let out = serde_json::json!({
            "model": generator.model_name(),
            "visual": visual,
            "color": color,
        });
        println!("{}", serde_json::to_string(&out)?);
        return Ok(());
    }

    let nonzero = |v: &[f32]| v.iter().filter(|x| **x != 0.0).count();
    println!("model:   {}", generator.model_name());
    println!("visual:  {} dims, {} non-zero", visual.len(), nonzero(&visual));
    println!("color:   {} dims, {} non-zero", color.len(), nonzero(&color));
    Ok(())
}
