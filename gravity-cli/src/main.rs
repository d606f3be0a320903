use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use gravity_core::auth::identity::{select_identity_provider, IdentityCapabilities};
use gravity_core::sync::BackendClient;
use gravity_core::{
    AuthStateStore, Clock, Environment, NoteRecord, RuntimeConfig, SessionContext,
    StorageBackend, SyncEngine, SyncSettings, SystemClock,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Gravity Notes CLI - local-first notes with background sync
#[derive(Parser)]
#[command(name = "gravity")]
#[command(about = "Local-first notes with background sync", long_about = None)]
struct Cli {
    /// Deployment environment (production or development)
    #[arg(long = "env", env = "GRAVITY_ENV", default_value = "development", global = true)]
    environment: Environment,

    /// Runtime config JSON: a file path or an http(s) URL
    #[arg(long, env = "GRAVITY_CONFIG", global = true)]
    config: Option<String>,

    /// Directory for notes and session state
    #[arg(long, env = "GRAVITY_DATA_DIR", global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the resolved runtime configuration
    Config,

    /// Sign in with a Google identity credential
    SignIn {
        /// ID token from Google Identity Services
        #[arg(long, env = "GRAVITY_ID_TOKEN", hide_env_values = true)]
        credential: Option<String>,
    },

    /// Sign out and forget the stored session
    SignOut,

    /// Ask the backend who we are
    Whoami,

    /// Work with local notes
    Notes {
        #[command(subcommand)]
        command: NotesCommand,
    },

    /// Push queued edits and pull remote changes
    Sync,

    /// Sync, then pull whenever the backend reports a change (Ctrl-C to stop)
    Watch,

    /// Show session and queue status
    Status,
}

#[derive(Subcommand)]
enum NotesCommand {
    /// List notes, pinned first
    List,

    /// Print a note's markdown
    Show { id: String },

    /// Create a note
    Add { text: String },

    /// Replace a note's text
    Edit { id: String, text: String },

    /// Pin or unpin a note
    Pin {
        id: String,
        /// Unpin instead
        #[arg(long)]
        off: bool,
    },

    /// Delete a note
    Delete { id: String },
}

struct App {
    config: RuntimeConfig,
    session: Arc<SessionContext>,
    engine: SyncEngine,
    clock: Arc<dyn Clock>,
}

async fn load_config(cli: &Cli) -> Result<RuntimeConfig> {
    let config = match cli.config.as_deref() {
        Some(url) if url.starts_with("http://") || url.starts_with("https://") => {
            RuntimeConfig::load_from_url(cli.environment, url).await?
        }
        Some(path) => RuntimeConfig::load_from_path(cli.environment, Path::new(path))?,
        None => RuntimeConfig::resolve(cli.environment, None)?,
    };
    Ok(config)
}

async fn open(cli: &Cli, credential: Option<String>) -> Result<App> {
    let config = load_config(cli).await.context("Failed to load runtime config")?;

    let data_dir = match &cli.data_dir {
        Some(dir) => dir.clone(),
        None => gravity_core::ensure_data_dir()?,
    };
    let backend = Arc::new(StorageBackend::probe(&data_dir));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let remote = Arc::new(BackendClient::from_config(&config)?);
    let identity = select_identity_provider(IdentityCapabilities { credential });

    let session = Arc::new(SessionContext::new(
        AuthStateStore::new(backend.clone(), config.google_client_id.clone()),
        remote.clone(),
        identity,
        clock.clone(),
    ));
    session.initialize().await?;

    let engine = SyncEngine::new(
        remote,
        session.clone(),
        backend,
        clock.clone(),
        SyncSettings::default(),
    );

    Ok(App {
        config,
        session,
        engine,
        clock,
    })
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn find_note(app: &App, id: &str) -> Result<NoteRecord> {
    match app.engine.notes()?.get_by_id(id)? {
        Some(note) => Ok(note),
        None => bail!("No note with id {}", id),
    }
}

async fn run_notes(app: &App, command: NotesCommand) -> Result<()> {
    match command {
        NotesCommand::List => {
            let mut notes = app.engine.notes()?.load_all()?;
            notes.sort_by(|a, b| {
                b.pinned
                    .cmp(&a.pinned)
                    .then_with(|| b.last_activity_iso.cmp(&a.last_activity_iso))
            });
            for note in &notes {
                let marker = if note.pinned { "*" } else { " " };
                println!("{} {}  {}", marker, note.note_id, note.title());
            }
            if notes.is_empty() {
                println!("No notes yet");
            }
        }
        NotesCommand::Show { id } => {
            println!("{}", find_note(app, &id)?.markdown_text);
        }
        NotesCommand::Add { text } => {
            let note = NoteRecord::new(text, app.clock.now());
            app.engine.record_edit(note.clone())?;
            println!("{}", note.note_id);
        }
        NotesCommand::Edit { id, text } => {
            let mut note = find_note(app, &id)?;
            note.edit(text, app.clock.now());
            app.engine.record_edit(note)?;
        }
        NotesCommand::Pin { id, off } => {
            let mut note = find_note(app, &id)?;
            note.set_pinned(!off, app.clock.now());
            app.engine.record_edit(note)?;
        }
        NotesCommand::Delete { id } => {
            if !app.engine.record_delete(&id)? {
                bail!("No note with id {}", id);
            }
        }
    }
    Ok(())
}

/// `RUST_LOG` when set, `info` otherwise.
fn default_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(default_filter())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let credential = match &cli.command {
        Commands::SignIn { credential } => credential.clone(),
        _ => None,
    };

    let app = open(&cli, credential).await?;

    match cli.command {
        Commands::Config => print_json(&app.config)?,
        Commands::SignIn { .. } => {
            let user = app
                .session
                .sign_in_interactive()
                .await
                .context("Sign-in failed (pass --credential or set GRAVITY_ID_TOKEN)")?;
            info!("Signed in as {}", user.id);
            println!(
                "Signed in as {}",
                user.email.as_deref().unwrap_or(user.id.as_str())
            );
        }
        Commands::SignOut => {
            app.session.sign_out().await;
            println!("Signed out");
        }
        Commands::Whoami => {
            let me = app.session.probe().await?;
            print_json(&serde_json::json!({
                "userId": me.user_id,
                "email": me.email,
                "name": me.name,
            }))?;
        }
        Commands::Notes { command } => run_notes(&app, command).await?,
        Commands::Sync => {
            let report = app.engine.sync().await?;
            print_json(&report)?;
        }
        Commands::Watch => {
            print_json(&app.engine.sync().await?)?;
            info!("Watching for remote changes");
            tokio::select! {
                watched = app.engine.watch() => watched?,
                _ = tokio::signal::ctrl_c() => info!("Stopped watching"),
            }
        }
        Commands::Status => print_json(&app.engine.status()?)?,
    }

    Ok(())
}
