use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use research_desk::{
    autosave::{AutosaveOptions, AutosaveScheduler},
    config::{DeskConfig, IdentityMode},
    registry::AutosaveRegistry,
    session::SessionStore,
};
use tracing::{info, Level};

#[derive(Parser)]
#[command(name = "desk")]
#[command(about = "Inspect and drive the Research Desk session and autosave store.")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Directory holding state.json (defaults to the platform data directory)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Identity mode: `fixed:<id>` or `email`
    #[arg(long, global = true)]
    identity: Option<String>,

    /// Log debug output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in with an email address
    SignIn {
        email: String,
        #[arg(long, default_value = "")]
        password: String,
    },
    /// Create an account and sign in
    SignUp {
        email: String,
        #[arg(long, default_value = "")]
        password: String,
        /// Display name (defaults to the part of the email before '@')
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Sign out and clear recent activity
    SignOut,
    /// Show the current principal
    Whoami,
    /// Show recent activity, newest first
    Activity,
    /// Feed JSON values through the autosave scheduler in order
    Save {
        key: String,
        #[arg(required = true)]
        values: Vec<String>,
        /// Debounce delay in milliseconds
        #[arg(long)]
        delay_ms: Option<u64>,
    },
    /// Print the saved value for a key
    Load { key: String },
    /// Remove the saved value for a key
    Clear { key: String },
    /// List saved keys
    Keys,
    /// Show details about a saved key
    Info { key: String },
    /// Remove every saved value of the current principal
    ClearAll,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let verbose = cli.verbose || std::env::var("RESEARCH_DESK_LOG").is_ok();
    tracing_subscriber::fmt()
        .with_max_level(if verbose { Level::DEBUG } else { Level::WARN })
        .init();

    let mut config = DeskConfig::from_env().context("reading configuration")?;
    if let Some(dir) = cli.data_dir.clone() {
        config.data_dir = Some(dir);
    }
    if let Some(raw) = cli.identity.as_deref() {
        config.identity = IdentityMode::parse(raw)?;
    }
    info!("Using state file {}", config.state_file().display());

    let storage = config.open_storage()?;
    let session = SessionStore::with_storage(storage).with_identity(config.identity.clone());

    match cli.command {
        Commands::SignIn { email, password } => {
            let principal = session.sign_in(&email, &password);
            println!("Signed in as {} ({})", principal.display_name, principal.id);
        }
        Commands::SignUp { email, password, name } => {
            let principal = session.sign_up(&email, &password, name.as_deref());
            println!("Created account {} ({})", principal.display_name, principal.id);
        }
        Commands::SignOut => {
            session.sign_out();
            println!("Signed out");
        }
        Commands::Whoami => match session.principal() {
            Some(p) => println!("{} <{}> id={}", p.display_name, p.email, p.id),
            None => println!("Not signed in"),
        },
        Commands::Activity => {
            for entry in session.recent_activity() {
                match entry.details {
                    Some(details) => println!(
                        "{}  {} ({})",
                        entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
                        entry.action,
                        details
                    ),
                    None => println!("{}  {}", entry.timestamp.format("%Y-%m-%d %H:%M:%S"), entry.action),
                }
            }
        }
        Commands::Save { key, values, delay_ms } => {
            require_principal(&session)?;
            let options = AutosaveOptions {
                delay: delay_ms.map(Duration::from_millis).unwrap_or(config.autosave_delay),
                enabled: true,
            };
            let scheduler = AutosaveScheduler::new(session.clone(), key.as_str(), options)?;
            for raw in &values {
                let value: serde_json::Value =
                    serde_json::from_str(raw).with_context(|| format!("`{}` is not valid JSON", raw))?;
                scheduler.notify_changed(&value);
            }
            // Closing flushes the last value if its timer has not fired yet
            scheduler.close();
            println!("Saved {}", key);
        }
        Commands::Load { key } => {
            require_principal(&session)?;
            let scheduler = AutosaveScheduler::new(session.clone(), key.as_str(), AutosaveOptions::default())?;
            match scheduler.load_value() {
                Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                None => println!("Nothing saved under {}", key),
            }
        }
        Commands::Clear { key } => {
            require_principal(&session)?;
            let scheduler = AutosaveScheduler::new(session.clone(), key.as_str(), AutosaveOptions::default())?;
            scheduler.clear_saved_data();
            println!("Cleared {}", key);
        }
        Commands::Keys => {
            for key in AutosaveRegistry::new(session.clone()).list_keys() {
                println!("{}", key);
            }
        }
        Commands::Info { key } => match AutosaveRegistry::new(session.clone()).get_info(&key) {
            Some(info) => println!(
                "{}: saved {}, {} bytes{}",
                key,
                info.timestamp.format("%Y-%m-%d %H:%M:%S"),
                info.approximate_size,
                if info.has_data { "" } else { " (empty)" }
            ),
            None => println!("Nothing saved under {}", key),
        },
        Commands::ClearAll => {
            let registry = AutosaveRegistry::new(session.clone());
            let count = registry.list_keys().len();
            registry.clear_all();
            println!("Cleared {} saved keys", count);
        }
    }

    Ok(())
}

fn require_principal(session: &SessionStore) -> anyhow::Result<()> {
    if session.is_signed_in() {
        Ok(())
    } else {
        anyhow::bail!("not signed in; run `desk sign-in <email>` first")
    }
}
