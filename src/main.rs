use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use similarity_service::{AccountStore, Config, SqliteAccountStore};

/// Operator tool for the similarity service database
#[derive(Parser)]
#[command(name = "similarity-service", version)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "similarity.toml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the database file and schema
    Init,
    /// List accounts and their credit balances
    Accounts,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config))?;

    match cli.command {
        Command::Init => run_init(&config),
        Command::Accounts => run_accounts(&config).await,
    }
}

fn run_init(config: &Config) -> Result<()> {
    println!("🗄️  Initialising account database");

    let path = std::path::Path::new(&config.database.path);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }

    SqliteAccountStore::open(path)
        .with_context(|| format!("Failed to open database at {}", path.display()))?;
    println!("✓ Database ready at {} (WAL mode)", path.display());

    Ok(())
}

async fn run_accounts(config: &Config) -> Result<()> {
    let path = std::path::Path::new(&config.database.path);
    if !path.exists() {
        anyhow::bail!(
            "Database not found at {}. Run `similarity-service init` first.",
            path.display()
        );
    }

    let store = SqliteAccountStore::open(path)
        .with_context(|| format!("Failed to open database at {}", path.display()))?;
    let accounts = store.list_accounts().await?;

    println!("{:<32} {:>8}  {}", "IDENTITY", "CREDITS", "CREATED");
    for account in &accounts {
        println!(
            "{:<32} {:>8}  {}",
            account.identity,
            account.credits,
            account.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    println!("\n{} account(s)", accounts.len());

    Ok(())
}
