use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;
mod context;

#[derive(Parser)]
#[command(name = "stocksync", version, about = "Offline-first inventory sync")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show connectivity, mode and queue depth
    Status(commands::status::StatusArgs),
    /// Run one reconciliation pass now
    Sync,
    /// Keep syncing in the foreground until interrupted
    Run,
    /// Read and write entities
    Entity {
        #[command(subcommand)]
        action: commands::entity::EntityAction,
    },
    /// Inspect and recover queued operations
    Queue {
        #[command(subcommand)]
        action: commands::queue::QueueAction,
    },
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: commands::config::ConfigAction,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("stocksync=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Status(args) => commands::status::run(args).await,
        Commands::Sync => commands::sync::run().await,
        Commands::Run => commands::run::run().await,
        Commands::Entity { action } => commands::entity::run(action).await,
        Commands::Queue { action } => commands::queue::run(action).await,
        Commands::Config { action } => commands::config::run(action),
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
