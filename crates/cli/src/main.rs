use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};
use cli::{
    commands::{self, BackupCommands, MigrateArgs, Paths, RollbackArgs},
    file_logging,
};

#[derive(Parser)]
#[command(name = "catalog-migrate")]
#[command(about = "Move a legacy catalog database into the current schema", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (default: {data_dir}/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Legacy database to read from
    #[arg(long, global = true)]
    source: Option<PathBuf>,

    /// Database to migrate into
    #[arg(long, global = true)]
    target: Option<PathBuf>,

    /// Verbosity level (-v debug, -vv trace); RUST_LOG sets the base level
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a migration session
    Migrate(MigrateArgs),
    /// Undo migrated data
    Rollback(RollbackArgs),
    /// Show the last migration and rollback
    Status {
        /// Print the raw reports as JSON
        #[arg(long)]
        json: bool,
    },
    /// Manage target database backups
    Backups {
        #[command(subcommand)]
        command: BackupCommands,
    },
}

fn log_level(verbose: u8) -> String {
    match verbose {
        0 => std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    // Held until exit so buffered file logs are flushed
    let _file_log_guard = file_logging::init_logging(&log_level(cli.verbose));

    let paths = Paths::resolve(cli.config, cli.source, cli.target);

    match cli.command {
        Commands::Migrate(args) => {
            commands::migrate(&paths, args).await?;
        }
        Commands::Rollback(args) => {
            commands::rollback(&paths, args).await?;
        }
        Commands::Status { json } => commands::status(&paths, json)?,
        Commands::Backups { command } => commands::backups(&paths, command).await?,
    }
    Ok(())
}
