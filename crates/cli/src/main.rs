mod commands;
mod logging;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use commands::migrate;
use pathfinder_migrate::MigrationError;

#[derive(Parser, Debug)]
#[command(name = "pf-migrate")]
#[command(about = "Schema migration runner for the Pathfinder campaign tracker")]
#[command(version)]
struct Cli {
    /// Directory containing the migration files
    #[arg(long, env = "MIGRATIONS_DIR", global = true)]
    dir: Option<PathBuf>,

    /// PostgreSQL connection URL (falls back to PGHOST/PGUSER/... when unset)
    #[arg(long, env = "DATABASE_URL", global = true, hide_env_values = true)]
    database_url: Option<String>,

    /// Print responses as JSON and log as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Log level used when RUST_LOG is unset
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show applied and pending migrations
    Status,

    /// Create the tracking tables if needed, then show status
    Health,

    /// Per-file breakdown including orphaned records
    Details,

    /// Apply all pending migrations in order
    Run,

    /// Record a migration as applied without executing it
    MarkApplied {
        /// Migration filename, e.g. 005_add_ships.sql
        filename: String,

        /// Who performed the out-of-band migration
        #[arg(long)]
        applied_by: Option<String>,

        /// Free-form notes stored with the record
        #[arg(long)]
        notes: Option<String>,
    },

    /// Applied records and attempt history
    History {
        /// Restrict to one migration id or filename
        migration_id: Option<String>,
    },

    /// Create the tracking tables
    Init,

    /// Show tracking configuration and system info
    Config,

    /// Lint, checksum and drift-check every migration file
    Validate,

    /// Delete every tracking record (destructive)
    Reset {
        /// Required; without it nothing is deleted
        #[arg(long)]
        confirm_reset: bool,
    },

    /// Scaffold the next migration file
    New {
        /// Migration name, e.g. "add ship crew"
        name: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    logging::init_logging(&logging::LoggingConfig {
        level: cli.log_level.clone(),
        json_format: cli.json,
    })?;

    let result = dispatch(cli).await;
    if let Err(e) = &result {
        if let Some(hint) = e.downcast_ref::<MigrationError>().and_then(MigrationError::hint) {
            eprintln!("hint: {}", hint);
        }
    }
    result
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    let options = migrate::Options {
        dir: cli.dir,
        database_url: cli.database_url,
        json: cli.json,
    };

    if let Commands::New { name } = &cli.command {
        return migrate::create(&options, name);
    }

    let ctx = migrate::Context::connect(&options).await?;
    let result = match cli.command {
        Commands::Status => migrate::status(&ctx).await,
        Commands::Health => migrate::health(&ctx).await,
        Commands::Details => migrate::details(&ctx).await,
        Commands::Run => migrate::run(&ctx).await,
        Commands::MarkApplied {
            filename,
            applied_by,
            notes,
        } => migrate::mark_applied(&ctx, filename, applied_by, notes).await,
        Commands::History { migration_id } => migrate::history(&ctx, migration_id.as_deref()).await,
        Commands::Init => migrate::init(&ctx).await,
        Commands::Config => migrate::config(&ctx).await,
        Commands::Validate => migrate::validate(&ctx).await,
        Commands::Reset { confirm_reset } => migrate::reset(&ctx, confirm_reset).await,
        Commands::New { .. } => Ok(()),
    };
    ctx.close().await;
    result
}
