use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use pathfinder_migrate::{
    DatabaseConfig, MarkAppliedRequest, MigrationAdmin, MigrationBackend, MigrationCatalog, MigrationConfig,
    Migrator, PostgresBackend, ResetRequest,
};
use serde::Serialize;

/// Global flags shared by every subcommand
#[derive(Debug, Clone, Default)]
pub struct Options {
    pub dir: Option<PathBuf>,
    pub database_url: Option<String>,
    pub json: bool,
}

impl Options {
    fn migration_config(&self) -> anyhow::Result<MigrationConfig> {
        let mut config = MigrationConfig::from_env().context("Invalid migration configuration")?;
        if let Some(dir) = &self.dir {
            config.migrations_dir = dir.clone();
        }
        Ok(config)
    }

    fn database_config(&self) -> anyhow::Result<DatabaseConfig> {
        let config = match &self.database_url {
            Some(url) => DatabaseConfig::new(url.clone()),
            None => DatabaseConfig::from_env().context("Invalid database configuration")?,
        };
        config.validate()?;
        Ok(config)
    }
}

/// A connected admin facade plus output preferences
pub struct Context {
    admin: MigrationAdmin,
    backend: Arc<PostgresBackend>,
    json: bool,
}

impl Context {
    pub async fn connect(options: &Options) -> anyhow::Result<Self> {
        let config = options.migration_config()?;
        let database = options.database_config()?;
        let backend = Arc::new(PostgresBackend::connect(&database).await?);
        let migrator = Migrator::new(backend.clone(), config);
        Ok(Self {
            admin: MigrationAdmin::new(migrator),
            backend,
            json: options.json,
        })
    }

    pub async fn close(&self) {
        self.backend.close().await;
    }

    fn emit<T: Serialize>(&self, value: &T, human: impl FnOnce(&T)) -> anyhow::Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            human(value);
        }
        Ok(())
    }
}

fn print_status(status: &pathfinder_migrate::StatusResponse) {
    println!("Migration Status:");
    println!("================");
    println!(
        "Total: {}  Applied: {}  Pending: {}",
        status.total,
        status.applied,
        status.pending.len()
    );
    println!("System version: {}", status.migration_system_version);
    if status.is_production_database {
        println!("⚠️  Production database detected");
    }
    if status.is_up_to_date {
        println!("✅ Up to date");
    } else {
        for filename in &status.pending {
            println!("  ⏳ {}", filename);
        }
    }
}

pub async fn status(ctx: &Context) -> anyhow::Result<()> {
    let status = ctx.admin.status().await?;
    ctx.emit(&status, print_status)
}

pub async fn health(ctx: &Context) -> anyhow::Result<()> {
    let health = ctx.admin.health().await?;
    ctx.emit(&health, |h| {
        print_status(&h.status);
        println!("Health check: {}", h.health_check);
    })
}

pub async fn details(ctx: &Context) -> anyhow::Result<()> {
    let details = ctx.admin.details().await?;
    ctx.emit(&details, |d| {
        print_status(&d.status);
        println!();
        for m in &d.migrations {
            let marker = match m.state {
                pathfinder_migrate::MigrationState::Applied => "✅",
                pathfinder_migrate::MigrationState::Marked => "📝",
                pathfinder_migrate::MigrationState::Pending => "⏳",
                pathfinder_migrate::MigrationState::Unknown => "❓",
            };
            match m.applied_at {
                Some(at) => println!("  {} {} ({}) applied {}", marker, m.filename, m.id, at.to_rfc3339()),
                None => println!("  {} {} ({})", marker, m.filename, m.id),
            }
        }
        if !d.orphaned.is_empty() {
            println!("\n❓ = recorded but no longer present in the migrations directory");
        }
    })
}

pub async fn run(ctx: &Context) -> anyhow::Result<()> {
    let response = ctx.admin.run().await?;
    ctx.emit(&response, |r| {
        if r.result.applied.is_empty() {
            println!("No pending migrations");
        }
        for applied in &r.result.applied {
            println!(
                "Applied {} ({:?}, {} statement(s), {}ms)",
                applied.filename, applied.strategy, applied.statements_executed, applied.execution_time_ms
            );
        }
        println!();
        print_status(&r.after);
    })
}

pub async fn mark_applied(
    ctx: &Context,
    filename: String,
    applied_by: Option<String>,
    notes: Option<String>,
) -> anyhow::Result<()> {
    let response = ctx
        .admin
        .mark_applied(MarkAppliedRequest {
            filename: Some(filename),
            applied_by,
            notes,
        })
        .await?;
    ctx.emit(&response, |r| {
        println!("Marked {} as applied by {} ({})", r.filename, r.applied_by, r.notes);
    })
}

pub async fn history(ctx: &Context, migration_id: Option<&str>) -> anyhow::Result<()> {
    let history = ctx.admin.history(migration_id).await;
    ctx.emit(&history, |h| {
        println!("Applied migrations (newest first):");
        for record in &h.migrations {
            println!(
                "  {} {} by {}{}",
                record.applied_at.to_rfc3339(),
                record.filename,
                record.applied_by.as_deref().unwrap_or("unknown"),
                if record.is_manual_marking { " [manual]" } else { "" }
            );
        }
        println!("\nAttempts:");
        for attempt in &h.attempts {
            println!(
                "  #{} {} {} {} {}",
                attempt.id,
                attempt.started_at.to_rfc3339(),
                attempt.action.as_str(),
                attempt.filename,
                attempt.status.as_str()
            );
            if let Some(message) = &attempt.error_message {
                println!("      {}", message);
            }
        }
    })
}

pub async fn init(ctx: &Context) -> anyhow::Result<()> {
    let response = ctx.admin.init().await?;
    ctx.emit(&response, |r| {
        println!("Migration tables initialized (system version {})", r.migration_system_version);
    })
}

pub async fn config(ctx: &Context) -> anyhow::Result<()> {
    let response = ctx.admin.config().await;
    ctx.emit(&response, |r| {
        println!("Backend:         {}", r.system.backend);
        println!("Target:          {}", r.system.target);
        println!("Migrations dir:  {}", r.system.migrations_dir);
        println!("Rollback dir:    {}", r.system.rollback_dir);
        println!("Tracking table:  {}", r.system.tracking_table);
        println!("Version:         {}", r.system.crate_version);
        for (key, value) in &r.config {
            println!("  {} = {}", key, value);
        }
    })
}

pub async fn validate(ctx: &Context) -> anyhow::Result<()> {
    let response = ctx.admin.validate().await?;
    ctx.emit(&response, |r| {
        for file in &r.files {
            let drift = match file.checksum_matches {
                Some(false) => " ⚠️ modified since applied",
                _ => "",
            };
            println!("{} ({} bytes, {}){}", file.filename, file.size_bytes, file.checksum.get(..12).unwrap_or(&file.checksum), drift);
            for issue in &file.issues {
                println!("    - {}", issue.message);
            }
        }
        println!("\n{} file(s), {} issue(s)", r.files.len(), r.total_issues);
    })
}

pub async fn reset(ctx: &Context, confirm_reset: bool) -> anyhow::Result<()> {
    let response = ctx
        .admin
        .emergency_reset(ResetRequest {
            confirm_reset: Some(confirm_reset),
        })
        .await?;
    ctx.emit(&response, |r| {
        println!("Removed {} record(s). {}", r.removed, r.message);
    })
}

pub fn create(options: &Options, name: &str) -> anyhow::Result<()> {
    let config = options.migration_config()?;
    let catalog = MigrationCatalog::from_config(&config);
    let filename = catalog.create_migration(name)?;
    let path = catalog.dir().join(&filename);
    if options.json {
        println!("{}", serde_json::json!({ "filename": filename, "path": path.display().to_string() }));
    } else {
        println!("Created migration: {}", path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_create_scaffolds_into_dir_flag() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("001_init.sql"), "").unwrap();
        let options = Options {
            dir: Some(temp.path().to_path_buf()),
            ..Default::default()
        };

        create(&options, "add loot table").unwrap();
        assert!(temp.path().join("002_add_loot_table.sql").exists());
    }

    #[test]
    fn test_explicit_database_url_is_validated() {
        let options = Options {
            database_url: Some("mysql://localhost/pathfinder".to_string()),
            ..Default::default()
        };
        assert!(options.database_config().is_err());

        let options = Options {
            database_url: Some("postgres://pathfinder@localhost:5432/pathfinder".to_string()),
            ..Default::default()
        };
        assert_eq!(options.database_config().unwrap().url, "postgres://pathfinder@localhost:5432/pathfinder");
    }
}
