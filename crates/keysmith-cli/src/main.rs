//! Keysmith CLI - RSA key rotation with envelope encryption

use clap::{Parser, Subcommand};
use keysmith_core::config::{Config, Secrets};
use keysmith_core::domain::keys::{
    Actor, ExternalStatus, KeyError, KeyLifecycleService, RotationStatus, RsaKeyPairGenerator,
    SymmetricCipher,
};
use keysmith_core::infrastructure::audit::SqliteAuditLog;
use keysmith_core::infrastructure::keys::SqliteKeyRecordStore;
use keysmith_core::storage::Database;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn};

/// Exit code for a missing active key
const EXIT_NOT_FOUND: u8 = 2;

#[derive(Parser)]
#[command(name = "keysmith")]
#[command(author, version, about = "RSA key rotation with envelope encryption", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// SQLite database path (overrides database.path from the config file)
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    /// Quiet mode (minimal output)
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a new key pair and retire the current one
    Rotate {
        /// Identity recorded as the creator of the new pair
        #[arg(long)]
        actor: String,
        /// Role of the actor, recorded in the audit trail
        #[arg(long)]
        role: Option<String>,
    },

    /// Show the labels of the active key pair
    ActiveKeyNames,

    /// Export the active public key
    ExportPublicKey {
        /// Directory to write the key file into (defaults to the current directory)
        #[arg(long, conflicts_with = "stdout")]
        out: Option<PathBuf>,
        /// Print the armored key instead of writing a file
        #[arg(long)]
        stdout: bool,
    },

    /// List every key generation, newest last
    History,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Run health check
    Doctor,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show all settings
    Show,
    /// Get a configuration value
    Get { key: String },
    /// Show config file path
    Path,
}

#[tokio::main]
async fn main() -> ExitCode {
    // A missing .env file is not an error
    let _ = dotenvy::dotenv();

    if let Err(e) = init_tracing() {
        eprintln!("Error: {:#}", e);
        return ExitCode::FAILURE;
    }

    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report_error(&e);
            exit_code(&e)
        }
    }
}

/// Logs go to stderr so stdout stays parseable
fn init_tracing() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("keysmith=info".parse()?),
        )
        .init();
    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let db_path = cli.database.as_deref();

    match cli.command {
        Commands::Rotate { actor, role } => {
            let service = open_service(db_path).await?;
            let mut actor = Actor::new(actor);
            if let Some(role) = role {
                actor = actor.with_role(role);
            }
            cmd_rotate(&service, &actor, cli.format, cli.quiet).await
        }

        Commands::ActiveKeyNames => {
            let service = open_service(db_path).await?;
            cmd_active_key_names(&service, cli.format).await
        }

        Commands::ExportPublicKey { out, stdout } => {
            let service = open_service(db_path).await?;
            cmd_export_public_key(&service, out, stdout, cli.format, cli.quiet).await
        }

        Commands::History => {
            let service = open_service(db_path).await?;
            cmd_history(&service, cli.format).await
        }

        Commands::Config { action } => cmd_config(action, cli.format),

        Commands::Doctor => cmd_doctor(db_path, cli.quiet).await,
    }
}

/// Wire the lifecycle service from config, secrets and the database
async fn open_service(db_path: Option<&Path>) -> anyhow::Result<KeyLifecycleService> {
    let config = Config::load()?;
    let secrets = Secrets::from_env()?;

    let db = Database::new(config.database_config(db_path)).await?;
    let generator = RsaKeyPairGenerator::new(config.keys.bits, secrets.key_passphrase.clone())?;

    Ok(KeyLifecycleService::new(
        Arc::new(generator),
        SymmetricCipher::new(&secrets.master_key),
        Arc::new(SqliteKeyRecordStore::new(db.pool().clone())),
        Arc::new(SqliteAuditLog::new(db.pool().clone())),
    )
    .with_policy(config.rotation_policy()))
}

async fn cmd_rotate(
    service: &KeyLifecycleService,
    actor: &Actor,
    format: OutputFormat,
    quiet: bool,
) -> anyhow::Result<()> {
    let result = service.rotate(actor).await;
    let status = RotationStatus::from(&result);

    match format {
        OutputFormat::Json => println!("{}", json!({ "status": status })),
        OutputFormat::Text => {
            if let Ok(receipt) = &result {
                if !quiet {
                    println!("Rotated key pair (record {})", receipt.record_id);
                    println!("  Private key: {}", receipt.labels.private_key_name);
                    println!("  Public key:  {}", receipt.labels.public_key_name);
                    println!("  Retired:     {}", receipt.deactivated);
                }
            }
            println!("Status: {}", status.as_str());
        }
    }

    result.map(|_| ()).map_err(Into::into)
}

async fn cmd_active_key_names(
    service: &KeyLifecycleService,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let labels = service.get_active_key_labels().await?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string(&labels)?),
        OutputFormat::Text => {
            println!("{}", labels.private_key_name);
            println!("{}", labels.public_key_name);
        }
    }
    Ok(())
}

async fn cmd_export_public_key(
    service: &KeyLifecycleService,
    out: Option<PathBuf>,
    stdout: bool,
    format: OutputFormat,
    quiet: bool,
) -> anyhow::Result<()> {
    let export = service.export_active_public_key().await?;

    if stdout {
        print!("{}", export.armored);
        return Ok(());
    }

    let dir = match out {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };
    let path = export.write_once(&dir).map_err(KeyError::from)?;
    info!(path = %path.display(), "Wrote public key");

    match format {
        OutputFormat::Json => println!(
            "{}",
            json!({ "fileName": export.file_name, "path": path.display().to_string() })
        ),
        OutputFormat::Text => {
            if !quiet {
                println!("Wrote {}", path.display());
            }
        }
    }
    Ok(())
}

async fn cmd_history(service: &KeyLifecycleService, format: OutputFormat) -> anyhow::Result<()> {
    let records = service.key_history().await?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&records)?),
        OutputFormat::Text => {
            if records.is_empty() {
                println!("No key records. Run `keysmith rotate --actor <name>` to create one.");
            }
            for record in records {
                let state = if record.is_active { "active" } else { "retired" };
                println!(
                    "{:>4}  {:<7}  {}  {}  created by {} at {}",
                    record.id,
                    state,
                    record.labels.private_key_name,
                    record.labels.public_key_name,
                    record.created_by,
                    record.created_at.to_rfc3339(),
                );
                if let (Some(by), Some(at)) = (&record.modified_by, record.modified_at) {
                    println!("              retired by {} at {}", by, at.to_rfc3339());
                }
            }
        }
    }
    Ok(())
}

fn cmd_config(action: ConfigAction, format: OutputFormat) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            let config = Config::load()?;
            let mut items = config.list()?;
            for key in ["secrets.master_key", "secrets.key_passphrase"] {
                items.push((key.to_string(), config.get(key)?));
            }
            match format {
                OutputFormat::Json => {
                    let map: serde_json::Map<String, serde_json::Value> = items
                        .into_iter()
                        .map(|(k, v)| (k, serde_json::Value::String(v)))
                        .collect();
                    println!("{}", serde_json::to_string_pretty(&map)?);
                }
                OutputFormat::Text => {
                    for (key, value) in items {
                        println!("{} = {}", key, value);
                    }
                }
            }
        }
        ConfigAction::Get { key } => {
            let config = Config::load()?;
            println!("{}", config.get(&key)?);
        }
        ConfigAction::Path => {
            let path = Config::config_path()?;
            println!("{}", path.display());
        }
    }
    Ok(())
}

async fn cmd_doctor(db_path: Option<&Path>, quiet: bool) -> anyhow::Result<()> {
    if !quiet {
        println!("Keysmith Health Check");
        println!("=====================");
        println!();
    }

    let mut all_ok = true;

    let config = match Config::load() {
        Ok(config) => {
            if !quiet {
                println!("[OK] Configuration: Valid");
            }
            config
        }
        Err(e) => {
            all_ok = false;
            if !quiet {
                println!("[!!] Configuration: Error - {}", e);
            }
            Config::default()
        }
    };

    match Secrets::from_env() {
        Ok(_) => {
            if !quiet {
                println!("[OK] Master key: Configured");
            }
        }
        Err(e) => {
            all_ok = false;
            warn!(code = e.code(), "Master key unavailable");
            if !quiet {
                println!("[!!] Master key: {}", e);
            }
        }
    }

    let db_config = config.database_config(db_path);
    match Database::new(db_config.clone()).await {
        Ok(db) => {
            match db.health_check().await {
                Ok(()) => {
                    if !quiet {
                        println!("[OK] Database: {}", db.path().display());
                    }
                }
                Err(e) => {
                    all_ok = false;
                    if !quiet {
                        println!("[!!] Database: {}", e);
                    }
                }
            }
            match db.migration_status().await {
                Ok(status) if !status.needs_migration => {
                    if !quiet {
                        println!("[OK] Schema: version {}", status.current_version);
                    }
                }
                Ok(status) => {
                    all_ok = false;
                    if !quiet {
                        println!(
                            "[!!] Schema: version {} of {}",
                            status.current_version, status.target_version
                        );
                    }
                }
                Err(e) => {
                    all_ok = false;
                    if !quiet {
                        println!("[!!] Schema: {}", e);
                    }
                }
            }
            db.close().await;
        }
        Err(e) => {
            all_ok = false;
            if !quiet {
                println!("[!!] Database: {} - {:#}", db_config.path.display(), e);
            }
        }
    }

    if !quiet {
        println!();
    }

    if all_ok {
        if !quiet {
            println!("All checks passed.");
        }
        Ok(())
    } else {
        Err(anyhow::anyhow!("Health check found problems"))
    }
}

/// The key lifecycle error behind `err`, wherever it sits in the chain
fn key_error(err: &anyhow::Error) -> Option<&KeyError> {
    err.chain().find_map(|cause| {
        cause
            .downcast_ref::<KeyError>()
            .or_else(|| cause.downcast_ref::<keysmith_core::Error>()?.key_error())
    })
}

fn exit_code(err: &anyhow::Error) -> ExitCode {
    match key_error(err).map(KeyError::status) {
        Some(ExternalStatus::NotFound) => ExitCode::from(EXIT_NOT_FOUND),
        _ => ExitCode::FAILURE,
    }
}

fn report_error(err: &anyhow::Error) {
    let core = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<keysmith_core::Error>());

    match (core, key_error(err)) {
        (Some(e), _) => {
            eprintln!("Error [{}]: {}", e.code(), e);
            if let Some(suggestion) = e.suggestion() {
                eprintln!("  Try: {}", suggestion);
            }
        }
        (None, Some(e)) => eprintln!("Error [{}]: {}", e.root_cause().code(), err),
        (None, None) => eprintln!("Error: {:#}", err),
    }
}
