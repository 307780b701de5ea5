mod client;
mod config;
mod serve_cmd;

#[cfg(test)]
mod test_util;

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Context;
use clap::{Parser, Subcommand};
use uuid::Uuid;

use keel_db::models::{OperationFlavor, PhaseState};
use keel_db::pool;

use client::Client;
use config::KeelConfig;

#[derive(Parser)]
#[command(name = "keel", about = "Cluster-lifecycle operation controller")]
struct Cli {
    /// Database URL (overrides KEEL_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Controller socket path (overrides the config file's server.socket_path)
    #[arg(long, global = true)]
    socket_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate preconditions and create an operation (§2, §4.E)
    CreateOperation {
        account: String,
        cluster: String,
        /// One of: install, reconfigure, upgrade, shrink, expand
        flavor: String,
        /// Flavor-specific payload as a JSON string
        #[arg(long, default_value = "{}")]
        payload: String,
        /// Member servers as a JSON array: [{"advertise_ip","role","hostname","profile_selector"}]
        #[arg(long, default_value = "[]")]
        servers: String,
    },
    /// Write a keel config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/keel")]
        db_url: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Initialize the keel database (requires config file or env vars)
    DbInit,
    /// Run the controller server
    Serve,
    /// Execute a whole plan, or a single phase within one
    Execute {
        operation_id: Uuid,
        /// Operation payload as a JSON string (ignored on phase-scoped execution)
        #[arg(long, default_value = "{}")]
        payload: String,
        /// Execute a single phase by ID instead of the whole plan
        #[arg(long)]
        phase: Option<String>,
        /// Re-run a phase already marked failed/completed
        #[arg(long)]
        force: bool,
        /// Roll back the given phase instead of running it forward
        #[arg(long)]
        rollback: bool,
        /// Validate preconditions without making changes
        #[arg(long)]
        dry_run: bool,
        /// Rollback timeout in seconds (only consulted with --rollback)
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Mark an operation complete (or failed, with --error)
    Complete {
        operation_id: Uuid,
        #[arg(long)]
        error: Option<String>,
    },
    /// Abort the running operation: forced teardown, no further progress
    Abort,
    /// Stop the controller: cooperative teardown
    Shutdown,
    /// Force a phase to a specific state, bypassing normal execution
    SetPhase {
        operation_id: Uuid,
        id: String,
        state: PhaseState,
    },
    /// Stream progress events from a running operation
    Events,
}

/// `keelctl init`: write config file.
fn cmd_init(db_url: &str, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let token_secret = config::generate_token_secret();

    let cfg = config::ConfigFile {
        database: config::DatabaseSection {
            url: db_url.to_string(),
        },
        auth: config::AuthSection {
            token_secret: token_secret.clone(),
        },
        server: config::ServerSection::default(),
    };

    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    println!(
        "  auth.token_secret = {}...{}",
        &token_secret[..8],
        &token_secret[56..]
    );
    println!();
    println!("Next: run `keelctl db-init` to create and migrate the database.");

    Ok(())
}

/// `keelctl db-init`: create database and run migrations.
async fn cmd_db_init(cli_db_url: Option<&str>) -> anyhow::Result<()> {
    let resolved = KeelConfig::resolve(cli_db_url)?;

    println!("Initializing keel database...");

    pool::ensure_database_exists(&resolved.db_config).await?;
    let db_pool = pool::create_pool(&resolved.db_config).await?;

    let migrations_path = pool::default_migrations_path();
    pool::run_migrations(&db_pool, migrations_path).await?;

    let counts = pool::table_counts(&db_pool).await?;
    println!("Database ready. Tables:");
    for (table, count) in &counts {
        println!("  {table}: {count} rows");
    }

    db_pool.close().await;

    println!("keelctl db-init complete.");
    Ok(())
}

fn socket_path(cli: &Cli, resolved: &KeelConfig) -> PathBuf {
    cli.socket_path
        .clone()
        .unwrap_or_else(|| resolved.socket_path.clone())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::CreateOperation {
            account,
            cluster,
            flavor,
            payload,
            servers,
        } => {
            let resolved = KeelConfig::resolve(cli.database_url.as_deref())?;
            let client = Client::new(socket_path(&cli, &resolved));

            let flavor = OperationFlavor::from_str(flavor)
                .map_err(|e| anyhow::anyhow!("invalid --flavor '{}': unknown flavor", e.0))?;
            let payload_value: serde_json::Value =
                serde_json::from_str(payload).context("--payload is not valid JSON")?;
            let servers_value: serde_json::Value =
                serde_json::from_str(servers).context("--servers is not valid JSON")?;

            let body = serde_json::json!({
                "account": account,
                "cluster": cluster,
                "flavor": flavor,
                "payload": payload_value,
                "servers": servers_value,
            });

            let response = client.post_json("/create-operation", &body).await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Commands::Init { db_url, force } => {
            cmd_init(db_url, *force)?;
        }
        Commands::DbInit => {
            cmd_db_init(cli.database_url.as_deref()).await?;
        }
        Commands::Serve => {
            let resolved = KeelConfig::resolve(cli.database_url.as_deref())?;
            let path = socket_path(&cli, &resolved);
            serve_cmd::run_server(&resolved.db_config, resolved.token_config, &path).await?;
        }
        Commands::Execute {
            operation_id,
            payload,
            phase,
            force,
            rollback,
            dry_run,
            timeout_secs,
        } => {
            let resolved = KeelConfig::resolve(cli.database_url.as_deref())?;
            let client = Client::new(socket_path(&cli, &resolved));

            let payload_value: serde_json::Value =
                serde_json::from_str(payload).context("--payload is not valid JSON")?;

            let body = serde_json::json!({
                "operation_id": operation_id,
                "payload": payload_value,
                "phase": phase.as_ref().map(|id| serde_json::json!({
                    "id": id,
                    "force": force,
                    "rollback": rollback,
                    "dry_run": dry_run,
                    "timeout_secs": timeout_secs,
                })),
            });

            let response = client.post_json("/execute", &body).await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Commands::Complete { operation_id, error } => {
            let resolved = KeelConfig::resolve(cli.database_url.as_deref())?;
            let client = Client::new(socket_path(&cli, &resolved));
            let body = serde_json::json!({ "operation_id": operation_id, "error": error });
            let response = client.post_json("/complete", &body).await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Commands::Abort => {
            let resolved = KeelConfig::resolve(cli.database_url.as_deref())?;
            let client = Client::new(socket_path(&cli, &resolved));
            let response = client.post_json("/abort", &serde_json::json!({})).await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Commands::Shutdown => {
            let resolved = KeelConfig::resolve(cli.database_url.as_deref())?;
            let client = Client::new(socket_path(&cli, &resolved));
            let response = client.post_json("/shutdown", &serde_json::json!({})).await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Commands::SetPhase { operation_id, id, state } => {
            let resolved = KeelConfig::resolve(cli.database_url.as_deref())?;
            let client = Client::new(socket_path(&cli, &resolved));
            let body = serde_json::json!({ "operation_id": operation_id, "id": id, "state": state });
            let response = client.post_json("/set-phase", &body).await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Commands::Events => {
            let resolved = KeelConfig::resolve(cli.database_url.as_deref())?;
            let client = Client::new(socket_path(&cli, &resolved));
            client
                .stream_sse("/events", |event| {
                    println!("{}", serde_json::to_string(&event).unwrap_or_default());
                })
                .await?;
        }
    }

    Ok(())
}
