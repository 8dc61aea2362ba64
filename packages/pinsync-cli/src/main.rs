use anyhow::Result;
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;

mod adapter;
mod artifact;
mod backend;
mod config;
mod content;
mod db;
mod dirty;
mod error;
mod health;
mod index;
mod locks;
mod manager;
mod registry;
mod sync;
#[cfg(test)]
mod testing;

use backend::{BackendKind, BackendUpdate, ConfigMap};
use config::ControllerConfig;
use content::Cid;
use error::Outcome;
use manager::BackendManager;

#[derive(Parser)]
#[command(name = "pinsync")]
#[command(about = "Keep content-addressed pins replicated across storage backends", long_about = None)]
#[command(version)]
struct Cli {
    /// Controller home directory (overrides the configured root)
    #[arg(long, global = true, env = config::HOME_ENV)]
    home: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage storage backends
    #[command(subcommand)]
    Backend(BackendCommand),

    /// Manage pin mappings
    #[command(subcommand)]
    Pin(PinCommand),

    /// Mark backends as needing a sync
    #[command(subcommand)]
    Dirty(DirtyCommand),

    /// Sync dirty backends
    Sync {
        /// Mark every enabled backend dirty first
        #[arg(long, conflicts_with = "backend")]
        force: bool,

        /// Sync only this backend, dirty or not
        #[arg(long)]
        backend: Option<String>,
    },

    /// Probe backend connectivity
    Health {
        /// Backend to probe (default: all)
        name: Option<String>,
    },

    /// Show dirty state and sync phase of every backend
    Status,

    /// Drop index rows and state left by removed backends
    Cleanup,

    /// Show the effective controller configuration
    Config {
        /// Save it to the user config file
        #[arg(long)]
        write: bool,
    },
}

#[derive(Subcommand)]
enum BackendCommand {
    /// Register a backend
    Create {
        name: String,

        /// Backend type (local, object-store, content-addressed-network,
        /// archive-host, model-hub, remote-filesystem)
        #[arg(value_name = "TYPE")]
        kind: BackendKind,

        /// Connection parameter, repeatable
        #[arg(long = "config", value_name = "KEY=VALUE", value_parser = parse_key_value)]
        config: Vec<(String, Value)>,

        /// Register without enabling
        #[arg(long)]
        disabled: bool,
    },

    /// List backends
    List {
        /// Include disabled backends
        #[arg(long)]
        all: bool,

        /// Show secret-like values
        #[arg(long)]
        show_sensitive: bool,
    },

    /// Show one backend with its mapping counts and dirty state
    Show {
        name: String,

        #[arg(long)]
        show_sensitive: bool,
    },

    /// Merge configuration changes into a backend
    Update {
        name: String,

        #[arg(long = "config", value_name = "KEY=VALUE", value_parser = parse_key_value)]
        config: Vec<(String, Value)>,

        /// Remove a config key, repeatable
        #[arg(long, value_name = "KEY")]
        unset: Vec<String>,

        #[arg(long, conflicts_with = "disable")]
        enable: bool,

        #[arg(long)]
        disable: bool,
    },

    /// Remove a backend
    Remove {
        name: String,

        /// Also drop its pin mappings
        #[arg(long)]
        force: bool,
    },

    /// Report backend usage
    Stats { name: String },
}

#[derive(Subcommand)]
enum PinCommand {
    /// Associate a CID with a backend
    Add {
        backend: String,
        cid: Cid,

        /// Metadata entry, repeatable
        #[arg(long = "meta", value_name = "KEY=VALUE", value_parser = parse_key_value)]
        meta: Vec<(String, Value)>,
    },

    /// List a backend's mappings, newest first
    List {
        backend: String,

        #[arg(long)]
        limit: Option<u32>,
    },

    /// Find every backend holding a CID
    Find { cid: Cid },

    /// Remove a mapping
    Remove {
        backend: String,
        cid: Cid,

        /// Allow removing the last synced copy
        #[arg(long)]
        allow_last_copy: bool,

        /// Also delete the stored package from the backend
        #[arg(long)]
        purge: bool,
    },

    /// Read a pin's package back from a backend
    Get { backend: String, cid: Cid },
}

#[derive(Subcommand)]
enum DirtyCommand {
    /// Mark one backend dirty
    Mark {
        backend: String,

        #[arg(long, default_value = "manual request")]
        reason: String,
    },

    /// Mark every backend dirty
    MarkAll {
        #[arg(long, default_value = "manual request")]
        reason: String,
    },
}

/// Parse `key=value`; the value is read as JSON when it parses, else as a string
fn parse_key_value(s: &str) -> std::result::Result<(String, Value), String> {
    let (key, raw) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{s}'"))?;
    if key.is_empty() {
        return Err(format!("empty key in '{s}'"));
    }

    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((key.to_string(), value))
}

fn to_map(pairs: Vec<(String, Value)>) -> ConfigMap {
    pairs.into_iter().collect()
}

/// Print an outcome as JSON and report whether it succeeded
fn emit<T: Serialize>(outcome: Outcome<T>) -> Result<bool> {
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(outcome.success)
}

fn emit_result<T: Serialize>(result: error::Result<T>) -> Result<bool> {
    emit(result.into())
}

/// Bulk results succeed only if every entry did
fn emit_bulk<T: Serialize>(data: T, success: bool) -> Result<bool> {
    emit(Outcome {
        success,
        data: Some(data),
        error: None,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout carries the JSON result
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = ControllerConfig::load().await?;
    if let Some(home) = cli.home {
        config.root = home;
    }
    tracing::debug!("Using controller home: {}", config.root.display());

    let manager = match BackendManager::open(&config).await {
        Ok(manager) => manager,
        Err(e) => {
            emit(Outcome::<()>::err(&e))?;
            std::process::exit(1);
        }
    };

    if !run(&manager, &config, cli.command).await? {
        std::process::exit(1);
    }
    Ok(())
}

async fn run(manager: &BackendManager, config: &ControllerConfig, command: Commands) -> Result<bool> {
    match command {
        Commands::Backend(command) => run_backend(manager, command).await,
        Commands::Pin(command) => run_pin(manager, command).await,
        Commands::Dirty(DirtyCommand::Mark { backend, reason }) => {
            emit_result(manager.mark_dirty(&backend, &reason).await)
        }
        Commands::Dirty(DirtyCommand::MarkAll { reason }) => {
            emit_result(manager.mark_all_dirty(&reason).await)
        }
        Commands::Sync {
            backend: Some(name),
            ..
        } => {
            let report = manager.sync_backend(&name).await;
            let success = report.success;
            emit_bulk(report, success)
        }
        Commands::Sync { force: false, .. } => {
            let results = manager.sync_dirty().await;
            let success = results.values().all(|report| report.success);
            emit_bulk(results, success)
        }
        Commands::Sync { force: true, .. } => match manager.sync_all(true).await {
            Ok(results) => {
                let success = results.values().all(|report| report.success);
                emit_bulk(results, success)
            }
            Err(e) => emit(Outcome::<()>::err(&e)),
        },
        Commands::Health { name: Some(name) } => match manager.check_health(&name).await {
            Ok(result) => {
                let healthy = result.healthy;
                emit_bulk(result, healthy)
            }
            Err(e) => emit(Outcome::<()>::err(&e)),
        },
        Commands::Health { name: None } => match manager.check_all_health().await {
            Ok(results) => {
                let healthy = results.values().all(|result| result.healthy);
                emit_bulk(results, healthy)
            }
            Err(e) => emit(Outcome::<()>::err(&e)),
        },
        Commands::Status => emit_result(manager.status_snapshot().await),
        Commands::Cleanup => emit_result(manager.cleanup().await),
        Commands::Config { write } => run_config(config, write).await,
    }
}

async fn run_config(config: &ControllerConfig, write: bool) -> Result<bool> {
    if write {
        let path = config.save().await?;
        tracing::info!("Saved configuration to {}", path.display());
    }
    emit(Outcome::ok(config))
}

async fn run_backend(manager: &BackendManager, command: BackendCommand) -> Result<bool> {
    match command {
        BackendCommand::Create {
            name,
            kind,
            config,
            disabled,
        } => emit_result(
            manager
                .create_backend(&name, kind, to_map(config), !disabled)
                .await,
        ),
        BackendCommand::List {
            all,
            show_sensitive,
        } => emit_result(manager.list_backends(all, show_sensitive).await),
        BackendCommand::Show {
            name,
            show_sensitive,
        } => emit_result(manager.show_backend(&name, show_sensitive).await),
        BackendCommand::Update {
            name,
            config,
            unset,
            enable,
            disable,
        } => {
            let update = BackendUpdate {
                config: to_map(config),
                remove_keys: unset,
                enabled: match (enable, disable) {
                    (true, _) => Some(true),
                    (_, true) => Some(false),
                    _ => None,
                },
            };
            if update.is_empty() {
                tracing::warn!("Nothing to update for '{}'", name);
            }
            emit_result(manager.update_backend(&name, update).await)
        }
        BackendCommand::Remove { name, force } => {
            emit_result(manager.remove_backend(&name, force).await)
        }
        BackendCommand::Stats { name } => emit_result(manager.backend_stats(&name).await),
    }
}

async fn run_pin(manager: &BackendManager, command: PinCommand) -> Result<bool> {
    match command {
        PinCommand::Add { backend, cid, meta } => emit_result(
            manager
                .add_pin(&backend, &cid, Value::Object(to_map(meta)))
                .await,
        ),
        PinCommand::List { backend, limit } => emit_result(manager.list_pins(&backend, limit).await),
        PinCommand::Find { cid } => emit_result(manager.find_pin(&cid).await),
        PinCommand::Remove {
            backend,
            cid,
            allow_last_copy,
            purge,
        } => emit_result(
            manager
                .remove_pin(&backend, &cid, allow_last_copy, purge)
                .await,
        ),
        PinCommand::Get { backend, cid } => emit_result(manager.retrieve_pin(&backend, &cid).await),
    }
}
