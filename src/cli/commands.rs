//! CLI command implementations
//!
//! Each command loads the configuration, starts the instance, runs one
//! operation as the system subject and shuts the instance down again, even
//! when the operation failed.

use std::fs;
use std::path::Path;

use serde_json::{json, Value};

use crate::config::DatabaseConfig;
use crate::index::ReindexMode;
use crate::observability::Logger;
use crate::pool::{BrokerPool, InstanceManager, DEFAULT_INSTANCE};
use crate::security::Subject;

use super::args::Command;
use super::errors::{CliError, CliResult};
use super::io::write_response;

/// Marker of an initialized data directory: the collection table
const COLLECTIONS_TABLE: &str = "collections.dbx";

/// Main CLI entry point
pub fn run() -> CliResult<()> {
    let cli = super::args::Cli::parse_args();
    run_command(&cli.config, cli.command)
}

/// Run one command and print its JSON result
pub fn run_command(config_path: &Path, cmd: Command) -> CliResult<()> {
    let data = execute(config_path, cmd)?;
    write_response(data)
}

/// Run one command and return its result
pub fn execute(config_path: &Path, cmd: Command) -> CliResult<Value> {
    match cmd {
        Command::Init => init(config_path),
        Command::Mkcol { path } => with_instance(config_path, |pool| {
            let collection = pool.with_broker(&Subject::system(), |b| b.get_or_create_collection(&path))?;
            Ok(json!({"id": collection.id, "path": collection.path}))
        }),
        Command::Ls { path } => with_instance(config_path, |pool| {
            let listing = pool.with_broker(&Subject::system(), |b| b.list_collection(&path))?;
            Ok(serde_json::to_value(listing)?)
        }),
        Command::Rmcol { path } => with_instance(config_path, |pool| {
            pool.with_broker(&Subject::system(), |b| b.remove_collection(&path))?;
            Ok(json!({"removed": path}))
        }),
        Command::PutBinary {
            collection,
            name,
            file,
            mime,
        } => {
            let data = fs::read(&file)
                .map_err(|e| CliError::io_error(format!("Failed to read {}: {}", file.display(), e)))?;
            with_instance(config_path, |pool| {
                let doc = pool.with_broker(&Subject::system(), |b| {
                    b.store_binary_resource(&collection, &name, &data, &mime)
                })?;
                Ok(json!({
                    "id": doc.id,
                    "name": doc.name,
                    "size": doc.metadata.content_length,
                    "digest": doc.metadata.digest,
                }))
            })
        }
        Command::Reindex { path, mode } => {
            let mode = parse_mode(&mode)?;
            with_instance(config_path, |pool| {
                let report = pool.with_broker(&Subject::system(), |b| b.reindex_collection(&path, mode))?;
                Ok(serde_json::to_value(report)?)
            })
        }
        Command::Stats => with_instance(config_path, |pool| Ok(serde_json::to_value(pool.report()?)?)),
    }
}

fn parse_mode(mode: &str) -> CliResult<ReindexMode> {
    match mode {
        "store" => Ok(ReindexMode::Store),
        "repair" => Ok(ReindexMode::Repair),
        "remove" => Ok(ReindexMode::Remove),
        other => Err(CliError::config_error(format!(
            "Invalid reindex mode: '{}'. Expected store, repair or remove.",
            other
        ))),
    }
}

fn load_config(config_path: &Path) -> CliResult<DatabaseConfig> {
    let config = DatabaseConfig::load(config_path)
        .map_err(|e| CliError::config_error(format!("Failed to load config: {}", e)))?;
    if let Some(severity) = config.log_severity() {
        Logger::set_threshold(severity);
    }
    Ok(config)
}

fn is_initialized(data_dir: &Path) -> bool {
    data_dir.join(COLLECTIONS_TABLE).exists()
}

/// Create the data directory and the root collection.
pub fn init(config_path: &Path) -> CliResult<Value> {
    let config = load_config(config_path)?;
    if is_initialized(&config.data_dir) {
        return Err(CliError::already_initialized());
    }
    let data_dir = config.data_dir.display().to_string();

    let manager = InstanceManager::new();
    manager.configure(DEFAULT_INSTANCE, config).map_err(CliError::boot_failed)?;
    manager.stop(DEFAULT_INSTANCE, false)?;

    Ok(json!({"initialized": true, "data_dir": data_dir}))
}

fn with_instance<F>(config_path: &Path, f: F) -> CliResult<Value>
where
    F: FnOnce(&BrokerPool) -> CliResult<Value>,
{
    let config = load_config(config_path)?;
    if !is_initialized(&config.data_dir) {
        return Err(CliError::not_initialized());
    }

    let manager = InstanceManager::new();
    let pool = manager.configure(DEFAULT_INSTANCE, config).map_err(CliError::boot_failed)?;
    let result = f(&pool);
    let stopped = manager.stop(DEFAULT_INSTANCE, false);

    let value = result?;
    stopped?;
    Ok(value)
}
