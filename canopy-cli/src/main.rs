//! Canopy plugin console
//!
//! Manages the local plugin registry and runs enabled plugins in their
//! sandboxes.
//!
//! Usage:
//!   canopy install-demo
//!   canopy run
//!   canopy exec canopy.demo.hello

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use canopy_plugin_host::admin::DebugConsole;
use canopy_plugin_host::config::HostConfig;
use canopy_plugin_host::{
    HostApi, InMemoryCommandRegistry, JsonFilePersistence, PluginOrchestrator, PluginStorage,
    RegistryStore, SqliteKeyValueStore,
};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "canopy")]
#[command(about = "Canopy plugin host console")]
struct Args {
    /// Path to config.toml (defaults to ~/.canopy/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the data directory holding plugins.json and storage.db
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Enable verbose debug logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List installed plugins
    List,
    /// Install the bundled demo plugin (enabled)
    InstallDemo,
    /// Install a plugin package from a .zip archive (disabled)
    Install { archive: PathBuf },
    Enable { plugin_id: String },
    Disable { plugin_id: String },
    Uninstall { plugin_id: String },
    /// Start every enabled plugin and keep them running until Ctrl-C
    Run,
    /// Start enabled plugins and run one contributed command
    Exec { command_id: String },
    /// Issue a host-API call on behalf of a running plugin
    Call {
        plugin_id: String,
        method: String,
        /// JSON argument array
        #[arg(default_value = "[]")]
        args: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .compact()
        .init();

    let mut config = match &args.config {
        Some(path) => HostConfig::load_from(path),
        None => HostConfig::load(),
    };
    if let Some(dir) = args.data_dir {
        config.paths.data_dir = Some(dir);
    }

    let registry = Arc::new(
        RegistryStore::new(JsonFilePersistence::new(config.registry_path()))
            .context("failed to open plugin registry")?,
    );
    let console = DebugConsole::new(Arc::clone(&registry));

    match args.command {
        Command::List => {
            let plugins = console.list();
            if plugins.is_empty() {
                println!("No plugins installed.");
            }
            for plugin in plugins {
                let state = if plugin.enabled { "enabled" } else { "disabled" };
                println!("{} {} ({}, {:?})", plugin.id, plugin.version, state, plugin.source);
                if !plugin.permissions.is_empty() {
                    println!("  permissions: {}", plugin.permissions.join(", "));
                }
                if !plugin.commands.is_empty() {
                    println!("  commands:    {}", plugin.commands.join(", "));
                }
                if !plugin.has_entry {
                    println!("  (no entry module)");
                }
            }
        }
        Command::InstallDemo => {
            let record = console.install_demo()?;
            println!("Installed {} {}", record.id(), record.manifest.version);
        }
        Command::Install { archive } => {
            let record = console
                .install_from_zip(&archive)
                .with_context(|| format!("failed to install {}", archive.display()))?;
            println!(
                "Installed {} {} (disabled; run `canopy enable {}`)",
                record.id(),
                record.manifest.version,
                record.id()
            );
        }
        Command::Enable { plugin_id } => report_toggle(&plugin_id, console.enable(&plugin_id)?, "enabled"),
        Command::Disable { plugin_id } => {
            report_toggle(&plugin_id, console.disable(&plugin_id)?, "disabled")
        }
        Command::Uninstall { plugin_id } => {
            if console.uninstall(&plugin_id)? {
                println!("Uninstalled {plugin_id}");
            } else {
                println!("{plugin_id} is not installed");
            }
        }
        Command::Run => {
            let orchestrator = build_orchestrator(&config, registry)?;
            orchestrator.sync().await;
            orchestrator.watch_registry();
            info!(running = ?orchestrator.running_ids(), "Plugin host running, Ctrl-C to stop");

            tokio::signal::ctrl_c().await?;
            info!("Shutting down...");
            orchestrator.shutdown().await;
        }
        Command::Exec { command_id } => {
            let orchestrator = build_orchestrator(&config, registry)?;
            orchestrator.sync().await;
            let ran = orchestrator.execute_command(&command_id);
            // Shutdown queues the stop behind the invocation.
            orchestrator.shutdown().await;
            if !ran {
                bail!("no running plugin provides command '{command_id}'");
            }
        }
        Command::Call {
            plugin_id,
            method,
            args,
        } => {
            let call_args: serde_json::Value =
                serde_json::from_str(&args).context("arguments must be a JSON array")?;
            let orchestrator = build_orchestrator(&config, registry)?;
            orchestrator.sync().await;
            let result = orchestrator.host_call(&plugin_id, &method, call_args).await;
            orchestrator.shutdown().await;
            println!("{}", serde_json::to_string_pretty(&result?)?);
        }
    }

    Ok(())
}

fn build_orchestrator(
    config: &HostConfig,
    registry: Arc<RegistryStore>,
) -> Result<PluginOrchestrator> {
    let storage_path = config.storage_path();
    let backend = SqliteKeyValueStore::open(&storage_path)
        .with_context(|| format!("failed to open {}", storage_path.display()))?;
    let storage = PluginStorage::new(Arc::new(backend), config.storage.quota_bytes);
    let host_api = Arc::new(HostApi::new(Arc::new(storage)));

    Ok(PluginOrchestrator::new(
        registry,
        host_api,
        Arc::new(InMemoryCommandRegistry::new()),
        config.resource_limits(),
    ))
}

fn report_toggle(plugin_id: &str, changed: bool, state: &str) {
    if changed {
        println!("{plugin_id} {state}");
    } else {
        warn!("{plugin_id} was already {state}");
    }
}
