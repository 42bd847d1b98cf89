use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use deck_bridge::commands::CommandsProvider;
use deck_bridge::config::{
    BridgeConfig, FileConfig, default_config_dir, load_config, reload_providers,
};
use deck_bridge::{ElectionCoordinator, ProviderRegistry, generate_window_id};

#[derive(Parser)]
#[command(name = "deck-bridge")]
#[command(about = "Share one control deck between editor windows")]
struct Cli {
    /// Config directory (defaults to <config dir>/deck-bridge)
    #[arg(long)]
    config_dir: Option<PathBuf>,

    /// Override `server.port` from config
    #[arg(short, long)]
    port: Option<u16>,

    /// Start as the focused window
    #[arg(long)]
    focused: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.debug {
        "deck_bridge=debug,tower_http=debug,info"
    } else {
        "deck_bridge=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let config_dir = match cli.config_dir {
        Some(dir) => dir,
        None => default_config_dir()?,
    };
    let file_config: FileConfig = load_config(&config_dir)
        .extract()
        .with_context(|| format!("Failed to load config from {}", config_dir.display()))?;
    let mut config = BridgeConfig::from_file(&file_config);
    if let Some(port) = cli.port {
        config.port = port;
    }

    let registry = ProviderRegistry::new(file_config.providers.clone());
    let commands = file_config.commands.clone();
    let commands_handle = if commands.is_empty() {
        info!("no [commands] configured; this window exposes no slots");
        None
    } else {
        let handle = registry
            .register(|notifiers| async move {
                Ok(CommandsProvider::registration(commands, notifiers))
            })
            .await
            .context("Failed to register commands provider")?;
        info!(provider = handle.provider_id(), "registered provider");
        Some(handle)
    };

    let window_id = generate_window_id();
    info!(window_id = %window_id, port = config.port, "starting");
    let coordinator = ElectionCoordinator::new(window_id, registry, config);
    coordinator.set_focused(cli.focused).await;
    let role = coordinator.start().await.context("Election failed")?;
    info!(?role, "elected");
    info!("stdin commands: focus | blur | reload | quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, cleaning up...");
                break;
            }
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => match line.trim() {
                    "focus" => coordinator.set_focused(true).await,
                    "blur" => coordinator.set_focused(false).await,
                    "reload" => {
                        match reload_providers(&config_dir, coordinator.registry()).await {
                            Ok(()) => info!("provider settings reloaded"),
                            Err(e) => warn!("{:#}", e),
                        }
                    }
                    "quit" | "exit" => break,
                    "" => {}
                    other => warn!("unknown command: {}", other),
                },
                // Detached from a terminal; keep serving until Ctrl+C.
                Ok(None) => stdin_open = false,
                Err(e) => {
                    warn!("Failed to read stdin: {}", e);
                    stdin_open = false;
                }
            },
        }
    }

    coordinator.stop().await;
    if let Some(handle) = commands_handle {
        handle.dispose().await;
    }
    Ok(())
}
