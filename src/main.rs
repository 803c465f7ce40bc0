use anyhow::Result;
use helion::bus::SerialBus;
use helion::bus::transport::RtuTransport;
use helion::config::Config;
use helion::flags::FlagStore;
use helion::inbox::{CommandInbox, SourceWatcher};
use helion::scheduler::Scheduler;
use helion::telemetry::TelemetrySnapshot;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Optional single argument: the base directory holding the boundary
    // files and, when present, the configuration file.
    let base_override = std::env::args().nth(1).map(PathBuf::from);

    let config_path = resolve_config_path(base_override.as_deref());
    let mut config = match &config_path {
        Some(path) => Config::from_file(path)
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?,
        None => Config::default(),
    };
    if let Some(base) = base_override {
        config.paths.base_dir = base;
    }

    helion::logging::init_logging(&config.logging)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    if !config.autorun && !std::io::stdin().is_terminal() {
        info!("autorun disabled and no terminal attached, exiting");
        return Ok(());
    }

    std::fs::create_dir_all(&config.paths.base_dir)?;

    info!("Helion energy management controller starting up");

    let config = Arc::new(config);
    let (config_tx, config_rx) = watch::channel(config.clone());
    let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(TelemetrySnapshot::default()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let flags = Arc::new(FlagStore::new(config.paths.clone()));
    flags.seed_sharing_from_file();
    flags.mirror_all();

    let inbox = Arc::new(CommandInbox::new());

    let transport = RtuTransport::new(&config.serial, config.bus.read_functioncode);
    let bus = SerialBus::new(
        Box::new(transport),
        config_rx,
        inbox.clone(),
        snapshot_tx,
    );
    let mut bus_handle = tokio::spawn(bus.run(shutdown_rx.clone()));

    let watcher = SourceWatcher::new(
        inbox.clone(),
        config.paths.to_source_path(),
        Duration::from_millis(config.bus.inbox_poll_ms),
    );
    let watcher_handle = tokio::spawn(watcher.run(shutdown_rx.clone()));

    let scheduler = Scheduler::new(
        config.clone(),
        config_tx,
        config_path,
        flags,
        inbox,
        snapshot_rx,
    );
    let scheduler_handle = tokio::spawn(scheduler.run(shutdown_rx));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupt received, shutting down");
        }
        res = &mut bus_handle => {
            // the bus only returns early on a fatal startup error
            match res {
                Ok(Err(e)) => {
                    error!("Bus failed: {}", e);
                    shutdown_tx.send(true).ok();
                    let _ = scheduler_handle.await;
                    let _ = watcher_handle.await;
                    return Err(anyhow::anyhow!("Bus error: {}", e));
                }
                Ok(Ok(())) => info!("Bus stopped"),
                Err(e) => return Err(anyhow::anyhow!("Bus task panicked: {}", e)),
            }
        }
    }

    shutdown_tx.send(true).ok();
    let _ = scheduler_handle.await;
    let _ = watcher_handle.await;
    if !bus_handle.is_finished() {
        let _ = bus_handle.await;
    }

    info!("Shutdown complete");
    Ok(())
}

/// Pick the configuration file: `<base>/helion_config.yaml` when a base path
/// is given and the file exists, otherwise the first default location.
fn resolve_config_path(base: Option<&std::path::Path>) -> Option<PathBuf> {
    if let Some(base) = base {
        let candidate = base.join("helion_config.yaml");
        if candidate.exists() {
            return Some(candidate);
        }
        return None;
    }
    [
        "helion_config.yaml",
        "/data/helion_config.yaml",
        "/etc/helion/config.yaml",
    ]
    .iter()
    .map(PathBuf::from)
    .find(|p| p.exists())
}
