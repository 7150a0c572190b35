//! Serve command handler: runs the connector until Ctrl+C.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use wa_crm_bridge::config::Config;
use wa_crm_bridge::crm::{CrmClient, GhlClient};
use wa_crm_bridge::service::ConnectorService;
use wa_crm_bridge::session::BridgeSessionClient;
use wa_crm_bridge::store::{MemoryStore, Store};
use wa_crm_bridge::utils::logging::init_logging;

/// Session events buffered between the bridge and the service.
const EVENT_BUFFER: usize = 1024;

pub(crate) async fn cmd_serve(config: Config, restore: bool) -> Result<()> {
    init_logging(&config.logging).with_context(|| "Failed to initialize logging")?;
    config.validate().with_context(|| "Invalid configuration")?;

    let store: Arc<dyn Store> = match config.storage_path() {
        Some(path) => Arc::new(
            MemoryStore::open(path.clone())
                .with_context(|| format!("Failed to open store {}", path.display()))?
                .with_message_limit(config.storage.max_messages),
        ),
        None => {
            warn!("storage.path is unset; tenants and mappings live in memory only");
            Arc::new(MemoryStore::new().with_message_limit(config.storage.max_messages))
        }
    };

    let crm: Option<Arc<dyn CrmClient>> = if config.crm.access_tokens.is_empty() {
        warn!("No CRM access tokens configured; CRM sync disabled");
        None
    } else {
        Some(Arc::new(
            GhlClient::new(config.crm.clone()).with_context(|| "Failed to build CRM client")?,
        ))
    };

    let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
    let bridge = Arc::new(BridgeSessionClient::new(config.session.clone(), event_tx));
    bridge
        .start()
        .with_context(|| "Failed to start session bridge client")?;

    let service = Arc::new(
        ConnectorService::new(config.clone(), store, bridge.clone(), crm)
            .with_context(|| "Failed to build connector service")?,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = service.spawn_origin_sweeper(shutdown_rx.clone());
    let event_loop = tokio::spawn(Arc::clone(&service).run_event_loop(event_rx, shutdown_rx));

    if restore && config.lifecycle.restore_on_startup {
        match service.restore_sessions().await {
            Ok(n) => info!("Startup restore requested {} sessions", n),
            Err(e) => warn!("Startup restore failed: {}", e),
        }
    }

    println!();
    println!("Connector is running. Press Ctrl+C to stop.");
    println!();

    tokio::signal::ctrl_c()
        .await
        .with_context(|| "Failed to listen for Ctrl+C")?;

    println!();
    println!("Shutting down...");

    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(2), event_loop).await;
    let _ = tokio::time::timeout(Duration::from_secs(2), sweeper).await;
    bridge.stop();

    println!("Connector stopped.");
    Ok(())
}
