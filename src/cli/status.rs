//! Status command handler.

use anyhow::{Context, Result};

use wa_crm_bridge::config::Config;
use wa_crm_bridge::store::{MemoryStore, Store};
use wa_crm_bridge::utils::string::mask_phone;

/// Print every tenant recorded in the store snapshot.
pub(crate) async fn cmd_status(config: &Config) -> Result<()> {
    println!("wa-crm-bridge Status");
    println!("====================");
    println!();
    println!("Bridge:  {}", config.session.bridge_url);
    println!("CRM:     {}", config.crm.api_base);
    println!(
        "Drip:    {} ms + up to {} ms jitter",
        config.queue.default_rate_limit.delay_between_messages_ms,
        config.queue.default_rate_limit.jitter_ms
    );
    println!();

    let Some(path) = config.storage_path() else {
        println!("No storage.path configured; nothing persisted to report.");
        return Ok(());
    };
    let store = MemoryStore::open(path.clone())
        .with_context(|| format!("Failed to open store snapshot {}", path.display()))?;

    let tenants = store.list_sub_accounts().await?;
    if tenants.is_empty() {
        println!("No tenants.");
        return Ok(());
    }

    println!("{:<24} {:<14} {:<16} {:<20} LAST CONNECTED", "TENANT", "STATUS", "PHONE", "LOCATION");
    for t in tenants {
        println!(
            "{:<24} {:<14} {:<16} {:<20} {}",
            t.id,
            t.status.as_str(),
            t.phone_number.as_deref().map(mask_phone).unwrap_or_else(|| "-".into()),
            t.location_id.as_deref().unwrap_or("-"),
            t.last_connected_at
                .map(|d| d.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "never".into())
        );
    }
    Ok(())
}
