//! Pingboard - endpoint reachability monitor.
//!
//! Usage: `pingboard [IMPORT_FILE]`, where the optional file holds one
//! `ADDRESS [DESCRIPTION]` per line to append to the stored endpoint list.

use pingboard::address::{import_endpoints, Target};
use pingboard::config::{MonitorConfig, DEFAULT_PORT};
use pingboard::endpoint::{Endpoint, Field};
use pingboard::registry::{load_endpoints, save_endpoints, Registry};
use pingboard::scheduler::{EndpointUpdate, Scheduler};

use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("pingboard=info".parse()?))
        .init();

    // Load configuration
    let cfg = MonitorConfig::load();
    cfg.validate()?;
    tracing::info!("Using endpoint list at {}", cfg.endpoints_path.display());

    let registry = match load_endpoints(&cfg.endpoints_path) {
        Ok(records) => Registry::from_records(records)?,
        Err(e) if e.is_not_found() => Registry::new(),
        Err(e) => return Err(e.into()),
    };

    if let Some(path) = std::env::args().nth(1) {
        let text = tokio::fs::read_to_string(&path).await?;
        let first = registry
            .next_index()
            .await
            .ok_or("no endpoint index left to import into")?;
        let imported = import_endpoints(&text, first);
        tracing::info!("Imported {} endpoints from {}", imported.len(), path);
        for endpoint in imported {
            registry.add(endpoint).await?;
        }
    }

    // Add sample endpoint if none exist
    if registry.is_empty().await {
        tracing::info!("Adding sample endpoint: Google");
        let mut endpoint =
            Endpoint::from_target(0, Target::from_hostname("www.google.com", DEFAULT_PORT));
        endpoint.set_description("Google");
        registry.add(endpoint).await?;
    }

    let registry = Arc::new(registry);
    let scheduler = Scheduler::with_system_network(registry.clone());
    tokio::spawn(report(scheduler.subscribe(), registry.clone()));

    let endpoints_path = cfg.endpoints_path.clone();
    scheduler.start(cfg).await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");

    scheduler.stop().await?;
    save_endpoints(&endpoints_path, &registry.records().await)?;
    tracing::info!("Saved endpoint list to {}", endpoints_path.display());

    Ok(())
}

/// Log one line per recorded round.
async fn report(
    mut updates: tokio::sync::broadcast::Receiver<EndpointUpdate>,
    registry: Arc<Registry>,
) {
    loop {
        let update = match updates.recv().await {
            Ok(update) => update,
            Err(RecvError::Lagged(n)) => {
                tracing::warn!("Report: Missed {} updates", n);
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        if !update.fields.contains(&Field::History) {
            continue;
        }
        let Some(slot) = registry.get(update.index).await else {
            continue;
        };

        let endpoint = slot.lock().await;
        let Some(last) = endpoint.history().last() else {
            continue;
        };
        tracing::info!(
            "{} [{}] {:?}: icmp {:?} tcp {:?}",
            endpoint.hostname().unwrap_or("?"),
            endpoint.ip().map(|ip| ip.to_string()).unwrap_or_default(),
            endpoint.display_status(),
            last.icmp.as_ref().map(|r| (r.status, r.rtt)),
            last.tcp.as_ref().map(|r| (r.status, r.rtt)),
        );
    }
}
