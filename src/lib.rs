pub mod config;
pub mod error;
pub mod filament;
pub mod inventory;
pub mod jobs;
pub mod keeper;
pub mod ledger;
pub mod merge;
pub mod moonraker;
pub mod service;
pub mod slot;
pub mod store;
pub mod telemetry;

pub use config::AppConfig;
pub use error::KeeperError;
pub use keeper::{LiveEstimate, ReconcileSummary, SpoolKeeper};
pub use merge::{MergedSlot, MergedState, PhysicalSource};
pub use service::{HistoryPolling, Service};
pub use slot::SlotKey;

/// Run the keeper until Ctrl-C.
pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::from_env()?;
    let service = Service::start(&config)?;

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
    service.shutdown().await;
    Ok(())
}
