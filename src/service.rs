//! Background tasks: telemetry supervisor, reconciler and history poller.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::inventory::InventorySync;
use crate::jobs::HistoryFeed;
use crate::keeper::SpoolKeeper;
use crate::moonraker::MoonrakerClient;
use crate::store::StateStore;
use crate::telemetry::{Backoff, ConnectionSupervisor, TelemetryView};

/// Polls missed before the stream counts as dead.
const MISSED_POLLS: u32 = 3;

/// How often and how deep to poll the job history.
#[derive(Debug, Clone, Copy)]
pub struct HistoryPolling {
    pub interval: Duration,
    pub limit: usize,
}

/// A running keeper and its background tasks.
pub struct Service {
    keeper: Arc<SpoolKeeper>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Service {
    /// Build everything from config and start the tasks on the current runtime.
    ///
    /// Without a printer URL only the keeper is built; no tasks run.
    pub fn start(config: &AppConfig) -> Result<Self> {
        if !config.printer.enabled() {
            warn!("No printer URL configured, telemetry and history polling disabled");
            let (_, telemetry) = watch::channel(TelemetryView::default());
            return Ok(Self {
                keeper: Arc::new(open_keeper(config, telemetry)),
                cancel: CancellationToken::new(),
                tasks: Vec::new(),
            });
        }

        let printer = Arc::new(MoonrakerClient::new(&config.printer)?);
        let frame_timeout =
            config.printer.poll_interval() * MISSED_POLLS + config.printer.request_timeout();
        let (supervisor, telemetry) =
            ConnectionSupervisor::new(printer.clone(), Backoff::from(&config.backoff), frame_timeout);
        let keeper = Arc::new(open_keeper(config, telemetry));

        Ok(Self::spawn(
            keeper,
            supervisor,
            printer,
            HistoryPolling {
                interval: config.printer.history_interval(),
                limit: config.printer.history_limit,
            },
        ))
    }

    /// Start the tasks around an already built keeper.
    pub fn spawn(
        keeper: Arc<SpoolKeeper>,
        supervisor: ConnectionSupervisor,
        feed: Arc<dyn HistoryFeed>,
        history: HistoryPolling,
    ) -> Self {
        let cancel = CancellationToken::new();
        let tasks = vec![
            tokio::spawn(supervisor.run(cancel.clone())),
            tokio::spawn(reconcile_loop(keeper.clone(), keeper.subscribe(), cancel.clone())),
            tokio::spawn(history_loop(keeper.clone(), feed, history, cancel.clone())),
        ];
        Self {
            keeper,
            cancel,
            tasks,
        }
    }

    pub fn keeper(&self) -> Arc<SpoolKeeper> {
        self.keeper.clone()
    }

    /// Stop all tasks and wait for them. State is already on disk after every command.
    pub async fn shutdown(self) {
        info!("Shutting down");
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                error!("Background task failed: {}", e);
            }
        }
    }
}

fn open_keeper(config: &AppConfig, telemetry: watch::Receiver<TelemetryView>) -> SpoolKeeper {
    let store = StateStore::new(config.state_path());
    info!("State file: {:?}", store.path());
    SpoolKeeper::open(
        store,
        config.tracking.clone(),
        InventorySync::from_config(&config.inventory),
        telemetry,
    )
}

async fn reconcile_loop(
    keeper: Arc<SpoolKeeper>,
    mut telemetry: watch::Receiver<TelemetryView>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = telemetry.changed() => {
                if changed.is_err() {
                    debug!("Telemetry channel closed");
                    break;
                }
            }
        }
        match keeper.reconcile_telemetry().await {
            Ok(summary) => {
                for (slot, spool_id) in &summary.auto_linked {
                    debug!("Reconcile linked slot {} to spool {}", slot, spool_id);
                }
            }
            Err(e) => warn!("Telemetry reconcile failed: {}", e),
        }
    }
}

async fn history_loop(
    keeper: Arc<SpoolKeeper>,
    feed: Arc<dyn HistoryFeed>,
    history: HistoryPolling,
    cancel: CancellationToken,
) {
    loop {
        let fetched = tokio::select! {
            _ = cancel.cancelled() => break,
            result = feed.fetch_jobs(history.limit) => result,
        };
        match fetched {
            Ok(entries) => {
                if let Err(e) = keeper.ingest_history(&entries).await {
                    warn!("History ingest failed: {}", e);
                }
            }
            Err(e) => warn!("History poll failed: {}", e),
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(history.interval) => {}
        }
    }
}
