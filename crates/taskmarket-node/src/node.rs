use crate::config::NodeConfig;
use anyhow::Result;
use std::future::Future;
use std::sync::Arc;
use taskmarket_core::{InMemoryTransport, MarketEvent, MarketStats, TaskRegistry};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Outcome of [`MarketNode::run_until`]
#[derive(Debug, Clone)]
pub struct ShutdownReport {
    pub stats: MarketStats,
    /// Market events forwarded to the log, including those drained at shutdown
    pub events_logged: usize,
}

struct EventLogger {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<usize>,
}

fn log_event(event: &MarketEvent) {
    info!(
        task_id = event.task_id,
        event = event.kind.name(),
        status = %event.status,
        "📣 Market event"
    );
    debug!(?event, "Market event detail");
}

/// Process host: one registry over the in-memory settlement ledger.
pub struct MarketNode {
    config: NodeConfig,
    pub transport: Arc<InMemoryTransport>,
    pub registry: Arc<TaskRegistry>,
    events: Option<mpsc::UnboundedReceiver<MarketEvent>>,
}

impl MarketNode {
    pub fn from_config(config: NodeConfig) -> Result<Self> {
        info!(
            endpoint = %config.settlement.endpoint,
            network = %config.settlement.network,
            "Initializing task market node..."
        );

        let transport = Arc::new(InMemoryTransport::new(config.settlement.clone()));
        let (registry, events) = TaskRegistry::with_events(config.market.clone(), transport.clone())?;

        Ok(Self {
            config,
            transport,
            registry: Arc::new(registry),
            events: Some(events),
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Forward market events into the log until stopped; whatever is still
    /// queued at that point is drained before the task exits.
    fn spawn_event_logger(&mut self) -> Option<EventLogger> {
        let mut events = self.events.take()?;
        let (stop, mut stopped) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let mut logged: usize = 0;
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(event) => {
                            log_event(&event);
                            logged += 1;
                        }
                        None => return logged,
                    },
                    _ = &mut stopped => break,
                }
            }
            while let Ok(event) = events.try_recv() {
                log_event(&event);
                logged += 1;
            }
            logged
        });
        Some(EventLogger { stop, handle })
    }

    /// Run until `shutdown` resolves; returns the final market statistics.
    pub async fn run_until<F>(mut self, shutdown: F) -> Result<ShutdownReport>
    where
        F: Future<Output = ()>,
    {
        let logger = self.spawn_event_logger();
        info!(
            council = self.config.market.council.len(),
            quorum = self.config.market.quorum,
            "✨ Task market node ready"
        );

        shutdown.await;

        let stats = self.registry.market_stats().await;
        info!(
            total_tasks = stats.total_tasks,
            open = stats.open_tasks,
            completed = stats.completed_tasks,
            total_locked = stats.total_locked,
            total_paid_out = stats.total_paid_out,
            "🛑 Task market node stopping"
        );

        let mut events_logged = 0;
        if let Some(logger) = logger {
            // Err only if the logger already exited
            let _ = logger.stop.send(());
            match logger.handle.await {
                Ok(count) => events_logged = count,
                Err(e) => warn!(error = %e, "Event logger task failed"),
            }
        }
        debug!(events_logged, "Event logger drained");

        Ok(ShutdownReport {
            stats,
            events_logged,
        })
    }
}
