pub mod agent;
pub mod config;
pub mod events;
pub mod ports;
pub mod preview;
pub mod publisher;
pub mod registry;
pub mod rpc;
pub mod server;
pub mod store;
pub mod stream;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::info;

use agent::AgentRunner;
use config::Config;
use preview::PreviewSupervisor;
use publisher::EventPublisher;
use registry::EventRegistry;
use server::SocketServer;
use store::ProjectStore;

/// Wires the registry, publisher, agent runner and preview supervisor
/// together and owns the idle-teardown loop. Must be constructed inside a
/// tokio runtime.
pub struct App {
    pub config: Config,
    pub registry: Arc<EventRegistry>,
    pub publisher: Arc<EventPublisher>,
    pub runner: Arc<AgentRunner>,
    pub supervisor: Arc<PreviewSupervisor>,
}

impl App {
    pub fn new(config: Config, store: Arc<dyn ProjectStore>) -> Self {
        let registry = Arc::new(EventRegistry::new(
            config.buffer_max_events,
            Duration::from_secs(config.buffer_ttl_secs),
        ));
        let (idle_tx, idle_rx) = mpsc::unbounded_channel();
        registry.set_idle_notifier(idle_tx);

        let publisher = Arc::new(EventPublisher::new(registry.clone(), &config));
        let runner = Arc::new(AgentRunner::new(publisher.clone(), store, &config));
        let supervisor = Arc::new(PreviewSupervisor::new(publisher.clone(), &config));

        // Previews nobody is watching get torn down after a debounce.
        tokio::spawn(
            supervisor
                .clone()
                .run_idle_watcher(registry.clone(), idle_rx),
        );

        Self {
            config,
            registry,
            publisher,
            runner,
            supervisor,
        }
    }

    /// Runs the websocket acceptor until it errors or the task is dropped.
    pub async fn serve(&self) -> Result<()> {
        let server = Arc::new(SocketServer::new(
            self.config.listen_port,
            self.registry.clone(),
            self.runner.clone(),
            self.supervisor.clone(),
        ));
        server.start().await
    }

    /// Kills every supervised subprocess; called on shutdown.
    pub async fn shutdown(&self) {
        info!("shutting down, stopping all previews");
        self.supervisor.stop_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ProjectEvent;
    use crate::store::NullStore;

    #[tokio::test]
    async fn test_app_wiring_buffers_unwatched_events() {
        let app = App::new(Config::default(), Arc::new(NullStore));
        app.publisher
            .publish("p1", &ProjectEvent::error("nobody home"))
            .await;
        assert_eq!(app.registry.pending_count("p1"), 1);
    }
}
