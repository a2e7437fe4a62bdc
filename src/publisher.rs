use std::sync::Arc;

use serde_json::json;
use tracing::{debug, warn};

use crate::config::Config;
use crate::events::ProjectEvent;
use crate::registry::EventRegistry;

/// Best-effort event publisher that works whether the subscriber lives in
/// this process or in a sibling instance of the same deployment.
///
/// The deployment may run the user-facing HTTP server and the long-lived
/// socket acceptor as separate runtime instances that do not share memory,
/// so the local registry alone cannot guarantee delivery. Publish therefore
/// falls through three tiers: local broadcast, network forward, local
/// pending buffer. Errors never propagate to the caller.
pub struct EventPublisher {
    registry: Arc<EventRegistry>,
    client: reqwest::Client,
    forwarding_enabled: bool,
    broadcast_url: Option<String>,
    broadcast_secret: Option<String>,
}

impl EventPublisher {
    pub fn new(registry: Arc<EventRegistry>, config: &Config) -> Self {
        Self {
            registry,
            client: reqwest::Client::new(),
            forwarding_enabled: config.forwarding_enabled,
            broadcast_url: config.broadcast_url.clone(),
            broadcast_secret: config.broadcast_secret.clone(),
        }
    }

    pub fn registry(&self) -> &Arc<EventRegistry> {
        &self.registry
    }

    /// Publishes one event to a project channel, fire-and-forget.
    ///
    /// Local delivery and its buffer fallback are one atomic registry
    /// operation, so a subscriber leaving mid-publish leaves the event in
    /// the pending buffer rather than lost.
    pub async fn publish(&self, project_id: &str, event: &ProjectEvent) {
        let Some(frame) = event.to_frame() else {
            return;
        };

        if !self.forwarding_enabled {
            self.registry.deliver_frame(project_id, frame);
            return;
        }

        // Somebody local is watching; skip the wire.
        if self.registry.count(project_id) > 0 {
            self.registry.deliver_frame(project_id, frame);
            return;
        }

        match self.forward(project_id, event).await {
            Ok(()) => debug!("forwarded event for {} to sibling instance", project_id),
            Err(e) => {
                // Forwarding is best-effort; hand the frame back to the
                // registry, which delivers it if a subscriber arrived in
                // the meantime and buffers it otherwise.
                warn!("event forwarding failed for {}: {}", project_id, e);
                self.registry.deliver_frame(project_id, frame);
            }
        }
    }

    async fn forward(&self, project_id: &str, event: &ProjectEvent) -> anyhow::Result<()> {
        let url = self
            .broadcast_url
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("no broadcast endpoint configured"))?;

        let mut request = self.client.post(url).json(&json!({
            "projectId": project_id,
            "event": event,
        }));
        if let Some(secret) = &self.broadcast_secret {
            request = request.header("x-internal-secret", secret);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            anyhow::bail!("broadcast endpoint returned {}", response.status());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Subscriber;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn publisher(forwarding: bool, url: Option<&str>) -> EventPublisher {
        let registry = Arc::new(EventRegistry::new(8, Duration::from_secs(30)));
        let config = Config {
            forwarding_enabled: forwarding,
            broadcast_url: url.map(str::to_string),
            ..Config::default()
        };
        EventPublisher::new(registry, &config)
    }

    #[tokio::test]
    async fn test_publish_prefers_local_broadcast() {
        let publisher = publisher(true, Some("http://127.0.0.1:1/unreachable"));
        let (tx, mut rx) = mpsc::unbounded_channel();
        publisher
            .registry()
            .subscribe("p1", Subscriber::new(tx));

        publisher.publish("p1", &ProjectEvent::error("local")).await;

        // Delivered locally, nothing buffered, no forwarding attempted.
        assert!(rx.try_recv().unwrap().contains("local"));
        assert_eq!(publisher.registry().pending_count("p1"), 0);
    }

    #[tokio::test]
    async fn test_publish_to_dead_subscriber_lands_in_buffer() {
        let publisher = publisher(false, None);
        let (tx, rx) = mpsc::unbounded_channel();
        publisher.registry().subscribe("p1", Subscriber::new(tx));
        drop(rx);

        // The registered subscriber's connection is already gone; the
        // event must survive in the pending buffer.
        publisher.publish("p1", &ProjectEvent::error("kept")).await;
        assert_eq!(publisher.registry().count("p1"), 0);
        assert_eq!(publisher.registry().pending_count("p1"), 1);
    }

    #[tokio::test]
    async fn test_publish_buffers_when_forwarding_disabled() {
        let publisher = publisher(false, None);
        publisher.publish("p1", &ProjectEvent::error("held")).await;
        assert_eq!(publisher.registry().pending_count("p1"), 1);
    }

    #[tokio::test]
    async fn test_forwarding_failure_is_swallowed_and_buffered() {
        // Nothing listens on this port; the POST fails and the event must
        // land in the pending buffer without the call erroring.
        let publisher = publisher(true, Some("http://127.0.0.1:9/broadcast"));
        publisher.publish("p1", &ProjectEvent::error("routed")).await;
        assert_eq!(publisher.registry().pending_count("p1"), 1);
    }

    #[tokio::test]
    async fn test_forwarding_without_endpoint_falls_back_to_buffer() {
        let publisher = publisher(true, None);
        publisher.publish("p1", &ProjectEvent::error("no url")).await;
        assert_eq!(publisher.registry().pending_count("p1"), 1);
    }
}
