use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::agent::{AgentRunner, AgentRunOptions};
use crate::preview::{PreviewInfo, PreviewSupervisor};
use crate::registry::{EventRegistry, Subscriber};

/// Messages a client can send. Tagged JSON with an `event` field for
/// routing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum ClientMessage {
    #[serde(rename = "subscribe")]
    Subscribe { project_id: String },
    #[serde(rename = "unsubscribe")]
    Unsubscribe,
    #[serde(rename = "agent:run")]
    AgentRun {
        agent: String,
        instruction: String,
        model: Option<String>,
        request_id: Option<String>,
    },
    #[serde(rename = "preview:start")]
    PreviewStart {
        repo_path: String,
        port: Option<u16>,
    },
    #[serde(rename = "preview:stop")]
    PreviewStop,
    #[serde(rename = "health")]
    Health,
}

/// Control replies sent back on the same connection. Project events are
/// not represented here; they arrive pre-serialized through the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum ServerMessage {
    #[serde(rename = "connected")]
    Connected,
    #[serde(rename = "subscribed")]
    Subscribed { project_id: String },
    #[serde(rename = "unsubscribed")]
    Unsubscribed,
    #[serde(rename = "preview:ready")]
    PreviewReady { data: PreviewInfo },
    #[serde(rename = "healthResponse")]
    HealthResponse { status: String },
    #[serde(rename = "error")]
    Error { message: String },
}

/// WebSocket acceptor: one task per connection, one writer task per
/// connection, at most one project subscription per connection.
pub struct SocketServer {
    listen_port: u16,
    registry: Arc<EventRegistry>,
    runner: Arc<AgentRunner>,
    supervisor: Arc<PreviewSupervisor>,
}

impl SocketServer {
    pub fn new(
        listen_port: u16,
        registry: Arc<EventRegistry>,
        runner: Arc<AgentRunner>,
        supervisor: Arc<PreviewSupervisor>,
    ) -> Self {
        Self {
            listen_port,
            registry,
            runner,
            supervisor,
        }
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = format!("0.0.0.0:{}", self.listen_port);
        let listener = TcpListener::bind(&addr).await?;
        info!("websocket server listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Accept loop; runs until the listener errors.
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        while let Ok((stream, addr)) = listener.accept().await {
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, addr).await {
                    error!("connection {} failed: {:?}", addr, e);
                }
            });
        }
        Ok(())
    }

    pub async fn start(self: Arc<Self>) -> Result<()> {
        let listener = self.bind().await?;
        self.run(listener).await
    }

    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        info!("new websocket connection from {}", addr);
        let ws_stream = accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        // Everything outbound funnels through one channel so control
        // replies and broadcast frames interleave without contending for
        // the sink.
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if ws_sender.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }
        });

        send_reply(&tx, &ServerMessage::Connected);

        let mut subscription: Option<(String, Uuid)> = None;
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(message) => {
                        self.handle_client_message(message, &tx, &mut subscription)
                            .await
                    }
                    Err(e) => {
                        warn!("unrecognized message from {}: {}", addr, e);
                        send_reply(
                            &tx,
                            &ServerMessage::Error {
                                message: format!("unrecognized message: {}", e),
                            },
                        );
                    }
                },
                Message::Close(_) => break,
                _ => {}
            }
        }

        info!("connection {} closed", addr);
        if let Some((project_id, subscriber_id)) = subscription.take() {
            self.registry.unsubscribe(&project_id, subscriber_id);
        }
        writer.abort();
        Ok(())
    }

    async fn handle_client_message(
        &self,
        message: ClientMessage,
        tx: &mpsc::UnboundedSender<String>,
        subscription: &mut Option<(String, Uuid)>,
    ) {
        match message {
            ClientMessage::Subscribe { project_id } => {
                // Re-subscribing moves the connection to the new project.
                if let Some((old_project, subscriber_id)) = subscription.take() {
                    self.registry.unsubscribe(&old_project, subscriber_id);
                }
                send_reply(
                    tx,
                    &ServerMessage::Subscribed {
                        project_id: project_id.clone(),
                    },
                );
                let subscriber = Subscriber::new(tx.clone());
                let subscriber_id = subscriber.id();
                self.registry.subscribe(&project_id, subscriber);
                *subscription = Some((project_id, subscriber_id));
            }
            ClientMessage::Unsubscribe => {
                if let Some((project_id, subscriber_id)) = subscription.take() {
                    self.registry.unsubscribe(&project_id, subscriber_id);
                }
                send_reply(tx, &ServerMessage::Unsubscribed);
            }
            ClientMessage::AgentRun {
                agent,
                instruction,
                model,
                request_id,
            } => {
                let Some((project_id, _)) = subscription.as_ref() else {
                    send_reply(
                        tx,
                        &ServerMessage::Error {
                            message: "subscribe to a project before running an agent".to_string(),
                        },
                    );
                    return;
                };
                let runner = self.runner.clone();
                let options = AgentRunOptions {
                    project_id: project_id.clone(),
                    agent,
                    instruction,
                    model,
                    request_id,
                    working_dir: None,
                };
                let tx = tx.clone();
                // Long-running; results stream back as project events.
                tokio::spawn(async move {
                    if let Err(e) = runner.run(options).await {
                        send_reply(
                            &tx,
                            &ServerMessage::Error {
                                message: e.to_string(),
                            },
                        );
                    }
                });
            }
            ClientMessage::PreviewStart { repo_path, port } => {
                let Some((project_id, _)) = subscription.as_ref() else {
                    send_reply(
                        tx,
                        &ServerMessage::Error {
                            message: "subscribe to a project before starting a preview"
                                .to_string(),
                        },
                    );
                    return;
                };
                let supervisor = self.supervisor.clone();
                let project_id = project_id.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    match supervisor
                        .start(&project_id, &PathBuf::from(repo_path), port)
                        .await
                    {
                        Ok(info) => send_reply(&tx, &ServerMessage::PreviewReady { data: info }),
                        Err(e) => send_reply(
                            &tx,
                            &ServerMessage::Error {
                                message: e.to_string(),
                            },
                        ),
                    }
                });
            }
            ClientMessage::PreviewStop => {
                let Some((project_id, _)) = subscription.as_ref() else {
                    return;
                };
                self.supervisor.stop(project_id).await;
            }
            ClientMessage::Health => {
                send_reply(
                    tx,
                    &ServerMessage::HealthResponse {
                        status: "ok".to_string(),
                    },
                );
            }
        }
    }
}

fn send_reply(tx: &mpsc::UnboundedSender<String>, message: &ServerMessage) {
    match serde_json::to_string(message) {
        Ok(json) => {
            let _ = tx.send(json);
        }
        Err(e) => error!("failed to serialize reply: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::events::ProjectEvent;
    use crate::publisher::EventPublisher;
    use crate::store::NullStore;
    use std::time::Duration;

    fn test_server() -> (Arc<EventRegistry>, SocketServer) {
        let registry = Arc::new(EventRegistry::new(8, Duration::from_secs(30)));
        let config = Config::default();
        let publisher = Arc::new(EventPublisher::new(registry.clone(), &config));
        let runner = Arc::new(AgentRunner::new(
            publisher.clone(),
            Arc::new(NullStore),
            &config,
        ));
        let supervisor = Arc::new(PreviewSupervisor::new(publisher, &config));
        let server = SocketServer::new(0, registry.clone(), runner, supervisor);
        (registry, server)
    }

    fn parse_event(frame: &str) -> serde_json::Value {
        serde_json::from_str(frame).unwrap()
    }

    #[tokio::test]
    async fn test_subscribe_routes_broadcasts_to_connection() {
        let (registry, server) = test_server();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut subscription = None;

        server
            .handle_client_message(
                ClientMessage::Subscribe {
                    project_id: "p1".to_string(),
                },
                &tx,
                &mut subscription,
            )
            .await;

        let ack = parse_event(&rx.try_recv().unwrap());
        assert_eq!(ack["event"], "subscribed");
        assert_eq!(registry.count("p1"), 1);

        registry.broadcast("p1", &ProjectEvent::error("ping"));
        assert!(rx.try_recv().unwrap().contains("ping"));
    }

    #[tokio::test]
    async fn test_resubscribe_moves_connection_between_projects() {
        let (registry, server) = test_server();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut subscription = None;

        server
            .handle_client_message(
                ClientMessage::Subscribe {
                    project_id: "p1".to_string(),
                },
                &tx,
                &mut subscription,
            )
            .await;
        server
            .handle_client_message(
                ClientMessage::Subscribe {
                    project_id: "p2".to_string(),
                },
                &tx,
                &mut subscription,
            )
            .await;

        assert_eq!(registry.count("p1"), 0);
        assert_eq!(registry.count("p2"), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_detaches_connection() {
        let (registry, server) = test_server();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut subscription = None;

        server
            .handle_client_message(
                ClientMessage::Subscribe {
                    project_id: "p1".to_string(),
                },
                &tx,
                &mut subscription,
            )
            .await;
        server
            .handle_client_message(ClientMessage::Unsubscribe, &tx, &mut subscription)
            .await;

        assert_eq!(registry.count("p1"), 0);
        assert!(subscription.is_none());

        let frames: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert!(frames.last().unwrap().contains("unsubscribed"));
    }

    #[tokio::test]
    async fn test_agent_run_without_subscription_is_rejected() {
        let (_registry, server) = test_server();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut subscription = None;

        server
            .handle_client_message(
                ClientMessage::AgentRun {
                    agent: "coder".to_string(),
                    instruction: "hi".to_string(),
                    model: None,
                    request_id: None,
                },
                &tx,
                &mut subscription,
            )
            .await;

        let reply = parse_event(&rx.try_recv().unwrap());
        assert_eq!(reply["event"], "error");
    }

    #[test]
    fn test_preview_ready_reply_round_trips() {
        use crate::events::ServiceStatus;

        let message = ServerMessage::PreviewReady {
            data: PreviewInfo {
                project_id: "p1".to_string(),
                port: 60123,
                url: "http://127.0.0.1:60123".to_string(),
                status: ServiceStatus::Running,
            },
        };
        let json = serde_json::to_string(&message).unwrap();
        let parsed: ServerMessage = serde_json::from_str(&json).unwrap();
        assert!(matches!(
            parsed,
            ServerMessage::PreviewReady { data } if data.port == 60123
        ));
    }

    #[tokio::test]
    async fn test_health_check_replies_ok() {
        let (_registry, server) = test_server();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut subscription = None;

        server
            .handle_client_message(ClientMessage::Health, &tx, &mut subscription)
            .await;

        let reply = parse_event(&rx.try_recv().unwrap());
        assert_eq!(reply["event"], "healthResponse");
        assert_eq!(reply["status"], "ok");
    }

    #[tokio::test]
    async fn test_end_to_end_over_websocket() {
        let (registry, server) = test_server();
        let server = Arc::new(server);
        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(server.clone().run(listener));

        let url = format!("ws://{}", addr);
        let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

        // Greeting.
        let greeting = ws.next().await.unwrap().unwrap();
        assert!(greeting.to_text().unwrap().contains("connected"));

        ws.send(Message::Text(
            r#"{"event":"subscribe","project_id":"p1"}"#.into(),
        ))
        .await
        .unwrap();
        let ack = ws.next().await.unwrap().unwrap();
        assert!(ack.to_text().unwrap().contains("subscribed"));

        // The ack is enqueued before the registration lands; wait for it.
        for _ in 0..100 {
            if registry.count("p1") == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        registry.broadcast("p1", &ProjectEvent::error("over the wire"));
        let event = ws.next().await.unwrap().unwrap();
        assert!(event.to_text().unwrap().contains("over the wire"));

        ws.close(None).await.unwrap();
    }
}
