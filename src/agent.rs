use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::events::{EventKind, ProjectEvent};
use crate::publisher::EventPublisher;
use crate::rpc::RpcSession;
use crate::store::{MessageRecord, ProjectStore};
use crate::stream::{decode_line, AgentStreamMessage, DecodedLine, LineBuffer};

/// Options for one agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRunOptions {
    pub project_id: String,
    /// Agent name passed as `--mode`.
    pub agent: String,
    pub instruction: String,
    pub model: Option<String>,
    /// Correlates the run's events with the client request that caused it.
    pub request_id: Option<String>,
    pub working_dir: Option<PathBuf>,
}

#[derive(Debug)]
pub struct AgentRunOutcome {
    pub run_id: String,
    pub content: String,
    pub duration_ms: u64,
    pub exit_code: Option<i32>,
    pub failed: bool,
}

/// Runs agent subprocesses and converts their newline-delimited JSON
/// output into project events, streamed as they decode rather than
/// waited-for in full.
pub struct AgentRunner {
    publisher: Arc<EventPublisher>,
    store: Arc<dyn ProjectStore>,
    binary: String,
    rpc_timeout: Duration,
}

impl AgentRunner {
    pub fn new(publisher: Arc<EventPublisher>, store: Arc<dyn ProjectStore>, config: &Config) -> Self {
        Self {
            publisher,
            store,
            binary: config.agent_binary.clone(),
            rpc_timeout: Duration::from_secs(config.rpc_timeout_secs),
        }
    }

    /// Spawns the agent and drives its output stream to completion,
    /// publishing deltas as they arrive and a commit (or failure) event at
    /// the end. The decoded result is persisted best-effort.
    pub async fn run(&self, options: AgentRunOptions) -> Result<AgentRunOutcome> {
        let binary = which::which(&self.binary)
            .map_err(|e| anyhow!("agent binary {:?} not found: {}", self.binary, e))?;

        let run_id = Uuid::new_v4().to_string();
        let started = Instant::now();
        info!(
            "starting agent run {} for project {} (agent={}, model={:?})",
            run_id, options.project_id, options.agent, options.model
        );

        let mut cmd = Command::new(&binary);
        cmd.arg("--mode")
            .arg(&options.agent)
            .arg("--instruction")
            .arg(&options.instruction);
        if let Some(model) = &options.model {
            cmd.arg("--model").arg(model);
        }
        if let Some(dir) = &options.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn agent {:?}", binary))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("agent has no stdout"))?;

        // Stderr is diagnostics only, never protocol data.
        if let Some(stderr) = child.stderr.take() {
            let stderr_run_id = run_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("agent {} stderr: {}", stderr_run_id, line);
                }
            });
        }

        let mut framer = LineBuffer::new();
        let mut content = String::new();
        let mut failed = false;
        let mut chunk = [0u8; 4096];

        loop {
            let n = match stdout.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    warn!("agent stdout read failed: {}", e);
                    break;
                }
            };
            for line in framer.push(&chunk[..n]) {
                self.handle_line(&options, &line, &mut content, &mut failed)
                    .await;
            }
        }
        // The stream can end without a final newline.
        if let Some(rest) = framer.take_remainder() {
            self.handle_line(&options, &rest, &mut content, &mut failed)
                .await;
        }

        let status = child.wait().await.context("failed to reap agent")?;
        let duration_ms = started.elapsed().as_millis() as u64;
        let exit_code = status.code();

        if !failed && !status.success() {
            // Died without saying why; tell the client something anyway.
            failed = true;
            self.publisher
                .publish(
                    &options.project_id,
                    &ProjectEvent::error(format!("agent exited with code {:?}", exit_code)),
                )
                .await;
        }

        if !failed {
            self.publisher
                .publish(
                    &options.project_id,
                    &ProjectEvent::commit(
                        options.request_id.clone(),
                        content.clone(),
                        duration_ms,
                        exit_code,
                    ),
                )
                .await;
        }
        self.persist(&options, &run_id, &content, duration_ms, failed)
            .await;

        info!(
            "agent run {} finished in {}ms (exit={:?}, failed={})",
            run_id, duration_ms, exit_code, failed
        );
        Ok(AgentRunOutcome {
            run_id,
            content,
            duration_ms,
            exit_code,
            failed,
        })
    }

    async fn handle_line(
        &self,
        options: &AgentRunOptions,
        line: &str,
        content: &mut String,
        failed: &mut bool,
    ) {
        match decode_line(line) {
            Some(DecodedLine::Message(AgentStreamMessage::Chunk { data })) => {
                content.push_str(&data.text);
                self.publisher
                    .publish(
                        &options.project_id,
                        &ProjectEvent::delta(
                            options.request_id.clone(),
                            data.text,
                            content.clone(),
                        ),
                    )
                    .await;
            }
            Some(DecodedLine::Message(AgentStreamMessage::Complete { data })) => {
                // Authoritative final text.
                *content = data.text;
            }
            Some(DecodedLine::Message(AgentStreamMessage::Error { message })) => {
                // Mark the run failed but keep draining; the agent may
                // still flush useful output before exiting.
                *failed = true;
                self.publisher
                    .publish(&options.project_id, &ProjectEvent::error(message))
                    .await;
            }
            Some(DecodedLine::Literal(text)) => {
                let with_newline = format!("{}\n", text);
                content.push_str(&with_newline);
                self.publisher
                    .publish(
                        &options.project_id,
                        &ProjectEvent::delta(
                            options.request_id.clone(),
                            with_newline,
                            content.clone(),
                        ),
                    )
                    .await;
            }
            None => {}
        }
    }

    async fn persist(
        &self,
        options: &AgentRunOptions,
        run_id: &str,
        content: &str,
        duration_ms: u64,
        failed: bool,
    ) {
        if !failed {
            let record =
                MessageRecord::assistant(&options.project_id, content.to_string(), duration_ms);
            if let Err(e) = self.store.create_message(record).await {
                warn!("failed to persist message for run {}: {}", run_id, e);
            }
        }
        let request_id = options.request_id.as_deref().unwrap_or(run_id);
        let status = if failed { "failed" } else { "completed" };
        if let Err(e) = self
            .store
            .update_request_status(request_id, status, None)
            .await
        {
            warn!("failed to update request status for run {}: {}", run_id, e);
        }
    }

    /// Opens a bidirectional control session with the agent. Streamed
    /// output the agent pushes as `stream/chunk` notifications is
    /// republished on the project channel, and the agent can call back
    /// into the host for project metadata.
    pub async fn start_control_session(&self, project_id: &str) -> Result<Arc<RpcSession>> {
        let binary = which::which(&self.binary)
            .map_err(|e| anyhow!("agent binary {:?} not found: {}", self.binary, e))?;
        let binary = binary
            .to_str()
            .ok_or_else(|| anyhow!("agent binary path is not valid UTF-8"))?
            .to_string();

        let args = vec!["--mode".to_string(), "control".to_string()];
        let session = RpcSession::spawn(&binary, &args, self.rpc_timeout).await?;

        let publisher = self.publisher.clone();
        let chunk_project = project_id.to_string();
        session.on_notification("stream/chunk", move |params| {
            let text = params
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let publisher = publisher.clone();
            let project_id = chunk_project.clone();
            tokio::spawn(async move {
                publisher
                    .publish(&project_id, &ProjectEvent::new(EventKind::StreamChunk { text }))
                    .await;
            });
        });

        let store = self.store.clone();
        let lookup_project = project_id.to_string();
        session.register_handler("host/project", move |_params| {
            let store = store.clone();
            let project_id = lookup_project.clone();
            async move {
                match store.find_project(&project_id).await {
                    Ok(Some(record)) => serde_json::to_value(record).map_err(|e| e.to_string()),
                    Ok(None) => Ok(Value::Null),
                    Err(e) => Err(e.to_string()),
                }
            }
        });

        Ok(session)
    }
}
