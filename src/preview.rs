use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::events::{ProjectEvent, ServiceStatus};
use crate::ports::{find_available_port, is_port_available};
use crate::publisher::EventPublisher;
use crate::registry::EventRegistry;

#[derive(Debug, thiserror::Error)]
pub enum PreviewError {
    #[error("no free port in range {0}-{1}")]
    NoFreePort(u16, u16),

    #[error("requested port {0} is already in use")]
    PortInUse(u16),

    #[error("preview command is not configured")]
    EmptyCommand,

    #[error("failed to spawn dev-server: {0}")]
    SpawnFailed(String),

    #[error("dev-server exited during startup (code {0:?})")]
    DiedDuringStartup(Option<i32>),
}

/// Connection info for a live (or starting) preview.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewInfo {
    pub project_id: String,
    pub port: u16,
    pub url: String,
    pub status: ServiceStatus,
}

struct PreviewHandle {
    port: u16,
    status: ServiceStatus,
    child: Arc<tokio::sync::Mutex<Option<Child>>>,
}

/// Supervises at most one dev-server process per project.
///
/// `start` on an already-running project is an idempotent no-op that
/// returns the live instance's info; a client that wants a fresh server
/// stops first. Teardown also happens automatically once a project's
/// subscriber count has stayed at zero through the debounce window.
pub struct PreviewSupervisor {
    instances: DashMap<String, PreviewHandle>,
    publisher: Arc<EventPublisher>,
    command: Vec<String>,
    port_start: u16,
    port_end: u16,
    grace: Duration,
    stop_wait: Duration,
    debounce: Duration,
}

impl PreviewSupervisor {
    pub fn new(publisher: Arc<EventPublisher>, config: &Config) -> Self {
        Self {
            instances: DashMap::new(),
            publisher,
            command: config.preview_command.clone(),
            port_start: config.preview_port_start,
            port_end: config.preview_port_end,
            grace: Duration::from_secs(config.preview_grace_secs),
            stop_wait: Duration::from_secs(2),
            debounce: Duration::from_secs(config.idle_debounce_secs),
        }
    }

    /// Starts the project's dev-server on an allocated port and reports
    /// its URL once it is up (confirmed listening, or still alive after
    /// the grace period for servers with no readiness signal).
    pub async fn start(
        &self,
        project_id: &str,
        repo_path: &Path,
        port: Option<u16>,
    ) -> Result<PreviewInfo, PreviewError> {
        // Idempotent fast path; stale error entries get replaced.
        if let Some(handle) = self.instances.get(project_id) {
            match handle.status {
                ServiceStatus::Running | ServiceStatus::Starting => {
                    info!("preview for {} already {:?}", project_id, handle.status);
                    return Ok(self.info(project_id, &handle));
                }
                ServiceStatus::Error | ServiceStatus::Stopped => {
                    drop(handle);
                    self.instances.remove(project_id);
                }
            }
        }

        let port = match port {
            Some(explicit) if is_port_available(explicit) => explicit,
            Some(explicit) => return Err(PreviewError::PortInUse(explicit)),
            None => find_available_port(self.port_start..=self.port_end)
                .ok_or(PreviewError::NoFreePort(self.port_start, self.port_end))?,
        };

        let child = match self.spawn_dev_server(repo_path, port).await {
            Ok(child) => child,
            Err(e) => {
                self.publish_status(project_id, ServiceStatus::Error, None, Some(e.to_string()))
                    .await;
                return Err(e);
            }
        };
        info!(
            "starting preview for {} on port {} (pid {:?})",
            project_id,
            port,
            child.id()
        );

        let child = Arc::new(tokio::sync::Mutex::new(Some(child)));
        self.instances.insert(
            project_id.to_string(),
            PreviewHandle {
                port,
                status: ServiceStatus::Starting,
                child: child.clone(),
            },
        );

        if let Err(exit_code) = self.await_ready(&child, port).await {
            self.set_status(project_id, ServiceStatus::Error);
            let reason = format!("dev-server exited during startup (code {:?})", exit_code);
            self.publish_status(project_id, ServiceStatus::Error, None, Some(reason))
                .await;
            return Err(PreviewError::DiedDuringStartup(exit_code));
        }

        self.set_status(project_id, ServiceStatus::Running);
        let url = format!("http://127.0.0.1:{}", port);
        self.publish_status(project_id, ServiceStatus::Running, Some(url.clone()), None)
            .await;

        Ok(PreviewInfo {
            project_id: project_id.to_string(),
            port,
            url,
            status: ServiceStatus::Running,
        })
    }

    /// Stops the project's preview: graceful TERM, bounded wait, then a
    /// hard kill. Idempotent; ends in `stopped` regardless of prior state.
    pub async fn stop(&self, project_id: &str) {
        let Some((_, handle)) = self.instances.remove(project_id) else {
            debug!("no preview to stop for {}", project_id);
            return;
        };

        if let Some(mut child) = handle.child.lock().await.take() {
            terminate(&mut child, self.stop_wait).await;
        }
        info!("stopped preview for {}", project_id);
        self.publish_status(project_id, ServiceStatus::Stopped, None, None)
            .await;
    }

    pub fn status(&self, project_id: &str) -> ServiceStatus {
        self.instances
            .get(project_id)
            .map(|h| h.status)
            .unwrap_or(ServiceStatus::Stopped)
    }

    /// Kills every supervised preview; shutdown hook.
    pub async fn stop_all(&self) {
        let project_ids: Vec<String> = self.instances.iter().map(|e| e.key().clone()).collect();
        for project_id in project_ids {
            self.stop(&project_id).await;
        }
    }

    /// Consumes registry idle notices and tears down previews nobody is
    /// watching anymore. A subscriber returning within the debounce window
    /// cancels the teardown.
    pub async fn run_idle_watcher(
        self: Arc<Self>,
        registry: Arc<EventRegistry>,
        mut idle_rx: mpsc::UnboundedReceiver<String>,
    ) {
        while let Some(project_id) = idle_rx.recv().await {
            let supervisor = self.clone();
            let registry = registry.clone();
            tokio::spawn(async move {
                tokio::time::sleep(supervisor.debounce).await;
                if registry.count(&project_id) > 0 {
                    debug!("subscriber returned to {}, keeping preview", project_id);
                    return;
                }
                if supervisor.status(&project_id) != ServiceStatus::Stopped {
                    info!("tearing down idle preview for {}", project_id);
                    supervisor.stop(&project_id).await;
                }
            });
        }
    }

    async fn spawn_dev_server(&self, repo_path: &Path, port: u16) -> Result<Child, PreviewError> {
        let Some((program, args)) = self.command.split_first() else {
            return Err(PreviewError::EmptyCommand);
        };

        let mut cmd = Command::new(program);
        for arg in args {
            cmd.arg(arg.replace("{port}", &port.to_string()));
        }
        cmd.env("PORT", port.to_string())
            .current_dir(normalize_dir(repo_path))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| PreviewError::SpawnFailed(format!("{}: {}", program, e)))?;

        // Dev-server output is diagnostics only.
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("dev-server stdout: {}", line);
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("dev-server stderr: {}", line);
                }
            });
        }

        Ok(child)
    }

    /// Polls until the server accepts connections, the process dies, or
    /// the grace period runs out with the process still alive (treated as
    /// up, since not every dev-server binds promptly).
    async fn await_ready(
        &self,
        child: &Arc<tokio::sync::Mutex<Option<Child>>>,
        port: u16,
    ) -> Result<(), Option<i32>> {
        let deadline = tokio::time::Instant::now() + self.grace;
        loop {
            {
                let mut guard = child.lock().await;
                if let Some(child) = guard.as_mut() {
                    if let Ok(Some(status)) = child.try_wait() {
                        return Err(status.code());
                    }
                }
            }

            let probe = tokio::time::timeout(
                Duration::from_millis(100),
                tokio::net::TcpStream::connect(("127.0.0.1", port)),
            )
            .await;
            if matches!(probe, Ok(Ok(_))) {
                return Ok(());
            }

            if tokio::time::Instant::now() >= deadline {
                debug!("grace period elapsed for port {}, assuming server is up", port);
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(150)).await;
        }
    }

    fn set_status(&self, project_id: &str, status: ServiceStatus) {
        if let Some(mut handle) = self.instances.get_mut(project_id) {
            handle.status = status;
        }
    }

    fn info(&self, project_id: &str, handle: &PreviewHandle) -> PreviewInfo {
        PreviewInfo {
            project_id: project_id.to_string(),
            port: handle.port,
            url: format!("http://127.0.0.1:{}", handle.port),
            status: handle.status,
        }
    }

    async fn publish_status(
        &self,
        project_id: &str,
        status: ServiceStatus,
        url: Option<String>,
        reason: Option<String>,
    ) {
        self.publisher
            .publish(project_id, &ProjectEvent::status(status, url, reason))
            .await;
    }
}

fn normalize_dir(path: &Path) -> PathBuf {
    if path.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        path.to_path_buf()
    }
}

/// TERM first, bounded wait, then SIGKILL. Mirrors how interactive dev
/// servers expect to be shut down (vite and friends clean up on TERM).
async fn terminate(child: &mut Child, wait: Duration) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        let _ = std::process::Command::new("kill")
            .args(["-TERM", &pid.to_string()])
            .output();
        if tokio::time::timeout(wait, child.wait()).await.is_ok() {
            return;
        }
        warn!("process {} ignored TERM, killing", pid);
    }

    if let Err(e) = child.start_kill() {
        debug!("process already gone: {}", e);
    }
    match tokio::time::timeout(wait, child.wait()).await {
        Ok(_) => {}
        Err(_) => warn!("process did not exit after kill"),
    }
}
