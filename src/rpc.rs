use std::collections::HashMap;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::process::Stdio;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// JSON-RPC error code for an unknown inbound method.
const METHOD_NOT_FOUND: i64 = -32601;
/// Generic server-defined error code for a handler that failed.
const HANDLER_FAILED: i64 = -32000;

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("rpc session is stopped")]
    SessionStopped,

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("peer returned error {code}: {message}")]
    Peer { code: i64, message: String },

    #[error("failed to write to peer stdin: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Starting,
    Ready,
    Stopped,
}

type RequestHandler =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, String>> + Send + Sync>;
type NotificationListener = Arc<dyn Fn(Value) + Send + Sync>;
type PendingSender = oneshot::Sender<Result<Value, RpcError>>;

/// One JSON-RPC 2.0 conversation bound to a single subprocess's lifetime,
/// speaking newline-delimited messages over its stdio.
///
/// Outbound requests are correlated to responses by integer id. Inbound
/// requests always get a reply, even when no handler is registered.
/// Stopping the session (or the process dying) rejects every in-flight
/// request rather than leaving callers hanging.
pub struct RpcSession {
    state: Mutex<SessionState>,
    next_id: AtomicI64,
    pending: Mutex<HashMap<i64, PendingSender>>,
    handlers: Mutex<HashMap<String, RequestHandler>>,
    listeners: Mutex<HashMap<String, Vec<NotificationListener>>>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    child: tokio::sync::Mutex<Option<Child>>,
    default_timeout: Duration,
}

impl RpcSession {
    /// Spawns the peer process and attaches the line reader. The returned
    /// session is `Ready`; it transitions to `Stopped` on `stop()` or when
    /// the peer's stdout closes.
    pub async fn spawn(
        program: &str,
        args: &[String],
        default_timeout: Duration,
    ) -> anyhow::Result<Arc<Self>> {
        let session = Arc::new(Self {
            state: Mutex::new(SessionState::Idle),
            next_id: AtomicI64::new(1),
            pending: Mutex::new(HashMap::new()),
            handlers: Mutex::new(HashMap::new()),
            listeners: Mutex::new(HashMap::new()),
            stdin: tokio::sync::Mutex::new(None),
            child: tokio::sync::Mutex::new(None),
            default_timeout,
        });

        *session.state.lock() = SessionState::Starting;
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| anyhow::anyhow!("failed to spawn rpc peer {}: {}", program, e))?;
        info!("spawned rpc peer {} (pid {:?})", program, child.id());

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow::anyhow!("rpc peer has no stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("rpc peer has no stdout"))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("rpc peer stderr: {}", line);
                }
            });
        }

        *session.stdin.lock().await = Some(stdin);
        *session.child.lock().await = Some(child);

        let reader_session = session.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                dispatch_line(&reader_session, &line);
            }
            debug!("rpc peer stdout closed");
            reader_session.stop().await;
        });

        *session.state.lock() = SessionState::Ready;
        Ok(session)
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Registers the handler invoked for inbound requests naming `method`.
    pub fn register_handler<F, Fut>(&self, method: &str, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        let handler: RequestHandler = Arc::new(move |params| Box::pin(handler(params)));
        self.handlers.lock().insert(method.to_string(), handler);
    }

    /// Adds a listener for inbound notifications naming `method`. Multiple
    /// listeners may coexist; each is isolated from the others' failures.
    pub fn on_notification<F>(&self, method: &str, listener: F)
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.listeners
            .lock()
            .entry(method.to_string())
            .or_default()
            .push(Arc::new(listener));
    }

    /// Sends a request and waits for the matching response, subject to the
    /// session's default timeout.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        self.request_with_timeout(method, params, self.default_timeout)
            .await
    }

    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        if self.state() == SessionState::Stopped {
            return Err(RpcError::SessionStopped);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let message = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        if let Err(e) = self.write_message(&message).await {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            // Sender dropped without a reply: the session was torn down.
            Ok(Err(_)) => Err(RpcError::SessionStopped),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(RpcError::Timeout(timeout))
            }
        }
    }

    /// Sends a notification (no id, no reply expected).
    pub async fn notify(&self, method: &str, params: Value) -> Result<(), RpcError> {
        if self.state() == SessionState::Stopped {
            return Err(RpcError::SessionStopped);
        }
        self.write_message(&json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        }))
        .await
    }

    /// Terminates the peer and rejects every pending request. Idempotent.
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock();
            if *state == SessionState::Stopped {
                return;
            }
            *state = SessionState::Stopped;
        }

        // Closing stdin first gives a well-behaved peer a chance to exit
        // before the kill.
        self.stdin.lock().await.take();

        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.start_kill() {
                debug!("rpc peer already gone: {}", e);
            }
            match tokio::time::timeout(Duration::from_secs(2), child.wait()).await {
                Ok(Ok(status)) => info!("rpc peer exited: {:?}", status),
                Ok(Err(e)) => warn!("error reaping rpc peer: {}", e),
                Err(_) => warn!("rpc peer did not exit within 2s of kill"),
            }
        }

        let pending: Vec<PendingSender> = {
            let mut map = self.pending.lock();
            map.drain().map(|(_, tx)| tx).collect()
        };
        if !pending.is_empty() {
            info!("rejecting {} in-flight request(s) on stop", pending.len());
        }
        for tx in pending {
            let _ = tx.send(Err(RpcError::SessionStopped));
        }
    }

    async fn write_message(&self, message: &Value) -> Result<(), RpcError> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(RpcError::SessionStopped)?;
        stdin.write_all(message.to_string().as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    fn complete_request(&self, id: i64, result: Result<Value, RpcError>) {
        match self.pending.lock().remove(&id) {
            Some(tx) => {
                let _ = tx.send(result);
            }
            // Already resolved (timeout) or a foreign id; both are fine.
            None => debug!("ignoring response for unknown request id {}", id),
        }
    }
}

/// Routes one decoded line from the peer. Runs on the session's reader
/// task; inbound request handlers run on their own tasks so a slow handler
/// never stalls dispatch.
fn dispatch_line(session: &Arc<RpcSession>, line: &str) {
    let Ok(message) = serde_json::from_str::<Value>(line) else {
        debug!("ignoring non-json line from rpc peer: {}", line);
        return;
    };

    let id = message.get("id").cloned().filter(|v| !v.is_null());
    let method = message
        .get("method")
        .and_then(Value::as_str)
        .map(str::to_string);

    match (id, method) {
        // Response to one of our requests.
        (Some(id), None) => {
            let Some(id) = id.as_i64() else {
                debug!("ignoring response with non-integer id: {}", id);
                return;
            };
            let result = match message.get("error") {
                Some(err) => Err(RpcError::Peer {
                    code: err.get("code").and_then(Value::as_i64).unwrap_or(0),
                    message: err
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown error")
                        .to_string(),
                }),
                None => Ok(message.get("result").cloned().unwrap_or(Value::Null)),
            };
            session.complete_request(id, result);
        }

        // Inbound request: the peer always gets a reply, even on failure.
        (Some(id), Some(method)) => {
            let params = message.get("params").cloned().unwrap_or(Value::Null);
            let handler = session.handlers.lock().get(&method).cloned();
            let session = session.clone();
            tokio::spawn(async move {
                let reply = match handler {
                    Some(handler) => match handler(params).await {
                        Ok(result) => json!({
                            "jsonrpc": "2.0",
                            "id": id,
                            "result": result,
                        }),
                        Err(message) => json!({
                            "jsonrpc": "2.0",
                            "id": id,
                            "error": { "code": HANDLER_FAILED, "message": message },
                        }),
                    },
                    None => json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "error": {
                            "code": METHOD_NOT_FOUND,
                            "message": format!("method not found: {}", method),
                        },
                    }),
                };
                if let Err(e) = session.write_message(&reply).await {
                    warn!("failed to reply to inbound request {}: {}", method, e);
                }
            });
        }

        // Notification: fan out to listeners, isolating each one.
        (None, Some(method)) => {
            let params = message.get("params").cloned().unwrap_or(Value::Null);
            let listeners = session
                .listeners
                .lock()
                .get(&method)
                .cloned()
                .unwrap_or_default();
            for listener in listeners {
                let outcome = catch_unwind(AssertUnwindSafe(|| listener(params.clone())));
                if outcome.is_err() {
                    error!("notification listener for {} panicked", method);
                }
            }
        }

        (None, None) => debug!("ignoring rpc message with neither id nor method"),
    }
}
