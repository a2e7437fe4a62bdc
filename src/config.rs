use serde::{Deserialize, Serialize};
use tracing::warn;

/// Runtime configuration, sourced from `SWITCHBOARD_*` environment
/// variables with working defaults for a single local instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Port the websocket acceptor listens on.
    pub listen_port: u16,

    /// Whether events published with no local subscriber are forwarded to
    /// another instance of the deployment. When disabled they are held in
    /// the pending buffer instead.
    pub forwarding_enabled: bool,
    /// Internal broadcast endpoint of the deployment, e.g.
    /// `http://127.0.0.1:8080/internal/broadcast`.
    pub broadcast_url: Option<String>,
    /// Shared secret sent as `x-internal-secret` on forwarded events.
    pub broadcast_secret: Option<String>,

    /// Max events held per project while no subscriber is connected.
    pub buffer_max_events: usize,
    /// Seconds a buffered event stays deliverable.
    pub buffer_ttl_secs: u64,

    /// Name of the agent binary resolved on PATH.
    pub agent_binary: String,

    /// Default timeout for RPC requests to an agent control session.
    pub rpc_timeout_secs: u64,

    /// Command used to start a project's dev-server; `{port}` tokens in
    /// arguments are substituted with the allocated port.
    pub preview_command: Vec<String>,
    /// Inclusive port range previews are allocated from.
    pub preview_port_start: u16,
    pub preview_port_end: u16,
    /// Seconds to wait for the dev-server to start listening before
    /// assuming it is up anyway.
    pub preview_grace_secs: u64,
    /// Seconds between the last subscriber leaving and the preview being
    /// torn down.
    pub idle_debounce_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: 4850,
            forwarding_enabled: false,
            broadcast_url: None,
            broadcast_secret: None,
            buffer_max_events: 256,
            buffer_ttl_secs: 30,
            agent_binary: "agent".to_string(),
            rpc_timeout_secs: 60,
            preview_command: vec!["npm".to_string(), "run".to_string(), "dev".to_string()],
            preview_port_start: 60000,
            preview_port_end: 61000,
            preview_grace_secs: 10,
            idle_debounce_secs: 5,
        }
    }
}

impl Config {
    /// Loads configuration from the environment, falling back to defaults
    /// for anything unset or unparseable.
    pub fn load() -> Self {
        let defaults = Self::default();
        Self {
            listen_port: env_parse("SWITCHBOARD_PORT", defaults.listen_port),
            forwarding_enabled: env_parse(
                "SWITCHBOARD_FORWARDING_ENABLED",
                defaults.forwarding_enabled,
            ),
            broadcast_url: std::env::var("SWITCHBOARD_BROADCAST_URL").ok(),
            broadcast_secret: std::env::var("SWITCHBOARD_BROADCAST_SECRET").ok(),
            buffer_max_events: env_parse("SWITCHBOARD_BUFFER_MAX", defaults.buffer_max_events),
            buffer_ttl_secs: env_parse("SWITCHBOARD_BUFFER_TTL_SECS", defaults.buffer_ttl_secs),
            agent_binary: std::env::var("SWITCHBOARD_AGENT_BINARY")
                .unwrap_or(defaults.agent_binary),
            rpc_timeout_secs: env_parse("SWITCHBOARD_RPC_TIMEOUT_SECS", defaults.rpc_timeout_secs),
            preview_command: std::env::var("SWITCHBOARD_PREVIEW_COMMAND")
                .map(|raw| raw.split_whitespace().map(str::to_string).collect())
                .ok()
                .filter(|cmd: &Vec<String>| !cmd.is_empty())
                .unwrap_or(defaults.preview_command),
            preview_port_start: env_parse(
                "SWITCHBOARD_PREVIEW_PORT_START",
                defaults.preview_port_start,
            ),
            preview_port_end: env_parse("SWITCHBOARD_PREVIEW_PORT_END", defaults.preview_port_end),
            preview_grace_secs: env_parse(
                "SWITCHBOARD_PREVIEW_GRACE_SECS",
                defaults.preview_grace_secs,
            ),
            idle_debounce_secs: env_parse(
                "SWITCHBOARD_IDLE_DEBOUNCE_SECS",
                defaults.idle_debounce_secs,
            ),
        }
    }
}

fn env_parse<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("ignoring unparseable {}={:?}", key, raw);
            default
        }),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_self_consistent() {
        let config = Config::default();
        assert!(config.preview_port_start < config.preview_port_end);
        assert!(config.buffer_max_events > 0);
        assert!(!config.preview_command.is_empty());
    }
}
