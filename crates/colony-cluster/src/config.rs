use colony_core::TaskAction;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Frames larger than this are rejected.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 1024 * 1024;
/// Growth factor between consecutive reconnect delays.
pub const RECONNECT_MULTIPLIER: f64 = 1.5;
/// A peer silent for this many heartbeat intervals is considered lost.
pub const MISSED_HEARTBEATS: u32 = 3;

/// One configured peer node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub url: String,
    #[serde(default)]
    pub display_name: Option<String>,
    /// Action tags the peer accepts. Empty means any.
    #[serde(default)]
    pub specialization: Vec<String>,
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Higher is preferred for delegation.
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_weight() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

impl PeerConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            display_name: None,
            specialization: Vec::new(),
            weight: default_weight(),
            priority: 0,
            enabled: true,
        }
    }

    pub fn with_specialization<I, S>(mut self, actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.specialization = actions.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.url)
    }

    /// True iff the specialization is empty or lists `action`.
    pub fn can_handle(&self, action: TaskAction) -> bool {
        self.specialization.is_empty()
            || self
                .specialization
                .iter()
                .any(|s| s.trim().eq_ignore_ascii_case(action.as_str()))
    }
}

/// Timing of every outbound peer link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerLinkSettings {
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    #[serde(default = "default_task_timeout_ms")]
    pub task_timeout_ms: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,
}

fn default_heartbeat_interval_ms() -> u64 {
    15_000
}

fn default_connection_timeout_ms() -> u64 {
    30_000
}

fn default_task_timeout_ms() -> u64 {
    30_000
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_reconnect_base_delay_ms() -> u64 {
    4000
}

impl Default for PeerLinkSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            connection_timeout_ms: default_connection_timeout_ms(),
            task_timeout_ms: default_task_timeout_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
        }
    }
}

impl PeerLinkSettings {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    /// Silence after which the link is declared lost.
    pub fn heartbeat_deadline(&self) -> Duration {
        self.heartbeat_interval() * MISSED_HEARTBEATS
    }

    /// Delay before the reconnect that follows `attempts` failed ones:
    /// `base * 1.5^attempts`.
    pub fn reconnect_delay(&self, attempts: u32) -> Duration {
        let factor = RECONNECT_MULTIPLIER.powi(attempts.min(64) as i32);
        Duration::from_millis((self.reconnect_base_delay_ms as f64 * factor).round() as u64)
    }
}

/// Listener and peer roster of this node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_node_name")]
    pub node_name: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
    /// Ping period for inbound clients.
    #[serde(default = "default_client_heartbeat_interval_ms")]
    pub client_heartbeat_interval_ms: u64,
}

fn default_node_name() -> String {
    "colony-node".to_string()
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    8800
}

fn default_max_message_bytes() -> usize {
    DEFAULT_MAX_MESSAGE_BYTES
}

fn default_client_heartbeat_interval_ms() -> u64 {
    15_000
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_name: default_node_name(),
            host: default_host(),
            listen_port: default_listen_port(),
            peers: Vec::new(),
            max_message_bytes: default_max_message_bytes(),
            client_heartbeat_interval_ms: default_client_heartbeat_interval_ms(),
        }
    }
}

impl NodeConfig {
    pub fn client_heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.client_heartbeat_interval_ms.max(1))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_delays_grow_by_half() {
        let settings = PeerLinkSettings::default();
        let delays: Vec<u64> = (0..4)
            .map(|n| settings.reconnect_delay(n).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![4000, 6000, 9000, 13_500]);
    }

    #[test]
    fn test_link_defaults() {
        let settings = PeerLinkSettings::default();
        assert_eq!(settings.heartbeat_interval(), Duration::from_secs(15));
        assert_eq!(settings.heartbeat_deadline(), Duration::from_secs(45));
        assert_eq!(settings.connection_timeout(), Duration::from_secs(30));
        assert_eq!(settings.task_timeout(), Duration::from_secs(30));
        assert_eq!(settings.max_reconnect_attempts, 10);
    }

    #[test]
    fn test_peer_config_defaults() {
        let peer: PeerConfig = serde_json::from_str(r#"{"url":"ws://10.0.0.2:8800/ws"}"#).unwrap();
        assert!(peer.enabled);
        assert_eq!(peer.weight, 1);
        assert_eq!(peer.priority, 0);
        assert_eq!(peer.name(), "ws://10.0.0.2:8800/ws");
        assert!(peer.can_handle(TaskAction::Combat));
    }

    #[test]
    fn test_specialization_limits_actions() {
        let peer = PeerConfig::new("ws://x").with_specialization(["mine", "Gather"]);
        assert!(peer.can_handle(TaskAction::Mine));
        assert!(peer.can_handle(TaskAction::Gather));
        assert!(!peer.can_handle(TaskAction::Build));
    }

    #[test]
    fn test_node_defaults() {
        let node = NodeConfig::default();
        assert_eq!(node.listen_port, 8800);
        assert_eq!(node.max_message_bytes, 1024 * 1024);
        assert!(node.peers.is_empty());
    }
}
