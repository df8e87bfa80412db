//! Bridge configuration
//!
//! Built-in defaults, overridden by an optional TOML file, overridden by
//! `UABRIDGE_*` environment variables.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use uabridge_core::{
    ApplicationIdentity, Identity, MonitoredPoint, NodeId, DEFAULT_LISTEN_ADDR,
    DEFAULT_PUBLISHING_INTERVAL_MS, DEFAULT_SESSION_TIMEOUT_MS,
};
use uabridge_protocol::SubscriptionParams;

use crate::backoff::BackoffPolicy;
use crate::error::ConfigError;

/// A node to monitor, with the name shown to web clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "NodeEntry")]
pub struct NodeConfig {
    pub node_id: NodeId,
    pub display_name: Option<String>,
}

/// Nodes may be listed as bare ids or as tables
#[derive(Deserialize)]
#[serde(untagged)]
enum NodeEntry {
    Id(String),
    Full {
        node_id: String,
        #[serde(default)]
        display_name: Option<String>,
    },
}

impl From<NodeEntry> for NodeConfig {
    fn from(entry: NodeEntry) -> Self {
        match entry {
            NodeEntry::Id(node_id) => NodeConfig::new(node_id),
            NodeEntry::Full {
                node_id,
                display_name,
            } => NodeConfig {
                node_id,
                display_name,
            },
        }
    }
}

impl NodeConfig {
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            display_name: None,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Display name, falling back to the node id
    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.node_id)
    }
}

/// Parses `nodeId` or `nodeId|Display Name`
impl FromStr for NodeConfig {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (id, name) = match s.split_once('|') {
            Some((id, name)) => (id.trim(), Some(name.trim())),
            None => (s.trim(), None),
        };
        if id.is_empty() {
            return Err(format!("empty node id in {:?}", s));
        }
        Ok(NodeConfig {
            node_id: id.to_string(),
            display_name: name.filter(|n| !n.is_empty()).map(str::to_string),
        })
    }
}

/// Password that never shows up in logs
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Password(String);

impl Password {
    pub fn new(password: impl Into<String>) -> Self {
        Self(password.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

/// Subscription and monitored item parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionSettings {
    pub lifetime_count: u32,
    pub max_keep_alive_count: u32,
    pub max_notifications_per_publish: u32,
    pub priority: u8,
    /// Defaults to the publishing interval
    pub sampling_interval_ms: Option<u64>,
    pub queue_size: u32,
    pub discard_oldest: bool,
}

impl Default for SubscriptionSettings {
    fn default() -> Self {
        Self {
            lifetime_count: 100,
            max_keep_alive_count: 20,
            max_notifications_per_publish: 10,
            priority: 10,
            sampling_interval_ms: None,
            queue_size: 10,
            discard_oldest: true,
        }
    }
}

/// Timeouts for every outbound call (ms)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    pub discovery_ms: u64,
    pub connect_ms: u64,
    pub subscription_ms: u64,
    pub write_ms: u64,
    pub client_send_ms: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            discovery_ms: 5000,
            connect_ms: 10_000,
            subscription_ms: 5000,
            write_ms: 5000,
            client_send_ms: 1000,
        }
    }
}

/// Bridge configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Discovery address of the industrial server
    pub server_address: String,
    pub nodes: Vec<NodeConfig>,
    /// WebSocket listen address
    pub listen: String,
    pub publishing_interval_ms: u64,
    pub session_timeout_ms: u64,
    pub session_name: String,
    pub application: ApplicationIdentity,
    pub username: Option<String>,
    pub password: Option<Password>,
    pub subscription: SubscriptionSettings,
    pub reconnect: BackoffPolicy,
    pub timeouts: TimeoutSettings,
    /// Include the failure reason in write acknowledgements
    pub echo_write_errors: bool,
    /// Events buffered between the subscription and the fan-out
    pub event_buffer: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            server_address: String::new(),
            nodes: Vec::new(),
            listen: DEFAULT_LISTEN_ADDR.to_string(),
            publishing_interval_ms: DEFAULT_PUBLISHING_INTERVAL_MS,
            session_timeout_ms: DEFAULT_SESSION_TIMEOUT_MS,
            session_name: "UaBridgeSession".to_string(),
            application: ApplicationIdentity::default(),
            username: None,
            password: None,
            subscription: SubscriptionSettings::default(),
            reconnect: BackoffPolicy::default(),
            timeouts: TimeoutSettings::default(),
            echo_write_errors: false,
            event_buffer: 1024,
        }
    }
}

fn parse_env<T: FromStr>(var: &str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::Env {
        var: var.to_string(),
        reason: e.to_string(),
    })
}

fn parse_bool(var: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(ConfigError::Env {
            var: var.to_string(),
            reason: format!("expected a boolean, got {:?}", other),
        }),
    }
}

fn parse_nodes(var: &str, raw: &str) -> Result<Vec<NodeConfig>, ConfigError> {
    raw.split(',')
        .filter(|part| !part.trim().is_empty())
        .map(|part| {
            part.parse().map_err(|reason| ConfigError::Env {
                var: var.to_string(),
                reason,
            })
        })
        .collect()
}

impl BridgeConfig {
    pub fn new(server_address: impl Into<String>, nodes: Vec<NodeConfig>) -> Self {
        Self {
            server_address: server_address.into(),
            nodes,
            ..Default::default()
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Defaults, then the file at `path` if given, then the process
    /// environment. The result is validated.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides read through `lookup`
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(address) = lookup("UABRIDGE_SERVER_ADDRESS").or_else(|| lookup("OPCUA_ENDPOINT"))
        {
            self.server_address = address.trim().to_string();
        }

        if let Some(raw) = lookup("UABRIDGE_NODES") {
            self.nodes = parse_nodes("UABRIDGE_NODES", &raw)?;
        } else if let Some(raw) = lookup("OPCUA_NODE_ID") {
            self.nodes = parse_nodes("OPCUA_NODE_ID", &raw)?;
        }

        if let Some(listen) = lookup("UABRIDGE_LISTEN") {
            self.listen = listen.trim().to_string();
        }
        if let Some(raw) = lookup("UABRIDGE_PUBLISHING_INTERVAL_MS") {
            self.publishing_interval_ms = parse_env("UABRIDGE_PUBLISHING_INTERVAL_MS", &raw)?;
        }
        if let Some(raw) = lookup("UABRIDGE_SESSION_TIMEOUT_MS") {
            self.session_timeout_ms = parse_env("UABRIDGE_SESSION_TIMEOUT_MS", &raw)?;
        }
        if let Some(user) = lookup("UABRIDGE_USERNAME") {
            self.username = Some(user);
        }
        if let Some(password) = lookup("UABRIDGE_PASSWORD") {
            self.password = Some(Password(password));
        }
        if let Some(raw) = lookup("UABRIDGE_ECHO_WRITE_ERRORS") {
            self.echo_write_errors = parse_bool("UABRIDGE_ECHO_WRITE_ERRORS", &raw)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server_address.trim().is_empty() {
            return Err(ConfigError::Invalid("server_address is empty".into()));
        }
        if self.nodes.is_empty() {
            return Err(ConfigError::Invalid("no nodes configured".into()));
        }

        let mut seen = HashSet::new();
        for node in &self.nodes {
            if node.node_id.trim().is_empty() {
                return Err(ConfigError::Invalid("empty node id".into()));
            }
            if !seen.insert(node.node_id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate node id {}",
                    node.node_id
                )));
            }
        }

        self.listen.parse::<SocketAddr>().map_err(|e| {
            ConfigError::Invalid(format!("listen address {:?}: {}", self.listen, e))
        })?;

        let durations = [
            ("publishing_interval_ms", self.publishing_interval_ms),
            ("session_timeout_ms", self.session_timeout_ms),
            ("timeouts.discovery_ms", self.timeouts.discovery_ms),
            ("timeouts.connect_ms", self.timeouts.connect_ms),
            ("timeouts.subscription_ms", self.timeouts.subscription_ms),
            ("timeouts.write_ms", self.timeouts.write_ms),
            ("timeouts.client_send_ms", self.timeouts.client_send_ms),
        ];
        for (name, value) in durations {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be positive", name)));
            }
        }
        if self.subscription.sampling_interval_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "subscription.sampling_interval_ms must be positive".into(),
            ));
        }

        if self.reconnect.multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "reconnect.multiplier must be at least 1.0".into(),
            ));
        }
        if self.reconnect.max_delay_ms < self.reconnect.initial_delay_ms {
            return Err(ConfigError::Invalid(
                "reconnect.max_delay_ms is below reconnect.initial_delay_ms".into(),
            ));
        }
        if self.event_buffer == 0 {
            return Err(ConfigError::Invalid("event_buffer must be positive".into()));
        }
        Ok(())
    }

    pub fn publishing_interval(&self) -> Duration {
        Duration::from_millis(self.publishing_interval_ms)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn sampling_interval(&self) -> Duration {
        Duration::from_millis(
            self.subscription
                .sampling_interval_ms
                .unwrap_or(self.publishing_interval_ms),
        )
    }

    pub fn identity(&self) -> Identity {
        Identity::from_credentials(
            self.username.clone(),
            self.password.as_ref().map(|p| p.expose().to_string()),
        )
    }

    pub fn subscription_params(&self) -> SubscriptionParams {
        SubscriptionParams {
            publishing_interval: self.publishing_interval(),
            lifetime_count: self.subscription.lifetime_count,
            max_keep_alive_count: self.subscription.max_keep_alive_count,
            max_notifications_per_publish: self.subscription.max_notifications_per_publish,
            priority: self.subscription.priority,
            publishing_enabled: true,
        }
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|n| n.node_id.clone()).collect()
    }

    pub fn monitored_points(&self) -> Vec<MonitoredPoint> {
        self.nodes
            .iter()
            .map(|n| MonitoredPoint::new(n.node_id.clone(), n.display_name()))
            .collect()
    }

    /// Write target for `sendValue` messages; only defined for a single node
    pub fn implicit_target(&self) -> Option<NodeId> {
        match self.nodes.as_slice() {
            [only] => Some(only.node_id.clone()),
            _ => None,
        }
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.discovery_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.connect_ms)
    }

    pub fn subscription_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.subscription_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.write_ms)
    }

    pub fn client_send_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.client_send_ms)
    }
}
