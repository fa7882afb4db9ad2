use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use group_hub::{
    AllowAll, Authenticator, ConnectionConfig, DEFAULT_BROADCAST_TIMEOUT,
    DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_QUEUE_CAPACITY, MemberId, RegistryConfig, StaticTokens,
};
use serde::{Deserialize, Serialize};

// =============================================================================
// File config (figment-deserialized from defaults / hub.toml / env vars)
// =============================================================================
//
//   hub.toml:        [hub]
//                    default_group = "lobby"
//
//   env var:         HUB_HUB__DEFAULT_GROUP=lobby   (double underscore = nesting)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub hub: HubFileConfig,
    #[serde(default)]
    pub auth: AuthFileConfig,
}

/// Listener settings (lives under `[server]` in hub.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    /// 0 picks a free port.
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Connection and group tunables (lives under `[hub]` in hub.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HubFileConfig {
    #[serde(default = "default_group")]
    pub default_group: String,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_queue_capacity")]
    pub inbound_capacity: usize,
    #[serde(default = "default_queue_capacity")]
    pub outbound_capacity: usize,
    #[serde(default = "default_broadcast_timeout_ms")]
    pub broadcast_timeout_ms: u64,
    #[serde(default)]
    pub prune_empty_groups: bool,
}

impl Default for HubFileConfig {
    fn default() -> Self {
        Self {
            default_group: default_group(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            inbound_capacity: default_queue_capacity(),
            outbound_capacity: default_queue_capacity(),
            broadcast_timeout_ms: default_broadcast_timeout_ms(),
            prune_empty_groups: false,
        }
    }
}

/// Token table (lives under `[auth]` in hub.toml). Empty accepts everyone.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AuthFileConfig {
    #[serde(default)]
    pub tokens: HashMap<String, MemberId>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_group() -> String {
    "lobby".to_string()
}
fn default_heartbeat_interval_secs() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL.as_secs()
}
fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}
fn default_broadcast_timeout_ms() -> u64 {
    DEFAULT_BROADCAST_TIMEOUT.as_millis() as u64
}

/// Build a figment that layers: defaults → hub.toml → HUB_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `HUB_SERVER__PORT=9000`  →  `server.port = 9000`
///   `HUB_HUB__PRUNE_EMPTY_GROUPS=true`  →  `hub.prune_empty_groups = true`
pub fn load_config(path: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("HUB_").split("__"))
}

// =============================================================================
// Runtime config (derived from FileConfig, handed to the hub library)
// =============================================================================

#[derive(Clone, Debug)]
pub struct HubConfig {
    pub addr: SocketAddr,
    pub default_group: String,
    pub connection: ConnectionConfig,
    pub registry: RegistryConfig,
    pub tokens: HashMap<String, MemberId>,
}

impl HubConfig {
    pub fn from_file(fc: &FileConfig) -> Result<Self> {
        let addr = format!("{}:{}", fc.server.host, fc.server.port)
            .parse::<SocketAddr>()
            .with_context(|| {
                format!(
                    "Invalid listen address {}:{}",
                    fc.server.host, fc.server.port
                )
            })?;
        anyhow::ensure!(
            !fc.hub.default_group.is_empty(),
            "hub.default_group must not be empty"
        );
        anyhow::ensure!(
            fc.hub.heartbeat_interval_secs > 0,
            "hub.heartbeat_interval_secs must be at least 1"
        );

        Ok(Self {
            addr,
            default_group: fc.hub.default_group.clone(),
            connection: ConnectionConfig {
                inbound_capacity: fc.hub.inbound_capacity,
                outbound_capacity: fc.hub.outbound_capacity,
                heartbeat_interval: Duration::from_secs(fc.hub.heartbeat_interval_secs),
                ..Default::default()
            },
            registry: RegistryConfig {
                send_timeout: Duration::from_millis(fc.hub.broadcast_timeout_ms),
                prune_empty_groups: fc.hub.prune_empty_groups,
            },
            tokens: fc.auth.tokens.clone(),
        })
    }

    /// `AllowAll` when no tokens are configured, otherwise a fixed table.
    pub fn authenticator(&self) -> Arc<dyn Authenticator> {
        if self.tokens.is_empty() {
            Arc::new(AllowAll)
        } else {
            Arc::new(StaticTokens::new(self.tokens.clone()))
        }
    }
}
