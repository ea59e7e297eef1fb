//! Process settings loaded from environment variables, and the durable
//! provider configuration the listener reads and mutates.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::{ProviderError, Result};
use crate::rpc::ChainMethods;

#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP JSON-RPC endpoint of the chain node (e.g. http://127.0.0.1:9933)
    pub rpc_url: String,
    /// WebSocket endpoint used for storage subscriptions (e.g. ws://127.0.0.1:9944)
    pub ws_url: String,
    /// Path to the SQLite database file
    pub database_url: String,
    /// Port for the REST API server
    pub api_port: u16,
    /// Upper bound for every request/response RPC call
    pub rpc_timeout_secs: u64,
    /// How many times the watch task re-opens the subscription before giving up
    pub watch_max_retries: u32,
    /// Optional event schema file overriding the node's runtime metadata
    pub event_schema_path: Option<String>,
    /// Node RPC methods that submit the resource extrinsics
    pub chain_methods: ChainMethods,
    /// Start listening as soon as the daemon boots
    pub auto_start: bool,
    /// Values written to the provider configuration on first boot
    pub seed: ProviderConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            rpc_url: env_var("RPC_URL").unwrap_or_else(|_| "http://127.0.0.1:9933".to_string()),
            ws_url: env_var("WS_URL").unwrap_or_else(|_| "ws://127.0.0.1:9944".to_string()),
            database_url: env_var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:./provider.db".to_string()),
            api_port: parse_var("API_PORT", "10771")?,
            rpc_timeout_secs: parse_var("RPC_TIMEOUT_SECS", "30")?,
            watch_max_retries: parse_var("WATCH_MAX_RETRIES", "5")?,
            event_schema_path: env_var("EVENT_SCHEMA_PATH").ok(),
            chain_methods: chain_methods_from_env(),
            auto_start: parse_var("AUTO_START", "false")?,
            seed: ProviderConfig {
                identity: Identity {
                    peer_id: env_var("PEER_ID").map_err(|_| {
                        ProviderError::Config("PEER_ID environment variable is required".to_string())
                    })?,
                },
                vm: VmConfig {
                    cpu: parse_var("VM_CPU", "1")?,
                    mem: parse_var("VM_MEM", "1024")?,
                    disk: parse_var("VM_DISK", "50")?,
                    system: env_var("VM_SYSTEM").unwrap_or_else(|_| "ubuntu".to_string()),
                    image: env_var("VM_IMAGE")
                        .unwrap_or_else(|_| "ubuntu-18.04".to_string()),
                },
                chain_reg_info: ChainRegInfo {
                    price: parse_var("UNIT_PRICE", "100")?,
                    resource_index: None,
                    order_index: None,
                    removed: false,
                },
            },
        })
    }
}

fn chain_methods_from_env() -> ChainMethods {
    let defaults = ChainMethods::default();
    ChainMethods {
        register: env_var("REGISTER_METHOD").unwrap_or(defaults.register),
        remove: env_var("REMOVE_METHOD").unwrap_or(defaults.remove),
        modify_price: env_var("MODIFY_PRICE_METHOD").unwrap_or(defaults.modify_price),
        add_duration: env_var("ADD_DURATION_METHOD").unwrap_or(defaults.add_duration),
        change_status: env_var("CHANGE_STATUS_METHOD").unwrap_or(defaults.change_status),
        get_resource: env_var("GET_RESOURCE_METHOD").unwrap_or(defaults.get_resource),
    }
}

fn env_var(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| ProviderError::Config(format!("Missing env var: {key}")))
}

fn parse_var<T: std::str::FromStr>(key: &str, default: &str) -> Result<T> {
    parse_value(key, &env_var(key).unwrap_or_else(|_| default.to_string()))
}

fn parse_value<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| ProviderError::Config(format!("Invalid {key}")))
}

// ─────────────────────────────────────────────────────────
// Provider configuration
// ─────────────────────────────────────────────────────────

/// Durable provider configuration shared by the API and the watch task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub identity: Identity,
    pub vm: VmConfig,
    pub chain_reg_info: ChainRegInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub peer_id: String,
}

/// Shape of the VM offered to renters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmConfig {
    pub cpu: u64,
    /// Memory in MiB
    pub mem: u64,
    /// Disk in GiB
    pub disk: u64,
    /// OS family (e.g. `ubuntu`)
    pub system: String,
    pub image: String,
}

/// Identifiers the chain assigned to this provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainRegInfo {
    /// Unit price advertised with the resource
    pub price: u64,
    /// Index of this provider's resource; `None` until registered
    pub resource_index: Option<u64>,
    /// Most recently created order against the resource
    pub order_index: Option<u64>,
    /// The resource was taken off the market; `resource_index` is kept so
    /// a later stop still names it
    #[serde(default)]
    pub removed: bool,
}

/// Durable storage for [`ProviderConfig`].
///
/// `save` must not return before the new value is durable.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn get(&self) -> Result<ProviderConfig>;
    async fn save(&self, config: ProviderConfig) -> Result<()>;
}
