//! Registers and removes this provider's resource on-chain.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::config::{ConfigStore, ProviderConfig};
use crate::errors::{ChainError, ProviderError, Result};
use crate::rpc::{ChainResult, ChainRpc};

/// How long a freshly registered resource stays rentable.
pub const RESOURCE_LIFETIME_DAYS: i64 = 10;

/// The resource offer sent to the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub peer_id: String,
    pub cpu: u64,
    pub memory: u64,
    pub system: String,
    pub cpu_model: String,
    pub price: u64,
    pub expire_time: DateTime<Utc>,
}

impl ResourceDescriptor {
    pub fn from_config(config: &ProviderConfig, cpu_model: &str, now: DateTime<Utc>) -> Self {
        Self {
            peer_id: config.identity.peer_id.clone(),
            cpu: config.vm.cpu,
            memory: config.vm.mem,
            system: config.vm.system.clone(),
            cpu_model: cpu_model.to_string(),
            price: config.chain_reg_info.price,
            expire_time: now + chrono::Duration::days(RESOURCE_LIFETIME_DAYS),
        }
    }
}

/// CPU brand string of the host, as reported by the OS.
pub fn host_cpu_model() -> String {
    let mut sys = sysinfo::System::new();
    sys.refresh_cpu_all();
    sys.cpus()
        .first()
        .map(|cpu| cpu.brand().trim().to_string())
        .filter(|brand| !brand.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Chain-side operations on this provider's resource. Every call is bounded
/// by the RPC timeout and the stored configuration follows the chain's
/// answer.
pub struct ResourceRegistrar {
    chain: Arc<dyn ChainRpc>,
    store: Arc<dyn ConfigStore>,
    timeout: Duration,
}

impl ResourceRegistrar {
    pub fn new(chain: Arc<dyn ChainRpc>, store: Arc<dyn ConfigStore>, timeout: Duration) -> Self {
        Self {
            chain,
            store,
            timeout,
        }
    }

    async fn bounded<T>(
        &self,
        what: &'static str,
        call: impl Future<Output = ChainResult<T>>,
    ) -> Result<T> {
        Ok(tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| ChainError::Timeout(what))??)
    }

    async fn registered_index(&self) -> Result<u64> {
        self.store
            .get()
            .await?
            .chain_reg_info
            .resource_index
            .ok_or(ProviderError::NotRegistered)
    }

    /// Submit `descriptor` and persist the resource index the chain assigned.
    pub async fn register(&self, descriptor: ResourceDescriptor) -> Result<u64> {
        let index = self
            .bounded("register resource", self.chain.submit_register(&descriptor))
            .await?;

        let mut config = self.store.get().await?;
        config.chain_reg_info.resource_index = Some(index);
        config.chain_reg_info.removed = false;
        self.store.save(config).await?;

        info!(
            "Registered resource {index} (peer {}, cpu {}, mem {}, expires {})",
            descriptor.peer_id, descriptor.cpu, descriptor.memory, descriptor.expire_time
        );
        Ok(index)
    }

    /// Remove the resource on-chain and mark it removed locally.
    ///
    /// The index is kept so a repeated removal still reaches the chain.
    pub async fn remove(&self, resource_index: u64) -> Result<()> {
        self.bounded("remove resource", self.chain.submit_remove(resource_index))
            .await?;

        let mut config = self.store.get().await?;
        if config.chain_reg_info.resource_index == Some(resource_index) {
            config.chain_reg_info.removed = true;
            self.store.save(config).await?;
        }
        info!("Removed resource {resource_index}");
        Ok(())
    }

    /// Change the advertised unit price and persist it once the chain
    /// accepted it.
    pub async fn modify_price(&self, price: u64) -> Result<()> {
        let index = self.registered_index().await?;
        self.bounded(
            "modify resource price",
            self.chain.submit_modify_price(index, price),
        )
        .await?;

        let mut config = self.store.get().await?;
        config.chain_reg_info.price = price;
        self.store.save(config).await?;
        info!("Resource {index} now priced at {price}");
        Ok(())
    }

    /// Extend the rentable period of the resource by `hours`.
    pub async fn add_duration(&self, hours: u16) -> Result<()> {
        if hours == 0 {
            return Err(ProviderError::InvalidInput("duration must be positive".into()));
        }
        let index = self.registered_index().await?;
        self.bounded(
            "add resource duration",
            self.chain.submit_add_duration(index, hours),
        )
        .await?;
        info!("Resource {index} extended by {hours}h");
        Ok(())
    }

    /// Offer the resource again after its rental ended.
    pub async fn rent_again(&self) -> Result<()> {
        let index = self.registered_index().await?;
        self.bounded("change resource status", self.chain.submit_rent_again(index))
            .await?;
        info!("Resource {index} is rentable again");
        Ok(())
    }

    /// The chain's record of the registered resource.
    pub async fn resource_info(&self) -> Result<Value> {
        let index = self.registered_index().await?;
        self.bounded("query resource", self.chain.query_resource(index))
            .await
    }
}
