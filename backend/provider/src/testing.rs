//! Test doubles shared by the unit tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::config::{ChainRegInfo, ConfigStore, Identity, ProviderConfig, VmConfig};
use crate::errors::{ChainError, ProviderError, Result};
use crate::events::VmLifecycleRequest;
use crate::metadata::{ChainMetadata, StorageKey};
use crate::registrar::ResourceDescriptor;
use crate::rpc::{ChainResult, ChainRpc, ChangeSet, ChangeSetStream, StorageChange};
use crate::sink::VmLifecycleSink;

pub fn provider_config(resource_index: Option<u64>, order_index: Option<u64>) -> ProviderConfig {
    ProviderConfig {
        identity: Identity {
            peer_id: "12D3KooWProvider".into(),
        },
        vm: VmConfig {
            cpu: 2,
            mem: 4096,
            disk: 50,
            system: "ubuntu".into(),
            image: "ubuntu-18.04".into(),
        },
        chain_reg_info: ChainRegInfo {
            price: 100,
            resource_index,
            order_index,
            removed: false,
        },
    }
}

// ─────────────────────────────────────────────────────────
// Config stores
// ─────────────────────────────────────────────────────────

pub struct MemoryConfigStore {
    config: Mutex<ProviderConfig>,
    saves: AtomicUsize,
}

impl MemoryConfigStore {
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            config: Mutex::new(config),
            saves: AtomicUsize::new(0),
        }
    }

    pub fn current(&self) -> ProviderConfig {
        self.config.lock().unwrap().clone()
    }

    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn get(&self) -> Result<ProviderConfig> {
        Ok(self.current())
    }

    async fn save(&self, config: ProviderConfig) -> Result<()> {
        *self.config.lock().unwrap() = config;
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Reads succeed, writes always fail.
pub struct FailingStore {
    config: ProviderConfig,
}

impl FailingStore {
    pub fn new(config: ProviderConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ConfigStore for FailingStore {
    async fn get(&self) -> Result<ProviderConfig> {
        Ok(self.config.clone())
    }

    async fn save(&self, _config: ProviderConfig) -> Result<()> {
        Err(ProviderError::Config("disk full".into()))
    }
}

// ─────────────────────────────────────────────────────────
// Sink
// ─────────────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingSink {
    requests: Mutex<Vec<VmLifecycleRequest>>,
}

impl RecordingSink {
    pub fn requests(&self) -> Vec<VmLifecycleRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn record(&self, request: VmLifecycleRequest) {
        self.requests.lock().unwrap().push(request);
    }
}

impl VmLifecycleSink for RecordingSink {
    fn create(&self, request: VmLifecycleRequest) {
        assert!(matches!(request, VmLifecycleRequest::Create { .. }));
        self.record(request);
    }

    fn renew(&self, request: VmLifecycleRequest) {
        assert!(matches!(request, VmLifecycleRequest::Renew { .. }));
        self.record(request);
    }

    fn destroy(&self, request: VmLifecycleRequest) {
        assert!(matches!(request, VmLifecycleRequest::Destroy { .. }));
        self.record(request);
    }
}

// ─────────────────────────────────────────────────────────
// Chain
// ─────────────────────────────────────────────────────────

/// Scripted chain. Every subscription is backed by a channel whose sender
/// the test keeps, so it can push change-sets or end the stream. A removed
/// resource cannot be removed again until it is re-registered.
pub struct MockChain {
    metadata: Arc<ChainMetadata>,
    next_resource_index: AtomicU64,
    fail_register: AtomicBool,
    fail_remove: AtomicBool,
    fail_metadata: AtomicBool,
    fail_subscribe: AtomicBool,
    register_calls: AtomicUsize,
    remove_calls: AtomicUsize,
    removed: Mutex<HashSet<u64>>,
    fail_resource_calls: AtomicBool,
    resource_calls: Mutex<Vec<String>>,
    subscriptions: Mutex<Vec<mpsc::UnboundedSender<ChainResult<ChangeSet>>>>,
    subscribed: tokio::sync::Notify,
}

impl MockChain {
    pub fn new() -> Self {
        Self {
            metadata: Arc::new(ChainMetadata::bundled().unwrap()),
            next_resource_index: AtomicU64::new(1),
            fail_register: AtomicBool::new(false),
            fail_remove: AtomicBool::new(false),
            fail_metadata: AtomicBool::new(false),
            fail_subscribe: AtomicBool::new(false),
            register_calls: AtomicUsize::new(0),
            remove_calls: AtomicUsize::new(0),
            removed: Mutex::new(HashSet::new()),
            fail_resource_calls: AtomicBool::new(false),
            resource_calls: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
            subscribed: tokio::sync::Notify::new(),
        }
    }

    pub fn fail_resource_calls(&self, fail: bool) {
        self.fail_resource_calls.store(fail, Ordering::SeqCst);
    }

    /// Price, duration, status and query calls, in order.
    pub fn resource_calls(&self) -> Vec<String> {
        self.resource_calls.lock().unwrap().clone()
    }

    fn resource_call(&self, call: String) -> ChainResult<()> {
        if self.fail_resource_calls.load(Ordering::SeqCst) {
            return Err(rejected("ResourceNotFound"));
        }
        self.resource_calls.lock().unwrap().push(call);
        Ok(())
    }

    pub fn set_next_resource_index(&self, index: u64) {
        self.next_resource_index.store(index, Ordering::SeqCst);
    }

    pub fn fail_register(&self, fail: bool) {
        self.fail_register.store(fail, Ordering::SeqCst);
    }

    pub fn fail_remove(&self, fail: bool) {
        self.fail_remove.store(fail, Ordering::SeqCst);
    }

    pub fn fail_metadata(&self, fail: bool) {
        self.fail_metadata.store(fail, Ordering::SeqCst);
    }

    pub fn fail_subscribe(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    pub fn register_calls(&self) -> usize {
        self.register_calls.load(Ordering::SeqCst)
    }

    pub fn remove_calls(&self) -> usize {
        self.remove_calls.load(Ordering::SeqCst)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().unwrap().len()
    }

    /// Wait until at least `n` subscriptions have been opened.
    pub async fn wait_for_subscriptions(&self, n: usize) {
        loop {
            let notified = self.subscribed.notified();
            if self.subscription_count() >= n {
                return;
            }
            notified.await;
        }
    }

    /// Sender of the `n`th subscription (0-based).
    pub fn subscription(&self, n: usize) -> mpsc::UnboundedSender<ChainResult<ChangeSet>> {
        self.subscriptions.lock().unwrap()[n].clone()
    }

    /// Push a `System.Events` change to the `n`th subscription.
    pub fn push_events(&self, n: usize, events: Vec<u8>) {
        let key = self.events_key();
        self.subscription(n)
            .send(Ok(ChangeSet {
                block: "0x01".into(),
                changes: vec![StorageChange {
                    key,
                    data: Some(events),
                }],
            }))
            .unwrap();
    }

    /// End the `n`th subscription as if the node dropped it.
    pub fn close_subscription(&self, n: usize) {
        let mut subs = self.subscriptions.lock().unwrap();
        let (replacement, _) = mpsc::unbounded_channel();
        subs[n] = replacement;
    }

    pub fn events_key(&self) -> StorageKey {
        self.metadata.storage_key("System", "Events").unwrap()
    }
}

impl Default for MockChain {
    fn default() -> Self {
        Self::new()
    }
}

fn rejected(message: &str) -> ChainError {
    ChainError::Rpc {
        code: 1010,
        message: message.to_string(),
    }
}

#[async_trait]
impl ChainRpc for MockChain {
    async fn get_metadata(&self) -> ChainResult<Arc<ChainMetadata>> {
        if self.fail_metadata.load(Ordering::SeqCst) {
            return Err(ChainError::Metadata("node unreachable".into()));
        }
        Ok(self.metadata.clone())
    }

    async fn subscribe_storage(&self, _keys: Vec<StorageKey>) -> ChainResult<ChangeSetStream> {
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(ChainError::SubscriptionClosed);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscriptions.lock().unwrap().push(tx);
        self.subscribed.notify_waiters();
        Ok(Box::pin(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })))
    }

    async fn submit_register(&self, _descriptor: &ResourceDescriptor) -> ChainResult<u64> {
        self.register_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_register.load(Ordering::SeqCst) {
            return Err(rejected("Invalid Transaction"));
        }
        let index = self.next_resource_index.load(Ordering::SeqCst);
        self.removed.lock().unwrap().remove(&index);
        Ok(index)
    }

    async fn submit_remove(&self, resource_index: u64) -> ChainResult<()> {
        self.remove_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_remove.load(Ordering::SeqCst)
            || !self.removed.lock().unwrap().insert(resource_index)
        {
            return Err(rejected("ResourceNotFound"));
        }
        Ok(())
    }

    async fn submit_modify_price(&self, resource_index: u64, price: u64) -> ChainResult<()> {
        self.resource_call(format!("modify_price {resource_index} {price}"))
    }

    async fn submit_add_duration(&self, resource_index: u64, hours: u16) -> ChainResult<()> {
        self.resource_call(format!("add_duration {resource_index} {hours}"))
    }

    async fn submit_rent_again(&self, resource_index: u64) -> ChainResult<()> {
        self.resource_call(format!("rent_again {resource_index}"))
    }

    async fn query_resource(&self, resource_index: u64) -> ChainResult<Value> {
        self.resource_call(format!("query {resource_index}"))?;
        Ok(json!({ "index": resource_index, "status": "Unused" }))
    }
}
