//! Listener state machine and the background watch task.
//!
//! `set_state(true)` registers the resource and starts watching
//! `System.Events`; `set_state(false)` stops watching and removes the
//! resource. At most one watch task exists at a time, and transitions are
//! serialized by the handle mutex. `get_state` never waits on that mutex:
//! it reads a flag the watch task clears when it ends.
//!
//! The watch task survives node hiccups: metadata or subscription failures
//! and a closed subscription are retried with exponential backoff
//! ([`RetryPolicy`]). When the retries run out the task ends and the status
//! becomes [`WatchStatus::Failed`]; the listener itself stays usable.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ConfigStore;
use crate::decoder::decode_order_events;
use crate::errors::ListenerError;
use crate::metadata::{ChainMetadata, StorageKey};
use crate::registrar::{ResourceDescriptor, ResourceRegistrar};
use crate::router::OrderEventRouter;
use crate::rpc::{ChainRpc, ChangeSet};
use crate::sink::VmLifecycleSink;

const INITIAL_BACKOFF_SECS: u64 = 2;
const MAX_BACKOFF_SECS: u64 = 60;

/// Bounded exponential backoff for the watch task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial: Duration::from_secs(INITIAL_BACKOFF_SECS),
            max: Duration::from_secs(MAX_BACKOFF_SECS),
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial.saturating_mul(factor).min(self.max)
    }
}

/// What the watch task is currently doing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WatchStatus {
    Idle,
    Connecting { attempt: u32 },
    Watching { last_block: Option<String> },
    Retrying { attempt: u32, error: String },
    Failed { error: String },
}

struct WatchHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl WatchHandle {
    async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            error!("Watch task ended abnormally: {e}");
        }
    }
}

pub struct ChainListener {
    store: Arc<dyn ConfigStore>,
    registrar: Arc<ResourceRegistrar>,
    watcher: Arc<Watcher>,
    cpu_model: String,
    handle: Mutex<Option<WatchHandle>>,
}

impl ChainListener {
    pub fn new(
        chain: Arc<dyn ChainRpc>,
        store: Arc<dyn ConfigStore>,
        registrar: Arc<ResourceRegistrar>,
        sink: Arc<dyn VmLifecycleSink>,
        retry: RetryPolicy,
        cpu_model: String,
    ) -> Self {
        let (status, _) = watch::channel(WatchStatus::Idle);
        let watcher = Watcher {
            chain,
            router: OrderEventRouter::new(store.clone(), sink),
            retry,
            status,
            active: AtomicBool::new(false),
        };
        Self {
            registrar,
            store,
            watcher: Arc::new(watcher),
            cpu_model,
            handle: Mutex::new(None),
        }
    }

    /// `true` while the watch task is running. A task that gave up after
    /// exhausting its retries counts as stopped.
    pub fn get_state(&self) -> bool {
        self.watcher.active.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> WatchStatus {
        self.watcher.status.borrow().clone()
    }

    pub async fn set_state(&self, running: bool) -> Result<(), ListenerError> {
        let mut handle = self.handle.lock().await;

        // A restart is not atomic with the stop: the old task is gone before
        // registration is attempted.
        if let Some(previous) = handle.take() {
            info!("Stopping chain watch");
            previous.stop().await;
            self.watcher.mark_stopped();
        }

        if running {
            self.start(&mut handle).await
        } else {
            self.remove().await
        }
    }

    /// Cancel the watch task without deregistering. Used at process exit.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.handle.lock().await.take() {
            handle.stop().await;
            self.watcher.mark_stopped();
            info!("Chain watch shut down");
        }
    }

    async fn start(&self, handle: &mut Option<WatchHandle>) -> Result<(), ListenerError> {
        let config = self
            .store
            .get()
            .await
            .map_err(ListenerError::Configuration)?;
        let descriptor = ResourceDescriptor::from_config(&config, &self.cpu_model, Utc::now());

        let resource_index = self
            .registrar
            .register(descriptor)
            .await
            .map_err(ListenerError::Registration)?;

        let cancel = CancellationToken::new();
        let watcher = self.watcher.clone();
        watcher.active.store(true, Ordering::SeqCst);
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            watcher.clone().run(token).await;
            watcher.active.store(false, Ordering::SeqCst);
        });
        *handle = Some(WatchHandle { cancel, task });
        info!("Chain watch started for resource {resource_index}");
        Ok(())
    }

    /// Every stop submits the removal for the last assigned index, even one
    /// already removed; the chain decides whether it still exists. Only a
    /// provider that was never assigned an index has nothing to name.
    async fn remove(&self) -> Result<(), ListenerError> {
        let config = self
            .store
            .get()
            .await
            .map_err(ListenerError::Configuration)?;
        let resource_index = config
            .chain_reg_info
            .resource_index
            .ok_or(ListenerError::NotRegistered)?;
        if config.chain_reg_info.removed {
            debug!("Resource {resource_index} is already marked removed, asking the chain again");
        }
        self.registrar
            .remove(resource_index)
            .await
            .map_err(ListenerError::Removal)
    }
}

// ─────────────────────────────────────────────────────────
// Watch task
// ─────────────────────────────────────────────────────────

struct Watcher {
    chain: Arc<dyn ChainRpc>,
    router: OrderEventRouter,
    retry: RetryPolicy,
    status: watch::Sender<WatchStatus>,
    /// Set before the task is spawned, cleared when `run` returns
    active: AtomicBool,
}

enum SessionEnd {
    Cancelled,
    Lost(String),
}

impl Watcher {
    fn set_status(&self, status: WatchStatus) {
        self.status.send_replace(status);
    }

    /// Called after the task was joined; also covers a task that panicked.
    fn mark_stopped(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.set_status(WatchStatus::Idle);
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut attempt = 0u32;
        loop {
            let error = match self.session(&cancel, &mut attempt).await {
                SessionEnd::Cancelled => {
                    debug!("Watch task cancelled");
                    return;
                }
                SessionEnd::Lost(error) => error,
            };

            attempt += 1;
            if attempt > self.retry.max_attempts {
                error!("Giving up on chain watch after {} retries: {error}", self.retry.max_attempts);
                self.set_status(WatchStatus::Failed { error });
                return;
            }

            let delay = self.retry.delay(attempt);
            warn!(
                "Chain watch interrupted ({error}); retry {attempt}/{} in {}s",
                self.retry.max_attempts,
                delay.as_secs()
            );
            self.set_status(WatchStatus::Retrying { attempt, error });
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One subscription session. `attempt` is reset once the subscription
    /// is open.
    async fn session(&self, cancel: &CancellationToken, attempt: &mut u32) -> SessionEnd {
        self.set_status(WatchStatus::Connecting { attempt: *attempt });

        let metadata = tokio::select! {
            biased;
            _ = cancel.cancelled() => return SessionEnd::Cancelled,
            res = self.chain.get_metadata() => match res {
                Ok(m) => m,
                Err(e) => return SessionEnd::Lost(e.to_string()),
            },
        };
        let key = match metadata.storage_key("System", "Events") {
            Ok(key) => key,
            Err(e) => return SessionEnd::Lost(e.to_string()),
        };

        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return SessionEnd::Cancelled,
            res = self.chain.subscribe_storage(vec![key.clone()]) => match res {
                Ok(s) => s,
                Err(e) => return SessionEnd::Lost(e.to_string()),
            },
        };
        *attempt = 0;
        info!("Subscribed to System.Events ({key})");
        self.set_status(WatchStatus::Watching { last_block: None });

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return SessionEnd::Cancelled,
                next = stream.next() => next,
            };
            match next {
                None => return SessionEnd::Lost("subscription closed by the node".into()),
                Some(Err(e)) => return SessionEnd::Lost(e.to_string()),
                Some(Ok(set)) => {
                    self.process(&set, &key, &metadata).await;
                    self.set_status(WatchStatus::Watching {
                        last_block: Some(set.block),
                    });
                }
            }
        }
    }

    /// Decode and route one change-set. Runs to completion once started.
    async fn process(&self, set: &ChangeSet, key: &StorageKey, metadata: &ChainMetadata) {
        for change in &set.changes {
            if change.key != *key {
                continue;
            }
            let Some(data) = &change.data else {
                continue;
            };
            let events = match decode_order_events(data, metadata) {
                Ok(events) => events,
                Err(e) => {
                    warn!("Dropping change-set for block {}: {e}", set.block);
                    return;
                }
            };
            for event in &events {
                if let Err(e) = self.router.dispatch(event).await {
                    error!(
                        "Failed to handle {} for order {}: {e}",
                        event.name(),
                        event.order_index()
                    );
                }
            }
        }
    }
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
