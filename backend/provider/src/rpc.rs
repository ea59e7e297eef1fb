//! Chain node client: JSON-RPC over HTTP for calls, WebSocket for the
//! `System.Events` storage subscription.
//!
//! ## Metadata
//!
//! The event schema is built from `state_getMetadata` and cached per runtime
//! `spec_version`, so a runtime upgrade is picked up on the next session. A
//! schema file, when configured, replaces the node's metadata and must name
//! the exact `spec_version` the node runs.
//!
//! ## Subscriptions
//!
//! Every call to [`ChainRpc::subscribe_storage`] opens its own WebSocket
//! connection. A pump task forwards `state_storage` notifications into a
//! channel; dropping the returned stream sends `state_unsubscribeStorage`
//! and closes the socket.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, Stream, StreamExt};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::errors::ChainError;
use crate::metadata::{ChainMetadata, StorageKey};
use crate::registrar::ResourceDescriptor;

pub type ChainResult<T> = std::result::Result<T, ChainError>;

/// A stream of change-sets from a single storage subscription.
pub type ChangeSetStream = Pin<Box<dyn Stream<Item = ChainResult<ChangeSet>> + Send>>;

/// Storage deltas observed in one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSet {
    /// Block hash, hex encoded
    pub block: String,
    pub changes: Vec<StorageChange>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageChange {
    pub key: StorageKey,
    /// `None` when the item was removed / holds no data
    pub data: Option<Vec<u8>>,
}

/// The chain capabilities the listener depends on.
#[async_trait]
pub trait ChainRpc: Send + Sync {
    /// Current event schema, checked against the node's runtime version.
    async fn get_metadata(&self) -> ChainResult<Arc<ChainMetadata>>;

    /// Open a subscription to raw storage changes on `keys`.
    async fn subscribe_storage(&self, keys: Vec<StorageKey>) -> ChainResult<ChangeSetStream>;

    /// Submit the "register resource" extrinsic; returns the resource index.
    async fn submit_register(&self, descriptor: &ResourceDescriptor) -> ChainResult<u64>;

    /// Submit the "remove resource" extrinsic.
    async fn submit_remove(&self, resource_index: u64) -> ChainResult<()>;

    /// Change the advertised unit price of a registered resource.
    async fn submit_modify_price(&self, resource_index: u64, price: u64) -> ChainResult<()>;

    /// Extend how long a registered resource stays on offer, in hours.
    async fn submit_add_duration(&self, resource_index: u64, hours: u16) -> ChainResult<()>;

    /// Put a resource whose rental ended back on the market.
    async fn submit_rent_again(&self, resource_index: u64) -> ChainResult<()>;

    /// The chain's current view of a resource.
    async fn query_resource(&self, resource_index: u64) -> ChainResult<Value>;
}

// ─────────────────────────────────────────────────────────
// JSON-RPC response shapes
// ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    #[serde(default)]
    id: Option<Value>,
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

impl<T> RpcResponse<T> {
    fn into_result(self, method: &str) -> ChainResult<T> {
        if let Some(err) = self.error {
            return Err(ChainError::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        self.result
            .ok_or_else(|| ChainError::InvalidResponse(format!("Empty result from {method}")))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RuntimeVersion {
    spec_version: u32,
}

#[derive(Debug, Deserialize)]
struct StorageNotification {
    method: String,
    params: NotificationParams,
}

#[derive(Debug, Deserialize)]
struct NotificationParams {
    subscription: Value,
    result: RawChangeSet,
}

#[derive(Debug, Deserialize)]
struct RawChangeSet {
    block: String,
    changes: Vec<(String, Option<String>)>,
}

impl RawChangeSet {
    fn parse(self) -> ChainResult<ChangeSet> {
        let changes = self
            .changes
            .into_iter()
            .map(|(key, data)| {
                let key = StorageKey::from_hex(&key)
                    .map_err(|e| ChainError::InvalidResponse(format!("storage key: {e}")))?;
                let data = data
                    .map(|d| hex::decode(d.trim_start_matches("0x")))
                    .transpose()
                    .map_err(|e| ChainError::InvalidResponse(format!("storage data: {e}")))?;
                Ok(StorageChange { key, data })
            })
            .collect::<ChainResult<_>>()?;
        Ok(ChangeSet {
            block: self.block,
            changes,
        })
    }
}

// ─────────────────────────────────────────────────────────
// Substrate client
// ─────────────────────────────────────────────────────────

/// Node RPC methods that submit or query resource extrinsics. Signing
/// happens node-side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainMethods {
    pub register: String,
    pub remove: String,
    pub modify_price: String,
    pub add_duration: String,
    pub change_status: String,
    pub get_resource: String,
}

impl Default for ChainMethods {
    fn default() -> Self {
        Self {
            register: "resourceOrder_registerResource".to_string(),
            remove: "resourceOrder_removeResource".to_string(),
            modify_price: "resourceOrder_modifyResourcePrice".to_string(),
            add_duration: "resourceOrder_addResourceDuration".to_string(),
            change_status: "resourceOrder_changeResourceStatus".to_string(),
            get_resource: "provider_getResource".to_string(),
        }
    }
}

/// Settings for [`SubstrateRpc`].
#[derive(Debug, Clone)]
pub struct RpcSettings {
    pub rpc_url: String,
    pub ws_url: String,
    pub timeout: Duration,
    pub methods: ChainMethods,
}

pub struct SubstrateRpc {
    client: Client,
    settings: RpcSettings,
    schema_override: Option<Arc<ChainMetadata>>,
    /// Schema built from the node's metadata, keyed by `spec_version`
    cached: Mutex<Option<(u32, Arc<ChainMetadata>)>>,
}

impl SubstrateRpc {
    pub fn new(
        client: Client,
        settings: RpcSettings,
        schema_override: Option<ChainMetadata>,
    ) -> Self {
        Self {
            client,
            settings,
            schema_override: schema_override.map(Arc::new),
            cached: Mutex::new(None),
        }
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> ChainResult<T> {
        let response = self
            .client
            .post(&self.settings.rpc_url)
            .timeout(self.settings.timeout)
            .json(&json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": method,
                "params": params,
            }))
            .send()
            .await?;
        let body: RpcResponse<T> = response.json().await?;
        debug!("{method} answered");
        body.into_result(method)
    }
}

#[async_trait]
impl ChainRpc for SubstrateRpc {
    async fn get_metadata(&self) -> ChainResult<Arc<ChainMetadata>> {
        let version: RuntimeVersion = self.call("state_getRuntimeVersion", json!([])).await?;
        if let Some(schema) = &self.schema_override {
            schema.ensure_compatible(version.spec_version)?;
            return Ok(schema.clone());
        }

        let mut cached = self.cached.lock().await;
        if let Some((spec_version, schema)) = cached.as_ref() {
            if *spec_version == version.spec_version {
                return Ok(schema.clone());
            }
        }
        let raw: String = self.call("state_getMetadata", json!([])).await?;
        let schema = Arc::new(decode_runtime_metadata(&raw, version.spec_version)?);
        info!(
            "Loaded runtime metadata for spec_version {} ({} pallets)",
            version.spec_version,
            schema.pallets.len()
        );
        *cached = Some((version.spec_version, schema.clone()));
        Ok(schema)
    }

    async fn subscribe_storage(&self, keys: Vec<StorageKey>) -> ChainResult<ChangeSetStream> {
        let timeout = self.settings.timeout;
        let (ws, _) = tokio::time::timeout(
            timeout,
            tokio_tungstenite::connect_async(self.settings.ws_url.as_str()),
        )
        .await
        .map_err(|_| ChainError::Timeout("WebSocket connect"))??;
        let (mut sink, mut stream) = ws.split();

        let keys: Vec<String> = keys.iter().map(ToString::to_string).collect();
        let request = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "state_subscribeStorage",
            "params": [keys],
        });
        sink.send(Message::Text(request.to_string().into())).await?;

        let subscription = tokio::time::timeout(timeout, await_subscription_id(&mut stream))
            .await
            .map_err(|_| ChainError::Timeout("state_subscribeStorage"))??;
        debug!("Storage subscription {subscription} opened");

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(pump(sink, stream, subscription, tx));

        Ok(Box::pin(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })))
    }

    async fn submit_register(&self, descriptor: &ResourceDescriptor) -> ChainResult<u64> {
        self.call(&self.settings.methods.register, json!([descriptor]))
            .await
    }

    async fn submit_remove(&self, resource_index: u64) -> ChainResult<()> {
        let _: Value = self
            .call(&self.settings.methods.remove, json!([resource_index]))
            .await?;
        Ok(())
    }

    async fn submit_modify_price(&self, resource_index: u64, price: u64) -> ChainResult<()> {
        let _: Value = self
            .call(&self.settings.methods.modify_price, json!([resource_index, price]))
            .await?;
        Ok(())
    }

    async fn submit_add_duration(&self, resource_index: u64, hours: u16) -> ChainResult<()> {
        let _: Value = self
            .call(&self.settings.methods.add_duration, json!([resource_index, hours]))
            .await?;
        Ok(())
    }

    async fn submit_rent_again(&self, resource_index: u64) -> ChainResult<()> {
        let _: Value = self
            .call(&self.settings.methods.change_status, json!([resource_index]))
            .await?;
        Ok(())
    }

    async fn query_resource(&self, resource_index: u64) -> ChainResult<Value> {
        self.call(&self.settings.methods.get_resource, json!([resource_index]))
            .await
    }
}

/// Decode the hex string returned by `state_getMetadata`.
fn decode_runtime_metadata(raw: &str, spec_version: u32) -> ChainResult<ChainMetadata> {
    let bytes = hex::decode(raw.trim_start_matches("0x"))
        .map_err(|e| ChainError::InvalidResponse(format!("state_getMetadata: {e}")))?;
    ChainMetadata::from_runtime_metadata(&bytes, spec_version)
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Read frames until the reply to the subscribe request (id 1) arrives.
async fn await_subscription_id(stream: &mut SplitStream<WsStream>) -> ChainResult<Value> {
    while let Some(msg) = stream.next().await {
        let Message::Text(text) = msg? else {
            continue;
        };
        let reply: RpcResponse<Value> = serde_json::from_str(text.as_str())?;
        if reply.id == Some(json!(1)) {
            return reply.into_result("state_subscribeStorage");
        }
    }
    Err(ChainError::SubscriptionClosed)
}

/// Forward notifications to the subscriber until either side goes away.
async fn pump(
    mut sink: SplitSink<WsStream, Message>,
    mut stream: SplitStream<WsStream>,
    subscription: Value,
    tx: mpsc::Sender<ChainResult<ChangeSet>>,
) {
    loop {
        tokio::select! {
            _ = tx.closed() => {
                let unsubscribe = json!({
                    "jsonrpc": "2.0",
                    "id": 2,
                    "method": "state_unsubscribeStorage",
                    "params": [subscription],
                });
                let _ = sink.send(Message::Text(unsubscribe.to_string().into())).await;
                let _ = sink.close().await;
                debug!("Storage subscription {subscription} closed");
                return;
            }
            msg = stream.next() => match msg {
                None | Some(Ok(Message::Close(_))) => {
                    warn!("Node closed storage subscription {subscription}");
                    return;
                }
                Some(Err(e)) => {
                    let _ = tx.send(Err(e.into())).await;
                    return;
                }
                Some(Ok(Message::Text(text))) => {
                    let Some(item) = parse_notification(text.as_str(), &subscription) else {
                        continue;
                    };
                    if tx.send(item).await.is_err() {
                        return;
                    }
                }
                Some(Ok(_)) => {}
            }
        }
    }
}

/// Turn a `state_storage` notification into a change-set. Other frames
/// (e.g. the unsubscribe reply) yield `None`.
fn parse_notification(text: &str, subscription: &Value) -> Option<ChainResult<ChangeSet>> {
    let notification: StorageNotification = serde_json::from_str(text).ok()?;
    if notification.method != "state_storage" || notification.params.subscription != *subscription
    {
        return None;
    }
    Some(notification.params.result.parse())
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
