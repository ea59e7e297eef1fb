//! VM-lifecycle sink.
//!
//! The listener never waits on VM provisioning: requests go into an
//! unbounded queue and a background dispatcher records them in the
//! `vm_requests` outbox, where the orchestrator picks them up.

use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::db;
use crate::events::VmLifecycleRequest;

/// Receiver of VM-lifecycle requests. Calls must not block.
pub trait VmLifecycleSink: Send + Sync {
    fn create(&self, request: VmLifecycleRequest);
    fn renew(&self, request: VmLifecycleRequest);
    fn destroy(&self, request: VmLifecycleRequest);
}

/// Hand `request` to the sink method matching its operation.
pub fn forward(sink: &dyn VmLifecycleSink, request: VmLifecycleRequest) {
    match request {
        VmLifecycleRequest::Create { .. } => sink.create(request),
        VmLifecycleRequest::Renew { .. } => sink.renew(request),
        VmLifecycleRequest::Destroy { .. } => sink.destroy(request),
    }
}

/// Queue-backed sink feeding [`run_dispatcher`].
#[derive(Clone)]
pub struct VmRequestQueue {
    tx: mpsc::UnboundedSender<VmLifecycleRequest>,
}

impl VmRequestQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<VmLifecycleRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn enqueue(&self, request: VmLifecycleRequest) {
        let order_no = request.order_no();
        if self.tx.send(request).is_err() {
            warn!("VM dispatcher is gone; dropping request for order {order_no}");
        }
    }
}

impl VmLifecycleSink for VmRequestQueue {
    fn create(&self, request: VmLifecycleRequest) {
        self.enqueue(request);
    }

    fn renew(&self, request: VmLifecycleRequest) {
        self.enqueue(request);
    }

    fn destroy(&self, request: VmLifecycleRequest) {
        self.enqueue(request);
    }
}

/// Drain the queue into the outbox until every sender is dropped.
pub async fn run_dispatcher(pool: SqlitePool, mut rx: mpsc::UnboundedReceiver<VmLifecycleRequest>) {
    while let Some(request) = rx.recv().await {
        match db::insert_vm_request(&pool, &request).await {
            Ok(id) => info!(
                "Queued VM {} for order {} (outbox id {id})",
                request.op(),
                request.order_no()
            ),
            Err(e) => error!(
                "Failed to record VM {} for order {}: {e}",
                request.op(),
                request.order_no()
            ),
        }
    }
    info!("VM dispatcher stopped");
}
