//! Matches decoded order events against this provider's identity and turns
//! the matching ones into VM-lifecycle requests.
//!
//! | Event     | Matches when                          | Emits   | Config change      |
//! |-----------|---------------------------------------|---------|--------------------|
//! | Created   | `resource_index == ResourceIndex`     | Create  | `OrderIndex = ev`  |
//! | Renewed   | `resource_index == ResourceIndex`     | Renew   | none               |
//! | Cancelled | `order_index == OrderIndex`           | Destroy | none               |
//!
//! Cancellation is matched by order rather than resource because the
//! cancel event does not reliably carry the resource index.

use std::sync::Arc;

use tracing::{debug, info};

use crate::config::{ConfigStore, ProviderConfig};
use crate::errors::Result;
use crate::events::{DecodedOrderEvent, VmLifecycleRequest, VmShape};
use crate::sink::{forward, VmLifecycleSink};

/// What a single event means for this provider.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Routed {
    pub request: Option<VmLifecycleRequest>,
    /// Configuration to persist before the request is forwarded.
    pub updated_config: Option<ProviderConfig>,
}

/// Pure routing decision for `event` under `config`.
pub fn route(event: &DecodedOrderEvent, config: &ProviderConfig) -> Routed {
    let reg = &config.chain_reg_info;
    match event {
        DecodedOrderEvent::Created {
            resource_index,
            order_index,
            public_key,
            ..
        } if reg.resource_index == Some(*resource_index) => {
            let mut updated = config.clone();
            updated.chain_reg_info.order_index = Some(*order_index);
            Routed {
                request: Some(VmLifecycleRequest::Create {
                    order_no: *order_index,
                    shape: VmShape::from(&config.vm),
                    public_key: public_key.clone(),
                }),
                updated_config: Some(updated),
            }
        }
        DecodedOrderEvent::Renewed {
            resource_index,
            order_index,
            ..
        } if reg.resource_index == Some(*resource_index) => Routed {
            request: Some(VmLifecycleRequest::Renew {
                order_no: *order_index,
            }),
            updated_config: None,
        },
        DecodedOrderEvent::Cancelled { order_index, .. }
            if reg.order_index == Some(*order_index) =>
        {
            Routed {
                request: Some(VmLifecycleRequest::Destroy {
                    order_no: *order_index,
                    shape: VmShape::from(&config.vm),
                }),
                updated_config: None,
            }
        }
        _ => Routed::default(),
    }
}

pub struct OrderEventRouter {
    store: Arc<dyn ConfigStore>,
    sink: Arc<dyn VmLifecycleSink>,
}

impl OrderEventRouter {
    pub fn new(store: Arc<dyn ConfigStore>, sink: Arc<dyn VmLifecycleSink>) -> Self {
        Self { store, sink }
    }

    /// Route one event: persist any configuration change, then hand the
    /// request to the sink. Returns the forwarded request, if any.
    ///
    /// When the configuration cannot be saved the request is not forwarded,
    /// so no VM is created for an order this provider would not remember.
    pub async fn dispatch(&self, event: &DecodedOrderEvent) -> Result<Option<VmLifecycleRequest>> {
        let config = self.store.get().await?;
        let routed = route(event, &config);

        let Some(request) = routed.request else {
            debug!(
                "Ignoring {} for order {} (not ours)",
                event.name(),
                event.order_index()
            );
            return Ok(None);
        };

        if let Some(updated) = routed.updated_config {
            self.store.save(updated).await?;
        }

        info!("Forwarding {} for order {}", request.op(), request.order_no());
        forward(self.sink.as_ref(), request.clone());
        Ok(Some(request))
    }
}
