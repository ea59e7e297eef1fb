//! Order-lifecycle events emitted by the `ResourceOrder` pallet and the VM
//! requests they turn into.

use serde::{Deserialize, Serialize};

use crate::config::VmConfig;

/// The three order events this provider reacts to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DecodedOrderEvent {
    /// `ResourceOrder.CreateOrderSuccess`
    Created {
        resource_index: u64,
        order_index: u64,
        /// Renter account, hex encoded
        account: String,
        duration: u32,
        /// SSH public key the renter wants injected into the VM
        public_key: String,
    },
    /// `ResourceOrder.ReNewOrderSuccess`
    Renewed {
        resource_index: u64,
        order_index: u64,
        duration: u32,
    },
    /// `ResourceOrder.WithdrawLockedOrderPriceSuccess`
    Cancelled {
        /// Not every runtime reports the resource on cancellation.
        resource_index: Option<u64>,
        order_index: u64,
    },
}

impl DecodedOrderEvent {
    /// Pallet event name this variant was decoded from.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Created { .. } => CREATE_ORDER_SUCCESS,
            Self::Renewed { .. } => RENEW_ORDER_SUCCESS,
            Self::Cancelled { .. } => WITHDRAW_LOCKED_ORDER_PRICE_SUCCESS,
        }
    }

    pub fn order_index(&self) -> u64 {
        match self {
            Self::Created { order_index, .. }
            | Self::Renewed { order_index, .. }
            | Self::Cancelled { order_index, .. } => *order_index,
        }
    }
}

pub const RESOURCE_ORDER_PALLET: &str = "ResourceOrder";
pub const CREATE_ORDER_SUCCESS: &str = "CreateOrderSuccess";
pub const RENEW_ORDER_SUCCESS: &str = "ReNewOrderSuccess";
pub const WITHDRAW_LOCKED_ORDER_PRICE_SUCCESS: &str = "WithdrawLockedOrderPriceSuccess";

/// Field names for order events whose runtime declaration has unnamed
/// (tuple) fields.
pub fn positional_field_names(pallet: &str, event: &str) -> Option<&'static [&'static str]> {
    if pallet != RESOURCE_ORDER_PALLET {
        return None;
    }
    match event {
        CREATE_ORDER_SUCCESS => Some(&[
            "account_id",
            "order_index",
            "resource_index",
            "duration",
            "public_key",
        ]),
        RENEW_ORDER_SUCCESS => Some(&["account_id", "order_index", "resource_index", "duration"]),
        WITHDRAW_LOCKED_ORDER_PRICE_SUCCESS => Some(&["account_id", "order_index", "amount"]),
        _ => None,
    }
}

/// VM resources attached to create/destroy requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmShape {
    pub cpu: u64,
    pub mem: u64,
    pub disk: u64,
    pub system: String,
    pub image: String,
}

impl From<&VmConfig> for VmShape {
    fn from(vm: &VmConfig) -> Self {
        Self {
            cpu: vm.cpu,
            mem: vm.mem,
            disk: vm.disk,
            system: vm.system.clone(),
            image: vm.image.clone(),
        }
    }
}

/// Work item handed to the VM-lifecycle sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum VmLifecycleRequest {
    Create {
        order_no: u64,
        shape: VmShape,
        public_key: String,
    },
    Renew {
        order_no: u64,
    },
    Destroy {
        order_no: u64,
        shape: VmShape,
    },
}

impl VmLifecycleRequest {
    pub fn order_no(&self) -> u64 {
        match self {
            Self::Create { order_no, .. }
            | Self::Renew { order_no }
            | Self::Destroy { order_no, .. } => *order_no,
        }
    }

    /// Short identifier string suitable for storage in the database.
    pub fn op(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::Renew { .. } => "renew",
            Self::Destroy { .. } => "destroy",
        }
    }
}

/// A VM request as stored in / read from the outbox table.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct VmRequestRecord {
    pub id: i64,
    pub op: String,
    pub order_no: i64,
    pub payload: String,
    pub created_at: i64,
}
