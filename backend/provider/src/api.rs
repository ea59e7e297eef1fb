//! Axum REST API handlers.
//!
//! `/boot` drives the listener; `/config` and `/resource/*` let the operator
//! reshape the VM offer and manage the registered resource on-chain.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::warn;

use crate::config::{ConfigStore, VmConfig};
use crate::db;
use crate::errors::ProviderError;
use crate::events::VmRequestRecord;
use crate::listener::{ChainListener, WatchStatus};
use crate::registrar::ResourceRegistrar;

#[derive(Clone)]
pub struct ApiState {
    pub pool: SqlitePool,
    pub store: Arc<dyn ConfigStore>,
    pub listener: Arc<ChainListener>,
    pub registrar: Arc<ResourceRegistrar>,
}

// ─────────────────────────────────────────────────────────
// Request / response shapes
// ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct BootRequest {
    pub option: bool,
}

#[derive(Debug, Deserialize)]
pub struct ConfigUpdate {
    pub vm: VmConfig,
}

#[derive(Debug, Deserialize)]
pub struct PriceRequest {
    pub price: u64,
}

/// Hours to add to the resource's rentable period.
#[derive(Debug, Deserialize)]
pub struct DurationRequest {
    pub duration: u16,
}

#[derive(Serialize)]
pub struct BootResponse {
    pub running: bool,
    pub status: WatchStatus,
}

#[derive(Serialize)]
pub struct VmRequestsResponse {
    pub count: usize,
    pub requests: Vec<VmRequestRecord>,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(status: StatusCode, error: impl ToString) -> axum::response::Response {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
        .into_response()
}

/// Caller mistakes are 400s, chain rejections 502s.
fn provider_error_response(e: ProviderError) -> axum::response::Response {
    let status = match &e {
        ProviderError::NotRegistered | ProviderError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        ProviderError::Chain(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, e)
}

fn validate_vm(vm: &VmConfig) -> Result<(), ProviderError> {
    if vm.cpu == 0 || vm.mem == 0 || vm.disk == 0 {
        return Err(ProviderError::InvalidInput(
            "cpu, mem and disk must be positive".into(),
        ));
    }
    if vm.system.trim().is_empty() || vm.image.trim().is_empty() {
        return Err(ProviderError::InvalidInput("system and image are required".into()));
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// `GET /boot`
pub async fn get_boot(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    Json(BootResponse {
        running: state.listener.get_state(),
        status: state.listener.status(),
    })
}

/// `POST /boot` with `{ "option": bool }`
///
/// Starts (registers + watches) or stops (cancels + removes) the listener.
pub async fn post_boot(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<BootRequest>,
) -> impl IntoResponse {
    match state.listener.set_state(body.option).await {
        Ok(()) => (
            StatusCode::OK,
            Json(BootResponse {
                running: state.listener.get_state(),
                status: state.listener.status(),
            }),
        )
            .into_response(),
        Err(e) => {
            warn!("Boot request ({}) failed: {e}", body.option);
            error_response(StatusCode::BAD_REQUEST, e)
        }
    }
}

/// `GET /config`
pub async fn get_config(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    match state.store.get().await {
        Ok(config) => (StatusCode::OK, Json(config)).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

/// `POST /config` with `{ "vm": {...} }`
///
/// Replaces the VM shape. It is advertised on the next registration.
pub async fn post_config(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<ConfigUpdate>,
) -> impl IntoResponse {
    if let Err(e) = validate_vm(&body.vm) {
        return provider_error_response(e);
    }
    let mut config = match state.store.get().await {
        Ok(config) => config,
        Err(e) => return provider_error_response(e),
    };
    config.vm = body.vm;
    match state.store.save(config.clone()).await {
        Ok(()) => (StatusCode::OK, Json(config)).into_response(),
        Err(e) => provider_error_response(e),
    }
}

/// `GET /resource`
///
/// The chain's record of the registered resource.
pub async fn get_resource(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    match state.registrar.resource_info().await {
        Ok(info) => (StatusCode::OK, Json(info)).into_response(),
        Err(e) => provider_error_response(e),
    }
}

/// `POST /resource/price` with `{ "price": u64 }`
pub async fn post_resource_price(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<PriceRequest>,
) -> impl IntoResponse {
    match state.registrar.modify_price(body.price).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => {
            warn!("Price change to {} failed: {e}", body.price);
            provider_error_response(e)
        }
    }
}

/// `POST /resource/duration` with `{ "duration": hours }`
pub async fn post_resource_duration(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<DurationRequest>,
) -> impl IntoResponse {
    match state.registrar.add_duration(body.duration).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => {
            warn!("Adding {}h to the resource failed: {e}", body.duration);
            provider_error_response(e)
        }
    }
}

/// `POST /resource/rent-again`
pub async fn post_resource_rent_again(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    match state.registrar.rent_again().await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => {
            warn!("Re-offering the resource failed: {e}");
            provider_error_response(e)
        }
    }
}

/// `GET /vm-requests`
///
/// The VM request outbox, oldest first.
pub async fn get_vm_requests(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    match db::list_vm_requests(&state.pool).await {
        Ok(requests) => (
            StatusCode::OK,
            Json(VmRequestsResponse {
                count: requests.len(),
                requests,
            }),
        )
            .into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}
