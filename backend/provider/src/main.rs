//! Compute provider daemon: entry point.
//!
//! Offers this machine's VM capacity on the marketplace chain. While the
//! listener runs, `ResourceOrder` events addressed to this provider are
//! turned into VM-lifecycle requests and queued in the SQLite outbox. A
//! small Axum API starts/stops the listener and exposes its state.

mod api;
mod config;
mod db;
mod decoder;
mod errors;
mod events;
mod listener;
mod metadata;
mod registrar;
mod router;
mod rpc;
mod sink;

#[cfg(test)]
mod testing;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    routing::{get, post},
    Router,
};
use reqwest::Client;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use config::Config;
use listener::{ChainListener, RetryPolicy};
use metadata::ChainMetadata;
use registrar::ResourceRegistrar;
use rpc::{RpcSettings, SubstrateRpc};
use sink::VmRequestQueue;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging (RUST_LOG controls verbosity).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Load optional .env file (ignored if missing).
    let _ = dotenvy::dotenv();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;
    let rpc_timeout = Duration::from_secs(config.rpc_timeout_secs);

    let pool = db::init_pool(&config.database_url).await?;
    let store = Arc::new(db::SqliteConfigStore::load_or_seed(pool.clone(), config.seed.clone()).await?);

    // Without an override the event layouts come from the node's metadata.
    let schema_override = config
        .event_schema_path
        .as_deref()
        .map(ChainMetadata::from_file)
        .transpose()?;

    let client = Client::builder().timeout(rpc_timeout).build()?;
    let chain = Arc::new(SubstrateRpc::new(
        client,
        RpcSettings {
            rpc_url: config.rpc_url.clone(),
            ws_url: config.ws_url.clone(),
            timeout: rpc_timeout,
            methods: config.chain_methods.clone(),
        },
        schema_override,
    ));
    let registrar = Arc::new(ResourceRegistrar::new(
        chain.clone(),
        store.clone(),
        rpc_timeout,
    ));

    // ─── VM request dispatcher ────────────────────────────
    let (queue, requests) = VmRequestQueue::new();
    tokio::spawn(sink::run_dispatcher(pool.clone(), requests));

    // ─── Chain listener ───────────────────────────────────
    let listener = Arc::new(ChainListener::new(
        chain,
        store.clone(),
        registrar.clone(),
        Arc::new(queue),
        RetryPolicy::new(config.watch_max_retries),
        registrar::host_cpu_model(),
    ));

    if config.auto_start {
        if let Err(e) = listener.set_state(true).await {
            error!("Auto-start failed: {e}");
        }
    }

    // ─── REST API ─────────────────────────────────────────
    let api_state = Arc::new(api::ApiState {
        pool,
        store,
        listener: listener.clone(),
        registrar,
    });

    let app = Router::new()
        .route("/health", get(api::health))
        .route("/boot", get(api::get_boot).post(api::post_boot))
        .route("/config", get(api::get_config).post(api::post_config))
        .route("/resource", get(api::get_resource))
        .route("/resource/price", post(api::post_resource_price))
        .route("/resource/duration", post(api::post_resource_duration))
        .route("/resource/rent-again", post(api::post_resource_rent_again))
        .route("/vm-requests", get(api::get_vm_requests))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(api_state);

    let addr = format!("0.0.0.0:{}", config.api_port);
    info!("API listening on http://{addr}");

    let tcp = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(tcp, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    // The resource stays registered; only the watch task is stopped.
    listener.shutdown().await;
    Ok(())
}
