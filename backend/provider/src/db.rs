//! Database layer: pool setup, the provider configuration row and the VM
//! request outbox.

use std::str::FromStr;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tokio::sync::RwLock;
use tracing::info;

use crate::config::{ConfigStore, ProviderConfig};
use crate::errors::{ProviderError, Result};
use crate::events::{VmLifecycleRequest, VmRequestRecord};

/// Open (creating if needed) the SQLite database and run pending migrations.
pub async fn init_pool(database_url: &str) -> Result<SqlitePool> {
    let url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite:{database_url}")
    };
    let options = SqliteConnectOptions::from_str(&url)?.create_if_missing(true);

    // Every in-memory connection is its own database.
    let max_connections = if url.contains(":memory:") { 1 } else { 5 };

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database migrations applied successfully");
    Ok(pool)
}

// ─────────────────────────────────────────────────────────
// Provider configuration
// ─────────────────────────────────────────────────────────

/// [`ConfigStore`] backed by the `provider_config` row.
///
/// Readers are served from memory. `save` writes the row first and only
/// then replaces the cached value.
pub struct SqliteConfigStore {
    pool: SqlitePool,
    cache: RwLock<ProviderConfig>,
}

impl SqliteConfigStore {
    /// Load the stored configuration, inserting `seed` on first boot.
    pub async fn load_or_seed(pool: SqlitePool, seed: ProviderConfig) -> Result<Self> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT config_json FROM provider_config WHERE id = 1")
                .fetch_optional(&pool)
                .await?;

        let config = match row {
            Some((json,)) => serde_json::from_str(&json)?,
            None => {
                write_config(&pool, &seed).await?;
                info!("Seeded provider configuration for peer {}", seed.identity.peer_id);
                seed
            }
        };

        Ok(Self {
            pool,
            cache: RwLock::new(config),
        })
    }
}

#[async_trait]
impl ConfigStore for SqliteConfigStore {
    async fn get(&self) -> Result<ProviderConfig> {
        Ok(self.cache.read().await.clone())
    }

    async fn save(&self, config: ProviderConfig) -> Result<()> {
        let mut cache = self.cache.write().await;
        write_config(&self.pool, &config).await?;
        *cache = config;
        Ok(())
    }
}

async fn write_config(pool: &SqlitePool, config: &ProviderConfig) -> Result<()> {
    let json = serde_json::to_string(config)?;
    sqlx::query(
        r#"
        INSERT INTO provider_config (id, config_json, updated_at)
        VALUES (1, ?1, strftime('%s', 'now'))
        ON CONFLICT (id) DO UPDATE
            SET config_json = excluded.config_json,
                updated_at  = excluded.updated_at
        "#,
    )
    .bind(json)
    .execute(pool)
    .await?;
    Ok(())
}

// ─────────────────────────────────────────────────────────
// VM request outbox
// ─────────────────────────────────────────────────────────

/// Append a request to the outbox; returns its row id.
pub async fn insert_vm_request(pool: &SqlitePool, request: &VmLifecycleRequest) -> Result<i64> {
    let order_no = i64::try_from(request.order_no())
        .map_err(|_| ProviderError::OutOfRange(format!("order number {}", request.order_no())))?;
    let payload = serde_json::to_string(request)?;
    let id = sqlx::query("INSERT INTO vm_requests (op, order_no, payload) VALUES (?1, ?2, ?3)")
        .bind(request.op())
        .bind(order_no)
        .bind(payload)
        .execute(pool)
        .await?
        .last_insert_rowid();
    Ok(id)
}

/// All queued requests, oldest first.
pub async fn list_vm_requests(pool: &SqlitePool) -> Result<Vec<VmRequestRecord>> {
    let rows = sqlx::query_as::<_, VmRequestRecord>(
        r#"
        SELECT id, op, order_no, payload, created_at
        FROM   vm_requests
        ORDER  BY id ASC
        "#,
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::VmShape;
    use crate::testing::provider_config;

    async fn memory_pool() -> SqlitePool {
        init_pool("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn first_boot_seeds_the_configuration() {
        let pool = memory_pool().await;
        let store = SqliteConfigStore::load_or_seed(pool.clone(), provider_config(None, None))
            .await
            .unwrap();
        assert_eq!(store.get().await.unwrap(), provider_config(None, None));

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM provider_config")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn saved_configuration_survives_reload() {
        let pool = memory_pool().await;
        let store = SqliteConfigStore::load_or_seed(pool.clone(), provider_config(None, None))
            .await
            .unwrap();
        store.save(provider_config(Some(7), Some(42))).await.unwrap();

        // The seed is ignored once a row exists.
        let reloaded = SqliteConfigStore::load_or_seed(pool, provider_config(None, None))
            .await
            .unwrap();
        assert_eq!(
            reloaded.get().await.unwrap(),
            provider_config(Some(7), Some(42))
        );
    }

    #[tokio::test]
    async fn outbox_keeps_insertion_order() {
        let pool = memory_pool().await;
        let shape = VmShape::from(&provider_config(None, None).vm);
        insert_vm_request(
            &pool,
            &VmLifecycleRequest::Create {
                order_no: 42,
                shape: shape.clone(),
                public_key: "ssh-ed25519 AAAA".into(),
            },
        )
        .await
        .unwrap();
        insert_vm_request(&pool, &VmLifecycleRequest::Destroy { order_no: 42, shape })
            .await
            .unwrap();

        let rows = list_vm_requests(&pool).await.unwrap();
        let ops: Vec<_> = rows.iter().map(|r| r.op.as_str()).collect();
        assert_eq!(ops, vec!["create", "destroy"]);
        assert!(rows[0].id < rows[1].id);

        let payload: VmLifecycleRequest = serde_json::from_str(&rows[0].payload).unwrap();
        assert_eq!(payload.order_no(), 42);
    }

    #[tokio::test]
    async fn order_number_beyond_i64_is_rejected() {
        let pool = memory_pool().await;
        let err = insert_vm_request(&pool, &VmLifecycleRequest::Renew { order_no: u64::MAX })
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::OutOfRange(_)));
        assert!(list_vm_requests(&pool).await.unwrap().is_empty());

        let max = i64::MAX as u64;
        insert_vm_request(&pool, &VmLifecycleRequest::Renew { order_no: max })
            .await
            .unwrap();
        assert_eq!(list_vm_requests(&pool).await.unwrap()[0].order_no, i64::MAX);
    }
}
