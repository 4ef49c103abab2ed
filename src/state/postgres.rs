//! PostgreSQL persistence
//!
//! Both collections share one table keyed by transfer id; the `collection`
//! column says which one a row belongs to, so a row can never be in both.

use super::persistence::{Persistence, Snapshot};
use crate::config::DatabaseConfig;
use crate::error::{TrackerError, TrackerResult};
use crate::transfer::{CompletedTransfer, TransferRecord};

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::Row;
use tracing::{debug, info, warn};

const ONGOING: &str = "ongoing";
const COMPLETED: &str = "completed";

pub struct PgPersistence {
    pool: PgPool,
}

impl PgPersistence {
    pub async fn new(config: &DatabaseConfig) -> TrackerResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> TrackerResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS transfers (
                id TEXT PRIMARY KEY,
                collection VARCHAR(16) NOT NULL,
                record JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_transfers_collection
            ON transfers (collection)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }
}

fn encode<T: serde::Serialize>(value: &T) -> TrackerResult<Json<serde_json::Value>> {
    serde_json::to_value(value)
        .map(Json)
        .map_err(|e| TrackerError::Internal(e.to_string()))
}

#[async_trait]
impl Persistence for PgPersistence {
    async fn load(&self) -> TrackerResult<Snapshot> {
        let rows = sqlx::query("SELECT id, collection, record FROM transfers")
            .fetch_all(&self.pool)
            .await?;

        let mut snapshot = Snapshot::default();
        for row in rows {
            let id: String = row.get("id");
            let collection: String = row.get("collection");
            let Json(value): Json<serde_json::Value> = row.get("record");

            let parsed = match collection.as_str() {
                ONGOING => serde_json::from_value::<TransferRecord>(value)
                    .map(|r| snapshot.ongoing.push(r)),
                COMPLETED => serde_json::from_value::<CompletedTransfer>(value)
                    .map(|r| snapshot.completed.push(r)),
                other => {
                    warn!(transfer_id = %id, "Skipping row in unknown collection {}", other);
                    continue;
                }
            };

            if let Err(e) = parsed {
                warn!(transfer_id = %id, "Skipping unreadable transfer row: {}", e);
            }
        }

        debug!(
            "Loaded {} ongoing and {} completed transfers",
            snapshot.ongoing.len(),
            snapshot.completed.len()
        );
        Ok(snapshot)
    }

    async fn save_ongoing(&self, record: &TransferRecord) -> TrackerResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO transfers (id, collection, record)
            VALUES ($1, $2, $3)
            ON CONFLICT (id)
            DO UPDATE SET record = EXCLUDED.record, updated_at = NOW()
            WHERE transfers.collection = $2
            "#,
        )
        .bind(&record.id)
        .bind(ONGOING)
        .bind(encode(record)?)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(TrackerError::AlreadyFinalized {
                id: record.id.clone(),
            });
        }
        Ok(())
    }

    async fn delete_ongoing(&self, id: &str) -> TrackerResult<()> {
        sqlx::query("DELETE FROM transfers WHERE id = $1 AND collection = $2")
            .bind(id)
            .bind(ONGOING)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn save_completed(&self, record: &CompletedTransfer) -> TrackerResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO transfers (id, collection, record)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(record.id())
        .bind(COMPLETED)
        .bind(encode(record)?)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(TrackerError::Persistence(format!(
                "transfer {} already stored",
                record.id()
            )));
        }
        Ok(())
    }

    async fn finalize(&self, record: &CompletedTransfer) -> TrackerResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO transfers (id, collection, record)
            VALUES ($1, $2, $3)
            ON CONFLICT (id)
            DO UPDATE SET collection = EXCLUDED.collection,
                          record = EXCLUDED.record,
                          updated_at = NOW()
            WHERE transfers.collection = $4
            "#,
        )
        .bind(record.id())
        .bind(COMPLETED)
        .bind(encode(record)?)
        .bind(ONGOING)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(TrackerError::AlreadyFinalized {
                id: record.id().to_string(),
            });
        }
        Ok(())
    }

    async fn health_check(&self) -> TrackerResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
