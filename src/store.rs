/// Block Store - Durable Persistence over PostgreSQL
///
/// Owns every entity in the data model: blocks, transfers, checkpoints,
/// sync status and advisory locks. The engine only sees the `BlockStore`
/// trait; `PgStore` is the production implementation. One batch is one
/// transaction: rollback, inserts, checkpoint and status land together or
/// not at all. Transfers hang off blocks with ON DELETE CASCADE so a reorg
/// rollback can never leave orphans.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;

use crate::constants::MAX_REORG_DEPTH;
use crate::error::Error;
use crate::types::{Block, Checkpoint, Gap, SyncState, SyncStatus, Transfer};

/// The resulting schema is the contract; DDL is idempotent so a fresh
/// database bootstraps itself and an existing one is left untouched.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS blocks (
    number      BIGINT PRIMARY KEY,
    hash        CHAR(66) NOT NULL UNIQUE,
    parent_hash CHAR(66) NOT NULL,
    timestamp   BIGINT NOT NULL,
    chain_id    BIGINT NOT NULL
);

CREATE TABLE IF NOT EXISTS transfers (
    block_number     BIGINT NOT NULL REFERENCES blocks(number) ON DELETE CASCADE,
    log_index        BIGINT NOT NULL,
    transaction_hash CHAR(66) NOT NULL,
    from_address     CHAR(42) NOT NULL,
    to_address       CHAR(42) NOT NULL,
    amount           NUMERIC(78, 0) NOT NULL,
    token_address    CHAR(42) NOT NULL,
    PRIMARY KEY (block_number, log_index)
);

CREATE INDEX IF NOT EXISTS transfers_token_idx ON transfers (token_address, block_number);
CREATE INDEX IF NOT EXISTS transfers_from_idx  ON transfers (from_address, block_number);
CREATE INDEX IF NOT EXISTS transfers_to_idx    ON transfers (to_address, block_number);

CREATE TABLE IF NOT EXISTS checkpoints (
    name         TEXT PRIMARY KEY,
    block_number BIGINT NOT NULL,
    block_hash   CHAR(66) NOT NULL,
    synced_at    TIMESTAMPTZ NOT NULL DEFAULT now(),
    metadata     JSONB
);

CREATE TABLE IF NOT EXISTS sync_status (
    processor_name       TEXT PRIMARY KEY,
    last_processed_block BIGINT,
    last_processed_hash  CHAR(66),
    target_block         BIGINT,
    synced_percent       DOUBLE PRECISION NOT NULL DEFAULT 0,
    state                TEXT NOT NULL,
    error_message        TEXT,
    updated_at           TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS app_locks (
    name        TEXT PRIMARY KEY,
    instance_id TEXT NOT NULL,
    expires_at  TIMESTAMPTZ NOT NULL
);
"#;

/// Everything a batch commits, atomically.
#[derive(Debug, Clone)]
pub struct CommitRequest {
    /// When set, `delete_after(rollback_to)` runs inside the same
    /// transaction before any insert (the reorg path).
    pub rollback_to: Option<u64>,
    pub blocks: Vec<Block>,
    pub transfers: Vec<Transfer>,
    pub checkpoint: Checkpoint,
    pub status: SyncStatus,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitOutcome {
    pub blocks_saved: u64,
    pub transfers_saved: u64,
    pub blocks_deleted: u64,
}

/// Store capability consumed by the sync engine and the reorg detector.
#[async_trait]
pub trait BlockStore: Send + Sync {
    async fn max_height(&self) -> Result<Option<u64>, Error>;
    async fn find_by_height(&self, number: u64) -> Result<Option<Block>, Error>;
    async fn find_by_hash(&self, hash: &str) -> Result<Option<Block>, Error>;
    async fn commit_batch(&self, request: &CommitRequest) -> Result<CommitOutcome, Error>;
    async fn delete_after(&self, number: u64) -> Result<u64, Error>;
    async fn detect_gaps(&self) -> Result<Vec<Gap>, Error>;
    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), Error>;
    async fn get_checkpoint(&self, name: &str) -> Result<Option<Checkpoint>, Error>;
    async fn upsert_sync_status(&self, status: &SyncStatus) -> Result<(), Error>;
    async fn try_acquire_lock(
        &self,
        name: &str,
        instance_id: &str,
        ttl: Duration,
    ) -> Result<bool, Error>;
    async fn renew_lock(
        &self,
        name: &str,
        instance_id: &str,
        ttl: Duration,
    ) -> Result<bool, Error>;
    async fn release_lock(&self, name: &str, instance_id: &str) -> Result<(), Error>;
    async fn healthcheck(&self) -> Result<(), Error>;
}

pub struct PgStore {
    pool: PgPool,
}

fn to_i64(value: u64, context: &str) -> Result<i64, Error> {
    i64::try_from(value)
        .map_err(|_| Error::Validation(format!("{context}: {value} does not fit in BIGINT")))
}

fn to_u64(value: i64, context: &str) -> Result<u64, Error> {
    u64::try_from(value)
        .map_err(|_| Error::Corruption(format!("{context}: negative value {value} in store")))
}

fn row_to_block(row: &PgRow) -> Result<Block, Error> {
    Ok(Block {
        number: to_u64(row.try_get::<i64, _>("number")?, "blocks.number")?,
        hash: row.try_get::<String, _>("hash")?.trim_end().to_string(),
        parent_hash: row
            .try_get::<String, _>("parent_hash")?
            .trim_end()
            .to_string(),
        timestamp: to_u64(row.try_get::<i64, _>("timestamp")?, "blocks.timestamp")?,
        chain_id: to_u64(row.try_get::<i64, _>("chain_id")?, "blocks.chain_id")?,
    })
}

fn row_to_transfer(row: &PgRow) -> Result<Transfer, Error> {
    Ok(Transfer {
        block_number: to_u64(row.try_get::<i64, _>("block_number")?, "transfers.block_number")?,
        transaction_hash: row
            .try_get::<String, _>("transaction_hash")?
            .trim_end()
            .to_string(),
        log_index: to_u64(row.try_get::<i64, _>("log_index")?, "transfers.log_index")?,
        from_address: row
            .try_get::<String, _>("from_address")?
            .trim_end()
            .to_string(),
        to_address: row.try_get::<String, _>("to_address")?.trim_end().to_string(),
        amount: row.try_get::<String, _>("amount")?,
        token_address: row
            .try_get::<String, _>("token_address")?
            .trim_end()
            .to_string(),
    })
}

impl PgStore {
    /// Connect the bounded pool and make sure the schema exists.
    pub async fn connect(database_url: &str) -> Result<Self, Error> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .idle_timeout(Duration::from_secs(30))
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;

        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<(), Error> {
        let mut tx = self.pool.begin().await?;
        for statement in SCHEMA.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Drain and close the pool. Called once, on shutdown.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Rollback guard plus delete, shared by the standalone op and the
    /// commit path. Runs on whatever executor the caller hands in so the
    /// reorg case stays inside the batch transaction.
    async fn delete_after_in<E>(executor: &mut E, number: u64) -> Result<u64, Error>
    where
        for<'c> &'c mut E: sqlx::PgExecutor<'c>,
    {
        let floor = to_i64(number, "delete_after")?;

        let above: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM blocks WHERE number > $1")
            .bind(floor)
            .fetch_one(&mut *executor)
            .await?;
        let above = to_u64(above, "delete_after count")?;
        if above > MAX_REORG_DEPTH {
            return Err(Error::ReorgOutOfBounds(format!(
                "refusing to delete {above} blocks above {number}; exceeds MAX_REORG_DEPTH {MAX_REORG_DEPTH}"
            )));
        }

        let deleted = sqlx::query("DELETE FROM blocks WHERE number > $1")
            .bind(floor)
            .execute(&mut *executor)
            .await?
            .rows_affected();

        // FK cascade must have taken the transfers with it.
        let orphans: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM transfers WHERE block_number > $1")
                .bind(floor)
                .fetch_one(&mut *executor)
                .await?;
        if orphans != 0 {
            return Err(Error::Corruption(format!(
                "{orphans} orphan transfers survived rollback past block {number}"
            )));
        }

        Ok(deleted)
    }
}

#[async_trait]
impl BlockStore for PgStore {
    async fn max_height(&self) -> Result<Option<u64>, Error> {
        let max: Option<i64> = sqlx::query_scalar("SELECT MAX(number) FROM blocks")
            .fetch_one(&self.pool)
            .await?;
        max.map(|n| to_u64(n, "max_height")).transpose()
    }

    async fn find_by_height(&self, number: u64) -> Result<Option<Block>, Error> {
        let row = sqlx::query(
            "SELECT number, hash, parent_hash, timestamp, chain_id FROM blocks WHERE number = $1",
        )
        .bind(to_i64(number, "find_by_height")?)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_block).transpose()
    }

    async fn find_by_hash(&self, hash: &str) -> Result<Option<Block>, Error> {
        let row = sqlx::query(
            "SELECT number, hash, parent_hash, timestamp, chain_id FROM blocks WHERE hash = $1",
        )
        .bind(hash)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_block).transpose()
    }

    async fn commit_batch(&self, request: &CommitRequest) -> Result<CommitOutcome, Error> {
        let mut outcome = CommitOutcome::default();
        let mut tx = self.pool.begin().await?;

        if let Some(rollback_to) = request.rollback_to {
            outcome.blocks_deleted = Self::delete_after_in(&mut *tx, rollback_to).await?;
        }

        if let (Some(first), Some(last)) = (request.blocks.first(), request.blocks.last()) {
            // Same height + same hash is a replay and a no-op; same height
            // with a different hash after the rollback already ran means the
            // store contradicts itself.
            let rows = sqlx::query("SELECT number, hash FROM blocks WHERE number BETWEEN $1 AND $2")
                .bind(to_i64(first.number, "commit_batch")?)
                .bind(to_i64(last.number, "commit_batch")?)
                .fetch_all(&mut *tx)
                .await?;
            for row in &rows {
                let number = to_u64(row.try_get::<i64, _>("number")?, "commit_batch")?;
                let stored_hash = row.try_get::<String, _>("hash")?.trim_end().to_string();
                if let Some(incoming) =
                    request.blocks.iter().find(|b| b.number == number)
                {
                    if incoming.hash != stored_hash {
                        return Err(Error::Corruption(format!(
                            "block {number} already stored with hash {stored_hash}, batch carries {}",
                            incoming.hash
                        )));
                    }
                }
            }
        }

        for block in &request.blocks {
            let inserted = sqlx::query(
                "INSERT INTO blocks (number, hash, parent_hash, timestamp, chain_id) \
                 VALUES ($1, $2, $3, $4, $5) ON CONFLICT (number) DO NOTHING",
            )
            .bind(to_i64(block.number, "blocks.number")?)
            .bind(&block.hash)
            .bind(&block.parent_hash)
            .bind(to_i64(block.timestamp, "blocks.timestamp")?)
            .bind(to_i64(block.chain_id, "blocks.chain_id")?)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            outcome.blocks_saved += inserted;
        }

        for transfer in &request.transfers {
            let inserted = sqlx::query(
                "INSERT INTO transfers (block_number, log_index, transaction_hash, \
                 from_address, to_address, amount, token_address) \
                 VALUES ($1, $2, $3, $4, $5, $6::numeric, $7) \
                 ON CONFLICT (block_number, log_index) DO NOTHING",
            )
            .bind(to_i64(transfer.block_number, "transfers.block_number")?)
            .bind(to_i64(transfer.log_index, "transfers.log_index")?)
            .bind(&transfer.transaction_hash)
            .bind(&transfer.from_address)
            .bind(&transfer.to_address)
            .bind(&transfer.amount)
            .bind(&transfer.token_address)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            outcome.transfers_saved += inserted;
        }

        upsert_checkpoint_in(&mut *tx, &request.checkpoint).await?;
        upsert_status_in(&mut *tx, &request.status).await?;

        tx.commit().await?;
        Ok(outcome)
    }

    async fn delete_after(&self, number: u64) -> Result<u64, Error> {
        let mut tx = self.pool.begin().await?;
        let deleted = Self::delete_after_in(&mut *tx, number).await?;
        tx.commit().await?;
        Ok(deleted)
    }

    async fn detect_gaps(&self) -> Result<Vec<Gap>, Error> {
        let rows = sqlx::query(
            "SELECT number + 1 AS lo, next_number - 1 AS hi \
             FROM (SELECT number, LEAD(number) OVER (ORDER BY number) AS next_number \
                   FROM blocks) t \
             WHERE next_number - number > 1 \
             ORDER BY lo",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(Gap {
                    lo: to_u64(row.try_get::<i64, _>("lo")?, "detect_gaps.lo")?,
                    hi: to_u64(row.try_get::<i64, _>("hi")?, "detect_gaps.hi")?,
                })
            })
            .collect()
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), Error> {
        let mut conn = self.pool.acquire().await?;
        upsert_checkpoint_in(&mut *conn, checkpoint).await
    }

    async fn get_checkpoint(&self, name: &str) -> Result<Option<Checkpoint>, Error> {
        let row = sqlx::query(
            "SELECT name, block_number, block_hash, synced_at, metadata \
             FROM checkpoints WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(Checkpoint {
                name: row.try_get("name")?,
                block_number: to_u64(
                    row.try_get::<i64, _>("block_number")?,
                    "checkpoints.block_number",
                )?,
                block_hash: row
                    .try_get::<String, _>("block_hash")?
                    .trim_end()
                    .to_string(),
                synced_at: row.try_get("synced_at")?,
                metadata: row.try_get("metadata")?,
            })
        })
        .transpose()
    }

    async fn upsert_sync_status(&self, status: &SyncStatus) -> Result<(), Error> {
        let mut conn = self.pool.acquire().await?;
        upsert_status_in(&mut *conn, status).await
    }

    async fn try_acquire_lock(
        &self,
        name: &str,
        instance_id: &str,
        ttl: Duration,
    ) -> Result<bool, Error> {
        let row = sqlx::query(
            "INSERT INTO app_locks (name, instance_id, expires_at) \
             VALUES ($1, $2, now() + ($3::bigint * interval '1 millisecond')) \
             ON CONFLICT (name) DO UPDATE \
               SET instance_id = EXCLUDED.instance_id, expires_at = EXCLUDED.expires_at \
               WHERE app_locks.expires_at < now() \
                  OR app_locks.instance_id = EXCLUDED.instance_id \
             RETURNING instance_id",
        )
        .bind(name)
        .bind(instance_id)
        .bind(ttl.as_millis() as i64)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn renew_lock(
        &self,
        name: &str,
        instance_id: &str,
        ttl: Duration,
    ) -> Result<bool, Error> {
        let renewed = sqlx::query(
            "UPDATE app_locks \
             SET expires_at = now() + ($3::bigint * interval '1 millisecond') \
             WHERE name = $1 AND instance_id = $2 AND expires_at >= now()",
        )
        .bind(name)
        .bind(instance_id)
        .bind(ttl.as_millis() as i64)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(renewed == 1)
    }

    async fn release_lock(&self, name: &str, instance_id: &str) -> Result<(), Error> {
        sqlx::query("DELETE FROM app_locks WHERE name = $1 AND instance_id = $2")
            .bind(name)
            .bind(instance_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn healthcheck(&self) -> Result<(), Error> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }
}

async fn upsert_checkpoint_in<'c, E>(executor: E, checkpoint: &Checkpoint) -> Result<(), Error>
where
    E: sqlx::PgExecutor<'c>,
{
    sqlx::query(
        "INSERT INTO checkpoints (name, block_number, block_hash, synced_at, metadata) \
         VALUES ($1, $2, $3, $4, $5) \
         ON CONFLICT (name) DO UPDATE SET \
           block_number = EXCLUDED.block_number, \
           block_hash   = EXCLUDED.block_hash, \
           synced_at    = EXCLUDED.synced_at, \
           metadata     = EXCLUDED.metadata",
    )
    .bind(&checkpoint.name)
    .bind(to_i64(checkpoint.block_number, "checkpoints.block_number")?)
    .bind(&checkpoint.block_hash)
    .bind(checkpoint.synced_at)
    .bind(&checkpoint.metadata)
    .execute(executor)
    .await?;
    Ok(())
}

async fn upsert_status_in<'c, E>(executor: E, status: &SyncStatus) -> Result<(), Error>
where
    E: sqlx::PgExecutor<'c>,
{
    let last_block = status
        .last_processed_block
        .map(|n| to_i64(n, "sync_status.last_processed_block"))
        .transpose()?;
    let target = status
        .target_block
        .map(|n| to_i64(n, "sync_status.target_block"))
        .transpose()?;

    sqlx::query(
        "INSERT INTO sync_status (processor_name, last_processed_block, last_processed_hash, \
         target_block, synced_percent, state, error_message, updated_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, now()) \
         ON CONFLICT (processor_name) DO UPDATE SET \
           last_processed_block = EXCLUDED.last_processed_block, \
           last_processed_hash  = EXCLUDED.last_processed_hash, \
           target_block         = EXCLUDED.target_block, \
           synced_percent       = EXCLUDED.synced_percent, \
           state                = EXCLUDED.state, \
           error_message        = EXCLUDED.error_message, \
           updated_at           = now()",
    )
    .bind(&status.processor_name)
    .bind(last_block)
    .bind(&status.last_processed_hash)
    .bind(target)
    .bind(status.synced_percent)
    .bind(status.state.as_str())
    .bind(&status.error_message)
    .execute(executor)
    .await?;
    Ok(())
}

/// Read-side queries consumed by the HTTP API. These never run inside the
/// engine's write path and hold no locks beyond a single SELECT.
impl PgStore {
    pub async fn list_blocks(&self, offset: u64, limit: u64) -> Result<Vec<Block>, Error> {
        let rows = sqlx::query(
            "SELECT number, hash, parent_hash, timestamp, chain_id \
             FROM blocks ORDER BY number DESC OFFSET $1 LIMIT $2",
        )
        .bind(to_i64(offset, "list_blocks.offset")?)
        .bind(to_i64(limit, "list_blocks.limit")?)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_block).collect()
    }

    pub async fn count_blocks(&self) -> Result<u64, Error> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM blocks")
            .fetch_one(&self.pool)
            .await?;
        to_u64(count, "count_blocks")
    }

    pub async fn transfers_for_block(&self, number: u64) -> Result<Vec<Transfer>, Error> {
        let rows = sqlx::query(
            "SELECT block_number, log_index, transaction_hash, from_address, to_address, \
             amount::text AS amount, token_address \
             FROM transfers WHERE block_number = $1 ORDER BY log_index",
        )
        .bind(to_i64(number, "transfers_for_block")?)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_transfer).collect()
    }

    pub async fn list_transfers(
        &self,
        token: Option<&str>,
        participant: Option<&str>,
        block: Option<u64>,
        offset: u64,
        limit: u64,
    ) -> Result<(Vec<Transfer>, u64), Error> {
        // Filters are optional; NULL parameters disable their clause.
        let block = block.map(|n| to_i64(n, "list_transfers.block")).transpose()?;
        let where_clause = "WHERE ($1::text IS NULL OR token_address = $1) \
             AND ($2::text IS NULL OR from_address = $2 OR to_address = $2) \
             AND ($3::bigint IS NULL OR block_number = $3)";

        let total: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM transfers {where_clause}"
        ))
        .bind(token)
        .bind(participant)
        .bind(block)
        .fetch_one(&self.pool)
        .await?;

        let rows = sqlx::query(&format!(
            "SELECT block_number, log_index, transaction_hash, from_address, to_address, \
             amount::text AS amount, token_address \
             FROM transfers {where_clause} \
             ORDER BY block_number DESC, log_index DESC OFFSET $4 LIMIT $5"
        ))
        .bind(token)
        .bind(participant)
        .bind(block)
        .bind(to_i64(offset, "list_transfers.offset")?)
        .bind(to_i64(limit, "list_transfers.limit")?)
        .fetch_all(&self.pool)
        .await?;

        let transfers: Result<Vec<_>, _> = rows.iter().map(row_to_transfer).collect();
        Ok((transfers?, to_u64(total, "list_transfers.total")?))
    }

    pub async fn get_sync_status(&self, processor: &str) -> Result<Option<SyncStatus>, Error> {
        let row = sqlx::query(
            "SELECT processor_name, last_processed_block, last_processed_hash, target_block, \
             synced_percent, state, error_message FROM sync_status WHERE processor_name = $1",
        )
        .bind(processor)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            let state: String = row.try_get("state")?;
            Ok(SyncStatus {
                processor_name: row.try_get("processor_name")?,
                last_processed_block: row
                    .try_get::<Option<i64>, _>("last_processed_block")?
                    .map(|n| to_u64(n, "sync_status.last_processed_block"))
                    .transpose()?,
                last_processed_hash: row
                    .try_get::<Option<String>, _>("last_processed_hash")?
                    .map(|h| h.trim_end().to_string()),
                target_block: row
                    .try_get::<Option<i64>, _>("target_block")?
                    .map(|n| to_u64(n, "sync_status.target_block"))
                    .transpose()?,
                synced_percent: row.try_get("synced_percent")?,
                state: state
                    .parse::<SyncState>()
                    .map_err(Error::Corruption)?,
                error_message: row.try_get("error_message")?,
            })
        })
        .transpose()
    }
}
