//! PostgreSQL state manager

use super::model::{
    ChainType, LockAttempt, MonitoringLockRecord, NewTransaction, TransactionInput,
    TransactionRecord, TransactionStatus,
};
use super::{check_update, LockStore, TransactionStore};
use crate::config::DatabaseConfig;
use crate::error::{EngineError, EngineResult};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info};

const RECORD_COLUMNS: &str = r#"
    id, chain_type, source_address, destination_address, fee_source_address,
    amount, fee, max_fee, reference, pay_fee_from_amount,
    execute_until_block, execute_until_timestamp, status, raw, transaction_hash,
    submitted_in_block, submitted_in_timestamp, replaced_by, ancestor,
    reached_status_prepared_in_timestamp, reached_status_pending_in_timestamp,
    reached_final_status_in_timestamp, server_submit_response, created_at
"#;

/// State manager for PostgreSQL persistence
pub struct StateManager {
    pool: PgPool,
}

impl StateManager {
    /// Create a new state manager
    pub async fn new(config: &DatabaseConfig) -> EngineResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> EngineResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS wallet_transaction (
                id BIGSERIAL PRIMARY KEY,
                chain_type VARCHAR(16) NOT NULL,
                source_address TEXT NOT NULL,
                destination_address TEXT NOT NULL,
                fee_source_address TEXT,
                amount BIGINT,
                fee BIGINT,
                max_fee BIGINT,
                reference TEXT,
                pay_fee_from_amount BOOLEAN NOT NULL DEFAULT FALSE,
                execute_until_block BIGINT,
                execute_until_timestamp TIMESTAMPTZ,
                status VARCHAR(20) NOT NULL,
                raw TEXT,
                transaction_hash VARCHAR(128),
                submitted_in_block BIGINT,
                submitted_in_timestamp TIMESTAMPTZ,
                replaced_by BIGINT REFERENCES wallet_transaction (id),
                ancestor BIGINT REFERENCES wallet_transaction (id),
                reached_status_prepared_in_timestamp TIMESTAMPTZ,
                reached_status_pending_in_timestamp TIMESTAMPTZ,
                reached_final_status_in_timestamp TIMESTAMPTZ,
                server_submit_response TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_transaction_chain_status
            ON wallet_transaction (chain_type, status, id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_transaction_hash
            ON wallet_transaction (chain_type, transaction_hash)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS transaction_input (
                transaction_id BIGINT NOT NULL REFERENCES wallet_transaction (id),
                txid VARCHAR(64) NOT NULL,
                vout INTEGER NOT NULL,
                value BIGINT NOT NULL,
                address TEXT NOT NULL,
                PRIMARY KEY (transaction_id, txid, vout)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS monitoring_state (
                chain_type VARCHAR(16) PRIMARY KEY,
                process_owner TEXT NOT NULL DEFAULT '',
                last_ping_timestamp BIGINT NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }

    /// Health check
    pub async fn health_check(&self) -> EngineResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn fetch_records(
        &self,
        filter: &str,
        binds: impl FnOnce(
            sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
        ) -> sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
    ) -> EngineResult<Vec<TransactionRecord>> {
        let sql = format!(
            "SELECT {} FROM wallet_transaction WHERE {} ORDER BY id",
            RECORD_COLUMNS, filter
        );
        let rows = binds(sqlx::query(&sql)).fetch_all(&self.pool).await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn locked_status(
        conn: &mut PgConnection,
        id: i64,
    ) -> EngineResult<TransactionStatus> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM wallet_transaction WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *conn)
                .await?;
        status
            .ok_or(EngineError::TransactionNotFound { id })?
            .parse()
    }

    async fn insert_record(
        conn: &mut PgConnection,
        tx: NewTransaction,
    ) -> EngineResult<TransactionRecord> {
        let row = sqlx::query(
            r#"
            INSERT INTO wallet_transaction
                (chain_type, source_address, destination_address, fee_source_address,
                 amount, fee, max_fee, reference, pay_fee_from_amount,
                 execute_until_block, execute_until_timestamp, ancestor, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING id, created_at
            "#,
        )
        .bind(tx.chain.as_str())
        .bind(&tx.source)
        .bind(&tx.destination)
        .bind(&tx.fee_source)
        .bind(opt_to_db(tx.amount)?)
        .bind(opt_to_db(tx.fee)?)
        .bind(opt_to_db(tx.max_fee)?)
        .bind(&tx.reference)
        .bind(tx.pay_fee_from_amount)
        .bind(opt_to_db(tx.execute_until_block)?)
        .bind(tx.execute_until_timestamp)
        .bind(tx.ancestor)
        .bind(TransactionStatus::Created.as_str())
        .fetch_one(&mut *conn)
        .await?;

        let id: i64 = row.try_get("id")?;
        let created_at: DateTime<Utc> = row.try_get("created_at")?;
        Ok(tx.into_record(id, created_at))
    }

    async fn write_record(conn: &mut PgConnection, record: &TransactionRecord) -> EngineResult<()> {
        sqlx::query(
            r#"
            UPDATE wallet_transaction SET
                amount = $2, fee = $3, status = $4, raw = $5, transaction_hash = $6,
                submitted_in_block = $7, submitted_in_timestamp = $8, replaced_by = $9,
                ancestor = $10, reached_status_prepared_in_timestamp = $11,
                reached_status_pending_in_timestamp = $12,
                reached_final_status_in_timestamp = $13, server_submit_response = $14
            WHERE id = $1
            "#,
        )
        .bind(record.id)
        .bind(opt_to_db(record.amount)?)
        .bind(opt_to_db(record.fee)?)
        .bind(record.status.as_str())
        .bind(&record.raw)
        .bind(&record.transaction_hash)
        .bind(opt_to_db(record.submitted_in_block)?)
        .bind(record.submitted_in_timestamp)
        .bind(record.replaced_by)
        .bind(record.ancestor)
        .bind(record.reached_status_prepared_in_timestamp)
        .bind(record.reached_status_pending_in_timestamp)
        .bind(record.reached_final_status_in_timestamp)
        .bind(&record.server_submit_response)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl TransactionStore for StateManager {
    async fn create_transaction(&self, tx: NewTransaction) -> EngineResult<TransactionRecord> {
        let mut conn = self.pool.acquire().await?;
        let record = Self::insert_record(&mut conn, tx).await?;
        debug!("Created transaction {} on chain {}", record.id, record.chain);
        Ok(record)
    }

    async fn get_transaction(&self, id: i64) -> EngineResult<Option<TransactionRecord>> {
        let records = self
            .fetch_records("id = $1", |q| q.bind(id))
            .await?;
        Ok(records.into_iter().next())
    }

    async fn transactions_in_status(
        &self,
        chain: ChainType,
        status: TransactionStatus,
    ) -> EngineResult<Vec<TransactionRecord>> {
        self.fetch_records("chain_type = $1 AND status = $2", |q| {
            q.bind(chain.as_str()).bind(status.as_str())
        })
        .await
    }

    async fn update_transaction(&self, record: &TransactionRecord) -> EngineResult<()> {
        let mut tx = self.pool.begin().await?;
        let current = Self::locked_status(&mut tx, record.id).await?;
        check_update(current, record.status)?;
        Self::write_record(&mut tx, record).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn save_prepared(
        &self,
        record: &TransactionRecord,
        inputs: &[TransactionInput],
    ) -> EngineResult<()> {
        let mut tx = self.pool.begin().await?;
        let current = Self::locked_status(&mut tx, record.id).await?;
        check_update(current, record.status)?;
        Self::write_record(&mut tx, record).await?;

        sqlx::query("DELETE FROM transaction_input WHERE transaction_id = $1")
            .bind(record.id)
            .execute(&mut *tx)
            .await?;
        for input in inputs {
            sqlx::query(
                r#"
                INSERT INTO transaction_input (transaction_id, txid, vout, value, address)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(record.id)
            .bind(&input.txid)
            .bind(i32::try_from(input.vout).map_err(|_| {
                EngineError::Internal(format!("output index {} out of range", input.vout))
            })?)
            .bind(to_db(input.value)?)
            .bind(&input.address)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn replace_transaction(
        &self,
        old: &TransactionRecord,
        old_status: TransactionStatus,
        replacement: NewTransaction,
        now: DateTime<Utc>,
    ) -> EngineResult<TransactionRecord> {
        let mut tx = self.pool.begin().await?;

        let current = Self::locked_status(&mut tx, old.id).await?;
        if current != old.status {
            return Err(EngineError::WriteConflict(format!(
                "transaction {} moved to {} concurrently",
                old.id, current
            )));
        }

        let mut superseded = old.clone();
        superseded.transition(old_status, now)?;
        let created = Self::insert_record(&mut tx, replacement).await?;
        superseded.replaced_by = Some(created.id);
        Self::write_record(&mut tx, &superseded).await?;

        tx.commit().await?;
        Ok(created)
    }

    async fn replaced_predecessor(&self, id: i64) -> EngineResult<Option<TransactionRecord>> {
        let records = self
            .fetch_records("replaced_by = $1", |q| q.bind(id))
            .await?;
        Ok(records.into_iter().next())
    }

    async fn open_transactions_for_source(
        &self,
        chain: ChainType,
        source: &str,
    ) -> EngineResult<Vec<TransactionRecord>> {
        let source = source.to_string();
        self.fetch_records(
            "chain_type = $1 AND source_address = $2 AND status <> ALL($3)",
            |q| q.bind(chain.as_str()).bind(source).bind(terminal_statuses()),
        )
        .await
    }

    async fn find_by_hash(
        &self,
        chain: ChainType,
        hash: &str,
    ) -> EngineResult<Option<TransactionRecord>> {
        let hash = hash.to_string();
        let records = self
            .fetch_records("chain_type = $1 AND UPPER(transaction_hash) = UPPER($2)", |q| {
                q.bind(chain.as_str()).bind(hash)
            })
            .await?;
        Ok(records.into_iter().next())
    }

    async fn descendants(&self, id: i64) -> EngineResult<Vec<TransactionRecord>> {
        self.fetch_records("ancestor = $1 AND status <> ALL($2)", |q| {
            q.bind(id).bind(terminal_statuses())
        })
        .await
    }

    async fn inputs(&self, transaction_id: i64) -> EngineResult<Vec<TransactionInput>> {
        let rows = sqlx::query(
            "SELECT txid, vout, value, address FROM transaction_input WHERE transaction_id = $1",
        )
        .bind(transaction_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(input_from_row).collect()
    }

    async fn locked_inputs(&self, chain: ChainType) -> EngineResult<Vec<TransactionInput>> {
        let in_flight: Vec<String> = TransactionStatus::ALL
            .iter()
            .filter(|s| s.is_in_flight())
            .map(|s| s.as_str().to_string())
            .collect();

        let rows = sqlx::query(
            r#"
            SELECT i.txid, i.vout, i.value, i.address
            FROM transaction_input i
            JOIN wallet_transaction t ON t.id = i.transaction_id
            WHERE t.chain_type = $1 AND t.status = ANY($2)
            "#,
        )
        .bind(chain.as_str())
        .bind(in_flight)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(input_from_row).collect()
    }
}

#[async_trait]
impl LockStore for StateManager {
    async fn try_acquire_lock(
        &self,
        chain: ChainType,
        owner: &str,
        now_ms: i64,
        expiration_ms: i64,
    ) -> EngineResult<LockAttempt> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT last_ping_timestamp FROM monitoring_state WHERE chain_type = $1 FOR UPDATE",
        )
        .bind(chain.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        let attempt = match row {
            None => {
                let inserted = sqlx::query(
                    r#"
                    INSERT INTO monitoring_state (chain_type, process_owner, last_ping_timestamp)
                    VALUES ($1, $2, $3)
                    ON CONFLICT (chain_type) DO NOTHING
                    "#,
                )
                .bind(chain.as_str())
                .bind(owner)
                .bind(now_ms)
                .execute(&mut *tx)
                .await?;

                // A concurrent process created the row first
                LockAttempt {
                    acquired: inserted.rows_affected() == 1,
                    last_ping: (inserted.rows_affected() == 1).then_some(now_ms),
                }
            }
            Some(row) => {
                let last_ping: i64 = row.try_get("last_ping_timestamp")?;
                if now_ms > last_ping + expiration_ms {
                    sqlx::query(
                        r#"
                        UPDATE monitoring_state
                        SET process_owner = $2, last_ping_timestamp = $3
                        WHERE chain_type = $1
                        "#,
                    )
                    .bind(chain.as_str())
                    .bind(owner)
                    .bind(now_ms)
                    .execute(&mut *tx)
                    .await?;
                    LockAttempt {
                        acquired: true,
                        last_ping: Some(now_ms),
                    }
                } else {
                    LockAttempt {
                        acquired: false,
                        last_ping: Some(last_ping),
                    }
                }
            }
        };

        tx.commit().await?;
        Ok(attempt)
    }

    async fn ping_lock(&self, chain: ChainType, owner: &str, now_ms: i64) -> EngineResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE monitoring_state SET last_ping_timestamp = $3
            WHERE chain_type = $1 AND process_owner = $2
            "#,
        )
        .bind(chain.as_str())
        .bind(owner)
        .bind(now_ms)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release_lock(&self, chain: ChainType, owner: &str) -> EngineResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE monitoring_state SET process_owner = '', last_ping_timestamp = 0
            WHERE chain_type = $1 AND process_owner = $2
            "#,
        )
        .bind(chain.as_str())
        .bind(owner)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_lock(&self, chain: ChainType) -> EngineResult<Option<MonitoringLockRecord>> {
        let row = sqlx::query(
            "SELECT process_owner, last_ping_timestamp FROM monitoring_state WHERE chain_type = $1",
        )
        .bind(chain.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| {
            Ok(MonitoringLockRecord {
                chain,
                process_owner: r.try_get("process_owner")?,
                last_ping: r.try_get("last_ping_timestamp")?,
            })
        })
        .transpose()
    }
}

fn terminal_statuses() -> Vec<String> {
    TransactionStatus::ALL
        .iter()
        .filter(|s| s.is_terminal())
        .map(|s| s.as_str().to_string())
        .collect()
}

fn to_db(value: u64) -> EngineResult<i64> {
    i64::try_from(value).map_err(|_| {
        EngineError::InvalidAmount(format!("{} exceeds the storable range", value))
    })
}

fn opt_to_db(value: Option<u64>) -> EngineResult<Option<i64>> {
    value.map(to_db).transpose()
}

fn amount_from_db(value: i64) -> EngineResult<u64> {
    u64::try_from(value)
        .map_err(|_| EngineError::Internal(format!("negative amount {} stored", value)))
}

fn from_db(value: Option<i64>) -> EngineResult<Option<u64>> {
    value.map(amount_from_db).transpose()
}

fn record_from_row(row: &PgRow) -> EngineResult<TransactionRecord> {
    let chain: String = row.try_get("chain_type")?;
    let status: String = row.try_get("status")?;

    Ok(TransactionRecord {
        id: row.try_get("id")?,
        chain: chain.parse()?,
        source: row.try_get("source_address")?,
        destination: row.try_get("destination_address")?,
        fee_source: row.try_get("fee_source_address")?,
        amount: from_db(row.try_get("amount")?)?,
        fee: from_db(row.try_get("fee")?)?,
        max_fee: from_db(row.try_get("max_fee")?)?,
        reference: row.try_get("reference")?,
        pay_fee_from_amount: row.try_get("pay_fee_from_amount")?,
        execute_until_block: from_db(row.try_get("execute_until_block")?)?,
        execute_until_timestamp: row.try_get("execute_until_timestamp")?,
        status: status.parse()?,
        raw: row.try_get("raw")?,
        transaction_hash: row.try_get("transaction_hash")?,
        submitted_in_block: from_db(row.try_get("submitted_in_block")?)?,
        submitted_in_timestamp: row.try_get("submitted_in_timestamp")?,
        replaced_by: row.try_get("replaced_by")?,
        ancestor: row.try_get("ancestor")?,
        reached_status_prepared_in_timestamp: row.try_get("reached_status_prepared_in_timestamp")?,
        reached_status_pending_in_timestamp: row.try_get("reached_status_pending_in_timestamp")?,
        reached_final_status_in_timestamp: row.try_get("reached_final_status_in_timestamp")?,
        server_submit_response: row.try_get("server_submit_response")?,
        created_at: row.try_get("created_at")?,
    })
}

fn input_from_row(row: &PgRow) -> EngineResult<TransactionInput> {
    let vout: i32 = row.try_get("vout")?;
    let value: i64 = row.try_get("value")?;
    Ok(TransactionInput {
        txid: row.try_get("txid")?,
        vout: u32::try_from(vout)
            .map_err(|_| EngineError::Internal(format!("negative output index {} stored", vout)))?,
        value: amount_from_db(value)?,
        address: row.try_get("address")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_amount_conversion_rejects_out_of_range() {
        assert_eq!(to_db(42).unwrap(), 42);
        assert_eq!(to_db(i64::MAX as u64).unwrap(), i64::MAX);
        assert!(matches!(to_db(u64::MAX), Err(EngineError::InvalidAmount(_))));
        assert!(matches!(
            opt_to_db(Some(i64::MAX as u64 + 1)),
            Err(EngineError::InvalidAmount(_))
        ));
        assert_eq!(opt_to_db(None).unwrap(), None);

        assert_eq!(from_db(Some(7)).unwrap(), Some(7));
        assert_eq!(from_db(None).unwrap(), None);
        assert!(matches!(from_db(Some(-1)), Err(EngineError::Internal(_))));
    }
}
