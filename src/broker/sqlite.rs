//! SQLite implementation of LogStore.

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnection, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::time::Duration;

use super::log::{LogStore, Membership};
use super::{BrokerError, ConsumerId, Offset, Partition, Record};

fn storage(e: sqlx::Error) -> BrokerError {
    BrokerError::Storage(e.to_string())
}

async fn bump_generation(
    conn: &mut SqliteConnection,
    group: &str,
    topic: &str,
) -> Result<(), BrokerError> {
    sqlx::query(
        r#"
        INSERT INTO tasklog_groups (group_id, topic, generation)
        VALUES (?, ?, 1)
        ON CONFLICT (group_id, topic) DO UPDATE SET generation = generation + 1
        "#,
    )
    .bind(group)
    .bind(topic)
    .execute(conn)
    .await
    .map_err(storage)?;
    Ok(())
}

/// SQLite-backed log store.
///
/// Records and committed positions survive restarts of the process. Group
/// membership is stored too, so workers in separate processes can share one
/// database file and split its partitions.
#[derive(Clone)]
pub struct SqliteLogStore {
    pool: SqlitePool,
}

impl SqliteLogStore {
    /// Create a new SqliteLogStore.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to `url` (e.g. `sqlite://tasks.db?mode=rwc`) and run migrations.
    ///
    /// In-memory URLs get a single connection, since each connection would
    /// otherwise open its own empty database.
    pub async fn connect(url: &str) -> Result<Self, BrokerError> {
        let mut options = SqlitePoolOptions::new();
        if url.contains(":memory:") {
            options = options.max_connections(1);
        }
        let pool = options.connect(url).await.map_err(storage)?;
        let store = Self::new(pool);
        store.run_migrations().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Run migrations to create the log tables.
    pub async fn run_migrations(&self) -> Result<(), BrokerError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasklog_topics (
                name TEXT PRIMARY KEY,
                partitions INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasklog_records (
                topic TEXT NOT NULL,
                partition_id INTEGER NOT NULL,
                log_offset INTEGER NOT NULL,
                record_key TEXT NOT NULL,
                value BLOB NOT NULL,
                appended_at TEXT NOT NULL,
                PRIMARY KEY (topic, partition_id, log_offset)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasklog_offsets (
                group_id TEXT NOT NULL,
                topic TEXT NOT NULL,
                partition_id INTEGER NOT NULL,
                next_offset INTEGER NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (group_id, topic, partition_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasklog_groups (
                group_id TEXT NOT NULL,
                topic TEXT NOT NULL,
                generation INTEGER NOT NULL,
                PRIMARY KEY (group_id, topic)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasklog_members (
                member_id INTEGER PRIMARY KEY AUTOINCREMENT,
                group_id TEXT NOT NULL,
                topic TEXT NOT NULL,
                last_seen_ms INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        Ok(())
    }
}

#[async_trait]
impl LogStore for SqliteLogStore {
    async fn create_topic(&self, topic: &str, partitions: Partition) -> Result<(), BrokerError> {
        sqlx::query("INSERT OR IGNORE INTO tasklog_topics (name, partitions) VALUES (?, ?)")
            .bind(topic)
            .bind(partitions.max(1))
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        Ok(())
    }

    async fn partitions(&self, topic: &str) -> Result<Option<Partition>, BrokerError> {
        sqlx::query_scalar::<_, i32>("SELECT partitions FROM tasklog_topics WHERE name = ?")
            .bind(topic)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)
    }

    async fn append(
        &self,
        topic: &str,
        partition: Partition,
        key: &str,
        value: &[u8],
    ) -> Result<Offset, BrokerError> {
        let partitions = self
            .partitions(topic)
            .await?
            .ok_or_else(|| BrokerError::UnknownTopic(topic.to_string()))?;
        if !(0..partitions).contains(&partition) {
            return Err(BrokerError::Storage(format!(
                "partition {partition} does not exist in '{topic}'"
            )));
        }

        // The offset is picked by the insert itself.
        sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO tasklog_records (topic, partition_id, log_offset, record_key, value, appended_at)
            SELECT ?, ?, COALESCE(MAX(log_offset) + 1, 0), ?, ?, ?
            FROM tasklog_records
            WHERE topic = ? AND partition_id = ?
            RETURNING log_offset
            "#,
        )
        .bind(topic)
        .bind(partition)
        .bind(key)
        .bind(value)
        .bind(chrono::Utc::now().to_rfc3339())
        .bind(topic)
        .bind(partition)
        .fetch_one(&self.pool)
        .await
        .map_err(storage)
    }

    async fn read(
        &self,
        topic: &str,
        partition: Partition,
        from: Offset,
        limit: usize,
    ) -> Result<Vec<Record>, BrokerError> {
        let rows = sqlx::query_as::<_, (i64, String, Vec<u8>)>(
            r#"
            SELECT log_offset, record_key, value FROM tasklog_records
            WHERE topic = ? AND partition_id = ? AND log_offset >= ?
            ORDER BY log_offset
            LIMIT ?
            "#,
        )
        .bind(topic)
        .bind(partition)
        .bind(from)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;

        Ok(rows
            .into_iter()
            .map(|(offset, key, value)| Record {
                topic: topic.to_string(),
                partition,
                offset,
                key,
                value,
            })
            .collect())
    }

    async fn committed(
        &self,
        group: &str,
        topic: &str,
        partition: Partition,
    ) -> Result<Option<Offset>, BrokerError> {
        sqlx::query_scalar::<_, i64>(
            r#"
            SELECT next_offset FROM tasklog_offsets
            WHERE group_id = ? AND topic = ? AND partition_id = ?
            "#,
        )
        .bind(group)
        .bind(topic)
        .bind(partition)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)
    }

    async fn commit(
        &self,
        group: &str,
        topic: &str,
        partition: Partition,
        next_offset: Offset,
    ) -> Result<(), BrokerError> {
        sqlx::query(
            r#"
            INSERT INTO tasklog_offsets (group_id, topic, partition_id, next_offset, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (group_id, topic, partition_id) DO UPDATE
            SET next_offset = MAX(next_offset, excluded.next_offset),
                updated_at = excluded.updated_at
            "#,
        )
        .bind(group)
        .bind(topic)
        .bind(partition)
        .bind(next_offset)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(())
    }

    async fn join(&self, group: &str, topic: &str) -> Result<ConsumerId, BrokerError> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO tasklog_members (group_id, topic, last_seen_ms)
            VALUES (?, ?, ?)
            RETURNING member_id
            "#,
        )
        .bind(group)
        .bind(topic)
        .bind(chrono::Utc::now().timestamp_millis())
        .fetch_one(&mut *tx)
        .await
        .map_err(storage)?;
        bump_generation(&mut tx, group, topic).await?;
        tx.commit().await.map_err(storage)?;
        Ok(ConsumerId(id as u64))
    }

    async fn heartbeat(
        &self,
        group: &str,
        topic: &str,
        member: ConsumerId,
        session_timeout: Duration,
    ) -> Result<Membership, BrokerError> {
        let now = chrono::Utc::now().timestamp_millis();
        let cutoff = now - session_timeout.as_millis() as i64;

        // Write first so the transaction takes the write lock up front.
        let mut tx = self.pool.begin().await.map_err(storage)?;
        let refreshed = sqlx::query(
            r#"
            UPDATE tasklog_members SET last_seen_ms = ?
            WHERE member_id = ? AND group_id = ? AND topic = ?
            "#,
        )
        .bind(now)
        .bind(member.0 as i64)
        .bind(group)
        .bind(topic)
        .execute(&mut *tx)
        .await
        .map_err(storage)?
        .rows_affected();

        let rejoined = refreshed == 0;
        if rejoined {
            sqlx::query(
                r#"
                INSERT INTO tasklog_members (member_id, group_id, topic, last_seen_ms)
                VALUES (?, ?, ?, ?)
                "#,
            )
            .bind(member.0 as i64)
            .bind(group)
            .bind(topic)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        }

        let expired = sqlx::query(
            "DELETE FROM tasklog_members WHERE group_id = ? AND topic = ? AND last_seen_ms < ?",
        )
        .bind(group)
        .bind(topic)
        .bind(cutoff)
        .execute(&mut *tx)
        .await
        .map_err(storage)?
        .rows_affected();

        if rejoined || expired > 0 {
            bump_generation(&mut tx, group, topic).await?;
        }

        let generation = sqlx::query_scalar::<_, i64>(
            "SELECT generation FROM tasklog_groups WHERE group_id = ? AND topic = ?",
        )
        .bind(group)
        .bind(topic)
        .fetch_optional(&mut *tx)
        .await
        .map_err(storage)?
        .unwrap_or(0);

        let members = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT member_id FROM tasklog_members
            WHERE group_id = ? AND topic = ?
            ORDER BY member_id
            "#,
        )
        .bind(group)
        .bind(topic)
        .fetch_all(&mut *tx)
        .await
        .map_err(storage)?;

        tx.commit().await.map_err(storage)?;
        Ok(Membership {
            generation: generation as u64,
            members: members.into_iter().map(|id| ConsumerId(id as u64)).collect(),
        })
    }

    async fn leave(
        &self,
        group: &str,
        topic: &str,
        member: ConsumerId,
    ) -> Result<(), BrokerError> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        let removed = sqlx::query(
            "DELETE FROM tasklog_members WHERE member_id = ? AND group_id = ? AND topic = ?",
        )
        .bind(member.0 as i64)
        .bind(group)
        .bind(topic)
        .execute(&mut *tx)
        .await
        .map_err(storage)?
        .rows_affected();
        if removed > 0 {
            bump_generation(&mut tx, group, topic).await?;
        }
        tx.commit().await.map_err(storage)?;
        Ok(())
    }
}
