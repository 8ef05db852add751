//! SQLite-based recorder implementation.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::broker::{ConsumerId, Offset, Partition};
use crate::recorder::{Recorder, Resolution};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tasklog_executions (
    id INTEGER PRIMARY KEY,
    topic TEXT NOT NULL,
    partition_id INTEGER NOT NULL,
    log_offset INTEGER NOT NULL,
    task_type TEXT,
    execute_count INTEGER NOT NULL,
    state TEXT NOT NULL,
    error_message TEXT,
    resolved_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS tasklog_commits (
    id INTEGER PRIMARY KEY,
    consumer_id INTEGER NOT NULL,
    topic TEXT NOT NULL,
    partition_id INTEGER NOT NULL,
    log_offset INTEGER NOT NULL,
    committed_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_tasklog_executions_state ON tasklog_executions(state, resolved_at);
CREATE INDEX IF NOT EXISTS idx_tasklog_commits_partition ON tasklog_commits(topic, partition_id)
"#;

/// Stored error messages are cut to this many characters.
const MAX_ERROR_CHARS: usize = 2000;

/// SQLite-based recorder for execution history and commits.
#[derive(Clone)]
pub struct SqliteRecorder {
    pool: SqlitePool,
}

impl SqliteRecorder {
    /// Create a new SQLite recorder with the given connection pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Run database migrations to create required tables.
    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        for statement in SCHEMA.split(';') {
            let trimmed = statement.trim();
            if !trimmed.is_empty() {
                sqlx::query(trimmed).execute(&self.pool).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Recorder for SqliteRecorder {
    async fn entry_resolved(&self, resolution: &Resolution) -> anyhow::Result<()> {
        let error = resolution.error.as_deref().map(|e| {
            let end = e
                .char_indices()
                .nth(MAX_ERROR_CHARS)
                .map(|(i, _)| i)
                .unwrap_or(e.len());
            &e[..end]
        });

        sqlx::query(
            "INSERT INTO tasklog_executions (topic, partition_id, log_offset, task_type, execute_count, state, error_message) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&resolution.topic)
        .bind(resolution.partition)
        .bind(resolution.offset)
        .bind(resolution.task_type.as_deref())
        .bind(resolution.execute_count as i64)
        .bind(resolution.state.to_string())
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn offsets_committed(
        &self,
        consumer: ConsumerId,
        topic: &str,
        offsets: &[(Partition, Offset)],
    ) -> anyhow::Result<()> {
        for (partition, offset) in offsets {
            sqlx::query(
                "INSERT INTO tasklog_commits (consumer_id, topic, partition_id, log_offset) VALUES (?, ?, ?, ?)",
            )
            .bind(consumer.0 as i64)
            .bind(topic)
            .bind(*partition)
            .bind(*offset)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }
}
