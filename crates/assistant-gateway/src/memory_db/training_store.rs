//! Prompt/completion pairs derived from sessions
use crate::error::GatewayError;
use crate::memory::Role;
use crate::memory_db::schema::*;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Row, TransactionBehavior};
use std::sync::Arc;
use tracing::{debug, info};

const TRAINING_COLUMNS: &str =
    "id, prompt, completion, source, quality_score, created_at, is_used_for_training, metadata";

pub struct TrainingStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl TrainingStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> anyhow::Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(|e| anyhow::anyhow!("Failed to get connection from pool: {}", e))
    }

    pub fn add(
        &self,
        prompt: &str,
        completion: &str,
        source: Option<&str>,
        quality_score: Option<u8>,
        metadata: Option<&Metadata>,
    ) -> anyhow::Result<i64> {
        validate_quality(quality_score)?;
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO training_data (prompt, completion, source, quality_score, created_at, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![prompt, completion, source, quality_score, now_timestamp(), metadata_json(metadata)?],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Unused and used records alike, newest first, optionally filtered by minimum quality.
    pub fn list(&self, limit: usize, offset: usize, min_quality: Option<u8>) -> anyhow::Result<Vec<TrainingRecord>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM training_data
             WHERE (?1 IS NULL OR quality_score >= ?1)
             ORDER BY created_at DESC, id DESC LIMIT ?2 OFFSET ?3",
            TRAINING_COLUMNS
        ))?;
        let mut rows = stmt.query(params![min_quality, limit as i64, offset as i64])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(row_to_record(row)?);
        }
        Ok(records)
    }

    pub fn mark_used(&self, id: i64) -> anyhow::Result<bool> {
        let conn = self.get_conn()?;
        let updated = conn.execute(
            "UPDATE training_data SET is_used_for_training = 1 WHERE id = ?1",
            [id],
        )?;
        Ok(updated > 0)
    }

    /// Pair the i-th user message with the i-th assistant message of a session.
    /// Returns how many records were written.
    pub fn export_session(&self, session_id: &str, quality_score: Option<u8>) -> anyhow::Result<usize> {
        validate_quality(quality_score)?;
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let exists: i64 = tx.query_row(
            "SELECT COUNT(*) FROM sessions WHERE session_id = ?1",
            [session_id],
            |row| row.get(0),
        )?;
        if exists == 0 {
            return Err(GatewayError::NotFound(format!("session {}", session_id)).into());
        }

        let (prompts, completions) = {
            let mut stmt = tx.prepare(
                "SELECT role, content FROM messages WHERE session_id = ?1 ORDER BY id ASC",
            )?;
            let rows = stmt.query_map([session_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            let mut prompts = Vec::new();
            let mut completions = Vec::new();
            for row in rows {
                let (role, content) = row?;
                match role.parse::<Role>()? {
                    Role::User => prompts.push(content),
                    Role::Assistant => completions.push(content),
                    Role::System => {}
                }
            }
            (prompts, completions)
        };

        let source = format!("session:{}", session_id);
        let mut metadata = Metadata::new();
        metadata.insert("session_id".into(), serde_json::Value::String(session_id.to_string()));
        let metadata = serde_json::to_string(&metadata)?;
        let now = now_timestamp();

        let mut written = 0;
        for (prompt, completion) in prompts.iter().zip(completions.iter()) {
            tx.execute(
                "INSERT INTO training_data (prompt, completion, source, quality_score, created_at, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![prompt, completion, source, quality_score, now, metadata],
            )?;
            written += 1;
        }
        tx.commit()?;

        debug!("Paired {} user / {} assistant messages", prompts.len(), completions.len());
        info!("Exported {} training records from session {}", written, session_id);
        Ok(written)
    }
}

fn validate_quality(quality_score: Option<u8>) -> anyhow::Result<()> {
    match quality_score {
        Some(q) if !(1..=10).contains(&q) => Err(GatewayError::validation(format!(
            "quality_score must be between 1 and 10, got {}",
            q
        ))
        .into()),
        _ => Ok(()),
    }
}

fn row_to_record(row: &Row) -> anyhow::Result<TrainingRecord> {
    Ok(TrainingRecord {
        id: row.get(0)?,
        prompt: row.get(1)?,
        completion: row.get(2)?,
        source: row.get(3)?,
        quality_score: row.get(4)?,
        created_at: parse_timestamp(&row.get::<_, String>(5)?),
        used: row.get(6)?,
        metadata: parse_metadata(&row.get::<_, String>(7)?),
    })
}
