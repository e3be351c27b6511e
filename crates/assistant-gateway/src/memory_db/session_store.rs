//! Session and message persistence
use crate::error::GatewayError;
use crate::memory::Role;
use crate::memory_db::schema::*;
use chrono::Local;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, ErrorCode, OptionalExtension, Row, TransactionBehavior};
use std::sync::Arc;
use tracing::{debug, info};

const SESSION_COLUMNS: &str = "id, session_id, title, created_at, updated_at, metadata";
const MESSAGE_COLUMNS: &str = "id, session_id, role, content, created_at, metadata";

pub struct SessionStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl SessionStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> anyhow::Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(|e| anyhow::anyhow!("Failed to get connection from pool: {}", e))
    }

    /// Title given to sessions created without one.
    pub fn default_title() -> String {
        format!("会話 {}", Local::now().format("%Y-%m-%d %H:%M"))
    }

    /// Insert a new session. Fails with `GatewayError::SessionExists` when the id is taken.
    pub fn create(
        &self,
        session_id: &str,
        title: Option<&str>,
        metadata: Option<&Metadata>,
    ) -> anyhow::Result<i64> {
        let title = title.map(str::to_string).unwrap_or_else(Self::default_title);
        let now = now_timestamp();
        let conn = self.get_conn()?;

        let inserted = conn.execute(
            "INSERT INTO sessions (session_id, title, created_at, updated_at, metadata)
             VALUES (?1, ?2, ?3, ?3, ?4)",
            params![session_id, title, now, metadata_json(metadata)?],
        );

        match inserted {
            Ok(_) => {
                info!("Created session with ID: {}", session_id);
                Ok(conn.last_insert_rowid())
            }
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                Err(GatewayError::SessionExists(session_id.to_string()).into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Atomic insert-if-absent. Returns true when this call created the row.
    pub fn ensure_session(&self, session_id: &str) -> anyhow::Result<bool> {
        let conn = self.get_conn()?;
        let now = now_timestamp();
        let created = conn.execute(
            "INSERT OR IGNORE INTO sessions (session_id, title, created_at, updated_at, metadata)
             VALUES (?1, ?2, ?3, ?3, '{}')",
            params![session_id, Self::default_title(), now],
        )?;
        if created > 0 {
            debug!("Auto-created session {}", session_id);
        }
        Ok(created > 0)
    }

    /// Update title and/or metadata. Returns whether the session exists.
    pub fn update(
        &self,
        session_id: &str,
        title: Option<&str>,
        metadata: Option<&Metadata>,
    ) -> anyhow::Result<bool> {
        let conn = self.get_conn()?;
        if title.is_none() && metadata.is_none() {
            let exists = conn
                .query_row("SELECT 1 FROM sessions WHERE session_id = ?1", [session_id], |_| Ok(()))
                .optional()?;
            return Ok(exists.is_some());
        }

        let metadata = metadata.map(|m| serde_json::to_string(m)).transpose()?;
        let updated = conn.execute(
            "UPDATE sessions SET
                title = COALESCE(?1, title),
                metadata = COALESCE(?2, metadata),
                updated_at = ?3
             WHERE session_id = ?4",
            params![title, metadata, now_timestamp(), session_id],
        )?;
        Ok(updated > 0)
    }

    pub fn get(&self, session_id: &str) -> anyhow::Result<Option<Session>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM sessions WHERE session_id = ?1",
            SESSION_COLUMNS
        ))?;
        let mut rows = stmt.query([session_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_session(row)?)),
            None => Ok(None),
        }
    }

    /// Most recently active first.
    pub fn list(&self, limit: usize, offset: usize) -> anyhow::Result<Vec<Session>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM sessions ORDER BY updated_at DESC, id DESC LIMIT ?1 OFFSET ?2",
            SESSION_COLUMNS
        ))?;
        let mut rows = stmt.query(params![limit as i64, offset as i64])?;
        let mut sessions = Vec::new();
        while let Some(row) = rows.next()? {
            sessions.push(row_to_session(row)?);
        }
        Ok(sessions)
    }

    /// Delete a session together with its messages.
    pub fn delete(&self, session_id: &str) -> anyhow::Result<bool> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute("DELETE FROM messages WHERE session_id = ?1", [session_id])?;
        let deleted = tx.execute("DELETE FROM sessions WHERE session_id = ?1", [session_id])?;
        tx.commit()?;
        if deleted > 0 {
            info!("Deleted session {}", session_id);
        }
        Ok(deleted > 0)
    }

    /// Append a message, creating the session on first reference and bumping its updated_at.
    pub fn append_message(
        &self,
        session_id: &str,
        role: Role,
        content: &str,
        metadata: Option<&Metadata>,
    ) -> anyhow::Result<i64> {
        if content.is_empty() {
            return Err(anyhow::anyhow!("Refusing to store empty {} message", role));
        }
        let metadata = metadata_json(metadata)?;
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = now_timestamp();

        tx.execute(
            "INSERT OR IGNORE INTO sessions (session_id, title, created_at, updated_at, metadata)
             VALUES (?1, ?2, ?3, ?3, '{}')",
            params![session_id, Self::default_title(), now],
        )?;
        tx.execute(
            "INSERT INTO messages (session_id, role, content, created_at, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![session_id, role.as_str(), content, now, metadata],
        )?;
        let message_id = tx.last_insert_rowid();
        tx.execute(
            "UPDATE sessions SET updated_at = ?1 WHERE session_id = ?2",
            params![now, session_id],
        )?;
        tx.commit()?;

        debug!("Stored {} message {} in session {}", role, message_id, session_id);
        Ok(message_id)
    }

    /// Messages in insertion order. With a limit, only the most recent `limit` are kept.
    pub fn get_messages(&self, session_id: &str, limit: Option<usize>) -> anyhow::Result<Vec<StoredMessage>> {
        let conn = self.get_conn()?;
        let mut messages = Vec::new();
        match limit {
            Some(limit) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM messages WHERE session_id = ?1 ORDER BY id DESC LIMIT ?2",
                    MESSAGE_COLUMNS
                ))?;
                let mut rows = stmt.query(params![session_id, limit as i64])?;
                while let Some(row) = rows.next()? {
                    messages.push(row_to_stored_message(row)?);
                }
                messages.reverse();
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM messages WHERE session_id = ?1 ORDER BY id ASC",
                    MESSAGE_COLUMNS
                ))?;
                let mut rows = stmt.query([session_id])?;
                while let Some(row) = rows.next()? {
                    messages.push(row_to_stored_message(row)?);
                }
            }
        }
        Ok(messages)
    }

    /// Remove every message but keep the session row.
    pub fn delete_messages(&self, session_id: &str) -> anyhow::Result<usize> {
        let conn = self.get_conn()?;
        let deleted = conn.execute("DELETE FROM messages WHERE session_id = ?1", [session_id])?;
        info!("Deleted {} messages from session {}", deleted, session_id);
        Ok(deleted)
    }

    pub fn message_count(&self, session_id: &str) -> anyhow::Result<usize> {
        let conn = self.get_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE session_id = ?1",
            [session_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

fn row_to_session(row: &Row) -> anyhow::Result<Session> {
    Ok(Session {
        row_id: row.get(0)?,
        id: row.get(1)?,
        title: row.get(2)?,
        created_at: parse_timestamp(&row.get::<_, String>(3)?),
        updated_at: parse_timestamp(&row.get::<_, String>(4)?),
        metadata: parse_metadata(&row.get::<_, String>(5)?),
    })
}

fn row_to_stored_message(row: &Row) -> anyhow::Result<StoredMessage> {
    let role: String = row.get(2)?;
    Ok(StoredMessage {
        id: row.get(0)?,
        session_id: row.get(1)?,
        role: role.parse()?,
        content: row.get(3)?,
        created_at: parse_timestamp(&row.get::<_, String>(4)?),
        metadata: parse_metadata(&row.get::<_, String>(5)?),
    })
}

#[cfg(test)]
mod tests {
    use crate::error::GatewayError;
    use crate::memory::Role;
    use crate::memory_db::MemoryDatabase;
    use std::sync::Arc;

    // ===== Session CRUD =====

    #[test]
    fn test_create_and_get_session() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let mut meta = super::Metadata::new();
        meta.insert("source".into(), serde_json::json!("cli"));

        let row_id = db.sessions.create("s1", Some("Planning"), Some(&meta)).unwrap();
        assert!(row_id > 0);

        let session = db.sessions.get("s1").unwrap().unwrap();
        assert_eq!(session.title, "Planning");
        assert_eq!(session.metadata.get("source"), Some(&serde_json::json!("cli")));
        assert!(db.sessions.get("missing").unwrap().is_none());
    }

    #[test]
    fn test_duplicate_create_reports_session_exists() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        db.sessions.create("dup", None, None).unwrap();
        let err = db.sessions.create("dup", None, None).unwrap_err();
        assert!(GatewayError::is_session_exists(&err));
    }

    #[test]
    fn test_default_title_prefix() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        db.sessions.create("t", None, None).unwrap();
        assert!(db.sessions.get("t").unwrap().unwrap().title.starts_with("会話 "));
    }

    #[test]
    fn test_update_session() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        db.sessions.create("u", Some("old"), None).unwrap();

        assert!(db.sessions.update("u", Some("new"), None).unwrap());
        assert_eq!(db.sessions.get("u").unwrap().unwrap().title, "new");
        assert!(db.sessions.update("u", None, None).unwrap());
        assert!(!db.sessions.update("nope", Some("x"), None).unwrap());
    }

    #[test]
    fn test_list_most_recent_first() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        db.sessions.create("a", None, None).unwrap();
        db.sessions.create("b", None, None).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        db.sessions.append_message("a", Role::User, "bump", None).unwrap();

        let ids: Vec<String> = db.sessions.list(10, 0).unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(db.sessions.list(1, 1).unwrap()[0].id, "b");
    }

    #[test]
    fn test_delete_cascades_messages() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        db.sessions.append_message("gone", Role::User, "hello", None).unwrap();
        assert!(db.sessions.delete("gone").unwrap());
        assert!(!db.sessions.delete("gone").unwrap());
        assert_eq!(db.sessions.message_count("gone").unwrap(), 0);
    }

    // ===== Messages =====

    #[test]
    fn test_append_preserves_insertion_order() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        for i in 0..6 {
            let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
            db.sessions.append_message("order", role, &format!("m{}", i), None).unwrap();
        }

        let all = db.sessions.get_messages("order", None).unwrap();
        let contents: Vec<&str> = all.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m0", "m1", "m2", "m3", "m4", "m5"]);
        assert_eq!(db.sessions.message_count("order").unwrap(), 6);

        let tail = db.sessions.get_messages("order", Some(2)).unwrap();
        let contents: Vec<&str> = tail.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m4", "m5"]);
    }

    #[test]
    fn test_append_auto_creates_session() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        assert!(db.sessions.get("fresh").unwrap().is_none());
        db.sessions.append_message("fresh", Role::User, "hi", None).unwrap();
        assert!(db.sessions.get("fresh").unwrap().is_some());
    }

    #[test]
    fn test_append_rejects_empty_content() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        assert!(db.sessions.append_message("e", Role::User, "", None).is_err());
    }

    #[test]
    fn test_delete_messages_keeps_session() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        db.sessions.append_message("keep", Role::User, "one", None).unwrap();
        db.sessions.append_message("keep", Role::Assistant, "two", None).unwrap();

        assert_eq!(db.sessions.delete_messages("keep").unwrap(), 2);
        assert!(db.sessions.get_messages("keep", None).unwrap().is_empty());
        assert!(db.sessions.get("keep").unwrap().is_some());
    }

    // ===== Concurrency =====

    #[test]
    fn test_concurrent_session_creation_single_row() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(MemoryDatabase::new(&dir.path().join("race.db")).unwrap());

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let db = Arc::clone(&db);
                std::thread::spawn(move || db.sessions.ensure_session("racy").unwrap())
            })
            .collect();
        let created: Vec<bool> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(created.iter().filter(|c| **c).count(), 1);
        assert_eq!(db.get_stats().unwrap().total_sessions, 1);
    }
}
