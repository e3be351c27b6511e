//! User-declared key/value facts
use crate::memory_db::schema::*;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Row};
use std::sync::Arc;
use tracing::{debug, info};

const MEMORY_COLUMNS: &str = "id, key, value, created_at, updated_at, source_session_id";

pub struct UserMemoryStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl UserMemoryStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> anyhow::Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(|e| anyhow::anyhow!("Failed to get connection from pool: {}", e))
    }

    /// Upsert by exact key. The id and created_at of an existing entry are kept.
    pub fn store(&self, key: &str, value: &str, source_session_id: Option<&str>) -> anyhow::Result<i64> {
        let conn = self.get_conn()?;
        let now = now_timestamp();
        let id: i64 = conn.query_row(
            "INSERT INTO user_memories (key, value, created_at, updated_at, source_session_id)
             VALUES (?1, ?2, ?3, ?3, ?4)
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at,
                source_session_id = excluded.source_session_id
             RETURNING id",
            params![key, value, now, source_session_id],
            |row| row.get(0),
        )?;
        debug!("Stored user memory '{}' (id {})", key, id);
        Ok(id)
    }

    pub fn get(&self, key: &str) -> anyhow::Result<Option<UserMemory>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!("SELECT {} FROM user_memories WHERE key = ?1", MEMORY_COLUMNS))?;
        let mut rows = stmt.query([key])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_memory(row)?)),
            None => Ok(None),
        }
    }

    /// Most recently updated first.
    pub fn list_all(&self) -> anyhow::Result<Vec<UserMemory>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM user_memories ORDER BY updated_at DESC, id DESC",
            MEMORY_COLUMNS
        ))?;
        let mut rows = stmt.query([])?;
        let mut memories = Vec::new();
        while let Some(row) = rows.next()? {
            memories.push(row_to_memory(row)?);
        }
        Ok(memories)
    }

    pub fn delete(&self, key: &str) -> anyhow::Result<bool> {
        let conn = self.get_conn()?;
        let deleted = conn.execute("DELETE FROM user_memories WHERE key = ?1", [key])?;
        Ok(deleted > 0)
    }

    pub fn delete_all(&self) -> anyhow::Result<usize> {
        let conn = self.get_conn()?;
        let deleted = conn.execute("DELETE FROM user_memories", [])?;
        info!("Deleted {} user memories", deleted);
        Ok(deleted)
    }
}

fn row_to_memory(row: &Row) -> anyhow::Result<UserMemory> {
    Ok(UserMemory {
        id: row.get(0)?,
        key: row.get(1)?,
        value: row.get(2)?,
        created_at: parse_timestamp(&row.get::<_, String>(3)?),
        updated_at: parse_timestamp(&row.get::<_, String>(4)?),
        source_session_id: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use crate::memory_db::MemoryDatabase;
    use std::time::Duration;

    #[test]
    fn test_upsert_keeps_id_and_created_at() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let first_id = db.memories.store("好きな色", "青", Some("s1")).unwrap();
        let first = db.memories.get("好きな色").unwrap().unwrap();

        std::thread::sleep(Duration::from_millis(2));
        let second_id = db.memories.store("好きな色", "赤", None).unwrap();
        let second = db.memories.get("好きな色").unwrap().unwrap();

        assert_eq!(first_id, second_id);
        assert_eq!(second.value, "赤");
        assert_eq!(second.created_at, first.created_at);
        assert!(second.updated_at > first.updated_at);
        assert_eq!(second.source_session_id, None);
    }

    #[test]
    fn test_keys_are_case_sensitive() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        db.memories.store("Key", "upper", None).unwrap();
        db.memories.store("key", "lower", None).unwrap();
        assert_eq!(db.memories.list_all().unwrap().len(), 2);
        assert_eq!(db.memories.get("Key").unwrap().unwrap().value, "upper");
    }

    #[test]
    fn test_list_delete_and_clear() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        db.memories.store("a", "1", None).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        db.memories.store("b", "2", None).unwrap();

        let keys: Vec<String> = db.memories.list_all().unwrap().into_iter().map(|m| m.key).collect();
        assert_eq!(keys, vec!["b", "a"]);

        assert!(db.memories.delete("a").unwrap());
        assert!(!db.memories.delete("a").unwrap());
        assert_eq!(db.memories.delete_all().unwrap(), 1);
        assert!(db.memories.list_all().unwrap().is_empty());
    }
}
