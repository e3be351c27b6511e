//! Feature toggles consulted by the turn pipeline
use crate::memory_db::schema::*;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

pub const MAX_CONTEXT_MESSAGES: &str = "max_context_messages";
pub const MEMORY_ENABLED: &str = "memory_enabled";
pub const AUTO_SAVE_FOR_TRAINING: &str = "auto_save_for_training";
pub const QUALITY_THRESHOLD: &str = "quality_threshold";
pub const USER_MEMORY_ENABLED: &str = "user_memory_enabled";

/// Typed view over the well-known settings keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemorySettings {
    pub memory_enabled: bool,
    pub max_context_messages: usize,
    pub auto_save_for_training: bool,
    pub quality_threshold: u8,
    pub user_memory_enabled: bool,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            memory_enabled: true,
            max_context_messages: 20,
            auto_save_for_training: true,
            quality_threshold: 7,
            user_memory_enabled: true,
        }
    }
}

pub struct SettingsStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl SettingsStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> anyhow::Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(|e| anyhow::anyhow!("Failed to get connection from pool: {}", e))
    }

    /// Raw value, or None. Defaults for missing keys are the caller's business.
    pub fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let conn = self.get_conn()?;
        let value = conn
            .query_row(
                "SELECT setting_value FROM memory_settings WHERE setting_key = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn get_setting(&self, key: &str) -> anyhow::Result<Option<Setting>> {
        let conn = self.get_conn()?;
        let setting = conn
            .query_row(
                "SELECT setting_key, setting_value, updated_at, description
                 FROM memory_settings WHERE setting_key = ?1",
                [key],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                    ))
                },
            )
            .optional()?;
        Ok(setting.map(|(key, value, updated_at, description)| Setting {
            key,
            value,
            updated_at: parse_timestamp(&updated_at),
            description,
        }))
    }

    /// Upsert. A `None` description keeps whatever was stored before.
    pub fn set(&self, key: &str, value: &str, description: Option<&str>) -> anyhow::Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO memory_settings (setting_key, setting_value, updated_at, description)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(setting_key) DO UPDATE SET
                setting_value = excluded.setting_value,
                updated_at = excluded.updated_at,
                description = COALESCE(excluded.description, memory_settings.description)",
            params![key, value, now_timestamp(), description],
        )?;
        debug!("Setting {} = {}", key, value);
        Ok(())
    }

    pub fn list_all(&self) -> anyhow::Result<BTreeMap<String, String>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare("SELECT setting_key, setting_value FROM memory_settings")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
        let mut settings = BTreeMap::new();
        for row in rows {
            let (key, value) = row?;
            settings.insert(key, value);
        }
        Ok(settings)
    }

    /// Resolve the well-known keys in one read, falling back per key.
    pub fn memory_settings(&self) -> anyhow::Result<MemorySettings> {
        let all = self.list_all()?;
        let defaults = MemorySettings::default();
        Ok(MemorySettings {
            memory_enabled: lookup(&all, MEMORY_ENABLED, parse_bool, defaults.memory_enabled),
            max_context_messages: lookup(&all, MAX_CONTEXT_MESSAGES, |v| v.parse().ok(), defaults.max_context_messages),
            auto_save_for_training: lookup(&all, AUTO_SAVE_FOR_TRAINING, parse_bool, defaults.auto_save_for_training),
            quality_threshold: lookup(&all, QUALITY_THRESHOLD, |v| v.parse().ok(), defaults.quality_threshold),
            user_memory_enabled: lookup(&all, USER_MEMORY_ENABLED, parse_bool, defaults.user_memory_enabled),
        })
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn lookup<T>(all: &BTreeMap<String, String>, key: &str, parse: impl Fn(&str) -> Option<T>, fallback: T) -> T {
    match all.get(key) {
        None => fallback,
        Some(raw) => parse(raw.trim()).unwrap_or_else(|| {
            warn!("Setting {} has unusable value '{}', using default", key, raw);
            fallback
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_db::MemoryDatabase;

    #[test]
    fn test_seeded_defaults() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let all = db.settings.list_all().unwrap();
        assert_eq!(all.get(MAX_CONTEXT_MESSAGES).map(String::as_str), Some("20"));
        assert_eq!(all.get(QUALITY_THRESHOLD).map(String::as_str), Some("7"));
        assert_eq!(db.settings.memory_settings().unwrap(), MemorySettings::default());
    }

    #[test]
    fn test_unknown_key_has_no_value() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        assert_eq!(db.settings.get("no_such_key").unwrap(), None);
    }

    #[test]
    fn test_set_preserves_description_when_absent() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        db.settings.set("custom", "1", Some("a custom flag")).unwrap();
        db.settings.set("custom", "2", None).unwrap();

        let setting = db.settings.get_setting("custom").unwrap().unwrap();
        assert_eq!(setting.value, "2");
        assert_eq!(setting.description.as_deref(), Some("a custom flag"));
    }

    #[test]
    fn test_memory_settings_fallbacks() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        db.settings.set(MEMORY_ENABLED, "false", None).unwrap();
        db.settings.set(MAX_CONTEXT_MESSAGES, "lots", None).unwrap();

        let settings = db.settings.memory_settings().unwrap();
        assert!(!settings.memory_enabled);
        assert_eq!(settings.max_context_messages, 20);
    }
}
