//! Record types for the gateway database
use crate::memory::Role;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Open key/value map stored as JSON text.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub row_id: i64,
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: i64,
    pub session_id: String,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingRecord {
    pub id: i64,
    pub prompt: String,
    pub completion: String,
    pub source: Option<String>,
    pub quality_score: Option<u8>,
    pub created_at: DateTime<Utc>,
    pub used: bool,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserMemory {
    pub id: i64,
    pub key: String,
    pub value: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub source_session_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Setting {
    pub key: String,
    pub value: String,
    pub updated_at: DateTime<Utc>,
    pub description: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DatabaseStats {
    pub total_sessions: i64,
    pub total_messages: i64,
    pub total_training_records: i64,
    pub total_user_memories: i64,
    pub total_settings: i64,
    pub database_size_bytes: i64,
}

/// Fixed-width UTC timestamp, so text order equals time order.
pub(crate) fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f") {
        return DateTime::from_naive_utc_and_offset(dt, Utc);
    }
    warn!("Unparseable timestamp '{}', substituting now", raw);
    Utc::now()
}

pub(crate) fn parse_metadata(raw: &str) -> Metadata {
    serde_json::from_str(raw).unwrap_or_else(|e| {
        warn!("Discarding malformed metadata JSON: {}", e);
        Metadata::new()
    })
}

pub(crate) fn metadata_json(metadata: Option<&Metadata>) -> anyhow::Result<String> {
    match metadata {
        Some(m) => Ok(serde_json::to_string(m)?),
        None => Ok("{}".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamps_sort_lexically() {
        let a = now_timestamp();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = now_timestamp();
        assert_eq!(a.len(), b.len());
        assert!(a < b);
        assert!(parse_timestamp(&a) < parse_timestamp(&b));
    }

    #[test]
    fn test_parse_sqlite_default_format() {
        let dt = parse_timestamp("2024-03-01 10:20:30");
        assert_eq!(dt.to_rfc3339_opts(SecondsFormat::Secs, true), "2024-03-01T10:20:30Z");
    }

    #[test]
    fn test_malformed_metadata_is_empty() {
        assert!(parse_metadata("not json").is_empty());
        assert_eq!(parse_metadata(r#"{"a":1}"#).get("a"), Some(&serde_json::json!(1)));
    }
}
