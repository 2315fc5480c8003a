use crate::models::ProviderName;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// One append-only search history row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    /// Monotonic id assigned on append.
    #[serde(default)]
    pub id: u64,
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub result_count: u32,
    pub duration_ms: u64,
    pub providers: Vec<ProviderName>,
    /// Structured filters serialized as JSON text.
    pub filters_json: String,
    pub requested_at: DateTime<Utc>,
}

/// Append-only search history on sled. Writes are best-effort; the caller
/// never blocks a user response on them.
pub struct SearchHistory {
    db: sled::Db,
    tree: sled::Tree,
}

impl SearchHistory {
    #[must_use]
    pub fn new(db: sled::Db, tree: sled::Tree) -> Self {
        Self { db, tree }
    }

    /// Append a record, returning its assigned id.
    pub fn append(&self, mut record: HistoryRecord) -> Result<u64> {
        let id = self.db.generate_id()?;
        record.id = id;
        let value =
            bincode::serialize(&record).map_err(|e| Error::other(format!("history encode: {e}")))?;
        self.tree.insert(id.to_be_bytes(), value)?;
        Ok(id)
    }

    /// Most recent `n` records, newest first.
    pub fn recent(&self, n: usize) -> Result<Vec<HistoryRecord>> {
        let mut records = Vec::with_capacity(n);
        for item in self.tree.iter().rev().take(n) {
            let (_, value) = item?;
            match bincode::deserialize::<HistoryRecord>(&value) {
                Ok(record) => records.push(record),
                Err(err) => warn!(%err, "skipping undecodable history row"),
            }
        }
        Ok(records)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}
