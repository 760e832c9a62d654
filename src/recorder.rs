//! Action Recorder (C2): an append-only, time-bounded, in-memory log of
//! executed actions keyed by policy. Supports rate-limit counts (C3) and
//! rollback (C5), using the same `Arc<RwLock<HashMap<..>>>` per-key service
//! shape as the circuit breaker registry below.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::errors::RecorderError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionRecord {
    pub action_name: String,
    pub policy_key: String,
    pub action_type: String,
    pub target_key: String,
    pub success: bool,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
    pub approver: Option<String>,
    pub dry_run: bool,
}

#[derive(Clone)]
struct Entry {
    record: ActionRecord,
    original_state: String,
}

/// Thread-safe, per-policy-ordered history with periodic retention cleanup.
pub struct ActionRecorder {
    retention: chrono::Duration,
    entries: Arc<RwLock<HashMap<String, Vec<Entry>>>>,
}

impl ActionRecorder {
    pub fn new(retention: chrono::Duration) -> Self {
        Self {
            retention,
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Append a record. `original_state` is an opaque serialized form
    /// sufficient to re-create the target bit-for-bit (R1: immutable post-insert).
    pub async fn record(&self, record: ActionRecord, original_state: String) {
        let mut entries = self.entries.write().await;
        let bucket = entries.entry(record.policy_key.clone()).or_default();
        bucket.push(Entry { record, original_state });
        bucket.sort_by_key(|e| e.record.timestamp);
    }

    /// Count of records for `policy_key` recorded since `since`.
    pub async fn count(&self, policy_key: &str, since: DateTime<Utc>) -> usize {
        let entries = self.entries.read().await;
        entries
            .get(policy_key)
            .map(|bucket| bucket.iter().filter(|e| e.record.timestamp >= since).count())
            .unwrap_or(0)
    }

    /// Newest-first, up to `limit` records for `policy_key`.
    pub async fn recent(&self, policy_key: &str, limit: usize) -> Vec<ActionRecord> {
        let entries = self.entries.read().await;
        let mut records: Vec<ActionRecord> = entries
            .get(policy_key)
            .map(|bucket| bucket.iter().map(|e| e.record.clone()).collect())
            .unwrap_or_default();
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        records.truncate(limit);
        records
    }

    pub async fn last(&self, policy_key: &str) -> Option<ActionRecord> {
        self.recent(policy_key, 1).await.into_iter().next()
    }

    /// Look up the record and original state for `action_name`, used by
    /// the Remediation Engine's rollback. Fails with `Stale` if the record
    /// has aged out of the retention horizon.
    pub async fn history(&self, action_name: &str) -> Result<Option<(ActionRecord, String)>, RecorderError> {
        let entries = self.entries.read().await;
        let found = entries
            .values()
            .flatten()
            .find(|e| e.record.action_name == action_name);

        let Some(entry) = found else {
            return Ok(None);
        };

        let cutoff = Utc::now() - self.retention;
        if entry.record.timestamp < cutoff {
            return Err(RecorderError::Stale(action_name.to_string()));
        }

        Ok(Some((entry.record.clone(), entry.original_state.clone())))
    }

    /// R2: periodic purge of records older than the retention horizon,
    /// deleting policy keys that become empty.
    pub async fn purge_expired(&self) {
        let cutoff = Utc::now() - self.retention;
        let mut entries = self.entries.write().await;
        entries.retain(|_policy_key, bucket| {
            bucket.retain(|e| e.record.timestamp >= cutoff);
            !bucket.is_empty()
        });
    }
}
