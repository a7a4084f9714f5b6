use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

/// A successfully linked account, handed to whatever keeps connection records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub item_id: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub connected_at: DateTime<Utc>,
    /// Vendor success payload, untouched.
    pub payload: serde_json::Value,
}

#[async_trait]
pub trait ConnectionSink: Send + Sync {
    async fn record_connection(&self, record: ConnectionRecord);
}

/// Sink that only emits the record through tracing.
#[derive(Clone, Default)]
pub struct TracingConnectionSink;

#[async_trait]
impl ConnectionSink for TracingConnectionSink {
    async fn record_connection(&self, record: ConnectionRecord) {
        info!(
            target: "financefly.connections",
            item_id = %record.item_id,
            email = ?record.email,
            connected_at = %record.connected_at.to_rfc3339(),
            payload = %record.payload,
            "account connected"
        );
    }
}

/// Keeps records in memory.
#[cfg(test)]
#[derive(Default)]
pub struct MemoryConnectionSink {
    records: std::sync::Mutex<Vec<ConnectionRecord>>,
}

#[cfg(test)]
impl MemoryConnectionSink {
    pub fn records(&self) -> Vec<ConnectionRecord> {
        self.records
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
#[async_trait]
impl ConnectionSink for MemoryConnectionSink {
    async fn record_connection(&self, record: ConnectionRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.push(record);
        }
    }
}
