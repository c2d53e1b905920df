//! Recoverable call record storage.
//!
//! A minimal record of the in-progress outgoing call is persisted so the
//! call can be recovered after a process reload. Persistence is best-effort:
//! store failures are logged by the session and never affect call
//! correctness. The record is cleared on every terminal transition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::types::call::{CallId, CallMediaType, PeerIdentity};

/// Minimal metadata of an in-progress outgoing call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingCallRecord {
    pub call_id: CallId,
    pub conversation_id: String,
    pub peer: PeerIdentity,
    pub media_type: CallMediaType,
    pub started_at: DateTime<Utc>,
}

/// Storage backend for the pending-call record.
#[async_trait]
pub trait CallStore: Send + Sync {
    async fn save_pending(&self, record: &PendingCallRecord) -> Result<(), anyhow::Error>;

    /// Read back the record left by a previous process, if any.
    async fn load_pending(&self) -> Result<Option<PendingCallRecord>, anyhow::Error>;

    async fn clear_pending(&self) -> Result<(), anyhow::Error>;
}

/// In-memory store, also the test double. Real deployments back this with
/// the application's database.
#[derive(Default)]
pub struct MemoryCallStore {
    slot: Mutex<Option<PendingCallRecord>>,
}

#[async_trait]
impl CallStore for MemoryCallStore {
    async fn save_pending(&self, record: &PendingCallRecord) -> Result<(), anyhow::Error> {
        *self.slot.lock().await = Some(record.clone());
        Ok(())
    }

    async fn load_pending(&self) -> Result<Option<PendingCallRecord>, anyhow::Error> {
        Ok(self.slot.lock().await.clone())
    }

    async fn clear_pending(&self) -> Result<(), anyhow::Error> {
        *self.slot.lock().await = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_lifecycle() {
        let store = MemoryCallStore::default();
        assert_eq!(store.load_pending().await.unwrap(), None);

        let record = PendingCallRecord {
            call_id: CallId::generate(),
            conversation_id: "conv-1".to_string(),
            peer: PeerIdentity::new("did:key:z6MkBob"),
            media_type: CallMediaType::Voice,
            started_at: Utc::now(),
        };
        store.save_pending(&record).await.unwrap();
        assert_eq!(store.load_pending().await.unwrap(), Some(record));

        store.clear_pending().await.unwrap();
        assert_eq!(store.load_pending().await.unwrap(), None);
    }
}
