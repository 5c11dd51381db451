//! Keys offered during SSH authentication, by connection session id.
//!
//! The transport accepts any public key and records it here; whether the key
//! gets anywhere is decided later by the `signin` exec command.

use ssh_key::PublicKey;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::broker::MAX_TTL;
use crate::identity::fingerprint;

/// Opaque per-connection session identifier.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SessionId(Vec<u8>);

impl SessionId {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Short hex prefix for logs.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8.min(self.0.len())])
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.short())
    }
}

struct SessionEntry {
    key: PublicKey,
    deadline: Instant,
    evictor: AbortHandle,
}

/// Expiring map of session id to authenticated public key.
pub struct SessionRegistry {
    entries: Arc<RwLock<HashMap<SessionId, SessionEntry>>>,
    ttl: Duration,
}

impl SessionRegistry {
    /// TTLs above [`MAX_TTL`] are clamped.
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            ttl: ttl.min(MAX_TTL),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Record the key that authenticated `session_id`.
    ///
    /// Overwrites any previous record for the same id and restarts its timer.
    pub async fn record(&self, session_id: SessionId, key: PublicKey) {
        let deadline = Instant::now() + self.ttl;
        debug!(session = %session_id.short(), fingerprint = %fingerprint(&key), "public key recorded");

        let mut entries = self.entries.write().await;
        let evictor = {
            let entries = self.entries.clone();
            let id = session_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep_until(deadline).await;
                let mut entries = entries.write().await;
                // A newer record for the same id carries a later deadline.
                if entries.get(&id).is_some_and(|e| e.deadline <= deadline) {
                    entries.remove(&id);
                    debug!(session = %id.short(), "session expired");
                }
            })
            .abort_handle()
        };
        let previous = entries.insert(
            session_id,
            SessionEntry {
                key,
                deadline,
                evictor,
            },
        );
        if let Some(previous) = previous {
            previous.evictor.abort();
        }
    }

    /// The key recorded for `session_id`, if any and not expired.
    pub async fn lookup(&self, session_id: &SessionId) -> Option<PublicKey> {
        self.lookup_at(session_id, Instant::now()).await
    }

    pub(crate) async fn lookup_at(&self, session_id: &SessionId, now: Instant) -> Option<PublicKey> {
        let entries = self.entries.read().await;
        entries
            .get(session_id)
            .filter(|e| now < e.deadline)
            .map(|e| e.key.clone())
    }

    /// Drop the record for `session_id` if present. Idempotent.
    pub async fn evict(&self, session_id: &SessionId) {
        if let Some(entry) = self.entries.write().await.remove(session_id) {
            entry.evictor.abort();
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
