//! Pending sign-in challenges.
//!
//! Each challenge maps an id to the one-shot channel its issuer is waiting on.
//! An entry leaves the registry exactly once: either redeemed by a signed-in
//! SSH client or evicted by its expiry timer.

use crate::broker::MAX_TTL;
use crate::error::{LoginError, LoginResult};
use crate::identity::fingerprint;
use ssh_key::PublicKey;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{oneshot, RwLock};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info};

/// Returned to the issuer of a challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IssuedChallenge {
    pub id: u64,
    pub expires_at: SystemTime,
}

/// A challenge removed from the registry by [`ChallengeRegistry::redeem`].
#[derive(Debug)]
pub struct Challenge {
    pub id: u64,
    pub expires_at: SystemTime,
    result: oneshot::Sender<PublicKey>,
}

impl Challenge {
    /// Hand the authenticated key to the waiting issuer.
    ///
    /// Never blocks; fails if the issuer has stopped waiting.
    pub fn deliver(self, key: PublicKey) -> LoginResult<()> {
        let fp = fingerprint(&key);
        self.result.send(key).map_err(|_| LoginError::Abandoned)?;
        info!(challenge_id = self.id, fingerprint = %fp, "challenge completed");
        Ok(())
    }
}

struct Entry {
    result: oneshot::Sender<PublicKey>,
    deadline: Instant,
    expires_at: SystemTime,
    evictor: AbortHandle,
}

/// Expiring map of challenge id to result channel.
pub struct ChallengeRegistry {
    entries: Arc<RwLock<HashMap<u64, Entry>>>,
    /// Monotonic id counter.
    next_id: AtomicU64,
    ttl: Duration,
}

impl ChallengeRegistry {
    /// Create an empty registry whose challenges live for `ttl`, at most
    /// [`MAX_TTL`].
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            next_id: AtomicU64::new(0),
            ttl: ttl.min(MAX_TTL),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Register a new challenge delivering into `result`.
    ///
    /// Must be called from within a tokio runtime (schedules the eviction timer).
    pub async fn issue(&self, result: oneshot::Sender<PublicKey>) -> IssuedChallenge {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + self.ttl;
        let expires_at = SystemTime::now() + self.ttl;

        // Insert under the lock before the timer can run, so a zero TTL still
        // finds the entry to evict.
        let mut entries = self.entries.write().await;
        let evictor = {
            let entries = self.entries.clone();
            tokio::spawn(async move {
                tokio::time::sleep_until(deadline).await;
                if evict_entry(&entries, id).await {
                    debug!(challenge_id = id, "challenge expired");
                }
            })
            .abort_handle()
        };
        entries.insert(
            id,
            Entry {
                result,
                deadline,
                expires_at,
                evictor,
            },
        );
        drop(entries);

        debug!(challenge_id = id, ttl_ms = self.ttl.as_millis() as u64, "challenge issued");
        IssuedChallenge { id, expires_at }
    }

    /// Remove and return the challenge `id`.
    ///
    /// Fails with [`LoginError::NotFound`] if it never existed, was already
    /// redeemed, or has expired (evicted or not).
    pub async fn redeem(&self, id: u64) -> LoginResult<Challenge> {
        self.redeem_at(id, Instant::now()).await
    }

    pub(crate) async fn redeem_at(&self, id: u64, now: Instant) -> LoginResult<Challenge> {
        let entry = self
            .entries
            .write()
            .await
            .remove(&id)
            .ok_or(LoginError::NotFound)?;
        entry.evictor.abort();

        if now >= entry.deadline {
            debug!(challenge_id = id, "challenge past deadline at redemption");
            return Err(LoginError::NotFound);
        }

        Ok(Challenge {
            id,
            expires_at: entry.expires_at,
            result: entry.result,
        })
    }

    /// Drop challenge `id` if present. Idempotent.
    pub async fn evict(&self, id: u64) {
        if let Some(entry) = self.entries.write().await.remove(&id) {
            entry.evictor.abort();
        }
    }

    /// Number of challenges still held (including expired, not yet evicted).
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

async fn evict_entry(entries: &RwLock<HashMap<u64, Entry>>, id: u64) -> bool {
    entries.write().await.remove(&id).is_some()
}
