// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Idempotent request execution.
//!
//! A request carrying an idempotency key runs its operation once; the
//! successful response body is recorded and replayed to every later request
//! with the same key until the record expires. Failed operations are not
//! recorded, so a retry runs the operation again.
//!
//! While the first request for a key is still running, a concurrent duplicate
//! either waits for it and replays its response ([`DuplicatePolicy::Wait`],
//! the default) or runs the operation itself ([`DuplicatePolicy::Execute`]),
//! in which case the last successful response is the one recorded.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

/// Default retention of recorded responses.
pub const DEFAULT_IDEMPOTENCY_TTL: Duration = Duration::from_secs(3600);

/// Longest caller key stored verbatim; longer keys are stored by digest.
pub const MAX_KEY_LEN: usize = 128;

/// What a duplicate does while the first request is still running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DuplicatePolicy {
    /// Wait for the running request and replay its response.
    #[default]
    Wait,
    /// Run the operation again; the last success is recorded.
    Execute,
}

/// A response body and whether it was replayed from a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotentResponse {
    pub body: Bytes,
    pub replayed: bool,
}

impl IdempotentResponse {
    fn fresh(body: Bytes) -> Self {
        Self {
            body,
            replayed: false,
        }
    }

    fn replayed(body: Bytes) -> Self {
        Self {
            body,
            replayed: true,
        }
    }
}

enum Slot {
    InFlight {
        generation: u64,
        done: watch::Receiver<Option<Bytes>>,
    },
    Recorded {
        body: Bytes,
        expires_at: Instant,
    },
}

enum Action {
    Replay(Bytes),
    Wait(watch::Receiver<Option<Bytes>>),
    Execute {
        generation: u64,
        done: watch::Sender<Option<Bytes>>,
    },
    ExecuteUntracked,
}

/// Build the storage key for a caller-supplied idempotency key.
///
/// The key is trimmed; an empty key means the request is not idempotent.
/// Keys longer than [`MAX_KEY_LEN`] bytes are replaced by their digest, under
/// a `#` separator no verbatim key is stored with.
pub fn scoped_key(scope: &str, key: Option<&str>) -> Option<String> {
    let key = key.map(str::trim).filter(|k| !k.is_empty())?;
    if key.len() > MAX_KEY_LEN {
        return Some(format!("idempotency:{scope}#{}", fingerprint(key.as_bytes())));
    }
    Some(format!("idempotency:{scope}:{key}"))
}

/// Hex SHA-256 of `bytes`.
pub fn fingerprint(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Records and replays responses by idempotency key.
pub struct IdempotencyGuard {
    slots: DashMap<String, Slot>,
    ttl: Duration,
    policy: DuplicatePolicy,
    generation: AtomicU64,
}

impl Default for IdempotencyGuard {
    fn default() -> Self {
        Self::new(DEFAULT_IDEMPOTENCY_TTL)
    }
}

impl IdempotencyGuard {
    pub fn new(ttl: Duration) -> Self {
        Self {
            slots: DashMap::new(),
            ttl,
            policy: DuplicatePolicy::default(),
            generation: AtomicU64::new(1),
        }
    }

    pub fn with_policy(mut self, policy: DuplicatePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> DuplicatePolicy {
        self.policy
    }

    /// Run `op` at most once per live key.
    ///
    /// Without a key (or with a blank one) `op` always runs and nothing is
    /// recorded.
    pub async fn execute<F, Fut, E>(
        &self,
        key: Option<&str>,
        op: F,
    ) -> Result<IdempotentResponse, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Bytes, E>>,
    {
        let Some(key) = key.map(str::trim).filter(|k| !k.is_empty()) else {
            return op().await.map(IdempotentResponse::fresh);
        };

        loop {
            match self.claim(key) {
                Action::Replay(body) => {
                    debug!(key, "Replaying recorded response");
                    return Ok(IdempotentResponse::replayed(body));
                }
                Action::Wait(mut done) => {
                    debug!(key, "Waiting for in-flight request");
                    let outcome = done
                        .wait_for(Option::is_some)
                        .await
                        .ok()
                        .and_then(|body| body.clone());
                    if let Some(body) = outcome {
                        return Ok(IdempotentResponse::replayed(body));
                    }
                    // The first request failed or was cancelled; try again.
                }
                Action::Execute { generation, done } => {
                    let claim = InFlightClaim {
                        slots: &self.slots,
                        key,
                        generation,
                    };
                    let body = op().await?;
                    claim.record(body.clone(), self.ttl);
                    // Waiters may all be gone.
                    let _ = done.send(Some(body.clone()));
                    return Ok(IdempotentResponse::fresh(body));
                }
                Action::ExecuteUntracked => {
                    let body = op().await?;
                    self.slots.insert(
                        key.to_string(),
                        Slot::Recorded {
                            body: body.clone(),
                            expires_at: Instant::now() + self.ttl,
                        },
                    );
                    return Ok(IdempotentResponse::fresh(body));
                }
            }
        }
    }

    fn claim(&self, key: &str) -> Action {
        let now = Instant::now();
        match self.slots.entry(key.to_string()) {
            Entry::Occupied(mut slot) => {
                match slot.get() {
                    Slot::Recorded { body, expires_at } if *expires_at > now => {
                        return Action::Replay(body.clone());
                    }
                    Slot::InFlight { done, .. } => {
                        return match self.policy {
                            DuplicatePolicy::Wait => Action::Wait(done.clone()),
                            DuplicatePolicy::Execute => Action::ExecuteUntracked,
                        };
                    }
                    // Expired: claim it like a fresh key.
                    Slot::Recorded { .. } => {}
                }
                let (generation, done, action) = self.new_claim();
                slot.insert(Slot::InFlight { generation, done });
                action
            }
            Entry::Vacant(slot) => {
                let (generation, done, action) = self.new_claim();
                slot.insert(Slot::InFlight { generation, done });
                action
            }
        }
    }

    fn new_claim(&self) -> (u64, watch::Receiver<Option<Bytes>>, Action) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(None);
        (
            generation,
            rx,
            Action::Execute {
                generation,
                done: tx,
            },
        )
    }

    /// The recorded response for `key`, if live.
    pub fn recorded(&self, key: &str) -> Option<Bytes> {
        match self.slots.get(key.trim())?.value() {
            Slot::Recorded { body, expires_at } if *expires_at > Instant::now() => {
                Some(body.clone())
            }
            _ => None,
        }
    }

    /// Drop expired records. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.slots.len();
        self.slots.retain(|_, slot| match slot {
            Slot::Recorded { expires_at, .. } => *expires_at > now,
            Slot::InFlight { .. } => true,
        });
        before.saturating_sub(self.slots.len())
    }

    /// Number of keys tracked, in flight or recorded.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Removes an in-flight slot if its owner fails or is cancelled.
struct InFlightClaim<'a> {
    slots: &'a DashMap<String, Slot>,
    key: &'a str,
    generation: u64,
}

impl InFlightClaim<'_> {
    fn record(self, body: Bytes, ttl: Duration) {
        self.slots.insert(
            self.key.to_string(),
            Slot::Recorded {
                body,
                expires_at: Instant::now() + ttl,
            },
        );
    }
}

impl Drop for InFlightClaim<'_> {
    fn drop(&mut self) {
        let generation = self.generation;
        self.slots.remove_if(self.key, |_, slot| {
            matches!(slot, Slot::InFlight { generation: g, .. } if *g == generation)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    fn counting_op(
        counter: &Arc<AtomicUsize>,
        body: &'static str,
    ) -> impl Future<Output = Result<Bytes, String>> + use<> {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Bytes::from_static(body.as_bytes()))
        }
    }

    #[test]
    fn test_scoped_key_trims() {
        assert_eq!(
            scoped_key("process", Some("  abc ")),
            Some("idempotency:process:abc".to_string())
        );
        assert_eq!(scoped_key("process", Some("   ")), None);
        assert_eq!(scoped_key("process", None), None);
    }

    #[test]
    fn test_fingerprint_is_hex_sha256() {
        assert_eq!(
            fingerprint(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_long_keys_are_stored_by_digest() {
        let at_limit = "k".repeat(MAX_KEY_LEN);
        assert_eq!(
            scoped_key("process", Some(&at_limit)),
            Some(format!("idempotency:process:{at_limit}"))
        );

        let long = format!("{}-a", "k".repeat(4096));
        let stored = scoped_key("process", Some(&format!("  {long}\n"))).unwrap();
        assert_eq!(
            stored,
            format!("idempotency:process#{}", fingerprint(long.as_bytes()))
        );
        assert!(stored.len() < 100);
        assert_eq!(scoped_key("process", Some(&long)), Some(stored.clone()));

        // Same prefix, different tail.
        let other = format!("{}-b", "k".repeat(4096));
        assert_ne!(scoped_key("process", Some(&other)), Some(stored.clone()));
        // Scopes stay apart.
        assert_ne!(scoped_key("process-async", Some(&long)), Some(stored));
    }

    #[tokio::test]
    async fn test_long_key_replays() {
        let guard = IdempotencyGuard::new(Duration::from_secs(60));
        let counter = Arc::new(AtomicUsize::new(0));
        let long = "x".repeat(10 * MAX_KEY_LEN);
        let key = scoped_key("process", Some(&long));

        let first = guard
            .execute(key.as_deref(), || counting_op(&counter, "one"))
            .await
            .unwrap();
        let second = guard
            .execute(key.as_deref(), || counting_op(&counter, "two"))
            .await
            .unwrap();

        assert_eq!(second.body, first.body);
        assert!(second.replayed);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(guard.recorded(key.as_deref().unwrap()).is_some());
    }

    #[tokio::test]
    async fn test_replay_within_ttl() {
        let guard = IdempotencyGuard::new(Duration::from_secs(60));
        let calls = Arc::new(AtomicUsize::new(0));

        let first = guard
            .execute(Some("k1"), || counting_op(&calls, "one"))
            .await
            .unwrap();
        let second = guard
            .execute(Some(" k1 "), || counting_op(&calls, "two"))
            .await
            .unwrap();

        assert!(!first.replayed);
        assert!(second.replayed);
        assert_eq!(second.body, first.body);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(guard.recorded("k1"), Some(Bytes::from_static(b"one")));
    }

    #[tokio::test]
    async fn test_no_key_always_executes() {
        let guard = IdempotencyGuard::default();
        let calls = Arc::new(AtomicUsize::new(0));

        for key in [None, Some(""), Some("  ")] {
            let response = guard
                .execute(key, || counting_op(&calls, "x"))
                .await
                .unwrap();
            assert!(!response.replayed);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(guard.is_empty());
    }

    #[tokio::test]
    async fn test_failure_is_not_recorded() {
        let guard = IdempotencyGuard::default();

        let err = guard
            .execute(Some("k"), || async { Err::<Bytes, _>("boom".to_string()) })
            .await
            .unwrap_err();
        assert_eq!(err, "boom");
        assert!(guard.is_empty());

        let calls = Arc::new(AtomicUsize::new(0));
        let response = guard
            .execute(Some("k"), || counting_op(&calls, "ok"))
            .await
            .unwrap();
        assert!(!response.replayed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_record_executes_again() {
        let guard = IdempotencyGuard::new(Duration::from_secs(10));
        let calls = Arc::new(AtomicUsize::new(0));

        guard
            .execute(Some("k"), || counting_op(&calls, "a"))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;

        assert!(guard.recorded("k").is_none());
        let response = guard
            .execute(Some("k"), || counting_op(&calls, "b"))
            .await
            .unwrap();
        assert!(!response.replayed);
        assert_eq!(response.body, Bytes::from_static(b"b"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let guard = IdempotencyGuard::new(Duration::from_secs(10));
        let calls = Arc::new(AtomicUsize::new(0));
        guard
            .execute(Some("old"), || counting_op(&calls, "a"))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
        guard
            .execute(Some("new"), || counting_op(&calls, "b"))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;

        assert_eq!(guard.purge_expired(), 1);
        assert_eq!(guard.len(), 1);
        assert!(guard.recorded("new").is_some());
    }

    #[tokio::test]
    async fn test_wait_policy_duplicate_replays_in_flight_result() {
        let guard = Arc::new(IdempotencyGuard::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let first = {
            let guard = guard.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                guard
                    .execute(Some("k"), || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        let _ = release_rx.await;
                        Ok::<_, String>(Bytes::from_static(b"first"))
                    })
                    .await
            })
        };
        while guard.is_empty() {
            tokio::task::yield_now().await;
        }

        let second = {
            let guard = guard.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                guard
                    .execute(Some("k"), || counting_op(&calls, "second"))
                    .await
            })
        };
        tokio::task::yield_now().await;
        release_tx.send(()).unwrap();

        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();
        assert!(!first.replayed);
        assert!(second.replayed);
        assert_eq!(second.body, Bytes::from_static(b"first"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_wait_policy_retries_after_in_flight_failure() {
        let guard = Arc::new(IdempotencyGuard::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let first = {
            let guard = guard.clone();
            tokio::spawn(async move {
                guard
                    .execute(Some("k"), || async move {
                        let _ = release_rx.await;
                        Err::<Bytes, _>("first failed".to_string())
                    })
                    .await
            })
        };
        while guard.is_empty() {
            tokio::task::yield_now().await;
        }

        let second = {
            let guard = guard.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                guard
                    .execute(Some("k"), || counting_op(&calls, "second"))
                    .await
            })
        };
        tokio::task::yield_now().await;
        release_tx.send(()).unwrap();

        assert_eq!(first.await.unwrap().unwrap_err(), "first failed");
        let second = second.await.unwrap().unwrap();
        assert!(!second.replayed);
        assert_eq!(second.body, Bytes::from_static(b"second"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(guard.recorded("k"), Some(Bytes::from_static(b"second")));
    }

    #[tokio::test]
    async fn test_execute_policy_runs_duplicates_last_write_wins() {
        let guard = Arc::new(IdempotencyGuard::default().with_policy(DuplicatePolicy::Execute));
        let calls = Arc::new(AtomicUsize::new(0));
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let first = {
            let guard = guard.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                guard
                    .execute(Some("k"), || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        let _ = release_rx.await;
                        Ok::<_, String>(Bytes::from_static(b"first"))
                    })
                    .await
            })
        };
        while guard.is_empty() {
            tokio::task::yield_now().await;
        }

        let second = guard
            .execute(Some("k"), || counting_op(&calls, "second"))
            .await
            .unwrap();
        assert!(!second.replayed);
        assert_eq!(guard.recorded("k"), Some(Bytes::from_static(b"second")));

        release_tx.send(()).unwrap();
        let first = first.await.unwrap().unwrap();
        assert!(!first.replayed);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(guard.recorded("k"), Some(Bytes::from_static(b"first")));
    }

    #[tokio::test]
    async fn test_cancelled_request_releases_key() {
        let guard = Arc::new(IdempotencyGuard::default());

        let pending = {
            let guard = guard.clone();
            tokio::spawn(async move {
                guard
                    .execute(Some("k"), || std::future::pending::<Result<Bytes, String>>())
                    .await
            })
        };
        while guard.is_empty() {
            tokio::task::yield_now().await;
        }
        pending.abort();
        let _ = pending.await;

        assert!(guard.is_empty());
        let calls = Arc::new(AtomicUsize::new(0));
        let response = guard
            .execute(Some("k"), || counting_op(&calls, "again"))
            .await
            .unwrap();
        assert!(!response.replayed);
    }
}
