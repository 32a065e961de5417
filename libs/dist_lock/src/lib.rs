//! Client for the external lock coordinator.
//!
//! A [`Lease`] is a named, TTL-bounded exclusive right arbitrated by a
//! Redis-compatible store: at any instant at most one live lease exists per
//! key across the whole fleet. Acquisition is a bounded retry loop over an
//! atomic set-if-absent; release deletes the key. A holder that crashes
//! without releasing is covered by the coordinator-side expiry.
//!
//! The store itself is abstracted behind [`LeaseStore`] so tests can run
//! against an in-memory implementation ([`MemoryLeaseStore`], behind the
//! `testing` feature).

mod redis_store;

#[cfg(any(test, feature = "testing"))]
mod memory;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

#[cfg(any(test, feature = "testing"))]
pub use crate::memory::MemoryLeaseStore;
pub use crate::redis_store::RedisLeaseStore;

/// Lease time-to-live on the coordinator.
pub const DEFAULT_TTL: Duration = Duration::from_secs(30);

/// How many set-if-absent attempts a single acquisition makes.
pub const MAX_ATTEMPTS: u32 = 3;

/// Base of the linear backoff between attempts (attempt number times this).
pub const RETRY_BASE: Duration = Duration::from_millis(1000);

/// The coordinator could not grant the lease within the retry budget.
#[derive(Debug, thiserror::Error)]
#[error("lock on {key:?} unavailable: {cause}")]
pub struct LockError {
    pub key: String,
    pub cause: String,
}

/// Acquisition retry budget. The defaults are the service contract; tests
/// with deliberately heavy contention tighten the base to keep wall-clock
/// time down.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub retry_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            retry_base: RETRY_BASE,
        }
    }
}

/// Backend operations a coordinator must provide. Implementations enforce
/// their own per-operation I/O timeouts.
#[async_trait::async_trait]
pub trait LeaseStore: Send + Sync + 'static {
    /// Atomically sets `key = token` with expiry `ttl` if the key is absent.
    /// Returns `false` when the key is already held.
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> anyhow::Result<bool>;

    /// Removes `key`. `token` identifies the caller for stores implementing
    /// compare-and-delete; the Redis store deletes unconditionally, relying
    /// on the short TTL to bound the mis-release window.
    async fn release(&self, key: &str, token: &str) -> anyhow::Result<()>;

    /// Liveness probe for the health endpoint.
    async fn ping(&self) -> anyhow::Result<()>;
}

/// Handle for acquiring leases. Cheap to clone; one per process.
#[derive(Clone)]
pub struct LockClient {
    store: Arc<dyn LeaseStore>,
    ttl: Duration,
    policy: RetryPolicy,
    token_prefix: Arc<String>,
    token_seq: Arc<AtomicU64>,
}

impl LockClient {
    pub fn new(store: Arc<dyn LeaseStore>) -> Self {
        Self::with_ttl(store, DEFAULT_TTL)
    }

    pub fn with_ttl(store: Arc<dyn LeaseStore>, ttl: Duration) -> Self {
        Self::with_policy(store, ttl, RetryPolicy::default())
    }

    pub fn with_policy(store: Arc<dyn LeaseStore>, ttl: Duration, policy: RetryPolicy) -> Self {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown-host".to_owned());
        Self {
            store,
            ttl,
            policy,
            token_prefix: Arc::new(format!("{host}:{}", std::process::id())),
            token_seq: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Tokens only need to be unique within a TTL, and across instances the
    /// host/pid prefix takes care of that.
    fn next_token(&self) -> String {
        format!(
            "{}:{}",
            self.token_prefix,
            self.token_seq.fetch_add(1, Ordering::Relaxed)
        )
    }

    /// Acquires the lease for `key`, retrying with linear backoff while the
    /// key is held elsewhere. A coordinator I/O error consumes an attempt.
    /// Cancellation aborts a backoff sleep immediately.
    pub async fn acquire(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<Lease, LockError> {
        let token = self.next_token();
        for attempt in 1..=self.policy.max_attempts {
            match self.store.try_acquire(key, &token, self.ttl).await {
                Ok(true) => {
                    debug!(key, token, "lease acquired");
                    return Ok(Lease {
                        key: key.to_owned(),
                        token,
                        store: Arc::clone(&self.store),
                        released: false,
                    });
                }
                Ok(false) => {
                    debug!(key, attempt, "lease held by another writer");
                }
                Err(e) => {
                    warn!(key, attempt, error = %e, "lease acquisition attempt failed");
                }
            }
            if attempt < self.policy.max_attempts {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(LockError {
                            key: key.to_owned(),
                            cause: "cancelled while waiting to retry".to_owned(),
                        });
                    }
                    _ = tokio::time::sleep(self.policy.retry_base * attempt) => {}
                }
            }
        }
        Err(LockError {
            key: key.to_owned(),
            cause: format!("still held after {} attempts", self.policy.max_attempts),
        })
    }

    pub async fn ping(&self) -> anyhow::Result<()> {
        self.store.ping().await
    }
}

/// An acquired lease. Call [`Lease::release`] when done; a lease dropped
/// without releasing (panic, cancellation) schedules a best-effort
/// background delete so the key does not linger for a full TTL.
pub struct Lease {
    key: String,
    token: String,
    store: Arc<dyn LeaseStore>,
    released: bool,
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("key", &self.key)
            .field("token", &self.token)
            .field("released", &self.released)
            .finish()
    }
}

impl Lease {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Idempotent; a store failure is logged, never propagated, since the
    /// coordinator expires the key on its own.
    pub async fn release(mut self) {
        self.released = true;
        if let Err(e) = self.store.release(&self.key, &self.token).await {
            error!(key = %self.key, error = %e, "failed to release lease, waiting out the TTL");
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let store = Arc::clone(&self.store);
        let (key, token) = (self.key.clone(), self.token.clone());
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = store.release(&key, &token).await {
                    warn!(key = %key, error = %e, "background lease release failed");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use super::*;

    /// Wraps the in-memory store, failing the first `failures` acquire calls.
    struct FlakyStore {
        inner: MemoryLeaseStore,
        failures: AtomicU32,
    }

    #[async_trait::async_trait]
    impl LeaseStore for FlakyStore {
        async fn try_acquire(
            &self,
            key: &str,
            token: &str,
            ttl: Duration,
        ) -> anyhow::Result<bool> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                anyhow::bail!("injected coordinator failure");
            }
            self.inner.try_acquire(key, token, ttl).await
        }

        async fn release(&self, key: &str, token: &str) -> anyhow::Result<()> {
            self.inner.release(key, token).await
        }

        async fn ping(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn client(store: Arc<dyn LeaseStore>) -> LockClient {
        LockClient::new(store)
    }

    #[tokio::test]
    async fn acquire_then_release_frees_the_key() -> anyhow::Result<()> {
        let store = Arc::new(MemoryLeaseStore::new());
        let locks = client(store.clone());
        let cancel = CancellationToken::new();

        let lease = locks.acquire("file:a.txt", &cancel).await?;
        assert_eq!(store.holder("file:a.txt"), Some(lease.token().to_owned()));
        lease.release().await;
        assert_eq!(store.holder("file:a.txt"), None);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn contended_key_exhausts_retries() -> anyhow::Result<()> {
        let store = Arc::new(MemoryLeaseStore::new());
        let locks = client(store.clone());
        let cancel = CancellationToken::new();

        let held = locks.acquire("file:a.txt", &cancel).await?;
        let err = locks
            .acquire("file:a.txt", &cancel)
            .await
            .expect_err("second acquisition must fail");
        assert!(err.cause.contains("still held"), "unexpected cause: {err}");
        held.release().await;

        // Free again: acquisition succeeds on the first attempt.
        locks.acquire("file:a.txt", &cancel).await?.release().await;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn io_error_consumes_an_attempt_then_retry_succeeds() -> anyhow::Result<()> {
        let store = Arc::new(FlakyStore {
            inner: MemoryLeaseStore::new(),
            failures: AtomicU32::new(1),
        });
        let locks = client(store);
        let cancel = CancellationToken::new();

        let lease = locks.acquire("file:a.txt", &cancel).await?;
        lease.release().await;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_aborts_backoff() -> anyhow::Result<()> {
        let store = Arc::new(MemoryLeaseStore::new());
        let locks = client(store.clone());
        let cancel = CancellationToken::new();

        let _held = locks.acquire("file:a.txt", &cancel).await?;
        cancel.cancel();
        let err = locks
            .acquire("file:a.txt", &cancel)
            .await
            .expect_err("cancelled acquisition must fail");
        assert!(err.cause.contains("cancelled"), "unexpected cause: {err}");
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lease_is_reacquirable() -> anyhow::Result<()> {
        let store = Arc::new(MemoryLeaseStore::new());
        let locks = LockClient::with_ttl(store.clone(), Duration::from_secs(5));
        let cancel = CancellationToken::new();

        let first = locks.acquire("file:a.txt", &cancel).await?;
        tokio::time::sleep(Duration::from_secs(6)).await;
        // The holder crashed (never released); expiry lets the next writer in.
        let second = locks.acquire("file:a.txt", &cancel).await?;
        assert_ne!(first.token(), second.token());
        second.release().await;
        drop(first);
        Ok(())
    }

    #[tokio::test]
    async fn dropped_lease_is_released_in_background() -> anyhow::Result<()> {
        let store = Arc::new(MemoryLeaseStore::new());
        let locks = client(store.clone());
        let cancel = CancellationToken::new();

        let lease = locks.acquire("file:a.txt", &cancel).await?;
        drop(lease);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(store.holder("file:a.txt"), None);
        Ok(())
    }

    #[tokio::test]
    async fn tokens_are_unique_per_acquisition() -> anyhow::Result<()> {
        let store = Arc::new(MemoryLeaseStore::new());
        let locks = client(store);
        let cancel = CancellationToken::new();

        let a = locks.acquire("k1", &cancel).await?;
        let b = locks.acquire("k2", &cancel).await?;
        assert_ne!(a.token(), b.token());
        a.release().await;
        b.release().await;
        Ok(())
    }
}
