//! In-memory lease store for tests. Single-process only.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::LeaseStore;

/// Test double for the coordinator. Honors TTL expiry against the tokio
/// clock, so paused-time tests can fast-forward through it. Unlike the
/// Redis store, release is compare-and-delete by token.
#[derive(Default)]
pub struct MemoryLeaseStore {
    keys: Mutex<HashMap<String, Holder>>,
}

struct Holder {
    token: String,
    expires_at: Instant,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current holder token of `key`, if any.
    pub fn holder(&self, key: &str) -> Option<String> {
        let mut keys = self.keys.lock().unwrap();
        Self::expire(&mut keys);
        keys.get(key).map(|h| h.token.clone())
    }

    fn expire(keys: &mut HashMap<String, Holder>) {
        let now = Instant::now();
        keys.retain(|_, holder| holder.expires_at > now);
    }
}

#[async_trait::async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> anyhow::Result<bool> {
        let mut keys = self.keys.lock().unwrap();
        Self::expire(&mut keys);
        if keys.contains_key(key) {
            return Ok(false);
        }
        keys.insert(
            key.to_owned(),
            Holder {
                token: token.to_owned(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(true)
    }

    async fn release(&self, key: &str, token: &str) -> anyhow::Result<()> {
        let mut keys = self.keys.lock().unwrap();
        if keys.get(key).is_some_and(|h| h.token == token) {
            keys.remove(key);
        }
        Ok(())
    }

    async fn ping(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
