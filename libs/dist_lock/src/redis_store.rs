//! Redis-backed lease store.

use std::time::Duration;

use anyhow::Context;
use redis::aio::ConnectionManager;
use tracing::info;

use crate::LeaseStore;

/// Per-operation deadline on coordinator round-trips.
pub const OP_TIMEOUT: Duration = Duration::from_secs(2);

/// Lease store on a Redis-compatible coordinator. The connection manager
/// multiplexes one TCP connection across all requests and reconnects on
/// failure, so a single instance is shared by the whole process.
#[derive(Clone)]
pub struct RedisLeaseStore {
    conn: ConnectionManager,
}

impl RedisLeaseStore {
    /// Connects and authenticates. Fails fast when the coordinator is
    /// unreachable, so misconfiguration surfaces at startup.
    pub async fn connect(host: &str, port: u16, password: &str) -> anyhow::Result<Self> {
        let info = redis::ConnectionInfo {
            addr: redis::ConnectionAddr::Tcp(host.to_owned(), port),
            redis: redis::RedisConnectionInfo {
                db: 0,
                username: None,
                password: Some(password.to_owned()),
            },
        };
        let client = redis::Client::open(info)?;
        let conn = tokio::time::timeout(OP_TIMEOUT, ConnectionManager::new(client))
            .await
            .context("connecting to the lock coordinator timed out")?
            .context("connecting to the lock coordinator")?;
        info!("connected to lock coordinator at {host}:{port}");
        Ok(Self { conn })
    }

    async fn run<T: redis::FromRedisValue>(&self, cmd: &redis::Cmd) -> anyhow::Result<T> {
        let mut conn = self.conn.clone();
        let value = tokio::time::timeout(OP_TIMEOUT, cmd.query_async(&mut conn))
            .await
            .context("coordinator request timed out")?
            .context("coordinator request failed")?;
        Ok(value)
    }
}

#[async_trait::async_trait]
impl LeaseStore for RedisLeaseStore {
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> anyhow::Result<bool> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key)
            .arg(token)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1));
        // SET NX answers OK when the key was set, nil when it was held.
        let reply: Option<String> = self.run(&cmd).await?;
        Ok(reply.is_some())
    }

    async fn release(&self, key: &str, _token: &str) -> anyhow::Result<()> {
        let mut cmd = redis::cmd("DEL");
        cmd.arg(key);
        let _: i64 = self.run(&cmd).await?;
        Ok(())
    }

    async fn ping(&self) -> anyhow::Result<()> {
        let reply: String = self.run(&redis::cmd("PING")).await?;
        anyhow::ensure!(reply == "PONG", "unexpected PING reply {reply:?}");
        Ok(())
    }
}
