use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tokio::sync::Mutex;

use super::limits::{QuotaKey, QuotaRecord, QuotaStore, QuotaStoreError};
use super::{Clock, SystemClock};

// Returns {count, remaining ttl in ms}. The expiry is (re)armed on the first increment of a
// window, and also when a key somehow lost its TTL so it cannot count forever.
const INCREMENT_SCRIPT: &str = r#"
local window_ms = tonumber(ARGV[1])

local count = redis.call("INCR", KEYS[1])
local ttl = redis.call("PTTL", KEYS[1])
if count == 1 or ttl < 0 then
  redis.call("PEXPIRE", KEYS[1], window_ms)
  ttl = window_ms
end
return {count, ttl}
"#;

/// Clones share one multiplexed connection, opened on first use and reopened after it drops.
#[derive(Clone)]
pub struct RedisQuotaStore {
    client: redis::Client,
    prefix: Option<String>,
    conn: Arc<Mutex<Option<MultiplexedConnection>>>,
}

impl fmt::Debug for RedisQuotaStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisQuotaStore")
            .field("client", &self.client)
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl RedisQuotaStore {
    pub fn new(url: impl AsRef<str>) -> Result<Self, redis::RedisError> {
        Ok(Self {
            client: redis::Client::open(url.as_ref())?,
            prefix: None,
            conn: Arc::new(Mutex::new(None)),
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        self.prefix = (!prefix.trim().is_empty()).then_some(prefix);
        self
    }

    async fn connection(&self) -> Result<MultiplexedConnection, QuotaStoreError> {
        let mut cached = self.conn.lock().await;
        if let Some(conn) = cached.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(unavailable)?;
        *cached = Some(conn.clone());
        Ok(conn)
    }

    /// Maps a command error, dropping the cached connection when the error means it is gone.
    async fn command_failed(&self, err: redis::RedisError) -> QuotaStoreError {
        if err.is_io_error() || err.is_connection_dropped() {
            tracing::warn!(error = %err, "redis connection lost, reconnecting on next use");
            self.conn.lock().await.take();
        }
        unavailable(err)
    }

    pub async fn ping(&self) -> Result<(), QuotaStoreError> {
        let mut conn = self.connection().await?;
        let reply: redis::RedisResult<String> = redis::cmd("PING").query_async(&mut conn).await;
        match reply {
            Ok(_) => Ok(()),
            Err(err) => Err(self.command_failed(err).await),
        }
    }

    fn storage_key(&self, key: &QuotaKey) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}:{key}"),
            None => key.to_string(),
        }
    }
}

fn unavailable(err: redis::RedisError) -> QuotaStoreError {
    QuotaStoreError::Unavailable(format!("redis error: {err}"))
}

#[async_trait]
impl QuotaStore for RedisQuotaStore {
    async fn increment(
        &self,
        key: &QuotaKey,
        limit: u64,
        window_ms: u64,
    ) -> Result<QuotaRecord, QuotaStoreError> {
        let mut conn = self.connection().await?;

        let window_ms = i64::try_from(window_ms.max(1)).unwrap_or(i64::MAX);
        let script = redis::Script::new(INCREMENT_SCRIPT);
        let reply: redis::RedisResult<(i64, i64)> = script
            .key(self.storage_key(key))
            .arg(window_ms)
            .invoke_async(&mut conn)
            .await;
        let (count, ttl_ms) = match reply {
            Ok(reply) => reply,
            Err(err) => return Err(self.command_failed(err).await),
        };

        let count = u64::try_from(count).map_err(|_| {
            QuotaStoreError::Protocol(format!("negative counter value: {count}"))
        })?;
        let ttl_ms = u64::try_from(ttl_ms.max(0)).unwrap_or(0);

        Ok(QuotaRecord {
            key: key.clone(),
            count,
            reset_at_ms: SystemClock.now_epoch_millis().saturating_add(ttl_ms),
            limit,
        })
    }
}
