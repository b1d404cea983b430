//! Process-wide handle to the shared Redis instance.
//!
//! One [`RedisConnection`] is built during startup and cloned into every
//! component that needs the store. Clones share a single multiplexed
//! connection, which pipelines commands from concurrent callers instead of
//! serializing them.

use std::sync::Arc;
use std::time::Duration;

use redis::aio::MultiplexedConnection;
use redis::{Client, ErrorKind, IntoConnectionInfo, RedisError, RedisResult};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, instrument, warn};

use crate::config::StoreConfig;
use crate::error::LockError;
use crate::traits::{DeleteOutcome, LockStore};

const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// `KEYS[1]` lock key, `ARGV[1]` expected token.
/// Replies `0` when the key is absent, `1` when deleted, `-1` on mismatch.
pub(crate) const RELEASE_SCRIPT: &str = r"
local current = redis.call('GET', KEYS[1])
if not current then
    return 0
end
if current == ARGV[1] then
    redis.call('DEL', KEYS[1])
    return 1
end
return -1
";

#[derive(Clone)]
pub struct RedisConnection {
    inner: Arc<Inner>,
}

struct Inner {
    client: Client,
    endpoint: String,
    auth: &'static str,
    connection: Mutex<Option<MultiplexedConnection>>,
    release_sha: OnceCell<String>,
}

impl RedisConnection {
    /// Validate `config` and prepare a client. No network I/O happens here.
    pub fn new(config: &StoreConfig) -> Result<Self, LockError> {
        let mut info = config
            .url
            .as_str()
            .into_connection_info()
            .map_err(|e| LockError::Configuration(format!("invalid Redis URL: {e}")))?;

        if let Some(password) = &config.password {
            info.redis.password = Some(password.clone());
            info.redis.username = config.username.clone();
        }

        let endpoint = info.addr.to_string();
        let client = Client::open(info)
            .map_err(|e| LockError::Configuration(format!("invalid Redis connection info: {e}")))?;

        Ok(Self {
            inner: Arc::new(Inner {
                client,
                endpoint,
                auth: config.auth_description(),
                connection: Mutex::new(None),
                release_sha: OnceCell::new(),
            }),
        })
    }

    /// Build the handle and establish the connection right away, so an
    /// unreachable store fails startup instead of the first tick.
    pub async fn connect(config: &StoreConfig) -> Result<Self, LockError> {
        let handle = Self::new(config)?;
        handle.get_connection().await?;
        Ok(handle)
    }

    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    /// Return the live connection, establishing one if none is cached.
    ///
    /// Failures are returned to the caller as-is; there is no retry loop here.
    pub async fn get_connection(&self) -> Result<MultiplexedConnection, LockError> {
        let mut slot = self.inner.connection.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self.establish().await?;
        *slot = Some(conn.clone());
        Ok(conn)
    }

    #[instrument(name = "redis.connect", skip(self), fields(endpoint = %self.inner.endpoint, auth = %self.inner.auth))]
    async fn establish(&self) -> Result<MultiplexedConnection, LockError> {
        info!("Connecting to Redis");

        let connect = self.inner.client.get_multiplexed_async_connection();
        let mut conn = match tokio::time::timeout(CONNECTION_TIMEOUT, connect).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                warn!(error = %e, "Failed to connect to Redis");
                return Err(self.connection_error(e));
            }
            Err(_) => {
                warn!(
                    timeout_secs = CONNECTION_TIMEOUT.as_secs(),
                    "Timed out connecting to Redis"
                );
                return Err(LockError::ConnectionTimeout {
                    endpoint: self.inner.endpoint.clone(),
                });
            }
        };

        if let Err(e) = self.register_release_script(&mut conn).await {
            warn!(error = %e, "Failed to register lock release script");
            return Err(self.connection_error(e));
        }
        info!("Connected to Redis");
        Ok(conn)
    }

    /// A handle without a usable session counts as a connection failure,
    /// whether the socket or the session setup failed.
    fn connection_error(&self, source: RedisError) -> LockError {
        LockError::Connection {
            endpoint: self.inner.endpoint.clone(),
            source,
        }
    }

    /// `SCRIPT LOAD` the release script once per handle; reconnects reuse the SHA.
    async fn register_release_script(&self, conn: &mut MultiplexedConnection) -> RedisResult<()> {
        self.inner
            .release_sha
            .get_or_try_init(|| async move {
                let sha: String = redis::cmd("SCRIPT")
                    .arg("LOAD")
                    .arg(RELEASE_SCRIPT)
                    .query_async(conn)
                    .await?;
                debug!(sha = %sha, "Registered lock release script");
                Ok::<_, RedisError>(sha)
            })
            .await?;
        Ok(())
    }

    /// Drop the cached connection after a transport failure so the next call
    /// reconnects.
    async fn invalidate_if_broken(&self, err: &RedisError) {
        if err.is_connection_dropped() || err.is_io_error() || err.is_timeout() {
            warn!(endpoint = %self.inner.endpoint, error = %err, "Redis connection lost, will reconnect on next use");
            *self.inner.connection.lock().await = None;
        }
    }

    async fn run_release_script(
        &self,
        conn: &mut MultiplexedConnection,
        key: &str,
        expected: &str,
    ) -> RedisResult<i64> {
        if let Some(sha) = self.inner.release_sha.get() {
            let reply: RedisResult<i64> = redis::cmd("EVALSHA")
                .arg(sha)
                .arg(1)
                .arg(key)
                .arg(expected)
                .query_async(&mut *conn)
                .await;
            match reply {
                Err(e) if e.kind() == ErrorKind::NoScriptError => {
                    warn!(key, "Release script missing from Redis cache, falling back to EVAL");
                }
                other => return other,
            }
        }
        redis::cmd("EVAL")
            .arg(RELEASE_SCRIPT)
            .arg(1)
            .arg(key)
            .arg(expected)
            .query_async(&mut *conn)
            .await
    }
}

/// Redis `PX` takes whole milliseconds and rejects zero.
fn ttl_millis(ttl: Duration) -> u64 {
    ttl.as_millis().clamp(1, i64::MAX as u128) as u64
}

fn delete_outcome(code: i64) -> Result<DeleteOutcome, LockError> {
    match code {
        0 => Ok(DeleteOutcome::Absent),
        1 => Ok(DeleteOutcome::Deleted),
        -1 => Ok(DeleteOutcome::Mismatch),
        _ => Err(LockError::Store(RedisError::from((
            ErrorKind::TypeError,
            "unexpected reply from release script",
        )))),
    }
}

impl LockStore for RedisConnection {
    type Error = LockError;

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut conn = self.get_connection().await?;
        let reply: RedisResult<Option<String>> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await;
        match reply {
            Ok(reply) => Ok(reply.is_some()),
            Err(e) => {
                self.invalidate_if_broken(&e).await;
                Err(e.into())
            }
        }
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<DeleteOutcome, LockError> {
        let mut conn = self.get_connection().await?;
        match self.run_release_script(&mut conn, key, expected).await {
            Ok(code) => delete_outcome(code),
            Err(e) => {
                self.invalidate_if_broken(&e).await;
                Err(e.into())
            }
        }
    }
}
