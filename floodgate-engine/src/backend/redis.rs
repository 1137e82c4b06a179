//! Shared-backend implementation over Redis
//!
//! Both counting operations are Lua scripts, so read-modify-write is a
//! single indivisible step on the server: concurrent requests for the
//! same key never observe a stale pre-increment value, regardless of
//! how many engine processes share the backend.
//!
//! Window keys embed their bucket id, so a new bucket starts from a
//! fresh key and old buckets are reclaimed by TTL alone.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::{CounterBackend, TokenVerdict, WindowSlot};
use crate::error::BackendError;
use floodgate::{bucket_bounds, bucket_id};

// INCR the bucket counter, arming its expiry on first touch.
// KEYS[1] = window bucket key, ARGV[1] = ttl in ms
const INCREMENT_WINDOW: &str = r"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return count
";

// Refill-then-consume on a token bucket stored as a hash.
// KEYS[1] = bucket key
// ARGV = capacity, refill_per_sec, requested, now_ms, ttl_ms
// Returns {allowed, tokens (as string), wait_ms (-1 = never)}
const CONSUME_TOKENS: &str = r"
local capacity = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local requested = tonumber(ARGV[3])
local now_ms = tonumber(ARGV[4])

local state = redis.call('HMGET', KEYS[1], 'tokens', 'ts')
local tokens = tonumber(state[1])
local ts = tonumber(state[2])
if tokens == nil or ts == nil then
  tokens = capacity
  ts = now_ms
end

local elapsed = now_ms - ts
if elapsed < 0 then
  elapsed = 0
end
tokens = math.min(capacity, tokens + (elapsed / 1000.0) * rate)

local allowed = 0
local wait_ms = 0
if tokens >= requested then
  tokens = tokens - requested
  allowed = 1
elseif rate > 0 then
  wait_ms = math.ceil((requested - tokens) / rate * 1000)
else
  wait_ms = -1
end

redis.call('HSET', KEYS[1], 'tokens', tokens, 'ts', now_ms)
redis.call('PEXPIRE', KEYS[1], ARGV[5])
return {allowed, tostring(tokens), wait_ms}
";

fn unix_ms(now: SystemTime) -> u64 {
    now.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn backend_err(err: redis::RedisError) -> BackendError {
    BackendError::Unavailable(err.to_string())
}

/// Counting backend over a shared Redis instance.
///
/// Cloneable: the underlying [`ConnectionManager`] multiplexes one
/// connection and reconnects on failure.
#[derive(Clone)]
pub struct RedisBackend {
    conn: ConnectionManager,
    increment_window: Script,
    consume_tokens: Script,
}

impl RedisBackend {
    /// Connect to the shared backend and verify it answers.
    pub async fn connect(url: &str) -> Result<Self, BackendError> {
        let client = redis::Client::open(url).map_err(backend_err)?;
        let conn = client.get_connection_manager().await.map_err(backend_err)?;

        let backend = RedisBackend {
            conn,
            increment_window: Script::new(INCREMENT_WINDOW),
            consume_tokens: Script::new(CONSUME_TOKENS),
        };
        backend.ping().await?;
        Ok(backend)
    }
}

#[async_trait]
impl CounterBackend for RedisBackend {
    async fn increment_window(
        &self,
        key: &str,
        width: Duration,
        now: SystemTime,
    ) -> Result<WindowSlot, BackendError> {
        let bucket = bucket_id(now, width);
        let (_, bucket_end) = bucket_bounds(now, width);
        let ttl_ms = bucket_end
            .duration_since(now)
            .unwrap_or(Duration::ZERO)
            .as_millis() as u64
            + 1000;

        let mut conn = self.conn.clone();
        let count: i64 = self
            .increment_window
            .key(format!("{key}:{bucket}"))
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(backend_err)?;

        Ok(WindowSlot {
            count: count.max(0) as u64,
            expires_at: bucket_end,
        })
    }

    async fn consume_tokens(
        &self,
        key: &str,
        capacity: f64,
        refill_per_sec: f64,
        requested: f64,
        now: SystemTime,
    ) -> Result<TokenVerdict, BackendError> {
        // Keep the key long enough for an idle bucket to fill back up
        let ttl_secs = if refill_per_sec > 0.0 {
            (capacity / refill_per_sec).ceil() as u64 + 60
        } else {
            3600
        };

        let mut conn = self.conn.clone();
        let (allowed, tokens, wait_ms): (i64, String, i64) = self
            .consume_tokens
            .key(key)
            .arg(capacity)
            .arg(refill_per_sec)
            .arg(requested)
            .arg(unix_ms(now))
            .arg(ttl_secs * 1000)
            .invoke_async(&mut conn)
            .await
            .map_err(backend_err)?;

        let remaining: f64 = tokens
            .parse()
            .map_err(|_| BackendError::Internal(format!("malformed bucket reply: {tokens}")))?;

        let retry_after = match wait_ms {
            0 => Duration::ZERO,
            ms if ms < 0 => Duration::MAX,
            ms => Duration::from_millis(ms as u64),
        };

        Ok(TokenVerdict {
            allowed: allowed == 1,
            remaining,
            retry_after,
        })
    }

    async fn window_count(
        &self,
        key: &str,
        width: Duration,
        now: SystemTime,
    ) -> Result<u64, BackendError> {
        let bucket = bucket_id(now, width);
        let mut conn = self.conn.clone();
        let count: Option<i64> = redis::cmd("GET")
            .arg(format!("{key}:{bucket}"))
            .query_async(&mut conn)
            .await
            .map_err(backend_err)?;
        Ok(count.unwrap_or(0).max(0) as u64)
    }

    async fn set_flag(
        &self,
        key: &str,
        ttl: Duration,
        _now: SystemTime,
    ) -> Result<(), BackendError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(1)
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn flag_expiry(
        &self,
        key: &str,
        now: SystemTime,
    ) -> Result<Option<SystemTime>, BackendError> {
        let mut conn = self.conn.clone();
        let pttl: i64 = redis::cmd("PTTL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(backend_err)?;

        // -2 = no key, -1 = no expiry (not a flag we armed)
        if pttl > 0 {
            Ok(Some(now + Duration::from_millis(pttl as u64)))
        } else {
            Ok(None)
        }
    }

    async fn remove_prefix(&self, prefix: &str) -> Result<usize, BackendError> {
        let mut conn = self.conn.clone();
        let pattern = format!("{prefix}*");
        let mut cursor: u64 = 0;
        let mut removed = 0usize;

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(&mut conn)
                .await
                .map_err(backend_err)?;

            if !batch.is_empty() {
                let deleted: i64 = redis::cmd("DEL")
                    .arg(&batch)
                    .query_async(&mut conn)
                    .await
                    .map_err(backend_err)?;
                removed += deleted.max(0) as usize;
            }

            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        Ok(removed)
    }

    async fn ping(&self) -> Result<(), BackendError> {
        let mut conn = self.conn.clone();
        let reply: String = redis::cmd("PING")
            .arg("floodgate")
            .query_async(&mut conn)
            .await
            .map_err(backend_err)?;
        if reply == "floodgate" {
            Ok(())
        } else {
            Err(BackendError::Internal(format!(
                "unexpected ping reply: {reply}"
            )))
        }
    }
}
