//! Redis backend for the `ratekeeper` cache tier (companion crate).
//! Bring your own `redis::aio::ConnectionManager`; buckets are stored as hashes.
//!
//! Refill, admission, and debit run server-side in one Lua script, so concurrent
//! takes from any number of instances cannot over-admit.

use async_trait::async_trait;
use ratekeeper::cache::{decode_fields, fields};
use ratekeeper::{AtomicTakeReply, KeyValueClient, StoreError, TakeOutcome};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::Arc;

/// Field order used by the take script's `HMGET` and reply.
const SCRIPT_FIELDS: [&str; 8] = [
    fields::OWNER,
    fields::RESOURCE,
    fields::CAPACITY,
    fields::PERIOD_SECONDS,
    fields::REFILL_AMOUNT,
    fields::LAST_FILL_AT,
    fields::PERSISTENT,
    fields::TOKEN,
];

/// KEYS[1] = bucket key, ARGV[1] = now (unix seconds), ARGV[2] = count.
///
/// Replies `{"missing"}` when the hash has no owner or any field that
/// [`decode_fields`] would reject, before anything is written. Otherwise replies
/// `{"ok", admitted, granted, <SCRIPT_FIELDS values after the take>}`.
const TAKE_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local count = tonumber(ARGV[2])
local raw = redis.call('HMGET', key, 'owner', 'resource', 'capacity', 'period_seconds',
    'refill_amount', 'last_fill_at', 'persistent', 'token')
if not raw[1] or raw[1] == '' then
  return {'missing'}
end

-- Decimal integers only, optionally signed, surrounding whitespace allowed.
local function int_field(v, signed, lo, hi)
  if not v then return nil end
  local digits
  if signed then
    digits = string.match(v, '^%s*([+-]?%d+)%s*$')
  else
    digits = string.match(v, '^%s*%+?(%d+)%s*$')
  end
  if not digits then return nil end
  local n = tonumber(digits)
  if not n or n ~= math.floor(n) or n < lo or n > hi then return nil end
  return n
end

local U32_MAX = 4294967295
local I53_MAX = 9007199254740991
local capacity = int_field(raw[3], false, 1, U32_MAX)
local period = int_field(raw[4], false, 1, U32_MAX)
local refill = int_field(raw[5], false, 1, U32_MAX)
local last = int_field(raw[6], true, -I53_MAX, I53_MAX)
local token = int_field(raw[8], true, -I53_MAX, I53_MAX)
local persistent = raw[7]
if not raw[2] or not capacity or not period or not refill or not last or not token then
  return {'missing'}
end
if persistent and persistent ~= 'true' and persistent ~= 'false'
    and persistent ~= '1' and persistent ~= '0' then
  return {'missing'}
end

local granted = 0
local elapsed = now - last
if elapsed > 0 then
  local rate = math.floor(elapsed * refill / period)
  if rate > 0 then
    local grant = math.min(capacity, rate) - token
    if grant > 0 then
      token = token + grant
      last = now
      granted = grant
    end
  end
end

local admitted = 0
if token > 0 then
  token = token - count
  admitted = 1
end
if admitted == 1 or granted > 0 then
  redis.call('HSET', key, 'token', string.format('%d', token), 'last_fill_at', string.format('%d', last))
end

return {'ok', tostring(admitted), string.format('%d', granted), raw[1], raw[2], raw[3], raw[4], raw[5],
  string.format('%d', last), persistent or 'false', string.format('%d', token)}
"#;

/// [`KeyValueClient`] over a shared Redis connection.
#[derive(Clone)]
pub struct RedisKeyValue {
    conn: ConnectionManager,
    take_script: Option<Arc<redis::Script>>,
}

impl std::fmt::Debug for RedisKeyValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisKeyValue")
            .field("conn", &"<redis::aio::ConnectionManager>")
            .field("atomic_take", &self.take_script.is_some())
            .finish()
    }
}

impl RedisKeyValue {
    /// Wrap an existing connection manager.
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn, take_script: Some(Arc::new(redis::Script::new(TAKE_SCRIPT))) }
    }

    /// Open a connection manager from a client.
    ///
    /// # Errors
    /// Returns `Err` if the initial connection cannot be established.
    pub async fn from_client(client: redis::Client) -> Result<Self, StoreError> {
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::from_source("redis connect failed", e))?;
        Ok(Self::new(conn))
    }

    /// Disable the server-side take, for Redis-compatible servers without `EVALSHA`.
    pub fn without_atomic_take(mut self) -> Self {
        self.take_script = None;
        self
    }
}

fn store_error(op: &'static str, key: &str, e: redis::RedisError) -> StoreError {
    tracing::warn!(target: "ratekeeper::redis", key = %key, op, error = %e, "redis command failed");
    StoreError::from_source(format!("redis {} failed", op), e)
}

/// Interpret the take script's reply.
fn parse_take_reply(key: &str, reply: Vec<String>) -> Result<AtomicTakeReply, StoreError> {
    match reply.first().map(String::as_str) {
        Some("missing") => return Ok(AtomicTakeReply::Missing),
        Some("ok") if reply.len() == 3 + SCRIPT_FIELDS.len() => {}
        _ => return Err(StoreError::new(format!("unexpected take script reply for '{}'", key))),
    }
    let admitted = reply[1] == "1";
    let granted: i64 = reply[2]
        .parse()
        .map_err(|_| StoreError::new(format!("take script returned bad grant {:?}", reply[2])))?;
    let hash: HashMap<String, String> = SCRIPT_FIELDS
        .iter()
        .zip(reply.into_iter().skip(3))
        .map(|(field, value)| ((*field).to_string(), value))
        .collect();
    let bucket = match decode_fields(key, &hash) {
        Ok(Some(bucket)) => bucket,
        Ok(None) => return Ok(AtomicTakeReply::Missing),
        Err(e) => {
            // Resolving again reads the same hash, logs it and re-provisions.
            tracing::warn!(target: "ratekeeper::redis", key = %key, error = %e, "take script returned undecodable state");
            return Ok(AtomicTakeReply::Missing);
        }
    };
    let outcome = TakeOutcome {
        admitted,
        granted,
        token: bucket.token(),
        last_fill_at: bucket.last_fill_at(),
    };
    Ok(AtomicTakeReply::Completed { bucket, outcome })
}

#[async_trait]
impl KeyValueClient for RedisKeyValue {
    async fn hash_get_all(&self, key: &str) -> Result<Option<HashMap<String, String>>, StoreError> {
        let mut conn = self.conn.clone();
        let hash: HashMap<String, String> =
            conn.hgetall(key).await.map_err(|e| store_error("HGETALL", key, e))?;
        Ok(if hash.is_empty() { None } else { Some(hash) })
    }

    async fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> Result<(), StoreError> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let _: () =
            conn.hset_multiple(key, fields).await.map_err(|e| store_error("HSET", key, e))?;
        Ok(())
    }

    async fn hash_replace(&self, key: &str, fields: &[(&str, String)]) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic().del(key).ignore();
        if !fields.is_empty() {
            pipe.hset_multiple(key, fields).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await.map_err(|e| store_error("MULTI", key, e))?;
        Ok(())
    }

    async fn hash_increment(&self, key: &str, field: &str, delta: i64) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        let value: i64 =
            conn.hincr(key, field, delta).await.map_err(|e| store_error("HINCRBY", key, e))?;
        Ok(value)
    }

    async fn atomic_take(
        &self,
        key: &str,
        now: i64,
        count: u32,
    ) -> Result<AtomicTakeReply, StoreError> {
        let Some(script) = &self.take_script else {
            return Ok(AtomicTakeReply::Unsupported);
        };
        let mut conn = self.conn.clone();
        let reply: Vec<String> = script
            .key(key)
            .arg(now)
            .arg(count)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| store_error("EVALSHA", key, e))?;
        parse_take_reply(key, reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn missing_reply() {
        assert_eq!(parse_take_reply("k", reply(&["missing"])).unwrap(), AtomicTakeReply::Missing);
    }

    #[test]
    fn completed_reply_rebuilds_bucket() {
        let parsed = parse_take_reply(
            "k",
            reply(&["ok", "1", "20", "acme", "export", "100", "60", "10", "120", "true", "0"]),
        )
        .unwrap();
        match parsed {
            AtomicTakeReply::Completed { bucket, outcome } => {
                assert!(outcome.admitted);
                assert_eq!(outcome.granted, 20);
                assert_eq!(outcome.token, 0);
                assert_eq!(outcome.last_fill_at, 120);
                assert!(bucket.persistent());
                assert_eq!(bucket.capacity(), 100);
            }
            other => panic!("expected completed, got {other:?}"),
        }
    }

    /// Field values the script must refuse before writing, paired with the field.
    const REJECTED: [(&str, &str); 9] = [
        (fields::CAPACITY, "1.5"),
        (fields::CAPACITY, "5000000000"),
        (fields::CAPACITY, "1e2"),
        (fields::CAPACITY, "0x10"),
        (fields::CAPACITY, "0"),
        (fields::PERIOD_SECONDS, "-60"),
        (fields::TOKEN, "7.25"),
        (fields::PERSISTENT, "yes"),
        (fields::PERSISTENT, ""),
    ];

    fn completed_parts() -> Vec<String> {
        reply(&["ok", "1", "0", "acme", "search", "100", "60", "10", "120", "false", "5"])
    }

    #[test]
    fn undecodable_completed_reply_counts_as_missing() {
        for (field, value) in REJECTED {
            let mut parts = completed_parts();
            let index = 3 + SCRIPT_FIELDS.iter().position(|f| *f == field).unwrap();
            parts[index] = value.to_string();
            assert_eq!(
                parse_take_reply("k", parts).unwrap(),
                AtomicTakeReply::Missing,
                "{field} = {value:?}"
            );
        }
    }

    #[test]
    fn rejected_values_are_also_rejected_by_the_decoder() {
        let base: HashMap<String, String> = SCRIPT_FIELDS
            .iter()
            .zip(completed_parts().into_iter().skip(3))
            .map(|(f, v)| ((*f).to_string(), v))
            .collect();
        assert!(decode_fields("k", &base).unwrap().is_some());
        for (field, value) in REJECTED {
            let mut hash = base.clone();
            hash.insert(field.to_string(), value.to_string());
            assert!(decode_fields("k", &hash).is_err(), "{field} = {value:?}");
        }
    }

    #[test]
    fn script_validates_before_writing() {
        let guard = TAKE_SCRIPT.find("int_field(raw[3]").unwrap();
        let persistent_check = TAKE_SCRIPT.find("persistent ~= 'true'").unwrap();
        let write = TAKE_SCRIPT.find("redis.call('HSET'").unwrap();
        assert!(guard < write && persistent_check < write);
        assert!(TAKE_SCRIPT.contains(&u32::MAX.to_string()));
    }

    #[test]
    fn truncated_reply_is_an_error() {
        assert!(parse_take_reply("k", reply(&["ok", "1"])).is_err());
        assert!(parse_take_reply("k", Vec::new()).is_err());
    }

    #[test]
    fn script_reads_fields_in_reply_order() {
        for field in SCRIPT_FIELDS {
            assert!(TAKE_SCRIPT.contains(&format!("'{}'", field)), "script misses {field}");
        }
    }
}
