//! Redis-backed key queue shared across processes
//!
//! Layout under a namespace prefix:
//! - `{ns}:queue`: list of key identifiers in rotation order
//! - `{ns}:hash`: identifier to JSON-serialized `KeyRecord`
//! - `{ns}:count`: number of records seeded; its presence marks the
//!   namespace as initialized
//!
//! A dequeued key is a detached copy of the stored state, so an enqueue never
//! overwrites what is stored. It merges the incoming record into it inside
//! one Lua script. Per window the later `started_at` wins, and for the same
//! start the larger count. The later `last_used` wins too. A stale copy
//! coming back through `release` therefore cannot roll counters back.
//! Pop and read happen in one script as well, so a dropped connection never
//! leaves an identifier popped but unread.
//!
//! Seeding runs as a single Lua script and is skipped once the namespace
//! holds a pool: shared state wins over the locally configured key list.

use std::collections::HashSet;

use ::redis::AsyncCommands;
use ::redis::aio::ConnectionManager;
use tracing::{debug, info, warn};

use super::{KeyQueue, QueueFuture};
use crate::error::{Error, Result};
use crate::record::{KeyHandle, KeyRecord};

/// Seeds queue, hash and count atomically, unless the count marker exists.
///
/// KEYS: queue, hash, count. ARGV: id1, json1, id2, json2, ...
const SEED_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[3]) == 1 then
    return 0
end
for i = 1, #ARGV, 2 do
    redis.call('HSET', KEYS[2], ARGV[i], ARGV[i + 1])
    redis.call('RPUSH', KEYS[1], ARGV[i])
end
redis.call('SET', KEYS[3], #ARGV / 2)
return 1
"#;

/// Merges a record into its stored state, then queues its identifier.
/// Returns the merged JSON.
///
/// KEYS: queue, hash. ARGV: id, json.
///
/// Instants are chrono RFC 3339 strings in UTC; the fractional part is
/// padded so that seconds and nanoseconds compare correctly as strings.
const ENQUEUE_SCRIPT: &str = r#"
local function instant(s)
    if s == nil or s == cjson.null then
        return nil
    end
    local base, frac = string.match(s, '^(%d+%-%d+%-%d+T%d+:%d+:%d+)%.?(%d*)')
    if base == nil then
        return s
    end
    return base .. '.' .. frac .. string.rep('0', 9 - #frac)
end

local function compare(a, b)
    a, b = instant(a), instant(b)
    if a == b then
        return 0
    elseif a == nil then
        return -1
    elseif b == nil then
        return 1
    elseif a < b then
        return -1
    end
    return 1
end

local incoming = cjson.decode(ARGV[2])
local raw = redis.call('HGET', KEYS[2], ARGV[1])
if raw then
    local ok, stored = pcall(cjson.decode, raw)
    if ok then
        for _, window in ipairs({'minute', 'hour', 'day', 'month'}) do
            local s, i = stored[window], incoming[window]
            local order = compare(s.started_at, i.started_at)
            if order > 0 or (order == 0 and s.count > i.count) then
                incoming[window] = s
            end
        end
        if compare(stored.last_used, incoming.last_used) > 0 then
            incoming.last_used = stored.last_used
        end
    end
end

local merged = cjson.encode(incoming)
redis.call('HSET', KEYS[2], ARGV[1], merged)
redis.call('RPUSH', KEYS[1], ARGV[1])
return merged
"#;

/// Pops the head identifier and reads its state in one step.
///
/// KEYS: queue, hash. Returns nil for an empty queue, else {id, json or nil}.
const DEQUEUE_SCRIPT: &str = r#"
local id = redis.call('LPOP', KEYS[1])
if not id then
    return false
end
return {id, redis.call('HGET', KEYS[2], id)}
"#;

/// Store key names derived from a namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreKeys {
    pub queue: String,
    pub hash: String,
    pub count: String,
}

impl StoreKeys {
    pub fn new(namespace: &str) -> Self {
        Self {
            queue: format!("{namespace}:queue"),
            hash: format!("{namespace}:hash"),
            count: format!("{namespace}:count"),
        }
    }
}

/// Key queue stored in Redis.
///
/// `ConnectionManager` reconnects on its own; each operation clones it,
/// which is cheap and lets operations from many tasks pipeline over one
/// multiplexed connection.
pub struct RedisQueue {
    conn: ConnectionManager,
    namespace: String,
    keys: StoreKeys,
    enqueue_script: ::redis::Script,
    dequeue_script: ::redis::Script,
}

impl RedisQueue {
    /// Connect to the store at `url` and use the given namespace.
    pub async fn connect(url: &str, namespace: &str) -> Result<Self> {
        let client = ::redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!(namespace, "connected to shared key store");
        Ok(Self {
            conn,
            namespace: namespace.to_string(),
            keys: StoreKeys::new(namespace),
            enqueue_script: ::redis::Script::new(ENQUEUE_SCRIPT),
            dequeue_script: ::redis::Script::new(DEQUEUE_SCRIPT),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Initialize the shared pool with `records` if no pool exists yet.
    ///
    /// Returns true when this call seeded the store, false when an existing
    /// pool was found and left untouched. Duplicate identifiers collapse to
    /// the first occurrence.
    pub async fn seed(&self, records: &[KeyRecord]) -> Result<bool> {
        let script = ::redis::Script::new(SEED_SCRIPT);
        let mut invocation = script.prepare_invoke();
        invocation
            .key(&self.keys.queue)
            .key(&self.keys.hash)
            .key(&self.keys.count);

        let mut seen = HashSet::new();
        for record in records {
            if !seen.insert(record.id.as_str()) {
                debug!(key_id = record.id, "duplicate key identifier ignored");
                continue;
            }
            invocation.arg(&record.id).arg(encode(record)?);
        }

        let mut conn = self.conn.clone();
        let seeded: i64 = invocation.invoke_async(&mut conn).await?;
        if seeded == 1 {
            info!(keys = seen.len(), "seeded shared key store");
        } else {
            info!("shared key store already initialized, local key list ignored");
        }
        Ok(seeded == 1)
    }
}

fn encode(record: &KeyRecord) -> Result<String> {
    serde_json::to_string(record).map_err(|e| Error::Serialize(e.to_string()))
}

impl KeyQueue for RedisQueue {
    fn backend(&self) -> &'static str {
        "redis"
    }

    fn enqueue(&self, key: KeyHandle) -> QueueFuture<'_, ()> {
        Box::pin(async move {
            let json = encode(&key.snapshot().await)?;
            let mut conn = self.conn.clone();
            let merged: String = self
                .enqueue_script
                .key(&self.keys.queue)
                .key(&self.keys.hash)
                .arg(key.id())
                .arg(json)
                .invoke_async(&mut conn)
                .await?;

            // The caller's handle catches up with whatever the store already had.
            match serde_json::from_str::<KeyRecord>(&merged) {
                Ok(record) => *key.lock().await = record,
                Err(e) => warn!(key_id = key.id(), error = %e, "merged key state failed to deserialize"),
            }
            Ok(())
        })
    }

    fn dequeue(&self) -> QueueFuture<'_, Option<KeyHandle>> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let popped: Option<(String, Option<String>)> = self
                .dequeue_script
                .key(&self.keys.queue)
                .key(&self.keys.hash)
                .invoke_async(&mut conn)
                .await?;
            let Some((id, json)) = popped else {
                return Ok(None);
            };

            let Some(json) = json else {
                warn!(key_id = id, "queued key has no stored state");
                return Err(Error::CorruptRecord {
                    id,
                    reason: "no stored state".into(),
                });
            };

            match serde_json::from_str::<KeyRecord>(&json) {
                Ok(record) => Ok(Some(KeyHandle::new(record))),
                Err(e) => {
                    warn!(key_id = id, error = %e, "stored key state failed to deserialize");
                    Err(Error::CorruptRecord {
                        id,
                        reason: e.to_string(),
                    })
                }
            }
        })
    }

    fn contains<'a>(&'a self, key: &'a KeyHandle) -> QueueFuture<'a, bool> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let position: Option<i64> = ::redis::cmd("LPOS")
                .arg(&self.keys.queue)
                .arg(key.id())
                .query_async(&mut conn)
                .await?;
            Ok(position.is_some())
        })
    }

    fn count(&self) -> QueueFuture<'_, usize> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let queued: usize = conn.llen(&self.keys.queue).await?;
            Ok(queued)
        })
    }
}

#[cfg(test)]
impl RedisQueue {
    /// Remove every key this queue owns.
    async fn purge(&self) {
        use ::redis::AsyncCommands;
        let mut conn = self.conn.clone();
        let _: () = conn
            .del(&[&self.keys.queue, &self.keys.hash, &self.keys.count])
            .await
            .unwrap();
    }
}
