use std::{collections::BTreeMap, future::Future, time::Duration};

use async_trait::async_trait;
use redis::{ErrorKind, RedisError, RedisResult, Script, aio::MultiplexedConnection};
use tracing::warn;

use super::{
    ClaimedTask, CoordinationStore, EnqueueOutcome, IndexWrite, LeaderLockRecord, QueueDepth,
    RequeueReport, StoreError, StoreKeys,
};

const SWAP_AGENT: &str = r"
local current = redis.call('HGET', KEYS[1], ARGV[1])
if ARGV[2] == '1' then
  if current ~= ARGV[3] then
    return 0
  end
elseif current then
  return 0
end
redis.call('HSET', KEYS[1], ARGV[1], ARGV[4])
if ARGV[5] == 'upsert' then
  redis.call('ZADD', KEYS[2], ARGV[6], ARGV[1])
elseif ARGV[5] == 'remove' then
  redis.call('ZREM', KEYS[2], ARGV[1])
end
return 1
";

const DELETE_AGENT: &str = r"
redis.call('HDEL', KEYS[1], ARGV[1])
redis.call('ZREM', KEYS[2], ARGV[1])
return 1
";

const LEADER_ACQUIRE: &str = r"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return false
end
local fence = redis.call('INCR', KEYS[2])
local record = cjson.encode({ownerToken = ARGV[1], fenceToken = fence, instanceId = ARGV[2]})
redis.call('SET', KEYS[1], record, 'PX', ARGV[3])
return fence
";

const LEADER_RENEW: &str = r"
local raw = redis.call('GET', KEYS[1])
if not raw then
  return 0
end
local ok, record = pcall(cjson.decode, raw)
if not ok or type(record) ~= 'table' or record.ownerToken ~= ARGV[1] then
  return 0
end
redis.call('PEXPIRE', KEYS[1], ARGV[2])
return 1
";

const LEADER_RELEASE: &str = r"
local raw = redis.call('GET', KEYS[1])
if not raw then
  return 0
end
local ok, record = pcall(cjson.decode, raw)
if not ok or type(record) ~= 'table' or record.ownerToken ~= ARGV[1] then
  return 0
end
redis.call('DEL', KEYS[1])
return 1
";

const CLAIM_DUE_SLOT: &str = r"
if not redis.call('SET', KEYS[1], ARGV[1], 'NX', 'PX', ARGV[2]) then
  return 0
end
redis.call('ZADD', KEYS[2], 'XX', ARGV[4], ARGV[3])
return 1
";

const QUEUE_ENQUEUE: &str = r"
local depth = redis.call('LLEN', KEYS[1]) + redis.call('ZCARD', KEYS[2])
if depth >= tonumber(ARGV[3]) then
  return {0, depth}
end
redis.call('HSET', KEYS[3], ARGV[1], ARGV[2])
redis.call('LPUSH', KEYS[1], ARGV[1])
return {1, depth + 1}
";

const QUEUE_CLAIM: &str = r"
local id = redis.call('RPOPLPUSH', KEYS[1], KEYS[2])
if not id then
  return false
end
local payload = redis.call('HGET', KEYS[3], id)
redis.call('SET', ARGV[1] .. id, ARGV[2], 'PX', ARGV[3])
redis.call('ZADD', KEYS[4], tonumber(ARGV[4]) + tonumber(ARGV[3]), id)
if payload then
  return {id, payload}
end
return {id}
";

const QUEUE_ACK: &str = r"
local removed = redis.call('LREM', KEYS[1], 0, ARGV[1])
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('HDEL', KEYS[3], ARGV[1])
redis.call('DEL', KEYS[4])
return removed
";

const QUEUE_REQUEUE_EXPIRED: &str = r"
local ids = redis.call('ZRANGEBYSCORE', KEYS[4], '-inf', ARGV[2], 'LIMIT', 0, tonumber(ARGV[3]))
local requeued = {}
local dropped = {}
for _, id in ipairs(ids) do
  if redis.call('EXISTS', ARGV[1] .. id) == 0 then
    redis.call('LREM', KEYS[2], 0, id)
    redis.call('ZREM', KEYS[4], id)
    if redis.call('HEXISTS', KEYS[3], id) == 1 then
      redis.call('RPUSH', KEYS[1], id)
      table.insert(requeued, id)
    else
      table.insert(dropped, id)
    end
  end
end
return {requeued, dropped}
";

const QUEUE_PURGE_AGENT: &str = r"
local ids = redis.call('LRANGE', KEYS[1], 0, -1)
local purged = {}
for _, id in ipairs(ids) do
  local raw = redis.call('HGET', KEYS[2], id)
  if raw then
    local ok, task = pcall(cjson.decode, raw)
    if ok and type(task) == 'table' and task.queueKey == ARGV[1] then
      redis.call('LREM', KEYS[1], 0, id)
      redis.call('HDEL', KEYS[2], id)
      table.insert(purged, id)
    end
  end
end
return purged
";

const QUOTA_INCREMENT: &str = r"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return count
";

struct Scripts {
    swap_agent: Script,
    delete_agent: Script,
    leader_acquire: Script,
    leader_renew: Script,
    leader_release: Script,
    claim_due_slot: Script,
    queue_enqueue: Script,
    queue_claim: Script,
    queue_ack: Script,
    queue_requeue_expired: Script,
    queue_purge_agent: Script,
    quota_increment: Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            swap_agent: Script::new(SWAP_AGENT),
            delete_agent: Script::new(DELETE_AGENT),
            leader_acquire: Script::new(LEADER_ACQUIRE),
            leader_renew: Script::new(LEADER_RENEW),
            leader_release: Script::new(LEADER_RELEASE),
            claim_due_slot: Script::new(CLAIM_DUE_SLOT),
            queue_enqueue: Script::new(QUEUE_ENQUEUE),
            queue_claim: Script::new(QUEUE_CLAIM),
            queue_ack: Script::new(QUEUE_ACK),
            queue_requeue_expired: Script::new(QUEUE_REQUEUE_EXPIRED),
            queue_purge_agent: Script::new(QUEUE_PURGE_AGENT),
            quota_increment: Script::new(QUOTA_INCREMENT),
        }
    }
}

/// Redis-backed coordination store. Multi-key transitions run as Lua
/// scripts so each trait call stays a single atomic step on the server.
pub struct RedisCoordinationStore {
    connection: MultiplexedConnection,
    keys: StoreKeys,
    op_timeout: Duration,
    scripts: Scripts,
}

impl RedisCoordinationStore {
    pub async fn connect(
        redis_url: &str,
        keys: StoreKeys,
        op_timeout_ms: u64,
    ) -> Result<Self, StoreError> {
        let op_timeout = Duration::from_millis(op_timeout_ms.max(1));
        let client = redis::Client::open(redis_url).map_err(map_redis_error)?;
        let connection = match tokio::time::timeout(
            op_timeout,
            client.get_multiplexed_async_connection(),
        )
        .await
        {
            Ok(result) => result.map_err(map_redis_error)?,
            Err(_) => return Err(StoreError::Timeout { op: "connect" }),
        };
        let store = Self {
            connection,
            keys,
            op_timeout,
            scripts: Scripts::load(),
        };
        store.ping().await?;
        Ok(store)
    }

    async fn run<T, F>(&self, op: &'static str, future: F) -> Result<T, StoreError>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match tokio::time::timeout(self.op_timeout, future).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => {
                warn!(op, error = %error, "redis operation failed");
                Err(map_redis_error(error))
            }
            Err(_) => {
                warn!(op, timeout_ms = self.op_timeout.as_millis() as u64, "redis operation timed out");
                Err(StoreError::Timeout { op })
            }
        }
    }
}

/// Script arguments for an [`IndexWrite`]: mode name and score.
fn index_args(index: IndexWrite) -> (&'static str, u64) {
    match index {
        IndexWrite::Keep => ("keep", 0),
        IndexWrite::Upsert(next_run_at) => ("upsert", next_run_at),
        IndexWrite::Remove => ("remove", 0),
    }
}

fn map_redis_error(error: RedisError) -> StoreError {
    if error.is_timeout() {
        return StoreError::Timeout { op: "redis" };
    }
    if error.kind() == ErrorKind::IoError
        || error.is_connection_dropped()
        || error.is_connection_refusal()
    {
        return StoreError::Unavailable(error.to_string());
    }
    StoreError::Protocol(error.to_string())
}

#[async_trait]
impl CoordinationStore for RedisCoordinationStore {
    fn backend_name(&self) -> &'static str {
        "redis"
    }

    fn keys(&self) -> &StoreKeys {
        &self.keys
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let _pong: String = self
            .run("ping", redis::cmd("PING").query_async(&mut conn))
            .await?;
        Ok(())
    }

    async fn swap_agent(
        &self,
        agent_key: &str,
        expected: Option<&str>,
        record: &str,
        index: IndexWrite,
    ) -> Result<bool, StoreError> {
        let mut conn = self.connection.clone();
        let (mode, score) = index_args(index);
        self.run(
            "swap_agent",
            self.scripts
                .swap_agent
                .key(self.keys.agents())
                .key(self.keys.agent_schedule())
                .arg(agent_key)
                .arg(if expected.is_some() { "1" } else { "0" })
                .arg(expected.unwrap_or_default())
                .arg(record)
                .arg(mode)
                .arg(score)
                .invoke_async(&mut conn),
        )
        .await
    }

    async fn get_agent(&self, agent_key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection.clone();
        self.run(
            "get_agent",
            redis::cmd("HGET")
                .arg(self.keys.agents())
                .arg(agent_key)
                .query_async(&mut conn),
        )
        .await
    }

    async fn delete_agent(&self, agent_key: &str) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let _deleted: i64 = self
            .run(
                "delete_agent",
                self.scripts
                    .delete_agent
                    .key(self.keys.agents())
                    .key(self.keys.agent_schedule())
                    .arg(agent_key)
                    .invoke_async(&mut conn),
            )
            .await?;
        Ok(())
    }

    async fn list_agents(&self) -> Result<Vec<(String, String)>, StoreError> {
        let mut conn = self.connection.clone();
        let records: BTreeMap<String, String> = self
            .run(
                "list_agents",
                redis::cmd("HGETALL")
                    .arg(self.keys.agents())
                    .query_async(&mut conn),
            )
            .await?;
        Ok(records.into_iter().collect())
    }

    async fn schedule_remove(&self, agent_key: &str) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let _removed: i64 = self
            .run(
                "schedule_remove",
                redis::cmd("ZREM")
                    .arg(self.keys.agent_schedule())
                    .arg(agent_key)
                    .query_async(&mut conn),
            )
            .await?;
        Ok(())
    }

    async fn schedule_due(&self, now_ms: u64, limit: usize) -> Result<Vec<String>, StoreError> {
        let mut conn = self.connection.clone();
        self.run(
            "schedule_due",
            redis::cmd("ZRANGEBYSCORE")
                .arg(self.keys.agent_schedule())
                .arg("-inf")
                .arg(now_ms)
                .arg("LIMIT")
                .arg(0)
                .arg(limit)
                .query_async(&mut conn),
        )
        .await
    }

    async fn claim_due_slot(
        &self,
        agent_key: &str,
        owner: &str,
        lease_ttl_ms: u64,
        now_ms: u64,
    ) -> Result<bool, StoreError> {
        let mut conn = self.connection.clone();
        self.run(
            "claim_due_slot",
            self.scripts
                .claim_due_slot
                .key(self.keys.lease(agent_key))
                .key(self.keys.agent_schedule())
                .arg(owner)
                .arg(lease_ttl_ms)
                .arg(agent_key)
                .arg(now_ms.saturating_add(lease_ttl_ms))
                .invoke_async(&mut conn),
        )
        .await
    }

    async fn release_due_slot(&self, agent_key: &str) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let _removed: i64 = self
            .run(
                "release_due_slot",
                redis::cmd("DEL")
                    .arg(self.keys.lease(agent_key))
                    .query_async(&mut conn),
            )
            .await?;
        Ok(())
    }

    async fn leader_acquire(
        &self,
        owner_token: &str,
        instance_id: &str,
        ttl_ms: u64,
    ) -> Result<Option<u64>, StoreError> {
        let mut conn = self.connection.clone();
        self.run(
            "leader_acquire",
            self.scripts
                .leader_acquire
                .key(self.keys.leader_lock())
                .key(self.keys.leader_fence())
                .arg(owner_token)
                .arg(instance_id)
                .arg(ttl_ms)
                .invoke_async(&mut conn),
        )
        .await
    }

    async fn leader_renew(&self, owner_token: &str, ttl_ms: u64) -> Result<bool, StoreError> {
        let mut conn = self.connection.clone();
        self.run(
            "leader_renew",
            self.scripts
                .leader_renew
                .key(self.keys.leader_lock())
                .arg(owner_token)
                .arg(ttl_ms)
                .invoke_async(&mut conn),
        )
        .await
    }

    async fn leader_release(&self, owner_token: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection.clone();
        self.run(
            "leader_release",
            self.scripts
                .leader_release
                .key(self.keys.leader_lock())
                .arg(owner_token)
                .invoke_async(&mut conn),
        )
        .await
    }

    async fn leader_current(&self) -> Result<Option<LeaderLockRecord>, StoreError> {
        let mut conn = self.connection.clone();
        let raw: Option<String> = self
            .run(
                "leader_current",
                redis::cmd("GET")
                    .arg(self.keys.leader_lock())
                    .query_async(&mut conn),
            )
            .await?;
        Ok(raw.and_then(|raw| serde_json::from_str(&raw).ok()))
    }

    async fn queue_enqueue(
        &self,
        task_id: &str,
        payload: &str,
        max_depth: usize,
    ) -> Result<EnqueueOutcome, StoreError> {
        let mut conn = self.connection.clone();
        let (accepted, depth): (i64, usize) = self
            .run(
                "queue_enqueue",
                self.scripts
                    .queue_enqueue
                    .key(self.keys.cycle_queue())
                    .key(self.keys.cycle_queue_inflight())
                    .key(self.keys.cycle_queue_payloads())
                    .arg(task_id)
                    .arg(payload)
                    .arg(max_depth)
                    .invoke_async(&mut conn),
            )
            .await?;
        Ok(if accepted == 1 {
            EnqueueOutcome::Enqueued { depth }
        } else {
            EnqueueOutcome::Full { depth }
        })
    }

    async fn queue_claim(
        &self,
        worker_id: &str,
        lease_ttl_ms: u64,
        now_ms: u64,
    ) -> Result<Option<ClaimedTask>, StoreError> {
        let mut conn = self.connection.clone();
        let claimed: Option<Vec<String>> = self
            .run(
                "queue_claim",
                self.scripts
                    .queue_claim
                    .key(self.keys.cycle_queue())
                    .key(self.keys.cycle_queue_processing())
                    .key(self.keys.cycle_queue_payloads())
                    .key(self.keys.cycle_queue_inflight())
                    .arg(self.keys.exec_lease_prefix())
                    .arg(worker_id)
                    .arg(lease_ttl_ms)
                    .arg(now_ms)
                    .invoke_async(&mut conn),
            )
            .await?;
        let Some(mut parts) = claimed else {
            return Ok(None);
        };
        if parts.is_empty() {
            return Err(StoreError::Protocol(
                "queue claim returned an empty reply".to_string(),
            ));
        }
        let task_id = parts.remove(0);
        Ok(Some(ClaimedTask {
            task_id,
            payload: parts.into_iter().next(),
        }))
    }

    async fn queue_ack(&self, task_id: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection.clone();
        let removed: i64 = self
            .run(
                "queue_ack",
                self.scripts
                    .queue_ack
                    .key(self.keys.cycle_queue_processing())
                    .key(self.keys.cycle_queue_inflight())
                    .key(self.keys.cycle_queue_payloads())
                    .key(self.keys.exec_lease(task_id))
                    .arg(task_id)
                    .invoke_async(&mut conn),
            )
            .await?;
        Ok(removed > 0)
    }

    async fn queue_requeue_expired(
        &self,
        now_ms: u64,
        limit: usize,
    ) -> Result<RequeueReport, StoreError> {
        let mut conn = self.connection.clone();
        let (requeued, dropped): (Vec<String>, Vec<String>) = self
            .run(
                "queue_requeue_expired",
                self.scripts
                    .queue_requeue_expired
                    .key(self.keys.cycle_queue())
                    .key(self.keys.cycle_queue_processing())
                    .key(self.keys.cycle_queue_payloads())
                    .key(self.keys.cycle_queue_inflight())
                    .arg(self.keys.exec_lease_prefix())
                    .arg(now_ms)
                    .arg(limit)
                    .invoke_async(&mut conn),
            )
            .await?;
        Ok(RequeueReport { requeued, dropped })
    }

    async fn queue_purge_agent(&self, agent_key: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.connection.clone();
        self.run(
            "queue_purge_agent",
            self.scripts
                .queue_purge_agent
                .key(self.keys.cycle_queue())
                .key(self.keys.cycle_queue_payloads())
                .arg(agent_key)
                .invoke_async(&mut conn),
        )
        .await
    }

    async fn queue_depth(&self) -> Result<QueueDepth, StoreError> {
        let mut conn = self.connection.clone();
        let (ready, processing, inflight): (usize, usize, usize) = self
            .run(
                "queue_depth",
                redis::pipe()
                    .atomic()
                    .cmd("LLEN")
                    .arg(self.keys.cycle_queue())
                    .cmd("LLEN")
                    .arg(self.keys.cycle_queue_processing())
                    .cmd("ZCARD")
                    .arg(self.keys.cycle_queue_inflight())
                    .query_async(&mut conn),
            )
            .await?;
        Ok(QueueDepth {
            ready,
            processing,
            inflight,
        })
    }

    async fn dedupe_check_and_set(&self, key: &str, ttl_ms: u64) -> Result<bool, StoreError> {
        let mut conn = self.connection.clone();
        let set: Option<String> = self
            .run(
                "dedupe_check_and_set",
                redis::cmd("SET")
                    .arg(self.keys.callback_dedupe(key))
                    .arg("1")
                    .arg("NX")
                    .arg("PX")
                    .arg(ttl_ms)
                    .query_async(&mut conn),
            )
            .await?;
        Ok(set.is_some())
    }

    async fn dedupe_release(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let _removed: i64 = self
            .run(
                "dedupe_release",
                redis::cmd("DEL")
                    .arg(self.keys.callback_dedupe(key))
                    .query_async(&mut conn),
            )
            .await?;
        Ok(())
    }

    async fn quota_increment(&self, key: &str, window_ms: u64) -> Result<u64, StoreError> {
        let mut conn = self.connection.clone();
        self.run(
            "quota_increment",
            self.scripts
                .quota_increment
                .key(key)
                .arg(window_ms)
                .invoke_async(&mut conn),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use redis::{ErrorKind, RedisError};

    use super::{index_args, map_redis_error};
    use crate::store::{IndexWrite, StoreError};

    #[test]
    fn index_writes_encode_as_script_modes() {
        assert_eq!(index_args(IndexWrite::Keep), ("keep", 0));
        assert_eq!(index_args(IndexWrite::Upsert(42)), ("upsert", 42));
        assert_eq!(index_args(IndexWrite::Remove), ("remove", 0));
    }

    #[test]
    fn io_failures_map_to_unavailable() {
        let error = RedisError::from((ErrorKind::IoError, "connection reset"));
        assert!(matches!(map_redis_error(error), StoreError::Unavailable(_)));
    }

    #[test]
    fn script_failures_map_to_protocol_errors() {
        let error = RedisError::from((ErrorKind::TypeError, "unexpected reply"));
        assert!(matches!(map_redis_error(error), StoreError::Protocol(_)));
    }
}
