//! Redis `StateStore` backend.
//!
//! Key layout and TTLs follow [`crate::keys::Keyspace`] and
//! [`crate::traits::StoreConfig`].  The three portable primitives map onto
//! native Redis features: `SET NX PX` for the lock lease, a Lua script for
//! compare-and-delete / compare-and-extend, and a sorted set for the retry
//! schedule.  Batch writes go through a pipeline.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::aio::ConnectionManager;
use redis::Script;
use std::collections::HashMap;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

use model::{
    CircuitRecord, CircuitState, ErrorLogEntry, NodeState, RetryScheduleEntry, WorkflowState,
};

use crate::error::StoreError;
use crate::keys::Keyspace;
use crate::traits::{StateStore, StoreConfig};

/// `if GET(key) == holder then DEL(key)` — release only by the holder.
const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

/// `if GET(key) == holder then PEXPIRE(key, ttl)` — renew only by the holder.
const RENEW_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
else
    return 0
end
"#;

pub struct RedisStore {
    conn: ConnectionManager,
    config: StoreConfig,
    keys: Keyspace,
    release_script: Script,
    renew_script: Script,
}

impl RedisStore {
    /// Connect to Redis and hold a self-reconnecting connection manager.
    pub async fn connect(url: &str, config: StoreConfig) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        let keys = Keyspace::new(config.namespace.clone());
        Ok(Self {
            conn,
            config,
            keys,
            release_script: Script::new(RELEASE_SCRIPT),
            renew_script: Script::new(RENEW_SCRIPT),
        })
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl.as_secs())
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    /// Read one key, degrading transport and decode failures to `None`.
    async fn read_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = match redis::cmd("GET").arg(key).query_async(&mut conn).await {
            Ok(raw) => raw,
            Err(err) => {
                warn!(key, error = %err, "store read failed; degrading to empty");
                return None;
            }
        };
        let raw = raw?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(key, error = %err, "stored value failed to decode; degrading to empty");
                None
            }
        }
    }

    /// Collect keys matching a pattern via SCAN, degrading errors to empty.
    async fn scan_keys(&self, pattern: &str) -> Vec<String> {
        let mut conn = self.conn.clone();
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let page: Result<(u64, Vec<String>), redis::RedisError> = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await;
            match page {
                Ok((next, mut batch)) => {
                    keys.append(&mut batch);
                    if next == 0 {
                        break;
                    }
                    cursor = next;
                }
                Err(err) => {
                    warn!(pattern, error = %err, "store scan failed; degrading to empty");
                    return Vec::new();
                }
            }
        }
        keys
    }
}

#[async_trait]
impl StateStore for RedisStore {
    async fn get_workflow_state(&self, run_id: Uuid) -> Result<Option<WorkflowState>, StoreError> {
        Ok(self.read_json(&self.keys.workflow(run_id)).await)
    }

    async fn put_workflow_state(&self, state: &WorkflowState) -> Result<(), StoreError> {
        let raw = serde_json::to_string(state)?;
        self.set_with_ttl(&self.keys.workflow(state.run_id), &raw, self.config.run_ttl)
            .await
    }

    async fn delete_workflow_state(&self, run_id: Uuid) -> Result<(), StoreError> {
        let mut targets = self.scan_keys(&self.keys.node_pattern(run_id)).await;
        targets.push(self.keys.workflow(run_id));
        targets.push(self.keys.lock(run_id));

        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(&targets)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn list_run_ids(&self) -> Result<Vec<Uuid>, StoreError> {
        Ok(self
            .scan_keys(&self.keys.workflow_pattern())
            .await
            .iter()
            .filter_map(|key| self.keys.run_id_of(key))
            .collect())
    }

    async fn get_node_state(
        &self,
        run_id: Uuid,
        node_id: &str,
    ) -> Result<Option<NodeState>, StoreError> {
        Ok(self.read_json(&self.keys.node(run_id, node_id)).await)
    }

    async fn put_node_state(&self, state: &NodeState) -> Result<(), StoreError> {
        let raw = serde_json::to_string(state)?;
        self.set_with_ttl(
            &self.keys.node(state.run_id, &state.node_id),
            &raw,
            self.config.node_ttl,
        )
        .await
    }

    async fn get_all_node_states(&self, run_id: Uuid) -> Result<Vec<NodeState>, StoreError> {
        let keys = self.scan_keys(&self.keys.node_pattern(run_id)).await;
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.conn.clone();
        let raws: Vec<Option<String>> = match redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await
        {
            Ok(raws) => raws,
            Err(err) => {
                warn!(%run_id, error = %err, "node state batch read failed; degrading to empty");
                return Ok(Vec::new());
            }
        };

        Ok(raws
            .into_iter()
            .flatten()
            .filter_map(|raw| serde_json::from_str(&raw).ok())
            .collect())
    }

    async fn batch_put_node_states(&self, states: &[NodeState]) -> Result<(), StoreError> {
        if states.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        for state in states {
            let raw = serde_json::to_string(state)?;
            pipe.cmd("SET")
                .arg(self.keys.node(state.run_id, &state.node_id))
                .arg(raw)
                .arg("EX")
                .arg(self.config.node_ttl.as_secs())
                .ignore();
        }

        let mut conn = self.conn.clone();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn acquire_lock(
        &self,
        run_id: Uuid,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let outcome: Option<String> = redis::cmd("SET")
            .arg(self.keys.lock(run_id))
            .arg(holder)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(outcome.is_some())
    }

    async fn renew_lock(
        &self,
        run_id: Uuid,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let renewed: i64 = self
            .renew_script
            .key(self.keys.lock(run_id))
            .arg(holder)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;
        Ok(renewed == 1)
    }

    async fn release_lock(&self, run_id: Uuid, holder: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .release_script
            .key(self.keys.lock(run_id))
            .arg(holder)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }

    async fn lock_holder(&self, run_id: Uuid) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        match redis::cmd("GET")
            .arg(self.keys.lock(run_id))
            .query_async(&mut conn)
            .await
        {
            Ok(holder) => Ok(holder),
            Err(err) => {
                warn!(%run_id, error = %err, "lock read failed; degrading to empty");
                Ok(None)
            }
        }
    }

    async fn schedule_retry(
        &self,
        run_id: Uuid,
        node_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let entry = RetryScheduleEntry {
            run_id,
            node_id: node_id.to_string(),
            score: at.timestamp_millis(),
        };

        let mut conn = self.conn.clone();
        redis::pipe()
            .cmd("ZADD")
            .arg(self.keys.retry_schedule())
            .arg(entry.score)
            .arg(entry.member())
            .ignore()
            .cmd("EXPIRE")
            .arg(self.keys.retry_schedule())
            .arg(self.config.schedule_ttl.as_secs())
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn due_retries(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RetryScheduleEntry>, StoreError> {
        let mut conn = self.conn.clone();
        let rows: Vec<(String, i64)> = match redis::cmd("ZRANGEBYSCORE")
            .arg(self.keys.retry_schedule())
            .arg("-inf")
            .arg(now.timestamp_millis())
            .arg("WITHSCORES")
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut conn)
            .await
        {
            Ok(rows) => rows,
            Err(err) => {
                warn!(error = %err, "retry schedule read failed; degrading to empty");
                return Ok(Vec::new());
            }
        };

        Ok(rows
            .into_iter()
            .filter_map(|(member, score)| RetryScheduleEntry::parse_member(&member, score))
            .collect())
    }

    async fn remove_from_retry_schedule(
        &self,
        run_id: Uuid,
        node_id: &str,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("ZREM")
            .arg(self.keys.retry_schedule())
            .arg(format!("{run_id}:{node_id}"))
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn all_scheduled_retries(&self) -> Result<Vec<RetryScheduleEntry>, StoreError> {
        let mut conn = self.conn.clone();
        let rows: Vec<(String, i64)> = match redis::cmd("ZRANGEBYSCORE")
            .arg(self.keys.retry_schedule())
            .arg("-inf")
            .arg("+inf")
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await
        {
            Ok(rows) => rows,
            Err(err) => {
                warn!(error = %err, "retry schedule read failed; degrading to empty");
                return Ok(Vec::new());
            }
        };

        Ok(rows
            .into_iter()
            .filter_map(|(member, score)| RetryScheduleEntry::parse_member(&member, score))
            .collect())
    }

    async fn get_circuit(&self, service: &str) -> Result<Option<CircuitRecord>, StoreError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = match redis::cmd("HGETALL")
            .arg(self.keys.circuit(service))
            .query_async(&mut conn)
            .await
        {
            Ok(fields) => fields,
            Err(err) => {
                warn!(service, error = %err, "circuit read failed; degrading to empty");
                return Ok(None);
            }
        };
        if fields.is_empty() {
            return Ok(None);
        }

        let millis = |name: &str| -> Option<DateTime<Utc>> {
            fields
                .get(name)
                .and_then(|raw| raw.parse::<i64>().ok())
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        };
        let count = |name: &str| -> u32 {
            fields
                .get(name)
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(0)
        };

        Ok(Some(CircuitRecord {
            state: fields
                .get("state")
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(CircuitState::Closed),
            failure_count: count("failure_count"),
            success_count: count("success_count"),
            total_requests: count("total_requests"),
            last_failure_at: millis("last_failure_at"),
            next_retry_at: millis("next_retry_at"),
        }))
    }

    async fn put_circuit(&self, service: &str, record: &CircuitRecord) -> Result<(), StoreError> {
        let key = self.keys.circuit(service);
        let mut pipe = redis::pipe();
        pipe.cmd("HSET")
            .arg(&key)
            .arg("state")
            .arg(record.state.to_string())
            .arg("failure_count")
            .arg(record.failure_count)
            .arg("success_count")
            .arg(record.success_count)
            .arg("total_requests")
            .arg(record.total_requests)
            .ignore();
        // Optional timestamps are deleted when unset so a reopened record
        // never reads a stale recovery deadline.
        match record.last_failure_at {
            Some(at) => pipe
                .cmd("HSET")
                .arg(&key)
                .arg("last_failure_at")
                .arg(at.timestamp_millis())
                .ignore(),
            None => pipe.cmd("HDEL").arg(&key).arg("last_failure_at").ignore(),
        };
        match record.next_retry_at {
            Some(at) => pipe
                .cmd("HSET")
                .arg(&key)
                .arg("next_retry_at")
                .arg(at.timestamp_millis())
                .ignore(),
            None => pipe.cmd("HDEL").arg(&key).arg("next_retry_at").ignore(),
        };
        pipe.cmd("EXPIRE")
            .arg(&key)
            .arg(self.config.circuit_ttl.as_secs())
            .ignore();

        let mut conn = self.conn.clone();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn append_error_log(&self, entry: &ErrorLogEntry) -> Result<(), StoreError> {
        let raw = serde_json::to_string(entry)?;
        self.set_with_ttl(
            &self.keys.error_log(entry.timestamp, entry.id),
            &raw,
            self.config.error_log_ttl,
        )
        .await
    }
}
