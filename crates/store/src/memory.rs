//! In-memory `StateStore` backend.
//!
//! Single-process stand-in for the production Redis backend, used by the
//! test suites and the CLI simulator.  TTLs are honoured lazily against the
//! injected [`Clock`] so tests can expire leases without sleeping.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use model::{CircuitRecord, Clock, ErrorLogEntry, NodeState, RetryScheduleEntry, WorkflowState};

use crate::error::StoreError;
use crate::keys::Keyspace;
use crate::traits::{StateStore, StoreConfig};

struct Entry {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

struct LockEntry {
    holder: String,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct Schedule {
    by_score: BTreeSet<(i64, String)>,
    by_member: HashMap<String, i64>,
}

impl Schedule {
    fn upsert(&mut self, member: String, score: i64) {
        if let Some(old) = self.by_member.insert(member.clone(), score) {
            self.by_score.remove(&(old, member.clone()));
        }
        self.by_score.insert((score, member));
    }

    fn remove(&mut self, member: &str) {
        if let Some(score) = self.by_member.remove(member) {
            self.by_score.remove(&(score, member.to_string()));
        }
    }
}

pub struct MemoryStore {
    config: StoreConfig,
    keys: Keyspace,
    clock: Arc<dyn Clock>,
    values: DashMap<String, Entry>,
    locks: DashMap<String, LockEntry>,
    schedule: Mutex<Schedule>,
}

impl MemoryStore {
    pub fn new(config: StoreConfig, clock: Arc<dyn Clock>) -> Self {
        let keys = Keyspace::new(config.namespace.clone());
        Self {
            config,
            keys,
            clock,
            values: DashMap::new(),
            locks: DashMap::new(),
            schedule: Mutex::new(Schedule::default()),
        }
    }

    fn expiry(&self, ttl: Duration) -> Option<DateTime<Utc>> {
        Some(self.clock.now() + chrono::Duration::from_std(ttl).ok()?)
    }

    fn get_live(&self, key: &str) -> Option<String> {
        let now = self.clock.now();
        let expired = match self.values.get(key) {
            Some(entry) => match entry.expires_at {
                Some(at) if at <= now => true,
                _ => return Some(entry.value.clone()),
            },
            None => return None,
        };
        if expired {
            self.values.remove(key);
        }
        None
    }

    fn put(&self, key: String, value: String, ttl: Duration) {
        let expires_at = self.expiry(ttl);
        self.values.insert(key, Entry { value, expires_at });
    }

    fn live_keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let now = self.clock.now();
        self.values
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .filter(|entry| entry.value().expires_at.map_or(true, |at| at > now))
            .map(|entry| entry.key().clone())
            .collect()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get_workflow_state(&self, run_id: Uuid) -> Result<Option<WorkflowState>, StoreError> {
        match self.get_live(&self.keys.workflow(run_id)) {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn put_workflow_state(&self, state: &WorkflowState) -> Result<(), StoreError> {
        let raw = serde_json::to_string(state)?;
        self.put(self.keys.workflow(state.run_id), raw, self.config.run_ttl);
        Ok(())
    }

    async fn delete_workflow_state(&self, run_id: Uuid) -> Result<(), StoreError> {
        self.values.remove(&self.keys.workflow(run_id));
        let node_prefix = self.keys.node_pattern(run_id);
        let node_prefix = node_prefix.trim_end_matches('*');
        let node_keys: Vec<String> = self
            .values
            .iter()
            .filter(|entry| entry.key().starts_with(node_prefix))
            .map(|entry| entry.key().clone())
            .collect();
        for key in node_keys {
            self.values.remove(&key);
        }
        self.locks.remove(&self.keys.lock(run_id));
        Ok(())
    }

    async fn list_run_ids(&self) -> Result<Vec<Uuid>, StoreError> {
        let prefix = self.keys.workflow_pattern();
        let prefix = prefix.trim_end_matches('*');
        Ok(self
            .live_keys_with_prefix(prefix)
            .iter()
            .filter_map(|key| self.keys.run_id_of(key))
            .collect())
    }

    async fn get_node_state(
        &self,
        run_id: Uuid,
        node_id: &str,
    ) -> Result<Option<NodeState>, StoreError> {
        match self.get_live(&self.keys.node(run_id, node_id)) {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn put_node_state(&self, state: &NodeState) -> Result<(), StoreError> {
        let raw = serde_json::to_string(state)?;
        self.put(
            self.keys.node(state.run_id, &state.node_id),
            raw,
            self.config.node_ttl,
        );
        Ok(())
    }

    async fn get_all_node_states(&self, run_id: Uuid) -> Result<Vec<NodeState>, StoreError> {
        let prefix = self.keys.node_pattern(run_id);
        let prefix = prefix.trim_end_matches('*');
        let mut states = Vec::new();
        for key in self.live_keys_with_prefix(prefix) {
            if let Some(raw) = self.get_live(&key) {
                states.push(serde_json::from_str(&raw)?);
            }
        }
        Ok(states)
    }

    async fn batch_put_node_states(&self, states: &[NodeState]) -> Result<(), StoreError> {
        for state in states {
            self.put_node_state(state).await?;
        }
        Ok(())
    }

    async fn acquire_lock(
        &self,
        run_id: Uuid,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let expires_at = self
            .expiry(ttl)
            .ok_or_else(|| StoreError::Backend("lock ttl out of range".into()))?;

        // The dashmap entry guard makes check-then-set atomic.
        match self.locks.entry(self.keys.lock(run_id)) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                if occupied.get().expires_at > now {
                    return Ok(false);
                }
                occupied.insert(LockEntry {
                    holder: holder.to_string(),
                    expires_at,
                });
                Ok(true)
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(LockEntry {
                    holder: holder.to_string(),
                    expires_at,
                });
                Ok(true)
            }
        }
    }

    async fn renew_lock(
        &self,
        run_id: Uuid,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let expires_at = self
            .expiry(ttl)
            .ok_or_else(|| StoreError::Backend("lock ttl out of range".into()))?;

        match self.locks.entry(self.keys.lock(run_id)) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                let entry = occupied.get();
                if entry.holder != holder || entry.expires_at <= now {
                    return Ok(false);
                }
                occupied.get_mut().expires_at = expires_at;
                Ok(true)
            }
            dashmap::mapref::entry::Entry::Vacant(_) => Ok(false),
        }
    }

    async fn release_lock(&self, run_id: Uuid, holder: &str) -> Result<bool, StoreError> {
        match self.locks.entry(self.keys.lock(run_id)) {
            dashmap::mapref::entry::Entry::Occupied(occupied) => {
                if occupied.get().holder == holder {
                    occupied.remove();
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            dashmap::mapref::entry::Entry::Vacant(_) => Ok(false),
        }
    }

    async fn lock_holder(&self, run_id: Uuid) -> Result<Option<String>, StoreError> {
        let now = self.clock.now();
        Ok(self
            .locks
            .get(&self.keys.lock(run_id))
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.holder.clone()))
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
        self.schedule.lock().upsert(entry.member(), entry.score);
        Ok(())
    }

    async fn due_retries(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RetryScheduleEntry>, StoreError> {
        let cutoff = now.timestamp_millis();
        let schedule = self.schedule.lock();
        Ok(schedule
            .by_score
            .iter()
            .take_while(|(score, _)| *score <= cutoff)
            .take(limit)
            .filter_map(|(score, member)| RetryScheduleEntry::parse_member(member, *score))
            .collect())
    }

    async fn remove_from_retry_schedule(
        &self,
        run_id: Uuid,
        node_id: &str,
    ) -> Result<(), StoreError> {
        let member = format!("{run_id}:{node_id}");
        self.schedule.lock().remove(&member);
        Ok(())
    }

    async fn all_scheduled_retries(&self) -> Result<Vec<RetryScheduleEntry>, StoreError> {
        let schedule = self.schedule.lock();
        Ok(schedule
            .by_score
            .iter()
            .filter_map(|(score, member)| RetryScheduleEntry::parse_member(member, *score))
            .collect())
    }

    async fn get_circuit(&self, service: &str) -> Result<Option<CircuitRecord>, StoreError> {
        match self.get_live(&self.keys.circuit(service)) {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn put_circuit(&self, service: &str, record: &CircuitRecord) -> Result<(), StoreError> {
        let raw = serde_json::to_string(record)?;
        self.put(self.keys.circuit(service), raw, self.config.circuit_ttl);
        Ok(())
    }

    async fn append_error_log(&self, entry: &ErrorLogEntry) -> Result<(), StoreError> {
        let raw = serde_json::to_string(entry)?;
        self.put(
            self.keys.error_log(entry.timestamp, entry.id),
            raw,
            self.config.error_log_ttl,
        );
        Ok(())
    }
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use model::{ExecutionContext, ManualClock, NodeStatus};

    fn store_with_clock() -> (MemoryStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        (
            MemoryStore::new(StoreConfig::default(), clock.clone()),
            clock,
        )
    }

    #[tokio::test]
    async fn workflow_state_round_trips() {
        let (store, clock) = store_with_clock();
        let run_id = Uuid::new_v4();
        let state = WorkflowState::new(run_id, "wf-1", ExecutionContext::default(), clock.now());

        store.put_workflow_state(&state).await.unwrap();
        let loaded = store.get_workflow_state(run_id).await.unwrap().unwrap();
        assert_eq!(loaded.workflow_id, "wf-1");
        assert!(store.list_run_ids().await.unwrap().contains(&run_id));
    }

    #[tokio::test]
    async fn state_expires_after_run_ttl() {
        let (store, clock) = store_with_clock();
        let run_id = Uuid::new_v4();
        let state = WorkflowState::new(run_id, "wf-1", ExecutionContext::default(), clock.now());
        store.put_workflow_state(&state).await.unwrap();

        clock.advance_millis(86_400_001);
        assert!(store.get_workflow_state(run_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn node_states_are_enumerable_per_run() {
        let (store, _) = store_with_clock();
        let run_id = Uuid::new_v4();
        let other_run = Uuid::new_v4();

        for node_id in ["a", "b"] {
            store
                .put_node_state(&NodeState::queued(run_id, node_id))
                .await
                .unwrap();
        }
        store
            .put_node_state(&NodeState::queued(other_run, "c"))
            .await
            .unwrap();

        let states = store.get_all_node_states(run_id).await.unwrap();
        assert_eq!(states.len(), 2);
        assert!(states.iter().all(|s| s.status == NodeStatus::Queued));
    }

    #[tokio::test]
    async fn due_retries_respects_score_and_limit() {
        let (store, clock) = store_with_clock();
        let run_id = Uuid::new_v4();
        let now = clock.now();

        store
            .schedule_retry(run_id, "late", now + chrono::Duration::seconds(60))
            .await
            .unwrap();
        store
            .schedule_retry(run_id, "due-2", now - chrono::Duration::seconds(1))
            .await
            .unwrap();
        store
            .schedule_retry(run_id, "due-1", now - chrono::Duration::seconds(5))
            .await
            .unwrap();

        let due = store.due_retries(now, 10).await.unwrap();
        let ids: Vec<&str> = due.iter().map(|e| e.node_id.as_str()).collect();
        assert_eq!(ids, vec!["due-1", "due-2"]);

        let capped = store.due_retries(now, 1).await.unwrap();
        assert_eq!(capped.len(), 1);
        assert_eq!(capped[0].node_id, "due-1");
    }

    #[tokio::test]
    async fn schedule_upsert_replaces_previous_score() {
        let (store, clock) = store_with_clock();
        let run_id = Uuid::new_v4();
        let now = clock.now();

        store.schedule_retry(run_id, "n", now).await.unwrap();
        store
            .schedule_retry(run_id, "n", now + chrono::Duration::seconds(30))
            .await
            .unwrap();

        assert_eq!(store.all_scheduled_retries().await.unwrap().len(), 1);
        assert!(store.due_retries(now, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_run_removes_state_nodes_and_lock() {
        let (store, clock) = store_with_clock();
        let run_id = Uuid::new_v4();
        let state = WorkflowState::new(run_id, "wf-1", ExecutionContext::default(), clock.now());

        store.put_workflow_state(&state).await.unwrap();
        store
            .put_node_state(&NodeState::queued(run_id, "a"))
            .await
            .unwrap();
        store
            .acquire_lock(run_id, "engine-a", Duration::from_secs(300))
            .await
            .unwrap();

        store.delete_workflow_state(run_id).await.unwrap();

        assert!(store.get_workflow_state(run_id).await.unwrap().is_none());
        assert!(store.get_all_node_states(run_id).await.unwrap().is_empty());
        assert!(store.lock_holder(run_id).await.unwrap().is_none());
    }
}
