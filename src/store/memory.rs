//! # In-Memory Store
//!
//! Process-local [`KvStore`] with TTL support. All keys sit behind one mutex so
//! multi-key operations (indexed writes, the rate-limit steps) are atomic the
//! same way a Redis transaction is. Expired entries are dropped lazily on access
//! and by [`MemoryStore::purge_expired`], which the rate limiter's cleanup task
//! runs through [`KvStore::sweep_expired`].

use super::{
    token_bucket_step, BucketState, IndexedWrite, KvStore, StoreError, StoreResult,
    TokenBucketOutcome, TokenBucketParams,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    ZSet(HashMap<String, f64>),
    Set(HashSet<String>),
    Bucket(BucketState),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map_or(false, |at| at <= now)
    }
}

/// In-memory store implementation
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: Mutex<HashMap<String, Entry>>,
}

fn live<'a>(data: &'a mut HashMap<String, Entry>, key: &str) -> Option<&'a mut Entry> {
    let now = Instant::now();
    if data.get(key).map_or(false, |e| e.is_expired(now)) {
        data.remove(key);
    }
    data.get_mut(key)
}

fn zset_mut<'a>(data: &'a mut HashMap<String, Entry>, key: &str) -> StoreResult<&'a mut HashMap<String, f64>> {
    if live(data, key).is_none() {
        data.insert(key.to_string(), Entry::new(Value::ZSet(HashMap::new())));
    }
    match data.get_mut(key).map(|e| &mut e.value) {
        Some(Value::ZSet(set)) => Ok(set),
        _ => Err(StoreError::WrongType(key.to_string())),
    }
}

fn set_mut<'a>(data: &'a mut HashMap<String, Entry>, key: &str) -> StoreResult<&'a mut HashSet<String>> {
    if live(data, key).is_none() {
        data.insert(key.to_string(), Entry::new(Value::Set(HashSet::new())));
    }
    match data.get_mut(key).map(|e| &mut e.value) {
        Some(Value::Set(set)) => Ok(set),
        _ => Err(StoreError::WrongType(key.to_string())),
    }
}

fn sorted_members(set: &HashMap<String, f64>) -> Vec<(&String, f64)> {
    let mut members: Vec<(&String, f64)> = set.iter().map(|(m, s)| (m, *s)).collect();
    members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(b.0)));
    members
}

fn set_ttl(entry: &mut Entry, ttl: Option<Duration>) {
    entry.expires_at = ttl.map(|ttl| Instant::now() + ttl);
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired keys; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut data = self.data.lock();
        let before = data.len();
        data.retain(|_, entry| !entry.is_expired(now));
        let removed = before - data.len();
        if removed > 0 {
            debug!(removed, "Purged expired in-memory keys");
        }
        removed
    }

    /// Remaining time to live of a key, if it has one
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let mut data = self.data.lock();
        live(&mut data, key)
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn sweep_expired(&self) -> StoreResult<usize> {
        Ok(self.purge_expired())
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut data = self.data.lock();
        match live(&mut data, key).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Str(value)) => Ok(Some(value.clone())),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let mut entry = Entry::new(Value::Str(value.to_string()));
        set_ttl(&mut entry, ttl);
        self.data.lock().insert(key.to_string(), entry);
        Ok(())
    }

    async fn del(&self, key: &str) -> StoreResult<bool> {
        let mut data = self.data.lock();
        let existed = live(&mut data, key).is_some();
        data.remove(key);
        Ok(existed)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let mut data = self.data.lock();
        match live(&mut data, key) {
            Some(entry) => {
                set_ttl(entry, Some(ttl));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<()> {
        let mut data = self.data.lock();
        zset_mut(&mut data, key)?.insert(member.to_string(), score);
        Ok(())
    }

    async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> StoreResult<Vec<String>> {
        let mut data = self.data.lock();
        match live(&mut data, key).map(|e| &e.value) {
            None => Ok(Vec::new()),
            Some(Value::ZSet(set)) => Ok(sorted_members(set)
                .into_iter()
                .filter(|(_, score)| *score >= min && *score <= max)
                .map(|(member, _)| member.clone())
                .collect()),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn zrevrange(&self, key: &str, limit: Option<usize>) -> StoreResult<Vec<String>> {
        let mut data = self.data.lock();
        match live(&mut data, key).map(|e| &e.value) {
            None => Ok(Vec::new()),
            Some(Value::ZSet(set)) => Ok(sorted_members(set)
                .into_iter()
                .rev()
                .take(limit.unwrap_or(usize::MAX))
                .map(|(member, _)| member.clone())
                .collect()),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn zrem(&self, key: &str, member: &str) -> StoreResult<()> {
        let mut data = self.data.lock();
        if let Some(Value::ZSet(set)) = live(&mut data, key).map(|e| &mut e.value) {
            set.remove(member);
        }
        Ok(())
    }

    async fn sadd(&self, key: &str, member: &str) -> StoreResult<()> {
        let mut data = self.data.lock();
        set_mut(&mut data, key)?.insert(member.to_string());
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> StoreResult<()> {
        let mut data = self.data.lock();
        if let Some(Value::Set(set)) = live(&mut data, key).map(|e| &mut e.value) {
            set.remove(member);
        }
        Ok(())
    }

    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut data = self.data.lock();
        match live(&mut data, key).map(|e| &e.value) {
            None => Ok(Vec::new()),
            Some(Value::Set(set)) => {
                let mut members: Vec<String> = set.iter().cloned().collect();
                members.sort();
                Ok(members)
            }
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let now = Instant::now();
        let data = self.data.lock();
        let mut keys: Vec<String> = data
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && !entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn write_indexed(&self, write: &IndexedWrite) -> StoreResult<()> {
        let mut data = self.data.lock();

        // Type-check every index before touching anything
        for index in &write.indexes {
            if let Some(entry) = live(&mut data, &index.key) {
                if !matches!(entry.value, Value::ZSet(_)) {
                    return Err(StoreError::WrongType(index.key.clone()));
                }
            }
        }

        let mut entry = Entry::new(Value::Str(write.value.clone()));
        set_ttl(&mut entry, write.ttl);
        data.insert(write.key.clone(), entry);

        for index in &write.indexes {
            zset_mut(&mut data, &index.key)?.insert(index.member.clone(), index.score);
            if let (Some(ttl), Some(entry)) = (index.ttl, data.get_mut(&index.key)) {
                set_ttl(entry, Some(ttl));
            }
        }
        Ok(())
    }

    async fn delete_indexed(&self, key: &str, indexes: &[(String, String)]) -> StoreResult<()> {
        let mut data = self.data.lock();
        data.remove(key);
        for (index_key, member) in indexes {
            if let Some(Value::ZSet(set)) = live(&mut data, index_key).map(|e| &mut e.value) {
                set.remove(member);
            }
        }
        Ok(())
    }

    async fn eval_sliding_window(
        &self,
        key: &str,
        now_micros: i64,
        window: Duration,
        member: &str,
        ttl: Duration,
    ) -> StoreResult<u64> {
        let cutoff = (now_micros - window.as_micros() as i64) as f64;
        let mut data = self.data.lock();

        let set = zset_mut(&mut data, key)?;
        set.retain(|_, score| *score > cutoff);
        set.insert(member.to_string(), now_micros as f64);
        let count = set.len() as u64;

        if let Some(entry) = data.get_mut(key) {
            set_ttl(entry, Some(ttl));
        }
        Ok(count)
    }

    async fn eval_token_bucket(
        &self,
        key: &str,
        params: &TokenBucketParams,
        now_ms: i64,
    ) -> StoreResult<TokenBucketOutcome> {
        let mut data = self.data.lock();

        let state = match live(&mut data, key).map(|e| &e.value) {
            None => None,
            Some(Value::Bucket(state)) => Some(*state),
            Some(_) => return Err(StoreError::WrongType(key.to_string())),
        };

        let (next, outcome) = token_bucket_step(state, params, now_ms);
        let mut entry = Entry::new(Value::Bucket(next));
        set_ttl(&mut entry, Some(params.ttl));
        data.insert(key.to_string(), entry);

        Ok(outcome)
    }
}
