//! In-process substrate
//!
//! Implements the substrate with in-memory structures guarded by a single
//! mutex, so every operation is trivially atomic. Used by tests and by
//! single-process deployments without a broker.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::error::Result;
use crate::substrate::QueueSubstrate;

#[derive(Default)]
struct MemoryState {
    lists: HashMap<String, VecDeque<String>>,
    leases: HashMap<String, HashMap<String, i64>>,
    claims: HashMap<String, (String, Instant)>,
}

#[derive(Default)]
pub struct MemorySubstrate {
    state: Mutex<MemoryState>,
}

impl MemorySubstrate {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Resolve Redis-style inclusive indices against a list of `len` elements.
fn resolve_range(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let len = len as isize;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };

    if len == 0 || start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

#[async_trait]
impl QueueSubstrate for MemorySubstrate {
    async fn push(&self, list: &str, value: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .lists
            .entry(list.to_string())
            .or_default()
            .push_back(value.to_string());
        Ok(())
    }

    async fn move_pop(&self, src: &str, dst: &str) -> Result<Option<String>> {
        let mut state = self.state.lock().await;
        let Some(value) = state.lists.get_mut(src).and_then(|l| l.pop_front()) else {
            return Ok(None);
        };
        state
            .lists
            .entry(dst.to_string())
            .or_default()
            .push_back(value.clone());
        Ok(Some(value))
    }

    async fn reserve(
        &self,
        src: &str,
        dst: &str,
        leases: &str,
        score: i64,
    ) -> Result<Option<String>> {
        let mut state = self.state.lock().await;
        let Some(value) = state.lists.get_mut(src).and_then(|l| l.pop_front()) else {
            return Ok(None);
        };
        state
            .lists
            .entry(dst.to_string())
            .or_default()
            .push_back(value.clone());
        state
            .leases
            .entry(leases.to_string())
            .or_default()
            .insert(value.clone(), score);
        Ok(Some(value))
    }

    async fn remove(&self, list: &str, value: &str, count: usize) -> Result<usize> {
        let mut state = self.state.lock().await;
        let Some(entries) = state.lists.get_mut(list) else {
            return Ok(0);
        };

        let mut removed = 0;
        entries.retain(|entry| {
            if removed < count && entry == value {
                removed += 1;
                false
            } else {
                true
            }
        });
        Ok(removed)
    }

    async fn len(&self, list: &str) -> Result<usize> {
        let state = self.state.lock().await;
        Ok(state.lists.get(list).map_or(0, |l| l.len()))
    }

    async fn range(&self, list: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let state = self.state.lock().await;
        let Some(entries) = state.lists.get(list) else {
            return Ok(Vec::new());
        };

        Ok(match resolve_range(entries.len(), start, stop) {
            Some((from, to)) => entries.range(from..=to).cloned().collect(),
            None => Vec::new(),
        })
    }

    async fn lease_set(&self, key: &str, member: &str, score: i64) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .leases
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn lease_remove(&self, key: &str, member: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(set) = state.leases.get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }

    async fn lease_expired(&self, key: &str, max_score: i64) -> Result<Vec<String>> {
        let state = self.state.lock().await;
        let Some(set) = state.leases.get(key) else {
            return Ok(Vec::new());
        };

        let mut expired: Vec<(&String, &i64)> =
            set.iter().filter(|(_, score)| **score <= max_score).collect();
        expired.sort_by_key(|(_, score)| **score);
        Ok(expired.into_iter().map(|(m, _)| m.clone()).collect())
    }

    async fn claim(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        if let Some((_, expires)) = state.claims.get(key) {
            if *expires > now {
                return Ok(false);
            }
        }
        state
            .claims
            .insert(key.to_string(), (owner.to_string(), now + ttl));
        Ok(true)
    }

    async fn release(&self, key: &str, owner: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.claims.get(key).is_some_and(|(held, _)| held == owner) {
            state.claims.remove(key);
        }
        Ok(())
    }
}
