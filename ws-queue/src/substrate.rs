use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;

/// Atomic list primitives the job queue is built on.
///
/// Every method is a single broker operation. `move_pop` in particular must be
/// atomic: two concurrent callers never receive the same element.
#[async_trait]
pub trait QueueSubstrate: Send + Sync {
    /// Append `value` to the tail of `list`.
    async fn push(&self, list: &str, value: &str) -> Result<()>;

    /// Pop the head of `src` and append it to the tail of `dst`.
    async fn move_pop(&self, src: &str, dst: &str) -> Result<Option<String>>;

    /// `move_pop` that also records the moved element in the lease set
    /// `leases` with `score`, in the same atomic step.
    async fn reserve(
        &self,
        src: &str,
        dst: &str,
        leases: &str,
        score: i64,
    ) -> Result<Option<String>>;

    /// Remove up to `count` entries equal to `value`, returning how many were removed.
    async fn remove(&self, list: &str, value: &str, count: usize) -> Result<usize>;

    async fn len(&self, list: &str) -> Result<usize>;

    /// Inclusive range with Redis `LRANGE` semantics (negative indices count from the tail).
    async fn range(&self, list: &str, start: isize, stop: isize) -> Result<Vec<String>>;

    /// Record `member` in the lease set `key` with the given score (unix millis).
    async fn lease_set(&self, key: &str, member: &str, score: i64) -> Result<()>;

    async fn lease_remove(&self, key: &str, member: &str) -> Result<()>;

    /// Members of `key` whose score is at or below `max_score`.
    async fn lease_expired(&self, key: &str, max_score: i64) -> Result<Vec<String>>;

    /// Set `key` to `owner` only if it is unset (or expired). Returns whether the claim was taken.
    async fn claim(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool>;

    /// Clear `key` if it is still held by `owner`.
    async fn release(&self, key: &str, owner: &str) -> Result<()>;
}
