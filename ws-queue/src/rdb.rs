//! Redis-backed substrate

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Direction, ExistenceCheck, Script, SetExpiry, SetOptions};
use std::time::Duration;
use tracing::{debug, instrument};

use crate::error::Result;
use crate::substrate::QueueSubstrate;

/// Deletes a claim only when it still belongs to the caller.
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

/// LMOVE the head of KEYS[1] to KEYS[2] and lease it in KEYS[3] at ARGV[1].
const RESERVE_SCRIPT: &str = r#"
local value = redis.call("LMOVE", KEYS[1], KEYS[2], "LEFT", "RIGHT")
if value then
    redis.call("ZADD", KEYS[3], ARGV[1], value)
end
return value
"#;

#[derive(Clone)]
pub struct RedisSubstrate {
    conn: ConnectionManager,
    release_script: Script,
    reserve_script: Script,
}

impl RedisSubstrate {
    /// Connect to the broker at `url` (e.g. `redis://127.0.0.1:6379/0`).
    #[instrument]
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        debug!("Connected to redis substrate");

        Ok(Self {
            conn,
            release_script: Script::new(RELEASE_SCRIPT),
            reserve_script: Script::new(RESERVE_SCRIPT),
        })
    }
}

#[async_trait]
impl QueueSubstrate for RedisSubstrate {
    async fn push(&self, list: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: usize = conn.rpush(list, value).await?;
        Ok(())
    }

    async fn move_pop(&self, src: &str, dst: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let moved: Option<String> = conn
            .lmove(src, dst, Direction::Left, Direction::Right)
            .await?;
        Ok(moved)
    }

    async fn reserve(
        &self,
        src: &str,
        dst: &str,
        leases: &str,
        score: i64,
    ) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let moved: Option<String> = self
            .reserve_script
            .key(src)
            .key(dst)
            .key(leases)
            .arg(score)
            .invoke_async(&mut conn)
            .await?;
        Ok(moved)
    }

    async fn remove(&self, list: &str, value: &str, count: usize) -> Result<usize> {
        let mut conn = self.conn.clone();
        let removed: usize = conn.lrem(list, count as isize, value).await?;
        Ok(removed)
    }

    async fn len(&self, list: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        let len: usize = conn.llen(list).await?;
        Ok(len)
    }

    async fn range(&self, list: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let entries: Vec<String> = conn.lrange(list, start, stop).await?;
        Ok(entries)
    }

    async fn lease_set(&self, key: &str, member: &str, score: i64) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: usize = conn.zadd(key, member, score).await?;
        Ok(())
    }

    async fn lease_remove(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: usize = conn.zrem(key, member).await?;
        Ok(())
    }

    async fn lease_expired(&self, key: &str, max_score: i64) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn.zrangebyscore(key, "-inf", max_score).await?;
        Ok(members)
    }

    async fn claim(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let options = SetOptions::default()
            .conditional_set(ExistenceCheck::NX)
            .with_expiration(SetExpiry::PX(ttl.as_millis() as u64));
        let reply: Option<String> = conn.set_options(key, owner, options).await?;
        Ok(reply.is_some())
    }

    async fn release(&self, key: &str, owner: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = self
            .release_script
            .key(key)
            .arg(owner)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }
}
