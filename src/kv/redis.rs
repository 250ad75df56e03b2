//! Redis-backed [`KeyValueStore`] implementation.
//!
//! Uses a multiplexed connection manager, so the handle is cheap to clone
//! and survives reconnects. Compare-and-delete and lease renewal run as Lua
//! scripts to stay atomic on the server.

use std::time::Duration;

use async_trait::async_trait;
use redis::{AsyncCommands, Script, aio::ConnectionManager};

use super::KeyValueStore;
use crate::errors::CoreResult;

const RELEASE_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
  return redis.call('del', KEYS[1])
else
  return 0
end
"#;

const RENEW_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
  return redis.call('pexpire', KEYS[1], ARGV[2])
else
  return 0
end
"#;

/// Production KV over Redis.
#[derive(Clone)]
pub struct RedisKv {
    manager: ConnectionManager,
}

impl RedisKv {
    /// Connect to the given Redis URL.
    pub async fn connect(url: &str) -> CoreResult<Self> {
        let client = redis::Client::open(url)
            .map_err(crate::errors::CoreError::from)?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(crate::errors::CoreError::from)?;
        Ok(Self { manager })
    }

    /// Wrap an existing connection manager (shared with the queue adapter).
    pub fn from_manager(manager: ConnectionManager) -> Self {
        Self { manager }
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

#[async_trait]
impl KeyValueStore for RedisKv {
    async fn get(&self, key: &str) -> CoreResult<Option<String>> {
        let mut con = self.conn();
        Ok(con.get(key).await?)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CoreResult<()> {
        let mut con = self.conn();
        match ttl {
            Some(ttl) => {
                let _: () = con.set_ex(key, value, ttl.as_secs().max(1)).await?;
            }
            None => {
                let _: () = con.set(key, value).await?;
            }
        }
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> CoreResult<bool> {
        let mut con = self.conn();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut con)
            .await?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> CoreResult<bool> {
        let mut con = self.conn();
        let removed: i64 = con.del(key).await?;
        Ok(removed > 0)
    }

    async fn delete_if_value(&self, key: &str, value: &str) -> CoreResult<bool> {
        let mut con = self.conn();
        let removed: i64 = Script::new(RELEASE_SCRIPT)
            .key(key)
            .arg(value)
            .invoke_async(&mut con)
            .await?;
        Ok(removed > 0)
    }

    async fn expire_if_value(&self, key: &str, value: &str, ttl: Duration) -> CoreResult<bool> {
        let mut con = self.conn();
        let renewed: i64 = Script::new(RENEW_SCRIPT)
            .key(key)
            .arg(value)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut con)
            .await?;
        Ok(renewed > 0)
    }

    async fn set_add(&self, key: &str, member: &str) -> CoreResult<()> {
        let mut con = self.conn();
        let _: i64 = con.sadd(key, member).await?;
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> CoreResult<()> {
        let mut con = self.conn();
        let _: i64 = con.srem(key, member).await?;
        Ok(())
    }

    async fn set_members(&self, key: &str) -> CoreResult<Vec<String>> {
        let mut con = self.conn();
        Ok(con.smembers(key).await?)
    }

    async fn sorted_add(&self, key: &str, score: i64, member: &str) -> CoreResult<()> {
        let mut con = self.conn();
        let _: i64 = con.zadd(key, member, score).await?;
        Ok(())
    }

    async fn sorted_remove(&self, key: &str, member: &str) -> CoreResult<()> {
        let mut con = self.conn();
        let _: i64 = con.zrem(key, member).await?;
        Ok(())
    }

    async fn sorted_range_to(
        &self,
        key: &str,
        max_score: i64,
        limit: usize,
    ) -> CoreResult<Vec<String>> {
        let mut con = self.conn();
        Ok(con
            .zrangebyscore_limit(key, "-inf", max_score, 0, limit as isize)
            .await?)
    }

    async fn list_push(&self, key: &str, value: &str) -> CoreResult<()> {
        let mut con = self.conn();
        let _: i64 = con.rpush(key, value).await?;
        Ok(())
    }

    async fn list_range(&self, key: &str) -> CoreResult<Vec<String>> {
        let mut con = self.conn();
        Ok(con.lrange(key, 0, -1).await?)
    }

    async fn list_remove(&self, key: &str, value: &str) -> CoreResult<()> {
        let mut con = self.conn();
        let _: i64 = con.lrem(key, 0, value).await?;
        Ok(())
    }
}
