//! Production [`Gateway`] backed by redis-rs. One multiplexed connection
//! manager carries all commands; a semaphore bounds in-flight commands to
//! `pool_max` slots and acquire beyond `acquire_timeout_ms` surfaces
//! `ResourceExhausted`.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::{Gateway, Op};
use crate::config::RedisConfig;
use crate::utils::errors::{QueueError, QueueResult};

pub struct RedisGateway {
    client: redis::Client,
    manager: ConnectionManager,
    slots: Arc<Semaphore>,
    acquire_timeout: Duration,
    command_timeout: Duration,
}

impl RedisGateway {
    pub async fn connect(config: &RedisConfig) -> QueueResult<Self> {
        let url = config.url();
        let client = redis::Client::open(url.as_str())
            .map_err(|e| QueueError::backend(format!("invalid redis url: {}", e)))?;
        let manager = client
            .get_tokio_connection_manager()
            .await
            .map_err(|e| QueueError::backend(format!("redis connect failed: {}", e)))?;

        let gateway = Self {
            client,
            manager,
            slots: Arc::new(Semaphore::new(config.pool_max.max(1))),
            acquire_timeout: Duration::from_millis(config.acquire_timeout_ms),
            command_timeout: Duration::from_millis(config.command_timeout_ms),
        };

        let latency = gateway.ping().await?;
        info!("redis gateway connected ({}ms ping)", latency.as_millis());
        Ok(gateway)
    }

    async fn slot(&self) -> QueueResult<tokio::sync::OwnedSemaphorePermit> {
        match timeout(self.acquire_timeout, self.slots.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(QueueError::internal("connection slots closed")),
            Err(_) => Err(QueueError::ResourceExhausted(format!(
                "no redis connection slot within {}ms",
                self.acquire_timeout.as_millis()
            ))),
        }
    }

    async fn run<T>(
        &self,
        fut: impl Future<Output = redis::RedisResult<T>>,
    ) -> QueueResult<T> {
        match timeout(self.command_timeout, fut).await {
            Ok(result) => result.map_err(QueueError::from),
            Err(_) => Err(QueueError::Timeout(self.command_timeout)),
        }
    }
}

#[async_trait]
impl Gateway for RedisGateway {
    async fn zadd(&self, key: &str, member: &str, score: f64) -> QueueResult<()> {
        let _permit = self.slot().await?;
        let mut conn = self.manager.clone();
        let _: () = self.run(conn.zadd(key, member, score)).await?;
        Ok(())
    }

    async fn zrem(&self, key: &str, members: &[String]) -> QueueResult<u64> {
        if members.is_empty() {
            return Ok(0);
        }
        let _permit = self.slot().await?;
        let mut conn = self.manager.clone();
        let removed: u64 = self.run(conn.zrem(key, members)).await?;
        Ok(removed)
    }

    async fn zcard(&self, key: &str) -> QueueResult<u64> {
        let _permit = self.slot().await?;
        let mut conn = self.manager.clone();
        let count: u64 = self.run(conn.zcard(key)).await?;
        Ok(count)
    }

    async fn zscore(&self, key: &str, member: &str) -> QueueResult<Option<f64>> {
        let _permit = self.slot().await?;
        let mut conn = self.manager.clone();
        let score: Option<f64> = self.run(conn.zscore(key, member)).await?;
        Ok(score)
    }

    async fn zrange(&self, key: &str, start: isize, stop: isize) -> QueueResult<Vec<(String, f64)>> {
        let _permit = self.slot().await?;
        let mut conn = self.manager.clone();
        let entries: Vec<(String, f64)> = self.run(conn.zrange_withscores(key, start, stop)).await?;
        Ok(entries)
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: usize,
    ) -> QueueResult<Vec<(String, f64)>> {
        let _permit = self.slot().await?;
        let mut conn = self.manager.clone();
        let entries: Vec<(String, f64)> = if limit == 0 {
            self.run(conn.zrangebyscore_withscores(key, min, max)).await?
        } else {
            self.run(conn.zrangebyscore_limit_withscores(key, min, max, 0, limit as isize))
                .await?
        };
        Ok(entries)
    }

    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> QueueResult<u64> {
        let _permit = self.slot().await?;
        let mut conn = self.manager.clone();
        let removed: u64 = self.run(conn.zrembyscore(key, min, max)).await?;
        Ok(removed)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> QueueResult<()> {
        let _permit = self.slot().await?;
        let mut conn = self.manager.clone();
        let _: () = self.run(conn.hset(key, field, value)).await?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> QueueResult<Option<String>> {
        let _permit = self.slot().await?;
        let mut conn = self.manager.clone();
        let value: Option<String> = self.run(conn.hget(key, field)).await?;
        Ok(value)
    }

    async fn hdel(&self, key: &str, fields: &[String]) -> QueueResult<u64> {
        if fields.is_empty() {
            return Ok(0);
        }
        let _permit = self.slot().await?;
        let mut conn = self.manager.clone();
        let removed: u64 = self.run(conn.hdel(key, fields)).await?;
        Ok(removed)
    }

    async fn hlen(&self, key: &str) -> QueueResult<u64> {
        let _permit = self.slot().await?;
        let mut conn = self.manager.clone();
        let count: u64 = self.run(conn.hlen(key)).await?;
        Ok(count)
    }

    async fn set_bytes(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> QueueResult<()> {
        let _permit = self.slot().await?;
        let mut conn = self.manager.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis().max(1) as u64);
        }
        let _: () = self.run(cmd.query_async(&mut conn)).await?;
        Ok(())
    }

    async fn get_bytes(&self, key: &str) -> QueueResult<Option<Vec<u8>>> {
        let _permit = self.slot().await?;
        let mut conn = self.manager.clone();
        let value: Option<Vec<u8>> = self.run(conn.get(key)).await?;
        Ok(value)
    }

    async fn sadd(&self, key: &str, member: &str) -> QueueResult<()> {
        let _permit = self.slot().await?;
        let mut conn = self.manager.clone();
        let _: () = self.run(conn.sadd(key, member)).await?;
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> QueueResult<u64> {
        let _permit = self.slot().await?;
        let mut conn = self.manager.clone();
        let removed: u64 = self.run(conn.srem(key, member)).await?;
        Ok(removed)
    }

    async fn smembers(&self, key: &str) -> QueueResult<Vec<String>> {
        let _permit = self.slot().await?;
        let mut conn = self.manager.clone();
        let members: Vec<String> = self.run(conn.smembers(key)).await?;
        Ok(members)
    }

    async fn del(&self, keys: &[String]) -> QueueResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let _permit = self.slot().await?;
        let mut conn = self.manager.clone();
        let removed: u64 = self.run(conn.del(keys)).await?;
        Ok(removed)
    }

    async fn pipeline(&self, ops: Vec<Op>) -> QueueResult<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let _permit = self.slot().await?;
        let mut conn = self.manager.clone();
        let mut pipe = redis::pipe();
        // MULTI/EXEC so a transition is never half-visible.
        pipe.atomic();
        for op in &ops {
            match op {
                Op::ZAdd { key, member, score } => {
                    pipe.cmd("ZADD").arg(key).arg(*score).arg(member).ignore();
                }
                Op::ZRem { key, member } => {
                    pipe.cmd("ZREM").arg(key).arg(member).ignore();
                }
                Op::ZRemRangeByScore { key, min, max } => {
                    pipe.cmd("ZREMRANGEBYSCORE").arg(key).arg(*min).arg(*max).ignore();
                }
                Op::HSet { key, field, value } => {
                    pipe.cmd("HSET").arg(key).arg(field).arg(value).ignore();
                }
                Op::HDel { key, field } => {
                    pipe.cmd("HDEL").arg(key).arg(field).ignore();
                }
                Op::SAdd { key, member } => {
                    pipe.cmd("SADD").arg(key).arg(member).ignore();
                }
                Op::SRem { key, member } => {
                    pipe.cmd("SREM").arg(key).arg(member).ignore();
                }
                Op::Del { key } => {
                    pipe.cmd("DEL").arg(key).ignore();
                }
            }
        }
        let _: () = self.run(pipe.query_async(&mut conn)).await?;
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> QueueResult<()> {
        let _permit = self.slot().await?;
        let mut conn = self.manager.clone();
        let _: () = self.run(conn.publish(channel, payload)).await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> QueueResult<mpsc::Receiver<String>> {
        // Subscriptions hold their own connection and do not consume a
        // command slot.
        let conn = self
            .client
            .get_async_connection()
            .await
            .map_err(QueueError::from)?;
        let mut pubsub = conn.into_pubsub();
        pubsub.subscribe(channel).await.map_err(QueueError::from)?;

        let channel_name = channel.to_string();
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!("dropping unreadable message on {}: {}", channel_name, e);
                        continue;
                    }
                };
                if tx.send(payload).await.is_err() {
                    debug!("subscriber for {} went away", channel_name);
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn ping(&self) -> QueueResult<Duration> {
        let _permit = self.slot().await?;
        let mut conn = self.manager.clone();
        let started = Instant::now();
        let _: String = self.run(redis::cmd("PING").query_async(&mut conn)).await?;
        Ok(started.elapsed())
    }
}
