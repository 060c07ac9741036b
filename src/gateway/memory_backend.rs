//! In-process [`Gateway`] implementation for tests and development, the same
//! role the in-memory rate-limit backend plays for the limiter.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::debug;

use super::{Gateway, Op};
use crate::utils::errors::QueueResult;

#[derive(Default)]
struct MemoryState {
    zsets: HashMap<String, HashMap<String, f64>>,
    hashes: HashMap<String, HashMap<String, String>>,
    strings: HashMap<String, (Vec<u8>, Option<Instant>)>,
    sets: HashMap<String, HashSet<String>>,
}

impl MemoryState {
    fn sorted(&self, key: &str) -> Vec<(String, f64)> {
        let mut entries: Vec<(String, f64)> = self
            .zsets
            .get(key)
            .map(|m| m.iter().map(|(k, v)| (k.clone(), *v)).collect())
            .unwrap_or_default();
        // Redis orders by score, then lexicographically by member.
        entries.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        entries
    }

    fn apply(&mut self, op: &Op) {
        match op {
            Op::ZAdd { key, member, score } => {
                self.zsets
                    .entry(key.clone())
                    .or_default()
                    .insert(member.clone(), *score);
            }
            Op::ZRem { key, member } => {
                let emptied = match self.zsets.get_mut(key) {
                    Some(zset) => {
                        zset.remove(member);
                        zset.is_empty()
                    }
                    None => false,
                };
                if emptied {
                    self.zsets.remove(key);
                }
            }
            Op::ZRemRangeByScore { key, min, max } => {
                let emptied = match self.zsets.get_mut(key) {
                    Some(zset) => {
                        zset.retain(|_, score| *score < *min || *score > *max);
                        zset.is_empty()
                    }
                    None => false,
                };
                if emptied {
                    self.zsets.remove(key);
                }
            }
            Op::HSet { key, field, value } => {
                self.hashes
                    .entry(key.clone())
                    .or_default()
                    .insert(field.clone(), value.clone());
            }
            Op::HDel { key, field } => {
                let emptied = match self.hashes.get_mut(key) {
                    Some(hash) => {
                        hash.remove(field);
                        hash.is_empty()
                    }
                    None => false,
                };
                if emptied {
                    self.hashes.remove(key);
                }
            }
            Op::SAdd { key, member } => {
                self.sets
                    .entry(key.clone())
                    .or_default()
                    .insert(member.clone());
            }
            Op::SRem { key, member } => {
                let emptied = match self.sets.get_mut(key) {
                    Some(set) => {
                        set.remove(member);
                        set.is_empty()
                    }
                    None => false,
                };
                if emptied {
                    self.sets.remove(key);
                }
            }
            Op::Del { key } => {
                self.zsets.remove(key);
                self.hashes.remove(key);
                self.strings.remove(key);
                self.sets.remove(key);
            }
        }
    }
}

/// All state lives under a single lock, which makes every pipeline atomic
/// from the point of view of concurrent observers.
pub struct MemoryGateway {
    state: Mutex<MemoryState>,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            channels: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Gateway for MemoryGateway {
    async fn zadd(&self, key: &str, member: &str, score: f64) -> QueueResult<()> {
        let mut state = self.state.lock().await;
        state.apply(&Op::ZAdd {
            key: key.to_string(),
            member: member.to_string(),
            score,
        });
        Ok(())
    }

    async fn zrem(&self, key: &str, members: &[String]) -> QueueResult<u64> {
        let mut state = self.state.lock().await;
        let mut removed = 0u64;
        let emptied = match state.zsets.get_mut(key) {
            Some(zset) => {
                for member in members {
                    if zset.remove(member).is_some() {
                        removed += 1;
                    }
                }
                zset.is_empty()
            }
            None => false,
        };
        if emptied {
            state.zsets.remove(key);
        }
        Ok(removed)
    }

    async fn zcard(&self, key: &str) -> QueueResult<u64> {
        let state = self.state.lock().await;
        Ok(state.zsets.get(key).map(|z| z.len() as u64).unwrap_or(0))
    }

    async fn zscore(&self, key: &str, member: &str) -> QueueResult<Option<f64>> {
        let state = self.state.lock().await;
        Ok(state.zsets.get(key).and_then(|z| z.get(member).copied()))
    }

    async fn zrange(&self, key: &str, start: isize, stop: isize) -> QueueResult<Vec<(String, f64)>> {
        let state = self.state.lock().await;
        let entries = state.sorted(key);
        let len = entries.len() as isize;
        if len == 0 {
            return Ok(Vec::new());
        }
        let norm = |idx: isize| -> isize {
            if idx < 0 {
                (len + idx).max(0)
            } else {
                idx.min(len - 1)
            }
        };
        let (start, stop) = (norm(start), norm(stop));
        if start > stop {
            return Ok(Vec::new());
        }
        Ok(entries[start as usize..=stop as usize].to_vec())
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: usize,
    ) -> QueueResult<Vec<(String, f64)>> {
        let state = self.state.lock().await;
        let mut matched: Vec<(String, f64)> = state
            .sorted(key)
            .into_iter()
            .filter(|(_, score)| *score >= min && *score <= max)
            .collect();
        if limit > 0 && matched.len() > limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }

    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> QueueResult<u64> {
        let mut state = self.state.lock().await;
        let before = state.zsets.get(key).map(|z| z.len()).unwrap_or(0);
        state.apply(&Op::ZRemRangeByScore {
            key: key.to_string(),
            min,
            max,
        });
        let after = state.zsets.get(key).map(|z| z.len()).unwrap_or(0);
        Ok((before - after) as u64)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> QueueResult<()> {
        let mut state = self.state.lock().await;
        state.apply(&Op::HSet {
            key: key.to_string(),
            field: field.to_string(),
            value: value.to_string(),
        });
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> QueueResult<Option<String>> {
        let state = self.state.lock().await;
        Ok(state.hashes.get(key).and_then(|h| h.get(field).cloned()))
    }

    async fn hdel(&self, key: &str, fields: &[String]) -> QueueResult<u64> {
        let mut state = self.state.lock().await;
        let mut removed = 0u64;
        let emptied = match state.hashes.get_mut(key) {
            Some(hash) => {
                for field in fields {
                    if hash.remove(field).is_some() {
                        removed += 1;
                    }
                }
                hash.is_empty()
            }
            None => false,
        };
        if emptied {
            state.hashes.remove(key);
        }
        Ok(removed)
    }

    async fn hlen(&self, key: &str) -> QueueResult<u64> {
        let state = self.state.lock().await;
        Ok(state.hashes.get(key).map(|h| h.len() as u64).unwrap_or(0))
    }

    async fn set_bytes(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> QueueResult<()> {
        let mut state = self.state.lock().await;
        let expires = ttl.map(|d| Instant::now() + d);
        state.strings.insert(key.to_string(), (value.to_vec(), expires));
        Ok(())
    }

    async fn get_bytes(&self, key: &str) -> QueueResult<Option<Vec<u8>>> {
        let mut state = self.state.lock().await;
        match state.strings.get(key) {
            Some((_, Some(expires))) if *expires <= Instant::now() => {
                state.strings.remove(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    async fn sadd(&self, key: &str, member: &str) -> QueueResult<()> {
        let mut state = self.state.lock().await;
        state.apply(&Op::SAdd {
            key: key.to_string(),
            member: member.to_string(),
        });
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> QueueResult<u64> {
        let mut state = self.state.lock().await;
        let removed = state
            .sets
            .get_mut(key)
            .map(|s| s.remove(member))
            .unwrap_or(false);
        Ok(removed as u64)
    }

    async fn smembers(&self, key: &str) -> QueueResult<Vec<String>> {
        let state = self.state.lock().await;
        Ok(state
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn del(&self, keys: &[String]) -> QueueResult<u64> {
        let mut state = self.state.lock().await;
        let mut removed = 0u64;
        for key in keys {
            let existed = state.zsets.contains_key(key)
                || state.hashes.contains_key(key)
                || state.strings.contains_key(key)
                || state.sets.contains_key(key);
            state.apply(&Op::Del { key: key.clone() });
            if existed {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn pipeline(&self, ops: Vec<Op>) -> QueueResult<()> {
        let mut state = self.state.lock().await;
        for op in &ops {
            state.apply(op);
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> QueueResult<()> {
        let channels = self.channels.lock().await;
        if let Some(sender) = channels.get(channel) {
            // A send with no receivers is fine; events are best-effort.
            let _ = sender.send(payload.to_string());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> QueueResult<mpsc::Receiver<String>> {
        let mut channels = self.channels.lock().await;
        let sender = channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(1024).0)
            .clone();
        drop(channels);

        let mut broadcast_rx = sender.subscribe();
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            loop {
                match broadcast_rx.recv().await {
                    Ok(payload) => {
                        if tx.send(payload).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("memory subscriber lagged, skipped {} events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(rx)
    }

    async fn ping(&self) -> QueueResult<Duration> {
        Ok(Duration::from_micros(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn zset_ordering_and_removal() {
        let gw = MemoryGateway::new();
        gw.zadd("z", "b", 2.0).await.unwrap();
        gw.zadd("z", "a", 1.0).await.unwrap();
        gw.zadd("z", "c", 2.0).await.unwrap();

        let range = gw.zrange("z", 0, -1).await.unwrap();
        let members: Vec<&str> = range.iter().map(|(m, _)| m.as_str()).collect();
        assert_eq!(members, vec!["a", "b", "c"]);

        assert_eq!(gw.zrem("z", &["a".into()]).await.unwrap(), 1);
        assert_eq!(gw.zrem("z", &["a".into()]).await.unwrap(), 0);
        assert_eq!(gw.zcard("z").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn range_by_score_with_limit() {
        let gw = MemoryGateway::new();
        for i in 0..10 {
            gw.zadd("z", &format!("m{}", i), i as f64).await.unwrap();
        }
        let due = gw.zrange_by_score("z", 0.0, 4.0, 3).await.unwrap();
        assert_eq!(due.len(), 3);
        assert_eq!(due[0].0, "m0");
    }

    #[tokio::test]
    async fn string_ttl_expires() {
        let gw = MemoryGateway::new();
        gw.set_bytes("k", b"v", Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert_eq!(gw.get_bytes("k").await.unwrap(), Some(b"v".to_vec()));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(gw.get_bytes("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn pipeline_is_atomic_for_observers() {
        let gw = MemoryGateway::new();
        gw.pipeline(vec![
            Op::ZAdd {
                key: "z".into(),
                member: "j1".into(),
                score: 1.0,
            },
            Op::HSet {
                key: "h".into(),
                field: "j1".into(),
                value: "record".into(),
            },
        ])
        .await
        .unwrap();
        assert_eq!(gw.zcard("z").await.unwrap(), 1);
        assert_eq!(gw.hget("h", "j1").await.unwrap().as_deref(), Some("record"));
    }

    #[tokio::test]
    async fn pub_sub_round_trip() {
        let gw = MemoryGateway::new();
        let mut rx = gw.subscribe("events").await.unwrap();
        gw.publish("events", "hello").await.unwrap();
        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert_eq!(got.as_deref(), Some("hello"));
    }
}
