//! Priority/delay ordering over Redis sorted sets.
//!
//! Ready jobs live in `waiting` scored so that lower scores are claimed
//! first; delayed jobs live in `delayed` scored by their not-before time.

use std::sync::Arc;

use tracing::debug;

use crate::config::MAX_PRIORITY;
use crate::gateway::{Gateway, KeyCodec};
use crate::utils::errors::QueueResult;

/// Priority weight, strictly larger than any realistic epoch-ms timestamp
/// so priority always dominates and age breaks ties (FIFO within priority).
pub const PRIORITY_WEIGHT: f64 = 1.0e13;

/// Composite ordering key: lower score = more urgent, older first.
pub fn priority_score(priority: u8, created_at_ms: i64) -> f64 {
    let inverted = (MAX_PRIORITY - priority.min(MAX_PRIORITY)) as f64;
    inverted * PRIORITY_WEIGHT + created_at_ms as f64
}

pub struct SchedulerStore {
    gateway: Arc<dyn Gateway>,
    codec: KeyCodec,
}

impl SchedulerStore {
    pub fn new(gateway: Arc<dyn Gateway>, codec: KeyCodec) -> Self {
        Self { gateway, codec }
    }

    pub async fn enqueue_ready(&self, queue: &str, job_id: &str, score: f64) -> QueueResult<()> {
        self.gateway
            .zadd(&self.codec.waiting(queue), job_id, score)
            .await
    }

    pub async fn enqueue_delayed(
        &self,
        queue: &str,
        job_id: &str,
        not_before_ms: i64,
    ) -> QueueResult<()> {
        self.gateway
            .zadd(&self.codec.delayed(queue), job_id, not_before_ms as f64)
            .await
    }

    pub async fn peek(&self, queue: &str, n: usize) -> QueueResult<Vec<(String, f64)>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        self.gateway
            .zrange(&self.codec.waiting(queue), 0, n as isize - 1)
            .await
    }

    /// Attempts to claim the most urgent waiting job.
    ///
    /// The ZREM is the serialization point: exactly one worker observes a
    /// non-zero removal for a given member. Losing the race returns `None`
    /// and the caller yields.
    pub async fn claim_one(&self, queue: &str) -> QueueResult<Option<String>> {
        let waiting = self.codec.waiting(queue);
        let head = self.gateway.zrange(&waiting, 0, 0).await?;
        let Some((job_id, _)) = head.into_iter().next() else {
            return Ok(None);
        };
        let removed = self.gateway.zrem(&waiting, &[job_id.clone()]).await?;
        if removed == 0 {
            debug!("lost claim race for {} on {}", job_id, queue);
            return Ok(None);
        }
        Ok(Some(job_id))
    }

    /// Delayed members whose not-before has passed, oldest first.
    pub async fn due_delayed(
        &self,
        queue: &str,
        now_ms: i64,
        limit: usize,
    ) -> QueueResult<Vec<String>> {
        let due = self
            .gateway
            .zrange_by_score(&self.codec.delayed(queue), f64::NEG_INFINITY, now_ms as f64, limit)
            .await?;
        Ok(due.into_iter().map(|(member, _)| member).collect())
    }

    pub async fn waiting_count(&self, queue: &str) -> QueueResult<u64> {
        self.gateway.zcard(&self.codec.waiting(queue)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::MemoryGateway;

    fn store() -> SchedulerStore {
        SchedulerStore::new(
            Arc::new(MemoryGateway::new()),
            KeyCodec::new("llmchat:queue"),
        )
    }

    #[test]
    fn higher_priority_scores_lower() {
        let t = 1_700_000_000_000;
        assert!(priority_score(10, t) < priority_score(5, t));
        assert!(priority_score(20, t) < priority_score(0, t));
    }

    #[test]
    fn equal_priority_breaks_ties_by_age() {
        let early = priority_score(5, 1_700_000_000_000);
        let late = priority_score(5, 1_700_000_000_500);
        assert!(early < late);
    }

    #[test]
    fn priority_dominates_any_timestamp_gap() {
        // A job enqueued years later at a higher priority still wins.
        let urgent_late = priority_score(10, 1_900_000_000_000);
        let casual_early = priority_score(9, 1_500_000_000_000);
        assert!(urgent_late < casual_early);
    }

    #[tokio::test]
    async fn claim_pops_most_urgent_first() {
        let store = store();
        store
            .enqueue_ready("q", "low", priority_score(5, 1000))
            .await
            .unwrap();
        store
            .enqueue_ready("q", "high", priority_score(10, 2000))
            .await
            .unwrap();

        assert_eq!(store.claim_one("q").await.unwrap().as_deref(), Some("high"));
        assert_eq!(store.claim_one("q").await.unwrap().as_deref(), Some("low"));
        assert_eq!(store.claim_one("q").await.unwrap(), None);
    }

    #[tokio::test]
    async fn due_delayed_honors_cutoff() {
        let store = store();
        store.enqueue_delayed("q", "soon", 1000).await.unwrap();
        store.enqueue_delayed("q", "later", 5000).await.unwrap();

        let due = store.due_delayed("q", 2000, 10).await.unwrap();
        assert_eq!(due, vec!["soon".to_string()]);

        let due = store.due_delayed("q", 9000, 10).await.unwrap();
        assert_eq!(due.len(), 2);
    }

    #[tokio::test]
    async fn peek_does_not_remove() {
        let store = store();
        store
            .enqueue_ready("q", "a", priority_score(10, 1))
            .await
            .unwrap();
        let peeked = store.peek("q", 5).await.unwrap();
        assert_eq!(peeked.len(), 1);
        assert_eq!(store.waiting_count("q").await.unwrap(), 1);
    }
}
