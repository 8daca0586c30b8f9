//! Publish fabric: four strict-priority lanes, confirm-and-retry delivery
//! to the Redis bridge, and a token-bucket rate limit.
//!
//! The Redis half is a `redis::Client` plus an on-demand
//! `get_async_connection`, serializing to JSON and calling
//! `AsyncCommands::publish`. The lane/worker-pool scheduling around it uses
//! the same jittered-backoff retry as the session supervisor, for a
//! consistent feel across the crate.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use log::{error, warn};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::error::{IngestError, Result};
use crate::session::compute_backoff;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishEnvelope {
    pub topic: String,
    pub payload: String,
    pub priority: Priority,
    pub attempts: u32,
    pub created_ms: i64,
}

impl PublishEnvelope {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>, priority: Priority, now_ms: i64) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            priority,
            attempts: 0,
            created_ms: now_ms,
        }
    }
}

const LANE_CAPACITY: usize = 10_000;

#[derive(Default)]
struct Lane {
    queue: Mutex<VecDeque<PublishEnvelope>>,
    dropped: AtomicU64,
}

impl Lane {
    async fn push(&self, env: PublishEnvelope) {
        let mut q = self.queue.lock().await;
        if q.len() >= LANE_CAPACITY {
            q.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        q.push_back(env);
    }

    async fn pop(&self) -> Option<PublishEnvelope> {
        self.queue.lock().await.pop_front()
    }
}

/// Four strict-priority lanes: a dequeue always drains `critical` completely
/// before looking at `high`, then `medium`, then `low` — lower lanes can
/// starve under sustained load at a higher one, which is the point:
/// control/gap-recovery traffic must never wait behind book ticks.
pub struct PublishFabric {
    critical: Lane,
    high: Lane,
    medium: Lane,
    low: Lane,
    notify: Notify,
    rate_limiter: RateLimiter,
    max_retries: u32,
    dropped_publishes: DashMap<String, AtomicU64>,
}

impl PublishFabric {
    pub fn new(rate_limit_msgs_per_sec: u32, max_retries: u32) -> Arc<Self> {
        Arc::new(Self {
            critical: Lane::default(),
            high: Lane::default(),
            medium: Lane::default(),
            low: Lane::default(),
            notify: Notify::new(),
            rate_limiter: RateLimiter::new(rate_limit_msgs_per_sec),
            max_retries,
            dropped_publishes: DashMap::new(),
        })
    }

    fn lane(&self, priority: Priority) -> &Lane {
        match priority {
            Priority::Critical => &self.critical,
            Priority::High => &self.high,
            Priority::Medium => &self.medium,
            Priority::Low => &self.low,
        }
    }

    pub async fn enqueue(&self, env: PublishEnvelope) {
        self.lane(env.priority).push(env).await;
        self.notify.notify_one();
    }

    async fn dequeue(&self) -> PublishEnvelope {
        loop {
            for lane in [&self.critical, &self.high, &self.medium, &self.low] {
                if let Some(env) = lane.pop().await {
                    return env;
                }
            }
            self.notify.notified().await;
        }
    }

    pub fn dropped_counts(&self) -> [(Priority, u64); 4] {
        [
            (Priority::Critical, self.critical.dropped.load(Ordering::Relaxed)),
            (Priority::High, self.high.dropped.load(Ordering::Relaxed)),
            (Priority::Medium, self.medium.dropped.load(Ordering::Relaxed)),
            (Priority::Low, self.low.dropped.load(Ordering::Relaxed)),
        ]
    }

    /// Per-topic count of envelopes dropped after exhausting `max_retries`,
    /// distinct from the per-lane overflow counts above.
    pub fn dropped_for_topic(&self, topic: &str) -> u64 {
        self.dropped_publishes
            .get(topic)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn record_exhaustion(&self, topic: &str) {
        self.dropped_publishes
            .entry(topic.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Runs one worker: dequeue-by-priority, rate-limit, publish with
    /// confirm-and-retry. Intended to be spawned `runtime.publish_workers`
    /// times.
    pub async fn run_worker(self: Arc<Self>, bridge: Arc<RedisBridge>) {
        loop {
            let env = self.dequeue().await;
            self.rate_limiter.acquire().await;
            self.deliver_with_retry(&bridge, env).await;
        }
    }

    async fn deliver_with_retry(&self, bridge: &RedisBridge, mut env: PublishEnvelope) {
        loop {
            match bridge.publish(&env.topic, &env.payload).await {
                Ok(()) => return,
                Err(e) => {
                    env.attempts += 1;
                    if env.attempts > self.max_retries {
                        error!(
                            "publish exhausted after {} attempts on topic {}: {e}",
                            env.attempts, env.topic
                        );
                        self.record_exhaustion(&env.topic);
                        return;
                    }
                    let delay = compute_backoff(Duration::from_millis(200), env.attempts, Duration::from_secs(5));
                    warn!(
                        "publish attempt {} failed for topic {} ({e}); retrying in {delay:?}",
                        env.attempts, env.topic
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Simple token bucket: refills `rate_per_sec` tokens per second, up to a
/// burst of `rate_per_sec`. A rate of 0 disables limiting entirely.
struct RateLimiter {
    rate_per_sec: f64,
    state: Mutex<(f64, Instant)>,
}

impl RateLimiter {
    fn new(rate_per_sec: u32) -> Self {
        Self {
            rate_per_sec: rate_per_sec as f64,
            state: Mutex::new((rate_per_sec as f64, Instant::now())),
        }
    }

    async fn acquire(&self) {
        if self.rate_per_sec <= 0.0 {
            return;
        }
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let (tokens, last) = &mut *state;
                let elapsed = last.elapsed().as_secs_f64();
                *tokens = (*tokens + elapsed * self.rate_per_sec).min(self.rate_per_sec);
                *last = Instant::now();
                if *tokens >= 1.0 {
                    *tokens -= 1.0;
                    None
                } else {
                    Some(Duration::from_secs_f64((1.0 - *tokens) / self.rate_per_sec))
                }
            };
            match wait {
                None => return,
                Some(d) => tokio::time::sleep(d).await,
            }
        }
    }
}

/// Redis pub/sub bridge. Opens a fresh connection per publish — connections
/// are cheap and this avoids holding a long-lived connection across
/// reconnect cycles.
pub struct RedisBridge {
    client: redis::Client,
}

impl RedisBridge {
    pub fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| IngestError::Config(format!("invalid redis url: {e}")))?;
        Ok(Self { client })
    }

    pub async fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        let mut con = self.client.get_async_connection().await.map_err(|e| {
            warn!("redis connection failed: {e}");
            IngestError::PublishExhausted {
                topic: topic.to_string(),
                attempts: 1,
            }
        })?;
        con.publish::<_, _, ()>(topic, payload)
            .await
            .map_err(|e| {
                warn!("redis publish failed: {e}");
                IngestError::PublishExhausted {
                    topic: topic.to_string(),
                    attempts: 1,
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_ordering_places_critical_above_low() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Medium > Priority::Low);
    }

    #[tokio::test]
    async fn dequeue_drains_critical_before_lower_lanes() {
        let fabric = PublishFabric::new(0, 3);
        fabric
            .enqueue(PublishEnvelope::new("t", "low-msg", Priority::Low, 0))
            .await;
        fabric
            .enqueue(PublishEnvelope::new("t", "critical-msg", Priority::Critical, 0))
            .await;

        let first = fabric.dequeue().await;
        assert_eq!(first.payload, "critical-msg");
        let second = fabric.dequeue().await;
        assert_eq!(second.payload, "low-msg");
    }

    #[tokio::test]
    async fn lane_overflow_drops_oldest_and_counts_it() {
        let fabric = PublishFabric::new(0, 3);
        for i in 0..(LANE_CAPACITY + 5) {
            fabric
                .enqueue(PublishEnvelope::new("t", format!("{i}"), Priority::Low, 0))
                .await;
        }
        let dropped = fabric.dropped_counts();
        let low_dropped = dropped.iter().find(|(p, _)| *p == Priority::Low).unwrap().1;
        assert_eq!(low_dropped, 5);
    }

    #[test]
    fn dropped_for_topic_defaults_to_zero() {
        let fabric = PublishFabric::new(0, 3);
        assert_eq!(fabric.dropped_for_topic("trade:binance:btcusdt"), 0);
    }

    #[test]
    fn record_exhaustion_increments_only_the_named_topic() {
        let fabric = PublishFabric::new(0, 3);
        fabric.record_exhaustion("depth:binance:btcusdt");
        fabric.record_exhaustion("depth:binance:btcusdt");
        assert_eq!(fabric.dropped_for_topic("depth:binance:btcusdt"), 2);
        assert_eq!(fabric.dropped_for_topic("trade:binance:btcusdt"), 0);
    }

    #[tokio::test]
    async fn rate_limiter_of_zero_never_blocks() {
        let limiter = RateLimiter::new(0);
        for _ in 0..1000 {
            limiter.acquire().await;
        }
    }
}
