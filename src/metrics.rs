//! Ambient metrics and health aggregation, published on the `health` topic.
//!
//! A windowed counter per component feeding a threshold check, the same
//! shape as any other circuit-breaker evaluator: per-component
//! message/error counters feed a three-state `ComponentHealth`.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentHealth {
    Ok,
    Degraded,
    Down,
}

/// One component's rolling counters: messages handled,
/// errors/drops, and the timestamp of the last successful message, which
/// together decide its `ComponentHealth`.
#[derive(Default)]
pub struct ComponentCounters {
    messages: AtomicU64,
    errors: AtomicU64,
    drops: AtomicU64,
    last_message_ms: AtomicU64,
}

impl ComponentCounters {
    pub fn record_message(&self, now_ms: i64) {
        self.messages.fetch_add(1, Ordering::Relaxed);
        self.last_message_ms.store(now_ms as u64, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_drop(&self) {
        self.drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            messages: self.messages.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            drops: self.drops.load(Ordering::Relaxed),
            last_message_ms: self.last_message_ms.load(Ordering::Relaxed) as i64,
        }
    }

    /// Degraded once errors exceed 5% of traffic over the observed window;
    /// down once nothing has come through for `silence_timeout_ms` despite
    /// having seen at least one message (a component that never started is
    /// a startup problem, not a health one).
    pub fn health(&self, now_ms: i64, silence_timeout_ms: i64) -> ComponentHealth {
        let s = self.snapshot();
        if s.messages == 0 {
            return ComponentHealth::Ok;
        }
        if now_ms - s.last_message_ms > silence_timeout_ms {
            return ComponentHealth::Down;
        }
        let error_rate = s.errors as f64 / s.messages as f64;
        if error_rate > 0.05 {
            ComponentHealth::Degraded
        } else {
            ComponentHealth::Ok
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub messages: u64,
    pub errors: u64,
    pub drops: u64,
    pub last_message_ms: i64,
}

/// A named set of per-component counters plus the aggregate rollup used for
/// the `health` topic.
#[derive(Default)]
pub struct MetricsRegistry {
    pub sessions: ComponentCounters,
    pub orderbook: ComponentCounters,
    pub candles: ComponentCounters,
    pub flow: ComponentCounters,
    pub publish: ComponentCounters,
    pub fanout: ComponentCounters,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub sessions: ComponentHealth,
    pub orderbook: ComponentHealth,
    pub candles: ComponentHealth,
    pub flow: ComponentHealth,
    pub publish: ComponentHealth,
    pub fanout: ComponentHealth,
    pub overall: ComponentHealth,
}

impl MetricsRegistry {
    pub fn health_report(&self, now_ms: i64, silence_timeout_ms: i64) -> HealthReport {
        let sessions = self.sessions.health(now_ms, silence_timeout_ms);
        let orderbook = self.orderbook.health(now_ms, silence_timeout_ms);
        let candles = self.candles.health(now_ms, silence_timeout_ms);
        let flow = self.flow.health(now_ms, silence_timeout_ms);
        let publish = self.publish.health(now_ms, silence_timeout_ms);
        let fanout = self.fanout.health(now_ms, silence_timeout_ms);

        let components = [sessions, orderbook, candles, flow, publish, fanout];
        let overall = if components.iter().any(|h| *h == ComponentHealth::Down) {
            ComponentHealth::Down
        } else if components.iter().any(|h| *h == ComponentHealth::Degraded) {
            ComponentHealth::Degraded
        } else {
            ComponentHealth::Ok
        };

        HealthReport {
            sessions,
            orderbook,
            candles,
            flow,
            publish,
            fanout,
            overall,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_traffic_is_ok_not_down() {
        let counters = ComponentCounters::default();
        assert_eq!(counters.health(1_000_000, 30_000), ComponentHealth::Ok);
    }

    #[test]
    fn silence_past_timeout_is_down() {
        let counters = ComponentCounters::default();
        counters.record_message(0);
        assert_eq!(counters.health(31_000, 30_000), ComponentHealth::Down);
    }

    #[test]
    fn high_error_rate_is_degraded_not_down() {
        let counters = ComponentCounters::default();
        for _ in 0..100 {
            counters.record_message(0);
        }
        for _ in 0..10 {
            counters.record_error();
        }
        assert_eq!(counters.health(0, 30_000), ComponentHealth::Degraded);
    }

    #[test]
    fn overall_health_is_the_worst_component() {
        let registry = MetricsRegistry::default();
        registry.sessions.record_message(0);
        registry.orderbook.record_message(0);
        let report = registry.health_report(40_000, 30_000);
        assert_eq!(report.overall, ComponentHealth::Down);
    }
}
