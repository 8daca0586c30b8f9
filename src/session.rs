//! Session supervisor: owns one transport connection per (venue,
//! symbol-set), including the `DISCONNECTED -> DIALING -> SUBSCRIBING ->
//! CONNECTED -> (STALE|DISCONNECTED)` state machine, backoff, and venue
//! keepalive.
//!
//! A reconnect-forever loop parametric over any `VenueCodec`: dial,
//! subscribe in chunks, read loop, exponential backoff on failure.

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use log::{error, info, warn};
use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;

use crate::codec::VenueCodec;
use crate::error::{IngestError, Result};
use crate::model::{ControlMsg, Event};
use crate::venue::{Symbol, Venue, VenueDescriptor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Dialing,
    Subscribing,
    Connected,
    Stale,
}

/// `min(base * 2^attempts, max)` plus up to 20% jitter.
pub fn compute_backoff(base: Duration, attempts: u32, max: Duration) -> Duration {
    let scaled = base.as_millis().saturating_mul(1u128 << attempts.min(20));
    let capped = scaled.min(max.as_millis());
    let jitter_frac = rand::thread_rng().gen_range(0.0..0.2);
    let jittered = (capped as f64 * (1.0 + jitter_frac)) as u64;
    Duration::from_millis(jittered)
}

/// Shared session health, read by the health/metrics component without
/// taking any lock — a handful of atomics instead of a full struct behind
/// a mutex.
pub struct SessionHandle {
    pub venue: Venue,
    state: std::sync::Mutex<SessionState>,
    last_frame_ms: AtomicI64,
    last_pong_ms: AtomicI64,
    reconnect_attempts: AtomicU32,
}

impl SessionHandle {
    pub fn new(venue: Venue) -> Arc<Self> {
        Arc::new(Self {
            venue,
            state: std::sync::Mutex::new(SessionState::Disconnected),
            last_frame_ms: AtomicI64::new(now_ms()),
            last_pong_ms: AtomicI64::new(now_ms()),
            reconnect_attempts: AtomicU32::new(0),
        })
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, s: SessionState) {
        *self.state.lock().unwrap() = s;
    }

    fn touch_frame(&self) {
        self.last_frame_ms.store(now_ms(), Ordering::Relaxed);
    }

    fn touch_pong(&self) {
        self.last_pong_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub fn is_stale(&self, heartbeat_timeout: Duration) -> bool {
        let last = self.last_frame_ms.load(Ordering::Relaxed);
        now_ms().saturating_sub(last) > heartbeat_timeout.as_millis() as i64
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Owns one venue's transport connection and all symbols subscribed on it.
pub struct SessionSupervisor {
    codec: Box<dyn VenueCodec>,
    descriptor: VenueDescriptor,
    symbols: Vec<Symbol>,
    handle: Arc<SessionHandle>,
}

impl SessionSupervisor {
    pub fn new(codec: Box<dyn VenueCodec>, symbols: Vec<Symbol>) -> Self {
        let venue = codec.venue();
        let descriptor = venue.descriptor();
        Self {
            codec,
            descriptor,
            symbols,
            handle: SessionHandle::new(venue),
        }
    }

    pub fn handle(&self) -> Arc<SessionHandle> {
        self.handle.clone()
    }

    /// Runs the reconnect-forever loop, forwarding decoded events onto
    /// `event_tx`. Returns only if `event_tx` is closed (shutdown).
    pub async fn run(&self, event_tx: mpsc::Sender<Event>) {
        let base_backoff = Duration::from_secs(1);
        let max_backoff = Duration::from_secs(60);

        loop {
            self.handle.set_state(SessionState::Dialing);
            match self.connect_and_run(&event_tx).await {
                Ok(()) => {
                    // Clean shutdown requested by caller (event_tx dropped).
                    self.handle.set_state(SessionState::Disconnected);
                    return;
                }
                Err(e) => {
                    warn!("[{}] session error: {e}", self.handle.venue);
                }
            }

            self.handle.set_state(SessionState::Disconnected);
            let attempts = self.handle.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
            let delay = compute_backoff(base_backoff, attempts, max_backoff);
            info!(
                "[{}] reconnecting in {:?} (attempt {attempts})",
                self.handle.venue, delay
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn connect_and_run(&self, event_tx: &mpsc::Sender<Event>) -> Result<()> {
        let url = self.descriptor.ws_base;
        let (ws_stream, _) = connect_async(url).await.map_err(|e| IngestError::Transport {
            venue: self.handle.venue,
            message: e.to_string(),
        })?;
        self.handle.reconnect_attempts.store(0, Ordering::Relaxed);
        self.handle.set_state(SessionState::Subscribing);

        let (mut write, mut read) = ws_stream.split();

        for symbol in &self.symbols {
            for payload in self.codec.subscribe_payloads(symbol) {
                write
                    .send(Message::Text(payload))
                    .await
                    .map_err(|e| IngestError::Transport {
                        venue: self.handle.venue,
                        message: e.to_string(),
                    })?;
            }
        }

        let ack_deadline = Instant::now() + self.descriptor.subscribe_timeout;
        let mut acked = false;
        while Instant::now() < ack_deadline && !acked {
            let remaining = ack_deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, read.next()).await {
                Ok(Some(Ok(Message::Text(text)))) => {
                    self.handle.touch_frame();
                    for event in self.codec.decode(&text) {
                        match event {
                            Event::Control(ControlMsg::SubscribeAck { .. }) => acked = true,
                            Event::Control(ControlMsg::SubscribeReject { reason, .. }) => {
                                return Err(IngestError::SubscriptionRejected {
                                    venue: self.handle.venue,
                                    symbol: self
                                        .symbols
                                        .first()
                                        .cloned()
                                        .unwrap_or_else(|| Symbol::new("")),
                                    message: reason,
                                });
                            }
                            other => {
                                if event_tx.send(other).await.is_err() {
                                    return Ok(());
                                }
                            }
                        }
                    }
                }
                Ok(Some(Ok(_))) => {}
                Ok(Some(Err(e))) => {
                    return Err(IngestError::Transport {
                        venue: self.handle.venue,
                        message: e.to_string(),
                    })
                }
                Ok(None) => {
                    return Err(IngestError::Transport {
                        venue: self.handle.venue,
                        message: "stream closed during subscribe".into(),
                    })
                }
                Err(_) => break,
            }
        }
        if !acked {
            return Err(IngestError::SubscribeTimeout {
                venue: self.handle.venue,
                symbol: self.symbols.first().cloned().unwrap_or_else(|| Symbol::new("")),
            });
        }

        self.handle.set_state(SessionState::Connected);
        info!("[{}] connected and subscribed", self.handle.venue);

        let mut ping_ticker = tokio::time::interval(self.descriptor.ping_interval);
        loop {
            tokio::select! {
                _ = ping_ticker.tick() => {
                    if let Some(payload) = self.codec.ping_payload() {
                        if write.send(Message::Text(payload)).await.is_err() {
                            return Err(IngestError::Transport {
                                venue: self.handle.venue,
                                message: "ping write failed".into(),
                            });
                        }
                    } else if write.send(Message::Ping(vec![])).await.is_err() {
                        return Err(IngestError::Transport {
                            venue: self.handle.venue,
                            message: "ping write failed".into(),
                        });
                    }
                    if self.handle.is_stale(self.descriptor.heartbeat_timeout()) {
                        self.handle.set_state(SessionState::Stale);
                        warn!("[{}] stale: no frames for > heartbeat timeout", self.handle.venue);
                        return Err(IngestError::Transport {
                            venue: self.handle.venue,
                            message: "heartbeat timeout".into(),
                        });
                    }
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.handle.touch_frame();
                            for event in self.codec.decode(&text) {
                                match event {
                                    Event::Control(ControlMsg::Pong) => self.handle.touch_pong(),
                                    Event::Control(ControlMsg::Ping) => {
                                        if let Some(pong) = pong_reply(&self.handle.venue) {
                                            let _ = write.send(Message::Text(pong)).await;
                                        }
                                    }
                                    Event::Control(_) => {}
                                    other => {
                                        if event_tx.send(other).await.is_err() {
                                            return Ok(());
                                        }
                                    }
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            self.handle.touch_frame();
                            let _ = write.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Pong(_))) => self.handle.touch_pong(),
                        Some(Ok(Message::Close(_))) | None => {
                            return Err(IngestError::Transport {
                                venue: self.handle.venue,
                                message: "connection closed by peer".into(),
                            });
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            return Err(IngestError::Transport {
                                venue: self.handle.venue,
                                message: e.to_string(),
                            })
                        }
                    }
                }
            }
        }
    }
}

fn pong_reply(venue: &Venue) -> Option<String> {
    match venue {
        Venue::Okx => Some("pong".to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps_at_max() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(60);
        // Strip jitter by checking the floor (jitter only adds up to 20%).
        assert!(compute_backoff(base, 0, max) >= base);
        assert!(compute_backoff(base, 1, max) >= Duration::from_secs(2));
        assert!(compute_backoff(base, 10, max) <= Duration::from_millis(72_000));
    }

    #[test]
    fn session_handle_starts_disconnected() {
        let h = SessionHandle::new(Venue::Binance);
        assert_eq!(h.state(), SessionState::Disconnected);
    }

    #[test]
    fn stale_detection_respects_heartbeat_timeout() {
        let h = SessionHandle::new(Venue::Binance);
        assert!(!h.is_stale(Duration::from_secs(60)));
        h.last_frame_ms.store(now_ms() - 120_000, Ordering::Relaxed);
        assert!(h.is_stale(Duration::from_secs(60)));
    }
}
