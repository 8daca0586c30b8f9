//! Downstream fan-out: the subscriber registry that routes published
//! envelopes out to connected WebSocket clients by topic.
//!
//! The topic -> client inverted index follows the same `DashMap`-sharded,
//! `RwLock`-per-bucket discipline as the rest of the crate's shared state
//! (`orderbook.rs`, `candle.rs`): many readers (publish workers checking who
//! to notify) never block each other, and a writer (subscribe/unsubscribe)
//! only takes the lock for the one topic bucket it's touching.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

const CLIENT_QUEUE_CAPACITY: usize = 1_000;

pub type ClientId = Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ClientRequest {
    Subscribe { topics: Vec<String> },
    Unsubscribe { topics: Vec<String> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Success { topics: Vec<String> },
    Error { message: String },
    Batch { messages: Vec<String> },
}

struct ClientHandle {
    sender: mpsc::Sender<String>,
    dropped: AtomicU64,
}

/// The fan-out registry. One instance shared across every connected client
/// and every publish worker.
pub struct FanoutRegistry {
    clients: DashMap<ClientId, Arc<ClientHandle>>,
    topic_index: DashMap<String, RwLock<HashSet<ClientId>>>,
}

impl FanoutRegistry {
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
            topic_index: DashMap::new(),
        }
    }

    /// Registers a new client connection, returning its id and the receiving
    /// half of its bounded outbound queue (the caller's WS write task drains
    /// this and forwards frames to the socket).
    pub fn register(&self) -> (ClientId, mpsc::Receiver<String>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE_CAPACITY);
        self.clients.insert(
            id,
            Arc::new(ClientHandle {
                sender: tx,
                dropped: AtomicU64::new(0),
            }),
        );
        (id, rx)
    }

    pub async fn deregister(&self, client: ClientId) {
        self.clients.remove(&client);
        for entry in self.topic_index.iter() {
            entry.value().write().await.remove(&client);
        }
    }

    pub async fn subscribe(&self, client: ClientId, topics: &[String]) {
        for topic in topics {
            let bucket = self.topic_index.entry(topic.clone()).or_default();
            bucket.write().await.insert(client);
        }
    }

    pub async fn unsubscribe(&self, client: ClientId, topics: &[String]) {
        for topic in topics {
            if let Some(bucket) = self.topic_index.get(topic) {
                bucket.write().await.remove(&client);
            }
        }
    }

    /// Delivers `payload` to every client subscribed to `topic`. A client
    /// whose outbound queue is full has the frame dropped for it
    /// specifically — slow clients never back-pressure the fabric — and
    /// its drop counter incremented.
    pub async fn publish_to_topic(&self, topic: &str, payload: &str) {
        let Some(bucket) = self.topic_index.get(topic) else {
            return;
        };
        let subscribers: Vec<ClientId> = bucket.read().await.iter().copied().collect();
        for client_id in subscribers {
            if let Some(handle) = self.clients.get(&client_id) {
                if handle.sender.try_send(payload.to_string()).is_err() {
                    handle.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub async fn subscriber_count(&self, topic: &str) -> usize {
        match self.topic_index.get(topic) {
            Some(bucket) => bucket.read().await.len(),
            None => 0,
        }
    }

    pub fn dropped_for(&self, client: ClientId) -> u64 {
        self.clients
            .get(&client)
            .map(|h| h.dropped.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

impl Default for FanoutRegistry {
    fn default() -> Self {
        Self::new()
    }
}
