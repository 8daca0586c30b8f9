//! Error taxonomy shared by every component.
//!
//! Kinds, not names: each variant is a recovery *class*, not a single failure
//! site. Callers match on the variant to decide whether to retry locally,
//! reconnect, or propagate to the component's owner.

use thiserror::Error;

use crate::venue::{Symbol, Venue};

#[derive(Debug, Error)]
pub enum IngestError {
    /// Dial, read, write, or TLS failure on a venue transport. Recovered
    /// locally by the Session Supervisor with backoff — never fatal.
    #[error("transport fault on {venue:?}: {message}")]
    Transport { venue: Venue, message: String },

    /// Malformed frame or unrecognized topic. The single frame is dropped;
    /// the session stays open.
    #[error("protocol violation on {venue:?}: {message}")]
    Protocol { venue: Venue, message: String },

    /// The venue rejected (or never acked) a subscription request. Fatal for
    /// the current session — triggers a full reconnect.
    #[error("subscription rejected on {venue:?} for {symbol}: {message}")]
    SubscriptionRejected {
        venue: Venue,
        symbol: Symbol,
        message: String,
    },

    /// Subscribe handshake did not complete within the configured timeout.
    #[error("subscribe timeout on {venue:?} for {symbol}")]
    SubscribeTimeout { venue: Venue, symbol: Symbol },

    /// BookState invariant broken (crossed book, negative qty). Deltas are
    /// paused on that (venue, symbol) until a snapshot merge resets it.
    #[error("book invariant violated on {venue:?}:{symbol}: {message}")]
    BookCorruption {
        venue: Venue,
        symbol: Symbol,
        message: String,
    },

    /// An envelope exhausted `max_retries`. The caller increments a drop
    /// counter and continues; this is never process-terminating.
    #[error("publish exhausted for topic {topic} after {attempts} attempts")]
    PublishExhausted { topic: String, attempts: u32 },

    /// Startup-time configuration error. The only class of error in this
    /// crate that is permitted to be fatal before any session opens.
    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, IngestError>;
