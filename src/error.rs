// =============================================================================
// Error taxonomy — the kinds every subsystem's outer loop knows how to absorb
// =============================================================================
//
// No variant here is fatal to a process. Each subsystem's main loop matches
// on these to decide whether to retry immediately, sleep, or move on to the
// next instrument/minute; the loop itself never exits because of one.
// =============================================================================

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    /// Network or HTTP failure talking to the broker.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Malformed or unexpected frame on the tick socket. Logged and dropped;
    /// never tears down the socket itself.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A stored bar failed to decode as JSON.
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// The broker surfaced an unauthenticated session (sts frame or HTTP 401).
    #[error("session is unauthenticated")]
    Unauthenticated,

    /// A per-instrument or per-minute deadline elapsed.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The keyed store failed (network, protocol, or command error).
    #[error("store error: {0}")]
    Store(#[from] redis::RedisError),

    /// The websocket transport itself failed or closed.
    #[error("socket error: {0}")]
    Socket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Startup-time configuration problem. The only variant a binary's
    /// `main` is expected to propagate as a non-zero exit.
    #[error("configuration error: {0}")]
    Config(String),
}
