use thiserror::Error;

/// Errors surfaced by session establishment and messaging.
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    /// Signaling or connection failure in the underlying transport.
    #[error("transport error: {0}")]
    Transport(String),

    /// Capacity policy violation. Surfaced, never retried.
    #[error("room {room_id} is full (capacity {capacity})")]
    RoomFull { room_id: String, capacity: usize },

    /// Send attempted before the link handshake completed. Callers must
    /// await the endpoint's readiness future first.
    #[error("not connected: the link handshake has not completed")]
    NotConnected,

    #[error("unsupported event kind: {0:?}")]
    UnsupportedEvent(String),

    #[error("session closed")]
    Closed,

    #[error("player error: {0}")]
    Player(#[from] PlayerError),
}

/// Errors reported by the player collaborator.
#[derive(Debug, Clone, Error)]
pub enum PlayerError {
    #[error("media rejected: {0:?}")]
    MediaRejected(String),

    #[error("seek out of range: {0}s")]
    SeekOutOfRange(f64),

    #[error("invalid playback rate: {0}")]
    InvalidRate(f64),

    /// Anything the backing player surface reports that has no finer shape.
    #[error("{0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, SessionError>;
