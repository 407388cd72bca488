/// Failures the pipeline distinguishes when deciding whether to retry,
/// surface an error frame, or tear a stream down.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Malformed frame or out-of-order control message. Closes the
    /// offending connection only.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The underlying connection or pipe dropped.
    #[error("transport error: {0}")]
    Transport(String),

    /// An object storage operation failed.
    #[error("storage operation failed: {0}")]
    Storage(#[from] opendal::Error),

    /// A broker log or keyspace operation failed.
    #[error("broker operation failed: {0}")]
    Broker(String),

    /// The muxer child could not be spawned, exited non-zero, or flagged
    /// an error on stderr.
    #[error("muxer failed: {0}")]
    Muxer(String),

    /// A chunk gap exceeded the drain tolerance.
    #[error("chunk sequence gap on {stream_id}: expected {expected}, got {got}")]
    Sequence {
        stream_id: String,
        expected: u64,
        got: u64,
    },

    /// Failed to acquire or lost a stream claim.
    #[error("ownership error on {stream_id}: {detail}")]
    Ownership { stream_id: String, detail: String },
}

impl PipelineError {
    pub fn protocol(detail: impl Into<String>) -> Self {
        Self::Protocol(detail.into())
    }

    pub fn broker(detail: impl std::fmt::Display) -> Self {
        Self::Broker(detail.to_string())
    }

    /// Protocol errors are answered with an `error` frame and a close;
    /// everything else is connection-fatal without ceremony.
    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::Protocol(_))
    }
}

impl From<redis::RedisError> for PipelineError {
    fn from(err: redis::RedisError) -> Self {
        Self::Broker(err.to_string())
    }
}
