use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Statistics about a recognition stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamStats {
    /// Identifier used in log lines for this stream
    pub session_id: String,

    /// When the stream was created
    pub started_at: DateTime<Utc>,

    /// When the service first reported it was listening
    pub listening_at: Option<DateTime<Utc>>,

    /// Audio bytes handed to the transport
    pub bytes_sent: usize,

    /// Audio chunks handed to the transport
    pub chunks_sent: usize,

    /// Chunks that had to wait for the service to start listening
    pub chunks_queued: usize,

    pub partial_results: usize,
    pub final_results: usize,

    /// Error notifications emitted
    pub errors: usize,

    /// Close code reported by the transport, once closed
    pub close_code: Option<u16>,
}

impl StreamStats {
    pub fn new(session_id: String) -> Self {
        Self {
            session_id,
            started_at: Utc::now(),
            listening_at: None,
            bytes_sent: 0,
            chunks_sent: 0,
            chunks_queued: 0,
            partial_results: 0,
            final_results: 0,
            errors: 0,
            close_code: None,
        }
    }
}
