use std::collections::HashMap;
use std::time::Duration;
use url::Url;

/// Outstanding-bytes ceiling at or below which a write is acknowledged
pub const DEFAULT_BACKPRESSURE_THRESHOLD: usize = 16 * 1024;

/// How often a held write re-checks the transport's outstanding bytes
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Construction options for a recognition stream
#[derive(Debug, Clone)]
pub struct RecognizeOptions {
    /// Service endpoint, including access token and audio format query parameters
    pub endpoint: Url,

    /// Protocol headers sent with the connection request
    pub headers: HashMap<String, String>,

    /// Backpressure threshold in bytes
    pub backpressure_threshold: usize,

    /// Retry interval for the backpressure check
    pub retry_interval: Duration,
}

impl RecognizeOptions {
    pub fn new(endpoint: Url) -> Self {
        Self {
            endpoint,
            headers: HashMap::new(),
            backpressure_threshold: DEFAULT_BACKPRESSURE_THRESHOLD,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}
