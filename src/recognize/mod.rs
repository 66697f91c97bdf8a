//! Recognition stream adapter
//!
//! This module provides the `RecognizeStream` endpoint that the application
//! writes audio into and reads results from:
//! - Lazy connection on first write
//! - Queuing of writes until the service is listening
//! - Backpressure on writes once audio is flowing
//! - Decoding of service messages into notifications and finalized output
//! - Graceful end-of-input and forced stop

mod config;
mod events;
mod stats;
mod stream;

pub use config::{RecognizeOptions, DEFAULT_BACKPRESSURE_THRESHOLD, DEFAULT_RETRY_INTERVAL};
pub use events::{RecognizeEvent, Transcripts};
pub use stats::StreamStats;
pub use stream::{RecognizeStream, StreamPhase};
