pub mod audio;
pub mod config;
pub mod error;
pub mod recognize;
pub mod transport;

pub use audio::{pipe, AudioSource, ChannelSource, RawFileSource};
pub use config::Config;
pub use error::{RecognizeError, Result};
pub use recognize::{
    RecognizeEvent, RecognizeOptions, RecognizeStream, StreamPhase, StreamStats, Transcripts,
};
pub use transport::{SessionState, Transport, TransportEvent, WebSocketSession};
