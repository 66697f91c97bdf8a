use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::Result;
use crate::recognize::RecognizeStream;

/// Ordered supplier of opaque audio chunks
///
/// Implementations:
/// - `RawFileSource`: reads a raw audio file in fixed-size chunks
/// - `ChannelSource`: chunks pushed by a live producer (e.g. a capture callback)
#[async_trait::async_trait]
pub trait AudioSource: Send {
    /// Next chunk, or `None` once the input has ended
    async fn next_chunk(&mut self) -> Result<Option<Bytes>>;

    /// Source name for logging
    fn name(&self) -> &str;
}

/// Audio source fed through a channel; ends when every sender is dropped
pub struct ChannelSource {
    rx: mpsc::Receiver<Bytes>,
}

impl ChannelSource {
    pub fn new(rx: mpsc::Receiver<Bytes>) -> Self {
        Self { rx }
    }

    /// Bounded channel pair; a full channel holds back the producer
    pub fn channel(capacity: usize) -> (mpsc::Sender<Bytes>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self::new(rx))
    }
}

#[async_trait::async_trait]
impl AudioSource for ChannelSource {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        Ok(self.rx.recv().await)
    }

    fn name(&self) -> &str {
        "channel"
    }
}

/// Write every chunk from `source` into `stream`, then signal end of input.
///
/// Each write waits for the stream's acknowledgement, so a slow service
/// slows down reading from the source. Returns the number of bytes written.
pub async fn pipe(source: &mut dyn AudioSource, stream: &mut RecognizeStream) -> Result<usize> {
    info!("Piping audio from {} into stream {}", source.name(), stream.session_id());

    let mut total = 0;
    let mut chunks = 0;
    while let Some(chunk) = source.next_chunk().await? {
        total += chunk.len();
        chunks += 1;
        stream.write(chunk).await?;
    }

    debug!("Audio source {} ended after {} chunks", source.name(), chunks);
    stream.finish().await?;

    info!("Finished piping {} bytes from {}", total, source.name());
    Ok(total)
}
