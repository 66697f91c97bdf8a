use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

use crate::error::RecognizeError;

/// Side-channel notifications from a recognition stream
#[derive(Debug)]
pub enum RecognizeEvent {
    /// The service accepted the session and queued audio was released
    Listening,
    /// Interim or finalized transcript
    Results { transcript: String, is_final: bool },
    /// Advisory unless followed by `Close`
    Error(RecognizeError),
    /// The connection is gone; no further output will be produced
    Close { code: u16, reason: String },
    /// `stop()` was called
    Stopping,
}

/// Output side of a recognition stream: one payload per finalized message.
///
/// Ends when the underlying connection closes.
pub struct Transcripts {
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl Transcripts {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<Bytes>) -> Self {
        Self { rx }
    }

    /// Next finalized payload, or `None` once the stream has ended
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}

impl Stream for Transcripts {
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
