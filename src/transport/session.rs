use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use url::Url;

use crate::error::{RecognizeError, Result};

/// Lifecycle of one transport connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Created, `open` not called yet
    Idle,
    /// Handshake in progress
    Connecting,
    /// Socket open; sends are accepted
    Ready,
    /// Close requested, waiting for the socket to shut down
    Stopping,
    /// Terminal
    Closed,
}

impl SessionState {
    fn as_u8(self) -> u8 {
        match self {
            SessionState::Idle => 0,
            SessionState::Connecting => 1,
            SessionState::Ready => 2,
            SessionState::Stopping => 3,
            SessionState::Closed => 4,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Idle,
            1 => SessionState::Connecting,
            2 => SessionState::Ready,
            3 => SessionState::Stopping,
            _ => SessionState::Closed,
        }
    }
}

/// Session state shared between the session handle and its connection task
#[derive(Debug, Clone)]
pub struct SharedState(Arc<AtomicU8>);

impl SharedState {
    pub fn new(state: SessionState) -> Self {
        Self(Arc::new(AtomicU8::new(state.as_u8())))
    }

    pub fn get(&self) -> SessionState {
        SessionState::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub fn set(&self, state: SessionState) {
        self.0.store(state.as_u8(), Ordering::SeqCst);
    }

    /// Move `from -> to` only if the state is still `from`
    pub fn advance(&self, from: SessionState, to: SessionState) -> bool {
        self.0
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// A received frame, tagged by its wire type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

/// Everything the transport reports, delivered in arrival order
#[derive(Debug)]
pub enum TransportEvent {
    Open,
    Message(Frame),
    Error(RecognizeError),
    Close { code: u16, reason: String },
}

/// Receiving end of the single inbound-notification pathway
pub type EventHandler = mpsc::UnboundedSender<TransportEvent>;

/// Close code reported when the socket went away without a close frame
pub const ABNORMAL_CLOSE: u16 = 1006;

/// Close code reported when the peer's close frame carried no status
pub const NO_STATUS_RECEIVED: u16 = 1005;

/// One outbound connection to the recognition service.
///
/// Implementations never reconnect. After an error the session reports a
/// `Close` and stays `Closed`; a new attempt needs a new session.
pub trait Transport: Send {
    /// Start connecting. Returns once the attempt is under way; readiness or
    /// failure is reported through `handler`. A second call is an error.
    fn open(
        &mut self,
        endpoint: &Url,
        headers: &HashMap<String, String>,
        handler: EventHandler,
    ) -> Result<()>;

    /// Transmit a binary frame. Fails with `NotReadyToSend` unless `Ready`.
    fn send(&self, data: Bytes) -> Result<()>;

    /// Transmit a text control token. While connecting the token is held
    /// back and written as soon as the socket opens.
    fn send_control(&self, token: &str) -> Result<()>;

    /// Close the connection. Closing twice is a no-op.
    fn close(&mut self);

    fn state(&self) -> SessionState;

    /// Bytes accepted by `send`/`send_control` but not yet written out
    fn buffered_amount(&self) -> usize;
}
