use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message, Utf8Bytes};
use tracing::{debug, error, info, warn};
use url::Url;

use super::session::{
    EventHandler, Frame, SessionState, SharedState, Transport, TransportEvent, ABNORMAL_CLOSE,
    NO_STATUS_RECEIVED,
};
use crate::error::{RecognizeError, Result};

/// How long a close waits for the peer's close frame before dropping the socket
pub const CLOSE_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

enum Outbound {
    /// Frame plus the byte count it added to the buffered amount
    Frame(Message, usize),
    Close,
}

/// WebSocket connection to the recognition service
pub struct WebSocketSession {
    state: SharedState,
    buffered: Arc<AtomicUsize>,
    outbound_tx: Option<mpsc::UnboundedSender<Outbound>>,
    /// Prefix for log lines, usually the owning stream's session id
    label: String,
    close_timeout: Duration,
}

impl WebSocketSession {
    pub fn new() -> Self {
        Self {
            state: SharedState::new(SessionState::Idle),
            buffered: Arc::new(AtomicUsize::new(0)),
            outbound_tx: None,
            label: "ws".to_string(),
            close_timeout: CLOSE_HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    fn enqueue(&self, message: Message, len: usize) -> Result<()> {
        let tx = self.outbound_tx.as_ref().ok_or(RecognizeError::NotReadyToSend)?;

        self.buffered.fetch_add(len, Ordering::SeqCst);
        if tx.send(Outbound::Frame(message, len)).is_err() {
            release(&self.buffered, len);
            return Err(RecognizeError::transport("connection task has stopped"));
        }

        Ok(())
    }
}

impl Default for WebSocketSession {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for WebSocketSession {
    fn open(
        &mut self,
        endpoint: &Url,
        headers: &HashMap<String, String>,
        handler: EventHandler,
    ) -> Result<()> {
        if self.state.get() != SessionState::Idle {
            return Err(RecognizeError::AlreadyOpen);
        }

        let request = build_request(endpoint, headers)?;
        let runtime = tokio::runtime::Handle::try_current().map_err(RecognizeError::transport)?;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        self.outbound_tx = Some(outbound_tx);
        self.state.set(SessionState::Connecting);

        info!(
            "[{}] Connecting to recognition service at {}",
            self.label,
            redact(endpoint)
        );

        let connection = Connection {
            label: self.label.clone(),
            state: self.state.clone(),
            buffered: Arc::clone(&self.buffered),
            handler,
            close_timeout: self.close_timeout,
        };
        // Dropping the session drops the command queue, which closes the socket
        runtime.spawn(run_connection(request, outbound_rx, connection));

        Ok(())
    }

    fn send(&self, data: Bytes) -> Result<()> {
        if self.state.get() != SessionState::Ready {
            return Err(RecognizeError::NotReadyToSend);
        }

        let len = data.len();
        self.enqueue(Message::Binary(data), len)
    }

    fn send_control(&self, token: &str) -> Result<()> {
        match self.state.get() {
            SessionState::Connecting | SessionState::Ready => {
                debug!("[{}] Queueing control token {:?}", self.label, token);
                self.enqueue(Message::Text(Utf8Bytes::from(token.to_string())), token.len())
            }
            _ => Err(RecognizeError::NotReadyToSend),
        }
    }

    fn close(&mut self) {
        match self.state.get() {
            SessionState::Idle => self.state.set(SessionState::Closed),
            SessionState::Connecting | SessionState::Ready => {
                info!("[{}] Closing recognition service connection", self.label);
                self.state.set(SessionState::Stopping);
                if let Some(tx) = &self.outbound_tx {
                    let _ = tx.send(Outbound::Close);
                }
            }
            SessionState::Stopping | SessionState::Closed => {}
        }
    }

    fn state(&self) -> SessionState {
        self.state.get()
    }

    fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }
}

fn build_request(endpoint: &Url, headers: &HashMap<String, String>) -> Result<Request> {
    match endpoint.scheme() {
        "ws" | "wss" => {}
        other => {
            return Err(RecognizeError::InvalidEndpoint {
                message: format!("unsupported scheme '{}', expected ws or wss", other),
            })
        }
    }

    let mut request = endpoint
        .as_str()
        .into_client_request()
        .map_err(|e| RecognizeError::InvalidEndpoint {
            message: e.to_string(),
        })?;

    for (name, value) in headers {
        let header_name =
            HeaderName::from_bytes(name.as_bytes()).map_err(|e| RecognizeError::InvalidHeader {
                name: name.clone(),
                message: e.to_string(),
            })?;
        let header_value = HeaderValue::from_str(value).map_err(|e| RecognizeError::InvalidHeader {
            name: name.clone(),
            message: e.to_string(),
        })?;
        request.headers_mut().insert(header_name, header_value);
    }

    Ok(request)
}

/// Endpoint without its query string, which carries the access token
fn redact(endpoint: &Url) -> String {
    let mut shown = endpoint.clone();
    shown.set_query(None);
    shown.to_string()
}

/// Subtract from the buffered counter without wrapping below zero
fn release(buffered: &AtomicUsize, len: usize) {
    let _ = buffered.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
        Some(n.saturating_sub(len))
    });
}

/// State the connection task shares with its session handle
struct Connection {
    label: String,
    state: SharedState,
    buffered: Arc<AtomicUsize>,
    handler: EventHandler,
    close_timeout: Duration,
}

impl Connection {
    fn emit(&self, event: TransportEvent) {
        let _ = self.handler.send(event);
    }

    /// Refuse further commands, drop the ones still queued, then report the close
    fn report_closed(
        &self,
        outbound_rx: &mut mpsc::UnboundedReceiver<Outbound>,
        code: u16,
        reason: String,
    ) {
        outbound_rx.close();
        while outbound_rx.try_recv().is_ok() {}

        self.state.set(SessionState::Closed);
        self.buffered.store(0, Ordering::SeqCst);

        info!(
            "[{}] Recognition service connection closed (code={}, reason={:?})",
            self.label, code, reason
        );
        self.emit(TransportEvent::Close { code, reason });
    }
}

async fn run_connection(
    request: Request,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    conn: Connection,
) {
    let stream = match tokio_tungstenite::connect_async(request).await {
        Ok((stream, _response)) => stream,
        Err(e) => {
            error!("[{}] Failed to connect to recognition service: {}", conn.label, e);
            conn.emit(TransportEvent::Error(RecognizeError::transport(&e)));
            conn.report_closed(&mut outbound_rx, ABNORMAL_CLOSE, e.to_string());
            return;
        }
    };

    // A close requested during the handshake leaves the state at Stopping
    conn.state.advance(SessionState::Connecting, SessionState::Ready);
    info!("[{}] Connected to recognition service", conn.label);
    conn.emit(TransportEvent::Open);

    let (mut sink, mut source) = stream.split();
    // Set once a close frame has been sent; the peer must answer before it
    let mut close_deadline: Option<Instant> = None;
    let mut close_status: Option<(u16, String)> = None;

    loop {
        tokio::select! {
            command = outbound_rx.recv(), if close_deadline.is_none() => match command {
                Some(Outbound::Frame(message, len)) => {
                    let result = sink.send(message).await;
                    release(&conn.buffered, len);
                    if let Err(e) = result {
                        warn!("[{}] Failed to send frame: {}", conn.label, e);
                        conn.emit(TransportEvent::Error(RecognizeError::transport(&e)));
                        break;
                    }
                }
                Some(Outbound::Close) | None => {
                    let deadline = Instant::now() + conn.close_timeout;
                    close_deadline = Some(deadline);
                    conn.state.set(SessionState::Stopping);
                    let frame = CloseFrame {
                        code: CloseCode::Normal,
                        reason: Utf8Bytes::from_static(""),
                    };
                    match time::timeout_at(deadline, sink.send(Message::Close(Some(frame)))).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            debug!("[{}] Close frame not delivered: {}", conn.label, e);
                            break;
                        }
                        Err(_) => {
                            warn!("[{}] Peer stopped reading, dropping connection", conn.label);
                            break;
                        }
                    }
                }
            },
            _ = wait_until(close_deadline) => {
                warn!(
                    "[{}] No close frame from peer within {:?}, dropping connection",
                    conn.label, conn.close_timeout
                );
                break;
            }
            incoming = source.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    conn.emit(TransportEvent::Message(Frame::Text(text.as_str().to_owned())));
                }
                Some(Ok(Message::Binary(data))) => {
                    conn.emit(TransportEvent::Message(Frame::Binary(data)));
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!("[{}] Received close frame: {:?}", conn.label, frame);
                    close_status = Some(match frame {
                        Some(frame) => (u16::from(frame.code), frame.reason.as_str().to_owned()),
                        None => (NO_STATUS_RECEIVED, String::new()),
                    });
                }
                // Ping/pong are answered by tungstenite
                Some(Ok(_)) => {}
                Some(Err(WsError::ConnectionClosed)) | None => break,
                Some(Err(e)) => {
                    warn!("[{}] Recognition service connection error: {}", conn.label, e);
                    conn.emit(TransportEvent::Error(RecognizeError::transport(&e)));
                    break;
                }
            }
        }
    }

    drop(sink);
    drop(source);

    let (code, reason) = close_status.unwrap_or((ABNORMAL_CLOSE, String::new()));
    conn.report_closed(&mut outbound_rx, code, reason);
}

/// Resolves at `deadline`, or never when there is none
async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
