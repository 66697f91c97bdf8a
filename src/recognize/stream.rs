use bytes::Bytes;
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::config::RecognizeOptions;
use super::events::{RecognizeEvent, Transcripts};
use super::stats::StreamStats;
use crate::error::{RecognizeError, Result};
use crate::transport::messages::{decode_frame, output_payload, InboundMessage, END_OF_STREAM};
use crate::transport::{SessionState, Transport, TransportEvent, WebSocketSession};

/// Adapter-level lifecycle, orthogonal to the transport's `SessionState`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamPhase {
    /// Nothing written yet, no connection
    Uninitialized,
    /// Connection opened, waiting for the service's `connected` message
    AwaitingReady,
    Listening,
    /// `stop()` called, waiting for the socket to close
    Stopping,
    /// Terminal
    Ended,
}

enum Pending {
    Audio(Bytes),
    EndOfStream,
}

struct StreamState {
    phase: StreamPhase,
    transport: Box<dyn Transport>,
    /// Writes accepted before the service started listening, in order
    pending: VecDeque<Pending>,
    input_finished: bool,
    eos_sent: bool,
    connected_seen: bool,
    output_tx: Option<mpsc::UnboundedSender<Bytes>>,
    events_tx: mpsc::UnboundedSender<RecognizeEvent>,
    stats: StreamStats,
}

impl StreamState {
    fn emit(&self, event: RecognizeEvent) {
        let _ = self.events_tx.send(event);
    }

    fn emit_error(&mut self, err: RecognizeError) {
        warn!("[{}] {}", self.stats.session_id, err);
        self.stats.errors += 1;
        self.emit(RecognizeEvent::Error(err));
    }

    fn queue_audio(&mut self, chunk: Bytes) {
        self.stats.chunks_queued += 1;
        self.pending.push_back(Pending::Audio(chunk));
    }

    fn send_audio(&mut self, chunk: Bytes) -> Result<()> {
        let len = chunk.len();
        self.transport.send(chunk)?;
        self.stats.bytes_sent += len;
        self.stats.chunks_sent += 1;
        Ok(())
    }

    fn send_end_of_stream(&mut self) -> Result<()> {
        if self.eos_sent {
            return Ok(());
        }
        self.transport.send_control(END_OF_STREAM)?;
        self.eos_sent = true;
        debug!("[{}] End of stream sent", self.stats.session_id);
        Ok(())
    }

    /// Forward everything queued before the service was listening
    fn drain_pending(&mut self) {
        let queued = self.pending.len();
        while let Some(item) = self.pending.pop_front() {
            let result = match item {
                Pending::Audio(chunk) => self.send_audio(chunk),
                Pending::EndOfStream => self.send_end_of_stream(),
            };
            if let Err(e) = result {
                self.pending.clear();
                self.emit_error(e);
                return;
            }
        }
        if queued > 0 {
            debug!("[{}] Released {} queued writes", self.stats.session_id, queued);
        }
    }

    /// Ends a stream that never opened a connection
    fn end_without_session(&mut self) {
        self.phase = StreamPhase::Ended;
        self.pending.clear();
        self.output_tx = None;
    }

    fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Open => {
                debug!("[{}] Socket open, waiting for service", self.stats.session_id);
            }
            TransportEvent::Message(frame) => {
                for message in decode_frame(&frame) {
                    self.handle_message(message);
                }
            }
            TransportEvent::Error(err) => self.emit_error(err),
            TransportEvent::Close { code, reason } => {
                let discarded = self.pending.len();
                if discarded > 0 {
                    warn!(
                        "[{}] Discarding {} queued writes after close",
                        self.stats.session_id, discarded
                    );
                }
                self.pending.clear();
                self.phase = StreamPhase::Ended;
                self.output_tx = None;
                self.stats.close_code = Some(code);
                info!(
                    "[{}] Stream closed (code={}, reason={:?})",
                    self.stats.session_id, code, reason
                );
                self.emit(RecognizeEvent::Close { code, reason });
            }
        }
    }

    fn handle_message(&mut self, message: InboundMessage) {
        match message {
            InboundMessage::Connected => {
                if self.connected_seen {
                    debug!("[{}] Ignoring repeated connected message", self.stats.session_id);
                    return;
                }
                self.connected_seen = true;
                if self.phase == StreamPhase::AwaitingReady {
                    info!("[{}] Service is listening", self.stats.session_id);
                    self.phase = StreamPhase::Listening;
                    self.stats.listening_at = Some(Utc::now());
                    self.drain_pending();
                    self.emit(RecognizeEvent::Listening);
                }
            }
            InboundMessage::Partial { transcript, .. } => {
                self.stats.partial_results += 1;
                self.emit(RecognizeEvent::Results {
                    transcript,
                    is_final: false,
                });
            }
            InboundMessage::Final {
                transcript,
                elements,
            } => {
                self.stats.final_results += 1;
                self.emit(RecognizeEvent::Results {
                    transcript,
                    is_final: true,
                });
                if let (Some(elements), Some(tx)) = (elements, &self.output_tx) {
                    let _ = tx.send(output_payload(&elements));
                }
            }
            InboundMessage::ServiceError { message, raw } => {
                self.emit_error(RecognizeError::ServiceReportedError { message, raw });
            }
            InboundMessage::Unrecognized { raw } => {
                self.emit_error(RecognizeError::UnrecognizedMessageType { raw });
            }
            InboundMessage::Malformed { raw, diagnostic } => {
                self.emit_error(RecognizeError::MalformedJson { raw, diagnostic });
            }
            InboundMessage::UnexpectedBinary { len } => {
                self.emit_error(RecognizeError::UnexpectedBinaryFromService { len });
            }
        }
    }
}

/// Bidirectional endpoint: audio goes in through `write`, finalized
/// transcripts come out of `take_output()`, notifications out of
/// `take_events()`.
///
/// The connection is opened lazily on the first write. Writes must come from
/// a single producer in transmission order. A stream is single-use: once it
/// has ended, build a new one.
pub struct RecognizeStream {
    options: RecognizeOptions,
    session_id: String,
    state: Arc<Mutex<StreamState>>,
    events_rx: Option<mpsc::UnboundedReceiver<RecognizeEvent>>,
    output: Option<Transcripts>,
    dispatcher: Option<JoinHandle<()>>,
}

impl RecognizeStream {
    /// Create a stream backed by a WebSocket session
    pub fn new(options: RecognizeOptions) -> Self {
        let session_id = uuid::Uuid::new_v4().to_string();
        let transport = WebSocketSession::new().with_label(session_id.clone());
        Self::build(options, Box::new(transport), session_id)
    }

    /// Create a stream on top of an unopened transport
    pub fn with_transport(options: RecognizeOptions, transport: Box<dyn Transport>) -> Self {
        Self::build(options, transport, uuid::Uuid::new_v4().to_string())
    }

    fn build(options: RecognizeOptions, transport: Box<dyn Transport>, session_id: String) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (output_tx, output_rx) = mpsc::unbounded_channel();

        let state = StreamState {
            phase: StreamPhase::Uninitialized,
            transport,
            pending: VecDeque::new(),
            input_finished: false,
            eos_sent: false,
            connected_seen: false,
            output_tx: Some(output_tx),
            events_tx,
            stats: StreamStats::new(session_id.clone()),
        };

        Self {
            options,
            session_id,
            state: Arc::new(Mutex::new(state)),
            events_rx: Some(events_rx),
            output: Some(Transcripts::new(output_rx)),
            dispatcher: None,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Notification receiver; available once
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<RecognizeEvent>> {
        self.events_rx.take()
    }

    /// Finalized transcript output; available once
    pub fn take_output(&mut self) -> Option<Transcripts> {
        self.output.take()
    }

    pub async fn phase(&self) -> StreamPhase {
        self.state.lock().await.phase
    }

    pub async fn stats(&self) -> StreamStats {
        self.state.lock().await.stats.clone()
    }

    /// Write one audio chunk.
    ///
    /// Before the service is listening the chunk is queued and the call
    /// returns at once. Afterwards it is sent, and the call returns only when
    /// the transport's outstanding bytes are at or below the backpressure
    /// threshold.
    pub async fn write(&mut self, chunk: impl Into<Bytes>) -> Result<()> {
        let chunk = chunk.into();
        let shared = Arc::clone(&self.state);

        {
            let mut state = shared.lock().await;
            if state.input_finished {
                return Err(RecognizeError::Ended);
            }

            match state.phase {
                StreamPhase::Uninitialized => {
                    self.open_session(&mut state)?;
                    state.queue_audio(chunk);
                    return Ok(());
                }
                StreamPhase::AwaitingReady => {
                    state.queue_audio(chunk);
                    return Ok(());
                }
                StreamPhase::Listening => state.send_audio(chunk)?,
                StreamPhase::Stopping | StreamPhase::Ended => return Err(RecognizeError::Ended),
            }
        }

        self.wait_for_drain().await;
        Ok(())
    }

    /// Signal end of input. The end-of-stream token follows every chunk
    /// written before it; a second call is a no-op.
    pub async fn finish(&mut self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.input_finished {
            return Ok(());
        }
        state.input_finished = true;

        match state.phase {
            StreamPhase::Uninitialized => {
                debug!("[{}] Input finished before any audio", self.session_id);
                state.end_without_session();
                Ok(())
            }
            StreamPhase::AwaitingReady => {
                state.pending.push_back(Pending::EndOfStream);
                Ok(())
            }
            StreamPhase::Listening => state.send_end_of_stream(),
            StreamPhase::Stopping | StreamPhase::Ended => Ok(()),
        }
    }

    /// Forced teardown: queued audio is dropped, the end-of-stream token is
    /// sent (deferred by the transport if it is still connecting) and the
    /// connection is closed. Calling it again has no further effect.
    pub async fn stop(&mut self) {
        let mut state = self.state.lock().await;

        match state.phase {
            StreamPhase::Stopping | StreamPhase::Ended => {}
            StreamPhase::Uninitialized => {
                info!("[{}] Stopping stream that never connected", self.session_id);
                state.emit(RecognizeEvent::Stopping);
                state.input_finished = true;
                state.end_without_session();
            }
            StreamPhase::AwaitingReady | StreamPhase::Listening => {
                info!("[{}] Stopping stream", self.session_id);
                state.emit(RecognizeEvent::Stopping);

                let discarded = state
                    .pending
                    .iter()
                    .filter(|item| matches!(item, Pending::Audio(_)))
                    .count();
                if discarded > 0 {
                    warn!("[{}] Dropping {} queued chunks on stop", self.session_id, discarded);
                }
                state.pending.clear();
                state.input_finished = true;

                if let Err(e) = state.send_end_of_stream() {
                    state.emit_error(e);
                }
                state.phase = StreamPhase::Stopping;
                state.transport.close();
            }
        }
    }

    fn open_session(&mut self, state: &mut StreamState) -> Result<()> {
        let (handler, transport_events) = mpsc::unbounded_channel();

        if let Err(e) = state
            .transport
            .open(&self.options.endpoint, &self.options.headers, handler)
        {
            error!("[{}] Failed to open session: {}", self.session_id, e);
            state.end_without_session();
            return Err(e);
        }

        state.phase = StreamPhase::AwaitingReady;
        self.dispatcher = Some(tokio::spawn(dispatch(
            Arc::clone(&self.state),
            transport_events,
        )));

        Ok(())
    }

    /// Hold the caller until the transport's backlog is within the threshold
    async fn wait_for_drain(&self) {
        loop {
            {
                let state = self.state.lock().await;
                let live = state.phase != StreamPhase::Ended
                    && state.transport.state() != SessionState::Closed;
                if !live || state.transport.buffered_amount() <= self.options.backpressure_threshold
                {
                    return;
                }
            }
            tokio::time::sleep(self.options.retry_interval).await;
        }
    }
}

impl Drop for RecognizeStream {
    fn drop(&mut self) {
        // Releases the transport; its connection task then closes the socket
        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.abort();
        }
    }
}

/// Apply transport notifications to the stream, in arrival order
async fn dispatch(
    state: Arc<Mutex<StreamState>>,
    mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = transport_events.recv().await {
        let mut state = state.lock().await;
        state.handle_event(event);
        if state.phase == StreamPhase::Ended {
            break;
        }
    }
}
