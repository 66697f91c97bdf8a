// End-to-end tests for the recognition stream
//
// Each test runs a scripted WebSocket counterparty on localhost that sends a
// fixed list of replies as soon as a client connects, records everything the
// client sends, and closes after the end-of-stream token.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use loqa_recognize::{
    RecognizeError, RecognizeEvent, RecognizeOptions, RecognizeStream, StreamPhase,
    WebSocketSession,
};
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use url::Url;

/// What the scripted counterparty saw
struct ServerLog {
    header: Option<String>,
    query: Option<String>,
    received: Vec<Message>,
}

async fn scripted_server(script: Vec<Message>) -> (Url, JoinHandle<ServerLog>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let url = Url::parse(&format!(
        "ws://{}/speechtotext/stream?content_type=audio/x-raw",
        addr
    ))
    .unwrap();

    let handle = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();

        let (handshake_tx, handshake_rx) = oneshot::channel();
        let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            let header = req
                .headers()
                .get("x-client")
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned);
            let query = req.uri().query().map(str::to_owned);
            let _ = handshake_tx.send((header, query));
            Ok(resp)
        };
        let mut ws = tokio_tungstenite::accept_hdr_async(tcp, callback)
            .await
            .unwrap();
        let (header, query) = handshake_rx.await.unwrap();

        for reply in script {
            ws.send(reply).await.unwrap();
        }

        let mut received = Vec::new();
        while let Some(Ok(message)) = ws.next().await {
            match message {
                Message::Text(body) if body.as_str() == "EOS" => {
                    received.push(Message::Text(body));
                    let _ = ws
                        .close(Some(CloseFrame {
                            code: CloseCode::Normal,
                            reason: Utf8Bytes::from_static("done"),
                        }))
                        .await;
                }
                Message::Text(_) | Message::Binary(_) => received.push(message),
                _ => {}
            }
        }

        ServerLog {
            header,
            query,
            received,
        }
    });

    (url, handle)
}

fn text(s: &str) -> Message {
    Message::Text(Utf8Bytes::from(s.to_string()))
}

fn options(url: Url) -> RecognizeOptions {
    let mut options = RecognizeOptions::new(url).with_header("x-client", "loqa-test");
    options.retry_interval = Duration::from_millis(1);
    options
}

async fn events_until_close(events: &mut mpsc::UnboundedReceiver<RecognizeEvent>) -> Vec<RecognizeEvent> {
    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for close")
            .expect("event channel closed before close event");
        let is_close = matches!(event, RecognizeEvent::Close { .. });
        seen.push(event);
        if is_close {
            return seen;
        }
    }
}

async fn collect_output(stream: &mut RecognizeStream) -> Vec<Bytes> {
    let mut output = stream.take_output().unwrap();
    let mut payloads = Vec::new();
    while let Some(data) = tokio::time::timeout(Duration::from_secs(5), output.recv())
        .await
        .expect("output never ended")
    {
        payloads.push(data);
    }
    payloads
}

fn error_count(events: &[RecognizeEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, RecognizeEvent::Error(_)))
        .count()
}

#[tokio::test]
async fn test_final_result_is_delivered_as_output() {
    let (url, server) = scripted_server(vec![
        text(r#"{"type":"connected","id":"s1"}"#),
        text(r#"{"type":"final","elements":"hello","transcript":"hello"}"#),
    ])
    .await;

    let mut stream = RecognizeStream::new(options(url));
    let mut events = stream.take_events().unwrap();

    let chunks: Vec<Vec<u8>> = (0u8..20).map(|i| vec![i; 64]).collect();
    for chunk in &chunks {
        stream.write(chunk.clone()).await.unwrap();
    }
    stream.finish().await.unwrap();

    let seen = events_until_close(&mut events).await;
    let listening = seen
        .iter()
        .filter(|e| matches!(e, RecognizeEvent::Listening))
        .count();
    assert_eq!(listening, 1);
    assert!(seen.iter().any(|e| matches!(
        e,
        RecognizeEvent::Results { transcript, is_final: true } if transcript == "hello"
    )));
    assert!(matches!(
        seen.last(),
        Some(RecognizeEvent::Close { code: 1000, reason }) if reason == "done"
    ));

    assert_eq!(collect_output(&mut stream).await, vec![Bytes::from("hello")]);
    assert_eq!(stream.phase().await, StreamPhase::Ended);

    // Audio arrives in write order, with the token last
    let log = server.await.unwrap();
    let (last, audio) = log.received.split_last().unwrap();
    assert_eq!(last, &text("EOS"));
    let sent: Vec<Vec<u8>> = audio
        .iter()
        .map(|m| match m {
            Message::Binary(data) => data.to_vec(),
            other => panic!("unexpected frame before EOS: {:?}", other),
        })
        .collect();
    assert_eq!(sent, chunks);

    assert_eq!(log.header.as_deref(), Some("loqa-test"));
    assert!(log.query.unwrap().contains("content_type"));

    let stats = stream.stats().await;
    assert_eq!(stats.chunks_sent, 20);
    assert_eq!(stats.bytes_sent, 20 * 64);
}

#[tokio::test]
async fn test_partial_result_produces_no_output() {
    let (url, server) = scripted_server(vec![
        text(r#"{"type":"connected"}"#),
        text(r#"{"type":"partial","transcript":"he"}"#),
    ])
    .await;

    let mut stream = RecognizeStream::new(options(url));
    let mut events = stream.take_events().unwrap();

    stream.write(vec![0u8; 32]).await.unwrap();
    stream.finish().await.unwrap();

    let seen = events_until_close(&mut events).await;
    assert!(seen.iter().any(|e| matches!(
        e,
        RecognizeEvent::Results { transcript, is_final: false } if transcript == "he"
    )));
    assert!(collect_output(&mut stream).await.is_empty());
    server.await.unwrap();
}

#[tokio::test]
async fn test_binary_frame_from_service_is_an_error() {
    let (url, server) = scripted_server(vec![
        text(r#"{"type":"connected"}"#),
        Message::Binary(Bytes::from_static(b"\x01\x02\x03")),
    ])
    .await;

    let mut stream = RecognizeStream::new(options(url));
    let mut events = stream.take_events().unwrap();

    stream.write(vec![0u8; 32]).await.unwrap();
    stream.finish().await.unwrap();

    let seen = events_until_close(&mut events).await;
    assert_eq!(error_count(&seen), 1);
    assert!(seen.iter().any(|e| matches!(
        e,
        RecognizeEvent::Error(RecognizeError::UnexpectedBinaryFromService { len: 3 })
    )));
    assert!(collect_output(&mut stream).await.is_empty());
    server.await.unwrap();
}

#[tokio::test]
async fn test_non_json_frame_reports_parse_failure() {
    let (url, server) = scripted_server(vec![
        text(r#"{"type":"connected"}"#),
        text("this is not json"),
    ])
    .await;

    let mut stream = RecognizeStream::new(options(url));
    let mut events = stream.take_events().unwrap();

    stream.write(vec![0u8; 32]).await.unwrap();
    stream.finish().await.unwrap();

    let seen = events_until_close(&mut events).await;
    assert_eq!(error_count(&seen), 1);
    let err = seen
        .iter()
        .find_map(|e| match e {
            RecognizeEvent::Error(err) => Some(err),
            _ => None,
        })
        .unwrap();
    assert!(matches!(err, RecognizeError::MalformedJson { .. }));
    assert_eq!(err.raw_frame(), Some("this is not json"));
    server.await.unwrap();
}

#[tokio::test]
async fn test_stop_before_ready_sends_token_once_without_audio() {
    // The service never says it is listening
    let (url, server) = scripted_server(Vec::new()).await;

    let mut stream = RecognizeStream::new(options(url));
    let mut events = stream.take_events().unwrap();

    stream.write(vec![7u8; 32]).await.unwrap();
    stream.stop().await;
    stream.stop().await;

    let seen = events_until_close(&mut events).await;
    assert!(matches!(seen.first(), Some(RecognizeEvent::Stopping)));
    assert_eq!(
        seen.iter()
            .filter(|e| matches!(e, RecognizeEvent::Stopping))
            .count(),
        1
    );

    let log = server.await.unwrap();
    assert_eq!(log.received, vec![text("EOS")]);

    assert!(matches!(
        stream.write(vec![1u8; 4]).await,
        Err(RecognizeError::Ended)
    ));
}

#[tokio::test]
async fn test_refused_connection_ends_stream() {
    let mut stream = RecognizeStream::new(options(Url::parse("ws://127.0.0.1:1/stream").unwrap()));
    let mut events = stream.take_events().unwrap();

    stream.write(vec![0u8; 16]).await.unwrap();

    let seen = events_until_close(&mut events).await;
    assert!(matches!(
        seen.first(),
        Some(RecognizeEvent::Error(RecognizeError::Transport { .. }))
    ));
    assert!(matches!(seen.last(), Some(RecognizeEvent::Close { code: 1006, .. })));
    assert!(collect_output(&mut stream).await.is_empty());
    assert!(matches!(
        stream.write(vec![0u8; 16]).await,
        Err(RecognizeError::Ended)
    ));
}

#[tokio::test]
async fn test_stop_ends_stream_when_peer_never_answers_close() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = Url::parse(&format!("ws://{}/stream", listener.local_addr().unwrap())).unwrap();

    // Accepts, announces itself, then never reads again
    let server = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
        ws.send(text(r#"{"type":"connected"}"#)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        drop(ws);
    });

    let session = WebSocketSession::new().with_close_timeout(Duration::from_millis(200));
    let mut stream = RecognizeStream::with_transport(options(url), Box::new(session));
    let mut events = stream.take_events().unwrap();

    stream.write(vec![0u8; 32]).await.unwrap();
    let listening = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("service never listened");
    assert!(matches!(listening, Some(RecognizeEvent::Listening)));

    let started = Instant::now();
    stream.stop().await;

    let seen = events_until_close(&mut events).await;
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(matches!(seen.first(), Some(RecognizeEvent::Stopping)));
    assert!(matches!(
        seen.last(),
        Some(RecognizeEvent::Close { code: 1006, reason }) if reason.is_empty()
    ));
    assert_eq!(stream.phase().await, StreamPhase::Ended);
    assert!(collect_output(&mut stream).await.is_empty());

    server.abort();
}

#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_transport_logs_carry_stream_session_id() {
    let logs = CapturedLogs::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::DEBUG)
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let mut stream = RecognizeStream::new(options(Url::parse("ws://127.0.0.1:1/stream").unwrap()));
    let mut events = stream.take_events().unwrap();
    stream.write(vec![0u8; 16]).await.unwrap();
    events_until_close(&mut events).await;

    let output = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
    let tag = format!("[{}]", stream.session_id());
    for needle in ["Connecting to recognition service", "Failed to connect", "connection closed"] {
        let line = output
            .lines()
            .find(|line| line.contains(needle))
            .unwrap_or_else(|| panic!("no log line containing {:?} in:\n{}", needle, output));
        assert!(line.contains(&tag), "missing session id in {:?}", line);
    }
}
