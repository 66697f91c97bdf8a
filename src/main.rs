use anyhow::{Context, Result};
use clap::Parser;
use loqa_recognize::{audio, Config, RawFileSource, RecognizeEvent, RecognizeStream};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Stream a raw audio file to a speech recognition service
#[derive(Parser, Debug)]
#[command(name = "loqa-recognize", version)]
struct Args {
    /// Raw audio file to stream (format set by the [audio] config section)
    file: PathBuf,

    /// Config file path, with or without extension
    #[arg(short, long, default_value = "config/loqa-recognize")]
    config: String,

    /// Stop the stream after this many seconds
    #[arg(short, long, default_value_t = 85)]
    duration: u64,

    /// Seconds to wait for the service to deliver its last result and close
    #[arg(long, default_value_t = 5)]
    grace: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // wss endpoints need a process-wide crypto provider
    let _ = rustls::crypto::ring::default_provider().install_default();

    let args = Args::parse();
    let cfg = Config::load(&args.config)?;
    if cfg.service.access_token.is_none() {
        warn!(
            "No access token configured; set service.access_token or {}__SERVICE__ACCESS_TOKEN",
            loqa_recognize::config::ENV_PREFIX
        );
    }

    let mut stream = RecognizeStream::new(cfg.recognize_options()?);
    let mut events = stream.take_events().context("Event receiver already taken")?;
    let mut output = stream.take_output().context("Output already taken")?;

    info!("Loqa Recognize v{}", env!("CARGO_PKG_VERSION"));
    info!("Session: {}", stream.session_id());

    let events_task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                RecognizeEvent::Listening => info!("Service is listening"),
                RecognizeEvent::Results {
                    transcript,
                    is_final,
                } => info!(is_final, "Transcription: {}", transcript),
                RecognizeEvent::Error(e) => error!("Error from recognition stream: {}", e),
                RecognizeEvent::Close { code, reason } => {
                    info!("Stream closed (code={}, reason={:?})", code, reason)
                }
                RecognizeEvent::Stopping => info!("Stream stopping"),
            }
        }
    });

    let mut output_task = tokio::spawn(async move {
        let mut payloads = 0usize;
        while let Some(data) = output.recv().await {
            payloads += 1;
            info!("Finalized data: {}", String::from_utf8_lossy(&data));
        }
        payloads
    });

    let mut source = RawFileSource::open(&args.file, cfg.audio.chunk_size).await?;

    info!("Ending stream in {} sec", args.duration);
    match tokio::time::timeout(
        Duration::from_secs(args.duration),
        audio::pipe(&mut source, &mut stream),
    )
    .await
    {
        Ok(Ok(bytes)) => info!("Sent {} bytes of audio, waiting for the service to finish", bytes),
        Ok(Err(e)) => {
            error!("Streaming audio failed: {}", e);
            stream.stop().await;
        }
        Err(_) => {
            info!("Duration elapsed, stopping stream");
            stream.stop().await;
        }
    }

    info!("Waiting up to {} secs for the final message", args.grace);
    match tokio::time::timeout(Duration::from_secs(args.grace), &mut output_task).await {
        Ok(Ok(payloads)) => info!("Received {} finalized payloads", payloads),
        Ok(Err(e)) => error!("Output task failed: {}", e),
        Err(_) => {
            warn!("Service did not close within the grace period");
            stream.stop().await;
            output_task.abort();
        }
    }

    let stats = stream.stats().await;
    info!("Stream stats: {}", serde_json::to_string(&stats)?);

    drop(stream);
    if let Err(e) = events_task.await {
        error!("Event task failed: {}", e);
    }

    Ok(())
}
