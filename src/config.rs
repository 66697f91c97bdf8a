use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use url::Url;

use crate::audio::DEFAULT_CHUNK_SIZE;
use crate::recognize::{RecognizeOptions, DEFAULT_BACKPRESSURE_THRESHOLD};

/// Environment variable prefix, e.g. `LOQA_RECOGNIZE__SERVICE__ACCESS_TOKEN`
pub const ENV_PREFIX: &str = "LOQA_RECOGNIZE";

#[derive(Debug, Deserialize)]
pub struct Config {
    pub service: ServiceConfig,
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub stream: StreamConfig,
}

#[derive(Debug, Deserialize)]
pub struct ServiceConfig {
    /// Streaming endpoint without query parameters
    pub url: String,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// Format of the raw audio, announced to the service in the content type
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub layout: String,
    pub rate: u32,
    pub format: String,
    pub channels: u16,
    /// Bytes read from the audio source per write
    pub chunk_size: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            layout: "interleaved".to_string(),
            rate: 44100,
            format: "S16LE".to_string(),
            channels: 1,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl AudioConfig {
    pub fn content_type(&self) -> String {
        format!(
            "audio/x-raw;layout={};rate={};format={};channels={}",
            self.layout, self.rate, self.format, self.channels
        )
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub backpressure_threshold: usize,
    pub retry_interval_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            backpressure_threshold: DEFAULT_BACKPRESSURE_THRESHOLD,
            retry_interval_ms: 10,
        }
    }
}

impl Config {
    /// Load from an optional config file, overridden by environment variables
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    /// Endpoint with access token and content type query parameters
    pub fn endpoint(&self) -> Result<Url> {
        let mut endpoint = Url::parse(&self.service.url)
            .with_context(|| format!("Invalid service url: {}", self.service.url))?;

        {
            let mut query = endpoint.query_pairs_mut();
            if let Some(token) = &self.service.access_token {
                query.append_pair("access_token", token);
            }
            query.append_pair("content_type", &self.audio.content_type());
        }

        Ok(endpoint)
    }

    pub fn recognize_options(&self) -> Result<RecognizeOptions> {
        anyhow::ensure!(
            self.stream.retry_interval_ms > 0,
            "stream.retry_interval_ms must be greater than zero"
        );

        let mut options = RecognizeOptions::new(self.endpoint()?);
        options.headers = self.service.headers.clone();
        options.backpressure_threshold = self.stream.backpressure_threshold;
        options.retry_interval = Duration::from_millis(self.stream.retry_interval_ms);
        Ok(options)
    }
}
