use anyhow::Context;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::info;

use super::source::AudioSource;
use crate::error::Result;

/// Default read size, roughly 90ms of 44.1kHz mono S16LE
pub const DEFAULT_CHUNK_SIZE: usize = 8192;

/// Raw (headerless) audio file read in fixed-size chunks.
///
/// The bytes are passed through untouched; the service is told the format
/// through the endpoint's content type.
pub struct RawFileSource {
    path: PathBuf,
    name: String,
    file: File,
    chunk_size: usize,
}

impl RawFileSource {
    pub async fn open(path: impl AsRef<Path>, chunk_size: usize) -> anyhow::Result<Self> {
        anyhow::ensure!(chunk_size > 0, "Chunk size must be greater than zero");

        let path = path.as_ref().to_path_buf();
        info!("Opening raw audio file: {}", path.display());

        let file = File::open(&path)
            .await
            .with_context(|| format!("Failed to open audio file {}", path.display()))?;

        Ok(Self {
            name: path.display().to_string(),
            path,
            file,
            chunk_size,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait::async_trait]
impl AudioSource for RawFileSource {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        let mut buf = vec![0u8; self.chunk_size];
        let mut filled = 0;

        // Fill the whole chunk unless the file ends first
        while filled < buf.len() {
            let n = self.file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        if filled == 0 {
            return Ok(None);
        }

        buf.truncate(filled);
        Ok(Some(Bytes::from(buf)))
    }

    fn name(&self) -> &str {
        &self.name
    }
}
