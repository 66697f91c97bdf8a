pub mod file;
pub mod source;

pub use file::{RawFileSource, DEFAULT_CHUNK_SIZE};
pub use source::{pipe, AudioSource, ChannelSource};
