//! Error types for loqa-recognize.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecognizeError {
    // Transport session errors
    #[error("Transport is not ready to send")]
    NotReadyToSend,

    #[error("Transport session already opened")]
    AlreadyOpen,

    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("Invalid endpoint: {message}")]
    InvalidEndpoint { message: String },

    #[error("Invalid protocol header {name}: {message}")]
    InvalidHeader { name: String, message: String },

    // Protocol errors reported by the decoder
    #[error("Unexpected binary data received from service ({len} bytes)")]
    UnexpectedBinaryFromService { len: usize },

    #[error("Invalid JSON received from service: {diagnostic}")]
    MalformedJson { raw: String, diagnostic: String },

    #[error("Service reported error: {message}")]
    ServiceReportedError { message: String, raw: String },

    #[error("Unrecognised message from service: {raw}")]
    UnrecognizedMessageType { raw: String },

    // Adapter lifecycle
    #[error("Recognition stream has ended")]
    Ended,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RecognizeError {
    pub(crate) fn transport(err: impl std::fmt::Display) -> Self {
        RecognizeError::Transport {
            message: err.to_string(),
        }
    }

    /// The raw service frame that caused this error, if any.
    pub fn raw_frame(&self) -> Option<&str> {
        match self {
            RecognizeError::MalformedJson { raw, .. }
            | RecognizeError::ServiceReportedError { raw, .. }
            | RecognizeError::UnrecognizedMessageType { raw } => Some(raw),
            _ => None,
        }
    }

    /// Whether this error ends the session. Protocol errors are advisory.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RecognizeError::Transport { .. } | RecognizeError::Ended)
    }
}

impl From<url::ParseError> for RecognizeError {
    fn from(err: url::ParseError) -> Self {
        RecognizeError::InvalidEndpoint {
            message: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, RecognizeError>;
