//! Error taxonomy shared by every layer of the writer.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WriterError {
    /// Bad dimensions, unsupported codec or pixel format, wrong-sized input.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The encoder failed while accepting a frame or producing a packet.
    #[error("encode error: {0}")]
    Encode(String),

    /// The output file or container writer failed.
    #[error("io error: {0}")]
    Io(String),

    /// The caller used the session out of order.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The worker was cancelled before the session finished.
    #[error("session cancelled, output is incomplete")]
    Cancelled,
}

impl WriterError {
    pub fn config(msg: impl Into<String>) -> Self {
        WriterError::Configuration(msg.into())
    }

    pub fn encode(msg: impl Into<String>) -> Self {
        WriterError::Encode(msg.into())
    }

    pub fn io(msg: impl Into<String>) -> Self {
        WriterError::Io(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        WriterError::Protocol(msg.into())
    }

    /// Errors after which the session can not continue.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            WriterError::Encode(_) | WriterError::Io(_) | WriterError::Cancelled
        )
    }
}

impl From<std::io::Error> for WriterError {
    fn from(e: std::io::Error) -> Self {
        WriterError::Io(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, WriterError>;
