//! Streaming raw-frame video writer on top of FFmpeg.
//!
//! Frames go in one at a time as packed RGBA (or BGRA) buffers, are converted
//! to the encoder's pixel format, encoded and written to a container whose
//! format follows the output file extension.

/// Registers FFmpeg components. Safe to call more than once.
pub fn init() -> Result<()> {
    ffmpeg_next::init().map_err(|e| WriterError::config(format!("ffmpeg_next init: {}", e)))
}

/// Raises FFmpeg's own log level for debugging a session.
pub fn set_ffmpeg_debug(enabled: bool) {
    use ffmpeg_next::util::log::{Level, set_level};
    set_level(if enabled { Level::Debug } else { Level::Error });
}

pub mod backend;
pub mod config;
pub mod encoder;
pub mod error;
pub mod format;
pub mod frame;
pub mod hw;
pub mod metadata;
pub mod output;
pub mod packet;
pub mod scaler;
pub mod stream;
pub mod task;
pub mod writer;

#[cfg(test)]
pub(crate) mod testing;

pub use config::WriterConfig;
pub use error::{Result, WriterError};
pub use format::PixelFormat;
pub use metadata::{DecodedFrame, MediaInfo, decode_frames, probe};
pub use scaler::ScalerKind;
pub use task::WriterTask;
pub use writer::{SessionState, SessionSummary, StreamingWriter};
