//! Streaming encode/mux session.
//!
//! ```text
//! open ──► process_frame* ──► finish
//!   │          │                 │
//!   │      convert ─► submit ─► write packets
//!   │                            drain ─► write packets ─► trailer ─► close
//!   └─ header written
//! ```
//!
//! Every call runs to completion on the caller's thread. A session is owned
//! by exactly one `StreamingWriter`; sharing it between threads needs
//! external serialization (see [`crate::task::WriterTask`]).

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::{
    backend::{Backend, FfmpegBackend},
    config::WriterConfig,
    encoder::{EncodeSession, VideoCodec},
    error::{Result, WriterError},
    frame::FrameConverter,
    output::{MuxSession, OutputLease},
    stream::StreamDescriptor,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unopened,
    Open,
    Finishing,
    Closed,
}

/// What a finished session produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub output_path: PathBuf,
    pub frames: u64,
    pub packets: u64,
    pub bytes: u64,
}

struct Session<B: Backend> {
    descriptor: StreamDescriptor,
    converter: FrameConverter<B::Scaler>,
    encoder: EncodeSession<B::Codec>,
    muxer: MuxSession<B::Muxer>,
    // dropped last: the path stays claimed until the file is closed
    lease: OutputLease,
}

impl<B: Backend> Session<B> {
    fn push_frame(&mut self, raw: &[u8], pts: i64) -> Result<usize> {
        let frame = self.converter.convert(raw)?;
        if pts == 0 {
            log::debug!("first frame converted: {}", frame);
        }
        let packets = self.encoder.submit(frame, pts)?;
        let written = packets.len();
        for packet in packets {
            self.muxer.write_packet(packet)?;
        }
        Ok(written)
    }

    fn drain_and_finalize(&mut self) -> Result<()> {
        let packets = self.encoder.drain()?;
        for packet in packets {
            self.muxer.write_packet(packet)?;
        }
        self.muxer.finalize()
    }

    fn close(&mut self) {
        self.encoder.close();
        self.muxer.close();
    }
}

/// Turns a sequence of raw frames into one container file.
pub struct StreamingWriter<B: Backend = FfmpegBackend> {
    backend: B,
    state: SessionState,
    next_pts: i64,
    debug: bool,
    output_path: Option<PathBuf>,
    session: Option<Session<B>>,
}

impl StreamingWriter<FfmpegBackend> {
    /// Opens an FFmpeg-backed session in one step.
    pub fn create(config: &WriterConfig) -> Result<Self> {
        config.validate()?;
        let mut writer = Self::new(FfmpegBackend::new()?);
        writer.open(config)?;
        Ok(writer)
    }
}

impl<B: Backend> StreamingWriter<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            state: SessionState::Unopened,
            next_pts: 0,
            debug: false,
            output_path: None,
            session: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Timestamp the next accepted frame will get.
    pub fn next_pts(&self) -> i64 {
        self.next_pts
    }

    pub fn descriptor(&self) -> Option<&StreamDescriptor> {
        self.session.as_ref().map(|s| &s.descriptor)
    }

    pub fn output_path(&self) -> Option<&Path> {
        self.output_path.as_deref()
    }

    /// Bytes every `process_frame` buffer must contain.
    pub fn frame_len(&self) -> Option<usize> {
        self.session.as_ref().map(|s| s.converter.expected_len())
    }

    fn ensure_open(&self, operation: &str) -> Result<()> {
        match self.state {
            SessionState::Open => Ok(()),
            SessionState::Unopened => Err(WriterError::protocol(format!(
                "{} called before open",
                operation
            ))),
            SessionState::Finishing | SessionState::Closed => Err(WriterError::protocol(
                format!("{} called after finish", operation),
            )),
        }
    }

    /// Validates the configuration, creates the output file and writes the
    /// container header. On failure everything acquired so far is released
    /// and the writer stays unopened.
    pub fn open(&mut self, config: &WriterConfig) -> Result<()> {
        if self.state != SessionState::Unopened {
            return Err(WriterError::protocol(format!(
                "open called on a session that is {:?}",
                self.state
            )));
        }
        let mut descriptor = config.descriptor()?;
        let lease = OutputLease::acquire(&config.output_path)?;
        if config.debug {
            crate::set_ffmpeg_debug(true);
            log::debug!("opening session: {:?}", config);
        }

        // The file is created last: anything the codec rejects leaves an
        // existing file untouched and creates nothing.
        let global_header = self.backend.requires_global_header(&config.output_path)?;
        let codec = self.backend.open_codec(&descriptor, global_header)?;
        if codec.pixel_format() != descriptor.pixel_format() {
            log::info!(
                "encoder {} takes {} instead of {}",
                codec.name(),
                codec.pixel_format(),
                descriptor.pixel_format()
            );
            descriptor.pixel_format = codec.pixel_format();
        }
        let scaler = self.backend.open_scaler(&descriptor)?;
        let muxer = self.backend.open_muxer(&config.output_path, &codec)?;
        let muxer = MuxSession::open(muxer, &codec)?;
        let encoder = EncodeSession::open(codec, &descriptor);
        let converter = FrameConverter::new(scaler, &descriptor);

        log::info!(
            "session open: {} {}x{} @ {}fps, codec: {}, pixel format: {}",
            config.output_path.display(),
            descriptor.width(),
            descriptor.height(),
            descriptor.fps(),
            descriptor.codec(),
            descriptor.pixel_format()
        );

        self.session = Some(Session {
            descriptor,
            converter,
            encoder,
            muxer,
            lease,
        });
        self.debug = config.debug;
        self.output_path = Some(config.output_path.clone());
        self.next_pts = 0;
        self.state = SessionState::Open;
        Ok(())
    }

    /// Encodes one raw frame and writes whatever packets the encoder
    /// released. Returns the number of packets written, which may be zero.
    ///
    /// A wrong-sized buffer fails with a configuration error and leaves the
    /// session untouched; encoder or writer failures close the session.
    pub fn process_frame(&mut self, raw: &[u8]) -> Result<usize> {
        self.ensure_open("process_frame")?;
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| WriterError::protocol("session released"))?;
        session.converter.check_len(raw)?;

        let pts = self.next_pts;
        if self.debug && pts == 0 {
            log::debug!(
                "first frame: {} bytes, head: {:02x?}",
                raw.len(),
                &raw[..raw.len().min(12)]
            );
        }
        match session.push_frame(raw, pts) {
            Ok(written) => {
                self.next_pts += 1;
                Ok(written)
            }
            Err(e) if e.is_fatal() => {
                self.teardown(&e);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Drains the encoder, writes the remaining packets and the trailer, and
    /// releases every resource. Valid once.
    pub fn finish(&mut self) -> Result<SessionSummary> {
        self.ensure_open("finish")?;
        self.state = SessionState::Finishing;
        let mut session = self
            .session
            .take()
            .ok_or_else(|| WriterError::protocol("session released"))?;

        let result = session.drain_and_finalize();
        let summary = SessionSummary {
            output_path: self.output_path.clone().unwrap_or_default(),
            frames: self.next_pts as u64,
            packets: session.muxer.packets_written(),
            bytes: session.muxer.bytes_written(),
        };
        session.close();
        drop(session);
        self.state = SessionState::Closed;

        match result {
            Ok(()) => {
                log::info!(
                    "session finished: {}, frames: {}, packets: {}, bytes: {}",
                    summary.output_path.display(),
                    summary.frames,
                    summary.packets,
                    summary.bytes
                );
                Ok(summary)
            }
            Err(e) => {
                log::error!("finish failed: {}", e);
                Err(e)
            }
        }
    }

    /// Error-path release: encoder and writer are freed, no trailer written.
    fn teardown(&mut self, cause: &WriterError) {
        if let Some(mut session) = self.session.take() {
            log::error!(
                "session for {} aborted: {}",
                session.lease.path().display(),
                cause
            );
            session.close();
        }
        self.state = SessionState::Closed;
    }
}

impl<B: Backend> Drop for StreamingWriter<B> {
    fn drop(&mut self) {
        if let Some(mut session) = self.session.take() {
            log::warn!(
                "session for {} dropped before finish, output is incomplete",
                session.lease.path().display()
            );
            session.close();
        }
    }
}

#[cfg(test)]
#[path = "writer_test.rs"]
mod writer_test;
