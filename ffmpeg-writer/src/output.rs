use std::collections::HashSet;
use std::ffi::{CStr, CString};
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::{LazyLock, Mutex};

use ffmpeg_next::Rational;

use crate::{
    encoder::{FfmpegCodec, VideoCodec},
    error::{Result, WriterError},
    packet::EncodedPacket,
};

/// A container writer. Dropping it closes the output and frees the format
/// context.
pub trait ContainerMuxer {
    type Codec: VideoCodec;

    fn add_stream(&mut self, codec: &Self::Codec) -> Result<usize>;
    fn write_header(&mut self) -> Result<()>;
    /// Stream time base as chosen by the container once the header is written.
    fn stream_time_base(&self, index: usize) -> Result<Rational>;
    fn write_interleaved(&mut self, packet: &EncodedPacket) -> Result<()>;
    fn write_trailer(&mut self) -> Result<()>;
}

/// Container format FFmpeg picks for `path`, found without opening anything.
#[derive(Debug, Clone, Copy)]
pub struct ContainerFormat {
    format: *const ffmpeg_next::ffi::AVOutputFormat,
}

impl ContainerFormat {
    pub fn guess(path: &Path) -> Result<Self> {
        let filename = CString::new(path.to_string_lossy().as_bytes())
            .map_err(|_| WriterError::config(format!("invalid output path {}", path.display())))?;
        let format = unsafe {
            ffmpeg_next::ffi::av_guess_format(ptr::null(), filename.as_ptr(), ptr::null())
        };
        if format.is_null() {
            return Err(WriterError::config(format!(
                "no container format for {}",
                path.display()
            )));
        }
        Ok(Self { format })
    }

    pub fn name(&self) -> String {
        unsafe { CStr::from_ptr((*self.format).name) }
            .to_string_lossy()
            .into_owned()
    }

    /// Whether codecs must put their headers in extradata instead of the
    /// stream (MP4, MKV, ...).
    pub fn requires_global_header(&self) -> bool {
        let flags = unsafe { (*self.format).flags };
        ffmpeg_next::format::Flags::from_bits_truncate(flags)
            .contains(ffmpeg_next::format::Flags::GLOBAL_HEADER)
    }

    /// Rejects codecs the container is known not to carry. Unknown
    /// combinations are left to the muxer.
    pub fn check_codec(&self, id: ffmpeg_next::codec::Id) -> Result<()> {
        // 0 = FF_COMPLIANCE_NORMAL
        let ret = unsafe { ffmpeg_next::ffi::avformat_query_codec(self.format, id.into(), 0) };
        if ret == 0 {
            return Err(WriterError::config(format!(
                "{} can not carry {:?}",
                self.name(),
                id
            )));
        }
        Ok(())
    }
}

pub struct FfmpegMuxer {
    inner: ffmpeg_next::format::context::Output,
    path: PathBuf,
    // set while a file this muxer created holds no header yet
    remove_on_drop: bool,
}

unsafe impl Send for FfmpegMuxer {}

impl FfmpegMuxer {
    /// Creates the output file for `codec`; the container format follows the
    /// extension. Everything that can be checked is checked before the file
    /// is created or truncated.
    pub fn create(path: &Path, codec: &FfmpegCodec) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.is_dir() {
                return Err(WriterError::io(format!(
                    "output directory {} does not exist",
                    parent.display()
                )));
            }
        }
        ContainerFormat::guess(path)?.check_codec(codec.id())?;

        let existed = path.exists();
        let output = ffmpeg_next::format::output(path).map_err(|e| match e {
            ffmpeg_next::Error::Other { errno } if errno != ffmpeg_next::util::error::EINVAL => {
                WriterError::io(format!("could not open {}: {}", path.display(), e))
            }
            e => WriterError::config(format!(
                "no container format for {}: {}",
                path.display(),
                e
            )),
        })?;
        log::info!(
            "output {} opened as {}",
            path.display(),
            output.format().name()
        );
        Ok(Self {
            inner: output,
            path: path.to_path_buf(),
            remove_on_drop: !existed,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FfmpegMuxer {
    fn drop(&mut self) {
        if self.remove_on_drop {
            log::debug!("removing {}, header was never written", self.path().display());
            if let Err(e) = std::fs::remove_file(&self.path) {
                log::warn!("could not remove {}: {}", self.path.display(), e);
            }
        }
    }
}

impl ContainerMuxer for FfmpegMuxer {
    type Codec = FfmpegCodec;

    fn add_stream(&mut self, codec: &FfmpegCodec) -> Result<usize> {
        let mut writer_stream = self
            .inner
            .add_stream(ffmpeg_next::encoder::find(codec.id()))
            .map_err(|e| {
                WriterError::config(format!(
                    "{} can not carry {}: {}",
                    self.path.display(),
                    codec.name(),
                    e
                ))
            })?;
        writer_stream.set_time_base(codec.time_base());
        writer_stream.set_parameters(codec.encoder());
        Ok(writer_stream.index())
    }

    fn write_header(&mut self) -> Result<()> {
        self.inner
            .write_header()
            .map_err(|e| WriterError::io(format!("write header: {}", e)))?;
        self.remove_on_drop = false;
        Ok(())
    }

    fn stream_time_base(&self, index: usize) -> Result<Rational> {
        self.inner
            .stream(index)
            .map(|s| s.time_base())
            .ok_or_else(|| WriterError::io(format!("stream {} not found", index)))
    }

    fn write_interleaved(&mut self, packet: &EncodedPacket) -> Result<()> {
        packet
            .to_ffmpeg()
            .write_interleaved(&mut self.inner)
            .map_err(|e| WriterError::io(format!("write packet: {}", e)))
    }

    fn write_trailer(&mut self) -> Result<()> {
        self.inner
            .write_trailer()
            .map_err(|e| WriterError::io(format!("write trailer: {}", e)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxState {
    HeaderWritten,
    Finalized,
    Closed,
}

/// Owns one container writer: header at open, packets in order, trailer once.
pub struct MuxSession<M> {
    muxer: Option<M>,
    state: MuxState,
    stream_index: usize,
    stream_time_base: Rational,
    last_ts: Option<i64>,
    packets: u64,
    bytes: u64,
}

impl<M: ContainerMuxer> MuxSession<M> {
    /// Adds the encoder's stream and writes the container header.
    pub fn open(mut muxer: M, codec: &M::Codec) -> Result<Self> {
        let stream_index = muxer.add_stream(codec)?;
        muxer.write_header()?;
        let stream_time_base = muxer.stream_time_base(stream_index)?;
        log::debug!(
            "header written, stream {} time_base: {}/{}",
            stream_index,
            stream_time_base.numerator(),
            stream_time_base.denominator()
        );
        Ok(Self {
            muxer: Some(muxer),
            state: MuxState::HeaderWritten,
            stream_index,
            stream_time_base,
            last_ts: None,
            packets: 0,
            bytes: 0,
        })
    }

    pub fn state(&self) -> MuxState {
        self.state
    }

    pub fn stream_time_base(&self) -> Rational {
        self.stream_time_base
    }

    pub fn packets_written(&self) -> u64 {
        self.packets
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes
    }

    /// Rescales the packet into the stream time base and writes it. Packets
    /// whose ordering timestamp would go backwards are rejected.
    pub fn write_packet(&mut self, mut packet: EncodedPacket) -> Result<()> {
        if self.state != MuxState::HeaderWritten {
            return Err(WriterError::protocol(format!(
                "write_packet called while muxer is {:?}",
                self.state
            )));
        }
        let muxer = self
            .muxer
            .as_mut()
            .ok_or_else(|| WriterError::protocol("muxer already released"))?;

        packet.set_stream(self.stream_index);
        packet.rescale_ts(self.stream_time_base);
        if let (Some(last), Some(ts)) = (self.last_ts, packet.ordering_ts()) {
            if ts < last {
                return Err(WriterError::encode(format!(
                    "packet timestamp {} goes back from {}",
                    ts, last
                )));
            }
        }
        log::debug!(
            "write packet pts: {:?}, dts: {:?}, size: {}, key: {}",
            packet.pts(),
            packet.dts(),
            packet.size(),
            packet.is_key()
        );
        muxer.write_interleaved(&packet)?;
        if let Some(ts) = packet.ordering_ts() {
            self.last_ts = Some(ts);
        }
        self.packets += 1;
        self.bytes += packet.size() as u64;
        Ok(())
    }

    /// Writes the trailer. Exactly once, after the last packet.
    pub fn finalize(&mut self) -> Result<()> {
        if self.state != MuxState::HeaderWritten {
            return Err(WriterError::protocol(format!(
                "finalize called while muxer is {:?}",
                self.state
            )));
        }
        let muxer = self
            .muxer
            .as_mut()
            .ok_or_else(|| WriterError::protocol("muxer already released"))?;
        self.state = MuxState::Finalized;
        muxer.write_trailer()
    }

    /// Releases the writer. Idempotent.
    pub fn close(&mut self) {
        if let Some(muxer) = self.muxer.take() {
            if self.state == MuxState::HeaderWritten {
                log::warn!("closing output without trailer, file is incomplete");
            }
            drop(muxer);
        }
        self.state = MuxState::Closed;
    }
}

static ACTIVE_OUTPUTS: LazyLock<Mutex<HashSet<PathBuf>>> =
    LazyLock::new(|| Mutex::new(HashSet::new()));

/// Resolves `..` and symlinks through the parent directory, which exists
/// by the time a session opens; the file itself may not exist yet.
fn lease_key(path: &Path) -> PathBuf {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    match (absolute.parent(), absolute.file_name()) {
        (Some(parent), Some(name)) => parent
            .canonicalize()
            .map(|dir| dir.join(name))
            .unwrap_or(absolute),
        _ => absolute,
    }
}

/// Exclusive claim on an output path for the lifetime of one session.
#[derive(Debug)]
pub struct OutputLease {
    path: PathBuf,
}

impl OutputLease {
    pub fn acquire(path: &Path) -> Result<Self> {
        let key = lease_key(path);
        let mut active = ACTIVE_OUTPUTS.lock().unwrap_or_else(|e| e.into_inner());
        if !active.insert(key.clone()) {
            return Err(WriterError::config(format!(
                "{} is already being written by another session",
                key.display()
            )));
        }
        Ok(Self { path: key })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for OutputLease {
    fn drop(&mut self) {
        let mut active = ACTIVE_OUTPUTS.lock().unwrap_or_else(|e| e.into_inner());
        active.remove(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_is_exclusive_until_dropped() {
        let lease = OutputLease::acquire(Path::new("lease_test_output.mp4")).unwrap();
        assert!(matches!(
            OutputLease::acquire(Path::new("lease_test_output.mp4")),
            Err(WriterError::Configuration(_))
        ));
        drop(lease);
        assert!(OutputLease::acquire(Path::new("lease_test_output.mp4")).is_ok());
    }

    #[test]
    fn test_lease_normalizes_relative_paths() {
        let lease = OutputLease::acquire(Path::new("lease_rel.mp4")).unwrap();
        assert!(lease.path().is_absolute());
        let again = OutputLease::acquire(&std::env::current_dir().unwrap().join("lease_rel.mp4"));
        assert!(again.is_err());
    }

    #[test]
    fn test_lease_resolves_parent_directory() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::create_dir(dir.path().join("sub"))?;
        let direct = OutputLease::acquire(&dir.path().join("clip.mp4"))?;
        let dotted = OutputLease::acquire(&dir.path().join("sub").join("..").join("clip.mp4"));
        assert!(matches!(dotted, Err(WriterError::Configuration(_))));
        drop(direct);
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_lease_follows_directory_symlinks() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::create_dir(dir.path().join("real"))?;
        std::os::unix::fs::symlink(dir.path().join("real"), dir.path().join("link"))?;
        let _real = OutputLease::acquire(&dir.path().join("real").join("clip.mp4"))?;
        assert!(OutputLease::acquire(&dir.path().join("link").join("clip.mp4")).is_err());
        Ok(())
    }

    mod session {
        use super::*;
        use crate::backend::Backend;
        use crate::config::WriterConfig;
        use crate::testing::{CodecBehavior, Event, MockBackend, MockCodec, MockMuxer};

        fn open_session(backend: &MockBackend) -> (MuxSession<MockMuxer>, MockCodec) {
            let descriptor = WriterConfig::new("mux_session.mp4", 4, 4, 30)
                .descriptor()
                .unwrap();
            let codec = backend.open_codec(&descriptor, true).unwrap();
            let muxer = backend
                .open_muxer(Path::new("mux_session.mp4"), &codec)
                .unwrap();
            (MuxSession::open(muxer, &codec).unwrap(), codec)
        }

        fn packet(ts: i64) -> EncodedPacket {
            EncodedPacket::new(vec![0u8; 4], Rational::new(1, 30))
                .with_timestamps(Some(ts), Some(ts))
        }

        #[test]
        fn test_backwards_timestamp_is_rejected() {
            let backend = MockBackend::new();
            let (mut mux, _codec) = open_session(&backend);
            mux.write_packet(packet(2)).unwrap();
            assert!(matches!(
                mux.write_packet(packet(1)),
                Err(WriterError::Encode(_))
            ));
            assert_eq!(mux.packets_written(), 1);
            assert_eq!(mux.bytes_written(), 4);
            assert_eq!(mux.stream_time_base(), Rational::new(1, 15360));
        }

        #[test]
        fn test_trailer_written_once() {
            let backend = MockBackend::new().with_codec(CodecBehavior::default());
            let (mut mux, _codec) = open_session(&backend);
            mux.finalize().unwrap();
            assert_eq!(mux.state(), MuxState::Finalized);
            assert!(matches!(mux.finalize(), Err(WriterError::Protocol(_))));
            assert!(matches!(
                mux.write_packet(packet(0)),
                Err(WriterError::Protocol(_))
            ));
            mux.close();
            mux.close();
            assert_eq!(backend.recorder.count(&Event::Trailer), 1);
            assert_eq!(backend.recorder.count(&Event::MuxerClosed), 1);
        }
    }
}
