//! In-memory backend recording every call the session makes.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};

use ffmpeg_next::Rational;

use crate::{
    backend::Backend,
    encoder::{PacketPoll, SendStatus, VideoCodec},
    error::{Result, WriterError},
    format::PixelFormat,
    frame::ConvertedFrame,
    output::ContainerMuxer,
    packet::EncodedPacket,
    scaler::Bt601Scaler,
    stream::StreamDescriptor,
};

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    MuxerOpened,
    Header,
    Packet {
        pts: Option<i64>,
        dts: Option<i64>,
        duration: i64,
        stream: usize,
        time_base: Rational,
    },
    Trailer,
    MuxerClosed,
    CodecClosed,
}

#[derive(Debug, Clone, Default)]
pub struct Recorder(Arc<Mutex<Vec<Event>>>);

impl Recorder {
    pub fn push(&self, event: Event) {
        self.0.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, wanted: &Event) -> usize {
        self.events().iter().filter(|e| *e == wanted).count()
    }

    pub fn packets(&self) -> Vec<(Option<i64>, Option<i64>, Rational)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Packet {
                    pts,
                    dts,
                    time_base,
                    ..
                } => Some((pts, dts, time_base)),
                _ => None,
            })
            .collect()
    }
}

/// How the fake encoder behaves.
#[derive(Debug, Clone, Default)]
pub struct CodecBehavior {
    /// Frames held back before the first packet comes out.
    pub delay: usize,
    /// Fail when this pts is submitted.
    pub fail_on_pts: Option<i64>,
    /// Output only becomes visible after the next send was refused.
    pub lazy: bool,
    /// Refuse every send without ever producing output.
    pub stuck: bool,
    /// Emit groups of three as I P B: pts 0 2 1 with rising dts.
    pub reorder: bool,
    /// Fail to open, like an encoder rejecting the configuration.
    pub fail_open: bool,
    /// Open with this layout instead of the requested one.
    pub pixel_format: Option<PixelFormat>,
}

pub struct MockCodec {
    recorder: Recorder,
    behavior: CodecBehavior,
    time_base: Rational,
    pixel_format: PixelFormat,
    pending: VecDeque<i64>,
    emitted: i64,
    staged: VecDeque<EncodedPacket>,
    ready: VecDeque<EncodedPacket>,
    eof: bool,
}

impl MockCodec {
    pub fn new(recorder: Recorder, behavior: CodecBehavior, time_base: Rational) -> Self {
        Self {
            recorder,
            pixel_format: behavior.pixel_format.unwrap_or(PixelFormat::Yuv420p),
            behavior,
            time_base,
            pending: VecDeque::new(),
            emitted: 0,
            staged: VecDeque::new(),
            ready: VecDeque::new(),
            eof: false,
        }
    }

    fn emit(&mut self, pts: i64) {
        // reordering delays decode timestamps by one frame
        let dts = if self.behavior.reorder {
            self.emitted - 1
        } else {
            pts
        };
        self.emitted += 1;
        let packet = EncodedPacket::new(vec![pts as u8; 8], self.time_base)
            .with_timestamps(Some(pts), Some(dts))
            .with_key(pts == 0);
        if self.behavior.lazy {
            self.staged.push_back(packet);
        } else {
            self.ready.push_back(packet);
        }
    }

    fn release_staged(&mut self) -> bool {
        if self.staged.is_empty() {
            return false;
        }
        self.ready.extend(self.staged.drain(..));
        true
    }
}

impl VideoCodec for MockCodec {
    fn name(&self) -> &str {
        "mock"
    }

    fn time_base(&self) -> Rational {
        self.time_base
    }

    fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    fn send_frame(&mut self, frame: &ConvertedFrame, pts: i64) -> Result<SendStatus> {
        assert!(!self.eof, "frame sent after eof");
        assert_eq!(frame.format(), self.pixel_format);
        if self.behavior.stuck {
            return Ok(SendStatus::WouldBlock);
        }
        if self.behavior.fail_on_pts == Some(pts) {
            return Err(WriterError::encode(format!("mock failure at pts {}", pts)));
        }
        if self.release_staged() {
            return Ok(SendStatus::WouldBlock);
        }
        self.pending.push_back(pts);
        if self.behavior.reorder {
            if self.pending.len() == 3 {
                let group: Vec<i64> = self.pending.drain(..).collect();
                for pts in [group[0], group[2], group[1]] {
                    self.emit(pts);
                }
            }
            return Ok(SendStatus::Accepted);
        }
        while self.pending.len() > self.behavior.delay {
            if let Some(next) = self.pending.pop_front() {
                self.emit(next);
            }
        }
        Ok(SendStatus::Accepted)
    }

    fn send_eof(&mut self) -> Result<SendStatus> {
        if self.release_staged() {
            return Ok(SendStatus::WouldBlock);
        }
        self.eof = true;
        while let Some(next) = self.pending.pop_front() {
            self.emit(next);
        }
        self.release_staged();
        Ok(SendStatus::Accepted)
    }

    fn receive_packet(&mut self) -> Result<PacketPoll> {
        if let Some(packet) = self.ready.pop_front() {
            return Ok(PacketPoll::Ready(packet));
        }
        if self.eof && self.pending.is_empty() && self.staged.is_empty() {
            return Ok(PacketPoll::EndOfStream);
        }
        Ok(PacketPoll::NoneAvailable)
    }
}

impl Drop for MockCodec {
    fn drop(&mut self) {
        self.recorder.push(Event::CodecClosed);
    }
}

pub struct MockMuxer {
    recorder: Recorder,
    stream_time_base: Rational,
    fail_write_at: Option<usize>,
    writes: usize,
}

impl ContainerMuxer for MockMuxer {
    type Codec = MockCodec;

    fn add_stream(&mut self, _codec: &MockCodec) -> Result<usize> {
        Ok(0)
    }

    fn write_header(&mut self) -> Result<()> {
        self.recorder.push(Event::Header);
        Ok(())
    }

    fn stream_time_base(&self, _index: usize) -> Result<Rational> {
        Ok(self.stream_time_base)
    }

    fn write_interleaved(&mut self, packet: &EncodedPacket) -> Result<()> {
        if self.fail_write_at == Some(self.writes) {
            return Err(WriterError::io("mock disk full"));
        }
        self.writes += 1;
        self.recorder.push(Event::Packet {
            pts: packet.pts(),
            dts: packet.dts(),
            duration: packet.duration(),
            stream: packet.stream_index(),
            time_base: packet.time_base(),
        });
        Ok(())
    }

    fn write_trailer(&mut self) -> Result<()> {
        self.recorder.push(Event::Trailer);
        Ok(())
    }
}

impl Drop for MockMuxer {
    fn drop(&mut self) {
        self.recorder.push(Event::MuxerClosed);
    }
}

#[derive(Debug, Clone)]
pub struct MockBackend {
    pub recorder: Recorder,
    pub codec: CodecBehavior,
    pub stream_time_base: Rational,
    pub fail_write_at: Option<usize>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            recorder: Recorder::default(),
            codec: CodecBehavior::default(),
            stream_time_base: Rational::new(1, 15360),
            fail_write_at: None,
        }
    }

    pub fn with_codec(mut self, codec: CodecBehavior) -> Self {
        self.codec = codec;
        self
    }
}

impl Backend for MockBackend {
    type Codec = MockCodec;
    type Muxer = MockMuxer;
    type Scaler = Bt601Scaler;

    fn requires_global_header(&self, _path: &Path) -> Result<bool> {
        Ok(true)
    }

    fn open_codec(
        &self,
        descriptor: &StreamDescriptor,
        global_header: bool,
    ) -> Result<MockCodec> {
        assert!(global_header);
        if self.codec.fail_open {
            return Err(WriterError::config(format!(
                "mock encoder rejects {}",
                descriptor.pixel_format()
            )));
        }
        let mut codec = MockCodec::new(
            self.recorder.clone(),
            self.codec.clone(),
            descriptor.time_base(),
        );
        codec.pixel_format = self.codec.pixel_format.unwrap_or(descriptor.pixel_format());
        Ok(codec)
    }

    fn open_scaler(&self, _descriptor: &StreamDescriptor) -> Result<Bt601Scaler> {
        Ok(Bt601Scaler::new())
    }

    fn open_muxer(&self, path: &Path, _codec: &MockCodec) -> Result<MockMuxer> {
        if path.to_string_lossy().contains("unwritable") {
            return Err(WriterError::io(format!("could not open {}", path.display())));
        }
        self.recorder.push(Event::MuxerOpened);
        Ok(MockMuxer {
            recorder: self.recorder.clone(),
            stream_time_base: self.stream_time_base,
            fail_write_at: self.fail_write_at,
            writes: 0,
        })
    }
}

/// A uniform RGBA frame.
pub fn gray_frame(width: u32, height: u32, level: u8) -> Vec<u8> {
    [level, level, level, 255]
        .iter()
        .copied()
        .cycle()
        .take((width * height * 4) as usize)
        .collect()
}
