use ffmpeg_next::Rational;

use crate::{
    error::{Result, WriterError},
    format::PixelFormat,
    frame::ConvertedFrame,
    hw,
    packet::EncodedPacket,
    stream::StreamDescriptor,
};

/// Outcome of handing input to the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Accepted,
    /// Input refused until pending packets are received.
    WouldBlock,
}

/// Outcome of asking the encoder for output.
#[derive(Debug)]
pub enum PacketPoll {
    Ready(EncodedPacket),
    NoneAvailable,
    EndOfStream,
}

/// A compressing encoder. Dropping it releases the encoder instance.
pub trait VideoCodec {
    fn name(&self) -> &str;
    fn time_base(&self) -> Rational;
    /// Layout the encoder was opened with; frames must arrive in it.
    fn pixel_format(&self) -> PixelFormat;
    fn send_frame(&mut self, frame: &ConvertedFrame, pts: i64) -> Result<SendStatus>;
    fn send_eof(&mut self) -> Result<SendStatus>;
    fn receive_packet(&mut self) -> Result<PacketPoll>;
}

pub struct FfmpegCodec {
    name: String,
    id: ffmpeg_next::codec::Id,
    inner: ffmpeg_next::codec::encoder::Video,
    frame: ffmpeg_next::frame::Video,
    pixel_format: PixelFormat,
    encoder_time_base: Rational,
}

unsafe impl Send for FfmpegCodec {}

fn open_video_encoder(
    codec: ffmpeg_next::Codec,
    descriptor: &StreamDescriptor,
    pixel_format: PixelFormat,
    global_header: bool,
) -> std::result::Result<ffmpeg_next::codec::encoder::Video, ffmpeg_next::Error> {
    let context = ffmpeg_next::codec::Context::new_with_codec(codec);
    let mut encoder = context.encoder().video()?;
    encoder.set_width(descriptor.width());
    encoder.set_height(descriptor.height());
    encoder.set_format(pixel_format.into());
    encoder.set_time_base(descriptor.time_base());
    encoder.set_frame_rate(Some(descriptor.frame_rate()));
    encoder.set_bit_rate(descriptor.bit_rate() as usize);
    encoder.set_gop(descriptor.gop_size());
    encoder.set_max_b_frames(descriptor.max_b_frames() as usize);
    if global_header {
        encoder.set_flags(ffmpeg_next::codec::Flags::GLOBAL_HEADER);
    }
    encoder.open_with(hw::encoder_options(codec.name()))
}

impl FfmpegCodec {
    /// Opens the encoder named by the descriptor. With `prefer_hardware` a
    /// hardware variant is tried first and the software encoder is the
    /// fallback.
    pub fn open(descriptor: &StreamDescriptor, global_header: bool) -> Result<Self> {
        let software = hw::software_encoder_name(descriptor.codec());

        if descriptor.prefer_hardware() {
            if let Some(hw_codec) = hw::find_hw_encoder(software) {
                let hw_name = hw_codec.name().to_string();
                log::info!("attempting hardware encoder: {}", hw_name);
                let format = descriptor.pixel_format();
                match open_video_encoder(hw_codec, descriptor, format, global_header) {
                    Ok(encoder) => {
                        return Self::from_opened(hw_codec, encoder, descriptor, format);
                    }
                    Err(e) => log::warn!(
                        "hardware encoder {} failed: {}, falling back to {}",
                        hw_name,
                        e,
                        software
                    ),
                }
            } else {
                log::info!("no hardware encoder found, using software encoder: {}", software);
            }
        }

        let codec = ffmpeg_next::encoder::find_by_name(software)
            .ok_or_else(|| WriterError::config(format!("codec not found: {}", software)))?;
        if codec.medium() != ffmpeg_next::media::Type::Video {
            return Err(WriterError::config(format!(
                "codec {} is not a video encoder",
                software
            )));
        }
        let format = hw::software_pixel_format(descriptor);
        let encoder = open_video_encoder(codec, descriptor, format, global_header).map_err(|e| {
            WriterError::config(format!(
                "could not open {} for {}x{} {}: {}",
                software,
                descriptor.width(),
                descriptor.height(),
                format,
                e
            ))
        })?;
        Self::from_opened(codec, encoder, descriptor, format)
    }

    fn from_opened(
        codec: ffmpeg_next::Codec,
        encoder: ffmpeg_next::codec::encoder::Video,
        descriptor: &StreamDescriptor,
        pixel_format: PixelFormat,
    ) -> Result<Self> {
        let encoder_time_base: Rational = unsafe { (*encoder.0.as_ptr()).time_base.into() };
        log::info!(
            "encoder opened: {} ({}), {}, time_base: {}/{}",
            codec.name(),
            if hw::is_hw_encoder(codec.name()) {
                "hardware"
            } else {
                "software"
            },
            pixel_format,
            encoder_time_base.numerator(),
            encoder_time_base.denominator()
        );
        Ok(Self {
            name: codec.name().to_string(),
            id: codec.id(),
            inner: encoder,
            frame: ffmpeg_next::frame::Video::new(
                pixel_format.into(),
                descriptor.width(),
                descriptor.height(),
            ),
            pixel_format,
            encoder_time_base,
        })
    }

    pub fn id(&self) -> ffmpeg_next::codec::Id {
        self.id
    }

    /// The opened encoder, for copying its parameters into a container stream.
    pub fn encoder(&self) -> &ffmpeg_next::codec::encoder::Video {
        &self.inner
    }
}

impl VideoCodec for FfmpegCodec {
    fn name(&self) -> &str {
        &self.name
    }

    fn time_base(&self) -> Rational {
        self.encoder_time_base
    }

    fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    fn send_frame(&mut self, frame: &ConvertedFrame, pts: i64) -> Result<SendStatus> {
        // The encoder may still hold a reference to the previous contents.
        let ret = unsafe { ffmpeg_next::ffi::av_frame_make_writable(self.frame.as_mut_ptr()) };
        if ret < 0 {
            return Err(WriterError::encode(format!(
                "could not make frame writable: {}",
                ffmpeg_next::Error::from(ret)
            )));
        }
        for (index, plane) in frame.planes().iter().enumerate() {
            let stride = self.frame.stride(index);
            let row = plane.row_bytes();
            let dst = self.frame.data_mut(index);
            for y in 0..plane.rows() {
                dst[y * stride..y * stride + row].copy_from_slice(plane.row(y));
            }
        }
        self.frame.set_pts(Some(pts));

        match self.inner.send_frame(&self.frame) {
            Ok(()) => Ok(SendStatus::Accepted),
            Err(ffmpeg_next::Error::Other { errno }) if errno == ffmpeg_next::util::error::EAGAIN => {
                Ok(SendStatus::WouldBlock)
            }
            Err(e) => Err(WriterError::encode(format!("send frame {}: {}", pts, e))),
        }
    }

    fn send_eof(&mut self) -> Result<SendStatus> {
        match self.inner.send_eof() {
            Ok(()) => Ok(SendStatus::Accepted),
            Err(ffmpeg_next::Error::Other { errno }) if errno == ffmpeg_next::util::error::EAGAIN => {
                Ok(SendStatus::WouldBlock)
            }
            Err(e) => Err(WriterError::encode(format!("send eof: {}", e))),
        }
    }

    fn receive_packet(&mut self) -> Result<PacketPoll> {
        let mut packet = ffmpeg_next::Packet::empty();
        match self.inner.receive_packet(&mut packet) {
            Ok(()) => Ok(PacketPoll::Ready(EncodedPacket::from((
                &packet,
                self.encoder_time_base,
            )))),
            Err(ffmpeg_next::Error::Other { errno }) if errno == ffmpeg_next::util::error::EAGAIN => {
                Ok(PacketPoll::NoneAvailable)
            }
            Err(ffmpeg_next::Error::Eof) => Ok(PacketPoll::EndOfStream),
            Err(e) => Err(WriterError::encode(format!("receive packet: {}", e))),
        }
    }
}

/// Upper bound on receive polls in one call; a well-behaved encoder never
/// gets near it.
const MAX_POLLS_PER_CALL: usize = 1 << 16;
/// Upper bound on refused sends in one call.
const MAX_SEND_ATTEMPTS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeState {
    Ready,
    Draining,
    Closed,
}

/// Owns one encoder instance for the lifetime of a session.
pub struct EncodeSession<C> {
    codec: Option<C>,
    state: EncodeState,
    frame_duration: i64,
    last_pts: Option<i64>,
}

impl<C: VideoCodec> EncodeSession<C> {
    pub fn open(codec: C, descriptor: &StreamDescriptor) -> Self {
        Self {
            codec: Some(codec),
            state: EncodeState::Ready,
            frame_duration: descriptor.frame_duration(),
            last_pts: None,
        }
    }

    pub fn state(&self) -> EncodeState {
        self.state
    }

    pub fn codec(&self) -> Option<&C> {
        self.codec.as_ref()
    }

    /// Sends one frame and returns every packet the encoder produced for it,
    /// possibly none while the encoder buffers for reordering.
    pub fn submit(&mut self, frame: &ConvertedFrame, pts: i64) -> Result<Vec<EncodedPacket>> {
        if self.state != EncodeState::Ready {
            return Err(WriterError::protocol(format!(
                "submit called while encoder is {:?}",
                self.state
            )));
        }
        if let Some(last) = self.last_pts {
            if pts <= last {
                return Err(WriterError::protocol(format!(
                    "pts {} does not follow {}",
                    pts, last
                )));
            }
        }
        let result = self.submit_inner(frame, pts);
        if result.is_err() {
            self.close();
        } else {
            self.last_pts = Some(pts);
        }
        result
    }

    fn submit_inner(&mut self, frame: &ConvertedFrame, pts: i64) -> Result<Vec<EncodedPacket>> {
        let duration = self.frame_duration;
        let codec = self
            .codec
            .as_mut()
            .ok_or_else(|| WriterError::protocol("encoder already released"))?;
        let mut packets = Vec::new();
        let mut attempts = 0;
        while codec.send_frame(frame, pts)? == SendStatus::WouldBlock {
            attempts += 1;
            Self::make_room(codec, &mut packets, duration, attempts)?;
        }
        if Self::poll(codec, &mut packets, duration)? {
            return Err(WriterError::encode(
                "encoder signalled end of stream before drain",
            ));
        }
        Ok(packets)
    }

    /// Signals end of input and collects every remaining packet.
    pub fn drain(&mut self) -> Result<Vec<EncodedPacket>> {
        if self.state != EncodeState::Ready {
            return Err(WriterError::protocol(format!(
                "drain called while encoder is {:?}",
                self.state
            )));
        }
        self.state = EncodeState::Draining;
        let result = self.drain_inner();
        if result.is_err() {
            self.close();
        }
        result
    }

    fn drain_inner(&mut self) -> Result<Vec<EncodedPacket>> {
        let duration = self.frame_duration;
        let codec = self
            .codec
            .as_mut()
            .ok_or_else(|| WriterError::protocol("encoder already released"))?;
        let mut packets = Vec::new();
        let mut attempts = 0;
        while codec.send_eof()? == SendStatus::WouldBlock {
            attempts += 1;
            Self::make_room(codec, &mut packets, duration, attempts)?;
        }
        if !Self::poll(codec, &mut packets, duration)? {
            return Err(WriterError::encode("encoder stalled while draining"));
        }
        log::debug!("encoder {} drained {} packets", codec.name(), packets.len());
        Ok(packets)
    }

    /// Receives pending packets after a refused send so the next send can
    /// succeed.
    fn make_room(
        codec: &mut C,
        packets: &mut Vec<EncodedPacket>,
        duration: i64,
        attempts: usize,
    ) -> Result<()> {
        if attempts >= MAX_SEND_ATTEMPTS {
            return Err(WriterError::encode(format!(
                "encoder refused input {} times",
                attempts
            )));
        }
        let before = packets.len();
        if Self::poll(codec, packets, duration)? {
            return Err(WriterError::encode("encoder ended while refusing input"));
        }
        if packets.len() == before {
            return Err(WriterError::encode(
                "encoder refused input without producing output",
            ));
        }
        Ok(())
    }

    /// Collects packets until the encoder has none available or reaches end
    /// of stream. Returns whether end of stream was reached.
    fn poll(codec: &mut C, packets: &mut Vec<EncodedPacket>, duration: i64) -> Result<bool> {
        for _ in 0..MAX_POLLS_PER_CALL {
            match codec.receive_packet()? {
                PacketPoll::Ready(mut packet) => {
                    if packet.duration() <= 0 {
                        packet.set_duration(duration);
                    }
                    packets.push(packet);
                }
                PacketPoll::NoneAvailable => return Ok(false),
                PacketPoll::EndOfStream => return Ok(true),
            }
        }
        Err(WriterError::encode(format!(
            "encoder produced more than {} packets in one call",
            MAX_POLLS_PER_CALL
        )))
    }

    /// Releases the encoder. Safe to call in any state, only the first call
    /// frees anything.
    pub fn close(&mut self) {
        if let Some(codec) = self.codec.take() {
            log::debug!("closing encoder {} ({:?})", codec.name(), self.state);
            drop(codec);
        }
        self.state = EncodeState::Closed;
    }
}
