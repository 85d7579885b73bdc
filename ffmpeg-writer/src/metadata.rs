//! Reading back what a session wrote (similar to ffprobe).

use std::fmt;
use std::path::Path;

use ffmpeg_next::{format::Pixel, media::Type};
use serde::Serialize;

use crate::error::{Result, WriterError};

/// Container-level info.
#[derive(Debug, Clone, Serialize)]
pub struct FormatInfo {
    /// e.g. "mov,mp4,m4a,3gp,3g2,mj2"
    pub format_name: String,
    /// None if the container does not record it.
    pub duration_sec: Option<f64>,
    /// bps, 0 if unknown
    pub bit_rate: i64,
    pub nb_streams: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamInfo {
    pub index: usize,
    /// "video", "audio", ...
    pub codec_type: String,
    pub codec_name: String,
    /// e.g. "1/15360"
    pub time_base: String,
    /// In `time_base` units.
    pub duration_ts: Option<i64>,
    /// Number of frames the container claims, 0 if unknown.
    pub nb_frames: i64,
    pub frame_rate: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MediaInfo {
    pub format: FormatInfo,
    pub streams: Vec<StreamInfo>,
}

impl MediaInfo {
    pub fn video_stream(&self) -> Option<&StreamInfo> {
        self.streams.iter().find(|s| s.codec_type == "video")
    }
}

impl fmt::Display for MediaInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format.format_name)?;
        match self.format.duration_sec {
            Some(d) => write!(f, ", {:.3}s", d)?,
            None => write!(f, ", duration N/A")?,
        }
        writeln!(f, ", {} bps", self.format.bit_rate)?;
        for s in &self.streams {
            write!(f, "  #{} {} {}", s.index, s.codec_type, s.codec_name)?;
            if let (Some(w), Some(h)) = (s.width, s.height) {
                write!(f, " {}x{}", w, h)?;
            }
            writeln!(
                f,
                " @ {} fps, tb {}, frames {}",
                s.frame_rate, s.time_base, s.nb_frames
            )?;
        }
        Ok(())
    }
}

fn open_input(path: &Path) -> Result<ffmpeg_next::format::context::Input> {
    crate::init()?;
    ffmpeg_next::format::input(&path)
        .map_err(|e| WriterError::io(format!("could not open {}: {}", path.display(), e)))
}

fn known(value: i64) -> Option<i64> {
    if value == ffmpeg_next::ffi::AV_NOPTS_VALUE || value < 0 {
        None
    } else {
        Some(value)
    }
}

/// Opens a media file and describes its container and streams.
pub fn probe(path: impl AsRef<Path>) -> Result<MediaInfo> {
    let input = open_input(path.as_ref())?;

    let streams = input
        .streams()
        .map(|stream| {
            let params = stream.parameters();
            let (width, height) = if params.medium() == Type::Video {
                let (w, h) = video_size(&params);
                (Some(w), Some(h))
            } else {
                (None, None)
            };
            let tb = stream.time_base();
            let rate = stream.avg_frame_rate();
            StreamInfo {
                index: stream.index(),
                codec_type: format!("{:?}", params.medium()).to_lowercase(),
                codec_name: format!("{:?}", params.id()).to_lowercase(),
                time_base: format!("{}/{}", tb.numerator(), tb.denominator()),
                duration_ts: known(stream.duration()),
                nb_frames: stream.frames(),
                frame_rate: format!("{}/{}", rate.numerator(), rate.denominator()),
                width,
                height,
            }
        })
        .collect();

    // duration is in 1/AV_TIME_BASE seconds
    let duration_sec = known(input.duration())
        .filter(|d| *d > 0)
        .map(|d| d as f64 / ffmpeg_next::ffi::AV_TIME_BASE as f64);

    Ok(MediaInfo {
        format: FormatInfo {
            format_name: input.format().name().to_string(),
            duration_sec,
            bit_rate: input.bit_rate(),
            nb_streams: input.nb_streams(),
        },
        streams,
    })
}

/// Codec parameters do not expose the picture size in ffmpeg-next.
fn video_size(params: &ffmpeg_next::codec::Parameters) -> (u32, u32) {
    unsafe {
        let ptr = params.as_ptr();
        ((*ptr).width.max(0) as u32, (*ptr).height.max(0) as u32)
    }
}

/// One decoded picture.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecodedFrame {
    /// Position in presentation order.
    pub index: usize,
    /// In the stream time base.
    pub pts: Option<i64>,
    /// Average of the luma plane, None for formats without one.
    pub mean_luma: Option<f64>,
}

/// Decodes the first video stream of `path` frame by frame.
pub fn decode_frames(path: impl AsRef<Path>) -> Result<Vec<DecodedFrame>> {
    let path = path.as_ref();
    let mut input = open_input(path)?;
    let stream = input
        .streams()
        .best(Type::Video)
        .ok_or_else(|| WriterError::config(format!("{} has no video stream", path.display())))?;
    let stream_index = stream.index();
    let mut decoder = ffmpeg_next::codec::Context::from_parameters(stream.parameters())
        .and_then(|ctx| ctx.decoder().video())
        .map_err(|e| WriterError::encode(format!("open decoder: {}", e)))?;

    let mut frames = Vec::new();
    for (stream, packet) in input.packets() {
        if stream.index() != stream_index {
            continue;
        }
        decoder
            .send_packet(&packet)
            .map_err(|e| WriterError::encode(format!("decode packet: {}", e)))?;
        receive_frames(&mut decoder, &mut frames)?;
    }
    decoder
        .send_eof()
        .map_err(|e| WriterError::encode(format!("decoder eof: {}", e)))?;
    receive_frames(&mut decoder, &mut frames)?;

    log::debug!("decoded {} frames from {}", frames.len(), path.display());
    Ok(frames)
}

fn receive_frames(
    decoder: &mut ffmpeg_next::codec::decoder::Video,
    frames: &mut Vec<DecodedFrame>,
) -> Result<()> {
    let mut frame = ffmpeg_next::frame::Video::empty();
    loop {
        match decoder.receive_frame(&mut frame) {
            Ok(()) => frames.push(DecodedFrame {
                index: frames.len(),
                pts: frame.timestamp().or(frame.pts()),
                mean_luma: mean_luma(&frame),
            }),
            Err(ffmpeg_next::Error::Eof) => return Ok(()),
            Err(ffmpeg_next::Error::Other { errno })
                if errno == ffmpeg_next::util::error::EAGAIN =>
            {
                return Ok(());
            }
            Err(e) => return Err(WriterError::encode(format!("receive frame: {}", e))),
        }
    }
}

fn mean_luma(frame: &ffmpeg_next::frame::Video) -> Option<f64> {
    match frame.format() {
        Pixel::YUV420P
        | Pixel::YUVJ420P
        | Pixel::YUV422P
        | Pixel::YUVJ422P
        | Pixel::YUV444P
        | Pixel::YUVJ444P
        | Pixel::NV12 => {}
        _ => return None,
    }
    let (width, height) = (frame.width() as usize, frame.height() as usize);
    if width == 0 || height == 0 {
        return None;
    }
    let stride = frame.stride(0);
    let data = frame.data(0);
    let sum: u64 = (0..height)
        .flat_map(|y| &data[y * stride..y * stride + width])
        .map(|v| *v as u64)
        .sum();
    Some(sum as f64 / (width * height) as f64)
}
