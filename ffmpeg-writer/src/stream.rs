use ffmpeg_next::Rational;

use crate::format::PixelFormat;
use crate::scaler::ScalerKind;

/// Immutable per-session stream configuration, fixed at open.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamDescriptor {
    pub(crate) codec: String,
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) fps: u32,
    pub(crate) bit_rate: u64,
    pub(crate) gop_size: u32,
    pub(crate) max_b_frames: u32,
    pub(crate) pixel_format: PixelFormat,
    /// Picked from the encoder's preference rather than configured.
    pub(crate) auto_pixel_format: bool,
    pub(crate) input_format: PixelFormat,
    pub(crate) prefer_hardware: bool,
    pub(crate) scaler: ScalerKind,
}

impl StreamDescriptor {
    /// Requested codec identifier, e.g. "default", "h264", "libx265".
    pub fn codec(&self) -> &str {
        &self.codec
    }
    pub fn width(&self) -> u32 {
        self.width
    }
    pub fn height(&self) -> u32 {
        self.height
    }
    pub fn fps(&self) -> u32 {
        self.fps
    }
    pub fn bit_rate(&self) -> u64 {
        self.bit_rate
    }
    pub fn gop_size(&self) -> u32 {
        self.gop_size
    }
    pub fn max_b_frames(&self) -> u32 {
        self.max_b_frames
    }
    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }
    pub fn pixel_format_is_auto(&self) -> bool {
        self.auto_pixel_format
    }
    pub fn input_format(&self) -> PixelFormat {
        self.input_format
    }
    pub fn prefer_hardware(&self) -> bool {
        self.prefer_hardware
    }
    pub fn scaler(&self) -> ScalerKind {
        self.scaler
    }

    pub fn frame_rate(&self) -> Rational {
        Rational::new(self.fps as i32, 1)
    }

    /// Constant frame rate output counts timestamps in frames.
    pub fn time_base(&self) -> Rational {
        Rational::new(1, self.fps as i32)
    }

    /// Duration of one frame in `time_base` units.
    pub fn frame_duration(&self) -> i64 {
        1
    }

    /// Size of one caller frame in bytes.
    pub fn input_frame_len(&self) -> usize {
        self.input_format.frame_size(self.width, self.height)
    }
}
