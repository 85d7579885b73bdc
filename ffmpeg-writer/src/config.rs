use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, WriterError};
use crate::format::PixelFormat;
use crate::hw;
use crate::scaler::ScalerKind;
use crate::stream::StreamDescriptor;

/// Caller-facing session configuration.
///
/// Only `output_path`, `width`, `height` and `fps` are required when loading
/// from JSON; everything else falls back to the defaults below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriterConfig {
    pub output_path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// "default" picks the MPEG-4 Part 2 encoder.
    #[serde(default = "default_codec")]
    pub codec: String,
    /// bps, 0 lets the encoder decide
    #[serde(default = "default_bitrate")]
    pub bitrate: u64,
    #[serde(default = "default_gop_size")]
    pub gop_size: u32,
    #[serde(default = "default_max_b_frames")]
    pub max_b_frames: u32,
    /// None = native format of the selected encoder
    #[serde(default)]
    pub pixel_format: Option<PixelFormat>,
    #[serde(default = "default_input_format")]
    pub input_format: PixelFormat,
    #[serde(default)]
    pub prefer_hardware: bool,
    #[serde(default)]
    pub scaler: ScalerKind,
    #[serde(default)]
    pub debug: bool,
}

fn default_codec() -> String {
    hw::DEFAULT_CODEC.to_string()
}

fn default_bitrate() -> u64 {
    400_000
}

fn default_gop_size() -> u32 {
    10
}

fn default_max_b_frames() -> u32 {
    1
}

fn default_input_format() -> PixelFormat {
    PixelFormat::Rgba
}

impl WriterConfig {
    pub fn new(output_path: impl Into<PathBuf>, width: u32, height: u32, fps: u32) -> Self {
        Self {
            output_path: output_path.into(),
            width,
            height,
            fps,
            codec: default_codec(),
            bitrate: default_bitrate(),
            gop_size: default_gop_size(),
            max_b_frames: default_max_b_frames(),
            pixel_format: None,
            input_format: default_input_format(),
            prefer_hardware: false,
            scaler: ScalerKind::default(),
            debug: false,
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| WriterError::config(format!("invalid writer config: {}", e)))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn with_codec(mut self, codec: impl Into<String>) -> Self {
        self.codec = codec.into();
        self
    }

    pub fn with_bitrate(mut self, bitrate: u64) -> Self {
        self.bitrate = bitrate;
        self
    }

    pub fn with_gop_size(mut self, gop_size: u32) -> Self {
        self.gop_size = gop_size;
        self
    }

    pub fn with_max_b_frames(mut self, max_b_frames: u32) -> Self {
        self.max_b_frames = max_b_frames;
        self
    }

    pub fn with_pixel_format(mut self, pixel_format: PixelFormat) -> Self {
        self.pixel_format = Some(pixel_format);
        self
    }

    pub fn with_scaler(mut self, scaler: ScalerKind) -> Self {
        self.scaler = scaler;
        self
    }

    pub fn with_hardware(mut self, prefer_hardware: bool) -> Self {
        self.prefer_hardware = prefer_hardware;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Rejects every configuration the pipeline can not honour. Runs before
    /// any output file is touched.
    pub fn validate(&self) -> Result<()> {
        if self.output_path.as_os_str().is_empty() {
            return Err(WriterError::config("output path is empty"));
        }
        if self.width == 0 || self.height == 0 {
            return Err(WriterError::config(format!(
                "invalid video size {}x{}",
                self.width, self.height
            )));
        }
        if self.width > i32::MAX as u32 || self.height > i32::MAX as u32 {
            return Err(WriterError::config("video size out of range"));
        }
        if self.fps == 0 || self.fps > i32::MAX as u32 {
            return Err(WriterError::config(format!("invalid frame rate: {}", self.fps)));
        }
        if self.gop_size == 0 {
            return Err(WriterError::config("gop size must be at least 1"));
        }
        if !self.input_format.is_packed() {
            return Err(WriterError::config(format!(
                "input format must be packed, got {}",
                self.input_format
            )));
        }
        let target = self.pixel_format.unwrap_or(PixelFormat::Yuv420p);
        if target.is_packed() {
            return Err(WriterError::config(format!(
                "encoder pixel format must be planar, got {}",
                target
            )));
        }
        // Hardware encoders default to NV12, which is 4:2:0 as well.
        if (target.is_chroma_subsampled() || self.prefer_hardware)
            && (self.width % 2 != 0 || self.height % 2 != 0)
        {
            return Err(WriterError::config(format!(
                "width and height must be multiples of two for {}, got {}x{}",
                target, self.width, self.height
            )));
        }
        if self.codec.trim().is_empty() {
            return Err(WriterError::config("codec is empty"));
        }
        Ok(())
    }

    /// Validates and freezes the configuration into a stream descriptor.
    pub fn descriptor(&self) -> Result<StreamDescriptor> {
        self.validate()?;
        let pixel_format = match self.pixel_format {
            Some(format) => format,
            None => hw::native_pixel_format(&self.codec, self.prefer_hardware),
        };
        Ok(StreamDescriptor {
            codec: self.codec.clone(),
            width: self.width,
            height: self.height,
            fps: self.fps,
            bit_rate: self.bitrate,
            gop_size: self.gop_size,
            max_b_frames: self.max_b_frames,
            pixel_format,
            auto_pixel_format: self.pixel_format.is_none(),
            input_format: self.input_format,
            prefer_hardware: self.prefer_hardware,
            scaler: self.scaler,
        })
    }
}
