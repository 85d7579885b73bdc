use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::WriterError;

/// Pixel layouts understood by the writer. Packed formats are accepted as
/// caller input, planar formats are what encoders consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Rgba,
    Bgra,
    Yuv420p,
    Nv12,
    Yuv444p,
}

impl PixelFormat {
    pub fn is_packed(self) -> bool {
        matches!(self, PixelFormat::Rgba | PixelFormat::Bgra)
    }

    /// Bytes per pixel of a packed format; planar formats have none.
    pub fn bytes_per_pixel(self) -> Option<usize> {
        match self {
            PixelFormat::Rgba | PixelFormat::Bgra => Some(4),
            _ => None,
        }
    }

    /// 4:2:0 layouts need even width and height.
    pub fn is_chroma_subsampled(self) -> bool {
        matches!(self, PixelFormat::Yuv420p | PixelFormat::Nv12)
    }

    /// `(row_bytes, rows)` for every plane of a tightly packed frame.
    pub fn plane_layout(self, width: u32, height: u32) -> Vec<(usize, usize)> {
        let w = width as usize;
        let h = height as usize;
        match self {
            PixelFormat::Rgba | PixelFormat::Bgra => vec![(w * 4, h)],
            PixelFormat::Yuv420p => {
                let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
                vec![(w, h), (cw, ch), (cw, ch)]
            }
            PixelFormat::Nv12 => vec![(w, h), (w.div_ceil(2) * 2, h.div_ceil(2))],
            PixelFormat::Yuv444p => vec![(w, h), (w, h), (w, h)],
        }
    }

    pub fn frame_size(self, width: u32, height: u32) -> usize {
        self.plane_layout(width, height)
            .iter()
            .map(|(row, rows)| row * rows)
            .sum()
    }

    pub fn name(self) -> &'static str {
        match self {
            PixelFormat::Rgba => "rgba",
            PixelFormat::Bgra => "bgra",
            PixelFormat::Yuv420p => "yuv420p",
            PixelFormat::Nv12 => "nv12",
            PixelFormat::Yuv444p => "yuv444p",
        }
    }
}

impl From<PixelFormat> for ffmpeg_next::format::Pixel {
    fn from(format: PixelFormat) -> Self {
        use ffmpeg_next::format::Pixel;
        match format {
            PixelFormat::Rgba => Pixel::RGBA,
            PixelFormat::Bgra => Pixel::BGRA,
            PixelFormat::Yuv420p => Pixel::YUV420P,
            PixelFormat::Nv12 => Pixel::NV12,
            PixelFormat::Yuv444p => Pixel::YUV444P,
        }
    }
}

impl Display for PixelFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PixelFormat {
    type Err = WriterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rgba" => Ok(PixelFormat::Rgba),
            "bgra" => Ok(PixelFormat::Bgra),
            "yuv420p" => Ok(PixelFormat::Yuv420p),
            "nv12" => Ok(PixelFormat::Nv12),
            "yuv444p" => Ok(PixelFormat::Yuv444p),
            other => Err(WriterError::config(format!("unknown pixel format: {}", other))),
        }
    }
}
