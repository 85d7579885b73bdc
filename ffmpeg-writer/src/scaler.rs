//! Packed-to-planar pixel conversion.
//!
//! Two implementations sit behind [`FrameScaler`]: libswscale, and a small
//! fixed-point BT.601 converter (limited range) that needs no FFmpeg context.
//!
//! ```text
//! Y  =  16 + ( 66 * R + 129 * G +  25 * B + 128) >> 8
//! Cb = 128 + (-38 * R -  74 * G + 112 * B + 128) >> 8
//! Cr = 128 + (112 * R -  94 * G -  18 * B + 128) >> 8
//! ```

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WriterError};
use crate::format::PixelFormat;
use crate::frame::ConvertedFrame;
use crate::stream::StreamDescriptor;

pub trait FrameScaler {
    /// Converts one packed `src` image into `dst`, overwriting every plane.
    fn scale(
        &mut self,
        src: &[u8],
        src_format: PixelFormat,
        dst: &mut ConvertedFrame,
    ) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalerKind {
    #[default]
    Swscale,
    Bt601,
}

impl FromStr for ScalerKind {
    type Err = WriterError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "swscale" | "sws" => Ok(ScalerKind::Swscale),
            "bt601" | "builtin" => Ok(ScalerKind::Bt601),
            other => Err(WriterError::config(format!("unknown scaler: {}", other))),
        }
    }
}

/// Scaler picked by [`ScalerKind`].
pub enum Scaler {
    Sws(SwsScaler),
    Bt601(Bt601Scaler),
}

impl Scaler {
    pub fn for_descriptor(descriptor: &StreamDescriptor) -> Result<Self> {
        match descriptor.scaler() {
            ScalerKind::Swscale => Ok(Scaler::Sws(SwsScaler::new(
                descriptor.input_format(),
                descriptor.pixel_format(),
                descriptor.width(),
                descriptor.height(),
            )?)),
            ScalerKind::Bt601 => Ok(Scaler::Bt601(Bt601Scaler::new())),
        }
    }
}

impl FrameScaler for Scaler {
    fn scale(
        &mut self,
        src: &[u8],
        src_format: PixelFormat,
        dst: &mut ConvertedFrame,
    ) -> Result<()> {
        match self {
            Scaler::Sws(s) => s.scale(src, src_format, dst),
            Scaler::Bt601(s) => s.scale(src, src_format, dst),
        }
    }
}

pub struct SwsScaler {
    context: ffmpeg_next::software::scaling::Context,
    src_format: PixelFormat,
    input: ffmpeg_next::frame::Video,
    output: ffmpeg_next::frame::Video,
}

impl SwsScaler {
    pub fn new(src: PixelFormat, dst: PixelFormat, width: u32, height: u32) -> Result<Self> {
        let context = ffmpeg_next::software::scaling::Context::get(
            src.into(),
            width,
            height,
            dst.into(),
            width,
            height,
            ffmpeg_next::software::scaling::flag::Flags::BILINEAR,
        )
        .map_err(|e| WriterError::config(format!("no conversion {} -> {}: {}", src, dst, e)))?;
        Ok(Self {
            context,
            src_format: src,
            input: ffmpeg_next::frame::Video::new(src.into(), width, height),
            output: ffmpeg_next::frame::Video::new(dst.into(), width, height),
        })
    }
}

impl FrameScaler for SwsScaler {
    fn scale(
        &mut self,
        src: &[u8],
        src_format: PixelFormat,
        dst: &mut ConvertedFrame,
    ) -> Result<()> {
        if src_format != self.src_format {
            return Err(WriterError::config(format!(
                "scaler built for {}, got {}",
                self.src_format, src_format
            )));
        }
        let bpp = src_format.bytes_per_pixel().unwrap_or(4);
        let row = self.input.width() as usize * bpp;
        let stride = self.input.stride(0);
        let input = self.input.data_mut(0);
        for (y, line) in src.chunks_exact(row).enumerate() {
            input[y * stride..y * stride + row].copy_from_slice(line);
        }

        self.context
            .run(&self.input, &mut self.output)
            .map_err(|e| WriterError::encode(format!("swscale: {}", e)))?;

        for (index, plane) in dst.planes_mut().iter_mut().enumerate() {
            let stride = self.output.stride(index);
            let output = self.output.data(index);
            let row = plane.row_bytes();
            for y in 0..plane.rows() {
                plane.data_mut()[y * row..(y + 1) * row]
                    .copy_from_slice(&output[y * stride..y * stride + row]);
            }
        }
        Ok(())
    }
}

unsafe impl Send for SwsScaler {}

#[derive(Debug, Default, Clone, Copy)]
pub struct Bt601Scaler;

impl Bt601Scaler {
    pub fn new() -> Self {
        Self
    }
}

fn channel_offsets(format: PixelFormat) -> Result<(usize, usize, usize)> {
    match format {
        PixelFormat::Rgba => Ok((0, 1, 2)),
        PixelFormat::Bgra => Ok((2, 1, 0)),
        other => Err(WriterError::config(format!(
            "unsupported source format: {}",
            other
        ))),
    }
}

fn luma(r: i32, g: i32, b: i32) -> u8 {
    (((66 * r + 129 * g + 25 * b + 128) >> 8) + 16).clamp(0, 255) as u8
}

fn chroma_blue(r: i32, g: i32, b: i32) -> u8 {
    (((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128).clamp(0, 255) as u8
}

fn chroma_red(r: i32, g: i32, b: i32) -> u8 {
    (((112 * r - 94 * g - 18 * b + 128) >> 8) + 128).clamp(0, 255) as u8
}

struct PackedImage<'a> {
    data: &'a [u8],
    width: usize,
    height: usize,
    offsets: (usize, usize, usize),
}

impl PackedImage<'_> {
    fn rgb(&self, x: usize, y: usize) -> (i32, i32, i32) {
        let o = (y * self.width + x) * 4;
        (
            i32::from(self.data[o + self.offsets.0]),
            i32::from(self.data[o + self.offsets.1]),
            i32::from(self.data[o + self.offsets.2]),
        )
    }

    /// Average colour of the 2x2 block at chroma position `(cx, cy)`.
    fn block_rgb(&self, cx: usize, cy: usize) -> (i32, i32, i32) {
        let (mut r, mut g, mut b, mut n) = (0, 0, 0, 0);
        for y in cy * 2..(cy * 2 + 2).min(self.height) {
            for x in cx * 2..(cx * 2 + 2).min(self.width) {
                let (pr, pg, pb) = self.rgb(x, y);
                r += pr;
                g += pg;
                b += pb;
                n += 1;
            }
        }
        (r / n, g / n, b / n)
    }
}

impl FrameScaler for Bt601Scaler {
    fn scale(
        &mut self,
        src: &[u8],
        src_format: PixelFormat,
        dst: &mut ConvertedFrame,
    ) -> Result<()> {
        let expected = dst.width() as usize * dst.height() as usize * 4;
        if src.len() < expected {
            return Err(WriterError::config(format!(
                "source has {} bytes, expected {}",
                src.len(),
                expected
            )));
        }
        let image = PackedImage {
            data: src,
            width: dst.width() as usize,
            height: dst.height() as usize,
            offsets: channel_offsets(src_format)?,
        };
        let format = dst.format();
        let (luma_plane, chroma_planes) = dst.planes_mut().split_at_mut(1);
        let y_plane = luma_plane[0].data_mut();
        for y in 0..image.height {
            for x in 0..image.width {
                let (r, g, b) = image.rgb(x, y);
                y_plane[y * image.width + x] = luma(r, g, b);
            }
        }

        match format {
            PixelFormat::Yuv420p => {
                let (u_planes, v_planes) = chroma_planes.split_at_mut(1);
                let row = u_planes[0].row_bytes();
                let rows = u_planes[0].rows();
                let (u, v) = (u_planes[0].data_mut(), v_planes[0].data_mut());
                for cy in 0..rows {
                    for cx in 0..row {
                        let (r, g, b) = image.block_rgb(cx, cy);
                        u[cy * row + cx] = chroma_blue(r, g, b);
                        v[cy * row + cx] = chroma_red(r, g, b);
                    }
                }
            }
            PixelFormat::Nv12 => {
                let plane = &mut chroma_planes[0];
                let row = plane.row_bytes();
                let rows = plane.rows();
                let uv = plane.data_mut();
                for cy in 0..rows {
                    for cx in 0..row / 2 {
                        let (r, g, b) = image.block_rgb(cx, cy);
                        uv[cy * row + cx * 2] = chroma_blue(r, g, b);
                        uv[cy * row + cx * 2 + 1] = chroma_red(r, g, b);
                    }
                }
            }
            PixelFormat::Yuv444p => {
                let (u_planes, v_planes) = chroma_planes.split_at_mut(1);
                let (u, v) = (u_planes[0].data_mut(), v_planes[0].data_mut());
                for y in 0..image.height {
                    for x in 0..image.width {
                        let (r, g, b) = image.rgb(x, y);
                        u[y * image.width + x] = chroma_blue(r, g, b);
                        v[y * image.width + x] = chroma_red(r, g, b);
                    }
                }
            }
            other => {
                return Err(WriterError::config(format!(
                    "unsupported target format: {}",
                    other
                )));
            }
        }
        Ok(())
    }
}
