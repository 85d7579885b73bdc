use std::fmt::{Display, Formatter};

use crate::error::{Result, WriterError};
use crate::format::PixelFormat;
use crate::scaler::FrameScaler;
use crate::stream::StreamDescriptor;

/// One tightly packed image plane.
#[derive(Debug, Clone)]
pub struct Plane {
    data: Vec<u8>,
    row_bytes: usize,
    rows: usize,
}

impl Plane {
    fn new(row_bytes: usize, rows: usize) -> Self {
        Self {
            data: vec![0; row_bytes * rows],
            row_bytes,
            rows,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn row_bytes(&self) -> usize {
        self.row_bytes
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn row(&self, y: usize) -> &[u8] {
        &self.data[y * self.row_bytes..(y + 1) * self.row_bytes]
    }
}

/// A frame in the encoder's native planar layout.
#[derive(Debug, Clone)]
pub struct ConvertedFrame {
    format: PixelFormat,
    width: u32,
    height: u32,
    planes: Vec<Plane>,
}

impl ConvertedFrame {
    pub fn new(format: PixelFormat, width: u32, height: u32) -> Self {
        let planes = format
            .plane_layout(width, height)
            .into_iter()
            .map(|(row_bytes, rows)| Plane::new(row_bytes, rows))
            .collect();
        Self {
            format,
            width,
            height,
            planes,
        }
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn planes(&self) -> &[Plane] {
        &self.planes
    }

    pub fn plane(&self, index: usize) -> &Plane {
        &self.planes[index]
    }

    pub fn planes_mut(&mut self) -> &mut [Plane] {
        &mut self.planes
    }
}

impl Display for ConvertedFrame {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ConvertedFrame {}x{} {} planes: {}",
            self.width,
            self.height,
            self.format,
            self.planes.len()
        )
    }
}

/// Turns caller frames (packed, e.g. RGBA) into the encoder's planar layout.
///
/// The destination buffer is scratch space reused across calls; a reference
/// to it is only handed out once the scaler completed successfully.
pub struct FrameConverter<S> {
    scaler: S,
    src_format: PixelFormat,
    expected_len: usize,
    frame: ConvertedFrame,
}

impl<S: FrameScaler> FrameConverter<S> {
    pub fn new(scaler: S, descriptor: &StreamDescriptor) -> Self {
        Self {
            scaler,
            src_format: descriptor.input_format(),
            expected_len: descriptor.input_frame_len(),
            frame: ConvertedFrame::new(
                descriptor.pixel_format(),
                descriptor.width(),
                descriptor.height(),
            ),
        }
    }

    /// Bytes one caller frame must contain.
    pub fn expected_len(&self) -> usize {
        self.expected_len
    }

    pub fn check_len(&self, raw: &[u8]) -> Result<()> {
        if raw.len() != self.expected_len {
            return Err(WriterError::config(format!(
                "frame has {} bytes, expected {} ({}x{} {})",
                raw.len(),
                self.expected_len,
                self.frame.width(),
                self.frame.height(),
                self.src_format
            )));
        }
        Ok(())
    }

    pub fn convert(&mut self, raw: &[u8]) -> Result<&ConvertedFrame> {
        self.check_len(raw)?;
        self.scaler.scale(raw, self.src_format, &mut self.frame)?;
        Ok(&self.frame)
    }
}
