//! Where raw frames come from: a dump of back-to-back frames, or a
//! synthetic brightness ramp.

use anyhow::bail;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

pub enum FrameSource {
    Reader {
        reader: Box<dyn AsyncRead + Unpin + Send>,
        frame_len: usize,
        frames: u64,
    },
    Pattern {
        frame_len: usize,
        count: u32,
        next: u32,
    },
}

impl FrameSource {
    /// `-` reads from stdin.
    pub async fn open(input: &str, frame_len: usize) -> anyhow::Result<Self> {
        let reader: Box<dyn AsyncRead + Unpin + Send> = if input == "-" {
            Box::new(tokio::io::stdin())
        } else {
            let file = tokio::fs::File::open(input)
                .await
                .map_err(|e| anyhow::anyhow!("open {}: {}", input, e))?;
            Box::new(tokio::io::BufReader::new(file))
        };
        Ok(Self::from_reader(reader, frame_len))
    }

    pub fn from_reader(reader: Box<dyn AsyncRead + Unpin + Send>, frame_len: usize) -> Self {
        Self::Reader {
            reader,
            frame_len,
            frames: 0,
        }
    }

    /// `count` uniform gray frames getting brighter from black to white.
    pub fn pattern(count: u32, frame_len: usize) -> Self {
        Self::Pattern {
            frame_len,
            count,
            next: 0,
        }
    }

    pub async fn next_frame(&mut self) -> anyhow::Result<Option<Bytes>> {
        match self {
            Self::Reader {
                reader,
                frame_len,
                frames,
            } => {
                let mut buf = BytesMut::zeroed(*frame_len);
                let mut filled = 0;
                while filled < *frame_len {
                    let n = reader.read(&mut buf[filled..]).await?;
                    if n == 0 {
                        break;
                    }
                    filled += n;
                }
                if filled == 0 {
                    return Ok(None);
                }
                if filled < *frame_len {
                    bail!(
                        "input ends with a partial frame: {} of {} bytes after {} frames",
                        filled,
                        frame_len,
                        frames
                    );
                }
                *frames += 1;
                Ok(Some(buf.freeze()))
            }
            Self::Pattern {
                frame_len,
                count,
                next,
            } => {
                if *next >= *count {
                    return Ok(None);
                }
                let level = ramp_level(*next, *count);
                *next += 1;
                let frame: Vec<u8> = [level, level, level, 255]
                    .into_iter()
                    .cycle()
                    .take(*frame_len)
                    .collect();
                Ok(Some(Bytes::from(frame)))
            }
        }
    }
}

fn ramp_level(index: u32, count: u32) -> u8 {
    if count <= 1 {
        return 128;
    }
    (index as u64 * 255 / (count as u64 - 1)) as u8
}
