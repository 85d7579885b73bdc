use std::path::Path;

use crate::{
    encoder::{FfmpegCodec, VideoCodec},
    error::Result,
    output::{ContainerFormat, ContainerMuxer, FfmpegMuxer},
    scaler::{FrameScaler, Scaler},
    stream::StreamDescriptor,
};

/// Creates the encoder, container writer and scaler of one session.
pub trait Backend {
    type Codec: VideoCodec + Send;
    type Muxer: ContainerMuxer<Codec = Self::Codec> + Send;
    type Scaler: FrameScaler + Send;

    /// Whether the container picked for `path` needs codec headers out of
    /// band. Must not create or modify the file.
    fn requires_global_header(&self, path: &Path) -> Result<bool>;

    fn open_codec(
        &self,
        descriptor: &StreamDescriptor,
        global_header: bool,
    ) -> Result<Self::Codec>;

    fn open_scaler(&self, descriptor: &StreamDescriptor) -> Result<Self::Scaler>;

    /// Creates the output file for an opened codec. Called last, so a
    /// configuration the codec rejects never touches the file.
    fn open_muxer(&self, path: &Path, codec: &Self::Codec) -> Result<Self::Muxer>;
}

/// libavcodec, libavformat and libswscale.
#[derive(Debug, Clone, Copy)]
pub struct FfmpegBackend {
    _private: (),
}

impl FfmpegBackend {
    pub fn new() -> Result<Self> {
        crate::init()?;
        Ok(Self { _private: () })
    }
}

impl Backend for FfmpegBackend {
    type Codec = FfmpegCodec;
    type Muxer = FfmpegMuxer;
    type Scaler = Scaler;

    fn requires_global_header(&self, path: &Path) -> Result<bool> {
        Ok(ContainerFormat::guess(path)?.requires_global_header())
    }

    fn open_codec(
        &self,
        descriptor: &StreamDescriptor,
        global_header: bool,
    ) -> Result<FfmpegCodec> {
        FfmpegCodec::open(descriptor, global_header)
    }

    fn open_scaler(&self, descriptor: &StreamDescriptor) -> Result<Scaler> {
        Scaler::for_descriptor(descriptor)
    }

    fn open_muxer(&self, path: &Path, codec: &FfmpegCodec) -> Result<FfmpegMuxer> {
        FfmpegMuxer::create(path, codec)
    }
}
