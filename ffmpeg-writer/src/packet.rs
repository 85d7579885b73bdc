use bytes::Bytes;
use ffmpeg_next::Rational;
use ffmpeg_next::util::mathematics::rescale::Rescale;

/// A compressed packet as produced by the encoder, with timestamps counted in
/// `time_base`.
#[derive(Clone, Debug)]
pub struct EncodedPacket {
    data: Bytes,
    pts: Option<i64>,
    dts: Option<i64>,
    duration: i64,
    stream_index: usize,
    is_key: bool,
    time_base: Rational,
}

impl EncodedPacket {
    pub fn new(data: impl Into<Bytes>, time_base: Rational) -> Self {
        Self {
            data: data.into(),
            pts: None,
            dts: None,
            duration: 0,
            stream_index: 0,
            is_key: false,
            time_base,
        }
    }

    pub fn with_timestamps(mut self, pts: Option<i64>, dts: Option<i64>) -> Self {
        self.pts = pts;
        self.dts = dts;
        self
    }

    pub fn with_key(mut self, is_key: bool) -> Self {
        self.is_key = is_key;
        self
    }

    pub fn pts(&self) -> Option<i64> {
        self.pts
    }

    pub fn dts(&self) -> Option<i64> {
        self.dts
    }

    pub fn duration(&self) -> i64 {
        self.duration
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn stream_index(&self) -> usize {
        self.stream_index
    }

    pub fn is_key(&self) -> bool {
        self.is_key
    }

    pub fn time_base(&self) -> Rational {
        self.time_base
    }

    pub fn set_duration(&mut self, duration: i64) {
        self.duration = duration;
    }

    pub fn set_stream(&mut self, index: usize) {
        self.stream_index = index;
    }

    /// Timestamp used for output ordering: dts when known, else pts.
    pub fn ordering_ts(&self) -> Option<i64> {
        self.dts.or(self.pts)
    }

    /// Rescales pts, dts and duration into `destination`. Each value is
    /// rounded to nearest from its absolute position, so errors never
    /// accumulate across packets.
    pub fn rescale_ts(&mut self, destination: Rational) {
        let source = self.time_base;
        if source == destination {
            return;
        }
        self.pts = self.pts.map(|ts| ts.rescale(source, destination));
        self.dts = self.dts.map(|ts| ts.rescale(source, destination));
        if self.duration > 0 {
            self.duration = self.duration.rescale(source, destination);
        }
        self.time_base = destination;
    }

    /// Copies the packet into a libavcodec packet ready for the muxer.
    pub fn to_ffmpeg(&self) -> ffmpeg_next::Packet {
        let mut packet = ffmpeg_next::Packet::copy(&self.data);
        packet.set_pts(self.pts);
        packet.set_dts(self.dts);
        packet.set_duration(self.duration);
        packet.set_stream(self.stream_index);
        packet.set_position(-1);
        if self.is_key {
            packet.set_flags(ffmpeg_next::codec::packet::Flags::KEY);
        }
        packet
    }
}

impl From<(&ffmpeg_next::Packet, Rational)> for EncodedPacket {
    fn from((packet, time_base): (&ffmpeg_next::Packet, Rational)) -> Self {
        Self {
            data: packet
                .data()
                .map(Bytes::copy_from_slice)
                .unwrap_or_default(),
            pts: packet.pts(),
            dts: packet.dts(),
            duration: packet.duration(),
            stream_index: packet.stream(),
            is_key: packet.is_key(),
            time_base,
        }
    }
}
