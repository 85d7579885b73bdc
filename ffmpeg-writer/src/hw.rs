//! Encoder discovery.
//!
//! Maps the caller's codec identifier to a concrete libavcodec encoder, finds
//! hardware-accelerated variants (NVENC/VAAPI/QSV/V4L2M2M) and supplies the
//! private options each encoder is opened with.

use ffmpeg_next::Dictionary;

use crate::format::PixelFormat;
use crate::stream::StreamDescriptor;

/// Identifier that selects the encoder every libavcodec build ships.
pub const DEFAULT_CODEC: &str = "default";

/// Resolves a codec identifier to the name of a software encoder.
pub fn software_encoder_name(codec: &str) -> &str {
    match codec {
        "default" | "" => "mpeg4",
        "h264" | "avc" => "libx264",
        "hevc" | "h265" => "libx265",
        "vp9" => "libvpx-vp9",
        "av1" => "libaom-av1",
        other => other,
    }
}

/// Try to find a hardware-accelerated encoder for the given software codec name.
/// Returns the first available hardware encoder, or None if none is found.
pub fn find_hw_encoder(codec_name: &str) -> Option<ffmpeg_next::Codec> {
    let hw_names: &[&str] = match codec_name {
        "libx264" | "h264" => &["h264_nvenc", "h264_vaapi", "h264_qsv", "h264_v4l2m2m"],
        "libx265" | "hevc" | "h265" => &["hevc_nvenc", "hevc_vaapi", "hevc_qsv", "hevc_v4l2m2m"],
        "libvpx-vp9" | "vp9" => &["vp9_vaapi", "vp9_qsv"],
        "libaom-av1" | "libsvtav1" | "av1" => &["av1_nvenc", "av1_vaapi", "av1_qsv"],
        _ => &[],
    };

    for name in hw_names {
        if let Some(codec) = ffmpeg_next::encoder::find_by_name(name) {
            log::info!("found hardware encoder: {}", name);
            return Some(codec);
        }
    }
    None
}

pub fn is_hw_encoder(name: &str) -> bool {
    name.contains("nvenc")
        || name.contains("vaapi")
        || name.contains("qsv")
        || name.contains("v4l2m2m")
}

/// Native pixel format when the caller did not pick one. Hardware encoders
/// commonly prefer NV12, software encoders take planar 4:2:0.
pub fn native_pixel_format(codec: &str, prefer_hardware: bool) -> PixelFormat {
    if prefer_hardware && find_hw_encoder(software_encoder_name(codec)).is_some() {
        PixelFormat::Nv12
    } else {
        PixelFormat::Yuv420p
    }
}

/// Pixel format for the software encoder. A format that was only picked
/// because a hardware encoder exists goes back to planar 4:2:0.
pub fn software_pixel_format(descriptor: &StreamDescriptor) -> PixelFormat {
    if descriptor.pixel_format_is_auto() {
        PixelFormat::Yuv420p
    } else {
        descriptor.pixel_format()
    }
}

/// Private options for the named encoder.
pub fn encoder_options(encoder_name: &str) -> Dictionary<'static> {
    let mut opts = Dictionary::new();
    if encoder_name == "libx264" || encoder_name == "libx265" {
        opts.set("preset", "slow");
    }
    opts
}
