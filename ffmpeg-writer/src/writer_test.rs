use ffmpeg_next::Rational;

use crate::{
    config::WriterConfig,
    error::WriterError,
    format::PixelFormat,
    testing::{CodecBehavior, Event, MockBackend, gray_frame},
    writer::{SessionState, StreamingWriter},
};

const WIDTH: u32 = 8;
const HEIGHT: u32 = 6;

fn open_writer(backend: MockBackend, name: &str) -> anyhow::Result<StreamingWriter<MockBackend>> {
    let mut writer = StreamingWriter::new(backend);
    writer.open(&WriterConfig::new(name, WIDTH, HEIGHT, 30))?;
    Ok(writer)
}

fn push_frames(writer: &mut StreamingWriter<MockBackend>, count: u8) -> anyhow::Result<usize> {
    let mut written = 0;
    for i in 0..count {
        written += writer.process_frame(&gray_frame(WIDTH, HEIGHT, i.wrapping_mul(20)))?;
    }
    Ok(written)
}

#[test]
fn test_header_first_trailer_last() -> anyhow::Result<()> {
    let backend = MockBackend::new();
    let recorder = backend.recorder.clone();
    let mut writer = open_writer(backend, "mock_header_first.mp4")?;
    push_frames(&mut writer, 5)?;
    writer.finish()?;

    let events = recorder.events();
    assert_eq!(events[0], Event::MuxerOpened);
    assert_eq!(events[1], Event::Header);
    let trailer = events.iter().position(|e| *e == Event::Trailer).unwrap();
    let last_packet = events
        .iter()
        .rposition(|e| matches!(e, Event::Packet { .. }))
        .unwrap();
    assert!(last_packet < trailer);
    assert_eq!(recorder.count(&Event::Trailer), 1);
    assert_eq!(recorder.count(&Event::MuxerClosed), 1);
    assert_eq!(recorder.count(&Event::CodecClosed), 1);
    Ok(())
}

#[test]
fn test_buffered_packets_are_flushed_on_finish() -> anyhow::Result<()> {
    let backend = MockBackend::new().with_codec(CodecBehavior {
        delay: 3,
        ..Default::default()
    });
    let recorder = backend.recorder.clone();
    let mut writer = open_writer(backend, "mock_buffered_flush.mp4")?;

    assert_eq!(push_frames(&mut writer, 10)?, 7);
    assert_eq!(writer.next_pts(), 10);
    let summary = writer.finish()?;

    assert_eq!(summary.frames, 10);
    assert_eq!(summary.packets, 10);
    assert_eq!(summary.bytes, 80);
    assert_eq!(recorder.packets().len(), 10);
    assert_eq!(writer.state(), SessionState::Closed);
    Ok(())
}

#[test]
fn test_timestamps_are_rescaled_and_monotonic() -> anyhow::Result<()> {
    let backend = MockBackend::new().with_codec(CodecBehavior {
        delay: 1,
        ..Default::default()
    });
    let recorder = backend.recorder.clone();
    let mut writer = open_writer(backend, "mock_rescaled.mp4")?;
    push_frames(&mut writer, 6)?;
    writer.finish()?;

    let packets = recorder.packets();
    let pts: Vec<i64> = packets.iter().filter_map(|(pts, _, _)| *pts).collect();
    assert_eq!(pts, vec![0, 512, 1024, 1536, 2048, 2560]);
    for (_, _, time_base) in &packets {
        assert_eq!(*time_base, Rational::new(1, 15360));
    }
    let durations: Vec<i64> = recorder
        .events()
        .into_iter()
        .filter_map(|e| match e {
            Event::Packet {
                duration, stream, ..
            } => {
                assert_eq!(stream, 0);
                Some(duration)
            }
            _ => None,
        })
        .collect();
    assert!(durations.iter().all(|d| *d == 512));
    Ok(())
}

#[test]
fn test_refused_sends_are_retried_after_receiving() -> anyhow::Result<()> {
    let backend = MockBackend::new().with_codec(CodecBehavior {
        delay: 2,
        lazy: true,
        ..Default::default()
    });
    let recorder = backend.recorder.clone();
    let mut writer = open_writer(backend, "mock_lazy_encoder.mp4")?;
    push_frames(&mut writer, 8)?;
    let summary = writer.finish()?;

    assert_eq!(summary.packets, 8);
    let pts: Vec<i64> = recorder
        .packets()
        .iter()
        .filter_map(|(pts, _, _)| *pts)
        .collect();
    assert!(pts.windows(2).all(|w| w[0] < w[1]));
    Ok(())
}

#[test]
fn test_process_frame_after_finish_is_rejected() -> anyhow::Result<()> {
    let backend = MockBackend::new();
    let recorder = backend.recorder.clone();
    let mut writer = open_writer(backend, "mock_after_finish.mp4")?;
    push_frames(&mut writer, 2)?;
    writer.finish()?;
    let before = recorder.events().len();

    let err = writer
        .process_frame(&gray_frame(WIDTH, HEIGHT, 0))
        .unwrap_err();
    assert!(matches!(err, WriterError::Protocol(_)));
    assert_eq!(recorder.events().len(), before);
    Ok(())
}

#[test]
fn test_second_finish_writes_nothing() -> anyhow::Result<()> {
    let backend = MockBackend::new();
    let recorder = backend.recorder.clone();
    let mut writer = open_writer(backend, "mock_double_finish.mp4")?;
    push_frames(&mut writer, 3)?;
    writer.finish()?;

    assert!(matches!(writer.finish(), Err(WriterError::Protocol(_))));
    assert_eq!(recorder.count(&Event::Trailer), 1);
    assert_eq!(recorder.count(&Event::MuxerClosed), 1);
    Ok(())
}

#[test]
fn test_wrong_frame_size_leaves_session_usable() -> anyhow::Result<()> {
    let backend = MockBackend::new();
    let recorder = backend.recorder.clone();
    let mut writer = open_writer(backend, "mock_wrong_size.mp4")?;
    assert_eq!(writer.frame_len(), Some((WIDTH * HEIGHT * 4) as usize));

    let short = vec![0u8; (WIDTH * HEIGHT * 4 - 1) as usize];
    assert!(matches!(
        writer.process_frame(&short),
        Err(WriterError::Configuration(_))
    ));
    assert_eq!(writer.state(), SessionState::Open);
    assert_eq!(writer.next_pts(), 0);

    writer.process_frame(&gray_frame(WIDTH, HEIGHT, 128))?;
    writer.finish()?;
    assert_eq!(recorder.packets()[0].0, Some(0));
    Ok(())
}

#[test]
fn test_calls_before_open_are_rejected() {
    let mut writer = StreamingWriter::new(MockBackend::new());
    assert_eq!(writer.state(), SessionState::Unopened);
    assert!(matches!(
        writer.process_frame(&gray_frame(WIDTH, HEIGHT, 0)),
        Err(WriterError::Protocol(_))
    ));
    assert!(matches!(writer.finish(), Err(WriterError::Protocol(_))));
    assert_eq!(writer.state(), SessionState::Unopened);
}

#[test]
fn test_invalid_config_touches_nothing() {
    let backend = MockBackend::new();
    let recorder = backend.recorder.clone();
    let mut writer = StreamingWriter::new(backend);

    let err = writer
        .open(&WriterConfig::new("mock_odd_height.mp4", 8, 7, 30))
        .unwrap_err();
    assert!(matches!(err, WriterError::Configuration(_)));
    assert!(recorder.events().is_empty());
    assert_eq!(writer.state(), SessionState::Unopened);

    // the failed attempt must not hold on to the path
    writer
        .open(&WriterConfig::new("mock_odd_height.mp4", 8, 6, 30))
        .unwrap();
    assert_eq!(writer.state(), SessionState::Open);
}

#[test]
fn test_unwritable_output_is_io_error() {
    let mut writer = StreamingWriter::new(MockBackend::new());
    let err = writer
        .open(&WriterConfig::new("unwritable/out.mp4", 8, 6, 30))
        .unwrap_err();
    assert!(matches!(err, WriterError::Io(_)));
    assert_eq!(writer.state(), SessionState::Unopened);
}

#[test]
fn test_open_twice_is_rejected() -> anyhow::Result<()> {
    let mut writer = open_writer(MockBackend::new(), "mock_open_twice.mp4")?;
    let err = writer
        .open(&WriterConfig::new("mock_open_twice_other.mp4", 8, 6, 30))
        .unwrap_err();
    assert!(matches!(err, WriterError::Protocol(_)));
    assert_eq!(writer.state(), SessionState::Open);
    Ok(())
}

#[test]
fn test_encoder_failure_closes_without_trailer() -> anyhow::Result<()> {
    let backend = MockBackend::new().with_codec(CodecBehavior {
        delay: 1,
        fail_on_pts: Some(3),
        ..Default::default()
    });
    let recorder = backend.recorder.clone();
    let mut writer = open_writer(backend, "mock_encoder_failure.mp4")?;
    push_frames(&mut writer, 3)?;

    let err = writer
        .process_frame(&gray_frame(WIDTH, HEIGHT, 0))
        .unwrap_err();
    assert!(matches!(err, WriterError::Encode(_)));
    assert_eq!(writer.state(), SessionState::Closed);
    assert_eq!(recorder.count(&Event::Trailer), 0);
    assert_eq!(recorder.count(&Event::CodecClosed), 1);
    assert_eq!(recorder.count(&Event::MuxerClosed), 1);

    assert!(matches!(
        writer.process_frame(&gray_frame(WIDTH, HEIGHT, 0)),
        Err(WriterError::Protocol(_))
    ));
    assert!(matches!(writer.finish(), Err(WriterError::Protocol(_))));
    drop(writer);
    assert_eq!(recorder.count(&Event::MuxerClosed), 1);
    Ok(())
}

#[test]
fn test_stuck_encoder_is_reported() -> anyhow::Result<()> {
    let backend = MockBackend::new().with_codec(CodecBehavior {
        stuck: true,
        ..Default::default()
    });
    let mut writer = open_writer(backend, "mock_stuck_encoder.mp4")?;
    assert!(matches!(
        writer.process_frame(&gray_frame(WIDTH, HEIGHT, 0)),
        Err(WriterError::Encode(_))
    ));
    assert_eq!(writer.state(), SessionState::Closed);
    Ok(())
}

#[test]
fn test_write_failure_tears_down() -> anyhow::Result<()> {
    let mut backend = MockBackend::new();
    backend.fail_write_at = Some(2);
    let recorder = backend.recorder.clone();
    let mut writer = open_writer(backend, "mock_write_failure.mp4")?;
    push_frames(&mut writer, 2)?;

    assert!(matches!(
        writer.process_frame(&gray_frame(WIDTH, HEIGHT, 0)),
        Err(WriterError::Io(_))
    ));
    assert_eq!(writer.state(), SessionState::Closed);
    assert_eq!(recorder.count(&Event::Trailer), 0);
    assert_eq!(recorder.packets().len(), 2);
    Ok(())
}

#[test]
fn test_drop_without_finish_releases_resources() -> anyhow::Result<()> {
    let backend = MockBackend::new();
    let recorder = backend.recorder.clone();
    let mut writer = open_writer(backend, "mock_dropped.mp4")?;
    push_frames(&mut writer, 2)?;
    drop(writer);

    assert_eq!(recorder.count(&Event::Trailer), 0);
    assert_eq!(recorder.count(&Event::CodecClosed), 1);
    assert_eq!(recorder.count(&Event::MuxerClosed), 1);
    // path is free again
    open_writer(MockBackend::new(), "mock_dropped.mp4")?;
    Ok(())
}

#[test]
fn test_concurrent_sessions_on_one_path() -> anyhow::Result<()> {
    let mut first = open_writer(MockBackend::new(), "mock_shared_path.mp4")?;
    let mut second = StreamingWriter::new(MockBackend::new());
    let err = second
        .open(&WriterConfig::new("mock_shared_path.mp4", WIDTH, HEIGHT, 30))
        .unwrap_err();
    assert!(matches!(err, WriterError::Configuration(_)));

    first.finish()?;
    second.open(&WriterConfig::new("mock_shared_path.mp4", WIDTH, HEIGHT, 30))?;
    second.finish()?;
    Ok(())
}

#[test]
fn test_empty_session_still_finalizes() -> anyhow::Result<()> {
    let backend = MockBackend::new();
    let recorder = backend.recorder.clone();
    let mut writer = open_writer(backend, "mock_empty.mp4")?;
    let summary = writer.finish()?;
    assert_eq!(summary.frames, 0);
    assert_eq!(summary.packets, 0);
    assert_eq!(
        recorder.events(),
        vec![
            Event::MuxerOpened,
            Event::Header,
            Event::Trailer,
            Event::CodecClosed,
            Event::MuxerClosed,
        ]
    );
    Ok(())
}

#[test]
fn test_codec_rejection_never_opens_output() -> anyhow::Result<()> {
    let backend = MockBackend::new().with_codec(CodecBehavior {
        fail_open: true,
        ..Default::default()
    });
    let recorder = backend.recorder.clone();
    let mut writer = StreamingWriter::new(backend);
    let err = writer
        .open(&WriterConfig::new("mock_codec_rejected.mp4", WIDTH, HEIGHT, 30))
        .unwrap_err();

    assert!(matches!(err, WriterError::Configuration(_)));
    assert!(!recorder.events().contains(&Event::MuxerOpened));
    assert_eq!(writer.state(), SessionState::Unopened);
    open_writer(MockBackend::new(), "mock_codec_rejected.mp4")?;
    Ok(())
}

#[test]
fn test_reordered_packets_written_in_decode_order() -> anyhow::Result<()> {
    let backend = MockBackend::new().with_codec(CodecBehavior {
        reorder: true,
        ..Default::default()
    });
    let recorder = backend.recorder.clone();
    let mut writer = open_writer(backend, "mock_reordered.mp4")?;
    push_frames(&mut writer, 7)?;
    let summary = writer.finish()?;
    assert_eq!(summary.packets, 7);

    let packets = recorder.packets();
    let pts: Vec<i64> = packets.iter().filter_map(|(pts, _, _)| *pts).collect();
    let dts: Vec<i64> = packets.iter().filter_map(|(_, dts, _)| *dts).collect();
    assert_eq!(pts[..3], [0, 1024, 512]);
    assert!(dts.windows(2).all(|w| w[0] <= w[1]), "dts: {:?}", dts);
    assert!(pts.iter().zip(&dts).all(|(p, d)| d <= p));
    Ok(())
}

#[test]
fn test_encoder_pixel_format_drives_conversion() -> anyhow::Result<()> {
    let backend = MockBackend::new().with_codec(CodecBehavior {
        pixel_format: Some(PixelFormat::Nv12),
        ..Default::default()
    });
    let mut writer = open_writer(backend, "mock_nv12_encoder.mp4")?;
    assert_eq!(
        writer.descriptor().map(|d| d.pixel_format()),
        Some(PixelFormat::Nv12)
    );
    // the mock codec asserts every frame arrives as NV12
    push_frames(&mut writer, 3)?;
    writer.finish()?;
    assert!(writer.descriptor().is_none());
    Ok(())
}
