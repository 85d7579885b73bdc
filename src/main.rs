use std::path::PathBuf;

use clap::Parser;
use ffmpeg_writer::{
    PixelFormat, ScalerKind, StreamingWriter, WriterConfig, WriterError, WriterTask,
};

mod source;

use source::FrameSource;

/// Encode raw RGBA frames into a video file.
#[derive(Parser, Debug)]
#[command(name = "frame-writer", version)]
struct Cli {
    /// Back-to-back raw frames, "-" for stdin
    input: Option<String>,

    /// Output file, the extension picks the container
    #[arg(short, long)]
    output: Option<PathBuf>,

    #[arg(long)]
    width: Option<u32>,

    #[arg(long)]
    height: Option<u32>,

    #[arg(long)]
    fps: Option<u32>,

    /// "default" (mpeg4), h264, hevc, vp9, av1 or an encoder name
    #[arg(long)]
    codec: Option<String>,

    /// bps
    #[arg(long)]
    bitrate: Option<u64>,

    #[arg(long)]
    gop: Option<u32>,

    #[arg(long)]
    max_b_frames: Option<u32>,

    /// Encoder pixel format (yuv420p, nv12, yuv444p)
    #[arg(long)]
    pixel_format: Option<PixelFormat>,

    /// Layout of the input frames (rgba, bgra)
    #[arg(long)]
    input_format: Option<PixelFormat>,

    /// swscale or bt601
    #[arg(long)]
    scaler: Option<ScalerKind>,

    /// Try a hardware encoder first
    #[arg(long)]
    hardware: bool,

    /// JSON writer config; flags override its fields
    #[arg(long)]
    config: Option<PathBuf>,

    /// Frames allowed to wait for the encoder
    #[arg(long, default_value_t = 8)]
    queue: usize,

    #[arg(long)]
    debug: bool,

    /// Decode the result and check the frame count
    #[arg(long)]
    verify: bool,

    /// Generate N frames instead of reading input
    #[arg(long, conflicts_with = "input")]
    pattern: Option<u32>,
}

fn init_logging(debug: bool) {
    let level = if debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn build_config(cli: &Cli) -> anyhow::Result<WriterConfig> {
    let mut config = match &cli.config {
        Some(path) => WriterConfig::load(path)?,
        None => {
            let (Some(output), Some(width), Some(height), Some(fps)) =
                (&cli.output, cli.width, cli.height, cli.fps)
            else {
                anyhow::bail!(
                    "--output, --width, --height and --fps are required without --config"
                );
            };
            WriterConfig::new(output, width, height, fps)
        }
    };

    if let Some(output) = &cli.output {
        config.output_path = output.clone();
    }
    if let Some(width) = cli.width {
        config.width = width;
    }
    if let Some(height) = cli.height {
        config.height = height;
    }
    if let Some(fps) = cli.fps {
        config.fps = fps;
    }
    if let Some(codec) = &cli.codec {
        config.codec = codec.clone();
    }
    if let Some(bitrate) = cli.bitrate {
        config.bitrate = bitrate;
    }
    if let Some(gop) = cli.gop {
        config.gop_size = gop;
    }
    if let Some(max_b_frames) = cli.max_b_frames {
        config.max_b_frames = max_b_frames;
    }
    if cli.pixel_format.is_some() {
        config.pixel_format = cli.pixel_format;
    }
    if let Some(input_format) = cli.input_format {
        config.input_format = input_format;
    }
    if let Some(scaler) = cli.scaler {
        config.scaler = scaler;
    }
    config.prefer_hardware |= cli.hardware;
    config.debug |= cli.debug;

    config.validate()?;
    Ok(config)
}

async fn feed(task: &WriterTask, source: &mut FrameSource) -> anyhow::Result<u64> {
    let mut frames = 0;
    while let Some(frame) = source.next_frame().await? {
        match task.send(frame).await {
            Ok(()) => frames += 1,
            // the worker is gone, finish() says why
            Err(WriterError::Protocol(_) | WriterError::Cancelled) => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(frames)
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = build_config(&cli)?;
    let frame_len = config.descriptor()?.input_frame_len();
    let mut source = match (cli.pattern, cli.input.as_deref()) {
        (Some(count), _) => FrameSource::pattern(count, frame_len),
        (None, Some(input)) => FrameSource::open(input, frame_len).await?,
        (None, None) => {
            anyhow::bail!("no input: pass a raw frame file, - for stdin, or --pattern N")
        }
    };

    let writer = StreamingWriter::create(&config)?;
    if let Some(descriptor) = writer.descriptor() {
        log::debug!("stream: {:?}", descriptor);
    }
    let task = WriterTask::start(writer, cli.queue);

    let cancel = task.cancel_token();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("interrupted, output will be incomplete");
            cancel.cancel();
        }
    });

    let fed = feed(&task, &mut source).await;
    if fed.is_err() {
        task.cancel();
    }
    let finished = task.finish().await;
    interrupt.abort();

    let sent = fed?;
    let summary = finished?;
    log::debug!("{} frames queued", sent);
    println!("{}", serde_json::to_string_pretty(&summary)?);

    if cli.verify {
        let path = summary.output_path.clone();
        let decoded =
            tokio::task::spawn_blocking(move || ffmpeg_writer::decode_frames(path)).await??;
        if decoded.len() as u64 != summary.frames {
            anyhow::bail!(
                "verify failed: wrote {} frames, decoded {}",
                summary.frames,
                decoded.len()
            );
        }
        let info = ffmpeg_writer::probe(&summary.output_path)?;
        print!("{}", info);
        log::info!("verified {} frames", decoded.len());
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.debug);

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
