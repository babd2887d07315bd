use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing_subscriber::EnvFilter;
use vrconfig::{SinkConfig, SourceSettings};
use vrsink::gpu::{HeadlessDeviceFactory, HeadlessProbe};
use vrsink::{
    DisplayInfo, FrameConsumer, FrameFlags, FrameMeta, FramePool, GeometryProvider,
    MultiviewFlags, NavigationEvent, Sink, SinkError, State, StateMachine, VideoFrame, ViewRole,
    WindowEvent,
};

use crate::cli::Cli;
use crate::patterns::{Eye, PatternSource};

const SOURCE_SEED: u64 = 0x5eed;

pub fn initialise_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// What a run did, printed when playback ends.
#[derive(Debug, Default, Serialize)]
pub struct RunSummary {
    pub frames_produced: u64,
    pub frames_rendered: u64,
    pub closed_by_user: bool,
    pub input_mode: String,
    pub output_mode: String,
    pub output_size: Option<[u32; 2]>,
    pub video_size: [u32; 2],
    pub window_size: Option<[u32; 2]>,
    pub display_rect: String,
    pub draws: usize,
    pub presents: usize,
    pub conversions: usize,
    pub uploads: usize,
    pub fence_waits: usize,
    pub devices_created: usize,
    pub leaked_objects: usize,
}

pub fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => SinkConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => SinkConfig::default(),
    };
    apply_overrides(&mut config, &cli);
    config.validate().context("invalid configuration after applying flags")?;

    if cli.print_config {
        print!("{}", config.to_toml_string()?);
        return Ok(());
    }

    let summary = play(&config, &cli)?;
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }
    if summary.leaked_objects > 0 {
        tracing::warn!(leaked = summary.leaked_objects, "GPU objects outlived their device");
    }
    Ok(())
}

fn flag_names(flags: MultiviewFlags) -> Vec<String> {
    flags
        .iter_names()
        .map(|(name, _)| name.to_ascii_lowercase().replace('_', "-"))
        .collect()
}

/// Writes command-line values into `config` so the file and the flags
/// resolve through the same validation.
fn apply_overrides(config: &mut SinkConfig, cli: &Cli) {
    let source = &mut config.source;
    if let Some(pattern) = cli.pattern {
        source.pattern = Some(pattern.to_string());
    }
    if let Some((width, height)) = cli.size {
        source.size = Some(format!("{width}x{height}"));
    }
    if let Some(rate) = cli.fps {
        source.framerate = Some(rate.to_string());
    }
    if let Some(frames) = cli.frames {
        source.frames = Some(frames);
    }
    if let Some(mode) = cli.input_mode {
        source.multiview_mode = Some(mode.to_string());
    }
    if let Some(flags) = cli.input_flags {
        source.multiview_flags = flag_names(flags);
    }

    let sink = &mut config.sink;
    if let Some(mode) = cli.output_mode {
        sink.output_multiview_mode = Some(mode.to_string());
    }
    if let Some(flags) = cli.output_flags {
        sink.output_multiview_flags = flag_names(flags);
    }
    if let Some(downmix) = cli.downmix {
        sink.output_multiview_downmix_mode = Some(downmix.to_string());
    }
    if cli.stretch {
        sink.force_aspect_ratio = Some(false);
    }
}

fn timestamp(index: u64, source: &SourceSettings) -> Duration {
    let rate = source.framerate;
    let nanos = u128::from(index) * 1_000_000_000 * u128::from(rate.den) / u128::from(rate.num.max(1));
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}

/// Produces the frames of tick `index`: one packed frame, or a left/right
/// pair for frame-by-frame layouts.
fn produce(
    source: &mut PatternSource,
    pool: &FramePool,
    index: u64,
    meta: FrameMeta,
) -> Result<Vec<VideoFrame>> {
    let left = source.view(Eye::Left, index);
    let right = source.view(Eye::Right, index);
    let frames = if source.info().multiview_mode.is_frame_by_frame() {
        let (first, second) = if source
            .info()
            .multiview_flags
            .contains(MultiviewFlags::RIGHT_VIEW_FIRST)
        {
            ((&right, ViewRole::Right), (&left, ViewRole::Left))
        } else {
            ((&left, ViewRole::Left), (&right, ViewRole::Right))
        };
        let first_meta = meta
            .with_role(first.1)
            .with_flags(meta.flags | FrameFlags::FIRST_IN_BUNDLE);
        vec![
            pool.acquire(first_meta, |pixels| pixels.copy_from_slice(&first.0.pixels))?,
            pool.acquire(meta.with_role(second.1), |pixels| {
                pixels.copy_from_slice(&second.0.pixels)
            })?,
        ]
    } else {
        vec![pool.acquire(meta, |pixels| source.pack_into(&left, &right, pixels))?]
    };
    Ok(frames)
}

fn resize(sink: &Sink, width: u32, height: u32) -> Result<()> {
    if let Some(window) = sink.window() {
        tracing::info!(width, height, "resizing window");
        window
            .dispatch(WindowEvent::Resized { width, height })
            .context("failed to resize the window")?;
    }
    Ok(())
}

fn play(config: &SinkConfig, cli: &Cli) -> Result<RunSummary> {
    let settings = config.to_settings()?;
    let source_settings = config.source_settings()?;

    let factory = HeadlessDeviceFactory::new();
    let probe = factory.probe();
    let sink = Sink::with_settings(Arc::new(factory), &settings).context("invalid sink settings")?;
    sink.set_navigation_handler(Some(Arc::new(|event: NavigationEvent| {
        tracing::debug!(?event, "navigation");
    })));
    sink.set_state(State::Playing)
        .context("failed to start the sink")?;

    let info = DisplayInfo::rgba(source_settings.width, source_settings.height)
        .with_fps(source_settings.framerate)
        .with_multiview(source_settings.multiview_mode, source_settings.multiview_flags);
    sink.set_caps(&info).context("sink rejected the stream format")?;
    let pool = sink
        .propose_allocation(&info, true)
        .context("allocation failed")?
        .pool
        .context("sink did not offer a frame pool")?;

    tracing::info!(
        pattern = %source_settings.pattern,
        width = info.width,
        height = info.height,
        input = %info.multiview_mode,
        output = %settings.output_multiview_mode,
        frames = source_settings.frames,
        "starting playback"
    );

    let mut summary = RunSummary {
        input_mode: info.multiview_mode.to_string(),
        ..RunSummary::default()
    };
    let mut source = PatternSource::new(source_settings.pattern, info, SOURCE_SEED);
    let started = Instant::now();

    'ticks: for index in 0..source_settings.frames {
        if index == 1 {
            if let Some((width, height)) = cli.window_size {
                resize(&sink, width, height)?;
            }
        }
        for scheduled in cli.resize_at.iter().filter(|resize| resize.frame == index) {
            resize(&sink, scheduled.width, scheduled.height)?;
        }
        if cli.close_after == Some(index) {
            if let Some(window) = sink.window() {
                tracing::info!(frame = index, "closing window");
                window.dispatch(WindowEvent::CloseRequested)?;
                window.send_message(|_| ())?;
            }
        }

        let pts = timestamp(index, &source_settings);
        let duration = timestamp(index + 1, &source_settings).saturating_sub(pts);
        let meta = FrameMeta::at(pts).with_duration(duration);
        let frames = produce(&mut source, &pool, index, meta)?;
        summary.frames_produced += frames.len() as u64;

        for frame in &frames {
            match sink.render(frame) {
                Ok(()) => summary.frames_rendered += 1,
                Err(SinkError::Terminated(_)) => {
                    tracing::info!(frame = index, "output window closed; stopping");
                    summary.closed_by_user = true;
                    break 'ticks;
                }
                Err(err) => {
                    return Err(err).with_context(|| format!("failed to render frame {index}"))
                }
            }
        }

        if cli.realtime {
            if let Some(wait) = pts.checked_sub(started.elapsed()) {
                thread::sleep(wait);
            }
        }
    }

    if let Some(window) = sink.window() {
        window.send_message(|_| ())?;
    }
    collect(&sink, &probe, &mut summary);

    drop(source);
    drop(pool);
    sink.set_state(State::Null).context("failed to stop the sink")?;
    let stats = probe.snapshot();
    summary.devices_created = stats.devices_created;
    summary.leaked_objects = stats.leaked_objects;
    Ok(summary)
}

fn collect(sink: &Sink, probe: &HeadlessProbe, summary: &mut RunSummary) {
    let stats = probe.snapshot();
    summary.draws = stats.draws;
    summary.presents = stats.presents;
    summary.conversions = stats.conversions;
    summary.uploads = stats.uploads;
    summary.fence_waits = stats.fence_waits;
    let (width, height) = sink.video_size();
    summary.video_size = [width, height];
    summary.window_size = sink.window_size().map(|(width, height)| [width, height]);
    summary.display_rect = sink.display_rect().to_string();
    if let Some(output) = sink.output_format() {
        summary.output_mode = output.multiview_mode.to_string();
        summary.output_size = Some([output.width, output.height]);
    }
}

fn print_summary(summary: &RunSummary) {
    println!(
        "Rendered {}/{} frames ({} -> {})",
        summary.frames_rendered, summary.frames_produced, summary.input_mode, summary.output_mode
    );
    if summary.closed_by_user {
        println!("  stopped: output window was closed");
    }
    println!(
        "  video {}x{}, display rect {}",
        summary.video_size[0], summary.video_size[1], summary.display_rect
    );
    if let Some([width, height]) = summary.window_size {
        println!("  window {width}x{height}");
    }
    println!(
        "  draws={} presents={} conversions={} uploads={} fence_waits={}",
        summary.draws, summary.presents, summary.conversions, summary.uploads, summary.fence_waits
    );
    println!("  leaked GPU objects: {}", summary.leaked_objects);
}
