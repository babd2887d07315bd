use std::path::PathBuf;

use clap::Parser;
use vrconfig::Pattern;
use vrsink::{DownmixMode, Fraction, MultiviewFlags, MultiviewMode};

#[derive(Parser, Debug)]
#[command(
    name = "vrplay",
    author,
    version,
    about = "Play synthetic stereo test patterns through the multiview video sink"
)]
pub struct Cli {
    /// Sink and source configuration (TOML). Flags override its values.
    #[arg(long, value_name = "FILE", env = "VRPLAY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Test pattern: `smpte`, `checkers`, `solid`, `snow`, or `stereo-pair`.
    #[arg(long, value_name = "PATTERN", value_parser = parse_pattern)]
    pub pattern: Option<Pattern>,

    /// Size of the produced frames (e.g. `1280x720`).
    #[arg(long, value_name = "WIDTHxHEIGHT", value_parser = parse_size)]
    pub size: Option<(u32, u32)>,

    /// Frame rate as `NUM/DEN` or a whole number.
    #[arg(long, value_name = "RATE", value_parser = parse_framerate)]
    pub fps: Option<Fraction>,

    /// Number of frame periods to produce.
    #[arg(long, value_name = "COUNT")]
    pub frames: Option<u64>,

    /// Multiview layout of the produced frames (e.g. `side-by-side`, `fbf`).
    #[arg(long, value_name = "MODE", value_parser = parse_multiview_mode)]
    pub input_mode: Option<MultiviewMode>,

    /// Flags of the produced layout, `+` separated (e.g. `right-view-first+half-aspect`).
    #[arg(long, value_name = "FLAGS", value_parser = parse_multiview_flags)]
    pub input_flags: Option<MultiviewFlags>,

    /// Layout the sink displays; `mono` downmixes stereo to an anaglyph.
    #[arg(long, value_name = "MODE", value_parser = parse_multiview_mode)]
    pub output_mode: Option<MultiviewMode>,

    /// Flags of the displayed layout.
    #[arg(long, value_name = "FLAGS", value_parser = parse_multiview_flags)]
    pub output_flags: Option<MultiviewFlags>,

    /// Anaglyph matrices: `green-magenta-dubois`, `red-cyan-dubois`, `amber-blue-dubois`.
    #[arg(long, value_name = "MODE", value_parser = parse_downmix)]
    pub downmix: Option<DownmixMode>,

    /// Resize the window right after the first frame.
    #[arg(long, value_name = "WIDTHxHEIGHT", value_parser = parse_size)]
    pub window_size: Option<(u32, u32)>,

    /// Stretch the video over the whole window instead of letterboxing.
    #[arg(long)]
    pub stretch: bool,

    /// Simulate the user closing the window after this many frames.
    #[arg(long, value_name = "FRAMES")]
    pub close_after: Option<u64>,

    /// Resize the window when a frame is reached; may repeat.
    #[arg(long, value_name = "FRAME:WIDTHxHEIGHT", value_parser = parse_resize)]
    pub resize_at: Vec<ResizeAt>,

    /// Pace frames at the configured rate instead of as fast as possible.
    #[arg(long)]
    pub realtime: bool,

    /// Print the run summary as JSON.
    #[arg(long)]
    pub json: bool,

    /// Print the effective configuration as TOML and exit.
    #[arg(long)]
    pub print_config: bool,
}

/// A window resize scheduled at a frame index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResizeAt {
    pub frame: u64,
    pub width: u32,
    pub height: u32,
}

pub fn parse() -> Cli {
    Cli::parse()
}

pub fn parse_pattern(value: &str) -> Result<Pattern, String> {
    value.parse()
}

pub fn parse_size(value: &str) -> Result<(u32, u32), String> {
    vrconfig::parse_size(value)
}

pub fn parse_framerate(value: &str) -> Result<Fraction, String> {
    let rate: Fraction = value.parse()?;
    if rate.num == 0 {
        return Err("frame rate must be greater than zero".to_string());
    }
    Ok(rate)
}

pub fn parse_multiview_mode(value: &str) -> Result<MultiviewMode, String> {
    value.parse()
}

pub fn parse_multiview_flags(value: &str) -> Result<MultiviewFlags, String> {
    MultiviewFlags::parse_list(value)
}

pub fn parse_downmix(value: &str) -> Result<DownmixMode, String> {
    value.parse()
}

pub fn parse_resize(value: &str) -> Result<ResizeAt, String> {
    let trimmed = value.trim();
    let (frame, size) = trimmed
        .split_once(':')
        .ok_or_else(|| format!("resize '{trimmed}' must look like FRAME:WIDTHxHEIGHT"))?;
    let frame = frame
        .trim()
        .parse::<u64>()
        .map_err(|_| format!("invalid frame index in '{trimmed}'"))?;
    let (width, height) = parse_size(size)?;
    Ok(ResizeAt {
        frame,
        width,
        height,
    })
}
