use std::fmt;
use std::str::FromStr;

use bitflags::bitflags;

use crate::geometry::Rect;

/// Rational value used for pixel-aspect-ratios and frame rates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fraction {
    pub num: u32,
    pub den: u32,
}

impl Fraction {
    pub const ONE: Fraction = Fraction { num: 1, den: 1 };
    /// Marker used by properties that mean "not set" (for example the device PAR).
    pub const UNSET: Fraction = Fraction { num: 0, den: 1 };

    pub const fn new(num: u32, den: u32) -> Self {
        Self { num, den }
    }

    pub fn is_unset(self) -> bool {
        self.num == 0 || self.den == 0
    }
}

impl Default for Fraction {
    fn default() -> Self {
        Self::ONE
    }
}

impl fmt::Display for Fraction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

impl FromStr for Fraction {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err("fraction must not be empty".to_string());
        }
        let (num, den) = match trimmed.split_once(['/', ':']) {
            Some((num, den)) => (num.trim(), den.trim()),
            None => (trimmed, "1"),
        };
        let num = num
            .parse::<u32>()
            .map_err(|_| format!("invalid numerator in '{trimmed}'"))?;
        let den = den
            .parse::<u32>()
            .map_err(|_| format!("invalid denominator in '{trimmed}'"))?;
        if den == 0 {
            return Err(format!("denominator of '{trimmed}' must not be zero"));
        }
        Ok(Self { num, den })
    }
}

/// Pixel layouts a producer may negotiate.
///
/// Only packed RGBA is displayable; the other formats exist so negotiation can
/// reject them with a configuration error instead of guessing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Rgba,
    Bgra,
    I420,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> Option<usize> {
        match self {
            PixelFormat::Rgba | PixelFormat::Bgra => Some(4),
            PixelFormat::I420 => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PixelFormat::Rgba => "RGBA",
            PixelFormat::Bgra => "BGRA",
            PixelFormat::I420 => "I420",
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Transport layout of multiview (stereoscopic) video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MultiviewMode {
    /// No multiview information; also used as "do not convert" on the output side.
    None,
    #[default]
    Mono,
    Left,
    Right,
    SideBySide,
    SideBySideQuincunx,
    ColumnInterleaved,
    RowInterleaved,
    TopBottom,
    Checkerboard,
    /// Left and right views arrive as alternating separate frames.
    FrameByFrame,
}

impl MultiviewMode {
    pub const ALL: [MultiviewMode; 11] = [
        MultiviewMode::None,
        MultiviewMode::Mono,
        MultiviewMode::Left,
        MultiviewMode::Right,
        MultiviewMode::SideBySide,
        MultiviewMode::SideBySideQuincunx,
        MultiviewMode::ColumnInterleaved,
        MultiviewMode::RowInterleaved,
        MultiviewMode::TopBottom,
        MultiviewMode::Checkerboard,
        MultiviewMode::FrameByFrame,
    ];

    /// Whether a single view is carried, i.e. nothing to convert.
    pub fn is_mono(self) -> bool {
        matches!(
            self,
            MultiviewMode::None | MultiviewMode::Mono | MultiviewMode::Left | MultiviewMode::Right
        )
    }

    pub fn is_frame_by_frame(self) -> bool {
        self == MultiviewMode::FrameByFrame
    }

    /// Number of views carried by one logical frame.
    pub fn views(self) -> u32 {
        if self.is_mono() {
            1
        } else {
            2
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            MultiviewMode::None => "none",
            MultiviewMode::Mono => "mono",
            MultiviewMode::Left => "left",
            MultiviewMode::Right => "right",
            MultiviewMode::SideBySide => "side-by-side",
            MultiviewMode::SideBySideQuincunx => "side-by-side-quincunx",
            MultiviewMode::ColumnInterleaved => "column-interleaved",
            MultiviewMode::RowInterleaved => "row-interleaved",
            MultiviewMode::TopBottom => "top-bottom",
            MultiviewMode::Checkerboard => "checkerboard",
            MultiviewMode::FrameByFrame => "frame-by-frame",
        }
    }
}

impl fmt::Display for MultiviewMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for MultiviewMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase().replace('_', "-");
        let mode = match normalized.as_str() {
            "sbs" => MultiviewMode::SideBySide,
            "tb" | "over-under" => MultiviewMode::TopBottom,
            "fbf" | "frame-packed" => MultiviewMode::FrameByFrame,
            other => MultiviewMode::ALL
                .into_iter()
                .find(|mode| mode.name() == other)
                .ok_or_else(|| format!("unknown multiview mode '{}'", value.trim()))?,
        };
        Ok(mode)
    }
}

bitflags! {
    /// Modifiers of a multiview layout.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MultiviewFlags: u32 {
        const RIGHT_VIEW_FIRST = 1 << 0;
        const LEFT_FLIPPED = 1 << 1;
        const LEFT_FLOPPED = 1 << 2;
        const RIGHT_FLIPPED = 1 << 3;
        const RIGHT_FLOPPED = 1 << 4;
        const HALF_ASPECT = 1 << 14;
        const MIXED_MONO = 1 << 15;
    }
}

impl MultiviewFlags {
    const NAMES: [(&'static str, MultiviewFlags); 7] = [
        ("right-view-first", MultiviewFlags::RIGHT_VIEW_FIRST),
        ("left-flipped", MultiviewFlags::LEFT_FLIPPED),
        ("left-flopped", MultiviewFlags::LEFT_FLOPPED),
        ("right-flipped", MultiviewFlags::RIGHT_FLIPPED),
        ("right-flopped", MultiviewFlags::RIGHT_FLOPPED),
        ("half-aspect", MultiviewFlags::HALF_ASPECT),
        ("mixed-mono", MultiviewFlags::MIXED_MONO),
    ];

    /// Parses one flag name such as `right-view-first`.
    pub fn from_kebab_name(name: &str) -> Option<Self> {
        let normalized = name.trim().to_ascii_lowercase().replace('_', "-");
        Self::NAMES
            .iter()
            .find(|(candidate, _)| *candidate == normalized)
            .map(|(_, flag)| *flag)
    }

    /// Parses a `+`/`,` separated flag list; an empty string means no flags.
    pub fn parse_list(value: &str) -> Result<Self, String> {
        value
            .split(['+', ','])
            .map(str::trim)
            .filter(|part| !part.is_empty() && *part != "none")
            .try_fold(MultiviewFlags::empty(), |acc, part| {
                MultiviewFlags::from_kebab_name(part)
                    .map(|flag| acc | flag)
                    .ok_or_else(|| format!("unknown multiview flag '{part}'"))
            })
    }
}

/// Anaglyph flavour used when a stereo pair is downmixed to one image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DownmixMode {
    #[default]
    GreenMagentaDubois,
    RedCyanDubois,
    AmberBlueDubois,
}

impl DownmixMode {
    pub fn name(self) -> &'static str {
        match self {
            DownmixMode::GreenMagentaDubois => "green-magenta-dubois",
            DownmixMode::RedCyanDubois => "red-cyan-dubois",
            DownmixMode::AmberBlueDubois => "amber-blue-dubois",
        }
    }
}

impl fmt::Display for DownmixMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DownmixMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase().replace('_', "-");
        match normalized.as_str() {
            "green-magenta-dubois" | "green-magenta" => Ok(DownmixMode::GreenMagentaDubois),
            "red-cyan-dubois" | "red-cyan" => Ok(DownmixMode::RedCyanDubois),
            "amber-blue-dubois" | "amber-blue" => Ok(DownmixMode::AmberBlueDubois),
            _ => Err(format!(
                "unknown downmix mode '{}'; expected green-magenta-dubois, red-cyan-dubois, or amber-blue-dubois",
                value.trim()
            )),
        }
    }
}

/// Negotiated description of a video stream as seen by the sink.
///
/// Two copies live inside the sink: the producer-side input description and
/// the post-conversion output description.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayInfo {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub par: Fraction,
    /// Frames per second; `0/1` when the rate is variable or unknown.
    pub fps: Fraction,
    pub multiview_mode: MultiviewMode,
    pub multiview_flags: MultiviewFlags,
    pub views: u32,
}

impl DisplayInfo {
    pub fn new(format: PixelFormat, width: u32, height: u32) -> Self {
        Self {
            format,
            width,
            height,
            par: Fraction::ONE,
            fps: Fraction::new(0, 1),
            multiview_mode: MultiviewMode::Mono,
            multiview_flags: MultiviewFlags::empty(),
            views: 1,
        }
    }

    pub fn rgba(width: u32, height: u32) -> Self {
        Self::new(PixelFormat::Rgba, width, height)
    }

    pub fn with_par(mut self, par: Fraction) -> Self {
        self.par = par;
        self
    }

    pub fn with_fps(mut self, fps: Fraction) -> Self {
        self.fps = fps;
        self
    }

    pub fn with_multiview(mut self, mode: MultiviewMode, flags: MultiviewFlags) -> Self {
        self.multiview_mode = mode;
        self.multiview_flags = flags;
        self.views = mode.views();
        self
    }

    /// Byte size of one packed frame, if the format is packed.
    pub fn frame_size(&self) -> Option<usize> {
        self.format
            .bytes_per_pixel()
            .map(|bpp| self.width as usize * self.height as usize * bpp)
    }
}

/// User-facing knobs of the sink.
///
/// Mirrors the element properties: every field has a validated setter on
/// [`crate::Sink`], and `vrconfig` can load the whole struct from TOML.
#[derive(Debug, Clone, PartialEq)]
pub struct SinkSettings {
    /// Letterbox/pillarbox instead of stretching to the window.
    pub force_aspect_ratio: bool,
    /// Pixel aspect ratio of the output device; `0/1` means square pixels.
    pub pixel_aspect_ratio: Fraction,
    /// Forward key and mouse events from the window.
    pub handle_events: bool,
    /// Draw opaque even when the texture carries alpha.
    pub ignore_alpha: bool,
    pub output_multiview_mode: MultiviewMode,
    pub output_multiview_flags: MultiviewFlags,
    pub output_multiview_downmix: DownmixMode,
    /// Area of an external window to render into.
    pub render_rectangle: Option<Rect>,
}

impl Default for SinkSettings {
    fn default() -> Self {
        Self {
            force_aspect_ratio: true,
            pixel_aspect_ratio: Fraction::UNSET,
            handle_events: true,
            ignore_alpha: true,
            output_multiview_mode: MultiviewMode::Mono,
            output_multiview_flags: MultiviewFlags::empty(),
            output_multiview_downmix: DownmixMode::default(),
            render_rectangle: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fractions() {
        assert_eq!("16/9".parse::<Fraction>().unwrap(), Fraction::new(16, 9));
        assert_eq!("30".parse::<Fraction>().unwrap(), Fraction::new(30, 1));
        assert_eq!(" 4:3 ".parse::<Fraction>().unwrap(), Fraction::new(4, 3));
        assert!("1/0".parse::<Fraction>().is_err());
        assert!("abc".parse::<Fraction>().is_err());
    }

    #[test]
    fn parses_multiview_modes_and_aliases() {
        assert_eq!(
            "side-by-side".parse::<MultiviewMode>().unwrap(),
            MultiviewMode::SideBySide
        );
        assert_eq!("SBS".parse::<MultiviewMode>().unwrap(), MultiviewMode::SideBySide);
        assert_eq!(
            "frame_by_frame".parse::<MultiviewMode>().unwrap(),
            MultiviewMode::FrameByFrame
        );
        assert!("anaglyph".parse::<MultiviewMode>().is_err());
        for mode in MultiviewMode::ALL {
            assert_eq!(mode.name().parse::<MultiviewMode>().unwrap(), mode);
        }
    }

    #[test]
    fn parses_flag_lists() {
        assert_eq!(MultiviewFlags::parse_list("").unwrap(), MultiviewFlags::empty());
        assert_eq!(
            MultiviewFlags::parse_list("right-view-first+half-aspect").unwrap(),
            MultiviewFlags::RIGHT_VIEW_FIRST | MultiviewFlags::HALF_ASPECT
        );
        assert!(MultiviewFlags::parse_list("upside-down").is_err());
    }

    #[test]
    fn kebab_names_differ_from_constant_names() {
        assert_eq!(
            MultiviewFlags::from_kebab_name("Right_View_First"),
            Some(MultiviewFlags::RIGHT_VIEW_FIRST)
        );
        assert_eq!(MultiviewFlags::from_kebab_name("RIGHT_VIEW_FIRST"), Some(MultiviewFlags::RIGHT_VIEW_FIRST));
        assert_eq!(
            MultiviewFlags::from_name("RIGHT_VIEW_FIRST"),
            Some(MultiviewFlags::RIGHT_VIEW_FIRST)
        );
        assert_eq!(MultiviewFlags::from_name("right-view-first"), None);
    }

    #[test]
    fn mono_modes_carry_one_view() {
        assert!(MultiviewMode::Left.is_mono());
        assert_eq!(MultiviewMode::TopBottom.views(), 2);
        let info = DisplayInfo::rgba(640, 480)
            .with_multiview(MultiviewMode::FrameByFrame, MultiviewFlags::empty());
        assert_eq!(info.views, 2);
        assert_eq!(info.frame_size(), Some(640 * 480 * 4));
    }
}
