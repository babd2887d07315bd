//! TOML configuration for the stereo sink and its test-pattern source.
//!
//! The file keeps values in their human-readable form (`"1/1"`,
//! `"0,0,800x600"`, `"side-by-side"`); [`SinkConfig::from_toml_str`] checks
//! every one of them so a loaded config always resolves.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use vrsink::{DownmixMode, Fraction, MultiviewFlags, MultiviewMode, Rect, SinkSettings};

pub const CONFIG_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialise configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct SinkConfig {
    pub version: u32,
    #[serde(default)]
    pub sink: SinkSection,
    #[serde(default)]
    pub source: SourceSection,
}

/// Sink properties. Missing keys keep the sink defaults.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct SinkSection {
    pub force_aspect_ratio: Option<bool>,
    pub pixel_aspect_ratio: Option<String>,
    pub ignore_alpha: Option<bool>,
    pub handle_events: Option<bool>,
    pub output_multiview_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_multiview_flags: Vec<String>,
    pub output_multiview_downmix_mode: Option<String>,
    pub render_rectangle: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct SourceSection {
    pub pattern: Option<String>,
    pub size: Option<String>,
    pub framerate: Option<String>,
    pub multiview_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub multiview_flags: Vec<String>,
    pub frames: Option<u64>,
}

/// Synthetic pictures the source can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Pattern {
    #[default]
    Smpte,
    Checkers,
    Solid,
    Snow,
    /// Distinct left and right views for exercising the converter.
    StereoPair,
}

impl Pattern {
    pub const ALL: [Pattern; 5] = [
        Pattern::Smpte,
        Pattern::Checkers,
        Pattern::Solid,
        Pattern::Snow,
        Pattern::StereoPair,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Pattern::Smpte => "smpte",
            Pattern::Checkers => "checkers",
            Pattern::Solid => "solid",
            Pattern::Snow => "snow",
            Pattern::StereoPair => "stereo-pair",
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Pattern {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase().replace('_', "-");
        Pattern::ALL
            .into_iter()
            .find(|pattern| pattern.name() == normalized)
            .ok_or_else(|| {
                format!(
                    "unknown pattern '{}'; expected smpte, checkers, solid, snow, or stereo-pair",
                    value.trim()
                )
            })
    }
}

/// Resolved `[source]` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceSettings {
    pub pattern: Pattern,
    pub width: u32,
    pub height: u32,
    pub framerate: Fraction,
    pub multiview_mode: MultiviewMode,
    pub multiview_flags: MultiviewFlags,
    pub frames: u64,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            pattern: Pattern::Smpte,
            width: 320,
            height: 240,
            framerate: Fraction::new(30, 1),
            multiview_mode: MultiviewMode::Mono,
            multiview_flags: MultiviewFlags::empty(),
            frames: 120,
        }
    }
}

/// Parses `WIDTHxHEIGHT` with both sides positive.
pub fn parse_size(value: &str) -> Result<(u32, u32), String> {
    let trimmed = value.trim();
    let (width, height) = trimmed
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("size '{trimmed}' must look like WIDTHxHEIGHT"))?;
    let width = width
        .trim()
        .parse::<u32>()
        .map_err(|_| format!("invalid width in '{trimmed}'"))?;
    let height = height
        .trim()
        .parse::<u32>()
        .map_err(|_| format!("invalid height in '{trimmed}'"))?;
    if width == 0 || height == 0 {
        return Err(format!("size '{trimmed}' must be at least 1x1"));
    }
    Ok((width, height))
}

fn flags_from_names(names: &[String]) -> Result<MultiviewFlags, String> {
    names.iter().try_fold(MultiviewFlags::empty(), |acc, name| {
        MultiviewFlags::from_kebab_name(name)
            .map(|flag| acc | flag)
            .ok_or_else(|| format!("unknown multiview flag '{name}'"))
    })
}

fn field<T>(key: &str, value: Option<&str>) -> Result<Option<T>, ConfigError>
where
    T: FromStr<Err = String>,
{
    value
        .map(|raw| {
            raw.parse::<T>()
                .map_err(|err| ConfigError::Invalid(format!("{key}: {err}")))
        })
        .transpose()
}

impl SinkConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let raw: SinkConfig = toml::from_str(input)?;
        raw.validate()?;
        Ok(raw)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let input = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&input)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version != CONFIG_VERSION {
            return Err(ConfigError::Invalid(format!(
                "unsupported config version {}; expected {CONFIG_VERSION}",
                self.version
            )));
        }
        self.to_settings()?;
        self.source_settings()?;
        Ok(())
    }

    /// Sink settings with the file's values applied over the defaults.
    pub fn to_settings(&self) -> Result<SinkSettings, ConfigError> {
        let sink = &self.sink;
        let mut settings = SinkSettings::default();
        if let Some(value) = sink.force_aspect_ratio {
            settings.force_aspect_ratio = value;
        }
        if let Some(value) = sink.ignore_alpha {
            settings.ignore_alpha = value;
        }
        if let Some(value) = sink.handle_events {
            settings.handle_events = value;
        }
        if let Some(par) = field::<Fraction>("pixel-aspect-ratio", sink.pixel_aspect_ratio.as_deref())? {
            settings.pixel_aspect_ratio = par;
        }
        if let Some(mode) = field::<MultiviewMode>(
            "output-multiview-mode",
            sink.output_multiview_mode.as_deref(),
        )? {
            settings.output_multiview_mode = mode;
        }
        settings.output_multiview_flags = flags_from_names(&sink.output_multiview_flags)
            .map_err(|err| ConfigError::Invalid(format!("output-multiview-flags: {err}")))?;
        if let Some(downmix) = field::<DownmixMode>(
            "output-multiview-downmix-mode",
            sink.output_multiview_downmix_mode.as_deref(),
        )? {
            settings.output_multiview_downmix = downmix;
        }
        settings.render_rectangle =
            field::<Rect>("render-rectangle", sink.render_rectangle.as_deref())?;
        Ok(settings)
    }

    pub fn source_settings(&self) -> Result<SourceSettings, ConfigError> {
        let source = &self.source;
        let mut settings = SourceSettings::default();
        if let Some(pattern) = field::<Pattern>("pattern", source.pattern.as_deref())? {
            settings.pattern = pattern;
        }
        if let Some(size) = source.size.as_deref() {
            let (width, height) =
                parse_size(size).map_err(|err| ConfigError::Invalid(format!("size: {err}")))?;
            settings.width = width;
            settings.height = height;
        }
        if let Some(rate) = field::<Fraction>("framerate", source.framerate.as_deref())? {
            if rate.num == 0 {
                return Err(ConfigError::Invalid(
                    "framerate must be greater than zero".into(),
                ));
            }
            settings.framerate = rate;
        }
        if let Some(mode) = field::<MultiviewMode>("multiview-mode", source.multiview_mode.as_deref())? {
            settings.multiview_mode = mode;
        }
        settings.multiview_flags = flags_from_names(&source.multiview_flags)
            .map_err(|err| ConfigError::Invalid(format!("multiview-flags: {err}")))?;
        if let Some(frames) = source.frames {
            settings.frames = frames;
        }
        Ok(settings)
    }
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            sink: SinkSection::default(),
            source: SourceSection::default(),
        }
    }
}
