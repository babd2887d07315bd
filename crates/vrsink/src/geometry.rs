//! Window geometry: display-aspect computation and the letterbox resizer.

use std::fmt;
use std::str::FromStr;

use crate::types::{DisplayInfo, Fraction};

/// Integer rectangle in window pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

impl Rect {
    pub const fn new(x: i32, y: i32, w: i32, h: i32) -> Self {
        Self { x, y, w, h }
    }

    pub fn from_size(width: u32, height: u32) -> Self {
        Self::new(0, 0, clamp_i32(width), clamp_i32(height))
    }

    pub fn is_empty(&self) -> bool {
        self.w <= 0 || self.h <= 0
    }
}

impl fmt::Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{}x{}", self.x, self.y, self.w, self.h)
    }
}

/// Accepts `X,Y,WxH` or `X,Y,W,H`.
impl FromStr for Rect {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let parts: Vec<&str> = trimmed
            .split([',', 'x', 'X'])
            .map(str::trim)
            .collect();
        if parts.len() != 4 {
            return Err(format!(
                "render rectangle '{trimmed}' must look like X,Y,WIDTHxHEIGHT"
            ));
        }
        let mut values = [0i32; 4];
        for (slot, part) in values.iter_mut().zip(&parts) {
            *slot = part
                .parse::<i32>()
                .map_err(|_| format!("invalid number '{part}' in render rectangle"))?;
        }
        let rect = Rect::new(values[0], values[1], values[2], values[3]);
        if rect.w < 1 || rect.h < 1 {
            return Err(format!(
                "render rectangle '{trimmed}' must have a positive size"
            ));
        }
        Ok(rect)
    }
}

fn clamp_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

/// Centers `src` inside `dst`.
///
/// With `scaling` the source is scaled to touch the destination on one axis
/// while keeping its ratio; without it the source keeps its size and is
/// cropped to the destination.
pub fn center_rect(src: Rect, dst: Rect, scaling: bool) -> Rect {
    if !scaling {
        let w = src.w.min(dst.w);
        let h = src.h.min(dst.h);
        return Rect::new(dst.x + (dst.w - w) / 2, dst.y + (dst.h - h) / 2, w, h);
    }
    if src.is_empty() || dst.is_empty() {
        return dst;
    }

    let src_ratio = f64::from(src.w) / f64::from(src.h);
    let dst_ratio = f64::from(dst.w) / f64::from(dst.h);

    let mut result = if src_ratio > dst_ratio {
        let h = (f64::from(dst.w) / src_ratio) as i32;
        Rect::new(0, (dst.h - h) / 2, dst.w, h)
    } else if src_ratio < dst_ratio {
        let w = (f64::from(dst.h) * src_ratio) as i32;
        Rect::new((dst.w - w) / 2, 0, w, dst.h)
    } else {
        Rect::new(0, 0, dst.w, dst.h)
    };
    result.x += dst.x;
    result.y += dst.y;
    result
}

/// Reduced display aspect ratio of a `width`x`height` frame with pixel ratio
/// `par` shown on a device whose pixels have ratio `device_par`.
///
/// Returns `None` when any term is zero.
pub fn display_ratio(
    width: u32,
    height: u32,
    par: Fraction,
    device_par: Fraction,
) -> Option<(u32, u32)> {
    if width == 0 || height == 0 || par.is_unset() || device_par.is_unset() {
        return None;
    }
    let num = u64::from(width) * u64::from(par.num) * u64::from(device_par.den);
    let den = u64::from(height) * u64::from(par.den) * u64::from(device_par.num);
    let divisor = gcd(num, den);
    let num = u32::try_from(num / divisor).ok()?;
    let den = u32::try_from(den / divisor).ok()?;
    Some((num, den))
}

fn scale(value: u32, num: u32, den: u32) -> u32 {
    let scaled = u64::from(value) * u64::from(num) / u64::from(den.max(1));
    u32::try_from(scaled).unwrap_or(u32::MAX)
}

/// Computes letterboxed or stretched display rectangles for a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resizer {
    /// Keep the source aspect ratio instead of filling the window.
    pub keep_aspect_ratio: bool,
    /// Pixel aspect ratio of the output device. Unset means square pixels.
    pub device_par: Fraction,
}

impl Default for Resizer {
    fn default() -> Self {
        Self {
            keep_aspect_ratio: true,
            device_par: Fraction::UNSET,
        }
    }
}

impl Resizer {
    pub fn new(keep_aspect_ratio: bool, device_par: Fraction) -> Self {
        Self {
            keep_aspect_ratio,
            device_par,
        }
    }

    /// Size at which a frame should be shown on square device pixels.
    ///
    /// Keeps the height when it divides evenly by the display ratio, then the
    /// width, otherwise approximates while keeping the height.
    pub fn display_size(&self, width: u32, height: u32, par: Fraction) -> Option<(u32, u32)> {
        let device_par = if self.device_par.is_unset() {
            Fraction::ONE
        } else {
            self.device_par
        };
        let par = if par.is_unset() { Fraction::ONE } else { par };
        let (num, den) = display_ratio(width, height, par, device_par)?;

        let size = if height % den == 0 {
            (scale(height, num, den), height)
        } else if width % num == 0 {
            (width, scale(width, den, num))
        } else {
            (scale(height, num, den), height)
        };
        Some(size)
    }

    pub fn display_size_for(&self, info: &DisplayInfo) -> Option<(u32, u32)> {
        self.display_size(info.width, info.height, info.par)
    }

    /// Fits an already aspect-corrected `video` size into a `window`.
    pub fn fit(&self, video: (u32, u32), window: (u32, u32)) -> Rect {
        let dst = Rect::from_size(window.0, window.1);
        if self.keep_aspect_ratio {
            center_rect(Rect::from_size(video.0, video.1), dst, true)
        } else {
            dst
        }
    }

    /// Display rectangle for a `source` frame with pixel ratio `par` shown in
    /// `window`.
    pub fn compute(&self, source: (u32, u32), par: Fraction, window: (u32, u32)) -> Rect {
        let video = self
            .display_size(source.0, source.1, par)
            .unwrap_or(source);
        self.fit(video, window)
    }
}

/// Window-side layout state kept by the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WindowGeometry {
    pub window_width: u32,
    pub window_height: u32,
    pub display_rect: Rect,
    /// Set when the viewport has to be re-applied before the next draw.
    pub update_viewport: bool,
}

impl WindowGeometry {
    pub fn window_size(&self) -> Option<(u32, u32)> {
        (self.window_width > 0 && self.window_height > 0)
            .then_some((self.window_width, self.window_height))
    }

    /// Records a new window size. Sizes below one are clamped to one.
    pub fn set_window_size(&mut self, width: u32, height: u32) {
        self.window_width = width.max(1);
        self.window_height = height.max(1);
    }

    /// Replaces the display rectangle and returns whether its size changed.
    pub fn set_display_rect(&mut self, rect: Rect) -> bool {
        let resized = rect.w != self.display_rect.w || rect.h != self.display_rect.h;
        self.display_rect = rect;
        self.update_viewport = true;
        resized
    }

    pub fn take_viewport_update(&mut self) -> Option<Rect> {
        std::mem::take(&mut self.update_viewport).then_some(self.display_rect)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn letterboxes_wide_video_into_four_by_three_window() {
        let resizer = Resizer::default();
        let rect = resizer.compute((1920, 1080), Fraction::ONE, (800, 600));
        assert_eq!(rect, Rect::new(0, 75, 800, 450));
    }

    #[test]
    fn pillarboxes_tall_video() {
        let rect = center_rect(Rect::new(0, 0, 600, 800), Rect::new(0, 0, 800, 800), true);
        assert_eq!(rect, Rect::new(100, 0, 600, 800));
    }

    #[test]
    fn stretch_fills_the_window() {
        let resizer = Resizer::new(false, Fraction::UNSET);
        let rect = resizer.compute((1920, 1080), Fraction::ONE, (800, 600));
        assert_eq!(rect, Rect::new(0, 0, 800, 600));
    }

    #[test]
    fn equal_ratios_use_full_destination() {
        let rect = center_rect(Rect::new(0, 0, 640, 480), Rect::new(10, 20, 800, 600), true);
        assert_eq!(rect, Rect::new(10, 20, 800, 600));
    }

    #[test]
    fn unscaled_center_crops_to_destination() {
        let rect = center_rect(Rect::new(0, 0, 1000, 200), Rect::new(0, 0, 800, 600), false);
        assert_eq!(rect, Rect::new(0, 200, 800, 200));
    }

    #[test]
    fn anamorphic_par_widens_display_size() {
        let resizer = Resizer::default();
        assert_eq!(
            resizer.display_size(720, 576, Fraction::new(16, 15)),
            Some((768, 576))
        );
        assert_eq!(resizer.display_size(0, 576, Fraction::ONE), None);
    }

    #[test]
    fn half_width_device_par_doubles_width() {
        let resizer = Resizer::new(true, Fraction::new(1, 2));
        assert_eq!(resizer.display_size(640, 480, Fraction::ONE), Some((1280, 480)));
    }

    #[test]
    fn display_rect_size_change_is_reported() {
        let mut geometry = WindowGeometry::default();
        assert!(geometry.set_display_rect(Rect::new(0, 75, 800, 450)));
        assert_eq!(geometry.take_viewport_update(), Some(Rect::new(0, 75, 800, 450)));
        assert_eq!(geometry.take_viewport_update(), None);
        assert!(!geometry.set_display_rect(Rect::new(10, 75, 800, 450)));
    }

    #[test]
    fn parses_render_rectangles() {
        assert_eq!("0,0,800x600".parse::<Rect>().unwrap(), Rect::new(0, 0, 800, 600));
        assert_eq!("5,6,7,8".parse::<Rect>().unwrap(), Rect::new(5, 6, 7, 8));
        assert!("0,0,0x600".parse::<Rect>().is_err());
        assert!("0,0,800".parse::<Rect>().is_err());
    }
}
