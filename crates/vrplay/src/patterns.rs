//! Synthetic picture source.
//!
//! Each tick renders a left and a right view and packs them into the
//! configured multiview layout. Non-stereo patterns give the right view a
//! small horizontal parallax so every layout carries two distinct views.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use vrconfig::Pattern;
use vrsink::gpu::ViewLayout;
use vrsink::{DisplayInfo, MultiviewFlags, MultiviewMode};

const PARALLAX: u32 = 4;
const CHECKER: u32 = 8;

/// 75% SMPTE colour bars, left to right.
const SMPTE_BARS: [[u8; 3]; 7] = [
    [191, 191, 191],
    [191, 191, 0],
    [0, 191, 191],
    [0, 191, 0],
    [191, 0, 191],
    [191, 0, 0],
    [0, 0, 191],
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eye {
    Left,
    Right,
}

/// One packed view image, RGBA.
#[derive(Debug, Clone)]
pub struct ViewImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl ViewImage {
    fn from_fn(width: u32, height: u32, mut pixel: impl FnMut(u32, u32) -> [u8; 4]) -> Self {
        let mut pixels = Vec::with_capacity(width as usize * height as usize * 4);
        for y in 0..height {
            for x in 0..width {
                pixels.extend_from_slice(&pixel(x, y));
            }
        }
        Self {
            width,
            height,
            pixels,
        }
    }

    fn get(&self, x: u32, y: u32) -> [u8; 4] {
        let x = x.min(self.width.saturating_sub(1));
        let y = y.min(self.height.saturating_sub(1));
        let offset = (y as usize * self.width as usize + x as usize) * 4;
        let mut rgba = [0; 4];
        rgba.copy_from_slice(&self.pixels[offset..offset + 4]);
        rgba
    }
}

pub struct PatternSource {
    pattern: Pattern,
    info: DisplayInfo,
    rng: StdRng,
}

impl PatternSource {
    pub fn new(pattern: Pattern, info: DisplayInfo, seed: u64) -> Self {
        Self {
            pattern,
            info,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn info(&self) -> &DisplayInfo {
        &self.info
    }

    /// Renders one view of tick `index`.
    pub fn view(&mut self, eye: Eye, index: u64) -> ViewImage {
        let (width, height) = ViewLayout::from_info(&self.info).view_size();
        let shift = match eye {
            Eye::Left => 0,
            Eye::Right => PARALLAX,
        };
        let phase = (index % u64::from(CHECKER * 2)) as u32;
        let pattern = self.pattern;
        match pattern {
            Pattern::Smpte => ViewImage::from_fn(width, height, |x, y| {
                if y >= height * 3 / 4 {
                    let level = ((x * 255) / width.max(1)) as u8;
                    return [level, level, level, 255];
                }
                let bar = (((x + shift) * 7) / width.max(1)).min(6) as usize;
                let [r, g, b] = SMPTE_BARS[bar];
                [r, g, b, 255]
            }),
            Pattern::Checkers => ViewImage::from_fn(width, height, |x, y| {
                let cell = ((x + shift + phase) / CHECKER + y / CHECKER) % 2;
                let level = if cell == 0 { 235 } else { 16 };
                [level, level, level, 255]
            }),
            Pattern::Solid => {
                let hue = (index % 3) as usize;
                let mut rgba = [0, 0, 0, 255];
                rgba[hue] = match eye {
                    Eye::Left => 255,
                    Eye::Right => 200,
                };
                ViewImage::from_fn(width, height, |_, _| rgba)
            }
            Pattern::Snow => {
                let rng = &mut self.rng;
                ViewImage::from_fn(width, height, |_, _| {
                    let level = rng.gen::<u8>();
                    [level, level, level, 255]
                })
            }
            Pattern::StereoPair => {
                let base = match eye {
                    Eye::Left => [255, 0, 0, 255],
                    Eye::Right => [0, 255, 255, 255],
                };
                let side = (width.min(height) / 4).max(1);
                let travel = width.saturating_sub(side).max(1);
                let left_edge = (index as u32 % travel) + shift;
                let top = height.saturating_sub(side) / 2;
                ViewImage::from_fn(width, height, |x, y| {
                    let inside = x >= left_edge
                        && x < left_edge + side
                        && y >= top
                        && y < top + side;
                    if inside {
                        [255, 255, 255, 255]
                    } else {
                        base
                    }
                })
            }
        }
    }

    /// Packs `left` and `right` into one frame of the source layout, writing
    /// into `out`. Frame-by-frame layouts are delivered as separate frames
    /// and never packed.
    pub fn pack_into(&self, left: &ViewImage, right: &ViewImage, out: &mut [u8]) {
        let width = self.info.width;
        let (first, second) = if self.info.multiview_flags.contains(MultiviewFlags::RIGHT_VIEW_FIRST) {
            (right, left)
        } else {
            (left, right)
        };
        let (vw, vh) = (first.width.max(1), first.height.max(1));
        for (index, chunk) in out.chunks_exact_mut(4).enumerate() {
            let x = (index as u32) % width;
            let y = (index as u32) / width;
            let rgba = match self.info.multiview_mode {
                MultiviewMode::SideBySide | MultiviewMode::SideBySideQuincunx => {
                    if x < vw {
                        first.get(x, y)
                    } else {
                        second.get(x - vw, y)
                    }
                }
                MultiviewMode::TopBottom => {
                    if y < vh {
                        first.get(x, y)
                    } else {
                        second.get(x, y - vh)
                    }
                }
                MultiviewMode::ColumnInterleaved => {
                    let view = if x % 2 == 0 { first } else { second };
                    view.get(x / 2, y)
                }
                MultiviewMode::RowInterleaved => {
                    let view = if y % 2 == 0 { first } else { second };
                    view.get(x, y / 2)
                }
                MultiviewMode::Checkerboard => {
                    let view = if (x + y) % 2 == 0 { first } else { second };
                    view.get(x / 2, y)
                }
                MultiviewMode::Right => right.get(x, y),
                _ => left.get(x, y),
            };
            chunk.copy_from_slice(&rgba);
        }
    }
}
