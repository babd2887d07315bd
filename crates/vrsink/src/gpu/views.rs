use crate::types::{DisplayInfo, DownmixMode, MultiviewFlags, MultiviewMode};

/// Left/right colour matrices (column-major 3x3) of a Dubois anaglyph.
pub fn downmix_matrices(mode: DownmixMode) -> ([f32; 9], [f32; 9]) {
    match mode {
        DownmixMode::GreenMagentaDubois => (
            [-0.062, 0.284, -0.015, -0.158, 0.668, -0.027, -0.039, 0.143, 0.021],
            [0.529, -0.016, 0.009, 0.705, -0.015, 0.075, 0.024, -0.065, 0.937],
        ),
        DownmixMode::RedCyanDubois => (
            [0.437, -0.062, -0.048, 0.449, -0.062, -0.050, 0.164, -0.024, -0.017],
            [-0.011, 0.377, -0.026, -0.032, 0.761, -0.093, -0.007, 0.009, 1.234],
        ),
        DownmixMode::AmberBlueDubois => (
            [1.062, -0.026, -0.038, -0.205, 0.908, -0.173, 0.299, 0.068, 0.022],
            [-0.016, 0.006, 0.094, -0.123, 0.062, 0.185, -0.017, -0.017, 0.911],
        ),
    }
}

/// Packed frame layout on one side of a conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewLayout {
    pub mode: MultiviewMode,
    pub flags: MultiviewFlags,
    /// Size of one transported frame, not of one view.
    pub width: u32,
    pub height: u32,
}

impl ViewLayout {
    pub fn from_info(info: &DisplayInfo) -> Self {
        Self {
            mode: info.multiview_mode,
            flags: info.multiview_flags,
            width: info.width,
            height: info.height,
        }
    }

    /// Size of a single view inside a frame of this layout.
    pub fn view_size(&self) -> (u32, u32) {
        let (w, h) = match self.mode {
            MultiviewMode::SideBySide
            | MultiviewMode::SideBySideQuincunx
            | MultiviewMode::ColumnInterleaved
            | MultiviewMode::Checkerboard => (self.width / 2, self.height),
            MultiviewMode::TopBottom | MultiviewMode::RowInterleaved => {
                (self.width, self.height / 2)
            }
            _ => (self.width, self.height),
        };
        (w.max(1), h.max(1))
    }

    /// Frames needed to carry both views.
    pub fn frame_count(&self) -> usize {
        if self.mode.is_frame_by_frame() {
            2
        } else {
            1
        }
    }
}

/// Full description of one multiview conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewPlan {
    pub input: ViewLayout,
    pub output: ViewLayout,
    pub downmix: DownmixMode,
}

/// Tightly packed RGBA image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Image {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl Image {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![0; width as usize * height as usize * 4],
        }
    }

    pub fn from_pixels(width: u32, height: u32, pixels: Vec<u8>) -> Option<Self> {
        (pixels.len() == width as usize * height as usize * 4).then_some(Self {
            width,
            height,
            pixels,
        })
    }

    fn offset(&self, x: u32, y: u32) -> usize {
        let x = x.min(self.width.saturating_sub(1)) as usize;
        let y = y.min(self.height.saturating_sub(1)) as usize;
        (y * self.width as usize + x) * 4
    }

    pub fn get(&self, x: u32, y: u32) -> [u8; 4] {
        let at = self.offset(x, y);
        [
            self.pixels[at],
            self.pixels[at + 1],
            self.pixels[at + 2],
            self.pixels[at + 3],
        ]
    }

    pub fn set(&mut self, x: u32, y: u32, value: [u8; 4]) {
        let at = self.offset(x, y);
        self.pixels[at..at + 4].copy_from_slice(&value);
    }

    fn map(width: u32, height: u32, mut sample: impl FnMut(u32, u32) -> [u8; 4]) -> Self {
        let mut image = Image::new(width, height);
        for y in 0..height {
            for x in 0..width {
                image.set(x, y, sample(x, y));
            }
        }
        image
    }

    fn scaled(&self, width: u32, height: u32) -> Image {
        if self.width == width && self.height == height {
            return self.clone();
        }
        Image::map(width, height, |x, y| {
            let sx = (u64::from(x) * u64::from(self.width) / u64::from(width.max(1))) as u32;
            let sy = (u64::from(y) * u64::from(self.height) / u64::from(height.max(1))) as u32;
            self.get(sx, sy)
        })
    }

    fn mirrored(&self, flip: bool, flop: bool) -> Image {
        if !flip && !flop {
            return self.clone();
        }
        Image::map(self.width, self.height, |x, y| {
            let sx = if flop { self.width - 1 - x } else { x };
            let sy = if flip { self.height - 1 - y } else { y };
            self.get(sx, sy)
        })
    }
}

fn orient(left: Image, right: Image, flags: MultiviewFlags) -> (Image, Image) {
    let left = left.mirrored(
        flags.contains(MultiviewFlags::LEFT_FLIPPED),
        flags.contains(MultiviewFlags::LEFT_FLOPPED),
    );
    let right = right.mirrored(
        flags.contains(MultiviewFlags::RIGHT_FLIPPED),
        flags.contains(MultiviewFlags::RIGHT_FLOPPED),
    );
    (left, right)
}

/// Splits the input frames into a left and right view.
fn unpack(inputs: &[Image], layout: &ViewLayout) -> Result<(Image, Image), String> {
    let first = inputs
        .first()
        .ok_or_else(|| "conversion needs at least one input frame".to_string())?;
    let (vw, vh) = layout.view_size();

    let (a, b) = match layout.mode {
        MultiviewMode::FrameByFrame => {
            let second = inputs
                .get(1)
                .ok_or_else(|| "frame-by-frame input needs two frames".to_string())?;
            (first.clone(), second.scaled(first.width, first.height))
        }
        MultiviewMode::SideBySide | MultiviewMode::SideBySideQuincunx => (
            Image::map(vw, vh, |x, y| first.get(x, y)),
            Image::map(vw, vh, |x, y| first.get(x + vw, y)),
        ),
        MultiviewMode::ColumnInterleaved => (
            Image::map(vw, vh, |x, y| first.get(2 * x, y)),
            Image::map(vw, vh, |x, y| first.get(2 * x + 1, y)),
        ),
        MultiviewMode::Checkerboard => (
            Image::map(vw, vh, |x, y| first.get(2 * x + y % 2, y)),
            Image::map(vw, vh, |x, y| first.get(2 * x + 1 - y % 2, y)),
        ),
        MultiviewMode::TopBottom => (
            Image::map(vw, vh, |x, y| first.get(x, y)),
            Image::map(vw, vh, |x, y| first.get(x, y + vh)),
        ),
        MultiviewMode::RowInterleaved => (
            Image::map(vw, vh, |x, y| first.get(x, 2 * y)),
            Image::map(vw, vh, |x, y| first.get(x, 2 * y + 1)),
        ),
        MultiviewMode::None | MultiviewMode::Mono | MultiviewMode::Left | MultiviewMode::Right => {
            (first.clone(), first.clone())
        }
    };

    let (left, right) = if layout.flags.contains(MultiviewFlags::RIGHT_VIEW_FIRST) {
        (b, a)
    } else {
        (a, b)
    };
    Ok(orient(left, right, layout.flags))
}

fn downmix(left: &Image, right: &Image, mode: DownmixMode) -> Image {
    let (ml, mr) = downmix_matrices(mode);
    let apply = |m: &[f32; 9], rgb: [f32; 3]| -> [f32; 3] {
        [
            m[0] * rgb[0] + m[3] * rgb[1] + m[6] * rgb[2],
            m[1] * rgb[0] + m[4] * rgb[1] + m[7] * rgb[2],
            m[2] * rgb[0] + m[5] * rgb[1] + m[8] * rgb[2],
        ]
    };
    let to_unit = |p: [u8; 4]| [p[0] as f32 / 255.0, p[1] as f32 / 255.0, p[2] as f32 / 255.0];
    Image::map(left.width, left.height, |x, y| {
        let l = left.get(x, y);
        let r = right.get(x, y);
        let lc = apply(&ml, to_unit(l));
        let rc = apply(&mr, to_unit(r));
        let channel = |i: usize| ((lc[i] + rc[i]).clamp(0.0, 1.0) * 255.0).round() as u8;
        [channel(0), channel(1), channel(2), l[3].max(r[3])]
    })
}

/// Combines a left and right view into the output layout.
fn pack(left: Image, right: Image, plan: &ViewPlan) -> Vec<Image> {
    let layout = &plan.output;
    let (vw, vh) = layout.view_size();
    let (left, right) = orient(left.scaled(vw, vh), right.scaled(vw, vh), layout.flags);
    let (first, second) = if layout.flags.contains(MultiviewFlags::RIGHT_VIEW_FIRST) {
        (&right, &left)
    } else {
        (&left, &right)
    };
    let (w, h) = (layout.width.max(1), layout.height.max(1));

    match layout.mode {
        MultiviewMode::None | MultiviewMode::Mono => vec![downmix(&left, &right, plan.downmix)],
        MultiviewMode::Left => vec![left],
        MultiviewMode::Right => vec![right],
        MultiviewMode::FrameByFrame => vec![left, right],
        MultiviewMode::SideBySide | MultiviewMode::SideBySideQuincunx => {
            vec![Image::map(w, h, |x, y| {
                if x < vw {
                    first.get(x, y)
                } else {
                    second.get(x - vw, y)
                }
            })]
        }
        MultiviewMode::ColumnInterleaved => vec![Image::map(w, h, |x, y| {
            if x % 2 == 0 {
                first.get(x / 2, y)
            } else {
                second.get(x / 2, y)
            }
        })],
        MultiviewMode::Checkerboard => vec![Image::map(w, h, |x, y| {
            if (x + y) % 2 == 0 {
                first.get(x / 2, y)
            } else {
                second.get(x / 2, y)
            }
        })],
        MultiviewMode::TopBottom => vec![Image::map(w, h, |x, y| {
            if y < vh {
                first.get(x, y)
            } else {
                second.get(x, y - vh)
            }
        })],
        MultiviewMode::RowInterleaved => vec![Image::map(w, h, |x, y| {
            if y % 2 == 0 {
                first.get(x, y / 2)
            } else {
                second.get(x, y / 2)
            }
        })],
    }
}

/// Converts `inputs` laid out as `plan.input` into frames laid out as `plan.output`.
pub(crate) fn convert_images(inputs: &[Image], plan: &ViewPlan) -> Result<Vec<Image>, String> {
    let (left, right) = unpack(inputs, &plan.input)?;
    Ok(pack(left, right, plan))
}

#[cfg(test)]
mod tests {
    use super::*;

    const RED: [u8; 4] = [255, 0, 0, 255];
    const BLUE: [u8; 4] = [0, 0, 255, 255];

    fn solid(width: u32, height: u32, color: [u8; 4]) -> Image {
        Image::map(width, height, |_, _| color)
    }

    fn layout(mode: MultiviewMode, width: u32, height: u32) -> ViewLayout {
        ViewLayout {
            mode,
            flags: MultiviewFlags::empty(),
            width,
            height,
        }
    }

    fn side_by_side(width: u32, height: u32) -> Image {
        Image::map(width, height, |x, _| if x < width / 2 { RED } else { BLUE })
    }

    #[test]
    fn view_sizes_follow_packing() {
        assert_eq!(layout(MultiviewMode::SideBySide, 1920, 1080).view_size(), (960, 1080));
        assert_eq!(layout(MultiviewMode::TopBottom, 1920, 1080).view_size(), (1920, 540));
        assert_eq!(layout(MultiviewMode::RowInterleaved, 8, 8).view_size(), (8, 4));
        assert_eq!(layout(MultiviewMode::FrameByFrame, 8, 8).view_size(), (8, 8));
    }

    #[test]
    fn side_by_side_to_top_bottom_moves_views() {
        let plan = ViewPlan {
            input: layout(MultiviewMode::SideBySide, 8, 4),
            output: layout(MultiviewMode::TopBottom, 4, 8),
            downmix: DownmixMode::default(),
        };
        let out = convert_images(&[side_by_side(8, 4)], &plan).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].get(0, 0), RED);
        assert_eq!(out[0].get(3, 3), RED);
        assert_eq!(out[0].get(0, 4), BLUE);
        assert_eq!(out[0].get(3, 7), BLUE);
    }

    #[test]
    fn right_view_first_swaps_views() {
        let mut input = layout(MultiviewMode::SideBySide, 8, 4);
        input.flags = MultiviewFlags::RIGHT_VIEW_FIRST;
        let plan = ViewPlan {
            input,
            output: layout(MultiviewMode::Left, 4, 4),
            downmix: DownmixMode::default(),
        };
        let out = convert_images(&[side_by_side(8, 4)], &plan).unwrap();
        assert_eq!(out[0].get(1, 1), BLUE);
    }

    #[test]
    fn frame_by_frame_output_yields_two_frames() {
        let plan = ViewPlan {
            input: layout(MultiviewMode::SideBySide, 8, 4),
            output: layout(MultiviewMode::FrameByFrame, 4, 4),
            downmix: DownmixMode::default(),
        };
        let out = convert_images(&[side_by_side(8, 4)], &plan).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].get(2, 2), RED);
        assert_eq!(out[1].get(2, 2), BLUE);
    }

    #[test]
    fn frame_by_frame_input_requires_both_frames() {
        let plan = ViewPlan {
            input: layout(MultiviewMode::FrameByFrame, 4, 4),
            output: layout(MultiviewMode::SideBySide, 8, 4),
            downmix: DownmixMode::default(),
        };
        assert!(convert_images(&[solid(4, 4, RED)], &plan).is_err());
        let out = convert_images(&[solid(4, 4, RED), solid(4, 4, BLUE)], &plan).unwrap();
        assert_eq!(out[0].get(0, 0), RED);
        assert_eq!(out[0].get(7, 0), BLUE);
    }

    #[test]
    fn green_magenta_downmix_uses_dubois_weights() {
        let white = [255, 255, 255, 255];
        let plan = ViewPlan {
            input: layout(MultiviewMode::FrameByFrame, 2, 2),
            output: layout(MultiviewMode::Mono, 2, 2),
            downmix: DownmixMode::GreenMagentaDubois,
        };
        let out =
            convert_images(&[solid(2, 2, white), solid(2, 2, [0, 0, 0, 255])], &plan).unwrap();
        let pixel = out[0].get(0, 0);
        // Left view only: red row sums to -0.259 (clamped), green to 1.095 (clamped).
        assert_eq!(pixel[0], 0);
        assert_eq!(pixel[1], 255);
        // Blue: -0.015 - 0.027 + 0.021 = -0.021, clamped.
        assert_eq!(pixel[2], 0);
    }

    #[test]
    fn flipped_left_view_is_restored() {
        let mut input = layout(MultiviewMode::TopBottom, 2, 4);
        input.flags = MultiviewFlags::LEFT_FLIPPED;
        let source = Image::map(2, 4, |_, y| if y == 0 { BLUE } else { RED });
        let plan = ViewPlan {
            input,
            output: layout(MultiviewMode::Left, 2, 2),
            downmix: DownmixMode::default(),
        };
        let out = convert_images(&[source], &plan).unwrap();
        assert_eq!(out[0].get(0, 1), BLUE);
        assert_eq!(out[0].get(0, 0), RED);
    }
}
