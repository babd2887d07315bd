//! Multiview conversion between transport layouts.
//!
//! [`ViewConverter`] accumulates input frames until a full view set is
//! available, runs the conversion on the GPU thread and queues the results
//! for [`ViewConverter::drain`].

use std::collections::VecDeque;

use tracing::{debug, trace};

use crate::display::GpuContext;
use crate::frame::{FrameFlags, FrameMeta, VideoFrame, ViewRole};
use crate::gpu::{GpuError, TextureId, ViewLayout, ViewPlan};
use crate::types::{DisplayInfo, DownmixMode, Fraction, MultiviewFlags, MultiviewMode};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConvertError {
    #[error("view converter used before it was configured")]
    NotConfigured,
    #[error(transparent)]
    Gpu(#[from] GpuError),
}

/// Whether frames described by `input` must pass through a converter to be
/// shown in `output_mode`.
pub fn needs_conversion(input: &DisplayInfo, output_mode: MultiviewMode) -> bool {
    !input.multiview_mode.is_mono() && output_mode != MultiviewMode::None
}

fn reduce(fraction: Fraction) -> Fraction {
    let (mut a, mut b) = (fraction.num, fraction.den);
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    if a <= 1 {
        fraction
    } else {
        Fraction::new(fraction.num / a, fraction.den / a)
    }
}

/// Description of `input` after conversion to `mode` with `flags`.
pub fn output_info_for(
    input: &DisplayInfo,
    mode: MultiviewMode,
    flags: MultiviewFlags,
) -> DisplayInfo {
    let (vw, vh) = ViewLayout::from_info(input).view_size();
    let mut par = if input.par.is_unset() {
        Fraction::ONE
    } else {
        input.par
    };

    if input.multiview_flags.contains(MultiviewFlags::HALF_ASPECT) {
        match input.multiview_mode {
            MultiviewMode::SideBySide
            | MultiviewMode::SideBySideQuincunx
            | MultiviewMode::ColumnInterleaved
            | MultiviewMode::Checkerboard => par.num = par.num.saturating_mul(2),
            MultiviewMode::TopBottom | MultiviewMode::RowInterleaved => {
                par.den = par.den.saturating_mul(2)
            }
            _ => {}
        }
    }

    let half = flags.contains(MultiviewFlags::HALF_ASPECT);
    let (width, height) = match mode {
        MultiviewMode::SideBySide
        | MultiviewMode::SideBySideQuincunx
        | MultiviewMode::ColumnInterleaved
        | MultiviewMode::Checkerboard => {
            if half {
                par.den = par.den.saturating_mul(2);
                (vw, vh)
            } else {
                (vw * 2, vh)
            }
        }
        MultiviewMode::TopBottom | MultiviewMode::RowInterleaved => {
            if half {
                par.num = par.num.saturating_mul(2);
                (vw, vh)
            } else {
                (vw, vh * 2)
            }
        }
        _ => (vw, vh),
    };

    let mut output = *input;
    output.width = width;
    output.height = height;
    output.par = reduce(par);
    output.multiview_mode = mode;
    output.multiview_flags = flags;
    output.views = mode.views();
    output
}

/// Index of the eye carried by a frame of a frame-by-frame stream: 0 left, 1 right.
///
/// Labelled frames win; unlabelled ones are placed by
/// [`FrameFlags::FIRST_IN_BUNDLE`], which marks the right eye when the stream
/// sends the right view first.
pub fn eye_index(frame: &VideoFrame, flags: MultiviewFlags) -> usize {
    match frame.role() {
        ViewRole::Left => 0,
        ViewRole::Right => 1,
        ViewRole::None | ViewRole::Mono => {
            let first_eye = usize::from(flags.contains(MultiviewFlags::RIGHT_VIEW_FIRST));
            if frame.flags().contains(FrameFlags::FIRST_IN_BUNDLE) {
                first_eye
            } else {
                1 - first_eye
            }
        }
    }
}

/// Stateful multiview converter bound to one GPU context.
///
/// Callers that hold a lock around the converter use [`ViewConverter::accept`]
/// under it, run the returned [`ConvertJob`] after unlocking and hand the
/// result back through [`ViewConverter::complete`]. [`ViewConverter::feed`]
/// does all three in one call.
pub struct ViewConverter {
    context: GpuContext,
    plan: Option<ViewPlan>,
    output: Option<DisplayInfo>,
    pending: [Option<VideoFrame>; 2],
    ready: VecDeque<VideoFrame>,
    /// Bumped whenever accumulated state is thrown away; jobs started under
    /// an older generation complete as stale.
    generation: u64,
}

/// Outcome of [`ViewConverter::accept`].
#[must_use = "discarded frames must be dropped after unlocking and the job run"]
#[derive(Debug, Default)]
pub struct Accepted {
    /// A full view set ready for conversion, if the input completed one.
    pub job: Option<ConvertJob>,
    /// Half pairs thrown away by a discontinuity.
    pub discarded: Vec<VideoFrame>,
}

/// One conversion, detached from the converter so it can run unlocked.
pub struct ConvertJob {
    context: GpuContext,
    inputs: Vec<VideoFrame>,
    plan: ViewPlan,
    generation: u64,
}

/// Converted frames of one [`ConvertJob`].
#[derive(Debug)]
pub struct ConvertedViews {
    frames: Vec<VideoFrame>,
    generation: u64,
}

impl ConvertedViews {
    /// Gives up the frames, for results that can no longer be queued.
    pub fn into_frames(self) -> Vec<VideoFrame> {
        self.frames
    }
}

impl ViewConverter {
    pub fn new(context: GpuContext) -> Self {
        Self {
            context,
            plan: None,
            output: None,
            pending: [None, None],
            ready: VecDeque::new(),
            generation: 0,
        }
    }

    pub fn context(&self) -> &GpuContext {
        &self.context
    }

    /// Sets the conversion. Frames accumulated under the old configuration
    /// are dropped.
    pub fn configure(&mut self, input: &DisplayInfo, output: &DisplayInfo, downmix: DownmixMode) {
        let plan = ViewPlan {
            input: ViewLayout::from_info(input),
            output: ViewLayout::from_info(output),
            downmix,
        };
        debug!(
            input = %plan.input.mode,
            output = %plan.output.mode,
            width = plan.output.width,
            height = plan.output.height,
            downmix = %downmix,
            "configured view converter"
        );
        self.plan = Some(plan);
        self.output = Some(*output);
        self.reset();
    }

    pub fn plan(&self) -> Option<&ViewPlan> {
        self.plan.as_ref()
    }

    pub fn output_info(&self) -> Option<&DisplayInfo> {
        self.output.as_ref()
    }

    /// Drops accumulated and converted frames, keeping the configuration.
    pub fn reset(&mut self) {
        drop(self.take_frames());
    }

    /// Removes accumulated and converted frames so the caller can release
    /// them outside its locks. Conversions still running complete as stale.
    #[must_use]
    pub fn take_frames(&mut self) -> Vec<VideoFrame> {
        self.generation += 1;
        let mut frames: Vec<VideoFrame> = self.pending.iter_mut().filter_map(Option::take).collect();
        frames.extend(self.ready.drain(..));
        frames
    }

    /// Accepts one input frame. `discont` discards a partially collected
    /// frame-by-frame pair first. No GPU work happens here.
    pub fn accept(&mut self, frame: VideoFrame, discont: bool) -> Result<Accepted, ConvertError> {
        let plan = self.plan.ok_or(ConvertError::NotConfigured)?;
        let mut accepted = Accepted::default();
        if discont && self.pending.iter().any(Option::is_some) {
            trace!("discontinuity; discarding partial view pair");
            accepted
                .discarded
                .extend(self.pending.iter_mut().filter_map(Option::take));
        }

        let inputs = if plan.input.mode.is_frame_by_frame() {
            let eye = eye_index(&frame, plan.input.flags);
            accepted.discarded.extend(self.pending[eye].replace(frame));
            if self.pending.iter().any(Option::is_none) {
                return Ok(accepted);
            }
            self.pending.iter_mut().filter_map(Option::take).collect()
        } else {
            vec![frame]
        };

        accepted.job = Some(ConvertJob {
            context: self.context.clone(),
            inputs,
            plan,
            generation: self.generation,
        });
        Ok(accepted)
    }

    /// Queues the result of a job. Results of a job started before the last
    /// reset are handed back for the caller to release.
    #[must_use]
    pub fn complete(&mut self, converted: ConvertedViews) -> Vec<VideoFrame> {
        if converted.generation != self.generation {
            trace!("dropping stale conversion");
            return converted.frames;
        }
        self.ready.extend(converted.frames);
        Vec::new()
    }

    /// Accepts one input frame and converts a completed view set right away.
    pub fn feed(&mut self, frame: VideoFrame, discont: bool) -> Result<(), ConvertError> {
        let accepted = self.accept(frame, discont)?;
        drop(accepted.discarded);
        if let Some(job) = accepted.job {
            let converted = job.run()?;
            drop(self.complete(converted));
        }
        Ok(())
    }

    /// Next converted frame, if one is ready.
    pub fn drain(&mut self) -> Option<VideoFrame> {
        self.ready.pop_front()
    }
}

impl ConvertJob {
    /// Runs the conversion on the GPU thread and waits for it to be
    /// submitted.
    pub fn run(self) -> Result<ConvertedViews, ConvertError> {
        let ConvertJob {
            context,
            inputs,
            plan,
            generation,
        } = self;
        let handle = context.handle().clone();
        let frames = inputs.clone();
        let task_handle = handle.clone();
        let converted = context.post_sync(
            move |device| -> Result<Vec<(TextureId, (u32, u32))>, GpuError> {
                let textures = frames
                    .iter()
                    .map(|frame| frame.ensure_texture(device, &task_handle))
                    .collect::<Result<Vec<_>, _>>()?;
                let outputs = device.convert_views(&textures, &plan)?;
                Ok(outputs
                    .into_iter()
                    .map(|texture| {
                        let size = device
                            .texture_size(texture)
                            .unwrap_or((plan.output.width, plan.output.height));
                        (texture, size)
                    })
                    .collect())
            },
        )??;

        let first = inputs
            .first()
            .map(VideoFrame::meta)
            .unwrap_or_default();
        let bundled = converted.len() > 1;
        let frames = converted
            .into_iter()
            .enumerate()
            .map(|(index, (texture, (width, height)))| {
                let mut meta = FrameMeta {
                    role: ViewRole::Mono,
                    flags: first.flags & FrameFlags::DISCONT,
                    pts: first.pts,
                    duration: first.duration,
                };
                if bundled {
                    meta.role = if index == 0 {
                        ViewRole::Left
                    } else {
                        ViewRole::Right
                    };
                    meta.flags = if index == 0 {
                        meta.flags | FrameFlags::FIRST_IN_BUNDLE
                    } else {
                        FrameFlags::empty()
                    };
                }
                VideoFrame::from_texture(width, height, texture, handle.clone(), meta)
            })
            .collect();
        Ok(ConvertedViews { frames, generation })
    }
}

impl std::fmt::Debug for ConvertJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConvertJob")
            .field("inputs", &self.inputs.len())
            .field("generation", &self.generation)
            .finish()
    }
}

impl std::fmt::Debug for ViewConverter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewConverter")
            .field("plan", &self.plan)
            .field("pending", &self.pending.iter().filter(|f| f.is_some()).count())
            .field("ready", &self.ready.len())
            .finish()
    }
}
