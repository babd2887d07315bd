//! The video sink: negotiation, the producer path, the state machine and
//! the wiring of window callbacks onto the GPU thread.
//!
//! Lock order is producer path, then element, then draw state. The GPU
//! thread takes the draw lock and, when a frame it releases re-enters
//! `prepare` through its pool, the producer lock too. No lock is held across
//! a synchronous GPU post, and frames are never released while any of the
//! three is held.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::convert::{
    eye_index, needs_conversion, output_info_for, ConvertError, ConvertJob, ConvertedViews,
    ViewConverter,
};
use crate::display::{GpuContext, GpuDisplay};
use crate::exchange::DisplaySlot;
use crate::frame::{FrameError, FramePool, VideoFrame};
use crate::geometry::{Rect, Resizer};
use crate::gpu::{DeviceFactory, GpuApi, GpuDevice, GpuError, SyncFence};
use crate::types::{
    DisplayInfo, DownmixMode, Fraction, MultiviewFlags, MultiviewMode, PixelFormat, SinkSettings,
};
use crate::window::{KeyCallback, MouseCallback, Window};

mod draw;
mod state;

pub use state::{
    ClientDrawHandler, ClientReshapeHandler, NavigationEvent, NavigationHandler, Sample,
};

use draw::WINDOW_CLOSED;
use state::{Element, ProducerPath, SinkShared};

/// Minimum buffers proposed upstream; the sink keeps the last frame for redraws.
const MIN_POOL_BUFFERS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum State {
    Null,
    Ready,
    Paused,
    Playing,
}

/// One step of the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateChange {
    NullToReady,
    ReadyToPaused,
    PausedToPlaying,
    PlayingToPaused,
    PausedToReady,
    ReadyToNull,
}

impl StateChange {
    pub fn from_state(self) -> State {
        match self {
            StateChange::NullToReady => State::Null,
            StateChange::ReadyToPaused | StateChange::ReadyToNull => State::Ready,
            StateChange::PausedToPlaying | StateChange::PausedToReady => State::Paused,
            StateChange::PlayingToPaused => State::Playing,
        }
    }

    pub fn to_state(self) -> State {
        match self {
            StateChange::ReadyToNull => State::Null,
            StateChange::NullToReady | StateChange::PausedToReady => State::Ready,
            StateChange::ReadyToPaused | StateChange::PlayingToPaused => State::Paused,
            StateChange::PausedToPlaying => State::Playing,
        }
    }

    /// The single step from `from` in the direction of `to`.
    pub fn toward(from: State, to: State) -> Option<Self> {
        let step = match (from, to) {
            (State::Null, target) if target > State::Null => StateChange::NullToReady,
            (State::Ready, target) if target > State::Ready => StateChange::ReadyToPaused,
            (State::Ready, State::Null) => StateChange::ReadyToNull,
            (State::Paused, State::Playing) => StateChange::PausedToPlaying,
            (State::Paused, target) if target < State::Paused => StateChange::PausedToReady,
            (State::Playing, target) if target < State::Playing => StateChange::PlayingToPaused,
            _ => return None,
        };
        Some(step)
    }
}

/// Error classes reported to the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Negotiation or settings problem; nothing changed.
    Configuration,
    /// A GPU, window or allocation resource failed, or the output window
    /// was closed; `SinkError::Terminated` marks the latter.
    Resource,
    /// The current frame could not be converted or uploaded.
    Flow,
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("invalid setting: {0}")]
    InvalidSetting(String),
    #[error("unsupported input format {0}; only RGBA can be displayed")]
    UnsupportedFormat(PixelFormat),
    #[error("invalid video size {width}x{height}")]
    InvalidSize { width: u32, height: u32 },
    #[error("could not calculate the display aspect ratio")]
    DisplayRatio,
    #[error("stream format has not been negotiated")]
    NotNegotiated,
    #[error("invalid state change from {from:?} to {to:?}")]
    InvalidStateChange { from: State, to: State },
    #[error("no GPU display; the sink must be READY first")]
    NoDisplay,
    #[error("failed to create GPU context: {0}")]
    Context(#[source] GpuError),
    #[error("failed to build the redisplay pass: {0}")]
    Redisplay(#[source] GpuError),
    #[error("failed to create buffer pool: {0}")]
    Pool(#[from] FrameError),
    #[error("failed to convert multiview video buffer: {0}")]
    Conversion(#[from] ConvertError),
    #[error("failed to upload video frame: {0}")]
    Upload(#[source] GpuError),
    #[error("output window is not running: {0}")]
    WindowNotRunning(String),
    /// The user closed the output window.
    #[error("{0}")]
    Terminated(String),
}

impl SinkError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SinkError::InvalidSetting(_)
            | SinkError::UnsupportedFormat(_)
            | SinkError::InvalidSize { .. }
            | SinkError::DisplayRatio
            | SinkError::NotNegotiated
            | SinkError::InvalidStateChange { .. } => ErrorKind::Configuration,
            SinkError::NoDisplay
            | SinkError::Context(_)
            | SinkError::Redisplay(_)
            | SinkError::Pool(_)
            | SinkError::WindowNotRunning(_)
            | SinkError::Terminated(_) => ErrorKind::Resource,
            SinkError::Conversion(ConvertError::Gpu(GpuError::ThreadGone))
            | SinkError::Upload(GpuError::ThreadGone) => ErrorKind::Resource,
            SinkError::Conversion(_) | SinkError::Upload(_) => ErrorKind::Flow,
        }
    }

    /// Whether the producer must stop.
    pub fn is_fatal(&self) -> bool {
        self.kind() != ErrorKind::Configuration
            || matches!(self, SinkError::NotNegotiated)
    }
}

/// Objects displaced while the producer lock was held; dropped after it is
/// released.
#[derive(Default)]
struct Released {
    converter: Option<ViewConverter>,
    frames: Vec<VideoFrame>,
    slots: Vec<DisplaySlot>,
}

impl Released {
    fn absorb(&mut self, other: Released) {
        if other.converter.is_some() {
            self.converter = other.converter;
        }
        self.frames.extend(other.frames);
        self.slots.extend(other.slots);
    }
}

/// What `publish_next` does with the inputs it picked.
enum Work {
    Direct(VideoFrame, Option<VideoFrame>),
    Convert(Vec<ConvertJob>),
}

/// Pool and metadata offered to a producer during allocation.
#[derive(Debug)]
pub struct AllocationProposal {
    pub pool: Option<FramePool>,
    pub min_buffers: usize,
    /// Whether frames may carry a sync fence (the device supports fences).
    pub sync_meta: bool,
}

/// Consumes decoded frames: `prepare` readies a frame, `show_frame` displays it.
pub trait FrameConsumer {
    fn prepare(&self, frame: &VideoFrame) -> Result<(), SinkError>;
    fn show_frame(&self, frame: &VideoFrame) -> Result<(), SinkError>;

    fn render(&self, frame: &VideoFrame) -> Result<(), SinkError> {
        self.prepare(frame)?;
        self.show_frame(frame)
    }
}

pub trait StateMachine {
    fn current_state(&self) -> State;
    fn change_state(&self, transition: StateChange) -> Result<(), SinkError>;

    /// Walks the state machine one step at a time until `target` is reached.
    fn set_state(&self, target: State) -> Result<(), SinkError> {
        while let Some(step) = StateChange::toward(self.current_state(), target) {
            self.change_state(step)?;
        }
        Ok(())
    }
}

pub trait GeometryProvider {
    fn display_rect(&self) -> Rect;
    fn window_size(&self) -> Option<(u32, u32)>;
    /// Aspect-corrected size of the negotiated video, `(0, 0)` before negotiation.
    fn video_size(&self) -> (u32, u32);
}

/// Stereo-capable video sink drawing through a GPU execution thread.
pub struct Sink {
    factory: Arc<dyn DeviceFactory>,
    shared: Arc<SinkShared>,
    producer: Mutex<ProducerPath>,
    element: Mutex<Element>,
    requested_window: AtomicU64,
}

impl Sink {
    pub fn new(factory: Arc<dyn DeviceFactory>) -> Self {
        Self {
            factory,
            shared: Arc::new(SinkShared::new(SinkSettings::default())),
            producer: Mutex::new(ProducerPath::default()),
            element: Mutex::new(Element::default()),
            requested_window: AtomicU64::new(0),
        }
    }

    /// Creates a sink and applies `settings` through the validated setters.
    pub fn with_settings(
        factory: Arc<dyn DeviceFactory>,
        settings: &SinkSettings,
    ) -> Result<Self, SinkError> {
        let sink = Self::new(factory);
        sink.apply_settings(settings)?;
        Ok(sink)
    }

    fn producer(&self) -> MutexGuard<'_, ProducerPath> {
        self.producer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn element(&self) -> MutexGuard<'_, Element> {
        self.element
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ---- settings -------------------------------------------------------

    pub fn settings(&self) -> SinkSettings {
        self.shared.draw().settings.clone()
    }

    pub fn apply_settings(&self, settings: &SinkSettings) -> Result<(), SinkError> {
        self.set_pixel_aspect_ratio(settings.pixel_aspect_ratio)?;
        if let Some(rect) = settings.render_rectangle {
            self.set_render_rectangle(rect)?;
        }
        self.set_force_aspect_ratio(settings.force_aspect_ratio);
        self.set_handle_events(settings.handle_events);
        self.set_ignore_alpha(settings.ignore_alpha);
        self.set_output_multiview_mode(settings.output_multiview_mode);
        self.set_output_multiview_flags(settings.output_multiview_flags);
        self.set_output_multiview_downmix(settings.output_multiview_downmix);
        Ok(())
    }

    pub fn set_force_aspect_ratio(&self, keep: bool) {
        let mut draw = self.shared.draw();
        draw.settings.force_aspect_ratio = keep;
        draw.caps_change = true;
    }

    /// Sets the device pixel aspect ratio; `0/1` means square pixels.
    pub fn set_pixel_aspect_ratio(&self, par: Fraction) -> Result<(), SinkError> {
        if par.den == 0 {
            return Err(SinkError::InvalidSetting(format!(
                "pixel-aspect-ratio {par} has a zero denominator"
            )));
        }
        let mut draw = self.shared.draw();
        draw.settings.pixel_aspect_ratio = par;
        draw.output_mode_changed = true;
        Ok(())
    }

    pub fn set_handle_events(&self, enabled: bool) {
        self.shared.draw().settings.handle_events = enabled;
        if let Some(context) = self.context() {
            context.window().handle_events(enabled);
        }
    }

    pub fn set_ignore_alpha(&self, ignore: bool) {
        self.shared.draw().settings.ignore_alpha = ignore;
    }

    pub fn set_output_multiview_mode(&self, mode: MultiviewMode) {
        let mut draw = self.shared.draw();
        draw.settings.output_multiview_mode = mode;
        draw.output_mode_changed = true;
    }

    pub fn set_output_multiview_flags(&self, flags: MultiviewFlags) {
        let mut draw = self.shared.draw();
        draw.settings.output_multiview_flags = flags;
        draw.output_mode_changed = true;
    }

    pub fn set_output_multiview_downmix(&self, downmix: DownmixMode) {
        let mut draw = self.shared.draw();
        draw.settings.output_multiview_downmix = downmix;
        draw.output_mode_changed = true;
    }

    /// Restricts output to part of the window.
    pub fn set_render_rectangle(&self, rect: Rect) -> Result<(), SinkError> {
        if rect.is_empty() {
            return Err(SinkError::InvalidSetting(format!(
                "render rectangle {rect} must have a positive size"
            )));
        }
        self.shared.draw().settings.render_rectangle = Some(rect);
        if let Some(context) = self.context() {
            if let Err(err) = context.window().set_render_rectangle(rect) {
                warn!(%err, "could not apply render rectangle");
            }
        }
        Ok(())
    }

    /// Requests rendering into a foreign window; zero selects an internal one.
    /// Applied on the next `prepare` or context setup.
    pub fn set_window_handle(&self, handle: u64) {
        self.requested_window.store(handle, Ordering::Release);
    }

    pub fn set_client_draw_handler(&self, handler: Option<ClientDrawHandler>) {
        self.shared.draw().client_draw = handler;
    }

    pub fn set_client_reshape_handler(&self, handler: Option<ClientReshapeHandler>) {
        self.shared.draw().client_reshape = handler;
    }

    pub fn set_navigation_handler(&self, handler: Option<NavigationHandler>) {
        self.shared.draw().navigation = handler;
    }

    /// Supplies the display instead of creating one on `Null -> Ready`.
    pub fn set_display(&self, display: GpuDisplay) {
        self.element().display = Some(display);
    }

    /// Application context whose objects the sink's context should share.
    pub fn set_shared_context(&self, context: Option<GpuContext>) {
        self.element().other_context = context;
    }

    // ---- queries --------------------------------------------------------

    pub fn context(&self) -> Option<GpuContext> {
        self.element().context.clone()
    }

    pub fn window(&self) -> Option<Window> {
        self.context().map(|context| context.window().clone())
    }

    pub fn display(&self) -> Option<GpuDisplay> {
        self.element().display.clone()
    }

    pub fn input_format(&self) -> Option<DisplayInfo> {
        self.shared.draw().in_info
    }

    /// Post-conversion format, reflecting the converter's output size and mode.
    pub fn output_format(&self) -> Option<DisplayInfo> {
        self.shared.draw().out_info
    }

    /// `(start, end)` display times of `frame`. Without a duration the end
    /// is one frame period after the start.
    pub fn frame_times(&self, frame: &VideoFrame) -> Option<(Duration, Option<Duration>)> {
        let start = frame.pts()?;
        let end = match frame.duration() {
            Some(duration) => Some(start + duration),
            None => {
                let fps = self
                    .output_format()
                    .map(|info| info.fps)
                    .filter(|fps| fps.num > 0 && fps.den > 0);
                fps.map(|fps| {
                    start + Duration::from_secs(u64::from(fps.den)) / fps.num
                })
            }
        };
        Some((start, end))
    }

    // ---- negotiation ----------------------------------------------------

    /// Accepts a new input format.
    pub fn set_caps(&self, info: &DisplayInfo) -> Result<(), SinkError> {
        if info.format != PixelFormat::Rgba {
            return Err(SinkError::UnsupportedFormat(info.format));
        }
        if info.width == 0 || info.height == 0 {
            return Err(SinkError::InvalidSize {
                width: info.width,
                height: info.height,
            });
        }
        let context = self.ensure_gl_setup()?;
        debug!(
            width = info.width,
            height = info.height,
            mode = %info.multiview_mode,
            par = %info.par,
            "new input caps"
        );

        let result = {
            let mut producer = self.producer();
            let previous = self.shared.draw().in_info.replace(*info);
            let result = self.update_output_format(&mut producer, &context);
            if result.is_err() {
                self.shared.draw().in_info = previous;
            }
            result
        };
        drop(result?);
        Ok(())
    }

    /// Recomputes the output format and the converter from the input format
    /// and the output settings. Returns what the old configuration held.
    fn update_output_format(
        &self,
        producer: &mut ProducerPath,
        context: &GpuContext,
    ) -> Result<Released, SinkError> {
        let plan = {
            let mut draw = self.shared.draw();
            let in_info = draw.in_info.ok_or(SinkError::NotNegotiated)?;
            let settings = &draw.settings;
            let mode = settings.output_multiview_mode;
            let converting = needs_conversion(&in_info, mode);
            let mut out_info = if converting {
                output_info_for(&in_info, mode, settings.output_multiview_flags)
            } else {
                in_info
            };
            let resizer = Resizer::new(settings.force_aspect_ratio, settings.pixel_aspect_ratio);
            let video_size = resizer
                .display_size_for(&out_info)
                .ok_or(SinkError::DisplayRatio)?;
            let downmix = settings.output_multiview_downmix;

            let rect = draw.geometry.display_rect;
            if converting && !rect.is_empty() {
                out_info.width = rect.w.max(1) as u32;
                out_info.height = rect.h.max(1) as u32;
            }
            debug!(
                converting,
                width = out_info.width,
                height = out_info.height,
                video_width = video_size.0,
                video_height = video_size.1,
                "output format"
            );

            draw.video_size = video_size;
            draw.out_info = Some(out_info);
            draw.converting = converting;
            draw.output_mode_changed = false;
            draw.caps_change = true;
            converting.then_some((in_info, out_info, downmix))
        };

        let mut released = Released::default();
        match plan {
            Some((in_info, out_info, downmix)) => {
                let converter = producer
                    .converter
                    .get_or_insert_with(|| ViewConverter::new(context.clone()));
                released.frames = converter.take_frames();
                converter.configure(&in_info, &out_info, downmix);
            }
            None => released.converter = producer.converter.take(),
        }
        Ok(released)
    }

    // ---- producer path --------------------------------------------------

    /// Runs the converter if needed and publishes the result as the next
    /// frame to draw. `force` re-publishes the kept inputs.
    ///
    /// Conversion and upload run with no lock held, so a frame released on
    /// either thread may re-enter `prepare` through its pool. On the GPU
    /// thread that nested upload fails with `GpuError::Reentrant`.
    fn publish_next(&self, context: &GpuContext, force: bool) -> Result<(), SinkError> {
        let mut released = Released::default();
        let result = self.publish_next_with(context, force, &mut released);
        drop(released);
        result
    }

    fn publish_next_with(
        &self,
        context: &GpuContext,
        force: bool,
        released: &mut Released,
    ) -> Result<(), SinkError> {
        let (in_info, out_info) = {
            let draw = self.shared.draw();
            match (draw.in_info, draw.out_info) {
                (Some(in_info), Some(out_info)) => (in_info, out_info),
                _ => return Err(SinkError::NotNegotiated),
            }
        };
        let frame_by_frame = in_info.multiview_mode.is_frame_by_frame();

        let (sequence, work) = {
            let mut producer = self.producer();
            let Some(first) = producer.inputs[0].clone() else {
                return Ok(());
            };
            let second = if frame_by_frame {
                let Some(second) = producer.inputs[1].clone() else {
                    return Ok(());
                };
                Some(second)
            } else {
                None
            };
            let views = if frame_by_frame { 2 } else { 1 };
            if !force && !producer.fresh[..views].iter().all(|fresh| *fresh) {
                trace!("waiting for new input");
                return Ok(());
            }
            producer.fresh = [false, false];
            producer.sequence += 1;
            let sequence = producer.sequence;

            let work = match producer.converter.as_mut() {
                Some(converter) => {
                    let mut jobs = Vec::new();
                    for frame in std::iter::once(first).chain(second) {
                        let discont = !force && frame.is_discont();
                        let accepted = converter.accept(frame, discont)?;
                        released.frames.extend(accepted.discarded);
                        jobs.extend(accepted.job);
                    }
                    Work::Convert(jobs)
                }
                None => Work::Direct(first, second),
            };
            (sequence, work)
        };

        let (next, next2) = match work {
            Work::Direct(first, second) => (first, second),
            Work::Convert(jobs) => {
                let results = jobs
                    .into_iter()
                    .map(ConvertJob::run)
                    .collect::<Result<Vec<_>, _>>()?;
                let mut producer = self.producer();
                let Some(converter) = producer.converter.as_mut() else {
                    released
                        .frames
                        .extend(results.into_iter().flat_map(ConvertedViews::into_frames));
                    return Ok(());
                };
                for converted in results {
                    released.frames.extend(converter.complete(converted));
                }
                let Some(next) = converter.drain() else {
                    return Ok(());
                };
                let next2 = if out_info.multiview_mode.is_frame_by_frame() {
                    converter.drain()
                } else {
                    None
                };
                while let Some(extra) = converter.drain() {
                    trace!(?extra, "dropping surplus converted frame");
                    released.frames.push(extra);
                }
                (next, next2)
            }
        };

        let handle = context.handle().clone();
        let primary = next.clone();
        let secondary = next2.clone();
        let (texture, fence) = context
            .post_sync(move |device| -> Result<_, GpuError> {
                let texture = primary.ensure_texture(device, &handle)?;
                if let Some(secondary) = &secondary {
                    secondary.ensure_texture(device, &handle)?;
                }
                Ok((texture, device.insert_fence()))
            })
            .and_then(|result| result)
            .map_err(SinkError::Upload)?;

        let sync = fence.map(|fence| SyncFence::new(fence, context.handle().clone()));
        let slot = DisplaySlot::new(texture, next)
            .with_secondary(next2)
            .with_sync(sync);
        let displaced = {
            let mut draw = self.shared.draw();
            if sequence < draw.published {
                trace!(sequence, "newer frame already published");
                Some(slot)
            } else {
                draw.published = sequence;
                draw.exchange.replace_next(slot)
            }
        };
        if let Some(displaced) = displaced {
            trace!("dropping undrawn frame");
            released.slots.push(displaced);
        }
        Ok(())
    }

    fn terminated_error(&self) -> SinkError {
        let message = self
            .context()
            .and_then(|context| context.error())
            .unwrap_or_else(|| WINDOW_CLOSED.to_string());
        SinkError::Terminated(message)
    }

    fn apply_window_handle(&self, context: &GpuContext) {
        let requested = self.requested_window.load(Ordering::Acquire);
        let mut element = self.element();
        if element.window_id != requested {
            context.window().set_window_handle(requested);
            element.window_id = requested;
        }
    }

    fn prepare_frame(&self, frame: &VideoFrame) -> Result<(), SinkError> {
        if self.shared.to_quit() {
            return Err(self.terminated_error());
        }
        let (width, height) = self.shared.draw().video_size;
        if width < 1 || height < 1 {
            return Err(SinkError::NotNegotiated);
        }
        let context = self.ensure_gl_setup()?;
        trace!(?frame, "prepare");

        let mut released = Released::default();
        let result = {
            let mut producer = self.producer();
            let (in_info, mode_changed) = {
                let draw = self.shared.draw();
                (draw.in_info, draw.output_mode_changed)
            };
            match in_info {
                None => Err(SinkError::NotNegotiated),
                Some(in_info) => {
                    let index = if in_info.multiview_mode.is_frame_by_frame() {
                        eye_index(frame, in_info.multiview_flags)
                    } else {
                        0
                    };
                    released.frames.extend(producer.inputs[index].replace(frame.clone()));
                    producer.fresh[index] = true;
                    if mode_changed {
                        self.update_output_format(&mut producer, &context)
                            .map(|old| released.absorb(old))
                    } else {
                        Ok(())
                    }
                }
            }
        };
        drop(released);
        result?;
        self.publish_next(&context, false)?;

        self.apply_window_handle(&context);
        Ok(())
    }

    fn ensure_redisplay(&self, context: &GpuContext) -> Result<(), SinkError> {
        let window = context.window();
        let skip_shader = {
            let has_client_draw = self.shared.draw().client_draw.is_some();
            has_client_draw && self.element().other_context.is_some()
        };
        if !self.shared.redisplay_ready() && !skip_shader {
            let shared = Arc::clone(&self.shared);
            window
                .send_message(move |device| shared.init_redisplay(device))
                .and_then(|result| result)
                .map_err(SinkError::Redisplay)?;
        }
        let (width, height) = self.shared.draw().video_size;
        window.set_preferred_size(width, height);
        window
            .show()
            .map_err(|err| SinkError::WindowNotRunning(err.to_string()))
    }

    fn show(&self) -> Result<(), SinkError> {
        let context = self
            .context()
            .ok_or_else(|| SinkError::WindowNotRunning("no GPU context".to_string()))?;
        let window = context.window().clone();

        if window.is_running() {
            self.ensure_redisplay(&context)?;

            if self.shared.draw().output_mode_changed {
                let mut released = Released::default();
                let reconfigured = {
                    let mut producer = self.producer();
                    if producer.inputs[0].is_some() {
                        self.update_output_format(&mut producer, &context)
                            .map(|old| released.absorb(old))
                            .map(|()| true)
                    } else {
                        Ok(false)
                    }
                };
                drop(released);
                let result = reconfigured.and_then(|reconvert| {
                    if reconvert {
                        self.publish_next(&context, true)
                    } else {
                        Ok(())
                    }
                });
                if let Err(err) = result {
                    warn!(%err, "failed to reconvert the last frame");
                }
            }

            let drawable = !self.shared.draw().exchange.is_empty();
            if drawable {
                if let Err(err) = window.draw() {
                    debug!(%err, "draw not queued");
                }
            }
        }

        if !window.is_running() {
            let reason = context
                .error()
                .unwrap_or_else(|| "window thread stopped".to_string());
            return Err(SinkError::WindowNotRunning(reason));
        }
        if self.shared.to_quit() {
            return Err(self.terminated_error());
        }
        Ok(())
    }

    /// Drops every pending, stored and accumulated frame.
    pub fn drain(&self) {
        let (pending, inputs) = {
            let mut producer = self.producer();
            producer.fresh = [false, false];
            let pending = producer
                .converter
                .as_mut()
                .map(ViewConverter::take_frames)
                .unwrap_or_default();
            (pending, std::mem::take(&mut producer.inputs))
        };
        let slots = {
            let mut draw = self.shared.draw();
            draw.exchange.take_all()
        };
        drop(pending);
        drop(inputs);
        drop(slots);
        debug!("drained");
    }

    /// Offers a pool for `info` and reports fence support.
    pub fn propose_allocation(
        &self,
        info: &DisplayInfo,
        need_pool: bool,
    ) -> Result<AllocationProposal, SinkError> {
        if info.format != PixelFormat::Rgba {
            return Err(SinkError::UnsupportedFormat(info.format));
        }
        let context = self.ensure_gl_setup()?;
        let pool = if need_pool {
            Some(FramePool::new(*info, MIN_POOL_BUFFERS, 0)?)
        } else {
            None
        };
        Ok(AllocationProposal {
            pool,
            min_buffers: MIN_POOL_BUFFERS,
            sync_meta: context.caps().fences,
        })
    }

    // ---- lifecycle ------------------------------------------------------

    /// Creates the context and wires the window on first use.
    fn ensure_gl_setup(&self) -> Result<GpuContext, SinkError> {
        let mut element = self.element();
        if let Some(context) = &element.context {
            return Ok(context.clone());
        }
        let display = element.display.clone().ok_or(SinkError::NoDisplay)?;
        let context = display
            .create_context(element.other_context.as_ref())
            .map_err(SinkError::Context)?;
        display.add_context(&context);

        let window = context.window();
        let requested = self.requested_window.load(Ordering::Acquire);
        if requested != element.window_id {
            window.set_window_handle(requested);
            element.window_id = requested;
        }
        let settings = self.settings();
        window.handle_events(settings.handle_events);
        if let Some(rect) = settings.render_rectangle {
            window
                .set_render_rectangle(rect)
                .map_err(SinkError::Context)?;
        }
        self.install_callbacks(&context);

        info!(context = context.id(), api = ?context.api(), "GPU context ready");
        element.context = Some(context.clone());
        Ok(context)
    }

    fn install_callbacks(&self, context: &GpuContext) {
        let window = context.window();

        let shared = Arc::clone(&self.shared);
        window.set_resize_callback(Some(Arc::new(move |device: &mut dyn GpuDevice, width, height| {
            shared.on_resize(device, width, height)
        })));

        let shared = Arc::clone(&self.shared);
        window.set_draw_callback(Some(Arc::new(move |device: &mut dyn GpuDevice| {
            shared.on_draw(device)
        })));

        let shared = Arc::clone(&self.shared);
        let weak = context.downgrade();
        window.set_close_callback(Some(Arc::new(move || shared.on_close(&weak))));

        let shared = Arc::clone(&self.shared);
        let key: KeyCallback = Arc::new(move |action, key: &str| shared.on_key(action, key));
        window.set_key_callback(Some(key));

        let shared = Arc::clone(&self.shared);
        let mouse: MouseCallback =
            Arc::new(move |action, button, x, y| shared.on_mouse(action, button, x, y));
        window.set_mouse_callback(Some(mouse));
    }

    /// Releases frames, GPU objects, callbacks and the context.
    fn teardown(&self) {
        let (converter, inputs) = self.producer().take_all();
        let slots = {
            let mut draw = self.shared.draw();
            draw.output_mode_changed = draw.in_info.is_some();
            draw.caps_change = false;
            draw.geometry = Default::default();
            draw.exchange.take_all()
        };
        drop(converter);
        drop(inputs);
        drop(slots);

        let context = {
            let mut element = self.element();
            element.window_id = 0;
            element.context.take()
        };
        if let Some(context) = context {
            let window = context.window().clone();
            let shared = Arc::clone(&self.shared);
            if let Err(err) = window.send_message(move |device| shared.cleanup_redisplay(device)) {
                warn!(%err, "GPU cleanup did not run");
                self.shared.set_redisplay_ready(false);
            }
            window.clear_callbacks();
            info!(context = context.id(), "releasing GPU context");
            drop(context);
        }
    }
}

impl FrameConsumer for Sink {
    fn prepare(&self, frame: &VideoFrame) -> Result<(), SinkError> {
        self.prepare_frame(frame)
    }

    fn show_frame(&self, _frame: &VideoFrame) -> Result<(), SinkError> {
        self.show()
    }
}

impl StateMachine for Sink {
    fn current_state(&self) -> State {
        self.element().state
    }

    fn change_state(&self, transition: StateChange) -> Result<(), SinkError> {
        let current = self.current_state();
        if transition.from_state() != current {
            return Err(SinkError::InvalidStateChange {
                from: current,
                to: transition.to_state(),
            });
        }

        match transition {
            StateChange::NullToReady => {
                let mut element = self.element();
                let display = element
                    .display
                    .get_or_insert_with(|| GpuDisplay::new(Arc::clone(&self.factory)));
                display.filter_api(GpuApi::SINK_SUPPORTED);
                if display.api().is_empty() {
                    return Err(SinkError::Context(GpuError::UnsupportedApi(
                        GpuApi::SINK_SUPPORTED,
                    )));
                }
            }
            StateChange::ReadyToPaused => {
                self.ensure_gl_setup()?;
                self.shared.set_to_quit(false);
            }
            StateChange::PausedToPlaying | StateChange::PlayingToPaused => {}
            StateChange::PausedToReady => self.teardown(),
            StateChange::ReadyToNull => {
                let (display, other) = {
                    let mut element = self.element();
                    (element.display.take(), element.other_context.take())
                };
                drop(display);
                drop(other);
            }
        }

        self.element().state = transition.to_state();
        info!(from = ?transition.from_state(), to = ?transition.to_state(), "state change");
        Ok(())
    }
}

impl GeometryProvider for Sink {
    fn display_rect(&self) -> Rect {
        self.shared.draw().geometry.display_rect
    }

    fn window_size(&self) -> Option<(u32, u32)> {
        self.shared.draw().geometry.window_size()
    }

    fn video_size(&self) -> (u32, u32) {
        self.shared.draw().video_size
    }
}

impl Drop for Sink {
    fn drop(&mut self) {
        if let Err(err) = self.set_state(State::Null) {
            warn!(%err, "sink dropped without a clean shutdown");
            self.teardown();
        }
    }
}

impl fmt::Debug for Sink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sink")
            .field("state", &self.current_state())
            .field("video_size", &self.video_size())
            .finish()
    }
}
