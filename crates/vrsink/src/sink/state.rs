use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::convert::ViewConverter;
use crate::display::{GpuContext, GpuDisplay};
use crate::exchange::ExchangeSlots;
use crate::frame::VideoFrame;
use crate::geometry::WindowGeometry;
use crate::gpu::{GpuDevice, TextureId};
use crate::redisplay::QuadRenderer;
use crate::types::{DisplayInfo, SinkSettings};
use crate::window::{KeyAction, MouseAction};

use super::State;

/// What the client draw handler gets to see for one view.
#[derive(Debug, Clone)]
pub struct Sample {
    pub frame: VideoFrame,
    pub texture: TextureId,
    pub info: DisplayInfo,
}

/// Input forwarded from the window, with pointer positions mapped into video
/// coordinates.
#[derive(Debug, Clone, PartialEq)]
pub enum NavigationEvent {
    Key {
        action: KeyAction,
        key: String,
    },
    Mouse {
        action: MouseAction,
        button: u32,
        x: f64,
        y: f64,
    },
}

/// Replaces the default quad draw for one view when it returns true.
pub type ClientDrawHandler = Arc<dyn Fn(&mut dyn GpuDevice, &Sample) -> bool + Send + Sync>;
/// Replaces the default viewport computation when it returns true.
pub type ClientReshapeHandler = Arc<dyn Fn(&mut dyn GpuDevice, u32, u32) -> bool + Send + Sync>;
pub type NavigationHandler = Arc<dyn Fn(NavigationEvent) + Send + Sync>;

/// Everything the draw path reads, guarded by the sink's exchange lock.
///
/// The lock is only held for field reads and slot swaps; frames that leave
/// `exchange` are dropped by the caller after unlocking.
pub(crate) struct DrawState {
    pub settings: SinkSettings,
    pub in_info: Option<DisplayInfo>,
    pub out_info: Option<DisplayInfo>,
    /// Aspect-corrected size of the displayed video.
    pub video_size: (u32, u32),
    pub geometry: WindowGeometry,
    pub exchange: ExchangeSlots,
    /// Sequence of the newest slot handed to `exchange`.
    pub published: u64,
    pub converting: bool,
    pub output_mode_changed: bool,
    pub caps_change: bool,
    pub client_draw: Option<ClientDrawHandler>,
    pub client_reshape: Option<ClientReshapeHandler>,
    pub navigation: Option<NavigationHandler>,
}

impl DrawState {
    pub fn new(settings: SinkSettings) -> Self {
        Self {
            settings,
            in_info: None,
            out_info: None,
            video_size: (0, 0),
            geometry: WindowGeometry::default(),
            exchange: ExchangeSlots::default(),
            published: 0,
            converting: false,
            output_mode_changed: false,
            caps_change: false,
            client_draw: None,
            client_reshape: None,
            navigation: None,
        }
    }
}

/// State reachable from the GPU thread's callbacks.
pub(crate) struct SinkShared {
    draw: Mutex<DrawState>,
    /// Only touched on the GPU thread.
    renderer: Mutex<Option<QuadRenderer>>,
    redisplay_ready: AtomicBool,
    to_quit: AtomicBool,
}

impl SinkShared {
    pub fn new(settings: SinkSettings) -> Self {
        Self {
            draw: Mutex::new(DrawState::new(settings)),
            renderer: Mutex::new(None),
            redisplay_ready: AtomicBool::new(false),
            to_quit: AtomicBool::new(false),
        }
    }

    pub fn draw(&self) -> MutexGuard<'_, DrawState> {
        self.draw.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn renderer(&self) -> MutexGuard<'_, Option<QuadRenderer>> {
        self.renderer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn redisplay_ready(&self) -> bool {
        self.redisplay_ready.load(Ordering::Acquire)
    }

    pub fn set_redisplay_ready(&self, ready: bool) {
        self.redisplay_ready.store(ready, Ordering::Release);
    }

    pub fn to_quit(&self) -> bool {
        self.to_quit.load(Ordering::Acquire)
    }

    pub fn set_to_quit(&self, quit: bool) {
        self.to_quit.store(quit, Ordering::Release);
    }
}

/// Producer-side state. Locked before, never inside, the draw lock, and never
/// held across a GPU post.
#[derive(Default)]
pub(crate) struct ProducerPath {
    pub converter: Option<ViewConverter>,
    /// Latest input per eye; index 1 is only used by frame-by-frame streams.
    pub inputs: [Option<VideoFrame>; 2],
    /// Eyes received since the last conversion.
    pub fresh: [bool; 2],
    /// Numbers each publish attempt so a slower one cannot replace a newer slot.
    pub sequence: u64,
}

impl ProducerPath {
    #[must_use = "released frames must be dropped after unlocking"]
    pub fn take_all(&mut self) -> (Option<ViewConverter>, [Option<VideoFrame>; 2]) {
        self.fresh = [false, false];
        (self.converter.take(), std::mem::take(&mut self.inputs))
    }
}

/// Application-side handles, changed by state transitions.
pub(crate) struct Element {
    pub state: State,
    pub display: Option<GpuDisplay>,
    pub other_context: Option<GpuContext>,
    pub context: Option<GpuContext>,
    /// Window handle applied to the current window.
    pub window_id: u64,
}

impl Default for Element {
    fn default() -> Self {
        Self {
            state: State::Null,
            display: None,
            other_context: None,
            context: None,
            window_id: 0,
        }
    }
}
