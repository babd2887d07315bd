//! Output window bound to a GPU execution thread.
//!
//! The window never calls back into its owner while holding its own locks:
//! callbacks are cloned out of the table and invoked on the GPU thread.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, trace};

use crate::geometry::Rect;
use crate::gpu::{GpuDevice, GpuError, GpuHandle};

pub type ResizeCallback = Arc<dyn Fn(&mut dyn GpuDevice, u32, u32) + Send + Sync>;
pub type DrawCallback = Arc<dyn Fn(&mut dyn GpuDevice) + Send + Sync>;
pub type CloseCallback = Arc<dyn Fn() + Send + Sync>;
pub type KeyCallback = Arc<dyn Fn(KeyAction, &str) + Send + Sync>;
pub type MouseCallback = Arc<dyn Fn(MouseAction, u32, f64, f64) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    Press,
    Release,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MouseAction {
    Press,
    Release,
    Move,
}

/// Events delivered by the windowing back-end.
#[derive(Debug, Clone, PartialEq)]
pub enum WindowEvent {
    Resized { width: u32, height: u32 },
    Exposed,
    CloseRequested,
    Key { action: KeyAction, key: String },
    Mouse { action: MouseAction, button: u32, x: f64, y: f64 },
}

#[derive(Default)]
struct Callbacks {
    resize: Option<ResizeCallback>,
    draw: Option<DrawCallback>,
    close: Option<CloseCallback>,
    key: Option<KeyCallback>,
    mouse: Option<MouseCallback>,
}

#[derive(Debug, Clone, Copy)]
struct WindowState {
    /// Foreign window to render into; zero means the window is our own.
    handle: u64,
    handle_events: bool,
    render_rectangle: Option<Rect>,
    preferred_size: (u32, u32),
    visible: bool,
    size: Option<(u32, u32)>,
}

impl Default for WindowState {
    fn default() -> Self {
        Self {
            handle: 0,
            handle_events: true,
            render_rectangle: None,
            preferred_size: (320, 240),
            visible: false,
            size: None,
        }
    }
}

struct WindowInner {
    gpu: GpuHandle,
    callbacks: Mutex<Callbacks>,
    state: Mutex<WindowState>,
}

impl WindowInner {
    fn callbacks(&self) -> MutexGuard<'_, Callbacks> {
        self.callbacks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn state(&self) -> MutexGuard<'_, WindowState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Cloneable handle to the window of a [`crate::GpuContext`].
#[derive(Clone)]
pub struct Window {
    inner: Arc<WindowInner>,
}

impl Window {
    pub(crate) fn new(gpu: GpuHandle) -> Self {
        Self {
            inner: Arc::new(WindowInner {
                gpu,
                callbacks: Mutex::new(Callbacks::default()),
                state: Mutex::new(WindowState::default()),
            }),
        }
    }

    /// Whether the window's execution thread still accepts work.
    pub fn is_running(&self) -> bool {
        self.inner.gpu.is_running()
    }

    pub fn set_resize_callback(&self, callback: Option<ResizeCallback>) {
        self.inner.callbacks().resize = callback;
    }

    pub fn set_draw_callback(&self, callback: Option<DrawCallback>) {
        self.inner.callbacks().draw = callback;
    }

    pub fn set_close_callback(&self, callback: Option<CloseCallback>) {
        self.inner.callbacks().close = callback;
    }

    pub fn set_key_callback(&self, callback: Option<KeyCallback>) {
        self.inner.callbacks().key = callback;
    }

    pub fn set_mouse_callback(&self, callback: Option<MouseCallback>) {
        self.inner.callbacks().mouse = callback;
    }

    /// Drops every registered callback.
    pub fn clear_callbacks(&self) {
        let previous = std::mem::take(&mut *self.inner.callbacks());
        drop(previous);
    }

    /// Runs `task` on the window's thread and waits for it.
    pub fn send_message<F, R>(&self, task: F) -> Result<R, GpuError>
    where
        F: FnOnce(&mut dyn GpuDevice) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.inner.gpu.post_sync(task)
    }

    /// Queues a redraw: the draw callback followed by a present.
    pub fn draw(&self) -> Result<(), GpuError> {
        let inner = Arc::clone(&self.inner);
        self.inner.gpu.post_async(move |device| {
            let callback = inner.callbacks().draw.clone();
            if let Some(callback) = callback {
                callback(device);
                device.present();
            }
        })
    }

    /// Feeds a back-end event into the window.
    pub fn dispatch(&self, event: WindowEvent) -> Result<(), GpuError> {
        trace!(?event, "window event");
        let inner = Arc::clone(&self.inner);
        match event {
            WindowEvent::Resized { width, height } => {
                self.inner.state().size = Some((width, height));
                self.inner.gpu.post_async(move |device| {
                    let callback = inner.callbacks().resize.clone();
                    if let Some(callback) = callback {
                        callback(device, width, height);
                    }
                })
            }
            WindowEvent::Exposed => self.draw(),
            WindowEvent::CloseRequested => self.inner.gpu.post_async(move |_| {
                let callback = inner.callbacks().close.clone();
                if let Some(callback) = callback {
                    callback();
                }
            }),
            WindowEvent::Key { action, key } => {
                if !self.inner.state().handle_events {
                    return Ok(());
                }
                self.inner.gpu.post_async(move |_| {
                    let callback = inner.callbacks().key.clone();
                    if let Some(callback) = callback {
                        callback(action, &key);
                    }
                })
            }
            WindowEvent::Mouse {
                action,
                button,
                x,
                y,
            } => {
                if !self.inner.state().handle_events {
                    return Ok(());
                }
                self.inner.gpu.post_async(move |_| {
                    let callback = inner.callbacks().mouse.clone();
                    if let Some(callback) = callback {
                        callback(action, button, x, y);
                    }
                })
            }
        }
    }

    /// Points the window at a foreign window; zero switches back to our own.
    pub fn set_window_handle(&self, handle: u64) {
        debug!(handle, "setting window handle");
        self.inner.state().handle = handle;
    }

    pub fn window_handle(&self) -> u64 {
        self.inner.state().handle
    }

    /// Enables or disables key and mouse forwarding.
    pub fn handle_events(&self, enabled: bool) {
        self.inner.state().handle_events = enabled;
    }

    /// Restricts drawing to `rect` of the window; a visible window is resized to it.
    pub fn set_render_rectangle(&self, rect: Rect) -> Result<(), GpuError> {
        let visible = {
            let mut state = self.inner.state();
            state.render_rectangle = Some(rect);
            state.visible
        };
        if visible {
            self.dispatch(WindowEvent::Resized {
                width: rect.w.max(1) as u32,
                height: rect.h.max(1) as u32,
            })?;
        }
        Ok(())
    }

    pub fn render_rectangle(&self) -> Option<Rect> {
        self.inner.state().render_rectangle
    }

    pub fn set_preferred_size(&self, width: u32, height: u32) {
        self.inner.state().preferred_size = (width.max(1), height.max(1));
    }

    /// Current window size, once the back-end reported one.
    pub fn size(&self) -> Option<(u32, u32)> {
        self.inner.state().size
    }

    pub fn is_visible(&self) -> bool {
        self.inner.state().visible
    }

    /// Maps the window. The first show reports the initial size through the
    /// resize callback.
    pub fn show(&self) -> Result<(), GpuError> {
        let initial = {
            let mut state = self.inner.state();
            if state.visible {
                None
            } else {
                state.visible = true;
                let size = match (state.render_rectangle, state.size) {
                    (Some(rect), _) => (rect.w.max(1) as u32, rect.h.max(1) as u32),
                    (None, Some(size)) => size,
                    (None, None) => state.preferred_size,
                };
                Some(size)
            }
        };
        if let Some((width, height)) = initial {
            debug!(width, height, "showing window");
            self.dispatch(WindowEvent::Resized { width, height })?;
        }
        Ok(())
    }
}

impl fmt::Debug for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Window")
            .field("state", &*self.inner.state())
            .finish()
    }
}
