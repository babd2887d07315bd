//! Handlers that run on the GPU execution thread.

use tracing::{debug, trace};

use crate::display::WeakContext;
use crate::geometry::Resizer;
use crate::gpu::{GpuDevice, GpuError};
use crate::redisplay::QuadRenderer;
use crate::window::{KeyAction, MouseAction};

use super::state::{NavigationEvent, Sample, SinkShared};

pub(crate) const WINDOW_CLOSED: &str = "Output window was closed";

impl SinkShared {
    /// Builds the redisplay quad if it does not exist yet.
    pub(crate) fn init_redisplay(&self, device: &mut dyn GpuDevice) -> Result<(), GpuError> {
        let mut renderer = self.renderer();
        if renderer.is_none() {
            *renderer = Some(QuadRenderer::new(device)?);
        }
        self.set_redisplay_ready(true);
        Ok(())
    }

    pub(crate) fn cleanup_redisplay(&self, device: &mut dyn GpuDevice) {
        let renderer = self.renderer().take();
        if let Some(renderer) = renderer {
            renderer.destroy(device);
        }
        self.set_redisplay_ready(false);
    }

    pub(crate) fn on_resize(&self, device: &mut dyn GpuDevice, width: u32, height: u32) {
        self.do_resize(device, width, height);
    }

    /// Recomputes the display rectangle unless the client reshape handler
    /// claims the resize.
    fn do_resize(&self, device: &mut dyn GpuDevice, width: u32, height: u32) {
        let reshape = self.draw().client_reshape.clone();
        let handled = reshape.is_some_and(|reshape| reshape(device, width, height));

        let mut draw = self.draw();
        draw.geometry.set_window_size(width, height);
        if handled {
            trace!(width, height, "client handled reshape");
            return;
        }
        let resizer = Resizer::new(
            draw.settings.force_aspect_ratio,
            draw.settings.pixel_aspect_ratio,
        );
        let video_size = draw.video_size;
        let rect = resizer.fit(video_size, (width.max(1), height.max(1)));
        let resized = draw.geometry.set_display_rect(rect);
        if resized && draw.converting {
            draw.output_mode_changed = true;
        }
        debug!(
            window_width = width,
            window_height = height,
            video_width = video_size.0,
            video_height = video_size.1,
            rect = %rect,
            "display rectangle"
        );
    }

    /// Promotes the pending frame and draws the stored one.
    pub(crate) fn on_draw(&self, device: &mut dyn GpuDevice) {
        let (promotion, slot, relayout) = {
            let mut draw = self.draw();
            let promotion = draw.exchange.promote();
            let slot = draw.exchange.stored();
            let relayout = if slot.is_some() && std::mem::take(&mut draw.caps_change) {
                draw.geometry.window_size()
            } else {
                None
            };
            (promotion, slot, relayout)
        };
        drop(promotion);

        let Some(slot) = slot else {
            trace!("nothing to draw");
            return;
        };
        if let Some((width, height)) = relayout {
            self.do_resize(device, width, height);
        }

        let (viewport, info, ignore_alpha, client_draw) = {
            let mut draw = self.draw();
            (
                draw.geometry.take_viewport_update(),
                draw.out_info,
                draw.settings.ignore_alpha,
                draw.client_draw.clone(),
            )
        };
        if let Some(rect) = viewport {
            device.set_viewport(rect);
        }
        if let Some(sync) = &slot.sync {
            sync.wait(device);
        }

        let mut handled = false;
        if let (Some(client_draw), Some(info)) = (client_draw, info) {
            for frame in slot.frames() {
                let sample = Sample {
                    frame: frame.clone(),
                    texture: frame.texture().unwrap_or(slot.texture),
                    info,
                };
                handled |= client_draw(device, &sample);
            }
        }
        if !handled {
            if let Some(renderer) = self.renderer().as_ref() {
                renderer.draw(device, slot.texture, ignore_alpha);
            }
        }
        trace!(texture = %slot.texture, client = handled, "drew frame");
    }

    /// Marks the sink for termination and stops input forwarding.
    pub(crate) fn on_close(&self, context: &WeakContext) {
        if let Some(context) = context.upgrade() {
            context.set_error(WINDOW_CLOSED);
            let window = context.window();
            window.set_key_callback(None);
            window.set_mouse_callback(None);
        }
        self.set_to_quit(true);
        debug!("output window closed");
    }

    pub(crate) fn on_key(&self, action: KeyAction, key: &str) {
        debug!(?action, key, "key event");
        let navigation = self.draw().navigation.clone();
        if let Some(navigation) = navigation {
            navigation(NavigationEvent::Key {
                action,
                key: key.to_string(),
            });
        }
    }

    /// Forwards a pointer event, mapping window coordinates into the video.
    pub(crate) fn on_mouse(&self, action: MouseAction, button: u32, x: f64, y: f64) {
        debug!(?action, button, x, y, "mouse event");
        let (navigation, rect, video) = {
            let draw = self.draw();
            (
                draw.navigation.clone(),
                draw.geometry.display_rect,
                draw.out_info.map(|info| (info.width, info.height)),
            )
        };
        let Some(navigation) = navigation else {
            return;
        };
        let (x, y) = match video {
            Some((width, height)) if !rect.is_empty() => (
                (x - f64::from(rect.x)) * f64::from(width) / f64::from(rect.w),
                (y - f64::from(rect.y)) * f64::from(height) / f64::from(rect.h),
            ),
            _ => (x, y),
        };
        navigation(NavigationEvent::Mouse {
            action,
            button,
            x,
            y,
        });
    }
}
