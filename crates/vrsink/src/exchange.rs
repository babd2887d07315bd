//! Two-slot hand-off between the producer and the GPU thread.
//!
//! The producer writes `next`; the draw path promotes `next` to `stored` and
//! samples `stored`. Only the newest undrawn frame survives. References that
//! leave a slot are always released after the lock is dropped, because a
//! release may run arbitrary pool code that re-enters the exchange.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::frame::VideoFrame;
use crate::gpu::{SyncFence, TextureId};

/// A displayable frame: its resolved texture, the frame(s) keeping that
/// texture alive and the fence guarding it.
#[derive(Debug, Clone)]
pub struct DisplaySlot {
    pub texture: TextureId,
    pub primary: VideoFrame,
    /// Second view of a frame-by-frame output. The default quad draws only
    /// `texture`; client draw handlers see this view through `frames()`.
    pub secondary: Option<VideoFrame>,
    pub sync: Option<Arc<SyncFence>>,
}

impl DisplaySlot {
    pub fn new(texture: TextureId, primary: VideoFrame) -> Self {
        Self {
            texture,
            primary,
            secondary: None,
            sync: None,
        }
    }

    pub fn with_secondary(mut self, secondary: Option<VideoFrame>) -> Self {
        self.secondary = secondary;
        self
    }

    pub fn with_sync(mut self, sync: Option<SyncFence>) -> Self {
        self.sync = sync.map(Arc::new);
        self
    }

    /// Frames of the slot in draw order.
    pub fn frames(&self) -> impl Iterator<Item = &VideoFrame> {
        std::iter::once(&self.primary).chain(self.secondary.as_ref())
    }
}

/// Outcome of promoting `next` to `stored`.
#[must_use = "released slots must be dropped after the exchange lock is released"]
#[derive(Debug, Default)]
pub struct Promotion {
    pub promoted: bool,
    pub released: Option<DisplaySlot>,
}

/// The unlocked slot pair.
///
/// Every method that removes a slot hands it back so the caller can drop it
/// once its own lock is gone. [`FrameExchange`] wraps this in a mutex; the
/// sink keeps it inside its draw state instead.
#[derive(Debug, Default)]
pub struct ExchangeSlots {
    next: Option<DisplaySlot>,
    stored: Option<DisplaySlot>,
}

impl ExchangeSlots {
    /// Replaces the pending frame and returns the one it superseded.
    #[must_use = "the superseded slot must be dropped after unlocking"]
    pub fn replace_next(&mut self, slot: DisplaySlot) -> Option<DisplaySlot> {
        self.next.replace(slot)
    }

    /// Moves `next` into `stored`, handing back the previous `stored`.
    pub fn promote(&mut self) -> Promotion {
        match self.next.take() {
            Some(next) => Promotion {
                promoted: true,
                released: self.stored.replace(next),
            },
            None => Promotion::default(),
        }
    }

    pub fn stored(&self) -> Option<DisplaySlot> {
        self.stored.clone()
    }

    pub fn has_next(&self) -> bool {
        self.next.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.next.is_none() && self.stored.is_none()
    }

    /// Empties both slots.
    #[must_use = "cleared slots must be dropped after unlocking"]
    pub fn take_all(&mut self) -> [Option<DisplaySlot>; 2] {
        [self.next.take(), self.stored.take()]
    }
}

/// Thread-safe [`ExchangeSlots`].
#[derive(Debug, Default)]
pub struct FrameExchange {
    slots: Mutex<ExchangeSlots>,
}

impl FrameExchange {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ExchangeSlots> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Publishes `slot` as the next frame to draw.
    ///
    /// Returns true when an undrawn frame was superseded.
    pub fn submit(&self, slot: DisplaySlot) -> bool {
        let superseded = {
            let mut slots = self.lock();
            slots.replace_next(slot)
        };
        let stale = superseded.is_some();
        drop(superseded);
        stale
    }

    /// Returns true when a new frame became the stored one.
    pub fn promote_next_to_stored(&self) -> bool {
        let promotion = {
            let mut slots = self.lock();
            slots.promote()
        };
        let promoted = promotion.promoted;
        drop(promotion);
        promoted
    }

    /// Clone of the stored slot, which stays valid after later promotions.
    pub fn current_stored(&self) -> Option<DisplaySlot> {
        self.lock().stored()
    }

    pub fn clear(&self) {
        let cleared = {
            let mut slots = self.lock();
            slots.take_all()
        };
        drop(cleared);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameMeta;

    fn slot(texture: u32) -> DisplaySlot {
        let frame = VideoFrame::from_pixels(1, 1, vec![0; 4], FrameMeta::default()).unwrap();
        DisplaySlot::new(TextureId(texture), frame)
    }

    #[test]
    fn newest_submission_wins() {
        let exchange = FrameExchange::new();
        assert!(!exchange.submit(slot(1)));
        assert!(exchange.submit(slot(2)));
        assert!(exchange.promote_next_to_stored());
        assert_eq!(exchange.current_stored().unwrap().texture, TextureId(2));
    }

    #[test]
    fn promotion_without_next_keeps_stored() {
        let exchange = FrameExchange::new();
        assert!(!exchange.promote_next_to_stored());
        exchange.submit(slot(5));
        assert!(exchange.promote_next_to_stored());
        assert!(!exchange.promote_next_to_stored());
        assert_eq!(exchange.current_stored().unwrap().texture, TextureId(5));
    }

    #[test]
    fn stored_clone_survives_replacement() {
        let exchange = FrameExchange::new();
        exchange.submit(slot(1));
        exchange.promote_next_to_stored();
        let held = exchange.current_stored().unwrap();
        exchange.submit(slot(2));
        exchange.promote_next_to_stored();
        assert_eq!(held.texture, TextureId(1));
        assert_eq!(held.primary.width(), 1);
    }

    #[test]
    fn clear_empties_both_slots() {
        let exchange = FrameExchange::new();
        exchange.submit(slot(1));
        exchange.promote_next_to_stored();
        exchange.submit(slot(2));
        exchange.clear();
        assert!(exchange.current_stored().is_none());
        assert!(!exchange.promote_next_to_stored());
    }

    #[test]
    fn slot_frames_list_primary_then_secondary() {
        let secondary = VideoFrame::from_pixels(1, 1, vec![1; 4], FrameMeta::default()).unwrap();
        let slot = slot(3).with_secondary(Some(secondary.clone()));
        let frames: Vec<_> = slot.frames().collect();
        assert_eq!(frames.len(), 2);
        assert!(VideoFrame::ptr_eq(frames[1], &secondary));
    }
}
