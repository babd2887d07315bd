//! Reference-counted video frames and the buffer pool that recycles them.
//!
//! A [`VideoFrame`] carries either CPU pixels that are uploaded on first use
//! or a texture produced on the GPU thread. Dropping the last reference
//! either hands the storage back to its [`FramePool`] or deletes the texture
//! on the thread that created it.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use bitflags::bitflags;
use tracing::trace;

use crate::gpu::{GpuDevice, GpuError, GpuHandle, TextureId};
use crate::types::{DisplayInfo, PixelFormat};

bitflags! {
    /// Per-frame stream markers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FrameFlags: u32 {
        /// Data before this frame was lost or skipped.
        const DISCONT = 1 << 0;
        /// First frame of a frame-by-frame view bundle.
        const FIRST_IN_BUNDLE = 1 << 1;
    }
}

/// Which view a frame carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ViewRole {
    /// Unlabelled; frame-by-frame streams fall back to [`FrameFlags::FIRST_IN_BUNDLE`].
    #[default]
    None,
    Mono,
    Left,
    Right,
}

/// Timing and labelling attached to a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameMeta {
    pub role: ViewRole,
    pub flags: FrameFlags,
    pub pts: Option<Duration>,
    pub duration: Option<Duration>,
}

impl FrameMeta {
    pub fn at(pts: Duration) -> Self {
        Self {
            pts: Some(pts),
            ..Self::default()
        }
    }

    pub fn with_role(mut self, role: ViewRole) -> Self {
        self.role = role;
        self
    }

    pub fn with_flags(mut self, flags: FrameFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("pixel data of {got} bytes does not match the expected {expected} bytes")]
    SizeMismatch { expected: usize, got: usize },
    #[error("frames must use a packed format, got {0}")]
    UnsupportedFormat(PixelFormat),
    #[error("buffer pool exhausted ({max} buffers outstanding)")]
    PoolExhausted { max: usize },
}

struct TextureBinding {
    id: TextureId,
    handle: GpuHandle,
}

impl TextureBinding {
    fn release(self) {
        let id = self.id;
        if self
            .handle
            .post_async(move |device| device.delete_texture(id))
            .is_err()
        {
            trace!(texture = %id, "GPU thread gone; texture released with its device");
        }
    }
}

#[derive(Default)]
struct Storage {
    pixels: Option<Vec<u8>>,
    texture: Option<TextureBinding>,
    uploaded: bool,
}

impl Storage {
    fn with_pixels(pixels: Vec<u8>) -> Self {
        Self {
            pixels: Some(pixels),
            texture: None,
            uploaded: false,
        }
    }

    fn release(self) {
        if let Some(texture) = self.texture {
            texture.release();
        }
    }
}

struct FrameInner {
    width: u32,
    height: u32,
    format: PixelFormat,
    meta: FrameMeta,
    storage: Mutex<Storage>,
    pool: Weak<PoolInner>,
}

impl FrameInner {
    fn storage(&self) -> MutexGuard<'_, Storage> {
        self.storage
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for FrameInner {
    fn drop(&mut self) {
        let storage = std::mem::take(
            self.storage
                .get_mut()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        match self.pool.upgrade() {
            Some(pool) => pool.reclaim(storage),
            None => storage.release(),
        }
    }
}

/// Shared handle to one video frame.
///
/// Cloning is cheap; the storage is released when the last clone drops.
#[derive(Clone)]
pub struct VideoFrame {
    inner: Arc<FrameInner>,
}

impl VideoFrame {
    /// Wraps packed RGBA pixels. The texture is created lazily on the GPU thread.
    pub fn from_pixels(
        width: u32,
        height: u32,
        pixels: Vec<u8>,
        meta: FrameMeta,
    ) -> Result<Self, FrameError> {
        let expected = width as usize * height as usize * 4;
        if pixels.len() != expected {
            return Err(FrameError::SizeMismatch {
                expected,
                got: pixels.len(),
            });
        }
        Ok(Self::build(
            width,
            height,
            meta,
            Storage::with_pixels(pixels),
            Weak::new(),
        ))
    }

    /// Wraps a texture that already lives on the device behind `handle`.
    pub(crate) fn from_texture(
        width: u32,
        height: u32,
        texture: TextureId,
        handle: GpuHandle,
        meta: FrameMeta,
    ) -> Self {
        let storage = Storage {
            pixels: None,
            texture: Some(TextureBinding {
                id: texture,
                handle,
            }),
            uploaded: true,
        };
        Self::build(width, height, meta, storage, Weak::new())
    }

    fn build(
        width: u32,
        height: u32,
        meta: FrameMeta,
        storage: Storage,
        pool: Weak<PoolInner>,
    ) -> Self {
        Self {
            inner: Arc::new(FrameInner {
                width,
                height,
                format: PixelFormat::Rgba,
                meta,
                storage: Mutex::new(storage),
                pool,
            }),
        }
    }

    pub fn width(&self) -> u32 {
        self.inner.width
    }

    pub fn height(&self) -> u32 {
        self.inner.height
    }

    pub fn format(&self) -> PixelFormat {
        self.inner.format
    }

    pub fn meta(&self) -> FrameMeta {
        self.inner.meta
    }

    pub fn role(&self) -> ViewRole {
        self.inner.meta.role
    }

    pub fn flags(&self) -> FrameFlags {
        self.inner.meta.flags
    }

    pub fn pts(&self) -> Option<Duration> {
        self.inner.meta.pts
    }

    pub fn duration(&self) -> Option<Duration> {
        self.inner.meta.duration
    }

    pub fn is_discont(&self) -> bool {
        self.flags().contains(FrameFlags::DISCONT)
    }

    /// Texture holding this frame, once it has been resolved on the GPU thread.
    pub fn texture(&self) -> Option<TextureId> {
        let storage = self.inner.storage();
        storage
            .texture
            .as_ref()
            .filter(|_| storage.uploaded)
            .map(|binding| binding.id)
    }

    /// Resolves the frame's texture, creating and uploading it if needed.
    ///
    /// Must run on the GPU thread behind `handle`. A texture owned by another
    /// device (for example one recycled across a context teardown) is
    /// replaced.
    pub fn ensure_texture(
        &self,
        device: &mut dyn GpuDevice,
        handle: &GpuHandle,
    ) -> Result<TextureId, GpuError> {
        let mut storage = self.inner.storage();
        if let Some(binding) = storage.texture.take() {
            if binding.handle.same_thread(handle) {
                storage.texture = Some(binding);
            } else {
                binding.release();
                storage.uploaded = false;
            }
        }

        let id = match storage.texture.as_ref() {
            Some(binding) => binding.id,
            None => {
                let id = device.create_texture(self.inner.width, self.inner.height)?;
                storage.texture = Some(TextureBinding {
                    id,
                    handle: handle.clone(),
                });
                id
            }
        };
        if !storage.uploaded {
            let Some(pixels) = storage.pixels.as_deref() else {
                return Err(GpuError::Allocation {
                    what: "texture",
                    reason: "frame has neither pixels nor a texture".to_string(),
                });
            };
            device.upload_texture(id, pixels)?;
            storage.uploaded = true;
        }
        Ok(id)
    }

    /// Whether both handles refer to the same frame.
    pub fn ptr_eq(a: &VideoFrame, b: &VideoFrame) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }
}

impl fmt::Debug for VideoFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VideoFrame")
            .field("width", &self.inner.width)
            .field("height", &self.inner.height)
            .field("role", &self.inner.meta.role)
            .field("flags", &self.inner.meta.flags)
            .field("pts", &self.inner.meta.pts)
            .finish()
    }
}

type ReclaimHook = Arc<dyn Fn() + Send + Sync>;

struct PoolInner {
    info: DisplayInfo,
    frame_size: usize,
    min_buffers: usize,
    max_buffers: usize,
    free: Mutex<Vec<Storage>>,
    outstanding: AtomicUsize,
    on_reclaim: Mutex<Option<ReclaimHook>>,
}

impl PoolInner {
    fn free(&self) -> MutexGuard<'_, Vec<Storage>> {
        self.free.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn reclaim(&self, mut storage: Storage) {
        storage.uploaded = false;
        self.free().push(storage);
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        let hook = self
            .on_reclaim
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        if let Some(hook) = hook {
            hook();
        }
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        let free = std::mem::take(
            self.free
                .get_mut()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        free.into_iter().for_each(Storage::release);
    }
}

/// Recycling allocator for frames of one negotiated format.
#[derive(Clone)]
pub struct FramePool {
    inner: Arc<PoolInner>,
}

impl FramePool {
    /// Creates a pool with `min_buffers` preallocated entries. `max_buffers`
    /// of zero means unlimited.
    pub fn new(info: DisplayInfo, min_buffers: usize, max_buffers: usize) -> Result<Self, FrameError> {
        if info.format != PixelFormat::Rgba {
            return Err(FrameError::UnsupportedFormat(info.format));
        }
        let frame_size = info
            .frame_size()
            .ok_or(FrameError::UnsupportedFormat(info.format))?;
        let free = (0..min_buffers)
            .map(|_| Storage::with_pixels(vec![0; frame_size]))
            .collect();
        Ok(Self {
            inner: Arc::new(PoolInner {
                info,
                frame_size,
                min_buffers,
                max_buffers,
                free: Mutex::new(free),
                outstanding: AtomicUsize::new(0),
                on_reclaim: Mutex::new(None),
            }),
        })
    }

    pub fn info(&self) -> &DisplayInfo {
        &self.inner.info
    }

    pub fn min_buffers(&self) -> usize {
        self.inner.min_buffers
    }

    pub fn max_buffers(&self) -> usize {
        self.inner.max_buffers
    }

    /// Frames handed out and not yet returned.
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }

    /// Idle storage ready for reuse.
    pub fn available(&self) -> usize {
        self.inner.free().len()
    }

    /// Calls `hook` every time a frame returns to the pool, after the pool's
    /// own bookkeeping finished.
    pub fn set_reclaim_hook<F>(&self, hook: Option<F>)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self
            .inner
            .on_reclaim
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) =
            hook.map(|hook| Arc::new(hook) as ReclaimHook);
    }

    /// Takes a buffer from the pool and lets `fill` write its pixels.
    pub fn acquire<F>(&self, meta: FrameMeta, fill: F) -> Result<VideoFrame, FrameError>
    where
        F: FnOnce(&mut [u8]),
    {
        let max = self.inner.max_buffers;
        let reserved = self
            .inner
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (max == 0 || count < max).then_some(count + 1)
            });
        if reserved.is_err() {
            return Err(FrameError::PoolExhausted { max });
        }

        let mut storage = self
            .inner
            .free()
            .pop()
            .unwrap_or_else(|| Storage::with_pixels(vec![0; self.inner.frame_size]));
        let pixels = storage
            .pixels
            .get_or_insert_with(|| vec![0; self.inner.frame_size]);
        fill(pixels);
        storage.uploaded = false;

        Ok(VideoFrame::build(
            self.inner.info.width,
            self.inner.info.height,
            meta,
            storage,
            Arc::downgrade(&self.inner),
        ))
    }
}

impl fmt::Debug for FramePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FramePool")
            .field("width", &self.inner.info.width)
            .field("height", &self.inner.info.height)
            .field("min_buffers", &self.inner.min_buffers)
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn rejects_wrong_pixel_size() {
        let err = VideoFrame::from_pixels(2, 2, vec![0; 15], FrameMeta::default()).unwrap_err();
        assert_eq!(err, FrameError::SizeMismatch { expected: 16, got: 15 });
    }

    #[test]
    fn pool_recycles_storage() {
        let pool = FramePool::new(DisplayInfo::rgba(4, 4), 2, 0).unwrap();
        assert_eq!(pool.available(), 2);
        let frame = pool.acquire(FrameMeta::default(), |pixels| pixels.fill(9)).unwrap();
        assert_eq!(pool.outstanding(), 1);
        assert_eq!(pool.available(), 1);
        let clone = frame.clone();
        drop(frame);
        assert_eq!(pool.outstanding(), 1);
        drop(clone);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn bounded_pool_reports_exhaustion() {
        let pool = FramePool::new(DisplayInfo::rgba(2, 2), 0, 1).unwrap();
        let first = pool.acquire(FrameMeta::default(), |_| {}).unwrap();
        assert_eq!(
            pool.acquire(FrameMeta::default(), |_| {}).unwrap_err(),
            FrameError::PoolExhausted { max: 1 }
        );
        drop(first);
        assert!(pool.acquire(FrameMeta::default(), |_| {}).is_ok());
    }

    #[test]
    fn reclaim_hook_runs_once_per_return() {
        let pool = FramePool::new(DisplayInfo::rgba(2, 2), 0, 0).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        pool.set_reclaim_hook(Some(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        for _ in 0..3 {
            drop(pool.acquire(FrameMeta::default(), |_| {}).unwrap());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn frames_outliving_their_pool_are_released() {
        let pool = FramePool::new(DisplayInfo::rgba(2, 2), 1, 0).unwrap();
        let frame = pool.acquire(FrameMeta::default(), |_| {}).unwrap();
        drop(pool);
        assert_eq!(frame.width(), 2);
        drop(frame);
    }

    #[test]
    fn pool_rejects_planar_formats() {
        let info = DisplayInfo::new(PixelFormat::I420, 4, 4);
        assert_eq!(
            FramePool::new(info, 2, 0).unwrap_err(),
            FrameError::UnsupportedFormat(PixelFormat::I420)
        );
    }
}
