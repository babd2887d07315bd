//! Displays own a device factory; contexts own an execution thread and its window.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::debug;

use crate::gpu::{DeviceCaps, DeviceFactory, GpuApi, GpuDevice, GpuError, GpuHandle, GpuThread};
use crate::window::Window;

struct DisplayInner {
    factory: Arc<dyn DeviceFactory>,
    api: Mutex<GpuApi>,
    contexts: Mutex<Vec<Weak<ContextInner>>>,
    next_context: AtomicU64,
}

/// Connection to a graphics system.
#[derive(Clone)]
pub struct GpuDisplay {
    inner: Arc<DisplayInner>,
}

impl GpuDisplay {
    /// Starts with the APIs `factory` reports; `filter_api` narrows them further.
    pub fn new(factory: Arc<dyn DeviceFactory>) -> Self {
        let api = factory.supported_apis();
        Self {
            inner: Arc::new(DisplayInner {
                factory,
                api: Mutex::new(api),
                contexts: Mutex::new(Vec::new()),
                next_context: AtomicU64::new(1),
            }),
        }
    }

    fn api_lock(&self) -> MutexGuard<'_, GpuApi> {
        self.inner.api.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn contexts_lock(&self) -> MutexGuard<'_, Vec<Weak<ContextInner>>> {
        self.inner
            .contexts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Restricts future contexts to `api`.
    pub fn filter_api(&self, api: GpuApi) {
        let mut current = self.api_lock();
        *current &= api;
        debug!(api = ?*current, "display API filter");
    }

    pub fn api(&self) -> GpuApi {
        *self.api_lock()
    }

    pub fn factory_name(&self) -> String {
        self.inner.factory.name().to_string()
    }

    pub fn same_display(&self, other: &GpuDisplay) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Spawns a context with its own execution thread and window.
    pub fn create_context(&self, shared: Option<&GpuContext>) -> Result<GpuContext, GpuError> {
        let api = self.api();
        if api.is_empty() {
            return Err(GpuError::UnsupportedApi(api));
        }
        let id = self.inner.next_context.fetch_add(1, Ordering::Relaxed);
        let thread = GpuThread::spawn(
            &format!("vrsink-gl-{id}"),
            Arc::clone(&self.inner.factory),
            api,
        )?;
        let window = Window::new(thread.handle().clone());
        let context = GpuContext {
            inner: Arc::new(ContextInner {
                id,
                handle: thread.handle().clone(),
                caps: thread.caps().clone(),
                shared_with: shared.map(GpuContext::id),
                window,
                error: Mutex::new(None),
                thread: Mutex::new(Some(thread)),
            }),
        };
        debug!(
            context = id,
            shared_with = ?context.inner.shared_with,
            api = ?context.inner.caps.api,
            "created GPU context"
        );
        Ok(context)
    }

    /// Registers `context` with this display. Returns false if it is already known.
    pub fn add_context(&self, context: &GpuContext) -> bool {
        let mut contexts = self.contexts_lock();
        contexts.retain(|weak| weak.strong_count() > 0);
        let known = contexts
            .iter()
            .any(|weak| weak.upgrade().is_some_and(|inner| inner.id == context.id()));
        if !known {
            contexts.push(Arc::downgrade(&context.inner));
        }
        !known
    }

    /// Live contexts registered with this display.
    pub fn contexts(&self) -> Vec<GpuContext> {
        self.contexts_lock()
            .iter()
            .filter_map(Weak::upgrade)
            .map(|inner| GpuContext { inner })
            .collect()
    }
}

impl fmt::Debug for GpuDisplay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuDisplay")
            .field("factory", &self.inner.factory.name())
            .field("api", &self.api())
            .finish()
    }
}

struct ContextInner {
    id: u64,
    handle: GpuHandle,
    caps: DeviceCaps,
    shared_with: Option<u64>,
    window: Window,
    error: Mutex<Option<String>>,
    thread: Mutex<Option<GpuThread>>,
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        self.window.clear_callbacks();
        let thread = self
            .thread
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(thread) = thread {
            thread.shutdown();
        }
        debug!(context = self.id, "destroyed GPU context");
    }
}

/// Handle to a GPU context: an execution thread, its device and its window.
///
/// The thread stops once the last handle is dropped.
#[derive(Clone)]
pub struct GpuContext {
    inner: Arc<ContextInner>,
}

impl GpuContext {
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn caps(&self) -> &DeviceCaps {
        &self.inner.caps
    }

    pub fn api(&self) -> GpuApi {
        self.inner.caps.api
    }

    /// Whether the context was created sharing objects with another one.
    pub fn shared_with(&self) -> Option<u64> {
        self.inner.shared_with
    }

    pub fn window(&self) -> &Window {
        &self.inner.window
    }

    pub fn handle(&self) -> &GpuHandle {
        &self.inner.handle
    }

    pub fn post_sync<F, R>(&self, task: F) -> Result<R, GpuError>
    where
        F: FnOnce(&mut dyn GpuDevice) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.inner.handle.post_sync(task)
    }

    pub fn post_async<F>(&self, task: F) -> Result<(), GpuError>
    where
        F: FnOnce(&mut dyn GpuDevice) + Send + 'static,
    {
        self.inner.handle.post_async(task)
    }

    /// Records a sticky error message, readable from any thread.
    pub fn set_error(&self, message: impl Into<String>) {
        *self
            .inner
            .error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(message.into());
    }

    pub fn error(&self) -> Option<String> {
        self.inner
            .error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn same_context(&self, other: &GpuContext) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Handle that does not keep the context alive; used by window callbacks.
    pub(crate) fn downgrade(&self) -> WeakContext {
        WeakContext {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

#[derive(Clone)]
pub(crate) struct WeakContext {
    inner: Weak<ContextInner>,
}

impl WeakContext {
    pub(crate) fn upgrade(&self) -> Option<GpuContext> {
        self.inner.upgrade().map(|inner| GpuContext { inner })
    }
}

impl fmt::Debug for GpuContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuContext")
            .field("id", &self.inner.id)
            .field("api", &self.inner.caps.api)
            .field("running", &self.inner.handle.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::HeadlessDeviceFactory;

    #[test]
    fn filtered_display_rejects_unsupported_devices() {
        let display = GpuDisplay::new(Arc::new(
            HeadlessDeviceFactory::new().with_api(GpuApi::VULKAN),
        ));
        display.filter_api(GpuApi::SINK_SUPPORTED);
        assert!(matches!(
            display.create_context(None),
            Err(GpuError::UnsupportedApi(_))
        ));
    }

    #[test]
    fn display_starts_from_the_factory_apis() {
        let display = GpuDisplay::new(Arc::new(
            HeadlessDeviceFactory::new().with_api(GpuApi::VULKAN | GpuApi::GLES2),
        ));
        assert_eq!(display.api(), GpuApi::VULKAN | GpuApi::GLES2);
        display.filter_api(GpuApi::SINK_SUPPORTED);
        assert_eq!(display.api(), GpuApi::GLES2);

        let vulkan_only = GpuDisplay::new(Arc::new(
            HeadlessDeviceFactory::new().with_api(GpuApi::VULKAN),
        ));
        vulkan_only.filter_api(GpuApi::SINK_SUPPORTED);
        assert!(vulkan_only.api().is_empty());
    }

    #[test]
    fn contexts_register_once_and_expire() {
        let display = GpuDisplay::new(Arc::new(HeadlessDeviceFactory::new()));
        let context = display.create_context(None).unwrap();
        assert!(display.add_context(&context));
        assert!(!display.add_context(&context));
        assert_eq!(display.contexts().len(), 1);
        drop(context);
        assert!(display.contexts().is_empty());
    }

    #[test]
    fn shared_context_remembers_its_peer() {
        let display = GpuDisplay::new(Arc::new(HeadlessDeviceFactory::new()));
        let first = display.create_context(None).unwrap();
        let second = display.create_context(Some(&first)).unwrap();
        assert_eq!(second.shared_with(), Some(first.id()));
        assert_ne!(first.id(), second.id());
    }

    #[test]
    fn error_message_is_sticky() {
        let display = GpuDisplay::new(Arc::new(HeadlessDeviceFactory::new()));
        let context = display.create_context(None).unwrap();
        assert_eq!(context.error(), None);
        context.set_error("Output window was closed");
        assert_eq!(context.error().as_deref(), Some("Output window was closed"));
    }

    #[test]
    fn dropping_the_last_handle_stops_the_thread() {
        let factory = HeadlessDeviceFactory::new();
        let probe = factory.probe();
        let display = GpuDisplay::new(Arc::new(factory));
        let context = display.create_context(None).unwrap();
        let handle = context.handle().clone();
        assert!(handle.is_running());
        drop(context);
        assert!(!handle.is_running());
        assert_eq!(probe.snapshot().devices_alive, 0);
    }
}
