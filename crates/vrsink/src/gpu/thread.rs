use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use tracing::{debug, error, warn};

use super::{DeviceCaps, DeviceFactory, GpuApi, GpuDevice, GpuError};

type Task = Box<dyn FnOnce(&mut dyn GpuDevice) + Send>;

enum Message {
    Run(Task),
    Quit,
}

/// Cloneable way to post work to a GPU execution thread.
///
/// Tasks run in FIFO order on the thread that owns the device.
#[derive(Clone)]
pub struct GpuHandle {
    tx: Sender<Message>,
    thread_id: ThreadId,
    running: Arc<AtomicBool>,
}

impl GpuHandle {
    /// Queues `task` without waiting for it.
    pub fn post_async<F>(&self, task: F) -> Result<(), GpuError>
    where
        F: FnOnce(&mut dyn GpuDevice) + Send + 'static,
    {
        if !self.is_running() {
            return Err(GpuError::ThreadGone);
        }
        self.tx
            .send(Message::Run(Box::new(task)))
            .map_err(|_| GpuError::ThreadGone)
    }

    /// Runs `task` on the GPU thread and waits for its result.
    ///
    /// Calling this from the GPU thread itself would wait on its own queue,
    /// so it fails with [`GpuError::Reentrant`] instead.
    pub fn post_sync<F, R>(&self, task: F) -> Result<R, GpuError>
    where
        F: FnOnce(&mut dyn GpuDevice) -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_current() {
            return Err(GpuError::Reentrant);
        }
        let (result_tx, result_rx) = bounded(1);
        self.post_async(move |device| {
            let _ = result_tx.send(task(device));
        })?;
        result_rx.recv().map_err(|_| GpuError::TaskAborted)
    }

    /// Whether the caller runs on this handle's GPU thread.
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Whether both handles post to the same execution thread.
    pub fn same_thread(&self, other: &GpuHandle) -> bool {
        self.thread_id == other.thread_id
    }
}

impl fmt::Debug for GpuHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuHandle")
            .field("thread", &self.thread_id)
            .field("running", &self.is_running())
            .finish()
    }
}

/// Owned GPU execution thread.
///
/// The device is created on the new thread; [`GpuThread::spawn`] returns
/// once creation succeeded or failed. Dropping the thread drains queued
/// tasks, destroys the device and joins.
pub struct GpuThread {
    handle: GpuHandle,
    caps: DeviceCaps,
    join_handle: Option<JoinHandle<()>>,
}

impl GpuThread {
    pub fn spawn(
        name: &str,
        factory: Arc<dyn DeviceFactory>,
        allowed: GpuApi,
    ) -> Result<Self, GpuError> {
        let (ready_tx, ready_rx) = bounded(1);
        let (tx, rx) = unbounded();
        let running = Arc::new(AtomicBool::new(false));
        let thread_running = Arc::clone(&running);
        let join_handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run_gpu_thread(factory, allowed, rx, ready_tx, thread_running))
            .map_err(|err| GpuError::DeviceCreation(format!("failed to spawn GPU thread: {err}")))?;
        let thread_id = join_handle.thread().id();

        let caps = match ready_rx.recv() {
            Ok(Ok(caps)) => caps,
            Ok(Err(err)) => {
                let _ = join_handle.join();
                return Err(err);
            }
            Err(_) => {
                let _ = join_handle.join();
                return Err(GpuError::DeviceCreation(
                    "GPU thread exited during initialisation".to_string(),
                ));
            }
        };
        debug!(thread = name, device = %caps.name, api = ?caps.api, "GPU thread ready");

        Ok(Self {
            handle: GpuHandle {
                tx,
                thread_id,
                running,
            },
            caps,
            join_handle: Some(join_handle),
        })
    }

    pub fn handle(&self) -> &GpuHandle {
        &self.handle
    }

    pub fn caps(&self) -> &DeviceCaps {
        &self.caps
    }

    /// Stops the thread after the already queued tasks ran.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(join_handle) = self.join_handle.take() else {
            return;
        };
        let _ = self.handle.tx.send(Message::Quit);
        if self.handle.is_current() {
            // Dropped by one of its own tasks: the loop exits on Quit, nobody joins.
            return;
        }
        if join_handle.join().is_err() {
            warn!("GPU thread panicked during shutdown");
        }
    }
}

impl Drop for GpuThread {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_gpu_thread(
    factory: Arc<dyn DeviceFactory>,
    allowed: GpuApi,
    rx: Receiver<Message>,
    ready_tx: Sender<Result<DeviceCaps, GpuError>>,
    running: Arc<AtomicBool>,
) {
    let mut device = match factory.create_device(allowed) {
        Ok(device) => device,
        Err(err) => {
            let _ = ready_tx.send(Err(err));
            return;
        }
    };
    running.store(true, Ordering::Release);
    let _ = ready_tx.send(Ok(device.caps()));

    while let Ok(message) = rx.recv() {
        match message {
            Message::Run(task) => {
                let device = device.as_mut();
                if panic::catch_unwind(AssertUnwindSafe(move || task(device))).is_err() {
                    error!("GPU task panicked; continuing with the next task");
                }
            }
            Message::Quit => break,
        }
    }

    running.store(false, Ordering::Release);
    // Tasks posted between Quit and the flag flip are dropped unrun.
    drop(rx);
    drop(device);
}
