//! GPU abstraction used by the sink.
//!
//! Every call on a [`GpuDevice`] happens on the thread that owns it, which is
//! the execution thread spawned by [`GpuThread`]. Other threads reach the
//! device only by posting closures.
//!
//! - `thread`: the execution thread and its cloneable [`GpuHandle`].
//! - `headless`: an in-memory device used by tests and the CLI.
//! - `views`: pixel-level multiview unpack/pack and anaglyph downmix.

use std::fmt;

use bitflags::bitflags;

use crate::geometry::Rect;

mod headless;
mod thread;
mod views;

pub use headless::{DeviceEvent, HeadlessDeviceFactory, HeadlessProbe, HeadlessStats};
pub use thread::{GpuHandle, GpuThread};
pub use views::{downmix_matrices, ViewLayout, ViewPlan};

pub(crate) use views::{convert_images, Image};

bitflags! {
    /// Graphics APIs a display or context may use.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct GpuApi: u32 {
        const OPENGL = 1 << 0;
        const OPENGL3 = 1 << 1;
        const GLES2 = 1 << 2;
        const VULKAN = 1 << 3;
    }
}

impl GpuApi {
    /// APIs the redisplay path can draw with.
    pub const SINK_SUPPORTED: GpuApi = GpuApi::OPENGL
        .union(GpuApi::OPENGL3)
        .union(GpuApi::GLES2);
}

macro_rules! gpu_id {
    ($(#[$meta:meta])* $name:ident($inner:ty)) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub $inner);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

gpu_id!(
    /// Handle of a device texture. Zero is never handed out.
    TextureId(u32)
);
gpu_id!(BufferId(u32));
gpu_id!(VertexArrayId(u32));
gpu_id!(ProgramId(u32));
gpu_id!(FenceId(u64));

/// Errors raised by devices and the execution thread.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GpuError {
    #[error("no supported graphics API (requested {0:?})")]
    UnsupportedApi(GpuApi),
    #[error("failed to create GPU device: {0}")]
    DeviceCreation(String),
    #[error("shader compilation failed: {0}")]
    Shader(String),
    #[error("failed to allocate {what}: {reason}")]
    Allocation { what: &'static str, reason: String },
    #[error("unknown texture {0}")]
    UnknownTexture(TextureId),
    #[error("pixel data of {got} bytes does not match texture size {expected}")]
    PixelSize { expected: usize, got: usize },
    #[error("multiview conversion failed: {0}")]
    Conversion(String),
    #[error("GPU execution thread is not running")]
    ThreadGone,
    #[error("synchronous GPU task posted from the GPU execution thread")]
    Reentrant,
    #[error("GPU task aborted before producing a result")]
    TaskAborted,
}

/// What a device reports once it is up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCaps {
    pub name: String,
    pub api: GpuApi,
    /// Whether fence sync objects exist.
    pub fences: bool,
    /// Whether vertex array objects exist; without them buffers are bound per draw.
    pub vertex_arrays: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferTarget {
    Vertex,
    Index,
}

/// A linked shader program and the locations of its requested attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Program {
    pub id: ProgramId,
    /// One entry per attribute name passed to `compile_program`, `-1` when absent.
    pub attribute_locations: Vec<i32>,
}

/// Vertex input of a draw call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuadBinding {
    pub vertex_array: Option<VertexArrayId>,
    pub vertices: BufferId,
    pub indices: BufferId,
    pub position_location: i32,
    pub texcoord_location: i32,
}

/// One indexed, textured draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuadDraw {
    pub program: ProgramId,
    pub binding: QuadBinding,
    pub texture: TextureId,
    pub index_count: u32,
}

/// Rendering back-end executed on the GPU thread.
///
/// The shape follows a GL-style API: handles are plain integers and object
/// lifetimes are managed by explicit create/delete pairs.
pub trait GpuDevice: Send {
    fn caps(&self) -> DeviceCaps;

    fn create_texture(&mut self, width: u32, height: u32) -> Result<TextureId, GpuError>;
    fn upload_texture(&mut self, texture: TextureId, pixels: &[u8]) -> Result<(), GpuError>;
    fn read_texture(&mut self, texture: TextureId) -> Result<Vec<u8>, GpuError>;
    fn texture_size(&self, texture: TextureId) -> Option<(u32, u32)>;
    fn delete_texture(&mut self, texture: TextureId);

    fn create_buffer(&mut self, target: BufferTarget, data: &[u8]) -> Result<BufferId, GpuError>;
    fn delete_buffer(&mut self, buffer: BufferId);

    fn create_vertex_array(&mut self) -> Result<VertexArrayId, GpuError>;
    fn delete_vertex_array(&mut self, vertex_array: VertexArrayId);

    fn compile_program(
        &mut self,
        vertex_source: &str,
        fragment_source: &str,
        attributes: &[&str],
    ) -> Result<Program, GpuError>;
    fn delete_program(&mut self, program: ProgramId);

    /// Inserts a fence after the commands issued so far. `None` without fence support.
    fn insert_fence(&mut self) -> Option<FenceId>;
    fn wait_fence(&mut self, fence: FenceId);
    fn delete_fence(&mut self, fence: FenceId);

    fn set_viewport(&mut self, rect: Rect);
    fn clear(&mut self, color: [f32; 4]);
    /// Enables constant-colour blending with `color`, or disables blending.
    fn set_blend_constant(&mut self, color: Option<[f32; 4]>);
    fn draw_quad(&mut self, draw: &QuadDraw);

    /// Runs a multiview conversion and returns newly created output textures.
    fn convert_views(
        &mut self,
        inputs: &[TextureId],
        plan: &ViewPlan,
    ) -> Result<Vec<TextureId>, GpuError>;

    fn present(&mut self);
}

/// Builds devices on the GPU thread.
pub trait DeviceFactory: Send + Sync {
    fn name(&self) -> &str;

    /// APIs this factory can create devices for.
    fn supported_apis(&self) -> GpuApi {
        GpuApi::all()
    }

    /// Creates a device using one of the `allowed` APIs.
    fn create_device(&self, allowed: GpuApi) -> Result<Box<dyn GpuDevice>, GpuError>;
}

/// Fence guarding a texture until the GPU finished writing it.
///
/// Dropping the fence deletes it on the thread that owns the device.
pub struct SyncFence {
    id: FenceId,
    handle: GpuHandle,
}

impl SyncFence {
    pub(crate) fn new(id: FenceId, handle: GpuHandle) -> Self {
        Self { id, handle }
    }

    pub fn id(&self) -> FenceId {
        self.id
    }

    /// Makes subsequent commands on `device` wait for the fence.
    pub fn wait(&self, device: &mut dyn GpuDevice) {
        device.wait_fence(self.id);
    }
}

impl fmt::Debug for SyncFence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncFence").field("id", &self.id).finish()
    }
}

impl Drop for SyncFence {
    fn drop(&mut self) {
        let id = self.id;
        if self
            .handle
            .post_async(move |device| device.delete_fence(id))
            .is_err()
        {
            tracing::trace!(fence = %id, "GPU thread gone; fence released with its device");
        }
    }
}
