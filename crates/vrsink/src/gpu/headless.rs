use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

use super::{
    convert_images, BufferId, BufferTarget, DeviceCaps, DeviceFactory, FenceId, GpuApi,
    GpuDevice, GpuError, Image, Program, ProgramId, QuadDraw, TextureId, VertexArrayId, ViewPlan,
};
use crate::geometry::Rect;

const EVENT_LOG_CAPACITY: usize = 4096;

/// Device call recorded by the headless device, in execution order.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    CreateTexture(TextureId),
    Upload(TextureId),
    DeleteTexture(TextureId),
    InsertFence(FenceId),
    WaitFence(FenceId),
    DeleteFence(FenceId),
    Viewport(Rect),
    Clear([f32; 4]),
    Draw { texture: TextureId, program: ProgramId },
    Convert { inputs: usize, outputs: usize },
    Present,
}

/// Counters of every headless device created by one factory.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeadlessStats {
    pub devices_created: usize,
    pub devices_alive: usize,
    pub live_textures: usize,
    pub live_buffers: usize,
    pub live_vertex_arrays: usize,
    pub live_programs: usize,
    pub live_fences: usize,
    /// Objects still alive when their device was destroyed.
    pub leaked_objects: usize,
    pub uploads: usize,
    pub conversions: usize,
    pub draws: usize,
    pub invalid_draws: usize,
    pub fence_waits: usize,
    pub presents: usize,
    pub last_viewport: Option<Rect>,
    pub last_clear: Option<[f32; 4]>,
    pub last_blend: Option<[f32; 4]>,
    pub last_drawn_texture: Option<TextureId>,
}

impl HeadlessStats {
    /// Sum of all live GPU objects.
    pub fn live_objects(&self) -> usize {
        self.live_textures
            + self.live_buffers
            + self.live_vertex_arrays
            + self.live_programs
            + self.live_fences
    }
}

#[derive(Debug, Default)]
struct Failures {
    device: bool,
    shader: bool,
    texture: bool,
    conversion: bool,
}

#[derive(Debug, Default)]
struct ProbeState {
    stats: HeadlessStats,
    events: VecDeque<DeviceEvent>,
    failures: Failures,
}

/// Shared view into the headless devices of one factory.
///
/// Tests use it to read counters, inspect the call log and inject failures.
#[derive(Debug, Clone, Default)]
pub struct HeadlessProbe {
    state: Arc<Mutex<ProbeState>>,
}

impl HeadlessProbe {
    fn lock(&self) -> MutexGuard<'_, ProbeState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn snapshot(&self) -> HeadlessStats {
        self.lock().stats.clone()
    }

    /// Returns and clears the recorded call log.
    pub fn take_events(&self) -> Vec<DeviceEvent> {
        self.lock().events.drain(..).collect()
    }

    pub fn fail_device_creation(&self, fail: bool) {
        self.lock().failures.device = fail;
    }

    pub fn fail_shader_compilation(&self, fail: bool) {
        self.lock().failures.shader = fail;
    }

    pub fn fail_texture_allocation(&self, fail: bool) {
        self.lock().failures.texture = fail;
    }

    pub fn fail_conversion(&self, fail: bool) {
        self.lock().failures.conversion = fail;
    }

    fn record(&self, event: DeviceEvent, update: impl FnOnce(&mut HeadlessStats)) {
        let mut state = self.lock();
        update(&mut state.stats);
        if state.events.len() == EVENT_LOG_CAPACITY {
            state.events.pop_front();
        }
        state.events.push_back(event);
    }

    fn update(&self, update: impl FnOnce(&mut HeadlessStats)) {
        update(&mut self.lock().stats);
    }
}

/// Factory for in-memory devices.
///
/// The devices keep textures as CPU pixel buffers and perform multiview
/// conversion in software, which makes the whole sink runnable without a
/// display server.
#[derive(Debug, Clone)]
pub struct HeadlessDeviceFactory {
    api: GpuApi,
    fences: bool,
    vertex_arrays: bool,
    probe: HeadlessProbe,
}

impl HeadlessDeviceFactory {
    pub fn new() -> Self {
        Self {
            api: GpuApi::OPENGL3 | GpuApi::GLES2,
            fences: true,
            vertex_arrays: true,
            probe: HeadlessProbe::default(),
        }
    }

    pub fn with_api(mut self, api: GpuApi) -> Self {
        self.api = api;
        self
    }

    pub fn with_fences(mut self, fences: bool) -> Self {
        self.fences = fences;
        self
    }

    pub fn with_vertex_arrays(mut self, vertex_arrays: bool) -> Self {
        self.vertex_arrays = vertex_arrays;
        self
    }

    pub fn probe(&self) -> HeadlessProbe {
        self.probe.clone()
    }
}

impl Default for HeadlessDeviceFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceFactory for HeadlessDeviceFactory {
    fn name(&self) -> &str {
        "headless"
    }

    fn supported_apis(&self) -> GpuApi {
        self.api
    }

    fn create_device(&self, allowed: GpuApi) -> Result<Box<dyn GpuDevice>, GpuError> {
        if self.probe.lock().failures.device {
            return Err(GpuError::DeviceCreation(
                "headless device creation disabled".to_string(),
            ));
        }
        let usable = allowed & self.api;
        let api = [GpuApi::OPENGL3, GpuApi::OPENGL, GpuApi::GLES2, GpuApi::VULKAN]
            .into_iter()
            .find(|candidate| usable.contains(*candidate))
            .ok_or(GpuError::UnsupportedApi(allowed))?;

        self.probe.update(|stats| {
            stats.devices_created += 1;
            stats.devices_alive += 1;
        });
        debug!(api = ?api, "created headless GPU device");
        Ok(Box::new(HeadlessDevice {
            caps: DeviceCaps {
                name: "headless".to_string(),
                api,
                fences: self.fences,
                vertex_arrays: self.vertex_arrays,
            },
            probe: self.probe.clone(),
            next_id: 1,
            textures: HashMap::new(),
            buffers: HashMap::new(),
            vertex_arrays: HashSet::new(),
            programs: HashSet::new(),
            fences: HashSet::new(),
        }))
    }
}

struct Texture {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

struct HeadlessDevice {
    caps: DeviceCaps,
    probe: HeadlessProbe,
    next_id: u32,
    textures: HashMap<TextureId, Texture>,
    buffers: HashMap<BufferId, Vec<u8>>,
    vertex_arrays: HashSet<VertexArrayId>,
    programs: HashSet<ProgramId>,
    fences: HashSet<FenceId>,
}

impl HeadlessDevice {
    fn allocate_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);
        id
    }

    fn texture_image(&self, texture: TextureId) -> Result<Image, GpuError> {
        let entry = self
            .textures
            .get(&texture)
            .ok_or(GpuError::UnknownTexture(texture))?;
        Image::from_pixels(entry.width, entry.height, entry.pixels.clone())
            .ok_or(GpuError::UnknownTexture(texture))
    }

    fn insert_texture(&mut self, width: u32, height: u32, pixels: Vec<u8>) -> TextureId {
        let id = TextureId(self.allocate_id());
        self.textures.insert(
            id,
            Texture {
                width,
                height,
                pixels,
            },
        );
        self.probe
            .record(DeviceEvent::CreateTexture(id), |stats| stats.live_textures += 1);
        id
    }
}

impl GpuDevice for HeadlessDevice {
    fn caps(&self) -> DeviceCaps {
        self.caps.clone()
    }

    fn create_texture(&mut self, width: u32, height: u32) -> Result<TextureId, GpuError> {
        if self.probe.lock().failures.texture {
            return Err(GpuError::Allocation {
                what: "texture",
                reason: "headless texture allocation disabled".to_string(),
            });
        }
        if width == 0 || height == 0 {
            return Err(GpuError::Allocation {
                what: "texture",
                reason: format!("invalid size {width}x{height}"),
            });
        }
        let pixels = vec![0; width as usize * height as usize * 4];
        Ok(self.insert_texture(width, height, pixels))
    }

    fn upload_texture(&mut self, texture: TextureId, pixels: &[u8]) -> Result<(), GpuError> {
        let entry = self
            .textures
            .get_mut(&texture)
            .ok_or(GpuError::UnknownTexture(texture))?;
        if entry.pixels.len() != pixels.len() {
            return Err(GpuError::PixelSize {
                expected: entry.pixels.len(),
                got: pixels.len(),
            });
        }
        entry.pixels.copy_from_slice(pixels);
        self.probe
            .record(DeviceEvent::Upload(texture), |stats| stats.uploads += 1);
        Ok(())
    }

    fn read_texture(&mut self, texture: TextureId) -> Result<Vec<u8>, GpuError> {
        self.textures
            .get(&texture)
            .map(|entry| entry.pixels.clone())
            .ok_or(GpuError::UnknownTexture(texture))
    }

    fn texture_size(&self, texture: TextureId) -> Option<(u32, u32)> {
        self.textures
            .get(&texture)
            .map(|entry| (entry.width, entry.height))
    }

    fn delete_texture(&mut self, texture: TextureId) {
        if self.textures.remove(&texture).is_some() {
            self.probe
                .record(DeviceEvent::DeleteTexture(texture), |stats| {
                    stats.live_textures -= 1
                });
        } else {
            warn!(texture = %texture, "delete of unknown texture");
        }
    }

    fn create_buffer(&mut self, _target: BufferTarget, data: &[u8]) -> Result<BufferId, GpuError> {
        let id = BufferId(self.allocate_id());
        self.buffers.insert(id, data.to_vec());
        self.probe.update(|stats| stats.live_buffers += 1);
        Ok(id)
    }

    fn delete_buffer(&mut self, buffer: BufferId) {
        if self.buffers.remove(&buffer).is_some() {
            self.probe.update(|stats| stats.live_buffers -= 1);
        }
    }

    fn create_vertex_array(&mut self) -> Result<VertexArrayId, GpuError> {
        if !self.caps.vertex_arrays {
            return Err(GpuError::Allocation {
                what: "vertex array",
                reason: "vertex arrays are not supported".to_string(),
            });
        }
        let id = VertexArrayId(self.allocate_id());
        self.vertex_arrays.insert(id);
        self.probe.update(|stats| stats.live_vertex_arrays += 1);
        Ok(id)
    }

    fn delete_vertex_array(&mut self, vertex_array: VertexArrayId) {
        if self.vertex_arrays.remove(&vertex_array) {
            self.probe.update(|stats| stats.live_vertex_arrays -= 1);
        }
    }

    fn compile_program(
        &mut self,
        vertex_source: &str,
        fragment_source: &str,
        attributes: &[&str],
    ) -> Result<Program, GpuError> {
        if self.probe.lock().failures.shader {
            return Err(GpuError::Shader("headless shader compilation disabled".to_string()));
        }
        if vertex_source.trim().is_empty() || fragment_source.trim().is_empty() {
            return Err(GpuError::Shader("empty shader source".to_string()));
        }
        let mut next_location = 0;
        let attribute_locations = attributes
            .iter()
            .map(|name| {
                if vertex_source.contains(name) {
                    let location = next_location;
                    next_location += 1;
                    location
                } else {
                    -1
                }
            })
            .collect();
        let id = ProgramId(self.allocate_id());
        self.programs.insert(id);
        self.probe.update(|stats| stats.live_programs += 1);
        Ok(Program {
            id,
            attribute_locations,
        })
    }

    fn delete_program(&mut self, program: ProgramId) {
        if self.programs.remove(&program) {
            self.probe.update(|stats| stats.live_programs -= 1);
        }
    }

    fn insert_fence(&mut self) -> Option<FenceId> {
        if !self.caps.fences {
            return None;
        }
        let id = FenceId(u64::from(self.allocate_id()));
        self.fences.insert(id);
        self.probe
            .record(DeviceEvent::InsertFence(id), |stats| stats.live_fences += 1);
        Some(id)
    }

    fn wait_fence(&mut self, fence: FenceId) {
        if !self.fences.contains(&fence) {
            warn!(fence = %fence, "wait on unknown fence");
        }
        self.probe
            .record(DeviceEvent::WaitFence(fence), |stats| stats.fence_waits += 1);
    }

    fn delete_fence(&mut self, fence: FenceId) {
        if self.fences.remove(&fence) {
            self.probe
                .record(DeviceEvent::DeleteFence(fence), |stats| stats.live_fences -= 1);
        }
    }

    fn set_viewport(&mut self, rect: Rect) {
        self.probe.record(DeviceEvent::Viewport(rect), |stats| {
            stats.last_viewport = Some(rect)
        });
    }

    fn clear(&mut self, color: [f32; 4]) {
        self.probe
            .record(DeviceEvent::Clear(color), |stats| stats.last_clear = Some(color));
    }

    fn set_blend_constant(&mut self, color: Option<[f32; 4]>) {
        self.probe.update(|stats| stats.last_blend = color);
    }

    fn draw_quad(&mut self, draw: &QuadDraw) {
        let binding = &draw.binding;
        let valid = self.textures.contains_key(&draw.texture)
            && self.programs.contains(&draw.program)
            && self.buffers.contains_key(&binding.vertices)
            && self.buffers.contains_key(&binding.indices)
            && binding
                .vertex_array
                .map_or(true, |vao| self.vertex_arrays.contains(&vao));
        if !valid {
            warn!(texture = %draw.texture, "draw with dead GPU objects");
            self.probe.update(|stats| stats.invalid_draws += 1);
            return;
        }
        self.probe.record(
            DeviceEvent::Draw {
                texture: draw.texture,
                program: draw.program,
            },
            |stats| {
                stats.draws += 1;
                stats.last_drawn_texture = Some(draw.texture);
            },
        );
    }

    fn convert_views(
        &mut self,
        inputs: &[TextureId],
        plan: &ViewPlan,
    ) -> Result<Vec<TextureId>, GpuError> {
        if self.probe.lock().failures.conversion {
            return Err(GpuError::Conversion(
                "headless conversion disabled".to_string(),
            ));
        }
        let images = inputs
            .iter()
            .map(|texture| self.texture_image(*texture))
            .collect::<Result<Vec<_>, _>>()?;
        let outputs = convert_images(&images, plan).map_err(GpuError::Conversion)?;
        let textures: Vec<TextureId> = outputs
            .into_iter()
            .map(|image| self.insert_texture(image.width, image.height, image.pixels))
            .collect();
        self.probe.record(
            DeviceEvent::Convert {
                inputs: inputs.len(),
                outputs: textures.len(),
            },
            |stats| stats.conversions += 1,
        );
        Ok(textures)
    }

    fn present(&mut self) {
        self.probe
            .record(DeviceEvent::Present, |stats| stats.presents += 1);
    }
}

impl Drop for HeadlessDevice {
    fn drop(&mut self) {
        let leaked = self.textures.len()
            + self.buffers.len()
            + self.vertex_arrays.len()
            + self.programs.len()
            + self.fences.len();
        if leaked > 0 {
            warn!(
                textures = self.textures.len(),
                buffers = self.buffers.len(),
                vertex_arrays = self.vertex_arrays.len(),
                programs = self.programs.len(),
                fences = self.fences.len(),
                "headless device destroyed with live objects"
            );
        }
        self.probe.update(|stats| {
            stats.devices_alive -= 1;
            stats.leaked_objects += leaked;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(factory: &HeadlessDeviceFactory) -> Box<dyn GpuDevice> {
        factory.create_device(GpuApi::all()).unwrap()
    }

    #[test]
    fn tracks_live_objects() {
        let factory = HeadlessDeviceFactory::new();
        let probe = factory.probe();
        let mut device = device(&factory);
        let texture = device.create_texture(4, 4).unwrap();
        let buffer = device.create_buffer(BufferTarget::Vertex, &[0; 16]).unwrap();
        assert_eq!(probe.snapshot().live_objects(), 2);
        device.delete_texture(texture);
        device.delete_buffer(buffer);
        assert_eq!(probe.snapshot().live_objects(), 0);
        drop(device);
        let stats = probe.snapshot();
        assert_eq!(stats.devices_alive, 0);
        assert_eq!(stats.leaked_objects, 0);
    }

    #[test]
    fn counts_leaks_on_destroy() {
        let factory = HeadlessDeviceFactory::new();
        let probe = factory.probe();
        let mut device = device(&factory);
        device.create_texture(2, 2).unwrap();
        drop(device);
        assert_eq!(probe.snapshot().leaked_objects, 1);
    }

    #[test]
    fn rejects_disallowed_apis() {
        let factory = HeadlessDeviceFactory::new().with_api(GpuApi::VULKAN);
        assert!(matches!(
            factory.create_device(GpuApi::SINK_SUPPORTED),
            Err(GpuError::UnsupportedApi(_))
        ));
    }

    #[test]
    fn upload_checks_size() {
        let factory = HeadlessDeviceFactory::new();
        let mut device = device(&factory);
        let texture = device.create_texture(2, 2).unwrap();
        assert!(matches!(
            device.upload_texture(texture, &[0; 3]),
            Err(GpuError::PixelSize { expected: 16, got: 3 })
        ));
        device.upload_texture(texture, &[7; 16]).unwrap();
        assert_eq!(device.read_texture(texture).unwrap(), vec![7; 16]);
        device.delete_texture(texture);
    }

    #[test]
    fn fences_absent_without_support() {
        let factory = HeadlessDeviceFactory::new().with_fences(false);
        let mut device = device(&factory);
        assert!(device.insert_fence().is_none());
        assert!(!device.caps().fences);
    }

    #[test]
    fn missing_attributes_get_negative_locations() {
        let factory = HeadlessDeviceFactory::new();
        let mut device = device(&factory);
        let program = device
            .compile_program("attribute vec4 a_position;", "void main() {}", &["a_position", "a_texcoord"])
            .unwrap();
        assert_eq!(program.attribute_locations, vec![0, -1]);
        device.delete_program(program.id);
    }
}
