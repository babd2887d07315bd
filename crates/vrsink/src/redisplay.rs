//! Textured full-window quad used by the default draw path.

use bytemuck::{Pod, Zeroable};
use tracing::debug;

use crate::gpu::{BufferTarget, GpuDevice, GpuError, Program, QuadBinding, QuadDraw, TextureId};

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct Vertex {
    position: [f32; 3],
    texcoord: [f32; 2],
}

const QUAD_VERTICES: [Vertex; 4] = [
    Vertex {
        position: [1.0, 1.0, 0.0],
        texcoord: [1.0, 0.0],
    },
    Vertex {
        position: [-1.0, 1.0, 0.0],
        texcoord: [0.0, 0.0],
    },
    Vertex {
        position: [-1.0, -1.0, 0.0],
        texcoord: [0.0, 1.0],
    },
    Vertex {
        position: [1.0, -1.0, 0.0],
        texcoord: [1.0, 1.0],
    },
];

const QUAD_INDICES: [u16; 6] = [0, 1, 2, 0, 2, 3];

const VERTEX_SHADER: &str = "\
attribute vec4 a_position;
attribute vec2 a_texcoord;
varying vec2 v_texcoord;
void main() {
    gl_Position = a_position;
    v_texcoord = a_texcoord;
}
";

const FRAGMENT_SHADER: &str = "\
#ifdef GL_ES
precision mediump float;
#endif
varying vec2 v_texcoord;
uniform sampler2D tex;
void main() {
    gl_FragColor = texture2D(tex, v_texcoord);
}
";

/// GPU objects of the redisplay pass. Lives on the GPU thread only.
#[derive(Debug)]
pub(crate) struct QuadRenderer {
    program: Program,
    binding: QuadBinding,
}

impl QuadRenderer {
    /// Compiles the program and uploads the quad. Partially created objects
    /// are deleted on failure.
    pub(crate) fn new(device: &mut dyn GpuDevice) -> Result<Self, GpuError> {
        let program = device.compile_program(
            VERTEX_SHADER,
            FRAGMENT_SHADER,
            &["a_position", "a_texcoord"],
        )?;
        let location = |index: usize| program.attribute_locations.get(index).copied().unwrap_or(-1);
        let position_location = location(0);
        let texcoord_location = location(1);

        let vertex_array = if device.caps().vertex_arrays {
            match device.create_vertex_array() {
                Ok(vertex_array) => Some(vertex_array),
                Err(err) => {
                    device.delete_program(program.id);
                    return Err(err);
                }
            }
        } else {
            None
        };

        let vertices = match device.create_buffer(
            BufferTarget::Vertex,
            bytemuck::cast_slice(&QUAD_VERTICES),
        ) {
            Ok(buffer) => buffer,
            Err(err) => {
                if let Some(vertex_array) = vertex_array {
                    device.delete_vertex_array(vertex_array);
                }
                device.delete_program(program.id);
                return Err(err);
            }
        };
        let indices = match device.create_buffer(
            BufferTarget::Index,
            bytemuck::cast_slice(&QUAD_INDICES),
        ) {
            Ok(buffer) => buffer,
            Err(err) => {
                device.delete_buffer(vertices);
                if let Some(vertex_array) = vertex_array {
                    device.delete_vertex_array(vertex_array);
                }
                device.delete_program(program.id);
                return Err(err);
            }
        };

        debug!(program = %program.id, vao = vertex_array.is_some(), "redisplay quad ready");
        Ok(Self {
            binding: QuadBinding {
                vertex_array,
                vertices,
                indices,
                position_location,
                texcoord_location,
            },
            program,
        })
    }

    /// Draws `texture` over the current viewport.
    ///
    /// With `ignore_alpha` the target is cleared to opaque black and the quad
    /// is blended against a constant opaque colour.
    pub(crate) fn draw(&self, device: &mut dyn GpuDevice, texture: TextureId, ignore_alpha: bool) {
        let alpha = if ignore_alpha { 1.0 } else { 0.0 };
        device.clear([0.0, 0.0, 0.0, alpha]);
        if ignore_alpha {
            device.set_blend_constant(Some([0.0, 0.0, 0.0, 1.0]));
        }
        device.draw_quad(&QuadDraw {
            program: self.program.id,
            binding: self.binding,
            texture,
            index_count: QUAD_INDICES.len() as u32,
        });
        if ignore_alpha {
            device.set_blend_constant(None);
        }
    }

    pub(crate) fn destroy(self, device: &mut dyn GpuDevice) {
        if let Some(vertex_array) = self.binding.vertex_array {
            device.delete_vertex_array(vertex_array);
        }
        device.delete_buffer(self.binding.vertices);
        device.delete_buffer(self.binding.indices);
        device.delete_program(self.program.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{DeviceFactory, GpuApi, HeadlessDeviceFactory};

    #[test]
    fn quad_layout_matches_index_buffer() {
        assert_eq!(std::mem::size_of::<Vertex>(), 5 * 4);
        assert_eq!(bytemuck::cast_slice::<_, u8>(&QUAD_VERTICES).len(), 80);
        assert!(QUAD_INDICES.iter().all(|index| (*index as usize) < QUAD_VERTICES.len()));
    }

    #[test]
    fn destroy_releases_everything() {
        for vertex_arrays in [true, false] {
            let factory = HeadlessDeviceFactory::new().with_vertex_arrays(vertex_arrays);
            let probe = factory.probe();
            let mut device = factory.create_device(GpuApi::all()).unwrap();
            let quad = QuadRenderer::new(device.as_mut()).unwrap();
            assert_eq!(probe.snapshot().live_vertex_arrays, usize::from(vertex_arrays));
            quad.destroy(device.as_mut());
            assert_eq!(probe.snapshot().live_objects(), 0);
        }
    }

    #[test]
    fn shader_failure_leaves_nothing_behind() {
        let factory = HeadlessDeviceFactory::new();
        let probe = factory.probe();
        probe.fail_shader_compilation(true);
        let mut device = factory.create_device(GpuApi::all()).unwrap();
        assert!(matches!(
            QuadRenderer::new(device.as_mut()),
            Err(GpuError::Shader(_))
        ));
        assert_eq!(probe.snapshot().live_objects(), 0);
    }

    #[test]
    fn ignore_alpha_clears_opaque() {
        let factory = HeadlessDeviceFactory::new();
        let probe = factory.probe();
        let mut device = factory.create_device(GpuApi::all()).unwrap();
        let quad = QuadRenderer::new(device.as_mut()).unwrap();
        let texture = device.create_texture(2, 2).unwrap();
        quad.draw(device.as_mut(), texture, true);
        let stats = probe.snapshot();
        assert_eq!(stats.last_clear, Some([0.0, 0.0, 0.0, 1.0]));
        assert_eq!(stats.last_drawn_texture, Some(texture));
        quad.draw(device.as_mut(), texture, false);
        assert_eq!(probe.snapshot().last_clear, Some([0.0, 0.0, 0.0, 0.0]));
        device.delete_texture(texture);
        quad.destroy(device.as_mut());
    }
}
