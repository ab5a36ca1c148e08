//! In-memory [`GlApi`] and [`GlSurface`] that record what they are asked to do
//!
//! Object names are plain integers, buffer and texture contents are kept as byte
//! vectors, and the calls that matter for rendering are logged in order. Shader
//! sources containing `#error` fail to compile, mirroring a real driver.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{GlApi, GlSurface};
use crate::types::Extent2D;

/// A rendering-relevant GL call
#[derive(Debug, Clone, PartialEq)]
pub enum GlCall {
    /// glBindFramebuffer; `None` is the window
    BindFramebuffer(Option<u32>),
    /// glViewport
    Viewport(i32, i32, i32, i32),
    /// glScissor
    Scissor(i32, i32, i32, i32),
    /// Colour and depth clear
    Clear([f32; 4], f32),
    /// glEnable / glDisable
    Capability(u32, bool),
    /// glDepthMask
    DepthMask(bool),
    /// glBlendFunc
    BlendFunc(u32, u32),
    /// glCullFace
    CullFace(u32),
    /// glPolygonMode
    PolygonMode(u32),
    /// glUseProgram
    UseProgram(Option<u32>),
    /// glBindVertexArray
    BindVertexArray(Option<u32>),
    /// Attribute pointer into the bound array buffer
    VertexAttrib {
        /// Shader location
        location: u32,
        /// Component count
        components: i32,
        /// Byte stride
        stride: i32,
        /// Byte offset
        offset: i32,
    },
    /// glBindBuffer
    BindBuffer(u32, Option<u32>),
    /// glBindBufferBase
    BindBufferBase(u32, u32, Option<u32>),
    /// Texture bound on a unit
    BindTexture(u32, Option<u32>),
    /// Sampler bound on a unit
    BindSampler(u32, Option<u32>),
    /// glBindImageTexture
    BindImage(u32, u32),
    /// Non-indexed draw
    DrawArrays {
        /// Primitive mode
        mode: u32,
        /// Vertex count
        count: i32,
        /// Instance count
        instances: i32,
    },
    /// Indexed draw
    DrawElements {
        /// Primitive mode
        mode: u32,
        /// Index count
        count: i32,
        /// Index element type
        index_type: u32,
        /// Instance count
        instances: i32,
    },
    /// glDispatchCompute
    Dispatch(u32, u32, u32),
    /// glMemoryBarrier
    MemoryBarrier(u32),
    /// glFinish
    Finish,
}

/// Counts of live GL objects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GlLiveObjects {
    /// Buffer objects
    pub buffers: usize,
    /// Texture objects
    pub textures: usize,
    /// Sampler objects
    pub samplers: usize,
    /// Shader objects
    pub shaders: usize,
    /// Program objects
    pub programs: usize,
    /// Framebuffer objects
    pub framebuffers: usize,
    /// Vertex array objects
    pub vertex_arrays: usize,
}

#[derive(Default)]
struct Texture {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

#[derive(Default)]
struct GlState {
    next_name: u32,
    calls: Vec<GlCall>,
    buffers: HashMap<u32, Vec<u8>>,
    bound_buffers: HashMap<u32, u32>,
    textures: HashMap<u32, Texture>,
    active_unit: u32,
    bound_textures: HashMap<u32, u32>,
    samplers: HashSet<u32>,
    shaders: HashSet<u32>,
    programs: HashSet<u32>,
    framebuffers: HashSet<u32>,
    vertex_arrays: HashSet<u32>,
}

impl GlState {
    fn name(&mut self) -> u32 {
        self.next_name += 1;
        self.next_name
    }

    fn bound_buffer(&mut self, target: u32) -> Option<&mut Vec<u8>> {
        let name = *self.bound_buffers.get(&target)?;
        self.buffers.get_mut(&name)
    }

    fn bound_texture(&mut self) -> Option<&mut Texture> {
        let name = *self.bound_textures.get(&self.active_unit)?;
        self.textures.get_mut(&name)
    }
}

/// Recording OpenGL implementation
#[derive(Default)]
pub struct RecordingGl {
    state: Mutex<GlState>,
}

impl RecordingGl {
    /// Fresh context with no objects
    pub fn new() -> Self {
        Self::default()
    }

    /// Calls logged so far
    pub fn calls(&self) -> Vec<GlCall> {
        self.state.lock().calls.clone()
    }

    /// Drain the call log
    pub fn take_calls(&self) -> Vec<GlCall> {
        std::mem::take(&mut self.state.lock().calls)
    }

    /// Contents of a buffer object
    pub fn buffer_contents(&self, buffer: u32) -> Option<Vec<u8>> {
        self.state.lock().buffers.get(&buffer).cloned()
    }

    /// Size and contents of a texture object
    pub fn texture_contents(&self, texture: u32) -> Option<(u32, u32, Vec<u8>)> {
        self.state.lock().textures.get(&texture).map(|t| (t.width, t.height, t.data.clone()))
    }

    /// Live object counts
    pub fn live_objects(&self) -> GlLiveObjects {
        let state = self.state.lock();
        GlLiveObjects {
            buffers: state.buffers.len(),
            textures: state.textures.len(),
            samplers: state.samplers.len(),
            shaders: state.shaders.len(),
            programs: state.programs.len(),
            framebuffers: state.framebuffers.len(),
            vertex_arrays: state.vertex_arrays.len(),
        }
    }

    fn log(&self, call: GlCall) {
        self.state.lock().calls.push(call);
    }
}

fn texel_size(format: u32, ty: u32) -> usize {
    let components = match format {
        glow::RED | glow::DEPTH_COMPONENT => 1,
        glow::RG => 2,
        glow::RGB => 3,
        _ => 4,
    };
    let bytes = match ty {
        glow::HALF_FLOAT => 2,
        glow::FLOAT => 4,
        _ => 1,
    };
    components * bytes
}

impl GlApi for RecordingGl {
    type Buffer = u32;
    type Texture = u32;
    type Sampler = u32;
    type Shader = u32;
    type Program = u32;
    type Framebuffer = u32;
    type VertexArray = u32;

    fn create_buffer(&self) -> Result<u32, String> {
        let mut state = self.state.lock();
        let name = state.name();
        state.buffers.insert(name, Vec::new());
        Ok(name)
    }

    fn delete_buffer(&self, buffer: u32) {
        let mut state = self.state.lock();
        state.buffers.remove(&buffer);
        state.bound_buffers.retain(|_, bound| *bound != buffer);
    }

    fn bind_buffer(&self, target: u32, buffer: Option<u32>) {
        let mut state = self.state.lock();
        match buffer {
            Some(buffer) => state.bound_buffers.insert(target, buffer),
            None => state.bound_buffers.remove(&target),
        };
        state.calls.push(GlCall::BindBuffer(target, buffer));
    }

    fn buffer_data(&self, target: u32, size: usize, data: Option<&[u8]>, _usage: u32) {
        let mut state = self.state.lock();
        if let Some(contents) = state.bound_buffer(target) {
            *contents = vec![0; size];
            if let Some(data) = data {
                contents[..data.len()].copy_from_slice(data);
            }
        }
    }

    fn buffer_sub_data(&self, target: u32, offset: usize, data: &[u8]) {
        let mut state = self.state.lock();
        if let Some(contents) = state.bound_buffer(target) {
            if let Some(range) = contents.get_mut(offset..offset + data.len()) {
                range.copy_from_slice(data);
            }
        }
    }

    fn bind_buffer_base(&self, target: u32, index: u32, buffer: Option<u32>) {
        let mut state = self.state.lock();
        if let Some(buffer) = buffer {
            state.bound_buffers.insert(target, buffer);
        }
        state.calls.push(GlCall::BindBufferBase(target, index, buffer));
    }

    fn create_texture(&self) -> Result<u32, String> {
        let mut state = self.state.lock();
        let name = state.name();
        state.textures.insert(name, Texture::default());
        Ok(name)
    }

    fn delete_texture(&self, texture: u32) {
        let mut state = self.state.lock();
        state.textures.remove(&texture);
        state.bound_textures.retain(|_, bound| *bound != texture);
    }

    fn active_texture(&self, unit: u32) {
        self.state.lock().active_unit = unit;
    }

    fn bind_texture(&self, texture: Option<u32>) {
        let mut state = self.state.lock();
        let unit = state.active_unit;
        match texture {
            Some(texture) => state.bound_textures.insert(unit, texture),
            None => state.bound_textures.remove(&unit),
        };
        state.calls.push(GlCall::BindTexture(unit, texture));
    }

    fn tex_image_2d(&self, _internal_format: u32, width: u32, height: u32, format: u32, ty: u32, data: Option<&[u8]>) {
        let size = width as usize * height as usize * texel_size(format, ty);
        let mut state = self.state.lock();
        if let Some(texture) = state.bound_texture() {
            texture.width = width;
            texture.height = height;
            texture.data = data.map_or_else(|| vec![0; size], <[u8]>::to_vec);
        }
    }

    fn tex_sub_image_2d(&self, _width: u32, _height: u32, _format: u32, _ty: u32, data: &[u8]) {
        let mut state = self.state.lock();
        if let Some(texture) = state.bound_texture() {
            texture.data = data.to_vec();
        }
    }

    fn tex_parameter(&self, _name: u32, _value: i32) {}

    fn bind_image_texture(&self, unit: u32, texture: u32, _access: u32, _format: u32) {
        self.log(GlCall::BindImage(unit, texture));
    }

    fn create_sampler(&self) -> Result<u32, String> {
        let mut state = self.state.lock();
        let name = state.name();
        state.samplers.insert(name);
        Ok(name)
    }

    fn delete_sampler(&self, sampler: u32) {
        self.state.lock().samplers.remove(&sampler);
    }

    fn sampler_parameter_i32(&self, _sampler: u32, _name: u32, _value: i32) {}

    fn sampler_parameter_f32(&self, _sampler: u32, _name: u32, _value: f32) {}

    fn bind_sampler(&self, unit: u32, sampler: Option<u32>) {
        self.log(GlCall::BindSampler(unit, sampler));
    }

    fn create_shader(&self, _stage: u32) -> Result<u32, String> {
        let mut state = self.state.lock();
        let name = state.name();
        state.shaders.insert(name);
        Ok(name)
    }

    fn compile_shader(&self, _shader: u32, source: &str) -> Result<(), String> {
        if source.contains("#error") {
            Err("0:1: error: #error directive".to_string())
        } else {
            Ok(())
        }
    }

    fn delete_shader(&self, shader: u32) {
        self.state.lock().shaders.remove(&shader);
    }

    fn create_program(&self) -> Result<u32, String> {
        let mut state = self.state.lock();
        let name = state.name();
        state.programs.insert(name);
        Ok(name)
    }

    fn link_program(&self, _program: u32, shaders: &[u32]) -> Result<(), String> {
        let state = self.state.lock();
        if shaders.iter().all(|s| state.shaders.contains(s)) {
            Ok(())
        } else {
            Err("attached shader does not exist".to_string())
        }
    }

    fn delete_program(&self, program: u32) {
        self.state.lock().programs.remove(&program);
    }

    fn use_program(&self, program: Option<u32>) {
        self.log(GlCall::UseProgram(program));
    }

    fn create_framebuffer(&self) -> Result<u32, String> {
        let mut state = self.state.lock();
        let name = state.name();
        state.framebuffers.insert(name);
        Ok(name)
    }

    fn delete_framebuffer(&self, framebuffer: u32) {
        self.state.lock().framebuffers.remove(&framebuffer);
    }

    fn bind_framebuffer(&self, framebuffer: Option<u32>) {
        self.log(GlCall::BindFramebuffer(framebuffer));
    }

    fn framebuffer_texture(&self, _attachment: u32, _texture: Option<u32>) {}

    fn draw_buffers(&self, _buffers: &[u32]) {}

    fn framebuffer_complete(&self) -> bool {
        true
    }

    fn create_vertex_array(&self) -> Result<u32, String> {
        let mut state = self.state.lock();
        let name = state.name();
        state.vertex_arrays.insert(name);
        Ok(name)
    }

    fn delete_vertex_array(&self, vertex_array: u32) {
        self.state.lock().vertex_arrays.remove(&vertex_array);
    }

    fn bind_vertex_array(&self, vertex_array: Option<u32>) {
        self.log(GlCall::BindVertexArray(vertex_array));
    }

    fn vertex_attrib_pointer(&self, location: u32, components: i32, _ty: u32, _normalized: bool, stride: i32, offset: i32) {
        self.log(GlCall::VertexAttrib { location, components, stride, offset });
    }

    fn viewport(&self, x: i32, y: i32, width: i32, height: i32) {
        self.log(GlCall::Viewport(x, y, width, height));
    }

    fn scissor(&self, x: i32, y: i32, width: i32, height: i32) {
        self.log(GlCall::Scissor(x, y, width, height));
    }

    fn set_capability(&self, capability: u32, enabled: bool) {
        self.log(GlCall::Capability(capability, enabled));
    }

    fn depth_mask(&self, write: bool) {
        self.log(GlCall::DepthMask(write));
    }

    fn blend_func(&self, src: u32, dst: u32) {
        self.log(GlCall::BlendFunc(src, dst));
    }

    fn cull_face(&self, face: u32) {
        self.log(GlCall::CullFace(face));
    }

    fn front_face(&self, _winding: u32) {}

    fn polygon_mode(&self, mode: u32) {
        self.log(GlCall::PolygonMode(mode));
    }

    fn clear(&self, color: [f32; 4], depth: f32) {
        self.log(GlCall::Clear(color, depth));
    }

    fn draw_arrays(&self, mode: u32, count: i32, instances: i32) {
        self.log(GlCall::DrawArrays { mode, count, instances });
    }

    fn draw_elements(&self, mode: u32, count: i32, index_type: u32, instances: i32) {
        self.log(GlCall::DrawElements { mode, count, index_type, instances });
    }

    fn dispatch_compute(&self, x: u32, y: u32, z: u32) {
        self.log(GlCall::Dispatch(x, y, z));
    }

    fn memory_barrier(&self, barriers: u32) {
        self.log(GlCall::MemoryBarrier(barriers));
    }

    fn finish(&self) {
        self.log(GlCall::Finish);
    }
}

/// What a [`RecordingSurface`] has been asked to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceLog {
    /// Buffer swaps
    pub swaps: u64,
    /// Last swap interval set
    pub swap_interval: u32,
    /// Reported window size
    pub extent: Extent2D,
}

/// Window surface stand-in; clones share the same log
#[derive(Debug, Clone)]
pub struct RecordingSurface {
    log: Arc<Mutex<SurfaceLog>>,
}

impl RecordingSurface {
    /// Surface reporting `extent`
    pub fn new(extent: Extent2D) -> Self {
        Self { log: Arc::new(Mutex::new(SurfaceLog { swaps: 0, swap_interval: 1, extent })) }
    }

    /// Snapshot of the log
    pub fn log(&self) -> SurfaceLog {
        *self.log.lock()
    }

    /// Change the reported window size
    pub fn set_extent(&self, extent: Extent2D) {
        self.log.lock().extent = extent;
    }
}

impl GlSurface for RecordingSurface {
    fn swap_buffers(&mut self) -> Result<(), String> {
        self.log.lock().swaps += 1;
        Ok(())
    }

    fn set_swap_interval(&mut self, interval: u32) {
        self.log.lock().swap_interval = interval;
    }

    fn extent(&self) -> Extent2D {
        self.log.lock().extent
    }
}
