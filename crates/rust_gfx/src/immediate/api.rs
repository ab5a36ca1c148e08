//! The slice of OpenGL the immediate backend drives
//!
//! Enum arguments are raw GL constants from [`glow`]. Each method maps onto one GL
//! call or a fixed short sequence of them (compile + status + log, link + detach).

use std::fmt::Debug;

use glow::HasContext;

/// OpenGL 4.3 core entry points used by [`ImmediateBackend`](super::ImmediateBackend).
///
/// Implementations assume the context is current on the calling thread.
pub trait GlApi: 'static {
    /// Buffer object name
    type Buffer: Copy + PartialEq + Debug;
    /// Texture object name
    type Texture: Copy + PartialEq + Debug;
    /// Sampler object name
    type Sampler: Copy + PartialEq + Debug;
    /// Shader object name
    type Shader: Copy + PartialEq + Debug;
    /// Program object name
    type Program: Copy + PartialEq + Debug;
    /// Framebuffer object name
    type Framebuffer: Copy + PartialEq + Debug;
    /// Vertex array object name
    type VertexArray: Copy + PartialEq + Debug;

    /// glGenBuffers
    fn create_buffer(&self) -> Result<Self::Buffer, String>;
    /// glDeleteBuffers
    fn delete_buffer(&self, buffer: Self::Buffer);
    /// glBindBuffer
    fn bind_buffer(&self, target: u32, buffer: Option<Self::Buffer>);
    /// glBufferData, zero-filled when `data` is `None`
    fn buffer_data(&self, target: u32, size: usize, data: Option<&[u8]>, usage: u32);
    /// glBufferSubData
    fn buffer_sub_data(&self, target: u32, offset: usize, data: &[u8]);
    /// glBindBufferBase
    fn bind_buffer_base(&self, target: u32, index: u32, buffer: Option<Self::Buffer>);

    /// glGenTextures
    fn create_texture(&self) -> Result<Self::Texture, String>;
    /// glDeleteTextures
    fn delete_texture(&self, texture: Self::Texture);
    /// glActiveTexture(GL_TEXTURE0 + unit)
    fn active_texture(&self, unit: u32);
    /// glBindTexture on `GL_TEXTURE_2D`
    fn bind_texture(&self, texture: Option<Self::Texture>);
    /// glTexImage2D on `GL_TEXTURE_2D`, level 0
    fn tex_image_2d(&self, internal_format: u32, width: u32, height: u32, format: u32, ty: u32, data: Option<&[u8]>);
    /// glTexSubImage2D over the whole level 0
    fn tex_sub_image_2d(&self, width: u32, height: u32, format: u32, ty: u32, data: &[u8]);
    /// glTexParameteri on `GL_TEXTURE_2D`
    fn tex_parameter(&self, name: u32, value: i32);
    /// glBindImageTexture, level 0, not layered
    fn bind_image_texture(&self, unit: u32, texture: Self::Texture, access: u32, format: u32);

    /// glGenSamplers
    fn create_sampler(&self) -> Result<Self::Sampler, String>;
    /// glDeleteSamplers
    fn delete_sampler(&self, sampler: Self::Sampler);
    /// glSamplerParameteri
    fn sampler_parameter_i32(&self, sampler: Self::Sampler, name: u32, value: i32);
    /// glSamplerParameterf
    fn sampler_parameter_f32(&self, sampler: Self::Sampler, name: u32, value: f32);
    /// glBindSampler
    fn bind_sampler(&self, unit: u32, sampler: Option<Self::Sampler>);

    /// glCreateShader
    fn create_shader(&self, stage: u32) -> Result<Self::Shader, String>;
    /// Set the source and compile; the error carries the info log
    fn compile_shader(&self, shader: Self::Shader, source: &str) -> Result<(), String>;
    /// glDeleteShader
    fn delete_shader(&self, shader: Self::Shader);
    /// glCreateProgram
    fn create_program(&self) -> Result<Self::Program, String>;
    /// Attach, link, then detach; the error carries the info log
    fn link_program(&self, program: Self::Program, shaders: &[Self::Shader]) -> Result<(), String>;
    /// glDeleteProgram
    fn delete_program(&self, program: Self::Program);
    /// glUseProgram
    fn use_program(&self, program: Option<Self::Program>);

    /// glGenFramebuffers
    fn create_framebuffer(&self) -> Result<Self::Framebuffer, String>;
    /// glDeleteFramebuffers
    fn delete_framebuffer(&self, framebuffer: Self::Framebuffer);
    /// glBindFramebuffer on `GL_FRAMEBUFFER`; `None` is the window
    fn bind_framebuffer(&self, framebuffer: Option<Self::Framebuffer>);
    /// glFramebufferTexture2D on the bound framebuffer
    fn framebuffer_texture(&self, attachment: u32, texture: Option<Self::Texture>);
    /// glDrawBuffers
    fn draw_buffers(&self, buffers: &[u32]);
    /// Whether the bound framebuffer is complete
    fn framebuffer_complete(&self) -> bool;

    /// glGenVertexArrays
    fn create_vertex_array(&self) -> Result<Self::VertexArray, String>;
    /// glDeleteVertexArrays
    fn delete_vertex_array(&self, vertex_array: Self::VertexArray);
    /// glBindVertexArray
    fn bind_vertex_array(&self, vertex_array: Option<Self::VertexArray>);
    /// Enable `location` and point it into the bound `GL_ARRAY_BUFFER`
    fn vertex_attrib_pointer(&self, location: u32, components: i32, ty: u32, normalized: bool, stride: i32, offset: i32);

    /// glViewport
    fn viewport(&self, x: i32, y: i32, width: i32, height: i32);
    /// glScissor
    fn scissor(&self, x: i32, y: i32, width: i32, height: i32);
    /// glEnable / glDisable
    fn set_capability(&self, capability: u32, enabled: bool);
    /// glDepthMask
    fn depth_mask(&self, write: bool);
    /// glBlendFunc
    fn blend_func(&self, src: u32, dst: u32);
    /// glCullFace
    fn cull_face(&self, face: u32);
    /// glFrontFace
    fn front_face(&self, winding: u32);
    /// glPolygonMode on both faces
    fn polygon_mode(&self, mode: u32);
    /// Clear colour and depth of the bound framebuffer
    fn clear(&self, color: [f32; 4], depth: f32);

    /// glDrawArraysInstanced from vertex 0
    fn draw_arrays(&self, mode: u32, count: i32, instances: i32);
    /// glDrawElementsInstanced from offset 0
    fn draw_elements(&self, mode: u32, count: i32, index_type: u32, instances: i32);
    /// glDispatchCompute
    fn dispatch_compute(&self, x: u32, y: u32, z: u32);
    /// glMemoryBarrier
    fn memory_barrier(&self, barriers: u32);
    /// glFinish
    fn finish(&self);
}

// SAFETY (whole impl): the context is current on this thread and every object
// name passed in was created by it.
impl GlApi for glow::Context {
    type Buffer = <Self as HasContext>::Buffer;
    type Texture = <Self as HasContext>::Texture;
    type Sampler = <Self as HasContext>::Sampler;
    type Shader = <Self as HasContext>::Shader;
    type Program = <Self as HasContext>::Program;
    type Framebuffer = <Self as HasContext>::Framebuffer;
    type VertexArray = <Self as HasContext>::VertexArray;

    fn create_buffer(&self) -> Result<Self::Buffer, String> {
        unsafe { HasContext::create_buffer(self) }
    }

    fn delete_buffer(&self, buffer: Self::Buffer) {
        unsafe { HasContext::delete_buffer(self, buffer) }
    }

    fn bind_buffer(&self, target: u32, buffer: Option<Self::Buffer>) {
        unsafe { HasContext::bind_buffer(self, target, buffer) }
    }

    fn buffer_data(&self, target: u32, size: usize, data: Option<&[u8]>, usage: u32) {
        unsafe {
            match data {
                Some(data) if data.len() == size => self.buffer_data_u8_slice(target, data, usage),
                Some(data) => {
                    self.buffer_data_size(target, size as i32, usage);
                    self.buffer_sub_data_u8_slice(target, 0, data);
                }
                None => self.buffer_data_size(target, size as i32, usage),
            }
        }
    }

    fn buffer_sub_data(&self, target: u32, offset: usize, data: &[u8]) {
        unsafe { self.buffer_sub_data_u8_slice(target, offset as i32, data) }
    }

    fn bind_buffer_base(&self, target: u32, index: u32, buffer: Option<Self::Buffer>) {
        unsafe { HasContext::bind_buffer_base(self, target, index, buffer) }
    }

    fn create_texture(&self) -> Result<Self::Texture, String> {
        unsafe { HasContext::create_texture(self) }
    }

    fn delete_texture(&self, texture: Self::Texture) {
        unsafe { HasContext::delete_texture(self, texture) }
    }

    fn active_texture(&self, unit: u32) {
        unsafe { HasContext::active_texture(self, glow::TEXTURE0 + unit) }
    }

    fn bind_texture(&self, texture: Option<Self::Texture>) {
        unsafe { HasContext::bind_texture(self, glow::TEXTURE_2D, texture) }
    }

    fn tex_image_2d(&self, internal_format: u32, width: u32, height: u32, format: u32, ty: u32, data: Option<&[u8]>) {
        unsafe {
            HasContext::tex_image_2d(
                self,
                glow::TEXTURE_2D,
                0,
                internal_format as i32,
                width as i32,
                height as i32,
                0,
                format,
                ty,
                data,
            );
        }
    }

    fn tex_sub_image_2d(&self, width: u32, height: u32, format: u32, ty: u32, data: &[u8]) {
        unsafe {
            HasContext::tex_sub_image_2d(
                self,
                glow::TEXTURE_2D,
                0,
                0,
                0,
                width as i32,
                height as i32,
                format,
                ty,
                glow::PixelUnpackData::Slice(data),
            );
        }
    }

    fn tex_parameter(&self, name: u32, value: i32) {
        unsafe { self.tex_parameter_i32(glow::TEXTURE_2D, name, value) }
    }

    fn bind_image_texture(&self, unit: u32, texture: Self::Texture, access: u32, format: u32) {
        unsafe { HasContext::bind_image_texture(self, unit, texture, 0, false, 0, access, format) }
    }

    fn create_sampler(&self) -> Result<Self::Sampler, String> {
        unsafe { HasContext::create_sampler(self) }
    }

    fn delete_sampler(&self, sampler: Self::Sampler) {
        unsafe { HasContext::delete_sampler(self, sampler) }
    }

    fn sampler_parameter_i32(&self, sampler: Self::Sampler, name: u32, value: i32) {
        unsafe { HasContext::sampler_parameter_i32(self, sampler, name, value) }
    }

    fn sampler_parameter_f32(&self, sampler: Self::Sampler, name: u32, value: f32) {
        unsafe { HasContext::sampler_parameter_f32(self, sampler, name, value) }
    }

    fn bind_sampler(&self, unit: u32, sampler: Option<Self::Sampler>) {
        unsafe { HasContext::bind_sampler(self, unit, sampler) }
    }

    fn create_shader(&self, stage: u32) -> Result<Self::Shader, String> {
        unsafe { HasContext::create_shader(self, stage) }
    }

    fn compile_shader(&self, shader: Self::Shader, source: &str) -> Result<(), String> {
        unsafe {
            self.shader_source(shader, source);
            HasContext::compile_shader(self, shader);
            if self.get_shader_compile_status(shader) {
                Ok(())
            } else {
                Err(self.get_shader_info_log(shader))
            }
        }
    }

    fn delete_shader(&self, shader: Self::Shader) {
        unsafe { HasContext::delete_shader(self, shader) }
    }

    fn create_program(&self) -> Result<Self::Program, String> {
        unsafe { HasContext::create_program(self) }
    }

    fn link_program(&self, program: Self::Program, shaders: &[Self::Shader]) -> Result<(), String> {
        unsafe {
            for shader in shaders {
                self.attach_shader(program, *shader);
            }
            HasContext::link_program(self, program);
            for shader in shaders {
                self.detach_shader(program, *shader);
            }
            if self.get_program_link_status(program) {
                Ok(())
            } else {
                Err(self.get_program_info_log(program))
            }
        }
    }

    fn delete_program(&self, program: Self::Program) {
        unsafe { HasContext::delete_program(self, program) }
    }

    fn use_program(&self, program: Option<Self::Program>) {
        unsafe { HasContext::use_program(self, program) }
    }

    fn create_framebuffer(&self) -> Result<Self::Framebuffer, String> {
        unsafe { HasContext::create_framebuffer(self) }
    }

    fn delete_framebuffer(&self, framebuffer: Self::Framebuffer) {
        unsafe { HasContext::delete_framebuffer(self, framebuffer) }
    }

    fn bind_framebuffer(&self, framebuffer: Option<Self::Framebuffer>) {
        unsafe { HasContext::bind_framebuffer(self, glow::FRAMEBUFFER, framebuffer) }
    }

    fn framebuffer_texture(&self, attachment: u32, texture: Option<Self::Texture>) {
        unsafe { self.framebuffer_texture_2d(glow::FRAMEBUFFER, attachment, glow::TEXTURE_2D, texture, 0) }
    }

    fn draw_buffers(&self, buffers: &[u32]) {
        unsafe { HasContext::draw_buffers(self, buffers) }
    }

    fn framebuffer_complete(&self) -> bool {
        unsafe { self.check_framebuffer_status(glow::FRAMEBUFFER) == glow::FRAMEBUFFER_COMPLETE }
    }

    fn create_vertex_array(&self) -> Result<Self::VertexArray, String> {
        unsafe { HasContext::create_vertex_array(self) }
    }

    fn delete_vertex_array(&self, vertex_array: Self::VertexArray) {
        unsafe { HasContext::delete_vertex_array(self, vertex_array) }
    }

    fn bind_vertex_array(&self, vertex_array: Option<Self::VertexArray>) {
        unsafe { HasContext::bind_vertex_array(self, vertex_array) }
    }

    fn vertex_attrib_pointer(&self, location: u32, components: i32, ty: u32, normalized: bool, stride: i32, offset: i32) {
        unsafe {
            self.enable_vertex_attrib_array(location);
            self.vertex_attrib_pointer_f32(location, components, ty, normalized, stride, offset);
        }
    }

    fn viewport(&self, x: i32, y: i32, width: i32, height: i32) {
        unsafe { HasContext::viewport(self, x, y, width, height) }
    }

    fn scissor(&self, x: i32, y: i32, width: i32, height: i32) {
        unsafe { HasContext::scissor(self, x, y, width, height) }
    }

    fn set_capability(&self, capability: u32, enabled: bool) {
        unsafe {
            if enabled {
                self.enable(capability);
            } else {
                self.disable(capability);
            }
        }
    }

    fn depth_mask(&self, write: bool) {
        unsafe { HasContext::depth_mask(self, write) }
    }

    fn blend_func(&self, src: u32, dst: u32) {
        unsafe { HasContext::blend_func(self, src, dst) }
    }

    fn cull_face(&self, face: u32) {
        unsafe { HasContext::cull_face(self, face) }
    }

    fn front_face(&self, winding: u32) {
        unsafe { HasContext::front_face(self, winding) }
    }

    fn polygon_mode(&self, mode: u32) {
        unsafe { HasContext::polygon_mode(self, glow::FRONT_AND_BACK, mode) }
    }

    fn clear(&self, color: [f32; 4], depth: f32) {
        let [r, g, b, a] = color;
        unsafe {
            self.clear_color(r, g, b, a);
            self.clear_depth_f32(depth);
            HasContext::clear(self, glow::COLOR_BUFFER_BIT | glow::DEPTH_BUFFER_BIT);
        }
    }

    fn draw_arrays(&self, mode: u32, count: i32, instances: i32) {
        unsafe { self.draw_arrays_instanced(mode, 0, count, instances) }
    }

    fn draw_elements(&self, mode: u32, count: i32, index_type: u32, instances: i32) {
        unsafe { self.draw_elements_instanced(mode, count, index_type, 0, instances) }
    }

    fn dispatch_compute(&self, x: u32, y: u32, z: u32) {
        unsafe { HasContext::dispatch_compute(self, x, y, z) }
    }

    fn memory_barrier(&self, barriers: u32) {
        unsafe { HasContext::memory_barrier(self, barriers) }
    }

    fn finish(&self) {
        unsafe { HasContext::finish(self) }
    }
}
