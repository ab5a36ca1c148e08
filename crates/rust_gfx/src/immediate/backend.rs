//! The immediate backend
//!
//! OpenGL executes commands as they are issued, so there is no command buffer,
//! frame ring or swapchain to manage: `begin_record` only checks the window size
//! and `end_record` swaps buffers. The registries and contract checks mirror the
//! explicit backend so callers see the same errors on either API.

use std::any::Any;

use slotmap::SlotMap;

use super::convert;
use super::{GlApi, GlSurface};
use crate::backend::{Backend, BackendKind};
use crate::config::GfxConfig;
use crate::error::{GfxError, GfxResult};
use crate::explicit::FrameStats;
use crate::pipeline::{
    ComputePipelineInfo, FixedFunctionState, GraphicsPipelineInfo, PipelineHooks, PipelineKind, RayTracingPipelineInfo,
    VertexLayout,
};
use crate::types::{
    BindingType, BoundResource, BufferInfo, BufferKey, BufferMode, BufferUsage, ClearValues, Extent2D, Extent3D,
    Format, FrameInfo, FramebufferInfo, FramebufferKey, ImageInfo, ImageKey, ImageUsage, MeshDraw, PipelineKey,
    ResourceBinding, ResourceLayout, RtInstance, RtMeshKey, RtSceneKey, SamplerInfo, SamplerKey, ShaderKey,
    ShaderSource, ShaderStage, TriangleGeometry,
};

const SHUT_DOWN: GfxError = GfxError::InvalidUsage("context is shut down");
const NOT_RECORDING: GfxError = GfxError::InvalidUsage("command issued outside begin_record/end_record");
const RECORDING: GfxError = GfxError::InvalidUsage("resources are created and destroyed outside frame recording");

/// Uniform block binding that receives push constant bytes
pub const PUSH_CONSTANT_BINDING: u32 = 15;
/// Largest push constant block the immediate backend emulates
pub const MAX_PUSH_CONSTANT_SIZE: u32 = 256;

/// Colour format reported for the window framebuffer
const WINDOW_COLOR_FORMAT: Format = Format::Rgba8Srgb;
/// Depth format requested alongside the window
const WINDOW_DEPTH_FORMAT: Format = Format::D32Float;

fn gl_error(message: String) -> GfxError {
    GfxError::Unknown(message)
}

struct GlBuffer<G: GlApi> {
    buffer: G::Buffer,
    info: BufferInfo,
}

struct GlImage<G: GlApi> {
    texture: G::Texture,
    info: ImageInfo,
    /// Owned by a framebuffer
    attachment: bool,
}

struct GlShader<G: GlApi> {
    shader: G::Shader,
    stage: ShaderStage,
}

enum GlTarget<G: GlApi> {
    Window,
    Offscreen {
        framebuffer: G::Framebuffer,
        colors: Vec<ImageKey>,
        depth: Option<ImageKey>,
    },
}

struct GlFramebuffer<G: GlApi> {
    target: GlTarget<G>,
    info: FramebufferInfo,
    pipelines: Vec<PipelineKey>,
}

impl<G: GlApi> GlFramebuffer<G> {
    fn handle(&self) -> Option<G::Framebuffer> {
        match &self.target {
            GlTarget::Window => None,
            GlTarget::Offscreen { framebuffer, .. } => Some(*framebuffer),
        }
    }

    fn attachments(&self) -> Vec<ImageKey> {
        match &self.target {
            GlTarget::Window => Vec::new(),
            GlTarget::Offscreen { colors, depth, .. } => colors.iter().copied().chain(*depth).collect(),
        }
    }
}

struct GlPipeline<G: GlApi> {
    kind: PipelineKind,
    program: G::Program,
    vertex_array: Option<G::VertexArray>,
    framebuffer: FramebufferKey,
    vertex_layout: VertexLayout,
    state: FixedFunctionState,
    resources: ResourceLayout,
    hooks: Box<dyn PipelineHooks>,
}

impl<G: GlApi> GlPipeline<G> {
    /// GL reads viewport state at bind time, so only the hook needs to run
    fn resize(&mut self, extent: Extent2D) {
        match self.kind {
            PipelineKind::Graphics => self.hooks.on_resize(&mut self.state, extent),
            _ => {
                let mut scratch = FixedFunctionState::default();
                self.hooks.on_resize(&mut scratch, extent);
            }
        }
    }

    fn destroy(mut self, gl: &G) {
        self.hooks.on_destroy();
        if let Some(vertex_array) = self.vertex_array {
            gl.delete_vertex_array(vertex_array);
        }
        gl.delete_program(self.program);
    }
}

#[derive(Default)]
struct ActiveFrame {
    render_pass: Option<FramebufferKey>,
    bound: Option<PipelineKey>,
    default_pass_done: bool,
}

/// Immediate backend over any [`GlApi`]
pub struct ImmediateBackend<G: GlApi> {
    gl: G,
    surface: Box<dyn GlSurface>,
    push_buffer: Option<G::Buffer>,

    buffers: SlotMap<BufferKey, GlBuffer<G>>,
    images: SlotMap<ImageKey, GlImage<G>>,
    samplers: SlotMap<SamplerKey, G::Sampler>,
    shaders: SlotMap<ShaderKey, GlShader<G>>,
    framebuffers: SlotMap<FramebufferKey, GlFramebuffer<G>>,
    pipelines: SlotMap<PipelineKey, GlPipeline<G>>,
    default_framebuffer: FramebufferKey,

    frame: Option<ActiveFrame>,
    stats: FrameStats,
    shut_down: bool,
}

impl<G: GlApi> ImmediateBackend<G> {
    /// Take over a GL context that is current on this thread
    pub fn new(gl: G, mut surface: Box<dyn GlSurface>, config: &GfxConfig) -> GfxResult<Self> {
        surface.set_swap_interval(u32::from(config.vsync));
        let extent = surface.extent();

        let push_buffer = gl.create_buffer().map_err(gl_error)?;
        gl.bind_buffer(glow::UNIFORM_BUFFER, Some(push_buffer));
        gl.buffer_data(glow::UNIFORM_BUFFER, MAX_PUSH_CONSTANT_SIZE as usize, None, glow::DYNAMIC_DRAW);
        gl.bind_buffer(glow::UNIFORM_BUFFER, None);

        let mut framebuffers = SlotMap::with_key();
        let default_framebuffer = framebuffers.insert(GlFramebuffer {
            target: GlTarget::Window,
            info: FramebufferInfo {
                extent,
                color_formats: vec![WINDOW_COLOR_FORMAT],
                depth_format: Some(WINDOW_DEPTH_FORMAT),
            },
            pipelines: Vec::new(),
        });

        log::info!(
            "Immediate backend ready: {}x{}, vsync {}",
            extent.width,
            extent.height,
            if config.vsync { "on" } else { "off" }
        );

        Ok(Self {
            gl,
            surface,
            push_buffer: Some(push_buffer),
            buffers: SlotMap::with_key(),
            images: SlotMap::with_key(),
            samplers: SlotMap::with_key(),
            shaders: SlotMap::with_key(),
            framebuffers,
            pipelines: SlotMap::with_key(),
            default_framebuffer,
            frame: None,
            stats: FrameStats::default(),
            shut_down: false,
        })
    }

    // --- diagnostics --------------------------------------------------------

    /// The GL implementation this backend drives
    pub fn gl(&self) -> &G {
        &self.gl
    }

    /// Frame counters
    pub fn frame_stats(&self) -> FrameStats {
        self.stats
    }

    /// GL name of a buffer
    pub fn buffer_handle(&self, buffer: BufferKey) -> Option<G::Buffer> {
        self.buffers.get(buffer).map(|b| b.buffer)
    }

    /// GL name of an image's texture
    pub fn image_handle(&self, image: ImageKey) -> Option<G::Texture> {
        self.images.get(image).map(|i| i.texture)
    }

    /// GL name of a pipeline's program
    pub fn program_handle(&self, pipeline: PipelineKey) -> Option<G::Program> {
        self.pipelines.get(pipeline).map(|p| p.program)
    }

    /// GL name of an offscreen framebuffer; `None` for the window or unknown keys
    pub fn framebuffer_handle(&self, framebuffer: FramebufferKey) -> Option<G::Framebuffer> {
        self.framebuffers.get(framebuffer).and_then(GlFramebuffer::handle)
    }

    /// Fixed-function state of a graphics pipeline as last adjusted by its hooks
    pub fn graphics_state(&self, pipeline: PipelineKey) -> Option<&FixedFunctionState> {
        self.pipelines
            .get(pipeline)
            .filter(|p| p.kind == PipelineKind::Graphics)
            .map(|p| &p.state)
    }

    // --- state checks -------------------------------------------------------

    fn usable(&self) -> GfxResult<()> {
        if self.shut_down {
            return Err(SHUT_DOWN);
        }
        Ok(())
    }

    fn outside_frame(&self) -> GfxResult<()> {
        self.usable()?;
        if self.frame.is_some() {
            return Err(RECORDING);
        }
        Ok(())
    }

    fn active_frame(&self) -> GfxResult<&ActiveFrame> {
        self.usable()?;
        self.frame.as_ref().ok_or(NOT_RECORDING)
    }

    fn frame_info(&self) -> FrameInfo {
        FrameInfo { frame_index: 0, image_index: 0, extent: self.extent() }
    }

    // --- textures -----------------------------------------------------------

    fn allocate_texture(&self, info: &ImageInfo, data: Option<&[u8]>) -> GfxResult<G::Texture> {
        let format = convert::texture_format(info.format);
        let texture = self.gl.create_texture().map_err(gl_error)?;
        self.gl.active_texture(0);
        self.gl.bind_texture(Some(texture));
        self.gl.tex_image_2d(format.internal, info.extent.width, info.extent.height, format.format, format.ty, data);
        // Single level; sampler objects override filtering
        self.gl.tex_parameter(glow::TEXTURE_MAX_LEVEL, 0);
        self.gl.bind_texture(None);
        Ok(texture)
    }

    fn attach(&mut self, format: Format, extent: Extent2D, attachment: u32) -> GfxResult<ImageKey> {
        let usage = if format.is_depth() {
            ImageUsage::DEPTH_ATTACHMENT | ImageUsage::SAMPLED
        } else {
            ImageUsage::COLOR_ATTACHMENT | ImageUsage::SAMPLED
        };
        let info = ImageInfo { extent: extent.into(), format, usage };
        let texture = self.allocate_texture(&info, None)?;
        self.gl.framebuffer_texture(attachment, Some(texture));
        Ok(self.images.insert(GlImage { texture, info, attachment: true }))
    }

    fn release_images(&mut self, keys: &[ImageKey]) {
        for key in keys {
            if let Some(image) = self.images.remove(*key) {
                self.gl.delete_texture(image.texture);
            }
        }
    }

    // --- pipelines ----------------------------------------------------------

    fn shader_for(&self, key: ShaderKey, stage: ShaderStage) -> GfxResult<G::Shader> {
        let shader = self
            .shaders
            .get(key)
            .ok_or(GfxError::InvalidUsage("pipeline refers to a destroyed shader"))?;
        if shader.stage != stage {
            return Err(GfxError::InvalidUsage("shader used for the wrong stage"));
        }
        Ok(shader.shader)
    }

    fn link(&self, shaders: &[G::Shader]) -> GfxResult<G::Program> {
        let program = self.gl.create_program().map_err(gl_error)?;
        if let Err(info_log) = self.gl.link_program(program, shaders) {
            log::error!("Program link failed: {info_log}");
            self.gl.delete_program(program);
            return Err(GfxError::BadShaderCode);
        }
        Ok(program)
    }

    fn check_push_constants(resources: &ResourceLayout) -> GfxResult<()> {
        if resources.push_constant_size > MAX_PUSH_CONSTANT_SIZE {
            return Err(GfxError::InvalidUsage("push constant block larger than the immediate backend supports"));
        }
        Ok(())
    }

    fn register_pipeline(&mut self, pipeline: GlPipeline<G>) -> PipelineKey {
        let framebuffer = pipeline.framebuffer;
        let key = self.pipelines.insert(pipeline);
        if let Some(fb) = self.framebuffers.get_mut(framebuffer) {
            fb.pipelines.push(key);
        }
        log::debug!("Created pipeline {key:?}");
        key
    }

    fn release_pipeline(&mut self, key: PipelineKey, pipeline: GlPipeline<G>) {
        if let Some(fb) = self.framebuffers.get_mut(pipeline.framebuffer) {
            fb.pipelines.retain(|p| *p != key);
        }
        pipeline.destroy(&self.gl);
    }

    fn run_resize_hooks(&mut self, framebuffer: FramebufferKey) {
        let Some(fb) = self.framebuffers.get(framebuffer) else {
            return;
        };
        let extent = fb.info.extent;
        for key in &fb.pipelines {
            if let Some(pipeline) = self.pipelines.get_mut(*key) {
                pipeline.resize(extent);
            }
        }
    }

    fn apply_state(&self, state: &FixedFunctionState, extent: Extent2D) {
        let gl = &self.gl;
        match convert::cull_face(state.cull_mode) {
            Some(face) => {
                gl.set_capability(glow::CULL_FACE, true);
                gl.cull_face(face);
            }
            None => gl.set_capability(glow::CULL_FACE, false),
        }
        gl.front_face(convert::front_face(state.front_face));
        gl.polygon_mode(convert::polygon_mode(state.polygon_mode));
        gl.set_capability(glow::DEPTH_TEST, state.depth_test);
        gl.depth_mask(state.depth_write);
        match convert::blend(state.blend) {
            Some((src, dst)) => {
                gl.set_capability(glow::BLEND, true);
                gl.blend_func(src, dst);
            }
            None => gl.set_capability(glow::BLEND, false),
        }

        if state.dynamic_viewport {
            gl.viewport(0, 0, extent.width as i32, extent.height as i32);
            gl.set_capability(glow::SCISSOR_TEST, false);
        } else {
            let v = &state.viewport;
            gl.viewport(v.x as i32, v.y as i32, v.width as i32, v.height as i32);
            let s = &state.scissor;
            gl.set_capability(glow::SCISSOR_TEST, true);
            gl.scissor(s.x, s.y, s.width as i32, s.height as i32);
        }
    }

    fn bind_resources(&self, layout: &ResourceLayout, bindings: &[ResourceBinding]) -> GfxResult<()> {
        for b in bindings {
            let declared = layout
                .bindings
                .iter()
                .find(|info| info.binding == b.binding)
                .ok_or(GfxError::InvalidUsage("binding not declared by the pipeline"))?;
            let buffer = |key: BufferKey| {
                self.buffers
                    .get(key)
                    .map(|b| b.buffer)
                    .ok_or(GfxError::InvalidUsage("binding refers to a destroyed buffer"))
            };
            let image = |key: ImageKey| {
                self.images
                    .get(key)
                    .ok_or(GfxError::InvalidUsage("binding refers to a destroyed image"))
            };
            match (declared.ty, b.resource) {
                (BindingType::UniformBuffer, BoundResource::UniformBuffer(key)) => {
                    self.gl.bind_buffer_base(glow::UNIFORM_BUFFER, b.binding, Some(buffer(key)?));
                }
                (BindingType::StorageBuffer, BoundResource::StorageBuffer(key)) => {
                    self.gl.bind_buffer_base(glow::SHADER_STORAGE_BUFFER, b.binding, Some(buffer(key)?));
                }
                (BindingType::SampledImage, BoundResource::SampledImage(key, sampler)) => {
                    let texture = image(key)?.texture;
                    let sampler = *self
                        .samplers
                        .get(sampler)
                        .ok_or(GfxError::InvalidUsage("binding refers to a destroyed sampler"))?;
                    self.gl.active_texture(b.binding);
                    self.gl.bind_texture(Some(texture));
                    self.gl.bind_sampler(b.binding, Some(sampler));
                }
                (BindingType::StorageImage, BoundResource::StorageImage(key)) => {
                    let image = image(key)?;
                    let format = convert::texture_format(image.info.format);
                    self.gl.bind_image_texture(b.binding, image.texture, glow::READ_WRITE, format.internal);
                }
                (BindingType::AccelerationStructure, BoundResource::Scene(_)) => {
                    return Err(GfxError::FeatureNotSupported);
                }
                _ => return Err(GfxError::InvalidUsage("resource does not match the binding type")),
            }
        }
        Ok(())
    }

    fn push_constants(&self, pipeline: &GlPipeline<G>, data: &[u8]) -> GfxResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        if data.len() as u64 > u64::from(pipeline.resources.push_constant_size) {
            return Err(GfxError::InvalidUsage("push constants larger than the declared block"));
        }
        let buffer = self.push_buffer.ok_or(SHUT_DOWN)?;
        self.gl.bind_buffer(glow::UNIFORM_BUFFER, Some(buffer));
        self.gl.buffer_sub_data(glow::UNIFORM_BUFFER, 0, data);
        self.gl.bind_buffer_base(glow::UNIFORM_BUFFER, PUSH_CONSTANT_BINDING, Some(buffer));
        Ok(())
    }

    fn bound_pipeline(&self, kind: PipelineKind) -> GfxResult<&GlPipeline<G>> {
        let frame = self.active_frame()?;
        frame
            .bound
            .and_then(|key| self.pipelines.get(key))
            .filter(|p| p.kind == kind)
            .ok_or(GfxError::InvalidUsage("no pipeline of the required kind is bound"))
    }
}

impl<G: GlApi> Backend for ImmediateBackend<G> {
    fn kind(&self) -> BackendKind {
        BackendKind::Immediate
    }

    fn create_buffer(&mut self, info: &BufferInfo, data: Option<&[u8]>) -> GfxResult<BufferKey> {
        self.outside_frame()?;
        if info.size == 0 {
            return Err(GfxError::InvalidUsage("zero-sized buffer"));
        }
        if data.is_some_and(|d| d.len() as u64 > info.size) {
            return Err(GfxError::InvalidUsage("initial data larger than the buffer"));
        }
        let usage = match info.mode {
            BufferMode::Constant => glow::STATIC_DRAW,
            BufferMode::Dynamic => glow::DYNAMIC_DRAW,
        };
        let buffer = self.gl.create_buffer().map_err(gl_error)?;
        self.gl.bind_buffer(glow::COPY_WRITE_BUFFER, Some(buffer));
        self.gl.buffer_data(glow::COPY_WRITE_BUFFER, info.size as usize, data, usage);
        self.gl.bind_buffer(glow::COPY_WRITE_BUFFER, None);
        let key = self.buffers.insert(GlBuffer { buffer, info: *info });
        log::debug!("Created buffer {key:?} ({} bytes, {:?})", info.size, info.mode);
        Ok(key)
    }

    fn update_buffer(&mut self, buffer: BufferKey, offset: u64, data: &[u8]) -> GfxResult<()> {
        self.usable()?;
        if self.frame.as_ref().is_some_and(|f| f.render_pass.is_some()) {
            return Err(GfxError::InvalidUsage("buffer updates are recorded outside render passes"));
        }
        let resource = self.buffers.get(buffer).ok_or(GfxError::InvalidUsage("unknown buffer"))?;
        if offset.checked_add(data.len() as u64).map_or(true, |end| end > resource.info.size) {
            return Err(GfxError::InvalidUsage("update past the end of the buffer"));
        }
        self.gl.bind_buffer(glow::COPY_WRITE_BUFFER, Some(resource.buffer));
        self.gl.buffer_sub_data(glow::COPY_WRITE_BUFFER, offset as usize, data);
        self.gl.bind_buffer(glow::COPY_WRITE_BUFFER, None);
        Ok(())
    }

    fn destroy_buffer(&mut self, buffer: BufferKey) -> GfxResult<()> {
        self.outside_frame()?;
        let buffer = self.buffers.remove(buffer).ok_or(GfxError::InvalidUsage("unknown buffer"))?;
        self.gl.delete_buffer(buffer.buffer);
        Ok(())
    }

    fn create_image(&mut self, info: &ImageInfo, data: Option<&[u8]>) -> GfxResult<ImageKey> {
        self.outside_frame()?;
        if info.extent.texel_count() == 0 {
            return Err(GfxError::InvalidUsage("zero-sized image"));
        }
        if info.extent.depth != 1 {
            return Err(GfxError::FeatureNotSupported);
        }
        if data.is_some_and(|d| d.len() as u64 != info.byte_size()) {
            return Err(GfxError::InvalidUsage("image data size does not match its extent"));
        }
        let texture = self.allocate_texture(info, data)?;
        let key = self.images.insert(GlImage { texture, info: *info, attachment: false });
        log::debug!("Created image {key:?} ({}x{} {:?})", info.extent.width, info.extent.height, info.format);
        Ok(key)
    }

    fn update_image(&mut self, image: ImageKey, data: &[u8]) -> GfxResult<()> {
        self.outside_frame()?;
        let resource = self.images.get(image).ok_or(GfxError::InvalidUsage("unknown image"))?;
        if data.len() as u64 != resource.info.byte_size() {
            return Err(GfxError::InvalidUsage("image data size does not match its extent"));
        }
        let format = convert::texture_format(resource.info.format);
        let extent = resource.info.extent;
        self.gl.active_texture(0);
        self.gl.bind_texture(Some(resource.texture));
        self.gl.tex_sub_image_2d(extent.width, extent.height, format.format, format.ty, data);
        self.gl.bind_texture(None);
        Ok(())
    }

    fn destroy_image(&mut self, image: ImageKey) -> GfxResult<()> {
        self.outside_frame()?;
        if self.images.get(image).is_some_and(|i| i.attachment) {
            return Err(GfxError::InvalidUsage("attachment images are destroyed with their framebuffer"));
        }
        let image = self.images.remove(image).ok_or(GfxError::InvalidUsage("unknown image"))?;
        self.gl.delete_texture(image.texture);
        Ok(())
    }

    fn create_sampler(&mut self, info: &SamplerInfo) -> GfxResult<SamplerKey> {
        self.outside_frame()?;
        let sampler = self.gl.create_sampler().map_err(gl_error)?;
        let address = convert::address_mode(info.address_mode);
        self.gl.sampler_parameter_i32(sampler, glow::TEXTURE_MAG_FILTER, convert::filter(info.mag_filter));
        self.gl.sampler_parameter_i32(sampler, glow::TEXTURE_MIN_FILTER, convert::filter(info.min_filter));
        for wrap in [glow::TEXTURE_WRAP_S, glow::TEXTURE_WRAP_T, glow::TEXTURE_WRAP_R] {
            self.gl.sampler_parameter_i32(sampler, wrap, address);
        }
        if let Some(anisotropy) = info.max_anisotropy {
            self.gl.sampler_parameter_f32(sampler, glow::TEXTURE_MAX_ANISOTROPY, anisotropy);
        }
        Ok(self.samplers.insert(sampler))
    }

    fn destroy_sampler(&mut self, sampler: SamplerKey) -> GfxResult<()> {
        self.outside_frame()?;
        let sampler = self.samplers.remove(sampler).ok_or(GfxError::InvalidUsage("unknown sampler"))?;
        self.gl.delete_sampler(sampler);
        Ok(())
    }

    fn create_shader(&mut self, stage: ShaderStage, source: &ShaderSource) -> GfxResult<ShaderKey> {
        self.outside_frame()?;
        let ShaderSource::Glsl(text) = source else {
            return Err(GfxError::InvalidUsage("immediate backend consumes GLSL"));
        };
        let ty = convert::shader_stage(stage).ok_or(GfxError::FeatureNotSupported)?;
        let shader = self.gl.create_shader(ty).map_err(gl_error)?;
        if let Err(info_log) = self.gl.compile_shader(shader, text) {
            log::error!("{stage:?} shader failed to compile: {info_log}");
            self.gl.delete_shader(shader);
            return Err(GfxError::BadShaderCode);
        }
        Ok(self.shaders.insert(GlShader { shader, stage }))
    }

    fn destroy_shader(&mut self, shader: ShaderKey) -> GfxResult<()> {
        self.outside_frame()?;
        // Linked programs keep their own copy of the code
        let shader = self.shaders.remove(shader).ok_or(GfxError::InvalidUsage("unknown shader"))?;
        self.gl.delete_shader(shader.shader);
        Ok(())
    }

    fn default_framebuffer(&self) -> FramebufferKey {
        self.default_framebuffer
    }

    fn create_framebuffer(&mut self, info: &FramebufferInfo) -> GfxResult<FramebufferKey> {
        self.outside_frame()?;
        info.validate()?;
        let framebuffer = self.gl.create_framebuffer().map_err(gl_error)?;
        self.gl.bind_framebuffer(Some(framebuffer));

        let mut colors = Vec::with_capacity(info.color_formats.len());
        let mut depth = None;
        let mut attached = Ok(());
        for (i, format) in info.color_formats.iter().enumerate() {
            match self.attach(*format, info.extent, glow::COLOR_ATTACHMENT0 + i as u32) {
                Ok(key) => colors.push(key),
                Err(e) => {
                    attached = Err(e);
                    break;
                }
            }
        }
        if let Some(format) = info.depth_format.filter(|_| attached.is_ok()) {
            match self.attach(format, info.extent, glow::DEPTH_ATTACHMENT) {
                Ok(key) => depth = Some(key),
                Err(e) => attached = Err(e),
            }
        }
        if attached.is_ok() {
            let draw_buffers: Vec<u32> = (0..colors.len() as u32).map(|i| glow::COLOR_ATTACHMENT0 + i).collect();
            self.gl.draw_buffers(&draw_buffers);
            if !self.gl.framebuffer_complete() {
                log::error!("Framebuffer with {:?} / {:?} is incomplete", info.color_formats, info.depth_format);
                attached = Err(GfxError::FormatNotSupported);
            }
        }
        self.gl.bind_framebuffer(None);

        if let Err(e) = attached {
            let images: Vec<ImageKey> = colors.into_iter().chain(depth).collect();
            self.release_images(&images);
            self.gl.delete_framebuffer(framebuffer);
            return Err(e);
        }
        let key = self.framebuffers.insert(GlFramebuffer {
            target: GlTarget::Offscreen { framebuffer, colors, depth },
            info: info.clone(),
            pipelines: Vec::new(),
        });
        log::debug!("Created framebuffer {key:?} ({}x{})", info.extent.width, info.extent.height);
        Ok(key)
    }

    fn resize_framebuffer(&mut self, framebuffer: FramebufferKey, extent: Extent2D) -> GfxResult<()> {
        self.outside_frame()?;
        if framebuffer == self.default_framebuffer {
            return Err(GfxError::InvalidUsage("the default framebuffer follows the window"));
        }
        if extent.is_zero() {
            return Err(GfxError::ZeroFramebufferSize);
        }
        let fb = self
            .framebuffers
            .get_mut(framebuffer)
            .ok_or(GfxError::InvalidUsage("unknown framebuffer"))?;
        if fb.info.extent == extent {
            return Ok(());
        }
        fb.info.extent = extent;

        // Respecifying storage keeps the texture names, so the attachments stay valid
        for key in fb.attachments() {
            if let Some(image) = self.images.get_mut(key) {
                image.info.extent = Extent3D::from(extent);
                let format = convert::texture_format(image.info.format);
                self.gl.active_texture(0);
                self.gl.bind_texture(Some(image.texture));
                self.gl.tex_image_2d(format.internal, extent.width, extent.height, format.format, format.ty, None);
                self.gl.bind_texture(None);
            }
        }
        self.run_resize_hooks(framebuffer);
        Ok(())
    }

    fn framebuffer_attachment(&self, framebuffer: FramebufferKey, index: usize) -> Option<ImageKey> {
        match &self.framebuffers.get(framebuffer)?.target {
            GlTarget::Window => None,
            GlTarget::Offscreen { colors, .. } => colors.get(index).copied(),
        }
    }

    fn destroy_framebuffer(&mut self, framebuffer: FramebufferKey) -> GfxResult<()> {
        self.outside_frame()?;
        if framebuffer == self.default_framebuffer {
            return Err(GfxError::InvalidUsage("the default framebuffer lives as long as the context"));
        }
        let fb = self.framebuffers.remove(framebuffer).ok_or(GfxError::InvalidUsage("unknown framebuffer"))?;
        for key in &fb.pipelines {
            if let Some(pipeline) = self.pipelines.remove(*key) {
                pipeline.destroy(&self.gl);
            }
        }
        self.release_images(&fb.attachments());
        if let Some(handle) = fb.handle() {
            self.gl.delete_framebuffer(handle);
        }
        Ok(())
    }

    fn create_graphics_pipeline(&mut self, framebuffer: FramebufferKey, info: GraphicsPipelineInfo) -> GfxResult<PipelineKey> {
        self.outside_frame()?;
        let extent = self
            .framebuffers
            .get(framebuffer)
            .map(|fb| fb.info.extent)
            .ok_or(GfxError::InvalidUsage("unknown framebuffer"))?;
        Self::check_push_constants(&info.resources)?;
        let vertex = self.shader_for(info.vertex, ShaderStage::Vertex)?;
        let fragment = self.shader_for(info.fragment, ShaderStage::Fragment)?;
        let program = self.link(&[vertex, fragment])?;
        // Core profiles draw through a vertex array even without attributes
        let vertex_array = match self.gl.create_vertex_array() {
            Ok(vertex_array) => vertex_array,
            Err(e) => {
                self.gl.delete_program(program);
                return Err(gl_error(e));
            }
        };

        let GraphicsPipelineInfo { vertex_layout, mut state, resources, mut hooks, .. } = info;
        hooks.on_resize(&mut state, extent);
        Ok(self.register_pipeline(GlPipeline {
            kind: PipelineKind::Graphics,
            program,
            vertex_array: Some(vertex_array),
            framebuffer,
            vertex_layout,
            state,
            resources,
            hooks,
        }))
    }

    fn create_compute_pipeline(&mut self, info: ComputePipelineInfo) -> GfxResult<PipelineKey> {
        self.outside_frame()?;
        Self::check_push_constants(&info.resources)?;
        let shader = self.shader_for(info.shader, ShaderStage::Compute)?;
        let program = self.link(&[shader])?;
        let ComputePipelineInfo { resources, mut hooks, .. } = info;
        hooks.on_resize(&mut FixedFunctionState::default(), self.extent());
        Ok(self.register_pipeline(GlPipeline {
            kind: PipelineKind::Compute,
            program,
            vertex_array: None,
            framebuffer: self.default_framebuffer,
            vertex_layout: VertexLayout::default(),
            state: FixedFunctionState::default(),
            resources,
            hooks,
        }))
    }

    fn create_ray_tracing_pipeline(&mut self, _info: RayTracingPipelineInfo) -> GfxResult<PipelineKey> {
        self.outside_frame()?;
        Err(GfxError::FeatureNotSupported)
    }

    fn destroy_pipeline(&mut self, pipeline: PipelineKey) -> GfxResult<()> {
        self.outside_frame()?;
        let resource = self.pipelines.remove(pipeline).ok_or(GfxError::InvalidUsage("unknown pipeline"))?;
        self.release_pipeline(pipeline, resource);
        Ok(())
    }

    fn create_rt_mesh(&mut self, _geometry: &TriangleGeometry) -> GfxResult<RtMeshKey> {
        self.outside_frame()?;
        Err(GfxError::FeatureNotSupported)
    }

    fn destroy_rt_mesh(&mut self, _mesh: RtMeshKey) -> GfxResult<()> {
        self.outside_frame()?;
        Err(GfxError::FeatureNotSupported)
    }

    fn create_rt_scene(&mut self, _instances: &[RtInstance]) -> GfxResult<RtSceneKey> {
        self.outside_frame()?;
        Err(GfxError::FeatureNotSupported)
    }

    fn destroy_rt_scene(&mut self, _scene: RtSceneKey) -> GfxResult<()> {
        self.outside_frame()?;
        Err(GfxError::FeatureNotSupported)
    }

    fn begin_record(&mut self) -> GfxResult<FrameInfo> {
        self.usable()?;
        if self.frame.is_some() {
            return Err(GfxError::InvalidUsage("begin_record while a frame is being recorded"));
        }
        let info = self.frame_info();
        if info.extent.is_zero() {
            self.stats.skipped_frames += 1;
            return Err(GfxError::ZeroFramebufferSize);
        }
        self.frame = Some(ActiveFrame::default());
        Ok(info)
    }

    fn end_record(&mut self) -> GfxResult<()> {
        self.usable()?;
        let frame = self.frame.take().ok_or(GfxError::InvalidUsage("end_record without begin_record"))?;
        if frame.render_pass.is_some() {
            log::warn!("Frame ended with a render pass open");
        }
        if !frame.default_pass_done {
            // Nothing drew to the window; present a cleared image rather than stale contents
            let clear = ClearValues::default();
            self.gl.bind_framebuffer(None);
            self.gl.set_capability(glow::SCISSOR_TEST, false);
            self.gl.depth_mask(true);
            self.gl.clear(clear.color, clear.depth);
        }
        self.gl.bind_vertex_array(None);
        self.gl.use_program(None);

        match self.surface.swap_buffers() {
            Ok(()) => {
                self.stats.frames_submitted += 1;
                Ok(())
            }
            Err(e) => {
                log::warn!("Frame {} not presented: {e}", self.stats.frames_submitted + self.stats.skipped_frames);
                self.stats.skipped_frames += 1;
                Err(GfxError::SurfaceLost)
            }
        }
    }

    fn begin_render_pass(&mut self, framebuffer: FramebufferKey, clear: &ClearValues) -> GfxResult<()> {
        let frame = self.active_frame()?;
        if frame.render_pass.is_some() {
            return Err(GfxError::InvalidUsage("a render pass is already open"));
        }
        let fb = self
            .framebuffers
            .get(framebuffer)
            .ok_or(GfxError::InvalidUsage("unknown framebuffer"))?;
        let extent = fb.info.extent;
        let window = matches!(fb.target, GlTarget::Window);

        self.gl.bind_framebuffer(fb.handle());
        self.gl.viewport(0, 0, extent.width as i32, extent.height as i32);
        self.gl.set_capability(glow::SCISSOR_TEST, false);
        self.gl.depth_mask(true);
        self.gl.clear(clear.color, clear.depth);

        if let Some(frame) = self.frame.as_mut() {
            frame.render_pass = Some(framebuffer);
            frame.bound = None;
            frame.default_pass_done |= window;
        }
        Ok(())
    }

    fn end_render_pass(&mut self) -> GfxResult<()> {
        self.usable()?;
        let frame = self.frame.as_mut().ok_or(NOT_RECORDING)?;
        if frame.render_pass.take().is_none() {
            return Err(GfxError::InvalidUsage("no render pass is open"));
        }
        frame.bound = None;
        Ok(())
    }

    fn bind_pipeline(&mut self, pipeline: PipelineKey, resources: &[ResourceBinding]) -> GfxResult<()> {
        let frame = self.active_frame()?;
        let resource = self.pipelines.get(pipeline).ok_or(GfxError::InvalidUsage("unknown pipeline"))?;
        match resource.kind {
            PipelineKind::Graphics if frame.render_pass != Some(resource.framebuffer) => {
                return Err(GfxError::InvalidUsage("graphics pipelines bind inside their framebuffer's render pass"));
            }
            PipelineKind::Compute | PipelineKind::RayTracing if frame.render_pass.is_some() => {
                return Err(GfxError::InvalidUsage("compute and ray tracing pipelines bind outside render passes"));
            }
            _ => {}
        }
        if resource.resources.bindings.is_empty() && !resources.is_empty() {
            return Err(GfxError::InvalidUsage("pipeline declares no resource bindings"));
        }

        self.gl.use_program(Some(resource.program));
        if resource.kind == PipelineKind::Graphics {
            let extent = self.framebuffers.get(resource.framebuffer).map_or(Extent2D::default(), |f| f.info.extent);
            self.apply_state(&resource.state, extent);
        }
        self.bind_resources(&resource.resources, resources)?;

        let info = self.frame_info();
        if let Some(resource) = self.pipelines.get_mut(pipeline) {
            resource.hooks.on_bind(&info);
        }
        if let Some(frame) = self.frame.as_mut() {
            frame.bound = Some(pipeline);
        }
        Ok(())
    }

    fn draw_mesh(&mut self, draw: &MeshDraw<'_>) -> GfxResult<()> {
        let pipeline = self.bound_pipeline(PipelineKind::Graphics)?;
        let buffer_with = |key: BufferKey, usage: BufferUsage, missing: &'static str| {
            self.buffers
                .get(key)
                .filter(|b| b.info.usage.contains(usage))
                .map(|b| b.buffer)
                .ok_or(GfxError::InvalidUsage(missing))
        };

        self.gl.bind_vertex_array(pipeline.vertex_array);
        if pipeline.vertex_layout.has_input() {
            let key = draw
                .vertex_buffer
                .ok_or(GfxError::InvalidUsage("pipeline consumes vertices but no vertex buffer was given"))?;
            let buffer = buffer_with(key, BufferUsage::VERTEX, "vertex buffer is unknown or lacks vertex usage")?;
            self.gl.bind_buffer(glow::ARRAY_BUFFER, Some(buffer));
            let stride = pipeline.vertex_layout.stride as i32;
            for attribute in &pipeline.vertex_layout.attributes {
                let (components, ty, normalized) = convert::vertex_format(attribute.format);
                self.gl.vertex_attrib_pointer(
                    attribute.location,
                    components,
                    ty,
                    normalized,
                    stride,
                    attribute.offset as i32,
                );
            }
        }
        self.push_constants(pipeline, draw.push_constants)?;

        let mode = convert::topology(pipeline.state.topology);
        let instances = draw.instance_count as i32;
        match draw.index_buffer {
            Some((key, index_type)) => {
                let buffer = buffer_with(key, BufferUsage::INDEX, "index buffer is unknown or lacks index usage")?;
                self.gl.bind_buffer(glow::ELEMENT_ARRAY_BUFFER, Some(buffer));
                self.gl.draw_elements(mode, draw.count as i32, convert::index_type(index_type), instances);
            }
            None => self.gl.draw_arrays(mode, draw.count as i32, instances),
        }
        Ok(())
    }

    fn dispatch_compute(&mut self, groups: [u32; 3], push_constants: &[u8]) -> GfxResult<()> {
        let pipeline = self.bound_pipeline(PipelineKind::Compute)?;
        self.push_constants(pipeline, push_constants)?;
        let [x, y, z] = groups;
        self.gl.dispatch_compute(x, y, z);
        // Later draws and dispatches see the writes
        self.gl.memory_barrier(glow::ALL_BARRIER_BITS);
        Ok(())
    }

    fn trace_rays(&mut self, _width: u32, _height: u32, _depth: u32, _push_constants: &[u8]) -> GfxResult<()> {
        self.active_frame()?;
        Err(GfxError::FeatureNotSupported)
    }

    fn resize(&mut self, extent: Extent2D) -> GfxResult<()> {
        self.outside_frame()?;
        let default = self.default_framebuffer;
        let fb = self.framebuffers.get_mut(default).ok_or(SHUT_DOWN)?;
        if fb.info.extent == extent {
            return Ok(());
        }
        log::info!("Window resized to {}x{}", extent.width, extent.height);
        fb.info.extent = extent;
        self.stats.resizes += 1;
        if !extent.is_zero() {
            self.run_resize_hooks(default);
        }
        Ok(())
    }

    fn set_vsync(&mut self, vsync: bool) -> GfxResult<()> {
        self.usable()?;
        self.surface.set_swap_interval(u32::from(vsync));
        Ok(())
    }

    fn wait_idle(&mut self) -> GfxResult<()> {
        self.usable()?;
        self.gl.finish();
        Ok(())
    }

    fn extent(&self) -> Extent2D {
        self.framebuffers.get(self.default_framebuffer).map_or(Extent2D::default(), |f| f.info.extent)
    }

    fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        if self.frame.take().is_some() {
            log::warn!("Shutdown while recording; the frame is discarded");
        }
        self.gl.finish();

        let gl = &self.gl;
        for (_, pipeline) in self.pipelines.drain() {
            pipeline.destroy(gl);
        }
        for (_, framebuffer) in self.framebuffers.drain() {
            if let Some(handle) = framebuffer.handle() {
                gl.delete_framebuffer(handle);
            }
        }
        for (_, shader) in self.shaders.drain() {
            gl.delete_shader(shader.shader);
        }
        for (_, sampler) in self.samplers.drain() {
            gl.delete_sampler(sampler);
        }
        // Attachment textures are drained here together with standalone images
        for (_, image) in self.images.drain() {
            gl.delete_texture(image.texture);
        }
        for (_, buffer) in self.buffers.drain() {
            gl.delete_buffer(buffer.buffer);
        }
        if let Some(buffer) = self.push_buffer.take() {
            gl.delete_buffer(buffer);
        }
        log::info!(
            "Immediate backend shut down after {} frames ({} skipped, {} resizes)",
            self.stats.frames_submitted,
            self.stats.skipped_frames,
            self.stats.resizes
        );
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl<G: GlApi> Drop for ImmediateBackend<G> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::immediate::recording::{GlCall, GlLiveObjects, RecordingGl, RecordingSurface};
    use crate::pipeline::{BlendMode, CullMode, PipelineHooks, VertexFormat};
    use crate::types::IndexType;

    const VS: &str = "#version 450\nvoid main() { gl_Position = vec4(0.0); }";
    const FS: &str = "#version 450\nlayout(location = 0) out vec4 c;\nvoid main() { c = vec4(1.0); }";

    fn backend() -> (ImmediateBackend<RecordingGl>, RecordingSurface) {
        let surface = RecordingSurface::new(Extent2D::new(640, 480));
        let backend = ImmediateBackend::new(RecordingGl::new(), Box::new(surface.clone()), &GfxConfig::default()).unwrap();
        (backend, surface)
    }

    fn glsl(text: &str) -> ShaderSource {
        ShaderSource::Glsl(text.to_string())
    }

    fn graphics(backend: &mut ImmediateBackend<RecordingGl>, info: impl FnOnce(GraphicsPipelineInfo) -> GraphicsPipelineInfo) -> PipelineKey {
        let vs = backend.create_shader(ShaderStage::Vertex, &glsl(VS)).unwrap();
        let fs = backend.create_shader(ShaderStage::Fragment, &glsl(FS)).unwrap();
        let fb = backend.default_framebuffer();
        backend.create_graphics_pipeline(fb, info(GraphicsPipelineInfo::new(vs, fs))).unwrap()
    }

    #[test]
    fn test_buffer_contents_follow_updates() {
        let (mut backend, _) = backend();
        let buffer = backend.create_buffer(&BufferInfo::dynamic(8, BufferUsage::UNIFORM), Some(&[1, 2, 3, 4])).unwrap();
        backend.update_buffer(buffer, 4, &[9, 9, 9, 9]).unwrap();
        let name = backend.buffer_handle(buffer).unwrap();
        assert_eq!(backend.gl().buffer_contents(name).unwrap(), vec![1, 2, 3, 4, 9, 9, 9, 9]);
        assert_eq!(
            backend.update_buffer(buffer, 6, &[0; 4]),
            Err(GfxError::InvalidUsage("update past the end of the buffer"))
        );
        assert_eq!(
            backend.update_buffer(buffer, u64::MAX, &[1, 2]),
            Err(GfxError::InvalidUsage("update past the end of the buffer"))
        );
    }

    #[test]
    fn test_image_upload_lands_in_texture() {
        let (mut backend, _) = backend();
        let pixels: Vec<u8> = (0..64).collect();
        let image = backend.create_image(&ImageInfo::texture_2d(4, 4, Format::Rgba8Unorm), Some(&pixels)).unwrap();
        let (w, h, data) = backend.gl().texture_contents(backend.image_handle(image).unwrap()).unwrap();
        assert_eq!((w, h), (4, 4));
        assert_eq!(data, pixels);
        assert!(backend.update_image(image, &[0; 12]).is_err());
        backend.update_image(image, &[5; 64]).unwrap();
        let (_, _, data) = backend.gl().texture_contents(backend.image_handle(image).unwrap()).unwrap();
        assert_eq!(data, vec![5; 64]);
    }

    #[test]
    fn test_shader_rejections() {
        let (mut backend, _) = backend();
        assert_eq!(
            backend.create_shader(ShaderStage::Vertex, &glsl("#version 450\n#error broken")),
            Err(GfxError::BadShaderCode)
        );
        assert!(matches!(
            backend.create_shader(ShaderStage::Vertex, &ShaderSource::SpirV(vec![crate::types::SPIRV_MAGIC])),
            Err(GfxError::InvalidUsage(_))
        ));
        assert_eq!(backend.create_shader(ShaderStage::RayGen, &glsl(VS)), Err(GfxError::FeatureNotSupported));
        assert_eq!(backend.gl().live_objects().shaders, 0);
    }

    #[test]
    fn test_frame_clears_and_swaps() {
        let (mut backend, surface) = backend();
        let pipeline = graphics(&mut backend, |info| info);
        backend.gl().take_calls();

        let frame = backend.begin_record().unwrap();
        assert_eq!(frame.extent, Extent2D::new(640, 480));
        let fb = backend.default_framebuffer();
        let clear = ClearValues { color: [0.1, 0.2, 0.3, 1.0], depth: 1.0 };
        backend.begin_render_pass(fb, &clear).unwrap();
        backend.bind_pipeline(pipeline, &[]).unwrap();
        backend.draw_mesh(&MeshDraw::vertices(None, 3)).unwrap();
        backend.end_render_pass().unwrap();
        backend.end_record().unwrap();

        let calls = backend.gl().take_calls();
        assert_eq!(calls[0], GlCall::BindFramebuffer(None));
        assert!(calls.contains(&GlCall::Clear([0.1, 0.2, 0.3, 1.0], 1.0)));
        assert!(calls.contains(&GlCall::DrawArrays { mode: glow::TRIANGLES, count: 3, instances: 1 }));
        assert_eq!(surface.log().swaps, 1);
        assert_eq!(backend.frame_stats().frames_submitted, 1);
    }

    #[test]
    fn test_indexed_draw_binds_vertex_input() {
        let (mut backend, _) = backend();
        let layout = VertexLayout::new(20)
            .with_attribute(0, VertexFormat::Float3, 0)
            .with_attribute(1, VertexFormat::Float2, 12);
        let pipeline = graphics(&mut backend, |info| info.with_vertex_layout(layout));
        let vertices = backend.create_buffer(&BufferInfo::constant(80, BufferUsage::VERTEX), None).unwrap();
        let indices = backend.create_buffer(&BufferInfo::constant(12, BufferUsage::INDEX), None).unwrap();

        backend.begin_record().unwrap();
        let fb = backend.default_framebuffer();
        backend.begin_render_pass(fb, &ClearValues::default()).unwrap();
        backend.bind_pipeline(pipeline, &[]).unwrap();
        assert!(backend.draw_mesh(&MeshDraw::vertices(None, 3)).is_err());
        assert!(backend.draw_mesh(&MeshDraw::indexed(vertices, vertices, IndexType::U16, 6)).is_err());
        backend.gl().take_calls();
        backend.draw_mesh(&MeshDraw::indexed(vertices, indices, IndexType::U16, 6)).unwrap();
        backend.end_render_pass().unwrap();
        backend.end_record().unwrap();

        let calls = backend.gl().calls();
        assert!(calls.contains(&GlCall::VertexAttrib { location: 1, components: 2, stride: 20, offset: 12 }));
        assert!(calls.contains(&GlCall::DrawElements {
            mode: glow::TRIANGLES,
            count: 6,
            index_type: glow::UNSIGNED_SHORT,
            instances: 1
        }));
    }

    #[test]
    fn test_bind_applies_fixed_function_state() {
        let (mut backend, _) = backend();
        let mut state = FixedFunctionState::default();
        state.cull_mode = CullMode::None;
        state.blend = BlendMode::Alpha;
        state.dynamic_viewport = true;
        let pipeline = graphics(&mut backend, |info| info.with_state(state));

        backend.begin_record().unwrap();
        let fb = backend.default_framebuffer();
        backend.begin_render_pass(fb, &ClearValues::default()).unwrap();
        backend.gl().take_calls();
        backend.bind_pipeline(pipeline, &[]).unwrap();
        let calls = backend.gl().take_calls();
        assert!(calls.contains(&GlCall::Capability(glow::CULL_FACE, false)));
        assert!(calls.contains(&GlCall::BlendFunc(glow::SRC_ALPHA, glow::ONE_MINUS_SRC_ALPHA)));
        assert!(calls.contains(&GlCall::Viewport(0, 0, 640, 480)));
        assert!(calls.contains(&GlCall::Capability(glow::SCISSOR_TEST, false)));
        backend.end_render_pass().unwrap();
        backend.end_record().unwrap();
    }

    #[test]
    fn test_resources_bound_to_their_units() {
        let (mut backend, _) = backend();
        let layout = ResourceLayout::default()
            .with_binding(0, BindingType::UniformBuffer)
            .with_binding(1, BindingType::SampledImage)
            .with_push_constants(16);
        let pipeline = graphics(&mut backend, |info| info.with_resources(layout));
        let ubo = backend.create_buffer(&BufferInfo::dynamic(64, BufferUsage::UNIFORM), None).unwrap();
        let image = backend.create_image(&ImageInfo::texture_2d(2, 2, Format::Rgba8Unorm), None).unwrap();
        let sampler = backend.create_sampler(&SamplerInfo::default()).unwrap();
        let bindings = [
            ResourceBinding { binding: 0, resource: BoundResource::UniformBuffer(ubo) },
            ResourceBinding { binding: 1, resource: BoundResource::SampledImage(image, sampler) },
        ];

        backend.begin_record().unwrap();
        let fb = backend.default_framebuffer();
        backend.begin_render_pass(fb, &ClearValues::default()).unwrap();
        backend.gl().take_calls();
        backend.bind_pipeline(pipeline, &bindings).unwrap();
        let wrong = [ResourceBinding { binding: 0, resource: BoundResource::StorageBuffer(ubo) }];
        assert!(backend.bind_pipeline(pipeline, &wrong).is_err());
        assert!(backend.draw_mesh(&MeshDraw::vertices(None, 3).with_push_constants(&[0; 32])).is_err());
        backend.draw_mesh(&MeshDraw::vertices(None, 3).with_push_constants(&[7; 16])).unwrap();
        backend.end_render_pass().unwrap();
        backend.end_record().unwrap();

        let calls = backend.gl().calls();
        let ubo_name = backend.buffer_handle(ubo).unwrap();
        let texture = backend.image_handle(image).unwrap();
        assert!(calls.contains(&GlCall::BindBufferBase(glow::UNIFORM_BUFFER, 0, Some(ubo_name))));
        assert!(calls.contains(&GlCall::BindTexture(1, Some(texture))));
        assert!(calls.iter().any(|c| matches!(c, GlCall::BindBufferBase(_, PUSH_CONSTANT_BINDING, _))));
    }

    #[test]
    fn test_compute_dispatch_outside_pass() {
        let (mut backend, _) = backend();
        let cs = backend
            .create_shader(ShaderStage::Compute, &glsl("#version 450\nlayout(local_size_x = 8) in;\nvoid main() {}"))
            .unwrap();
        let layout = ResourceLayout::default().with_binding(0, BindingType::StorageBuffer);
        let pipeline = backend.create_compute_pipeline(ComputePipelineInfo::new(cs, layout)).unwrap();
        let ssbo = backend.create_buffer(&BufferInfo::constant(256, BufferUsage::STORAGE), None).unwrap();
        let bindings = [ResourceBinding { binding: 0, resource: BoundResource::StorageBuffer(ssbo) }];

        backend.begin_record().unwrap();
        let fb = backend.default_framebuffer();
        backend.begin_render_pass(fb, &ClearValues::default()).unwrap();
        assert!(backend.bind_pipeline(pipeline, &bindings).is_err());
        backend.end_render_pass().unwrap();
        backend.bind_pipeline(pipeline, &bindings).unwrap();
        backend.dispatch_compute([4, 1, 1], &[]).unwrap();
        assert!(backend.draw_mesh(&MeshDraw::vertices(None, 3)).is_err());
        backend.end_record().unwrap();

        let calls = backend.gl().calls();
        assert!(calls.contains(&GlCall::Dispatch(4, 1, 1)));
        assert!(calls.contains(&GlCall::MemoryBarrier(glow::ALL_BARRIER_BITS)));
    }

    #[test]
    fn test_ray_tracing_is_unsupported() {
        let (mut backend, _) = backend();
        assert_eq!(backend.create_rt_scene(&[]), Err(GfxError::FeatureNotSupported));
        backend.begin_record().unwrap();
        assert_eq!(backend.trace_rays(8, 8, 1, &[]), Err(GfxError::FeatureNotSupported));
        backend.end_record().unwrap();
    }

    #[derive(Default)]
    struct CountResizes(std::rc::Rc<std::cell::Cell<u32>>);

    impl PipelineHooks for CountResizes {
        fn on_resize(&mut self, state: &mut FixedFunctionState, extent: Extent2D) {
            self.0.set(self.0.get() + 1);
            state.fit_to(extent);
        }
    }

    #[test]
    fn test_resize_refits_pipelines_once() {
        let (mut backend, _) = backend();
        let hooks = CountResizes::default();
        let count = hooks.0.clone();
        let pipeline = graphics(&mut backend, |info| info.with_hooks(hooks));
        assert_eq!(count.get(), 1);

        backend.resize(Extent2D::new(320, 200)).unwrap();
        backend.resize(Extent2D::new(320, 200)).unwrap();
        assert_eq!(count.get(), 2);
        assert_eq!(backend.frame_stats().resizes, 1);
        assert_eq!(backend.graphics_state(pipeline).unwrap().scissor.width, 320);

        backend.resize(Extent2D::new(0, 0)).unwrap();
        assert_eq!(count.get(), 2);
        assert_eq!(backend.begin_record(), Err(GfxError::ZeroFramebufferSize));
        assert_eq!(backend.frame_stats().skipped_frames, 1);
    }

    #[test]
    fn test_offscreen_framebuffer_owns_attachments() {
        let (mut backend, _) = backend();
        let info = FramebufferInfo {
            extent: Extent2D::new(64, 64),
            color_formats: vec![Format::Rgba8Unorm],
            depth_format: Some(Format::D32Float),
        };
        let fb = backend.create_framebuffer(&info).unwrap();
        let color = backend.framebuffer_attachment(fb, 0).unwrap();
        let texture = backend.image_handle(color).unwrap();
        assert!(backend.destroy_image(color).is_err());

        backend.resize_framebuffer(fb, Extent2D::new(128, 32)).unwrap();
        assert_eq!(backend.image_handle(color), Some(texture));
        let (w, h, _) = backend.gl().texture_contents(texture).unwrap();
        assert_eq!((w, h), (128, 32));

        backend.destroy_framebuffer(fb).unwrap();
        assert!(backend.image_handle(color).is_none());
        assert_eq!(backend.gl().live_objects().framebuffers, 0);
        assert_eq!(backend.gl().live_objects().textures, 0);
    }

    #[test]
    fn test_shutdown_releases_everything() {
        let (mut backend, _) = backend();
        graphics(&mut backend, |info| info);
        backend.create_buffer(&BufferInfo::constant(16, BufferUsage::VERTEX), None).unwrap();
        backend.create_sampler(&SamplerInfo::default()).unwrap();
        let info = FramebufferInfo {
            extent: Extent2D::new(16, 16),
            color_formats: vec![Format::Rgba8Unorm],
            depth_format: None,
        };
        backend.create_framebuffer(&info).unwrap();

        backend.shutdown();
        backend.shutdown();
        assert_eq!(backend.gl().live_objects(), GlLiveObjects::default());
        assert_eq!(backend.begin_record(), Err(SHUT_DOWN));
    }
}
