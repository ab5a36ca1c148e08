//! Backend abstraction and the graphics context
//!
//! [`Backend`] is the single API both backends implement. Which one is used is a
//! runtime decision ([`BackendKind::detect`]), so callers hold a [`Gfx`] that owns a
//! boxed backend and shuts it down in a defined order.

use std::any::Any;
use std::ops::{Deref, DerefMut};

use crate::config::{BackendPreference, GfxConfig};
use crate::error::GfxResult;
use crate::explicit::ExplicitBackend;
use crate::hal::headless::{HeadlessConfig, HeadlessDevice};
use crate::hal::vulkan::{VulkanDevice, VulkanSurfaceSource};
use crate::immediate::{GlApi, GlSurface, ImmediateBackend};
use crate::pipeline::{ComputePipelineInfo, GraphicsPipelineInfo, RayTracingPipelineInfo};
use crate::types::{
    BufferInfo, BufferKey, ClearValues, Extent2D, FrameInfo, FramebufferInfo, FramebufferKey, ImageInfo, ImageKey,
    MeshDraw, PipelineKey, ResourceBinding, RtInstance, RtMeshKey, RtSceneKey, SamplerInfo, SamplerKey, ShaderKey,
    ShaderSource, ShaderStage, TriangleGeometry,
};

/// Which family of GPU API a backend drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Vulkan-style explicit API (real or headless device)
    Explicit,
    /// OpenGL
    Immediate,
}

impl BackendKind {
    /// Resolve a preference, probing for a Vulkan loader when asked to choose
    pub fn detect(preference: BackendPreference) -> Self {
        match preference {
            BackendPreference::Vulkan | BackendPreference::Headless => Self::Explicit,
            BackendPreference::OpenGl => Self::Immediate,
            BackendPreference::Auto => {
                // SAFETY: loading only resolves the loader's entry points
                if unsafe { ash::Entry::load() }.is_ok() {
                    Self::Explicit
                } else {
                    log::info!("No Vulkan loader found, falling back to OpenGL");
                    Self::Immediate
                }
            }
        }
    }
}

/// Graphics backend operations.
///
/// Resources are created and destroyed outside `begin_record`/`end_record`;
/// commands are only accepted between them. Keys are owned by the backend that
/// issued them.
pub trait Backend {
    /// API family
    fn kind(&self) -> BackendKind;

    /// Create a buffer, optionally filled with `data`
    fn create_buffer(&mut self, info: &BufferInfo, data: Option<&[u8]>) -> GfxResult<BufferKey>;
    /// Overwrite bytes of a buffer; allowed inside a frame outside render passes
    fn update_buffer(&mut self, buffer: BufferKey, offset: u64, data: &[u8]) -> GfxResult<()>;
    /// Destroy a buffer
    fn destroy_buffer(&mut self, buffer: BufferKey) -> GfxResult<()>;

    /// Create an image, optionally filled with `data` covering the whole image
    fn create_image(&mut self, info: &ImageInfo, data: Option<&[u8]>) -> GfxResult<ImageKey>;
    /// Replace the whole contents of an image outside a frame
    fn update_image(&mut self, image: ImageKey, data: &[u8]) -> GfxResult<()>;
    /// Destroy an image
    fn destroy_image(&mut self, image: ImageKey) -> GfxResult<()>;

    /// Create a sampler
    fn create_sampler(&mut self, info: &SamplerInfo) -> GfxResult<SamplerKey>;
    /// Destroy a sampler
    fn destroy_sampler(&mut self, sampler: SamplerKey) -> GfxResult<()>;

    /// Create a shader for `stage`
    fn create_shader(&mut self, stage: ShaderStage, source: &ShaderSource) -> GfxResult<ShaderKey>;
    /// Destroy a shader; pipelines built from it keep working
    fn destroy_shader(&mut self, shader: ShaderKey) -> GfxResult<()>;

    /// The window framebuffer
    fn default_framebuffer(&self) -> FramebufferKey;
    /// Create an offscreen framebuffer with owned attachments
    fn create_framebuffer(&mut self, info: &FramebufferInfo) -> GfxResult<FramebufferKey>;
    /// Resize a framebuffer and rebuild its pipelines
    fn resize_framebuffer(&mut self, framebuffer: FramebufferKey, extent: Extent2D) -> GfxResult<()>;
    /// Image backing colour attachment `index`, for sampling in later passes
    fn framebuffer_attachment(&self, framebuffer: FramebufferKey, index: usize) -> Option<ImageKey>;
    /// Destroy an offscreen framebuffer together with its pipelines
    fn destroy_framebuffer(&mut self, framebuffer: FramebufferKey) -> GfxResult<()>;

    /// Create a graphics pipeline rendering into `framebuffer`
    fn create_graphics_pipeline(&mut self, framebuffer: FramebufferKey, info: GraphicsPipelineInfo) -> GfxResult<PipelineKey>;
    /// Create a compute pipeline
    fn create_compute_pipeline(&mut self, info: ComputePipelineInfo) -> GfxResult<PipelineKey>;
    /// Create a ray tracing pipeline and its shader binding table
    fn create_ray_tracing_pipeline(&mut self, info: RayTracingPipelineInfo) -> GfxResult<PipelineKey>;
    /// Destroy a pipeline
    fn destroy_pipeline(&mut self, pipeline: PipelineKey) -> GfxResult<()>;

    /// Build a bottom-level acceleration structure
    fn create_rt_mesh(&mut self, geometry: &TriangleGeometry) -> GfxResult<RtMeshKey>;
    /// Destroy a bottom-level acceleration structure no scene refers to
    fn destroy_rt_mesh(&mut self, mesh: RtMeshKey) -> GfxResult<()>;
    /// Build a top-level acceleration structure over mesh instances
    fn create_rt_scene(&mut self, instances: &[RtInstance]) -> GfxResult<RtSceneKey>;
    /// Destroy a top-level acceleration structure
    fn destroy_rt_scene(&mut self, scene: RtSceneKey) -> GfxResult<()>;

    /// Start a frame
    fn begin_record(&mut self) -> GfxResult<FrameInfo>;
    /// Submit and present the frame
    fn end_record(&mut self) -> GfxResult<()>;
    /// Begin rendering into a framebuffer
    fn begin_render_pass(&mut self, framebuffer: FramebufferKey, clear: &ClearValues) -> GfxResult<()>;
    /// Finish the current render pass
    fn end_render_pass(&mut self) -> GfxResult<()>;
    /// Bind a pipeline and the resources its layout declares
    fn bind_pipeline(&mut self, pipeline: PipelineKey, resources: &[ResourceBinding]) -> GfxResult<()>;
    /// Draw with the bound graphics pipeline
    fn draw_mesh(&mut self, draw: &MeshDraw<'_>) -> GfxResult<()>;
    /// Dispatch the bound compute pipeline
    fn dispatch_compute(&mut self, groups: [u32; 3], push_constants: &[u8]) -> GfxResult<()>;
    /// Trace rays with the bound ray tracing pipeline
    fn trace_rays(&mut self, width: u32, height: u32, depth: u32, push_constants: &[u8]) -> GfxResult<()>;

    /// Follow a new window size
    fn resize(&mut self, extent: Extent2D) -> GfxResult<()>;
    /// Change vertical sync
    fn set_vsync(&mut self, vsync: bool) -> GfxResult<()>;
    /// Block until the GPU is idle
    fn wait_idle(&mut self) -> GfxResult<()>;
    /// Size of the default framebuffer
    fn extent(&self) -> Extent2D;

    /// Destroy every resource; further calls fail. Idempotent.
    fn shutdown(&mut self);

    /// Downcast to the concrete backend for diagnostics
    fn as_any(&self) -> &dyn Any;
    /// Mutable downcast
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Graphics context: the backend in use plus its lifecycle
pub struct Gfx {
    backend: Box<dyn Backend>,
}

impl Gfx {
    /// Wrap an already constructed backend
    pub fn new(backend: Box<dyn Backend>) -> Self {
        log::info!("Graphics context created on the {:?} backend", backend.kind());
        Self { backend }
    }

    /// Explicit backend over real Vulkan hardware
    pub fn vulkan(config: &GfxConfig, window: &dyn VulkanSurfaceSource, extent: Extent2D) -> GfxResult<Self> {
        let device = VulkanDevice::new(config, window)?;
        Ok(Self::new(Box::new(ExplicitBackend::new(device, config, extent)?)))
    }

    /// Explicit backend over the software device
    pub fn headless(config: &GfxConfig, device: HeadlessConfig) -> GfxResult<Self> {
        let extent = device.surface_extent;
        let device = HeadlessDevice::new(device);
        Ok(Self::new(Box::new(ExplicitBackend::new(device, config, extent)?)))
    }

    /// Immediate backend over an OpenGL context current on this thread
    pub fn opengl<G: GlApi>(config: &GfxConfig, gl: G, surface: Box<dyn GlSurface>) -> GfxResult<Self> {
        Ok(Self::new(Box::new(ImmediateBackend::new(gl, surface, config)?)))
    }

    /// Concrete backend, when it is a `B`
    pub fn downcast_ref<B: Backend + 'static>(&self) -> Option<&B> {
        self.backend.as_any().downcast_ref()
    }

    /// Concrete backend, mutably, when it is a `B`
    pub fn downcast_mut<B: Backend + 'static>(&mut self) -> Option<&mut B> {
        self.backend.as_any_mut().downcast_mut()
    }

    /// Wait idle and destroy every resource in reverse dependency order
    pub fn shutdown(mut self) {
        self.backend.shutdown();
    }
}

impl Deref for Gfx {
    type Target = dyn Backend;

    fn deref(&self) -> &Self::Target {
        self.backend.as_ref()
    }
}

impl DerefMut for Gfx {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.backend.as_mut()
    }
}

impl Drop for Gfx {
    fn drop(&mut self) {
        self.backend.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_preferences() {
        assert_eq!(BackendKind::detect(BackendPreference::Vulkan), BackendKind::Explicit);
        assert_eq!(BackendKind::detect(BackendPreference::Headless), BackendKind::Explicit);
        assert_eq!(BackendKind::detect(BackendPreference::OpenGl), BackendKind::Immediate);
    }

    #[test]
    fn test_headless_context_lifecycle() {
        let mut gfx = Gfx::headless(&GfxConfig::default(), HeadlessConfig::default()).unwrap();
        assert_eq!(gfx.kind(), BackendKind::Explicit);
        assert_eq!(gfx.extent(), Extent2D::new(800, 600));
        gfx.begin_record().unwrap();
        gfx.end_record().unwrap();
        assert!(gfx.downcast_ref::<ExplicitBackend<HeadlessDevice>>().is_some());
        gfx.shutdown();
    }
}
