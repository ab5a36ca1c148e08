//! Hardware abstraction layer under the explicit backend.
//!
//! [`Device`] is a thin, explicit API shaped after Vulkan: memory objects are
//! created together with their allocation, commands are recorded into command
//! buffers and only execute on [`Device::submit`], and all CPU/GPU coordination
//! goes through fences and semaphores. The explicit engine in
//! [`crate::explicit`] is generic over it, so the same frame/transfer logic drives
//! real hardware ([`vulkan::VulkanDevice`]) and the software
//! [`headless::HeadlessDevice`].
//!
//! Handle types are `Copy` identifiers; every `create_*` has a matching
//! `destroy_*`, and the caller owns the pairing. Allocations are deliberately not
//! `Copy` so a buffer or image and its memory are released exactly once, together.

pub mod headless;
pub mod vulkan;

use std::fmt::Debug;

use crate::error::GfxResult;
use crate::pipeline::{FixedFunctionState, PipelineKind, VertexFormat, VertexLayout, Viewport, Rect2D};
use crate::types::{
    BufferUsage, ClearValues, CompositeAlpha, Extent2D, Extent3D, Format, ImageUsage, IndexType,
    PresentMode, ResourceLayout, SamplerInfo, SurfaceTransform,
};

/// Queue a command buffer belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    /// Graphics, compute and transfer work
    Graphics,
    /// Presentation; aliases `Graphics` when the families match
    Present,
}

/// Where an allocation lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryLocation {
    /// Fast device memory; may or may not be host-visible
    DeviceLocal,
    /// Host-visible memory suitable for sequential CPU writes
    HostVisible,
}

/// Buffer creation parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDesc {
    /// Size in bytes
    pub size: u64,
    /// Usage flags
    pub usage: BufferUsage,
    /// Memory placement
    pub location: MemoryLocation,
    /// Debug label
    pub label: &'static str,
}

/// Image creation parameters (always 2D, single mip, single layer)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDesc {
    /// Extent in texels
    pub extent: Extent3D,
    /// Texel format
    pub format: Format,
    /// Usage flags
    pub usage: ImageUsage,
    /// Debug label
    pub label: &'static str,
}

/// Image aspect addressed by views and barriers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageAspect {
    /// Colour data
    Color,
    /// Depth data
    Depth,
}

impl ImageAspect {
    /// Aspect implied by a format
    pub const fn of(format: Format) -> Self {
        if format.is_depth() {
            Self::Depth
        } else {
            Self::Color
        }
    }
}

/// Layout/access state an image is transitioned between
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageState {
    /// Contents undefined
    Undefined,
    /// Target of a transfer
    TransferDst,
    /// Read by shaders
    ShaderRead,
    /// Rendered to as colour
    ColorAttachment,
    /// Rendered to as depth
    DepthAttachment,
    /// Read/written as a storage image
    General,
    /// Owned by the presentation engine
    Present,
}

/// Access scope used by buffer and global memory barriers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferAccess {
    /// Nothing to wait on
    None,
    /// Host writes
    HostWrite,
    /// Transfer writes
    TransferWrite,
    /// Vertex/index/uniform/storage reads
    ShaderRead,
    /// Acceleration structure build reads and writes
    AccelerationBuild,
}

/// Direction of a queue family ownership transfer of a swapchain image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OwnershipTransfer {
    /// Graphics queue gives the image up
    Release,
    /// Present queue takes the image
    Acquire,
}

/// Pipeline stage a submission waits at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaitStage {
    /// Colour attachment output
    ColorAttachmentOutput,
    /// Transfer
    Transfer,
    /// Everything
    AllCommands,
}

/// Region of a buffer-to-buffer copy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferCopy {
    /// Offset in the source
    pub src_offset: u64,
    /// Offset in the destination
    pub dst_offset: u64,
    /// Byte count
    pub size: u64,
}

/// A queue submission
pub struct Submit<'a, D: Device> {
    /// Command buffer to execute
    pub command_buffer: D::CommandBuffer,
    /// Semaphore waited on before `stage`
    pub wait: Option<(D::Semaphore, WaitStage)>,
    /// Semaphores signalled on completion
    pub signal: &'a [D::Semaphore],
    /// Fence signalled on completion
    pub fence: Option<D::Fence>,
}

/// Result of a swapchain acquire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// An image was acquired; the semaphore will be signalled
    Acquired {
        /// Image index
        index: u32,
        /// Surface no longer matches exactly but is still usable
        suboptimal: bool,
    },
    /// The swapchain must be recreated; nothing was signalled
    OutOfDate,
}

/// Result of a present
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    /// Presented normally
    Presented,
    /// Presented, but the swapchain should be recreated
    Suboptimal,
    /// Not presented; the swapchain must be recreated
    OutOfDate,
}

/// What a surface supports
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurfaceSupport {
    /// Supported formats, sRGB non-linear colour space
    pub formats: Vec<Format>,
    /// Supported present modes
    pub present_modes: Vec<PresentMode>,
    /// Minimum swapchain image count
    pub min_image_count: u32,
    /// Maximum swapchain image count; 0 means unbounded
    pub max_image_count: u32,
    /// Extent fixed by the surface, or `None` when the swapchain decides
    pub current_extent: Option<Extent2D>,
    /// Smallest allowed extent
    pub min_extent: Extent2D,
    /// Largest allowed extent
    pub max_extent: Extent2D,
    /// Whether the identity transform is supported
    pub supports_identity: bool,
    /// Transform currently applied by the platform
    pub current_transform: SurfaceTransform,
    /// Supported composite alpha modes
    pub composite_alpha: Vec<CompositeAlpha>,
}

/// Parameters a swapchain is created with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceConfig {
    /// Image format
    pub format: Format,
    /// Present mode
    pub present_mode: PresentMode,
    /// Image extent
    pub extent: Extent2D,
    /// Requested image count
    pub image_count: u32,
    /// Pre-transform
    pub transform: SurfaceTransform,
    /// Composite alpha
    pub composite_alpha: CompositeAlpha,
}

/// One colour attachment of a render pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorAttachmentDesc {
    /// Attachment format
    pub format: Format,
    /// State the attachment is left in after the pass
    pub final_state: ImageState,
}

/// Single-subpass render pass description; attachments are cleared on load
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderPassDesc {
    /// Colour attachments
    pub colors: Vec<ColorAttachmentDesc>,
    /// Depth attachment format
    pub depth: Option<Format>,
}

/// Graphics pipeline creation parameters
pub struct GraphicsPipelineDesc<'a, D: Device> {
    /// Vertex stage
    pub vertex: D::ShaderModule,
    /// Fragment stage
    pub fragment: D::ShaderModule,
    /// Layout
    pub layout: D::PipelineLayout,
    /// Cache
    pub cache: D::PipelineCache,
    /// Render pass the pipeline is compatible with
    pub render_pass: D::RenderPass,
    /// Number of colour attachments in the render pass
    pub color_attachment_count: u32,
    /// Vertex input
    pub vertex_layout: &'a VertexLayout,
    /// Fixed-function state
    pub state: &'a FixedFunctionState,
}

/// Compute pipeline creation parameters
pub struct ComputePipelineDesc<D: Device> {
    /// Compute stage
    pub shader: D::ShaderModule,
    /// Layout
    pub layout: D::PipelineLayout,
    /// Cache
    pub cache: D::PipelineCache,
}

/// Ray tracing pipeline creation parameters; groups are raygen, misses, hits
pub struct RayTracingPipelineDesc<'a, D: Device> {
    /// Ray generation stage
    pub raygen: D::ShaderModule,
    /// Miss stages
    pub miss: &'a [D::ShaderModule],
    /// Closest-hit stages, one triangle hit group each
    pub closest_hit: &'a [D::ShaderModule],
    /// Layout
    pub layout: D::PipelineLayout,
    /// Cache
    pub cache: D::PipelineCache,
    /// Maximum recursion depth
    pub max_recursion_depth: u32,
}

/// A descriptor write into set 0
pub enum DescriptorWrite<D: Device> {
    /// Uniform buffer, whole range
    UniformBuffer {
        /// Binding number
        binding: u32,
        /// Buffer
        buffer: D::Buffer,
        /// Byte range
        range: u64,
    },
    /// Storage buffer, whole range
    StorageBuffer {
        /// Binding number
        binding: u32,
        /// Buffer
        buffer: D::Buffer,
        /// Byte range
        range: u64,
    },
    /// Combined image sampler in shader-read state
    SampledImage {
        /// Binding number
        binding: u32,
        /// View
        view: D::ImageView,
        /// Sampler
        sampler: D::Sampler,
    },
    /// Storage image in general state
    StorageImage {
        /// Binding number
        binding: u32,
        /// View
        view: D::ImageView,
    },
    /// Top-level acceleration structure
    AccelerationStructure {
        /// Binding number
        binding: u32,
        /// Acceleration structure
        accel: D::AccelerationStructure,
    },
}

/// Level of an acceleration structure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccelerationKind {
    /// Geometry
    BottomLevel,
    /// Instances of bottom-level structures
    TopLevel,
}

/// Geometry consumed by an acceleration structure build, by device address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccelerationGeometry {
    /// Triangle mesh
    Triangles {
        /// Address of the first vertex position
        vertex_address: u64,
        /// Stride between vertices
        vertex_stride: u64,
        /// Highest vertex index + 1
        vertex_count: u32,
        /// Position format
        vertex_format: VertexFormat,
        /// Address of `u32` indices, if indexed
        index_address: Option<u64>,
        /// Triangle count
        triangle_count: u32,
        /// Skip any-hit shaders
        opaque: bool,
    },
    /// Instance records
    Instances {
        /// Address of the first 64-byte instance record
        address: u64,
        /// Number of instances
        count: u32,
    },
}

impl AccelerationGeometry {
    /// Primitive count of the single build range
    pub const fn primitive_count(&self) -> u32 {
        match self {
            Self::Triangles { triangle_count, .. } => *triangle_count,
            Self::Instances { count, .. } => *count,
        }
    }

    /// Level this geometry builds
    pub const fn kind(&self) -> AccelerationKind {
        match self {
            Self::Triangles { .. } => AccelerationKind::BottomLevel,
            Self::Instances { .. } => AccelerationKind::TopLevel,
        }
    }
}

/// Memory requirements of an acceleration structure build
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccelerationSizes {
    /// Backing buffer size
    pub structure_size: u64,
    /// Scratch buffer size
    pub scratch_size: u64,
}

/// A recorded acceleration structure build
pub struct AccelerationBuild<'a, D: Device> {
    /// Geometry
    pub geometry: &'a AccelerationGeometry,
    /// Destination structure
    pub dst: D::AccelerationStructure,
    /// Scratch address, aligned to the scratch offset alignment
    pub scratch_address: u64,
}

/// A strided shader binding table region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StridedRegion {
    /// Device address of the first record
    pub address: u64,
    /// Record stride
    pub stride: u64,
    /// Region size
    pub size: u64,
}

/// The three regions traced with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SbtRegions {
    /// Ray generation region
    pub raygen: StridedRegion,
    /// Miss region
    pub miss: StridedRegion,
    /// Hit group region
    pub hit: StridedRegion,
}

/// Ray tracing limits of the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RayTracingProperties {
    /// Size of one shader group handle
    pub shader_group_handle_size: u32,
    /// Alignment of each handle slot inside a region
    pub shader_group_handle_alignment: u32,
    /// Alignment of each region's base address
    pub shader_group_base_alignment: u32,
    /// Alignment of build scratch addresses
    pub scratch_offset_alignment: u32,
    /// Maximum trace recursion
    pub max_recursion_depth: u32,
}

/// Static facts about a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCapabilities {
    /// Human-readable adapter name
    pub name: String,
    /// Present and graphics queues are different families
    pub separate_present_queue: bool,
    /// Ray tracing limits, when the extensions are enabled
    pub ray_tracing: Option<RayTracingProperties>,
}

/// Explicit graphics device.
///
/// All methods take `&self`; the explicit engine drives a device from one thread.
pub trait Device: Sized + 'static {
    /// Buffer handle
    type Buffer: Copy + PartialEq + Debug;
    /// Image handle
    type Image: Copy + PartialEq + Debug;
    /// Image view handle
    type ImageView: Copy + PartialEq + Debug;
    /// Sampler handle
    type Sampler: Copy + PartialEq + Debug;
    /// Memory allocation backing a buffer or image
    type Allocation: Debug;
    /// Fence handle
    type Fence: Copy + PartialEq + Debug;
    /// Semaphore handle
    type Semaphore: Copy + PartialEq + Debug;
    /// Command buffer handle
    type CommandBuffer: Copy + PartialEq + Debug;
    /// Render pass handle
    type RenderPass: Copy + PartialEq + Debug;
    /// Framebuffer handle
    type Framebuffer: Copy + PartialEq + Debug;
    /// Shader module handle
    type ShaderModule: Copy + PartialEq + Debug;
    /// Pipeline layout handle
    type PipelineLayout: Copy + PartialEq + Debug;
    /// Pipeline cache handle
    type PipelineCache: Copy + PartialEq + Debug;
    /// Pipeline handle
    type Pipeline: Copy + PartialEq + Debug;
    /// Descriptor pool handle
    type DescriptorPool: Copy + PartialEq + Debug;
    /// Descriptor set handle
    type DescriptorSet: Copy + PartialEq + Debug;
    /// Swapchain handle
    type Swapchain: Copy + PartialEq + Debug;
    /// Acceleration structure handle
    type AccelerationStructure: Copy + PartialEq + Debug;

    /// Static device facts
    fn capabilities(&self) -> &DeviceCapabilities;

    // --- memory -------------------------------------------------------------

    /// Create a buffer and its allocation as one unit
    fn create_buffer(&self, desc: &BufferDesc) -> GfxResult<(Self::Buffer, Self::Allocation)>;
    /// Destroy a buffer and its allocation
    fn destroy_buffer(&self, buffer: Self::Buffer, allocation: Self::Allocation);
    /// Create an image and its allocation as one unit
    fn create_image(&self, desc: &ImageDesc) -> GfxResult<(Self::Image, Self::Allocation)>;
    /// Destroy an image and its allocation
    fn destroy_image(&self, image: Self::Image, allocation: Self::Allocation);
    /// Whether the allocation can be mapped
    fn is_host_visible(&self, allocation: &Self::Allocation) -> bool;
    /// Map, copy `data` at `offset`, flush and unmap
    fn write_mapped(&self, allocation: &mut Self::Allocation, offset: u64, data: &[u8]) -> GfxResult<()>;
    /// Device address of a buffer created with `DEVICE_ADDRESS` usage
    fn buffer_address(&self, buffer: Self::Buffer) -> u64;

    /// Create a 2D view of an image
    fn create_image_view(&self, image: Self::Image, format: Format) -> GfxResult<Self::ImageView>;
    /// Destroy a view
    fn destroy_image_view(&self, view: Self::ImageView);
    /// Create a sampler
    fn create_sampler(&self, info: &SamplerInfo) -> GfxResult<Self::Sampler>;
    /// Destroy a sampler
    fn destroy_sampler(&self, sampler: Self::Sampler);

    // --- synchronization ----------------------------------------------------

    /// Create a fence, optionally already signalled
    fn create_fence(&self, signaled: bool) -> GfxResult<Self::Fence>;
    /// Destroy a fence
    fn destroy_fence(&self, fence: Self::Fence);
    /// Block until the fence is signalled (infinite timeout)
    fn wait_for_fence(&self, fence: Self::Fence) -> GfxResult<()>;
    /// Return a fence to the unsignalled state
    fn reset_fence(&self, fence: Self::Fence) -> GfxResult<()>;
    /// Create a binary semaphore
    fn create_semaphore(&self) -> GfxResult<Self::Semaphore>;
    /// Destroy a semaphore
    fn destroy_semaphore(&self, semaphore: Self::Semaphore);
    /// Block until every queue is idle
    fn wait_idle(&self) -> GfxResult<()>;

    // --- commands -----------------------------------------------------------

    /// Allocate a resettable primary command buffer from the queue's pool
    fn allocate_command_buffer(&self, queue: QueueKind) -> GfxResult<Self::CommandBuffer>;
    /// Return a command buffer to its pool
    fn free_command_buffer(&self, queue: QueueKind, command_buffer: Self::CommandBuffer);
    /// Reset and begin recording
    fn begin_commands(&self, command_buffer: Self::CommandBuffer, one_time: bool) -> GfxResult<()>;
    /// Finish recording
    fn end_commands(&self, command_buffer: Self::CommandBuffer) -> GfxResult<()>;
    /// Submit one command buffer
    fn submit(&self, queue: QueueKind, submit: &Submit<'_, Self>) -> GfxResult<()>;

    /// Transition an image
    fn cmd_image_barrier(&self, cb: Self::CommandBuffer, image: Self::Image, aspect: ImageAspect, from: ImageState, to: ImageState);
    /// Order accesses to a buffer
    fn cmd_buffer_barrier(&self, cb: Self::CommandBuffer, buffer: Self::Buffer, from: BufferAccess, to: BufferAccess);
    /// Order accesses to all memory
    fn cmd_memory_barrier(&self, cb: Self::CommandBuffer, from: BufferAccess, to: BufferAccess);
    /// Copy between buffers
    fn cmd_copy_buffer(&self, cb: Self::CommandBuffer, src: Self::Buffer, dst: Self::Buffer, region: BufferCopy);
    /// Copy tightly packed texels into a whole image in transfer-destination state
    fn cmd_copy_buffer_to_image(&self, cb: Self::CommandBuffer, src: Self::Buffer, dst: Self::Image, aspect: ImageAspect, extent: Extent3D);
    /// Move a presentable image between the graphics and present queue families
    fn cmd_queue_ownership(&self, cb: Self::CommandBuffer, image: Self::Image, transfer: OwnershipTransfer);
    /// Begin a render pass, clearing every attachment
    fn cmd_begin_render_pass(&self, cb: Self::CommandBuffer, pass: Self::RenderPass, framebuffer: Self::Framebuffer, extent: Extent2D, clear: &ClearValues);
    /// End the render pass
    fn cmd_end_render_pass(&self, cb: Self::CommandBuffer);
    /// Bind a pipeline
    fn cmd_bind_pipeline(&self, cb: Self::CommandBuffer, kind: PipelineKind, pipeline: Self::Pipeline);
    /// Bind descriptor set 0
    fn cmd_bind_descriptor_set(&self, cb: Self::CommandBuffer, kind: PipelineKind, layout: Self::PipelineLayout, set: Self::DescriptorSet);
    /// Update push constants from offset 0
    fn cmd_push_constants(&self, cb: Self::CommandBuffer, layout: Self::PipelineLayout, data: &[u8]);
    /// Set dynamic viewport and scissor
    fn cmd_set_viewport(&self, cb: Self::CommandBuffer, viewport: &Viewport, scissor: &Rect2D);
    /// Bind a vertex buffer at binding 0
    fn cmd_bind_vertex_buffer(&self, cb: Self::CommandBuffer, buffer: Self::Buffer);
    /// Bind an index buffer
    fn cmd_bind_index_buffer(&self, cb: Self::CommandBuffer, buffer: Self::Buffer, index_type: IndexType);
    /// Non-indexed draw
    fn cmd_draw(&self, cb: Self::CommandBuffer, vertex_count: u32, instance_count: u32);
    /// Indexed draw
    fn cmd_draw_indexed(&self, cb: Self::CommandBuffer, index_count: u32, instance_count: u32);
    /// Compute dispatch
    fn cmd_dispatch(&self, cb: Self::CommandBuffer, x: u32, y: u32, z: u32);
    /// Build an acceleration structure
    fn cmd_build_acceleration_structure(&self, cb: Self::CommandBuffer, build: &AccelerationBuild<'_, Self>);
    /// Trace rays
    fn cmd_trace_rays(&self, cb: Self::CommandBuffer, regions: &SbtRegions, width: u32, height: u32, depth: u32);

    // --- presentation -------------------------------------------------------

    /// Query the surface
    fn surface_support(&self) -> GfxResult<SurfaceSupport>;
    /// Create a swapchain, retiring `old` if given
    fn create_swapchain(&self, config: &SurfaceConfig, old: Option<Self::Swapchain>) -> GfxResult<Self::Swapchain>;
    /// Destroy a swapchain and its images
    fn destroy_swapchain(&self, swapchain: Self::Swapchain);
    /// The swapchain's presentable images
    fn swapchain_images(&self, swapchain: Self::Swapchain) -> GfxResult<Vec<Self::Image>>;
    /// Acquire the next image, signalling `signal` (infinite timeout)
    fn acquire_next_image(&self, swapchain: Self::Swapchain, signal: Self::Semaphore) -> GfxResult<AcquireOutcome>;
    /// Queue an image for presentation after `wait`
    fn present(&self, swapchain: Self::Swapchain, image_index: u32, wait: Self::Semaphore) -> GfxResult<PresentOutcome>;

    // --- passes and pipelines -----------------------------------------------

    /// Create a render pass
    fn create_render_pass(&self, desc: &RenderPassDesc) -> GfxResult<Self::RenderPass>;
    /// Destroy a render pass
    fn destroy_render_pass(&self, pass: Self::RenderPass);
    /// Create a framebuffer over attachment views
    fn create_framebuffer(&self, pass: Self::RenderPass, attachments: &[Self::ImageView], extent: Extent2D) -> GfxResult<Self::Framebuffer>;
    /// Destroy a framebuffer
    fn destroy_framebuffer(&self, framebuffer: Self::Framebuffer);
    /// Create a shader module from SPIR-V
    fn create_shader_module(&self, spirv: &[u32]) -> GfxResult<Self::ShaderModule>;
    /// Destroy a shader module
    fn destroy_shader_module(&self, module: Self::ShaderModule);
    /// Create a pipeline layout (descriptor set 0 + push constants)
    fn create_pipeline_layout(&self, resources: &ResourceLayout) -> GfxResult<Self::PipelineLayout>;
    /// Destroy a pipeline layout
    fn destroy_pipeline_layout(&self, layout: Self::PipelineLayout);
    /// Create an empty pipeline cache
    fn create_pipeline_cache(&self) -> GfxResult<Self::PipelineCache>;
    /// Destroy a pipeline cache
    fn destroy_pipeline_cache(&self, cache: Self::PipelineCache);
    /// Create a graphics pipeline
    fn create_graphics_pipeline(&self, desc: &GraphicsPipelineDesc<'_, Self>) -> GfxResult<Self::Pipeline>;
    /// Create a compute pipeline
    fn create_compute_pipeline(&self, desc: &ComputePipelineDesc<Self>) -> GfxResult<Self::Pipeline>;
    /// Create a ray tracing pipeline
    fn create_ray_tracing_pipeline(&self, desc: &RayTracingPipelineDesc<'_, Self>) -> GfxResult<Self::Pipeline>;
    /// Destroy a pipeline
    fn destroy_pipeline(&self, pipeline: Self::Pipeline);
    /// Fetch `group_count` shader group handles in one call
    fn shader_group_handles(&self, pipeline: Self::Pipeline, group_count: u32) -> GfxResult<Vec<u8>>;

    /// Create a pool able to hold `sets` sets of `resources`
    fn create_descriptor_pool(&self, resources: &ResourceLayout, sets: u32) -> GfxResult<Self::DescriptorPool>;
    /// Destroy a pool and every set allocated from it
    fn destroy_descriptor_pool(&self, pool: Self::DescriptorPool);
    /// Allocate set 0 of `layout`
    fn allocate_descriptor_set(&self, pool: Self::DescriptorPool, layout: Self::PipelineLayout) -> GfxResult<Self::DescriptorSet>;
    /// Write descriptors
    fn write_descriptor_set(&self, set: Self::DescriptorSet, writes: &[DescriptorWrite<Self>]);

    // --- ray tracing --------------------------------------------------------

    /// Backing and scratch sizes for a build
    fn acceleration_structure_sizes(&self, geometry: &AccelerationGeometry) -> GfxResult<AccelerationSizes>;
    /// Create an acceleration structure over a backing buffer
    fn create_acceleration_structure(&self, kind: AccelerationKind, buffer: Self::Buffer, size: u64) -> GfxResult<Self::AccelerationStructure>;
    /// Destroy an acceleration structure (not its backing buffer)
    fn destroy_acceleration_structure(&self, accel: Self::AccelerationStructure);
    /// Device address referenced by instance records
    fn acceleration_structure_address(&self, accel: Self::AccelerationStructure) -> u64;
}

/// Round `value` up to a multiple of `alignment` (a power of two or zero)
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        value
    } else {
        (value + alignment - 1) & !(alignment - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 64), 0);
        assert_eq!(align_up(1, 64), 64);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(align_up(65, 64), 128);
        assert_eq!(align_up(17, 0), 17);
        assert_eq!(align_up(17, 1), 17);
    }

    #[test]
    fn test_geometry_kind() {
        let tlas = AccelerationGeometry::Instances { address: 0x1000, count: 3 };
        assert_eq!(tlas.kind(), AccelerationKind::TopLevel);
        assert_eq!(tlas.primitive_count(), 3);
    }
}
