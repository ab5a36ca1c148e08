//! Software explicit device.
//!
//! `HeadlessDevice` implements [`Device`] entirely in host memory: allocations are
//! byte vectors, command buffers are lists of [`HeadlessCommand`]s executed when
//! their submission completes, and the swapchain is a ring of ordinary images.
//! It exists so the explicit engine can run (and be tested) without a GPU.
//!
//! Beyond executing work it checks the protocol the engine must follow and
//! records violations instead of crashing: re-recording a command buffer that is
//! still pending, submitting with a signalled fence, waiting on a semaphore that
//! nothing signalled, destroying objects referenced by unfinished work, copying
//! into an image that is not in transfer-destination state, and so on. Tests read
//! them back through [`HeadlessDevice::validation_errors`].
//!
//! With [`Completion::Deferred`] nothing completes until a fence is waited on,
//! which makes CPU/GPU overlap observable through [`DeviceEvent::FenceWait`].

mod failure;
mod state;

pub use failure::FailPoint;

use parking_lot::Mutex;

use self::state::{
    group_handle, AccelRecord, BufferRecord, CommandBufferRecord, FramebufferRecord, PendingSubmit,
    PipelineRecord, PoolRecord, RecordingState, SetRecord, State, SwapchainRecord,
};
use super::{
    AccelerationBuild, AccelerationGeometry, AccelerationKind, AccelerationSizes, AcquireOutcome,
    BufferAccess, BufferCopy, BufferDesc, ComputePipelineDesc, DescriptorWrite, Device,
    DeviceCapabilities, GraphicsPipelineDesc, ImageAspect, ImageDesc, ImageState, MemoryLocation,
    OwnershipTransfer, PresentOutcome, QueueKind, RayTracingPipelineDesc, RayTracingProperties,
    RenderPassDesc, SbtRegions, Submit, SurfaceConfig, SurfaceSupport,
};
use crate::error::{GfxError, GfxResult};
use crate::pipeline::{PipelineKind, Rect2D, Viewport};
use crate::types::{
    BufferUsage, ClearValues, CompositeAlpha, Extent2D, Extent3D, Format, IndexType, PresentMode,
    ResourceLayout, SamplerInfo, SurfaceTransform,
};

pub use crate::types::SPIRV_MAGIC;

macro_rules! handles {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {$(
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub(crate) u64);
    )*};
}

handles! {
    /// Headless buffer
    BufferId,
    /// Headless image
    ImageId,
    /// Headless image view
    ImageViewId,
    /// Headless sampler
    SamplerId,
    /// Headless fence
    FenceId,
    /// Headless semaphore
    SemaphoreId,
    /// Headless command buffer
    CommandBufferId,
    /// Headless render pass
    RenderPassId,
    /// Headless framebuffer
    FramebufferId,
    /// Headless shader module
    ShaderModuleId,
    /// Headless pipeline layout
    PipelineLayoutId,
    /// Headless pipeline cache
    PipelineCacheId,
    /// Headless pipeline
    PipelineId,
    /// Headless descriptor pool
    DescriptorPoolId,
    /// Headless descriptor set
    DescriptorSetId,
    /// Headless swapchain
    SwapchainId,
    /// Headless acceleration structure
    AccelId,
}

/// Memory owned by a headless buffer or image
#[derive(Debug)]
pub struct HeadlessAllocation {
    id: u64,
}

/// When submitted work completes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Completion {
    /// Inside `submit`
    #[default]
    Immediate,
    /// When a fence covering it is waited on, or on `wait_idle`
    Deferred,
}

/// Headless device parameters
#[derive(Debug, Clone, PartialEq)]
pub struct HeadlessConfig {
    /// Simulated window framebuffer extent
    pub surface_extent: Extent2D,
    /// Minimum swapchain image count
    pub min_image_count: u32,
    /// Maximum swapchain image count (0 = unbounded)
    pub max_image_count: u32,
    /// Formats the surface offers
    pub surface_formats: Vec<Format>,
    /// Present modes the surface offers
    pub present_modes: Vec<PresentMode>,
    /// Present on a different queue family than graphics
    pub separate_present_queue: bool,
    /// Device-local memory is also host-visible (unified memory)
    pub device_local_host_visible: bool,
    /// Work completion model
    pub completion: Completion,
    /// Ray tracing limits; `None` disables ray tracing
    pub ray_tracing: Option<RayTracingProperties>,
}

impl Default for HeadlessConfig {
    fn default() -> Self {
        Self {
            surface_extent: Extent2D::new(800, 600),
            min_image_count: 2,
            max_image_count: 3,
            surface_formats: vec![Format::Bgra8Srgb, Format::Rgba8Srgb],
            present_modes: vec![PresentMode::Fifo, PresentMode::Mailbox],
            separate_present_queue: false,
            device_local_host_visible: false,
            completion: Completion::Immediate,
            ray_tracing: Some(RayTracingProperties {
                shader_group_handle_size: 32,
                shader_group_handle_alignment: 32,
                shader_group_base_alignment: 64,
                scratch_offset_alignment: 128,
                max_recursion_depth: 31,
            }),
        }
    }
}

/// A recorded command
#[derive(Debug, Clone, PartialEq)]
pub enum HeadlessCommand {
    /// Image layout transition
    ImageBarrier {
        /// Image
        image: ImageId,
        /// Aspect
        aspect: ImageAspect,
        /// Previous state
        from: ImageState,
        /// Next state
        to: ImageState,
    },
    /// Buffer barrier
    BufferBarrier {
        /// Buffer
        buffer: BufferId,
        /// Source scope
        from: BufferAccess,
        /// Destination scope
        to: BufferAccess,
    },
    /// Global memory barrier
    MemoryBarrier {
        /// Source scope
        from: BufferAccess,
        /// Destination scope
        to: BufferAccess,
    },
    /// Buffer to buffer copy
    CopyBuffer {
        /// Source
        src: BufferId,
        /// Destination
        dst: BufferId,
        /// Region
        region: BufferCopy,
    },
    /// Buffer to image copy
    CopyBufferToImage {
        /// Source
        src: BufferId,
        /// Destination
        dst: ImageId,
        /// Copied extent
        extent: Extent3D,
    },
    /// Queue family ownership transfer
    QueueOwnership {
        /// Swapchain image
        image: ImageId,
        /// Direction
        transfer: OwnershipTransfer,
    },
    /// Render pass begin
    BeginRenderPass {
        /// Pass
        pass: RenderPassId,
        /// Framebuffer
        framebuffer: FramebufferId,
        /// Render area
        extent: Extent2D,
        /// Colour clear value
        clear: [f32; 4],
    },
    /// Render pass end
    EndRenderPass,
    /// Pipeline bind
    BindPipeline {
        /// Bind point
        kind: PipelineKind,
        /// Pipeline
        pipeline: PipelineId,
    },
    /// Descriptor set bind
    BindDescriptorSet {
        /// Bind point
        kind: PipelineKind,
        /// Set
        set: DescriptorSetId,
    },
    /// Push constant update
    PushConstants {
        /// Byte count
        size: usize,
    },
    /// Dynamic viewport
    SetViewport {
        /// Viewport
        viewport: Viewport,
        /// Scissor
        scissor: Rect2D,
    },
    /// Vertex buffer bind
    BindVertexBuffer {
        /// Buffer
        buffer: BufferId,
    },
    /// Index buffer bind
    BindIndexBuffer {
        /// Buffer
        buffer: BufferId,
        /// Element width
        index_type: IndexType,
    },
    /// Draw
    Draw {
        /// Vertices
        vertex_count: u32,
        /// Instances
        instance_count: u32,
    },
    /// Indexed draw
    DrawIndexed {
        /// Indices
        index_count: u32,
        /// Instances
        instance_count: u32,
    },
    /// Compute dispatch
    Dispatch {
        /// Groups in x
        x: u32,
        /// Groups in y
        y: u32,
        /// Groups in z
        z: u32,
    },
    /// Acceleration structure build
    BuildAccelerationStructure {
        /// Destination
        dst: AccelId,
        /// Input geometry
        geometry: AccelerationGeometry,
        /// Scratch address
        scratch_address: u64,
    },
    /// Ray dispatch
    TraceRays {
        /// Shader binding table regions
        regions: SbtRegions,
        /// Width
        width: u32,
        /// Height
        height: u32,
        /// Depth
        depth: u32,
    },
}

impl HeadlessCommand {
    /// Whether the command mentions the object with raw id `object`
    fn references(&self, object: u64) -> bool {
        match self {
            Self::ImageBarrier { image, .. } | Self::QueueOwnership { image, .. } => image.0 == object,
            Self::BufferBarrier { buffer, .. }
            | Self::BindVertexBuffer { buffer }
            | Self::BindIndexBuffer { buffer, .. } => buffer.0 == object,
            Self::CopyBuffer { src, dst, .. } => src.0 == object || dst.0 == object,
            Self::CopyBufferToImage { src, dst, .. } => src.0 == object || dst.0 == object,
            Self::BeginRenderPass { pass, framebuffer, .. } => pass.0 == object || framebuffer.0 == object,
            Self::BindPipeline { pipeline, .. } => pipeline.0 == object,
            Self::BindDescriptorSet { set, .. } => set.0 == object,
            Self::BuildAccelerationStructure { dst, .. } => dst.0 == object,
            _ => false,
        }
    }
}

/// Observable device activity
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// A command buffer was submitted
    Submitted {
        /// Queue
        queue: QueueKind,
        /// Command buffer
        command_buffer: CommandBufferId,
        /// Fence signalled on completion
        fence: Option<FenceId>,
    },
    /// A fence was waited on; `stalled` when the wait had to retire work
    FenceWait {
        /// Fence
        fence: FenceId,
        /// The fence was not yet signalled
        stalled: bool,
    },
    /// A swapchain image was acquired
    Acquired {
        /// Image index
        index: u32,
    },
    /// A swapchain image was presented
    Presented {
        /// Image index
        index: u32,
    },
    /// A swapchain was created
    SwapchainCreated {
        /// Swapchain
        swapchain: SwapchainId,
        /// Creation parameters
        config: SurfaceConfig,
    },
    /// A swapchain was destroyed
    SwapchainDestroyed {
        /// Swapchain
        swapchain: SwapchainId,
    },
    /// The device was drained
    WaitIdle,
}

/// Counts of live objects, for leak checks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LiveObjects {
    /// Buffers
    pub buffers: usize,
    /// Images, swapchain images included
    pub images: usize,
    /// Memory allocations
    pub allocations: usize,
    /// Image views
    pub views: usize,
    /// Samplers
    pub samplers: usize,
    /// Fences
    pub fences: usize,
    /// Semaphores
    pub semaphores: usize,
    /// Command buffers
    pub command_buffers: usize,
    /// Render passes
    pub render_passes: usize,
    /// Framebuffers
    pub framebuffers: usize,
    /// Shader modules
    pub shader_modules: usize,
    /// Pipeline layouts
    pub pipeline_layouts: usize,
    /// Pipeline caches
    pub pipeline_caches: usize,
    /// Pipelines
    pub pipelines: usize,
    /// Descriptor pools
    pub descriptor_pools: usize,
    /// Swapchains
    pub swapchains: usize,
    /// Acceleration structures
    pub acceleration_structures: usize,
}

/// Software explicit device
pub struct HeadlessDevice {
    state: Mutex<State>,
    config: HeadlessConfig,
    capabilities: DeviceCapabilities,
}

fn inject(state: &mut State, point: FailPoint) -> GfxResult<()> {
    match state.failures.check(point) {
        Some(error) => {
            log::debug!("Injected {point:?} failure: {error}");
            Err(error)
        }
        None => Ok(()),
    }
}

impl HeadlessDevice {
    /// Create a device
    pub fn new(config: HeadlessConfig) -> Self {
        log::info!(
            "Created headless device ({:?} completion, ray tracing {})",
            config.completion,
            if config.ray_tracing.is_some() { "on" } else { "off" }
        );
        let capabilities = DeviceCapabilities {
            name: "headless".to_string(),
            separate_present_queue: config.separate_present_queue,
            ray_tracing: config.ray_tracing,
        };
        Self { state: Mutex::new(State::new(config.surface_extent)), config, capabilities }
    }

    /// Device parameters
    pub fn config(&self) -> &HeadlessConfig {
        &self.config
    }

    /// Make the `nth` (1-based) next call of `point` fail once with `error`
    pub fn fail_nth(&self, point: FailPoint, nth: u32, error: GfxError) {
        self.state.lock().failures.arm(point, nth, error);
    }

    /// Drop every armed failure
    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    /// Simulate the window being resized; swapchains of another extent go out of date
    pub fn set_surface_extent(&self, extent: Extent2D) {
        self.state.lock().surface_extent = extent;
    }

    /// Override the result of the next acquire
    pub fn script_acquire(&self, outcome: AcquireOutcome) {
        self.state.lock().acquire_script.push_back(outcome);
    }

    /// Override the result of the next present
    pub fn script_present(&self, outcome: PresentOutcome) {
        self.state.lock().present_script.push_back(outcome);
    }

    /// Snapshot of live object counts
    pub fn live_objects(&self) -> LiveObjects {
        let state = self.state.lock();
        LiveObjects {
            buffers: state.buffers.len(),
            images: state.images.len(),
            allocations: state.memory.len(),
            views: state.views.len(),
            samplers: state.samplers.len(),
            fences: state.fences.len(),
            semaphores: state.semaphores.len(),
            command_buffers: state.command_buffers.len(),
            render_passes: state.render_passes.len(),
            framebuffers: state.framebuffers.len(),
            shader_modules: state.shader_modules.len(),
            pipeline_layouts: state.layouts.len(),
            pipeline_caches: state.caches.len(),
            pipelines: state.pipelines.len(),
            descriptor_pools: state.pools.len(),
            swapchains: state.swapchains.len(),
            acceleration_structures: state.accels.len(),
        }
    }

    /// Current bytes of a buffer
    pub fn buffer_contents(&self, buffer: BufferId) -> Option<Vec<u8>> {
        let state = self.state.lock();
        let record = state.buffers.get(&buffer.0)?;
        state.memory.get(&record.allocation).map(|m| m.bytes.clone())
    }

    /// Current texels of an image
    pub fn image_contents(&self, image: ImageId) -> Option<Vec<u8>> {
        let state = self.state.lock();
        let record = state.images.get(&image.0)?;
        state.memory.get(&record.allocation).map(|m| m.bytes.clone())
    }

    /// Current state of an image
    pub fn image_state(&self, image: ImageId) -> Option<ImageState> {
        self.state.lock().images.get(&image.0).map(|i| i.state)
    }

    /// Whether an acceleration structure has been built
    pub fn is_built(&self, accel: AccelId) -> bool {
        self.state.lock().accels.get(&accel.0).is_some_and(|a| a.built)
    }

    /// Every event so far
    pub fn events(&self) -> Vec<DeviceEvent> {
        self.state.lock().events.clone()
    }

    /// Drain the event log
    pub fn take_events(&self) -> Vec<DeviceEvent> {
        std::mem::take(&mut self.state.lock().events)
    }

    /// Number of fence waits that had to retire unfinished work
    pub fn stall_count(&self) -> usize {
        self.state
            .lock()
            .events
            .iter()
            .filter(|e| matches!(e, DeviceEvent::FenceWait { stalled: true, .. }))
            .count()
    }

    /// Protocol violations observed so far
    pub fn validation_errors(&self) -> Vec<String> {
        self.state.lock().validation.clone()
    }

    /// Signal a semaphore as an external producer would
    pub fn signal_semaphore(&self, semaphore: SemaphoreId) {
        let mut guard = self.state.lock();
        match guard.semaphores.get_mut(&semaphore.0) {
            Some(count) => *count += 1,
            None => guard.validate(format!("signal of destroyed {semaphore:?}")),
        }
    }

    /// Submissions not yet completed
    pub fn pending_submissions(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Complete all outstanding work without logging a wait
    pub fn complete_all(&self) {
        self.state.lock().retire_all(self.config.ray_tracing.as_ref());
    }

    fn record(&self, cb: CommandBufferId, command: HeadlessCommand) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let recording = state.command_buffers.get(&cb.0).is_some_and(|r| r.state == RecordingState::Recording);
        if !recording {
            state.validate(format!("{command:?} recorded into {cb:?} outside recording"));
            return;
        }
        if let Some(record) = state.command_buffers.get_mut(&cb.0) {
            record.commands.push(command);
        }
    }

    fn require_ray_tracing(&self) -> GfxResult<&RayTracingProperties> {
        self.capabilities.ray_tracing.as_ref().ok_or(GfxError::FeatureNotSupported)
    }

    fn consume_semaphore(state: &mut State, semaphore: SemaphoreId) {
        match state.semaphores.get_mut(&semaphore.0) {
            Some(count) if *count > 0 => *count -= 1,
            _ => state.validate(format!("wait on {semaphore:?} which nothing signalled")),
        }
    }
}

impl Device for HeadlessDevice {
    type Buffer = BufferId;
    type Image = ImageId;
    type ImageView = ImageViewId;
    type Sampler = SamplerId;
    type Allocation = HeadlessAllocation;
    type Fence = FenceId;
    type Semaphore = SemaphoreId;
    type CommandBuffer = CommandBufferId;
    type RenderPass = RenderPassId;
    type Framebuffer = FramebufferId;
    type ShaderModule = ShaderModuleId;
    type PipelineLayout = PipelineLayoutId;
    type PipelineCache = PipelineCacheId;
    type Pipeline = PipelineId;
    type DescriptorPool = DescriptorPoolId;
    type DescriptorSet = DescriptorSetId;
    type Swapchain = SwapchainId;
    type AccelerationStructure = AccelId;

    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn create_buffer(&self, desc: &BufferDesc) -> GfxResult<(BufferId, HeadlessAllocation)> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        inject(state, FailPoint::CreateBuffer)?;
        if desc.size == 0 {
            return Err(GfxError::InvalidUsage("zero-sized buffer"));
        }
        let host_visible = desc.location == MemoryLocation::HostVisible || self.config.device_local_host_visible;
        let allocation = state.alloc_memory(desc.size, host_visible);
        let address = state.alloc_address(desc.size);
        let id = state.id();
        state.buffers.insert(id, BufferRecord { allocation, size: desc.size, usage: desc.usage, address });
        log::trace!("headless buffer {id} ({}, {} bytes)", desc.label, desc.size);
        Ok((BufferId(id), HeadlessAllocation { id: allocation }))
    }

    fn destroy_buffer(&self, buffer: BufferId, allocation: HeadlessAllocation) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.in_flight(buffer.0) {
            state.validate(format!("{buffer:?} destroyed while in use by pending work"));
        }
        match state.buffers.remove(&buffer.0) {
            Some(record) => {
                if record.allocation != allocation.id {
                    state.validate(format!("{buffer:?} destroyed with a foreign allocation"));
                }
                state.memory.remove(&record.allocation);
            }
            None => state.validate(format!("{buffer:?} destroyed twice")),
        }
    }

    fn create_image(&self, desc: &ImageDesc) -> GfxResult<(ImageId, HeadlessAllocation)> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        inject(state, FailPoint::CreateImage)?;
        if desc.extent.texel_count() == 0 {
            return Err(GfxError::InvalidUsage("zero-sized image"));
        }
        let id = state.create_image_record(desc.extent, desc.format, None);
        let allocation = state.images[&id].allocation;
        Ok((ImageId(id), HeadlessAllocation { id: allocation }))
    }

    fn destroy_image(&self, image: ImageId, allocation: HeadlessAllocation) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.in_flight(image.0) {
            state.validate(format!("{image:?} destroyed while in use by pending work"));
        }
        match state.images.get(&image.0).map(|i| (i.allocation, i.swapchain)) {
            Some((memory, swapchain)) => {
                if swapchain.is_some() {
                    state.validate(format!("{image:?} belongs to a swapchain"));
                }
                if memory != allocation.id {
                    state.validate(format!("{image:?} destroyed with a foreign allocation"));
                }
                state.remove_image_record(image.0);
            }
            None => state.validate(format!("{image:?} destroyed twice")),
        }
    }

    fn is_host_visible(&self, allocation: &HeadlessAllocation) -> bool {
        self.state.lock().memory.get(&allocation.id).is_some_and(|m| m.host_visible)
    }

    fn write_mapped(&self, allocation: &mut HeadlessAllocation, offset: u64, data: &[u8]) -> GfxResult<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        inject(state, FailPoint::WriteMapped)?;
        let memory = state
            .memory
            .get_mut(&allocation.id)
            .ok_or(GfxError::InvalidUsage("write to a freed allocation"))?;
        if !memory.host_visible {
            return Err(GfxError::FailedToMapMemory);
        }
        let start = offset as usize;
        let end = start + data.len();
        if end > memory.bytes.len() {
            return Err(GfxError::InvalidUsage("write past the end of the allocation"));
        }
        memory.bytes[start..end].copy_from_slice(data);
        Ok(())
    }

    fn buffer_address(&self, buffer: BufferId) -> u64 {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        match state.buffers.get(&buffer.0).map(|b| (b.usage, b.address)) {
            Some((usage, address)) => {
                if !usage.contains(BufferUsage::DEVICE_ADDRESS) {
                    state.validate(format!("address of {buffer:?} without DEVICE_ADDRESS usage"));
                }
                address
            }
            None => {
                state.validate(format!("address of destroyed {buffer:?}"));
                0
            }
        }
    }

    fn create_image_view(&self, image: ImageId, _format: Format) -> GfxResult<ImageViewId> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        inject(state, FailPoint::CreateImageView)?;
        if !state.images.contains_key(&image.0) {
            return Err(GfxError::InvalidUsage("view of a destroyed image"));
        }
        let id = state.id();
        state.views.insert(id, image.0);
        Ok(ImageViewId(id))
    }

    fn destroy_image_view(&self, view: ImageViewId) {
        let mut guard = self.state.lock();
        if guard.views.remove(&view.0).is_none() {
            guard.validate(format!("{view:?} destroyed twice"));
        }
    }

    fn create_sampler(&self, _info: &SamplerInfo) -> GfxResult<SamplerId> {
        let mut guard = self.state.lock();
        let id = guard.id();
        guard.samplers.insert(id);
        Ok(SamplerId(id))
    }

    fn destroy_sampler(&self, sampler: SamplerId) {
        let mut guard = self.state.lock();
        if !guard.samplers.remove(&sampler.0) {
            guard.validate(format!("{sampler:?} destroyed twice"));
        }
    }

    fn create_fence(&self, signaled: bool) -> GfxResult<FenceId> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        inject(state, FailPoint::CreateFence)?;
        let id = state.id();
        state.fences.insert(id, signaled);
        Ok(FenceId(id))
    }

    fn destroy_fence(&self, fence: FenceId) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.fence_pending(fence.0) {
            state.validate(format!("{fence:?} destroyed while pending"));
        }
        if state.fences.remove(&fence.0).is_none() {
            state.validate(format!("{fence:?} destroyed twice"));
        }
    }

    fn wait_for_fence(&self, fence: FenceId) -> GfxResult<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        match state.fences.get(&fence.0).copied() {
            None => Err(GfxError::InvalidUsage("wait on a destroyed fence")),
            Some(true) => {
                state.events.push(DeviceEvent::FenceWait { fence, stalled: false });
                Ok(())
            }
            Some(false) if state.fence_pending(fence.0) => {
                state.events.push(DeviceEvent::FenceWait { fence, stalled: true });
                state.retire_through(fence.0, self.config.ray_tracing.as_ref());
                Ok(())
            }
            Some(false) => {
                state.validate(format!("wait on {fence:?} which no submission will signal"));
                Err(GfxError::Unknown("fence would never signal".to_string()))
            }
        }
    }

    fn reset_fence(&self, fence: FenceId) -> GfxResult<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.fence_pending(fence.0) {
            state.validate(format!("{fence:?} reset while pending"));
        }
        match state.fences.get_mut(&fence.0) {
            Some(signaled) => {
                *signaled = false;
                Ok(())
            }
            None => Err(GfxError::InvalidUsage("reset of a destroyed fence")),
        }
    }

    fn create_semaphore(&self) -> GfxResult<SemaphoreId> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        inject(state, FailPoint::CreateSemaphore)?;
        let id = state.id();
        state.semaphores.insert(id, 0);
        Ok(SemaphoreId(id))
    }

    fn destroy_semaphore(&self, semaphore: SemaphoreId) {
        let mut guard = self.state.lock();
        if guard.semaphores.remove(&semaphore.0).is_none() {
            guard.validate(format!("{semaphore:?} destroyed twice"));
        }
    }

    fn wait_idle(&self) -> GfxResult<()> {
        let mut guard = self.state.lock();
        guard.retire_all(self.config.ray_tracing.as_ref());
        guard.events.push(DeviceEvent::WaitIdle);
        Ok(())
    }

    fn allocate_command_buffer(&self, queue: QueueKind) -> GfxResult<CommandBufferId> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        inject(state, FailPoint::AllocateCommandBuffer)?;
        let id = state.id();
        state.command_buffers.insert(
            id,
            CommandBufferRecord { queue, state: RecordingState::Initial, commands: Vec::new() },
        );
        Ok(CommandBufferId(id))
    }

    fn free_command_buffer(&self, queue: QueueKind, command_buffer: CommandBufferId) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        match state.command_buffers.remove(&command_buffer.0) {
            Some(record) => {
                if record.state == RecordingState::Pending {
                    state.validate(format!("{command_buffer:?} freed while pending"));
                }
                if record.queue != queue {
                    state.validate(format!("{command_buffer:?} freed to the wrong pool"));
                }
            }
            None => state.validate(format!("{command_buffer:?} freed twice")),
        }
    }

    fn begin_commands(&self, command_buffer: CommandBufferId, _one_time: bool) -> GfxResult<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(record) = state.command_buffers.get_mut(&command_buffer.0) else {
            return Err(GfxError::InvalidUsage("recording into a freed command buffer"));
        };
        let previous = record.state;
        record.state = RecordingState::Recording;
        record.commands.clear();
        if previous == RecordingState::Pending {
            state.validate(format!("{command_buffer:?} re-recorded while its submission is pending"));
        }
        Ok(())
    }

    fn end_commands(&self, command_buffer: CommandBufferId) -> GfxResult<()> {
        let mut guard = self.state.lock();
        match guard.command_buffers.get_mut(&command_buffer.0) {
            Some(record) if record.state == RecordingState::Recording => {
                record.state = RecordingState::Executable;
                Ok(())
            }
            _ => Err(GfxError::InvalidUsage("end of a command buffer that is not recording")),
        }
    }

    fn submit(&self, queue: QueueKind, submit: &Submit<'_, Self>) -> GfxResult<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        inject(state, FailPoint::Submit)?;

        let cb = submit.command_buffer;
        match state.command_buffers.get_mut(&cb.0) {
            Some(record) if record.state == RecordingState::Executable => record.state = RecordingState::Pending,
            _ => return Err(GfxError::InvalidUsage("submit of a command buffer that is not executable")),
        }
        if let Some((semaphore, _)) = submit.wait {
            Self::consume_semaphore(state, semaphore);
        }
        if let Some(fence) = submit.fence {
            if state.fences.get(&fence.0).copied().unwrap_or(true) {
                state.validate(format!("{fence:?} submitted while signalled or destroyed"));
            }
        }
        for semaphore in submit.signal {
            *state.semaphores.entry(semaphore.0).or_insert(0) += 1;
        }
        state.events.push(DeviceEvent::Submitted { queue, command_buffer: cb, fence: submit.fence });

        let pending = PendingSubmit { command_buffer: cb.0, fence: submit.fence.map(|f| f.0) };
        match self.config.completion {
            Completion::Immediate => state.complete(pending, self.config.ray_tracing.as_ref()),
            Completion::Deferred => state.pending.push_back(pending),
        }
        Ok(())
    }

    fn cmd_image_barrier(&self, cb: CommandBufferId, image: ImageId, aspect: ImageAspect, from: ImageState, to: ImageState) {
        self.record(cb, HeadlessCommand::ImageBarrier { image, aspect, from, to });
    }

    fn cmd_buffer_barrier(&self, cb: CommandBufferId, buffer: BufferId, from: BufferAccess, to: BufferAccess) {
        self.record(cb, HeadlessCommand::BufferBarrier { buffer, from, to });
    }

    fn cmd_memory_barrier(&self, cb: CommandBufferId, from: BufferAccess, to: BufferAccess) {
        self.record(cb, HeadlessCommand::MemoryBarrier { from, to });
    }

    fn cmd_copy_buffer(&self, cb: CommandBufferId, src: BufferId, dst: BufferId, region: BufferCopy) {
        self.record(cb, HeadlessCommand::CopyBuffer { src, dst, region });
    }

    fn cmd_copy_buffer_to_image(&self, cb: CommandBufferId, src: BufferId, dst: ImageId, _aspect: ImageAspect, extent: Extent3D) {
        self.record(cb, HeadlessCommand::CopyBufferToImage { src, dst, extent });
    }

    fn cmd_queue_ownership(&self, cb: CommandBufferId, image: ImageId, transfer: OwnershipTransfer) {
        if !self.config.separate_present_queue {
            self.state.lock().validate("ownership transfer without a separate present queue".to_string());
        }
        self.record(cb, HeadlessCommand::QueueOwnership { image, transfer });
    }

    fn cmd_begin_render_pass(&self, cb: CommandBufferId, pass: RenderPassId, framebuffer: FramebufferId, extent: Extent2D, clear: &ClearValues) {
        self.record(cb, HeadlessCommand::BeginRenderPass { pass, framebuffer, extent, clear: clear.color });
    }

    fn cmd_end_render_pass(&self, cb: CommandBufferId) {
        self.record(cb, HeadlessCommand::EndRenderPass);
    }

    fn cmd_bind_pipeline(&self, cb: CommandBufferId, kind: PipelineKind, pipeline: PipelineId) {
        self.record(cb, HeadlessCommand::BindPipeline { kind, pipeline });
    }

    fn cmd_bind_descriptor_set(&self, cb: CommandBufferId, kind: PipelineKind, _layout: PipelineLayoutId, set: DescriptorSetId) {
        self.record(cb, HeadlessCommand::BindDescriptorSet { kind, set });
    }

    fn cmd_push_constants(&self, cb: CommandBufferId, _layout: PipelineLayoutId, data: &[u8]) {
        self.record(cb, HeadlessCommand::PushConstants { size: data.len() });
    }

    fn cmd_set_viewport(&self, cb: CommandBufferId, viewport: &Viewport, scissor: &Rect2D) {
        self.record(cb, HeadlessCommand::SetViewport { viewport: *viewport, scissor: *scissor });
    }

    fn cmd_bind_vertex_buffer(&self, cb: CommandBufferId, buffer: BufferId) {
        self.record(cb, HeadlessCommand::BindVertexBuffer { buffer });
    }

    fn cmd_bind_index_buffer(&self, cb: CommandBufferId, buffer: BufferId, index_type: IndexType) {
        self.record(cb, HeadlessCommand::BindIndexBuffer { buffer, index_type });
    }

    fn cmd_draw(&self, cb: CommandBufferId, vertex_count: u32, instance_count: u32) {
        self.record(cb, HeadlessCommand::Draw { vertex_count, instance_count });
    }

    fn cmd_draw_indexed(&self, cb: CommandBufferId, index_count: u32, instance_count: u32) {
        self.record(cb, HeadlessCommand::DrawIndexed { index_count, instance_count });
    }

    fn cmd_dispatch(&self, cb: CommandBufferId, x: u32, y: u32, z: u32) {
        self.record(cb, HeadlessCommand::Dispatch { x, y, z });
    }

    fn cmd_build_acceleration_structure(&self, cb: CommandBufferId, build: &AccelerationBuild<'_, Self>) {
        self.record(
            cb,
            HeadlessCommand::BuildAccelerationStructure {
                dst: build.dst,
                geometry: *build.geometry,
                scratch_address: build.scratch_address,
            },
        );
    }

    fn cmd_trace_rays(&self, cb: CommandBufferId, regions: &SbtRegions, width: u32, height: u32, depth: u32) {
        self.record(cb, HeadlessCommand::TraceRays { regions: *regions, width, height, depth });
    }

    fn surface_support(&self) -> GfxResult<SurfaceSupport> {
        let surface_extent = self.state.lock().surface_extent;
        Ok(SurfaceSupport {
            formats: self.config.surface_formats.clone(),
            present_modes: self.config.present_modes.clone(),
            min_image_count: self.config.min_image_count,
            max_image_count: self.config.max_image_count,
            current_extent: Some(surface_extent),
            min_extent: Extent2D::new(1, 1),
            max_extent: Extent2D::new(16384, 16384),
            supports_identity: true,
            current_transform: SurfaceTransform::IDENTITY,
            composite_alpha: vec![CompositeAlpha::Opaque, CompositeAlpha::Inherit],
        })
    }

    fn create_swapchain(&self, config: &SurfaceConfig, old: Option<SwapchainId>) -> GfxResult<SwapchainId> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        inject(state, FailPoint::CreateSwapchain)?;
        if config.extent.is_zero() {
            return Err(GfxError::ZeroFramebufferSize);
        }
        let (min, max) = (self.config.min_image_count, self.config.max_image_count);
        if config.image_count < min || (max > 0 && config.image_count > max) {
            state.validate(format!("swapchain image count {} outside [{min}, {max}]", config.image_count));
        }
        if let Some(old) = old {
            match state.swapchains.get_mut(&old.0) {
                Some(record) => record.retired = true,
                None => state.validate(format!("{old:?} passed as old swapchain after destruction")),
            }
        }

        let id = state.id();
        let images = (0..config.image_count)
            .map(|_| state.create_image_record(config.extent.into(), config.format, Some(id)))
            .collect();
        state.swapchains.insert(id, SwapchainRecord { images, extent: config.extent, retired: false, next: 0 });
        state.events.push(DeviceEvent::SwapchainCreated { swapchain: SwapchainId(id), config: *config });
        Ok(SwapchainId(id))
    }

    fn destroy_swapchain(&self, swapchain: SwapchainId) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(record) = state.swapchains.remove(&swapchain.0) else {
            state.validate(format!("{swapchain:?} destroyed twice"));
            return;
        };
        for image in record.images {
            if state.in_flight(image) {
                state.validate(format!("{swapchain:?} destroyed while image {image} is in use"));
            }
            state.remove_image_record(image);
        }
        state.events.push(DeviceEvent::SwapchainDestroyed { swapchain });
    }

    fn swapchain_images(&self, swapchain: SwapchainId) -> GfxResult<Vec<ImageId>> {
        let state = self.state.lock();
        let record = state
            .swapchains
            .get(&swapchain.0)
            .ok_or(GfxError::InvalidUsage("images of a destroyed swapchain"))?;
        Ok(record.images.iter().map(|i| ImageId(*i)).collect())
    }

    fn acquire_next_image(&self, swapchain: SwapchainId, signal: SemaphoreId) -> GfxResult<AcquireOutcome> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        inject(state, FailPoint::AcquireNextImage)?;

        let surface_extent = state.surface_extent;
        let scripted = state.acquire_script.pop_front();
        let record = state
            .swapchains
            .get_mut(&swapchain.0)
            .ok_or(GfxError::InvalidUsage("acquire from a destroyed swapchain"))?;
        if record.retired {
            return Ok(AcquireOutcome::OutOfDate);
        }
        let suboptimal = match scripted {
            Some(AcquireOutcome::OutOfDate) => return Ok(AcquireOutcome::OutOfDate),
            Some(AcquireOutcome::Acquired { suboptimal, .. }) => suboptimal,
            None => false,
        };
        if record.extent != surface_extent {
            return Ok(AcquireOutcome::OutOfDate);
        }

        let index = record.next;
        record.next = (index + 1) % record.images.len() as u32;
        match state.semaphores.get_mut(&signal.0) {
            Some(count) => *count += 1,
            None => state.validate(format!("acquire signals destroyed {signal:?}")),
        }
        state.events.push(DeviceEvent::Acquired { index });
        Ok(AcquireOutcome::Acquired { index, suboptimal })
    }

    fn present(&self, swapchain: SwapchainId, image_index: u32, wait: SemaphoreId) -> GfxResult<PresentOutcome> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        inject(state, FailPoint::Present)?;
        Self::consume_semaphore(state, wait);

        let surface_extent = state.surface_extent;
        let (image, extent, retired) = {
            let record = state
                .swapchains
                .get(&swapchain.0)
                .ok_or(GfxError::InvalidUsage("present to a destroyed swapchain"))?;
            let image = record
                .images
                .get(image_index as usize)
                .copied()
                .ok_or(GfxError::InvalidUsage("present of an out-of-range image"))?;
            (image, record.extent, record.retired)
        };
        if self.config.completion == Completion::Immediate {
            let image_state = state.images.get(&image).map(|i| i.state);
            if image_state != Some(ImageState::Present) {
                state.validate(format!("image {image_index} presented in {image_state:?} state"));
            }
        }
        state.events.push(DeviceEvent::Presented { index: image_index });

        if let Some(outcome) = state.present_script.pop_front() {
            return Ok(outcome);
        }
        if retired || extent != surface_extent {
            return Ok(PresentOutcome::OutOfDate);
        }
        Ok(PresentOutcome::Presented)
    }

    fn create_render_pass(&self, desc: &RenderPassDesc) -> GfxResult<RenderPassId> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        inject(state, FailPoint::CreateRenderPass)?;
        let id = state.id();
        state.render_passes.insert(id, desc.clone());
        Ok(RenderPassId(id))
    }

    fn destroy_render_pass(&self, pass: RenderPassId) {
        let mut guard = self.state.lock();
        if guard.render_passes.remove(&pass.0).is_none() {
            guard.validate(format!("{pass:?} destroyed twice"));
        }
    }

    fn create_framebuffer(&self, pass: RenderPassId, attachments: &[ImageViewId], extent: Extent2D) -> GfxResult<FramebufferId> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        inject(state, FailPoint::CreateFramebuffer)?;
        if !state.render_passes.contains_key(&pass.0) {
            return Err(GfxError::InvalidUsage("framebuffer for a destroyed render pass"));
        }
        for view in attachments {
            let image_extent = state
                .views
                .get(&view.0)
                .and_then(|image| state.images.get(image))
                .map(|image| image.extent.to_2d());
            if image_extent != Some(extent) {
                state.validate(format!("attachment {view:?} is {image_extent:?}, framebuffer is {extent:?}"));
            }
        }
        let id = state.id();
        state.framebuffers.insert(
            id,
            FramebufferRecord { pass: pass.0, attachments: attachments.iter().map(|v| v.0).collect(), extent },
        );
        Ok(FramebufferId(id))
    }

    fn destroy_framebuffer(&self, framebuffer: FramebufferId) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.in_flight(framebuffer.0) {
            state.validate(format!("{framebuffer:?} destroyed while in use"));
        }
        if state.framebuffers.remove(&framebuffer.0).is_none() {
            state.validate(format!("{framebuffer:?} destroyed twice"));
        }
    }

    fn create_shader_module(&self, spirv: &[u32]) -> GfxResult<ShaderModuleId> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        inject(state, FailPoint::CreateShaderModule)?;
        if spirv.first() != Some(&SPIRV_MAGIC) {
            return Err(GfxError::BadShaderCode);
        }
        let id = state.id();
        state.shader_modules.insert(id);
        Ok(ShaderModuleId(id))
    }

    fn destroy_shader_module(&self, module: ShaderModuleId) {
        let mut guard = self.state.lock();
        if !guard.shader_modules.remove(&module.0) {
            guard.validate(format!("{module:?} destroyed twice"));
        }
    }

    fn create_pipeline_layout(&self, resources: &ResourceLayout) -> GfxResult<PipelineLayoutId> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        inject(state, FailPoint::CreatePipelineLayout)?;
        let id = state.id();
        state.layouts.insert(id, resources.clone());
        Ok(PipelineLayoutId(id))
    }

    fn destroy_pipeline_layout(&self, layout: PipelineLayoutId) {
        let mut guard = self.state.lock();
        if guard.layouts.remove(&layout.0).is_none() {
            guard.validate(format!("{layout:?} destroyed twice"));
        }
    }

    fn create_pipeline_cache(&self) -> GfxResult<PipelineCacheId> {
        let mut guard = self.state.lock();
        let id = guard.id();
        guard.caches.insert(id);
        Ok(PipelineCacheId(id))
    }

    fn destroy_pipeline_cache(&self, cache: PipelineCacheId) {
        let mut guard = self.state.lock();
        if !guard.caches.remove(&cache.0) {
            guard.validate(format!("{cache:?} destroyed twice"));
        }
    }

    fn create_graphics_pipeline(&self, desc: &GraphicsPipelineDesc<'_, Self>) -> GfxResult<PipelineId> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        inject(state, FailPoint::CreatePipeline)?;
        let modules = [desc.vertex, desc.fragment];
        if modules.iter().any(|m| !state.shader_modules.contains(&m.0)) || !state.layouts.contains_key(&desc.layout.0) {
            return Err(GfxError::InvalidUsage("pipeline from destroyed shader modules or layout"));
        }
        match state.render_passes.get(&desc.render_pass.0).map(|p| p.colors.len() as u32) {
            Some(count) if count == desc.color_attachment_count => {}
            Some(count) => state.validate(format!(
                "pipeline expects {} colour attachments, pass has {count}",
                desc.color_attachment_count
            )),
            None => return Err(GfxError::InvalidUsage("pipeline for a destroyed render pass")),
        }
        let id = state.id();
        state.pipelines.insert(id, PipelineRecord { kind: PipelineKind::Graphics, miss_count: 0, hit_count: 0 });
        Ok(PipelineId(id))
    }

    fn create_compute_pipeline(&self, desc: &ComputePipelineDesc<Self>) -> GfxResult<PipelineId> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        inject(state, FailPoint::CreatePipeline)?;
        if !state.shader_modules.contains(&desc.shader.0) || !state.layouts.contains_key(&desc.layout.0) {
            return Err(GfxError::InvalidUsage("pipeline from destroyed shader modules or layout"));
        }
        let id = state.id();
        state.pipelines.insert(id, PipelineRecord { kind: PipelineKind::Compute, miss_count: 0, hit_count: 0 });
        Ok(PipelineId(id))
    }

    fn create_ray_tracing_pipeline(&self, desc: &RayTracingPipelineDesc<'_, Self>) -> GfxResult<PipelineId> {
        let rt = *self.require_ray_tracing()?;
        let mut guard = self.state.lock();
        let state = &mut *guard;
        inject(state, FailPoint::CreatePipeline)?;
        let all_modules = std::iter::once(&desc.raygen).chain(desc.miss).chain(desc.closest_hit);
        if all_modules.into_iter().any(|m| !state.shader_modules.contains(&m.0)) {
            return Err(GfxError::InvalidUsage("pipeline from destroyed shader modules"));
        }
        if desc.max_recursion_depth > rt.max_recursion_depth {
            state.validate(format!("recursion depth {} exceeds {}", desc.max_recursion_depth, rt.max_recursion_depth));
        }
        let id = state.id();
        state.pipelines.insert(
            id,
            PipelineRecord {
                kind: PipelineKind::RayTracing,
                miss_count: desc.miss.len() as u32,
                hit_count: desc.closest_hit.len() as u32,
            },
        );
        Ok(PipelineId(id))
    }

    fn destroy_pipeline(&self, pipeline: PipelineId) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.in_flight(pipeline.0) {
            state.validate(format!("{pipeline:?} destroyed while in use"));
        }
        if state.pipelines.remove(&pipeline.0).is_none() {
            state.validate(format!("{pipeline:?} destroyed twice"));
        }
    }

    fn shader_group_handles(&self, pipeline: PipelineId, group_count: u32) -> GfxResult<Vec<u8>> {
        let rt = *self.require_ray_tracing()?;
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let record = state
            .pipelines
            .get(&pipeline.0)
            .filter(|p| p.kind == PipelineKind::RayTracing)
            .ok_or(GfxError::InvalidUsage("group handles of a non ray tracing pipeline"))?;
        let total = 1 + record.miss_count + record.hit_count;
        if group_count != total {
            state.validate(format!("requested {group_count} group handles of {total}"));
        }
        Ok((0..group_count).flat_map(|g| group_handle(g, rt.shader_group_handle_size)).collect())
    }

    fn create_descriptor_pool(&self, _resources: &ResourceLayout, sets: u32) -> GfxResult<DescriptorPoolId> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        inject(state, FailPoint::CreateDescriptorPool)?;
        let id = state.id();
        state.pools.insert(id, PoolRecord { capacity: sets, allocated: 0 });
        Ok(DescriptorPoolId(id))
    }

    fn destroy_descriptor_pool(&self, pool: DescriptorPoolId) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.pools.remove(&pool.0).is_none() {
            state.validate(format!("{pool:?} destroyed twice"));
        }
        state.sets.retain(|_, set| set.pool != pool.0);
    }

    fn allocate_descriptor_set(&self, pool: DescriptorPoolId, layout: PipelineLayoutId) -> GfxResult<DescriptorSetId> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if !state.layouts.contains_key(&layout.0) {
            return Err(GfxError::InvalidUsage("descriptor set for a destroyed layout"));
        }
        let record = state
            .pools
            .get_mut(&pool.0)
            .ok_or(GfxError::InvalidUsage("allocation from a destroyed descriptor pool"))?;
        if record.allocated >= record.capacity {
            return Err(GfxError::OutOfDeviceMemory);
        }
        record.allocated += 1;
        let id = state.id();
        state.sets.insert(id, SetRecord { pool: pool.0 });
        Ok(DescriptorSetId(id))
    }

    fn write_descriptor_set(&self, set: DescriptorSetId, writes: &[DescriptorWrite<Self>]) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        for write in writes {
            let (binding, alive) = match write {
                DescriptorWrite::UniformBuffer { binding, buffer, .. }
                | DescriptorWrite::StorageBuffer { binding, buffer, .. } => (*binding, state.buffers.contains_key(&buffer.0)),
                DescriptorWrite::SampledImage { binding, view, sampler } => {
                    (*binding, state.views.contains_key(&view.0) && state.samplers.contains(&sampler.0))
                }
                DescriptorWrite::StorageImage { binding, view } => (*binding, state.views.contains_key(&view.0)),
                DescriptorWrite::AccelerationStructure { binding, accel } => {
                    (*binding, state.accels.get(&accel.0).is_some_and(|a| a.built))
                }
            };
            if !alive {
                state.validate(format!("binding {binding} of {set:?} written with a dead or unbuilt resource"));
            }
        }
        if !state.sets.contains_key(&set.0) {
            state.validate(format!("write into freed {set:?}"));
        }
    }

    fn acceleration_structure_sizes(&self, geometry: &AccelerationGeometry) -> GfxResult<AccelerationSizes> {
        self.require_ray_tracing()?;
        let primitives = u64::from(geometry.primitive_count());
        Ok(AccelerationSizes { structure_size: 256 + primitives * 64, scratch_size: 128 + primitives * 32 })
    }

    fn create_acceleration_structure(&self, kind: AccelerationKind, buffer: BufferId, size: u64) -> GfxResult<AccelId> {
        self.require_ray_tracing()?;
        let mut guard = self.state.lock();
        let state = &mut *guard;
        inject(state, FailPoint::CreateAccelerationStructure)?;
        let (buffer_size, usage, address) = state
            .buffers
            .get(&buffer.0)
            .map(|b| (b.size, b.usage, b.address))
            .ok_or(GfxError::InvalidUsage("acceleration structure on a destroyed buffer"))?;
        if size > buffer_size || !usage.contains(BufferUsage::ACCELERATION_STRUCTURE_STORAGE) {
            state.validate(format!("{buffer:?} cannot back a {size} byte acceleration structure"));
        }
        let id = state.id();
        state.accels.insert(id, AccelRecord { kind, buffer: buffer.0, address, built: false });
        Ok(AccelId(id))
    }

    fn destroy_acceleration_structure(&self, accel: AccelId) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.in_flight(accel.0) {
            state.validate(format!("{accel:?} destroyed while in use"));
        }
        match state.accels.remove(&accel.0) {
            Some(record) if !state.buffers.contains_key(&record.buffer) => {
                state.validate(format!("{accel:?} outlived its backing buffer"));
            }
            Some(_) => {}
            None => state.validate(format!("{accel:?} destroyed twice")),
        }
    }

    fn acceleration_structure_address(&self, accel: AccelId) -> u64 {
        self.state.lock().accels.get(&accel.0).map_or(0, |a| a.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::WaitStage;
    use crate::types::ImageUsage;

    fn deferred() -> HeadlessDevice {
        HeadlessDevice::new(HeadlessConfig { completion: Completion::Deferred, ..HeadlessConfig::default() })
    }

    fn record_empty(device: &HeadlessDevice) -> CommandBufferId {
        let cb = device.allocate_command_buffer(QueueKind::Graphics).unwrap();
        device.begin_commands(cb, true).unwrap();
        device.end_commands(cb).unwrap();
        cb
    }

    #[test]
    fn test_deferred_wait_stalls_and_retires() {
        let device = deferred();
        let fence = device.create_fence(false).unwrap();
        let cb = record_empty(&device);
        device
            .submit(QueueKind::Graphics, &Submit { command_buffer: cb, wait: None, signal: &[], fence: Some(fence) })
            .unwrap();
        assert_eq!(device.pending_submissions(), 1);

        device.wait_for_fence(fence).unwrap();
        assert_eq!(device.pending_submissions(), 0);
        assert_eq!(device.stall_count(), 1);

        device.wait_for_fence(fence).unwrap();
        assert_eq!(device.stall_count(), 1);
        assert!(device.validation_errors().is_empty());
    }

    #[test]
    fn test_rerecording_pending_buffer_is_flagged() {
        let device = deferred();
        let cb = record_empty(&device);
        device
            .submit(QueueKind::Graphics, &Submit { command_buffer: cb, wait: None, signal: &[], fence: None })
            .unwrap();
        device.begin_commands(cb, false).unwrap();
        assert_eq!(device.validation_errors().len(), 1);
    }

    #[test]
    fn test_double_free_is_flagged() {
        let device = HeadlessDevice::new(HeadlessConfig::default());
        let desc = BufferDesc { size: 16, usage: BufferUsage::VERTEX, location: MemoryLocation::HostVisible, label: "test" };
        let (buffer, allocation) = device.create_buffer(&desc).unwrap();
        device.destroy_buffer(buffer, allocation);
        device.destroy_buffer(buffer, HeadlessAllocation { id: 0 });
        assert_eq!(device.validation_errors().len(), 1);
        assert_eq!(device.live_objects(), LiveObjects::default());
    }

    #[test]
    fn test_device_local_is_not_mappable() {
        let device = HeadlessDevice::new(HeadlessConfig::default());
        let desc = BufferDesc { size: 16, usage: BufferUsage::VERTEX, location: MemoryLocation::DeviceLocal, label: "test" };
        let (buffer, mut allocation) = device.create_buffer(&desc).unwrap();
        assert!(!device.is_host_visible(&allocation));
        assert_eq!(device.write_mapped(&mut allocation, 0, &[1, 2, 3]), Err(GfxError::FailedToMapMemory));
        device.destroy_buffer(buffer, allocation);
    }

    #[test]
    fn test_copy_requires_transfer_state() {
        let device = HeadlessDevice::new(HeadlessConfig::default());
        let staging = BufferDesc { size: 16, usage: BufferUsage::TRANSFER_SRC, location: MemoryLocation::HostVisible, label: "staging" };
        let (src, mut src_alloc) = device.create_buffer(&staging).unwrap();
        device.write_mapped(&mut src_alloc, 0, &[7; 16]).unwrap();
        let image_desc = ImageDesc {
            extent: Extent3D::new(2, 2, 1),
            format: Format::Rgba8Unorm,
            usage: ImageUsage::SAMPLED | ImageUsage::TRANSFER_DST,
            label: "image",
        };
        let (image, image_alloc) = device.create_image(&image_desc).unwrap();

        let cb = device.allocate_command_buffer(QueueKind::Graphics).unwrap();
        device.begin_commands(cb, true).unwrap();
        device.cmd_copy_buffer_to_image(cb, src, image, ImageAspect::Color, image_desc.extent);
        device.end_commands(cb).unwrap();
        device
            .submit(QueueKind::Graphics, &Submit { command_buffer: cb, wait: None, signal: &[], fence: None })
            .unwrap();
        assert_eq!(device.validation_errors().len(), 1);
        assert_eq!(device.image_contents(image).unwrap(), vec![0; 16]);

        device.begin_commands(cb, true).unwrap();
        device.cmd_image_barrier(cb, image, ImageAspect::Color, ImageState::Undefined, ImageState::TransferDst);
        device.cmd_copy_buffer_to_image(cb, src, image, ImageAspect::Color, image_desc.extent);
        device.cmd_image_barrier(cb, image, ImageAspect::Color, ImageState::TransferDst, ImageState::ShaderRead);
        device.end_commands(cb).unwrap();
        device
            .submit(QueueKind::Graphics, &Submit { command_buffer: cb, wait: None, signal: &[], fence: None })
            .unwrap();
        assert_eq!(device.image_contents(image).unwrap(), vec![7; 16]);
        assert_eq!(device.image_state(image), Some(ImageState::ShaderRead));

        device.free_command_buffer(QueueKind::Graphics, cb);
        device.destroy_image(image, image_alloc);
        device.destroy_buffer(src, src_alloc);
    }

    #[test]
    fn test_acquire_goes_out_of_date_on_resize() {
        let device = HeadlessDevice::new(HeadlessConfig::default());
        let config = SurfaceConfig {
            format: Format::Bgra8Srgb,
            present_mode: PresentMode::Fifo,
            extent: Extent2D::new(800, 600),
            image_count: 3,
            transform: SurfaceTransform::IDENTITY,
            composite_alpha: CompositeAlpha::Opaque,
        };
        let swapchain = device.create_swapchain(&config, None).unwrap();
        let semaphore = device.create_semaphore().unwrap();

        assert_eq!(
            device.acquire_next_image(swapchain, semaphore).unwrap(),
            AcquireOutcome::Acquired { index: 0, suboptimal: false }
        );
        device.set_surface_extent(Extent2D::new(1024, 768));
        assert_eq!(device.acquire_next_image(swapchain, semaphore).unwrap(), AcquireOutcome::OutOfDate);

        let replacement = device
            .create_swapchain(&SurfaceConfig { extent: Extent2D::new(1024, 768), ..config }, Some(swapchain))
            .unwrap();
        assert_eq!(device.acquire_next_image(swapchain, semaphore).unwrap(), AcquireOutcome::OutOfDate);
        device.destroy_swapchain(swapchain);
        device.destroy_swapchain(replacement);
        device.destroy_semaphore(semaphore);
        assert_eq!(device.live_objects(), LiveObjects::default());
    }

    #[test]
    fn test_wait_on_unsignalled_semaphore_is_flagged() {
        let device = HeadlessDevice::new(HeadlessConfig::default());
        let semaphore = device.create_semaphore().unwrap();
        let cb = record_empty(&device);
        device
            .submit(
                QueueKind::Graphics,
                &Submit { command_buffer: cb, wait: Some((semaphore, WaitStage::AllCommands)), signal: &[], fence: None },
            )
            .unwrap();
        assert_eq!(device.validation_errors().len(), 1);
    }
}
