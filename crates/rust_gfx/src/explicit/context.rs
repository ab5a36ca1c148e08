//! The explicit backend
//!
//! [`ExplicitBackend`] owns a [`Device`] and every registry of resources created
//! through it. Registries are slotmaps: the context is the single owner and
//! every cross reference (pipeline to framebuffer, scene to mesh) is a key.
//!
//! Frame flow: `begin_record` waits for the current ring slot, acquires a
//! swapchain image and starts that image's command buffer; commands are recorded
//! until `end_record` submits, optionally hands the image to the present queue,
//! and presents. A failure anywhere between acquire and present rearms the slot
//! and marks the swapchain stale, so the next frame starts from a clean state.

use std::any::Any;

use slotmap::{SecondaryMap, SlotMap};

use super::frame::FrameSynchronizer;
use super::framebuffer::{FramebufferResource, FramebufferTarget};
use super::pipeline::{
    ComputePipeline, GraphicsPipeline, PipelineResource, PipelineTarget, RayTracingPipeline,
    ResourceLookup,
};
use super::raytracing::{AccelerationStructure, InstanceRecord};
use super::resources::{BufferResource, ImageResource, ShaderResource};
use super::staging::{StagingStats, TransferEngine};
use super::swapchain::{SwapchainManager, SwapchainState, DEPTH_FORMAT};
use crate::backend::{Backend, BackendKind};
use crate::config::GfxConfig;
use crate::error::{fatal, GfxError, GfxResult};
use crate::hal::{AccelerationGeometry, Device, OwnershipTransfer, QueueKind, Submit, WaitStage};
use crate::pipeline::{
    ComputePipelineInfo, FixedFunctionState, GraphicsPipelineInfo, PipelineKind, RayTracingPipelineInfo, Rect2D,
    VertexFormat, Viewport,
};
use crate::types::{
    BufferInfo, BufferKey, BufferUsage, ClearValues, Extent2D, Format, FrameInfo, FramebufferInfo, FramebufferKey,
    ImageInfo, ImageKey, MeshDraw, PipelineKey, ResourceBinding, RtInstance, RtMeshKey, RtSceneKey, SamplerInfo,
    SamplerKey, ShaderKey, ShaderSource, ShaderStage, TriangleGeometry,
};

const SHUT_DOWN: GfxError = GfxError::InvalidUsage("context is shut down");
const NOT_RECORDING: GfxError = GfxError::InvalidUsage("command issued outside begin_record/end_record");
const RECORDING: GfxError = GfxError::InvalidUsage("resources are created and destroyed outside frame recording");

/// Frame counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameStats {
    /// Frames submitted and presented
    pub frames_submitted: u64,
    /// Swapchain recreations after the first creation
    pub resizes: u64,
    /// Frames abandoned because begin or end failed
    pub skipped_frames: u64,
}

struct ActiveFrame<D: Device> {
    image_index: u32,
    command_buffer: D::CommandBuffer,
    render_pass: Option<FramebufferKey>,
    bound: Option<PipelineKey>,
    written: Vec<PipelineKey>,
    default_pass_done: bool,
}

/// Explicit backend over any [`Device`]
pub struct ExplicitBackend<D: Device> {
    device: D,
    transfer: Option<TransferEngine<D>>,
    frames: Option<FrameSynchronizer<D>>,
    swapchain: Option<SwapchainManager<D>>,

    buffers: SlotMap<BufferKey, BufferResource<D>>,
    images: SlotMap<ImageKey, ImageResource<D>>,
    samplers: SlotMap<SamplerKey, D::Sampler>,
    shaders: SlotMap<ShaderKey, ShaderResource<D>>,
    framebuffers: SlotMap<FramebufferKey, FramebufferResource<D>>,
    pipelines: SlotMap<PipelineKey, PipelineResource<D>>,
    meshes: SlotMap<RtMeshKey, AccelerationStructure<D>>,
    scenes: SlotMap<RtSceneKey, AccelerationStructure<D>>,
    scene_meshes: SecondaryMap<RtSceneKey, Vec<RtMeshKey>>,
    default_framebuffer: FramebufferKey,

    frame: Option<ActiveFrame<D>>,
    stats: FrameStats,
    swapchain_generation: u64,
    lost: bool,
    shut_down: bool,
}

impl<D: Device> ExplicitBackend<D> {
    /// Bring up transfers, the frame ring and the first swapchain on `device`
    pub fn new(device: D, config: &GfxConfig, extent: Extent2D) -> GfxResult<Self> {
        let mut transfer = TransferEngine::new(&device, config.initial_staging_size)?;
        let separate_present = device.capabilities().separate_present_queue;
        let mut frames = match FrameSynchronizer::new(&device, separate_present) {
            Ok(frames) => frames,
            Err(e) => {
                transfer.destroy(&device);
                return Err(e);
            }
        };
        let swapchain = match SwapchainManager::new(&device, &mut transfer, extent, config.vsync) {
            Ok(swapchain) => swapchain,
            Err(e) => {
                frames.destroy(&device);
                transfer.destroy(&device);
                return Err(e);
            }
        };

        let format = swapchain.format().unwrap_or(Format::Bgra8Srgb);
        let mut framebuffers = SlotMap::with_key();
        let default_framebuffer = framebuffers.insert(FramebufferResource::swapchain(swapchain.extent(), format, DEPTH_FORMAT));
        frames.reset_images(swapchain.resources().map_or(0, |r| r.images.len()));

        log::info!(
            "Explicit backend ready on {}: {}x{}, {} frames in flight{}",
            device.capabilities().name,
            swapchain.extent().width,
            swapchain.extent().height,
            frames.len(),
            if separate_present { ", separate present queue" } else { "" }
        );

        Ok(Self {
            swapchain_generation: swapchain.generation(),
            device,
            transfer: Some(transfer),
            frames: Some(frames),
            swapchain: Some(swapchain),
            buffers: SlotMap::with_key(),
            images: SlotMap::with_key(),
            samplers: SlotMap::with_key(),
            shaders: SlotMap::with_key(),
            framebuffers,
            pipelines: SlotMap::with_key(),
            meshes: SlotMap::with_key(),
            scenes: SlotMap::with_key(),
            scene_meshes: SecondaryMap::new(),
            default_framebuffer,
            frame: None,
            stats: FrameStats::default(),
            lost: false,
            shut_down: false,
        })
    }

    // --- diagnostics --------------------------------------------------------

    /// The device this backend drives
    pub fn device(&self) -> &D {
        &self.device
    }

    /// Shared staging counters
    pub fn staging_stats(&self) -> StagingStats {
        self.transfer.as_ref().map(TransferEngine::stats).unwrap_or_default()
    }

    /// Frame counters
    pub fn frame_stats(&self) -> FrameStats {
        self.stats
    }

    /// Size of the frame ring
    pub fn frames_in_flight(&self) -> usize {
        self.frames.as_ref().map_or(0, FrameSynchronizer::len)
    }

    /// Ring slot the next frame records into
    pub fn current_frame_slot(&self) -> usize {
        self.frames.as_ref().map_or(0, FrameSynchronizer::current_index)
    }

    /// Swapchain state, absent after shutdown
    pub fn swapchain_state(&self) -> Option<SwapchainState> {
        self.swapchain.as_ref().map(SwapchainManager::state)
    }

    /// Number of swapchain images
    pub fn swapchain_image_count(&self) -> usize {
        self.swapchain.as_ref().and_then(SwapchainManager::resources).map_or(0, |r| r.images.len())
    }

    /// Device image behind swapchain index `index`
    pub fn swapchain_image(&self, index: u32) -> Option<D::Image> {
        self.swapchain.as_ref().and_then(|s| s.image(index)).map(|i| i.image)
    }

    /// Device buffer behind a key
    pub fn buffer_handle(&self, buffer: BufferKey) -> Option<D::Buffer> {
        self.buffers.get(buffer).map(|b| b.buffer)
    }

    /// Whether a buffer has grown a paired staging buffer
    pub fn has_paired_staging(&self, buffer: BufferKey) -> Option<bool> {
        self.buffers.get(buffer).map(BufferResource::has_paired_staging)
    }

    /// Device image behind a key
    pub fn image_handle(&self, image: ImageKey) -> Option<D::Image> {
        self.images.get(image).map(|i| i.image)
    }

    /// Device structure behind a mesh key
    pub fn mesh_handle(&self, mesh: RtMeshKey) -> Option<D::AccelerationStructure> {
        self.meshes.get(mesh).map(|m| m.accel)
    }

    /// Device structure behind a scene key
    pub fn scene_handle(&self, scene: RtSceneKey) -> Option<D::AccelerationStructure> {
        self.scenes.get(scene).map(|s| s.accel)
    }

    /// Device pipeline behind a key
    pub fn pipeline_handle(&self, pipeline: PipelineKey) -> Option<D::Pipeline> {
        self.pipelines.get(pipeline).map(|p| p.core().pipeline)
    }

    /// Framebuffer generation a pipeline was last built for
    pub fn pipeline_generation(&self, pipeline: PipelineKey) -> Option<u64> {
        self.pipelines.get(pipeline).map(|p| p.core().generation)
    }

    /// Fixed-function state of a graphics pipeline
    pub fn graphics_state(&self, pipeline: PipelineKey) -> Option<&FixedFunctionState> {
        match self.pipelines.get(pipeline)? {
            PipelineResource::Graphics(p) => Some(p.state()),
            _ => None,
        }
    }

    /// Generation of a framebuffer; bumps on every resize
    pub fn framebuffer_generation(&self, framebuffer: FramebufferKey) -> Option<u64> {
        self.framebuffers.get(framebuffer).map(|f| f.generation)
    }

    /// Whether the device was lost
    pub fn is_lost(&self) -> bool {
        self.lost
    }

    // --- state checks -------------------------------------------------------

    fn usable(&self) -> GfxResult<()> {
        if self.shut_down {
            return Err(SHUT_DOWN);
        }
        if self.lost {
            return Err(GfxError::DeviceLost);
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

    /// Latch device loss from any result passing through
    fn track<T>(&mut self, result: GfxResult<T>) -> GfxResult<T> {
        if let Err(e) = &result {
            self.note(e);
        }
        result
    }

    fn note(&mut self, error: &GfxError) {
        if *error == GfxError::DeviceLost && !self.lost {
            log::error!("Device lost; the context only accepts destruction from now on");
            self.lost = true;
        }
    }

    /// Drain the device before destroying a resource it may still read
    fn prepare_destroy(&mut self) -> GfxResult<()> {
        if self.shut_down {
            return Err(SHUT_DOWN);
        }
        if self.frame.is_some() {
            return Err(RECORDING);
        }
        if !self.lost {
            if let Err(e) = self.device.wait_idle() {
                fatal("resource destruction", &e);
            }
        }
        Ok(())
    }

    fn transfer_mut(&mut self) -> GfxResult<&mut TransferEngine<D>> {
        self.transfer.as_mut().ok_or(SHUT_DOWN)
    }

    // --- pipelines and resize -----------------------------------------------

    fn pipeline_target(&self, framebuffer: FramebufferKey) -> GfxResult<PipelineTarget<D>> {
        let fb = self
            .framebuffers
            .get(framebuffer)
            .ok_or(GfxError::InvalidUsage("unknown framebuffer"))?;
        let render_pass = match &fb.target {
            FramebufferTarget::Swapchain => {
                self.swapchain.as_ref().and_then(SwapchainManager::resources).map(|r| r.render_pass)
            }
            FramebufferTarget::Offscreen(target) => Some(target.render_pass),
        };
        Ok(PipelineTarget {
            framebuffer,
            render_pass,
            color_count: fb.color_count(),
            extent: fb.info.extent,
            generation: fb.generation,
        })
    }

    /// Rebuild every pipeline of `framebuffer` built for an older generation.
    ///
    /// Stops at the first failure; pipelines not yet rebuilt keep their old
    /// objects and the framebuffer stays marked stale for a later retry.
    fn rebuild_pipelines(&mut self, framebuffer: FramebufferKey) -> GfxResult<()> {
        let target = self.pipeline_target(framebuffer)?;
        let keys = self.framebuffers.get(framebuffer).map(|f| f.pipelines.clone()).unwrap_or_default();
        let mut result = Ok(());
        let mut rebuilt = 0;
        for key in keys {
            let Some(pipeline) = self.pipelines.get_mut(key) else { continue };
            if pipeline.core().generation == target.generation {
                continue;
            }
            if let Err(e) = pipeline.variant_mut().rebuild(&self.device, &target) {
                log::warn!("Pipeline rebuild for {}x{} failed: {e}", target.extent.width, target.extent.height);
                result = Err(e);
                break;
            }
            rebuilt += 1;
        }
        if let Some(fb) = self.framebuffers.get_mut(framebuffer) {
            fb.pipelines_stale = result.is_err();
        }
        if rebuilt > 0 {
            log::debug!("Rebuilt {rebuilt} pipeline(s) for {}x{}", target.extent.width, target.extent.height);
        }
        self.track(result)
    }

    fn rebuild_stale_pipelines(&mut self) -> GfxResult<()> {
        let stale: Vec<FramebufferKey> =
            self.framebuffers.iter().filter(|(_, f)| f.pipelines_stale).map(|(k, _)| k).collect();
        if stale.is_empty() {
            return Ok(());
        }
        self.track(self.device.wait_idle())?;
        for framebuffer in stale {
            // A framebuffer that still fails keeps rendering with its old pipelines
            if let Err(GfxError::DeviceLost) = self.rebuild_pipelines(framebuffer) {
                return Err(GfxError::DeviceLost);
            }
        }
        Ok(())
    }

    /// Propagate a new swapchain generation to the frame ring and default framebuffer
    fn on_swapchain_recreated(&mut self) {
        let Some(swapchain) = self.swapchain.as_ref() else { return };
        self.swapchain_generation = swapchain.generation();
        let Some(resources) = swapchain.resources() else { return };
        let (extent, format, count) = (resources.config.extent, resources.config.format, resources.images.len());

        if let Some(frames) = self.frames.as_mut() {
            frames.reset_images(count);
        }
        if let Some(fb) = self.framebuffers.get_mut(self.default_framebuffer) {
            fb.swapchain_resized(extent, format);
        }
        self.stats.resizes += 1;
        // Failure leaves the framebuffer stale; begin_record retries
        let _ = self.rebuild_pipelines(self.default_framebuffer);
    }

    fn check_swapchain_generation(&mut self) {
        let generation = self.swapchain.as_ref().map_or(self.swapchain_generation, SwapchainManager::generation);
        if generation != self.swapchain_generation {
            self.on_swapchain_recreated();
        }
    }

    fn release_pipeline(&mut self, key: PipelineKey, pipeline: PipelineResource<D>) {
        if let Some(fb) = self.framebuffers.get_mut(pipeline.core().framebuffer) {
            fb.pipelines.retain(|p| *p != key);
        }
        for shader in pipeline.destroy(&self.device) {
            let released = self.shaders.get_mut(shader).is_some_and(ShaderResource::release);
            if released {
                if let Some(shader) = self.shaders.remove(shader) {
                    shader.destroy(&self.device);
                }
            }
        }
    }

    fn register_pipeline(&mut self, pipeline: PipelineResource<D>) -> PipelineKey {
        let framebuffer = pipeline.core().framebuffer;
        let kind = pipeline.kind();
        let key = self.pipelines.insert(pipeline);
        if let Some(fb) = self.framebuffers.get_mut(framebuffer) {
            fb.pipelines.push(key);
        }
        log::debug!("Created {kind:?} pipeline");
        key
    }

    // --- frames -------------------------------------------------------------

    /// Leave the ring and swapchain usable after a frame failed mid-way
    fn recover_frame(&mut self) {
        if self.lost {
            return;
        }
        if let Some(swapchain) = self.swapchain.as_mut() {
            swapchain.mark_stale();
        }
        let Some(frames) = self.frames.as_mut() else { return };
        let result = frames.rearm_current(&self.device);
        if let Err(e) = self.track(result) {
            log::error!("Could not rearm frame slot: {e}");
        }
    }

    fn begin_frame(&mut self) -> GfxResult<FrameInfo> {
        let frames = self.frames.as_ref().ok_or(SHUT_DOWN)?;
        frames.wait_current(&self.device)?;
        let signal = frames.current().image_acquired;
        self.rebuild_stale_pipelines()?;

        let acquired = {
            let (Some(swapchain), Some(transfer)) = (self.swapchain.as_mut(), self.transfer.as_mut()) else {
                return Err(SHUT_DOWN);
            };
            swapchain.acquire(&self.device, transfer, signal)
        };
        self.check_swapchain_generation();
        let image_index = acquired?;

        let command_buffer = self
            .swapchain
            .as_ref()
            .and_then(|s| s.image(image_index))
            .map(|i| i.command_buffer)
            .ok_or(GfxError::Unknown("acquired image has no command buffer".to_string()))?;
        let started = self.frames.as_mut().ok_or(SHUT_DOWN).and_then(|frames| {
            frames.claim_image(&self.device, image_index)?;
            self.device.begin_commands(command_buffer, true)?;
            Ok(frames.current_index())
        });
        let frame_index = match started {
            Ok(index) => index,
            Err(e) => {
                self.note(&e);
                self.recover_frame();
                return Err(e);
            }
        };

        self.frame = Some(ActiveFrame {
            image_index,
            command_buffer,
            render_pass: None,
            bound: None,
            written: Vec::new(),
            default_pass_done: false,
        });
        log::trace!("Recording frame slot {frame_index}, image {image_index}");
        Ok(FrameInfo { frame_index, image_index, extent: self.extent() })
    }

    fn finish_frame(&mut self, frame: &ActiveFrame<D>) -> GfxResult<()> {
        let device = &self.device;
        let (Some(frames), Some(swapchain)) = (self.frames.as_mut(), self.swapchain.as_mut()) else {
            return Err(SHUT_DOWN);
        };
        let cb = frame.command_buffer;
        let resources = swapchain.resources().ok_or(GfxError::ZeroFramebufferSize)?;
        let image = resources
            .images
            .get(frame.image_index as usize)
            .ok_or(GfxError::Unknown("acquired image index out of range".to_string()))?;

        if frame.render_pass.is_some() {
            device.cmd_end_render_pass(cb);
        }
        if !frame.default_pass_done {
            // The clear moves the image into its presentable state
            device.cmd_begin_render_pass(cb, resources.render_pass, image.framebuffer, resources.config.extent, &ClearValues::default());
            device.cmd_end_render_pass(cb);
        }
        if image.present_command_buffer.is_some() {
            device.cmd_queue_ownership(cb, image.image, OwnershipTransfer::Release);
        }
        device.end_commands(cb)?;

        let slot = frames.current();
        let acquired = Some((slot.image_acquired, WaitStage::ColorAttachmentOutput));
        let present_wait = match (image.present_command_buffer, slot.image_ownership) {
            (Some(present_cb), Some(ownership)) => {
                device.submit(
                    QueueKind::Graphics,
                    &Submit { command_buffer: cb, wait: acquired, signal: &[slot.draw_complete], fence: None },
                )?;
                // The fence rides on the last submission so it covers both
                device.submit(
                    QueueKind::Present,
                    &Submit {
                        command_buffer: present_cb,
                        wait: Some((slot.draw_complete, WaitStage::AllCommands)),
                        signal: &[ownership],
                        fence: Some(slot.fence),
                    },
                )?;
                ownership
            }
            _ => {
                device.submit(
                    QueueKind::Graphics,
                    &Submit { command_buffer: cb, wait: acquired, signal: &[slot.draw_complete], fence: Some(slot.fence) },
                )?;
                slot.draw_complete
            }
        };

        swapchain.present(device, frame.image_index, present_wait)?;
        frames.advance();
        Ok(())
    }

    fn active_frame(&self) -> GfxResult<&ActiveFrame<D>> {
        self.usable()?;
        self.frame.as_ref().ok_or(NOT_RECORDING)
    }

    fn frame_info(&self, frame: &ActiveFrame<D>) -> FrameInfo {
        FrameInfo { frame_index: self.current_frame_slot(), image_index: frame.image_index, extent: self.extent() }
    }

    fn push_constants(&self, cb: D::CommandBuffer, pipeline: &PipelineResource<D>, data: &[u8]) -> GfxResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        let core = pipeline.core();
        if data.len() > core.resources.push_constant_size as usize {
            return Err(GfxError::InvalidUsage("push constants larger than the declared block"));
        }
        self.device.cmd_push_constants(cb, core.base.layout, data);
        Ok(())
    }

    /// Bound pipeline of `kind`, checked against render pass state
    fn bound_pipeline(&self, kind: PipelineKind) -> GfxResult<(&ActiveFrame<D>, &PipelineResource<D>)> {
        let frame = self.active_frame()?;
        let pipeline = frame
            .bound
            .and_then(|key| self.pipelines.get(key))
            .filter(|p| p.kind() == kind)
            .ok_or(GfxError::InvalidUsage("no pipeline of the required kind is bound"))?;
        let in_pass = frame.render_pass.is_some();
        if (kind == PipelineKind::Graphics) != in_pass {
            return Err(GfxError::InvalidUsage("draws run inside render passes, dispatches and traces outside"));
        }
        Ok((frame, pipeline))
    }
}

impl<D: Device> Backend for ExplicitBackend<D> {
    fn kind(&self) -> BackendKind {
        BackendKind::Explicit
    }

    fn create_buffer(&mut self, info: &BufferInfo, data: Option<&[u8]>) -> GfxResult<BufferKey> {
        self.outside_frame()?;
        let transfer = self.transfer.as_mut().ok_or(SHUT_DOWN)?;
        let buffer = BufferResource::create(&self.device, transfer, info, data);
        let buffer = self.track(buffer)?;
        Ok(self.buffers.insert(buffer))
    }

    fn update_buffer(&mut self, buffer: BufferKey, offset: u64, data: &[u8]) -> GfxResult<()> {
        self.usable()?;
        let resource = self.buffers.get_mut(buffer).ok_or(GfxError::InvalidUsage("unknown buffer"))?;
        let result = match &self.frame {
            Some(frame) if frame.render_pass.is_some() => {
                return Err(GfxError::InvalidUsage("buffer updates are recorded outside render passes"));
            }
            Some(frame) => {
                let frames = self.frames.as_ref().ok_or(SHUT_DOWN)?;
                resource.update_in_frame(&self.device, frames, frame.command_buffer, offset, data)
            }
            None => {
                let transfer = self.transfer.as_mut().ok_or(SHUT_DOWN)?;
                resource.update_now(&self.device, transfer, offset, data)
            }
        };
        self.track(result)
    }

    fn destroy_buffer(&mut self, buffer: BufferKey) -> GfxResult<()> {
        self.prepare_destroy()?;
        let buffer = self.buffers.remove(buffer).ok_or(GfxError::InvalidUsage("unknown buffer"))?;
        buffer.destroy(&self.device);
        Ok(())
    }

    fn create_image(&mut self, info: &ImageInfo, data: Option<&[u8]>) -> GfxResult<ImageKey> {
        self.outside_frame()?;
        let transfer = self.transfer.as_mut().ok_or(SHUT_DOWN)?;
        let image = ImageResource::create(&self.device, transfer, info, data);
        let image = self.track(image)?;
        Ok(self.images.insert(image))
    }

    fn update_image(&mut self, image: ImageKey, data: &[u8]) -> GfxResult<()> {
        self.outside_frame()?;
        let resource = self.images.get_mut(image).ok_or(GfxError::InvalidUsage("unknown image"))?;
        let transfer = self.transfer.as_mut().ok_or(SHUT_DOWN)?;
        let result = resource.update_now(&self.device, transfer, data);
        self.track(result)
    }

    fn destroy_image(&mut self, image: ImageKey) -> GfxResult<()> {
        if self.framebuffers.values().any(|f| f.owns_image(image)) {
            return Err(GfxError::InvalidUsage("attachment images are destroyed with their framebuffer"));
        }
        self.prepare_destroy()?;
        let image = self.images.remove(image).ok_or(GfxError::InvalidUsage("unknown image"))?;
        image.destroy(&self.device);
        Ok(())
    }

    fn create_sampler(&mut self, info: &SamplerInfo) -> GfxResult<SamplerKey> {
        self.outside_frame()?;
        let sampler = self.device.create_sampler(info);
        let sampler = self.track(sampler)?;
        Ok(self.samplers.insert(sampler))
    }

    fn destroy_sampler(&mut self, sampler: SamplerKey) -> GfxResult<()> {
        self.prepare_destroy()?;
        let sampler = self.samplers.remove(sampler).ok_or(GfxError::InvalidUsage("unknown sampler"))?;
        self.device.destroy_sampler(sampler);
        Ok(())
    }

    fn create_shader(&mut self, stage: ShaderStage, source: &ShaderSource) -> GfxResult<ShaderKey> {
        self.outside_frame()?;
        let shader = ShaderResource::create(&self.device, stage, source);
        let shader = self.track(shader)?;
        Ok(self.shaders.insert(shader))
    }

    fn destroy_shader(&mut self, shader: ShaderKey) -> GfxResult<()> {
        self.outside_frame().or_else(|e| if e == GfxError::DeviceLost { Ok(()) } else { Err(e) })?;
        let resource = self
            .shaders
            .get_mut(shader)
            .filter(|s| !s.is_orphaned())
            .ok_or(GfxError::InvalidUsage("unknown shader"))?;
        // Modules are only read at pipeline creation, so no idle wait is needed
        if resource.orphan() {
            if let Some(resource) = self.shaders.remove(shader) {
                resource.destroy(&self.device);
            }
        }
        Ok(())
    }

    fn default_framebuffer(&self) -> FramebufferKey {
        self.default_framebuffer
    }

    fn create_framebuffer(&mut self, info: &FramebufferInfo) -> GfxResult<FramebufferKey> {
        self.outside_frame()?;
        let transfer = self.transfer.as_mut().ok_or(SHUT_DOWN)?;
        let framebuffer = FramebufferResource::create_offscreen(&self.device, transfer, &mut self.images, info);
        let framebuffer = self.track(framebuffer)?;
        Ok(self.framebuffers.insert(framebuffer))
    }

    fn resize_framebuffer(&mut self, framebuffer: FramebufferKey, extent: Extent2D) -> GfxResult<()> {
        if framebuffer == self.default_framebuffer {
            return self.resize(extent);
        }
        self.outside_frame()?;
        let idle = self.device.wait_idle();
        self.track(idle)?;
        let (Some(fb), Some(transfer)) = (self.framebuffers.get_mut(framebuffer), self.transfer.as_mut()) else {
            return Err(GfxError::InvalidUsage("unknown framebuffer"));
        };
        let resized = fb.resize_offscreen(&self.device, transfer, &mut self.images, extent);
        self.track(resized)?;
        self.rebuild_pipelines(framebuffer)
    }

    fn framebuffer_attachment(&self, framebuffer: FramebufferKey, index: usize) -> Option<ImageKey> {
        match &self.framebuffers.get(framebuffer)?.target {
            FramebufferTarget::Swapchain => None,
            FramebufferTarget::Offscreen(target) => target.colors.get(index).copied(),
        }
    }

    fn destroy_framebuffer(&mut self, framebuffer: FramebufferKey) -> GfxResult<()> {
        if framebuffer == self.default_framebuffer {
            return Err(GfxError::InvalidUsage("the default framebuffer lives as long as the context"));
        }
        self.prepare_destroy()?;
        let fb = self.framebuffers.remove(framebuffer).ok_or(GfxError::InvalidUsage("unknown framebuffer"))?;
        for key in &fb.pipelines {
            if let Some(pipeline) = self.pipelines.remove(*key) {
                self.release_pipeline(*key, pipeline);
            }
        }
        fb.destroy(&self.device, &mut self.images);
        Ok(())
    }

    fn create_graphics_pipeline(&mut self, framebuffer: FramebufferKey, info: GraphicsPipelineInfo) -> GfxResult<PipelineKey> {
        self.outside_frame()?;
        let target = self.pipeline_target(framebuffer)?;
        let pipeline = GraphicsPipeline::create(&self.device, &mut self.shaders, &target, info);
        let pipeline = self.track(pipeline)?;
        Ok(self.register_pipeline(PipelineResource::Graphics(pipeline)))
    }

    fn create_compute_pipeline(&mut self, info: ComputePipelineInfo) -> GfxResult<PipelineKey> {
        self.outside_frame()?;
        let target = self.pipeline_target(self.default_framebuffer)?;
        let pipeline = ComputePipeline::create(&self.device, &mut self.shaders, &target, info);
        let pipeline = self.track(pipeline)?;
        Ok(self.register_pipeline(PipelineResource::Compute(pipeline)))
    }

    fn create_ray_tracing_pipeline(&mut self, info: RayTracingPipelineInfo) -> GfxResult<PipelineKey> {
        self.outside_frame()?;
        let target = self.pipeline_target(self.default_framebuffer)?;
        let pipeline = RayTracingPipeline::create(&self.device, &mut self.shaders, &target, info);
        let pipeline = self.track(pipeline)?;
        Ok(self.register_pipeline(PipelineResource::RayTracing(pipeline)))
    }

    fn destroy_pipeline(&mut self, pipeline: PipelineKey) -> GfxResult<()> {
        self.prepare_destroy()?;
        let resource = self.pipelines.remove(pipeline).ok_or(GfxError::InvalidUsage("unknown pipeline"))?;
        self.release_pipeline(pipeline, resource);
        Ok(())
    }

    fn create_rt_mesh(&mut self, geometry: &TriangleGeometry) -> GfxResult<RtMeshKey> {
        self.outside_frame()?;
        if geometry.vertex_count == 0 || geometry.triangle_count == 0 {
            return Err(GfxError::InvalidUsage("empty ray tracing geometry"));
        }
        let address_of = |key: BufferKey| -> GfxResult<u64> {
            let buffer = self.buffers.get(key).ok_or(GfxError::InvalidUsage("unknown buffer"))?;
            if !buffer.info.usage.contains(BufferUsage::ACCELERATION_STRUCTURE_INPUT) {
                return Err(GfxError::InvalidUsage("geometry buffers need acceleration structure input usage"));
            }
            Ok(self.device.buffer_address(buffer.buffer))
        };
        let geometry = AccelerationGeometry::Triangles {
            vertex_address: address_of(geometry.vertex_buffer)?,
            vertex_stride: geometry.vertex_stride,
            vertex_count: geometry.vertex_count,
            vertex_format: VertexFormat::Float3,
            index_address: geometry.index_buffer.map(address_of).transpose()?,
            triangle_count: geometry.triangle_count,
            opaque: geometry.opaque,
        };
        let transfer = self.transfer.as_mut().ok_or(SHUT_DOWN)?;
        let mesh = AccelerationStructure::build(&self.device, transfer, &geometry);
        let mesh = self.track(mesh)?;
        Ok(self.meshes.insert(mesh))
    }

    fn destroy_rt_mesh(&mut self, mesh: RtMeshKey) -> GfxResult<()> {
        if self.scene_meshes.values().any(|meshes| meshes.contains(&mesh)) {
            return Err(GfxError::InvalidUsage("mesh is still instanced by a scene"));
        }
        self.prepare_destroy()?;
        let mesh = self.meshes.remove(mesh).ok_or(GfxError::InvalidUsage("unknown mesh"))?;
        mesh.destroy(&self.device);
        Ok(())
    }

    fn create_rt_scene(&mut self, instances: &[RtInstance]) -> GfxResult<RtSceneKey> {
        self.outside_frame()?;
        if instances.is_empty() {
            return Err(GfxError::InvalidUsage("scene without instances"));
        }
        let records = instances
            .iter()
            .map(|instance| {
                self.meshes
                    .get(instance.mesh)
                    .map(|mesh| InstanceRecord::new(instance, mesh.address))
                    .ok_or(GfxError::InvalidUsage("instance refers to an unknown mesh"))
            })
            .collect::<GfxResult<Vec<_>>>()?;
        let bytes: &[u8] = bytemuck::cast_slice(&records);

        let info = BufferInfo::constant(bytes.len() as u64, BufferUsage::ACCELERATION_STRUCTURE_INPUT);
        let transfer = self.transfer.as_mut().ok_or(SHUT_DOWN)?;
        let built = BufferResource::create(&self.device, transfer, &info, Some(bytes)).and_then(|instance_buffer| {
            let geometry = AccelerationGeometry::Instances {
                address: self.device.buffer_address(instance_buffer.buffer),
                count: records.len() as u32,
            };
            let scene = AccelerationStructure::build(&self.device, transfer, &geometry);
            // The build finished before returning, so the records are no longer read
            instance_buffer.destroy(&self.device);
            scene
        });
        let scene = self.track(built)?;

        let key = self.scenes.insert(scene);
        let mut meshes: Vec<RtMeshKey> = instances.iter().map(|i| i.mesh).collect();
        meshes.sort_unstable();
        meshes.dedup();
        self.scene_meshes.insert(key, meshes);
        Ok(key)
    }

    fn destroy_rt_scene(&mut self, scene: RtSceneKey) -> GfxResult<()> {
        self.prepare_destroy()?;
        let resource = self.scenes.remove(scene).ok_or(GfxError::InvalidUsage("unknown scene"))?;
        self.scene_meshes.remove(scene);
        resource.destroy(&self.device);
        Ok(())
    }

    fn begin_record(&mut self) -> GfxResult<FrameInfo> {
        self.usable()?;
        if self.frame.is_some() {
            return Err(GfxError::InvalidUsage("begin_record while a frame is being recorded"));
        }
        let result = self.begin_frame();
        if result.is_err() {
            self.stats.skipped_frames += 1;
        }
        self.track(result)
    }

    fn end_record(&mut self) -> GfxResult<()> {
        self.usable()?;
        let frame = self.frame.take().ok_or(GfxError::InvalidUsage("end_record without begin_record"))?;
        let result = self.finish_frame(&frame);
        let result = self.track(result);
        match &result {
            Ok(()) => self.stats.frames_submitted += 1,
            Err(e) => {
                log::warn!("Frame {} not presented: {e}", self.stats.frames_submitted + self.stats.skipped_frames);
                self.stats.skipped_frames += 1;
                self.recover_frame();
            }
        }
        result
    }

    fn begin_render_pass(&mut self, framebuffer: FramebufferKey, clear: &ClearValues) -> GfxResult<()> {
        self.usable()?;
        let frame = self.frame.as_mut().ok_or(NOT_RECORDING)?;
        if frame.render_pass.is_some() {
            return Err(GfxError::InvalidUsage("a render pass is already open"));
        }
        let fb = self
            .framebuffers
            .get(framebuffer)
            .ok_or(GfxError::InvalidUsage("unknown framebuffer"))?;
        let (pass, device_framebuffer, extent) = match &fb.target {
            FramebufferTarget::Swapchain => {
                let resources = self
                    .swapchain
                    .as_ref()
                    .and_then(SwapchainManager::resources)
                    .ok_or(GfxError::ZeroFramebufferSize)?;
                let image = resources
                    .images
                    .get(frame.image_index as usize)
                    .ok_or(GfxError::Unknown("acquired image index out of range".to_string()))?;
                frame.default_pass_done = true;
                (resources.render_pass, image.framebuffer, resources.config.extent)
            }
            FramebufferTarget::Offscreen(target) => (target.render_pass, target.framebuffer, fb.info.extent),
        };
        self.device.cmd_begin_render_pass(frame.command_buffer, pass, device_framebuffer, extent, clear);
        frame.render_pass = Some(framebuffer);
        frame.bound = None;
        Ok(())
    }

    fn end_render_pass(&mut self) -> GfxResult<()> {
        self.usable()?;
        let frame = self.frame.as_mut().ok_or(NOT_RECORDING)?;
        if frame.render_pass.take().is_none() {
            return Err(GfxError::InvalidUsage("no render pass is open"));
        }
        self.device.cmd_end_render_pass(frame.command_buffer);
        frame.bound = None;
        Ok(())
    }

    fn bind_pipeline(&mut self, pipeline: PipelineKey, resources: &[ResourceBinding]) -> GfxResult<()> {
        let frame = self.active_frame()?;
        let resource = self.pipelines.get(pipeline).ok_or(GfxError::InvalidUsage("unknown pipeline"))?;
        let kind = resource.kind();
        let core = resource.core();
        match kind {
            PipelineKind::Graphics if frame.render_pass != Some(core.framebuffer) => {
                return Err(GfxError::InvalidUsage("graphics pipelines bind inside their framebuffer's render pass"));
            }
            PipelineKind::Compute | PipelineKind::RayTracing if frame.render_pass.is_some() => {
                return Err(GfxError::InvalidUsage("compute and ray tracing pipelines bind outside render passes"));
            }
            _ => {}
        }

        let cb = frame.command_buffer;
        let set = core.set_for_slot(self.current_frame_slot());
        let first_write = !frame.written.contains(&pipeline);
        match set {
            None if !resources.is_empty() => {
                return Err(GfxError::InvalidUsage("pipeline declares no resource bindings"));
            }
            Some(set) if first_write => {
                let lookup = ResourceLookup {
                    buffers: &self.buffers,
                    images: &self.images,
                    samplers: &self.samplers,
                    scenes: &self.scenes,
                };
                let writes = lookup.writes(&core.resources, resources)?;
                self.device.write_descriptor_set(set, &writes);
            }
            // The set is already referenced by commands recorded this frame
            Some(_) if !resources.is_empty() => {
                return Err(GfxError::InvalidUsage("pipeline resources can be bound once per frame"));
            }
            _ => {}
        }

        self.device.cmd_bind_pipeline(cb, kind, core.pipeline);
        if let Some(set) = set {
            self.device.cmd_bind_descriptor_set(cb, kind, core.base.layout, set);
        }
        if let PipelineResource::Graphics(graphics) = resource {
            if graphics.state().dynamic_viewport {
                let extent = self.framebuffers.get(core.framebuffer).map_or(Extent2D::new(0, 0), |f| f.info.extent);
                self.device.cmd_set_viewport(cb, &Viewport::full(extent), &Rect2D::full(extent));
            }
        }

        let info = self.frame_info(frame);
        if let Some(resource) = self.pipelines.get_mut(pipeline) {
            resource.variant_mut().core_mut().hooks.on_bind(&info);
        }
        if let Some(frame) = self.frame.as_mut() {
            frame.bound = Some(pipeline);
            if first_write && set.is_some() {
                frame.written.push(pipeline);
            }
        }
        Ok(())
    }

    fn draw_mesh(&mut self, draw: &MeshDraw<'_>) -> GfxResult<()> {
        let (frame, pipeline) = self.bound_pipeline(PipelineKind::Graphics)?;
        let cb = frame.command_buffer;
        let PipelineResource::Graphics(graphics) = pipeline else {
            return Err(GfxError::InvalidUsage("no graphics pipeline is bound"));
        };
        let buffer_with = |key: BufferKey, usage: BufferUsage, missing: &'static str| {
            self.buffers
                .get(key)
                .filter(|b| b.info.usage.contains(usage))
                .map(|b| b.buffer)
                .ok_or(GfxError::InvalidUsage(missing))
        };

        if graphics.vertex_layout().has_input() {
            let key = draw
                .vertex_buffer
                .ok_or(GfxError::InvalidUsage("pipeline consumes vertices but no vertex buffer was given"))?;
            let buffer = buffer_with(key, BufferUsage::VERTEX, "vertex buffer is unknown or lacks vertex usage")?;
            self.device.cmd_bind_vertex_buffer(cb, buffer);
        }
        self.push_constants(cb, pipeline, draw.push_constants)?;
        match draw.index_buffer {
            Some((key, index_type)) => {
                let buffer = buffer_with(key, BufferUsage::INDEX, "index buffer is unknown or lacks index usage")?;
                self.device.cmd_bind_index_buffer(cb, buffer, index_type);
                self.device.cmd_draw_indexed(cb, draw.count, draw.instance_count);
            }
            None => self.device.cmd_draw(cb, draw.count, draw.instance_count),
        }
        Ok(())
    }

    fn dispatch_compute(&mut self, groups: [u32; 3], push_constants: &[u8]) -> GfxResult<()> {
        let (frame, pipeline) = self.bound_pipeline(PipelineKind::Compute)?;
        let cb = frame.command_buffer;
        self.push_constants(cb, pipeline, push_constants)?;
        let [x, y, z] = groups;
        self.device.cmd_dispatch(cb, x, y, z);
        Ok(())
    }

    fn trace_rays(&mut self, width: u32, height: u32, depth: u32, push_constants: &[u8]) -> GfxResult<()> {
        let (frame, pipeline) = self.bound_pipeline(PipelineKind::RayTracing)?;
        let cb = frame.command_buffer;
        let PipelineResource::RayTracing(rt) = pipeline else {
            return Err(GfxError::InvalidUsage("no ray tracing pipeline is bound"));
        };
        self.push_constants(cb, pipeline, push_constants)?;
        self.device.cmd_trace_rays(cb, rt.regions(), width, height, depth);
        Ok(())
    }

    fn resize(&mut self, extent: Extent2D) -> GfxResult<()> {
        self.outside_frame()?;
        let (Some(swapchain), Some(transfer)) = (self.swapchain.as_mut(), self.transfer.as_mut()) else {
            return Err(SHUT_DOWN);
        };
        swapchain.request_extent(extent);
        let recreated = swapchain.recreate(&self.device, transfer);
        self.check_swapchain_generation();
        self.track(recreated).map(|_| ())
    }

    fn set_vsync(&mut self, vsync: bool) -> GfxResult<()> {
        self.usable()?;
        let swapchain = self.swapchain.as_mut().ok_or(SHUT_DOWN)?;
        swapchain.set_vsync(vsync);
        Ok(())
    }

    fn wait_idle(&mut self) -> GfxResult<()> {
        self.usable()?;
        let result = self.device.wait_idle();
        self.track(result)
    }

    fn extent(&self) -> Extent2D {
        match &self.swapchain {
            Some(swapchain) => swapchain.extent(),
            None => self.framebuffers.get(self.default_framebuffer).map_or(Extent2D::new(0, 0), |f| f.info.extent),
        }
    }

    fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        if self.frame.take().is_some() {
            log::warn!("Shutdown while recording; the frame is discarded");
        }
        if !self.lost {
            match self.device.wait_idle() {
                Ok(()) => {}
                Err(GfxError::DeviceLost) => self.lost = true,
                Err(e) => fatal("shutdown", &e),
            }
        }

        let device = &self.device;
        for (_, pipeline) in self.pipelines.drain() {
            pipeline.destroy(device);
        }
        for (_, framebuffer) in self.framebuffers.drain() {
            framebuffer.destroy(device, &mut self.images);
        }
        for (_, scene) in self.scenes.drain() {
            scene.destroy(device);
        }
        self.scene_meshes.clear();
        for (_, mesh) in self.meshes.drain() {
            mesh.destroy(device);
        }
        for (_, shader) in self.shaders.drain() {
            shader.destroy(device);
        }
        for (_, sampler) in self.samplers.drain() {
            device.destroy_sampler(sampler);
        }
        for (_, image) in self.images.drain() {
            image.destroy(device);
        }
        for (_, buffer) in self.buffers.drain() {
            buffer.destroy(device);
        }
        if let Some(swapchain) = self.swapchain.take() {
            swapchain.destroy(device);
        }
        if let Some(frames) = self.frames.take() {
            frames.destroy(device);
        }
        if let Some(transfer) = self.transfer.take() {
            transfer.destroy(device);
        }
        log::info!(
            "Explicit backend shut down after {} frames ({} skipped, {} resizes)",
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

impl<D: Device> Drop for ExplicitBackend<D> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::headless::{HeadlessConfig, HeadlessDevice, LiveObjects, SPIRV_MAGIC};
    use crate::pipeline::VertexLayout;
    use crate::types::{BindingType, BoundResource, ResourceLayout};

    fn backend() -> ExplicitBackend<HeadlessDevice> {
        let config = HeadlessConfig::default();
        let extent = config.surface_extent;
        ExplicitBackend::new(HeadlessDevice::new(config), &GfxConfig::default(), extent).unwrap()
    }

    fn shader(backend: &mut ExplicitBackend<HeadlessDevice>, stage: ShaderStage) -> ShaderKey {
        backend.create_shader(stage, &ShaderSource::SpirV(vec![SPIRV_MAGIC, 0x0001_0000])).unwrap()
    }

    fn graphics(backend: &mut ExplicitBackend<HeadlessDevice>, resources: ResourceLayout) -> PipelineKey {
        let vs = shader(backend, ShaderStage::Vertex);
        let fs = shader(backend, ShaderStage::Fragment);
        let info = GraphicsPipelineInfo::new(vs, fs).with_resources(resources);
        let fb = backend.default_framebuffer();
        backend.create_graphics_pipeline(fb, info).unwrap()
    }

    #[test]
    fn test_resources_rejected_while_recording() {
        let mut backend = backend();
        backend.begin_record().unwrap();
        let info = BufferInfo::dynamic(64, BufferUsage::UNIFORM);
        assert_eq!(backend.create_buffer(&info, None), Err(RECORDING));
        backend.end_record().unwrap();
        assert!(backend.create_buffer(&info, None).is_ok());
    }

    #[test]
    fn test_graphics_pipeline_needs_its_pass() {
        let mut backend = backend();
        let pipeline = graphics(&mut backend, ResourceLayout::default());
        backend.begin_record().unwrap();
        assert!(matches!(backend.bind_pipeline(pipeline, &[]), Err(GfxError::InvalidUsage(_))));

        let fb = backend.default_framebuffer();
        backend.begin_render_pass(fb, &ClearValues::default()).unwrap();
        backend.bind_pipeline(pipeline, &[]).unwrap();
        backend.draw_mesh(&MeshDraw::vertices(None, 3)).unwrap();
        backend.end_render_pass().unwrap();
        backend.end_record().unwrap();
        assert!(backend.device().validation_errors().is_empty());
    }

    #[test]
    fn test_vertex_input_requires_vertex_buffer() {
        let mut backend = backend();
        let vs = shader(&mut backend, ShaderStage::Vertex);
        let fs = shader(&mut backend, ShaderStage::Fragment);
        let layout = VertexLayout::new(12).with_attribute(0, VertexFormat::Float3, 0);
        let info = GraphicsPipelineInfo::new(vs, fs).with_vertex_layout(layout);
        let fb = backend.default_framebuffer();
        let pipeline = backend.create_graphics_pipeline(fb, info).unwrap();
        let uniform = backend.create_buffer(&BufferInfo::dynamic(36, BufferUsage::UNIFORM), None).unwrap();

        backend.begin_record().unwrap();
        backend.begin_render_pass(fb, &ClearValues::default()).unwrap();
        backend.bind_pipeline(pipeline, &[]).unwrap();
        assert!(backend.draw_mesh(&MeshDraw::vertices(None, 3)).is_err());
        assert!(backend.draw_mesh(&MeshDraw::vertices(Some(uniform), 3)).is_err());
        backend.end_render_pass().unwrap();
        backend.end_record().unwrap();
    }

    #[test]
    fn test_descriptor_set_written_once_per_frame() {
        let mut backend = backend();
        let layout = ResourceLayout::default().with_binding(0, BindingType::UniformBuffer);
        let pipeline = graphics(&mut backend, layout);
        let ubo = backend.create_buffer(&BufferInfo::dynamic(64, BufferUsage::UNIFORM), None).unwrap();
        let bindings = [ResourceBinding { binding: 0, resource: BoundResource::UniformBuffer(ubo) }];

        backend.begin_record().unwrap();
        let fb = backend.default_framebuffer();
        backend.begin_render_pass(fb, &ClearValues::default()).unwrap();
        backend.bind_pipeline(pipeline, &bindings).unwrap();
        backend.bind_pipeline(pipeline, &[]).unwrap();
        assert!(backend.bind_pipeline(pipeline, &bindings).is_err());
        backend.end_render_pass().unwrap();
        backend.end_record().unwrap();

        // Next frame uses the other slot's set and may write again
        backend.begin_record().unwrap();
        backend.begin_render_pass(fb, &ClearValues::default()).unwrap();
        backend.bind_pipeline(pipeline, &bindings).unwrap();
        backend.end_render_pass().unwrap();
        backend.end_record().unwrap();
    }

    #[test]
    fn test_shader_outlives_destroy_while_pipeline_uses_it() {
        let mut backend = backend();
        let vs = shader(&mut backend, ShaderStage::Vertex);
        let fs = shader(&mut backend, ShaderStage::Fragment);
        let fb = backend.default_framebuffer();
        let pipeline = backend.create_graphics_pipeline(fb, GraphicsPipelineInfo::new(vs, fs)).unwrap();

        backend.destroy_shader(vs).unwrap();
        backend.destroy_shader(fs).unwrap();
        assert_eq!(backend.device().live_objects().shader_modules, 2);
        assert!(backend.destroy_shader(vs).is_err());

        backend.destroy_pipeline(pipeline).unwrap();
        assert_eq!(backend.device().live_objects().shader_modules, 0);
    }

    #[test]
    fn test_offscreen_attachment_cannot_be_destroyed_alone() {
        let mut backend = backend();
        let info = FramebufferInfo {
            extent: Extent2D::new(64, 64),
            color_formats: vec![Format::Rgba8Unorm],
            depth_format: None,
        };
        let fb = backend.create_framebuffer(&info).unwrap();
        let color = backend.framebuffer_attachment(fb, 0).unwrap();
        assert!(backend.destroy_image(color).is_err());
        assert!(backend.destroy_framebuffer(backend.default_framebuffer()).is_err());
        backend.destroy_framebuffer(fb).unwrap();
        assert!(backend.image_handle(color).is_none());
    }

    #[test]
    fn test_shutdown_releases_everything() {
        let mut backend = backend();
        let pipeline = graphics(&mut backend, ResourceLayout::default().with_binding(0, BindingType::UniformBuffer));
        backend.create_buffer(&BufferInfo::constant(256, BufferUsage::VERTEX), Some(&[7; 256])).unwrap();
        backend.create_image(&ImageInfo::texture_2d(4, 4, Format::Rgba8Unorm), Some(&[1; 64])).unwrap();
        backend.create_sampler(&SamplerInfo::default()).unwrap();
        backend.begin_record().unwrap();
        backend.end_record().unwrap();
        assert!(backend.pipeline_handle(pipeline).is_some());

        backend.shutdown();
        backend.shutdown();
        assert_eq!(backend.device().live_objects(), LiveObjects::default());
        assert!(backend.device().validation_errors().is_empty());
        assert_eq!(backend.begin_record(), Err(SHUT_DOWN));
    }
}
