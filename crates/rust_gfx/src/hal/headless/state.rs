//! Object tables and command execution of the headless device

use std::collections::{HashMap, HashSet, VecDeque};

use super::failure::FailurePlan;
use super::{AccelId, BufferId, DeviceEvent, HeadlessCommand, ImageId};
use crate::hal::{
    align_up, AccelerationGeometry, AccelerationKind, AcquireOutcome, ImageState, PresentOutcome,
    QueueKind, RayTracingProperties, RenderPassDesc, StridedRegion,
};
use crate::pipeline::PipelineKind;
use crate::types::{BufferUsage, Extent2D, Extent3D, Format, ResourceLayout};

/// First device address handed out; addresses are only 16-byte aligned
const ADDRESS_BASE: u64 = 0x0010_0010;
const ADDRESS_GRANULARITY: u64 = 16;

/// Size of one acceleration structure instance record
pub(super) const INSTANCE_RECORD_SIZE: u64 = 64;

pub(super) struct Memory {
    pub bytes: Vec<u8>,
    pub host_visible: bool,
}

pub(super) struct BufferRecord {
    pub allocation: u64,
    pub size: u64,
    pub usage: BufferUsage,
    pub address: u64,
}

pub(super) struct ImageRecord {
    pub allocation: u64,
    pub extent: Extent3D,
    pub format: Format,
    pub state: ImageState,
    pub swapchain: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum RecordingState {
    Initial,
    Recording,
    Executable,
    Pending,
}

pub(super) struct CommandBufferRecord {
    pub queue: QueueKind,
    pub state: RecordingState,
    pub commands: Vec<HeadlessCommand>,
}

pub(super) struct FramebufferRecord {
    pub pass: u64,
    pub attachments: Vec<u64>,
    pub extent: Extent2D,
}

pub(super) struct PipelineRecord {
    pub kind: PipelineKind,
    pub miss_count: u32,
    pub hit_count: u32,
}

pub(super) struct PoolRecord {
    pub capacity: u32,
    pub allocated: u32,
}

pub(super) struct SetRecord {
    pub pool: u64,
}

pub(super) struct SwapchainRecord {
    pub images: Vec<u64>,
    pub extent: Extent2D,
    pub retired: bool,
    pub next: u32,
}

pub(super) struct AccelRecord {
    pub kind: AccelerationKind,
    pub buffer: u64,
    pub address: u64,
    pub built: bool,
}

pub(super) struct PendingSubmit {
    pub command_buffer: u64,
    pub fence: Option<u64>,
}

/// Everything the headless device knows, behind one lock
pub(super) struct State {
    next_id: u64,
    next_address: u64,
    pub memory: HashMap<u64, Memory>,
    pub buffers: HashMap<u64, BufferRecord>,
    pub images: HashMap<u64, ImageRecord>,
    pub views: HashMap<u64, u64>,
    pub samplers: HashSet<u64>,
    pub fences: HashMap<u64, bool>,
    pub semaphores: HashMap<u64, u32>,
    pub command_buffers: HashMap<u64, CommandBufferRecord>,
    pub render_passes: HashMap<u64, RenderPassDesc>,
    pub framebuffers: HashMap<u64, FramebufferRecord>,
    pub shader_modules: HashSet<u64>,
    pub layouts: HashMap<u64, ResourceLayout>,
    pub caches: HashSet<u64>,
    pub pipelines: HashMap<u64, PipelineRecord>,
    pub pools: HashMap<u64, PoolRecord>,
    pub sets: HashMap<u64, SetRecord>,
    pub swapchains: HashMap<u64, SwapchainRecord>,
    pub accels: HashMap<u64, AccelRecord>,
    pub pending: VecDeque<PendingSubmit>,
    pub failures: FailurePlan,
    pub events: Vec<DeviceEvent>,
    pub validation: Vec<String>,
    pub acquire_script: VecDeque<AcquireOutcome>,
    pub present_script: VecDeque<PresentOutcome>,
    pub surface_extent: Extent2D,
}

/// Bytes of shader group handle `group`
pub(super) fn group_handle(group: u32, size: u32) -> Vec<u8> {
    vec![(group + 1) as u8; size as usize]
}

impl State {
    pub fn new(surface_extent: Extent2D) -> Self {
        Self {
            next_id: 1,
            next_address: ADDRESS_BASE,
            memory: HashMap::new(),
            buffers: HashMap::new(),
            images: HashMap::new(),
            views: HashMap::new(),
            samplers: HashSet::new(),
            fences: HashMap::new(),
            semaphores: HashMap::new(),
            command_buffers: HashMap::new(),
            render_passes: HashMap::new(),
            framebuffers: HashMap::new(),
            shader_modules: HashSet::new(),
            layouts: HashMap::new(),
            caches: HashSet::new(),
            pipelines: HashMap::new(),
            pools: HashMap::new(),
            sets: HashMap::new(),
            swapchains: HashMap::new(),
            accels: HashMap::new(),
            pending: VecDeque::new(),
            failures: FailurePlan::default(),
            events: Vec::new(),
            validation: Vec::new(),
            acquire_script: VecDeque::new(),
            present_script: VecDeque::new(),
            surface_extent,
        }
    }

    pub fn id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn validate(&mut self, message: String) {
        log::error!("headless validation: {message}");
        self.validation.push(message);
    }

    pub fn alloc_memory(&mut self, size: u64, host_visible: bool) -> u64 {
        let id = self.id();
        self.memory.insert(id, Memory { bytes: vec![0; size as usize], host_visible });
        id
    }

    pub fn alloc_address(&mut self, size: u64) -> u64 {
        let address = self.next_address;
        // Leave a gap so adjacent buffers never share an address range
        self.next_address += align_up(size, ADDRESS_GRANULARITY) + ADDRESS_GRANULARITY;
        address
    }

    pub fn create_image_record(&mut self, extent: Extent3D, format: Format, swapchain: Option<u64>) -> u64 {
        let size = extent.texel_count() * u64::from(format.bytes_per_texel());
        let allocation = self.alloc_memory(size, false);
        let id = self.id();
        self.images.insert(id, ImageRecord { allocation, extent, format, state: ImageState::Undefined, swapchain });
        id
    }

    pub fn remove_image_record(&mut self, image: u64) {
        if let Some(record) = self.images.remove(&image) {
            self.memory.remove(&record.allocation);
            let stale: Vec<u64> = self.views.iter().filter(|(_, i)| **i == image).map(|(v, _)| *v).collect();
            for view in stale {
                self.validate(format!("image {image} destroyed while view {view} is alive"));
            }
        }
    }

    /// Find the live buffer containing `[address, address + len)`
    pub fn resolve_address(&self, address: u64, len: u64) -> Option<(u64, u64)> {
        self.buffers.iter().find_map(|(id, b)| {
            let offset = address.checked_sub(b.address)?;
            (offset.checked_add(len)? <= b.size).then_some((*id, offset))
        })
    }

    pub fn read_address(&self, address: u64, len: u64) -> Option<Vec<u8>> {
        let (buffer, offset) = self.resolve_address(address, len)?;
        let memory = self.memory.get(&self.buffers.get(&buffer)?.allocation)?;
        Some(memory.bytes[offset as usize..(offset + len) as usize].to_vec())
    }

    /// Whether any submitted but unfinished work mentions the object
    pub fn in_flight(&self, object: u64) -> bool {
        self.pending.iter().any(|p| {
            self.command_buffers
                .get(&p.command_buffer)
                .is_some_and(|cb| cb.commands.iter().any(|c| c.references(object)))
        })
    }

    pub fn fence_pending(&self, fence: u64) -> bool {
        self.pending.iter().any(|p| p.fence == Some(fence))
    }

    /// Retire queued submissions up to and including the one signalling `fence`
    pub fn retire_through(&mut self, fence: u64, rt: Option<&RayTracingProperties>) {
        while let Some(submit) = self.pending.pop_front() {
            let done = submit.fence == Some(fence);
            self.complete(submit, rt);
            if done {
                break;
            }
        }
    }

    pub fn retire_all(&mut self, rt: Option<&RayTracingProperties>) {
        while let Some(submit) = self.pending.pop_front() {
            self.complete(submit, rt);
        }
    }

    pub fn complete(&mut self, submit: PendingSubmit, rt: Option<&RayTracingProperties>) {
        let commands = match self.command_buffers.get_mut(&submit.command_buffer) {
            Some(cb) => {
                cb.state = RecordingState::Executable;
                cb.commands.clone()
            }
            None => {
                self.validate(format!("command buffer {} freed before completion", submit.command_buffer));
                Vec::new()
            }
        };
        self.execute(&commands, rt);
        if let Some(fence) = submit.fence {
            if let Some(signaled) = self.fences.get_mut(&fence) {
                *signaled = true;
            }
        }
    }

    fn execute(&mut self, commands: &[HeadlessCommand], rt: Option<&RayTracingProperties>) {
        let mut pass: Option<u64> = None;
        let mut pipeline: Option<u64> = None;

        for command in commands {
            match command {
                HeadlessCommand::ImageBarrier { image, from, to, .. } => self.transition(image.0, *from, *to),
                HeadlessCommand::CopyBuffer { src, dst, region } => self.copy_buffer(*src, *dst, region.src_offset, region.dst_offset, region.size),
                HeadlessCommand::CopyBufferToImage { src, dst, extent } => self.copy_buffer_to_image(*src, *dst, *extent),
                HeadlessCommand::BeginRenderPass { framebuffer, extent, clear, .. } => {
                    if pass.is_some() {
                        self.validate("render pass begun inside a render pass".to_string());
                    }
                    let fb_extent = self.framebuffers.get(&framebuffer.0).map(|fb| fb.extent);
                    if fb_extent.is_some_and(|e| e != *extent) {
                        self.validate(format!("render area {extent:?} differs from framebuffer {fb_extent:?}"));
                    }
                    pass = Some(framebuffer.0);
                    self.clear_attachments(framebuffer.0, *clear);
                }
                HeadlessCommand::EndRenderPass => match pass.take() {
                    Some(fb) => self.finish_pass(fb),
                    None => self.validate("render pass ended outside a render pass".to_string()),
                },
                HeadlessCommand::BindPipeline { pipeline: p, .. } => pipeline = Some(p.0),
                HeadlessCommand::BindDescriptorSet { set, .. } => {
                    if !self.sets.contains_key(&set.0) {
                        self.validate(format!("bind of freed descriptor set {set:?}"));
                    }
                }
                HeadlessCommand::Draw { .. } | HeadlessCommand::DrawIndexed { .. } => {
                    let graphics = pipeline
                        .and_then(|p| self.pipelines.get(&p))
                        .is_some_and(|p| p.kind == PipelineKind::Graphics);
                    if pass.is_none() || !graphics {
                        self.validate("draw outside a render pass or without a graphics pipeline".to_string());
                    }
                }
                HeadlessCommand::Dispatch { .. } => {
                    let compute = pipeline
                        .and_then(|p| self.pipelines.get(&p))
                        .is_some_and(|p| p.kind == PipelineKind::Compute);
                    if !compute {
                        self.validate("dispatch without a compute pipeline".to_string());
                    }
                }
                HeadlessCommand::BuildAccelerationStructure { dst, geometry, scratch_address } => {
                    self.build_accel(*dst, geometry, *scratch_address, rt);
                }
                HeadlessCommand::TraceRays { regions, .. } => {
                    let Some(p) = pipeline.filter(|p| self.pipelines.get(p).is_some_and(|r| r.kind == PipelineKind::RayTracing)) else {
                        self.validate("trace rays without a ray tracing pipeline".to_string());
                        continue;
                    };
                    let (miss_count, hit_count) = self.pipelines.get(&p).map_or((0, 0), |r| (r.miss_count, r.hit_count));
                    if let Some(rt) = rt {
                        self.check_region("raygen", &regions.raygen, 0, 1, rt);
                        self.check_region("miss", &regions.miss, 1, miss_count, rt);
                        self.check_region("hit", &regions.hit, 1 + miss_count, hit_count, rt);
                    }
                }
                _ => {}
            }
        }

        if pass.is_some() {
            self.validate("command buffer ended inside a render pass".to_string());
        }
    }

    fn transition(&mut self, image: u64, from: ImageState, to: ImageState) {
        let Some(record) = self.images.get_mut(&image) else {
            self.validate(format!("barrier on destroyed image {image}"));
            return;
        };
        let current = record.state;
        record.state = to;
        if from != ImageState::Undefined && from != current {
            self.validate(format!("image {image} transitioned from {from:?} but is in {current:?}"));
        }
    }

    fn copy_buffer(&mut self, src: BufferId, dst: BufferId, src_offset: u64, dst_offset: u64, size: u64) {
        let (Some(s), Some(d)) = (self.buffers.get(&src.0), self.buffers.get(&dst.0)) else {
            self.validate(format!("copy between destroyed buffers {src:?} -> {dst:?}"));
            return;
        };
        let (src_size, src_mem, dst_size, dst_mem) = (s.size, s.allocation, d.size, d.allocation);
        if src_offset + size > src_size || dst_offset + size > dst_size {
            self.validate(format!("copy of {size} bytes out of bounds"));
            return;
        }
        let bytes = self.memory[&src_mem].bytes[src_offset as usize..(src_offset + size) as usize].to_vec();
        if let Some(memory) = self.memory.get_mut(&dst_mem) {
            memory.bytes[dst_offset as usize..(dst_offset + size) as usize].copy_from_slice(&bytes);
        }
    }

    fn copy_buffer_to_image(&mut self, src: BufferId, dst: ImageId, extent: Extent3D) {
        let (Some(s), Some(d)) = (self.buffers.get(&src.0), self.images.get(&dst.0)) else {
            self.validate(format!("copy from {src:?} into destroyed image {dst:?}"));
            return;
        };
        let (src_size, src_mem) = (s.size, s.allocation);
        let (state, image_extent, format, dst_mem) = (d.state, d.extent, d.format, d.allocation);

        if state != ImageState::TransferDst {
            self.validate(format!("copy into image {dst:?} in {state:?} state"));
            return;
        }
        if extent != image_extent {
            self.validate(format!("partial image copy {extent:?} into {image_extent:?}"));
            return;
        }
        let size = extent.texel_count() * u64::from(format.bytes_per_texel());
        if size > src_size {
            self.validate(format!("image copy reads {size} bytes from a {src_size} byte buffer"));
            return;
        }
        let bytes = self.memory[&src_mem].bytes[..size as usize].to_vec();
        if let Some(memory) = self.memory.get_mut(&dst_mem) {
            memory.bytes.copy_from_slice(&bytes);
        }
    }

    fn pass_images(&self, framebuffer: u64) -> Option<(Vec<u64>, RenderPassDesc)> {
        let fb = self.framebuffers.get(&framebuffer)?;
        let desc = self.render_passes.get(&fb.pass)?.clone();
        let images = fb.attachments.iter().filter_map(|v| self.views.get(v).copied()).collect();
        Some((images, desc))
    }

    fn clear_attachments(&mut self, framebuffer: u64, clear: [f32; 4]) {
        let Some((images, desc)) = self.pass_images(framebuffer) else {
            self.validate(format!("render pass on destroyed framebuffer {framebuffer}"));
            return;
        };
        let to_byte = |c: f32| (c.clamp(0.0, 1.0) * 255.0).round() as u8;
        let [r, g, b, a] = clear.map(to_byte);
        for (image, color) in images.iter().zip(&desc.colors) {
            let texel = match color.format {
                Format::Rgba8Unorm | Format::Rgba8Srgb => [r, g, b, a],
                Format::Bgra8Unorm | Format::Bgra8Srgb => [b, g, r, a],
                _ => continue,
            };
            let Some(record) = self.images.get(image) else { continue };
            if let Some(memory) = self.memory.get_mut(&record.allocation) {
                for chunk in memory.bytes.chunks_exact_mut(4) {
                    chunk.copy_from_slice(&texel);
                }
            }
        }
    }

    fn finish_pass(&mut self, framebuffer: u64) {
        let Some((images, desc)) = self.pass_images(framebuffer) else { return };
        for (i, image) in images.iter().enumerate() {
            let state = desc.colors.get(i).map_or(ImageState::DepthAttachment, |c| c.final_state);
            if let Some(record) = self.images.get_mut(image) {
                record.state = state;
            }
        }
    }

    fn build_accel(&mut self, dst: AccelId, geometry: &AccelerationGeometry, scratch_address: u64, rt: Option<&RayTracingProperties>) {
        if let Some(rt) = rt {
            if scratch_address % u64::from(rt.scratch_offset_alignment) != 0 {
                self.validate(format!("scratch address {scratch_address:#x} is misaligned"));
            }
        }
        if self.resolve_address(scratch_address, 1).is_none() {
            self.validate(format!("scratch address {scratch_address:#x} is not backed by a live buffer"));
        }

        match *geometry {
            AccelerationGeometry::Triangles { vertex_address, vertex_stride, vertex_count, index_address, triangle_count, .. } => {
                if self.resolve_address(vertex_address, vertex_stride * u64::from(vertex_count)).is_none() {
                    self.validate("vertex data is not backed by a live buffer".to_string());
                }
                if let Some(index_address) = index_address {
                    if self.resolve_address(index_address, u64::from(triangle_count) * 12).is_none() {
                        self.validate("index data is not backed by a live buffer".to_string());
                    }
                }
            }
            AccelerationGeometry::Instances { address, count } => {
                let Some(bytes) = self.read_address(address, u64::from(count) * INSTANCE_RECORD_SIZE) else {
                    self.validate("instance records are not backed by a live buffer".to_string());
                    return;
                };
                for record in bytes.chunks_exact(INSTANCE_RECORD_SIZE as usize) {
                    let mut reference = [0u8; 8];
                    reference.copy_from_slice(&record[56..64]);
                    let reference = u64::from_le_bytes(reference);
                    let valid = self.accels.values().any(|a| {
                        a.address == reference && a.built && a.kind == AccelerationKind::BottomLevel
                    });
                    if !valid {
                        self.validate(format!("instance references {reference:#x}, not a built bottom-level structure"));
                    }
                }
            }
        }

        match self.accels.get_mut(&dst.0) {
            Some(accel) => accel.built = true,
            None => self.validate(format!("build into destroyed acceleration structure {dst:?}")),
        }
    }

    fn check_region(&mut self, name: &str, region: &StridedRegion, first_group: u32, count: u32, rt: &RayTracingProperties) {
        if count == 0 {
            return;
        }
        if region.address % u64::from(rt.shader_group_base_alignment) != 0 {
            self.validate(format!("{name} region address {:#x} is misaligned", region.address));
        }
        if region.stride % u64::from(rt.shader_group_handle_alignment) != 0 {
            self.validate(format!("{name} region stride {} is misaligned", region.stride));
        }
        if region.size < region.stride * u64::from(count) {
            self.validate(format!("{name} region too small for {count} records"));
            return;
        }
        for i in 0..count {
            let address = region.address + u64::from(i) * region.stride;
            let expected = group_handle(first_group + i, rt.shader_group_handle_size);
            match self.read_address(address, expected.len() as u64) {
                Some(bytes) if bytes == expected => {}
                _ => self.validate(format!("{name} record {i} does not hold group {}", first_group + i)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add_buffer(state: &mut State, size: u64) -> (u64, u64) {
        let allocation = state.alloc_memory(size, true);
        let address = state.alloc_address(size);
        let id = state.id();
        state.buffers.insert(id, BufferRecord { allocation, size, usage: BufferUsage::STORAGE, address });
        (id, address)
    }

    #[test]
    fn test_address_resolves_among_higher_buffers() {
        let mut state = State::new(Extent2D::new(1, 1));
        let (low, low_address) = add_buffer(&mut state, 64);
        let (high, high_address) = add_buffer(&mut state, 64);
        assert!(high_address > low_address);

        assert_eq!(state.resolve_address(low_address + 16, 32), Some((low, 16)));
        assert_eq!(state.resolve_address(high_address, 64), Some((high, 0)));
        assert_eq!(state.resolve_address(low_address + 48, 32), None);
        assert_eq!(state.resolve_address(ADDRESS_BASE - 1, 1), None);
        assert_eq!(state.resolve_address(high_address + 8, u64::MAX), None);
    }
}
