//! Pipelines of the explicit backend
//!
//! Every pipeline belongs to a framebuffer and is rebuilt when that framebuffer
//! changes extent or render pass. A rebuild creates the replacement first and
//! only then destroys the old object, so a failed rebuild leaves a working
//! pipeline behind.

use slotmap::SlotMap;

use super::frame::FRAME_LAG;
use super::raytracing::{AccelerationStructure, SbtLayout, ShaderBindingTable};
use super::resources::{BufferResource, ImageResource, ShaderResource};
use crate::error::{GfxError, GfxResult};
use crate::hal::{
    ComputePipelineDesc, DescriptorWrite, Device, GraphicsPipelineDesc, RayTracingPipelineDesc, SbtRegions,
};
use crate::pipeline::{
    ComputePipelineInfo, FixedFunctionState, GraphicsPipelineInfo, PipelineHooks, PipelineKind,
    RayTracingPipelineInfo, VertexLayout,
};
use crate::types::{
    BindingType, BoundResource, BufferKey, Extent2D, FramebufferKey, ImageKey, ResourceBinding, ResourceLayout,
    RtSceneKey, SamplerKey, ShaderKey, ShaderStage,
};

/// What a pipeline is built against
pub struct PipelineTarget<D: Device> {
    /// Owning framebuffer
    pub framebuffer: FramebufferKey,
    /// Render pass of the framebuffer; absent while the window has no area
    pub render_pass: Option<D::RenderPass>,
    /// Colour attachments in the render pass
    pub color_count: u32,
    /// Framebuffer extent
    pub extent: Extent2D,
    /// Framebuffer generation; bumps on every resize
    pub generation: u64,
}

impl<D: Device> Clone for PipelineTarget<D> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<D: Device> Copy for PipelineTarget<D> {}

struct Descriptors<D: Device> {
    pool: D::DescriptorPool,
    sets: Vec<D::DescriptorSet>,
}

/// Layout, cache and per-slot descriptor sets shared by every pipeline kind
pub struct PipelineBase<D: Device> {
    /// Pipeline layout
    pub layout: D::PipelineLayout,
    /// Pipeline cache reused by rebuilds
    pub cache: D::PipelineCache,
    descriptors: Option<Descriptors<D>>,
}

impl<D: Device> PipelineBase<D> {
    fn create(device: &D, resources: &ResourceLayout) -> GfxResult<Self> {
        let layout = device.create_pipeline_layout(resources)?;
        let cache = match device.create_pipeline_cache() {
            Ok(cache) => cache,
            Err(e) => {
                device.destroy_pipeline_layout(layout);
                return Err(e);
            }
        };
        let mut base = Self { layout, cache, descriptors: None };
        if !resources.bindings.is_empty() {
            if let Err(e) = base.create_descriptors(device, resources) {
                base.destroy(device);
                return Err(e);
            }
        }
        Ok(base)
    }

    fn create_descriptors(&mut self, device: &D, resources: &ResourceLayout) -> GfxResult<()> {
        let pool = device.create_descriptor_pool(resources, FRAME_LAG as u32)?;
        let descriptors = self.descriptors.insert(Descriptors { pool, sets: Vec::with_capacity(FRAME_LAG) });
        for _ in 0..FRAME_LAG {
            descriptors.sets.push(device.allocate_descriptor_set(pool, self.layout)?);
        }
        Ok(())
    }

    fn destroy(self, device: &D) {
        if let Some(descriptors) = self.descriptors {
            device.destroy_descriptor_pool(descriptors.pool);
        }
        device.destroy_pipeline_cache(self.cache);
        device.destroy_pipeline_layout(self.layout);
    }
}

/// Fields every pipeline kind carries
pub struct PipelineCore<D: Device> {
    /// Owning framebuffer
    pub framebuffer: FramebufferKey,
    /// Device pipeline
    pub pipeline: D::Pipeline,
    /// Layout, cache and descriptors
    pub base: PipelineBase<D>,
    /// Declared bindings
    pub resources: ResourceLayout,
    /// Caller hooks
    pub hooks: Box<dyn PipelineHooks>,
    /// Framebuffer generation the pipeline was last built for
    pub generation: u64,
}

impl<D: Device> PipelineCore<D> {
    /// Descriptor set used by frame slot `slot`, if the pipeline has bindings
    pub fn set_for_slot(&self, slot: usize) -> Option<D::DescriptorSet> {
        self.descriptors().and_then(|d| d.sets.get(slot).copied())
    }

    fn descriptors(&self) -> Option<&Descriptors<D>> {
        self.base.descriptors.as_ref()
    }

    fn destroy(mut self, device: &D) {
        self.hooks.on_destroy();
        device.destroy_pipeline(self.pipeline);
        self.base.destroy(device);
    }
}

/// Behaviour shared by the three pipeline kinds
pub trait PipelineVariant<D: Device> {
    /// Shared fields
    fn core(&self) -> &PipelineCore<D>;
    /// Shared fields, mutably
    fn core_mut(&mut self) -> &mut PipelineCore<D>;
    /// Bind point
    fn kind(&self) -> PipelineKind;
    /// Shaders the pipeline was built from
    fn shaders(&self) -> Vec<ShaderKey>;
    /// Bring size-dependent state up to date with `target`
    fn rebuild(&mut self, device: &D, target: &PipelineTarget<D>) -> GfxResult<()>;
}

fn shader_module<D: Device>(
    shaders: &SlotMap<ShaderKey, ShaderResource<D>>,
    key: ShaderKey,
    stage: ShaderStage,
) -> GfxResult<D::ShaderModule> {
    shaders
        .get(key)
        .ok_or(GfxError::InvalidUsage("pipeline refers to a destroyed shader"))?
        .module_for(stage)
}

fn add_users<D: Device>(shaders: &mut SlotMap<ShaderKey, ShaderResource<D>>, keys: &[ShaderKey]) {
    for key in keys {
        if let Some(shader) = shaders.get_mut(*key) {
            shader.add_user();
        }
    }
}

/// Rasterization pipeline
pub struct GraphicsPipeline<D: Device> {
    core: PipelineCore<D>,
    vertex: ShaderKey,
    fragment: ShaderKey,
    vertex_module: D::ShaderModule,
    fragment_module: D::ShaderModule,
    vertex_layout: VertexLayout,
    state: FixedFunctionState,
}

impl<D: Device> GraphicsPipeline<D> {
    /// Build against `target`, fitting size-dependent state through the resize hook
    pub fn create(
        device: &D,
        shaders: &mut SlotMap<ShaderKey, ShaderResource<D>>,
        target: &PipelineTarget<D>,
        info: GraphicsPipelineInfo,
    ) -> GfxResult<Self> {
        let GraphicsPipelineInfo { vertex, fragment, vertex_layout, mut state, resources, mut hooks } = info;
        let vertex_module = shader_module(shaders, vertex, ShaderStage::Vertex)?;
        let fragment_module = shader_module(shaders, fragment, ShaderStage::Fragment)?;
        let render_pass = target.render_pass.ok_or(GfxError::ZeroFramebufferSize)?;
        hooks.on_resize(&mut state, target.extent);

        let base = PipelineBase::create(device, &resources)?;
        let desc = GraphicsPipelineDesc {
            vertex: vertex_module,
            fragment: fragment_module,
            layout: base.layout,
            cache: base.cache,
            render_pass,
            color_attachment_count: target.color_count,
            vertex_layout: &vertex_layout,
            state: &state,
        };
        let pipeline = match device.create_graphics_pipeline(&desc) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                base.destroy(device);
                return Err(e);
            }
        };

        add_users(shaders, &[vertex, fragment]);
        let core = PipelineCore { framebuffer: target.framebuffer, pipeline, base, resources, hooks, generation: target.generation };
        Ok(Self { core, vertex, fragment, vertex_module, fragment_module, vertex_layout, state })
    }

    /// Current fixed-function state
    pub fn state(&self) -> &FixedFunctionState {
        &self.state
    }

    /// Vertex input the pipeline consumes
    pub fn vertex_layout(&self) -> &VertexLayout {
        &self.vertex_layout
    }
}

impl<D: Device> PipelineVariant<D> for GraphicsPipeline<D> {
    fn core(&self) -> &PipelineCore<D> {
        &self.core
    }

    fn core_mut(&mut self) -> &mut PipelineCore<D> {
        &mut self.core
    }

    fn kind(&self) -> PipelineKind {
        PipelineKind::Graphics
    }

    fn shaders(&self) -> Vec<ShaderKey> {
        vec![self.vertex, self.fragment]
    }

    fn rebuild(&mut self, device: &D, target: &PipelineTarget<D>) -> GfxResult<()> {
        let render_pass = target.render_pass.ok_or(GfxError::ZeroFramebufferSize)?;
        let mut state = self.state;
        self.core.hooks.on_resize(&mut state, target.extent);
        let desc = GraphicsPipelineDesc {
            vertex: self.vertex_module,
            fragment: self.fragment_module,
            layout: self.core.base.layout,
            cache: self.core.base.cache,
            render_pass,
            color_attachment_count: target.color_count,
            vertex_layout: &self.vertex_layout,
            state: &state,
        };
        let pipeline = device.create_graphics_pipeline(&desc)?;
        device.destroy_pipeline(std::mem::replace(&mut self.core.pipeline, pipeline));
        self.state = state;
        self.core.generation = target.generation;
        Ok(())
    }
}

/// Compute pipeline; has no size-dependent device state
pub struct ComputePipeline<D: Device> {
    core: PipelineCore<D>,
    shader: ShaderKey,
}

impl<D: Device> ComputePipeline<D> {
    /// Build a compute pipeline registered on `target`'s framebuffer
    pub fn create(
        device: &D,
        shaders: &mut SlotMap<ShaderKey, ShaderResource<D>>,
        target: &PipelineTarget<D>,
        info: ComputePipelineInfo,
    ) -> GfxResult<Self> {
        let ComputePipelineInfo { shader, resources, hooks } = info;
        let module = shader_module(shaders, shader, ShaderStage::Compute)?;
        let base = PipelineBase::create(device, &resources)?;
        let desc = ComputePipelineDesc { shader: module, layout: base.layout, cache: base.cache };
        let pipeline = match device.create_compute_pipeline(&desc) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                base.destroy(device);
                return Err(e);
            }
        };
        add_users(shaders, &[shader]);
        let core = PipelineCore { framebuffer: target.framebuffer, pipeline, base, resources, hooks, generation: target.generation };
        Ok(Self { core, shader })
    }
}

fn run_resize_hook<D: Device>(core: &mut PipelineCore<D>, target: &PipelineTarget<D>) {
    let mut scratch = FixedFunctionState::default();
    core.hooks.on_resize(&mut scratch, target.extent);
    core.generation = target.generation;
}

impl<D: Device> PipelineVariant<D> for ComputePipeline<D> {
    fn core(&self) -> &PipelineCore<D> {
        &self.core
    }

    fn core_mut(&mut self) -> &mut PipelineCore<D> {
        &mut self.core
    }

    fn kind(&self) -> PipelineKind {
        PipelineKind::Compute
    }

    fn shaders(&self) -> Vec<ShaderKey> {
        vec![self.shader]
    }

    fn rebuild(&mut self, _device: &D, target: &PipelineTarget<D>) -> GfxResult<()> {
        run_resize_hook(&mut self.core, target);
        Ok(())
    }
}

/// Ray tracing pipeline with its shader binding table
pub struct RayTracingPipeline<D: Device> {
    core: PipelineCore<D>,
    shaders: Vec<ShaderKey>,
    sbt: ShaderBindingTable<D>,
}

impl<D: Device> RayTracingPipeline<D> {
    /// Build the pipeline, fetch its group handles and lay out the binding table
    pub fn create(
        device: &D,
        shaders: &mut SlotMap<ShaderKey, ShaderResource<D>>,
        target: &PipelineTarget<D>,
        info: RayTracingPipelineInfo,
    ) -> GfxResult<Self> {
        let props = device.capabilities().ray_tracing.ok_or(GfxError::FeatureNotSupported)?;
        let group_count = info.group_count();
        let RayTracingPipelineInfo { raygen, miss, closest_hit, resources, max_recursion_depth, hooks } = info;
        if max_recursion_depth == 0 || max_recursion_depth > props.max_recursion_depth {
            return Err(GfxError::InvalidUsage("recursion depth outside the device limit"));
        }

        let raygen_module = shader_module(shaders, raygen, ShaderStage::RayGen)?;
        let miss_modules = miss
            .iter()
            .map(|k| shader_module(shaders, *k, ShaderStage::Miss))
            .collect::<GfxResult<Vec<_>>>()?;
        let hit_modules = closest_hit
            .iter()
            .map(|k| shader_module(shaders, *k, ShaderStage::ClosestHit))
            .collect::<GfxResult<Vec<_>>>()?;

        let base = PipelineBase::create(device, &resources)?;
        let desc = RayTracingPipelineDesc {
            raygen: raygen_module,
            miss: &miss_modules,
            closest_hit: &hit_modules,
            layout: base.layout,
            cache: base.cache,
            max_recursion_depth,
        };
        let pipeline = match device.create_ray_tracing_pipeline(&desc) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                base.destroy(device);
                return Err(e);
            }
        };

        let layout = SbtLayout::new(&props, miss.len() as u32, closest_hit.len() as u32);
        let sbt = device
            .shader_group_handles(pipeline, group_count)
            .and_then(|handles| ShaderBindingTable::create(device, &props, &layout, &handles));
        let sbt = match sbt {
            Ok(sbt) => sbt,
            Err(e) => {
                device.destroy_pipeline(pipeline);
                base.destroy(device);
                return Err(e);
            }
        };

        let keys: Vec<ShaderKey> = std::iter::once(raygen).chain(miss).chain(closest_hit).collect();
        add_users(shaders, &keys);
        let core = PipelineCore { framebuffer: target.framebuffer, pipeline, base, resources, hooks, generation: target.generation };
        Ok(Self { core, shaders: keys, sbt })
    }

    /// Regions passed to trace calls
    pub fn regions(&self) -> &SbtRegions {
        &self.sbt.strided
    }
}

impl<D: Device> PipelineVariant<D> for RayTracingPipeline<D> {
    fn core(&self) -> &PipelineCore<D> {
        &self.core
    }

    fn core_mut(&mut self) -> &mut PipelineCore<D> {
        &mut self.core
    }

    fn kind(&self) -> PipelineKind {
        PipelineKind::RayTracing
    }

    fn shaders(&self) -> Vec<ShaderKey> {
        self.shaders.clone()
    }

    fn rebuild(&mut self, _device: &D, target: &PipelineTarget<D>) -> GfxResult<()> {
        run_resize_hook(&mut self.core, target);
        Ok(())
    }
}

/// A registered pipeline of any kind
pub enum PipelineResource<D: Device> {
    /// Rasterization
    Graphics(GraphicsPipeline<D>),
    /// Compute
    Compute(ComputePipeline<D>),
    /// Ray tracing
    RayTracing(RayTracingPipeline<D>),
}

impl<D: Device> PipelineResource<D> {
    /// The kind-specific implementation
    pub fn variant(&self) -> &dyn PipelineVariant<D> {
        match self {
            Self::Graphics(p) => p,
            Self::Compute(p) => p,
            Self::RayTracing(p) => p,
        }
    }

    /// The kind-specific implementation, mutably
    pub fn variant_mut(&mut self) -> &mut dyn PipelineVariant<D> {
        match self {
            Self::Graphics(p) => p,
            Self::Compute(p) => p,
            Self::RayTracing(p) => p,
        }
    }

    /// Shared fields
    pub fn core(&self) -> &PipelineCore<D> {
        self.variant().core()
    }

    /// Bind point
    pub fn kind(&self) -> PipelineKind {
        self.variant().kind()
    }

    /// Destroy the device objects, returning the shaders the pipeline used
    pub fn destroy(self, device: &D) -> Vec<ShaderKey> {
        let shaders = self.variant().shaders();
        match self {
            Self::Graphics(p) => p.core.destroy(device),
            Self::Compute(p) => p.core.destroy(device),
            Self::RayTracing(p) => {
                p.sbt.destroy(device);
                p.core.destroy(device);
            }
        }
        shaders
    }
}

/// Registries a bind call resolves resource keys against
pub struct ResourceLookup<'a, D: Device> {
    /// Buffers
    pub buffers: &'a SlotMap<BufferKey, BufferResource<D>>,
    /// Images
    pub images: &'a SlotMap<ImageKey, ImageResource<D>>,
    /// Samplers
    pub samplers: &'a SlotMap<SamplerKey, D::Sampler>,
    /// Ray tracing scenes
    pub scenes: &'a SlotMap<RtSceneKey, AccelerationStructure<D>>,
}

impl<D: Device> ResourceLookup<'_, D> {
    fn buffer(&self, key: BufferKey) -> GfxResult<&BufferResource<D>> {
        self.buffers.get(key).ok_or(GfxError::InvalidUsage("binding refers to a destroyed buffer"))
    }

    fn view(&self, key: ImageKey) -> GfxResult<D::ImageView> {
        self.images
            .get(key)
            .map(|i| i.view)
            .ok_or(GfxError::InvalidUsage("binding refers to a destroyed image"))
    }

    /// Turn caller bindings into descriptor writes, checking them against `layout`
    pub fn writes(&self, layout: &ResourceLayout, bindings: &[ResourceBinding]) -> GfxResult<Vec<DescriptorWrite<D>>> {
        bindings
            .iter()
            .map(|b| {
                let declared = layout
                    .bindings
                    .iter()
                    .find(|info| info.binding == b.binding)
                    .ok_or(GfxError::InvalidUsage("binding not declared by the pipeline"))?;
                let binding = b.binding;
                match (declared.ty, b.resource) {
                    (BindingType::UniformBuffer, BoundResource::UniformBuffer(key)) => {
                        let buffer = self.buffer(key)?;
                        Ok(DescriptorWrite::UniformBuffer { binding, buffer: buffer.buffer, range: buffer.info.size })
                    }
                    (BindingType::StorageBuffer, BoundResource::StorageBuffer(key)) => {
                        let buffer = self.buffer(key)?;
                        Ok(DescriptorWrite::StorageBuffer { binding, buffer: buffer.buffer, range: buffer.info.size })
                    }
                    (BindingType::SampledImage, BoundResource::SampledImage(image, sampler)) => {
                        let sampler = *self
                            .samplers
                            .get(sampler)
                            .ok_or(GfxError::InvalidUsage("binding refers to a destroyed sampler"))?;
                        Ok(DescriptorWrite::SampledImage { binding, view: self.view(image)?, sampler })
                    }
                    (BindingType::StorageImage, BoundResource::StorageImage(image)) => {
                        Ok(DescriptorWrite::StorageImage { binding, view: self.view(image)? })
                    }
                    (BindingType::AccelerationStructure, BoundResource::Scene(scene)) => {
                        let scene = self
                            .scenes
                            .get(scene)
                            .ok_or(GfxError::InvalidUsage("binding refers to a destroyed scene"))?;
                        Ok(DescriptorWrite::AccelerationStructure { binding, accel: scene.accel })
                    }
                    _ => Err(GfxError::InvalidUsage("resource does not match the binding type")),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::headless::{FailPoint, HeadlessConfig, HeadlessDevice, SPIRV_MAGIC};
    use crate::hal::{ColorAttachmentDesc, ImageState, RenderPassDesc};
    use crate::pipeline::DefaultHooks;
    use crate::types::{Format, ShaderSource};
    use approx::assert_relative_eq;

    struct Fixture {
        device: HeadlessDevice,
        shaders: SlotMap<ShaderKey, ShaderResource<HeadlessDevice>>,
        target: PipelineTarget<HeadlessDevice>,
    }

    fn fixture() -> Fixture {
        let device = HeadlessDevice::new(HeadlessConfig::default());
        let pass = RenderPassDesc {
            colors: vec![ColorAttachmentDesc { format: Format::Bgra8Srgb, final_state: ImageState::Present }],
            depth: None,
        };
        let render_pass = device.create_render_pass(&pass).unwrap();
        let target = PipelineTarget {
            framebuffer: FramebufferKey::default(),
            render_pass: Some(render_pass),
            color_count: 1,
            extent: Extent2D::new(320, 200),
            generation: 0,
        };
        Fixture { device, shaders: SlotMap::with_key(), target }
    }

    fn shader(f: &mut Fixture, stage: ShaderStage) -> ShaderKey {
        let resource = ShaderResource::create(&f.device, stage, &ShaderSource::SpirV(vec![SPIRV_MAGIC])).unwrap();
        f.shaders.insert(resource)
    }

    #[test]
    fn test_rebuild_failure_keeps_old_pipeline() {
        let mut f = fixture();
        let vs = shader(&mut f, ShaderStage::Vertex);
        let fs = shader(&mut f, ShaderStage::Fragment);
        let info = GraphicsPipelineInfo::new(vs, fs).with_hooks(DefaultHooks);
        let mut pipeline = GraphicsPipeline::create(&f.device, &mut f.shaders, &f.target, info).unwrap();
        assert_relative_eq!(pipeline.state().viewport.width, 320.0);
        let original = pipeline.core().pipeline;

        let resized = PipelineTarget { extent: Extent2D::new(640, 480), generation: 1, ..f.target };
        f.device.fail_nth(FailPoint::CreatePipeline, 1, GfxError::OutOfDeviceMemory);
        assert!(pipeline.rebuild(&f.device, &resized).is_err());
        assert_eq!(pipeline.core().pipeline, original);
        assert_eq!(pipeline.core().generation, 0);
        assert_relative_eq!(pipeline.state().viewport.width, 320.0);

        pipeline.rebuild(&f.device, &resized).unwrap();
        assert_ne!(pipeline.core().pipeline, original);
        assert_relative_eq!(pipeline.state().viewport.width, 640.0);
        assert_eq!(f.device.live_objects().pipelines, 1);

        let used = PipelineResource::Graphics(pipeline).destroy(&f.device);
        assert_eq!(used, vec![vs, fs]);
    }

    #[test]
    fn test_wrong_stage_creates_nothing() {
        let mut f = fixture();
        let vs = shader(&mut f, ShaderStage::Vertex);
        let info = GraphicsPipelineInfo::new(vs, vs);
        assert!(GraphicsPipeline::create(&f.device, &mut f.shaders, &f.target, info).is_err());
        assert_eq!(f.device.live_objects().pipeline_layouts, 0);
    }

    #[test]
    fn test_descriptor_failure_rolls_back() {
        let mut f = fixture();
        let cs = shader(&mut f, ShaderStage::Compute);
        let resources = ResourceLayout::default().with_binding(0, BindingType::StorageImage);
        f.device.fail_nth(FailPoint::CreateDescriptorPool, 1, GfxError::OutOfDeviceMemory);
        let info = ComputePipelineInfo::new(cs, resources);
        assert!(ComputePipeline::create(&f.device, &mut f.shaders, &f.target, info).is_err());
        let live = f.device.live_objects();
        assert_eq!((live.pipeline_layouts, live.pipeline_caches, live.descriptor_pools), (0, 0, 0));
    }

    #[test]
    fn test_sets_per_frame_slot() {
        let mut f = fixture();
        let cs = shader(&mut f, ShaderStage::Compute);
        let resources = ResourceLayout::default().with_binding(0, BindingType::StorageImage);
        let pipeline = ComputePipeline::create(&f.device, &mut f.shaders, &f.target, ComputePipelineInfo::new(cs, resources)).unwrap();
        let sets: Vec<_> = (0..FRAME_LAG).filter_map(|slot| pipeline.core().set_for_slot(slot)).collect();
        assert_eq!(sets.len(), FRAME_LAG);
        assert_ne!(sets[0], sets[1]);
        PipelineResource::Compute(pipeline).destroy(&f.device);
        assert_eq!(f.device.live_objects().descriptor_pools, 0);
    }

    #[test]
    fn test_ray_tracing_pipeline_table() {
        let mut f = fixture();
        let rgen = shader(&mut f, ShaderStage::RayGen);
        let miss = shader(&mut f, ShaderStage::Miss);
        let hit = shader(&mut f, ShaderStage::ClosestHit);
        let info = RayTracingPipelineInfo::new(rgen, vec![miss], vec![hit], ResourceLayout::default());
        let pipeline = RayTracingPipeline::create(&f.device, &mut f.shaders, &f.target, info).unwrap();
        let regions = *pipeline.regions();
        assert_eq!(regions.raygen.stride, regions.raygen.size);
        assert_eq!(regions.hit.stride, 32);
        PipelineResource::RayTracing(pipeline).destroy(&f.device);
        assert_eq!(f.device.live_objects().buffers, 0);
        assert!(f.device.validation_errors().is_empty());
    }
}
