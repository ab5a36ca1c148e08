//! [`Device`] over real Vulkan hardware
//!
//! Built on `ash` for the API and `vk-mem` for allocations. One graphics queue is
//! used for all rendering, compute and transfer work; presentation goes through
//! a second queue only when the surface demands a different family.

mod convert;
mod instance;

use std::collections::HashMap;
use std::ffi::CStr;
use std::fmt;
use std::mem::ManuallyDrop;

use ash::extensions::khr::{AccelerationStructure, RayTracingPipeline, Surface, Swapchain};
use ash::vk;
use parking_lot::Mutex;
use vk_mem::Alloc;

pub use instance::{RawWindow, VulkanSurfaceSource};

use self::instance::{ray_tracing_extensions, Adapter, InstanceContext};
use super::{
    AccelerationBuild, AccelerationGeometry, AccelerationKind, AccelerationSizes, AcquireOutcome, BufferAccess,
    BufferCopy, BufferDesc, ComputePipelineDesc, DescriptorWrite, Device, DeviceCapabilities, GraphicsPipelineDesc,
    ImageAspect, ImageDesc, ImageState, MemoryLocation, OwnershipTransfer, PresentOutcome, QueueKind,
    RayTracingPipelineDesc, RayTracingProperties, RenderPassDesc, SbtRegions, StridedRegion, Submit, SurfaceConfig,
    SurfaceSupport,
};
use crate::config::GfxConfig;
use crate::error::{GfxError, GfxResult};
use crate::pipeline::{PipelineKind, Rect2D, Viewport};
use crate::types::{
    BindingType, ClearValues, Extent2D, Extent3D, Format, IndexType, ResourceLayout, SamplerInfo, SurfaceTransform,
};

// SAFETY: literal is nul-terminated with no interior nul
const ENTRY_POINT: &CStr = unsafe { CStr::from_bytes_with_nul_unchecked(b"main\0") };

/// A `vk-mem` allocation and whether it can be mapped
pub struct VulkanAllocation {
    allocation: vk_mem::Allocation,
    host_visible: bool,
}

impl fmt::Debug for VulkanAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VulkanAllocation").field("host_visible", &self.host_visible).finish_non_exhaustive()
    }
}

struct RayTracingLoaders {
    accel: AccelerationStructure,
    pipeline: RayTracingPipeline,
}

#[derive(Clone, Copy)]
struct PassLayout {
    colors: usize,
    depth: bool,
}

/// Vulkan logical device with its queues, pools and allocator
pub struct VulkanDevice {
    capabilities: DeviceCapabilities,
    anisotropy: Option<f32>,
    device: ash::Device,
    allocator: ManuallyDrop<vk_mem::Allocator>,
    graphics_queue: vk::Queue,
    present_queue: vk::Queue,
    graphics_family: u32,
    present_family: u32,
    graphics_pool: vk::CommandPool,
    present_pool: vk::CommandPool,
    swapchain_loader: Swapchain,
    ray_tracing: Option<RayTracingLoaders>,
    set_layouts: Mutex<HashMap<vk::PipelineLayout, vk::DescriptorSetLayout>>,
    render_passes: Mutex<HashMap<vk::RenderPass, PassLayout>>,
    surface: vk::SurfaceKHR,
    surface_loader: Surface,
    physical_device: vk::PhysicalDevice,
    instance: InstanceContext,
}

struct Opened {
    adapter: Adapter,
    capabilities: DeviceCapabilities,
    anisotropy: Option<f32>,
    device: ash::Device,
    allocator: vk_mem::Allocator,
    graphics_pool: vk::CommandPool,
    present_pool: vk::CommandPool,
}

impl VulkanDevice {
    /// Create the instance, surface and device for `window`
    pub fn new(config: &GfxConfig, window: &dyn VulkanSurfaceSource) -> GfxResult<Self> {
        let mut instance = InstanceContext::new(&config.application_name, window, config.validation_enabled())?;
        let surface_loader = Surface::new(&instance.entry, &instance.instance);
        let surface = match window.create_surface(&instance.entry, &instance.instance) {
            Ok(surface) => surface,
            Err(e) => {
                instance.destroy();
                return Err(e);
            }
        };

        let opened = match Self::open(&instance, &surface_loader, surface, config.ray_tracing) {
            Ok(opened) => opened,
            Err(e) => {
                // SAFETY: nothing was created on the surface yet
                unsafe { surface_loader.destroy_surface(surface, None) };
                instance.destroy();
                return Err(e);
            }
        };

        let Opened { adapter, capabilities, anisotropy, device, allocator, graphics_pool, present_pool } = opened;
        // SAFETY: both families were requested with one queue at device creation
        let (graphics_queue, present_queue) = unsafe {
            (device.get_device_queue(adapter.graphics_family, 0), device.get_device_queue(adapter.present_family, 0))
        };
        let ray_tracing = capabilities.ray_tracing.map(|_| RayTracingLoaders {
            accel: AccelerationStructure::new(&instance.instance, &device),
            pipeline: RayTracingPipeline::new(&instance.instance, &device),
        });

        Ok(Self {
            swapchain_loader: Swapchain::new(&instance.instance, &device),
            capabilities,
            anisotropy,
            allocator: ManuallyDrop::new(allocator),
            graphics_queue,
            present_queue,
            graphics_family: adapter.graphics_family,
            present_family: adapter.present_family,
            graphics_pool,
            present_pool,
            ray_tracing,
            set_layouts: Mutex::new(HashMap::new()),
            render_passes: Mutex::new(HashMap::new()),
            surface,
            surface_loader,
            physical_device: adapter.physical_device,
            device,
            instance,
        })
    }

    fn open(
        instance: &InstanceContext,
        surface_loader: &Surface,
        surface: vk::SurfaceKHR,
        want_ray_tracing: bool,
    ) -> GfxResult<Opened> {
        let adapter = Adapter::select(&instance.instance, surface_loader, surface, want_ray_tracing)?;
        if want_ray_tracing && !adapter.ray_tracing {
            log::warn!("Ray tracing requested but {} does not support it", adapter.name);
        }

        let priorities = [1.0_f32];
        let mut families = vec![adapter.graphics_family];
        if adapter.present_family != adapter.graphics_family {
            families.push(adapter.present_family);
        }
        let queue_infos: Vec<vk::DeviceQueueCreateInfo> = families
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::builder().queue_family_index(family).queue_priorities(&priorities).build()
            })
            .collect();

        let mut extensions = vec![Swapchain::name().as_ptr()];
        if adapter.ray_tracing {
            extensions.extend(ray_tracing_extensions().iter().map(|name| name.as_ptr()));
        }

        let features = vk::PhysicalDeviceFeatures::builder().sampler_anisotropy(adapter.anisotropy);
        let mut vulkan12 = vk::PhysicalDeviceVulkan12Features::builder().buffer_device_address(true);
        let mut accel_features =
            vk::PhysicalDeviceAccelerationStructureFeaturesKHR::builder().acceleration_structure(true);
        let mut rt_features = vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::builder().ray_tracing_pipeline(true);
        let mut create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&features);
        if adapter.ray_tracing {
            create_info = create_info.push_next(&mut vulkan12).push_next(&mut accel_features).push_next(&mut rt_features);
        }

        // SAFETY: every pointer in create_info outlives the call
        let device = unsafe { instance.instance.create_device(adapter.physical_device, &create_info, None) }?;

        let capabilities = DeviceCapabilities {
            name: adapter.name.clone(),
            separate_present_queue: adapter.present_family != adapter.graphics_family,
            ray_tracing: adapter.ray_tracing.then(|| Self::ray_tracing_properties(instance, adapter.physical_device)),
        };
        // SAFETY: the physical device belongs to the live instance
        let limits = unsafe { instance.instance.get_physical_device_properties(adapter.physical_device) }.limits;
        let anisotropy = adapter.anisotropy.then_some(limits.max_sampler_anisotropy);

        let pools = Self::create_pool(&device, adapter.graphics_family).and_then(|graphics| {
            match Self::create_pool(&device, adapter.present_family) {
                Ok(present) => Ok((graphics, present)),
                Err(e) => {
                    // SAFETY: the pool has no command buffers yet
                    unsafe { device.destroy_command_pool(graphics, None) };
                    Err(e)
                }
            }
        });
        let (graphics_pool, present_pool) = match pools {
            Ok(pools) => pools,
            Err(e) => {
                // SAFETY: no other child objects exist yet
                unsafe { device.destroy_device(None) };
                return Err(e);
            }
        };

        let mut flags = vk_mem::AllocatorCreateFlags::empty();
        if adapter.ray_tracing {
            flags |= vk_mem::AllocatorCreateFlags::BUFFER_DEVICE_ADDRESS;
        }
        let allocator_info = vk_mem::AllocatorCreateInfo::new(&instance.instance, &device, adapter.physical_device)
            .vulkan_api_version(vk::API_VERSION_1_2)
            .flags(flags);
        let allocator = match vk_mem::Allocator::new(allocator_info) {
            Ok(allocator) => allocator,
            Err(e) => {
                // SAFETY: the pools and the device have no other users
                unsafe {
                    device.destroy_command_pool(graphics_pool, None);
                    device.destroy_command_pool(present_pool, None);
                    device.destroy_device(None);
                }
                return Err(e.into());
            }
        };

        Ok(Opened { adapter, capabilities, anisotropy, device, allocator, graphics_pool, present_pool })
    }

    fn create_pool(device: &ash::Device, family: u32) -> GfxResult<vk::CommandPool> {
        let info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        // SAFETY: the device is live
        Ok(unsafe { device.create_command_pool(&info, None) }?)
    }

    fn ray_tracing_properties(instance: &InstanceContext, physical_device: vk::PhysicalDevice) -> RayTracingProperties {
        let mut pipeline = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
        let mut accel = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
        {
            let mut properties = vk::PhysicalDeviceProperties2::builder().push_next(&mut pipeline).push_next(&mut accel);
            // SAFETY: the chained structs live until the end of this block
            unsafe { instance.instance.get_physical_device_properties2(physical_device, &mut properties) };
        }
        RayTracingProperties {
            shader_group_handle_size: pipeline.shader_group_handle_size,
            shader_group_handle_alignment: pipeline.shader_group_handle_alignment,
            shader_group_base_alignment: pipeline.shader_group_base_alignment,
            scratch_offset_alignment: accel.min_acceleration_structure_scratch_offset_alignment,
            max_recursion_depth: pipeline.max_ray_recursion_depth,
        }
    }

    fn queue(&self, kind: QueueKind) -> (vk::Queue, vk::CommandPool) {
        match kind {
            QueueKind::Graphics => (self.graphics_queue, self.graphics_pool),
            QueueKind::Present => (self.present_queue, self.present_pool),
        }
    }

    fn rt(&self) -> GfxResult<&RayTracingLoaders> {
        self.ray_tracing.as_ref().ok_or(GfxError::FeatureNotSupported)
    }

    fn subresource_range(aspect: ImageAspect) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: convert::aspect(aspect),
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        }
    }

    fn geometry(geometry: &AccelerationGeometry) -> vk::AccelerationStructureGeometryKHR {
        match *geometry {
            AccelerationGeometry::Triangles {
                vertex_address,
                vertex_stride,
                vertex_count,
                vertex_format,
                index_address,
                opaque,
                ..
            } => {
                let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::builder()
                    .vertex_format(convert::vertex_format(vertex_format))
                    .vertex_data(vk::DeviceOrHostAddressConstKHR { device_address: vertex_address })
                    .vertex_stride(vertex_stride)
                    .max_vertex(vertex_count.saturating_sub(1))
                    .index_type(if index_address.is_some() { vk::IndexType::UINT32 } else { vk::IndexType::NONE_KHR })
                    .index_data(vk::DeviceOrHostAddressConstKHR { device_address: index_address.unwrap_or(0) })
                    .build();
                vk::AccelerationStructureGeometryKHR::builder()
                    .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
                    .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
                    .flags(if opaque { vk::GeometryFlagsKHR::OPAQUE } else { vk::GeometryFlagsKHR::empty() })
                    .build()
            }
            AccelerationGeometry::Instances { address, .. } => {
                let instances = vk::AccelerationStructureGeometryInstancesDataKHR::builder()
                    .array_of_pointers(false)
                    .data(vk::DeviceOrHostAddressConstKHR { device_address: address })
                    .build();
                vk::AccelerationStructureGeometryKHR::builder()
                    .geometry_type(vk::GeometryTypeKHR::INSTANCES)
                    .geometry(vk::AccelerationStructureGeometryDataKHR { instances })
                    .build()
            }
        }
    }

    fn accel_type(kind: AccelerationKind) -> vk::AccelerationStructureTypeKHR {
        match kind {
            AccelerationKind::BottomLevel => vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            AccelerationKind::TopLevel => vk::AccelerationStructureTypeKHR::TOP_LEVEL,
        }
    }

    fn region(region: &StridedRegion) -> vk::StridedDeviceAddressRegionKHR {
        vk::StridedDeviceAddressRegionKHR { device_address: region.address, stride: region.stride, size: region.size }
    }

    fn first<T>(items: Vec<T>) -> GfxResult<T> {
        items.into_iter().next().ok_or(GfxError::Unknown("driver returned no object".to_string()))
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        // SAFETY: every object created through this device was destroyed by its
        // owner; what remains is owned here and destroyed child-first
        unsafe {
            let _ = self.device.device_wait_idle();
            for (_, layout) in self.set_layouts.get_mut().drain() {
                self.device.destroy_descriptor_set_layout(layout, None);
            }
            self.device.destroy_command_pool(self.graphics_pool, None);
            self.device.destroy_command_pool(self.present_pool, None);
            ManuallyDrop::drop(&mut self.allocator);
            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);
        }
        self.instance.destroy();
        log::info!("Vulkan device destroyed");
    }
}

// SAFETY (whole impl): handles passed in were created by this device and are
// externally synchronized by the single-threaded explicit backend.
impl Device for VulkanDevice {
    type Buffer = vk::Buffer;
    type Image = vk::Image;
    type ImageView = vk::ImageView;
    type Sampler = vk::Sampler;
    type Allocation = VulkanAllocation;
    type Fence = vk::Fence;
    type Semaphore = vk::Semaphore;
    type CommandBuffer = vk::CommandBuffer;
    type RenderPass = vk::RenderPass;
    type Framebuffer = vk::Framebuffer;
    type ShaderModule = vk::ShaderModule;
    type PipelineLayout = vk::PipelineLayout;
    type PipelineCache = vk::PipelineCache;
    type Pipeline = vk::Pipeline;
    type DescriptorPool = vk::DescriptorPool;
    type DescriptorSet = vk::DescriptorSet;
    type Swapchain = vk::SwapchainKHR;
    type AccelerationStructure = vk::AccelerationStructureKHR;

    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    // --- memory -------------------------------------------------------------

    fn create_buffer(&self, desc: &BufferDesc) -> GfxResult<(vk::Buffer, VulkanAllocation)> {
        let info = vk::BufferCreateInfo::builder()
            .size(desc.size.max(1))
            .usage(convert::buffer_usage(desc.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let host_visible = desc.location == MemoryLocation::HostVisible;
        let alloc_info = vk_mem::AllocationCreateInfo {
            usage: if host_visible { vk_mem::MemoryUsage::AutoPreferHost } else { vk_mem::MemoryUsage::AutoPreferDevice },
            flags: if host_visible {
                vk_mem::AllocationCreateFlags::HOST_ACCESS_SEQUENTIAL_WRITE
            } else {
                vk_mem::AllocationCreateFlags::empty()
            },
            ..Default::default()
        };
        let (buffer, allocation) = unsafe { self.allocator.create_buffer(&info, &alloc_info) }?;
        log::trace!("Created buffer '{}' ({} bytes)", desc.label, desc.size);
        Ok((buffer, VulkanAllocation { allocation, host_visible }))
    }

    fn destroy_buffer(&self, buffer: vk::Buffer, mut allocation: VulkanAllocation) {
        unsafe { self.allocator.destroy_buffer(buffer, &mut allocation.allocation) };
    }

    fn create_image(&self, desc: &ImageDesc) -> GfxResult<(vk::Image, VulkanAllocation)> {
        let info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(convert::format(desc.format))
            .extent(vk::Extent3D { width: desc.extent.width, height: desc.extent.height, depth: 1 })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(convert::image_usage(desc.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let alloc_info =
            vk_mem::AllocationCreateInfo { usage: vk_mem::MemoryUsage::AutoPreferDevice, ..Default::default() };
        let (image, allocation) = unsafe { self.allocator.create_image(&info, &alloc_info) }?;
        log::trace!("Created image '{}' ({}x{})", desc.label, desc.extent.width, desc.extent.height);
        Ok((image, VulkanAllocation { allocation, host_visible: false }))
    }

    fn destroy_image(&self, image: vk::Image, mut allocation: VulkanAllocation) {
        unsafe { self.allocator.destroy_image(image, &mut allocation.allocation) };
    }

    fn is_host_visible(&self, allocation: &VulkanAllocation) -> bool {
        allocation.host_visible
    }

    fn write_mapped(&self, allocation: &mut VulkanAllocation, offset: u64, data: &[u8]) -> GfxResult<()> {
        if !allocation.host_visible {
            return Err(GfxError::FailedToMapMemory);
        }
        unsafe {
            let mapped = self.allocator.map_memory(&mut allocation.allocation)?;
            std::ptr::copy_nonoverlapping(data.as_ptr(), mapped.add(offset as usize), data.len());
            let flushed = self.allocator.flush_allocation(&allocation.allocation, offset as _, data.len() as _);
            self.allocator.unmap_memory(&mut allocation.allocation);
            flushed?;
        }
        Ok(())
    }

    fn buffer_address(&self, buffer: vk::Buffer) -> u64 {
        if self.ray_tracing.is_none() {
            return 0;
        }
        let info = vk::BufferDeviceAddressInfo::builder().buffer(buffer);
        unsafe { self.device.get_buffer_device_address(&info) }
    }

    fn create_image_view(&self, image: vk::Image, format: Format) -> GfxResult<vk::ImageView> {
        let info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(convert::format(format))
            .subresource_range(Self::subresource_range(ImageAspect::of(format)));
        Ok(unsafe { self.device.create_image_view(&info, None) }?)
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        unsafe { self.device.destroy_image_view(view, None) };
    }

    fn create_sampler(&self, info: &SamplerInfo) -> GfxResult<vk::Sampler> {
        let address = convert::address_mode(info.address_mode);
        let anisotropy = info.max_anisotropy.zip(self.anisotropy).map(|(wanted, max)| wanted.min(max));
        let create_info = vk::SamplerCreateInfo::builder()
            .mag_filter(convert::filter(info.mag_filter))
            .min_filter(convert::filter(info.min_filter))
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .address_mode_u(address)
            .address_mode_v(address)
            .address_mode_w(address)
            .anisotropy_enable(anisotropy.is_some())
            .max_anisotropy(anisotropy.unwrap_or(1.0))
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
            .max_lod(vk::LOD_CLAMP_NONE);
        Ok(unsafe { self.device.create_sampler(&create_info, None) }?)
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        unsafe { self.device.destroy_sampler(sampler, None) };
    }

    // --- synchronization ----------------------------------------------------

    fn create_fence(&self, signaled: bool) -> GfxResult<vk::Fence> {
        let flags = if signaled { vk::FenceCreateFlags::SIGNALED } else { vk::FenceCreateFlags::empty() };
        let info = vk::FenceCreateInfo::builder().flags(flags);
        Ok(unsafe { self.device.create_fence(&info, None) }?)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) };
    }

    fn wait_for_fence(&self, fence: vk::Fence) -> GfxResult<()> {
        Ok(unsafe { self.device.wait_for_fences(&[fence], true, u64::MAX) }?)
    }

    fn reset_fence(&self, fence: vk::Fence) -> GfxResult<()> {
        Ok(unsafe { self.device.reset_fences(&[fence]) }?)
    }

    fn create_semaphore(&self) -> GfxResult<vk::Semaphore> {
        let info = vk::SemaphoreCreateInfo::builder();
        Ok(unsafe { self.device.create_semaphore(&info, None) }?)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) };
    }

    fn wait_idle(&self) -> GfxResult<()> {
        Ok(unsafe { self.device.device_wait_idle() }?)
    }

    // --- commands -----------------------------------------------------------

    fn allocate_command_buffer(&self, queue: QueueKind) -> GfxResult<vk::CommandBuffer> {
        let (_, pool) = self.queue(queue);
        let info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        Self::first(unsafe { self.device.allocate_command_buffers(&info) }?)
    }

    fn free_command_buffer(&self, queue: QueueKind, command_buffer: vk::CommandBuffer) {
        let (_, pool) = self.queue(queue);
        unsafe { self.device.free_command_buffers(pool, &[command_buffer]) };
    }

    fn begin_commands(&self, command_buffer: vk::CommandBuffer, one_time: bool) -> GfxResult<()> {
        let flags =
            if one_time { vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT } else { vk::CommandBufferUsageFlags::empty() };
        let info = vk::CommandBufferBeginInfo::builder().flags(flags);
        unsafe {
            self.device.reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())?;
            self.device.begin_command_buffer(command_buffer, &info)?;
        }
        Ok(())
    }

    fn end_commands(&self, command_buffer: vk::CommandBuffer) -> GfxResult<()> {
        Ok(unsafe { self.device.end_command_buffer(command_buffer) }?)
    }

    fn submit(&self, queue: QueueKind, submit: &Submit<'_, Self>) -> GfxResult<()> {
        let (wait_semaphores, wait_stages): (Vec<_>, Vec<_>) =
            submit.wait.iter().map(|(semaphore, stage)| (*semaphore, convert::wait_stage(*stage))).unzip();
        let command_buffers = [submit.command_buffer];
        let info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(submit.signal);
        let (queue, _) = self.queue(queue);
        Ok(unsafe { self.device.queue_submit(queue, &[info.build()], submit.fence.unwrap_or_default()) }?)
    }

    fn cmd_image_barrier(&self, cb: vk::CommandBuffer, image: vk::Image, aspect: ImageAspect, from: ImageState, to: ImageState) {
        let (old_layout, src_access, src_stage) = convert::image_state(from);
        let (new_layout, dst_access, dst_stage) = convert::image_state(to);
        let barrier = vk::ImageMemoryBarrier::builder()
            .old_layout(old_layout)
            .new_layout(new_layout)
            .src_access_mask(src_access)
            .dst_access_mask(dst_access)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(Self::subresource_range(aspect))
            .build();
        unsafe {
            self.device.cmd_pipeline_barrier(cb, src_stage, dst_stage, vk::DependencyFlags::empty(), &[], &[], &[barrier]);
        }
    }

    fn cmd_buffer_barrier(&self, cb: vk::CommandBuffer, buffer: vk::Buffer, from: BufferAccess, to: BufferAccess) {
        let (src_access, src_stage) = convert::buffer_access(from);
        let (dst_access, dst_stage) = convert::buffer_access(to);
        let barrier = vk::BufferMemoryBarrier::builder()
            .src_access_mask(src_access)
            .dst_access_mask(dst_access)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .buffer(buffer)
            .offset(0)
            .size(vk::WHOLE_SIZE)
            .build();
        unsafe {
            self.device.cmd_pipeline_barrier(cb, src_stage, dst_stage, vk::DependencyFlags::empty(), &[], &[barrier], &[]);
        }
    }

    fn cmd_memory_barrier(&self, cb: vk::CommandBuffer, from: BufferAccess, to: BufferAccess) {
        let (src_access, src_stage) = convert::buffer_access(from);
        let (dst_access, dst_stage) = convert::buffer_access(to);
        let barrier = vk::MemoryBarrier::builder().src_access_mask(src_access).dst_access_mask(dst_access).build();
        unsafe {
            self.device.cmd_pipeline_barrier(cb, src_stage, dst_stage, vk::DependencyFlags::empty(), &[barrier], &[], &[]);
        }
    }

    fn cmd_copy_buffer(&self, cb: vk::CommandBuffer, src: vk::Buffer, dst: vk::Buffer, region: BufferCopy) {
        let region = vk::BufferCopy { src_offset: region.src_offset, dst_offset: region.dst_offset, size: region.size };
        unsafe { self.device.cmd_copy_buffer(cb, src, dst, &[region]) };
    }

    fn cmd_copy_buffer_to_image(&self, cb: vk::CommandBuffer, src: vk::Buffer, dst: vk::Image, aspect: ImageAspect, extent: Extent3D) {
        let region = vk::BufferImageCopy::builder()
            .buffer_offset(0)
            .buffer_row_length(0)
            .buffer_image_height(0)
            .image_subresource(vk::ImageSubresourceLayers {
                aspect_mask: convert::aspect(aspect),
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            })
            .image_offset(vk::Offset3D::default())
            .image_extent(vk::Extent3D { width: extent.width, height: extent.height, depth: extent.depth })
            .build();
        unsafe {
            self.device.cmd_copy_buffer_to_image(cb, src, dst, vk::ImageLayout::TRANSFER_DST_OPTIMAL, &[region]);
        }
    }

    fn cmd_queue_ownership(&self, cb: vk::CommandBuffer, image: vk::Image, transfer: OwnershipTransfer) {
        if self.graphics_family == self.present_family {
            return;
        }
        let (src_access, src_stage, dst_stage) = match transfer {
            OwnershipTransfer::Release => (
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            ),
            OwnershipTransfer::Acquire => {
                (vk::AccessFlags::empty(), vk::PipelineStageFlags::ALL_COMMANDS, vk::PipelineStageFlags::ALL_COMMANDS)
            }
        };
        let barrier = vk::ImageMemoryBarrier::builder()
            .old_layout(vk::ImageLayout::PRESENT_SRC_KHR)
            .new_layout(vk::ImageLayout::PRESENT_SRC_KHR)
            .src_access_mask(src_access)
            .dst_access_mask(vk::AccessFlags::empty())
            .src_queue_family_index(self.graphics_family)
            .dst_queue_family_index(self.present_family)
            .image(image)
            .subresource_range(Self::subresource_range(ImageAspect::Color))
            .build();
        unsafe {
            self.device.cmd_pipeline_barrier(cb, src_stage, dst_stage, vk::DependencyFlags::empty(), &[], &[], &[barrier]);
        }
    }

    fn cmd_begin_render_pass(&self, cb: vk::CommandBuffer, pass: vk::RenderPass, framebuffer: vk::Framebuffer, extent: Extent2D, clear: &ClearValues) {
        let layout = self.render_passes.lock().get(&pass).copied().unwrap_or(PassLayout { colors: 1, depth: false });
        let mut clear_values = vec![vk::ClearValue { color: vk::ClearColorValue { float32: clear.color } }; layout.colors];
        if layout.depth {
            clear_values.push(vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue { depth: clear.depth, stencil: 0 },
            });
        }
        let info = vk::RenderPassBeginInfo::builder()
            .render_pass(pass)
            .framebuffer(framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent: vk::Extent2D { width: extent.width, height: extent.height },
            })
            .clear_values(&clear_values);
        unsafe { self.device.cmd_begin_render_pass(cb, &info, vk::SubpassContents::INLINE) };
    }

    fn cmd_end_render_pass(&self, cb: vk::CommandBuffer) {
        unsafe { self.device.cmd_end_render_pass(cb) };
    }

    fn cmd_bind_pipeline(&self, cb: vk::CommandBuffer, kind: PipelineKind, pipeline: vk::Pipeline) {
        unsafe { self.device.cmd_bind_pipeline(cb, convert::bind_point(kind), pipeline) };
    }

    fn cmd_bind_descriptor_set(&self, cb: vk::CommandBuffer, kind: PipelineKind, layout: vk::PipelineLayout, set: vk::DescriptorSet) {
        unsafe { self.device.cmd_bind_descriptor_sets(cb, convert::bind_point(kind), layout, 0, &[set], &[]) };
    }

    fn cmd_push_constants(&self, cb: vk::CommandBuffer, layout: vk::PipelineLayout, data: &[u8]) {
        unsafe { self.device.cmd_push_constants(cb, layout, vk::ShaderStageFlags::ALL, 0, data) };
    }

    fn cmd_set_viewport(&self, cb: vk::CommandBuffer, viewport: &Viewport, scissor: &Rect2D) {
        let viewport = vk::Viewport {
            x: viewport.x,
            y: viewport.y,
            width: viewport.width,
            height: viewport.height,
            min_depth: viewport.min_depth,
            max_depth: viewport.max_depth,
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x: scissor.x, y: scissor.y },
            extent: vk::Extent2D { width: scissor.width, height: scissor.height },
        };
        unsafe {
            self.device.cmd_set_viewport(cb, 0, &[viewport]);
            self.device.cmd_set_scissor(cb, 0, &[scissor]);
        }
    }

    fn cmd_bind_vertex_buffer(&self, cb: vk::CommandBuffer, buffer: vk::Buffer) {
        unsafe { self.device.cmd_bind_vertex_buffers(cb, 0, &[buffer], &[0]) };
    }

    fn cmd_bind_index_buffer(&self, cb: vk::CommandBuffer, buffer: vk::Buffer, index_type: IndexType) {
        unsafe { self.device.cmd_bind_index_buffer(cb, buffer, 0, convert::index_type(index_type)) };
    }

    fn cmd_draw(&self, cb: vk::CommandBuffer, vertex_count: u32, instance_count: u32) {
        unsafe { self.device.cmd_draw(cb, vertex_count, instance_count, 0, 0) };
    }

    fn cmd_draw_indexed(&self, cb: vk::CommandBuffer, index_count: u32, instance_count: u32) {
        unsafe { self.device.cmd_draw_indexed(cb, index_count, instance_count, 0, 0, 0) };
    }

    fn cmd_dispatch(&self, cb: vk::CommandBuffer, x: u32, y: u32, z: u32) {
        unsafe { self.device.cmd_dispatch(cb, x, y, z) };
    }

    fn cmd_build_acceleration_structure(&self, cb: vk::CommandBuffer, build: &AccelerationBuild<'_, Self>) {
        let Ok(rt) = self.rt() else {
            log::error!("Acceleration structure build recorded without ray tracing support");
            return;
        };
        let geometries = [Self::geometry(build.geometry)];
        let info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
            .ty(Self::accel_type(build.geometry.kind()))
            .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(&geometries)
            .dst_acceleration_structure(build.dst)
            .scratch_data(vk::DeviceOrHostAddressKHR { device_address: build.scratch_address })
            .build();
        let range = vk::AccelerationStructureBuildRangeInfoKHR::builder()
            .primitive_count(build.geometry.primitive_count())
            .build();
        unsafe { rt.accel.cmd_build_acceleration_structures(cb, &[info], &[&[range]]) };
    }

    fn cmd_trace_rays(&self, cb: vk::CommandBuffer, regions: &SbtRegions, width: u32, height: u32, depth: u32) {
        let Ok(rt) = self.rt() else {
            log::error!("Trace recorded without ray tracing support");
            return;
        };
        let callable = vk::StridedDeviceAddressRegionKHR::default();
        unsafe {
            rt.pipeline.cmd_trace_rays(
                cb,
                &Self::region(&regions.raygen),
                &Self::region(&regions.miss),
                &Self::region(&regions.hit),
                &callable,
                width,
                height,
                depth,
            );
        }
    }

    // --- presentation -------------------------------------------------------

    fn surface_support(&self) -> GfxResult<SurfaceSupport> {
        let (caps, formats, modes) = unsafe {
            (
                self.surface_loader.get_physical_device_surface_capabilities(self.physical_device, self.surface)?,
                self.surface_loader.get_physical_device_surface_formats(self.physical_device, self.surface)?,
                self.surface_loader.get_physical_device_surface_present_modes(self.physical_device, self.surface)?,
            )
        };
        let to_extent = |e: vk::Extent2D| Extent2D::new(e.width, e.height);
        Ok(SurfaceSupport {
            formats: formats
                .iter()
                .filter(|f| f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR)
                .filter_map(|f| convert::surface_format(f.format))
                .collect(),
            present_modes: modes.into_iter().filter_map(convert::surface_present_mode).collect(),
            min_image_count: caps.min_image_count,
            max_image_count: caps.max_image_count,
            current_extent: (caps.current_extent.width != u32::MAX).then(|| to_extent(caps.current_extent)),
            min_extent: to_extent(caps.min_image_extent),
            max_extent: to_extent(caps.max_image_extent),
            supports_identity: caps.supported_transforms.contains(vk::SurfaceTransformFlagsKHR::IDENTITY),
            current_transform: SurfaceTransform(caps.current_transform.as_raw()),
            composite_alpha: convert::supported_composite_alpha(caps.supported_composite_alpha),
        })
    }

    fn create_swapchain(&self, config: &SurfaceConfig, old: Option<vk::SwapchainKHR>) -> GfxResult<vk::SwapchainKHR> {
        let info = vk::SwapchainCreateInfoKHR::builder()
            .surface(self.surface)
            .min_image_count(config.image_count)
            .image_format(convert::format(config.format))
            .image_color_space(vk::ColorSpaceKHR::SRGB_NONLINEAR)
            .image_extent(vk::Extent2D { width: config.extent.width, height: config.extent.height })
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(vk::SurfaceTransformFlagsKHR::from_raw(config.transform.0))
            .composite_alpha(convert::composite_alpha(config.composite_alpha))
            .present_mode(convert::present_mode(config.present_mode))
            .clipped(true)
            .old_swapchain(old.unwrap_or_default());
        Ok(unsafe { self.swapchain_loader.create_swapchain(&info, None) }?)
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        unsafe { self.swapchain_loader.destroy_swapchain(swapchain, None) };
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> GfxResult<Vec<vk::Image>> {
        Ok(unsafe { self.swapchain_loader.get_swapchain_images(swapchain) }?)
    }

    fn acquire_next_image(&self, swapchain: vk::SwapchainKHR, signal: vk::Semaphore) -> GfxResult<AcquireOutcome> {
        match unsafe { self.swapchain_loader.acquire_next_image(swapchain, u64::MAX, signal, vk::Fence::null()) } {
            Ok((index, suboptimal)) => Ok(AcquireOutcome::Acquired { index, suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(e) => Err(e.into()),
        }
    }

    fn present(&self, swapchain: vk::SwapchainKHR, image_index: u32, wait: vk::Semaphore) -> GfxResult<PresentOutcome> {
        let waits = [wait];
        let swapchains = [swapchain];
        let indices = [image_index];
        let info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&waits)
            .swapchains(&swapchains)
            .image_indices(&indices);
        match unsafe { self.swapchain_loader.queue_present(self.present_queue, &info) } {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) => Ok(PresentOutcome::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
            Err(e) => Err(e.into()),
        }
    }

    // --- passes and pipelines -----------------------------------------------

    fn create_render_pass(&self, desc: &RenderPassDesc) -> GfxResult<vk::RenderPass> {
        let mut attachments: Vec<vk::AttachmentDescription> = desc
            .colors
            .iter()
            .map(|color| {
                vk::AttachmentDescription::builder()
                    .format(convert::format(color.format))
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .load_op(vk::AttachmentLoadOp::CLEAR)
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .initial_layout(vk::ImageLayout::UNDEFINED)
                    .final_layout(convert::image_state(color.final_state).0)
                    .build()
            })
            .collect();
        let color_refs: Vec<vk::AttachmentReference> = (0..desc.colors.len() as u32)
            .map(|attachment| vk::AttachmentReference { attachment, layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL })
            .collect();
        let depth_ref = vk::AttachmentReference {
            attachment: desc.colors.len() as u32,
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        };
        if let Some(depth) = desc.depth {
            attachments.push(
                vk::AttachmentDescription::builder()
                    .format(convert::format(depth))
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .load_op(vk::AttachmentLoadOp::CLEAR)
                    .store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .initial_layout(vk::ImageLayout::UNDEFINED)
                    .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                    .build(),
            );
        }

        let mut subpass = vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs);
        if desc.depth.is_some() {
            subpass = subpass.depth_stencil_attachment(&depth_ref);
        }
        let subpasses = [subpass.build()];

        let attachment_stages =
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS;
        let dependencies = [
            vk::SubpassDependency {
                src_subpass: vk::SUBPASS_EXTERNAL,
                dst_subpass: 0,
                src_stage_mask: attachment_stages,
                dst_stage_mask: attachment_stages,
                src_access_mask: vk::AccessFlags::empty(),
                dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
                dependency_flags: vk::DependencyFlags::empty(),
            },
            // Offscreen targets are sampled by later passes
            vk::SubpassDependency {
                src_subpass: 0,
                dst_subpass: vk::SUBPASS_EXTERNAL,
                src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                dst_stage_mask: vk::PipelineStageFlags::FRAGMENT_SHADER | vk::PipelineStageFlags::COMPUTE_SHADER,
                src_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                dst_access_mask: vk::AccessFlags::SHADER_READ,
                dependency_flags: vk::DependencyFlags::empty(),
            },
        ];

        let info = vk::RenderPassCreateInfo::builder()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);
        let pass = unsafe { self.device.create_render_pass(&info, None) }?;
        self.render_passes.lock().insert(pass, PassLayout { colors: desc.colors.len(), depth: desc.depth.is_some() });
        Ok(pass)
    }

    fn destroy_render_pass(&self, pass: vk::RenderPass) {
        self.render_passes.lock().remove(&pass);
        unsafe { self.device.destroy_render_pass(pass, None) };
    }

    fn create_framebuffer(&self, pass: vk::RenderPass, attachments: &[vk::ImageView], extent: Extent2D) -> GfxResult<vk::Framebuffer> {
        let info = vk::FramebufferCreateInfo::builder()
            .render_pass(pass)
            .attachments(attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(1);
        Ok(unsafe { self.device.create_framebuffer(&info, None) }?)
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        unsafe { self.device.destroy_framebuffer(framebuffer, None) };
    }

    fn create_shader_module(&self, spirv: &[u32]) -> GfxResult<vk::ShaderModule> {
        let info = vk::ShaderModuleCreateInfo::builder().code(spirv);
        unsafe { self.device.create_shader_module(&info, None) }.map_err(|e| match e {
            vk::Result::ERROR_INVALID_SHADER_NV => GfxError::BadShaderCode,
            other => other.into(),
        })
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        unsafe { self.device.destroy_shader_module(module, None) };
    }

    fn create_pipeline_layout(&self, resources: &ResourceLayout) -> GfxResult<vk::PipelineLayout> {
        let bindings: Vec<vk::DescriptorSetLayoutBinding> = resources
            .bindings
            .iter()
            .map(|b| {
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(b.binding)
                    .descriptor_type(convert::descriptor_type(b.ty))
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::ALL)
                    .build()
            })
            .collect();
        let set_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
        let set_layout = unsafe { self.device.create_descriptor_set_layout(&set_info, None) }?;

        let ranges: Vec<vk::PushConstantRange> = (resources.push_constant_size > 0)
            .then(|| vk::PushConstantRange {
                stage_flags: vk::ShaderStageFlags::ALL,
                offset: 0,
                size: resources.push_constant_size,
            })
            .into_iter()
            .collect();
        let set_layouts = [set_layout];
        let info = vk::PipelineLayoutCreateInfo::builder().set_layouts(&set_layouts).push_constant_ranges(&ranges);
        match unsafe { self.device.create_pipeline_layout(&info, None) } {
            Ok(layout) => {
                self.set_layouts.lock().insert(layout, set_layout);
                Ok(layout)
            }
            Err(e) => {
                unsafe { self.device.destroy_descriptor_set_layout(set_layout, None) };
                Err(e.into())
            }
        }
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        let set_layout = self.set_layouts.lock().remove(&layout);
        unsafe {
            self.device.destroy_pipeline_layout(layout, None);
            if let Some(set_layout) = set_layout {
                self.device.destroy_descriptor_set_layout(set_layout, None);
            }
        }
    }

    fn create_pipeline_cache(&self) -> GfxResult<vk::PipelineCache> {
        let info = vk::PipelineCacheCreateInfo::builder();
        Ok(unsafe { self.device.create_pipeline_cache(&info, None) }?)
    }

    fn destroy_pipeline_cache(&self, cache: vk::PipelineCache) {
        unsafe { self.device.destroy_pipeline_cache(cache, None) };
    }

    fn create_graphics_pipeline(&self, desc: &GraphicsPipelineDesc<'_, Self>) -> GfxResult<vk::Pipeline> {
        let stages = [
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(desc.vertex)
                .name(ENTRY_POINT)
                .build(),
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(desc.fragment)
                .name(ENTRY_POINT)
                .build(),
        ];

        let layout = desc.vertex_layout;
        let (vertex_bindings, vertex_attributes) = if layout.has_input() {
            let binding = vk::VertexInputBindingDescription {
                binding: 0,
                stride: layout.stride,
                input_rate: vk::VertexInputRate::VERTEX,
            };
            let attributes: Vec<vk::VertexInputAttributeDescription> = layout
                .attributes
                .iter()
                .map(|a| vk::VertexInputAttributeDescription {
                    location: a.location,
                    binding: 0,
                    format: convert::vertex_format(a.format),
                    offset: a.offset,
                })
                .collect();
            (vec![binding], attributes)
        } else {
            (Vec::new(), Vec::new())
        };
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(&vertex_bindings)
            .vertex_attribute_descriptions(&vertex_attributes);

        let state = desc.state;
        let input_assembly =
            vk::PipelineInputAssemblyStateCreateInfo::builder().topology(convert::topology(state.topology));

        let viewports = [vk::Viewport {
            x: state.viewport.x,
            y: state.viewport.y,
            width: state.viewport.width,
            height: state.viewport.height,
            min_depth: state.viewport.min_depth,
            max_depth: state.viewport.max_depth,
        }];
        let scissors = [vk::Rect2D {
            offset: vk::Offset2D { x: state.scissor.x, y: state.scissor.y },
            extent: vk::Extent2D { width: state.scissor.width, height: state.scissor.height },
        }];
        let viewport_state = if state.dynamic_viewport {
            vk::PipelineViewportStateCreateInfo::builder().viewport_count(1).scissor_count(1)
        } else {
            vk::PipelineViewportStateCreateInfo::builder().viewports(&viewports).scissors(&scissors)
        };

        let rasterization = vk::PipelineRasterizationStateCreateInfo::builder()
            .polygon_mode(convert::polygon_mode(state.polygon_mode))
            .cull_mode(convert::cull_mode(state.cull_mode))
            .front_face(convert::front_face(state.front_face))
            .line_width(1.0);
        let multisample =
            vk::PipelineMultisampleStateCreateInfo::builder().rasterization_samples(vk::SampleCountFlags::TYPE_1);
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(state.depth_test)
            .depth_write_enable(state.depth_write)
            .depth_compare_op(vk::CompareOp::LESS_OR_EQUAL);
        let blend_attachments = vec![convert::blend_attachment(state.blend); desc.color_attachment_count as usize];
        let color_blend = vk::PipelineColorBlendStateCreateInfo::builder().attachments(&blend_attachments);
        let dynamic_states = if state.dynamic_viewport {
            vec![vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR]
        } else {
            Vec::new()
        };
        let dynamic = vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

        let info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic)
            .layout(desc.layout)
            .render_pass(desc.render_pass)
            .subpass(0)
            .build();
        let pipelines = unsafe { self.device.create_graphics_pipelines(desc.cache, &[info], None) }
            .map_err(|(_, e)| GfxError::from(e))?;
        Self::first(pipelines)
    }

    fn create_compute_pipeline(&self, desc: &ComputePipelineDesc<Self>) -> GfxResult<vk::Pipeline> {
        let stage = vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(desc.shader)
            .name(ENTRY_POINT)
            .build();
        let info = vk::ComputePipelineCreateInfo::builder().stage(stage).layout(desc.layout).build();
        let pipelines = unsafe { self.device.create_compute_pipelines(desc.cache, &[info], None) }
            .map_err(|(_, e)| GfxError::from(e))?;
        Self::first(pipelines)
    }

    fn create_ray_tracing_pipeline(&self, desc: &RayTracingPipelineDesc<'_, Self>) -> GfxResult<vk::Pipeline> {
        let rt = self.rt()?;
        let stage = |flags: vk::ShaderStageFlags, module: vk::ShaderModule| {
            vk::PipelineShaderStageCreateInfo::builder().stage(flags).module(module).name(ENTRY_POINT).build()
        };
        let general = |index: u32| {
            vk::RayTracingShaderGroupCreateInfoKHR::builder()
                .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
                .general_shader(index)
                .closest_hit_shader(vk::SHADER_UNUSED_KHR)
                .any_hit_shader(vk::SHADER_UNUSED_KHR)
                .intersection_shader(vk::SHADER_UNUSED_KHR)
                .build()
        };

        let mut stages = vec![stage(vk::ShaderStageFlags::RAYGEN_KHR, desc.raygen)];
        let mut groups = vec![general(0)];
        for module in desc.miss {
            groups.push(general(stages.len() as u32));
            stages.push(stage(vk::ShaderStageFlags::MISS_KHR, *module));
        }
        for module in desc.closest_hit {
            groups.push(
                vk::RayTracingShaderGroupCreateInfoKHR::builder()
                    .ty(vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP)
                    .general_shader(vk::SHADER_UNUSED_KHR)
                    .closest_hit_shader(stages.len() as u32)
                    .any_hit_shader(vk::SHADER_UNUSED_KHR)
                    .intersection_shader(vk::SHADER_UNUSED_KHR)
                    .build(),
            );
            stages.push(stage(vk::ShaderStageFlags::CLOSEST_HIT_KHR, *module));
        }

        let info = vk::RayTracingPipelineCreateInfoKHR::builder()
            .stages(&stages)
            .groups(&groups)
            .max_pipeline_ray_recursion_depth(desc.max_recursion_depth)
            .layout(desc.layout)
            .build();
        let pipelines = unsafe {
            rt.pipeline.create_ray_tracing_pipelines(vk::DeferredOperationKHR::null(), desc.cache, &[info], None)
        }?;
        Self::first(pipelines)
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        unsafe { self.device.destroy_pipeline(pipeline, None) };
    }

    fn shader_group_handles(&self, pipeline: vk::Pipeline, group_count: u32) -> GfxResult<Vec<u8>> {
        let rt = self.rt()?;
        let handle_size = self.capabilities.ray_tracing.map_or(0, |p| p.shader_group_handle_size);
        let size = (group_count * handle_size) as usize;
        Ok(unsafe { rt.pipeline.get_ray_tracing_shader_group_handles(pipeline, 0, group_count, size) }?)
    }

    fn create_descriptor_pool(&self, resources: &ResourceLayout, sets: u32) -> GfxResult<vk::DescriptorPool> {
        let mut sizes: Vec<vk::DescriptorPoolSize> = [
            BindingType::UniformBuffer,
            BindingType::StorageBuffer,
            BindingType::SampledImage,
            BindingType::StorageImage,
            BindingType::AccelerationStructure,
        ]
        .into_iter()
        .filter(|ty| resources.count(*ty) > 0)
        .map(|ty| vk::DescriptorPoolSize { ty: convert::descriptor_type(ty), descriptor_count: resources.count(ty) * sets })
        .collect();
        if sizes.is_empty() {
            sizes.push(vk::DescriptorPoolSize { ty: vk::DescriptorType::UNIFORM_BUFFER, descriptor_count: 1 });
        }
        let info = vk::DescriptorPoolCreateInfo::builder().max_sets(sets.max(1)).pool_sizes(&sizes);
        Ok(unsafe { self.device.create_descriptor_pool(&info, None) }?)
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        unsafe { self.device.destroy_descriptor_pool(pool, None) };
    }

    fn allocate_descriptor_set(&self, pool: vk::DescriptorPool, layout: vk::PipelineLayout) -> GfxResult<vk::DescriptorSet> {
        let set_layout = self
            .set_layouts
            .lock()
            .get(&layout)
            .copied()
            .ok_or(GfxError::InvalidUsage("pipeline layout has no descriptor set layout"))?;
        let set_layouts = [set_layout];
        let info = vk::DescriptorSetAllocateInfo::builder().descriptor_pool(pool).set_layouts(&set_layouts);
        Self::first(unsafe { self.device.allocate_descriptor_sets(&info) }?)
    }

    fn write_descriptor_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite<Self>]) {
        for write in writes {
            let base = vk::WriteDescriptorSet::builder().dst_set(set).dst_array_element(0);
            match write {
                DescriptorWrite::UniformBuffer { binding, buffer, range }
                | DescriptorWrite::StorageBuffer { binding, buffer, range } => {
                    let ty = if matches!(write, DescriptorWrite::UniformBuffer { .. }) {
                        vk::DescriptorType::UNIFORM_BUFFER
                    } else {
                        vk::DescriptorType::STORAGE_BUFFER
                    };
                    let info = [vk::DescriptorBufferInfo { buffer: *buffer, offset: 0, range: *range }];
                    let write = base.dst_binding(*binding).descriptor_type(ty).buffer_info(&info).build();
                    unsafe { self.device.update_descriptor_sets(&[write], &[]) };
                }
                DescriptorWrite::SampledImage { binding, view, sampler } => {
                    let info = [vk::DescriptorImageInfo {
                        sampler: *sampler,
                        image_view: *view,
                        image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    }];
                    let write = base
                        .dst_binding(*binding)
                        .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                        .image_info(&info)
                        .build();
                    unsafe { self.device.update_descriptor_sets(&[write], &[]) };
                }
                DescriptorWrite::StorageImage { binding, view } => {
                    let info = [vk::DescriptorImageInfo {
                        sampler: vk::Sampler::null(),
                        image_view: *view,
                        image_layout: vk::ImageLayout::GENERAL,
                    }];
                    let write = base
                        .dst_binding(*binding)
                        .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                        .image_info(&info)
                        .build();
                    unsafe { self.device.update_descriptor_sets(&[write], &[]) };
                }
                DescriptorWrite::AccelerationStructure { binding, accel } => {
                    let accels = [*accel];
                    let mut accel_info =
                        vk::WriteDescriptorSetAccelerationStructureKHR::builder().acceleration_structures(&accels);
                    let mut write = base
                        .dst_binding(*binding)
                        .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
                        .push_next(&mut accel_info)
                        .build();
                    // The count is not implied by any info array here
                    write.descriptor_count = 1;
                    unsafe { self.device.update_descriptor_sets(&[write], &[]) };
                }
            }
        }
    }

    // --- ray tracing --------------------------------------------------------

    fn acceleration_structure_sizes(&self, geometry: &AccelerationGeometry) -> GfxResult<AccelerationSizes> {
        let rt = self.rt()?;
        let geometries = [Self::geometry(geometry)];
        let info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
            .ty(Self::accel_type(geometry.kind()))
            .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(&geometries);
        let sizes = unsafe {
            rt.accel.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &info,
                &[geometry.primitive_count()],
            )
        };
        Ok(AccelerationSizes {
            structure_size: sizes.acceleration_structure_size,
            scratch_size: sizes.build_scratch_size,
        })
    }

    fn create_acceleration_structure(&self, kind: AccelerationKind, buffer: vk::Buffer, size: u64) -> GfxResult<vk::AccelerationStructureKHR> {
        let rt = self.rt()?;
        let info = vk::AccelerationStructureCreateInfoKHR::builder().buffer(buffer).size(size).ty(Self::accel_type(kind));
        Ok(unsafe { rt.accel.create_acceleration_structure(&info, None) }?)
    }

    fn destroy_acceleration_structure(&self, accel: vk::AccelerationStructureKHR) {
        if let Ok(rt) = self.rt() {
            unsafe { rt.accel.destroy_acceleration_structure(accel, None) };
        }
    }

    fn acceleration_structure_address(&self, accel: vk::AccelerationStructureKHR) -> u64 {
        let Ok(rt) = self.rt() else { return 0 };
        let info = vk::AccelerationStructureDeviceAddressInfoKHR::builder().acceleration_structure(accel);
        unsafe { rt.accel.get_acceleration_structure_device_address(&info) }
    }
}
