//! Acceleration structures and shader binding tables
//!
//! A build either produces a complete structure or releases everything it
//! allocated: backing buffer, scratch buffer and the structure itself. Scratch
//! memory only lives for the duration of the blocking build submission.

use bytemuck::{Pod, Zeroable};

use super::staging::TransferEngine;
use crate::error::{GfxError, GfxResult};
use crate::hal::{
    align_up, AccelerationBuild, AccelerationGeometry, BufferAccess, BufferDesc, Device, MemoryLocation,
    RayTracingProperties, SbtRegions, StridedRegion,
};
use crate::types::{BufferUsage, RtInstance};

/// Culling disabled for the instance (`VK_GEOMETRY_INSTANCE_TRIANGLE_FACING_CULL_DISABLE_BIT_KHR`)
const INSTANCE_CULL_DISABLE: u32 = 0x1;

/// Device layout of one top-level instance (`VkAccelerationStructureInstanceKHR`)
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct InstanceRecord {
    /// Row-major 3x4 object-to-world transform
    pub transform: [[f32; 4]; 3],
    /// Custom index (low 24 bits) and visibility mask (high 8 bits)
    pub custom_index_and_mask: u32,
    /// Hit group offset (low 24 bits) and instance flags (high 8 bits)
    pub sbt_offset_and_flags: u32,
    /// Device address of the bottom-level structure
    pub acceleration_structure_reference: u64,
}

impl InstanceRecord {
    /// Pack an instance referencing a built bottom-level structure at `blas_address`
    pub fn new(instance: &RtInstance, blas_address: u64) -> Self {
        Self {
            transform: instance.transform,
            custom_index_and_mask: (instance.custom_index & 0x00ff_ffff) | (u32::from(instance.mask) << 24),
            sbt_offset_and_flags: (instance.hit_group & 0x00ff_ffff) | (INSTANCE_CULL_DISABLE << 24),
            acceleration_structure_reference: blas_address,
        }
    }
}

struct Scratch<D: Device> {
    buffer: D::Buffer,
    allocation: D::Allocation,
    address: u64,
}

impl<D: Device> Scratch<D> {
    /// Over-allocate so an aligned address with `size` bytes behind it always exists
    fn create(device: &D, size: u64, alignment: u64) -> GfxResult<Self> {
        let desc = BufferDesc {
            size: size + alignment,
            usage: BufferUsage::STORAGE | BufferUsage::DEVICE_ADDRESS,
            location: MemoryLocation::DeviceLocal,
            label: "acceleration scratch",
        };
        let (buffer, allocation) = device.create_buffer(&desc)?;
        let address = align_up(device.buffer_address(buffer), alignment);
        Ok(Self { buffer, allocation, address })
    }

    fn destroy(self, device: &D) {
        device.destroy_buffer(self.buffer, self.allocation);
    }
}

/// A built acceleration structure and its backing storage
pub struct AccelerationStructure<D: Device> {
    /// Device structure
    pub accel: D::AccelerationStructure,
    buffer: D::Buffer,
    allocation: D::Allocation,
    /// Address instance records use to reference it
    pub address: u64,
}

impl<D: Device> AccelerationStructure<D> {
    /// Query sizes, allocate, create and build in one blocking submission
    pub fn build(device: &D, transfer: &mut TransferEngine<D>, geometry: &AccelerationGeometry) -> GfxResult<Self> {
        let rt = device.capabilities().ray_tracing.ok_or(GfxError::FeatureNotSupported)?;
        let kind = geometry.kind();
        let sizes = device.acceleration_structure_sizes(geometry)?;

        let desc = BufferDesc {
            size: sizes.structure_size,
            usage: BufferUsage::ACCELERATION_STRUCTURE_STORAGE | BufferUsage::DEVICE_ADDRESS,
            location: MemoryLocation::DeviceLocal,
            label: "acceleration structure",
        };
        let (buffer, allocation) = device.create_buffer(&desc)?;

        let scratch = match Scratch::create(device, sizes.scratch_size, u64::from(rt.scratch_offset_alignment)) {
            Ok(scratch) => scratch,
            Err(e) => {
                device.destroy_buffer(buffer, allocation);
                return Err(e);
            }
        };

        let accel = match device.create_acceleration_structure(kind, buffer, sizes.structure_size) {
            Ok(accel) => accel,
            Err(e) => {
                scratch.destroy(device);
                device.destroy_buffer(buffer, allocation);
                return Err(e);
            }
        };

        let build = AccelerationBuild { geometry, dst: accel, scratch_address: scratch.address };
        let result = transfer.submit_blocking(device, |cb| {
            device.cmd_build_acceleration_structure(cb, &build);
            device.cmd_memory_barrier(cb, BufferAccess::AccelerationBuild, BufferAccess::ShaderRead);
        });
        scratch.destroy(device);
        if let Err(e) = result {
            device.destroy_acceleration_structure(accel);
            device.destroy_buffer(buffer, allocation);
            return Err(e);
        }

        let address = device.acceleration_structure_address(accel);
        log::debug!(
            "Built {kind:?} acceleration structure: {} primitives, {} bytes",
            geometry.primitive_count(),
            sizes.structure_size
        );
        Ok(Self { accel, buffer, allocation, address })
    }

    /// Destroy the structure, then its backing buffer
    pub fn destroy(self, device: &D) {
        device.destroy_acceleration_structure(self.accel);
        device.destroy_buffer(self.buffer, self.allocation);
    }
}

/// Stride, size and record count of one binding table region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegionLayout {
    /// Distance between records
    pub stride: u64,
    /// Region size, a multiple of the base alignment
    pub size: u64,
    /// Records in the region
    pub count: u32,
}

/// Placement of shader group handles in the three binding table regions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbtLayout {
    /// Ray generation region; its stride must equal its size
    pub raygen: RegionLayout,
    /// Miss region
    pub miss: RegionLayout,
    /// Hit group region
    pub hit: RegionLayout,
    /// Bytes of one handle
    pub handle_size: u64,
}

impl SbtLayout {
    /// Lay out one raygen group followed by `miss_count` and `hit_count` groups
    pub fn new(props: &RayTracingProperties, miss_count: u32, hit_count: u32) -> Self {
        let handle_size = u64::from(props.shader_group_handle_size);
        let base = u64::from(props.shader_group_base_alignment);
        let handle_stride = align_up(handle_size, u64::from(props.shader_group_handle_alignment));
        let raygen_stride = align_up(handle_stride, base);
        let region = |count: u32| RegionLayout {
            stride: handle_stride,
            size: align_up(u64::from(count) * handle_stride, base),
            count,
        };
        Self {
            raygen: RegionLayout { stride: raygen_stride, size: raygen_stride, count: 1 },
            miss: region(miss_count),
            hit: region(hit_count),
            handle_size,
        }
    }

    /// Total group count
    pub fn group_count(&self) -> u32 {
        self.raygen.count + self.miss.count + self.hit.count
    }
}

struct SbtRegion<D: Device> {
    buffer: D::Buffer,
    allocation: D::Allocation,
}

/// Binding table buffers of one ray tracing pipeline
pub struct ShaderBindingTable<D: Device> {
    regions: Vec<SbtRegion<D>>,
    /// Addresses traced with
    pub strided: SbtRegions,
}

impl<D: Device> ShaderBindingTable<D> {
    /// Copy `handles` (every group, in group order) into three region buffers
    pub fn create(device: &D, props: &RayTracingProperties, layout: &SbtLayout, handles: &[u8]) -> GfxResult<Self> {
        let handle_size = layout.handle_size as usize;
        if handles.len() < layout.group_count() as usize * handle_size {
            return Err(GfxError::InvalidUsage("fewer shader group handles than groups"));
        }
        let base = u64::from(props.shader_group_base_alignment);

        let mut table = Self { regions: Vec::with_capacity(3), strided: SbtRegions::default() };
        let mut first_group = 0usize;
        let mut strided = [StridedRegion::default(); 3];
        for (i, region) in [layout.raygen, layout.miss, layout.hit].iter().enumerate() {
            let groups = first_group..first_group + region.count as usize;
            first_group = groups.end;
            if region.count == 0 {
                continue;
            }
            match Self::create_region(device, region, base, &handles[groups.start * handle_size..groups.end * handle_size], handle_size) {
                Ok((sbt_region, address)) => {
                    table.regions.push(sbt_region);
                    strided[i] = StridedRegion { address, stride: region.stride, size: region.size };
                }
                Err(e) => {
                    table.destroy(device);
                    return Err(e);
                }
            }
        }

        let [raygen, miss, hit] = strided;
        table.strided = SbtRegions { raygen, miss, hit };
        Ok(table)
    }

    fn create_region(
        device: &D,
        region: &RegionLayout,
        base: u64,
        handles: &[u8],
        handle_size: usize,
    ) -> GfxResult<(SbtRegion<D>, u64)> {
        let desc = BufferDesc {
            size: region.size + base,
            usage: BufferUsage::SHADER_BINDING_TABLE | BufferUsage::DEVICE_ADDRESS,
            location: MemoryLocation::HostVisible,
            label: "shader binding table",
        };
        let (buffer, mut allocation) = device.create_buffer(&desc)?;
        let raw = device.buffer_address(buffer);
        let address = align_up(raw, base);

        let mut bytes = vec![0u8; region.size as usize];
        for (i, handle) in handles.chunks_exact(handle_size).enumerate() {
            let at = i * region.stride as usize;
            bytes[at..at + handle_size].copy_from_slice(handle);
        }
        if let Err(e) = device.write_mapped(&mut allocation, address - raw, &bytes) {
            device.destroy_buffer(buffer, allocation);
            return Err(e);
        }
        Ok((SbtRegion { buffer, allocation }, address))
    }

    /// Release every region buffer
    pub fn destroy(self, device: &D) {
        for region in self.regions {
            device.destroy_buffer(region.buffer, region.allocation);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::headless::{FailPoint, HeadlessConfig, HeadlessDevice, LiveObjects};

    fn props() -> RayTracingProperties {
        RayTracingProperties {
            shader_group_handle_size: 32,
            shader_group_handle_alignment: 32,
            shader_group_base_alignment: 64,
            scratch_offset_alignment: 128,
            max_recursion_depth: 31,
        }
    }

    #[test]
    fn test_instance_record_layout() {
        assert_eq!(std::mem::size_of::<InstanceRecord>(), 64);
        let mut instance = RtInstance::new(Default::default());
        instance.custom_index = 7;
        instance.mask = 0xff;
        instance.hit_group = 2;
        let record = InstanceRecord::new(&instance, 0xdead_beef);
        let bytes = bytemuck::bytes_of(&record);
        assert_eq!(&bytes[56..64], &0xdead_beef_u64.to_le_bytes());
        assert_eq!(record.custom_index_and_mask, 0xff00_0007);
        assert_eq!(record.sbt_offset_and_flags, 0x0100_0002);
    }

    #[test]
    fn test_sbt_layout_rounding() {
        let layout = SbtLayout::new(&props(), 1, 3);
        assert_eq!(layout.raygen, RegionLayout { stride: 64, size: 64, count: 1 });
        assert_eq!(layout.miss, RegionLayout { stride: 32, size: 64, count: 1 });
        assert_eq!(layout.hit, RegionLayout { stride: 32, size: 128, count: 3 });

        let odd = RayTracingProperties { shader_group_handle_size: 20, shader_group_handle_alignment: 16, ..props() };
        let layout = SbtLayout::new(&odd, 5, 0);
        assert_eq!(layout.miss, RegionLayout { stride: 32, size: 192, count: 5 });
        assert_eq!(layout.hit.size, 0);
    }

    #[test]
    fn test_sbt_regions_are_aligned() {
        let device = HeadlessDevice::new(HeadlessConfig::default());
        let layout = SbtLayout::new(&props(), 2, 1);
        let handles: Vec<u8> = (0..4u8).flat_map(|g| vec![g + 1; 32]).collect();
        let table = ShaderBindingTable::create(&device, &props(), &layout, &handles).unwrap();
        for region in [table.strided.raygen, table.strided.miss, table.strided.hit] {
            assert_eq!(region.address % 64, 0);
        }
        assert_eq!(table.strided.miss.stride, 32);
        table.destroy(&device);
        assert_eq!(device.live_objects(), LiveObjects::default());
    }

    #[test]
    fn test_failed_region_releases_earlier_regions() {
        let device = HeadlessDevice::new(HeadlessConfig::default());
        let layout = SbtLayout::new(&props(), 1, 1);
        let handles = vec![1u8; 96];
        device.fail_nth(FailPoint::CreateBuffer, 3, GfxError::OutOfDeviceMemory);
        assert!(ShaderBindingTable::create(&device, &props(), &layout, &handles).is_err());
        assert_eq!(device.live_objects(), LiveObjects::default());
    }

    #[test]
    fn test_build_without_ray_tracing() {
        let device = HeadlessDevice::new(HeadlessConfig { ray_tracing: None, ..HeadlessConfig::default() });
        let mut transfer = TransferEngine::new(&device, 0).unwrap();
        let geometry = AccelerationGeometry::Instances { address: 0, count: 1 };
        assert!(matches!(
            AccelerationStructure::build(&device, &mut transfer, &geometry),
            Err(GfxError::FeatureNotSupported)
        ));
        transfer.destroy(&device);
    }
}
