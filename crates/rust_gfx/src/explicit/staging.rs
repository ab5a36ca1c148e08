//! Shared staging buffer and synchronous transfers
//!
//! Every upload into memory the host cannot map goes through one host-visible
//! staging buffer owned by the context. The buffer only grows: a larger request
//! replaces it, and the old buffer is released right away because every transfer
//! is complete by the time the call that issued it returns.

use crate::error::{GfxError, GfxResult};
use crate::hal::{
    BufferAccess, BufferCopy, BufferDesc, Device, ImageAspect, ImageState, MemoryLocation, QueueKind,
    Submit,
};
use crate::types::{BufferUsage, Extent3D, Format};

/// Staging usage counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StagingStats {
    /// Current capacity in bytes
    pub capacity: u64,
    /// Number of times the staging buffer was (re)created
    pub grow_count: u32,
    /// Number of discarded staging buffers released
    pub released_count: u32,
    /// Completed one-time submissions
    pub transfers: u64,
}

struct StagingBuffer<D: Device> {
    buffer: D::Buffer,
    allocation: D::Allocation,
    capacity: u64,
}

/// Synchronous transfer path of the explicit backend
pub struct TransferEngine<D: Device> {
    staging: Option<StagingBuffer<D>>,
    fence: D::Fence,
    stats: StagingStats,
}

impl<D: Device> TransferEngine<D> {
    /// Create the engine and its transfer fence, pre-sizing staging when asked
    pub fn new(device: &D, initial_capacity: u64) -> GfxResult<Self> {
        let fence = device.create_fence(false)?;
        let mut engine = Self { staging: None, fence, stats: StagingStats::default() };
        if initial_capacity > 0 {
            if let Err(e) = engine.ensure_capacity(device, initial_capacity) {
                device.destroy_fence(fence);
                return Err(e);
            }
        }
        Ok(engine)
    }

    /// Counters for diagnostics
    pub fn stats(&self) -> StagingStats {
        self.stats
    }

    /// Make the staging buffer at least `size` bytes.
    ///
    /// The replacement is created before the old buffer is released, so a failed
    /// grow leaves the previous buffer in place.
    pub fn ensure_capacity(&mut self, device: &D, size: u64) -> GfxResult<()> {
        if self.staging.as_ref().is_some_and(|s| s.capacity >= size) {
            return Ok(());
        }

        let desc = BufferDesc {
            size,
            usage: BufferUsage::TRANSFER_SRC,
            location: MemoryLocation::HostVisible,
            label: "shared staging",
        };
        let (buffer, allocation) = device.create_buffer(&desc)?;
        if let Some(old) = self.staging.replace(StagingBuffer { buffer, allocation, capacity: size }) {
            device.destroy_buffer(old.buffer, old.allocation);
            self.stats.released_count += 1;
        }
        self.stats.capacity = size;
        self.stats.grow_count += 1;
        log::debug!("Shared staging buffer grown to {size} bytes");
        Ok(())
    }

    fn stage(&mut self, device: &D, data: &[u8]) -> GfxResult<D::Buffer> {
        self.ensure_capacity(device, data.len() as u64)?;
        let staging = self
            .staging
            .as_mut()
            .ok_or_else(|| GfxError::Unknown("staging buffer missing after grow".to_string()))?;
        device.write_mapped(&mut staging.allocation, 0, data)?;
        Ok(staging.buffer)
    }

    /// Write `data` into a buffer at `offset`, mapping directly when possible
    pub fn upload_buffer(
        &mut self,
        device: &D,
        dst: D::Buffer,
        allocation: &mut D::Allocation,
        offset: u64,
        data: &[u8],
    ) -> GfxResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        if device.is_host_visible(allocation) {
            return device.write_mapped(allocation, offset, data);
        }

        let staging = self.stage(device, data)?;
        let region = BufferCopy { src_offset: 0, dst_offset: offset, size: data.len() as u64 };
        self.submit_blocking(device, |cb| {
            device.cmd_buffer_barrier(cb, dst, BufferAccess::None, BufferAccess::TransferWrite);
            device.cmd_copy_buffer(cb, staging, dst, region);
            device.cmd_buffer_barrier(cb, dst, BufferAccess::TransferWrite, BufferAccess::ShaderRead);
        })
    }

    /// Replace the whole contents of an image and leave it in `steady`
    pub fn upload_image(
        &mut self,
        device: &D,
        image: D::Image,
        format: Format,
        extent: Extent3D,
        data: &[u8],
        steady: ImageState,
    ) -> GfxResult<()> {
        let expected = extent.texel_count() * u64::from(format.bytes_per_texel());
        if data.len() as u64 != expected {
            return Err(GfxError::InvalidUsage("image data size does not match its extent"));
        }

        let aspect = ImageAspect::of(format);
        let staging = self.stage(device, data)?;
        self.submit_blocking(device, |cb| {
            device.cmd_image_barrier(cb, image, aspect, ImageState::Undefined, ImageState::TransferDst);
            device.cmd_copy_buffer_to_image(cb, staging, image, aspect, extent);
            device.cmd_image_barrier(cb, image, aspect, ImageState::TransferDst, steady);
        })
    }

    /// Move an image between states outside a frame
    pub fn transition_image(
        &mut self,
        device: &D,
        image: D::Image,
        aspect: ImageAspect,
        from: ImageState,
        to: ImageState,
    ) -> GfxResult<()> {
        if from == to {
            return Ok(());
        }
        self.submit_blocking(device, |cb| device.cmd_image_barrier(cb, image, aspect, from, to))
    }

    /// Record a one-time command buffer, submit it and wait for completion.
    ///
    /// The command buffer is returned to its pool on every path.
    pub fn submit_blocking(&mut self, device: &D, record: impl FnOnce(D::CommandBuffer)) -> GfxResult<()> {
        let cb = device.allocate_command_buffer(QueueKind::Graphics)?;
        let result = self.run_one_time(device, cb, record);
        device.free_command_buffer(QueueKind::Graphics, cb);
        if result.is_ok() {
            self.stats.transfers += 1;
        }
        result
    }

    fn run_one_time(&self, device: &D, cb: D::CommandBuffer, record: impl FnOnce(D::CommandBuffer)) -> GfxResult<()> {
        device.begin_commands(cb, true)?;
        record(cb);
        device.end_commands(cb)?;
        device.submit(
            QueueKind::Graphics,
            &Submit { command_buffer: cb, wait: None, signal: &[], fence: Some(self.fence) },
        )?;
        device.wait_for_fence(self.fence)?;
        device.reset_fence(self.fence)
    }

    /// Release the staging buffer and fence
    pub fn destroy(self, device: &D) {
        if let Some(staging) = self.staging {
            device.destroy_buffer(staging.buffer, staging.allocation);
        }
        device.destroy_fence(self.fence);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::headless::{FailPoint, HeadlessConfig, HeadlessDevice, LiveObjects};

    fn device_local(device: &HeadlessDevice, size: u64) -> (crate::hal::headless::BufferId, <HeadlessDevice as Device>::Allocation) {
        let desc = BufferDesc {
            size,
            usage: BufferUsage::VERTEX | BufferUsage::TRANSFER_DST,
            location: MemoryLocation::DeviceLocal,
            label: "test",
        };
        device.create_buffer(&desc).unwrap()
    }

    #[test]
    fn test_capacity_never_shrinks() {
        let device = HeadlessDevice::new(HeadlessConfig::default());
        let mut engine = TransferEngine::new(&device, 64).unwrap();
        engine.ensure_capacity(&device, 16).unwrap();
        assert_eq!(engine.stats().capacity, 64);
        engine.ensure_capacity(&device, 256).unwrap();
        assert_eq!(engine.stats(), StagingStats { capacity: 256, grow_count: 2, released_count: 1, transfers: 0 });
        engine.destroy(&device);
        assert_eq!(device.live_objects(), LiveObjects::default());
    }

    #[test]
    fn test_failed_grow_keeps_old_buffer() {
        let device = HeadlessDevice::new(HeadlessConfig::default());
        let mut engine = TransferEngine::new(&device, 32).unwrap();
        device.fail_nth(FailPoint::CreateBuffer, 1, GfxError::OutOfDeviceMemory);
        assert_eq!(engine.ensure_capacity(&device, 128), Err(GfxError::OutOfDeviceMemory));
        assert_eq!(engine.stats().capacity, 32);
        assert_eq!(device.live_objects().buffers, 1);
        engine.destroy(&device);
    }

    #[test]
    fn test_staged_upload_lands_at_offset() {
        let device = HeadlessDevice::new(HeadlessConfig::default());
        let mut engine = TransferEngine::new(&device, 0).unwrap();
        let (buffer, mut allocation) = device_local(&device, 8);
        engine.upload_buffer(&device, buffer, &mut allocation, 4, &[1, 2, 3, 4]).unwrap();
        assert_eq!(device.buffer_contents(buffer).unwrap(), vec![0, 0, 0, 0, 1, 2, 3, 4]);
        assert_eq!(engine.stats().transfers, 1);
        device.destroy_buffer(buffer, allocation);
        engine.destroy(&device);
        assert!(device.validation_errors().is_empty());
        assert_eq!(device.live_objects(), LiveObjects::default());
    }

    #[test]
    fn test_failed_submit_frees_command_buffer() {
        let device = HeadlessDevice::new(HeadlessConfig::default());
        let mut engine = TransferEngine::new(&device, 0).unwrap();
        let (buffer, mut allocation) = device_local(&device, 4);
        device.fail_nth(FailPoint::Submit, 1, GfxError::OutOfHostMemory);
        assert_eq!(
            engine.upload_buffer(&device, buffer, &mut allocation, 0, &[9; 4]),
            Err(GfxError::OutOfHostMemory)
        );
        assert_eq!(device.live_objects().command_buffers, 0);
        device.destroy_buffer(buffer, allocation);
        engine.destroy(&device);
    }
}
