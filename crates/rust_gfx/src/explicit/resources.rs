//! Buffer, image, sampler and shader records of the explicit backend
//!
//! A record owns its device objects; creation either returns a complete record
//! or releases everything it made.

use super::frame::FrameSynchronizer;
use super::staging::TransferEngine;
use crate::error::{GfxError, GfxResult};
use crate::hal::{
    BufferAccess, BufferCopy, BufferDesc, Device, ImageAspect, ImageDesc, ImageState, MemoryLocation,
};
use crate::types::{BufferInfo, BufferMode, BufferUsage, ImageInfo, ImageUsage, ShaderSource, ShaderStage};

/// Host-visible twin of a device-local buffer, written during recording
pub struct PairedStaging<D: Device> {
    buffer: D::Buffer,
    allocation: D::Allocation,
    last_slot: Option<usize>,
}

/// A buffer and its memory
pub struct BufferResource<D: Device> {
    /// Device buffer
    pub buffer: D::Buffer,
    /// Backing memory
    pub allocation: D::Allocation,
    /// Creation parameters
    pub info: BufferInfo,
    staging: Option<PairedStaging<D>>,
}

fn device_usage(usage: BufferUsage) -> BufferUsage {
    let mut usage = usage | BufferUsage::TRANSFER_DST;
    if usage.intersects(BufferUsage::ACCELERATION_STRUCTURE_INPUT | BufferUsage::SHADER_BINDING_TABLE) {
        usage |= BufferUsage::DEVICE_ADDRESS;
    }
    usage
}

impl<D: Device> BufferResource<D> {
    /// Create a buffer, uploading `data` when given
    pub fn create(device: &D, transfer: &mut TransferEngine<D>, info: &BufferInfo, data: Option<&[u8]>) -> GfxResult<Self> {
        if info.size == 0 {
            return Err(GfxError::InvalidUsage("zero-sized buffer"));
        }
        if data.is_some_and(|d| d.len() as u64 > info.size) {
            return Err(GfxError::InvalidUsage("initial data larger than the buffer"));
        }

        let location = match info.mode {
            BufferMode::Constant => MemoryLocation::DeviceLocal,
            BufferMode::Dynamic => MemoryLocation::HostVisible,
        };
        let desc = BufferDesc { size: info.size, usage: device_usage(info.usage), location, label: "buffer" };
        let (buffer, mut allocation) = device.create_buffer(&desc)?;
        if let Some(data) = data {
            if let Err(e) = transfer.upload_buffer(device, buffer, &mut allocation, 0, data) {
                device.destroy_buffer(buffer, allocation);
                return Err(e);
            }
        }
        log::debug!("Created {:?} buffer of {} bytes", info.mode, info.size);
        Ok(Self { buffer, allocation, info: *info, staging: None })
    }

    fn check_range(&self, offset: u64, data: &[u8]) -> GfxResult<()> {
        if offset.checked_add(data.len() as u64).map_or(true, |end| end > self.info.size) {
            return Err(GfxError::InvalidUsage("update past the end of the buffer"));
        }
        Ok(())
    }

    /// Overwrite part of the buffer outside a frame.
    ///
    /// Earlier frames may still read the buffer, so the device is drained first.
    pub fn update_now(&mut self, device: &D, transfer: &mut TransferEngine<D>, offset: u64, data: &[u8]) -> GfxResult<()> {
        self.check_range(offset, data)?;
        device.wait_idle()?;
        transfer.upload_buffer(device, self.buffer, &mut self.allocation, offset, data)
    }

    /// Overwrite part of the buffer from inside a frame.
    ///
    /// Host-visible buffers are written in place. Device-local buffers get their
    /// bytes through the paired staging buffer, with the copy recorded into `cb`
    /// ahead of any render pass.
    pub fn update_in_frame(
        &mut self,
        device: &D,
        frames: &FrameSynchronizer<D>,
        cb: D::CommandBuffer,
        offset: u64,
        data: &[u8],
    ) -> GfxResult<()> {
        self.check_range(offset, data)?;
        if device.is_host_visible(&self.allocation) {
            return device.write_mapped(&mut self.allocation, offset, data);
        }

        if self.staging.is_none() {
            let desc = BufferDesc {
                size: self.info.size,
                usage: BufferUsage::TRANSFER_SRC,
                location: MemoryLocation::HostVisible,
                label: "paired staging",
            };
            let (buffer, allocation) = device.create_buffer(&desc)?;
            self.staging = Some(PairedStaging { buffer, allocation, last_slot: None });
        }
        let Some(staging) = self.staging.as_mut() else {
            return Err(GfxError::Unknown("paired staging buffer missing".to_string()));
        };

        // The current slot already waited on its fence in begin_record
        let current = frames.current_index();
        if let Some(slot) = staging.last_slot.filter(|s| *s != current) {
            frames.wait_slot(device, slot)?;
        }
        device.write_mapped(&mut staging.allocation, offset, data)?;

        let region = BufferCopy { src_offset: offset, dst_offset: offset, size: data.len() as u64 };
        device.cmd_buffer_barrier(cb, self.buffer, BufferAccess::ShaderRead, BufferAccess::TransferWrite);
        device.cmd_copy_buffer(cb, staging.buffer, self.buffer, region);
        device.cmd_buffer_barrier(cb, self.buffer, BufferAccess::TransferWrite, BufferAccess::ShaderRead);
        staging.last_slot = Some(current);
        Ok(())
    }

    /// Whether a paired staging buffer exists
    pub fn has_paired_staging(&self) -> bool {
        self.staging.is_some()
    }

    /// Release the buffer, its memory and any paired staging
    pub fn destroy(self, device: &D) {
        if let Some(staging) = self.staging {
            device.destroy_buffer(staging.buffer, staging.allocation);
        }
        device.destroy_buffer(self.buffer, self.allocation);
    }
}

/// State an image rests in between frames
pub fn steady_state(usage: ImageUsage) -> ImageState {
    if usage.contains(ImageUsage::STORAGE) {
        ImageState::General
    } else if usage.contains(ImageUsage::SAMPLED) {
        ImageState::ShaderRead
    } else {
        ImageState::Undefined
    }
}

fn writable(usage: ImageUsage) -> bool {
    usage.intersects(ImageUsage::SAMPLED | ImageUsage::STORAGE | ImageUsage::TRANSFER_DST)
}

/// An image, its memory and its full view
pub struct ImageResource<D: Device> {
    /// Device image
    pub image: D::Image,
    /// Backing memory
    pub allocation: D::Allocation,
    /// View over the whole image
    pub view: D::ImageView,
    /// Creation parameters
    pub info: ImageInfo,
}

impl<D: Device> ImageResource<D> {
    /// Create an image, uploading `data` when given, and leave it in its steady state
    pub fn create(device: &D, transfer: &mut TransferEngine<D>, info: &ImageInfo, data: Option<&[u8]>) -> GfxResult<Self> {
        if info.extent.texel_count() == 0 {
            return Err(GfxError::ZeroFramebufferSize);
        }
        let mut usage = info.usage;
        if data.is_some() || writable(info.usage) {
            usage |= ImageUsage::TRANSFER_DST;
        }
        let desc = ImageDesc { extent: info.extent, format: info.format, usage, label: "image" };
        let (image, allocation) = device.create_image(&desc)?;
        let view = match device.create_image_view(image, info.format) {
            Ok(view) => view,
            Err(e) => {
                device.destroy_image(image, allocation);
                return Err(e);
            }
        };

        let steady = steady_state(info.usage);
        let result = match data {
            Some(data) => transfer.upload_image(device, image, info.format, info.extent, data, steady),
            None => transfer.transition_image(device, image, ImageAspect::of(info.format), ImageState::Undefined, steady),
        };
        if let Err(e) = result {
            device.destroy_image_view(view);
            device.destroy_image(image, allocation);
            return Err(e);
        }

        log::debug!("Created {}x{} {:?} image", info.extent.width, info.extent.height, info.format);
        Ok(Self { image, allocation, view, info: *info })
    }

    /// Replace the whole image outside a frame
    pub fn update_now(&mut self, device: &D, transfer: &mut TransferEngine<D>, data: &[u8]) -> GfxResult<()> {
        if !writable(self.info.usage) {
            return Err(GfxError::InvalidUsage("image cannot be written by transfers"));
        }
        device.wait_idle()?;
        transfer.upload_image(device, self.image, self.info.format, self.info.extent, data, steady_state(self.info.usage))
    }

    /// Release the view, image and memory
    pub fn destroy(self, device: &D) {
        device.destroy_image_view(self.view);
        device.destroy_image(self.image, self.allocation);
    }
}

/// A compiled shader module shared by the pipelines built from it
pub struct ShaderResource<D: Device> {
    /// Device module
    pub module: D::ShaderModule,
    /// Stage the module was created for
    pub stage: ShaderStage,
    users: u32,
    orphaned: bool,
}

impl<D: Device> ShaderResource<D> {
    /// Create a module from SPIR-V
    pub fn create(device: &D, stage: ShaderStage, source: &ShaderSource) -> GfxResult<Self> {
        let ShaderSource::SpirV(words) = source else {
            return Err(GfxError::InvalidUsage("explicit backend consumes SPIR-V"));
        };
        let module = device.create_shader_module(words)?;
        Ok(Self { module, stage, users: 0, orphaned: false })
    }

    /// Module for `stage`, or an error when the shader was made for another stage
    pub fn module_for(&self, stage: ShaderStage) -> GfxResult<D::ShaderModule> {
        if self.orphaned {
            return Err(GfxError::InvalidUsage("shader was destroyed"));
        }
        if self.stage != stage {
            return Err(GfxError::InvalidUsage("shader used for the wrong stage"));
        }
        Ok(self.module)
    }

    /// Count a pipeline built from this shader
    pub fn add_user(&mut self) {
        self.users += 1;
    }

    /// Drop a pipeline user; returns true when the module should now be destroyed
    pub fn release(&mut self) -> bool {
        self.users = self.users.saturating_sub(1);
        self.orphaned && self.users == 0
    }

    /// Mark the shader destroyed by the caller; returns true when no pipeline still needs it
    pub fn orphan(&mut self) -> bool {
        self.orphaned = true;
        self.users == 0
    }

    /// Whether the caller already destroyed the shader
    pub fn is_orphaned(&self) -> bool {
        self.orphaned
    }

    /// Release the module
    pub fn destroy(self, device: &D) {
        device.destroy_shader_module(self.module);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::headless::{HeadlessConfig, HeadlessDevice, LiveObjects, SPIRV_MAGIC};
    use crate::types::{Extent3D, Format};

    #[test]
    fn test_steady_state() {
        assert_eq!(steady_state(ImageUsage::SAMPLED), ImageState::ShaderRead);
        assert_eq!(steady_state(ImageUsage::SAMPLED | ImageUsage::STORAGE), ImageState::General);
        assert_eq!(steady_state(ImageUsage::COLOR_ATTACHMENT), ImageState::Undefined);
    }

    #[test]
    fn test_oversized_initial_data_is_rejected() {
        let device = HeadlessDevice::new(HeadlessConfig::default());
        let mut transfer = TransferEngine::new(&device, 0).unwrap();
        let info = BufferInfo::constant(4, BufferUsage::VERTEX);
        assert!(matches!(
            BufferResource::create(&device, &mut transfer, &info, Some(&[0; 8])),
            Err(GfxError::InvalidUsage(_))
        ));
        transfer.destroy(&device);
        assert_eq!(device.live_objects(), LiveObjects::default());
    }

    #[test]
    fn test_image_without_data_reaches_steady_state() {
        let device = HeadlessDevice::new(HeadlessConfig::default());
        let mut transfer = TransferEngine::new(&device, 0).unwrap();
        let info = ImageInfo { extent: Extent3D::new(4, 4, 1), format: Format::Rgba8Unorm, usage: ImageUsage::STORAGE };
        let image = ImageResource::create(&device, &mut transfer, &info, None).unwrap();
        assert_eq!(device.image_state(image.image), Some(ImageState::General));
        image.destroy(&device);
        transfer.destroy(&device);
        assert_eq!(device.live_objects(), LiveObjects::default());
    }

    #[test]
    fn test_shader_refcount() {
        let device = HeadlessDevice::new(HeadlessConfig::default());
        let mut shader =
            ShaderResource::create(&device, ShaderStage::Vertex, &ShaderSource::SpirV(vec![SPIRV_MAGIC, 0])).unwrap();
        assert!(shader.module_for(ShaderStage::Fragment).is_err());
        assert_eq!(shader.module_for(ShaderStage::Vertex).unwrap(), shader.module);
        shader.add_user();
        assert!(!shader.orphan());
        assert!(shader.release());
        device.destroy_shader_module(shader.module);
    }

    #[test]
    fn test_glsl_is_rejected() {
        let device = HeadlessDevice::new(HeadlessConfig::default());
        let source = ShaderSource::Glsl("void main() {}".to_string());
        assert!(ShaderResource::create(&device, ShaderStage::Vertex, &source).is_err());
    }
}
