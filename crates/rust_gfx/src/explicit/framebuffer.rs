//! Framebuffer records of the explicit backend
//!
//! The default framebuffer renders into the swapchain and borrows its render
//! pass from the swapchain manager. Offscreen framebuffers own a render pass and
//! attachment images; the images live in the context's image registry under keys
//! that stay stable across resizes so callers can keep sampling them.

use slotmap::SlotMap;

use super::resources::ImageResource;
use super::staging::TransferEngine;
use crate::error::{GfxError, GfxResult};
use crate::hal::{ColorAttachmentDesc, Device, ImageState, RenderPassDesc};
use crate::types::{Extent2D, Extent3D, Format, FramebufferInfo, ImageInfo, ImageKey, ImageUsage, PipelineKey};

/// Device objects of an offscreen framebuffer
pub struct OffscreenTarget<D: Device> {
    /// Render pass; survives resizes
    pub render_pass: D::RenderPass,
    /// Device framebuffer
    pub framebuffer: D::Framebuffer,
    /// Colour attachments, in attachment order
    pub colors: Vec<ImageKey>,
    /// Depth attachment
    pub depth: Option<ImageKey>,
}

/// Where a framebuffer renders to
pub enum FramebufferTarget<D: Device> {
    /// The window, through the swapchain
    Swapchain,
    /// Owned attachment images
    Offscreen(OffscreenTarget<D>),
}

/// A framebuffer and the registry of pipelines built against it
pub struct FramebufferResource<D: Device> {
    /// Current size and formats
    pub info: FramebufferInfo,
    /// Render target
    pub target: FramebufferTarget<D>,
    /// Pipelines to rebuild when the framebuffer changes
    pub pipelines: Vec<PipelineKey>,
    /// Bumped on every resize
    pub generation: u64,
    /// Some pipeline still targets an older generation
    pub pipelines_stale: bool,
}

fn render_pass_desc(info: &FramebufferInfo) -> RenderPassDesc {
    RenderPassDesc {
        colors: info
            .color_formats
            .iter()
            .map(|format| ColorAttachmentDesc { format: *format, final_state: ImageState::ShaderRead })
            .collect(),
        depth: info.depth_format,
    }
}

/// Attachment images for one extent, not yet registered
struct Attachments<D: Device> {
    colors: Vec<ImageResource<D>>,
    depth: Option<ImageResource<D>>,
}

impl<D: Device> Attachments<D> {
    fn build(
        device: &D,
        transfer: &mut TransferEngine<D>,
        render_pass: D::RenderPass,
        info: &FramebufferInfo,
        extent: Extent2D,
    ) -> GfxResult<(Self, D::Framebuffer)> {
        let mut attachments = Self { colors: Vec::new(), depth: None };
        match attachments.fill(device, transfer, render_pass, info, extent) {
            Ok(framebuffer) => Ok((attachments, framebuffer)),
            Err(e) => {
                attachments.destroy(device);
                Err(e)
            }
        }
    }

    fn fill(
        &mut self,
        device: &D,
        transfer: &mut TransferEngine<D>,
        render_pass: D::RenderPass,
        info: &FramebufferInfo,
        extent: Extent2D,
    ) -> GfxResult<D::Framebuffer> {
        let extent3 = Extent3D::from(extent);
        for format in &info.color_formats {
            let image_info = ImageInfo {
                extent: extent3,
                format: *format,
                usage: ImageUsage::COLOR_ATTACHMENT | ImageUsage::SAMPLED,
            };
            self.colors.push(ImageResource::create(device, transfer, &image_info, None)?);
        }
        if let Some(format) = info.depth_format {
            let image_info = ImageInfo { extent: extent3, format, usage: ImageUsage::DEPTH_ATTACHMENT };
            self.depth = Some(ImageResource::create(device, transfer, &image_info, None)?);
        }

        let views: Vec<D::ImageView> = self.colors.iter().chain(self.depth.iter()).map(|i| i.view).collect();
        device.create_framebuffer(render_pass, &views, extent)
    }

    fn destroy(self, device: &D) {
        for image in self.colors.into_iter().chain(self.depth) {
            image.destroy(device);
        }
    }
}

impl<D: Device> FramebufferResource<D> {
    /// The window framebuffer
    pub fn swapchain(extent: Extent2D, color_format: Format, depth_format: Format) -> Self {
        Self {
            info: FramebufferInfo { extent, color_formats: vec![color_format], depth_format: Some(depth_format) },
            target: FramebufferTarget::Swapchain,
            pipelines: Vec::new(),
            generation: 0,
            pipelines_stale: false,
        }
    }

    /// Create an offscreen framebuffer, registering its attachments in `images`
    pub fn create_offscreen(
        device: &D,
        transfer: &mut TransferEngine<D>,
        images: &mut SlotMap<ImageKey, ImageResource<D>>,
        info: &FramebufferInfo,
    ) -> GfxResult<Self> {
        info.validate()?;
        let render_pass = device.create_render_pass(&render_pass_desc(info))?;
        let (Attachments { colors, depth }, framebuffer) =
            match Attachments::build(device, transfer, render_pass, info, info.extent) {
                Ok(built) => built,
                Err(e) => {
                    device.destroy_render_pass(render_pass);
                    return Err(e);
                }
            };
        let target = OffscreenTarget {
            render_pass,
            framebuffer,
            colors: colors.into_iter().map(|image| images.insert(image)).collect(),
            depth: depth.map(|image| images.insert(image)),
        };
        log::debug!(
            "Created {}x{} offscreen framebuffer with {} colour attachment(s)",
            info.extent.width,
            info.extent.height,
            info.color_formats.len()
        );
        Ok(Self {
            info: info.clone(),
            target: FramebufferTarget::Offscreen(target),
            pipelines: Vec::new(),
            generation: 0,
            pipelines_stale: false,
        })
    }

    /// Whether this is the window framebuffer
    pub fn is_default(&self) -> bool {
        matches!(self.target, FramebufferTarget::Swapchain)
    }

    /// Colour attachment count of the render pass
    pub fn color_count(&self) -> u32 {
        self.info.color_formats.len() as u32
    }

    /// Whether `image` is one of this framebuffer's attachments
    pub fn owns_image(&self, image: ImageKey) -> bool {
        match &self.target {
            FramebufferTarget::Swapchain => false,
            FramebufferTarget::Offscreen(t) => t.colors.contains(&image) || t.depth == Some(image),
        }
    }

    /// Record a new extent after the swapchain was recreated
    pub fn swapchain_resized(&mut self, extent: Extent2D, color_format: Format) {
        self.info.extent = extent;
        self.info.color_formats = vec![color_format];
        self.mark_resized();
    }

    fn mark_resized(&mut self) {
        self.generation += 1;
        self.pipelines_stale = !self.pipelines.is_empty();
    }

    /// Recreate the attachments of an offscreen framebuffer at `extent`.
    ///
    /// The new images replace the old ones under the same keys; on failure the
    /// framebuffer is left untouched. The device must be idle.
    pub fn resize_offscreen(
        &mut self,
        device: &D,
        transfer: &mut TransferEngine<D>,
        images: &mut SlotMap<ImageKey, ImageResource<D>>,
        extent: Extent2D,
    ) -> GfxResult<()> {
        if extent.is_zero() {
            return Err(GfxError::ZeroFramebufferSize);
        }
        let FramebufferTarget::Offscreen(target) = &mut self.target else {
            return Err(GfxError::InvalidUsage("the default framebuffer follows the window"));
        };
        if extent == self.info.extent {
            return Ok(());
        }

        let (Attachments { colors, depth }, framebuffer) =
            Attachments::build(device, transfer, target.render_pass, &self.info, extent)?;

        let keys = target.colors.iter().chain(target.depth.iter());
        for (key, image) in keys.zip(colors.into_iter().chain(depth)) {
            match images.get_mut(*key) {
                Some(slot) => std::mem::replace(slot, image).destroy(device),
                None => image.destroy(device),
            }
        }
        device.destroy_framebuffer(std::mem::replace(&mut target.framebuffer, framebuffer));

        log::debug!(
            "Offscreen framebuffer resized {}x{} -> {}x{}",
            self.info.extent.width,
            self.info.extent.height,
            extent.width,
            extent.height
        );
        self.info.extent = extent;
        self.mark_resized();
        Ok(())
    }

    /// Release owned device objects and attachment images; pipelines must be gone
    pub fn destroy(self, device: &D, images: &mut SlotMap<ImageKey, ImageResource<D>>) {
        if let FramebufferTarget::Offscreen(target) = self.target {
            device.destroy_framebuffer(target.framebuffer);
            for key in target.colors.into_iter().chain(target.depth) {
                if let Some(image) = images.remove(key) {
                    image.destroy(device);
                }
            }
            device.destroy_render_pass(target.render_pass);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::headless::{FailPoint, HeadlessConfig, HeadlessDevice, LiveObjects};

    fn info(width: u32, height: u32) -> FramebufferInfo {
        FramebufferInfo {
            extent: Extent2D::new(width, height),
            color_formats: vec![Format::Rgba8Unorm, Format::Rgba16Float],
            depth_format: Some(Format::D32Float),
        }
    }

    #[test]
    fn test_offscreen_attachments_registered() {
        let device = HeadlessDevice::new(HeadlessConfig::default());
        let mut transfer = TransferEngine::new(&device, 0).unwrap();
        let mut images = SlotMap::with_key();
        let fb = FramebufferResource::create_offscreen(&device, &mut transfer, &mut images, &info(64, 32)).unwrap();
        assert_eq!(images.len(), 3);
        assert_eq!(fb.color_count(), 2);
        let FramebufferTarget::Offscreen(target) = &fb.target else { panic!("expected offscreen") };
        assert!(fb.owns_image(target.colors[1]));
        assert_eq!(device.image_state(images[target.colors[0]].image), Some(ImageState::ShaderRead));

        fb.destroy(&device, &mut images);
        transfer.destroy(&device);
        assert!(images.is_empty());
        assert_eq!(device.live_objects(), LiveObjects::default());
        assert!(device.validation_errors().is_empty());
    }

    #[test]
    fn test_resize_keeps_keys() {
        let device = HeadlessDevice::new(HeadlessConfig::default());
        let mut transfer = TransferEngine::new(&device, 0).unwrap();
        let mut images = SlotMap::with_key();
        let mut fb = FramebufferResource::create_offscreen(&device, &mut transfer, &mut images, &info(64, 32)).unwrap();
        let keys: Vec<ImageKey> = images.keys().collect();

        fb.pipelines.push(PipelineKey::default());
        fb.resize_offscreen(&device, &mut transfer, &mut images, Extent2D::new(128, 128)).unwrap();
        assert_eq!(images.keys().collect::<Vec<_>>(), keys);
        assert!(images.values().all(|i| i.info.extent.width == 128));
        assert_eq!((fb.generation, fb.pipelines_stale), (1, true));
        assert_eq!(device.live_objects().images, 3);
        fb.pipelines.clear();
        fb.destroy(&device, &mut images);
        transfer.destroy(&device);
    }

    #[test]
    fn test_failed_resize_leaves_framebuffer_intact() {
        let device = HeadlessDevice::new(HeadlessConfig::default());
        let mut transfer = TransferEngine::new(&device, 0).unwrap();
        let mut images = SlotMap::with_key();
        let mut fb = FramebufferResource::create_offscreen(&device, &mut transfer, &mut images, &info(64, 32)).unwrap();
        let before = device.live_objects();

        device.fail_nth(FailPoint::CreateFramebuffer, 1, GfxError::OutOfDeviceMemory);
        let result = fb.resize_offscreen(&device, &mut transfer, &mut images, Extent2D::new(32, 32));
        assert_eq!(result, Err(GfxError::OutOfDeviceMemory));
        assert_eq!(fb.info.extent, Extent2D::new(64, 32));
        assert_eq!(fb.generation, 0);
        assert_eq!(device.live_objects(), before);
        fb.destroy(&device, &mut images);
        transfer.destroy(&device);
    }

    #[test]
    fn test_invalid_infos() {
        let device = HeadlessDevice::new(HeadlessConfig::default());
        let mut transfer = TransferEngine::new(&device, 0).unwrap();
        let mut images = SlotMap::with_key();
        let zero = FramebufferResource::create_offscreen(&device, &mut transfer, &mut images, &info(0, 32));
        assert!(matches!(zero, Err(GfxError::ZeroFramebufferSize)));
        let swapped = FramebufferInfo {
            extent: Extent2D::new(8, 8),
            color_formats: vec![Format::D32Float],
            depth_format: None,
        };
        assert!(FramebufferResource::create_offscreen(&device, &mut transfer, &mut images, &swapped).is_err());
        transfer.destroy(&device);
        assert_eq!(device.live_objects(), LiveObjects::default());
    }
}
