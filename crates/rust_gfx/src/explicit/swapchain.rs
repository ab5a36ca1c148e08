//! Swapchain management for the explicit backend
//!
//! Owns the presentable images, the depth buffer, the render pass they share and
//! one bundle per image (view, framebuffer, graphics command buffer and, with a
//! separate present queue, a pre-recorded ownership-acquire command buffer).

use super::resources::ImageResource;
use super::staging::TransferEngine;
use crate::error::{GfxError, GfxResult};
use crate::hal::{
    AcquireOutcome, ColorAttachmentDesc, Device, ImageState, OwnershipTransfer, PresentOutcome, QueueKind,
    RenderPassDesc, SurfaceConfig, SurfaceSupport,
};
use crate::types::{CompositeAlpha, Extent2D, Extent3D, Format, ImageInfo, ImageUsage, PresentMode, SurfaceTransform};

/// Format of the swapchain depth buffer
pub const DEPTH_FORMAT: Format = Format::D32Float;

/// Out-of-date acquires tolerated in a row before giving up on a frame
const MAX_ACQUIRE_ATTEMPTS: u32 = 8;

const PREFERRED_FORMATS: [Format; 2] = [Format::Bgra8Srgb, Format::Rgba8Srgb];

const PREFERRED_ALPHA: [CompositeAlpha; 4] = [
    CompositeAlpha::Opaque,
    CompositeAlpha::PreMultiplied,
    CompositeAlpha::PostMultiplied,
    CompositeAlpha::Inherit,
];

/// Pick swapchain parameters from what the surface supports
pub fn choose_surface_config(support: &SurfaceSupport, requested: Extent2D, vsync: bool) -> GfxResult<SurfaceConfig> {
    let format = PREFERRED_FORMATS
        .iter()
        .copied()
        .find(|f| support.formats.contains(f))
        .or_else(|| support.formats.first().copied())
        .ok_or(GfxError::FormatNotSupported)?;

    let present_mode = if vsync {
        PresentMode::Fifo
    } else {
        [PresentMode::Mailbox, PresentMode::Immediate]
            .into_iter()
            .find(|m| support.present_modes.contains(m))
            .unwrap_or(PresentMode::Fifo)
    };

    let extent = support
        .current_extent
        .unwrap_or_else(|| requested.clamp(support.min_extent, support.max_extent));

    let mut image_count = support.min_image_count + 1;
    if support.max_image_count > 0 {
        image_count = image_count.min(support.max_image_count);
    }

    let transform = if support.supports_identity {
        SurfaceTransform::IDENTITY
    } else {
        support.current_transform
    };

    let composite_alpha = PREFERRED_ALPHA
        .into_iter()
        .find(|a| support.composite_alpha.contains(a))
        .ok_or(GfxError::FeatureNotSupported)?;

    Ok(SurfaceConfig { format, present_mode, extent, image_count, transform, composite_alpha })
}

/// Per-image bundle
pub struct SwapchainImage<D: Device> {
    /// Presentable image, owned by the swapchain
    pub image: D::Image,
    /// Colour view
    pub view: D::ImageView,
    /// Framebuffer over the view and the shared depth buffer
    pub framebuffer: D::Framebuffer,
    /// Graphics command buffer recorded each frame the image is acquired
    pub command_buffer: D::CommandBuffer,
    /// Present-queue command buffer acquiring the image from the graphics queue
    pub present_command_buffer: Option<D::CommandBuffer>,
}

fn record_ownership_acquire<D: Device>(device: &D, image: D::Image) -> GfxResult<D::CommandBuffer> {
    let cb = device.allocate_command_buffer(QueueKind::Present)?;
    let recorded = device.begin_commands(cb, false).and_then(|()| {
        device.cmd_queue_ownership(cb, image, OwnershipTransfer::Acquire);
        device.end_commands(cb)
    });
    if let Err(e) = recorded {
        device.free_command_buffer(QueueKind::Present, cb);
        return Err(e);
    }
    Ok(cb)
}

impl<D: Device> SwapchainImage<D> {
    fn create(
        device: &D,
        image: D::Image,
        config: &SurfaceConfig,
        render_pass: D::RenderPass,
        depth_view: D::ImageView,
        separate_present: bool,
    ) -> GfxResult<Self> {
        let view = device.create_image_view(image, config.format)?;
        let framebuffer = device.create_framebuffer(render_pass, &[view, depth_view], config.extent).map_err(|e| {
            device.destroy_image_view(view);
            e
        })?;
        let command_buffer = device.allocate_command_buffer(QueueKind::Graphics).map_err(|e| {
            device.destroy_framebuffer(framebuffer);
            device.destroy_image_view(view);
            e
        })?;
        let present_command_buffer = if separate_present {
            Some(record_ownership_acquire(device, image).map_err(|e| {
                device.free_command_buffer(QueueKind::Graphics, command_buffer);
                device.destroy_framebuffer(framebuffer);
                device.destroy_image_view(view);
                e
            })?)
        } else {
            None
        };
        Ok(Self { image, view, framebuffer, command_buffer, present_command_buffer })
    }

    fn destroy(self, device: &D) {
        if let Some(cb) = self.present_command_buffer {
            device.free_command_buffer(QueueKind::Present, cb);
        }
        device.free_command_buffer(QueueKind::Graphics, self.command_buffer);
        device.destroy_framebuffer(self.framebuffer);
        device.destroy_image_view(self.view);
    }
}

/// Everything created for one swapchain generation
pub struct SwapchainResources<D: Device> {
    /// Device swapchain
    pub swapchain: D::Swapchain,
    /// Parameters it was created with
    pub config: SurfaceConfig,
    /// Render pass shared by every image
    pub render_pass: D::RenderPass,
    depth: ImageResource<D>,
    /// Per-image bundles, indexed by acquired image index
    pub images: Vec<SwapchainImage<D>>,
}

/// Resources made so far by a creation attempt
struct Partial<D: Device> {
    swapchain: Option<D::Swapchain>,
    render_pass: Option<D::RenderPass>,
    depth: Option<ImageResource<D>>,
    images: Vec<SwapchainImage<D>>,
}

impl<D: Device> Partial<D> {
    fn destroy(self, device: &D) {
        for image in self.images {
            image.destroy(device);
        }
        if let Some(depth) = self.depth {
            depth.destroy(device);
        }
        if let Some(pass) = self.render_pass {
            device.destroy_render_pass(pass);
        }
        if let Some(swapchain) = self.swapchain {
            device.destroy_swapchain(swapchain);
        }
    }
}

impl<D: Device> SwapchainResources<D> {
    fn create(
        device: &D,
        transfer: &mut TransferEngine<D>,
        config: &SurfaceConfig,
        old: Option<D::Swapchain>,
        separate_present: bool,
    ) -> GfxResult<Self> {
        let mut partial = Partial { swapchain: None, render_pass: None, depth: None, images: Vec::new() };
        match Self::fill(&mut partial, device, transfer, config, old, separate_present) {
            Ok(()) => match partial {
                Partial { swapchain: Some(swapchain), render_pass: Some(render_pass), depth: Some(depth), images } => {
                    Ok(Self { swapchain, config: *config, render_pass, depth, images })
                }
                incomplete => {
                    incomplete.destroy(device);
                    Err(GfxError::Unknown("swapchain creation finished incomplete".to_string()))
                }
            },
            Err(e) => {
                partial.destroy(device);
                Err(e)
            }
        }
    }

    fn fill(
        partial: &mut Partial<D>,
        device: &D,
        transfer: &mut TransferEngine<D>,
        config: &SurfaceConfig,
        old: Option<D::Swapchain>,
        separate_present: bool,
    ) -> GfxResult<()> {
        let swapchain = *partial.swapchain.insert(device.create_swapchain(config, old)?);

        let depth_info = ImageInfo {
            extent: Extent3D::from(config.extent),
            format: DEPTH_FORMAT,
            usage: ImageUsage::DEPTH_ATTACHMENT,
        };
        let depth_view = partial.depth.insert(ImageResource::create(device, transfer, &depth_info, None)?).view;

        let pass = RenderPassDesc {
            colors: vec![ColorAttachmentDesc { format: config.format, final_state: ImageState::Present }],
            depth: Some(DEPTH_FORMAT),
        };
        let render_pass = *partial.render_pass.insert(device.create_render_pass(&pass)?);

        for image in device.swapchain_images(swapchain)? {
            let bundle = SwapchainImage::create(device, image, config, render_pass, depth_view, separate_present)?;
            partial.images.push(bundle);
        }
        Ok(())
    }

    /// Release every bundle, the depth buffer, the render pass and the swapchain
    pub fn destroy(self, device: &D) {
        Partial { swapchain: Some(self.swapchain), render_pass: Some(self.render_pass), depth: Some(self.depth), images: self.images }
            .destroy(device);
    }
}

/// Whether the swapchain matches the surface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapchainState {
    /// Usable for acquire and present
    Ready,
    /// Must be recreated before the next acquire
    Stale,
}

/// Owner of the current swapchain generation and its resize sequence
pub struct SwapchainManager<D: Device> {
    resources: Option<SwapchainResources<D>>,
    state: SwapchainState,
    requested: Extent2D,
    vsync: bool,
    separate_present: bool,
    generation: u64,
}

impl<D: Device> SwapchainManager<D> {
    /// Create the first swapchain for a window of `requested` size
    pub fn new(device: &D, transfer: &mut TransferEngine<D>, requested: Extent2D, vsync: bool) -> GfxResult<Self> {
        let mut manager = Self {
            resources: None,
            state: SwapchainState::Stale,
            requested,
            vsync,
            separate_present: device.capabilities().separate_present_queue,
            generation: 0,
        };
        manager.recreate(device, transfer)?;
        Ok(manager)
    }

    /// Current state
    pub fn state(&self) -> SwapchainState {
        self.state
    }

    /// Current resources, absent while minimized or after a failed resize
    pub fn resources(&self) -> Option<&SwapchainResources<D>> {
        self.resources.as_ref()
    }

    /// Image bundle for an acquired index
    pub fn image(&self, index: u32) -> Option<&SwapchainImage<D>> {
        self.resources.as_ref().and_then(|r| r.images.get(index as usize))
    }

    /// Extent of the current swapchain, or the last requested one
    pub fn extent(&self) -> Extent2D {
        self.resources.as_ref().map_or(self.requested, |r| r.config.extent)
    }

    /// Colour format of the current swapchain
    pub fn format(&self) -> Option<Format> {
        self.resources.as_ref().map(|r| r.config.format)
    }

    /// Number of successful creations; changes whenever the images are replaced
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Number of successful recreations after the first
    pub fn resize_count(&self) -> u64 {
        self.generation.saturating_sub(1)
    }

    /// Whether presentation waits for vertical blank
    pub fn vsync(&self) -> bool {
        self.vsync
    }

    /// Whether images are handed to a separate present queue
    pub fn separate_present(&self) -> bool {
        self.separate_present
    }

    /// Force recreation before the next acquire
    pub fn mark_stale(&mut self) {
        self.state = SwapchainState::Stale;
    }

    /// Record a platform size report
    pub fn request_extent(&mut self, extent: Extent2D) {
        self.requested = extent;
        self.mark_stale();
    }

    /// Change the present mode preference
    pub fn set_vsync(&mut self, vsync: bool) {
        if self.vsync != vsync {
            self.vsync = vsync;
            self.mark_stale();
        }
    }

    /// Run the resize sequence.
    ///
    /// Returns `Ok(false)` when the surface has no area and nothing was created.
    /// The previous swapchain is retired by the attempt, so its resources are
    /// released whether or not the new ones could be made.
    pub fn recreate(&mut self, device: &D, transfer: &mut TransferEngine<D>) -> GfxResult<bool> {
        device.wait_idle()?;
        let support = device.surface_support()?;
        let config = choose_surface_config(&support, self.requested, self.vsync)?;
        if config.extent.is_zero() {
            log::debug!("Surface has zero extent, swapchain left stale");
            self.state = SwapchainState::Stale;
            return Ok(false);
        }

        let old = self.resources.take();
        let created = SwapchainResources::create(device, transfer, &config, old.as_ref().map(|r| r.swapchain), self.separate_present);
        // Passing the old handle retired it, so it cannot be presented again even
        // if creation failed.
        if let Some(old) = old {
            old.destroy(device);
        }

        match created {
            Ok(resources) => {
                log::info!(
                    "Swapchain {}: {}x{} {:?} {:?}, {} images",
                    if self.generation == 0 { "created" } else { "recreated" },
                    config.extent.width,
                    config.extent.height,
                    config.format,
                    config.present_mode,
                    resources.images.len()
                );
                self.generation += 1;
                self.resources = Some(resources);
                self.state = SwapchainState::Ready;
                Ok(true)
            }
            Err(e) => {
                log::warn!("Swapchain recreation failed: {e}");
                self.state = SwapchainState::Stale;
                Err(e)
            }
        }
    }

    /// Acquire the next image, rerunning the resize sequence while out of date.
    ///
    /// Callers compare [`Self::generation`] before and after to learn whether the
    /// images were replaced.
    pub fn acquire(&mut self, device: &D, transfer: &mut TransferEngine<D>, signal: D::Semaphore) -> GfxResult<u32> {
        for _ in 0..MAX_ACQUIRE_ATTEMPTS {
            if (self.state == SwapchainState::Stale || self.resources.is_none()) && !self.recreate(device, transfer)? {
                return Err(GfxError::ZeroFramebufferSize);
            }
            let Some(resources) = self.resources.as_ref() else {
                continue;
            };
            match device.acquire_next_image(resources.swapchain, signal)? {
                AcquireOutcome::Acquired { index, suboptimal } => {
                    if suboptimal {
                        log::warn!("Swapchain suboptimal, recreating after this frame");
                        self.mark_stale();
                    }
                    return Ok(index);
                }
                AcquireOutcome::OutOfDate => {
                    log::debug!("Swapchain out of date on acquire");
                    self.mark_stale();
                }
            }
        }
        Err(GfxError::Unknown("swapchain stayed out of date".to_string()))
    }

    /// Present an image; out-of-date and suboptimal results only mark the swapchain stale
    pub fn present(&mut self, device: &D, index: u32, wait: D::Semaphore) -> GfxResult<()> {
        let resources = self.resources.as_ref().ok_or(GfxError::InvalidUsage("present without a swapchain"))?;
        match device.present(resources.swapchain, index, wait)? {
            PresentOutcome::Presented => {}
            PresentOutcome::Suboptimal => {
                log::warn!("Swapchain suboptimal on present");
                self.mark_stale();
            }
            PresentOutcome::OutOfDate => {
                log::debug!("Swapchain out of date on present");
                self.mark_stale();
            }
        }
        Ok(())
    }

    /// Release the current resources; the device must be idle
    pub fn destroy(self, device: &D) {
        if let Some(resources) = self.resources {
            resources.destroy(device);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::headless::{FailPoint, HeadlessConfig, HeadlessDevice, LiveObjects};

    fn support() -> SurfaceSupport {
        SurfaceSupport {
            formats: vec![Format::Rgba8Unorm, Format::Rgba8Srgb],
            present_modes: vec![PresentMode::Fifo, PresentMode::Immediate],
            min_image_count: 2,
            max_image_count: 0,
            current_extent: None,
            min_extent: Extent2D::new(16, 16),
            max_extent: Extent2D::new(1024, 1024),
            supports_identity: false,
            current_transform: SurfaceTransform(4),
            composite_alpha: vec![CompositeAlpha::Inherit, CompositeAlpha::PreMultiplied],
        }
    }

    #[test]
    fn test_surface_preferences() {
        let config = choose_surface_config(&support(), Extent2D::new(4000, 8), false).unwrap();
        assert_eq!(config.format, Format::Rgba8Srgb);
        assert_eq!(config.present_mode, PresentMode::Immediate);
        assert_eq!(config.extent, Extent2D::new(1024, 16));
        assert_eq!(config.image_count, 3);
        assert_eq!(config.transform, SurfaceTransform(4));
        assert_eq!(config.composite_alpha, CompositeAlpha::PreMultiplied);

        let vsync = choose_surface_config(&support(), Extent2D::new(100, 100), true).unwrap();
        assert_eq!(vsync.present_mode, PresentMode::Fifo);
    }

    #[test]
    fn test_surface_limits() {
        let mut fixed = support();
        fixed.current_extent = Some(Extent2D::new(640, 480));
        fixed.max_image_count = 2;
        fixed.present_modes = vec![PresentMode::Fifo];
        let config = choose_surface_config(&fixed, Extent2D::new(1, 1), false).unwrap();
        assert_eq!(config.extent, Extent2D::new(640, 480));
        assert_eq!(config.image_count, 2);
        assert_eq!(config.present_mode, PresentMode::Fifo);

        fixed.formats.clear();
        assert_eq!(choose_surface_config(&fixed, Extent2D::new(1, 1), false), Err(GfxError::FormatNotSupported));
    }

    #[test]
    fn test_recreate_same_extent_is_equivalent() {
        let device = HeadlessDevice::new(HeadlessConfig::default());
        let mut transfer = TransferEngine::new(&device, 0).unwrap();
        let mut manager = SwapchainManager::new(&device, &mut transfer, Extent2D::new(800, 600), true).unwrap();
        let first = manager.resources().unwrap().config;
        let live = device.live_objects();

        manager.recreate(&device, &mut transfer).unwrap();
        manager.recreate(&device, &mut transfer).unwrap();
        assert_eq!(manager.resources().unwrap().config, first);
        assert_eq!(device.live_objects(), live);
        assert_eq!(manager.resize_count(), 2);

        manager.destroy(&device);
        transfer.destroy(&device);
        assert_eq!(device.live_objects(), LiveObjects::default());
        assert!(device.validation_errors().is_empty());
    }

    #[test]
    fn test_failed_recreate_releases_old_and_recovers() {
        let device = HeadlessDevice::new(HeadlessConfig::default());
        let mut transfer = TransferEngine::new(&device, 0).unwrap();
        let mut manager = SwapchainManager::new(&device, &mut transfer, Extent2D::new(800, 600), false).unwrap();

        device.fail_nth(FailPoint::CreateRenderPass, 1, GfxError::OutOfHostMemory);
        assert_eq!(manager.recreate(&device, &mut transfer), Err(GfxError::OutOfHostMemory));
        assert_eq!(manager.state(), SwapchainState::Stale);
        assert!(manager.resources().is_none());
        let live = device.live_objects();
        assert_eq!((live.swapchains, live.render_passes, live.framebuffers), (0, 0, 0));

        assert!(manager.recreate(&device, &mut transfer).unwrap());
        assert_eq!(manager.state(), SwapchainState::Ready);
        manager.destroy(&device);
        transfer.destroy(&device);
        assert!(device.validation_errors().is_empty());
    }

    #[test]
    fn test_zero_extent_stays_stale() {
        let device = HeadlessDevice::new(HeadlessConfig::default());
        let mut transfer = TransferEngine::new(&device, 0).unwrap();
        let mut manager = SwapchainManager::new(&device, &mut transfer, Extent2D::new(800, 600), false).unwrap();
        device.set_surface_extent(Extent2D::new(0, 0));
        manager.request_extent(Extent2D::new(0, 0));
        assert_eq!(manager.recreate(&device, &mut transfer), Ok(false));
        assert_eq!(manager.state(), SwapchainState::Stale);
        assert!(manager.resources().is_some());
        manager.destroy(&device);
        transfer.destroy(&device);
    }

    #[test]
    fn test_acquire_recreates_when_out_of_date() {
        let device = HeadlessDevice::new(HeadlessConfig::default());
        let mut transfer = TransferEngine::new(&device, 0).unwrap();
        let mut manager = SwapchainManager::new(&device, &mut transfer, Extent2D::new(800, 600), false).unwrap();
        let semaphore = device.create_semaphore().unwrap();

        device.set_surface_extent(Extent2D::new(1024, 768));
        let generation = manager.generation();
        let index = manager.acquire(&device, &mut transfer, semaphore).unwrap();
        assert_eq!(index, 0);
        assert_eq!(manager.generation(), generation + 1);
        assert_eq!(manager.extent(), Extent2D::new(1024, 768));

        device.wait_idle().unwrap();
        device.destroy_semaphore(semaphore);
        manager.destroy(&device);
        transfer.destroy(&device);
    }

    #[test]
    fn test_separate_present_queue_bundles() {
        let device = HeadlessDevice::new(HeadlessConfig { separate_present_queue: true, ..HeadlessConfig::default() });
        let mut transfer = TransferEngine::new(&device, 0).unwrap();
        let manager = SwapchainManager::new(&device, &mut transfer, Extent2D::new(800, 600), false).unwrap();
        let resources = manager.resources().unwrap();
        assert!(resources.images.iter().all(|i| i.present_command_buffer.is_some()));
        assert_eq!(device.live_objects().command_buffers, resources.images.len() * 2);
        manager.destroy(&device);
        transfer.destroy(&device);
        assert!(device.validation_errors().is_empty());
    }
}
