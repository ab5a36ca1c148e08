//! Explicit backend
//!
//! Everything here is written against the [`Device`](crate::hal::Device) trait, so
//! the same code runs on Vulkan hardware and on the headless device.

/// Frame ring and its synchronization objects
pub mod frame;
/// Shared staging buffer and one-shot transfers
pub mod staging;
/// Buffers, images and shaders
pub mod resources;
/// Acceleration structures and shader binding tables
pub mod raytracing;
/// Graphics, compute and ray tracing pipelines
pub mod pipeline;
/// Window and offscreen framebuffers
pub mod framebuffer;
/// Swapchain lifecycle
pub mod swapchain;
/// The backend tying it all together
pub mod context;

pub use context::{ExplicitBackend, FrameStats};
pub use frame::FRAME_LAG;
pub use staging::StagingStats;
pub use swapchain::SwapchainState;
