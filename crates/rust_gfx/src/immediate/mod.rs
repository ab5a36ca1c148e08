//! OpenGL backend
//!
//! GL is reached through the [`GlApi`] trait so the backend can run against a real
//! [`glow::Context`] or the in-memory [`recording::RecordingGl`] used by tests.
//! The window side is the [`GlSurface`] trait: whoever owns the window swaps its
//! buffers and reports its size.

mod api;
mod backend;
mod convert;
pub mod recording;

pub use api::GlApi;
pub use backend::{ImmediateBackend, MAX_PUSH_CONSTANT_SIZE, PUSH_CONSTANT_BINDING};

use crate::types::Extent2D;

/// The window a GL context presents to
pub trait GlSurface {
    /// Present the back buffer
    fn swap_buffers(&mut self) -> Result<(), String>;
    /// Frames to wait per swap; 0 disables vertical sync
    fn set_swap_interval(&mut self, interval: u32);
    /// Framebuffer size in pixels
    fn extent(&self) -> Extent2D;
}
