//! # rust_gfx
//!
//! A graphics backend abstraction with one API over two kinds of GPU interface.
//!
//! ## Features
//!
//! - **Explicit backend**: Vulkan with a frame ring, swapchain recreation, a shared
//!   staging buffer and hardware ray tracing
//! - **Immediate backend**: OpenGL 4.3 through the same [`Backend`] trait
//! - **Headless device**: a software Vulkan-shaped device for tests and CI
//! - **Keyed resources**: every object is a slotmap key owned by the context
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rust_gfx::prelude::*;
//!
//! fn main() -> GfxResult<()> {
//!     let config = GfxConfig::new("quick start");
//!     let mut gfx = Gfx::headless(&config, HeadlessConfig::default())?;
//!
//!     let fb = gfx.default_framebuffer();
//!     gfx.begin_record()?;
//!     gfx.begin_render_pass(fb, &ClearValues::default())?;
//!     gfx.end_render_pass()?;
//!     gfx.end_record()?;
//!
//!     gfx.shutdown();
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::similar_names, clippy::too_many_arguments)]

pub mod backend;
pub mod config;
pub mod error;
pub mod explicit;
pub mod hal;
pub mod immediate;
pub mod logging;
pub mod pipeline;
pub mod types;

pub use backend::{Backend, BackendKind, Gfx};
pub use error::{GfxError, GfxResult};

/// Common imports for backend users
pub mod prelude {
    pub use crate::{
        backend::{Backend, BackendKind, Gfx},
        config::{BackendPreference, Config, GfxConfig, WindowConfig},
        error::{GfxError, GfxResult},
        hal::headless::HeadlessConfig,
        pipeline::{
            BlendMode, ComputePipelineInfo, CullMode, DefaultHooks, FixedFunctionState, GraphicsPipelineInfo,
            PipelineHooks, RayTracingPipelineInfo, VertexFormat, VertexLayout,
        },
        types::{
            BindingType, BoundResource, BufferInfo, BufferKey, BufferUsage, ClearValues, Extent2D, Format, FrameInfo,
            FramebufferInfo, FramebufferKey, ImageInfo, ImageKey, MeshDraw, PipelineKey, ResourceBinding,
            ResourceLayout, SamplerInfo, ShaderSource, ShaderStage,
        },
    };
}
