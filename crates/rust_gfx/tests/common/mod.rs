//! Fixtures shared by the integration tests

#![allow(dead_code)]

use rust_gfx::explicit::ExplicitBackend;
use rust_gfx::hal::headless::{Completion, HeadlessConfig, HeadlessDevice, SPIRV_MAGIC};
use rust_gfx::prelude::*;
use rust_gfx::types::ShaderKey;

/// Explicit backend over the software device
pub type Headless = ExplicitBackend<HeadlessDevice>;

/// Backend whose submissions complete immediately
pub fn headless() -> Headless {
    headless_with(HeadlessConfig::default())
}

/// Backend whose submissions only complete when a fence is waited on
pub fn deferred() -> Headless {
    headless_with(HeadlessConfig { completion: Completion::Deferred, ..HeadlessConfig::default() })
}

pub fn headless_with(config: HeadlessConfig) -> Headless {
    rust_gfx::logging::init_for_tests();
    let extent = config.surface_extent;
    ExplicitBackend::new(HeadlessDevice::new(config), &GfxConfig::default(), extent).expect("headless backend")
}

/// Minimal module the headless device accepts for any stage
pub fn spirv(backend: &mut dyn Backend, stage: ShaderStage) -> ShaderKey {
    backend
        .create_shader(stage, &ShaderSource::SpirV(vec![SPIRV_MAGIC, 0x0001_0000]))
        .expect("shader")
}

/// RGBA8 checkerboard of `size`×`size` texels with `tile`-texel squares
pub fn checkerboard(size: u32, tile: u32) -> Vec<u8> {
    let mut texels = Vec::with_capacity((size * size * 4) as usize);
    for y in 0..size {
        for x in 0..size {
            let on = ((x / tile) + (y / tile)) % 2 == 0;
            let v = if on { 0xff } else { 0x00 };
            texels.extend_from_slice(&[v, v, v, 0xff]);
        }
    }
    texels
}

/// One frame that clears the window and nothing else
pub fn empty_frame(backend: &mut dyn Backend) -> FrameInfo {
    let frame = backend.begin_record().expect("begin_record");
    let fb = backend.default_framebuffer();
    backend.begin_render_pass(fb, &ClearValues::default()).expect("begin_render_pass");
    backend.end_render_pass().expect("end_render_pass");
    backend.end_record().expect("end_record");
    frame
}
