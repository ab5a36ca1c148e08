//! Checkerboard demo
//!
//! Draws a scrolling checkerboard texture on a full-window quad with whichever
//! backend is available. Pass `vulkan`, `opengl` or `headless` to override the
//! backend chosen by `checkerboard.toml` (or auto-detection when it is absent).
//!
//! Keys: `Escape` quits, `V` toggles vertical sync.

mod window;

use std::time::Instant;

use glfw::{Action, Key, WindowEvent};
use rust_gfx::config::ConfigError;
use rust_gfx::explicit::ExplicitBackend;
use rust_gfx::hal::headless::HeadlessDevice;
use rust_gfx::prelude::*;
use rust_gfx::types::SamplerKey;
use thiserror::Error;

use crate::window::{ClientApi, Window, WindowError};

const CONFIG_PATH: &str = "checkerboard.toml";
const TEXTURE_SIZE: u32 = 256;
const TILE_SIZE: u32 = 32;
const HEADLESS_FRAMES: u32 = 120;

/// Position and texture coordinate of each corner, two triangles
#[rustfmt::skip]
const QUAD: [f32; 24] = [
    -1.0, -1.0, 0.0, 0.0,
     1.0, -1.0, 1.0, 0.0,
     1.0,  1.0, 1.0, 1.0,
    -1.0, -1.0, 0.0, 0.0,
     1.0,  1.0, 1.0, 1.0,
    -1.0,  1.0, 0.0, 1.0,
];

#[derive(Error, Debug)]
enum AppError {
    #[error("window: {0}")]
    Window(#[from] WindowError),

    #[error("graphics: {0}")]
    Gfx(#[from] GfxError),

    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("unknown backend '{0}', expected vulkan, opengl or headless")]
    UnknownBackend(String),
}

type AppResult<T> = Result<T, AppError>;

/// GPU objects of the checkerboard quad
struct Checkerboard {
    texture: ImageKey,
    sampler: SamplerKey,
    quad: BufferKey,
    pipeline: PipelineKey,
}

fn checkerboard_texels(size: u32, tile: u32) -> Vec<u8> {
    let mut texels = Vec::with_capacity((size * size * 4) as usize);
    for y in 0..size {
        for x in 0..size {
            let light = ((x / tile) + (y / tile)) % 2 == 0;
            let rgba = if light { [0xe0, 0xe0, 0xe0, 0xff] } else { [0x20, 0x20, 0x30, 0xff] };
            texels.extend_from_slice(&rgba);
        }
    }
    texels
}

fn shader_sources(kind: BackendKind) -> AppResult<(ShaderSource, ShaderSource)> {
    match kind {
        BackendKind::Explicit => Ok((
            ShaderSource::load(concat!(env!("OUT_DIR"), "/quad.vert.spv"))?,
            ShaderSource::load(concat!(env!("OUT_DIR"), "/quad.frag.spv"))?,
        )),
        BackendKind::Immediate => Ok((
            ShaderSource::Glsl(include_str!("../shaders/gl/quad.vert").to_string()),
            ShaderSource::Glsl(include_str!("../shaders/gl/quad.frag").to_string()),
        )),
    }
}

impl Checkerboard {
    fn new(gfx: &mut Gfx) -> AppResult<Self> {
        let texels = checkerboard_texels(TEXTURE_SIZE, TILE_SIZE);
        let texture =
            gfx.create_image(&ImageInfo::texture_2d(TEXTURE_SIZE, TEXTURE_SIZE, Format::Rgba8Unorm), Some(&texels))?;
        let sampler = gfx.create_sampler(&SamplerInfo::default())?;
        let quad = gfx.create_buffer(
            &BufferInfo::constant(std::mem::size_of_val(&QUAD) as u64, BufferUsage::VERTEX),
            Some(bytemuck::cast_slice(&QUAD)),
        )?;

        let (vertex, fragment) = shader_sources(gfx.kind())?;
        let vertex = gfx.create_shader(ShaderStage::Vertex, &vertex)?;
        let fragment = gfx.create_shader(ShaderStage::Fragment, &fragment)?;
        let info = GraphicsPipelineInfo::new(vertex, fragment)
            .with_vertex_layout(
                VertexLayout::new(16)
                    .with_attribute(0, VertexFormat::Float2, 0)
                    .with_attribute(1, VertexFormat::Float2, 8),
            )
            .with_state(FixedFunctionState {
                cull_mode: CullMode::None,
                depth_test: false,
                depth_write: false,
                ..FixedFunctionState::default()
            })
            .with_resources(
                ResourceLayout::default().with_binding(0, BindingType::SampledImage).with_push_constants(8),
            );
        let framebuffer = gfx.default_framebuffer();
        let pipeline = gfx.create_graphics_pipeline(framebuffer, info)?;
        // Pipelines hold their own reference to the modules
        gfx.destroy_shader(vertex)?;
        gfx.destroy_shader(fragment)?;

        log::info!("Checkerboard ready: {TEXTURE_SIZE}x{TEXTURE_SIZE} texture, {TILE_SIZE}px tiles");
        Ok(Self { texture, sampler, quad, pipeline })
    }

    fn draw(&self, gfx: &mut Gfx, scroll: [f32; 2]) -> GfxResult<()> {
        let framebuffer = gfx.default_framebuffer();
        gfx.begin_record()?;
        gfx.begin_render_pass(framebuffer, &ClearValues { color: [0.05, 0.05, 0.08, 1.0], depth: 1.0 })?;
        let texture = ResourceBinding { binding: 0, resource: BoundResource::SampledImage(self.texture, self.sampler) };
        gfx.bind_pipeline(self.pipeline, &[texture])?;
        gfx.draw_mesh(&MeshDraw::vertices(Some(self.quad), 6).with_push_constants(bytemuck::bytes_of(&scroll)))?;
        gfx.end_render_pass()?;
        gfx.end_record()
    }
}

fn scroll_at(start: Instant) -> [f32; 2] {
    let t = start.elapsed().as_secs_f32() * 0.05;
    [t, t * 0.5]
}

/// Draw one frame, logging frames the backend had to skip
fn present(gfx: &mut Gfx, scene: &Checkerboard, scroll: [f32; 2]) -> AppResult<()> {
    match scene.draw(gfx, scroll) {
        Ok(()) => Ok(()),
        Err(e) if e.is_fatal() => Err(e.into()),
        Err(e) => {
            log::warn!("Frame skipped: {e}");
            Ok(())
        }
    }
}

fn run_windowed(config: &GfxConfig, kind: BackendKind) -> AppResult<()> {
    let api = match kind {
        BackendKind::Explicit => ClientApi::Vulkan,
        BackendKind::Immediate => ClientApi::OpenGl,
    };
    let mut window = Window::new(&config.window, api)?;
    let mut gfx = match kind {
        BackendKind::Explicit => Gfx::vulkan(config, &window.vulkan_surface(), window.framebuffer_extent())?,
        BackendKind::Immediate => Gfx::opengl(config, window.load_gl(), window.gl_surface())?,
    };
    let scene = Checkerboard::new(&mut gfx)?;

    let start = Instant::now();
    let mut vsync = config.vsync;
    let mut resized = false;
    while !window.should_close() {
        for event in window.poll_events() {
            match event {
                WindowEvent::Key(Key::Escape, _, Action::Press, _) | WindowEvent::Close => {
                    window.set_should_close(true);
                }
                WindowEvent::Key(Key::V, _, Action::Press, _) => {
                    vsync = !vsync;
                    log::info!("Vertical sync {}", if vsync { "on" } else { "off" });
                    gfx.set_vsync(vsync)?;
                }
                WindowEvent::FramebufferSize(..) => resized = true,
                _ => {}
            }
        }

        if resized {
            let extent = window.framebuffer_extent();
            if extent.is_zero() {
                // Minimized; nothing can be presented until the window has area again
                window.wait_events();
                continue;
            }
            gfx.resize(extent)?;
            resized = false;
        }

        present(&mut gfx, &scene, scroll_at(start))?;
    }

    gfx.wait_idle()?;
    gfx.shutdown();
    Ok(())
}

fn run_headless(config: &GfxConfig) -> AppResult<()> {
    let device = HeadlessConfig {
        surface_extent: Extent2D::new(config.window.width, config.window.height),
        ..HeadlessConfig::default()
    };
    let mut gfx = Gfx::headless(config, device)?;
    let scene = Checkerboard::new(&mut gfx)?;

    let start = Instant::now();
    for _ in 0..HEADLESS_FRAMES {
        present(&mut gfx, &scene, scroll_at(start))?;
    }

    if let Some(backend) = gfx.downcast_ref::<ExplicitBackend<HeadlessDevice>>() {
        let stats = backend.frame_stats();
        log::info!(
            "Headless run: {} frames submitted, {} skipped, staging {} bytes",
            stats.frames_submitted,
            stats.skipped_frames,
            backend.staging_stats().capacity
        );
        for error in backend.device().validation_errors() {
            log::error!("Validation: {error}");
        }
    }
    gfx.shutdown();
    Ok(())
}

fn parse_backend(arg: &str) -> AppResult<BackendPreference> {
    match arg.to_ascii_lowercase().as_str() {
        "vulkan" => Ok(BackendPreference::Vulkan),
        "opengl" | "gl" => Ok(BackendPreference::OpenGl),
        "headless" => Ok(BackendPreference::Headless),
        "auto" => Ok(BackendPreference::Auto),
        _ => Err(AppError::UnknownBackend(arg.to_string())),
    }
}

fn main() -> AppResult<()> {
    rust_gfx::logging::init();

    let mut config = GfxConfig::load_or_default(CONFIG_PATH)?;
    if config.application_name.is_empty() {
        config.application_name = "checkerboard".to_string();
    }
    if let Some(arg) = std::env::args().nth(1) {
        config.backend = parse_backend(&arg)?;
    }

    let result = if config.backend == BackendPreference::Headless {
        run_headless(&config)
    } else {
        let kind = BackendKind::detect(config.backend);
        log::info!("Starting checkerboard demo on the {kind:?} backend");
        run_windowed(&config, kind)
    };

    if let Err(e) = &result {
        log::error!("Checkerboard demo failed: {e}");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkerboard_tiles_alternate() {
        let texels = checkerboard_texels(64, 16);
        let texel = |x: usize, y: usize| &texels[(y * 64 + x) * 4..(y * 64 + x) * 4 + 4];

        assert_eq!(texels.len(), 64 * 64 * 4);
        assert_eq!(texel(0, 0), texel(16, 16));
        assert_ne!(texel(0, 0), texel(16, 0));
        assert_ne!(texel(0, 0), texel(0, 16));
    }

    #[test]
    fn test_backend_argument() {
        assert_eq!(parse_backend("OpenGL").unwrap(), BackendPreference::OpenGl);
        assert_eq!(parse_backend("headless").unwrap(), BackendPreference::Headless);
        assert!(matches!(parse_backend("metal"), Err(AppError::UnknownBackend(_))));
    }

    #[test]
    fn test_quad_covers_clip_space() {
        let positions: Vec<[f32; 2]> = QUAD.chunks_exact(4).map(|v| [v[0], v[1]]).collect();

        assert_eq!(positions.len(), 6);
        assert!(positions.iter().all(|p| p[0].abs() == 1.0 && p[1].abs() == 1.0));
    }
}
