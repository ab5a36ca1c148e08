//! One program driven through `Gfx` on both backends

mod common;

use common::{checkerboard, Headless};
use rust_gfx::hal::headless::SPIRV_MAGIC;
use rust_gfx::immediate::recording::{RecordingGl, RecordingSurface};
use rust_gfx::immediate::ImmediateBackend;
use rust_gfx::prelude::*;
use rust_gfx::types::SamplerKey;

const VERTEX_GLSL: &str = "#version 430\nlayout(location = 0) in vec2 pos;\nvoid main() { gl_Position = vec4(pos, 0.0, 1.0); }\n";
const FRAGMENT_GLSL: &str = "#version 430\nout vec4 color;\nvoid main() { color = vec4(1.0); }\n";

struct Scene {
    texture: ImageKey,
    pipeline: PipelineKey,
    quad: BufferKey,
    sampler: SamplerKey,
}

fn shader(gfx: &mut Gfx, stage: ShaderStage, glsl: &str) -> GfxResult<rust_gfx::types::ShaderKey> {
    let source = match gfx.kind() {
        BackendKind::Explicit => ShaderSource::SpirV(vec![SPIRV_MAGIC, 0x0001_0000]),
        BackendKind::Immediate => ShaderSource::Glsl(glsl.to_string()),
    };
    gfx.create_shader(stage, &source)
}

fn setup(gfx: &mut Gfx) -> GfxResult<Scene> {
    let texture = gfx.create_image(&ImageInfo::texture_2d(256, 256, Format::Rgba8Unorm), Some(&checkerboard(256, 32)))?;
    let sampler = gfx.create_sampler(&SamplerInfo::default())?;
    let quad: [f32; 12] = [-1.0, -1.0, 1.0, -1.0, 1.0, 1.0, -1.0, -1.0, 1.0, 1.0, -1.0, 1.0];
    let quad = gfx.create_buffer(&BufferInfo::constant(48, BufferUsage::VERTEX), Some(bytemuck::cast_slice(&quad)))?;
    let vs = shader(gfx, ShaderStage::Vertex, VERTEX_GLSL)?;
    let fs = shader(gfx, ShaderStage::Fragment, FRAGMENT_GLSL)?;
    let info = GraphicsPipelineInfo::new(vs, fs)
        .with_vertex_layout(VertexLayout::new(8).with_attribute(0, VertexFormat::Float2, 0))
        .with_state(FixedFunctionState { cull_mode: CullMode::None, ..FixedFunctionState::default() })
        .with_resources(ResourceLayout::default().with_binding(0, BindingType::SampledImage));
    let fb = gfx.default_framebuffer();
    let pipeline = gfx.create_graphics_pipeline(fb, info)?;
    Ok(Scene { texture, pipeline, quad, sampler })
}

fn draw(gfx: &mut Gfx, scene: &Scene) -> GfxResult<()> {
    let fb = gfx.default_framebuffer();
    gfx.begin_record()?;
    gfx.begin_render_pass(fb, &ClearValues { color: [0.1, 0.1, 0.1, 1.0], depth: 1.0 })?;
    let binding = ResourceBinding { binding: 0, resource: BoundResource::SampledImage(scene.texture, scene.sampler) };
    gfx.bind_pipeline(scene.pipeline, &[binding])?;
    gfx.draw_mesh(&MeshDraw::vertices(Some(scene.quad), 6))?;
    gfx.end_render_pass()?;
    gfx.end_record()
}

#[test]
fn test_checkerboard_on_the_immediate_backend() {
    rust_gfx::logging::init_for_tests();
    let surface = RecordingSurface::new(Extent2D::new(640, 480));
    let mut gfx = Gfx::opengl(&GfxConfig::default(), RecordingGl::new(), Box::new(surface.clone())).unwrap();
    assert_eq!(gfx.kind(), BackendKind::Immediate);

    let scene = setup(&mut gfx).unwrap();
    for _ in 0..3 {
        draw(&mut gfx, &scene).unwrap();
    }

    let backend = gfx.downcast_ref::<ImmediateBackend<RecordingGl>>().unwrap();
    let texture = backend.image_handle(scene.texture).unwrap();
    let (width, height, texels) = backend.gl().texture_contents(texture).unwrap();
    assert_eq!((width, height), (256, 256));
    assert_eq!(texels, checkerboard(256, 32));
    assert_eq!(backend.frame_stats().frames_submitted, 3);
    assert_eq!(surface.log().swaps, 3);
    assert_eq!(surface.log().swap_interval, 1);
}

#[test]
fn test_checkerboard_on_the_explicit_backend() {
    rust_gfx::logging::init_for_tests();
    let mut gfx = Gfx::headless(&GfxConfig::default(), HeadlessConfig::default()).unwrap();
    assert_eq!(gfx.kind(), BackendKind::Explicit);

    let scene = setup(&mut gfx).unwrap();
    for _ in 0..3 {
        draw(&mut gfx, &scene).unwrap();
    }

    let backend = gfx.downcast_ref::<Headless>().unwrap();
    let texture = backend.image_handle(scene.texture).unwrap();
    assert_eq!(backend.device().image_contents(texture).unwrap(), checkerboard(256, 32));
    assert_eq!(backend.frame_stats().frames_submitted, 3);
    assert_eq!(backend.device().validation_errors(), Vec::<String>::new());
}

#[test]
fn test_window_resize_reaches_both_backends() {
    rust_gfx::logging::init_for_tests();
    let extent = Extent2D::new(1280, 720);

    let surface = RecordingSurface::new(Extent2D::new(640, 480));
    let mut gl = Gfx::opengl(&GfxConfig::default(), RecordingGl::new(), Box::new(surface.clone())).unwrap();
    let gl_scene = setup(&mut gl).unwrap();
    surface.set_extent(extent);
    gl.resize(extent).unwrap();
    draw(&mut gl, &gl_scene).unwrap();
    assert_eq!(gl.extent(), extent);

    let mut vk = Gfx::headless(&GfxConfig::default(), HeadlessConfig::default()).unwrap();
    let vk_scene = setup(&mut vk).unwrap();
    vk.downcast_ref::<Headless>().unwrap().device().set_surface_extent(extent);
    vk.resize(extent).unwrap();
    draw(&mut vk, &vk_scene).unwrap();
    assert_eq!(vk.extent(), extent);
}

#[test]
fn test_opengl_has_no_ray_tracing() {
    rust_gfx::logging::init_for_tests();
    let surface = RecordingSurface::new(Extent2D::new(64, 64));
    let mut gfx = Gfx::opengl(&GfxConfig::default(), RecordingGl::new(), Box::new(surface)).unwrap();

    let raygen = gfx.create_shader(ShaderStage::RayGen, &ShaderSource::Glsl(String::new()));

    assert!(raygen.is_err());
    gfx.shutdown();
}
