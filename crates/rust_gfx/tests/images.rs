//! Textures, samplers and offscreen framebuffers

mod common;

use common::{checkerboard, headless, spirv};
use rust_gfx::hal::ImageState;
use rust_gfx::prelude::*;
use rust_gfx::types::{ImageUsage, SamplerKey};

#[test]
fn test_checkerboard_texture_upload() {
    let mut gfx = headless();
    let texels = checkerboard(256, 32);

    let image = gfx.create_image(&ImageInfo::texture_2d(256, 256, Format::Rgba8Unorm), Some(&texels)).unwrap();

    let handle = gfx.image_handle(image).unwrap();
    assert_eq!(gfx.device().image_contents(handle).unwrap(), texels);
    assert_eq!(gfx.device().image_state(handle), Some(ImageState::ShaderRead));
    assert_eq!(gfx.device().validation_errors(), Vec::<String>::new());
}

#[test]
fn test_image_update_replaces_every_texel() {
    let mut gfx = headless();
    let image = gfx
        .create_image(&ImageInfo::texture_2d(64, 64, Format::Rgba8Unorm), Some(&checkerboard(64, 8)))
        .unwrap();
    let inverted: Vec<u8> = checkerboard(64, 8).iter().map(|v| if *v == 0 { 0xff } else { *v }).collect();

    gfx.update_image(image, &inverted).unwrap();

    let handle = gfx.image_handle(image).unwrap();
    assert_eq!(gfx.device().image_contents(handle).unwrap(), inverted);
}

#[test]
fn test_image_data_must_cover_the_whole_image() {
    let mut gfx = headless();
    let info = ImageInfo::texture_2d(16, 16, Format::Rgba8Unorm);
    let live = gfx.device().live_objects();

    assert!(matches!(gfx.create_image(&info, Some(&[0; 16])), Err(GfxError::InvalidUsage(_))));
    assert_eq!(gfx.device().live_objects().images, live.images);

    let image = gfx.create_image(&info, None).unwrap();
    assert!(matches!(gfx.update_image(image, &[0; 15]), Err(GfxError::InvalidUsage(_))));
}

#[test]
fn test_zero_sized_image_is_rejected() {
    let mut gfx = headless();

    let result = gfx.create_image(&ImageInfo::texture_2d(0, 16, Format::Rgba8Unorm), None);

    assert_eq!(result, Err(GfxError::ZeroFramebufferSize));
}

#[test]
fn test_storage_image_rests_in_general_state() {
    let mut gfx = headless();
    let info = ImageInfo {
        usage: ImageUsage::STORAGE | ImageUsage::SAMPLED,
        ..ImageInfo::texture_2d(32, 32, Format::Rgba32Float)
    };

    let image = gfx.create_image(&info, None).unwrap();

    let handle = gfx.image_handle(image).unwrap();
    assert_eq!(gfx.device().image_state(handle), Some(ImageState::General));
}

#[test]
fn test_sampled_texture_binds_in_a_frame() {
    let mut gfx = headless();
    let vs = spirv(&mut gfx, ShaderStage::Vertex);
    let fs = spirv(&mut gfx, ShaderStage::Fragment);
    let fb = gfx.default_framebuffer();
    let texture = gfx
        .create_image(&ImageInfo::texture_2d(128, 128, Format::Rgba8Unorm), Some(&checkerboard(128, 16)))
        .unwrap();
    let sampler: SamplerKey = gfx.create_sampler(&SamplerInfo::default()).unwrap();
    let info = GraphicsPipelineInfo::new(vs, fs)
        .with_resources(ResourceLayout::default().with_binding(0, BindingType::SampledImage));
    let pipeline = gfx.create_graphics_pipeline(fb, info).unwrap();
    let bindings = [ResourceBinding { binding: 0, resource: BoundResource::SampledImage(texture, sampler) }];

    for _ in 0..4 {
        gfx.begin_record().unwrap();
        gfx.begin_render_pass(fb, &ClearValues::default()).unwrap();
        gfx.bind_pipeline(pipeline, &bindings).unwrap();
        gfx.draw_mesh(&MeshDraw::vertices(None, 6)).unwrap();
        gfx.end_render_pass().unwrap();
        gfx.end_record().unwrap();
    }

    assert_eq!(gfx.device().validation_errors(), Vec::<String>::new());
}

#[test]
fn test_binding_type_mismatch_is_rejected() {
    let mut gfx = headless();
    let vs = spirv(&mut gfx, ShaderStage::Vertex);
    let fs = spirv(&mut gfx, ShaderStage::Fragment);
    let fb = gfx.default_framebuffer();
    let uniform = gfx.create_buffer(&BufferInfo::dynamic(64, BufferUsage::UNIFORM), None).unwrap();
    let info = GraphicsPipelineInfo::new(vs, fs)
        .with_resources(ResourceLayout::default().with_binding(0, BindingType::SampledImage));
    let pipeline = gfx.create_graphics_pipeline(fb, info).unwrap();

    gfx.begin_record().unwrap();
    gfx.begin_render_pass(fb, &ClearValues::default()).unwrap();
    let bound = gfx.bind_pipeline(pipeline, &[ResourceBinding { binding: 0, resource: BoundResource::UniformBuffer(uniform) }]);
    assert!(matches!(bound, Err(GfxError::InvalidUsage(_))));
    gfx.end_render_pass().unwrap();
    gfx.end_record().unwrap();
}

#[test]
fn test_offscreen_framebuffer_keeps_attachment_keys_across_resize() {
    let mut gfx = headless();
    let info = FramebufferInfo {
        extent: Extent2D::new(256, 256),
        color_formats: vec![Format::Rgba8Unorm, Format::Rgba16Float],
        depth_format: Some(Format::D32Float),
    };
    let fb = gfx.create_framebuffer(&info).unwrap();
    let first = gfx.framebuffer_attachment(fb, 0).unwrap();
    let second = gfx.framebuffer_attachment(fb, 1).unwrap();
    assert_eq!(gfx.framebuffer_attachment(fb, 2), None);
    let live = gfx.device().live_objects();

    gfx.resize_framebuffer(fb, Extent2D::new(512, 384)).unwrap();

    assert_eq!(gfx.framebuffer_attachment(fb, 0), Some(first));
    assert_eq!(gfx.framebuffer_attachment(fb, 1), Some(second));
    let after = gfx.device().live_objects();
    assert_eq!(after.images, live.images);
    assert_eq!(after.framebuffers, live.framebuffers);
    assert!(matches!(gfx.destroy_image(first), Err(GfxError::InvalidUsage(_))));
}

#[test]
fn test_render_to_texture_then_sample_it() {
    let mut gfx = headless();
    let vs = spirv(&mut gfx, ShaderStage::Vertex);
    let fs = spirv(&mut gfx, ShaderStage::Fragment);
    let offscreen = gfx
        .create_framebuffer(&FramebufferInfo {
            extent: Extent2D::new(128, 128),
            color_formats: vec![Format::Rgba8Unorm],
            depth_format: None,
        })
        .unwrap();
    let color = gfx.framebuffer_attachment(offscreen, 0).unwrap();
    let sampler = gfx.create_sampler(&SamplerInfo::default()).unwrap();
    let window = gfx.default_framebuffer();
    let fill = gfx.create_graphics_pipeline(offscreen, GraphicsPipelineInfo::new(vs, fs)).unwrap();
    let blit = gfx
        .create_graphics_pipeline(
            window,
            GraphicsPipelineInfo::new(vs, fs)
                .with_resources(ResourceLayout::default().with_binding(0, BindingType::SampledImage)),
        )
        .unwrap();

    for _ in 0..3 {
        gfx.begin_record().unwrap();
        gfx.begin_render_pass(offscreen, &ClearValues { color: [1.0, 0.0, 0.0, 1.0], depth: 1.0 }).unwrap();
        gfx.bind_pipeline(fill, &[]).unwrap();
        gfx.draw_mesh(&MeshDraw::vertices(None, 3)).unwrap();
        gfx.end_render_pass().unwrap();

        gfx.begin_render_pass(window, &ClearValues::default()).unwrap();
        assert!(matches!(gfx.bind_pipeline(fill, &[]), Err(GfxError::InvalidUsage(_))));
        gfx.bind_pipeline(blit, &[ResourceBinding { binding: 0, resource: BoundResource::SampledImage(color, sampler) }])
            .unwrap();
        gfx.draw_mesh(&MeshDraw::vertices(None, 3)).unwrap();
        gfx.end_render_pass().unwrap();
        gfx.end_record().unwrap();
    }

    assert_eq!(gfx.device().validation_errors(), Vec::<String>::new());
}
