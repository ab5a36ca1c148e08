//! Acceleration structures, ray tracing pipelines and trace dispatch

mod common;

use common::{headless, headless_with, spirv, Headless};
use rust_gfx::hal::headless::{FailPoint, HeadlessConfig};
use rust_gfx::prelude::*;
use rust_gfx::types::{RtInstance, RtMeshKey, TriangleGeometry};

const TRIANGLE: [f32; 9] = [0.0, 1.0, 0.0, -1.0, -1.0, 0.0, 1.0, -1.0, 0.0];

fn geometry_buffer(gfx: &mut Headless) -> BufferKey {
    let info = BufferInfo::constant(36, BufferUsage::VERTEX | BufferUsage::ACCELERATION_STRUCTURE_INPUT);
    gfx.create_buffer(&info, Some(bytemuck::cast_slice(&TRIANGLE))).unwrap()
}

fn triangle(vertex_buffer: BufferKey) -> TriangleGeometry {
    TriangleGeometry {
        vertex_buffer,
        vertex_stride: 12,
        vertex_count: 3,
        index_buffer: None,
        triangle_count: 1,
        opaque: true,
    }
}

fn mesh(gfx: &mut Headless) -> RtMeshKey {
    let vb = geometry_buffer(gfx);
    gfx.create_rt_mesh(&triangle(vb)).unwrap()
}

#[test]
fn test_mesh_and_scene_are_built() {
    let mut gfx = headless();
    let mesh = mesh(&mut gfx);
    let scene = gfx.create_rt_scene(&[RtInstance::new(mesh)]).unwrap();

    assert!(gfx.device().is_built(gfx.mesh_handle(mesh).unwrap()));
    assert!(gfx.device().is_built(gfx.scene_handle(scene).unwrap()));
    assert_eq!(gfx.device().live_objects().acceleration_structures, 2);
    assert_eq!(gfx.device().validation_errors(), Vec::<String>::new());
}

#[test]
fn test_failed_builds_leave_nothing_behind() {
    let mut gfx = headless();
    let vb = geometry_buffer(&mut gfx);
    let live = gfx.device().live_objects();

    let failures = [
        (FailPoint::CreateBuffer, 1),
        (FailPoint::CreateBuffer, 2),
        (FailPoint::CreateAccelerationStructure, 1),
        (FailPoint::Submit, 1),
    ];
    for (point, nth) in failures {
        gfx.device().fail_nth(point, nth, GfxError::OutOfDeviceMemory);

        let result = gfx.create_rt_mesh(&triangle(vb));

        assert_eq!(result, Err(GfxError::OutOfDeviceMemory), "{point:?} #{nth}");
        assert_eq!(gfx.device().live_objects(), live, "{point:?} #{nth}");
        gfx.device().clear_failures();
    }

    assert!(gfx.create_rt_mesh(&triangle(vb)).is_ok());
    assert_eq!(gfx.device().validation_errors(), Vec::<String>::new());
}

#[test]
fn test_failed_scene_build_releases_the_instance_buffer() {
    let mut gfx = headless();
    let mesh = mesh(&mut gfx);
    let warm = gfx.create_rt_scene(&[RtInstance::new(mesh)]).unwrap();
    gfx.destroy_rt_scene(warm).unwrap();
    let live = gfx.device().live_objects();

    gfx.device().fail_nth(FailPoint::CreateAccelerationStructure, 1, GfxError::OutOfDeviceMemory);

    assert!(gfx.create_rt_scene(&[RtInstance::new(mesh)]).is_err());
    assert_eq!(gfx.device().live_objects(), live);
}

#[test]
fn test_geometry_is_checked_before_building() {
    let mut gfx = headless();
    let vb = geometry_buffer(&mut gfx);
    let plain = gfx.create_buffer(&BufferInfo::constant(36, BufferUsage::VERTEX), None).unwrap();

    let empty = TriangleGeometry { triangle_count: 0, ..triangle(vb) };
    assert!(matches!(gfx.create_rt_mesh(&empty), Err(GfxError::InvalidUsage(_))));
    assert!(matches!(gfx.create_rt_mesh(&triangle(plain)), Err(GfxError::InvalidUsage(_))));
    assert!(matches!(gfx.create_rt_scene(&[]), Err(GfxError::InvalidUsage(_))));
    assert_eq!(gfx.device().live_objects().acceleration_structures, 0);
}

#[test]
fn test_instanced_mesh_outlives_its_scene() {
    let mut gfx = headless();
    let mesh = mesh(&mut gfx);
    let scene = gfx.create_rt_scene(&[RtInstance::new(mesh), RtInstance { custom_index: 1, ..RtInstance::new(mesh) }]).unwrap();

    assert!(matches!(gfx.destroy_rt_mesh(mesh), Err(GfxError::InvalidUsage(_))));
    gfx.destroy_rt_scene(scene).unwrap();
    gfx.destroy_rt_mesh(mesh).unwrap();

    assert_eq!(gfx.device().live_objects().acceleration_structures, 0);
}

#[test]
fn test_ray_tracing_requires_device_support() {
    let mut gfx = headless_with(HeadlessConfig { ray_tracing: None, ..HeadlessConfig::default() });
    let vb = geometry_buffer(&mut gfx);

    assert_eq!(gfx.create_rt_mesh(&triangle(vb)), Err(GfxError::FeatureNotSupported));
}

#[test]
fn test_trace_rays_against_a_scene() {
    let mut gfx = headless();
    let mesh = mesh(&mut gfx);
    let scene = gfx.create_rt_scene(&[RtInstance::new(mesh)]).unwrap();
    let output = gfx
        .create_image(
            &ImageInfo { usage: rust_gfx::types::ImageUsage::STORAGE, ..ImageInfo::texture_2d(64, 64, Format::Rgba8Unorm) },
            None,
        )
        .unwrap();

    let raygen = spirv(&mut gfx, ShaderStage::RayGen);
    let miss = spirv(&mut gfx, ShaderStage::Miss);
    let shadow_miss = spirv(&mut gfx, ShaderStage::Miss);
    let hit = spirv(&mut gfx, ShaderStage::ClosestHit);
    let layout = ResourceLayout::default()
        .with_binding(0, BindingType::AccelerationStructure)
        .with_binding(1, BindingType::StorageImage)
        .with_push_constants(16);
    let info = RayTracingPipelineInfo::new(raygen, vec![miss, shadow_miss], vec![hit], layout);
    assert_eq!(info.group_count(), 4);
    let pipeline = gfx.create_ray_tracing_pipeline(info).unwrap();
    let bindings = [
        ResourceBinding { binding: 0, resource: BoundResource::Scene(scene) },
        ResourceBinding { binding: 1, resource: BoundResource::StorageImage(output) },
    ];

    for _ in 0..3 {
        gfx.begin_record().unwrap();
        gfx.bind_pipeline(pipeline, &bindings).unwrap();
        gfx.trace_rays(64, 64, 1, &[0; 16]).unwrap();
        gfx.end_record().unwrap();
    }

    assert_eq!(gfx.frame_stats().frames_submitted, 3);
    assert_eq!(gfx.device().validation_errors(), Vec::<String>::new());
}

#[test]
fn test_trace_rays_needs_a_bound_ray_tracing_pipeline() {
    let mut gfx = headless();
    let shader = spirv(&mut gfx, ShaderStage::Compute);
    let compute = gfx.create_compute_pipeline(ComputePipelineInfo::new(shader, ResourceLayout::default())).unwrap();
    let fb = gfx.default_framebuffer();

    gfx.begin_record().unwrap();
    assert!(matches!(gfx.trace_rays(8, 8, 1, &[]), Err(GfxError::InvalidUsage(_))));
    gfx.bind_pipeline(compute, &[]).unwrap();
    assert!(matches!(gfx.trace_rays(8, 8, 1, &[]), Err(GfxError::InvalidUsage(_))));
    gfx.dispatch_compute([4, 4, 1], &[]).unwrap();
    gfx.begin_render_pass(fb, &ClearValues::default()).unwrap();
    assert!(matches!(gfx.bind_pipeline(compute, &[]), Err(GfxError::InvalidUsage(_))));
    gfx.end_render_pass().unwrap();
    gfx.end_record().unwrap();
}
