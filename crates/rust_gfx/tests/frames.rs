//! Frame ring, presentation and swapchain recreation

mod common;

use approx::assert_relative_eq;
use common::{deferred, empty_frame, headless, headless_with, spirv};
use rust_gfx::explicit::{SwapchainState, FRAME_LAG};
use rust_gfx::hal::headless::{DeviceEvent, FailPoint, HeadlessConfig, LiveObjects};
use rust_gfx::hal::{AcquireOutcome, PresentOutcome, QueueKind};
use rust_gfx::prelude::*;

fn stalls(events: &[DeviceEvent]) -> usize {
    events.iter().filter(|e| matches!(e, DeviceEvent::FenceWait { stalled: true, .. })).count()
}

#[test]
fn test_frame_slots_cycle() {
    let mut gfx = headless();

    let slots: Vec<usize> = (0..5).map(|_| empty_frame(&mut gfx).frame_index).collect();

    assert_eq!(slots, vec![0, 1, 0, 1, 0]);
    assert_eq!(gfx.frame_stats().frames_submitted, 5);
    assert_eq!(gfx.device().validation_errors(), Vec::<String>::new());
}

#[test]
fn test_frame_info_reports_extent_and_image() {
    let mut gfx = headless();

    let frame = empty_frame(&mut gfx);

    assert_eq!(frame.extent, Extent2D::new(800, 600));
    assert!((frame.image_index as usize) < gfx.swapchain_image_count());
}

#[test]
fn test_cpu_runs_at_most_frame_lag_ahead() {
    let mut gfx = deferred();
    gfx.device().take_events();

    for _ in 0..FRAME_LAG {
        empty_frame(&mut gfx);
    }
    assert_eq!(stalls(&gfx.device().take_events()), 0);

    gfx.begin_record().unwrap();
    assert_eq!(stalls(&gfx.device().take_events()), 1);
    gfx.end_record().unwrap();

    gfx.wait_idle().unwrap();
    assert_eq!(gfx.device().pending_submissions(), 0);
    assert_eq!(gfx.device().validation_errors(), Vec::<String>::new());
}

#[test]
fn test_every_acquired_image_is_presented() {
    let mut gfx = headless();
    gfx.device().take_events();

    for _ in 0..4 {
        empty_frame(&mut gfx);
    }

    let events = gfx.device().take_events();
    let acquired: Vec<u32> =
        events.iter().filter_map(|e| if let DeviceEvent::Acquired { index } = e { Some(*index) } else { None }).collect();
    let presented: Vec<u32> =
        events.iter().filter_map(|e| if let DeviceEvent::Presented { index } = e { Some(*index) } else { None }).collect();
    assert_eq!(acquired.len(), 4);
    assert_eq!(acquired, presented);
}

#[test]
fn test_record_nesting_is_rejected() {
    let mut gfx = headless();

    assert!(matches!(gfx.end_record(), Err(GfxError::InvalidUsage(_))));
    gfx.begin_record().unwrap();
    assert!(matches!(gfx.begin_record(), Err(GfxError::InvalidUsage(_))));
    assert!(matches!(gfx.resize(Extent2D::new(640, 480)), Err(GfxError::InvalidUsage(_))));
    gfx.end_record().unwrap();
}

#[test]
fn test_resize_is_idempotent() {
    let mut gfx = headless();
    let extent = Extent2D::new(1024, 768);
    gfx.device().set_surface_extent(extent);

    gfx.resize(extent).unwrap();
    let images = gfx.swapchain_image_count();
    let live = gfx.device().live_objects();

    gfx.resize(extent).unwrap();

    assert_eq!(gfx.swapchain_image_count(), images);
    assert_eq!(gfx.device().live_objects(), live);
    assert_eq!(gfx.extent(), extent);
    assert_eq!(gfx.swapchain_state(), Some(SwapchainState::Ready));
}

#[test]
fn test_repeated_resizes_keep_sync_objects_bounded() {
    let mut gfx = headless();
    let before = gfx.frame_stats().resizes;
    empty_frame(&mut gfx);
    let live = gfx.device().live_objects();

    for (i, width) in [640, 1280, 800].into_iter().enumerate() {
        let extent = Extent2D::new(width, 600);
        gfx.device().set_surface_extent(extent);
        gfx.resize(extent).unwrap();
        assert_eq!(gfx.frame_stats().resizes, before + i as u64 + 1);
        assert_eq!(gfx.frames_in_flight(), FRAME_LAG);
        empty_frame(&mut gfx);
    }

    let after = gfx.device().live_objects();
    assert_eq!(after.fences, live.fences);
    assert_eq!(after.semaphores, live.semaphores);
    assert_eq!(after.swapchains, 1);
    assert_eq!(gfx.device().validation_errors(), Vec::<String>::new());
}

#[test]
fn test_out_of_date_acquire_recreates_within_the_frame() {
    let mut gfx = headless();
    let resizes = gfx.frame_stats().resizes;
    let extent = Extent2D::new(900, 500);
    gfx.device().set_surface_extent(extent);
    gfx.device().script_acquire(AcquireOutcome::OutOfDate);

    let frame = empty_frame(&mut gfx);

    assert_eq!(frame.extent, extent);
    assert_eq!(gfx.frame_stats().resizes, resizes + 1);
    assert_eq!(gfx.frame_stats().skipped_frames, 0);
    assert_eq!(gfx.device().validation_errors(), Vec::<String>::new());
}

#[test]
fn test_suboptimal_present_marks_swapchain_stale() {
    let mut gfx = headless();
    gfx.device().script_present(PresentOutcome::Suboptimal);

    empty_frame(&mut gfx);
    assert_eq!(gfx.swapchain_state(), Some(SwapchainState::Stale));

    empty_frame(&mut gfx);
    assert_eq!(gfx.swapchain_state(), Some(SwapchainState::Ready));
}

#[test]
fn test_zero_extent_skips_the_frame() {
    let mut gfx = headless();
    gfx.device().set_surface_extent(Extent2D::new(0, 0));
    gfx.device().script_acquire(AcquireOutcome::OutOfDate);

    assert!(gfx.begin_record().is_err());
    assert!(gfx.begin_record().is_err());

    gfx.device().set_surface_extent(Extent2D::new(320, 240));
    let frame = empty_frame(&mut gfx);
    assert_eq!(frame.extent, Extent2D::new(320, 240));
}

#[test]
fn test_pipelines_are_rebuilt_on_resize() {
    let mut gfx = headless();
    let vs = spirv(&mut gfx, ShaderStage::Vertex);
    let fs = spirv(&mut gfx, ShaderStage::Fragment);
    let fb = gfx.default_framebuffer();
    let pipeline = gfx.create_graphics_pipeline(fb, GraphicsPipelineInfo::new(vs, fs)).unwrap();
    let generation = gfx.pipeline_generation(pipeline).unwrap();
    let handle = gfx.pipeline_handle(pipeline).unwrap();
    assert_relative_eq!(gfx.graphics_state(pipeline).unwrap().viewport.width, 800.0);

    let extent = Extent2D::new(1024, 768);
    gfx.device().set_surface_extent(extent);
    gfx.resize(extent).unwrap();

    assert_ne!(gfx.pipeline_generation(pipeline).unwrap(), generation);
    assert_ne!(gfx.pipeline_handle(pipeline).unwrap(), handle);
    let state = gfx.graphics_state(pipeline).unwrap();
    assert_relative_eq!(state.viewport.width, 1024.0);
    assert_relative_eq!(state.viewport.height, 768.0);
}

#[test]
fn test_draw_inside_frame_validates() {
    let mut gfx = headless();
    let vs = spirv(&mut gfx, ShaderStage::Vertex);
    let fs = spirv(&mut gfx, ShaderStage::Fragment);
    let fb = gfx.default_framebuffer();
    let layout = VertexLayout::new(12).with_attribute(0, VertexFormat::Float3, 0);
    let info = GraphicsPipelineInfo::new(vs, fs)
        .with_vertex_layout(layout)
        .with_resources(ResourceLayout::default().with_push_constants(16));
    let pipeline = gfx.create_graphics_pipeline(fb, info).unwrap();
    let vertices: [f32; 9] = [0.0, 0.5, 0.0, -0.5, -0.5, 0.0, 0.5, -0.5, 0.0];
    let vb = gfx
        .create_buffer(&BufferInfo::constant(36, BufferUsage::VERTEX), Some(bytemuck::cast_slice(&vertices)))
        .unwrap();
    let push = [0u8; 16];

    for _ in 0..3 {
        gfx.begin_record().unwrap();
        gfx.begin_render_pass(fb, &ClearValues::default()).unwrap();
        gfx.bind_pipeline(pipeline, &[]).unwrap();
        gfx.draw_mesh(&MeshDraw::vertices(Some(vb), 3).with_push_constants(&push)).unwrap();
        gfx.end_render_pass().unwrap();
        gfx.end_record().unwrap();
    }

    assert_eq!(gfx.frame_stats().frames_submitted, 3);
    assert_eq!(gfx.device().validation_errors(), Vec::<String>::new());
}

#[test]
fn test_shutdown_releases_every_device_object() {
    let mut gfx = headless();
    let vs = spirv(&mut gfx, ShaderStage::Vertex);
    let fs = spirv(&mut gfx, ShaderStage::Fragment);
    let fb = gfx.default_framebuffer();
    gfx.create_graphics_pipeline(fb, GraphicsPipelineInfo::new(vs, fs)).unwrap();
    gfx.create_buffer(&BufferInfo::constant(64, BufferUsage::UNIFORM), Some(&[0; 64])).unwrap();
    empty_frame(&mut gfx);

    gfx.shutdown();

    assert_eq!(gfx.device().live_objects(), LiveObjects::default());
    gfx.shutdown();
}

#[test]
fn test_separate_present_queue_transfers_ownership_every_frame() {
    let mut gfx = headless_with(HeadlessConfig { separate_present_queue: true, ..HeadlessConfig::default() });
    gfx.device().take_events();

    let slots: Vec<usize> = (0..5).map(|_| empty_frame(&mut gfx).frame_index).collect();

    assert_eq!(slots, vec![0, 1, 0, 1, 0]);
    let events = gfx.device().events();
    let present_submits: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            DeviceEvent::Submitted { queue: QueueKind::Present, fence, .. } => Some(fence.is_some()),
            _ => None,
        })
        .collect();
    assert_eq!(present_submits, vec![true; 5]);
    let presents = events.iter().filter(|e| matches!(e, DeviceEvent::Presented { .. })).count();
    assert_eq!(presents, 5);
    assert_eq!(gfx.device().validation_errors(), Vec::<String>::new());
}

#[test]
fn test_device_loss_only_allows_destruction() {
    let mut gfx = headless();
    let buffer = gfx.create_buffer(&BufferInfo::dynamic(64, BufferUsage::UNIFORM), None).unwrap();
    let vs = spirv(&mut gfx, ShaderStage::Vertex);
    empty_frame(&mut gfx);

    gfx.device().fail_nth(FailPoint::Submit, 1, GfxError::DeviceLost);
    gfx.begin_record().unwrap();
    assert_eq!(gfx.end_record(), Err(GfxError::DeviceLost));

    assert_eq!(gfx.create_buffer(&BufferInfo::dynamic(16, BufferUsage::UNIFORM), None), Err(GfxError::DeviceLost));
    assert_eq!(gfx.update_buffer(buffer, 0, &[1, 2, 3, 4]), Err(GfxError::DeviceLost));
    assert_eq!(gfx.begin_record().map(|_| ()), Err(GfxError::DeviceLost));

    gfx.destroy_buffer(buffer).unwrap();
    gfx.destroy_shader(vs).unwrap();
    gfx.shutdown();

    assert_eq!(gfx.device().live_objects(), LiveObjects::default());
}
