//! Buffer uploads through the shared staging buffer

mod common;

use common::{headless, headless_with};
use rust_gfx::hal::headless::HeadlessConfig;
use rust_gfx::prelude::*;

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

#[test]
fn test_constant_buffer_round_trips_through_staging() {
    let mut gfx = headless();
    let data = pattern(3000, 7);

    let buffer = gfx
        .create_buffer(&BufferInfo::constant(data.len() as u64, BufferUsage::VERTEX), Some(&data))
        .unwrap();

    let handle = gfx.buffer_handle(buffer).unwrap();
    let contents = gfx.device().buffer_contents(handle).unwrap();
    assert_eq!(&contents[..data.len()], &data[..]);
    assert!(gfx.staging_stats().transfers >= 1);
    assert_eq!(gfx.device().validation_errors(), Vec::<String>::new());
}

#[test]
fn test_staging_grows_but_never_shrinks() {
    let mut gfx = headless();
    let before = gfx.staging_stats();

    let small = pattern(256, 1);
    gfx.create_buffer(&BufferInfo::constant(256, BufferUsage::UNIFORM), Some(&small)).unwrap();
    let after_small = gfx.staging_stats();
    assert!(after_small.capacity >= 256);

    let large = pattern(8192, 2);
    gfx.create_buffer(&BufferInfo::constant(8192, BufferUsage::STORAGE), Some(&large)).unwrap();
    let after_large = gfx.staging_stats();
    assert!(after_large.capacity >= 8192);
    assert!(after_large.grow_count > after_small.grow_count);

    gfx.create_buffer(&BufferInfo::constant(256, BufferUsage::UNIFORM), Some(&small)).unwrap();
    let after_again = gfx.staging_stats();
    assert_eq!(after_again.capacity, after_large.capacity);
    assert_eq!(after_again.grow_count, after_large.grow_count);

    let grown = after_again.grow_count - before.grow_count;
    let released = after_again.released_count - before.released_count;
    let replaced_initial = u32::from(before.capacity > 0);
    assert_eq!(released, grown - 1 + replaced_initial);
}

#[test]
fn test_dynamic_buffer_skips_staging() {
    let mut gfx = headless();
    let before = gfx.staging_stats().transfers;
    let data = pattern(64, 3);

    let buffer = gfx.create_buffer(&BufferInfo::dynamic(64, BufferUsage::UNIFORM), Some(&data)).unwrap();

    assert_eq!(gfx.staging_stats().transfers, before);
    assert_eq!(gfx.has_paired_staging(buffer), Some(false));
    let handle = gfx.buffer_handle(buffer).unwrap();
    assert_eq!(&gfx.device().buffer_contents(handle).unwrap()[..64], &data[..]);
}

#[test]
fn test_unified_memory_writes_constant_buffers_directly() {
    let mut gfx = headless_with(HeadlessConfig { device_local_host_visible: true, ..HeadlessConfig::default() });
    let before = gfx.staging_stats().transfers;
    let data = pattern(512, 4);

    let buffer = gfx.create_buffer(&BufferInfo::constant(512, BufferUsage::VERTEX), Some(&data)).unwrap();

    assert_eq!(gfx.staging_stats().transfers, before);
    let handle = gfx.buffer_handle(buffer).unwrap();
    assert_eq!(&gfx.device().buffer_contents(handle).unwrap()[..512], &data[..]);
}

#[test]
fn test_update_outside_frame_lands_immediately() {
    let mut gfx = headless();
    let buffer = gfx.create_buffer(&BufferInfo::constant(128, BufferUsage::UNIFORM), None).unwrap();
    let data = pattern(64, 9);

    gfx.update_buffer(buffer, 32, &data).unwrap();

    let handle = gfx.buffer_handle(buffer).unwrap();
    let contents = gfx.device().buffer_contents(handle).unwrap();
    assert_eq!(&contents[32..96], &data[..]);
    assert_eq!(gfx.has_paired_staging(buffer), Some(false));
}

#[test]
fn test_update_offset_overflow_is_rejected() {
    let mut gfx = headless();
    let constant = gfx.create_buffer(&BufferInfo::constant(64, BufferUsage::UNIFORM), None).unwrap();
    let dynamic = gfx.create_buffer(&BufferInfo::dynamic(64, BufferUsage::UNIFORM), None).unwrap();

    for buffer in [constant, dynamic] {
        assert_eq!(
            gfx.update_buffer(buffer, u64::MAX, &[1, 2]),
            Err(GfxError::InvalidUsage("update past the end of the buffer"))
        );
    }

    gfx.begin_record().unwrap();
    assert_eq!(
        gfx.update_buffer(constant, u64::MAX - 1, &[1, 2, 3]),
        Err(GfxError::InvalidUsage("update past the end of the buffer"))
    );
    gfx.end_record().unwrap();
}

#[test]
fn test_update_inside_frame_is_recorded_into_the_frame() {
    let mut gfx = headless();
    let buffer = gfx.create_buffer(&BufferInfo::constant(256, BufferUsage::UNIFORM), None).unwrap();
    let data = pattern(256, 11);

    gfx.begin_record().unwrap();
    gfx.update_buffer(buffer, 0, &data).unwrap();
    assert_eq!(gfx.has_paired_staging(buffer), Some(true));
    gfx.end_record().unwrap();
    gfx.wait_idle().unwrap();

    let handle = gfx.buffer_handle(buffer).unwrap();
    assert_eq!(&gfx.device().buffer_contents(handle).unwrap()[..256], &data[..]);
    assert_eq!(gfx.device().validation_errors(), Vec::<String>::new());
}

#[test]
fn test_update_inside_render_pass_is_rejected() {
    let mut gfx = headless();
    let buffer = gfx.create_buffer(&BufferInfo::dynamic(16, BufferUsage::UNIFORM), None).unwrap();
    let fb = gfx.default_framebuffer();

    gfx.begin_record().unwrap();
    gfx.begin_render_pass(fb, &ClearValues::default()).unwrap();
    assert!(matches!(gfx.update_buffer(buffer, 0, &[0; 16]), Err(GfxError::InvalidUsage(_))));
    gfx.end_render_pass().unwrap();
    gfx.end_record().unwrap();
}

#[test]
fn test_destroyed_buffer_is_released() {
    let mut gfx = headless();
    let before = gfx.device().live_objects();

    let buffer = gfx.create_buffer(&BufferInfo::dynamic(1024, BufferUsage::INDEX), Some(&[1; 1024])).unwrap();
    assert_eq!(gfx.device().live_objects().buffers, before.buffers + 1);
    gfx.destroy_buffer(buffer).unwrap();

    assert_eq!(gfx.device().live_objects(), before);

    assert_eq!(gfx.buffer_handle(buffer), None);
    assert!(matches!(gfx.destroy_buffer(buffer), Err(GfxError::InvalidUsage(_))));
}
