//! Frames-in-flight ring
//!
//! `FRAME_LAG` slots, each with a completion fence and the semaphores that chain
//! acquire → draw → (ownership transfer) → present. Waiting on the current slot's
//! fence before reusing it bounds how far the CPU runs ahead of the GPU.
//!
//! Swapchain images are tracked separately: an image index may come back while a
//! different slot's submission still renders into it, so claiming an image also
//! waits on the slot that last used it.

use crate::error::GfxResult;
use crate::hal::Device;

/// Number of frames the CPU may record ahead of the GPU
pub const FRAME_LAG: usize = 2;

/// Synchronization objects of one ring slot
pub struct FrameSlot<D: Device> {
    /// Signalled when the slot's last submission completes
    pub fence: D::Fence,
    /// Signalled by acquire, waited on by the draw submission
    pub image_acquired: D::Semaphore,
    /// Signalled by the draw submission
    pub draw_complete: D::Semaphore,
    /// Signalled by the present-queue ownership transfer
    pub image_ownership: Option<D::Semaphore>,
}

impl<D: Device> FrameSlot<D> {
    fn create(device: &D, separate_present: bool) -> GfxResult<Self> {
        let fence = device.create_fence(true)?;
        let image_acquired = device.create_semaphore().map_err(|e| {
            device.destroy_fence(fence);
            e
        })?;
        let draw_complete = device.create_semaphore().map_err(|e| {
            device.destroy_semaphore(image_acquired);
            device.destroy_fence(fence);
            e
        })?;
        let image_ownership = if separate_present {
            Some(device.create_semaphore().map_err(|e| {
                device.destroy_semaphore(draw_complete);
                device.destroy_semaphore(image_acquired);
                device.destroy_fence(fence);
                e
            })?)
        } else {
            None
        };
        Ok(Self { fence, image_acquired, draw_complete, image_ownership })
    }

    fn destroy(self, device: &D) {
        device.destroy_fence(self.fence);
        device.destroy_semaphore(self.image_acquired);
        device.destroy_semaphore(self.draw_complete);
        if let Some(semaphore) = self.image_ownership {
            device.destroy_semaphore(semaphore);
        }
    }
}

/// Fixed ring of frame slots plus swapchain image ownership
pub struct FrameSynchronizer<D: Device> {
    slots: Vec<FrameSlot<D>>,
    current: usize,
    image_owners: Vec<Option<usize>>,
}

impl<D: Device> FrameSynchronizer<D> {
    /// Create `FRAME_LAG` slots; fences start signalled so the first frames never block
    pub fn new(device: &D, separate_present: bool) -> GfxResult<Self> {
        let mut slots = Vec::with_capacity(FRAME_LAG);
        for _ in 0..FRAME_LAG {
            match FrameSlot::create(device, separate_present) {
                Ok(slot) => slots.push(slot),
                Err(e) => {
                    for slot in slots {
                        slot.destroy(device);
                    }
                    return Err(e);
                }
            }
        }
        Ok(Self { slots, current: 0, image_owners: Vec::new() })
    }

    /// Index of the slot the next frame records into
    pub fn current_index(&self) -> usize {
        self.current
    }

    /// The current slot
    pub fn current(&self) -> &FrameSlot<D> {
        &self.slots[self.current]
    }

    /// Number of slots, always `FRAME_LAG`
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Always false; the ring is never empty
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Block until the current slot's previous submission completed
    pub fn wait_current(&self, device: &D) -> GfxResult<()> {
        device.wait_for_fence(self.slots[self.current].fence)
    }

    /// Block until `slot`'s last submission completed
    pub fn wait_slot(&self, device: &D, slot: usize) -> GfxResult<()> {
        device.wait_for_fence(self.slots[slot].fence)
    }

    /// Take swapchain image `index` for the current slot.
    ///
    /// Waits for the slot that last rendered into the image, then resets the
    /// current fence so the upcoming submission can signal it. Must follow
    /// [`Self::wait_current`].
    pub fn claim_image(&mut self, device: &D, index: u32) -> GfxResult<()> {
        let index = index as usize;
        if index >= self.image_owners.len() {
            self.image_owners.resize(index + 1, None);
        }
        if let Some(owner) = self.image_owners[index] {
            if owner != self.current {
                log::trace!("Image {index} still owned by slot {owner}, waiting");
                self.wait_slot(device, owner)?;
            }
        }
        device.reset_fence(self.slots[self.current].fence)?;
        self.image_owners[index] = Some(self.current);
        Ok(())
    }

    /// Move to the next slot after a present
    pub fn advance(&mut self) {
        self.current = (self.current + 1) % self.slots.len();
        log::trace!("Frame slot -> {}", self.current);
    }

    /// Forget image ownership after the swapchain was recreated with `count` images
    pub fn reset_images(&mut self, count: usize) {
        self.image_owners.clear();
        self.image_owners.resize(count, None);
    }

    /// Restore the current slot after a frame failed between claim and present.
    ///
    /// The fence may have been reset without a submission and any semaphore may
    /// hold a signal nothing will consume, so the whole slot is replaced once the
    /// device drains.
    pub fn rearm_current(&mut self, device: &D) -> GfxResult<()> {
        device.wait_idle()?;
        let separate_present = self.slots[self.current].image_ownership.is_some();
        let fresh = FrameSlot::create(device, separate_present)?;
        std::mem::replace(&mut self.slots[self.current], fresh).destroy(device);
        for owner in &mut self.image_owners {
            if *owner == Some(self.current) {
                *owner = None;
            }
        }
        log::debug!("Frame slot {} rearmed", self.current);
        Ok(())
    }

    /// Destroy every slot; the device must be idle
    pub fn destroy(self, device: &D) {
        for slot in self.slots {
            slot.destroy(device);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GfxError;
    use crate::hal::headless::{Completion, FailPoint, HeadlessConfig, HeadlessDevice, LiveObjects};
    use crate::hal::{QueueKind, Submit, WaitStage};

    fn submit_slot(device: &HeadlessDevice, frames: &FrameSynchronizer<HeadlessDevice>) {
        let cb = device.allocate_command_buffer(QueueKind::Graphics).unwrap();
        device.begin_commands(cb, false).unwrap();
        device.end_commands(cb).unwrap();
        let slot = frames.current();
        device.signal_semaphore(slot.image_acquired);
        device
            .submit(
                QueueKind::Graphics,
                &Submit {
                    command_buffer: cb,
                    wait: Some((slot.image_acquired, WaitStage::ColorAttachmentOutput)),
                    signal: &[],
                    fence: Some(slot.fence),
                },
            )
            .unwrap();
    }

    #[test]
    fn test_ring_wraps_at_frame_lag() {
        let device = HeadlessDevice::new(HeadlessConfig::default());
        let mut frames = FrameSynchronizer::new(&device, false).unwrap();
        let visited: Vec<usize> = (0..5)
            .map(|_| {
                let index = frames.current_index();
                frames.advance();
                index
            })
            .collect();
        assert_eq!(visited, vec![0, 1, 0, 1, 0]);
        assert_eq!(frames.len(), FRAME_LAG);
        frames.destroy(&device);
    }

    #[test]
    fn test_reused_image_waits_for_previous_owner() {
        let device = HeadlessDevice::new(HeadlessConfig { completion: Completion::Deferred, ..HeadlessConfig::default() });
        let mut frames = FrameSynchronizer::new(&device, false).unwrap();
        frames.reset_images(2);

        frames.wait_current(&device).unwrap();
        frames.claim_image(&device, 0).unwrap();
        submit_slot(&device, &frames);
        frames.advance();

        frames.wait_current(&device).unwrap();
        assert_eq!(device.stall_count(), 0);
        frames.claim_image(&device, 0).unwrap();
        assert_eq!(device.stall_count(), 1);
        frames.rearm_current(&device).unwrap();
        frames.destroy(&device);
        assert!(device.validation_errors().is_empty());
    }

    #[test]
    fn test_partial_creation_is_rolled_back() {
        let device = HeadlessDevice::new(HeadlessConfig { separate_present_queue: true, ..HeadlessConfig::default() });
        device.fail_nth(FailPoint::CreateSemaphore, 5, GfxError::OutOfHostMemory);
        assert!(FrameSynchronizer::new(&device, true).is_err());
        assert_eq!(device.live_objects(), LiveObjects::default());
    }
}
