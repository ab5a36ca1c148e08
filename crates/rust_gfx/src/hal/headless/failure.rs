//! Scripted failure injection for the headless device

use crate::error::GfxError;

/// Device operations that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    /// `create_buffer`
    CreateBuffer,
    /// `create_image`
    CreateImage,
    /// `create_image_view`
    CreateImageView,
    /// `write_mapped`
    WriteMapped,
    /// `create_fence`
    CreateFence,
    /// `create_semaphore`
    CreateSemaphore,
    /// `allocate_command_buffer`
    AllocateCommandBuffer,
    /// `submit`
    Submit,
    /// `create_swapchain`
    CreateSwapchain,
    /// `acquire_next_image`
    AcquireNextImage,
    /// `present`
    Present,
    /// `create_render_pass`
    CreateRenderPass,
    /// `create_framebuffer`
    CreateFramebuffer,
    /// `create_shader_module`
    CreateShaderModule,
    /// `create_pipeline_layout`
    CreatePipelineLayout,
    /// Any `create_*_pipeline`
    CreatePipeline,
    /// `create_descriptor_pool`
    CreateDescriptorPool,
    /// `create_acceleration_structure`
    CreateAccelerationStructure,
}

#[derive(Debug)]
struct Armed {
    point: FailPoint,
    remaining: u32,
    error: GfxError,
}

/// Pending one-shot failures
#[derive(Debug, Default)]
pub(super) struct FailurePlan {
    armed: Vec<Armed>,
}

impl FailurePlan {
    /// Make the `nth` (1-based) next call of `point` fail once with `error`
    pub(super) fn arm(&mut self, point: FailPoint, nth: u32, error: GfxError) {
        assert!(nth >= 1, "failure ordinal is 1-based");
        self.armed.push(Armed { point, remaining: nth, error });
    }

    pub(super) fn clear(&mut self) {
        self.armed.clear();
    }

    /// Count a call of `point`, returning the error if it is scripted to fail
    pub(super) fn check(&mut self, point: FailPoint) -> Option<GfxError> {
        let mut fired = None;
        for armed in self.armed.iter_mut().filter(|a| a.point == point) {
            armed.remaining -= 1;
            if armed.remaining == 0 && fired.is_none() {
                fired = Some(armed.error.clone());
            }
        }
        self.armed.retain(|a| a.remaining > 0);
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nth_call_fails_once() {
        let mut plan = FailurePlan::default();
        plan.arm(FailPoint::CreateBuffer, 2, GfxError::OutOfDeviceMemory);

        assert_eq!(plan.check(FailPoint::CreateBuffer), None);
        assert_eq!(plan.check(FailPoint::Submit), None);
        assert_eq!(plan.check(FailPoint::CreateBuffer), Some(GfxError::OutOfDeviceMemory));
        assert_eq!(plan.check(FailPoint::CreateBuffer), None);
    }

    #[test]
    fn test_independent_points() {
        let mut plan = FailurePlan::default();
        plan.arm(FailPoint::Submit, 1, GfxError::DeviceLost);
        plan.arm(FailPoint::CreateImage, 1, GfxError::OutOfHostMemory);

        assert_eq!(plan.check(FailPoint::CreateImage), Some(GfxError::OutOfHostMemory));
        assert_eq!(plan.check(FailPoint::Submit), Some(GfxError::DeviceLost));
        plan.arm(FailPoint::Submit, 1, GfxError::DeviceLost);
        plan.clear();
        assert_eq!(plan.check(FailPoint::Submit), None);
    }
}
