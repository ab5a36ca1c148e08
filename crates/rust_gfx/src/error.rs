//! Error taxonomy shared by every backend
//!
//! Every mutating call returns a [`GfxResult`]. The variants are deliberately flat:
//! callers branch on the kind of failure, not on which backend produced it.

use ash::vk;
use thiserror::Error;

/// Graphics backend errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GfxError {
    /// Host allocation failed
    #[error("out of host memory")]
    OutOfHostMemory,

    /// Device allocation failed
    #[error("out of device memory")]
    OutOfDeviceMemory,

    /// The logical device was lost; the context is unusable
    #[error("device lost")]
    DeviceLost,

    /// The presentation surface is no longer available
    #[error("surface lost")]
    SurfaceLost,

    /// Requested format is not supported by the device or surface
    #[error("format not supported")]
    FormatNotSupported,

    /// Host mapping of an allocation failed
    #[error("failed to map memory")]
    FailedToMapMemory,

    /// A loader or extension entry point could not be resolved
    #[error("failed to get function address")]
    FailedToGetFunctionAddress,

    /// Shader source or binary was rejected
    #[error("bad shader code")]
    BadShaderCode,

    /// Framebuffer or surface extent has a zero dimension
    #[error("zero framebuffer size")]
    ZeroFramebufferSize,

    /// Feature is unavailable on this backend or device
    #[error("feature not supported")]
    FeatureNotSupported,

    /// Caller violated an API contract
    #[error("invalid usage: {0}")]
    InvalidUsage(&'static str),

    /// Anything the taxonomy does not name
    #[error("unknown error: {0}")]
    Unknown(String),
}

/// Result type for graphics operations
pub type GfxResult<T> = Result<T, GfxError>;

impl GfxError {
    /// Whether the error leaves the context unusable
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::DeviceLost)
    }
}

impl From<vk::Result> for GfxError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_HOST_MEMORY => Self::OutOfHostMemory,
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
            | vk::Result::ERROR_OUT_OF_POOL_MEMORY
            | vk::Result::ERROR_FRAGMENTED_POOL
            | vk::Result::ERROR_TOO_MANY_OBJECTS => Self::OutOfDeviceMemory,
            vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost,
            vk::Result::ERROR_SURFACE_LOST_KHR => Self::SurfaceLost,
            vk::Result::ERROR_FORMAT_NOT_SUPPORTED => Self::FormatNotSupported,
            vk::Result::ERROR_MEMORY_MAP_FAILED => Self::FailedToMapMemory,
            vk::Result::ERROR_INVALID_SHADER_NV => Self::BadShaderCode,
            vk::Result::ERROR_FEATURE_NOT_PRESENT
            | vk::Result::ERROR_EXTENSION_NOT_PRESENT
            | vk::Result::ERROR_LAYER_NOT_PRESENT
            | vk::Result::ERROR_INCOMPATIBLE_DRIVER => Self::FeatureNotSupported,
            other => Self::Unknown(format!("{other:?}")),
        }
    }
}

impl From<ash::LoadingError> for GfxError {
    fn from(error: ash::LoadingError) -> Self {
        log::error!("Failed to load Vulkan loader: {error}");
        Self::FailedToGetFunctionAddress
    }
}

/// Abort on an unrecoverable condition.
///
/// Used where continuing would touch resources the GPU may still own, such as a
/// failed fence wait during destruction.
#[track_caller]
pub fn fatal(context: &str, error: &GfxError) -> ! {
    log::error!("Fatal graphics error during {context}: {error}");
    panic!("fatal graphics error during {context}: {error}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vulkan_result_mapping() {
        assert_eq!(GfxError::from(vk::Result::ERROR_DEVICE_LOST), GfxError::DeviceLost);
        assert_eq!(
            GfxError::from(vk::Result::ERROR_OUT_OF_POOL_MEMORY),
            GfxError::OutOfDeviceMemory
        );
        assert_eq!(
            GfxError::from(vk::Result::ERROR_EXTENSION_NOT_PRESENT),
            GfxError::FeatureNotSupported
        );
        assert!(matches!(
            GfxError::from(vk::Result::ERROR_VALIDATION_FAILED_EXT),
            GfxError::Unknown(_)
        ));
    }

    #[test]
    fn test_only_device_lost_is_fatal() {
        assert!(GfxError::DeviceLost.is_fatal());
        assert!(!GfxError::SurfaceLost.is_fatal());
        assert!(!GfxError::ZeroFramebufferSize.is_fatal());
    }

    #[test]
    #[should_panic(expected = "fatal graphics error during teardown")]
    fn test_fatal_panics() {
        fatal("teardown", &GfxError::DeviceLost);
    }
}
