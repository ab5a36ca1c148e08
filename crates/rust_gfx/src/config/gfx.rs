use serde::{Deserialize, Serialize};

use super::Config;

/// Which backend a context should be created on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum BackendPreference {
    /// Vulkan when a loader is present, OpenGL otherwise
    #[default]
    Auto,
    /// Explicit backend only
    Vulkan,
    /// Immediate backend only
    OpenGl,
    /// Software explicit device without a window
    Headless,
}

/// Initial window parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowConfig {
    /// Width in screen coordinates
    pub width: u32,
    /// Height in screen coordinates
    pub height: u32,
    /// Title bar text
    pub title: String,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self { width: 1280, height: 720, title: "rust_gfx".to_string() }
    }
}

/// Graphics context configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GfxConfig {
    /// Application name reported to the driver
    pub application_name: String,
    /// Backend selection
    pub backend: BackendPreference,
    /// Whether to enable Vulkan validation layers; `None` follows the build type
    pub enable_validation: Option<bool>,
    /// Synchronize presentation with the display
    pub vsync: bool,
    /// Request ray tracing extensions when available
    pub ray_tracing: bool,
    /// Initial capacity of the shared staging buffer in bytes
    pub initial_staging_size: u64,
    /// Window parameters
    pub window: WindowConfig,
}

impl GfxConfig {
    /// Configuration with defaults for the given application
    pub fn new(app_name: impl Into<String>) -> Self {
        Self { application_name: app_name.into(), ..Self::default() }
    }

    /// Set the backend preference
    pub fn with_backend(mut self, backend: BackendPreference) -> Self {
        self.backend = backend;
        self
    }

    /// Force validation on or off
    pub fn with_validation(mut self, enabled: bool) -> Self {
        self.enable_validation = Some(enabled);
        self
    }

    /// Set vsync
    pub fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    /// Request ray tracing support
    pub fn with_ray_tracing(mut self, enabled: bool) -> Self {
        self.ray_tracing = enabled;
        self
    }

    /// Set the initial staging capacity
    pub fn with_initial_staging_size(mut self, bytes: u64) -> Self {
        self.initial_staging_size = bytes;
        self
    }

    /// Set window parameters
    pub fn with_window(mut self, width: u32, height: u32, title: impl Into<String>) -> Self {
        self.window = WindowConfig { width, height, title: title.into() };
        self
    }

    /// Resolve the validation setting against the build type
    pub fn validation_enabled(&self) -> bool {
        self.enable_validation.unwrap_or(cfg!(debug_assertions))
    }
}

impl Default for GfxConfig {
    fn default() -> Self {
        Self {
            application_name: "rust_gfx".to_string(),
            backend: BackendPreference::Auto,
            enable_validation: None,
            vsync: true,
            ray_tracing: false,
            initial_staging_size: 0,
            window: WindowConfig::default(),
        }
    }
}

impl Config for GfxConfig {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_follows_build_type() {
        let config = GfxConfig::default();
        assert_eq!(config.validation_enabled(), cfg!(debug_assertions));
        assert!(config.clone().with_validation(true).validation_enabled());
        assert!(!config.with_validation(false).validation_enabled());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: GfxConfig = toml::from_str("application_name = \"partial\"\nvsync = false\n").unwrap();
        assert_eq!(config.application_name, "partial");
        assert!(!config.vsync);
        assert_eq!(config.backend, BackendPreference::Auto);
        assert_eq!(config.window, WindowConfig::default());
    }
}
