//! GLFW window management for both backends
//!
//! A Vulkan window is created without a client API; an OpenGL window carries a
//! 4.3 core context made current on the calling thread.

use std::cell::RefCell;
use std::ffi::CString;
use std::rc::Rc;

use ash::vk;
use glfw::Context;
use rust_gfx::hal::vulkan::VulkanSurfaceSource;
use rust_gfx::immediate::GlSurface;
use rust_gfx::prelude::*;
use thiserror::Error;

/// Window management errors
#[derive(Error, Debug)]
pub enum WindowError {
    #[error("GLFW initialization failed")]
    InitializationFailed,

    #[error("Window creation failed")]
    CreationFailed,
}

pub type WindowResult<T> = Result<T, WindowError>;

/// Which graphics API the window is prepared for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientApi {
    Vulkan,
    OpenGl,
}

/// GLFW window shared between the application loop and the GL surface
pub struct Window {
    glfw: glfw::Glfw,
    window: Rc<RefCell<glfw::PWindow>>,
    events: glfw::GlfwReceiver<(f64, glfw::WindowEvent)>,
}

impl Window {
    pub fn new(config: &WindowConfig, api: ClientApi) -> WindowResult<Self> {
        let mut glfw = glfw::init(glfw::fail_on_errors).map_err(|_| WindowError::InitializationFailed)?;

        match api {
            ClientApi::Vulkan => glfw.window_hint(glfw::WindowHint::ClientApi(glfw::ClientApiHint::NoApi)),
            ClientApi::OpenGl => {
                glfw.window_hint(glfw::WindowHint::ClientApi(glfw::ClientApiHint::OpenGl));
                glfw.window_hint(glfw::WindowHint::ContextVersion(4, 3));
                glfw.window_hint(glfw::WindowHint::OpenGlProfile(glfw::OpenGlProfileHint::Core));
            }
        }
        glfw.window_hint(glfw::WindowHint::Resizable(true));

        let (mut window, events) = glfw
            .create_window(config.width, config.height, &config.title, glfw::WindowMode::Windowed)
            .ok_or(WindowError::CreationFailed)?;

        window.set_key_polling(true);
        window.set_close_polling(true);
        window.set_framebuffer_size_polling(true);
        if api == ClientApi::OpenGl {
            window.make_current();
        }

        Ok(Self { glfw, window: Rc::new(RefCell::new(window)), events })
    }

    pub fn should_close(&self) -> bool {
        self.window.borrow().should_close()
    }

    pub fn set_should_close(&self, should_close: bool) {
        self.window.borrow_mut().set_should_close(should_close);
    }

    /// Poll and drain pending events
    pub fn poll_events(&mut self) -> Vec<glfw::WindowEvent> {
        self.glfw.poll_events();
        glfw::flush_messages(&self.events).map(|(_, event)| event).collect()
    }

    /// Block until an event arrives; used while minimized
    pub fn wait_events(&mut self) {
        self.glfw.wait_events();
    }

    pub fn framebuffer_extent(&self) -> Extent2D {
        let (width, height) = self.window.borrow().get_framebuffer_size();
        Extent2D::new(width.max(0) as u32, height.max(0) as u32)
    }

    /// GL function loader over the current context
    pub fn load_gl(&self) -> glow::Context {
        let mut window = self.window.borrow_mut();
        // SAFETY: the window's context was made current on this thread in `new`
        unsafe { glow::Context::from_loader_function(|name| window.get_proc_address(name) as *const _) }
    }

    /// Presentation target for the immediate backend
    pub fn gl_surface(&self) -> Box<dyn GlSurface> {
        Box::new(GlfwSurface(Rc::clone(&self.window)))
    }

    /// Surface source for the explicit backend
    pub fn vulkan_surface(&self) -> VulkanWindow<'_> {
        VulkanWindow(self)
    }
}

/// Explicit backend view of a [`Window`]
pub struct VulkanWindow<'a>(&'a Window);

impl VulkanSurfaceSource for VulkanWindow<'_> {
    fn required_instance_extensions(&self) -> GfxResult<Vec<CString>> {
        let names = self
            .0
            .glfw
            .get_required_instance_extensions()
            .ok_or(GfxError::FeatureNotSupported)?;
        names
            .into_iter()
            .map(|name| CString::new(name).map_err(|e| GfxError::Unknown(e.to_string())))
            .collect()
    }

    fn create_surface(&self, _entry: &ash::Entry, instance: &ash::Instance) -> GfxResult<vk::SurfaceKHR> {
        let mut surface = vk::SurfaceKHR::null();
        let result = self.0.window.borrow_mut().create_window_surface(instance.handle(), std::ptr::null(), &mut surface);
        if result == vk::Result::SUCCESS {
            Ok(surface)
        } else {
            Err(GfxError::from(result))
        }
    }
}

struct GlfwSurface(Rc<RefCell<glfw::PWindow>>);

impl GlSurface for GlfwSurface {
    fn swap_buffers(&mut self) -> Result<(), String> {
        self.0.borrow_mut().swap_buffers();
        Ok(())
    }

    fn set_swap_interval(&mut self, interval: u32) {
        let mut window = self.0.borrow_mut();
        let interval = if interval == 0 { glfw::SwapInterval::None } else { glfw::SwapInterval::Sync(interval) };
        window.glfw.set_swap_interval(interval);
    }

    fn extent(&self) -> Extent2D {
        let (width, height) = self.0.borrow().get_framebuffer_size();
        Extent2D::new(width.max(0) as u32, height.max(0) as u32)
    }
}
