//! # Granizo
//!
//! Granizo is the Vulkan rendering backend of an X11 compositing
//! window manager. It takes pixmaps owned by the X server, imports them
//! into sampleable Vulkan images, composites them onto a window through
//! a swapchain, and hands back buffer ages so the caller only has to
//! repaint what changed.
//!
//! ## Usage
//!
//! The window manager drives granizo through the [`Backend`] trait:
//!
//! ```ignore
//! let info = granizo::CreateInfo::builder().vsync(true).build();
//! let mut backend = granizo::VulkanBackend::new(conn, window, &info)?;
//!
//! let img = backend.bind_pixmap(pixmap, VisualInfo { alpha_size: 8 }, false)?;
//!
//! // one frame
//! backend.prepare(&damage)?;
//! backend.fill(Color::new(0.0, 0.0, 0.0, 1.0), &background)?;
//! backend.compose(img, (x, y), &paint)?;
//! backend.present(&damage)?;
//!
//! backend.release_image(img)?;
//! ```
//!
//! ## Pixmap import
//!
//! There are two ways of getting a pixmap's contents onto the GPU, and
//! which one is used is decided once when the device is picked:
//!
//! * DRI3: the X server exports the pixmap as a dmabuf, which we import
//! with `VK_EXT_external_memory_dma_buf` and
//! `VK_EXT_image_drm_format_modifier`. The GPU samples the server's
//! buffer directly and nothing is copied.
//! * MIT-SHM: a System V shared memory segment is attached to the X
//! server and imported as a host pointer with
//! `VK_EXT_external_memory_host`. Every compose reads the damaged
//! area back into the segment and copies it into a device local image.
//!
//! DRI3 is always preferred if both the server and a device support it.
//!
//! ## Synchronization
//!
//! There is exactly one frame in flight. `prepare` waits on the fence
//! signaled by the last `present`'s submission before recording into the
//! one command buffer again. Binding images uses the same command buffer
//! and fence for its layout transition, and releasing an image waits for
//! the device to go idle before anything is destroyed.
//!
//! ## Architecture
//!
//! * `instance` - the VkInstance and validation plumbing
//! * `device` - physical device selection, queue, command buffer, fences
//! * `swapchain` - the presentation surface, swapchain images, buffer ages
//! * `image` - pixmap import for both strategies
//! * `pipelines` - the compose and fill pipelines
//! * `frame` - per frame recording and presentation
//! * `backend` - ties all of the above together

// Austin Shafer - 2020
#![allow(non_camel_case_types)]
extern crate ash;
extern crate thiserror;
extern crate utils;

mod arena;
mod backend;
mod descpool;
mod device;
mod frame;
mod image;
mod instance;
mod pipelines;
mod platform;
mod shm;
mod swapchain;
mod xserver;

#[cfg(test)]
mod tests;

pub use arena::Handle as ImageHandle;
pub use backend::VulkanBackend;
pub use platform::ImportStrategy;
pub use utils::region::{Rect, Region};

use thiserror::Error;

/// How many frames of buffer age history are meaningful
///
/// Ages above this should be treated as if the whole output is damaged.
pub const MAX_BUFFER_AGE: i32 = 5;

/// Environment variable that overrides `CreateInfo::validation`
pub const VALIDATION_ENV: &str = "GRANIZO_VALIDATION";

/// Granizo errors
///
/// These are grouped roughly by where they can happen. The first set
/// only come out of initialization and are fatal, the middle set fail a
/// single bind, and the last set come from presenting a frame.
#[derive(Error, Eq, PartialEq, Debug, Clone, Copy)]
pub enum GranizoError {
    #[error("Operation timed out")]
    TIMEOUT,
    #[error("Operation is not ready")]
    NOT_READY,
    #[error("Invalid operation")]
    INVALID,
    #[error("Initialization failed")]
    INIT_FAILED,
    #[error("A required Vulkan instance extension is not present")]
    MISSING_INSTANCE_EXTENSION,
    #[error("No Vulkan device supports a usable pixmap import strategy")]
    NO_SUITABLE_DEVICE,
    #[error("No queue family supports both graphics and presentation")]
    NO_QUEUE_FAMILY,
    #[error("The surface does not support the B8G8R8A8_UNORM output format")]
    UNSUPPORTED_FORMAT,
    #[error("Could not create the swapchain")]
    COULD_NOT_CREATE_SWAPCHAIN,
    #[error("Could not compile shader")]
    SHADER_COMPILE_FAILED,
    #[error("Could not create pipeline")]
    COULD_NOT_CREATE_PIPELINE,
    #[error("No memory type satisfies the allocation")]
    NO_SUITABLE_MEMORY_TYPE,
    #[error("Could not create image")]
    COULD_NOT_CREATE_IMAGE,
    #[error("Could not bind pixmap")]
    BIND_FAILED,
    #[error("Invalid file descriptor")]
    INVALID_FD,
    #[error("Shared memory segment operation failed")]
    SHARED_MEMORY_FAILED,
    #[error("Could not allocate descriptor")]
    COULD_NOT_ALLOCATE_DESCRIPTOR,
    #[error("Image handle does not refer to a bound image")]
    INVALID_IMAGE,
    #[error("X11 request failed")]
    X_REQUEST_FAILED,
    #[error("Command buffer recording failed")]
    RECORDING_FAILED,
    #[error("Swapchain is out of date")]
    OUT_OF_DATE,
    #[error("Could not acquire next swapchain image")]
    COULD_NOT_ACQUIRE_NEXT_IMAGE,
    #[error("Failed to present the frame")]
    PRESENT_FAILED,
    #[error("The frame was dropped, the next prepare may continue")]
    FRAME_DROPPED,
}

pub type Result<T> = std::result::Result<T, GranizoError>;

/// Visual information for a pixmap being bound
///
/// We only care about whether there is an alpha channel. If there is
/// none the alpha channel is forced to opaque when sampling.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct VisualInfo {
    /// Number of bits of alpha in the pixmap's visual
    pub alpha_size: u8,
}

impl VisualInfo {
    pub fn has_alpha(&self) -> bool {
        self.alpha_size > 0
    }
}

/// A premultiplied RGBA color
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Color {
    pub red: f32,
    pub green: f32,
    pub blue: f32,
    pub alpha: f32,
}

impl Color {
    pub fn new(red: f32, green: f32, blue: f32, alpha: f32) -> Self {
        Self {
            red: red,
            green: green,
            blue: blue,
            alpha: alpha,
        }
    }
}

/// The rendering backend contract
///
/// The window manager calls these once per frame in the order
/// `prepare`, any number of `compose` and `fill`, then `present`.
/// Pixmaps can be bound and released in between frames.
pub trait Backend {
    /// Begin recording a frame into the current swapchain image
    fn prepare(&mut self, damage: &Region) -> Result<()>;

    /// Draw `image` with its top left corner at `offset`, limited to
    /// the rectangles in `paint`.
    fn compose(&mut self, image: ImageHandle, offset: (i32, i32), paint: &Region) -> Result<()>;

    /// Fill every rectangle in `region` with `color`
    fn fill(&mut self, color: Color, region: &Region) -> Result<()>;

    /// Submit the recorded frame and present it
    ///
    /// A failure here means this frame was not shown. The backend stays
    /// usable and the next `prepare` may go ahead.
    fn present(&mut self, damage: &Region) -> Result<()>;

    /// Import an X pixmap
    ///
    /// If `owned` is set the pixmap will be freed when the image is
    /// released.
    fn bind_pixmap(&mut self, pixmap: u32, visual: VisualInfo, owned: bool)
        -> Result<ImageHandle>;

    /// Drop one reference to `image`, destroying it if it was the last.
    fn release_image(&mut self, image: ImageHandle) -> Result<()>;

    /// The age of the image that will be drawn into next
    ///
    /// -1 means the contents are unknown.
    fn buffer_age(&self) -> i32;

    fn max_buffer_age(&self) -> i32 {
        MAX_BUFFER_AGE
    }
}

/// Parameters for creating a backend
pub struct CreateInfo {
    /// Present with FIFO instead of IMMEDIATE
    pub vsync: bool,
    /// Enable the Khronos validation layer and forward its messages
    /// to the log
    pub validation: bool,
    /// The X screen the output window lives on
    pub screen: usize,
}

impl CreateInfo {
    pub fn builder() -> CreateInfoBuilder {
        CreateInfoBuilder {
            ci: CreateInfo {
                vsync: true,
                validation: cfg!(debug_assertions),
                screen: 0,
            },
        }
    }

    /// Should validation be enabled
    ///
    /// The environment wins over whatever was set in the builder.
    pub(crate) fn validation_enabled(&self) -> bool {
        match std::env::var(VALIDATION_ENV) {
            Ok(v) => parse_env_flag(&v).unwrap_or(self.validation),
            Err(_) => self.validation,
        }
    }
}

/// Parse a boolean environment flag
pub(crate) fn parse_env_flag(val: &str) -> Option<bool> {
    match val.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Implements the builder pattern for easier backend creation
pub struct CreateInfoBuilder {
    ci: CreateInfo,
}

impl CreateInfoBuilder {
    pub fn vsync<'a>(&'a mut self, vsync: bool) -> &'a mut Self {
        self.ci.vsync = vsync;
        self
    }

    pub fn validation<'a>(&'a mut self, validation: bool) -> &'a mut Self {
        self.ci.validation = validation;
        self
    }

    pub fn screen<'a>(&'a mut self, screen: usize) -> &'a mut Self {
        self.ci.screen = screen;
        self
    }

    pub fn build(&self) -> CreateInfo {
        CreateInfo {
            vsync: self.ci.vsync,
            validation: self.ci.validation,
            screen: self.ci.screen,
        }
    }
}
