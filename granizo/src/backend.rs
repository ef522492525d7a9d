// The Vulkan backend
//
// This owns every piece of the renderer and is what the window manager
// talks to. It tracks whether a frame is being recorded so that calls
// made out of order are refused instead of corrupting the command
// buffer.
//
// Austin Shafer - 2024
use x11rb::rust_connection::RustConnection;

use crate::arena::{Arena, Release};
use crate::descpool::DescriptorSystem;
use crate::device::Device;
use crate::frame::Frame;
use crate::image::BoundImage;
use crate::instance::Instance;
use crate::pipelines::PipelineSet;
use crate::platform::ImportStrategy;
use crate::swapchain::{PresentSurface, Swapchain};
use crate::xserver::XServer;
use crate::{
    Backend, Color, CreateInfo, GranizoError, ImageHandle, Region, Result, VisualInfo,
};
use utils::log;

use std::sync::Arc;

/// A Vulkan rendering backend for one output window
///
/// Fields are dropped top to bottom, which is the reverse of the order
/// they were created in.
pub struct VulkanBackend {
    vb_images: Arena<BoundImage>,
    /// Images released while a frame was being recorded. The frame's
    /// commands may still use them, so they are destroyed once it has
    /// been submitted.
    vb_deferred: Vec<BoundImage>,
    vb_pipes: PipelineSet,
    vb_desc: DescriptorSystem,
    vb_swapchain: Swapchain,
    vb_dev: Arc<Device>,
    vb_x: Arc<XServer>,
    /// Between prepare and present
    vb_recording: bool,
}

macro_rules! frame {
    ($self:ident) => {
        Frame {
            f_dev: &$self.vb_dev,
            f_swapchain: &mut $self.vb_swapchain,
            f_pipes: &$self.vb_pipes,
        }
    };
}

impl VulkanBackend {
    /// Initialize Vulkan and start rendering to `window`
    ///
    /// `conn` is the window manager's connection, used for all pixmap
    /// requests. Any failure here is fatal and everything created so far
    /// is torn down.
    pub fn new(conn: Arc<RustConnection>, window: u32, info: &CreateInfo) -> Result<Self> {
        let instance = Arc::new(Instance::new(info)?);
        let x = Arc::new(XServer::new(conn, info.screen)?);
        let surface = PresentSurface::new(instance.clone(), window)?;
        let dev = Arc::new(Device::new(instance, &surface, &x)?);
        let swapchain = Swapchain::new(dev.clone(), surface, info.vsync)?;
        let desc = DescriptorSystem::new(dev.clone())?;
        let pipes = PipelineSet::new(dev.clone(), desc.ds_layout, swapchain.sc_extent)?;

        log::info!(
            "Rendering to window {:#08x} at {}x{} with {} swapchain images",
            window,
            swapchain.sc_extent.width,
            swapchain.sc_extent.height,
            swapchain.sc_images.len()
        );

        Ok(Self {
            vb_images: Arena::new(),
            vb_deferred: Vec::new(),
            vb_pipes: pipes,
            vb_desc: desc,
            vb_swapchain: swapchain,
            vb_dev: dev,
            vb_x: x,
            vb_recording: false,
        })
    }

    /// Tear everything down
    ///
    /// Any images still bound are released regardless of their
    /// reference counts.
    pub fn deinit(mut self) {
        self.vb_dev.wait_idle();

        let remaining = self.vb_images.drain();
        if !remaining.is_empty() {
            log::debug!("Releasing {} images still bound at deinit", remaining.len());
        }
        drop(remaining);
        self.vb_deferred.clear();
    }

    /// The pixmap import strategy chosen at startup
    pub fn strategy(&self) -> ImportStrategy {
        self.vb_dev.d_strategy
    }

    /// The output size in pixels
    pub fn size(&self) -> (u32, u32) {
        let extent = self.vb_swapchain.sc_extent;
        (extent.width, extent.height)
    }

    /// Add a reference to a bound image
    ///
    /// The same handle is returned, and it takes one more
    /// `release_image` to destroy it.
    pub fn clone_image(&mut self, image: ImageHandle) -> Result<ImageHandle> {
        self.vb_images
            .acquire(image)
            .ok_or(GranizoError::INVALID_IMAGE)?;
        Ok(image)
    }

    /// Get the (width, height) of a bound image
    pub fn image_size(&self, image: ImageHandle) -> Result<(u32, u32)> {
        self.vb_images
            .get(image)
            .map(|i| i.size())
            .ok_or(GranizoError::INVALID_IMAGE)
    }

    /// Rebuild the swapchain, for example after the window was resized
    ///
    /// Buffer ages start over at -1. The pipelines are rebuilt if the
    /// size changed.
    pub fn recreate_swapchain(&mut self, vsync: bool) -> Result<()> {
        if self.vb_recording {
            log::error!("Cannot recreate the swapchain while recording a frame");
            return Err(GranizoError::INVALID);
        }

        self.vb_swapchain.recreate(vsync)?;

        let extent = self.vb_swapchain.sc_extent;
        if extent != self.vb_pipes.ps_extent {
            self.vb_pipes = PipelineSet::new(self.vb_dev.clone(), self.vb_desc.ds_layout, extent)?;
        }

        log::debug!(
            "Recreated swapchain at {}x{}",
            extent.width,
            extent.height
        );
        Ok(())
    }
}

impl Backend for VulkanBackend {
    fn prepare(&mut self, damage: &Region) -> Result<()> {
        if self.vb_recording {
            log::error!("prepare called while a frame is already being recorded");
            return Err(GranizoError::INVALID);
        }
        log::trace!("Preparing frame with {} damaged rects", damage.len());

        frame!(self).prepare()?;
        self.vb_recording = true;
        Ok(())
    }

    fn compose(&mut self, image: ImageHandle, offset: (i32, i32), paint: &Region) -> Result<()> {
        if !self.vb_recording {
            return Err(GranizoError::INVALID);
        }
        let img = self
            .vb_images
            .get(image)
            .ok_or(GranizoError::INVALID_IMAGE)?;

        let draws = frame!(self).compose(img, offset, paint)?;

        log::trace!("Composed pixmap {:#08x} with {} draws", img.pixmap(), draws);
        Ok(())
    }

    fn fill(&mut self, color: Color, region: &Region) -> Result<()> {
        if !self.vb_recording {
            return Err(GranizoError::INVALID);
        }

        frame!(self).fill(color, region)?;
        Ok(())
    }

    fn present(&mut self, damage: &Region) -> Result<()> {
        if !self.vb_recording {
            log::error!("present called without a prepared frame");
            return Err(GranizoError::INVALID);
        }
        log::trace!("Presenting frame with {} damaged rects", damage.len());

        self.vb_recording = false;
        let ret = frame!(self).present();

        // These wait for the device to go idle as they are destroyed
        self.vb_deferred.clear();

        ret
    }

    fn bind_pixmap(&mut self, pixmap: u32, visual: VisualInfo, owned: bool) -> Result<ImageHandle> {
        if self.vb_recording {
            log::error!("Cannot bind pixmap {:#08x} while recording a frame", pixmap);
            return Err(GranizoError::INVALID);
        }
        log::debug!("Binding pixmap {:#08x}", pixmap);

        let image = BoundImage::bind(
            self.vb_dev.clone(),
            self.vb_x.clone(),
            &mut self.vb_desc,
            pixmap,
            visual,
            owned,
        )
        .map_err(|e| {
            log::error!("Failed to bind pixmap {:#08x}: {}", pixmap, e);
            e
        })?;

        Ok(self.vb_images.insert(image))
    }

    fn release_image(&mut self, image: ImageHandle) -> Result<()> {
        match self.vb_images.release(image) {
            Release::Stale => Err(GranizoError::INVALID_IMAGE),
            Release::Remaining(_) => Ok(()),
            Release::Destroyed(img) => {
                match self.vb_recording {
                    true => self.vb_deferred.push(img),
                    false => drop(img),
                }
                Ok(())
            }
        }
    }

    fn buffer_age(&self) -> i32 {
        self.vb_swapchain.buffer_age()
    }
}
