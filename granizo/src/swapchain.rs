// The presentation surface and its swapchain
//
// The swapchain owns the images we draw into, what layout each of them
// was last left in, and how many frames ago each was presented.
//
// Austin Shafer - 2024
use ash::extensions::khr;
use ash::vk;
use x11rb::xcb_ffi::XCBConnection;

use crate::device::Device;
use crate::instance::Instance;
use crate::{GranizoError, Result};
use utils::log;

use std::sync::Arc;

/// The one format we render and present in
pub(crate) const OUTPUT_FORMAT: vk::Format = vk::Format::B8G8R8A8_UNORM;

/// Per-image buffer ages
///
/// An age of -1 means we have no idea what the image holds, which is
/// the case until it has been presented once. Otherwise it is how many
/// presents ago this image was last presented.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferAges {
    ba_ages: Vec<i32>,
}

impl BufferAges {
    pub fn new(count: usize) -> Self {
        Self {
            ba_ages: vec![-1; count],
        }
    }

    pub fn len(&self) -> usize {
        self.ba_ages.len()
    }

    /// Age of image `index`. Unknown indices are -1.
    pub fn age(&self, index: usize) -> i32 {
        self.ba_ages.get(index).copied().unwrap_or(-1)
    }

    /// Record that image `index` was just presented
    ///
    /// It becomes age 1, and every other image that has been presented
    /// before gets one frame older.
    pub fn presented(&mut self, index: usize) {
        for (i, age) in self.ba_ages.iter_mut().enumerate() {
            if i == index {
                *age = 1;
            } else if *age != -1 {
                *age += 1;
            }
        }
    }
}

/// The layout each swapchain image is in
///
/// Transitions are recorded as soon as the barrier is, but only happen
/// if the frame is submitted. The layout an image had when the frame
/// began is kept so a frame that never reaches the queue can be undone.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageLayouts {
    il_layouts: Vec<vk::ImageLayout>,
    /// (image, layout) the image being drawn was in before this frame
    il_frame_start: Option<(usize, vk::ImageLayout)>,
}

impl ImageLayouts {
    pub fn new(count: usize) -> Self {
        Self {
            il_layouts: vec![vk::ImageLayout::UNDEFINED; count],
            il_frame_start: None,
        }
    }

    pub fn get(&self, index: usize) -> Result<vk::ImageLayout> {
        self.il_layouts
            .get(index)
            .copied()
            .ok_or(GranizoError::OUT_OF_DATE)
    }

    pub fn set(&mut self, index: usize, layout: vk::ImageLayout) -> Result<()> {
        let l = self
            .il_layouts
            .get_mut(index)
            .ok_or(GranizoError::OUT_OF_DATE)?;
        *l = layout;
        Ok(())
    }

    /// The first transition of image `index` in a new frame
    pub fn begin_frame(&mut self, index: usize, layout: vk::ImageLayout) -> Result<()> {
        let old = self.get(index)?;
        self.il_frame_start = Some((index, old));
        self.set(index, layout)
    }

    /// The frame was submitted, its transitions will happen
    pub fn commit(&mut self) {
        self.il_frame_start = None;
    }

    /// The frame was never submitted
    pub fn rollback(&mut self) {
        if let Some((index, layout)) = self.il_frame_start.take() {
            if let Some(l) = self.il_layouts.get_mut(index) {
                *l = layout;
            }
        }
    }
}

/// Whether the acquire has signaled d_sema without anyone waiting on it
///
/// The frame's submission waits on that signal. Until it does, the
/// semaphore may not be handed to another acquire.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct AcquireSignal {
    as_pending: bool,
}

impl AcquireSignal {
    pub fn signaled(&mut self) {
        self.as_pending = true;
    }

    pub fn consumed(&mut self) {
        self.as_pending = false;
    }

    pub fn is_pending(&self) -> bool {
        self.as_pending
    }
}

/// Entry `index` of a per-image list
///
/// Lists are empty when the swapchain could not be rebuilt, in which
/// case there is nothing to draw into until it is.
pub(crate) fn image_entry<T: Copy>(list: &[T], index: u32) -> Result<T> {
    list.get(index as usize)
        .copied()
        .ok_or(GranizoError::OUT_OF_DATE)
}

/// Pick our output format out of what the surface offers
pub(crate) fn select_surface_format(
    formats: &[vk::SurfaceFormatKHR],
) -> Option<vk::SurfaceFormatKHR> {
    formats.iter().find(|f| f.format == OUTPUT_FORMAT).copied()
}

/// A VkSurfaceKHR for an X window
///
/// The surface is created on its own xcb connection, separate from the
/// window manager's, which lives as long as the surface does.
pub struct PresentSurface {
    /// The surface must be destroyed before the instance
    #[allow(dead_code)]
    ps_inst: Arc<Instance>,
    ps_loader: khr::Surface,
    ps_xcb_loader: khr::XcbSurface,
    pub(crate) ps_surface: vk::SurfaceKHR,
    /// Must outlive ps_surface, so it is declared after it
    ps_conn: XCBConnection,
}

impl PresentSurface {
    pub fn new(inst: Arc<Instance>, window: u32) -> Result<Self> {
        let (conn, _) = XCBConnection::connect(None).map_err(|e| {
            log::error!("Failed to connect to the X server: {:?}", e);
            GranizoError::INIT_FAILED
        })?;

        let loader = khr::Surface::new(&inst.loader, &inst.inst);
        let xcb_loader = khr::XcbSurface::new(&inst.loader, &inst.inst);

        let info = vk::XcbSurfaceCreateInfoKHR::builder()
            .connection(conn.get_raw_xcb_connection() as *mut vk::xcb_connection_t)
            .window(window);

        let surface = unsafe {
            xcb_loader.create_xcb_surface(&info, None).or_else(|e| {
                log::error!("Failed to create surface: {:?}", e);
                Err(GranizoError::INIT_FAILED)
            })?
        };

        Ok(Self {
            ps_inst: inst,
            ps_loader: loader,
            ps_xcb_loader: xcb_loader,
            ps_surface: surface,
            ps_conn: conn,
        })
    }

    /// Can queue `family` of `pdev` present to this surface
    ///
    /// This checks both the xcb presentation support for windows using
    /// `visual` and support for our particular surface.
    pub fn supports_queue_family(&self, pdev: vk::PhysicalDevice, family: u32, visual: u32) -> bool {
        unsafe {
            let raw = self.ps_conn.get_raw_xcb_connection() as *mut vk::xcb_connection_t;
            if raw.is_null()
                || !self.ps_xcb_loader.get_physical_device_xcb_presentation_support(
                    pdev,
                    family,
                    &mut *raw,
                    visual,
                )
            {
                return false;
            }

            match self
                .ps_loader
                .get_physical_device_surface_support(pdev, family, self.ps_surface)
            {
                Ok(supported) => supported,
                Err(e) => {
                    log::error!("Failed to get physical device surface support: {:?}", e);
                    false
                }
            }
        }
    }
}

impl Drop for PresentSurface {
    fn drop(&mut self) {
        if self.ps_surface != vk::SurfaceKHR::null() {
            unsafe { self.ps_loader.destroy_surface(self.ps_surface, None) };
        }
    }
}

/// A Vulkan swapchain for our output window
pub struct Swapchain {
    sc_dev: Arc<Device>,
    /// loads swapchain extension
    sc_loader: khr::Swapchain,
    /// the actual swapchain
    sc_swapchain: vk::SwapchainKHR,
    /// Size of the swapchain images
    pub(crate) sc_extent: vk::Extent2D,
    /// a set of images belonging to swapchain
    pub(crate) sc_images: Vec<vk::Image>,
    pub(crate) sc_layouts: ImageLayouts,
    /// views describing how to access the images
    pub(crate) sc_views: Vec<vk::ImageView>,
    pub(crate) sc_ages: BufferAges,
    /// index into sc_images of the image being drawn into
    pub(crate) sc_current: u32,
    pub(crate) sc_acquire: AcquireSignal,
    /// Declared last so it outlives the swapchain
    sc_surface: PresentSurface,
}

impl Swapchain {
    /// Create a swapchain for `surface` and acquire its first image
    pub fn new(dev: Arc<Device>, surface: PresentSurface, vsync: bool) -> Result<Self> {
        let loader = khr::Swapchain::new(&dev.inst.inst, &dev.dev);

        let mut ret = Self {
            sc_dev: dev,
            sc_loader: loader,
            sc_swapchain: vk::SwapchainKHR::null(),
            sc_extent: vk::Extent2D::default(),
            sc_images: Vec::new(),
            sc_layouts: ImageLayouts::new(0),
            sc_views: Vec::new(),
            sc_ages: BufferAges::new(0),
            sc_current: 0,
            sc_acquire: AcquireSignal::default(),
            sc_surface: surface,
        };

        // On failure ret is dropped, which cleans up whatever was made
        ret.create(vsync)?;

        Ok(ret)
    }

    /// Create the swapchain, its views, and acquire the first image
    fn create(&mut self, vsync: bool) -> Result<()> {
        let pdev = self.sc_dev.pdev;
        let surface = self.sc_surface.ps_surface;
        let surface_loader = &self.sc_surface.ps_loader;

        let caps = unsafe {
            surface_loader
                .get_physical_device_surface_capabilities(pdev, surface)
                .or_else(|e| {
                    log::error!("Failed to get physical device surface capabilities: {:?}", e);
                    Err(GranizoError::COULD_NOT_CREATE_SWAPCHAIN)
                })?
        };
        let formats = unsafe {
            surface_loader
                .get_physical_device_surface_formats(pdev, surface)
                .or_else(|e| {
                    log::error!("Failed to get physical device surface formats: {:?}", e);
                    Err(GranizoError::COULD_NOT_CREATE_SWAPCHAIN)
                })?
        };
        let format = select_surface_format(&formats).ok_or_else(|| {
            log::error!("Failed to find suitable surface format.");
            GranizoError::UNSUPPORTED_FORMAT
        })?;

        let present_mode = match vsync {
            true => vk::PresentModeKHR::FIFO,
            false => vk::PresentModeKHR::IMMEDIATE,
        };
        self.sc_extent = caps.current_extent;
        // minimized, there is nothing to present to until it is mapped again
        if self.sc_extent.width == 0 || self.sc_extent.height == 0 {
            log::debug!("Surface has no area, not creating a swapchain");
            return Err(GranizoError::OUT_OF_DATE);
        }

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface)
            .min_image_count(caps.min_image_count)
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(self.sc_extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true);

        unsafe {
            self.sc_swapchain = self
                .sc_loader
                .create_swapchain(&create_info, None)
                .or_else(|e| {
                    log::error!("Failed to create swapchain: {:?}", e);
                    Err(GranizoError::COULD_NOT_CREATE_SWAPCHAIN)
                })?;

            self.sc_images = self
                .sc_loader
                .get_swapchain_images(self.sc_swapchain)
                .or_else(|e| {
                    log::error!("Failed to get swapchain images: {:?}", e);
                    Err(GranizoError::COULD_NOT_CREATE_SWAPCHAIN)
                })?;
        }
        self.sc_layouts = ImageLayouts::new(self.sc_images.len());

        for image in self.sc_images.iter() {
            let view_info = vk::ImageViewCreateInfo::builder()
                .image(*image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(format.format)
                .components(vk::ComponentMapping::default())
                .subresource_range(
                    vk::ImageSubresourceRange::builder()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .level_count(1)
                        .layer_count(1)
                        .build(),
                );

            let view = unsafe {
                self.sc_dev
                    .dev
                    .create_image_view(&view_info, None)
                    .or_else(|e| {
                        log::error!("Failed to create image view: {:?}", e);
                        Err(GranizoError::COULD_NOT_CREATE_SWAPCHAIN)
                    })?
            };
            self.sc_views.push(view);
        }

        self.sc_ages = BufferAges::new(self.sc_images.len());

        self.acquire_next()
    }

    /// Acquire the next image to draw into
    ///
    /// This blocks until an image is available.
    pub fn acquire_next(&mut self) -> Result<()> {
        let (index, _) = unsafe {
            self.sc_loader
                .acquire_next_image(
                    self.sc_swapchain,
                    u64::MAX,
                    self.sc_dev.d_sema,
                    self.sc_dev.d_acquire_fence,
                )
                .map_err(|e| {
                    log::error!("Failed to acquire next image: {:?}", e);
                    match e {
                        vk::Result::ERROR_OUT_OF_DATE_KHR => GranizoError::OUT_OF_DATE,
                        _ => GranizoError::COULD_NOT_ACQUIRE_NEXT_IMAGE,
                    }
                })?
        };
        self.sc_current = index;
        self.sc_acquire.signaled();

        self.sc_dev.wait_for_acquire()
    }

    /// Present the current image
    ///
    /// Waits on the device semaphore, which the frame's submission signals.
    pub fn present(&mut self) -> Result<()> {
        let wait_semas = [self.sc_dev.d_sema];
        let swapchains = [self.sc_swapchain];
        let indices = [self.sc_current];
        let info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semas)
            .swapchains(&swapchains)
            .image_indices(&indices);

        unsafe {
            match self.sc_loader.queue_present(self.sc_dev.d_queue, &info) {
                Ok(_) => Ok(()),
                Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(GranizoError::OUT_OF_DATE),
                Err(e) => {
                    log::error!("Failed to queue present: {:?}", e);
                    Err(GranizoError::PRESENT_FAILED)
                }
            }
        }
    }

    pub fn current_image(&self) -> Result<vk::Image> {
        image_entry(&self.sc_images, self.sc_current)
    }

    pub fn current_view(&self) -> Result<vk::ImageView> {
        image_entry(&self.sc_views, self.sc_current)
    }

    pub fn current_layout(&self) -> Result<vk::ImageLayout> {
        self.sc_layouts.get(self.sc_current as usize)
    }

    /// Age of the image about to be drawn into
    pub fn buffer_age(&self) -> i32 {
        self.sc_ages.age(self.sc_current as usize)
    }

    /// Tear down and rebuild the swapchain
    ///
    /// This is how a resize is handled: the new size is whatever the
    /// surface reports now.
    pub fn recreate(&mut self, vsync: bool) -> Result<()> {
        self.sc_dev.wait_idle();
        if self.sc_acquire.is_pending() {
            self.sc_dev.consume_semaphore()?;
            self.sc_acquire.consumed();
        }
        self.destroy();
        self.create(vsync)
    }

    /// Free the swapchain and its views
    ///
    /// Anything that was never created is skipped, so this is safe on a
    /// partially built swapchain.
    fn destroy(&mut self) {
        unsafe {
            for view in self.sc_views.drain(..) {
                if view != vk::ImageView::null() {
                    self.sc_dev.dev.destroy_image_view(view, None);
                }
            }
            if self.sc_swapchain != vk::SwapchainKHR::null() {
                self.sc_loader.destroy_swapchain(self.sc_swapchain, None);
                self.sc_swapchain = vk::SwapchainKHR::null();
            }
        }
        self.sc_images.clear();
        self.sc_layouts = ImageLayouts::new(0);
        self.sc_ages = BufferAges::new(0);
        self.sc_current = 0;
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        self.sc_dev.wait_idle();
        self.destroy();
    }
}
