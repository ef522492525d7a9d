// Pixmap import
//
// A BoundImage is a window's pixmap made sampleable. With DRI3 the
// image aliases the server's dmabuf. With MIT-SHM it is a device local
// copy that gets refreshed from a shared memory segment on every
// compose.
//
// Austin Shafer - 2024
use ash::vk;
use nix::fcntl::{fcntl, FcntlArg};
use x11rb::protocol::shm;
use x11rb::protocol::xproto::Pixmap;

use crate::descpool::{Descriptor, DescriptorSystem};
use crate::device::Device;
use crate::platform::ImportStrategy;
use crate::shm::{align_size, ShmSegment};
use crate::xserver::XServer;
use crate::{GranizoError, Rect, Result, VisualInfo};
use utils::log;

use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd};
use std::sync::Arc;

/// Pixmaps are 32bpp BGRA in memory, which we sample as RGBA and
/// swizzle back.
pub(crate) const PIXMAP_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;
const BYTES_PER_PIXEL: u64 = 4;

/// Swizzle to view BGRA pixmap data stored in an RGBA image
///
/// Without an alpha channel the visual's padding byte is garbage, so
/// alpha is forced to one.
pub(crate) fn component_mapping(has_alpha: bool) -> vk::ComponentMapping {
    vk::ComponentMapping {
        r: vk::ComponentSwizzle::B,
        g: vk::ComponentSwizzle::G,
        b: vk::ComponentSwizzle::R,
        a: match has_alpha {
            true => vk::ComponentSwizzle::A,
            false => vk::ComponentSwizzle::ONE,
        },
    }
}

/// The part of an image to read back for a compose
///
/// `extents` is the compose area in output coordinates and `offset` is
/// where the image's top left corner lands. The result is in image
/// coordinates, clipped to the image. None if nothing of the image is
/// covered.
pub(crate) fn readback_rect(
    extents: &Rect<i32>,
    offset: (i32, i32),
    size: (u32, u32),
) -> Option<Rect<i32>> {
    let end = extents.end();
    let x1 = (extents.r_pos.0 - offset.0).max(0);
    let y1 = (extents.r_pos.1 - offset.1).max(0);
    let x2 = (end.0 - offset.0).min(size.0 as i32);
    let y2 = (end.1 - offset.1).min(size.1 as i32);

    let ret = Rect::from_corners(x1, y1, x2, y2);
    match ret.is_empty() {
        true => None,
        false => Some(ret),
    }
}

/// The staging side of a MIT-SHM import
///
/// Fields are dropped in order after `drop`, so the segment outlives
/// the Vulkan memory imported from it.
struct ShmStaging {
    ss_dev: Arc<Device>,
    ss_x: Arc<XServer>,
    ss_buffer: vk::Buffer,
    ss_mem: vk::DeviceMemory,
    /// The server side segment id, None until attached
    ss_xseg: Option<shm::Seg>,
    ss_segment: ShmSegment,
}

impl Drop for ShmStaging {
    fn drop(&mut self) {
        unsafe {
            if self.ss_buffer != vk::Buffer::null() {
                self.ss_dev.dev.destroy_buffer(self.ss_buffer, None);
            }
            if self.ss_mem != vk::DeviceMemory::null() {
                self.ss_dev.dev.free_memory(self.ss_mem, None);
            }
        }
        if let Some(seg) = self.ss_xseg.take() {
            self.ss_x.shm_detach(seg);
        }
    }
}

/// An X pixmap imported into Vulkan
///
/// Everything starts out null. Drop destroys whatever exists, so an
/// import that fails part way through is unwound by dropping it.
pub struct BoundImage {
    bi_dev: Arc<Device>,
    bi_x: Arc<XServer>,
    bi_pixmap: Pixmap,
    /// Free the pixmap when we are destroyed
    bi_owned: bool,
    bi_has_alpha: bool,
    bi_width: u32,
    bi_height: u32,
    bi_image: vk::Image,
    bi_mem: vk::DeviceMemory,
    bi_view: vk::ImageView,
    bi_desc: Option<Descriptor>,
    bi_shm: Option<ShmStaging>,
}

impl BoundImage {
    /// Import `pixmap` with the device's strategy
    ///
    /// When this returns the image is in SHADER_READ_ONLY_OPTIMAL (once
    /// the one-shot transition submitted here completes) and has a
    /// descriptor pointing at it.
    pub fn bind(
        dev: Arc<Device>,
        x: Arc<XServer>,
        desc: &mut DescriptorSystem,
        pixmap: Pixmap,
        visual: VisualInfo,
        owned: bool,
    ) -> Result<Self> {
        let mut ret = Self {
            bi_dev: dev,
            bi_x: x,
            bi_pixmap: pixmap,
            bi_owned: owned,
            bi_has_alpha: visual.has_alpha(),
            bi_width: 0,
            bi_height: 0,
            bi_image: vk::Image::null(),
            bi_mem: vk::DeviceMemory::null(),
            bi_view: vk::ImageView::null(),
            bi_desc: None,
            bi_shm: None,
        };

        match ret.bi_dev.d_strategy {
            ImportStrategy::Dri3 => ret.bind_dri3()?,
            ImportStrategy::Shm => ret.bind_shm()?,
        }

        ret.bi_view = ret.create_view()?;

        let d = desc.alloc_descriptor()?;
        desc.write(&d, ret.bi_view);
        ret.bi_desc = Some(d);

        ret.transition_to_shader_read()?;

        Ok(ret)
    }

    fn create_image(
        &self,
        tiling: vk::ImageTiling,
        usage: vk::ImageUsageFlags,
        ext_mem_info: Option<&mut vk::ExternalMemoryImageCreateInfo>,
        drm_info: Option<&mut vk::ImageDrmFormatModifierExplicitCreateInfoEXT>,
    ) -> Result<vk::Image> {
        let extent = vk::Extent3D {
            width: self.bi_width,
            height: self.bi_height,
            depth: 1,
        };
        let mut image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(PIXMAP_FORMAT)
            .extent(extent)
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(tiling)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        if let Some(info) = ext_mem_info {
            image_info = image_info.push_next(info);
        }
        if let Some(info) = drm_info {
            image_info = image_info.push_next(info);
        }

        unsafe {
            self.bi_dev.dev.create_image(&image_info, None).or_else(|e| {
                log::error!("Failed to create image: {:?}", e);
                Err(GranizoError::COULD_NOT_CREATE_IMAGE)
            })
        }
    }

    /// Import the pixmap's dmabuf
    fn bind_dri3(&mut self) -> Result<()> {
        let buf = self.bi_x.buffers_from_pixmap(self.bi_pixmap)?;
        self.bi_width = buf.pb_width as u32;
        self.bi_height = buf.pb_height as u32;

        let layouts = [vk::SubresourceLayout::builder()
            .offset(buf.pb_offset as u64)
            .row_pitch(buf.pb_stride as u64)
            .size(0)
            .build()];
        let mut drm_create_info = vk::ImageDrmFormatModifierExplicitCreateInfoEXT::builder()
            .drm_format_modifier(buf.pb_modifier)
            .plane_layouts(&layouts)
            .build();
        let mut ext_mem_info = vk::ExternalMemoryImageCreateInfo::builder()
            .handle_types(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT)
            .build();

        self.bi_image = self.create_image(
            vk::ImageTiling::DRM_FORMAT_MODIFIER_EXT,
            vk::ImageUsageFlags::SAMPLED,
            Some(&mut ext_mem_info),
            Some(&mut drm_create_info),
        )?;

        // The import takes ownership of the fd it is given, so hand it a
        // dup and keep ours.
        let fd = match fcntl(buf.pb_fd.as_raw_fd(), FcntlArg::F_DUPFD_CLOEXEC(0)) {
            Ok(f) => unsafe { OwnedFd::from_raw_fd(f) },
            Err(e) => {
                log::error!("Could not dup dmabuf fd: {}", e);
                return Err(GranizoError::INVALID_FD);
            }
        };

        let reqs = unsafe { self.bi_dev.dev.get_image_memory_requirements(self.bi_image) };
        let fd_bits = self.bi_dev.memory_fd_type_bits(fd.as_raw_fd())?;
        let mem_type = self.bi_dev.find_memory_type_index(
            reqs.memory_type_bits & fd_bits,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;

        let mut import_fd_info = vk::ImportMemoryFdInfoKHR::builder()
            .handle_type(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT)
            .fd(fd.as_raw_fd())
            .build();
        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(reqs.size)
            .memory_type_index(mem_type)
            .push_next(&mut import_fd_info);

        self.bi_mem = unsafe {
            self.bi_dev
                .dev
                .allocate_memory(&alloc_info, None)
                .or_else(|e| {
                    log::error!("Failed to allocate memory: {:?}", e);
                    Err(GranizoError::BIND_FAILED)
                })?
        };
        // The driver owns the dup now
        let _ = fd.into_raw_fd();

        unsafe {
            self.bi_dev
                .dev
                .bind_image_memory(self.bi_image, self.bi_mem, 0)
                .or_else(|e| {
                    log::error!("Failed to bind image memory: {:?}", e);
                    Err(GranizoError::BIND_FAILED)
                })
        }
    }

    /// Create the device local image and the shared memory staging
    /// buffer it is refreshed from
    fn bind_shm(&mut self) -> Result<()> {
        let (width, height) = self.bi_x.geometry(self.bi_pixmap)?;
        self.bi_width = width as u32;
        self.bi_height = height as u32;

        self.bi_image = self.create_image(
            vk::ImageTiling::OPTIMAL,
            vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
            None,
            None,
        )?;

        let reqs = unsafe { self.bi_dev.dev.get_image_memory_requirements(self.bi_image) };
        let mem_type = self
            .bi_dev
            .find_memory_type_index(reqs.memory_type_bits, vk::MemoryPropertyFlags::DEVICE_LOCAL)?;
        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(reqs.size)
            .memory_type_index(mem_type);

        unsafe {
            self.bi_mem = self
                .bi_dev
                .dev
                .allocate_memory(&alloc_info, None)
                .or_else(|e| {
                    log::error!("Failed to allocate memory: {:?}", e);
                    Err(GranizoError::BIND_FAILED)
                })?;
            self.bi_dev
                .dev
                .bind_image_memory(self.bi_image, self.bi_mem, 0)
                .or_else(|e| {
                    log::error!("Failed to bind image memory: {:?}", e);
                    Err(GranizoError::BIND_FAILED)
                })?;
        }

        let size = align_size(
            self.bi_width as u64 * self.bi_height as u64 * BYTES_PER_PIXEL,
            self.bi_dev.d_min_host_ptr_alignment,
        );
        let mut staging = ShmStaging {
            ss_dev: self.bi_dev.clone(),
            ss_x: self.bi_x.clone(),
            ss_buffer: vk::Buffer::null(),
            ss_mem: vk::DeviceMemory::null(),
            ss_xseg: None,
            ss_segment: ShmSegment::new(size as usize)?,
        };
        staging.ss_xseg = Some(self.bi_x.shm_attach(staging.ss_segment.id())?);

        let mut ext_info = vk::ExternalMemoryBufferCreateInfo::builder()
            .handle_types(vk::ExternalMemoryHandleTypeFlags::HOST_ALLOCATION_EXT);
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(vk::BufferUsageFlags::TRANSFER_SRC)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .push_next(&mut ext_info);

        staging.ss_buffer = unsafe {
            self.bi_dev
                .dev
                .create_buffer(&buffer_info, None)
                .or_else(|e| {
                    log::error!("Failed to create buffer: {:?}", e);
                    Err(GranizoError::BIND_FAILED)
                })?
        };

        let buf_reqs = unsafe {
            self.bi_dev
                .dev
                .get_buffer_memory_requirements(staging.ss_buffer)
        };
        let host_bits = self
            .bi_dev
            .host_pointer_type_bits(staging.ss_segment.addr())?;
        let mem_type = self.bi_dev.find_memory_type_index(
            buf_reqs.memory_type_bits & host_bits,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
        )?;

        let mut import_info = vk::ImportMemoryHostPointerInfoEXT::builder()
            .handle_type(vk::ExternalMemoryHandleTypeFlags::HOST_ALLOCATION_EXT)
            .host_pointer(staging.ss_segment.addr());
        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(buf_reqs.size)
            .memory_type_index(mem_type)
            .push_next(&mut import_info);

        unsafe {
            staging.ss_mem = self
                .bi_dev
                .dev
                .allocate_memory(&alloc_info, None)
                .or_else(|e| {
                    log::error!("Failed to allocate memory: {:?}", e);
                    Err(GranizoError::SHARED_MEMORY_FAILED)
                })?;
            self.bi_dev
                .dev
                .bind_buffer_memory(staging.ss_buffer, staging.ss_mem, 0)
                .or_else(|e| {
                    log::error!("Failed to bind buffer memory: {:?}", e);
                    Err(GranizoError::SHARED_MEMORY_FAILED)
                })?;
        }

        self.bi_shm = Some(staging);
        Ok(())
    }

    fn create_view(&self) -> Result<vk::ImageView> {
        let view_info = vk::ImageViewCreateInfo::builder()
            .image(self.bi_image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(PIXMAP_FORMAT)
            .components(component_mapping(self.bi_has_alpha))
            .subresource_range(
                vk::ImageSubresourceRange::builder()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .level_count(1)
                    .layer_count(1)
                    .build(),
            );

        unsafe {
            self.bi_dev
                .dev
                .create_image_view(&view_info, None)
                .or_else(|e| {
                    log::error!("Failed to create image view: {:?}", e);
                    Err(GranizoError::COULD_NOT_CREATE_IMAGE)
                })
        }
    }

    /// Move the new image into the layout compose samples it in
    ///
    /// This uses the device's one command buffer, so it waits for the
    /// last frame's submission first.
    fn transition_to_shader_read(&self) -> Result<()> {
        let dev = &self.bi_dev;
        dev.wait_for_submit()?;

        let res = dev
            .cbuf_begin_recording(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
            .and_then(|_| {
                dev.cmd_image_barrier(
                    self.bi_image,
                    vk::ImageLayout::UNDEFINED,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    (vk::PipelineStageFlags::TOP_OF_PIPE, vk::AccessFlags::empty()),
                    (
                        vk::PipelineStageFlags::FRAGMENT_SHADER,
                        vk::AccessFlags::SHADER_READ,
                    ),
                );
                dev.cbuf_end_recording()
            })
            .and_then(|_| dev.cbuf_submit_one_shot());

        if res.is_err() {
            dev.resignal_submit_fence();
        }
        res
    }

    /// Refresh `area` of a MIT-SHM image from its pixmap
    ///
    /// `area` is in image coordinates. The pixels are read into the
    /// segment synchronously, then a copy into the image is recorded
    /// into the frame's command buffer. Does nothing for DRI3 images,
    /// which always see the pixmap's current contents.
    ///
    /// The segment mirrors the image row for row and whole rows are read
    /// back, so uploads recorded earlier in the same frame still find
    /// their pixels when the copies execute.
    pub fn record_shm_upload(&self, area: &Rect<i32>) -> Result<()> {
        let staging = match self.bi_shm.as_ref() {
            Some(s) => s,
            None => return Ok(()),
        };
        let seg = staging.ss_xseg.ok_or(GranizoError::SHARED_MEMORY_FAILED)?;

        let stride = self.bi_width as u64 * BYTES_PER_PIXEL;
        let rows = Rect::new(0, area.r_pos.1, self.bi_width as i32, area.r_size.1);
        let rows_offset = area.r_pos.1 as u64 * stride;
        self.bi_x
            .shm_get_image(self.bi_pixmap, &rows, seg, rows_offset as u32)?;

        let dev = &self.bi_dev;
        dev.cmd_image_barrier(
            self.bi_image,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            (
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::AccessFlags::SHADER_READ,
            ),
            (
                vk::PipelineStageFlags::TRANSFER,
                vk::AccessFlags::TRANSFER_WRITE,
            ),
        );

        let region = vk::BufferImageCopy::builder()
            .buffer_offset(rows_offset + area.r_pos.0 as u64 * BYTES_PER_PIXEL)
            .buffer_row_length(self.bi_width)
            .buffer_image_height(0)
            .image_subresource(
                vk::ImageSubresourceLayers::builder()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .mip_level(0)
                    .base_array_layer(0)
                    .layer_count(1)
                    .build(),
            )
            .image_offset(vk::Offset3D {
                x: area.r_pos.0,
                y: area.r_pos.1,
                z: 0,
            })
            .image_extent(vk::Extent3D {
                width: area.r_size.0 as u32,
                height: area.r_size.1 as u32,
                depth: 1,
            })
            .build();

        unsafe {
            dev.dev.cmd_copy_buffer_to_image(
                dev.d_cbuf,
                staging.ss_buffer,
                self.bi_image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
        }

        dev.cmd_image_barrier(
            self.bi_image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            (
                vk::PipelineStageFlags::TRANSFER,
                vk::AccessFlags::TRANSFER_WRITE,
            ),
            (
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::AccessFlags::SHADER_READ,
            ),
        );

        Ok(())
    }

    pub fn size(&self) -> (u32, u32) {
        (self.bi_width, self.bi_height)
    }

    pub fn pixmap(&self) -> Pixmap {
        self.bi_pixmap
    }

    pub(crate) fn descriptor_set(&self) -> Option<vk::DescriptorSet> {
        self.bi_desc.as_ref().map(|d| d.d_set)
    }
}

impl Drop for BoundImage {
    fn drop(&mut self) {
        // Nothing may still be reading from us
        self.bi_dev.wait_idle();

        self.bi_desc.take();
        unsafe {
            if self.bi_view != vk::ImageView::null() {
                self.bi_dev.dev.destroy_image_view(self.bi_view, None);
            }
        }
        self.bi_shm.take();
        unsafe {
            if self.bi_image != vk::Image::null() {
                self.bi_dev.dev.destroy_image(self.bi_image, None);
            }
            if self.bi_mem != vk::DeviceMemory::null() {
                self.bi_dev.dev.free_memory(self.bi_mem, None);
            }
        }
        if self.bi_owned && self.bi_pixmap != x11rb::NONE {
            self.bi_x.free_pixmap(self.bi_pixmap);
        }
    }
}
