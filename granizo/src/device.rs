// Vulkan device representation
//
// This stores the per-GPU state: the logical device, our one queue and
// command buffer, and the synchronization objects that keep exactly
// one frame in flight.
//
// Austin Shafer - 2024

use ash::extensions::khr;
use ash::vk;

use crate::instance::Instance;
use crate::platform::{self, DeviceCandidate, ImportStrategy};
use crate::swapchain::PresentSurface;
use crate::xserver::XServer;
use crate::{GranizoError, Result};
use utils::log;

use std::ffi::CStr;
use std::os::raw::{c_char, c_void};
use std::os::unix::io::RawFd;
use std::sync::Arc;

/// Extension entry points for the import strategy in use
///
/// These are loaded once when the device is created.
pub(crate) enum ExternalMemoryFns {
    /// needed for vkGetMemoryFdPropertiesKHR
    Dmabuf(khr::ExternalMemoryFd),
    /// needed for vkGetMemoryHostPointerPropertiesEXT
    Host(vk::ExtExternalMemoryHostFn),
}

/// Find a memory type index
///
/// `type_bits` has bit i set if memory type i is acceptable. This is
/// normally the `memory_type_bits` of some requirements, possibly and-ed
/// with the bits an import reported as compatible. The first type whose
/// properties contain `flags` wins.
pub(crate) fn find_memory_type(
    props: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    flags: vk::MemoryPropertyFlags,
) -> Option<u32> {
    // for each memory type
    for (i, mem_type) in props
        .memory_types
        .iter()
        .enumerate()
        .take(props.memory_type_count as usize)
    {
        // Bit i of memoryBitTypes will be set if the resource supports
        // the ith memory type in props.
        if (type_bits >> i) & 1 == 1 && mem_type.property_flags.contains(flags) {
            return Some(i as u32);
        }
    }
    None
}

/// Granizo Device
///
/// This holds all of the Vulkan logic for the one GPU we render on.
/// Every handle in here starts out null and Drop only destroys the
/// ones that were created, so a failed `new` unwinds cleanly.
pub struct Device {
    pub(crate) inst: Arc<Instance>,
    /// the physical device selected to display to
    pub(crate) pdev: vk::PhysicalDevice,
    /// the logical device we are using
    pub(crate) dev: ash::Device,
    pub(crate) mem_props: vk::PhysicalDeviceMemoryProperties,
    /// How pixmaps are imported on this device
    pub(crate) d_strategy: ImportStrategy,
    /// minImportedHostPointerAlignment, only meaningful for Shm
    pub(crate) d_min_host_ptr_alignment: vk::DeviceSize,
    pub(crate) d_ext_mem: ExternalMemoryFns,
    pub(crate) d_queue_family: u32,
    /// The one queue we submit everything to
    pub(crate) d_queue: vk::Queue,
    /// pools provide the memory allocated to command buffers
    pub(crate) d_pool: vk::CommandPool,
    /// The command buffer everything gets recorded into
    pub(crate) d_cbuf: vk::CommandBuffer,
    /// Signaled by vkAcquireNextImageKHR. We wait on and reset it right
    /// after every acquire.
    pub(crate) d_acquire_fence: vk::Fence,
    /// Signaled when the last submission of d_cbuf completes. Created
    /// signaled so the first frame doesn't wait forever.
    pub(crate) d_submit_fence: vk::Fence,
    /// Signaled by acquire, waited on by the frame's submission which
    /// signals it again for present to wait on.
    pub(crate) d_sema: vk::Semaphore,
}

impl Device {
    /// Create a vkDevice from a vkPhysicalDevice
    ///
    /// Create a logical device for interfacing with the physical device.
    /// The extensions come from the import strategy, and we turn on
    /// dynamic rendering since we never create a render pass.
    ///
    /// One queue is created in `queue_family`.
    fn create_device(
        inst: &ash::Instance,
        pdev: vk::PhysicalDevice,
        strategy: ImportStrategy,
        queue_family: u32,
    ) -> Result<ash::Device> {
        let dev_extension_names: Vec<*const c_char> = strategy
            .device_extensions()
            .iter()
            .map(|e| e.as_ptr())
            .collect();

        let mut vulkan13_features = vk::PhysicalDeviceVulkan13Features::builder()
            .dynamic_rendering(true)
            .build();

        // for now we only have one graphics queue, so one priority
        let priorities = [1.0];
        let queue_infos = [vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(queue_family)
            .queue_priorities(&priorities)
            .build()];

        let dev_create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(dev_extension_names.as_slice())
            .push_next(&mut vulkan13_features);

        unsafe {
            inst.create_device(pdev, &dev_create_info, None)
                .or_else(|e| {
                    log::error!("Failed to create device: {:?}", e);
                    Err(GranizoError::INIT_FAILED)
                })
        }
    }

    /// Choose a queue family
    ///
    /// returns an index into the array of queue types. The family has to
    /// do graphics and be able to present to our window.
    fn select_queue_family(
        inst: &ash::Instance,
        pdev: vk::PhysicalDevice,
        surface: &PresentSurface,
        visual: u32,
    ) -> Option<u32> {
        // get the properties per queue family
        unsafe { inst.get_physical_device_queue_family_properties(pdev) }
            // for each property info
            .iter()
            .enumerate()
            .filter_map(|(index, info)| {
                let index = index as u32;
                match info.queue_flags.contains(vk::QueueFlags::GRAPHICS)
                    && surface.supports_queue_family(pdev, index, visual)
                {
                    true => Some(index),
                    false => None,
                }
            })
            .nth(0)
    }

    /// Gather what we need to know about a physical device to decide
    /// if it is usable.
    fn describe_pdev(
        inst: &ash::Instance,
        pdev: vk::PhysicalDevice,
        surface: &PresentSurface,
        visual: u32,
    ) -> DeviceCandidate {
        let props = unsafe { inst.get_physical_device_properties(pdev) };
        let name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        let exts = match unsafe { inst.enumerate_device_extension_properties(pdev) } {
            Ok(exts) => exts
                .iter()
                .map(|e| unsafe { CStr::from_ptr(e.extension_name.as_ptr()) }.to_owned())
                .collect(),
            Err(e) => {
                log::error!("Failed to enumerate device extension properties: {:?}", e);
                Vec::new()
            }
        };

        DeviceCandidate {
            dc_name: name,
            dc_type: props.device_type,
            dc_api_version: props.api_version,
            dc_extensions: exts,
            dc_queue_family: Self::select_queue_family(inst, pdev, surface, visual),
        }
    }

    /// Get minImportedHostPointerAlignment
    fn get_host_pointer_alignment(inst: &ash::Instance, pdev: vk::PhysicalDevice) -> u64 {
        let mut host_props = vk::PhysicalDeviceExternalMemoryHostPropertiesEXT::builder().build();
        let mut props = vk::PhysicalDeviceProperties2::builder()
            .push_next(&mut host_props)
            .build();

        unsafe { inst.get_physical_device_properties2(pdev, &mut props) };
        host_props.min_imported_host_pointer_alignment
    }

    /// Choose a physical device and create a Device on it
    ///
    /// The X server tells us which import strategies are possible, and
    /// the first device supporting the most preferred of those is used.
    /// See `platform::select_device`.
    pub fn new(instance: Arc<Instance>, surface: &PresentSurface, x: &XServer) -> Result<Self> {
        let caps = x.caps();
        if !caps.sc_dri3 && !caps.sc_shm {
            log::error!("The X server supports neither DRI3 nor MIT-SHM");
            return Err(GranizoError::NO_SUITABLE_DEVICE);
        }

        let pdevs = unsafe {
            instance.inst.enumerate_physical_devices().or_else(|e| {
                log::error!("Failed to enumerate physical devices: {:?}", e);
                Err(GranizoError::INIT_FAILED)
            })?
        };

        let candidates: Vec<DeviceCandidate> = pdevs
            .iter()
            .map(|p| Self::describe_pdev(&instance.inst, *p, surface, x.root_visual()))
            .collect();

        let (index, strategy) = match platform::select_device(&caps, &candidates) {
            Some(s) => s,
            None => {
                log::error!("Failed to find suitable physical device.");
                return Err(GranizoError::NO_SUITABLE_DEVICE);
            }
        };
        let pdev = pdevs[index];
        let cand = &candidates[index];
        let queue_family = cand.dc_queue_family.ok_or(GranizoError::NO_QUEUE_FAMILY)?;

        log::info!(
            "Selected physical device {}: {} ({}).",
            index,
            cand.dc_name,
            platform::device_type_name(cand.dc_type)
        );
        log::info!("Binding pixmaps using the X {} extension.", strategy);

        let alignment = match strategy {
            ImportStrategy::Shm => Self::get_host_pointer_alignment(&instance.inst, pdev),
            ImportStrategy::Dri3 => 1,
        };

        let mem_props = unsafe { instance.inst.get_physical_device_memory_properties(pdev) };
        let dev = Self::create_device(&instance.inst, pdev, strategy, queue_family)?;

        let ext_mem = match strategy {
            ImportStrategy::Dri3 => {
                ExternalMemoryFns::Dmabuf(khr::ExternalMemoryFd::new(&instance.inst, &dev))
            }
            ImportStrategy::Shm => {
                let handle = dev.handle();
                ExternalMemoryFns::Host(vk::ExtExternalMemoryHostFn::load(|name| unsafe {
                    std::mem::transmute(
                        instance.inst.get_device_proc_addr(handle, name.as_ptr()),
                    )
                }))
            }
        };
        let queue = unsafe { dev.get_device_queue(queue_family, 0) };

        let mut ret = Self {
            inst: instance,
            pdev: pdev,
            dev: dev,
            mem_props: mem_props,
            d_strategy: strategy,
            d_min_host_ptr_alignment: alignment,
            d_ext_mem: ext_mem,
            d_queue_family: queue_family,
            d_queue: queue,
            d_pool: vk::CommandPool::null(),
            d_cbuf: vk::CommandBuffer::null(),
            d_acquire_fence: vk::Fence::null(),
            d_submit_fence: vk::Fence::null(),
            d_sema: vk::Semaphore::null(),
        };

        ret.d_acquire_fence = ret.create_fence(false)?;
        ret.d_submit_fence = ret.create_fence(true)?;
        ret.d_sema = unsafe {
            ret.dev
                .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)
                .or_else(|e| {
                    log::error!("Failed to create semaphore: {:?}", e);
                    Err(GranizoError::INIT_FAILED)
                })?
        };
        ret.d_pool = ret.create_command_pool(queue_family)?;
        ret.d_cbuf = ret.create_command_buffer(ret.d_pool)?;

        Ok(ret)
    }

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let flags = match signaled {
            true => vk::FenceCreateFlags::SIGNALED,
            false => vk::FenceCreateFlags::empty(),
        };
        let info = vk::FenceCreateInfo::builder().flags(flags);

        unsafe {
            self.dev.create_fence(&info, None).or_else(|e| {
                log::error!("Failed to create fence: {:?}", e);
                Err(GranizoError::INIT_FAILED)
            })
        }
    }

    /// returns a new vkCommandPool
    ///
    /// Command buffers are allocated from command pools. That's about
    /// all they do. They just manage memory. Our one command buffer is
    /// reset every frame, so the pool has to allow that.
    fn create_command_pool(&self, queue_family: u32) -> Result<vk::CommandPool> {
        let pool_create_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queue_family);

        unsafe {
            self.dev
                .create_command_pool(&pool_create_info, None)
                .or_else(|e| {
                    log::error!("Failed to create command pool: {:?}", e);
                    Err(GranizoError::INIT_FAILED)
                })
        }
    }

    /// Allocate our primary command buffer
    ///
    /// Command buffer is shortened to `cbuf` in many areas of the code.
    fn create_command_buffer(&self, pool: vk::CommandPool) -> Result<vk::CommandBuffer> {
        let cbuf_allocate_info = vk::CommandBufferAllocateInfo::builder()
            .command_buffer_count(1)
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY);

        let cbufs = unsafe {
            self.dev
                .allocate_command_buffers(&cbuf_allocate_info)
                .or_else(|e| {
                    log::error!("Failed to allocate command buffers: {:?}", e);
                    Err(GranizoError::INIT_FAILED)
                })?
        };

        cbufs.get(0).copied().ok_or(GranizoError::INIT_FAILED)
    }

    pub(crate) fn find_memory_type_index(
        &self,
        type_bits: u32,
        flags: vk::MemoryPropertyFlags,
    ) -> Result<u32> {
        find_memory_type(&self.mem_props, type_bits, flags).ok_or_else(|| {
            log::error!("Failed to find suitable memory type.");
            GranizoError::NO_SUITABLE_MEMORY_TYPE
        })
    }

    /// Which memory types a dmabuf fd can be imported as
    pub(crate) fn memory_fd_type_bits(&self, fd: RawFd) -> Result<u32> {
        let loader = match &self.d_ext_mem {
            ExternalMemoryFns::Dmabuf(l) => l,
            ExternalMemoryFns::Host(_) => return Err(GranizoError::INVALID),
        };

        let props = unsafe {
            loader
                .get_memory_fd_properties(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT, fd)
                .or_else(|e| {
                    log::error!("Failed to get memory FD properties: {:?}", e);
                    Err(GranizoError::INVALID_FD)
                })?
        };

        Ok(props.memory_type_bits)
    }

    /// Which memory types a host allocation can be imported as
    pub(crate) fn host_pointer_type_bits(&self, ptr: *mut c_void) -> Result<u32> {
        let fns = match &self.d_ext_mem {
            ExternalMemoryFns::Host(f) => f,
            ExternalMemoryFns::Dmabuf(_) => return Err(GranizoError::INVALID),
        };

        let mut props = vk::MemoryHostPointerPropertiesEXT::default();
        let res = unsafe {
            (fns.get_memory_host_pointer_properties_ext)(
                self.dev.handle(),
                vk::ExternalMemoryHandleTypeFlags::HOST_ALLOCATION_EXT,
                ptr,
                &mut props,
            )
        };
        if res != vk::Result::SUCCESS {
            log::error!("Failed to get memory host pointer properties: {:?}", res);
            return Err(GranizoError::SHARED_MEMORY_FAILED);
        }

        Ok(props.memory_type_bits)
    }

    /// Wait for the last submission of our command buffer to finish and
    /// reset its fence
    ///
    /// This blocks without a timeout.
    pub(crate) fn wait_for_submit(&self) -> Result<()> {
        unsafe {
            self.dev
                .wait_for_fences(&[self.d_submit_fence], true, u64::MAX)
                .or_else(|e| {
                    log::error!("Failed to wait for fences: {:?}", e);
                    Err(GranizoError::TIMEOUT)
                })?;
            self.dev
                .reset_fences(&[self.d_submit_fence])
                .or_else(|e| {
                    log::error!("Failed to reset fences: {:?}", e);
                    Err(GranizoError::INVALID)
                })
        }
    }

    /// Wait for and reset the fence signaled by image acquisition
    pub(crate) fn wait_for_acquire(&self) -> Result<()> {
        unsafe {
            self.dev
                .wait_for_fences(&[self.d_acquire_fence], true, u64::MAX)
                .or_else(|e| {
                    log::error!("Failed to wait for fences: {:?}", e);
                    Err(GranizoError::COULD_NOT_ACQUIRE_NEXT_IMAGE)
                })?;
            self.dev
                .reset_fences(&[self.d_acquire_fence])
                .or_else(|e| {
                    log::error!("Failed to reset fences: {:?}", e);
                    Err(GranizoError::COULD_NOT_ACQUIRE_NEXT_IMAGE)
                })
        }
    }

    /// Reset and begin recording our command buffer
    ///
    /// The caller must have already waited for the submit fence.
    pub(crate) fn cbuf_begin_recording(&self, flags: vk::CommandBufferUsageFlags) -> Result<()> {
        unsafe {
            // first reset the queue so we know it is empty
            self.dev
                .reset_command_buffer(self.d_cbuf, vk::CommandBufferResetFlags::empty())
                .or_else(|e| {
                    log::error!("Failed to reset command buffer: {:?}", e);
                    Err(GranizoError::RECORDING_FAILED)
                })?;

            let record_info = vk::CommandBufferBeginInfo::builder().flags(flags);
            self.dev
                .begin_command_buffer(self.d_cbuf, &record_info)
                .or_else(|e| {
                    log::error!("Failed to begin command buffer: {:?}", e);
                    Err(GranizoError::RECORDING_FAILED)
                })
        }
    }

    pub(crate) fn cbuf_end_recording(&self) -> Result<()> {
        unsafe {
            self.dev.end_command_buffer(self.d_cbuf).or_else(|e| {
                log::error!("Failed to end command buffer: {:?}", e);
                Err(GranizoError::RECORDING_FAILED)
            })
        }
    }

    /// Submit the command buffer with no semaphores, signaling the
    /// submit fence when it is done.
    pub(crate) fn cbuf_submit_one_shot(&self) -> Result<()> {
        let cbufs = [self.d_cbuf];
        let submit_info = vk::SubmitInfo::builder().command_buffers(&cbufs).build();

        unsafe {
            self.dev
                .queue_submit(self.d_queue, &[submit_info], self.d_submit_fence)
                .or_else(|e| {
                    log::error!("Failed to queue submit: {:?}", e);
                    Err(GranizoError::RECORDING_FAILED)
                })
        }
    }

    /// Get the submit fence signaled again after a failed submission
    ///
    /// If a submission fails the fence was reset but will never be
    /// signaled, and the next wait on it would hang. An empty submission
    /// signals it once the queue drains.
    pub(crate) fn resignal_submit_fence(&self) {
        unsafe {
            if let Err(e) = self.dev.queue_submit(self.d_queue, &[], self.d_submit_fence) {
                log::error!("Could not re-signal the submit fence: {:?}", e);
            }
        }
    }

    /// Wait out a signal on d_sema that nothing else will wait on
    ///
    /// A binary semaphore must be unsignaled before an acquire may signal
    /// it again. This submits an empty batch waiting on it and idles
    /// the queue.
    pub(crate) fn consume_semaphore(&self) -> Result<()> {
        let semas = [self.d_sema];
        let stages = [vk::PipelineStageFlags::ALL_COMMANDS];
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&semas)
            .wait_dst_stage_mask(&stages)
            .build();

        unsafe {
            self.dev
                .queue_submit(self.d_queue, &[submit_info], vk::Fence::null())
                .or_else(|e| {
                    log::error!("Could not wait on the acquire semaphore: {:?}", e);
                    Err(GranizoError::COULD_NOT_CREATE_SWAPCHAIN)
                })?;
        }
        self.wait_idle();

        Ok(())
    }

    /// Record a layout transition of `image`
    ///
    /// Every barrier we need covers the single color mip/layer, so
    /// only the layouts, stages and access masks vary.
    pub(crate) fn cmd_image_barrier(
        &self,
        image: vk::Image,
        old: vk::ImageLayout,
        new: vk::ImageLayout,
        src: (vk::PipelineStageFlags, vk::AccessFlags),
        dst: (vk::PipelineStageFlags, vk::AccessFlags),
    ) {
        let layout_barrier = vk::ImageMemoryBarrier::builder()
            .image(image)
            .src_access_mask(src.1)
            .dst_access_mask(dst.1)
            .old_layout(old)
            .new_layout(new)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .subresource_range(
                vk::ImageSubresourceRange::builder()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .layer_count(1)
                    .level_count(1)
                    .build(),
            )
            .build();

        unsafe {
            self.dev.cmd_pipeline_barrier(
                self.d_cbuf,
                src.0,
                dst.0,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[layout_barrier],
            );
        }
    }

    /// Block until the GPU has finished all work
    pub(crate) fn wait_idle(&self) {
        unsafe {
            if let Err(e) = self.dev.device_wait_idle() {
                log::error!("Failed to wait for device idle: {:?}", e);
            }
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        unsafe {
            // first wait for the device to finish working
            self.wait_idle();

            // destroying the pool frees d_cbuf with it
            if self.d_pool != vk::CommandPool::null() {
                self.dev.destroy_command_pool(self.d_pool, None);
            }
            if self.d_sema != vk::Semaphore::null() {
                self.dev.destroy_semaphore(self.d_sema, None);
            }
            if self.d_submit_fence != vk::Fence::null() {
                self.dev.destroy_fence(self.d_submit_fence, None);
            }
            if self.d_acquire_fence != vk::Fence::null() {
                self.dev.destroy_fence(self.d_acquire_fence, None);
            }
            self.dev.destroy_device(None);
        }
    }
}
