// This module handles flagging the available behaviors
// supported by the device. Mostly this is which of the pixmap import
// strategies a device can do.
//
// Austin Shafer - 2021
use ash::extensions::khr;
use ash::vk;

use std::ffi::{CStr, CString};
use std::fmt;

/// How pixmaps get from the X server onto the GPU
///
/// This is picked once when the device is chosen and never changes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ImportStrategy {
    /// Import the pixmap's dmabuf directly. No copies.
    Dri3,
    /// Read the pixmap back through a shared memory segment and copy
    /// it into a device local image.
    Shm,
}

impl ImportStrategy {
    /// Strategies in order of preference
    pub const PRIORITY: [ImportStrategy; 2] = [ImportStrategy::Dri3, ImportStrategy::Shm];

    /// The device extensions this strategy needs on top of the swapchain
    pub fn device_extensions(&self) -> Vec<&'static CStr> {
        let mut ret = vec![khr::Swapchain::name()];

        match self {
            ImportStrategy::Dri3 => {
                ret.push(vk::ExtExternalMemoryDmaBufFn::name());
                ret.push(vk::ExtImageDrmFormatModifierFn::name());
                ret.push(khr::ExternalMemoryFd::name());
            }
            ImportStrategy::Shm => ret.push(vk::ExtExternalMemoryHostFn::name()),
        }

        ret
    }

    /// The X extension backing this strategy
    pub fn x_extension(&self) -> &'static str {
        match self {
            ImportStrategy::Dri3 => "DRI3",
            ImportStrategy::Shm => "SHM",
        }
    }
}

impl fmt::Display for ImportStrategy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.x_extension())
    }
}

/// The X extensions the server advertised
#[derive(Debug, Copy, Clone, Default, PartialEq)]
pub struct ServerCaps {
    pub sc_dri3: bool,
    pub sc_shm: bool,
}

impl ServerCaps {
    pub fn supports(&self, strategy: ImportStrategy) -> bool {
        match strategy {
            ImportStrategy::Dri3 => self.sc_dri3,
            ImportStrategy::Shm => self.sc_shm,
        }
    }
}

/// What we know about one physical device while choosing
///
/// This is filled out by the device module by querying Vulkan. Keeping
/// it as plain data lets the choice itself be made without a GPU.
#[derive(Debug, Clone)]
pub struct DeviceCandidate {
    pub dc_name: String,
    pub dc_type: vk::PhysicalDeviceType,
    pub dc_api_version: u32,
    pub dc_extensions: Vec<CString>,
    /// A queue family that can do graphics and present to our surface
    pub dc_queue_family: Option<u32>,
}

impl DeviceCandidate {
    fn has_extensions(&self, req: &[&CStr]) -> bool {
        req.iter()
            .all(|r| self.dc_extensions.iter().any(|e| e.as_c_str() == *r))
    }

    /// Can this device be used with `strategy`
    ///
    /// Dynamic rendering is core in 1.3, so anything older is skipped.
    pub fn supports(&self, strategy: ImportStrategy) -> bool {
        self.dc_api_version >= vk::API_VERSION_1_3
            && self.dc_queue_family.is_some()
            && self.has_extensions(&strategy.device_extensions())
    }
}

/// Choose a device and import strategy
///
/// Strategies are tried in priority order, and only if the X server
/// advertised them. For each one the first device that supports it
/// wins. Returns the index into `candidates`.
pub fn select_device(
    caps: &ServerCaps,
    candidates: &[DeviceCandidate],
) -> Option<(usize, ImportStrategy)> {
    ImportStrategy::PRIORITY
        .iter()
        .filter(|s| caps.supports(**s))
        .find_map(|s| {
            candidates
                .iter()
                .position(|c| c.supports(*s))
                .map(|i| (i, *s))
        })
}

/// Human readable physical device type for logging
pub fn device_type_name(ty: vk::PhysicalDeviceType) -> &'static str {
    match ty {
        vk::PhysicalDeviceType::INTEGRATED_GPU => "integrated GPU",
        vk::PhysicalDeviceType::DISCRETE_GPU => "discrete GPU",
        vk::PhysicalDeviceType::VIRTUAL_GPU => "virtual GPU",
        vk::PhysicalDeviceType::CPU => "CPU",
        _ => "other",
    }
}
