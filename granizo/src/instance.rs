// Vulkan rendering instance
//
// This holds all of the common instance code for the Vulkan context
//
// Austin Shafer - 2020

use ash::extensions::{ext, khr};
use ash::{vk, Entry};

use crate::{CreateInfo, GranizoError, Result};
use utils::log;

use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_void};

// this happy little debug callback is from the ash examples
// all it does is forward any errors/warnings thrown to our log.
unsafe extern "system" fn vulkan_debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_types: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut c_void,
) -> u32 {
    let msg = match p_callback_data.as_ref() {
        Some(data) if !data.p_message.is_null() => CStr::from_ptr(data.p_message)
            .to_string_lossy()
            .into_owned(),
        _ => String::from("<no message>"),
    };

    if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::error!("[VK][{:?}] {}", message_types, msg);
    } else if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        log::warn!("[VK][{:?}] {}", message_types, msg);
    } else {
        log::debug!("[VK][{:?}] {}", message_types, msg);
    }

    vk::FALSE
}

/// Instance extensions we cannot live without
pub(crate) fn required_instance_extensions() -> [&'static CStr; 2] {
    [khr::Surface::name(), khr::XcbSurface::name()]
}

/// Check that every name in `req` appears in `available`
pub(crate) fn has_instance_extensions(
    available: &[vk::ExtensionProperties],
    req: &[&CStr],
) -> bool {
    req.iter().all(|r| {
        available.iter().any(|e| {
            let estr = unsafe { CStr::from_ptr(e.extension_name.as_ptr()) };
            estr == *r
        })
    })
}

/// Is the layer `name` in `available`
pub(crate) fn has_instance_layer(available: &[vk::LayerProperties], name: &CStr) -> bool {
    available.iter().any(|l| {
        let lstr = unsafe { CStr::from_ptr(l.layer_name.as_ptr()) };
        lstr == name
    })
}

/// A Vulkan Instance
///
/// This holds our basic vulkan session data. We use this to create
/// the device and surface which granizo will use internally to render.
pub struct Instance {
    /// debug callback sugar mentioned earlier. Only present if
    /// validation was requested.
    debug: Option<(ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,

    /// the entry just loads function pointers from the dynamic library
    /// I am calling it a loader, because that's what it does
    pub(crate) loader: Entry,
    /// the big vulkan instance.
    pub(crate) inst: ash::Instance,
}

impl Instance {
    /// Creates a new debug reporter and registers our function
    /// for debug callbacks so we get nice error messages
    fn setup_debug(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Option<(ext::DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::INFO,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION,
            )
            .pfn_user_callback(Some(vulkan_debug_callback));

        let dr_loader = ext::DebugUtils::new(entry, instance);
        match unsafe { dr_loader.create_debug_utils_messenger(&debug_info, None) } {
            Ok(callback) => Some((dr_loader, callback)),
            Err(e) => {
                log::warn!("Could not create debug messenger: {:?}", e);
                None
            }
        }
    }

    /// Create a vkInstance
    ///
    /// We need VK_KHR_surface and VK_KHR_xcb_surface, and ask for
    /// Vulkan 1.3 since we render with dynamic rendering. If validation
    /// is on we also turn on the Khronos layer and debug utils.
    pub fn new(info: &CreateInfo) -> Result<Self> {
        let entry = Entry::linked();
        let app_name = CString::new("Granizo").or(Err(GranizoError::INVALID))?;

        let available = entry
            .enumerate_instance_extension_properties(None)
            .or_else(|e| {
                log::error!("Failed to enumerate instance extension properties: {:?}", e);
                Err(GranizoError::INIT_FAILED)
            })?;

        let required = required_instance_extensions();
        for r in required.iter() {
            if !has_instance_extensions(&available, &[*r]) {
                log::error!("No {:?} instance extension.", r);
                return Err(GranizoError::MISSING_INSTANCE_EXTENSION);
            }
        }
        let mut extension_names_raw: Vec<*const c_char> =
            required.iter().map(|e| e.as_ptr()).collect();

        let mut validation = info.validation_enabled();
        if validation && !has_instance_extensions(&available, &[ext::DebugUtils::name()]) {
            log::warn!("Validation requested but VK_EXT_debug_utils is missing, disabling it");
            validation = false;
        }

        let validation_layer =
            CString::new("VK_LAYER_KHRONOS_validation").or(Err(GranizoError::INVALID))?;
        if validation {
            let layers = entry.enumerate_instance_layer_properties().unwrap_or_else(|e| {
                log::error!("Failed to enumerate instance layers: {:?}", e);
                Vec::new()
            });
            if !has_instance_layer(&layers, &validation_layer) {
                log::warn!("Validation requested but the Khronos validation layer is not installed, disabling it");
                validation = false;
            }
        }

        let layer_names = match validation {
            true => vec![validation_layer],
            false => Vec::new(),
        };
        let layer_names_raw: Vec<*const c_char> = layer_names
            .iter()
            .map(|raw_name: &CString| raw_name.as_ptr())
            .collect();

        if validation {
            extension_names_raw.push(ext::DebugUtils::name().as_ptr());
        }

        let appinfo = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .application_version(0)
            .engine_name(&app_name)
            .engine_version(0)
            .api_version(vk::API_VERSION_1_3);

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&appinfo)
            .enabled_layer_names(&layer_names_raw)
            .enabled_extension_names(&extension_names_raw);

        let instance: ash::Instance = unsafe {
            entry.create_instance(&create_info, None).or_else(|e| {
                log::error!("Failed to create instance: {:?}", e);
                Err(GranizoError::INIT_FAILED)
            })?
        };

        let debug = match validation {
            true => Self::setup_debug(&entry, &instance),
            false => None,
        };

        Ok(Self {
            loader: entry,
            inst: instance,
            debug: debug,
        })
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        unsafe {
            if let Some((loader, callback)) = self.debug.take() {
                loader.destroy_debug_utils_messenger(callback, None);
            }
            self.inst.destroy_instance(None);
        }
    }
}
