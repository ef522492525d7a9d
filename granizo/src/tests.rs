// Tests for the parts of granizo that don't need a GPU
//
// Austin Shafer - 2024
use ash::vk;

use crate::arena::{Arena, Release};
use crate::device::find_memory_type;
use crate::frame::{clip_to_output, paint_area, record_region, RectRecorder};
use crate::image::{component_mapping, readback_rect};
use crate::instance::{has_instance_extensions, has_instance_layer, required_instance_extensions};
use crate::pipelines::{
    push_bytes, ComposePushConstants, FillColor, FillPushConstants, PUSH_COLOR_OFFSET,
    PUSH_RECT_OFFSET, PUSH_SIZE_OFFSET,
};
use crate::platform::{select_device, DeviceCandidate, ImportStrategy, ServerCaps};
use crate::shm::align_size;
use crate::swapchain::{image_entry, select_surface_format, AcquireSignal, BufferAges, ImageLayouts};
use crate::{parse_env_flag, Color, CreateInfo, GranizoError, Rect, Region, Result};

use std::ffi::CStr;

// ------------ buffer ages -------------

#[test]
fn buffer_ages_start_unknown() {
    let ages = BufferAges::new(3);
    assert_eq!(ages.len(), 3);
    for i in 0..3 {
        assert_eq!(ages.age(i), -1);
    }
    // out of range is unknown too
    assert_eq!(ages.age(7), -1);
}

#[test]
fn buffer_ages_after_presents() {
    let mut ages = BufferAges::new(2);

    ages.presented(0);
    assert_eq!(ages.age(0), 1);
    // never presented stays unknown
    assert_eq!(ages.age(1), -1);

    ages.presented(1);
    assert_eq!(ages.age(0), 2);
    assert_eq!(ages.age(1), 1);

    ages.presented(0);
    assert_eq!(ages.age(0), 1);
    assert_eq!(ages.age(1), 2);
}

#[test]
fn buffer_ages_grow_while_not_presented() {
    let mut ages = BufferAges::new(3);
    ages.presented(2);
    for _ in 0..4 {
        ages.presented(0);
    }
    assert_eq!(ages.age(0), 1);
    assert_eq!(ages.age(1), -1);
    assert_eq!(ages.age(2), 5);
}

// ------------ arena -------------

#[test]
fn arena_refcounting() {
    let mut arena = Arena::new();
    let h = arena.insert(String::from("pixmap"));

    // inserting counts as the first reference
    assert_eq!(arena.acquire(h), Some(2));
    assert_eq!(arena.release(h), Release::Remaining(1));
    assert_eq!(arena.get(h).map(|s| s.as_str()), Some("pixmap"));

    assert_eq!(arena.release(h), Release::Destroyed(String::from("pixmap")));
    assert!(arena.is_empty());
}

#[test]
fn arena_destroys_exactly_once() {
    let mut arena = Arena::new();
    let h = arena.insert(42);

    assert_eq!(arena.release(h), Release::Destroyed(42));
    assert_eq!(arena.release(h), Release::Stale);
    assert_eq!(arena.acquire(h), None);
    assert_eq!(arena.get(h), None);
}

#[test]
fn arena_stale_handle_after_reuse() {
    let mut arena = Arena::new();
    let old = arena.insert(1);
    assert_eq!(arena.release(old), Release::Destroyed(1));

    // the slot is reused but the old handle must not see the new entry
    let new = arena.insert(2);
    assert_eq!(old.index(), new.index());
    assert_ne!(old, new);
    assert_eq!(arena.get(old), None);
    assert_eq!(arena.get(new), Some(&2));
    assert_eq!(arena.release(old), Release::Stale);
    assert_eq!(arena.len(), 1);
}

#[test]
fn arena_drain() {
    let mut arena = Arena::new();
    let a = arena.insert(1);
    let _b = arena.insert(2);
    arena.acquire(a);

    assert_eq!(arena.drain(), vec![1, 2]);
    assert!(arena.is_empty());
    assert_eq!(arena.release(a), Release::Stale);
}

// ------------ device selection -------------

fn candidate(name: &str, api: u32, strategies: &[ImportStrategy]) -> DeviceCandidate {
    let mut exts = Vec::new();
    for s in strategies.iter() {
        for e in s.device_extensions().iter() {
            exts.push((*e).to_owned());
        }
    }

    DeviceCandidate {
        dc_name: name.to_string(),
        dc_type: vk::PhysicalDeviceType::DISCRETE_GPU,
        dc_api_version: api,
        dc_extensions: exts,
        dc_queue_family: Some(0),
    }
}

const BOTH: ServerCaps = ServerCaps {
    sc_dri3: true,
    sc_shm: true,
};

#[test]
fn dri3_preferred() {
    let cands = [
        candidate("shm only", vk::API_VERSION_1_3, &[ImportStrategy::Shm]),
        candidate(
            "both",
            vk::API_VERSION_1_3,
            &[ImportStrategy::Dri3, ImportStrategy::Shm],
        ),
    ];

    assert_eq!(
        select_device(&BOTH, &cands),
        Some((1, ImportStrategy::Dri3))
    );
}

#[test]
fn shm_fallback_when_server_lacks_dri3() {
    let caps = ServerCaps {
        sc_dri3: false,
        sc_shm: true,
    };
    let cands = [candidate(
        "both",
        vk::API_VERSION_1_3,
        &[ImportStrategy::Dri3, ImportStrategy::Shm],
    )];

    assert_eq!(select_device(&caps, &cands), Some((0, ImportStrategy::Shm)));
}

#[test]
fn first_device_wins() {
    let cands = [
        candidate("a", vk::API_VERSION_1_3, &[ImportStrategy::Dri3]),
        candidate("b", vk::API_VERSION_1_3, &[ImportStrategy::Dri3]),
    ];

    // asking twice gives the same answer
    for _ in 0..2 {
        assert_eq!(
            select_device(&BOTH, &cands),
            Some((0, ImportStrategy::Dri3))
        );
    }
}

#[test]
fn old_or_queueless_devices_skipped() {
    let mut no_queue = candidate("no queue", vk::API_VERSION_1_3, &[ImportStrategy::Dri3]);
    no_queue.dc_queue_family = None;
    let cands = [
        candidate("old", vk::API_VERSION_1_2, &[ImportStrategy::Dri3]),
        no_queue,
    ];

    assert_eq!(select_device(&BOTH, &cands), None);
}

#[test]
fn nothing_without_server_support() {
    let cands = [candidate(
        "both",
        vk::API_VERSION_1_3,
        &[ImportStrategy::Dri3, ImportStrategy::Shm],
    )];

    assert_eq!(select_device(&ServerCaps::default(), &cands), None);
}

#[test]
fn strategy_names() {
    assert_eq!(ImportStrategy::Dri3.to_string(), "DRI3");
    assert_eq!(ImportStrategy::Shm.to_string(), "SHM");
}

fn ext_props(name: &CStr) -> vk::ExtensionProperties {
    let mut props = vk::ExtensionProperties::default();
    for (dst, src) in props.extension_name.iter_mut().zip(name.to_bytes().iter()) {
        *dst = *src as _;
    }
    props
}

#[test]
fn instance_extension_check() {
    let req = required_instance_extensions();
    let all: Vec<_> = req.iter().map(|r| ext_props(r)).collect();

    assert!(has_instance_extensions(&all, &req));
    assert!(!has_instance_extensions(&all[..1], &req));
    assert!(!has_instance_extensions(&[], &req));
}

fn layer_props(name: &CStr) -> vk::LayerProperties {
    let mut props = vk::LayerProperties::default();
    for (dst, src) in props.layer_name.iter_mut().zip(name.to_bytes().iter()) {
        *dst = *src as _;
    }
    props
}

#[test]
fn validation_layer_lookup() {
    let validation = CStr::from_bytes_with_nul(b"VK_LAYER_KHRONOS_validation\0").unwrap();
    let other = CStr::from_bytes_with_nul(b"VK_LAYER_MESA_device_select\0").unwrap();

    assert!(has_instance_layer(
        &[layer_props(other), layer_props(validation)],
        validation
    ));
    // no layers installed at all
    assert!(!has_instance_layer(&[], validation));
    assert!(!has_instance_layer(&[layer_props(other)], validation));
}

// ------------ memory -------------

fn mem_props(flags: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
    let mut props = vk::PhysicalDeviceMemoryProperties::default();
    props.memory_type_count = flags.len() as u32;
    for (i, f) in flags.iter().enumerate() {
        props.memory_types[i].property_flags = *f;
    }
    props
}

#[test]
fn memory_type_selection() {
    let props = mem_props(&[
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
        vk::MemoryPropertyFlags::DEVICE_LOCAL | vk::MemoryPropertyFlags::HOST_VISIBLE,
    ]);

    assert_eq!(
        find_memory_type(&props, 0b111, vk::MemoryPropertyFlags::DEVICE_LOCAL),
        Some(1)
    );
    // only type 2 is allowed by the import
    assert_eq!(
        find_memory_type(&props, 0b100, vk::MemoryPropertyFlags::DEVICE_LOCAL),
        Some(2)
    );
    assert_eq!(
        find_memory_type(&props, 0b111, vk::MemoryPropertyFlags::HOST_VISIBLE),
        Some(0)
    );
    assert_eq!(
        find_memory_type(&props, 0b001, vk::MemoryPropertyFlags::DEVICE_LOCAL),
        None
    );
}

#[test]
fn memory_type_ignores_types_past_count() {
    let mut props = mem_props(&[vk::MemoryPropertyFlags::HOST_VISIBLE]);
    props.memory_types[1].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;

    assert_eq!(
        find_memory_type(&props, 0b11, vk::MemoryPropertyFlags::DEVICE_LOCAL),
        None
    );
}

#[test]
fn shm_size_rounding() {
    assert_eq!(align_size(64 * 64 * 4, 4096), 16384);
    assert_eq!(align_size(100, 4096), 4096);
    assert_eq!(align_size(4097, 4096), 8192);
    assert_eq!(align_size(0, 4096), 0);
    assert_eq!(align_size(123, 1), 123);
    assert_eq!(align_size(123, 0), 123);
}

// ------------ images -------------

#[test]
fn swizzle_with_alpha() {
    let map = component_mapping(true);
    assert_eq!(map.r, vk::ComponentSwizzle::B);
    assert_eq!(map.g, vk::ComponentSwizzle::G);
    assert_eq!(map.b, vk::ComponentSwizzle::R);
    assert_eq!(map.a, vk::ComponentSwizzle::A);
}

#[test]
fn swizzle_forces_opaque_without_alpha() {
    let map = component_mapping(false);
    assert_eq!(map.r, vk::ComponentSwizzle::B);
    assert_eq!(map.b, vk::ComponentSwizzle::R);
    assert_eq!(map.a, vk::ComponentSwizzle::ONE);
}

#[test]
fn readback_translates_to_image_space() {
    let extents = Rect::new(110, 120, 20, 30);
    assert_eq!(
        readback_rect(&extents, (100, 100), (64, 64)),
        Some(Rect::new(10, 20, 20, 30))
    );
}

#[test]
fn readback_clipped_to_image() {
    let extents = Rect::new(0, 0, 50, 50);
    assert_eq!(
        readback_rect(&extents, (10, 10), (20, 20)),
        Some(Rect::new(0, 0, 20, 20))
    );
    // nowhere near the image
    assert_eq!(readback_rect(&extents, (100, 100), (20, 20)), None);
}

// ------------ draw planning -------------

const OUTPUT: vk::Extent2D = vk::Extent2D {
    width: 100,
    height: 100,
};

fn area(x: i32, y: i32, width: u32, height: u32) -> vk::Rect2D {
    vk::Rect2D {
        offset: vk::Offset2D { x, y },
        extent: vk::Extent2D { width, height },
    }
}

#[derive(Default)]
struct MockRecorder {
    area: Option<vk::Rect2D>,
    draws: Vec<[i32; 4]>,
    ended: bool,
}

impl RectRecorder for MockRecorder {
    fn begin_rects(&mut self, area: &vk::Rect2D) -> Result<()> {
        self.area = Some(*area);
        Ok(())
    }

    fn draw_rect(&mut self, rect: [i32; 4]) -> Result<()> {
        self.draws.push(rect);
        Ok(())
    }

    fn end_rects(&mut self) -> Result<()> {
        self.ended = true;
        Ok(())
    }
}

#[test]
fn empty_region_records_nothing() {
    let mut rec = MockRecorder::default();
    assert_eq!(record_region(&mut rec, &Region::new(), OUTPUT).unwrap(), 0);
    assert!(rec.area.is_none());
    assert!(rec.draws.is_empty());
    assert!(!rec.ended);
}

#[test]
fn one_draw_per_rect() {
    let region = Region::from_rects(&[
        Rect::new(0, 0, 10, 10),
        Rect::new(20, 0, 10, 10),
        Rect::new(0, 40, 5, 5),
    ]);
    let mut rec = MockRecorder::default();

    assert_eq!(record_region(&mut rec, &region, OUTPUT).unwrap(), 3);
    assert_eq!(rec.area, Some(area(0, 0, 30, 45)));
    assert_eq!(
        rec.draws,
        vec![[0, 0, 10, 10], [20, 0, 30, 10], [0, 40, 5, 45]]
    );
    assert!(rec.ended);
}

#[test]
fn single_window_compose() {
    let region = Region::from_rects(&[Rect::new(0, 0, 64, 64)]);
    let mut rec = MockRecorder::default();

    assert_eq!(record_region(&mut rec, &region, OUTPUT).unwrap(), 1);
    assert_eq!(rec.draws, vec![[0, 0, 64, 64]]);
}

#[test]
fn offscreen_region_records_nothing() {
    let region = Region::from_rects(&[Rect::new(150, 20, 10, 10), Rect::new(-40, -40, 20, 20)]);
    let mut rec = MockRecorder::default();

    assert_eq!(record_region(&mut rec, &region, OUTPUT).unwrap(), 0);
    assert!(rec.area.is_none());
    assert!(rec.draws.is_empty());
    assert!(!rec.ended);
    assert_eq!(paint_area(&region, OUTPUT), None);
}

#[test]
fn partly_offscreen_region_area_is_clipped() {
    let region = Region::from_rects(&[Rect::new(90, 90, 20, 20)]);
    let mut rec = MockRecorder::default();

    assert_eq!(record_region(&mut rec, &region, OUTPUT).unwrap(), 1);
    assert_eq!(rec.area, Some(area(90, 90, 10, 10)));
    // the rect itself is left to the scissor
    assert_eq!(rec.draws, vec![[90, 90, 110, 110]]);
}

#[test]
fn render_area_clipped_to_output() {
    let extent = vk::Extent2D {
        width: 100,
        height: 100,
    };

    assert_eq!(
        clip_to_output(&Rect::new(-5, -5, 10, 10), extent),
        Some(area(0, 0, 5, 5))
    );
    assert_eq!(
        clip_to_output(&Rect::new(10, 20, 30, 40), extent),
        Some(area(10, 20, 30, 40))
    );

    assert_eq!(clip_to_output(&Rect::new(200, 200, 10, 10), extent), None);
    assert_eq!(clip_to_output(&Rect::new(-20, 10, 20, 10), extent), None);
    // on the output horizontally but not vertically
    assert_eq!(clip_to_output(&Rect::new(10, 100, 10, 10), extent), None);
}

// ------------ push constants -------------

#[test]
fn compose_push_constant_layout() {
    let push = ComposePushConstants {
        size: [1920, 1080],
        rect: [1, 2, 3, 4],
        image_offset: [-5, 6],
    };
    let bytes = push_bytes(&push).unwrap();

    assert_eq!(bytes.len(), 32);
    assert_eq!(bytes.len(), std::mem::size_of::<ComposePushConstants>());

    let size = PUSH_SIZE_OFFSET as usize;
    let rect = PUSH_RECT_OFFSET as usize;
    // image_offset follows the rect, as the compose vertex shader
    // declares it
    let offset = rect + 16;
    assert_eq!(&bytes[size..size + 4], &1920u32.to_le_bytes());
    assert_eq!(&bytes[size + 4..size + 8], &1080u32.to_le_bytes());
    assert_eq!(&bytes[rect..rect + 4], &1i32.to_le_bytes());
    assert_eq!(&bytes[rect + 12..rect + 16], &4i32.to_le_bytes());
    assert_eq!(&bytes[offset..offset + 4], &(-5i32).to_le_bytes());
    assert_eq!(&bytes[offset + 4..offset + 8], &6i32.to_le_bytes());
}

#[test]
fn fill_push_constant_layout() {
    let push = FillPushConstants {
        size: [640, 480],
        rect: [0, 0, 10, 10],
    };
    assert_eq!(push_bytes(&push).unwrap().len(), 24);

    let color = FillColor::from(Color::new(0.25, 0.5, 0.75, 1.0));
    let bytes = push_bytes(&color).unwrap();
    assert_eq!(bytes.len(), 16);
    assert_eq!(&bytes[0..4], &0.25f32.to_le_bytes());
    assert_eq!(&bytes[12..16], &1.0f32.to_le_bytes());

    // the color range starts right after the vertex range's alignment
    assert!(PUSH_COLOR_OFFSET as usize >= 24);
    assert_eq!(PUSH_COLOR_OFFSET % 16, 0);
}

#[test]
fn rect_push_is_sixteen_bytes() {
    assert_eq!(push_bytes(&[1i32, 2, 3, 4]).unwrap().len(), 16);
}

// ------------ swapchain -------------

#[test]
fn surface_format_selection() {
    let srgb = vk::SurfaceFormatKHR {
        format: vk::Format::B8G8R8A8_SRGB,
        color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
    };
    let unorm = vk::SurfaceFormatKHR {
        format: vk::Format::B8G8R8A8_UNORM,
        color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
    };

    assert_eq!(
        select_surface_format(&[srgb, unorm]).map(|f| f.format),
        Some(vk::Format::B8G8R8A8_UNORM)
    );
    assert!(select_surface_format(&[srgb]).is_none());
    assert!(select_surface_format(&[]).is_none());
}

#[test]
fn empty_swapchain_has_no_current_image() {
    let none: Vec<vk::Image> = Vec::new();
    assert_eq!(image_entry(&none, 0), Err(GranizoError::OUT_OF_DATE));

    let views = [vk::ImageView::null(); 3];
    assert!(image_entry(&views, 2).is_ok());
    assert_eq!(image_entry(&views, 3), Err(GranizoError::OUT_OF_DATE));

    let layouts = ImageLayouts::new(0);
    assert_eq!(layouts.get(0), Err(GranizoError::OUT_OF_DATE));
}

#[test]
fn layouts_start_undefined() {
    let mut layouts = ImageLayouts::new(2);
    assert_eq!(layouts.get(1), Ok(vk::ImageLayout::UNDEFINED));

    layouts
        .begin_frame(1, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
        .unwrap();
    layouts.set(1, vk::ImageLayout::PRESENT_SRC_KHR).unwrap();
    layouts.commit();
    assert_eq!(layouts.get(1), Ok(vk::ImageLayout::PRESENT_SRC_KHR));
    assert_eq!(layouts.get(0), Ok(vk::ImageLayout::UNDEFINED));

    // nothing to undo once committed
    layouts.rollback();
    assert_eq!(layouts.get(1), Ok(vk::ImageLayout::PRESENT_SRC_KHR));
}

#[test]
fn unsubmitted_frame_leaves_layout_alone() {
    let mut layouts = ImageLayouts::new(3);
    layouts
        .begin_frame(0, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
        .unwrap();
    layouts.set(0, vk::ImageLayout::PRESENT_SRC_KHR).unwrap();
    layouts.commit();

    // the next frame for image 0 fails to submit
    layouts
        .begin_frame(0, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
        .unwrap();
    layouts.set(0, vk::ImageLayout::PRESENT_SRC_KHR).unwrap();
    layouts.rollback();
    assert_eq!(layouts.get(0), Ok(vk::ImageLayout::PRESENT_SRC_KHR));

    // a first frame that fails goes back to undefined
    layouts
        .begin_frame(2, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
        .unwrap();
    layouts.rollback();
    assert_eq!(layouts.get(2), Ok(vk::ImageLayout::UNDEFINED));

    assert_eq!(
        layouts.begin_frame(3, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL),
        Err(GranizoError::OUT_OF_DATE)
    );
}

#[test]
fn acquire_signal_tracking() {
    let mut sig = AcquireSignal::default();
    assert!(!sig.is_pending());

    // acquired but the frame was never submitted
    sig.signaled();
    assert!(sig.is_pending());

    // submission waits on it
    sig.consumed();
    assert!(!sig.is_pending());
}

// ------------ configuration and errors -------------

#[test]
fn create_info_defaults() {
    let info = CreateInfo::builder().build();
    assert!(info.vsync);
    assert_eq!(info.validation, cfg!(debug_assertions));
    assert_eq!(info.screen, 0);

    let info = CreateInfo::builder()
        .vsync(false)
        .validation(true)
        .screen(1)
        .build();
    assert!(!info.vsync);
    assert!(info.validation);
    assert_eq!(info.screen, 1);
}

#[test]
fn env_flags() {
    assert_eq!(parse_env_flag("1"), Some(true));
    assert_eq!(parse_env_flag(" TRUE "), Some(true));
    assert_eq!(parse_env_flag("off"), Some(false));
    assert_eq!(parse_env_flag("0"), Some(false));
    assert_eq!(parse_env_flag("maybe"), None);
    assert_eq!(parse_env_flag(""), None);
}

#[test]
fn error_strings() {
    assert_eq!(
        GranizoError::FRAME_DROPPED.to_string(),
        "The frame was dropped, the next prepare may continue"
    );
    assert_eq!(
        GranizoError::NO_SUITABLE_MEMORY_TYPE.to_string(),
        "No memory type satisfies the allocation"
    );
    assert_eq!(
        GranizoError::UNSUPPORTED_FORMAT.to_string(),
        "The surface does not support the B8G8R8A8_UNORM output format"
    );
}
