// The compose pipeline
//
// Samples one bound image over each rectangle of the paint region.
//
// Austin Shafer - 2024
use ash::vk;
use serde::Serialize;

use super::{Pipeline, ShaderSource};
use crate::device::Device;
use crate::Result;

use std::sync::Arc;

/// The vertex stage push constants of the compose pipeline
///
/// `size` and `image_offset` are pushed once per compose, `rect` once
/// per rectangle drawn.
#[repr(C)]
#[derive(Serialize, Debug, Copy, Clone, PartialEq)]
pub struct ComposePushConstants {
    /// output size in pixels
    pub size: [u32; 2],
    /// x1, y1, x2, y2 of the rectangle being drawn
    pub rect: [i32; 4],
    /// where the image's top left corner is on the output
    pub image_offset: [i32; 2],
}

pub(crate) const COMPOSE_PUSH_SIZE: u32 = std::mem::size_of::<ComposePushConstants>() as u32;

const SHADERS: ShaderSource = ShaderSource {
    vert: include_str!("shaders/compose.vert"),
    vert_name: "compose.vert",
    frag: include_str!("shaders/compose.frag"),
    frag_name: "compose.frag",
};

/// Create the compose pipeline
///
/// `set_layout` is the bound image's combined image sampler, set 0.
pub(crate) fn create(
    dev: Arc<Device>,
    set_layout: vk::DescriptorSetLayout,
    extent: vk::Extent2D,
) -> Result<Pipeline> {
    let ranges = [vk::PushConstantRange::builder()
        .stage_flags(vk::ShaderStageFlags::VERTEX)
        .offset(0)
        .size(COMPOSE_PUSH_SIZE)
        .build()];

    Pipeline::new(dev, &[set_layout], &ranges, &SHADERS, extent)
}
