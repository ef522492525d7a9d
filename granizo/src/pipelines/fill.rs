// The fill pipeline
//
// Paints a solid color over each rectangle of a region. There are no
// descriptors, everything comes in as push constants.
//
// Austin Shafer - 2024
use ash::vk;
use serde::Serialize;

use super::{Pipeline, ShaderSource, PUSH_COLOR_OFFSET};
use crate::device::Device;
use crate::{Color, Result};

use std::sync::Arc;

/// The vertex stage push constants of the fill pipeline
#[repr(C)]
#[derive(Serialize, Debug, Copy, Clone, PartialEq)]
pub struct FillPushConstants {
    pub size: [u32; 2],
    pub rect: [i32; 4],
}

/// The fragment stage push constant, at PUSH_COLOR_OFFSET
#[repr(C)]
#[derive(Serialize, Debug, Copy, Clone, PartialEq)]
pub struct FillColor {
    /// premultiplied rgba
    pub color: [f32; 4],
}

impl From<Color> for FillColor {
    fn from(c: Color) -> Self {
        Self {
            color: [c.red, c.green, c.blue, c.alpha],
        }
    }
}

pub(crate) const FILL_PUSH_SIZE: u32 = std::mem::size_of::<FillPushConstants>() as u32;
pub(crate) const FILL_COLOR_SIZE: u32 = std::mem::size_of::<FillColor>() as u32;

const SHADERS: ShaderSource = ShaderSource {
    vert: include_str!("shaders/fill.vert"),
    vert_name: "fill.vert",
    frag: include_str!("shaders/fill.frag"),
    frag_name: "fill.frag",
};

pub(crate) fn create(dev: Arc<Device>, extent: vk::Extent2D) -> Result<Pipeline> {
    let ranges = [
        vk::PushConstantRange::builder()
            .stage_flags(vk::ShaderStageFlags::VERTEX)
            .offset(0)
            .size(FILL_PUSH_SIZE)
            .build(),
        vk::PushConstantRange::builder()
            .stage_flags(vk::ShaderStageFlags::FRAGMENT)
            .offset(PUSH_COLOR_OFFSET)
            .size(FILL_COLOR_SIZE)
            .build(),
    ];

    Pipeline::new(dev, &[], &ranges, &SHADERS, extent)
}
