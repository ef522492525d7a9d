//!# Granizo Render Pipelines
//!
//!There are exactly two ways we draw, and each has one graphics
//!pipeline built at startup:
//!
//!* `compose` - samples a bound image over a set of rectangles.
//!* `fill` - paints a solid color over a set of rectangles.
//!
//!Both draw every rectangle as a 4 vertex triangle strip whose corners
//!come from push constants and gl_VertexIndex, so there are no vertex
//!buffers. They render with dynamic rendering straight into the
//!swapchain format, blend premultiplied over, and leave only the
//!scissor dynamic.
//!
//!The shaders are GLSL embedded in the binary and compiled to SPIR-V
//!with shaderc when the pipelines are created.

// Austin Shafer - 2024
use ash::vk;
use serde::Serialize;

pub mod compose;
pub mod fill;

pub use compose::ComposePushConstants;
pub use fill::{FillColor, FillPushConstants};

use crate::device::Device;
use crate::swapchain::OUTPUT_FORMAT;
use crate::{GranizoError, Result};
use utils::log;

use std::ffi::CStr;
use std::sync::Arc;

/// Where each push constant lives. These have to agree with the
/// layouts declared in the shaders.
pub const PUSH_SIZE_OFFSET: u32 = 0;
pub const PUSH_RECT_OFFSET: u32 = 8;
pub const PUSH_COLOR_OFFSET: u32 = 32;

/// Every draw is one quad
pub const VERTS_PER_RECT: u32 = 4;

const ENTRYPOINT: &[u8] = b"main\0";

/// Get the bytes to push for `val`
///
/// Push constant structs are plain sequences of 32 bit values, which is
/// exactly what bincode writes for them.
pub(crate) fn push_bytes<T: Serialize>(val: &T) -> Result<Vec<u8>> {
    bincode::serialize(val).map_err(|e| {
        log::error!("Could not serialize push constants: {:?}", e);
        GranizoError::INVALID
    })
}

/// Compile one GLSL stage to SPIR-V
fn compile_glsl(src: &str, kind: shaderc::ShaderKind, name: &str) -> Result<Vec<u32>> {
    let mut compiler = shaderc::Compiler::new().ok_or_else(|| {
        log::error!("Failed to initialize shader compiler.");
        GranizoError::SHADER_COMPILE_FAILED
    })?;
    let mut opts = shaderc::CompileOptions::new().ok_or_else(|| {
        log::error!("Failed to initialize shader compiler options.");
        GranizoError::SHADER_COMPILE_FAILED
    })?;
    opts.set_target_env(
        shaderc::TargetEnv::Vulkan,
        shaderc::EnvVersion::Vulkan1_2 as u32,
    );

    let bin = compiler
        .compile_into_spirv(src, kind, name, "main", Some(&opts))
        .map_err(|e| {
            log::error!("Failed to compile {} into SPIR-V: {}", name, e);
            GranizoError::SHADER_COMPILE_FAILED
        })?;

    Ok(bin.as_binary().to_vec())
}

/// A shader module that is destroyed once the pipeline is built
struct ShaderModule<'a> {
    sm_dev: &'a Device,
    sm_module: vk::ShaderModule,
}

impl<'a> ShaderModule<'a> {
    fn new(dev: &'a Device, src: &str, kind: shaderc::ShaderKind, name: &str) -> Result<Self> {
        let code = compile_glsl(src, kind, name)?;
        let info = vk::ShaderModuleCreateInfo::builder().code(&code);

        let module = unsafe {
            dev.dev.create_shader_module(&info, None).or_else(|e| {
                log::error!("Failed to create shader module: {:?}", e);
                Err(GranizoError::SHADER_COMPILE_FAILED)
            })?
        };

        Ok(Self {
            sm_dev: dev,
            sm_module: module,
        })
    }
}

impl<'a> Drop for ShaderModule<'a> {
    fn drop(&mut self) {
        unsafe { self.sm_dev.dev.destroy_shader_module(self.sm_module, None) };
    }
}

/// The GLSL making up one pipeline
pub(crate) struct ShaderSource {
    pub vert: &'static str,
    pub vert_name: &'static str,
    pub frag: &'static str,
    pub frag_name: &'static str,
}

/// A pipeline and its layout
pub struct Pipeline {
    p_dev: Arc<Device>,
    pub(crate) p_layout: vk::PipelineLayout,
    pub(crate) p_pipeline: vk::Pipeline,
}

impl Pipeline {
    /// Create a pipeline layout and a graphics pipeline using it
    ///
    /// The layout is created first and kept in the returned struct, so
    /// if pipeline creation fails Drop still cleans the layout up.
    pub(crate) fn new(
        dev: Arc<Device>,
        set_layouts: &[vk::DescriptorSetLayout],
        push_ranges: &[vk::PushConstantRange],
        shaders: &ShaderSource,
        extent: vk::Extent2D,
    ) -> Result<Self> {
        let layout_info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(set_layouts)
            .push_constant_ranges(push_ranges);
        let layout = unsafe {
            dev.dev
                .create_pipeline_layout(&layout_info, None)
                .or_else(|e| {
                    log::error!("Failed to create pipeline layout: {:?}", e);
                    Err(GranizoError::COULD_NOT_CREATE_PIPELINE)
                })?
        };

        let mut ret = Self {
            p_dev: dev,
            p_layout: layout,
            p_pipeline: vk::Pipeline::null(),
        };
        ret.p_pipeline = ret.create_pipeline(shaders, extent)?;

        Ok(ret)
    }

    /// Configure and create a graphics pipeline
    ///
    /// This roughly follows the "fixed function" part of the vulkan
    /// tutorial, minus everything we don't use: there is no vertex
    /// input, depth, or render pass.
    fn create_pipeline(&self, shaders: &ShaderSource, extent: vk::Extent2D) -> Result<vk::Pipeline> {
        let dev = &*self.p_dev;
        let vert = ShaderModule::new(
            dev,
            shaders.vert,
            shaderc::ShaderKind::Vertex,
            shaders.vert_name,
        )?;
        let frag = ShaderModule::new(
            dev,
            shaders.frag,
            shaderc::ShaderKind::Fragment,
            shaders.frag_name,
        )?;

        let entrypoint = unsafe { CStr::from_bytes_with_nul_unchecked(ENTRYPOINT) };
        let stages = [
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(vert.sm_module)
                .name(entrypoint)
                .build(),
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(frag.sm_module)
                .name(entrypoint)
                .build(),
        ];

        // corners come from gl_VertexIndex
        let vertex_info = vk::PipelineVertexInputStateCreateInfo::builder();

        let assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(vk::PrimitiveTopology::TRIANGLE_STRIP);

        // The viewport always covers the whole output. Draws are limited
        // with the scissor, which is dynamic.
        let viewport = [vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 0.0,
        }];
        let scissor = [vk::Rect2D::default()];
        let viewport_info = vk::PipelineViewportStateCreateInfo::builder()
            .viewports(&viewport)
            .scissors(&scissor);

        let raster_info = vk::PipelineRasterizationStateCreateInfo::builder()
            .polygon_mode(vk::PolygonMode::FILL)
            .cull_mode(vk::CullModeFlags::NONE)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .line_width(1.0);

        let multisample_info = vk::PipelineMultisampleStateCreateInfo::builder()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        // premultiplied over, for both color and alpha
        let blend_attachment_states = [vk::PipelineColorBlendAttachmentState {
            blend_enable: vk::TRUE,
            src_color_blend_factor: vk::BlendFactor::ONE,
            dst_color_blend_factor: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
            color_blend_op: vk::BlendOp::ADD,
            src_alpha_blend_factor: vk::BlendFactor::ONE,
            dst_alpha_blend_factor: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
            alpha_blend_op: vk::BlendOp::ADD,
            color_write_mask: vk::ColorComponentFlags::R
                | vk::ColorComponentFlags::G
                | vk::ColorComponentFlags::B
                | vk::ColorComponentFlags::A,
        }];
        let blend_info = vk::PipelineColorBlendStateCreateInfo::builder()
            .logic_op(vk::LogicOp::CLEAR)
            .attachments(&blend_attachment_states);

        let dynamic_states = [vk::DynamicState::SCISSOR];
        let dynamic_info =
            vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

        let formats = [OUTPUT_FORMAT];
        let mut rendering_info =
            vk::PipelineRenderingCreateInfo::builder().color_attachment_formats(&formats);

        let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&stages)
            .vertex_input_state(&vertex_info)
            .input_assembly_state(&assembly)
            .viewport_state(&viewport_info)
            .rasterization_state(&raster_info)
            .multisample_state(&multisample_info)
            .color_blend_state(&blend_info)
            .dynamic_state(&dynamic_info)
            .layout(self.p_layout)
            .push_next(&mut rendering_info)
            .build();

        let pipelines = unsafe {
            dev.dev
                .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
                .or_else(|(_, e)| {
                    log::error!("Failed to create graphics pipelines: {:?}", e);
                    Err(GranizoError::COULD_NOT_CREATE_PIPELINE)
                })?
        };

        pipelines
            .get(0)
            .copied()
            .ok_or(GranizoError::COULD_NOT_CREATE_PIPELINE)
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        unsafe {
            if self.p_pipeline != vk::Pipeline::null() {
                self.p_dev.dev.destroy_pipeline(self.p_pipeline, None);
            }
            if self.p_layout != vk::PipelineLayout::null() {
                self.p_dev.dev.destroy_pipeline_layout(self.p_layout, None);
            }
        }
    }
}

/// Both of our pipelines
///
/// The viewport is baked into the pipelines, so this has to be rebuilt
/// whenever the swapchain size changes.
pub struct PipelineSet {
    pub(crate) ps_compose: Pipeline,
    pub(crate) ps_fill: Pipeline,
    /// The size the pipelines were built for
    pub(crate) ps_extent: vk::Extent2D,
}

impl PipelineSet {
    pub fn new(
        dev: Arc<Device>,
        set_layout: vk::DescriptorSetLayout,
        extent: vk::Extent2D,
    ) -> Result<Self> {
        let compose = compose::create(dev.clone(), set_layout, extent)?;
        let fill = fill::create(dev, extent)?;

        log::debug!(
            "Created pipelines for a {}x{} output",
            extent.width,
            extent.height
        );

        Ok(Self {
            ps_compose: compose,
            ps_fill: fill,
            ps_extent: extent,
        })
    }
}
