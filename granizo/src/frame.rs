// Frame recording
//
// A frame is prepare, any number of compose and fill calls, then
// present. Everything is recorded into the device's one command buffer
// and submitted at present, so there is only ever one frame in flight.
//
// Austin Shafer - 2024
use ash::vk;

use crate::device::Device;
use crate::image::{readback_rect, BoundImage};
use crate::pipelines::{
    self, ComposePushConstants, FillColor, FillPushConstants, Pipeline, PipelineSet,
    PUSH_COLOR_OFFSET, PUSH_RECT_OFFSET, PUSH_SIZE_OFFSET, VERTS_PER_RECT,
};
use crate::swapchain::Swapchain;
use crate::{Color, GranizoError, Rect, Region, Result};
use utils::log;

/// Something that draws a region one rectangle at a time
///
/// `record_region` drives this, which keeps the draw planning separate
/// from the Vulkan commands it turns into.
pub(crate) trait RectRecorder {
    /// Start drawing, limited to `area`, which is never empty
    fn begin_rects(&mut self, area: &vk::Rect2D) -> Result<()>;
    /// Draw one rectangle, given as its corners
    fn draw_rect(&mut self, rect: [i32; 4]) -> Result<()>;
    fn end_rects(&mut self) -> Result<()>;
}

/// Draw every rectangle in `region`
///
/// The drawing area is the region's extents clipped to `output`.
/// Returns the number of draws, which is exactly the number of
/// rectangles. A region with nothing on the output records nothing at
/// all.
pub(crate) fn record_region<R: RectRecorder>(
    rec: &mut R,
    region: &Region,
    output: vk::Extent2D,
) -> Result<usize> {
    let area = match paint_area(region, output) {
        Some(a) => a,
        None => return Ok(0),
    };

    rec.begin_rects(&area)?;
    let mut draws = 0;
    for r in region.rects().iter() {
        rec.draw_rect(r.corners())?;
        draws += 1;
    }
    rec.end_rects()?;

    Ok(draws)
}

/// Clip `rect` to the output
///
/// Render areas and scissors may not go outside the attachment or have
/// negative offsets. None if nothing of `rect` is on the output.
pub(crate) fn clip_to_output(rect: &Rect<i32>, extent: vk::Extent2D) -> Option<vk::Rect2D> {
    let end = rect.end();
    let x1 = rect.r_pos.0.max(0).min(extent.width as i32);
    let y1 = rect.r_pos.1.max(0).min(extent.height as i32);
    let x2 = end.0.max(x1).min(extent.width as i32);
    let y2 = end.1.max(y1).min(extent.height as i32);

    if x2 == x1 || y2 == y1 {
        return None;
    }

    Some(vk::Rect2D {
        offset: vk::Offset2D { x: x1, y: y1 },
        extent: vk::Extent2D {
            width: (x2 - x1) as u32,
            height: (y2 - y1) as u32,
        },
    })
}

/// The part of the output `region` touches
pub(crate) fn paint_area(region: &Region, output: vk::Extent2D) -> Option<vk::Rect2D> {
    region
        .extents()
        .and_then(|extents| clip_to_output(&extents, output))
}

/// Records quads with one of our pipelines into the current swapchain
/// image
struct QuadRecorder<'a> {
    qr_dev: &'a Device,
    qr_view: vk::ImageView,
    qr_pipe: &'a Pipeline,
    /// The bound image for compose, None for fill
    qr_set: Option<vk::DescriptorSet>,
    /// Pushed once after binding: (stages, offset, bytes)
    qr_consts: Vec<(vk::ShaderStageFlags, u32, Vec<u8>)>,
}

impl<'a> RectRecorder for QuadRecorder<'a> {
    fn begin_rects(&mut self, area: &vk::Rect2D) -> Result<()> {
        let dev = self.qr_dev;
        let render_area = *area;

        // Compositing accumulates, so never clear
        let attachments = [vk::RenderingAttachmentInfo::builder()
            .image_view(self.qr_view)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::LOAD)
            .store_op(vk::AttachmentStoreOp::STORE)
            .build()];
        let rendering_info = vk::RenderingInfo::builder()
            .render_area(render_area)
            .layer_count(1)
            .color_attachments(&attachments);

        unsafe {
            dev.dev.cmd_begin_rendering(dev.d_cbuf, &rendering_info);
            dev.dev.cmd_bind_pipeline(
                dev.d_cbuf,
                vk::PipelineBindPoint::GRAPHICS,
                self.qr_pipe.p_pipeline,
            );
            dev.dev.cmd_set_scissor(dev.d_cbuf, 0, &[render_area]);

            if let Some(set) = self.qr_set {
                dev.dev.cmd_bind_descriptor_sets(
                    dev.d_cbuf,
                    vk::PipelineBindPoint::GRAPHICS,
                    self.qr_pipe.p_layout,
                    0, // first set
                    &[set],
                    &[], // dynamic offsets
                );
            }

            for (stages, offset, bytes) in self.qr_consts.iter() {
                dev.dev.cmd_push_constants(
                    dev.d_cbuf,
                    self.qr_pipe.p_layout,
                    *stages,
                    *offset,
                    bytes.as_slice(),
                );
            }
        }

        Ok(())
    }

    fn draw_rect(&mut self, rect: [i32; 4]) -> Result<()> {
        let dev = self.qr_dev;
        let bytes = pipelines::push_bytes(&rect)?;

        unsafe {
            dev.dev.cmd_push_constants(
                dev.d_cbuf,
                self.qr_pipe.p_layout,
                vk::ShaderStageFlags::VERTEX,
                PUSH_RECT_OFFSET,
                bytes.as_slice(),
            );
            dev.dev.cmd_draw(dev.d_cbuf, VERTS_PER_RECT, 1, 0, 0);
        }

        Ok(())
    }

    fn end_rects(&mut self) -> Result<()> {
        unsafe { self.qr_dev.dev.cmd_end_rendering(self.qr_dev.d_cbuf) };
        Ok(())
    }
}

/// One frame's worth of access to the renderer
///
/// This is assembled by the backend for each call, the actual frame
/// state lives in the swapchain (current image, layouts, ages) and the
/// device (command buffer, fences).
pub(crate) struct Frame<'a> {
    pub f_dev: &'a Device,
    pub f_swapchain: &'a mut Swapchain,
    pub f_pipes: &'a PipelineSet,
}

impl<'a> Frame<'a> {
    fn output_size(&self) -> [u32; 2] {
        let extent = self.f_swapchain.sc_extent;
        [extent.width, extent.height]
    }

    /// Start recording into the current swapchain image
    ///
    /// Waits for the previous frame's submission, then moves the image
    /// into COLOR_ATTACHMENT_OPTIMAL from whatever layout it was left in.
    pub fn prepare(&mut self) -> Result<()> {
        let dev = self.f_dev;
        // an empty swapchain fails here, before the fence is touched
        let image = self.f_swapchain.current_image()?;
        let layout = self.f_swapchain.current_layout()?;
        let current = self.f_swapchain.sc_current as usize;

        dev.wait_for_submit()?;

        if let Err(e) = dev.cbuf_begin_recording(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT) {
            dev.resignal_submit_fence();
            return Err(e);
        }

        dev.cmd_image_barrier(
            image,
            layout,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            (
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::AccessFlags::empty(),
            ),
            (
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            ),
        );
        self.f_swapchain
            .sc_layouts
            .begin_frame(current, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
    }

    /// Draw `image` at `offset` over each rectangle in `paint`
    ///
    /// Returns the number of draws recorded.
    pub fn compose(
        &mut self,
        image: &BoundImage,
        offset: (i32, i32),
        paint: &Region,
    ) -> Result<usize> {
        let output = self.f_swapchain.sc_extent;
        let area = match paint_area(paint, output) {
            Some(a) => a,
            None => return Ok(0),
        };
        let visible = Rect::new(
            area.offset.x,
            area.offset.y,
            area.extent.width as i32,
            area.extent.height as i32,
        );

        // MIT-SHM images need the paint area refreshed from the server
        // before they are sampled
        if let Some(area) = readback_rect(&visible, offset, image.size()) {
            image.record_shm_upload(&area)?;
        }

        let set = image.descriptor_set().ok_or(GranizoError::INVALID_IMAGE)?;
        let push = ComposePushConstants {
            size: self.output_size(),
            rect: [0; 4],
            image_offset: [offset.0, offset.1],
        };

        let mut rec = QuadRecorder {
            qr_dev: self.f_dev,
            qr_view: self.f_swapchain.current_view()?,
            qr_pipe: &self.f_pipes.ps_compose,
            qr_set: Some(set),
            qr_consts: vec![(
                vk::ShaderStageFlags::VERTEX,
                PUSH_SIZE_OFFSET,
                pipelines::push_bytes(&push)?,
            )],
        };

        record_region(&mut rec, paint, output)
    }

    /// Paint `color` over each rectangle in `region`
    pub fn fill(&mut self, color: Color, region: &Region) -> Result<usize> {
        let push = FillPushConstants {
            size: self.output_size(),
            rect: [0; 4],
        };
        let color = FillColor::from(color);

        let mut rec = QuadRecorder {
            qr_dev: self.f_dev,
            qr_view: self.f_swapchain.current_view()?,
            qr_pipe: &self.f_pipes.ps_fill,
            qr_set: None,
            qr_consts: vec![
                (
                    vk::ShaderStageFlags::VERTEX,
                    PUSH_SIZE_OFFSET,
                    pipelines::push_bytes(&push)?,
                ),
                (
                    vk::ShaderStageFlags::FRAGMENT,
                    PUSH_COLOR_OFFSET,
                    pipelines::push_bytes(&color)?,
                ),
            ],
        };

        record_region(&mut rec, region, self.f_swapchain.sc_extent)
    }

    /// Submit the frame's command buffer
    ///
    /// Waits on the acquire semaphore before writing color, and
    /// signals it again for the present to wait on.
    fn submit(&self) -> Result<()> {
        let dev = self.f_dev;
        let cbufs = [dev.d_cbuf];
        let semas = [dev.d_sema];
        let stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&semas)
            .wait_dst_stage_mask(&stages)
            .command_buffers(&cbufs)
            .signal_semaphores(&semas)
            .build();

        unsafe {
            dev.dev
                .queue_submit(dev.d_queue, &[submit_info], dev.d_submit_fence)
                .or_else(|e| {
                    log::error!("Failed to queue submit: {:?}", e);
                    Err(GranizoError::PRESENT_FAILED)
                })
        }
    }

    /// Finish the frame, present it, and acquire the next image
    ///
    /// If submission fails the current image is kept for the next
    /// frame, in the layout it had before this one. Any failure drops
    /// this frame but leaves us ready for the next `prepare`.
    pub fn present(&mut self) -> Result<()> {
        let dev = self.f_dev;
        let current = self.f_swapchain.sc_current as usize;

        dev.cmd_image_barrier(
            self.f_swapchain.current_image()?,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
            (
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            ),
            (
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                vk::AccessFlags::empty(),
            ),
        );
        self.f_swapchain
            .sc_layouts
            .set(current, vk::ImageLayout::PRESENT_SRC_KHR)?;

        let res = match dev.cbuf_end_recording().and_then(|_| self.submit()) {
            Err(e) => {
                // the submit fence was reset in prepare and nothing
                // will signal it now
                dev.resignal_submit_fence();
                self.f_swapchain.sc_layouts.rollback();
                Err(e)
            }
            Ok(()) => {
                self.f_swapchain.sc_layouts.commit();
                self.f_swapchain.sc_acquire.consumed();
                let presented = self.f_swapchain.present();
                if presented.is_ok() {
                    let current = self.f_swapchain.sc_current as usize;
                    self.f_swapchain.sc_ages.presented(current);
                }
                let acquired = self.f_swapchain.acquire_next();
                presented.and(acquired)
            }
        };

        res.map_err(|e| {
            log::error!("Dropped frame: {}", e);
            match e {
                GranizoError::OUT_OF_DATE => GranizoError::OUT_OF_DATE,
                _ => GranizoError::FRAME_DROPPED,
            }
        })
    }
}
