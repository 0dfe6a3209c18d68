// SPDX-License-Identifier: CEPL-1.0
//! Records one frame by walking the [`FramePlan`].

use ash::vk;
use strata_math::ShadowPassConstant;
use strata_render::plan::{Attachment, BindPoints, ImageTransition, LoadOp, PassKind, PassRecord};
use strata_render::{Access, FrameParams, FramePlan, RenderSize};
use tracing::trace_span;

use crate::descriptors::DescriptorSetManager;
use crate::pipelines::PipelineSet;
use crate::resources::FrameResources;
use crate::sync::{access_info, insert_global_barrier, insert_image_barriers, subresource_range, ImageBarrier};

/// External UI drawn on top of the final image.
pub trait UiLayer {
    /// Called inside the UI pass with the swapchain image bound as the only
    /// color attachment; its previous contents are loaded.
    fn record(&mut self, device: &ash::Device, cmd: vk::CommandBuffer, extent: vk::Extent2D);
}

/// Draws nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoUi;

impl UiLayer for NoUi {
    fn record(&mut self, _device: &ash::Device, _cmd: vk::CommandBuffer, _extent: vk::Extent2D) {}
}

/// The acquired swapchain image this frame renders into.
#[derive(Clone, Copy, Debug)]
pub struct SwapchainTarget {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub index: u32,
}

pub fn image_barrier(transition: &ImageTransition, image: vk::Image, queue_family: u32) -> ImageBarrier {
    ImageBarrier {
        prev_access: transition.prev_access,
        next_access: transition.next_access,
        prev_layout: transition.prev_layout,
        next_layout: transition.next_layout,
        discard_contents: transition.discard_contents,
        src_queue_family: queue_family,
        dst_queue_family: queue_family,
        image,
        range: subresource_range(transition.range),
    }
}

fn load_op(load: LoadOp) -> (vk::AttachmentLoadOp, vk::ClearValue) {
    match load {
        LoadOp::Load => (vk::AttachmentLoadOp::LOAD, vk::ClearValue::default()),
        LoadOp::DontCare => (vk::AttachmentLoadOp::DONT_CARE, vk::ClearValue::default()),
        LoadOp::ClearDepth(depth) => (
            vk::AttachmentLoadOp::CLEAR,
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue { depth, stencil: 0 },
            },
        ),
    }
}

fn to_extent(size: RenderSize) -> vk::Extent2D {
    vk::Extent2D {
        width: size.width,
        height: size.height,
    }
}

/// Everything a frame records against. Borrowed for one frame.
pub struct FrameRenderer<'a> {
    pub device: &'a ash::Device,
    pub pipelines: &'a PipelineSet,
    pub table: &'a DescriptorSetManager,
    pub resources: &'a FrameResources,
    pub queue_family: u32,
}

impl FrameRenderer<'_> {
    /// Records the full pass sequence into `cmd`, which must be recording.
    /// The swapchain image ends in the present layout.
    pub unsafe fn render(
        &self,
        cmd: vk::CommandBuffer,
        swapchain: &SwapchainTarget,
        extent: vk::Extent2D,
        ui: &mut dyn UiLayer,
    ) {
        let plan = FramePlan::build(&FrameParams {
            extent: RenderSize {
                width: extent.width,
                height: extent.height,
            },
            instance_count: self.resources.instance_count(),
            swapchain_index: swapchain.index,
        });

        for pass in plan.passes() {
            let _zone = trace_span!("pass", name = pass.name).entered();
            self.record_pass(cmd, pass, swapchain, ui);
        }
    }

    unsafe fn record_pass(
        &self,
        cmd: vk::CommandBuffer,
        pass: &PassRecord,
        swapchain: &SwapchainTarget,
        ui: &mut dyn UiLayer,
    ) {
        let device = self.device;

        if let Some(global) = pass.global_barrier {
            insert_global_barrier(device, cmd, global.prev_access, global.next_access);
        }
        if !pass.image_barriers.is_empty() {
            let barriers: Vec<_> = pass
                .image_barriers
                .iter()
                .map(|t| image_barrier(t, self.resources.image(t.image, swapchain), self.queue_family))
                .collect();
            insert_image_barriers(device, cmd, &barriers);
        }

        match &pass.kind {
            PassKind::Transition => {}

            PassKind::FillBuffers(fills) => {
                for fill in fills {
                    device.cmd_fill_buffer(
                        cmd,
                        self.resources.buffer(fill.buffer),
                        fill.offset,
                        fill.size,
                        fill.value,
                    );
                }
            }

            PassKind::BindResourceTable {
                bind_points,
                swapchain_index,
            } => {
                let layout = self.pipelines.layout();
                if bind_points.contains(BindPoints::COMPUTE) {
                    let sets = [
                        self.table.master(),
                        self.table.swapchain_set(*swapchain_index as usize),
                    ];
                    device.cmd_bind_descriptor_sets(cmd, vk::PipelineBindPoint::COMPUTE, layout, 0, &sets, &[]);
                }
                if bind_points.contains(BindPoints::GRAPHICS) {
                    let sets = [self.table.master()];
                    device.cmd_bind_descriptor_sets(cmd, vk::PipelineBindPoint::GRAPHICS, layout, 0, &sets, &[]);
                }
            }

            PassKind::Dispatch { pipeline, grid } => {
                device.cmd_bind_pipeline(
                    cmd,
                    vk::PipelineBindPoint::COMPUTE,
                    self.pipelines.compute(*pipeline),
                );
                device.cmd_dispatch(cmd, grid[0], grid[1], grid[2]);
            }

            PassKind::Raster {
                extent,
                color,
                depth,
                cascade,
                draws,
            } => {
                let extent = to_extent(*extent);
                let color = color.map(|a| self.attachment(&a, Access::ColorAttachmentWrite, swapchain));
                let depth = depth.map(|a| self.attachment(&a, Access::DepthStencilAttachmentWrite, swapchain));
                self.begin_rendering(cmd, extent, color.as_ref(), depth.as_ref());

                if let Some(cascade_index) = cascade {
                    let constant = ShadowPassConstant {
                        cascade_index: *cascade_index,
                    };
                    device.cmd_push_constants(
                        cmd,
                        self.pipelines.layout(),
                        vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::COMPUTE,
                        0,
                        bytemuck::bytes_of(&constant),
                    );
                }

                let draw_calls = self.resources.draw_calls.buffer;
                let counts = self.resources.misc_storage.buffer;
                for draw in draws {
                    device.cmd_bind_pipeline(
                        cmd,
                        vk::PipelineBindPoint::GRAPHICS,
                        self.pipelines.graphics(draw.pipeline),
                    );
                    device.cmd_draw_indirect_count(
                        cmd,
                        draw_calls,
                        draw.draw_offset,
                        counts,
                        draw.count_offset,
                        draw.max_draw_count,
                        draw.stride,
                    );
                }
                device.cmd_end_rendering(cmd);
            }

            PassKind::UiComposite { extent, target } => {
                let extent = to_extent(*extent);
                let color = self.attachment(target, Access::ColorAttachmentWrite, swapchain);
                self.begin_rendering(cmd, extent, Some(&color), None);
                ui.record(device, cmd, extent);
                device.cmd_end_rendering(cmd);
            }
        }
    }

    fn attachment(
        &self,
        attachment: &Attachment,
        access: Access,
        swapchain: &SwapchainTarget,
    ) -> vk::RenderingAttachmentInfo<'static> {
        let (load_op, clear_value) = load_op(attachment.load);
        vk::RenderingAttachmentInfo::default()
            .image_view(self.resources.attachment_view(attachment.view, swapchain))
            .image_layout(access_info(access).layout)
            .load_op(load_op)
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(clear_value)
    }

    unsafe fn begin_rendering(
        &self,
        cmd: vk::CommandBuffer,
        extent: vk::Extent2D,
        color: Option<&vk::RenderingAttachmentInfo<'_>>,
        depth: Option<&vk::RenderingAttachmentInfo<'_>>,
    ) {
        let render_area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };
        let colors: Vec<_> = color.into_iter().copied().collect();
        let mut info = vk::RenderingInfo::default()
            .render_area(render_area)
            .layer_count(1)
            .color_attachments(&colors);
        if let Some(depth) = depth {
            info = info.depth_attachment(depth);
        }
        self.device.cmd_begin_rendering(cmd, &info);

        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        self.device.cmd_set_viewport(cmd, 0, std::slice::from_ref(&viewport));
        self.device.cmd_set_scissor(cmd, 0, std::slice::from_ref(&render_area));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;
    use std::collections::HashMap;
    use strata_render::plan::FrameImage;

    fn plan() -> FramePlan {
        FramePlan::build(&FrameParams {
            extent: RenderSize {
                width: 1280,
                height: 720,
            },
            instance_count: 64,
            swapchain_index: 0,
        })
    }

    fn handle(image: FrameImage) -> vk::Image {
        vk::Image::from_raw(image as u64 + 1)
    }

    #[test]
    fn layouts_chain_across_the_frame() {
        let mut current: HashMap<FrameImage, vk::ImageLayout> = HashMap::new();
        for transition in plan().passes().iter().flat_map(|p| &p.image_barriers) {
            let barrier = image_barrier(transition, handle(transition.image), 0).to_vk();
            if !transition.discard_contents {
                assert_eq!(
                    Some(&barrier.old_layout),
                    current.get(&transition.image),
                    "{:?}",
                    transition.image
                );
            }
            current.insert(transition.image, barrier.new_layout);
        }
        assert_eq!(current[&FrameImage::Swapchain], vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(current[&FrameImage::SceneFramebuffer], vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(current[&FrameImage::ShadowArray], vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    }

    #[test]
    fn swapchain_is_storage_then_attachment_then_present() {
        let plan = plan();
        let swapchain: Vec<_> = plan
            .passes()
            .iter()
            .flat_map(|p| &p.image_barriers)
            .filter(|t| t.image == FrameImage::Swapchain)
            .map(|t| image_barrier(t, handle(t.image), 0).to_vk())
            .map(|b| (b.old_layout, b.new_layout))
            .collect();
        assert_eq!(
            swapchain,
            [
                (vk::ImageLayout::UNDEFINED, vk::ImageLayout::GENERAL),
                (vk::ImageLayout::GENERAL, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL),
                (vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL, vk::ImageLayout::PRESENT_SRC_KHR),
            ]
        );
    }

    #[test]
    fn swapchain_barriers_chain_with_the_submit_semaphores() {
        use crate::sync::{ACQUIRE_WAIT_STAGE, RENDER_FINISHED_STAGE};

        let plan = plan();
        let swapchain: Vec<_> = plan
            .passes()
            .iter()
            .flat_map(|p| &p.image_barriers)
            .filter(|t| t.image == FrameImage::Swapchain)
            .map(|t| image_barrier(t, handle(t.image), 0).to_vk())
            .collect();

        let first = swapchain.first().unwrap();
        assert_eq!(first.old_layout, vk::ImageLayout::UNDEFINED);
        assert!(first.src_stage_mask.intersects(ACQUIRE_WAIT_STAGE));

        let last = swapchain.last().unwrap();
        assert_eq!(last.new_layout, vk::ImageLayout::PRESENT_SRC_KHR);
        assert!(last.src_stage_mask.intersects(RENDER_FINISHED_STAGE));
    }

    #[test]
    fn raster_attachments_match_their_transitions() {
        // Attachments are bound in the layout their last barrier left them in.
        let plan = plan();
        let acquire = plan.pass("acquire").unwrap();
        let layout_of = |image| {
            let t = acquire.image_barriers.iter().find(|t| t.image == image).unwrap();
            image_barrier(t, handle(image), 0).new_layout()
        };
        assert_eq!(
            layout_of(FrameImage::VisBuffer),
            access_info(Access::ColorAttachmentWrite).layout
        );
        assert_eq!(
            layout_of(FrameImage::DepthBuffer),
            access_info(Access::DepthStencilAttachmentWrite).layout
        );
        assert_eq!(
            layout_of(FrameImage::ShadowArray),
            access_info(Access::DepthStencilAttachmentWrite).layout
        );
    }

    #[test]
    fn shadow_barrier_covers_every_cascade() {
        let plan = plan();
        let barrier = &plan.pass("render geometry").unwrap().image_barriers[0];
        let vk_barrier = image_barrier(barrier, handle(barrier.image), 0).to_vk();
        assert_eq!(vk_barrier.subresource_range.layer_count, 4);
        assert_eq!(vk_barrier.subresource_range.aspect_mask, vk::ImageAspectFlags::DEPTH);
    }

    #[test]
    fn depth_clears_use_the_requested_value() {
        let (op, value) = load_op(LoadOp::ClearDepth(0.0));
        assert_eq!(op, vk::AttachmentLoadOp::CLEAR);
        assert_eq!(unsafe { value.depth_stencil.depth }, 0.0);

        let (op, value) = load_op(LoadOp::ClearDepth(1.0));
        assert_eq!(op, vk::AttachmentLoadOp::CLEAR);
        assert_eq!(unsafe { value.depth_stencil.depth }, 1.0);

        assert_eq!(load_op(LoadOp::Load).0, vk::AttachmentLoadOp::LOAD);
        assert_eq!(load_op(LoadOp::DontCare).0, vk::AttachmentLoadOp::DONT_CARE);
    }
}
