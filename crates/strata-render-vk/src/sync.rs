// SPDX-License-Identifier: CEPL-1.0
//! Access-state barriers.
//!
//! Callers describe a resource going from one [`Access`] to another; the
//! stage masks, access masks and layouts come out of [`access_info`], a pure
//! table. Image barriers that share the same transition are recorded
//! together in a single `vkCmdPipelineBarrier2`.

use ash::vk;
use strata_render::{Access, ImageAspect, ImageLayout, SubresourceRange};
use tracing::trace;

/// What an [`Access`] means to the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AccessInfo {
    pub stages: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
    /// Layout an image must be in for this access. `UNDEFINED` for accesses
    /// that never touch images.
    pub layout: vk::ImageLayout,
}

/// Stage the swapchain acquire semaphore is waited at. First-use barriers
/// start from this stage so the layout transition is ordered after the wait.
pub const ACQUIRE_WAIT_STAGE: vk::PipelineStageFlags2 = vk::PipelineStageFlags2::ALL_COMMANDS;

/// Stage the render-finished semaphore is signalled at; present waits on it.
pub const RENDER_FINISHED_STAGE: vk::PipelineStageFlags2 = vk::PipelineStageFlags2::ALL_COMMANDS;

const fn info(
    stages: vk::PipelineStageFlags2,
    access: vk::AccessFlags2,
    layout: vk::ImageLayout,
) -> AccessInfo {
    AccessInfo {
        stages,
        access,
        layout,
    }
}

pub fn access_info(access: Access) -> AccessInfo {
    use vk::AccessFlags2 as A;
    use vk::ImageLayout as L;
    use vk::PipelineStageFlags2 as S;

    match access {
        Access::None => info(ACQUIRE_WAIT_STAGE, A::NONE, L::UNDEFINED),

        Access::IndirectBuffer => info(S::DRAW_INDIRECT, A::INDIRECT_COMMAND_READ, L::UNDEFINED),
        Access::IndexBuffer => info(S::INDEX_INPUT, A::INDEX_READ, L::UNDEFINED),
        Access::VertexBuffer => info(
            S::VERTEX_ATTRIBUTE_INPUT,
            A::VERTEX_ATTRIBUTE_READ,
            L::UNDEFINED,
        ),

        Access::VertexShaderReadUniformBuffer => info(S::VERTEX_SHADER, A::UNIFORM_READ, L::UNDEFINED),
        Access::VertexShaderReadSampledImage => info(
            S::VERTEX_SHADER,
            A::SHADER_SAMPLED_READ,
            L::SHADER_READ_ONLY_OPTIMAL,
        ),
        Access::VertexShaderReadOther => info(S::VERTEX_SHADER, A::SHADER_STORAGE_READ, L::GENERAL),

        Access::FragmentShaderReadUniformBuffer => {
            info(S::FRAGMENT_SHADER, A::UNIFORM_READ, L::UNDEFINED)
        }
        Access::FragmentShaderReadSampledImage => info(
            S::FRAGMENT_SHADER,
            A::SHADER_SAMPLED_READ,
            L::SHADER_READ_ONLY_OPTIMAL,
        ),
        Access::FragmentShaderReadOther => {
            info(S::FRAGMENT_SHADER, A::SHADER_STORAGE_READ, L::GENERAL)
        }

        Access::ColorAttachmentRead => info(
            S::COLOR_ATTACHMENT_OUTPUT,
            A::COLOR_ATTACHMENT_READ,
            L::COLOR_ATTACHMENT_OPTIMAL,
        ),
        Access::DepthStencilAttachmentRead => info(
            S::EARLY_FRAGMENT_TESTS | S::LATE_FRAGMENT_TESTS,
            A::DEPTH_STENCIL_ATTACHMENT_READ,
            L::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
        ),

        Access::ComputeShaderReadUniformBuffer => {
            info(S::COMPUTE_SHADER, A::UNIFORM_READ, L::UNDEFINED)
        }
        Access::ComputeShaderReadSampledImage => info(
            S::COMPUTE_SHADER,
            A::SHADER_SAMPLED_READ,
            L::SHADER_READ_ONLY_OPTIMAL,
        ),
        Access::ComputeShaderReadOther => {
            info(S::COMPUTE_SHADER, A::SHADER_STORAGE_READ, L::GENERAL)
        }

        Access::AnyShaderReadUniformBuffer => info(S::ALL_COMMANDS, A::UNIFORM_READ, L::UNDEFINED),
        Access::AnyShaderReadSampledImage => info(
            S::ALL_COMMANDS,
            A::SHADER_SAMPLED_READ,
            L::SHADER_READ_ONLY_OPTIMAL,
        ),
        Access::AnyShaderReadOther => info(S::ALL_COMMANDS, A::SHADER_READ, L::GENERAL),

        Access::TransferRead => info(S::ALL_TRANSFER, A::TRANSFER_READ, L::TRANSFER_SRC_OPTIMAL),
        Access::HostRead => info(S::HOST, A::HOST_READ, L::GENERAL),

        Access::Present => info(S::NONE, A::NONE, L::PRESENT_SRC_KHR),

        Access::VertexShaderWrite => info(S::VERTEX_SHADER, A::SHADER_STORAGE_WRITE, L::GENERAL),
        Access::FragmentShaderWrite => {
            info(S::FRAGMENT_SHADER, A::SHADER_STORAGE_WRITE, L::GENERAL)
        }

        Access::ColorAttachmentWrite => info(
            S::COLOR_ATTACHMENT_OUTPUT,
            A::COLOR_ATTACHMENT_WRITE,
            L::COLOR_ATTACHMENT_OPTIMAL,
        ),
        Access::DepthStencilAttachmentWrite => info(
            S::EARLY_FRAGMENT_TESTS | S::LATE_FRAGMENT_TESTS,
            A::DEPTH_STENCIL_ATTACHMENT_WRITE,
            L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        ),

        Access::ComputeShaderWrite => info(S::COMPUTE_SHADER, A::SHADER_STORAGE_WRITE, L::GENERAL),
        Access::AnyShaderWrite => info(S::ALL_COMMANDS, A::SHADER_STORAGE_WRITE, L::GENERAL),

        Access::TransferWrite => info(S::ALL_TRANSFER, A::TRANSFER_WRITE, L::TRANSFER_DST_OPTIMAL),
        Access::HostPreinitialized => info(S::HOST, A::HOST_WRITE, L::PREINITIALIZED),
        Access::HostWrite => info(S::HOST, A::HOST_WRITE, L::GENERAL),

        Access::ColorAttachmentReadWrite => info(
            S::COLOR_ATTACHMENT_OUTPUT,
            A::COLOR_ATTACHMENT_READ | A::COLOR_ATTACHMENT_WRITE,
            L::COLOR_ATTACHMENT_OPTIMAL,
        ),

        Access::General => info(
            S::ALL_COMMANDS,
            A::MEMORY_READ | A::MEMORY_WRITE,
            L::GENERAL,
        ),
    }
}

/// Layout an image is in for `access` under the given layout family.
pub fn image_layout(access: Access, layout: ImageLayout) -> vk::ImageLayout {
    match (access, layout) {
        (_, ImageLayout::Optimal) | (Access::None | Access::Present, ImageLayout::General) => {
            access_info(access).layout
        }
        (_, ImageLayout::General) => vk::ImageLayout::GENERAL,
    }
}

pub fn subresource_range(range: SubresourceRange) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: match range.aspect {
            ImageAspect::Color => vk::ImageAspectFlags::COLOR,
            ImageAspect::Depth => vk::ImageAspectFlags::DEPTH,
        },
        base_mip_level: range.base_mip_level,
        level_count: range.level_count,
        base_array_layer: range.base_array_layer,
        layer_count: range.layer_count,
    }
}

/// One image changing access state. Works for color and depth images alike.
#[derive(Clone, Copy, Debug)]
pub struct ImageBarrier {
    pub prev_access: Access,
    pub next_access: Access,
    pub prev_layout: ImageLayout,
    pub next_layout: ImageLayout,
    /// Lets the driver drop the previous contents. First use only.
    pub discard_contents: bool,
    pub src_queue_family: u32,
    pub dst_queue_family: u32,
    pub image: vk::Image,
    pub range: vk::ImageSubresourceRange,
}

impl ImageBarrier {
    /// Same-queue barrier with optimal layouts on both sides.
    pub fn new(
        image: vk::Image,
        range: vk::ImageSubresourceRange,
        prev_access: Access,
        next_access: Access,
        queue_family: u32,
    ) -> Self {
        Self {
            prev_access,
            next_access,
            prev_layout: ImageLayout::Optimal,
            next_layout: ImageLayout::Optimal,
            discard_contents: false,
            src_queue_family: queue_family,
            dst_queue_family: queue_family,
            image,
            range,
        }
    }

    pub fn discard(mut self) -> Self {
        self.discard_contents = true;
        self
    }

    pub fn old_layout(&self) -> vk::ImageLayout {
        if self.discard_contents {
            vk::ImageLayout::UNDEFINED
        } else {
            image_layout(self.prev_access, self.prev_layout)
        }
    }

    pub fn new_layout(&self) -> vk::ImageLayout {
        image_layout(self.next_access, self.next_layout)
    }

    fn batch_key(&self) -> BatchKey {
        BatchKey {
            prev_access: self.prev_access,
            next_access: self.next_access,
            old_layout: self.old_layout(),
            new_layout: self.new_layout(),
            src_queue_family: self.src_queue_family,
            dst_queue_family: self.dst_queue_family,
        }
    }

    pub fn to_vk(&self) -> vk::ImageMemoryBarrier2<'static> {
        let prev = access_info(self.prev_access);
        let next = access_info(self.next_access);
        let old_layout = self.old_layout();
        let new_layout = self.new_layout();

        // Reads never need to be made available.
        let src_access = if self.prev_access.is_write() {
            prev.access
        } else {
            vk::AccessFlags2::NONE
        };
        // Write-after-read needs only an execution dependency, unless the
        // layout changes.
        let dst_access = if !src_access.is_empty() || old_layout != new_layout {
            next.access
        } else {
            vk::AccessFlags2::NONE
        };

        vk::ImageMemoryBarrier2::default()
            .src_stage_mask(prev.stages)
            .src_access_mask(src_access)
            .dst_stage_mask(next.stages)
            .dst_access_mask(dst_access)
            .old_layout(old_layout)
            .new_layout(new_layout)
            .src_queue_family_index(self.src_queue_family)
            .dst_queue_family_index(self.dst_queue_family)
            .image(self.image)
            .subresource_range(self.range)
    }
}

/// Everything two barriers must agree on to be recorded together.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BatchKey {
    pub prev_access: Access,
    pub next_access: Access,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_queue_family: u32,
    pub dst_queue_family: u32,
}

#[derive(Debug)]
pub struct BarrierBatch {
    pub key: BatchKey,
    pub barriers: Vec<vk::ImageMemoryBarrier2<'static>>,
}

/// Groups barriers by transition, keeping first-appearance order. The input
/// barriers are independent, so recording the batches is equivalent to
/// recording each barrier on its own.
pub fn batch_image_barriers(barriers: &[ImageBarrier]) -> Vec<BarrierBatch> {
    let mut batches: Vec<BarrierBatch> = Vec::new();
    for barrier in barriers {
        let key = barrier.batch_key();
        let vk_barrier = barrier.to_vk();
        match batches.iter_mut().find(|batch| batch.key == key) {
            Some(batch) => batch.barriers.push(vk_barrier),
            None => batches.push(BarrierBatch {
                key,
                barriers: vec![vk_barrier],
            }),
        }
    }
    batches
}

/// Memory barrier with no resource attached.
pub fn global_barrier(prev_access: Access, next_access: Access) -> vk::MemoryBarrier2<'static> {
    let prev = access_info(prev_access);
    let next = access_info(next_access);
    let src_access = if prev_access.is_write() {
        prev.access
    } else {
        vk::AccessFlags2::NONE
    };
    let dst_access = if src_access.is_empty() {
        vk::AccessFlags2::NONE
    } else {
        next.access
    };

    vk::MemoryBarrier2::default()
        .src_stage_mask(prev.stages)
        .src_access_mask(src_access)
        .dst_stage_mask(next.stages)
        .dst_access_mask(dst_access)
}

/// Orders everything before the barrier against everything after it, e.g. a
/// buffer fill against the shader that reads it. Always pair a write with
/// the read that depends on it.
///
/// # Safety
/// `cmd` must be in the recording state and belong to `device`.
pub unsafe fn insert_global_barrier(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    prev_access: Access,
    next_access: Access,
) {
    trace!(?prev_access, ?next_access, "global barrier");
    let barrier = global_barrier(prev_access, next_access);
    let dependency = vk::DependencyInfo::default().memory_barriers(std::slice::from_ref(&barrier));
    device.cmd_pipeline_barrier2(cmd, &dependency);
}

/// # Safety
/// `cmd` must be in the recording state and belong to `device`; every image
/// must be alive and the ranges must match what later passes access.
pub unsafe fn insert_image_barriers(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    barriers: &[ImageBarrier],
) {
    for batch in batch_image_barriers(barriers) {
        trace!(
            prev = ?batch.key.prev_access,
            next = ?batch.key.next_access,
            old_layout = ?batch.key.old_layout,
            new_layout = ?batch.key.new_layout,
            images = batch.barriers.len(),
            "image barriers"
        );
        let dependency = vk::DependencyInfo::default().image_memory_barriers(&batch.barriers);
        device.cmd_pipeline_barrier2(cmd, &dependency);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    const QUEUE: u32 = 0;

    fn color_barrier(raw: u64, prev: Access, next: Access) -> ImageBarrier {
        ImageBarrier::new(
            vk::Image::from_raw(raw),
            subresource_range(SubresourceRange::color()),
            prev,
            next,
            QUEUE,
        )
    }

    #[test]
    fn depth_write_maps_to_fragment_tests() {
        let info = access_info(Access::DepthStencilAttachmentWrite);
        assert!(info.stages.contains(vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS));
        assert!(info.stages.contains(vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS));
        assert_eq!(info.access, vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE);
        assert_eq!(info.layout, vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);
    }

    #[test]
    fn attachment_read_write_and_general_combine_masks() {
        let rw = access_info(Access::ColorAttachmentReadWrite);
        assert_eq!(
            rw.access,
            vk::AccessFlags2::COLOR_ATTACHMENT_READ | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE
        );
        let general = access_info(Access::General);
        assert!(general.access.contains(vk::AccessFlags2::MEMORY_READ));
        assert!(general.access.contains(vk::AccessFlags2::MEMORY_WRITE));
        let depth_read = access_info(Access::DepthStencilAttachmentRead);
        assert!(depth_read.stages.contains(vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS));
        assert!(depth_read.stages.contains(vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS));
    }

    #[test]
    fn first_use_waits_for_the_acquire_semaphore() {
        let vk_barrier = color_barrier(9, Access::None, Access::ComputeShaderWrite)
            .discard()
            .to_vk();
        assert!(vk_barrier.src_stage_mask.intersects(ACQUIRE_WAIT_STAGE));
        assert_eq!(vk_barrier.src_access_mask, vk::AccessFlags2::NONE);
        assert_eq!(vk_barrier.old_layout, vk::ImageLayout::UNDEFINED);

        let global = global_barrier(Access::None, Access::TransferWrite);
        assert!(global.src_stage_mask.intersects(ACQUIRE_WAIT_STAGE));
    }

    #[test]
    fn sampled_reads_use_read_only_layout() {
        for access in [
            Access::VertexShaderReadSampledImage,
            Access::FragmentShaderReadSampledImage,
            Access::ComputeShaderReadSampledImage,
            Access::AnyShaderReadSampledImage,
        ] {
            assert_eq!(access_info(access).layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        }
    }

    #[test]
    fn general_layout_is_forced_except_for_none_and_present() {
        assert_eq!(
            image_layout(Access::ColorAttachmentWrite, ImageLayout::General),
            vk::ImageLayout::GENERAL
        );
        assert_eq!(
            image_layout(Access::Present, ImageLayout::General),
            vk::ImageLayout::PRESENT_SRC_KHR
        );
        assert_eq!(
            image_layout(Access::None, ImageLayout::General),
            vk::ImageLayout::UNDEFINED
        );
    }

    #[test]
    fn discard_starts_from_undefined() {
        let barrier = color_barrier(1, Access::ComputeShaderWrite, Access::ColorAttachmentWrite).discard();
        let vk_barrier = barrier.to_vk();
        assert_eq!(vk_barrier.old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(vk_barrier.new_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
    }

    #[test]
    fn write_to_read_makes_writes_visible() {
        let vk_barrier = color_barrier(
            1,
            Access::ColorAttachmentWrite,
            Access::ComputeShaderReadSampledImage,
        )
        .to_vk();
        assert_eq!(vk_barrier.src_stage_mask, vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT);
        assert_eq!(vk_barrier.src_access_mask, vk::AccessFlags2::COLOR_ATTACHMENT_WRITE);
        assert_eq!(vk_barrier.dst_stage_mask, vk::PipelineStageFlags2::COMPUTE_SHADER);
        assert_eq!(vk_barrier.dst_access_mask, vk::AccessFlags2::SHADER_SAMPLED_READ);
        assert_eq!(vk_barrier.old_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(vk_barrier.new_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    }

    #[test]
    fn present_keeps_contents() {
        let vk_barrier = color_barrier(7, Access::ColorAttachmentWrite, Access::Present).to_vk();
        assert_eq!(vk_barrier.old_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(vk_barrier.new_layout, vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(vk_barrier.dst_stage_mask, vk::PipelineStageFlags2::NONE);
        assert!(vk_barrier.src_stage_mask.intersects(RENDER_FINISHED_STAGE));
    }

    #[test]
    fn matching_transitions_share_one_batch() {
        let a = color_barrier(1, Access::ColorAttachmentWrite, Access::ComputeShaderReadSampledImage);
        let b = color_barrier(2, Access::ColorAttachmentWrite, Access::ComputeShaderReadSampledImage);

        let batched = batch_image_barriers(&[a, b]);
        assert_eq!(batched.len(), 1);
        assert_eq!(batched[0].barriers.len(), 2);

        // Same barriers as recording them one at a time, in the same order.
        let one_by_one: Vec<_> = [a, b]
            .iter()
            .flat_map(|barrier| batch_image_barriers(std::slice::from_ref(barrier)))
            .flat_map(|batch| batch.barriers)
            .collect();
        for (batched, single) in batched[0].barriers.iter().zip(&one_by_one) {
            assert_eq!(batched.image, single.image);
            assert_eq!(batched.src_stage_mask, single.src_stage_mask);
            assert_eq!(batched.dst_stage_mask, single.dst_stage_mask);
            assert_eq!(batched.src_access_mask, single.src_access_mask);
            assert_eq!(batched.dst_access_mask, single.dst_access_mask);
            assert_eq!(batched.old_layout, single.old_layout);
            assert_eq!(batched.new_layout, single.new_layout);
        }
    }

    #[test]
    fn differing_transitions_split_in_first_seen_order() {
        let depth_range = subresource_range(SubresourceRange::depth());
        let depth = ImageBarrier::new(
            vk::Image::from_raw(3),
            depth_range,
            Access::DepthStencilAttachmentWrite,
            Access::ComputeShaderReadSampledImage,
            QUEUE,
        );
        let color = color_barrier(4, Access::ColorAttachmentWrite, Access::ComputeShaderReadSampledImage);
        let depth_again = ImageBarrier {
            image: vk::Image::from_raw(5),
            ..depth
        };

        let batches = batch_image_barriers(&[depth, color, depth_again]);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].key.prev_access, Access::DepthStencilAttachmentWrite);
        assert_eq!(batches[0].barriers.len(), 2);
        assert_eq!(batches[0].barriers[0].subresource_range.aspect_mask, vk::ImageAspectFlags::DEPTH);
        assert_eq!(batches[1].key.prev_access, Access::ColorAttachmentWrite);
    }

    #[test]
    fn discard_and_preserve_never_share_a_batch() {
        let keep = color_barrier(1, Access::ComputeShaderWrite, Access::ColorAttachmentWrite);
        let drop = color_barrier(2, Access::ComputeShaderWrite, Access::ColorAttachmentWrite).discard();
        assert_eq!(batch_image_barriers(&[keep, drop]).len(), 2);
    }

    #[test]
    fn queue_family_is_part_of_the_key() {
        let local = color_barrier(1, Access::TransferWrite, Access::ComputeShaderReadSampledImage);
        let transfer = ImageBarrier {
            image: vk::Image::from_raw(2),
            dst_queue_family: 3,
            ..local
        };
        assert_eq!(batch_image_barriers(&[local, transfer]).len(), 2);
    }

    #[test]
    fn clear_fence_orders_everything() {
        let barrier = global_barrier(Access::General, Access::General);
        assert_eq!(barrier.src_stage_mask, vk::PipelineStageFlags2::ALL_COMMANDS);
        assert_eq!(barrier.dst_stage_mask, vk::PipelineStageFlags2::ALL_COMMANDS);
        assert!(barrier.src_access_mask.contains(vk::AccessFlags2::MEMORY_WRITE));
        assert!(barrier.dst_access_mask.contains(vk::AccessFlags2::MEMORY_READ));
    }

    #[test]
    fn read_after_read_is_execution_only() {
        let barrier = global_barrier(Access::IndirectBuffer, Access::ComputeShaderWrite);
        assert_eq!(barrier.src_access_mask, vk::AccessFlags2::NONE);
        assert_eq!(barrier.dst_access_mask, vk::AccessFlags2::NONE);
        assert_eq!(barrier.src_stage_mask, vk::PipelineStageFlags2::DRAW_INDIRECT);
    }

    #[test]
    fn draw_calls_become_visible_to_indirect_reads() {
        let barrier = global_barrier(Access::ComputeShaderWrite, Access::IndirectBuffer);
        assert_eq!(barrier.src_access_mask, vk::AccessFlags2::SHADER_STORAGE_WRITE);
        assert_eq!(barrier.dst_access_mask, vk::AccessFlags2::INDIRECT_COMMAND_READ);
    }
}
