// SPDX-License-Identifier: CEPL-1.0
//! The per-frame pass sequence, as data.
//!
//! [`FramePlan::build`] lays out every pass of the visibility-buffer pipeline
//! in submission order, together with the barriers each pass needs before it
//! runs. A backend walks the list and records it; nothing in here touches a
//! device, so the sequence can be checked directly.

use bitflags::bitflags;
use strata_math::{
    dispatch_size, DrawIndirectCommand, MiscStorage, ALPHA_CLIP_DRAWS_BYTE_OFFSET,
    CULL_GROUP_SIZE, DEPTH_REDUCE_TILE, FULLSCREEN_GROUP_SIZE, MAX_ALPHA_CLIP_DRAWS,
    MAX_OPAQUE_DRAWS, SHADOW_CASCADES, SHADOW_MAP_SIZE,
};

use crate::access::{Access, ImageLayout, SubresourceRange};
use crate::RenderSize;

/// Images a frame reads or writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FrameImage {
    DepthBuffer,
    ShadowArray,
    SceneFramebuffer,
    VisBuffer,
    Swapchain,
}

impl FrameImage {
    /// The exact range every pass of the frame touches.
    pub fn range(self) -> SubresourceRange {
        match self {
            FrameImage::DepthBuffer => SubresourceRange::depth(),
            FrameImage::ShadowArray => SubresourceRange::depth_layers(SHADOW_CASCADES),
            FrameImage::SceneFramebuffer | FrameImage::VisBuffer | FrameImage::Swapchain => {
                SubresourceRange::color()
            }
        }
    }
}

/// Buffers the plan addresses directly.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FrameBuffer {
    Misc,
    DrawCalls,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ComputePipeline {
    WriteDrawCalls,
    ReadDepth,
    GenerateMatrices,
    RenderGeometry,
    DisplayTransform,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GraphicsPipeline {
    VisbufferOpaque,
    VisbufferAlphaClip,
    ShadowOpaque,
    ShadowAlphaClip,
    DepthPrepass,
}

bitflags! {
    /// Pipeline bind points a resource table is bound to.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct BindPoints: u8 {
        const COMPUTE = 1 << 0;
        const GRAPHICS = 1 << 1;
    }
}

/// One image changing access state.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ImageTransition {
    pub image: FrameImage,
    pub prev_access: Access,
    pub next_access: Access,
    pub prev_layout: ImageLayout,
    pub next_layout: ImageLayout,
    /// Only valid on the first use of the image in a frame.
    pub discard_contents: bool,
    pub range: SubresourceRange,
}

impl ImageTransition {
    /// First use this frame: previous contents are discarded.
    pub fn acquire(image: FrameImage, next_access: Access, next_layout: ImageLayout) -> Self {
        Self {
            image,
            prev_access: Access::None,
            next_access,
            prev_layout: ImageLayout::Optimal,
            next_layout,
            discard_contents: true,
            range: image.range(),
        }
    }

    /// Contents-preserving transition between two optimal layouts.
    pub fn between(image: FrameImage, prev_access: Access, next_access: Access) -> Self {
        Self {
            image,
            prev_access,
            next_access,
            prev_layout: ImageLayout::Optimal,
            next_layout: ImageLayout::Optimal,
            discard_contents: false,
            range: image.range(),
        }
    }

    pub fn with_prev_layout(mut self, layout: ImageLayout) -> Self {
        self.prev_layout = layout;
        self
    }
}

/// Resource-less memory dependency.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GlobalTransition {
    pub prev_access: Access,
    pub next_access: Access,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferFill {
    pub buffer: FrameBuffer,
    pub offset: u64,
    pub size: u64,
    pub value: u32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum LoadOp {
    Load,
    DontCare,
    ClearDepth(f32),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttachmentView {
    Image(FrameImage),
    /// A single layer of the shadow array.
    ShadowLayer(u32),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Attachment {
    pub view: AttachmentView,
    pub load: LoadOp,
}

/// Indirect draw whose count is read from device memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndirectDraw {
    pub pipeline: GraphicsPipeline,
    /// Byte offset into the draw-call buffer.
    pub draw_offset: u64,
    /// Byte offset of the counter inside the misc buffer.
    pub count_offset: u64,
    /// Hard cap; device-written counts above it are truncated.
    pub max_draw_count: u32,
    pub stride: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub enum PassKind {
    /// Barriers only.
    Transition,
    FillBuffers(Vec<BufferFill>),
    BindResourceTable {
        bind_points: BindPoints,
        swapchain_index: u32,
    },
    Dispatch {
        pipeline: ComputePipeline,
        grid: [u32; 3],
    },
    Raster {
        extent: RenderSize,
        color: Option<Attachment>,
        depth: Option<Attachment>,
        cascade: Option<u32>,
        draws: Vec<IndirectDraw>,
    },
    /// The external UI layer records into this pass.
    UiComposite {
        extent: RenderSize,
        target: Attachment,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct PassRecord {
    pub name: &'static str,
    pub global_barrier: Option<GlobalTransition>,
    pub image_barriers: Vec<ImageTransition>,
    pub kind: PassKind,
}

impl PassRecord {
    fn new(name: &'static str, kind: PassKind) -> Self {
        Self {
            name,
            global_barrier: None,
            image_barriers: Vec::new(),
            kind,
        }
    }

    fn after_images(mut self, barriers: Vec<ImageTransition>) -> Self {
        self.image_barriers = barriers;
        self
    }

    fn after_global(mut self, prev_access: Access, next_access: Access) -> Self {
        self.global_barrier = Some(GlobalTransition {
            prev_access,
            next_access,
        });
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameParams {
    pub extent: RenderSize,
    pub instance_count: u32,
    pub swapchain_index: u32,
}

const SHADOW_PASS_NAMES: [&str; SHADOW_CASCADES as usize] = [
    "shadowmap cascade 0",
    "shadowmap cascade 1",
    "shadowmap cascade 2",
    "shadowmap cascade 3",
];

fn opaque_and_alpha_clip(opaque: GraphicsPipeline, alpha_clip: GraphicsPipeline) -> Vec<IndirectDraw> {
    vec![
        IndirectDraw {
            pipeline: opaque,
            draw_offset: 0,
            count_offset: MiscStorage::OPAQUE_COUNT_OFFSET,
            max_draw_count: MAX_OPAQUE_DRAWS,
            stride: DrawIndirectCommand::STRIDE,
        },
        IndirectDraw {
            pipeline: alpha_clip,
            draw_offset: ALPHA_CLIP_DRAWS_BYTE_OFFSET,
            count_offset: MiscStorage::ALPHA_CLIP_COUNT_OFFSET,
            max_draw_count: MAX_ALPHA_CLIP_DRAWS,
            stride: DrawIndirectCommand::STRIDE,
        },
    ]
}

fn fullscreen_grid(extent: RenderSize) -> [u32; 3] {
    [
        dispatch_size(extent.width, FULLSCREEN_GROUP_SIZE),
        dispatch_size(extent.height, FULLSCREEN_GROUP_SIZE),
        1,
    ]
}

#[derive(Clone, Debug, PartialEq)]
pub struct FramePlan {
    passes: Vec<PassRecord>,
}

impl FramePlan {
    pub fn build(params: &FrameParams) -> Self {
        use FrameImage::*;

        let extent = params.extent;
        let mut passes = Vec::with_capacity(16);

        passes.push(
            PassRecord::new("acquire", PassKind::Transition).after_images(vec![
                ImageTransition::acquire(
                    DepthBuffer,
                    Access::DepthStencilAttachmentWrite,
                    ImageLayout::Optimal,
                ),
                ImageTransition::acquire(
                    ShadowArray,
                    Access::DepthStencilAttachmentWrite,
                    ImageLayout::Optimal,
                ),
                ImageTransition::acquire(
                    SceneFramebuffer,
                    Access::ComputeShaderWrite,
                    ImageLayout::General,
                ),
                ImageTransition::acquire(Swapchain, Access::ComputeShaderWrite, ImageLayout::General),
                ImageTransition::acquire(VisBuffer, Access::ColorAttachmentWrite, ImageLayout::Optimal),
            ]),
        );

        // min depth gets the sentinel, then max depth and both draw counters
        // are zeroed with one contiguous fill.
        passes.push(PassRecord::new(
            "buffer clears",
            PassKind::FillBuffers(vec![
                BufferFill {
                    buffer: FrameBuffer::Misc,
                    offset: MiscStorage::MIN_DEPTH_OFFSET,
                    size: 4,
                    value: MiscStorage::MIN_DEPTH_SENTINEL,
                },
                BufferFill {
                    buffer: FrameBuffer::Misc,
                    offset: MiscStorage::MAX_DEPTH_OFFSET,
                    size: 12,
                    value: 0,
                },
            ]),
        ));

        passes.push(
            PassRecord::new("clear fence", PassKind::Transition)
                .after_global(Access::General, Access::General),
        );

        passes.push(PassRecord::new(
            "bind resource table",
            PassKind::BindResourceTable {
                bind_points: BindPoints::COMPUTE | BindPoints::GRAPHICS,
                swapchain_index: params.swapchain_index,
            },
        ));

        passes.push(PassRecord::new(
            "write draw calls",
            PassKind::Dispatch {
                pipeline: ComputePipeline::WriteDrawCalls,
                grid: [dispatch_size(params.instance_count, CULL_GROUP_SIZE), 1, 1],
            },
        ));

        passes.push(
            PassRecord::new(
                "visbuffer rendering",
                PassKind::Raster {
                    extent,
                    color: Some(Attachment {
                        view: AttachmentView::Image(VisBuffer),
                        load: LoadOp::DontCare,
                    }),
                    depth: Some(Attachment {
                        view: AttachmentView::Image(DepthBuffer),
                        load: LoadOp::ClearDepth(0.0),
                    }),
                    cascade: None,
                    draws: opaque_and_alpha_clip(
                        GraphicsPipeline::VisbufferOpaque,
                        GraphicsPipeline::VisbufferAlphaClip,
                    ),
                },
            )
            .after_global(Access::ComputeShaderWrite, Access::IndirectBuffer),
        );

        passes.push(
            PassRecord::new(
                "depth reduction",
                PassKind::Dispatch {
                    pipeline: ComputePipeline::ReadDepth,
                    grid: [
                        dispatch_size(extent.width, DEPTH_REDUCE_TILE),
                        dispatch_size(extent.height, DEPTH_REDUCE_TILE),
                        1,
                    ],
                },
            )
            .after_images(vec![
                ImageTransition::between(
                    DepthBuffer,
                    Access::DepthStencilAttachmentWrite,
                    Access::ComputeShaderReadSampledImage,
                ),
                ImageTransition::between(
                    VisBuffer,
                    Access::ColorAttachmentWrite,
                    Access::ComputeShaderReadSampledImage,
                ),
            ]),
        );

        passes.push(
            PassRecord::new(
                "generate matrices",
                PassKind::Dispatch {
                    pipeline: ComputePipeline::GenerateMatrices,
                    grid: [1, 1, 1],
                },
            )
            .after_global(Access::ComputeShaderWrite, Access::ComputeShaderReadOther),
        );

        let shadow_extent = RenderSize {
            width: SHADOW_MAP_SIZE,
            height: SHADOW_MAP_SIZE,
        };
        for (cascade, name) in (0..SHADOW_CASCADES).zip(SHADOW_PASS_NAMES) {
            let mut pass = PassRecord::new(
                name,
                PassKind::Raster {
                    extent: shadow_extent,
                    color: None,
                    depth: Some(Attachment {
                        view: AttachmentView::ShadowLayer(cascade),
                        load: LoadOp::ClearDepth(1.0),
                    }),
                    cascade: Some(cascade),
                    draws: opaque_and_alpha_clip(
                        GraphicsPipeline::ShadowOpaque,
                        GraphicsPipeline::ShadowAlphaClip,
                    ),
                },
            );
            if cascade == 0 {
                // Matrices are read by the shadow vertex shaders and again by
                // the resolve pass.
                pass = pass.after_global(Access::ComputeShaderWrite, Access::AnyShaderReadOther);
            }
            passes.push(pass);
        }

        passes.push(
            PassRecord::new(
                "render geometry",
                PassKind::Dispatch {
                    pipeline: ComputePipeline::RenderGeometry,
                    grid: fullscreen_grid(extent),
                },
            )
            .after_images(vec![ImageTransition::between(
                ShadowArray,
                Access::DepthStencilAttachmentWrite,
                Access::ComputeShaderReadSampledImage,
            )]),
        );

        passes.push(
            PassRecord::new(
                "display transform",
                PassKind::Dispatch {
                    pipeline: ComputePipeline::DisplayTransform,
                    grid: fullscreen_grid(extent),
                },
            )
            .after_images(vec![ImageTransition::between(
                SceneFramebuffer,
                Access::ComputeShaderWrite,
                Access::ComputeShaderReadSampledImage,
            )
            .with_prev_layout(ImageLayout::General)]),
        );

        passes.push(
            PassRecord::new(
                "ui",
                PassKind::UiComposite {
                    extent,
                    target: Attachment {
                        view: AttachmentView::Image(Swapchain),
                        load: LoadOp::Load,
                    },
                },
            )
            .after_images(vec![ImageTransition::between(
                Swapchain,
                Access::ComputeShaderWrite,
                Access::ColorAttachmentWrite,
            )
            .with_prev_layout(ImageLayout::General)]),
        );

        // UI output must survive, so this never discards.
        passes.push(
            PassRecord::new("present", PassKind::Transition).after_images(vec![
                ImageTransition::between(Swapchain, Access::ColorAttachmentWrite, Access::Present),
            ]),
        );

        Self { passes }
    }

    pub fn passes(&self) -> &[PassRecord] {
        &self.passes
    }

    pub fn pass(&self, name: &str) -> Option<&PassRecord> {
        self.passes.iter().find(|pass| pass.name == name)
    }

    pub fn dispatch_grid(&self, pipeline: ComputePipeline) -> Option<[u32; 3]> {
        self.passes.iter().find_map(|pass| match pass.kind {
            PassKind::Dispatch { pipeline: p, grid } if p == pipeline => Some(grid),
            _ => None,
        })
    }

    pub fn indirect_draws(&self) -> impl Iterator<Item = &IndirectDraw> {
        self.passes.iter().flat_map(|pass| match &pass.kind {
            PassKind::Raster { draws, .. } => draws.as_slice(),
            _ => &[][..],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn plan(width: u32, height: u32, instance_count: u32) -> FramePlan {
        FramePlan::build(&FrameParams {
            extent: RenderSize { width, height },
            instance_count,
            swapchain_index: 1,
        })
    }

    #[test]
    fn passes_run_in_pipeline_order() {
        let names: Vec<_> = plan(1920, 1080, 200).passes().iter().map(|p| p.name).collect();
        assert_eq!(
            names,
            [
                "acquire",
                "buffer clears",
                "clear fence",
                "bind resource table",
                "write draw calls",
                "visbuffer rendering",
                "depth reduction",
                "generate matrices",
                "shadowmap cascade 0",
                "shadowmap cascade 1",
                "shadowmap cascade 2",
                "shadowmap cascade 3",
                "render geometry",
                "display transform",
                "ui",
                "present",
            ]
        );
    }

    #[test]
    fn dispatch_grids_follow_extent_and_instances() {
        let plan = plan(1920, 1080, 200);
        assert_eq!(plan.dispatch_grid(ComputePipeline::WriteDrawCalls), Some([4, 1, 1]));
        assert_eq!(plan.dispatch_grid(ComputePipeline::ReadDepth), Some([60, 34, 1]));
        assert_eq!(plan.dispatch_grid(ComputePipeline::GenerateMatrices), Some([1, 1, 1]));
        assert_eq!(plan.dispatch_grid(ComputePipeline::RenderGeometry), Some([240, 135, 1]));
        assert_eq!(plan.dispatch_grid(ComputePipeline::DisplayTransform), Some([240, 135, 1]));
    }

    #[test]
    fn indirect_draws_are_capped() {
        let plan = plan(1280, 720, 100_000);
        let draws: Vec<_> = plan.indirect_draws().collect();
        // visbuffer + four cascades, two batches each
        assert_eq!(draws.len(), 10);
        for draw in draws {
            match draw.pipeline {
                GraphicsPipeline::VisbufferOpaque | GraphicsPipeline::ShadowOpaque => {
                    assert_eq!(draw.max_draw_count, MAX_OPAQUE_DRAWS);
                    assert_eq!(draw.draw_offset, 0);
                    assert_eq!(draw.count_offset, MiscStorage::OPAQUE_COUNT_OFFSET);
                }
                GraphicsPipeline::VisbufferAlphaClip | GraphicsPipeline::ShadowAlphaClip => {
                    assert_eq!(draw.max_draw_count, MAX_ALPHA_CLIP_DRAWS);
                    assert_eq!(draw.draw_offset, ALPHA_CLIP_DRAWS_BYTE_OFFSET);
                    assert_eq!(draw.count_offset, MiscStorage::ALPHA_CLIP_COUNT_OFFSET);
                }
                GraphicsPipeline::DepthPrepass => panic!("depth pre-pass is never scheduled"),
            }
            assert_eq!(draw.stride, DrawIndirectCommand::STRIDE);
        }
    }

    #[test]
    fn zero_instance_frame_still_runs_every_pass() {
        let empty = plan(1920, 1080, 0);
        let full = plan(1920, 1080, 200);
        assert_eq!(empty.passes().len(), full.passes().len());
        assert_eq!(empty.dispatch_grid(ComputePipeline::WriteDrawCalls), Some([0, 1, 1]));
        assert_eq!(empty.dispatch_grid(ComputePipeline::DisplayTransform), Some([240, 135, 1]));
        assert!(empty.pass("ui").is_some());
        assert!(empty.pass("present").is_some());
    }

    #[test]
    fn first_use_discards_and_nothing_else_does() {
        let plan = plan(800, 600, 10);
        let acquire = plan.pass("acquire").unwrap();
        assert_eq!(acquire.image_barriers.len(), 5);
        assert!(acquire
            .image_barriers
            .iter()
            .all(|b| b.discard_contents && b.prev_access == Access::None));

        let later = plan.passes().iter().skip(1).flat_map(|p| &p.image_barriers);
        for barrier in later {
            assert!(!barrier.discard_contents, "{:?} discards after first use", barrier.image);
        }
    }

    #[test]
    fn image_accesses_chain_without_gaps() {
        // Every barrier must start from the access the previous one left behind.
        let plan = plan(800, 600, 10);
        let mut state: HashMap<FrameImage, (Access, ImageLayout)> = HashMap::new();
        for barrier in plan.passes().iter().flat_map(|p| &p.image_barriers) {
            let prev = state
                .get(&barrier.image)
                .copied()
                .unwrap_or((Access::None, ImageLayout::Optimal));
            assert_eq!(prev, (barrier.prev_access, barrier.prev_layout), "{:?}", barrier.image);
            assert_eq!(barrier.range, barrier.image.range());
            state.insert(barrier.image, (barrier.next_access, barrier.next_layout));
        }
        assert_eq!(state[&FrameImage::Swapchain].0, Access::Present);
    }

    #[test]
    fn ui_pass_loads_and_present_preserves() {
        let plan = plan(800, 600, 10);
        match &plan.pass("ui").unwrap().kind {
            PassKind::UiComposite { target, .. } => {
                assert_eq!(target.view, AttachmentView::Image(FrameImage::Swapchain));
                assert_eq!(target.load, LoadOp::Load);
            }
            other => panic!("unexpected ui pass {other:?}"),
        }
        let present = &plan.pass("present").unwrap().image_barriers[0];
        assert_eq!(present.prev_access, Access::ColorAttachmentWrite);
        assert_eq!(present.next_access, Access::Present);
        assert!(!present.discard_contents);
    }

    #[test]
    fn clears_reset_depth_bounds_and_counters() {
        let plan = plan(800, 600, 10);
        let PassKind::FillBuffers(fills) = &plan.pass("buffer clears").unwrap().kind else {
            panic!("buffer clears is not a fill pass");
        };
        assert_eq!(fills[0].offset, MiscStorage::MIN_DEPTH_OFFSET);
        assert_eq!(fills[0].value, u32::MAX);
        assert_eq!(fills[1].offset, MiscStorage::MAX_DEPTH_OFFSET);
        assert_eq!(fills[1].offset + fills[1].size, MiscStorage::SIZE);
        assert_eq!(fills[1].value, 0);

        let fence = plan.pass("clear fence").unwrap();
        assert_eq!(
            fence.global_barrier,
            Some(GlobalTransition {
                prev_access: Access::General,
                next_access: Access::General
            })
        );
    }

    #[test]
    fn shadow_cascades_select_their_layer() {
        let plan = plan(800, 600, 10);
        let cascades: Vec<_> = plan
            .passes()
            .iter()
            .filter_map(|p| match &p.kind {
                PassKind::Raster {
                    extent,
                    depth: Some(depth),
                    cascade: Some(cascade),
                    color: None,
                    ..
                } => Some((*extent, depth.view, *cascade)),
                _ => None,
            })
            .collect();
        assert_eq!(cascades.len(), SHADOW_CASCADES as usize);
        for (i, (extent, view, cascade)) in cascades.into_iter().enumerate() {
            assert_eq!(extent, RenderSize { width: 1024, height: 1024 });
            assert_eq!(view, AttachmentView::ShadowLayer(i as u32));
            assert_eq!(cascade, i as u32);
        }
    }

    #[test]
    fn table_binding_uses_current_swapchain_image() {
        let plan = plan(800, 600, 10);
        assert_eq!(
            plan.pass("bind resource table").unwrap().kind,
            PassKind::BindResourceTable {
                bind_points: BindPoints::COMPUTE | BindPoints::GRAPHICS,
                swapchain_index: 1,
            }
        );
    }
}
