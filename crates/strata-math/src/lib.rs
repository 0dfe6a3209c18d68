// SPDX-License-Identifier: CEPL-1.0
//! Data layouts shared byte-for-byte with the shaders.
//!
//! Everything in here is `#[repr(C)]` and `Pod` so it can be copied straight
//! into mapped device memory. Field order is part of the shader contract.

use bytemuck::{Pod, Zeroable};
use glam::Mat4;
use std::mem::{offset_of, size_of};

pub use glam;

/// Number of shadow cascades, one array layer each.
pub const SHADOW_CASCADES: u32 = 4;
/// Edge length of every shadow cascade.
pub const SHADOW_MAP_SIZE: u32 = 1024;

/// Upper bound on opaque draws the culling pass may emit.
pub const MAX_OPAQUE_DRAWS: u32 = 4096;
/// Upper bound on alpha-clip draws the culling pass may emit.
pub const MAX_ALPHA_CLIP_DRAWS: u32 = 4096;
/// First command of the alpha-clip region, counted in commands.
pub const ALPHA_CLIP_DRAWS_OFFSET: u32 = MAX_OPAQUE_DRAWS;

/// Slots in the sampled-image array of the resource table.
pub const BINDLESS_CAPACITY: u32 = 512;

/// Workgroup width of the draw-call generation shader.
pub const CULL_GROUP_SIZE: u32 = 64;
/// Each depth-reduction workgroup covers an 8x8 grid of 4x4 texel tiles.
pub const DEPTH_REDUCE_TILE: u32 = 8 * 4;
/// Workgroup edge of the full-screen resolve and display-transform shaders.
pub const FULLSCREEN_GROUP_SIZE: u32 = 8;

/// Number of workgroups needed to cover `count` items in groups of `group`.
#[inline]
pub const fn dispatch_size(count: u32, group: u32) -> u32 {
    count.div_ceil(group)
}

/// Mirrors `VkDrawIndirectCommand`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct DrawIndirectCommand {
    pub vertex_count: u32,
    pub instance_count: u32,
    pub first_vertex: u32,
    pub first_instance: u32,
}

impl DrawIndirectCommand {
    pub const STRIDE: u32 = size_of::<Self>() as u32;
}

/// Byte size of the whole indirect draw-call buffer (both regions).
pub const DRAW_CALLS_BUFFER_SIZE: u64 =
    (MAX_OPAQUE_DRAWS + MAX_ALPHA_CLIP_DRAWS) as u64 * DrawIndirectCommand::STRIDE as u64;

/// Byte offset of the alpha-clip region inside the draw-call buffer.
pub const ALPHA_CLIP_DRAWS_BYTE_OFFSET: u64 =
    ALPHA_CLIP_DRAWS_OFFSET as u64 * DrawIndirectCommand::STRIDE as u64;

/// Small persistent buffer written by the GPU every frame.
///
/// `min_depth`/`max_depth` hold depth values reinterpreted as `u32` so the
/// reduction shader can use integer atomics on them.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct MiscStorage {
    pub shadow_matrices: [Mat4; SHADOW_CASCADES as usize],
    pub min_depth: u32,
    pub max_depth: u32,
    pub opaque_draws: u32,
    pub alpha_clip_draws: u32,
}

impl MiscStorage {
    pub const SIZE: u64 = size_of::<Self>() as u64;
    pub const MIN_DEPTH_OFFSET: u64 = offset_of!(MiscStorage, min_depth) as u64;
    pub const MAX_DEPTH_OFFSET: u64 = offset_of!(MiscStorage, max_depth) as u64;
    pub const OPAQUE_COUNT_OFFSET: u64 = offset_of!(MiscStorage, opaque_draws) as u64;
    pub const ALPHA_CLIP_COUNT_OFFSET: u64 = offset_of!(MiscStorage, alpha_clip_draws) as u64;

    /// Sentinel written to `min_depth` so any real depth replaces it.
    pub const MIN_DEPTH_SENTINEL: u32 = u32::MAX;
}

/// Push constant selecting the cascade during shadow rendering.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct ShadowPassConstant {
    pub cascade_index: u32,
}

/// One entry of the instance buffer the culling pass walks.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct GpuInstance {
    pub transform: Mat4,
    pub mesh_index: u32,
    pub material_index: u32,
    pub _pad: [u32; 2],
}

impl GpuInstance {
    pub const STRIDE: u64 = size_of::<Self>() as u64;
}

/// Per-frame uniform block.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct Uniforms {
    pub view: Mat4,
    pub projection: Mat4,
    pub sun_direction: [f32; 4],
    pub extent: [u32; 2],
    pub instance_count: u32,
    pub _pad: u32,
}

impl Default for Uniforms {
    fn default() -> Self {
        Self {
            view: Mat4::IDENTITY,
            projection: Mat4::IDENTITY,
            sun_direction: [0.3, -1.0, 0.2, 0.0],
            extent: [1, 1],
            instance_count: 0,
            _pad: 0,
        }
    }
}
