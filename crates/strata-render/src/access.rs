// SPDX-License-Identifier: CEPL-1.0
//! Abstract resource access states.
//!
//! Passes declare how they touch a resource with an [`Access`]; the backend
//! derives pipeline stages, memory access masks and image layouts from it.
//! Nothing here names a raw stage or access bit.

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Access {
    /// No access. Used as the previous state of a resource's first use.
    None,

    /// Read as an indirect buffer for drawing or dispatch.
    IndirectBuffer,
    /// Read as an index buffer.
    IndexBuffer,
    /// Read as a vertex buffer.
    VertexBuffer,

    /// Read as a uniform buffer in a vertex shader.
    VertexShaderReadUniformBuffer,
    /// Read as a sampled image or uniform texel buffer in a vertex shader.
    VertexShaderReadSampledImage,
    /// Read as any other resource in a vertex shader.
    VertexShaderReadOther,

    /// Read as a uniform buffer in a fragment shader.
    FragmentShaderReadUniformBuffer,
    /// Read as a sampled image or uniform texel buffer in a fragment shader.
    FragmentShaderReadSampledImage,
    /// Read as any other resource in a fragment shader.
    FragmentShaderReadOther,

    /// Read as a color attachment.
    ColorAttachmentRead,
    /// Read as a depth-stencil attachment.
    DepthStencilAttachmentRead,

    /// Read as a uniform buffer in a compute shader.
    ComputeShaderReadUniformBuffer,
    /// Read as a sampled image or uniform texel buffer in a compute shader.
    ComputeShaderReadSampledImage,
    /// Read as any other resource in a compute shader.
    ComputeShaderReadOther,

    /// Read as a uniform buffer in any shader.
    AnyShaderReadUniformBuffer,
    /// Read as a sampled image or uniform texel buffer in any shader.
    AnyShaderReadSampledImage,
    /// Read as any other resource (excluding attachments) in any shader.
    AnyShaderReadOther,

    /// Read as the source of a transfer operation.
    TransferRead,
    /// Read on the host.
    HostRead,

    /// Read by the presentation engine.
    Present,

    /// Written as any resource in a vertex shader.
    VertexShaderWrite,
    /// Written as any resource in a fragment shader.
    FragmentShaderWrite,

    /// Written as a color attachment during rendering.
    ColorAttachmentWrite,
    /// Written as a depth-stencil attachment during rendering.
    DepthStencilAttachmentWrite,

    /// Written as any resource in a compute shader.
    ComputeShaderWrite,
    /// Written as any resource in any shader.
    AnyShaderWrite,

    /// Written as the destination of a transfer operation.
    TransferWrite,
    /// Pre-initialized on the host before device access starts.
    HostPreinitialized,
    /// Written on the host.
    HostWrite,

    /// Read or written as a color attachment during rendering.
    ColorAttachmentReadWrite,

    /// Covers any access. Slow.
    General,
}

impl Access {
    /// Whether this access type only reads.
    pub fn is_read(self) -> bool {
        !self.is_write()
    }

    /// Whether this access type contains a write.
    pub fn is_write(self) -> bool {
        matches!(
            self,
            Access::VertexShaderWrite
                | Access::FragmentShaderWrite
                | Access::ColorAttachmentWrite
                | Access::DepthStencilAttachmentWrite
                | Access::ComputeShaderWrite
                | Access::AnyShaderWrite
                | Access::TransferWrite
                | Access::HostPreinitialized
                | Access::HostWrite
                | Access::ColorAttachmentReadWrite
                | Access::General
        )
    }
}

/// Which layout family an image uses for a given access.
///
/// `Optimal` picks the layout dictated by the access; `General` forces the
/// general layout, e.g. for storage-image writes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ImageLayout {
    #[default]
    Optimal,
    General,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ImageAspect {
    Color,
    Depth,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubresourceRange {
    pub aspect: ImageAspect,
    pub base_mip_level: u32,
    pub level_count: u32,
    pub base_array_layer: u32,
    pub layer_count: u32,
}

impl SubresourceRange {
    pub const fn color() -> Self {
        Self {
            aspect: ImageAspect::Color,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        }
    }

    pub const fn depth() -> Self {
        Self::depth_layers(1)
    }

    pub const fn depth_layers(layer_count: u32) -> Self {
        Self {
            aspect: ImageAspect::Depth,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count,
        }
    }
}

impl Default for SubresourceRange {
    fn default() -> Self {
        Self::color()
    }
}
