// SPDX-License-Identifier: CEPL-1.0
//! Images and buffers the frame reads and writes.

use anyhow::{bail, Context, Result};
use ash::vk;
use strata_math::{
    GpuInstance, MiscStorage, Uniforms, DRAW_CALLS_BUFFER_SIZE, SHADOW_CASCADES, SHADOW_MAP_SIZE,
};
use strata_render::plan::{AttachmentView, FrameBuffer, FrameImage};
use tracing::debug;

use crate::descriptors::{ResizingViews, StaticBindings};
use crate::frame::SwapchainTarget;
use crate::memory::{upload_images, GpuBuffer, GpuImage, ImageDesc, ImageUpload};

pub const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;
/// Packed triangle and instance ids.
pub const VISBUFFER_FORMAT: vk::Format = vk::Format::R32_UINT;
pub const SCENE_FRAMEBUFFER_FORMAT: vk::Format = vk::Format::R16G16B16A16_SFLOAT;
pub const LUT_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;
pub const LUT_SIZE: u32 = 32;
pub const FALLBACK_TEXTURE_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;
pub const FALLBACK_TEXEL: [u8; 4] = [255; 4];

/// A display transform that leaves colors untouched.
pub fn identity_lut(size: u32) -> Vec<u8> {
    let scale = |i: u32| ((i * 255 + (size - 1) / 2) / (size - 1).max(1)) as u8;
    let mut texels = Vec::with_capacity((size * size * size * 4) as usize);
    for b in 0..size {
        for g in 0..size {
            for r in 0..size {
                texels.extend_from_slice(&[scale(r), scale(g), scale(b), 255]);
            }
        }
    }
    texels
}

/// Render targets sized to the swapchain.
pub struct ResizingResources {
    pub extent: vk::Extent2D,
    pub depth_buffer: GpuImage,
    pub scene_framebuffer: GpuImage,
    pub visbuffer: GpuImage,
}

impl ResizingResources {
    pub unsafe fn new(
        device: &ash::Device,
        memory: &vk::PhysicalDeviceMemoryProperties,
        extent: vk::Extent2D,
    ) -> Result<Self> {
        use vk::ImageUsageFlags as U;
        let depth_buffer = GpuImage::new(
            device,
            memory,
            ImageDesc::depth_2d(DEPTH_FORMAT, extent, U::DEPTH_STENCIL_ATTACHMENT | U::SAMPLED),
        )
        .context("depth buffer")?;
        let scene_framebuffer = GpuImage::new(
            device,
            memory,
            ImageDesc::color_2d(SCENE_FRAMEBUFFER_FORMAT, extent, U::STORAGE | U::SAMPLED),
        )
        .context("scene framebuffer")?;
        let visbuffer = GpuImage::new(
            device,
            memory,
            ImageDesc::color_2d(VISBUFFER_FORMAT, extent, U::COLOR_ATTACHMENT | U::SAMPLED),
        )
        .context("visibility buffer")?;

        debug!(width = extent.width, height = extent.height, "render targets created");
        Ok(Self {
            extent,
            depth_buffer,
            scene_framebuffer,
            visbuffer,
        })
    }

    pub unsafe fn destroy(&self, device: &ash::Device) {
        self.visbuffer.destroy(device);
        self.scene_framebuffer.destroy(device);
        self.depth_buffer.destroy(device);
    }
}

pub struct Samplers {
    pub clamp: vk::Sampler,
    pub lut: vk::Sampler,
    /// Depth-compare sampler for the shadow array.
    pub shadow: vk::Sampler,
}

impl Samplers {
    unsafe fn new(device: &ash::Device) -> Result<Self> {
        let linear_clamp = vk::SamplerCreateInfo {
            s_type: vk::StructureType::SAMPLER_CREATE_INFO,
            mag_filter: vk::Filter::LINEAR,
            min_filter: vk::Filter::LINEAR,
            mipmap_mode: vk::SamplerMipmapMode::NEAREST,
            address_mode_u: vk::SamplerAddressMode::CLAMP_TO_EDGE,
            address_mode_v: vk::SamplerAddressMode::CLAMP_TO_EDGE,
            address_mode_w: vk::SamplerAddressMode::CLAMP_TO_EDGE,
            max_lod: vk::LOD_CLAMP_NONE,
            ..Default::default()
        };
        let shadow = vk::SamplerCreateInfo {
            compare_enable: vk::TRUE,
            compare_op: vk::CompareOp::LESS_OR_EQUAL,
            border_color: vk::BorderColor::FLOAT_OPAQUE_WHITE,
            ..linear_clamp
        };
        Ok(Self {
            clamp: device.create_sampler(&linear_clamp, None)?,
            lut: device.create_sampler(&linear_clamp, None)?,
            shadow: device.create_sampler(&shadow, None)?,
        })
    }

    unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_sampler(self.shadow, None);
        device.destroy_sampler(self.lut, None);
        device.destroy_sampler(self.clamp, None);
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ResourceCapacities {
    pub instances: u32,
    pub geometry_bytes: u64,
}

pub struct FrameResources {
    pub resizing: ResizingResources,
    pub shadow_array: GpuImage,
    /// One 2D view per cascade, used as the depth attachment.
    pub shadow_layers: Vec<vk::ImageView>,
    pub display_transform_lut: GpuImage,
    pub fallback_texture: GpuImage,
    pub misc_storage: GpuBuffer,
    pub draw_calls: GpuBuffer,
    pub instances: GpuBuffer,
    pub geometry: GpuBuffer,
    pub uniforms: GpuBuffer,
    pub samplers: Samplers,
    instance_capacity: u32,
    instance_count: u32,
}

impl FrameResources {
    pub unsafe fn new(
        device: &ash::Device,
        memory: &vk::PhysicalDeviceMemoryProperties,
        extent: vk::Extent2D,
        capacities: ResourceCapacities,
    ) -> Result<Self> {
        use vk::BufferUsageFlags as B;
        use vk::ImageUsageFlags as U;

        let resizing = ResizingResources::new(device, memory, extent)?;

        let shadow_extent = vk::Extent2D {
            width: SHADOW_MAP_SIZE,
            height: SHADOW_MAP_SIZE,
        };
        let shadow_array = GpuImage::new(
            device,
            memory,
            ImageDesc::depth_2d(DEPTH_FORMAT, shadow_extent, U::DEPTH_STENCIL_ATTACHMENT | U::SAMPLED)
                .layers(SHADOW_CASCADES),
        )
        .context("shadow array")?;
        let shadow_layers = (0..SHADOW_CASCADES)
            .map(|layer| shadow_array.layer_view(device, layer))
            .collect::<Result<Vec<_>>>()?;

        let display_transform_lut = GpuImage::new(
            device,
            memory,
            ImageDesc::color_3d(LUT_FORMAT, LUT_SIZE, U::SAMPLED | U::TRANSFER_DST),
        )
        .context("display transform lut")?;
        let fallback_texture = GpuImage::new(
            device,
            memory,
            ImageDesc::color_2d(
                FALLBACK_TEXTURE_FORMAT,
                vk::Extent2D {
                    width: 1,
                    height: 1,
                },
                U::SAMPLED | U::TRANSFER_DST,
            ),
        )
        .context("fallback texture")?;

        // Counters are read as indirect draw counts and cleared with fills.
        let misc_storage = GpuBuffer::device_local(
            device,
            memory,
            MiscStorage::SIZE,
            B::STORAGE_BUFFER | B::INDIRECT_BUFFER | B::TRANSFER_DST,
        )?;
        let draw_calls = GpuBuffer::device_local(
            device,
            memory,
            DRAW_CALLS_BUFFER_SIZE,
            B::STORAGE_BUFFER | B::INDIRECT_BUFFER,
        )?;
        let instances = GpuBuffer::host_visible(
            device,
            memory,
            u64::from(capacities.instances.max(1)) * GpuInstance::STRIDE,
            B::STORAGE_BUFFER,
        )?;
        let geometry = GpuBuffer::host_visible(
            device,
            memory,
            capacities.geometry_bytes.max(4),
            B::STORAGE_BUFFER,
        )?;
        let uniforms = GpuBuffer::host_visible(
            device,
            memory,
            std::mem::size_of::<Uniforms>() as u64,
            B::UNIFORM_BUFFER,
        )?;
        uniforms.write(0, &[Uniforms::default()])?;

        Ok(Self {
            resizing,
            shadow_array,
            shadow_layers,
            display_transform_lut,
            fallback_texture,
            misc_storage,
            draw_calls,
            instances,
            geometry,
            uniforms,
            samplers: Samplers::new(device)?,
            instance_capacity: capacities.instances,
            instance_count: 0,
        })
    }

    /// Fills the fallback texture and the LUT. Both end up ready for
    /// compute sampling.
    pub unsafe fn upload_static_images(
        &self,
        device: &ash::Device,
        memory: &vk::PhysicalDeviceMemoryProperties,
        queue: vk::Queue,
        queue_family: u32,
        cmd_pool: vk::CommandPool,
    ) -> Result<()> {
        let lut = identity_lut(LUT_SIZE);
        upload_images(
            device,
            memory,
            queue,
            queue_family,
            cmd_pool,
            &[
                ImageUpload {
                    image: &self.fallback_texture,
                    data: &FALLBACK_TEXEL,
                },
                ImageUpload {
                    image: &self.display_transform_lut,
                    data: &lut,
                },
            ],
        )
        .context("uploading startup images")
    }

    /// Recreates the render targets for a new extent. The caller must make
    /// sure the device no longer uses the old ones.
    pub unsafe fn resize(
        &mut self,
        device: &ash::Device,
        memory: &vk::PhysicalDeviceMemoryProperties,
        extent: vk::Extent2D,
    ) -> Result<()> {
        let resizing = ResizingResources::new(device, memory, extent)?;
        let old = std::mem::replace(&mut self.resizing, resizing);
        old.destroy(device);
        Ok(())
    }

    pub fn instance_count(&self) -> u32 {
        self.instance_count
    }

    pub fn write_instances(&mut self, instances: &[GpuInstance]) -> Result<()> {
        if instances.len() > self.instance_capacity as usize {
            bail!(
                "{} instances exceed the capacity of {}",
                instances.len(),
                self.instance_capacity
            );
        }
        self.instances.write(0, instances)?;
        self.instance_count = instances.len() as u32;
        Ok(())
    }

    pub fn write_uniforms(&self, uniforms: &Uniforms) -> Result<()> {
        self.uniforms.write(0, std::slice::from_ref(uniforms))
    }

    pub fn image(&self, image: FrameImage, swapchain: &SwapchainTarget) -> vk::Image {
        match image {
            FrameImage::DepthBuffer => self.resizing.depth_buffer.image,
            FrameImage::ShadowArray => self.shadow_array.image,
            FrameImage::SceneFramebuffer => self.resizing.scene_framebuffer.image,
            FrameImage::VisBuffer => self.resizing.visbuffer.image,
            FrameImage::Swapchain => swapchain.image,
        }
    }

    pub fn attachment_view(&self, view: AttachmentView, swapchain: &SwapchainTarget) -> vk::ImageView {
        match view {
            AttachmentView::Image(FrameImage::DepthBuffer) => self.resizing.depth_buffer.view,
            AttachmentView::Image(FrameImage::ShadowArray) => self.shadow_array.view,
            AttachmentView::Image(FrameImage::SceneFramebuffer) => self.resizing.scene_framebuffer.view,
            AttachmentView::Image(FrameImage::VisBuffer) => self.resizing.visbuffer.view,
            AttachmentView::Image(FrameImage::Swapchain) => swapchain.view,
            AttachmentView::ShadowLayer(layer) => self.shadow_layers[layer as usize],
        }
    }

    pub fn buffer(&self, buffer: FrameBuffer) -> vk::Buffer {
        match buffer {
            FrameBuffer::Misc => self.misc_storage.buffer,
            FrameBuffer::DrawCalls => self.draw_calls.buffer,
        }
    }

    pub fn static_bindings(&self) -> StaticBindings {
        StaticBindings {
            geometry: self.geometry.buffer,
            uniforms: self.uniforms.buffer,
            misc_storage: self.misc_storage.buffer,
            draw_calls: self.draw_calls.buffer,
            instances: self.instances.buffer,
            shadow_array: self.shadow_array.view,
            clamp_sampler: self.samplers.clamp,
            lut_sampler: self.samplers.lut,
            shadow_sampler: self.samplers.shadow,
        }
    }

    pub fn resizing_views<'a>(&self, swapchain_views: &'a [vk::ImageView]) -> ResizingViews<'a> {
        ResizingViews {
            scene_framebuffer: self.resizing.scene_framebuffer.view,
            display_transform_lut: self.display_transform_lut.view,
            depth_buffer: self.resizing.depth_buffer.view,
            visbuffer: self.resizing.visbuffer.view,
            swapchain: swapchain_views,
        }
    }

    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        self.samplers.destroy(device);
        self.uniforms.destroy(device);
        self.geometry.destroy(device);
        self.instances.destroy(device);
        self.draw_calls.destroy(device);
        self.misc_storage.destroy(device);
        self.fallback_texture.destroy(device);
        self.display_transform_lut.destroy(device);
        for &view in &self.shadow_layers {
            device.destroy_image_view(view, None);
        }
        self.shadow_array.destroy(device);
        self.resizing.destroy(device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_lut_spans_full_range() {
        let lut = identity_lut(LUT_SIZE);
        assert_eq!(lut.len(), (LUT_SIZE * LUT_SIZE * LUT_SIZE * 4) as usize);
        assert_eq!(&lut[..4], &[0, 0, 0, 255]);
        assert_eq!(&lut[lut.len() - 4..], &[255, 255, 255, 255]);
    }

    #[test]
    fn identity_lut_is_red_fastest() {
        let lut = identity_lut(2);
        let texels: Vec<[u8; 4]> = lut.chunks(4).map(|t| [t[0], t[1], t[2], t[3]]).collect();
        assert_eq!(
            texels,
            [
                [0, 0, 0, 255],
                [255, 0, 0, 255],
                [0, 255, 0, 255],
                [255, 255, 0, 255],
                [0, 0, 255, 255],
                [255, 0, 255, 255],
                [0, 255, 255, 255],
                [255, 255, 255, 255],
            ]
        );
    }

    #[test]
    fn fallback_texture_is_one_white_texel() {
        assert_eq!(FALLBACK_TEXEL.len(), 4);
        assert!(FALLBACK_TEXEL.iter().all(|&c| c == 255));
    }
}
