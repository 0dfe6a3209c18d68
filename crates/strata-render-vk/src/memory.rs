// SPDX-License-Identifier: CEPL-1.0
//! Dedicated-allocation buffers and images, plus the one-shot staging upload
//! used at startup.

use anyhow::{bail, Context, Result};
use ash::vk;
use bytemuck::Pod;
use strata_render::{Access, RenderError};

use crate::sync::{insert_image_barriers, ImageBarrier};

pub fn find_memory_type(
    memory: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    req: vk::MemoryPropertyFlags,
) -> Result<u32, RenderError> {
    (0..memory.memory_type_count)
        .find(|&i| {
            (type_bits & (1 << i)) != 0
                && memory.memory_types[i as usize].property_flags.contains(req)
        })
        .ok_or(RenderError::NoMemoryType)
}

const HOST_VISIBLE: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::from_raw(
    vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw() | vk::MemoryPropertyFlags::HOST_COHERENT.as_raw(),
);

pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    pub size: vk::DeviceSize,
    /// Persistent mapping, null for device-local buffers.
    mapped: *mut u8,
}

impl GpuBuffer {
    pub unsafe fn device_local(
        device: &ash::Device,
        memory: &vk::PhysicalDeviceMemoryProperties,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> Result<Self> {
        Self::new(device, memory, size, usage, vk::MemoryPropertyFlags::DEVICE_LOCAL, false)
    }

    /// Host-coherent and mapped for the buffer's whole lifetime.
    pub unsafe fn host_visible(
        device: &ash::Device,
        memory: &vk::PhysicalDeviceMemoryProperties,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> Result<Self> {
        Self::new(device, memory, size, usage, HOST_VISIBLE, true)
    }

    unsafe fn new(
        device: &ash::Device,
        memory: &vk::PhysicalDeviceMemoryProperties,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        props: vk::MemoryPropertyFlags,
        map: bool,
    ) -> Result<Self> {
        let bci = vk::BufferCreateInfo {
            s_type: vk::StructureType::BUFFER_CREATE_INFO,
            size,
            usage,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            ..Default::default()
        };
        let buffer = device.create_buffer(&bci, None).context("create_buffer")?;
        let req = device.get_buffer_memory_requirements(buffer);
        let mai = vk::MemoryAllocateInfo {
            s_type: vk::StructureType::MEMORY_ALLOCATE_INFO,
            allocation_size: req.size,
            memory_type_index: find_memory_type(memory, req.memory_type_bits, props)?,
            ..Default::default()
        };
        let mem = device.allocate_memory(&mai, None).context("allocate_memory(buffer)")?;
        device.bind_buffer_memory(buffer, mem, 0)?;

        let mapped = if map {
            device.map_memory(mem, 0, size, vk::MemoryMapFlags::empty())? as *mut u8
        } else {
            std::ptr::null_mut()
        };

        Ok(Self {
            buffer,
            memory: mem,
            size,
            mapped,
        })
    }

    /// Copies `data` into the mapping at `offset` bytes.
    pub fn write<T: Pod>(&self, offset: vk::DeviceSize, data: &[T]) -> Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        if self.mapped.is_null() {
            bail!("buffer is not host visible");
        }
        let end = offset + bytes.len() as vk::DeviceSize;
        if end > self.size {
            bail!("write of {} bytes at {offset} overflows buffer of {} bytes", bytes.len(), self.size);
        }
        // Bounds checked above; the mapping stays valid until destroy().
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.mapped.add(offset as usize), bytes.len());
        }
        Ok(())
    }

    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        if !self.mapped.is_null() {
            device.unmap_memory(self.memory);
            self.mapped = std::ptr::null_mut();
        }
        device.destroy_buffer(self.buffer, None);
        device.free_memory(self.memory, None);
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ImageDesc {
    pub format: vk::Format,
    pub extent: vk::Extent3D,
    pub image_type: vk::ImageType,
    pub view_type: vk::ImageViewType,
    pub layers: u32,
    pub usage: vk::ImageUsageFlags,
    pub aspect: vk::ImageAspectFlags,
}

impl ImageDesc {
    pub fn color_2d(format: vk::Format, extent: vk::Extent2D, usage: vk::ImageUsageFlags) -> Self {
        Self {
            format,
            extent: vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            },
            image_type: vk::ImageType::TYPE_2D,
            view_type: vk::ImageViewType::TYPE_2D,
            layers: 1,
            usage,
            aspect: vk::ImageAspectFlags::COLOR,
        }
    }

    pub fn depth_2d(format: vk::Format, extent: vk::Extent2D, usage: vk::ImageUsageFlags) -> Self {
        Self {
            aspect: vk::ImageAspectFlags::DEPTH,
            ..Self::color_2d(format, extent, usage)
        }
    }

    pub fn layers(mut self, layers: u32) -> Self {
        self.layers = layers;
        self.view_type = vk::ImageViewType::TYPE_2D_ARRAY;
        self
    }

    pub fn color_3d(format: vk::Format, edge: u32, usage: vk::ImageUsageFlags) -> Self {
        Self {
            format,
            extent: vk::Extent3D {
                width: edge,
                height: edge,
                depth: edge,
            },
            image_type: vk::ImageType::TYPE_3D,
            view_type: vk::ImageViewType::TYPE_3D,
            layers: 1,
            usage,
            aspect: vk::ImageAspectFlags::COLOR,
        }
    }

    pub fn full_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: self.aspect,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: self.layers,
        }
    }
}

pub struct GpuImage {
    pub image: vk::Image,
    memory: vk::DeviceMemory,
    /// Covers every layer.
    pub view: vk::ImageView,
    pub desc: ImageDesc,
}

impl GpuImage {
    pub unsafe fn new(
        device: &ash::Device,
        memory: &vk::PhysicalDeviceMemoryProperties,
        desc: ImageDesc,
    ) -> Result<Self> {
        let img_ci = vk::ImageCreateInfo {
            s_type: vk::StructureType::IMAGE_CREATE_INFO,
            image_type: desc.image_type,
            format: desc.format,
            extent: desc.extent,
            mip_levels: 1,
            array_layers: desc.layers,
            samples: vk::SampleCountFlags::TYPE_1,
            tiling: vk::ImageTiling::OPTIMAL,
            usage: desc.usage,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            ..Default::default()
        };
        let image = device.create_image(&img_ci, None).context("create_image")?;

        let req = device.get_image_memory_requirements(image);
        let alloc = vk::MemoryAllocateInfo {
            s_type: vk::StructureType::MEMORY_ALLOCATE_INFO,
            allocation_size: req.size,
            memory_type_index: find_memory_type(
                memory,
                req.memory_type_bits,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
            )?,
            ..Default::default()
        };
        let mem = device.allocate_memory(&alloc, None).context("allocate_memory(image)")?;
        device.bind_image_memory(image, mem, 0)?;

        let view = create_view(device, image, &desc, desc.view_type, desc.full_range())?;
        Ok(Self {
            image,
            memory: mem,
            view,
            desc,
        })
    }

    /// A 2D view of a single array layer.
    pub unsafe fn layer_view(&self, device: &ash::Device, layer: u32) -> Result<vk::ImageView> {
        let range = vk::ImageSubresourceRange {
            base_array_layer: layer,
            layer_count: 1,
            ..self.desc.full_range()
        };
        create_view(device, self.image, &self.desc, vk::ImageViewType::TYPE_2D, range)
    }

    pub fn extent_2d(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.desc.extent.width,
            height: self.desc.extent.height,
        }
    }

    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_image_view(self.view, None);
        device.destroy_image(self.image, None);
        device.free_memory(self.memory, None);
    }
}

unsafe fn create_view(
    device: &ash::Device,
    image: vk::Image,
    desc: &ImageDesc,
    view_type: vk::ImageViewType,
    subresource_range: vk::ImageSubresourceRange,
) -> Result<vk::ImageView> {
    let view_ci = vk::ImageViewCreateInfo {
        s_type: vk::StructureType::IMAGE_VIEW_CREATE_INFO,
        image,
        view_type,
        format: desc.format,
        subresource_range,
        ..Default::default()
    };
    device.create_image_view(&view_ci, None).context("create_image_view")
}

/// Texel data for one image, tightly packed.
pub struct ImageUpload<'a> {
    pub image: &'a GpuImage,
    pub data: &'a [u8],
}

/// Copy offsets inside the staging buffer keep texel blocks aligned.
const STAGING_ALIGN: vk::DeviceSize = 16;

/// Offset of each upload in the staging buffer, and the buffer's size.
fn staging_layout(lengths: impl IntoIterator<Item = usize>) -> (Vec<vk::DeviceSize>, vk::DeviceSize) {
    let mut offsets = Vec::new();
    let mut cursor: vk::DeviceSize = 0;
    for len in lengths {
        let offset = cursor.next_multiple_of(STAGING_ALIGN);
        offsets.push(offset);
        cursor = offset + len as vk::DeviceSize;
    }
    (offsets, cursor)
}

/// Copies every upload through one staging buffer and leaves each image
/// ready for compute-shader sampling. Blocks until the queue is idle.
///
/// The staging buffer and command buffer are released on every path.
pub unsafe fn upload_images(
    device: &ash::Device,
    memory: &vk::PhysicalDeviceMemoryProperties,
    queue: vk::Queue,
    queue_family: u32,
    cmd_pool: vk::CommandPool,
    uploads: &[ImageUpload<'_>],
) -> Result<()> {
    let (offsets, total) = staging_layout(uploads.iter().map(|u| u.data.len()));
    if total == 0 {
        return Ok(());
    }

    let mut staging =
        GpuBuffer::host_visible(device, memory, total, vk::BufferUsageFlags::TRANSFER_SRC)?;
    let result = submit_uploads(device, queue, queue_family, cmd_pool, &staging, uploads, &offsets);
    staging.destroy(device);
    result?;

    tracing::debug!(images = uploads.len(), bytes = total, "startup upload complete");
    Ok(())
}

unsafe fn submit_uploads(
    device: &ash::Device,
    queue: vk::Queue,
    queue_family: u32,
    cmd_pool: vk::CommandPool,
    staging: &GpuBuffer,
    uploads: &[ImageUpload<'_>],
    offsets: &[vk::DeviceSize],
) -> Result<()> {
    for (upload, &offset) in uploads.iter().zip(offsets) {
        staging.write(offset, upload.data)?;
    }

    let ai = vk::CommandBufferAllocateInfo {
        s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
        command_pool: cmd_pool,
        level: vk::CommandBufferLevel::PRIMARY,
        command_buffer_count: 1,
        ..Default::default()
    };
    let cmd = device
        .allocate_command_buffers(&ai)
        .context("allocate upload command buffer")?[0];
    let result = record_uploads(device, cmd, queue_family, staging, uploads, offsets).and_then(|()| {
        let si = vk::SubmitInfo {
            s_type: vk::StructureType::SUBMIT_INFO,
            command_buffer_count: 1,
            p_command_buffers: &cmd,
            ..Default::default()
        };
        device
            .queue_submit(queue, std::slice::from_ref(&si), vk::Fence::null())
            .context("queue_submit(upload)")?;
        device.queue_wait_idle(queue).context("queue_wait_idle(upload)")
    });
    device.free_command_buffers(cmd_pool, std::slice::from_ref(&cmd));
    result
}

unsafe fn record_uploads(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    queue_family: u32,
    staging: &GpuBuffer,
    uploads: &[ImageUpload<'_>],
    offsets: &[vk::DeviceSize],
) -> Result<()> {
    let bi = vk::CommandBufferBeginInfo {
        s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
        flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
        ..Default::default()
    };
    device.begin_command_buffer(cmd, &bi)?;

    let barriers = |prev: Access, next: Access, discard: bool| -> Vec<ImageBarrier> {
        uploads
            .iter()
            .map(|u| {
                let barrier =
                    ImageBarrier::new(u.image.image, u.image.desc.full_range(), prev, next, queue_family);
                if discard {
                    barrier.discard()
                } else {
                    barrier
                }
            })
            .collect()
    };

    insert_image_barriers(device, cmd, &barriers(Access::None, Access::TransferWrite, true));
    for (upload, &offset) in uploads.iter().zip(offsets) {
        let desc = &upload.image.desc;
        let region = vk::BufferImageCopy {
            buffer_offset: offset,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: desc.aspect,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: desc.layers,
            },
            image_offset: vk::Offset3D::default(),
            image_extent: desc.extent,
        };
        device.cmd_copy_buffer_to_image(
            cmd,
            staging.buffer,
            upload.image.image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            std::slice::from_ref(&region),
        );
    }
    insert_image_barriers(
        device,
        cmd,
        &barriers(Access::TransferWrite, Access::ComputeShaderReadSampledImage, false),
    );
    device.end_command_buffer(cmd)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_with(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut memory = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            ..Default::default()
        };
        for (slot, &flags) in memory.memory_types.iter_mut().zip(types) {
            slot.property_flags = flags;
        }
        memory
    }

    #[test]
    fn picks_first_type_with_required_flags() {
        let memory = memory_with(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            HOST_VISIBLE,
        ]);
        assert_eq!(find_memory_type(&memory, 0b111, HOST_VISIBLE).unwrap(), 2);
        assert_eq!(
            find_memory_type(&memory, 0b111, vk::MemoryPropertyFlags::DEVICE_LOCAL).unwrap(),
            0
        );
    }

    #[test]
    fn respects_type_bits() {
        let memory = memory_with(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ]);
        assert_eq!(
            find_memory_type(&memory, 0b10, vk::MemoryPropertyFlags::DEVICE_LOCAL).unwrap(),
            1
        );
    }

    #[test]
    fn missing_type_is_an_error() {
        let memory = memory_with(&[vk::MemoryPropertyFlags::DEVICE_LOCAL]);
        assert!(matches!(
            find_memory_type(&memory, 0b1, HOST_VISIBLE),
            Err(RenderError::NoMemoryType)
        ));
    }

    #[test]
    fn staging_offsets_are_aligned_and_packed() {
        let (offsets, total) = staging_layout([4 * 4, 6, 32 * 32 * 32 * 4]);
        assert_eq!(offsets, [0, 16, 32]);
        assert_eq!(total, 32 + 32 * 32 * 32 * 4);
        assert!(offsets.iter().all(|o| o % STAGING_ALIGN == 0));
    }

    #[test]
    fn nothing_to_upload_needs_no_staging() {
        let (offsets, total) = staging_layout(std::iter::empty());
        assert!(offsets.is_empty());
        assert_eq!(total, 0);
    }

    #[test]
    fn shadow_array_layers_get_an_array_view() {
        let desc = ImageDesc::depth_2d(
            vk::Format::D32_SFLOAT,
            vk::Extent2D {
                width: 1024,
                height: 1024,
            },
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
        )
        .layers(4);
        assert_eq!(desc.view_type, vk::ImageViewType::TYPE_2D_ARRAY);
        assert_eq!(desc.full_range().layer_count, 4);
        assert_eq!(desc.full_range().aspect_mask, vk::ImageAspectFlags::DEPTH);
    }
}
