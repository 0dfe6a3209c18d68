// SPDX-License-Identifier: CEPL-1.0
//! The resource table: one master descriptor set shared by every pass, plus
//! one small variant set per swapchain image.
//!
//! Which resource goes where is worked out as a list of [`BindingWrite`]s
//! first and only then turned into `vkUpdateDescriptorSets`, so the write
//! plan for a resize can be checked without a device.

use std::sync::Arc;

use anyhow::{Context, Result};
use ash::vk;
use strata_math::BINDLESS_CAPACITY;
use strata_render::{Access, BindlessSlot, BindlessSlotAllocator};
use tracing::debug;

use crate::sync::access_info;

/// Binding numbers of the master set, and of the per-swapchain variant set.
pub mod binding {
    pub const GEOMETRY: u32 = 0;
    pub const UNIFORMS: u32 = 1;
    pub const SCENE_FRAMEBUFFER: u32 = 2;
    pub const CLAMP_SAMPLER: u32 = 3;
    pub const DISPLAY_TRANSFORM_LUT: u32 = 4;
    pub const LUT_SAMPLER: u32 = 5;
    pub const BINDLESS_IMAGES: u32 = 6;
    pub const DEPTH_BUFFER: u32 = 7;
    pub const VISBUFFER: u32 = 8;
    pub const SHADOW_ARRAY: u32 = 9;
    pub const SCENE_FRAMEBUFFER_STORAGE: u32 = 10;
    pub const MISC_STORAGE: u32 = 11;
    pub const DRAW_CALLS: u32 = 12;
    pub const INSTANCES: u32 = 13;
    pub const SHADOW_SAMPLER: u32 = 14;

    /// Variant set: the swapchain image as a storage image.
    pub const SWAPCHAIN_STORAGE: u32 = 0;
}

pub const MASTER_SET: u32 = 0;
pub const VARIANT_SET: u32 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BindingDesc {
    pub binding: u32,
    pub ty: vk::DescriptorType,
    pub count: u32,
    pub stages: vk::ShaderStageFlags,
    /// Slots may stay unwritten while unused.
    pub partially_bound: bool,
}

const fn desc(binding: u32, ty: vk::DescriptorType, stages: vk::ShaderStageFlags) -> BindingDesc {
    BindingDesc {
        binding,
        ty,
        count: 1,
        stages,
        partially_bound: false,
    }
}

pub fn master_bindings() -> Vec<BindingDesc> {
    use vk::DescriptorType as T;
    let vertex = vk::ShaderStageFlags::VERTEX;
    let compute = vk::ShaderStageFlags::COMPUTE;
    let raster = vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT;
    let all = raster | compute;

    vec![
        desc(binding::GEOMETRY, T::STORAGE_BUFFER, vertex | compute),
        desc(binding::UNIFORMS, T::UNIFORM_BUFFER, all),
        desc(binding::SCENE_FRAMEBUFFER, T::SAMPLED_IMAGE, compute),
        desc(binding::CLAMP_SAMPLER, T::SAMPLER, all),
        desc(binding::DISPLAY_TRANSFORM_LUT, T::SAMPLED_IMAGE, compute),
        desc(binding::LUT_SAMPLER, T::SAMPLER, compute),
        BindingDesc {
            count: BINDLESS_CAPACITY,
            partially_bound: true,
            ..desc(binding::BINDLESS_IMAGES, T::SAMPLED_IMAGE, all)
        },
        desc(binding::DEPTH_BUFFER, T::SAMPLED_IMAGE, compute),
        desc(binding::VISBUFFER, T::SAMPLED_IMAGE, compute),
        desc(binding::SHADOW_ARRAY, T::SAMPLED_IMAGE, compute),
        desc(binding::SCENE_FRAMEBUFFER_STORAGE, T::STORAGE_IMAGE, compute),
        desc(binding::MISC_STORAGE, T::STORAGE_BUFFER, all),
        desc(binding::DRAW_CALLS, T::STORAGE_BUFFER, compute),
        desc(binding::INSTANCES, T::STORAGE_BUFFER, all),
        desc(binding::SHADOW_SAMPLER, T::SAMPLER, compute),
    ]
}

pub fn variant_bindings() -> Vec<BindingDesc> {
    vec![desc(
        binding::SWAPCHAIN_STORAGE,
        vk::DescriptorType::STORAGE_IMAGE,
        vk::ShaderStageFlags::COMPUTE,
    )]
}

/// Descriptor counts per type needed for `sets` copies of `bindings`.
pub fn pool_sizes(bindings: &[BindingDesc], sets: u32) -> Vec<vk::DescriptorPoolSize> {
    let mut sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
    for b in bindings {
        match sizes.iter_mut().find(|s| s.ty == b.ty) {
            Some(size) => size.descriptor_count += b.count * sets,
            None => sizes.push(vk::DescriptorPoolSize {
                ty: b.ty,
                descriptor_count: b.count * sets,
            }),
        }
    }
    sizes
}

unsafe fn create_set_layout(
    device: &ash::Device,
    bindings: &[BindingDesc],
) -> Result<vk::DescriptorSetLayout> {
    let vk_bindings: Vec<_> = bindings
        .iter()
        .map(|b| vk::DescriptorSetLayoutBinding {
            binding: b.binding,
            descriptor_type: b.ty,
            descriptor_count: b.count,
            stage_flags: b.stages,
            ..Default::default()
        })
        .collect();
    let flags: Vec<_> = bindings
        .iter()
        .map(|b| {
            if b.partially_bound {
                vk::DescriptorBindingFlags::PARTIALLY_BOUND
            } else {
                vk::DescriptorBindingFlags::empty()
            }
        })
        .collect();

    let mut flags_ci = vk::DescriptorSetLayoutBindingFlagsCreateInfo::default().binding_flags(&flags);
    let ci = vk::DescriptorSetLayoutCreateInfo::default()
        .bindings(&vk_bindings)
        .push_next(&mut flags_ci);
    device
        .create_descriptor_set_layout(&ci, None)
        .context("create_descriptor_set_layout")
}

pub struct TableLayouts {
    pub master: vk::DescriptorSetLayout,
    pub variant: vk::DescriptorSetLayout,
}

impl TableLayouts {
    pub unsafe fn new(device: &ash::Device) -> Result<Self> {
        Ok(Self {
            master: create_set_layout(device, &master_bindings())?,
            variant: create_set_layout(device, &variant_bindings())?,
        })
    }

    /// In set-index order, for the pipeline layout.
    pub fn as_array(&self) -> [vk::DescriptorSetLayout; 2] {
        [self.master, self.variant]
    }

    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_descriptor_set_layout(self.variant, None);
        device.destroy_descriptor_set_layout(self.master, None);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TableSet {
    Master,
    Swapchain(usize),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BoundResource {
    StorageBuffer(vk::Buffer),
    UniformBuffer(vk::Buffer),
    /// Read by shaders in the sampled-read layout.
    SampledImage(vk::ImageView),
    /// Written by compute in the general layout.
    StorageImage(vk::ImageView),
    Sampler(vk::Sampler),
}

impl BoundResource {
    pub fn descriptor_type(&self) -> vk::DescriptorType {
        match self {
            BoundResource::StorageBuffer(_) => vk::DescriptorType::STORAGE_BUFFER,
            BoundResource::UniformBuffer(_) => vk::DescriptorType::UNIFORM_BUFFER,
            BoundResource::SampledImage(_) => vk::DescriptorType::SAMPLED_IMAGE,
            BoundResource::StorageImage(_) => vk::DescriptorType::STORAGE_IMAGE,
            BoundResource::Sampler(_) => vk::DescriptorType::SAMPLER,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BindingWrite {
    pub set: TableSet,
    pub binding: u32,
    pub array_element: u32,
    pub resource: BoundResource,
}

impl BindingWrite {
    fn master(binding: u32, resource: BoundResource) -> Self {
        Self {
            set: TableSet::Master,
            binding,
            array_element: 0,
            resource,
        }
    }
}

/// Every view that is recreated when the swapchain extent changes.
#[derive(Clone, Copy, Debug)]
pub struct ResizingViews<'a> {
    pub scene_framebuffer: vk::ImageView,
    pub display_transform_lut: vk::ImageView,
    pub depth_buffer: vk::ImageView,
    pub visbuffer: vk::ImageView,
    /// One per swapchain image, in swapchain order.
    pub swapchain: &'a [vk::ImageView],
}

/// Resources whose handles survive a resize.
#[derive(Clone, Copy, Debug)]
pub struct StaticBindings {
    pub geometry: vk::Buffer,
    pub uniforms: vk::Buffer,
    pub misc_storage: vk::Buffer,
    pub draw_calls: vk::Buffer,
    pub instances: vk::Buffer,
    pub shadow_array: vk::ImageView,
    pub clamp_sampler: vk::Sampler,
    pub lut_sampler: vk::Sampler,
    pub shadow_sampler: vk::Sampler,
}

pub fn resizing_writes(views: &ResizingViews<'_>) -> Vec<BindingWrite> {
    use BoundResource::*;
    let mut writes = vec![
        BindingWrite::master(binding::SCENE_FRAMEBUFFER, SampledImage(views.scene_framebuffer)),
        BindingWrite::master(binding::DISPLAY_TRANSFORM_LUT, SampledImage(views.display_transform_lut)),
        BindingWrite::master(binding::DEPTH_BUFFER, SampledImage(views.depth_buffer)),
        BindingWrite::master(binding::VISBUFFER, SampledImage(views.visbuffer)),
        BindingWrite::master(
            binding::SCENE_FRAMEBUFFER_STORAGE,
            StorageImage(views.scene_framebuffer),
        ),
    ];
    writes.extend(views.swapchain.iter().enumerate().map(|(i, &view)| BindingWrite {
        set: TableSet::Swapchain(i),
        binding: binding::SWAPCHAIN_STORAGE,
        array_element: 0,
        resource: StorageImage(view),
    }));
    writes
}

pub fn static_writes(bindings: &StaticBindings) -> Vec<BindingWrite> {
    use BoundResource::*;
    vec![
        BindingWrite::master(binding::GEOMETRY, StorageBuffer(bindings.geometry)),
        BindingWrite::master(binding::UNIFORMS, UniformBuffer(bindings.uniforms)),
        BindingWrite::master(binding::CLAMP_SAMPLER, Sampler(bindings.clamp_sampler)),
        BindingWrite::master(binding::LUT_SAMPLER, Sampler(bindings.lut_sampler)),
        BindingWrite::master(binding::SHADOW_ARRAY, SampledImage(bindings.shadow_array)),
        BindingWrite::master(binding::MISC_STORAGE, StorageBuffer(bindings.misc_storage)),
        BindingWrite::master(binding::DRAW_CALLS, StorageBuffer(bindings.draw_calls)),
        BindingWrite::master(binding::INSTANCES, StorageBuffer(bindings.instances)),
        BindingWrite::master(binding::SHADOW_SAMPLER, Sampler(bindings.shadow_sampler)),
    ]
}

/// # Panics
/// If `index` is outside the bindless array.
pub fn bindless_write(index: u32, view: vk::ImageView) -> BindingWrite {
    assert!(
        index < BINDLESS_CAPACITY,
        "bindless index {index} exceeds capacity {BINDLESS_CAPACITY}"
    );
    BindingWrite {
        set: TableSet::Master,
        binding: binding::BINDLESS_IMAGES,
        array_element: index,
        resource: BoundResource::SampledImage(view),
    }
}

unsafe fn create_pool(
    device: &ash::Device,
    bindings: &[BindingDesc],
    sets: u32,
) -> Result<vk::DescriptorPool> {
    let sizes = pool_sizes(bindings, sets);
    let ci = vk::DescriptorPoolCreateInfo::default()
        .max_sets(sets)
        .pool_sizes(&sizes);
    device
        .create_descriptor_pool(&ci, None)
        .context("create_descriptor_pool")
}

unsafe fn allocate_sets(
    device: &ash::Device,
    pool: vk::DescriptorPool,
    layout: vk::DescriptorSetLayout,
    count: usize,
) -> Result<Vec<vk::DescriptorSet>> {
    if count == 0 {
        return Ok(Vec::new());
    }
    let layouts = vec![layout; count];
    let ai = vk::DescriptorSetAllocateInfo::default()
        .descriptor_pool(pool)
        .set_layouts(&layouts);
    device
        .allocate_descriptor_sets(&ai)
        .context("allocate_descriptor_sets")
}

pub struct DescriptorSetManager {
    master_pool: vk::DescriptorPool,
    master: vk::DescriptorSet,
    variant_pool: vk::DescriptorPool,
    variants: Vec<vk::DescriptorSet>,
    allocator: Arc<BindlessSlotAllocator>,
}

impl DescriptorSetManager {
    pub unsafe fn new(
        device: &ash::Device,
        layouts: &TableLayouts,
        swapchain_images: usize,
    ) -> Result<Self> {
        let master_pool = create_pool(device, &master_bindings(), 1)?;
        let master = allocate_sets(device, master_pool, layouts.master, 1)?[0];
        let variant_pool = create_pool(device, &variant_bindings(), swapchain_images.max(1) as u32)?;
        let variants = allocate_sets(device, variant_pool, layouts.variant, swapchain_images)?;

        Ok(Self {
            master_pool,
            master,
            variant_pool,
            variants,
            allocator: BindlessSlotAllocator::new(),
        })
    }

    pub fn allocator(&self) -> &Arc<BindlessSlotAllocator> {
        &self.allocator
    }

    pub fn master(&self) -> vk::DescriptorSet {
        self.master
    }

    pub fn swapchain_set(&self, index: usize) -> vk::DescriptorSet {
        self.variants[index]
    }

    pub fn swapchain_set_count(&self) -> usize {
        self.variants.len()
    }

    /// Reallocates the variant sets when the swapchain image count changed.
    /// Their contents are undefined until the next resizing write.
    pub unsafe fn match_swapchain(
        &mut self,
        device: &ash::Device,
        layouts: &TableLayouts,
        swapchain_images: usize,
    ) -> Result<()> {
        if self.variants.len() == swapchain_images {
            return Ok(());
        }
        debug!(
            from = self.variants.len(),
            to = swapchain_images,
            "reallocating swapchain descriptor sets"
        );
        device.destroy_descriptor_pool(self.variant_pool, None);
        self.variants.clear();
        self.variant_pool = create_pool(device, &variant_bindings(), swapchain_images.max(1) as u32)?;
        self.variants = allocate_sets(device, self.variant_pool, layouts.variant, swapchain_images)?;
        Ok(())
    }

    /// Registers `view` in the bindless array. The returned lease keeps the
    /// slot; drop it (after the last use by the device) to free the index.
    ///
    /// # Panics
    /// If the bindless array is full.
    pub unsafe fn write_image(&self, device: &ash::Device, view: vk::ImageView) -> BindlessSlot {
        let slot = self.allocator.lease();
        self.apply(device, &[bindless_write(slot.index(), view)]);
        debug!(index = slot.index(), "bindless image written");
        slot
    }

    /// Rewrites only what a resize invalidated.
    pub unsafe fn write_resizing_descriptors(&self, device: &ash::Device, views: &ResizingViews<'_>) {
        let writes = resizing_writes(views);
        debug!(writes = writes.len(), "writing resizing descriptors");
        self.apply(device, &writes);
    }

    /// Writes every descriptor the frame reads, except bindless slots.
    pub unsafe fn write_descriptors(
        &self,
        device: &ash::Device,
        bindings: &StaticBindings,
        views: &ResizingViews<'_>,
    ) {
        let writes = static_writes(bindings);
        debug!(writes = writes.len(), "writing static descriptors");
        self.apply(device, &writes);
        self.write_resizing_descriptors(device, views);
    }

    fn set(&self, set: TableSet) -> vk::DescriptorSet {
        match set {
            TableSet::Master => self.master,
            TableSet::Swapchain(index) => self.variants[index],
        }
    }

    unsafe fn apply(&self, device: &ash::Device, writes: &[BindingWrite]) {
        enum Info {
            Image(usize),
            Buffer(usize),
        }

        let sampled_layout = access_info(Access::ComputeShaderReadSampledImage).layout;
        let mut image_infos = Vec::new();
        let mut buffer_infos = Vec::new();
        let slots: Vec<Info> = writes
            .iter()
            .map(|write| match write.resource {
                BoundResource::StorageBuffer(buffer) | BoundResource::UniformBuffer(buffer) => {
                    buffer_infos.push(vk::DescriptorBufferInfo {
                        buffer,
                        offset: 0,
                        range: vk::WHOLE_SIZE,
                    });
                    Info::Buffer(buffer_infos.len() - 1)
                }
                BoundResource::SampledImage(image_view) => {
                    image_infos.push(vk::DescriptorImageInfo {
                        image_view,
                        image_layout: sampled_layout,
                        ..Default::default()
                    });
                    Info::Image(image_infos.len() - 1)
                }
                BoundResource::StorageImage(image_view) => {
                    image_infos.push(vk::DescriptorImageInfo {
                        image_view,
                        image_layout: vk::ImageLayout::GENERAL,
                        ..Default::default()
                    });
                    Info::Image(image_infos.len() - 1)
                }
                BoundResource::Sampler(sampler) => {
                    image_infos.push(vk::DescriptorImageInfo {
                        sampler,
                        ..Default::default()
                    });
                    Info::Image(image_infos.len() - 1)
                }
            })
            .collect();

        let vk_writes: Vec<_> = writes
            .iter()
            .zip(&slots)
            .map(|(write, slot)| {
                let base = vk::WriteDescriptorSet::default()
                    .dst_set(self.set(write.set))
                    .dst_binding(write.binding)
                    .dst_array_element(write.array_element)
                    .descriptor_type(write.resource.descriptor_type());
                match *slot {
                    Info::Image(i) => base.image_info(std::slice::from_ref(&image_infos[i])),
                    Info::Buffer(i) => base.buffer_info(std::slice::from_ref(&buffer_infos[i])),
                }
            })
            .collect();

        device.update_descriptor_sets(&vk_writes, &[]);
    }

    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        device.destroy_descriptor_pool(self.variant_pool, None);
        device.destroy_descriptor_pool(self.master_pool, None);
        self.variants.clear();
    }
}
