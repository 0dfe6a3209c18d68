// SPDX-License-Identifier: CEPL-1.0
use std::ffi::CStr;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
#[cfg(debug_assertions)]
use ash::ext::debug_utils as ext_debug;
use ash::khr::{surface, swapchain as khr_swapchain};
use ash::{vk, Entry, Instance};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle};
use strata_math::glam::Mat4;
use strata_math::{GpuInstance, Uniforms};
use strata_render::{BindlessSlot, RenderError, RenderSize, Renderer};
use tracing::{debug, error, info};

pub mod descriptors;
pub mod frame;
pub mod memory;
pub mod pipelines;
pub mod resources;
pub mod swapchain;
pub mod sync;

pub use frame::{NoUi, UiLayer};
pub use swapchain::VkVsyncMode;

use descriptors::{DescriptorSetManager, TableLayouts};
use frame::{FrameRenderer, SwapchainTarget};
use pipelines::PipelineSet;
use resources::{FrameResources, ResourceCapacities};
use swapchain::{create_swapchain_bundle, SwapchainBundle, SwapchainConfig};

#[cfg(debug_assertions)]
type DebugState = (ext_debug::Instance, vk::DebugUtilsMessengerEXT);
#[cfg(not(debug_assertions))]
type DebugState = ();

/// Backend settings, usually filled from the app's config file.
#[derive(Clone, Debug)]
pub struct VkRendererConfig {
    /// Directory holding the compiled `.spv` files.
    pub shader_dir: PathBuf,
    pub instance_capacity: u32,
    pub geometry_bytes: u64,
    pub vsync: bool,
    pub vsync_mode: VkVsyncMode,
}

impl Default for VkRendererConfig {
    fn default() -> Self {
        Self {
            shader_dir: PathBuf::from("compiled_shaders"),
            instance_capacity: 4096,
            geometry_bytes: 64 << 20,
            vsync: true,
            vsync_mode: VkVsyncMode::Fifo,
        }
    }
}

pub struct VkRenderer {
    instance: Instance,
    surface_loader: surface::Instance,
    surface: vk::SurfaceKHR,
    debug_messenger: DebugState,

    phys: vk::PhysicalDevice,
    memory_props: vk::PhysicalDeviceMemoryProperties,
    device: ash::Device,
    queue: vk::Queue,
    queue_family: u32,

    swapchain_loader: khr_swapchain::Device,
    sc: SwapchainBundle,

    cmd_pool: vk::CommandPool,
    cmd: vk::CommandBuffer,
    image_available: vk::Semaphore,
    /// One per swapchain image; presentation may still hold the previous one.
    render_finished: Vec<vk::Semaphore>,
    in_flight: vk::Fence,

    layouts: TableLayouts,
    pipelines: PipelineSet,
    table: DescriptorSetManager,
    resources: FrameResources,
    fallback_slot: Option<BindlessSlot>,
    ui: Box<dyn UiLayer>,

    cfg: VkRendererConfig,
    uniforms: Uniforms,
    paused: bool,

    // Keeps the loader alive for the instance's lifetime.
    _entry: Entry,
}

#[cfg(debug_assertions)]
unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user: *mut std::os::raw::c_void,
) -> vk::Bool32 {
    if !data.is_null() && !(*data).p_message.is_null() {
        let msg = CStr::from_ptr((*data).p_message).to_string_lossy();
        if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
            error!(target: "vulkan", "{msg}");
        } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
            tracing::warn!(target: "vulkan", "{msg}");
        } else {
            debug!(target: "vulkan", "{msg}");
        }
    }
    vk::FALSE
}

#[cfg(debug_assertions)]
unsafe fn create_debug_messenger(entry: &Entry, instance: &Instance) -> Result<DebugState> {
    let loader = ext_debug::Instance::new(entry, instance);
    let ci = vk::DebugUtilsMessengerCreateInfoEXT {
        s_type: vk::StructureType::DEBUG_UTILS_MESSENGER_CREATE_INFO_EXT,
        message_severity: vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
            | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        message_type: vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
            | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
            | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        pfn_user_callback: Some(debug_callback),
        ..Default::default()
    };
    let messenger = loader
        .create_debug_utils_messenger(&ci, None)
        .context("create_debug_utils_messenger")?;
    Ok((loader, messenger))
}

#[cfg(not(debug_assertions))]
unsafe fn create_debug_messenger(_entry: &Entry, _instance: &Instance) -> Result<DebugState> {
    Ok(())
}

#[cfg(debug_assertions)]
unsafe fn destroy_debug_messenger(dbg: &DebugState) {
    dbg.0.destroy_debug_utils_messenger(dbg.1, None);
}

#[cfg(not(debug_assertions))]
unsafe fn destroy_debug_messenger(_dbg: &DebugState) {}

unsafe fn create_instance(entry: &Entry, display_raw: RawDisplayHandle) -> Result<Instance> {
    let name = c"strata";
    let app_info = vk::ApplicationInfo {
        s_type: vk::StructureType::APPLICATION_INFO,
        p_application_name: name.as_ptr(),
        application_version: 0,
        p_engine_name: name.as_ptr(),
        engine_version: 0,
        api_version: vk::API_VERSION_1_3,
        ..Default::default()
    };

    let mut extensions = ash_window::enumerate_required_extensions(display_raw)
        .context("enumerate_required_extensions")?
        .to_vec();
    #[cfg(debug_assertions)]
    extensions.push(ext_debug::NAME.as_ptr());

    #[cfg(debug_assertions)]
    let layers = [c"VK_LAYER_KHRONOS_validation".as_ptr()];
    #[cfg(not(debug_assertions))]
    let layers: [*const std::ffi::c_char; 0] = [];

    let create_info = vk::InstanceCreateInfo {
        s_type: vk::StructureType::INSTANCE_CREATE_INFO,
        p_application_info: &app_info,
        enabled_extension_count: extensions.len() as u32,
        pp_enabled_extension_names: extensions.as_ptr(),
        enabled_layer_count: layers.len() as u32,
        pp_enabled_layer_names: layers.as_ptr(),
        ..Default::default()
    };

    entry
        .create_instance(&create_info, None)
        .context("create_instance")
}

/// Names of the device features the frame needs but `phys` lacks.
pub fn missing_features(
    core: &vk::PhysicalDeviceFeatures,
    f12: &vk::PhysicalDeviceVulkan12Features<'_>,
    f13: &vk::PhysicalDeviceVulkan13Features<'_>,
) -> Vec<&'static str> {
    [
        ("multi_draw_indirect", core.multi_draw_indirect),
        ("draw_indirect_count", f12.draw_indirect_count),
        ("descriptor_indexing", f12.descriptor_indexing),
        ("descriptor_binding_partially_bound", f12.descriptor_binding_partially_bound),
        ("runtime_descriptor_array", f12.runtime_descriptor_array),
        (
            "shader_sampled_image_array_non_uniform_indexing",
            f12.shader_sampled_image_array_non_uniform_indexing,
        ),
        ("dynamic_rendering", f13.dynamic_rendering),
        ("synchronization2", f13.synchronization2),
    ]
    .into_iter()
    .filter(|(_, supported)| *supported != vk::TRUE)
    .map(|(name, _)| name)
    .collect()
}

unsafe fn device_missing_features(instance: &Instance, phys: vk::PhysicalDevice) -> Vec<&'static str> {
    let mut f12 = vk::PhysicalDeviceVulkan12Features::default();
    let mut f13 = vk::PhysicalDeviceVulkan13Features::default();
    let mut f2 = vk::PhysicalDeviceFeatures2::default()
        .push_next(&mut f12)
        .push_next(&mut f13);
    instance.get_physical_device_features2(phys, &mut f2);
    let core = f2.features;
    missing_features(&core, &f12, &f13)
}

unsafe fn pick_device_and_queue(
    instance: &Instance,
    surf_i: &surface::Instance,
    surface: vk::SurfaceKHR,
) -> Result<(vk::PhysicalDevice, u32)> {
    for phys in instance
        .enumerate_physical_devices()
        .context("enumerate_physical_devices")?
    {
        let props = instance.get_physical_device_properties(phys);
        let name = CStr::from_ptr(props.device_name.as_ptr()).to_string_lossy();
        if props.api_version < vk::API_VERSION_1_3 {
            debug!(device = %name, "skipped: Vulkan 1.3 not supported");
            continue;
        }
        let missing = device_missing_features(instance, phys);
        if !missing.is_empty() {
            debug!(device = %name, ?missing, "skipped: missing features");
            continue;
        }

        let qprops = instance.get_physical_device_queue_family_properties(phys);
        for (i, q) in qprops.iter().enumerate() {
            if q.queue_flags
                .contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
                && surf_i
                    .get_physical_device_surface_support(phys, i as u32, surface)
                    .unwrap_or(false)
            {
                info!(device = %name, queue_family = i, "vk: device selected");
                return Ok((phys, i as u32));
            }
        }
    }
    Err(RenderError::NoSuitableDevice.into())
}

unsafe fn create_device(
    instance: &Instance,
    phys: vk::PhysicalDevice,
    queue_family: u32,
) -> Result<(ash::Device, vk::Queue)> {
    let priorities = [1.0_f32];
    let qinfo = vk::DeviceQueueCreateInfo {
        s_type: vk::StructureType::DEVICE_QUEUE_CREATE_INFO,
        queue_family_index: queue_family,
        queue_count: 1,
        p_queue_priorities: priorities.as_ptr(),
        ..Default::default()
    };

    let core = vk::PhysicalDeviceFeatures {
        multi_draw_indirect: vk::TRUE,
        ..Default::default()
    };
    let mut feats12 = vk::PhysicalDeviceVulkan12Features::default()
        .draw_indirect_count(true)
        .descriptor_indexing(true)
        .descriptor_binding_partially_bound(true)
        .runtime_descriptor_array(true)
        .shader_sampled_image_array_non_uniform_indexing(true);
    let mut feats13 = vk::PhysicalDeviceVulkan13Features::default()
        .dynamic_rendering(true)
        .synchronization2(true);

    let device_exts = [khr_swapchain::NAME.as_ptr()];
    let dinfo = vk::DeviceCreateInfo::default()
        .queue_create_infos(std::slice::from_ref(&qinfo))
        .enabled_extension_names(&device_exts)
        .enabled_features(&core)
        .push_next(&mut feats12)
        .push_next(&mut feats13);

    let device = instance
        .create_device(phys, &dinfo, None)
        .context("create_device")?;
    let queue = device.get_device_queue(queue_family, 0);
    Ok((device, queue))
}

unsafe fn create_semaphores(device: &ash::Device, count: usize) -> Result<Vec<vk::Semaphore>> {
    let ci = vk::SemaphoreCreateInfo::default();
    (0..count)
        .map(|_| device.create_semaphore(&ci, None).context("create_semaphore"))
        .collect()
}

fn vulkan_error(what: &'static str, result: vk::Result) -> anyhow::Error {
    RenderError::Vulkan {
        what,
        result: format!("{result:?}"),
    }
    .into()
}

unsafe fn build_renderer(
    window: &dyn HasWindowHandle,
    display: &dyn HasDisplayHandle,
    size: RenderSize,
    cfg: VkRendererConfig,
    ui: Box<dyn UiLayer>,
) -> Result<VkRenderer> {
    let dh = display
        .display_handle()
        .map_err(|e| anyhow!("{e}"))?
        .as_raw();
    let wh = window.window_handle().map_err(|e| anyhow!("{e}"))?.as_raw();

    // 1) Instance, debug messenger, surface
    let entry = Entry::load().context("loading the Vulkan library")?;
    let instance = create_instance(&entry, dh)?;
    let debug_messenger = create_debug_messenger(&entry, &instance)?;
    let surface_loader = surface::Instance::new(&entry, &instance);
    let surface = ash_window::create_surface(&entry, &instance, dh, wh, None)
        .context("ash_window::create_surface")?;

    // 2) Device and queue
    let (phys, queue_family) = pick_device_and_queue(&instance, &surface_loader, surface)?;
    let (device, queue) = create_device(&instance, phys, queue_family)?;
    let memory_props = instance.get_physical_device_memory_properties(phys);

    // 3) Swapchain
    let swapchain_loader = khr_swapchain::Device::new(&instance, &device);
    let sc = create_swapchain_bundle(
        &device,
        &surface_loader,
        &swapchain_loader,
        phys,
        surface,
        vk::SwapchainKHR::null(),
        SwapchainConfig {
            hint: size,
            vsync: cfg.vsync,
            vsync_mode: cfg.vsync_mode,
        },
    )?;

    // 4) Commands and sync
    let pool_info = vk::CommandPoolCreateInfo {
        s_type: vk::StructureType::COMMAND_POOL_CREATE_INFO,
        queue_family_index: queue_family,
        flags: vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
        ..Default::default()
    };
    let cmd_pool = device
        .create_command_pool(&pool_info, None)
        .context("create_command_pool")?;
    let alloc_info = vk::CommandBufferAllocateInfo {
        s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
        command_pool: cmd_pool,
        level: vk::CommandBufferLevel::PRIMARY,
        command_buffer_count: 1,
        ..Default::default()
    };
    let cmd = device
        .allocate_command_buffers(&alloc_info)
        .context("allocate_command_buffers")?[0];
    let image_available = create_semaphores(&device, 1)?[0];
    let render_finished = create_semaphores(&device, sc.images.len())?;
    let fence_ci = vk::FenceCreateInfo {
        s_type: vk::StructureType::FENCE_CREATE_INFO,
        flags: vk::FenceCreateFlags::SIGNALED,
        ..Default::default()
    };
    let in_flight = device.create_fence(&fence_ci, None).context("create_fence")?;

    // 5) Resource table, pipelines, frame resources
    let layouts = TableLayouts::new(&device)?;
    let pipelines = PipelineSet::new(&device, &cfg.shader_dir, &layouts)?;
    let table = DescriptorSetManager::new(&device, &layouts, sc.images.len())?;
    let resources = FrameResources::new(
        &device,
        &memory_props,
        sc.extent,
        ResourceCapacities {
            instances: cfg.instance_capacity,
            geometry_bytes: cfg.geometry_bytes,
        },
    )?;
    resources.upload_static_images(&device, &memory_props, queue, queue_family, cmd_pool)?;

    let fallback_slot = table.write_image(&device, resources.fallback_texture.view);
    table.write_descriptors(
        &device,
        &resources.static_bindings(),
        &resources.resizing_views(&sc.image_views),
    );

    info!(
        extent = ?(sc.extent.width, sc.extent.height),
        images = sc.images.len(),
        fallback_slot = fallback_slot.index(),
        "vk: renderer ready"
    );

    Ok(VkRenderer {
        instance,
        surface_loader,
        surface,
        debug_messenger,
        phys,
        memory_props,
        device,
        queue,
        queue_family,
        swapchain_loader,
        sc,
        cmd_pool,
        cmd,
        image_available,
        render_finished,
        in_flight,
        layouts,
        pipelines,
        table,
        resources,
        fallback_slot: Some(fallback_slot),
        ui,
        cfg,
        uniforms: Uniforms::default(),
        paused: false,
        _entry: entry,
    })
}

impl VkRenderer {
    pub fn with_config(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
        cfg: VkRendererConfig,
        ui: Box<dyn UiLayer>,
    ) -> Result<Self> {
        unsafe { build_renderer(window, display, size, cfg, ui) }
    }

    pub fn set_vsync_mode(&mut self, mode: VkVsyncMode) -> Result<()> {
        if self.cfg.vsync_mode == mode {
            return Ok(());
        }
        self.cfg.vsync_mode = mode;
        unsafe { self.recreate_swapchain(self.current_size()) }
    }

    /// Replaces the instance list the next frame culls and draws.
    pub fn write_instances(&mut self, instances: &[GpuInstance]) -> Result<()> {
        self.resources.write_instances(instances)
    }

    /// Index of the white fallback texture in the bindless array.
    pub fn fallback_texture_slot(&self) -> Option<u32> {
        self.fallback_slot.as_ref().map(BindlessSlot::index)
    }

    fn current_size(&self) -> RenderSize {
        RenderSize {
            width: self.sc.extent.width,
            height: self.sc.extent.height,
        }
    }

    // Order: wait idle, new swapchain (old one retired), render targets,
    // variant sets, then the resizing descriptor rewrite.
    unsafe fn recreate_swapchain(&mut self, size: RenderSize) -> Result<()> {
        if size.is_empty() {
            return Ok(());
        }
        self.device
            .device_wait_idle()
            .context("device_wait_idle before swapchain recreation")?;

        let bundle = create_swapchain_bundle(
            &self.device,
            &self.surface_loader,
            &self.swapchain_loader,
            self.phys,
            self.surface,
            self.sc.swapchain,
            SwapchainConfig {
                hint: size,
                vsync: self.cfg.vsync,
                vsync_mode: self.cfg.vsync_mode,
            },
        )?;
        self.sc.destroy_views(&self.device);
        self.swapchain_loader.destroy_swapchain(self.sc.swapchain, None);
        self.sc = bundle;

        if self.render_finished.len() != self.sc.images.len() {
            for &sem in &self.render_finished {
                self.device.destroy_semaphore(sem, None);
            }
            self.render_finished = create_semaphores(&self.device, self.sc.images.len())?;
        }

        self.resources
            .resize(&self.device, &self.memory_props, self.sc.extent)?;
        self.table
            .match_swapchain(&self.device, &self.layouts, self.sc.images.len())?;
        self.table.write_resizing_descriptors(
            &self.device,
            &self.resources.resizing_views(&self.sc.image_views),
        );

        debug!(
            width = self.sc.extent.width,
            height = self.sc.extent.height,
            "vk: resized"
        );
        Ok(())
    }

    unsafe fn record(&mut self, image_index: u32) -> Result<()> {
        let cmd = self.cmd;
        self.device
            .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
            .context("reset_command_buffer")?;
        let begin = vk::CommandBufferBeginInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
            flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            ..Default::default()
        };
        self.device
            .begin_command_buffer(cmd, &begin)
            .context("begin_command_buffer")?;

        let target = SwapchainTarget {
            image: self.sc.images[image_index as usize],
            view: self.sc.image_views[image_index as usize],
            index: image_index,
        };
        let frame = FrameRenderer {
            device: &self.device,
            pipelines: &self.pipelines,
            table: &self.table,
            resources: &self.resources,
            queue_family: self.queue_family,
        };
        frame.render(cmd, &target, self.sc.extent, self.ui.as_mut());

        self.device
            .end_command_buffer(cmd)
            .context("end_command_buffer")?;
        Ok(())
    }
}

impl Renderer for VkRenderer {
    fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
    ) -> Result<Self> {
        Self::with_config(window, display, size, VkRendererConfig::default(), Box::new(NoUi))
    }

    fn set_vsync(&mut self, on: bool) {
        if self.cfg.vsync == on {
            return;
        }
        self.cfg.vsync = on;
        if let Err(e) = unsafe { self.recreate_swapchain(self.current_size()) } {
            error!("vk: set_vsync failed: {e:#}");
        }
    }

    fn set_camera(&mut self, view: Mat4, projection: Mat4) {
        self.uniforms.view = view;
        self.uniforms.projection = projection;
    }

    fn resize(&mut self, size: RenderSize) -> Result<()> {
        if size.is_empty() {
            if !self.paused {
                info!("vk: resize to 0x0 → paused");
            }
            self.paused = true;
            return Ok(());
        }
        self.paused = false;
        unsafe { self.recreate_swapchain(size) }
    }

    // Per frame: wait the previous frame's fence, acquire, record, submit
    // (waiting on acquire at ALL_COMMANDS), present.
    fn render(&mut self) -> Result<()> {
        if self.paused {
            return Ok(());
        }

        unsafe {
            self.device
                .wait_for_fences(&[self.in_flight], true, u64::MAX)
                .context("wait_for_fences")?;

            let (image_index, suboptimal) = match self.swapchain_loader.acquire_next_image(
                self.sc.swapchain,
                u64::MAX,
                self.image_available,
                vk::Fence::null(),
            ) {
                Ok(pair) => pair,
                Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                    debug!("vk: {}", RenderError::SwapchainOutOfDate);
                    return self.recreate_swapchain(self.current_size());
                }
                Err(e) => return Err(vulkan_error("acquire_next_image", e)),
            };
            self.device
                .reset_fences(&[self.in_flight])
                .context("reset_fences")?;

            self.uniforms.extent = [self.sc.extent.width, self.sc.extent.height];
            self.uniforms.instance_count = self.resources.instance_count();
            self.resources.write_uniforms(&self.uniforms)?;

            self.record(image_index)?;

            let render_finished = self.render_finished[image_index as usize];
            let wait = vk::SemaphoreSubmitInfo::default()
                .semaphore(self.image_available)
                .stage_mask(sync::ACQUIRE_WAIT_STAGE);
            let signal = vk::SemaphoreSubmitInfo::default()
                .semaphore(render_finished)
                .stage_mask(sync::RENDER_FINISHED_STAGE);
            let cmd_info = vk::CommandBufferSubmitInfo::default().command_buffer(self.cmd);
            let submit = vk::SubmitInfo2::default()
                .wait_semaphore_infos(std::slice::from_ref(&wait))
                .command_buffer_infos(std::slice::from_ref(&cmd_info))
                .signal_semaphore_infos(std::slice::from_ref(&signal));
            self.device
                .queue_submit2(self.queue, std::slice::from_ref(&submit), self.in_flight)
                .context("queue_submit2")?;

            let present = vk::PresentInfoKHR {
                s_type: vk::StructureType::PRESENT_INFO_KHR,
                wait_semaphore_count: 1,
                p_wait_semaphores: &render_finished,
                swapchain_count: 1,
                p_swapchains: &self.sc.swapchain,
                p_image_indices: &image_index,
                ..Default::default()
            };
            match self.swapchain_loader.queue_present(self.queue, &present) {
                Ok(false) if !suboptimal => Ok(()),
                Ok(_) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                    debug!("vk: {}", RenderError::SwapchainOutOfDate);
                    self.recreate_swapchain(self.current_size())
                }
                Err(e) => Err(vulkan_error("queue_present", e)),
            }
        }
    }
}

// Teardown order: wait for the device, release bindless leases and check
// for leaks, then pipelines, descriptor state, frame resources, swapchain
// views, command pool, swapchain, sync objects, device, surface, instance.
impl Drop for VkRenderer {
    fn drop(&mut self) {
        unsafe {
            let d = &self.device;
            let _ = d.wait_for_fences(&[self.in_flight], true, u64::MAX);
            d.device_wait_idle().ok();

            self.fallback_slot.take();
            if let Err(e) = self.table.allocator().shutdown() {
                error!("vk: {e}");
                debug_assert!(false, "{e}");
            }

            self.pipelines.destroy(d);
            self.table.destroy(d);
            self.layouts.destroy(d);
            self.resources.destroy(d);
            self.sc.destroy_views(d);

            d.free_command_buffers(self.cmd_pool, &[self.cmd]);
            d.destroy_command_pool(self.cmd_pool, None);

            self.swapchain_loader.destroy_swapchain(self.sc.swapchain, None);

            d.destroy_fence(self.in_flight, None);
            d.destroy_semaphore(self.image_available, None);
            for &sem in &self.render_finished {
                d.destroy_semaphore(sem, None);
            }

            d.destroy_device(None);
            destroy_debug_messenger(&self.debug_messenger);
            self.surface_loader.destroy_surface(self.surface, None);
            self.instance.destroy_instance(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_feature_set_is_accepted() {
        let core = vk::PhysicalDeviceFeatures {
            multi_draw_indirect: vk::TRUE,
            ..Default::default()
        };
        let f12 = vk::PhysicalDeviceVulkan12Features::default()
            .draw_indirect_count(true)
            .descriptor_indexing(true)
            .descriptor_binding_partially_bound(true)
            .runtime_descriptor_array(true)
            .shader_sampled_image_array_non_uniform_indexing(true);
        let f13 = vk::PhysicalDeviceVulkan13Features::default()
            .dynamic_rendering(true)
            .synchronization2(true);
        assert!(missing_features(&core, &f12, &f13).is_empty());
    }

    #[test]
    fn missing_features_are_named() {
        let core = vk::PhysicalDeviceFeatures::default();
        let f12 = vk::PhysicalDeviceVulkan12Features::default()
            .draw_indirect_count(true)
            .descriptor_indexing(true)
            .descriptor_binding_partially_bound(true)
            .runtime_descriptor_array(true)
            .shader_sampled_image_array_non_uniform_indexing(true);
        let f13 = vk::PhysicalDeviceVulkan13Features::default().dynamic_rendering(true);
        assert_eq!(
            missing_features(&core, &f12, &f13),
            ["multi_draw_indirect", "synchronization2"]
        );
    }

    #[test]
    fn default_config_points_at_compiled_shaders() {
        let cfg = VkRendererConfig::default();
        assert_eq!(cfg.shader_dir, PathBuf::from("compiled_shaders"));
        assert!(cfg.vsync);
        assert_eq!(cfg.vsync_mode, VkVsyncMode::Fifo);
    }
}
