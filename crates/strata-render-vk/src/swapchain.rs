// SPDX-License-Identifier: CEPL-1.0
use anyhow::{Context, Result};
use ash::khr::{surface, swapchain};
use ash::vk;
use serde::Deserialize;
use strata_render::RenderSize;
use tracing::info;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VkVsyncMode {
    /// Locked to the display refresh.
    #[default]
    Fifo,
    /// Newest frame wins, uncapped.
    Mailbox,
}

#[derive(Clone, Copy, Debug)]
pub struct SwapchainConfig {
    pub hint: RenderSize,
    pub vsync: bool,
    pub vsync_mode: VkVsyncMode,
}

pub struct SwapchainBundle {
    pub swapchain: vk::SwapchainKHR,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
}

impl SwapchainBundle {
    pub unsafe fn destroy_views(&mut self, device: &ash::Device) {
        for &view in &self.image_views {
            device.destroy_image_view(view, None);
        }
        self.image_views.clear();
    }
}

/// The display transform writes the swapchain from compute and the UI draws
/// over it, so the image needs both usages.
pub const SWAPCHAIN_USAGE: vk::ImageUsageFlags = vk::ImageUsageFlags::from_raw(
    vk::ImageUsageFlags::STORAGE.as_raw() | vk::ImageUsageFlags::COLOR_ATTACHMENT.as_raw(),
);

fn pm_name(m: vk::PresentModeKHR) -> &'static str {
    match m {
        vk::PresentModeKHR::FIFO => "FIFO",
        vk::PresentModeKHR::MAILBOX => "MAILBOX",
        vk::PresentModeKHR::IMMEDIATE => "IMMEDIATE",
        vk::PresentModeKHR::FIFO_RELAXED => "FIFO_RELAXED",
        _ => "OTHER",
    }
}

/// First supported mode in preference order; FIFO is always available.
pub fn choose_present_mode(
    modes: &[vk::PresentModeKHR],
    vsync: bool,
    mode: VkVsyncMode,
) -> vk::PresentModeKHR {
    let preference: &[vk::PresentModeKHR] = match (vsync, mode) {
        (false, _) => &[
            vk::PresentModeKHR::IMMEDIATE,
            vk::PresentModeKHR::MAILBOX,
            vk::PresentModeKHR::FIFO,
        ],
        (true, VkVsyncMode::Mailbox) => &[vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::FIFO],
        (true, VkVsyncMode::Fifo) => &[vk::PresentModeKHR::FIFO],
    };
    preference
        .iter()
        .copied()
        .find(|m| modes.contains(m))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

pub fn extent_from_caps(caps: &vk::SurfaceCapabilitiesKHR, want: RenderSize) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: want
                .width
                .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: want
                .height
                .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

/// The display transform writes the swapchain as a storage image and applies
/// the output encoding in the shader. sRGB formats rarely support
/// `STORAGE` usage and would encode a second time, so UNORM is preferred.
/// Anything else the surface offers is a last resort.
pub fn pick_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    [vk::Format::B8G8R8A8_UNORM, vk::Format::R8G8B8A8_UNORM]
        .into_iter()
        .find_map(|want| {
            formats
                .iter()
                .copied()
                .find(|f| f.format == want && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR)
        })
        .or_else(|| formats.first().copied())
}

pub fn image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    if caps.max_image_count == 0 {
        caps.min_image_count + 1
    } else {
        (caps.min_image_count + 1).min(caps.max_image_count)
    }
}

pub unsafe fn create_swapchain_bundle(
    device: &ash::Device,
    surf_i: &surface::Instance,
    swap_d: &swapchain::Device,
    phys: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
    old_swapchain: vk::SwapchainKHR,
    cfg: SwapchainConfig,
) -> Result<SwapchainBundle> {
    let caps = surf_i
        .get_physical_device_surface_capabilities(phys, surface)
        .context("get_physical_device_surface_capabilities")?;
    let formats = surf_i
        .get_physical_device_surface_formats(phys, surface)
        .context("get_physical_device_surface_formats")?;
    let modes = surf_i
        .get_physical_device_surface_present_modes(phys, surface)
        .context("get_physical_device_surface_present_modes")?;

    let surf_format = pick_surface_format(&formats).context("surface exposes no formats")?;
    let present_mode = choose_present_mode(&modes, cfg.vsync, cfg.vsync_mode);
    let extent = extent_from_caps(&caps, cfg.hint);
    let min_count = image_count(&caps);

    let pre_transform = if caps
        .supported_transforms
        .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
    {
        vk::SurfaceTransformFlagsKHR::IDENTITY
    } else {
        caps.current_transform
    };

    let swap_info = vk::SwapchainCreateInfoKHR {
        s_type: vk::StructureType::SWAPCHAIN_CREATE_INFO_KHR,
        surface,
        min_image_count: min_count,
        image_format: surf_format.format,
        image_color_space: surf_format.color_space,
        image_extent: extent,
        image_array_layers: 1,
        image_usage: SWAPCHAIN_USAGE,
        image_sharing_mode: vk::SharingMode::EXCLUSIVE,
        pre_transform,
        composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
        present_mode,
        clipped: vk::TRUE,
        old_swapchain,
        ..Default::default()
    };

    let new_swapchain = swap_d
        .create_swapchain(&swap_info, None)
        .context("create_swapchain")?;
    let images = swap_d
        .get_swapchain_images(new_swapchain)
        .context("get_swapchain_images")?;

    let mut views = Vec::with_capacity(images.len());
    for &img in &images {
        let iv_info = vk::ImageViewCreateInfo {
            s_type: vk::StructureType::IMAGE_VIEW_CREATE_INFO,
            image: img,
            view_type: vk::ImageViewType::TYPE_2D,
            format: surf_format.format,
            subresource_range: vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            },
            ..Default::default()
        };
        views.push(device.create_image_view(&iv_info, None).context("swapchain image view")?);
    }

    info!(
        "swapchain: format={:?} present_mode={} vsync={} mode={:?} extent={}x{} images={}",
        surf_format.format,
        pm_name(present_mode),
        cfg.vsync,
        cfg.vsync_mode,
        extent.width,
        extent.height,
        images.len()
    );

    Ok(SwapchainBundle {
        swapchain: new_swapchain,
        format: surf_format.format,
        extent,
        images,
        image_views: views,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(current: vk::Extent2D) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 3,
            current_extent: current,
            min_image_extent: vk::Extent2D { width: 1, height: 1 },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            ..Default::default()
        }
    }

    #[test]
    fn vsync_off_prefers_immediate() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE];
        assert_eq!(
            choose_present_mode(&modes, false, VkVsyncMode::Fifo),
            vk::PresentModeKHR::IMMEDIATE
        );
    }

    #[test]
    fn mailbox_falls_back_to_fifo() {
        let modes = [vk::PresentModeKHR::FIFO];
        assert_eq!(
            choose_present_mode(&modes, true, VkVsyncMode::Mailbox),
            vk::PresentModeKHR::FIFO
        );
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(
            choose_present_mode(&modes, true, VkVsyncMode::Mailbox),
            vk::PresentModeKHR::MAILBOX
        );
        assert_eq!(
            choose_present_mode(&modes, true, VkVsyncMode::Fifo),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn extent_follows_surface_unless_free_sized() {
        let fixed = caps(vk::Extent2D {
            width: 800,
            height: 600,
        });
        let want = RenderSize {
            width: 1920,
            height: 1080,
        };
        assert_eq!(extent_from_caps(&fixed, want).width, 800);

        let free = caps(vk::Extent2D {
            width: u32::MAX,
            height: u32::MAX,
        });
        let huge = RenderSize {
            width: 10_000,
            height: 720,
        };
        let e = extent_from_caps(&free, huge);
        assert_eq!((e.width, e.height), (4096, 720));
    }

    #[test]
    fn image_count_is_one_above_minimum_within_max() {
        let mut c = caps(vk::Extent2D::default());
        assert_eq!(image_count(&c), 3);
        c.max_image_count = 2;
        assert_eq!(image_count(&c), 2);
        c.max_image_count = 0;
        assert_eq!(image_count(&c), 3);
    }

    #[test]
    fn surface_format_prefers_unorm() {
        let srgb = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_SRGB,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let unorm = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        assert_eq!(pick_surface_format(&[srgb, unorm]).unwrap().format, unorm.format);
        assert_eq!(pick_surface_format(&[srgb]).unwrap().format, srgb.format);
        assert!(pick_surface_format(&[]).is_none());
    }

    #[test]
    fn swapchain_is_writable_from_compute_and_raster() {
        assert!(SWAPCHAIN_USAGE.contains(vk::ImageUsageFlags::STORAGE));
        assert!(SWAPCHAIN_USAGE.contains(vk::ImageUsageFlags::COLOR_ATTACHMENT));
        let rgba = vk::SurfaceFormatKHR {
            format: vk::Format::R8G8B8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let srgb = vk::SurfaceFormatKHR {
            format: vk::Format::R8G8B8A8_SRGB,
            ..rgba
        };
        assert_eq!(pick_surface_format(&[srgb, rgba]).unwrap().format, rgba.format);
    }

    #[test]
    fn vsync_mode_parses_lowercase() {
        #[derive(Deserialize)]
        struct Wrap {
            mode: VkVsyncMode,
        }
        let w: Wrap = toml::from_str("mode = \"mailbox\"").unwrap();
        assert_eq!(w.mode, VkVsyncMode::Mailbox);
    }
}
