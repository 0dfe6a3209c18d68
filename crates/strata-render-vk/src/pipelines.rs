// SPDX-License-Identifier: CEPL-1.0
//! Pipeline compilation.
//!
//! Every pipeline is described by a plain record; one builder turns the
//! records into device objects. All pipelines share a single layout: the
//! resource table's two sets plus the cascade push constant.

use std::collections::HashMap;
use std::ffi::CStr;
use std::fs;
use std::io::Cursor;
use std::path::Path;

use anyhow::{Context, Result};
use ash::util::read_spv;
use ash::vk;
use strata_math::ShadowPassConstant;
use strata_render::plan::{ComputePipeline, GraphicsPipeline};
use strata_render::RenderError;
use tracing::{debug, info};

use crate::descriptors::TableLayouts;
use crate::resources::{DEPTH_FORMAT, VISBUFFER_FORMAT};

const RGBA_MASK: vk::ColorComponentFlags = vk::ColorComponentFlags::from_raw(0b1111);
const DYNAMIC_STATES: [vk::DynamicState; 2] = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];

/// Reverse-Z: nearer fragments have greater depth.
pub const VISBUFFER_DEPTH_COMPARE: vk::CompareOp = vk::CompareOp::GREATER;
pub const SHADOW_DEPTH_COMPARE: vk::CompareOp = vk::CompareOp::LESS;

#[derive(Clone, Copy, Debug)]
pub struct GraphicsPipelineDesc {
    pub pipeline: GraphicsPipeline,
    /// SPIR-V file inside the shader directory.
    pub shader: &'static str,
    pub vertex_entry: &'static CStr,
    pub fragment_entry: Option<&'static CStr>,
    pub color_format: Option<vk::Format>,
    pub depth_format: vk::Format,
    pub depth_compare: vk::CompareOp,
}

#[derive(Clone, Copy, Debug)]
pub struct ComputePipelineDesc {
    pub pipeline: ComputePipeline,
    pub shader: &'static str,
    pub entry: &'static CStr,
}

pub const GRAPHICS_PIPELINES: [GraphicsPipelineDesc; 5] = [
    GraphicsPipelineDesc {
        pipeline: GraphicsPipeline::VisbufferOpaque,
        shader: "visbuffer.spv",
        vertex_entry: c"vertex",
        fragment_entry: Some(c"opaque_fragment"),
        color_format: Some(VISBUFFER_FORMAT),
        depth_format: DEPTH_FORMAT,
        depth_compare: VISBUFFER_DEPTH_COMPARE,
    },
    GraphicsPipelineDesc {
        pipeline: GraphicsPipeline::VisbufferAlphaClip,
        shader: "visbuffer.spv",
        vertex_entry: c"alpha_clip_vertex",
        fragment_entry: Some(c"alpha_clip_fragment"),
        color_format: Some(VISBUFFER_FORMAT),
        depth_format: DEPTH_FORMAT,
        depth_compare: VISBUFFER_DEPTH_COMPARE,
    },
    GraphicsPipelineDesc {
        pipeline: GraphicsPipeline::ShadowOpaque,
        shader: "shadowmap.spv",
        vertex_entry: c"vertex",
        fragment_entry: None,
        color_format: None,
        depth_format: DEPTH_FORMAT,
        depth_compare: SHADOW_DEPTH_COMPARE,
    },
    GraphicsPipelineDesc {
        pipeline: GraphicsPipeline::ShadowAlphaClip,
        shader: "shadowmap.spv",
        vertex_entry: c"alpha_clip_vertex",
        fragment_entry: Some(c"alpha_clip_fragment"),
        color_format: None,
        depth_format: DEPTH_FORMAT,
        depth_compare: SHADOW_DEPTH_COMPARE,
    },
    GraphicsPipelineDesc {
        pipeline: GraphicsPipeline::DepthPrepass,
        shader: "visbuffer.spv",
        vertex_entry: c"depth_only",
        fragment_entry: None,
        color_format: None,
        depth_format: DEPTH_FORMAT,
        depth_compare: VISBUFFER_DEPTH_COMPARE,
    },
];

pub const COMPUTE_PIPELINES: [ComputePipelineDesc; 5] = [
    ComputePipelineDesc {
        pipeline: ComputePipeline::WriteDrawCalls,
        shader: "write_draw_calls.spv",
        entry: c"main",
    },
    ComputePipelineDesc {
        pipeline: ComputePipeline::ReadDepth,
        shader: "read_depth.spv",
        entry: c"main",
    },
    ComputePipelineDesc {
        pipeline: ComputePipeline::GenerateMatrices,
        shader: "generate_shadow_matrices.spv",
        entry: c"main",
    },
    ComputePipelineDesc {
        pipeline: ComputePipeline::RenderGeometry,
        shader: "render_geometry.spv",
        entry: c"main",
    },
    ComputePipelineDesc {
        pipeline: ComputePipeline::DisplayTransform,
        shader: "display_transform.spv",
        entry: c"main",
    },
];

/// Reads a SPIR-V binary into words.
pub fn read_shader(path: &Path) -> Result<Vec<u32>, RenderError> {
    let shader_load = |source| RenderError::ShaderLoad {
        path: path.to_path_buf(),
        source,
    };
    let bytes = fs::read(path).map_err(shader_load)?;
    read_spv(&mut Cursor::new(&bytes)).map_err(shader_load)
}

fn vulkan_error(what: &'static str, result: vk::Result) -> RenderError {
    RenderError::Vulkan {
        what,
        result: format!("{result:?}"),
    }
}

fn fill_rasterization() -> vk::PipelineRasterizationStateCreateInfo<'static> {
    vk::PipelineRasterizationStateCreateInfo::default()
        .polygon_mode(vk::PolygonMode::FILL)
        .cull_mode(vk::CullModeFlags::NONE)
        .line_width(1.0)
}

fn no_multisampling() -> vk::PipelineMultisampleStateCreateInfo<'static> {
    vk::PipelineMultisampleStateCreateInfo::default()
        .rasterization_samples(vk::SampleCountFlags::TYPE_1)
        .min_sample_shading(1.0)
}

fn depth_write(compare: vk::CompareOp) -> vk::PipelineDepthStencilStateCreateInfo<'static> {
    vk::PipelineDepthStencilStateCreateInfo::default()
        .depth_test_enable(true)
        .depth_write_enable(true)
        .depth_compare_op(compare)
}

const REPLACE_BLEND: vk::PipelineColorBlendAttachmentState = vk::PipelineColorBlendAttachmentState {
    blend_enable: vk::FALSE,
    src_color_blend_factor: vk::BlendFactor::ONE,
    dst_color_blend_factor: vk::BlendFactor::ZERO,
    color_blend_op: vk::BlendOp::ADD,
    src_alpha_blend_factor: vk::BlendFactor::ONE,
    dst_alpha_blend_factor: vk::BlendFactor::ZERO,
    alpha_blend_op: vk::BlendOp::ADD,
    color_write_mask: RGBA_MASK,
};

pub struct PipelineSet {
    layout: vk::PipelineLayout,
    graphics: HashMap<GraphicsPipeline, vk::Pipeline>,
    compute: HashMap<ComputePipeline, vk::Pipeline>,
}

impl PipelineSet {
    /// Loads every shader from `shader_dir` and compiles all pipelines.
    /// A missing or malformed shader fails the whole set.
    pub unsafe fn new(device: &ash::Device, shader_dir: &Path, layouts: &TableLayouts) -> Result<Self> {
        let set_layouts = layouts.as_array();
        let push_constant = vk::PushConstantRange {
            stage_flags: vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::COMPUTE,
            offset: 0,
            size: std::mem::size_of::<ShadowPassConstant>() as u32,
        };
        let layout_ci = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&set_layouts)
            .push_constant_ranges(std::slice::from_ref(&push_constant));
        let layout = device
            .create_pipeline_layout(&layout_ci, None)
            .context("create_pipeline_layout")?;

        let mut set = Self {
            layout,
            graphics: HashMap::new(),
            compute: HashMap::new(),
        };
        let mut modules = ShaderModules::default();
        let compiled = set.compile_all(device, shader_dir, &mut modules);
        modules.destroy(device);
        if let Err(err) = compiled {
            set.destroy(device);
            return Err(err);
        }

        info!(
            graphics = set.graphics.len(),
            compute = set.compute.len(),
            shader_dir = %shader_dir.display(),
            "pipelines compiled"
        );
        Ok(set)
    }

    unsafe fn compile_all(
        &mut self,
        device: &ash::Device,
        shader_dir: &Path,
        modules: &mut ShaderModules,
    ) -> Result<()> {
        for desc in &GRAPHICS_PIPELINES {
            let module = modules.get(device, shader_dir, desc.shader)?;
            let pipeline = create_graphics_pipeline(device, self.layout, module, desc)
                .with_context(|| format!("compiling {:?}", desc.pipeline))?;
            self.graphics.insert(desc.pipeline, pipeline);
        }
        for desc in &COMPUTE_PIPELINES {
            let module = modules.get(device, shader_dir, desc.shader)?;
            let stage = vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::COMPUTE)
                .module(module)
                .name(desc.entry);
            let ci = vk::ComputePipelineCreateInfo::default()
                .stage(stage)
                .layout(self.layout);
            let pipeline = device
                .create_compute_pipelines(vk::PipelineCache::null(), std::slice::from_ref(&ci), None)
                .map_err(|(_, err)| vulkan_error("create_compute_pipelines", err))
                .with_context(|| format!("compiling {:?}", desc.pipeline))?[0];
            self.compute.insert(desc.pipeline, pipeline);
        }
        Ok(())
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    pub fn graphics(&self, pipeline: GraphicsPipeline) -> vk::Pipeline {
        self.graphics[&pipeline]
    }

    pub fn compute(&self, pipeline: ComputePipeline) -> vk::Pipeline {
        self.compute[&pipeline]
    }

    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        for (_, pipeline) in self.graphics.drain() {
            device.destroy_pipeline(pipeline, None);
        }
        for (_, pipeline) in self.compute.drain() {
            device.destroy_pipeline(pipeline, None);
        }
        device.destroy_pipeline_layout(self.layout, None);
    }
}

/// Modules are shared between pipelines of the same file and only live
/// for the duration of compilation.
#[derive(Default)]
struct ShaderModules {
    loaded: HashMap<&'static str, vk::ShaderModule>,
}

impl ShaderModules {
    unsafe fn get(
        &mut self,
        device: &ash::Device,
        shader_dir: &Path,
        name: &'static str,
    ) -> Result<vk::ShaderModule> {
        if let Some(&module) = self.loaded.get(name) {
            return Ok(module);
        }
        let code = read_shader(&shader_dir.join(name))?;
        let ci = vk::ShaderModuleCreateInfo::default().code(&code);
        let module = device
            .create_shader_module(&ci, None)
            .with_context(|| format!("create_shader_module({name})"))?;
        debug!(name, words = code.len(), "shader module created");
        self.loaded.insert(name, module);
        Ok(module)
    }

    unsafe fn destroy(self, device: &ash::Device) {
        for (_, module) in self.loaded {
            device.destroy_shader_module(module, None);
        }
    }
}

unsafe fn create_graphics_pipeline(
    device: &ash::Device,
    layout: vk::PipelineLayout,
    module: vk::ShaderModule,
    desc: &GraphicsPipelineDesc,
) -> Result<vk::Pipeline> {
    let mut stages = vec![vk::PipelineShaderStageCreateInfo::default()
        .stage(vk::ShaderStageFlags::VERTEX)
        .module(module)
        .name(desc.vertex_entry)];
    if let Some(entry) = desc.fragment_entry {
        stages.push(
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(module)
                .name(entry),
        );
    }

    // Vertices are pulled from the geometry buffer, not fixed-function input.
    let vertex_input = vk::PipelineVertexInputStateCreateInfo::default();
    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
        .topology(vk::PrimitiveTopology::TRIANGLE_LIST);
    let viewport_state = vk::PipelineViewportStateCreateInfo::default()
        .viewport_count(1)
        .scissor_count(1);
    let dynamic_state = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&DYNAMIC_STATES);
    let raster = fill_rasterization();
    let multisample = no_multisampling();
    let depth_stencil = depth_write(desc.depth_compare);

    let color_formats: Vec<vk::Format> = desc.color_format.into_iter().collect();
    let blend_attachments: Vec<_> = color_formats.iter().map(|_| REPLACE_BLEND).collect();
    let color_blend = vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);

    let mut rendering = vk::PipelineRenderingCreateInfo::default()
        .color_attachment_formats(&color_formats)
        .depth_attachment_format(desc.depth_format);

    let ci = vk::GraphicsPipelineCreateInfo::default()
        .push_next(&mut rendering)
        .stages(&stages)
        .vertex_input_state(&vertex_input)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&raster)
        .multisample_state(&multisample)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&color_blend)
        .dynamic_state(&dynamic_state)
        .layout(layout);

    let pipelines = device
        .create_graphics_pipelines(vk::PipelineCache::null(), std::slice::from_ref(&ci), None)
        .map_err(|(_, err)| vulkan_error("create_graphics_pipelines", err))?;
    Ok(pipelines[0])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::path::PathBuf;

    fn scratch_file(name: &str, bytes: &[u8]) -> PathBuf {
        let path = std::env::temp_dir().join(format!("strata-{}-{name}", std::process::id()));
        fs::write(&path, bytes).unwrap();
        path
    }

    #[test]
    fn every_pipeline_has_exactly_one_record() {
        let graphics: HashSet<_> = GRAPHICS_PIPELINES.iter().map(|d| d.pipeline).collect();
        let compute: HashSet<_> = COMPUTE_PIPELINES.iter().map(|d| d.pipeline).collect();
        assert_eq!(graphics.len(), GRAPHICS_PIPELINES.len());
        assert_eq!(compute.len(), COMPUTE_PIPELINES.len());
    }

    #[test]
    fn visbuffer_uses_reverse_z_and_shadows_do_not() {
        for desc in &GRAPHICS_PIPELINES {
            let expected = match desc.pipeline {
                GraphicsPipeline::VisbufferOpaque
                | GraphicsPipeline::VisbufferAlphaClip
                | GraphicsPipeline::DepthPrepass => vk::CompareOp::GREATER,
                GraphicsPipeline::ShadowOpaque | GraphicsPipeline::ShadowAlphaClip => {
                    vk::CompareOp::LESS
                }
            };
            assert_eq!(desc.depth_compare, expected, "{:?}", desc.pipeline);
        }
    }

    #[test]
    fn depth_only_pipelines_have_no_color_target() {
        for desc in &GRAPHICS_PIPELINES {
            let depth_only = matches!(
                desc.pipeline,
                GraphicsPipeline::ShadowOpaque
                    | GraphicsPipeline::ShadowAlphaClip
                    | GraphicsPipeline::DepthPrepass
            );
            assert_eq!(desc.color_format.is_none(), depth_only, "{:?}", desc.pipeline);
        }
    }

    #[test]
    fn missing_shader_names_the_path() {
        let path = std::env::temp_dir().join("strata-definitely-missing.spv");
        match read_shader(&path) {
            Err(RenderError::ShaderLoad { path: reported, .. }) => assert_eq!(reported, path),
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn reads_spirv_words() {
        let magic = 0x0723_0203u32.to_le_bytes();
        let word = 7u32.to_le_bytes();
        let path = scratch_file("ok.spv", &[magic, word].concat());
        let words = read_shader(&path).unwrap();
        fs::remove_file(&path).ok();
        assert_eq!(words, [0x0723_0203, 7]);
    }

    #[test]
    fn truncated_shader_is_rejected() {
        let path = scratch_file("truncated.spv", &[0x03, 0x02, 0x23]);
        let result = read_shader(&path);
        fs::remove_file(&path).ok();
        assert!(matches!(result, Err(RenderError::ShaderLoad { .. })));
    }
}
