// SPDX-License-Identifier: CEPL-1.0
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use strata_render_vk::{VkRendererConfig, VkVsyncMode};
use tracing::{info, warn};

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RenderCfg {
    pub vsync: bool,
    pub vsync_mode: VkVsyncMode,
    pub shader_dir: PathBuf,
    pub instance_capacity: u32,
    /// Redraw cap while the window is unfocused; 0 disables the cap.
    pub unfocused_fps: u32,
}

impl Default for RenderCfg {
    fn default() -> Self {
        RenderCfg {
            vsync: true,
            vsync_mode: VkVsyncMode::Mailbox,
            shader_dir: PathBuf::from("compiled_shaders"),
            instance_capacity: 4096,
            unfocused_fps: 30,
        }
    }
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct AppCfg {
    #[serde(default)]
    pub render: RenderCfg,
}

impl AppCfg {
    pub fn renderer(&self) -> VkRendererConfig {
        VkRendererConfig {
            shader_dir: self.render.shader_dir.clone(),
            instance_capacity: self.render.instance_capacity,
            vsync: self.render.vsync,
            vsync_mode: self.render.vsync_mode,
            ..VkRendererConfig::default()
        }
    }
}

pub fn parse_cfg(text: &str) -> Result<AppCfg, toml::de::Error> {
    toml::from_str(text)
}

/// Missing or malformed files fall back to defaults.
pub fn load_cfg(path: &Path) -> AppCfg {
    match fs::read_to_string(path) {
        Ok(s) => match parse_cfg(&s) {
            Ok(cfg) => {
                info!(path = %path.display(), "config loaded");
                cfg
            }
            Err(e) => {
                warn!(path = %path.display(), "config unreadable, using defaults: {e}");
                AppCfg::default()
            }
        },
        Err(e) => {
            warn!(path = %path.display(), "no config ({e}), using defaults");
            AppCfg::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_is_all_defaults() {
        let cfg = parse_cfg("").unwrap();
        assert!(cfg.render.vsync);
        assert_eq!(cfg.render.vsync_mode, VkVsyncMode::Mailbox);
        assert_eq!(cfg.render.shader_dir, PathBuf::from("compiled_shaders"));
        assert_eq!(cfg.render.unfocused_fps, 30);
    }

    #[test]
    fn partial_render_table_keeps_other_defaults() {
        let cfg = parse_cfg(
            r#"
            [render]
            vsync_mode = "fifo"
            unfocused_fps = 0
            "#,
        )
        .unwrap();
        assert_eq!(cfg.render.vsync_mode, VkVsyncMode::Fifo);
        assert_eq!(cfg.render.unfocused_fps, 0);
        assert_eq!(cfg.render.instance_capacity, 4096);
    }

    #[test]
    fn malformed_file_is_rejected() {
        assert!(parse_cfg("[render]\nvsync = \"sometimes\"").is_err());
    }

    #[test]
    fn missing_file_falls_back() {
        let cfg = load_cfg(Path::new("/definitely/not/here/strata.toml"));
        assert_eq!(cfg.render.instance_capacity, 4096);
    }

    #[test]
    fn renderer_config_carries_render_table() {
        let cfg = parse_cfg("[render]\nshader_dir = \"spv\"\ninstance_capacity = 16").unwrap();
        let vk = cfg.renderer();
        assert_eq!(vk.shader_dir, PathBuf::from("spv"));
        assert_eq!(vk.instance_capacity, 16);
    }
}
