// SPDX-License-Identifier: CEPL-1.0
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("failed to load shader {path:?}")]
    ShaderLoad {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{what} failed: {result}")]
    Vulkan { what: &'static str, result: String },

    #[error("no physical device supports the required Vulkan 1.3 feature set")]
    NoSuitableDevice,

    #[error("no memory type satisfies the requested properties")]
    NoMemoryType,

    #[error("bindless slots still leased at shutdown: {0:?}")]
    LeakedBindlessSlots(Vec<u32>),

    #[error("swapchain is out of date")]
    SwapchainOutOfDate,
}
