// SPDX-License-Identifier: CEPL-1.0
use anyhow::Result;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use strata_math::glam::Mat4;

pub mod access;
pub mod bindless;
pub mod error;
pub mod plan;

pub use access::{Access, ImageAspect, ImageLayout, SubresourceRange};
pub use bindless::{BindlessSlot, BindlessSlotAllocator};
pub use error::RenderError;
pub use plan::{FrameParams, FramePlan, PassKind, PassRecord};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderSize {
    pub width: u32,
    pub height: u32,
}

impl RenderSize {
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

pub trait Renderer {
    fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
    ) -> Result<Self>
    where
        Self: Sized;

    fn resize(&mut self, size: RenderSize) -> Result<()>;
    fn render(&mut self) -> Result<()>;
    fn set_camera(&mut self, view: Mat4, projection: Mat4);
    fn set_vsync(&mut self, _on: bool) {}
}
