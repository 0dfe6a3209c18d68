// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use strata_core::{init_tracing, DEFAULT_FILTER};
use strata_math::glam::{Mat4, Vec3};
use strata_math::GpuInstance;
use strata_render::{RenderSize, Renderer};
use strata_render_vk::{NoUi, VkRenderer};
use tracing::{error, info};

use strata_platform::winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    raw_window_handle::{HasDisplayHandle, HasWindowHandle},
    window::{Window, WindowId},
};

mod config;

use config::{load_cfg, AppCfg};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file; missing means defaults
    #[arg(long, default_value = "strata.toml")]
    config: PathBuf,
    /// Directory of compiled SPIR-V, overrides the config file
    #[arg(long)]
    shader_dir: Option<PathBuf>,
    /// Number of instances to place in a grid
    #[arg(long)]
    instances: Option<u32>,
}

/// Unit-spaced square grid in the XZ plane, all using mesh and material 0.
fn instance_grid(count: u32) -> Vec<GpuInstance> {
    let side = (count as f32).sqrt().ceil().max(1.0) as u32;
    (0..count)
        .map(|i| {
            let x = (i % side) as f32 - side as f32 / 2.0;
            let z = (i / side) as f32 - side as f32 / 2.0;
            GpuInstance {
                transform: Mat4::from_translation(Vec3::new(x * 2.0, 0.0, z * 2.0)),
                mesh_index: 0,
                material_index: 0,
                _pad: [0; 2],
            }
        })
        .collect()
}

/// Reverse-Z: near maps to 1, infinity to 0.
fn camera(size: RenderSize) -> (Mat4, Mat4) {
    let aspect = size.width.max(1) as f32 / size.height.max(1) as f32;
    let view = Mat4::look_at_rh(Vec3::new(0.0, 8.0, 16.0), Vec3::ZERO, Vec3::Y);
    let projection = Mat4::perspective_infinite_reverse_rh(60f32.to_radians(), aspect, 0.1);
    (view, projection)
}

struct App {
    cfg: AppCfg,
    instances: Vec<GpuInstance>,
    window: Option<Window>,
    renderer: Option<Box<VkRenderer>>,
    render_size: RenderSize,
    init_error: Option<anyhow::Error>,

    exiting: bool,
    frames: u32,
    last_fps_instant: Instant,

    paused: bool,
    focused: bool,
    next_frame_deadline: Option<Instant>,
}

impl App {
    fn init_renderer(&self, window: &Window) -> Result<Box<VkRenderer>> {
        let wh = window.window_handle().context("window_handle")?;
        let dh = window.display_handle().context("display_handle")?;
        let mut renderer = Box::new(VkRenderer::with_config(
            &wh,
            &dh,
            self.render_size,
            self.cfg.renderer(),
            Box::new(NoUi),
        )?);
        renderer.write_instances(&self.instances)?;
        let (view, projection) = camera(self.render_size);
        renderer.set_camera(view, projection);
        Ok(renderer)
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, e: anyhow::Error) {
        error!("{e:#}");
        self.init_error = Some(e);
        self.exiting = true;
        self.renderer = None;
        self.window = None;
        event_loop.exit();
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_none() {
            let window = match event_loop
                .create_window(Window::default_attributes().with_title("strata"))
                .context("create_window")
            {
                Ok(w) => w,
                Err(e) => return self.fail(event_loop, e),
            };

            let size = window.inner_size();
            self.render_size = RenderSize {
                width: size.width.max(1),
                height: size.height.max(1),
            };

            match self.init_renderer(&window) {
                Ok(renderer) => self.renderer = Some(renderer),
                Err(e) => return self.fail(event_loop, e.context("renderer init")),
            }
            info!(
                vsync = self.cfg.render.vsync,
                mode = ?self.cfg.render.vsync_mode,
                instances = self.instances.len(),
                "renderer up"
            );
            self.window = Some(window);
        }

        event_loop.set_control_flow(if self.cfg.render.vsync {
            ControlFlow::Wait
        } else {
            ControlFlow::Poll
        });

        self.paused = self.render_size.is_empty();
        if !self.paused {
            if let Some(w) = &self.window {
                w.request_redraw();
            }
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        window_id: WindowId,
        event: WindowEvent,
    ) {
        if let Some(window) = &self.window {
            if window_id != window.id() {
                return;
            }
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("CloseRequested");
                self.exiting = true;
                self.renderer = None;
                self.window = None;
                event_loop.exit();
            }

            WindowEvent::Resized(new_size) => {
                self.render_size = RenderSize {
                    width: new_size.width,
                    height: new_size.height,
                };
                self.paused = self.render_size.is_empty();
                info!(
                    "Resized → {}x{} (paused={})",
                    self.render_size.width, self.render_size.height, self.paused
                );

                if let Some(renderer) = &mut self.renderer {
                    if let Err(e) = renderer.resize(self.render_size) {
                        error!("resize failed: {e:#}");
                    }
                    if !self.paused {
                        let (view, projection) = camera(self.render_size);
                        renderer.set_camera(view, projection);
                    }
                }
                if !self.paused {
                    if let Some(w) = &self.window {
                        w.request_redraw();
                    }
                }
            }

            WindowEvent::Occluded(occluded) => {
                self.paused = occluded || self.render_size.is_empty();
                info!("Occluded={} → paused={}", occluded, self.paused);
            }

            WindowEvent::Focused(focused) => {
                if self.focused != focused {
                    self.focused = focused;
                    info!("Focused({})", focused);
                    if focused {
                        self.next_frame_deadline = None;
                    }
                }
            }

            WindowEvent::RedrawRequested => {
                if self.exiting || self.paused {
                    return;
                }
                if let Some(renderer) = &mut self.renderer {
                    match renderer.render() {
                        Ok(()) => self.frames = self.frames.saturating_add(1),
                        Err(e) => error!("render error: {e:#}"),
                    }
                }
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        if self.exiting {
            return;
        }
        if self.paused {
            event_loop.set_control_flow(ControlFlow::Wait);
            self.frames = 0;
            return;
        }

        let target_fps = if self.focused {
            0
        } else {
            self.cfg.render.unfocused_fps
        };

        if target_fps == 0 {
            event_loop.set_control_flow(if self.cfg.render.vsync {
                ControlFlow::Wait
            } else {
                ControlFlow::Poll
            });
            if let Some(w) = &self.window {
                w.request_redraw();
            }
        } else {
            let now = Instant::now();
            match self.next_frame_deadline {
                Some(deadline) if now < deadline => {
                    event_loop.set_control_flow(ControlFlow::WaitUntil(deadline));
                }
                _ => {
                    let next = now + Duration::from_nanos(1_000_000_000 / u64::from(target_fps));
                    self.next_frame_deadline = Some(next);
                    event_loop.set_control_flow(ControlFlow::WaitUntil(next));
                    if let Some(w) = &self.window {
                        w.request_redraw();
                    }
                }
            }
        }

        let now = Instant::now();
        if now.duration_since(self.last_fps_instant).as_secs_f32() >= 1.0 {
            info!("fps ~ {}", self.frames);
            self.frames = 0;
            self.last_fps_instant = now;
        }
    }
}

fn main() -> Result<()> {
    init_tracing(DEFAULT_FILTER);
    let args = Args::parse();

    let mut cfg = load_cfg(&args.config);
    if let Some(dir) = args.shader_dir {
        cfg.render.shader_dir = dir;
    }
    let instance_count = args
        .instances
        .unwrap_or(0)
        .min(cfg.render.instance_capacity);

    let event_loop: EventLoop<()> = EventLoop::new()?;
    let mut app = App {
        instances: instance_grid(instance_count),
        cfg,
        window: None,
        renderer: None,
        render_size: RenderSize {
            width: 1,
            height: 1,
        },
        init_error: None,
        exiting: false,
        frames: 0,
        last_fps_instant: Instant::now(),
        paused: false,
        focused: true,
        next_frame_deadline: None,
    };

    event_loop.run_app(&mut app)?;
    match app.init_error.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_places_every_instance_once() {
        let grid = instance_grid(10);
        assert_eq!(grid.len(), 10);
        let mut origins: Vec<_> = grid
            .iter()
            .map(|g| g.transform.w_axis.truncate().to_array().map(|c| c as i32))
            .collect();
        origins.sort();
        origins.dedup();
        assert_eq!(origins.len(), 10);
        assert!(instance_grid(0).is_empty());
    }

    #[test]
    fn camera_uses_reverse_z() {
        let (view, projection) = camera(RenderSize {
            width: 1600,
            height: 900,
        });
        let near = projection.project_point3(view.transform_point3(Vec3::new(0.0, 8.0, 15.9)));
        let far = projection.project_point3(view.transform_point3(Vec3::new(0.0, 0.0, -500.0)));
        assert!(near.z > far.z);
        assert!(far.z > 0.0 && far.z < 0.01);
    }
}
