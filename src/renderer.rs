//! wgpu drawing backend: one opaque mesh pass and, with the `overlay`
//! feature, an egui pass on top.

mod mesh_pass;
mod window_surface;

#[cfg(feature = "overlay")]
mod egui_pass;

use anyhow::Result;
use winit::dpi::PhysicalSize;
use winit::event_loop::ActiveEventLoop;
use winit::window::Window;

use crate::config::WindowConfig;
use crate::error::{ViewerError, ViewerResult};
use crate::geometry::{GeometryId, MaterialId};
use crate::render_loop::{DrawBackend, FrameInput};
use mesh_pass::MeshPass;

#[cfg(feature = "overlay")]
pub use egui_pass::OverlayFrame;
pub use window_surface::{SurfaceFrame, WindowSurface};

pub const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;

pub struct Renderer {
    surface: WindowSurface,
    mesh_pass: MeshPass,
    #[cfg(feature = "overlay")]
    egui_renderer: Option<egui_wgpu::Renderer>,
    #[cfg(feature = "overlay")]
    pending_overlay: Option<OverlayFrame>,
    #[cfg(feature = "overlay")]
    overlay_reset: bool,
}

impl Renderer {
    pub fn new(window_cfg: &WindowConfig) -> Self {
        Self {
            surface: WindowSurface::new(window_cfg),
            mesh_pass: MeshPass::new(),
            #[cfg(feature = "overlay")]
            egui_renderer: None,
            #[cfg(feature = "overlay")]
            pending_overlay: None,
            #[cfg(feature = "overlay")]
            overlay_reset: false,
        }
    }

    pub fn ensure_window(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        self.surface.ensure_window(event_loop)
    }

    pub fn window(&self) -> Option<&Window> {
        self.surface.window()
    }

    pub fn size(&self) -> PhysicalSize<u32> {
        self.surface.size()
    }

    pub fn toggle_fullscreen(&mut self) {
        self.surface.toggle_fullscreen();
    }

    pub fn resident_meshes(&self) -> usize {
        self.mesh_pass.resident_meshes()
    }

    /// Queues overlay output for the next `draw_frame`. Only the latest
    /// submission is kept.
    #[cfg(feature = "overlay")]
    pub fn submit_overlay(&mut self, overlay: OverlayFrame) {
        self.pending_overlay = Some(overlay);
    }

    /// True once after the device was replaced; overlay textures must be
    /// uploaded again from scratch.
    #[cfg(feature = "overlay")]
    pub fn take_overlay_reset(&mut self) -> bool {
        std::mem::take(&mut self.overlay_reset)
    }

    fn render(&mut self, frame: &FrameInput<'_>, target: SurfaceFrame) -> Result<()> {
        let format = self.surface.surface_format()?;
        let (device, queue) = self.surface.device_and_queue()?;
        self.mesh_pass.ensure_pipeline(device, format);
        self.mesh_pass.prepare(device, queue, frame)?;
        let depth_view = self.surface.depth_view()?;

        let [r, g, b, a] = frame.background;
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("Frame Encoder") });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Mesh Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: target.view(),
                    depth_slice: None,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color {
                            r: f64::from(r),
                            g: f64::from(g),
                            b: f64::from(b),
                            a: f64::from(a),
                        }),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                    view: depth_view,
                    depth_ops: Some(wgpu::Operations { load: wgpu::LoadOp::Clear(1.0), store: wgpu::StoreOp::Store }),
                    stencil_ops: None,
                }),
                occlusion_query_set: None,
                timestamp_writes: None,
            });
            self.mesh_pass.encode(&mut pass, frame);
        }
        queue.submit(std::iter::once(encoder.finish()));

        #[cfg(feature = "overlay")]
        if let Some(overlay) = self.pending_overlay.take() {
            let painter = self
                .egui_renderer
                .get_or_insert_with(|| egui_wgpu::Renderer::new(device, format, egui_wgpu::RendererOptions::default()));
            egui_pass::render(device, queue, painter, &overlay, target.view());
        }
        target.present();
        Ok(())
    }
}

impl DrawBackend for Renderer {
    fn draw_frame(&mut self, frame: &FrameInput<'_>) -> ViewerResult<()> {
        let Some(target) = self.surface.acquire_surface_frame()? else {
            return Ok(());
        };
        self.render(frame, target).map_err(|err| ViewerError::RenderContextLost(format!("{err:#}")))
    }

    fn release_geometry(&mut self, geometry: GeometryId) {
        if self.mesh_pass.release_geometry(geometry) {
            log::trace!("[render] released geometry {}", geometry.raw());
        }
    }

    fn release_material(&mut self, material: MaterialId) {
        self.mesh_pass.release_material(material);
    }

    fn resize(&mut self, size: PhysicalSize<u32>) {
        self.surface.resize(size);
    }

    fn reacquire(&mut self) -> ViewerResult<()> {
        self.mesh_pass.clear();
        #[cfg(feature = "overlay")]
        {
            self.egui_renderer = None;
            self.pending_overlay = None;
            self.overlay_reset = true;
        }
        self.surface.reacquire().map_err(|err| ViewerError::RenderContextLost(format!("{err:#}")))?;
        log::info!("[render] drawing context re-acquired");
        Ok(())
    }
}
