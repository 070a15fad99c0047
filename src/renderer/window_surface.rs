use crate::config::WindowConfig;
use crate::error::{ViewerError, ViewerResult};
use anyhow::{Context, Result};
use std::sync::Arc;
use winit::dpi::PhysicalSize;
use winit::event_loop::ActiveEventLoop;
use winit::window::{Fullscreen, Window};

use super::DEPTH_FORMAT;

const DEFAULT_PRESENT_MODES: [wgpu::PresentMode; 1] = [wgpu::PresentMode::Fifo];

#[derive(Debug)]
pub struct SurfaceFrame {
    view: wgpu::TextureView,
    surface: wgpu::SurfaceTexture,
}

impl SurfaceFrame {
    fn new(surface: wgpu::SurfaceTexture) -> Self {
        let view = surface.texture.create_view(&wgpu::TextureViewDescriptor::default());
        Self { view, surface }
    }

    pub fn view(&self) -> &wgpu::TextureView {
        &self.view
    }

    pub fn present(self) {
        self.surface.present();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SurfaceErrorAction {
    Reconfigure,
    SkipFrame,
    ContextLost,
}

/// Window, surface and device. Everything GPU-side is `None` until the event
/// loop resumes and a window exists.
pub struct WindowSurface {
    instance: Option<wgpu::Instance>,
    surface: Option<wgpu::Surface<'static>>,
    adapter: Option<wgpu::Adapter>,
    device: Option<wgpu::Device>,
    queue: Option<wgpu::Queue>,
    config: Option<wgpu::SurfaceConfiguration>,
    size: PhysicalSize<u32>,
    window: Option<Arc<Window>>,
    title: String,
    vsync: bool,
    fullscreen: bool,
    depth_texture: Option<wgpu::Texture>,
    depth_view: Option<wgpu::TextureView>,
    present_modes: Vec<wgpu::PresentMode>,
    #[cfg(test)]
    resize_invocations: usize,
}

impl WindowSurface {
    pub fn new(window_cfg: &WindowConfig) -> Self {
        Self {
            instance: None,
            surface: None,
            adapter: None,
            device: None,
            queue: None,
            config: None,
            size: PhysicalSize::new(window_cfg.width.max(1), window_cfg.height.max(1)),
            window: None,
            title: window_cfg.title.clone(),
            vsync: window_cfg.vsync,
            fullscreen: window_cfg.fullscreen,
            depth_texture: None,
            depth_view: None,
            present_modes: Vec::new(),
            #[cfg(test)]
            resize_invocations: 0,
        }
    }

    pub fn ensure_window(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        if self.window.is_some() {
            return Ok(());
        }
        let mut attrs = Window::default_attributes().with_title(self.title.clone()).with_inner_size(self.size);
        if self.fullscreen {
            attrs = attrs.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }
        let window = Arc::new(event_loop.create_window(attrs).context("Failed to create window")?);
        pollster::block_on(self.init_wgpu(&window))?;
        self.window = Some(window);
        Ok(())
    }

    pub fn device_and_queue(&self) -> Result<(&wgpu::Device, &wgpu::Queue)> {
        Ok((self.device()?, self.queue()?))
    }

    pub fn device(&self) -> Result<&wgpu::Device> {
        self.device.as_ref().context("GPU device not initialized")
    }

    pub fn queue(&self) -> Result<&wgpu::Queue> {
        self.queue.as_ref().context("GPU queue not initialized")
    }

    pub fn depth_view(&self) -> Result<&wgpu::TextureView> {
        self.depth_view.as_ref().context("Depth texture missing")
    }

    pub fn surface_format(&self) -> Result<wgpu::TextureFormat> {
        Ok(self.config.as_ref().context("Surface configuration missing")?.format)
    }

    pub fn size(&self) -> PhysicalSize<u32> {
        self.size
    }

    pub fn window(&self) -> Option<&Window> {
        self.window.as_deref()
    }

    pub fn toggle_fullscreen(&mut self) {
        self.fullscreen = !self.fullscreen;
        if let Some(window) = self.window.as_ref() {
            window.set_fullscreen(self.fullscreen.then_some(Fullscreen::Borderless(None)));
        }
    }

    pub fn resize(&mut self, new_size: PhysicalSize<u32>) {
        self.size = new_size;
        #[cfg(test)]
        {
            self.resize_invocations = self.resize_invocations.saturating_add(1);
        }
        if new_size.width > 0 && new_size.height > 0 {
            if let Some(config) = self.config.as_mut() {
                config.width = new_size.width;
                config.height = new_size.height;
                if let Err(err) = self.configure_surface() {
                    log::warn!("[render] surface resize failed: {err:#}");
                }
            }
            if self.device.is_some() {
                if let Err(err) = self.recreate_depth_texture() {
                    log::warn!("[render] depth texture resize failed: {err:#}");
                }
            }
        }
    }

    /// `Ok(None)` means skip this frame and try again on the next one.
    pub fn acquire_surface_frame(&mut self) -> ViewerResult<Option<SurfaceFrame>> {
        let surface = self
            .surface
            .as_ref()
            .ok_or_else(|| ViewerError::RenderContextLost("surface not initialized".into()))?;
        match surface.get_current_texture() {
            Ok(frame) => Ok(Some(SurfaceFrame::new(frame))),
            Err(err) => self.handle_surface_error(&err).map(|()| None),
        }
    }

    fn handle_surface_error(&mut self, error: &wgpu::SurfaceError) -> ViewerResult<()> {
        match Self::surface_error_action(error) {
            SurfaceErrorAction::Reconfigure => {
                log::debug!("[render] surface {error}; reconfiguring");
                self.resize(self.size);
                Ok(())
            }
            SurfaceErrorAction::SkipFrame => Ok(()),
            SurfaceErrorAction::ContextLost => Err(ViewerError::RenderContextLost(error.to_string())),
        }
    }

    /// Drops the device and everything created from it, then builds a fresh
    /// one against the existing window.
    pub fn reacquire(&mut self) -> Result<()> {
        let window = self.window.clone().context("no window to reacquire a context for")?;
        self.surface = None;
        self.depth_view = None;
        self.depth_texture = None;
        self.queue = None;
        self.device = None;
        self.adapter = None;
        self.config = None;
        pollster::block_on(self.init_wgpu(&window))
    }

    fn configure_surface(&mut self) -> Result<()> {
        let surface = self.surface.as_ref().context("Surface not initialized")?;
        let device = self.device.as_ref().context("GPU device not initialized")?;
        let config = self.config.as_mut().context("Surface configuration missing")?;
        surface.configure(device, config);
        Ok(())
    }

    fn recreate_depth_texture(&mut self) -> Result<()> {
        let device = self.device.as_ref().context("GPU device not initialized")?;
        let (depth_texture, depth_view) = create_depth_texture(device, self.size);
        self.depth_texture = Some(depth_texture);
        self.depth_view = Some(depth_view);
        Ok(())
    }

    fn select_present_mode(&self, modes: &[wgpu::PresentMode]) -> wgpu::PresentMode {
        if self.vsync {
            wgpu::PresentMode::Fifo
        } else {
            modes.iter().copied().find(|mode| *mode != wgpu::PresentMode::Fifo).unwrap_or(wgpu::PresentMode::Fifo)
        }
    }

    fn choose_surface_format(formats: &[wgpu::TextureFormat]) -> Option<wgpu::TextureFormat> {
        formats.iter().copied().find(|f| f.is_srgb()).or_else(|| formats.first().copied())
    }

    async fn init_wgpu(&mut self, window: &Arc<Window>) -> Result<()> {
        let instance = self.instance.get_or_insert_with(wgpu::Instance::default);
        let surface = instance.create_surface(window.clone()).context("Failed to create WGPU surface")?;
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: Some(&surface),
                force_fallback_adapter: false,
            })
            .await
            .context("Failed to request WGPU adapter")?;
        let device_desc = wgpu::DeviceDescriptor {
            label: Some("Viewer Device"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::downlevel_defaults().using_resolution(adapter.limits()),
            experimental_features: wgpu::ExperimentalFeatures::default(),
            memory_hints: wgpu::MemoryHints::default(),
            trace: wgpu::Trace::default(),
        };
        let (device, queue) = adapter.request_device(&device_desc).await.context("Failed to request WGPU device")?;

        let caps = surface.get_capabilities(&adapter);
        let format = Self::choose_surface_format(&caps.formats).context("surface reports no formats")?;
        let alpha_mode = caps.alpha_modes.first().copied().unwrap_or(wgpu::CompositeAlphaMode::Auto);
        let present_modes =
            if caps.present_modes.is_empty() { DEFAULT_PRESENT_MODES.to_vec() } else { caps.present_modes.clone() };
        let size = window.inner_size();
        if size.width > 0 && size.height > 0 {
            self.size = size;
        }
        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format,
            width: self.size.width,
            height: self.size.height,
            present_mode: self.select_present_mode(&present_modes),
            alpha_mode,
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(&device, &config);
        let (depth_texture, depth_view) = create_depth_texture(&device, self.size);
        log::info!(
            "[render] {} ({:?}) surface {:?} {}x{}",
            adapter.get_info().name,
            adapter.get_info().backend,
            format,
            self.size.width,
            self.size.height
        );

        self.surface = Some(surface);
        self.adapter = Some(adapter);
        self.device = Some(device);
        self.queue = Some(queue);
        self.config = Some(config);
        self.depth_texture = Some(depth_texture);
        self.depth_view = Some(depth_view);
        self.present_modes = present_modes;
        Ok(())
    }

    fn surface_error_action(error: &wgpu::SurfaceError) -> SurfaceErrorAction {
        match error {
            wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated => SurfaceErrorAction::Reconfigure,
            wgpu::SurfaceError::Timeout => SurfaceErrorAction::SkipFrame,
            wgpu::SurfaceError::OutOfMemory | wgpu::SurfaceError::Other => SurfaceErrorAction::ContextLost,
        }
    }

    #[cfg(test)]
    fn resize_invocations_for_test(&self) -> usize {
        self.resize_invocations
    }
}

fn create_depth_texture(device: &wgpu::Device, size: PhysicalSize<u32>) -> (wgpu::Texture, wgpu::TextureView) {
    let extent = wgpu::Extent3d { width: size.width.max(1), height: size.height.max(1), depth_or_array_layers: 1 };
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some("Depth Texture"),
        size: extent,
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: DEPTH_FORMAT,
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
        view_formats: &[],
    });
    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
    (texture, view)
}
