//! egui status line and viewer controls drawn over the viewport.

use egui_wgpu::ScreenDescriptor;
use egui_winit::State as EguiWinit;
use winit::event::WindowEvent;
use winit::window::Window;

use crate::render_loop::DrawBackend;
use crate::renderer::OverlayFrame;
use crate::session::{LoadStatus, ViewerSession};

const ERROR_COLOR: egui::Color32 = egui::Color32::from_rgb(232, 96, 84);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayAction {
    ToggleWireframe,
    ToggleAutoRotate,
    ResetView,
    Download,
}

pub struct ViewerOverlay {
    ctx: egui::Context,
    state: Option<EguiWinit>,
}

impl Default for ViewerOverlay {
    fn default() -> Self {
        Self::new()
    }
}

impl ViewerOverlay {
    pub fn new() -> Self {
        Self { ctx: egui::Context::default(), state: None }
    }

    pub fn attach(&mut self, window: &Window) {
        if self.state.is_some() {
            return;
        }
        self.state = Some(EguiWinit::new(
            self.ctx.clone(),
            egui::ViewportId::ROOT,
            window,
            Some(window.scale_factor() as f32),
            window.theme(),
            None,
        ));
    }

    /// Starts over with a fresh context so every texture is sent again.
    pub fn reset(&mut self, window: &Window) {
        self.ctx = egui::Context::default();
        self.state = None;
        self.attach(window);
    }

    /// Returns true when egui consumed the event.
    pub fn on_window_event(&mut self, window: &Window, event: &WindowEvent) -> bool {
        self.state.as_mut().is_some_and(|state| state.on_window_event(window, event).consumed)
    }

    pub fn run<B: DrawBackend>(
        &mut self,
        window: &Window,
        session: &ViewerSession<B>,
    ) -> (Option<OverlayFrame>, Vec<OverlayAction>) {
        let Some(state) = self.state.as_mut() else {
            return (None, Vec::new());
        };
        let raw_input = state.take_egui_input(window);
        let mut actions = Vec::new();
        let full_output = self.ctx.run(raw_input, |ctx| {
            status_panel(ctx, session);
            if session.options().show_controls {
                controls_panel(ctx, session, &mut actions);
            }
        });
        let egui::FullOutput { platform_output, textures_delta, shapes, pixels_per_point, .. } = full_output;
        state.handle_platform_output(window, platform_output);
        let paint_jobs = self.ctx.tessellate(shapes, pixels_per_point);
        let size = window.inner_size();
        let frame = OverlayFrame {
            paint_jobs,
            textures_delta,
            screen: ScreenDescriptor { size_in_pixels: [size.width, size.height], pixels_per_point },
        };
        (Some(frame), actions)
    }
}

fn status_panel<B: DrawBackend>(ctx: &egui::Context, session: &ViewerSession<B>) {
    let name = session.current_asset().map(|asset| asset.display_name.as_str()).unwrap_or("no asset");
    egui::Area::new(egui::Id::new("viewer_status"))
        .anchor(egui::Align2::LEFT_BOTTOM, [12.0, -12.0])
        .show(ctx, |ui| {
            egui::Frame::popup(ui.style()).show(ui, |ui| match session.status() {
                LoadStatus::Loading(fraction) => {
                    ui.label(format!("Loading {name}"));
                    ui.add(egui::ProgressBar::new(*fraction).desired_width(220.0).show_percentage());
                }
                LoadStatus::Ready => {
                    let placeholder = session.loaded_asset().is_some_and(|asset| asset.placeholder);
                    ui.label(name);
                    if placeholder {
                        ui.weak("No preview available for this format");
                    }
                }
                LoadStatus::Error(message) => {
                    ui.colored_label(ERROR_COLOR, message);
                }
                LoadStatus::Idle => {
                    ui.weak("Drop a model path on the command line to view it");
                }
                LoadStatus::Disposed => {}
            });
        });
}

fn controls_panel<B: DrawBackend>(ctx: &egui::Context, session: &ViewerSession<B>, actions: &mut Vec<OverlayAction>) {
    egui::Area::new(egui::Id::new("viewer_controls"))
        .anchor(egui::Align2::RIGHT_TOP, [-12.0, 12.0])
        .show(ctx, |ui| {
            egui::Frame::popup(ui.style()).show(ui, |ui| {
                let mut wireframe = session.wireframe();
                if ui.checkbox(&mut wireframe, "Wireframe (W)").changed() {
                    actions.push(OverlayAction::ToggleWireframe);
                }
                let mut auto_rotate = session.camera().auto_rotate;
                if ui.checkbox(&mut auto_rotate, "Auto-rotate (A)").changed() {
                    actions.push(OverlayAction::ToggleAutoRotate);
                }
                if ui.button("Reset view (R)").clicked() {
                    actions.push(OverlayAction::ResetView);
                }
                if !session.options().prevent_download {
                    let has_source = session.loaded_asset().is_some_and(|asset| asset.source_bytes.is_some());
                    if ui.add_enabled(has_source, egui::Button::new("Download")).clicked() {
                        actions.push(OverlayAction::Download);
                    }
                }
            });
        });
}
