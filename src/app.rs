use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use anyhow::{Context, Result};
use winit::application::ApplicationHandler;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, EventLoop};
use winit::window::WindowId;

use crate::cli::CliOptions;
use crate::config::{AppConfig, WindowConfig, DEFAULT_CONFIG_PATH};
use crate::error::ViewerError;
use crate::input::{InputEvent, PointerTracker, ViewerCommand};
use crate::load_worker::LoadWorker;
#[cfg(feature = "overlay")]
use crate::overlay::{OverlayAction, ViewerOverlay};
use crate::renderer::Renderer;
use crate::session::{AssetDescriptor, InteractionEvent, LoadStatus, ViewerSession, ViewerStatus};
use crate::source::DefaultByteSource;

pub fn run(options: CliOptions) -> Result<()> {
    let config_path = options.config_path.clone().unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let mut config = AppConfig::load_or_default(&config_path);
    let overrides = options.config_overrides();
    if !overrides.is_empty() {
        log::info!("[config] command line overrides: {}", overrides.applied_fields().join(", "));
    }
    config.apply_overrides(&overrides);
    let event_loop = EventLoop::new().context("Failed to create winit event loop")?;
    let mut app = App::new(config, &options);
    event_loop.run_app(&mut app).context("Event loop execution failed")?;
    Ok(())
}

pub struct App {
    config: AppConfig,
    initial_asset: Option<AssetDescriptor>,
    session: Option<ViewerSession<Renderer>>,
    pointer: PointerTracker,
    interactions: Rc<RefCell<Vec<InteractionEvent>>>,
    #[cfg(feature = "overlay")]
    overlay: ViewerOverlay,
    should_close: bool,
}

impl App {
    pub fn new(config: AppConfig, options: &CliOptions) -> Self {
        let initial_asset = options.locator.as_ref().map(|locator| {
            let descriptor = AssetDescriptor::new(locator.clone());
            match &options.format_hint {
                Some(hint) => descriptor.with_format_hint(hint.clone()),
                None => descriptor,
            }
        });
        Self {
            config,
            initial_asset,
            session: None,
            pointer: PointerTracker::new(),
            interactions: Rc::new(RefCell::new(Vec::new())),
            #[cfg(feature = "overlay")]
            overlay: ViewerOverlay::new(),
            should_close: false,
        }
    }

    fn window_config(&self) -> WindowConfig {
        let (width, height) = self.config.surface_size();
        WindowConfig { width, height, ..self.config.window.clone() }
    }

    fn start_session(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let mut renderer = Renderer::new(&self.window_config());
        renderer.ensure_window(event_loop)?;
        let worker = LoadWorker::spawn(Arc::new(DefaultByteSource::default()))?;
        let mut session = ViewerSession::new(&self.config, renderer, worker);
        session.resize(session.backend().size());

        let interactions = Rc::clone(&self.interactions);
        session.set_interaction_handler(move |event| interactions.borrow_mut().push(event));

        #[cfg(feature = "overlay")]
        if let Some(window) = session.backend().window() {
            self.overlay.attach(window);
        }
        if let Some(descriptor) = self.initial_asset.take() {
            if let Err(err) = session.request_asset(descriptor) {
                log::error!("[app] {err}");
            }
        }
        self.session = Some(session);
        Ok(())
    }

    fn apply_command(&mut self, command: ViewerCommand) {
        if command == ViewerCommand::Quit {
            self.should_close = true;
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };
        match command {
            ViewerCommand::Orbit(delta) => session.pointer_drag(delta),
            ViewerCommand::Zoom(delta) => session.scroll(delta),
            ViewerCommand::Activate => session.activate(),
            ViewerCommand::ToggleWireframe => {
                session.toggle_wireframe();
            }
            ViewerCommand::ToggleAutoRotate => {
                session.toggle_auto_rotate();
            }
            ViewerCommand::ResetView => session.reset_view(),
            ViewerCommand::Quit => {}
        }
    }

    #[cfg(feature = "overlay")]
    fn apply_overlay_action(&mut self, action: OverlayAction) {
        match action {
            OverlayAction::ToggleWireframe => self.apply_command(ViewerCommand::ToggleWireframe),
            OverlayAction::ToggleAutoRotate => self.apply_command(ViewerCommand::ToggleAutoRotate),
            OverlayAction::ResetView => self.apply_command(ViewerCommand::ResetView),
            OverlayAction::Download => {
                let Some(session) = self.session.as_ref() else {
                    return;
                };
                let Some(name) = session.current_asset().map(|asset| asset.display_name.clone()) else {
                    return;
                };
                let dest = std::env::current_dir()
                    .map(|dir| dir.join(format!("exported-{name}")))
                    .context("no working directory to export into")
                    .and_then(|dest| session.export_source(&dest));
                if let Err(err) = dest {
                    log::warn!("[app] download failed: {err:#}");
                }
            }
        }
    }

    fn redraw(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.poll();
        for status in session.drain_status() {
            match status {
                ViewerStatus::Idle => log::info!("[app] idle"),
                ViewerStatus::Loading(fraction) => log::debug!("[app] loading {:.0}%", fraction * 100.0),
                ViewerStatus::Ready => log::info!("[app] ready"),
                ViewerStatus::Error(message) => log::error!("[app] {message}"),
            }
        }

        #[cfg(feature = "overlay")]
        {
            let reset = session.backend_mut().take_overlay_reset();
            let (frame, actions) = match session.backend().window() {
                Some(window) => {
                    if reset {
                        self.overlay.reset(window);
                    }
                    self.overlay.run(window, session)
                }
                None => (None, Vec::new()),
            };
            if let Some(frame) = frame {
                session.backend_mut().submit_overlay(frame);
            }
            for action in actions {
                self.apply_overlay_action(action);
            }
        }

        let Some(session) = self.session.as_mut() else {
            return;
        };
        match session.frame() {
            Ok(_) => {}
            Err(ViewerError::RenderContextLost(reason)) => {
                log::warn!("[app] render context lost ({reason}); recovering");
                if let Err(err) = session.recover_render_context() {
                    log::error!("[app] recovery failed: {err}");
                    self.should_close = true;
                }
            }
            Err(err) => log::error!("[app] frame error: {err}"),
        }

        let events: Vec<InteractionEvent> = self.interactions.borrow_mut().drain(..).collect();
        for event in events {
            log::debug!("[app] interaction {event:?}");
            if event == InteractionEvent::Activated {
                session.backend_mut().toggle_fullscreen();
            }
        }
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.session.is_some() {
            return;
        }
        if let Err(err) = self.start_session(event_loop) {
            log::error!("[app] renderer initialization error: {err:#}");
            event_loop.exit();
        }
    }

    fn window_event(&mut self, _el: &ActiveEventLoop, id: WindowId, event: WindowEvent) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let Some(window) = session.backend().window() else {
            return;
        };
        if id != window.id() {
            return;
        }
        #[cfg(feature = "overlay")]
        let consumed = self.overlay.on_window_event(window, &event);
        #[cfg(not(feature = "overlay"))]
        let consumed = false;

        match &event {
            WindowEvent::CloseRequested => self.should_close = true,
            WindowEvent::Resized(size) => session.resize(*size),
            WindowEvent::RedrawRequested => self.redraw(),
            _ if consumed => {}
            _ => {
                if let Some(command) = self.pointer.translate(&InputEvent::from_window_event(&event)) {
                    self.apply_command(command);
                }
            }
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        if self.should_close {
            if let Some(session) = self.session.as_mut() {
                session.dispose();
            }
            event_loop.exit();
            return;
        }
        let Some(session) = self.session.as_ref() else {
            return;
        };
        if matches!(session.status(), LoadStatus::Disposed) {
            return;
        }
        if let Some(window) = session.backend().window() {
            window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(session) = self.session.as_mut() {
            session.dispose();
        }
    }
}
