use glam::Vec2;
use std::time::{Duration, Instant};
use winit::event::{ElementState, MouseButton, MouseScrollDelta, WindowEvent};
use winit::keyboard::{Key, NamedKey};

const DOUBLE_CLICK_WINDOW: Duration = Duration::from_millis(350);
const DOUBLE_CLICK_SLOP_PX: f32 = 6.0;
/// Trackpads report pixels; this brings them near one wheel notch.
const PIXELS_PER_WHEEL_LINE: f32 = 50.0;

pub enum InputEvent {
    Key { key: Key, pressed: bool },
    Wheel { delta: f32 },
    MouseButton { button: MouseButton, pressed: bool },
    CursorPos { x: f32, y: f32 },
    Other,
}

impl InputEvent {
    pub fn from_window_event(ev: &WindowEvent) -> Self {
        match ev {
            WindowEvent::MouseWheel { delta, .. } => {
                let d = match delta {
                    MouseScrollDelta::LineDelta(_, y) => *y,
                    MouseScrollDelta::PixelDelta(p) => p.y as f32 / PIXELS_PER_WHEEL_LINE,
                };
                InputEvent::Wheel { delta: d }
            }
            WindowEvent::CursorMoved { position, .. } => {
                InputEvent::CursorPos { x: position.x as f32, y: position.y as f32 }
            }
            WindowEvent::MouseInput { state, button, .. } => {
                InputEvent::MouseButton { button: *button, pressed: *state == ElementState::Pressed }
            }
            WindowEvent::KeyboardInput { event, .. } => {
                InputEvent::Key { key: event.logical_key.clone(), pressed: event.state == ElementState::Pressed }
            }
            _ => InputEvent::Other,
        }
    }
}

/// What a raw event means to the viewer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ViewerCommand {
    Orbit(Vec2),
    Zoom(f32),
    Activate,
    ToggleWireframe,
    ToggleAutoRotate,
    ResetView,
    Quit,
}

/// Tracks drag and click state between events.
#[derive(Debug, Default)]
pub struct PointerTracker {
    cursor: Option<Vec2>,
    dragging: bool,
    last_click: Option<(Instant, Vec2)>,
}

impl PointerTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn translate(&mut self, event: &InputEvent) -> Option<ViewerCommand> {
        self.translate_at(event, Instant::now())
    }

    fn translate_at(&mut self, event: &InputEvent, now: Instant) -> Option<ViewerCommand> {
        match event {
            InputEvent::CursorPos { x, y } => {
                let position = Vec2::new(*x, *y);
                let previous = self.cursor.replace(position);
                match previous {
                    Some(previous) if self.dragging => Some(ViewerCommand::Orbit(position - previous)),
                    _ => None,
                }
            }
            InputEvent::MouseButton { button: MouseButton::Left, pressed: true } => {
                self.dragging = true;
                let position = self.cursor.unwrap_or(Vec2::ZERO);
                match self.last_click.take() {
                    Some((at, origin))
                        if now.duration_since(at) <= DOUBLE_CLICK_WINDOW
                            && origin.distance(position) <= DOUBLE_CLICK_SLOP_PX =>
                    {
                        Some(ViewerCommand::Activate)
                    }
                    _ => {
                        self.last_click = Some((now, position));
                        None
                    }
                }
            }
            InputEvent::MouseButton { button: MouseButton::Left, pressed: false } => {
                self.dragging = false;
                None
            }
            InputEvent::Wheel { delta } if *delta != 0.0 => Some(ViewerCommand::Zoom(*delta)),
            InputEvent::Key { key, pressed: true } => match key {
                Key::Named(NamedKey::Escape) => Some(ViewerCommand::Quit),
                Key::Character(c) if c.eq_ignore_ascii_case("w") => Some(ViewerCommand::ToggleWireframe),
                Key::Character(c) if c.eq_ignore_ascii_case("a") => Some(ViewerCommand::ToggleAutoRotate),
                Key::Character(c) if c.eq_ignore_ascii_case("r") => Some(ViewerCommand::ResetView),
                _ => None,
            },
            _ => None,
        }
    }
}
