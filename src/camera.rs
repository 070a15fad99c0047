use glam::{Mat4, Vec2, Vec3};
use winit::dpi::PhysicalSize;

use crate::config::CameraConfig;

const DEFAULT_UP: Vec3 = Vec3::Y;
const ELEVATION_LIMIT: f32 = std::f32::consts::FRAC_PI_2 - 0.01;
/// Damping factors are tuned per 60 Hz frame.
const REFERENCE_FRAME_SECONDS: f32 = 1.0 / 60.0;
const SETTLE_EPSILON: f32 = 1e-5;

/// Perspective camera derived from the orbit controller each frame.
#[derive(Debug, Clone)]
pub struct Camera3D {
    pub position: Vec3,
    pub target: Vec3,
    pub up: Vec3,
    pub fov_y_radians: f32,
    pub near: f32,
    pub far: f32,
}

impl Camera3D {
    pub fn new(position: Vec3, target: Vec3, fov_y_radians: f32, near: f32, far: f32) -> Self {
        Self { position, target, up: DEFAULT_UP, fov_y_radians, near, far }
    }

    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_at_rh(self.position, self.target, self.up)
    }

    pub fn projection_matrix(&self, aspect: f32) -> Mat4 {
        Mat4::perspective_rh(self.fov_y_radians, aspect.max(0.0001), self.near, self.far)
    }

    pub fn view_projection(&self, aspect: f32) -> Mat4 {
        self.projection_matrix(aspect) * self.view_matrix()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrbitPose {
    pub azimuth: f32,
    pub elevation: f32,
    pub radius: f32,
    pub target: Vec3,
}

impl OrbitPose {
    fn lerp(&self, goal: &OrbitPose, t: f32) -> OrbitPose {
        OrbitPose {
            azimuth: self.azimuth + (goal.azimuth - self.azimuth) * t,
            elevation: self.elevation + (goal.elevation - self.elevation) * t,
            radius: self.radius + (goal.radius - self.radius) * t,
            target: self.target.lerp(goal.target, t),
        }
    }

    fn is_close_to(&self, other: &OrbitPose) -> bool {
        (self.azimuth - other.azimuth).abs() < SETTLE_EPSILON
            && (self.elevation - other.elevation).abs() < SETTLE_EPSILON
            && (self.radius - other.radius).abs() < SETTLE_EPSILON
            && self.target.distance_squared(other.target) < SETTLE_EPSILON * SETTLE_EPSILON
    }

    /// Y-up spherical coordinates; azimuth 0 looks down -Z from +Z.
    pub fn eye(&self) -> Vec3 {
        let (sin_az, cos_az) = self.azimuth.sin_cos();
        let (sin_el, cos_el) = self.elevation.sin_cos();
        self.target + Vec3::new(cos_el * sin_az, sin_el, cos_el * cos_az) * self.radius
    }
}

/// Orbit controls around a target point. Input moves the goal pose; `update`
/// eases the effective pose toward it (or snaps when damping is off).
#[derive(Debug, Clone)]
pub struct OrbitController {
    current: OrbitPose,
    goal: OrbitPose,
    defaults: OrbitPose,
    min_radius: f32,
    max_radius: f32,
    damping: Option<f32>,
    pub auto_rotate: bool,
    auto_rotate_step: f32,
    rotate_speed: f32,
    zoom_speed: f32,
    fov_y_radians: f32,
    near: f32,
    far: f32,
    aspect: f32,
}

impl OrbitController {
    pub fn new(config: &CameraConfig, auto_rotate: bool) -> Self {
        let min_radius = config.min_radius.max(0.01);
        let max_radius = config.max_radius.max(min_radius);
        let defaults = OrbitPose {
            azimuth: config.default_azimuth_degrees.to_radians(),
            elevation: config.default_elevation_degrees.to_radians().clamp(-ELEVATION_LIMIT, ELEVATION_LIMIT),
            radius: config.default_radius.clamp(min_radius, max_radius),
            target: Vec3::ZERO,
        };
        Self {
            current: defaults,
            goal: defaults,
            defaults,
            min_radius,
            max_radius,
            damping: config.damping_enabled.then_some(config.damping_factor.clamp(0.001, 1.0)),
            auto_rotate,
            auto_rotate_step: config.auto_rotate_speed_degrees.to_radians(),
            rotate_speed: config.rotate_speed,
            zoom_speed: config.zoom_speed,
            fov_y_radians: config.fov_degrees.to_radians(),
            near: config.near,
            far: config.far,
            aspect: 1.0,
        }
    }

    pub fn pose(&self) -> OrbitPose {
        self.current
    }

    pub fn goal(&self) -> OrbitPose {
        self.goal
    }

    pub fn radius_limits(&self) -> (f32, f32) {
        (self.min_radius, self.max_radius)
    }

    pub fn aspect(&self) -> f32 {
        self.aspect
    }

    /// Pixel deltas from a pointer drag. Dragging right orbits the camera left
    /// around the target, dragging down raises it.
    pub fn pointer_drag(&mut self, delta: Vec2) {
        self.goal.azimuth -= delta.x * self.rotate_speed;
        self.goal.elevation = (self.goal.elevation + delta.y * self.rotate_speed).clamp(-ELEVATION_LIMIT, ELEVATION_LIMIT);
    }

    /// Positive deltas (wheel up) zoom in.
    pub fn scroll(&mut self, delta: f32) {
        let factor = (-delta * self.zoom_speed).exp();
        self.goal.radius = (self.goal.radius * factor).clamp(self.min_radius, self.max_radius);
    }

    pub fn set_target(&mut self, target: Vec3) {
        self.goal.target = target;
    }

    /// Restores the default pose in one step, bypassing damping.
    pub fn reset(&mut self) {
        self.goal = self.defaults;
        self.current = self.defaults;
    }

    pub fn resize(&mut self, size: PhysicalSize<u32>) {
        if size.width > 0 && size.height > 0 {
            self.aspect = size.width as f32 / size.height as f32;
        }
    }

    /// Advances one frame. Auto-rotate adds a fixed azimuth step per frame.
    pub fn update(&mut self, dt_seconds: f32) {
        if self.auto_rotate {
            self.goal.azimuth += self.auto_rotate_step;
        }
        match self.damping {
            Some(factor) if dt_seconds > 0.0 => {
                let frames = dt_seconds / REFERENCE_FRAME_SECONDS;
                let t = 1.0 - (1.0 - factor).powf(frames);
                self.current = self.current.lerp(&self.goal, t.clamp(0.0, 1.0));
                if self.current.is_close_to(&self.goal) {
                    self.current = self.goal;
                }
            }
            Some(_) => {}
            None => self.current = self.goal,
        }
    }

    pub fn camera(&self) -> Camera3D {
        Camera3D::new(self.current.eye(), self.current.target, self.fov_y_radians, self.near, self.far)
    }

    pub fn view_projection(&self) -> Mat4 {
        self.camera().view_projection(self.aspect)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(damping: bool) -> OrbitController {
        let config = CameraConfig { damping_enabled: damping, ..CameraConfig::default() };
        OrbitController::new(&config, false)
    }

    #[test]
    fn view_projection_is_finite() {
        let mut orbit = controller(true);
        orbit.resize(PhysicalSize::new(1280, 720));
        let vp = orbit.view_projection();
        assert!(!vp.to_cols_array().iter().any(|v| v.is_nan() || v.is_infinite()));
    }

    #[test]
    fn scroll_respects_radius_limits() {
        let mut orbit = controller(false);
        let (min, max) = orbit.radius_limits();
        for _ in 0..500 {
            orbit.scroll(10.0);
        }
        orbit.update(0.016);
        assert!((orbit.pose().radius - min).abs() < 1e-5);
        for _ in 0..500 {
            orbit.scroll(-10.0);
        }
        orbit.update(0.016);
        assert!((orbit.pose().radius - max).abs() < 1e-3);
    }

    #[test]
    fn damping_eases_instead_of_snapping() {
        let mut orbit = controller(true);
        let start = orbit.pose().azimuth;
        orbit.pointer_drag(Vec2::new(-200.0, 0.0));
        let goal = orbit.goal().azimuth;
        orbit.update(1.0 / 60.0);
        let after_one = orbit.pose().azimuth;
        assert!(after_one > start && after_one < goal, "start={start} one={after_one} goal={goal}");
        for _ in 0..2000 {
            orbit.update(1.0 / 60.0);
        }
        assert_eq!(orbit.pose().azimuth, goal);
    }

    #[test]
    fn damping_is_frame_rate_independent() {
        let mut fast = controller(true);
        let mut slow = controller(true);
        fast.scroll(3.0);
        slow.scroll(3.0);
        for _ in 0..4 {
            fast.update(1.0 / 120.0);
        }
        slow.update(4.0 / 120.0);
        assert!((fast.pose().radius - slow.pose().radius).abs() < 1e-4);
    }

    #[test]
    fn without_damping_input_applies_immediately() {
        let mut orbit = controller(false);
        orbit.pointer_drag(Vec2::new(0.0, 50.0));
        orbit.update(0.016);
        assert_eq!(orbit.pose(), orbit.goal());
    }

    #[test]
    fn elevation_is_clamped_short_of_the_poles() {
        let mut orbit = controller(false);
        orbit.pointer_drag(Vec2::new(0.0, 1.0e6));
        orbit.update(0.016);
        assert!(orbit.pose().elevation < std::f32::consts::FRAC_PI_2);
        assert!(orbit.camera().position.is_finite());
    }

    #[test]
    fn auto_rotate_adds_a_constant_step_per_frame() {
        let config = CameraConfig { damping_enabled: false, ..CameraConfig::default() };
        let mut orbit = OrbitController::new(&config, true);
        let a0 = orbit.pose().azimuth;
        orbit.update(0.016);
        let a1 = orbit.pose().azimuth;
        orbit.update(0.5);
        let a2 = orbit.pose().azimuth;
        let step = config.auto_rotate_speed_degrees.to_radians();
        assert!((a1 - a0 - step).abs() < 1e-6);
        assert!((a2 - a1 - step).abs() < 1e-6);
    }

    #[test]
    fn reset_restores_defaults_in_one_step() {
        let mut orbit = controller(true);
        let defaults = orbit.pose();
        orbit.pointer_drag(Vec2::new(100.0, -40.0));
        orbit.scroll(2.0);
        orbit.set_target(Vec3::ONE);
        orbit.update(0.016);
        orbit.reset();
        assert_eq!(orbit.pose(), defaults);
        assert_eq!(orbit.goal(), defaults);
    }
}
