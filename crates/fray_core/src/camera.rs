//! Pinhole / thin-lens camera.
//!
//! Pose and optics are cached: after mutating the public fields, call
//! [`Camera::initialize`] (or go through `Scene::update_camera`, which does it
//! for you) to refresh the derived basis vectors and sensor size.

use fray_math::{EulerRot, Quat, Ray, Vec2, Vec3};
use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EulerAngles {
    pub roll: f32,
    pub pitch: f32,
    pub yaw: f32,
}

impl EulerAngles {
    pub fn new(roll: f32, pitch: f32, yaw: f32) -> Self {
        EulerAngles { roll, pitch, yaw }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Camera {
    /// Horizontal field of view in degrees.
    pub fov: f32,
    pub focus_distance: f32,
    /// f-number of the lens. Zero or negative disables depth of field.
    pub fstops: f32,
    pub width: u32,
    pub height: u32,
    pub position: Vec3,
    pub orientation: EulerAngles,
    /// Shutter time, reserved for motion blur.
    pub time: f32,
    /// Cameras exported from Blender look down their local -Z axis.
    pub blender_convention: bool,

    // Derived state, refreshed by initialize().
    forward: Vec3,
    right: Vec3,
    up: Vec3,
    sensor: Vec2,
    aperture: f32,
}

impl Default for Camera {
    fn default() -> Self {
        let mut cam = Camera {
            fov: 80.0,
            focus_distance: 10.0,
            fstops: 0.0,
            width: 1280,
            height: 800,
            position: Vec3::ZERO,
            orientation: EulerAngles::default(),
            time: 0.0,
            blender_convention: false,
            forward: Vec3::Z,
            right: Vec3::X,
            up: Vec3::Y,
            sensor: Vec2::ZERO,
            aperture: 0.0,
        };
        cam.initialize();
        cam
    }
}

impl Camera {
    pub fn new() -> Self {
        Camera::default()
    }

    /// Refresh both the pose basis and the sensor geometry.
    pub fn initialize(&mut self) {
        self.update_pose();
        self.recompute_optics();
    }

    /// Rebuild the camera basis vectors from the Euler orientation.
    pub fn update_pose(&mut self) {
        let rotation = Quat::from_euler(
            EulerRot::YXZ,
            self.orientation.yaw,
            self.orientation.pitch,
            self.orientation.roll,
        );
        let (forward, right) = if self.blender_convention {
            (-Vec3::Z, -Vec3::X)
        } else {
            (Vec3::Z, Vec3::X)
        };
        self.forward = rotation * forward;
        self.right = rotation * right;
        self.up = rotation * Vec3::Y;
    }

    /// Rebuild the sensor extents and aperture from fov, resolution and lens
    /// settings. Must be called whenever the resolution changes.
    pub fn recompute_optics(&mut self) {
        let aspect = self.width.max(1) as f32 / self.height.max(1) as f32;
        let sensor_x = 2.0 * (0.5 * self.fov.to_radians()).tan();
        self.sensor = Vec2::new(sensor_x, sensor_x / aspect);
        self.aperture = if self.fstops > 0.0 {
            0.5 * (self.focus_distance / self.fstops)
        } else {
            0.0
        };
    }

    pub fn forward(&self) -> Vec3 {
        self.forward
    }

    /// Jittered primary ray through pixel `(x, y)`.
    pub fn primary_ray<R: Rng + ?Sized>(&self, x: u32, y: u32, rng: &mut R) -> Ray {
        let jx: f32 = rng.gen::<f32>() - 0.5;
        let jy: f32 = rng.gen::<f32>() - 0.5;
        let u = 2.0 * ((x as f32 + 0.5 + jx) / self.width as f32) - 1.0;
        let v = 1.0 - 2.0 * ((y as f32 + 0.5 + jy) / self.height as f32);

        let target =
            self.forward + 0.5 * u * self.sensor.x * self.right + 0.5 * v * self.sensor.y * self.up;
        let mut origin = self.position;
        let mut direction = target.normalize();

        if self.aperture > 0.0 {
            let focus_point = origin + direction * self.focus_distance;
            let lens = self.aperture * random_in_unit_disk(rng);
            origin += lens.x * self.right + lens.y * self.up;
            direction = (focus_point - origin).normalize();
        }
        Ray::new(origin, direction)
    }
}

fn random_in_unit_disk<R: Rng + ?Sized>(rng: &mut R) -> Vec2 {
    loop {
        let p = Vec2::new(rng.gen::<f32>() * 2.0 - 1.0, rng.gen::<f32>() * 2.0 - 1.0);
        if p.length_squared() < 1.0 {
            return p;
        }
    }
}
