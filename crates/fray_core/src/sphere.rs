//! Analytic sphere primitive, centered at the object-space origin.

use fray_math::{Interval, Ray, Vec3};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Sphere {
    pub radius: f32,
    /// Index into the material set bound to the instance being rendered.
    pub mat_idx: u16,
}

impl Sphere {
    pub fn new(radius: f32) -> Self {
        Sphere { radius, mat_idx: 0 }
    }

    /// Closest intersection parameter inside `t`, or `None` on a miss.
    /// The ray direction does not need to be normalized.
    pub fn hit(&self, ray: &Ray, t: Interval) -> Option<f32> {
        let oc = ray.origin;
        let a = ray.direction.length_squared();
        let half_b = oc.dot(ray.direction);
        let c = oc.length_squared() - self.radius * self.radius;
        let discriminant = half_b * half_b - a * c;
        if discriminant < 0.0 {
            return None;
        }
        let sqrt_d = discriminant.sqrt();

        let mut root = (-half_b - sqrt_d) / a;
        if !t.surrounds(root) {
            root = (-half_b + sqrt_d) / a;
            if !t.surrounds(root) {
                return None;
            }
        }
        Some(root)
    }

    /// Outward object-space normal at a surface point.
    pub fn normal_at(&self, point: Vec3) -> Vec3 {
        if self.radius != 0.0 {
            point / self.radius
        } else {
            Vec3::Y
        }
    }
}
