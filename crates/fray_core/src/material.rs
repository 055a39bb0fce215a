//! Materials and environment lighting.
//!
//! Materials are plain data here; the scatter logic that consumes them lives
//! with the integrator. Keeping them as a serializable enum lets whole sets
//! travel to render nodes along with the rest of the scene.

use fray_math::Vec3;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Material {
    Diffuse { color: Vec3 },
    Metal { color: Vec3, roughness: f32 },
    Glass { color: Vec3, ior: f32 },
    Emissive { color: Vec3, strength: f32 },
}

impl Material {
    /// Placeholder assigned when a face or sphere references a material slot
    /// that does not exist.
    pub fn default_gray() -> Self {
        Material::Diffuse {
            color: Vec3::splat(0.5),
        }
    }

    pub fn is_emissive(&self) -> bool {
        matches!(self, Material::Emissive { .. })
    }
}

impl Default for Material {
    fn default() -> Self {
        Material::default_gray()
    }
}

/// An ordered list of materials an instance binds to. Face and sphere
/// `mat_idx` values index into the set bound to their instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MaterialSet {
    pub materials: Vec<Material>,
}

impl MaterialSet {
    pub fn new() -> Self {
        MaterialSet::default()
    }

    pub fn add(&mut self, material: Material) -> usize {
        self.materials.push(material);
        self.materials.len() - 1
    }

    pub fn get(&self, idx: usize) -> Option<&Material> {
        self.materials.get(idx)
    }

    pub fn len(&self) -> usize {
        self.materials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.materials.is_empty()
    }
}

/// What a ray sees when it escapes the scene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Background {
    /// Uniform environment color scaled by `strength`.
    Solid { color: Vec3, strength: f32 },
    /// White-to-blue vertical gradient, handy for test scenes.
    SkyGradient,
}

impl Background {
    /// Radiance arriving from direction `dir` (need not be normalized).
    pub fn sample(&self, dir: Vec3) -> Vec3 {
        match *self {
            Background::Solid { color, strength } => color * strength,
            Background::SkyGradient => {
                let unit = dir.normalize_or_zero();
                let a = 0.5 * (unit.y + 1.0);
                (1.0 - a) * Vec3::ONE + a * Vec3::new(0.5, 0.7, 1.0)
            }
        }
    }
}

impl Default for Background {
    fn default() -> Self {
        Background::Solid {
            color: Vec3::ZERO,
            strength: 1.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_material_set_indexing() {
        let mut set = MaterialSet::new();
        let a = set.add(Material::Diffuse { color: Vec3::ONE });
        let b = set.add(Material::Metal {
            color: Vec3::ONE,
            roughness: 0.1,
        });
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert!(set.get(2).is_none());
    }

    #[test]
    fn test_solid_background_scales_by_strength() {
        let bg = Background::Solid {
            color: Vec3::new(1.0, 0.5, 0.25),
            strength: 2.0,
        };
        assert_eq!(bg.sample(Vec3::Z), Vec3::new(2.0, 1.0, 0.5));
    }

    #[test]
    fn test_sky_gradient_blends_with_elevation() {
        let bg = Background::SkyGradient;
        let up = bg.sample(Vec3::Y);
        let down = bg.sample(-Vec3::Y);
        assert!(up.z > down.z);
        assert_eq!(down, Vec3::ONE);
    }

    #[test]
    fn test_default_background_is_black() {
        let bg = Background::default();
        assert_eq!(bg.sample(Vec3::Y), Vec3::ZERO);
    }
}
