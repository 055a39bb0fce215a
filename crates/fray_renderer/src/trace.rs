//! Path tracing against a captured view of the scene.
//!
//! Workers never trace against the live scene. At claim time they take a
//! [`TraceView`]: accel snapshots, material sets and background, all behind
//! `Arc`s. The tile then renders lock-free and stays internally consistent
//! even if a BVH rebuild publishes mid-tile; the old tree lives until the
//! last view holding it drops.

use crate::tile::Tile;
use fray_core::accel::{MeshAccel, TopLevelAccel, WorldHit};
use fray_core::{Background, Camera, Material, MaterialSet, Scene};
use fray_math::{Interval, Ray, Vec3};
use rand::Rng;
use std::sync::Arc;

/// Minimum hit distance, dodging self-intersection at spawn points.
const RAY_EPSILON: f32 = 1e-3;

pub struct TraceView {
    pub top: Option<Arc<TopLevelAccel>>,
    pub meshes: Vec<Option<Arc<MeshAccel>>>,
    pub material_sets: Vec<Arc<MaterialSet>>,
    pub background: Background,
}

impl TraceView {
    pub fn capture(scene: &Scene) -> TraceView {
        TraceView {
            top: scene.top_level(),
            meshes: scene.accel_snapshots(),
            material_sets: scene.material_table(),
            background: scene.background(),
        }
    }

    fn material_for(&self, hit: &WorldHit) -> Material {
        hit.material_set
            .and_then(|set| self.material_sets.get(set))
            .and_then(|set| set.get(hit.mat_idx as usize))
            .cloned()
            .unwrap_or_else(Material::default_gray)
    }

    /// Trace one path to completion. Paths end at an emitter, by escaping to
    /// the background, or by running out of bounces (black).
    pub fn trace<R: Rng + ?Sized>(&self, ray: &Ray, bounces: u32, rng: &mut R) -> Vec3 {
        let mut ray = *ray;
        let mut throughput = Vec3::ONE;
        for _ in 0..=bounces {
            let hit = self.top.as_ref().and_then(|top| {
                top.intersect(&ray, Interval::new(RAY_EPSILON, f32::INFINITY), &self.meshes)
            });
            let Some(hit) = hit else {
                return throughput * self.background.sample(ray.direction);
            };
            match self.material_for(&hit) {
                Material::Emissive { color, strength } => {
                    return throughput * color * strength;
                }
                Material::Diffuse { color } => {
                    throughput *= color;
                    let mut dir = hit.normal + random_unit_vector(rng);
                    if near_zero(dir) {
                        dir = hit.normal;
                    }
                    ray = Ray::new(hit.position, dir.normalize());
                }
                Material::Metal { color, roughness } => {
                    let reflected = reflect(ray.direction.normalize(), hit.normal);
                    let dir = reflected + roughness.clamp(0.0, 1.0) * random_unit_vector(rng);
                    if dir.dot(hit.normal) <= 0.0 {
                        return Vec3::ZERO;
                    }
                    throughput *= color;
                    ray = Ray::new(hit.position, dir.normalize());
                }
                Material::Glass { color, ior } => {
                    throughput *= color;
                    let ratio = if hit.front_face { 1.0 / ior } else { ior };
                    let unit = ray.direction.normalize();
                    let cos_theta = (-unit).dot(hit.normal).min(1.0);
                    let sin_theta = (1.0 - cos_theta * cos_theta).sqrt();
                    let must_reflect = ratio * sin_theta > 1.0;
                    let dir = if must_reflect || reflectance(cos_theta, ratio) > rng.gen::<f32>() {
                        reflect(unit, hit.normal)
                    } else {
                        refract(unit, hit.normal, ratio)
                    };
                    ray = Ray::new(hit.position, dir);
                }
            }
        }
        Vec3::ZERO
    }
}

/// Render `samples` samples of every pixel in a tile into a local block,
/// averaged. Returns row-major RGBA with alpha fixed at one.
pub fn render_tile<R: Rng + ?Sized>(
    view: &TraceView,
    camera: &Camera,
    tile: &Tile,
    samples: u64,
    bounces: u32,
    rng: &mut R,
) -> Vec<[f32; 4]> {
    let mut block = vec![[0.0, 0.0, 0.0, 1.0]; (tile.width * tile.height) as usize];
    let inv = 1.0 / samples.max(1) as f32;
    for (i, px) in block.iter_mut().enumerate() {
        let x = tile.start_x + (i as u32 % tile.width);
        let y = tile.start_y + (i as u32 / tile.width);
        let mut acc = Vec3::ZERO;
        for _ in 0..samples {
            let ray = camera.primary_ray(x, y, rng);
            acc += view.trace(&ray, bounces, rng);
        }
        acc *= inv;
        *px = [acc.x, acc.y, acc.z, 1.0];
    }
    block
}

fn random_unit_vector<R: Rng + ?Sized>(rng: &mut R) -> Vec3 {
    loop {
        let p = Vec3::new(
            rng.gen::<f32>() * 2.0 - 1.0,
            rng.gen::<f32>() * 2.0 - 1.0,
            rng.gen::<f32>() * 2.0 - 1.0,
        );
        let len_sq = p.length_squared();
        if len_sq > 1e-12 && len_sq <= 1.0 {
            return p / len_sq.sqrt();
        }
    }
}

fn near_zero(v: Vec3) -> bool {
    v.abs().max_element() < 1e-8
}

fn reflect(v: Vec3, n: Vec3) -> Vec3 {
    v - 2.0 * v.dot(n) * n
}

fn refract(uv: Vec3, n: Vec3, etai_over_etat: f32) -> Vec3 {
    let cos_theta = (-uv).dot(n).min(1.0);
    let r_out_perp = etai_over_etat * (uv + cos_theta * n);
    let r_out_parallel = -(1.0 - r_out_perp.length_squared()).abs().sqrt() * n;
    r_out_perp + r_out_parallel
}

/// Schlick's approximation.
fn reflectance(cosine: f32, ref_idx: f32) -> f32 {
    let r0 = ((1.0 - ref_idx) / (1.0 + ref_idx)).powi(2);
    r0 + (1.0 - r0) * (1.0 - cosine).powf(5.0)
}
