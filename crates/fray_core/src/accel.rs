//! Acceleration structures and their publication protocol.
//!
//! Each mesh owns an [`AccelSlot`], a versioned cell the background pool
//! publishes finished BVHs into. Readers take an `Arc` snapshot and traverse
//! it without holding any lock, so a rebuild can swap in a new tree mid-frame
//! while rays in flight keep walking the old one. The old tree is freed when
//! the last snapshot drops.
//!
//! Both hierarchies split on the longest axis of the centroid bounds at the
//! median, which is cheap to build and good enough for the interactive
//! rebuild rates the renderer needs.

use crate::mesh::Mesh;
use crate::sphere::Sphere;
use fray_math::{Aabb, Interval, Mat4, Ray, Vec2, Vec3};
use parking_lot::RwLock;
use std::sync::Arc;

const LEAF_MAX_SIZE: usize = 4;
const PARALLEL_BUILD_THRESHOLD: usize = 2048;

/// Versioned holder for the current build of an acceleration structure.
///
/// `publish` replaces the tree under a brief write lock; `snapshot` hands out
/// a clone of the `Arc` under a read lock. Traversal never touches the lock.
pub struct AccelSlot<T> {
    cell: RwLock<Option<Arc<T>>>,
}

impl<T> AccelSlot<T> {
    pub fn new() -> Self {
        AccelSlot {
            cell: RwLock::new(None),
        }
    }

    /// Swap in a freshly built structure. Returns true if this replaced an
    /// older build.
    pub fn publish(&self, value: T) -> bool {
        let mut cell = self.cell.write();
        let replaced = cell.is_some();
        *cell = Some(Arc::new(value));
        replaced
    }

    /// Current build, if one has been published yet.
    pub fn snapshot(&self) -> Option<Arc<T>> {
        self.cell.read().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.cell.read().is_none()
    }
}

impl<T> Default for AccelSlot<T> {
    fn default() -> Self {
        AccelSlot::new()
    }
}

/// Triangle with resolved attributes, ready for intersection.
#[derive(Debug, Clone)]
struct Triangle {
    p0: Vec3,
    p1: Vec3,
    p2: Vec3,
    n0: Vec3,
    n1: Vec3,
    n2: Vec3,
    uv0: Vec2,
    uv1: Vec2,
    uv2: Vec2,
    has_normals: bool,
    mat_idx: u16,
}

impl Triangle {
    fn bounds(&self) -> Aabb {
        let mut b = Aabb::EMPTY;
        b.grow(self.p0);
        b.grow(self.p1);
        b.grow(self.p2);
        // Axis-aligned triangles produce zero-thickness boxes.
        b.padded(1e-4)
    }

    /// Moller-Trumbore intersection. Returns `(t, u, v)` with `u`, `v` the
    /// barycentric weights of `p1` and `p2`.
    fn hit(&self, ray: &Ray, t: Interval) -> Option<(f32, f32, f32)> {
        let e1 = self.p1 - self.p0;
        let e2 = self.p2 - self.p0;
        let pvec = ray.direction.cross(e2);
        let det = e1.dot(pvec);
        if det.abs() < 1e-9 {
            return None;
        }
        let inv_det = 1.0 / det;
        let tvec = ray.origin - self.p0;
        let u = tvec.dot(pvec) * inv_det;
        if !(0.0..=1.0).contains(&u) {
            return None;
        }
        let qvec = tvec.cross(e1);
        let v = ray.direction.dot(qvec) * inv_det;
        if v < 0.0 || u + v > 1.0 {
            return None;
        }
        let t_hit = e2.dot(qvec) * inv_det;
        if !t.surrounds(t_hit) {
            return None;
        }
        Some((t_hit, u, v))
    }

    fn shading_normal(&self, u: f32, v: f32) -> Vec3 {
        if self.has_normals {
            ((1.0 - u - v) * self.n0 + u * self.n1 + v * self.n2).normalize_or_zero()
        } else {
            (self.p1 - self.p0).cross(self.p2 - self.p0).normalize_or_zero()
        }
    }

    fn uv(&self, u: f32, v: f32) -> Vec2 {
        (1.0 - u - v) * self.uv0 + u * self.uv1 + v * self.uv2
    }
}

/// Intersection against one mesh, in the mesh's object space.
#[derive(Debug, Clone, Copy)]
pub struct MeshHit {
    pub t: f32,
    pub normal: Vec3,
    pub uv: Vec2,
    pub mat_idx: u16,
}

enum MeshNode {
    Branch {
        bounds: Aabb,
        left: Box<MeshNode>,
        right: Box<MeshNode>,
    },
    Leaf {
        bounds: Aabb,
        tris: Vec<Triangle>,
    },
}

impl MeshNode {
    fn bounds(&self) -> &Aabb {
        match self {
            MeshNode::Branch { bounds, .. } => bounds,
            MeshNode::Leaf { bounds, .. } => bounds,
        }
    }
}

/// BVH over the triangles of one mesh snapshot. Immutable once built.
pub struct MeshAccel {
    root: MeshNode,
    bounds: Aabb,
    tri_count: usize,
}

impl MeshAccel {
    /// Build from the mesh's current geometry. Faces with out-of-range
    /// vertex indices are skipped; returns `None` when nothing remains.
    pub fn build(mesh: &Mesh) -> Option<MeshAccel> {
        let mut tris = Vec::with_capacity(mesh.faces.len());
        let mut skipped = 0usize;
        for face in &mesh.faces {
            let (Some(p0), Some(p1), Some(p2)) = (
                mesh.position(face.vertex_idx[0]),
                mesh.position(face.vertex_idx[1]),
                mesh.position(face.vertex_idx[2]),
            ) else {
                skipped += 1;
                continue;
            };
            let normals = if face.has_normals {
                (
                    mesh.normal(face.normal_idx[0]),
                    mesh.normal(face.normal_idx[1]),
                    mesh.normal(face.normal_idx[2]),
                )
            } else {
                (None, None, None)
            };
            let has_normals = matches!(normals, (Some(_), Some(_), Some(_)));
            let (n0, n1, n2) = match normals {
                (Some(a), Some(b), Some(c)) => (a, b, c),
                _ => (Vec3::ZERO, Vec3::ZERO, Vec3::ZERO),
            };
            tris.push(Triangle {
                p0,
                p1,
                p2,
                n0,
                n1,
                n2,
                uv0: mesh.tex_coord(face.texture_idx[0]).unwrap_or(Vec2::ZERO),
                uv1: mesh.tex_coord(face.texture_idx[1]).unwrap_or(Vec2::ZERO),
                uv2: mesh.tex_coord(face.texture_idx[2]).unwrap_or(Vec2::ZERO),
                has_normals,
                mat_idx: face.mat_idx,
            });
        }
        if skipped > 0 {
            log::debug!(
                "{}: skipped {skipped} faces with invalid vertex indices",
                mesh.name
            );
        }
        if tris.is_empty() {
            return None;
        }
        let tri_count = tris.len();
        let root = build_mesh_node(tris);
        let bounds = *root.bounds();
        Some(MeshAccel {
            root,
            bounds,
            tri_count,
        })
    }

    pub fn bounds(&self) -> Aabb {
        self.bounds
    }

    pub fn triangle_count(&self) -> usize {
        self.tri_count
    }

    /// Closest triangle intersection inside `t`, in object space.
    pub fn intersect(&self, ray: &Ray, t: Interval) -> Option<MeshHit> {
        let mut best: Option<MeshHit> = None;
        walk_mesh(&self.root, ray, t, &mut best);
        best
    }
}

fn walk_mesh(node: &MeshNode, ray: &Ray, t: Interval, best: &mut Option<MeshHit>) {
    let limit = Interval::new(t.min, best.as_ref().map_or(t.max, |h| h.t));
    if !node.bounds().hit(ray, limit) {
        return;
    }
    match node {
        MeshNode::Branch { left, right, .. } => {
            walk_mesh(left, ray, t, best);
            walk_mesh(right, ray, t, best);
        }
        MeshNode::Leaf { tris, .. } => {
            for tri in tris {
                let limit = Interval::new(t.min, best.as_ref().map_or(t.max, |h| h.t));
                if let Some((t_hit, u, v)) = tri.hit(ray, limit) {
                    *best = Some(MeshHit {
                        t: t_hit,
                        normal: tri.shading_normal(u, v),
                        uv: tri.uv(u, v),
                        mat_idx: tri.mat_idx,
                    });
                }
            }
        }
    }
}

fn build_mesh_node(mut tris: Vec<Triangle>) -> MeshNode {
    let mut bounds = Aabb::EMPTY;
    let mut centroid_bounds = Aabb::EMPTY;
    for tri in &tris {
        let b = tri.bounds();
        bounds = Aabb::surrounding(&bounds, &b);
        centroid_bounds.grow(b.centroid());
    }
    if tris.len() <= LEAF_MAX_SIZE {
        return MeshNode::Leaf { bounds, tris };
    }

    let axis = centroid_bounds.longest_axis();
    tris.sort_by(|a, b| {
        let ca = a.bounds().centroid()[axis];
        let cb = b.bounds().centroid()[axis];
        ca.partial_cmp(&cb).unwrap_or(std::cmp::Ordering::Equal)
    });
    let right_half = tris.split_off(tris.len() / 2);

    let (left, right) = if tris.len() + right_half.len() >= PARALLEL_BUILD_THRESHOLD {
        rayon::join(|| build_mesh_node(tris), || build_mesh_node(right_half))
    } else {
        (build_mesh_node(tris), build_mesh_node(right_half))
    };
    MeshNode::Branch {
        bounds,
        left: Box::new(left),
        right: Box::new(right),
    }
}

/// What an instance points at, baked for traversal.
#[derive(Debug, Clone)]
pub enum TopGeo {
    /// Index into the scene's mesh table; the matching accel snapshot is
    /// looked up at trace time.
    Mesh(usize),
    Sphere { radius: f32, mat_idx: u16 },
}

/// One instance baked into the top-level hierarchy.
#[derive(Debug, Clone)]
pub struct TopEntry {
    pub geo: TopGeo,
    pub forward: Mat4,
    pub inverse: Mat4,
    /// World-space bounds at bake time.
    pub bounds: Aabb,
    pub material_set: Option<usize>,
    /// Index of the source instance in the scene.
    pub instance: usize,
}

impl TopEntry {
    pub fn new(
        geo: TopGeo,
        forward: Mat4,
        local_bounds: Aabb,
        material_set: Option<usize>,
        instance: usize,
    ) -> Self {
        TopEntry {
            geo,
            inverse: forward.inverse(),
            bounds: local_bounds.transformed(&forward),
            forward,
            material_set,
            instance,
        }
    }
}

/// A world-space intersection, resolved through an instance.
#[derive(Debug, Clone, Copy)]
pub struct WorldHit {
    pub t: f32,
    pub position: Vec3,
    /// Unit normal, flipped to oppose the incoming ray.
    pub normal: Vec3,
    /// True when the ray arrived from outside the surface.
    pub front_face: bool,
    pub uv: Vec2,
    pub mat_idx: u16,
    pub material_set: Option<usize>,
    pub instance: usize,
}

enum TopNode {
    Branch {
        bounds: Aabb,
        left: Box<TopNode>,
        right: Box<TopNode>,
    },
    Leaf {
        bounds: Aabb,
        items: Vec<usize>,
    },
}

impl TopNode {
    fn bounds(&self) -> &Aabb {
        match self {
            TopNode::Branch { bounds, .. } => bounds,
            TopNode::Leaf { bounds, .. } => bounds,
        }
    }
}

/// BVH over instance entries. Rebuilt from scratch whenever the instance
/// list or a transform changes; mesh edits only go stale in here until the
/// next rebuild, since entry bounds are baked.
pub struct TopLevelAccel {
    entries: Vec<TopEntry>,
    root: Option<TopNode>,
    bounds: Aabb,
}

impl TopLevelAccel {
    pub fn build(entries: Vec<TopEntry>) -> TopLevelAccel {
        if entries.is_empty() {
            return TopLevelAccel {
                entries,
                root: None,
                bounds: Aabb::EMPTY,
            };
        }
        let items: Vec<usize> = (0..entries.len()).collect();
        let root = build_top_node(&entries, items);
        let bounds = *root.bounds();
        TopLevelAccel {
            entries,
            root: Some(root),
            bounds,
        }
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn bounds(&self) -> Aabb {
        self.bounds
    }

    /// Closest hit across all instances. `meshes` maps mesh index to the
    /// accel snapshot captured for this tile; instances whose mesh has no
    /// published accel yet do not hit.
    pub fn intersect(
        &self,
        ray: &Ray,
        t: Interval,
        meshes: &[Option<Arc<MeshAccel>>],
    ) -> Option<WorldHit> {
        let root = self.root.as_ref()?;
        let mut best: Option<WorldHit> = None;
        self.walk(root, ray, t, meshes, &mut best);
        best
    }

    fn walk(
        &self,
        node: &TopNode,
        ray: &Ray,
        t: Interval,
        meshes: &[Option<Arc<MeshAccel>>],
        best: &mut Option<WorldHit>,
    ) {
        let limit = Interval::new(t.min, best.as_ref().map_or(t.max, |h| h.t));
        if !node.bounds().hit(ray, limit) {
            return;
        }
        match node {
            TopNode::Branch { left, right, .. } => {
                self.walk(left, ray, t, meshes, best);
                self.walk(right, ray, t, meshes, best);
            }
            TopNode::Leaf { items, .. } => {
                for &idx in items {
                    let limit = Interval::new(t.min, best.as_ref().map_or(t.max, |h| h.t));
                    if let Some(hit) = intersect_entry(&self.entries[idx], ray, limit, meshes) {
                        *best = Some(hit);
                    }
                }
            }
        }
    }
}

fn build_top_node(entries: &[TopEntry], mut items: Vec<usize>) -> TopNode {
    let mut bounds = Aabb::EMPTY;
    let mut centroid_bounds = Aabb::EMPTY;
    for &i in &items {
        bounds = Aabb::surrounding(&bounds, &entries[i].bounds);
        centroid_bounds.grow(entries[i].bounds.centroid());
    }
    if items.len() <= LEAF_MAX_SIZE {
        return TopNode::Leaf { bounds, items };
    }
    let axis = centroid_bounds.longest_axis();
    items.sort_by(|&a, &b| {
        let ca = entries[a].bounds.centroid()[axis];
        let cb = entries[b].bounds.centroid()[axis];
        ca.partial_cmp(&cb).unwrap_or(std::cmp::Ordering::Equal)
    });
    let right_items = items.split_off(items.len() / 2);
    TopNode::Branch {
        bounds,
        left: Box::new(build_top_node(entries, items)),
        right: Box::new(build_top_node(entries, right_items)),
    }
}

/// Intersect one instance: transform the ray to object space without
/// normalizing, so `t` means the same thing on both sides of the transform.
fn intersect_entry(
    entry: &TopEntry,
    ray: &Ray,
    t: Interval,
    meshes: &[Option<Arc<MeshAccel>>],
) -> Option<WorldHit> {
    if !entry.bounds.hit(ray, t) {
        return None;
    }
    let local = Ray::new(
        entry.inverse.transform_point3(ray.origin),
        entry.inverse.transform_vector3(ray.direction),
    );
    let (t_hit, local_normal, uv, mat_idx) = match entry.geo {
        TopGeo::Mesh(mesh_idx) => {
            let accel = meshes.get(mesh_idx)?.as_ref()?;
            let hit = accel.intersect(&local, t)?;
            (hit.t, hit.normal, hit.uv, hit.mat_idx)
        }
        TopGeo::Sphere { radius, mat_idx } => {
            let sphere = Sphere { radius, mat_idx };
            let t_hit = sphere.hit(&local, t)?;
            let normal = sphere.normal_at(local.at(t_hit));
            (t_hit, normal, Vec2::ZERO, mat_idx)
        }
    };

    // Normals transform by the inverse transpose.
    let outward = entry
        .inverse
        .transpose()
        .transform_vector3(local_normal)
        .normalize_or_zero();
    let front_face = ray.direction.dot(outward) < 0.0;
    Some(WorldHit {
        t: t_hit,
        position: ray.at(t_hit),
        normal: if front_face { outward } else { -outward },
        front_face,
        uv,
        mat_idx,
        material_set: entry.material_set,
        instance: entry.instance,
    })
}
