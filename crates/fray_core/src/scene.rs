//! Scene storage and lifecycle.
//!
//! The scene is shared between the caller's thread, the render workers and
//! the background build pool, so all content lives behind one `RwLock`.
//! Acceleration structures are deliberately outside that lock: each mesh
//! carries an [`AccelSlot`] that background builds publish into, and the
//! top-level hierarchy has a slot of its own. Mutations that move instances
//! around only mark the top level dirty; the renderer decides when to pay
//! for the rebuild.

use crate::accel::{AccelSlot, MeshAccel, TopEntry, TopGeo, TopLevelAccel};
use crate::camera::Camera;
use crate::material::{Background, Material, MaterialSet};
use crate::mesh::{Face, Mesh, VertexBuffer};
use crate::pool::ThreadPool;
use crate::sphere::Sphere;
use fray_math::{Aabb, Mat4, Vec3};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

/// Which object an instance wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectRef {
    Mesh(usize),
    Sphere(usize),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub object: ObjectRef,
    pub transform: Mat4,
    pub inverse: Mat4,
    pub material_set: Option<usize>,
}

struct MeshEntry {
    data: Mesh,
    accel: Arc<AccelSlot<MeshAccel>>,
}

#[derive(Default)]
struct SceneData {
    meshes: Vec<MeshEntry>,
    spheres: Vec<Sphere>,
    instances: Vec<Instance>,
    cameras: Vec<Camera>,
    material_sets: Vec<Arc<MaterialSet>>,
    background: Background,
    top_level_dirty: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SceneTotals {
    pub meshes: usize,
    pub spheres: usize,
    pub instances: usize,
    pub cameras: usize,
}

/// Full serializable copy of the scene content, used to ship scenes to
/// render nodes. Acceleration structures are not included; the receiving
/// side rebuilds them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneSnapshot {
    pub meshes: Vec<Mesh>,
    pub spheres: Vec<Sphere>,
    pub instances: Vec<Instance>,
    pub cameras: Vec<Camera>,
    pub material_sets: Vec<MaterialSet>,
    pub background: Background,
}

pub struct Scene {
    data: RwLock<SceneData>,
    top_level: AccelSlot<TopLevelAccel>,
    pool: ThreadPool,
}

impl Scene {
    pub fn new() -> Scene {
        let threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);
        Scene {
            data: RwLock::new(SceneData::default()),
            top_level: AccelSlot::new(),
            pool: ThreadPool::new(threads),
        }
    }

    /// The pool running asynchronous scene work, mainly BVH builds. Waiting
    /// on it is the "scene is ready" barrier.
    pub fn pool(&self) -> &ThreadPool {
        &self.pool
    }

    // Meshes

    pub fn add_mesh(&self, name: &str) -> usize {
        let mut data = self.data.write();
        data.meshes.push(MeshEntry {
            data: Mesh::new(name),
            accel: Arc::new(AccelSlot::new()),
        });
        data.meshes.len() - 1
    }

    pub fn mesh_by_name(&self, name: &str) -> Option<usize> {
        self.data
            .read()
            .meshes
            .iter()
            .position(|entry| entry.data.name == name)
    }

    pub fn mesh_count(&self) -> usize {
        self.data.read().meshes.len()
    }

    /// Replace the vertex attribute arrays of a mesh.
    pub fn bind_vertex_buffer(&self, mesh: usize, vbuf: VertexBuffer) -> bool {
        let mut data = self.data.write();
        match data.meshes.get_mut(mesh) {
            Some(entry) => {
                entry.data.vbuf = vbuf;
                true
            }
            None => false,
        }
    }

    /// Append faces to a mesh.
    pub fn bind_faces(&self, mesh: usize, mut faces: Vec<Face>) -> bool {
        let mut data = self.data.write();
        match data.meshes.get_mut(mesh) {
            Some(entry) => {
                entry.data.faces.append(&mut faces);
                true
            }
            None => false,
        }
    }

    /// Queue an asynchronous BVH build for a mesh whose geometry is complete.
    /// The build works from a copy of the mesh, so the caller may keep
    /// editing; the finished tree is published to the mesh's accel slot and
    /// rays pick it up at their next snapshot.
    pub fn finalize_mesh(&self, mesh: usize) -> bool {
        let (copy, slot) = {
            let data = self.data.read();
            let Some(entry) = data.meshes.get(mesh) else {
                return false;
            };
            (entry.data.clone(), Arc::clone(&entry.accel))
        };
        self.pool.enqueue(move || {
            let start = Instant::now();
            match MeshAccel::build(&copy) {
                Some(accel) => {
                    let replaced = slot.publish(accel);
                    log::info!(
                        "BVH {} for {} ({}ms)",
                        if replaced { "updated" } else { "built" },
                        copy.name,
                        start.elapsed().as_millis()
                    );
                }
                None => {
                    log::debug!("Failed to build BVH for {}, discarding", copy.name);
                }
            }
        });
        true
    }

    /// Accel slot of one mesh. Mostly useful to tests and the trace capture.
    pub fn mesh_accel(&self, mesh: usize) -> Option<Arc<AccelSlot<MeshAccel>>> {
        self.data
            .read()
            .meshes
            .get(mesh)
            .map(|entry| Arc::clone(&entry.accel))
    }

    /// One accel snapshot per mesh, indexed like the mesh table. Meshes
    /// without a published build yield `None` and do not hit.
    pub fn accel_snapshots(&self) -> Vec<Option<Arc<MeshAccel>>> {
        self.data
            .read()
            .meshes
            .iter()
            .map(|entry| entry.accel.snapshot())
            .collect()
    }

    // Spheres

    pub fn add_sphere(&self, radius: f32) -> usize {
        let mut data = self.data.write();
        data.spheres.push(Sphere::new(radius));
        data.spheres.len() - 1
    }

    // Instances

    /// Instance an object into the world. Fails if the reference is dangling.
    pub fn add_instance(&self, object: ObjectRef) -> Option<usize> {
        let mut data = self.data.write();
        let valid = match object {
            ObjectRef::Mesh(idx) => idx < data.meshes.len(),
            ObjectRef::Sphere(idx) => idx < data.spheres.len(),
        };
        if !valid {
            return None;
        }
        data.instances.push(Instance {
            object,
            transform: Mat4::IDENTITY,
            inverse: Mat4::IDENTITY,
            material_set: None,
        });
        data.top_level_dirty = true;
        Some(data.instances.len() - 1)
    }

    pub fn instance(&self, idx: usize) -> Option<Instance> {
        self.data.read().instances.get(idx).cloned()
    }

    /// Set an instance's world transform. Setting the transform it already
    /// has is recognized and does not dirty the top level.
    pub fn set_transform(&self, instance: usize, transform: Mat4) -> bool {
        let mut data = self.data.write();
        let Some(inst) = data.instances.get_mut(instance) else {
            return false;
        };
        if inst.transform == transform {
            return true;
        }
        inst.transform = transform;
        inst.inverse = transform.inverse();
        data.top_level_dirty = true;
        true
    }

    /// Compose `transform` onto an instance's existing transform. The
    /// increment applies in object space, before what is already there.
    pub fn concat_transform(&self, instance: usize, transform: Mat4) -> bool {
        let mut data = self.data.write();
        let Some(inst) = data.instances.get_mut(instance) else {
            return false;
        };
        inst.transform = inst.transform * transform;
        inst.inverse = inst.transform.inverse();
        data.top_level_dirty = true;
        true
    }

    pub fn bind_material_set(&self, instance: usize, set: usize) -> bool {
        let mut data = self.data.write();
        if set >= data.material_sets.len() {
            return false;
        }
        match data.instances.get_mut(instance) {
            Some(inst) => {
                inst.material_set = Some(set);
                true
            }
            None => false,
        }
    }

    // Cameras

    pub fn add_camera(&self, camera: Camera) -> usize {
        let mut data = self.data.write();
        data.cameras.push(camera);
        data.cameras.len() - 1
    }

    pub fn camera(&self, idx: usize) -> Option<Camera> {
        self.data.read().cameras.get(idx).cloned()
    }

    pub fn camera_count(&self) -> usize {
        self.data.read().cameras.len()
    }

    /// Mutate a camera in place; pose and optics caches are refreshed after
    /// the closure runs.
    pub fn update_camera(&self, idx: usize, f: impl FnOnce(&mut Camera)) -> bool {
        let mut data = self.data.write();
        match data.cameras.get_mut(idx) {
            Some(cam) => {
                f(cam);
                cam.initialize();
                true
            }
            None => false,
        }
    }

    // Materials

    pub fn add_material_set(&self) -> usize {
        let mut data = self.data.write();
        data.material_sets.push(Arc::new(MaterialSet::new()));
        data.material_sets.len() - 1
    }

    pub fn add_material(&self, set: usize, material: Material) -> Option<usize> {
        let mut data = self.data.write();
        let entry = data.material_sets.get_mut(set)?;
        Some(Arc::make_mut(entry).add(material))
    }

    /// Replace a material in place. Running renders pick the change up at
    /// their next trace capture.
    pub fn update_material(&self, set: usize, index: usize, material: Material) -> bool {
        let mut data = self.data.write();
        let Some(entry) = data.material_sets.get_mut(set) else {
            return false;
        };
        let set_data = Arc::make_mut(entry);
        match set_data.materials.get_mut(index) {
            Some(slot) => {
                *slot = material;
                true
            }
            None => false,
        }
    }

    pub fn material_table(&self) -> Vec<Arc<MaterialSet>> {
        self.data.read().material_sets.clone()
    }

    pub fn set_background(&self, background: Background) {
        self.data.write().background = background;
    }

    pub fn background(&self) -> Background {
        self.data.read().background.clone()
    }

    // Acceleration

    pub fn top_level_dirty(&self) -> bool {
        self.data.read().top_level_dirty
    }

    /// Rebuild the instance hierarchy synchronously from current transforms
    /// and object bounds. Instances with dangling references or no geometry
    /// are left out.
    pub fn rebuild_top_level(&self) {
        let start = Instant::now();
        let mut data = self.data.write();
        let mut entries = Vec::with_capacity(data.instances.len());
        for (idx, inst) in data.instances.iter().enumerate() {
            let (geo, local_bounds) = match inst.object {
                ObjectRef::Mesh(m) => match data.meshes.get(m) {
                    Some(entry) => (TopGeo::Mesh(m), entry.data.bounds()),
                    None => continue,
                },
                ObjectRef::Sphere(s) => match data.spheres.get(s) {
                    Some(sphere) => (
                        TopGeo::Sphere {
                            radius: sphere.radius,
                            mat_idx: sphere.mat_idx,
                        },
                        Aabb::from_points(
                            Vec3::splat(-sphere.radius),
                            Vec3::splat(sphere.radius),
                        ),
                    ),
                    None => continue,
                },
            };
            if local_bounds.is_empty() {
                continue;
            }
            entries.push(TopEntry::new(
                geo,
                inst.transform,
                local_bounds,
                inst.material_set,
                idx,
            ));
        }
        let count = entries.len();
        self.top_level.publish(TopLevelAccel::build(entries));
        data.top_level_dirty = false;
        log::debug!(
            "Updated top-level BVH, {count} instances ({}ms)",
            start.elapsed().as_millis()
        );
    }

    pub fn top_level(&self) -> Option<Arc<TopLevelAccel>> {
        self.top_level.snapshot()
    }

    pub fn totals(&self) -> SceneTotals {
        let data = self.data.read();
        SceneTotals {
            meshes: data.meshes.len(),
            spheres: data.spheres.len(),
            instances: data.instances.len(),
            cameras: data.cameras.len(),
        }
    }

    // Transfer

    /// Copy out everything a render node needs to reconstruct this scene.
    pub fn snapshot(&self) -> SceneSnapshot {
        let data = self.data.read();
        SceneSnapshot {
            meshes: data.meshes.iter().map(|entry| entry.data.clone()).collect(),
            spheres: data.spheres.clone(),
            instances: data.instances.clone(),
            cameras: data.cameras.clone(),
            material_sets: data
                .material_sets
                .iter()
                .map(|set| MaterialSet::clone(set))
                .collect(),
            background: data.background.clone(),
        }
    }

    /// Reconstruct a scene from a snapshot and queue BVH builds for every
    /// mesh. Callers should wait on the pool before tracing.
    pub fn from_snapshot(snapshot: SceneSnapshot) -> Scene {
        let scene = Scene::new();
        {
            let mut data = scene.data.write();
            data.meshes = snapshot
                .meshes
                .into_iter()
                .map(|mesh| MeshEntry {
                    data: mesh,
                    accel: Arc::new(AccelSlot::new()),
                })
                .collect();
            data.spheres = snapshot.spheres;
            data.instances = snapshot
                .instances
                .into_iter()
                .map(|mut inst| {
                    inst.inverse = inst.transform.inverse();
                    inst
                })
                .collect();
            data.cameras = snapshot.cameras;
            for cam in &mut data.cameras {
                cam.initialize();
            }
            data.material_sets = snapshot.material_sets.into_iter().map(Arc::new).collect();
            data.background = snapshot.background;
            data.top_level_dirty = true;
        }
        for mesh in 0..scene.mesh_count() {
            scene.finalize_mesh(mesh);
        }
        scene
    }
}

impl Default for Scene {
    fn default() -> Self {
        Scene::new()
    }
}
