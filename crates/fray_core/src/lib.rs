//! Scene model and supporting machinery for the fray renderer: meshes,
//! cameras, materials, acceleration structures with versioned publication,
//! the output framebuffer and the background build pool.

pub mod accel;
pub mod camera;
pub mod framebuffer;
pub mod material;
pub mod mesh;
pub mod pool;
pub mod scene;
pub mod sphere;

pub use accel::{AccelSlot, MeshAccel, TopLevelAccel, WorldHit};
pub use camera::{Camera, EulerAngles};
pub use framebuffer::{Colorspace, Framebuffer, Precision, SharedFramebuffer};
pub use material::{Background, Material, MaterialSet};
pub use mesh::{Face, Mesh, VertexBuffer};
pub use pool::ThreadPool;
pub use scene::{Instance, ObjectRef, Scene, SceneSnapshot, SceneTotals};
pub use sphere::Sphere;
