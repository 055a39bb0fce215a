//! Triangle mesh storage.
//!
//! A mesh keeps its vertex attributes in a shared [`VertexBuffer`] and a flat
//! list of [`Face`]s indexing into it. Attribute indices are signed so a face
//! can mark an attribute as absent with a negative index, which is how
//! unwelded normals and missing texture coordinates are represented.

use fray_math::{Aabb, Vec2, Vec3};
use serde::{Deserialize, Serialize};

/// One triangle, with per-corner attribute indices into the vertex buffer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Face {
    pub vertex_idx: [i32; 3],
    pub normal_idx: [i32; 3],
    pub texture_idx: [i32; 3],
    /// Index into the material set bound to the instance being rendered.
    pub mat_idx: u16,
    pub has_normals: bool,
}

impl Face {
    /// Face with position indices only. Normals fall back to the geometric
    /// normal and texture coordinates to zero.
    pub fn from_vertices(v0: i32, v1: i32, v2: i32) -> Self {
        Face {
            vertex_idx: [v0, v1, v2],
            normal_idx: [-1; 3],
            texture_idx: [-1; 3],
            mat_idx: 0,
            has_normals: false,
        }
    }
}

/// Vertex attribute arrays shared by the faces of a mesh.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VertexBuffer {
    pub vertices: Vec<Vec3>,
    pub normals: Vec<Vec3>,
    pub tex_coords: Vec<Vec2>,
}

impl VertexBuffer {
    pub fn new(vertices: Vec<Vec3>, normals: Vec<Vec3>, tex_coords: Vec<Vec2>) -> Self {
        VertexBuffer {
            vertices,
            normals,
            tex_coords,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Mesh {
    pub name: String,
    pub vbuf: VertexBuffer,
    pub faces: Vec<Face>,
}

impl Mesh {
    pub fn new(name: impl Into<String>) -> Self {
        Mesh {
            name: name.into(),
            vbuf: VertexBuffer::default(),
            faces: Vec::new(),
        }
    }

    pub fn face_count(&self) -> usize {
        self.faces.len()
    }

    pub fn vertex_count(&self) -> usize {
        self.vbuf.vertices.len()
    }

    /// Position of the given corner of a face, if the index is in range.
    pub fn position(&self, idx: i32) -> Option<Vec3> {
        if idx < 0 {
            return None;
        }
        self.vbuf.vertices.get(idx as usize).copied()
    }

    pub fn normal(&self, idx: i32) -> Option<Vec3> {
        if idx < 0 {
            return None;
        }
        self.vbuf.normals.get(idx as usize).copied()
    }

    pub fn tex_coord(&self, idx: i32) -> Option<Vec2> {
        if idx < 0 {
            return None;
        }
        self.vbuf.tex_coords.get(idx as usize).copied()
    }

    /// Object-space bounds over every vertex referenced by a face.
    /// Empty if the mesh has no valid faces.
    pub fn bounds(&self) -> Aabb {
        let mut bounds = Aabb::EMPTY;
        for face in &self.faces {
            for &vi in &face.vertex_idx {
                if let Some(p) = self.position(vi) {
                    bounds.grow(p);
                }
            }
        }
        bounds
    }
}
