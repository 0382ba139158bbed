//! Sculptable mesh state.
//!
//! A mesh is a list of vertex positions, a fixed triangle list and one base
//! color. The index of a vertex is its identity: edits overwrite positions
//! in place, vertices are never added or removed, and the triangle list is
//! frozen at construction.
//!
//! ```text
//! vertices: [v0, v1, v2, v3, …]          (mutable positions)
//! indices:  [0, 1, 2,  2, 1, 3,  …]       (immutable triples)
//! color:    [r, g, b]
//! ```
//!
//! Export goes through a line-oriented OBJ subset (`v x y z`, `f a b c`,
//! faces 1-indexed) which [`MeshState::from_obj`] reads back losslessly.

use serde::{Deserialize, Serialize};
use std::f32::consts::{PI, TAU};
use std::fmt::Write as _;
use thiserror::Error;

/// A 3-D position.
pub type Vec3 = [f32; 3];

/// Base color for freshly synthesized meshes.
pub const DEFAULT_COLOR: Vec3 = [0.78, 0.52, 0.38];

/// Default sphere tessellation.
pub const DEFAULT_RINGS: u32 = 16;
pub const DEFAULT_SEGMENTS: u32 = 32;

/// Mesh construction and parsing errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MeshError {
    #[error("triangle list length {0} is not a multiple of 3")]
    RaggedTopology(usize),
    #[error("triangle references vertex {index} but the mesh has {vertex_count} vertices")]
    IndexOutOfRange { index: u32, vertex_count: usize },
    #[error("malformed OBJ at line {line}: {reason}")]
    MalformedObj { line: usize, reason: String },
}

/// Serialized form; every decode goes through [`MeshState::new`].
#[derive(Serialize, Deserialize)]
struct MeshParts {
    vertices: Vec<Vec3>,
    indices: Vec<u32>,
    color: Vec3,
}

/// Vertex positions over a fixed triangle topology.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "MeshParts", into = "MeshParts")]
pub struct MeshState {
    vertices: Vec<Vec3>,
    indices: Vec<u32>,
    color: Vec3,
}

impl TryFrom<MeshParts> for MeshState {
    type Error = MeshError;

    fn try_from(parts: MeshParts) -> Result<Self, Self::Error> {
        MeshState::new(parts.vertices, parts.indices, parts.color)
    }
}

impl From<MeshState> for MeshParts {
    fn from(mesh: MeshState) -> Self {
        Self {
            vertices: mesh.vertices,
            indices: mesh.indices,
            color: mesh.color,
        }
    }
}

impl MeshState {
    /// Build a mesh, checking that the triangle list is well formed.
    pub fn new(vertices: Vec<Vec3>, indices: Vec<u32>, color: Vec3) -> Result<Self, MeshError> {
        if indices.len() % 3 != 0 {
            return Err(MeshError::RaggedTopology(indices.len()));
        }
        if let Some(&index) = indices.iter().find(|&&i| i as usize >= vertices.len()) {
            return Err(MeshError::IndexOutOfRange {
                index,
                vertex_count: vertices.len(),
            });
        }
        Ok(Self {
            vertices,
            indices,
            color,
        })
    }

    /// UV sphere centred on the origin.
    ///
    /// Produces `(rings - 1) * segments + 2` vertices (two poles plus the
    /// latitude rings) and `2 * segments * (rings - 1)` triangles.
    pub fn uv_sphere(radius: f32, rings: u32, segments: u32) -> Self {
        let rings = rings.max(2);
        let segments = segments.max(3);

        let mut vertices = Vec::with_capacity(((rings - 1) * segments + 2) as usize);
        vertices.push([0.0, radius, 0.0]);
        for ring in 1..rings {
            let (sin_t, cos_t) = (PI * ring as f32 / rings as f32).sin_cos();
            for seg in 0..segments {
                let (sin_p, cos_p) = (TAU * seg as f32 / segments as f32).sin_cos();
                vertices.push([radius * sin_t * cos_p, radius * cos_t, radius * sin_t * sin_p]);
            }
        }
        let bottom = vertices.len() as u32;
        vertices.push([0.0, -radius, 0.0]);

        // First vertex of latitude ring `ring` (1-based).
        let ring_start = |ring: u32| 1 + (ring - 1) * segments;

        let mut indices = Vec::with_capacity((6 * segments * (rings - 1)) as usize);
        let first = ring_start(1);
        for seg in 0..segments {
            let next = (seg + 1) % segments;
            indices.extend_from_slice(&[0, first + next, first + seg]);
        }
        for ring in 1..rings - 1 {
            let upper = ring_start(ring);
            let lower = ring_start(ring + 1);
            for seg in 0..segments {
                let next = (seg + 1) % segments;
                indices.extend_from_slice(&[upper + seg, upper + next, lower + seg]);
                indices.extend_from_slice(&[upper + next, lower + next, lower + seg]);
            }
        }
        let last = ring_start(rings - 1);
        for seg in 0..segments {
            let next = (seg + 1) % segments;
            indices.extend_from_slice(&[bottom, last + seg, last + next]);
        }

        Self {
            vertices,
            indices,
            color: DEFAULT_COLOR,
        }
    }

    pub fn vertices(&self) -> &[Vec3] {
        &self.vertices
    }

    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    pub fn color(&self) -> Vec3 {
        self.color
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    /// Position of a vertex, if the index is in range.
    pub fn vertex(&self, index: usize) -> Option<Vec3> {
        self.vertices.get(index).copied()
    }

    /// Overwrite one vertex. Returns `false` (and changes nothing) when the
    /// index is out of range.
    pub fn set_vertex(&mut self, index: usize, position: Vec3) -> bool {
        match self.vertices.get_mut(index) {
            Some(slot) => {
                *slot = position;
                true
            }
            None => false,
        }
    }

    /// Render the mesh as OBJ text: one `v` line per vertex, one `f` line
    /// per triangle with 1-indexed vertex references.
    pub fn to_obj(&self) -> String {
        let mut out = String::with_capacity(self.vertices.len() * 32 + self.indices.len() * 8);
        let _ = writeln!(
            out,
            "# clay mesh: {} vertices, {} faces",
            self.vertices.len(),
            self.triangle_count()
        );
        for [x, y, z] in &self.vertices {
            let _ = writeln!(out, "v {x} {y} {z}");
        }
        for tri in self.indices.chunks_exact(3) {
            let _ = writeln!(out, "f {} {} {}", tri[0] + 1, tri[1] + 1, tri[2] + 1);
        }
        out
    }

    /// Parse the OBJ subset written by [`to_obj`](Self::to_obj).
    ///
    /// Accepts `v` and triangular `f` records (`f 1/2/3 …` style references
    /// are reduced to their vertex part). Comments, blank lines and other
    /// record types are skipped. The color is reset to [`DEFAULT_COLOR`].
    pub fn from_obj(text: &str) -> Result<Self, MeshError> {
        let mut vertices = Vec::new();
        let mut indices = Vec::new();

        for (n, raw) in text.lines().enumerate() {
            let line_no = n + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_whitespace();
            match fields.next() {
                Some("v") => {
                    let coords = fields
                        .take(3)
                        .map(str::parse::<f32>)
                        .collect::<Result<Vec<_>, _>>()
                        .map_err(|e| malformed(line_no, e.to_string()))?;
                    match coords[..] {
                        [x, y, z] => vertices.push([x, y, z]),
                        _ => return Err(malformed(line_no, "vertex needs three coordinates")),
                    }
                }
                Some("f") => {
                    let refs: Vec<&str> = fields.collect();
                    if refs.len() != 3 {
                        return Err(malformed(line_no, format!("face has {} vertices, expected 3", refs.len())));
                    }
                    for r in refs {
                        let head = r.split('/').next().unwrap_or(r);
                        let one_based: u32 = head
                            .parse()
                            .map_err(|_| malformed(line_no, format!("bad vertex reference '{r}'")))?;
                        if one_based == 0 {
                            return Err(malformed(line_no, "vertex references are 1-indexed"));
                        }
                        indices.push(one_based - 1);
                    }
                }
                _ => {}
            }
        }

        Self::new(vertices, indices, DEFAULT_COLOR)
    }
}

impl Default for MeshState {
    fn default() -> Self {
        Self::uv_sphere(1.0, DEFAULT_RINGS, DEFAULT_SEGMENTS)
    }
}

fn malformed(line: usize, reason: impl Into<String>) -> MeshError {
    MeshError::MalformedObj {
        line,
        reason: reason.into(),
    }
}
