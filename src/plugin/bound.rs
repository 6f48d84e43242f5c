//! Proxy mesh a generator may attach so the client can draw a stand-in for
//! generated content without pulling the content itself.
//!
//! Serialized little-endian as `u32` vertex, edge and face counts, then the
//! vertices (3 x f32), edges (2 x u32) and faces (3 x u32).

use anyhow::{Result, bail};

use crate::engine::Bounds;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoundingMesh {
    pub vertices: Vec<[f32; 3]>,
    pub edges: Vec<[u32; 2]>,
    pub faces: Vec<[u32; 3]>,
}

#[rustfmt::skip]
const BOX_EDGES: [[u32; 2]; 12] = [
    [0, 1], [1, 2], [2, 3], [3, 0],
    [4, 5], [5, 6], [6, 7], [7, 4],
    [0, 4], [1, 5], [2, 6], [3, 7],
];

#[rustfmt::skip]
const BOX_FACES: [[u32; 3]; 12] = [
    [0, 2, 1], [0, 3, 2],
    [4, 5, 6], [4, 6, 7],
    [0, 1, 5], [0, 5, 4],
    [1, 2, 6], [1, 6, 5],
    [2, 3, 7], [2, 7, 6],
    [3, 0, 4], [3, 4, 7],
];

impl BoundingMesh {
    /// Wireframe box with triangulated sides.
    pub fn from_bounds(bounds: &Bounds) -> Self {
        Self {
            vertices: bounds.corners().to_vec(),
            edges: BOX_EDGES.to_vec(),
            faces: BOX_FACES.to_vec(),
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let header = [
            self.vertices.len() as u32,
            self.edges.len() as u32,
            self.faces.len() as u32,
        ];
        let mut out = Vec::with_capacity(
            12 + self.vertices.len() * 12 + self.edges.len() * 8 + self.faces.len() * 12,
        );
        for v in header {
            out.extend_from_slice(&v.to_le_bytes());
        }
        for v in self.vertices.iter().flatten() {
            out.extend_from_slice(&v.to_le_bytes());
        }
        for i in self.edges.iter().flatten().chain(self.faces.iter().flatten()) {
            out.extend_from_slice(&i.to_le_bytes());
        }
        out
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let mut words = bytes.chunks_exact(4).map(|c| [c[0], c[1], c[2], c[3]]);
        if bytes.len() % 4 != 0 || bytes.len() < 12 {
            bail!("bounding mesh of {} bytes is truncated", bytes.len());
        }
        let mut next_u32 = || words.next().map(u32::from_le_bytes).unwrap_or(0);
        let nv = next_u32() as usize;
        let ne = next_u32() as usize;
        let nf = next_u32() as usize;
        let expected = 12 + nv * 12 + ne * 8 + nf * 12;
        if bytes.len() != expected {
            bail!("bounding mesh size mismatch: expected {expected} bytes, got {}", bytes.len());
        }
        let body = &bytes[12..];
        let floats: Vec<f32> = body[..nv * 12]
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        let ints: Vec<u32> = body[nv * 12..]
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        let (edge_ints, face_ints) = ints.split_at(ne * 2);
        Ok(Self {
            vertices: floats.chunks_exact(3).map(|v| [v[0], v[1], v[2]]).collect(),
            edges: edge_ints.chunks_exact(2).map(|e| [e[0], e[1]]).collect(),
            faces: face_ints.chunks_exact(3).map(|f| [f[0], f[1], f[2]]).collect(),
        })
    }
}
