use anyhow::{Result, bail};

use crate::{
    engine::{Handle, Param, RenderEngine},
    protocol::{MESH_NORMALS, MESH_VERTEX_COLORS, RawMeshHeader},
};

/// Decoded bulk arrays of an `UPDATE_RAW_MESH`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeshArrays {
    pub vertices: Vec<[f32; 3]>,
    pub normals: Option<Vec<[f32; 3]>>,
    pub colors: Option<Vec<[f32; 4]>>,
    pub triangles: Vec<[u32; 3]>,
}

fn read_array<T: bytemuck::AnyBitPattern>(bytes: &[u8], count: usize, at: &mut usize) -> Vec<T> {
    let size = std::mem::size_of::<T>();
    let end = *at + count * size;
    let out = bytes[*at..end]
        .chunks_exact(size)
        .map(bytemuck::pod_read_unaligned::<T>)
        .collect();
    *at = end;
    out
}

impl MeshArrays {
    pub fn decode(header: &RawMeshHeader, bytes: &[u8]) -> Result<Self> {
        let expected = header.bulk_size();
        if bytes.len() as u64 != expected {
            bail!(
                "mesh '{}' payload is {} bytes, header announces {expected}",
                header.name,
                bytes.len()
            );
        }
        let nv = header.num_vertices as usize;
        let mut at = 0;
        let vertices = read_array(bytes, nv, &mut at);
        let normals = header.has_normals().then(|| read_array(bytes, nv, &mut at));
        let colors = header
            .has_vertex_colors()
            .then(|| read_array(bytes, nv, &mut at));
        let triangles = read_array(bytes, header.num_triangles as usize, &mut at);
        let arrays = Self {
            vertices,
            normals,
            colors,
            triangles,
        };
        arrays.validate()?;
        Ok(arrays)
    }

    pub fn validate(&self) -> Result<()> {
        let nv = self.vertices.len();
        if let Some((i, tri)) = self
            .triangles
            .iter()
            .enumerate()
            .find(|(_, t)| t.iter().any(|&v| v as usize >= nv))
        {
            bail!("triangle {i} {tri:?} references a vertex beyond {nv}");
        }
        Ok(())
    }

    pub fn flags(&self) -> u32 {
        let mut flags = 0;
        if self.normals.is_some() {
            flags |= MESH_NORMALS;
        }
        if self.colors.is_some() {
            flags |= MESH_VERTEX_COLORS;
        }
        flags
    }

    pub fn header(&self, name: &str) -> RawMeshHeader {
        RawMeshHeader {
            name: name.to_string(),
            num_vertices: self.vertices.len() as u32,
            num_triangles: self.triangles.len() as u32,
            flags: self.flags(),
        }
    }

    /// Bulk bytes in wire order.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(bytemuck::cast_slice(&self.vertices));
        if let Some(normals) = &self.normals {
            out.extend_from_slice(bytemuck::cast_slice(normals));
        }
        if let Some(colors) = &self.colors {
            out.extend_from_slice(bytemuck::cast_slice(colors));
        }
        out.extend_from_slice(bytemuck::cast_slice(&self.triangles));
        out
    }
}

/// Triangle mesh data uploaded directly by the client.
#[derive(Debug, Clone)]
pub struct RawMesh {
    pub geometry: Handle,
    pub num_vertices: u32,
    pub num_triangles: u32,
    pub flags: u32,
}

/// Writes the arrays into a mesh geometry. Optional arrays missing from this
/// update are removed from the geometry rather than left stale.
pub fn apply_mesh_arrays(engine: &dyn RenderEngine, geometry: &Handle, arrays: MeshArrays) {
    engine.set_param(geometry, "vertex.position", Param::Vec3fArray(arrays.vertices));
    match arrays.normals {
        Some(normals) => engine.set_param(geometry, "vertex.normal", Param::Vec3fArray(normals)),
        None => engine.remove_param(geometry, "vertex.normal"),
    }
    match arrays.colors {
        Some(colors) => engine.set_param(geometry, "vertex.color", Param::Vec4fArray(colors)),
        None => engine.remove_param(geometry, "vertex.color"),
    }
    engine.set_param(geometry, "index", Param::Vec3uArray(arrays.triangles));
    engine.commit(geometry);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quad() -> MeshArrays {
        MeshArrays {
            vertices: vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [1.0, 1.0, 0.0], [0.0, 1.0, 0.0]],
            normals: Some(vec![[0.0, 0.0, 1.0]; 4]),
            colors: None,
            triangles: vec![[0, 1, 2], [0, 2, 3]],
        }
    }

    #[test]
    fn decodes_what_the_client_sends() {
        let mesh = quad();
        let header = mesh.header("quad");
        assert_eq!(header.flags, MESH_NORMALS);
        let decoded = MeshArrays::decode(&header, &mesh.encode()).unwrap();
        assert_eq!(decoded, mesh);
    }

    #[test]
    fn payload_size_must_match_header() {
        let mesh = quad();
        let mut header = mesh.header("quad");
        header.flags |= MESH_VERTEX_COLORS;
        let err = MeshArrays::decode(&header, &mesh.encode()).unwrap_err();
        assert!(err.to_string().contains("header announces"));
    }

    #[test]
    fn out_of_range_index_is_rejected() {
        let mut mesh = quad();
        mesh.triangles.push([0, 3, 4]);
        let err = MeshArrays::decode(&mesh.header("quad"), &mesh.encode()).unwrap_err();
        assert!(err.to_string().contains("triangle 2"));
    }
}
