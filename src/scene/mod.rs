//! Named scene objects, the named data they link to, and materials.
//!
//! Objects reference data by name. Engine objects are shared by handle, so an
//! object keeps rendering what it was built from even after the data entry it
//! links to is replaced or deleted; such objects are reported as stale until
//! the client updates them again. Each data entry carries a generation that
//! changes whenever the entry is replaced, so a regeneration under the same
//! name is detected too.

pub mod material;
pub mod mesh;
pub mod object;

use std::collections::BTreeMap;

use serde_json::{Value, json};
use thiserror::Error;

use crate::{
    engine::{Handle, ObjectType, RenderEngine},
    plugin::{GeneratedContent, PluginInstance, PluginKind},
    protocol::{ObjectUpdate, RawMeshHeader},
};
use material::MaterialRegistry;
use mesh::{MeshArrays, RawMesh, apply_mesh_arrays};
use object::{LinkTarget, ObjectContext, SceneObject};

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("linked data '{0}' does not exist")]
    Missing(String),
    #[error("linked data '{name}' is {found}, expected {expected}")]
    WrongKind {
        name: String,
        expected: &'static str,
        found: &'static str,
    },
}

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error("{0}")]
    Invalid(String),
    #[error(transparent)]
    Engine(#[from] anyhow::Error),
}

#[derive(Debug)]
pub enum SceneData {
    PluginOutput(PluginInstance),
    RawMesh(RawMesh),
}

impl SceneData {
    pub fn describe(&self) -> &'static str {
        match self {
            SceneData::RawMesh(_) => LinkTarget::RawMesh.describe(),
            SceneData::PluginOutput(p) => LinkTarget::Plugin(p.kind).describe(),
        }
    }

    fn matches(&self, target: LinkTarget) -> bool {
        match (self, target) {
            (SceneData::RawMesh(_), LinkTarget::RawMesh) => true,
            (SceneData::PluginOutput(p), LinkTarget::Plugin(kind)) => p.kind == kind,
            _ => false,
        }
    }
}

#[derive(Debug, Default)]
pub struct SceneStore {
    pub(crate) objects: BTreeMap<String, SceneObject>,
    data: BTreeMap<String, SceneData>,
    generations: BTreeMap<String, u64>,
    next_generation: u64,
    pub materials: MaterialRegistry,
}

impl SceneStore {
    pub fn object(&self, name: &str) -> Option<&SceneObject> {
        self.objects.get(name)
    }

    pub fn objects(&self) -> impl Iterator<Item = (&String, &SceneObject)> {
        self.objects.iter()
    }

    pub fn data(&self, name: &str) -> Option<&SceneData> {
        self.data.get(name)
    }

    pub fn data_entries(&self) -> impl Iterator<Item = (&String, &SceneData)> {
        self.data.iter()
    }

    pub fn plugin_instance(&self, name: &str) -> Option<&PluginInstance> {
        match self.data.get(name) {
            Some(SceneData::PluginOutput(instance)) => Some(instance),
            _ => None,
        }
    }

    pub fn insert_plugin_instance(&mut self, name: &str, instance: PluginInstance) {
        self.data
            .insert(name.to_string(), SceneData::PluginOutput(instance));
        self.bump_generation(name);
    }

    /// Identity of the entry currently stored under `name`.
    pub fn data_generation(&self, name: &str) -> Option<u64> {
        self.generations.get(name).copied()
    }

    fn bump_generation(&mut self, name: &str) {
        self.next_generation += 1;
        self.generations.insert(name.to_string(), self.next_generation);
    }

    /// Remembers which data entries an object was built from.
    pub(crate) fn record_links(&mut self, object_name: &str) {
        let Some(object) = self.objects.get(object_name) else {
            return;
        };
        let generations = object
            .links()
            .into_iter()
            .map(|(name, _)| self.generations.get(name).copied())
            .collect();
        if let Some(object) = self.objects.get_mut(object_name) {
            object.link_generations = generations;
        }
    }

    pub fn link_lookup(&self, name: &str, target: LinkTarget) -> Result<&SceneData, LinkError> {
        let data = self
            .data
            .get(name)
            .ok_or_else(|| LinkError::Missing(name.to_string()))?;
        if !data.matches(target) {
            return Err(LinkError::WrongKind {
                name: name.to_string(),
                expected: target.describe(),
                found: data.describe(),
            });
        }
        Ok(data)
    }

    pub fn linked_mesh(&self, name: &str) -> Result<&RawMesh, LinkError> {
        match self.link_lookup(name, LinkTarget::RawMesh)? {
            SceneData::RawMesh(mesh) => Ok(mesh),
            _ => Err(LinkError::Missing(name.to_string())),
        }
    }

    pub fn linked_plugin(&self, name: &str, kind: PluginKind) -> Result<&PluginInstance, LinkError> {
        match self.link_lookup(name, LinkTarget::Plugin(kind))? {
            SceneData::PluginOutput(instance) => Ok(instance),
            _ => Err(LinkError::Missing(name.to_string())),
        }
    }

    pub fn upsert_object(&mut self, ctx: &ObjectContext<'_>, update: &ObjectUpdate) -> Result<(), UpdateError> {
        object::upsert_object(self, ctx, update)
    }

    /// Stores a raw mesh under `header.name`. An existing raw mesh keeps its
    /// engine geometry and is rewritten in place; other data under that name
    /// is replaced.
    pub fn upsert_raw_mesh(
        &mut self,
        engine: &dyn RenderEngine,
        header: &RawMeshHeader,
        arrays: MeshArrays,
    ) -> Result<(), UpdateError> {
        if let Some(SceneData::RawMesh(mesh)) = self.data.get_mut(&header.name) {
            apply_mesh_arrays(engine, &mesh.geometry, arrays);
            mesh.num_vertices = header.num_vertices;
            mesh.num_triangles = header.num_triangles;
            mesh.flags = header.flags;
            return Ok(());
        }

        let geometry = engine.create(ObjectType::Geometry, "mesh")?;
        apply_mesh_arrays(engine, &geometry, arrays);
        let mesh = RawMesh {
            geometry,
            num_vertices: header.num_vertices,
            num_triangles: header.num_triangles,
            flags: header.flags,
        };
        let previous = self.data.insert(header.name.clone(), SceneData::RawMesh(mesh));
        self.bump_generation(&header.name);
        if let Some(previous) = previous {
            log::info!(
                "[scene] data '{}' replaced ({} -> raw mesh)",
                header.name,
                previous.describe()
            );
        }
        Ok(())
    }

    pub fn delete_object(&mut self, name: &str) -> bool {
        self.objects.remove(name).is_some()
    }

    pub fn delete_data(&mut self, name: &str) -> bool {
        self.generations.remove(name);
        self.data.remove(name).is_some()
    }

    pub fn clear_objects(&mut self) {
        self.objects.clear();
    }

    pub fn clear_data(&mut self) {
        self.data.clear();
        self.generations.clear();
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn data_count(&self) -> usize {
        self.data.len()
    }

    pub fn world_instances(&self) -> Vec<Handle> {
        self.objects.values().flat_map(|o| o.instances()).collect()
    }

    pub fn world_lights(&self) -> Vec<Handle> {
        self.objects.values().flat_map(|o| o.lights()).collect()
    }

    /// Whether any of the object's links no longer resolve to the entries it
    /// was built from.
    pub fn is_stale(&self, object: &SceneObject) -> bool {
        object.links().into_iter().enumerate().any(|(i, (name, target))| {
            self.link_lookup(name, target).is_err()
                || object.link_generations.get(i).copied().flatten() != self.data_generation(name)
        })
    }

    pub fn stale_objects(&self) -> Vec<&str> {
        self.objects
            .iter()
            .filter(|(_, o)| self.is_stale(o))
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Diagnostic snapshot of objects, data and materials.
    pub fn snapshot(&self) -> Value {
        let objects: serde_json::Map<String, Value> = self
            .objects
            .iter()
            .map(|(name, o)| {
                (
                    name.clone(),
                    json!({
                        "type": o.kind(),
                        "data_link": o.data_link,
                        "material_link": o.material_link,
                        "instances": o.instances().len(),
                        "lights": o.lights().len(),
                        "stale": self.is_stale(o),
                    }),
                )
            })
            .collect();

        let data: serde_json::Map<String, Value> = self
            .data
            .iter()
            .map(|(name, d)| {
                let entry = match d {
                    SceneData::RawMesh(m) => json!({
                        "type": "raw_mesh",
                        "num_vertices": m.num_vertices,
                        "num_triangles": m.num_triangles,
                        "flags": m.flags,
                    }),
                    SceneData::PluginOutput(p) => {
                        let mut entry = json!({
                            "type": "plugin_instance",
                            "plugin_type": p.kind,
                            "plugin_name": p.plugin_name,
                            "parameters": p.parameters,
                            "parameters_hash": p.parameters_hash,
                            "custom_properties_hash": p.custom_properties_hash,
                            "uses_renderer_type": p.uses_renderer_type,
                            "renderer": p.renderer,
                            "generate_time": p.generate_time.as_secs_f32(),
                            "has_bound": p.state.bound.is_some(),
                        });
                        match &p.state.content {
                            GeneratedContent::Geometry(_) => entry["geometry"] = json!(true),
                            GeneratedContent::Volume { data_range, .. } => {
                                entry["volume"] = json!(true);
                                entry["data_range"] = json!(data_range);
                            }
                            GeneratedContent::Scene { groups, lights } => {
                                entry["group_instances"] = json!(groups.len());
                                entry["lights"] = json!(lights.len());
                            }
                        }
                        entry
                    }
                };
                (name.clone(), entry)
            })
            .collect();

        let materials: serde_json::Map<String, Value> = self
            .materials
            .iter()
            .map(|(name, m)| (name.clone(), json!({ "kind": m.kind })))
            .collect();

        json!({
            "scene_objects": objects,
            "scene_data": data,
            "scene_materials": materials,
        })
    }
}
