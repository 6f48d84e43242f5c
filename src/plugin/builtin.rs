//! Generators compiled into the server binary.

use std::{collections::HashMap, sync::Arc};

use super::{
    GenerateContext, GeneratorProvider, LoadError, ParameterType, PluginDefinition, PluginKey,
    PluginKind, PluginParameter, bound::BoundingMesh,
};
use crate::{
    engine::{Bounds, ObjectType, Param},
    transform::IDENTITY_MAT4,
};

pub type DefinitionFactory = Arc<dyn Fn() -> PluginDefinition + Send + Sync>;

/// A fixed table of generators keyed by `(kind, name)`.
#[derive(Default)]
pub struct StaticProvider {
    factories: HashMap<PluginKey, DefinitionFactory>,
}

impl StaticProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut provider = Self::new();
        provider.register(PluginKind::Scene, "boxes", Arc::new(boxes_definition));
        provider.register(PluginKind::Geometry, "sphere", Arc::new(sphere_definition));
        provider.register(PluginKind::Volume, "gradient", Arc::new(gradient_definition));
        provider
    }

    pub fn register(&mut self, kind: PluginKind, name: &str, factory: DefinitionFactory) {
        self.factories.insert(PluginKey::new(kind, name), factory);
    }
}

impl GeneratorProvider for StaticProvider {
    fn load(&self, key: &PluginKey) -> Result<PluginDefinition, LoadError> {
        self.factories
            .get(key)
            .map(|factory| factory())
            .ok_or_else(|| LoadError::NotFound(key.to_string()))
    }
}

const BOXES_PER_AXIS: usize = 4;

/// A grid of coloured boxes, shaded with a material made for the active
/// renderer, so the output depends on the renderer type.
fn boxes_definition() -> PluginDefinition {
    PluginDefinition {
        kind: PluginKind::Scene,
        uses_renderer_type: true,
        parameters: Vec::new(),
        generator: Box::new(generate_boxes),
    }
}

fn generate_boxes(ctx: &mut GenerateContext<'_>) -> Result<(), String> {
    let engine = ctx.engine();
    let n = BOXES_PER_AXIS;
    let mut boxes = Vec::with_capacity(n * n * n * 6);
    let mut colors = Vec::with_capacity(n * n * n);
    for z in 0..n {
        for y in 0..n {
            for x in 0..n {
                let lo = [x as f32, y as f32, z as f32];
                boxes.extend_from_slice(&[lo[0], lo[1], lo[2], lo[0] + 0.8, lo[1] + 0.8, lo[2] + 0.8]);
                let d = (n - 1).max(1) as f32;
                colors.push([x as f32 / d, y as f32 / d, z as f32 / d, 1.0]);
            }
        }
    }

    let geometry = engine
        .create(ObjectType::Geometry, "box")
        .map_err(|e| e.to_string())?;
    engine.set_param(&geometry, "box", Param::FloatArray(boxes));
    engine.commit(&geometry);

    let material = engine
        .create(ObjectType::Material, "obj")
        .map_err(|e| e.to_string())?;
    engine.set_param(&material, "rendererType", Param::String(ctx.renderer().to_string()));
    engine.commit(&material);

    let model = engine
        .create(ObjectType::GeometricModel, "")
        .map_err(|e| e.to_string())?;
    engine.set_param(&model, "geometry", Param::Object(geometry));
    engine.set_param(&model, "color", Param::Vec4fArray(colors));
    engine.set_param(&model, "material", Param::ObjectList(vec![material]));
    engine.commit(&model);

    let group = engine
        .create(ObjectType::Group, "")
        .map_err(|e| e.to_string())?;
    engine.set_param(&group, "geometry", Param::ObjectList(vec![model]));
    engine.commit(&group);

    if let Some(bounds) = engine.bounds(&group) {
        ctx.set_bound(BoundingMesh::from_bounds(&bounds));
    }
    ctx.add_group(group, IDENTITY_MAT4);
    Ok(())
}

fn sphere_definition() -> PluginDefinition {
    PluginDefinition {
        kind: PluginKind::Geometry,
        uses_renderer_type: false,
        parameters: vec![
            PluginParameter::new("radius", ParameterType::Float, 1, "Sphere radius"),
            PluginParameter::new("center", ParameterType::Float, 3, "Sphere center"),
        ],
        generator: Box::new(generate_sphere),
    }
}

fn generate_sphere(ctx: &mut GenerateContext<'_>) -> Result<(), String> {
    let radius = ctx.float_param("radius").ok_or("radius is not a number")?;
    if radius <= 0.0 {
        return Err(format!("radius must be positive, got {radius}"));
    }
    let center: [f32; 3] = ctx.float_array("center").ok_or("center is not a float[3]")?;

    let engine = ctx.engine();
    let geometry = engine
        .create(ObjectType::Geometry, "sphere")
        .map_err(|e| e.to_string())?;
    engine.set_param(&geometry, "sphere.position", Param::Vec3fArray(vec![center]));
    engine.set_param(&geometry, "radius", Param::Float(radius));
    engine.commit(&geometry);

    let mut bounds = Bounds::empty();
    bounds.extend([center[0] - radius, center[1] - radius, center[2] - radius]);
    bounds.extend([center[0] + radius, center[1] + radius, center[2] + radius]);
    ctx.set_bound(BoundingMesh::from_bounds(&bounds));
    ctx.set_geometry(geometry);
    Ok(())
}

fn gradient_definition() -> PluginDefinition {
    PluginDefinition {
        kind: PluginKind::Volume,
        uses_renderer_type: false,
        parameters: vec![PluginParameter::new(
            "dimensions",
            ParameterType::Int,
            3,
            "Voxel counts along x, y and z",
        )],
        generator: Box::new(generate_gradient),
    }
}

/// Structured volume whose value ramps from 0 to 1 along x.
fn generate_gradient(ctx: &mut GenerateContext<'_>) -> Result<(), String> {
    let dims: [i64; 3] = ctx.int_array("dimensions").ok_or("dimensions is not an int[3]")?;
    if dims.iter().any(|&d| !(2..=1024).contains(&d)) {
        return Err(format!("dimensions must lie in 2..=1024, got {dims:?}"));
    }
    let dims = dims.map(|d| d as u32);
    let (nx, ny, nz) = (dims[0] as usize, dims[1] as usize, dims[2] as usize);
    let mut values = Vec::with_capacity(nx * ny * nz);
    for _z in 0..nz {
        for _y in 0..ny {
            for x in 0..nx {
                values.push(x as f32 / (nx - 1) as f32);
            }
        }
    }

    let engine = ctx.engine();
    let volume = engine
        .create(ObjectType::Volume, "structuredRegular")
        .map_err(|e| e.to_string())?;
    engine.set_param(&volume, "gridOrigin", Param::Vec3f([0.0, 0.0, 0.0]));
    engine.set_param(&volume, "gridSpacing", Param::Vec3f([1.0, 1.0, 1.0]));
    engine.set_param(&volume, "data", Param::Voxels { dims, values });
    engine.commit(&volume);

    let bounds = Bounds {
        lower: [0.0, 0.0, 0.0],
        upper: [(nx - 1) as f32, (ny - 1) as f32, (nz - 1) as f32],
    };
    ctx.set_bound(BoundingMesh::from_bounds(&bounds));
    ctx.set_volume(volume, [0.0, 1.0]);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        engine::software::SoftwareEngine,
        plugin::{GeneratedContent, PluginCache},
        protocol::PluginInstanceUpdate,
        scene::SceneStore,
    };
    use serde_json::json;

    fn update(kind: PluginKind, name: &str, params: serde_json::Value) -> PluginInstanceUpdate {
        PluginInstanceUpdate {
            name: format!("data_{name}"),
            plugin_type: kind,
            plugin_name: name.to_string(),
            plugin_parameters: params,
            custom_properties: json!({}),
        }
    }

    #[test]
    fn boxes_produce_one_group_with_a_bound() {
        let engine = SoftwareEngine::new();
        let cache = PluginCache::new(Arc::new(StaticProvider::with_builtins()));
        let mut store = SceneStore::default();
        cache
            .run(&mut store, &engine, &update(PluginKind::Scene, "boxes", json!({})), "scivis")
            .unwrap();
        let instance = store.plugin_instance("data_boxes").unwrap();
        let GeneratedContent::Scene { groups, lights } = &instance.state.content else {
            panic!("expected scene content");
        };
        assert_eq!(groups.len(), 1);
        assert!(lights.is_empty());
        let bound = instance.state.bound.as_ref().unwrap();
        assert_eq!(bound.vertices.len(), 8);
        assert!(instance.uses_renderer_type);
    }

    #[test]
    fn sphere_rejects_non_positive_radius() {
        let engine = SoftwareEngine::new();
        let cache = PluginCache::new(Arc::new(StaticProvider::with_builtins()));
        let mut store = SceneStore::default();
        let err = cache
            .run(
                &mut store,
                &engine,
                &update(PluginKind::Geometry, "sphere", json!({"radius": -1.0, "center": [0, 0, 0]})),
                "scivis",
            )
            .unwrap_err();
        assert!(err.to_string().contains("radius must be positive"));
        assert!(store.plugin_instance("data_sphere").is_none());
    }

    #[test]
    fn gradient_volume_ramps_along_x() {
        let engine = SoftwareEngine::new();
        let cache = PluginCache::new(Arc::new(StaticProvider::with_builtins()));
        let mut store = SceneStore::default();
        cache
            .run(
                &mut store,
                &engine,
                &update(PluginKind::Volume, "gradient", json!({"dimensions": [3, 2, 2]})),
                "scivis",
            )
            .unwrap();
        let instance = store.plugin_instance("data_gradient").unwrap();
        let GeneratedContent::Volume { volume, data_range } = &instance.state.content else {
            panic!("expected volume content");
        };
        assert_eq!(*data_range, [0.0, 1.0]);
        let Some(Param::Voxels { dims, values }) = engine.param(volume, "data") else {
            panic!("volume has no voxel data");
        };
        assert_eq!(dims, [3, 2, 2]);
        assert_eq!(&values[..3], &[0.0, 0.5, 1.0]);
    }
}
