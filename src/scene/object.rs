//! Scene objects and the engine objects each kind owns.
//!
//! Every placed object ends in one or more engine instances (group plus
//! transform). Building is split in two steps: links are resolved against the
//! store first, without touching anything, and only then are engine objects
//! created or updated.

use serde::Serialize;
use serde_json::Value;

use super::{LinkError, SceneStore, UpdateError};
use crate::{
    engine::{Handle, ObjectType, Param, RenderEngine},
    plugin::{GeneratedContent, PluginKind},
    protocol::{LightKind, LightSettings, ObjectPayload, ObjectUpdate},
    transform::{Mat4, affine_from_row_major, mat4_mul},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    Mesh,
    Geometry,
    Volume,
    Isosurfaces,
    Slices,
    Scene,
    Light,
}

impl ObjectKind {
    pub fn of(payload: &ObjectPayload) -> Self {
        match payload {
            ObjectPayload::Mesh => ObjectKind::Mesh,
            ObjectPayload::Geometry => ObjectKind::Geometry,
            ObjectPayload::Volume { .. } => ObjectKind::Volume,
            ObjectPayload::Isosurfaces => ObjectKind::Isosurfaces,
            ObjectPayload::Slices { .. } => ObjectKind::Slices,
            ObjectPayload::Scene => ObjectKind::Scene,
            ObjectPayload::Light(_) => ObjectKind::Light,
        }
    }
}

/// Engine objects shared by mesh and geometry objects.
#[derive(Debug)]
pub struct ModelParts {
    pub model: Handle,
    pub group: Handle,
    pub instance: Handle,
}

#[derive(Debug)]
pub struct VolumeParts {
    pub vmodel: Handle,
    pub transfer_function: Handle,
    pub group: Handle,
    pub instance: Handle,
}

#[derive(Debug)]
pub struct IsosurfaceParts {
    pub vmodel: Handle,
    pub transfer_function: Handle,
    pub geometry: Handle,
    pub model: Handle,
    pub group: Handle,
    pub instance: Handle,
    pub isovalues: Vec<f32>,
}

#[derive(Debug)]
pub struct SliceInstance {
    pub mesh_link: String,
    pub material: Handle,
    pub model: Handle,
    pub group: Handle,
    pub instance: Handle,
}

#[derive(Debug)]
pub struct SliceParts {
    pub vmodel: Handle,
    pub transfer_function: Handle,
    pub slices: Vec<SliceInstance>,
}

#[derive(Debug)]
pub struct SceneParts {
    pub instances: Vec<Handle>,
    pub lights: Vec<Handle>,
}

#[derive(Debug)]
pub struct LightParts {
    pub light_type: LightKind,
    pub light: Handle,
}

#[derive(Debug)]
pub enum ObjectBody {
    Mesh(ModelParts),
    Geometry(ModelParts),
    Volume(VolumeParts),
    Isosurfaces(IsosurfaceParts),
    Slices(SliceParts),
    Scene(SceneParts),
    Light(LightParts),
}

#[derive(Debug)]
pub struct SceneObject {
    pub transform: Mat4,
    pub data_link: String,
    pub material_link: String,
    pub body: ObjectBody,
    /// Generation of each entry in [`SceneObject::links`] when last built.
    pub(crate) link_generations: Vec<Option<u64>>,
}

impl SceneObject {
    pub fn kind(&self) -> ObjectKind {
        match &self.body {
            ObjectBody::Mesh(_) => ObjectKind::Mesh,
            ObjectBody::Geometry(_) => ObjectKind::Geometry,
            ObjectBody::Volume(_) => ObjectKind::Volume,
            ObjectBody::Isosurfaces(_) => ObjectKind::Isosurfaces,
            ObjectBody::Slices(_) => ObjectKind::Slices,
            ObjectBody::Scene(_) => ObjectKind::Scene,
            ObjectBody::Light(_) => ObjectKind::Light,
        }
    }

    /// Instances this object contributes to the world.
    pub fn instances(&self) -> Vec<Handle> {
        match &self.body {
            ObjectBody::Mesh(p) | ObjectBody::Geometry(p) => vec![p.instance.clone()],
            ObjectBody::Volume(p) => vec![p.instance.clone()],
            ObjectBody::Isosurfaces(p) => vec![p.instance.clone()],
            ObjectBody::Slices(p) => p.slices.iter().map(|s| s.instance.clone()).collect(),
            ObjectBody::Scene(p) => p.instances.clone(),
            ObjectBody::Light(_) => Vec::new(),
        }
    }

    pub fn lights(&self) -> Vec<Handle> {
        match &self.body {
            ObjectBody::Scene(p) => p.lights.clone(),
            ObjectBody::Light(p) => vec![p.light.clone()],
            _ => Vec::new(),
        }
    }

    /// Scene data names this object depends on.
    pub fn links(&self) -> Vec<(&str, LinkTarget)> {
        let mut links = Vec::new();
        match &self.body {
            ObjectBody::Mesh(_) => links.push((self.data_link.as_str(), LinkTarget::RawMesh)),
            ObjectBody::Geometry(_) => {
                links.push((self.data_link.as_str(), LinkTarget::Plugin(PluginKind::Geometry)))
            }
            ObjectBody::Volume(_) | ObjectBody::Isosurfaces(_) => {
                links.push((self.data_link.as_str(), LinkTarget::Plugin(PluginKind::Volume)))
            }
            ObjectBody::Slices(p) => {
                links.push((self.data_link.as_str(), LinkTarget::Plugin(PluginKind::Volume)));
                for slice in &p.slices {
                    links.push((slice.mesh_link.as_str(), LinkTarget::RawMesh));
                }
            }
            ObjectBody::Scene(_) => {
                links.push((self.data_link.as_str(), LinkTarget::Plugin(PluginKind::Scene)))
            }
            ObjectBody::Light(_) => {}
        }
        links
    }
}

/// What a data link must resolve to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkTarget {
    RawMesh,
    Plugin(PluginKind),
}

impl LinkTarget {
    pub fn describe(self) -> &'static str {
        match self {
            LinkTarget::RawMesh => "a raw mesh",
            LinkTarget::Plugin(PluginKind::Geometry) => "geometry plugin output",
            LinkTarget::Plugin(PluginKind::Volume) => "volume plugin output",
            LinkTarget::Plugin(PluginKind::Scene) => "scene plugin output",
        }
    }
}

/// Engine context for building objects.
pub struct ObjectContext<'a> {
    pub engine: &'a dyn RenderEngine,
    pub renderer: &'a str,
    pub default_material: &'a Handle,
}

/// Linked data fetched from the store, ready to build with.
enum Resolved {
    Model {
        geometry: Handle,
        material: Handle,
    },
    Volume {
        volume: Handle,
        data_range: [f32; 2],
        sampling_rate: f32,
    },
    Isosurfaces {
        volume: Handle,
        data_range: [f32; 2],
        isovalues: Vec<f32>,
        material: Handle,
    },
    Slices {
        volume: Handle,
        data_range: [f32; 2],
        meshes: Vec<(String, Handle, Mat4)>,
    },
    Scene {
        groups: Vec<(Handle, Mat4)>,
        lights: Vec<Handle>,
    },
    Light(LightSettings),
}

fn resolve(
    store: &SceneStore,
    ctx: &ObjectContext<'_>,
    update: &ObjectUpdate,
) -> Result<Resolved, UpdateError> {
    let link = update.data_link.as_str();
    Ok(match &update.payload {
        ObjectPayload::Mesh => Resolved::Model {
            geometry: store.linked_mesh(link)?.geometry.clone(),
            material: resolve_material(store, ctx, update),
        },
        ObjectPayload::Geometry => match &store.linked_plugin(link, PluginKind::Geometry)?.state.content {
            GeneratedContent::Geometry(geometry) => Resolved::Model {
                geometry: geometry.clone(),
                material: resolve_material(store, ctx, update),
            },
            _ => return Err(wrong_content(link, PluginKind::Geometry)),
        },
        ObjectPayload::Volume { sampling_rate } => {
            let (volume, data_range) = linked_volume(store, link)?;
            Resolved::Volume {
                volume,
                data_range,
                sampling_rate: *sampling_rate,
            }
        }
        ObjectPayload::Isosurfaces => {
            let (volume, data_range) = linked_volume(store, link)?;
            let isovalues = isovalues(&update.custom_properties)?;
            Resolved::Isosurfaces {
                volume,
                data_range,
                isovalues,
                material: resolve_material(store, ctx, update),
            }
        }
        ObjectPayload::Slices { slices } => {
            let (volume, data_range) = linked_volume(store, link)?;
            let meshes = slices
                .iter()
                .map(|s| {
                    let mesh = store.linked_mesh(&s.linked_mesh)?;
                    Ok((s.linked_mesh.clone(), mesh.geometry.clone(), s.object2world))
                })
                .collect::<Result<Vec<_>, LinkError>>()?;
            Resolved::Slices {
                volume,
                data_range,
                meshes,
            }
        }
        ObjectPayload::Scene => match &store.linked_plugin(link, PluginKind::Scene)?.state.content {
            GeneratedContent::Scene { groups, lights } => Resolved::Scene {
                groups: groups.clone(),
                lights: lights.clone(),
            },
            _ => return Err(wrong_content(link, PluginKind::Scene)),
        },
        ObjectPayload::Light(settings) => Resolved::Light(settings.clone()),
    })
}

fn linked_volume(store: &SceneStore, link: &str) -> Result<(Handle, [f32; 2]), UpdateError> {
    match &store.linked_plugin(link, PluginKind::Volume)?.state.content {
        GeneratedContent::Volume { volume, data_range } => Ok((volume.clone(), *data_range)),
        _ => Err(wrong_content(link, PluginKind::Volume)),
    }
}

fn wrong_content(link: &str, kind: PluginKind) -> UpdateError {
    UpdateError::Invalid(format!("data '{link}' holds no {} output", kind.as_str()))
}

fn isovalues(custom_properties: &Value) -> Result<Vec<f32>, UpdateError> {
    let values = custom_properties
        .get("isovalues")
        .and_then(Value::as_array)
        .ok_or_else(|| UpdateError::Invalid("isosurfaces need an 'isovalues' array".to_string()))?;
    let isovalues: Vec<f32> = values
        .iter()
        .filter_map(Value::as_f64)
        .map(|v| v as f32)
        .collect();
    if isovalues.is_empty() || isovalues.len() != values.len() {
        return Err(UpdateError::Invalid(
            "'isovalues' must be a non-empty array of numbers".to_string(),
        ));
    }
    Ok(isovalues)
}

fn resolve_material(store: &SceneStore, ctx: &ObjectContext<'_>, update: &ObjectUpdate) -> Handle {
    if update.material_link.is_empty() {
        return ctx.default_material.clone();
    }
    match store.materials.get(&update.material_link) {
        Some(material) => material.handle.clone(),
        None => {
            log::warn!(
                "[scene] object '{}' links unknown material '{}', using default",
                update.name,
                update.material_link
            );
            ctx.default_material.clone()
        }
    }
}

/// Applies an object update. Nothing in the store changes unless every link
/// resolves and every engine object was created.
pub fn upsert_object(
    store: &mut SceneStore,
    ctx: &ObjectContext<'_>,
    update: &ObjectUpdate,
) -> Result<(), UpdateError> {
    let resolved = resolve(store, ctx, update)?;
    let kind = ObjectKind::of(&update.payload);
    let engine = ctx.engine;

    if let Some(existing) = store.objects.get_mut(&update.name) {
        let same_light = match (&existing.body, &resolved) {
            (ObjectBody::Light(parts), Resolved::Light(settings)) => parts.light_type == settings.light_type,
            _ => true,
        };
        if existing.kind() == kind && same_light {
            update_in_place(engine, existing, resolved, update)?;
            existing.transform = update.object2world;
            existing.data_link = update.data_link.clone();
            existing.material_link = update.material_link.clone();
            store.record_links(&update.name);
            return Ok(());
        }
        log::info!(
            "[scene] object '{}' changes from {:?} to {:?}, replacing",
            update.name,
            existing.kind(),
            kind
        );
    }

    let body = build_body(engine, resolved, update)?;
    // Inserting drops (and so releases) any object of another kind.
    store.objects.insert(
        update.name.clone(),
        SceneObject {
            transform: update.object2world,
            data_link: update.data_link.clone(),
            material_link: update.material_link.clone(),
            body,
            link_generations: Vec::new(),
        },
    );
    store.record_links(&update.name);
    Ok(())
}

fn build_body(
    engine: &dyn RenderEngine,
    resolved: Resolved,
    update: &ObjectUpdate,
) -> anyhow::Result<ObjectBody> {
    let xf = &update.object2world;
    Ok(match resolved {
        Resolved::Model { geometry, material } => {
            let parts = ModelParts {
                model: engine.create(ObjectType::GeometricModel, "")?,
                group: engine.create(ObjectType::Group, "")?,
                instance: engine.create(ObjectType::Instance, "")?,
            };
            parts.apply(engine, geometry, material, xf);
            match update.payload {
                ObjectPayload::Mesh => ObjectBody::Mesh(parts),
                _ => ObjectBody::Geometry(parts),
            }
        }
        Resolved::Volume {
            volume,
            data_range,
            sampling_rate,
        } => {
            let parts = VolumeParts {
                vmodel: engine.create(ObjectType::VolumetricModel, "")?,
                transfer_function: engine.create(ObjectType::TransferFunction, "piecewiseLinear")?,
                group: engine.create(ObjectType::Group, "")?,
                instance: engine.create(ObjectType::Instance, "")?,
            };
            parts.apply(engine, volume, data_range, sampling_rate, xf);
            ObjectBody::Volume(parts)
        }
        Resolved::Isosurfaces {
            volume,
            data_range,
            isovalues,
            material,
        } => {
            let mut parts = IsosurfaceParts {
                vmodel: engine.create(ObjectType::VolumetricModel, "")?,
                transfer_function: engine.create(ObjectType::TransferFunction, "piecewiseLinear")?,
                geometry: engine.create(ObjectType::Geometry, "isosurface")?,
                model: engine.create(ObjectType::GeometricModel, "")?,
                group: engine.create(ObjectType::Group, "")?,
                instance: engine.create(ObjectType::Instance, "")?,
                isovalues: Vec::new(),
            };
            parts.apply(engine, volume, data_range, isovalues, material, xf);
            ObjectBody::Isosurfaces(parts)
        }
        Resolved::Slices {
            volume,
            data_range,
            meshes,
        } => {
            let vmodel = engine.create(ObjectType::VolumetricModel, "")?;
            let transfer_function = engine.create(ObjectType::TransferFunction, "piecewiseLinear")?;
            apply_volume_model(engine, &vmodel, &transfer_function, volume, data_range, None);
            let slices = build_slices(engine, &vmodel, meshes)?;
            ObjectBody::Slices(SliceParts {
                vmodel,
                transfer_function,
                slices,
            })
        }
        Resolved::Scene { groups, lights } => ObjectBody::Scene(SceneParts {
            instances: build_scene_instances(engine, &groups, xf)?,
            lights,
        }),
        Resolved::Light(settings) => {
            let light = engine.create(ObjectType::Light, light_subtype(settings.light_type))?;
            apply_light(engine, &light, &settings);
            ObjectBody::Light(LightParts {
                light_type: settings.light_type,
                light,
            })
        }
    })
}

fn update_in_place(
    engine: &dyn RenderEngine,
    existing: &mut SceneObject,
    resolved: Resolved,
    update: &ObjectUpdate,
) -> anyhow::Result<()> {
    let xf = &update.object2world;
    match (&mut existing.body, resolved) {
        (ObjectBody::Mesh(parts) | ObjectBody::Geometry(parts), Resolved::Model { geometry, material }) => {
            parts.apply(engine, geometry, material, xf);
        }
        (
            ObjectBody::Volume(parts),
            Resolved::Volume {
                volume,
                data_range,
                sampling_rate,
            },
        ) => parts.apply(engine, volume, data_range, sampling_rate, xf),
        (
            ObjectBody::Isosurfaces(parts),
            Resolved::Isosurfaces {
                volume,
                data_range,
                isovalues,
                material,
            },
        ) => parts.apply(engine, volume, data_range, isovalues, material, xf),
        (
            ObjectBody::Slices(parts),
            Resolved::Slices {
                volume,
                data_range,
                meshes,
            },
        ) => {
            let slices = build_slices(engine, &parts.vmodel, meshes)?;
            apply_volume_model(
                engine,
                &parts.vmodel,
                &parts.transfer_function,
                volume,
                data_range,
                None,
            );
            parts.slices = slices;
        }
        (ObjectBody::Scene(parts), Resolved::Scene { groups, lights }) => {
            parts.instances = build_scene_instances(engine, &groups, xf)?;
            parts.lights = lights;
        }
        (ObjectBody::Light(parts), Resolved::Light(settings)) => {
            apply_light(engine, &parts.light, &settings);
        }
        _ => anyhow::bail!("object '{}' kind does not match its update", update.name),
    }
    Ok(())
}

impl ModelParts {
    fn apply(&self, engine: &dyn RenderEngine, geometry: Handle, material: Handle, xf: &Mat4) {
        engine.set_param(&self.model, "geometry", Param::Object(geometry));
        engine.set_param(&self.model, "material", Param::ObjectList(vec![material]));
        engine.commit(&self.model);
        engine.set_param(&self.group, "geometry", Param::ObjectList(vec![self.model.clone()]));
        engine.commit(&self.group);
        place_instance(engine, &self.instance, &self.group, xf);
    }
}

impl VolumeParts {
    fn apply(
        &self,
        engine: &dyn RenderEngine,
        volume: Handle,
        data_range: [f32; 2],
        sampling_rate: f32,
        xf: &Mat4,
    ) {
        apply_volume_model(
            engine,
            &self.vmodel,
            &self.transfer_function,
            volume,
            data_range,
            Some(sampling_rate),
        );
        engine.set_param(&self.group, "volume", Param::ObjectList(vec![self.vmodel.clone()]));
        engine.commit(&self.group);
        place_instance(engine, &self.instance, &self.group, xf);
    }
}

impl IsosurfaceParts {
    fn apply(
        &mut self,
        engine: &dyn RenderEngine,
        volume: Handle,
        data_range: [f32; 2],
        isovalues: Vec<f32>,
        material: Handle,
        xf: &Mat4,
    ) {
        apply_volume_model(engine, &self.vmodel, &self.transfer_function, volume, data_range, None);
        engine.set_param(&self.geometry, "volume", Param::Object(self.vmodel.clone()));
        engine.set_param(&self.geometry, "isovalue", Param::FloatArray(isovalues.clone()));
        engine.commit(&self.geometry);
        engine.set_param(&self.model, "geometry", Param::Object(self.geometry.clone()));
        engine.set_param(&self.model, "material", Param::ObjectList(vec![material]));
        engine.commit(&self.model);
        engine.set_param(&self.group, "geometry", Param::ObjectList(vec![self.model.clone()]));
        engine.commit(&self.group);
        place_instance(engine, &self.instance, &self.group, xf);
        self.isovalues = isovalues;
    }
}

fn place_instance(engine: &dyn RenderEngine, instance: &Handle, group: &Handle, xf: &Mat4) {
    engine.set_param(instance, "group", Param::Object(group.clone()));
    engine.set_param(instance, "xfm", Param::Affine(affine_from_row_major(xf)));
    engine.commit(instance);
}

fn apply_volume_model(
    engine: &dyn RenderEngine,
    vmodel: &Handle,
    transfer_function: &Handle,
    volume: Handle,
    data_range: [f32; 2],
    sampling_rate: Option<f32>,
) {
    write_cool_to_warm(engine, transfer_function, data_range);
    engine.set_param(vmodel, "volume", Param::Object(volume));
    engine.set_param(vmodel, "transferFunction", Param::Object(transfer_function.clone()));
    if let Some(rate) = sampling_rate {
        engine.set_param(vmodel, "samplingRate", Param::Float(rate));
    }
    engine.commit(vmodel);
}

#[rustfmt::skip]
const COOL_TO_WARM: [[f32; 3]; 5] = [
    [0.231, 0.298, 0.753],
    [0.552, 0.690, 0.996],
    [0.866, 0.866, 0.866],
    [0.956, 0.604, 0.482],
    [0.706, 0.016, 0.150],
];

fn write_cool_to_warm(engine: &dyn RenderEngine, tf: &Handle, data_range: [f32; 2]) {
    let n = COOL_TO_WARM.len();
    let opacity: Vec<f32> = (0..n).map(|i| i as f32 / (n - 1) as f32).collect();
    engine.set_param(tf, "color", Param::Vec3fArray(COOL_TO_WARM.to_vec()));
    engine.set_param(tf, "opacity", Param::FloatArray(opacity));
    engine.set_param(tf, "valueRange", Param::Vec2f(data_range));
    engine.commit(tf);
}

/// Each slice textures its mesh with the sampled volume.
fn build_slices(
    engine: &dyn RenderEngine,
    vmodel: &Handle,
    meshes: Vec<(String, Handle, Mat4)>,
) -> anyhow::Result<Vec<SliceInstance>> {
    let mut slices = Vec::with_capacity(meshes.len());
    for (mesh_link, geometry, xf) in meshes {
        let texture = engine.create(ObjectType::Texture, "volume")?;
        engine.set_param(&texture, "volume", Param::Object(vmodel.clone()));
        engine.commit(&texture);

        let material = engine.create(ObjectType::Material, "obj")?;
        engine.set_param(&material, "map_Kd", Param::Object(texture));
        engine.commit(&material);

        let slice = SliceInstance {
            mesh_link,
            model: engine.create(ObjectType::GeometricModel, "")?,
            group: engine.create(ObjectType::Group, "")?,
            instance: engine.create(ObjectType::Instance, "")?,
            material,
        };
        engine.set_param(&slice.model, "geometry", Param::Object(geometry));
        engine.set_param(&slice.model, "material", Param::ObjectList(vec![slice.material.clone()]));
        engine.commit(&slice.model);
        engine.set_param(&slice.group, "geometry", Param::ObjectList(vec![slice.model.clone()]));
        engine.commit(&slice.group);
        place_instance(engine, &slice.instance, &slice.group, &xf);
        slices.push(slice);
    }
    Ok(slices)
}

fn build_scene_instances(
    engine: &dyn RenderEngine,
    groups: &[(Handle, Mat4)],
    object2world: &Mat4,
) -> anyhow::Result<Vec<Handle>> {
    groups
        .iter()
        .map(|(group, local)| {
            let instance = engine.create(ObjectType::Instance, "")?;
            place_instance(engine, &instance, group, &mat4_mul(object2world, local));
            Ok(instance)
        })
        .collect()
}

pub fn light_subtype(kind: LightKind) -> &'static str {
    match kind {
        LightKind::Point => "sphere",
        LightKind::Spot => "spot",
        LightKind::Sun => "distant",
        LightKind::Area => "quad",
        LightKind::Ambient => "ambient",
    }
}

fn apply_light(engine: &dyn RenderEngine, light: &Handle, s: &LightSettings) {
    match s.light_type {
        LightKind::Spot => {
            engine.set_param(light, "openingAngle", Param::Float(s.opening_angle));
            engine.set_param(light, "penumbraAngle", Param::Float(s.penumbra_angle));
        }
        LightKind::Sun => engine.set_param(light, "angularDiameter", Param::Float(s.angular_diameter)),
        LightKind::Area => {
            engine.set_param(light, "edge1", Param::Vec3f(s.edge1));
            engine.set_param(light, "edge2", Param::Vec3f(s.edge2));
        }
        LightKind::Point | LightKind::Ambient => {}
    }

    engine.set_param(light, "color", Param::Vec3f(s.color));
    engine.set_param(light, "intensity", Param::Float(s.intensity));
    engine.set_param(light, "visible", Param::Bool(s.visible));

    if !matches!(s.light_type, LightKind::Sun | LightKind::Ambient) {
        engine.set_param(light, "position", Param::Vec3f(s.position));
    }
    if matches!(s.light_type, LightKind::Sun | LightKind::Spot) {
        engine.set_param(light, "direction", Param::Vec3f(s.direction));
    }
    if matches!(s.light_type, LightKind::Point | LightKind::Spot) {
        engine.set_param(light, "radius", Param::Float(s.radius));
    }
    engine.commit(light);
}
