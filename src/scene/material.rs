use std::collections::BTreeMap;

use anyhow::Result;
use serde::Serialize;

use crate::{
    engine::{Handle, ObjectType, Param, RenderEngine},
    protocol::{MaterialSettings, MaterialUpdate},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MaterialKind {
    CarPaint,
    Glass,
    Luminous,
    MetallicPaint,
    #[serde(rename = "OBJMaterial")]
    ObjMaterial,
    Principled,
}

impl MaterialKind {
    pub fn of(settings: &MaterialSettings) -> Self {
        match settings {
            MaterialSettings::CarPaint(_) => MaterialKind::CarPaint,
            MaterialSettings::Glass(_) => MaterialKind::Glass,
            MaterialSettings::Luminous(_) => MaterialKind::Luminous,
            MaterialSettings::MetallicPaint(_) => MaterialKind::MetallicPaint,
            MaterialSettings::ObjMaterial(_) => MaterialKind::ObjMaterial,
            MaterialSettings::Principled(_) => MaterialKind::Principled,
        }
    }

    pub fn engine_name(self) -> &'static str {
        match self {
            MaterialKind::CarPaint => "CarPaint",
            MaterialKind::Glass => "Glass",
            MaterialKind::Luminous => "Luminous",
            MaterialKind::MetallicPaint => "MetallicPaint",
            MaterialKind::ObjMaterial => "OBJMaterial",
            MaterialKind::Principled => "Principled",
        }
    }
}

/// Materials are created per renderer type.
pub fn material_subtype(renderer: &str, kind: MaterialKind) -> String {
    format!("{renderer}/{}", kind.engine_name())
}

/// Plain grey material used when an object has no (known) material link.
pub fn create_default_material(engine: &dyn RenderEngine, renderer: &str) -> Result<Handle> {
    let material = engine.create(
        ObjectType::Material,
        &material_subtype(renderer, MaterialKind::ObjMaterial),
    )?;
    engine.set_param(&material, "Kd", Param::Vec3f([0.8, 0.8, 0.8]));
    engine.commit(&material);
    Ok(material)
}

#[derive(Debug, Clone)]
pub struct SceneMaterial {
    pub kind: MaterialKind,
    pub handle: Handle,
}

#[derive(Debug, Default)]
pub struct MaterialRegistry {
    entries: BTreeMap<String, SceneMaterial>,
}

impl MaterialRegistry {
    pub fn get(&self, name: &str) -> Option<&SceneMaterial> {
        self.entries.get(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &SceneMaterial)> {
        self.entries.iter()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Creates or updates a material. A material whose kind changes gets a
    /// fresh engine object; the old one is released once nothing uses it.
    /// Returns `true` when a new engine object was created.
    pub fn apply(
        &mut self,
        engine: &dyn RenderEngine,
        renderer: &str,
        update: &MaterialUpdate,
    ) -> Result<bool> {
        let kind = MaterialKind::of(&update.settings);
        if let Some(existing) = self.entries.get(&update.name).filter(|m| m.kind == kind) {
            write_material_params(engine, &existing.handle, &update.settings);
            engine.commit(&existing.handle);
            return Ok(false);
        }

        let handle = engine.create(ObjectType::Material, &material_subtype(renderer, kind))?;
        write_material_params(engine, &handle, &update.settings);
        engine.commit(&handle);
        if let Some(previous) = self.entries.insert(update.name.clone(), SceneMaterial { kind, handle }) {
            log::info!(
                "[scene] material '{}' changed kind {:?} -> {:?}",
                update.name,
                previous.kind,
                kind
            );
        }
        Ok(true)
    }
}

fn write_material_params(engine: &dyn RenderEngine, m: &Handle, settings: &MaterialSettings) {
    let f = |name: &str, v: f32| engine.set_param(m, name, Param::Float(v));
    let c = |name: &str, v: [f32; 3]| engine.set_param(m, name, Param::Vec3f(v));

    match settings {
        MaterialSettings::CarPaint(s) => {
            c("baseColor", s.base_color);
            f("roughness", s.roughness);
            f("normal", s.normal);
            f("flakeDensity", s.flake_density);
            f("flakeScale", s.flake_scale);
            f("flakeSpread", s.flake_spread);
            f("flakeJitter", s.flake_jitter);
            f("flakeRoughness", s.flake_roughness);
            f("coat", s.coat);
            f("coatIor", s.coat_ior);
            c("coatColor", s.coat_color);
            f("coatThickness", s.coat_thickness);
            f("coatRoughness", s.coat_roughness);
            f("coatNormal", s.coat_normal);
            c("flipflopColor", s.flipflop_color);
            f("flipflopFalloff", s.flipflop_falloff);
        }
        MaterialSettings::Glass(s) => {
            f("eta", s.eta);
            c("attenuationColor", s.attenuation_color);
            f("attenuationDistance", s.attenuation_distance);
        }
        MaterialSettings::Luminous(s) => {
            c("color", s.color);
            f("intensity", s.intensity);
            f("transparency", s.transparency);
        }
        MaterialSettings::MetallicPaint(s) => {
            c("baseColor", s.base_color);
            c("flakeColor", s.flake_color);
            f("flakeAmount", s.flake_amount);
            f("flakeSpread", s.flake_spread);
            f("eta", s.eta);
        }
        MaterialSettings::ObjMaterial(s) => {
            c("Kd", s.kd);
            c("Ks", s.ks);
            f("Ns", s.ns);
            f("d", s.d);
        }
        MaterialSettings::Principled(s) => {
            c("baseColor", s.base_color);
            c("edgeColor", s.edge_color);
            f("metallic", s.metallic);
            f("diffuse", s.diffuse);
            f("specular", s.specular);
            f("ior", s.ior);
            f("transmission", s.transmission);
            c("transmissionColor", s.transmission_color);
            f("transmissionDepth", s.transmission_depth);
            f("roughness", s.roughness);
            f("anisotropy", s.anisotropy);
            f("rotation", s.rotation);
            f("normal", s.normal);
            f("baseNormal", s.base_normal);
            engine.set_param(m, "thin", Param::Bool(s.thin));
            f("thickness", s.thickness);
            f("backlight", s.backlight);
            f("coat", s.coat);
            f("coatIor", s.coat_ior);
            c("coatColor", s.coat_color);
            f("coatThickness", s.coat_thickness);
            f("coatRoughness", s.coat_roughness);
            f("coatNormal", s.coat_normal);
            f("sheen", s.sheen);
            c("sheenColor", s.sheen_color);
            f("sheenTint", s.sheen_tint);
            f("sheenRoughness", s.sheen_roughness);
            f("opacity", s.opacity);
        }
    }
}
