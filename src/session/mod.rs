//! Server-lifetime state: the scene store plus renderer, camera, settings and
//! framebuffer configuration. It outlives client connections, so a client
//! that reconnects finds the scene it left behind.

pub mod settings;

use std::{collections::BTreeMap, sync::Arc};

use anyhow::{Context, Result, anyhow, bail};
use serde_json::{Value, json};

use crate::{
    engine::{Handle, ObjectType, Param, RenderEngine},
    plugin::{PluginCache, PluginError, RunOutcome},
    protocol::{
        CameraSettings, FramebufferFormat, MaterialUpdate, ObjectUpdate, PluginInstanceUpdate,
        RawMeshHeader, RenderSettings, WorldSettings, now_millis,
    },
    render::{FramebufferSpec, RenderInputs},
    scene::{
        SceneStore, UpdateError,
        material::create_default_material,
        mesh::MeshArrays,
        object::ObjectContext,
    },
};

pub const RENDERER_TYPES: [&str; 2] = ["scivis", "pathtracer"];
pub const DEFAULT_RENDERER: &str = "scivis";

pub struct Session {
    engine: Arc<dyn RenderEngine>,
    pub store: SceneStore,
    renderer_type: String,
    renderers: BTreeMap<String, Handle>,
    default_materials: BTreeMap<String, Handle>,
    ambient_light: Handle,
    camera: Option<Handle>,
    camera_settings: Option<CameraSettings>,
    render_settings: RenderSettings,
    world_settings: WorldSettings,
    framebuffer: Option<FramebufferSpec>,
}

impl Session {
    pub fn new(engine: Arc<dyn RenderEngine>) -> Result<Self> {
        let mut renderers = BTreeMap::new();
        let mut default_materials = BTreeMap::new();
        for ty in RENDERER_TYPES {
            let renderer = engine
                .create(ObjectType::Renderer, ty)
                .with_context(|| format!("failed to create '{ty}' renderer"))?;
            renderers.insert(ty.to_string(), renderer);
            default_materials.insert(ty.to_string(), create_default_material(engine.as_ref(), ty)?);
        }
        let ambient_light = engine.create(ObjectType::Light, "ambient")?;

        let session = Self {
            engine,
            store: SceneStore::default(),
            renderer_type: DEFAULT_RENDERER.to_string(),
            renderers,
            default_materials,
            ambient_light,
            camera: None,
            camera_settings: None,
            render_settings: RenderSettings::default(),
            world_settings: WorldSettings::default(),
            framebuffer: None,
        };
        session.apply_settings_to_renderer()?;
        Ok(session)
    }

    pub fn engine(&self) -> &dyn RenderEngine {
        self.engine.as_ref()
    }

    pub fn renderer_type(&self) -> &str {
        &self.renderer_type
    }

    pub fn framebuffer(&self) -> Option<FramebufferSpec> {
        self.framebuffer
    }

    pub fn has_camera(&self) -> bool {
        self.camera.is_some()
    }

    fn renderer(&self) -> Result<&Handle> {
        self.renderers
            .get(&self.renderer_type)
            .ok_or_else(|| anyhow!("no renderer of type '{}'", self.renderer_type))
    }

    fn apply_settings_to_renderer(&self) -> Result<()> {
        let renderer = self.renderer()?;
        settings::apply_render_settings(self.engine(), renderer, &self.renderer_type, &self.render_settings);
        settings::apply_world_settings(
            self.engine(),
            renderer,
            &self.renderer_type,
            &self.ambient_light,
            &self.world_settings,
        )
    }

    /// Switching renderer type drops all materials, which are per renderer;
    /// the client resends the ones it needs.
    pub fn set_renderer_type(&mut self, renderer_type: &str) -> Result<()> {
        if renderer_type == self.renderer_type {
            return Ok(());
        }
        if !self.renderers.contains_key(renderer_type) {
            bail!("unknown renderer type '{renderer_type}'");
        }
        log::info!("[scene] renderer type {} -> {renderer_type}", self.renderer_type);
        self.renderer_type = renderer_type.to_string();
        self.store.materials.clear();
        self.apply_settings_to_renderer()
    }

    pub fn update_render_settings(&mut self, s: RenderSettings) -> Result<()> {
        settings::apply_render_settings(self.engine(), self.renderer()?, &self.renderer_type, &s);
        self.render_settings = s;
        Ok(())
    }

    pub fn update_world_settings(&mut self, s: WorldSettings) -> Result<()> {
        settings::apply_world_settings(
            self.engine(),
            self.renderer()?,
            &self.renderer_type,
            &self.ambient_light,
            &s,
        )?;
        self.world_settings = s;
        Ok(())
    }

    pub fn update_camera(&mut self, s: CameraSettings) -> Result<()> {
        let camera = settings::build_camera(self.engine(), &s)?;
        log::debug!("[scene] camera '{}' ({:?})", s.object_name, s.kind);
        self.camera = Some(camera);
        self.camera_settings = Some(s);
        Ok(())
    }

    pub fn update_framebuffer(&mut self, format: FramebufferFormat, width: u32, height: u32) -> Result<()> {
        if width == 0 || height == 0 {
            bail!("framebuffer size {width}x{height} is empty");
        }
        self.framebuffer = Some(FramebufferSpec { format, width, height });
        Ok(())
    }

    pub fn update_material(&mut self, update: &MaterialUpdate) -> Result<()> {
        let created = self
            .store
            .materials
            .apply(self.engine.as_ref(), &self.renderer_type, update)?;
        log::debug!(
            "[scene] material '{}' {}",
            update.name,
            if created { "created" } else { "updated" }
        );
        Ok(())
    }

    pub fn update_object(&mut self, update: &ObjectUpdate) -> Result<(), UpdateError> {
        let default_material = self
            .default_materials
            .get(&self.renderer_type)
            .ok_or_else(|| UpdateError::Invalid(format!("no default material for '{}'", self.renderer_type)))?;
        let ctx = ObjectContext {
            engine: self.engine.as_ref(),
            renderer: &self.renderer_type,
            default_material,
        };
        self.store.upsert_object(&ctx, update)
    }

    pub fn update_raw_mesh(&mut self, header: &RawMeshHeader, payload: &[u8]) -> Result<(), UpdateError> {
        let arrays = MeshArrays::decode(header, payload).map_err(|e| UpdateError::Invalid(e.to_string()))?;
        self.store.upsert_raw_mesh(self.engine.as_ref(), header, arrays)
    }

    pub fn run_plugin(
        &mut self,
        plugins: &PluginCache,
        update: &PluginInstanceUpdate,
    ) -> Result<RunOutcome, PluginError> {
        plugins.run(&mut self.store, self.engine.as_ref(), update, &self.renderer_type)
    }

    pub fn clear_scene(&mut self, include_data: bool) {
        log::info!(
            "[scene] clearing {} object(s){}",
            self.store.object_count(),
            if include_data { " and all data" } else { "" }
        );
        self.store.clear_objects();
        if include_data {
            self.store.clear_data();
            self.store.materials.clear();
        }
    }

    /// Builds a fresh world from the current scene, ready to render.
    pub fn prepare_world(&self) -> Result<RenderInputs> {
        let camera = self.camera.clone().context("no camera has been set")?;
        let renderer = self.renderer()?.clone();

        let instances = self.store.world_instances();
        let mut lights = vec![self.ambient_light.clone()];
        lights.extend(self.store.world_lights());

        let world = self.engine.create(ObjectType::World, "")?;
        if !instances.is_empty() {
            self.engine.set_param(&world, "instance", Param::ObjectList(instances.clone()));
        }
        self.engine.set_param(&world, "light", Param::ObjectList(lights.clone()));
        self.engine.commit(&world);
        log::info!(
            "[render] world has {} instance(s) and {} light(s)",
            instances.len(),
            lights.len()
        );

        Ok(RenderInputs {
            renderer,
            camera,
            world,
            instance_count: instances.len(),
            light_count: lights.len(),
        })
    }

    /// Serialized proxy mesh of a plugin output.
    pub fn query_bound(&self, name: &str) -> std::result::Result<Vec<u8>, String> {
        let instance = self
            .store
            .plugin_instance(name)
            .ok_or_else(|| format!("No plugin state for id '{name}'"))?;
        let bound = instance
            .state
            .bound
            .as_ref()
            .ok_or_else(|| "No bound specified".to_string())?;
        Ok(bound.serialize())
    }

    pub fn server_state(&self, plugins: &PluginCache) -> Value {
        let mut state = self.store.snapshot();
        state["timestamp"] = json!(now_millis());
        state["engine"] = json!(self.engine.name());
        state["renderer_type"] = json!(self.renderer_type);
        state["camera"] = match &self.camera_settings {
            Some(c) => json!({ "object_name": c.object_name, "kind": c.kind }),
            None => Value::Null,
        };
        state["framebuffer"] = match self.framebuffer {
            Some(fb) => json!({ "format": fb.format, "width": fb.width, "height": fb.height }),
            None => Value::Null,
        };
        state["render_settings"] = json!(self.render_settings);
        state["world_settings"] = json!(self.world_settings);
        state["world"] = json!({
            "instances": self.store.world_instances().len(),
            // The ambient light is always part of the world.
            "lights": self.store.world_lights().len() + 1,
            "stale_objects": self.store.stale_objects(),
        });
        state["plugins_loaded"] = json!(plugins.loaded_plugins());
        state["plugin_invocations"] = json!(plugins.invocations());
        state
    }
}
