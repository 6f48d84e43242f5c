//! Content generators and the process-wide cache of their definitions.
//!
//! A generator is identified by `(kind, name)` and loaded at most once per
//! process. Each `UPDATE_PLUGIN_INSTANCE` either reuses the cached output stored
//! under the data name (same generator, same parameter and custom-property
//! hashes, same renderer when that matters) or regenerates it.

pub mod bound;
pub mod builtin;
pub mod dylib;
pub mod schema;

use std::{
    collections::HashMap,
    fmt,
    path::PathBuf,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use crate::protocol::PluginKind;
use crate::{
    engine::{Handle, RenderEngine},
    protocol::PluginInstanceUpdate,
    scene::SceneStore,
    transform::Mat4,
};
use bound::BoundingMesh;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterType {
    Int,
    Float,
    Bool,
    String,
    /// Opaque to the server; passed through unchecked.
    User,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PluginParameter {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ParameterType,
    pub length: usize,
    pub description: String,
}

impl PluginParameter {
    pub fn new(name: &str, ty: ParameterType, length: usize, description: &str) -> Self {
        Self {
            name: name.to_string(),
            ty,
            length,
            description: description.to_string(),
        }
    }
}

pub trait Generator: Send + Sync {
    fn generate(&self, ctx: &mut GenerateContext<'_>) -> Result<(), String>;
}

impl<F> Generator for F
where
    F: Fn(&mut GenerateContext<'_>) -> Result<(), String> + Send + Sync,
{
    fn generate(&self, ctx: &mut GenerateContext<'_>) -> Result<(), String> {
        self(ctx)
    }
}

pub struct PluginDefinition {
    pub kind: PluginKind,
    pub uses_renderer_type: bool,
    pub parameters: Vec<PluginParameter>,
    pub generator: Box<dyn Generator>,
}

impl fmt::Debug for PluginDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginDefinition")
            .field("kind", &self.kind)
            .field("uses_renderer_type", &self.uses_renderer_type)
            .field("parameters", &self.parameters)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PluginKey {
    pub kind: PluginKind,
    pub name: String,
}

impl PluginKey {
    pub fn new(kind: PluginKind, name: &str) -> Self {
        Self {
            kind,
            name: name.to_string(),
        }
    }
}

impl fmt::Display for PluginKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.kind.as_str(), self.name)
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("no plugin named '{0}'")]
    NotFound(String),
    #[error("failed to open plugin library {path}: {reason}")]
    Open { path: PathBuf, reason: String },
    #[error("plugin library {path} has no '{symbol}' entry point")]
    MissingSymbol { path: PathBuf, symbol: String },
    #[error("plugin '{0}' failed to initialize")]
    InitFailed(String),
    #[error("plugin '{key}' declares kind {declared:?}")]
    KindMismatch { key: String, declared: PluginKind },
}

#[derive(Debug, Error)]
pub enum PluginError {
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error("plugin parameter validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),
    #[error("generate function failed: {0}")]
    Generate(String),
    #[error("plugin did not produce {0}")]
    MissingOutput(&'static str),
}

/// Resolves a `(kind, name)` pair to a generator definition.
pub trait GeneratorProvider: Send + Sync {
    fn load(&self, key: &PluginKey) -> Result<PluginDefinition, LoadError>;
}

/// Tries each provider in order; `NotFound` falls through to the next one.
pub struct ProviderChain {
    providers: Vec<Arc<dyn GeneratorProvider>>,
}

impl ProviderChain {
    pub fn new(providers: Vec<Arc<dyn GeneratorProvider>>) -> Self {
        Self { providers }
    }
}

impl GeneratorProvider for ProviderChain {
    fn load(&self, key: &PluginKey) -> Result<PluginDefinition, LoadError> {
        for provider in &self.providers {
            match provider.load(key) {
                Err(LoadError::NotFound(_)) => continue,
                other => return other,
            }
        }
        Err(LoadError::NotFound(key.to_string()))
    }
}

/// What a generator hands back to the server.
pub struct GenerateContext<'a> {
    engine: &'a dyn RenderEngine,
    parameters: &'a Value,
    custom_properties: &'a Value,
    renderer: &'a str,
    geometry: Option<Handle>,
    volume: Option<(Handle, [f32; 2])>,
    groups: Vec<(Handle, Mat4)>,
    lights: Vec<Handle>,
    bound: Option<BoundingMesh>,
}

impl<'a> GenerateContext<'a> {
    pub fn new(
        engine: &'a dyn RenderEngine,
        parameters: &'a Value,
        custom_properties: &'a Value,
        renderer: &'a str,
    ) -> Self {
        Self {
            engine,
            parameters,
            custom_properties,
            renderer,
            geometry: None,
            volume: None,
            groups: Vec::new(),
            lights: Vec::new(),
            bound: None,
        }
    }

    pub fn engine(&self) -> &'a dyn RenderEngine {
        self.engine
    }

    pub fn parameters(&self) -> &'a Value {
        self.parameters
    }

    pub fn custom_properties(&self) -> &'a Value {
        self.custom_properties
    }

    pub fn renderer(&self) -> &'a str {
        self.renderer
    }

    pub fn float_param(&self, name: &str) -> Option<f32> {
        self.parameters.get(name)?.as_f64().map(|v| v as f32)
    }

    pub fn float_array<const N: usize>(&self, name: &str) -> Option<[f32; N]> {
        let items = self.parameters.get(name)?.as_array()?;
        let mut out = [0.0f32; N];
        if items.len() != N {
            return None;
        }
        for (slot, item) in out.iter_mut().zip(items) {
            *slot = item.as_f64()? as f32;
        }
        Some(out)
    }

    pub fn int_array<const N: usize>(&self, name: &str) -> Option<[i64; N]> {
        let items = self.parameters.get(name)?.as_array()?;
        let mut out = [0i64; N];
        if items.len() != N {
            return None;
        }
        for (slot, item) in out.iter_mut().zip(items) {
            *slot = item.as_i64()?;
        }
        Some(out)
    }

    pub fn set_geometry(&mut self, geometry: Handle) {
        self.geometry = Some(geometry);
    }

    pub fn set_volume(&mut self, volume: Handle, data_range: [f32; 2]) {
        self.volume = Some((volume, data_range));
    }

    pub fn add_group(&mut self, group: Handle, local_transform: Mat4) {
        self.groups.push((group, local_transform));
    }

    pub fn add_light(&mut self, light: Handle) {
        self.lights.push(light);
    }

    pub fn set_bound(&mut self, bound: BoundingMesh) {
        self.bound = Some(bound);
    }

    fn finish(self, kind: PluginKind) -> Result<PluginState, PluginError> {
        let content = match kind {
            PluginKind::Geometry => GeneratedContent::Geometry(
                self.geometry
                    .ok_or(PluginError::MissingOutput("a geometry"))?,
            ),
            PluginKind::Volume => {
                let (volume, data_range) =
                    self.volume.ok_or(PluginError::MissingOutput("a volume"))?;
                GeneratedContent::Volume { volume, data_range }
            }
            PluginKind::Scene => GeneratedContent::Scene {
                groups: self.groups,
                lights: self.lights,
            },
        };
        Ok(PluginState {
            content,
            bound: self.bound,
        })
    }
}

#[derive(Debug, Clone)]
pub enum GeneratedContent {
    Geometry(Handle),
    Volume {
        volume: Handle,
        data_range: [f32; 2],
    },
    Scene {
        groups: Vec<(Handle, Mat4)>,
        lights: Vec<Handle>,
    },
}

#[derive(Debug, Clone)]
pub struct PluginState {
    pub content: GeneratedContent,
    pub bound: Option<BoundingMesh>,
}

/// Cached output of one generator run, stored as scene data.
#[derive(Debug, Clone)]
pub struct PluginInstance {
    pub kind: PluginKind,
    pub plugin_name: String,
    pub parameters: Value,
    pub parameters_hash: String,
    pub custom_properties_hash: String,
    pub uses_renderer_type: bool,
    pub renderer: String,
    pub generate_time: Duration,
    pub state: PluginState,
}

impl PluginInstance {
    /// Why this instance can't serve the request, or `None` on a cache hit.
    pub fn mismatch(
        &self,
        update: &PluginInstanceUpdate,
        parameters_hash: &str,
        custom_properties_hash: &str,
        renderer: &str,
    ) -> Option<&'static str> {
        if self.kind != update.plugin_type {
            Some("plugin type changed")
        } else if self.plugin_name != update.plugin_name {
            Some("plugin name changed")
        } else if self.parameters_hash != parameters_hash {
            Some("parameters changed")
        } else if self.custom_properties_hash != custom_properties_hash {
            Some("custom properties changed")
        } else if self.uses_renderer_type && self.renderer != renderer {
            Some("renderer type changed")
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RunOutcome {
    CacheHit,
    Generated { elapsed: Duration },
}

pub fn content_hash(value: &Value) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    blake3::hash(&bytes).to_hex().to_string()
}

pub struct PluginCache {
    provider: Arc<dyn GeneratorProvider>,
    definitions: Mutex<HashMap<PluginKey, Arc<PluginDefinition>>>,
    invocations: AtomicU64,
}

impl PluginCache {
    pub fn new(provider: Arc<dyn GeneratorProvider>) -> Self {
        Self {
            provider,
            definitions: Mutex::new(HashMap::new()),
            invocations: AtomicU64::new(0),
        }
    }

    /// Loads the generator once per process. Failed loads are not remembered,
    /// so a later request retries.
    pub fn ensure_loaded(&self, kind: PluginKind, name: &str) -> Result<Arc<PluginDefinition>, LoadError> {
        let key = PluginKey::new(kind, name);
        let mut definitions = self
            .definitions
            .lock()
            .map_err(|_| LoadError::InitFailed(key.to_string()))?;
        if let Some(definition) = definitions.get(&key) {
            return Ok(definition.clone());
        }

        log::info!("[plugin] loading '{key}'");
        let definition = self.provider.load(&key)?;
        if definition.kind != kind {
            return Err(LoadError::KindMismatch {
                key: key.to_string(),
                declared: definition.kind,
            });
        }
        log::info!(
            "[plugin] '{key}' loaded ({} parameter(s), renderer dependent: {})",
            definition.parameters.len(),
            definition.uses_renderer_type
        );
        let definition = Arc::new(definition);
        definitions.insert(key, definition.clone());
        Ok(definition)
    }

    pub fn loaded_plugins(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .definitions
            .lock()
            .map(|d| d.keys().map(|k| k.to_string()).collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Total generator invocations since start.
    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::Relaxed)
    }

    pub fn run(
        &self,
        store: &mut SceneStore,
        engine: &dyn RenderEngine,
        update: &PluginInstanceUpdate,
        active_renderer: &str,
    ) -> Result<RunOutcome, PluginError> {
        let parameters_hash = content_hash(&update.plugin_parameters);
        let custom_properties_hash = content_hash(&update.custom_properties);

        if let Some(existing) = store.plugin_instance(&update.name) {
            match existing.mismatch(update, &parameters_hash, &custom_properties_hash, active_renderer) {
                None => {
                    log::info!("[plugin] '{}': cached output is up to date", update.name);
                    return Ok(RunOutcome::CacheHit);
                }
                Some(reason) => log::info!("[plugin] '{}': regenerating, {reason}", update.name),
            }
        }

        // The slot stays empty until a run succeeds.
        if store.delete_data(&update.name) {
            log::debug!("[plugin] released previous data '{}'", update.name);
        }

        let definition = self.ensure_loaded(update.plugin_type, &update.plugin_name)?;
        schema::validate_parameters(&definition.parameters, &update.plugin_parameters)
            .map_err(PluginError::Validation)?;

        let mut ctx = GenerateContext::new(
            engine,
            &update.plugin_parameters,
            &update.custom_properties,
            active_renderer,
        );
        let started = Instant::now();
        self.invocations.fetch_add(1, Ordering::Relaxed);
        definition
            .generator
            .generate(&mut ctx)
            .map_err(PluginError::Generate)?;
        let elapsed = started.elapsed();
        log::info!(
            "[plugin] '{}' generated in {:.3}s",
            update.name,
            elapsed.as_secs_f32()
        );

        let state = ctx.finish(update.plugin_type)?;
        store.insert_plugin_instance(
            &update.name,
            PluginInstance {
                kind: update.plugin_type,
                plugin_name: update.plugin_name.clone(),
                parameters: update.plugin_parameters.clone(),
                parameters_hash,
                custom_properties_hash,
                uses_renderer_type: definition.uses_renderer_type,
                renderer: active_renderer.to_string(),
                generate_time: elapsed,
                state,
            },
        );
        Ok(RunOutcome::Generated { elapsed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn plugin_key_formats_as_kind_and_name() {
        assert_eq!(PluginKey::new(PluginKind::Volume, "gradient").to_string(), "volume_gradient");
    }

    #[test]
    fn content_hash_depends_on_values() {
        let a = content_hash(&json!({"radius": 1.0}));
        assert_eq!(a, content_hash(&json!({"radius": 1.0})));
        assert_ne!(a, content_hash(&json!({"radius": 2.0})));
    }

    struct Missing;

    impl GeneratorProvider for Missing {
        fn load(&self, key: &PluginKey) -> Result<PluginDefinition, LoadError> {
            Err(LoadError::NotFound(key.to_string()))
        }
    }

    #[test]
    fn chain_falls_through_not_found() {
        let missing: Arc<dyn GeneratorProvider> = Arc::new(Missing);
        let builtins: Arc<dyn GeneratorProvider> = Arc::new(builtin::StaticProvider::with_builtins());
        let chain = ProviderChain::new(vec![missing, builtins]);
        let def = chain.load(&PluginKey::new(PluginKind::Geometry, "sphere")).unwrap();
        assert_eq!(def.kind, PluginKind::Geometry);
        assert!(matches!(
            chain.load(&PluginKey::new(PluginKind::Geometry, "teapot")),
            Err(LoadError::NotFound(name)) if name == "geometry_teapot"
        ));
    }

    #[test]
    fn failed_loads_are_not_cached() {
        let cache = PluginCache::new(Arc::new(Missing));
        assert!(cache.ensure_loaded(PluginKind::Scene, "x").is_err());
        assert!(cache.loaded_plugins().is_empty());
    }
}
