//! Generators shipped as shared libraries named after their key, e.g.
//! `volume_gradient.so` (or `libvolume_gradient.so`), found in the configured
//! plugin directories.
//!
//! A library exports `initialize`, which fills in a [`PluginDeclaration`].
//! Declarations carry Rust types, so libraries must be built with the same
//! toolchain as the server.

use std::{
    env::consts::DLL_EXTENSION,
    path::{Path, PathBuf},
    sync::Arc,
};

use libloading::{Library, Symbol};

use super::{
    GenerateContext, Generator, GeneratorProvider, LoadError, PluginDefinition, PluginKey,
    PluginKind, PluginParameter,
};

pub const INITIALIZE_SYMBOL: &[u8] = b"initialize";

pub type GenerateFn = fn(&mut GenerateContext<'_>) -> Result<(), String>;

pub type InitializeFn = unsafe extern "Rust" fn(declaration: &mut PluginDeclaration) -> bool;

#[derive(Debug, Default)]
pub struct PluginDeclaration {
    pub kind: Option<PluginKind>,
    pub uses_renderer_type: bool,
    pub parameters: Vec<PluginParameter>,
    pub generate: Option<GenerateFn>,
}

struct DylibGenerator {
    generate: GenerateFn,
    // Keeps the code behind `generate` mapped.
    _library: Arc<Library>,
}

impl Generator for DylibGenerator {
    fn generate(&self, ctx: &mut GenerateContext<'_>) -> Result<(), String> {
        (self.generate)(ctx)
    }
}

pub struct DylibProvider {
    dirs: Vec<PathBuf>,
}

impl DylibProvider {
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self { dirs }
    }

    pub fn candidates(&self, key: &PluginKey) -> Vec<PathBuf> {
        let stem = key.to_string();
        let plain = format!("{stem}.{DLL_EXTENSION}");
        let prefixed = libloading::library_filename(&stem);
        self.dirs
            .iter()
            .flat_map(|dir| [dir.join(&plain), dir.join(&prefixed)])
            .collect()
    }

    fn load_from(&self, key: &PluginKey, path: &Path) -> Result<PluginDefinition, LoadError> {
        log::info!("[plugin] opening {}", path.display());
        let library = unsafe { Library::new(path) }.map_err(|e| LoadError::Open {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let mut declaration = PluginDeclaration::default();
        let initialized = {
            let initialize: Symbol<InitializeFn> =
                unsafe { library.get(INITIALIZE_SYMBOL) }.map_err(|_| LoadError::MissingSymbol {
                    path: path.to_path_buf(),
                    symbol: "initialize".to_string(),
                })?;
            unsafe { initialize(&mut declaration) }
        };
        if !initialized {
            return Err(LoadError::InitFailed(key.to_string()));
        }

        let Some(generate) = declaration.generate else {
            return Err(LoadError::MissingSymbol {
                path: path.to_path_buf(),
                symbol: "generate".to_string(),
            });
        };

        Ok(PluginDefinition {
            kind: declaration.kind.unwrap_or(key.kind),
            uses_renderer_type: declaration.uses_renderer_type,
            parameters: declaration.parameters,
            generator: Box::new(DylibGenerator {
                generate,
                _library: Arc::new(library),
            }),
        })
    }
}

impl GeneratorProvider for DylibProvider {
    fn load(&self, key: &PluginKey) -> Result<PluginDefinition, LoadError> {
        match self.candidates(key).into_iter().find(|p| p.is_file()) {
            Some(path) => self.load_from(key, &path),
            None => Err(LoadError::NotFound(key.to_string())),
        }
    }
}
