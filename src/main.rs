use std::sync::Arc;

use anyhow::Result;
use env_logger::Env;
use scene_render_server::{
    config::ServerConfig,
    engine::{RenderEngine, log_status_callback, software::SoftwareEngine},
    plugin::{GeneratorProvider, PluginCache, ProviderChain, builtin::StaticProvider, dylib::DylibProvider},
    server::Server,
};

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let argv: Vec<String> = std::env::args().skip(1).collect();
    let mut config = ServerConfig::from_args(&argv)?;
    config.apply_env(|name| std::env::var(name).ok());
    log::info!(
        "[server] plugin dirs {:?}, framebuffer dir {}",
        config.plugin_dirs,
        config.framebuffer_dir.display()
    );

    let mut engine = SoftwareEngine::new();
    if let Some(frame_time) = config.software_frame_time {
        engine = engine.with_frame_time(frame_time);
    }
    engine.set_status_callback(log_status_callback(config.abort_on_engine_error));
    let engine: Arc<dyn RenderEngine> = Arc::new(engine);

    let builtins: Arc<dyn GeneratorProvider> = Arc::new(StaticProvider::with_builtins());
    let dylibs: Arc<dyn GeneratorProvider> = Arc::new(DylibProvider::new(config.plugin_dirs.clone()));
    let providers = ProviderChain::new(vec![builtins, dylibs]);
    let plugins = Arc::new(PluginCache::new(Arc::new(providers)));

    Server::bind(config, engine, plugins)?.serve()
}
