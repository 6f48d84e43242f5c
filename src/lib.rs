pub mod channel;
pub mod config;
pub mod engine;
pub mod plugin;
pub mod protocol;
pub mod render;
pub mod scene;
pub mod server;
pub mod session;
pub mod transform;
