use std::{path::PathBuf, time::Duration};

use anyhow::{Result, anyhow};

use crate::{
    channel::{DEFAULT_MAX_BULK_SIZE, DEFAULT_MAX_MESSAGE_SIZE},
    protocol::DEFAULT_PORT,
};

pub const ENV_KEEP_FRAMEBUFFER_FILES: &str = "RENDER_SERVER_KEEP_FRAMEBUFFER_FILES";
pub const ENV_DUMP_CLIENT_MESSAGES: &str = "RENDER_SERVER_DUMP_CLIENT_MESSAGES";
pub const ENV_ABORT_ON_ENGINE_ERROR: &str = "RENDER_SERVER_ABORT_ON_ENGINE_ERROR";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub plugin_dirs: Vec<PathBuf>,
    /// Where final-quality frames are encoded before being streamed.
    pub framebuffer_dir: PathBuf,
    pub keep_framebuffer_files: bool,
    pub dump_client_messages: bool,
    pub abort_on_engine_error: bool,
    pub poll_interval: Duration,
    pub cancel_timeout: Duration,
    pub render_output_accept_timeout: Duration,
    pub max_message_size: usize,
    /// Largest bulk payload (raw mesh arrays) accepted from a client.
    pub max_bulk_size: usize,
    /// Simulated per-frame time of the software engine.
    pub software_frame_time: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: format!("0.0.0.0:{DEFAULT_PORT}"),
            plugin_dirs: vec![PathBuf::from("./plugins")],
            framebuffer_dir: std::env::temp_dir().join("scene-render-server"),
            keep_framebuffer_files: false,
            dump_client_messages: false,
            abort_on_engine_error: false,
            poll_interval: Duration::from_millis(1),
            cancel_timeout: Duration::from_secs(10),
            render_output_accept_timeout: Duration::from_secs(5),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_bulk_size: DEFAULT_MAX_BULK_SIZE,
            software_frame_time: None,
        }
    }
}

const USAGE: &str = "supported: --bind <addr>, --port <port>, --plugin-dir <dir> (repeatable), \
--framebuffer-dir <dir>, --keep-framebuffer-files, --dump-client-messages, \
--abort-on-engine-error, --frame-time-ms <ms>";

impl ServerConfig {
    pub fn from_args(args: &[String]) -> Result<Self> {
        let mut config = Self::default();
        let mut explicit_plugin_dirs = Vec::new();
        let mut i = 0;
        while i < args.len() {
            let value = |name: &str| {
                args.get(i + 1)
                    .cloned()
                    .ok_or_else(|| anyhow!("missing value for {name}"))
            };
            match args[i].as_str() {
                "--bind" => {
                    config.bind_addr = value("--bind")?;
                    i += 2;
                }
                "--port" => {
                    let port: u16 = value("--port")?
                        .parse()
                        .map_err(|e| anyhow!("invalid --port: {e}"))?;
                    config.bind_addr = format!("0.0.0.0:{port}");
                    i += 2;
                }
                "--plugin-dir" => {
                    explicit_plugin_dirs.push(PathBuf::from(value("--plugin-dir")?));
                    i += 2;
                }
                "--framebuffer-dir" => {
                    config.framebuffer_dir = PathBuf::from(value("--framebuffer-dir")?);
                    i += 2;
                }
                "--keep-framebuffer-files" => {
                    config.keep_framebuffer_files = true;
                    i += 1;
                }
                "--dump-client-messages" => {
                    config.dump_client_messages = true;
                    i += 1;
                }
                "--abort-on-engine-error" => {
                    config.abort_on_engine_error = true;
                    i += 1;
                }
                "--frame-time-ms" => {
                    let ms: u64 = value("--frame-time-ms")?
                        .parse()
                        .map_err(|e| anyhow!("invalid --frame-time-ms: {e}"))?;
                    config.software_frame_time = Some(Duration::from_millis(ms));
                    i += 2;
                }
                other => return Err(anyhow!("unknown argument: {other} ({USAGE})")),
            }
        }
        if !explicit_plugin_dirs.is_empty() {
            config.plugin_dirs = explicit_plugin_dirs;
        }
        Ok(config)
    }

    /// Applies the boolean environment switches. Any value other than
    /// empty, `0` or `false` turns a switch on.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let flag = |name: &str| {
            lookup(name).is_some_and(|v| {
                let v = v.trim();
                !(v.is_empty() || v == "0" || v.eq_ignore_ascii_case("false"))
            })
        };
        self.keep_framebuffer_files |= flag(ENV_KEEP_FRAMEBUFFER_FILES);
        self.dump_client_messages |= flag(ENV_DUMP_CLIENT_MESSAGES);
        self.abort_on_engine_error |= flag(ENV_ABORT_ON_ENGINE_ERROR);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn defaults_listen_on_protocol_port() {
        let config = ServerConfig::from_args(&[]).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:5909");
        assert_eq!(config.plugin_dirs, vec![PathBuf::from("./plugins")]);
        assert!(!config.keep_framebuffer_files);
    }

    #[test]
    fn parses_flags() {
        let config = ServerConfig::from_args(&args(&[
            "--bind",
            "127.0.0.1:7000",
            "--plugin-dir",
            "/a",
            "--plugin-dir",
            "/b",
            "--keep-framebuffer-files",
            "--frame-time-ms",
            "20",
        ]))
        .unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:7000");
        assert_eq!(config.plugin_dirs, vec![PathBuf::from("/a"), PathBuf::from("/b")]);
        assert!(config.keep_framebuffer_files);
        assert_eq!(config.software_frame_time, Some(Duration::from_millis(20)));
    }

    #[test]
    fn rejects_unknown_and_incomplete_flags() {
        let err = ServerConfig::from_args(&args(&["--nope"])).unwrap_err();
        assert!(err.to_string().contains("unknown argument: --nope"));
        let err = ServerConfig::from_args(&args(&["--bind"])).unwrap_err();
        assert!(err.to_string().contains("missing value for --bind"));
        assert!(ServerConfig::from_args(&args(&["--port", "x"])).is_err());
    }

    #[test]
    fn env_switches() {
        let mut config = ServerConfig::default();
        config.apply_env(|name| match name {
            ENV_DUMP_CLIENT_MESSAGES => Some("1".into()),
            ENV_KEEP_FRAMEBUFFER_FILES => Some("false".into()),
            _ => None,
        });
        assert!(config.dump_client_messages);
        assert!(!config.keep_framebuffer_files);
        assert!(!config.abort_on_engine_error);
    }
}
