//! TCP accept loop and the per-connection control loop.
//!
//! Connections are served one at a time. The [`Session`] (scene, plugins,
//! renderer state) belongs to the server and survives reconnects; each
//! connection drives its own [`RenderScheduler`].

use std::{
    net::{SocketAddr, TcpListener, TcpStream},
    sync::Arc,
    thread,
    time::Instant,
};

use anyhow::{Context, Result};

use crate::{
    channel::{ChannelError, MessageChannel, Transport},
    config::ServerConfig,
    engine::RenderEngine,
    plugin::{PluginCache, RunOutcome},
    protocol::{ClientMessage, PROTOCOL_VERSION, RenderMode, ServerMessage},
    render::{
        Bulk, RenderEvent, RenderRequest, RenderScheduler,
        scheduler::SchedulerConfig,
    },
    session::Session,
};

/// Why a connection loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEnd {
    Bye,
    /// The client asked the whole server to stop.
    Quit,
    Closed,
    VersionMismatch,
    HandshakeMissing,
}

pub struct Server {
    listener: TcpListener,
    config: ServerConfig,
    session: Session,
    plugins: Arc<PluginCache>,
}

impl Server {
    pub fn bind(config: ServerConfig, engine: Arc<dyn RenderEngine>, plugins: Arc<PluginCache>) -> Result<Self> {
        let listener = TcpListener::bind(&config.bind_addr)
            .with_context(|| format!("failed to bind render server at {}", config.bind_addr))?;
        let session = Session::new(engine).context("failed to set up render session")?;
        Ok(Self {
            listener,
            config,
            session,
            plugins,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serves connections until a client sends QUIT.
    pub fn serve(mut self) -> Result<()> {
        log::info!("[server] listening on {}", self.local_addr()?);

        for stream in self.listener.incoming() {
            let stream = match stream {
                Ok(s) => s,
                Err(e) => {
                    log::warn!("[server] accept failed: {e}");
                    continue;
                }
            };
            let peer = stream
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "<unknown>".to_string());
            if let Err(e) = stream.set_nodelay(true) {
                log::debug!("[server] set_nodelay failed: {e}");
            }
            log::info!("[server] client {peer} connected");

            let connection = Connection::new(stream, &mut self.session, &self.plugins, &self.config);
            match connection.run() {
                Ok(ConnectionEnd::Quit) => {
                    log::info!("[server] client {peer} requested shutdown");
                    break;
                }
                Ok(end) => log::info!("[server] client {peer} finished ({end:?})"),
                Err(e) => log::warn!("[server] client {peer} ended: {e:#}"),
            }
        }

        log::info!("[server] stopped");
        Ok(())
    }
}

pub struct Connection<'a, T: Transport> {
    channel: MessageChannel<T>,
    output: Option<MessageChannel<TcpStream>>,
    session: &'a mut Session,
    plugins: &'a PluginCache,
    config: &'a ServerConfig,
    scheduler: RenderScheduler,
    greeted: bool,
}

impl<'a, T: Transport> Connection<'a, T> {
    pub fn new(stream: T, session: &'a mut Session, plugins: &'a PluginCache, config: &'a ServerConfig) -> Self {
        let scheduler = RenderScheduler::new(SchedulerConfig {
            cancel_timeout: config.cancel_timeout,
            framebuffer_dir: config.framebuffer_dir.clone(),
        });
        Self {
            channel: MessageChannel::new(stream)
                .with_max_message_size(config.max_message_size)
                .with_max_bulk_size(config.max_bulk_size),
            output: None,
            session,
            plugins,
            config,
            scheduler,
            greeted: false,
        }
    }

    pub fn channel(&self) -> &MessageChannel<T> {
        &self.channel
    }

    pub fn scheduler(&self) -> &RenderScheduler {
        &self.scheduler
    }

    /// Runs until the client leaves. Any channel failure ends the connection.
    pub fn run(mut self) -> Result<ConnectionEnd> {
        let end = loop {
            match self.tick() {
                Ok(Some(end)) => break Ok(end),
                Ok(None) => {}
                Err(e) if is_disconnect(&e) => break Ok(ConnectionEnd::Closed),
                Err(e) => break Err(e),
            }
            thread::sleep(self.config.poll_interval);
        };
        self.shutdown();
        end
    }

    /// One iteration of the loop: at most one client message, then one
    /// scheduler poll, then forwarding of any render results.
    pub fn tick(&mut self) -> Result<Option<ConnectionEnd>> {
        if self.channel.poll_readable()? {
            let message = match self.channel.receive::<ClientMessage>() {
                Ok(m) => m,
                Err(ChannelError::Closed) => return Ok(Some(ConnectionEnd::Closed)),
                Err(e) => return Err(e).context("failed to read client message"),
            };
            if let Some(end) = self.handle(message)? {
                return Ok(Some(end));
            }
        }

        if !self.scheduler.is_idle() {
            self.scheduler.poll(self.session.engine());
        }
        self.flush_render_events()?;
        Ok(None)
    }

    fn handle(&mut self, message: ClientMessage) -> Result<Option<ConnectionEnd>> {
        if self.config.dump_client_messages {
            log::info!("[server] <- {message:?}");
        } else {
            log::debug!("[server] <- {}", message.name());
        }

        if !self.greeted {
            return match message {
                ClientMessage::Hello { version } => self.handle_hello(version),
                other => {
                    log::warn!("[server] expected HELLO, got {}", other.name());
                    self.channel.send(&ServerMessage::error(
                        "HANDSHAKE_REQUIRED",
                        format!("expected HELLO before {}", other.name()),
                    ))?;
                    Ok(Some(ConnectionEnd::HandshakeMissing))
                }
            };
        }

        let stops_rendering = message.is_structural_edit()
            || matches!(message, ClientMessage::Bye | ClientMessage::Quit);
        if stops_rendering && self.scheduler.force_idle(self.session.engine()) {
            log::info!("[render] stopped active run for {}", message.name());
            self.flush_render_events()?;
        }

        match message {
            ClientMessage::Hello { version } => return self.handle_hello(version),
            ClientMessage::Bye => return Ok(Some(ConnectionEnd::Bye)),
            ClientMessage::Quit => return Ok(Some(ConnectionEnd::Quit)),
            ClientMessage::ClearScene { include_data } => self.session.clear_scene(include_data),
            ClientMessage::UpdateRendererType { renderer } => {
                let result = self.session.set_renderer_type(&renderer);
                self.report_setting("UPDATE_RENDERER_TYPE", result)?;
            }
            ClientMessage::UpdateRenderSettings(settings) => {
                let result = self.session.update_render_settings(settings);
                self.report_setting("UPDATE_RENDER_SETTINGS", result)?;
            }
            ClientMessage::UpdateWorldSettings(settings) => {
                let result = self.session.update_world_settings(settings);
                self.report_setting("UPDATE_WORLD_SETTINGS", result)?;
            }
            ClientMessage::UpdateCamera(camera) => {
                let result = self.session.update_camera(camera);
                self.report_setting("UPDATE_CAMERA", result)?;
            }
            ClientMessage::UpdateFramebuffer { format, width, height } => {
                let result = self.session.update_framebuffer(format, width, height);
                self.report_setting("UPDATE_FRAMEBUFFER", result)?;
            }
            ClientMessage::UpdateMaterial(update) => {
                let result = self.session.update_material(&update).map_err(|e| format!("{e:#}"));
                self.send_update_result(&update.name, result)?;
            }
            ClientMessage::UpdatePluginInstance(update) => {
                let reply = match self.session.run_plugin(self.plugins, &update) {
                    Ok(RunOutcome::CacheHit) => ServerMessage::GenerateResult {
                        success: true,
                        message: "cached".to_string(),
                    },
                    Ok(RunOutcome::Generated { elapsed }) => ServerMessage::GenerateResult {
                        success: true,
                        message: format!("generated in {:.3}s", elapsed.as_secs_f32()),
                    },
                    Err(e) => {
                        log::warn!("[plugin] '{}': {e}", update.name);
                        ServerMessage::GenerateResult {
                            success: false,
                            message: e.to_string(),
                        }
                    }
                };
                self.channel.send(&reply)?;
            }
            ClientMessage::UpdateRawMesh(header) => {
                // Sizes past the bulk limit are refused before anything is read.
                let size = usize::try_from(header.bulk_size()).unwrap_or(usize::MAX);
                let payload = self.channel.receive_bytes(size)?;
                let result = self
                    .session
                    .update_raw_mesh(&header, &payload)
                    .map_err(|e| e.to_string());
                self.send_update_result(&header.name, result)?;
            }
            ClientMessage::UpdateObject(update) => {
                let result = self.session.update_object(&update).map_err(|e| e.to_string());
                self.send_update_result(&update.name, result)?;
            }
            ClientMessage::GetServerState => {
                let mut state = self.session.server_state(self.plugins);
                state["render_state"] = serde_json::json!(self.scheduler.state());
                self.channel.send(&ServerMessage::ServerState { state })?;
            }
            ClientMessage::QueryBound { name } => match self.session.query_bound(&name) {
                Ok(bytes) => {
                    let result_size = u32::try_from(bytes.len())
                        .with_context(|| format!("bound of '{name}' is too large to send"))?;
                    self.channel.send(&ServerMessage::QueryBoundResult {
                        success: true,
                        message: String::new(),
                        result_size,
                    })?;
                    self.channel.send_bytes(&bytes)?;
                }
                Err(message) => {
                    self.channel.send(&ServerMessage::QueryBoundResult {
                        success: false,
                        message,
                        result_size: 0,
                    })?;
                }
            },
            ClientMessage::StartRendering {
                mode,
                samples,
                reduction_ceiling,
            } => {
                let request = RenderRequest {
                    mode,
                    samples,
                    reduction_ceiling,
                };
                if let Err(e) = self.start_rendering(request) {
                    log::warn!("[render] START_RENDERING refused: {e:#}");
                    self.channel
                        .send(&ServerMessage::error("RENDER_START_FAILED", format!("{e:#}")))?;
                }
            }
            ClientMessage::CancelRendering => {
                if !self.scheduler.request_cancel() {
                    log::debug!("[render] CANCEL_RENDERING while idle");
                }
            }
            ClientMessage::RequestRenderOutput => self.attach_render_output()?,
        }
        Ok(None)
    }

    fn handle_hello(&mut self, version: u32) -> Result<Option<ConnectionEnd>> {
        if version != PROTOCOL_VERSION {
            log::warn!("[server] protocol version mismatch: client {version}, server {PROTOCOL_VERSION}");
            self.channel.send(&ServerMessage::HelloResult {
                success: false,
                message: format!("protocol version mismatch: server speaks {PROTOCOL_VERSION}, client {version}"),
            })?;
            return Ok(Some(ConnectionEnd::VersionMismatch));
        }
        self.greeted = true;
        self.channel.send(&ServerMessage::HelloResult {
            success: true,
            message: String::new(),
        })?;
        Ok(None)
    }

    fn start_rendering(&mut self, request: RenderRequest) -> Result<()> {
        if !self.scheduler.is_idle() {
            anyhow::bail!("a {:?} render is already in progress", self.scheduler.state());
        }
        let spec = self
            .session
            .framebuffer()
            .context("no framebuffer configured (send UPDATE_FRAMEBUFFER first)")?;
        let inputs = self.session.prepare_world()?;
        if request.mode == RenderMode::Final && request.reduction_ceiling > 1 {
            log::debug!("[render] final run ignores reduction ceiling {}", request.reduction_ceiling);
        }
        self.scheduler.start(self.session.engine(), request, spec, inputs)
    }

    fn attach_render_output(&mut self) -> Result<()> {
        let host = self
            .config
            .bind_addr
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or("0.0.0.0");
        let listener = TcpListener::bind((host, 0)).context("failed to open render output listener")?;
        let port = listener.local_addr()?.port();
        listener.set_nonblocking(true)?;
        self.channel.send(&ServerMessage::RenderOutput { port })?;

        let deadline = Instant::now() + self.config.render_output_accept_timeout;
        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    stream.set_nonblocking(false)?;
                    let _ = stream.set_nodelay(true);
                    log::info!("[server] render output attached from {peer}");
                    self.output = Some(MessageChannel::new(stream).with_max_message_size(self.config.max_message_size));
                    return Ok(());
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        log::warn!("[server] no render output connection on port {port}");
                        self.channel.send(&ServerMessage::error(
                            "RENDER_OUTPUT_TIMEOUT",
                            format!("nobody connected to port {port}"),
                        ))?;
                        return Ok(());
                    }
                    thread::sleep(self.config.poll_interval);
                }
                Err(e) => return Err(e).context("render output accept failed"),
            }
        }
    }

    fn report_setting(&mut self, what: &str, result: Result<()>) -> Result<()> {
        if let Err(e) = result {
            log::warn!("[scene] {what} rejected: {e:#}");
            self.channel.send(&ServerMessage::error("UPDATE_REJECTED", format!("{what}: {e:#}")))?;
        }
        Ok(())
    }

    fn send_update_result(&mut self, name: &str, result: std::result::Result<(), String>) -> Result<()> {
        let reply = match result {
            Ok(()) => ServerMessage::UpdateResult {
                success: true,
                message: String::new(),
            },
            Err(message) => {
                log::warn!("[scene] update of '{name}' rejected: {message}");
                ServerMessage::UpdateResult {
                    success: false,
                    message,
                }
            }
        };
        self.channel.send(&reply)?;
        Ok(())
    }

    /// Sends queued render results, preferring the attached output channel.
    fn flush_render_events(&mut self) -> Result<()> {
        while let Some(event) = self.scheduler.pop_event() {
            let sent = match self.output.as_mut() {
                Some(output) => match send_event(output, &event) {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        log::warn!("[server] render output channel lost, falling back to control: {e}");
                        self.output = None;
                        send_event(&mut self.channel, &event)
                    }
                },
                None => send_event(&mut self.channel, &event),
            };
            self.discard_bulk(&event);
            sent?;
        }
        Ok(())
    }

    fn discard_bulk(&self, event: &RenderEvent) {
        if let Some(Bulk::File(path)) = &event.bulk {
            if !self.config.keep_framebuffer_files {
                if let Err(e) = std::fs::remove_file(path) {
                    log::debug!("[render] could not remove {}: {e}", path.display());
                }
            }
        }
    }

    fn shutdown(&mut self) {
        self.scheduler.force_idle(self.session.engine());
        if let Err(e) = self.flush_render_events() {
            log::debug!("[server] dropping render results: {e:#}");
        }
        for event in self.scheduler.drain_events() {
            self.discard_bulk(&event);
        }
    }
}

fn send_event<S: Transport>(channel: &mut MessageChannel<S>, event: &RenderEvent) -> Result<(), ChannelError> {
    channel.send(&event.message)?;
    match &event.bulk {
        None => {}
        Some(Bulk::Pixels(pixels)) => channel.send_bytes(pixels)?,
        Some(Bulk::File(path)) => {
            channel.send_file(path)?;
        }
    }
    Ok(())
}

fn is_disconnect(error: &anyhow::Error) -> bool {
    error
        .chain()
        .filter_map(|e| e.downcast_ref::<ChannelError>())
        .any(ChannelError::is_disconnect)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::MemoryTransport,
        engine::software::SoftwareEngine,
        plugin::builtin::StaticProvider,
        protocol::{
            CameraKind, CameraSettings, FramebufferFormat, PluginInstanceUpdate, PluginKind, RawMeshHeader,
        },
    };
    use serde_json::json;
    use std::{net::Shutdown, time::Duration};

    fn encode(messages: &[ClientMessage]) -> Vec<u8> {
        let mut channel = MessageChannel::new(MemoryTransport::default());
        for m in messages {
            channel.send(m).unwrap();
        }
        channel.into_inner().output
    }

    fn decode_all(bytes: &[u8]) -> Vec<ServerMessage> {
        let mut transport = MemoryTransport::default();
        transport.push_input(bytes);
        let mut channel = MessageChannel::new(transport);
        let mut out = Vec::new();
        while !channel.get_ref().input.is_empty() {
            let message: ServerMessage = channel.receive().unwrap();
            let bulk = match &message {
                ServerMessage::Frame(f) => f.bulk_size(),
                ServerMessage::QueryBoundResult { result_size, .. } => *result_size as u64,
                _ => 0,
            };
            channel.receive_bytes(bulk as usize).unwrap();
            out.push(message);
        }
        out
    }

    struct Fixture {
        session: Session,
        plugins: PluginCache,
        config: ServerConfig,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let engine: Arc<dyn RenderEngine> = Arc::new(SoftwareEngine::new());
        Fixture {
            session: Session::new(engine).unwrap(),
            plugins: PluginCache::new(Arc::new(StaticProvider::with_builtins())),
            config: ServerConfig {
                framebuffer_dir: dir.path().to_path_buf(),
                poll_interval: Duration::from_millis(1),
                ..ServerConfig::default()
            },
            _dir: dir,
        }
    }

    fn camera() -> CameraSettings {
        CameraSettings {
            object_name: "Camera".into(),
            camera_name: "Camera".into(),
            kind: CameraKind::Perspective,
            position: [0.0, 0.0, 5.0],
            view_dir: [0.0, 0.0, -1.0],
            up_dir: [0.0, 1.0, 0.0],
            fov_y: 45.0,
            height: 0.0,
            aspect: 1.0,
            clip_start: 0.1,
            dof_focus_distance: 0.0,
            dof_aperture: 0.0,
            border: None,
        }
    }

    fn hello() -> ClientMessage {
        ClientMessage::Hello {
            version: PROTOCOL_VERSION,
        }
    }

    #[test]
    fn hello_must_come_first() {
        let mut f = fixture();
        let mut transport = MemoryTransport::default();
        transport.push_input(&encode(&[ClientMessage::GetServerState]));
        let mut conn = Connection::new(transport, &mut f.session, &f.plugins, &f.config);
        assert_eq!(conn.tick().unwrap(), Some(ConnectionEnd::HandshakeMissing));
        let replies = decode_all(&conn.channel().get_ref().output);
        assert!(matches!(&replies[0], ServerMessage::Error(e) if e.code == "HANDSHAKE_REQUIRED"));
    }

    #[test]
    fn version_mismatch_closes() {
        let mut f = fixture();
        let mut transport = MemoryTransport::default();
        transport.push_input(&encode(&[ClientMessage::Hello { version: 1 }]));
        let mut conn = Connection::new(transport, &mut f.session, &f.plugins, &f.config);
        assert_eq!(conn.tick().unwrap(), Some(ConnectionEnd::VersionMismatch));
        let replies = decode_all(&conn.channel().get_ref().output);
        assert!(matches!(&replies[0], ServerMessage::HelloResult { success: false, .. }));
    }

    #[test]
    fn settings_are_silent_and_updates_are_answered() {
        let mut f = fixture();
        let mut transport = MemoryTransport::default();
        transport.push_input(&encode(&[
            hello(),
            ClientMessage::UpdateFramebuffer {
                format: FramebufferFormat::Srgba,
                width: 4,
                height: 4,
            },
            ClientMessage::UpdateCamera(camera()),
            ClientMessage::UpdatePluginInstance(PluginInstanceUpdate {
                name: "ball".into(),
                plugin_type: PluginKind::Geometry,
                plugin_name: "sphere".into(),
                plugin_parameters: json!({ "radius": 1.0, "center": [0.0, 0.0, 0.0] }),
                custom_properties: json!({}),
            }),
            ClientMessage::QueryBound { name: "ball".into() },
            ClientMessage::Bye,
        ]));
        let mut conn = Connection::new(transport, &mut f.session, &f.plugins, &f.config);
        let mut end = None;
        for _ in 0..10 {
            end = conn.tick().unwrap();
            if end.is_some() {
                break;
            }
        }
        assert_eq!(end, Some(ConnectionEnd::Bye));
        let replies = decode_all(&conn.channel().get_ref().output);
        assert_eq!(replies.len(), 3, "{replies:?}");
        assert!(matches!(&replies[0], ServerMessage::HelloResult { success: true, .. }));
        assert!(matches!(&replies[1], ServerMessage::GenerateResult { success: true, .. }));
        assert!(matches!(&replies[2], ServerMessage::QueryBoundResult { .. }));
    }

    #[test]
    fn start_without_framebuffer_is_an_error() {
        let mut f = fixture();
        let mut transport = MemoryTransport::default();
        transport.push_input(&encode(&[
            hello(),
            ClientMessage::StartRendering {
                mode: RenderMode::Final,
                samples: 1,
                reduction_ceiling: 1,
            },
        ]));
        let mut conn = Connection::new(transport, &mut f.session, &f.plugins, &f.config);
        conn.tick().unwrap();
        conn.tick().unwrap();
        let replies = decode_all(&conn.channel().get_ref().output);
        assert!(matches!(&replies[1], ServerMessage::Error(e) if e.code == "RENDER_START_FAILED"));
        assert!(conn.scheduler().is_idle());
    }

    #[test]
    fn oversized_raw_mesh_header_ends_the_connection() {
        let mut f = fixture();
        let mut transport = MemoryTransport::default();
        transport.push_input(&encode(&[
            hello(),
            ClientMessage::UpdateRawMesh(RawMeshHeader {
                name: "huge".into(),
                num_vertices: u32::MAX,
                num_triangles: u32::MAX,
                flags: 3,
            }),
        ]));
        let mut conn = Connection::new(transport, &mut f.session, &f.plugins, &f.config);
        assert_eq!(conn.tick().unwrap(), None);
        let err = conn.tick().unwrap_err();
        let channel_error = err.downcast_ref::<ChannelError>();
        assert!(matches!(channel_error, Some(ChannelError::Oversized { .. })), "{err:#}");
        assert!(!is_disconnect(&err));
        drop(conn);
        assert!(f.session.store.data("huge").is_none());
    }

    #[test]
    fn results_fall_back_to_control_when_output_is_lost() {
        let mut f = fixture();
        let mut transport = MemoryTransport::default();
        transport.push_input(&encode(&[
            hello(),
            ClientMessage::UpdateFramebuffer {
                format: FramebufferFormat::Srgba,
                width: 4,
                height: 4,
            },
            ClientMessage::UpdateCamera(camera()),
            ClientMessage::StartRendering {
                mode: RenderMode::Interactive,
                samples: 0,
                reduction_ceiling: 2,
            },
        ]));
        let mut conn = Connection::new(transport, &mut f.session, &f.plugins, &f.config);
        for _ in 0..3 {
            assert_eq!(conn.tick().unwrap(), None);
        }

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let _peer = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (stream, _) = listener.accept().unwrap();
        stream.shutdown(Shutdown::Write).unwrap();
        conn.output = Some(MessageChannel::new(stream));

        assert_eq!(conn.tick().unwrap(), None);
        assert!(conn.output.is_none());
        let replies = decode_all(&conn.channel().get_ref().output);
        assert_eq!(replies.len(), 2, "{replies:?}");
        let ServerMessage::Done(done) = &replies[1] else {
            panic!("expected DONE on the control channel, got {:?}", replies[1]);
        };
        assert_eq!(done.variance, 0.0);
    }
}
