use std::{
    net::{SocketAddr, TcpStream},
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

use serde_json::json;
use scene_render_server::{
    channel::{ChannelError, MessageChannel},
    config::ServerConfig,
    engine::{RenderEngine, software::SoftwareEngine},
    plugin::{PluginCache, builtin::StaticProvider},
    protocol::{
        CameraKind, CameraSettings, ClientMessage, FramebufferFormat, ObjectPayload, ObjectUpdate,
        PROTOCOL_VERSION, PluginInstanceUpdate, PluginKind, RenderMode, ServerMessage,
    },
    server::Server,
    transform::IDENTITY_MAT4,
};

struct Running {
    addr: SocketAddr,
    handle: JoinHandle<anyhow::Result<()>>,
    dir: tempfile::TempDir,
}

fn spawn_server(frame_time: Option<Duration>) -> Running {
    let dir = tempfile::tempdir().unwrap();
    let config = ServerConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        framebuffer_dir: dir.path().join("frames"),
        ..ServerConfig::default()
    };
    let mut engine = SoftwareEngine::new();
    if let Some(t) = frame_time {
        engine = engine.with_frame_time(t);
    }
    let engine: Arc<dyn RenderEngine> = Arc::new(engine);
    let plugins = Arc::new(PluginCache::new(Arc::new(StaticProvider::with_builtins())));
    let server = Server::bind(config, engine, plugins).unwrap();
    let addr = server.local_addr().unwrap();
    let handle = thread::spawn(move || server.serve());
    Running { addr, handle, dir }
}

fn connect(addr: SocketAddr) -> MessageChannel<TcpStream> {
    let stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(20))).unwrap();
    MessageChannel::new(stream)
}

fn hello(channel: &mut MessageChannel<TcpStream>) {
    channel
        .send(&ClientMessage::Hello {
            version: PROTOCOL_VERSION,
        })
        .unwrap();
    let reply: ServerMessage = channel.receive().unwrap();
    assert!(matches!(reply, ServerMessage::HelloResult { success: true, .. }), "{reply:?}");
}

fn quit(running: Running) {
    let mut channel = connect(running.addr);
    hello(&mut channel);
    channel.send(&ClientMessage::Quit).unwrap();
    running.handle.join().unwrap().unwrap();
}

fn camera() -> CameraSettings {
    CameraSettings {
        object_name: "Camera".into(),
        camera_name: "Camera".into(),
        kind: CameraKind::Perspective,
        position: [2.0, 2.0, 10.0],
        view_dir: [0.0, 0.0, -1.0],
        up_dir: [0.0, 1.0, 0.0],
        fov_y: 40.0,
        height: 0.0,
        aspect: 1.0,
        clip_start: 0.1,
        dof_focus_distance: 0.0,
        dof_aperture: 0.0,
        border: None,
    }
}

fn build_scene(channel: &mut MessageChannel<TcpStream>) {
    channel
        .send(&ClientMessage::UpdatePluginInstance(PluginInstanceUpdate {
            name: "boxes".into(),
            plugin_type: PluginKind::Scene,
            plugin_name: "boxes".into(),
            plugin_parameters: json!({}),
            custom_properties: json!({}),
        }))
        .unwrap();
    let reply: ServerMessage = channel.receive().unwrap();
    assert!(matches!(reply, ServerMessage::GenerateResult { success: true, .. }), "{reply:?}");

    channel
        .send(&ClientMessage::UpdateObject(ObjectUpdate {
            name: "grid".into(),
            object2world: IDENTITY_MAT4,
            data_link: "boxes".into(),
            material_link: String::new(),
            custom_properties: json!({}),
            payload: ObjectPayload::Scene,
        }))
        .unwrap();
    let reply: ServerMessage = channel.receive().unwrap();
    assert!(matches!(reply, ServerMessage::UpdateResult { success: true, .. }), "{reply:?}");

    channel.send(&ClientMessage::UpdateCamera(camera())).unwrap();
    channel
        .send(&ClientMessage::UpdateFramebuffer {
            format: FramebufferFormat::Srgba,
            width: 16,
            height: 16,
        })
        .unwrap();
}

/// Reads one render result and its bulk bytes.
fn receive_result(channel: &mut MessageChannel<TcpStream>) -> (ServerMessage, Vec<u8>) {
    let message: ServerMessage = channel.receive().unwrap();
    let bulk = match &message {
        ServerMessage::Frame(frame) => channel.receive_bytes(frame.bulk_size() as usize).unwrap(),
        _ => Vec::new(),
    };
    (message, bulk)
}

#[test]
fn version_mismatch_is_refused_and_closed() {
    let running = spawn_server(None);
    let mut channel = connect(running.addr);
    channel.send(&ClientMessage::Hello { version: 1 }).unwrap();
    let reply: ServerMessage = channel.receive().unwrap();
    assert!(matches!(reply, ServerMessage::HelloResult { success: false, .. }));
    let next = channel.receive::<ServerMessage>().unwrap_err();
    assert!(matches!(next, ChannelError::Closed | ChannelError::Io(_)), "{next:?}");

    // The server keeps accepting.
    quit(running);
}

#[test]
fn scene_survives_reconnects() {
    let running = spawn_server(None);
    let mut first = connect(running.addr);
    hello(&mut first);
    build_scene(&mut first);
    first.send(&ClientMessage::Bye).unwrap();
    drop(first);

    let mut second = connect(running.addr);
    hello(&mut second);
    second.send(&ClientMessage::GetServerState).unwrap();
    let ServerMessage::ServerState { state } = second.receive().unwrap() else {
        panic!("expected SERVER_STATE");
    };
    assert_eq!(state["scene_objects"]["grid"]["type"], json!("scene"));
    assert_eq!(state["scene_data"]["boxes"]["plugin_name"], json!("boxes"));
    assert_eq!(state["render_state"], json!("IDLE"));
    assert_eq!(state["plugins_loaded"], json!(["scene_boxes"]));

    second.send(&ClientMessage::QueryBound { name: "boxes".into() }).unwrap();
    let ServerMessage::QueryBoundResult {
        success,
        result_size,
        ..
    } = second.receive().unwrap()
    else {
        panic!("expected QUERY_BOUND_RESULT");
    };
    assert!(success);
    let bytes = second.receive_bytes(result_size as usize).unwrap();
    assert_eq!(&bytes[..4], &8u32.to_le_bytes());

    second.send(&ClientMessage::QueryBound { name: "nope".into() }).unwrap();
    let reply: ServerMessage = second.receive().unwrap();
    assert!(matches!(
        reply,
        ServerMessage::QueryBoundResult { success: false, ref message, .. } if message.contains("nope")
    ));

    second.send(&ClientMessage::Quit).unwrap();
    running.handle.join().unwrap().unwrap();
}

#[test]
fn renders_stream_over_the_output_channel() {
    let running = spawn_server(None);
    let mut control = connect(running.addr);
    hello(&mut control);
    build_scene(&mut control);

    control.send(&ClientMessage::RequestRenderOutput).unwrap();
    let ServerMessage::RenderOutput { port } = control.receive().unwrap() else {
        panic!("expected RENDER_OUTPUT");
    };
    let mut output = connect(SocketAddr::from(([127, 0, 0, 1], port)));

    control
        .send(&ClientMessage::StartRendering {
            mode: RenderMode::Interactive,
            samples: 2,
            reduction_ceiling: 2,
        })
        .unwrap();
    let mut factors = Vec::new();
    loop {
        let (message, bulk) = receive_result(&mut output);
        match message {
            ServerMessage::Frame(frame) => {
                assert_eq!(bulk.len(), (frame.width * frame.height * 4) as usize);
                factors.push((frame.sample, frame.reduction_factor));
            }
            ServerMessage::Done(_) => break,
            other => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(factors, vec![(1, 2), (1, 1), (2, 1)]);

    control
        .send(&ClientMessage::StartRendering {
            mode: RenderMode::Final,
            samples: 1,
            reduction_ceiling: 4,
        })
        .unwrap();
    let (message, bulk) = receive_result(&mut output);
    let ServerMessage::Frame(frame) = message else {
        panic!("expected FRAME, got {message:?}");
    };
    assert_eq!(frame.reduction_factor, 1);
    assert_eq!(bulk.len() as u64, frame.file_size.unwrap());
    assert_eq!(&bulk[1..4], b"PNG");
    let (done, _) = receive_result(&mut output);
    assert!(matches!(done, ServerMessage::Done(_)));

    // Streamed frame files are removed once sent.
    let frames_dir = running.dir.path().join("frames");
    let leftovers = std::fs::read_dir(&frames_dir).map(|d| d.count()).unwrap_or(0);
    assert_eq!(leftovers, 0);

    control.send(&ClientMessage::Quit).unwrap();
    running.handle.join().unwrap().unwrap();
}

#[test]
fn cancel_and_busy_start_over_the_control_channel() {
    let running = spawn_server(Some(Duration::from_millis(20)));
    let mut control = connect(running.addr);
    hello(&mut control);
    build_scene(&mut control);

    let start = ClientMessage::StartRendering {
        mode: RenderMode::Interactive,
        samples: 500,
        reduction_ceiling: 4,
    };
    control.send(&start).unwrap();
    control.send(&start).unwrap();

    let mut saw_busy = false;
    let mut frames = 0;
    while !(saw_busy && frames >= 2) {
        match receive_result(&mut control).0 {
            ServerMessage::Frame(_) => frames += 1,
            ServerMessage::Error(e) => {
                assert_eq!(e.code, "RENDER_START_FAILED");
                saw_busy = true;
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    control.send(&ClientMessage::CancelRendering).unwrap();
    loop {
        match receive_result(&mut control).0 {
            ServerMessage::Frame(_) => {}
            ServerMessage::Canceled => break,
            other => panic!("unexpected {other:?}"),
        }
    }

    control.send(&ClientMessage::GetServerState).unwrap();
    let reply: ServerMessage = control.receive().unwrap();
    let ServerMessage::ServerState { state } = reply else {
        panic!("a result arrived after CANCELED: {reply:?}");
    };
    assert_eq!(state["render_state"], json!("IDLE"));

    control.send(&ClientMessage::Quit).unwrap();
    running.handle.join().unwrap().unwrap();
}

#[test]
fn edits_stop_an_active_render() {
    let running = spawn_server(Some(Duration::from_millis(20)));
    let mut control = connect(running.addr);
    hello(&mut control);
    build_scene(&mut control);

    control
        .send(&ClientMessage::StartRendering {
            mode: RenderMode::Final,
            samples: 500,
            reduction_ceiling: 1,
        })
        .unwrap();
    control.send(&ClientMessage::UpdateCamera(camera())).unwrap();
    loop {
        match receive_result(&mut control).0 {
            ServerMessage::Frame(_) => {}
            ServerMessage::Canceled => break,
            other => panic!("unexpected {other:?}"),
        }
    }

    control.send(&ClientMessage::Quit).unwrap();
    running.handle.join().unwrap().unwrap();
}

#[test]
fn zero_sample_run_reports_a_decodable_done() {
    let running = spawn_server(None);
    let mut control = connect(running.addr);
    hello(&mut control);
    build_scene(&mut control);

    control
        .send(&ClientMessage::StartRendering {
            mode: RenderMode::Interactive,
            samples: 0,
            reduction_ceiling: 4,
        })
        .unwrap();
    let ServerMessage::Done(done) = control.receive().unwrap() else {
        panic!("expected DONE");
    };
    assert!(done.variance.is_finite());

    control.send(&ClientMessage::GetServerState).unwrap();
    let ServerMessage::ServerState { state } = control.receive().unwrap() else {
        panic!("expected SERVER_STATE");
    };
    assert_eq!(state["render_state"], json!("IDLE"));

    control.send(&ClientMessage::Quit).unwrap();
    running.handle.join().unwrap().unwrap();
}
