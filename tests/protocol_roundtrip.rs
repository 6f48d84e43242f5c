use proptest::prelude::*;
use serde_json::json;
use scene_render_server::{
    channel::{MemoryTransport, MessageChannel},
    protocol::{
        CameraKind, CameraSettings, ClientMessage, FramebufferFormat, LightKind, LightSettings,
        ObjectPayload, ObjectUpdate, PluginInstanceUpdate, PluginKind, RawMeshHeader, RenderMode,
        SliceSettings,
    },
    transform::Mat4,
};

fn exact_f32() -> impl Strategy<Value = f32> {
    any::<i16>().prop_map(|v| v as f32 / 8.0)
}

fn vec3() -> impl Strategy<Value = [f32; 3]> {
    [exact_f32(), exact_f32(), exact_f32()]
}

fn mat4() -> impl Strategy<Value = Mat4> {
    proptest::collection::vec(exact_f32(), 16).prop_map(|v| {
        let mut m = [0.0; 16];
        m.copy_from_slice(&v);
        m
    })
}

fn name() -> impl Strategy<Value = String> {
    "[a-zA-Z][a-zA-Z0-9_.]{0,12}"
}

fn plugin_kind() -> impl Strategy<Value = PluginKind> {
    prop_oneof![
        Just(PluginKind::Geometry),
        Just(PluginKind::Volume),
        Just(PluginKind::Scene)
    ]
}

fn light() -> impl Strategy<Value = LightSettings> {
    (
        prop_oneof![
            Just(LightKind::Point),
            Just(LightKind::Spot),
            Just(LightKind::Sun),
            Just(LightKind::Area),
            Just(LightKind::Ambient)
        ],
        vec3(),
        exact_f32(),
        any::<bool>(),
        vec3(),
        vec3(),
        exact_f32(),
    )
        .prop_map(|(light_type, color, intensity, visible, position, direction, radius)| LightSettings {
            light_type,
            color,
            intensity,
            visible,
            position,
            direction,
            radius,
            opening_angle: 30.0,
            penumbra_angle: 2.5,
            angular_diameter: 0.5,
            edge1: [1.0, 0.0, 0.0],
            edge2: [0.0, 0.0, 1.0],
        })
}

fn payload() -> impl Strategy<Value = ObjectPayload> {
    prop_oneof![
        Just(ObjectPayload::Mesh),
        Just(ObjectPayload::Geometry),
        exact_f32().prop_map(|sampling_rate| ObjectPayload::Volume { sampling_rate }),
        Just(ObjectPayload::Isosurfaces),
        proptest::collection::vec((name(), mat4()), 0..3).prop_map(|slices| ObjectPayload::Slices {
            slices: slices
                .into_iter()
                .map(|(linked_mesh, object2world)| SliceSettings {
                    linked_mesh,
                    object2world,
                })
                .collect(),
        }),
        Just(ObjectPayload::Scene),
        light().prop_map(ObjectPayload::Light),
    ]
}

fn control_message() -> impl Strategy<Value = ClientMessage> {
    prop_oneof![
        any::<u32>().prop_map(|version| ClientMessage::Hello { version }),
        Just(ClientMessage::Bye),
        Just(ClientMessage::Quit),
        any::<bool>().prop_map(|include_data| ClientMessage::ClearScene { include_data }),
        (any::<bool>(), 1u32..4096, 1u32..4096).prop_map(|(float, width, height)| {
            ClientMessage::UpdateFramebuffer {
                format: if float {
                    FramebufferFormat::Rgba32f
                } else {
                    FramebufferFormat::Srgba
                },
                width,
                height,
            }
        }),
        (any::<bool>(), 0u32..1000, 0u32..16).prop_map(|(interactive, samples, reduction_ceiling)| {
            ClientMessage::StartRendering {
                mode: if interactive {
                    RenderMode::Interactive
                } else {
                    RenderMode::Final
                },
                samples,
                reduction_ceiling,
            }
        }),
        Just(ClientMessage::CancelRendering),
        Just(ClientMessage::RequestRenderOutput),
        Just(ClientMessage::GetServerState),
        name().prop_map(|name| ClientMessage::QueryBound { name }),
    ]
}

fn edit_message() -> impl Strategy<Value = ClientMessage> {
    prop_oneof![
        (name(), any::<u32>(), any::<u32>(), 0u32..4).prop_map(|(name, num_vertices, num_triangles, flags)| {
            ClientMessage::UpdateRawMesh(RawMeshHeader {
                name,
                num_vertices,
                num_triangles,
                flags,
            })
        }),
        (name(), plugin_kind(), name(), exact_f32(), vec3()).prop_map(|(data, kind, plugin, radius, center)| {
            ClientMessage::UpdatePluginInstance(PluginInstanceUpdate {
                name: data,
                plugin_type: kind,
                plugin_name: plugin,
                plugin_parameters: json!({ "radius": radius, "center": center }),
                custom_properties: json!({ "isovalues": [radius] }),
            })
        }),
        (name(), mat4(), name(), name(), payload()).prop_map(
            |(name, object2world, data_link, material_link, payload)| {
                ClientMessage::UpdateObject(ObjectUpdate {
                    name,
                    object2world,
                    data_link,
                    material_link,
                    custom_properties: json!({}),
                    payload,
                })
            }
        ),
        (vec3(), vec3(), exact_f32(), proptest::option::of([exact_f32(), exact_f32(), exact_f32(), exact_f32()]))
            .prop_map(|(position, view_dir, fov_y, border)| {
                ClientMessage::UpdateCamera(CameraSettings {
                    object_name: "Camera".into(),
                    camera_name: "CameraData".into(),
                    kind: CameraKind::Perspective,
                    position,
                    view_dir,
                    up_dir: [0.0, 0.0, 1.0],
                    fov_y,
                    height: 2.0,
                    aspect: 1.5,
                    clip_start: 0.125,
                    dof_focus_distance: 0.0,
                    dof_aperture: 0.0,
                    border,
                })
            }),
    ]
}

fn client_message() -> impl Strategy<Value = ClientMessage> {
    prop_oneof![control_message(), edit_message()]
}

proptest! {
    #[test]
    fn client_messages_survive_the_channel(messages in proptest::collection::vec(client_message(), 1..8)) {
        let mut tx = MessageChannel::new(MemoryTransport::default());
        for m in &messages {
            tx.send(m).unwrap();
        }

        let mut transport = MemoryTransport::default();
        transport.push_input(&tx.into_inner().output);
        let mut rx = MessageChannel::new(transport);
        for expected in &messages {
            let decoded: ClientMessage = rx.receive().unwrap();
            prop_assert_eq!(&decoded, expected);
        }
        prop_assert!(rx.get_ref().input.is_empty());
    }
}
