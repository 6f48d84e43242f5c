//! Wire records exchanged with the modelling client.
//!
//! Every record travels as a length-prefixed JSON document (see `channel`). Some
//! records announce raw bulk bytes that follow immediately on the same stream:
//! `UPDATE_RAW_MESH` (mesh arrays), `QUERY_BOUND_RESULT` (serialized bound) and
//! `FRAME` (pixels or an encoded image file).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::transform::{IDENTITY_MAT4, Mat4};

pub const PROTOCOL_VERSION: u32 = 2;
pub const DEFAULT_PORT: u16 = 5909;

pub const MESH_NORMALS: u32 = 0x1;
pub const MESH_VERTEX_COLORS: u32 = 0x2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    Hello {
        version: u32,
    },
    Bye,
    Quit,
    ClearScene {
        #[serde(default)]
        include_data: bool,
    },
    UpdateRendererType {
        renderer: String,
    },
    UpdateRenderSettings(RenderSettings),
    UpdateWorldSettings(WorldSettings),
    UpdateCamera(CameraSettings),
    UpdateMaterial(MaterialUpdate),
    UpdatePluginInstance(PluginInstanceUpdate),
    UpdateRawMesh(RawMeshHeader),
    UpdateObject(ObjectUpdate),
    UpdateFramebuffer {
        format: FramebufferFormat,
        width: u32,
        height: u32,
    },
    GetServerState,
    QueryBound {
        name: String,
    },
    StartRendering {
        mode: RenderMode,
        samples: u32,
        reduction_ceiling: u32,
    },
    CancelRendering,
    RequestRenderOutput,
}

impl ClientMessage {
    pub fn name(&self) -> &'static str {
        match self {
            ClientMessage::Hello { .. } => "HELLO",
            ClientMessage::Bye => "BYE",
            ClientMessage::Quit => "QUIT",
            ClientMessage::ClearScene { .. } => "CLEAR_SCENE",
            ClientMessage::UpdateRendererType { .. } => "UPDATE_RENDERER_TYPE",
            ClientMessage::UpdateRenderSettings(_) => "UPDATE_RENDER_SETTINGS",
            ClientMessage::UpdateWorldSettings(_) => "UPDATE_WORLD_SETTINGS",
            ClientMessage::UpdateCamera(_) => "UPDATE_CAMERA",
            ClientMessage::UpdateMaterial(_) => "UPDATE_MATERIAL",
            ClientMessage::UpdatePluginInstance(_) => "UPDATE_PLUGIN_INSTANCE",
            ClientMessage::UpdateRawMesh(_) => "UPDATE_RAW_MESH",
            ClientMessage::UpdateObject(_) => "UPDATE_OBJECT",
            ClientMessage::UpdateFramebuffer { .. } => "UPDATE_FRAMEBUFFER",
            ClientMessage::GetServerState => "GET_SERVER_STATE",
            ClientMessage::QueryBound { .. } => "QUERY_BOUND",
            ClientMessage::StartRendering { .. } => "START_RENDERING",
            ClientMessage::CancelRendering => "CANCEL_RENDERING",
            ClientMessage::RequestRenderOutput => "REQUEST_RENDER_OUTPUT",
        }
    }

    /// Messages that touch scene, material, camera, plugin or renderer state.
    /// These are never applied while a render run is outstanding.
    pub fn is_structural_edit(&self) -> bool {
        matches!(
            self,
            ClientMessage::ClearScene { .. }
                | ClientMessage::UpdateRendererType { .. }
                | ClientMessage::UpdateRenderSettings(_)
                | ClientMessage::UpdateWorldSettings(_)
                | ClientMessage::UpdateCamera(_)
                | ClientMessage::UpdateMaterial(_)
                | ClientMessage::UpdatePluginInstance(_)
                | ClientMessage::UpdateRawMesh(_)
                | ClientMessage::UpdateObject(_)
                | ClientMessage::UpdateFramebuffer { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FramebufferFormat {
    /// 8 bit sRGB encoded colour, linear alpha.
    Srgba,
    /// 32 bit float per channel.
    Rgba32f,
}

impl FramebufferFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            FramebufferFormat::Srgba => 4,
            FramebufferFormat::Rgba32f => 16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RenderMode {
    Final,
    Interactive,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderSettings {
    pub max_depth: i32,
    pub min_contribution: f32,
    pub variance_threshold: f32,
    // scivis
    pub ao_samples: i32,
    pub ao_radius: f32,
    pub ao_intensity: f32,
    // pathtracer
    pub roulette_depth: i32,
    pub max_contribution: f32,
    pub geometry_lights: bool,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            max_depth: 20,
            min_contribution: 0.001,
            variance_threshold: 0.0,
            ao_samples: 1,
            ao_radius: 1.0e20,
            ao_intensity: 1.0,
            roulette_depth: 5,
            max_contribution: f32::MAX,
            geometry_lights: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldSettings {
    pub ambient_color: [f32; 3],
    pub ambient_intensity: f32,
    pub background_color: [f32; 4],
}

impl Default for WorldSettings {
    fn default() -> Self {
        Self {
            ambient_color: [1.0, 1.0, 1.0],
            ambient_intensity: 1.0,
            background_color: [0.0, 0.0, 0.0, 1.0],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraKind {
    Perspective,
    Orthographic,
    Panoramic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraSettings {
    #[serde(default)]
    pub object_name: String,
    #[serde(default)]
    pub camera_name: String,
    pub kind: CameraKind,
    pub position: [f32; 3],
    pub view_dir: [f32; 3],
    pub up_dir: [f32; 3],
    /// Vertical field of view in degrees (perspective).
    #[serde(default)]
    pub fov_y: f32,
    /// Image plane height (orthographic).
    #[serde(default)]
    pub height: f32,
    pub aspect: f32,
    #[serde(default)]
    pub clip_start: f32,
    #[serde(default)]
    pub dof_focus_distance: f32,
    #[serde(default)]
    pub dof_aperture: f32,
    /// Border render region as `[start_x, start_y, end_x, end_y]` in [0, 1].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub border: Option<[f32; 4]>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaterialUpdate {
    pub name: String,
    pub settings: MaterialSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MaterialSettings {
    CarPaint(CarPaintSettings),
    Glass(GlassSettings),
    Luminous(LuminousSettings),
    MetallicPaint(MetallicPaintSettings),
    ObjMaterial(ObjMaterialSettings),
    Principled(PrincipledSettings),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CarPaintSettings {
    pub base_color: [f32; 3],
    pub roughness: f32,
    pub normal: f32,
    pub flake_density: f32,
    pub flake_scale: f32,
    pub flake_spread: f32,
    pub flake_jitter: f32,
    pub flake_roughness: f32,
    pub coat: f32,
    pub coat_ior: f32,
    pub coat_color: [f32; 3],
    pub coat_thickness: f32,
    pub coat_roughness: f32,
    pub coat_normal: f32,
    pub flipflop_color: [f32; 3],
    pub flipflop_falloff: f32,
}

impl Default for CarPaintSettings {
    fn default() -> Self {
        Self {
            base_color: [0.8, 0.8, 0.8],
            roughness: 0.0,
            normal: 1.0,
            flake_density: 0.0,
            flake_scale: 100.0,
            flake_spread: 0.3,
            flake_jitter: 0.75,
            flake_roughness: 0.3,
            coat: 1.0,
            coat_ior: 1.5,
            coat_color: [1.0, 1.0, 1.0],
            coat_thickness: 1.0,
            coat_roughness: 0.0,
            coat_normal: 1.0,
            flipflop_color: [1.0, 1.0, 1.0],
            flipflop_falloff: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlassSettings {
    pub eta: f32,
    pub attenuation_color: [f32; 3],
    pub attenuation_distance: f32,
}

impl Default for GlassSettings {
    fn default() -> Self {
        Self {
            eta: 1.5,
            attenuation_color: [1.0, 1.0, 1.0],
            attenuation_distance: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LuminousSettings {
    pub color: [f32; 3],
    pub intensity: f32,
    pub transparency: f32,
}

impl Default for LuminousSettings {
    fn default() -> Self {
        Self {
            color: [1.0, 1.0, 1.0],
            intensity: 1.0,
            transparency: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetallicPaintSettings {
    pub base_color: [f32; 3],
    pub flake_color: [f32; 3],
    pub flake_amount: f32,
    pub flake_spread: f32,
    pub eta: f32,
}

impl Default for MetallicPaintSettings {
    fn default() -> Self {
        Self {
            base_color: [0.8, 0.8, 0.8],
            flake_color: [0.7, 0.7, 0.7],
            flake_amount: 0.3,
            flake_spread: 0.5,
            eta: 1.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjMaterialSettings {
    pub kd: [f32; 3],
    pub ks: [f32; 3],
    pub ns: f32,
    pub d: f32,
}

impl Default for ObjMaterialSettings {
    fn default() -> Self {
        Self {
            kd: [0.8, 0.8, 0.8],
            ks: [0.0, 0.0, 0.0],
            ns: 10.0,
            d: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrincipledSettings {
    pub base_color: [f32; 3],
    pub edge_color: [f32; 3],
    pub metallic: f32,
    pub diffuse: f32,
    pub specular: f32,
    pub ior: f32,
    pub transmission: f32,
    pub transmission_color: [f32; 3],
    pub transmission_depth: f32,
    pub roughness: f32,
    pub anisotropy: f32,
    pub rotation: f32,
    pub normal: f32,
    pub base_normal: f32,
    pub thin: bool,
    pub thickness: f32,
    pub backlight: f32,
    pub coat: f32,
    pub coat_ior: f32,
    pub coat_color: [f32; 3],
    pub coat_thickness: f32,
    pub coat_roughness: f32,
    pub coat_normal: f32,
    pub sheen: f32,
    pub sheen_color: [f32; 3],
    pub sheen_tint: f32,
    pub sheen_roughness: f32,
    pub opacity: f32,
}

impl Default for PrincipledSettings {
    fn default() -> Self {
        Self {
            base_color: [0.8, 0.8, 0.8],
            edge_color: [1.0, 1.0, 1.0],
            metallic: 0.0,
            diffuse: 1.0,
            specular: 1.0,
            ior: 1.0,
            transmission: 0.0,
            transmission_color: [1.0, 1.0, 1.0],
            transmission_depth: 1.0,
            roughness: 0.0,
            anisotropy: 0.0,
            rotation: 0.0,
            normal: 1.0,
            base_normal: 1.0,
            thin: false,
            thickness: 1.0,
            backlight: 0.0,
            coat: 0.0,
            coat_ior: 1.5,
            coat_color: [1.0, 1.0, 1.0],
            coat_thickness: 1.0,
            coat_roughness: 0.0,
            coat_normal: 1.0,
            sheen: 0.0,
            sheen_color: [1.0, 1.0, 1.0],
            sheen_tint: 0.0,
            sheen_roughness: 0.2,
            opacity: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginKind {
    Geometry,
    Volume,
    Scene,
}

impl PluginKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PluginKind::Geometry => "geometry",
            PluginKind::Volume => "volume",
            PluginKind::Scene => "scene",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginInstanceUpdate {
    /// Scene data name the generated content is stored under.
    pub name: String,
    pub plugin_type: PluginKind,
    pub plugin_name: String,
    #[serde(default)]
    pub plugin_parameters: Value,
    #[serde(default)]
    pub custom_properties: Value,
}

/// Header of a raw triangle mesh. The arrays follow as bulk bytes, in order:
/// vertices (3 x f32), normals (3 x f32, with `MESH_NORMALS`), vertex colours
/// (4 x f32, with `MESH_VERTEX_COLORS`), triangles (3 x u32).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawMeshHeader {
    pub name: String,
    pub num_vertices: u32,
    pub num_triangles: u32,
    #[serde(default)]
    pub flags: u32,
}

impl RawMeshHeader {
    pub fn has_normals(&self) -> bool {
        self.flags & MESH_NORMALS != 0
    }

    pub fn has_vertex_colors(&self) -> bool {
        self.flags & MESH_VERTEX_COLORS != 0
    }

    /// Total number of bulk bytes following the header.
    pub fn bulk_size(&self) -> u64 {
        let nv = u64::from(self.num_vertices);
        let nt = u64::from(self.num_triangles);
        let mut floats = nv * 3;
        if self.has_normals() {
            floats += nv * 3;
        }
        if self.has_vertex_colors() {
            floats += nv * 4;
        }
        floats * 4 + nt * 3 * 4
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectUpdate {
    pub name: String,
    /// Row-major object-to-world matrix.
    #[serde(default = "identity_mat4")]
    pub object2world: Mat4,
    #[serde(default)]
    pub data_link: String,
    #[serde(default)]
    pub material_link: String,
    #[serde(default)]
    pub custom_properties: Value,
    pub payload: ObjectPayload,
}

fn identity_mat4() -> Mat4 {
    IDENTITY_MAT4
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ObjectPayload {
    Mesh,
    Geometry,
    Volume {
        #[serde(default = "default_sampling_rate")]
        sampling_rate: f32,
    },
    Isosurfaces,
    Slices {
        slices: Vec<SliceSettings>,
    },
    Scene,
    Light(LightSettings),
}

fn default_sampling_rate() -> f32 {
    0.125
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SliceSettings {
    /// Raw mesh used as the slicing surface.
    pub linked_mesh: String,
    #[serde(default = "identity_mat4")]
    pub object2world: Mat4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LightKind {
    Point,
    Spot,
    Sun,
    Area,
    Ambient,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LightSettings {
    pub light_type: LightKind,
    #[serde(default = "white")]
    pub color: [f32; 3],
    #[serde(default = "one")]
    pub intensity: f32,
    #[serde(default = "yes")]
    pub visible: bool,
    #[serde(default)]
    pub position: [f32; 3],
    #[serde(default = "down")]
    pub direction: [f32; 3],
    #[serde(default)]
    pub radius: f32,
    #[serde(default)]
    pub opening_angle: f32,
    #[serde(default)]
    pub penumbra_angle: f32,
    #[serde(default)]
    pub angular_diameter: f32,
    #[serde(default)]
    pub edge1: [f32; 3],
    #[serde(default)]
    pub edge2: [f32; 3],
}

fn white() -> [f32; 3] {
    [1.0, 1.0, 1.0]
}

fn one() -> f32 {
    1.0
}

fn yes() -> bool {
    true
}

fn down() -> [f32; 3] {
    [0.0, 0.0, -1.0]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessage {
    HelloResult {
        success: bool,
        #[serde(default)]
        message: String,
    },
    GenerateResult {
        success: bool,
        #[serde(default)]
        message: String,
    },
    UpdateResult {
        success: bool,
        #[serde(default)]
        message: String,
    },
    ServerState {
        state: Value,
    },
    QueryBoundResult {
        success: bool,
        #[serde(default)]
        message: String,
        #[serde(default)]
        result_size: u32,
    },
    RenderOutput {
        port: u16,
    },
    Frame(FrameResult),
    Done(DoneResult),
    Canceled,
    Error(ErrorPayload),
}

impl ServerMessage {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        ServerMessage::Error(ErrorPayload {
            code: code.to_string(),
            message: message.into(),
        })
    }

    pub fn is_render_result(&self) -> bool {
        matches!(
            self,
            ServerMessage::Frame(_) | ServerMessage::Done(_) | ServerMessage::Canceled
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameResult {
    pub sample: u32,
    pub reduction_factor: u32,
    pub width: u32,
    pub height: u32,
    pub variance: f32,
    /// Seconds spent computing this frame.
    pub render_time: f32,
    /// Resident memory in MiB.
    pub memory_usage: f32,
    pub peak_memory_usage: f32,
    /// Raw pixel bytes following the record (interactive mode).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pixels_size: Option<u64>,
    /// Encoded image written by the server (final mode); its contents follow
    /// the record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
}

impl FrameResult {
    pub fn bulk_size(&self) -> u64 {
        self.pixels_size.or(self.file_size).unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoneResult {
    pub variance: f32,
    pub memory_usage: f32,
    pub peak_memory_usage: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

pub fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_message_uses_screaming_type_tag() {
        let msg = ClientMessage::StartRendering {
            mode: RenderMode::Interactive,
            samples: 4,
            reduction_ceiling: 4,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "START_RENDERING");
        assert_eq!(json["mode"], "INTERACTIVE");
    }

    #[test]
    fn object_update_defaults_fill_missing_fields() {
        let text = r#"{"type":"UPDATE_OBJECT","name":"Cube","payload":{"kind":"mesh"}}"#;
        let msg: ClientMessage = serde_json::from_str(text).unwrap();
        let ClientMessage::UpdateObject(update) = msg else {
            panic!("expected UPDATE_OBJECT");
        };
        assert_eq!(update.object2world, IDENTITY_MAT4);
        assert!(update.data_link.is_empty());
        assert_eq!(update.payload, ObjectPayload::Mesh);
    }

    #[test]
    fn raw_mesh_bulk_size_counts_optional_arrays() {
        let mut header = RawMeshHeader {
            name: "m".to_string(),
            num_vertices: 4,
            num_triangles: 2,
            flags: 0,
        };
        assert_eq!(header.bulk_size(), 4 * 3 * 4 + 2 * 3 * 4);
        header.flags = MESH_NORMALS | MESH_VERTEX_COLORS;
        assert_eq!(header.bulk_size(), (4 * 3 + 4 * 3 + 4 * 4) * 4 + 2 * 3 * 4);
    }

    #[test]
    fn structural_edits_exclude_queries_and_render_control() {
        assert!(ClientMessage::ClearScene { include_data: false }.is_structural_edit());
        assert!(!ClientMessage::GetServerState.is_structural_edit());
        assert!(!ClientMessage::CancelRendering.is_structural_edit());
        assert!(
            !ClientMessage::QueryBound {
                name: "x".to_string()
            }
            .is_structural_edit()
        );
    }

    #[test]
    fn frame_result_omits_absent_payload_fields() {
        let frame = FrameResult {
            sample: 1,
            reduction_factor: 2,
            width: 8,
            height: 4,
            variance: 0.5,
            render_time: 0.01,
            memory_usage: 10.0,
            peak_memory_usage: 12.0,
            pixels_size: Some(128),
            file_name: None,
            file_size: None,
        };
        let json = serde_json::to_value(ServerMessage::Frame(frame.clone())).unwrap();
        assert_eq!(json["type"], "FRAME");
        assert!(json.get("file_name").is_none());
        assert_eq!(frame.bulk_size(), 128);
    }
}
