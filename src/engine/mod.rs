//! The rendering engine as seen by the server.
//!
//! Engine objects are reference counted. A [`Handle`] is one reference: cloning
//! retains, dropping releases. The engine frees an object once its last handle
//! is gone and no engine-side object refers to it any more.

pub mod software;

use std::{
    fmt,
    sync::Arc,
    time::Duration,
};

use anyhow::Result;
use serde::Serialize;

use crate::{protocol::FramebufferFormat, transform::Affine3};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectType {
    Geometry,
    GeometricModel,
    Volume,
    VolumetricModel,
    TransferFunction,
    Texture,
    Material,
    Group,
    Instance,
    Light,
    Camera,
    Renderer,
    World,
    FrameBuffer,
}

/// Receives the final release of an engine object.
pub trait ReleaseSink: Send + Sync {
    fn release(&self, id: u64);
}

struct HandleInner {
    id: u64,
    object_type: ObjectType,
    subtype: String,
    sink: Arc<dyn ReleaseSink>,
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        self.sink.release(self.id);
    }
}

#[derive(Clone)]
pub struct Handle {
    inner: Arc<HandleInner>,
}

impl Handle {
    pub fn new(
        id: u64,
        object_type: ObjectType,
        subtype: impl Into<String>,
        sink: Arc<dyn ReleaseSink>,
    ) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id,
                object_type,
                subtype: subtype.into(),
                sink,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn object_type(&self) -> ObjectType {
        self.inner.object_type
    }

    pub fn subtype(&self) -> &str {
        &self.inner.subtype
    }

    /// Number of live server-side handles to this object.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl PartialEq for Handle {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Handle {}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Handle({:?}/{} #{})",
            self.inner.object_type, self.inner.subtype, self.inner.id
        )
    }
}

/// Typed parameter values understood by the engine.
#[derive(Debug, Clone)]
pub enum Param {
    Bool(bool),
    Int(i32),
    Float(f32),
    Vec2f([f32; 2]),
    Vec3f([f32; 3]),
    Vec4f([f32; 4]),
    String(String),
    Affine(Affine3),
    FloatArray(Vec<f32>),
    Vec3fArray(Vec<[f32; 3]>),
    Vec4fArray(Vec<[f32; 4]>),
    Vec3uArray(Vec<[u32; 3]>),
    /// Dense voxel grid, x fastest.
    Voxels {
        dims: [u32; 3],
        values: Vec<f32>,
    },
    Object(Handle),
    ObjectList(Vec<Handle>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramebufferDesc {
    pub width: u32,
    pub height: u32,
    pub format: FramebufferFormat,
    pub accumulation: bool,
    pub variance: bool,
}

impl FramebufferDesc {
    pub fn byte_len(&self) -> usize {
        self.width as usize * self.height as usize * self.format.bytes_per_pixel()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Bounds {
    pub lower: [f32; 3],
    pub upper: [f32; 3],
}

impl Bounds {
    pub fn empty() -> Self {
        Self {
            lower: [f32::INFINITY; 3],
            upper: [f32::NEG_INFINITY; 3],
        }
    }

    pub fn is_empty(&self) -> bool {
        (0..3).any(|i| self.lower[i] > self.upper[i])
    }

    pub fn extend(&mut self, p: [f32; 3]) {
        for i in 0..3 {
            self.lower[i] = self.lower[i].min(p[i]);
            self.upper[i] = self.upper[i].max(p[i]);
        }
    }

    pub fn union(&mut self, other: &Bounds) {
        if !other.is_empty() {
            self.extend(other.lower);
            self.extend(other.upper);
        }
    }

    pub fn corners(&self) -> [[f32; 3]; 8] {
        let (l, u) = (self.lower, self.upper);
        [
            [l[0], l[1], l[2]],
            [u[0], l[1], l[2]],
            [u[0], u[1], l[2]],
            [l[0], u[1], l[2]],
            [l[0], l[1], u[2]],
            [u[0], l[1], u[2]],
            [u[0], u[1], u[2]],
            [l[0], u[1], u[2]],
        ]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineStatus {
    Error(String),
    Status(String),
}

pub type StatusCallback = Arc<dyn Fn(EngineStatus) + Send + Sync>;

/// Builds the status callback the server installs: errors and status lines
/// go to the log, and with `abort_on_error` an engine error ends the process.
pub fn log_status_callback(abort_on_error: bool) -> StatusCallback {
    Arc::new(move |status| match status {
        EngineStatus::Error(message) => {
            log::error!("[engine] {message}");
            if abort_on_error {
                log::error!("[engine] aborting on engine error");
                std::process::abort();
            }
        }
        EngineStatus::Status(message) => log::info!("[engine] {message}"),
    })
}

/// An in-flight frame computation.
pub trait FrameTask: Send {
    fn is_ready(&self) -> bool;

    /// Asks the engine to stop the frame early.
    fn cancel(&self);

    /// Waits up to `timeout` for the frame to finish; `true` if it did.
    fn wait(&self, timeout: Duration) -> bool;

    /// Estimated remaining variance after this frame, once ready.
    fn variance(&self) -> f32;

    /// Whether the frame ran to completion rather than being stopped.
    fn completed(&self) -> bool;
}

pub trait RenderEngine: Send + Sync {
    fn name(&self) -> &str;

    fn create(&self, object_type: ObjectType, subtype: &str) -> Result<Handle>;

    fn set_param(&self, object: &Handle, name: &str, value: Param);

    fn remove_param(&self, object: &Handle, name: &str);

    fn commit(&self, object: &Handle);

    fn new_framebuffer(&self, desc: FramebufferDesc) -> Result<Handle>;

    fn reset_accumulation(&self, framebuffer: &Handle);

    fn render_frame(
        &self,
        framebuffer: &Handle,
        renderer: &Handle,
        camera: &Handle,
        world: &Handle,
    ) -> Result<Box<dyn FrameTask>>;

    /// Copies out the framebuffer's colour channel.
    fn read_pixels(&self, framebuffer: &Handle) -> Result<Vec<u8>>;

    /// World-space bounds of a committed group, if the engine can compute them.
    fn bounds(&self, group: &Handle) -> Option<Bounds>;

    fn set_status_callback(&self, callback: StatusCallback);
}
