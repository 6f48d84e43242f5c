//! A small CPU engine that keeps engine objects in a table and "renders" a
//! deterministic shaded pattern. It honours reference counting, accumulation,
//! asynchronous frames and cancellation, which is everything the server
//! relies on, and lets the whole server run headless.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{Result, anyhow, bail};
use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};

use super::{
    Bounds, EngineStatus, FrameTask, FramebufferDesc, Handle, ObjectType, Param, ReleaseSink,
    RenderEngine, StatusCallback,
};
use crate::protocol::FramebufferFormat;

pub const RENDERER_TYPES: &[&str] = &["scivis", "pathtracer", "ao"];

const CANCEL_POLL: Duration = Duration::from_millis(1);

struct ObjectRecord {
    object_type: ObjectType,
    params: HashMap<String, Param>,
    commits: u32,
    framebuffer: Option<FramebufferRecord>,
}

struct FramebufferRecord {
    desc: FramebufferDesc,
    accumulated: u32,
    pixels: Vec<u8>,
}

#[derive(Default)]
struct EngineState {
    next_id: AtomicU64,
    objects: Mutex<HashMap<u64, ObjectRecord>>,
    created: AtomicU64,
    released: AtomicU64,
    frames: AtomicU64,
    status: Mutex<Option<StatusCallback>>,
}

impl EngineState {
    fn report(&self, status: EngineStatus) {
        let callback = self.status.lock().ok().and_then(|cb| cb.clone());
        match callback {
            Some(cb) => cb(status),
            None => {
                if let EngineStatus::Error(message) = status {
                    log::error!("[engine] {message}");
                }
            }
        }
    }

    fn with_record<R>(&self, id: u64, f: impl FnOnce(&mut ObjectRecord) -> R) -> Option<R> {
        let mut objects = self.objects.lock().ok()?;
        objects.get_mut(&id).map(f)
    }
}

impl ReleaseSink for EngineState {
    fn release(&self, id: u64) {
        // Dropping a record drops the handles in its params, which re-enters
        // this function; the lock must not be held at that point.
        let removed = match self.objects.lock() {
            Ok(mut objects) => objects.remove(&id),
            Err(_) => None,
        };
        if removed.is_some() {
            self.released.fetch_add(1, Ordering::Relaxed);
        }
        drop(removed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineStats {
    pub live: usize,
    pub created: u64,
    pub released: u64,
    pub frames: u64,
}

pub struct SoftwareEngine {
    state: Arc<EngineState>,
    frame_time: Duration,
}

impl Default for SoftwareEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftwareEngine {
    pub fn new() -> Self {
        Self {
            state: Arc::new(EngineState::default()),
            frame_time: Duration::ZERO,
        }
    }

    /// Minimum wall time per frame; frames stay cancellable throughout.
    pub fn with_frame_time(mut self, frame_time: Duration) -> Self {
        self.frame_time = frame_time;
        self
    }

    pub fn stats(&self) -> EngineStats {
        let live = self.state.objects.lock().map(|o| o.len()).unwrap_or(0);
        EngineStats {
            live,
            created: self.state.created.load(Ordering::Relaxed),
            released: self.state.released.load(Ordering::Relaxed),
            frames: self.state.frames.load(Ordering::Relaxed),
        }
    }

    pub fn live_objects_of(&self, object_type: ObjectType) -> usize {
        self.state
            .objects
            .lock()
            .map(|o| o.values().filter(|r| r.object_type == object_type).count())
            .unwrap_or(0)
    }

    pub fn is_live(&self, handle_id: u64) -> bool {
        self.state
            .objects
            .lock()
            .map(|o| o.contains_key(&handle_id))
            .unwrap_or(false)
    }

    /// Number of frames accumulated into a framebuffer since its last reset.
    pub fn accumulated_frames(&self, framebuffer: &Handle) -> u32 {
        self.state
            .with_record(framebuffer.id(), |r| {
                r.framebuffer.as_ref().map(|fb| fb.accumulated).unwrap_or(0)
            })
            .unwrap_or(0)
    }

    pub fn commit_count(&self, object: &Handle) -> u32 {
        self.state
            .with_record(object.id(), |r| r.commits)
            .unwrap_or(0)
    }

    pub fn param(&self, object: &Handle, name: &str) -> Option<Param> {
        self.state
            .with_record(object.id(), |r| r.params.get(name).cloned())
            .flatten()
    }

    fn insert(&self, object_type: ObjectType, subtype: &str, fb: Option<FramebufferRecord>) -> Handle {
        let id = self.state.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let record = ObjectRecord {
            object_type,
            params: HashMap::new(),
            commits: 0,
            framebuffer: fb,
        };
        if let Ok(mut objects) = self.state.objects.lock() {
            objects.insert(id, record);
        }
        self.state.created.fetch_add(1, Ordering::Relaxed);
        let sink: Arc<dyn ReleaseSink> = self.state.clone();
        Handle::new(id, object_type, subtype, sink)
    }

    fn expect_type(&self, handle: &Handle, expected: ObjectType) -> Result<()> {
        if handle.object_type() != expected {
            bail!(
                "expected a {:?} object, got {:?}",
                expected,
                handle.object_type()
            );
        }
        Ok(())
    }

    fn snapshot_scene(&self, renderer: &Handle, world: &Handle) -> FrameScene {
        let background = match self.param(renderer, "bgColor") {
            Some(Param::Vec4f(c)) => c,
            _ => match self.param(renderer, "backplate") {
                Some(Param::Object(texture)) => match self.param(&texture, "data") {
                    Some(Param::Vec4fArray(texels)) => texels.first().copied().unwrap_or([0.0; 4]),
                    _ => [0.0, 0.0, 0.0, 1.0],
                },
                _ => [0.0, 0.0, 0.0, 1.0],
            },
        };
        let count = |name: &str| match self.param(world, name) {
            Some(Param::ObjectList(list)) => list.len(),
            _ => 0,
        };
        FrameScene {
            background,
            instances: count("instance"),
            lights: count("light"),
        }
    }

    fn geometry_bounds(objects: &HashMap<u64, ObjectRecord>, id: u64, out: &mut Bounds) {
        let Some(record) = objects.get(&id) else {
            return;
        };
        match record.object_type {
            ObjectType::GeometricModel => {
                if let Some(Param::Object(geometry)) = record.params.get("geometry") {
                    Self::geometry_bounds(objects, geometry.id(), out);
                }
            }
            ObjectType::VolumetricModel => {
                if let Some(Param::Object(volume)) = record.params.get("volume") {
                    Self::geometry_bounds(objects, volume.id(), out);
                }
            }
            ObjectType::Geometry => {
                if let Some(Param::Vec3fArray(positions)) = record.params.get("vertex.position") {
                    positions.iter().for_each(|p| out.extend(*p));
                }
                if let Some(Param::Vec3fArray(centers)) = record.params.get("sphere.position") {
                    let r = match record.params.get("radius") {
                        Some(Param::Float(r)) => *r,
                        _ => 0.01,
                    };
                    for c in centers {
                        out.extend([c[0] - r, c[1] - r, c[2] - r]);
                        out.extend([c[0] + r, c[1] + r, c[2] + r]);
                    }
                }
                if let Some(Param::FloatArray(boxes)) = record.params.get("box") {
                    for b in boxes.chunks_exact(6) {
                        out.extend([b[0], b[1], b[2]]);
                        out.extend([b[3], b[4], b[5]]);
                    }
                }
            }
            ObjectType::Volume => {
                let origin = match record.params.get("gridOrigin") {
                    Some(Param::Vec3f(o)) => *o,
                    _ => [0.0; 3],
                };
                let spacing = match record.params.get("gridSpacing") {
                    Some(Param::Vec3f(s)) => *s,
                    _ => [1.0; 3],
                };
                if let Some(Param::Voxels { dims, .. }) = record.params.get("data") {
                    out.extend(origin);
                    out.extend([
                        origin[0] + spacing[0] * dims[0].saturating_sub(1) as f32,
                        origin[1] + spacing[1] * dims[1].saturating_sub(1) as f32,
                        origin[2] + spacing[2] * dims[2].saturating_sub(1) as f32,
                    ]);
                }
            }
            _ => {}
        }
    }
}

impl RenderEngine for SoftwareEngine {
    fn name(&self) -> &str {
        "software"
    }

    fn create(&self, object_type: ObjectType, subtype: &str) -> Result<Handle> {
        match object_type {
            ObjectType::Renderer if !RENDERER_TYPES.contains(&subtype) => {
                bail!("unknown renderer type '{subtype}'")
            }
            ObjectType::FrameBuffer => bail!("framebuffers are created with new_framebuffer"),
            _ => Ok(self.insert(object_type, subtype, None)),
        }
    }

    fn set_param(&self, object: &Handle, name: &str, value: Param) {
        // The replaced value (possibly holding handles) drops after the lock.
        let previous = self
            .state
            .with_record(object.id(), |r| r.params.insert(name.to_string(), value));
        match previous {
            Some(old) => drop(old),
            None => self
                .state
                .report(EngineStatus::Error(format!("set_param '{name}' on unknown object {object:?}"))),
        }
    }

    fn remove_param(&self, object: &Handle, name: &str) {
        let previous = self.state.with_record(object.id(), |r| r.params.remove(name));
        drop(previous);
    }

    fn commit(&self, object: &Handle) {
        if self.state.with_record(object.id(), |r| r.commits += 1).is_none() {
            self.state
                .report(EngineStatus::Error(format!("commit on unknown object {object:?}")));
        }
    }

    fn new_framebuffer(&self, desc: FramebufferDesc) -> Result<Handle> {
        if desc.width == 0 || desc.height == 0 {
            bail!("framebuffer size {}x{} is empty", desc.width, desc.height);
        }
        let fb = FramebufferRecord {
            desc,
            accumulated: 0,
            pixels: vec![0u8; desc.byte_len()],
        };
        Ok(self.insert(ObjectType::FrameBuffer, "", Some(fb)))
    }

    fn reset_accumulation(&self, framebuffer: &Handle) {
        self.state.with_record(framebuffer.id(), |r| {
            if let Some(fb) = r.framebuffer.as_mut() {
                fb.accumulated = 0;
            }
        });
    }

    fn render_frame(
        &self,
        framebuffer: &Handle,
        renderer: &Handle,
        camera: &Handle,
        world: &Handle,
    ) -> Result<Box<dyn FrameTask>> {
        self.expect_type(framebuffer, ObjectType::FrameBuffer)?;
        self.expect_type(renderer, ObjectType::Renderer)?;
        self.expect_type(camera, ObjectType::Camera)?;
        self.expect_type(world, ObjectType::World)?;

        let scene = self.snapshot_scene(renderer, world);
        let (tx, rx) = crossbeam_channel::bounded(1);
        let cancel = Arc::new(AtomicBool::new(false));
        let state = self.state.clone();
        let frame_time = self.frame_time;
        let fb_id = framebuffer.id();
        let cancel_flag = cancel.clone();

        thread::Builder::new()
            .name("software-frame".to_string())
            .spawn(move || {
                let started = Instant::now();
                while started.elapsed() < frame_time && !cancel_flag.load(Ordering::Acquire) {
                    thread::sleep(CANCEL_POLL.min(frame_time.saturating_sub(started.elapsed())));
                }
                if cancel_flag.load(Ordering::Acquire) {
                    let _ = tx.send(FrameOutcome {
                        completed: false,
                        variance: f32::INFINITY,
                    });
                    return;
                }
                let variance = accumulate(&state, fb_id, &scene);
                state.frames.fetch_add(1, Ordering::Relaxed);
                let _ = tx.send(FrameOutcome {
                    completed: true,
                    variance,
                });
            })
            .map_err(|e| anyhow!("failed to spawn frame thread: {e}"))?;

        Ok(Box::new(SoftwareFrame {
            rx,
            outcome: Mutex::new(None),
            cancel,
        }))
    }

    fn read_pixels(&self, framebuffer: &Handle) -> Result<Vec<u8>> {
        self.state
            .with_record(framebuffer.id(), |r| r.framebuffer.as_ref().map(|fb| fb.pixels.clone()))
            .flatten()
            .ok_or_else(|| anyhow!("{framebuffer:?} is not a live framebuffer"))
    }

    fn bounds(&self, group: &Handle) -> Option<Bounds> {
        let objects = self.state.objects.lock().ok()?;
        let record = objects.get(&group.id())?;
        let mut out = Bounds::empty();
        for key in ["geometry", "volume"] {
            if let Some(Param::ObjectList(models)) = record.params.get(key) {
                for model in models {
                    Self::geometry_bounds(&objects, model.id(), &mut out);
                }
            }
        }
        (!out.is_empty()).then_some(out)
    }

    fn set_status_callback(&self, callback: StatusCallback) {
        if let Ok(mut slot) = self.state.status.lock() {
            *slot = Some(callback);
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct FrameOutcome {
    completed: bool,
    variance: f32,
}

struct SoftwareFrame {
    rx: Receiver<FrameOutcome>,
    outcome: Mutex<Option<FrameOutcome>>,
    cancel: Arc<AtomicBool>,
}

impl SoftwareFrame {
    fn finished(&self) -> Option<FrameOutcome> {
        let mut slot = self.outcome.lock().ok()?;
        if slot.is_none() {
            match self.rx.try_recv() {
                Ok(outcome) => *slot = Some(outcome),
                Err(TryRecvError::Disconnected) => {
                    *slot = Some(FrameOutcome {
                        completed: false,
                        variance: f32::INFINITY,
                    })
                }
                Err(TryRecvError::Empty) => {}
            }
        }
        *slot
    }
}

impl FrameTask for SoftwareFrame {
    fn is_ready(&self) -> bool {
        self.finished().is_some()
    }

    fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    fn wait(&self, timeout: Duration) -> bool {
        if self.finished().is_some() {
            return true;
        }
        let outcome = match self.rx.recv_timeout(timeout) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Disconnected) => FrameOutcome {
                completed: false,
                variance: f32::INFINITY,
            },
            Err(RecvTimeoutError::Timeout) => return false,
        };
        if let Ok(mut slot) = self.outcome.lock() {
            *slot = Some(outcome);
        }
        true
    }

    fn variance(&self) -> f32 {
        self.finished().map(|o| o.variance).unwrap_or(f32::INFINITY)
    }

    fn completed(&self) -> bool {
        self.finished().map(|o| o.completed).unwrap_or(false)
    }
}

struct FrameScene {
    background: [f32; 4],
    instances: usize,
    lights: usize,
}

fn accumulate(state: &EngineState, fb_id: u64, scene: &FrameScene) -> f32 {
    state
        .with_record(fb_id, |record| {
            let Some(fb) = record.framebuffer.as_mut() else {
                return f32::INFINITY;
            };
            fb.accumulated += 1;
            fb.pixels = shade(&fb.desc, scene);
            1.0 / fb.accumulated as f32
        })
        .unwrap_or(f32::INFINITY)
}

fn shade(desc: &FramebufferDesc, scene: &FrameScene) -> Vec<u8> {
    let (w, h) = (desc.width as usize, desc.height as usize);
    let tint = (scene.instances % 8) as f32 / 7.0;
    let light = if scene.lights > 0 { 1.0 } else { 0.5 };
    let mut colors = Vec::with_capacity(w * h);
    for y in 0..h {
        for x in 0..w {
            let checker = (x * 8 / w.max(1) + y * 8 / h.max(1)) % 2 == 0;
            let c = if scene.instances > 0 && checker {
                [
                    light * x as f32 / w as f32,
                    light * y as f32 / h as f32,
                    light * tint,
                    1.0,
                ]
            } else {
                scene.background
            };
            colors.push(c);
        }
    }
    match desc.format {
        FramebufferFormat::Rgba32f => bytemuck::cast_slice::<[f32; 4], u8>(&colors).to_vec(),
        FramebufferFormat::Srgba => colors
            .iter()
            .flat_map(|c| [srgb8(c[0]), srgb8(c[1]), srgb8(c[2]), unorm8(c[3])])
            .collect(),
    }
}

fn unorm8(v: f32) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0 + 0.5) as u8
}

fn srgb8(linear: f32) -> u8 {
    let l = linear.clamp(0.0, 1.0);
    let s = if l <= 0.003_130_8 {
        l * 12.92
    } else {
        1.055 * l.powf(1.0 / 2.4) - 0.055
    };
    unorm8(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(format: FramebufferFormat) -> FramebufferDesc {
        FramebufferDesc {
            width: 4,
            height: 2,
            format,
            accumulation: true,
            variance: true,
        }
    }

    #[test]
    fn dropping_last_handle_releases_object_and_its_references() {
        let engine = SoftwareEngine::new();
        let geometry = engine.create(ObjectType::Geometry, "mesh").unwrap();
        let model = engine.create(ObjectType::GeometricModel, "").unwrap();
        engine.set_param(&model, "geometry", Param::Object(geometry.clone()));
        assert_eq!(engine.stats().live, 2);

        drop(geometry);
        // still referenced by the model
        assert_eq!(engine.stats().live, 2);
        drop(model);
        assert_eq!(engine.stats().live, 0);
        assert_eq!(engine.stats().released, 2);
    }

    #[test]
    fn unknown_renderer_type_is_rejected() {
        let engine = SoftwareEngine::new();
        assert!(engine.create(ObjectType::Renderer, "scivis").is_ok());
        assert!(engine.create(ObjectType::Renderer, "raymarcher").is_err());
    }

    #[test]
    fn frames_accumulate_until_reset() {
        let engine = SoftwareEngine::new();
        let fb = engine.new_framebuffer(desc(FramebufferFormat::Srgba)).unwrap();
        let renderer = engine.create(ObjectType::Renderer, "scivis").unwrap();
        let camera = engine.create(ObjectType::Camera, "perspective").unwrap();
        let world = engine.create(ObjectType::World, "").unwrap();

        for expected in 1..=3u32 {
            let task = engine.render_frame(&fb, &renderer, &camera, &world).unwrap();
            assert!(task.wait(Duration::from_secs(5)));
            assert!(task.completed());
            assert_eq!(task.variance(), 1.0 / expected as f32);
        }
        assert_eq!(engine.accumulated_frames(&fb), 3);
        engine.reset_accumulation(&fb);
        assert_eq!(engine.accumulated_frames(&fb), 0);
        assert_eq!(engine.read_pixels(&fb).unwrap().len(), 4 * 2 * 4);
    }

    #[test]
    fn cancelled_frame_does_not_accumulate() {
        let engine = SoftwareEngine::new().with_frame_time(Duration::from_secs(30));
        let fb = engine.new_framebuffer(desc(FramebufferFormat::Rgba32f)).unwrap();
        let renderer = engine.create(ObjectType::Renderer, "pathtracer").unwrap();
        let camera = engine.create(ObjectType::Camera, "perspective").unwrap();
        let world = engine.create(ObjectType::World, "").unwrap();

        let task = engine.render_frame(&fb, &renderer, &camera, &world).unwrap();
        assert!(!task.is_ready());
        task.cancel();
        assert!(task.wait(Duration::from_secs(5)));
        assert!(!task.completed());
        assert_eq!(engine.accumulated_frames(&fb), 0);
    }

    #[test]
    fn group_bounds_cover_triangle_vertices() {
        let engine = SoftwareEngine::new();
        let geometry = engine.create(ObjectType::Geometry, "mesh").unwrap();
        engine.set_param(
            &geometry,
            "vertex.position",
            Param::Vec3fArray(vec![[-1.0, 0.0, 0.0], [2.0, 3.0, 0.5]]),
        );
        let model = engine.create(ObjectType::GeometricModel, "").unwrap();
        engine.set_param(&model, "geometry", Param::Object(geometry));
        let group = engine.create(ObjectType::Group, "").unwrap();
        engine.set_param(&group, "geometry", Param::ObjectList(vec![model]));

        let b = engine.bounds(&group).unwrap();
        assert_eq!(b.lower, [-1.0, 0.0, 0.0]);
        assert_eq!(b.upper, [2.0, 3.0, 0.5]);
    }

    #[test]
    fn set_param_on_released_object_reports_error() {
        let engine = SoftwareEngine::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        engine.set_status_callback(Arc::new(move |s| sink.lock().unwrap().push(s)));

        let a = engine.create(ObjectType::Light, "sphere").unwrap();
        let stale = Handle::new(a.id() + 100, ObjectType::Light, "sphere", engine.state.clone());
        engine.set_param(&stale, "intensity", Param::Float(1.0));
        assert!(matches!(seen.lock().unwrap()[0], EngineStatus::Error(_)));
    }
}
