//! The render state machine.
//!
//! ```text
//! IDLE --start(FINAL)--> FINAL --last sample / cancel--> IDLE
//! IDLE --start(INTERACTIVE)--> INTERACTIVE --last sample / cancel--> IDLE
//! ```
//!
//! One frame is in flight at a time. The connection loop polls the scheduler
//! every tick; results are queued as [`RenderEvent`]s and drained by the
//! caller. An interactive run starts at the coarsest reduction factor and
//! halves it after every frame (resetting accumulation) until it reaches full
//! resolution, then accumulates samples there. A cancel request is honoured
//! on the next poll and produces exactly one `CANCELED`.

use std::{
    collections::VecDeque,
    path::PathBuf,
    time::{Duration, Instant},
};

use anyhow::{Context, Result, bail};
use serde::Serialize;

use super::{
    FramebufferPyramid, FramebufferSpec, RenderInputs,
    output::{memory_usage_mib, write_frame_image},
};
use crate::{
    engine::{FrameTask, RenderEngine},
    protocol::{DoneResult, FrameResult, RenderMode, ServerMessage},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RenderState {
    Idle,
    Final,
    Interactive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderRequest {
    pub mode: RenderMode,
    pub samples: u32,
    pub reduction_ceiling: u32,
}

/// Raw bytes that follow an event's record on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Bulk {
    Pixels(Vec<u8>),
    /// An encoded image on disk, streamed and then (usually) deleted.
    File(PathBuf),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderEvent {
    pub message: ServerMessage,
    pub bulk: Option<Bulk>,
}

impl RenderEvent {
    fn message(message: ServerMessage) -> Self {
        Self { message, bulk: None }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub cancel_timeout: Duration,
    pub framebuffer_dir: PathBuf,
}

struct ActiveRun {
    mode: RenderMode,
    samples: u32,
    sample: u32,
    factor: u32,
    inputs: RenderInputs,
    task: Box<dyn FrameTask>,
    frame_started: Instant,
}

pub struct RenderScheduler {
    config: SchedulerConfig,
    run: Option<ActiveRun>,
    pyramid: Option<FramebufferPyramid>,
    cancel_requested: bool,
    events: VecDeque<RenderEvent>,
    peak_memory: f32,
}

impl RenderScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            run: None,
            pyramid: None,
            cancel_requested: false,
            events: VecDeque::new(),
            peak_memory: 0.0,
        }
    }

    pub fn state(&self) -> RenderState {
        match self.run.as_ref().map(|r| r.mode) {
            None => RenderState::Idle,
            Some(RenderMode::Final) => RenderState::Final,
            Some(RenderMode::Interactive) => RenderState::Interactive,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.run.is_none()
    }

    /// Current `(sample, reduction factor)` of the active run.
    pub fn progress(&self) -> Option<(u32, u32)> {
        self.run.as_ref().map(|r| (r.sample, r.factor))
    }

    pub fn start(
        &mut self,
        engine: &dyn RenderEngine,
        request: RenderRequest,
        spec: FramebufferSpec,
        inputs: RenderInputs,
    ) -> Result<()> {
        if !self.is_idle() {
            bail!("a {:?} render is already in progress", self.state());
        }
        self.cancel_requested = false;

        if request.samples == 0 {
            log::info!("[render] zero samples requested, nothing to do");
            self.push_done(0.0);
            return Ok(());
        }

        let ceiling = match request.mode {
            RenderMode::Final => 1,
            RenderMode::Interactive => request.reduction_ceiling.max(1),
        };
        if !self.pyramid.as_ref().is_some_and(|p| p.matches(&spec, ceiling)) {
            self.pyramid = None;
            self.pyramid = Some(FramebufferPyramid::build(engine, spec, ceiling)?);
        }

        let task = self.submit(engine, ceiling, &inputs, true)?;
        log::info!(
            "[render] {:?} run started: {} sample(s), {}x{}, factor {ceiling}",
            request.mode,
            request.samples,
            spec.width,
            spec.height
        );
        self.run = Some(ActiveRun {
            mode: request.mode,
            samples: request.samples,
            sample: 1,
            factor: ceiling,
            inputs,
            task,
            frame_started: Instant::now(),
        });
        Ok(())
    }

    /// Marks the active run for cancellation; takes effect on the next poll.
    pub fn request_cancel(&mut self) -> bool {
        if self.is_idle() {
            return false;
        }
        self.cancel_requested = true;
        true
    }

    /// Cancels any active run right away. Returns whether one was running.
    pub fn force_idle(&mut self, engine: &dyn RenderEngine) -> bool {
        if self.is_idle() {
            return false;
        }
        self.cancel_run(engine);
        true
    }

    pub fn poll(&mut self, engine: &dyn RenderEngine) {
        let Some(run) = self.run.as_ref() else {
            return;
        };
        if self.cancel_requested {
            self.cancel_run(engine);
            return;
        }
        if !run.task.is_ready() {
            return;
        }
        if let Err(e) = self.complete_frame(engine) {
            log::error!("[render] frame failed: {e:#}");
            self.events
                .push_back(RenderEvent::message(ServerMessage::error("RENDER_FAILED", format!("{e:#}"))));
            self.cancel_run(engine);
        }
    }

    pub fn pop_event(&mut self) -> Option<RenderEvent> {
        self.events.pop_front()
    }

    pub fn drain_events(&mut self) -> Vec<RenderEvent> {
        self.events.drain(..).collect()
    }

    fn submit(
        &self,
        engine: &dyn RenderEngine,
        factor: u32,
        inputs: &RenderInputs,
        reset: bool,
    ) -> Result<Box<dyn FrameTask>> {
        let pyramid = self.pyramid.as_ref().context("framebuffer pyramid missing")?;
        let level = pyramid.level(factor)?;
        if reset {
            engine.reset_accumulation(&level.framebuffer);
        }
        engine.render_frame(&level.framebuffer, &inputs.renderer, &inputs.camera, &inputs.world)
    }

    fn complete_frame(&mut self, engine: &dyn RenderEngine) -> Result<()> {
        let Some(run) = self.run.as_ref() else {
            return Ok(());
        };
        if !run.task.completed() {
            bail!("engine stopped frame {} early", run.sample);
        }

        let variance = run.task.variance();
        let render_time = run.frame_started.elapsed().as_secs_f32();
        let memory = memory_usage_mib();
        self.peak_memory = self.peak_memory.max(memory);

        let pyramid = self.pyramid.as_ref().context("framebuffer pyramid missing")?;
        let level = pyramid.level(run.factor)?;
        let pixels = engine.read_pixels(&level.framebuffer)?;

        let mut frame = FrameResult {
            sample: run.sample,
            reduction_factor: run.factor,
            width: level.width,
            height: level.height,
            variance,
            render_time,
            memory_usage: memory,
            peak_memory_usage: self.peak_memory,
            pixels_size: None,
            file_name: None,
            file_size: None,
        };
        let bulk = match run.mode {
            RenderMode::Interactive => {
                frame.pixels_size = Some(pixels.len() as u64);
                Bulk::Pixels(pixels)
            }
            RenderMode::Final => {
                let (path, size) = write_frame_image(
                    &self.config.framebuffer_dir,
                    run.sample,
                    level.width,
                    level.height,
                    pyramid.spec().format,
                    pixels,
                )?;
                frame.file_name = path.file_name().map(|n| n.to_string_lossy().into_owned());
                frame.file_size = Some(size);
                Bulk::File(path)
            }
        };
        log::debug!(
            "[render] frame sample {} factor {} in {:.3}s, variance {:.4}",
            frame.sample,
            frame.reduction_factor,
            frame.render_time,
            frame.variance
        );
        self.events.push_back(RenderEvent {
            message: ServerMessage::Frame(frame),
            bulk: Some(bulk),
        });

        let (next_factor, next_sample, reset) = if run.factor > 1 {
            ((run.factor / 2).max(1), run.sample, true)
        } else if run.sample < run.samples {
            (1, run.sample + 1, false)
        } else {
            log::info!("[render] run finished after {} sample(s)", run.sample);
            self.run = None;
            self.push_done(variance);
            return Ok(());
        };

        let task = self.submit(engine, next_factor, &run.inputs, reset)?;
        if let Some(run) = self.run.as_mut() {
            run.factor = next_factor;
            run.sample = next_sample;
            run.task = task;
            run.frame_started = Instant::now();
        }
        Ok(())
    }

    fn cancel_run(&mut self, engine: &dyn RenderEngine) {
        self.cancel_requested = false;
        let Some(run) = self.run.take() else {
            return;
        };
        run.task.cancel();
        if !run.task.wait(self.config.cancel_timeout) {
            log::warn!(
                "[render] frame did not stop within {:?}, abandoning it",
                self.config.cancel_timeout
            );
        }
        let factor = run.factor;
        drop(run);

        // A cancelled frame can leave its buffer in a bad state.
        if let Some(pyramid) = self.pyramid.as_mut() {
            if let Err(e) = pyramid.recreate(engine, factor) {
                log::warn!("[render] failed to recreate framebuffer: {e:#}");
                self.pyramid = None;
            }
        }
        log::info!("[render] run canceled");
        self.events.push_back(RenderEvent::message(ServerMessage::Canceled));
    }

    fn push_done(&mut self, variance: f32) {
        let memory = memory_usage_mib();
        self.peak_memory = self.peak_memory.max(memory);
        self.events.push_back(RenderEvent::message(ServerMessage::Done(DoneResult {
            variance,
            memory_usage: memory,
            peak_memory_usage: self.peak_memory,
        })));
    }
}
