//! Progressive rendering: framebuffer pyramid, the render state machine and
//! frame output.

pub mod output;
pub mod pyramid;
pub mod scheduler;

use crate::engine::Handle;

pub use pyramid::{FramebufferPyramid, FramebufferSpec};
pub use scheduler::{Bulk, RenderEvent, RenderRequest, RenderScheduler, RenderState};

/// Everything a frame needs, captured when a run starts.
#[derive(Debug, Clone)]
pub struct RenderInputs {
    pub renderer: Handle,
    pub camera: Handle,
    pub world: Handle,
    pub instance_count: usize,
    pub light_count: usize,
}
