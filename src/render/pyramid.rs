use std::collections::BTreeMap;

use anyhow::{Result, anyhow};

use crate::{
    engine::{FramebufferDesc, Handle, RenderEngine},
    protocol::FramebufferFormat,
};

/// Full-resolution output configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramebufferSpec {
    pub format: FramebufferFormat,
    pub width: u32,
    pub height: u32,
}

/// Reduction factors visited by an interactive run: `ceiling`, halving down
/// to 1. A ceiling that is not a power of two still ends at 1.
pub fn reduction_chain(ceiling: u32) -> Vec<u32> {
    let mut factor = ceiling.max(1);
    let mut chain = vec![factor];
    while factor > 1 {
        factor /= 2;
        chain.push(factor.max(1));
    }
    chain.dedup();
    chain
}

#[derive(Debug)]
pub struct Level {
    pub factor: u32,
    pub width: u32,
    pub height: u32,
    pub framebuffer: Handle,
}

/// One framebuffer per reduction factor, all for the same target.
#[derive(Debug)]
pub struct FramebufferPyramid {
    spec: FramebufferSpec,
    ceiling: u32,
    levels: BTreeMap<u32, Level>,
}

impl FramebufferPyramid {
    pub fn build(engine: &dyn RenderEngine, spec: FramebufferSpec, ceiling: u32) -> Result<Self> {
        let mut levels = BTreeMap::new();
        for factor in reduction_chain(ceiling) {
            levels.insert(factor, create_level(engine, &spec, factor)?);
        }
        log::debug!(
            "[render] framebuffer pyramid {}x{} {:?}, factors {:?}",
            spec.width,
            spec.height,
            spec.format,
            levels.keys().collect::<Vec<_>>()
        );
        Ok(Self {
            spec,
            ceiling: ceiling.max(1),
            levels,
        })
    }

    pub fn matches(&self, spec: &FramebufferSpec, ceiling: u32) -> bool {
        self.spec == *spec && self.ceiling == ceiling.max(1)
    }

    pub fn spec(&self) -> FramebufferSpec {
        self.spec
    }

    pub fn level(&self, factor: u32) -> Result<&Level> {
        self.levels
            .get(&factor)
            .ok_or_else(|| anyhow!("no framebuffer for reduction factor {factor}"))
    }

    /// Swaps in a fresh buffer for one level. Used after a cancelled frame,
    /// whose buffer contents are unreliable.
    pub fn recreate(&mut self, engine: &dyn RenderEngine, factor: u32) -> Result<()> {
        let level = create_level(engine, &self.spec, factor)?;
        self.levels.insert(factor, level);
        Ok(())
    }
}

fn create_level(engine: &dyn RenderEngine, spec: &FramebufferSpec, factor: u32) -> Result<Level> {
    let width = (spec.width / factor).max(1);
    let height = (spec.height / factor).max(1);
    let framebuffer = engine.new_framebuffer(FramebufferDesc {
        width,
        height,
        format: spec.format,
        accumulation: true,
        variance: true,
    })?;
    Ok(Level {
        factor,
        width,
        height,
        framebuffer,
    })
}
